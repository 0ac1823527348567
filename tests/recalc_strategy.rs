//! Recalc strategy scenarios driven against mock collaborators.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use common::{start_dataplane, start_gateway, MockFunction, OverlayStub, ProxyState};
use faasmesh_agent::messages::Message;
use faasmesh_agent::overlay::NodeId;
use faasmesh_agent::peers::PeerTable;
use faasmesh_agent::proxy::DataPlaneClient;
use faasmesh_agent::strategy::{RecalcStrategy, StrategySettings};
use faasmesh_agent::telemetry::{GatewayClient, PromClient, StickTableReader};

const PERIOD: Duration = Duration::from_millis(200);

struct Harness {
    strategy: Arc<RecalcStrategy>,
    overlay: OverlayStub,
    proxy: ProxyState,
    shutdown: broadcast::Sender<()>,
}

async fn harness(functions: Vec<MockFunction>) -> Harness {
    let (gateway_addr, _) = start_gateway(functions).await;
    let proxy = ProxyState::default();
    let dataplane_addr = start_dataplane(proxy.clone()).await;
    let overlay = OverlayStub::new("QmSelf");

    let settings = StrategySettings {
        period: PERIOD,
        advertised_host: "192.0.2.10".into(),
        advertised_port: 80,
        gateway_host: "10.0.0.2".into(),
        gateway_port: 8080,
    };

    let strategy = Arc::new(RecalcStrategy::new(
        overlay.handle.clone(),
        PeerTable::new(Duration::from_secs(60)),
        GatewayClient::new(
            format!("http://{gateway_addr}"),
            "admin".into(),
            "admin".into(),
        ),
        StickTableReader::new(
            format!("http://{dataplane_addr}"),
            "admin".into(),
            "admin".into(),
        ),
        // Nothing listens here: aggregate metrics degrade to a warning.
        PromClient::new("http://127.0.0.1:9".into()),
        DataPlaneClient::new(
            format!("http://{dataplane_addr}"),
            "admin".into(),
            "admin".into(),
        ),
        settings,
    ));

    let (shutdown, _) = broadcast::channel(1);
    Harness {
        strategy,
        overlay,
        proxy,
        shutdown,
    }
}

fn spawn_run(harness: &Harness) {
    let strategy = Arc::clone(&harness.strategy);
    let rx = harness.shutdown.subscribe();
    tokio::spawn(async move {
        let _ = strategy.run(rx).await;
    });
}

fn advertisement_from(limits_for_us: &[(&str, f64)]) -> Message {
    Message::NodeInfoRecalc {
        proxy_host: "192.0.2.2".into(),
        proxy_port: 80,
        func_limits: HashMap::from([(
            NodeId::from("QmSelf"),
            limits_for_us
                .iter()
                .map(|(f, l)| (f.to_string(), *l))
                .collect(),
        )]),
    }
}

/// Solo node, no load: full limit, no peer stanzas, no weights.
#[tokio::test]
async fn test_solo_node_serves_everything_locally() {
    let h = harness(vec![MockFunction::new("figlet", 100)]).await;
    spawn_run(&h);

    let config = h.proxy.wait_for_config(|c| c.contains("be_figlet")).await;
    assert!(config.contains("server local 10.0.0.2:8080 weight 100"));
    assert!(config.contains("sc1_http_req_rate(st_local_func_figlet) gt 100"));
    assert!(!config.contains("server Qm"));

    // The advertisement goes out even with nobody to hear it.
    let message = h
        .overlay
        .wait_for_message(|m| matches!(m, Message::NodeInfoRecalc { .. }))
        .await;
    let Message::NodeInfoRecalc { func_limits, .. } = message else {
        unreachable!()
    };
    assert!(func_limits.is_empty());

    let _ = h.shutdown.send(());
}

/// Two-node handshake: our margin becomes the peer's granted limit, and the
/// peer's advertisement becomes our LimitOut.
#[tokio::test]
async fn test_two_node_handshake_splits_margin() {
    let h = harness(vec![MockFunction::new("figlet", 100)]).await;
    h.overlay.set_peers(&["QmB"]);

    // The peer told us it grants us 60 req/s; this seeds its table entry.
    h.strategy
        .on_received(&NodeId::from("QmB"), advertisement_from(&[("figlet", 60.0)]))
        .unwrap();

    // 20 requests observed; the halved-window correction doubles the rate.
    h.proxy
        .set_table("st_users_func_figlet", vec![("80", 20, 20)]);

    spawn_run(&h);

    let message = h
        .overlay
        .wait_for_message(|m| matches!(m, Message::NodeInfoRecalc { func_limits, .. } if !func_limits.is_empty()))
        .await;
    let Message::NodeInfoRecalc { func_limits, .. } = message else {
        unreachable!()
    };

    // margin = 100 - 40 = 60, one holder.
    assert_eq!(func_limits[&NodeId::from("QmB")]["figlet"], 60.0);

    // LimitOut reconstructed from the peer's advertisement.
    let limit_out = h.strategy.table().with_entries(|entries| {
        entries[&NodeId::from("QmB")].funcs["figlet"].limit_out
    });
    assert_eq!(limit_out, 60.0);

    // Nothing is overloaded, so phase 2 leaves every peer weight at zero.
    let config = h.proxy.wait_for_config(|c| c.contains("server QmB")).await;
    assert!(config.contains("server QmB 192.0.2.2:80 weight 0"));
    assert!(config.contains("server local 10.0.0.2:8080 weight 100"));

    let _ = h.shutdown.send(());
}

/// Overload: admission closes and the excess is weighted toward the peer.
#[tokio::test]
async fn test_overload_redistributes_to_peer() {
    let h = harness(vec![MockFunction::new("figlet", 100)]).await;
    h.overlay.set_peers(&["QmB"]);
    h.strategy
        .on_received(&NodeId::from("QmB"), advertisement_from(&[("figlet", 60.0)]))
        .unwrap();

    // 80 requests → smoothed rate 160 ≥ 100: overloaded.
    h.proxy
        .set_table("st_users_func_figlet", vec![("80", 80, 80)]);

    spawn_run(&h);

    let message = h
        .overlay
        .wait_for_message(|m| matches!(m, Message::NodeInfoRecalc { func_limits, .. } if !func_limits.is_empty()))
        .await;
    let Message::NodeInfoRecalc { func_limits, .. } = message else {
        unreachable!()
    };
    assert_eq!(func_limits[&NodeId::from("QmB")]["figlet"], 0.0);

    // weight = round(60 × 100 / 60) = 100.
    let config = h
        .proxy
        .wait_for_config(|c| c.contains("server QmB 192.0.2.2:80 weight 100"))
        .await;
    assert!(config.contains("server local 10.0.0.2:8080 weight 0"));

    let _ = h.shutdown.send(());
}

/// Receiving the same advertisement twice changes nothing.
#[tokio::test]
async fn test_duplicate_advertisement_is_idempotent() {
    let h = harness(vec![MockFunction::new("figlet", 100)]).await;
    let advertisement = advertisement_from(&[("figlet", 60.0), ("shasum", 10.0)]);

    h.strategy
        .on_received(&NodeId::from("QmB"), advertisement.clone())
        .unwrap();
    let first = h
        .strategy
        .table()
        .with_entries(|entries| entries[&NodeId::from("QmB")].funcs.clone());

    h.strategy
        .on_received(&NodeId::from("QmB"), advertisement)
        .unwrap();
    let second = h
        .strategy
        .table()
        .with_entries(|entries| entries[&NodeId::from("QmB")].funcs.clone());

    assert_eq!(first, second);
}

/// A sender that does not mention us is ignored entirely.
#[tokio::test]
async fn test_advertisement_not_addressed_to_us_is_ignored() {
    let h = harness(vec![MockFunction::new("figlet", 100)]).await;

    let message = Message::NodeInfoRecalc {
        proxy_host: "192.0.2.2".into(),
        proxy_port: 80,
        func_limits: HashMap::from([(
            NodeId::from("QmSomeoneElse"),
            HashMap::from([("figlet".to_string(), 60.0)]),
        )]),
    };
    h.strategy
        .on_received(&NodeId::from("QmB"), message)
        .unwrap();

    let is_empty = h.strategy.table().with_entries(|entries| entries.is_empty());
    assert!(is_empty);
}
