//! Node-margin strategy scenarios driven against mock collaborators.

mod common;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use common::{
    start_dataplane, start_forecaster, start_gateway, ForecastModel, MockFunction, OverlayStub,
    ProxyState,
};
use faasmesh_agent::messages::Message;
use faasmesh_agent::overlay::NodeId;
use faasmesh_agent::peers::PeerTable;
use faasmesh_agent::proxy::DataPlaneClient;
use faasmesh_agent::strategy::{NodeMarginStrategy, StrategySettings};
use faasmesh_agent::telemetry::{
    ForecasterClient, GatewayClient, GroupsLoad, NodeMetrics, PromClient, StickTableReader,
};

const PERIOD: Duration = Duration::from_millis(200);

struct Harness {
    strategy: Arc<NodeMarginStrategy>,
    overlay: OverlayStub,
    proxy: ProxyState,
    shutdown: broadcast::Sender<()>,
    _groups_file: tempfile::NamedTempFile,
}

async fn harness(functions: Vec<MockFunction>, model: ForecastModel) -> Harness {
    let (gateway_addr, _) = start_gateway(functions).await;
    let proxy = ProxyState::default();
    let dataplane_addr = start_dataplane(proxy.clone()).await;
    let forecaster_addr = start_forecaster(model).await;
    let overlay = OverlayStub::new("QmSelf");

    let mut groups_file = tempfile::NamedTempFile::new().unwrap();
    write!(
        groups_file,
        r#"{{"HIGH_USAGE": ["figlet"], "MEDIUM_USAGE": [], "LOW_USAGE": ["shasum"]}}"#
    )
    .unwrap();

    let settings = StrategySettings {
        period: PERIOD,
        advertised_host: "192.0.2.10".into(),
        advertised_port: 80,
        gateway_host: "10.0.0.2".into(),
        gateway_port: 8080,
    };

    let strategy = Arc::new(NodeMarginStrategy::new(
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
        ForecasterClient::new(format!("http://{forecaster_addr}")),
        DataPlaneClient::new(
            format!("http://{dataplane_addr}"),
            "admin".into(),
            "admin".into(),
        ),
        settings,
        0,
        NodeMetrics {
            cpu: 80.0,
            ram: 80.0,
            power: 80.0,
        },
        groups_file.path().to_path_buf(),
    ));

    let (shutdown, _) = broadcast::channel(1);
    Harness {
        strategy,
        overlay,
        proxy,
        shutdown,
        _groups_file: groups_file,
    }
}

fn spawn_run(harness: &Harness) {
    let strategy = Arc::clone(&harness.strategy);
    let rx = harness.shutdown.subscribe();
    tokio::spawn(async move {
        let _ = strategy.run(rx).await;
    });
}

fn peer_node_info(functions: &[&str]) -> Message {
    Message::NodeInfoNms {
        proxy_host: "192.0.2.2".into(),
        proxy_port: 80,
        node_type: 1,
        max_values: HashMap::from([
            ("cpu_usage_node".to_string(), 80.0),
            ("ram_usage_node".to_string(), 80.0),
            ("power_usage_node".to_string(), 80.0),
        ]),
        functions: functions.iter().map(|f| f.to_string()).collect(),
    }
}

/// Margin propagation: forecast 70/80 on every metric and two common
/// neighbours give margin (100 − 87.5) / 2 = 6.25, published with the load.
#[tokio::test]
async fn test_margin_published_to_common_neighbours() {
    let h = harness(
        vec![MockFunction::new("figlet", 100)],
        ForecastModel {
            base: 70.0,
            per_unit: 0.0,
        },
    )
    .await;

    h.strategy
        .on_received(&NodeId::from("QmA"), peer_node_info(&["figlet"]))
        .unwrap();
    h.strategy
        .on_received(&NodeId::from("QmB"), peer_node_info(&["figlet", "shasum"]))
        .unwrap();
    h.proxy
        .set_table("st_users_func_figlet", vec![("80", 10, 10)]);

    spawn_run(&h);

    let message = h
        .overlay
        .wait_for_message(|m| matches!(m, Message::NodeMarginInfoNms { .. }))
        .await;
    let Message::NodeMarginInfoNms { margin, load } = message else {
        unreachable!()
    };
    assert!((margin - 6.25).abs() < 1e-9, "margin was {margin}");
    assert_eq!(
        load,
        GroupsLoad {
            high: 10.0,
            low: 0.0,
            medium: 0.0
        }
    );

    let _ = h.shutdown.send(());
}

/// Without common neighbours the margin is zero and never published.
#[tokio::test]
async fn test_no_common_neighbours_publishes_no_margin() {
    let h = harness(
        vec![MockFunction::new("figlet", 100)],
        ForecastModel {
            base: 70.0,
            per_unit: 0.0,
        },
    )
    .await;

    spawn_run(&h);

    // Wait until at least one full tick produced a node-info message.
    h.overlay
        .wait_for_message(|m| matches!(m, Message::NodeInfoNms { .. }))
        .await;
    tokio::time::sleep(PERIOD * 2).await;

    let published = h.overlay.published_messages();
    assert!(published
        .iter()
        .all(|m| !matches!(m, Message::NodeMarginInfoNms { .. })));

    // Everything stays local.
    let config = h.proxy.wait_for_config(|c| c.contains("be_figlet")).await;
    assert!(config.contains("server local 10.0.0.2:8080 weight 100"));

    let _ = h.shutdown.send(());
}

/// The node-info advertisement carries our identity and thresholds.
#[tokio::test]
async fn test_node_info_advertisement_content() {
    let h = harness(
        vec![MockFunction::new("figlet", 100)],
        ForecastModel {
            base: 10.0,
            per_unit: 0.0,
        },
    )
    .await;

    spawn_run(&h);

    let message = h
        .overlay
        .wait_for_message(|m| matches!(m, Message::NodeInfoNms { .. }))
        .await;
    let Message::NodeInfoNms {
        proxy_host,
        proxy_port,
        node_type,
        max_values,
        functions,
    } = message
    else {
        unreachable!()
    };
    assert_eq!(proxy_host, "192.0.2.10");
    assert_eq!(proxy_port, 80);
    assert_eq!(node_type, 0);
    assert_eq!(max_values["cpu_usage_node"], 80.0);
    assert_eq!(functions, vec!["figlet".to_string()]);

    let _ = h.shutdown.send(());
}

/// Overload shifts load toward a peer with margin until the peer's margin
/// is consumed; the installed weights reflect the kept/forwarded split.
#[tokio::test]
async fn test_overload_shifts_load_to_peer_with_margin() {
    // 1 unit of rate per forecast point: our 100 req/s forecast to 100,
    // well over the 80 threshold.
    let h = harness(
        vec![MockFunction::new("figlet", 100)],
        ForecastModel {
            base: 0.0,
            per_unit: 1.0,
        },
    )
    .await;

    h.strategy
        .on_received(&NodeId::from("QmA"), peer_node_info(&["figlet"]))
        .unwrap();
    h.proxy
        .set_table("st_users_func_figlet", vec![("80", 100, 100)]);

    spawn_run(&h);

    // Let the first tick complete (the configuration push is its last
    // step) so QmA is flagged common before its margin arrives.
    h.proxy.wait_for_config(|c| c.contains("be_figlet")).await;
    h.strategy
        .on_received(
            &NodeId::from("QmA"),
            Message::NodeMarginInfoNms {
                margin: 6.0,
                load: GroupsLoad::default(),
            },
        )
        .unwrap();

    // Eventually a configuration forwards part of figlet to QmA.
    let config = h
        .proxy
        .wait_for_config(|c| {
            c.lines().any(|line| {
                line.trim().starts_with("server QmA 192.0.2.2:80 weight ")
                    && !line.trim().ends_with("weight 0")
            })
        })
        .await;

    let peer_weight: u32 = config
        .lines()
        .find_map(|line| {
            line.trim()
                .strip_prefix("server QmA 192.0.2.2:80 weight ")
                .and_then(|w| w.parse().ok())
        })
        .unwrap();
    let local_weight: u32 = config
        .lines()
        .find_map(|line| {
            line.trim()
                .strip_prefix("server local 10.0.0.2:8080 weight ")
                .and_then(|w| w.parse().ok())
        })
        .unwrap();

    // The peer's 6% margin absorbs a handful of percent of our load.
    assert!(peer_weight > 0 && peer_weight <= 10, "peer weight {peer_weight}");
    assert!(local_weight >= 90, "local weight {local_weight}");
    assert!((95..=101).contains(&(peer_weight + local_weight)));

    let _ = h.shutdown.send(());
}

/// Margin messages from peers not flagged common are ignored.
#[tokio::test]
async fn test_margin_from_unknown_peer_is_ignored() {
    let h = harness(
        vec![MockFunction::new("figlet", 100)],
        ForecastModel {
            base: 10.0,
            per_unit: 0.0,
        },
    )
    .await;

    h.strategy
        .on_received(
            &NodeId::from("QmStranger"),
            Message::NodeMarginInfoNms {
                margin: 50.0,
                load: GroupsLoad::default(),
            },
        )
        .unwrap();

    let is_empty = h.strategy.table().with_entries(|entries| entries.is_empty());
    assert!(is_empty);
}
