//! All-local strategy: configuration is rewritten only on change.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use common::{start_dataplane, start_gateway, GatewayState, MockFunction, OverlayStub, ProxyState};
use faasmesh_agent::proxy::DataPlaneClient;
use faasmesh_agent::strategy::{AllLocalStrategy, StrategySettings};
use faasmesh_agent::telemetry::GatewayClient;

const PERIOD: Duration = Duration::from_millis(150);

struct Harness {
    strategy: Arc<AllLocalStrategy>,
    gateway_state: GatewayState,
    proxy: ProxyState,
    shutdown: broadcast::Sender<()>,
}

async fn harness(functions: Vec<MockFunction>) -> Harness {
    let (gateway_addr, gateway_state) = start_gateway(functions).await;
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

    let strategy = Arc::new(AllLocalStrategy::new(
        overlay.handle.clone(),
        GatewayClient::new(
            format!("http://{gateway_addr}"),
            "admin".into(),
            "admin".into(),
        ),
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
        gateway_state,
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

/// Unchanged function list: exactly one installation across many ticks.
#[tokio::test]
async fn test_stable_function_list_posts_once() {
    let h = harness(vec![
        MockFunction::new("f1", 100),
        MockFunction::new("f2", 100),
    ])
    .await;
    spawn_run(&h);

    h.proxy.wait_for_config(|c| c.contains("be_f1")).await;
    // Several more ticks pass without another installation.
    tokio::time::sleep(PERIOD * 4).await;
    assert_eq!(h.proxy.config_count(), 1);

    let _ = h.shutdown.send(());
}

/// A new function triggers exactly one more installation.
#[tokio::test]
async fn test_new_function_triggers_rewrite() {
    let h = harness(vec![
        MockFunction::new("f1", 100),
        MockFunction::new("f2", 100),
    ])
    .await;
    spawn_run(&h);

    h.proxy.wait_for_config(|c| c.contains("be_f2")).await;
    assert_eq!(h.proxy.config_count(), 1);

    h.gateway_state
        .lock()
        .unwrap()
        .push(MockFunction::new("f3", 100));

    let config = h.proxy.wait_for_config(|c| c.contains("be_f3")).await;
    assert!(config.contains("be_f1"));
    assert_eq!(h.proxy.config_count(), 2);

    tokio::time::sleep(PERIOD * 3).await;
    assert_eq!(h.proxy.config_count(), 2);

    let _ = h.shutdown.send(());
}

/// A timeout change alone also counts as a change.
#[tokio::test]
async fn test_timeout_change_triggers_rewrite() {
    let h = harness(vec![MockFunction {
        name: "f1".into(),
        max_rate: Some(100),
        timeout_ms: Some(1000),
    }])
    .await;
    spawn_run(&h);

    let config = h.proxy.wait_for_config(|c| c.contains("be_f1")).await;
    assert!(config.contains("timeout server 1000ms"));

    h.gateway_state.lock().unwrap()[0].timeout_ms = Some(2500);

    let config = h
        .proxy
        .wait_for_config(|c| c.contains("timeout server 2500ms"))
        .await;
    assert!(config.contains("be_f1"));

    let _ = h.shutdown.send(());
}
