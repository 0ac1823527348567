//! Shared mock collaborators for the strategy integration tests.
//!
//! Each strategy talks to a function gateway, the proxy's Data Plane API, a
//! forecaster and the overlay. The mocks here are small axum servers bound
//! to ephemeral ports plus an in-process overlay stub driven through the
//! same command channel the real swarm task uses.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use faasmesh_agent::messages::{self, Message};
use faasmesh_agent::overlay::{NodeId, OverlayCommand, OverlayHandle};

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// One function advertised by the mock gateway.
#[derive(Clone)]
pub struct MockFunction {
    pub name: String,
    pub max_rate: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl MockFunction {
    pub fn new(name: &str, max_rate: u32) -> Self {
        Self {
            name: name.to_string(),
            max_rate: Some(max_rate),
            timeout_ms: None,
        }
    }
}

pub type GatewayState = Arc<Mutex<Vec<MockFunction>>>;

/// Mock function gateway: `/system/functions` + `/healthz`.
pub async fn start_gateway(functions: Vec<MockFunction>) -> (SocketAddr, GatewayState) {
    let state: GatewayState = Arc::new(Mutex::new(functions));

    async fn list(State(state): State<GatewayState>) -> Json<Value> {
        let functions = state.lock().unwrap();
        let items: Vec<Value> = functions
            .iter()
            .map(|f| {
                let mut labels = serde_json::Map::new();
                if let Some(rate) = f.max_rate {
                    labels.insert("dfaas.maxrate".into(), rate.to_string().into());
                }
                if let Some(ms) = f.timeout_ms {
                    labels.insert("dfaas.timeout_ms".into(), ms.to_string().into());
                }
                json!({ "name": f.name, "labels": labels })
            })
            .collect();
        Json(Value::Array(items))
    }

    let app = Router::new()
        .route("/system/functions", get(list))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .with_state(state.clone());

    (serve(app).await, state)
}

/// Shared state of the mock proxy: stick tables plus every configuration
/// the agent installed.
#[derive(Clone, Default)]
pub struct ProxyState {
    /// Table name to rows of (key, http_req_cnt, http_req_rate).
    pub tables: Arc<Mutex<HashMap<String, Vec<(String, u64, u64)>>>>,
    pub configs: Arc<Mutex<Vec<String>>>,
}

impl ProxyState {
    pub fn set_table(&self, name: &str, rows: Vec<(&str, u64, u64)>) {
        self.tables.lock().unwrap().insert(
            name.to_string(),
            rows.into_iter()
                .map(|(k, c, r)| (k.to_string(), c, r))
                .collect(),
        );
    }

    pub fn config_count(&self) -> usize {
        self.configs.lock().unwrap().len()
    }

    pub fn last_config(&self) -> Option<String> {
        self.configs.lock().unwrap().last().cloned()
    }

    /// Poll until an installed configuration satisfies `predicate`.
    pub async fn wait_for_config(&self, predicate: impl Fn(&str) -> bool) -> String {
        for _ in 0..150 {
            if let Some(config) = self
                .configs
                .lock()
                .unwrap()
                .iter()
                .find(|c| predicate(c.as_str()))
                .cloned()
            {
                return config;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no installed configuration matched the predicate");
    }
}

/// Mock Data Plane API: runtime stick tables + raw configuration POST.
pub async fn start_dataplane(state: ProxyState) -> SocketAddr {
    async fn list_tables(State(state): State<ProxyState>) -> Json<Value> {
        let tables = state.tables.lock().unwrap();
        let items: Vec<Value> = tables.keys().map(|name| json!({ "name": name })).collect();
        Json(Value::Array(items))
    }

    async fn table_entries(
        State(state): State<ProxyState>,
        Path(name): Path<String>,
    ) -> Json<Value> {
        let tables = state.tables.lock().unwrap();
        let rows = tables.get(&name).cloned().unwrap_or_default();
        let items: Vec<Value> = rows
            .into_iter()
            .map(|(key, cnt, rate)| {
                json!({ "key": key, "http_req_cnt": cnt, "http_req_rate": rate })
            })
            .collect();
        Json(Value::Array(items))
    }

    async fn accept_config(State(state): State<ProxyState>, body: String) -> (StatusCode, String) {
        state.configs.lock().unwrap().push(body);
        (StatusCode::ACCEPTED, String::new())
    }

    let app = Router::new()
        .route("/v3/services/haproxy/runtime/stick_tables", get(list_tables))
        .route(
            "/v3/services/haproxy/runtime/stick_tables/:name/entries",
            get(table_entries),
        )
        .route("/v3/services/haproxy/configuration/raw", post(accept_config))
        .with_state(state);

    serve(app).await
}

/// Linear forecast model: every metric is `base + per_unit * total_rate`.
#[derive(Clone, Copy)]
pub struct ForecastModel {
    pub base: f64,
    pub per_unit: f64,
}

/// Mock forecaster implementing `/node_usage` and the root health probe.
pub async fn start_forecaster(model: ForecastModel) -> SocketAddr {
    async fn node_usage(
        State(model): State<ForecastModel>,
        Json(request): Json<Value>,
    ) -> Json<Value> {
        let total = request["rate_group_HIGH_USAGE"].as_f64().unwrap_or(0.0)
            + request["rate_group_MEDIUM_USAGE"].as_f64().unwrap_or(0.0)
            + request["rate_group_LOW_USAGE"].as_f64().unwrap_or(0.0);
        let value = model.base + model.per_unit * total;
        Json(json!([{
            "cpu_usage_node": value,
            "ram_usage_node": value,
            "power_usage_node": value,
        }]))
    }

    let app = Router::new()
        .route("/node_usage", get(node_usage))
        .route("/", get(|| async { StatusCode::OK }))
        .with_state(model);

    serve(app).await
}

/// In-process overlay: records published messages, answers peer queries.
pub struct OverlayStub {
    pub handle: OverlayHandle,
    pub published: Arc<Mutex<Vec<Vec<u8>>>>,
    pub peers: Arc<Mutex<Vec<NodeId>>>,
}

impl OverlayStub {
    pub fn new(local_id: &str) -> Self {
        let (tx, mut rx) = mpsc::channel(64);
        let published: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let peers: Arc<Mutex<Vec<NodeId>>> = Arc::new(Mutex::new(Vec::new()));

        let published_in = Arc::clone(&published);
        let peers_in = Arc::clone(&peers);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    OverlayCommand::Publish { data, reply } => {
                        published_in.lock().unwrap().push(data);
                        let _ = reply.send(Ok(()));
                    }
                    OverlayCommand::ConnectedPeers { reply } => {
                        let _ = reply.send(peers_in.lock().unwrap().clone());
                    }
                }
            }
        });

        Self {
            handle: OverlayHandle::new(tx, NodeId::from(local_id)),
            published,
            peers,
        }
    }

    pub fn set_peers(&self, ids: &[&str]) {
        *self.peers.lock().unwrap() = ids.iter().map(|id| NodeId::from(*id)).collect();
    }

    /// Every published message, decoded.
    pub fn published_messages(&self) -> Vec<Message> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter_map(|data| messages::decode(data).ok().flatten())
            .collect()
    }

    /// Poll until a published message satisfies `predicate`.
    pub async fn wait_for_message(&self, predicate: impl Fn(&Message) -> bool) -> Message {
        for _ in 0..150 {
            if let Some(message) = self.published_messages().into_iter().find(|m| predicate(m)) {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no published message matched the predicate");
    }
}
