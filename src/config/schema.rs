//! Configuration schema definitions.
//!
//! Every field maps to one `AGENT_*` environment variable and one CLI flag.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

/// Load-balancing strategy selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyKind {
    /// Two-phase limit/weight recalculation.
    #[value(name = "recalcstrategy")]
    Recalc,

    /// Margin-based iterative redistribution.
    #[value(name = "nodemarginstrategy")]
    NodeMargin,

    /// Fixed 60/40 local/neighbour split.
    #[value(name = "static")]
    Static,

    /// Everything handled by the local gateway.
    #[value(name = "alllocal")]
    AllLocal,
}

/// Hardware class of this node, as understood by the forecaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NodeType {
    #[value(name = "0")]
    Heavy,
    #[value(name = "1")]
    Mid,
    #[value(name = "2")]
    Light,
}

impl NodeType {
    /// Wire representation used by the forecaster and the pub/sub messages.
    pub fn as_int(self) -> i32 {
        match self {
            NodeType::Heavy => 0,
            NodeType::Mid => 1,
            NodeType::Light => 2,
        }
    }

    pub fn from_int(value: i32) -> Option<Self> {
        match value {
            0 => Some(NodeType::Heavy),
            1 => Some(NodeType::Mid),
            2 => Some(NodeType::Light),
            _ => None,
        }
    }
}

/// Complete agent configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "faasmesh-agent", version, about = "Control-plane agent for a federated FaaS node")]
pub struct AgentConfig {
    /// Path to an .env-style file whose values overwrite environment variables.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable debug-level logging.
    #[arg(long, env = "AGENT_DEBUG", default_value = "false", action = ArgAction::Set)]
    pub debug: bool,

    /// Include date and time in log lines.
    #[arg(long, env = "AGENT_LOG_DATETIME", default_value = "false", action = ArgAction::Set)]
    pub log_datetime: bool,

    /// Colorize log output.
    #[arg(long, env = "AGENT_LOG_COLORS", default_value = "false", action = ArgAction::Set)]
    pub log_colors: bool,

    /// Overlay listen multiaddresses, comma separated.
    #[arg(
        long,
        env = "AGENT_LISTEN",
        value_delimiter = ',',
        default_value = "/ip4/0.0.0.0/tcp/31600"
    )]
    pub listen: Vec<String>,

    /// PEM file holding the agent's Ed25519 private key. Missing or empty
    /// file means a fresh key is generated and logged.
    #[arg(long, env = "AGENT_PRIVATE_KEY_FILE")]
    pub private_key_file: Option<PathBuf>,

    /// Contact bootstrap nodes on startup.
    #[arg(long, env = "AGENT_BOOTSTRAP_NODES", default_value = "false", action = ArgAction::Set)]
    pub bootstrap_nodes: bool,

    /// Use a well-known public bootstrap list instead of an explicit one.
    /// There is no ambient public list in this implementation, so enabling
    /// this without an explicit list fails validation.
    #[arg(long, env = "AGENT_PUBLIC_BOOTSTRAP_NODES", default_value = "false", action = ArgAction::Set)]
    pub public_bootstrap_nodes: bool,

    /// Bootstrap node multiaddresses (with /p2p/ peer id), comma separated.
    #[arg(long, env = "AGENT_BOOTSTRAP_NODES_LIST", value_delimiter = ',')]
    pub bootstrap_nodes_list: Vec<String>,

    /// File with one bootstrap multiaddress per line.
    #[arg(long, env = "AGENT_BOOTSTRAP_NODES_FILE")]
    pub bootstrap_nodes_file: Option<PathBuf>,

    /// Treat a failed bootstrap dial as a fatal startup error.
    #[arg(long, env = "AGENT_BOOTSTRAP_FORCE", default_value = "false", action = ArgAction::Set)]
    pub bootstrap_force: bool,

    /// Rendezvous string grouping the nodes of one federation.
    #[arg(long, env = "AGENT_RENDEZVOUS", default_value = "faasmesh")]
    pub rendezvous: String,

    /// Enable mDNS discovery of peers on the local network.
    #[arg(long, env = "AGENT_MDNS_ENABLED", default_value = "false", action = ArgAction::Set)]
    pub mdns_enabled: bool,

    /// Interval between DHT provider lookups for the rendezvous key.
    #[arg(long, env = "AGENT_KAD_IDLE_TIME", default_value = "30s", value_parser = humantime::parse_duration)]
    pub kad_idle_time: Duration,

    /// Pub/sub topic shared by all agents of the federation.
    #[arg(long, env = "AGENT_PUBSUB_TOPIC", default_value = "faasmesh")]
    pub pubsub_topic: String,

    /// Strategy tick interval.
    #[arg(long, env = "AGENT_RECALC_PERIOD", default_value = "1m", value_parser = humantime::parse_duration)]
    pub recalc_period: Duration,

    /// Public address peers use to reach this node's proxy.
    #[arg(long, env = "AGENT_HAPROXY_HOST", default_value = "127.0.0.1")]
    pub haproxy_host: String,

    /// Public port of this node's proxy.
    #[arg(long, env = "AGENT_HAPROXY_PORT", default_value = "80")]
    pub haproxy_port: u16,

    /// Basic-auth user for the proxy's Data Plane API.
    #[arg(long, env = "AGENT_HAPROXY_USER", default_value = "admin")]
    pub haproxy_user: String,

    /// Basic-auth password for the proxy's Data Plane API.
    #[arg(long, env = "AGENT_HAPROXY_PASS", default_value = "admin")]
    pub haproxy_pass: String,

    /// Data Plane API port of the local proxy.
    #[arg(long, env = "AGENT_HAPROXY_DATAPLANE_PORT", default_value = "5555")]
    pub haproxy_dataplane_port: u16,

    /// Local function gateway host.
    #[arg(long, env = "AGENT_OPENFAAS_HOST", default_value = "127.0.0.1")]
    pub openfaas_host: String,

    /// Local function gateway port.
    #[arg(long, env = "AGENT_OPENFAAS_PORT", default_value = "8080")]
    pub openfaas_port: u16,

    /// Gateway basic-auth user.
    #[arg(long, env = "AGENT_OPENFAAS_USER", default_value = "admin")]
    pub openfaas_user: String,

    /// Gateway basic-auth password.
    #[arg(long, env = "AGENT_OPENFAAS_PASS", default_value = "admin")]
    pub openfaas_pass: String,

    /// Metrics backend host.
    #[arg(long, env = "AGENT_PROMETHEUS_HOST", default_value = "127.0.0.1")]
    pub prometheus_host: String,

    /// Metrics backend port.
    #[arg(long, env = "AGENT_PROMETHEUS_PORT", default_value = "9090")]
    pub prometheus_port: u16,

    /// Forecaster service host.
    #[arg(long, env = "AGENT_FORECASTER_HOST", default_value = "127.0.0.1")]
    pub forecaster_host: String,

    /// Forecaster service port.
    #[arg(long, env = "AGENT_FORECASTER_PORT", default_value = "5000")]
    pub forecaster_port: u16,

    /// Bind host for the agent's own health/metrics server.
    #[arg(long, env = "AGENT_HTTP_HOST", default_value = "0.0.0.0")]
    pub http_host: String,

    /// Bind port for the agent's own health/metrics server.
    #[arg(long, env = "AGENT_HTTP_PORT", default_value = "31610")]
    pub http_port: u16,

    /// Active load-balancing strategy.
    #[arg(long, env = "AGENT_STRATEGY", default_value = "recalcstrategy")]
    pub strategy: StrategyKind,

    /// JSON file classifying functions into usage groups.
    #[arg(long, env = "AGENT_GROUP_LIST_FILE_NAME", default_value = "group_list.json")]
    pub group_list_file_name: PathBuf,

    /// Hardware class of this node (0 = heavy, 1 = mid, 2 = light).
    #[arg(long, env = "AGENT_NODE_TYPE", default_value = "0")]
    pub node_type: NodeType,

    /// CPU usage threshold above which the node counts as overloaded.
    #[arg(long, env = "AGENT_NMS_CPU_THRESHOLD", default_value = "0")]
    pub nms_cpu_threshold: f64,

    /// RAM usage threshold above which the node counts as overloaded.
    #[arg(long, env = "AGENT_NMS_RAM_THRESHOLD", default_value = "0")]
    pub nms_ram_threshold: f64,

    /// Power usage threshold above which the node counts as overloaded.
    #[arg(long, env = "AGENT_NMS_POWER_THRESHOLD", default_value = "0")]
    pub nms_power_threshold: f64,
}

impl AgentConfig {
    /// Base URL of the local function gateway.
    pub fn gateway_url(&self) -> String {
        format!("http://{}:{}", self.openfaas_host, self.openfaas_port)
    }

    /// Base URL of the proxy's Data Plane API.
    pub fn dataplane_url(&self) -> String {
        format!("http://{}:{}", self.haproxy_host, self.haproxy_dataplane_port)
    }

    /// Base URL of the metrics backend.
    pub fn prometheus_url(&self) -> String {
        format!("http://{}:{}", self.prometheus_host, self.prometheus_port)
    }

    /// Base URL of the forecaster service.
    pub fn forecaster_url(&self) -> String {
        format!("http://{}:{}", self.forecaster_host, self.forecaster_port)
    }
}
