//! Pub/sub message codec.
//!
//! Messages on the shared topic are self-describing JSON objects carrying a
//! `MsgType` string discriminator. Unknown discriminators are ignored with a
//! warning so newer agents can extend the protocol; a payload of a known
//! type that fails to decode indicates a protocol mismatch and is fatal to
//! the receiver loop.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::overlay::NodeId;
use crate::telemetry::GroupsLoad;

pub const MSG_TYPE_TEXT: &str = "text";
pub const MSG_TYPE_NODE_INFO_RECALC: &str = "nodeinfoRecalc";
pub const MSG_TYPE_NODE_INFO_NMS: &str = "nodeinfoNMS";
pub const MSG_TYPE_NODE_MARGIN_INFO_NMS: &str = "nodemargininfoNMS";
pub const MSG_TYPE_NODE_INFO_STATIC: &str = "nodeinfoStatic";

const KNOWN_TYPES: [&str; 5] = [
    MSG_TYPE_TEXT,
    MSG_TYPE_NODE_INFO_RECALC,
    MSG_TYPE_NODE_INFO_NMS,
    MSG_TYPE_NODE_MARGIN_INFO_NMS,
    MSG_TYPE_NODE_INFO_STATIC,
];

/// Every message the agents exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "MsgType")]
pub enum Message {
    /// Free-form diagnostic text.
    #[serde(rename = "text")]
    Text {
        #[serde(rename = "Text")]
        text: String,
    },

    /// Recalc advertisement: the rate limits we grant each peer, per
    /// function. `func_limits[node][function]` is the max req/s we accept
    /// from `node` for `function`.
    #[serde(rename = "nodeinfoRecalc")]
    NodeInfoRecalc {
        #[serde(rename = "HAProxyHost")]
        proxy_host: String,
        #[serde(rename = "HAProxyPort")]
        proxy_port: u16,
        #[serde(rename = "FuncLimits")]
        func_limits: HashMap<NodeId, HashMap<String, f64>>,
    },

    /// Node-margin strategy advertisement: who we are and what we run.
    #[serde(rename = "nodeinfoNMS")]
    NodeInfoNms {
        #[serde(rename = "HAProxyHost")]
        proxy_host: String,
        #[serde(rename = "HAProxyPort")]
        proxy_port: u16,
        #[serde(rename = "NodeType")]
        node_type: i32,
        #[serde(rename = "MaxValues")]
        max_values: HashMap<String, f64>,
        #[serde(rename = "Functions")]
        functions: Vec<String>,
    },

    /// Node-margin strategy: spare capacity offered to each common
    /// neighbour, with the load the margin was computed against.
    #[serde(rename = "nodemargininfoNMS")]
    NodeMarginInfoNms {
        #[serde(rename = "Margin")]
        margin: f64,
        #[serde(rename = "Load")]
        load: GroupsLoad,
    },

    /// Static strategy advertisement.
    #[serde(rename = "nodeinfoStatic")]
    NodeInfoStatic {
        #[serde(rename = "HAProxyHost")]
        proxy_host: String,
        #[serde(rename = "HAProxyPort")]
        proxy_port: u16,
        #[serde(rename = "Functions")]
        functions: Vec<String>,
    },
}

impl Message {
    /// Wire discriminator of this message.
    pub fn msg_type(&self) -> &'static str {
        match self {
            Message::Text { .. } => MSG_TYPE_TEXT,
            Message::NodeInfoRecalc { .. } => MSG_TYPE_NODE_INFO_RECALC,
            Message::NodeInfoNms { .. } => MSG_TYPE_NODE_INFO_NMS,
            Message::NodeMarginInfoNms { .. } => MSG_TYPE_NODE_MARGIN_INFO_NMS,
            Message::NodeInfoStatic { .. } => MSG_TYPE_NODE_INFO_STATIC,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message envelope: {0}")]
    Envelope(serde_json::Error),

    #[error("malformed {msg_type} payload: {source}")]
    Payload {
        msg_type: String,
        source: serde_json::Error,
    },

    #[error("cannot serialize message: {0}")]
    Encode(serde_json::Error),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "MsgType")]
    msg_type: String,
}

/// Serialize a message for publishing.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(CodecError::Encode)
}

/// Decode a message from the topic.
///
/// `Ok(None)` means the discriminator was unknown and the message should be
/// skipped; errors mean the stream itself is broken.
pub fn decode(data: &[u8]) -> Result<Option<Message>, CodecError> {
    let envelope: Envelope = serde_json::from_slice(data).map_err(CodecError::Envelope)?;

    if !KNOWN_TYPES.contains(&envelope.msg_type.as_str()) {
        warn!(msg_type = %envelope.msg_type, "unrecognized message type");
        return Ok(None);
    }

    serde_json::from_slice(data)
        .map(Some)
        .map_err(|source| CodecError::Payload {
            msg_type: envelope.msg_type,
            source,
        })
}
