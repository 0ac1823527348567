//! Peer-to-peer overlay.
//!
//! # Data Flow
//! ```text
//! strategy ──publish──▶ OverlayHandle ──command channel──▶ swarm task
//! receiver ◀──inbound channel── swarm task ◀── gossip topic
//! discovery: kademlia bootstrap + rendezvous providers + optional mDNS
//! ```
//!
//! # Design Decisions
//! - The swarm runs on its own task; everything else talks to it through a
//!   command channel, so no libp2p type leaks into the strategies
//! - Publishing with zero subscribed peers is not an error (a solo node
//!   keeps ticking)
//! - Dropping every handle shuts the swarm task down

pub mod swarm;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Opaque identifier of a peer on the overlay, stable for the lifetime of
/// that peer's key material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId(value)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("overlay task is gone")]
    Closed,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("invalid multiaddress {addr}: {reason}")]
    BadAddress { addr: String, reason: String },

    #[error("bootstrap contact to {addr} failed: {reason}")]
    Bootstrap { addr: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// A raw message delivered from the pub/sub topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender: NodeId,
    pub data: Vec<u8>,
}

/// Requests the rest of the agent can make of the swarm task.
#[derive(Debug)]
pub enum OverlayCommand {
    Publish {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
}

/// Cheap cloneable handle to the overlay.
#[derive(Clone)]
pub struct OverlayHandle {
    commands: mpsc::Sender<OverlayCommand>,
    local_id: NodeId,
}

impl OverlayHandle {
    pub fn new(commands: mpsc::Sender<OverlayCommand>, local_id: NodeId) -> Self {
        Self { commands, local_id }
    }

    /// Our own identifier on the overlay.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Publish raw bytes on the shared topic. Best effort multicast: there is
    /// no acknowledgement and no ordering guarantee.
    pub async fn publish(&self, data: Vec<u8>) -> Result<(), OverlayError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(OverlayCommand::Publish { data, reply })
            .await
            .map_err(|_| OverlayError::Closed)?;
        answer.await.map_err(|_| OverlayError::Closed)?
    }

    /// Identifiers of the peers we currently hold a connection to, sorted.
    pub async fn connected_peers(&self) -> Result<Vec<NodeId>, OverlayError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(OverlayCommand::ConnectedPeers { reply })
            .await
            .map_err(|_| OverlayError::Closed)?;
        answer.await.map_err(|_| OverlayError::Closed)
    }
}
