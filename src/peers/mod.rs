//! Peer information table.
//!
//! A bounded-staleness view of every peer that has spoken to us recently.
//! Entries expire `entry_validity` after the last message from their peer;
//! expired entries are pruned at the start of every critical section, so
//! strategies never observe a stale peer.
//!
//! # Design Decisions
//! - One generic table over the two entry flavors; a process uses exactly
//!   one flavor for its lifetime
//! - All access goes through a closure run inside the critical section; the
//!   closure cannot await, so no I/O ever happens under the lock

pub mod margin;
pub mod recalc;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::overlay::NodeId;

pub use margin::MarginEntry;
pub use recalc::{FuncData, RecalcEntry};

/// A table row that knows when its peer was last heard from.
pub trait PeerRecord {
    fn last_seen(&self) -> Instant;
}

/// Concurrency-safe expiring map from peer id to its latest advertised facts.
pub struct PeerTable<E> {
    entries: Mutex<HashMap<NodeId, E>>,
    entry_validity: Duration,
}

impl<E: PeerRecord> PeerTable<E> {
    /// `entry_validity` should exceed the publication period so a single
    /// missed message does not evict a live peer.
    pub fn new(entry_validity: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            entry_validity,
        }
    }

    /// Run `f` over the live entries inside the critical section. Expired
    /// entries are removed before `f` sees the map; `f` may mutate entries
    /// or insert new ones.
    pub fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<NodeId, E>) -> T) -> T {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let now = Instant::now();
        entries.retain(|id, entry| {
            let live = now.duration_since(entry.last_seen()) <= self.entry_validity;
            if !live {
                debug!(peer = %id, "peer entry expired");
            }
            live
        });

        f(&mut entries)
    }
}
