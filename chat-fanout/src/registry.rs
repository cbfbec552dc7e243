//! Registry of attached peers keyed by connection id.
//!
//! Callers never lock anything themselves: every operation takes the
//! internal mutex for as long as it needs the map and no longer. Broadcasts
//! copy the current set of delivery channels out of the map first and
//! deliver after the lock is released, so a peer that registers or leaves
//! mid-broadcast neither blocks the broadcast nor breaks it. A peer added
//! during a broadcast may or may not see that message.

use std::{collections::HashMap, fmt, sync::Mutex};

use tracing::debug;

/// Identifier handed out once per attached connection and never reused.
pub type ConnectionId = u64;

/// Outcome of a single `broadcast_except` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct ConnectionRegistry<C> {
    entries: Mutex<HashMap<ConnectionId, C>>,
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts unconditionally; ids are unique by construction upstream.
    pub fn register(&self, id: ConnectionId, channel: C) {
        self.entries.lock().unwrap().insert(id, channel);
    }

    /// Removes `id` if present. Removing an absent id is a no-op.
    pub fn deregister(&self, id: ConnectionId) -> Option<C> {
        self.entries.lock().unwrap().remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Clone> ConnectionRegistry<C> {
    /// Calls `deliver` for every registered channel except `origin`'s.
    ///
    /// A failing delivery is logged and counted; the remaining peers still
    /// get the message.
    pub fn broadcast_except<M, E, F>(
        &self,
        origin: ConnectionId,
        message: &M,
        mut deliver: F,
    ) -> DeliveryReport
    where
        F: FnMut(&C, &M) -> Result<(), E>,
        E: fmt::Debug,
    {
        let targets = self.snapshot_except(origin);
        let mut report = DeliveryReport::default();

        for (id, channel) in &targets {
            match deliver(channel, message) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    debug!(connection = id, ?error, "delivery failed");
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn snapshot_except(&self, origin: ConnectionId) -> Vec<(ConnectionId, C)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| **id != origin)
            .map(|(id, channel)| (*id, channel.clone()))
            .collect()
    }
}
