use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    message::{ChatMessage, InboundMessage},
    registry::{ConnectionId, ConnectionRegistry, DeliveryReport},
};

type PeerSender = mpsc::UnboundedSender<ChatMessage>;

/// The single broadcast domain shared by every transport in the process.
///
/// Each attached connection owns a [`Peer`] (its way into the hub) and a
/// [`Mailbox`] (its way out). Whatever one peer publishes is stamped and
/// queued on every other peer's mailbox; the originator never sees its own
/// message.
pub struct BroadcastHub {
    registry: ConnectionRegistry<PeerSender>,
    next_id: AtomicU64,
    delivery_failures: AtomicU64,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            next_id: AtomicU64::new(1),
            delivery_failures: AtomicU64::new(0),
        }
    }

    /// Registers a new connection and returns both ends of its channel.
    pub fn attach(self: &Arc<Self>) -> (Peer, Mailbox) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, mailbox) = Mailbox::channel();
        self.registry.register(id, sender);
        info!(connection = id, peers = self.registry.len(), "peer attached");

        let peer = Peer {
            id,
            hub: Arc::clone(self),
        };
        (peer, mailbox)
    }

    /// Stamps `inbound` with the server time and queues it for every peer
    /// except `origin`. Never blocks on a slow peer.
    pub fn publish(&self, origin: ConnectionId, inbound: InboundMessage) -> DeliveryReport {
        debug!(connection = origin, sender = %inbound.sender, "message received");
        let outbound = inbound.stamp();

        let report = self
            .registry
            .broadcast_except(origin, &outbound, |sender, message| {
                sender.send(message.clone())
            });

        if report.failed > 0 {
            self.delivery_failures
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        report
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_attached(&self, id: ConnectionId) -> bool {
        self.registry.contains(id)
    }

    /// Deliveries that failed because the target's mailbox was already gone.
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    fn detach(&self, id: ConnectionId) {
        if self.registry.deregister(id).is_some() {
            info!(connection = id, peers = self.registry.len(), "peer detached");
        }
    }
}

/// Hub-facing end of a connection. Dropping it detaches the connection, so
/// graceful and abrupt termination share one cleanup path.
pub struct Peer {
    id: ConnectionId,
    hub: Arc<BroadcastHub>,
}

impl Peer {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn publish(&self, inbound: InboundMessage) -> DeliveryReport {
        self.hub.publish(self.id, inbound)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.hub.detach(self.id);
    }
}

/// Result of a bounded wait on a [`Mailbox`].
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Message(ChatMessage),
    TimedOut,
    Closed,
}

/// Peer-facing end of a connection: an unbounded FIFO of broadcasts.
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<ChatMessage>,
}

impl Mailbox {
    pub fn channel() -> (mpsc::UnboundedSender<ChatMessage>, Mailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Mailbox { rx })
    }

    /// Waits for the next message. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        self.rx.recv().await
    }

    pub async fn recv_timeout(&mut self, bound: Duration) -> Received {
        match tokio::time::timeout(bound, self.rx.recv()).await {
            Ok(Some(message)) => Received::Message(message),
            Ok(None) => Received::Closed,
            Err(_) => Received::TimedOut,
        }
    }

    pub fn try_recv(&mut self) -> Option<ChatMessage> {
        self.rx.try_recv().ok()
    }
}
