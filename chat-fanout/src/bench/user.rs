//! A single simulated client.
//!
//! ```text
//! Connecting -> WaitingForStart -> { Probing -> AwaitingEcho } -> Stopping -> Stopped
//! ```
//!
//! Latency is measured from this user's probe to the next broadcast it
//! receives from anyone else. The hub never returns a user's own probe, so
//! with several users each one's probes are what complete the others' waits.

use std::{sync::Arc, time::Instant};

use anyhow::Result;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    ProbeSettings, RunCounters,
    link::{Connector, HubLink},
};
use crate::{
    hub::Received,
    latency::LatencyHandle,
    message::InboundMessage,
    sync::{CompletionGuard, StartGate},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    Connecting,
    WaitingForStart,
    Probing,
    AwaitingEcho,
    Stopping,
    Stopped,
}

/// Why a user left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserExit {
    Cancelled,
    ConnectFailed,
    LinkLost,
}

pub struct VirtualUser<C> {
    id: usize,
    connector: Arc<C>,
    start: StartGate,
    cancel: CancellationToken,
    latency: LatencyHandle,
    counters: Arc<RunCounters>,
    settings: ProbeSettings,
    state: UserState,
    // Dropped last, after the link is gone.
    _completion: CompletionGuard,
}

impl<C: Connector> VirtualUser<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        connector: Arc<C>,
        start: StartGate,
        cancel: CancellationToken,
        latency: LatencyHandle,
        counters: Arc<RunCounters>,
        settings: ProbeSettings,
        completion: CompletionGuard,
    ) -> Self {
        Self {
            id,
            connector,
            start,
            cancel,
            latency,
            counters,
            settings,
            state: UserState::Connecting,
            _completion: completion,
        }
    }

    pub fn state(&self) -> UserState {
        self.state
    }

    pub async fn run(mut self) -> UserExit {
        let exit = match self.connect().await {
            Ok(Some(link)) => self.drive(link).await,
            Ok(None) => UserExit::Cancelled,
            Err(err) => {
                warn!(user = self.id, error = ?err, "virtual user failed to connect");
                self.counters.record_connect_failure();
                UserExit::ConnectFailed
            }
        };
        self.transition(UserState::Stopped);
        exit
    }

    async fn connect(&mut self) -> Result<Option<HubLink>> {
        self.transition(UserState::Connecting);
        select! {
            _ = self.cancel.cancelled() => Ok(None),
            link = self.connector.connect() => link.map(Some),
        }
    }

    async fn drive(&mut self, mut link: HubLink) -> UserExit {
        self.transition(UserState::WaitingForStart);
        select! {
            _ = self.cancel.cancelled() => return self.stop(link),
            _ = self.start.wait() => {}
        }

        let sender = format!("client-{}", self.id);
        loop {
            self.transition(UserState::Probing);
            let sent_at = Instant::now();
            if link.send(InboundMessage::new(sender.as_str(), "ping")).is_err() {
                return self.lost(link);
            }
            self.counters.record_probe();

            self.transition(UserState::AwaitingEcho);
            let received = select! {
                _ = self.cancel.cancelled() => return self.stop(link),
                received = link.mailbox().recv_timeout(self.settings.wait_bound) => received,
            };
            match received {
                Received::Message(_) => self.latency.record(sent_at.elapsed()),
                Received::TimedOut => self.counters.record_timeout(),
                Received::Closed => return self.lost(link),
            }

            select! {
                _ = self.cancel.cancelled() => return self.stop(link),
                _ = tokio::time::sleep(self.settings.pacing) => {}
            }
        }
    }

    fn stop(&mut self, link: HubLink) -> UserExit {
        self.transition(UserState::Stopping);
        drop(link);
        UserExit::Cancelled
    }

    fn lost(&mut self, link: HubLink) -> UserExit {
        if self.cancel.is_cancelled() {
            return self.stop(link);
        }
        warn!(user = self.id, "hub link closed mid-run");
        self.counters.record_link_failure();
        self.transition(UserState::Stopping);
        drop(link);
        UserExit::LinkLost
    }

    fn transition(&mut self, next: UserState) {
        if self.state != next {
            trace!(user = self.id, from = ?self.state, to = ?next, "state change");
            if next == UserState::Stopped {
                debug!(user = self.id, "virtual user stopped");
            }
            self.state = next;
        }
    }
}
