//! Phase barriers for the load generator.
//!
//! - [`StartGate`]: workers park on it until the coordinator opens it once;
//!   every waiter is released together and later waiters pass straight through.
//! - [`CompletionGate`]: counts workers down to zero. Each worker holds a
//!   [`CompletionGuard`], which counts down when dropped, so the signal fires
//!   exactly once per worker on every exit path, including panics.

use std::{
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Notify, watch};

#[derive(Clone)]
pub struct StartGate {
    state: Arc<watch::Sender<bool>>,
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn open(&self) {
        self.state.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the gate has been opened. No timeout.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Clone)]
pub struct CompletionGate {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    remaining: AtomicUsize,
    done: Notify,
}

impl CompletionGate {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                remaining: AtomicUsize::new(count),
                done: Notify::new(),
            }),
        }
    }

    pub fn guard(&self) -> CompletionGuard {
        CompletionGuard { gate: self.clone() }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    /// Saturates at zero; extra calls are ignored.
    pub fn count_down(&self) {
        let previous = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.inner.done.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        loop {
            let mut notified = pin!(self.inner.done.notified());
            notified.as_mut().enable();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Returns `true` if the count reached zero within `bound`.
    pub async fn wait_timeout(&self, bound: Duration) -> bool {
        tokio::time::timeout(bound, self.wait()).await.is_ok()
    }
}

/// Counts its gate down once, on drop.
pub struct CompletionGuard {
    gate: CompletionGate,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.gate.count_down();
    }
}
