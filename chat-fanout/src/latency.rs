//! Concurrent latency histogram.
//!
//! Built on `hdrhistogram`'s synchronized histogram: every worker records into
//! its own [`LatencyHandle`] without taking a lock, and the owning
//! [`LatencyRecorder`] merges those per-worker histograms only when it is
//! asked for a summary. Handles flush their samples when dropped, so a summary
//! taken after all workers have finished contains every sample.

use std::time::Duration;

use anyhow::{Context, Result};
use hdrhistogram::{
    Histogram,
    sync::{Recorder, SyncHistogram},
};
use serde::Serialize;

/// Upper bound of the tracked range; larger samples are clamped to it.
const MAX_TRACKABLE: Duration = Duration::from_secs(60);
const SIGNIFICANT_DIGITS: u8 = 3;

pub struct LatencyRecorder {
    histogram: SyncHistogram<u64>,
}

impl LatencyRecorder {
    pub fn new() -> Result<Self> {
        let histogram =
            Histogram::<u64>::new_with_bounds(1, MAX_TRACKABLE.as_nanos() as u64, SIGNIFICANT_DIGITS)
                .context("failed to create latency histogram")?;
        Ok(Self {
            histogram: histogram.into_sync(),
        })
    }

    pub fn handle(&self) -> LatencyHandle {
        LatencyHandle {
            recorder: self.histogram.recorder(),
        }
    }

    /// Merges whatever the handles have flushed, waiting at most `wait` for
    /// handles that are still alive. Returns `None` when nothing was recorded.
    pub fn summarize(&mut self, wait: Duration) -> Option<LatencySummary> {
        self.histogram.refresh_timeout(wait);
        LatencySummary::from_histogram(&self.histogram)
    }

    /// [`summarize`](Self::summarize) on the blocking pool, so a handle still
    /// held by a stuck worker never stalls the async runtime.
    pub async fn finish(mut self, wait: Duration) -> Result<Option<LatencySummary>> {
        tokio::task::spawn_blocking(move || self.summarize(wait))
            .await
            .context("latency summary task failed")
    }
}

/// One worker's write side of a [`LatencyRecorder`].
pub struct LatencyHandle {
    recorder: Recorder<u64>,
}

impl LatencyHandle {
    pub fn record(&mut self, latency: Duration) {
        let ceiling = MAX_TRACKABLE.as_nanos() as u64;
        let nanos = u64::try_from(latency.as_nanos())
            .unwrap_or(u64::MAX)
            .clamp(1, ceiling);
        // Clamped into the tracked range, so this cannot be out of bounds.
        let _ = self.recorder.record(nanos);
    }
}

/// Percentile view of a histogram, in microseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    pub fn from_histogram(histogram: &Histogram<u64>) -> Option<Self> {
        if histogram.is_empty() {
            return None;
        }

        let micros = |nanos: u64| nanos / 1_000;
        Some(Self {
            count: histogram.len(),
            min_us: micros(histogram.min()),
            mean_us: histogram.mean() / 1_000.0,
            p50_us: micros(histogram.value_at_quantile(0.50)),
            p90_us: micros(histogram.value_at_quantile(0.90)),
            p99_us: micros(histogram.value_at_quantile(0.99)),
            p999_us: micros(histogram.value_at_quantile(0.999)),
            max_us: micros(histogram.max()),
        })
    }
}
