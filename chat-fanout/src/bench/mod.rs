//! Load generator that drives a hub with a synchronized population of
//! virtual users and reports round-trip latency and timeouts.

pub mod link;
pub mod user;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, ensure};
use serde::Serialize;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    latency::{LatencyRecorder, LatencySummary},
    sync::{CompletionGate, StartGate},
};
use link::Connector;
use user::{UserExit, VirtualUser};

/// How long to wait for histogram handles still held by stragglers.
const FLUSH_WAIT: Duration = Duration::from_millis(100);

/// Per-probe timing used by every virtual user.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    /// How long a user waits for any broadcast after sending a probe.
    pub wait_bound: Duration,
    /// Pause between one probe's outcome and the next probe.
    pub pacing: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            wait_bound: Duration::from_secs(10),
            pacing: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub probe: ProbeSettings,
    /// Delay between spawning the users and opening the start gate.
    pub warmup: Duration,
    /// Bound on the wait for users to finish after cancellation.
    pub grace: Duration,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            probe: ProbeSettings::default(),
            warmup: Duration::from_secs(3),
            grace: Duration::from_secs(30),
        }
    }
}

/// Counters shared by every user in a run.
#[derive(Debug, Default)]
pub struct RunCounters {
    probes: AtomicU64,
    timeouts: AtomicU64,
    connect_failures: AtomicU64,
    link_failures: AtomicU64,
}

impl RunCounters {
    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_failure(&self) {
        self.link_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    pub fn link_failures(&self) -> u64 {
        self.link_failures.load(Ordering::Relaxed)
    }
}

pub struct LoadGenerator<C> {
    connector: Arc<C>,
    config: BenchConfig,
}

impl<C: Connector> LoadGenerator<C> {
    pub fn new(connector: C, config: BenchConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            config,
        }
    }

    /// Runs `concurrency` users for `duration_secs` and summarizes the run.
    ///
    /// Users that fail to connect are counted and the run carries on with the
    /// rest. Users still running after the grace period are reported as
    /// stragglers; the report is built from whatever was recorded.
    pub async fn run(&self, concurrency: usize, duration_secs: u64) -> Result<Report> {
        ensure!(concurrency > 0, "concurrency must be positive");
        ensure!(duration_secs > 0, "duration must be positive");

        let recorder = LatencyRecorder::new()?;
        let counters = Arc::new(RunCounters::default());
        let start = StartGate::new();
        let completion = CompletionGate::new(concurrency);
        let cancel = CancellationToken::new();

        let users: Vec<JoinHandle<UserExit>> = (0..concurrency)
            .map(|id| {
                let user = VirtualUser::new(
                    id,
                    Arc::clone(&self.connector),
                    start.clone(),
                    cancel.clone(),
                    recorder.handle(),
                    Arc::clone(&counters),
                    self.config.probe,
                    completion.guard(),
                );
                tokio::spawn(user.run())
            })
            .collect();

        info!(concurrency, "virtual users spawned");
        if !self.config.warmup.is_zero() {
            info!(warmup = ?self.config.warmup, "warming up before start");
            sleep(self.config.warmup).await;
        }

        info!(duration_secs, "start");
        start.open();
        sleep(Duration::from_secs(duration_secs)).await;

        info!("time's up, stopping virtual users");
        cancel.cancel();

        let stragglers = if completion.wait_timeout(self.config.grace).await {
            info!("all virtual users finished cleanly");
            0
        } else {
            let stragglers = completion.remaining();
            warn!(stragglers, "benchmark did not complete cleanly");
            stragglers
        };

        let latency = recorder.finish(FLUSH_WAIT).await?;
        for user in &users {
            user.abort();
        }

        Ok(Report {
            concurrency,
            duration_secs,
            samples: latency.as_ref().map_or(0, |summary| summary.count),
            timeouts: counters.timeouts(),
            probes_sent: counters.probes(),
            connect_failures: counters.connect_failures(),
            link_failures: counters.link_failures(),
            stragglers,
            throughput: latency
                .as_ref()
                .map_or(0.0, |summary| summary.count as f64 / duration_secs as f64),
            latency,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub concurrency: usize,
    pub duration_secs: u64,
    pub samples: u64,
    pub timeouts: u64,
    pub probes_sent: u64,
    pub connect_failures: u64,
    /// Users whose link to the hub closed before the run ended.
    pub link_failures: u64,
    pub stragglers: usize,
    /// Samples per second of run time.
    pub throughput: f64,
    /// `None` when no round trip completed.
    pub latency: Option<LatencySummary>,
}

impl Report {
    pub fn has_data(&self) -> bool {
        self.latency.is_some()
    }
}

const RULE: &str = "---------------------------------------------------------";

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-------------------- Benchmark Results --------------------")?;
        writeln!(f, "Virtual Users: {}", self.concurrency)?;
        writeln!(f, "Duration: {} s", self.duration_secs)?;
        writeln!(f, "Probes Sent: {}", self.probes_sent)?;
        writeln!(f, "Connect Failures: {}", self.connect_failures)?;
        writeln!(f, "Lost Links: {}", self.link_failures)?;
        writeln!(f, "Stragglers: {}", self.stragglers)?;

        let Some(latency) = &self.latency else {
            writeln!(f, "Total Timeouts: {} (indicates back-pressure)", self.timeouts)?;
            writeln!(f, "No measurements were recorded. This might indicate a connection or logic issue.")?;
            return write!(f, "{RULE}");
        };

        writeln!(f, "Total Messages Measured: {}", self.samples)?;
        writeln!(f, "Total Timeouts: {} (indicates back-pressure)", self.timeouts)?;
        writeln!(f, "Throughput: {:.2} msg/sec", self.throughput)?;
        writeln!(f, "{RULE}")?;
        writeln!(f, "Latency (microseconds):")?;
        writeln!(f, "  min:          {}", latency.min_us)?;
        writeln!(f, "  mean:         {:.2}", latency.mean_us)?;
        writeln!(f, "  p50 (median): {}", latency.p50_us)?;
        writeln!(f, "  p90:          {}", latency.p90_us)?;
        writeln!(f, "  p99:          {}", latency.p99_us)?;
        writeln!(f, "  p99.9:        {}", latency.p999_us)?;
        writeln!(f, "  max:          {}", latency.max_us)?;
        write!(f, "{RULE}")
    }
}
