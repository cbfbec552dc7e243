use std::{
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::bench::{BenchConfig, ProbeSettings};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broadcast hub behind the TCP and WebSocket transports.
    Hub(HubArgs),
    /// Load-test a running hub over its TCP transport.
    Bench(BenchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HubArgs {
    /// Address for the JSON-lines TCP transport. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub listen: SocketAddr,

    /// Address for the WebSocket transport (served at /ws/chat).
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub ws_listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct BenchArgs {
    /// Hub host name or IP address.
    pub host: String,

    /// Hub TCP port.
    pub port: u16,

    /// Number of virtual users.
    pub concurrency: NonZeroUsize,

    /// Measured run time in seconds.
    pub duration: NonZeroU64,

    /// Suppress progress output; only the final report is printed.
    #[arg(long)]
    pub quiet: bool,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,

    /// Seconds between spawning the users and starting the run.
    #[arg(long, default_value_t = 3)]
    pub warmup: u64,

    /// Seconds a user waits for a broadcast before counting a timeout.
    #[arg(long, default_value_t = 10)]
    pub wait_bound: u64,

    /// Milliseconds between probes.
    #[arg(long, default_value_t = 10)]
    pub pacing_ms: u64,

    /// Seconds to wait for users to stop before reporting stragglers.
    #[arg(long, default_value_t = 30)]
    pub grace: u64,
}

impl BenchArgs {
    pub fn config(&self) -> BenchConfig {
        BenchConfig {
            probe: ProbeSettings {
                wait_bound: Duration::from_secs(self.wait_bound),
                pacing: Duration::from_millis(self.pacing_ms),
            },
            warmup: Duration::from_secs(self.warmup),
            grace: Duration::from_secs(self.grace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bench_positionals_and_flags_parse() {
        let cli = Cli::try_parse_from([
            "chat_fanout", "bench", "--quiet", "localhost", "9000", "5", "2", "--warmup", "0",
        ])
        .expect("valid invocation");

        let Command::Bench(args) = cli.command else {
            panic!("expected bench command");
        };
        assert_eq!(args.host, "localhost");
        assert_eq!(args.port, 9000);
        assert_eq!(args.concurrency.get(), 5);
        assert_eq!(args.duration.get(), 2);
        assert!(args.quiet);

        let config = args.config();
        assert!(config.warmup.is_zero());
        assert_eq!(config.probe.wait_bound, Duration::from_secs(10));
        assert_eq!(config.probe.pacing, Duration::from_millis(10));
        assert_eq!(config.grace, Duration::from_secs(30));
    }

    #[test]
    fn bench_requires_all_positionals() {
        assert!(Cli::try_parse_from(["chat_fanout", "bench", "localhost", "9000", "5"]).is_err());
    }

    #[test]
    fn bench_rejects_zero_concurrency() {
        assert!(Cli::try_parse_from(["chat_fanout", "bench", "localhost", "9000", "0", "2"]).is_err());
    }
}
