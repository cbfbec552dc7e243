use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, fmt::MakeWriter};

use chat_fanout::{
    bench::{LoadGenerator, link::TcpConnector},
    cli::{BenchArgs, Cli, Command, HubArgs},
    hub::BroadcastHub,
    transport::{tcp::HubListener, ws},
};

fn env_filter_or(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

fn init_tracing<W>(filter: EnvFilter, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Hub(args) => {
            init_tracing(env_filter_or("info"), std::io::stdout);
            run_hub(args).await?;
        }
        Command::Bench(args) => {
            // stdout carries the report only; --quiet wins over RUST_LOG.
            let filter = if args.quiet {
                EnvFilter::new("error")
            } else {
                env_filter_or("info")
            };
            init_tracing(filter, std::io::stderr);
            run_bench(args).await?;
        }
    }

    Ok(())
}

async fn run_hub(args: HubArgs) -> Result<()> {
    let hub = Arc::new(BroadcastHub::new());
    let shutdown = CancellationToken::new();

    let ws_listener = TcpListener::bind(args.ws_listen)
        .await
        .with_context(|| format!("failed to bind websocket listener on {}", args.ws_listen))?;
    info!("websocket hub listening on {}", ws_listener.local_addr()?);
    let ws_server = tokio::spawn(ws::serve_until(
        ws_listener,
        Arc::clone(&hub),
        shutdown.clone().cancelled_owned(),
    ));

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind tcp listener on {}", args.listen))?;
    let tcp = HubListener::new(listener, hub);
    info!("tcp hub listening on {}", tcp.local_addr()?);

    let ctrl_c = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
            shutdown.cancel();
        }
    };

    if let Err(err) = tcp.run_until(ctrl_c).await {
        warn!("tcp listener exited with error: {err:?}");
        shutdown.cancel();
        return Err(err);
    }
    ws_server.await??;

    Ok(())
}

async fn run_bench(args: BenchArgs) -> Result<()> {
    info!(
        host = %args.host,
        port = args.port,
        concurrency = args.concurrency.get(),
        duration_secs = args.duration.get(),
        "starting benchmark"
    );

    let generator = LoadGenerator::new(TcpConnector::new(args.host.clone(), args.port), args.config());
    let report = generator
        .run(args.concurrency.get(), args.duration.get())
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }

    Ok(())
}
