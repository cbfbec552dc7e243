use std::{process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const BINARY: &str = env!("CARGO_BIN_EXE_chat_fanout");
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const BENCH_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn bench_against_spawned_hub() -> Result<()> {
    let (mut hub, mut hub_stdout) = spawn_hub()?;
    let addr = read_hub_addr(&mut hub_stdout).await?;
    let port = addr
        .rsplit(':')
        .next()
        .context("hub address has no port")?
        .to_string();

    // Keep draining hub logs so the pipe never fills.
    let hub_log_task = tokio::spawn(drain_stdout(hub_stdout));

    let bench = Command::new(BINARY)
        .args(["bench", "--quiet", "--warmup", "0", "127.0.0.1", &port, "3", "1"])
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();
    let output = timeout(BENCH_TIMEOUT, bench)
        .await
        .context("bench did not finish in time")??;

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "bench failed:\n{stdout}");
    assert!(stdout.contains("Benchmark Results"), "unexpected report:\n{stdout}");
    assert!(stdout.contains("Virtual Users: 3"));
    assert!(stdout.contains("Connect Failures: 0"));
    // --quiet leaves only the report on stdout.
    assert!(!stdout.contains("INFO"), "progress logged despite --quiet:\n{stdout}");

    let _ = hub.kill().await;
    let _ = hub.wait().await;
    let _ = hub_log_task.await;
    Ok(())
}

#[tokio::test]
async fn bench_json_report_is_parseable() -> Result<()> {
    let (mut hub, mut hub_stdout) = spawn_hub()?;
    let addr = read_hub_addr(&mut hub_stdout).await?;
    let port = addr
        .rsplit(':')
        .next()
        .context("hub address has no port")?
        .to_string();
    let hub_log_task = tokio::spawn(drain_stdout(hub_stdout));

    let bench = Command::new(BINARY)
        .args([
            "bench", "--quiet", "--json", "--warmup", "0", "127.0.0.1", &port, "2", "1",
        ])
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();
    let output = timeout(BENCH_TIMEOUT, bench)
        .await
        .context("bench did not finish in time")??;
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report["concurrency"], 2);
    assert_eq!(report["duration_secs"], 1);
    assert!(report["probes_sent"].as_u64().unwrap_or(0) > 0);

    let _ = hub.kill().await;
    let _ = hub.wait().await;
    let _ = hub_log_task.await;
    Ok(())
}

#[test]
fn bench_without_arguments_fails() {
    assert_cmd::Command::cargo_bin("chat_fanout")
        .expect("binary built")
        .args(["bench", "localhost"])
        .assert()
        .failure();
}

#[test]
fn bench_against_closed_port_still_reports() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port().to_string();
    drop(listener);

    let assert = assert_cmd::Command::cargo_bin("chat_fanout")
        .expect("binary built")
        .args(["bench", "--quiet", "--warmup", "0", "127.0.0.1", &port, "2", "1"])
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(stdout.contains("Connect Failures: 2"), "unexpected report:\n{stdout}");
    assert!(stdout.contains("No measurements were recorded"));
}

#[test]
fn quiet_json_report_ignores_rust_log() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port().to_string();
    drop(listener);

    let assert = assert_cmd::Command::cargo_bin("chat_fanout")
        .expect("binary built")
        .args([
            "bench", "--quiet", "--json", "--warmup", "0", "127.0.0.1", &port, "1", "1",
        ])
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "info")
        .assert()
        .success();
    let output = assert.get_output();

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout holds only the json report");
    assert_eq!(report["connect_failures"], 1);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("INFO"), "progress logged despite --quiet:\n{stderr}");
    assert!(!stderr.contains("WARN"), "warnings logged despite --quiet:\n{stderr}");
}

#[test]
fn bench_progress_goes_to_stderr() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port().to_string();
    drop(listener);

    let assert = assert_cmd::Command::cargo_bin("chat_fanout")
        .expect("binary built")
        .args(["bench", "--json", "--warmup", "0", "127.0.0.1", &port, "1", "1"])
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "info")
        .assert()
        .success();
    let output = assert.get_output();

    serde_json::from_slice::<serde_json::Value>(&output.stdout)
        .expect("logs stay off stdout");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("starting benchmark"), "missing progress:\n{stderr}");
}

fn spawn_hub() -> Result<(Child, BufReader<ChildStdout>)> {
    let mut child = Command::new(BINARY)
        .args(["hub", "--listen", "127.0.0.1:0", "--ws-listen", "127.0.0.1:0"])
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn hub")?;
    let stdout = child.stdout.take().context("hub stdout missing after spawn")?;
    Ok((child, BufReader::new(stdout)))
}

async fn read_hub_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    loop {
        let line = read_line(reader)
            .await?
            .context("hub exited before announcing its address")?;
        if !line.contains("tcp hub listening on") {
            continue;
        }
        let addr = line
            .split_whitespace()
            .last()
            .context("unexpected hub banner format")?;
        if !addr.contains(':') {
            return Err(anyhow!("hub banner missing socket: {line}"));
        }
        return Ok(addr.to_string());
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("timed out waiting for line"))??;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while matches!(reader.read_line(&mut buffer).await, Ok(n) if n > 0) {
        buffer.clear();
    }
}
