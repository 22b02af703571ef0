//! `utilproc`
//!
//! Launches one utility process, relays its piped output to this process's
//! stdout/stderr and exits with the worker's exit code.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use utilproc_core::{
    ExitInfo, Launcher, OutputStream, StdioOption, UtilityProcessOptions, WorkerEvent,
};
use utilproc_host::TokioProcessHost;

#[derive(Parser, Debug)]
#[command(name = "utilproc")]
#[command(version, about = "Run a script as a utility process")]
struct Args {
    /// Entry script of the worker
    entry: PathBuf,

    /// Arguments passed to the entry script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Output handling: `ignore`, `inherit`, `pipe`, or three comma-separated
    /// slots such as `ignore,pipe,inherit`
    #[arg(long)]
    stdio: Option<String>,

    /// Working directory of the worker
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Service name attached to the worker
    #[arg(long)]
    service_name: Option<String>,

    /// Extra environment variable for the worker (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Interpreter argument placed before the entry script (repeatable)
    #[arg(long = "exec-arg", allow_hyphen_values = true)]
    exec_args: Vec<String>,

    /// Program that runs the entry script
    #[arg(long, env = "UTILPROC_INTERPRETER")]
    interpreter: Option<PathBuf>,

    /// JSON message posted to the worker after launch (repeatable)
    #[arg(long = "message", value_name = "JSON", value_parser = parse_json)]
    messages: Vec<Value>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, env = "UTILPROC_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "UTILPROC_LOG_JSON")]
    log_json: bool,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON message: {e}"))
}

fn stdio_option(raw: &str) -> StdioOption {
    if raw.contains(',') {
        StdioOption::Slots(raw.split(',').map(|s| s.trim().to_string()).collect())
    } else {
        StdioOption::Mode(raw.to_string())
    }
}

/// Shell convention: the exit code, or 128 + signal number.
fn exit_status(info: ExitInfo) -> u8 {
    let code = match (info.code, info.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    };
    u8::try_from(code).unwrap_or(1)
}

async fn relay_output<W>(mut stream: OutputStream, mut out: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = stream.next().await {
        out.write_all(&chunk).await?;
        out.flush().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let project_dir = std::env::current_dir().ok();
    let mut config = utilproc_core::config::load_config(project_dir.as_deref())
        .context("Failed to load settings")?;
    if let Some(interpreter) = args.interpreter.clone() {
        config.launcher.interpreter = Some(interpreter);
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let log_filter = format!("utilproc={level},utilproc_core={level},utilproc_host={level}");
    utilproc_core::tracing_init::init_tracing(&log_filter, args.log_json || config.logging.json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        entry = %args.entry.display(),
        "Starting utilproc"
    );

    let mut options = UtilityProcessOptions {
        stdio: args.stdio.as_deref().map(stdio_option),
        cwd: args.cwd,
        service_name: args.service_name,
        ..UtilityProcessOptions::default()
    };
    if !args.exec_args.is_empty() {
        options = options.with_exec_args(args.exec_args);
    }
    for (key, value) in args.env {
        options = options.with_env(key, value);
    }

    let host = Arc::new(TokioProcessHost::new(config.launcher.clone()));
    let launcher = Launcher::with_config(host, config.launcher);
    let worker = launcher.spawn(args.entry, args.args, options)?;

    worker.on_event(|event| {
        if let WorkerEvent::Other { tag, payload } = event {
            info!(tag = %tag, payload = %payload, "Worker event");
        }
        Ok(())
    });

    let mut relays = Vec::new();
    if let Some(stdout) = worker.stdout() {
        relays.push(tokio::spawn(relay_output(stdout, tokio::io::stdout())));
    }
    if let Some(stderr) = worker.stderr() {
        relays.push(tokio::spawn(relay_output(stderr, tokio::io::stderr())));
    }

    for message in args.messages {
        if !worker.send_message(message) {
            warn!("Worker exited before the message could be sent");
        }
    }

    let exit = tokio::select! {
        info = worker.wait() => info,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, terminating worker");
            worker.terminate();
            worker.wait().await
        }
    };

    for relay in relays {
        match relay.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to relay worker output"),
            Err(e) => warn!(error = %e, "Output relay task failed"),
        }
    }

    info!(code = ?exit.code, signal = ?exit.signal, "Worker finished");
    Ok(ExitCode::from(exit_status(exit)))
}
