//! `brainloop-daemon` — the worker binary. Wires the storage layer, the
//! command governor, the session manager, and the reader cache into one
//! process, then serves JSON-RPC requests over stdio until it receives
//! `SIGINT`/`SIGTERM` and completes the three-phase graceful shutdown of
//! §4.13.

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use brainloop_commands::{CommandRegistry, IdempotencyLedger};
use brainloop_config::Config;
use brainloop_core::WorkerId;
use brainloop_daemon::{DaemonResult, Dispatcher, ReaderCache, WorkerLifecycle, acquire_lock, validate_working_directory};
use brainloop_executor::CommandGovernor;
use brainloop_llm::{GenerationGateway, LatencyHistogram, RateLimiter};
use brainloop_session::SessionManager;
use brainloop_storage::Databases;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Notify;

/// How many retention days of latency-histogram rows to keep at startup
/// and during Phase 1 of shutdown.
const HISTOGRAM_RETENTION_DAYS: i64 = 30;

/// How long Phase 2 (draining in-flight requests) is allowed to run
/// before Phase 3 proceeds regardless, leaving headroom under
/// `LifecycleConfig::shutdown_budget_secs` for checkpoint and lock
/// release.
const PHASE2_BUDGET_SLACK_SECS: u64 = 5;

/// Worker daemon for the brainloop automated agent runtime.
#[derive(Parser)]
#[command(name = "brainloop-daemon")]
#[command(author, version, about = "brainloop worker daemon")]
struct Args {
    /// Workspace root to operate under. Overrides `brainloop.toml` and
    /// `BRAINLOOP_WORKSPACE_ROOT` if given.
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    /// Project identifier the working directory's name must contain, when
    /// `require_project_name_in_cwd` is enabled.
    #[arg(long, default_value = "brainloop")]
    project_identifier: String,

    /// Enable verbose (`debug`) logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    let log_config = brainloop_telemetry::LogConfig::new(level).with_format(brainloop_telemetry::LogFormat::Compact);
    if let Err(e) = brainloop_telemetry::setup_logging(&log_config) {
        eprintln!("failed to initialize logging: {e}");
    }

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "worker exited with an error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> DaemonResult<()> {
    let mut config = Config::load(&std::env::current_dir()?)?;
    if let Some(root) = args.workspace_root {
        config.workspace_root = root;
    }
    let data_dir = config.resolved_data_dir();

    validate_working_directory(&config.workspace_root, &data_dir, config.require_project_name_in_cwd, &args.project_identifier)?;

    let lock_path = data_dir.join(&config.lifecycle.lock_file_name);
    let lock = acquire_lock(&lock_path)?;

    let databases = Arc::new(Databases::open(&data_dir)?);

    let registry = CommandRegistry::new(Arc::clone(&databases.command_security));
    let ledger = IdempotencyLedger::new(Arc::clone(&databases.lifecycle));
    let governor = Arc::new(CommandGovernor::new(
        registry.clone(),
        Arc::clone(&databases.metadata),
        config.executor.timeout_secs,
        config.executor.max_output_bytes,
    ));

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter));
    let histogram = Arc::new(LatencyHistogram::new(Arc::clone(&databases.output)));
    let gateway = Arc::new(GenerationGateway::new(
        config.completion,
        Arc::clone(&rate_limiter),
        Arc::clone(&histogram),
        Arc::clone(&databases.output),
    ));
    let shutdown_histogram = Arc::clone(&histogram);
    let session_manager = Arc::new(SessionManager::new(
        Arc::clone(&databases.lifecycle),
        Arc::clone(&databases.output),
        ledger,
        Arc::clone(&gateway),
    ));
    let reader_cache = Arc::new(ReaderCache::new(Arc::clone(&databases.input)));

    let now = chrono::Utc::now().timestamp();
    if let Err(e) = histogram.cleanup(HISTOGRAM_RETENTION_DAYS, now) {
        tracing::warn!(error = %e, "startup latency-histogram cleanup failed");
    }

    let shutdown = Arc::new(Notify::new());
    let worker_lifecycle = Arc::new(WorkerLifecycle::new(
        WorkerId::new(),
        Arc::clone(&databases),
        Arc::clone(&reader_cache),
        Duration::from_secs(config.lifecycle.heartbeat_interval_secs),
        Arc::clone(&shutdown),
    ));

    let heartbeat_handle = {
        let worker_lifecycle = Arc::clone(&worker_lifecycle);
        tokio::spawn(async move { worker_lifecycle.run_heartbeat().await })
    };

    let dispatcher = Dispatcher::new(
        config.workspace_root.clone(),
        governor,
        registry,
        session_manager,
        Arc::clone(&databases.lifecycle),
        gateway,
        histogram,
        reader_cache,
    );

    let dispatch_handle = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(run_dispatch_loop(dispatcher, shutdown))
    };

    wait_for_signal().await;
    tracing::info!("shutdown signal received, beginning graceful shutdown");

    worker_lifecycle.begin_shutdown()?;
    let now = chrono::Utc::now().timestamp();
    if let Err(e) = shutdown_histogram.cleanup(HISTOGRAM_RETENTION_DAYS, now) {
        tracing::warn!(error = %e, "shutdown latency-histogram cleanup failed");
    }

    let drain_budget = Duration::from_secs(config.lifecycle.shutdown_budget_secs.saturating_sub(PHASE2_BUDGET_SLACK_SECS));
    if tokio::time::timeout(drain_budget, dispatch_handle).await.is_err() {
        tracing::warn!("dispatch loop did not finish draining within its shutdown budget");
    }
    heartbeat_handle.abort();

    worker_lifecycle.finish_shutdown(lock)?;
    Ok(())
}

/// Reads line-delimited JSON-RPC requests from stdin and writes responses
/// to stdout, one line per request, until `shutdown` fires or stdin
/// closes.
async fn run_dispatch_loop(dispatcher: Dispatcher, shutdown: Arc<Notify>) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            () = shutdown.notified() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                let response = dispatcher.handle_line(&line).await;
                if stdout.write_all(response.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdout.flush().await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "failed to read a line from stdin");
                break;
            }
        }
    }
}

async fn wait_for_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_with_only_defaults() {
        let args = Args::parse_from(["brainloop-daemon"]);
        assert_eq!(args.project_identifier, "brainloop");
        assert!(!args.verbose);
    }
}
