/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

mod demo;

use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use fieldcore::config::RuntimeConfig;
use fieldcore::data_logger::{BackendInfo, LoggerMask, LoggerSet, MemoryBackend, TdfDataLogger};
use fieldcore::runner::{start_auto_iterate, BatteryState, TaskRunner, WorkQueue};
use fieldcore::task::AppStates;
use fieldcore::time::{Clock, SystemClock};

/// How long running tasks get to honour a termination request on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ── CLI argument definition ───────────────────────────────────────────────────

/// Runs the task runner against a schedule table with the demo tasks bound.
///
/// Example:
///   fieldcore --config schedules.yaml --battery-soc 80 --duration 60
#[derive(Debug, Parser)]
#[command(
    name = "fieldcore",
    about = "Task runner with TDF logging – host demo",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML runtime configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Publish a battery measurement at startup (state of charge, %).
    #[arg(short = 'b', long = "battery-soc")]
    battery_soc: Option<u8>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(short = 'd', long = "duration")]
    duration: Option<u64>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=info).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .init();

    info!("fieldcore starting up...");

    let cli = Cli::parse();
    info!(
        config = ?cli.config,
        battery_soc = ?cli.battery_soc,
        duration = ?cli.duration,
        "Configuration"
    );

    // ── Load runtime configuration ────────────────────────────────────────────
    let config = match &cli.config {
        Some(path) => match RuntimeConfig::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load runtime configuration: {:#}", e);
                process::exit(1);
            }
        },
        None => {
            warn!("No configuration file provided, using the built-in demo schedules");
            RuntimeConfig {
                schedules: demo::default_schedules(),
                ..Default::default()
            }
        }
    };

    if let Err(e) = run(cli, config).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli, config: RuntimeConfig) -> Result<()> {
    // ── Loggers ───────────────────────────────────────────────────────────────
    let backend = Arc::new(MemoryBackend::new(
        "flash",
        BackendInfo {
            block_size: config.logger.block_size,
            block_overhead: config.logger.block_overhead,
            full_block_write: config.logger.full_block_write,
        },
    ));
    let mut loggers = LoggerSet::new();
    loggers.register(
        LoggerMask::FLASH,
        Arc::new(TdfDataLogger::new("flash", backend.clone(), config.logger.block_size)),
    );
    let loggers = Arc::new(loggers);

    // ── Task runner ───────────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let runner = TaskRunner::new(
        config.schedules.clone(),
        demo::tasks(loggers.clone(), clock.clone()),
        WorkQueue::spawn("task_runner"),
    )
    .context("Failed to initialise the task runner")?;
    info!("Bound {} schedule(s) to the demo tasks", runner.schedules().len());

    let mut events = runner.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) => info!(
                    schedule = ev.schedule_idx,
                    task_id = ev.task_id,
                    kind = ?ev.kind,
                    "schedule event"
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "schedule event log lagging")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let runner = Arc::new(Mutex::new(runner));
    let (battery_tx, battery_rx) = watch::channel(None);
    let (_app_states_tx, app_states_rx) = watch::channel(AppStates::new());
    if let Some(soc) = cli.battery_soc {
        battery_tx.send_replace(Some(BatteryState {
            soc: soc.min(100),
            voltage_mv: 0,
        }));
    }

    let auto = start_auto_iterate(
        runner.clone(),
        clock.clone(),
        battery_rx,
        app_states_rx,
        config.runner.battery_default_soc,
    );

    // ── Wait for shutdown ─────────────────────────────────────────────────────
    match cli.duration {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("Run duration elapsed");
                }
                res = tokio::signal::ctrl_c() => {
                    res.context("Failed to listen for Ctrl-C")?;
                    info!("Ctrl-C received");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Ctrl-C received");
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────
    auto.stop().await;
    runner
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .terminate_all();

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    loop {
        let remaining = {
            let mut runner = runner.lock().unwrap_or_else(PoisonError::into_inner);
            runner.reap(clock.uptime_s());
            runner.running_count()
        };
        if remaining == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(remaining, "tasks still running after shutdown grace period");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    // Dropping the runner closes the event channel and ends the event log
    drop(runner);
    let _ = event_log.await;

    if let Err(e) = loggers.flush(LoggerMask::FLASH).await {
        warn!(error = %e, errno = e.errno(), "final logger flush failed");
    }
    debug!(attempts = backend.attempts(), "flash backend writes");
    info!(blocks = backend.block_count(), "fieldcore stopped");
    Ok(())
}
