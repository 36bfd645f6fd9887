//! `run` subcommand: the long-lived routing service.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use switchlog_core::{
    AtomicConnectionState, IngestionLoop, MetricsRegistry, MetricsSnapshot, PartitionedLogSink,
    ShutdownHandle,
};
use switchlog_esl::EslClient;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use crate::cli::Cli;

/// Runs until SIGINT or SIGTERM, then reports the run's health as exit code.
pub async fn execute(cli: &Cli) -> anyhow::Result<ExitCode> {
    let metrics = Arc::new(MetricsRegistry::new());
    let sink = PartitionedLogSink::new(cli.sink_config(), Arc::clone(&metrics))
        .context("failed to prepare log directory")?;
    let sink = Arc::new(sink);

    let config = cli.ingest_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %config.endpoint.address(),
        log_dir = %sink.directory().display(),
        "switchlog starting"
    );

    let shutdown = ShutdownHandle::new();
    let ingest = IngestionLoop::new(EslClient::new(), Arc::clone(&sink), Arc::clone(&metrics), config);

    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));
    let reporter = cli.metrics_interval().map(|every| {
        tokio::spawn(report_metrics(
            Arc::clone(&metrics),
            ingest.state_handle(),
            every,
            shutdown.clone(),
        ))
    });

    let summary = ingest.run(shutdown.clone()).await;

    // The loop may also end on its own; make sure helper tasks stop.
    shutdown.trigger();
    if let Err(e) = signals.await {
        warn!(error = %e, "signal task failed");
    }
    if let Some(reporter) = reporter {
        if let Err(e) = reporter.await {
            warn!(error = %e, "metrics reporter failed");
        }
    }

    log_snapshot("final metrics", &summary.metrics, None);
    let health = summary.health();
    info!(
        health = ?health,
        connects = summary.connection.connects,
        failed_attempts = summary.connection.failed_attempts,
        cooldowns = summary.connection.cooldowns,
        "switchlog stopped"
    );

    Ok(ExitCode::from(u8::try_from(health.exit_code()).unwrap_or(1)))
}

async fn wait_for_signal(shutdown: ShutdownHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for interrupt");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("interrupt received, shutting down"),
        () = terminate => info!("terminate received, shutting down"),
        () = shutdown.cancelled() => return,
    }
    shutdown.trigger();
}

async fn report_metrics(
    metrics: Arc<MetricsRegistry>,
    state: Arc<AtomicConnectionState>,
    every: Duration,
    shutdown: ShutdownHandle,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => log_snapshot("metrics", &metrics.snapshot(), Some(&state)),
            () = shutdown.cancelled() => break,
        }
    }
}

fn log_snapshot(message: &str, snap: &MetricsSnapshot, state: Option<&AtomicConnectionState>) {
    let state = state.map_or_else(|| "stopped".to_string(), |s| s.load().to_string());
    info!(
        state = %state,
        events = snap.events_processed,
        lines = snap.logs_written,
        bytes = snap.bytes_written,
        errors = snap.errors_count,
        domains = snap.domains_count,
        duplicates = snap.duplicates_dropped,
        heartbeats = snap.heartbeats_discarded,
        reconnects = snap.reconnects,
        idle_secs = ?snap.time_since_last_event.map(|d| d.as_secs()),
        uptime_secs = snap.uptime.as_secs(),
        memory_bytes = ?snap.process_memory,
        "{message}"
    );
}
