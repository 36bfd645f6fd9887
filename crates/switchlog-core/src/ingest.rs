//! Ingestion loop: pulls events from a source and routes them to the sink.
//!
//! The loop owns the connection lifecycle:
//!
//! ```text
//! Disconnected ──▶ Connecting ──ok──▶ Connected ──lost──▶ Disconnected
//!                      │                  │
//!                     err              shutdown
//!                      ▼                  ▼
//!                 BackoffWait         (terminal)
//! ```
//!
//! It is the only place that awaits the upstream or sleeps during backoff.
//! Shutdown is requested through a [`ShutdownHandle`]; the loop then
//! disconnects the source and flushes and closes the sink before returning a
//! [`RunSummary`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::classifier::DomainClassifier;
use crate::dedup::{DEFAULT_DEDUP_WINDOW, RecencyWindow};
use crate::event::Event;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::sink::PartitionedLogSink;
use crate::source::{Endpoint, EventSource, SourceResult};
use crate::state::{AtomicConnectionState, ConnectionState};

/// Default bounded wait for one event.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default interval between periodic sink flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default pause after a transient upstream error.
pub const DEFAULT_TRANSIENT_PAUSE: Duration = Duration::from_secs(1);

/// Default subscription format.
pub const DEFAULT_EVENT_CLASS: &str = "plain";

/// Default subscription filter.
pub const DEFAULT_EVENT_FILTER: &str = "all";

/// Configuration for [`IngestionLoop`].
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Upstream to connect to.
    pub endpoint: Endpoint,
    /// Bounded wait for one event.
    pub poll_timeout: Duration,
    /// Interval between periodic sink flushes.
    pub flush_interval: Duration,
    /// Number of recent event identities remembered for deduplication.
    pub dedup_window: usize,
    /// Subscription format.
    pub event_class: String,
    /// Subscription filter.
    pub event_filter: String,
    /// Reconnect schedule.
    pub reconnect: ReconnectPolicy,
    /// Pause after a transient upstream error.
    pub transient_pause: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            event_class: DEFAULT_EVENT_CLASS.to_string(),
            event_filter: DEFAULT_EVENT_FILTER.to_string(),
            reconnect: ReconnectPolicy::default(),
            transient_pause: DEFAULT_TRANSIENT_PAUSE,
        }
    }
}

impl IngestConfig {
    /// Creates a config for the given upstream.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    /// Sets the poll timeout.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the flush interval.
    #[must_use]
    pub const fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the deduplication window size.
    #[must_use]
    pub const fn with_dedup_window(mut self, size: usize) -> Self {
        self.dedup_window = size;
        self
    }

    /// Sets the subscription filter.
    #[must_use]
    pub fn with_event_filter(mut self, filter: impl Into<String>) -> Self {
        self.event_filter = filter.into();
        self
    }

    /// Sets the reconnect schedule.
    #[must_use]
    pub const fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the pause after transient errors.
    #[must_use]
    pub const fn with_transient_pause(mut self, pause: Duration) -> Self {
        self.transient_pause = pause;
        self
    }
}

/// Cloneable handle used to request a graceful stop.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    /// Creates a handle that has not been triggered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Returns true once shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Connection counters kept by the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Successful connect-and-subscribe sequences.
    pub connects: u64,
    /// Failed connect or subscribe attempts.
    pub failed_attempts: u64,
    /// Times the long cooldown was entered.
    pub cooldowns: u64,
    /// Established connections that were lost.
    pub disconnects: u64,
    /// Current run of consecutive failures.
    pub consecutive_failures: u32,
}

/// Outcome of one [`IngestionLoop::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Final counters.
    pub metrics: MetricsSnapshot,
    /// Connection counters.
    pub connection: ConnectionStats,
    /// Lines rendered and handed to the sink.
    pub lines_routed: u64,
}

/// Overall verdict on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Nothing went wrong.
    Healthy,
    /// Errors or reconnects happened, but logs were produced.
    Degraded,
    /// The upstream was never reached, or nothing could be written.
    Failed,
}

impl HealthState {
    /// Process exit code for this state.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Healthy | Self::Degraded => 0,
            Self::Failed => 1,
        }
    }
}

impl RunSummary {
    /// Classifies the run.
    #[must_use]
    pub const fn health(&self) -> HealthState {
        if self.connection.connects == 0
            || (self.lines_routed > 0 && self.metrics.logs_written == 0)
        {
            HealthState::Failed
        } else if self.metrics.errors_count > 0
            || self.metrics.reconnects > 0
            || self.connection.failed_attempts > 0
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }
}

/// Drives an [`EventSource`] into a [`PartitionedLogSink`].
pub struct IngestionLoop<S: EventSource> {
    source: S,
    sink: Arc<PartitionedLogSink>,
    metrics: Arc<MetricsRegistry>,
    classifier: DomainClassifier,
    config: IngestConfig,
    dedup: RecencyWindow<(String, String)>,
    state: Arc<AtomicConnectionState>,
    stats: ConnectionStats,
    lines_routed: u64,
}

impl<S: EventSource> IngestionLoop<S> {
    /// Creates a loop that has not started yet.
    #[must_use]
    pub fn new(
        source: S,
        sink: Arc<PartitionedLogSink>,
        metrics: Arc<MetricsRegistry>,
        config: IngestConfig,
    ) -> Self {
        Self {
            source,
            sink,
            metrics,
            classifier: DomainClassifier::new(),
            dedup: RecencyWindow::new(config.dedup_window),
            config,
            state: Arc::new(AtomicConnectionState::default()),
            stats: ConnectionStats::default(),
            lines_routed: 0,
        }
    }

    /// Shared view of the connection state, readable from other tasks.
    #[must_use]
    pub fn state_handle(&self) -> Arc<AtomicConnectionState> {
        Arc::clone(&self.state)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Runs until `shutdown` is triggered.
    pub async fn run(mut self, shutdown: ShutdownHandle) -> RunSummary {
        info!(
            endpoint = %self.config.endpoint.address(),
            filter = %self.config.event_filter,
            "ingestion loop starting"
        );
        let mut last_flush = Instant::now();

        while !shutdown.is_triggered() {
            if self.state.load() == ConnectionState::Connected {
                self.poll_once(&shutdown).await;
                if last_flush.elapsed() >= self.config.flush_interval {
                    let flushed = self.sink.flush();
                    trace!(bytes = flushed, "periodic flush");
                    last_flush = Instant::now();
                }
            } else if !self.connect_once(&shutdown).await {
                break;
            }
        }

        self.finish().await
    }

    /// One connect attempt plus its backoff. Returns false if interrupted.
    async fn connect_once(&mut self, shutdown: &ShutdownHandle) -> bool {
        self.state.store(ConnectionState::Connecting);

        match self.establish().await {
            Ok(()) => {
                if self.stats.connects > 0 {
                    self.metrics.record_reconnect();
                }
                self.stats.connects += 1;
                self.stats.consecutive_failures = 0;
                self.state.store(ConnectionState::Connected);
                info!(
                    endpoint = %self.config.endpoint.address(),
                    connects = self.stats.connects,
                    "connected and subscribed"
                );
                true
            }
            Err(e) => {
                self.stats.failed_attempts += 1;
                self.stats.consecutive_failures += 1;
                self.metrics.record_error();
                if let Err(e) = self.source.disconnect().await {
                    debug!(error = %e, "cleanup after failed connect");
                }

                self.state.store(ConnectionState::BackoffWait);
                self.sink.flush();

                let attempt = self.stats.consecutive_failures;
                let backoff = self.config.reconnect.after_failure(attempt);
                match backoff {
                    Backoff::Retry(delay) => warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "connection failed, retrying"
                    ),
                    Backoff::Cooldown(delay) => {
                        warn!(
                            error = %e,
                            attempt,
                            cooldown_ms = delay.as_millis() as u64,
                            "connection failed repeatedly, cooling down"
                        );
                        self.stats.cooldowns += 1;
                        self.stats.consecutive_failures = 0;
                    }
                }
                sleep_or_shutdown(backoff.delay(), shutdown).await
            }
        }
    }

    async fn establish(&mut self) -> SourceResult<()> {
        self.source.connect(&self.config.endpoint).await?;
        self.source
            .subscribe(&self.config.event_class, &self.config.event_filter)
            .await
    }

    async fn poll_once(&mut self, shutdown: &ShutdownHandle) {
        if !self.source.is_connected() {
            warn!("upstream reports not connected");
            self.connection_lost().await;
            return;
        }

        match self.source.recv_timeout(self.config.poll_timeout).await {
            Ok(Some(event)) => self.handle_event(&event),
            Ok(None) => {}
            Err(e) if e.is_transient() && self.source.is_connected() => {
                warn!(error = %e, "transient upstream error");
                self.metrics.record_error();
                sleep_or_shutdown(self.config.transient_pause, shutdown).await;
            }
            Err(e) => {
                warn!(error = %e, "receive failed");
                self.metrics.record_error();
                self.connection_lost().await;
            }
        }
    }

    async fn connection_lost(&mut self) {
        self.stats.disconnects += 1;
        if let Err(e) = self.source.disconnect().await {
            debug!(error = %e, "disconnect after lost connection");
        }
        self.sink.flush();
        self.state.store(ConnectionState::Disconnected);
    }

    fn handle_event(&mut self, event: &Event) {
        if event.is_heartbeat() {
            self.metrics.record_heartbeat();
            trace!("heartbeat discarded");
            return;
        }

        // Only keyed events take a slot in the window.
        if let Some(key) = event.dedup_key() {
            if !self.dedup.insert(key) {
                self.metrics.record_duplicate();
                debug!(event = ?event.name(), "duplicate event dropped");
                return;
            }
        }

        self.metrics.record_event();
        let Some(line) = event.render() else {
            trace!(event = ?event.name(), "event has nothing to write");
            return;
        };

        let partition = self.classifier.classify(event, &line);
        self.lines_routed += 1;
        trace!(partition = %partition, "routing line");

        if let Err(e) = self.sink.write(&partition, &line) {
            warn!(partition = %partition, error = %e, "write rejected");
            self.metrics.record_error();
        }
    }

    async fn finish(mut self) -> RunSummary {
        info!("ingestion loop stopping");

        if let Err(e) = self.source.disconnect().await {
            warn!(error = %e, "disconnect on shutdown failed");
        }
        self.state.store(ConnectionState::Disconnected);

        if let Err(e) = self.sink.close_all() {
            warn!(error = %e, "failed to close log sink");
            self.metrics.record_error();
        }

        let summary = RunSummary {
            metrics: self.metrics.snapshot(),
            connection: self.stats,
            lines_routed: self.lines_routed,
        };
        info!(
            events = summary.metrics.events_processed,
            lines = summary.lines_routed,
            errors = summary.metrics.errors_count,
            connects = summary.connection.connects,
            health = ?summary.health(),
            "ingestion loop stopped"
        );
        summary
    }
}

/// Sleeps for `delay` unless shutdown comes first. Returns false if interrupted.
async fn sleep_or_shutdown(delay: Duration, shutdown: &ShutdownHandle) -> bool {
    tokio::select! {
        () = sleep(delay) => true,
        () = shutdown.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::sink::{SinkConfig, WriteMode};
    use crate::source::SourceFuture;
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use test_case::test_case;

    enum Step {
        Deliver(Event),
        Protocol,
        Reset,
    }

    /// Scripted upstream. Triggers shutdown once its script runs dry, unless
    /// `idle_when_done` is set, in which case it waits out every poll.
    struct ScriptedSource {
        steps: VecDeque<Step>,
        connected: bool,
        fail_connects: u32,
        connects: Arc<AtomicU32>,
        disconnects: Arc<AtomicU32>,
        shutdown: ShutdownHandle,
        shutdown_at_connect: Option<u32>,
        idle_when_done: bool,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>, shutdown: &ShutdownHandle) -> Self {
            Self {
                steps: steps.into(),
                connected: false,
                fail_connects: 0,
                connects: Arc::new(AtomicU32::new(0)),
                disconnects: Arc::new(AtomicU32::new(0)),
                shutdown: shutdown.clone(),
                shutdown_at_connect: None,
                idle_when_done: false,
            }
        }
    }

    impl EventSource for ScriptedSource {
        fn connect<'a>(&'a mut self, _endpoint: &'a Endpoint) -> SourceFuture<'a, ()> {
            Box::pin(async move {
                let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
                if self.shutdown_at_connect == Some(n) {
                    self.shutdown.trigger();
                }
                if n <= self.fail_connects {
                    return Err(SourceError::Connect("connection refused".to_string()));
                }
                self.connected = true;
                Ok(())
            })
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn subscribe<'a>(&'a mut self, _class: &'a str, _filter: &'a str) -> SourceFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn recv_timeout(&mut self, timeout: Duration) -> SourceFuture<'_, Option<Event>> {
            Box::pin(async move {
                match self.steps.pop_front() {
                    Some(Step::Deliver(event)) => Ok(Some(event)),
                    Some(Step::Protocol) => Err(SourceError::Protocol("garbled frame".to_string())),
                    Some(Step::Reset) => {
                        self.connected = false;
                        Err(SourceError::Io(std::io::Error::from(
                            std::io::ErrorKind::ConnectionReset,
                        )))
                    }
                    None if self.idle_when_done => {
                        sleep(timeout).await;
                        Ok(None)
                    }
                    None => {
                        self.shutdown.trigger();
                        Ok(None)
                    }
                }
            })
        }

        fn disconnect(&mut self) -> SourceFuture<'_, ()> {
            Box::pin(async move {
                self.connected = false;
                self.disconnects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    struct Harness {
        dir: TempDir,
        sink: Arc<PartitionedLogSink>,
        metrics: Arc<MetricsRegistry>,
    }

    impl Harness {
        fn new(mode: WriteMode) -> Self {
            let dir = TempDir::new().expect("temp dir");
            let metrics = Arc::new(MetricsRegistry::new());
            let sink = Arc::new(
                PartitionedLogSink::new(
                    SinkConfig::new(dir.path()).with_write_mode(mode),
                    Arc::clone(&metrics),
                )
                .expect("create sink"),
            );
            Self { dir, sink, metrics }
        }

        async fn run(&self, source: ScriptedSource, shutdown: ShutdownHandle) -> RunSummary {
            let ingest = IngestionLoop::new(
                source,
                Arc::clone(&self.sink),
                Arc::clone(&self.metrics),
                IngestConfig::default(),
            );
            ingest.run(shutdown).await
        }

        fn lines(&self, partition: &str) -> Vec<String> {
            fs::read_to_string(self.dir.path().join(format!("{partition}.log")))
                .map(|s| s.lines().map(str::to_string).collect())
                .unwrap_or_default()
        }
    }

    fn channel_event(uuid: &str, domain: &str) -> Event {
        Event::named("CHANNEL_CREATE")
            .with_header("Unique-ID", uuid)
            .with_header("variable_domain_name", domain)
    }

    fn log_event(body: &str) -> Event {
        Event::named("LOG").with_body(body)
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_enter_cooldown_and_reset_counter() {
        let harness = Harness::new(WriteMode::Buffered);
        let shutdown = ShutdownHandle::new();
        let mut source = ScriptedSource::new(vec![], &shutdown);
        source.fail_connects = 6;
        source.shutdown_at_connect = Some(6);
        let connects = Arc::clone(&source.connects);

        let started = Instant::now();
        let summary = harness.run(source, shutdown).await;
        let elapsed = started.elapsed();

        assert_eq!(connects.load(Ordering::SeqCst), 6);
        assert_eq!(summary.connection.failed_attempts, 6);
        assert_eq!(summary.connection.cooldowns, 1);
        assert_eq!(summary.connection.consecutive_failures, 1);
        // Four ordinary delays plus one cooldown.
        assert!(elapsed >= Duration::from_secs(4 * 5 + 30));
        assert!(elapsed < Duration::from_secs(4 * 5 + 30 + 5));
        assert_eq!(summary.health(), HealthState::Failed);
        assert_eq!(summary.health().exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_failed_attempts() {
        let harness = Harness::new(WriteMode::Immediate);
        let shutdown = ShutdownHandle::new();
        let mut source = ScriptedSource::new(
            vec![Step::Deliver(channel_event("u1", "a.com"))],
            &shutdown,
        );
        source.fail_connects = 2;

        let summary = harness.run(source, shutdown).await;
        assert_eq!(summary.connection.connects, 1);
        assert_eq!(summary.connection.failed_attempts, 2);
        assert_eq!(summary.connection.consecutive_failures, 0);
        assert_eq!(harness.lines("a.com").len(), 1);
        assert_eq!(summary.health(), HealthState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_event_is_written_once() {
        let harness = Harness::new(WriteMode::Buffered);
        let shutdown = ShutdownHandle::new();
        let source = ScriptedSource::new(
            vec![
                Step::Deliver(channel_event("u1", "a.com")),
                Step::Deliver(channel_event("u1", "a.com")),
                Step::Deliver(channel_event("u2", "a.com")),
            ],
            &shutdown,
        );

        let summary = harness.run(source, shutdown).await;
        assert_eq!(harness.lines("a.com").len(), 2);
        assert_eq!(summary.metrics.duplicates_dropped, 1);
        assert_eq!(summary.metrics.events_processed, 2);
        assert_eq!(summary.health(), HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_is_discarded() {
        let harness = Harness::new(WriteMode::Buffered);
        let shutdown = ShutdownHandle::new();
        let source = ScriptedSource::new(
            vec![
                Step::Deliver(Event::named("HEARTBEAT").with_header("Event-Sequence", "1")),
                Step::Deliver(log_event("sofia.c:10 REGISTER 1000@pbx.example.com\n")),
            ],
            &shutdown,
        );

        let summary = harness.run(source, shutdown).await;
        assert_eq!(summary.metrics.heartbeats_discarded, 1);
        assert_eq!(summary.metrics.events_processed, 1);
        assert_eq!(harness.sink.partition_count(), 1);
        let lines = harness.lines("pbx.example.com");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("sofia.c:10 REGISTER 1000@pbx.example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn unclassifiable_event_goes_to_unknown() {
        let harness = Harness::new(WriteMode::Buffered);
        let shutdown = ShutdownHandle::new();
        let source = ScriptedSource::new(
            vec![Step::Deliver(log_event("switch_core.c:99 nothing here"))],
            &shutdown,
        );

        harness.run(source, shutdown).await;
        assert_eq!(harness.lines("unknown").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_reconnects() {
        let harness = Harness::new(WriteMode::Buffered);
        let shutdown = ShutdownHandle::new();
        let source = ScriptedSource::new(
            vec![
                Step::Deliver(channel_event("u1", "a.com")),
                Step::Reset,
                Step::Deliver(channel_event("u2", "b.com")),
            ],
            &shutdown,
        );
        let connects = Arc::clone(&source.connects);

        let summary = harness.run(source, shutdown).await;
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(summary.connection.disconnects, 1);
        assert_eq!(summary.metrics.reconnects, 1);
        assert_eq!(harness.lines("a.com").len(), 1);
        assert_eq!(harness.lines("b.com").len(), 1);
        assert_eq!(summary.health(), HealthState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_keeps_connection() {
        let harness = Harness::new(WriteMode::Buffered);
        let shutdown = ShutdownHandle::new();
        let source = ScriptedSource::new(
            vec![Step::Protocol, Step::Deliver(channel_event("u1", "a.com"))],
            &shutdown,
        );

        let summary = harness.run(source, shutdown).await;
        assert_eq!(summary.connection.connects, 1);
        assert_eq!(summary.connection.disconnects, 0);
        assert_eq!(summary.metrics.errors_count, 1);
        assert_eq!(harness.lines("a.com").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disconnects_and_closes_sink() {
        let harness = Harness::new(WriteMode::Buffered);
        let shutdown = ShutdownHandle::new();
        let source = ScriptedSource::new(
            vec![Step::Deliver(channel_event("u1", "a.com"))],
            &shutdown,
        );
        let disconnects = Arc::clone(&source.disconnects);

        let ingest = IngestionLoop::new(
            source,
            Arc::clone(&harness.sink),
            Arc::clone(&harness.metrics),
            IngestConfig::default(),
        );
        let state = ingest.state_handle();
        let summary = ingest.run(shutdown).await;

        assert!(harness.sink.is_closed());
        assert_eq!(harness.lines("a.com").len(), 1);
        assert!(disconnects.load(Ordering::SeqCst) >= 1);
        assert_eq!(state.load(), ConnectionState::Disconnected);
        assert_eq!(summary.lines_routed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unwritable_partition_fails_the_run() {
        let harness = Harness::new(WriteMode::Immediate);
        fs::create_dir(harness.dir.path().join("a.com.log")).expect("create blocking dir");
        let shutdown = ShutdownHandle::new();
        let source = ScriptedSource::new(
            vec![Step::Deliver(channel_event("u1", "a.com"))],
            &shutdown,
        );

        let summary = harness.run(source, shutdown).await;
        assert_eq!(summary.lines_routed, 1);
        assert_eq!(summary.metrics.logs_written, 0);
        assert_eq!(summary.metrics.bytes_written, 0);
        assert!(summary.metrics.errors_count >= 1);
        assert_eq!(summary.health(), HealthState::Failed);
        assert_eq!(summary.health().exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_lines_flush_while_running() {
        let harness = Harness::new(WriteMode::Buffered);
        let shutdown = ShutdownHandle::new();
        let mut source = ScriptedSource::new(
            vec![Step::Deliver(channel_event("u1", "a.com"))],
            &shutdown,
        );
        source.idle_when_done = true;

        let ingest = IngestionLoop::new(
            source,
            Arc::clone(&harness.sink),
            Arc::clone(&harness.metrics),
            IngestConfig::default().with_flush_interval(Duration::from_secs(5)),
        );
        let task = tokio::spawn(ingest.run(shutdown.clone()));

        sleep(Duration::from_secs(2)).await;
        assert!(harness.lines("a.com").is_empty());
        assert_eq!(harness.metrics.counters_snapshot().logs_written, 0);

        sleep(Duration::from_secs(5)).await;
        assert!(!harness.sink.is_closed());
        assert_eq!(harness.lines("a.com").len(), 1);
        assert_eq!(harness.metrics.counters_snapshot().logs_written, 1);

        shutdown.trigger();
        let summary = task.await.expect("loop task");
        assert_eq!(summary.health(), HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let harness = Harness::new(WriteMode::Buffered);
        let shutdown = ShutdownHandle::new();
        let mut source = ScriptedSource::new(vec![], &shutdown);
        source.fail_connects = u32::MAX;

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(7)).await;
            trigger.trigger();
        });

        let started = Instant::now();
        let summary = harness.run(source, shutdown).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(summary.connection.failed_attempts, 2);
    }

    #[test]
    fn shutdown_handle_is_shared() {
        let handle = ShutdownHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_triggered());
        handle.trigger();
        handle.trigger();
        assert!(clone.is_triggered());
    }

    fn summary(connects: u64, routed: u64, written: u64, errors: u64) -> RunSummary {
        RunSummary {
            metrics: MetricsSnapshot {
                logs_written: written,
                errors_count: errors,
                ..Default::default()
            },
            connection: ConnectionStats {
                connects,
                ..Default::default()
            },
            lines_routed: routed,
        }
    }

    #[test_case(summary(1, 10, 10, 0) => HealthState::Healthy ; "clean run")]
    #[test_case(summary(1, 0, 0, 0) => HealthState::Healthy ; "quiet run")]
    #[test_case(summary(1, 10, 10, 3) => HealthState::Degraded ; "recovered errors")]
    #[test_case(summary(0, 0, 0, 5) => HealthState::Failed ; "never connected")]
    #[test_case(summary(1, 10, 0, 10) => HealthState::Failed ; "nothing written")]
    fn test_health(summary: RunSummary) -> HealthState {
        summary.health()
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(HealthState::Healthy.exit_code(), 0);
        assert_eq!(HealthState::Degraded.exit_code(), 0);
        assert_eq!(HealthState::Failed.exit_code(), 1);
    }
}
