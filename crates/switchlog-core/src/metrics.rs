//! Engine counters.
//!
//! A single [`MetricsRegistry`] is shared between the sink, the ingestion
//! loop and whatever reporter the host process runs. All counters sit behind
//! one mutex; a [`MetricsSnapshot`] is a consistent copy of them.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Debug, Default)]
struct Counters {
    events_processed: u64,
    logs_written: u64,
    bytes_written: u64,
    errors_count: u64,
    domains_count: u64,
    duplicates_dropped: u64,
    heartbeats_discarded: u64,
    reconnects: u64,
    last_event: Option<Instant>,
}

/// Thread-safe engine counters.
#[derive(Debug)]
pub struct MetricsRegistry {
    counters: Mutex<Counters>,
    started: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Creates a registry with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
        }
    }

    /// Records an event accepted for routing.
    pub fn record_event(&self) {
        let mut c = self.counters.lock();
        c.events_processed += 1;
        c.last_event = Some(Instant::now());
    }

    /// Records `lines` log lines totalling `bytes` bytes that reached a file.
    pub fn record_write(&self, lines: u64, bytes: u64) {
        let mut c = self.counters.lock();
        c.logs_written += lines;
        c.bytes_written += bytes;
    }

    /// Records the current number of known partitions.
    pub fn record_domain(&self, count: u64) {
        self.counters.lock().domains_count = count;
    }

    /// Records a failure that was recovered from.
    pub fn record_error(&self) {
        self.counters.lock().errors_count += 1;
    }

    /// Records an event dropped by the deduplication window.
    pub fn record_duplicate(&self) {
        self.counters.lock().duplicates_dropped += 1;
    }

    /// Records a keep-alive event discarded before classification.
    pub fn record_heartbeat(&self) {
        self.counters.lock().heartbeats_discarded += 1;
    }

    /// Records a successful reconnect after a lost or failed connection.
    pub fn record_reconnect(&self) {
        self.counters.lock().reconnects += 1;
    }

    /// Returns a point-in-time copy of the counters.
    ///
    /// Samples the process resident memory as a side effect.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self.counters_snapshot();
        snapshot.process_memory = process_memory_bytes();
        snapshot
    }

    /// Like [`snapshot`](Self::snapshot) but without sampling process memory.
    #[must_use]
    pub fn counters_snapshot(&self) -> MetricsSnapshot {
        let c = self.counters.lock();
        MetricsSnapshot {
            events_processed: c.events_processed,
            logs_written: c.logs_written,
            bytes_written: c.bytes_written,
            errors_count: c.errors_count,
            domains_count: c.domains_count,
            duplicates_dropped: c.duplicates_dropped,
            heartbeats_discarded: c.heartbeats_discarded,
            reconnects: c.reconnects,
            time_since_last_event: c.last_event.map(|t| t.elapsed()),
            uptime: self.started.elapsed(),
            process_memory: None,
        }
    }
}

/// A consistent copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Events accepted for routing.
    pub events_processed: u64,
    /// Log lines that reached a file.
    pub logs_written: u64,
    /// Bytes that reached a file, including timestamps and newlines.
    pub bytes_written: u64,
    /// Recovered failures (I/O, rotation, upstream).
    pub errors_count: u64,
    /// Partitions known to the sink.
    pub domains_count: u64,
    /// Events dropped as duplicates.
    pub duplicates_dropped: u64,
    /// Keep-alive events discarded.
    pub heartbeats_discarded: u64,
    /// Successful reconnects.
    pub reconnects: u64,
    /// Time since the last accepted event, if any.
    #[serde(serialize_with = "serialize_opt_secs")]
    pub time_since_last_event: Option<Duration>,
    /// Time since the registry was created.
    #[serde(serialize_with = "serialize_secs")]
    pub uptime: Duration,
    /// Resident memory of this process in bytes, if it could be sampled.
    pub process_memory: Option<u64>,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

#[allow(clippy::ref_option)]
fn serialize_opt_secs<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

/// Samples the resident memory of the current process.
#[must_use]
pub fn process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    system.process(pid).map(sysinfo::Process::memory)
}
