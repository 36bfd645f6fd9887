//! Partitioned, rotating, handle-bounded log writer.
//!
//! This module provides:
//! - [`PartitionedLogSink`] - one append-only `<key>.log` per partition
//! - Buffered or immediate write modes ([`WriteMode`])
//! - Size-based rotation to `<key>_<YYYYMMDD_HHMMSS>.log`
//! - A cap on simultaneously open files with least-recently-used eviction
//!
//! All state lives behind a single mutex so `write`, `flush` and
//! `close_all` may be called from any thread.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::classifier::PartitionKey;
use crate::error::{Result, SinkError};
use crate::metrics::MetricsRegistry;

/// Default rotation threshold (100 MiB).
pub const DEFAULT_ROTATION_SIZE: u64 = 100 * 1024 * 1024;

/// Default cap on simultaneously open files.
pub const DEFAULT_MAX_OPEN_FILES: usize = 50;

/// Default per-partition buffer size that forces an early drain (1 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 1024 * 1024;

/// Default output directory.
pub const DEFAULT_LOG_DIR: &str = "/var/log/freeswitch-logs";

/// Directory used when the primary one cannot be written.
pub const DEFAULT_FALLBACK_DIR: &str = "/tmp/freeswitch-logs";

/// Extension of live and rotated files.
pub const LOG_EXTENSION: &str = "log";

const LINE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const ROTATED_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const WRITE_PROBE: &str = ".write_test";

/// When lines reach the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Lines accumulate per partition until [`PartitionedLogSink::flush`].
    #[default]
    Buffered,
    /// Every line is written to its file as soon as it arrives.
    Immediate,
}

/// Configuration for [`PartitionedLogSink`].
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Directory holding the partition files.
    pub directory: PathBuf,
    /// Directory tried once if `directory` is unusable.
    pub fallback_directory: Option<PathBuf>,
    /// Size at which a live file is rotated (bytes).
    pub rotation_size: u64,
    /// Maximum simultaneously open files.
    pub max_open_files: usize,
    /// Buffered or immediate writes.
    pub write_mode: WriteMode,
    /// Force `fsync` after every write.
    pub sync_on_write: bool,
    /// Pending bytes per partition that trigger an early drain.
    pub max_buffer_bytes: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_LOG_DIR),
            fallback_directory: Some(PathBuf::from(DEFAULT_FALLBACK_DIR)),
            rotation_size: DEFAULT_ROTATION_SIZE,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            write_mode: WriteMode::Buffered,
            sync_on_write: false,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

impl SinkConfig {
    /// Creates a config writing into `directory`, with no fallback.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            fallback_directory: None,
            ..Default::default()
        }
    }

    /// Sets the fallback directory.
    #[must_use]
    pub fn with_fallback_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fallback_directory = Some(dir.into());
        self
    }

    /// Sets the rotation threshold.
    #[must_use]
    pub const fn with_rotation_size(mut self, bytes: u64) -> Self {
        self.rotation_size = bytes;
        self
    }

    /// Sets the open-file cap.
    #[must_use]
    pub const fn with_max_open_files(mut self, max: usize) -> Self {
        self.max_open_files = max;
        self
    }

    /// Sets the write mode.
    #[must_use]
    pub const fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// Enables or disables `fsync` after every write.
    #[must_use]
    pub const fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Sets the per-partition early-drain threshold.
    #[must_use]
    pub const fn with_max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.rotation_size == 0 {
            return Err(SinkError::InvalidConfig(
                "rotation_size must be greater than 0".to_string(),
            ));
        }
        if self.max_open_files == 0 {
            return Err(SinkError::InvalidConfig(
                "max_open_files must be greater than 0".to_string(),
            ));
        }
        if self.max_buffer_bytes == 0 {
            return Err(SinkError::InvalidConfig(
                "max_buffer_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-partition state.
#[derive(Debug, Default)]
struct PartitionFile {
    file: Option<File>,
    /// Bytes in the live file since the last rotation.
    size: u64,
    pending: String,
    /// Lines held in `pending`.
    pending_lines: u64,
    /// Logical access time; larger is more recent.
    last_access: u64,
}

#[derive(Debug, Default)]
struct SinkState {
    partitions: BTreeMap<PartitionKey, PartitionFile>,
    open_handles: usize,
    clock: u64,
    closed: bool,
}

impl SinkState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Fan-out writer keeping one append-only file per partition.
pub struct PartitionedLogSink {
    config: SinkConfig,
    directory: PathBuf,
    state: Mutex<SinkState>,
    metrics: Arc<MetricsRegistry>,
}

impl std::fmt::Debug for PartitionedLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedLogSink")
            .field("directory", &self.directory)
            .field("write_mode", &self.config.write_mode)
            .field("open_handles", &self.open_handles())
            .finish()
    }
}

impl PartitionedLogSink {
    /// Creates a sink, preparing its output directory.
    ///
    /// If the configured directory cannot be created or written, the
    /// fallback directory is tried once.
    pub fn new(config: SinkConfig, metrics: Arc<MetricsRegistry>) -> Result<Self> {
        config.validate()?;
        let directory = resolve_directory(&config)?;

        info!(
            dir = %directory.display(),
            rotation_size = config.rotation_size,
            max_open_files = config.max_open_files,
            mode = ?config.write_mode,
            sync_on_write = config.sync_on_write,
            "log sink ready"
        );

        Ok(Self {
            config,
            directory,
            state: Mutex::new(SinkState::default()),
            metrics,
        })
    }

    /// Appends a timestamped line to the partition.
    ///
    /// I/O failures are recovered internally (the broken handle is dropped
    /// and reopened on the next write) and only show up in the metrics.
    /// Lines count as written once they reach the file, not when buffered.
    /// Fails only once the sink has been closed.
    pub fn write(&self, key: &PartitionKey, payload: &str) -> Result<()> {
        let line = format_line(payload);

        let mut state = self.state.lock();
        if state.closed {
            return Err(SinkError::Closed);
        }

        let tick = state.tick();
        let is_new = !state.partitions.contains_key(key);
        let entry = state.partitions.entry(key.clone()).or_default();
        entry.last_access = tick;

        match self.config.write_mode {
            WriteMode::Buffered => {
                entry.pending.push_str(&line);
                entry.pending_lines += 1;
                if entry.pending.len() >= self.config.max_buffer_bytes {
                    let content = std::mem::take(&mut entry.pending);
                    let lines = std::mem::take(&mut entry.pending_lines);
                    self.write_chunk(&mut state, key, &content, lines);
                }
            }
            WriteMode::Immediate => {
                self.write_chunk(&mut state, key, &line, 1);
            }
        }

        let partitions = state.partitions.len() as u64;
        drop(state);

        if is_new {
            self.metrics.record_domain(partitions);
            debug!(partition = %key, partitions, "new partition");
        }
        Ok(())
    }

    /// Drains every partition's buffer to disk.
    ///
    /// Returns the number of bytes written.
    pub fn flush(&self) -> u64 {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    /// Flushes and closes every handle. Idempotent.
    ///
    /// After this the sink rejects writes with [`SinkError::Closed`].
    pub fn close_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }

        let flushed = self.flush_locked(&mut state);
        for (key, partition) in &mut state.partitions {
            if let Some(file) = partition.file.take() {
                if self.config.sync_on_write {
                    if let Err(e) = file.sync_all() {
                        warn!(partition = %key, error = %e, "sync on close failed");
                    }
                }
            }
        }
        state.open_handles = 0;
        state.closed = true;

        info!(
            partitions = state.partitions.len(),
            flushed_bytes = flushed,
            "log sink closed"
        );
        Ok(())
    }

    /// Returns the directory actually in use.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Returns the path of a partition's live file.
    #[must_use]
    pub fn live_path(&self, key: &PartitionKey) -> PathBuf {
        self.directory.join(format!("{key}.{LOG_EXTENSION}"))
    }

    /// Number of currently open file handles.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.state.lock().open_handles
    }

    /// Partitions that currently hold an open handle, in key order.
    #[must_use]
    pub fn open_partitions(&self) -> Vec<PartitionKey> {
        self.state
            .lock()
            .partitions
            .iter()
            .filter(|(_, p)| p.file.is_some())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of partitions seen since startup.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.state.lock().partitions.len()
    }

    /// Bytes buffered and not yet written.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.state
            .lock()
            .partitions
            .values()
            .map(|p| p.pending.len())
            .sum()
    }

    /// Returns true once [`close_all`](Self::close_all) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // ========== Internal Methods ==========

    fn flush_locked(&self, state: &mut SinkState) -> u64 {
        let keys: Vec<PartitionKey> = state
            .partitions
            .iter()
            .filter(|(_, p)| !p.pending.is_empty())
            .map(|(k, _)| k.clone())
            .collect();

        let mut flushed = 0u64;
        for key in keys {
            // An eviction earlier in this pass may already have drained it.
            let (content, lines) = take_pending(state, &key);
            if content.is_empty() {
                continue;
            }
            if self.write_chunk(state, &key, &content, lines) {
                flushed += content.len() as u64;
            }
        }
        flushed
    }

    /// Writes `content` to the partition's live file, recovering from errors.
    ///
    /// Returns false if the content was lost.
    fn write_chunk(
        &self,
        state: &mut SinkState,
        key: &PartitionKey,
        content: &str,
        lines: u64,
    ) -> bool {
        match self.try_write_chunk(state, key, content) {
            Ok(()) => {
                self.metrics.record_write(lines, content.len() as u64);
                true
            }
            Err(e) => {
                warn!(
                    partition = %key,
                    error = %e,
                    bytes = content.len(),
                    lines,
                    "write failed, discarding handle"
                );
                discard_handle(state, key);
                self.metrics.record_error();
                false
            }
        }
    }

    fn try_write_chunk(
        &self,
        state: &mut SinkState,
        key: &PartitionKey,
        content: &str,
    ) -> io::Result<()> {
        // Opening first seeds the size of a file left by an earlier run.
        self.ensure_open(state, key)?;
        if self.rotate_if_needed(state, key, content.len() as u64) {
            self.ensure_open(state, key)?;
        }

        let entry = state
            .partitions
            .get_mut(key)
            .ok_or_else(|| io::Error::other("partition state missing"))?;
        let file = entry
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("no open handle"))?;

        file.write_all(content.as_bytes())?;
        if self.config.sync_on_write {
            file.sync_data()?;
        }
        entry.size += content.len() as u64;
        Ok(())
    }

    /// Returns true if the handle was closed and must be reopened.
    fn rotate_if_needed(&self, state: &mut SinkState, key: &PartitionKey, incoming: u64) -> bool {
        let Some(entry) = state.partitions.get_mut(key) else {
            return false;
        };
        if entry.size == 0 || entry.size + incoming < self.config.rotation_size {
            return false;
        }

        if entry.file.take().is_some() {
            state.open_handles = state.open_handles.saturating_sub(1);
        }

        let live = self.live_path(key);
        let rotated = self.rotated_path(key);
        match fs::rename(&live, &rotated) {
            Ok(()) => {
                info!(
                    partition = %key,
                    size = entry.size,
                    rotated = %rotated.display(),
                    "rotated log file"
                );
                entry.size = 0;
            }
            Err(e) => {
                // The handle is reopened on the live file and writing goes on.
                warn!(partition = %key, error = %e, "rotation failed");
                self.metrics.record_error();
            }
        }
        true
    }

    /// Picks a free name for the file being rotated out.
    ///
    /// Two rotations in the same second would collide, so later ones get a
    /// `_<n>` suffix (`<key>_<stamp>_1.log`) that falls outside the plain
    /// `<key>_<YYYYMMDD_HHMMSS>.log` pattern.
    fn rotated_path(&self, key: &PartitionKey) -> PathBuf {
        let stem = format!("{key}_{}", Utc::now().format(ROTATED_TIMESTAMP_FORMAT));
        let mut candidate = self.directory.join(format!("{stem}.{LOG_EXTENSION}"));
        let mut seq = 1u32;
        while candidate.exists() {
            candidate = self.directory.join(format!("{stem}_{seq}.{LOG_EXTENSION}"));
            seq += 1;
        }
        candidate
    }

    fn ensure_open(&self, state: &mut SinkState, key: &PartitionKey) -> io::Result<()> {
        if state.partitions.get(key).is_some_and(|p| p.file.is_some()) {
            return Ok(());
        }

        while state.open_handles >= self.config.max_open_files {
            if !self.evict_lru(state, key) {
                break;
            }
        }

        let path = self.live_path(key);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        let entry = state.partitions.entry(key.clone()).or_default();
        entry.file = Some(file);
        entry.size = size;
        state.open_handles += 1;

        debug!(partition = %key, open = state.open_handles, "opened log file");
        Ok(())
    }

    /// Closes the least recently accessed open handle other than `except`.
    fn evict_lru(&self, state: &mut SinkState, except: &PartitionKey) -> bool {
        let victim = state
            .partitions
            .iter()
            .filter(|(k, p)| p.file.is_some() && *k != except)
            .min_by_key(|(_, p)| p.last_access)
            .map(|(k, _)| k.clone());
        let Some(victim) = victim else {
            return false;
        };

        let (pending, lines) = take_pending(state, &victim);
        if !pending.is_empty() {
            self.write_chunk(state, &victim, &pending, lines);
        }

        discard_handle(state, &victim);
        debug!(partition = %victim, "evicted least recently used handle");
        true
    }
}

impl Drop for PartitionedLogSink {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            warn!(error = %e, "failed to close log sink");
        }
    }
}

fn discard_handle(state: &mut SinkState, key: &PartitionKey) {
    if let Some(entry) = state.partitions.get_mut(key) {
        if entry.file.take().is_some() {
            state.open_handles = state.open_handles.saturating_sub(1);
        }
    }
}

fn take_pending(state: &mut SinkState, key: &PartitionKey) -> (String, u64) {
    state
        .partitions
        .get_mut(key)
        .map(|p| {
            (
                std::mem::take(&mut p.pending),
                std::mem::take(&mut p.pending_lines),
            )
        })
        .unwrap_or_default()
}

fn format_line(payload: &str) -> String {
    format!("[{}] {payload}\n", Local::now().format(LINE_TIMESTAMP_FORMAT))
}

fn resolve_directory(config: &SinkConfig) -> Result<PathBuf> {
    let primary_err = match prepare_directory(&config.directory) {
        Ok(()) => return Ok(config.directory.clone()),
        Err(e) => e,
    };

    let Some(fallback) = &config.fallback_directory else {
        return Err(SinkError::NoWritableDirectory {
            primary: config.directory.clone(),
            fallback: None,
            reason: primary_err.to_string(),
        });
    };

    warn!(
        dir = %config.directory.display(),
        fallback = %fallback.display(),
        error = %primary_err,
        "log directory unusable, trying fallback"
    );

    prepare_directory(fallback)
        .map(|()| fallback.clone())
        .map_err(|e| SinkError::NoWritableDirectory {
            primary: config.directory.clone(),
            fallback: Some(fallback.clone()),
            reason: format!("{primary_err}; fallback: {e}"),
        })
}

/// Creates `dir` and checks that files can be created in it.
pub fn prepare_directory(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(WRITE_PROBE);
    File::create(&probe)?;
    fs::remove_file(&probe)
}
