//! Command-line and environment configuration.
//!
//! Every setting can come from a flag or from the environment variable
//! named next to it, so the binary runs unchanged in a container.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use switchlog_core::{Endpoint, IngestConfig, ReconnectPolicy, SinkConfig, WriteMode};

/// Routes FreeSWITCH events into one rotating log file per domain.
#[derive(Parser, Debug, Clone)]
#[command(name = "switchlog")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Event socket connection.
    #[command(flatten)]
    pub upstream: UpstreamArgs,

    /// Log file output.
    #[command(flatten)]
    pub output: OutputArgs,

    /// Diagnostic log level (overridden by `RUST_LOG`).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Diagnostic log format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Seconds between metrics reports (0 disables them).
    #[arg(long, env = "METRICS_INTERVAL", default_value_t = 30)]
    pub metrics_interval: u64,

    /// Subcommand to execute (defaults to `run`).
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Event socket settings.
#[derive(clap::Args, Debug, Clone)]
pub struct UpstreamArgs {
    /// Event socket host.
    #[arg(long, env = "ESL_HOST", default_value = "localhost")]
    pub esl_host: String,

    /// Event socket port.
    #[arg(long, env = "ESL_PORT", default_value_t = 8021)]
    pub esl_port: u16,

    /// Event socket password.
    #[arg(long, env = "ESL_PASSWORD", default_value = "ClueCon", hide_env_values = true)]
    pub esl_password: String,

    /// Seconds between reconnect attempts.
    #[arg(long, env = "RECONNECT_DELAY", default_value_t = 5)]
    pub reconnect_delay: u64,

    /// Consecutive failures before the long cooldown.
    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value_t = 5)]
    pub max_reconnect_attempts: u32,

    /// Seconds of cooldown after repeated failures.
    #[arg(long, env = "RECONNECT_COOLDOWN", default_value_t = 30)]
    pub reconnect_cooldown: u64,

    /// Milliseconds to wait for one event.
    #[arg(long, env = "RECEIVE_TIMEOUT_MS", default_value_t = 1000)]
    pub receive_timeout_ms: u64,

    /// Events to subscribe to.
    #[arg(long, env = "EVENT_FILTER", default_value = "all")]
    pub event_filter: String,

    /// Recent event identities remembered for deduplication (0 disables).
    #[arg(long, env = "DEDUP_WINDOW", default_value_t = 10_000)]
    pub dedup_window: usize,
}

/// Log file settings.
#[derive(clap::Args, Debug, Clone)]
pub struct OutputArgs {
    /// Directory for per-domain log files.
    #[arg(long, env = "LOG_DIR", default_value = "/var/log/freeswitch-logs")]
    pub log_dir: PathBuf,

    /// Directory used when `LOG_DIR` is not writable.
    #[arg(long, env = "LOG_FALLBACK_DIR", default_value = "/tmp/freeswitch-logs")]
    pub log_fallback_dir: PathBuf,

    /// Rotate a file once it reaches this many bytes.
    #[arg(long, env = "FILE_ROTATION_SIZE", default_value_t = 104_857_600)]
    pub file_rotation_size: u64,

    /// Seconds between buffer flushes.
    #[arg(long, env = "BUFFER_FLUSH_INTERVAL", default_value_t = 5)]
    pub buffer_flush_interval: u64,

    /// Maximum simultaneously open log files.
    #[arg(long, env = "MAX_OPEN_FILES", default_value_t = 50)]
    pub max_open_files: usize,

    /// Sync every write to disk.
    #[arg(long, env = "SYNC_ON_WRITE")]
    pub sync_on_write: bool,

    /// When lines reach disk.
    #[arg(long, env = "WRITE_MODE", value_enum, default_value_t = WriteModeArg::Buffered)]
    pub write_mode: WriteModeArg,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Route events until interrupted.
    Run,

    /// Probe the event socket and the log directory, then exit.
    Check {
        /// Report format.
        #[arg(short, long, value_enum, default_value_t = Format::Table)]
        format: Format,

        /// Seconds to wait for a sample event.
        #[arg(long, default_value_t = 5)]
        event_wait: u64,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Diagnostic log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Write mode as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum WriteModeArg {
    /// Buffer lines and flush periodically.
    #[default]
    Buffered,
    /// Write every line as it arrives.
    Immediate,
}

impl From<WriteModeArg> for WriteMode {
    fn from(arg: WriteModeArg) -> Self {
        match arg {
            WriteModeArg::Buffered => Self::Buffered,
            WriteModeArg::Immediate => Self::Immediate,
        }
    }
}

impl Cli {
    /// Upstream address and credentials.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(
            self.upstream.esl_host.clone(),
            self.upstream.esl_port,
            self.upstream.esl_password.clone(),
        )
    }

    /// Sink settings.
    #[must_use]
    pub fn sink_config(&self) -> SinkConfig {
        let out = &self.output;
        SinkConfig::new(&out.log_dir)
            .with_fallback_directory(&out.log_fallback_dir)
            .with_rotation_size(out.file_rotation_size)
            .with_max_open_files(out.max_open_files)
            .with_write_mode(out.write_mode.into())
            .with_sync_on_write(out.sync_on_write)
    }

    /// Ingestion loop settings.
    #[must_use]
    pub fn ingest_config(&self) -> IngestConfig {
        let up = &self.upstream;
        IngestConfig::new(self.endpoint())
            .with_poll_timeout(Duration::from_millis(up.receive_timeout_ms))
            .with_flush_interval(Duration::from_secs(self.output.buffer_flush_interval))
            .with_dedup_window(up.dedup_window)
            .with_event_filter(up.event_filter.clone())
            .with_reconnect(ReconnectPolicy::new(
                Duration::from_secs(up.reconnect_delay),
                up.max_reconnect_attempts,
                Duration::from_secs(up.reconnect_cooldown),
            ))
    }

    /// Interval between metrics reports, or `None` if disabled.
    #[must_use]
    pub const fn metrics_interval(&self) -> Option<Duration> {
        if self.metrics_interval == 0 {
            None
        } else {
            Some(Duration::from_secs(self.metrics_interval))
        }
    }
}
