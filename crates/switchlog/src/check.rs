//! `check` subcommand: connectivity and output-directory diagnostics.

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use serde::Serialize;
use switchlog_core::sink::prepare_directory;
use switchlog_core::{Endpoint, EventSource};
use switchlog_esl::EslClient;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::debug;

use crate::cli::{Cli, Format};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// The probe succeeded.
    Pass,
    /// Not fatal, but worth a look.
    Warn,
    /// The probe failed.
    Fail,
    /// Not run because an earlier probe failed.
    Skipped,
}

impl ProbeStatus {
    const fn label(self) -> &'static str {
        match self {
            Self::Pass => " OK ",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
            Self::Skipped => "SKIP",
        }
    }
}

/// One line of the report.
#[derive(Debug, Clone, Serialize)]
pub struct Probe {
    /// What was probed.
    pub name: &'static str,
    /// Outcome.
    pub status: ProbeStatus,
    /// Human-readable detail.
    pub detail: String,
}

impl Probe {
    fn new(name: &'static str, status: ProbeStatus, detail: impl Into<String>) -> Self {
        Self {
            name,
            status,
            detail: detail.into(),
        }
    }
}

/// Full diagnostic report.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    /// Upstream that was probed.
    pub endpoint: String,
    /// Probes in the order they ran.
    pub probes: Vec<Probe>,
}

impl CheckReport {
    /// Returns true if no probe failed or was skipped.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.probes
            .iter()
            .all(|p| matches!(p.status, ProbeStatus::Pass | ProbeStatus::Warn))
    }

    /// Writes the report as aligned text.
    pub fn write_table<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "switchlog check against {}", self.endpoint)?;
        for probe in &self.probes {
            writeln!(w, "[{}] {:<10} {}", probe.status.label(), probe.name, probe.detail)?;
        }
        let verdict = if self.passed() { "all checks passed" } else { "checks failed" };
        writeln!(w, "{verdict}")
    }

    /// Writes the report in the requested format.
    pub fn write<W: Write>(&self, w: &mut W, format: Format) -> anyhow::Result<()> {
        match format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *w, self)?;
                writeln!(w)?;
            }
            Format::Table => self.write_table(w)?,
        }
        Ok(())
    }
}

/// Runs the `check` subcommand.
pub async fn execute(cli: &Cli, format: Format, event_wait: u64) -> anyhow::Result<ExitCode> {
    let config = cli.ingest_config();
    let report = run_probes(
        &config.endpoint,
        &config.event_class,
        &config.event_filter,
        Duration::from_secs(event_wait),
        &cli.output.log_dir,
        Some(&cli.output.log_fallback_dir),
    )
    .await;

    report.write(&mut io::stdout().lock(), format)?;
    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Probes the upstream and the log directory.
pub async fn run_probes(
    endpoint: &Endpoint,
    class: &str,
    filter: &str,
    event_wait: Duration,
    log_dir: &Path,
    fallback_dir: Option<&Path>,
) -> CheckReport {
    let mut probes = probe_upstream(endpoint, class, filter, event_wait).await;
    probes.push(probe_directory(log_dir, fallback_dir));
    CheckReport {
        endpoint: endpoint.address(),
        probes,
    }
}

async fn probe_upstream(
    endpoint: &Endpoint,
    class: &str,
    filter: &str,
    event_wait: Duration,
) -> Vec<Probe> {
    let mut probes = Vec::with_capacity(4);
    let skip_rest = |probes: &mut Vec<Probe>, from: usize| {
        for name in ["auth", "subscribe", "event"].into_iter().skip(from) {
            probes.push(Probe::new(name, ProbeStatus::Skipped, "not attempted"));
        }
    };

    let addr = endpoint.address();
    match timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => probes.push(Probe::new("tcp", ProbeStatus::Pass, format!("reached {addr}"))),
        Ok(Err(e)) => {
            probes.push(Probe::new("tcp", ProbeStatus::Fail, e.to_string()));
            skip_rest(&mut probes, 0);
            return probes;
        }
        Err(_) => {
            probes.push(Probe::new("tcp", ProbeStatus::Fail, "timed out"));
            skip_rest(&mut probes, 0);
            return probes;
        }
    }

    let mut client = EslClient::new().with_connect_timeout(PROBE_TIMEOUT);
    if let Err(e) = client.connect(endpoint).await {
        probes.push(Probe::new("auth", ProbeStatus::Fail, e.to_string()));
        skip_rest(&mut probes, 1);
        return probes;
    }
    probes.push(Probe::new("auth", ProbeStatus::Pass, "password accepted"));

    if let Err(e) = client.subscribe(class, filter).await {
        probes.push(Probe::new("subscribe", ProbeStatus::Fail, e.to_string()));
        skip_rest(&mut probes, 2);
        disconnect(&mut client).await;
        return probes;
    }
    probes.push(Probe::new(
        "subscribe",
        ProbeStatus::Pass,
        format!("event {class} {filter}"),
    ));

    probes.push(wait_for_event(&mut client, event_wait).await);
    disconnect(&mut client).await;
    probes
}

async fn wait_for_event(client: &mut EslClient, wait: Duration) -> Probe {
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Probe::new(
                "event",
                ProbeStatus::Warn,
                format!("no event within {}s", wait.as_secs()),
            );
        }
        match client.recv_timeout(remaining).await {
            Ok(Some(event)) => {
                let name = event.name().unwrap_or("unnamed").to_string();
                return Probe::new("event", ProbeStatus::Pass, format!("received {name}"));
            }
            Ok(None) if !client.is_connected() => {
                return Probe::new("event", ProbeStatus::Fail, "upstream closed the connection");
            }
            Ok(None) => {}
            Err(e) if e.is_transient() => debug!(error = %e, "ignoring malformed frame"),
            Err(e) => return Probe::new("event", ProbeStatus::Fail, e.to_string()),
        }
    }
}

async fn disconnect(client: &mut EslClient) {
    if let Err(e) = client.disconnect().await {
        debug!(error = %e, "disconnect after check");
    }
}

fn probe_directory(dir: &Path, fallback: Option<&Path>) -> Probe {
    let primary_err = match prepare_directory(dir) {
        Ok(()) => {
            return Probe::new(
                "log_dir",
                ProbeStatus::Pass,
                format!("{} is writable", dir.display()),
            );
        }
        Err(e) => e,
    };

    match fallback.map(|f| (f, prepare_directory(f))) {
        Some((f, Ok(()))) => Probe::new(
            "log_dir",
            ProbeStatus::Warn,
            format!(
                "{}: {primary_err}; would fall back to {}",
                dir.display(),
                f.display()
            ),
        ),
        Some((f, Err(e))) => Probe::new(
            "log_dir",
            ProbeStatus::Fail,
            format!("{}: {primary_err}; {}: {e}", dir.display(), f.display()),
        ),
        None => Probe::new(
            "log_dir",
            ProbeStatus::Fail,
            format!("{}: {primary_err}", dir.display()),
        ),
    }
}
