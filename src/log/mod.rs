//! Structured run log: JSON lines per scenario run.
//!
//! Every session writes `run.jsonl` into its artifact directory. Each line is
//! a self-contained JSON object with an RFC 3339 timestamp: commands sent to
//! the monitor, waits started and finished, fatal signatures, steps and the
//! final verdict. Raw console output is never recorded here; the oracle's
//! `lastlog` covers that on failure.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, warn};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A structured event in the run log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    SessionStarted {
        arch: String,
        name: String,
        program: String,
        pid: Option<u32>,
    },
    /// A monitor command went out on the wire.
    CommandSent { command: String },
    WaitStarted {
        wait: u64,
        kind: WaitKind,
        pattern: Option<String>,
        timeout_secs: f64,
    },
    WaitFinished {
        wait: u64,
        kind: WaitKind,
        outcome: WaitOutcome,
        elapsed_secs: f64,
    },
    FatalSignature { kind: String, line: String },
    StepPassed { reason: String },
    Screenshot { path: String },
    CaptureStarted { path: String },
    ScenarioPassed { name: String },
    ScenarioFailed { name: String, reason: String },
    SessionEnded { result: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Line,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitOutcome {
    Matched,
    Idle,
    TimedOut,
    Fatal,
}

/// Writer for the JSON lines run log.
pub struct RunLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl RunLog {
    /// Create a new run log, writing to the given path.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "run log");

        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    /// Log an event; write failures are only warned about.
    pub fn record(&self, event: LogEvent) {
        if let Err(e) = self.log(event) {
            warn!(path = %self.path.display(), error = %e, "run log write failed");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
