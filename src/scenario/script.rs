//! Declarative scenarios: an ordered list of steps in a TOML file.
//!
//! ```toml
//! name = "login"
//!
//! [[step]]
//! kind = "wait_idle"
//! timeout_secs = 20
//! reason = "Desktop idle"
//!
//! [[step]]
//! kind = "start_app"
//! path = "/sysroot/bin/login"
//!
//! [[step]]
//! kind = "type"
//! text = "root\n"
//! ```

use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use super::DEFAULT_MATCH_TIMEOUT;
use crate::config::secs;
use crate::failure::TestFailure;
use crate::oracle::compile_pattern;
use crate::session::{Session, button_bit, keys_for_char};
use crate::transport::Transport;

fn default_match_timeout() -> f64 {
    DEFAULT_MATCH_TIMEOUT.as_secs_f64()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    /// Wait for a line matching `pattern`; fail if none arrives in time.
    WaitLine {
        pattern: String,
        #[serde(default = "default_match_timeout")]
        timeout_secs: f64,
        reason: Option<String>,
    },
    /// Wait for the guest to go idle; fail if it does not. Unset values use
    /// the `[idle]` config.
    WaitIdle {
        timeout_secs: Option<f64>,
        idle_secs: Option<f64>,
        reason: Option<String>,
    },
    /// Keep waiting for idle until a wait times out or `limit_secs` (default
    /// `idle.flush_limit_secs`) runs out. Never fails on its own.
    Settle {
        timeout_secs: Option<f64>,
        limit_secs: Option<f64>,
    },
    MatchLine {
        name: String,
        pattern: String,
        #[serde(default)]
        expect: Vec<String>,
        #[serde(default = "default_match_timeout")]
        timeout_secs: f64,
    },
    StartApp {
        path: String,
        #[serde(default = "default_match_timeout")]
        timeout_secs: f64,
    },
    Key { key: String },
    Combo { keys: Vec<String> },
    Type { text: String },
    MouseTo { x: i32, y: i32 },
    MousePress { button: u8 },
    MouseRelease { button: u8 },
    Screenshot { tag: String },
    Capture,
    Sleep { millis: u64 },
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::WaitLine { .. } => "wait_line",
            Step::WaitIdle { .. } => "wait_idle",
            Step::Settle { .. } => "settle",
            Step::MatchLine { .. } => "match_line",
            Step::StartApp { .. } => "start_app",
            Step::Key { .. } => "key",
            Step::Combo { .. } => "combo",
            Step::Type { .. } => "type",
            Step::MouseTo { .. } => "mouse_to",
            Step::MousePress { .. } => "mouse_press",
            Step::MouseRelease { .. } => "mouse_release",
            Step::Screenshot { .. } => "screenshot",
            Step::Capture => "capture",
            Step::Sleep { .. } => "sleep",
        }
    }

    /// Problems detectable without a guest: bad patterns, untypeable text,
    /// out-of-range buttons.
    fn validate(&self) -> Result<(), TestFailure> {
        match self {
            Step::WaitLine { pattern, .. } | Step::MatchLine { pattern, .. } => {
                compile_pattern(pattern).map(drop)
            }
            Step::Type { text } => text.chars().try_for_each(|c| keys_for_char(c).map(drop)),
            Step::MousePress { button } | Step::MouseRelease { button } => {
                button_bit(*button).map(drop)
            }
            _ => Ok(()),
        }
    }

    fn run<T: Transport>(&self, session: &mut Session<T>) -> Result<(), TestFailure> {
        match self {
            Step::WaitLine {
                pattern,
                timeout_secs,
                reason,
            } => {
                let found = session.wait_for_line(pattern, secs(*timeout_secs))?;
                let reason = reason
                    .clone()
                    .unwrap_or_else(|| format!("Line matching {pattern}"));
                session.step(&reason, found.is_some())
            }
            Step::WaitIdle {
                timeout_secs,
                idle_secs,
                reason,
            } => {
                let idle = match (timeout_secs, idle_secs) {
                    (None, None) => session.wait_for_idle_default()?,
                    _ => {
                        let (timeout, idle_time) = session.idle_defaults();
                        session.wait_for_idle(
                            timeout_secs.map(secs).unwrap_or(timeout),
                            idle_secs.map(secs).unwrap_or(idle_time),
                        )?
                    }
                };
                let reason = reason.as_deref().unwrap_or("Guest idle");
                session.step(reason, idle)
            }
            Step::Settle {
                timeout_secs,
                limit_secs,
            } => {
                let (timeout, _) = session.idle_defaults();
                let timeout = timeout_secs.map(secs).unwrap_or(timeout);
                let limit = limit_secs.map(secs).unwrap_or(session.flush_limit());
                session.settle(timeout, limit).map(drop)
            }
            Step::MatchLine {
                name,
                pattern,
                expect,
                timeout_secs,
            } => session
                .match_line(name, pattern, expect.as_slice(), secs(*timeout_secs))
                .map(drop),
            Step::StartApp { path, timeout_secs } => {
                session.wait_startapp(path, secs(*timeout_secs))
            }
            Step::Key { key } => session.send_key(key),
            Step::Combo { keys } => session.send_combo(keys.as_slice()),
            Step::Type { text } => session.type_string(text),
            Step::MouseTo { x, y } => session.mouse_to(*x, *y),
            Step::MousePress { button } => session.mouse_press(*button),
            Step::MouseRelease { button } => session.mouse_release(*button),
            Step::Screenshot { tag } => session.screenshot(tag).map(drop),
            Step::Capture => session.start_capture(),
            Step::Sleep { millis } => {
                thread::sleep(Duration::from_millis(*millis));
                Ok(())
            }
        }
    }
}

/// A scenario file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,
    /// Architecture this scenario targets; the CLI's `--arch` wins.
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("invalid scenario")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Check every step that can be checked without launching anything.
    /// Returns the 1-based step number alongside the first problem.
    pub fn validate(&self) -> Result<(), (usize, TestFailure)> {
        for (index, step) in self.steps.iter().enumerate() {
            step.validate().map_err(|e| (index + 1, e))?;
        }
        Ok(())
    }

    /// Execute the steps in order, stopping at the first failure.
    pub fn run<T: Transport>(&self, session: &mut Session<T>) -> Result<(), TestFailure> {
        for (index, step) in self.steps.iter().enumerate() {
            info!(scenario = %self.name, step = index + 1, kind = step.kind(), "running step");
            step.run(session)?;
        }
        Ok(())
    }
}
