//! Assertion helpers and the scenario runner.
//!
//! A scenario is any `FnOnce(&mut Session<T>) -> Result<(), TestFailure>`;
//! declarative TOML scenarios in [`script`] are one such function.

pub mod script;

use std::time::Duration;

use crate::failure::TestFailure;
use crate::log::LogEvent;
use crate::oracle::{CaptureSet, compile_pattern};
use crate::session::Session;
use crate::signals::entry_invoked;
use crate::transport::Transport;

/// Default timeout for `match_line` and `wait_startapp`.
pub const DEFAULT_MATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Fail with `reason` unless `condition` holds; otherwise report the step.
pub fn test_assert(reason: &str, condition: bool) -> Result<(), TestFailure> {
    if !condition {
        return Err(TestFailure::Assertion(reason.to_string()));
    }
    println!("STEP: {reason}");
    Ok(())
}

impl<T: Transport> Session<T> {
    /// [`test_assert`], also recorded in the run log when it passes.
    pub fn step(&mut self, reason: &str, condition: bool) -> Result<(), TestFailure> {
        test_assert(reason, condition)?;
        self.run_log().record(LogEvent::StepPassed {
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Wait for `pattern` and check its capture groups against `expected`,
    /// in order (`expected[0]` is group 1).
    pub fn match_line<S: AsRef<str>>(
        &mut self,
        name: &str,
        pattern: &str,
        expected: &[S],
        timeout: Duration,
    ) -> Result<CaptureSet, TestFailure> {
        let regex = compile_pattern(pattern)?;
        let Some(caps) = self.wait_for_regex(&regex, timeout)? else {
            return Err(TestFailure::MatchTimeout {
                name: name.to_string(),
                pattern: pattern.to_string(),
            });
        };
        for (index, want) in expected.iter().enumerate() {
            let got = caps.group(index + 1);
            if got != Some(want.as_ref()) {
                return Err(TestFailure::CaptureMismatch {
                    name: name.to_string(),
                    pattern: pattern.to_string(),
                    index,
                    expected: want.as_ref().to_string(),
                    actual: got.map(str::to_string),
                });
            }
        }
        Ok(caps)
    }

    /// Wait for the guest to invoke a userland entry point and check that
    /// it was `path`.
    pub fn wait_startapp(&mut self, path: &str, timeout: Duration) -> Result<(), TestFailure> {
        let Some(caps) = self.wait_for_regex(entry_invoked(), timeout)? else {
            return Err(TestFailure::StartTimeout {
                path: path.to_string(),
            });
        };
        let started = caps.group(1).unwrap_or_default();
        if started != path {
            return Err(TestFailure::UnexpectedBinary {
                expected: path.to_string(),
                actual: started.to_string(),
            });
        }
        Ok(())
    }
}

/// Run `scenario` against `session`.
///
/// On failure the unmatched tail of the console is printed, the guest is
/// given a chance to settle (so whatever it prints next is visible in the
/// log), and the failure is recorded and returned.
pub fn run_scenario<T, F>(session: &mut Session<T>, scenario: F) -> Result<(), TestFailure>
where
    T: Transport,
    F: FnOnce(&mut Session<T>) -> Result<(), TestFailure>,
{
    match scenario(session) {
        Ok(()) => {
            session.run_log().record(LogEvent::ScenarioPassed {
                name: session.name().to_string(),
            });
            Ok(())
        }
        Err(failure) => {
            println!("--- FAILED");
            let lastlog = session.lastlog();
            if !lastlog.is_empty() {
                println!("--- last {} unmatched lines:", lastlog.len());
                for line in &lastlog {
                    println!("  {}", crate::signals::strip_ansi(line));
                }
            }
            session.flush();
            session.run_log().record(LogEvent::ScenarioFailed {
                name: session.name().to_string(),
                reason: failure.to_string(),
            });
            Err(failure)
        }
    }
}
