//! Log oracle: timeout-bounded waits over the console stream.
//!
//! Two primitives, both built on repeated `read_line` calls against one
//! wall-clock deadline:
//!
//! - [`LogOracle::wait_for_line`] returns the captures of the first line that
//!   matches, leaving every later line unread.
//! - [`LogOracle::wait_for_idle`] returns true once the scheduler trace has
//!   shown only idle-equivalent switches for a full `idle_time` window.
//!
//! Every non-empty line seen by either wait is checked for the fault markers
//! first. A fault aborts the wait with [`TestFailure::Fatal`] even when the
//! line would also have matched the caller's pattern.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use regex::{Captures, Regex};
use tracing::{debug, info, warn};

use crate::failure::TestFailure;
use crate::idle::{Activity, ActivityClassifier, IdleLatch, SchedulerTrace};
use crate::signals::{detect_fault, strip_ansi};
use crate::transport::{LineSource, deadline_after};

/// Default size of the trailing unmatched-line window.
pub const DEFAULT_LASTLOG_LIMIT: usize = 200;

/// Groups captured by a successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSet {
    line: String,
    matched: String,
    groups: Vec<Option<String>>,
}

impl CaptureSet {
    fn from_captures(line: &str, caps: &Captures<'_>) -> Self {
        Self {
            line: line.to_string(),
            matched: caps
                .get(0)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            groups: caps
                .iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect(),
        }
    }

    /// The whole line the pattern matched in.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// The matched portion of the line.
    pub fn matched(&self) -> &str {
        &self.matched
    }

    /// Capture group `n`, 1-based like `regex::Captures`; 0 is the whole match.
    /// `None` if the group does not exist or did not participate.
    pub fn group(&self, n: usize) -> Option<&str> {
        if n == 0 {
            return Some(&self.matched);
        }
        self.groups.get(n - 1).and_then(|g| g.as_deref())
    }

    /// All capture groups in pattern order, excluding the whole match.
    pub fn groups(&self) -> &[Option<String>] {
        &self.groups
    }
}

/// Consumes console lines and answers "did X happen in time".
#[derive(Debug)]
pub struct LogOracle<C = SchedulerTrace> {
    classifier: C,
    lastlog: VecDeque<String>,
    lastlog_limit: usize,
    waits: u64,
}

impl Default for LogOracle<SchedulerTrace> {
    fn default() -> Self {
        Self::new(SchedulerTrace::default())
    }
}

impl<C: ActivityClassifier> LogOracle<C> {
    pub fn new(classifier: C) -> Self {
        Self {
            classifier,
            lastlog: VecDeque::new(),
            lastlog_limit: DEFAULT_LASTLOG_LIMIT,
            waits: 0,
        }
    }

    pub fn with_lastlog_limit(mut self, limit: usize) -> Self {
        self.lastlog_limit = limit.max(1);
        self
    }

    /// Lines seen by the most recent wait that did not match, oldest first.
    pub fn lastlog(&self) -> Vec<String> {
        self.lastlog.iter().cloned().collect()
    }

    /// Number of waits issued so far; used to correlate log output.
    pub fn wait_count(&self) -> u64 {
        self.waits
    }

    /// Wait for the first line matching `pattern`.
    ///
    /// Returns `Ok(None)` once `timeout` has fully elapsed without a match.
    pub fn wait_for_line<S: LineSource + ?Sized>(
        &mut self,
        source: &mut S,
        pattern: &Regex,
        timeout: Duration,
    ) -> Result<Option<CaptureSet>, TestFailure> {
        self.waits += 1;
        let wait = self.waits;
        info!(
            wait,
            pattern = pattern.as_str(),
            timeout_secs = timeout.as_secs_f64(),
            "wait_for_line"
        );
        self.lastlog.clear();
        let deadline = deadline_after(Instant::now(), timeout);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(line) = source.read_line(remaining) else {
                debug!(wait, "wait_for_line timed out");
                return Ok(None);
            };

            if !line.is_empty() {
                debug!(wait, line = %strip_ansi(&line), "wait_for_line");
                check_for_fault(&line)?;
                if let Some(caps) = pattern.captures(&line) {
                    return Ok(Some(CaptureSet::from_captures(&line, &caps)));
                }
                self.remember(line);
            }

            if Instant::now() >= deadline {
                debug!(wait, "wait_for_line timed out");
                return Ok(None);
            }
        }
    }

    /// Wait until the guest has stayed idle for `idle_time`, giving up after
    /// `timeout`.
    pub fn wait_for_idle<S: LineSource + ?Sized>(
        &mut self,
        source: &mut S,
        timeout: Duration,
        idle_time: Duration,
    ) -> Result<bool, TestFailure> {
        self.waits += 1;
        let wait = self.waits;
        info!(
            wait,
            timeout_secs = timeout.as_secs_f64(),
            idle_secs = idle_time.as_secs_f64(),
            "wait_for_idle"
        );
        self.lastlog.clear();
        let fail_at = deadline_after(Instant::now(), timeout);
        let mut latch = IdleLatch::new(idle_time);

        loop {
            let until = match latch.pass_deadline() {
                Some(pass_at) => pass_at.min(fail_at),
                None => fail_at,
            };
            let line = source.read_line(until.saturating_duration_since(Instant::now()));

            let now = Instant::now();
            if now >= fail_at {
                debug!(wait, "wait_for_idle: not idle before timeout");
                return Ok(false);
            }
            if latch.passed(now) {
                debug!(wait, "wait_for_idle: idle");
                return Ok(true);
            }
            let Some(line) = line else {
                warn!(wait, "wait_for_idle: console closed before either deadline");
                return Ok(false);
            };
            if line.is_empty() {
                continue;
            }

            debug!(wait, line = %strip_ansi(&line), "wait_for_idle");
            check_for_fault(&line)?;

            let activity = self.classifier.classify(&line);
            if activity != Activity::Unrelated {
                let was_idle = latch.is_maybe_idle();
                latch.observe(activity, Instant::now());
                debug!(
                    wait,
                    from = was_idle,
                    to = latch.is_maybe_idle(),
                    "wait_for_idle: scheduler switch"
                );
            }
            self.remember(line);
        }
    }

    fn remember(&mut self, line: String) {
        if self.lastlog.len() >= self.lastlog_limit {
            self.lastlog.pop_front();
        }
        self.lastlog.push_back(line);
    }
}

/// Compile a caller-supplied pattern, reporting a bad one as a scenario
/// failure.
pub fn compile_pattern(pattern: &str) -> Result<Regex, TestFailure> {
    Regex::new(pattern).map_err(|source| TestFailure::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn check_for_fault(line: &str) -> Result<(), TestFailure> {
    match detect_fault(line) {
        Some(kind) => {
            warn!(%kind, line = %strip_ansi(line), "fault marker in console output");
            Err(TestFailure::Fatal {
                kind,
                line: strip_ansi(line),
            })
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::FaultKind;
    use crate::transport::Transport;
    use crate::transport::scripted::ScriptedTransport;

    const IDLE: &str = " 9844t 0/TID10[kernel::threads] - L270: reschedule() - No active threads, idling";
    const BUSY: &str =
        " 9850d 0/TID1[kernel::threads] - Task switch to 0xffff800000000d00(7 /sysroot/bin/shell#1)";
    const KERNEL_FAULT: &str = " 1203k 0/TID4[kernel::unwind] - panic: page fault";
    const USER_FAULT: &str = " 1203d 0/TID7[syscalls] - USER> PANIC: KeyDown(A)";

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn re(pattern: &str) -> Regex {
        Regex::new(pattern).unwrap()
    }

    // ── wait_for_line ──

    #[test]
    fn non_matching_stream_times_out_after_full_timeout() {
        let mut source = ScriptedTransport::new().every(ms(20), ms(1000), "noise");
        let mut oracle = LogOracle::default();
        let start = Instant::now();
        let result = oracle.wait_for_line(&mut source, &re("never"), ms(300)).unwrap();
        let elapsed = start.elapsed();
        assert!(result.is_none());
        assert!(elapsed >= ms(300), "returned early: {elapsed:?}");
        assert!(elapsed < ms(600), "overran: {elapsed:?}");
        assert!(oracle.lastlog().iter().all(|l| l == "noise"));
        assert!(!oracle.lastlog().is_empty());
    }

    #[test]
    fn silent_stream_times_out_after_full_timeout() {
        let mut source = ScriptedTransport::new();
        let mut oracle = LogOracle::default();
        let start = Instant::now();
        assert!(oracle.wait_for_line(&mut source, &re("x"), ms(150)).unwrap().is_none());
        assert!(start.elapsed() >= ms(150));
    }

    #[test]
    fn first_match_wins_and_later_lines_stay_unread() {
        let mut source = ScriptedTransport::new()
            .line_at(ms(5), "boot: stage 1")
            .line_at(ms(10), "OK43e6H")
            .line_at(ms(15), "Entering userland at 0x1000 '/sysroot/bin/loader' '/sysroot/bin/init'")
            .line_at(ms(20), "after");
        let mut oracle = LogOracle::default();

        let caps = oracle
            .wait_for_line(&mut source, &re("OK43e6H"), ms(1000))
            .unwrap()
            .unwrap();
        assert_eq!(caps.matched(), "OK43e6H");
        assert_eq!(source.pending(), 2);
        assert_eq!(oracle.lastlog(), vec!["boot: stage 1".to_string()]);

        let caps = oracle
            .wait_for_line(
                &mut source,
                &re(r"Entering userland at 0x[0-9a-f]+ '([^']+)' '([^']+)'"),
                ms(1000),
            )
            .unwrap()
            .unwrap();
        assert_eq!(caps.group(1), Some("/sysroot/bin/loader"));
        assert_eq!(caps.group(2), Some("/sysroot/bin/init"));
        assert_eq!(source.pending(), 1);
    }

    #[test]
    fn captures_align_with_pattern_groups() {
        let mut source = ScriptedTransport::new().line_at(ms(1), "redraw: 3 'Console' dirty");
        let mut oracle = LogOracle::default();
        let caps = oracle
            .wait_for_line(&mut source, &re(r"redraw: (\d+) '([^']+)'( clean)?"), ms(500))
            .unwrap()
            .unwrap();
        assert_eq!(caps.groups().len(), 3);
        assert_eq!(caps.group(1), Some("3"));
        assert_eq!(caps.group(2), Some("Console"));
        assert_eq!(caps.group(3), None);
        assert_eq!(caps.group(4), None);
        assert_eq!(caps.line(), "redraw: 3 'Console' dirty");
    }

    #[test]
    fn empty_lines_are_skipped() {
        let mut source = ScriptedTransport::new()
            .line_at(ms(1), "")
            .line_at(ms(2), "match me");
        let mut oracle = LogOracle::default();
        let caps = oracle.wait_for_line(&mut source, &re("^$|match"), ms(500)).unwrap().unwrap();
        assert_eq!(caps.line(), "match me");
        assert!(oracle.lastlog().is_empty());
    }

    #[test]
    fn fault_aborts_even_when_pattern_matches() {
        let mut source = ScriptedTransport::new().line_at(ms(5), USER_FAULT);
        let mut oracle = LogOracle::default();
        let err = oracle
            .wait_for_line(&mut source, &re(r"KeyDown\(A\)"), ms(500))
            .unwrap_err();
        match err {
            TestFailure::Fatal { kind, .. } => assert_eq!(kind, FaultKind::User),
            other => panic!("expected fatal failure, got {other:?}"),
        }
    }

    #[test]
    fn kernel_fault_aborts_line_wait() {
        let mut source = ScriptedTransport::new()
            .line_at(ms(5), "ordinary")
            .line_at(ms(10), KERNEL_FAULT);
        let mut oracle = LogOracle::default();
        let err = oracle.wait_for_line(&mut source, &re("never"), ms(500)).unwrap_err();
        assert!(matches!(err, TestFailure::Fatal { kind: FaultKind::Kernel, .. }));
    }

    #[test]
    fn closed_stream_reads_as_timeout() {
        let mut source = ScriptedTransport::new().hang_up_when_empty();
        let mut oracle = LogOracle::default();
        assert!(oracle.wait_for_line(&mut source, &re("x"), ms(5000)).unwrap().is_none());
    }

    #[test]
    fn each_wait_clears_lastlog_and_counts() {
        let mut source = ScriptedTransport::new()
            .line_at(ms(1), "a")
            .line_at(ms(2), "hit")
            .line_at(ms(3), "b")
            .line_at(ms(4), "hit");
        let mut oracle = LogOracle::default();
        oracle.wait_for_line(&mut source, &re("hit"), ms(500)).unwrap();
        assert_eq!(oracle.lastlog(), vec!["a".to_string()]);
        oracle.wait_for_line(&mut source, &re("hit"), ms(500)).unwrap();
        assert_eq!(oracle.lastlog(), vec!["b".to_string()]);
        assert_eq!(oracle.wait_count(), 2);
    }

    #[test]
    fn lastlog_keeps_trailing_window() {
        let mut source = ScriptedTransport::new()
            .line_at(ms(1), "1")
            .line_at(ms(2), "2")
            .line_at(ms(3), "3")
            .hang_up_when_empty();
        let mut oracle = LogOracle::default().with_lastlog_limit(2);
        oracle.wait_for_line(&mut source, &re("never"), ms(500)).unwrap();
        assert_eq!(oracle.lastlog(), vec!["2".to_string(), "3".to_string()]);
    }

    #[test]
    fn key_echo_round_trip() {
        let mut source = ScriptedTransport::new().echo(
            "sendkey a",
            ms(50),
            [" 700d 0/TID9[syscalls] - USER> Window::handle_event(ev=KeyDown(A))"],
        );
        let mut oracle = LogOracle::default();
        source.send_key("a").unwrap();
        let caps = oracle
            .wait_for_line(
                &mut source,
                &re(r"\[syscalls\] - USER> (Window|Menu)::handle_event\(ev=KeyDown\(([A-Z])\)\)"),
                Duration::from_secs(1),
            )
            .unwrap()
            .unwrap();
        assert_eq!(caps.group(1), Some("Window"));
        assert_eq!(caps.group(2), Some("A"));
    }

    // ── wait_for_idle ──

    #[test]
    fn steady_idle_signal_passes_after_idle_time() {
        let mut source = ScriptedTransport::new().every(ms(100), ms(3000), IDLE);
        let mut oracle = LogOracle::default();
        let start = Instant::now();
        assert!(oracle.wait_for_idle(&mut source, ms(5000), ms(500)).unwrap());
        let elapsed = start.elapsed();
        // First idle line at 100ms starts the clock.
        assert!(elapsed >= ms(600), "passed early: {elapsed:?}");
        assert!(elapsed < ms(900), "passed late: {elapsed:?}");
    }

    #[test]
    fn busy_switch_restarts_idle_window() {
        let mut source = ScriptedTransport::new()
            .every(ms(100), ms(3000), IDLE)
            .line_at(ms(450), BUSY);
        let mut oracle = LogOracle::default();
        let start = Instant::now();
        assert!(oracle.wait_for_idle(&mut source, ms(5000), ms(500)).unwrap());
        let elapsed = start.elapsed();
        // Clock restarts at the first idle line after the busy switch (500ms).
        assert!(elapsed >= ms(1000), "busy switch did not reset: {elapsed:?}");
        assert!(elapsed < ms(1300), "passed late: {elapsed:?}");
    }

    #[test]
    fn constant_activity_never_goes_idle() {
        let mut source = ScriptedTransport::new()
            .every(ms(100), ms(2000), IDLE)
            .every(ms(150), ms(2000), BUSY);
        let mut oracle = LogOracle::default();
        let start = Instant::now();
        assert!(!oracle.wait_for_idle(&mut source, ms(700), ms(400)).unwrap());
        assert!(start.elapsed() >= ms(700));
    }

    #[test]
    fn unrelated_lines_do_not_touch_idle_clock() {
        let mut source = ScriptedTransport::new()
            .line_at(ms(50), IDLE)
            .every(ms(60), ms(1000), " 9851d 0/TID3[gui::windows] - WindowGroup::redraw: 2 'Login'");
        let mut oracle = LogOracle::default();
        let start = Instant::now();
        assert!(oracle.wait_for_idle(&mut source, ms(3000), ms(300)).unwrap());
        let elapsed = start.elapsed();
        assert!(elapsed >= ms(350) && elapsed < ms(600), "{elapsed:?}");
    }

    #[test]
    fn no_scheduler_trace_is_not_idle() {
        let mut source = ScriptedTransport::new();
        let mut oracle = LogOracle::default();
        let start = Instant::now();
        assert!(!oracle.wait_for_idle(&mut source, ms(300), ms(100)).unwrap());
        assert!(start.elapsed() >= ms(300));
    }

    #[test]
    fn fault_aborts_idle_wait() {
        let mut source = ScriptedTransport::new()
            .every(ms(50), ms(1000), IDLE)
            .line_at(ms(120), KERNEL_FAULT);
        let mut oracle = LogOracle::default();
        let err = oracle.wait_for_idle(&mut source, ms(2000), ms(500)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn consecutive_idle_waits_each_take_idle_time() {
        let mut source = ScriptedTransport::new().every(ms(50), ms(5000), IDLE);
        let mut oracle = LogOracle::default();

        assert!(oracle.wait_for_idle(&mut source, ms(3000), ms(400)).unwrap());
        let start = Instant::now();
        assert!(oracle.wait_for_idle(&mut source, ms(3000), ms(400)).unwrap());
        let elapsed = start.elapsed();
        assert!(elapsed >= ms(400), "second wait reused state: {elapsed:?}");
        assert!(elapsed < ms(650), "second wait overran: {elapsed:?}");
    }

    #[test]
    fn closed_stream_is_not_idle() {
        let mut source = ScriptedTransport::new()
            .line_at(ms(10), IDLE)
            .hang_up_when_empty();
        let mut oracle = LogOracle::default();
        let start = Instant::now();
        assert!(!oracle.wait_for_idle(&mut source, ms(5000), ms(2000)).unwrap());
        assert!(start.elapsed() < ms(1000));
    }

    #[test]
    fn custom_classifier_replaces_heuristic() {
        struct Marker;
        impl ActivityClassifier for Marker {
            fn classify(&self, line: &str) -> Activity {
                match line {
                    "quiet" => Activity::Idle,
                    "work" => Activity::Busy,
                    _ => Activity::Unrelated,
                }
            }
        }

        let mut source = ScriptedTransport::new().every(ms(50), ms(2000), "quiet");
        let mut oracle = LogOracle::new(Marker);
        assert!(oracle.wait_for_idle(&mut source, ms(2000), ms(200)).unwrap());
    }
}
