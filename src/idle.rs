//! Idle detection heuristic.
//!
//! The guest has no "nothing left to do" signal, so idleness is inferred from
//! the scheduler trace. Each scheduler switch line is classified as a move to
//! an idle-equivalent task or to real work; everything else in the stream is
//! ignored.
//!
//! ## Latch
//!
//! ```text
//! NOT IDLE  → switch to idle-equivalent task → MAYBE IDLE (clock starts)
//! MAYBE IDLE → switch to idle-equivalent task → MAYBE IDLE (clock untouched)
//! MAYBE IDLE → switch to any other task       → NOT IDLE (clock cleared)
//! MAYBE IDLE → clock reaches idle_time        → idle
//! ```
//!
//! Classification sits behind [`ActivityClassifier`] so a guest with an
//! explicit instrumentation hook can replace the heuristic without touching
//! the waiting code.

use std::time::{Duration, Instant};

use crate::signals::thread_switch_message;
use crate::transport::deadline_after;

/// Idle transition reported by the scheduler when its run queue is empty.
const IDLE_TRANSITION: &str = " - No active threads, idling";
/// Prefix of an explicit task switch ("Task switch to" / "Idle task switch to").
const TASK_SWITCH: &str = "ask switch to 0x";

/// What a single log line says about guest activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Scheduler moved to an idle-equivalent task.
    Idle,
    /// Scheduler moved to a task doing real work.
    Busy,
    /// Not a scheduler line.
    Unrelated,
}

/// Maps log lines to [`Activity`].
pub trait ActivityClassifier {
    fn classify(&self, line: &str) -> Activity;
}

/// Classifier for the kernel's `[kernel::threads]` trace.
///
/// Besides the explicit idle transition, switches to a small set of
/// housekeeping tasks also count as idle. Those tasks are assumed to do
/// negligible work per wakeup.
#[derive(Debug, Clone)]
pub struct SchedulerTrace {
    /// `" <name>)"` suffixes, matching the `(<tid> <name>)` task label.
    housekeeping_suffixes: Vec<String>,
}

impl SchedulerTrace {
    pub fn new<I, S>(housekeeping_tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            housekeeping_suffixes: housekeeping_tasks
                .into_iter()
                .map(|name| format!(" {})", name.as_ref()))
                .collect(),
        }
    }

    pub fn default_housekeeping() -> Vec<String> {
        vec!["IRQ Worker".to_string(), "GUI Timer".to_string()]
    }
}

impl Default for SchedulerTrace {
    fn default() -> Self {
        Self::new(Self::default_housekeeping())
    }
}

impl ActivityClassifier for SchedulerTrace {
    fn classify(&self, line: &str) -> Activity {
        let Some(message) = thread_switch_message(line) else {
            return Activity::Unrelated;
        };

        if message.contains(IDLE_TRANSITION) {
            return Activity::Idle;
        }
        if message.contains(TASK_SWITCH)
            && self
                .housekeeping_suffixes
                .iter()
                .any(|suffix| message.contains(suffix.as_str()))
        {
            return Activity::Idle;
        }
        Activity::Busy
    }
}

/// Two-valued idle latch plus the instant at which idleness is confirmed.
///
/// Lives for exactly one `wait_for_idle` call.
#[derive(Debug, Clone)]
pub struct IdleLatch {
    idle_time: Duration,
    maybe_idle: bool,
    /// `None` stands for "never" while the latch is not idle.
    pass_deadline: Option<Instant>,
}

impl IdleLatch {
    pub fn new(idle_time: Duration) -> Self {
        Self {
            idle_time,
            maybe_idle: false,
            pass_deadline: None,
        }
    }

    pub fn is_maybe_idle(&self) -> bool {
        self.maybe_idle
    }

    pub fn pass_deadline(&self) -> Option<Instant> {
        self.pass_deadline
    }

    /// True once the guest has stayed idle-equivalent for the full window.
    pub fn passed(&self, now: Instant) -> bool {
        matches!(self.pass_deadline, Some(deadline) if now >= deadline)
    }

    /// Feed one classified line observed at `now`.
    pub fn observe(&mut self, activity: Activity, now: Instant) {
        match activity {
            Activity::Idle => {
                // Repeated idle-to-idle switches must not restart the clock.
                if !self.maybe_idle {
                    self.maybe_idle = true;
                    self.pass_deadline = Some(deadline_after(now, self.idle_time));
                }
            }
            Activity::Busy => {
                self.maybe_idle = false;
                self.pass_deadline = None;
            }
            Activity::Unrelated => {}
        }
    }
}
