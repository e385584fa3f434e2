//! In-memory transport that replays a timed console script.
//!
//! Lines are scheduled at offsets from construction, and echo rules schedule
//! more lines relative to the moment a given command is sent. `read_line`
//! really sleeps until the next line is due (or the timeout runs out), so
//! timing assertions against the oracle hold just as they would against a
//! live emulator.

use std::collections::VecDeque;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use super::{ChannelMode, LineSource, Transport, deadline_after, encode_command};

#[derive(Debug, Clone)]
struct EchoRule {
    command: String,
    delay: Duration,
    lines: Vec<String>,
}

/// Scripted console used by tests.
#[derive(Debug)]
pub struct ScriptedTransport {
    origin: Instant,
    queue: VecDeque<(Instant, String)>,
    echoes: Vec<EchoRule>,
    escape: String,
    mode: ChannelMode,
    sent: Vec<String>,
    wire: Vec<u8>,
    hang_up: bool,
    shut_down: bool,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            queue: VecDeque::new(),
            echoes: Vec::new(),
            escape: super::DEFAULT_MONITOR_ESCAPE.to_string(),
            mode: ChannelMode::Passthrough,
            sent: Vec::new(),
            wire: Vec::new(),
            hang_up: false,
            shut_down: false,
        }
    }

    /// Emit `line` at `offset` after construction.
    pub fn line_at(mut self, offset: Duration, line: impl Into<String>) -> Self {
        let due = self.origin + offset;
        self.schedule(due, line.into());
        self
    }

    /// Emit `line` every `period`, starting one period in, up to `until`.
    pub fn every(mut self, period: Duration, until: Duration, line: impl Into<String>) -> Self {
        let line = line.into();
        let mut offset = period;
        while offset <= until {
            self.schedule(self.origin + offset, line.clone());
            offset += period;
        }
        self
    }

    /// When `command` is sent, emit `lines` after `delay`.
    pub fn echo<I, S>(mut self, command: impl Into<String>, delay: Duration, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.echoes.push(EchoRule {
            command: command.into(),
            delay,
            lines: lines.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Once the script runs dry, report no data immediately, like a dead
    /// emulator whose pipe reached EOF.
    pub fn hang_up_when_empty(mut self) -> Self {
        self.hang_up = true;
        self
    }

    /// Commands sent so far, without the escape or terminators.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    /// Exact bytes the harness would have written to the emulator.
    pub fn wire(&self) -> &[u8] {
        &self.wire
    }

    /// Lines scheduled but not yet read.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn schedule(&mut self, due: Instant, line: String) {
        // Stable: equal due times keep insertion order.
        let at = self
            .queue
            .iter()
            .position(|(t, _)| *t > due)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, (due, line));
    }
}

impl LineSource for ScriptedTransport {
    fn read_line(&mut self, timeout: Duration) -> Option<String> {
        let deadline = deadline_after(Instant::now(), timeout);
        let next_due = self.queue.front().map(|(due, _)| *due);
        match next_due {
            Some(due) if due <= deadline => {
                let now = Instant::now();
                if due > now {
                    thread::sleep(due - now);
                }
                self.queue.pop_front().map(|(_, line)| line)
            }
            None if self.hang_up => None,
            _ => {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
                None
            }
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, command: &str) -> io::Result<()> {
        if self.shut_down {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "monitor input already closed",
            ));
        }
        let wire = encode_command(&mut self.mode, &self.escape, command);
        self.wire.extend_from_slice(&wire);
        self.sent.push(command.to_string());

        let now = Instant::now();
        let matched: Vec<EchoRule> = self
            .echoes
            .iter()
            .filter(|rule| rule.command == command)
            .cloned()
            .collect();
        for rule in matched {
            for line in rule.lines {
                self.schedule(deadline_after(now, rule.delay), line);
            }
        }
        Ok(())
    }

    fn mode(&self) -> ChannelMode {
        self.mode
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.send("quit")?;
        self.shut_down = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_arrive_in_schedule_order() {
        let mut t = ScriptedTransport::new()
            .line_at(Duration::from_millis(20), "second")
            .line_at(Duration::from_millis(10), "first")
            .line_at(Duration::from_millis(20), "third");
        assert_eq!(t.read_line(Duration::from_secs(1)).as_deref(), Some("first"));
        assert_eq!(t.read_line(Duration::from_secs(1)).as_deref(), Some("second"));
        assert_eq!(t.read_line(Duration::from_secs(1)).as_deref(), Some("third"));
    }

    #[test]
    fn read_times_out_before_late_line() {
        let mut t = ScriptedTransport::new().line_at(Duration::from_millis(300), "late");
        let start = Instant::now();
        assert!(t.read_line(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(t.pending(), 1);
    }

    #[test]
    fn echo_schedules_after_send() {
        let mut t = ScriptedTransport::new().echo("sendkey a", Duration::from_millis(10), ["KeyDown(A)"]);
        assert!(t.read_line(Duration::ZERO).is_none());
        t.send("sendkey a").unwrap();
        assert_eq!(t.read_line(Duration::from_secs(1)).as_deref(), Some("KeyDown(A)"));
    }

    #[test]
    fn wire_carries_escape_once() {
        let mut t = ScriptedTransport::new();
        t.send("sendkey a").unwrap();
        t.send("sendkey b").unwrap();
        assert_eq!(t.wire(), b"\x01csendkey a\nsendkey b\n");
        assert_eq!(t.sent(), ["sendkey a", "sendkey b"]);
    }

    #[test]
    fn hang_up_returns_immediately() {
        let mut t = ScriptedTransport::new().hang_up_when_empty();
        let start = Instant::now();
        assert!(t.read_line(Duration::from_secs(5)).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn shutdown_sends_quit_once() {
        let mut t = ScriptedTransport::new();
        t.shutdown().unwrap();
        t.shutdown().unwrap();
        assert_eq!(t.sent(), ["quit"]);
        assert!(t.send("sendkey a").is_err());
    }
}
