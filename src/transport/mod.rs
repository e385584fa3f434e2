//! Line transport to the emulator's stdio console.
//!
//! The emulator multiplexes two things over one pipe pair: the guest's serial
//! output (which the harness reads line by line) and the emulator's own
//! monitor (which accepts out-of-band commands such as key injection and
//! screen dumps). Writing the mode-switch escape moves the input side from
//! passthrough into the monitor; every command after that is a single
//! newline-terminated line.
//!
//! [`Transport`] is the seam between the waiting logic and the process:
//! [`monitor::MonitorTransport`] drives a real subprocess, and
//! `scripted::ScriptedTransport` replays canned output for tests.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

pub mod monitor;
#[cfg(any(test, feature = "scenario-test"))]
pub mod scripted;

/// Default monitor escape: Ctrl-A followed by `c`.
pub const DEFAULT_MONITOR_ESCAPE: &str = "\x01c";

/// Longest line the splitter buffers before cutting it.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Used in place of a deadline that does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `start + timeout`, saturating instead of overflowing. A timeout too large
/// to represent means "effectively forever".
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Which side of the console multiplexer receives our input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Input goes to the guest's serial port. State before the first command.
    Passthrough,
    /// Input goes to the emulator monitor.
    Command,
}

/// Monitor commands issued by the harness.
///
/// `Display` renders the exact wire text the monitor expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCommand {
    SendKey(String),
    SendCombo(Vec<String>),
    MouseMove { dx: i32, dy: i32 },
    MouseButton(u8),
    ScreenDump(String),
    ChangeVnc(u16),
    Quit,
}

impl fmt::Display for MonitorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorCommand::SendKey(code) => write!(f, "sendkey {code}"),
            MonitorCommand::SendCombo(codes) => write!(f, "sendkey {}", codes.join("-")),
            MonitorCommand::MouseMove { dx, dy } => write!(f, "mouse_move {dx} {dy}"),
            MonitorCommand::MouseButton(mask) => write!(f, "mouse_button {mask}"),
            MonitorCommand::ScreenDump(path) => write!(f, "screendump {path}"),
            MonitorCommand::ChangeVnc(display) => write!(f, "change vnc :{display}"),
            MonitorCommand::Quit => f.write_str("quit"),
        }
    }
}

/// Bytes to write for `command`, switching `mode` into the monitor first if
/// needed.
pub fn encode_command(mode: &mut ChannelMode, escape: &str, command: &str) -> Vec<u8> {
    let mut wire = Vec::with_capacity(escape.len() + command.len() + 1);
    if *mode != ChannelMode::Command {
        wire.extend_from_slice(escape.as_bytes());
        *mode = ChannelMode::Command;
    }
    wire.extend_from_slice(command.as_bytes());
    wire.push(b'\n');
    wire
}

/// Anything that yields console lines in emission order.
pub trait LineSource {
    /// Next complete line with its terminator stripped, or `None` once
    /// `timeout` has elapsed without one.
    fn read_line(&mut self, timeout: Duration) -> Option<String>;
}

/// Duplex console channel: guest output in, monitor commands out.
pub trait Transport: LineSource {
    /// Write one monitor command, entering command mode first if needed.
    fn send(&mut self, command: &str) -> io::Result<()>;

    fn mode(&self) -> ChannelMode;

    /// Ask the emulator to quit, drain what it prints, then make sure the
    /// process is gone. Calling it twice is a no-op.
    fn shutdown(&mut self) -> io::Result<()>;

    fn send_monitor(&mut self, command: &MonitorCommand) -> io::Result<()> {
        self.send(&command.to_string())
    }

    fn send_key(&mut self, code: &str) -> io::Result<()> {
        self.send_monitor(&MonitorCommand::SendKey(code.to_string()))
    }

    fn send_combo(&mut self, codes: &[&str]) -> io::Result<()> {
        self.send_monitor(&MonitorCommand::SendCombo(
            codes.iter().map(|c| c.to_string()).collect(),
        ))
    }

    fn send_mouse_move(&mut self, dx: i32, dy: i32) -> io::Result<()> {
        self.send_monitor(&MonitorCommand::MouseMove { dx, dy })
    }

    fn send_mouse_buttons(&mut self, mask: u8) -> io::Result<()> {
        self.send_monitor(&MonitorCommand::MouseButton(mask))
    }

    fn send_screendump(&mut self, path: &str) -> io::Result<()> {
        self.send_monitor(&MonitorCommand::ScreenDump(path.to_string()))
    }
}

/// What the blocked reader can be woken by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// A complete console line.
    Line(String),
    /// The watchdog gave up on the read armed with this generation.
    Cancelled(u64),
    /// The console pipe reached EOF.
    Closed,
}

/// Splits a byte stream into lines on `\n` or `\r`.
///
/// A `\r\n` pair counts as one terminator. Bytes are decoded lossily per line
/// so a stray non-UTF-8 byte never stalls the stream. Output that runs past
/// [`MAX_LINE_BYTES`] without a terminator is emitted in pieces of that size.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    /// Feed a chunk; returns every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr => {
                    self.after_cr = false;
                }
                b'\n' | b'\r' => {
                    self.after_cr = byte == b'\r';
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
                _ => {
                    self.after_cr = false;
                    self.pending.push(byte);
                    if self.pending.len() >= MAX_LINE_BYTES {
                        lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                        self.pending.clear();
                    }
                }
            }
        }
        lines
    }

    /// Trailing bytes with no terminator, if any.
    pub fn finish(&mut self) -> Option<String> {
        self.after_cr = false;
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}
