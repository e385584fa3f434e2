//! Process-backed console transport.
//!
//! Spawns the emulator with piped stdio. A pump thread reads stdout in chunks,
//! splits it into lines and forwards them over a channel, so the caller only
//! ever blocks in `recv_timeout` against its own deadline. A wedged emulator
//! cannot hold a read past that deadline, and the optional watchdog covers the
//! case where even that guarantee is in doubt.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::{
    ChannelMode, LineSource, LineSplitter, MonitorCommand, ReaderEvent, Transport, deadline_after,
};
use crate::signals::strip_ansi;
use crate::watchdog::Watchdog;

/// How long shutdown waits for the pump thread after the process is gone.
const PUMP_JOIN_LIMIT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Command line used to bring up the emulator.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
}

/// Timing knobs for the monitor channel.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Bytes that switch the console multiplexer into the monitor.
    pub escape: String,
    /// Per-read timeout while draining output at shutdown.
    pub drain_slice: Duration,
    /// Upper bound on the whole shutdown drain.
    pub drain_limit: Duration,
    /// Time between SIGTERM and a hard kill.
    pub terminate_grace: Duration,
    /// Watchdog grace period; `None` disables the watchdog.
    pub watchdog_grace: Option<Duration>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            escape: super::DEFAULT_MONITOR_ESCAPE.to_string(),
            drain_slice: Duration::from_millis(200),
            drain_limit: Duration::from_secs(5),
            terminate_grace: Duration::from_secs(1),
            watchdog_grace: Some(Duration::from_secs(2)),
        }
    }
}

/// Console transport over a child process's stdin/stdout.
pub struct MonitorTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    events: Receiver<ReaderEvent>,
    pump: Option<JoinHandle<()>>,
    watchdog: Option<Watchdog>,
    settings: MonitorSettings,
    mode: ChannelMode,
    eof: bool,
    shut_down: bool,
}

impl MonitorTransport {
    /// Launch the emulator and start the output pump (and watchdog, if
    /// configured).
    pub fn spawn(launch: &LaunchSpec, settings: MonitorSettings) -> Result<Self> {
        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &launch.work_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            // Own process group, so shutdown also reaches the emulator when
            // the launcher is a wrapper (make, a shell script).
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        info!(
            program = %launch.program,
            args = ?launch.args,
            "launching emulator"
        );
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to launch '{}'", launch.program))?;

        let stdin = child.stdin.take().context("emulator stdin was not piped")?;
        let stdout = child.stdout.take().context("emulator stdout was not piped")?;

        let (tx, rx) = mpsc::channel();
        let watchdog = match settings.watchdog_grace {
            Some(grace) => Some(
                Watchdog::spawn(grace, tx.clone()).context("failed to start read watchdog")?,
            ),
            None => None,
        };
        let pump = thread::Builder::new()
            .name("vmharness-console".to_string())
            .spawn(move || pump_output(stdout, tx))
            .context("failed to start console reader")?;

        Ok(Self {
            child,
            stdin: Some(stdin),
            events: rx,
            pump: Some(pump),
            watchdog,
            settings,
            mode: ChannelMode::Passthrough,
            eof: false,
            shut_down: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    fn drain_output(&mut self) {
        let stop_at = deadline_after(Instant::now(), self.settings.drain_limit);
        let slice = self.settings.drain_slice;
        while Instant::now() < stop_at {
            match self.read_line(slice) {
                Some(line) => debug!(line = %strip_ansi(&line), "shutdown output"),
                None => break,
            }
        }
    }

    fn join_pump(&mut self) {
        let Some(handle) = self.pump.take() else {
            return;
        };
        let give_up = deadline_after(Instant::now(), PUMP_JOIN_LIMIT);
        while !handle.is_finished() && Instant::now() < give_up {
            thread::sleep(POLL_INTERVAL);
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            // Something outside our process group still holds the pipe.
            warn!("console reader still attached after shutdown; detaching");
        }
    }
}

impl LineSource for MonitorTransport {
    fn read_line(&mut self, timeout: Duration) -> Option<String> {
        let deadline = deadline_after(Instant::now(), timeout);
        let generation = self.watchdog.as_ref().map(|dog| dog.arm(deadline));
        let line = recv_until(&self.events, &mut self.eof, deadline, generation);
        if let Some(dog) = &self.watchdog {
            dog.disarm();
        }
        line
    }
}

impl Transport for MonitorTransport {
    fn send(&mut self, command: &str) -> io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "monitor input already closed")
        })?;
        let wire = super::encode_command(&mut self.mode, &self.settings.escape, command);
        info!(command, ">> CMD");
        stdin.write_all(&wire)?;
        stdin.flush()
    }

    fn mode(&self) -> ChannelMode {
        self.mode
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        if let Err(e) = self.send_monitor(&MonitorCommand::Quit) {
            debug!(error = %e, "quit command not delivered");
        }
        self.drain_output();
        drop(self.stdin.take());

        let result = terminate(&mut self.child, self.settings.terminate_grace, "emulator");
        if let Some(dog) = self.watchdog.take() {
            dog.stop();
        }
        self.join_pump();
        result
    }
}

impl Drop for MonitorTransport {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "emulator shutdown failed");
        }
    }
}

/// Next line from the reader channel before `deadline`.
///
/// A cancellation carrying `generation` ends the read early; one carrying any
/// other generation belongs to an earlier read and is skipped. Once the pipe
/// has closed, `eof` is set and every read returns `None` at once.
fn recv_until(
    events: &Receiver<ReaderEvent>,
    eof: &mut bool,
    deadline: Instant,
    generation: Option<u64>,
) -> Option<String> {
    loop {
        if *eof {
            return None;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(ReaderEvent::Line(line)) => return Some(line),
            Ok(ReaderEvent::Cancelled(cancelled)) if Some(cancelled) == generation => {
                warn!(generation = cancelled, "console read cancelled by watchdog");
                return None;
            }
            Ok(ReaderEvent::Cancelled(stale)) => {
                debug!(generation = stale, "ignoring stale watchdog cancellation");
            }
            Ok(ReaderEvent::Closed) => {
                debug!("console output closed");
                *eof = true;
            }
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => {
                *eof = true;
            }
        }
    }
}

fn pump_output(mut stdout: ChildStdout, tx: Sender<ReaderEvent>) {
    let mut splitter = LineSplitter::default();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("console read error (emulator likely exited): {e}");
                break;
            }
        };
        for line in splitter.push(&buf[..n]) {
            if tx.send(ReaderEvent::Line(line)).is_err() {
                return;
            }
        }
    }
    if let Some(rest) = splitter.finish() {
        let _ = tx.send(ReaderEvent::Line(rest));
    }
    let _ = tx.send(ReaderEvent::Closed);
}

/// Ask the process group led by `child` to exit, then kill it if it does not.
pub(crate) fn terminate(child: &mut Child, grace: Duration, label: &str) -> io::Result<()> {
    if let Some(status) = child.try_wait()? {
        info!(%status, "{label} already exited");
        return Ok(());
    }

    #[cfg(unix)]
    signal_group(child, libc::SIGTERM);

    let give_up = deadline_after(Instant::now(), grace);
    while Instant::now() < give_up {
        if let Some(status) = child.try_wait()? {
            info!(%status, "{label} exited");
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }

    info!("killing {label}");
    #[cfg(unix)]
    signal_group(child, libc::SIGKILL);
    match child.kill() {
        Ok(()) => {}
        // Already reaped by the group signal.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    child.wait().map(|_| ())
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid targets the process group we
    // created at spawn time; it has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        debug!(
            signal,
            error = %io::Error::last_os_error(),
            "process group signal failed"
        );
    }
}
