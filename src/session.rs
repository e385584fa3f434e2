//! One emulator instance and everything a scenario does to it.
//!
//! A [`Session`] owns the transport, the log oracle, the artifact directory
//! and the run log. Input is sent through the monitor; the guest's pointer
//! position and button state are tracked here because the monitor only
//! accepts relative motion and whole button masks.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};

use crate::artifacts::{ArtifactDir, VideoRecorder};
use crate::config::{HarnessConfig, VideoConfig};
use crate::failure::TestFailure;
use crate::idle::SchedulerTrace;
use crate::log::{LogEvent, RunLog, WaitKind, WaitOutcome};
use crate::oracle::{CaptureSet, LogOracle, compile_pattern};
use crate::transport::monitor::MonitorTransport;
use crate::transport::{MonitorCommand, Transport, deadline_after};

/// Monitor key names for one typed character.
pub(crate) fn keys_for_char(c: char) -> Result<MonitorCommand, TestFailure> {
    let key = |k: &str| MonitorCommand::SendKey(k.to_string());
    Ok(match c {
        'a'..='z' => MonitorCommand::SendKey(c.to_string()),
        'A'..='Z' => MonitorCommand::SendCombo(vec![
            "shift".to_string(),
            c.to_ascii_lowercase().to_string(),
        ]),
        '\n' => key("ret"),
        ' ' => key("spc"),
        '/' => key("slash"),
        other => return Err(TestFailure::UnsupportedCharacter(other)),
    })
}

pub(crate) fn button_bit(button: u8) -> Result<u8, TestFailure> {
    if (1..=3).contains(&button) {
        Ok(1 << (button - 1))
    } else {
        Err(TestFailure::InvalidButton(button))
    }
}

pub struct Session<T: Transport = MonitorTransport> {
    arch: String,
    name: String,
    transport: T,
    oracle: LogOracle,
    idle_timeout: Duration,
    idle_time: Duration,
    flush_limit: Duration,
    artifacts: ArtifactDir,
    run_log: RunLog,
    video: VideoConfig,
    vnc_display: Option<u16>,
    recorder: Option<VideoRecorder>,
    cursor: (i32, i32),
    buttons: u8,
    finished: bool,
}

impl Session<MonitorTransport> {
    /// Prepare the artifact directory and launch the emulator.
    pub fn launch(config: &HarnessConfig, project_root: &Path, arch: &str, name: &str) -> Result<Self> {
        let artifacts = ArtifactDir::prepare(&config.artifacts_root(project_root), arch, name)?;
        let spec = config.launch_spec(arch, project_root);
        let transport = MonitorTransport::spawn(&spec, config.monitor_settings())?;
        let pid = transport.pid();
        Session::assemble(transport, Some(pid), config, artifacts, arch, name)
    }
}

impl<T: Transport> Session<T> {
    /// Wrap an already running transport.
    pub fn with_transport(
        transport: T,
        config: &HarnessConfig,
        artifacts: ArtifactDir,
        arch: &str,
        name: &str,
    ) -> Result<Self> {
        Session::assemble(transport, None, config, artifacts, arch, name)
    }

    fn assemble(
        transport: T,
        pid: Option<u32>,
        config: &HarnessConfig,
        artifacts: ArtifactDir,
        arch: &str,
        name: &str,
    ) -> Result<Self> {
        let run_log = RunLog::new(&artifacts.run_log())?;
        let oracle = LogOracle::new(SchedulerTrace::new(&config.idle.housekeeping_tasks))
            .with_lastlog_limit(config.artifacts.lastlog_limit);

        let mut session = Self {
            arch: arch.to_string(),
            name: name.to_string(),
            transport,
            oracle,
            idle_timeout: config.idle_timeout(),
            idle_time: config.idle_time(),
            flush_limit: config.flush_limit(),
            artifacts,
            run_log,
            video: config.video.clone(),
            vnc_display: config.monitor.vnc_display,
            recorder: None,
            cursor: (0, 0),
            buttons: 0,
            finished: false,
        };
        session.run_log.record(LogEvent::SessionStarted {
            arch: session.arch.clone(),
            name: session.name.clone(),
            program: config.launch.program.clone(),
            pid,
        });
        info!(
            arch = %session.arch,
            name = %session.name,
            artifacts = %session.artifacts.path().display(),
            "session started"
        );

        if let Some(display) = session.vnc_display {
            session
                .command(MonitorCommand::ChangeVnc(display))
                .context("failed to move the emulator display to VNC")?;
        }
        Ok(session)
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn artifacts(&self) -> &ArtifactDir {
        &self.artifacts
    }

    pub fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    /// Pointer position as last set by [`Session::mouse_to`].
    pub fn cursor(&self) -> (i32, i32) {
        self.cursor
    }

    /// Currently pressed buttons, bit `n - 1` for button `n`.
    pub fn buttons(&self) -> u8 {
        self.buttons
    }

    /// Configured `(timeout, idle_time)` for idle waits.
    pub fn idle_defaults(&self) -> (Duration, Duration) {
        (self.idle_timeout, self.idle_time)
    }

    /// Upper bound on [`Session::flush`] and the default for
    /// [`Session::settle`].
    pub fn flush_limit(&self) -> Duration {
        self.flush_limit
    }

    pub fn lastlog(&self) -> Vec<String> {
        self.oracle.lastlog()
    }

    pub fn wait_count(&self) -> u64 {
        self.oracle.wait_count()
    }

    fn command(&mut self, command: MonitorCommand) -> Result<(), TestFailure> {
        let text = command.to_string();
        self.transport.send(&text)?;
        self.run_log.record(LogEvent::CommandSent { command: text });
        Ok(())
    }

    pub fn send_key(&mut self, key: &str) -> Result<(), TestFailure> {
        self.command(MonitorCommand::SendKey(key.to_string()))
    }

    pub fn type_key(&mut self, key: &str) -> Result<(), TestFailure> {
        self.send_key(key)
    }

    /// Press `keys` together, e.g. `["ctrl", "alt", "delete"]`.
    pub fn send_combo<S: AsRef<str>>(&mut self, keys: &[S]) -> Result<(), TestFailure> {
        self.command(MonitorCommand::SendCombo(
            keys.iter().map(|k| k.as_ref().to_string()).collect(),
        ))
    }

    pub fn type_combo<S: AsRef<str>>(&mut self, keys: &[S]) -> Result<(), TestFailure> {
        self.send_combo(keys)
    }

    /// Type `text` on the guest keyboard.
    ///
    /// Only lowercase and uppercase ASCII letters, newline, space and `/` are
    /// supported. The whole string is checked before any key is sent, so an
    /// unsupported character leaves the guest untouched.
    pub fn type_string(&mut self, text: &str) -> Result<(), TestFailure> {
        let commands = text
            .chars()
            .map(keys_for_char)
            .collect::<Result<Vec<_>, _>>()?;
        for command in commands {
            self.command(command)?;
        }
        Ok(())
    }

    /// Move the pointer to absolute `(x, y)` by sending the relative delta.
    pub fn mouse_to(&mut self, x: i32, y: i32) -> Result<(), TestFailure> {
        let delta = x
            .checked_sub(self.cursor.0)
            .zip(y.checked_sub(self.cursor.1));
        let Some((dx, dy)) = delta else {
            return Err(TestFailure::PointerOutOfRange { x, y });
        };
        self.command(MonitorCommand::MouseMove { dx, dy })?;
        self.cursor = (x, y);
        Ok(())
    }

    pub fn mouse_press(&mut self, button: u8) -> Result<(), TestFailure> {
        let mask = self.buttons | button_bit(button)?;
        self.command(MonitorCommand::MouseButton(mask))?;
        self.buttons = mask;
        Ok(())
    }

    pub fn mouse_release(&mut self, button: u8) -> Result<(), TestFailure> {
        let mask = self.buttons & !button_bit(button)?;
        self.command(MonitorCommand::MouseButton(mask))?;
        self.buttons = mask;
        Ok(())
    }

    /// Dump the screen to `<artifacts>/<idx>-<tag>.ppm` and return the path.
    pub fn screenshot(&mut self, tag: &str) -> Result<PathBuf, TestFailure> {
        let path = self.artifacts.next_screenshot(tag);
        self.command(MonitorCommand::ScreenDump(path.display().to_string()))?;
        self.run_log.record(LogEvent::Screenshot {
            path: path.display().to_string(),
        });
        Ok(path)
    }

    /// Start recording the VNC display, if a recorder is configured.
    ///
    /// Without `video.program` or `monitor.vnc_display` this only warns.
    pub fn start_capture(&mut self) -> Result<(), TestFailure> {
        if self.recorder.is_some() {
            return Ok(());
        }
        let Some(program) = self.video.program.clone() else {
            warn!("start_capture: no video.program configured; not recording");
            return Ok(());
        };
        let Some(display) = self.vnc_display else {
            warn!("start_capture: no monitor.vnc_display configured; not recording");
            return Ok(());
        };
        let output = self.artifacts.video(&self.video.file_name);
        let recorder = VideoRecorder::start(&program, &self.video, &output, display)
            .map_err(TestFailure::Recorder)?;
        self.run_log.record(LogEvent::CaptureStarted {
            path: output.display().to_string(),
        });
        self.recorder = Some(recorder);
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.recorder.is_some()
    }

    /// Wait for a line matching `pattern`. `Ok(None)` means the timeout ran
    /// out.
    pub fn wait_for_line(
        &mut self,
        pattern: &str,
        timeout: Duration,
    ) -> Result<Option<CaptureSet>, TestFailure> {
        let regex = compile_pattern(pattern)?;
        self.wait_for_regex(&regex, timeout)
    }

    pub fn wait_for_regex(
        &mut self,
        pattern: &Regex,
        timeout: Duration,
    ) -> Result<Option<CaptureSet>, TestFailure> {
        let wait = self.oracle.wait_count() + 1;
        self.run_log.record(LogEvent::WaitStarted {
            wait,
            kind: WaitKind::Line,
            pattern: Some(pattern.as_str().to_string()),
            timeout_secs: timeout.as_secs_f64(),
        });
        let started = Instant::now();
        let result = self.oracle.wait_for_line(&mut self.transport, pattern, timeout);
        let outcome = match &result {
            Ok(Some(_)) => WaitOutcome::Matched,
            Ok(None) => WaitOutcome::TimedOut,
            Err(_) => WaitOutcome::Fatal,
        };
        self.finish_wait(wait, WaitKind::Line, outcome, started, result.as_ref().err());
        result
    }

    /// Wait until the guest has been idle for `idle_time`.
    pub fn wait_for_idle(&mut self, timeout: Duration, idle_time: Duration) -> Result<bool, TestFailure> {
        let wait = self.oracle.wait_count() + 1;
        self.run_log.record(LogEvent::WaitStarted {
            wait,
            kind: WaitKind::Idle,
            pattern: None,
            timeout_secs: timeout.as_secs_f64(),
        });
        let started = Instant::now();
        let result = self.oracle.wait_for_idle(&mut self.transport, timeout, idle_time);
        let outcome = match &result {
            Ok(true) => WaitOutcome::Idle,
            Ok(false) => WaitOutcome::TimedOut,
            Err(_) => WaitOutcome::Fatal,
        };
        self.finish_wait(wait, WaitKind::Idle, outcome, started, result.as_ref().err());
        result
    }

    /// [`Session::wait_for_idle`] with the configured timeout and idle window.
    pub fn wait_for_idle_default(&mut self) -> Result<bool, TestFailure> {
        self.wait_for_idle(self.idle_timeout, self.idle_time)
    }

    fn finish_wait(
        &self,
        wait: u64,
        kind: WaitKind,
        outcome: WaitOutcome,
        started: Instant,
        failure: Option<&TestFailure>,
    ) {
        if let Some(TestFailure::Fatal { kind: fault, line }) = failure {
            self.run_log.record(LogEvent::FatalSignature {
                kind: fault.to_string(),
                line: line.clone(),
            });
        }
        self.run_log.record(LogEvent::WaitFinished {
            wait,
            kind,
            outcome,
            elapsed_secs: started.elapsed().as_secs_f64(),
        });
    }

    /// Wait for idle repeatedly until one wait times out or `limit` has
    /// passed. Returns the number of idle waits that succeeded.
    pub fn settle(&mut self, timeout: Duration, limit: Duration) -> Result<u32, TestFailure> {
        let stop_at = deadline_after(Instant::now(), limit);
        let mut passes = 0;
        loop {
            let remaining = stop_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                info!(passes, "settle: limit reached while the guest kept idling");
                return Ok(passes);
            }
            if !self.wait_for_idle(timeout.min(remaining), self.idle_time)? {
                return Ok(passes);
            }
            passes += 1;
        }
    }

    /// Let the guest settle within the configured flush limit.
    ///
    /// Used after a failure so the console shows what the guest was doing.
    /// A fault during the flush is reported but not returned.
    pub fn flush(&mut self) {
        if let Err(e) = self.settle(self.idle_timeout, self.flush_limit) {
            println!("{e:?}");
        }
    }

    /// Tear the session down: final screenshot, stop the recorder, shut the
    /// emulator down. Runs once; later calls (and drop) do nothing.
    pub fn finish(&mut self) -> Result<(), TestFailure> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let final_shot = self.artifacts.final_screenshot();
        if let Err(e) = self.command(MonitorCommand::ScreenDump(final_shot.display().to_string())) {
            warn!(error = %e, "final screenshot not taken");
        }
        if let Some(mut recorder) = self.recorder.take() {
            if let Err(e) = recorder.stop() {
                warn!(error = %e, "screen recorder did not stop cleanly");
            }
        }

        let result = self.transport.shutdown();
        self.run_log.record(LogEvent::SessionEnded {
            result: match &result {
                Ok(()) => "shutdown".to_string(),
                Err(e) => format!("shutdown failed: {e}"),
            },
        });
        info!(name = %self.name, "session finished");
        result.map_err(TestFailure::from)
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(error = %e, "session teardown failed");
        }
    }
}
