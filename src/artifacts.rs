//! Per-scenario artifact directory and the optional screen recorder.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::VideoConfig;
use crate::transport::monitor::terminate;

const FINAL_SCREENSHOT_TAG: &str = "z-final";
const RUN_LOG_FILE: &str = "run.jsonl";
const RECORDER_GRACE: Duration = Duration::from_secs(2);

/// Directory name for one scenario run: `test-<arch>-<name>`.
///
/// Path separators in either part are replaced so the directory always sits
/// directly under the artifacts root.
pub fn dir_name(arch: &str, name: &str) -> String {
    let clean = |s: &str| s.replace(['/', '\\'], "_");
    format!("test-{}-{}", clean(arch), clean(name))
}

/// `<root>/test-<arch>-<name>/`, wiped at the start of every run.
#[derive(Debug)]
pub struct ArtifactDir {
    path: PathBuf,
    next_screenshot: u32,
}

impl ArtifactDir {
    /// Remove any previous run's directory and create a fresh one.
    pub fn prepare(root: &Path, arch: &str, name: &str) -> Result<Self> {
        let path = root.join(dir_name(arch, name));
        match std::fs::remove_dir_all(&path) {
            Ok(()) => info!(path = %path.display(), "cleared previous artifacts"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to clear artifact directory {}", path.display())
                });
            }
        }
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create artifact directory {}", path.display()))?;
        let path = path.canonicalize().unwrap_or(path);
        Ok(Self {
            path,
            next_screenshot: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path for the next screenshot: `<idx>-<tag>.ppm`, index starting at 0.
    pub fn next_screenshot(&mut self, tag: &str) -> PathBuf {
        let file = format!("{}-{}.ppm", self.next_screenshot, tag);
        self.next_screenshot += 1;
        self.path.join(file)
    }

    pub fn screenshots_taken(&self) -> u32 {
        self.next_screenshot
    }

    pub fn final_screenshot(&self) -> PathBuf {
        self.path.join(format!("{FINAL_SCREENSHOT_TAG}.ppm"))
    }

    pub fn run_log(&self) -> PathBuf {
        self.path.join(RUN_LOG_FILE)
    }

    pub fn video(&self, file_name: &str) -> PathBuf {
        self.path.join(file_name)
    }
}

/// External process recording the emulator's VNC display.
#[derive(Debug)]
pub struct VideoRecorder {
    child: Child,
    output: PathBuf,
    stopped: bool,
}

impl VideoRecorder {
    /// Spawn `program` with `{output}` and `{display}` substituted in its
    /// arguments.
    pub fn start(program: &str, config: &VideoConfig, output: &Path, display: u16) -> io::Result<Self> {
        let output_str = output.to_string_lossy();
        let display_str = display.to_string();
        let args: Vec<String> = config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{output}", &output_str)
                    .replace("{display}", &display_str)
            })
            .collect();

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        info!(program, args = ?args, "starting screen recorder");
        let child = cmd.spawn()?;
        Ok(Self {
            child,
            output: output.to_path_buf(),
            stopped: false,
        })
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Stop the recorder, giving it a moment to finalize the file.
    pub fn stop(&mut self) -> io::Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        terminate(&mut self.child, RECORDER_GRACE, "screen recorder")
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "screen recorder shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn dir_name_joins_arch_and_name() {
        assert_eq!(dir_name("amd64", "login"), "test-amd64-login");
        assert_eq!(dir_name("amd64", "gui/shell"), "test-amd64-gui_shell");
    }

    #[test]
    fn prepare_clears_previous_run() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = tmp.path().join("test-amd64-boot");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("0-old.ppm"), b"P6").unwrap();

        let dir = ArtifactDir::prepare(tmp.path(), "amd64", "boot").unwrap();
        assert!(dir.path().is_dir());
        assert!(!dir.path().join("0-old.ppm").exists());
        assert!(dir.path().ends_with("test-amd64-boot"));
    }

    #[test]
    fn prepare_creates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("rundir");
        let dir = ArtifactDir::prepare(&root, "armv7", "gui").unwrap();
        assert!(dir.path().is_dir());
    }

    #[test]
    fn screenshots_are_numbered_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = ArtifactDir::prepare(tmp.path(), "amd64", "shots").unwrap();

        let first = dir.next_screenshot("desktop");
        let second = dir.next_screenshot("menu");
        assert_eq!(first.file_name().unwrap(), "0-desktop.ppm");
        assert_eq!(second.file_name().unwrap(), "1-menu.ppm");
        assert_eq!(dir.screenshots_taken(), 2);
        assert_eq!(dir.final_screenshot().file_name().unwrap(), "z-final.ppm");
        assert_eq!(dir.run_log().file_name().unwrap(), "run.jsonl");
        assert!(first.is_absolute());
    }

    #[cfg(unix)]
    #[test]
    fn recorder_substitutes_output_and_display() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("video.flv");
        let config = VideoConfig {
            program: Some("sh".to_string()),
            args: vec![
                "-c".to_string(),
                "echo \"$0 $1\" > \"$0\"".to_string(),
                "{output}".to_string(),
                "localhost:{display}".to_string(),
            ],
            file_name: "video.flv".to_string(),
        };

        let mut recorder = VideoRecorder::start("sh", &config, &output, 99).unwrap();
        assert_eq!(recorder.output(), output);
        // The script exits on its own; stop just reaps it.
        let give_up = std::time::Instant::now() + Duration::from_secs(5);
        while !output.exists() && std::time::Instant::now() < give_up {
            std::thread::sleep(Duration::from_millis(20));
        }
        std::thread::sleep(Duration::from_millis(100));
        recorder.stop().unwrap();

        let written = fs::read_to_string(&output).unwrap();
        assert_eq!(written.trim(), format!("{} localhost:99", output.display()));
    }

    #[cfg(unix)]
    #[test]
    fn stop_kills_long_running_recorder() {
        let tmp = tempfile::tempdir().unwrap();
        let config = VideoConfig {
            program: Some("sleep".to_string()),
            args: vec!["30".to_string()],
            file_name: "video.flv".to_string(),
        };
        let mut recorder =
            VideoRecorder::start("sleep", &config, &tmp.path().join("video.flv"), 99).unwrap();
        let started = std::time::Instant::now();
        recorder.stop().unwrap();
        recorder.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
