use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::idle::SchedulerTrace;
use crate::transport::DEFAULT_MONITOR_ESCAPE;
use crate::transport::monitor::{LaunchSpec, MonitorSettings};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".vmharness";

/// How to bring up the emulator.
///
/// ```toml
/// [launch]
/// program = "make"
/// args = ["-C", "rundir/", "ARCH={arch}", "NOTEE=1"]
/// ```
#[derive(Debug, Deserialize)]
pub struct LaunchConfig {
    #[serde(default = "default_launch_program")]
    pub program: String,
    /// `{arch}` is replaced with the target architecture.
    #[serde(default = "default_launch_args")]
    pub args: Vec<String>,
    /// Relative to the project root.
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default = "default_arch")]
    pub arch: String,
}

#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_escape")]
    pub escape: String,
    /// VNC display to move the emulator to after launch; unset leaves it alone.
    #[serde(default = "default_vnc_display")]
    pub vnc_display: Option<u16>,
    #[serde(default = "default_drain_slice_millis")]
    pub drain_slice_millis: u64,
    #[serde(default = "default_drain_limit_secs")]
    pub drain_limit_secs: u64,
    #[serde(default = "default_terminate_grace_millis")]
    pub terminate_grace_millis: u64,
}

#[derive(Debug, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_enabled")]
    pub enabled: bool,
    #[serde(default = "default_watchdog_grace_millis")]
    pub grace_millis: u64,
}

/// Idle heuristic defaults.
///
/// ```toml
/// [idle]
/// timeout_secs = 10.0
/// idle_secs = 2.0
/// flush_limit_secs = 30.0
/// housekeeping_tasks = ["IRQ Worker", "GUI Timer"]
/// ```
#[derive(Debug, Deserialize)]
pub struct IdleConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_idle_secs")]
    pub idle_secs: f64,
    /// Upper bound on a post-failure flush or a `settle` step.
    #[serde(default = "default_flush_limit_secs")]
    pub flush_limit_secs: f64,
    #[serde(default = "SchedulerTrace::default_housekeeping")]
    pub housekeeping_tasks: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ArtifactsConfig {
    /// Directory that holds one `test-<arch>-<name>` directory per scenario.
    #[serde(default = "default_artifacts_root")]
    pub root: String,
    #[serde(default = "default_lastlog_limit")]
    pub lastlog_limit: usize,
}

/// Optional screen recorder attached to the VNC display.
///
/// `{output}` and `{display}` are substituted in `args`.
#[derive(Debug, Clone, Deserialize)]
pub struct VideoConfig {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default = "default_video_args")]
    pub args: Vec<String>,
    #[serde(default = "default_video_file")]
    pub file_name: String,
}

fn default_launch_program() -> String {
    "make".to_string()
}

fn default_launch_args() -> Vec<String> {
    vec![
        "-C".to_string(),
        "rundir/".to_string(),
        "ARCH={arch}".to_string(),
        "NOTEE=1".to_string(),
    ]
}

fn default_arch() -> String {
    "amd64".to_string()
}

fn default_monitor_escape() -> String {
    DEFAULT_MONITOR_ESCAPE.to_string()
}

fn default_vnc_display() -> Option<u16> {
    Some(99)
}

fn default_drain_slice_millis() -> u64 {
    200
}

fn default_drain_limit_secs() -> u64 {
    5
}

fn default_terminate_grace_millis() -> u64 {
    1000
}

fn default_watchdog_enabled() -> bool {
    true
}

fn default_watchdog_grace_millis() -> u64 {
    2000
}

fn default_idle_timeout_secs() -> f64 {
    10.0
}

fn default_idle_secs() -> f64 {
    2.0
}

fn default_flush_limit_secs() -> f64 {
    30.0
}

fn default_artifacts_root() -> String {
    "rundir".to_string()
}

fn default_lastlog_limit() -> usize {
    crate::oracle::DEFAULT_LASTLOG_LIMIT
}

fn default_video_args() -> Vec<String> {
    vec![
        "-o".to_string(),
        "{output}".to_string(),
        "localhost:{display}".to_string(),
    ]
}

fn default_video_file() -> String {
    "video.flv".to_string()
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            program: default_launch_program(),
            args: default_launch_args(),
            work_dir: None,
            arch: default_arch(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            escape: default_monitor_escape(),
            vnc_display: default_vnc_display(),
            drain_slice_millis: default_drain_slice_millis(),
            drain_limit_secs: default_drain_limit_secs(),
            terminate_grace_millis: default_terminate_grace_millis(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: default_watchdog_enabled(),
            grace_millis: default_watchdog_grace_millis(),
        }
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_idle_timeout_secs(),
            idle_secs: default_idle_secs(),
            flush_limit_secs: default_flush_limit_secs(),
            housekeeping_tasks: SchedulerTrace::default_housekeeping(),
        }
    }
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            root: default_artifacts_root(),
            lastlog_limit: default_lastlog_limit(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: default_video_args(),
            file_name: default_video_file(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct HarnessConfig {
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub video: VideoConfig,
}

impl HarnessConfig {
    /// Search upward from `start` for a `.vmharness/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: HarnessConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((HarnessConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Directory relative paths in the config are resolved against: the one
    /// holding `.vmharness/`, or `cwd` when running on defaults.
    pub fn project_root(config_path: Option<&Path>, cwd: &Path) -> PathBuf {
        config_path
            .and_then(|p| p.parent())
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf())
    }

    pub fn launch_spec(&self, arch: &str, project_root: &Path) -> LaunchSpec {
        LaunchSpec {
            program: self.launch.program.clone(),
            args: self
                .launch
                .args
                .iter()
                .map(|arg| arg.replace("{arch}", arch))
                .collect(),
            work_dir: Some(match &self.launch.work_dir {
                Some(dir) => project_root.join(dir),
                None => project_root.to_path_buf(),
            }),
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            escape: self.monitor.escape.clone(),
            drain_slice: Duration::from_millis(self.monitor.drain_slice_millis),
            drain_limit: Duration::from_secs(self.monitor.drain_limit_secs),
            terminate_grace: Duration::from_millis(self.monitor.terminate_grace_millis),
            watchdog_grace: self
                .watchdog
                .enabled
                .then(|| Duration::from_millis(self.watchdog.grace_millis)),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        secs(self.idle.timeout_secs)
    }

    pub fn idle_time(&self) -> Duration {
        secs(self.idle.idle_secs)
    }

    pub fn flush_limit(&self) -> Duration {
        secs(self.idle.flush_limit_secs)
    }

    pub fn artifacts_root(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.artifacts.root)
    }
}

/// Seconds from config/scenario files. Negative or NaN values clamp to zero;
/// values too large for a `Duration` (including infinity) become
/// `Duration::MAX`, which every wait treats as unbounded.
pub fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .vmharness/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

/// Human-readable rendering for `vmharness config`.
pub fn render_config_human(config: &HarnessConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Launch\n");
    push_kv(&mut output, "program", &config.launch.program);
    push_kv(&mut output, "args", list_or_none(&config.launch.args));
    push_kv(
        &mut output,
        "work_dir",
        config.launch.work_dir.as_deref().unwrap_or("(project root)"),
    );
    push_kv(&mut output, "arch", &config.launch.arch);
    output.push('\n');

    output.push_str("Monitor\n");
    push_kv(&mut output, "escape", format!("{:?}", config.monitor.escape));
    push_kv(
        &mut output,
        "vnc_display",
        config
            .monitor
            .vnc_display
            .map(|d| format!(":{d}"))
            .unwrap_or_else(|| "(unchanged)".to_string()),
    );
    push_kv(&mut output, "drain_slice", format!("{}ms", config.monitor.drain_slice_millis));
    push_kv(&mut output, "drain_limit", format!("{}s", config.monitor.drain_limit_secs));
    push_kv(
        &mut output,
        "terminate_grace",
        format!("{}ms", config.monitor.terminate_grace_millis),
    );
    output.push('\n');

    output.push_str("Watchdog\n");
    push_kv(&mut output, "enabled", config.watchdog.enabled);
    push_kv(&mut output, "grace", format!("{}ms", config.watchdog.grace_millis));
    output.push('\n');

    output.push_str("Idle\n");
    push_kv(&mut output, "timeout", format!("{}s", config.idle.timeout_secs));
    push_kv(&mut output, "idle_time", format!("{}s", config.idle.idle_secs));
    push_kv(&mut output, "flush_limit", format!("{}s", config.idle.flush_limit_secs));
    push_kv(
        &mut output,
        "housekeeping_tasks",
        list_or_none(&config.idle.housekeeping_tasks),
    );
    output.push('\n');

    output.push_str("Artifacts\n");
    push_kv(&mut output, "root", &config.artifacts.root);
    push_kv(&mut output, "lastlog_limit", config.artifacts.lastlog_limit);
    output.push('\n');

    output.push_str("Video\n");
    push_kv(
        &mut output,
        "program",
        config.video.program.as_deref().unwrap_or("(disabled)"),
    );
    push_kv(&mut output, "args", list_or_none(&config.video.args));
    push_kv(&mut output, "file_name", &config.video.file_name);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

/// JSON rendering for `vmharness config --json`.
pub fn render_config_json(config: &HarnessConfig, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "launch": {
            "program": &config.launch.program,
            "args": &config.launch.args,
            "work_dir": config.launch.work_dir.clone(),
            "arch": &config.launch.arch
        },
        "monitor": {
            "escape": &config.monitor.escape,
            "vnc_display": config.monitor.vnc_display,
            "drain_slice_millis": config.monitor.drain_slice_millis,
            "drain_limit_secs": config.monitor.drain_limit_secs,
            "terminate_grace_millis": config.monitor.terminate_grace_millis
        },
        "watchdog": {
            "enabled": config.watchdog.enabled,
            "grace_millis": config.watchdog.grace_millis
        },
        "idle": {
            "timeout_secs": config.idle.timeout_secs,
            "idle_secs": config.idle.idle_secs,
            "flush_limit_secs": config.idle.flush_limit_secs,
            "housekeeping_tasks": &config.idle.housekeeping_tasks
        },
        "artifacts": {
            "root": &config.artifacts.root,
            "lastlog_limit": config.artifacts.lastlog_limit
        },
        "video": {
            "program": config.video.program.clone(),
            "args": &config.video.args,
            "file_name": &config.video.file_name
        },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = HarnessConfig::default();
        assert_eq!(config.launch.program, "make");
        assert_eq!(config.launch.args, vec!["-C", "rundir/", "ARCH={arch}", "NOTEE=1"]);
        assert_eq!(config.launch.arch, "amd64");
        assert_eq!(config.monitor.escape, "\x01c");
        assert_eq!(config.monitor.vnc_display, Some(99));
        assert!(config.watchdog.enabled);
        assert_eq!(config.watchdog.grace_millis, 2000);
        assert_eq!(config.idle_timeout(), Duration::from_secs(10));
        assert_eq!(config.idle_time(), Duration::from_secs(2));
        assert_eq!(config.flush_limit(), Duration::from_secs(30));
        assert_eq!(config.idle.housekeeping_tasks, vec!["IRQ Worker", "GUI Timer"]);
        assert_eq!(config.artifacts.root, "rundir");
        assert!(config.video.program.is_none());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[launch]
program = "qemu-system-x86_64"
args = ["-kernel", "kernel-{arch}.bin", "-serial", "mon:stdio"]
work_dir = "build"
arch = "x86"

[monitor]
escape = "\u0001c"
vnc_display = 7
drain_slice_millis = 100
drain_limit_secs = 2
terminate_grace_millis = 250

[watchdog]
enabled = false
grace_millis = 500

[idle]
timeout_secs = 20
idle_secs = 1.5
housekeeping_tasks = ["Net Poller"]

[artifacts]
root = "out"
lastlog_limit = 50

[video]
program = "flvrec.py"
file_name = "run.flv"
"#;
        let config: HarnessConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.launch.program, "qemu-system-x86_64");
        assert_eq!(config.launch.arch, "x86");
        assert_eq!(config.monitor.vnc_display, Some(7));
        assert!(!config.watchdog.enabled);
        assert_eq!(config.idle_timeout(), Duration::from_secs(20));
        assert_eq!(config.idle_time(), Duration::from_millis(1500));
        assert_eq!(config.idle.housekeeping_tasks, vec!["Net Poller"]);
        assert_eq!(config.artifacts.lastlog_limit, 50);
        assert_eq!(config.video.program.as_deref(), Some("flvrec.py"));
        assert_eq!(config.video.args, vec!["-o", "{output}", "localhost:{display}"]);

        let settings = config.monitor_settings();
        assert_eq!(settings.drain_slice, Duration::from_millis(100));
        assert_eq!(settings.terminate_grace, Duration::from_millis(250));
        assert!(settings.watchdog_grace.is_none());
    }

    #[test]
    fn launch_spec_substitutes_arch_and_resolves_work_dir() {
        let toml = r#"
[launch]
args = ["ARCH={arch}", "-v"]
work_dir = "rundir"
"#;
        let config: HarnessConfig = toml::from_str(toml).unwrap();
        let spec = config.launch_spec("armv8", Path::new("/proj"));
        assert_eq!(spec.program, "make");
        assert_eq!(spec.args, vec!["ARCH=armv8", "-v"]);
        assert_eq!(spec.work_dir, Some(PathBuf::from("/proj/rundir")));
    }

    #[test]
    fn watchdog_enabled_by_default_in_settings() {
        let settings = HarnessConfig::default().monitor_settings();
        assert_eq!(settings.watchdog_grace, Some(Duration::from_secs(2)));
        assert_eq!(settings.drain_limit, Duration::from_secs(5));
    }

    #[test]
    fn negative_seconds_clamp_to_zero() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(0.25), Duration::from_millis(250));
    }

    #[test]
    fn oversized_seconds_mean_unbounded() {
        assert_eq!(secs(1e20), Duration::MAX);
        assert_eq!(secs(f64::INFINITY), Duration::MAX);
        assert_eq!(secs(f64::NEG_INFINITY), Duration::ZERO);
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(".vmharness");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("config.toml"),
            r#"
[launch]
arch = "armv7"
"#,
        )
        .unwrap();

        let nested = tmp.path().join("SystemTest").join("scenarios");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = HarnessConfig::load(&nested).unwrap();
        let path = path.unwrap();
        assert_eq!(config.launch.arch, "armv7");
        assert_eq!(
            HarnessConfig::project_root(Some(&path), &nested),
            tmp.path().to_path_buf()
        );
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = HarnessConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.launch.program, "make");
        assert_eq!(
            HarnessConfig::project_root(None, tmp.path()),
            tmp.path().to_path_buf()
        );
    }

    #[test]
    fn malformed_config_reports_path() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(".vmharness");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("config.toml"), "[idle]\nidle_secs = \"soon\"\n").unwrap();

        let err = HarnessConfig::load(tmp.path()).unwrap_err();
        assert!(format!("{err}").contains("failed to parse"));
    }

    #[test]
    fn render_config_human_groups_sections() {
        let config = HarnessConfig::default();
        let rendered = render_config_human(&config, None);

        assert!(rendered.contains("Launch"));
        assert!(rendered.contains("Watchdog"));
        assert!(rendered.contains("Source Path"));
        assert!(rendered.contains("-C, rundir/, ARCH={arch}, NOTEE=1"));
        assert!(rendered.contains(":99"));
        assert!(rendered.contains("IRQ Worker, GUI Timer"));
        assert!(rendered.contains("(defaults, no .vmharness/config.toml found)"));
    }

    #[test]
    fn render_config_json_is_valid_and_contains_expected_fields() {
        let config = HarnessConfig::default();
        let json = render_config_json(&config, Some(Path::new("/p/.vmharness/config.toml"))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["launch"]["program"], "make");
        assert_eq!(value["monitor"]["escape"], "\u{1}c");
        assert_eq!(value["monitor"]["vnc_display"], 99);
        assert_eq!(value["watchdog"]["enabled"], true);
        assert_eq!(value["idle"]["timeout_secs"], 10.0);
        assert!(value["video"]["program"].is_null());
        assert_eq!(value["source_path"], "/p/.vmharness/config.toml");
    }
}
