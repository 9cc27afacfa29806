use crate::domains::agents::AgentSettings;
use crate::domains::tail::TailSettings;
use anyhow::{bail, Context, Result};
use pty_host::PtyHostConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const AGENT_BIN_ENV: &str = "SWITCHYARD_AGENT_BIN";
pub const PROJECTS_DIR_ENV: &str = "SWITCHYARD_PROJECTS_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub tail: TailConfig,
    pub pty: PtyConfig,
    pub undo: UndoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub binary: String,
    pub projects_dir: PathBuf,
    pub stop_grace_ms: u64,
    pub one_shot_timeout_secs: u64,
    /// Prepended to every agent invocation, before the generated flags.
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            projects_dir: home().join(".claude").join("projects"),
            stop_grace_ms: 3_000,
            one_shot_timeout_secs: 60,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TailConfig {
    pub throttle_ms: u64,
    pub poll_ms: u64,
    pub heartbeat_secs: u64,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 150,
            poll_ms: 500,
            heartbeat_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PtyConfig {
    pub scrollback_max_chars: usize,
    pub scrollback_trim_chars: usize,
    pub exited_retention_ms: u64,
    pub kill_grace_ms: u64,
    pub shell: Option<String>,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            scrollback_max_chars: 50_000,
            scrollback_trim_chars: 40_000,
            exited_retention_ms: 5_000,
            kill_grace_ms: 3_000,
            shell: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UndoConfig {
    pub allowed_roots: Vec<PathBuf>,
    pub snapshot_dir: PathBuf,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            allowed_roots: vec![home()],
            snapshot_dir: data_dir().join("undo"),
        }
    }
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("switchyard")
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("switchyard").join("config.toml"))
}

impl Config {
    /// Loads `path`, or the default location when `None`. A missing file at the
    /// default location yields defaults; an explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    log::debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(binary) = std::env::var(AGENT_BIN_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
        {
            log::debug!("{AGENT_BIN_ENV} overrides agent binary: {binary}");
            self.agent.binary = binary;
        }
        if let Some(dir) = std::env::var_os(PROJECTS_DIR_ENV).filter(|value| !value.is_empty()) {
            self.agent.projects_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pty.scrollback_trim_chars > self.pty.scrollback_max_chars {
            bail!(
                "pty.scrollback_trim_chars ({}) must not exceed pty.scrollback_max_chars ({})",
                self.pty.scrollback_trim_chars,
                self.pty.scrollback_max_chars
            );
        }
        let intervals = [
            ("tail.throttle_ms", self.tail.throttle_ms),
            ("tail.poll_ms", self.tail.poll_ms),
            ("tail.heartbeat_secs", self.tail.heartbeat_secs),
            ("agent.one_shot_timeout_secs", self.agent.one_shot_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.agent.binary.trim().is_empty() {
            bail!("agent.binary must not be empty");
        }
        Ok(())
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            binary: self.agent.binary.clone(),
            projects_dir: self.agent.projects_dir.clone(),
            stop_grace: Duration::from_millis(self.agent.stop_grace_ms),
            one_shot_timeout: Duration::from_secs(self.agent.one_shot_timeout_secs),
            extra_args: self.agent.extra_args.clone(),
        }
    }

    pub fn tail_settings(&self) -> TailSettings {
        TailSettings {
            throttle: Duration::from_millis(self.tail.throttle_ms),
            poll: Duration::from_millis(self.tail.poll_ms),
            heartbeat: Duration::from_secs(self.tail.heartbeat_secs),
        }
    }

    pub fn pty_host_config(&self) -> PtyHostConfig {
        PtyHostConfig {
            scrollback_max_chars: self.pty.scrollback_max_chars,
            scrollback_trim_chars: self.pty.scrollback_trim_chars,
            exited_retention: Duration::from_millis(self.pty.exited_retention_ms),
            kill_grace: Duration::from_millis(self.pty.kill_grace_ms),
            shell: self.pty.shell.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.agent.binary, "claude");
        assert!(config.agent.projects_dir.ends_with(".claude/projects"));
        assert_eq!(config.tail_settings().throttle, Duration::from_millis(150));
        assert_eq!(config.tail_settings().poll, Duration::from_millis(500));
        assert_eq!(config.tail_settings().heartbeat, Duration::from_secs(15));
        let pty = config.pty_host_config();
        assert_eq!(pty.scrollback_max_chars, 50_000);
        assert_eq!(pty.scrollback_trim_chars, 40_000);
        assert_eq!(config.agent_settings().stop_grace, Duration::from_secs(3));
        assert_eq!(
            config.agent_settings().one_shot_timeout,
            Duration::from_secs(60)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[agent]\nbinary = \"/opt/agent\"\n\n[tail]\npoll_ms = 250\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.agent.binary, "/opt/agent");
        assert_eq!(config.agent.stop_grace_ms, 3_000);
        assert_eq!(config.tail.poll_ms, 250);
        assert_eq!(config.tail.throttle_ms, 150);
        assert_eq!(config.pty, PtyConfig::default());
    }

    #[test]
    fn malformed_file_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[tail\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(Config::load(Some(&tmp.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn validation_rejects_inverted_scrollback_and_zero_intervals() {
        let mut config = Config::default();
        config.pty.scrollback_trim_chars = config.pty.scrollback_max_chars + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tail.poll_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tail.poll_ms"));
    }

    #[test]
    #[serial]
    fn env_overrides_agent_binary_and_projects_dir() {
        std::env::set_var(AGENT_BIN_ENV, "/usr/local/bin/agent");
        std::env::set_var(PROJECTS_DIR_ENV, "/var/agent/projects");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var(AGENT_BIN_ENV);
        std::env::remove_var(PROJECTS_DIR_ENV);

        assert_eq!(config.agent.binary, "/usr/local/bin/agent");
        assert_eq!(
            config.agent.projects_dir,
            PathBuf::from("/var/agent/projects")
        );
    }
}
