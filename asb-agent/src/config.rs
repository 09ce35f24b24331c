//! Configuration management
//!
//! Handles:
//! - Admin identity and agent identity
//! - MQTT broker settings
//! - Command, watchdog and update tuning
//! - Known service catalogue
//!
//! Loaded once at startup from a TOML file. A missing or invalid file is fatal.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::execution::DEFAULT_OUTPUT_LIMIT;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "ASB_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("could not find a config directory")]
    NoConfigDir,

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// The only identity allowed to issue commands
    pub admin_id: String,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    /// Relative to the home directory
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default = "default_services")]
    pub services: Vec<KnownService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub topic_prefix: String,
    /// Longest text published in a single reply
    pub max_message_chars: usize,
    /// Largest MQTT packet accepted or sent, uploads included
    pub max_packet_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub poll_interval_secs: u64,
    /// Percentage strictly below which an alert is raised
    pub low_battery_threshold: f64,
    pub sensor_command: String,
    pub sensor_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub shell: String,
    pub exec_timeout_secs: u64,
    pub max_exec_timeout_secs: u64,
    pub reboot_command: String,
    pub reboot_timeout_secs: u64,
    pub service_timeout_secs: u64,
    /// Captured output kept per command; the rest is dropped
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Git working directory of the agent; current directory when unset
    pub repo_dir: Option<PathBuf>,
    /// Where backups go; `<repo>-backups` next to the repo when unset
    pub backup_dir: Option<PathBuf>,
    pub fetch_timeout_secs: u64,
    pub pull_timeout_secs: u64,
    /// Command that starts a fresh agent; the current executable when unset
    pub relaunch_command: Option<String>,
    pub relaunch_delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownService {
    pub name: String,
    pub description: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id: None,
            keep_alive_secs: 30,
            topic_prefix: "asb".to_string(),
            max_message_chars: 4000,
            max_packet_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            low_battery_threshold: 20.0,
            sensor_command: "termux-battery-status".to_string(),
            sensor_timeout_secs: 10,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            exec_timeout_secs: 30,
            max_exec_timeout_secs: 600,
            reboot_command: "reboot".to_string(),
            reboot_timeout_secs: 5,
            service_timeout_secs: 10,
            max_output_bytes: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            repo_dir: None,
            backup_dir: None,
            fetch_timeout_secs: 30,
            pull_timeout_secs: 60,
            relaunch_command: None,
            relaunch_delay_secs: 2,
        }
    }
}

fn default_agent_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "asb".to_string())
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("downloads/server")
}

fn default_services() -> Vec<KnownService> {
    [
        ("ssh", "SSH server"),
        ("nginx", "Web server"),
        ("apache2", "Web server"),
        ("mysql", "Database"),
        ("postgresql", "Database"),
        ("redis", "Cache server"),
        ("docker", "Container engine"),
        ("cron", "Scheduler"),
        ("asb", "This agent"),
    ]
    .into_iter()
    .map(|(name, description)| KnownService {
        name: name.to_string(),
        description: description.to_string(),
    })
    .collect()
}

impl AgentConfig {
    /// Load config from `ASB_CONFIG`, the given override, or the OS config dir
    pub async fn load(override_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => match override_path {
                Some(path) => path,
                None => Self::config_file_path()?,
            },
        };
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push("asb-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_id.trim().is_empty() {
            return Err(ConfigError::Invalid("admin_id must not be empty".into()));
        }
        if self.agent_id.trim().is_empty() || self.agent_id.contains(['/', '+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "agent_id '{}' is not usable in an MQTT topic",
                self.agent_id
            )));
        }
        let threshold = self.watchdog.low_battery_threshold;
        if !(threshold > 0.0 && threshold <= 100.0) {
            return Err(ConfigError::Invalid(format!(
                "low_battery_threshold must be within (0, 100], got {}",
                threshold
            )));
        }
        let durations = [
            ("watchdog.poll_interval_secs", self.watchdog.poll_interval_secs),
            ("watchdog.sensor_timeout_secs", self.watchdog.sensor_timeout_secs),
            ("commands.exec_timeout_secs", self.commands.exec_timeout_secs),
            ("commands.max_exec_timeout_secs", self.commands.max_exec_timeout_secs),
            ("commands.reboot_timeout_secs", self.commands.reboot_timeout_secs),
            ("commands.service_timeout_secs", self.commands.service_timeout_secs),
            ("update.fetch_timeout_secs", self.update.fetch_timeout_secs),
            ("update.pull_timeout_secs", self.update.pull_timeout_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        if self.mqtt.max_message_chars < 64 {
            return Err(ConfigError::Invalid("mqtt.max_message_chars must be at least 64".into()));
        }
        if self.mqtt.max_packet_bytes < 1024 {
            return Err(ConfigError::Invalid("mqtt.max_packet_bytes must be at least 1024".into()));
        }
        if self.commands.max_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "commands.max_output_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Git working directory of the agent, always absolute
    pub fn repo_dir(&self) -> PathBuf {
        absolute(self.update.repo_dir.as_deref().unwrap_or(Path::new(".")))
    }

    /// Backup root, kept outside the working tree so backups never copy themselves
    pub fn backup_dir(&self) -> PathBuf {
        if let Some(dir) = &self.update.backup_dir {
            return absolute(dir);
        }
        let repo = self.repo_dir();
        let name = repo
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "asb".to_string());
        match repo.parent() {
            Some(parent) => parent.join(format!("{}-backups", name)),
            None => std::env::temp_dir().join(format!("{}-backups", name)),
        }
    }

    pub fn mqtt_client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("asb-agent-{}", self.agent_id))
    }
}

/// Resolve against the current directory, collapsing `.` and `..` when the path exists
fn absolute(path: &Path) -> PathBuf {
    if let Ok(path) = std::fs::canonicalize(path) {
        return path;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
