//! Configuration: defaults, then a TOML file, then environment overrides.
//!
//! File: `--config PATH`, else `~/.config/config-harvester/config.toml` or
//! `/etc/config-harvester/config.toml` when present.
//!
//! Env overrides: `HARVESTER_HOSTS` (comma separated),
//! `HARVESTER_SNMP_USERNAME`, `HARVESTER_SNMP_AUTH_PASSPHRASE`,
//! `HARVESTER_SNMP_PRIV_PASSPHRASE`, `HARVESTER_OUTPUT_DIR`,
//! `HARVESTER_RUN_INTERVAL_SECS`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::harvest::{HarvestSettings, TriggerSettings};
use crate::model::Device;
use crate::persist::is_file_name;
use crate::snmp::{AuthProtocol, PrivProtocol, SnmpSettings};
use crate::tftp::ListenerSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Devices to harvest, by hostname or IP literal.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Devices in flight at once (default 16).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Pause between cycles in seconds (default 30 minutes).
    #[serde(default = "default_run_interval_secs")]
    pub run_interval_secs: u64,
    /// Where `<device>.conf` files and the run summary go.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub snmp: SnmpConfig,
    #[serde(default)]
    pub tftp: TftpConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SnmpConfig {
    pub port: u16,
    pub username: String,
    pub auth_passphrase: String,
    pub priv_passphrase: String,
    pub auth_protocol: AuthProtocol,
    pub priv_protocol: PrivProtocol,
    /// Written to the device with every upload command. Falls back to the
    /// authentication passphrase.
    pub confirmation_secret: Option<String>,
    pub timeout_secs: u64,
    pub retries: u32,
    pub max_oids: usize,
}

impl Default for SnmpConfig {
    fn default() -> Self {
        let settings = SnmpSettings::default();
        Self {
            port: settings.port,
            username: settings.username,
            auth_passphrase: settings.auth_passphrase,
            priv_passphrase: settings.priv_passphrase,
            auth_protocol: settings.auth_protocol,
            priv_protocol: settings.priv_protocol,
            confirmation_secret: None,
            timeout_secs: settings.timeout.as_secs(),
            retries: settings.retries,
            max_oids: settings.max_oids,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TftpConfig {
    pub port: u16,
    pub timeout_secs: u64,
    pub retries: u32,
    pub max_file_size: usize,
}

impl Default for TftpConfig {
    fn default() -> Self {
        let settings = ListenerSettings::default();
        Self {
            port: settings.port,
            timeout_secs: settings.timeout.as_secs(),
            retries: settings.retries,
            max_file_size: settings.max_file_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TriggerConfig {
    pub poll_interval_ms: u64,
    /// 0 polls until the device reports a terminal status.
    pub max_polls: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        let settings = TriggerSettings::default();
        Self {
            poll_interval_ms: settings.poll_interval.as_millis() as u64,
            max_polls: settings.max_polls.unwrap_or(0),
        }
    }
}

fn default_concurrency() -> usize {
    16
}
fn default_run_interval_secs() -> u64 {
    30 * 60
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("configs")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            concurrency: default_concurrency(),
            run_interval_secs: default_run_interval_secs(),
            output_dir: default_output_dir(),
            log_level: default_log_level(),
            snmp: SnmpConfig::default(),
            tftp: TftpConfig::default(),
            trigger: TriggerConfig::default(),
        }
    }
}

impl Config {
    /// Loads the file (explicit path, or the first default path that
    /// exists), applies process environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(default_path);
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlays values from `lookup`, which maps variable names to values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(hosts) = lookup("HARVESTER_HOSTS") {
            self.hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("HARVESTER_SNMP_USERNAME") {
            self.snmp.username = v;
        }
        if let Some(v) = lookup("HARVESTER_SNMP_AUTH_PASSPHRASE") {
            self.snmp.auth_passphrase = v;
        }
        if let Some(v) = lookup("HARVESTER_SNMP_PRIV_PASSPHRASE") {
            self.snmp.priv_passphrase = v;
        }
        if let Some(v) = lookup("HARVESTER_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HARVESTER_RUN_INTERVAL_SECS") {
            self.run_interval_secs = v.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: "HARVESTER_RUN_INTERVAL_SECS",
                value: v,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Invalid("no hosts configured".into()));
        }
        if let Some(host) = self.hosts.iter().find(|h| !is_file_name(h.as_str())) {
            return Err(ConfigError::Invalid(format!(
                "host {host:?} cannot be used as a file name"
            )));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.snmp.username.is_empty() {
            return Err(ConfigError::Invalid("SNMP username is empty".into()));
        }
        for (name, value) in [
            ("auth", &self.snmp.auth_passphrase),
            ("priv", &self.snmp.priv_passphrase),
        ] {
            if value.chars().count() < 8 {
                return Err(ConfigError::Invalid(format!(
                    "SNMP {name} passphrase must be at least 8 characters"
                )));
            }
        }
        if self.snmp.max_oids == 0 {
            return Err(ConfigError::Invalid("snmp.max_oids must be at least 1".into()));
        }
        for (name, value) in [
            ("snmp.timeout_secs", self.snmp.timeout_secs),
            ("tftp.timeout_secs", self.tftp.timeout_secs),
            ("trigger.poll_interval_ms", self.trigger.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }

    pub fn devices(&self) -> Vec<Device> {
        self.hosts.iter().map(|h| Device::new(h.as_str())).collect()
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_secs)
    }

    pub fn snmp_settings(&self) -> SnmpSettings {
        SnmpSettings {
            port: self.snmp.port,
            username: self.snmp.username.clone(),
            auth_passphrase: self.snmp.auth_passphrase.clone(),
            priv_passphrase: self.snmp.priv_passphrase.clone(),
            auth_protocol: self.snmp.auth_protocol,
            priv_protocol: self.snmp.priv_protocol,
            timeout: Duration::from_secs(self.snmp.timeout_secs),
            retries: self.snmp.retries,
            max_oids: self.snmp.max_oids,
        }
    }

    pub fn harvest_settings(&self) -> HarvestSettings {
        HarvestSettings {
            trigger: TriggerSettings {
                poll_interval: Duration::from_millis(self.trigger.poll_interval_ms),
                max_polls: (self.trigger.max_polls > 0).then_some(self.trigger.max_polls),
            },
            listener: ListenerSettings {
                port: self.tftp.port,
                timeout: Duration::from_secs(self.tftp.timeout_secs),
                retries: self.tftp.retries,
                max_file_size: self.tftp.max_file_size,
            },
            secret: self
                .snmp
                .confirmation_secret
                .clone()
                .unwrap_or_else(|| self.snmp.auth_passphrase.clone()),
        }
    }
}

fn default_path() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(PathBuf::from(home).join(".config/config-harvester/config.toml"));
    }
    candidates.push(PathBuf::from("/etc/config-harvester/config.toml"));
    candidates.into_iter().find(|p| p.exists())
}
