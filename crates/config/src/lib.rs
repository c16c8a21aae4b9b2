//! Tunables for the command scheduler and debugger sessions, stored as TOML.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::Context;
use serde::{Deserialize, Serialize};

/// Top level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of pool threads; each stuck worker holds on to one.
    pub pool_threads: usize,
    /// How long a terminating command may wait behind the current worker
    /// before the scheduler hands off to a fresh one.
    pub command_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_threads: 8,
            command_timeout_ms: 3000,
        }
    }
}

impl SchedulerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Thread name prefixes identifying the debuggee's UI event loop
    pub ui_thread_prefixes: Vec<String>,
    pub main_thread_name: String,
    /// Quiet period before a requested refresh is committed
    pub refresh_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ui_thread_prefixes: vec!["AWT-EventQueue".to_string()],
            main_thread_name: "main".to_string(),
            refresh_delay_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    /// Whether `name` looks like the debuggee's UI event loop thread
    pub fn is_ui_thread(&self, name: &str) -> bool {
        self.ui_thread_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && name.starts_with(prefix.as_str()))
    }
}

impl Config {
    /// Reject values the scheduler cannot work with
    pub fn validate(&self) -> eyre::Result<()> {
        if self.scheduler.pool_threads == 0 {
            eyre::bail!("scheduler.pool_threads must be at least 1");
        }
        if self.scheduler.command_timeout_ms == 0 {
            eyre::bail!("scheduler.command_timeout_ms must be positive");
        }
        Ok(())
    }
}

/// Default location of the configuration file
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stepwise").join("config.toml"))
}

/// Load the configuration from its default location
///
/// A missing file (or no resolvable config directory) yields the defaults; a
/// file that exists but does not parse is an error.
pub fn load() -> eyre::Result<Config> {
    let Some(path) = default_path() else {
        tracing::warn!("cannot determine config directory, using default configuration");
        return Ok(Config::default());
    };
    if !path.exists() {
        tracing::debug!(config_path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    load_from(&path)
}

pub fn read(mut reader: impl Read) -> eyre::Result<Config> {
    let mut contents = String::new();
    reader
        .read_to_string(&mut contents)
        .context("reading configuration")?;
    let config: Config = toml::from_str(&contents).context("parsing configuration")?;
    config.validate().context("validating configuration")?;
    Ok(config)
}

pub fn write(config: &Config, mut writer: impl Write) -> eyre::Result<()> {
    let contents = toml::to_string_pretty(config).context("serialising configuration")?;
    writer
        .write_all(contents.as_bytes())
        .context("writing configuration")?;
    Ok(())
}

pub fn load_from(path: impl AsRef<Path>) -> eyre::Result<Config> {
    let path = path.as_ref();
    tracing::debug!(config_path = %path.display(), "loading configuration");
    let f = std::fs::File::open(path)
        .with_context(|| format!("opening config file {}", path.display()))?;
    let config = read(f).context("reading from config file")?;
    Ok(config)
}

pub fn save_to(config: &Config, path: impl AsRef<Path>) -> eyre::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    let f = std::fs::File::create(path).context("creating file for saving")?;
    write(config, &f).context("saving configuration")?;
    Ok(())
}
