// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime tuning knobs.
//!
//! Loaded from a TOML file (every table and field optional) and then
//! overridden from `SKEIN_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("invalid value for {name}: {value}")]
    Env { name: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub timer: TimerConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub poller: PollerConfig,
}

impl RuntimeConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `SKEIN_TIMER_CAPACITY`, `SKEIN_DRAIN_SPINS` and
    /// `SKEIN_POLL_TIMEOUT_MS` overrides.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(v) = lookup("SKEIN_TIMER_CAPACITY") {
            self.timer.initial_capacity = parse_var("SKEIN_TIMER_CAPACITY", v)?;
        }
        if let Some(v) = lookup("SKEIN_DRAIN_SPINS") {
            self.registry.drain_spins = parse_var("SKEIN_DRAIN_SPINS", v)?;
        }
        if let Some(v) = lookup("SKEIN_POLL_TIMEOUT_MS") {
            self.poller.poll_timeout_ms = parse_var("SKEIN_POLL_TIMEOUT_MS", v)?;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: String) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { name, value })
}

/// Timer heap and driver thread settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Heap slots reserved up front; doubled on overflow.
    #[serde(default = "default_timer_capacity")]
    pub initial_capacity: usize,

    #[serde(default = "default_timer_thread")]
    pub driver_thread_name: String,

    /// Longest the driver sleeps when the heap is empty.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
}

fn default_timer_capacity() -> usize {
    256
}

fn default_timer_thread() -> String {
    "skein-timer".to_string()
}

fn default_idle_wait_ms() -> u64 {
    100
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_capacity: default_timer_capacity(),
            driver_thread_name: default_timer_thread(),
            idle_wait_ms: default_idle_wait_ms(),
        }
    }
}

/// Descriptor registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Busy spins a closer makes before yielding while references drain.
    #[serde(default = "default_drain_spins")]
    pub drain_spins: u32,
}

fn default_drain_spins() -> u32 {
    64
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            drain_spins: default_drain_spins(),
        }
    }
}

/// OS poller settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    #[serde(default = "default_poller_thread")]
    pub thread_name: String,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: i32,
}

fn default_max_events() -> usize {
    64
}

fn default_poller_thread() -> String {
    "skein-poller".to_string()
}

fn default_poll_timeout_ms() -> i32 {
    10
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            thread_name: default_poller_thread(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}
