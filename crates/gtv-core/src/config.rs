//! Named configuration options, loadable from an optional JSON file and
//! overridable by CLI flags.

use serde::Deserialize;

fn default_timeout() -> u64 {
    90
}
fn default_suspend_time() -> u64 {
    5
}
fn default_wait_delay() -> u32 {
    20
}
fn default_wait_percent() -> u32 {
    35
}
fn default_buffer_size() -> u32 {
    3
}
fn default_shownet() -> i32 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport silence (seconds) before a drop.
    #[serde(rename = "mvd_timeout")]
    pub timeout_secs: u64,
    /// Idle minutes before the global active flag goes false.
    #[serde(rename = "mvd_suspend_time")]
    pub suspend_time_mins: u64,
    /// Base `min_packets`, in tenths of a second.
    #[serde(rename = "mvd_wait_delay")]
    pub wait_delay_tenths: u32,
    /// Alternate Waiting->Reading threshold, percent fill of the delay
    /// buffer.
    #[serde(rename = "mvd_wait_percent")]
    pub wait_percent: u32,
    /// Delay buffer size, in units of `MAX_MSGLEN`. Clamped to [2, 10].
    #[serde(rename = "mvd_buffer_size")]
    pub buffer_size_units: u32,
    /// Default username, used when a `connect` omits `--user`.
    #[serde(rename = "mvd_username")]
    pub username: Option<String>,
    /// Default password, used when a `connect` omits `--pass`.
    #[serde(rename = "mvd_password")]
    pub password: Option<String>,
    /// Per-Upstream verbose byte/message trace; -1 disables it. Mirrors
    /// `original_source/mvd_client.c`'s `mvd_shownet` cvar.
    #[serde(rename = "mvd_shownet")]
    pub shownet: i32,
}

impl Config {
    pub fn buffer_size_clamped(&self) -> u32 {
        self.buffer_size_units.clamp(2, 10)
    }

    pub fn shownet_enabled(&self) -> bool {
        self.shownet >= 0
    }

    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn from_json_file(path: &std::path::Path) -> config_error::ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(config_error::ConfigError::Io)?;
        Self::from_json_str(&contents).map_err(config_error::ConfigError::Parse)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            suspend_time_mins: default_suspend_time(),
            wait_delay_tenths: default_wait_delay(),
            wait_percent: default_wait_percent(),
            buffer_size_units: default_buffer_size(),
            username: None,
            password: None,
            shownet: default_shownet(),
        }
    }
}

/// Small local error type for config file loading; kept out of the
/// project's main `thiserror` taxonomy since it's a startup-only concern
/// with no `[name] =!= / =X=` log line of its own.
mod config_error {
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum ConfigError {
        #[error("couldn't read config file: {0}")]
        Io(#[source] std::io::Error),
        #[error("couldn't parse config file: {0}")]
        Parse(#[source] serde_json::Error),
    }

    pub type ConfigResult<T> = Result<T, ConfigError>;
}

pub use config_error::ConfigError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.timeout_secs, 90);
        assert_eq!(cfg.suspend_time_mins, 5);
        assert_eq!(cfg.wait_delay_tenths, 20);
        assert_eq!(cfg.wait_percent, 35);
        assert_eq!(cfg.buffer_size_clamped(), 3);
        assert!(!cfg.shownet_enabled());
    }

    #[test]
    fn buffer_size_clamps_to_range() {
        let mut cfg = Config::default();
        cfg.buffer_size_units = 1;
        assert_eq!(cfg.buffer_size_clamped(), 2);
        cfg.buffer_size_units = 99;
        assert_eq!(cfg.buffer_size_clamped(), 10);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg = Config::from_json_str(r#"{"mvd_timeout": 30}"#).unwrap();
        assert_eq!(cfg.timeout_secs, 30);
        assert_eq!(cfg.wait_delay_tenths, 20);
    }
}
