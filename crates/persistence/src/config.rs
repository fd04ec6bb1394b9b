use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::canonical::DEFAULT_CACHE_SIZE;
use crate::version::SaveVersion;

pub const SAVE_DIR_ENV_VAR: &str = "PERSIST_SAVE_DIR";
pub const MAX_BACKUPS_ENV_VAR: &str = "PERSIST_MAX_BACKUPS";
pub const OPERATION_TIMEOUT_ENV_VAR: &str = "PERSIST_OPERATION_TIMEOUT_SECS";
pub const JSON_CACHE_SIZE_ENV_VAR: &str = "PERSIST_JSON_CACHE_SIZE";
pub const ATOMIC_WRITES_ENV_VAR: &str = "PERSIST_ATOMIC_WRITES";
pub const COMPRESSION_ENV_VAR: &str = "PERSIST_COMPRESSION";

pub const CURRENT_SAVE_VERSION: SaveVersion = SaveVersion::new(1, 2, 0);

/// Whether save files are wrapped in a compression envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SaveCompression {
    #[default]
    Off,
    Fast,
    High,
}

impl FromStr for SaveCompression {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "fast" | "lz4" => Ok(Self::Fast),
            "high" | "zstd" => Ok(Self::High),
            other => Err(format!("unknown compression mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SaveManagerConfig {
    pub save_dir: PathBuf,
    pub current_version: SaveVersion,
    pub product: String,
    pub max_concurrent_saves: usize,
    pub max_concurrent_loads: usize,
    pub enable_atomic_writes: bool,
    pub enable_auto_backup: bool,
    pub max_backups: usize,
    pub operation_timeout: Duration,
    /// Slot waits use this when set, otherwise `operation_timeout`.
    pub slot_timeout: Option<Duration>,
    pub json_cache_size: usize,
    pub enable_validation_caching: bool,
    pub compression: SaveCompression,
}

impl Default for SaveManagerConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("saves"),
            current_version: CURRENT_SAVE_VERSION,
            product: "Sim Persistence Demo".to_string(),
            max_concurrent_saves: 2,
            max_concurrent_loads: 4,
            enable_atomic_writes: true,
            enable_auto_backup: true,
            max_backups: 10,
            operation_timeout: Duration::from_secs(300),
            slot_timeout: None,
            json_cache_size: DEFAULT_CACHE_SIZE,
            enable_validation_caching: true,
            compression: SaveCompression::Off,
        }
    }
}

impl SaveManagerConfig {
    pub fn with_save_dir(mut self, save_dir: impl Into<PathBuf>) -> Self {
        self.save_dir = save_dir.into();
        self
    }

    pub fn effective_slot_timeout(&self) -> Duration {
        self.slot_timeout.unwrap_or(self.operation_timeout)
    }

    /// Applies `PERSIST_*` environment overrides. Unparseable values are
    /// logged and ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| env::var(key))
    }

    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        if let Some(dir) = read_override(&lookup, SAVE_DIR_ENV_VAR, |value| {
            if value.trim().is_empty() {
                Err("empty path".to_string())
            } else {
                Ok(PathBuf::from(value))
            }
        }) {
            self.save_dir = dir;
        }
        if let Some(max) = read_override(&lookup, MAX_BACKUPS_ENV_VAR, parse_display_err::<usize>) {
            self.max_backups = max;
        }
        if let Some(secs) = read_override(&lookup, OPERATION_TIMEOUT_ENV_VAR, parse_display_err::<u64>) {
            self.operation_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = read_override(&lookup, JSON_CACHE_SIZE_ENV_VAR, parse_display_err::<usize>) {
            self.json_cache_size = size;
        }
        if let Some(enabled) = read_override(&lookup, ATOMIC_WRITES_ENV_VAR, parse_flag) {
            self.enable_atomic_writes = enabled;
        }
        if let Some(mode) = read_override(&lookup, COMPRESSION_ENV_VAR, SaveCompression::from_str) {
            self.compression = mode;
        }
        self
    }
}

fn read_override<F, T, P>(lookup: &F, env_var: &'static str, parse: P) -> Option<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    P: Fn(&str) -> Result<T, String>,
{
    match lookup(env_var) {
        Ok(value) => match parse(&value) {
            Ok(parsed) => Some(parsed),
            Err(reason) => {
                warn!(
                    env_var,
                    value = value.as_str(),
                    reason = reason.as_str(),
                    "invalid env var value; falling back to config"
                );
                None
            }
        },
        Err(env::VarError::NotPresent) => None,
        Err(err) => {
            warn!(
                env_var,
                error = %err,
                "unable to read env var; falling back to config"
            );
            None
        }
    }
}

fn parse_display_err<T>(value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|error| error.to_string())
}

fn parse_flag(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected 0/1/true/false, got '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(
        pairs: &[(&str, &str)],
    ) -> impl Fn(&str) -> Result<String, env::VarError> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| map.get(key).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SaveManagerConfig::default();
        assert_eq!(config.max_concurrent_saves, 2);
        assert_eq!(config.max_concurrent_loads, 4);
        assert_eq!(config.max_backups, 10);
        assert_eq!(config.operation_timeout, Duration::from_secs(300));
        assert_eq!(config.effective_slot_timeout(), Duration::from_secs(300));
        assert_eq!(config.json_cache_size, 100);
        assert!(config.enable_atomic_writes);
        assert_eq!(config.compression, SaveCompression::Off);
    }

    #[test]
    fn overrides_apply_when_valid() {
        let config = SaveManagerConfig::default().with_overrides_from(lookup_from(&[
            (SAVE_DIR_ENV_VAR, "/tmp/elsewhere"),
            (MAX_BACKUPS_ENV_VAR, "3"),
            (OPERATION_TIMEOUT_ENV_VAR, "15"),
            (JSON_CACHE_SIZE_ENV_VAR, "0"),
            (ATOMIC_WRITES_ENV_VAR, "false"),
            (COMPRESSION_ENV_VAR, "HIGH"),
        ]));
        assert_eq!(config.save_dir, PathBuf::from("/tmp/elsewhere"));
        assert_eq!(config.max_backups, 3);
        assert_eq!(config.operation_timeout, Duration::from_secs(15));
        assert_eq!(config.json_cache_size, 0);
        assert!(!config.enable_atomic_writes);
        assert_eq!(config.compression, SaveCompression::High);
    }

    #[test]
    fn invalid_overrides_fall_back_to_config() {
        let config = SaveManagerConfig::default().with_overrides_from(lookup_from(&[
            (MAX_BACKUPS_ENV_VAR, "lots"),
            (ATOMIC_WRITES_ENV_VAR, "maybe"),
            (COMPRESSION_ENV_VAR, "brotli"),
            (SAVE_DIR_ENV_VAR, "  "),
        ]));
        assert_eq!(config.max_backups, 10);
        assert!(config.enable_atomic_writes);
        assert_eq!(config.compression, SaveCompression::Off);
        assert_eq!(config.save_dir, PathBuf::from("saves"));
    }
}
