//! # cfs-config
//!
//! Configuration for the CFS interposer and its tooling.
//!
//! Loads configuration from:
//! 1. Built-in defaults
//! 2. The TOML file named by `CFS_CONFIG` (optional)
//! 3. Environment variables (highest priority)
//!
//! The interposer reads this once per process image, before the first
//! tracked call. Nothing here is cached globally: callers own the `Config`.

pub mod logging;
pub mod path;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Colon-separated list of build-tree roots. Unset means the interposer is inert.
pub const ENV_ROOT: &str = "CFS_ROOT";
/// Unix socket path of the collector.
pub const ENV_COLLECTOR: &str = "CFS_COLLECTOR";
/// Debug level, 0..=2.
pub const ENV_DEBUG: &str = "CFS_DEBUG";
/// Log file written by the interposer when the debug level is non-zero.
pub const ENV_LOG_FILE: &str = "CFS_LOG_FILE";
/// Optional TOML configuration file.
pub const ENV_CONFIG: &str = "CFS_CONFIG";
/// Descriptor table handed across exec.
pub const ENV_FD_TABLE: &str = "CFS_FD_TABLE";

pub const MAX_DEBUG_LEVEL: u8 = 2;
pub const DEFAULT_LOG_FILE: &str = "cfs.log";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("build-tree root must be absolute: {0}")]
    InvalidRoot(PathBuf),
    #[error("empty build-tree root in {0}")]
    EmptyRoot(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub interposer: InterposerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load config using `env` as the environment lookup.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match env(ENV_CONFIG) {
            Some(file) if !file.is_empty() => Self::from_file(Path::new(&file))?,
            _ => Config::default(),
        };
        config.apply_env_overrides(&env)?;
        config.logging.debug_level = config.logging.debug_level.min(MAX_DEBUG_LEVEL);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {:?}", path);
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    fn apply_env_overrides(
        &mut self,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(roots) = env(ENV_ROOT) {
            self.interposer.roots = parse_roots(&roots)?;
        }
        if let Some(collector) = env(ENV_COLLECTOR) {
            self.interposer.collector = (!collector.is_empty()).then(|| PathBuf::from(collector));
        }
        if let Some(level) = env(ENV_DEBUG) {
            // Unparseable values count as "debug on", like a bare `CFS_DEBUG=yes`.
            let level = level.trim().parse::<i64>().unwrap_or(1);
            self.logging.debug_level = level.clamp(0, MAX_DEBUG_LEVEL as i64) as u8;
        }
        if let Some(file) = env(ENV_LOG_FILE) {
            if !file.is_empty() {
                self.logging.log_file = PathBuf::from(file);
            }
        }
        Ok(())
    }

    /// Reject roots that cannot be compared against canonical paths.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for root in &self.interposer.roots {
            if root.as_os_str().is_empty() {
                return Err(ConfigError::EmptyRoot(ENV_ROOT.to_string()));
            }
            if !root.is_absolute() {
                return Err(ConfigError::InvalidRoot(root.clone()));
            }
        }
        Ok(())
    }

    /// True when at least one build-tree root is configured.
    pub fn is_enabled(&self) -> bool {
        !self.interposer.roots.is_empty()
    }

    /// Environment entries a child process needs to re-attach with the same settings.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut vars = Vec::with_capacity(4);
        if self.is_enabled() {
            let roots: Vec<String> = self
                .interposer
                .roots
                .iter()
                .map(|r| r.to_string_lossy().into_owned())
                .collect();
            vars.push((ENV_ROOT.to_string(), roots.join(":")));
        }
        if let Some(collector) = &self.interposer.collector {
            vars.push((
                ENV_COLLECTOR.to_string(),
                collector.to_string_lossy().into_owned(),
            ));
        }
        vars.push((
            ENV_DEBUG.to_string(),
            self.logging.debug_level.to_string(),
        ));
        vars.push((
            ENV_LOG_FILE.to_string(),
            self.logging.log_file.to_string_lossy().into_owned(),
        ));
        vars
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Config::default())
    }
}

fn parse_roots(value: &str) -> Result<Vec<PathBuf>, ConfigError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    value
        .split(':')
        .map(|part| {
            if part.is_empty() {
                Err(ConfigError::EmptyRoot(value.to_string()))
            } else {
                Ok(PathBuf::from(part))
            }
        })
        .collect()
}

/// Interposer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterposerConfig {
    /// Build-tree roots. Empty disables tracking.
    pub roots: Vec<PathBuf>,
    /// Collector socket. `None` means events are dropped and counted.
    pub collector: Option<PathBuf>,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Ring buffer slots, rounded up to a power of two.
    pub queue_capacity: usize,
    /// Upper bound on the flush performed before exec and at exit.
    pub flush_timeout_ms: u64,
    /// Consecutive delivery failures before the collector is left alone.
    pub circuit_threshold: usize,
    pub circuit_recovery_secs: u64,
}

impl Default for InterposerConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            collector: None,
            connect_timeout_ms: 100,
            send_timeout_ms: 100,
            queue_capacity: 4096,
            flush_timeout_ms: 1000,
            circuit_threshold: 5,
            circuit_recovery_secs: 30,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 0 = warnings only, 1 = debug, 2 = trace
    pub debug_level: u8,
    pub log_file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug_level: 0,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> logging::LogLevel {
        logging::LogLevel::from_debug_level(self.debug_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.is_enabled());
        assert_eq!(config.interposer.queue_capacity, 4096);
        assert_eq!(config.interposer.circuit_threshold, 5);
        assert_eq!(config.logging.log_file, PathBuf::from("cfs.log"));
        assert_eq!(config.logging.debug_level, 0);
    }

    #[test]
    fn test_env_roots_and_collector() {
        let config = Config::load_with(env_of(&[
            (ENV_ROOT, "/build:/src/gen"),
            (ENV_COLLECTOR, "/tmp/cfs.sock"),
        ]))
        .unwrap();
        assert_eq!(
            config.interposer.roots,
            vec![PathBuf::from("/build"), PathBuf::from("/src/gen")]
        );
        assert_eq!(
            config.interposer.collector,
            Some(PathBuf::from("/tmp/cfs.sock"))
        );
        assert!(config.is_enabled());
    }

    #[test]
    fn test_relative_root_rejected() {
        let err = Config::load_with(env_of(&[(ENV_ROOT, "build")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRoot(_)));
    }

    #[test]
    fn test_empty_root_component_rejected() {
        let err = Config::load_with(env_of(&[(ENV_ROOT, "/build::/other")])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyRoot(_)));
    }

    #[test]
    fn test_empty_root_variable_disables() {
        let config = Config::load_with(env_of(&[(ENV_ROOT, "")])).unwrap();
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_debug_level_clamped() {
        let config = Config::load_with(env_of(&[(ENV_DEBUG, "7")])).unwrap();
        assert_eq!(config.logging.debug_level, 2);

        let config = Config::load_with(env_of(&[(ENV_DEBUG, "-3")])).unwrap();
        assert_eq!(config.logging.debug_level, 0);

        let config = Config::load_with(env_of(&[(ENV_DEBUG, "yes")])).unwrap();
        assert_eq!(config.logging.debug_level, 1);
    }

    #[test]
    fn test_to_env_roundtrips_through_load() {
        let config = Config::load_with(env_of(&[
            (ENV_ROOT, "/build"),
            (ENV_COLLECTOR, "/run/cfs.sock"),
            (ENV_DEBUG, "2"),
            (ENV_LOG_FILE, "/tmp/x.log"),
        ]))
        .unwrap();

        let vars = config.to_env();
        let reloaded = Config::load_with(move |key| {
            vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
        .unwrap();
        assert_eq!(config, reloaded);
    }

    #[test]
    fn test_default_toml_parses() {
        let text = Config::default_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
