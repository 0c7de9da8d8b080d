//! Configuration for the herald pipeline.
//!
//! Everything the platform tunes through resources or secure settings is a
//! field here rather than a constant: quota limits, the assistant adjustment
//! window, the autogroup trigger count, archive depth. Defaults mirror the
//! values observed in production.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Logging configuration consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    #[serde(default = "defaults::log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "defaults::log_format")]
    pub format: String,
    /// Optional log file; console-only when absent.
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
            format: defaults::log_format(),
            file_path: None,
        }
    }
}

/// Tuning values for the notification pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Maximum concurrent notifications per (package, user). Exceeding it
    /// rejects new posts (updates to an existing key are still allowed).
    #[serde(default = "defaults::max_package_notifications")]
    pub max_package_notifications: usize,

    /// Maximum sustained enqueue rate per package, in events per second.
    /// Applied to updates only.
    #[serde(default = "defaults::max_package_enqueue_rate")]
    pub max_package_enqueue_rate: f32,

    /// Number of ungrouped notifications from one package that triggers
    /// auto-bundling.
    #[serde(default = "defaults::autogroup_at_count")]
    pub autogroup_at_count: usize,

    /// How long the pipeline holds an enqueued notification so assistants can
    /// adjust it before posting, in milliseconds.
    #[serde(default = "defaults::assistant_adjustment_delay_ms")]
    pub assistant_adjustment_delay_ms: u64,

    /// Bounded size of the historical-notification archive.
    #[serde(default = "defaults::archive_size")]
    pub archive_size: usize,

    /// Hard timeout for contact lookups during people-signal extraction, in
    /// milliseconds. On expiry the record keeps default affinity.
    #[serde(default = "defaults::contacts_timeout_ms")]
    pub contacts_timeout_ms: u64,

    /// Minimum interval between over-rate log lines for one package, so a
    /// misbehaving app cannot flood the log.
    #[serde(default = "defaults::over_rate_log_interval_ms")]
    pub over_rate_log_interval_ms: u64,

    /// Where the policy document (zen + ranking config) is persisted. When
    /// absent the pipeline runs without persistence.
    #[serde(default)]
    pub policy_path: Option<PathBuf>,

    /// Emit a developer-facing warning when an app posts to an unknown
    /// channel instead of dropping silently. Debug builds enable this.
    #[serde(default)]
    pub warn_on_unknown_channel: bool,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            max_package_notifications: defaults::max_package_notifications(),
            max_package_enqueue_rate: defaults::max_package_enqueue_rate(),
            autogroup_at_count: defaults::autogroup_at_count(),
            assistant_adjustment_delay_ms: defaults::assistant_adjustment_delay_ms(),
            archive_size: defaults::archive_size(),
            contacts_timeout_ms: defaults::contacts_timeout_ms(),
            over_rate_log_interval_ms: defaults::over_rate_log_interval_ms(),
            policy_path: None,
            warn_on_unknown_channel: false,
        }
    }
}

impl TuningConfig {
    /// Rejects combinations that would wedge the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_package_notifications == 0 {
            return Err(ConfigError::Validation(
                "max_package_notifications must be at least 1".into(),
            ));
        }
        if !(self.max_package_enqueue_rate > 0.0) {
            return Err(ConfigError::Validation(
                "max_package_enqueue_rate must be positive".into(),
            ));
        }
        if self.autogroup_at_count < 2 {
            return Err(ConfigError::Validation(
                "autogroup_at_count must be at least 2 (a single notification is never bundled)"
                    .into(),
            ));
        }
        if self.archive_size == 0 {
            return Err(ConfigError::Validation(
                "archive_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
}

impl HeraldConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HeraldConfig = toml::from_str(&raw)?;
        config.tuning.validate()?;
        Ok(config)
    }

    /// Default location for the configuration file, under the platform config
    /// directory. `None` when no home directory can be resolved.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = directories_next::ProjectDirs::from("org", "herald", "herald").ok_or(
            ConfigError::DirectoryUnavailable {
                dir_type: "project config".into(),
            },
        )?;
        Ok(dirs.config_dir().join("herald.toml"))
    }
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }
    pub fn log_format() -> String {
        "text".into()
    }
    pub fn max_package_notifications() -> usize {
        50
    }
    pub fn max_package_enqueue_rate() -> f32 {
        10.0
    }
    pub fn autogroup_at_count() -> usize {
        2
    }
    pub fn assistant_adjustment_delay_ms() -> u64 {
        100
    }
    pub fn archive_size() -> usize {
        100
    }
    pub fn contacts_timeout_ms() -> u64 {
        3000
    }
    pub fn over_rate_log_interval_ms() -> u64 {
        5000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_platform_values() {
        let tuning = TuningConfig::default();
        assert_eq!(tuning.max_package_notifications, 50);
        assert_eq!(tuning.max_package_enqueue_rate, 10.0);
        assert_eq!(tuning.autogroup_at_count, 2);
        assert_eq!(tuning.assistant_adjustment_delay_ms, 100);
        assert_eq!(tuning.contacts_timeout_ms, 3000);
        assert!(tuning.validate().is_ok());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: HeraldConfig = toml::from_str(
            r#"
            [tuning]
            autogroup_at_count = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.tuning.autogroup_at_count, 4);
        assert_eq!(config.tuning.max_package_notifications, 50);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn zero_quota_fails_validation() {
        let tuning = TuningConfig {
            max_package_notifications: 0,
            ..Default::default()
        };
        assert!(matches!(
            tuning.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        match HeraldConfig::load(&missing) {
            Err(ConfigError::Read { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected Read error, got {other:?}"),
        }
    }

    #[test]
    fn load_round_trips_written_document() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("herald.toml");
        let config = HeraldConfig {
            tuning: TuningConfig {
                archive_size: 17,
                warn_on_unknown_channel: true,
                ..Default::default()
            },
            ..Default::default()
        };
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = HeraldConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
