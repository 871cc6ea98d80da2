use crate::error::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenlogConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Live poll timing. All poll delays are expressed in multiples of `unit_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_unit_ms")]
    pub unit_ms: u64,
    #[serde(default = "default_playback_timeout_units")]
    pub playback_timeout_units: u32,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
}

const fn default_unit_ms() -> u64 {
    1000
}

const fn default_playback_timeout_units() -> u32 {
    10
}

const fn default_watchdog_interval_secs() -> u64 {
    30
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            unit_ms: default_unit_ms(),
            playback_timeout_units: default_playback_timeout_units(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
        }
    }
}

impl PollingConfig {
    #[must_use]
    pub const fn unit(&self) -> Duration {
        Duration::from_millis(self.unit_ms)
    }

    #[must_use]
    pub fn playback_timeout(&self) -> Duration {
        self.unit() * self.playback_timeout_units
    }

    #[must_use]
    pub const fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default = "default_backfill_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

const fn default_backfill_interval_secs() -> u64 {
    60 * 60
}

const fn default_history_limit() -> u32 {
    50
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_backfill_interval_secs(),
            limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_enrichment_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

const fn default_enrichment_interval_secs() -> u64 {
    12 * 60 * 60
}

const fn default_batch_size() -> u32 {
    50
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_enrichment_interval_secs(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Overrides the default `~/.config/listenlog/listens.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(crate::paths::listens_db_path)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Provider sections (`[providers.<name>]`), parsed lazily by each provider crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvidersConfig(toml::Table);

impl ProvidersConfig {
    /// Deserialize the section for `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the section exists but does not match `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let Some(value) = self.0.get(name) else {
            return Ok(None);
        };
        value
            .clone()
            .try_into()
            .map(Some)
            .map_err(|e: toml::de::Error| CoreError::ConfigInvalid {
                message: format!("providers.{name}: {e}"),
            })
    }
}

impl ListenlogConfig {
    /// Get the config file path (~/.config/listenlog/config.toml)
    #[must_use]
    pub fn config_path() -> PathBuf {
        crate::paths::config_path()
    }

    /// Load config from file or create template on first run.
    ///
    /// `provider_templates` are appended to the base template when a new file is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or `ConfigNotFound`
    /// after writing a fresh template.
    pub fn load_or_create(provider_templates: Option<&[&str]>) -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(&config_path, build_config_template(provider_templates))?;

            return Err(CoreError::ConfigNotFound { path: config_path });
        }

        let content = fs::read_to_string(&config_path)?;
        Self::parse(&content)
    }

    /// Parse and validate config file contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or a value is out of range.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.polling.unit_ms == 0 {
            return Err(CoreError::ConfigInvalid {
                message: "polling.unit_ms must be greater than zero".into(),
            });
        }
        if self.polling.playback_timeout_units == 0 {
            return Err(CoreError::ConfigInvalid {
                message: "polling.playback_timeout_units must be greater than zero".into(),
            });
        }
        // A zero period would re-arm a job with no delay forever
        for (name, secs) in [
            ("polling.watchdog_interval_secs", self.polling.watchdog_interval_secs),
            ("backfill.interval_secs", self.backfill.interval_secs),
            ("enrichment.interval_secs", self.enrichment.interval_secs),
        ] {
            if secs == 0 {
                return Err(CoreError::ConfigInvalid {
                    message: format!("{name} must be greater than zero"),
                });
            }
        }
        if self.backfill.limit == 0 || self.backfill.limit > 50 {
            return Err(CoreError::ConfigInvalid {
                message: "backfill.limit must be between 1 and 50".into(),
            });
        }
        if self.enrichment.batch_size == 0 || self.enrichment.batch_size > 50 {
            return Err(CoreError::ConfigInvalid {
                message: "enrichment.batch_size must be between 1 and 50".into(),
            });
        }
        Ok(())
    }
}

/// Base template plus any provider sections.
#[must_use]
pub fn build_config_template(provider_templates: Option<&[&str]>) -> String {
    let mut template = BASE_CONFIG_TEMPLATE.to_string();
    for section in provider_templates.unwrap_or_default() {
        template.push('\n');
        template.push_str(section);
    }
    template
}

const BASE_CONFIG_TEMPLATE: &str = r#"# listenlog configuration
# ~/.config/listenlog/config.toml

[polling]
# Length of one poll time-unit. Steady state polls every unit, and backs off
# to two units after a cycle that did enrichment work.
unit_ms = 1000
# Current-playback calls slower than this many units are abandoned
playback_timeout_units = 10
watchdog_interval_secs = 30

[backfill]
# Replays the recently-played window to repair gaps
interval_secs = 3600
limit = 50

[enrichment]
# Fills missing artist metadata
interval_secs = 43200
batch_size = 50

[storage]
# database_path = "/path/to/listens.db"

[logging]
# Also write logs to ~/.config/listenlog/listenlog.log
enabled = false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ListenlogConfig::parse("").unwrap();
        assert_eq!(config.polling.unit(), Duration::from_secs(1));
        assert_eq!(config.polling.playback_timeout(), Duration::from_secs(10));
        assert_eq!(config.backfill.interval_secs, 3600);
        assert_eq!(config.backfill.limit, 50);
        assert_eq!(config.enrichment.interval_secs, 43200);
        assert!(!config.logging.enabled);
    }

    #[test]
    fn test_base_template_parses() {
        let config = ListenlogConfig::parse(&build_config_template(None)).unwrap();
        assert_eq!(config.polling.watchdog_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_unit_rejected() {
        let err = ListenlogConfig::parse("[polling]\nunit_ms = 0\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_zero_job_intervals_rejected() {
        for (content, field) in [
            ("[polling]\nwatchdog_interval_secs = 0\n", "polling.watchdog_interval_secs"),
            ("[backfill]\ninterval_secs = 0\n", "backfill.interval_secs"),
            ("[enrichment]\ninterval_secs = 0\n", "enrichment.interval_secs"),
        ] {
            let err = ListenlogConfig::parse(content).unwrap_err();
            assert!(
                matches!(err, CoreError::ConfigInvalid { ref message } if message.contains(field)),
                "{content:?} gave {err}"
            );
        }
    }

    #[test]
    fn test_backfill_limit_bounded_by_page_size() {
        let err = ListenlogConfig::parse("[backfill]\nlimit = 51\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_provider_section_lookup() {
        #[derive(Deserialize)]
        struct Dummy {
            client_id: String,
        }

        let config =
            ListenlogConfig::parse("[providers.dummy]\nclient_id = \"abc\"\n").unwrap();
        let dummy: Dummy = config.providers.get("dummy").unwrap().unwrap();
        assert_eq!(dummy.client_id, "abc");
        assert!(config.providers.get::<Dummy>("missing").unwrap().is_none());
    }
}
