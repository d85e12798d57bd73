//! # Scheduler Configuration
//!
//! Loaded once at startup from TOML. Every field has a default, so an
//! empty file is a valid configuration.
//!
//! ```toml
//! max_level = 44
//! full_level = 33
//! max_concurrent = 8
//! workers = 4
//! poll_interval_ms = 2
//! auto_request = true
//! forced_cells = [{ x = 0, z = 0 }]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tessera_shared::{CellCoord, Level, DEFAULT_MAX_CONCURRENT, FULL_LEVEL, MAX_LEVEL};

use crate::error::{ConfigError, ConfigResult};
use crate::stage::StageRegistry;

/// Tunables for a [`crate::Scheduler`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Highest finite level; queue buckets cover `0..=max_level`.
    pub max_level: Level,
    /// Level at and below which cells must be fully generated.
    pub full_level: Level,
    /// Hard ceiling on cells in flight.
    pub max_concurrent: usize,
    /// Worker tasks spawned by `spawn_workers`.
    pub workers: usize,
    /// Idle sleep of a worker that found nothing to do (ms).
    pub poll_interval_ms: u64,
    /// Request the stage implied by a cell's level whenever it changes.
    pub auto_request: bool,
    /// Cells that get a forced ticket at startup.
    pub forced_cells: Vec<CellCoord>,
    /// Unread events the completion stream holds before dropping.
    pub completion_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_level: MAX_LEVEL,
            full_level: FULL_LEVEL,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            workers: 4,
            poll_interval_ms: 2,
            auto_request: true,
            forced_cells: Vec::new(),
            completion_capacity: 4096,
        }
    }
}

impl SchedulerConfig {
    /// Production preset: wider in-flight window, more workers.
    #[must_use]
    pub fn production() -> Self {
        Self {
            max_concurrent: 64,
            workers: 8,
            poll_interval_ms: 1,
            completion_capacity: 65_536,
            ..Self::default()
        }
    }

    /// Test preset: small level scale, manual requests only.
    ///
    /// With `max_level = 4` and `full_level = 2` a forced ticket reaches
    /// two rings beyond the fully generated cell.
    #[must_use]
    pub fn test() -> Self {
        Self {
            max_level: 4,
            full_level: 2,
            max_concurrent: 4,
            workers: 2,
            poll_interval_ms: 1,
            auto_request: false,
            forced_cells: Vec::new(),
            completion_capacity: 1024,
        }
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns error if the document is not valid for the schema.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks the values against each other and against `registry`.
    ///
    /// # Errors
    ///
    /// Returns error if any constraint fails.
    pub fn validate(&self, registry: &StageRegistry) -> ConfigResult<()> {
        if self.max_level == Level::MAX {
            return Err(ConfigError::Invalid(format!(
                "max_level must be below {}",
                Level::MAX
            )));
        }
        let reach = u32::from(self.full_level) + registry.max_distance();
        if reach > u32::from(self.max_level) {
            return Err(ConfigError::Invalid(format!(
                "full_level {} plus dependency distance {} exceeds max_level {}",
                self.full_level,
                registry.max_distance(),
                self.max_level
            )));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("max_concurrent must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        Ok(())
    }

    /// Worker idle interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::NeighborWindow;
    use crate::stage::{StageFuture, StageWork};
    use std::sync::Arc;

    struct Noop;

    impl StageWork for Noop {
        fn generate(&self, window: NeighborWindow) -> StageFuture<'_> {
            Box::pin(async move { Ok(window.into_center()) })
        }
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = SchedulerConfig::from_toml_str("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn test_parse_overrides() {
        let config = SchedulerConfig::from_toml_str(
            "max_concurrent = 2\nauto_request = false\nforced_cells = [{ x = 3, z = -1 }]",
        )
        .unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert!(!config.auto_request);
        assert_eq!(config.forced_cells, vec![CellCoord::new(3, -1)]);
        assert_eq!(config.max_level, MAX_LEVEL);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = SchedulerConfig::from_toml_str("max_concurent = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate() {
        let registry = StageRegistry::standard(Arc::new(Noop));
        assert!(SchedulerConfig::default().validate(&registry).is_ok());
        assert!(SchedulerConfig::production().validate(&registry).is_ok());
        assert!(SchedulerConfig::test().validate(&registry).is_ok());

        let config = SchedulerConfig {
            full_level: 43,
            ..SchedulerConfig::default()
        };
        assert!(matches!(config.validate(&registry), Err(ConfigError::Invalid(_))));

        let config = SchedulerConfig {
            max_concurrent: 0,
            ..SchedulerConfig::default()
        };
        assert!(config.validate(&registry).is_err());
    }
}
