use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use survey_kernel_core::SurveyError;

/// Tunables for [`crate::SurveyEngine`]. Missing JSON fields take defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum number of contact snapshots held in memory.
    pub cache_capacity: u64,
    /// Snapshot time-to-live; `0` keeps entries until evicted by capacity.
    pub cache_ttl_seconds: u64,
    pub tree_cache_capacity: u64,
    pub busy_timeout_ms: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            cache_ttl_seconds: 0,
            tree_cache_capacity: 64,
            busy_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`SurveyError::Configuration`] when the JSON is malformed or
    /// fails [`EngineConfig::validate`].
    pub fn from_json(raw: &str) -> Result<Self, SurveyError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| SurveyError::Configuration(format!("invalid engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`SurveyError::Configuration`] when the file cannot be read or
    /// parsed.
    pub fn load(path: &Path) -> Result<Self, SurveyError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            SurveyError::Configuration(format!(
                "failed to read engine config {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }

    /// # Errors
    /// Returns [`SurveyError::Configuration`] for zero capacities or a zero
    /// busy timeout.
    pub fn validate(&self) -> Result<(), SurveyError> {
        if self.cache_capacity == 0 {
            return Err(SurveyError::Configuration(
                "cache_capacity MUST be greater than zero".to_string(),
            ));
        }
        if self.tree_cache_capacity == 0 {
            return Err(SurveyError::Configuration(
                "tree_cache_capacity MUST be greater than zero".to_string(),
            ));
        }
        if self.busy_timeout_ms == 0 {
            return Err(SurveyError::Configuration(
                "busy_timeout_ms MUST be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_seconds > 0).then(|| Duration::from_secs(self.cache_ttl_seconds))
    }
}
