use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{MementoError, Result};
use crate::serializer::SerializerConfig;

const MIN_PERSIST_PERIOD_MS: u64 = 10;

/// What a rebind does when a memento names a type the registry cannot build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeResolutionMode {
    /// Record the problem, skip the object and keep going.
    #[default]
    Lenient,
    /// Fail the whole rebind.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebindConfig {
    /// When false, mutations are not tracked and nothing is written.
    pub persistence_enabled: bool,
    pub persist_period_ms: u64,
    pub type_resolution: TypeResolutionMode,
    pub serializer: SerializerConfig,
}

impl Default for RebindConfig {
    fn default() -> Self {
        Self {
            persistence_enabled: true,
            persist_period_ms: 1000,
            type_resolution: TypeResolutionMode::default(),
            serializer: SerializerConfig::default(),
        }
    }
}

impl RebindConfig {
    pub fn with_persistence_enabled(mut self, enabled: bool) -> Self {
        self.persistence_enabled = enabled;
        self
    }

    pub fn with_persist_period(mut self, period: Duration) -> Self {
        self.persist_period_ms = period.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_type_resolution(mut self, mode: TypeResolutionMode) -> Self {
        self.type_resolution = mode;
        self
    }

    pub fn with_serializer(mut self, serializer: SerializerConfig) -> Self {
        self.serializer = serializer;
        self
    }

    /// Tick period, clamped so a zero setting cannot spin the worker.
    pub fn persist_period(&self) -> Duration {
        Duration::from_millis(self.persist_period_ms.max(MIN_PERSIST_PERIOD_MS))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| MementoError::Encoding(format!("rebind config: {}", e)))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }
}
