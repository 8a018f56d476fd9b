//! Pipeline configuration loaded from YAML.
//!
//! A config file tunes a pipeline built in code: its error mode, an optional
//! deadline, the default stream buffer, and per-stage overrides looked up by
//! stage id. Environment variables are substituted before parsing (see
//! [`vars`]).
//!
//! ```yaml
//! id: orders
//! error_mode: fail_fast
//! deadline_ms: 5000
//! default_buffer: 16
//! stages:
//!   enrich: { workers: 4, buffer: 32 }
//!   sink: { unbounded: true }
//! ```

mod vars;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{
    BufferConflictSnafu, ConfigError, EmptyIdSnafu, EnvInterpolationSnafu, InvalidWorkersSnafu,
    ReadFileSnafu, YamlParseSnafu,
};
use crate::failure::ErrorMode;
use crate::stream::Capacity;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Pipeline id, used in logs and metric labels.
    pub id: String,
    /// What happens when a stage fails fatally.
    #[serde(default)]
    pub error_mode: ErrorMode,
    /// Cancel the pipeline this many milliseconds after it starts.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Buffer for stages that do not set their own. 0 is a rendezvous handoff.
    #[serde(default)]
    pub default_buffer: Option<usize>,
    /// Overrides keyed by stage id.
    #[serde(default)]
    pub stages: BTreeMap<String, StageConfig>,
}

/// Per-stage overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Number of parallel workers for this stage.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Output buffer size. 0 is a rendezvous handoff.
    #[serde(default)]
    pub buffer: Option<usize>,
    /// Unbounded output buffer.
    #[serde(default)]
    pub unbounded: bool,
}

impl StageConfig {
    /// Output capacity requested by this override, if any.
    pub fn capacity(&self) -> Option<Capacity> {
        if self.unbounded {
            Some(Capacity::Unbounded)
        } else {
            self.buffer.map(Capacity::from_hint)
        }
    }
}

impl PipelineConfig {
    /// Config with the given id and every other field defaulted.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Parse and validate YAML, substituting environment variables first.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let text = vars::interpolate(yaml).map_err(|errors| EnvInterpolationSnafu { errors }.build())?;
        Self::parse(&text)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file, optionally skipping environment
    /// substitution.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;

        if interpolate_env {
            Self::from_yaml(&content)
        } else {
            Self::parse(&content)
        }
    }

    fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(text).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.id.trim().is_empty(), EmptyIdSnafu);
        for (stage, overrides) in &self.stages {
            ensure!(overrides.workers != Some(0), InvalidWorkersSnafu { stage });
            ensure!(
                !(overrides.unbounded && overrides.buffer.is_some()),
                BufferConflictSnafu { stage }
            );
        }
        Ok(())
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Overrides for the stage with the given id.
    pub fn stage(&self, id: &str) -> Option<&StageConfig> {
        self.stages.get(id)
    }
}
