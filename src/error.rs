//! Error types for rill using snafu.
//!
//! Errors fall into three groups:
//! - [`TransformError`]: returned by user transforms for a single element.
//! - [`StageError`]: what a stage puts into an error envelope or the
//!   pipeline's terminal slot. Cheap to clone so it can travel downstream.
//! - [`PipelineError`] / [`ConfigError`]: construction and lifecycle errors.

use std::error::Error as StdError;
use std::sync::Arc;

use snafu::prelude::*;

/// Boxed error accepted from transforms.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Shared error handle carried inside envelopes.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

// ============ Transform Errors ============

/// Errors a transform returns for one input element.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    /// The element failed; the stage keeps running.
    #[snafu(display("element failed: {source}"))]
    Element { source: BoxError },

    /// The stage cannot continue.
    #[snafu(display("fatal stage failure: {source}"))]
    Fatal { source: BoxError },
}

impl TransformError {
    /// Wrap any error as a per-element failure.
    pub fn element(err: impl Into<BoxError>) -> Self {
        Self::Element { source: err.into() }
    }

    /// Wrap any error as a fatal stage failure.
    pub fn fatal(err: impl Into<BoxError>) -> Self {
        Self::Fatal { source: err.into() }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

// ============ Stage Errors ============

/// Error carried through a stream or recorded as a pipeline failure.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub), context(suffix(Ctx)))]
pub enum StageError {
    /// A single element failed in the named stage.
    #[snafu(display("stage '{stage}' failed on element: {source}"))]
    Element { stage: Arc<str>, source: SharedError },

    /// The named stage stopped after an unrecoverable error.
    #[snafu(display("stage '{stage}' failed fatally: {source}"))]
    Fatal { stage: Arc<str>, source: SharedError },

    /// The transform panicked; the payload message is kept.
    #[snafu(display("stage '{stage}' panicked: {message}"))]
    Panicked { stage: Arc<str>, message: String },
}

impl StageError {
    pub(crate) fn from_transform(stage: &Arc<str>, err: TransformError) -> Self {
        match err {
            TransformError::Element { source } => Self::Element {
                stage: stage.clone(),
                source: Arc::from(source),
            },
            TransformError::Fatal { source } => Self::Fatal {
                stage: stage.clone(),
                source: Arc::from(source),
            },
        }
    }

    /// Id of the stage that produced this error.
    pub fn stage(&self) -> &str {
        match self {
            Self::Element { stage, .. } | Self::Fatal { stage, .. } | Self::Panicked { stage, .. } => {
                stage
            }
        }
    }

    /// True for errors that terminated the producing stage.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Element { .. })
    }

    /// The error originally returned by the transform, if any.
    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Element { source, .. } | Self::Fatal { source, .. } => Some(source.as_ref()),
            Self::Panicked { .. } => None,
        }
    }

    /// Downcast the original transform error to a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner().and_then(|e| e.downcast_ref::<E>())
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{}", errors.join("\n")))]
    EnvInterpolation { errors: Vec<String> },

    /// Pipeline id is empty.
    #[snafu(display("Pipeline id cannot be empty"))]
    EmptyId,

    /// A stage override asks for zero workers.
    #[snafu(display("Stage '{stage}' must have at least one worker"))]
    InvalidWorkers { stage: String },

    /// A stage override has both `buffer` and `unbounded` set.
    #[snafu(display("Stage '{stage}' cannot set both 'buffer' and 'unbounded'"))]
    BufferConflict { stage: String },

    /// A stage override names a stage the pipeline does not have.
    #[snafu(display("Configuration names unknown stage '{stage}'"))]
    UnknownStage { stage: String },
}

// ============ Pipeline Errors ============

/// Errors raised while building or starting a pipeline.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Fan-out asked for zero workers.
    #[snafu(display("Stage '{stage}' needs at least one worker, got {count}"))]
    InvalidWorkerCount { stage: String, count: usize },

    /// The pipeline was already started.
    #[snafu(display("Pipeline '{pipeline}' was already started"))]
    AlreadyStarted { pipeline: String },

    /// Configuration problem.
    #[snafu(display("Invalid pipeline configuration: {source}"))]
    Config { source: ConfigError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Snafu, PartialEq)]
    #[snafu(display("bad input {value}"))]
    struct BadInput {
        value: i32,
    }

    #[test]
    fn test_transform_error_constructors() {
        assert!(!TransformError::element("nope").is_fatal());
        assert!(TransformError::fatal("boom").is_fatal());
    }

    #[test]
    fn test_stage_error_keeps_original() {
        let stage: Arc<str> = Arc::from("parse");
        let err = StageError::from_transform(&stage, TransformError::element(BadInput { value: 3 }));

        assert_eq!(err.stage(), "parse");
        assert!(!err.is_fatal());
        assert_eq!(err.downcast_ref::<BadInput>(), Some(&BadInput { value: 3 }));
        assert_eq!(
            err.to_string(),
            "stage 'parse' failed on element: bad input 3"
        );
    }

    #[test]
    fn test_stage_error_clone_shares_source() {
        let stage: Arc<str> = Arc::from("sink");
        let err = StageError::from_transform(&stage, TransformError::fatal("disk full"));
        let cloned = err.clone();

        assert!(cloned.is_fatal());
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn test_panicked_has_no_inner() {
        let err = StageError::Panicked {
            stage: Arc::from("x"),
            message: "oops".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.inner().is_none());
        assert_eq!(err.to_string(), "stage 'x' panicked: oops");
    }

    #[test]
    fn test_pipeline_error_display() {
        let err = PipelineError::InvalidWorkerCount {
            stage: "enrich".to_string(),
            count: 0,
        };
        assert_eq!(
            err.to_string(),
            "Stage 'enrich' needs at least one worker, got 0"
        );
    }
}
