//! Terminal failure slot shared by the stages of one pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::emit;
use crate::error::StageError;
use crate::metrics::events::StageFailed;
use crate::signal::Signal;

/// What a pipeline does when a stage fails fatally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Record the failure and let the other stages run to completion.
    #[default]
    BestEffort,
    /// Record the failure and cancel the whole pipeline.
    FailFast,
}

impl ErrorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorMode::BestEffort => "best_effort",
            ErrorMode::FailFast => "fail_fast",
        }
    }
}

/// First-wins record of fatal stage errors.
///
/// Lock-free: the first error is kept in a `OnceLock`, later ones only bump
/// the counter.
#[derive(Clone, Debug)]
pub(crate) struct FailureSlot {
    first: Arc<OnceLock<StageError>>,
    count: Arc<AtomicUsize>,
    mode: ErrorMode,
    cancel: Signal,
    pipeline: Arc<str>,
}

impl FailureSlot {
    /// `cancel` is closed on the first failure when `mode` is fail-fast.
    pub fn new(pipeline: Arc<str>, mode: ErrorMode, cancel: Signal) -> Self {
        Self {
            first: Arc::new(OnceLock::new()),
            count: Arc::new(AtomicUsize::new(0)),
            mode,
            cancel,
            pipeline,
        }
    }

    pub fn record(&self, error: &StageError) {
        self.count.fetch_add(1, Ordering::SeqCst);
        let _ = self.first.set(error.clone());

        emit!(StageFailed {
            pipeline: self.pipeline.to_string(),
            stage: error.stage().to_string(),
        });

        if self.mode == ErrorMode::FailFast && self.cancel.close() {
            info!(
                pipeline = %self.pipeline,
                stage = error.stage(),
                "Fail-fast: cancelling pipeline after fatal stage error"
            );
        }
    }

    pub fn first(&self) -> Option<StageError> {
        self.first.get().cloned()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> ErrorMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransformError;

    fn fatal(stage: &str, msg: &'static str) -> StageError {
        StageError::from_transform(&Arc::from(stage), TransformError::fatal(msg))
    }

    #[test]
    fn test_first_failure_wins() {
        let slot = FailureSlot::new(Arc::from("p"), ErrorMode::BestEffort, Signal::new());

        slot.record(&fatal("a", "first"));
        slot.record(&fatal("b", "second"));

        assert_eq!(slot.count(), 2);
        assert_eq!(slot.first().unwrap().stage(), "a");
    }

    #[test]
    fn test_best_effort_does_not_cancel() {
        let cancel = Signal::new();
        let slot = FailureSlot::new(Arc::from("p"), ErrorMode::BestEffort, cancel.clone());

        slot.record(&fatal("a", "boom"));
        assert!(!cancel.is_closed());
    }

    #[test]
    fn test_fail_fast_cancels() {
        let cancel = Signal::new();
        let slot = FailureSlot::new(Arc::from("p"), ErrorMode::FailFast, cancel.clone());

        assert!(slot.first().is_none());
        slot.record(&fatal("a", "boom"));
        assert!(cancel.is_closed());
    }

    #[test]
    fn test_error_mode_serde() {
        let mode: ErrorMode = serde_yaml::from_str("fail_fast").unwrap();
        assert_eq!(mode, ErrorMode::FailFast);
        assert_eq!(ErrorMode::default(), ErrorMode::BestEffort);
        assert_eq!(ErrorMode::BestEffort.as_str(), "best_effort");
    }
}
