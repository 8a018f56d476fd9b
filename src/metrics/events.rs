//! Internal events for rill metrics emission.
//!
//! Each event struct represents a measurable occurrence inside a pipeline.
//! All events carry `pipeline` and, where it applies, `stage` labels.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tracing::trace;

use crate::pipeline::PipelineState;
use crate::stage::StageExit;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when a stage produces successful output elements.
pub struct ElementsProcessed {
    pub count: u64,
    pub pipeline: String,
    pub stage: String,
}

impl InternalEvent for ElementsProcessed {
    fn emit(self) {
        trace!(count = self.count, pipeline = %self.pipeline, stage = %self.stage, "Elements processed");
        counter!("rill_elements_processed_total", "pipeline" => self.pipeline, "stage" => self.stage)
            .increment(self.count);
    }
}

/// Event emitted when a transform fails for a single element.
pub struct ElementFailed {
    pub pipeline: String,
    pub stage: String,
}

impl InternalEvent for ElementFailed {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, stage = %self.stage, "Element failed");
        counter!("rill_elements_failed_total", "pipeline" => self.pipeline, "stage" => self.stage)
            .increment(1);
    }
}

/// Event emitted when a stage fails fatally (error or panic).
pub struct StageFailed {
    pub pipeline: String,
    pub stage: String,
}

impl InternalEvent for StageFailed {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, stage = %self.stage, "Stage failed");
        counter!("rill_stage_failures_total", "pipeline" => self.pipeline, "stage" => self.stage)
            .increment(1);
    }
}

/// Event emitted when a stage task starts.
pub struct StageStarted {
    pub pipeline: String,
}

impl InternalEvent for StageStarted {
    fn emit(self) {
        gauge!("rill_active_stages", "pipeline" => self.pipeline).increment(1.0);
    }
}

/// Event emitted when a stage task exits.
pub struct StageExited {
    pub exit: StageExit,
    pub pipeline: String,
    pub stage: String,
}

impl InternalEvent for StageExited {
    fn emit(self) {
        trace!(exit = self.exit.as_str(), pipeline = %self.pipeline, stage = %self.stage, "Stage exited");
        gauge!("rill_active_stages", "pipeline" => self.pipeline.clone()).decrement(1.0);
        counter!(
            "rill_stage_exits_total",
            "exit" => self.exit.as_str(),
            "pipeline" => self.pipeline,
            "stage" => self.stage
        )
        .increment(1);
    }
}

/// Event emitted when a transform call completes, successfully or not.
pub struct TransformCompleted {
    pub duration: Duration,
    pub pipeline: String,
    pub stage: String,
}

impl InternalEvent for TransformCompleted {
    fn emit(self) {
        histogram!("rill_transform_duration_seconds", "pipeline" => self.pipeline, "stage" => self.stage)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted on every pipeline state transition.
pub struct PipelineStateChanged {
    pub state: PipelineState,
    pub pipeline: String,
}

impl InternalEvent for PipelineStateChanged {
    fn emit(self) {
        trace!(state = self.state.as_str(), pipeline = %self.pipeline, "Pipeline state changed");
        counter!(
            "rill_pipeline_transitions_total",
            "state" => self.state.as_str(),
            "pipeline" => self.pipeline
        )
        .increment(1);
    }
}
