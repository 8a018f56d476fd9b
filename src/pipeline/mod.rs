//! Ordered composition of stages with shared cancellation.
//!
//! A [`Pipeline`] is assembled with a typed builder: each `.stage()` call
//! consumes the previous output type and produces the next one, so a
//! pipeline whose stages do not line up does not compile.
//!
//! Starting a pipeline wires stage N's output stream to stage N+1's input and
//! spawns every stage task on one tracker. A supervisor task then follows
//! the run:
//!
//! - the head stage seeing its input close moves the pipeline to `Draining`;
//! - the effective signal (cancel, deadline, or fail-fast) firing before every
//!   stage exited moves it to `Cancelling`;
//! - once every stage task has exited, the internal scope signal is closed so
//!   combinator and deadline listeners exit too, and the pipeline is `Stopped`.
//!
//! # Example
//!
//! ```ignore
//! use rill::{Pipeline, Stage, map};
//!
//! let pipeline = Pipeline::builder::<i32>("numbers")
//!     .stage(Stage::new("double", map(|x: i32| x * 2)))
//!     .stage(Stage::new("inc", map(|x: i32| x + 1)))
//!     .build()?;
//!
//! let out = pipeline.start_from_iter(vec![1, 2, 3, 4])?;
//! let values = out.collect_all().await;
//! pipeline.wait().await;
//! ```

mod state;

pub use state::PipelineState;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use snafu::ResultExt;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, info, info_span, warn};

use crate::combinator::Combinator;
use crate::config::{PipelineConfig, StageConfig};
use crate::error::{
    ConfigError, ConfigSnafu, InvalidWorkerCountSnafu, PipelineError, StageError,
};
use crate::failure::{ErrorMode, FailureSlot};
use crate::fanout::fan_out_merged;
use crate::signal::Signal;
use crate::stage::{Inlet, Stage, StageContext};
use crate::stream::{Capacity, StreamReceiver, spawn_feeder};

use state::StateCell;

type WireFn<I, O> =
    Box<dyn FnOnce(&Wiring, StreamReceiver<I>) -> Result<StreamReceiver<O>, PipelineError> + Send>;

/// Everything a wiring closure needs to spawn its stage.
struct Wiring {
    head: StageContext,
    rest: StageContext,
    default_capacity: Capacity,
    config: Option<Arc<PipelineConfig>>,
}

impl Wiring {
    fn spawn_stage<In, Out>(
        &self,
        stage: &Stage<In, Out>,
        input: StreamReceiver<In>,
        requested_workers: Option<usize>,
        is_head: bool,
    ) -> Result<StreamReceiver<Out>, PipelineError>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        let ctx = if is_head { &self.head } else { &self.rest };
        let overrides = self.config.as_deref().and_then(|c| c.stage(stage.id()));

        let capacity = overrides
            .and_then(StageConfig::capacity)
            .or(stage.capacity())
            .unwrap_or(self.default_capacity);
        let workers = overrides
            .and_then(|o| o.workers)
            .or(requested_workers)
            .unwrap_or(1);

        match workers {
            1 => Ok(stage.launch(ctx, Inlet::Owned(input), capacity, None)),
            n => fan_out_merged(ctx, input, n, stage, capacity),
        }
    }
}

/// Builder settings that do not depend on the element types.
#[derive(Debug, Clone)]
struct Settings {
    id: String,
    error_mode: ErrorMode,
    deadline: Option<Duration>,
    default_capacity: Capacity,
    config: Option<Arc<PipelineConfig>>,
    stage_ids: Vec<String>,
    invalid: Option<(String, usize)>,
}

/// Typed builder for a [`Pipeline`] taking `I` and producing `O`.
pub struct PipelineBuilder<I, O> {
    settings: Settings,
    wire: WireFn<I, O>,
}

impl<I, O> PipelineBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Append a stage.
    pub fn stage<N>(self, stage: Stage<O, N>) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
    {
        self.push(stage, None)
    }

    /// Append a run of stages that all map `O` to `O`.
    pub fn stages(self, stages: impl IntoIterator<Item = Stage<O, O>>) -> Self {
        stages.into_iter().fold(self, |builder, stage| builder.stage(stage))
    }

    /// Append `workers` parallel copies of a stage; their outputs are merged
    /// into one stream, in no particular order.
    pub fn fan_out<N>(mut self, stage: Stage<O, N>, workers: usize) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
    {
        if workers == 0 && self.settings.invalid.is_none() {
            self.settings.invalid = Some((stage.id().to_string(), workers));
        }
        self.push(stage, Some(workers))
    }

    fn push<N>(self, stage: Stage<O, N>, workers: Option<usize>) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
    {
        let Self { mut settings, wire } = self;
        let is_head = settings.stage_ids.is_empty();
        settings.stage_ids.push(stage.id().to_string());

        PipelineBuilder {
            settings,
            wire: Box::new(move |wiring: &Wiring, input: StreamReceiver<I>| {
                let upstream = wire(wiring, input)?;
                wiring.spawn_stage(&stage, upstream, workers, is_head)
            }),
        }
    }

    /// What happens when a stage fails fatally. Defaults to best-effort.
    pub fn error_mode(mut self, mode: ErrorMode) -> Self {
        self.settings.error_mode = mode;
        self
    }

    /// Cancel the pipeline once `after` has elapsed from start.
    pub fn deadline(mut self, after: Duration) -> Self {
        self.settings.deadline = Some(after);
        self
    }

    /// Buffer for stages that do not set their own. 0 is a rendezvous handoff.
    pub fn default_buffer(mut self, buffer: usize) -> Self {
        self.settings.default_capacity = Capacity::from_hint(buffer);
        self
    }

    /// Apply a loaded configuration.
    ///
    /// Error mode, deadline and default buffer are taken from `config` when
    /// set there; per-stage overrides are matched by stage id at start and
    /// win over the stage's own buffer and worker settings. The pipeline id is
    /// not changed.
    pub fn with_config(mut self, config: &PipelineConfig) -> Self {
        self.settings.error_mode = config.error_mode;
        if let Some(deadline) = config.deadline() {
            self.settings.deadline = Some(deadline);
        }
        if let Some(buffer) = config.default_buffer {
            self.settings.default_capacity = Capacity::from_hint(buffer);
        }
        self.settings.config = Some(Arc::new(config.clone()));
        self
    }

    /// Validate the composition and produce a pipeline in the `Built` state.
    pub fn build(self) -> Result<Pipeline<I, O>, PipelineError> {
        let Self { settings, wire } = self;

        if let Some((stage, count)) = settings.invalid {
            return InvalidWorkerCountSnafu { stage, count }.fail();
        }
        if let Some(config) = &settings.config {
            config.validate().context(ConfigSnafu)?;
            if let Some(stage) = config
                .stages
                .keys()
                .find(|id| !settings.stage_ids.contains(*id))
            {
                return Err(PipelineError::Config {
                    source: ConfigError::UnknownStage {
                        stage: stage.clone(),
                    },
                });
            }
        }

        let id: Arc<str> = Arc::from(settings.id);
        let cancel = Signal::new();
        let scope = Signal::new();

        Ok(Pipeline {
            failures: FailureSlot::new(id.clone(), settings.error_mode, cancel.clone()),
            state: StateCell::new(id.clone()),
            combinator: Combinator::new(&scope),
            tracker: TaskTracker::new(),
            wire: Mutex::new(Some(wire)),
            stage_count: settings.stage_ids.len(),
            deadline: settings.deadline,
            default_capacity: settings.default_capacity,
            config: settings.config,
            id,
            cancel,
            scope,
        })
    }
}

/// A composed sequence of stages sharing one cancellation signal.
///
/// `Pipeline` is `Send + Sync`; wrap it in an `Arc` to cancel or wait on it
/// from other tasks.
pub struct Pipeline<I, O> {
    id: Arc<str>,
    cancel: Signal,
    scope: Signal,
    combinator: Combinator,
    tracker: TaskTracker,
    failures: FailureSlot,
    state: StateCell,
    wire: Mutex<Option<WireFn<I, O>>>,
    stage_count: usize,
    deadline: Option<Duration>,
    default_capacity: Capacity,
    config: Option<Arc<PipelineConfig>>,
}

impl Pipeline<(), ()> {
    /// Start building a pipeline whose input elements are `T`.
    pub fn builder<T>(id: impl Into<String>) -> PipelineBuilder<T, T>
    where
        T: Send + 'static,
    {
        PipelineBuilder {
            settings: Settings {
                id: id.into(),
                error_mode: ErrorMode::default(),
                deadline: None,
                default_capacity: Capacity::default(),
                config: None,
                stage_ids: Vec::new(),
                invalid: None,
            },
            wire: Box::new(|_: &Wiring, input: StreamReceiver<T>| Ok::<_, PipelineError>(input)),
        }
    }
}

impl<I, O> Pipeline<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Start the pipeline reading from `initial`. Returns the last stage's
    /// output stream.
    pub fn start(&self, initial: StreamReceiver<I>) -> Result<StreamReceiver<O>, PipelineError> {
        self.launch(self.deadline, |_, _| initial)
    }

    /// Start the pipeline with a feeder task producing `items`.
    ///
    /// The feeder observes the pipeline's signal and is counted by
    /// [`live_tasks`](Self::live_tasks).
    pub fn start_from_iter<It>(&self, items: It) -> Result<StreamReceiver<O>, PipelineError>
    where
        It: IntoIterator<Item = I> + Send + 'static,
        It::IntoIter: Send,
    {
        let capacity = self.default_capacity;
        self.launch(self.deadline, move |tracker, signal| {
            spawn_feeder(tracker, signal, items, capacity)
        })
    }

    /// Start the pipeline with a deadline, replacing any configured one.
    pub fn start_with_deadline(
        &self,
        initial: StreamReceiver<I>,
        after: Duration,
    ) -> Result<StreamReceiver<O>, PipelineError> {
        self.launch(Some(after), |_, _| initial)
    }

    fn launch<F>(
        &self,
        deadline: Option<Duration>,
        source: F,
    ) -> Result<StreamReceiver<O>, PipelineError>
    where
        F: FnOnce(&TaskTracker, &Signal) -> StreamReceiver<I>,
    {
        let wire = self
            .wire
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| PipelineError::AlreadyStarted {
                pipeline: self.id.to_string(),
            })?;

        let effective = match deadline {
            Some(after) => self.combinator.with_deadline(&self.cancel, after),
            None => self.cancel.clone(),
        };

        self.state.transition(PipelineState::Running);
        info!(
            pipeline = %self.id,
            stages = self.stage_count,
            error_mode = self.failures.mode().as_str(),
            deadline_ms = deadline.map(|d| d.as_millis() as u64),
            "Pipeline started"
        );

        let rest = StageContext::for_pipeline(
            self.id.clone(),
            effective.clone(),
            self.tracker.clone(),
            self.failures.clone(),
        );
        let state = self.state.clone();
        let head = rest.with_exhausted_hook(Arc::new(move || {
            state.transition(PipelineState::Draining);
        }));
        let wiring = Wiring {
            head,
            rest,
            default_capacity: self.default_capacity,
            config: self.config.clone(),
        };

        let initial = source(&self.tracker, &effective);
        let wired = wire(&wiring, initial);
        if wired.is_err() {
            self.cancel.close();
        }

        self.spawn_supervisor(effective);
        wired
    }

    /// Follow the stage tasks to completion and tear down listeners.
    fn spawn_supervisor(&self, effective: Signal) {
        let tracker = self.tracker.clone();
        let state = self.state.clone();
        let scope = self.scope.clone();
        let combinator = self.combinator.clone();
        let failures = self.failures.clone();
        let span = info_span!("supervisor", pipeline = %self.id);

        tracker.close();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = tracker.wait() => {}
                    _ = effective.done() => {
                        state.transition(PipelineState::Cancelling);
                        tracker.wait().await;
                    }
                }

                scope.close();
                combinator.wait().await;

                match failures.first() {
                    Some(first) => warn!(
                        failures = failures.count(),
                        stage = first.stage(),
                        "Pipeline stopped with fatal stage errors"
                    ),
                    None => info!("Pipeline stopped"),
                }
                state.transition(PipelineState::Stopped);
            }
            .instrument(span),
        );
    }

    /// Close the pipeline's cancellation signal. Idempotent.
    pub fn cancel(&self) {
        if self.cancel.close() {
            info!(pipeline = %self.id, state = self.state().as_str(), "Pipeline cancel requested");
        }
    }

    /// Wait until every stage task and auxiliary listener has exited.
    ///
    /// Resolves immediately for a pipeline that was never started.
    pub async fn wait(&self) {
        self.state
            .wait_for(|s| matches!(s, PipelineState::Built | PipelineState::Stopped))
            .await;
    }
}

impl<I, O> Pipeline<I, O> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// First fatal stage error, if any. Never blocks.
    pub fn err(&self) -> Option<StageError> {
        self.failures.first()
    }

    /// Number of fatal stage errors recorded so far.
    pub fn failure_count(&self) -> usize {
        self.failures.count()
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// The cancellation signal owned by this pipeline.
    ///
    /// Closing it is equivalent to [`cancel`](Self::cancel); it can also be
    /// combined with other signals or passed to standalone stages.
    pub fn signal(&self) -> &Signal {
        &self.cancel
    }

    /// Stage, feeder, forwarder and listener tasks still running.
    pub fn live_tasks(&self) -> usize {
        self.tracker.len() + self.combinator.live_listeners()
    }

    pub fn error_mode(&self) -> ErrorMode {
        self.failures.mode()
    }
}

impl<I, O> fmt::Debug for Pipeline<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stages", &self.stage_count)
            .field("live_tasks", &self.live_tasks())
            .field("failures", &self.failure_count())
            .finish_non_exhaustive()
    }
}
