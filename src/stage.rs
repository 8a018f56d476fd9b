//! Stage: one concurrently running transformation step.
//!
//! A stage owns exactly one task. The task reads envelopes from its input,
//! applies the transform to successful values, forwards error envelopes
//! untouched, and writes results to an output stream it owns. Every receive,
//! every send, and every transform call races the stage's [`Signal`].
//!
//! The output sender lives inside the task, so the output stream closes on
//! every exit path: input exhausted, cancellation, downstream gone, fatal
//! error, or unwinding.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info_span, warn};

use crate::emit;
use crate::envelope::Envelope;
use crate::error::StageError;
use crate::failure::{ErrorMode, FailureSlot};
use crate::metrics::events::{
    ElementFailed, ElementsProcessed, StageExited, StageStarted, TransformCompleted,
};
use crate::signal::Signal;
use crate::stream::{Capacity, Delivery, Received, SharedReceiver, StreamReceiver, StreamSender, channel};
use crate::transform::Transform;

/// Why a stage task exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    /// The input stream closed and every element was handled.
    Exhausted,
    /// The stage's signal fired.
    Cancelled,
    /// The downstream consumer dropped its receiver.
    Disconnected,
    /// The transform failed fatally or panicked.
    Failed,
}

impl StageExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageExit::Exhausted => "exhausted",
            StageExit::Cancelled => "cancelled",
            StageExit::Disconnected => "disconnected",
            StageExit::Failed => "failed",
        }
    }

    fn from_delivery(delivery: Delivery) -> Option<Self> {
        match delivery {
            Delivery::Delivered => None,
            Delivery::Cancelled => Some(StageExit::Cancelled),
            Delivery::Disconnected => Some(StageExit::Disconnected),
        }
    }
}

type ExhaustedHook = Arc<dyn Fn() + Send + Sync>;

/// Shared resources for the stages of one pipeline.
///
/// Holds the cancellation signal every stage observes, the tracker every
/// stage task is spawned on, and the pipeline's failure slot.
#[derive(Clone)]
pub struct StageContext {
    pipeline: Arc<str>,
    signal: Signal,
    tracker: TaskTracker,
    failures: FailureSlot,
    on_exhausted: Option<ExhaustedHook>,
}

impl StageContext {
    /// Context for stages run outside a pipeline.
    ///
    /// Fatal errors are recorded but never cancel anything.
    pub fn new(signal: &Signal) -> Self {
        let pipeline: Arc<str> = Arc::from("standalone");
        Self {
            failures: FailureSlot::new(pipeline.clone(), ErrorMode::BestEffort, signal.clone()),
            pipeline,
            signal: signal.clone(),
            tracker: TaskTracker::new(),
            on_exhausted: None,
        }
    }

    pub(crate) fn for_pipeline(
        pipeline: Arc<str>,
        signal: Signal,
        tracker: TaskTracker,
        failures: FailureSlot,
    ) -> Self {
        Self {
            pipeline,
            signal,
            tracker,
            failures,
            on_exhausted: None,
        }
    }

    /// Same context, additionally calling `hook` when a stage sees its input
    /// close. Used for the head of a pipeline.
    pub(crate) fn with_exhausted_hook(&self, hook: ExhaustedHook) -> Self {
        Self {
            on_exhausted: Some(hook),
            ..self.clone()
        }
    }

    /// The signal every stage in this context observes.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Number of tasks spawned through this context that are still running.
    pub fn live_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// First fatal error recorded by any stage in this context.
    pub fn first_failure(&self) -> Option<StageError> {
        self.failures.first()
    }

    /// Wait for every task spawned through this context to exit.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    fn input_exhausted(&self) {
        if let Some(hook) = &self.on_exhausted {
            hook();
        }
    }
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("pipeline", &self.pipeline)
            .field("signal", &self.signal)
            .field("live_tasks", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

/// Where a stage reads from: its own stream or one shared with other workers.
pub(crate) enum Inlet<T> {
    Owned(StreamReceiver<T>),
    Shared(SharedReceiver<T>),
}

impl<T> Inlet<T> {
    async fn recv(&mut self, signal: &Signal) -> Received<T> {
        match self {
            Inlet::Owned(rx) => rx.recv(signal).await,
            Inlet::Shared(rx) => rx.recv(signal).await,
        }
    }
}

/// A unit of concurrent work: `id`, transform, and output buffering.
pub struct Stage<In, Out> {
    id: Arc<str>,
    transform: Arc<dyn Transform<In, Out>>,
    capacity: Option<Capacity>,
}

impl<In, Out> Clone for Stage<In, Out> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            transform: self.transform.clone(),
            capacity: self.capacity,
        }
    }
}

impl<In, Out> fmt::Debug for Stage<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl<In, Out> Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new(id: impl Into<String>, transform: impl Transform<In, Out> + 'static) -> Self {
        Self {
            id: Arc::from(id.into()),
            transform: Arc::new(transform),
            capacity: None,
        }
    }

    /// Output buffer hint: 0 is a rendezvous handoff, N is bounded lookahead.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.capacity = Some(Capacity::from_hint(buffer));
        self
    }

    /// Let the output buffer grow without limit.
    pub fn unbounded(mut self) -> Self {
        self.capacity = Some(Capacity::Unbounded);
        self
    }

    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Buffering requested for this stage, if any.
    pub fn capacity(&self) -> Option<Capacity> {
        self.capacity
    }

    /// Run this stage on its own, observing `signal`.
    pub fn run(self, signal: &Signal, input: StreamReceiver<In>) -> StreamReceiver<Out> {
        self.spawn(&StageContext::new(signal), input)
    }

    /// Spawn this stage's task in `ctx` and return its output stream.
    pub fn spawn(self, ctx: &StageContext, input: StreamReceiver<In>) -> StreamReceiver<Out> {
        let capacity = self.capacity.unwrap_or_default();
        self.launch(ctx, Inlet::Owned(input), capacity, None)
    }

    pub(crate) fn launch(
        &self,
        ctx: &StageContext,
        inlet: Inlet<In>,
        capacity: Capacity,
        worker: Option<usize>,
    ) -> StreamReceiver<Out> {
        let (tx, rx) = channel(capacity);
        let span = info_span!("stage", pipeline = %ctx.pipeline, stage = %self.id, worker);
        let worker = StageWorker {
            id: self.id.clone(),
            transform: self.transform.clone(),
            ctx: ctx.clone(),
        };

        ctx.tracker.spawn(worker.run(inlet, tx).instrument(span));
        rx
    }
}

/// Counts kept by a stage task while it runs.
#[derive(Debug, Default)]
struct StageSummary {
    processed: u64,
    element_errors: u64,
    forwarded_errors: u64,
}

struct StageWorker<In, Out> {
    id: Arc<str>,
    transform: Arc<dyn Transform<In, Out>>,
    ctx: StageContext,
}

impl<In, Out> StageWorker<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    async fn run(self, inlet: Inlet<In>, output: StreamSender<Out>) {
        emit!(StageStarted {
            pipeline: self.ctx.pipeline.to_string(),
        });
        debug!("Stage started");

        let mut summary = StageSummary::default();
        let exit = self.drive(inlet, output, &mut summary).await;

        if exit == StageExit::Failed {
            warn!(
                processed = summary.processed,
                element_errors = summary.element_errors,
                "Stage stopped after fatal error"
            );
        } else {
            debug!(
                exit = exit.as_str(),
                processed = summary.processed,
                element_errors = summary.element_errors,
                forwarded_errors = summary.forwarded_errors,
                "Stage exited"
            );
        }
        if summary.processed > 0 {
            emit!(ElementsProcessed {
                count: summary.processed,
                pipeline: self.ctx.pipeline.to_string(),
                stage: self.id.to_string(),
            });
        }
        emit!(StageExited {
            exit,
            pipeline: self.ctx.pipeline.to_string(),
            stage: self.id.to_string(),
        });
    }

    /// Main loop. `output` is dropped when this returns, closing the stream.
    async fn drive(
        &self,
        mut inlet: Inlet<In>,
        output: StreamSender<Out>,
        summary: &mut StageSummary,
    ) -> StageExit {
        let signal = &self.ctx.signal;

        loop {
            let envelope = match inlet.recv(signal).await {
                Received::Item(envelope) => envelope,
                Received::Closed => {
                    self.ctx.input_exhausted();
                    return StageExit::Exhausted;
                }
                Received::Cancelled => return StageExit::Cancelled,
            };

            let value = match envelope.into_result() {
                Ok(value) => value,
                Err(upstream) => {
                    summary.forwarded_errors += 1;
                    let delivery = output.send(Envelope::err(upstream), signal).await;
                    if let Some(exit) = StageExit::from_delivery(delivery) {
                        return exit;
                    }
                    continue;
                }
            };

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = signal.done() => return StageExit::Cancelled,
                result = AssertUnwindSafe(self.transform.apply(value)).catch_unwind() => result,
            };
            emit!(TransformCompleted {
                duration: started.elapsed(),
                pipeline: self.ctx.pipeline.to_string(),
                stage: self.id.to_string(),
            });

            let outgoing = match result {
                Ok(Ok(out)) => {
                    summary.processed += 1;
                    Envelope::ok(out)
                }
                Ok(Err(err)) => Envelope::err(StageError::from_transform(&self.id, err)),
                Err(payload) => Envelope::err(StageError::Panicked {
                    stage: self.id.clone(),
                    message: panic_message(payload.as_ref()),
                }),
            };

            let fatal = match outgoing.error() {
                Some(err) if err.is_fatal() => Some(err.clone()),
                Some(_) => {
                    summary.element_errors += 1;
                    emit!(ElementFailed {
                        pipeline: self.ctx.pipeline.to_string(),
                        stage: self.id.to_string(),
                    });
                    None
                }
                None => None,
            };

            let delivery = output.send(outgoing, signal).await;

            if let Some(err) = fatal {
                self.ctx.failures.record(&err);
                return StageExit::Failed;
            }
            if let Some(exit) = StageExit::from_delivery(delivery) {
                return exit;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
