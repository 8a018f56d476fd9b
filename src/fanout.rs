//! Parallel workers over one stage, and merging streams back together.
//!
//! [`fan_out`] runs N copies of a stage that compete for elements from one
//! shared input; each element is handled by exactly one worker. [`fan_in`]
//! merges any number of streams into one that closes after all of its inputs
//! have closed. No ordering is kept across inputs.

use tracing::{Instrument, debug, info_span};

use crate::error::PipelineError;
use crate::signal::Signal;
use crate::stage::{Inlet, Stage, StageContext};
use crate::stream::{Capacity, Delivery, Received, StreamReceiver, StreamSender, channel};

/// Run `workers` copies of `stage`, all reading from `input`.
///
/// Returns one output stream per worker. Fails without spawning anything if
/// `workers` is zero.
pub fn fan_out<In, Out>(
    ctx: &StageContext,
    input: StreamReceiver<In>,
    workers: usize,
    stage: &Stage<In, Out>,
) -> Result<Vec<StreamReceiver<Out>>, PipelineError>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let capacity = stage.capacity().unwrap_or_default();
    spawn_workers(ctx, input, workers, stage, capacity)
}

pub(crate) fn spawn_workers<In, Out>(
    ctx: &StageContext,
    input: StreamReceiver<In>,
    workers: usize,
    stage: &Stage<In, Out>,
    capacity: Capacity,
) -> Result<Vec<StreamReceiver<Out>>, PipelineError>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    if workers == 0 {
        return Err(PipelineError::InvalidWorkerCount {
            stage: stage.id().to_string(),
            count: workers,
        });
    }

    let shared = input.into_shared();
    let outputs = (0..workers)
        .map(|n| stage.launch(ctx, Inlet::Shared(shared.clone()), capacity, Some(n)))
        .collect();

    debug!(pipeline = ctx.pipeline(), stage = stage.id(), workers, "Fanned out stage");
    Ok(outputs)
}

/// Merge `inputs` into a single stream.
///
/// One forwarder task per input runs in `ctx`. The merged stream closes once
/// every input has closed, or once the context's signal fires.
pub fn fan_in<T>(
    ctx: &StageContext,
    inputs: Vec<StreamReceiver<T>>,
    capacity: Capacity,
) -> StreamReceiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = channel(capacity);
    let inputs_count = inputs.len();

    for (n, input) in inputs.into_iter().enumerate() {
        let span = info_span!("fan_in", pipeline = ctx.pipeline(), input = n);
        let forwarder = forward(input, tx.clone(), ctx.signal().clone());
        ctx.tracker().spawn(forwarder.instrument(span));
    }

    debug!(pipeline = ctx.pipeline(), inputs = inputs_count, "Merging streams");
    rx
}

/// Copy envelopes from `input` to `output` until either side ends.
async fn forward<T>(mut input: StreamReceiver<T>, output: StreamSender<T>, signal: Signal) {
    let mut forwarded = 0u64;
    while let Received::Item(envelope) = input.recv(&signal).await {
        if output.send(envelope, &signal).await != Delivery::Delivered {
            break;
        }
        forwarded += 1;
    }
    debug!(forwarded, "Forwarder exited");
}

/// Fan out, then merge the worker outputs. Used by the pipeline builder.
pub(crate) fn fan_out_merged<In, Out>(
    ctx: &StageContext,
    input: StreamReceiver<In>,
    workers: usize,
    stage: &Stage<In, Out>,
    capacity: Capacity,
) -> Result<StreamReceiver<Out>, PipelineError>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let mut outputs = spawn_workers(ctx, input, workers, stage, capacity)?;
    match outputs.len() {
        1 => Ok(outputs.remove(0)),
        _ => Ok(fan_in(ctx, outputs, capacity)),
    }
}
