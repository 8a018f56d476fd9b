//! Or-combinator for signals.
//!
//! [`Combinator::any`] merges several [`Signal`]s into one derived signal
//! that closes as soon as any input closes. Every combinator is bound to an
//! owner signal: when the owner closes, all listener tasks spawned through
//! that combinator exit. Callers must close the owner once the combined
//! signal is no longer needed, otherwise listeners stay parked until one of
//! the inputs fires.
//!
//! Owner teardown applies to derived signals only. With zero inputs
//! [`Combinator::any`] returns a standalone signal that the owner never
//! closes, and with one input it returns that input unchanged.
//!
//! Internally each node listens on at most [`MAX_FAN_IN`] inputs plus one
//! combined child, so no single select point grows with the number of
//! inputs.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::future::select_all;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::signal::Signal;

/// Maximum number of input signals watched directly by one listener node.
pub const MAX_FAN_IN: usize = 3;

type DoneFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Builds derived signals whose listeners are owned by an outer signal.
#[derive(Clone, Debug)]
pub struct Combinator {
    owner: Signal,
    listeners: TaskTracker,
}

impl Combinator {
    /// Create a combinator whose listeners are torn down when `owner` closes.
    pub fn new(owner: &Signal) -> Self {
        Self {
            owner: owner.clone(),
            listeners: TaskTracker::new(),
        }
    }

    /// The signal that owns every listener spawned by this combinator.
    pub fn owner(&self) -> &Signal {
        &self.owner
    }

    /// Combine `signals` into one that closes when any of them closes.
    ///
    /// With no inputs the result is a fresh signal that is not tied to the
    /// owner: nothing closes it except an explicit `close()`. A single input is
    /// returned as-is, so its closing stays with the original producer. Only
    /// two or more inputs spawn listeners, and those outputs also close when
    /// the owner closes.
    pub fn any(&self, signals: &[Signal]) -> Signal {
        match signals {
            [] => Signal::new(),
            [only] => only.clone(),
            _ => self.spawn_chain(signals),
        }
    }

    /// Signal that closes by itself once `after` has elapsed.
    pub fn deadline(&self, after: Duration) -> Signal {
        let deadline = Signal::new();
        let owner = self.owner.clone();
        let expired = deadline.clone();

        self.listeners.spawn(async move {
            tokio::select! {
                _ = owner.done() => {}
                _ = expired.done() => {}
                _ = tokio::time::sleep(after) => {
                    debug!(deadline_ms = after.as_millis() as u64, "Deadline elapsed");
                }
            }
            expired.close();
        });

        deadline
    }

    /// Combine `signal` with a deadline of `after`.
    pub fn with_deadline(&self, signal: &Signal, after: Duration) -> Signal {
        self.any(&[signal.clone(), self.deadline(after)])
    }

    /// Number of listener tasks still running.
    pub fn live_listeners(&self) -> usize {
        self.listeners.len()
    }

    /// Wait for every listener spawned so far to exit.
    ///
    /// Listeners exit once an input fires or the owner closes.
    pub async fn wait(&self) {
        self.listeners.close();
        self.listeners.wait().await;
    }

    /// Lay out a chain of listener nodes. The head watches up to
    /// [`MAX_FAN_IN`] inputs; every later node watches up to
    /// `MAX_FAN_IN - 1` inputs plus its parent's output, and each parent
    /// watches its child's output. Nodes are spawned in a loop so deep
    /// chains never recurse.
    fn spawn_chain(&self, signals: &[Signal]) -> Signal {
        let (head, mut rest) = signals.split_at(signals.len().min(MAX_FAN_IN));
        let mut chunks = vec![head];
        while !rest.is_empty() {
            let (chunk, tail) = rest.split_at(rest.len().min(MAX_FAN_IN - 1));
            chunks.push(chunk);
            rest = tail;
        }

        let outputs: Vec<Signal> = chunks.iter().map(|_| Signal::new()).collect();
        trace!(
            inputs = signals.len(),
            nodes = chunks.len(),
            "Spawning or-signal listeners"
        );

        for (level, chunk) in chunks.iter().enumerate() {
            let mut watched = chunk.to_vec();
            if level > 0 {
                watched.push(outputs[level - 1].clone());
            }
            let child = outputs.get(level + 1).cloned();
            self.spawn_listener(watched, child, outputs[level].clone());
        }

        outputs[0].clone()
    }

    fn spawn_listener(&self, watched: Vec<Signal>, child: Option<Signal>, output: Signal) {
        let owner = self.owner.clone();
        self.listeners.spawn(async move {
            let inputs: Vec<DoneFuture> = watched
                .iter()
                .map(|s| Box::pin(s.done_owned()) as DoneFuture)
                .collect();
            let child_done = async {
                match &child {
                    Some(child) => child.done().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = owner.done() => {}
                _ = select_all(inputs) => {}
                _ = child_done => {}
            }
            output.close();
        });
    }
}

/// Shorthand for `Combinator::new(owner).any(signals)`.
pub fn or(owner: &Signal, signals: &[Signal]) -> Signal {
    Combinator::new(owner).any(signals)
}
