//! Pipeline lifecycle state machine.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::emit;
use crate::metrics::events::PipelineStateChanged;

/// Lifecycle of a [`Pipeline`](super::Pipeline).
///
/// ```text
/// Built -> Running -> Draining ---> Stopped
///                 \       |          ^
///                  \      v          |
///                   -> Cancelling ---
/// ```
///
/// `Running` may also go straight to `Stopped` when every stage exits
/// without the initial stream closing (for example, all consumers dropped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// Constructed, not started.
    Built,
    /// Stage tasks are running.
    Running,
    /// The initial stream is exhausted; stages are finishing in-flight work.
    Draining,
    /// The cancellation signal fired before every stage exited.
    Cancelling,
    /// Every stage task and auxiliary listener has exited.
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Built => "built",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Cancelling => "cancelling",
            PipelineState::Stopped => "stopped",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Built, Running)
                | (Running, Draining | Cancelling | Stopped)
                | (Draining, Cancelling | Stopped)
                | (Cancelling, Stopped)
        )
    }

    /// True once nothing is running any more.
    pub fn is_terminal(self) -> bool {
        self == PipelineState::Stopped
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable pipeline state. Illegal transitions are ignored.
#[derive(Clone)]
pub(crate) struct StateCell {
    tx: Arc<watch::Sender<PipelineState>>,
    pipeline: Arc<str>,
}

impl StateCell {
    pub fn new(pipeline: Arc<str>) -> Self {
        let (tx, _) = watch::channel(PipelineState::Built);
        Self {
            tx: Arc::new(tx),
            pipeline,
        }
    }

    pub fn get(&self) -> PipelineState {
        *self.tx.borrow()
    }

    /// Move to `next` if legal from the current state. Returns whether the
    /// state changed.
    pub fn transition(&self, next: PipelineState) -> bool {
        let mut from = None;
        let moved = self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        if let Some(from) = from {
            debug!(
                pipeline = %self.pipeline,
                from = from.as_str(),
                to = next.as_str(),
                "Pipeline state changed"
            );
            emit!(PipelineStateChanged {
                state: next,
                pipeline: self.pipeline.to_string(),
            });
        }
        moved
    }

    /// Resolve once the state satisfies `reached`.
    pub async fn wait_for(&self, reached: impl FnMut(&PipelineState) -> bool) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(reached).await;
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateCell").field(&self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_legal_transitions() {
        assert!(Built.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Running.can_transition_to(Cancelling));
        assert!(Draining.can_transition_to(Cancelling));
        assert!(Draining.can_transition_to(Stopped));
        assert!(Cancelling.can_transition_to(Stopped));

        assert!(!Built.can_transition_to(Stopped));
        assert!(!Cancelling.can_transition_to(Draining));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn test_cell_ignores_illegal_moves() {
        let cell = StateCell::new(Arc::from("p"));

        assert!(!cell.transition(Draining));
        assert_eq!(cell.get(), Built);

        assert!(cell.transition(Running));
        assert!(cell.transition(Cancelling));
        assert!(!cell.transition(Draining));
        assert!(cell.transition(Stopped));
        assert!(!cell.transition(Stopped), "stopped is entered once");
        assert!(cell.get().is_terminal());
    }

    #[tokio::test]
    async fn test_wait_for_stopped() {
        let cell = StateCell::new(Arc::from("p"));
        cell.transition(Running);

        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_for(|s| s.is_terminal()).await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        cell.transition(Stopped);
        waiter.await.unwrap();
    }

    #[test]
    fn test_display() {
        assert_eq!(Cancelling.to_string(), "cancelling");
    }
}
