//! Channels of envelopes between stages.
//!
//! Every blocking operation here takes a [`Signal`] and races it, so a task
//! parked on a full or empty stream always wakes up when cancellation fires.
//!
//! Three capacities are supported:
//! - [`Capacity::Rendezvous`]: a send completes only after the receiver has
//!   taken the element (buffer size 0).
//! - [`Capacity::Bounded`]: up to N elements of lookahead.
//! - [`Capacity::Unbounded`]: sends never wait.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{Mutex, mpsc};
use tokio_util::task::TaskTracker;

use crate::envelope::Envelope;
use crate::signal::Signal;

/// Buffering of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Capacity {
    /// Synchronous handoff.
    #[default]
    Rendezvous,
    /// Bounded lookahead of N elements. `Bounded(0)` is a rendezvous.
    Bounded(usize),
    /// No limit on buffered elements.
    Unbounded,
}

impl Capacity {
    /// Interpret a buffer size hint: 0 means rendezvous, N means bounded.
    pub fn from_hint(buffer: usize) -> Self {
        match buffer {
            0 => Self::Rendezvous,
            n => Self::Bounded(n),
        }
    }
}

/// Outcome of a cancellable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The element was handed to the stream.
    Delivered,
    /// The signal fired before the send completed.
    ///
    /// On a rendezvous stream the element may already be queued when the
    /// signal fires during the handoff wait; the receiver can still read it.
    Cancelled,
    /// The receiving side is gone.
    Disconnected,
}

/// Outcome of a cancellable receive.
#[derive(Debug)]
pub enum Received<T> {
    Item(Envelope<T>),
    /// The producer closed the stream.
    Closed,
    /// The signal fired before an element arrived.
    Cancelled,
}

/// Create a stream with the given capacity.
pub fn channel<T>(capacity: Capacity) -> (StreamSender<T>, StreamReceiver<T>) {
    match capacity {
        Capacity::Rendezvous | Capacity::Bounded(0) => {
            let (tx, rx) = mpsc::channel(1);
            (
                StreamSender {
                    inner: SenderInner::Bounded {
                        tx,
                        rendezvous: true,
                    },
                },
                StreamReceiver {
                    inner: ReceiverInner::Bounded(rx),
                },
            )
        }
        Capacity::Bounded(n) => {
            let (tx, rx) = mpsc::channel(n);
            (
                StreamSender {
                    inner: SenderInner::Bounded {
                        tx,
                        rendezvous: false,
                    },
                },
                StreamReceiver {
                    inner: ReceiverInner::Bounded(rx),
                },
            )
        }
        Capacity::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                StreamSender {
                    inner: SenderInner::Unbounded(tx),
                },
                StreamReceiver {
                    inner: ReceiverInner::Unbounded(rx),
                },
            )
        }
    }
}

enum SenderInner<T> {
    Bounded {
        tx: mpsc::Sender<Envelope<T>>,
        rendezvous: bool,
    },
    Unbounded(mpsc::UnboundedSender<Envelope<T>>),
}

/// Producing half of a stream. Dropping the last sender closes the stream.
pub struct StreamSender<T> {
    inner: SenderInner<T>,
}

impl<T> Clone for StreamSender<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            SenderInner::Bounded { tx, rendezvous } => SenderInner::Bounded {
                tx: tx.clone(),
                rendezvous: *rendezvous,
            },
            SenderInner::Unbounded(tx) => SenderInner::Unbounded(tx.clone()),
        };
        Self { inner }
    }
}

impl<T> StreamSender<T> {
    /// Send an envelope, giving up if `signal` closes first.
    pub async fn send(&self, envelope: Envelope<T>, signal: &Signal) -> Delivery {
        match &self.inner {
            SenderInner::Unbounded(tx) => {
                if signal.is_closed() {
                    return Delivery::Cancelled;
                }
                match tx.send(envelope) {
                    Ok(()) => Delivery::Delivered,
                    Err(_) => Delivery::Disconnected,
                }
            }
            SenderInner::Bounded { tx, rendezvous } => {
                let permit = tokio::select! {
                    biased;
                    _ = signal.done() => return Delivery::Cancelled,
                    permit = tx.reserve() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Delivery::Disconnected,
                    },
                };
                permit.send(envelope);

                if !rendezvous {
                    return Delivery::Delivered;
                }

                // The slot frees up once the receiver has taken the element.
                // Cancellation here leaves the element queued.
                tokio::select! {
                    biased;
                    _ = signal.done() => Delivery::Cancelled,
                    handoff = tx.reserve() => match handoff {
                        Ok(_) => Delivery::Delivered,
                        Err(_) => Delivery::Disconnected,
                    },
                }
            }
        }
    }

    /// Whether the receiving side has been dropped or closed.
    pub fn is_closed(&self) -> bool {
        match &self.inner {
            SenderInner::Bounded { tx, .. } => tx.is_closed(),
            SenderInner::Unbounded(tx) => tx.is_closed(),
        }
    }
}

#[derive(Debug)]
enum ReceiverInner<T> {
    Bounded(mpsc::Receiver<Envelope<T>>),
    Unbounded(mpsc::UnboundedReceiver<Envelope<T>>),
}

/// Consuming half of a stream.
///
/// Also implements [`futures::Stream`] for callers that want combinators;
/// that path does not observe any signal and ends when the producer closes.
#[derive(Debug)]
pub struct StreamReceiver<T> {
    inner: ReceiverInner<T>,
}

impl<T> StreamReceiver<T> {
    /// Receive the next envelope, giving up if `signal` closes first.
    pub async fn recv(&mut self, signal: &Signal) -> Received<T> {
        tokio::select! {
            biased;
            _ = signal.done() => Received::Cancelled,
            item = self.next_envelope() => match item {
                Some(envelope) => Received::Item(envelope),
                None => Received::Closed,
            },
        }
    }

    async fn next_envelope(&mut self) -> Option<Envelope<T>> {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.recv().await,
            ReceiverInner::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Stop accepting new elements; already buffered ones can still be read.
    pub fn close(&mut self) {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.close(),
            ReceiverInner::Unbounded(rx) => rx.close(),
        }
    }

    /// Read every envelope until the stream closes or `signal` fires.
    pub async fn collect_until(mut self, signal: &Signal) -> Vec<Envelope<T>> {
        let mut out = Vec::new();
        while let Received::Item(envelope) = self.recv(signal).await {
            out.push(envelope);
        }
        out
    }

    /// Read every envelope until the producer closes the stream.
    ///
    /// Stages close their output when cancelled, so this terminates for any
    /// pipeline output once the pipeline stops.
    pub async fn collect_all(mut self) -> Vec<Envelope<T>> {
        let mut out = Vec::new();
        while let Some(envelope) = self.next_envelope().await {
            out.push(envelope);
        }
        out
    }

    /// Turn this receiver into one that several workers can share.
    pub fn into_shared(self) -> SharedReceiver<T> {
        SharedReceiver {
            inner: Arc::new(Mutex::new(self)),
        }
    }
}

// No field is structurally pinned.
impl<T> Unpin for StreamReceiver<T> {}

impl<T> futures::Stream for StreamReceiver<T> {
    type Item = Envelope<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().inner {
            ReceiverInner::Bounded(rx) => rx.poll_recv(cx),
            ReceiverInner::Unbounded(rx) => rx.poll_recv(cx),
        }
    }
}

/// A receiver read by several competing workers.
///
/// Each element goes to exactly one reader.
pub struct SharedReceiver<T> {
    inner: Arc<Mutex<StreamReceiver<T>>>,
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> SharedReceiver<T> {
    /// Receive the next envelope, racing both the lock and the read
    /// against `signal`.
    pub async fn recv(&self, signal: &Signal) -> Received<T> {
        let mut guard = tokio::select! {
            biased;
            _ = signal.done() => return Received::Cancelled,
            guard = self.inner.lock() => guard,
        };
        guard.recv(signal).await
    }
}

/// Feed `items` into a new stream from a background task.
///
/// The feeder stops early if `signal` closes or the receiver is dropped.
pub fn from_iter<I>(signal: &Signal, items: I, capacity: Capacity) -> StreamReceiver<I::Item>
where
    I: IntoIterator + Send + 'static,
    I::IntoIter: Send,
    I::Item: Send + 'static,
{
    spawn_feeder(&TaskTracker::new(), signal, items, capacity)
}

pub(crate) fn spawn_feeder<I>(
    tracker: &TaskTracker,
    signal: &Signal,
    items: I,
    capacity: Capacity,
) -> StreamReceiver<I::Item>
where
    I: IntoIterator + Send + 'static,
    I::IntoIter: Send,
    I::Item: Send + 'static,
{
    let (tx, rx) = channel(capacity);
    let signal = signal.clone();
    tracker.spawn(async move {
        for item in items {
            if tx.send(Envelope::ok(item), &signal).await != Delivery::Delivered {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn values<T: Clone>(envelopes: &[Envelope<T>]) -> Vec<T> {
        envelopes.iter().filter_map(|e| e.value().cloned()).collect()
    }

    #[test]
    fn test_capacity_from_hint() {
        assert_eq!(Capacity::from_hint(0), Capacity::Rendezvous);
        assert_eq!(Capacity::from_hint(8), Capacity::Bounded(8));
    }

    #[tokio::test]
    async fn test_order_preserved() {
        let signal = Signal::new();
        for capacity in [Capacity::Rendezvous, Capacity::Bounded(2), Capacity::Unbounded] {
            let rx = from_iter(&signal, 0..50, capacity);
            let out = rx.collect_all().await;
            assert_eq!(values(&out), (0..50).collect::<Vec<_>>(), "{capacity:?}");
        }
    }

    #[tokio::test]
    async fn test_recv_observes_cancellation() {
        let signal = Signal::new();
        let (_tx, mut rx) = channel::<i32>(Capacity::Bounded(4));

        signal.close();
        assert!(matches!(rx.recv(&signal).await, Received::Cancelled));
    }

    #[tokio::test]
    async fn test_recv_sees_close_after_sender_drop() {
        let signal = Signal::new();
        let (tx, mut rx) = channel::<i32>(Capacity::Bounded(4));

        assert_eq!(tx.send(Envelope::ok(1), &signal).await, Delivery::Delivered);
        drop(tx);

        assert!(matches!(rx.recv(&signal).await, Received::Item(_)));
        assert!(matches!(rx.recv(&signal).await, Received::Closed));
    }

    #[tokio::test]
    async fn test_blocked_sender_unblocks_on_cancel() {
        let signal = Signal::new();
        let (tx, _rx) = channel::<i32>(Capacity::Bounded(1));

        assert_eq!(tx.send(Envelope::ok(1), &signal).await, Delivery::Delivered);

        let sender_signal = signal.clone();
        let blocked = tokio::spawn(async move { tx.send(Envelope::ok(2), &sender_signal).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished(), "send into a full stream should wait");

        signal.close();
        let outcome = tokio::time::timeout(Duration::from_millis(100), blocked)
            .await
            .expect("blocked sender should wake on cancel")
            .unwrap();
        assert_eq!(outcome, Delivery::Cancelled);
    }

    #[tokio::test]
    async fn test_rendezvous_waits_for_receiver() {
        let signal = Signal::new();
        let (tx, mut rx) = channel::<i32>(Capacity::Rendezvous);

        let sender_signal = signal.clone();
        let sender = tokio::spawn(async move { tx.send(Envelope::ok(7), &sender_signal).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished(), "rendezvous send completes only on receive");

        match rx.recv(&signal).await {
            Received::Item(envelope) => assert_eq!(envelope.into_value(), Some(7)),
            other => panic!("unexpected {other:?}"),
        }

        let outcome = tokio::time::timeout(Duration::from_millis(100), sender)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Delivery::Delivered);
    }

    #[tokio::test]
    async fn test_bounded_zero_is_rendezvous() {
        let signal = Signal::new();
        let (tx, mut rx) = channel::<i32>(Capacity::Bounded(0));

        let sender_signal = signal.clone();
        let sender = tokio::spawn(async move { tx.send(Envelope::ok(1), &sender_signal).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished(), "a zero buffer has no lookahead");

        assert!(matches!(rx.recv(&signal).await, Received::Item(_)));
        let outcome = tokio::time::timeout(Duration::from_millis(100), sender)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Delivery::Delivered);
    }

    #[tokio::test]
    async fn test_rendezvous_cancel_during_handoff_leaves_element_queued() {
        let signal = Signal::new();
        let (tx, mut rx) = channel::<i32>(Capacity::Rendezvous);

        let sender_signal = signal.clone();
        let sender = tokio::spawn(async move { tx.send(Envelope::ok(7), &sender_signal).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.close();
        let outcome = tokio::time::timeout(Duration::from_millis(100), sender)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Delivery::Cancelled);

        let reader = Signal::new();
        match rx.recv(&reader).await {
            Received::Item(envelope) => assert_eq!(envelope.into_value(), Some(7)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv(&reader).await, Received::Closed));
    }

    #[tokio::test]
    async fn test_close_keeps_buffered_elements() {
        let signal = Signal::new();
        let (tx, mut rx) = channel::<i32>(Capacity::Bounded(4));

        assert_eq!(tx.send(Envelope::ok(1), &signal).await, Delivery::Delivered);
        rx.close();

        assert_eq!(tx.send(Envelope::ok(2), &signal).await, Delivery::Disconnected);
        assert!(tx.is_closed());
        match rx.recv(&signal).await {
            Received::Item(envelope) => assert_eq!(envelope.into_value(), Some(1)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv(&signal).await, Received::Closed));
    }

    #[tokio::test]
    async fn test_collect_until_stops_on_signal() {
        let feed = Signal::new();
        let stop = Signal::new();
        let (tx, rx) = channel::<i32>(Capacity::Unbounded);

        for n in [1, 2, 3] {
            assert_eq!(tx.send(Envelope::ok(n), &feed).await, Delivery::Delivered);
        }

        let closer = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        // The sender stays alive, so only the signal ends the read.
        let out = tokio::time::timeout(Duration::from_millis(500), rx.collect_until(&stop))
            .await
            .expect("collect_until should return once the signal closes");
        assert_eq!(values(&out), vec![1, 2, 3]);
        drop(tx);
    }

    #[tokio::test]
    async fn test_send_to_dropped_receiver() {
        let signal = Signal::new();
        let (tx, rx) = channel::<i32>(Capacity::Unbounded);
        drop(rx);

        assert_eq!(tx.send(Envelope::ok(1), &signal).await, Delivery::Disconnected);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_shared_receiver_delivers_each_item_once() {
        let signal = Signal::new();
        let shared = from_iter(&signal, 0..200, Capacity::Bounded(8)).into_shared();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                let signal = signal.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Received::Item(envelope) = shared.recv(&signal).await {
                        seen.extend(envelope.into_value());
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for reader in readers {
            all.extend(reader.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_futures_stream_impl() {
        let signal = Signal::new();
        let rx = from_iter(&signal, vec!["a", "b", "c"], Capacity::Bounded(2));

        let collected: Vec<_> = rx.filter_map(|e| async move { e.into_value() }).collect().await;
        assert_eq!(collected, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_feeder_stops_on_cancel() {
        let signal = Signal::new();
        let tracker = TaskTracker::new();
        let rx = spawn_feeder(&tracker, &signal, 0.., Capacity::Bounded(1));

        signal.close();
        tracker.close();
        tokio::time::timeout(Duration::from_millis(200), tracker.wait())
            .await
            .expect("feeder should exit once the signal closes");
        drop(rx);
    }
}
