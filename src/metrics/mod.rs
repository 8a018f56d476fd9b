//! Metrics emission for pipeline internals.
//!
//! Events go through the `metrics` facade. The library installs no recorder;
//! applications that want Prometheus (or anything else) install their own
//! before building pipelines. Without a recorder every emission is a no-op.

pub mod events;

/// Macro for emitting metric events.
///
/// Calls [`events::InternalEvent::emit`] on the given event.
///
/// # Example
///
/// ```ignore
/// use rill::metrics::events::ElementsProcessed;
///
/// emit!(ElementsProcessed { count: 1, pipeline: "orders".into(), stage: "parse".into() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
