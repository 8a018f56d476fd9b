//! rill: cancellable concurrent pipelines over tokio.
//!
//! Stages run as independent tasks connected by streams of [`Envelope`]s.
//! Every blocking point (reading input, writing output, running the
//! transform) races a shared [`Signal`], so cancelling a pipeline or hitting
//! its deadline stops every task promptly and closes every stream.
//!
//! - [`Signal`]: one-shot broadcast cancellation.
//! - [`Combinator`]: derived signals that fire when any input fires, and
//!   deadlines.
//! - [`Stage`]: one task applying a [`Transform`] to each element.
//! - [`fan_out`] / [`fan_in`]: parallel workers over one input, and merging.
//! - [`Pipeline`]: an ordered, typed composition of stages with a lifecycle.
//!
//! Per-element errors travel in-band as error envelopes. Fatal stage errors
//! and panics end the stage and are recorded in the pipeline; with
//! [`ErrorMode::FailFast`] they also cancel it.
//!
//! # Example
//!
//! ```ignore
//! use rill::{Pipeline, Stage, map, try_map};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rill::error::PipelineError> {
//!     rill::logging::init_tracing();
//!
//!     let pipeline = Pipeline::builder::<&str>("parse")
//!         .stage(Stage::new("parse", try_map(|s: &str| s.parse::<i64>())))
//!         .fan_out(Stage::new("square", map(|x: i64| x * x)), 4)
//!         .build()?;
//!
//!     let out = pipeline.start_from_iter(vec!["1", "2", "x"])?;
//!     for envelope in out.collect_all().await {
//!         println!("{:?}", envelope.into_result());
//!     }
//!     pipeline.wait().await;
//!     Ok(())
//! }
//! ```

pub mod combinator;
pub mod config;
pub mod envelope;
pub mod error;
pub mod failure;
pub mod fanout;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod signal;
pub mod stage;
pub mod stream;
pub mod transform;

pub use combinator::{Combinator, MAX_FAN_IN, or};
pub use config::{PipelineConfig, StageConfig};
pub use envelope::{Envelope, partition};
pub use error::{ConfigError, PipelineError, StageError, TransformError};
pub use failure::ErrorMode;
pub use fanout::{fan_in, fan_out};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineState};
pub use signal::{Signal, shutdown_signal};
pub use stage::{Stage, StageContext, StageExit};
pub use stream::{Capacity, Delivery, Received, SharedReceiver, StreamReceiver, StreamSender, channel, from_iter};
pub use transform::{Transform, from_fn, map, try_map};
