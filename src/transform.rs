//! Per-element transformation capability.
//!
//! A stage is generic over anything implementing [`Transform`]. Closures are
//! adapted through [`map`], [`try_map`] and [`from_fn`].

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::error::{BoxError, TransformError};

/// Transformation applied by a stage to each element.
///
/// `apply` may be called many times concurrently (fan-out workers share one
/// transform), so implementations must not rely on exclusive access. Any
/// await inside `apply` is a cancellation point: the stage drops the future
/// when its signal fires.
#[async_trait]
pub trait Transform<In, Out>: Send + Sync {
    async fn apply(&self, input: In) -> Result<Out, TransformError>;
}

/// Infallible synchronous mapping.
pub struct Map<F> {
    f: F,
}

/// Wrap an infallible function as a transform.
pub fn map<F>(f: F) -> Map<F> {
    Map { f }
}

#[async_trait]
impl<In, Out, F> Transform<In, Out> for Map<F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Out + Send + Sync,
{
    async fn apply(&self, input: In) -> Result<Out, TransformError> {
        Ok((self.f)(input))
    }
}

/// Fallible synchronous mapping; errors are per-element.
pub struct TryMap<F, E> {
    f: F,
    _error: PhantomData<fn() -> E>,
}

/// Wrap a fallible function as a transform. Every `Err` becomes an element
/// error; use [`from_fn`] to report fatal errors.
pub fn try_map<F, E>(f: F) -> TryMap<F, E> {
    TryMap {
        f,
        _error: PhantomData,
    }
}

#[async_trait]
impl<In, Out, E, F> Transform<In, Out> for TryMap<F, E>
where
    In: Send + 'static,
    Out: Send + 'static,
    E: Into<BoxError>,
    F: Fn(In) -> Result<Out, E> + Send + Sync,
{
    async fn apply(&self, input: In) -> Result<Out, TransformError> {
        (self.f)(input).map_err(TransformError::element)
    }
}

/// Asynchronous transform built from a closure returning a future.
pub struct FromFn<F> {
    f: F,
}

/// Wrap an async closure as a transform.
pub fn from_fn<F>(f: F) -> FromFn<F> {
    FromFn { f }
}

#[async_trait]
impl<In, Out, F, Fut> Transform<In, Out> for FromFn<F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Out, TransformError>> + Send,
{
    async fn apply(&self, input: In) -> Result<Out, TransformError> {
        (self.f)(input).await
    }
}
