//! Value-or-error wrapper carried through streams.

use crate::error::StageError;

/// One element of a stream: either a value or the error that replaced it.
///
/// Errors travel in-band with the data, so a consumer sees failures in the
/// same order as the successes around them. An error envelope does not end
/// the stream; the consumer decides whether to stop.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    inner: Result<T, StageError>,
}

impl<T> Envelope<T> {
    /// Wrap a successful value.
    pub fn ok(value: T) -> Self {
        Self { inner: Ok(value) }
    }

    /// Wrap an error. The envelope holds no value.
    pub fn err(error: StageError) -> Self {
        Self { inner: Err(error) }
    }

    pub fn is_ok(&self) -> bool {
        self.inner.is_ok()
    }

    pub fn is_err(&self) -> bool {
        self.inner.is_err()
    }

    /// The wrapped value, if this is a success envelope.
    pub fn value(&self) -> Option<&T> {
        self.inner.as_ref().ok()
    }

    /// The wrapped error, if this is an error envelope.
    pub fn error(&self) -> Option<&StageError> {
        self.inner.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, StageError> {
        self.inner
    }

    pub fn into_value(self) -> Option<T> {
        self.inner.ok()
    }

    /// Transform the value, passing errors through untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            inner: self.inner.map(f),
        }
    }

    pub fn as_result(&self) -> Result<&T, &StageError> {
        self.inner.as_ref()
    }
}

impl<T> From<Result<T, StageError>> for Envelope<T> {
    fn from(inner: Result<T, StageError>) -> Self {
        Self { inner }
    }
}

impl<T> From<Envelope<T>> for Result<T, StageError> {
    fn from(envelope: Envelope<T>) -> Self {
        envelope.inner
    }
}

/// Split envelopes into values and errors, keeping order within each.
pub fn partition<T>(envelopes: impl IntoIterator<Item = Envelope<T>>) -> (Vec<T>, Vec<StageError>) {
    let mut values = Vec::new();
    let mut errors = Vec::new();
    for envelope in envelopes {
        match envelope.inner {
            Ok(value) => values.push(value),
            Err(error) => errors.push(error),
        }
    }
    (values, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransformError;
    use std::sync::Arc;

    fn element_error(stage: &str) -> StageError {
        StageError::from_transform(&Arc::from(stage), TransformError::element("bad"))
    }

    #[test]
    fn test_ok_envelope() {
        let env = Envelope::ok(5);
        assert!(env.is_ok());
        assert_eq!(env.value(), Some(&5));
        assert!(env.error().is_none());
    }

    #[test]
    fn test_err_envelope_has_no_value() {
        let env: Envelope<i32> = Envelope::err(element_error("parse"));
        assert!(env.is_err());
        assert!(env.value().is_none());
        assert_eq!(env.error().map(StageError::stage), Some("parse"));
        assert!(env.into_value().is_none());
    }

    #[test]
    fn test_map_skips_errors() {
        let ok = Envelope::ok(2).map(|v| v * 10);
        assert_eq!(ok.into_value(), Some(20));

        let err: Envelope<i32> = Envelope::err(element_error("x"));
        let mapped = err.map(|v| v * 10);
        assert!(mapped.is_err());
    }

    #[test]
    fn test_as_result_borrows() {
        let ok = Envelope::ok("v".to_string());
        assert_eq!(ok.as_result().ok().map(String::as_str), Some("v"));
        assert!(ok.is_ok());

        let err: Envelope<String> = Envelope::err(element_error("load"));
        assert_eq!(err.as_result().map_err(StageError::stage).err(), Some("load"));
    }

    #[test]
    fn test_partition_preserves_order() {
        let envelopes = vec![
            Envelope::ok(1),
            Envelope::err(element_error("a")),
            Envelope::ok(2),
            Envelope::err(element_error("b")),
            Envelope::ok(3),
        ];

        let (values, errors) = partition(envelopes);
        assert_eq!(values, vec![1, 2, 3]);
        let stages: Vec<_> = errors.iter().map(StageError::stage).collect();
        assert_eq!(stages, vec!["a", "b"]);
    }
}
