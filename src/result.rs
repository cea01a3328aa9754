//! The `Res<T>` envelope: a success value or a typed failure, plus opaque metadata.
//!
//! Grounded on the teacher's `Operation<E>` / `IngestError<E>` split in
//! `p2panda-engine` (a fallible item carries its original input alongside the
//! error, and a `Stream` of `Result<Operation<E>, IngestError<E>>` is the
//! uniform type every combinator in that crate is written against).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::metadata::Metadata;

/// The failure arm of [`Res<T>`].
///
/// Compared by identity, not content: two `StreamError`s built from equal
/// values are not considered equal just because their payloads match.
pub struct StreamError<T> {
    /// The value that was being processed when the failure occurred, if one
    /// was available. `None` when the item itself was already an error.
    pub value: Option<T>,
    /// The underlying error, boxed so processors need not agree on a single
    /// concrete error type.
    pub source: Arc<dyn std::error::Error + Send + Sync>,
    /// Name of the processor that raised this failure.
    pub processor: String,
    /// Time the failure was recorded.
    pub at: SystemTime,
    /// Processors traversed since the failure was raised, oldest first.
    pub chain: Vec<String>,
}

impl<T> StreamError<T> {
    pub fn new(
        value: Option<T>,
        source: impl std::error::Error + Send + Sync + 'static,
        processor: impl Into<String>,
    ) -> Self {
        let processor = processor.into();
        Self {
            value,
            source: Arc::new(source),
            chain: vec![processor.clone()],
            processor,
            at: SystemTime::now(),
        }
    }

    /// Returns a new `StreamError` with `processor` appended to the chain.
    ///
    /// Never mutates `self` in place: other clones of the same `Res` may be
    /// held downstream (e.g. by a `FanOut`) and must not observe the chain
    /// growing out from under them.
    pub fn chain_push(&self, processor: impl Into<String>) -> Self
    where
        T: Clone,
    {
        let mut chain = self.chain.clone();
        chain.push(processor.into());
        Self {
            value: self.value.clone(),
            source: self.source.clone(),
            processor: self.processor.clone(),
            at: self.at,
            chain,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for StreamError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamError")
            .field("value", &self.value)
            .field("source", &self.source.to_string())
            .field("processor", &self.processor)
            .field("chain", &self.chain)
            .finish()
    }
}

impl<T> fmt::Display for StreamError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.processor, self.source)
    }
}

impl<T> std::error::Error for StreamError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl<T: Clone> Clone for StreamError<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            source: self.source.clone(),
            processor: self.processor.clone(),
            at: self.at,
            chain: self.chain.clone(),
        }
    }
}

enum Payload<T> {
    Success(T),
    Error(StreamError<T>),
}

/// An immutable envelope carrying either a success value or a [`StreamError<T>`],
/// plus an optional, copy-on-write metadata mapping.
pub struct Res<T> {
    payload: Payload<T>,
    meta: Option<Arc<HashMap<&'static str, Metadata>>>,
}

impl<T> Res<T> {
    pub fn success(value: T) -> Self {
        Self {
            payload: Payload::Success(value),
            meta: None,
        }
    }

    pub fn error(
        value: Option<T>,
        source: impl std::error::Error + Send + Sync + 'static,
        processor: impl Into<String>,
    ) -> Self {
        Self {
            payload: Payload::Error(StreamError::new(value, source, processor)),
            meta: None,
        }
    }

    pub fn from_error(err: StreamError<T>) -> Self {
        Self {
            payload: Payload::Error(err),
            meta: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.payload, Payload::Success(_))
    }

    pub fn is_error(&self) -> bool {
        !self.is_success()
    }

    /// Panics if this `Res` is an error. Mirrors the teacher's `.expect`-at-the-
    /// boundary style: call only after `is_success()` has been checked, or in
    /// tests where the invariant is part of the assertion.
    pub fn value(&self) -> &T {
        match &self.payload {
            Payload::Success(v) => v,
            Payload::Error(_) => panic!("Res::value called on an error result"),
        }
    }

    pub fn into_value(self) -> T {
        match self.payload {
            Payload::Success(v) => v,
            Payload::Error(_) => panic!("Res::into_value called on an error result"),
        }
    }

    pub fn error_ref(&self) -> &StreamError<T> {
        match &self.payload {
            Payload::Error(e) => e,
            Payload::Success(_) => panic!("Res::error_ref called on a success result"),
        }
    }

    pub fn into_error(self) -> StreamError<T> {
        match self.payload {
            Payload::Error(e) => e,
            Payload::Success(_) => panic!("Res::into_error called on a success result"),
        }
    }

    pub fn as_success(&self) -> Option<&T> {
        match &self.payload {
            Payload::Success(v) => Some(v),
            Payload::Error(_) => None,
        }
    }

    /// Recovers the original value regardless of which arm `self` is in:
    /// the success value, or the value an error carried (if any). Used by
    /// processors like [`crate::circuit_breaker::CircuitBreaker`] that need
    /// to preserve an original value across a transformation into a new
    /// `StreamError`.
    pub fn into_success_or_none(self) -> Option<T> {
        match self.payload {
            Payload::Success(v) => Some(v),
            Payload::Error(e) => e.value,
        }
    }

    /// Returns a new `Res` sharing this value/failure but with `key` set to
    /// `value` in the metadata map (copy-on-write: the previous map, if any,
    /// is cloned once and the old `Arc` is left untouched for other holders).
    pub fn with_metadata(mut self, key: &'static str, value: Metadata) -> Self {
        let mut map = match self.meta.take() {
            Some(arc) => (*arc).clone(),
            None => HashMap::new(),
        };
        map.insert(key, value);
        self.meta = Some(Arc::new(map));
        self
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Metadata> {
        self.meta.as_ref().and_then(|m| m.get(key))
    }

    /// Extends the processor-chain of an error result with `processor`, or
    /// is a no-op for a success result. Used by transforming processors to
    /// record their name on a failure that merely flows through them.
    pub fn chain_push(self, processor: impl Into<String>) -> Self
    where
        T: Clone,
    {
        match self.payload {
            Payload::Success(v) => Self {
                payload: Payload::Success(v),
                meta: self.meta,
            },
            Payload::Error(e) => Self {
                payload: Payload::Error(e.chain_push(processor)),
                meta: self.meta,
            },
        }
    }
}

impl<T: Default> Default for Res<T> {
    fn default() -> Self {
        Res::success(T::default())
    }
}

impl<T: Clone> Clone for Res<T> {
    fn clone(&self) -> Self {
        let payload = match &self.payload {
            Payload::Success(v) => Payload::Success(v.clone()),
            Payload::Error(e) => Payload::Error(e.clone()),
        };
        Self {
            payload,
            meta: self.meta.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Res<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Success(v) => f.debug_tuple("Res::Success").field(v).finish(),
            Payload::Error(e) => f.debug_tuple("Res::Error").field(e).finish(),
        }
    }
}

/// Extends an error's processor-chain in place, for callers holding a `Res<T>`
/// they know to be an error but whose `T` has no `Clone` bound to satisfy
/// [`Res::chain_push`]. Safe because a non-`Clone` `T` can never have been
/// shared via `Res::clone` in the first place — there is no other holder of
/// this value to observe the mutation.
///
/// Panics if `item` is a success result.
pub fn chain_push_owned<T>(item: Res<T>, processor: impl Into<String>) -> Res<T> {
    let mut err = item.into_error();
    err.chain.push(processor.into());
    Res::from_error(err)
}

/// Type-safe transformation of the success value while preserving the
/// failure branch and metadata — kept as a free function (not a method)
/// since the output type differs from the input type and Rust methods
/// cannot introduce a fresh generic parameter the way a free function can.
pub fn map_result<T, U>(r: Res<T>, f: impl FnOnce(T) -> U) -> Res<U>
where
    T: Clone,
{
    let meta = r.meta.clone();
    let payload = match r.payload {
        Payload::Success(v) => Payload::Success(f(v)),
        Payload::Error(e) => Payload::Error(StreamError {
            value: e.value.map(f),
            source: e.source,
            processor: e.processor,
            at: e.at,
            chain: e.chain,
        }),
    };
    Res { payload, meta }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn success_round_trips() {
        let r = Res::success(42);
        assert!(r.is_success());
        assert_eq!(*r.value(), 42);
    }

    #[test]
    fn error_carries_value_and_chain() {
        let r: Res<i32> = Res::error(Some(7), io::Error::other("boom"), "batcher");
        assert!(r.is_error());
        assert_eq!(r.error_ref().value, Some(7));
        assert_eq!(r.error_ref().chain, vec!["batcher".to_string()]);
    }

    #[test]
    fn chain_push_extends_without_mutating_original() {
        let r: Res<i32> = Res::error(Some(1), io::Error::other("x"), "batcher");
        let original_chain = r.error_ref().chain.clone();
        let extended = r.clone().chain_push("switch");
        assert_eq!(r.error_ref().chain, original_chain);
        assert_eq!(extended.error_ref().chain, vec!["batcher", "switch"]);
    }

    #[test]
    fn with_metadata_is_copy_on_write() {
        let base = Res::success(1).with_metadata(crate::metadata::ROUTE, Metadata::U64(3));
        let extended = base.clone().with_metadata(crate::metadata::PROCESSOR, Metadata::Str("x".into()));
        assert!(base.get_metadata(crate::metadata::PROCESSOR).is_none());
        assert!(extended.get_metadata(crate::metadata::ROUTE).is_some());
    }

    #[test]
    fn map_result_preserves_failure_branch() {
        let r: Res<i32> = Res::error(Some(5), io::Error::other("e"), "mapper");
        let mapped = map_result(r, |v| v.to_string());
        assert!(mapped.is_error());
        assert_eq!(mapped.error_ref().value, Some("5".to_string()));
    }
}
