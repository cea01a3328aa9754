//! Error strategies applied when a processor's user-supplied closure fails,
//! and the `thiserror`-derived configuration errors raised by constructors.
//!
//! Grounded on `p2panda-encryption`'s per-module error enums (e.g.
//! `crypto::rng::RngError`): a small `#[derive(Error)]` enum local to the
//! module, not one crate-wide catch-all.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::result::StreamError;

/// What a processor should do when its predicate or mapping function
/// fails. The default (used when a processor is built without calling
/// `with_error_strategy`) is [`ErrorStrategy::LogAndContinue`]: errors are
/// first-class values and must surface, never vanish silently.
#[derive(Clone)]
pub enum ErrorStrategy<T> {
    /// Drop the failing item without a trace. Use sparingly — the default
    /// exists precisely so this has to be opted into.
    DropSilently,
    /// Log at `warn` level and forward an error `Res<T>` downstream.
    LogAndContinue,
    /// Invoke a user callback for side effects (metrics, alerting) in
    /// addition to forwarding an error `Res<T>` downstream.
    InvokeHandler(Arc<dyn Fn(&StreamError<T>) + Send + Sync>),
    /// Route the error onto a dedicated channel instead of the processor's
    /// regular output. A full or closed channel falls back to
    /// `LogAndContinue` rather than blocking the processor's main loop.
    SendToErrorChannel(mpsc::Sender<StreamError<T>>),
}

impl<T> Default for ErrorStrategy<T> {
    fn default() -> Self {
        ErrorStrategy::LogAndContinue
    }
}

impl<T> ErrorStrategy<T> {
    /// Applies the strategy to a freshly raised error, returning `Some` if
    /// it should still be forwarded on the processor's regular output.
    pub async fn apply(&self, err: StreamError<T>) -> Option<StreamError<T>>
    where
        T: Clone,
    {
        match self {
            ErrorStrategy::DropSilently => None,
            ErrorStrategy::LogAndContinue => {
                warn!(processor = %err.processor, chain = ?err.chain, "processor error");
                Some(err)
            }
            ErrorStrategy::InvokeHandler(handler) => {
                handler(&err);
                Some(err)
            }
            ErrorStrategy::SendToErrorChannel(tx) => match tx.try_send(err) {
                Ok(()) => None,
                Err(mpsc::error::TrySendError::Full(err)) | Err(mpsc::error::TrySendError::Closed(err)) => {
                    warn!(processor = %err.processor, chain = ?err.chain, "error channel unavailable, falling back to log");
                    Some(err)
                }
            },
        }
    }
}

/// Raised by constructors when a processor is configured with an invalid
/// combination of parameters (programmer error — caught at construction,
/// not at runtime, per §7.6 of the design).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{processor}: at least one of `{a}` and `{b}` must be positive")]
    NeitherSet {
        processor: &'static str,
        a: &'static str,
        b: &'static str,
    },

    #[error("{processor}: `{field}` must be positive, got {value:?}")]
    NotPositive {
        processor: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("{processor}: `{field}` ({got}) must not be greater than `{other_field}` ({other})")]
    Exceeds {
        processor: &'static str,
        field: &'static str,
        got: String,
        other_field: &'static str,
        other: String,
    },
}
