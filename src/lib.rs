//! Composable, channel-based stream processors.
//!
//! Every processor implements [`Processor`](processor::Processor): it owns its input
//! receiver, spawns one or more Tokio tasks, and returns a freshly created output
//! receiver that closes when the input is drained or the [`CancellationToken`] fires.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod async_mapper;
pub mod batcher;
pub mod buffer;
pub mod circuit_breaker;
pub mod clock;
pub mod debounce;
pub mod dedupe;
pub mod error;
pub mod fan_in;
pub mod fan_out;
pub mod metadata;
pub mod monitor;
pub mod multi_stream;
pub mod processor;
pub mod result;
pub mod retry;
pub mod sample;
pub mod throttle;
pub mod transforms;
pub mod window;

pub use error::ErrorStrategy;
pub use processor::Processor;
pub use result::{map_result, Res, StreamError};

/// Installs a `tracing` subscriber writing to stderr, filtered by
/// `RUST_LOG`. Safe to call from multiple tests; only the first call wins.
#[cfg(test)]
pub(crate) fn setup_test_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}
