//! The processor contract (§4.1) and the channel-ownership helpers every
//! processor in this crate is built on top of.
//!
//! Grounded on the teacher's actor-task shape (`p2panda-net`'s
//! `TopicStreamSender`/`TopicStreamReceiver`): a task owns the channels it
//! was handed, and every blocking operation races against cancellation
//! with `tokio::select!`.

use std::panic::AssertUnwindSafe;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::result::Res;

/// Adapts a processor's output channel into a [`Stream`], for callers that
/// want to fold it into a larger `futures`/`tokio-stream` pipeline instead
/// of draining it with `recv()` directly.
pub fn as_stream<T>(rx: mpsc::Receiver<Res<T>>) -> impl Stream<Item = Res<T>> {
    ReceiverStream::new(rx)
}

/// The error value a panicking predicate/mapping function is converted
/// into, per the panic-recovery contract (§4.2): user code never takes a
/// worker task down with it.
#[derive(Debug, Error)]
#[error("panicked: {0}")]
pub struct PanicError(pub String);

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `f`, catching a panic and converting it into a [`PanicError`]
/// instead of unwinding the calling task. Used by every processor that
/// invokes a user-supplied predicate or mapping function.
pub fn invoke_guarded<R>(f: impl FnOnce() -> R) -> Result<R, PanicError> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| PanicError(panic_message(payload)))
}

/// Default bounded channel capacity used by processors that don't expose
/// their own buffering knob. Matches neither backpressure extreme: large
/// enough that a burst doesn't immediately stall the producer, small
/// enough that an unbounded channel doesn't hide a stuck consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A processor transforms a sequence of `Res<In>` into a sequence of
/// `Res<Out>`. `process` spawns whatever Tokio tasks it needs and returns
/// immediately with the output receiver; the processor must never close
/// `input`, and must close every sender it owns (by dropping it) once
/// `input` is exhausted or `ctx` is cancelled.
pub trait Processor<In, Out>: Send + 'static
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Human-readable name used in error provenance (`StreamError::processor`).
    fn name(&self) -> &str;

    fn process(
        self,
        ctx: CancellationToken,
        input: mpsc::Receiver<Res<In>>,
    ) -> mpsc::Receiver<Res<Out>>;
}

/// Sends `item` on `tx`, yielding control to cancellation. Returns `false`
/// if the send lost the race to cancellation or the receiver was dropped —
/// in both cases the caller should stop producing.
pub async fn send_or_cancel<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    ctx: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => false,
        res = tx.send(item) => res.is_ok(),
    }
}

/// Receives the next item from `rx`, yielding control to cancellation.
/// Returns `None` both when the channel is drained and when cancellation
/// won the race — callers treat both as "stop".
pub async fn recv_or_cancel<T>(
    rx: &mut mpsc::Receiver<T>,
    ctx: &CancellationToken,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => None,
        item = rx.recv() => item,
    }
}
