//! FanOut — §4.14. Duplicates a single input into N outputs; every value
//! is delivered to every output. Backpressure is blocking per-output: a
//! slow consumer slows every consumer (use a [`crate::buffer`] downstream
//! for a dropping alternative).

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::processor::{recv_or_cancel, send_or_cancel, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// Duplicates `input` into `count` independent output channels. A free
/// function (not a `Processor` impl) since its output is N channels, not
/// one.
pub fn fan_out<T>(
    name: impl Into<String>,
    ctx: CancellationToken,
    count: usize,
    mut input: mpsc::Receiver<Res<T>>,
) -> Vec<mpsc::Receiver<Res<T>>>
where
    T: Clone + Send + 'static,
{
    let name = name.into();
    assert!(count > 0, "FanOut requires at least one output");

    let mut senders = Vec::with_capacity(count);
    let mut receivers = Vec::with_capacity(count);
    for _ in 0..count {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        senders.push(tx);
        receivers.push(rx);
    }

    tokio::spawn(async move {
        while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
            for tx in &senders {
                let value = item.clone();
                if !send_or_cancel(tx, value, &ctx).await {
                    tracing::trace!(processor = %name, "fan-out consumer closed, continuing others");
                }
            }
        }
    });

    receivers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_every_value_to_every_output() {
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut outputs = fan_out("fan-out", ctx, 3, input);

        tx.send(Res::success(7)).await.unwrap();
        drop(tx);

        for out in outputs.iter_mut() {
            assert_eq!(*out.recv().await.unwrap().value(), 7);
            assert!(out.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn one_closed_consumer_does_not_stop_the_others() {
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut outputs = fan_out("fan-out", ctx, 2, input);
        let mut second = outputs.pop().unwrap();
        let first = outputs.pop().unwrap();
        drop(first);

        tx.send(Res::success(1)).await.unwrap();
        drop(tx);

        assert_eq!(*second.recv().await.unwrap().value(), 1);
    }
}
