//! FanIn — §4.13. Merges N input sequences into one output, reading all
//! inputs concurrently. No ordering guarantee across inputs; order within
//! each input is preserved in the merged output.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::processor::{recv_or_cancel, send_or_cancel, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// Merges `inputs` into a single channel. Unlike the other processors in
/// this crate, `FanIn` takes N receivers up front rather than one, so it
/// is a free function rather than a `Processor` impl.
pub fn fan_in<T>(
    name: impl Into<String>,
    ctx: CancellationToken,
    inputs: Vec<mpsc::Receiver<Res<T>>>,
) -> mpsc::Receiver<Res<T>>
where
    T: Send + 'static,
{
    let name = name.into();
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

    for (idx, mut input) in inputs.into_iter().enumerate() {
        let tx = tx.clone();
        let ctx = ctx.clone();
        let name = name.clone();
        tokio::spawn(async move {
            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                if !send_or_cancel(&tx, item, &ctx).await {
                    tracing::trace!(processor = %name, input = idx, "fan-in output closed");
                    return;
                }
            }
        });
    }

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_per_input_order_merging_all_inputs() {
        let (tx_a, rx_a) = mpsc::channel(16);
        let (tx_b, rx_b) = mpsc::channel(16);
        let ctx = CancellationToken::new();

        tx_a.send(Res::success(1)).await.unwrap();
        tx_a.send(Res::success(2)).await.unwrap();
        tx_b.send(Res::success(10)).await.unwrap();
        drop(tx_a);
        drop(tx_b);

        let mut merged = fan_in("fan-in", ctx, vec![rx_a, rx_b]);
        let mut values = Vec::new();
        while let Some(r) = merged.recv().await {
            values.push(*r.value());
        }
        values.sort();
        assert_eq!(values, vec![1, 2, 10]);
    }

    #[tokio::test]
    async fn closes_output_once_every_input_closes() {
        let (tx, rx) = mpsc::channel::<Res<i32>>(16);
        let ctx = CancellationToken::new();
        drop(tx);

        let mut merged = fan_in("fan-in", ctx, vec![rx]);
        assert!(merged.recv().await.is_none());
    }
}
