//! Sample — §4.7.
//!
//! Keeps a ratio `p ∈ [0, 1]` of successful items. Deterministic mode uses
//! a counter modulo `1/p`; probabilistic mode draws an independent uniform
//! per item. Errors always pass through.

use std::sync::Mutex;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

enum Strategy {
    /// Keeps exactly one item out of every `modulus`, spaced evenly.
    Deterministic { modulus: u64 },
    /// Draws an independent uniform per item, keeping it with probability `p`.
    Probabilistic { p: f64, rng: Mutex<ChaCha8Rng> },
}

/// Thins a stream of successful items to an approximate or exact ratio `p`.
pub struct Sample<T> {
    name: String,
    strategy: Strategy,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Sample<T>
where
    T: Clone + Send + 'static,
{
    /// Deterministic sampling: keeps the first item of every `round(1/p)`
    /// group. Reproducible and order-stable, the right default for tests
    /// and for callers who need an exact long-run ratio.
    pub fn deterministic(name: impl Into<String>, p: f64) -> Self {
        assert!(p > 0.0 && p <= 1.0, "p must be in (0, 1]");
        let modulus = (1.0 / p).round().max(1.0) as u64;
        Self {
            name: name.into(),
            strategy: Strategy::Deterministic { modulus },
            _marker: std::marker::PhantomData,
        }
    }

    /// Probabilistic sampling: an independent coin flip per item, seeded
    /// from OS entropy at construction.
    pub fn probabilistic(name: impl Into<String>, p: f64) -> Self {
        assert!((0.0..=1.0).contains(&p), "p must be in [0, 1]");
        Self {
            name: name.into(),
            strategy: Strategy::Probabilistic {
                p,
                rng: Mutex::new(ChaCha8Rng::from_os_rng()),
            },
            _marker: std::marker::PhantomData,
        }
    }

    /// Probabilistic sampling with an explicit seed, for reproducible tests.
    pub fn probabilistic_seeded(name: impl Into<String>, p: f64, seed: u64) -> Self {
        assert!((0.0..=1.0).contains(&p), "p must be in [0, 1]");
        Self {
            name: name.into(),
            strategy: Strategy::Probabilistic {
                p,
                rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            },
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Processor<T, T> for Sample<T>
where
    T: Clone + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self,
        ctx: CancellationToken,
        mut input: mpsc::Receiver<Res<T>>,
    ) -> mpsc::Receiver<Res<T>> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut counter: u64 = 0;

            while let Some(res) = recv_or_cancel(&mut input, &ctx).await {
                if res.is_error() {
                    if !send_or_cancel(&tx, res, &ctx).await {
                        return;
                    }
                    continue;
                }

                let keep = match &self.strategy {
                    Strategy::Deterministic { modulus } => {
                        let keep = counter % modulus == 0;
                        counter += 1;
                        keep
                    }
                    Strategy::Probabilistic { p, rng } => rng.lock().unwrap().random_bool(*p),
                };

                if keep && !send_or_cancel(&tx, res, &ctx).await {
                    return;
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deterministic_keeps_every_nth_item() {
        let sample = Sample::deterministic("sample", 0.25);
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = sample.process(ctx, input);

        for v in 1..=8 {
            tx.send(Res::success(v)).await.unwrap();
        }
        drop(tx);

        let mut kept = Vec::new();
        while let Some(r) = out.recv().await {
            kept.push(*r.value());
        }
        assert_eq!(kept, vec![1, 5]);
    }

    #[tokio::test]
    async fn errors_always_pass_through() {
        let sample = Sample::deterministic("sample", 0.1);
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = sample.process(ctx, input);

        tx.send(Res::error(None::<i32>, std::io::Error::other("boom"), "source"))
            .await
            .unwrap();
        drop(tx);

        let first = out.recv().await.unwrap();
        assert!(first.is_error());
    }
}
