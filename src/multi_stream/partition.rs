//! Partition — §4.15. Load-balances across a fixed-size array of N
//! channels by `hash(key_fn(item)) mod N`, or by a user-supplied
//! partitioner overriding the default hashing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::processor::{invoke_guarded, recv_or_cancel, send_or_cancel, DEFAULT_CHANNEL_CAPACITY};
use crate::result::{chain_push_owned, Res};

type Partitioner<T> = Box<dyn Fn(&T, usize) -> usize + Send>;

pub struct Partition<T, K, F> {
    name: String,
    key_fn: F,
    partitions: usize,
    partitioner: Option<Partitioner<T>>,
    route_txs: Vec<mpsc::Sender<Res<T>>>,
    route_rxs: Vec<Option<mpsc::Receiver<Res<T>>>>,
    error_tx: mpsc::Sender<Res<T>>,
    error_rx: Option<mpsc::Receiver<Res<T>>>,
    _marker: std::marker::PhantomData<K>,
}

impl<T, K, F> Partition<T, K, F>
where
    T: Send + 'static,
    K: Hash,
    F: Fn(&T) -> K + Send + 'static,
{
    pub fn new(name: impl Into<String>, partitions: usize, key_fn: F) -> Self {
        assert!(partitions > 0, "Partition requires at least one partition");
        let mut route_txs = Vec::with_capacity(partitions);
        let mut route_rxs = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
            route_txs.push(tx);
            route_rxs.push(Some(rx));
        }
        let (error_tx, error_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            key_fn,
            partitions,
            partitioner: None,
            route_txs,
            route_rxs,
            error_tx,
            error_rx: Some(error_rx),
            _marker: std::marker::PhantomData,
        }
    }

    /// Overrides the default `hash(key) mod N` bucket assignment. Receives
    /// the item and the partition count; must return a value `< partitions`.
    pub fn with_partitioner(mut self, partitioner: impl Fn(&T, usize) -> usize + Send + 'static) -> Self {
        self.partitioner = Some(Box::new(partitioner));
        self
    }

    pub fn route(&mut self, index: usize) -> mpsc::Receiver<Res<T>> {
        self.route_rxs[index].take().expect("route already taken")
    }

    pub fn error_route(&mut self) -> mpsc::Receiver<Res<T>> {
        self.error_rx.take().expect("error_route already taken")
    }

    pub fn spawn(self, ctx: CancellationToken, mut input: mpsc::Receiver<Res<T>>) {
        tokio::spawn(async move {
            let Partition {
                name,
                key_fn,
                partitions,
                partitioner,
                route_txs,
                error_tx,
                ..
            } = self;

            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                match item.as_success() {
                    Some(value) => {
                        let index = match &partitioner {
                            Some(f) => invoke_guarded(|| f(value, partitions) % partitions),
                            None => invoke_guarded(|| {
                                let key = key_fn(value);
                                let mut hasher = DefaultHasher::new();
                                key.hash(&mut hasher);
                                (hasher.finish() as usize) % partitions
                            }),
                        };
                        match index {
                            Ok(index) => {
                                if !send_or_cancel(&route_txs[index], item, &ctx).await {
                                    return;
                                }
                            }
                            Err(panic) => {
                                let failed = Res::error(item.into_success_or_none(), panic, name.clone());
                                if !send_or_cancel(&error_tx, failed, &ctx).await {
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        if !send_or_cancel(&error_tx, chain_push_owned(item, name.clone()), &ctx).await {
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_to_a_fixed_size_array_of_partitions() {
        let mut partition = Partition::new("partition", 4, |v: &i32| *v).with_partitioner(|v, n| (*v as usize) % n);
        let mut route0 = partition.route(0);
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        partition.spawn(ctx, input);

        tx.send(Res::success(8)).await.unwrap();
        drop(tx);

        assert_eq!(*route0.recv().await.unwrap().value(), 8);
    }

    #[tokio::test]
    async fn errored_input_has_the_processor_name_appended_to_its_chain() {
        let mut partition = Partition::new("partition", 2, |v: &i32| *v);
        let mut errors = partition.error_route();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        partition.spawn(ctx, input);

        tx.send(Res::error(None::<i32>, std::io::Error::other("x"), "source")).await.unwrap();
        drop(tx);

        let error = errors.recv().await.unwrap();
        assert_eq!(error.error_ref().chain, vec!["source", "partition"]);
    }

    #[tokio::test]
    async fn panicking_partitioner_is_converted_into_an_error_result() {
        let mut partition = Partition::new("partition", 2, |v: &i32| *v).with_partitioner(|v, _n| {
            if *v == 0 {
                panic!("division by zero");
            }
            0
        });
        let mut errors = partition.error_route();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        partition.spawn(ctx, input);

        tx.send(Res::success(0)).await.unwrap();
        drop(tx);

        let error = errors.recv().await.unwrap();
        assert!(error.error_ref().source.to_string().contains("division by zero"));
    }
}
