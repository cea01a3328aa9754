//! Switch — §4.15.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::processor::{invoke_guarded, recv_or_cancel, send_or_cancel, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// Routes successful items to one of several named channels by a
/// user-supplied key function; errors go to a dedicated error channel
/// rather than any data route.
///
/// Routes are registered explicitly via [`add_route`](Switch::add_route)
/// before [`spawn`](Switch::spawn) is called — this crate has no
/// equivalent of creating a channel lazily from inside the routing task,
/// since the caller needs every route's receiver back before the first
/// item can possibly arrive.
pub struct Switch<T, K, F> {
    name: String,
    predicate: F,
    route_txs: HashMap<K, mpsc::Sender<Res<T>>>,
    default_key: Option<K>,
}

impl<T, K, F> Switch<T, K, F>
where
    T: Clone + Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    F: Fn(&T) -> K + Send + 'static,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
            route_txs: HashMap::new(),
            default_key: None,
        }
    }

    /// Registers a route for `key` and returns its receiver.
    pub fn add_route(&mut self, key: K) -> mpsc::Receiver<Res<T>> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        self.route_txs.insert(key, tx);
        rx
    }

    /// Items whose computed key has no registered route are sent to
    /// `key`'s route instead of being dropped. `key` must itself resolve
    /// to a registered route by the time [`spawn`](Switch::spawn) runs.
    pub fn with_default(mut self, key: K) -> Self {
        self.default_key = Some(key);
        self
    }

    /// Consumes `input`, routing every item, and returns the error channel.
    pub fn spawn(
        self,
        ctx: CancellationToken,
        mut input: mpsc::Receiver<Res<T>>,
    ) -> mpsc::Receiver<Res<T>> {
        let (err_tx, err_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let Switch {
                name,
                predicate,
                route_txs,
                default_key,
            } = self;

            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                match item.as_success() {
                    Some(value) => match invoke_guarded(|| predicate(value)) {
                        Ok(key) => {
                            let target = route_txs
                                .get(&key)
                                .or_else(|| default_key.as_ref().and_then(|d| route_txs.get(d)));
                            match target {
                                Some(tx) => {
                                    let _ = send_or_cancel(tx, item, &ctx).await;
                                }
                                None => debug!(processor = %name, "no route for key, dropping item"),
                            }
                        }
                        Err(panic) => {
                            let failed = Res::error(item.into_success_or_none(), panic, name.clone());
                            if !send_or_cancel(&err_tx, failed, &ctx).await {
                                return;
                            }
                        }
                    },
                    None => {
                        if !send_or_cancel(&err_tx, item.chain_push(name.clone()), &ctx).await {
                            return;
                        }
                    }
                }
            }
            // `route_txs` drops here, closing every route channel exactly once.
        });

        err_rx
    }
}
