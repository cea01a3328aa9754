//! Dedupe — §4.6.
//!
//! Emits a value iff its key (from `key_fn`) is absent from the seen-map or
//! its existing entry has expired. A periodic purge removes expired
//! entries so memory stays O(active unique keys within `ttl`) at steady
//! state. Errors have no key to evaluate and always pass through.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::processor::{invoke_guarded, recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

const PURGE_FLOOR: Duration = Duration::from_millis(10);

/// Suppresses values whose key was already seen within `ttl`, optionally
/// bounding the seen-map to `lru_cap` entries.
pub struct Dedupe<T, K, F> {
    name: String,
    key_fn: F,
    ttl: Duration,
    lru_cap: Option<usize>,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<(T, K)>,
}

impl<T, K, F> Dedupe<T, K, F>
where
    T: Clone + Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    F: Fn(&T) -> K + Send + 'static,
{
    pub fn new(name: impl Into<String>, key_fn: F, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            key_fn,
            ttl,
            lru_cap: None,
            clock,
            _marker: std::marker::PhantomData,
        }
    }

    /// Additionally caps the seen-map at `cap` entries, evicting the
    /// least-recently-inserted key first when it would be exceeded.
    pub fn with_lru_cap(mut self, cap: usize) -> Self {
        self.lru_cap = Some(cap);
        self
    }

    fn purge_interval(&self) -> Duration {
        std::cmp::max(self.ttl / 4, PURGE_FLOOR)
    }
}

impl<T, K, F> Processor<T, T> for Dedupe<T, K, F>
where
    T: Clone + Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    F: Fn(&T) -> K + Send + 'static,
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
            let mut purge = self.clock.ticker(self.purge_interval());
            // Insertion order tracked alongside the map so an LRU cap can
            // evict the oldest entry in O(1) amortized without a second
            // lookup structure.
            let mut seen: HashMap<K, SystemTime> = HashMap::new();
            let mut order: VecDeque<K> = VecDeque::new();

            loop {
                tokio::select! {
                    biased;

                    _ = ctx.cancelled() => return,

                    item = recv_or_cancel(&mut input, &ctx) => {
                        match item {
                            Some(res) => {
                                match res.as_success() {
                                    Some(value) => match invoke_guarded(|| (self.key_fn)(value)) {
                                        Ok(key) => {
                                            let now = self.clock.now();
                                            let expired = seen
                                                .get(&key)
                                                .map(|inserted| now.duration_since(*inserted).unwrap_or(Duration::ZERO) >= self.ttl)
                                                .unwrap_or(true);
                                            if expired {
                                                if !seen.contains_key(&key) {
                                                    order.push_back(key.clone());
                                                }
                                                seen.insert(key, now);
                                                if let Some(cap) = self.lru_cap {
                                                    while seen.len() > cap {
                                                        if let Some(oldest) = order.pop_front() {
                                                            seen.remove(&oldest);
                                                        } else {
                                                            break;
                                                        }
                                                    }
                                                }
                                                if !send_or_cancel(&tx, res, &ctx).await {
                                                    return;
                                                }
                                            }
                                        }
                                        Err(panic) => {
                                            let failed = Res::error(res.into_success_or_none(), panic, self.name.clone());
                                            if !send_or_cancel(&tx, failed, &ctx).await {
                                                return;
                                            }
                                        }
                                    },
                                    None => {
                                        if !send_or_cancel(&tx, res, &ctx).await {
                                            return;
                                        }
                                    }
                                }
                            }
                            None => return,
                        }
                    }

                    _ = purge.tick() => {
                        let now = self.clock.now();
                        let expired_keys: Vec<K> = seen
                            .iter()
                            .filter(|(_, inserted)| now.duration_since(**inserted).unwrap_or(Duration::ZERO) >= self.ttl)
                            .map(|(k, _)| k.clone())
                            .collect();
                        for key in expired_keys {
                            seen.remove(&key);
                            order.retain(|k| k != &key);
                        }
                    }
                }
            }
        });

        rx
    }
}
