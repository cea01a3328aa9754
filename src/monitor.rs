//! Monitor — §4.19 (named in the component table, specified in full here).
//!
//! A pass-through processor that observes a stream without altering it.
//! Forwards every `Res<T>` unchanged; never blocks on user code.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// A point-in-time snapshot of a [`Monitor`]'s counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorStats {
    pub total: u64,
    pub successes: u64,
    pub errors: u64,
    pub last_event_at: Option<SystemTime>,
}

/// Shared handle to a running [`Monitor`]'s stats, cheap to clone and safe
/// to read concurrently with the processor task.
#[derive(Clone)]
pub struct MonitorHandle {
    stats: Arc<Mutex<MonitorStats>>,
}

impl MonitorHandle {
    pub fn snapshot(&self) -> MonitorStats {
        *self.stats.lock().unwrap()
    }
}

/// Counts items, successes, and errors flowing through a stream, exposing
/// the running totals via a [`MonitorHandle`] obtained from [`handle`](Monitor::handle).
pub struct Monitor<T> {
    name: String,
    clock: Arc<dyn Clock>,
    stats: Arc<Mutex<MonitorStats>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Monitor<T>
where
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            stats: Arc::new(Mutex::new(MonitorStats::default())),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            stats: self.stats.clone(),
        }
    }
}

impl<T> Processor<T, T> for Monitor<T>
where
    T: Send + 'static,
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
            while let Some(res) = recv_or_cancel(&mut input, &ctx).await {
                {
                    let mut stats = self.stats.lock().unwrap();
                    stats.total += 1;
                    if res.is_success() {
                        stats.successes += 1;
                    } else {
                        stats.errors += 1;
                    }
                    stats.last_event_at = Some(self.clock.now());
                }
                if !send_or_cancel(&tx, res, &ctx).await {
                    return;
                }
            }
        });

        rx
    }
}
