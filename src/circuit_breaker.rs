//! CircuitBreaker — §4.17.
//!
//! Wraps an inner [`Processor<T, T>`], tracking request/failure counts over
//! a sliding request window. Closed: requests flow through, failures
//! accumulate. Open: every item short-circuits to an error `Res<T>`
//! without invoking the inner processor. Half-Open: a limited number of
//! probes are let through; a probe success closes the circuit, a probe
//! failure reopens it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::Clock;
use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// The error value emitted in place of the inner processor's result while
/// the circuit is open.
#[derive(Debug, Error)]
#[error("circuit-open")]
pub struct CircuitOpenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Counters {
    state: CircuitState,
    requests: u64,
    failures: u64,
    opened_at: Option<std::time::SystemTime>,
    half_open_probes_in_flight: u32,
}

/// Configuration for [`CircuitBreaker`]: transition thresholds and the
/// optional callbacks invoked on state changes.
pub struct Config {
    pub min_requests: u64,
    pub failure_threshold: f64,
    pub recovery_timeout: Duration,
    pub half_open_max_probes: u32,
    pub on_open: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_state_change: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
}

impl Config {
    pub fn new(min_requests: u64, failure_threshold: f64, recovery_timeout: Duration) -> Self {
        Self {
            min_requests,
            failure_threshold,
            recovery_timeout,
            half_open_max_probes: 1,
            on_open: None,
            on_state_change: None,
        }
    }
}

fn state_name(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half-open",
    }
}

/// Wraps an inner `Processor<T, T>`, short-circuiting it while the circuit
/// is open.
pub struct CircuitBreaker<T, P> {
    name: String,
    inner: P,
    config: Config,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<T>,
}

impl<T, P> CircuitBreaker<T, P>
where
    T: Clone + Send + 'static,
    P: Processor<T, T>,
{
    pub fn new(name: impl Into<String>, inner: P, config: Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            inner,
            config,
            clock,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, P> Processor<T, T> for CircuitBreaker<T, P>
where
    T: Clone + Send + 'static,
    P: Processor<T, T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self,
        ctx: CancellationToken,
        input: mpsc::Receiver<Res<T>>,
    ) -> mpsc::Receiver<Res<T>> {
        let (gate_tx, gate_rx) = mpsc::channel::<Res<T>>(DEFAULT_CHANNEL_CAPACITY);
        let (short_tx, mut short_rx) = mpsc::channel::<Res<T>>(DEFAULT_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        let counters = Arc::new(Mutex::new(Counters {
            state: CircuitState::Closed,
            requests: 0,
            failures: 0,
            opened_at: None,
            half_open_probes_in_flight: 0,
        }));

        // The gate task decides, per item, whether to forward into the
        // inner processor or short-circuit it as `circuit-open`.
        let gate_counters = counters.clone();
        let gate_clock = self.clock.clone();
        let gate_config_recovery = self.config.recovery_timeout;
        let gate_config_max_probes = self.config.half_open_max_probes;
        let on_state_change = self.config.on_state_change.clone();
        let gate_ctx = ctx.clone();
        let mut input = input;
        tokio::spawn(async move {
            while let Some(item) = recv_or_cancel(&mut input, &gate_ctx).await {
                let decision = {
                    let mut c = gate_counters.lock().unwrap();
                    if c.state == CircuitState::Open {
                        let elapsed = gate_clock
                            .now()
                            .duration_since(c.opened_at.unwrap_or(gate_clock.now()))
                            .unwrap_or(Duration::ZERO);
                        if elapsed >= gate_config_recovery {
                            transition(&mut c, CircuitState::HalfOpen, &on_state_change, &None);
                        }
                    }
                    match c.state {
                        CircuitState::Open => false,
                        CircuitState::HalfOpen => {
                            if c.half_open_probes_in_flight < gate_config_max_probes {
                                c.half_open_probes_in_flight += 1;
                                true
                            } else {
                                false
                            }
                        }
                        CircuitState::Closed => true,
                    }
                };

                if decision {
                    if !send_or_cancel(&gate_tx, item, &gate_ctx).await {
                        return;
                    }
                } else {
                    let short = Res::error(item.into_success_or_none(), CircuitOpenError, "circuit-breaker");
                    if !send_or_cancel(&short_tx, short, &gate_ctx).await {
                        return;
                    }
                }
            }
        });

        let inner_rx = self.inner.process(ctx.clone(), gate_rx);

        // The result-observer task watches what comes back from the inner
        // processor to record each probe/request's outcome, then forwards
        // to the merged output alongside whatever the gate short-circuited.
        let observe_counters = counters.clone();
        let recovery_ctx = ctx.clone();
        let min_requests = self.config.min_requests;
        let failure_threshold = self.config.failure_threshold;
        let on_state_change_obs = self.config.on_state_change.clone();
        let on_open_obs = self.config.on_open.clone();
        let observe_clock = self.clock.clone();
        let mut inner_rx = inner_rx;
        let merged_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(item) = recv_or_cancel(&mut inner_rx, &recovery_ctx).await {
                {
                    let mut c = observe_counters.lock().unwrap();
                    c.requests += 1;
                    let failed = item.is_error();
                    if failed {
                        c.failures += 1;
                    }

                    match c.state {
                        CircuitState::HalfOpen => {
                            c.half_open_probes_in_flight = c.half_open_probes_in_flight.saturating_sub(1);
                            if failed {
                                transition(&mut c, CircuitState::Open, &on_state_change_obs, &on_open_obs);
                                c.opened_at = Some(observe_clock.now());
                                c.requests = 0;
                                c.failures = 0;
                            } else {
                                transition(&mut c, CircuitState::Closed, &on_state_change_obs, &None);
                                c.requests = 0;
                                c.failures = 0;
                            }
                        }
                        CircuitState::Closed => {
                            if c.requests >= min_requests
                                && (c.failures as f64 / c.requests as f64) >= failure_threshold
                            {
                                transition(&mut c, CircuitState::Open, &on_state_change_obs, &on_open_obs);
                                c.opened_at = Some(observe_clock.now());
                            }
                        }
                        CircuitState::Open => {}
                    }
                }
                if !send_or_cancel(&merged_tx, item, &recovery_ctx).await {
                    return;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(item) = short_rx.recv().await {
                if !send_or_cancel(&out_tx, item, &ctx).await {
                    return;
                }
            }
        });

        out_rx
    }
}

fn transition(
    c: &mut Counters,
    to: CircuitState,
    on_state_change: &Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
    on_open: &Option<Arc<dyn Fn() + Send + Sync>>,
) {
    let from = c.state;
    if from == to {
        return;
    }
    info!(from = state_name(from), to = state_name(to), "circuit breaker transition");
    if let Some(cb) = on_state_change {
        cb(state_name(from), state_name(to));
    }
    if to == CircuitState::Open {
        if let Some(cb) = on_open {
            cb();
        }
    }
    c.state = to;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::processor::Processor as _;

    struct AlwaysFail;
    impl Processor<i32, i32> for AlwaysFail {
        fn name(&self) -> &str {
            "always-fail"
        }
        fn process(
            self,
            ctx: CancellationToken,
            mut input: mpsc::Receiver<Res<i32>>,
        ) -> mpsc::Receiver<Res<i32>> {
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                    let value = item.into_success_or_none();
                    let _ = send_or_cancel(
                        &tx,
                        Res::error(value, std::io::Error::other("inner failure"), "always-fail"),
                        &ctx,
                    )
                    .await;
                }
            });
            rx
        }
    }

    #[tokio::test]
    async fn opens_after_failure_threshold_and_short_circuits() {
        crate::setup_test_logging();
        let clock = FakeClock::new();
        let config = Config::new(2, 0.5, Duration::from_secs(60));
        let breaker = CircuitBreaker::new("breaker", AlwaysFail, config, clock);
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = breaker.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        tx.send(Res::success(2)).await.unwrap();
        tx.send(Res::success(3)).await.unwrap();
        drop(tx);

        let first = out.recv().await.unwrap();
        assert!(first.is_error());
        let second = out.recv().await.unwrap();
        assert!(second.is_error());

        let third = out.recv().await.unwrap();
        assert!(third.is_error());
        assert!(third.error_ref().source.to_string().contains("circuit-open"));
    }

    #[tokio::test]
    async fn recovers_to_half_open_once_the_fake_clock_passes_recovery_timeout() {
        crate::setup_test_logging();
        let clock = FakeClock::new();
        let config = Config::new(1, 0.5, Duration::from_secs(30));
        let breaker = CircuitBreaker::new("breaker", AlwaysFail, config, clock.clone());
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = breaker.process(ctx, input);

        // One failing request trips the circuit (1 request, 100% failures >= 50%).
        tx.send(Res::success(1)).await.unwrap();
        let first = out.recv().await.unwrap();
        assert!(first.error_ref().source.to_string().contains("inner failure"));

        // Still within the recovery window: short-circuited without reaching
        // the inner processor.
        tx.send(Res::success(2)).await.unwrap();
        let second = out.recv().await.unwrap();
        assert!(second.error_ref().source.to_string().contains("circuit-open"));

        // Advancing the fake clock past `recovery_timeout` must let the next
        // item through as a half-open probe, not depend on wall-clock time.
        clock.advance(Duration::from_secs(30));
        clock.block_until_ready().await;

        tx.send(Res::success(3)).await.unwrap();
        let third = out.recv().await.unwrap();
        assert!(
            third.error_ref().source.to_string().contains("inner failure"),
            "the probe should have reached the inner processor instead of short-circuiting"
        );
        drop(tx);
    }
}
