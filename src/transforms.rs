//! The trivial transforms — §4.20. One-to-one/one-to-many single-worker
//! loops (Filter, Mapper, Tap, Flatten, Chunk, Skip, Take, Unbatcher, Dlq).
//! They follow the same [`Processor`] trait and cancellation discipline as
//! every other processor, bypass user closures for error `Res`s exactly
//! like Switch/Router do, and recover from a panicking predicate/mapping
//! function by converting it into an error `Res` (§4.2) via
//! [`invoke_guarded`].

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::batcher::Batcher;
use crate::clock::Clock;
use crate::processor::{invoke_guarded, recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::{Res, StreamError};

/// Recasts a `StreamError<In>` as a `StreamError<Out>`, dropping the
/// carried value — there is no `Out` to recover it as. Mirrors
/// `async_mapper`'s `error_as_out`, needed for the same reason: `Mapper`'s
/// output type differs from its input type.
fn error_as_out<In, Out>(mut err: StreamError<In>, processor: impl Into<String>) -> StreamError<Out> {
    err.chain.push(processor.into());
    StreamError {
        value: None,
        source: err.source,
        processor: err.processor,
        at: err.at,
        chain: err.chain,
    }
}

/// Forwards only values for which `predicate` returns `true`. Errors
/// always pass through, since there is no value to evaluate the predicate
/// against.
pub struct Filter<T, F> {
    name: String,
    predicate: F,
    _marker: std::marker::PhantomData<T>,
}

impl<T, F> Filter<T, F>
where
    T: Clone + Send + 'static,
    F: Fn(&T) -> bool + Send + 'static,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, F> Processor<T, T> for Filter<T, F>
where
    T: Clone + Send + 'static,
    F: Fn(&T) -> bool + Send + 'static,
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
        let name = self.name;
        let predicate = self.predicate;
        tokio::spawn(async move {
            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                match item.as_success() {
                    Some(value) => match invoke_guarded(|| predicate(value)) {
                        Ok(true) => {
                            if !send_or_cancel(&tx, item, &ctx).await {
                                return;
                            }
                        }
                        Ok(false) => {}
                        Err(panic) => {
                            let failed = Res::error(item.into_success_or_none(), panic, name.clone());
                            if !send_or_cancel(&tx, failed, &ctx).await {
                                return;
                            }
                        }
                    },
                    None => {
                        if !send_or_cancel(&tx, item.chain_push(name.clone()), &ctx).await {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }
}

/// Transforms each success value with `map_fn`. Errors pass through with
/// the processor name appended to the chain — since `Out` may differ from
/// `In`, the error's carried value is dropped (there's no way to produce
/// an `Out` from it).
pub struct Mapper<In, Out, F> {
    name: String,
    map_fn: F,
    _marker: std::marker::PhantomData<(In, Out)>,
}

impl<In, Out, F> Mapper<In, Out, F>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Out + Send + 'static,
{
    pub fn new(name: impl Into<String>, map_fn: F) -> Self {
        Self {
            name: name.into(),
            map_fn,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<In, Out, F> Processor<In, Out> for Mapper<In, Out, F>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Out + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self,
        ctx: CancellationToken,
        mut input: mpsc::Receiver<Res<In>>,
    ) -> mpsc::Receiver<Res<Out>> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let name = self.name;
        let map_fn = self.map_fn;
        tokio::spawn(async move {
            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                match item.as_success() {
                    Some(value) => {
                        let value = value.clone();
                        match invoke_guarded(|| map_fn(value)) {
                            Ok(out) => {
                                if !send_or_cancel(&tx, Res::success(out), &ctx).await {
                                    return;
                                }
                            }
                            Err(panic) => {
                                let failed: Res<Out> = Res::error(None, panic, name.clone());
                                if !send_or_cancel(&tx, failed, &ctx).await {
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        let err = item.into_error();
                        let failed = Res::from_error(error_as_out(err, name.clone()));
                        if !send_or_cancel(&tx, failed, &ctx).await {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }
}

/// Observes every success value with `tap_fn` without altering the stream.
/// Errors pass through untouched; a panic in `tap_fn` is converted into an
/// error `Res` that replaces the observed item.
pub struct Tap<T, F> {
    name: String,
    tap_fn: F,
    _marker: std::marker::PhantomData<T>,
}

impl<T, F> Tap<T, F>
where
    T: Clone + Send + 'static,
    F: Fn(&T) + Send + 'static,
{
    pub fn new(name: impl Into<String>, tap_fn: F) -> Self {
        Self {
            name: name.into(),
            tap_fn,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, F> Processor<T, T> for Tap<T, F>
where
    T: Clone + Send + 'static,
    F: Fn(&T) + Send + 'static,
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
        let name = self.name;
        let tap_fn = self.tap_fn;
        tokio::spawn(async move {
            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                match item.as_success() {
                    Some(value) => match invoke_guarded(|| tap_fn(value)) {
                        Ok(()) => {
                            if !send_or_cancel(&tx, item, &ctx).await {
                                return;
                            }
                        }
                        Err(panic) => {
                            let failed = Res::error(item.into_success_or_none(), panic, name.clone());
                            if !send_or_cancel(&tx, failed, &ctx).await {
                                return;
                            }
                        }
                    },
                    None => {
                        if !send_or_cancel(&tx, item.chain_push(name.clone()), &ctx).await {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }
}

/// Expands one `Res<Vec<T>>` into many `Res<T>`, one per element. An error
/// result is forwarded as a single error `Res<T>` carrying no value (the
/// failing batch has no individual element to single out).
pub struct Flatten<T> {
    name: String,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Flatten<T>
where
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Processor<Vec<T>, T> for Flatten<T>
where
    T: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self,
        ctx: CancellationToken,
        mut input: mpsc::Receiver<Res<Vec<T>>>,
    ) -> mpsc::Receiver<Res<T>> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let name = self.name;
        tokio::spawn(async move {
            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                if item.is_success() {
                    for value in item.into_value() {
                        if !send_or_cancel(&tx, Res::success(value), &ctx).await {
                            return;
                        }
                    }
                } else {
                    // The failing batch has no individual element to single
                    // out; forward the failure alone, carrying no value.
                    let err = item.into_error();
                    let failed = Res::from_error(error_as_out(err, name.clone()));
                    if !send_or_cancel(&tx, failed, &ctx).await {
                        return;
                    }
                }
            }
        });
        rx
    }
}

/// Groups items into fixed-size chunks — a size-only [`Batcher`] under a
/// task-friendly name.
pub struct Chunk<T> {
    inner: Batcher<T>,
}

impl<T> Chunk<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, size: usize, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            inner: Batcher::new(name, size, Duration::ZERO, clock)
                .expect("Chunk always sets a positive size bound"),
        }
    }
}

impl<T> Processor<T, Vec<T>> for Chunk<T>
where
    T: Clone + Send + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn process(
        self,
        ctx: CancellationToken,
        input: mpsc::Receiver<Res<T>>,
    ) -> mpsc::Receiver<Res<Vec<T>>> {
        self.inner.process(ctx, input)
    }
}

/// Drops the first `n` successful values, then forwards everything after.
/// Errors are never counted against `n` and always pass through.
pub struct Skip<T> {
    name: String,
    n: u64,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Skip<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, n: u64) -> Self {
        Self {
            name: name.into(),
            n,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Processor<T, T> for Skip<T>
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
        let mut remaining = self.n;
        tokio::spawn(async move {
            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                if item.is_success() && remaining > 0 {
                    remaining -= 1;
                    continue;
                }
                if !send_or_cancel(&tx, item, &ctx).await {
                    return;
                }
            }
        });
        rx
    }
}

/// Forwards only the first `n` successful values, then stops (closing the
/// output) without waiting for the input to close. Errors seen before the
/// limit is reached pass through and do not count toward `n`.
pub struct Take<T> {
    name: String,
    n: u64,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Take<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, n: u64) -> Self {
        Self {
            name: name.into(),
            n,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Processor<T, T> for Take<T>
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
        let mut remaining = self.n;
        tokio::spawn(async move {
            if remaining == 0 {
                return;
            }
            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                let is_success = item.is_success();
                if !send_or_cancel(&tx, item, &ctx).await {
                    return;
                }
                if is_success {
                    remaining -= 1;
                    if remaining == 0 {
                        return;
                    }
                }
            }
        });
        rx
    }
}

/// The inverse of [`Batcher`](crate::batcher::Batcher): expands one
/// `Res<Vec<T>>` into many `Res<T>`. Identical behavior to [`Flatten`],
/// kept as a distinct named type since the two read differently at a call
/// site (`Unbatcher` undoes a `Batcher`; `Flatten` is the general case).
pub struct Unbatcher<T> {
    inner: Flatten<T>,
}

impl<T> Unbatcher<T>
where
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Flatten::new(name),
        }
    }
}

impl<T> Processor<Vec<T>, T> for Unbatcher<T>
where
    T: Send + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn process(
        self,
        ctx: CancellationToken,
        input: mpsc::Receiver<Res<Vec<T>>>,
    ) -> mpsc::Receiver<Res<T>> {
        self.inner.process(ctx, input)
    }
}

/// Splits a stream into a success receiver and a dead-letter (error)
/// receiver.
pub fn dlq<T>(
    ctx: CancellationToken,
    mut input: mpsc::Receiver<Res<T>>,
) -> (mpsc::Receiver<Res<T>>, mpsc::Receiver<Res<T>>)
where
    T: Send + 'static,
{
    let (ok_tx, ok_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
            let tx = if item.is_success() { &ok_tx } else { &err_tx };
            if !send_or_cancel(tx, item, &ctx).await {
                return;
            }
        }
    });
    (ok_rx, err_rx)
}
