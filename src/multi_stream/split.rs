//! Split — §4.15. Specialization of [`super::Switch`] for a boolean
//! predicate: exactly two outputs, `true` and `false`.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::processor::{invoke_guarded, recv_or_cancel, send_or_cancel, DEFAULT_CHANNEL_CAPACITY};
use crate::result::{chain_push_owned, Res};

pub struct Split<T, F> {
    name: String,
    predicate: F,
    true_tx: mpsc::Sender<Res<T>>,
    true_rx: Option<mpsc::Receiver<Res<T>>>,
    false_tx: mpsc::Sender<Res<T>>,
    false_rx: Option<mpsc::Receiver<Res<T>>>,
    error_tx: mpsc::Sender<Res<T>>,
    error_rx: Option<mpsc::Receiver<Res<T>>>,
}

impl<T, F> Split<T, F>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + 'static,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        let (true_tx, true_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (false_tx, false_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            predicate,
            true_tx,
            true_rx: Some(true_rx),
            false_tx,
            false_rx: Some(false_rx),
            error_tx,
            error_rx: Some(error_rx),
        }
    }

    pub fn true_route(&mut self) -> mpsc::Receiver<Res<T>> {
        self.true_rx.take().expect("true_route already taken")
    }

    pub fn false_route(&mut self) -> mpsc::Receiver<Res<T>> {
        self.false_rx.take().expect("false_route already taken")
    }

    pub fn error_route(&mut self) -> mpsc::Receiver<Res<T>> {
        self.error_rx.take().expect("error_route already taken")
    }

    pub fn spawn(self, ctx: CancellationToken, mut input: mpsc::Receiver<Res<T>>) {
        tokio::spawn(async move {
            let Split {
                name,
                predicate,
                true_tx,
                false_tx,
                error_tx,
                ..
            } = self;

            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                match item.as_success() {
                    Some(value) => match invoke_guarded(|| predicate(value)) {
                        Ok(true) => {
                            if !send_or_cancel(&true_tx, item, &ctx).await {
                                return;
                            }
                        }
                        Ok(false) => {
                            if !send_or_cancel(&false_tx, item, &ctx).await {
                                return;
                            }
                        }
                        Err(panic) => {
                            let failed = Res::error(item.into_success_or_none(), panic, name.clone());
                            if !send_or_cancel(&error_tx, failed, &ctx).await {
                                return;
                            }
                        }
                    },
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
    async fn splits_by_boolean_predicate() {
        let mut split = Split::new("split", |v: &i32| *v % 2 == 0);
        let mut yes = split.true_route();
        let mut no = split.false_route();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        split.spawn(ctx, input);

        tx.send(Res::success(2)).await.unwrap();
        tx.send(Res::success(3)).await.unwrap();
        drop(tx);

        assert_eq!(*yes.recv().await.unwrap().value(), 2);
        assert_eq!(*no.recv().await.unwrap().value(), 3);
    }

    #[tokio::test]
    async fn errored_input_has_the_processor_name_appended_to_its_chain() {
        let mut split = Split::new("split", |v: &i32| *v % 2 == 0);
        let mut errors = split.error_route();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        split.spawn(ctx, input);

        tx.send(Res::error(None::<i32>, std::io::Error::other("x"), "source")).await.unwrap();
        drop(tx);

        let error = errors.recv().await.unwrap();
        assert_eq!(error.error_ref().chain, vec!["source", "split"]);
    }

    #[tokio::test]
    async fn panicking_predicate_is_converted_into_an_error_result() {
        let mut split = Split::new("split", |v: &i32| {
            if *v == 0 {
                panic!("division by zero");
            }
            *v % 2 == 0
        });
        let mut errors = split.error_route();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        split.spawn(ctx, input);

        tx.send(Res::success(0)).await.unwrap();
        drop(tx);

        let error = errors.recv().await.unwrap();
        assert!(error.error_ref().source.to_string().contains("division by zero"));
    }
}
