//! Router — §4.15.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::processor::{invoke_guarded, recv_or_cancel, send_or_cancel, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// Whether [`Router`] sends a matching item to only its first matching
/// predicate, or to every predicate that matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    FirstMatch,
    AllMatches,
}

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send>;

/// Evaluates multiple named predicates against each successful item,
/// forwarding it to every matching route's channel (or only the first,
/// per [`RouterMode`]); unmatched items go to a default route.
pub struct Router<T> {
    name: String,
    mode: RouterMode,
    predicates: Vec<(String, Predicate<T>)>,
    route_txs: Vec<mpsc::Sender<Res<T>>>,
    default_tx: mpsc::Sender<Res<T>>,
    default_rx: Option<mpsc::Receiver<Res<T>>>,
    error_tx: mpsc::Sender<Res<T>>,
    error_rx: Option<mpsc::Receiver<Res<T>>>,
}

impl<T> Router<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, mode: RouterMode) -> Self {
        let (default_tx, default_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            mode,
            predicates: Vec::new(),
            route_txs: Vec::new(),
            default_tx,
            default_rx: Some(default_rx),
            error_tx,
            error_rx: Some(error_rx),
        }
    }

    /// Registers a named predicate and returns its receiver.
    pub fn add_route(
        &mut self,
        name: impl Into<String>,
        predicate: impl Fn(&T) -> bool + Send + 'static,
    ) -> mpsc::Receiver<Res<T>> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        self.predicates.push((name.into(), Box::new(predicate)));
        self.route_txs.push(tx);
        rx
    }

    /// The channel items with no matching predicate are sent to.
    pub fn default_route(&mut self) -> mpsc::Receiver<Res<T>> {
        self.default_rx.take().expect("default_route already taken")
    }

    pub fn error_route(&mut self) -> mpsc::Receiver<Res<T>> {
        self.error_rx.take().expect("error_route already taken")
    }

    pub fn spawn(self, ctx: CancellationToken, mut input: mpsc::Receiver<Res<T>>) {
        tokio::spawn(async move {
            let Router {
                name,
                mode,
                predicates,
                route_txs,
                default_tx,
                error_tx,
                ..
            } = self;

            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                match item.as_success() {
                    Some(value) => {
                        let mut matched = false;
                        let mut panic_err = None;
                        for (tx, (_, predicate)) in route_txs.iter().zip(predicates.iter()) {
                            match invoke_guarded(|| predicate(value)) {
                                Ok(true) => {
                                    matched = true;
                                    if !send_or_cancel(tx, item.clone(), &ctx).await {
                                        return;
                                    }
                                    if mode == RouterMode::FirstMatch {
                                        break;
                                    }
                                }
                                Ok(false) => {}
                                Err(panic) => {
                                    panic_err = Some(panic);
                                    break;
                                }
                            }
                        }
                        if let Some(panic) = panic_err {
                            let failed = Res::error(item.into_success_or_none(), panic, name.clone());
                            if !send_or_cancel(&error_tx, failed, &ctx).await {
                                return;
                            }
                        } else if !matched && !send_or_cancel(&default_tx, item, &ctx).await {
                            return;
                        }
                    }
                    None => {
                        if !send_or_cancel(&error_tx, item.chain_push(name.clone()), &ctx).await {
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
    async fn first_match_mode_stops_at_the_first_predicate() {
        let mut router = Router::new("router", RouterMode::FirstMatch);
        let mut gt_zero = router.add_route("gt_zero", |v: &i32| *v > 0);
        let mut even = router.add_route("even", |v: &i32| v % 2 == 0);
        let mut default = router.default_route();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        router.spawn(ctx, input);

        tx.send(Res::success(4)).await.unwrap();
        tx.send(Res::success(-1)).await.unwrap();
        drop(tx);

        assert_eq!(*gt_zero.recv().await.unwrap().value(), 4);
        assert!(even.recv().await.is_none(), "first-match stops before the second predicate");
        assert_eq!(*default.recv().await.unwrap().value(), -1);
    }

    #[tokio::test]
    async fn all_matches_mode_fans_out_to_every_matching_route() {
        let mut router = Router::new("router", RouterMode::AllMatches);
        let mut gt_zero = router.add_route("gt_zero", |v: &i32| *v > 0);
        let mut even = router.add_route("even", |v: &i32| v % 2 == 0);
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        router.spawn(ctx, input);

        tx.send(Res::success(4)).await.unwrap();
        drop(tx);

        assert_eq!(*gt_zero.recv().await.unwrap().value(), 4);
        assert_eq!(*even.recv().await.unwrap().value(), 4);
    }

    #[tokio::test]
    async fn errored_input_has_the_processor_name_appended_to_its_chain() {
        let mut router = Router::new("router", RouterMode::FirstMatch);
        let mut errors = router.error_route();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        router.spawn(ctx, input);

        tx.send(Res::error(None::<i32>, std::io::Error::other("x"), "source")).await.unwrap();
        drop(tx);

        let error = errors.recv().await.unwrap();
        assert_eq!(error.error_ref().chain, vec!["source", "router"]);
    }

    #[tokio::test]
    async fn panicking_predicate_is_converted_into_an_error_result() {
        let mut router = Router::new("router", RouterMode::FirstMatch);
        let _gt_zero = router.add_route("gt_zero", |v: &i32| {
            if *v == 0 {
                panic!("division by zero");
            }
            *v > 0
        });
        let mut errors = router.error_route();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        router.spawn(ctx, input);

        tx.send(Res::success(0)).await.unwrap();
        drop(tx);

        let error = errors.recv().await.unwrap();
        assert!(error.error_ref().source.to_string().contains("division by zero"));
    }
}
