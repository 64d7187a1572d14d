//! Startup barrier: one composite readiness signal over many subsystems

use crate::error::SpaError;
use crate::signal::Signal;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

struct BarrierState {
    aggregate: Signal<()>,
    registered: usize,
}

struct BarrierInner {
    state: Mutex<BarrierState>,
    /// Bumped on every registration so waiters can notice late arrivals
    generation: watch::Sender<u64>,
}

/// Aggregates independently registered readiness signals.
///
/// Cloning is cheap and every clone shares the same registrations.
#[derive(Clone)]
pub struct StartupBarrier {
    inner: Arc<BarrierInner>,
}

impl Default for StartupBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupBarrier {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(BarrierInner {
                state: Mutex::new(BarrierState {
                    aggregate: Signal::resolved(()),
                    registered: 0,
                }),
                generation,
            }),
        }
    }

    /// Add one more signal to the aggregate.
    ///
    /// The previous aggregate is kept as one side of the new join, so progress
    /// already made on it is not lost.
    pub fn register(&self, signal: Signal<()>) {
        let mut state = self.inner.state.lock();
        let previous = state.aggregate.clone();
        state.aggregate = Signal::from_future(async move {
            futures::future::try_join(previous.wait(), signal.wait())
                .await
                .map(|_| ())
        });
        state.registered += 1;
        self.inner.generation.send_modify(|generation| *generation += 1);
        debug!(registered = state.registered, "Startup task registered");
    }

    /// Number of signals registered so far
    pub fn len(&self) -> usize {
        self.inner.state.lock().registered
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once every signal registered before or during the wait has
    /// resolved. Fails as soon as any of them fails.
    pub async fn when_ready(&self) -> Result<(), SpaError> {
        let mut generation = self.inner.generation.subscribe();
        loop {
            let aggregate = {
                let state = self.inner.state.lock();
                generation.borrow_and_update();
                state.aggregate.clone()
            };

            tokio::select! {
                biased;
                outcome = aggregate.wait() => {
                    outcome?;
                    if !generation.has_changed().unwrap_or(false) {
                        return Ok(());
                    }
                }
                _ = generation.changed() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::channel;
    use std::time::Duration;

    #[tokio::test]
    async fn test_empty_barrier_is_ready() {
        let barrier = StartupBarrier::new();
        assert!(barrier.is_empty());
        barrier.when_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_waits_for_all_signals() {
        let barrier = StartupBarrier::new();
        let (first, first_signal) = channel();
        let (second, second_signal) = channel();
        barrier.register(first_signal);
        barrier.register(second_signal);
        assert_eq!(barrier.len(), 2);

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.when_ready().await })
        };

        first.resolve(());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        second.resolve(());
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_registration_during_wait_is_observed() {
        let barrier = StartupBarrier::new();
        let (first, first_signal) = channel();
        barrier.register(first_signal);

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.when_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (late, late_signal) = channel();
        barrier.register(late_signal);
        first.resolve(());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        late.resolve(());
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_late_resolved_signal_still_counts() {
        let barrier = StartupBarrier::new();
        let (first, first_signal) = channel();
        barrier.register(first_signal);

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.when_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        barrier.register(Signal::failed(SpaError::Startup("compiler crashed".into())));
        first.resolve(());

        assert_eq!(
            waiter.await.unwrap(),
            Err(SpaError::Startup("compiler crashed".into()))
        );
    }

    #[tokio::test]
    async fn test_fail_fast_while_others_pending() {
        let barrier = StartupBarrier::new();
        let (_never, pending) = channel::<()>();
        let (failing, failing_signal) = channel::<()>();
        barrier.register(pending);
        barrier.register(failing_signal);

        failing.fail(SpaError::Startup("no such binary".into()));

        let outcome = tokio::time::timeout(Duration::from_secs(1), barrier.when_ready())
            .await
            .expect("failure must not wait for pending signals");
        assert_eq!(outcome, Err(SpaError::Startup("no such binary".into())));
    }
}
