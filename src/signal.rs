//! Single-resolution asynchronous signals
//!
//! A [`Signal`] is a cloneable future that completes exactly once, with either
//! a value or a [`SpaError`]. Every clone observes the same outcome. The
//! matching [`Resolver`] is consumed when it completes the signal, so a
//! resolved value can never change.

use crate::error::SpaError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, SpaError>>>;

/// Write side of a [`Signal`]
pub struct Resolver<T> {
    tx: oneshot::Sender<Result<T, SpaError>>,
}

impl<T> Resolver<T> {
    pub fn resolve(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: SpaError) {
        self.complete(Err(error));
    }

    pub fn complete(self, outcome: Result<T, SpaError>) {
        // No receivers left means nobody can observe the outcome any more
        let _ = self.tx.send(outcome);
    }
}

/// Read side: a shared, single-resolution future
pub struct Signal<T> {
    inner: SharedOutcome<T>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("resolved", &self.inner.peek().is_some())
            .finish()
    }
}

/// Create a pending signal together with its resolver.
///
/// Dropping the resolver without completing it fails the signal with a
/// [`SpaError::Startup`].
pub fn channel<T>() -> (Resolver<T>, Signal<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let signal = Signal::from_future(async move {
        rx.await.unwrap_or_else(|_| {
            Err(SpaError::Startup(
                "signal was abandoned before it resolved".to_string(),
            ))
        })
    });
    (Resolver { tx }, signal)
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap a lazily polled future. It makes progress only while awaited, so
    /// [`peek`](Self::peek) stays `None` until some clone has been polled to
    /// completion. Use [`spawn`](Self::spawn) for an outcome that settles on
    /// its own.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, SpaError>> + Send + 'static,
    {
        Self {
            inner: future.boxed().shared(),
        }
    }

    /// Run `future` on the runtime so it completes even if nobody is waiting
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, SpaError>> + Send + 'static,
    {
        let (resolver, signal) = channel();
        tokio::spawn(async move {
            resolver.complete(future.await);
        });
        signal
    }

    pub fn resolved(value: T) -> Self {
        Self::from_future(futures::future::ready(Ok(value)))
    }

    pub fn failed(error: SpaError) -> Self {
        Self::from_future(futures::future::ready(Err(error)))
    }

    /// The outcome if some clone has already been polled to completion
    pub fn peek(&self) -> Option<Result<T, SpaError>> {
        self.inner.peek().cloned()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.peek().is_some()
    }

    pub async fn wait(&self) -> Result<T, SpaError> {
        self.inner.clone().await
    }

    /// Wait with a caller-imposed deadline
    pub async fn wait_timeout(&self, timeout: Duration, what: &str) -> Result<T, SpaError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SpaError::ResolutionTimeout {
                what: what.to_string(),
                timeout,
            }),
        }
    }

    /// Derive a signal that resolves with `f` applied to this one's value.
    ///
    /// The result is lazy like [`from_future`](Self::from_future): each call
    /// builds a new signal whose [`peek`](Self::peek) reflects only its own
    /// polling. Keep one derived signal when its state is inspected later.
    pub fn map<U, F>(&self, f: F) -> Signal<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let source = self.clone();
        Signal::from_future(async move { source.wait().await.map(f) })
    }
}
