//! Operation contracts for wrapped calls, fallbacks and health checks
//!
//! The calling convention is picked explicitly when an operation is built:
//! [`Operation::new`] takes an async closure, [`Operation::from_callback`] takes
//! a closure that reports its result through a [`Done`] handle. Both end up
//! as the same boxed future.

use crate::BoxError;
use crate::errors::CallbackDropped;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Future returned by every operation
pub type OperationFuture<T> = BoxFuture<'static, Result<T, BoxError>>;

type CallFn<A, T> = Arc<dyn Fn(A) -> OperationFuture<T> + Send + Sync>;

/// A callable remote operation (or fallback) taking `A` and yielding `T`
pub struct Operation<A, T> {
    call: CallFn<A, T>,
}

impl<A, T> Operation<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// Wrap an async closure
    ///
    /// ```rust
    /// use brakes::{BoxError, Operation};
    ///
    /// let lookup = Operation::new(|id: u32| async move { Ok::<_, BoxError>(id * 2) });
    /// # let _ = lookup;
    /// ```
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Self {
            call: Arc::new(move |args| f(args).boxed()),
        }
    }

    /// Wrap a callback-style closure that completes through [`Done`]
    ///
    /// Dropping the handle without completing it fails the call with
    /// [`CallbackDropped`].
    pub fn from_callback<F>(f: F) -> Self
    where
        F: Fn(A, Done<T>) + Send + Sync + 'static,
    {
        Self::new(move |args| {
            let (tx, rx) = oneshot::channel();
            f(args, Done { tx });
            async move {
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(Box::new(CallbackDropped) as BoxError),
                }
            }
        })
    }

    /// Start the operation
    pub fn call(&self, args: A) -> OperationFuture<T> {
        (self.call)(args)
    }
}

impl<A, T> Clone for Operation<A, T> {
    fn clone(&self) -> Self {
        Self {
            call: Arc::clone(&self.call),
        }
    }
}

impl<A, T> std::fmt::Debug for Operation<A, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("call", &"<closure>")
            .finish()
    }
}

/// Completion handle handed to callback-style operations
#[derive(Debug)]
pub struct Done<T> {
    tx: oneshot::Sender<Result<T, BoxError>>,
}

impl<T> Done<T> {
    pub fn complete(self, result: Result<T, BoxError>) {
        // the caller may have timed out and stopped listening
        let _ = self.tx.send(result);
    }

    pub fn ok(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn err(self, error: impl Into<BoxError>) {
        self.complete(Err(error.into()));
    }
}

/// Recovery probe used instead of the fixed reopen timer
///
/// `Ok(())` means the dependency looks healthy and the circuit may close.
#[derive(Clone)]
pub struct HealthCheck {
    probe: Operation<(), ()>,
}

impl HealthCheck {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            probe: Operation::new(move |()| f()),
        }
    }

    pub fn from_callback<F>(f: F) -> Self
    where
        F: Fn(Done<()>) + Send + Sync + 'static,
    {
        Self {
            probe: Operation::from_callback(move |(), done| f(done)),
        }
    }

    pub fn probe(&self) -> OperationFuture<()> {
        self.probe.call(())
    }
}

impl std::fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheck")
            .field("probe", &"<closure>")
            .finish()
    }
}
