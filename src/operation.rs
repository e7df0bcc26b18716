// Copyright 2021 Joyent, Inc.

use std::any::Any;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::host::Host;

/// A synchronous operation executed against a borrowed connection's client.
///
/// Operations are opaque to the pool. The pool only needs a way to run the
/// operation against a client, a name for logging and metrics, and a routing
/// key for key-aware selection strategies.
pub trait Operation<CL>: Send + Sync {
    /// The value produced by a successful execution.
    type Output;

    /// Run the operation against the client of a borrowed connection.
    fn execute(&self, client: &mut CL) -> Result<Self::Output, Error>;

    /// Human-readable operation name used for logging and metrics.
    fn name(&self) -> &str;

    /// Routing key consumed by key-aware selection strategies. The
    /// round-robin strategy ignores it.
    fn key(&self) -> &str {
        self.name()
    }
}

/// An operation dispatched without blocking on its result.
///
/// The connection implementation owns whatever machinery actually drives the
/// asynchronous work; the pool is strictly a pass-through and makes a single
/// dispatch attempt with no failover.
pub trait AsyncOperation<CL>: Send + Sync {
    /// The value produced when the dispatched operation completes.
    type Output: Send + 'static;

    /// Dispatch the operation against the client of a borrowed connection,
    /// returning a deferred result completed when the work finishes.
    fn execute_async(
        &self,
        client: &mut CL,
    ) -> Result<Deferred<Result<Self::Output, Error>>, Error>;

    /// Human-readable operation name used for logging and metrics.
    fn name(&self) -> &str;

    /// Routing key consumed by key-aware selection strategies.
    fn key(&self) -> &str {
        self.name()
    }
}

/// The outcome of a successful top-level operation: the produced value along
/// with the host that served it, the wall-clock latency measured from entry
/// into the pool, and the number of attempts made.
#[derive(Debug)]
pub struct OperationResult<R> {
    value: R,
    host: Host,
    latency: Duration,
    attempts: usize,
}

impl<R> OperationResult<R> {
    pub(crate) fn new(
        value: R,
        host: Host,
        latency: Duration,
        attempts: usize,
    ) -> Self {
        OperationResult {
            value,
            host,
            latency,
            attempts,
        }
    }

    /// The value produced by the operation.
    pub fn value(&self) -> &R {
        &self.value
    }

    /// Consume the result, yielding the produced value.
    pub fn into_value(self) -> R {
        self.value
    }

    /// The host that served the operation.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Wall-clock latency from entry into the pool, not per-attempt.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// The number of attempts made, including the successful one.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

/// A minimal future for the pool's thread-based world. A `Deferred` is
/// either ready at construction or completed later through the `Completion`
/// handle returned by [`Deferred::pending`].
pub struct Deferred<T>(DeferredInner<T>);

enum DeferredInner<T> {
    Ready(T),
    Pending(Receiver<T>),
}

impl<T> Deferred<T> {
    /// A deferred value that is ready on return.
    pub fn ready(value: T) -> Self {
        Deferred(DeferredInner::Ready(value))
    }

    /// A deferred value completed later by the paired `Completion` handle.
    pub fn pending() -> (Completion<T>, Deferred<T>) {
        let (tx, rx) = channel();
        (Completion(tx), Deferred(DeferredInner::Pending(rx)))
    }

    /// Block until the value is available. Fails if the `Completion` handle
    /// was dropped without completing.
    pub fn wait(self) -> Result<T, Error> {
        match self.0 {
            DeferredInner::Ready(value) => Ok(value),
            DeferredInner::Pending(rx) => rx.recv().map_err(|_| {
                Error::Unexpected(String::from(
                    "deferred value dropped before completion",
                ))
            }),
        }
    }
}

/// The writing half of a pending [`Deferred`].
pub struct Completion<T>(Sender<T>);

impl<T> Completion<T> {
    /// Complete the paired `Deferred`. If the reader has already gone away
    /// the value is discarded.
    pub fn complete(self, value: T) {
        let _ = self.0.send(value);
    }
}

/// The in-flight result of [`ConnectionPool::execute_async`]
/// (../connection_pool/struct.ConnectionPool.html#method.execute_async).
///
/// A single dispatch attempt is made; there is no failover behind this
/// future. When the pool is configured to hold the borrowed connection for
/// the duration of the asynchronous operation, the lease rides inside this
/// value and the connection returns to its host pool when the future is
/// consumed or dropped.
pub struct OperationFuture<R> {
    deferred: Deferred<Result<R, Error>>,
    host: Host,
    start: Instant,
    lease: Option<Box<dyn Any + Send>>,
}

impl<R> OperationFuture<R> {
    pub(crate) fn new(
        deferred: Deferred<Result<R, Error>>,
        host: Host,
        start: Instant,
        lease: Option<Box<dyn Any + Send>>,
    ) -> Self {
        OperationFuture {
            deferred,
            host,
            start,
            lease,
        }
    }

    /// The host the operation was dispatched to.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Block until the dispatched operation completes.
    pub fn wait(self) -> Result<OperationResult<R>, Error> {
        let OperationFuture {
            deferred,
            host,
            start,
            lease,
        } = self;
        let outcome = deferred.wait();
        drop(lease);
        let value = outcome??;
        Ok(OperationResult::new(value, host, start.elapsed(), 1))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn deferred_ready() {
        let deferred = Deferred::ready(7);
        assert_eq!(deferred.wait().unwrap(), 7);
    }

    #[test]
    fn deferred_completed_from_another_thread() {
        let (completion, deferred) = Deferred::pending();
        let completer = thread::spawn(move || completion.complete(11));
        assert_eq!(deferred.wait().unwrap(), 11);
        completer.join().unwrap();
    }

    #[test]
    fn deferred_abandoned() {
        let (completion, deferred) = Deferred::<u32>::pending();
        drop(completion);
        assert!(deferred.wait().is_err());
    }
}
