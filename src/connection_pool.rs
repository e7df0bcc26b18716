// Copyright 2021 Joyent, Inc.

pub mod types;

use std::any::Any;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use backoff::{ExponentialBackoff, Operation as BackoffOperation};
use slog::{debug, error, info, o, trace, warn, Drain, Logger};

use crate::connection::{Connection, ConnectionFactory};
use crate::connection_pool::types::ConnectionPoolOptions;
use crate::error::Error;
use crate::health::ConnectionPoolHealthTracker;
use crate::host::Host;
use crate::host_pool::HostConnectionPool;
use crate::monitor::{ConnectionPoolMonitor, CountingMonitor};
use crate::operation::{
    AsyncOperation, Deferred, Operation, OperationFuture, OperationResult,
};
use crate::retry::{RetryPolicyFactory, RunOnceFactory};
use crate::selection::{HostSelectionStrategy, RoundRobinSelection};

// Default number of connections maintained per host
const DEFAULT_CONNECTIONS_PER_HOST: u32 = 3;
// Default borrow timeout in milliseconds when host pools are saturated
const DEFAULT_MAX_TIMEOUT_WHEN_EXHAUSTED: u64 = 2000;
// Default grace period in milliseconds for outstanding borrows at shutdown
const DEFAULT_SHUTDOWN_GRACE_PERIOD: u64 = 5000;
// Cap on the recovery worker's reconnect backoff
const RECOVERY_BACKOFF_CEILING: Duration = Duration::from_secs(30);

// Work items for the shared recovery worker. The worker is a single thread
// on purpose: it serializes connection births across every host pool so a
// flapping backend cannot stampede the network with reconnects.
pub(crate) enum RecoveryMsg {
    Replace(Host),
    Stop,
}

// State shared between the pool handles and the recovery worker.
struct PoolCore<C, F>
where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    host_pools: RwLock<HashMap<Host, HostConnectionPool<C>>>,
    selection: RoundRobinSelection<C>,
    health: ConnectionPoolHealthTracker,
    factory: F,
    monitor: Arc<dyn ConnectionPoolMonitor>,
    retry_factory: Arc<dyn RetryPolicyFactory>,
    connections_per_host: u32,
    max_timeout_when_exhausted: Duration,
    shutdown_grace_period: Duration,
    return_connection_on_async_dispatch: bool,
}

/// A connection pool spanning the hosts of a multi-node service, with
/// automatic failover between them.
///
/// Hosts are registered with [`add_host`](#method.add_host) and removed
/// either explicitly or by passive eviction when their error rate trips a
/// configured rule. Operations submitted through
/// [`execute_with_failover`](#method.execute_with_failover) are dispatched
/// to a host chosen by round-robin rotation and retried on other hosts
/// according to the configured retry policy.
///
/// The pool is cheap to clone and all clones share the same state, but the
/// pool lifecycle belongs to the original instance: only it may invoke
/// [`shutdown`](#method.shutdown).
pub struct ConnectionPool<C, F>
where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    core: Arc<PoolCore<C, F>>,
    recovery_tx: Sender<RecoveryMsg>,
    recovery_thread: Option<thread::JoinHandle<()>>,
    log: Logger,
}

impl<C, F> Clone for ConnectionPool<C, F>
where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    fn clone(&self) -> ConnectionPool<C, F> {
        ConnectionPool {
            core: Arc::clone(&self.core),
            recovery_tx: self.recovery_tx.clone(),
            recovery_thread: None,
            log: self.log.clone(),
        }
    }
}

impl<C, F> ConnectionPool<C, F>
where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    pub fn new(cpo: ConnectionPoolOptions, factory: F) -> Self {
        let logger = cpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let monitor = cpo
            .monitor
            .unwrap_or_else(|| Arc::new(CountingMonitor::new()));
        let retry_factory = cpo
            .retry_policy_factory
            .unwrap_or_else(|| Arc::new(RunOnceFactory));
        let health = ConnectionPoolHealthTracker::new(
            cpo.error_check_config.unwrap_or_default(),
        );

        let core = Arc::new(PoolCore {
            host_pools: RwLock::new(HashMap::new()),
            selection: RoundRobinSelection::new(),
            health,
            factory,
            monitor,
            retry_factory,
            connections_per_host: cpo
                .connections_per_host
                .unwrap_or(DEFAULT_CONNECTIONS_PER_HOST),
            max_timeout_when_exhausted: Duration::from_millis(
                cpo.max_timeout_when_exhausted_ms
                    .unwrap_or(DEFAULT_MAX_TIMEOUT_WHEN_EXHAUSTED),
            ),
            shutdown_grace_period: Duration::from_millis(
                cpo.shutdown_grace_period_ms
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_PERIOD),
            ),
            return_connection_on_async_dispatch: cpo
                .return_connection_on_async_dispatch
                .unwrap_or(true),
        });

        // Spawn the shared recovery worker
        let (recovery_tx, recovery_rx) = channel();
        let worker_core = Arc::clone(&core);
        let worker_log = logger.clone();
        let recovery_thread = thread::spawn(move || {
            recovery_loop(recovery_rx, worker_core, worker_log)
        });

        ConnectionPool {
            core,
            recovery_tx,
            recovery_thread: Some(recovery_thread),
            log: logger,
        }
    }

    /// Register `host` and prime its connections. Returns true iff the host
    /// is now present and Active. A host that is already registered is left
    /// alone and the call returns false; if priming fails the registration
    /// is rolled back and the call returns false.
    pub fn add_host(&self, host: Host) -> bool {
        let pool = {
            let mut host_pools = self.core.host_pools.write().unwrap();
            if host_pools.contains_key(&host) {
                debug!(
                    self.log,
                    "host pool already exists, ignoring add";
                    "host" => %host
                );
                return false;
            }
            let pool = HostConnectionPool::new(
                host.clone(),
                self.core.connections_per_host,
                Arc::clone(&self.core.monitor),
                self.recovery_tx.clone(),
                self.log.new(o!("host" => host.to_string())),
            );
            host_pools.insert(host.clone(), pool.clone());
            pool
        };

        info!(self.log, "adding host pool"; "host" => %host);
        match pool.prime_connections(&self.core.factory) {
            Ok(()) => {
                self.core.selection.add_host(pool);
                self.core.monitor.host_added(&host);
                true
            }
            Err(e) => {
                info!(
                    self.log,
                    "failed to prime host pool, rolling back";
                    "host" => %host,
                    "error" => %e
                );
                self.core.host_pools.write().unwrap().remove(&host);
                false
            }
        }
    }

    /// Remove `host` from the rotation and shut its pool down. Returns true
    /// iff the host was present.
    pub fn remove_host(&self, host: &Host) -> bool {
        let removed = self.core.host_pools.write().unwrap().remove(host);
        match removed {
            Some(pool) => {
                info!(self.log, "removing host pool"; "host" => %host);
                self.core.selection.remove_host(host);
                self.core.monitor.host_removed(host);
                self.core.health.forget_host(host);
                pool.shutdown(self.core.shutdown_grace_period);
                true
            }
            None => false,
        }
    }

    /// True iff `host` is registered, whether or not its pool is Active.
    pub fn has_host(&self, host: &Host) -> bool {
        self.core.host_pools.read().unwrap().contains_key(host)
    }

    /// True iff `host` is registered and its pool is Active.
    pub fn is_host_up(&self, host: &Host) -> bool {
        self.core
            .host_pools
            .read()
            .unwrap()
            .get(host)
            .map(|pool| pool.is_active())
            .unwrap_or(false)
    }

    /// Handles to every registered host pool.
    pub fn get_pools(&self) -> Vec<HostConnectionPool<C>> {
        self.core
            .host_pools
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    /// Handles to the host pools currently in the Active state.
    pub fn get_active_pools(&self) -> Vec<HostConnectionPool<C>> {
        self.core
            .host_pools
            .read()
            .unwrap()
            .values()
            .filter(|pool| pool.is_active())
            .cloned()
            .collect()
    }

    /// The pool for `host`, if registered.
    pub fn get_host_pool(&self, host: &Host) -> Option<HostConnectionPool<C>> {
        self.core.host_pools.read().unwrap().get(host).cloned()
    }

    /// Apply a topology delta: add every host in `hosts_up`, then remove
    /// every host in `hosts_down`. The returned future is ready on return
    /// and reports whether anything changed.
    pub fn update_hosts(
        &self,
        hosts_up: Vec<Host>,
        hosts_down: Vec<Host>,
    ) -> Deferred<bool> {
        let mut changed = false;
        for host in hosts_up {
            changed |= self.add_host(host);
        }
        for host in hosts_down {
            changed |= self.remove_host(&host);
        }
        Deferred::ready(changed)
    }

    /// Prime every registered host that is not yet Active. The returned
    /// future is ready on return and reports whether every host primed.
    pub fn start(&self) -> Deferred<bool> {
        let mut all_active = true;
        for pool in self.get_pools() {
            if pool.is_active() {
                continue;
            }
            match pool.prime_connections(&self.core.factory) {
                Ok(()) => {
                    self.core.selection.add_host(pool.clone());
                    self.core.monitor.host_added(pool.host());
                }
                Err(e) => {
                    warn!(
                        self.log,
                        "failed to prime host pool";
                        "host" => %pool.host(),
                        "error" => %e
                    );
                    all_active = false;
                }
            }
        }
        Deferred::ready(all_active)
    }

    /// Remove every host and stop the recovery worker. This function may
    /// only be called on the original pool instance: thread JoinHandles may
    /// not be cloned, so invocation by a clone of the pool results in an
    /// error.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        if self.recovery_thread.is_none() {
            trace!(self.log, "shutdown called by pool clone");
            return Err(Error::ShutdownCalledByClone);
        }

        debug!(self.log, "shutting down connection pool");
        let hosts: Vec<Host> = self
            .core
            .host_pools
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        for host in hosts {
            self.remove_host(&host);
        }

        if self.recovery_tx.send(RecoveryMsg::Stop).is_err() {
            warn!(self.log, "recovery worker already stopped");
        }
        let recovery_thread = self.recovery_thread.take().unwrap();
        let _ = recovery_thread.join();
        trace!(self.log, "shutdown: joined recovery worker");
        Ok(())
    }

    /// Execute `op` against a connection borrowed from a host chosen by the
    /// selection strategy, retrying on other hosts per the configured retry
    /// policy.
    ///
    /// `NoAvailableHosts` is never retried: there is nowhere to go. A
    /// connection-level error feeds the health tracker and may evict the
    /// host from the rotation, but the failing call itself surfaces the
    /// underlying error; eviction affects subsequent calls. The borrowed
    /// connection is always returned before the next attempt.
    pub fn execute_with_failover<O>(
        &self,
        op: &O,
    ) -> Result<OperationResult<O::Output>, Error>
    where
        O: Operation<C::Client>,
    {
        let start_time = Instant::now();
        let mut retry = self.core.retry_factory.retry_policy();
        retry.begin();
        let mut last_error: Option<Error> = None;

        loop {
            match self.core.selection.get_connection(
                Some(op.key()),
                self.core.max_timeout_when_exhausted,
            ) {
                Err(e) => {
                    // Selection-level failure: no connection was involved,
                    // so there is nothing to feed the health tracker.
                    self.core.monitor.operation_failure(None, &e);
                    if !e.is_retryable() {
                        // No active hosts: there is nowhere to go.
                        return Err(e);
                    }
                    retry.failure(&e);
                    debug!(
                        self.log,
                        "connection selection failed";
                        "op" => op.name(),
                        "error" => %e
                    );
                    last_error = Some(e);
                }
                Ok(mut conn) => match conn.execute(op) {
                    Ok(value) => {
                        retry.success();
                        let latency = start_time.elapsed();
                        self.core
                            .monitor
                            .operation_success(conn.host(), latency);
                        let attempts = retry.attempt_count() + 1;
                        let host = conn.host().clone();
                        drop(conn);
                        return Ok(OperationResult::new(
                            value, host, latency, attempts,
                        ));
                    }
                    Err(e) => {
                        if !e.is_retryable() {
                            // Non-domain failure from user code: surface it
                            // without failover. The guard drop returns the
                            // connection.
                            return Err(e);
                        }

                        retry.failure(&e);
                        self.core
                            .monitor
                            .operation_failure(Some(conn.host()), &e);
                        if retry.allow_retry() {
                            self.core.monitor.failover(conn.host(), &e);
                        }
                        debug!(
                            self.log,
                            "operation attempt failed";
                            "op" => op.name(),
                            "host" => %conn.host(),
                            "error" => %e
                        );

                        let host = conn.host().clone();
                        let evict = e.is_fatal()
                            && self
                                .core
                                .health
                                .track_connection_error(&host, &e);
                        last_error = Some(e);

                        // Return the connection before evicting the host so
                        // the draining pool is not waiting on our borrow.
                        drop(conn);
                        if evict {
                            warn!(
                                self.log,
                                "evicting host after repeated fatal errors";
                                "host" => %host
                            );
                            self.remove_host(&host);
                        }
                    }
                },
            }

            if !retry.allow_retry() {
                return Err(
                    last_error.take().unwrap_or(Error::NoAvailableHosts)
                );
            }
        }
    }

    /// Dispatch `op` asynchronously on a connection borrowed from a host
    /// chosen by the selection strategy. A single attempt is made; errors at
    /// selection or dispatch are reported to the monitor and surfaced, never
    /// retried.
    ///
    /// By default the borrowed connection is returned to its host pool as
    /// soon as the dispatch succeeds, while the underlying work is still
    /// outstanding; see
    /// [`ConnectionPoolOptions::return_connection_on_async_dispatch`]
    /// (types/struct.ConnectionPoolOptions.html).
    pub fn execute_async<O>(
        &self,
        op: &O,
    ) -> Result<OperationFuture<O::Output>, Error>
    where
        O: AsyncOperation<C::Client>,
    {
        let start_time = Instant::now();
        match self.core.selection.get_connection(
            Some(op.key()),
            self.core.max_timeout_when_exhausted,
        ) {
            Err(e) => {
                self.core.monitor.operation_failure(None, &e);
                Err(e)
            }
            Ok(mut conn) => match conn.execute_async(op) {
                Ok(deferred) => {
                    let host = conn.host().clone();
                    self.core
                        .monitor
                        .operation_success(&host, start_time.elapsed());
                    let lease: Option<Box<dyn Any + Send>> =
                        if self.core.return_connection_on_async_dispatch {
                            drop(conn);
                            None
                        } else {
                            Some(Box::new(conn))
                        };
                    Ok(OperationFuture::new(
                        deferred, host, start_time, lease,
                    ))
                }
                Err(e) => {
                    self.core
                        .monitor
                        .operation_failure(Some(conn.host()), &e);
                    let host = conn.host().clone();
                    let evict = e.is_fatal()
                        && self.core.health.track_connection_error(&host, &e);
                    drop(conn);
                    if evict {
                        warn!(
                            self.log,
                            "evicting host after repeated fatal errors";
                            "host" => %host
                        );
                        self.remove_host(&host);
                    }
                    Err(e)
                }
            },
        }
    }
}

impl<C, F> Drop for ConnectionPool<C, F>
where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    fn drop(&mut self) {
        // Shut the pool down and ignore the result. The returned Result
        // will be an Err if the pool instance going out of scope is a
        // clone, and there is no further error handling to be done here.
        let _ = self.shutdown();
    }
}

fn recovery_loop<C, F>(
    rx: Receiver<RecoveryMsg>,
    core: Arc<PoolCore<C, F>>,
    log: Logger,
) where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    let mut done = false;
    while !done {
        match rx.recv() {
            Ok(RecoveryMsg::Replace(host)) => {
                replace_connection(&core, &host, &log)
            }
            Ok(RecoveryMsg::Stop) | Err(_) => done = true,
        }
    }
    trace!(log, "recovery worker exiting");
}

// Establish a replacement for a discarded connection. Runs on the single
// recovery worker thread; connect attempts use an exponential backoff so a
// down host does not turn the worker into a reconnect hot loop.
fn replace_connection<C, F>(
    core: &Arc<PoolCore<C, F>>,
    host: &Host,
    log: &Logger,
) where
    C: Connection,
    F: ConnectionFactory<Conn = C>,
{
    let pool = core.host_pools.read().unwrap().get(host).cloned();
    let pool = match pool {
        Some(pool) if pool.is_active() => pool,
        _ => {
            debug!(
                log,
                "skipping replacement for departed host";
                "host" => %host
            );
            return;
        }
    };

    let mut backoff = ExponentialBackoff::default();
    backoff.max_elapsed_time = Some(RECOVERY_BACKOFF_CEILING);

    let mut op = || -> Result<C, backoff::Error<Error>> {
        debug!(log, "attempting replacement connection"; "host" => %host);
        let mut conn = core.factory.create_connection(host).map_err(|e| {
            error!(
                log,
                "replacement create failed, retrying";
                "host" => %host,
                "error" => %e
            );
            e
        })?;
        conn.open().map_err(|e| {
            error!(
                log,
                "replacement open failed, retrying";
                "host" => %host,
                "error" => %e
            );
            e
        })?;
        Ok(conn)
    };

    match op.retry(&mut backoff) {
        Ok(conn) => {
            pool.add_connection(conn);
            info!(log, "replacement connection established"; "host" => %host);
        }
        Err(backoff::Error::Transient(e))
        | Err(backoff::Error::Permanent(e)) => {
            core.monitor.connection_create_failed(host, &e);
            error!(
                log,
                "giving up establishing replacement connection";
                "host" => %host,
                "error" => %e
            );
        }
    }
}
