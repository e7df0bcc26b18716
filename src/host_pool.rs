// Copyright 2021 Joyent, Inc.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use slog::{debug, info, warn, Logger};

use crate::connection::{Connection, ConnectionFactory};
use crate::connection_pool::types::{
    ConnectionCount, HostPoolStats, PoolState,
};
use crate::connection_pool::RecoveryMsg;
use crate::error::Error;
use crate::host::Host;
use crate::monitor::ConnectionPoolMonitor;

// The internal data structures of a host pool, guarded by its mutex.
struct PoolData<C> {
    state: PoolState,
    available: VecDeque<C>,
    borrowed: ConnectionCount,
    created: ConnectionCount,
    closed: ConnectionCount,
}

struct HostPoolInner<C> {
    host: Host,
    capacity: u32,
    data: Mutex<PoolData<C>>,
    condvar: Condvar,
    monitor: Arc<dyn ConnectionPoolMonitor>,
    recovery_tx: Mutex<Sender<RecoveryMsg>>,
    log: Logger,
}

/// A bounded pool of live connections to a single host.
///
/// All connections are created up front by [`prime_connections`]
/// (#method.prime_connections) or by the shared recovery worker; a borrow
/// never creates one. Borrowing is a timed blocking acquire: callers wait on
/// the pool condvar until a connection is returned or the timeout elapses.
///
/// The handle is cheap to clone and all clones operate on the same pool.
pub struct HostConnectionPool<C: Connection>(Arc<HostPoolInner<C>>);

impl<C: Connection> Clone for HostConnectionPool<C> {
    fn clone(&self) -> Self {
        HostConnectionPool(Arc::clone(&self.0))
    }
}

impl<C: Connection> HostConnectionPool<C> {
    pub(crate) fn new(
        host: Host,
        capacity: u32,
        monitor: Arc<dyn ConnectionPoolMonitor>,
        recovery_tx: Sender<RecoveryMsg>,
        log: Logger,
    ) -> Self {
        HostConnectionPool(Arc::new(HostPoolInner {
            host,
            capacity,
            data: Mutex::new(PoolData {
                state: PoolState::Initializing,
                available: VecDeque::with_capacity(capacity as usize),
                borrowed: 0.into(),
                created: 0.into(),
                closed: 0.into(),
            }),
            condvar: Condvar::new(),
            monitor,
            recovery_tx: Mutex::new(recovery_tx),
            log,
        }))
    }

    /// The host this pool serves.
    pub fn host(&self) -> &Host {
        &self.0.host
    }

    /// True iff the pool is primed and serving borrow requests.
    pub fn is_active(&self) -> bool {
        self.state() == PoolState::Active
    }

    /// The pool's current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.0.data.lock().unwrap().state
    }

    /// A snapshot of the pool's connection accounting.
    pub fn stats(&self) -> HostPoolStats {
        let data = self.0.data.lock().unwrap();
        HostPoolStats {
            created: data.created,
            closed: data.closed,
            borrowed: data.borrowed,
            available: ConnectionCount::from(data.available.len() as u32),
        }
    }

    /// Eagerly create and open the full complement of connections for this
    /// host and mark the pool Active. On any creation or open failure the
    /// connections established so far are closed and the pool is taken
    /// offline. Calling this on an already Active pool is a no-op.
    pub(crate) fn prime_connections<F>(
        &self,
        factory: &F,
    ) -> Result<(), Error>
    where
        F: ConnectionFactory<Conn = C>,
    {
        {
            let data = self.0.data.lock().unwrap();
            match data.state {
                PoolState::Active => return Ok(()),
                PoolState::Initializing => (),
                _ => {
                    return Err(Error::PoolOffline {
                        host: self.0.host.clone(),
                    })
                }
            }
        }

        let mut primed: Vec<C> = Vec::with_capacity(self.0.capacity as usize);
        for _ in 0..self.0.capacity {
            let conn_result = factory
                .create_connection(&self.0.host)
                .and_then(|mut conn| conn.open().map(|_| conn));
            match conn_result {
                Ok(conn) => {
                    self.0.monitor.connection_created(&self.0.host);
                    primed.push(conn);
                }
                Err(e) => {
                    self.0.monitor.connection_create_failed(&self.0.host, &e);
                    warn!(
                        self.0.log,
                        "failed to prime connection";
                        "host" => %self.0.host,
                        "error" => %e
                    );
                    return self.abort_priming(primed, e);
                }
            }
        }

        let primed_count = ConnectionCount::from(primed.len() as u32);
        let mut data = self.0.data.lock().unwrap();
        match data.state {
            PoolState::Initializing => {
                data.created += primed_count;
                for conn in primed {
                    data.available.push_back(conn);
                }
                data.state = PoolState::Active;
                drop(data);

                info!(
                    self.0.log,
                    "host pool active";
                    "host" => %self.0.host,
                    "connections" => u32::from(primed_count)
                );
                Ok(())
            }
            state => {
                // Another caller finished priming, or shut the pool down,
                // while this batch was being established. Discard the batch.
                data.created += primed_count;
                data.closed += primed_count;
                drop(data);
                for conn in primed {
                    self.close_connection(conn);
                }
                if state == PoolState::Active {
                    Ok(())
                } else {
                    Err(Error::PoolOffline {
                        host: self.0.host.clone(),
                    })
                }
            }
        }
    }

    // Close the partial complement established before a priming failure and
    // take the pool offline.
    fn abort_priming(&self, primed: Vec<C>, error: Error) -> Result<(), Error> {
        let aborted = ConnectionCount::from(primed.len() as u32);
        for mut conn in primed {
            if let Err(e) = conn.close() {
                warn!(
                    self.0.log,
                    "error closing connection while aborting prime";
                    "host" => %self.0.host,
                    "error" => %e
                );
            }
            self.0.monitor.connection_closed(&self.0.host);
        }

        let mut data = self.0.data.lock().unwrap();
        data.created += aborted;
        data.closed += aborted;
        data.state = PoolState::Closed;
        drop(data);

        info!(
            self.0.log,
            "host pool failed to prime";
            "host" => %self.0.host,
            "error" => %error
        );
        Err(Error::PoolOffline {
            host: self.0.host.clone(),
        })
    }

    /// Borrow a connection, blocking until one is returned or `timeout`
    /// elapses. A pool that is not Active refuses with `PoolOffline`; a
    /// timeout with nothing available fails with `PoolExhausted` even while
    /// a replacement is still being recovered.
    pub fn borrow_connection(
        &self,
        timeout: Duration,
    ) -> Result<BorrowedConnection<C>, Error> {
        let deadline = Instant::now() + timeout;
        let mut data = self.0.data.lock().unwrap();

        loop {
            if data.state != PoolState::Active {
                return Err(Error::PoolOffline {
                    host: self.0.host.clone(),
                });
            }

            if let Some(conn) = data.available.pop_front() {
                data.borrowed += 1.into();
                drop(data);
                self.0.monitor.connection_borrowed(&self.0.host);
                return Ok(BorrowedConnection {
                    pool: self.clone(),
                    conn: Some(conn),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::PoolExhausted {
                    host: self.0.host.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            let wait_result = self
                .0
                .condvar
                .wait_timeout(data, deadline - now)
                .unwrap();
            data = wait_result.0;
            if wait_result.1.timed_out() && data.available.is_empty() {
                return Err(Error::PoolExhausted {
                    host: self.0.host.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    // Accept a connection back from a dropped borrow guard. A connection
    // carrying a fatal error is closed and a replacement is requested from
    // the shared recovery worker; a return on a pool that is no longer
    // Active drains by closing the connection on the spot.
    fn return_connection(&self, conn: C) {
        let mut data = self.0.data.lock().unwrap();
        data.borrowed -= 1.into();
        self.0.monitor.connection_returned(&self.0.host);

        if data.state == PoolState::Active {
            let fatal = conn
                .last_error()
                .map(|e| e.is_fatal())
                .unwrap_or(false);
            if fatal {
                data.closed += 1.into();
                drop(data);
                warn!(
                    self.0.log,
                    "discarding connection after fatal error";
                    "host" => %self.0.host
                );
                self.close_connection(conn);
                self.request_recovery();
                self.0.condvar.notify_all();
            } else {
                data.available.push_back(conn);
                drop(data);
                self.0.condvar.notify_one();
            }
        } else {
            // Draining or Closed: late returns drain by closing here
            data.closed += 1.into();
            drop(data);
            self.close_connection(conn);
            self.0.condvar.notify_all();
        }
    }

    fn close_connection(&self, mut conn: C) {
        if let Err(e) = conn.close() {
            warn!(
                self.0.log,
                "error closing connection";
                "host" => %self.0.host,
                "error" => %e
            );
        }
        self.0.monitor.connection_closed(&self.0.host);
    }

    fn request_recovery(&self) {
        let recovery_tx = self.0.recovery_tx.lock().unwrap();
        if recovery_tx
            .send(RecoveryMsg::Replace(self.0.host.clone()))
            .is_err()
        {
            debug!(
                self.0.log,
                "recovery worker unavailable, replacement skipped";
                "host" => %self.0.host
            );
        }
    }

    /// Slot a replacement connection established by the recovery worker
    /// into the pool. The connection is refused and closed if the pool has
    /// gone offline or is already at capacity.
    pub(crate) fn add_connection(&self, conn: C) {
        let mut data = self.0.data.lock().unwrap();
        let live =
            u32::from(data.borrowed) + data.available.len() as u32;
        if data.state == PoolState::Active && live < self.0.capacity {
            data.created += 1.into();
            data.available.push_back(conn);
            drop(data);
            self.0.monitor.connection_created(&self.0.host);
            self.0.condvar.notify_one();
            info!(
                self.0.log,
                "replacement connection added";
                "host" => %self.0.host
            );
        } else {
            drop(data);
            debug!(
                self.0.log,
                "discarding replacement connection for departed host pool";
                "host" => %self.0.host
            );
            let mut conn = conn;
            let _ = conn.close();
        }
    }

    /// Drain and close the pool. New borrows are refused immediately;
    /// outstanding borrows are given up to `grace` to come back before the
    /// available connections are closed and the pool moves to Closed.
    pub(crate) fn shutdown(&self, grace: Duration) {
        let mut data = self.0.data.lock().unwrap();
        match data.state {
            PoolState::Draining | PoolState::Closed => return,
            _ => (),
        }
        data.state = PoolState::Draining;
        info!(self.0.log, "draining host pool"; "host" => %self.0.host);

        let deadline = Instant::now() + grace;
        while u32::from(data.borrowed) > 0 {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    self.0.log,
                    "grace period elapsed with connections still borrowed";
                    "host" => %self.0.host,
                    "borrowed" => u32::from(data.borrowed)
                );
                break;
            }
            let wait_result = self
                .0
                .condvar
                .wait_timeout(data, deadline - now)
                .unwrap();
            data = wait_result.0;
        }

        let drained: Vec<C> = data.available.drain(..).collect();
        data.closed += ConnectionCount::from(drained.len() as u32);
        data.state = PoolState::Closed;
        drop(data);

        // Wake any borrowers still waiting so they observe Closed
        self.0.condvar.notify_all();

        for conn in drained {
            self.close_connection(conn);
        }
        info!(self.0.log, "host pool closed"; "host" => %self.0.host);
    }
}

/// A connection on loan from a host pool.
///
/// The connection is returned to its pool when the guard goes out of scope,
/// so a borrow is always balanced by exactly one return, even on error
/// paths.
pub struct BorrowedConnection<C: Connection> {
    pool: HostConnectionPool<C>,
    conn: Option<C>,
}

impl<C: Connection> BorrowedConnection<C> {
    /// The host serving this connection.
    pub fn host(&self) -> &Host {
        self.pool.host()
    }

    /// The host pool this connection is on loan from.
    pub fn pool(&self) -> &HostConnectionPool<C> {
        &self.pool
    }
}

impl<C: Connection> Drop for BorrowedConnection<C> {
    fn drop(&mut self) {
        match self.conn.take() {
            Some(conn) => self.pool.return_connection(conn),
            None => {
                // If we arrive here then the connection was already handed
                // back and there is nothing left to return.
                warn!(
                    self.pool.0.log,
                    "connection for host {} is no longer available, \
                     cannot return to pool",
                    self.pool.host()
                );
            }
        }
    }
}

impl<C: Connection> Deref for BorrowedConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().unwrap()
    }
}

impl<C: Connection> DerefMut for BorrowedConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap()
    }
}
