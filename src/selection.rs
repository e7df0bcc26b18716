// Copyright 2021 Joyent, Inc.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::Error;
use crate::host::Host;
use crate::host_pool::{BorrowedConnection, HostConnectionPool};

/// Picks a host pool to serve the next operation.
///
/// A strategy observes the set of active host pools atomically per call:
/// hosts added mid-selection must not corrupt the iteration and hosts
/// removed mid-selection must not yield a stale pool.
pub trait HostSelectionStrategy<C: Connection>: Send + Sync {
    /// Register an active host pool with the rotation.
    fn add_host(&self, pool: HostConnectionPool<C>);

    /// Remove a host's pool from the rotation.
    fn remove_host(&self, host: &Host);

    /// Borrow a connection from some active host pool. The `key` is the
    /// operation's routing key; key-aware strategies may use it for
    /// placement while others ignore it.
    fn get_connection(
        &self,
        key: Option<&str>,
        timeout: Duration,
    ) -> Result<BorrowedConnection<C>, Error>;
}

/// Round-robin selection over the set of active host pools.
///
/// Each call snapshots the current pool list, advances a shared counter,
/// and tries pools starting at `counter % len` until a borrow succeeds or
/// every pool has been tried. The counter advance is what lands retries of
/// a failed operation on a different host when one is available. Fairness
/// under parallel callers is approximate but no healthy host is starved.
pub struct RoundRobinSelection<C: Connection> {
    pools: RwLock<Vec<HostConnectionPool<C>>>,
    counter: AtomicUsize,
}

impl<C: Connection> RoundRobinSelection<C> {
    pub fn new() -> Self {
        RoundRobinSelection {
            pools: RwLock::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }
}

impl<C: Connection> Default for RoundRobinSelection<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection> HostSelectionStrategy<C> for RoundRobinSelection<C> {
    fn add_host(&self, pool: HostConnectionPool<C>) {
        let mut pools = self.pools.write().unwrap();
        if !pools.iter().any(|p| p.host() == pool.host()) {
            pools.push(pool);
        }
    }

    fn remove_host(&self, host: &Host) {
        let mut pools = self.pools.write().unwrap();
        pools.retain(|p| p.host() != host);
    }

    fn get_connection(
        &self,
        _key: Option<&str>,
        timeout: Duration,
    ) -> Result<BorrowedConnection<C>, Error> {
        // Snapshot the rotation; the handles are cheap clones and the lock
        // is released before any blocking borrow is attempted.
        let snapshot: Vec<HostConnectionPool<C>> =
            self.pools.read().unwrap().clone();
        if snapshot.is_empty() {
            return Err(Error::NoAvailableHosts);
        }

        let start =
            self.counter.fetch_add(1, Ordering::Relaxed) % snapshot.len();
        let mut last_error = Error::NoAvailableHosts;
        for i in 0..snapshot.len() {
            let pool = &snapshot[(start + i) % snapshot.len()];
            match pool.borrow_connection(timeout) {
                Ok(conn) => return Ok(conn),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    use slog::{o, Logger};

    use super::*;
    use crate::connection::ConnectionFactory;
    use crate::monitor::CountingMonitor;

    struct StubConnection {
        host: Host,
        client: (),
    }

    impl Connection for StubConnection {
        type Client = ();

        fn open(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn host(&self) -> &Host {
            &self.host
        }

        fn client(&mut self) -> &mut () {
            &mut self.client
        }
    }

    struct StubFactory;

    impl ConnectionFactory for StubFactory {
        type Conn = StubConnection;

        fn create_connection(
            &self,
            host: &Host,
        ) -> Result<StubConnection, Error> {
            Ok(StubConnection {
                host: host.clone(),
                client: (),
            })
        }
    }

    fn active_pool(
        host: Host,
        capacity: u32,
    ) -> HostConnectionPool<StubConnection> {
        let (tx, _rx) = channel();
        let pool = HostConnectionPool::new(
            host,
            capacity,
            Arc::new(CountingMonitor::new()),
            tx,
            Logger::root(slog::Discard, o!()),
        );
        pool.prime_connections(&StubFactory).unwrap();
        pool
    }

    #[test]
    fn empty_rotation_has_no_available_hosts() {
        let selection = RoundRobinSelection::<StubConnection>::new();
        match selection.get_connection(None, Duration::from_millis(10)) {
            Err(Error::NoAvailableHosts) => (),
            other => {
                panic!("expected NoAvailableHosts, got {:?}", other.is_ok())
            }
        }
    }

    #[test]
    fn rotation_spreads_across_hosts() {
        let selection = RoundRobinSelection::new();
        let h1 = Host::new("h1", 8102);
        let h2 = Host::new("h2", 8102);
        selection.add_host(active_pool(h1.clone(), 3));
        selection.add_host(active_pool(h2.clone(), 3));

        let mut served: HashMap<Host, usize> = HashMap::new();
        for _ in 0..10 {
            let conn = selection
                .get_connection(None, Duration::from_millis(100))
                .unwrap();
            *served.entry(conn.host().clone()).or_insert(0) += 1;
        }
        assert_eq!(served.get(&h1), Some(&5));
        assert_eq!(served.get(&h2), Some(&5));
    }

    #[test]
    fn saturated_host_is_skipped() {
        let selection = RoundRobinSelection::new();
        let h1 = Host::new("h1", 8102);
        let h2 = Host::new("h2", 8102);
        selection.add_host(active_pool(h1.clone(), 1));
        selection.add_host(active_pool(h2.clone(), 1));

        // Drain h1 so that every selection must land on h2.
        let pools = selection.pools.read().unwrap().clone();
        let h1_pool = pools.iter().find(|p| *p.host() == h1).unwrap();
        let _held = h1_pool
            .borrow_connection(Duration::from_millis(10))
            .unwrap();

        for _ in 0..4 {
            let conn = selection
                .get_connection(None, Duration::from_millis(50))
                .unwrap();
            assert_eq!(*conn.host(), h2);
        }
    }

    #[test]
    fn removed_host_is_not_selected() {
        let selection = RoundRobinSelection::new();
        let h1 = Host::new("h1", 8102);
        let h2 = Host::new("h2", 8102);
        selection.add_host(active_pool(h1.clone(), 1));
        selection.add_host(active_pool(h2.clone(), 1));
        selection.remove_host(&h1);

        for _ in 0..4 {
            let conn = selection
                .get_connection(None, Duration::from_millis(50))
                .unwrap();
            assert_eq!(*conn.host(), h2);
        }
    }

    #[test]
    fn exhaustion_error_comes_from_last_pool_tried() {
        let selection = RoundRobinSelection::new();
        let h1 = Host::new("h1", 8102);
        selection.add_host(active_pool(h1.clone(), 1));

        let _held = selection
            .get_connection(None, Duration::from_millis(50))
            .unwrap();
        match selection.get_connection(None, Duration::from_millis(50)) {
            Err(Error::PoolExhausted { host, .. }) => assert_eq!(host, h1),
            other => {
                panic!("expected PoolExhausted, got {:?}", other.is_ok())
            }
        }
    }

    #[test]
    fn counter_keeps_advancing() {
        let selection = RoundRobinSelection::<StubConnection>::new();
        let h1 = Host::new("h1", 8102);
        selection.add_host(active_pool(h1, 3));
        let before = selection.counter.load(Ordering::Relaxed);
        let _ = selection.get_connection(None, Duration::from_millis(10));
        let _ = selection.get_connection(None, Duration::from_millis(10));
        assert_eq!(selection.counter.load(Ordering::Relaxed), before + 2);
    }
}
