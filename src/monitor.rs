// Copyright 2021 Joyent, Inc.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Error;
use crate::host::Host;

/// Receives counter and latency events from the pool.
///
/// The pool and its host pools emit an event for every host lifecycle
/// change, operation outcome, and connection lifecycle change. The metric
/// sink behind this trait is external; implementations must be cheap and
/// must not block, as several of these methods sit on the operation hot
/// path.
pub trait ConnectionPoolMonitor: Send + Sync + 'static {
    fn host_added(&self, host: &Host);
    fn host_removed(&self, host: &Host);

    /// A top-level operation succeeded; latency is wall-clock from entry
    /// into the pool.
    fn operation_success(&self, host: &Host, latency: Duration);
    /// An attempt failed. The host is absent when no connection was
    /// involved, such as when the pool had no hosts to select from.
    fn operation_failure(&self, host: Option<&Host>, error: &Error);
    /// An attempt failed and the retry policy admitted another attempt.
    fn failover(&self, host: &Host, error: &Error);

    fn connection_created(&self, host: &Host);
    fn connection_create_failed(&self, host: &Host, error: &Error);
    fn connection_closed(&self, host: &Host);
    fn connection_borrowed(&self, host: &Host);
    fn connection_returned(&self, host: &Host);
}

/// Per-host counters maintained by [`CountingMonitor`].
#[derive(Debug, Default)]
pub struct HostStats {
    operation_successes: AtomicU64,
    operation_failures: AtomicU64,
    connections_created: AtomicU64,
    connections_create_failed: AtomicU64,
    connections_closed: AtomicU64,
    connections_borrowed: AtomicU64,
    connections_returned: AtomicU64,
}

impl HostStats {
    pub fn operation_successes(&self) -> u64 {
        self.operation_successes.load(Ordering::Relaxed)
    }

    pub fn operation_failures(&self) -> u64 {
        self.operation_failures.load(Ordering::Relaxed)
    }

    pub fn connections_created(&self) -> u64 {
        self.connections_created.load(Ordering::Relaxed)
    }

    pub fn connections_create_failed(&self) -> u64 {
        self.connections_create_failed.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    pub fn connections_borrowed(&self) -> u64 {
        self.connections_borrowed.load(Ordering::Relaxed)
    }

    pub fn connections_returned(&self) -> u64 {
        self.connections_returned.load(Ordering::Relaxed)
    }
}

/// A monitor implementation that keeps in-memory counters, both pool-wide
/// and per host. This is the default monitor when none is configured, and
/// the one the integration tests assert against.
#[derive(Debug, Default)]
pub struct CountingMonitor {
    hosts_added: AtomicU64,
    hosts_removed: AtomicU64,
    operation_successes: AtomicU64,
    operation_failures: AtomicU64,
    failovers: AtomicU64,
    connections_created: AtomicU64,
    connections_create_failed: AtomicU64,
    connections_closed: AtomicU64,
    connections_borrowed: AtomicU64,
    connections_returned: AtomicU64,
    host_stats: Mutex<HashMap<Host, Arc<HostStats>>>,
}

impl CountingMonitor {
    pub fn new() -> Self {
        CountingMonitor::default()
    }

    fn host_entry(&self, host: &Host) -> Arc<HostStats> {
        let mut stats = self.host_stats.lock().unwrap();
        stats
            .entry(host.clone())
            .or_insert_with(|| Arc::new(HostStats::default()))
            .clone()
    }

    /// The counters recorded for `host`, if any event mentioned it.
    pub fn host_stats(&self, host: &Host) -> Option<Arc<HostStats>> {
        self.host_stats.lock().unwrap().get(host).cloned()
    }

    pub fn hosts_added(&self) -> u64 {
        self.hosts_added.load(Ordering::Relaxed)
    }

    pub fn hosts_removed(&self) -> u64 {
        self.hosts_removed.load(Ordering::Relaxed)
    }

    pub fn operation_successes(&self) -> u64 {
        self.operation_successes.load(Ordering::Relaxed)
    }

    pub fn operation_failures(&self) -> u64 {
        self.operation_failures.load(Ordering::Relaxed)
    }

    pub fn failovers(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    pub fn connections_created(&self) -> u64 {
        self.connections_created.load(Ordering::Relaxed)
    }

    pub fn connections_create_failed(&self) -> u64 {
        self.connections_create_failed.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    pub fn connections_borrowed(&self) -> u64 {
        self.connections_borrowed.load(Ordering::Relaxed)
    }

    pub fn connections_returned(&self) -> u64 {
        self.connections_returned.load(Ordering::Relaxed)
    }
}

impl ConnectionPoolMonitor for CountingMonitor {
    fn host_added(&self, _host: &Host) {
        self.hosts_added.fetch_add(1, Ordering::Relaxed);
    }

    fn host_removed(&self, _host: &Host) {
        self.hosts_removed.fetch_add(1, Ordering::Relaxed);
    }

    fn operation_success(&self, host: &Host, _latency: Duration) {
        self.operation_successes.fetch_add(1, Ordering::Relaxed);
        self.host_entry(host)
            .operation_successes
            .fetch_add(1, Ordering::Relaxed);
    }

    fn operation_failure(&self, host: Option<&Host>, _error: &Error) {
        self.operation_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(host) = host {
            self.host_entry(host)
                .operation_failures
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn failover(&self, _host: &Host, _error: &Error) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_created(&self, host: &Host) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        self.host_entry(host)
            .connections_created
            .fetch_add(1, Ordering::Relaxed);
    }

    fn connection_create_failed(&self, host: &Host, _error: &Error) {
        self.connections_create_failed
            .fetch_add(1, Ordering::Relaxed);
        self.host_entry(host)
            .connections_create_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, host: &Host) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.host_entry(host)
            .connections_closed
            .fetch_add(1, Ordering::Relaxed);
    }

    fn connection_borrowed(&self, host: &Host) {
        self.connections_borrowed.fetch_add(1, Ordering::Relaxed);
        self.host_entry(host)
            .connections_borrowed
            .fetch_add(1, Ordering::Relaxed);
    }

    fn connection_returned(&self, host: &Host) {
        self.connections_returned.fetch_add(1, Ordering::Relaxed);
        self.host_entry(host)
            .connections_returned
            .fetch_add(1, Ordering::Relaxed);
    }
}
