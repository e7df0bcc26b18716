// Copyright 2021 Joyent, Inc.

use std::fmt;
use std::sync::Arc;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::health::ErrorRateMonitorConfig;
use crate::monitor::ConnectionPoolMonitor;
use crate::retry::RetryPolicyFactory;

/// The configuration options for a connection pool. This is required to
/// instantiate a new pool; unset fields fall back to crate defaults.
#[derive(Default)]
pub struct ConnectionPoolOptions {
    /// An optional number of connections to maintain per host. If not
    /// specified the default is 3.
    pub connections_per_host: Option<u32>,
    /// An optional timeout in milliseconds for blocking connection borrows
    /// when every connection of a host pool is checked out. If not specified
    /// the default is 2000 milliseconds.
    pub max_timeout_when_exhausted_ms: Option<u64>,
    /// An optional grace period in milliseconds that a host pool shutdown
    /// waits for outstanding borrows to be returned. If not specified the
    /// default is 5000 milliseconds.
    pub shutdown_grace_period_ms: Option<u64>,
    /// An optional factory for per-operation retry policies. If not
    /// specified each operation gets a single attempt.
    pub retry_policy_factory: Option<Arc<dyn RetryPolicyFactory>>,
    /// An optional error rate monitor configuration governing passive host
    /// eviction. The default configuration has no thresholds and never
    /// evicts.
    pub error_check_config: Option<ErrorRateMonitorConfig>,
    /// An optional metric sink. If not specified a
    /// [`CountingMonitor`](../../monitor/struct.CountingMonitor.html) is
    /// used.
    pub monitor: Option<Arc<dyn ConnectionPoolMonitor>>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain which is
    /// essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
    /// Whether a borrowed connection is returned to its host pool right
    /// after an asynchronous dispatch, while the underlying work is still
    /// outstanding. This mirrors the original pass-through behavior and is
    /// the default; when disabled the connection lease rides inside the
    /// returned future and is released when the future is consumed.
    pub return_connection_on_async_dispatch: Option<bool>,
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the host pools.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// A point-in-time snapshot of a host pool's connection accounting.
///
/// At all times `created - closed == borrowed + available`, and
/// `borrowed + available` never exceeds the configured connections per
/// host.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostPoolStats {
    /// Connections created and opened over the pool's lifetime.
    pub created: ConnectionCount,
    /// Connections closed over the pool's lifetime.
    pub closed: ConnectionCount,
    /// Connections currently on loan to callers.
    pub borrowed: ConnectionCount,
    /// Connections currently idle and ready to borrow.
    pub available: ConnectionCount,
}

/// Sum type representing the lifecycle state of a host pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolState {
    /// The pool has been created but its connections are not yet primed.
    Initializing,
    /// The pool is primed and serving borrow requests.
    Active,
    /// The pool is shutting down: new borrows are refused while outstanding
    /// borrows drain.
    Draining,
    /// The pool is closed. Late returns are closed on the spot.
    Closed,
}

impl fmt::Display for PoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolState::Initializing => String::from("initializing").fmt(fmt),
            PoolState::Active => String::from("active").fmt(fmt),
            PoolState::Draining => String::from("draining").fmt(fmt),
            PoolState::Closed => String::from("closed").fmt(fmt),
        }
    }
}
