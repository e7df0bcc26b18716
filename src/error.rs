// Copyright 2021 Joyent, Inc.

use thiserror::Error;

use crate::host::Host;

/// The error type for all connection pool operations.
///
/// The dispatch loop recovers only the kinds the configured retry policy
/// admits; everything else is surfaced to the caller. `NoAvailableHosts` and
/// `Unexpected` are terminal and never consult the retry policy.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The pool has no active host pools to select from.
    #[error("no available hosts in the connection pool")]
    NoAvailableHosts,
    /// Every host pool tried refused to hand out a connection within the
    /// borrow timeout.
    #[error("host pool for {host} exhausted after {timeout_ms}ms")]
    PoolExhausted { host: Host, timeout_ms: u64 },
    /// The host pool is not in the Active state.
    #[error("host pool for {host} is offline")]
    PoolOffline { host: Host },
    /// The connection must be discarded. This is the sole input to the
    /// error rate monitor and may lead to host eviction.
    #[error("fatal connection error on {host}: {reason}")]
    FatalConnection { host: Host, reason: String },
    /// Failure to establish a connection to a host.
    #[error("connect error: {0}")]
    Connect(String),
    /// The backend refused the request due to load shedding.
    #[error("request throttled: {0}")]
    Throttled(String),
    /// A transient operation failure.
    #[error("operation error: {0}")]
    Operation(String),
    /// A non-domain failure from user code, wrapped and surfaced without
    /// failover.
    #[error("unexpected error: {0}")]
    Unexpected(String),
    /// Pool lifecycle methods may only be invoked on the original pool
    /// instance and not on one of its clones.
    #[error("shutdown may only be called on the original pool instance")]
    ShutdownCalledByClone,
}

impl Error {
    /// True for errors that signal the specific connection must be
    /// discarded. Only these count toward host eviction.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalConnection { .. })
    }

    /// True for errors the retry policy is consulted about.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::NoAvailableHosts
                | Error::Unexpected(_)
                | Error::ShutdownCalledByClone
        )
    }
}
