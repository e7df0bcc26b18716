// Copyright 2021 Joyent, Inc.

//! A failover-aware connection pool for multi-host services
//!
//! Carom is a library for managing pools of connections to a sharded or
//! clustered backend service. The name comes from carom billiards, where the
//! cue ball is played to rebound from one object ball to another: when an
//! operation fails on one host, the pool plays it off the next one. Users
//! submit opaque operations; the pool selects a healthy host, borrows a
//! physical connection from that host's sub-pool, executes the operation,
//! observes the outcome, and retries on another host per a configurable
//! retry policy. Hosts whose error rate trips a configured rule are
//! passively evicted from the rotation.
//!
//! ## Hosts and host pools
//!
//! A [`Host`](host/struct.Host.html) is the identity of one backend node, a
//! hostname and port pair. Each registered host gets its own
//! [`HostConnectionPool`](host_pool/struct.HostConnectionPool.html) holding
//! a fixed complement of live connections, created up front when the host
//! is added (*priming*) and replaced by a shared single-threaded recovery
//! worker when one is discarded. Borrowing from a host pool is a timed
//! blocking acquire: when every connection is checked out the caller waits
//! until one is returned or the configured timeout elapses.
//!
//! ## Connections
//!
//! A *connection* is not necessarily just a TCP socket. It can be anything
//! that provides a logical connection to a host, as long as it implements
//! the [`Connection`](connection/trait.Connection.html) trait: for example
//! an authenticated session that performs a handshake in `open` before it
//! is considered connected. Connections are produced by a user-supplied
//! [`ConnectionFactory`](connection/trait.ConnectionFactory.html), which
//! captures whatever application-level configuration establishing a
//! connection requires.
//!
//! ## Failover
//!
//! [`ConnectionPool::execute_with_failover`]
//! (connection_pool/struct.ConnectionPool.html#method.execute_with_failover)
//! drives each operation through a fresh
//! [`RetryPolicy`](retry/trait.RetryPolicy.html) instance. The round-robin
//! selection counter advances on every attempt, so a retried operation
//! lands on a different host whenever one is available. An empty rotation
//! fails fast and is never retried. The asynchronous path
//! ([`execute_async`]
//! (connection_pool/struct.ConnectionPool.html#method.execute_async)) makes
//! a single dispatch attempt and never fails over; the returned future is
//! the caller's contract with the operation, not the pool's.
//!
//! ## Eviction
//!
//! Fatal connection errors are recorded against a per-host sliding-window
//! [`ErrorRateMonitor`](health/struct.ErrorRateMonitor.html). When a
//! configured `(threshold, duration, repeat)` rule fires, the host is
//! removed from the rotation exactly as if `remove_host` had been called:
//! its pool drains and closes, and subsequent operations select among the
//! remaining hosts. The failing call itself still surfaces its own error.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use carom::connection_pool::types::ConnectionPoolOptions;
//! use carom::connection_pool::ConnectionPool;
//! use carom::host::Host;
//! use carom::retry::RetryNTimesFactory;
//!
//! let pool_opts = ConnectionPoolOptions {
//!     connections_per_host: Some(3),
//!     max_timeout_when_exhausted_ms: Some(2000),
//!     retry_policy_factory: Some(Arc::new(RetryNTimesFactory::new(3))),
//!     ..Default::default()
//! };
//!
//! // RedisConnectionFactory implements the ConnectionFactory trait for
//! // some connection type implementing the Connection trait.
//! let pool = ConnectionPool::new(pool_opts, RedisConnectionFactory::new(creds));
//! pool.add_host(Host::new("10.0.0.1", 6379));
//! pool.add_host(Host::new("10.0.0.2", 6379));
//!
//! let result = pool.execute_with_failover(&GetOp::new("some-key"))?;
//! println!(
//!     "value {:?} served by {} in {:?}",
//!     result.value(),
//!     result.host(),
//!     result.latency()
//! );
//! ```

#![allow(missing_docs)]

pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod health;
pub mod host;
pub mod host_pool;
pub mod monitor;
pub mod operation;
pub mod retry;
pub mod selection;
