// Copyright 2021 Joyent, Inc.

use crate::error::Error;
use crate::host::Host;
use crate::operation::{AsyncOperation, Deferred, Operation};

/// A live connection to a single host.
///
/// The `Connection` trait defines the interface that must be implemented in
/// order to participate in a host pool. A connection need not be limited to
/// a TCP socket, but can be any logical notion of a connection that obeys a
/// similar interface, such as an authenticated session to a backend node.
///
/// Connections are created by a [`ConnectionFactory`], opened by the host
/// pool while priming, then borrowed and returned any number of times before
/// being closed on pool shutdown or after a fatal transport error.
pub trait Connection: Send + 'static {
    /// The client protocol handle operations execute against.
    type Client;

    /// Attempt to establish the connection to the host. Invoked by the host
    /// pool while priming and by the recovery worker when replacing a
    /// discarded connection.
    fn open(&mut self) -> Result<(), Error>;

    /// Close the connection to the host.
    fn close(&mut self) -> Result<(), Error>;

    /// The host this connection is bound to. Host pools use this identity to
    /// route replacement requests, so it must not change over the life of
    /// the connection.
    fn host(&self) -> &Host;

    /// The client handle operations run against.
    fn client(&mut self) -> &mut Self::Client;

    /// The last transport-level error observed on this connection, if
    /// any. A fatal value here causes the host pool to discard the
    /// connection when it is returned and to request a replacement.
    fn last_error(&self) -> Option<&Error> {
        None
    }

    /// Run a synchronous operation against this connection's client.
    fn execute<R>(
        &mut self,
        op: &dyn Operation<Self::Client, Output = R>,
    ) -> Result<R, Error> {
        op.execute(self.client())
    }

    /// Dispatch an asynchronous operation against this connection's client.
    /// The connection implementation owns the machinery that completes the
    /// returned deferred value.
    fn execute_async<R>(
        &mut self,
        op: &dyn AsyncOperation<Self::Client, Output = R>,
    ) -> Result<Deferred<Result<R, Error>>, Error>
    where
        R: Send + 'static,
    {
        op.execute_async(self.client())
    }
}

/// Produces raw connections bound to a host.
///
/// The factory is provided by the user of the pool and captures whatever
/// application-level configuration is required to establish a connection,
/// such as credentials or a database name. Creation may fail with connect or
/// throttled errors; the pool reports those to the monitor and, while
/// priming, refuses to bring the host pool up.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type this factory produces.
    type Conn: Connection;

    /// Produce a new, unopened connection bound to `host`.
    fn create_connection(&self, host: &Host) -> Result<Self::Conn, Error>;
}
