// Copyright 2021 Joyent, Inc.

use std::fmt;

/// The DNS name or address of a host. This is a type alias for String.
pub type HostName = String;
/// The port number for a host. This is a type alias for u16.
pub type HostPort = u16;

/// A logical endpoint of the backend service, identified by a hostname and
/// port pair. Two `Host` values with the same name and port compare equal
/// and hash identically, so a `Host` may be used to key the pool's host map
/// no matter where it was constructed.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Host {
    /// The DNS name or address of the host.
    pub name: HostName,
    /// The port of the host.
    pub port: HostPort,
}

impl Host {
    /// Return a new instance of `Host` given a name and port.
    pub fn new<S: Into<HostName>>(name: S, port: HostPort) -> Self {
        Host {
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.name, self.port)
    }
}
