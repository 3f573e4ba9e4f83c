//! An asynchronous QUIC connection engine
//!
//! An [`Endpoint`] owns one UDP socket and multiplexes any number of [`Connection`]s over it.
//! Each connection runs as its own tokio task that exclusively owns the protocol state; the
//! endpoint's receive loop forwards datagrams to it by destination connection id.
//!
//! The engine covers connection establishment and teardown: the TLS 1.3 handshake in CRYPTO
//! frames, loss recovery of handshake data, connection id management, path validation, key
//! updates, idle timeouts and stateless resets. Streams and application datagrams are not
//! provided.

#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]

use std::{
    io,
    net::SocketAddr,
    time::Duration,
};

use thiserror::Error;

mod cid;
mod coding;
mod config;
mod connection;
mod constant_time;
pub mod crypto;
mod endpoint;
mod frame;
mod packet;
mod path;
mod range_set;
mod recovery;
mod routing;
mod skip;
mod sparse_window;
mod token;
mod transport;
mod transport_error;
mod transport_parameters;
mod varint;

#[cfg(test)]
mod tests;

pub use crate::cid::{ConnectionId, ConnectionIdGenerator, RandomConnectionIdGenerator, ResetToken};
pub use crate::config::{
    ClientConfig, ConfigError, EndpointConfig, IdleTimeout, ServerConfig, TransportConfig,
};
pub use crate::connection::{Connection, ConnectionError, ConnectionInfo, ConnectionPhase};
pub use crate::endpoint::{Endpoint, EndpointError};
pub use crate::frame::{ApplicationClose, ConnectionClose, FrameType};
pub use crate::transport::{Datagram, PacketTransport, UdpTransport};
pub use crate::transport_error::{Code as TransportErrorCode, Error as TransportError};
pub use crate::varint::{VarInt, VarIntBoundsExceeded};

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

/// Errors in the parameters being used to create a new connection
///
/// These arise before any I/O has been performed, or from a failed handshake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The endpoint can no longer create new connections
    #[error("endpoint stopping")]
    EndpointStopping,
    /// The server name supplied was malformed
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    /// The remote address cannot be dialed
    #[error("invalid remote address: {0}")]
    InvalidRemoteAddress(SocketAddr),
    /// The TLS configuration could not be used
    #[error("TLS error: {0}")]
    Tls(String),
    /// The handshake failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// A socket could not be set up
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<EndpointError> for ConnectError {
    fn from(e: EndpointError) -> Self {
        Self::Io(e.to_string())
    }
}

/// Dial `addr` from a dedicated client endpoint bound to an ephemeral port
///
/// No handle to the endpoint is kept, so it closes itself once the connection is gone.
pub async fn connect(
    addr: SocketAddr,
    server_name: &str,
    config: ClientConfig,
) -> Result<Connection, ConnectError> {
    let endpoint = Endpoint::client(endpoint::unspecified_for(&addr))?;
    endpoint.connect(addr, server_name, config).await
}

/// The QUIC protocol version implemented
const VERSION: u32 = 0x0000_0001;

/// The maximum number of CIDs we bother to issue per connection
const LOC_CID_COUNT: u64 = 8;
const RESET_TOKEN_SIZE: usize = 16;
const MAX_CID_SIZE: usize = 20;
/// Datagrams carrying client Initials, and Version Negotiation triggers, are at least this long
const MIN_INITIAL_SIZE: u16 = 1200;
/// Datagram size used until the path is known to support more
const INITIAL_MTU: u16 = 1200;
const MAX_UDP_PAYLOAD: u16 = 65527;
const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
/// Maximum number of streams that can be uniquely identified by a stream ID
const MAX_STREAM_COUNT: u64 = 1 << 60;
