//! Connections and the tasks driving them
//!
//! Each connection is an actor: a [`State`] owned by a single tokio task, fed through a small
//! mailbox. Handles ([`Connection`]) only ever talk to the task through messages.

use std::{
    future, io, mem,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::{
    cid::{ConnectionId, ResetToken},
    endpoint::Shared as EndpointShared,
    frame::{ApplicationClose, Close, ConnectionClose},
    routing::{ConnectionHandle, RouteUpdate},
    transport::Datagram,
    Side, TransportError, TransportErrorCode,
};

mod cid_state;
mod crypto_stream;
mod packet_builder;
pub(crate) mod spaces;
mod state;

use state::EndpointEvent;
pub(crate) use state::{Setup, State};

/// Delay before retrying a datagram the socket had no room for
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Where the endpoint delivers a connection's datagrams
pub(crate) type Route = mpsc::Sender<ConnectionMessage>;

type Command = Box<dyn FnOnce(&mut State, Instant) + Send>;

/// Input for a connection task, processed strictly in order
pub(crate) enum ConnectionMessage {
    Datagram { remote: SocketAddr, data: BytesMut },
    /// A datagram ending in the peer's reset token arrived
    StatelessReset,
    /// Nothing new, but the task should try to send
    Wake,
    Command(Command),
}

/// Reasons why a connection might be lost
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer doesn't implement any supported version
    #[error("peer doesn't implement any supported version")]
    VersionMismatch,
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer's QUIC stack aborted the connection automatically
    #[error("aborted by peer: {0}")]
    ConnectionClosed(ConnectionClose),
    /// The peer closed the connection
    #[error("closed by peer: {0}")]
    ApplicationClosed(ApplicationClose),
    /// The peer is unable to continue processing this connection, usually due to having restarted
    #[error("reset by peer")]
    Reset,
    /// Communication with the peer has lapsed for longer than the negotiated idle timeout
    #[error("timed out")]
    TimedOut,
    /// The local application closed the connection
    #[error("closed")]
    LocallyClosed,
}

impl ConnectionError {
    /// Whether the connection ended without anyone reporting an error
    pub fn is_clean(&self) -> bool {
        match self {
            Self::LocallyClosed => true,
            Self::ConnectionClosed(close) => close.error_code == TransportErrorCode::NO_ERROR,
            Self::ApplicationClosed(close) => close.error_code.into_inner() == 0,
            Self::TransportError(e) => e.code == TransportErrorCode::NO_ERROR,
            Self::VersionMismatch | Self::Reset | Self::TimedOut => false,
        }
    }
}

/// Snapshot of a connection's state
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Whether this end initiated the connection
    pub side: Side,
    /// Protocol negotiated with ALPN, if any
    pub alpn_protocol: Option<Vec<u8>>,
    /// Whether the peer authenticated itself with certificates
    pub has_peer_certificates: bool,
    /// Whether the handshake is confirmed (RFC 9001 §4.1.2)
    ///
    /// Servers confirm as soon as the TLS handshake completes, clients once HANDSHAKE_DONE
    /// arrives.
    pub handshake_confirmed: bool,
    /// Current stage in the connection's life
    pub phase: ConnectionPhase,
    /// Current round-trip time estimate
    pub rtt: Duration,
    /// Bytes the peer allows us to send, from its transport parameters and MAX_DATA
    pub peer_max_data: u64,
    /// Bidirectional streams the peer allows us to open
    pub peer_max_streams_bidi: u64,
    /// Unidirectional streams the peer allows us to open
    pub peer_max_streams_uni: u64,
}

/// Stage in the life of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionPhase {
    /// The TLS handshake is still in progress
    Handshaking,
    /// The TLS handshake completed and the connection is usable
    Established,
    /// We closed the connection and wait for the close to take effect
    Closing,
    /// The peer closed or reset the connection
    Draining,
    /// Nothing more will be sent or received
    Closed,
}

/// What handles observe of a connection task
#[derive(Debug, Clone)]
struct Status {
    info: ConnectionInfo,
    /// Set once, when the task exits
    closed: Option<ConnectionError>,
}

/// A QUIC connection
///
/// Cheap to clone; every clone refers to the same connection. Dropping handles does not close
/// the connection.
#[derive(Debug, Clone)]
pub struct Connection(Arc<ConnectionRef>);

#[derive(Debug)]
struct ConnectionRef {
    handle: ConnectionHandle,
    mailbox: Route,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    status: watch::Receiver<Status>,
}

impl Connection {
    /// The local address of the endpoint carrying this connection
    pub fn local_addr(&self) -> SocketAddr {
        self.0.local_addr
    }

    /// The peer's UDP address
    pub fn remote_addr(&self) -> SocketAddr {
        self.0.remote_addr
    }

    /// Current state of the connection
    pub async fn connection_state(&self) -> ConnectionInfo {
        match self.command(|state, _| state.info()).await {
            Some(info) => info,
            None => self.0.status.borrow().info.clone(),
        }
    }

    /// Close the connection immediately with an application error
    ///
    /// The peer is informed with CONNECTION_CLOSE; the connection lingers in the closing state
    /// for three probe timeouts. Does nothing if the connection is already closing.
    pub async fn abort(&self, reason: ApplicationClose) {
        self.begin_close(reason.into()).await;
    }

    /// Close the connection cleanly and wait until it is gone, or until `deadline`
    ///
    /// A connection still lingering at the deadline is dropped without further notice to the peer.
    pub async fn close(&self, deadline: Instant) -> ConnectionError {
        self.command(|state, now| {
            state.close(now, TransportError::from(TransportErrorCode::NO_ERROR).into())
        })
        .await;
        match tokio::time::timeout_at(deadline.into(), self.closed()).await {
            Ok(error) => error,
            Err(_) => {
                debug!("close deadline passed");
                self.command(|state, _| state.kill(ConnectionError::LocallyClosed))
                    .await;
                self.closed().await
            }
        }
    }

    /// Wait for the connection to end, returning the reason
    pub async fn closed(&self) -> ConnectionError {
        let mut status = self.0.status.clone();
        loop {
            if let Some(error) = status.borrow_and_update().closed.clone() {
                return error;
            }
            if status.changed().await.is_err() {
                // The task exits only after publishing its error
                return status
                    .borrow()
                    .closed
                    .clone()
                    .unwrap_or(ConnectionError::LocallyClosed);
            }
        }
    }

    /// Wait until the handshake completed, or the connection failed
    pub(crate) async fn established(&self) -> Result<(), ConnectionError> {
        let mut status = self.0.status.clone();
        loop {
            {
                let status = status.borrow_and_update();
                if let Some(error) = &status.closed {
                    return Err(error.clone());
                }
                // A connection closing mid-handshake reports its error once drained
                if status.info.phase == ConnectionPhase::Established {
                    return Ok(());
                }
            }
            if status.changed().await.is_err() {
                return Err(ConnectionError::LocallyClosed);
            }
        }
    }

    /// Enter the closing state without waiting for it to end
    pub(crate) async fn begin_close(&self, reason: Close) {
        self.command(move |state, now| state.close(now, reason))
            .await;
    }

    /// Close from a context that cannot wait, such as a destructor
    pub(crate) fn abort_detached(&self, reason: Close) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let this = self.clone();
        runtime.spawn(async move { this.begin_close(reason).await });
    }

    /// Have the task try to send, without waiting for room in the mailbox
    pub(crate) fn wake(&self) {
        let _ = self.0.mailbox.try_send(ConnectionMessage::Wake);
    }

    pub(crate) fn handle(&self) -> ConnectionHandle {
        self.0.handle
    }

    pub(crate) fn route(&self) -> Route {
        self.0.mailbox.clone()
    }

    /// Run `f` on the connection task, returning `None` if it already exited
    async fn command<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut State, Instant) -> R + Send + 'static,
    ) -> Option<R> {
        let (send, recv) = oneshot::channel();
        let command: Command = Box::new(move |state, now| {
            let _ = send.send(f(state, now));
        });
        self.0
            .mailbox
            .send(ConnectionMessage::Command(command))
            .await
            .ok()?;
        recv.await.ok()
    }
}

/// Start the task driving `state`
///
/// `routed` lists the ids the endpoint already routes to this connection.
pub(crate) fn spawn(
    state: State,
    handle: ConnectionHandle,
    local_addr: SocketAddr,
    endpoint: Arc<EndpointShared>,
    routed: Vec<ConnectionId>,
) -> Connection {
    let (send, recv) = mpsc::channel(1);
    let (status_send, status_recv) = watch::channel(Status {
        info: state.info(),
        closed: None,
    });
    let connection = Connection(Arc::new(ConnectionRef {
        handle,
        mailbox: send,
        local_addr,
        remote_addr: state.remote_address(),
        status: status_recv,
    }));
    let span = info_span!("connection", side = ?state.side(), id = handle.0);
    let driver = ConnectionDriver {
        force_exit: endpoint.subscribe_force_exit(),
        state,
        connection: connection.clone(),
        endpoint,
        mailbox: recv,
        status: status_send,
        routed,
        reset_token: None,
        unsent: None,
        send_retry: None,
    };
    tokio::spawn(driver.run().instrument(span));
    connection
}

struct ConnectionDriver {
    state: State,
    connection: Connection,
    endpoint: Arc<EndpointShared>,
    mailbox: mpsc::Receiver<ConnectionMessage>,
    status: watch::Sender<Status>,
    /// Fires when the endpoint gives up waiting for connections to close
    force_exit: watch::Receiver<bool>,
    /// Local ids the endpoint routes to us
    routed: Vec<ConnectionId>,
    /// The peer's reset token the endpoint watches for
    reset_token: Option<ResetToken>,
    /// A datagram the socket could not take yet
    unsent: Option<Vec<u8>>,
    send_retry: Option<Instant>,
}

impl ConnectionDriver {
    async fn run(mut self) {
        debug!(remote = %self.state.remote_address(), "connection started");
        loop {
            let now = Instant::now();
            self.process_endpoint_events(now);
            self.flush(now);
            self.publish_status();
            if self.state.is_drained() {
                break;
            }

            let deadline = [self.send_retry, self.state.poll_timeout()]
                .into_iter()
                .flatten()
                .min();
            let message = tokio::select! {
                message = self.mailbox.recv() => message,
                () = sleep_until(deadline) => {
                    self.on_timeout(Instant::now());
                    continue;
                }
                _ = self.force_exit.changed() => {
                    self.state.kill(ConnectionError::LocallyClosed);
                    continue;
                }
            };

            let now = Instant::now();
            match message {
                Some(ConnectionMessage::Datagram { remote, data }) => {
                    self.state.handle_datagram(now, remote, data)
                }
                Some(ConnectionMessage::StatelessReset) => self.state.handle_stateless_reset(now),
                Some(ConnectionMessage::Wake) => {}
                Some(ConnectionMessage::Command(command)) => command(&mut self.state, now),
                None => break,
            }
        }
        self.cleanup();
    }

    fn on_timeout(&mut self, now: Instant) {
        if self.send_retry.is_some_and(|x| x <= now) {
            self.send_retry = None;
        }
        self.state.handle_timeout(now);
    }

    /// Hand every datagram that is ready to the endpoint
    fn flush(&mut self, now: Instant) {
        if self.send_retry.is_some() {
            return;
        }
        let destination = self.state.remote_address();
        loop {
            let Some(contents) = self
                .unsent
                .take()
                .or_else(|| self.state.poll_transmit(now))
            else {
                break;
            };
            match self.endpoint.transmit(&Datagram {
                destination,
                contents: &contents,
            }) {
                Ok(()) => trace!(len = contents.len(), "sent datagram"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.unsent = Some(contents);
                    self.send_retry = Some(now + SEND_RETRY_INTERVAL);
                    break;
                }
                // Loss recovery takes care of it
                Err(e) => warn!("failed to send datagram: {}", e),
            }
        }
    }

    fn process_endpoint_events(&mut self, now: Instant) {
        let owner = self.connection.handle();
        while let Some(event) = self.state.poll_endpoint_event() {
            match event {
                EndpointEvent::NewIds(ids) => {
                    let target = self.connection.route();
                    self.endpoint
                        .routes()
                        .extend(ids.iter().map(|&id| RouteUpdate::InsertId {
                            id,
                            owner,
                            target: target.clone(),
                        }));
                    self.routed.extend(ids);
                }
                EndpointEvent::RetireId(id) => {
                    self.routed.retain(|x| *x != id);
                    self.endpoint
                        .routes()
                        .push(RouteUpdate::RemoveId { id, owner });
                }
                EndpointEvent::ResetToken(token) => {
                    let routes = self.endpoint.routes();
                    if let Some(old) = self.reset_token.replace(token) {
                        routes.push(RouteUpdate::RemoveToken { token: old, owner });
                    }
                    routes.push(RouteUpdate::InsertToken {
                        token,
                        owner,
                        target: self.connection.route(),
                    });
                }
                EndpointEvent::Established => {
                    if !self.endpoint.server_conn_established(&self.connection) {
                        self.state.close_with_error(
                            now,
                            TransportError::CONNECTION_REFUSED("not accepting connections"),
                        );
                    }
                }
            }
        }
    }

    fn publish_status(&mut self) {
        let info = self.state.info();
        self.status.send_if_modified(|status| {
            if status.info.phase == info.phase
                && status.info.handshake_confirmed == info.handshake_confirmed
            {
                return false;
            }
            status.info = info;
            true
        });
    }

    fn cleanup(&mut self) {
        let error = self
            .state
            .error()
            .cloned()
            .unwrap_or(ConnectionError::LocallyClosed);
        debug!(%error, "connection drained");
        self.endpoint.conn_drained(
            self.connection.handle(),
            mem::take(&mut self.routed),
            self.reset_token.take(),
        );
        self.state.close_session();
        let info = self.state.info();
        self.status.send_modify(|status| {
            status.info = info;
            status.closed = Some(error);
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::VarInt;

    #[test]
    fn clean_closes() {
        assert!(ConnectionError::LocallyClosed.is_clean());
        assert!(ConnectionError::ConnectionClosed(
            TransportError::from(TransportErrorCode::NO_ERROR).into()
        )
        .is_clean());
        assert!(ConnectionError::ApplicationClosed(ApplicationClose {
            error_code: VarInt::from_u32(0),
            reason: Bytes::from_static(b"bye"),
        })
        .is_clean());

        assert!(!ConnectionError::ApplicationClosed(ApplicationClose {
            error_code: VarInt::from_u32(7),
            reason: Bytes::new(),
        })
        .is_clean());
        assert!(!ConnectionError::TransportError(TransportError::PROTOCOL_VIOLATION("x")).is_clean());
        assert!(!ConnectionError::TimedOut.is_clean());
        assert!(!ConnectionError::Reset.is_clean());
    }
}
