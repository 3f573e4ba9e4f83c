//! The endpoint: one UDP socket shared by many connections
//!
//! A receive loop task owns the socket's read side and the [`RoutingTable`]. Datagrams addressed
//! to a known connection id are forwarded untouched to the connection's task; everything else is
//! endpoint-level traffic handled right here.

use std::{
    collections::VecDeque,
    fmt, future, io, mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Instant, SystemTime},
};

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tokio::{
    sync::{watch, Notify},
    time::error::Elapsed,
};
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::{
    cid::{ConnectionId, ConnectionIdGenerator, ResetToken},
    config::{random_reset_key, ClientConfig, ConfigError, EndpointConfig, ServerConfig},
    connection::{self, Connection, ConnectionMessage, Route, Setup},
    crypto::{self, CryptoError, HmacKey},
    frame::Close,
    packet::{
        self, Header, InitialHeader, PacketDecodeError, PacketNumber, PartialDecode,
        LONG_HEADER_FORM,
    },
    routing::{ConnectionHandle, RouteUpdate, RouteUpdates, RoutingTable},
    sparse_window::ChunkPool,
    token::RetryToken,
    transport::{Datagram, PacketTransport, UdpTransport},
    transport_parameters::{PreferredAddress, TransportParameters},
    ConnectError, Side, TransportError, TransportErrorCode, INITIAL_MTU, MAX_CID_SIZE,
    MAX_UDP_PAYLOAD, MIN_INITIAL_SIZE, RESET_TOKEN_SIZE,
};

/// Unmatched datagrams shorter than this are dropped unexamined
const MIN_DATAGRAM_SIZE: usize = 21;

/// Shortest datagram that may be answered with a stateless reset: a header byte, the longest
/// connection id, a packet number, a payload byte and an AEAD tag
const MIN_RESET_TRIGGER: usize = 1 + MAX_CID_SIZE + 1 + 1 + RESET_TOKEN_SIZE;

const MAX_RESET_SIZE: usize = 42;

/// Shortest destination id a client may choose for its first Initial (RFC 9000 §7.2)
const MIN_CLIENT_INITIAL_CID: usize = 8;

/// A QUIC endpoint
///
/// May act as a client, a server, or both. Cloning yields another handle to the same endpoint.
/// The socket stays open until [`close`](Self::close) is called, or until every handle is dropped
/// and the last connection has drained.
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl Endpoint {
    /// Bind a server endpoint to `addr`
    ///
    /// Must be called within a tokio runtime.
    pub fn server(config: ServerConfig, addr: SocketAddr) -> Result<Self, EndpointError> {
        let transport = UdpTransport::bind(addr)?;
        Self::new(EndpointConfig::default(), Some(config), Arc::new(transport))
    }

    /// Bind a client-only endpoint to `addr`
    ///
    /// Must be called within a tokio runtime.
    pub fn client(addr: SocketAddr) -> Result<Self, EndpointError> {
        let transport = UdpTransport::bind(addr)?;
        Self::new(EndpointConfig::default(), None, Arc::new(transport))
    }

    /// Construct an endpoint over an arbitrary transport
    ///
    /// Incoming connections are accepted only if `server_config` is given.
    pub fn new(
        config: EndpointConfig,
        server_config: Option<ServerConfig>,
        transport: Arc<dyn PacketTransport>,
    ) -> Result<Self, EndpointError> {
        let local_addr = transport.local_addr()?;
        let cid_generator: Arc<dyn ConnectionIdGenerator> =
            Arc::from(config.cid_generator_instance()?);
        // Connections always hand out reset tokens, even when this endpoint never sends resets
        let reset_key = config.reset_key.clone().unwrap_or_else(random_reset_key);
        let table = RoutingTable::new();
        let shared = Arc::new(Shared {
            transport,
            local_addr,
            max_udp_payload: u16::try_from(config.max_udp_payload_size.into_inner())
                .unwrap_or(MAX_UDP_PAYLOAD),
            config,
            server_config: server_config.map(Arc::new),
            cid_generator,
            reset_key,
            routes: table.updates(),
            pool: ChunkPool::default(),
            state: Mutex::new(State {
                ref_count: 1,
                ..State::default()
            }),
            incoming: Notify::new(),
            idle: Notify::new(),
            shutdown: Notify::new(),
            force_exit: watch::channel(false).0,
        });
        tokio::spawn(
            receive_loop(shared.clone(), table).instrument(info_span!("endpoint", %local_addr)),
        );
        Ok(Self { shared })
    }

    /// Connect to a remote endpoint, waiting until the handshake completes
    ///
    /// `server_name` must be covered by the certificate presented by the server. If the returned
    /// future is dropped before completion, the half-built connection is aborted.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
        config: ClientConfig,
    ) -> Result<Connection, ConnectError> {
        if addr.port() == 0 || addr.ip().is_unspecified() {
            return Err(ConnectError::InvalidRemoteAddress(addr));
        }
        let connection = self.shared.start_client(addr, server_name, &config)?;
        let mut guard = AbortOnDrop(Some(connection.clone()));
        let result = connection.established().await;
        guard.0 = None;
        result?;
        debug!(remote = %addr, "connected");
        Ok(connection)
    }

    /// Wait for the next incoming connection whose handshake was confirmed
    ///
    /// Returns `None` once the endpoint is closing, or if its socket failed.
    pub async fn accept(&self) -> Option<Connection> {
        loop {
            let incoming = self.shared.incoming.notified();
            tokio::pin!(incoming);
            incoming.as_mut().enable();
            {
                let mut state = self.shared.state();
                if let Some(connection) = state.accept_queue.pop_front() {
                    return Some(connection);
                }
                if state.closing || state.failed {
                    return None;
                }
            }
            incoming.await;
        }
    }

    /// Close every connection and release the socket
    ///
    /// Connections are closed with NO_ERROR and given until `deadline` to finish closing, after
    /// which the remainder are dropped without notice. Later connection attempts fail, in both
    /// directions.
    ///
    /// Returns an error if `deadline` passed before every connection had drained. The socket is
    /// released in either case.
    pub async fn close(&self, deadline: Instant) -> Result<(), Elapsed> {
        let connections = {
            let mut state = self.shared.state();
            state.closing = true;
            state.accept_queue.clear();
            state.connections.values().cloned().collect::<Vec<_>>()
        };
        debug!(count = connections.len(), "closing endpoint");
        self.shared.incoming.notify_waiters();

        let graceful = tokio::time::timeout_at(deadline.into(), async {
            for connection in &connections {
                connection
                    .begin_close(TransportError::from(TransportErrorCode::NO_ERROR).into())
                    .await;
            }
            self.wait_idle().await;
        })
        .await;
        if graceful.is_err() {
            debug!("close deadline passed, dropping remaining connections");
            let _ = self.shared.force_exit.send(true);
            self.wait_idle().await;
        }
        self.shared.release(&mut self.shared.state());
        graceful
    }

    /// Wait until every connection has drained
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.shared.state().connections.is_empty() {
                return;
            }
            idle.await;
        }
    }

    /// The address the endpoint's socket is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.transport.local_addr()
    }
}

impl Clone for Endpoint {
    fn clone(&self) -> Self {
        self.shared.state().ref_count += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        let Some(count) = state.ref_count.checked_sub(1) else {
            return;
        };
        state.ref_count = count;
        if count > 0 {
            return;
        }
        // Nobody is left to accept or dial; finish once the remaining connections drain
        state.closing = true;
        let unaccepted = mem::take(&mut state.accept_queue);
        if state.connections.is_empty() {
            self.shared.release(&mut state);
        }
        drop(state);
        debug!(unaccepted = unaccepted.len(), "last endpoint handle dropped");
        self.shared.incoming.notify_waiters();
        for connection in unaccepted {
            connection.abort_detached(TransportError::from(TransportErrorCode::NO_ERROR).into());
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_addr", &self.shared.local_addr)
            .field("server", &self.shared.server_config.is_some())
            .finish_non_exhaustive()
    }
}

/// Errors in the setup of an endpoint
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The socket could not be bound or queried
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The endpoint configuration was rejected
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Aborts a connection still being dialed when the dial is canceled
struct AbortOnDrop(Option<Connection>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(connection) = self.0.take() {
            debug!("dial canceled");
            connection.abort_detached(TransportError::from(TransportErrorCode::NO_ERROR).into());
        }
    }
}

/// State shared between the receive loop, connection tasks and endpoint handles
pub(crate) struct Shared {
    transport: Arc<dyn PacketTransport>,
    local_addr: SocketAddr,
    max_udp_payload: u16,
    config: EndpointConfig,
    server_config: Option<Arc<ServerConfig>>,
    cid_generator: Arc<dyn ConnectionIdGenerator>,
    /// Key for the reset tokens of our connection ids
    reset_key: Arc<dyn HmacKey>,
    routes: Arc<RouteUpdates<Route>>,
    pool: ChunkPool,
    state: Mutex<State>,
    /// Wakes `accept` callers
    incoming: Notify,
    /// Signalled when the last connection drained
    idle: Notify,
    /// Stops the receive loop
    shutdown: Notify,
    force_exit: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    /// Every connection that has not drained
    connections: FxHashMap<ConnectionHandle, Connection>,
    next_handle: usize,
    /// Server connections that have not been confirmed yet
    handshaking: FxHashSet<ConnectionHandle>,
    accept_queue: VecDeque<Connection>,
    closing: bool,
    /// The receive loop stopped on a socket error
    failed: bool,
    released: bool,
    /// Live [`Endpoint`] handles; connections do not count
    ref_count: usize,
}

impl State {
    fn new_handle(&mut self) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn routes(&self) -> &RouteUpdates<Route> {
        &self.routes
    }

    pub(crate) fn subscribe_force_exit(&self) -> watch::Receiver<bool> {
        self.force_exit.subscribe()
    }

    pub(crate) fn transmit(&self, datagram: &Datagram<'_>) -> io::Result<()> {
        self.transport.try_send(datagram)
    }

    /// Send an endpoint-generated datagram, which is never retried
    fn send(&self, destination: SocketAddr, contents: &[u8]) {
        if let Err(e) = self.transport.try_send(&Datagram {
            destination,
            contents,
        }) {
            trace!("failed to send endpoint datagram: {}", e);
        }
    }

    /// A server connection confirmed its handshake
    ///
    /// Returns false if it must be refused because the accept queue is closed or full.
    pub(crate) fn server_conn_established(&self, connection: &Connection) -> bool {
        let capacity = self
            .server_config
            .as_ref()
            .map_or(0, |x| x.accept_queue_capacity);
        let mut state = self.state();
        state.handshaking.remove(&connection.handle());
        if state.closing || state.accept_queue.len() >= capacity {
            debug!("refusing established connection");
            return false;
        }
        state.accept_queue.push_back(connection.clone());
        drop(state);
        self.incoming.notify_one();
        true
    }

    /// A connection task exited; forget it and everything routed to it
    pub(crate) fn conn_drained(
        &self,
        handle: ConnectionHandle,
        ids: Vec<ConnectionId>,
        reset_token: Option<ResetToken>,
    ) {
        self.routes.extend(
            ids.into_iter()
                .map(|id| RouteUpdate::RemoveId { id, owner: handle })
                .chain(reset_token.map(|token| RouteUpdate::RemoveToken {
                    token,
                    owner: handle,
                })),
        );
        let mut state = self.state();
        state.connections.remove(&handle);
        state.handshaking.remove(&handle);
        if state.connections.is_empty() {
            self.idle.notify_waiters();
            if state.closing {
                self.release(&mut state);
            }
        }
    }

    fn release(&self, state: &mut State) {
        if state.released {
            return;
        }
        state.released = true;
        debug!("releasing transport");
        self.transport.close();
        self.shutdown.notify_one();
    }

    fn receive_failed(&self) {
        self.state().failed = true;
        self.incoming.notify_waiters();
    }

    fn start_client(
        self: &Arc<Self>,
        remote: SocketAddr,
        server_name: &str,
        config: &ClientConfig,
    ) -> Result<Connection, ConnectError> {
        let mut state = self.state();
        if state.closing || state.failed {
            return Err(ConnectError::EndpointStopping);
        }
        let loc_cid = self.cid_generator.generate_cid();
        let dst_cid = (config.initial_dst_cid_provider)();
        let params = TransportParameters::new(
            &config.transport,
            self.config.max_udp_payload_size,
            loc_cid,
        );
        let session = config.crypto.clone().start_session(server_name, &params)?;
        let conn_state = connection::State::new(
            Setup {
                side: Side::Client,
                config: config.transport.clone(),
                remote,
                session,
                loc_cid,
                preferred_cid: None,
                rem_cid: dst_cid,
                initial_dst_cid: dst_cid,
                orig_dst_cid: dst_cid,
                retry_src_cid: None,
                cid_generator: self.cid_generator.clone(),
                reset_key: self.reset_key.clone(),
                max_udp_payload: self.max_udp_payload,
                pool: self.pool.clone(),
            },
            Instant::now(),
        );

        let handle = state.new_handle();
        let connection =
            connection::spawn(conn_state, handle, self.local_addr, self.clone(), vec![loc_cid]);
        self.routes.push(RouteUpdate::InsertId {
            id: loc_cid,
            owner: handle,
            target: connection.route(),
        });
        state.connections.insert(handle, connection.clone());
        drop(state);
        connection.wake();
        Ok(connection)
    }

    /// Dispatch one received datagram
    async fn handle_datagram(
        self: &Arc<Self>,
        table: &mut RoutingTable<Route>,
        remote: SocketAddr,
        data: BytesMut,
    ) {
        let cid_len = self.cid_generator.cid_len();
        let dst_cid = dst_cid(&data, cid_len);
        if let Some((_, route)) = dst_cid.as_ref().and_then(|x| table.get(x)) {
            deliver(route, ConnectionMessage::Datagram { remote, data }).await;
            return;
        }

        if data.len() < MIN_DATAGRAM_SIZE {
            trace!(len = data.len(), "dropping short datagram");
            return;
        }
        let mut token = [0; RESET_TOKEN_SIZE];
        token.copy_from_slice(&data[data.len() - RESET_TOKEN_SIZE..]);
        if let Some((handle, route)) = table.get_by_token(&token.into()) {
            debug!(?handle, "stateless reset received");
            deliver(route, ConnectionMessage::StatelessReset).await;
            return;
        }

        if data[0] & LONG_HEADER_FORM == 0 {
            if let Some(dst_cid) = dst_cid {
                self.stateless_reset(data.len(), &dst_cid, remote);
            }
            return;
        }

        let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        if version == 0 {
            trace!("dropping unmatched version negotiation");
            return;
        }
        let datagram_len = data.len();
        match PartialDecode::new(data.clone(), cid_len) {
            Err(PacketDecodeError::UnsupportedVersion {
                src_cid,
                dst_cid,
                version,
            }) => {
                if datagram_len < MIN_INITIAL_SIZE as usize {
                    trace!(version, "ignoring short packet with unsupported version");
                    return;
                }
                debug!(version, "sending version negotiation");
                let mut buf = Vec::new();
                packet::version_negotiation(
                    rand::random::<u8>(),
                    &dst_cid,
                    &src_cid,
                    version,
                    &mut buf,
                );
                self.send(remote, &buf);
            }
            Err(e) => trace!("malformed header: {}", e),
            Ok((partial, _)) if partial.is_initial() => {
                self.handle_first_packet(table, remote, partial, data).await
            }
            Ok(_) => trace!("dropping packet for unknown connection"),
        }
    }

    /// Consider an Initial packet from an unknown client
    async fn handle_first_packet(
        self: &Arc<Self>,
        table: &mut RoutingTable<Route>,
        remote: SocketAddr,
        partial: PartialDecode,
        data: BytesMut,
    ) {
        let Some(server_config) = self.server_config.clone() else {
            trace!("not accepting connections");
            return;
        };
        if data.len() < MIN_INITIAL_SIZE as usize {
            debug!(len = data.len(), "ignoring undersized Initial");
            return;
        }
        let dst_cid = partial.dst_cid();
        let Some(src_cid) = partial.src_cid() else {
            return;
        };
        if dst_cid.len() < MIN_CLIENT_INITIAL_CID {
            debug!(%dst_cid, "ignoring Initial with a short destination id");
            return;
        }
        {
            let state = self.state();
            if state.closing || state.failed {
                trace!("endpoint closing, ignoring Initial");
                return;
            }
            if state.handshaking.len() + state.accept_queue.len()
                >= server_config.accept_queue_capacity
            {
                debug!("accept queue full, ignoring Initial");
                return;
            }
        }

        let token = partial.token().unwrap_or(&[]);
        let (orig_dst_cid, retry_src_cid) = if !server_config.use_retry {
            (dst_cid, None)
        } else if token.is_empty() {
            if let Err(e) = self.send_retry(&server_config, remote, &dst_cid, &src_cid) {
                warn!("failed to build retry: {}", e);
            }
            return;
        } else {
            match RetryToken::validate(
                &*server_config.token_key,
                &remote,
                &dst_cid,
                token,
                server_config.retry_token_lifetime,
                SystemTime::now(),
            ) {
                Ok(token) => (token.orig_dst_cid, Some(dst_cid)),
                Err(e) => {
                    debug!("rejecting retry token: {}", e);
                    match initial_close(
                        &*server_config.crypto,
                        &dst_cid,
                        &src_cid,
                        TransportError::INVALID_TOKEN(""),
                    ) {
                        Ok(buf) => self.send(remote, &buf),
                        Err(_) => warn!("failed to build CONNECTION_CLOSE"),
                    }
                    return;
                }
            }
        };

        let loc_cid = self.cid_generator.generate_cid();
        let mut params = TransportParameters::new(
            &server_config.transport,
            self.config.max_udp_payload_size,
            loc_cid,
        );
        params.original_dst_cid = Some(orig_dst_cid);
        params.retry_src_cid = retry_src_cid;
        params.stateless_reset_token = Some(ResetToken::new(&*self.reset_key, &loc_cid));
        let preferred_cid = (server_config.preferred_address_v4.is_some()
            || server_config.preferred_address_v6.is_some())
        .then(|| self.cid_generator.generate_cid());
        if let Some(connection_id) = preferred_cid {
            params.preferred_address = Some(PreferredAddress {
                address_v4: server_config.preferred_address_v4,
                address_v6: server_config.preferred_address_v6,
                connection_id,
                stateless_reset_token: ResetToken::new(&*self.reset_key, &connection_id),
            });
        }
        let session = match server_config.crypto.clone().start_session(&params) {
            Ok(session) => session,
            Err(e) => {
                warn!("failed to start TLS session: {}", e);
                return;
            }
        };

        let mut conn_state = connection::State::new(
            Setup {
                side: Side::Server,
                config: server_config.transport.clone(),
                remote,
                session,
                loc_cid,
                preferred_cid,
                rem_cid: src_cid,
                initial_dst_cid: dst_cid,
                orig_dst_cid,
                retry_src_cid,
                cid_generator: self.cid_generator.clone(),
                reset_key: self.reset_key.clone(),
                max_udp_payload: self.max_udp_payload,
                pool: self.pool.clone(),
            },
            Instant::now(),
        );
        if retry_src_cid.is_some() {
            conn_state.validate_address();
        }
        // Further Initials still carry the id the client picked
        let mut routed = vec![dst_cid];
        routed.extend(conn_state.local_ids().copied());

        let connection = {
            let mut state = self.state();
            let handle = state.new_handle();
            let connection = connection::spawn(
                conn_state,
                handle,
                self.local_addr,
                self.clone(),
                routed.clone(),
            );
            state.connections.insert(handle, connection.clone());
            state.handshaking.insert(handle);
            connection
        };
        debug!(%remote, handle = ?connection.handle(), "accepted new connection");
        for id in routed {
            table.insert_now(id, connection.handle(), connection.route());
        }
        deliver(
            &connection.route(),
            ConnectionMessage::Datagram { remote, data },
        )
        .await;
    }

    fn send_retry(
        &self,
        server_config: &ServerConfig,
        remote: SocketAddr,
        dst_cid: &ConnectionId,
        src_cid: &ConnectionId,
    ) -> Result<(), CryptoError> {
        let retry_src_cid = self.cid_generator.generate_cid();
        let token = RetryToken {
            orig_dst_cid: *dst_cid,
            issued: SystemTime::now(),
        }
        .encode(&*server_config.token_key, &remote, &retry_src_cid)?;

        let mut buf = Vec::new();
        Header::Retry {
            dst_cid: *src_cid,
            src_cid: retry_src_cid,
        }
        .encode(&mut buf);
        buf.extend_from_slice(&token);
        let tag = server_config.crypto.retry_tag(dst_cid, &buf)?;
        buf.extend_from_slice(&tag);
        debug!(%retry_src_cid, "sending retry");
        self.send(remote, &buf);
        Ok(())
    }

    /// Answer a short-header packet for an unknown connection, if that cannot cause a loop
    fn stateless_reset(&self, trigger_len: usize, dst_cid: &ConnectionId, remote: SocketAddr) {
        let Some(key) = self.config.reset_key.as_ref() else {
            return;
        };
        let Some(buf) = stateless_reset(&**key, trigger_len, dst_cid) else {
            trace!(trigger_len, "trigger too short for stateless reset");
            return;
        };
        debug!(%dst_cid, len = buf.len(), "sending stateless reset");
        self.send(remote, &buf);
    }
}

async fn receive_loop(shared: Arc<Shared>, mut table: RoutingTable<Route>) {
    let mut buf = vec![0; MAX_UDP_PAYLOAD as usize];
    loop {
        let received = tokio::select! {
            result = future::poll_fn(|cx| shared.transport.poll_recv(cx, &mut buf)) => result,
            () = shared.shutdown.notified() => break,
        };
        match received {
            Ok((len, remote)) => {
                table.apply_updates();
                let data = BytesMut::from(&buf[..len]);
                shared.handle_datagram(&mut table, remote, data).await;
            }
            // ICMP unreachable and friends surface here on some platforms
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                ) =>
            {
                trace!("transient receive error: {}", e)
            }
            Err(e) => {
                if !shared.state().released {
                    warn!("receive failed: {}", e);
                    shared.receive_failed();
                }
                break;
            }
        }
    }
    debug!("receive loop stopped");
}

/// Hand a message to a connection task, which may already have exited
async fn deliver(route: &Route, message: ConnectionMessage) {
    if route.send(message).await.is_err() {
        trace!("dropping message for drained connection");
    }
}

/// The destination connection id of the first packet in `data`
fn dst_cid(data: &[u8], local_cid_len: usize) -> Option<ConnectionId> {
    let first = *data.first()?;
    let id = if first & LONG_HEADER_FORM == 0 {
        data.get(1..1 + local_cid_len)?
    } else {
        let len = *data.get(5)? as usize;
        if len > MAX_CID_SIZE {
            return None;
        }
        data.get(6..6 + len)?
    };
    Some(ConnectionId::new(id))
}

/// Build a stateless reset answering a datagram of `trigger_len` bytes sent to `dst_cid`
///
/// The reset is strictly shorter than the trigger so that two endpoints cannot reset each other
/// forever.
fn stateless_reset(
    key: &dyn HmacKey,
    trigger_len: usize,
    dst_cid: &ConnectionId,
) -> Option<Vec<u8>> {
    if trigger_len < MIN_RESET_TRIGGER {
        return None;
    }
    let len = (trigger_len - 1).min(MAX_RESET_SIZE);
    let mut buf = vec![0; len];
    let (body, token) = buf.split_at_mut(len - RESET_TOKEN_SIZE);
    rand::rng().fill_bytes(body);
    // Resemble a short-header packet
    body[0] = (body[0] & !LONG_HEADER_FORM) | packet::FIXED_BIT;
    token.copy_from_slice(&ResetToken::new(key, dst_cid));
    Some(buf)
}

/// A CONNECTION_CLOSE in an Initial packet, sent without creating a connection
fn initial_close(
    crypto: &dyn crypto::ServerConfig,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    reason: TransportError,
) -> Result<Vec<u8>, CryptoError> {
    let keys = crypto.initial_keys(dst_cid);
    let number = PacketNumber::new(0, 0);
    let header = Header::Initial(InitialHeader {
        dst_cid: *src_cid,
        src_cid: *dst_cid,
        token: Bytes::new(),
        number,
    });
    let mut buf = Vec::new();
    let partial_encode = header.encode(&mut buf);
    let tag_len = keys.local.packet.tag_len();
    let max_len = (INITIAL_MTU as usize).saturating_sub(partial_encode.header_len + tag_len);
    Close::from(reason).encode(&mut buf, max_len);
    // Leave room for the header protection sample
    let min_len = (partial_encode.header_len - number.len() + 4 + keys.local.header.sample_size())
        .saturating_sub(tag_len);
    if buf.len() < min_len {
        buf.resize(min_len, 0);
    }
    buf.resize(buf.len() + tag_len, 0);
    partial_encode.finish(
        &mut buf,
        &*keys.local.header,
        Some((0, &*keys.local.packet)),
    )?;
    Ok(buf)
}

/// Address of the same family as `remote` to bind a client socket to
pub(crate) fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}
