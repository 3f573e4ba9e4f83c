//! The protocol state machine of one connection
//!
//! [`State`] performs no I/O and never blocks: it consumes datagrams and timer expirations and
//! produces datagrams, timer deadlines and [`EndpointEvent`]s. The connection task in the parent
//! module drives it.

use std::{
    cmp,
    collections::VecDeque,
    mem,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, trace, warn};

use super::{
    cid_state::{LocalCids, RemoteCids},
    packet_builder::PacketBuilder,
    spaces::{PacketSpace, Retransmits},
    ConnectionError, ConnectionInfo, ConnectionPhase,
};
use crate::{
    cid::{ConnectionId, ConnectionIdGenerator, ResetToken},
    coding::BufMutExt,
    config::TransportConfig,
    crypto::{self, HmacKey, KeyPair, PacketKey, TlsEvent},
    frame::{self, Close, Frame, FrameType},
    packet::{
        self, Header, InitialHeader, LongType, Packet, PacketNumber, PartialDecode, SpaceId,
    },
    path::{AmplificationBudget, PathValidation, PATH_RESPONSE_SIZE},
    recovery::{Fate, LossTracker, Recovery, SentPacket},
    skip::SkipState,
    sparse_window::ChunkPool,
    transport_parameters::TransportParameters,
    Side, TransportError, TransportErrorCode, MIN_INITIAL_SIZE, VERSION,
};

/// Exponent we apply to the ACK delay field of outgoing ACKs; the transport parameter default
const ACK_DELAY_EXPONENT: u8 = 3;

/// Number of probe packets sent when a probe timeout fires
const PROBE_PACKETS: u32 = 2;

/// Smallest room left in a datagram for which starting another packet is worthwhile
const MIN_PACKET_SPACE: usize = 64;

/// Changes the endpoint must make on behalf of a connection
#[derive(Debug)]
pub(crate) enum EndpointEvent {
    /// Route these newly issued connection ids to the connection
    NewIds(Vec<ConnectionId>),
    /// Stop routing a connection id the peer retired
    RetireId(ConnectionId),
    /// The reset token of the peer's connection id in use
    ResetToken(ResetToken),
    /// A server connection confirmed its handshake and may be accepted
    Established,
}

/// RFC 9001 §4.1.2 handshake confirmation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum HandshakeConfirmed {
    Unset,
    /// Confirmed by a server; HANDSHAKE_DONE has yet to be sent
    PendingSend,
    /// Confirmed by a server that sent HANDSHAKE_DONE
    Sent,
    /// Confirmed by a client that received HANDSHAKE_DONE
    Received,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Lifetime {
    Alive,
    /// We sent CONNECTION_CLOSE and wait for it to take effect
    Closing { until: Instant },
    /// The peer closed or reset the connection
    Draining { until: Instant },
    Done,
}

/// Old 1-RTT packet keys kept for reordered packets after a key update
struct PrevCrypto {
    remote: Box<dyn PacketKey>,
    /// First packet number protected with the new keys
    update_pn: u64,
    end: Instant,
}

/// Everything needed to build a connection's [`State`]
pub(crate) struct Setup {
    pub(crate) side: Side,
    pub(crate) config: Arc<TransportConfig>,
    pub(crate) remote: SocketAddr,
    pub(crate) session: Box<dyn crypto::Session>,
    /// The id we put in the source field of long headers
    pub(crate) loc_cid: ConnectionId,
    /// A second local id, advertised with a server's preferred address
    pub(crate) preferred_cid: Option<ConnectionId>,
    /// The destination of our first packets
    pub(crate) rem_cid: ConnectionId,
    /// The destination id the client's Initial keys are derived from
    pub(crate) initial_dst_cid: ConnectionId,
    /// The destination id of the client's very first Initial
    pub(crate) orig_dst_cid: ConnectionId,
    /// Server only: source id of the Retry whose token the client returned
    pub(crate) retry_src_cid: Option<ConnectionId>,
    pub(crate) cid_generator: Arc<dyn ConnectionIdGenerator>,
    pub(crate) reset_key: Arc<dyn HmacKey>,
    pub(crate) max_udp_payload: u16,
    pub(crate) pool: ChunkPool,
}

pub(crate) struct State {
    side: Side,
    config: Arc<TransportConfig>,
    remote: SocketAddr,
    session: Box<dyn crypto::Session>,
    loss: Box<dyn LossTracker>,
    spaces: [PacketSpace; 3],
    /// 1-RTT keys to switch to when the peer flips the key phase
    next_crypto: Option<KeyPair<Box<dyn PacketKey>>>,
    prev_crypto: Option<PrevCrypto>,
    key_phase: bool,
    handshake_complete: bool,
    handshake_confirmed: HandshakeConfirmed,

    lifetime: Lifetime,
    /// Why the connection ended; recorded once
    error: Option<ConnectionError>,
    /// Frame sent, and repeated, while closing
    close: Option<Close>,
    close_pending: bool,
    received_while_closing: u64,

    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    handshake_deadline: Instant,
    keep_alive_deadline: Option<Instant>,

    local_cids: LocalCids,
    remote_cids: RemoteCids,
    handshake_cid: ConnectionId,
    orig_dst_cid: ConnectionId,
    retry_src_cid: Option<ConnectionId>,
    /// Source id of the peer's first Initial
    peer_initial_src_cid: Option<ConnectionId>,
    /// Client only: token from a Retry, echoed in later Initials
    retry_token: Bytes,
    cid_generator: Arc<dyn ConnectionIdGenerator>,
    reset_key: Arc<dyn HmacKey>,

    peer_params: Option<TransportParameters>,
    peer_ack_delay_exponent: u8,
    /// Connection-level send limit granted by the peer
    max_data: u64,
    max_streams_bidi: u64,
    max_streams_uni: u64,
    mtu: u16,

    skip: SkipState,
    rng: StdRng,
    path: PathValidation,
    amplification: AmplificationBudget,
    events: VecDeque<EndpointEvent>,
}

impl State {
    pub(crate) fn new(setup: Setup, now: Instant) -> Self {
        let Setup {
            side,
            config,
            remote,
            session,
            loc_cid,
            preferred_cid,
            rem_cid,
            initial_dst_cid,
            orig_dst_cid,
            retry_src_cid,
            cid_generator,
            reset_key,
            max_udp_payload,
            pool,
        } = setup;

        let mtu = config.initial_mtu.min(max_udp_payload);
        let loss: Box<dyn LossTracker> = Box::new(Recovery::new(side, &config, mtu));
        let mut spaces = [(); 3].map(|()| PacketSpace::new(pool.clone(), config.crypto_buffer_size));
        let keys = session.initial_keys(&initial_dst_cid, side);
        spaces[SpaceId::Initial as usize].write_keys = Some(keys.local);
        spaces[SpaceId::Initial as usize].read_keys = Some(keys.remote);

        let mut rng = StdRng::from_os_rng();
        let mut this = Self {
            side,
            remote,
            session,
            loss,
            spaces,
            next_crypto: None,
            prev_crypto: None,
            key_phase: false,
            handshake_complete: false,
            handshake_confirmed: HandshakeConfirmed::Unset,

            lifetime: Lifetime::Alive,
            error: None,
            close: None,
            close_pending: false,
            received_while_closing: 0,

            idle_timeout: config
                .max_idle_timeout
                .map(|x| Duration::from_millis(x.into_inner())),
            idle_deadline: None,
            handshake_deadline: now + config.handshake_timeout,
            keep_alive_deadline: None,

            local_cids: LocalCids::new(loc_cid, preferred_cid),
            remote_cids: RemoteCids::new(rem_cid),
            handshake_cid: loc_cid,
            orig_dst_cid,
            retry_src_cid,
            // A server learns the client's id from the Initial that created it
            peer_initial_src_cid: side.is_server().then_some(rem_cid),
            retry_token: Bytes::new(),
            cid_generator,
            reset_key,

            peer_params: None,
            peer_ack_delay_exponent: 3,
            max_data: 0,
            max_streams_bidi: 0,
            max_streams_uni: 0,
            mtu,

            skip: SkipState::new(&mut rng),
            rng,
            path: PathValidation::default(),
            // A client contacted the server's address itself
            amplification: AmplificationBudget::new(side.is_client()),
            events: VecDeque::new(),
            config,
        };
        // Anything the TLS session produced eagerly, such as a ClientHello
        if let Err(e) = this.process_tls_events(now) {
            this.close_with_error(now, e);
        }
        this.reset_idle_timeout(now);
        this
    }

    /// The peer proved ownership of its address before the connection was created
    pub(crate) fn validate_address(&mut self) {
        self.amplification.validate();
    }

    pub(crate) fn side(&self) -> Side {
        self.side
    }

    pub(crate) fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// Local ids that must be routed to this connection from the start
    pub(crate) fn local_ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.local_cids.ids()
    }

    pub(crate) fn poll_endpoint_event(&mut self) -> Option<EndpointEvent> {
        self.events.pop_front()
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.lifetime == Lifetime::Done
    }

    pub(crate) fn error(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }


    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            side: self.side,
            alpn_protocol: self.session.alpn_protocol(),
            has_peer_certificates: self.session.peer_identity().is_some(),
            handshake_confirmed: self.handshake_confirmed != HandshakeConfirmed::Unset,
            phase: match self.lifetime {
                Lifetime::Alive if self.handshake_complete => ConnectionPhase::Established,
                Lifetime::Alive => ConnectionPhase::Handshaking,
                Lifetime::Closing { .. } => ConnectionPhase::Closing,
                Lifetime::Draining { .. } => ConnectionPhase::Draining,
                Lifetime::Done => ConnectionPhase::Closed,
            },
            rtt: self.loss.rtt(),
            peer_max_data: self.max_data,
            peer_max_streams_bidi: self.max_streams_bidi,
            peer_max_streams_uni: self.max_streams_uni,
        }
    }

    /// Release the TLS session once the connection is gone
    pub(crate) fn close_session(&mut self) {
        self.session.close();
    }

    //
    // Input
    //

    /// Process a datagram routed to this connection, which may hold several coalesced packets
    pub(crate) fn handle_datagram(&mut self, now: Instant, remote: SocketAddr, data: BytesMut) {
        if self.lifetime == Lifetime::Done {
            return;
        }
        if remote != self.remote {
            trace!(%remote, "dropping datagram from unknown address");
            return;
        }
        let datagram_len = data.len();
        self.amplification.on_received(datagram_len);

        let local_cid_len = self.cid_generator.cid_len();
        let mut remaining = Some(data);
        while let Some(data) = remaining.take() {
            match PartialDecode::new(data, local_cid_len) {
                Ok((partial, rest)) => {
                    remaining = rest;
                    self.handle_decode(now, partial, datagram_len);
                }
                Err(e) => {
                    trace!("malformed header: {}", e);
                    return;
                }
            }
            if self.lifetime == Lifetime::Done {
                return;
            }
        }
    }

    /// The endpoint saw a stateless reset carrying the peer's token
    pub(crate) fn handle_stateless_reset(&mut self, now: Instant) {
        match self.lifetime {
            Lifetime::Alive | Lifetime::Closing { .. } => {
                debug!("stateless reset received");
                self.set_error(ConnectionError::Reset);
                self.close_pending = false;
                self.lifetime = Lifetime::Draining {
                    until: now + 3 * self.loss.pto(),
                };
            }
            Lifetime::Draining { .. } | Lifetime::Done => {}
        }
    }

    fn handle_decode(&mut self, now: Instant, partial: PartialDecode, datagram_len: usize) {
        let Some(space) = partial.space() else {
            match partial.finish(None) {
                Ok(packet) => self.handle_unprotected(packet),
                Err(e) => trace!("unable to decode packet: {}", e),
            }
            return;
        };
        if partial.is_0rtt() {
            trace!("dropping 0-RTT packet");
            return;
        }
        let Some(keys) = self.spaces[space as usize].read_keys.as_ref() else {
            trace!(?space, "no keys for packet, dropping");
            return;
        };
        let mut packet = match partial.finish(Some(&*keys.header)) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("unable to remove header protection: {}", e);
                return;
            }
        };
        let Some(encoded) = packet.header.number() else {
            return;
        };
        let expected = self.spaces[space as usize]
            .pending_acks
            .largest()
            .map_or(0, |x| x + 1);
        let number = encoded.expand(expected);

        // Pick packet protection keys, accounting for peer-initiated key updates
        let key_update = space == SpaceId::Data && packet.header.key_phase() != self.key_phase;
        let mut switch_keys = false;
        let decrypted = if !key_update {
            keys.packet
                .decrypt(number, &packet.header_data, &mut packet.payload)
        } else if let Some(prev) = self
            .prev_crypto
            .as_ref()
            .filter(|prev| number < prev.update_pn)
        {
            prev.remote
                .decrypt(number, &packet.header_data, &mut packet.payload)
        } else if self.prev_crypto.is_some() {
            trace!(number, "key update before previous keys were dropped");
            return;
        } else {
            if self.next_crypto.is_none() {
                self.next_crypto = self.session.next_1rtt_keys();
            }
            let Some(next) = self.next_crypto.as_ref() else {
                return;
            };
            switch_keys = true;
            next.remote
                .decrypt(number, &packet.header_data, &mut packet.payload)
        };
        if decrypted.is_err() {
            trace!(?space, number, "failed to authenticate packet");
            return;
        }

        if packet.reserved_bits_set() {
            self.close_with_error(
                now,
                TransportError::PROTOCOL_VIOLATION("reserved bits set"),
            );
            return;
        }
        if self.spaces[space as usize].pending_acks.is_duplicate(number) {
            trace!(?space, number, "discarding possible duplicate packet");
            return;
        }
        if switch_keys {
            self.update_keys(now, number);
        }
        trace!(?space, number, len = packet.payload.len(), "received packet");
        self.on_packet_authenticated(now, space, &packet.header);
        let dst_cid = *packet.header.dst_cid();
        let payload = packet.payload.freeze();

        match self.lifetime {
            Lifetime::Alive => {
                match self.process_payload(now, space, number, payload, &dst_cid, datagram_len) {
                    Ok(ack_eliciting) => {
                        // The space may have been discarded while processing its own payload
                        if !self.spaces[space as usize].discarded {
                            self.spaces[space as usize].pending_acks.on_packet(
                                now,
                                space,
                                number,
                                ack_eliciting,
                                self.config.max_ack_delay,
                            );
                        }
                    }
                    Err(e) => self.close_with_error(now, e),
                }
            }
            Lifetime::Closing { .. } => {
                let peer_closed = frame::Iter::new(payload).is_ok_and(|mut frames| {
                    frames.any(|x| matches!(x, Ok(Frame::Close(_))))
                });
                if peer_closed {
                    debug!("peer closed while closing");
                    self.lifetime = Lifetime::Draining {
                        until: now + 3 * self.loss.pto(),
                    };
                    return;
                }
                // Repeat our close, backing off exponentially
                self.received_while_closing += 1;
                if self.received_while_closing.is_power_of_two() {
                    self.close_pending = true;
                }
            }
            Lifetime::Draining { .. } | Lifetime::Done => {}
        }
    }

    /// Handle Retry and Version Negotiation packets
    fn handle_unprotected(&mut self, packet: Packet) {
        // Only a client that has heard nothing from the server acts on these
        if self.side.is_server() || self.peer_initial_src_cid.is_some() {
            trace!("ignoring unexpected unprotected packet");
            return;
        }
        match packet.header {
            Header::Retry { src_cid, .. } => {
                if self.retry_src_cid.is_some() {
                    trace!("ignoring second retry");
                    return;
                }
                let tag_start = match packet.payload.len().checked_sub(16) {
                    Some(x) if x > 0 => x,
                    _ => {
                        trace!("retry without token");
                        return;
                    }
                };
                if !self.session.is_valid_retry(
                    &self.orig_dst_cid,
                    &packet.header_data,
                    &packet.payload,
                ) {
                    debug!("retry integrity check failed");
                    return;
                }
                debug!(%src_cid, "retrying with token");
                self.retry_token = Bytes::copy_from_slice(&packet.payload[..tag_start]);
                self.retry_src_cid = Some(src_cid);
                self.remote_cids.set_initial(src_cid);

                let keys = self.session.initial_keys(&src_cid, self.side);
                let initial = &mut self.spaces[SpaceId::Initial as usize];
                initial.write_keys = Some(keys.local);
                initial.read_keys = Some(keys.remote);
                // Packet numbers keep increasing; only the ClientHello is sent again
                initial.crypto_stream.requeue_unacked();
            }
            Header::VersionNegotiate { .. } => {
                let Ok(versions) = packet::supported_versions(&packet.payload) else {
                    trace!("malformed version negotiation");
                    return;
                };
                if versions.contains(&VERSION) {
                    // Invalid per RFC 9000 §6.2
                    trace!("ignoring version negotiation listing our version");
                    return;
                }
                debug!(?versions, "no supported version");
                self.set_error(ConnectionError::VersionMismatch);
                self.lifetime = Lifetime::Done;
            }
            _ => {}
        }
    }

    fn on_packet_authenticated(&mut self, now: Instant, space: SpaceId, header: &Header) {
        self.reset_idle_timeout(now);
        if self.handshake_confirmed != HandshakeConfirmed::Unset {
            self.reset_keep_alive(now);
        }
        if self.side.is_client() && self.peer_initial_src_cid.is_none() {
            if let Some(&src_cid) = header.src_cid() {
                trace!(%src_cid, "server chose its connection id");
                self.peer_initial_src_cid = Some(src_cid);
                self.remote_cids.set_initial(src_cid);
            }
        }
        if self.side.is_server() && space == SpaceId::Handshake {
            // Only the client could have produced this packet (RFC 9000 §8.1)
            self.amplification.validate();
            self.discard_space(now, SpaceId::Initial);
        }
    }

    /// Handle the frames of an authenticated packet, returning whether any was ack-eliciting
    fn process_payload(
        &mut self,
        now: Instant,
        space: SpaceId,
        number: u64,
        payload: Bytes,
        dst_cid: &ConnectionId,
        datagram_len: usize,
    ) -> Result<bool, TransportError> {
        let mut ack_eliciting = false;
        for result in frame::Iter::new(payload)? {
            let frame = result?;
            if !frame.is_allowed_in(space) {
                return Err(TransportError::PROTOCOL_VIOLATION(format!(
                    "{} frame in {space} packet",
                    frame.ty()
                ))
                .with_frame(frame.ty()));
            }
            ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Padding | Frame::Ping | Frame::Ignored(_) => {}
                Frame::Ack(ack) => self.on_ack_received(now, space, &ack)?,
                Frame::Crypto(crypto) => {
                    self.spaces[space as usize]
                        .crypto_stream
                        .insert(crypto.offset, &crypto.data)
                        .map_err(|e| e.with_frame(FrameType::CRYPTO))?;
                    self.read_crypto(now, space)?;
                }
                Frame::NewToken(_) => {
                    if self.side.is_server() {
                        return Err(TransportError::PROTOCOL_VIOLATION("client sent NEW_TOKEN")
                            .with_frame(FrameType::NEW_TOKEN));
                    }
                    // Tokens for future connections are not retained
                }
                Frame::MaxData(x) => self.max_data = self.max_data.max(x),
                Frame::MaxStreams { bidi, count } => {
                    let limit = match bidi {
                        true => &mut self.max_streams_bidi,
                        false => &mut self.max_streams_uni,
                    };
                    *limit = (*limit).max(count);
                }
                Frame::NewConnectionId(frame) => {
                    let update = self
                        .remote_cids
                        .on_new_cid(&frame)
                        .map_err(|e| e.with_frame(FrameType::NEW_CONNECTION_ID))?;
                    self.spaces[SpaceId::Data as usize]
                        .pending
                        .retire_cids
                        .extend(update.retired);
                    if let Some(Some(token)) = update.switched {
                        self.events.push_back(EndpointEvent::ResetToken(token));
                    }
                }
                Frame::RetireConnectionId { sequence } => {
                    let retired = self
                        .local_cids
                        .retire(sequence, dst_cid)
                        .map_err(|e| e.with_frame(FrameType::RETIRE_CONNECTION_ID))?;
                    if let Some(id) = retired {
                        self.events.push_back(EndpointEvent::RetireId(id));
                        self.issue_cids();
                    }
                }
                Frame::PathChallenge(payload) => {
                    trace!(payload, "PATH_CHALLENGE");
                    self.path.on_challenge(payload, datagram_len);
                }
                Frame::PathResponse(payload) => self.path.on_response(payload)?,
                Frame::HandshakeDone => {
                    if self.side.is_server() {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "client sent HANDSHAKE_DONE",
                        )
                        .with_frame(FrameType::HANDSHAKE_DONE));
                    }
                    self.confirm_handshake(now);
                }
                Frame::Close(close) => {
                    self.on_peer_close(now, close);
                    break;
                }
            }
        }
        trace!(?space, number, ack_eliciting, "processed packet");
        Ok(ack_eliciting)
    }

    fn on_ack_received(
        &mut self,
        now: Instant,
        space: SpaceId,
        ack: &frame::Ack,
    ) -> Result<(), TransportError> {
        let packet_space = &self.spaces[space as usize];
        if packet_space.discarded {
            // Keys went away earlier, possibly in this same datagram
            return Ok(());
        }
        if ack.largest >= packet_space.next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION("unsent packet acked")
                .with_frame(FrameType::ACK));
        }
        if space == SpaceId::Data && ack.iter().any(|range| self.skip.covers_skipped(&range)) {
            return Err(TransportError::PROTOCOL_VIOLATION("skipped packet acked")
                .with_frame(FrameType::ACK));
        }
        let largest = &mut self.spaces[space as usize].largest_acked_packet;
        *largest = Some(largest.map_or(ack.largest, |x| x.max(ack.largest)));

        let delay_micros = ack
            .delay
            .checked_shl(u32::from(self.peer_ack_delay_exponent))
            .unwrap_or(u64::MAX);
        let mut fates = Vec::new();
        self.loss.on_ack_received(
            now,
            space,
            ack,
            Duration::from_micros(delay_micros),
            &mut |space, _, packet, fate| fates.push((space, packet, fate)),
        );
        for (space, packet, fate) in fates {
            self.on_packet_fate(space, packet, fate);
        }
        Ok(())
    }

    fn on_packet_fate(&mut self, space: SpaceId, packet: SentPacket, fate: Fate) {
        let retransmits = packet.retransmits;
        let packet_space = &mut self.spaces[space as usize];
        match fate {
            Fate::Acked => {
                for range in retransmits.crypto {
                    packet_space.crypto_stream.on_ack(range);
                }
            }
            Fate::Lost => {
                for range in retransmits.crypto {
                    packet_space.crypto_stream.on_lost(range);
                }
                let local_cids = &self.local_cids;
                let requeue = Retransmits {
                    crypto: Vec::new(),
                    handshake_done: retransmits.handshake_done,
                    new_cids: retransmits
                        .new_cids
                        .into_iter()
                        .filter(|x| local_cids.contains(&x.id))
                        .collect(),
                    retire_cids: retransmits.retire_cids,
                };
                packet_space.pending += requeue;
            }
        }
    }

    fn read_crypto(&mut self, now: Instant, space: SpaceId) -> Result<(), TransportError> {
        let session = &mut self.session;
        self.spaces[space as usize]
            .crypto_stream
            .read(|data| session.read_handshake(space, data))?;
        self.process_tls_events(now)
    }

    fn process_tls_events(&mut self, now: Instant) -> Result<(), TransportError> {
        while let Some(event) = self.session.next_event() {
            match event {
                TlsEvent::ReadKeys { space, keys } => {
                    trace!(?space, "read keys ready");
                    let packet_space = &mut self.spaces[space as usize];
                    if !packet_space.discarded {
                        packet_space.read_keys = Some(keys);
                    }
                }
                TlsEvent::WriteKeys { space, keys } => {
                    trace!(?space, "write keys ready");
                    let packet_space = &mut self.spaces[space as usize];
                    if !packet_space.discarded {
                        packet_space.write_keys = Some(keys);
                    }
                }
                TlsEvent::HandshakeBytes { space, data } => {
                    self.spaces[space as usize].crypto_stream.write(&data);
                }
                TlsEvent::PeerParams(raw) => {
                    let params = TransportParameters::read(self.side, &mut &raw[..])?;
                    self.handle_peer_params(now, params)?;
                }
                TlsEvent::HandshakeDone => {
                    debug!("handshake complete");
                    self.handshake_complete = true;
                    if self.side.is_server() {
                        self.confirm_handshake(now);
                    }
                    self.issue_cids();
                }
            }
        }
        Ok(())
    }

    fn handle_peer_params(
        &mut self,
        now: Instant,
        params: TransportParameters,
    ) -> Result<(), TransportError> {
        // RFC 9000 §7.3 connection id authentication
        if params.initial_src_cid != self.peer_initial_src_cid {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "initial_source_connection_id mismatch",
            ));
        }
        if self.side.is_client() {
            if params.original_dst_cid != Some(self.orig_dst_cid) {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "original_destination_connection_id mismatch",
                ));
            }
            if params.retry_src_cid != self.retry_src_cid {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "retry_source_connection_id mismatch",
                ));
            }
        }

        self.max_data = params.initial_max_data.into_inner();
        self.max_streams_bidi = params.initial_max_streams_bidi.into_inner();
        self.max_streams_uni = params.initial_max_streams_uni.into_inner();

        // Zero on either side defers to the other (RFC 9000 §10.1)
        self.idle_timeout = match (self.idle_timeout, params.idle_timeout()) {
            (None, x) | (x, None) => x,
            (Some(local), Some(peer)) => Some(cmp::min(local, peer)),
        };
        self.reset_idle_timeout(now);

        self.peer_ack_delay_exponent = params.ack_delay_exponent.into_inner() as u8;
        self.loss.set_max_ack_delay(params.max_ack_delay());
        self.local_cids.set_limit(params.issue_cids_limit());
        self.mtu = cmp::min(
            self.mtu,
            u16::try_from(params.max_udp_payload_size.into_inner()).unwrap_or(u16::MAX),
        );

        if self.side.is_client() {
            if let Some(token) = params.stateless_reset_token {
                self.remote_cids.set_initial_reset_token(token);
                self.events.push_back(EndpointEvent::ResetToken(token));
            }
            if let Some(preferred) = params.preferred_address {
                // Never migrated to, but its id is as good as any other
                self.remote_cids
                    .insert_preferred(preferred.connection_id, preferred.stateless_reset_token);
            }
        }
        self.peer_params = Some(params);
        Ok(())
    }

    /// Hand the peer fresh connection ids up to its limit
    fn issue_cids(&mut self) {
        if !self.handshake_complete {
            return;
        }
        let issued = self
            .local_cids
            .issue(&*self.cid_generator, &*self.reset_key);
        if issued.is_empty() {
            return;
        }
        self.events.push_back(EndpointEvent::NewIds(
            issued.iter().map(|x| x.id).collect(),
        ));
        self.spaces[SpaceId::Data as usize]
            .pending
            .new_cids
            .extend(issued);
    }

    /// Confirm the handshake; later calls have no effect
    fn confirm_handshake(&mut self, now: Instant) {
        if self.handshake_confirmed != HandshakeConfirmed::Unset {
            return;
        }
        debug!("handshake confirmed");
        self.handshake_confirmed = match self.side {
            Side::Client => HandshakeConfirmed::Received,
            Side::Server => {
                self.spaces[SpaceId::Data as usize].pending.handshake_done = true;
                self.events.push_back(EndpointEvent::Established);
                HandshakeConfirmed::PendingSend
            }
        };
        self.reset_idle_timeout(now);
        self.reset_keep_alive(now);
        self.loss.confirm_handshake();
        self.discard_space(now, SpaceId::Initial);
        self.discard_space(now, SpaceId::Handshake);
    }

    /// Permanently drop the keys and state of `space`
    fn discard_space(&mut self, now: Instant, space: SpaceId) {
        debug_assert!(space != SpaceId::Data);
        if self.spaces[space as usize].discarded {
            return;
        }
        trace!(?space, "discarding space");
        let result = self.spaces[space as usize].discard();
        self.loss.discard_keys(now, space);
        if let Err(e) = result {
            self.close_with_error(now, e.with_frame(FrameType::CRYPTO));
        }
    }

    fn update_keys(&mut self, now: Instant, number: u64) {
        let Some(next) = self.next_crypto.take() else {
            return;
        };
        let data = &mut self.spaces[SpaceId::Data as usize];
        let (Some(read), Some(write)) = (data.read_keys.as_mut(), data.write_keys.as_mut())
        else {
            return;
        };
        let old = mem::replace(&mut read.packet, next.remote);
        write.packet = next.local;
        self.prev_crypto = Some(PrevCrypto {
            remote: old,
            update_pn: number,
            end: now + 3 * self.loss.pto(),
        });
        self.key_phase = !self.key_phase;
        debug!(number, key_phase = self.key_phase, "peer updated keys");
    }

    //
    // Closing
    //

    /// Close the connection at the request of the application
    pub(crate) fn close(&mut self, now: Instant, reason: Close) {
        if self.lifetime != Lifetime::Alive {
            return;
        }
        self.set_error(ConnectionError::LocallyClosed);
        self.enter_closing(now, reason);
    }

    /// Close the connection because of a protocol error
    pub(crate) fn close_with_error(&mut self, now: Instant, error: TransportError) {
        if self.lifetime != Lifetime::Alive {
            return;
        }
        debug!("closing connection: {}", error);
        self.set_error(ConnectionError::TransportError(error.clone()));
        self.enter_closing(now, error.into());
    }

    fn enter_closing(&mut self, now: Instant, reason: Close) {
        self.close = Some(reason);
        self.close_pending = true;
        self.lifetime = Lifetime::Closing {
            until: now + 3 * self.loss.pto(),
        };
    }

    fn on_peer_close(&mut self, now: Instant, close: Close) {
        debug!("peer closed connection: {:?}", close);
        self.set_error(close.clone().into());
        if self.lifetime == Lifetime::Alive {
            // Answer once, then go quiet
            self.close = Some(TransportError::from(TransportErrorCode::NO_ERROR).into());
            self.close_pending = true;
        }
        self.lifetime = Lifetime::Draining {
            until: now + 3 * self.loss.pto(),
        };
    }

    /// Leave immediately without telling the peer
    pub(crate) fn kill(&mut self, error: ConnectionError) {
        self.set_error(error);
        self.close_pending = false;
        self.lifetime = Lifetime::Done;
    }

    fn set_error(&mut self, error: ConnectionError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    //
    // Timers
    //

    fn reset_idle_timeout(&mut self, now: Instant) {
        let pto = self.loss.pto();
        self.idle_deadline = self.idle_timeout.map(|x| now + cmp::max(x, 3 * pto));
    }

    fn reset_keep_alive(&mut self, now: Instant) {
        let Some(interval) = self.config.keep_alive_interval else {
            return;
        };
        let interval = match self.idle_timeout {
            Some(idle) => cmp::min(interval, idle / 2),
            None => interval,
        };
        self.keep_alive_deadline = Some(now + interval);
    }

    fn idle_expired(&self, now: Instant) -> bool {
        self.idle_deadline.is_some_and(|x| x <= now)
            || (self.handshake_confirmed == HandshakeConfirmed::Unset
                && self.handshake_deadline <= now)
    }

    /// Earliest time at which [`handle_timeout`](Self::handle_timeout) has work to do
    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        let mut deadlines = vec![self.idle_deadline, self.keep_alive_deadline];
        if self.handshake_confirmed == HandshakeConfirmed::Unset {
            deadlines.push(Some(self.handshake_deadline));
        }
        match self.lifetime {
            Lifetime::Alive => {
                deadlines.push(self.loss.timer());
                deadlines.push(self.spaces[SpaceId::Data as usize].pending_acks.deadline());
                deadlines.push(self.prev_crypto.as_ref().map(|x| x.end));
            }
            Lifetime::Closing { until } | Lifetime::Draining { until } => {
                deadlines.push(Some(until))
            }
            Lifetime::Done => return None,
        }
        deadlines.into_iter().flatten().min()
    }

    pub(crate) fn handle_timeout(&mut self, now: Instant) {
        if self.lifetime == Lifetime::Done {
            return;
        }
        if self.idle_expired(now) {
            debug!("idle timeout");
            self.kill(ConnectionError::TimedOut);
            return;
        }
        match self.lifetime {
            Lifetime::Alive => {
                let mut fates = Vec::new();
                let probe = self.loss.advance(now, &mut |space, _, packet, fate| {
                    fates.push((space, packet, fate))
                });
                for (space, packet, fate) in fates {
                    self.on_packet_fate(space, packet, fate);
                }
                if let Some(space) = probe {
                    self.on_probe_timeout(space);
                }
                if self.prev_crypto.as_ref().is_some_and(|x| x.end <= now) {
                    trace!("dropping previous 1-RTT keys");
                    self.prev_crypto = None;
                }
                if self.keep_alive_deadline.is_some_and(|x| x <= now) {
                    trace!("sending keep-alive");
                    self.spaces[SpaceId::Data as usize].ping_pending = true;
                    self.reset_keep_alive(now);
                }
            }
            Lifetime::Closing { until } | Lifetime::Draining { until } => {
                if until <= now {
                    debug!("drained");
                    self.lifetime = Lifetime::Done;
                }
            }
            Lifetime::Done => {}
        }
    }

    fn on_probe_timeout(&mut self, space: SpaceId) {
        let usable = |s: &PacketSpace| !s.discarded && s.write_keys.is_some();
        let space = [space, SpaceId::Handshake, SpaceId::Initial]
            .into_iter()
            .find(|&x| usable(&self.spaces[x as usize]));
        let Some(space) = space else {
            return;
        };
        trace!(?space, "sending probes");
        let packet_space = &mut self.spaces[space as usize];
        packet_space.loss_probes = PROBE_PACKETS;
        packet_space.ensure_probe_queued();
    }

    //
    // Output
    //

    /// Produce the next datagram to send, if any
    pub(crate) fn poll_transmit(&mut self, now: Instant) -> Option<Vec<u8>> {
        let buf = match self.lifetime {
            Lifetime::Done => return None,
            Lifetime::Closing { .. } | Lifetime::Draining { .. } => {
                if !self.close_pending {
                    return None;
                }
                self.close_pending = false;
                self.write_close()?
            }
            Lifetime::Alive => self.write_packets(now)?,
        };
        self.amplification.on_sent(buf.len());
        Some(buf)
    }

    fn max_datagram(&self) -> usize {
        cmp::min(self.mtu as usize, self.amplification.remaining())
    }

    fn write_packets(&mut self, now: Instant) -> Option<Vec<u8>> {
        let max_datagram = self.max_datagram();
        let mut buf = Vec::with_capacity(self.mtu as usize);
        let mut pad_datagram = false;
        let mut sent_handshake = false;
        let mut last: Option<(PacketBuilder, Retransmits)> = None;

        for space in SpaceId::iter() {
            if !self.space_can_send(now, space) {
                continue;
            }
            if max_datagram.saturating_sub(buf.len()) < MIN_PACKET_SPACE {
                break;
            }
            if let Some((builder, sent)) = last.take() {
                self.finish_packet(now, builder, sent, &mut buf);
            }
            let Some(mut builder) = self.begin_packet(space, &mut buf, max_datagram) else {
                break;
            };
            let sent = self.populate_packet(now, &mut builder, &mut buf, &mut pad_datagram);
            // RFC 9000 §14.1: datagrams carrying ack-eliciting Initials are expanded
            if space == SpaceId::Initial && (builder.ack_eliciting || self.side.is_client()) {
                pad_datagram = true;
            }
            if space == SpaceId::Handshake && self.side.is_client() {
                sent_handshake = true;
            }
            last = Some((builder, sent));
        }

        let (mut builder, sent) = last?;
        if pad_datagram {
            builder.pad_to(MIN_INITIAL_SIZE);
        }
        self.finish_packet(now, builder, sent, &mut buf);
        if sent_handshake {
            // RFC 9001 §4.9.1
            self.discard_space(now, SpaceId::Initial);
        }
        (!buf.is_empty()).then_some(buf)
    }

    fn space_can_send(&self, now: Instant, space: SpaceId) -> bool {
        let packet_space = &self.spaces[space as usize];
        if packet_space.discarded || packet_space.write_keys.is_none() {
            return false;
        }
        packet_space.pending_acks.ack_required(now)
            || packet_space.has_pending()
            || packet_space.loss_probes > 0
            || (space == SpaceId::Data && self.path.is_pending())
    }

    fn begin_packet(
        &mut self,
        space: SpaceId,
        buf: &mut Vec<u8>,
        max_datagram: usize,
    ) -> Option<PacketBuilder> {
        let packet_space = &mut self.spaces[space as usize];
        let number = match space {
            SpaceId::Data => self
                .skip
                .next_packet_number(packet_space.next_packet_number, &mut self.rng),
            _ => packet_space.next_packet_number,
        };
        let encoded = PacketNumber::new(number, packet_space.largest_acked_packet.unwrap_or(0));
        let dst_cid = self.remote_cids.current();
        let header = match space {
            SpaceId::Initial => Header::Initial(InitialHeader {
                dst_cid,
                src_cid: self.handshake_cid,
                token: self.retry_token.clone(),
                number: encoded,
            }),
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                dst_cid,
                src_cid: self.handshake_cid,
                number: encoded,
            },
            SpaceId::Data => Header::Short {
                spin: false,
                key_phase: self.key_phase,
                dst_cid,
                number: encoded,
            },
        };
        let keys = packet_space.write_keys.as_ref()?;
        let builder = PacketBuilder::new(buf, &header, number, keys, 0, max_datagram)?;
        packet_space.next_packet_number = number + 1;
        Some(builder)
    }

    /// Write every frame that fits and is due into the packet being built
    fn populate_packet(
        &mut self,
        now: Instant,
        builder: &mut PacketBuilder,
        buf: &mut Vec<u8>,
        pad_datagram: &mut bool,
    ) -> Retransmits {
        let space = builder.space;
        let frames_start = buf.len();
        let mut sent = Retransmits::default();
        let packet_space = &mut self.spaces[space as usize];

        if packet_space.pending_acks.can_send()
            && packet_space.pending_acks.size_bound() <= builder.frame_space_remaining(buf)
        {
            packet_space
                .pending_acks
                .write(now, ACK_DELAY_EXPONENT, buf);
        }

        if space == SpaceId::Data {
            if let Some(pad) = self.path.write(buf, builder.frame_space_remaining(buf)) {
                trace!("PATH_RESPONSE");
                builder.ack_eliciting = true;
                *pad_datagram |= pad;
            }

            if packet_space.pending.handshake_done && builder.frame_space_remaining(buf) >= 1 {
                trace!("HANDSHAKE_DONE");
                buf.write(FrameType::HANDSHAKE_DONE);
                packet_space.pending.handshake_done = false;
                sent.handshake_done = true;
                builder.ack_eliciting = true;
                if self.handshake_confirmed == HandshakeConfirmed::PendingSend {
                    self.handshake_confirmed = HandshakeConfirmed::Sent;
                }
            }

            while builder.frame_space_remaining(buf) >= frame::NewConnectionId::SIZE_BOUND {
                let Some(issued) = packet_space.pending.new_cids.pop() else {
                    break;
                };
                trace!(sequence = issued.sequence, id = %issued.id, "NEW_CONNECTION_ID");
                frame::NewConnectionId {
                    sequence: issued.sequence,
                    retire_prior_to: 0,
                    id: issued.id,
                    reset_token: issued.reset_token,
                }
                .encode(buf);
                sent.new_cids.push(issued);
                builder.ack_eliciting = true;
            }

            while builder.frame_space_remaining(buf) >= 9 {
                let Some(sequence) = packet_space.pending.retire_cids.pop() else {
                    break;
                };
                trace!(sequence, "RETIRE_CONNECTION_ID");
                frame::encode_retire_connection_id(sequence, buf);
                sent.retire_cids.push(sequence);
                builder.ack_eliciting = true;
            }
        }

        while let Some(crypto) = packet_space
            .crypto_stream
            .poll_frame(builder.frame_space_remaining(buf))
        {
            trace!(offset = crypto.offset, len = crypto.data.len(), "CRYPTO");
            crypto.encode(buf);
            sent.crypto
                .push(crypto.offset..crypto.offset + crypto.data.len() as u64);
            builder.ack_eliciting = true;
        }

        // A packet is never sent empty, even when the frames it was started for did not fit
        let ping_due = packet_space.ping_pending || packet_space.loss_probes > 0;
        if (ping_due || buf.len() == frames_start)
            && !builder.ack_eliciting
            && builder.frame_space_remaining(buf) >= 1
        {
            trace!("PING");
            buf.write(FrameType::PING);
            builder.ack_eliciting = true;
        }
        if builder.ack_eliciting {
            packet_space.ping_pending = false;
            packet_space.loss_probes = packet_space.loss_probes.saturating_sub(1);
        }
        sent
    }

    fn finish_packet(
        &mut self,
        now: Instant,
        builder: PacketBuilder,
        sent: Retransmits,
        buf: &mut Vec<u8>,
    ) {
        let space = builder.space;
        let number = builder.exact_number;
        let ack_eliciting = builder.ack_eliciting;
        let Some(keys) = self.spaces[space as usize].write_keys.as_ref() else {
            return;
        };
        let size = match builder.finish(buf, keys) {
            Ok(size) => size,
            Err(_) => {
                warn!(?space, number, "packet protection failed");
                return;
            }
        };
        self.loss.on_packet_sent(
            now,
            space,
            number,
            SentPacket {
                time_sent: now,
                size: size as u16,
                ack_eliciting,
                retransmits: sent,
            },
        );
    }

    /// Write CONNECTION_CLOSE in every space the peer may be able to read
    fn write_close(&mut self) -> Option<Vec<u8>> {
        let close = self.close.clone()?;
        let max_datagram = self.max_datagram();
        let mut buf = Vec::with_capacity(self.mtu as usize);
        let mut last: Option<PacketBuilder> = None;
        let mut pad_datagram = false;

        for space in SpaceId::iter() {
            let packet_space = &self.spaces[space as usize];
            if packet_space.discarded || packet_space.write_keys.is_none() {
                continue;
            }
            // A peer still handshaking may be unable to read 1-RTT packets
            if space == SpaceId::Data && !self.handshake_complete && last.is_some() {
                continue;
            }
            if max_datagram.saturating_sub(buf.len()) < MIN_PACKET_SPACE {
                break;
            }
            if let Some(builder) = last.take() {
                self.finish_close_packet(builder, &mut buf);
            }
            let Some(builder) = self.begin_packet(space, &mut buf, max_datagram) else {
                break;
            };
            trace!(?space, "CONNECTION_CLOSE");
            let max_len = builder.frame_space_remaining(&buf);
            close.for_space(space).encode(&mut buf, max_len);
            pad_datagram |= space == SpaceId::Initial && self.side.is_client();
            last = Some(builder);
        }

        let mut builder = last?;
        if pad_datagram {
            builder.pad_to(MIN_INITIAL_SIZE);
        }
        self.finish_close_packet(builder, &mut buf);
        (!buf.is_empty()).then_some(buf)
    }

    fn finish_close_packet(&self, builder: PacketBuilder, buf: &mut Vec<u8>) {
        let space = builder.space;
        if let Some(keys) = self.spaces[space as usize].write_keys.as_ref() {
            if builder.finish(buf, keys).is_err() {
                warn!(?space, "packet protection failed");
            }
        }
    }
}

impl From<Close> for ConnectionError {
    fn from(x: Close) -> Self {
        match x {
            Close::Connection(reason) => Self::ConnectionClosed(reason),
            Close::Application(reason) => Self::ApplicationClosed(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Range;

    use bytes::BufMut;

    use super::*;
    use crate::{
        cid::RandomConnectionIdGenerator, config::random_reset_key, range_set::RangeSet,
        tests::{subscribe, Pki},
        VarInt,
    };

    fn client_addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn server_addr() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    /// A client and a server state machine exchanging datagrams directly
    struct Pair {
        client: State,
        server: State,
        now: Instant,
    }

    impl Pair {
        fn new() -> Self {
            Self::with_transport(TransportConfig::default())
        }

        fn with_transport(transport: TransportConfig) -> Self {
            let pki = Pki::new();
            let transport = Arc::new(transport);
            let generator: Arc<dyn ConnectionIdGenerator> =
                Arc::new(RandomConnectionIdGenerator::new(8));
            let reset_key = random_reset_key();
            let pool = ChunkPool::default();
            let now = Instant::now();
            let max_udp_payload = VarInt::from_u32(1452);

            let client_cid = generator.generate_cid();
            let dst_cid = generator.generate_cid();
            let params = TransportParameters::new(&transport, max_udp_payload, client_cid);
            let session = pki
                .client_config()
                .crypto
                .clone()
                .start_session("localhost", &params)
                .unwrap();
            let client = State::new(
                Setup {
                    side: Side::Client,
                    config: transport.clone(),
                    remote: server_addr(),
                    session,
                    loc_cid: client_cid,
                    preferred_cid: None,
                    rem_cid: dst_cid,
                    initial_dst_cid: dst_cid,
                    orig_dst_cid: dst_cid,
                    retry_src_cid: None,
                    cid_generator: generator.clone(),
                    reset_key: reset_key.clone(),
                    max_udp_payload: 1452,
                    pool: pool.clone(),
                },
                now,
            );

            let server_cid = generator.generate_cid();
            let mut params = TransportParameters::new(&transport, max_udp_payload, server_cid);
            params.original_dst_cid = Some(dst_cid);
            params.stateless_reset_token = Some(ResetToken::new(&*reset_key, &server_cid));
            let session = pki.server_config().crypto.clone().start_session(&params).unwrap();
            let server = State::new(
                Setup {
                    side: Side::Server,
                    config: transport,
                    remote: client_addr(),
                    session,
                    loc_cid: server_cid,
                    preferred_cid: None,
                    rem_cid: client_cid,
                    initial_dst_cid: dst_cid,
                    orig_dst_cid: dst_cid,
                    retry_src_cid: None,
                    cid_generator: generator,
                    reset_key,
                    max_udp_payload: 1452,
                    pool,
                },
                now,
            );
            Self {
                client,
                server,
                now,
            }
        }

        /// A pair that completed and confirmed its handshake
        fn connected() -> Self {
            let mut pair = Self::new();
            pair.drive();
            assert_eq!(pair.client.info().phase, ConnectionPhase::Established);
            assert!(pair.client.info().handshake_confirmed);
            assert!(pair.server.info().handshake_confirmed);
            pair
        }

        /// Deliver every datagram the client has ready, returning how many there were
        fn client_to_server(&mut self) -> usize {
            let mut count = 0;
            while let Some(datagram) = self.client.poll_transmit(self.now) {
                self.server
                    .handle_datagram(self.now, client_addr(), BytesMut::from(&datagram[..]));
                count += 1;
            }
            count
        }

        fn server_to_client(&mut self) -> usize {
            let mut count = 0;
            while let Some(datagram) = self.server.poll_transmit(self.now) {
                self.client
                    .handle_datagram(self.now, server_addr(), BytesMut::from(&datagram[..]));
                count += 1;
            }
            count
        }

        /// Exchange datagrams until both sides go quiet
        fn drive(&mut self) {
            for _ in 0..64 {
                if self.client_to_server() + self.server_to_client() == 0 {
                    return;
                }
            }
            panic!("connection never went quiet");
        }

        /// Build a client packet in `space` holding the frames `write` appends
        fn client_packet(
            &mut self,
            space: SpaceId,
            pad: bool,
            write: impl FnOnce(&mut State, &mut Vec<u8>),
        ) -> BytesMut {
            let mut buf = Vec::new();
            let max_datagram = self.client.max_datagram();
            let mut builder = self
                .client
                .begin_packet(space, &mut buf, max_datagram)
                .unwrap();
            write(&mut self.client, &mut buf);
            builder.ack_eliciting = true;
            if pad {
                builder.pad_to(MIN_INITIAL_SIZE);
            }
            self.client
                .finish_packet(self.now, builder, Retransmits::default(), &mut buf);
            BytesMut::from(&buf[..])
        }

        fn send_to_server(&mut self, datagram: BytesMut) {
            self.server.handle_datagram(self.now, client_addr(), datagram);
        }
    }

    fn write_ack(acked: Range<u64>, buf: &mut Vec<u8>) {
        let mut ranges = RangeSet::new();
        ranges.insert(acked);
        frame::Ack::encode(0, &ranges, buf);
    }

    fn transport_error(state: &State) -> &TransportError {
        match state.error() {
            Some(ConnectionError::TransportError(e)) => e,
            other => panic!("expected a transport error, got {other:?}"),
        }
    }

    #[test]
    fn path_response_fits_minimum_packet_space() {
        assert!(PATH_RESPONSE_SIZE < MIN_PACKET_SPACE);
    }

    #[test]
    fn handshake_completes() {
        let _guard = subscribe();
        let pair = Pair::connected();
        assert_eq!(pair.server.info().phase, ConnectionPhase::Established);
        assert!(pair.client.error().is_none());
        assert!(pair.server.error().is_none());
        for side in [&pair.client, &pair.server] {
            assert!(side.spaces[SpaceId::Initial as usize].discarded);
            assert!(side.spaces[SpaceId::Handshake as usize].discarded);
        }
    }

    #[test]
    fn ack_of_unsent_packet_is_violation() {
        let _guard = subscribe();
        let mut pair = Pair::connected();
        let datagram = pair.client_packet(SpaceId::Data, false, |_, buf| {
            write_ack(1000..1001, buf);
        });
        pair.send_to_server(datagram);
        let error = transport_error(&pair.server);
        assert_eq!(error.code, TransportErrorCode::PROTOCOL_VIOLATION);
        assert_eq!(error.frame, Some(FrameType::ACK));
        assert_eq!(pair.server.info().phase, ConnectionPhase::Closing);
    }

    #[test]
    fn ack_of_skipped_packet_is_violation() {
        let _guard = subscribe();
        let mut pair = Pair::connected();

        // Jump the server straight to its next skip, then make it send a packet past it
        let skipped = pair.server.skip.upcoming();
        let data = &mut pair.server.spaces[SpaceId::Data as usize];
        data.next_packet_number = skipped;
        data.ping_pending = true;
        assert!(pair.server.poll_transmit(pair.now).is_some());
        assert_eq!(
            pair.server.spaces[SpaceId::Data as usize].next_packet_number,
            skipped + 2
        );

        let datagram = pair.client_packet(SpaceId::Data, false, |_, buf| {
            write_ack(skipped..skipped + 2, buf);
        });
        pair.send_to_server(datagram);
        let error = transport_error(&pair.server);
        assert_eq!(error.code, TransportErrorCode::PROTOCOL_VIOLATION);
        assert_eq!(error.frame, Some(FrameType::ACK));
    }

    #[test]
    fn handshake_ack_of_unsent_packet_is_violation() {
        let _guard = subscribe();
        let mut pair = Pair::new();
        pair.client_to_server();
        pair.server_to_client();
        let datagram = pair.client_packet(SpaceId::Handshake, false, |_, buf| {
            write_ack(1000..1001, buf);
        });
        pair.send_to_server(datagram);
        assert_eq!(
            transport_error(&pair.server).code,
            TransportErrorCode::PROTOCOL_VIOLATION
        );
    }

    #[test]
    fn stale_ack_after_discard_is_ignored() {
        let _guard = subscribe();
        let mut pair = Pair::new();
        pair.client_to_server();
        pair.server_to_client();
        assert!(pair.client.handshake_complete);

        // The client Finished completes the server's handshake, discarding the Handshake space
        // before the ACK that follows it in the same packet is read
        let datagram = pair.client_packet(SpaceId::Handshake, false, |client, buf| {
            let finished = client.spaces[SpaceId::Handshake as usize]
                .crypto_stream
                .poll_frame(1000)
                .unwrap();
            finished.encode(buf);
            write_ack(1000..1001, buf);
        });
        pair.send_to_server(datagram);
        assert!(pair.server.error().is_none());
        assert!(pair.server.info().handshake_confirmed);
        assert!(pair.server.spaces[SpaceId::Handshake as usize].discarded);

        // Later packets of the discarded space are dropped unread
        let datagram = pair.client_packet(SpaceId::Handshake, false, |_, buf| {
            write_ack(1000..1001, buf);
            buf.write(FrameType::PING);
        });
        pair.send_to_server(datagram);
        assert!(pair.server.error().is_none());
        assert!(pair.server.spaces[SpaceId::Handshake as usize]
            .pending_acks
            .largest()
            .is_none());

        pair.drive();
        assert!(pair.client.info().handshake_confirmed);
        assert!(pair.client.error().is_none());
        assert!(pair.server.error().is_none());
    }

    #[test]
    fn handshake_done_sent_once() {
        let _guard = subscribe();
        let mut pair = Pair::connected();
        assert_eq!(pair.server.handshake_confirmed, HandshakeConfirmed::Sent);

        pair.server.confirm_handshake(pair.now);
        assert_eq!(pair.server.handshake_confirmed, HandshakeConfirmed::Sent);
        assert!(!pair.server.spaces[SpaceId::Data as usize].pending.handshake_done);
        assert!(pair.server.poll_transmit(pair.now).is_none());
    }

    #[test]
    fn unsolicited_path_response_closes() {
        let _guard = subscribe();
        let mut pair = Pair::connected();
        let datagram = pair.client_packet(SpaceId::Data, false, |_, buf| {
            frame::encode_path_response(0x0123_4567_89ab_cdef, buf);
        });
        pair.send_to_server(datagram);
        let error = transport_error(&pair.server);
        assert_eq!(error.code, TransportErrorCode::PROTOCOL_VIOLATION);
        assert_eq!(error.frame, Some(FrameType::PATH_RESPONSE));

        // The CONNECTION_CLOSE reaches the client, which starts draining
        pair.server_to_client();
        assert_eq!(pair.client.info().phase, ConnectionPhase::Draining);
        match pair.client.error() {
            Some(ConnectionError::ConnectionClosed(close)) => {
                assert_eq!(close.error_code, TransportErrorCode::PROTOCOL_VIOLATION);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn path_response_matches_challenge_padding() {
        let _guard = subscribe();
        let mut pair = Pair::connected();

        let datagram = pair.client_packet(SpaceId::Data, true, |_, buf| {
            buf.write(FrameType::PATH_CHALLENGE);
            buf.put_u64(1);
        });
        assert!(datagram.len() >= MIN_INITIAL_SIZE as usize);
        pair.send_to_server(datagram);
        let response = pair.server.poll_transmit(pair.now).unwrap();
        assert!(response.len() >= MIN_INITIAL_SIZE as usize);
        assert!(!pair.server.path.is_pending());

        let datagram = pair.client_packet(SpaceId::Data, false, |_, buf| {
            buf.write(FrameType::PATH_CHALLENGE);
            buf.put_u64(2);
        });
        assert!(datagram.len() < MIN_INITIAL_SIZE as usize);
        pair.send_to_server(datagram);
        let response = pair.server.poll_transmit(pair.now).unwrap();
        assert!(response.len() < MIN_INITIAL_SIZE as usize);
        assert!(pair.server.error().is_none());
    }

    #[test]
    fn idle_timeout() {
        let _guard = subscribe();
        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(VarInt::from_u32(1_000).into()));
        let mut pair = Pair::with_transport(transport);
        pair.drive();
        assert!(pair.server.info().handshake_confirmed);

        // The client never answers again
        for _ in 0..64 {
            let Some(deadline) = pair.server.poll_timeout() else {
                break;
            };
            assert!(pair.server.error().is_none());
            pair.now = deadline;
            pair.server.handle_timeout(deadline);
            while pair.server.poll_transmit(deadline).is_some() {}
        }
        assert!(pair.server.is_drained());
        assert!(matches!(pair.server.error(), Some(ConnectionError::TimedOut)));
        assert!(pair.now >= pair.server.idle_deadline.unwrap());
    }
}
