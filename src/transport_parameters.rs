//! Transport parameters exchanged in the TLS handshake (RFC 9000 §18)
//!
//! Only the parameters a handshake-level engine acts on are understood. Stream flow control
//! parameters are neither sent nor interpreted; like every unknown id they are skipped on read.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6},
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes};
use rand::Rng;
use thiserror::Error;

use crate::{
    cid::{ConnectionId, ResetToken},
    coding::{BufExt, BufMutExt, UnexpectedEnd},
    config::TransportConfig,
    Side, TransportError, VarInt, LOC_CID_COUNT, MAX_CID_SIZE, MAX_STREAM_COUNT, RESET_TOKEN_SIZE,
};

/// Parameter ids, from the IANA registry
mod id {
    pub(super) const ORIGINAL_DST_CID: u64 = 0x00;
    pub(super) const MAX_IDLE_TIMEOUT: u64 = 0x01;
    pub(super) const STATELESS_RESET_TOKEN: u64 = 0x02;
    pub(super) const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
    pub(super) const INITIAL_MAX_DATA: u64 = 0x04;
    pub(super) const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
    pub(super) const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
    pub(super) const ACK_DELAY_EXPONENT: u64 = 0x0a;
    pub(super) const MAX_ACK_DELAY: u64 = 0x0b;
    pub(super) const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
    pub(super) const PREFERRED_ADDRESS: u64 = 0x0d;
    pub(super) const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
    pub(super) const INITIAL_SRC_CID: u64 = 0x0f;
    pub(super) const RETRY_SRC_CID: u64 = 0x10;

    /// Bit `n` is set when id `n` is understood
    pub(super) const KNOWN: u32 = 0x1_ff1f;
}

/// Idle timeouts beyond this many milliseconds (about 49 days) are treated as none
const MAX_IDLE_MILLIS: u64 = 1 << 32;

/// The parameters one side of a connection announced
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransportParameters {
    /// Milliseconds; zero disables
    pub(crate) max_idle_timeout: VarInt,
    pub(crate) max_udp_payload_size: VarInt,
    /// Connection-level flow control limit for data sent to the announcing side
    pub(crate) initial_max_data: VarInt,
    pub(crate) initial_max_streams_bidi: VarInt,
    pub(crate) initial_max_streams_uni: VarInt,
    pub(crate) ack_delay_exponent: VarInt,
    /// Milliseconds
    pub(crate) max_ack_delay: VarInt,
    pub(crate) active_connection_id_limit: VarInt,
    pub(crate) disable_active_migration: bool,

    /// Source id of the first Initial sent by the announcing side
    pub(crate) initial_src_cid: Option<ConnectionId>,
    /// Server only: destination id of the client's first Initial
    pub(crate) original_dst_cid: Option<ConnectionId>,
    /// Server only: source id of the Retry the client answered
    pub(crate) retry_src_cid: Option<ConnectionId>,
    /// Server only
    pub(crate) stateless_reset_token: Option<ResetToken>,
    /// Server only
    pub(crate) preferred_address: Option<PreferredAddress>,
}

impl TransportParameters {
    /// What a peer is assumed to have announced for every parameter it left out
    pub(crate) fn absent() -> Self {
        Self {
            max_idle_timeout: VarInt(0),
            max_udp_payload_size: VarInt(65527),
            initial_max_data: VarInt(0),
            initial_max_streams_bidi: VarInt(0),
            initial_max_streams_uni: VarInt(0),
            ack_delay_exponent: VarInt(3),
            max_ack_delay: VarInt(25),
            active_connection_id_limit: VarInt(2),
            disable_active_migration: false,
            initial_src_cid: None,
            original_dst_cid: None,
            retry_src_cid: None,
            stateless_reset_token: None,
            preferred_address: None,
        }
    }

    /// Parameters a local endpoint advertises for a fresh connection
    ///
    /// Active migration is always disabled, since connections never leave their first path.
    pub(crate) fn new(
        config: &TransportConfig,
        max_udp_payload_size: VarInt,
        initial_src_cid: ConnectionId,
    ) -> Self {
        Self {
            max_idle_timeout: config.max_idle_timeout.unwrap_or(VarInt(0)),
            max_udp_payload_size,
            initial_max_data: config.receive_window,
            initial_max_streams_bidi: config.max_concurrent_bidi_streams,
            initial_max_streams_uni: config.max_concurrent_uni_streams,
            max_ack_delay: VarInt::from_u64(config.max_ack_delay.as_millis() as u64)
                .unwrap_or(VarInt(25)),
            active_connection_id_limit: VarInt(LOC_CID_COUNT),
            disable_active_migration: true,
            initial_src_cid: Some(initial_src_cid),
            ..Self::absent()
        }
    }

    /// Number of connection ids worth issuing to the peer that sent these parameters
    pub(crate) fn issue_cids_limit(&self) -> u64 {
        self.active_connection_id_limit.0.min(LOC_CID_COUNT)
    }

    /// The idle timeout requested, `None` when disabled
    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        match self.max_idle_timeout.0 {
            0 => None,
            x if x > MAX_IDLE_MILLIS => None,
            x => Some(Duration::from_millis(x)),
        }
    }

    pub(crate) fn max_ack_delay(&self) -> Duration {
        Duration::from_millis(self.max_ack_delay.0)
    }

    /// Integer parameters with their ids and the values they take when absent
    fn integers(&self) -> [(u64, VarInt, u64); 8] {
        [
            (id::MAX_IDLE_TIMEOUT, self.max_idle_timeout, 0),
            (id::MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size, 65527),
            (id::INITIAL_MAX_DATA, self.initial_max_data, 0),
            (id::INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi, 0),
            (id::INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni, 0),
            (id::ACK_DELAY_EXPONENT, self.ack_delay_exponent, 3),
            (id::MAX_ACK_DELAY, self.max_ack_delay, 25),
            (id::ACTIVE_CONNECTION_ID_LIMIT, self.active_connection_id_limit, 2),
        ]
    }

    fn integer_mut(&mut self, id: u64) -> Option<&mut VarInt> {
        Some(match id {
            id::MAX_IDLE_TIMEOUT => &mut self.max_idle_timeout,
            id::MAX_UDP_PAYLOAD_SIZE => &mut self.max_udp_payload_size,
            id::INITIAL_MAX_DATA => &mut self.initial_max_data,
            id::INITIAL_MAX_STREAMS_BIDI => &mut self.initial_max_streams_bidi,
            id::INITIAL_MAX_STREAMS_UNI => &mut self.initial_max_streams_uni,
            id::ACK_DELAY_EXPONENT => &mut self.ack_delay_exponent,
            id::MAX_ACK_DELAY => &mut self.max_ack_delay,
            id::ACTIVE_CONNECTION_ID_LIMIT => &mut self.active_connection_id_limit,
            _ => return None,
        })
    }

    /// Encode every parameter that differs from its absent value
    pub fn write<W: BufMut>(&self, w: &mut W) {
        for (id, value, absent) in self.integers() {
            if value.0 != absent {
                put_header(w, id, value.size());
                w.write(value);
            }
        }
        if self.disable_active_migration {
            put_header(w, id::DISABLE_ACTIVE_MIGRATION, 0);
        }
        let cids = [
            (id::ORIGINAL_DST_CID, self.original_dst_cid),
            (id::INITIAL_SRC_CID, self.initial_src_cid),
            (id::RETRY_SRC_CID, self.retry_src_cid),
        ];
        for (id, cid) in cids {
            if let Some(cid) = cid {
                put_header(w, id, cid.len());
                w.put_slice(&cid);
            }
        }
        if let Some(token) = self.stateless_reset_token {
            put_header(w, id::STATELESS_RESET_TOKEN, RESET_TOKEN_SIZE);
            w.put_slice(&token);
        }
        if let Some(preferred) = self.preferred_address {
            put_header(w, id::PREFERRED_ADDRESS, preferred.wire_size());
            preferred.write(w);
        }
    }

    /// Decode the parameters announced by the peer of `side`
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        let mut params = Self::absent();
        let mut seen = 0u32;
        while r.has_remaining() {
            let id = r.get_var()?;
            let len = usize::try_from(r.get_var()?).map_err(|_| Error::Malformed)?;
            let mut value = r.take_exact(len)?;
            if id >= 32 || id::KNOWN & (1 << id) == 0 {
                // Reserved, extension and stream parameters
                continue;
            }
            if seen & (1 << id) != 0 {
                return Err(Error::Malformed);
            }
            seen |= 1 << id;
            params.apply(id, &mut value)?;
            if value.has_remaining() {
                return Err(Error::Malformed);
            }
        }
        params.validate(side)?;
        Ok(params)
    }

    fn apply(&mut self, id: u64, value: &mut Bytes) -> Result<(), Error> {
        if let Some(slot) = self.integer_mut(id) {
            *slot = value.get()?;
            return Ok(());
        }
        match id {
            id::ORIGINAL_DST_CID => self.original_dst_cid = Some(read_cid(value)?),
            id::INITIAL_SRC_CID => self.initial_src_cid = Some(read_cid(value)?),
            id::RETRY_SRC_CID => self.retry_src_cid = Some(read_cid(value)?),
            id::STATELESS_RESET_TOKEN => {
                self.stateless_reset_token = Some(read_token(value)?);
            }
            id::DISABLE_ACTIVE_MIGRATION => self.disable_active_migration = true,
            id::PREFERRED_ADDRESS => self.preferred_address = Some(PreferredAddress::read(value)?),
            _ => {}
        }
        Ok(())
    }

    /// RFC 9000 §18.2 bounds, and parameters only a server may send
    fn validate(&self, side: Side) -> Result<(), Error> {
        if self.ack_delay_exponent.0 > 20 {
            return Err(Error::IllegalValue("ack_delay_exponent"));
        }
        if self.max_ack_delay.0 >= 1 << 14 {
            return Err(Error::IllegalValue("max_ack_delay"));
        }
        if self.active_connection_id_limit.0 < 2 {
            return Err(Error::IllegalValue("active_connection_id_limit"));
        }
        if self.max_udp_payload_size.0 < 1200 {
            return Err(Error::IllegalValue("max_udp_payload_size"));
        }
        if self.initial_max_streams_bidi.0 > MAX_STREAM_COUNT
            || self.initial_max_streams_uni.0 > MAX_STREAM_COUNT
        {
            return Err(Error::IllegalValue("initial_max_streams"));
        }
        if side.is_server()
            && (self.original_dst_cid.is_some()
                || self.retry_src_cid.is_some()
                || self.stateless_reset_token.is_some()
                || self.preferred_address.is_some())
        {
            return Err(Error::IllegalValue("server-only parameter sent by client"));
        }
        Ok(())
    }
}

/// Append one reserved parameter (RFC 9000 §18.1) so peers keep tolerating unknown ids
pub(crate) fn write_grease<W: BufMut, R: Rng + ?Sized>(w: &mut W, rng: &mut R) {
    let id = 31 * rng.random_range(0..(1u64 << 16)) + 27;
    let len = rng.random_range(0..=8);
    put_header(w, id, len);
    for _ in 0..len {
        w.put_u8(rng.random());
    }
}

fn put_header<W: BufMut>(w: &mut W, id: u64, len: usize) {
    w.write_var(id);
    w.write_var(len as u64);
}

fn read_cid(value: &mut Bytes) -> Result<ConnectionId, Error> {
    if value.len() > MAX_CID_SIZE {
        return Err(Error::Malformed);
    }
    let cid = ConnectionId::new(&value[..]);
    value.advance(value.len());
    Ok(cid)
}

fn read_token(value: &mut impl Buf) -> Result<ResetToken, Error> {
    let mut token = [0; RESET_TOKEN_SIZE];
    if value.remaining() < RESET_TOKEN_SIZE {
        return Err(Error::Malformed);
    }
    value.copy_to_slice(&mut token);
    Ok(token.into())
}

/// Alternative server address announced during the handshake
///
/// Never migrated to; the accompanying connection id is used like any other the server issued.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct PreferredAddress {
    pub(crate) address_v4: Option<SocketAddrV4>,
    pub(crate) address_v6: Option<SocketAddrV6>,
    pub(crate) connection_id: ConnectionId,
    pub(crate) stateless_reset_token: ResetToken,
}

impl PreferredAddress {
    fn wire_size(&self) -> usize {
        (4 + 2) + (16 + 2) + 1 + self.connection_id.len() + RESET_TOKEN_SIZE
    }

    fn write<W: BufMut>(&self, w: &mut W) {
        let (v4, v4_port) = self
            .address_v4
            .map_or((Ipv4Addr::UNSPECIFIED, 0), |x| (*x.ip(), x.port()));
        let (v6, v6_port) = self
            .address_v6
            .map_or((Ipv6Addr::UNSPECIFIED, 0), |x| (*x.ip(), x.port()));
        w.write(v4);
        w.write(v4_port);
        w.write(v6);
        w.write(v6_port);
        self.connection_id.encode_long(w);
        w.put_slice(&self.stateless_reset_token);
    }

    fn read(r: &mut Bytes) -> Result<Self, Error> {
        let v4 = SocketAddrV4::new(r.get()?, r.get()?);
        let v6 = SocketAddrV6::new(r.get()?, r.get()?, 0, 0);
        let connection_id = ConnectionId::decode_long(r).ok_or(Error::Malformed)?;
        if connection_id.is_empty() {
            return Err(Error::IllegalValue("preferred_address connection id"));
        }
        let stateless_reset_token = read_token(r)?;
        let set = |ip_unspecified: bool, port: u16| !(ip_unspecified && port == 0);
        let address_v4 = set(v4.ip().is_unspecified(), v4.port()).then_some(v4);
        let address_v6 = set(v6.ip().is_unspecified(), v6.port()).then_some(v6);
        if address_v4.is_none() && address_v6.is_none() {
            return Err(Error::IllegalValue("preferred_address without address"));
        }
        Ok(Self {
            address_v4,
            address_v6,
            connection_id,
            stateless_reset_token,
        })
    }
}

/// Errors encountered while decoding [`TransportParameters`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    /// A parameter is out of its permitted range or not allowed from this peer
    #[error("illegal value for {0}")]
    IllegalValue(&'static str),
    /// The encoding is broken or a parameter is repeated
    #[error("parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        Self::TRANSPORT_PARAMETER_ERROR(e.to_string())
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Self::Malformed
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{cid::RandomConnectionIdGenerator, ConnectionIdGenerator};

    fn cid(byte: u8) -> ConnectionId {
        ConnectionId::new(&[byte; 8])
    }

    /// What a server announces after validating a Retry token, as the endpoint builds it
    fn server_params() -> TransportParameters {
        let mut params = TransportParameters::new(&TransportConfig::default(), VarInt(1452), cid(1));
        params.original_dst_cid = Some(cid(2));
        params.retry_src_cid = Some(cid(3));
        params.stateless_reset_token = Some([0xcd; RESET_TOKEN_SIZE].into());
        params.preferred_address = Some(PreferredAddress {
            address_v4: Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4433)),
            address_v6: None,
            connection_id: cid(4),
            stateless_reset_token: [0xab; RESET_TOKEN_SIZE].into(),
        });
        params
    }

    fn encode(params: &TransportParameters) -> Vec<u8> {
        let mut buf = Vec::new();
        params.write(&mut buf);
        buf
    }

    #[test]
    fn client_reads_server_params() {
        let params = server_params();
        let decoded = TransportParameters::read(Side::Client, &mut &encode(&params)[..]).unwrap();
        assert_eq!(decoded, params);
        assert_eq!(decoded.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(decoded.max_ack_delay(), Duration::from_millis(25));
        assert_eq!(decoded.issue_cids_limit(), LOC_CID_COUNT);
        assert!(decoded.disable_active_migration);
    }

    #[test]
    fn server_rejects_server_only_params() {
        let client = TransportParameters::new(&TransportConfig::default(), VarInt(1200), cid(5));
        let mut buf = encode(&client);
        assert!(TransportParameters::read(Side::Server, &mut &buf[..]).is_ok());

        buf = encode(&server_params());
        assert_eq!(
            TransportParameters::read(Side::Server, &mut &buf[..]),
            Err(Error::IllegalValue("server-only parameter sent by client"))
        );
    }

    #[test]
    fn omitted_params_take_absent_values() {
        let params = TransportParameters::read(Side::Client, &mut &[0u8; 0][..]).unwrap();
        assert_eq!(params, TransportParameters::absent());
        assert_eq!(params.idle_timeout(), None);
        assert_eq!(params.issue_cids_limit(), 2);
        assert!(encode(&params).is_empty());
    }

    #[test]
    fn stream_and_grease_params_skipped() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut buf = Vec::new();
        // initial_max_stream_data_bidi_local, twice
        for _ in 0..2 {
            buf.write_var(0x05);
            buf.write_var(4);
            buf.write(VarInt(1_000_000));
        }
        for _ in 0..4 {
            write_grease(&mut buf, &mut rng);
        }
        let own = RandomConnectionIdGenerator::new(8).generate_cid();
        TransportParameters::new(&TransportConfig::default(), VarInt(1200), own).write(&mut buf);

        let params = TransportParameters::read(Side::Server, &mut &buf[..]).unwrap();
        assert_eq!(params.initial_src_cid, Some(own));
    }

    #[test]
    fn repeated_param_rejected() {
        let mut buf = Vec::new();
        for _ in 0..2 {
            buf.write_var(id::INITIAL_SRC_CID);
            buf.write_var(1);
            buf.put_u8(7);
        }
        assert_eq!(
            TransportParameters::read(Side::Client, &mut &buf[..]),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn length_must_match_value() {
        // A one-byte varint declared as two bytes
        let mut buf = Vec::new();
        buf.write_var(id::INITIAL_MAX_DATA);
        buf.write_var(2);
        buf.write_var(7);
        buf.put_u8(0);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut &buf[..]),
            Err(Error::Malformed)
        );

        // A reset token cut short, then one running past the end of the buffer
        for declared in [8, 40] {
            let mut buf = Vec::new();
            buf.write_var(id::STATELESS_RESET_TOKEN);
            buf.write_var(declared);
            buf.put_slice(&[0; 8]);
            assert_eq!(
                TransportParameters::read(Side::Client, &mut &buf[..]),
                Err(Error::Malformed)
            );
        }
    }

    #[test]
    fn out_of_range_values_rejected() {
        let cases: [(fn(&mut TransportParameters), &str); 5] = [
            (|p| p.ack_delay_exponent = VarInt(21), "ack_delay_exponent"),
            (|p| p.max_ack_delay = VarInt(1 << 14), "max_ack_delay"),
            (|p| p.active_connection_id_limit = VarInt(1), "active_connection_id_limit"),
            (|p| p.max_udp_payload_size = VarInt(1199), "max_udp_payload_size"),
            (|p| p.initial_max_streams_uni = VarInt(MAX_STREAM_COUNT + 1), "initial_max_streams"),
        ];
        for (modify, name) in cases {
            let mut params = TransportParameters::absent();
            modify(&mut params);
            assert_eq!(
                TransportParameters::read(Side::Client, &mut &encode(&params)[..]),
                Err(Error::IllegalValue(name))
            );
        }
    }

    #[test]
    fn preferred_address_needs_an_address_and_id() {
        let mut params = server_params();
        let preferred = params.preferred_address.as_mut().unwrap();
        preferred.address_v4 = None;
        let buf = encode(&params);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut &buf[..]),
            Err(Error::IllegalValue("preferred_address without address"))
        );

        let mut params = server_params();
        params.preferred_address.as_mut().unwrap().connection_id = ConnectionId::new(&[]);
        let buf = encode(&params);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut &buf[..]),
            Err(Error::IllegalValue("preferred_address connection id"))
        );
    }

    #[test]
    fn absurd_idle_timeout_disables() {
        let params = TransportParameters {
            max_idle_timeout: VarInt(MAX_IDLE_MILLIS + 1),
            ..TransportParameters::absent()
        };
        assert_eq!(params.idle_timeout(), None);
    }
}
