use std::{fmt, io, ops::Range};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    cid::ConnectionId,
    coding::{self, BufExt, BufMutExt},
    crypto::{CryptoError, HeaderKey, PacketKey},
    VERSION,
};

// Due to packet number protection, it is impossible to fully decode a header (which includes a
// variable-length packet number) without crypto context. The endpoint routes on the plain part
// of the header, which carries the destination connection id, version and packet type; the
// owning connection then removes header protection with the keys of the right space.
pub(crate) struct PartialDecode {
    plain_header: PlainHeader,
    buf: BytesMut,
}

impl PartialDecode {
    /// Decode the unprotected part of the first packet in `bytes`
    ///
    /// Returns the remainder of the datagram when further packets are coalesced after this one.
    pub(crate) fn new(
        bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = io::Cursor::new(bytes);
        let plain_header = PlainHeader::decode(&mut buf, local_cid_len)?;
        let dgram_len = buf.get_ref().len();
        let packet_len = plain_header
            .payload_len()
            .map(|len| (buf.position() + len) as usize)
            .unwrap_or(dgram_len);
        if packet_len > dgram_len {
            return Err(PacketDecodeError::InvalidHeader("packet too short"));
        }

        let mut bytes = buf.into_inner();
        let rest = if packet_len != dgram_len {
            Some(bytes.split_off(packet_len))
        } else {
            None
        };
        Ok((
            Self {
                plain_header,
                buf: bytes,
            },
            rest,
        ))
    }

    /// The number space this packet belongs to, if it carries protected frames
    pub(crate) fn space(&self) -> Option<SpaceId> {
        use PlainHeader::*;
        match self.plain_header {
            Initial { .. } => Some(SpaceId::Initial),
            Long {
                ty: LongType::Handshake,
                ..
            } => Some(SpaceId::Handshake),
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => Some(SpaceId::Data),
            Short { .. } => Some(SpaceId::Data),
            _ => None,
        }
    }

    pub(crate) fn is_initial(&self) -> bool {
        self.space() == Some(SpaceId::Initial)
    }

    pub(crate) fn is_0rtt(&self) -> bool {
        matches!(
            self.plain_header,
            PlainHeader::Long {
                ty: LongType::ZeroRtt,
                ..
            }
        )
    }

    pub(crate) fn dst_cid(&self) -> ConnectionId {
        self.plain_header.dst_cid()
    }

    pub(crate) fn src_cid(&self) -> Option<ConnectionId> {
        use PlainHeader::*;
        match self.plain_header {
            Initial { src_cid, .. }
            | Long { src_cid, .. }
            | Retry { src_cid, .. }
            | VersionNegotiate { src_cid, .. } => Some(src_cid),
            Short { .. } => None,
        }
    }

    /// The address validation token carried by an Initial packet
    pub(crate) fn token(&self) -> Option<&[u8]> {
        match self.plain_header {
            PlainHeader::Initial { ref token_pos, .. } => Some(&self.buf[token_pos.clone()]),
            _ => None,
        }
    }

    /// Length of the packet being decoded
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Remove header protection, yielding the full header and the still-encrypted payload
    pub(crate) fn finish(
        self,
        header_key: Option<&dyn HeaderKey>,
    ) -> Result<Packet, PacketDecodeError> {
        use PlainHeader::*;
        let Self {
            plain_header,
            mut buf,
        } = self;

        match plain_header {
            VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            } => {
                let header_len = 7 + dst_cid.len() + src_cid.len();
                let header_data = buf.split_to(header_len).freeze();
                Ok(Packet {
                    header: Header::VersionNegotiate {
                        random,
                        dst_cid,
                        src_cid,
                    },
                    header_data,
                    payload: buf,
                })
            }
            Retry { dst_cid, src_cid } => {
                let header_len = 7 + dst_cid.len() + src_cid.len();
                let header_data = buf.split_to(header_len).freeze();
                Ok(Packet {
                    header: Header::Retry { dst_cid, src_cid },
                    header_data,
                    payload: buf,
                })
            }
            Initial {
                dst_cid,
                src_cid,
                token_pos,
                pn_offset,
                ..
            } => {
                let key = header_key.ok_or(PacketDecodeError::InvalidHeader("no header key"))?;
                let number = decrypt_header(&mut buf, pn_offset, key)?;
                let header_len = pn_offset + number.len();
                let header_data = buf.split_to(header_len).freeze();
                let token = header_data.slice(token_pos);
                Ok(Packet {
                    header: Header::Initial(InitialHeader {
                        dst_cid,
                        src_cid,
                        token,
                        number,
                    }),
                    header_data,
                    payload: buf,
                })
            }
            Long {
                ty,
                dst_cid,
                src_cid,
                pn_offset,
                ..
            } => {
                let key = header_key.ok_or(PacketDecodeError::InvalidHeader("no header key"))?;
                let number = decrypt_header(&mut buf, pn_offset, key)?;
                let header_len = pn_offset + number.len();
                Ok(Packet {
                    header: Header::Long {
                        ty,
                        dst_cid,
                        src_cid,
                        number,
                    },
                    header_data: buf.split_to(header_len).freeze(),
                    payload: buf,
                })
            }
            Short { dst_cid, .. } => {
                let key = header_key.ok_or(PacketDecodeError::InvalidHeader("no header key"))?;
                let pn_offset = 1 + dst_cid.len();
                let number = decrypt_header(&mut buf, pn_offset, key)?;
                let first = buf[0];
                let header_len = pn_offset + number.len();
                Ok(Packet {
                    header: Header::Short {
                        spin: first & SPIN_BIT != 0,
                        key_phase: first & KEY_PHASE_BIT != 0,
                        dst_cid,
                        number,
                    },
                    header_data: buf.split_to(header_len).freeze(),
                    payload: buf,
                })
            }
        }
    }
}

fn decrypt_header(
    buf: &mut BytesMut,
    pn_offset: usize,
    header_key: &dyn HeaderKey,
) -> Result<PacketNumber, PacketDecodeError> {
    if buf.len() < pn_offset + 4 + header_key.sample_size() {
        return Err(PacketDecodeError::InvalidHeader(
            "packet too short to extract header protection sample",
        ));
    }
    header_key.decrypt(pn_offset, buf)?;
    let len = PacketNumber::decode_len(buf[0]);
    PacketNumber::decode(len, &mut io::Cursor::new(&buf[pn_offset..]))
}

/// A packet whose header protection has been removed
pub(crate) struct Packet {
    pub(crate) header: Header,
    pub(crate) header_data: Bytes,
    pub(crate) payload: BytesMut,
}

impl Packet {
    /// Whether reserved header bits are set, which is only an error in an authenticated packet
    pub(crate) fn reserved_bits_set(&self) -> bool {
        let first = self.header_data[0];
        match self.header {
            Header::Short { .. } => first & SHORT_RESERVED_BITS != 0,
            Header::Initial(_) | Header::Long { .. } => first & LONG_RESERVED_BITS != 0,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial(InitialHeader),
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
    Short {
        spin: bool,
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    VersionNegotiate {
        random: u8,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
}

impl Header {
    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use Header::*;
        let start = w.len();
        match *self {
            Initial(InitialHeader {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            }) => {
                w.write(
                    LONG_HEADER_FORM
                        | FIXED_BIT
                        | (u8::from(LongHeaderType::Initial) << 4)
                        | number.tag(),
                );
                w.write(VERSION);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                w.write::<u16>(0); // Placeholder for payload length; see `set_payload_length`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                w.write(
                    LONG_HEADER_FORM
                        | FIXED_BIT
                        | (u8::from(LongHeaderType::Standard(ty)) << 4)
                        | number.tag(),
                );
                w.write(VERSION);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write::<u16>(0); // Placeholder for payload length; see `set_payload_length`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Retry {
                ref dst_cid,
                ref src_cid,
            } => {
                w.write(LONG_HEADER_FORM | FIXED_BIT | (u8::from(LongHeaderType::Retry) << 4));
                w.write(VERSION);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: None,
                }
            }
            Short {
                spin,
                key_phase,
                ref dst_cid,
                number,
            } => {
                w.write(
                    FIXED_BIT
                        | if key_phase { KEY_PHASE_BIT } else { 0 }
                        | if spin { SPIN_BIT } else { 0 }
                        | number.tag(),
                );
                w.put_slice(dst_cid);
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), false)),
                }
            }
            VersionNegotiate {
                random,
                ref src_cid,
                ref dst_cid,
            } => {
                w.write(LONG_HEADER_FORM | random);
                w.write::<u32>(0);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: None,
                }
            }
        }
    }

    pub(crate) fn number(&self) -> Option<PacketNumber> {
        use Header::*;
        Some(match *self {
            Initial(InitialHeader { number, .. }) => number,
            Long { number, .. } => number,
            Short { number, .. } => number,
            _ => return None,
        })
    }

    pub(crate) fn space(&self) -> SpaceId {
        use Header::*;
        match *self {
            Short { .. } => SpaceId::Data,
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => SpaceId::Data,
            Long {
                ty: LongType::Handshake,
                ..
            } => SpaceId::Handshake,
            _ => SpaceId::Initial,
        }
    }

    pub(crate) fn key_phase(&self) -> bool {
        match *self {
            Header::Short { key_phase, .. } => key_phase,
            _ => false,
        }
    }

    pub(crate) fn is_0rtt(&self) -> bool {
        matches!(
            *self,
            Header::Long {
                ty: LongType::ZeroRtt,
                ..
            }
        )
    }

    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        use Header::*;
        match *self {
            Initial(InitialHeader { ref dst_cid, .. }) => dst_cid,
            Long { ref dst_cid, .. } => dst_cid,
            Retry { ref dst_cid, .. } => dst_cid,
            Short { ref dst_cid, .. } => dst_cid,
            VersionNegotiate { ref dst_cid, .. } => dst_cid,
        }
    }

    pub(crate) fn src_cid(&self) -> Option<&ConnectionId> {
        use Header::*;
        match *self {
            Initial(InitialHeader { ref src_cid, .. }) => Some(src_cid),
            Long { ref src_cid, .. } => Some(src_cid),
            Retry { ref src_cid, .. } => Some(src_cid),
            VersionNegotiate { ref src_cid, .. } => Some(src_cid),
            Short { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct InitialHeader {
    pub(crate) dst_cid: ConnectionId,
    pub(crate) src_cid: ConnectionId,
    pub(crate) token: Bytes,
    pub(crate) number: PacketNumber,
}

/// A header written into a buffer, awaiting its payload before protection is applied
pub(crate) struct PartialEncode {
    pub(crate) start: usize,
    pub(crate) header_len: usize,
    // Packet number length, whether the length field needs to be filled in
    pn: Option<(usize, bool)>,
}

impl PartialEncode {
    /// Fill in the length field, encrypt the payload and protect the header
    ///
    /// `buf[self.start..]` must hold the header, the plaintext payload and room for the AEAD tag.
    pub(crate) fn finish(
        self,
        buf: &mut [u8],
        header_key: &dyn HeaderKey,
        crypto: Option<(u64, &dyn PacketKey)>,
    ) -> Result<(), CryptoError> {
        let Self {
            start,
            header_len,
            pn,
        } = self;
        let (pn_len, write_len) = match pn {
            Some((pn_len, write_len)) => (pn_len, write_len),
            None => return Ok(()),
        };

        let packet = &mut buf[start..];
        let pn_pos = header_len - pn_len;
        if write_len {
            let len = packet.len() - header_len + pn_len;
            debug_assert!(len < 2usize.pow(14)); // Fits in reserved space
            let mut slice = &mut packet[pn_pos - 2..pn_pos];
            slice.put_u16(len as u16 | 0b01 << 14);
        }

        if let Some((number, crypto)) = crypto {
            crypto.encrypt(number, packet, header_len)?;
        }

        debug_assert!(
            pn_pos + 4 + header_key.sample_size() <= packet.len(),
            "packet must be padded to at least {} bytes for header protection sampling",
            pn_pos + 4 + header_key.sample_size()
        );
        header_key.encrypt(pn_pos, packet)
    }
}

/// The unprotected fields of a header, decodable without keys
#[derive(Debug)]
enum PlainHeader {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_pos: Range<usize>,
        len: u64,
        pn_offset: usize,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
        pn_offset: usize,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
    Short {
        dst_cid: ConnectionId,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl PlainHeader {
    fn dst_cid(&self) -> ConnectionId {
        use PlainHeader::*;
        match self {
            Initial { dst_cid, .. } => *dst_cid,
            Long { dst_cid, .. } => *dst_cid,
            Retry { dst_cid, .. } => *dst_cid,
            Short { dst_cid } => *dst_cid,
            VersionNegotiate { dst_cid, .. } => *dst_cid,
        }
    }

    fn payload_len(&self) -> Option<u64> {
        use PlainHeader::*;
        match self {
            Initial { len, .. } | Long { len, .. } => Some(*len),
            _ => None,
        }
    }

    fn decode(
        buf: &mut io::Cursor<BytesMut>,
        local_cid_len: usize,
    ) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            if first & FIXED_BIT == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }
            if buf.remaining() < local_cid_len {
                return Err(PacketDecodeError::InvalidHeader("cid out of bounds"));
            }
            let mut cid = [0; crate::MAX_CID_SIZE];
            buf.copy_to_slice(&mut cid[..local_cid_len]);
            return Ok(Self::Short {
                dst_cid: ConnectionId::new(&cid[..local_cid_len]),
            });
        }

        let version = buf.get::<u32>()?;
        let dst_cid = ConnectionId::decode_long(buf)
            .ok_or(PacketDecodeError::InvalidHeader("malformed cid"))?;
        let src_cid = ConnectionId::decode_long(buf)
            .ok_or(PacketDecodeError::InvalidHeader("malformed cid"))?;

        if version == 0 {
            let random = first & !LONG_HEADER_FORM;
            return Ok(Self::VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            });
        }
        if version != VERSION {
            return Err(PacketDecodeError::UnsupportedVersion {
                src_cid,
                dst_cid,
                version,
            });
        }

        match LongHeaderType::from_byte(first)? {
            LongHeaderType::Initial => {
                let token_len = buf.get_var()? as usize;
                let token_start = buf.position() as usize;
                if token_len > buf.remaining() {
                    return Err(PacketDecodeError::InvalidHeader("token out of bounds"));
                }
                buf.advance(token_len);
                let len = buf.get_var()?;
                Ok(Self::Initial {
                    dst_cid,
                    src_cid,
                    token_pos: token_start..token_start + token_len,
                    len,
                    pn_offset: buf.position() as usize,
                })
            }
            LongHeaderType::Retry => Ok(Self::Retry { dst_cid, src_cid }),
            LongHeaderType::Standard(ty) => Ok(Self::Long {
                ty,
                dst_cid,
                src_cid,
                len: buf.get_var()?,
                pn_offset: buf.position() as usize,
            }),
        }
    }
}

/// Write a Version Negotiation packet answering a packet with the given connection ids
pub(crate) fn version_negotiation(
    random: u8,
    peer_dst_cid: &ConnectionId,
    peer_src_cid: &ConnectionId,
    peer_version: u32,
    buf: &mut Vec<u8>,
) {
    Header::VersionNegotiate {
        random: random | FIXED_BIT,
        src_cid: *peer_dst_cid,
        dst_cid: *peer_src_cid,
    }
    .encode(buf);
    // Grease with a reserved version
    if peer_version != 0x0a1a_2a3a {
        buf.write::<u32>(0x0a1a_2a3a);
    } else {
        buf.write::<u32>(0x0a1a_2a4a);
    }
    buf.write(VERSION);
}

/// Supported versions listed in a Version Negotiation payload
pub(crate) fn supported_versions(
    mut payload: &[u8],
) -> Result<Vec<u32>, coding::UnexpectedEnd> {
    let mut versions = Vec::with_capacity(payload.len() / 4);
    while payload.has_remaining() {
        versions.push(BufExt::get::<u32>(&mut payload)?);
    }
    Ok(versions)
}

// An encoded packet number
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    /// Encode `n` so the peer can recover it knowing `largest_acked`
    pub(crate) fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            Self::U8(n as u8)
        } else if range < 1 << 16 {
            Self::U16(n as u16)
        } else if range < 1 << 24 {
            Self::U24(n as u32)
        } else {
            Self::U32(n as u32)
        }
    }

    pub(crate) fn len(self) -> usize {
        use PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        use PacketNumber::*;
        if r.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader("packet number out of bounds"));
        }
        let pn = match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            3 => U24(r.get_uint(3) as u32),
            4 => U32(r.get()?),
            _ => return Err(PacketDecodeError::InvalidHeader("invalid packet number length")),
        };
        Ok(pn)
    }

    pub(crate) fn decode_len(tag: u8) -> usize {
        1 + (tag & 0x03) as usize
    }

    fn tag(self) -> u8 {
        use PacketNumber::*;
        match self {
            U8(_) => 0b00,
            U16(_) => 0b01,
            U24(_) => 0b10,
            U32(_) => 0b11,
        }
    }

    /// Recover the full packet number, given the next one expected in this space
    pub(crate) fn expand(self, expected: u64) -> u64 {
        // From Appendix A
        use PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than expected - hwin and less than or equal
        // to expected + hwin
        //
        // This means we can't just strip the trailing bits from expected and add the truncated
        // because that might yield a value outside the window.
        //
        // The following code calculates a candidate value and makes sure it's within the packet
        // number window.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).is_some_and(|x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate > win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Long packet type including non-uniform cases
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongHeaderType {
    Initial,
    Retry,
    Standard(LongType),
}

impl LongHeaderType {
    fn from_byte(b: u8) -> Result<Self, PacketDecodeError> {
        use {LongHeaderType::*, LongType::*};
        if b & FIXED_BIT == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }
        debug_assert!(b & LONG_HEADER_FORM != 0, "not a long packet");
        Ok(match (b & 0x30) >> 4 {
            0x0 => Initial,
            0x1 => Standard(ZeroRtt),
            0x2 => Standard(Handshake),
            _ => Retry,
        })
    }
}

impl From<LongHeaderType> for u8 {
    fn from(ty: LongHeaderType) -> Self {
        use {LongHeaderType::*, LongType::*};
        match ty {
            Initial => 0x0,
            Standard(ZeroRtt) => 0x1,
            Standard(Handshake) => 0x2,
            Retry => 0x3,
        }
    }
}

/// Long packet types with uniform header structure
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongType {
    Handshake,
    ZeroRtt,
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub(crate) enum PacketDecodeError {
    #[error("unsupported version {version:x}")]
    UnsupportedVersion {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        version: u32,
    },
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::InvalidHeader("unexpected end of packet")
    }
}

impl From<CryptoError> for PacketDecodeError {
    fn from(_: CryptoError) -> Self {
        Self::InvalidHeader("header protection failed")
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
pub(crate) const SPIN_BIT: u8 = 0x20;
const SHORT_RESERVED_BITS: u8 = 0x18;
const LONG_RESERVED_BITS: u8 = 0x0c;
const KEY_PHASE_BIT: u8 = 0x04;

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    /// Packets protected by the handshake traffic secrets
    Handshake = 1,
    /// Application data space, used for 0-RTT and post-handshake/1-RTT packets
    Data = 2,
}

impl SpaceId {
    pub(crate) const VALUES: [Self; 3] = [Self::Initial, Self::Handshake, Self::Data];

    pub(crate) fn iter() -> impl Iterator<Item = Self> {
        Self::VALUES.iter().copied()
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initial => "initial",
            Self::Handshake => "handshake",
            Self::Data => "data",
        })
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::{crypto::rustls, Side};

    fn check_pn(typed: PacketNumber, encoded: &[u8]) {
        let mut buf = Vec::new();
        typed.encode(&mut buf);
        assert_eq!(&buf[..], encoded);
        let decoded = PacketNumber::decode(typed.len(), &mut io::Cursor::new(&buf)).unwrap();
        assert_eq!(typed, decoded);
    }

    #[test]
    fn roundtrip_packet_numbers() {
        check_pn(PacketNumber::U8(0x7f), &[0x7f]);
        check_pn(PacketNumber::U16(0x80), &[0x00, 0x80]);
        check_pn(PacketNumber::U16(0x3fff), &[0x3f, 0xff]);
        check_pn(PacketNumber::U32(0x0000_4000), &[0x00, 0x00, 0x40, 0x00]);
        check_pn(PacketNumber::U32(0xffff_ffff), &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn pn_encode() {
        check_pn(PacketNumber::new(0x10, 0), &[0x10]);
        check_pn(PacketNumber::new(0x100, 0), &[0x01, 0x00]);
        check_pn(PacketNumber::new(0x10000, 0), &[0x01, 0x00, 0x00]);
    }

    #[test]
    fn pn_expand_roundtrip() {
        for expected in 0..1024 {
            for actual in expected..1024 {
                assert_eq!(actual, PacketNumber::new(actual, expected).expand(expected));
            }
        }
    }

    #[test]
    fn pn_expand_rfc_example() {
        // RFC 9000 Appendix A.3
        assert_eq!(PacketNumber::U16(0x9b32).expand(0xa82f_30eb), 0xa82f_9b32);
    }

    #[test]
    fn initial_round_trip() {
        let dcid = ConnectionId::new(&hex!("06b858ec6f80452b"));
        let suite = rustls::initial_suite_from_provider(&rustls::configured_provider()).unwrap();
        let client = rustls::initial_keys(&dcid, Side::Client, &suite);
        let server = rustls::initial_keys(&dcid, Side::Server, &suite);

        let mut buf = Vec::new();
        let header = Header::Initial(InitialHeader {
            number: PacketNumber::U8(0),
            src_cid: ConnectionId::new(&[]),
            dst_cid: dcid,
            token: Bytes::from_static(b"tok"),
        });
        let encode = header.encode(&mut buf);
        let header_len = buf.len();
        assert_eq!(
            buf[..],
            hex!("c0 00000001 08 06b858ec6f80452b 00 03 746f6b 0000 00")[..]
        );
        buf.resize(header_len + 16 + client.local.packet.tag_len(), 0);
        encode
            .finish(
                &mut buf,
                &*client.local.header,
                Some((0, &*client.local.packet)),
            )
            .unwrap();

        let (decode, rest) = PartialDecode::new(BytesMut::from(&buf[..]), 0).unwrap();
        assert!(rest.is_none());
        assert!(decode.is_initial());
        assert_eq!(decode.dst_cid(), dcid);
        assert_eq!(decode.token(), Some(&b"tok"[..]));
        let mut packet = decode.finish(Some(&*server.remote.header)).unwrap();
        assert_eq!(
            packet.header_data[..],
            hex!("c0 00000001 08 06b858ec6f80452b 00 03 746f6b 4021 00")[..]
        );
        server
            .remote
            .packet
            .decrypt(0, &packet.header_data, &mut packet.payload)
            .unwrap();
        assert_eq!(packet.payload[..], [0; 16]);
        match packet.header {
            Header::Initial(InitialHeader {
                number: PacketNumber::U8(0),
                ref token,
                ..
            }) => assert_eq!(&token[..], b"tok"),
            _ => panic!("unexpected header {:?}", packet.header),
        }
    }

    #[test]
    fn coalesced_packets_split() {
        let mut buf = Vec::new();
        Header::Long {
            ty: LongType::Handshake,
            dst_cid: ConnectionId::new(&[1; 4]),
            src_cid: ConnectionId::new(&[2; 4]),
            number: PacketNumber::U8(1),
        }
        .encode(&mut buf);
        // length field: pn + 20 bytes
        let len_pos = buf.len() - 3;
        buf[len_pos..len_pos + 2].copy_from_slice(&(21u16 | 0x4000).to_be_bytes());
        buf.extend_from_slice(&[0; 20]);
        let first_len = buf.len();
        buf.extend_from_slice(&[0x40, 1, 2, 3, 4, 5]);

        let (decode, rest) = PartialDecode::new(BytesMut::from(&buf[..]), 4).unwrap();
        assert_eq!(decode.len(), first_len);
        assert_eq!(decode.space(), Some(SpaceId::Handshake));
        assert_eq!(&rest.unwrap()[..], &[0x40, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn unsupported_version_reported() {
        let mut buf = vec![0xc0, 0xaa, 0xbb, 0xcc, 0xdd, 2, 1, 2, 3, 9, 8, 7];
        buf.resize(1200, 0);
        match PartialDecode::new(BytesMut::from(&buf[..]), 8) {
            Err(PacketDecodeError::UnsupportedVersion {
                src_cid,
                dst_cid,
                version,
            }) => {
                assert_eq!(&dst_cid[..], &[1, 2]);
                assert_eq!(&src_cid[..], &[9, 8, 7]);
                assert_eq!(version, 0xaabb_ccdd);
            }
            _ => panic!("expected unsupported version"),
        }
    }

    #[test]
    fn version_negotiation_layout() {
        let mut buf = Vec::new();
        let dcid = ConnectionId::new(&[1, 2, 3, 4]);
        let scid = ConnectionId::new(&[5, 6]);
        version_negotiation(0x0a, &dcid, &scid, 0xaabb_ccdd, &mut buf);
        assert_eq!(buf[0] & LONG_HEADER_FORM, LONG_HEADER_FORM);
        assert_eq!(&buf[1..5], &[0, 0, 0, 0]);
        // The reply swaps the connection ids
        assert_eq!(&buf[5..8], &[2, 5, 6]);
        assert_eq!(&buf[8..13], &[4, 1, 2, 3, 4]);
        assert_eq!(
            supported_versions(&buf[13..]).unwrap(),
            vec![0x0a1a_2a3a, VERSION]
        );
    }
}
