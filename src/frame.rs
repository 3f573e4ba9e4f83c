use std::{fmt, ops::RangeInclusive};

use bytes::{Buf, BufMut, Bytes};

use crate::{
    cid::{ConnectionId, ResetToken},
    coding::{self, BufExt, BufMutExt, UnexpectedEnd},
    packet::SpaceId,
    range_set::RangeSet,
    TransportError, TransportErrorCode, VarInt, MAX_CID_SIZE, RESET_TOKEN_SIZE,
};

/// A QUIC frame type
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FrameType(u64);

impl FrameType {
    pub(crate) const PADDING: Self = Self(0x00);
    pub(crate) const PING: Self = Self(0x01);
    pub(crate) const ACK: Self = Self(0x02);
    pub(crate) const ACK_ECN: Self = Self(0x03);
    pub(crate) const CRYPTO: Self = Self(0x06);
    pub(crate) const NEW_TOKEN: Self = Self(0x07);
    pub(crate) const MAX_DATA: Self = Self(0x10);
    pub(crate) const MAX_STREAMS_BIDI: Self = Self(0x12);
    pub(crate) const MAX_STREAMS_UNI: Self = Self(0x13);
    pub(crate) const NEW_CONNECTION_ID: Self = Self(0x18);
    pub(crate) const RETIRE_CONNECTION_ID: Self = Self(0x19);
    pub(crate) const PATH_CHALLENGE: Self = Self(0x1a);
    pub(crate) const PATH_RESPONSE: Self = Self(0x1b);
    pub(crate) const CONNECTION_CLOSE: Self = Self(0x1c);
    pub(crate) const APPLICATION_CLOSE: Self = Self(0x1d);
    pub(crate) const HANDSHAKE_DONE: Self = Self(0x1e);

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0x00 => "PADDING",
            0x01 => "PING",
            0x02 => "ACK",
            0x03 => "ACK_ECN",
            0x04 => "RESET_STREAM",
            0x05 => "STOP_SENDING",
            0x06 => "CRYPTO",
            0x07 => "NEW_TOKEN",
            0x08..=0x0f => "STREAM",
            0x10 => "MAX_DATA",
            0x11 => "MAX_STREAM_DATA",
            0x12 => "MAX_STREAMS_BIDI",
            0x13 => "MAX_STREAMS_UNI",
            0x14 => "DATA_BLOCKED",
            0x15 => "STREAM_DATA_BLOCKED",
            0x16 => "STREAMS_BLOCKED_BIDI",
            0x17 => "STREAMS_BLOCKED_UNI",
            0x18 => "NEW_CONNECTION_ID",
            0x19 => "RETIRE_CONNECTION_ID",
            0x1a => "PATH_CHALLENGE",
            0x1b => "PATH_RESPONSE",
            0x1c => "CONNECTION_CLOSE",
            0x1d => "APPLICATION_CLOSE",
            0x1e => "HANDSHAKE_DONE",
            _ => return None,
        })
    }

    /// Variable-length integer fields that make up a frame this engine does not act on
    ///
    /// STREAM frames are handled separately since their layout depends on the type bits.
    fn ignored_fields(self) -> Option<usize> {
        match self.0 {
            0x04 => Some(3),
            0x05 | 0x11 | 0x15 => Some(2),
            0x14 | 0x16 | 0x17 => Some(1),
            _ => None,
        }
    }
}

impl fmt::Debug for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Type({:02x})", self.0),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "<unknown {:02x}>", self.0),
        }
    }
}

impl coding::Codec for FrameType {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

/// A decoded frame
///
/// Stream-family and stream flow-control frames are parsed for framing only and surface as
/// [`Frame::Ignored`].
#[derive(Debug)]
pub(crate) enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    Crypto(Crypto),
    NewToken(Bytes),
    MaxData(u64),
    MaxStreams { bidi: bool, count: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    Close(Close),
    HandshakeDone,
    Ignored(FrameType),
}

impl Frame {
    pub(crate) fn ty(&self) -> FrameType {
        match *self {
            Self::Padding => FrameType::PADDING,
            Self::Ping => FrameType::PING,
            Self::Ack(Ack { ecn: true, .. }) => FrameType::ACK_ECN,
            Self::Ack(_) => FrameType::ACK,
            Self::Crypto(_) => FrameType::CRYPTO,
            Self::NewToken(_) => FrameType::NEW_TOKEN,
            Self::MaxData(_) => FrameType::MAX_DATA,
            Self::MaxStreams { bidi: true, .. } => FrameType::MAX_STREAMS_BIDI,
            Self::MaxStreams { bidi: false, .. } => FrameType::MAX_STREAMS_UNI,
            Self::NewConnectionId(_) => FrameType::NEW_CONNECTION_ID,
            Self::RetireConnectionId { .. } => FrameType::RETIRE_CONNECTION_ID,
            Self::PathChallenge(_) => FrameType::PATH_CHALLENGE,
            Self::PathResponse(_) => FrameType::PATH_RESPONSE,
            Self::Close(Close::Connection(_)) => FrameType::CONNECTION_CLOSE,
            Self::Close(Close::Application(_)) => FrameType::APPLICATION_CLOSE,
            Self::HandshakeDone => FrameType::HANDSHAKE_DONE,
            Self::Ignored(ty) => ty,
        }
    }

    pub(crate) fn is_ack_eliciting(&self) -> bool {
        !matches!(*self, Self::Ack(_) | Self::Padding | Self::Close(_))
    }

    /// Whether RFC 9000 permits this frame in a packet of `space`
    ///
    /// Initial and Handshake packets carry only PADDING, PING, ACK, CRYPTO and transport-level
    /// CONNECTION_CLOSE.
    pub(crate) fn is_allowed_in(&self, space: SpaceId) -> bool {
        match space {
            SpaceId::Data => true,
            SpaceId::Initial | SpaceId::Handshake => matches!(
                *self,
                Self::Padding
                    | Self::Ping
                    | Self::Ack(_)
                    | Self::Crypto(_)
                    | Self::Close(Close::Connection(_))
            ),
        }
    }
}

/// Reason given for closing a connection, at either the transport or application layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Close {
    /// Transport-level close
    Connection(ConnectionClose),
    /// Application-level close
    Application(ApplicationClose),
}

impl Close {
    /// Write a close frame no longer than `max_len`, cutting the reason phrase to fit
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        match self {
            Self::Connection(x) => {
                let offending = x.frame_type.map_or(0, |ty| ty.0);
                let header = 1 + var_size(x.error_code.into_inner()) + var_size(offending);
                out.write(FrameType::CONNECTION_CLOSE);
                out.write(x.error_code);
                out.write_var(offending);
                write_reason(out, &x.reason, max_len.saturating_sub(header));
            }
            Self::Application(x) => {
                let header = 1 + x.error_code.size();
                out.write(FrameType::APPLICATION_CLOSE);
                out.write(x.error_code);
                write_reason(out, &x.reason, max_len.saturating_sub(header));
            }
        }
    }

    /// Application closes may only be sent in 1-RTT packets, so earlier spaces get a blank
    /// transport close with APPLICATION_ERROR instead (RFC 9000 §10.2.3)
    pub(crate) fn for_space(&self, space: SpaceId) -> Self {
        match (self, space) {
            (Self::Application(_), SpaceId::Initial | SpaceId::Handshake) => {
                Self::Connection(ConnectionClose {
                    error_code: TransportErrorCode::APPLICATION_ERROR,
                    frame_type: None,
                    reason: Bytes::new(),
                })
            }
            _ => self.clone(),
        }
    }
}

/// Length-prefixed reason phrase using at most `room` bytes including the prefix
fn write_reason<W: BufMut>(out: &mut W, reason: &[u8], room: usize) {
    let len = reason.len().min(room.saturating_sub(var_size(reason.len() as u64)));
    out.write_var(len as u64);
    out.put_slice(&reason[..len]);
}

fn var_size(x: u64) -> usize {
    VarInt::from_u64(x).map_or(VarInt::MAX_SIZE, VarInt::size)
}

impl From<TransportError> for Close {
    fn from(x: TransportError) -> Self {
        Self::Connection(x.into())
    }
}

impl From<ApplicationClose> for Close {
    fn from(x: ApplicationClose) -> Self {
        Self::Application(x)
    }
}

/// Reason given by the transport for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    /// Class of error as encoded in the specification
    pub error_code: TransportErrorCode,
    /// Type of frame that caused the close
    pub frame_type: Option<FrameType>,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        Self {
            error_code: x.code,
            frame_type: x.frame,
            reason: x.reason.into(),
        }
    }
}

/// Reason given by an application for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationClose {
    /// Application-specific reason code
    pub error_code: VarInt,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason.is_empty() {
            true => self.error_code.fmt(f),
            false => write!(
                f,
                "{} (code {})",
                String::from_utf8_lossy(&self.reason),
                self.error_code
            ),
        }
    }
}

/// A decoded ACK frame
///
/// Ranges are kept in the order they appear on the wire, highest first. Their number is bounded
/// by the size of the packet that carried them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Ack {
    pub(crate) largest: u64,
    pub(crate) delay: u64,
    ranges: Vec<RangeInclusive<u64>>,
    /// Whether the frame carried ECN counts; the counts themselves are not used
    ecn: bool,
}

impl Ack {
    /// Encode an ACK frame covering `ranges`, which must not be empty
    pub(crate) fn encode<W: BufMut>(delay: u64, ranges: &RangeSet, buf: &mut W) {
        let mut descending = ranges.iter().rev();
        let Some(top) = descending.next() else {
            debug_assert!(false, "encoding an empty ACK");
            return;
        };
        buf.write(FrameType::ACK);
        buf.write_var(top.end - 1);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(top.end - 1 - top.start);
        let mut low = top.start;
        for range in descending {
            // Gaps and lengths are both encoded as one less than their true size
            buf.write_var(low - range.end - 1);
            buf.write_var(range.end - 1 - range.start);
            low = range.start;
        }
    }

    fn decode(buf: &mut Bytes, ecn: bool) -> Result<Self, DecodeError> {
        let largest = buf.get_var()?;
        let delay = buf.get_var()?;
        let extra = buf.get_var()?;
        let first = buf.get_var()?;
        let mut low = largest.checked_sub(first).ok_or(DecodeError::Malformed)?;
        let mut ranges = vec![low..=largest];
        for _ in 0..extra {
            let gap = buf.get_var()?;
            let len = buf.get_var()?;
            let high = low.checked_sub(gap + 2).ok_or(DecodeError::Malformed)?;
            low = high.checked_sub(len).ok_or(DecodeError::Malformed)?;
            ranges.push(low..=high);
        }
        if ecn {
            // ECT(0), ECT(1) and CE counts
            for _ in 0..3 {
                buf.get_var()?;
            }
        }
        Ok(Self {
            largest,
            delay,
            ranges,
            ecn,
        })
    }

    /// Acknowledged packet numbers, highest range first
    pub(crate) fn iter(&self) -> impl Iterator<Item = RangeInclusive<u64>> + '_ {
        self.ranges.iter().cloned()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Crypto {
    pub(crate) offset: u64,
    pub(crate) data: Bytes,
}

impl Crypto {
    /// Type, offset and length fields at their largest
    pub(crate) const SIZE_BOUND: usize = 1 + 8 + 8;

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::CRYPTO);
        out.write_var(self.offset);
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct NewConnectionId {
    pub(crate) sequence: u64,
    pub(crate) retire_prior_to: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: ResetToken,
}

impl NewConnectionId {
    pub(crate) const SIZE_BOUND: usize = 1 + 8 + 8 + 1 + MAX_CID_SIZE + RESET_TOKEN_SIZE;

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::NEW_CONNECTION_ID);
        out.write_var(self.sequence);
        out.write_var(self.retire_prior_to);
        out.write(self.id.len() as u8);
        out.put_slice(&self.id);
        out.put_slice(&self.reset_token);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let sequence = buf.get_var()?;
        let retire_prior_to = buf.get_var()?;
        let len = usize::from(buf.get::<u8>()?);
        if retire_prior_to > sequence || len == 0 || len > MAX_CID_SIZE {
            return Err(DecodeError::Malformed);
        }
        let id = ConnectionId::new(&buf.take_exact(len)?);
        let token = buf.take_exact(RESET_TOKEN_SIZE)?;
        let mut reset_token = [0; RESET_TOKEN_SIZE];
        reset_token.copy_from_slice(&token);
        Ok(Self {
            sequence,
            retire_prior_to,
            id,
            reset_token: reset_token.into(),
        })
    }
}

pub(crate) fn encode_retire_connection_id<W: BufMut>(sequence: u64, out: &mut W) {
    out.write(FrameType::RETIRE_CONNECTION_ID);
    out.write_var(sequence);
}

pub(crate) fn encode_path_response<W: BufMut>(payload: u64, out: &mut W) {
    out.write(FrameType::PATH_RESPONSE);
    out.write(payload);
}

/// Decodes the frames of a packet payload in order
///
/// The first undecodable frame yields an error and ends iteration.
pub(crate) struct Iter {
    bytes: Bytes,
    last_ty: Option<FrameType>,
}

impl Iter {
    pub(crate) fn new(payload: Bytes) -> Result<Self, TransportError> {
        if payload.is_empty() {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "packet payload is empty",
            ));
        }
        Ok(Self {
            bytes: payload,
            last_ty: None,
        })
    }

    fn decode(&mut self) -> Result<Frame, DecodeError> {
        let ty = self.bytes.get::<FrameType>()?;
        self.last_ty = Some(ty);
        let buf = &mut self.bytes;
        Ok(match ty {
            FrameType::PADDING => Frame::Padding,
            FrameType::PING => Frame::Ping,
            FrameType::ACK => Frame::Ack(Ack::decode(buf, false)?),
            FrameType::ACK_ECN => Frame::Ack(Ack::decode(buf, true)?),
            FrameType::CRYPTO => Frame::Crypto(Crypto {
                offset: buf.get_var()?,
                data: take_prefixed(buf)?,
            }),
            FrameType::NEW_TOKEN => Frame::NewToken(take_prefixed(buf)?),
            FrameType::MAX_DATA => Frame::MaxData(buf.get_var()?),
            FrameType::MAX_STREAMS_BIDI | FrameType::MAX_STREAMS_UNI => Frame::MaxStreams {
                bidi: ty == FrameType::MAX_STREAMS_BIDI,
                count: buf.get_var()?,
            },
            FrameType::NEW_CONNECTION_ID => Frame::NewConnectionId(NewConnectionId::decode(buf)?),
            FrameType::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: buf.get_var()?,
            },
            FrameType::PATH_CHALLENGE => Frame::PathChallenge(buf.get()?),
            FrameType::PATH_RESPONSE => Frame::PathResponse(buf.get()?),
            FrameType::CONNECTION_CLOSE => {
                let error_code = buf.get()?;
                let offending = buf.get_var()?;
                Frame::Close(Close::Connection(ConnectionClose {
                    error_code,
                    frame_type: (offending != 0).then_some(FrameType(offending)),
                    reason: take_prefixed(buf)?,
                }))
            }
            FrameType::APPLICATION_CLOSE => Frame::Close(Close::Application(ApplicationClose {
                error_code: buf.get()?,
                reason: take_prefixed(buf)?,
            })),
            FrameType::HANDSHAKE_DONE => Frame::HandshakeDone,
            FrameType(0x08..=0x0f) => {
                skip_stream(buf, ty.0)?;
                Frame::Ignored(ty)
            }
            _ => {
                let fields = ty.ignored_fields().ok_or(DecodeError::UnknownType)?;
                for _ in 0..fields {
                    buf.get_var()?;
                }
                Frame::Ignored(ty)
            }
        })
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, InvalidFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }
        Some(self.decode().map_err(|e| {
            self.bytes.clear();
            InvalidFrame {
                ty: self.last_ty,
                reason: e.reason(),
            }
        }))
    }
}

fn take_prefixed(buf: &mut Bytes) -> Result<Bytes, UnexpectedEnd> {
    let len = buf.get_var()?;
    buf.take_exact(usize::try_from(len).map_err(|_| UnexpectedEnd)?)
}

/// Skip a STREAM frame: id, then offset and length if the type bits say they are present
fn skip_stream(buf: &mut Bytes, ty: u64) -> Result<(), UnexpectedEnd> {
    const OFF: u64 = 0x04;
    const LEN: u64 = 0x02;
    buf.get_var()?;
    if ty & OFF != 0 {
        buf.get_var()?;
    }
    if ty & LEN != 0 {
        take_prefixed(buf)?;
    } else {
        buf.clear();
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct InvalidFrame {
    pub(crate) ty: Option<FrameType>,
    pub(crate) reason: &'static str,
}

impl From<InvalidFrame> for TransportError {
    fn from(err: InvalidFrame) -> Self {
        let mut te = Self::FRAME_ENCODING_ERROR(err.reason);
        te.frame = err.ty;
        te
    }
}

#[derive(Debug)]
enum DecodeError {
    Truncated,
    UnknownType,
    Malformed,
}

impl DecodeError {
    fn reason(&self) -> &'static str {
        match self {
            Self::Truncated => "unexpected end",
            Self::UnknownType => "invalid frame ID",
            Self::Malformed => "malformed",
        }
    }
}

impl From<UnexpectedEnd> for DecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::Truncated
    }
}
