//! Traits and implementations for the QUIC cryptography protocol
//!
//! The protocol logic in this crate is independent of the TLS implementation. A connection drives
//! a [`Session`], feeding it the handshake bytes carried in CRYPTO frames and draining the
//! [`TlsEvent`]s it produces: new packet protection keys per number space, outgoing handshake
//! bytes, the peer's transport parameters and handshake completion.
//!
//! [`rustls`] provides the production session. The *ring* glue supplies the keyed primitives used
//! for stateless reset tokens, retry tokens and Retry packet integrity.

use std::{any::Any, sync::Arc};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::{
    cid::ConnectionId, packet::SpaceId, transport_parameters::TransportParameters, ConnectError,
    Side, TransportError,
};

pub(crate) mod ring;
pub mod rustls;

/// A cryptographic session, commonly a TLS 1.3 session in QUIC mode
pub trait Session: Send + 'static {
    /// Create the Initial keys for the connection whose client picked `dst_cid`
    fn initial_keys(&self, dst_cid: &ConnectionId, side: Side) -> Keys;

    /// Supply handshake bytes received in CRYPTO frames of `space`
    ///
    /// Any events produced as a consequence are queued for [`next_event`](Self::next_event).
    fn read_handshake(&mut self, space: SpaceId, buf: &[u8]) -> Result<(), TransportError>;

    /// Take the next queued event, if any
    fn next_event(&mut self) -> Option<TlsEvent>;

    /// Derive the next generation of 1-RTT packet keys
    fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn PacketKey>>>;

    /// Whether the handshake is still in progress
    fn is_handshaking(&self) -> bool;

    /// The negotiated application protocol, once known
    fn alpn_protocol(&self) -> Option<Vec<u8>>;

    /// The certificate chain presented by the peer, as an opaque value
    ///
    /// For [`rustls::TlsSession`] the value is a `Vec<rustls::pki_types::CertificateDer>`.
    fn peer_identity(&self) -> Option<Box<dyn Any>>;

    /// Check the integrity tag of a Retry packet sent in response to `orig_dst_cid`
    fn is_valid_retry(&self, orig_dst_cid: &ConnectionId, header: &[u8], payload: &[u8]) -> bool;

    /// Release all key material and pending events
    fn close(&mut self);
}

/// Something the TLS engine wants the connection to act on
pub enum TlsEvent {
    /// Keys for decrypting packets received in `space` are available
    ReadKeys {
        /// Number space the keys belong to
        space: SpaceId,
        /// The keys
        keys: DirectionalKeys,
    },
    /// Keys for encrypting packets sent in `space` are available
    WriteKeys {
        /// Number space the keys belong to
        space: SpaceId,
        /// The keys
        keys: DirectionalKeys,
    },
    /// Handshake bytes to be sent in CRYPTO frames of `space`
    HandshakeBytes {
        /// Number space the bytes must be sent in
        space: SpaceId,
        /// The bytes
        data: Bytes,
    },
    /// The peer's encoded transport parameters
    PeerParams(Bytes),
    /// The TLS handshake completed
    HandshakeDone,
}

/// Client-side configuration for the cryptography protocol
pub trait ClientConfig: Send + Sync {
    /// Start a client session
    fn start_session(
        self: Arc<Self>,
        server_name: &str,
        params: &TransportParameters,
    ) -> Result<Box<dyn Session>, ConnectError>;
}

/// Server-side configuration for the cryptography protocol
pub trait ServerConfig: Send + Sync {
    /// Create the server's Initial keys for a connection the client started with `dst_cid`
    ///
    /// Needed to answer an Initial packet without creating a connection.
    fn initial_keys(&self, dst_cid: &ConnectionId) -> Keys;

    /// Compute the integrity tag of a Retry packet sent in response to `orig_dst_cid`
    fn retry_tag(
        &self,
        orig_dst_cid: &ConnectionId,
        packet: &[u8],
    ) -> Result<[u8; 16], CryptoError>;

    /// Start a server session
    fn start_session(
        self: Arc<Self>,
        params: &TransportParameters,
    ) -> Result<Box<dyn Session>, TransportError>;
}

/// Packet and header protection keys for one direction
pub struct DirectionalKeys {
    /// Header protection
    pub header: Box<dyn HeaderKey>,
    /// Packet protection
    pub packet: Box<dyn PacketKey>,
}

/// Keys for both directions of a number space
pub struct Keys {
    /// Keys for packets we send
    pub local: DirectionalKeys,
    /// Keys for packets we receive
    pub remote: DirectionalKeys,
}

/// A pair of keys for bidirectional communication
pub struct KeyPair<T> {
    /// Key for encrypting data
    pub local: T,
    /// Key for decrypting data
    pub remote: T,
}

/// Keys used to protect packet payloads
pub trait PacketKey: Send + Sync {
    /// Encrypt the packet payload with the given packet number
    ///
    /// `buf` holds the header followed by the plaintext and `tag_len()` bytes of space for the tag.
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize) -> Result<(), CryptoError>;
    /// Decrypt the packet payload with the given packet number
    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;
    /// The length of the AEAD tag appended to packets on encryption
    fn tag_len(&self) -> usize;
    /// Maximum number of packets that may be sent using a single key
    fn confidentiality_limit(&self) -> u64;
    /// Maximum number of incoming packets that may fail decryption before the connection must
    /// be abandoned
    fn integrity_limit(&self) -> u64;
}

/// Keys used to protect packet headers
pub trait HeaderKey: Send + Sync {
    /// Remove header protection from the packet, whose packet number starts at `pn_offset`
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) -> Result<(), CryptoError>;
    /// Apply header protection to the packet, whose packet number starts at `pn_offset`
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) -> Result<(), CryptoError>;
    /// The sample size used for this key's algorithm
    fn sample_size(&self) -> usize;
}

/// A key for signing with HMAC-based algorithms
pub trait HmacKey: Send + Sync {
    /// Method for signing a message
    fn sign(&self, data: &[u8], signature_out: &mut [u8]);
    /// Length of `sign`'s output
    fn signature_len(&self) -> usize;
    /// Method for verifying a message
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError>;
}

/// A pseudo random key for HKDF
pub trait HandshakeTokenKey: Send + Sync {
    /// Derive AEAD using hkdf
    fn aead_from_hkdf(&self, random_bytes: &[u8]) -> Result<Box<dyn AeadKey>, CryptoError>;
}

/// A key for sealing data with AEAD-based algorithms
pub trait AeadKey {
    /// Method for sealing message `data`
    fn seal(&self, data: &mut Vec<u8>, additional_data: &[u8]) -> Result<(), CryptoError>;
    /// Method for opening a sealed message `data`
    fn open<'a>(
        &self,
        data: &'a mut [u8],
        additional_data: &[u8],
    ) -> Result<&'a mut [u8], CryptoError>;
}

/// Generic crypto errors
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[error("cryptographic operation failed")]
pub struct CryptoError;
