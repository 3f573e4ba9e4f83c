//! Connection identifiers, stateless reset tokens and connection id generation

use std::{fmt, hash};

use bytes::{Buf, BufMut};
use rand::RngCore;

use crate::{coding::BufExt, constant_time, crypto::HmacKey, MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Protocol-level identifier for a connection.
///
/// Mainly useful for identifying this connection's packets on the wire with tools like Wireshark.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct a connection id from its raw bytes, which must be at most 20 bytes long
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Construct a random connection id of the requested length
    pub(crate) fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    /// Decode from long header format
    pub(crate) fn decode_long(buf: &mut impl Buf) -> Option<Self> {
        let len = buf.get::<u8>().ok()? as usize;
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return None;
        }
        let mut bytes = [0; MAX_CID_SIZE];
        buf.copy_to_slice(&mut bytes[..len]);
        Some(Self {
            len: len as u8,
            bytes,
        })
    }

    /// Encode in long header format
    pub(crate) fn encode_long(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.len() as u8);
        buf.put_slice(self);
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Stateless reset token
///
/// Used for an endpoint to securely communicate that it has lost state for a connection.
#[derive(Copy, Clone)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    /// Derive the token an endpoint using `key` would send for connection id `id`
    pub(crate) fn new(key: &dyn HmacKey, id: &ConnectionId) -> Self {
        let mut signature = vec![0; key.signature_len()];
        key.sign(id, &mut signature);
        let mut result = [0; RESET_TOKEN_SIZE];
        result.copy_from_slice(&signature[..RESET_TOKEN_SIZE]);
        result.into()
    }
}

impl PartialEq for ResetToken {
    fn eq(&self, other: &Self) -> bool {
        constant_time::eq(&self.0, &other.0)
    }
}

impl Eq for ResetToken {}

impl hash::Hash for ResetToken {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl std::ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Generates connection IDs for incoming connections
pub trait ConnectionIdGenerator: Send + Sync {
    /// Generates a new CID
    ///
    /// Connection IDs MUST NOT contain any information that can be used by an external observer
    /// to correlate them with other connection IDs for the same connection.
    fn generate_cid(&self) -> ConnectionId;
    /// Returns the length of a CID for connections created by this generator
    fn cid_len(&self) -> usize;
}

/// CID filled with random bytes
#[derive(Debug, Clone, Copy)]
pub struct RandomConnectionIdGenerator {
    cid_len: usize,
}

impl Default for RandomConnectionIdGenerator {
    fn default() -> Self {
        Self { cid_len: 8 }
    }
}

impl RandomConnectionIdGenerator {
    /// Initialize Random CID generator with a fixed CID length, at most `MAX_CID_SIZE`
    pub fn new(cid_len: usize) -> Self {
        debug_assert!(cid_len <= MAX_CID_SIZE);
        Self { cid_len }
    }
}

impl ConnectionIdGenerator for RandomConnectionIdGenerator {
    fn generate_cid(&self) -> ConnectionId {
        ConnectionId::random(&mut rand::rng(), self.cid_len)
    }

    fn cid_len(&self) -> usize {
        self.cid_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_header_cid_round_trip() {
        let cid = ConnectionId::new(&[0xab, 0xcd, 0xef]);
        let mut buf = Vec::new();
        cid.encode_long(&mut buf);
        assert_eq!(buf, [3, 0xab, 0xcd, 0xef]);
        let decoded = ConnectionId::decode_long(&mut &buf[..]).unwrap();
        assert_eq!(decoded, cid);
        assert_eq!(decoded.to_string(), "abcdef");
    }

    #[test]
    fn oversized_cid_rejected() {
        let mut buf = vec![21u8];
        buf.extend_from_slice(&[0; 21]);
        assert!(ConnectionId::decode_long(&mut &buf[..]).is_none());
    }

    #[test]
    fn reset_token_is_keyed_on_cid() {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &[7; 64]);
        let a = ConnectionId::new(&[1; 8]);
        let b = ConnectionId::new(&[2; 8]);
        assert_eq!(ResetToken::new(&key, &a), ResetToken::new(&key, &a));
        assert_ne!(ResetToken::new(&key, &a), ResetToken::new(&key, &b));
    }

    #[test]
    fn random_generator_length() {
        let generator = RandomConnectionIdGenerator::new(12);
        assert_eq!(generator.generate_cid().len(), 12);
        assert_eq!(generator.cid_len(), 12);
    }
}
