use std::{
    io,
    net::{IpAddr, SocketAddr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::{
    cid::ConnectionId,
    coding::{BufExt, BufMutExt},
    crypto::{CryptoError, HandshakeTokenKey},
};

/// Proof, handed out in a Retry packet, that a client owns its address
///
/// Sealed with a key derived from the Retry's source connection id, which the client echoes
/// back as the destination id of its next Initial.
pub(crate) struct RetryToken {
    /// The destination connection ID set in the very first packet from the client
    pub(crate) orig_dst_cid: ConnectionId,
    /// The time at which this token was issued
    pub(crate) issued: SystemTime,
}

impl RetryToken {
    pub(crate) fn encode(
        &self,
        key: &dyn HandshakeTokenKey,
        address: &SocketAddr,
        retry_src_cid: &ConnectionId,
    ) -> Result<Vec<u8>, CryptoError> {
        let aead_key = key.aead_from_hkdf(retry_src_cid)?;

        let mut buf = Vec::new();
        encode_addr(&mut buf, address);
        self.orig_dst_cid.encode_long(&mut buf);
        buf.write::<u64>(
            self.issued
                .duration_since(UNIX_EPOCH)
                .map(|x| x.as_secs())
                .unwrap_or(0),
        );

        aead_key.seal(&mut buf, &[])?;
        Ok(buf)
    }

    pub(crate) fn from_bytes(
        key: &dyn HandshakeTokenKey,
        address: &SocketAddr,
        retry_src_cid: &ConnectionId,
        raw_token_bytes: &[u8],
    ) -> Result<Self, TokenDecodeError> {
        let aead_key = key.aead_from_hkdf(retry_src_cid)?;
        let mut sealed_token = raw_token_bytes.to_vec();

        let data = aead_key.open(&mut sealed_token, &[])?;
        let mut reader = io::Cursor::new(&*data);
        let token_addr = decode_addr(&mut reader).ok_or(TokenDecodeError::UnknownToken)?;
        if token_addr != *address {
            return Err(TokenDecodeError::WrongAddress);
        }
        let orig_dst_cid =
            ConnectionId::decode_long(&mut reader).ok_or(TokenDecodeError::UnknownToken)?;
        let secs = reader
            .get::<u64>()
            .map_err(|_| TokenDecodeError::UnknownToken)?;

        Ok(Self {
            orig_dst_cid,
            issued: UNIX_EPOCH + Duration::from_secs(secs),
        })
    }

    /// Decode a token and check that it has not outlived `lifetime`
    pub(crate) fn validate(
        key: &dyn HandshakeTokenKey,
        address: &SocketAddr,
        retry_src_cid: &ConnectionId,
        raw_token_bytes: &[u8],
        lifetime: Duration,
        now: SystemTime,
    ) -> Result<Self, TokenDecodeError> {
        let token = Self::from_bytes(key, address, retry_src_cid, raw_token_bytes)?;
        if token.issued + lifetime < now {
            return Err(TokenDecodeError::Expired);
        }
        Ok(token)
    }
}

fn encode_addr(buf: &mut Vec<u8>, address: &SocketAddr) {
    match address.ip() {
        IpAddr::V4(x) => {
            buf.put_u8(0);
            buf.put_slice(&x.octets());
        }
        IpAddr::V6(x) => {
            buf.put_u8(1);
            buf.put_slice(&x.octets());
        }
    }
    buf.put_u16(address.port());
}

fn decode_addr<B: Buf>(buf: &mut B) -> Option<SocketAddr> {
    let ip = match buf.get::<u8>().ok()? {
        0 => IpAddr::V4(buf.get().ok()?),
        1 => IpAddr::V6(buf.get().ok()?),
        _ => return None,
    };
    let port = buf.get::<u16>().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Reasons why a retry token might fail to validate a client's address
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub(crate) enum TokenDecodeError {
    /// Token was not recognized
    #[error("unknown token")]
    UnknownToken,
    /// Token was well-formed but associated with an incorrect address
    #[error("token issued to another address")]
    WrongAddress,
    /// Token is older than the configured lifetime
    #[error("token expired")]
    Expired,
}

impl From<CryptoError> for TokenDecodeError {
    fn from(CryptoError: CryptoError) -> Self {
        Self::UnknownToken
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use rand::RngCore;

    use super::*;
    use crate::{
        cid::{ConnectionIdGenerator, RandomConnectionIdGenerator},
        MAX_CID_SIZE,
    };

    fn key() -> ring::hkdf::Prk {
        let mut master_key = [0; 64];
        rand::rng().fill_bytes(&mut master_key);
        ring::hkdf::Salt::new(ring::hkdf::HKDF_SHA256, &[]).extract(&master_key)
    }

    #[test]
    fn token_sanity() {
        let prk = key();
        let addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4433);
        let retry_src_cid = RandomConnectionIdGenerator::new(MAX_CID_SIZE).generate_cid();
        let token = RetryToken {
            orig_dst_cid: RandomConnectionIdGenerator::new(MAX_CID_SIZE).generate_cid(),
            issued: UNIX_EPOCH + Duration::new(42, 0), // Fractional seconds would be lost
        };
        let encoded = token.encode(&prk, &addr, &retry_src_cid).unwrap();

        let decoded = RetryToken::from_bytes(&prk, &addr, &retry_src_cid, &encoded)
            .expect("token didn't validate");
        assert_eq!(token.orig_dst_cid, decoded.orig_dst_cid);
        assert_eq!(token.issued, decoded.issued);

        let other = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4434);
        assert_eq!(
            RetryToken::from_bytes(&prk, &other, &retry_src_cid, &encoded).err(),
            Some(TokenDecodeError::WrongAddress)
        );
        let other_cid = RandomConnectionIdGenerator::new(MAX_CID_SIZE).generate_cid();
        assert_eq!(
            RetryToken::from_bytes(&prk, &addr, &other_cid, &encoded).err(),
            Some(TokenDecodeError::UnknownToken)
        );
    }

    #[test]
    fn expired_token_rejected() {
        let prk = key();
        let addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4433);
        let retry_src_cid = ConnectionId::new(&[9; 8]);
        let issued = UNIX_EPOCH + Duration::from_secs(1_000);
        let encoded = RetryToken {
            orig_dst_cid: ConnectionId::new(&[1; 8]),
            issued,
        }
        .encode(&prk, &addr, &retry_src_cid)
        .unwrap();

        let lifetime = Duration::from_secs(15);
        assert!(RetryToken::validate(
            &prk,
            &addr,
            &retry_src_cid,
            &encoded,
            lifetime,
            issued + Duration::from_secs(10)
        )
        .is_ok());
        assert_eq!(
            RetryToken::validate(
                &prk,
                &addr,
                &retry_src_cid,
                &encoded,
                lifetime,
                issued + Duration::from_secs(20)
            )
            .err(),
            Some(TokenDecodeError::Expired)
        );
    }

    #[test]
    fn invalid_token_returns_err() {
        let prk = key();
        let addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4433);
        let retry_src_cid = RandomConnectionIdGenerator::new(MAX_CID_SIZE).generate_cid();

        let mut invalid_token = Vec::new();
        let mut random_data = [0; 32];
        rand::rng().fill_bytes(&mut random_data);
        invalid_token.put_slice(&random_data);

        assert!(RetryToken::from_bytes(&prk, &addr, &retry_src_cid, &invalid_token).is_err());
    }
}
