use ring::{aead, error, hkdf, hmac};

use crate::{
    cid::ConnectionId,
    crypto::{self, CryptoError},
};

impl crypto::HmacKey for hmac::Key {
    fn sign(&self, data: &[u8], out: &mut [u8]) {
        out.copy_from_slice(hmac::sign(self, data).as_ref());
    }

    fn signature_len(&self) -> usize {
        32
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        Ok(hmac::verify(self, data, signature)?)
    }
}

impl crypto::HandshakeTokenKey for hkdf::Prk {
    fn aead_from_hkdf(
        &self,
        random_bytes: &[u8],
    ) -> Result<Box<dyn crypto::AeadKey>, CryptoError> {
        let mut key_buffer = [0u8; 32];
        let info = [random_bytes];
        let okm = self.expand(&info, hkdf::HKDF_SHA256)?;
        okm.fill(&mut key_buffer)?;

        let key = aead::UnboundKey::new(&aead::AES_256_GCM, &key_buffer)?;
        Ok(Box::new(aead::LessSafeKey::new(key)))
    }
}

impl crypto::AeadKey for aead::LessSafeKey {
    fn seal(&self, data: &mut Vec<u8>, additional_data: &[u8]) -> Result<(), CryptoError> {
        let aad = aead::Aad::from(additional_data);
        let zero_nonce = aead::Nonce::assume_unique_for_key([0u8; 12]);
        Ok(self.seal_in_place_append_tag(zero_nonce, aad, data)?)
    }

    fn open<'a>(
        &self,
        data: &'a mut [u8],
        additional_data: &[u8],
    ) -> Result<&'a mut [u8], CryptoError> {
        let aad = aead::Aad::from(additional_data);
        let zero_nonce = aead::Nonce::assume_unique_for_key([0u8; 12]);
        Ok(self.open_in_place(zero_nonce, aad, data)?)
    }
}

impl From<error::Unspecified> for CryptoError {
    fn from(_: error::Unspecified) -> Self {
        Self
    }
}

/// Integrity tag of a Retry packet, computed over the pseudo-packet of RFC 9001 §5.8
pub(crate) fn retry_tag(
    orig_dst_cid: &ConnectionId,
    packet: &[u8],
) -> Result<[u8; 16], CryptoError> {
    let mut pseudo_packet = Vec::with_capacity(packet.len() + orig_dst_cid.len() + 1);
    pseudo_packet.push(orig_dst_cid.len() as u8);
    pseudo_packet.extend_from_slice(orig_dst_cid);
    pseudo_packet.extend_from_slice(packet);

    let tag = retry_integrity_key()?.seal_in_place_separate_tag(
        aead::Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE),
        aead::Aad::from(pseudo_packet),
        &mut [],
    )?;
    let mut result = [0; 16];
    result.copy_from_slice(tag.as_ref());
    Ok(result)
}

/// Check the tag trailing `payload`, where `header` and `payload` make up a received Retry packet
pub(crate) fn is_valid_retry(orig_dst_cid: &ConnectionId, header: &[u8], payload: &[u8]) -> bool {
    let tag_start = match payload.len().checked_sub(16) {
        Some(x) => x,
        None => return false,
    };

    let mut pseudo_packet =
        Vec::with_capacity(header.len() + payload.len() + orig_dst_cid.len() + 1);
    pseudo_packet.push(orig_dst_cid.len() as u8);
    pseudo_packet.extend_from_slice(orig_dst_cid);
    pseudo_packet.extend_from_slice(header);
    let tag_start = tag_start + pseudo_packet.len();
    pseudo_packet.extend_from_slice(payload);

    let Ok(key) = retry_integrity_key() else {
        return false;
    };
    let nonce = aead::Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE);
    let (aad, tag) = pseudo_packet.split_at_mut(tag_start);
    key.open_in_place(nonce, aead::Aad::from(aad), tag).is_ok()
}

fn retry_integrity_key() -> Result<aead::LessSafeKey, CryptoError> {
    let key = aead::UnboundKey::new(&aead::AES_128_GCM, &RETRY_INTEGRITY_KEY)?;
    Ok(aead::LessSafeKey::new(key))
}

const RETRY_INTEGRITY_KEY: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8, 0x4e,
];
const RETRY_INTEGRITY_NONCE: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::crypto::{AeadKey, HandshakeTokenKey, HmacKey};

    // RFC 9001 Appendix A.4
    const RETRY: [u8; 20] = hex!("ff000000010008f067a5502a4262b5746f6b656e");
    const TAG: [u8; 16] = hex!("04a265ba2eff4d829058fb3f0f2496ba");

    #[test]
    fn retry_integrity_rfc_vector() {
        let odcid = ConnectionId::new(&hex!("8394c8f03e515708"));
        assert_eq!(retry_tag(&odcid, &RETRY).unwrap(), TAG);

        let header = &RETRY[..7];
        let mut payload = RETRY[7..].to_vec();
        payload.extend_from_slice(&TAG);
        assert!(is_valid_retry(&odcid, header, &payload));

        let other = ConnectionId::new(&hex!("8394c8f03e515709"));
        assert!(!is_valid_retry(&other, header, &payload));
        assert!(!is_valid_retry(&odcid, header, &TAG[..8]));
    }

    #[test]
    fn hmac_sign_verify() {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &[3; 64]);
        let mut signature = [0; 32];
        key.sign(b"cid", &mut signature);
        assert!(key.verify(b"cid", &signature).is_ok());
        assert!(key.verify(b"other", &signature).is_err());
    }

    #[test]
    fn token_aead_round_trip() {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]).extract(&[7; 32]);
        let key = prk.aead_from_hkdf(b"nonce").unwrap();
        let mut data = b"address".to_vec();
        key.seal(&mut data, b"ad").unwrap();
        assert_ne!(&data[..7], b"address");
        let mut tampered = data.clone();
        tampered[0] ^= 1;

        let opened = prk.aead_from_hkdf(b"nonce").unwrap().open(&mut data, b"ad").unwrap();
        assert_eq!(opened, b"address");
        assert!(key.open(&mut tampered, b"ad").is_err());
    }
}
