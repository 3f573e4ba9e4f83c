use std::{any::Any, collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};
pub use rustls::Error;
use rustls::{
    self, CipherSuite, RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    quic::{Connection, HeaderProtectionKey, KeyChange, PacketKey, Secrets, Suite, Version},
};
use tracing::trace;

use crate::{
    cid::ConnectionId,
    crypto::{self, CryptoError, DirectionalKeys, KeyPair, Keys, TlsEvent},
    packet::SpaceId,
    transport_parameters::{self, TransportParameters},
    ConnectError, Side, TransportError,
};

impl From<Side> for rustls::Side {
    fn from(s: Side) -> Self {
        match s {
            Side::Client => Self::Client,
            Side::Server => Self::Server,
        }
    }
}

/// A rustls TLS session
pub struct TlsSession {
    inner: Connection,
    suite: Suite,
    /// Space the next handshake bytes written by rustls belong to
    write_space: SpaceId,
    next_secrets: Option<Secrets>,
    events: VecDeque<TlsEvent>,
    got_peer_params: bool,
    reported_done: bool,
}

impl TlsSession {
    fn new(inner: Connection, suite: Suite) -> Self {
        let mut session = Self {
            inner,
            suite,
            write_space: SpaceId::Initial,
            next_secrets: None,
            events: VecDeque::new(),
            got_peer_params: false,
            reported_done: false,
        };
        // A client has its ClientHello ready immediately
        session.write_handshake();
        session
    }

    fn side(&self) -> Side {
        match self.inner {
            Connection::Client(_) => Side::Client,
            Connection::Server(_) => Side::Server,
        }
    }

    /// Drain everything rustls has to send
    ///
    /// Bytes written before a key change belong to the space that was current when they were
    /// written; the change itself moves output to the next space.
    fn write_handshake(&mut self) {
        loop {
            let mut outgoing = Vec::new();
            let change = self.inner.write_hs(&mut outgoing);
            if !outgoing.is_empty() {
                self.events.push_back(TlsEvent::HandshakeBytes {
                    space: self.write_space,
                    data: outgoing.into(),
                });
            }
            let keys = match change {
                None => break,
                Some(KeyChange::Handshake { keys }) => {
                    self.write_space = SpaceId::Handshake;
                    keys
                }
                Some(KeyChange::OneRtt { keys, next }) => {
                    self.write_space = SpaceId::Data;
                    self.next_secrets = Some(next);
                    keys
                }
            };
            trace!(space = ?self.write_space, "new keys available");
            self.events.push_back(TlsEvent::ReadKeys {
                space: self.write_space,
                keys: DirectionalKeys {
                    header: Box::new(keys.remote.header),
                    packet: Box::new(keys.remote.packet),
                },
            });
            self.events.push_back(TlsEvent::WriteKeys {
                space: self.write_space,
                keys: DirectionalKeys {
                    header: Box::new(keys.local.header),
                    packet: Box::new(keys.local.packet),
                },
            });
        }
    }
}

impl crypto::Session for TlsSession {
    fn initial_keys(&self, dst_cid: &ConnectionId, side: Side) -> Keys {
        initial_keys(dst_cid, side, &self.suite)
    }

    fn read_handshake(&mut self, space: SpaceId, buf: &[u8]) -> Result<(), TransportError> {
        trace!(?space, len = buf.len(), "handshake bytes received");
        self.inner.read_hs(buf).map_err(|e| {
            if let Some(alert) = self.inner.alert() {
                TransportError::crypto(alert.into(), e.to_string())
            } else {
                TransportError::PROTOCOL_VIOLATION(format!("TLS error: {e}"))
            }
        })?;

        if !self.got_peer_params {
            if let Some(params) = self.inner.quic_transport_parameters() {
                self.got_peer_params = true;
                self.events
                    .push_back(TlsEvent::PeerParams(Bytes::copy_from_slice(params)));
            }
        }
        self.write_handshake();
        if !self.reported_done && !self.inner.is_handshaking() {
            self.reported_done = true;
            self.events.push_back(TlsEvent::HandshakeDone);
        }
        Ok(())
    }

    fn next_event(&mut self) -> Option<TlsEvent> {
        self.events.pop_front()
    }

    fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn crypto::PacketKey>>> {
        let secrets = self.next_secrets.as_mut()?;
        let keys = secrets.next_packet_keys();
        Some(KeyPair {
            local: Box::new(keys.local),
            remote: Box::new(keys.remote),
        })
    }

    fn is_handshaking(&self) -> bool {
        self.inner.is_handshaking()
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.inner.alpn_protocol().map(|x| x.to_vec())
    }

    fn peer_identity(&self) -> Option<Box<dyn Any>> {
        self.inner.peer_certificates().map(|v| -> Box<dyn Any> {
            Box::new(
                v.iter()
                    .map(|v| v.clone().into_owned())
                    .collect::<Vec<CertificateDer<'static>>>(),
            )
        })
    }

    fn is_valid_retry(&self, orig_dst_cid: &ConnectionId, header: &[u8], payload: &[u8]) -> bool {
        crypto::ring::is_valid_retry(orig_dst_cid, header, payload)
    }

    fn close(&mut self) {
        trace!(side = ?self.side(), "closing TLS session");
        self.events.clear();
        self.next_secrets = None;
    }
}

impl crypto::HeaderKey for Box<dyn HeaderProtectionKey> {
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) -> Result<(), CryptoError> {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let (first, rest) = header.split_at_mut(1);
        let pn_end = Ord::min(pn_offset + 3, rest.len());
        self.decrypt_in_place(
            &sample[..self.sample_len()],
            &mut first[0],
            &mut rest[pn_offset - 1..pn_end],
        )
        .map_err(|_| CryptoError)
    }

    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) -> Result<(), CryptoError> {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let (first, rest) = header.split_at_mut(1);
        let pn_end = Ord::min(pn_offset + 3, rest.len());
        self.encrypt_in_place(
            &sample[..self.sample_len()],
            &mut first[0],
            &mut rest[pn_offset - 1..pn_end],
        )
        .map_err(|_| CryptoError)
    }

    fn sample_size(&self) -> usize {
        self.sample_len()
    }
}

impl crypto::PacketKey for Box<dyn PacketKey> {
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize) -> Result<(), CryptoError> {
        let (header, payload_tag) = buf.split_at_mut(header_len);
        let (payload, tag_storage) = payload_tag.split_at_mut(payload_tag.len() - self.tag_len());
        let tag = self
            .encrypt_in_place(packet, &*header, payload)
            .map_err(|_| CryptoError)?;
        tag_storage.copy_from_slice(tag.as_ref());
        Ok(())
    }

    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        let plain = self
            .decrypt_in_place(packet, header, payload.as_mut())
            .map_err(|_| CryptoError)?;
        let plain_len = plain.len();
        payload.truncate(plain_len);
        Ok(())
    }

    fn tag_len(&self) -> usize {
        (**self).tag_len()
    }

    fn confidentiality_limit(&self) -> u64 {
        (**self).confidentiality_limit()
    }

    fn integrity_limit(&self) -> u64 {
        (**self).integrity_limit()
    }
}

/// A QUIC-compatible TLS client configuration
///
/// The wrapped [`rustls::ClientConfig`] must have TLS 1.3 enabled and offer
/// TLS13_AES_128_GCM_SHA256, which protects Initial packets.
pub struct QuicClientConfig {
    inner: Arc<rustls::ClientConfig>,
    initial: Suite,
}

impl QuicClientConfig {
    /// Build a configuration that trusts the given roots
    pub fn with_root_certificates(roots: Arc<RootCertStore>) -> Result<Self, Error> {
        let inner = rustls::ClientConfig::builder_with_provider(configured_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self::try_from(inner).map_err(|e| Error::General(e.to_string()))
    }
}

impl crypto::ClientConfig for QuicClientConfig {
    fn start_session(
        self: Arc<Self>,
        server_name: &str,
        params: &TransportParameters,
    ) -> Result<Box<dyn crypto::Session>, ConnectError> {
        let name = ServerName::try_from(server_name)
            .map_err(|_| ConnectError::InvalidServerName(server_name.into()))?
            .to_owned();
        let conn = rustls::quic::ClientConnection::new(
            self.inner.clone(),
            Version::V1,
            name,
            to_vec(params),
        )?;
        Ok(Box::new(TlsSession::new(
            Connection::Client(conn),
            self.initial,
        )))
    }
}

impl TryFrom<rustls::ClientConfig> for QuicClientConfig {
    type Error = NoInitialCipherSuite;

    fn try_from(inner: rustls::ClientConfig) -> Result<Self, Self::Error> {
        Arc::new(inner).try_into()
    }
}

impl TryFrom<Arc<rustls::ClientConfig>> for QuicClientConfig {
    type Error = NoInitialCipherSuite;

    fn try_from(inner: Arc<rustls::ClientConfig>) -> Result<Self, Self::Error> {
        Ok(Self {
            initial: initial_suite_from_provider(inner.crypto_provider())
                .ok_or(NoInitialCipherSuite)?,
            inner,
        })
    }
}

/// The initial cipher suite (AES-128-GCM-SHA256) is not available
#[derive(Clone, Debug, thiserror::Error)]
#[error("no initial cipher suite found")]
pub struct NoInitialCipherSuite;

/// A QUIC-compatible TLS server configuration
///
/// The wrapped [`rustls::ServerConfig`] must have TLS 1.3 enabled and offer
/// TLS13_AES_128_GCM_SHA256.
pub struct QuicServerConfig {
    inner: Arc<rustls::ServerConfig>,
    initial: Suite,
}

impl QuicServerConfig {
    /// Build a configuration presenting a single certificate chain
    pub fn with_single_cert(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, Error> {
        let inner = rustls::ServerConfig::builder_with_provider(configured_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
        Self::try_from(inner).map_err(|e| Error::General(e.to_string()))
    }
}

impl TryFrom<rustls::ServerConfig> for QuicServerConfig {
    type Error = NoInitialCipherSuite;

    fn try_from(inner: rustls::ServerConfig) -> Result<Self, Self::Error> {
        Arc::new(inner).try_into()
    }
}

impl TryFrom<Arc<rustls::ServerConfig>> for QuicServerConfig {
    type Error = NoInitialCipherSuite;

    fn try_from(inner: Arc<rustls::ServerConfig>) -> Result<Self, Self::Error> {
        Ok(Self {
            initial: initial_suite_from_provider(inner.crypto_provider())
                .ok_or(NoInitialCipherSuite)?,
            inner,
        })
    }
}

impl crypto::ServerConfig for QuicServerConfig {
    fn initial_keys(&self, dst_cid: &ConnectionId) -> Keys {
        initial_keys(dst_cid, Side::Server, &self.initial)
    }

    fn retry_tag(
        &self,
        orig_dst_cid: &ConnectionId,
        packet: &[u8],
    ) -> Result<[u8; 16], CryptoError> {
        crypto::ring::retry_tag(orig_dst_cid, packet)
    }

    fn start_session(
        self: Arc<Self>,
        params: &TransportParameters,
    ) -> Result<Box<dyn crypto::Session>, TransportError> {
        let conn = rustls::quic::ServerConnection::new(
            self.inner.clone(),
            Version::V1,
            to_vec(params),
        )
        .map_err(|e| TransportError::INTERNAL_ERROR(format!("TLS setup failed: {e}")))?;
        Ok(Box::new(TlsSession::new(
            Connection::Server(conn),
            self.initial,
        )))
    }
}

pub(crate) fn initial_suite_from_provider(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Option<Suite> {
    provider
        .cipher_suites
        .iter()
        .find_map(|cs| match (cs.suite(), cs.tls13()) {
            (CipherSuite::TLS13_AES_128_GCM_SHA256, Some(suite)) => Some(suite.quic_suite()),
            _ => None,
        })
        .flatten()
}

pub(crate) fn configured_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn to_vec(params: &TransportParameters) -> Vec<u8> {
    let mut bytes = Vec::new();
    params.write(&mut bytes);
    transport_parameters::write_grease(&mut bytes, &mut rand::rng());
    bytes
}

pub(crate) fn initial_keys(dst_cid: &ConnectionId, side: Side, suite: &Suite) -> Keys {
    let keys = suite.keys(dst_cid, side.into(), Version::V1);
    Keys {
        local: DirectionalKeys {
            header: Box::new(keys.local.header),
            packet: Box::new(keys.local.packet),
        },
        remote: DirectionalKeys {
            header: Box::new(keys.remote.header),
            packet: Box::new(keys.remote.packet),
        },
    }
}

impl From<Error> for ConnectError {
    fn from(e: Error) -> Self {
        Self::Tls(e.to_string())
    }
}
