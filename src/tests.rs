use std::{
    io::{self, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    RootCertStore,
};
use tracing::{info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

use super::{
    ApplicationClose, ClientConfig, ConnectError, Connection, ConnectionError, ConnectionPhase,
    Endpoint, ServerConfig, Side, TransportConfig, TransportErrorCode, VarInt,
};

fn localhost() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// A self-signed certificate and configurations trusting it
pub(crate) struct Pki {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl Pki {
    pub(crate) fn new() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        Self {
            cert: cert.cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()),
        }
    }

    pub(crate) fn server_config(&self) -> ServerConfig {
        ServerConfig::with_single_cert(
            vec![self.cert.clone()],
            PrivateKeyDer::Pkcs8(self.key.clone_key()),
        )
        .unwrap()
    }

    pub(crate) fn client_config(&self) -> ClientConfig {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).unwrap();
        ClientConfig::with_root_certificates(Arc::new(roots)).unwrap()
    }

    fn server(&self) -> Endpoint {
        Endpoint::server(self.server_config(), localhost()).unwrap()
    }
}

/// Connect `client` to `server`, returning both ends
async fn pair(pki: &Pki, client: &Endpoint, server: &Endpoint) -> (Connection, Connection) {
    let addr = server.local_addr().unwrap();
    let (client_conn, server_conn) = tokio::join!(
        client
            .connect(addr, "localhost", pki.client_config())
            .instrument(info_span!("client")),
        server.accept().instrument(info_span!("server")),
    );
    (client_conn.unwrap(), server_conn.unwrap())
}

#[tokio::test]
async fn handshake() {
    let _guard = subscribe();
    let pki = Pki::new();
    let server = pki.server();
    let client = Endpoint::client(localhost()).unwrap();

    let (client_conn, server_conn) = pair(&pki, &client, &server).await;
    info!("connected");
    assert_eq!(client_conn.remote_addr(), server.local_addr().unwrap());
    assert_eq!(server_conn.remote_addr(), client.local_addr().unwrap());

    let client_info = client_conn.connection_state().await;
    assert_eq!(client_info.side, Side::Client);
    assert_eq!(client_info.phase, ConnectionPhase::Established);
    assert!(client_info.has_peer_certificates);
    // Limits the server advertised in its transport parameters
    assert_eq!(client_info.peer_max_streams_bidi, 100);
    assert_eq!(client_info.peer_max_streams_uni, 100);
    assert_eq!(client_info.peer_max_data, VarInt::MAX.into_inner());

    let server_info = server_conn.connection_state().await;
    assert_eq!(server_info.side, Side::Server);
    assert_eq!(server_info.phase, ConnectionPhase::Established);
    assert!(server_info.handshake_confirmed);
    assert!(!server_info.has_peer_certificates);
}

#[tokio::test]
async fn abort_is_seen_by_peer() {
    let _guard = subscribe();
    let pki = Pki::new();
    let server = pki.server();
    let client = Endpoint::client(localhost()).unwrap();
    let (client_conn, server_conn) = pair(&pki, &client, &server).await;

    let reason = ApplicationClose {
        error_code: VarInt::from_u32(42),
        reason: Bytes::from_static(b"done"),
    };
    client_conn.abort(reason.clone()).await;
    assert_eq!(
        server_conn.closed().await,
        ConnectionError::ApplicationClosed(reason)
    );
    assert_eq!(client_conn.closed().await, ConnectionError::LocallyClosed);
}

#[tokio::test]
async fn server_close_reaches_client() {
    let _guard = subscribe();
    let pki = Pki::new();
    let server = pki.server();
    let client = Endpoint::client(localhost()).unwrap();
    let (client_conn, _server_conn) = pair(&pki, &client, &server).await;

    server
        .close(Instant::now() + Duration::from_secs(5))
        .await
        .unwrap();
    let error = client_conn.closed().await;
    match &error {
        ConnectionError::ConnectionClosed(close) => {
            assert_eq!(close.error_code, TransportErrorCode::NO_ERROR)
        }
        e => panic!("unexpected error: {e:?}"),
    }
    assert!(error.is_clean());
    assert!(server.accept().await.is_none());
}

#[tokio::test]
async fn closed_endpoint_refuses_to_dial() {
    let _guard = subscribe();
    let pki = Pki::new();
    let server = pki.server();
    let client = Endpoint::client(localhost()).unwrap();
    let (client_conn, _server_conn) = pair(&pki, &client, &server).await;

    // Already past the deadline, so the connection is dropped without waiting
    assert!(client.close(Instant::now()).await.is_err());
    assert_eq!(client_conn.closed().await, ConnectionError::LocallyClosed);
    match client
        .connect(server.local_addr().unwrap(), "localhost", pki.client_config())
        .await
    {
        Err(ConnectError::EndpointStopping) => {}
        Err(e) => panic!("unexpected error: {e:?}"),
        Ok(_) => panic!("unexpected success"),
    }
}

#[tokio::test]
async fn retry_round_trip() {
    let _guard = subscribe();
    let pki = Pki::new();
    let mut server_config = pki.server_config();
    server_config.use_retry(true);
    let server = Endpoint::server(server_config, localhost()).unwrap();
    let client = Endpoint::client(localhost()).unwrap();

    let (client_conn, server_conn) = pair(&pki, &client, &server).await;
    assert_eq!(
        client_conn.connection_state().await.phase,
        ConnectionPhase::Established
    );
    assert_eq!(
        server_conn.connection_state().await.phase,
        ConnectionPhase::Established
    );
}

#[tokio::test]
async fn handshake_timeout() {
    let _guard = subscribe();
    let pki = Pki::new();
    let client = Endpoint::client(localhost()).unwrap();

    const TIMEOUT: Duration = Duration::from_millis(300);
    let mut transport = TransportConfig::default();
    transport
        .handshake_timeout(TIMEOUT)
        .initial_rtt(Duration::from_millis(10));
    let mut config = pki.client_config();
    config.transport_config(Arc::new(transport));

    let start = Instant::now();
    // Nothing listens on the discard port
    let result = client
        .connect(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9),
            "localhost",
            config,
        )
        .await;
    match result {
        Err(ConnectError::Connection(ConnectionError::TimedOut)) => {}
        Err(e) => panic!("unexpected error: {e:?}"),
        Ok(_) => panic!("unexpected success"),
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= TIMEOUT && elapsed < 4 * TIMEOUT, "{elapsed:?}");
}

#[tokio::test]
async fn dropped_dial_is_abandoned() {
    let _guard = subscribe();
    let pki = Pki::new();
    let silent = std::net::UdpSocket::bind(localhost()).unwrap();
    let client = Endpoint::client(localhost()).unwrap();

    let mut transport = TransportConfig::default();
    transport.initial_rtt(Duration::from_millis(10));
    let mut config = pki.client_config();
    config.transport_config(Arc::new(transport));

    let dial = client.connect(silent.local_addr().unwrap(), "localhost", config);
    assert!(tokio::time::timeout(Duration::from_millis(50), dial)
        .await
        .is_err());
    // Drains long before the ten second handshake timeout would have fired
    tokio::time::timeout(Duration::from_secs(2), client.wait_idle())
        .await
        .unwrap();

    // The peer saw the first Initial and then the close
    silent.set_nonblocking(true).unwrap();
    let mut buf = [0; 1500];
    let mut received = 0;
    while silent.recv_from(&mut buf).is_ok() {
        received += 1;
    }
    assert!(received >= 2, "{received}");
}

#[tokio::test]
async fn invalid_remote_address() {
    let pki = Pki::new();
    let client = Endpoint::client(localhost()).unwrap();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    match client.connect(addr, "localhost", pki.client_config()).await {
        Err(ConnectError::InvalidRemoteAddress(x)) => assert_eq!(x, addr),
        Err(e) => panic!("unexpected error: {e:?}"),
        Ok(_) => panic!("unexpected success"),
    }
}

#[tokio::test]
async fn dial_helper_closes_its_endpoint() {
    let _guard = subscribe();
    let pki = Pki::new();
    let server = pki.server();
    let addr = server.local_addr().unwrap();

    let (client_conn, server_conn) = tokio::join!(
        super::connect(addr, "localhost", pki.client_config()),
        server.accept(),
    );
    let (client_conn, server_conn) = (client_conn.unwrap(), server_conn.unwrap());
    server_conn
        .abort(ApplicationClose {
            error_code: VarInt::from_u32(0),
            reason: Bytes::new(),
        })
        .await;
    let error = client_conn.closed().await;
    assert!(error.is_clean(), "{error:?}");
}

pub(crate) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
