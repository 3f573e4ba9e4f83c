//! The datagram socket an endpoint sends and receives through

use std::{
    fmt::Debug,
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
};

use tokio::io::ReadBuf;

/// An outgoing UDP datagram
#[derive(Debug, Copy, Clone)]
pub struct Datagram<'a> {
    /// Address the datagram is sent to
    pub destination: SocketAddr,
    /// Bytes of the datagram
    pub contents: &'a [u8],
}

/// Abstract implementation of a UDP socket
///
/// An endpoint owns its transport exclusively. Connections never write to it directly; they hand
/// datagrams to the endpoint, which calls [`try_send`](Self::try_send).
pub trait PacketTransport: Send + Sync + Debug + 'static {
    /// Receive a single datagram into `buf`, returning its length and source
    fn poll_recv(&self, cx: &mut Context, buf: &mut [u8]) -> Poll<io::Result<(usize, SocketAddr)>>;

    /// Send a datagram without blocking
    ///
    /// `WouldBlock` means the socket is full and the datagram should be retried later.
    fn try_send(&self, datagram: &Datagram<'_>) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Release the socket; later sends fail
    fn close(&self);
}

/// A [`PacketTransport`] over a tokio UDP socket
#[derive(Debug)]
pub struct UdpTransport {
    io: tokio::net::UdpSocket,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Bind a socket to `addr`
    ///
    /// Must be called within a tokio runtime. IPv6 sockets also accept IPv4 traffic where the
    /// platform allows it.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        if addr.is_ipv6() {
            if let Err(e) = socket.set_only_v6(false) {
                tracing::debug!(%e, "unable to make socket dual-stack");
            }
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        Self::from_std(socket.into())
    }

    /// Wrap an already bound socket
    pub fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            io: tokio::net::UdpSocket::from_std(socket)?,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> io::Result<()> {
        match self.closed.load(Ordering::Acquire) {
            true => Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed")),
            false => Ok(()),
        }
    }
}

impl PacketTransport for UdpTransport {
    fn poll_recv(&self, cx: &mut Context, buf: &mut [u8]) -> Poll<io::Result<(usize, SocketAddr)>> {
        self.check_open()?;
        let mut buf = ReadBuf::new(buf);
        match self.io.poll_recv_from(cx, &mut buf) {
            Poll::Ready(Ok(addr)) => Poll::Ready(Ok((buf.filled().len(), addr))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn try_send(&self, datagram: &Datagram<'_>) -> io::Result<()> {
        self.check_open()?;
        self.io
            .try_send_to(datagram.contents, datagram.destination)
            .map(|_| ())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;

    use super::*;

    #[tokio::test]
    async fn loopback_round_trip() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let destination = b.local_addr().unwrap();

        // A fresh socket is writable; retry in the unlikely case it is not
        loop {
            match a.try_send(&Datagram {
                destination,
                contents: b"ping",
            }) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => tokio::task::yield_now().await,
                Err(e) => panic!("send failed: {e}"),
            }
        }

        let mut buf = [0; 64];
        let (len, from) = poll_fn(|cx| b.poll_recv(cx, &mut buf)).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn closed_transport_refuses_io() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        a.close();
        let err = a
            .try_send(&Datagram {
                destination: a.local_addr().unwrap(),
                contents: b"x",
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        let mut buf = [0; 8];
        assert!(poll_fn(|cx| a.poll_recv(cx, &mut buf)).await.is_err());
    }
}
