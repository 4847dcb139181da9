//! Transport capability consumed by the engine.
//!
//! The engine never creates sockets itself. Callers hand it a [`Connector`]
//! (client side) or an [`Acceptor`] (server side); the Tokio-backed
//! [`TcpConnector`] and [`TcpAcceptor`] cover the usual case.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Kind of connection requested from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Reliable byte stream (TCP)
    Stream,
    /// Datagrams (UDP)
    Datagram,
}

/// Outcome of a bounded receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// This many bytes (one datagram for datagram channels) were read
    Data(usize),
    /// Nothing arrived before the timeout
    Empty,
    /// The peer closed its sending side
    Closed,
}

/// A bidirectional connection owned by one session
#[async_trait]
pub trait Connection: Send {
    /// Send the whole buffer (one datagram for datagram channels)
    async fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Wait at most `timeout` for data. A zero timeout polls without waiting.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Received>;

    /// Stop sending. Stream channels half-close; datagram channels do nothing.
    async fn close(&mut self) -> io::Result<()>;

    fn channel(&self) -> Channel;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Client-side half of the transport capability
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, channel: Channel) -> io::Result<Box<dyn Connection>>;
}

/// Server-side half of the transport capability
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next connection of the given kind.
    ///
    /// For datagram channels this returns once the first datagram arrived,
    /// with the connection bound to its sender; that datagram is still queued.
    async fn accept(&mut self, channel: Channel) -> io::Result<Box<dyn Connection>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Any Tokio byte stream as a [`Connection`]
pub struct StreamConnection<S> {
    inner: S,
    peer: Option<SocketAddr>,
}

impl<S> StreamConnection<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, peer: None }
    }

    pub fn with_peer(inner: S, peer: SocketAddr) -> Self {
        Self {
            inner,
            peer: Some(peer),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Received> {
        match tokio::time::timeout(timeout, self.inner.read(buf)).await {
            Ok(Ok(0)) if !buf.is_empty() => Ok(Received::Closed),
            Ok(Ok(n)) => Ok(Received::Data(n)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(Received::Empty),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.flush().await?;
        self.inner.shutdown().await
    }

    fn channel(&self) -> Channel {
        Channel::Stream
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// A connected UDP socket as a [`Connection`]
pub struct DatagramConnection {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl DatagramConnection {
    /// Wrap a socket that is already connected to its peer
    pub fn new(socket: UdpSocket) -> Self {
        let peer = socket.peer_addr().ok();
        Self { socket, peer }
    }
}

#[async_trait]
impl Connection for DatagramConnection {
    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf).await
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Received> {
        match tokio::time::timeout(timeout, self.socket.recv(buf)).await {
            Ok(Ok(n)) => Ok(Received::Data(n)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(Received::Empty),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn channel(&self) -> Channel {
        Channel::Datagram
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Opens connections to an iperf3 server with Tokio sockets
pub struct TcpConnector {
    endpoint: String,
}

impl TcpConnector {
    /// `endpoint` is a `host:port` string, resolved on every open
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    async fn resolve(&self) -> io::Result<SocketAddr> {
        tokio::net::lookup_host(&self.endpoint)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", self.endpoint),
                )
            })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self, channel: Channel) -> io::Result<Box<dyn Connection>> {
        let addr = self.resolve().await?;
        match channel {
            Channel::Stream => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(StreamConnection::with_peer(stream, addr)))
            }
            Channel::Datagram => {
                let local: SocketAddr = if addr.is_ipv4() {
                    "0.0.0.0:0".parse().map_err(invalid_input)?
                } else {
                    "[::]:0".parse().map_err(invalid_input)?
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(addr).await?;
                Ok(Box::new(DatagramConnection::new(socket)))
            }
        }
    }
}

fn invalid_input(e: std::net::AddrParseError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}

/// Accepts iperf3 connections on one port with Tokio sockets
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(endpoint: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(endpoint).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self, channel: Channel) -> io::Result<Box<dyn Connection>> {
        match channel {
            Channel::Stream => {
                let (stream, peer) = self.listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(StreamConnection::with_peer(stream, peer)))
            }
            Channel::Datagram => accept_datagram(self.listener.local_addr()?).await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[cfg(feature = "udp")]
async fn accept_datagram(local: SocketAddr) -> io::Result<Box<dyn Connection>> {
    // UDP data streams share the control port number
    let socket = UdpSocket::bind(local).await?;
    let mut probe = [0u8; 4];
    let (_, peer) = socket.peek_from(&mut probe).await?;
    socket.connect(peer).await?;
    Ok(Box::new(DatagramConnection::new(socket)))
}

#[cfg(not(feature = "udp"))]
async fn accept_datagram(_local: SocketAddr) -> io::Result<Box<dyn Connection>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "built without UDP support",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_receive_states() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = StreamConnection::new(a);
        let mut right = StreamConnection::new(b);
        let mut buf = [0u8; 16];

        assert_eq!(
            right.receive(&mut buf, Duration::ZERO).await.unwrap(),
            Received::Empty
        );

        assert_eq!(left.send(b"hello").await.unwrap(), 5);
        assert_eq!(
            right
                .receive(&mut buf, Duration::from_millis(100))
                .await
                .unwrap(),
            Received::Data(5)
        );
        assert_eq!(&buf[..5], b"hello");

        left.close().await.unwrap();
        assert_eq!(
            right
                .receive(&mut buf, Duration::from_millis(100))
                .await
                .unwrap(),
            Received::Closed
        );
    }

    #[tokio::test]
    async fn test_tcp_connector_and_acceptor() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        let connector = TcpConnector::new(addr.to_string());

        let (client, server) = tokio::join!(
            connector.open(Channel::Stream),
            acceptor.accept(Channel::Stream)
        );
        let mut client = client.unwrap();
        let mut server = server.unwrap();
        assert_eq!(client.channel(), Channel::Stream);
        assert_eq!(client.peer_addr(), Some(addr));

        client.send(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            server.receive(&mut buf, Duration::from_secs(1)).await.unwrap(),
            Received::Data(3)
        );
    }

    #[cfg(feature = "udp")]
    #[tokio::test]
    async fn test_datagram_accept_keeps_first_datagram() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        let connector = TcpConnector::new(addr.to_string());

        let accept = tokio::spawn(async move { acceptor.accept(Channel::Datagram).await });
        let mut client = connector.open(Channel::Datagram).await.unwrap();

        // Keep probing until the server socket is bound; early probes may bounce
        let mut server = loop {
            let _ = client.send(&[9, 9, 9, 9]).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            if accept.is_finished() {
                break accept.await.unwrap().unwrap();
            }
        };

        let mut buf = [0u8; 16];
        assert_eq!(
            server.receive(&mut buf, Duration::from_secs(1)).await.unwrap(),
            Received::Data(4)
        );
        assert_eq!(&buf[..4], &[9, 9, 9, 9]);
        assert_eq!(server.channel(), Channel::Datagram);
    }
}
