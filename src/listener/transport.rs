//! Byte-stream transports that can be throttled
//!
//! [`Acceptor`] is the accept side, [`Transport`] the accepted stream. Keep-alive
//! is optional: transports that cannot configure it keep the default
//! implementation, which reports [`io::ErrorKind::Unsupported`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};

/// Accept side of a transport
pub trait Acceptor: Send + Sync {
    type Stream: Transport;

    /// Wait for the next inbound connection
    fn accept(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// An accepted byte stream
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {
    /// Remote address, when the transport has one
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Enable TCP keep-alive with the given period
    fn set_keepalive(&self, interval: Duration) -> io::Result<()> {
        let _ = interval;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport does not support keep-alive",
        ))
    }
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<TcpStream> {
        let (stream, _) = TcpListener::accept(self).await?;
        Ok(stream)
    }
}

impl Transport for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn set_keepalive(&self, interval: Duration) -> io::Result<()> {
        let keepalive = TcpKeepalive::new().with_time(interval);
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", windows))]
        let keepalive = keepalive.with_interval(interval);
        SockRef::from(self).set_tcp_keepalive(&keepalive)
    }
}

#[cfg(unix)]
impl Acceptor for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;

    async fn accept(&self) -> io::Result<tokio::net::UnixStream> {
        let (stream, _) = tokio::net::UnixListener::accept(self).await?;
        Ok(stream)
    }
}

#[cfg(unix)]
impl Transport for tokio::net::UnixStream {}

impl Transport for DuplexStream {}
