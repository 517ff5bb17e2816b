//! Network stream abstraction
//!
//! `NetworkStream` covers every transport a connection can ride on:
//! accepted client sockets (TCP or Unix) and backend sockets, which may be
//! upgraded to TLS by a connector.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
pub use tokio_rustls::client::TlsStream as ClientTlsStream;

/// A plain or TLS-wrapped connection.
///
/// The TLS variant is boxed since `TlsStream` is much larger than a socket.
pub enum NetworkStream {
    /// Plain TCP connection
    Tcp(TcpStream),
    /// Unix domain socket connection
    #[cfg(unix)]
    Unix(UnixStream),
    /// TLS connection to a backend
    ClientTls(Box<ClientTlsStream<TcpStream>>),
}

impl NetworkStream {
    /// Check if this stream is TLS-encrypted
    pub fn is_encrypted(&self) -> bool {
        matches!(self, NetworkStream::ClientTls(_))
    }

    /// Negotiated TLS protocol version, if any
    pub fn tls_version(&self) -> Option<&'static str> {
        match self {
            NetworkStream::ClientTls(tls) => tls.get_ref().1.protocol_version().map(|v| match v {
                rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2",
                rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3",
                _ => "TLS (unknown version)",
            }),
            _ => None,
        }
    }

    /// Take the TCP socket out for a TLS upgrade.
    ///
    /// Returns `Err(self)` for anything that is not plain TCP.
    pub fn into_tcp(self) -> Result<TcpStream, Self> {
        match self {
            NetworkStream::Tcp(stream) => Ok(stream),
            other => Err(other),
        }
    }

    /// Peer description for logs.
    pub fn peer(&self) -> String {
        match self {
            NetworkStream::Tcp(stream) => stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:unknown".into()),
            #[cfg(unix)]
            NetworkStream::Unix(_) => "unix".into(),
            NetworkStream::ClientTls(tls) => tls
                .get_ref()
                .0
                .peer_addr()
                .map(|a| format!("{} (tls)", a))
                .unwrap_or_else(|_| "tls:unknown".into()),
        }
    }
}

impl From<TcpStream> for NetworkStream {
    fn from(stream: TcpStream) -> Self {
        NetworkStream::Tcp(stream)
    }
}

#[cfg(unix)]
impl From<UnixStream> for NetworkStream {
    fn from(stream: UnixStream) -> Self {
        NetworkStream::Unix(stream)
    }
}

impl std::fmt::Debug for NetworkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            NetworkStream::Tcp(_) => "Tcp",
            #[cfg(unix)]
            NetworkStream::Unix(_) => "Unix",
            NetworkStream::ClientTls(_) => "ClientTls",
        };
        f.debug_tuple("NetworkStream").field(&kind).finish()
    }
}

impl AsyncRead for NetworkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            NetworkStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetworkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            NetworkStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            NetworkStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            NetworkStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            NetworkStream::ClientTls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_stream_read_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = NetworkStream::from(socket);
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = NetworkStream::from(TcpStream::connect(addr).await.unwrap());
        assert!(!client.is_encrypted());
        assert_eq!(client.tls_version(), None);
        client.write_all(b"hello").await.unwrap();
        let mut echo = [0u8; 5];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");
        server.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_stream_is_not_tcp() {
        let (a, _b) = UnixStream::pair().unwrap();
        let stream = NetworkStream::from(a);
        assert_eq!(stream.peer(), "unix");
        assert!(stream.into_tcp().is_err());
    }
}
