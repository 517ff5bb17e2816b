//! Listening sockets for proxy services

use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

use super::stream::NetworkStream;
use crate::config::ListenAddress;
use crate::error::{BrokerError, Result};

/// A bound TCP or Unix-domain listener.
///
/// The Unix socket file is removed when the listener is dropped.
pub enum ServiceListener {
    /// TCP listener
    Tcp(TcpListener),
    /// Unix domain socket listener
    #[cfg(unix)]
    Unix {
        /// Listener
        listener: UnixListener,
        /// Socket file
        path: PathBuf,
    },
}

impl ServiceListener {
    /// Bind `address`.
    ///
    /// A stale socket file left by a previous run is replaced; any other
    /// existing file at the path is an error.
    pub async fn bind(address: &ListenAddress) -> Result<Self> {
        match address {
            ListenAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await.map_err(|e| {
                    BrokerError::Config(format!("cannot listen on {}: {}", addr, e))
                })?;
                Ok(ServiceListener::Tcp(listener))
            }
            #[cfg(unix)]
            ListenAddress::Unix(path) => {
                use std::os::unix::fs::FileTypeExt;

                if let Ok(meta) = std::fs::symlink_metadata(path) {
                    if !meta.file_type().is_socket() {
                        return Err(BrokerError::Config(format!(
                            "cannot listen on {}: path exists and is not a socket",
                            path.display()
                        )));
                    }
                    debug!("Removing stale socket {}", path.display());
                    std::fs::remove_file(path)?;
                }

                let listener = UnixListener::bind(path).map_err(|e| {
                    BrokerError::Config(format!("cannot listen on {}: {}", path.display(), e))
                })?;
                Ok(ServiceListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            ListenAddress::Unix(path) => Err(BrokerError::Config(format!(
                "unix sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }

    /// Accept the next client and describe its peer.
    pub async fn accept(&self) -> io::Result<(NetworkStream, String)> {
        match self {
            ServiceListener::Tcp(listener) => {
                let (socket, peer) = listener.accept().await?;
                if let Err(e) = socket.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
                Ok((NetworkStream::Tcp(socket), peer.to_string()))
            }
            #[cfg(unix)]
            ServiceListener::Unix { listener, path } => {
                let (socket, _) = listener.accept().await?;
                Ok((NetworkStream::Unix(socket), format!("unix:{}", path.display())))
            }
        }
    }

    /// Bound TCP address, `None` for Unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ServiceListener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            ServiceListener::Unix { .. } => None,
        }
    }
}

impl Drop for ServiceListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let ServiceListener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(path.as_path()) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove socket {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl std::fmt::Debug for ServiceListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceListener::Tcp(listener) => f
                .debug_tuple("Tcp")
                .field(&listener.local_addr().ok())
                .finish(),
            #[cfg(unix)]
            ServiceListener::Unix { path, .. } => f.debug_tuple("Unix").field(path).finish(),
        }
    }
}
