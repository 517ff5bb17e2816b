//! Duplex streaming between an authenticated client and backend
//!
//! Bytes are copied unmodified in both directions by two tasks. Whichever
//! direction finishes first (EOF or error) ends the session: the other task
//! is aborted and both connections are closed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;

/// Default copy buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the client to the backend
    ClientToBackend,
    /// From the backend to the client
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client->backend"),
            Direction::BackendToClient => f.write_str("backend->client"),
        }
    }
}

/// Callback observing every chunk after it has been forwarded.
pub type StreamTap = Arc<dyn Fn(Direction, &[u8]) + Send + Sync>;

/// Bytes moved in each direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    /// Bytes forwarded client to backend
    pub client_to_backend: u64,
    /// Bytes forwarded backend to client
    pub backend_to_client: u64,
}

/// Copies bytes between two established connections.
#[derive(Clone)]
pub struct DuplexStreamer {
    tap: Option<StreamTap>,
    buffer_size: usize,
}

impl Default for DuplexStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplexStreamer {
    /// Streamer without a tap.
    pub fn new() -> Self {
        Self {
            tap: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Observe every forwarded chunk.
    pub fn with_tap(mut self, tap: StreamTap) -> Self {
        self.tap = Some(tap);
        self
    }

    /// Copy buffer size per direction.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Stream until either direction ends or `shutdown` fires.
    ///
    /// Both connections are closed when this returns.
    pub async fn stream<C, B>(
        &self,
        client: C,
        backend: B,
        shutdown: Option<broadcast::Receiver<()>>,
    ) -> StreamSummary
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = split(client);
        let (backend_read, backend_write) = split(backend);

        let upstream_bytes = Arc::new(AtomicU64::new(0));
        let downstream_bytes = Arc::new(AtomicU64::new(0));

        let mut upstream = tokio::spawn(copy_direction(
            client_read,
            backend_write,
            Direction::ClientToBackend,
            self.tap.clone(),
            Arc::clone(&upstream_bytes),
            self.buffer_size,
        ));
        let mut downstream = tokio::spawn(copy_direction(
            backend_read,
            client_write,
            Direction::BackendToClient,
            self.tap.clone(),
            Arc::clone(&downstream_bytes),
            self.buffer_size,
        ));

        let shutdown = async move {
            match shutdown {
                Some(mut rx) => {
                    let _ = rx.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = &mut upstream => {
                debug!("{} finished: {:?}", Direction::ClientToBackend, result);
            }
            result = &mut downstream => {
                debug!("{} finished: {:?}", Direction::BackendToClient, result);
            }
            _ = shutdown => {
                debug!("Stream aborted by shutdown");
            }
        }

        // Dropping both halves of each connection closes it.
        upstream.abort();
        downstream.abort();
        let _ = upstream.await;
        let _ = downstream.await;

        StreamSummary {
            client_to_backend: upstream_bytes.load(Ordering::Relaxed),
            backend_to_client: downstream_bytes.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for DuplexStreamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexStreamer")
            .field("tap", &self.tap.is_some())
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    tap: Option<StreamTap>,
    transferred: Arc<AtomicU64>,
    buffer_size: usize,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            trace!("{}: EOF", direction);
            let _ = writer.shutdown().await;
            return Ok(());
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        transferred.fetch_add(n as u64, Ordering::Relaxed);
        trace!("{}: {} bytes", direction, n);

        if let Some(tap) = &tap {
            tap(direction, &buf[..n]);
        }
    }
}
