//! Connection-per-message TCP transport and the inbound listener.
//!
//! Wire format: one UTF-8 JSON envelope per line. The client connects, writes
//! its line, reads exactly one reply line and closes. The server reads one
//! line per accepted connection, lets the handler decide on a reply, writes
//! it and closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use node_proto::{decode_line, encode_line, Envelope, MAX_LINE_BYTES};
use parking_lot::Mutex;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{MeshError, Result};
use crate::membership::Node;
use crate::transport::{Transport, TransportError};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials the target for every request; nothing is pooled.
pub struct TcpTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_IO_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn request(
        &self,
        target: &Node,
        envelope: &Envelope,
    ) -> std::result::Result<Envelope, TransportError> {
        let addr = target.address();
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((target.ip.as_str(), target.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.connect_timeout))?
        .map_err(|source| TransportError::Connect {
            addr: addr.clone(),
            source,
        })?;

        let (reader, mut writer) = stream.into_split();
        with_timeout(self.io_timeout, write_envelope(&mut writer, envelope)).await?;
        let reply = with_timeout(self.io_timeout, read_envelope(reader)).await?;
        writer.shutdown().await.ok();
        debug!(peer = %addr, action = %reply.action, "reply received");
        Ok(reply)
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = std::result::Result<T, TransportError>>,
) -> std::result::Result<T, TransportError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TransportError::Timeout(limit))?
}

/// Decides what to do with one inbound envelope; `None` means no reply.
#[async_trait::async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope, peer: SocketAddr) -> Option<Envelope>;
}

type LiveHandlers = Arc<Mutex<HashMap<u64, AbortHandle>>>;

/// Listener that accepts connections and runs one short-lived handler task per connection.
pub struct MeshServer {
    listener: TcpListener,
    io_timeout: Duration,
    live: LiveHandlers,
    next_id: AtomicU64,
}

impl MeshServer {
    /// Bind the listening socket. Failing here is fatal for the node.
    pub async fn bind(addr: &str, port: u16, io_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind((addr, port))
            .await
            .map_err(|source| MeshError::Bind {
                addr: format!("{addr}:{port}"),
                source,
            })?;
        debug!("MeshServer listening on {addr}:{port}");
        Ok(Self {
            listener,
            io_timeout,
            live: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .map_err(|source| MeshError::Bind {
                addr: "listener".into(),
                source,
            })
    }

    /// Accept until `shutdown` flips to true, then abort every handler still
    /// in flight. The listener closes once the last `Arc` is dropped.
    pub async fn serve(
        self: Arc<Self>,
        handler: Arc<dyn EnvelopeHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer_addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let live = self.live.clone();
            let handler = handler.clone();
            let io_timeout = self.io_timeout;

            // The map lock is held across spawn so the task cannot deregister
            // before it has been registered.
            {
                let mut guard = self.live.lock();
                let task = tokio::spawn(async move {
                    handle_connection(stream, peer_addr, handler, io_timeout).await;
                    live.lock().remove(&id);
                });
                guard.insert(id, task.abort_handle());
            }
        }

        let in_flight: Vec<AbortHandle> = self.live.lock().drain().map(|(_, h)| h).collect();
        if !in_flight.is_empty() {
            info!("aborting {} in-flight inbound handlers", in_flight.len());
        }
        for handle in in_flight {
            handle.abort();
        }
    }

    /// Inbound connections currently being handled.
    pub fn live_handlers(&self) -> usize {
        self.live.lock().len()
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<dyn EnvelopeHandler>,
    io_timeout: Duration,
) {
    let (reader, mut writer) = stream.into_split();
    let envelope = match with_timeout(io_timeout, read_envelope(reader)).await {
        Ok(env) => env,
        Err(e) => {
            warn!("failed to read envelope from {peer_addr}: {e}");
            return;
        }
    };
    debug!(
        "received envelope from {peer_addr}: {} {} -> {}",
        envelope.action, envelope.from, envelope.to
    );

    if let Some(reply) = handler.handle(envelope, peer_addr).await {
        if let Err(e) = with_timeout(io_timeout, write_envelope(&mut writer, &reply)).await {
            warn!("failed to write reply to {peer_addr}: {e}");
        }
    }
    let _ = writer.shutdown().await;
}

pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    env: &Envelope,
) -> std::result::Result<(), TransportError> {
    let line = encode_line(env)?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(TransportError::Write)?;
    writer.flush().await.map_err(TransportError::Write)?;
    Ok(())
}

pub async fn read_envelope<R: AsyncRead + Unpin>(
    reader: R,
) -> std::result::Result<Envelope, TransportError> {
    let mut line = String::new();
    let mut limited = BufReader::new(reader.take(MAX_LINE_BYTES));
    let n = limited
        .read_line(&mut line)
        .await
        .map_err(TransportError::Read)?;
    if n == 0 {
        return Err(TransportError::Closed);
    }
    Ok(decode_line(&line)?)
}
