//! TCP transport with checksummed JSON frames.
//!
//! # Frame format
//!
//! ```text
//! [len: u32 LE][payload: len bytes of JSON][crc32(payload): u32 LE]
//! ```
//!
//! Outbound connections are cached per destination and re-dialed once if a
//! write fails. A send owns its connection while writing, so no lock is held
//! across a dial or a write. A frame with a bad checksum closes the connection
//! it came from.
//!
//! Closing a transport stops the accept loop, aborts every inbound reader and
//! drops the receive callback.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use crate::messaging::envelope::Message;
use crate::messaging::transport::{ReceiveCallback, Transport, TransportError, check_scheme};

/// Largest accepted payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// How long a dial may take before the destination counts as unreachable.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const LENGTH_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 4;

/// Serialize `message` into one frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, TransportError> {
    let payload = message.to_json()?.into_bytes();
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_FRAME_SIZE)
        .ok_or(TransportError::FrameTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(LENGTH_SIZE + payload.len() + CHECKSUM_SIZE);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(frame)
}

/// Read one frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>, TransportError> {
    let mut len_bytes = [0u8; LENGTH_SIZE];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = usize::try_from(u32::from_le_bytes(len_bytes)).unwrap_or(usize::MAX);
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let mut checksum = [0u8; CHECKSUM_SIZE];
    reader.read_exact(&mut checksum).await?;

    let expected = u32::from_le_bytes(checksum);
    let actual = crc32fast::hash(&payload);
    if expected != actual {
        return Err(TransportError::ChecksumMismatch { expected, actual });
    }

    let json = std::str::from_utf8(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(Message::from_json(json)?))
}

type SharedCallback = Arc<RwLock<Option<ReceiveCallback>>>;
type Readers = Arc<Mutex<JoinSet<()>>>;

/// A transport listening on a TCP socket.
///
/// # Invariants
///
/// - Each inbound connection has one reader task, owned by `readers`.
/// - A stream in `connections` is idle; a send removes it before writing.
pub struct TcpTransport {
    address: String,
    callback: SharedCallback,
    connections: Mutex<HashMap<String, TcpStream>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    readers: Readers,
    connect_timeout: Duration,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// Bind to `listen_address` (`host:port`) and start accepting peers.
    pub async fn bind(listen_address: &str) -> Result<Arc<Self>, TransportError> {
        Self::bind_with_connect_timeout(listen_address, CONNECT_TIMEOUT).await
    }

    /// Like [`TcpTransport::bind`], giving up on dials after `connect_timeout`.
    pub async fn bind_with_connect_timeout(
        listen_address: &str,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(listen_address).await?;
        let address = format!("tcp://{}", listener.local_addr()?);
        let callback: SharedCallback = Arc::new(RwLock::new(None));
        let readers: Readers = Arc::new(Mutex::new(JoinSet::new()));

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&callback), Arc::clone(&readers)));
        tracing::info!(%address, "tcp transport listening");

        Ok(Arc::new(Self {
            address,
            callback,
            connections: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(Some(accept_task)),
            readers,
            connect_timeout,
        }))
    }

    async fn dial(&self, destination: &str) -> Result<TcpStream, TransportError> {
        let host = destination.trim_start_matches("tcp://");
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(host)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) => return Err(TransportError::Unreachable(destination.to_owned())),
            Err(_) => {
                tracing::debug!(destination, "dial timed out");
                return Err(TransportError::Unreachable(destination.to_owned()));
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn take_connection(&self, destination: &str) -> Result<Option<TcpStream>, TransportError> {
        Ok(self
            .connections
            .lock()
            .map_err(|_| TransportError::LockPoisoned)?
            .remove(destination))
    }

    /// Cache `stream` unless another send already cached one.
    fn return_connection(&self, destination: &str, stream: TcpStream) -> Result<(), TransportError> {
        self.connections
            .lock()
            .map_err(|_| TransportError::LockPoisoned)?
            .entry(destination.to_owned())
            .or_insert(stream);
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, callback: SharedCallback, readers: Readers) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "accepted tcp connection");
                let Ok(mut readers) = readers.lock() else {
                    tracing::error!("tcp reader set poisoned, stopping accept loop");
                    return;
                };
                while readers.try_join_next().is_some() {}
                readers.spawn(read_loop(stream, Arc::clone(&callback)));
            }
            Err(e) => {
                tracing::warn!("tcp accept failed: {e}");
            }
        }
    }
}

async fn read_loop(mut stream: TcpStream, callback: SharedCallback) {
    loop {
        match read_frame(&mut stream).await {
            Ok(Some(message)) => {
                let receiver = callback.read().ok().and_then(|guard| guard.clone());
                match receiver {
                    Some(receiver) => receiver(message),
                    None => tracing::debug!(name = %message.message_name, "no receiver registered, dropping message"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("closing tcp connection: {e}");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn protocol(&self) -> &'static str {
        "tcp"
    }

    fn register_callback(&self, callback: ReceiveCallback) -> Result<(), TransportError> {
        *self.callback.write().map_err(|_| TransportError::LockPoisoned)? = Some(callback);
        Ok(())
    }

    async fn transport_message(&self, message: &Message, destination: &str) -> Result<(), TransportError> {
        check_scheme(self, destination)?;
        let frame = encode_frame(message)?;

        if let Some(mut stream) = self.take_connection(destination)? {
            if stream.write_all(&frame).await.is_ok() {
                return self.return_connection(destination, stream);
            }
            tracing::debug!(destination, "cached connection failed, re-dialing");
        }

        let mut stream = self.dial(destination).await?;
        stream.write_all(&frame).await?;
        self.return_connection(destination, stream)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let task = self
            .accept_task
            .lock()
            .map_err(|_| TransportError::LockPoisoned)?
            .take();
        if let Some(task) = task {
            task.abort();
        }
        let readers = std::mem::take(&mut *self.readers.lock().map_err(|_| TransportError::LockPoisoned)?);
        drop(readers);
        *self.callback.write().map_err(|_| TransportError::LockPoisoned)? = None;
        self.connections
            .lock()
            .map_err(|_| TransportError::LockPoisoned)?
            .clear();
        tracing::info!(address = %self.address, "tcp transport closed");
        Ok(())
    }
}
