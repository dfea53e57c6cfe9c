//! Transports move [`Message`]s between node addresses.
//!
//! Addresses carry a scheme naming the transport that can reach them:
//! `mem://name` for the in-process [`MemoryNetwork`], `tcp://host:port` for
//! [`TcpTransport`](super::tcp::TcpTransport). A transport refuses
//! destinations with a scheme other than its own.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::messaging::envelope::Message;

/// Invoked for every message arriving at a transport.
pub type ReceiveCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// A message transport bound to one local address.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Full local address, including the scheme.
    fn address(&self) -> &str;

    /// Scheme handled by this transport, such as `"tcp"`.
    fn protocol(&self) -> &'static str;

    /// Set the receiver for incoming messages, replacing any earlier one.
    fn register_callback(&self, callback: ReceiveCallback) -> Result<(), TransportError>;

    async fn transport_message(&self, message: &Message, destination: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Scheme part of `address`, if it has one.
#[must_use]
pub fn scheme_of(address: &str) -> Option<&str> {
    address.split_once("://").map(|(scheme, _)| scheme)
}

/// Fail unless `destination` uses the transport's scheme.
pub fn check_scheme(transport: &dyn Transport, destination: &str) -> Result<(), TransportError> {
    if scheme_of(destination) == Some(transport.protocol()) {
        Ok(())
    } else {
        Err(TransportError::UnknownScheme(destination.to_owned()))
    }
}

/// An in-process network connecting [`MemoryTransport`]s by name.
///
/// Destinations can be blocked to simulate a lost link: messages sent to a
/// blocked address are dropped without error.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<String, ReceiveCallback>>,
    blocked: RwLock<HashSet<String>>,
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("blocked", &self.blocked)
            .finish_non_exhaustive()
    }
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport at `mem://{name}` on this network.
    #[must_use]
    pub fn transport(self: &Arc<Self>, name: &str) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            address: format!("mem://{name}"),
            network: Arc::clone(self),
        })
    }

    /// Drop (or stop dropping) everything sent to `address`.
    pub fn set_blocked(&self, address: &str, blocked: bool) -> Result<(), TransportError> {
        let mut set = self.blocked.write().map_err(|_| TransportError::LockPoisoned)?;
        if blocked {
            set.insert(address.to_owned());
        } else {
            set.remove(address);
        }
        Ok(())
    }

    fn deliver(&self, message: &Message, destination: &str) -> Result<(), TransportError> {
        if self
            .blocked
            .read()
            .map_err(|_| TransportError::LockPoisoned)?
            .contains(destination)
        {
            tracing::debug!(destination, name = %message.message_name, "dropping message to blocked address");
            return Ok(());
        }

        let callback = self
            .endpoints
            .read()
            .map_err(|_| TransportError::LockPoisoned)?
            .get(destination)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(destination.to_owned()))?;

        // Go through the wire format so both ends agree on it.
        let wire = message.to_json()?;
        callback(Message::from_json(&wire)?);
        Ok(())
    }
}

/// One endpoint of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    address: String,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn protocol(&self) -> &'static str {
        "mem"
    }

    fn register_callback(&self, callback: ReceiveCallback) -> Result<(), TransportError> {
        self.network
            .endpoints
            .write()
            .map_err(|_| TransportError::LockPoisoned)?
            .insert(self.address.clone(), callback);
        Ok(())
    }

    async fn transport_message(&self, message: &Message, destination: &str) -> Result<(), TransportError> {
        check_scheme(self, destination)?;
        self.network.deliver(message, destination)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.network
            .endpoints
            .write()
            .map_err(|_| TransportError::LockPoisoned)?
            .remove(&self.address);
        Ok(())
    }
}

/// Errors returned by transports.
#[derive(Debug)]
pub enum TransportError {
    /// The destination's scheme is not handled by this transport.
    UnknownScheme(String),
    /// Nothing is listening at the destination.
    Unreachable(String),
    /// A frame failed its checksum.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// A frame exceeds the size limit.
    FrameTooLarge(usize),
    /// The message could not be encoded or decoded.
    Codec(serde_json::Error),
    Io(std::io::Error),
    /// An internal lock was poisoned.
    LockPoisoned,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownScheme(address) => write!(f, "no transport for address: {address}"),
            Self::Unreachable(address) => write!(f, "address unreachable: {address}"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            ),
            Self::FrameTooLarge(len) => write!(f, "frame of {len} bytes is too large"),
            Self::Codec(e) => write!(f, "message codec error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::LockPoisoned => write!(f, "transport lock poisoned"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::envelope::PING_NODE;
    use serde_json::json;
    use std::sync::Mutex;

    fn collecting(transport: &MemoryTransport) -> Arc<Mutex<Vec<Message>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        transport
            .register_callback(Arc::new(move |message| {
                sink.lock().expect("lock").push(message);
            }))
            .expect("register");
        received
    }

    #[test]
    fn test_scheme_of() {
        assert_eq!(scheme_of("tcp://127.0.0.1:3200"), Some("tcp"));
        assert_eq!(scheme_of("mem://a"), Some("mem"));
        assert_eq!(scheme_of("127.0.0.1:3200"), None);
    }

    #[tokio::test]
    async fn test_memory_delivery() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let received = collecting(&b);

        let message = Message::command(PING_NODE, json!({"x": 1}), a.address());
        a.transport_message(&message, "mem://b").await.expect("send");

        let received = received.lock().expect("lock");
        assert_eq!(received.as_slice(), &[message]);
    }

    #[tokio::test]
    async fn test_unknown_scheme_and_unreachable() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let message = Message::command(PING_NODE, json!(null), a.address());

        assert!(matches!(
            a.transport_message(&message, "tcp://127.0.0.1:1").await,
            Err(TransportError::UnknownScheme(_))
        ));
        assert!(matches!(
            a.transport_message(&message, "mem://nobody").await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_blocked_destination_drops_silently() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let received = collecting(&b);
        let message = Message::command(PING_NODE, json!(null), a.address());

        network.set_blocked("mem://b", true).expect("block");
        a.transport_message(&message, "mem://b").await.expect("send");
        assert!(received.lock().expect("lock").is_empty());

        network.set_blocked("mem://b", false).expect("unblock");
        a.transport_message(&message, "mem://b").await.expect("send");
        assert_eq!(received.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_closed_transport_is_unreachable() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let _received = collecting(&b);
        b.close().await.expect("close");

        let message = Message::command(PING_NODE, json!(null), a.address());
        assert!(matches!(
            a.transport_message(&message, "mem://b").await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
