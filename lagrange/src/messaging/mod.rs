//! Node-to-node messaging: the wire envelope, transports, and the reliable
//! request/acknowledge layer built on the message group.

pub mod callbacks;
pub mod envelope;
pub mod layer;
pub mod tcp;
pub mod transport;

pub use callbacks::{AckCallback, CallbackRegistry, TypedCallback};
pub use envelope::Message;
pub use layer::{Handler, MessagingError, MessagingLayer};
pub use tcp::TcpTransport;
pub use transport::{MemoryNetwork, MemoryTransport, ReceiveCallback, Transport, TransportError};
