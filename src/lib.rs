//! # raconteur-transport
//!
//! Node-to-node stream transport for the RRAC message protocol.
//!
//! This crate runs one framed, bidirectional message connection over any
//! reliable byte stream (TCP, Unix sockets, Named Pipes, or an upgraded
//! secure stream) and hands decoded messages to a node-level parent.
//!
//! ## Architecture
//!
//! - **Wire codec** ([`protocol`]): RRAC v2 and compact v4 framing with
//!   length-scoped readers and writers
//! - **Handshake**: `CreateConnection` with capability negotiation, optional
//!   `STARTTLS` upgrade, identity checks
//! - **Engine** ([`StreamTransport`]): send-turn queue with ping and wire
//!   packet elision, pipelined receive loop, heartbeat and idle timeouts
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use raconteur_transport::{ConnectionBuilder, TcpTransportListener};
//!
//! #[tokio::main]
//! async fn main() -> raconteur_transport::Result<()> {
//!     let builder = ConnectionBuilder::new(Arc::new(MyNode::new()));
//!     let listener = TcpTransportListener::bind("127.0.0.1:48653").await?;
//!     let server = listener.accept(&builder).await?;
//!     server.closed().await;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod capability;
pub mod config;
pub mod error;
pub mod parent;
pub mod protocol;
pub mod secure;
pub mod transport;

mod slot;

pub use capability::{CapabilitySet, NegotiatedDialect};
pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use parent::{ConnectionTable, DispatchContext, TransportParent};
pub use protocol::{Message, MessageElement, MessageEntry, MessageEntryType, MessageHeader, NodeId};
pub use secure::{CertificatePolicy, NodeCertificatePolicy, PeerCertificate, SecureChannel, SecureStream};
pub use transport::{ConnectionBuilder, StreamTransport, TcpTransportListener};
