//! Connection builder.
//!
//! The [`ConnectionBuilder`] collects configuration, the node parent and the
//! optional secure channel, then starts the engine over a stream in either
//! role:
//!
//! - [`connect`](ConnectionBuilder::connect): client side. Optional STARTTLS,
//!   then `CreateConnection` with capability negotiation.
//! - [`accept`](ConnectionBuilder::accept): server side. The peer drives the
//!   handshake.
//!
//! # Example
//!
//! ```ignore
//! use raconteur_transport::{ConnectionBuilder, NodeId};
//!
//! let connection = ConnectionBuilder::new(parent)
//!     .max_message_size(4 * 1024 * 1024)
//!     .target(NodeId::ANY, "robot")
//!     .connect(stream)
//!     .await?;
//! println!("connected to {}", connection.remote_node_id());
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::TransportConfig;
use crate::error::Result;
use crate::parent::TransportParent;
use crate::protocol::NodeId;
use crate::secure::{CertificatePolicy, SecureChannel};

use super::connection::{EngineSettings, StreamTransport};
use super::stream::{boxed, TransportStream};

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// Builder for client and server connections.
#[derive(Clone)]
pub struct ConnectionBuilder {
    parent: Arc<dyn TransportParent>,
    config: TransportConfig,
    secure_channel: Option<Arc<dyn SecureChannel>>,
    certificate_policy: Option<Arc<dyn CertificatePolicy>>,
    target_node_id: NodeId,
    target_node_name: String,
    use_tls: bool,
}

impl ConnectionBuilder {
    /// Create a builder with default configuration.
    pub fn new(parent: Arc<dyn TransportParent>) -> Self {
        Self {
            parent,
            config: TransportConfig::default(),
            secure_channel: None,
            certificate_policy: None,
            target_node_id: NodeId::ANY,
            target_node_name: String::new(),
            use_tls: false,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Largest message accepted or produced.
    ///
    /// Default: 12 MiB
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Ping after this long without sending.
    ///
    /// Default: 5 seconds
    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.config.heartbeat_period_ms = millis(period);
        self
    }

    /// Close after this long without receiving anything.
    ///
    /// Default: 15 seconds
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout_ms = millis(timeout);
        self
    }

    /// Close after this long without receiving anything but pings.
    ///
    /// Default: 10 minutes
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.config.inactivity_timeout_ms = millis(timeout);
        self
    }

    /// Timeout for handshake requests and the secure upgrade.
    ///
    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = millis(timeout);
        self
    }

    /// Offer the compact v4 framing during negotiation.
    pub fn enable_message4(mut self, enable: bool) -> Self {
        self.config.enable_message4 = enable;
        self
    }

    /// Refuse everything except STARTTLS until the channel is secure.
    pub fn require_tls(mut self, require: bool) -> Self {
        self.config.require_tls = require;
        self
    }

    /// Secure channel used by STARTTLS in either role.
    pub fn secure_channel(mut self, channel: Arc<dyn SecureChannel>) -> Self {
        self.secure_channel = Some(channel);
        self
    }

    /// Peer certificate verification applied after the secure handshake.
    pub fn certificate_policy(mut self, policy: Arc<dyn CertificatePolicy>) -> Self {
        self.certificate_policy = Some(policy);
        self
    }

    /// Node the client expects to reach. `NodeId::ANY` and an empty name
    /// accept any node.
    pub fn target(mut self, node_id: NodeId, node_name: impl Into<String>) -> Self {
        self.target_node_id = node_id;
        self.target_node_name = node_name.into();
        self
    }

    /// Upgrade to the secure channel before `CreateConnection`.
    pub fn use_tls(mut self, enable: bool) -> Self {
        self.use_tls = enable;
        self
    }

    pub fn transport_config(&self) -> &TransportConfig {
        &self.config
    }

    fn settings(&self, is_client: bool) -> EngineSettings {
        EngineSettings {
            parent: self.parent.clone(),
            config: self.config.clone(),
            secure_channel: self.secure_channel.clone(),
            certificate_policy: self.certificate_policy.clone(),
            is_client,
        }
    }

    /// Start the client side on `stream` and run the handshake.
    ///
    /// On any handshake failure the connection is closed and the error
    /// returned.
    pub async fn connect<S: TransportStream>(&self, stream: S) -> Result<StreamTransport> {
        self.config.validate()?;
        let connection = StreamTransport::start(boxed(stream), self.settings(true));
        if let Err(e) = self.handshake(&connection).await {
            connection.close();
            return Err(e);
        }
        debug!(
            connection_id = connection.connection_id(),
            remote_node_id = %connection.remote_node_id(),
            secure = connection.is_secure(),
            "Client connection ready"
        );
        Ok(connection)
    }

    async fn handshake(&self, connection: &StreamTransport) -> Result<()> {
        if self.use_tls {
            connection.start_tls(self.target_node_id).await?;
        }
        connection
            .create_connection(self.target_node_id, &self.target_node_name)
            .await?;
        Ok(())
    }

    /// Start the server side on an accepted `stream`.
    pub fn accept<S: TransportStream>(&self, stream: S) -> Result<StreamTransport> {
        self.config.validate()?;
        Ok(StreamTransport::start(boxed(stream), self.settings(false)))
    }
}
