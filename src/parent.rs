//! Node-level collaborator of the transport engine.
//!
//! The engine never looks up global state: every dispatch call receives a
//! [`DispatchContext`] naming the connection the message arrived on.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::protocol::{Message, NodeId};
use crate::transport::StreamTransport;

/// Connection a message arrived on.
#[derive(Clone)]
pub struct DispatchContext {
    pub connection_id: u64,
    pub local_endpoint: u32,
    pub remote_endpoint: u32,
    pub remote_node_id: NodeId,
    pub secure: bool,
    /// Handle for replying on the same connection.
    pub connection: StreamTransport,
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("connection_id", &self.connection_id)
            .field("local_endpoint", &self.local_endpoint)
            .field("remote_endpoint", &self.remote_endpoint)
            .field("remote_node_id", &self.remote_node_id)
            .field("secure", &self.secure)
            .finish()
    }
}

/// Node registry the engine reports to.
#[async_trait]
pub trait TransportParent: Send + Sync + 'static {
    /// Identity of the local node.
    fn node_id(&self) -> NodeId;

    fn node_name(&self) -> String;

    /// A fully decoded session message. Entries are in encoded order.
    async fn message_received(&self, message: Message, ctx: DispatchContext) -> Result<()>;

    /// Pre-session interception point. Returning a message sends it as the
    /// reply and skips normal dispatch.
    async fn special_request(
        &self,
        _message: &Message,
        _ctx: &DispatchContext,
    ) -> Result<Option<Message>> {
        Ok(None)
    }

    /// Session layer confirmed endpoint ids for this connection.
    fn register_endpoint(&self, _local_endpoint: u32, _connection: StreamTransport) {}

    fn unregister_endpoint(&self, _local_endpoint: u32) {}

    /// A new connection started.
    fn add_connection(&self, _connection: StreamTransport) {}

    /// First step of teardown.
    fn remove_connection(&self, _connection_id: u64) {}
}

/// Connection table keyed by connection id and local endpoint.
///
/// Parents embed one to implement the registration callbacks.
#[derive(Default)]
pub struct ConnectionTable {
    inner: Mutex<TableInner>,
}

#[derive(Default)]
struct TableInner {
    connections: HashMap<u64, StreamTransport>,
    endpoints: HashMap<u32, u64>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: StreamTransport) {
        self.inner
            .lock()
            .connections
            .insert(connection.connection_id(), connection);
    }

    pub fn remove(&self, connection_id: u64) -> Option<StreamTransport> {
        let mut inner = self.inner.lock();
        inner.endpoints.retain(|_, id| *id != connection_id);
        inner.connections.remove(&connection_id)
    }

    pub fn bind_endpoint(&self, local_endpoint: u32, connection: &StreamTransport) {
        self.inner
            .lock()
            .endpoints
            .insert(local_endpoint, connection.connection_id());
    }

    pub fn unbind_endpoint(&self, local_endpoint: u32) {
        self.inner.lock().endpoints.remove(&local_endpoint);
    }

    pub fn get(&self, connection_id: u64) -> Option<StreamTransport> {
        self.inner.lock().connections.get(&connection_id).cloned()
    }

    pub fn by_endpoint(&self, local_endpoint: u32) -> Option<StreamTransport> {
        let inner = self.inner.lock();
        let id = inner.endpoints.get(&local_endpoint)?;
        inner.connections.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every connection in the table.
    pub fn close_all(&self) {
        let connections: Vec<_> = self.inner.lock().connections.values().cloned().collect();
        for connection in connections {
            connection.close();
        }
    }
}
