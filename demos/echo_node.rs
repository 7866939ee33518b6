//! Echo Node - request/response over TCP.
//!
//! This example demonstrates:
//! - Implementing a [`TransportParent`] that answers function calls
//! - Accepting connections with [`TcpTransportListener`]
//! - Connecting a client, negotiating capabilities and exchanging messages
//!
//! # Running
//!
//! ```text
//! RUST_LOG=raconteur_transport=debug cargo run --example echo_node [config.json]
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raconteur_transport::protocol::ElementData;
use raconteur_transport::transport::connect_tcp;
use raconteur_transport::{
    ConnectionBuilder, ConnectionTable, DispatchContext, Message, MessageElement, MessageEntry,
    MessageEntryType, NodeId, Result, StreamTransport, TcpTransportListener, TransportConfig,
    TransportParent,
};

/// Node that echoes every function call argument back to the caller.
struct EchoNode {
    id: NodeId,
    connections: ConnectionTable,
}

#[async_trait]
impl TransportParent for EchoNode {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn node_name(&self) -> String {
        "echo".into()
    }

    async fn message_received(&self, message: Message, ctx: DispatchContext) -> Result<()> {
        for entry in &message.entries {
            if entry.entry_type != MessageEntryType::FUNCTION_CALL_REQ {
                continue;
            }
            let mut reply = entry.reply();
            reply.elements = entry.elements.clone();
            let mut header = ctx.connection.peer_header();
            header.receiver_endpoint = message.header.sender_endpoint;
            ctx.connection
                .send_message(Message::with_entry(header, reply))
                .await?;
        }
        Ok(())
    }

    fn add_connection(&self, connection: StreamTransport) {
        self.connections.add(connection);
    }

    fn remove_connection(&self, connection_id: u64) {
        self.connections.remove(connection_id);
    }
}

/// Client side: forwards replies to the main task.
struct CallerNode {
    id: NodeId,
    replies: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl TransportParent for CallerNode {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn node_name(&self) -> String {
        "caller".into()
    }

    async fn message_received(&self, message: Message, _ctx: DispatchContext) -> Result<()> {
        let _ = self.replies.send(message);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => TransportConfig::from_file(path)?,
        None => TransportConfig::default(),
    };

    let echo = Arc::new(EchoNode {
        id: NodeId::new_random(),
        connections: ConnectionTable::new(),
    });
    let listener = TcpTransportListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let server_builder = ConnectionBuilder::new(echo.clone()).config(config.clone());
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { listener.serve(server_builder, shutdown).await }
    });
    info!(%addr, node_id = %echo.id, "Echo node listening");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let caller = Arc::new(CallerNode {
        id: NodeId::new_random(),
        replies: tx,
    });
    let client_builder = ConnectionBuilder::new(caller)
        .config(config)
        .target(echo.id, "echo");
    let connection = connect_tcp(addr, &client_builder).await?;
    info!(dialect = ?connection.dialect(), "Connected");

    for (i, text) in ["hello", "robot", "raconteur"].into_iter().enumerate() {
        let entry = MessageEntry::new(MessageEntryType::FUNCTION_CALL_REQ, "echo")
            .with_service_path("echo")
            .with_request_id(i as u32 + 1)
            .with_element(MessageElement::string("text", text))
            .with_element(MessageElement::new(
                "position",
                ElementData::Double(vec![i as f64, 0.5]),
            ));
        connection
            .send_message(Message::with_entry(connection.peer_header(), entry))
            .await?;
        if let Some(reply) = rx.recv().await {
            let echoed = reply.entries[0]
                .find_element("text")
                .and_then(MessageElement::as_str)
                .unwrap_or_default()
                .to_string();
            info!(request_id = reply.entries[0].request_id, %echoed, "Reply");
        }
    }

    connection.close();
    echo.connections.close_all();
    shutdown.cancel();
    server.await??;
    Ok(())
}
