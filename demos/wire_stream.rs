//! Wire Stream - high-rate wire packets over an in-memory stream.
//!
//! This example demonstrates:
//! - Running both ends of a connection over `tokio::io::duplex`
//! - Many concurrent senders sharing one connection
//! - Queued wire packets for the same member being superseded by newer values
//!
//! # Running
//!
//! ```text
//! RUST_LOG=raconteur_transport=trace cargo run --example wire_stream
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raconteur_transport::{
    ConnectionBuilder, DispatchContext, Message, MessageElement, MessageEntry, MessageEntryType,
    NodeId, Result, TransportParent,
};

const SENDERS: usize = 8;
const PACKETS_PER_SENDER: usize = 500;

struct Sink {
    id: NodeId,
    received: AtomicUsize,
    last_value: AtomicUsize,
}

#[async_trait]
impl TransportParent for Sink {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn node_name(&self) -> String {
        "sink".into()
    }

    async fn message_received(&self, message: Message, _ctx: DispatchContext) -> Result<()> {
        for entry in &message.entries {
            if entry.entry_type == MessageEntryType::WIRE_PACKET {
                self.received.fetch_add(1, Ordering::Relaxed);
                if let Some(v) = entry
                    .find_element("value")
                    .and_then(MessageElement::as_u32_slice)
                    .and_then(|v| v.first())
                {
                    self.last_value.fetch_max(*v as usize, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

struct Source {
    id: NodeId,
}

#[async_trait]
impl TransportParent for Source {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn node_name(&self) -> String {
        "source".into()
    }

    async fn message_received(&self, _message: Message, _ctx: DispatchContext) -> Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let sink = Arc::new(Sink {
        id: NodeId::new_random(),
        received: AtomicUsize::new(0),
        last_value: AtomicUsize::new(0),
    });
    let (a, b) = tokio::io::duplex(16 * 1024);
    let server = ConnectionBuilder::new(sink.clone()).accept(b)?;
    let client = ConnectionBuilder::new(Arc::new(Source {
        id: NodeId::new_random(),
    }))
    .connect(a)
    .await?;

    let mut tasks = Vec::new();
    for sender in 0..SENDERS {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..PACKETS_PER_SENDER {
                let value = (sender * PACKETS_PER_SENDER + i) as u32;
                let entry = MessageEntry::new(MessageEntryType::WIRE_PACKET, "position")
                    .with_service_path("robot")
                    .with_element(MessageElement::u32("value", value));
                client
                    .send_message(Message::with_entry(client.peer_header(), entry))
                    .await?;
            }
            Ok::<_, raconteur_transport::TransportError>(())
        }));
    }
    for task in tasks {
        task.await??;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = SENDERS * PACKETS_PER_SENDER;
    let received = sink.received.load(Ordering::Relaxed);
    info!(
        sent,
        received,
        superseded = sent - received,
        highest = sink.last_value.load(Ordering::Relaxed),
        "Wire stream finished"
    );

    client.close();
    server.closed().await;
    Ok(())
}
