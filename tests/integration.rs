//! Integration tests for raconteur-transport.
//!
//! Two engines are wired together over an in-memory duplex stream, or one
//! engine is driven by hand-written frames from a raw peer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use raconteur_transport::capability::{
    CAPABILITY_NAME_MESSAGE4_BASIC, MESSAGE2_BASIC_ENABLE, MESSAGE2_BASIC_PAGE,
    MESSAGE4_BASIC_CONNECTCOMBINED, MESSAGE4_BASIC_ENABLE, MESSAGE4_BASIC_PAGE,
};
use raconteur_transport::protocol::{
    peek_frame_prefix, ElementData, MessageErrorType, WireFormat, FRAME_PREFIX_SIZE,
};
use raconteur_transport::secure::{node_subject, CertificateInfo};
use raconteur_transport::transport::{
    BoxedStream, STREAM_OP_CREATE_CONNECTION, STREAM_OP_GET_REMOTE_NODE_ID,
};
use raconteur_transport::{
    ConnectionBuilder, ConnectionTable, DispatchContext, Message, MessageElement, MessageEntry,
    MessageEntryType, NodeCertificatePolicy, NodeId, PeerCertificate, Result, SecureChannel,
    SecureStream, StreamTransport, TransportConfig, TransportError, TransportParent,
};

const ROOT_FINGERPRINT: [u8; 32] = [0x5a; 32];

type Received = mpsc::UnboundedReceiver<(Message, DispatchContext)>;

/// Parent that records every session message it receives.
struct TestNode {
    id: NodeId,
    name: String,
    table: ConnectionTable,
    tx: mpsc::UnboundedSender<(Message, DispatchContext)>,
    gate: Notify,
}

impl TestNode {
    fn new(name: &str) -> (Arc<Self>, Received) {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = Arc::new(Self {
            id: NodeId::new_random(),
            name: name.to_string(),
            table: ConnectionTable::new(),
            tx,
            gate: Notify::new(),
        });
        (node, rx)
    }
}

#[async_trait]
impl TransportParent for TestNode {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn node_name(&self) -> String {
        self.name.clone()
    }

    async fn message_received(&self, message: Message, ctx: DispatchContext) -> Result<()> {
        let member = message
            .entries
            .first()
            .map(|e| e.member_name.clone())
            .unwrap_or_default();
        match member.as_str() {
            "block" => self.gate.notified().await,
            "release" => self.gate.notify_one(),
            _ => {}
        }
        let _ = self.tx.send((message, ctx));
        Ok(())
    }

    fn register_endpoint(&self, local_endpoint: u32, connection: StreamTransport) {
        self.table.bind_endpoint(local_endpoint, &connection);
    }

    fn unregister_endpoint(&self, local_endpoint: u32) {
        self.table.unbind_endpoint(local_endpoint);
    }

    fn add_connection(&self, connection: StreamTransport) {
        self.table.add(connection);
    }

    fn remove_connection(&self, connection_id: u64) {
        self.table.remove(connection_id);
    }
}

/// Secure channel that keeps the raw stream and reports a fixed peer chain.
struct PassThroughChannel {
    presented: Option<PeerCertificate>,
}

#[async_trait]
impl SecureChannel for PassThroughChannel {
    async fn connect(&self, stream: BoxedStream, _remote: NodeId) -> Result<SecureStream> {
        Ok(SecureStream {
            stream,
            peer: self.presented.clone(),
        })
    }

    async fn accept(&self, stream: BoxedStream) -> Result<SecureStream> {
        Ok(SecureStream { stream, peer: None })
    }
}

fn node_chain(node: NodeId) -> PeerCertificate {
    PeerCertificate {
        chain: vec![
            CertificateInfo {
                subject_common_name: node_subject(&node),
                fingerprint: [1; 32],
                policy_oids: Vec::new(),
            },
            CertificateInfo {
                subject_common_name: "Test Root".into(),
                fingerprint: ROOT_FINGERPRINT,
                policy_oids: Vec::new(),
            },
        ],
    }
}

async fn connect_pair(
    client: &ConnectionBuilder,
    server: &ConnectionBuilder,
) -> (StreamTransport, StreamTransport) {
    let (a, b) = duplex(256 * 1024);
    let server = server.accept(b).unwrap();
    let client = client.connect(a).await.unwrap();
    (client, server)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn recv(rx: &mut Received) -> (Message, DispatchContext) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

fn call(header: raconteur_transport::MessageHeader, member: &str) -> Message {
    Message::with_entry(
        header,
        MessageEntry::new(MessageEntryType::FUNCTION_CALL_REQ, member)
            .with_service_path("robot")
            .with_request_id(1)
            .with_element(MessageElement::new(
                "position",
                ElementData::Double(vec![1.0, 2.5, -3.0]),
            )),
    )
}

async fn write_raw(peer: &mut DuplexStream, message: &Message) {
    let bytes = message.encode(WireFormat::V2).unwrap();
    peer.write_all(&bytes).await.unwrap();
}

async fn read_raw(peer: &mut DuplexStream) -> Message {
    let mut frame = vec![0u8; FRAME_PREFIX_SIZE];
    peer.read_exact(&mut frame).await.unwrap();
    let size = peek_frame_prefix(&frame).unwrap().message_size;
    frame.resize(size, 0);
    peer.read_exact(&mut frame[FRAME_PREFIX_SIZE..]).await.unwrap();
    Message::decode(&frame).unwrap()
}

fn raw_request(entry: MessageEntry) -> Message {
    let header = raconteur_transport::MessageHeader {
        sender_node_id: NodeId::new_random(),
        sender_node_name: "raw".into(),
        ..Default::default()
    };
    Message::with_entry(header, entry)
}

/// Builder whose heartbeat never fires during a test.
fn quiet(builder: ConnectionBuilder) -> ConnectionBuilder {
    builder
        .heartbeat_period(Duration::from_secs(3600))
        .receive_timeout(Duration::from_secs(3600))
        .inactivity_timeout(Duration::from_secs(3600))
}

/// Wire packet larger than the test duplex buffer.
fn bulk(header: raconteur_transport::MessageHeader) -> Message {
    Message::with_entry(
        header,
        MessageEntry::new(MessageEntryType::WIRE_PACKET, "image")
            .with_service_path("robot")
            .with_element(MessageElement::new("data", ElementData::UInt8(vec![7; 8192]))),
    )
}

fn remote_code(err: &TransportError) -> Option<u16> {
    match err {
        TransportError::Remote { code, .. } => Some(*code),
        _ => None,
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_negotiates_message4() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let (client, server) = connect_pair(
        &ConnectionBuilder::new(client_node.clone()).target(server_node.id, "server"),
        &ConnectionBuilder::new(server_node.clone()),
    )
    .await;

    assert!(client.is_established());
    eventually(|| server.is_established()).await;

    assert!(client.dialect().message4);
    assert!(server.dialect().message4);
    assert!(!client.dialect().string_table);
    assert_eq!(client.remote_node_id(), server_node.id);
    assert_eq!(client.remote_node_name(), "server");
    assert_eq!(server.remote_node_id(), client_node.id);
    assert_eq!(server.remote_node_name(), "client");
    assert_eq!(client_node.table.len(), 1);
    assert_eq!(server_node.table.len(), 1);
}

#[tokio::test]
async fn test_message2_only_peer_disables_message4() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let (client, server) = connect_pair(
        &ConnectionBuilder::new(client_node).enable_message4(false),
        &ConnectionBuilder::new(server_node),
    )
    .await;

    assert!(!client.dialect().message4);
    eventually(|| server.is_established()).await;
    assert!(!server.dialect().message4);
}

#[tokio::test]
async fn test_wrong_target_node_is_rejected() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let (a, b) = duplex(64 * 1024);
    let _server = ConnectionBuilder::new(server_node).accept(b).unwrap();

    let err = ConnectionBuilder::new(client_node.clone())
        .target(NodeId::new_random(), "")
        .connect(a)
        .await
        .unwrap_err();
    assert_eq!(remote_code(&err), Some(MessageErrorType::NodeNotFound.code()));
    eventually(|| client_node.table.is_empty()).await;
}

#[tokio::test]
async fn test_wrong_target_name_is_rejected() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let (a, b) = duplex(64 * 1024);
    let _server = ConnectionBuilder::new(server_node).accept(b).unwrap();

    let err = ConnectionBuilder::new(client_node)
        .target(NodeId::ANY, "somebody-else")
        .connect(a)
        .await
        .unwrap_err();
    assert_eq!(remote_code(&err), Some(MessageErrorType::NodeNotFound.code()));
}

#[tokio::test]
async fn test_remote_node_id_and_capability_queries() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let (client, _server) = connect_pair(
        &ConnectionBuilder::new(client_node),
        &ConnectionBuilder::new(server_node.clone()),
    )
    .await;

    assert_eq!(client.get_remote_node_id().await.unwrap(), server_node.id);
    assert_eq!(
        client
            .check_capability(CAPABILITY_NAME_MESSAGE4_BASIC)
            .await
            .unwrap(),
        MESSAGE4_BASIC_ENABLE | MESSAGE4_BASIC_CONNECTCOMBINED
    );
    assert_eq!(client.check_capability("com.example.unknown").await.unwrap(), 0);
}

// ============================================================================
// Session traffic
// ============================================================================

#[tokio::test]
async fn test_session_messages_flow_both_ways() {
    let (client_node, mut crx) = TestNode::new("client");
    let (server_node, mut srx) = TestNode::new("server");
    let (client, server) = connect_pair(
        &ConnectionBuilder::new(client_node.clone()),
        &ConnectionBuilder::new(server_node.clone()),
    )
    .await;

    let request = call(client.peer_header(), "move");
    client.send_message(request.clone()).await.unwrap();

    let (got, ctx) = recv(&mut srx).await;
    assert_eq!(got.entries, request.entries);
    assert_eq!(got.header.sender_node_id, client_node.id);
    assert_eq!(got.header.receiver_node_id, server_node.id);
    assert_eq!(ctx.connection_id, server.connection_id());
    assert!(!ctx.secure);

    let reply = Message::with_entry(ctx.connection.peer_header(), got.entries[0].reply());
    ctx.connection.send_message(reply).await.unwrap();
    let (answer, _) = recv(&mut crx).await;
    assert_eq!(answer.entries[0].entry_type, MessageEntryType::FUNCTION_CALL_RES);
    assert_eq!(answer.entries[0].request_id, 1);
    assert_eq!(answer.header.sender_node_id, server_node.id);
}

#[tokio::test]
async fn test_ping_is_answered_and_not_dispatched() {
    let (client_node, mut crx) = TestNode::new("client");
    let (server_node, mut srx) = TestNode::new("server");
    let (client, _server) = connect_pair(
        &ConnectionBuilder::new(client_node),
        &ConnectionBuilder::new(server_node),
    )
    .await;

    let ping = Message::with_entry(
        client.peer_header(),
        MessageEntry::new(MessageEntryType::CONNECTION_TEST, ""),
    );
    client.send_message(ping).await.unwrap();
    client
        .send_message(call(client.peer_header(), "after-ping"))
        .await
        .unwrap();

    let (got, _) = recv(&mut srx).await;
    assert_eq!(got.entries[0].member_name, "after-ping");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(crx.try_recv().is_err());
}

#[tokio::test]
async fn test_dispatch_is_pipelined() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, mut srx) = TestNode::new("server");
    let (client, _server) = connect_pair(
        &ConnectionBuilder::new(client_node),
        &ConnectionBuilder::new(server_node),
    )
    .await;

    // "block" only completes once "release" has been dispatched.
    client.send_message(call(client.peer_header(), "block")).await.unwrap();
    client.send_message(call(client.peer_header(), "release")).await.unwrap();

    let (first, _) = recv(&mut srx).await;
    let (second, _) = recv(&mut srx).await;
    let mut members = vec![
        first.entries[0].member_name.clone(),
        second.entries[0].member_name.clone(),
    ];
    members.sort();
    assert_eq!(members, vec!["block", "release"]);
}

#[tokio::test]
async fn test_oversized_send_fails_without_closing() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, mut srx) = TestNode::new("server");
    let (client, _server) = connect_pair(
        &ConnectionBuilder::new(client_node).max_message_size(4096),
        &ConnectionBuilder::new(server_node),
    )
    .await;

    let big = Message::with_entry(
        client.peer_header(),
        MessageEntry::new(MessageEntryType::WIRE_PACKET, "image")
            .with_element(MessageElement::new("data", ElementData::UInt8(vec![0; 8192]))),
    );
    let err = client.send_message(big).await.unwrap_err();
    assert!(matches!(err, TransportError::MessageTooLarge { .. }));
    assert!(client.is_connected());

    client.send_message(call(client.peer_header(), "small")).await.unwrap();
    let (got, _) = recv(&mut srx).await;
    assert_eq!(got.entries[0].member_name, "small");
}

#[tokio::test]
async fn test_invalid_message_fails_without_closing() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, mut srx) = TestNode::new("server");
    let (client, _server) = connect_pair(
        &ConnectionBuilder::new(client_node),
        &ConnectionBuilder::new(server_node),
    )
    .await;

    let long_member = "m".repeat(70_000);
    let err = client
        .send_message(call(client.peer_header(), &long_member))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)));
    assert!(err.to_string().contains("65535"));
    assert!(client.is_connected());

    client.send_message(call(client.peer_header(), "small")).await.unwrap();
    let (got, _) = recv(&mut srx).await;
    assert_eq!(got.entries[0].member_name, "small");
}

#[tokio::test]
async fn test_queued_pings_and_wire_packets_are_elided() {
    let (node, _rx) = TestNode::new("server");
    let (mut peer, b) = duplex(1024);
    let server = quiet(ConnectionBuilder::new(node)).accept(b).unwrap();
    let header = server.peer_header();

    // Holds the write turn until the peer starts reading.
    let in_flight = tokio::spawn({
        let server = server.clone();
        let message = bulk(header.clone());
        async move { server.send_message(message).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!in_flight.is_finished());

    let ping = || {
        Message::with_entry(
            header.clone(),
            MessageEntry::new(MessageEntryType::CONNECTION_TEST, ""),
        )
    };
    let queued_ping = tokio::spawn({
        let server = server.clone();
        let message = ping();
        async move { server.send_message(message).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    tokio::time::timeout(Duration::from_secs(1), server.send_message(ping()))
        .await
        .expect("duplicate ping should return at once")
        .unwrap();

    let position = |value: u32| {
        Message::with_entry(
            header.clone(),
            MessageEntry::new(MessageEntryType::WIRE_PACKET, "position")
                .with_service_path("robot")
                .with_element(MessageElement::u32("value", value)),
        )
    };
    let older = tokio::spawn({
        let server = server.clone();
        let message = position(1);
        async move { server.send_message(message).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let newer = tokio::spawn({
        let server = server.clone();
        let message = position(2);
        async move { server.send_message(message).await }
    });
    tokio::time::timeout(Duration::from_secs(1), older)
        .await
        .expect("superseded packet should return at once")
        .unwrap()
        .unwrap();
    assert!(!newer.is_finished());

    let marker = tokio::spawn({
        let server = server.clone();
        let message = call(header.clone(), "end");
        async move { server.send_message(message).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut frames = Vec::new();
    loop {
        let message = read_raw(&mut peer).await;
        let last = message.entries[0].member_name == "end";
        frames.push(message);
        if last {
            break;
        }
    }
    for task in [in_flight, queued_ping, newer, marker] {
        task.await.unwrap().unwrap();
    }

    let kinds: Vec<(MessageEntryType, String)> = frames
        .iter()
        .map(|m| (m.entries[0].entry_type, m.entries[0].member_name.clone()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (MessageEntryType::WIRE_PACKET, "image".to_string()),
            (MessageEntryType::CONNECTION_TEST, String::new()),
            (MessageEntryType::WIRE_PACKET, "position".to_string()),
            (MessageEntryType::FUNCTION_CALL_REQ, "end".to_string()),
        ]
    );
    let value = frames[2].entries[0]
        .find_element("value")
        .and_then(MessageElement::as_u32_slice)
        .map(|v| v.to_vec());
    assert_eq!(value, Some(vec![2]));
}

// ============================================================================
// Endpoints
// ============================================================================

#[tokio::test]
async fn test_connect_client_reply_binds_endpoints() {
    let (client_node, mut crx) = TestNode::new("client");
    let (server_node, mut srx) = TestNode::new("server");
    let (client, server) = connect_pair(
        &ConnectionBuilder::new(client_node.clone()),
        &ConnectionBuilder::new(server_node.clone()),
    )
    .await;

    let mut header = client.peer_header();
    header.sender_endpoint = 55;
    let connect = Message::with_entry(
        header,
        MessageEntry::new(MessageEntryType::CONNECT_CLIENT, "").with_service_path("robot"),
    );
    client.send_message(connect).await.unwrap();

    let (request, ctx) = recv(&mut srx).await;
    assert_eq!(request.header.sender_endpoint, 55);
    let mut reply_header = ctx.connection.peer_header();
    reply_header.sender_endpoint = 77;
    reply_header.receiver_endpoint = request.header.sender_endpoint;
    ctx.connection
        .send_message(Message::with_entry(reply_header, request.entries[0].reply()))
        .await
        .unwrap();

    let (_, client_ctx) = recv(&mut crx).await;
    assert_eq!(client_ctx.local_endpoint, 55);
    assert_eq!(client.local_endpoint(), 55);
    assert_eq!(client.remote_endpoint(), 77);
    assert_eq!(server.local_endpoint(), 77);
    assert_eq!(server.remote_endpoint(), 55);
    assert_eq!(
        server_node.table.by_endpoint(77).map(|c| c.connection_id()),
        Some(server.connection_id())
    );

    // Bound routes travel compacted and are restored on receive.
    client.send_message(call(client.peer_header(), "bound")).await.unwrap();
    let (got, ctx) = recv(&mut srx).await;
    assert_eq!(got.header.sender_endpoint, 55);
    assert_eq!(got.header.receiver_endpoint, 77);
    assert_eq!(got.header.sender_node_id, client_node.id);
    assert_eq!(ctx.remote_endpoint, 55);

    client.close();
    eventually(|| server_node.table.by_endpoint(77).is_none()).await;
    assert!(client_node.table.by_endpoint(55).is_none());
}

#[tokio::test]
async fn test_session_message_right_after_connect_reply_is_routed() {
    let (client_node, mut crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let (client, server) = connect_pair(
        &ConnectionBuilder::new(client_node),
        &ConnectionBuilder::new(server_node),
    )
    .await;
    eventually(|| server.is_established()).await;
    assert!(server.dialect().message4);

    let mut reply_header = server.peer_header();
    reply_header.sender_endpoint = 77;
    reply_header.receiver_endpoint = 55;
    server
        .send_message(Message::with_entry(
            reply_header,
            MessageEntry::new(MessageEntryType::CONNECT_CLIENT_RET, "").with_service_path("robot"),
        ))
        .await
        .unwrap();
    // Sent compacted: the server bound 77/55 when the reply went out.
    let after = server.peer_header();
    assert_eq!((after.sender_endpoint, after.receiver_endpoint), (77, 55));
    server.send_message(call(after, "after")).await.unwrap();

    let mut routed = None;
    for _ in 0..2 {
        let (message, ctx) = recv(&mut crx).await;
        if message.entries[0].member_name == "after" {
            routed = Some((message, ctx));
        }
    }
    let (message, ctx) = routed.expect("session message not delivered");
    assert_eq!(message.header.sender_endpoint, 77);
    assert_eq!(message.header.receiver_endpoint, 55);
    assert_eq!(ctx.local_endpoint, 55);
    assert_eq!(client.local_endpoint(), 55);
    assert_eq!(client.remote_endpoint(), 77);
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_close_propagates_to_peer() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let (client, server) = connect_pair(
        &ConnectionBuilder::new(client_node.clone()),
        &ConnectionBuilder::new(server_node.clone()),
    )
    .await;

    client.close();
    client.close();
    assert!(!client.is_connected());
    tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .unwrap();
    assert!(!server.is_connected());
    assert!(client_node.table.is_empty());
    eventually(|| server_node.table.is_empty()).await;

    let err = client
        .send_message(call(client.peer_header(), "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionClosed));
    assert!(matches!(
        client.get_remote_node_id().await,
        Err(TransportError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_close_fails_every_outstanding_waiter_once() {
    let (node, _rx) = TestNode::new("server");
    let (peer, b) = duplex(1024);
    let server = quiet(ConnectionBuilder::new(node.clone())).accept(b).unwrap();

    let node_query = tokio::spawn({
        let server = server.clone();
        async move { server.get_remote_node_id().await.map(|_| ()) }
    });
    let capability_query = tokio::spawn({
        let server = server.clone();
        async move { server.check_capability(CAPABILITY_NAME_MESSAGE4_BASIC).await.map(|_| ()) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let in_flight = tokio::spawn({
        let server = server.clone();
        let message = bulk(server.peer_header());
        async move { server.send_message(message).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let queued = tokio::spawn({
        let server = server.clone();
        let message = call(server.peer_header(), "queued");
        async move { server.send_message(message).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    for task in [&node_query, &capability_query, &in_flight, &queued] {
        assert!(!task.is_finished());
    }

    // Caller close races the receive loop seeing end of stream.
    server.close();
    drop(peer);
    server.close();

    for task in [node_query, capability_query, in_flight, queued] {
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("waiter not released")
            .unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }
    assert!(!server.is_connected());
    eventually(|| node.table.is_empty()).await;
}

#[tokio::test]
async fn test_connection_table_close_all() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let (client, server) = connect_pair(
        &ConnectionBuilder::new(client_node.clone()),
        &ConnectionBuilder::new(server_node),
    )
    .await;

    client_node.table.close_all();
    assert!(!client.is_connected());
    tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .unwrap();
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_receive_timeout_closes_silent_peer() {
    let (server_node, _srx) = TestNode::new("server");
    let (mut raw, b) = duplex(64 * 1024);
    let start = Instant::now();
    let server = ConnectionBuilder::new(server_node).accept(b).unwrap();

    tokio::time::timeout(Duration::from_secs(60), server.closed())
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_secs(15));

    // The silent peer was pinged while the connection was alive.
    let mut bytes = Vec::new();
    raw.read_to_end(&mut bytes).await.unwrap();
    let mut pings = 0;
    let mut offset = 0;
    while offset < bytes.len() {
        let size = peek_frame_prefix(&bytes[offset..]).unwrap().message_size;
        let message = Message::decode(&bytes[offset..offset + size]).unwrap();
        if message.entries[0].entry_type == MessageEntryType::CONNECTION_TEST {
            pings += 1;
        }
        offset += size;
    }
    assert!(pings >= 2, "expected at least two pings, saw {}", pings);
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_timeout_with_only_pings() {
    let config = TransportConfig {
        heartbeat_period_ms: 1_000,
        heartbeat_tick_ms: 100,
        receive_timeout_ms: 3_000,
        inactivity_timeout_ms: 5_000,
        ..Default::default()
    };
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let start = Instant::now();
    let (client, server) = connect_pair(
        &ConnectionBuilder::new(client_node).config(config.clone()),
        &ConnectionBuilder::new(server_node).config(config),
    )
    .await;

    tokio::time::timeout(Duration::from_secs(60), client.closed())
        .await
        .unwrap();
    // Pings kept the receive timeout (3s) from firing.
    assert!(start.elapsed() >= Duration::from_secs(5));
    tokio::time::timeout(Duration::from_secs(60), server.closed())
        .await
        .unwrap();
}

// ============================================================================
// Secure upgrade
// ============================================================================

#[tokio::test]
async fn test_starttls_upgrade_then_session() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, mut srx) = TestNode::new("server");
    let client_builder = ConnectionBuilder::new(client_node)
        .secure_channel(Arc::new(PassThroughChannel {
            presented: Some(node_chain(server_node.id)),
        }))
        .certificate_policy(Arc::new(NodeCertificatePolicy::new([ROOT_FINGERPRINT])))
        .target(server_node.id, "")
        .use_tls(true);
    let server_builder = ConnectionBuilder::new(server_node.clone())
        .secure_channel(Arc::new(PassThroughChannel { presented: None }))
        .require_tls(true);

    let (client, server) = connect_pair(&client_builder, &server_builder).await;
    assert!(client.is_secure());
    assert!(client.is_established());
    eventually(|| server.is_secure() && server.is_established()).await;

    client.send_message(call(client.peer_header(), "secured")).await.unwrap();
    let (got, ctx) = recv(&mut srx).await;
    assert_eq!(got.entries[0].member_name, "secured");
    assert!(ctx.secure);
}

#[tokio::test]
async fn test_starttls_rejects_certificate_for_other_node() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let (a, b) = duplex(64 * 1024);
    let _server = ConnectionBuilder::new(server_node.clone())
        .secure_channel(Arc::new(PassThroughChannel { presented: None }))
        .accept(b)
        .unwrap();

    let err = ConnectionBuilder::new(client_node)
        .secure_channel(Arc::new(PassThroughChannel {
            presented: Some(node_chain(NodeId::new_random())),
        }))
        .certificate_policy(Arc::new(NodeCertificatePolicy::new([ROOT_FINGERPRINT])))
        .target(server_node.id, "")
        .use_tls(true)
        .connect(a)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::IdentityMismatch(_)), "{:?}", err);
}

#[tokio::test]
async fn test_starttls_without_server_channel_fails() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let (a, b) = duplex(64 * 1024);
    let _server = ConnectionBuilder::new(server_node).accept(b).unwrap();

    let err = ConnectionBuilder::new(client_node)
        .secure_channel(Arc::new(PassThroughChannel { presented: None }))
        .use_tls(true)
        .connect(a)
        .await
        .unwrap_err();
    assert_eq!(remote_code(&err), Some(MessageErrorType::ProtocolError.code()));
}

#[tokio::test]
async fn test_require_tls_refuses_plain_handshake() {
    let (client_node, _crx) = TestNode::new("client");
    let (server_node, _srx) = TestNode::new("server");
    let (a, b) = duplex(64 * 1024);
    let _server = ConnectionBuilder::new(server_node)
        .require_tls(true)
        .accept(b)
        .unwrap();

    let err = ConnectionBuilder::new(client_node)
        .connect(a)
        .await
        .unwrap_err();
    assert_eq!(remote_code(&err), Some(MessageErrorType::ConnectionError.code()));
}

// ============================================================================
// Raw peer
// ============================================================================

#[tokio::test]
async fn test_raw_get_remote_node_id() {
    let (server_node, _srx) = TestNode::new("server");
    let (mut raw, b) = duplex(64 * 1024);
    let _server = ConnectionBuilder::new(server_node.clone()).accept(b).unwrap();

    let request = MessageEntry::new(MessageEntryType::STREAM_OP, STREAM_OP_GET_REMOTE_NODE_ID)
        .with_request_id(9);
    write_raw(&mut raw, &raw_request(request)).await;
    let reply = read_raw(&mut raw).await;

    let entry = &reply.entries[0];
    assert_eq!(entry.entry_type, MessageEntryType::STREAM_OP_RET);
    assert_eq!(entry.request_id, 9);
    assert_eq!(entry.error, MessageErrorType::None);
    assert_eq!(reply.header.sender_node_id, server_node.id);
    assert_eq!(reply.header.sender_node_name, "server");
}

#[tokio::test]
async fn test_raw_unknown_stream_op_keeps_connection() {
    let (server_node, _srx) = TestNode::new("server");
    let (mut raw, b) = duplex(64 * 1024);
    let server = ConnectionBuilder::new(server_node).accept(b).unwrap();

    let bogus = MessageEntry::new(MessageEntryType::STREAM_OP, "Bogus").with_request_id(1);
    write_raw(&mut raw, &raw_request(bogus)).await;
    let reply = read_raw(&mut raw).await;
    assert_eq!(reply.entries[0].error, MessageErrorType::ProtocolError);

    let again = MessageEntry::new(MessageEntryType::STREAM_OP, STREAM_OP_GET_REMOTE_NODE_ID)
        .with_request_id(2);
    write_raw(&mut raw, &raw_request(again)).await;
    let reply = read_raw(&mut raw).await;
    assert_eq!(reply.entries[0].error, MessageErrorType::None);
    assert!(server.is_connected());
}

#[tokio::test]
async fn test_raw_handshake_without_capabilities_uses_message2() {
    let (server_node, _srx) = TestNode::new("server");
    let (mut raw, b) = duplex(64 * 1024);
    let server = ConnectionBuilder::new(server_node).accept(b).unwrap();

    let create = MessageEntry::new(MessageEntryType::STREAM_OP, STREAM_OP_CREATE_CONNECTION)
        .with_request_id(1);
    write_raw(&mut raw, &raw_request(create)).await;
    let reply = read_raw(&mut raw).await;

    let entry = &reply.entries[0];
    assert_eq!(entry.error, MessageErrorType::None);
    assert_eq!(
        entry.find_element("capabilities").and_then(|e| e.as_u32_slice()),
        Some(&[MESSAGE2_BASIC_PAGE | MESSAGE2_BASIC_ENABLE][..])
    );
    eventually(|| server.is_established()).await;
    assert!(!server.dialect().message4);
}

#[tokio::test]
async fn test_raw_handshake_without_message2_closes() {
    let (server_node, _srx) = TestNode::new("server");
    let (mut raw, b) = duplex(64 * 1024);
    let server = ConnectionBuilder::new(server_node).accept(b).unwrap();

    let create = MessageEntry::new(MessageEntryType::STREAM_OP, STREAM_OP_CREATE_CONNECTION)
        .with_request_id(1)
        .with_element(MessageElement::new(
            "capabilities",
            ElementData::UInt32(vec![MESSAGE4_BASIC_PAGE | MESSAGE4_BASIC_ENABLE]),
        ));
    write_raw(&mut raw, &raw_request(create)).await;
    let reply = read_raw(&mut raw).await;
    assert_eq!(reply.entries[0].error, MessageErrorType::ProtocolError);

    tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .unwrap();
    assert!(!server.is_established());
}

#[tokio::test]
async fn test_raw_oversized_frame_closes() {
    let (server_node, _srx) = TestNode::new("server");
    let (mut raw, b) = duplex(64 * 1024);
    let server = ConnectionBuilder::new(server_node)
        .max_message_size(1024)
        .accept(b)
        .unwrap();

    let mut prefix = vec![0u8; FRAME_PREFIX_SIZE];
    prefix[0..4].copy_from_slice(b"RRAC");
    prefix[4..8].copy_from_slice(&1_000_000u32.to_le_bytes());
    prefix[8..10].copy_from_slice(&2u16.to_le_bytes());
    raw.write_all(&prefix).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .unwrap();
    let mut rest = Vec::new();
    raw.read_to_end(&mut rest).await.unwrap();
}
