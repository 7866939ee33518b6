//! Stream transport engine.
//!
//! One [`StreamTransport`] owns one byte stream and runs two tasks:
//!
//! ```text
//!            ┌──────────────── receive loop ────────────────┐
//! stream ──► │ 16-byte prefix ─► bounds ─► frame ─► decode  │
//!            │   StreamOp / capability check: handled inline │
//!            │   everything else: spawned session dispatch   │──► TransportParent
//!            └───────────────────────────────────────────────┘
//!
//! callers ──► send-turn queue (FIFO, elision) ──► encode ──► stream
//!
//! heartbeat ──► ping when send-idle, close when receive-idle
//! ```
//!
//! All bookkeeping sits behind one short-lived lock; stream I/O never runs
//! under it. Teardown is idempotent and fails every outstanding waiter.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::buffer::GrowableBuffer;
use crate::capability::{
    apply_response, negotiate_responder, CapabilitySet, NegotiatedDialect, MESSAGE2_BASIC_ENABLE,
    MESSAGE2_BASIC_PAGE,
};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::parent::{DispatchContext, TransportParent};
use crate::protocol::{
    peek_frame_prefix, ElementData, Message, MessageElement, MessageEntry, MessageEntryType,
    MessageErrorType, MessageFlags, MessageHeader, NodeId, WireFormat, FRAME_PREFIX_SIZE,
    MIN_MESSAGE_SIZE, PROTOCOL_VERSION_4,
};
use crate::secure::{CertificatePolicy, SecureChannel};
use crate::slot::{wait_with, SingleFlight};

use super::send_queue::{Enqueued, Handoff, SendQueue, TurnUse};
use super::stream::{split, BoxedStream, StreamReader, StreamWriter};

/// StreamOp command: query the peer's node identity.
pub const STREAM_OP_GET_REMOTE_NODE_ID: &str = "GetRemoteNodeID";
/// StreamOp command: session establishment with capability negotiation.
pub const STREAM_OP_CREATE_CONNECTION: &str = "CreateConnection";
/// StreamOp command: in-band secure-channel upgrade.
pub const STREAM_OP_STARTTLS: &str = "STARTTLS";

const CAPABILITIES_ELEMENT: &str = "capabilities";
const RETURN_ELEMENT: &str = "return";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Read until `buf` is full. Returns false on end of stream.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// Read one frame into `buffer`. Returns its length, or `None` when the peer
/// closed the stream.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut GrowableBuffer,
    max_message_size: usize,
) -> Result<Option<usize>> {
    buffer.ensure(FRAME_PREFIX_SIZE, 0);
    if !read_full(reader, &mut buffer.as_mut_slice()[..FRAME_PREFIX_SIZE]).await? {
        return Ok(None);
    }
    let prefix = peek_frame_prefix(&buffer.as_slice()[..FRAME_PREFIX_SIZE])?;
    let size = prefix.message_size;
    if size < MIN_MESSAGE_SIZE {
        return Err(TransportError::protocol(format!(
            "Declared message size {} below minimum {}",
            size, MIN_MESSAGE_SIZE
        )));
    }
    if size > max_message_size {
        return Err(TransportError::MessageTooLarge {
            size,
            max: max_message_size,
        });
    }
    if size < FRAME_PREFIX_SIZE {
        return Err(TransportError::framing(format!(
            "Declared message size {} shorter than the frame prefix",
            size
        )));
    }
    buffer.ensure(size, FRAME_PREFIX_SIZE);
    if !read_full(reader, &mut buffer.as_mut_slice()[FRAME_PREFIX_SIZE..size]).await? {
        return Ok(None);
    }
    Ok(Some(size))
}

fn is_connect_reply(entry: &MessageEntry) -> bool {
    (entry.entry_type == MessageEntryType::CONNECT_CLIENT_RET
        || entry.entry_type == MessageEntryType::CONNECT_CLIENT_COMBINED_RET)
        && entry.error == MessageErrorType::None
}

fn is_liveness(entry: &MessageEntry) -> bool {
    entry.entry_type == MessageEntryType::CONNECTION_TEST
        || entry.entry_type == MessageEntryType::CONNECTION_TEST_RET
}

struct ConnState {
    closed: bool,
    established: bool,
    secure: bool,
    tls_in_progress: bool,
    tls_target: NodeId,
    /// Node id proven by the peer certificate, if any.
    certified_node_id: Option<NodeId>,
    local_endpoint: u32,
    remote_endpoint: u32,
    remote_node_id: NodeId,
    remote_node_name: String,
    dialect: NegotiatedDialect,
    send_queue: SendQueue,
    last_send: Instant,
    last_recv: Instant,
    last_recv_substantive: Instant,
}

/// Everything the engine needs from its builder.
pub(crate) struct EngineSettings {
    pub(crate) parent: Arc<dyn TransportParent>,
    pub(crate) config: TransportConfig,
    pub(crate) secure_channel: Option<Arc<dyn SecureChannel>>,
    pub(crate) certificate_policy: Option<Arc<dyn CertificatePolicy>>,
    pub(crate) is_client: bool,
}

struct Inner {
    id: u64,
    is_client: bool,
    config: TransportConfig,
    capabilities: CapabilitySet,
    node_id: NodeId,
    node_name: String,
    parent: Arc<dyn TransportParent>,
    secure_channel: Option<Arc<dyn SecureChannel>>,
    certificate_policy: Option<Arc<dyn CertificatePolicy>>,
    state: Mutex<ConnState>,
    writer: AsyncMutex<StreamWriter>,
    stream_op: SingleFlight<Result<Message>>,
    capability_check: SingleFlight<Result<Message>>,
    request_id: AtomicU32,
    shutdown: CancellationToken,
}

/// Exclusive write turn. Dropping it hands the turn to the next caller.
struct SendTurn<'a> {
    inner: &'a Inner,
}

impl Drop for SendTurn<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().send_queue.release();
    }
}

/// Handle to one running connection. Cheap to clone.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("connection_id", &self.inner.id)
            .field("is_client", &self.inner.is_client)
            .finish()
    }
}

impl StreamTransport {
    /// Start the receive and heartbeat tasks on `stream`.
    pub(crate) fn start(stream: BoxedStream, settings: EngineSettings) -> Self {
        let EngineSettings {
            parent,
            config,
            secure_channel,
            certificate_policy,
            is_client,
        } = settings;
        let (reader, write_half) = split(stream);
        let now = Instant::now();
        let inner = Arc::new(Inner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            is_client,
            capabilities: config.capabilities(),
            node_id: parent.node_id(),
            node_name: parent.node_name(),
            writer: AsyncMutex::new(StreamWriter::new(write_half, config.initial_buffer_size)),
            config,
            parent,
            secure_channel,
            certificate_policy,
            state: Mutex::new(ConnState {
                closed: false,
                established: false,
                secure: false,
                tls_in_progress: false,
                tls_target: NodeId::ANY,
                certified_node_id: None,
                local_endpoint: 0,
                remote_endpoint: 0,
                remote_node_id: NodeId::ANY,
                remote_node_name: String::new(),
                dialect: NegotiatedDialect::default(),
                send_queue: SendQueue::default(),
                last_send: now,
                last_recv: now,
                last_recv_substantive: now,
            }),
            stream_op: SingleFlight::new("StreamOp"),
            capability_check: SingleFlight::new("StreamCheckCapability"),
            request_id: AtomicU32::new(1),
            shutdown: CancellationToken::new(),
        });

        debug!(
            connection_id = inner.id,
            is_client,
            node_id = %inner.node_id,
            "Connection started"
        );

        let handle = StreamTransport {
            inner: inner.clone(),
        };
        inner.parent.add_connection(handle.clone());
        tokio::spawn(inner.clone().receive_loop(reader));
        tokio::spawn(inner.heartbeat_loop());
        handle
    }

    pub fn connection_id(&self) -> u64 {
        self.inner.id
    }

    /// Send a message, waiting for the write turn.
    ///
    /// Returns `Ok` without transmitting when the message was elided as a
    /// duplicate ping or superseded by a newer wire packet.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.inner.send(message, &CancellationToken::new()).await
    }

    /// [`send_message`](Self::send_message) with an external cancellation signal.
    pub async fn send_message_with(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        self.inner.send(message, cancel).await
    }

    /// Ask the peer for its node identity.
    pub async fn get_remote_node_id(&self) -> Result<NodeId> {
        let cancel = CancellationToken::new();
        let entry = MessageEntry::new(MessageEntryType::STREAM_OP, STREAM_OP_GET_REMOTE_NODE_ID);
        let reply = self
            .inner
            .stream_request(&self.inner.stream_op, self.inner.peer_header(), entry, &cancel)
            .await?;
        let id = reply.header.sender_node_id;
        let mut st = self.inner.state.lock();
        if st.remote_node_id.is_any_node() {
            st.remote_node_id = id;
            st.remote_node_name = reply.header.sender_node_name.clone();
        }
        Ok(id)
    }

    /// Query a named capability of the peer. Unknown names answer 0.
    pub async fn check_capability(&self, name: &str) -> Result<u32> {
        let cancel = CancellationToken::new();
        let entry = MessageEntry::new(MessageEntryType::STREAM_CHECK_CAPABILITY, name);
        let reply = self
            .inner
            .stream_request(
                &self.inner.capability_check,
                self.inner.peer_header(),
                entry,
                &cancel,
            )
            .await?;
        reply
            .entries
            .first()
            .ok_or_else(|| TransportError::protocol("Empty capability reply"))?
            .require_element(RETURN_ELEMENT)?
            .as_u32_slice()
            .and_then(|v| v.first().copied())
            .ok_or_else(|| TransportError::protocol("Capability reply is not a uint32"))
    }

    /// Upgrade to the secure channel. Failure closes the connection.
    pub async fn start_tls(&self, target: NodeId) -> Result<()> {
        let result = self.inner.start_tls(target).await;
        if let Err(e) = &result {
            self.inner.close_with(Some(e), "secure upgrade failed");
        }
        result
    }

    /// Session establishment: identity check and capability negotiation.
    pub(crate) async fn create_connection(
        &self,
        target: NodeId,
        target_name: &str,
    ) -> Result<NegotiatedDialect> {
        self.inner.create_connection(target, target_name).await
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.inner.close_with(None, "closed by caller");
    }

    /// Wait until the connection has closed.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.state.lock().closed
    }

    /// Whether `CreateConnection` completed on this connection.
    pub fn is_established(&self) -> bool {
        self.inner.state.lock().established
    }

    pub fn is_secure(&self) -> bool {
        self.inner.state.lock().secure
    }

    pub fn local_endpoint(&self) -> u32 {
        self.inner.state.lock().local_endpoint
    }

    pub fn remote_endpoint(&self) -> u32 {
        self.inner.state.lock().remote_endpoint
    }

    pub fn remote_node_id(&self) -> NodeId {
        self.inner.state.lock().remote_node_id
    }

    pub fn remote_node_name(&self) -> String {
        self.inner.state.lock().remote_node_name.clone()
    }

    pub fn dialect(&self) -> NegotiatedDialect {
        self.inner.state.lock().dialect
    }

    /// Header addressed to the peer over this connection.
    pub fn peer_header(&self) -> MessageHeader {
        self.inner.peer_header()
    }
}

impl Inner {
    fn handle(self: &Arc<Self>) -> StreamTransport {
        StreamTransport { inner: self.clone() }
    }

    fn next_request_id(&self) -> u32 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn peer_header(&self) -> MessageHeader {
        let st = self.state.lock();
        MessageHeader {
            sender_node_id: self.node_id,
            receiver_node_id: st.remote_node_id,
            sender_endpoint: st.local_endpoint,
            receiver_endpoint: st.remote_endpoint,
            sender_node_name: self.node_name.clone(),
            receiver_node_name: st.remote_node_name.clone(),
            ..Default::default()
        }
    }

    /// Header answering `request`.
    fn reply_header(&self, request: &MessageHeader) -> MessageHeader {
        MessageHeader {
            sender_node_id: self.node_id,
            receiver_node_id: request.sender_node_id,
            sender_endpoint: request.receiver_endpoint,
            receiver_endpoint: request.sender_endpoint,
            sender_node_name: self.node_name.clone(),
            receiver_node_name: request.sender_node_name.clone(),
            ..Default::default()
        }
    }

    fn context(self: &Arc<Self>) -> DispatchContext {
        let st = self.state.lock();
        DispatchContext {
            connection_id: self.id,
            local_endpoint: st.local_endpoint,
            remote_endpoint: st.remote_endpoint,
            remote_node_id: st.remote_node_id,
            secure: st.secure,
            connection: self.handle(),
        }
    }

    fn refusing_insecure(&self) -> bool {
        self.config.require_tls && !self.state.lock().secure
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Claim the write turn. `None` means the message needs no transmission.
    async fn acquire_turn(
        &self,
        item: TurnUse,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Option<(SendTurn<'_>, TurnUse)>> {
        let enqueued = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(TransportError::ConnectionClosed);
            }
            st.send_queue.push(item)
        };
        let mut rx = match enqueued {
            Enqueued::Run(item) => return Ok(Some((SendTurn { inner: self }, item))),
            Enqueued::Elided => {
                trace!(connection_id = self.id, "Duplicate ping elided");
                return Ok(None);
            }
            Enqueued::Wait(rx) => rx,
        };
        match wait_with(&mut rx, cancel, deadline, "send turn").await {
            Ok(Ok(Ok(Handoff::Turn(item)))) => Ok(Some((SendTurn { inner: self }, item))),
            Ok(Ok(Ok(Handoff::Done))) => {
                trace!(connection_id = self.id, "Queued wire packet superseded");
                Ok(None)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(e) => {
                rx.close();
                if let Ok(Ok(Handoff::Turn(_))) = rx.try_recv() {
                    drop(SendTurn { inner: self });
                }
                Err(e)
            }
        }
    }

    fn wire_format_for(&self, header: &MessageHeader) -> WireFormat {
        let st = self.state.lock();
        if !st.dialect.message4 {
            return WireFormat::V2;
        }
        let mut flags = MessageFlags::default();
        let routing_known = !st.remote_node_id.is_any_node()
            && header.sender_node_id == self.node_id
            && header.receiver_node_id == st.remote_node_id;
        if !routing_known {
            flags = flags | MessageFlags::ROUTING_INFO;
        }
        let endpoints_known = st.local_endpoint != 0
            && header.sender_endpoint == st.local_endpoint
            && header.receiver_endpoint == st.remote_endpoint;
        if !endpoints_known {
            flags = flags | MessageFlags::ENDPOINT_INFO;
        }
        WireFormat::V4(flags)
    }

    /// Encode and write. Caller must hold the write turn.
    async fn write_message(&self, message: &Message) -> Result<()> {
        let format = self.wire_format_for(&message.header);
        let size = message.compute_size(format);
        if size > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }
        let mut writer = self.writer.lock().await;
        writer.buffer.ensure(size, 0);
        let len = message.write_to(writer.buffer.as_mut_slice(), format)?;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(TransportError::ConnectionClosed),
            r = writer.write_buffered(len) => r?,
        }
        drop(writer);
        self.state.lock().last_send = Instant::now();
        trace!(
            connection_id = self.id,
            size = len,
            version = format.version(),
            entries = message.entries.len(),
            "Message sent"
        );
        Ok(())
    }

    async fn send(self: &Arc<Self>, message: Message, cancel: &CancellationToken) -> Result<()> {
        let (turn, item) = match self
            .acquire_turn(TurnUse::Write(message), cancel, None)
            .await?
        {
            Some(granted) => granted,
            None => return Ok(()),
        };
        let message = match item {
            TurnUse::Write(message) => message,
            TurnUse::Pause => {
                return Err(TransportError::Internal(
                    "Write turn granted without a message".into(),
                ))
            }
        };
        let result = self.write_message(&message).await;
        drop(turn);
        match result {
            Ok(()) => {
                self.observe_sent(&message);
                Ok(())
            }
            // Rejected while encoding; nothing reached the stream.
            Err(e @ (TransportError::MessageTooLarge { .. } | TransportError::Protocol(_))) => {
                debug!(connection_id = self.id, error = %e, "Message refused");
                Err(e)
            }
            Err(e) => {
                self.close_with(Some(&e), "write failed");
                Err(e)
            }
        }
    }

    /// Send `entry` as the reply to `request`.
    async fn send_reply(self: &Arc<Self>, request: &Message, entry: MessageEntry) -> Result<()> {
        let reply = Message::with_entry(self.reply_header(&request.header), entry);
        self.send(reply, &self.shutdown.clone()).await
    }

    /// Error replies for every request entry of `message`.
    async fn refuse(
        self: &Arc<Self>,
        message: &Message,
        error: MessageErrorType,
        text: &str,
    ) -> Result<()> {
        let entries: Vec<MessageEntry> = message
            .entries
            .iter()
            .filter(|e| e.entry_type.is_request())
            .map(|e| e.error_reply(error, text))
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        let reply = Message {
            header: self.reply_header(&message.header),
            entries,
        };
        self.send(reply, &self.shutdown.clone()).await
    }

    /// Request/reply over a single-flight slot.
    async fn stream_request(
        self: &Arc<Self>,
        slot: &SingleFlight<Result<Message>>,
        header: MessageHeader,
        entry: MessageEntry,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let deadline = Instant::now() + self.config.connect_timeout();
        let guard = slot.acquire(cancel, deadline).await?;
        let request_id = self.next_request_id();
        let waiter = guard.arm(request_id)?;
        let message = Message::with_entry(header, entry.with_request_id(request_id));
        self.send(message, cancel).await?;
        let reply = waiter.wait(cancel, deadline).await??;
        drop(guard);
        match reply.single_entry() {
            Some(entry) => entry.check_error()?,
            None => return Err(TransportError::protocol("Reply must carry exactly one entry")),
        }
        Ok(reply)
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    async fn create_connection(
        self: &Arc<Self>,
        target: NodeId,
        target_name: &str,
    ) -> Result<NegotiatedDialect> {
        let proposed = self.capabilities.propose();
        let entry = MessageEntry::new(MessageEntryType::STREAM_OP, STREAM_OP_CREATE_CONNECTION)
            .with_element(MessageElement::new(
                CAPABILITIES_ELEMENT,
                ElementData::UInt32(proposed.clone()),
            ));
        let mut header = self.peer_header();
        header.receiver_node_id = target;
        header.receiver_node_name = target_name.to_string();

        let cancel = CancellationToken::new();
        let reply = self
            .stream_request(&self.stream_op, header, entry, &cancel)
            .await?;

        let h = &reply.header;
        if !target.is_any_node() && h.sender_node_id != target {
            return Err(TransportError::IdentityMismatch(format!(
                "Expected node {}, connected to {}",
                target, h.sender_node_id
            )));
        }
        if !target_name.is_empty() && h.sender_node_name != target_name {
            return Err(TransportError::IdentityMismatch(format!(
                "Expected node name '{}', connected to '{}'",
                target_name, h.sender_node_name
            )));
        }
        if let Some(certified) = self.state.lock().certified_node_id {
            if certified != h.sender_node_id {
                return Err(TransportError::IdentityMismatch(format!(
                    "Certificate is bound to {}, peer claims {}",
                    certified, h.sender_node_id
                )));
            }
        }

        let agreed = reply.entries[0]
            .find_element(CAPABILITIES_ELEMENT)
            .and_then(MessageElement::as_u32_slice)
            .map(<[u32]>::to_vec)
            .unwrap_or_else(|| vec![MESSAGE2_BASIC_PAGE | MESSAGE2_BASIC_ENABLE]);
        let dialect = apply_response(&proposed, &agreed)?;

        {
            let mut st = self.state.lock();
            st.remote_node_id = h.sender_node_id;
            st.remote_node_name = h.sender_node_name.clone();
            st.dialect = dialect;
            st.established = true;
        }
        debug!(
            connection_id = self.id,
            remote_node_id = %h.sender_node_id,
            message4 = dialect.message4,
            "Connection established"
        );
        Ok(dialect)
    }

    /// Responder side of `CreateConnection`.
    async fn accept_create_connection(self: &Arc<Self>, message: &Message) -> Result<()> {
        let entry = &message.entries[0];
        let h = &message.header;
        if self.state.lock().established {
            return self
                .send_reply(
                    message,
                    entry.error_reply(MessageErrorType::ProtocolError, "Connection already established"),
                )
                .await;
        }
        let addressed = (h.receiver_node_id.is_any_node() || h.receiver_node_id == self.node_id)
            && (h.receiver_node_name.is_empty() || h.receiver_node_name == self.node_name);
        if !addressed {
            warn!(
                connection_id = self.id,
                requested = %h.receiver_node_id,
                requested_name = %h.receiver_node_name,
                "CreateConnection for another node"
            );
            return self
                .send_reply(
                    message,
                    entry.error_reply(MessageErrorType::NodeNotFound, "Node not found"),
                )
                .await;
        }

        let proposed = entry
            .find_element(CAPABILITIES_ELEMENT)
            .and_then(MessageElement::as_u32_slice)
            .map(<[u32]>::to_vec)
            .unwrap_or_else(|| vec![MESSAGE2_BASIC_PAGE | MESSAGE2_BASIC_ENABLE]);
        let (agreed, dialect) = match negotiate_responder(&proposed, &self.capabilities) {
            Ok(result) => result,
            Err(e) => {
                // Report the mismatch before the connection goes down.
                let _ = self
                    .send_reply(
                        message,
                        entry.error_reply(MessageErrorType::ProtocolError, e.to_string()),
                    )
                    .await;
                return Err(e);
            }
        };

        {
            let mut st = self.state.lock();
            st.remote_node_id = h.sender_node_id;
            st.remote_node_name = h.sender_node_name.clone();
        }
        let reply = entry
            .reply()
            .with_element(MessageElement::new(CAPABILITIES_ELEMENT, ElementData::UInt32(agreed)));
        self.send_reply(message, reply).await?;
        {
            let mut st = self.state.lock();
            st.dialect = dialect;
            st.established = true;
        }
        debug!(
            connection_id = self.id,
            remote_node_id = %h.sender_node_id,
            message4 = dialect.message4,
            "Connection accepted"
        );
        Ok(())
    }

    async fn start_tls(self: &Arc<Self>, target: NodeId) -> Result<()> {
        if self.secure_channel.is_none() {
            return Err(TransportError::Config("No secure channel configured".into()));
        }
        if self.state.lock().secure {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + self.config.connect_timeout();
        let guard = self.stream_op.acquire(&cancel, deadline).await?;
        // Pause the send path: nothing else may be written until the upgrade completes.
        let (turn, _) = self
            .acquire_turn(TurnUse::Pause, &cancel, Some(deadline))
            .await?
            .ok_or_else(|| TransportError::Internal("Pause turn was elided".into()))?;

        let request_id = self.next_request_id();
        let waiter = guard.arm(request_id)?;
        {
            let mut st = self.state.lock();
            st.tls_in_progress = true;
            st.tls_target = target;
        }
        debug!(connection_id = self.id, "Starting secure upgrade");

        let mut header = self.peer_header();
        if header.receiver_node_id.is_any_node() {
            header.receiver_node_id = target;
        }
        let request = Message::with_entry(
            header,
            MessageEntry::new(MessageEntryType::STREAM_OP, STREAM_OP_STARTTLS)
                .with_request_id(request_id),
        );
        let result = async {
            self.write_message(&request).await?;
            let reply = waiter.wait(&cancel, deadline).await??;
            match reply.single_entry() {
                Some(entry) => entry.check_error(),
                None => Err(TransportError::protocol("Malformed STARTTLS reply")),
            }
        }
        .await;

        self.state.lock().tls_in_progress = false;
        drop(turn);
        drop(guard);
        result?;
        if !self.state.lock().secure {
            return Err(TransportError::protocol("STARTTLS completed without an upgrade"));
        }
        Ok(())
    }

    /// Hand the raw stream to the secure channel and swap in the result.
    async fn upgrade_stream(
        &self,
        reader: &mut Option<StreamReader>,
        expected: NodeId,
    ) -> Result<()> {
        let channel = self
            .secure_channel
            .clone()
            .ok_or_else(|| TransportError::Config("No secure channel configured".into()))?;
        let read_half = reader
            .take()
            .ok_or_else(|| TransportError::Internal("Read half already taken".into()))?;
        let write_half = self
            .writer
            .lock()
            .await
            .take()
            .ok_or(TransportError::ConnectionClosed)?;
        let raw = read_half.unsplit(write_half);

        let handshake = async {
            if self.is_client {
                channel.connect(raw, expected).await
            } else {
                channel.accept(raw).await
            }
        };
        let secured = tokio::time::timeout(self.config.connect_timeout(), handshake)
            .await
            .map_err(|_| TransportError::Timeout("Secure handshake timed out".into()))??;

        let certified = match (&self.certificate_policy, &secured.peer) {
            (Some(policy), Some(peer)) => Some(policy.verify(expected, peer)?),
            (Some(_), None) if self.is_client => {
                return Err(TransportError::IdentityMismatch(
                    "Peer presented no certificate".into(),
                ))
            }
            _ => None,
        };

        let (new_reader, new_writer) = split(secured.stream);
        self.writer.lock().await.replace(new_writer);
        *reader = Some(new_reader);
        {
            let mut st = self.state.lock();
            st.secure = true;
            st.certified_node_id = certified;
        }
        debug!(
            connection_id = self.id,
            certified = ?certified,
            "Secure channel established"
        );
        Ok(())
    }

    /// Responder side of STARTTLS, run inline by the receive loop.
    async fn accept_starttls(
        self: &Arc<Self>,
        message: &Message,
        reader: &mut Option<StreamReader>,
    ) -> Result<()> {
        let entry = &message.entries[0];
        if self.secure_channel.is_none() {
            return self
                .send_reply(
                    message,
                    entry.error_reply(MessageErrorType::ProtocolError, "Secure channel not supported"),
                )
                .await;
        }
        if self.state.lock().secure {
            return self
                .send_reply(
                    message,
                    entry.error_reply(MessageErrorType::ProtocolError, "Channel already secure"),
                )
                .await;
        }

        let deadline = Instant::now() + self.config.connect_timeout();
        let shutdown = self.shutdown.clone();
        let (turn, _) = self
            .acquire_turn(TurnUse::Pause, &shutdown, Some(deadline))
            .await?
            .ok_or_else(|| TransportError::Internal("Pause turn was elided".into()))?;
        let reply = Message::with_entry(self.reply_header(&message.header), entry.reply());
        self.write_message(&reply).await?;
        self.upgrade_stream(reader, NodeId::ANY).await?;
        drop(turn);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    async fn receive_loop(self: Arc<Self>, reader: StreamReader) {
        let mut reader = Some(reader);
        let mut buffer = GrowableBuffer::new(self.config.initial_buffer_size.max(FRAME_PREFIX_SIZE));
        loop {
            let r = match reader.as_mut() {
                Some(r) => r,
                None => break,
            };
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                f = read_frame(r, &mut buffer, self.config.max_message_size) => f,
            };
            let len = match frame {
                Ok(Some(len)) => len,
                Ok(None) => {
                    self.close_with(None, "peer closed the stream");
                    break;
                }
                Err(e) => {
                    self.close_with(Some(&e), "receive failed");
                    break;
                }
            };
            let message = match self.decode(&buffer.as_slice()[..len]) {
                Ok(message) => message,
                Err(e) => {
                    self.close_with(Some(&e), "decode failed");
                    break;
                }
            };
            if let Err(e) = self.process(message, &mut reader).await {
                self.close_with(Some(&e), "processing failed");
                break;
            }
        }
        drop(reader);
        self.writer.lock().await.shutdown().await;
        trace!(connection_id = self.id, "Receive loop stopped");
    }

    fn decode(&self, frame: &[u8]) -> Result<Message> {
        let (mut message, info) = Message::decode_frame(frame)?;
        if info.version == PROTOCOL_VERSION_4 {
            let st = self.state.lock();
            let h = &mut message.header;
            if !info.sections.contains(MessageFlags::ROUTING_INFO) {
                h.sender_node_id = st.remote_node_id;
                h.receiver_node_id = self.node_id;
            }
            if !info.sections.contains(MessageFlags::ENDPOINT_INFO) {
                h.sender_endpoint = st.remote_endpoint;
                h.receiver_endpoint = st.local_endpoint;
            }
        }
        trace!(
            connection_id = self.id,
            size = frame.len(),
            version = info.version,
            entries = message.entries.len(),
            "Message received"
        );
        Ok(message)
    }

    async fn process(
        self: &Arc<Self>,
        message: Message,
        reader: &mut Option<StreamReader>,
    ) -> Result<()> {
        {
            let now = Instant::now();
            let mut st = self.state.lock();
            st.last_recv = now;
            if !message.entries.iter().all(is_liveness) {
                st.last_recv_substantive = now;
            }
        }

        let single = message
            .single_entry()
            .map(|e| (e.entry_type, e.request_id));
        match single {
            Some((MessageEntryType::STREAM_OP, _)) => {
                return self.handle_stream_op(message, reader).await
            }
            Some((MessageEntryType::STREAM_OP_RET, _)) => {
                return self.handle_stream_op_ret(message, reader).await
            }
            Some((MessageEntryType::STREAM_CHECK_CAPABILITY, _)) => {
                return self.handle_check_capability(message).await
            }
            Some((MessageEntryType::STREAM_CHECK_CAPABILITY_RET, request_id)) => {
                if !self.capability_check.complete(request_id, Ok(message)) {
                    warn!(connection_id = self.id, request_id, "Unsolicited capability reply");
                }
                return Ok(());
            }
            _ => {}
        }

        // Bind before the next frame is decoded: the peer compacts endpoints
        // as soon as it has sent the connect reply.
        if self.admits_session(&message) {
            self.observe_received(&message);
        }

        // Pipelined: the next frame is read while this one is dispatched.
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.clone().dispatch(message).await {
                inner.close_with(Some(&e), "dispatch failed");
            }
        });
        Ok(())
    }

    async fn handle_stream_op(
        self: &Arc<Self>,
        message: Message,
        reader: &mut Option<StreamReader>,
    ) -> Result<()> {
        let entry = &message.entries[0];
        let command = entry.member_name.as_str();
        if command != STREAM_OP_STARTTLS && self.refusing_insecure() {
            warn!(connection_id = self.id, command, "Refusing StreamOp before STARTTLS");
            return self
                .send_reply(
                    &message,
                    entry.error_reply(MessageErrorType::ConnectionError, "Secure connection required"),
                )
                .await;
        }
        trace!(connection_id = self.id, command, "StreamOp request");
        match command {
            STREAM_OP_GET_REMOTE_NODE_ID => self.send_reply(&message, entry.reply()).await,
            STREAM_OP_CREATE_CONNECTION => self.accept_create_connection(&message).await,
            STREAM_OP_STARTTLS => self.accept_starttls(&message, reader).await,
            other => {
                warn!(connection_id = self.id, command = other, "Unknown StreamOp command");
                self.send_reply(
                    &message,
                    entry.error_reply(
                        MessageErrorType::ProtocolError,
                        format!("Unknown StreamOp command '{}'", other),
                    ),
                )
                .await
            }
        }
    }

    async fn handle_stream_op_ret(
        self: &Arc<Self>,
        message: Message,
        reader: &mut Option<StreamReader>,
    ) -> Result<()> {
        let entry = &message.entries[0];
        let request_id = entry.request_id;
        if entry.member_name == STREAM_OP_STARTTLS {
            let (in_progress, target) = {
                let st = self.state.lock();
                (st.tls_in_progress, st.tls_target)
            };
            if !in_progress {
                return Err(TransportError::protocol("Unexpected STARTTLS reply"));
            }
            if entry.error == MessageErrorType::None {
                if let Err(e) = self.upgrade_stream(reader, target).await {
                    let reason = format!("Secure upgrade failed: {}", e);
                    self.stream_op.complete(request_id, Err(e));
                    return Err(TransportError::protocol(reason));
                }
            }
        }
        if !self.stream_op.complete(request_id, Ok(message)) {
            warn!(connection_id = self.id, request_id, "Unsolicited StreamOp reply");
        }
        Ok(())
    }

    async fn handle_check_capability(self: &Arc<Self>, message: Message) -> Result<()> {
        let entry = &message.entries[0];
        if self.refusing_insecure() {
            return self
                .send_reply(
                    &message,
                    entry.error_reply(MessageErrorType::ConnectionError, "Secure connection required"),
                )
                .await;
        }
        let value = self.capabilities.check_named(&entry.member_name);
        let reply = entry.reply().with_element(MessageElement::u32(RETURN_ELEMENT, value));
        self.send_reply(&message, reply).await
    }

    /// Session-layer dispatch of one decoded message.
    async fn dispatch(self: Arc<Self>, message: Message) -> Result<()> {
        let (secure, remote_node_id, local_endpoint, remote_endpoint) = {
            let st = self.state.lock();
            (
                st.secure,
                st.remote_node_id,
                st.local_endpoint,
                st.remote_endpoint,
            )
        };

        if self.config.require_tls && !secure {
            warn!(connection_id = self.id, "Refusing message before STARTTLS");
            return self
                .refuse(&message, MessageErrorType::ConnectionError, "Secure connection required")
                .await;
        }

        if secure {
            let h = &message.header;
            if !remote_node_id.is_any_node() && h.sender_node_id != remote_node_id {
                warn!(
                    connection_id = self.id,
                    claimed = %h.sender_node_id,
                    bound = %remote_node_id,
                    "Sender node id does not match secure connection"
                );
                return self
                    .refuse(&message, MessageErrorType::NodeNotFound, "Node not found")
                    .await;
            }
            if local_endpoint != 0
                && (h.sender_endpoint != remote_endpoint || h.receiver_endpoint != local_endpoint)
            {
                warn!(
                    connection_id = self.id,
                    sender_endpoint = h.sender_endpoint,
                    receiver_endpoint = h.receiver_endpoint,
                    "Endpoint does not match secure connection"
                );
                return self
                    .refuse(&message, MessageErrorType::InvalidEndpoint, "Invalid endpoint")
                    .await;
            }
        }

        if let Some(entry) = message.single_entry() {
            if entry.entry_type == MessageEntryType::CONNECTION_TEST {
                return self.send_reply(&message, entry.reply()).await;
            }
            if entry.entry_type == MessageEntryType::CONNECTION_TEST_RET {
                return Ok(());
            }
        }

        let ctx = self.context();
        if let Some(reply) = self.parent.special_request(&message, &ctx).await? {
            let shutdown = self.shutdown.clone();
            return self.send(reply, &shutdown).await;
        }

        self.parent.message_received(message, ctx).await
    }

    // ------------------------------------------------------------------
    // Endpoint binding
    // ------------------------------------------------------------------

    /// Whether the session gate in `dispatch` lets `message` through.
    fn admits_session(&self, message: &Message) -> bool {
        let st = self.state.lock();
        if self.config.require_tls && !st.secure {
            return false;
        }
        !st.secure
            || st.remote_node_id.is_any_node()
            || message.header.sender_node_id == st.remote_node_id
    }

    fn observe_received(self: &Arc<Self>, message: &Message) {
        let h = &message.header;
        let to_us = h.receiver_node_id.is_any_node() || h.receiver_node_id == self.node_id;
        if to_us && message.entries.iter().any(is_connect_reply) {
            self.bind_endpoints(h.receiver_endpoint, h.sender_endpoint);
        }
    }

    fn observe_sent(self: &Arc<Self>, message: &Message) {
        if message.entries.iter().any(is_connect_reply) {
            let h = &message.header;
            self.bind_endpoints(h.sender_endpoint, h.receiver_endpoint);
        }
    }

    fn bind_endpoints(self: &Arc<Self>, local: u32, remote: u32) {
        if local == 0 {
            return;
        }
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            if st.local_endpoint != 0 {
                if st.local_endpoint != local || st.remote_endpoint != remote {
                    warn!(
                        connection_id = self.id,
                        bound = st.local_endpoint,
                        offered = local,
                        "Endpoints already bound"
                    );
                }
                return;
            }
            st.local_endpoint = local;
            st.remote_endpoint = remote;
        }
        debug!(
            connection_id = self.id,
            local_endpoint = local,
            remote_endpoint = remote,
            "Endpoints bound"
        );
        self.parent.register_endpoint(local, self.handle());
    }

    // ------------------------------------------------------------------
    // Heartbeat and teardown
    // ------------------------------------------------------------------

    fn ping_message(&self) -> Message {
        Message::with_entry(
            self.peer_header(),
            MessageEntry::new(MessageEntryType::CONNECTION_TEST, ""),
        )
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();
            let (last_send, last_recv, last_substantive) = {
                let st = self.state.lock();
                (st.last_send, st.last_recv, st.last_recv_substantive)
            };
            if now.duration_since(last_recv) > self.config.receive_timeout() {
                warn!(connection_id = self.id, "Receive timeout");
                self.close_with(None, "receive timeout");
                return;
            }
            if now.duration_since(last_substantive) > self.config.inactivity_timeout() {
                warn!(connection_id = self.id, "Inactivity timeout");
                self.close_with(None, "inactivity timeout");
                return;
            }
            if now.duration_since(last_send) > self.config.heartbeat_period() {
                let inner = self.clone();
                tokio::spawn(async move {
                    let ping = inner.ping_message();
                    let shutdown = inner.shutdown.clone();
                    if let Err(e) = inner.send(ping, &shutdown).await {
                        trace!(connection_id = inner.id, error = %e, "Ping not sent");
                    }
                });
            }
        }
    }

    /// Idempotent teardown.
    fn close_with(&self, error: Option<&TransportError>, reason: &str) {
        let (local_endpoint, failed) = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            (st.local_endpoint, st.send_queue.close())
        };
        match error {
            Some(e) if e.is_fatal() => {
                error!(connection_id = self.id, reason, error = %e, "Connection closed")
            }
            Some(e) => warn!(connection_id = self.id, reason, error = %e, "Connection closed"),
            None => debug!(connection_id = self.id, reason, "Connection closed"),
        }
        self.parent.remove_connection(self.id);
        if local_endpoint != 0 {
            self.parent.unregister_endpoint(local_endpoint);
        }
        self.stream_op.close();
        self.capability_check.close();
        self.shutdown.cancel();
        trace!(connection_id = self.id, failed_senders = failed, "Teardown complete");
    }
}
