//! Message header and full message framing.
//!
//! Version 2 header:
//! ```text
//! ┌───────┬─────────────┬─────────┬──────────────┬──────────────────────┐
//! │ RRAC  │ MessageSize │ Version │ HeaderLength │ Sender/Receiver IDs  │
//! │ 4     │ u32         │ u16 = 2 │ u16          │ 16 + 16, big-endian  │
//! ├───────┴─────────────┴─────────┴──────────────┴──────────────────────┤
//! │ Sender/Receiver Endpoint u32 + u32 │ SenderName, ReceiverName,      │
//! │                                    │ MetaData (str each)            │
//! ├────────────────────────────────────┴────────────────────────────────┤
//! │ EntryCount u16 │ MessageID u16 │ MessageResID u16                   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Version 4 inserts a flags byte and a reserved byte after HeaderLength;
//! the NodeID pair is present only with [`MessageFlags::ROUTING_INFO`] and
//! the endpoint pair only with [`MessageFlags::ENDPOINT_INFO`]. Entries and
//! elements use the same layout in both versions.

use crate::error::{Result, TransportError};

use super::binary::{string_size, WireReader, WireWriter};
use super::entry::MessageEntry;
use super::node_id::{NodeId, NODE_ID_SIZE};

/// ASCII magic at the start of every message.
pub const MAGIC: &[u8; 4] = b"RRAC";

/// Bytes the receive loop reads before it knows the frame length.
pub const FRAME_PREFIX_SIZE: usize = 16;

/// Smallest acceptable declared message length.
pub const MIN_MESSAGE_SIZE: usize = 8;

/// Default maximum message size (12 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 12 * 1024 * 1024;

/// Ceiling the configured maximum may be raised to (100 MiB).
pub const JUMBO_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Baseline framing version.
pub const PROTOCOL_VERSION_2: u16 = 2;

/// Optimized framing version.
pub const PROTOCOL_VERSION_4: u16 = 4;

/// Fixed part of a version 2 header.
pub const HEADER_V2_FIXED_SIZE: usize = 64;

/// Section-presence flags of a version 4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(pub u8);

impl MessageFlags {
    pub const ROUTING_INFO: MessageFlags = MessageFlags(0x01);
    pub const ENDPOINT_INFO: MessageFlags = MessageFlags(0x02);
    /// All flags this implementation understands.
    pub const KNOWN: MessageFlags = MessageFlags(0x03);
    /// Every section present.
    pub const FULL: MessageFlags = MessageFlags(0x03);

    #[inline]
    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        MessageFlags(self.0 | rhs.0)
    }
}

/// Framing used when writing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    V2,
    V4(MessageFlags),
}

impl WireFormat {
    pub fn version(self) -> u16 {
        match self {
            WireFormat::V2 => PROTOCOL_VERSION_2,
            WireFormat::V4(_) => PROTOCOL_VERSION_4,
        }
    }

    fn sections(self) -> MessageFlags {
        match self {
            WireFormat::V2 => MessageFlags::FULL,
            WireFormat::V4(flags) => flags,
        }
    }
}

/// Routing and session envelope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageHeader {
    pub sender_node_id: NodeId,
    pub receiver_node_id: NodeId,
    /// Local connection id of the sender, 0 = unassigned.
    pub sender_endpoint: u32,
    pub receiver_endpoint: u32,
    pub sender_node_name: String,
    pub receiver_node_name: String,
    pub metadata: String,
    pub message_id: u16,
    pub message_res_id: u16,
}

impl MessageHeader {
    /// Encoded header length for the given format.
    pub fn compute_size(&self, format: WireFormat) -> usize {
        let strings = string_size(&self.sender_node_name)
            + string_size(&self.receiver_node_name)
            + string_size(&self.metadata);
        match format {
            WireFormat::V2 => HEADER_V2_FIXED_SIZE - 6 + strings,
            WireFormat::V4(flags) => {
                // magic + size + version + header length + flags + reserved
                // + entry count + message id + res id
                let mut size = 4 + 4 + 2 + 2 + 1 + 1 + 2 + 2 + 2 + strings;
                if flags.contains(MessageFlags::ROUTING_INFO) {
                    size += 2 * NODE_ID_SIZE;
                }
                if flags.contains(MessageFlags::ENDPOINT_INFO) {
                    size += 8;
                }
                size
            }
        }
    }

    /// Same routing tuple (node ids, names and endpoints on both sides).
    pub fn same_route(&self, other: &MessageHeader) -> bool {
        self.sender_node_id == other.sender_node_id
            && self.receiver_node_id == other.receiver_node_id
            && self.sender_node_name == other.sender_node_name
            && self.receiver_node_name == other.receiver_node_name
            && self.sender_endpoint == other.sender_endpoint
            && self.receiver_endpoint == other.receiver_endpoint
    }
}

/// Version and omitted sections of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub version: u16,
    pub sections: MessageFlags,
}

/// Length and version read from the fixed frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePrefix {
    pub message_size: usize,
    pub version: u16,
}

/// Check the magic and read size and version from the frame prefix.
pub fn peek_frame_prefix(prefix: &[u8]) -> Result<FramePrefix> {
    if prefix.len() < 10 {
        return Err(TransportError::framing("Frame prefix too short"));
    }
    if &prefix[0..4] != MAGIC {
        return Err(TransportError::framing(format!(
            "Bad magic {:02x?}",
            &prefix[0..4]
        )));
    }
    let message_size = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
    let version = u16::from_le_bytes([prefix[8], prefix[9]]);
    Ok(FramePrefix {
        message_size,
        version,
    })
}

/// One datagram-like unit exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub header: MessageHeader,
    pub entries: Vec<MessageEntry>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message with a single entry.
    pub fn with_entry(header: MessageHeader, entry: MessageEntry) -> Self {
        Self {
            header,
            entries: vec![entry],
        }
    }

    /// The only entry, if there is exactly one.
    pub fn single_entry(&self) -> Option<&MessageEntry> {
        match self.entries.as_slice() {
            [entry] => Some(entry),
            _ => None,
        }
    }

    /// Exact encoded size in bytes.
    pub fn compute_size(&self, format: WireFormat) -> usize {
        self.header.compute_size(format)
            + self.entries.iter().map(|e| e.compute_size()).sum::<usize>()
    }

    /// Encode into the front of `buf`, returning the number of bytes written.
    ///
    /// The written length must equal [`Message::compute_size`]; a mismatch is
    /// an encoder bug and surfaces as `TransportError::Internal`.
    pub fn write_to(&self, buf: &mut [u8], format: WireFormat) -> Result<usize> {
        let size = self.compute_size(format);
        if buf.len() < size {
            return Err(TransportError::Internal(format!(
                "Send buffer of {} bytes too small for {} byte message",
                buf.len(),
                size
            )));
        }
        let header_size = self.header.compute_size(format);
        let header_len = u16::try_from(header_size).map_err(|_| {
            TransportError::protocol(format!("Header of {} bytes exceeds 65535", header_size))
        })?;
        let entry_count = u16::try_from(self.entries.len()).map_err(|_| {
            TransportError::protocol(format!("{} entries exceed 65535", self.entries.len()))
        })?;

        let mut w = WireWriter::new(&mut buf[..size]);
        let h = &self.header;
        w.write_raw(MAGIC)?;
        w.write_len_u32(size)?;
        w.write_u16(format.version())?;
        w.write_u16(header_len)?;
        let sections = format.sections();
        if let WireFormat::V4(flags) = format {
            if flags.0 & !MessageFlags::KNOWN.0 != 0 {
                return Err(TransportError::Internal(format!(
                    "Unknown message flags {:#04x}",
                    flags.0
                )));
            }
            w.write_u8(flags.0)?;
            w.write_u8(0)?;
        }
        if sections.contains(MessageFlags::ROUTING_INFO) {
            w.write_node_id(&h.sender_node_id)?;
            w.write_node_id(&h.receiver_node_id)?;
        }
        if sections.contains(MessageFlags::ENDPOINT_INFO) {
            w.write_u32(h.sender_endpoint)?;
            w.write_u32(h.receiver_endpoint)?;
        }
        w.write_string(&h.sender_node_name)?;
        w.write_string(&h.receiver_node_name)?;
        w.write_string(&h.metadata)?;
        w.write_u16(entry_count)?;
        w.write_u16(h.message_id)?;
        w.write_u16(h.message_res_id)?;
        if w.position() != header_size {
            return Err(TransportError::Internal(format!(
                "Header wrote {} bytes, computed {}",
                w.position(),
                header_size
            )));
        }
        for entry in &self.entries {
            entry.write(&mut w)?;
        }
        if w.position() != size {
            return Err(TransportError::Internal(format!(
                "Message wrote {} bytes, computed {}",
                w.position(),
                size
            )));
        }
        Ok(size)
    }

    /// Encode into a freshly allocated vector.
    pub fn encode(&self, format: WireFormat) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.compute_size(format)];
        self.write_to(&mut buf, format)?;
        Ok(buf)
    }

    /// Decode a complete frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::decode_frame(buf).map(|(m, _)| m)
    }

    /// Decode a complete frame, also reporting version and present sections.
    ///
    /// Sections omitted by a version 4 sender are left at their defaults; the
    /// connection fills them in from its bound identity.
    pub fn decode_frame(buf: &[u8]) -> Result<(Self, FrameInfo)> {
        let mut r = WireReader::new(buf);
        if r.take(4)? != MAGIC {
            return Err(TransportError::framing("Bad magic"));
        }
        let size = r.read_u32()? as usize;
        if size != buf.len() {
            return Err(TransportError::framing(format!(
                "Declared message size {} does not match frame of {} bytes",
                size,
                buf.len()
            )));
        }
        let version = r.read_u16()?;
        let header_len = r.read_u16()? as usize;
        // Header region starts at offset 0; 12 bytes are already consumed.
        let header_rest = header_len.checked_sub(12).ok_or_else(|| {
            TransportError::framing(format!("Header length {} too small", header_len))
        })?;
        r.push_relative_limit(header_rest)?;

        let sections = match version {
            PROTOCOL_VERSION_2 => MessageFlags::FULL,
            PROTOCOL_VERSION_4 => {
                let flags = MessageFlags(r.read_u8()?);
                let _reserved = r.read_u8()?;
                if flags.0 & !MessageFlags::KNOWN.0 != 0 {
                    return Err(TransportError::framing(format!(
                        "Unsupported message flags {:#04x}",
                        flags.0
                    )));
                }
                flags
            }
            other => {
                return Err(TransportError::framing(format!(
                    "Unsupported protocol version {}",
                    other
                )))
            }
        };

        let mut header = MessageHeader::default();
        if sections.contains(MessageFlags::ROUTING_INFO) {
            header.sender_node_id = r.read_node_id()?;
            header.receiver_node_id = r.read_node_id()?;
        }
        if sections.contains(MessageFlags::ENDPOINT_INFO) {
            header.sender_endpoint = r.read_u32()?;
            header.receiver_endpoint = r.read_u32()?;
        }
        header.sender_node_name = r.read_string()?;
        header.receiver_node_name = r.read_string()?;
        header.metadata = r.read_string()?;
        let entry_count = r.read_u16()? as usize;
        header.message_id = r.read_u16()?;
        header.message_res_id = r.read_u16()?;
        r.pop_limit()?;

        let mut entries = Vec::with_capacity(entry_count.min(r.remaining() / 22));
        for _ in 0..entry_count {
            entries.push(MessageEntry::read(&mut r)?);
        }
        if r.remaining() != 0 {
            return Err(TransportError::framing(format!(
                "{} trailing bytes after last entry",
                r.remaining()
            )));
        }
        Ok((Self { header, entries }, FrameInfo { version, sections }))
    }
}
