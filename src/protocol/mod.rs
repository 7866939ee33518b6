//! Protocol module - binary wire codec.
//!
//! Pure, per-call encode/decode of `MessageElement → MessageEntry → Message`
//! and back. No I/O and no shared state:
//! - `RRAC` framing with version 2 and version 4 headers
//! - length-scoped regions verified on both write and read
//! - recursive container elements

mod binary;
mod data_types;
mod element;
mod entry;
mod entry_type;
mod message;
mod node_id;

pub use binary::{string_size, WireReader, WireWriter};
pub use data_types::DataTypes;
pub use element::{Complex32, Complex64, ElementData, MessageElement, MAX_NESTING_DEPTH};
pub use entry::{MessageEntry, ENTRY_MIN_SIZE};
pub use entry_type::{MessageEntryType, MessageErrorType};
pub use message::{
    peek_frame_prefix, FrameInfo, FramePrefix, Message, MessageFlags, MessageHeader, WireFormat,
    DEFAULT_MAX_MESSAGE_SIZE, FRAME_PREFIX_SIZE, HEADER_V2_FIXED_SIZE, JUMBO_MESSAGE_SIZE, MAGIC,
    MIN_MESSAGE_SIZE, PROTOCOL_VERSION_2, PROTOCOL_VERSION_4,
};
pub use node_id::{NodeId, NODE_ID_SIZE};
