//! One request, response or packet inside a message.
//!
//! ```text
//! EntrySize u32 | EntryType u16 | reserved u16 | ServicePath str
//! | MemberName str | RequestID u32 | Error u16 | MetaData str
//! | ElementCount u16 | elements...
//! ```

use crate::error::{Result, TransportError};

use super::binary::{string_size, WireReader, WireWriter};
use super::element::MessageElement;
use super::entry_type::{MessageEntryType, MessageErrorType};

/// Smallest possible encoded entry (all strings empty, no elements).
pub const ENTRY_MIN_SIZE: usize = 4 + 2 + 2 + 2 + 2 + 4 + 2 + 2 + 2;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageEntry {
    pub entry_type: MessageEntryType,
    pub service_path: String,
    pub member_name: String,
    /// Correlates a request with its response.
    pub request_id: u32,
    pub error: MessageErrorType,
    pub metadata: String,
    pub elements: Vec<MessageElement>,
}

impl MessageEntry {
    /// Create an entry with no elements.
    pub fn new(entry_type: MessageEntryType, member_name: impl Into<String>) -> Self {
        Self {
            entry_type,
            member_name: member_name.into(),
            ..Default::default()
        }
    }

    /// Builder-style element append.
    pub fn with_element(mut self, element: MessageElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn with_service_path(mut self, path: impl Into<String>) -> Self {
        self.service_path = path.into();
        self
    }

    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn add_element(&mut self, element: MessageElement) {
        self.elements.push(element);
    }

    /// Find an element by name.
    pub fn find_element(&self, name: &str) -> Option<&MessageElement> {
        self.elements.iter().find(|e| e.element_name == name)
    }

    /// Find an element by name, failing with a protocol error when absent.
    pub fn require_element(&self, name: &str) -> Result<&MessageElement> {
        self.find_element(name).ok_or_else(|| {
            TransportError::protocol(format!(
                "Entry {} '{}' is missing element '{}'",
                self.entry_type, self.member_name, name
            ))
        })
    }

    /// Empty reply to this entry (`type + 1`, same path, member and request id).
    pub fn reply(&self) -> MessageEntry {
        MessageEntry {
            entry_type: self.entry_type.response_type(),
            service_path: self.service_path.clone(),
            member_name: self.member_name.clone(),
            request_id: self.request_id,
            ..Default::default()
        }
    }

    /// Error reply carrying `errorname` and `errorstring` elements.
    pub fn error_reply(&self, error: MessageErrorType, message: impl Into<String>) -> MessageEntry {
        let mut reply = self.reply();
        reply.error = error;
        reply.add_element(MessageElement::string("errorname", error.name()));
        reply.add_element(MessageElement::string("errorstring", message));
        reply
    }

    /// Convert an error reply into a `TransportError::Remote`.
    pub fn check_error(&self) -> Result<()> {
        if self.error == MessageErrorType::None {
            return Ok(());
        }
        let name = self
            .find_element("errorname")
            .and_then(MessageElement::as_str)
            .unwrap_or(self.error.name())
            .to_string();
        let message = self
            .find_element("errorstring")
            .and_then(MessageElement::as_str)
            .unwrap_or_default()
            .to_string();
        Err(TransportError::Remote {
            code: self.error.code(),
            name,
            message,
        })
    }

    /// Exact encoded size in bytes.
    pub fn compute_size(&self) -> usize {
        // EntrySize + EntryType + reserved + RequestID + Error + ElementCount
        4 + 2 + 2 + 4 + 2 + 2
            + string_size(&self.service_path)
            + string_size(&self.member_name)
            + string_size(&self.metadata)
            + self.elements.iter().map(|e| e.compute_size()).sum::<usize>()
    }

    pub fn write(&self, w: &mut WireWriter<'_>) -> Result<()> {
        let count = u16::try_from(self.elements.len()).map_err(|_| {
            TransportError::protocol(format!("{} elements exceed 65535", self.elements.len()))
        })?;
        let size = self.compute_size();
        w.write_len_u32(size)?;
        w.push_relative_limit(size - 4)?;
        w.write_u16(self.entry_type.code())?;
        w.write_u16(0)?;
        w.write_string(&self.service_path)?;
        w.write_string(&self.member_name)?;
        w.write_u32(self.request_id)?;
        w.write_u16(self.error.code())?;
        w.write_string(&self.metadata)?;
        w.write_u16(count)?;
        for element in &self.elements {
            element.write(w)?;
        }
        w.pop_limit()
    }

    pub fn read(r: &mut WireReader<'_>) -> Result<Self> {
        let size = r.read_u32()? as usize;
        if size < ENTRY_MIN_SIZE {
            return Err(TransportError::framing(format!(
                "Entry size {} below minimum {}",
                size, ENTRY_MIN_SIZE
            )));
        }
        r.push_relative_limit(size - 4)?;
        let entry_type = MessageEntryType(r.read_u16()?);
        let _reserved = r.read_u16()?;
        let service_path = r.read_string()?;
        let member_name = r.read_string()?;
        let request_id = r.read_u32()?;
        let error = MessageErrorType::from_code(r.read_u16()?);
        let metadata = r.read_string()?;
        let count = r.read_u16()? as usize;
        let mut elements = Vec::with_capacity(count.min(r.remaining() / 16));
        for _ in 0..count {
            elements.push(MessageElement::read(r)?);
        }
        r.pop_limit()?;
        Ok(Self {
            entry_type,
            service_path,
            member_name,
            request_id,
            error,
            metadata,
            elements,
        })
    }
}
