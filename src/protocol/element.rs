//! Named, typed values carried by entries.
//!
//! Element layout:
//! ```text
//! ElementSize u32 | ElementName str | ElementType u16 | ElementTypeName str
//! | MetaData str | DataCount u32 | payload
//! ```
//! Numeric payloads are little-endian arrays of `DataCount` items, strings
//! are `DataCount` UTF-8 bytes, containers are `DataCount` child elements
//! each fully self-describing.

use crate::error::{Result, TransportError};

use super::binary::{string_size, WireReader, WireWriter};
use super::data_types::DataTypes;

/// Fixed part of an element: size, type, data count and three string prefixes.
const ELEMENT_FIXED_SIZE: usize = 4 + 2 + 2 + 2 + 2 + 4;

/// Containers nested deeper than this are rejected on decode.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Complex number of two doubles.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex64 {
    pub real: f64,
    pub imag: f64,
}

/// Complex number of two singles.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex32 {
    pub real: f32,
    pub imag: f32,
}

/// Element payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementData {
    Void,
    Double(Vec<f64>),
    Single(Vec<f32>),
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    String(String),
    CDouble(Vec<Complex64>),
    CSingle(Vec<Complex32>),
    Bool(Vec<bool>),
    /// Child elements of a container type.
    Nested(Vec<MessageElement>),
}

impl ElementData {
    /// Type tag implied by a non-container payload.
    pub fn scalar_type(&self) -> Option<DataTypes> {
        let t = match self {
            ElementData::Void => DataTypes::Void,
            ElementData::Double(_) => DataTypes::Double,
            ElementData::Single(_) => DataTypes::Single,
            ElementData::Int8(_) => DataTypes::Int8,
            ElementData::UInt8(_) => DataTypes::UInt8,
            ElementData::Int16(_) => DataTypes::Int16,
            ElementData::UInt16(_) => DataTypes::UInt16,
            ElementData::Int32(_) => DataTypes::Int32,
            ElementData::UInt32(_) => DataTypes::UInt32,
            ElementData::Int64(_) => DataTypes::Int64,
            ElementData::UInt64(_) => DataTypes::UInt64,
            ElementData::String(_) => DataTypes::String,
            ElementData::CDouble(_) => DataTypes::CDouble,
            ElementData::CSingle(_) => DataTypes::CSingle,
            ElementData::Bool(_) => DataTypes::Bool,
            ElementData::Nested(_) => return None,
        };
        Some(t)
    }

    /// Wire `DataCount`: items, string bytes, or child count.
    pub fn data_count(&self) -> usize {
        match self {
            ElementData::Void => 0,
            ElementData::Double(v) => v.len(),
            ElementData::Single(v) => v.len(),
            ElementData::Int8(v) => v.len(),
            ElementData::UInt8(v) => v.len(),
            ElementData::Int16(v) => v.len(),
            ElementData::UInt16(v) => v.len(),
            ElementData::Int32(v) => v.len(),
            ElementData::UInt32(v) => v.len(),
            ElementData::Int64(v) => v.len(),
            ElementData::UInt64(v) => v.len(),
            ElementData::String(s) => s.len(),
            ElementData::CDouble(v) => v.len(),
            ElementData::CSingle(v) => v.len(),
            ElementData::Bool(v) => v.len(),
            ElementData::Nested(v) => v.len(),
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            ElementData::String(s) => s.len(),
            ElementData::Nested(children) => children.iter().map(|c| c.compute_size()).sum(),
            other => {
                let width = other
                    .scalar_type()
                    .and_then(DataTypes::element_size)
                    .unwrap_or(0);
                other.data_count() * width
            }
        }
    }
}

/// One named, typed value.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageElement {
    pub element_name: String,
    pub element_type: DataTypes,
    /// Qualified name of a user-defined type, empty for plain values.
    pub element_type_name: String,
    pub metadata: String,
    pub data: ElementData,
}

impl MessageElement {
    /// Create a scalar, string or void element; the type tag follows the payload.
    ///
    /// Nested payloads get `DataTypes::Structure`; use [`MessageElement::nested`]
    /// for other container kinds.
    pub fn new(name: impl Into<String>, data: ElementData) -> Self {
        let element_type = data.scalar_type().unwrap_or(DataTypes::Structure);
        Self {
            element_name: name.into(),
            element_type,
            element_type_name: String::new(),
            metadata: String::new(),
            data,
        }
    }

    /// Create a container element of the given kind.
    pub fn nested(
        name: impl Into<String>,
        kind: DataTypes,
        type_name: impl Into<String>,
        children: Vec<MessageElement>,
    ) -> Self {
        Self {
            element_name: name.into(),
            element_type: kind,
            element_type_name: type_name.into(),
            metadata: String::new(),
            data: ElementData::Nested(children),
        }
    }

    /// String element.
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, ElementData::String(value.into()))
    }

    /// Single uint32 element.
    pub fn u32(name: impl Into<String>, value: u32) -> Self {
        Self::new(name, ElementData::UInt32(vec![value]))
    }

    /// Wire `DataCount`.
    #[inline]
    pub fn data_count(&self) -> usize {
        self.data.data_count()
    }

    /// Exact encoded size in bytes.
    pub fn compute_size(&self) -> usize {
        // ElementSize + ElementType + DataCount, then the three strings.
        4 + 2 + 4
            + string_size(&self.element_name)
            + string_size(&self.element_type_name)
            + string_size(&self.metadata)
            + self.data.payload_size()
    }

    /// Check that the type tag agrees with the payload.
    pub fn validate(&self) -> Result<()> {
        if !self.element_type.is_serializable() {
            return Err(TransportError::protocol(format!(
                "Element '{}' has non-serializable type {:?}",
                self.element_name, self.element_type
            )));
        }
        match (&self.data, self.data.scalar_type()) {
            (ElementData::Nested(_), None) if self.element_type.is_container() => Ok(()),
            (_, Some(t)) if t == self.element_type => Ok(()),
            _ => Err(TransportError::protocol(format!(
                "Element '{}' type {:?} does not match its payload",
                self.element_name, self.element_type
            ))),
        }
    }

    /// Write this element.
    pub fn write(&self, w: &mut WireWriter<'_>) -> Result<()> {
        self.validate()?;
        let size = self.compute_size();
        w.write_len_u32(size)?;
        w.push_relative_limit(size - 4)?;
        w.write_string(&self.element_name)?;
        w.write_u16(self.element_type.code())?;
        w.write_string(&self.element_type_name)?;
        w.write_string(&self.metadata)?;
        w.write_len_u32(self.data_count())?;
        write_payload(w, &self.data)?;
        w.pop_limit()
    }

    /// Read one element.
    pub fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Self::read_nested(r, 0)
    }

    fn read_nested(r: &mut WireReader<'_>, depth: usize) -> Result<Self> {
        if depth > MAX_NESTING_DEPTH {
            return Err(TransportError::framing(format!(
                "Element nesting exceeds {} levels",
                MAX_NESTING_DEPTH
            )));
        }
        let size = r.read_u32()? as usize;
        if size < ELEMENT_FIXED_SIZE {
            return Err(TransportError::framing(format!(
                "Element size {} below minimum {}",
                size, ELEMENT_FIXED_SIZE
            )));
        }
        r.push_relative_limit(size - 4)?;
        let element_name = r.read_string()?;
        let element_type = DataTypes::from_code(r.read_u16()?)?;
        let element_type_name = r.read_string()?;
        let metadata = r.read_string()?;
        let count = r.read_u32()? as usize;
        let data = read_payload(r, element_type, count, depth)?;
        r.pop_limit()?;
        Ok(Self {
            element_name,
            element_type,
            element_type_name,
            metadata,
            data,
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            ElementData::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32_slice(&self) -> Option<&[u32]> {
        match &self.data {
            ElementData::UInt32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u8_slice(&self) -> Option<&[u8]> {
        match &self.data {
            ElementData::UInt8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        match &self.data {
            ElementData::Double(v) => Some(v),
            _ => None,
        }
    }

    /// Child elements of a container.
    pub fn children(&self) -> Option<&[MessageElement]> {
        match &self.data {
            ElementData::Nested(v) => Some(v),
            _ => None,
        }
    }

    /// Find a child element by name.
    pub fn find_child(&self, name: &str) -> Option<&MessageElement> {
        self.children()?.iter().find(|c| c.element_name == name)
    }
}

macro_rules! write_le {
    ($w:expr, $v:expr) => {
        for x in $v {
            $w.write_raw(&x.to_le_bytes())?;
        }
    };
}

fn write_payload(w: &mut WireWriter<'_>, data: &ElementData) -> Result<()> {
    match data {
        ElementData::Void => {}
        ElementData::Double(v) => write_le!(w, v),
        ElementData::Single(v) => write_le!(w, v),
        ElementData::Int8(v) => write_le!(w, v),
        ElementData::UInt8(v) => w.write_raw(v)?,
        ElementData::Int16(v) => write_le!(w, v),
        ElementData::UInt16(v) => write_le!(w, v),
        ElementData::Int32(v) => write_le!(w, v),
        ElementData::UInt32(v) => write_le!(w, v),
        ElementData::Int64(v) => write_le!(w, v),
        ElementData::UInt64(v) => write_le!(w, v),
        ElementData::String(s) => w.write_raw(s.as_bytes())?,
        ElementData::CDouble(v) => {
            for c in v {
                w.write_raw(&c.real.to_le_bytes())?;
                w.write_raw(&c.imag.to_le_bytes())?;
            }
        }
        ElementData::CSingle(v) => {
            for c in v {
                w.write_raw(&c.real.to_le_bytes())?;
                w.write_raw(&c.imag.to_le_bytes())?;
            }
        }
        ElementData::Bool(v) => {
            for b in v {
                w.write_u8(u8::from(*b))?;
            }
        }
        ElementData::Nested(children) => {
            for child in children {
                child.write(w)?;
            }
        }
    }
    Ok(())
}

macro_rules! read_le {
    ($r:expr, $count:expr, $ty:ty) => {{
        const W: usize = std::mem::size_of::<$ty>();
        $r.take_items($count, W)?
            .chunks_exact(W)
            .map(|c| {
                let mut b = [0u8; W];
                b.copy_from_slice(c);
                <$ty>::from_le_bytes(b)
            })
            .collect::<Vec<$ty>>()
    }};
}

fn read_payload(
    r: &mut WireReader<'_>,
    element_type: DataTypes,
    count: usize,
    depth: usize,
) -> Result<ElementData> {
    if !element_type.is_serializable() {
        return Err(TransportError::framing(format!(
            "Element type {:?} cannot appear on the wire",
            element_type
        )));
    }

    if element_type == DataTypes::Void && count != 0 {
        return Err(TransportError::framing(format!(
            "Void element declares DataCount {}",
            count
        )));
    }

    if let Some(width) = element_type.element_size() {
        // Numeric payloads must fill the element region exactly.
        let expected = count.checked_mul(width);
        if expected != Some(r.remaining()) {
            return Err(TransportError::framing(format!(
                "DataCount {} of {:?} does not match {} payload bytes",
                count,
                element_type,
                r.remaining()
            )));
        }
    }

    let data = match element_type {
        DataTypes::Void => ElementData::Void,
        DataTypes::Double => ElementData::Double(read_le!(r, count, f64)),
        DataTypes::Single => ElementData::Single(read_le!(r, count, f32)),
        DataTypes::Int8 => ElementData::Int8(read_le!(r, count, i8)),
        DataTypes::UInt8 => ElementData::UInt8(r.take_items(count, 1)?.to_vec()),
        DataTypes::Int16 => ElementData::Int16(read_le!(r, count, i16)),
        DataTypes::UInt16 => ElementData::UInt16(read_le!(r, count, u16)),
        DataTypes::Int32 => ElementData::Int32(read_le!(r, count, i32)),
        DataTypes::UInt32 => ElementData::UInt32(read_le!(r, count, u32)),
        DataTypes::Int64 => ElementData::Int64(read_le!(r, count, i64)),
        DataTypes::UInt64 => ElementData::UInt64(read_le!(r, count, u64)),
        DataTypes::CDouble => {
            let flat = read_le!(r, count * 2, f64);
            ElementData::CDouble(
                flat.chunks_exact(2)
                    .map(|p| Complex64 { real: p[0], imag: p[1] })
                    .collect(),
            )
        }
        DataTypes::CSingle => {
            let flat = read_le!(r, count * 2, f32);
            ElementData::CSingle(
                flat.chunks_exact(2)
                    .map(|p| Complex32 { real: p[0], imag: p[1] })
                    .collect(),
            )
        }
        DataTypes::Bool => ElementData::Bool(r.take_items(count, 1)?.iter().map(|b| *b != 0).collect()),
        DataTypes::String => {
            if count != r.remaining() {
                return Err(TransportError::framing(format!(
                    "String DataCount {} does not match {} payload bytes",
                    count,
                    r.remaining()
                )));
            }
            ElementData::String(r.read_utf8(count)?)
        }
        _ => {
            // Every child takes at least the fixed element size.
            if count.saturating_mul(ELEMENT_FIXED_SIZE) > r.remaining() {
                return Err(TransportError::framing(format!(
                    "Container declares {} children but only {} bytes remain",
                    count,
                    r.remaining()
                )));
            }
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                children.push(MessageElement::read_nested(r, depth + 1)?);
            }
            ElementData::Nested(children)
        }
    };
    Ok(data)
}
