//! Element type tags.
//!
//! Codes 0-14 are scalar array types, codes from 101 up are containers.
//! A handful of codes only exist in memory (object references, variant
//! holders, enums, named-type definitions) and are rejected by the codec.

use crate::error::{Result, TransportError};

/// Closed set of element type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DataTypes {
    Void = 0,
    Double = 1,
    Single = 2,
    Int8 = 3,
    UInt8 = 4,
    Int16 = 5,
    UInt16 = 6,
    Int32 = 7,
    UInt32 = 8,
    Int64 = 9,
    UInt64 = 10,
    String = 11,
    CDouble = 12,
    CSingle = 13,
    Bool = 14,
    Structure = 101,
    /// Map keyed by int32.
    Vector = 102,
    /// Map keyed by string.
    Dictionary = 103,
    Object = 104,
    VarValue = 105,
    VarObject = 106,
    List = 108,
    Pod = 109,
    PodArray = 110,
    PodMultiDimArray = 111,
    Enum = 112,
    NamedType = 113,
    NamedArray = 114,
    NamedArrayArray = 115,
    NamedArrayMultiDimArray = 116,
    MultiDimArray = 117,
}

impl DataTypes {
    /// Decode a wire type code.
    pub fn from_code(code: u16) -> Result<Self> {
        use DataTypes::*;
        let t = match code {
            0 => Void,
            1 => Double,
            2 => Single,
            3 => Int8,
            4 => UInt8,
            5 => Int16,
            6 => UInt16,
            7 => Int32,
            8 => UInt32,
            9 => Int64,
            10 => UInt64,
            11 => String,
            12 => CDouble,
            13 => CSingle,
            14 => Bool,
            101 => Structure,
            102 => Vector,
            103 => Dictionary,
            104 => Object,
            105 => VarValue,
            106 => VarObject,
            108 => List,
            109 => Pod,
            110 => PodArray,
            111 => PodMultiDimArray,
            112 => Enum,
            113 => NamedType,
            114 => NamedArray,
            115 => NamedArrayArray,
            116 => NamedArrayMultiDimArray,
            117 => MultiDimArray,
            other => {
                return Err(TransportError::framing(format!(
                    "Unknown element type code {}",
                    other
                )))
            }
        };
        Ok(t)
    }

    /// Wire type code.
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Byte size of one array element, `None` for non-numeric types.
    pub fn element_size(self) -> Option<usize> {
        use DataTypes::*;
        match self {
            Void => Some(0),
            Double => Some(8),
            Single => Some(4),
            Int8 | UInt8 | Bool => Some(1),
            Int16 | UInt16 => Some(2),
            Int32 | UInt32 => Some(4),
            Int64 | UInt64 => Some(8),
            CDouble => Some(16),
            CSingle => Some(8),
            _ => None,
        }
    }

    /// Flat numeric or boolean array type.
    #[inline]
    pub fn is_number(self) -> bool {
        self.element_size().is_some() && self != DataTypes::Void
    }

    /// Type whose payload is a list of child elements.
    pub fn is_container(self) -> bool {
        use DataTypes::*;
        matches!(
            self,
            Structure
                | Vector
                | Dictionary
                | List
                | Pod
                | PodArray
                | PodMultiDimArray
                | NamedArray
                | NamedArrayArray
                | NamedArrayMultiDimArray
                | MultiDimArray
        )
    }

    /// Marker types that exist only in memory and never reach the wire.
    pub fn is_serializable(self) -> bool {
        use DataTypes::*;
        !matches!(self, Object | VarValue | VarObject | Enum | NamedType)
    }
}
