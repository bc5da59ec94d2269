//! State values and their wire encoding.
//!
//! A state value is the payload of one interval. On the wire it is a type
//! byte followed by a type-specific body:
//!
//! ```text
//! 0xFF  Null      (no body)
//! 0x00  Int32     4 bytes LE
//! 0x01  Str       u16 LE length, UTF-8 bytes, trailing 0x00
//! 0x02  Int64     8 bytes LE
//! 0x03  Float64   8 bytes LE (IEEE 754)
//! 0x14  Custom    u16 LE length, opaque bytes
//! ```
//!
//! String and custom payloads are capped at 32 767 bytes so their length
//! always fits the u16 prefix with the sign bit clear.

use crate::error::{HistoryError, Result};
use std::io::{Read, Write};

/// Type byte for a null value.
const TYPE_NULL: u8 = 0xFF;
/// Type byte for a 32-bit integer.
const TYPE_INT32: u8 = 0x00;
/// Type byte for a UTF-8 string.
const TYPE_STRING: u8 = 0x01;
/// Type byte for a 64-bit integer.
const TYPE_INT64: u8 = 0x02;
/// Type byte for a 64-bit float.
const TYPE_FLOAT64: u8 = 0x03;
/// Type byte for an opaque custom payload.
const TYPE_CUSTOM: u8 = 0x14;

/// Maximum encoded length of a string or custom payload, in bytes.
pub const MAX_PAYLOAD_LEN: usize = i16::MAX as usize;

/// The value an attribute holds over one interval.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    /// No value.
    Null,
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    Str(String),
    /// Opaque payload interpreted by the state provider.
    Custom(Vec<u8>),
}

impl StateValue {
    /// Returns true if this is the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// Returns the number of bytes this value occupies on the wire,
    /// including the type byte.
    pub fn encoded_len(&self) -> usize {
        match self {
            StateValue::Null => 1,
            StateValue::Int32(_) => 1 + 4,
            StateValue::Int64(_) | StateValue::Float64(_) => 1 + 8,
            // length prefix + bytes + trailing NUL
            StateValue::Str(s) => 1 + 2 + s.len() + 1,
            StateValue::Custom(b) => 1 + 2 + b.len(),
        }
    }

    /// Writes the value to `writer`.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::ValueTooLarge` if a string or custom payload
    /// exceeds [`MAX_PAYLOAD_LEN`].
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            StateValue::Null => writer.write_all(&[TYPE_NULL])?,
            StateValue::Int32(v) => {
                writer.write_all(&[TYPE_INT32])?;
                writer.write_all(&v.to_le_bytes())?;
            }
            StateValue::Int64(v) => {
                writer.write_all(&[TYPE_INT64])?;
                writer.write_all(&v.to_le_bytes())?;
            }
            StateValue::Float64(v) => {
                writer.write_all(&[TYPE_FLOAT64])?;
                writer.write_all(&v.to_le_bytes())?;
            }
            StateValue::Str(s) => {
                if s.len() > MAX_PAYLOAD_LEN {
                    return Err(HistoryError::ValueTooLarge(s.len()));
                }
                writer.write_all(&[TYPE_STRING])?;
                writer.write_all(&(s.len() as u16).to_le_bytes())?;
                writer.write_all(s.as_bytes())?;
                writer.write_all(&[0u8])?;
            }
            StateValue::Custom(b) => {
                if b.len() > MAX_PAYLOAD_LEN {
                    return Err(HistoryError::ValueTooLarge(b.len()));
                }
                writer.write_all(&[TYPE_CUSTOM])?;
                writer.write_all(&(b.len() as u16).to_le_bytes())?;
                writer.write_all(b)?;
            }
        }
        Ok(())
    }

    /// Reads one value from `reader`.
    ///
    /// # Errors
    ///
    /// Returns `HistoryError::UnknownValueType` for an unrecognised type byte
    /// and `HistoryError::Corrupt` for a malformed body.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut type_byte = [0u8; 1];
        reader.read_exact(&mut type_byte)?;
        match type_byte[0] {
            TYPE_NULL => Ok(StateValue::Null),
            TYPE_INT32 => {
                let mut buf = [0u8; 4];
                reader.read_exact(&mut buf)?;
                Ok(StateValue::Int32(i32::from_le_bytes(buf)))
            }
            TYPE_INT64 => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                Ok(StateValue::Int64(i64::from_le_bytes(buf)))
            }
            TYPE_FLOAT64 => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                Ok(StateValue::Float64(f64::from_le_bytes(buf)))
            }
            TYPE_STRING => {
                let mut len_buf = [0u8; 2];
                reader.read_exact(&mut len_buf)?;
                let len = u16::from_le_bytes(len_buf) as usize;
                if len > MAX_PAYLOAD_LEN {
                    return Err(HistoryError::ValueTooLarge(len));
                }
                let mut bytes = vec![0u8; len];
                reader.read_exact(&mut bytes)?;
                let s = String::from_utf8(bytes)
                    .map_err(|e| HistoryError::Corrupt(format!("invalid UTF-8 string: {e}")))?;
                let mut nul = [0u8; 1];
                reader.read_exact(&mut nul)?;
                if nul[0] != 0 {
                    return Err(HistoryError::Corrupt(
                        "missing string terminator".to_string(),
                    ));
                }
                Ok(StateValue::Str(s))
            }
            TYPE_CUSTOM => {
                let mut len_buf = [0u8; 2];
                reader.read_exact(&mut len_buf)?;
                let len = u16::from_le_bytes(len_buf) as usize;
                if len > MAX_PAYLOAD_LEN {
                    return Err(HistoryError::ValueTooLarge(len));
                }
                let mut bytes = vec![0u8; len];
                reader.read_exact(&mut bytes)?;
                Ok(StateValue::Custom(bytes))
            }
            other => Err(HistoryError::UnknownValueType(other)),
        }
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        StateValue::Str(s.to_string())
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        StateValue::Int32(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Int64(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Float64(v)
    }
}
