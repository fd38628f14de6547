//! Column values, row locations and row serialization.
//!
//! Serialized column layout:
//! ```text
//! +---------+----------------------------+
//! | tag (1) | payload (fixed or u32 len) |
//! +---------+----------------------------+
//! ```
//! A row is a u16 column count followed by its columns.

use crate::error::{ArborError, Result};
use crate::types::TypeId;
use bytes::{Buf, BufMut, BytesMut};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// A row is an ordered array of column values.
pub type Row = Vec<Value>;

/// Address of a base-table row: page number plus the page-local record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RowLocation {
    /// Page number in the base container.
    pub page_num: u32,
    /// Record id, stable for the life of the record on its page.
    pub record_id: u32,
}

impl RowLocation {
    /// Creates a new row location.
    pub fn new(page_num: u32, record_id: u32) -> Self {
        Self {
            page_num,
            record_id,
        }
    }
}

impl std::fmt::Display for RowLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.page_num, self.record_id)
    }
}

/// A single typed column value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Varchar(String),
    Varbinary(Vec<u8>),
    RowLocation(RowLocation),
}

impl Value {
    /// Returns the type tag of this value.
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Null => TypeId::Null,
            Value::Boolean(_) => TypeId::Boolean,
            Value::Int16(_) => TypeId::Int16,
            Value::Int32(_) => TypeId::Int32,
            Value::Int64(_) => TypeId::Int64,
            Value::Float64(_) => TypeId::Float64,
            Value::Varchar(_) => TypeId::Varchar,
            Value::Varbinary(_) => TypeId::Varbinary,
            Value::RowLocation(_) => TypeId::RowLocation,
        }
    }

    /// Returns true if this value is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true if this value may be stored in a column of `type_id`.
    /// NULL conforms to every type.
    pub fn conforms_to(&self, type_id: TypeId) -> bool {
        self.is_null() || self.type_id() == type_id
    }

    /// Returns the value as an i64 for any integer variant.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int16(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the contained boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the contained byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Varbinary(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the contained row location.
    pub fn as_row_location(&self) -> Option<RowLocation> {
        match self {
            Value::RowLocation(loc) => Some(*loc),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Total order used by index rows. NULL sorts after every non-null value.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Greater,
            (_, Value::Null) => Ordering::Less,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Varchar(a), Value::Varchar(b)) => a.cmp(b),
            (Value::Varbinary(a), Value::Varbinary(b)) => a.cmp(b),
            (Value::RowLocation(a), Value::RowLocation(b)) => a.cmp(b),
            (a, b) if a.type_id().is_numeric() && b.type_id().is_numeric() => {
                match (a.as_i64(), b.as_i64()) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    _ => {
                        let x = a.as_f64().unwrap_or(f64::NAN);
                        let y = b.as_f64().unwrap_or(f64::NAN);
                        x.total_cmp(&y)
                    }
                }
            }
            (a, b) => (a.type_id() as u8).cmp(&(b.type_id() as u8)),
        }
    }

    /// Returns the number of bytes `write_to` produces.
    pub fn serialized_size(&self) -> usize {
        1 + match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int16(_) => 2,
            Value::Int32(_) => 4,
            Value::Int64(_) | Value::Float64(_) | Value::RowLocation(_) => 8,
            Value::Varchar(s) => 4 + s.len(),
            Value::Varbinary(b) => 4 + b.len(),
        }
    }

    /// Appends the serialized form of this value.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_id() as u8);
        match self {
            Value::Null => {}
            Value::Boolean(v) => buf.put_u8(*v as u8),
            Value::Int16(v) => buf.put_i16_le(*v),
            Value::Int32(v) => buf.put_i32_le(*v),
            Value::Int64(v) => buf.put_i64_le(*v),
            Value::Float64(v) => buf.put_f64_le(*v),
            Value::Varchar(s) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::Varbinary(b) => {
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
            }
            Value::RowLocation(loc) => {
                buf.put_u32_le(loc.page_num);
                buf.put_u32_le(loc.record_id);
            }
        }
    }

    /// Reads one value, advancing the cursor past it.
    pub fn read_from(buf: &mut &[u8]) -> Result<Value> {
        let type_id = TypeId::try_from(take_u8(buf)?)?;
        let value = match type_id {
            TypeId::Null => Value::Null,
            TypeId::Boolean => Value::Boolean(take_u8(buf)? != 0),
            TypeId::Int16 => {
                ensure_remaining(buf, 2)?;
                Value::Int16(buf.get_i16_le())
            }
            TypeId::Int32 => {
                ensure_remaining(buf, 4)?;
                Value::Int32(buf.get_i32_le())
            }
            TypeId::Int64 => {
                ensure_remaining(buf, 8)?;
                Value::Int64(buf.get_i64_le())
            }
            TypeId::Float64 => {
                ensure_remaining(buf, 8)?;
                Value::Float64(buf.get_f64_le())
            }
            TypeId::Varchar => {
                let bytes = take_var(buf)?;
                let s = String::from_utf8(bytes).map_err(|e| ArborError::TypeMismatch {
                    expected: "utf-8 VARCHAR".to_string(),
                    actual: e.to_string(),
                })?;
                Value::Varchar(s)
            }
            TypeId::Varbinary => Value::Varbinary(take_var(buf)?),
            TypeId::RowLocation => {
                ensure_remaining(buf, 8)?;
                let page_num = buf.get_u32_le();
                let record_id = buf.get_u32_le();
                Value::RowLocation(RowLocation::new(page_num, record_id))
            }
        };
        Ok(value)
    }

    /// Advances the cursor past one value without materializing it.
    pub fn skip(buf: &mut &[u8]) -> Result<()> {
        let type_id = TypeId::try_from(take_u8(buf)?)?;
        let len = match type_id.fixed_size() {
            Some(n) => n,
            None => {
                ensure_remaining(buf, 4)?;
                buf.get_u32_le() as usize
            }
        };
        ensure_remaining(buf, len)?;
        buf.advance(len);
        Ok(())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int16(a), Value::Int16(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::Varchar(a), Value::Varchar(b)) => a == b,
            (Value::Varbinary(a), Value::Varbinary(b)) => a == b,
            (Value::RowLocation(a), Value::RowLocation(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.type_id() as u8).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(v) => v.hash(state),
            Value::Int16(v) => v.hash(state),
            Value::Int32(v) => v.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Varchar(s) => s.hash(state),
            Value::Varbinary(b) => b.hash(state),
            Value::RowLocation(loc) => loc.hash(state),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Varchar(s) => write!(f, "'{}'", s),
            Value::Varbinary(b) => write!(f, "x'{}'", hex(b)),
            Value::RowLocation(loc) => write!(f, "{}", loc),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn ensure_remaining(buf: &[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(ArborError::PageCorrupted {
            page_num: 0,
            reason: format!("truncated value: need {} bytes, have {}", n, buf.remaining()),
        });
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_var(buf: &mut &[u8]) -> Result<Vec<u8>> {
    ensure_remaining(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    ensure_remaining(buf, len)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

/// Returns the serialized size of a row.
pub fn row_size(row: &[Value]) -> usize {
    2 + row.iter().map(Value::serialized_size).sum::<usize>()
}

/// Appends the serialized form of a row.
pub fn write_row(row: &[Value], buf: &mut BytesMut) {
    buf.put_u16_le(row.len() as u16);
    for value in row {
        value.write_to(buf);
    }
}

/// Serializes a row into a fresh buffer.
pub fn serialize_row(row: &[Value]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(row_size(row));
    write_row(row, &mut buf);
    buf
}

/// Deserializes a complete row.
pub fn read_row(mut data: &[u8]) -> Result<Row> {
    ensure_remaining(data, 2)?;
    let count = data.get_u16_le() as usize;
    let mut row = Vec::with_capacity(count);
    for _ in 0..count {
        row.push(Value::read_from(&mut data)?);
    }
    Ok(row)
}

/// Deserializes the columns selected by `columns`; unselected columns are NULL.
pub fn read_row_columns(mut data: &[u8], columns: &[bool]) -> Result<Row> {
    ensure_remaining(data, 2)?;
    let count = data.get_u16_le() as usize;
    let mut row = Vec::with_capacity(count);
    for i in 0..count {
        if columns.get(i).copied().unwrap_or(false) {
            row.push(Value::read_from(&mut data)?);
        } else {
            Value::skip(&mut data)?;
            row.push(Value::Null);
        }
    }
    Ok(row)
}

/// Deserializes a single column of a serialized row.
pub fn read_column(mut data: &[u8], column: usize) -> Result<Value> {
    ensure_remaining(data, 2)?;
    let count = data.get_u16_le() as usize;
    if column >= count {
        return Err(ArborError::InvalidParameter {
            name: "column".to_string(),
            value: format!("{} of {}", column, count),
        });
    }
    for _ in 0..column {
        Value::skip(&mut data)?;
    }
    Value::read_from(&mut data)
}

/// Returns the number of columns in a serialized row.
pub fn column_count(data: &[u8]) -> Result<usize> {
    ensure_remaining(data, 2)?;
    Ok(u16::from_le_bytes([data[0], data[1]]) as usize)
}
