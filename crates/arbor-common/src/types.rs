//! Type identifiers for Arbor column values.

use crate::error::{ArborError, Result};
use serde::{Deserialize, Serialize};

/// Identifier for every column type an index row may carry.
///
/// Type IDs are stored as per-column format tags in the index descriptor and
/// as the leading byte of each serialized column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeId {
    // Null type
    Null = 0,

    // Boolean
    Boolean = 1,

    // Integer types
    Int16 = 11,
    Int32 = 12,
    Int64 = 13,

    // Floating point
    Float64 = 31,

    // String types
    Varchar = 51,

    // Binary types
    Varbinary = 61,

    // Base-table row pointer stored as the last column of every index row
    RowLocation = 120,
}

impl TypeId {
    /// Returns the fixed byte size for this type, or None for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            TypeId::Null => Some(0),
            TypeId::Boolean => Some(1),
            TypeId::Int16 => Some(2),
            TypeId::Int32 => Some(4),
            TypeId::Int64 | TypeId::Float64 | TypeId::RowLocation => Some(8),
            TypeId::Varchar | TypeId::Varbinary => None,
        }
    }

    /// Returns true if this type is a numeric type.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            TypeId::Int16 | TypeId::Int32 | TypeId::Int64 | TypeId::Float64
        )
    }
}

impl TryFrom<u8> for TypeId {
    type Error = ArborError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TypeId::Null),
            1 => Ok(TypeId::Boolean),
            11 => Ok(TypeId::Int16),
            12 => Ok(TypeId::Int32),
            13 => Ok(TypeId::Int64),
            31 => Ok(TypeId::Float64),
            51 => Ok(TypeId::Varchar),
            61 => Ok(TypeId::Varbinary),
            120 => Ok(TypeId::RowLocation),
            _ => Err(ArborError::UnsupportedType(format!("type tag {}", value))),
        }
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TypeId::Null => "NULL",
            TypeId::Boolean => "BOOLEAN",
            TypeId::Int16 => "INT16",
            TypeId::Int32 => "INT32",
            TypeId::Int64 => "INT64",
            TypeId::Float64 => "FLOAT64",
            TypeId::Varchar => "VARCHAR",
            TypeId::Varbinary => "VARBINARY",
            TypeId::RowLocation => "ROWLOCATION",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(TypeId::Null.fixed_size(), Some(0));
        assert_eq!(TypeId::Boolean.fixed_size(), Some(1));
        assert_eq!(TypeId::Int16.fixed_size(), Some(2));
        assert_eq!(TypeId::Int32.fixed_size(), Some(4));
        assert_eq!(TypeId::Int64.fixed_size(), Some(8));
        assert_eq!(TypeId::Float64.fixed_size(), Some(8));
        assert_eq!(TypeId::RowLocation.fixed_size(), Some(8));
        assert_eq!(TypeId::Varchar.fixed_size(), None);
        assert_eq!(TypeId::Varbinary.fixed_size(), None);
    }

    #[test]
    fn test_is_numeric() {
        assert!(TypeId::Int16.is_numeric());
        assert!(TypeId::Int32.is_numeric());
        assert!(TypeId::Int64.is_numeric());
        assert!(TypeId::Float64.is_numeric());

        assert!(!TypeId::Boolean.is_numeric());
        assert!(!TypeId::Varchar.is_numeric());
        assert!(!TypeId::RowLocation.is_numeric());
    }

    #[test]
    fn test_try_from_roundtrip() {
        for type_id in [
            TypeId::Null,
            TypeId::Boolean,
            TypeId::Int16,
            TypeId::Int32,
            TypeId::Int64,
            TypeId::Float64,
            TypeId::Varchar,
            TypeId::Varbinary,
            TypeId::RowLocation,
        ] {
            assert_eq!(TypeId::try_from(type_id as u8).unwrap(), type_id);
        }
        assert!(TypeId::try_from(200).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(TypeId::Int64.to_string(), "INT64");
        assert_eq!(TypeId::Varchar.to_string(), "VARCHAR");
        assert_eq!(TypeId::RowLocation.to_string(), "ROWLOCATION");
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = TypeId::RowLocation;
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: TypeId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
