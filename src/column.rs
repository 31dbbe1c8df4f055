//! Column metadata: data types and merge rules.
//!
//! Modeled as small `#[repr(u8)]` enums the way the teacher models
//! `IType` (`src/kernel/stat.rs`) and `Major` (`src/kernel/file.rs`) —
//! tiny closed sets read straight out of a wire byte.

use crate::error::{Result, TmstatError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Signed = 0,
    Unsigned = 1,
    Text = 2,
    Bin = 3,
    Dec = 4,
    Hex = 5,
    Hidden = 6,
}

impl DataType {
    pub fn from_wire(v: u8) -> Result<Self> {
        Ok(match v {
            0 => DataType::Signed,
            1 => DataType::Unsigned,
            2 => DataType::Text,
            3 => DataType::Bin,
            4 => DataType::Dec,
            5 => DataType::Hex,
            6 => DataType::Hidden,
            _ => return Err(TmstatError::corrupt(format!("bad data type byte {v}"))),
        })
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MergeRule {
    Key = 0,
    Or = 1,
    Sum = 2,
    Min = 3,
    Max = 4,
}

impl MergeRule {
    pub fn from_wire(v: u8) -> Result<Self> {
        Ok(match v {
            0 => MergeRule::Key,
            1 => MergeRule::Or,
            2 => MergeRule::Sum,
            3 => MergeRule::Min,
            4 => MergeRule::Max,
            _ => return Err(TmstatError::corrupt(format!("bad merge rule byte {v}"))),
        })
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

/// In-memory column descriptor, duplicated by the table handle at
/// registration time per the original's "duplicates the column
/// descriptors internally."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub table_id: u16,
    pub offset: u16,
    pub size: u16,
    pub data_type: DataType,
    pub rule: MergeRule,
}

/// Caller-supplied column specification passed to table registration.
/// Byte offset is assigned by the table handle in declaration order.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: DataType,
    pub size: u16,
    pub rule: MergeRule,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: DataType, size: u16, rule: MergeRule) -> Self {
        Self {
            name: name.into(),
            data_type,
            size,
            rule,
        }
    }

    pub fn key(name: impl Into<String>, data_type: DataType, size: u16) -> Self {
        Self::new(name, data_type, size, MergeRule::Key)
    }
}

/// Column names begin with a lowercase letter or digit (§3 invariant).
pub fn validate_column_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= crate::wire::NAME_LEN {
        return Err(TmstatError::invalid(format!(
            "column name '{name}' has invalid length"
        )));
    }
    let first = name.as_bytes()[0];
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return Err(TmstatError::invalid(format!(
            "column name '{name}' must start with a lowercase letter or digit"
        )));
    }
    if name.bytes().any(|b| b == 0 || b == b'/') {
        return Err(TmstatError::invalid(format!(
            "column name '{name}' contains an illegal byte"
        )));
    }
    Ok(())
}
