//! Register descriptors and the data model shared by the driver and
//! protocol layers.

use std::fmt;

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ConfigError;

/// Interpretation of a register's contents
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataKind {
    /// Unsigned integer of up to 64 bits, addressed with a bit offset
    Value,
    /// Raw byte sequence of fixed length, always byte-aligned
    ByteArray,
}

/// Software access rights of a register
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    /// Whether this register is software readable or not
    #[must_use]
    pub const fn is_read(&self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// Whether this register is software writable or not
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// Register content: an integer value or a byte sequence, depending on the
/// register's [`DataKind`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegValue {
    Value(u64),
    Bytes(Vec<u8>),
}

impl RegValue {
    #[must_use]
    pub const fn kind(&self) -> DataKind {
        match self {
            Self::Value(_) => DataKind::Value,
            Self::Bytes(_) => DataKind::ByteArray,
        }
    }
}

impl fmt::Display for RegValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v:#x}"),
            Self::Bytes(b) => {
                write!(f, "[{}]", b.iter().map(|byte| format!("{byte:#04x}")).join(" "))
            }
        }
    }
}

impl From<u64> for RegValue {
    fn from(value: u64) -> Self {
        Self::Value(value)
    }
}

impl From<Vec<u8>> for RegValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

/// Describes a single named register of a firmware module.
///
/// `size` counts bits for [`DataKind::Value`] registers and bytes for
/// [`DataKind::ByteArray`] registers. `bit_offset` positions a value
/// register relative to `addr`, most significant bit first. Immutable after
/// construction; [`RegisterDescr::validate`] enforces the invariants at
/// catalog load time.
#[derive(Clone, Debug)]
pub struct RegisterDescr {
    pub kind: DataKind,
    pub access: Access,
    /// Module-local byte address
    pub addr: u32,
    /// Size in bits (value) or bytes (byte array)
    pub size: u32,
    /// Bit offset relative to `addr` (value registers only)
    pub bit_offset: u32,
    /// Built-in default written by `apply_defaults` and triggers
    pub default: Option<RegValue>,
}

impl RegisterDescr {
    /// Checks the descriptor invariants for the register named `name`.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if !is_valid_register_name(name) {
            return Err(ConfigError::InvalidRegisterName(name.to_owned()));
        }
        if self.size == 0 {
            return Err(ConfigError::ZeroRegisterSize(name.to_owned()));
        }
        if self.kind == DataKind::Value && self.size > 64 {
            return Err(ConfigError::ValueRegisterTooWide(name.to_owned()));
        }
        if self.kind == DataKind::ByteArray && self.bit_offset > 0 {
            return Err(ConfigError::ByteArrayWithOffset(name.to_owned()));
        }
        match &self.default {
            None => {}
            Some(_) if self.access == Access::ReadOnly => {
                return Err(ConfigError::DefaultForReadOnly(name.to_owned()));
            }
            Some(value) => {
                if value.kind() != self.kind {
                    return Err(ConfigError::DefaultKindMismatch(name.to_owned()));
                }
                if let RegValue::Bytes(bytes) = value {
                    if bytes.len() != self.size as usize {
                        return Err(ConfigError::DefaultLengthMismatch(name.to_owned()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Checks if a string could be a valid register name.
///
/// Allowed characters are uppercase letters and underscores.
#[must_use]
pub fn is_valid_register_name(name: &str) -> bool {
    lazy_static! {
        static ref REGISTER_NAME_RE: Regex = Regex::new(r"^[A-Z_]+$").unwrap();
    }
    REGISTER_NAME_RE.is_match(name)
}

/// Configuration-facing register definition, as produced by an external
/// configuration loader. Converted into a validated catalog by
/// [`crate::driver::RegisterDriver::new`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegisterSpec {
    pub name: String,
    pub kind: DataKindSpec,
    pub access: AccessSpec,
    pub addr: u32,
    pub size: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub offset: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub default: Option<ValueSpec>,
}

#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DataKindSpec {
    Value,
    ByteArray,
}

#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AccessSpec {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// An unsigned integer or an explicit byte sequence, type-checked against
/// the register's kind at load time
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum ValueSpec {
    Uint(u64),
    Bytes(Vec<u8>),
}

impl From<ValueSpec> for RegValue {
    fn from(spec: ValueSpec) -> Self {
        match spec {
            ValueSpec::Uint(v) => Self::Value(v),
            ValueSpec::Bytes(b) => Self::Bytes(b),
        }
    }
}

impl From<&RegisterSpec> for RegisterDescr {
    fn from(spec: &RegisterSpec) -> Self {
        Self {
            kind: match spec.kind {
                DataKindSpec::Value => DataKind::Value,
                DataKindSpec::ByteArray => DataKind::ByteArray,
            },
            access: match spec.access {
                AccessSpec::ReadOnly => Access::ReadOnly,
                AccessSpec::WriteOnly => Access::WriteOnly,
                AccessSpec::ReadWrite => Access::ReadWrite,
            },
            addr: spec.addr,
            size: spec.size,
            bit_offset: spec.offset,
            default: spec.default.clone().map(RegValue::from),
        }
    }
}

/// Configuration-facing field definition for the hierarchical field model.
///
/// `offset` is the bit index the field's most significant bit has within its
/// parent's range (least significant bit first, as in the register model).
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldSpec {
    pub name: String,
    /// Field size in bits (per repetition if `repeat` is set)
    pub size: u64,
    /// Bit index of the most significant bit within the parent field
    pub offset: u64,
    /// Number of consecutive repetitions; `None` means a single field
    #[cfg_attr(feature = "serde", serde(default))]
    pub repeat: Option<u64>,
    /// Permutation of the field's bits relative to the parent, most
    /// significant field bit index first
    #[cfg_attr(feature = "serde", serde(default))]
    pub bit_order: Option<Vec<u64>>,
    /// Nested sub-fields, fully contained within this field
    #[cfg_attr(feature = "serde", serde(default))]
    pub fields: Vec<FieldSpec>,
}
