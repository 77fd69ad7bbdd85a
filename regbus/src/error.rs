//! Error types for the register, field and protocol layers

use thiserror::Error;

use crate::model::DataKind;

/// Top-level error returned by the driver-facing API
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("rejected operation")]
    Access(#[from] AccessError),
    /// Transport failure with the register it occurred on
    #[error("transport failure on register {register:?}")]
    Transport {
        register: String,
        #[source]
        source: TransportError,
    },
}

/// Construction-time misconfiguration. Never retried; aborts device setup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid name for register {0:?}: must contain only uppercase letters and underscores")]
    InvalidRegisterName(String),
    #[error("size is zero for register {0:?}")]
    ZeroRegisterSize(String),
    #[error("size exceeds 64 bits for value register {0:?}")]
    ValueRegisterTooWide(String),
    #[error("bit offset is non-zero for byte array register {0:?}")]
    ByteArrayWithOffset(String),
    #[error("default value set for read-only register {0:?}")]
    DefaultForReadOnly(String),
    #[error("default value type does not match data kind for register {0:?}")]
    DefaultKindMismatch(String),
    #[error("default byte sequence length does not match size of register {0:?}")]
    DefaultLengthMismatch(String),
    #[error("init value set for read-only register {0:?}")]
    InitForReadOnly(String),
    #[error("init value type does not match data kind for register {0:?}")]
    InitKindMismatch(String),
    #[error("init byte sequence length does not match size of register {0:?}")]
    InitLengthMismatch(String),
    #[error("register {0:?} is defined multiple times")]
    DuplicateRegister(String),
    #[error("invalid name for field {0:?}: must be non-empty, without '.' and not start with '#'")]
    InvalidFieldName(String),
    #[error("field {0:?} is defined multiple times within its group")]
    DuplicateFieldName(String),
    #[error("size is zero for field {0:?}")]
    ZeroFieldSize(String),
    #[error("repeat count is zero for field {0:?}")]
    ZeroRepeat(String),
    #[error("field {0:?} exceeds its parent field's extent")]
    FieldExceedsParent(String),
    #[error("invalid bit order for field {name:?}: {reason}")]
    InvalidBitOrder { name: String, reason: String },
    #[error("register size is zero")]
    ZeroRegister,
    #[error("init entry {path:?} does not match any field")]
    UnknownInitField { path: String },
    #[error("init bit sequence for field {path:?} has length {actual}, field size is {expected}")]
    InitBitLengthMismatch {
        path: String,
        expected: u64,
        actual: usize,
    },
}

/// Addressing or usage error, surfaced immediately to the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("register {register:?} is not available for driver {driver:?}")]
    NoSuchRegister { driver: String, register: String },
    #[error("cannot access register {register:?} as {requested:?}: data kind is {actual:?}")]
    KindMismatch {
        register: String,
        requested: DataKind,
        actual: DataKind,
    },
    #[error("cannot write to read-only register {0:?}")]
    NotWritable(String),
    #[error("cannot trigger register {0:?}: only available for write-only registers")]
    NotTriggerable(String),
    #[error("wrong data length for register {register:?}: expected {expected}, got {actual}")]
    WrongDataLength {
        register: String,
        expected: usize,
        actual: usize,
    },
    #[error("field {path:?} is not available")]
    NoSuchField { path: String },
    #[error("field {path:?} has no repetitions")]
    NoRepetitions { path: String },
    #[error("repetition {index} out of range for field {path:?} ({count} repetitions)")]
    RepetitionOutOfRange {
        path: String,
        index: usize,
        count: usize,
    },
    #[error("bit index {index} exceeds field size {size}")]
    BitIndexOutOfRange { index: usize, size: u64 },
    #[error("duplicate bit index {0} in selection")]
    DuplicateSelectionIndex(usize),
    #[error("empty bit selection")]
    EmptySelection,
    #[error("field is {size} bits wide, cannot convert to a 64-bit value")]
    FieldTooWide { size: u64 },
    #[error("bit sequence length {actual} does not match field size {expected}")]
    WrongBitLength { expected: u64, actual: usize },
    #[error("invalid slice bounds: msb {msb} < lsb {lsb}")]
    InvalidSlice { msb: usize, lsb: usize },
}

/// Wire-level fault of a byte transport or socket link
#[derive(Error, Debug)]
pub enum TransportError {
    /// A blocking socket operation expired; retryable where a retry budget
    /// applies.
    #[error("operation timed out")]
    Timeout,
    #[error("i/o failure")]
    Io(#[from] std::io::Error),
    /// The transport returned fewer bytes than requested. Indicates a
    /// misbehaving device rather than a transient fault.
    #[error("read wrong number of bytes: expected {expected}, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("protocol failure")]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Unsupported(&'static str),
}

/// RBCP exchange validation failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("requested data length {0} exceeds maximum RBCP data length")]
    PayloadTooLong(usize),
    #[error("received RBCP message is shorter than the 8-byte header")]
    TruncatedResponse,
    #[error("received RBCP message shows invalid version {0:#04x}")]
    BadVersion(u8),
    #[error("received RBCP message has invalid status byte {0:#010b}")]
    BadStatus(u8),
    #[error("received RBCP message signals a bus error")]
    BusError,
    #[error("received RBCP message R/W type does not match the current operation")]
    TypeMismatch,
    #[error("received RBCP message has wrong ID: expected {expected}, got {actual}")]
    StaleId { expected: u8, actual: u8 },
    #[error("received RBCP message has size field mismatch: expected {expected}, got {actual}")]
    SizeEchoMismatch { expected: u8, actual: u8 },
    #[error("received RBCP message has address mismatch: expected {expected:#010x}, got {actual:#010x}")]
    AddrEchoMismatch { expected: u32, actual: u32 },
    #[error("received RBCP message has invalid length: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("received RBCP write echo does not match the sent payload")]
    DataEchoMismatch,
    #[error("write timeout: exceeded retransmit budget")]
    WriteRetriesExhausted,
    #[error("read timeout: exceeded retransmit budget")]
    ReadRetriesExhausted,
    #[error("invalid address {0:#x} for this operation")]
    InvalidAddress(u64),
    #[error("no stream connection configured")]
    NoStream,
}
