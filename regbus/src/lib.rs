//! Regbus --- Access named, typed registers of FPGA-based hardware over
//! byte-addressed transports, including the SiTCP RBCP datagram protocol and
//! its companion FIFO data stream.
//!
//! The crate is organized bottom-up: [`bits`] packs and unpacks arbitrary
//! bit-offset/bit-size values onto byte spans, [`driver`] maps a named
//! register catalog onto a [`transport::ByteTransport`], [`field`] decomposes
//! one in-memory bit array into a tree of named sub-fields, and [`sitcp`] /
//! [`fifo`] implement the RBCP request/response exchange and the
//! word-oriented FIFO stream on top of pluggable [`link`] sockets.

pub use driver::{DriverOptions, RegisterDriver};
pub use error::{AccessError, ConfigError, Error, ProtocolError, TransportError};
pub use fifo::SiTcpFifo;
pub use link::{DatagramLink, StreamLink, TcpLink, UdpLink};
pub use field::{BitMut, BitRef, Field, FieldInit, FieldMut, FieldRegister};
pub use model::{
    Access, AccessSpec, DataKind, DataKindSpec, FieldSpec, RegValue, RegisterDescr, RegisterSpec,
    ValueSpec,
};
pub use sitcp::{SiTcp, SiTcpConfig};
pub use transport::ByteTransport;

pub mod bits;
pub mod driver;
mod error;
pub mod field;
pub mod fifo;
pub mod link;
pub mod model;
pub mod sitcp;
pub mod transport;
