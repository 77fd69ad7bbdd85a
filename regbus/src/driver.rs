//! Register driver mapping a named catalog of registers onto a byte
//! transport.
//!
//! The driver owns the catalog, performs read-modify-write for registers that
//! share bytes with their neighbors and keeps a cache of previously written
//! values to detect drift between software state and device state.

use std::collections::{BTreeMap, HashMap};

use log::warn;

use crate::bits;
use crate::error::{AccessError, ConfigError, Error, TransportError};
use crate::model::{Access, DataKind, RegValue, RegisterDescr, RegisterSpec, ValueSpec};
use crate::transport::ByteTransport;

/// Driver behavior switches beyond the register catalog
#[derive(Clone, Copy, Debug, Default)]
pub struct DriverOptions {
    /// Byte address of the firmware module within the device address space;
    /// added to every register address before it reaches the transport
    pub base_addr: u64,
    /// Whether [`RegisterDriver::reset`] discards the written value cache
    pub clear_cache_on_reset: bool,
}

/// Named, typed register access for one firmware module.
///
/// Registers are defined up front and validated on construction; afterwards
/// every access is checked against the catalog (existence, data kind, access
/// mode, lengths) before any bytes move. Write-only registers cannot be read
/// back, so reading one silently redirects to [`trigger`], as firmware
/// modules commonly use such registers for one-shot commands.
///
/// [`trigger`]: RegisterDriver::trigger
pub struct RegisterDriver<T> {
    name: String,
    transport: T,
    base_addr: u64,
    clear_cache_on_reset: bool,
    registers: BTreeMap<String, RegisterDescr>,
    /// Most recently written value per writable register
    written_cache: HashMap<String, RegValue>,
    /// Configured per-register default overrides, preferred over the
    /// catalog defaults by `apply_defaults` and `trigger`
    init_values: HashMap<String, RegValue>,
}

impl<T: ByteTransport> RegisterDriver<T> {
    /// Builds a driver from register definitions and optional per-register
    /// default overrides (`init`), validating every invariant of the
    /// catalog.
    pub fn new(
        name: impl Into<String>,
        transport: T,
        registers: &[RegisterSpec],
        init: &HashMap<String, ValueSpec>,
        options: DriverOptions,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let mut catalog = BTreeMap::new();

        for spec in registers {
            let descr = RegisterDescr::from(spec);
            descr.validate(&spec.name)?;
            if catalog.insert(spec.name.clone(), descr).is_some() {
                return Err(ConfigError::DuplicateRegister(spec.name.clone()));
            }
        }

        let mut init_values = HashMap::new();

        for (reg_name, value) in init {
            let Some(descr) = catalog.get(reg_name) else {
                warn!(
                    "Ignoring init value for unknown register {reg_name:?} of register driver {name:?}.",
                );
                continue;
            };
            if descr.access == Access::ReadOnly {
                return Err(ConfigError::InitForReadOnly(reg_name.clone()));
            }
            let value = RegValue::from(value.clone());
            if value.kind() != descr.kind {
                return Err(ConfigError::InitKindMismatch(reg_name.clone()));
            }
            if let RegValue::Bytes(bytes) = &value {
                if bytes.len() != descr.size as usize {
                    return Err(ConfigError::InitLengthMismatch(reg_name.clone()));
                }
            }
            init_values.insert(reg_name.clone(), value);
        }

        Ok(Self {
            name,
            transport,
            base_addr: options.base_addr,
            clear_cache_on_reset: options.clear_cache_on_reset,
            registers: catalog,
            written_cache: HashMap::new(),
            init_values,
        })
    }

    /// Driver name as passed to [`new`](RegisterDriver::new)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a register of this name is defined
    #[must_use]
    pub fn has_register(&self, reg_name: &str) -> bool {
        self.registers.contains_key(reg_name)
    }

    /// Defined register names, in sorted order
    pub fn register_names(&self) -> impl Iterator<Item = &str> {
        self.registers.keys().map(String::as_str)
    }

    /// Gives access to the underlying transport, for operations beyond
    /// register access (e.g. attached data streams).
    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Forgets driver-side register state after a module reset.
    ///
    /// Discards the written value cache if enabled via
    /// [`DriverOptions::clear_cache_on_reset`]. Module-specific reset
    /// sequences (reset registers, FIFO flushes) are performed by the caller
    /// before this.
    pub fn reset(&mut self) {
        if self.clear_cache_on_reset {
            self.written_cache.clear();
        }
    }

    /// Writes the configured default to every writable register that has
    /// one, preferring the init override over the catalog default.
    pub fn apply_defaults(&mut self) -> Result<(), Error> {
        let pending: Vec<(String, RegValue)> = self
            .registers
            .iter()
            .filter(|(_, descr)| descr.access != Access::ReadOnly)
            .filter_map(|(reg_name, descr)| {
                self.init_values
                    .get(reg_name)
                    .or(descr.default.as_ref())
                    .map(|value| (reg_name.clone(), value.clone()))
            })
            .collect();

        for (reg_name, value) in pending {
            match value {
                RegValue::Value(v) => self.set_value(&reg_name, v)?,
                RegValue::Bytes(b) => self.set_bytes(&reg_name, &b)?,
            }
        }
        Ok(())
    }

    /// Reads a register's value or byte sequence according to its data kind.
    pub fn get(&mut self, reg_name: &str) -> Result<RegValue, Error> {
        match self.descr(reg_name)?.kind {
            DataKind::Value => self.get_value(reg_name).map(RegValue::Value),
            DataKind::ByteArray => self.get_bytes(reg_name).map(RegValue::Bytes),
        }
    }

    /// Writes a register's value or byte sequence according to its data
    /// kind.
    pub fn set(&mut self, reg_name: &str, value: &RegValue) -> Result<(), Error> {
        let descr = self.descr(reg_name)?;
        if value.kind() != descr.kind {
            return Err(AccessError::KindMismatch {
                register: reg_name.to_owned(),
                requested: value.kind(),
                actual: descr.kind,
            }
            .into());
        }
        match value {
            RegValue::Value(v) => self.set_value(reg_name, *v),
            RegValue::Bytes(b) => self.set_bytes(reg_name, b),
        }
    }

    /// Reads the value of a value register.
    ///
    /// Silently redirects to [`trigger`](RegisterDriver::trigger) (and
    /// returns zero) for a write-only register. Warns if the read value does
    /// not match the written value cache.
    pub fn get_value(&mut self, reg_name: &str) -> Result<u64, Error> {
        let descr = self.checked_descr(reg_name, DataKind::Value)?;

        if descr.access == Access::WriteOnly {
            self.trigger(reg_name)?;
            return Ok(0);
        }

        let (addr, size, offset, access) = (descr.addr, descr.size, descr.bit_offset, descr.access);
        let value = self
            .reg_value(addr, size, offset)
            .map_err(|source| self.transport_err(reg_name, source))?;

        if access == Access::ReadWrite {
            if let Some(RegValue::Value(cached)) = self.written_cache.get(reg_name) {
                if value != *cached {
                    warn!("Value read from register {reg_name:?} differs from cached value.");
                }
            }
        }
        Ok(value)
    }

    /// Writes a value to a value register and saves it in the written value
    /// cache.
    pub fn set_value(&mut self, reg_name: &str, value: u64) -> Result<(), Error> {
        let descr = self.checked_descr(reg_name, DataKind::Value)?;
        if descr.access == Access::ReadOnly {
            return Err(AccessError::NotWritable(reg_name.to_owned()).into());
        }

        let (addr, size, offset) = (descr.addr, descr.size, descr.bit_offset);
        self.set_reg_value(addr, size, offset, value)
            .map_err(|source| self.transport_err(reg_name, source))?;

        self.written_cache
            .insert(reg_name.to_owned(), RegValue::Value(value));
        Ok(())
    }

    /// Reads the byte sequence of a byte array register.
    ///
    /// Silently redirects to [`trigger`](RegisterDriver::trigger) (and
    /// returns an empty sequence) for a write-only register. Warns if the
    /// read bytes do not match the written value cache.
    pub fn get_bytes(&mut self, reg_name: &str) -> Result<Vec<u8>, Error> {
        let descr = self.checked_descr(reg_name, DataKind::ByteArray)?;

        if descr.access == Access::WriteOnly {
            self.trigger(reg_name)?;
            return Ok(Vec::new());
        }

        let (addr, size, access) = (descr.addr, descr.size, descr.access);
        let bytes = self
            .reg_bytes(addr, size)
            .map_err(|source| self.transport_err(reg_name, source))?;

        if access == Access::ReadWrite {
            if let Some(RegValue::Bytes(cached)) = self.written_cache.get(reg_name) {
                if bytes != *cached {
                    warn!("Byte sequence read from register {reg_name:?} differs from cached one.");
                }
            }
        }
        Ok(bytes)
    }

    /// Writes a byte sequence to a byte array register and saves it in the
    /// written value cache. The sequence length must match the register
    /// size exactly.
    pub fn set_bytes(&mut self, reg_name: &str, data: &[u8]) -> Result<(), Error> {
        let descr = self.checked_descr(reg_name, DataKind::ByteArray)?;
        if descr.access == Access::ReadOnly {
            return Err(AccessError::NotWritable(reg_name.to_owned()).into());
        }
        if data.len() != descr.size as usize {
            return Err(AccessError::WrongDataLength {
                register: reg_name.to_owned(),
                expected: descr.size as usize,
                actual: data.len(),
            }
            .into());
        }

        let addr = descr.addr;
        self.set_reg_bytes(addr, data)
            .map_err(|source| self.transport_err(reg_name, source))?;

        self.written_cache
            .insert(reg_name.to_owned(), RegValue::Bytes(data.to_vec()));
        Ok(())
    }

    /// "Triggers" a write-only register by writing its configured default.
    ///
    /// The written value is the init override if configured, the catalog
    /// default otherwise, and zero (or a zero sequence) if neither exists.
    pub fn trigger(&mut self, reg_name: &str) -> Result<(), Error> {
        let descr = self.descr(reg_name)?;
        if descr.access != Access::WriteOnly {
            return Err(AccessError::NotTriggerable(reg_name.to_owned()).into());
        }

        let value = self
            .init_values
            .get(reg_name)
            .or(descr.default.as_ref())
            .cloned()
            .unwrap_or_else(|| match descr.kind {
                DataKind::Value => RegValue::Value(0),
                DataKind::ByteArray => RegValue::Bytes(vec![0; descr.size as usize]),
            });

        match value {
            RegValue::Value(v) => self.set_value(reg_name, v),
            RegValue::Bytes(b) => self.set_bytes(reg_name, &b),
        }
    }

    /// Reads a `size`-bit value at `bit_offset` past the module-local byte
    /// address `addr`, bypassing the register catalog.
    pub fn reg_value(
        &mut self,
        addr: u32,
        size: u32,
        bit_offset: u32,
    ) -> Result<u64, TransportError> {
        let span = bits::span(size, bit_offset);
        let data = self.transport.read(
            self.base_addr + u64::from(addr) + u64::from(span.byte_offset),
            span.byte_len as usize,
        )?;
        if data.len() != span.byte_len as usize {
            return Err(TransportError::ShortRead {
                expected: span.byte_len as usize,
                actual: data.len(),
            });
        }
        Ok(bits::extract(&data, size, span.bit_remainder))
    }

    /// Writes a `size`-bit value at `bit_offset` past the module-local byte
    /// address `addr`, bypassing the register catalog.
    ///
    /// Byte-aligned values are written directly; everything else goes
    /// through a read-modify-write of the covering byte span so that
    /// neighboring register bits are preserved.
    pub fn set_reg_value(
        &mut self,
        addr: u32,
        size: u32,
        bit_offset: u32,
        value: u64,
    ) -> Result<(), TransportError> {
        let span = bits::span(size, bit_offset);
        let span_addr = self.base_addr + u64::from(addr) + u64::from(span.byte_offset);

        if bits::is_byte_aligned(size, bit_offset) {
            return self.transport.write(span_addr, &bits::to_whole_bytes(size, value));
        }

        let mut data = self.transport.read(span_addr, span.byte_len as usize)?;
        if data.len() != span.byte_len as usize {
            return Err(TransportError::ShortRead {
                expected: span.byte_len as usize,
                actual: data.len(),
            });
        }
        bits::insert(&mut data, size, span.bit_remainder, value);
        self.transport.write(span_addr, &data)
    }

    /// Reads `size` bytes at the module-local byte address `addr`.
    pub fn reg_bytes(&mut self, addr: u32, size: u32) -> Result<Vec<u8>, TransportError> {
        let data = self
            .transport
            .read(self.base_addr + u64::from(addr), size as usize)?;
        if data.len() != size as usize {
            return Err(TransportError::ShortRead {
                expected: size as usize,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Writes `data` at the module-local byte address `addr`.
    pub fn set_reg_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), TransportError> {
        self.transport.write(self.base_addr + u64::from(addr), data)
    }

    fn descr(&self, reg_name: &str) -> Result<&RegisterDescr, AccessError> {
        self.registers
            .get(reg_name)
            .ok_or_else(|| AccessError::NoSuchRegister {
                driver: self.name.clone(),
                register: reg_name.to_owned(),
            })
    }

    /// Catalog lookup plus data kind check, returning a copy of the
    /// descriptor without its default value
    fn checked_descr(
        &self,
        reg_name: &str,
        kind: DataKind,
    ) -> Result<RegisterDescr, AccessError> {
        let descr = self.descr(reg_name)?;
        if descr.kind != kind {
            return Err(AccessError::KindMismatch {
                register: reg_name.to_owned(),
                requested: kind,
                actual: descr.kind,
            });
        }
        Ok(RegisterDescr {
            default: None,
            ..descr.clone()
        })
    }

    fn transport_err(&self, reg_name: &str, source: TransportError) -> Error {
        Error::Transport {
            register: reg_name.to_owned(),
            source,
        }
    }
}
