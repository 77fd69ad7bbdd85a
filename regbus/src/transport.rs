//! Byte-addressed transport interface.
//!
//! The seam between register drivers and the concrete bus protocol. A
//! transport moves raw byte sequences to and from device addresses; it knows
//! nothing about registers, bit offsets or field layouts.

use crate::error::TransportError;

/// Byte-level access to a device's address space.
///
/// Implementations must return exactly `size` bytes from [`read`] or fail;
/// drivers rely on the span arithmetic matching the returned length.
///
/// [`read`]: ByteTransport::read
pub trait ByteTransport {
    /// Reads `size` bytes starting at `addr`.
    fn read(&mut self, addr: u64, size: usize) -> Result<Vec<u8>, TransportError>;

    /// Writes `data` starting at `addr`.
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError>;

    /// Writes `data` to `addr` and reads back `size` bytes from the same
    /// address. The default does the two operations back to back; transports
    /// with a combined query primitive override this.
    fn query(&mut self, addr: u64, data: &[u8], size: usize) -> Result<Vec<u8>, TransportError> {
        self.write(addr, data)?;
        self.read(addr, size)
    }
}

impl<T: ByteTransport + ?Sized> ByteTransport for &mut T {
    fn read(&mut self, addr: u64, size: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(addr, size)
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(addr, data)
    }

    fn query(&mut self, addr: u64, data: &[u8], size: usize) -> Result<Vec<u8>, TransportError> {
        (**self).query(addr, data, size)
    }
}
