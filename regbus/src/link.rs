//! Socket links used by the protocol layer.
//!
//! [`DatagramLink`] carries the request/response control exchange and
//! [`StreamLink`] the continuous data stream. The std socket implementations
//! map their platform timeout errors onto [`TransportError::Timeout`] so the
//! retry logic above never has to inspect io error kinds.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::error::TransportError;

/// Largest datagram the control protocol can produce (8-byte header plus
/// maximal payload)
pub const MAX_DATAGRAM_LEN: usize = 8 + 255;

/// Connected message-oriented socket for request/response exchanges
pub trait DatagramLink: Send {
    /// Sends one datagram.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Receives one datagram, waiting up to `timeout`.
    fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Receives one datagram if one is already queued, without blocking.
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Connected byte-oriented socket for continuous data streams
pub trait StreamLink: Send {
    /// Reads up to `max` bytes, waiting up to `timeout` for the first byte.
    /// Returns an empty buffer on timeout.
    fn read_max(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Writes all of `data`.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// UDP datagram link over a connected std socket
pub struct UdpLink {
    socket: UdpSocket,
}

impl UdpLink {
    /// Opens a UDP socket connected to `addr`.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(addr)?;
        Ok(Self { socket })
    }
}

impl DatagramLink for UdpLink {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.socket.send(data)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        match self.socket.recv(&mut buf) {
            Ok(len) => Ok(buf[..len].to_vec()),
            Err(err) if is_timeout(&err) => Err(TransportError::Timeout),
            Err(err) => Err(err.into()),
        }
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        self.socket.set_nonblocking(true)?;
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        let result = self.socket.recv(&mut buf);
        self.socket.set_nonblocking(false)?;
        match result {
            Ok(len) => Ok(Some(buf[..len].to_vec())),
            Err(err) if is_timeout(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// TCP stream link over a connected std socket
pub struct TcpLink {
    stream: TcpStream,
}

impl TcpLink {
    /// Opens a TCP connection to `addr`.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl StreamLink for TcpLink {
    fn read_max(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        // A zero read timeout is invalid for std sockets; poll nonblocking
        // instead
        if timeout.is_zero() {
            self.stream.set_nonblocking(true)?;
        } else {
            self.stream.set_read_timeout(Some(timeout))?;
        }
        let mut buf = vec![0u8; max];
        let result = self.stream.read(&mut buf);
        if timeout.is_zero() {
            self.stream.set_nonblocking(false)?;
        }
        match result {
            Ok(len) => {
                buf.truncate(len);
                Ok(buf)
            }
            Err(err) if is_timeout(&err) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        Write::write_all(&mut self.stream, data)?;
        Ok(())
    }
}
