//! Word-oriented access to the SiTCP FIFO.
//!
//! The FIFO carries 32-bit little-endian data words over the stream socket.
//! This driver reads and writes whole words on top of the byte-level FIFO
//! operations of [`SiTcp`] and exposes the conventional pseudo registers
//! (`RESET`, `VERSION`, `FIFO_SIZE`) of the faked FIFO firmware module.

use crate::error::{AccessError, Error, TransportError};
use crate::sitcp::SiTcp;

/// Version reported for the faked FIFO firmware module, matching the
/// transport-level version shim
const PSEUDO_VERSION: u8 = 1;

/// FIFO driver over a SiTCP transport
pub struct SiTcpFifo<'a> {
    name: String,
    sitcp: &'a SiTcp,
}

impl<'a> SiTcpFifo<'a> {
    pub fn new(name: impl Into<String>, sitcp: &'a SiTcp) -> Self {
        Self {
            name: name.into(),
            sitcp,
        }
    }

    /// Clears the FIFO, including data still pending on the stream socket.
    pub fn reset(&self) -> Result<(), Error> {
        self.sitcp
            .reset_fifo()
            .map_err(|source| self.transport_err("RESET", source))
    }

    /// Pseudo version of the non-existent FIFO firmware module
    #[must_use]
    pub fn version(&self) -> u8 {
        PSEUDO_VERSION
    }

    /// Current FIFO fill state in bytes
    pub fn size(&self) -> Result<usize, Error> {
        self.sitcp
            .fifo_size()
            .map_err(|source| self.transport_err("FIFO_SIZE", source))
    }

    /// Removes and returns all complete 32-bit words currently in the FIFO,
    /// little-endian.
    pub fn read_words(&self) -> Result<Vec<u32>, Error> {
        let map_err = |source| self.transport_err("FIFO_DATA", source);

        let word_count = self.sitcp.fifo_size().map_err(map_err)? / 4;
        let raw = self.sitcp.fifo_data(word_count * 4).map_err(map_err)?;
        if raw.len() != word_count * 4 {
            return Err(map_err(TransportError::ShortRead {
                expected: word_count * 4,
                actual: raw.len(),
            }));
        }

        Ok(raw
            .chunks_exact(4)
            .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect())
    }

    /// Writes 32-bit words to the FIFO stream, little-endian.
    pub fn write_words(&self, words: &[u32]) -> Result<(), Error> {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        self.sitcp
            .stream_write(&bytes)
            .map_err(|source| self.transport_err("FIFO_DATA", source))
    }

    /// Register-like access to the pseudo registers: `RESET` clears the
    /// FIFO and reads as 0, `VERSION` reads the pseudo module version and
    /// `FIFO_SIZE` the fill state in bytes.
    pub fn register(&self, reg_name: &str) -> Result<u64, Error> {
        match reg_name {
            "RESET" => {
                self.reset()?;
                Ok(0)
            }
            "VERSION" => Ok(u64::from(self.version())),
            "FIFO_SIZE" => Ok(self.size()? as u64),
            _ => Err(AccessError::NoSuchRegister {
                driver: self.name.clone(),
                register: reg_name.to_owned(),
            }
            .into()),
        }
    }

    fn transport_err(&self, register: &str, source: TransportError) -> Error {
        Error::Transport {
            register: register.to_owned(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::error::ProtocolError;
    use crate::link::{DatagramLink, StreamLink};
    use crate::sitcp::SiTcpConfig;

    /// Control link stub; the FIFO driver never exchanges RBCP messages
    struct NullLink;

    impl DatagramLink for NullLink {
        fn send(&mut self, _data: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn recv(&mut self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::Timeout)
        }

        fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct StreamState {
        chunks: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    struct FakeStream(Arc<Mutex<StreamState>>);

    impl StreamLink for FakeStream {
        fn read_max(&mut self, max: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            match self.0.lock().unwrap().chunks.pop_front() {
                Some(mut chunk) => {
                    chunk.truncate(max);
                    Ok(chunk)
                }
                None => Ok(Vec::new()),
            }
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.0.lock().unwrap().written.extend_from_slice(data);
            Ok(())
        }
    }

    fn transport(stream: &Arc<Mutex<StreamState>>) -> SiTcp {
        SiTcp::new(
            "test",
            Box::new(NullLink),
            Some(Box::new(FakeStream(stream.clone()))),
            SiTcpConfig::default(),
        )
    }

    #[test]
    fn words_round_trip_little_endian() {
        let stream = Arc::new(Mutex::new(StreamState::default()));
        let sitcp = transport(&stream);
        let fifo = SiTcpFifo::new("fifo", &sitcp);

        fifo.write_words(&[0xDEAD_BEEF, 0x0102_0304]).unwrap();
        assert_eq!(
            stream.lock().unwrap().written,
            vec![0xEF, 0xBE, 0xAD, 0xDE, 0x04, 0x03, 0x02, 0x01]
        );

        // A full word plus a partial one in the buffer
        sitcp.push_fifo(&[0xEF, 0xBE, 0xAD, 0xDE, 0x99]);
        assert_eq!(fifo.read_words().unwrap(), vec![0xDEAD_BEEF]);
        // The partial word stays queued
        assert_eq!(fifo.size().unwrap(), 1);
    }

    #[test]
    fn pseudo_registers() {
        let stream = Arc::new(Mutex::new(StreamState::default()));
        let sitcp = transport(&stream);
        let fifo = SiTcpFifo::new("fifo", &sitcp);

        sitcp.push_fifo(&[0; 8]);
        assert_eq!(fifo.register("FIFO_SIZE").unwrap(), 8);
        assert_eq!(fifo.register("VERSION").unwrap(), 1);
        assert_eq!(fifo.register("RESET").unwrap(), 0);
        assert_eq!(fifo.register("FIFO_SIZE").unwrap(), 0);

        assert!(matches!(
            fifo.register("NOPE").unwrap_err(),
            Error::Access(AccessError::NoSuchRegister { .. })
        ));
    }

    #[test]
    fn missing_stream_surfaces_as_transport_error() {
        let sitcp = SiTcp::new("test", Box::new(NullLink), None, SiTcpConfig::default());
        let fifo = SiTcpFifo::new("fifo", &sitcp);

        assert!(matches!(
            fifo.size().unwrap_err(),
            Error::Transport {
                source: TransportError::Protocol(ProtocolError::NoStream),
                ..
            }
        ));
    }
}
