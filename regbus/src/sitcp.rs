//! SiTCP transport: RBCP bus access over a datagram socket plus the FIFO
//! data stream over a byte stream socket.
//!
//! RBCP is a request/response protocol with an 8-byte header (version/type,
//! command/flag, message ID, data length, 32-bit big-endian address) and up
//! to [`RBCP_MAX_SIZE`] data bytes. Every response must echo the header of
//! its request; responses failing validation abort the operation, while
//! timeouts and stale message IDs are retried within a fixed budget.
//!
//! The transport multiplexes several concerns over the 64-bit address space
//! of [`ByteTransport`]:
//! - `[0, 0x1_0000_0000)`: RBCP bus access, chunked to the maximum RBCP
//!   payload.
//! - `[0x1_0000_0000, 0x2_0000_0000)`: the FIFO stream. Reads drain the
//!   polled FIFO buffer, writes go to the stream socket directly.
//! - `0x2_0000_0000`: FIFO control. Writes reset the FIFO, reads report a
//!   pseudo module version.
//! - above: reads of 4 bytes report the FIFO fill state as a little-endian
//!   `u32`; other sizes read as zeros.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::error::{ProtocolError, TransportError};
use crate::link::{DatagramLink, StreamLink};
use crate::transport::ByteTransport;

/// `Version`/`Type` byte of the RBCP header
pub const RBCP_VER_TYPE: u8 = 0xFF;
/// Write request value of the `CMD`/`FLAG` header byte
pub const RBCP_CMD_WR: u8 = 0x80;
/// Read request value of the `CMD`/`FLAG` header byte
pub const RBCP_CMD_RD: u8 = 0xC0;
/// Maximum number of data bytes per RBCP message
pub const RBCP_MAX_SIZE: usize = 255;

/// Address limit below which reads and writes do normal bus access
pub const DATA_ADDR_LIMIT: u64 = 0x1_0000_0000;
/// Address limit for the special FIFO access modes
pub const FIFO_ADDR_LIMIT: u64 = 0x2_0000_0000;

/// Version reported for the faked FIFO firmware module
const FIFO_VERSION: u8 = 1;

/// Bytes requested from the stream socket per poll cycle
const POLL_CHUNK: usize = 1024 * 8;

const STATUS_MASK: u8 = 0b1011_1110;
const STATUS_EXPECTED: u8 = 0b1000_1000;
const STATUS_BUS_ERROR: u8 = 0b0000_0001;
const STATUS_READ: u8 = 0b0100_0000;

/// Timing and retry parameters of the SiTCP transport
#[derive(Clone, Copy, Debug)]
pub struct SiTcpConfig {
    /// Timeout per RBCP send and receive attempt
    pub udp_timeout: Duration,
    /// Retry budget for timed out RBCP sends and receives
    pub retransmit_limit: u32,
    /// Minimum time between FIFO poll cycles, also the per-cycle stream
    /// read timeout
    pub poll_interval: Duration,
    /// Consecutive stream errors after which the poller stops itself
    pub max_poll_errors: u32,
}

impl Default for SiTcpConfig {
    fn default() -> Self {
        Self {
            udp_timeout: Duration::from_secs(1),
            retransmit_limit: 3,
            poll_interval: Duration::from_millis(50),
            max_poll_errors: 10,
        }
    }
}

/// Stream-side state shared with the FIFO polling thread
struct FifoState {
    stream: Mutex<Box<dyn StreamLink>>,
    queue: Mutex<VecDeque<u8>>,
    polling: AtomicBool,
    /// Hint for the poller to yield so a foreground caller can take the
    /// stream lock quickly
    want_stream: AtomicBool,
}

/// Clears the want hint when the foreground stream access is done
struct WantStreamGuard<'a>(&'a AtomicBool);

impl<'a> WantStreamGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for WantStreamGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum RbcpRequest<'a> {
    Read(u8),
    Write(&'a [u8]),
}

/// SiTCP transport over pluggable datagram and stream links.
///
/// The datagram link carries RBCP control exchanges; the optional stream
/// link carries the FIFO data, filled in the background by
/// [`start_polling`](SiTcp::start_polling).
pub struct SiTcp {
    name: String,
    udp: Box<dyn DatagramLink>,
    /// Last transmitted RBCP message ID, incremented per transmission
    rbcp_id: u8,
    config: SiTcpConfig,
    fifo: Option<Arc<FifoState>>,
    poller: Option<JoinHandle<()>>,
}

impl SiTcp {
    /// Creates the transport from already connected links. FIFO operations
    /// fail with [`ProtocolError::NoStream`] if `stream` is `None`.
    pub fn new(
        name: impl Into<String>,
        udp: Box<dyn DatagramLink>,
        stream: Option<Box<dyn StreamLink>>,
        config: SiTcpConfig,
    ) -> Self {
        Self {
            name: name.into(),
            udp,
            rbcp_id: 0,
            config,
            fifo: stream.map(|stream| {
                Arc::new(FifoState {
                    stream: Mutex::new(stream),
                    queue: Mutex::new(VecDeque::new()),
                    polling: AtomicBool::new(false),
                    want_stream: AtomicBool::new(false),
                })
            }),
            poller: None,
        }
    }

    /// Resets the FIFO and starts the background polling thread. Does
    /// nothing if the poller is already running.
    pub fn start_polling(&mut self) -> Result<(), TransportError> {
        let state = self.fifo_state()?.clone();
        if self.poller.is_some() {
            return Ok(());
        }
        self.reset_fifo()?;
        state.polling.store(true, Ordering::SeqCst);

        let interval = self.config.poll_interval;
        let max_errors = self.config.max_poll_errors;
        let name = self.name.clone();
        self.poller = Some(thread::spawn(move || {
            poll_fifo(&state, interval, max_errors, &name);
        }));
        Ok(())
    }

    /// Stops and joins the polling thread, if running.
    pub fn stop_polling(&mut self) {
        if let Some(state) = &self.fifo {
            state.polling.store(false, Ordering::SeqCst);
        }
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
    }

    /// Whether the FIFO poller is currently active. Becomes false when the
    /// poller stops itself after repeated stream errors.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.fifo
            .as_ref()
            .is_some_and(|state| state.polling.load(Ordering::SeqCst))
    }

    /// Discards queued FIFO bytes and whatever is pending on the stream
    /// socket.
    pub fn reset_fifo(&self) -> Result<(), TransportError> {
        let state = self.fifo_state()?;
        {
            let _want = WantStreamGuard::set(&state.want_stream);
            let mut stream = lock(&state.stream);
            // Drain until a poll comes back empty
            while !stream.read_max(POLL_CHUNK, Duration::ZERO)?.is_empty() {}
        }
        lock(&state.queue).clear();
        Ok(())
    }

    /// Number of bytes currently buffered in the FIFO
    pub fn fifo_size(&self) -> Result<usize, TransportError> {
        Ok(lock(&self.fifo_state()?.queue).len())
    }

    /// Removes and returns up to `max` bytes from the FIFO, rounded down to
    /// a multiple of 4 so only whole data words leave the buffer.
    pub fn fifo_data(&self, max: usize) -> Result<Vec<u8>, TransportError> {
        let state = self.fifo_state()?;
        let mut queue = lock(&state.queue);
        let count = max.min(queue.len());
        let count = count - count % 4;
        Ok(queue.drain(..count).collect())
    }

    /// Writes raw bytes to the stream socket.
    pub fn stream_write(&self, data: &[u8]) -> Result<(), TransportError> {
        let state = self.fifo_state()?;
        let _want = WantStreamGuard::set(&state.want_stream);
        lock(&state.stream).write_all(data)
    }

    fn fifo_state(&self) -> Result<&Arc<FifoState>, TransportError> {
        self.fifo
            .as_ref()
            .ok_or(TransportError::Protocol(ProtocolError::NoStream))
    }

    fn rbcp_read(&mut self, addr: u32, size: u8) -> Result<Vec<u8>, TransportError> {
        self.do_rbcp(addr, &RbcpRequest::Read(size))
    }

    fn rbcp_write(&mut self, addr: u32, data: &[u8]) -> Result<(), TransportError> {
        self.do_rbcp(addr, &RbcpRequest::Write(data)).map(|_| ())
    }

    /// Performs one RBCP exchange including the retry state machine.
    ///
    /// Transmissions are retried on send timeout, receive timeout and stale
    /// message IDs, each within the configured budget; a stale ID first
    /// retries the receive, as the matching response may still be in
    /// flight. Any other response defect aborts immediately.
    fn do_rbcp(&mut self, addr: u32, request: &RbcpRequest) -> Result<Vec<u8>, TransportError> {
        let (cmd, data_len) = match request {
            RbcpRequest::Read(size) => (RBCP_CMD_RD, usize::from(*size)),
            RbcpRequest::Write(data) => (RBCP_CMD_WR, data.len()),
        };
        if data_len > RBCP_MAX_SIZE {
            return Err(ProtocolError::PayloadTooLong(data_len).into());
        }

        let mut frame = Vec::with_capacity(8 + data_len);
        frame.extend_from_slice(&[RBCP_VER_TYPE, cmd, 0, data_len as u8]);
        frame.extend_from_slice(&addr.to_be_bytes());
        if let RbcpRequest::Write(data) = request {
            frame.extend_from_slice(data);
        }

        let limit = self.config.retransmit_limit;
        let mut write_attempts = 0u32;

        'transmit: loop {
            self.rbcp_id = self.rbcp_id.wrapping_add(1);
            frame[2] = self.rbcp_id;
            write_attempts += 1;

            self.drain_strays("before completing send operation")?;

            match self.udp.send(&frame) {
                Ok(()) => {}
                Err(TransportError::Timeout) if write_attempts <= limit => {
                    warn!(
                        "Write timeout on UDP socket of SiTcp socket {:?}. Retry write...",
                        self.name
                    );
                    continue 'transmit;
                }
                Err(TransportError::Timeout) => {
                    return Err(ProtocolError::WriteRetriesExhausted.into());
                }
                Err(err) => return Err(err),
            }

            let mut read_attempts = 0u32;

            loop {
                read_attempts += 1;

                let response = match self.udp.recv(self.config.udp_timeout) {
                    Ok(response) => response,
                    Err(TransportError::Timeout) => {
                        if read_attempts <= limit {
                            warn!(
                                "Read timeout on UDP socket of SiTcp socket {:?}. Retry read...",
                                self.name
                            );
                            continue;
                        }
                        if write_attempts <= limit {
                            warn!(
                                "Read timeout on UDP socket of SiTcp socket {:?}. Retry write...",
                                self.name
                            );
                            continue 'transmit;
                        }
                        return Err(ProtocolError::ReadRetriesExhausted.into());
                    }
                    Err(err) => return Err(err),
                };

                if response.len() < 8 {
                    return Err(ProtocolError::TruncatedResponse.into());
                }

                // A stale ID can mean the matching response is still
                // pending, so retry the receive before retransmitting
                if response[2] != self.rbcp_id {
                    if read_attempts <= limit {
                        warn!(
                            "RBCP message received on SiTcp socket {:?} has wrong ID. Retry read...",
                            self.name
                        );
                        continue;
                    }
                    if write_attempts <= limit {
                        warn!(
                            "RBCP message received on SiTcp socket {:?} has wrong ID. Retry write...",
                            self.name
                        );
                        continue 'transmit;
                    }
                    return Err(ProtocolError::StaleId {
                        expected: self.rbcp_id,
                        actual: response[2],
                    }
                    .into());
                }

                if response[0] != RBCP_VER_TYPE {
                    return Err(ProtocolError::BadVersion(response[0]).into());
                }
                let status = response[1];
                if status & STATUS_MASK != STATUS_EXPECTED {
                    return Err(ProtocolError::BadStatus(status).into());
                }
                if status & STATUS_BUS_ERROR != 0 {
                    return Err(ProtocolError::BusError.into());
                }
                let read_response = status & STATUS_READ != 0;
                if read_response != matches!(request, RbcpRequest::Read(_)) {
                    return Err(ProtocolError::TypeMismatch.into());
                }
                if response[3] != frame[3] {
                    return Err(ProtocolError::SizeEchoMismatch {
                        expected: frame[3],
                        actual: response[3],
                    }
                    .into());
                }
                if response[4..8] != frame[4..8] {
                    let actual =
                        u32::from_be_bytes([response[4], response[5], response[6], response[7]]);
                    return Err(ProtocolError::AddrEchoMismatch {
                        expected: addr,
                        actual,
                    }
                    .into());
                }
                let expected_len = 8 + data_len;
                if response.len() != expected_len {
                    return Err(ProtocolError::LengthMismatch {
                        expected: expected_len,
                        actual: response.len(),
                    }
                    .into());
                }
                if let RbcpRequest::Write(data) = request {
                    if &response[8..] != *data {
                        return Err(ProtocolError::DataEchoMismatch.into());
                    }
                }

                self.drain_strays("after completing receive operation")?;

                return Ok(response[8..].to_vec());
            }
        }
    }

    /// Removes unexpected datagrams from the socket, logging each.
    fn drain_strays(&mut self, context: &str) -> Result<(), TransportError> {
        while let Some(datagram) = self.udp.try_recv()? {
            if datagram.len() >= 3 {
                warn!(
                    "Found unexpected datagram on SiTcp socket {:?} {context}. \
                     RBCP message ID: {} (expected), {} (received).",
                    self.name, self.rbcp_id, datagram[2]
                );
            } else {
                warn!(
                    "Found unexpected datagram on SiTcp socket {:?} {context}.",
                    self.name
                );
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn push_fifo(&self, bytes: &[u8]) {
        lock(&self.fifo.as_ref().unwrap().queue).extend(bytes.iter().copied());
    }
}

impl ByteTransport for SiTcp {
    fn read(&mut self, addr: u64, size: usize) -> Result<Vec<u8>, TransportError> {
        if addr < DATA_ADDR_LIMIT {
            let mut out = Vec::with_capacity(size);
            let mut offset = 0usize;
            while offset < size {
                let chunk = (size - offset).min(RBCP_MAX_SIZE);
                let chunk_addr = (addr as u32).wrapping_add(offset as u32);
                out.extend_from_slice(&self.rbcp_read(chunk_addr, chunk as u8)?);
                offset += chunk;
            }
            Ok(out)
        } else if addr < FIFO_ADDR_LIMIT {
            self.fifo_data(size)
        } else if addr == FIFO_ADDR_LIMIT {
            Ok(vec![FIFO_VERSION])
        } else if size == 4 {
            Ok((self.fifo_size()? as u32).to_le_bytes().to_vec())
        } else {
            Ok(vec![0; size])
        }
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransportError> {
        if addr < DATA_ADDR_LIMIT {
            let mut offset = 0usize;
            while offset < data.len() {
                let chunk = (data.len() - offset).min(RBCP_MAX_SIZE);
                let chunk_addr = (addr as u32).wrapping_add(offset as u32);
                self.rbcp_write(chunk_addr, &data[offset..offset + chunk])?;
                offset += chunk;
            }
            Ok(())
        } else if addr < FIFO_ADDR_LIMIT {
            self.stream_write(data)
        } else if addr == FIFO_ADDR_LIMIT {
            self.reset_fifo()
        } else {
            Err(ProtocolError::InvalidAddress(addr).into())
        }
    }

    // RBCP has no combined write-then-read primitive
    fn query(&mut self, _addr: u64, _data: &[u8], _size: usize) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported(
            "SiTcp does not support combined query operations",
        ))
    }
}

impl Drop for SiTcp {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

/// Poll loop of the background FIFO thread.
///
/// Reads stream data into the shared queue, pacing cycles to `interval` and
/// stopping itself after `max_errors` consecutive stream failures.
fn poll_fifo(state: &FifoState, interval: Duration, max_errors: u32, name: &str) {
    let mut error_count = 0u32;
    let mut last = Instant::now();

    while state.polling.load(Ordering::SeqCst) {
        if state.want_stream.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        let chunk = {
            let mut stream = lock(&state.stream);
            match stream.read_max(POLL_CHUNK, interval) {
                Ok(chunk) => {
                    error_count = 0;
                    chunk
                }
                Err(err) => {
                    error!("Error while polling FIFO of SiTcp socket {name:?}: {err}");
                    error_count += 1;
                    if error_count > max_errors {
                        state.polling.store(false, Ordering::SeqCst);
                        error!(
                            "Exceeded maximum error count while polling FIFO of \
                             SiTcp socket {name:?}. Stopping..."
                        );
                    }
                    Vec::new()
                }
            }
        };

        if !chunk.is_empty() {
            lock(&state.queue).extend(chunk);
        }

        let elapsed = last.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
        last = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scriptable RBCP peer behind a datagram link
    #[derive(Default)]
    struct BusState {
        mem: Vec<u8>,
        /// Requests to swallow without responding
        drop_requests: usize,
        /// Requests answered first with a wrong-ID duplicate
        stale_responses: usize,
        bus_error: bool,
        responses: VecDeque<Vec<u8>>,
        payload_sizes: Vec<usize>,
        /// Message ID of every request that arrived, dropped ones included
        ids: Vec<u8>,
    }

    impl BusState {
        fn handle(&mut self, frame: &[u8]) {
            assert_eq!(frame[0], RBCP_VER_TYPE);
            let is_read = frame[1] == RBCP_CMD_RD;
            let len = frame[3] as usize;
            let addr = u32::from_be_bytes(frame[4..8].try_into().unwrap()) as usize;
            self.ids.push(frame[2]);

            if self.drop_requests > 0 {
                self.drop_requests -= 1;
                return;
            }
            if !is_read {
                self.payload_sizes.push(frame.len() - 8);
            }

            if self.mem.len() < addr + len {
                self.mem.resize(addr + len, 0);
            }

            let mut response = frame[..8].to_vec();
            response[1] = if is_read { 0xC8 } else { 0x88 };
            if self.bus_error {
                response[1] |= STATUS_BUS_ERROR;
            }
            if is_read {
                response.extend_from_slice(&self.mem[addr..addr + len]);
            } else {
                self.mem[addr..addr + len].copy_from_slice(&frame[8..]);
                response.extend_from_slice(&frame[8..]);
            }

            if self.stale_responses > 0 {
                self.stale_responses -= 1;
                let mut stale = response.clone();
                stale[2] = stale[2].wrapping_sub(1);
                self.responses.push_back(stale);
            }
            self.responses.push_back(response);
        }
    }

    struct BusLink(Arc<Mutex<BusState>>);

    impl DatagramLink for BusLink {
        fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
            lock(&self.0).handle(data);
            Ok(())
        }

        fn recv(&mut self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            lock(&self.0)
                .responses
                .pop_front()
                .ok_or(TransportError::Timeout)
        }

        fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(lock(&self.0).responses.pop_front())
        }
    }

    #[derive(Default)]
    struct StreamState {
        chunks: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        fail_reads: bool,
    }

    struct FakeStream(Arc<Mutex<StreamState>>);

    impl StreamLink for FakeStream {
        fn read_max(&mut self, max: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            let mut state = lock(&self.0);
            if state.fail_reads {
                return Err(TransportError::ShortRead {
                    expected: max,
                    actual: 0,
                });
            }
            match state.chunks.pop_front() {
                Some(mut chunk) => {
                    chunk.truncate(max);
                    Ok(chunk)
                }
                None => Ok(Vec::new()),
            }
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
            lock(&self.0).written.extend_from_slice(data);
            Ok(())
        }
    }

    fn quick_config() -> SiTcpConfig {
        SiTcpConfig {
            udp_timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
            ..SiTcpConfig::default()
        }
    }

    fn bus_transport(state: &Arc<Mutex<BusState>>) -> SiTcp {
        SiTcp::new(
            "test",
            Box::new(BusLink(state.clone())),
            None,
            quick_config(),
        )
    }

    fn stream_transport(
        bus: &Arc<Mutex<BusState>>,
        stream: &Arc<Mutex<StreamState>>,
    ) -> SiTcp {
        SiTcp::new(
            "test",
            Box::new(BusLink(bus.clone())),
            Some(Box::new(FakeStream(stream.clone()))),
            quick_config(),
        )
    }

    #[test]
    fn bus_write_then_read() {
        let state = Arc::new(Mutex::new(BusState::default()));
        let mut sitcp = bus_transport(&state);

        sitcp.write(0x10, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(sitcp.read(0x10, 4).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&lock(&state).mem[0x10..0x14], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn long_transfers_are_chunked() {
        let state = Arc::new(Mutex::new(BusState::default()));
        let mut sitcp = bus_transport(&state);

        let data: Vec<u8> = (0..600).map(|i| i as u8).collect();
        sitcp.write(0, &data).unwrap();
        assert_eq!(lock(&state).payload_sizes, vec![255, 255, 90]);
        assert_eq!(&lock(&state).mem[..600], &data[..]);

        assert_eq!(sitcp.read(0, 600).unwrap(), data);
    }

    #[test]
    fn dropped_datagrams_are_retransmitted() {
        let state = Arc::new(Mutex::new(BusState::default()));
        lock(&state).drop_requests = 2;
        let mut sitcp = bus_transport(&state);

        sitcp.write(0, &[0x42]).unwrap();
        assert_eq!(lock(&state).mem[0], 0x42);

        // Each transmission carries a fresh, strictly incrementing ID
        let ids = lock(&state).ids.clone();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|pair| pair[1] == pair[0].wrapping_add(1)));
    }

    #[test]
    fn retry_budget_is_finite() {
        let state = Arc::new(Mutex::new(BusState::default()));
        // More drops than the transmission budget can absorb
        lock(&state).drop_requests = 100;
        let mut sitcp = bus_transport(&state);

        let err = sitcp.write(0, &[0x42]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::ReadRetriesExhausted)
        ));
    }

    #[test]
    fn stale_id_retries_the_receive() {
        let state = Arc::new(Mutex::new(BusState::default()));
        lock(&state).stale_responses = 1;
        let mut sitcp = bus_transport(&state);

        sitcp.write(0, &[0x7F]).unwrap();
        assert_eq!(lock(&state).mem[0], 0x7F);
        // The duplicate was consumed by the retry, not left on the socket
        assert!(lock(&state).responses.is_empty());
    }

    #[test]
    fn bus_errors_abort() {
        let state = Arc::new(Mutex::new(BusState::default()));
        lock(&state).bus_error = true;
        let mut sitcp = bus_transport(&state);

        let err = sitcp.read(0, 1).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::BusError)
        ));
    }

    #[test]
    fn stray_datagrams_are_drained() {
        let state = Arc::new(Mutex::new(BusState::default()));
        lock(&state).responses.push_back(vec![0xFF, 0xC8, 0x77]);
        let mut sitcp = bus_transport(&state);

        sitcp.write(0, &[0x01]).unwrap();
        assert_eq!(lock(&state).mem[0], 0x01);
    }

    #[test]
    fn fifo_reads_keep_whole_words() {
        let bus = Arc::new(Mutex::new(BusState::default()));
        let stream = Arc::new(Mutex::new(StreamState::default()));
        let mut sitcp = stream_transport(&bus, &stream);

        sitcp.push_fifo(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(sitcp.fifo_size().unwrap(), 10);

        // Reads in the FIFO address range drain the buffer word-wise
        assert_eq!(
            sitcp.read(DATA_ADDR_LIMIT, 8).unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
        // Two remaining bytes are less than a word
        assert_eq!(sitcp.read(DATA_ADDR_LIMIT, 4).unwrap(), Vec::<u8>::new());
        assert_eq!(sitcp.fifo_size().unwrap(), 2);
    }

    #[test]
    fn fifo_control_addresses() {
        let bus = Arc::new(Mutex::new(BusState::default()));
        let stream = Arc::new(Mutex::new(StreamState::default()));
        let mut sitcp = stream_transport(&bus, &stream);

        sitcp.push_fifo(&[0; 12]);

        // Version shim at the control address
        assert_eq!(sitcp.read(FIFO_ADDR_LIMIT, 1).unwrap(), vec![FIFO_VERSION]);
        // Occupancy above it, little-endian, 4-byte reads only
        assert_eq!(
            sitcp.read(FIFO_ADDR_LIMIT + 1, 4).unwrap(),
            12u32.to_le_bytes().to_vec()
        );
        assert_eq!(sitcp.read(FIFO_ADDR_LIMIT + 1, 2).unwrap(), vec![0, 0]);

        // Writing the control address resets the FIFO, discarding queued
        // bytes and whatever is still pending on the stream socket
        lock(&stream).chunks.push_back(vec![1, 2, 3, 4]);
        lock(&stream).chunks.push_back(vec![5, 6, 7, 8]);
        sitcp.write(FIFO_ADDR_LIMIT, &[]).unwrap();
        assert_eq!(sitcp.fifo_size().unwrap(), 0);
        assert!(lock(&stream).chunks.is_empty());

        let err = sitcp.write(FIFO_ADDR_LIMIT + 1, &[0]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::InvalidAddress(_))
        ));
    }

    #[test]
    fn fifo_writes_go_to_the_stream() {
        let bus = Arc::new(Mutex::new(BusState::default()));
        let stream = Arc::new(Mutex::new(StreamState::default()));
        let mut sitcp = stream_transport(&bus, &stream);

        sitcp.write(DATA_ADDR_LIMIT, &[9, 8, 7, 6]).unwrap();
        assert_eq!(lock(&stream).written, vec![9, 8, 7, 6]);
    }

    #[test]
    fn fifo_operations_require_a_stream() {
        let state = Arc::new(Mutex::new(BusState::default()));
        let mut sitcp = bus_transport(&state);

        assert!(matches!(
            sitcp.read(DATA_ADDR_LIMIT, 4),
            Err(TransportError::Protocol(ProtocolError::NoStream))
        ));
        assert!(matches!(
            sitcp.start_polling(),
            Err(TransportError::Protocol(ProtocolError::NoStream))
        ));
    }

    #[test]
    fn poller_collects_stream_data() {
        let bus = Arc::new(Mutex::new(BusState::default()));
        let stream = Arc::new(Mutex::new(StreamState::default()));
        lock(&stream)
            .chunks
            .push_back(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let mut sitcp = stream_transport(&bus, &stream);

        sitcp.start_polling().unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        while sitcp.fifo_size().unwrap() < 8 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        sitcp.stop_polling();

        assert_eq!(
            sitcp.fifo_data(usize::MAX).unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn register_driver_over_sitcp() {
        use std::collections::HashMap;

        use crate::driver::{DriverOptions, RegisterDriver};
        use crate::model::{AccessSpec, DataKindSpec, RegisterSpec};

        let state = Arc::new(Mutex::new(BusState::default()));
        lock(&state).mem = vec![0; 64];
        let sitcp = bus_transport(&state);

        let regs = [RegisterSpec {
            name: "THRESHOLD".to_owned(),
            kind: DataKindSpec::Value,
            access: AccessSpec::ReadWrite,
            addr: 13,
            size: 10,
            offset: 3,
            default: None,
        }];
        let mut drv = RegisterDriver::new(
            "adc",
            sitcp,
            &regs,
            &HashMap::new(),
            DriverOptions::default(),
        )
        .unwrap();

        drv.set_value("THRESHOLD", 0x313).unwrap();
        assert_eq!(drv.get_value("THRESHOLD").unwrap(), 0x313);
        assert_eq!(lock(&state).mem[13], 0b0001_1000);
        assert_eq!(lock(&state).mem[14], 0b1001_1000);
    }

    #[test]
    fn poller_stops_after_repeated_errors() {
        let bus = Arc::new(Mutex::new(BusState::default()));
        let stream = Arc::new(Mutex::new(StreamState::default()));
        lock(&stream).fail_reads = true;

        let mut sitcp = SiTcp::new(
            "test",
            Box::new(BusLink(bus.clone())),
            Some(Box::new(FakeStream(stream.clone()))),
            SiTcpConfig {
                max_poll_errors: 2,
                ..quick_config()
            },
        );

        // reset_fifo inside start_polling must not hit the failing reads
        lock(&stream).fail_reads = false;
        sitcp.start_polling().unwrap();
        lock(&stream).fail_reads = true;

        let deadline = Instant::now() + Duration::from_secs(1);
        while sitcp.is_polling() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!sitcp.is_polling());
        sitcp.stop_polling();
    }
}
