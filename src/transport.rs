//! Frame Transport (C1): pushes and pulls 8-byte CAN frames over a reliable
//! byte-stream carrier.
//!
//! Each frame on the wire is `be_u32(id) || u8(len) || payload[..len]`. The
//! transport does not buffer beyond one frame; callers set a read timeout and
//! get back either a complete frame or [`ChannelError::Timeout`].

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::error::ChannelError;

/// Default CAN identifier used for requests sent to the ECU.
pub const DEFAULT_REQUEST_ID: u32 = 0x6F1;
/// Default CAN identifier used for responses received from the ECU.
pub const DEFAULT_RESPONSE_ID: u32 = 0x6F9;

/// A single CAN frame: an identifier and up to 8 payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 11/29-bit CAN identifier.
    pub id: u32,
    /// Frame payload, at most 8 bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a new frame, truncating the payload silently is never done:
    /// callers are expected to only ever construct frames with <= 8 bytes.
    pub fn new(id: u32, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= 8, "CAN frame payload must be <= 8 bytes");
        Self { id, payload }
    }
}

/// Pushes and pulls whole [`Frame`]s over a byte-duplex carrier.
///
/// Generic over any `Read + Write` so tests can substitute an in-memory
/// duplex pipe instead of a real serial port.
pub struct FrameTransport<S> {
    stream: S,
    read_timeout: Duration,
}

impl<S> std::fmt::Debug for FrameTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTransport")
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl<S: Read + Write> FrameTransport<S> {
    /// Wraps `stream`, defaulting the read timeout to 5 seconds (§4.2's
    /// `timeout` default).
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_timeout: Duration::from_secs(5),
        }
    }

    /// Overrides the read timeout used by [`FrameTransport::read_frame`].
    ///
    /// Note: for a real serial port the timeout must also be configured on
    /// the underlying `SerialPort` (see [`crate::transport::open_serial`]);
    /// this setter only governs the logic in [`FrameTransport::read_frame`]
    /// that detects a short read as a timeout.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Current read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Writes one frame: `be_u32(id) || u8(len) || payload`, then flushes.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        let mut header = Vec::with_capacity(5 + frame.payload.len());
        header.extend_from_slice(&frame.id.to_be_bytes());
        header.push(frame.payload.len() as u8);
        header.extend_from_slice(&frame.payload);
        self.stream.write_all(&header)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads exactly one frame: 5 header bytes, then `len` payload bytes.
    ///
    /// A short read (the carrier produced fewer bytes than required before
    /// giving up) is reported as [`ChannelError::Timeout`]; any other I/O
    /// failure is [`ChannelError::IoFailure`].
    pub fn read_frame(&mut self) -> Result<Frame, ChannelError> {
        let mut header = [0u8; 5];
        self.read_exact_or_timeout(&mut header)?;
        let id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = header[4] as usize;
        let mut payload = vec![0u8; len];
        if len > 0 {
            self.read_exact_or_timeout(&mut payload)?;
        }
        Ok(Frame { id, payload })
    }

    fn read_exact_or_timeout(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ChannelError::Timeout),
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {
                Err(ChannelError::Timeout)
            }
            Err(e) => Err(ChannelError::IoFailure(e)),
        }
    }
}

/// Opens the USB-to-serial adapter at 500000 baud / 8N1 / no flow control
/// (§6), returning a boxed `dyn SerialPort` ready to be wrapped in a
/// [`FrameTransport`].
pub fn open_serial(port: &str, timeout: Duration) -> Result<Box<dyn serialport::SerialPort>, ChannelError> {
    serialport::new(port, 500_000)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(timeout)
        .open()
        .map_err(|e| ChannelError::PortUnavailable(format!("{port}: {e}")))
}
