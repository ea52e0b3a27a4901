//! ISO-TP Engine (C2): ISO 15765-2 segmentation and reassembly over 8-byte
//! CAN frames, carried by a [`FrameTransport`].
//!
//! Strictly synchronous: one [`IsoTpEngine::send_receive`] call blocks until
//! it has either a fully reassembled reply or a typed error. There is no
//! background actor here; the caller's thread does all the waiting, which is
//! what lets the Session/Security layer share one mutex between the
//! foreground request path and the tester-present watchdog (see
//! [`crate::connection`]).

use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::IsoTpError;
use crate::transport::{Frame, FrameTransport};

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

/// Tuning knobs for the ISO-TP engine. Defaults match §4.2/§8's prose.
#[derive(Debug, Clone, Copy)]
pub struct IsoTpSettings {
    /// How long to wait for a Flow Control frame after sending a First Frame.
    pub fc_timeout: Duration,
    /// How long to wait for a complete reassembled response.
    pub timeout: Duration,
}

impl Default for IsoTpSettings {
    fn default() -> Self {
        Self {
            fc_timeout: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Interprets an STmin byte per §4.2: `0x00..=0x7F` is milliseconds,
/// `0xF1..=0xF9` is `100..900` microseconds, anything else is zero.
fn stmin_to_duration(stmin: u8) -> Duration {
    match stmin {
        0x00..=0x7F => Duration::from_millis(stmin as u64),
        0xF1..=0xF9 => Duration::from_micros((stmin - 0xF1) as u64 * 100 + 100),
        _ => Duration::ZERO,
    }
}

/// Flow control parameters captured from the ECU's `0x30` frame.
#[derive(Debug, Clone, Copy)]
struct FlowControl {
    block_size: u8,
    stmin: Duration,
}

/// A synchronous ISO-TP engine bound to one [`FrameTransport`] and a fixed
/// tx/rx identifier pair.
pub struct IsoTpEngine<S> {
    transport: FrameTransport<S>,
    tx_id: u32,
    rx_id: u32,
    settings: IsoTpSettings,
}

impl<S> std::fmt::Debug for IsoTpEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoTpEngine")
            .field("tx_id", &self.tx_id)
            .field("rx_id", &self.rx_id)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<S: Read + Write> IsoTpEngine<S> {
    /// Binds the engine to `transport`, sending on `tx_id` and expecting
    /// replies on `rx_id`.
    pub fn new(transport: FrameTransport<S>, tx_id: u32, rx_id: u32, settings: IsoTpSettings) -> Self {
        Self {
            transport,
            tx_id,
            rx_id,
            settings,
        }
    }

    /// Sends `payload` and returns the fully reassembled response.
    pub fn send_receive(&mut self, payload: &[u8]) -> Result<Vec<u8>, IsoTpError> {
        self.send(payload)?;
        self.receive()
    }

    /// Segments and transmits `payload`, without waiting for a reply.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), IsoTpError> {
        if payload.len() <= 7 {
            let mut frame = vec![PCI_SINGLE << 4 | payload.len() as u8];
            frame.extend_from_slice(payload);
            self.write_padded(&frame)?;
            return Ok(());
        }

        let total_len = payload.len() as u16;
        let mut first = vec![
            PCI_FIRST << 4 | ((total_len >> 8) & 0x0F) as u8,
            (total_len & 0xFF) as u8,
        ];
        first.extend_from_slice(&payload[..6]);
        self.write_padded(&first)?;

        let mut fc = self.await_flow_control()?;
        let mut sent = 6usize;
        let mut seq: u8 = 1;
        let mut since_fc = 0u8;
        while sent < payload.len() {
            let end = (sent + 7).min(payload.len());
            let mut cf = vec![PCI_CONSECUTIVE << 4 | seq];
            cf.extend_from_slice(&payload[sent..end]);
            if cf.len() > 1 {
                thread::sleep(fc.stmin);
            }
            self.write_padded(&cf)?;
            sent = end;
            seq = (seq + 1) & 0x0F;
            since_fc += 1;

            if fc.block_size != 0 && since_fc == fc.block_size && sent < payload.len() {
                fc = self.await_flow_control()?;
                since_fc = 0;
            }
        }
        Ok(())
    }

    /// Waits for and reassembles one response.
    pub fn receive(&mut self) -> Result<Vec<u8>, IsoTpError> {
        let deadline = Instant::now() + self.settings.timeout;
        let frame = self.read_frame_from_rx(deadline)?;
        if frame.payload.is_empty() {
            return Err(IsoTpError::InvalidFrame { byte: 0 });
        }
        let pci_type = frame.payload[0] >> 4;
        match pci_type {
            t if t == PCI_SINGLE => {
                let n = (frame.payload[0] & 0x0F) as usize;
                Ok(frame.payload.get(1..1 + n).unwrap_or_default().to_vec())
            }
            t if t == PCI_FIRST => {
                if frame.payload.len() < 2 {
                    return Err(IsoTpError::InvalidFrame { byte: frame.payload[0] });
                }
                let total_len =
                    (((frame.payload[0] & 0x0F) as usize) << 8) | frame.payload[1] as usize;
                let mut buf = Vec::with_capacity(total_len);
                buf.extend_from_slice(&frame.payload[2..frame.payload.len().min(8)]);

                self.send_flow_control(0, 0)?;

                let mut expected_seq: u8 = 1;
                while buf.len() < total_len {
                    let cf = self.read_frame_from_rx(deadline)?;
                    if cf.payload.is_empty() || cf.payload[0] >> 4 != PCI_CONSECUTIVE {
                        return Err(IsoTpError::InvalidFrame {
                            byte: *cf.payload.first().unwrap_or(&0),
                        });
                    }
                    let got = cf.payload[0] & 0x0F;
                    if got != expected_seq {
                        return Err(IsoTpError::SequenceError {
                            expected: expected_seq,
                            got,
                        });
                    }
                    let remaining = total_len - buf.len();
                    let take = remaining.min(cf.payload.len() - 1);
                    buf.extend_from_slice(&cf.payload[1..1 + take]);
                    expected_seq = (expected_seq + 1) & 0x0F;
                }
                Ok(buf)
            }
            _ => Err(IsoTpError::InvalidFrame { byte: frame.payload[0] }),
        }
    }

    fn await_flow_control(&mut self) -> Result<FlowControl, IsoTpError> {
        let deadline = Instant::now() + self.settings.fc_timeout;
        let frame = self.read_frame_from_rx(deadline)?;
        if frame.payload.is_empty() || frame.payload[0] >> 4 != PCI_FLOW_CONTROL {
            return Err(IsoTpError::NoFlowControl);
        }
        let block_size = *frame.payload.get(1).unwrap_or(&0);
        let stmin = stmin_to_duration(*frame.payload.get(2).unwrap_or(&0));
        Ok(FlowControl { block_size, stmin })
    }

    fn send_flow_control(&mut self, block_size: u8, stmin: u8) -> Result<(), IsoTpError> {
        self.write_padded(&[PCI_FLOW_CONTROL << 4, block_size, stmin])
    }

    fn write_padded(&mut self, bytes: &[u8]) -> Result<(), IsoTpError> {
        let mut payload = bytes.to_vec();
        payload.resize(8, 0x00);
        self.transport
            .write_frame(&Frame::new(self.tx_id, payload))
            .map_err(IsoTpError::from)
    }

    fn read_frame_from_rx(&mut self, deadline: Instant) -> Result<Frame, IsoTpError> {
        loop {
            if Instant::now() >= deadline {
                return Err(IsoTpError::Channel(crate::error::ChannelError::Timeout));
            }
            let frame = self.transport.read_frame()?;
            if frame.id == self.rx_id {
                return Ok(frame);
            }
            // Frame from a different identifier: keep waiting until deadline.
        }
    }
}
