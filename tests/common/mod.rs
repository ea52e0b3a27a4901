//! A scripted fake-ECU duplex stream shared by the end-to-end tests.
//!
//! Mirrors the style of the per-module loopback fakes in `src/transport.rs`,
//! `src/isotp.rs` and `src/dispatcher.rs`, but shared across a `Clone`able
//! handle so a test can hand one end to a `Connection` while keeping the
//! other to queue scripted replies and inspect what was written.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Instant;

struct Inner {
    to_read: VecDeque<u8>,
    written: Vec<u8>,
    write_times: Vec<Instant>,
}

/// A cloneable, `Read + Write` fake serial carrier backed by shared state.
#[derive(Clone)]
pub struct FakeEcu {
    inner: Arc<Mutex<Inner>>,
}

impl FakeEcu {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                to_read: VecDeque::new(),
                written: Vec::new(),
                write_times: Vec::new(),
            })),
        }
    }

    /// Queues a raw wire-format frame (`be_u32(id) || u8(len) || payload`) to
    /// be handed back on the next reads.
    pub fn queue_frame(&self, id: u32, payload: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.to_read.extend(id.to_be_bytes());
        inner.to_read.push_back(payload.len() as u8);
        inner.to_read.extend(payload.iter().copied());
    }

    /// Every frame written so far, decoded back into `(id, payload)` pairs.
    pub fn written_frames(&self) -> Vec<(u32, Vec<u8>)> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let mut i = 0;
        while i + 5 <= inner.written.len() {
            let id = u32::from_be_bytes([
                inner.written[i],
                inner.written[i + 1],
                inner.written[i + 2],
                inner.written[i + 3],
            ]);
            let len = inner.written[i + 4] as usize;
            let payload = inner.written[i + 5..i + 5 + len].to_vec();
            out.push((id, payload));
            i += 5 + len;
        }
        out
    }

    /// Wall-clock timestamp of each `write()` call, in order.
    pub fn write_timestamps(&self) -> Vec<Instant> {
        self.inner.lock().unwrap().write_times.clone()
    }

    pub fn to_read_is_empty(&self) -> bool {
        self.inner.lock().unwrap().to_read.is_empty()
    }
}

impl Read for FakeEcu {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let n = buf.len().min(inner.to_read.len());
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "fake ECU has nothing queued"));
        }
        for slot in buf.iter_mut().take(n) {
            *slot = inner.to_read.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for FakeEcu {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.written.extend_from_slice(buf);
        inner.write_times.push(Instant::now());
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Builds an ISO-TP Single Frame: PCI `0x0N` + data, right-padded to 8 bytes.
pub fn single_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = vec![data.len() as u8];
    frame.extend_from_slice(data);
    frame.resize(8, 0x00);
    frame
}

/// Builds an ISO-TP First Frame: PCI `0x1` + 12-bit total length + first 6 bytes.
pub fn first_frame(total_len: u16, first_six: &[u8]) -> Vec<u8> {
    assert_eq!(first_six.len(), 6);
    let mut frame = vec![0x10 | ((total_len >> 8) as u8 & 0x0F), (total_len & 0xFF) as u8];
    frame.extend_from_slice(first_six);
    frame
}

/// Builds an ISO-TP Consecutive Frame: PCI `0x2N` + up to 7 data bytes.
pub fn consecutive_frame(seq: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x20 | (seq & 0x0F)];
    frame.extend_from_slice(data);
    frame.resize(8, 0x00);
    frame
}

/// Builds a Flow Control frame: `0x30`, block size, STmin.
pub fn flow_control(block_size: u8, stmin: u8) -> Vec<u8> {
    vec![0x30, block_size, stmin, 0, 0, 0, 0, 0]
}

/// Segments an arbitrary diagnostic payload into the ISO-TP frames that
/// would carry it: one Single Frame if it fits, otherwise a First Frame plus
/// however many Consecutive Frames are needed, sequence wrapping 1..15,0,...
pub fn segment_isotp(payload: &[u8]) -> Vec<Vec<u8>> {
    if payload.len() <= 7 {
        return vec![single_frame(payload)];
    }
    let mut frames = vec![first_frame(payload.len() as u16, &payload[..6])];
    let mut seq: u8 = 1;
    let mut sent = 6;
    while sent < payload.len() {
        let end = (sent + 7).min(payload.len());
        frames.push(consecutive_frame(seq, &payload[sent..end]));
        seq = (seq + 1) & 0x0F;
        sent = end;
    }
    frames
}

/// Queues a full diagnostic reply (already including the leading response
/// SID byte), segmented as needed.
pub fn queue_response(fake: &FakeEcu, id: u32, payload: &[u8]) {
    for frame in segment_isotp(payload) {
        fake.queue_frame(id, &frame);
    }
}

/// Queues everything the fake ECU must hand back for one request/response
/// exchange: a Flow Control first if the outgoing request (SID + data,
/// `request_len`) won't fit a Single Frame, then the reply.
pub fn queue_exchange(fake: &FakeEcu, id: u32, request_len: usize, response_payload: &[u8]) {
    if request_len > 7 {
        fake.queue_frame(id, &flow_control(0, 0));
    }
    queue_response(fake, id, response_payload);
}
