//! Service Dispatcher (C3): encodes one request/response pair and
//! interprets the reply, for either dialect, with identical semantics.
//!
//! The dialect only affects which numeric service IDs and identifiers are
//! meaningful (see [`crate::dialect`]); this module never branches on it.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use crate::error::DiagError;
use crate::isotp::IsoTpEngine;

/// Negative response code meaning "request received, still processing" -
/// the only NRC absorbed by local retry rather than surfaced as an error.
const NRC_RESPONSE_PENDING: u8 = 0x78;
/// Number of times to re-read after a 0x78 before giving up (§4.3/§8).
const RESPONSE_PENDING_RETRIES: u32 = 10;
/// Spacing between those re-reads.
const RESPONSE_PENDING_INTERVAL: Duration = Duration::from_millis(100);

/// Sends one diagnostic request and returns the data that followed a
/// positive response, retrying transparently on NRC 0x78.
pub fn dispatch<S: Read + Write>(
    engine: &mut IsoTpEngine<S>,
    service_id: u8,
    data: &[u8],
) -> Result<Vec<u8>, DiagError> {
    let mut request = Vec::with_capacity(1 + data.len());
    request.push(service_id);
    request.extend_from_slice(data);

    let mut reply = engine.send_receive(&request)?;
    for _ in 0..RESPONSE_PENDING_RETRIES {
        match interpret(service_id, &reply)? {
            Interpretation::Positive(payload) => return Ok(payload),
            Interpretation::ResponsePending => {
                thread::sleep(RESPONSE_PENDING_INTERVAL);
                reply = engine.receive()?;
            }
        }
    }
    // Retries exhausted: return whatever the final reply amounted to.
    match interpret(service_id, &reply)? {
        Interpretation::Positive(payload) => Ok(payload),
        Interpretation::ResponsePending => Err(DiagError::Negative {
            service: service_id,
            nrc: NRC_RESPONSE_PENDING,
        }),
    }
}

/// Sends a request without waiting for or validating a response, used for
/// fire-and-forget services such as a hard reset (§4.6).
pub fn dispatch_no_response<S: Read + Write>(
    engine: &mut IsoTpEngine<S>,
    service_id: u8,
    data: &[u8],
) -> Result<(), DiagError> {
    let mut request = Vec::with_capacity(1 + data.len());
    request.push(service_id);
    request.extend_from_slice(data);
    engine.send(&request)?;
    Ok(())
}

enum Interpretation {
    Positive(Vec<u8>),
    ResponsePending,
}

fn interpret(service_id: u8, reply: &[u8]) -> Result<Interpretation, DiagError> {
    match reply.first() {
        Some(&b) if b == service_id.wrapping_add(0x40) => {
            Ok(Interpretation::Positive(reply[1..].to_vec()))
        }
        Some(0x7F) if reply.get(1) == Some(&service_id) => {
            let nrc = *reply.get(2).ok_or_else(|| DiagError::MalformedResponse(reply.to_vec()))?;
            if nrc == NRC_RESPONSE_PENDING {
                Ok(Interpretation::ResponsePending)
            } else {
                Err(DiagError::Negative { service: service_id, nrc })
            }
        }
        _ => Err(DiagError::MalformedResponse(reply.to_vec())),
    }
}
