#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! A diagnostic and reprogramming client for a BMW-family ECU set,
//! communicating over a CAN bus through a USB-to-serial adapter.
//!
//! The crate is a three-layer protocol stack:
//!
//! * [`isotp`] segments and reassembles diagnostic payloads over 8-byte CAN
//!   frames per ISO 15765-2, carried by [`transport`].
//! * [`dispatcher`] encodes one request/response pair in either dialect
//!   ([`dialect::Dialect::Kwp2000`] or [`dialect::Dialect::Uds`]) and handles
//!   negative responses and "response pending" retries.
//! * [`flash`] composes session control ([`connection`]), seed/key security
//!   access ([`security`]), sector erase, block transfer, and verification
//!   into a resumable reprogramming sequence, guided by the memory map
//!   registry in [`memory_map`].
//!
//! [`dtc`] reads and clears diagnostic trouble codes in both dialects, and
//! [`identity`] reads VIN/ECU-ID/version strings and classifies the ECU
//! variant.

pub mod connection;
pub mod dialect;
pub mod dispatcher;
pub mod dtc;
pub mod error;
pub mod flash;
pub mod identity;
pub mod isotp;
pub mod memory_map;
pub mod security;
pub mod transport;

pub use error::{ChannelError, DiagError, DiagResult, IsoTpError};
