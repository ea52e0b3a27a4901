//! Typed error hierarchy for the diagnostic stack.
//!
//! Errors are layered the way the protocol stack itself is layered: transport
//! faults bubble out of the frame transport untouched, ISO-TP wraps them with
//! segmentation-specific failure modes, and the diagnostic layer wraps ISO-TP
//! errors with service-level and session-level failure modes. Each layer only
//! adds the variants it can actually produce.

use thiserror::Error;

/// Errors produced by the byte-stream frame transport (C1).
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The configured read timeout elapsed before a full frame arrived.
    #[error("timed out waiting for a frame")]
    Timeout,
    /// The underlying serial device could not be opened or configured.
    #[error("port unavailable: {0}")]
    PortUnavailable(String),
    /// Any other I/O failure while reading or writing the byte stream.
    #[error("transport I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),
}

/// Errors produced by the ISO-TP segmentation/reassembly engine (C2).
#[derive(Debug, Error)]
pub enum IsoTpError {
    /// A frame's leading byte did not match any known PCI type.
    #[error("invalid frame: PCI byte 0x{byte:02X}")]
    InvalidFrame {
        /// The offending PCI byte.
        byte: u8,
    },
    /// A consecutive frame arrived with an unexpected sequence number.
    #[error("sequence error: expected {expected}, got {got}")]
    SequenceError {
        /// The sequence number the engine expected next.
        expected: u8,
        /// The sequence number actually observed.
        got: u8,
    },
    /// No Flow Control frame arrived within `fc_timeout` of a First Frame.
    #[error("no flow control received")]
    NoFlowControl,
    /// The underlying frame transport failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Errors produced by the service dispatcher and everything built on it
/// (C3-C7): session control, security access, flashing, DTC handling.
#[derive(Debug, Error)]
pub enum DiagError {
    /// The ISO-TP layer failed to deliver or receive a message.
    #[error(transparent)]
    IsoTp(#[from] IsoTpError),
    /// The response did not fit the `Positive`/`Negative` wire shape at all.
    #[error("malformed response: {0:02X?}")]
    MalformedResponse(Vec<u8>),
    /// The ECU returned a negative response with the given NRC.
    #[error("ECU rejected service 0x{service:02X} with NRC 0x{nrc:02X}")]
    Negative {
        /// The service ID that was rejected.
        service: u8,
        /// The negative response code returned by the ECU.
        nrc: u8,
    },
    /// A session-control request was rejected by the ECU.
    #[error("session control rejected")]
    SessionRejected,
    /// A security-access key was rejected by the ECU.
    #[error("security access denied")]
    SecurityDenied,
    /// An erase routine failed at the given address.
    #[error("erase failed at 0x{address:08X}")]
    EraseFailed {
        /// The sector start address the erase targeted.
        address: u32,
    },
    /// A block write failed at the given address.
    #[error("write failed at 0x{address:08X}")]
    WriteFailed {
        /// The address of the block that failed to write.
        address: u32,
    },
    /// Read-back verification did not match the expected image at the given address.
    #[error("verify failed at 0x{address:08X}")]
    VerifyFailed {
        /// The first mismatching address.
        address: u32,
    },
    /// The supplied image is larger than the memory map can hold.
    #[error("image too large for memory map")]
    ImageTooLarge,
    /// An operation targeted a sector marked `protected`.
    #[error("sector {0:?} is protected")]
    SectorProtected(String),
    /// No connection has been established yet.
    #[error("not connected")]
    NotConnected,
    /// The requested operation requires a programming session.
    #[error("not in a programming session")]
    NotInProgrammingSession,
    /// The requested operation requires security access to be unlocked.
    #[error("security access not unlocked")]
    NotUnlocked,
}

/// Convenience alias used throughout the crate.
pub type DiagResult<T> = Result<T, DiagError>;
