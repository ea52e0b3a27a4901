//! The dual-dialect tag (C3-C6's shared vocabulary).
//!
//! Rather than two parallel class hierarchies, the dialect is modeled as a
//! tagged enum carrying per-dialect service IDs and encoding rules; the
//! dispatcher, session layer, memory-map lookups and flash orchestrator all
//! switch on this one tag instead of being generic over a trait per dialect.

use std::fmt;

/// Which diagnostic service set a connection speaks. Determined once at
/// connect time and immutable for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Dialect {
    /// Keyword Protocol 2000 (ISO 14230).
    Kwp2000,
    /// Unified Diagnostic Services (ISO 14229).
    Uds,
}

/// KWP2000 service identifiers used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KwpCommand {
    /// Start Diagnostic Session.
    StartDiagnosticSession = 0x10,
    /// ECU Reset.
    EcuReset = 0x11,
    /// Clear Diagnostic Information.
    ClearDiagnosticInformation = 0x14,
    /// Read Status Of Diagnostic Trouble Codes.
    ReadStatusOfDtc = 0x18,
    /// Read ECU Identification.
    ReadEcuIdentification = 0x1A,
    /// Security Access.
    SecurityAccess = 0x27,
    /// Tester Present.
    TesterPresent = 0x3E,
    /// Read Memory By Address.
    ReadMemoryByAddress = 0x23,
    /// Write Memory By Address.
    WriteMemoryByAddress = 0x3D,
    /// Start Routine By Local Identifier.
    StartRoutineByLocalIdent = 0x31,
    /// Read Data By Local Identifier.
    ReadDataByLocalIdent = 0x21,
}

/// UDS service identifiers used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UdsCommand {
    /// Diagnostic Session Control.
    DiagnosticSessionControl = 0x10,
    /// ECU Reset.
    EcuReset = 0x11,
    /// Clear Diagnostic Information.
    ClearDiagnosticInformation = 0x14,
    /// Read DTC Information.
    ReadDtcInformation = 0x19,
    /// Read Data By Identifier.
    ReadDataByIdentifier = 0x22,
    /// Read Memory By Address.
    ReadMemoryByAddress = 0x23,
    /// Security Access.
    SecurityAccess = 0x27,
    /// Request Download.
    RequestDownload = 0x34,
    /// Transfer Data.
    TransferData = 0x36,
    /// Request Transfer Exit.
    RequestTransferExit = 0x37,
    /// Tester Present.
    TesterPresent = 0x3E,
    /// Routine Control.
    RoutineControl = 0x31,
}

/// A diagnostic session kind, independent of dialect. Maps to the
/// dialect-appropriate sub-function byte via [`Dialect::session_subfunction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// The session the ECU boots into; only non-intrusive services allowed.
    Default,
    /// Reprogramming session; only read/write-memory services allowed.
    Programming,
    /// Every service is available.
    Extended,
}

/// Which ECU identifier is being requested, independent of dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentField {
    /// Vehicle Identification Number.
    Vin,
    /// ECU identifier / part number.
    EcuId,
    /// Software version.
    SwVersion,
    /// Hardware version.
    HwVersion,
    /// Boot-software identifier, used to probe for bootloader mode.
    BootSoftware,
}

impl fmt::Display for KwpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X}", *self as u8)
    }
}

impl fmt::Display for UdsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X}", *self as u8)
    }
}

impl Dialect {
    /// The service ID for starting/changing a diagnostic session.
    pub fn session_control_sid(self) -> u8 {
        match self {
            Dialect::Kwp2000 => KwpCommand::StartDiagnosticSession as u8,
            Dialect::Uds => UdsCommand::DiagnosticSessionControl as u8,
        }
    }

    /// The sub-function byte for entering the given session kind. Per §4.4,
    /// KWP uses 0x85 for the programming transition; UDS uses 0x02.
    pub fn session_subfunction(self, kind: SessionKind) -> u8 {
        match (self, kind) {
            (Dialect::Kwp2000, SessionKind::Default) => 0x81,
            (Dialect::Kwp2000, SessionKind::Programming) => 0x85,
            (Dialect::Kwp2000, SessionKind::Extended) => 0x92,
            (Dialect::Uds, SessionKind::Default) => 0x01,
            (Dialect::Uds, SessionKind::Programming) => 0x02,
            (Dialect::Uds, SessionKind::Extended) => 0x03,
        }
    }

    /// The service ID for Tester Present.
    pub fn tester_present_sid(self) -> u8 {
        match self {
            Dialect::Kwp2000 => KwpCommand::TesterPresent as u8,
            Dialect::Uds => UdsCommand::TesterPresent as u8,
        }
    }

    /// The service ID for Security Access (sub-functions 0x01/0x02 are
    /// shared between dialects).
    pub fn security_access_sid(self) -> u8 {
        match self {
            Dialect::Kwp2000 => KwpCommand::SecurityAccess as u8,
            Dialect::Uds => UdsCommand::SecurityAccess as u8,
        }
    }

    /// The service ID for ECU Reset.
    pub fn ecu_reset_sid(self) -> u8 {
        match self {
            Dialect::Kwp2000 => KwpCommand::EcuReset as u8,
            Dialect::Uds => UdsCommand::EcuReset as u8,
        }
    }

    /// The service ID for Clear Diagnostic Information.
    pub fn clear_dtc_sid(self) -> u8 {
        match self {
            Dialect::Kwp2000 => KwpCommand::ClearDiagnosticInformation as u8,
            Dialect::Uds => UdsCommand::ClearDiagnosticInformation as u8,
        }
    }

    /// The service ID for reading DTCs.
    pub fn read_dtc_sid(self) -> u8 {
        match self {
            Dialect::Kwp2000 => KwpCommand::ReadStatusOfDtc as u8,
            Dialect::Uds => UdsCommand::ReadDtcInformation as u8,
        }
    }

    /// Request argument bytes that follow the read-DTC SID (§4.7).
    pub fn read_dtc_args(self) -> &'static [u8] {
        match self {
            Dialect::Kwp2000 => &[0x00],
            Dialect::Uds => &[0x02, 0xFF],
        }
    }

    /// The service ID + leading argument bytes used to read `field`, and
    /// whether the identifier is one byte (KWP local/sub-id) or two (UDS DID).
    pub fn ident_request(self, field: IdentField) -> (u8, Vec<u8>) {
        match self {
            Dialect::Kwp2000 => {
                let sub = match field {
                    IdentField::Vin => 0x90,
                    IdentField::EcuId => 0x92,
                    IdentField::SwVersion => 0x94,
                    IdentField::HwVersion => 0x93,
                    IdentField::BootSoftware => 0x01,
                };
                (KwpCommand::ReadEcuIdentification as u8, vec![sub])
            }
            Dialect::Uds => {
                let did: u16 = match field {
                    IdentField::Vin => 0xF190,
                    IdentField::EcuId => 0xF18A,
                    IdentField::SwVersion => 0xF189,
                    IdentField::HwVersion => 0xF191,
                    IdentField::BootSoftware => 0xF180,
                };
                (
                    UdsCommand::ReadDataByIdentifier as u8,
                    did.to_be_bytes().to_vec(),
                )
            }
        }
    }

    /// How many leading bytes of a positive identifier-read response are
    /// echoed sub-function/DID bytes (to be skipped before the ASCII payload).
    pub fn ident_echo_len(self) -> usize {
        match self {
            Dialect::Kwp2000 => 1,
            Dialect::Uds => 2,
        }
    }
}
