//! ECU identity reads (C5): VIN, ECU ID, software/hardware version, and the
//! bootloader-mode probe.

use std::io::{Read, Write};

use crate::dialect::{Dialect, IdentField};
use crate::dispatcher;
use crate::error::DiagError;
use crate::isotp::IsoTpEngine;
use crate::memory_map::{self, MemoryMap};

/// Everything read about a connected ECU, populated once per connection.
#[derive(Debug, Clone)]
pub struct EcuIdentity {
    /// Vehicle Identification Number.
    pub vin: String,
    /// ECU identifier / part number string.
    pub ecu_id: String,
    /// Software version string.
    pub sw_version: String,
    /// Hardware version string.
    pub hw_version: String,
    /// Variant name keying the active [`MemoryMap`].
    pub ecu_variant: &'static str,
    /// Whether the ECU responded as if it were already in bootloader mode.
    pub in_bootloader: bool,
}

/// Decodes an ASCII identifier payload: trims embedded NULs and drops any
/// byte outside the printable ASCII range (§4.5).
pub fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|&&b| (0x20..=0x7E).contains(&b))
        .map(|&b| b as char)
        .collect::<String>()
        .trim_matches('\0')
        .trim()
        .to_string()
}

fn read_field<S: Read + Write>(
    engine: &mut IsoTpEngine<S>,
    dialect: Dialect,
    field: IdentField,
) -> Result<String, DiagError> {
    let (sid, args) = dialect.ident_request(field);
    let resp = dispatcher::dispatch(engine, sid, &args)?;
    let skip = dialect.ident_echo_len().min(resp.len());
    Ok(decode_ascii(&resp[skip..]))
}

/// Reads VIN, ECU ID, SW/HW version, classifies the ECU variant, and probes
/// for bootloader mode. Returns the identity plus the [`MemoryMap`] it selects.
pub fn read_identity<S: Read + Write>(
    engine: &mut IsoTpEngine<S>,
    dialect: Dialect,
) -> Result<(EcuIdentity, MemoryMap), DiagError> {
    let vin = read_field(engine, dialect, IdentField::Vin)?;
    let ecu_id = read_field(engine, dialect, IdentField::EcuId)?;
    let sw_version = read_field(engine, dialect, IdentField::SwVersion)?;
    let hw_version = read_field(engine, dialect, IdentField::HwVersion)?;

    let memory_map = memory_map::classify(&ecu_id);

    // Bootloader presence is advisory (§9 open question): success reading
    // the boot-software identifier is treated as implying bootloader mode,
    // but this is not a reliable distinguisher on every variant.
    let in_bootloader = read_field(engine, dialect, IdentField::BootSoftware).is_ok();

    let identity = EcuIdentity {
        vin,
        ecu_id,
        sw_version,
        hw_version,
        ecu_variant: memory_map.variant,
        in_bootloader,
    };
    Ok((identity, memory_map))
}
