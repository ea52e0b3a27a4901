//! DTC Subsystem (C7): read and clear diagnostic trouble codes in both
//! dialects, decoded to canonical code strings.

use std::io::{Read, Write};

use bitflags::bitflags;

use crate::connection::Connection;
use crate::dialect::Dialect;
use crate::dispatcher;
use crate::error::DiagError;

bitflags! {
    /// Raw DTC status-availability mask (ISO 14229-1 Annex D bit layout).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DtcStatusMask: u8 {
        /// Test failed on this operation cycle.
        const TEST_FAILED = 0x01;
        /// Test failed this operation cycle.
        const TEST_FAILED_THIS_CYCLE = 0x02;
        /// Pending DTC.
        const PENDING = 0x04;
        /// Confirmed DTC.
        const CONFIRMED = 0x08;
        /// Test not completed since last clear.
        const TEST_NOT_COMPLETED_SINCE_CLEAR = 0x10;
        /// Test failed since last clear.
        const TEST_FAILED_SINCE_CLEAR = 0x20;
        /// Test not completed this operation cycle.
        const TEST_NOT_COMPLETED_THIS_CYCLE = 0x40;
        /// Warning indicator requested.
        const WARNING_INDICATOR_REQUESTED = 0x80;
    }
}

/// One diagnostic trouble code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dtc {
    /// Raw numeric code, as reported by the dialect (2 bytes for KWP2000, 3 for UDS).
    pub code: u32,
    /// Canonical text form, e.g. `"P0300"`.
    pub text: String,
    /// Raw status-availability byte.
    pub status: DtcStatusMask,
    /// Which dialect reported this code, since KWP2000 and UDS pack `code`
    /// at different widths and `to_canonical_string` needs to know which.
    dialect: Dialect,
}

impl Dtc {
    /// Recomputes the canonical code string from `code` and `dialect`
    /// (§4.7 "DTC text rendering"). KWP2000 codes are unconditionally
    /// `P`-prefixed 2-byte values; UDS codes are 3-byte quadruplets whose
    /// high byte's top two bits select the prefix letter.
    pub fn to_canonical_string(&self) -> String {
        match self.dialect {
            Dialect::Kwp2000 => {
                let hi = ((self.code >> 8) & 0xFF) as u8;
                let lo = (self.code & 0xFF) as u8;
                format!("P{hi:02X}{lo:02X}")
            }
            Dialect::Uds => {
                let hi = ((self.code >> 16) & 0xFF) as u8;
                let mid = ((self.code >> 8) & 0xFF) as u8;
                let lo = (self.code & 0xFF) as u8;
                let prefix = match hi & 0xC0 {
                    0x00 => 'P',
                    0x40 => 'C',
                    0x80 => 'B',
                    _ => 'U',
                };
                format!("{prefix}{:X}{mid:02X}{lo:02X}", hi & 0x3F)
            }
        }
    }
}

/// Reads all DTCs currently stored by the ECU (§4.7 "Read").
pub fn read_all<S: Read + Write>(conn: &Connection<S>) -> Result<Vec<Dtc>, DiagError> {
    conn.with_engine(|engine, dialect| {
        let sid = dialect.read_dtc_sid();
        let resp = dispatcher::dispatch(engine, sid, dialect.read_dtc_args())?;
        Ok(parse_dtcs(dialect, &resp))
    })
}

fn parse_dtcs(dialect: Dialect, resp: &[u8]) -> Vec<Dtc> {
    let mut dtcs = Vec::new();
    match dialect {
        Dialect::Kwp2000 => {
            // Triplets: [status, hi, lo]; KWP2000 codes are unconditionally `P`-prefixed.
            for chunk in resp.chunks_exact(3) {
                let (status, hi, lo) = (chunk[0], chunk[1], chunk[2]);
                let mut dtc = Dtc {
                    code: ((hi as u32) << 8) | lo as u32,
                    text: String::new(),
                    status: DtcStatusMask::from_bits_truncate(status),
                    dialect,
                };
                dtc.text = dtc.to_canonical_string();
                dtcs.push(dtc);
            }
        }
        Dialect::Uds => {
            // Leading byte echoes the requested status-availability mask;
            // the rest is quadruplets: [hi, mid, lo, status]. The first two
            // bits of `hi` select the prefix.
            let body = resp.get(1..).unwrap_or_default();
            for chunk in body.chunks_exact(4) {
                let (hi, mid, lo, status) = (chunk[0], chunk[1], chunk[2], chunk[3]);
                let mut dtc = Dtc {
                    code: ((hi as u32) << 16) | ((mid as u32) << 8) | lo as u32,
                    text: String::new(),
                    status: DtcStatusMask::from_bits_truncate(status),
                    dialect,
                };
                dtc.text = dtc.to_canonical_string();
                dtcs.push(dtc);
            }
        }
    }
    dtcs
}

/// Clears all DTCs (§4.7 "Clear"): dialect service 0x14 with `[0xFF,0xFF,0xFF]`.
pub fn clear_all<S: Read + Write>(conn: &Connection<S>) -> Result<(), DiagError> {
    conn.with_engine(|engine, dialect| {
        dispatcher::dispatch(engine, dialect.clear_dtc_sid(), &[0xFF, 0xFF, 0xFF]).map(|_| ())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kwp_triplets_are_unconditionally_p_prefixed() {
        let resp = vec![0x09, 0x03, 0x00]; // status=0x09, hi=0x03, lo=0x00
        let dtcs = parse_dtcs(Dialect::Kwp2000, &resp);
        assert_eq!(dtcs.len(), 1);
        assert_eq!(dtcs[0].text, "P0300");
        assert!(dtcs[0].status.contains(DtcStatusMask::TEST_FAILED));
        assert!(dtcs[0].status.contains(DtcStatusMask::CONFIRMED));
    }

    #[test]
    fn to_canonical_string_matches_the_text_field() {
        let dtcs = parse_dtcs(Dialect::Uds, &[0xFF, 0x43, 0x01, 0x02, 0x08]);
        assert_eq!(dtcs[0].to_canonical_string(), dtcs[0].text);
        assert_eq!(dtcs[0].to_canonical_string(), "C0102");
    }

    #[test]
    fn uds_quadruplets_select_prefix_from_top_bits() {
        // hi=0x03 -> top bits 00 -> 'P'; hi=0x43 -> 'C'; hi=0x83 -> 'B'; hi=0xC3 -> 'U'
        let resp = vec![
            0xFF, // leading status-mask echo byte, skipped
            0x03, 0x00, 0x00, 0x08, // P0000
            0x43, 0x01, 0x02, 0x08, // C0102
            0x83, 0x02, 0x03, 0x08, // B0203
            0xC3, 0x04, 0x05, 0x08, // U0405
        ];
        let dtcs = parse_dtcs(Dialect::Uds, &resp);
        assert_eq!(
            dtcs.iter().map(|d| d.text.clone()).collect::<Vec<_>>(),
            vec!["P0000", "C0102", "B0203", "U0405"]
        );
    }
}
