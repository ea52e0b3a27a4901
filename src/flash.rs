//! Flash Orchestrator (C6): the linear state machine that composes session
//! control, security access, per-sector erase/download, verification, and
//! reset into one reprogramming or backup sequence.
//!
//! ```text
//! Idle -> Connecting -> Identifying -> ProgrammingSession -> SecurityAccess
//!      -> PerSector{ Erase -> Download } -> Verify -> Reset -> Done
//! ```
//! Any error transitions to `Aborted` and is surfaced with the offending
//! sector/address (§4.6).

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::connection::{Connection, SecurityState, SessionState};
use crate::dialect::{Dialect, SessionKind};
use crate::dispatcher;
use crate::error::DiagError;
use crate::memory_map::{MemoryMap, Sector};

/// Guards the entry points that read or write flash memory directly
/// (`verify`, `backup`): the original tool requires an active programming
/// session and granted security access before either (`backup_ecu`,
/// `flash_ecu`). `flash()` itself always satisfies this before calling
/// `verify`; this exists for callers that invoke `verify`/`backup` standalone.
fn require_unlocked<S: Read + Write>(conn: &Connection<S>) -> Result<(), DiagError> {
    if conn.session_state() != SessionState::Programming {
        return Err(DiagError::NotInProgrammingSession);
    }
    if !matches!(conn.security_state(), SecurityState::Unlocked(_)) {
        return Err(DiagError::NotUnlocked);
    }
    Ok(())
}

/// Routine Control sub-function: start a routine (ISO 14229-1 §B.1).
const ROUTINE_CONTROL_START: u8 = 0x01;
/// BMW-family erase-sector routine identifier (§4.6, §9 open question).
const ROUTINE_ERASE_MEMORY_SECTOR: u16 = 0xFF02;
/// Hard reset sub-function for service 0x11.
const ECU_RESET_HARD: u8 = 0x01;
/// Tester-present is re-sent after this many bytes within a sector (§4.6 step 5).
const TESTER_PRESENT_BYTE_INTERVAL: u64 = 64 * 1024;
/// Verification reads are capped at this block size (§4.6 "Verify").
const VERIFY_BLOCK_CAP: u32 = 4096;

/// Coarse state of the orchestrator, surfaced to callers that want to show
/// progress beyond the byte-level [`FlashProgress`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// Nothing has happened yet.
    Idle,
    /// Entering the programming session.
    ProgrammingSession,
    /// Running the seed/key challenge.
    SecurityAccess,
    /// Erasing and writing sectors.
    PerSector,
    /// Re-reading and comparing sectors.
    Verify,
    /// Issuing the hard reset.
    Reset,
    /// Finished successfully.
    Done,
    /// An error ended the sequence early.
    Aborted,
}

/// Reported once per block written, read, or verified.
#[derive(Debug, Clone)]
pub struct FlashProgress {
    /// Bytes processed so far across the whole image.
    pub bytes_written: u64,
    /// Total bytes in the image (sum of non-protected sector sizes).
    pub total_bytes: u64,
    /// Name of the sector currently being processed.
    pub sector: String,
}

/// Checked once per block boundary; long operations observe cancellation
/// only between blocks, never mid-frame-exchange (§5).
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that starts un-cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Raised when a caller-requested cancellation was observed at a block
/// boundary; the session has already been aborted (returned to default
/// session) by the time this is returned.
#[derive(Debug)]
pub struct Cancelled;

/// Slices `image` for `sector`, right-padding with `0xFF` if `image` is
/// shorter than the sector (§4.6 step 2).
fn sector_slice(image: &[u8], memory_map: &MemoryMap, sector: &Sector) -> Vec<u8> {
    let data_start = (sector.start - memory_map.flash_start) as usize;
    let mut data = if data_start < image.len() {
        image[data_start..(data_start + sector.size as usize).min(image.len())].to_vec()
    } else {
        Vec::new()
    };
    data.resize(sector.size as usize, 0xFF);
    data
}

/// Guards against erasing or writing a sector marked `protected` (§4.6 step
/// 2: "Skip protected sectors", matching the original tool's `flash_ecu`).
fn ensure_writable(sector: &Sector) -> Result<(), DiagError> {
    if sector.protected {
        return Err(DiagError::SectorProtected(sector.name.clone()));
    }
    Ok(())
}

fn erase_sector<S: Read + Write>(conn: &Connection<S>, sector: &Sector) -> Result<(), DiagError> {
    conn.with_engine(|engine, dialect| {
        let routine_id = ROUTINE_ERASE_MEMORY_SECTOR.to_be_bytes();
        let mut args = vec![ROUTINE_CONTROL_START, routine_id[0], routine_id[1]];
        args.extend_from_slice(&sector.start.to_be_bytes());
        args.extend_from_slice(&sector.size.to_be_bytes());
        let sid = match dialect {
            Dialect::Kwp2000 => crate::dialect::KwpCommand::StartRoutineByLocalIdent as u8,
            Dialect::Uds => crate::dialect::UdsCommand::RoutineControl as u8,
        };
        dispatcher::dispatch(engine, sid, &args)
            .map(|_| ())
            .map_err(|_| DiagError::EraseFailed { address: sector.start })
    })
}

fn write_sector<S: Read + Write>(
    conn: &Connection<S>,
    memory_map: &MemoryMap,
    sector: &Sector,
    data: &[u8],
    bytes_written: &mut u64,
    total_bytes: u64,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(FlashProgress),
) -> Result<(), DiagError> {
    match memory_map.protocol {
        Dialect::Kwp2000 => {
            for (offset, block) in data.chunks(memory_map.transfer_size as usize).enumerate() {
                if cancel.is_cancelled() {
                    return abort_for_cancellation(conn);
                }
                let address = sector.start + (offset * memory_map.transfer_size as usize) as u32;
                conn.with_engine(|engine, _| {
                    let mut args = address.to_be_bytes().to_vec();
                    args.extend_from_slice(block);
                    dispatcher::dispatch(
                        engine,
                        crate::dialect::KwpCommand::WriteMemoryByAddress as u8,
                        &args,
                    )
                    .map(|_| ())
                    .map_err(|_| DiagError::WriteFailed { address })
                })?;
                *bytes_written += block.len() as u64;
                maybe_tester_present(conn, offset as u64 * memory_map.transfer_size as u64);
                on_progress(FlashProgress {
                    bytes_written: *bytes_written,
                    total_bytes,
                    sector: sector.name.to_string(),
                });
            }
        }
        Dialect::Uds => {
            let max_block = conn.with_engine(|engine, _| {
                let mut args = vec![0x00, 0x24];
                args.extend_from_slice(&sector.start.to_be_bytes());
                args.push(0x24);
                args.extend_from_slice(&(data.len() as u32).to_be_bytes());
                let resp = dispatcher::dispatch(engine, crate::dialect::UdsCommand::RequestDownload as u8, &args)
                    .map_err(|_| DiagError::WriteFailed { address: sector.start })?;
                let max = resp
                    .get(1..)
                    .map(|b| {
                        let mut buf = [0u8; 4];
                        let n = b.len().min(4);
                        buf[4 - n..].copy_from_slice(&b[b.len() - n..]);
                        u32::from_be_bytes(buf)
                    })
                    .filter(|&m| m > 0)
                    .unwrap_or(memory_map.transfer_size);
                Ok(max)
            })?;
            let block_size = (max_block as usize).min(memory_map.transfer_size as usize).max(1);

            let mut seq: u8 = 1;
            for (i, block) in data.chunks(block_size).enumerate() {
                if cancel.is_cancelled() {
                    return abort_for_cancellation(conn);
                }
                let address = sector.start + (i * block_size) as u32;
                conn.with_engine(|engine, _| {
                    let mut args = vec![seq];
                    args.extend_from_slice(block);
                    dispatcher::dispatch(engine, crate::dialect::UdsCommand::TransferData as u8, &args)
                        .map(|_| ())
                        .map_err(|_| DiagError::WriteFailed { address })
                })?;
                seq = seq.wrapping_add(1);
                *bytes_written += block.len() as u64;
                maybe_tester_present(conn, i as u64 * block_size as u64);
                on_progress(FlashProgress {
                    bytes_written: *bytes_written,
                    total_bytes,
                    sector: sector.name.to_string(),
                });
            }
            conn.with_engine(|engine, _| {
                dispatcher::dispatch(engine, crate::dialect::UdsCommand::RequestTransferExit as u8, &[])
                    .map(|_| ())
                    .map_err(|_| DiagError::WriteFailed { address: sector.start })
            })?;
        }
    }
    Ok(())
}

fn maybe_tester_present<S: Read + Write>(conn: &Connection<S>, offset: u64) {
    if offset > 0 && offset % TESTER_PRESENT_BYTE_INTERVAL == 0 {
        let _ = conn.with_engine(|engine, dialect| {
            dispatcher::dispatch(engine, dialect.tester_present_sid(), &[0x00]).map(|_| ())
        });
    }
}

/// Raised when cancellation is observed at a block boundary; `flash`'s outer
/// error handler performs the actual session-abort (return to default
/// session), so this only needs to signal the condition.
fn abort_for_cancellation<S: Read + Write>(_conn: &Connection<S>) -> Result<(), DiagError> {
    Err(DiagError::NotInProgrammingSession)
}

/// Flashes `image` onto the ECU described by `memory_map`: enters the
/// programming session, unlocks security access, then erases and writes
/// every non-protected sector in ascending start order, and finally verifies.
///
/// Any error aborts the sequence. Per §8's invariant, an aborted sequence
/// never leaves the connection showing `SessionState::Programming` or
/// `SecurityState::Unlocked`: on the way out, a best-effort return to the
/// default session resets both (`start_session` always resets security to
/// `Locked` on success, per §4.4), mirroring the session-abort routine §5
/// describes for cancellation, generalized to every error path.
pub fn flash<S: Read + Write>(
    conn: &Connection<S>,
    memory_map: &MemoryMap,
    image: &[u8],
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(FlashProgress),
) -> Result<(), DiagError> {
    if image.len() as u32 > memory_map.flash_size {
        return Err(DiagError::ImageTooLarge);
    }

    match flash_inner(conn, memory_map, image, cancel, &mut on_progress) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = conn.start_session(SessionKind::Default);
            Err(e)
        }
    }
}

fn flash_inner<S: Read + Write>(
    conn: &Connection<S>,
    memory_map: &MemoryMap,
    image: &[u8],
    cancel: &CancellationToken,
    on_progress: &mut impl FnMut(FlashProgress),
) -> Result<(), DiagError> {
    conn.start_session(SessionKind::Programming)?;
    conn.unlock_security(memory_map)?;

    let total_bytes: u64 = memory_map
        .sectors
        .iter()
        .filter(|s| !s.protected)
        .map(|s| s.size as u64)
        .sum();
    let mut bytes_written = 0u64;

    let mut sorted_sectors = memory_map.sectors.clone();
    sorted_sectors.sort_by_key(|s| s.start);

    for sector in &sorted_sectors {
        if let Err(DiagError::SectorProtected(name)) = ensure_writable(sector) {
            log::info!("skipping protected sector: {name}");
            continue;
        }
        let data = sector_slice(image, memory_map, sector);
        if memory_map.erase_required {
            erase_sector(conn, sector)?;
        }
        write_sector(
            conn,
            memory_map,
            sector,
            &data,
            &mut bytes_written,
            total_bytes,
            cancel,
            &mut *on_progress,
        )?;
    }

    verify(conn, memory_map, image)?;
    reset(conn)
}

/// Re-reads every non-protected sector and compares it against `image`
/// (padded the same way writing does); the first mismatch aborts with
/// `VerifyFailed{address}` (§4.6 "Verify").
pub fn verify<S: Read + Write>(conn: &Connection<S>, memory_map: &MemoryMap, image: &[u8]) -> Result<(), DiagError> {
    require_unlocked(conn)?;
    for sector in &memory_map.sectors {
        if sector.protected {
            continue;
        }
        let expected = sector_slice(image, memory_map, sector);
        let block_size = memory_map.transfer_size.min(VERIFY_BLOCK_CAP) as usize;
        for (i, expected_block) in expected.chunks(block_size).enumerate() {
            let address = sector.start + (i * block_size) as u32;
            let actual = read_memory(conn, memory_map.protocol, address, expected_block.len())?;
            if actual != expected_block {
                return Err(DiagError::VerifyFailed { address });
            }
        }
    }
    Ok(())
}

fn read_memory<S: Read + Write>(
    conn: &Connection<S>,
    dialect: Dialect,
    address: u32,
    len: usize,
) -> Result<Vec<u8>, DiagError> {
    conn.with_engine(|engine, _| {
        let sid = match dialect {
            Dialect::Kwp2000 => crate::dialect::KwpCommand::ReadMemoryByAddress as u8,
            Dialect::Uds => crate::dialect::UdsCommand::ReadMemoryByAddress as u8,
        };
        let args = match dialect {
            Dialect::Kwp2000 => {
                let mut a = address.to_be_bytes().to_vec();
                a.push(len as u8);
                a
            }
            Dialect::Uds => {
                // addressAndLengthFormatIdentifier 0x24: 4-byte address, 2-byte length.
                let mut a = vec![0x24];
                a.extend_from_slice(&address.to_be_bytes());
                a.extend_from_slice(&(len as u16).to_be_bytes());
                a
            }
        };
        dispatcher::dispatch(engine, sid, &args)
    })
}

/// Reads every sector, including protected ones (for completeness), and
/// streams it to `sink` in ascending start order (§4.6 "Backup"). Requires an
/// active programming session with security access granted, matching the
/// original tool's `backup_ecu` (reading flash memory is itself gated the
/// same way writing it is).
pub fn backup<S: Read + Write>(conn: &Connection<S>, memory_map: &MemoryMap, sink: &mut impl Write) -> Result<(), DiagError> {
    require_unlocked(conn)?;
    let mut sorted_sectors = memory_map.sectors.clone();
    sorted_sectors.sort_by_key(|s| s.start);
    for sector in &sorted_sectors {
        let block_size = memory_map.transfer_size.min(VERIFY_BLOCK_CAP) as usize;
        let mut offset = 0usize;
        while offset < sector.size as usize {
            let len = block_size.min(sector.size as usize - offset);
            let data = read_memory(conn, memory_map.protocol, sector.start + offset as u32, len)?;
            sink.write_all(&data).map_err(|e| DiagError::IsoTp(crate::error::ChannelError::IoFailure(e).into()))?;
            offset += len;
        }
    }
    Ok(())
}

/// Hard-resets the ECU (service 0x11 sub-function 0x01). No response is
/// expected; the connection is considered torn down afterward (§4.6 "Reset").
pub fn reset<S: Read + Write>(conn: &Connection<S>) -> Result<(), DiagError> {
    conn.with_engine(|engine, dialect| {
        dispatcher::dispatch_no_response(engine, dialect.ecu_reset_sid(), &[ECU_RESET_HARD])
    })
}
