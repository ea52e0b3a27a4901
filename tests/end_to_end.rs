//! End-to-end fake-ECU scenarios (§8) and cross-module invariants that don't
//! fit neatly in any one module's `#[cfg(test)]` block.

mod common;

use std::time::{Duration, Instant};

use common::{consecutive_frame, flow_control, queue_exchange, segment_isotp, single_frame, FakeEcu};

use rftx_diag::connection::{Connection, SecurityState, SessionState};
use rftx_diag::dialect::{Dialect, SessionKind, UdsCommand};
use rftx_diag::dispatcher;
use rftx_diag::error::DiagError;
use rftx_diag::identity::decode_ascii;
use rftx_diag::isotp::{IsoTpEngine, IsoTpSettings};
use rftx_diag::memory_map::{MemoryMap, Sector};
use rftx_diag::security::{key_xor, SeedKeyAlgo};
use rftx_diag::transport::FrameTransport;
use rftx_diag::{dtc, flash};

const REQ: u32 = 0x6F1;
const RESP: u32 = 0x6F9;

fn isotp(fake: FakeEcu, settings: IsoTpSettings) -> IsoTpEngine<FakeEcu> {
    IsoTpEngine::new(FrameTransport::new(fake), REQ, RESP, settings)
}

/// Queues the two exchanges `Connection::connect`'s dialect probe performs
/// when it *is* talking KWP2000: a positive reply to the extended-session
/// probe, then a positive reply to the revert-to-default call.
fn queue_kwp_detection(fake: &FakeEcu) {
    queue_exchange(fake, RESP, 2, &[0x50, 0x92]);
    queue_exchange(fake, RESP, 2, &[0x50, 0x81]);
}

/// Queues a single negative reply to the KWP probe, so `Connection::connect`
/// falls back to UDS without attempting a revert call.
fn queue_uds_detection(fake: &FakeEcu) {
    queue_exchange(fake, RESP, 2, &[0x7F, 0x10, 0x11]);
}

// ---------------------------------------------------------------------
// Scenario 1: single-frame request/response (§8 scenario 1).
// ---------------------------------------------------------------------

#[test]
fn scenario_1_single_frame_identifier_read() {
    let fake = FakeEcu::new();
    // [0x62, 0xF1, 0x90, 'W', 'B', 'A'] is 6 bytes: fits one Single Frame.
    queue_exchange(&fake, RESP, 3, &[0x62, 0xF1, 0x90, b'W', b'B', b'A']);
    let mut engine = isotp(fake.clone(), IsoTpSettings::default());

    let resp = dispatcher::dispatch(&mut engine, 0x22, &[0xF1, 0x90]).unwrap();
    assert_eq!(decode_ascii(&resp[2..]), "WBA");

    // Confirm exactly one frame went out, and it was a Single Frame.
    let written = fake.written_frames();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].1[0] >> 4, 0x0);
}

// ---------------------------------------------------------------------
// Scenario 2: multi-frame send gated by block size and STmin (§8 scenario 2).
// ---------------------------------------------------------------------

#[test]
fn scenario_2_multiframe_send_honors_block_size_and_stmin() {
    // 27 bytes: 6 in the First Frame, 21 remaining -> three 7-byte
    // Consecutive Frames. With block size 2 the engine must stop after the
    // first two CFs and wait for a second Flow Control before the third.
    let payload: Vec<u8> = (0..27u8).collect();
    let fake = FakeEcu::new();
    fake.queue_frame(RESP, &flow_control(2, 10)); // STmin 10ms, block size 2
    fake.queue_frame(RESP, &flow_control(0, 10)); // second FC: finish the rest
    let mut engine = isotp(fake.clone(), IsoTpSettings::default());

    engine.send(&payload).unwrap();

    let written = fake.written_frames();
    assert_eq!(written.len(), 4, "1 First Frame + 3 Consecutive Frames");
    assert_eq!(written[0].1[0] >> 4, 0x1, "First Frame");
    for (i, (_, frame)) in written[1..].iter().enumerate() {
        assert_eq!(frame[0] >> 4, 0x2, "Consecutive Frame");
        assert_eq!(frame[0] & 0x0F, (i as u8 + 1) & 0x0F);
    }

    // At least 10ms between each Consecutive Frame (STmin pacing).
    let times = fake.write_timestamps();
    for pair in times.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(10));
    }
}

// ---------------------------------------------------------------------
// Scenario 3: NRC 0x78 ("response pending") retry (§8 scenario 3).
// ---------------------------------------------------------------------

#[test]
fn scenario_3_response_pending_retries_five_times_then_succeeds() {
    let fake = FakeEcu::new();
    for _ in 0..5 {
        queue_exchange(&fake, RESP, 6, &[0x7F, 0x34, 0x78]);
    }
    queue_exchange(&fake, RESP, 6, &[0x74, 0x40, 0x08, 0x00]);
    let mut engine = isotp(fake, IsoTpSettings::default());

    let start = Instant::now();
    // sid (1) + 6 data bytes = 7: still a Single Frame request.
    let resp = dispatcher::dispatch(&mut engine, 0x34, &[0x00, 0x24, 0, 0, 0, 0]).unwrap();
    assert_eq!(resp, vec![0x40, 0x08, 0x00]);
    assert!(start.elapsed() >= Duration::from_millis(500));
}

// ---------------------------------------------------------------------
// Scenario 4: security access, both the happy path and a denial (§8 scenario 4).
// ---------------------------------------------------------------------

fn xor_memory_map() -> MemoryMap {
    MemoryMap {
        variant: "TEST-XOR",
        flash_start: 0x800000,
        flash_size: 0x100000,
        sectors: vec![Sector { name: "Cal", start: 0x810000, size: 0x1000, protected: false }],
        protocol: Dialect::Kwp2000,
        security_algo: SeedKeyAlgo::XorRotate,
        seed_len: 2,
        transfer_size: 0x200,
        erase_required: true,
    }
}

#[test]
fn scenario_4_security_access_xor_happy_path() {
    let fake = FakeEcu::new();
    queue_kwp_detection(&fake);
    // Seed 0x1234 -> key 0xC7B3 (spec.md §8 worked example).
    queue_exchange(&fake, RESP, 2, &[0x67, 0x01, 0x12, 0x34]);
    queue_exchange(&fake, RESP, 4, &[0x67, 0x02]);
    let engine = isotp(fake, IsoTpSettings::default());
    let conn = Connection::connect(engine).unwrap();

    assert_eq!(key_xor(0x1234), 0xC7B3);
    conn.unlock_security(&xor_memory_map()).unwrap();
    assert_eq!(conn.security_state(), SecurityState::Unlocked(SessionKind::Programming));
    conn.disconnect();
}

#[test]
fn scenario_4_security_access_wrong_key_is_denied() {
    let fake = FakeEcu::new();
    queue_kwp_detection(&fake);
    queue_exchange(&fake, RESP, 2, &[0x67, 0x01, 0x12, 0x34]);
    // ECU rejects the (wrong) key with NRC 0x35 ("invalid key").
    queue_exchange(&fake, RESP, 4, &[0x7F, 0x27, 0x35]);
    let engine = isotp(fake, IsoTpSettings::default());
    let conn = Connection::connect(engine).unwrap();

    let err = conn.unlock_security(&xor_memory_map()).unwrap_err();
    assert!(matches!(err, DiagError::SecurityDenied));
    assert_eq!(conn.security_state(), SecurityState::Locked);
    conn.disconnect();
}

// ---------------------------------------------------------------------
// Scenario 5: erase + program one sector, then verify (§8 scenario 5).
// ---------------------------------------------------------------------

fn uds_memory_map(sector_size: u32, transfer_size: u32) -> MemoryMap {
    MemoryMap {
        variant: "TEST-UDS",
        flash_start: 0x800000,
        flash_size: 0x200000,
        sectors: vec![Sector { name: "Cal", start: 0x810000, size: sector_size, protected: false }],
        protocol: Dialect::Uds,
        security_algo: SeedKeyAlgo::CrcLike,
        seed_len: 4,
        transfer_size,
        erase_required: true,
    }
}

#[test]
fn scenario_5_erase_and_program_one_sector_then_verify() {
    const SECTOR_SIZE: u32 = 4096;
    const BLOCK: u32 = 512;
    const BLOCKS: u32 = SECTOR_SIZE / BLOCK;

    let fake = FakeEcu::new();
    queue_uds_detection(&fake);

    // Security access: seed 0 -> key_crc(0) == 0 (spec.md §8 invariant).
    queue_exchange(&fake, RESP, 2, &[0x67, 0x01, 0, 0, 0, 0]);
    queue_exchange(&fake, RESP, 6, &[0x67, 0x02]);

    // start_session(Programming).
    queue_exchange(&fake, RESP, 2, &[0x50, 0x02]);

    // Routine Control: erase sector (request is 12 bytes -> First+CF, needs FC).
    queue_exchange(&fake, RESP, 12, &[0x71, 0x01, 0xFF, 0x02]);

    // Request Download: reply omits the max-block-size field, so the engine
    // falls back to the memory map's own transfer size.
    queue_exchange(&fake, RESP, 12, &[0x74, 0x10]);

    // Transfer Data: BLOCKS blocks of BLOCK bytes, sequence 1..=BLOCKS.
    for seq in 1..=BLOCKS as u8 {
        queue_exchange(&fake, RESP, 1 + BLOCK as usize, &[0x76, seq]);
    }

    // Request Transfer Exit.
    queue_exchange(&fake, RESP, 1, &[0x77]);

    // Verify: one Read-Memory-By-Address per block, echoing back the exact
    // bytes the corresponding Transfer-Data block carried (0xAA-filled image).
    let image = vec![0xAAu8; SECTOR_SIZE as usize];
    for i in 0..BLOCKS {
        let mut reply = vec![0x63u8];
        reply.extend(std::iter::repeat(0xAA).take(BLOCK as usize));
        let _ = i;
        // UDS Read-Memory-By-Address request is 8 bytes (sid + format +
        // 4-byte address + 2-byte length): needs a Flow Control too.
        queue_exchange(&fake, RESP, 8, &reply);
    }

    let engine = isotp(fake.clone(), IsoTpSettings::default());
    let conn = Connection::connect(engine).unwrap();
    let map = uds_memory_map(SECTOR_SIZE, BLOCK);
    let cancel = flash::CancellationToken::new();

    let mut progress_calls = 0usize;
    flash::flash(&conn, &map, &image, &cancel, |_p| progress_calls += 1).unwrap();
    assert_eq!(progress_calls as u32, BLOCKS);

    // Exactly one Routine Control (erase), one Request Download, BLOCKS
    // Transfer Data calls, and one Request Transfer Exit were sent.
    let written = fake.written_frames();
    let sids_of_first_frames: Vec<u8> = written
        .iter()
        .filter(|(_, p)| p[0] >> 4 == 0x0 || p[0] >> 4 == 0x1)
        .map(|(_, p)| if p[0] >> 4 == 0x0 { p[1] } else { p[2] })
        .collect();
    assert_eq!(
        sids_of_first_frames
            .iter()
            .filter(|&&sid| sid == rftx_diag::dialect::UdsCommand::RoutineControl as u8)
            .count(),
        1
    );
    assert_eq!(
        sids_of_first_frames
            .iter()
            .filter(|&&sid| sid == UdsCommand::TransferData as u8)
            .count(),
        BLOCKS as usize
    );

    conn.disconnect();
}

// ---------------------------------------------------------------------
// Scenario 6: protected sectors are never erased or written, but are
// still read during backup (§8 scenario 6).
// ---------------------------------------------------------------------

#[test]
fn scenario_6_protected_sector_is_skipped_by_flash_but_read_by_backup() {
    let fake = FakeEcu::new();
    queue_uds_detection(&fake);
    queue_exchange(&fake, RESP, 2, &[0x67, 0x01, 0, 0, 0, 0]);
    queue_exchange(&fake, RESP, 6, &[0x67, 0x02]);
    queue_exchange(&fake, RESP, 2, &[0x50, 0x02]);
    // Only the non-protected "Cal" sector's erase/download/verify: a single
    // byte each (sector size 1), to keep the script short.
    queue_exchange(&fake, RESP, 12, &[0x71]);
    queue_exchange(&fake, RESP, 12, &[0x74, 0x10]);
    queue_exchange(&fake, RESP, 2, &[0x76, 0x01]);
    queue_exchange(&fake, RESP, 1, &[0x77]);
    queue_exchange(&fake, RESP, 8, &[0x63, 0xAA]);

    let engine = isotp(fake.clone(), IsoTpSettings::default());
    let conn = Connection::connect(engine).unwrap();
    let map = MemoryMap {
        variant: "TEST-PROT",
        flash_start: 0x800000,
        flash_size: 0x20000,
        sectors: vec![
            Sector { name: "Boot", start: 0x800000, size: 1, protected: true },
            Sector { name: "Cal", start: 0x810000, size: 1, protected: false },
        ],
        protocol: Dialect::Uds,
        security_algo: SeedKeyAlgo::CrcLike,
        seed_len: 4,
        transfer_size: 1,
        erase_required: true,
    };
    let image = vec![0xAAu8; 0x20000];
    let cancel = flash::CancellationToken::new();
    flash::flash(&conn, &map, &image, &cancel, |_| {}).unwrap();

    // Exactly one Routine Control (erase), one Transfer Data, and one Read
    // Memory By Address (verify) were sent in total -- the protected "Boot"
    // sector contributes none of these, only the non-protected "Cal" sector
    // does. The script above only has enough queued replies for one sector's
    // worth of erase/download/verify, so under-scripting (the orchestrator
    // mistakenly touching the protected sector) would have already starved
    // the fake and panicked the `unwrap()` above; this is a belt-and-braces
    // check on top of that.
    let written = fake.written_frames();
    let sids_of_first_frames: Vec<u8> = written
        .iter()
        .filter(|(_, p)| p[0] >> 4 == 0x0 || p[0] >> 4 == 0x1)
        .map(|(_, p)| if p[0] >> 4 == 0x0 { p[1] } else { p[2] })
        .collect();
    assert_eq!(
        sids_of_first_frames
            .iter()
            .filter(|&&sid| sid == UdsCommand::RoutineControl as u8)
            .count(),
        1
    );
    assert_eq!(
        sids_of_first_frames
            .iter()
            .filter(|&&sid| sid == UdsCommand::TransferData as u8)
            .count(),
        1
    );
    assert_eq!(
        sids_of_first_frames
            .iter()
            .filter(|&&sid| sid == UdsCommand::ReadMemoryByAddress as u8)
            .count(),
        1
    );

    conn.disconnect();
}

#[test]
fn scenario_6b_backup_reads_protected_sector_too() {
    let fake = FakeEcu::new();
    queue_uds_detection(&fake);
    queue_exchange(&fake, RESP, 2, &[0x50, 0x02]);
    queue_exchange(&fake, RESP, 2, &[0x67, 0x01, 0, 0, 0, 0]);
    queue_exchange(&fake, RESP, 6, &[0x67, 0x02]);
    // One read per sector, "Boot" (protected) then "Cal", in ascending start order.
    queue_exchange(&fake, RESP, 8, &[0x63, 0xBB]);
    queue_exchange(&fake, RESP, 8, &[0x63, 0xAA]);

    let engine = isotp(fake.clone(), IsoTpSettings::default());
    let conn = Connection::connect(engine).unwrap();
    let map = MemoryMap {
        variant: "TEST-PROT",
        flash_start: 0x800000,
        flash_size: 0x20000,
        sectors: vec![
            Sector { name: "Boot", start: 0x800000, size: 1, protected: true },
            Sector { name: "Cal", start: 0x810000, size: 1, protected: false },
        ],
        protocol: Dialect::Uds,
        security_algo: SeedKeyAlgo::CrcLike,
        seed_len: 4,
        transfer_size: 1,
        erase_required: true,
    };

    conn.start_session(SessionKind::Programming).unwrap();
    conn.unlock_security(&map).unwrap();
    let mut sink = Vec::new();
    flash::backup(&conn, &map, &mut sink).unwrap();
    assert_eq!(sink, vec![0xBB, 0xAA]);

    conn.disconnect();
}

#[test]
fn backup_and_verify_refuse_to_run_without_security_access() {
    let fake = FakeEcu::new();
    queue_uds_detection(&fake);
    let engine = isotp(fake.clone(), IsoTpSettings::default());
    let conn = Connection::connect(engine).unwrap();
    let map = uds_memory_map(1, 1);

    assert!(matches!(flash::backup(&conn, &map, &mut Vec::new()), Err(DiagError::NotInProgrammingSession)));
    assert!(matches!(flash::verify(&conn, &map, &[]), Err(DiagError::NotInProgrammingSession)));

    queue_exchange(&fake, RESP, 2, &[0x50, 0x02]);
    conn.start_session(SessionKind::Programming).unwrap();
    assert!(matches!(flash::backup(&conn, &map, &mut Vec::new()), Err(DiagError::NotUnlocked)));
    assert!(matches!(flash::verify(&conn, &map, &[]), Err(DiagError::NotUnlocked)));

    conn.disconnect();
}

// ---------------------------------------------------------------------
// Invariant: after any error path in `flash`, session/security reset.
// ---------------------------------------------------------------------

#[test]
fn flash_error_path_resets_session_and_security() {
    let fake = FakeEcu::new();
    queue_uds_detection(&fake);
    queue_exchange(&fake, RESP, 2, &[0x67, 0x01, 0, 0, 0, 0]);
    queue_exchange(&fake, RESP, 6, &[0x67, 0x02]);
    queue_exchange(&fake, RESP, 2, &[0x50, 0x02]);
    // Erase negative response: routine control fails.
    queue_exchange(&fake, RESP, 12, &[0x7F, 0x31, 0x22]);
    // Revert-to-default session, issued by flash()'s own error handler.
    queue_exchange(&fake, RESP, 2, &[0x50, 0x01]);

    let engine = isotp(fake, IsoTpSettings::default());
    let conn = Connection::connect(engine).unwrap();
    let map = uds_memory_map(16, 16);
    let image = vec![0xAAu8; 16];
    let cancel = flash::CancellationToken::new();

    let err = flash::flash(&conn, &map, &image, &cancel, |_| {}).unwrap_err();
    assert!(matches!(err, DiagError::EraseFailed { address: 0x810000 }));
    assert_ne!(conn.session_state(), SessionState::Programming);
    assert_eq!(conn.security_state(), SecurityState::Locked);
    conn.disconnect();
}

// ---------------------------------------------------------------------
// Invariant: ISO-TP send+receive round-trips arbitrary payload lengths.
// ---------------------------------------------------------------------

#[test]
fn isotp_round_trips_payloads_across_the_single_first_consecutive_boundary() {
    let lengths: Vec<usize> = vec![1, 6, 7, 8, 13, 14, 15, 100, 4095]
        .into_iter()
        .chain((1..=4095).step_by(223))
        .collect();

    for len in lengths {
        let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();

        let send_fake = FakeEcu::new();
        if payload.len() > 7 {
            send_fake.queue_frame(RESP, &flow_control(0, 0));
        }
        let mut sender = isotp(send_fake.clone(), IsoTpSettings::default());
        sender.send(&payload).unwrap();

        let recv_fake = FakeEcu::new();
        for (id, frame) in send_fake.written_frames() {
            recv_fake.queue_frame(if id == REQ { RESP } else { id }, &frame);
        }
        let mut receiver = isotp(recv_fake, IsoTpSettings::default());
        let got = receiver.receive().unwrap();
        assert_eq!(got, payload, "round-trip failed for length {len}");
    }
}

#[test]
fn isotp_sequence_deviation_is_rejected_and_stops_consuming() {
    for wrong_seq in [0u8, 2, 3, 15] {
        let fake = FakeEcu::new();
        // First Frame: total length 10, 6 bytes of payload.
        fake.queue_frame(RESP, &common::first_frame(10, &[1, 2, 3, 4, 5, 6]));
        fake.queue_frame(RESP, &consecutive_frame(wrong_seq, &[7, 8, 9, 10]));
        // Decoy trailing frame that must never be consumed.
        fake.queue_frame(RESP, &single_frame(&[0xDE, 0xAD]));

        let mut engine = isotp(fake.clone(), IsoTpSettings::default());
        let err = engine.receive().unwrap_err();
        assert!(matches!(
            err,
            rftx_diag::error::IsoTpError::SequenceError { expected: 1, got } if got == wrong_seq
        ));
        assert!(!fake.to_read_is_empty(), "the decoy frame must remain unconsumed");
    }
}

// ---------------------------------------------------------------------
// DTC read/clear over a live Connection.
// ---------------------------------------------------------------------

#[test]
fn dtc_read_and_clear_round_trip_over_uds() {
    let fake = FakeEcu::new();
    queue_uds_detection(&fake);
    // One P-code: hi=0x03, mid=0x00, lo=0x00, status=0x08 (confirmed).
    queue_exchange(&fake, RESP, 3, &[0x59, 0x02, 0x03, 0x00, 0x00, 0x08]);
    queue_exchange(&fake, RESP, 4, &[0x54]);

    let engine = isotp(fake, IsoTpSettings::default());
    let conn = Connection::connect(engine).unwrap();

    let codes = dtc::read_all(&conn).unwrap();
    assert_eq!(codes.len(), 1);
    assert_eq!(codes[0].text, "P0000");

    dtc::clear_all(&conn).unwrap();
    conn.disconnect();
}

// Re-export the `segment_isotp` usage so the helper doesn't look dead when
// only a subset of scenarios run under `cargo test <filter>`.
#[allow(unused_imports)]
use segment_isotp as _unused_segment_isotp_import;
