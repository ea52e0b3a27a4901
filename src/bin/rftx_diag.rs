//! Thin CLI wrapper around the `rftx_diag` library (§6 "CLI surface").

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use rftx_diag::connection::Connection;
use rftx_diag::dialect::{Dialect, KwpCommand, SessionKind, UdsCommand};
use rftx_diag::error::DiagError;
use rftx_diag::isotp::{IsoTpEngine, IsoTpSettings};
use rftx_diag::transport::{self, FrameTransport, DEFAULT_REQUEST_ID, DEFAULT_RESPONSE_ID};
use rftx_diag::{dtc, flash};

/// Diagnostic and reprogramming client for a BMW-family ECU set.
#[derive(Parser, Debug)]
#[command(name = "rftx_diag", version, about)]
struct Cli {
    /// Transport device path, e.g. /dev/ttyUSB0 or COM3.
    #[arg(long)]
    port: String,

    /// Print ECU identity.
    #[arg(long)]
    info: bool,

    /// Dump full flash to FILE (default: `BACKUP_<VIN>_<variant>_<timestamp>.bin`).
    #[arg(long, value_name = "FILE", num_args = 0..=1, default_missing_value = "")]
    backup: Option<PathBuf>,

    /// Program FILE onto the ECU.
    #[arg(long, value_name = "FILE")]
    flash: Option<PathBuf>,

    /// List stored DTCs.
    #[arg(long = "dtcs")]
    dtcs: bool,

    /// Clear all DTCs.
    #[arg(long = "clear-dtcs")]
    clear_dtcs: bool,

    /// Hard-reset the ECU.
    #[arg(long)]
    reset: bool,

    /// Stream 10 samples of a fixed live-data PID set.
    #[arg(long = "live-data")]
    live_data: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// `BACKUP_<VIN>_<variant>_<YYYYMMDD_HHMMSS>.bin` (§6 "Default backup filename").
fn default_backup_filename(vin: &str, variant: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    PathBuf::from(format!("BACKUP_{vin}_{variant}_{stamp}.bin"))
}

/// One sample of the fixed live-data PID set: RPM, coolant temperature, and
/// battery voltage, read via the dialect-appropriate identifier service
/// (§6 "`--live-data`"). PID-to-DID mapping (`0xF400 + pid`) and the RPM
/// scaling factor follow the original tool's `read_live_data`/`_parse_live_data`.
fn sample_live_data<S: Read + Write>(conn: &Connection<S>) -> Vec<(&'static str, String)> {
    let mut out = Vec::new();
    if let Some(rpm) = read_pid(conn, 0x0C) {
        if rpm.len() >= 2 {
            let raw = (((rpm[0] as u32) << 8) | rpm[1] as u32) as f32 / 4.0;
            out.push(("RPM", format!("{raw:.0} rpm")));
        }
    }
    if let Some(coolant) = read_pid(conn, 0x05) {
        if let Some(&b) = coolant.first() {
            out.push(("Coolant", format!("{} C", b as i32 - 40)));
        }
    }
    if let Some(volts) = read_battery(conn) {
        out.push(("Battery", format!("{volts:.1} V")));
    }
    out
}

fn read_pid<S: Read + Write>(conn: &Connection<S>, pid: u8) -> Option<Vec<u8>> {
    conn.with_engine(|engine, dialect| {
        let (sid, args): (u8, Vec<u8>) = match dialect {
            Dialect::Kwp2000 => (KwpCommand::ReadDataByLocalIdent as u8, vec![pid]),
            Dialect::Uds => (
                UdsCommand::ReadDataByIdentifier as u8,
                (0xF400u16 + pid as u16).to_be_bytes().to_vec(),
            ),
        };
        let resp = rftx_diag::dispatcher::dispatch(engine, sid, &args)?;
        let skip = dialect.ident_echo_len().min(resp.len());
        Ok(resp[skip..].to_vec())
    })
    .ok()
}

/// Same service IDs as the watchdog's periodic battery check (§4.4).
fn read_battery<S: Read + Write>(conn: &Connection<S>) -> Option<f32> {
    conn.with_engine(|engine, dialect| {
        let (sid, args): (u8, Vec<u8>) = match dialect {
            Dialect::Kwp2000 => (KwpCommand::ReadDataByLocalIdent as u8, vec![0x10]),
            Dialect::Uds => (
                UdsCommand::ReadDataByIdentifier as u8,
                0xF405u16.to_be_bytes().to_vec(),
            ),
        };
        let resp = rftx_diag::dispatcher::dispatch(engine, sid, &args)?;
        let skip = dialect.ident_echo_len().min(resp.len());
        let data = &resp[skip..];
        let raw = match dialect {
            Dialect::Kwp2000 => data.first().map(|&b| b as u16),
            Dialect::Uds if data.len() >= 2 => Some(u16::from_be_bytes([data[0], data[1]])),
            Dialect::Uds => None,
        };
        Ok(raw.map(|r| r as f32 / 10.0))
    })
    .ok()
    .flatten()
}

fn run(cli: Cli) -> Result<(), DiagError> {
    let serial = transport::open_serial(&cli.port, Duration::from_secs(5))?;
    let transport = FrameTransport::new(serial);
    let engine = IsoTpEngine::new(
        transport,
        DEFAULT_REQUEST_ID,
        DEFAULT_RESPONSE_ID,
        IsoTpSettings::default(),
    );
    let conn = Connection::connect(engine)?;

    if cli.info || cli.backup.is_some() || cli.flash.is_some() {
        let (identity, memory_map) = conn.identify()?;
        if cli.info {
            println!("VIN:       {}", identity.vin);
            println!("ECU ID:    {}", identity.ecu_id);
            println!("SW ver:    {}", identity.sw_version);
            println!("HW ver:    {}", identity.hw_version);
            println!("Variant:   {}", identity.ecu_variant);
            println!("Bootloader: {}", identity.in_bootloader);
        }

        if let Some(path) = &cli.backup {
            let path = if path.as_os_str().is_empty() {
                default_backup_filename(&identity.vin, identity.ecu_variant)
            } else {
                path.clone()
            };
            let mut file = File::create(&path)
                .map_err(|e| DiagError::IsoTp(rftx_diag::error::ChannelError::IoFailure(e).into()))?;
            // `backup` requires an active programming session and granted
            // security access, matching the original tool's `backup_ecu`.
            conn.start_session(SessionKind::Programming)?;
            conn.unlock_security(&memory_map)?;
            flash::backup(&conn, &memory_map, &mut file)?;
            println!("backup written to {}", path.display());
        }

        if let Some(path) = &cli.flash {
            println!(
                "WARNING: reprogramming requires an unbroken session; a power loss during \
                 this sequence is not recoverable."
            );
            let mut image = Vec::new();
            File::open(path)
                .and_then(|mut f| f.read_to_end(&mut image))
                .map_err(|e| DiagError::IsoTp(rftx_diag::error::ChannelError::IoFailure(e).into()))?;
            let cancel = flash::CancellationToken::new();
            flash::flash(&conn, &memory_map, &image, &cancel, |p| {
                println!("{}: {}/{} bytes", p.sector, p.bytes_written, p.total_bytes);
            })?;
            println!("flash complete");
        }
    }

    if cli.dtcs {
        for d in dtc::read_all(&conn)? {
            println!("{} (code 0x{:06X}, status 0x{:02X})", d.text, d.code, d.status.bits());
        }
    }

    if cli.clear_dtcs {
        dtc::clear_all(&conn)?;
        println!("DTCs cleared");
    }

    if cli.reset {
        flash::reset(&conn)?;
        println!("ECU reset issued");
    }

    if cli.live_data {
        conn.start_session(SessionKind::Default).ok();
        println!("Live Data:");
        for _ in 0..10 {
            for (label, reading) in sample_live_data(&conn) {
                println!("{label}: {reading}");
            }
            println!();
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    conn.disconnect();
    Ok(())
}
