//! Session/Security Layer (C4) and the `Connection` itself.
//!
//! A `Connection` is the one thing in this crate that owns a mutex: the
//! foreground request path and the background tester-present watchdog are
//! the only two agents that ever touch the transport, and they cooperate
//! over `Mutex<ConnectionState>` rather than either one owning an actor
//! thread exclusively (§5, §9 "Background task"). The watchdog is a plain
//! `std::thread` waking once a second; it skips its tick via `try_lock` if
//! the foreground already holds the mutex.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::dialect::{Dialect, SessionKind};
use crate::dispatcher;
use crate::error::{DiagError, IsoTpError};
use crate::identity::{self, EcuIdentity};
use crate::isotp::IsoTpEngine;
use crate::memory_map::MemoryMap;
use crate::security;

/// How often the watchdog wakes to check whether it needs to act.
const WATCHDOG_TICK: Duration = Duration::from_secs(1);
/// Send tester-present once activity has been idle this long.
const TESTER_PRESENT_THRESHOLD: Duration = Duration::from_secs(2);
/// Sample battery voltage once activity has been idle this long... actually
/// sampled on its own cadence, independent of request activity.
const BATTERY_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Below this, the watchdog logs a warning.
const LOW_BATTERY_THRESHOLD_VOLTS: f32 = 12.0;

/// Current diagnostic session kind, mirroring [`SessionKind`] plus the
/// "no session established yet" state before the first session-control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session-control exchange has happened yet this connection.
    Unknown,
    /// Default session.
    Default,
    /// Programming session.
    Programming,
    /// Extended session.
    Extended,
}

/// Security-access state. Resets to `Locked` on session change, ECU reset,
/// or disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    /// No security access has been granted.
    Locked,
    /// Security access granted at the given level; `Programming` is the
    /// only level the flash orchestrator cares about.
    Unlocked(SessionKind),
}

/// Everything a `Connection` owns, guarded by one mutex.
pub struct ConnectionState<S> {
    engine: IsoTpEngine<S>,
    dialect: Dialect,
    session: SessionState,
    security: SecurityState,
    identity: Option<EcuIdentity>,
    memory_map: Option<MemoryMap>,
    last_activity: Instant,
}

impl<S: Read + Write> ConnectionState<S> {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// A live connection to one ECU: owns the transport (via the ISO-TP engine),
/// the dialect, session/security state, identity, and memory map. Created by
/// [`Connection::connect`]; torn down by [`Connection::disconnect`].
pub struct Connection<S> {
    state: Arc<Mutex<ConnectionState<S>>>,
    watchdog_stop: Arc<AtomicBool>,
    watchdog: Option<JoinHandle<()>>,
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl<S: Read + Write + Send + 'static> Connection<S> {
    /// Probes the dialect (KWP2000 first, falling back to UDS, per the
    /// tagged-variant design note in §9) and starts the watchdog thread.
    pub fn connect(engine: IsoTpEngine<S>) -> Result<Self, DiagError> {
        let mut state = ConnectionState {
            engine,
            dialect: Dialect::Kwp2000,
            session: SessionState::Unknown,
            security: SecurityState::Locked,
            identity: None,
            memory_map: None,
            last_activity: Instant::now(),
        };

        state.dialect = detect_dialect(&mut state.engine)?;
        state.touch();

        let state = Arc::new(Mutex::new(state));
        let watchdog_stop = Arc::new(AtomicBool::new(false));
        let watchdog = spawn_watchdog(Arc::clone(&state), Arc::clone(&watchdog_stop));

        Ok(Self {
            state,
            watchdog_stop,
            watchdog: Some(watchdog),
        })
    }

    /// The dialect this connection settled on.
    pub fn dialect(&self) -> Dialect {
        self.state.lock().unwrap().dialect
    }

    /// Current session state.
    pub fn session_state(&self) -> SessionState {
        self.state.lock().unwrap().session
    }

    /// Current security state.
    pub fn security_state(&self) -> SecurityState {
        self.state.lock().unwrap().security
    }

    /// Reads ECU identity and selects its memory map, caching both on the
    /// connection.
    pub fn identify(&self) -> Result<(EcuIdentity, MemoryMap), DiagError> {
        let mut guard = self.state.lock().unwrap();
        let dialect = guard.dialect;
        let (identity, memory_map) = identity::read_identity(&mut guard.engine, dialect)?;
        guard.touch();
        guard.identity = Some(identity.clone());
        guard.memory_map = Some(memory_map.clone());
        Ok((identity, memory_map))
    }

    /// Identity read by a previous [`Connection::identify`] call, if any.
    pub fn cached_identity(&self) -> Option<EcuIdentity> {
        self.state.lock().unwrap().identity.clone()
    }

    /// Memory map selected by a previous [`Connection::identify`] call, if any.
    pub fn cached_memory_map(&self) -> Option<MemoryMap> {
        self.state.lock().unwrap().memory_map.clone()
    }

    /// Sends session-control for `kind`; on success updates `SessionState`
    /// and resets `SecurityState` to `Locked` (§4.4).
    pub fn start_session(&self, kind: SessionKind) -> Result<(), DiagError> {
        let mut guard = self.state.lock().unwrap();
        let dialect = guard.dialect;
        let sid = dialect.session_control_sid();
        let sub = dialect.session_subfunction(kind);
        dispatcher::dispatch(&mut guard.engine, sid, &[sub]).map_err(|e| match e {
            DiagError::Negative { .. } => DiagError::SessionRejected,
            other => other,
        })?;
        guard.touch();
        guard.session = match kind {
            SessionKind::Default => SessionState::Default,
            SessionKind::Programming => SessionState::Programming,
            SessionKind::Extended => SessionState::Extended,
        };
        guard.security = SecurityState::Locked;
        Ok(())
    }

    /// Runs the seed/key challenge-response using the active memory map's
    /// algorithm. On success, `SecurityState` becomes
    /// `Unlocked(Programming)`.
    pub fn unlock_security(&self, memory_map: &MemoryMap) -> Result<(), DiagError> {
        let mut guard = self.state.lock().unwrap();
        let dialect = guard.dialect;
        let sid = dialect.security_access_sid();

        let seed_resp = dispatcher::dispatch(&mut guard.engine, sid, &[0x01])?;
        guard.touch();
        // seed_resp[0] echoes the 0x01 sub-function; the seed follows it.
        let seed = security::unpack_seed(seed_resp.get(1..).unwrap_or_default());
        let key = memory_map.security_algo.compute(seed);
        let key_bytes = security::pack_key(key, memory_map.seed_len);

        let mut payload = Vec::with_capacity(1 + key_bytes.len());
        payload.push(0x02);
        payload.extend_from_slice(&key_bytes);

        dispatcher::dispatch(&mut guard.engine, sid, &payload).map_err(|e| match e {
            DiagError::Negative { .. } => DiagError::SecurityDenied,
            other => other,
        })?;
        guard.touch();
        guard.security = SecurityState::Unlocked(SessionKind::Programming);
        Ok(())
    }

    /// Locks exclusive access to the underlying ISO-TP engine for callers in
    /// other components (C6, C7) that need to issue raw services.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut IsoTpEngine<S>, Dialect) -> Result<R, DiagError>) -> Result<R, DiagError> {
        let mut guard = self.state.lock().unwrap();
        let dialect = guard.dialect;
        let result = f(&mut guard.engine, dialect);
        guard.touch();
        result
    }

    /// Tears down the connection: stops the watchdog and resets security
    /// state (§8 invariant: after `disconnect`, `SessionState` is not
    /// `Programming` and `SecurityState` is `Locked`).
    pub fn disconnect(mut self) {
        self.watchdog_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watchdog.take() {
            let _ = handle.join();
        }
        let mut guard = self.state.lock().unwrap();
        guard.session = SessionState::Unknown;
        guard.security = SecurityState::Locked;
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.watchdog_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watchdog.take() {
            let _ = handle.join();
        }
    }
}

/// Tries a KWP2000 "extended diagnostics" session-control first; a
/// well-formed reply is taken as KWP evidence and the session is reverted to
/// Normal. A negative or malformed reply is still evidence that *something*
/// answered, so that falls back to UDS; a hard transport failure (timeout, no
/// Flow Control, I/O error) means nothing answered on either dialect, which
/// is reported as [`DiagError::NotConnected`] instead of silently assuming UDS.
fn detect_dialect<S: Read + Write>(engine: &mut IsoTpEngine<S>) -> Result<Dialect, DiagError> {
    let kwp_probe = dispatcher::dispatch(
        engine,
        Dialect::Kwp2000.session_control_sid(),
        &[Dialect::Kwp2000.session_subfunction(SessionKind::Extended)],
    );
    match kwp_probe {
        Ok(_) => {
            let _ = dispatcher::dispatch(
                engine,
                Dialect::Kwp2000.session_control_sid(),
                &[Dialect::Kwp2000.session_subfunction(SessionKind::Default)],
            );
            Ok(Dialect::Kwp2000)
        }
        Err(DiagError::IsoTp(IsoTpError::NoFlowControl)) | Err(DiagError::IsoTp(IsoTpError::Channel(_))) => {
            Err(DiagError::NotConnected)
        }
        Err(_) => Ok(Dialect::Uds),
    }
}

fn spawn_watchdog<S: Read + Write + Send + 'static>(
    state: Arc<Mutex<ConnectionState<S>>>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut last_battery_check = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            thread::sleep(WATCHDOG_TICK);
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let Ok(mut guard) = state.try_lock() else {
                // Foreground holds the mutex: skip this tick entirely.
                continue;
            };
            if guard.last_activity.elapsed() >= TESTER_PRESENT_THRESHOLD {
                let dialect = guard.dialect;
                let sid = dialect.tester_present_sid();
                if let Err(e) = dispatcher::dispatch(&mut guard.engine, sid, &[0x00]) {
                    log::warn!("tester-present failed: {e}");
                } else {
                    guard.touch();
                }
            }
            if last_battery_check.elapsed() >= BATTERY_CHECK_INTERVAL {
                last_battery_check = Instant::now();
                check_battery_voltage(&mut guard);
            }
        }
    })
}

fn check_battery_voltage<S: Read + Write>(guard: &mut ConnectionState<S>) {
    let dialect = guard.dialect;
    let (sid, args): (u8, Vec<u8>) = match dialect {
        Dialect::Kwp2000 => (crate::dialect::KwpCommand::ReadDataByLocalIdent as u8, vec![0x10]),
        Dialect::Uds => (
            crate::dialect::UdsCommand::ReadDataByIdentifier as u8,
            0xF405u16.to_be_bytes().to_vec(),
        ),
    };
    match dispatcher::dispatch(&mut guard.engine, sid, &args) {
        Ok(resp) => {
            let skip = dialect.ident_echo_len().min(resp.len());
            if let Some(volts) = parse_battery_voltage(dialect, &resp[skip..]) {
                if volts < LOW_BATTERY_THRESHOLD_VOLTS {
                    log::warn!("battery voltage low: {volts:.1}V");
                }
            }
        }
        Err(e) => log::debug!("battery voltage read failed: {e}"),
    }
}

/// Battery voltage is reported in tenths of a volt: one byte on KWP2000,
/// a big-endian pair on UDS.
fn parse_battery_voltage(dialect: Dialect, bytes: &[u8]) -> Option<f32> {
    let raw = match dialect {
        Dialect::Kwp2000 => *bytes.first()? as u16,
        Dialect::Uds => u16::from_be_bytes([*bytes.first()?, *bytes.get(1)?]),
    };
    Some(raw as f32 / 10.0)
}
