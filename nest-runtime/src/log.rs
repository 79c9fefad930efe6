//! Logging primitives: the runtime's stderr sink and per-service
//! message logs.
//!
//! The stderr sink is a process-global, level-filtered emitter used for
//! runtime diagnostics and as the fallback when no logger service is
//! registered yet. Per-service logs are opt-in files (LOGON / LOGOFF
//! commands) that record every message a service receives, one line per
//! message with a hex payload dump.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::message::{Handle, Payload, PTYPE_SOCKET};
use crate::socket::SocketMessage;

// ── Stderr sink ─────────────────────────────────────────────────────────

/// Severity for the stderr sink. Lower is more severe.
pub const LEVEL_ERROR: i32 = 0;
pub const LEVEL_WARN: i32 = 1;
pub const LEVEL_INFO: i32 = 2;
pub const LEVEL_DEBUG: i32 = 3;

/// Global level filter for the stderr sink. Default INFO.
static LOG_LEVEL: AtomicI32 = AtomicI32::new(LEVEL_INFO);

/// Set the stderr sink's level filter. Values outside 0..=3 are clamped.
pub fn set_level(level: i32) {
    LOG_LEVEL.store(level.clamp(LEVEL_ERROR, LEVEL_DEBUG), Ordering::Relaxed);
}

/// Current stderr sink level filter.
#[must_use]
pub fn level() -> i32 {
    LOG_LEVEL.load(Ordering::Relaxed)
}

/// Emit one line to stderr when `level` passes the filter.
pub fn emit(level: i32, text: &str) {
    if level > LOG_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs() % 86400;
    let tag = match level {
        LEVEL_ERROR => "ERROR",
        LEVEL_WARN => "WARN ",
        LEVEL_DEBUG => "DEBUG",
        _ => "INFO ",
    };
    eprintln!(
        "{:02}:{:02}:{:02}.{:03} {tag} {text}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60,
        now.subsec_millis()
    );
}

// ── Per-service message log ─────────────────────────────────────────────

/// Compose the log file path for `handle` under `logpath`.
#[must_use]
pub fn service_log_path(logpath: &str, handle: Handle) -> PathBuf {
    PathBuf::from(logpath).join(format!("{handle:08x}.log"))
}

/// Open (append) the message log for `handle`. Returns the open file and
/// its path on success so the caller can report which file it opened.
pub fn open_service_log(
    logpath: &str,
    handle: Handle,
    now_ticks: u64,
    start_secs: u64,
) -> std::io::Result<(File, PathBuf)> {
    let path = service_log_path(logpath, handle);
    let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
    let wall = start_secs + now_ticks / 100;
    writeln!(file, "open time: {now_ticks} {wall}")?;
    file.flush()?;
    Ok((file, path))
}

/// Stamp and close a message log.
pub fn close_service_log(file: &mut File, now_ticks: u64) {
    let _ = writeln!(file, "close time: {now_ticks}");
    let _ = file.flush();
}

/// Append one received message to an open log.
///
/// Ordinary messages log `:source ptype session tick hexpayload`; socket
/// events log their own bracketed form with the event fields up front.
pub fn output(
    file: &mut File,
    source: Handle,
    ptype: u8,
    session: i32,
    payload: &Payload,
    now_ticks: u64,
) {
    if ptype == PTYPE_SOCKET {
        if let Payload::Socket(msg) = payload {
            log_socket(file, msg);
            return;
        }
    }
    let mut line = format!(":{source:08x} {ptype} {session} {now_ticks} ");
    push_blob(&mut line, payload.as_bytes());
    let _ = writeln!(file, "{line}");
    let _ = file.flush();
}

fn log_socket(file: &mut File, msg: &SocketMessage) {
    let mut line = format!("[socket] {} {} {} ", msg.kind, msg.id, msg.ud);
    push_blob(&mut line, &msg.buffer);
    let _ = writeln!(file, "{line}");
    let _ = file.flush();
}

/// Append `bytes` to `out` as lowercase hex pairs.
fn push_blob(out: &mut String, bytes: &[u8]) {
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
}
