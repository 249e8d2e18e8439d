//! The logcat sink handed out by `RequestLogcatFd`. A single `SOCK_SEQPACKET`
//! pair is created lazily on first request; the write end is reused (dup'd
//! and handed out again via `SCM_RIGHTS`) on every subsequent request, and a
//! background thread drains the read end into this process's own logger.
//! The actual on-device logcat backend is an external collaborator out of
//! scope for this crate; frames are re-emitted through `log` instead.

use std::os::fd::{FromRawFd, OwnedFd};

use anyhow::{Context, Result};
use log::{Level, warn};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use parking_lot::Mutex;
use zp_common::wire;

static SINK: Mutex<Option<OwnedFd>> = Mutex::new(None);

fn android_priority_to_level(priority: u8) -> Level {
    // Matches `android_log_priority_t`: 2=VERBOSE .. 6=ERROR, 7=FATAL.
    match priority {
        0..=3 => Level::Debug,
        4 => Level::Info,
        5 => Level::Warn,
        _ => Level::Error,
    }
}

fn spawn_reader(reader: OwnedFd) {
    std::thread::Builder::new()
        .name("logcat-sink".into())
        .spawn(move || {
            let mut stream = std::fs::File::from(reader);
            loop {
                let priority = match wire::read_u8(&mut stream) {
                    Ok(b) => b,
                    Err(_) => return,
                };
                let Ok(tag) = wire::read_string(&mut stream) else { return };
                let Ok(message) = wire::read_string(&mut stream) else { return };
                log::log!(android_priority_to_level(priority), "[{tag}] {message}");
            }
        })
        .ok();
}

/// Returns a fresh fd pointing at the same underlying socket as every other
/// call; the frame-carrying connection is one shared sink, not one per agent.
pub fn shared_sink_fd() -> Result<OwnedFd> {
    let mut guard = SINK.lock();
    if guard.is_none() {
        let (writer, reader) = socketpair(AddressFamily::Unix, SockType::SeqPacket, None, SockFlag::empty())
            .context("creating logcat sink socketpair")?;
        spawn_reader(reader);
        *guard = Some(writer);
    }
    let writer = guard.as_ref().expect("just initialized");
    let raw = nix::unistd::dup(writer).inspect_err(|err| warn!("failed to dup logcat sink: {err}"))?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}
