//! The agent's own `log::Log` backend (spec §10.1, §4.6 item 1). Before the
//! daemon hands out a logcat fd there is nowhere to send frames, so writes go
//! straight to `__android_log_print`; once [`redirect_to_daemon`] succeeds,
//! subsequent writes are framed `(priority, tag, message)` over that
//! connection instead, matching the daemon's `RequestLogcatFd` reader.

use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use zp_common::wire;

const TAG: &str = "zygisk-ptrace-agent";

static SINK: Mutex<Option<UnixStream>> = Mutex::new(None);
static LOGGER: AgentLogger = AgentLogger;

struct AgentLogger;

fn level_to_android_priority(level: Level) -> u8 {
    match level {
        Level::Error => 6,
        Level::Warn => 5,
        Level::Info => 4,
        Level::Debug => 3,
        Level::Trace => 2,
    }
}

impl Log for AgentLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= LevelFilter::Info || cfg!(debug_assertions)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        let priority = level_to_android_priority(record.level());

        let mut guard = SINK.lock();
        if let Some(stream) = guard.as_mut() {
            let sent = wire::write_u8(stream, priority)
                .and_then(|()| wire::write_string(stream, TAG))
                .and_then(|()| wire::write_string(stream, &message));
            if sent.is_ok() {
                return;
            }
            *guard = None;
        }
        drop(guard);

        log_to_logd(priority, &message);
    }

    fn flush(&self) {}
}

fn log_to_logd(priority: u8, message: &str) {
    let Ok(tag) = CString::new(TAG) else { return };
    let Ok(msg) = CString::new(message) else { return };
    unsafe {
        android_log_print(priority as i32, tag.as_ptr(), c"%s".as_ptr(), msg.as_ptr());
    }
}

unsafe extern "C" {
    #[link_name = "__android_log_print"]
    fn android_log_print(
        priority: i32,
        tag: *const std::os::raw::c_char,
        fmt: *const std::os::raw::c_char,
        ...
    ) -> i32;
}

pub fn init() {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info));
}

/// Swaps in the daemon-backed sink once the agent has connected. Subsequent
/// `log!` calls go out as frames over the connection instead of to logd.
pub fn redirect_to_daemon(fd: OwnedFd) {
    *SINK.lock() = Some(UnixStream::from(fd));
}

/// `__android_log_close`'s PLT hook calls this: the platform always resets
/// its native logging descriptor to -1 when it runs, so the agent's
/// daemon-backed sink can no longer be assumed live either.
pub fn reset_redirect() {
    *SINK.lock() = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_mapping_matches_android_log_priority_t() {
        assert_eq!(level_to_android_priority(Level::Error), 6);
        assert_eq!(level_to_android_priority(Level::Warn), 5);
        assert_eq!(level_to_android_priority(Level::Trace), 2);
    }
}
