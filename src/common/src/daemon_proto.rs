use strum_macros::FromRepr;

/// Wire opcodes for the per-ABI daemon's `AF_UNIX SOCK_STREAM` protocol.
/// Framing: one opcode byte, then the payload described in each variant's
/// doc comment. Strings are `usize` length followed by raw bytes; integers
/// are native-endian and native-width, matching `wire::{read_usize,write_usize}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum DaemonOpcode {
    /// No payload either way. Used to probe that the daemon is alive.
    PingHeartbeat = 0,
    /// No request payload; response passes one fd via `SCM_RIGHTS` over the
    /// same connection, which becomes the agent's logcat sink.
    RequestLogcatFd = 1,
    /// Request: u32 uid. Response: u32 flags.
    GetProcessFlags = 2,
    /// No request payload. Response: usize count, then `count` pairs of
    /// (string name, one fd via `SCM_RIGHTS` holding a sealed memfd).
    ReadModules = 3,
    /// Request: usize module_index. Response: u8 (1 = this connection is now
    /// the companion duplex socket; 0 = refused).
    RequestCompanionSocket = 4,
    /// Request: usize module_index. Response: one fd via `SCM_RIGHTS`
    /// (the module's directory, opened `O_DIRECTORY`).
    GetModuleDir = 5,
    /// No payload either way; best-effort broadcast that the spawner restarted.
    ZygoteRestart = 6,
}

/// Name of the abstract daemon socket for one ABI, derived from `MAGIC_PATH`.
pub fn daemon_socket_name(magic: &str, abi_bits: u32) -> String {
    format!("zygisk-cp{magic}/{abi_bits}.sock")
}

/// Connect retry budget: heartbeat tolerates a daemon that hasn't started
/// yet; every other call only runs once the first heartbeat has already
/// succeeded, so one attempt is enough.
pub fn connect_retries(opcode: DaemonOpcode) -> (u32, std::time::Duration) {
    let delay = std::time::Duration::from_secs(1);
    match opcode {
        DaemonOpcode::PingHeartbeat => (5, delay),
        _ => (1, delay),
    }
}
