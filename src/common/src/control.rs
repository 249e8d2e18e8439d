use strum_macros::FromRepr;

/// Opcodes recognized by the supervisor's abstract control socket
/// (`"init_monitor" + MAGIC`). Numbering matches the order they were
/// historically introduced so on-disk/wire compatibility across upgrades is
/// just "append, never renumber".
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum ControlCommand {
    Start = 1,
    Stop = 2,
    Exit = 3,
    Zygote64Injected = 4,
    Zygote32Injected = 5,
    Daemon64SetInfo = 6,
    Daemon32SetInfo = 7,
    Daemon64SetErrorInfo = 8,
    Daemon32SetErrorInfo = 9,
}

impl ControlCommand {
    /// Opcodes at or beyond this value carry a 4-byte length-prefixed payload.
    pub const FIRST_WITH_PAYLOAD: u8 = ControlCommand::Daemon64SetInfo as u8;

    pub fn carries_payload(self) -> bool {
        (self as u8) >= Self::FIRST_WITH_PAYLOAD
    }

    pub fn socket_name(magic: &str) -> String {
        format!("init_monitor{magic}")
    }
}
