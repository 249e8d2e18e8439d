use std::fmt;

/// Error taxonomy shared by the supervisor, daemon and agent. Each variant
/// carries just enough context to be logged or rendered into the status file;
/// callers that only need "log and move on" convert this into `anyhow::Error`
/// at the boundary.
#[derive(Debug)]
pub enum InjectError {
    /// The tracee died or can no longer be waited on.
    TraceeGone { pid: i32 },
    /// A remote call stopped somewhere other than the expected sentinel.
    RemoteCallFailed { detail: String },
    /// A symbol or library needed for injection was not found in the remote.
    SymbolMissing { what: String },
    /// The per-ABI daemon could not be reached after the retry budget.
    DaemonUnavailable { abi_bits: u32 },
    /// A wire read/write was short; the connection is no longer trustworthy.
    ProtocolMismatch { detail: String },
    /// A module declared an unknown api_version or was missing callbacks.
    UnsupportedModule { name: String },
    /// The crash counter tripped, or a daemon could not be (re)created.
    PolicyStop { reason: String },
}

impl fmt::Display for InjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectError::TraceeGone { pid } => write!(f, "tracee {pid} is gone"),
            InjectError::RemoteCallFailed { detail } => write!(f, "remote call failed: {detail}"),
            InjectError::SymbolMissing { what } => write!(f, "symbol missing: {what}"),
            InjectError::DaemonUnavailable { abi_bits } => {
                write!(f, "daemon{abi_bits} unavailable")
            }
            InjectError::ProtocolMismatch { detail } => write!(f, "protocol mismatch: {detail}"),
            InjectError::UnsupportedModule { name } => write!(f, "unsupported module: {name}"),
            InjectError::PolicyStop { reason } => write!(f, "policy stop: {reason}"),
        }
    }
}

impl std::error::Error for InjectError {}

impl From<nix::Error> for InjectError {
    fn from(err: nix::Error) -> Self {
        InjectError::RemoteCallFailed {
            detail: err.to_string(),
        }
    }
}

impl InjectError {
    /// Human-readable fragment suitable for embedding in the status file,
    /// e.g. `"zygote crashed"` / `"daemon not running"`.
    pub fn status_reason(&self) -> String {
        match self {
            InjectError::PolicyStop { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}
