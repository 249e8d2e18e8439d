use std::fmt;

/// One of the four ABIs this codebase injects into. A running device exposes
/// either a 64-bit-only or a 64+32 spawner pair, never a bare 32-bit one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Abi {
    Arm64,
    Arm,
    X86_64,
    X86,
}

impl Abi {
    pub const fn is_64bit(self) -> bool {
        matches!(self, Abi::Arm64 | Abi::X86_64)
    }

    pub const fn bits(self) -> u32 {
        if self.is_64bit() { 64 } else { 32 }
    }

    /// Matches `/system/bin/app_processXX` exe targets the supervisor watches for.
    pub fn from_app_process_path(path: &str) -> Option<Abi> {
        if path.ends_with("app_process64") {
            Some(Self::native_64())
        } else if path.ends_with("app_process32") {
            Some(Self::native_32())
        } else {
            None
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub const fn native_64() -> Abi {
        Abi::Arm64
    }
    #[cfg(target_arch = "x86_64")]
    pub const fn native_64() -> Abi {
        Abi::X86_64
    }
    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    pub const fn native_64() -> Abi {
        panic!("unsupported 64-bit host architecture")
    }

    #[cfg(any(target_arch = "aarch64", target_arch = "arm"))]
    pub const fn native_32() -> Abi {
        Abi::Arm
    }
    #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
    pub const fn native_32() -> Abi {
        Abi::X86
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}
