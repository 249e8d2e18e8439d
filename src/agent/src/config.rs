use std::fs;
use std::sync::OnceLock;

use zp_common::Abi;

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

#[cfg(target_pointer_width = "64")]
fn own_abi() -> Abi {
    Abi::native_64()
}

#[cfg(target_pointer_width = "32")]
fn own_abi() -> Abi {
    Abi::native_32()
}

/// Process-wide configuration for the agent, resolved once from the
/// `magic_path` argument the Injector passes into the entry point. Unlike the
/// supervisor/daemon, the agent is injected into an already-running process
/// that never had `MAGIC`/`MAGIC_PATH` exported into its environment, so the
/// short `magic` namespacing string is instead read from a file the
/// supervisor leaves alongside the rest of `magic_path`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub magic_path: String,
    pub magic: String,
    pub abi: Abi,
}

impl RuntimeConfig {
    fn discover(magic_path: String) -> Self {
        let magic = fs::read_to_string(format!("{magic_path}/magic")).unwrap_or_default().trim().to_string();
        Self { magic, abi: own_abi(), magic_path }
    }

    pub fn daemon_socket_name(&self) -> String {
        zp_common::daemon_proto::daemon_socket_name(&self.magic, self.abi.bits())
    }
}

pub fn init(magic_path: String) {
    let _ = CONFIG.set(RuntimeConfig::discover(magic_path));
}

pub fn instance() -> &'static RuntimeConfig {
    CONFIG.get().expect("config accessed before init()")
}
