use std::env;
use std::fs;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use zp_common::Abi;

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide configuration for one per-ABI daemon instance, resolved once
/// at startup from the `MAGIC_PATH`/`MAGIC` environment variables the
/// supervisor sets before exec'ing this binary. Which ABI this particular
/// process serves follows from which target it was built for, not from any
/// runtime flag.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub magic_path: String,
    pub magic: String,
    pub abi: Abi,
    /// UID the module-manager app runs under, if the installer recorded one.
    pub manager_uid: Option<u32>,
}

#[cfg(target_pointer_width = "64")]
fn own_abi() -> Abi {
    Abi::native_64()
}

#[cfg(target_pointer_width = "32")]
fn own_abi() -> Abi {
    Abi::native_32()
}

impl RuntimeConfig {
    fn from_env() -> Result<Self> {
        let magic_path = env::var("MAGIC_PATH").context("MAGIC_PATH is not set")?;
        let manager_uid = fs::read_to_string(format!("{magic_path}/manager_uid"))
            .ok()
            .and_then(|s| s.trim().parse().ok());
        Ok(Self {
            magic: env::var("MAGIC").unwrap_or_default(),
            abi: own_abi(),
            manager_uid,
            magic_path,
        })
    }

    pub fn daemon_socket_name(&self) -> String {
        zp_common::daemon_proto::daemon_socket_name(&self.magic, self.abi.bits())
    }

    pub fn modules_glob(&self) -> String {
        format!("{}/modules/*/zygisk/{}.so", self.magic_path, self.abi.bits())
    }

    /// `.so` drops are namespaced by ABI the same way installed modules are,
    /// since the shared object's contents are architecture-specific.
    pub fn liteloader_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.magic_path).join("liteloader").join(self.abi.bits().to_string())
    }
}

pub fn init() -> Result<()> {
    let config = RuntimeConfig::from_env()?;
    CONFIG.set(config).map_err(|_| anyhow::anyhow!("config already initialized"))
}

pub fn instance() -> &'static RuntimeConfig {
    CONFIG.get().expect("config accessed before init()")
}
