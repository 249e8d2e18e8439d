use std::env;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use log::warn;

use crate::cli::Cli;

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide configuration, resolved once at startup from the CLI plus
/// the `MAGIC_PATH`/`MAGIC` environment variables the installer sets before
/// exec'ing this binary.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub magic_path: String,
    pub magic: String,
    pub daemonize: bool,
    pub under_ksu: bool,
}

impl RuntimeConfig {
    fn from_cli(cli: &Cli) -> Result<Self> {
        Ok(Self {
            magic_path: env::var("MAGIC_PATH").context("MAGIC_PATH is not set")?,
            magic: env::var("MAGIC").unwrap_or_default(),
            daemonize: !cli.no_daemonize,
            under_ksu: env::var_os("KSU").is_some(),
        })
    }

    pub fn control_socket_name(&self) -> String {
        zp_common::control::ControlCommand::socket_name(&self.magic)
    }

    pub fn daemon_socket_name(&self, abi_bits: u32) -> String {
        zp_common::daemon_proto::daemon_socket_name(&self.magic, abi_bits)
    }

    pub fn status_file(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.magic_path).join("module.prop")
    }
}

pub fn init(cli: &Cli) -> Result<()> {
    let config = RuntimeConfig::from_cli(cli)?;
    write_magic_file(&config);
    CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("config already initialized"))
}

/// Drops `<magic_path>/magic` so the Agent (injected into a process that
/// never had `MAGIC` exported into its own environment) can still namespace
/// its daemon socket name the same way the supervisor does.
fn write_magic_file(config: &RuntimeConfig) {
    let path = std::path::Path::new(&config.magic_path).join("magic");
    if let Err(err) = std::fs::write(&path, &config.magic) {
        warn!("failed to write {}: {err}", path.display());
    }
}

pub fn instance() -> &'static RuntimeConfig {
    CONFIG.get().expect("config accessed before init()")
}
