//! Lifecycle of the per-ABI helper daemon child processes: spawn
//! `./bin/zygiskd<bits>` under the module directory, track its pid, and feed
//! exit notifications back into `AbiState`.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use log::info;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use zp_common::Abi;

use crate::config;

fn daemon_binary(abi: Abi) -> PathBuf {
    PathBuf::from(&config::instance().magic_path).join("bin").join(format!("zygiskd{}", abi.bits()))
}

/// Forks and execs the per-ABI daemon binary, detached from our process
/// group so a supervisor restart doesn't take it down too.
pub fn spawn(abi: Abi) -> Result<i32> {
    let bin = daemon_binary(abi);
    let child = unsafe {
        Command::new(&bin)
            .env("MAGIC_PATH", &config::instance().magic_path)
            .env("MAGIC", &config::instance().magic)
            .stdin(Stdio::null())
            .pre_exec(|| {
                // New session so the daemon survives the supervisor exiting/restarting.
                nix::unistd::setsid().map(|_| ()).map_err(std::io::Error::from)
            })
            .spawn()
    }
    .with_context(|| format!("spawning {}", bin.display()))?;

    info!("spawned daemon{} pid={}", abi.bits(), child.id());
    Ok(child.id() as i32)
}

/// Human-readable fragment describing why a daemon exited, for the status
/// file's `daemon64:crashed(...)` rendering.
pub fn describe_exit(status: WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, code) => format!("exited with code {code}"),
        WaitStatus::Signaled(_, sig, core) => {
            format!("signaled with {sig}({}){}", sig as i32, if core { ", core dumped" } else { "" })
        }
        other => format!("{other:?}"),
    }
}

pub fn kill(pid: i32) {
    let _ = nix::sys::signal::kill(Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM);
}
