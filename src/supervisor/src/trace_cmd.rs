//! The `trace <pid> [--restart]` subcommand: the monitor loop hands off a
//! freshly stopped spawner here via a double-forked helper process instead of
//! injecting inline, so a crash during injection can't wedge the event loop.

use std::io::Write as _;
use std::os::fd::AsRawFd;
use std::path::Path;

use log::{error, info, warn};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, connect, socket};
use zp_common::Abi;
use zp_common::control::ControlCommand;
use zp_common::daemon_proto::{DaemonOpcode, connect_retries};

use crate::config;
use crate::control_socket;
use crate::injector::{self, InjectionPlan};
use crate::maps;
use crate::tracee::Tracee;

fn agent_library(abi: Abi) -> String {
    Path::new(&config::instance().magic_path)
        .join("lib")
        .join(format!("libzygisk{}.so", abi.bits()))
        .to_string_lossy()
        .into_owned()
}

const AGENT_ENTRY_SYMBOL: &str = "zygisk_ptrace_agent_entry";

/// Best-effort: tells the per-ABI daemon the spawner just restarted, so it
/// can drop any per-process state tied to the old instance. A failure here
/// never blocks injection.
fn notify_daemon_restart(abi: Abi) {
    let name = config::instance().daemon_socket_name(abi.bits());
    let Ok(addr) = UnixAddr::new_abstract(name.as_bytes()) else { return };
    let (attempts, delay) = connect_retries(DaemonOpcode::ZygoteRestart);

    for attempt in 0..attempts {
        let Ok(fd) = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None) else { return };
        match connect(fd.as_raw_fd(), &addr) {
            Ok(()) => {
                let mut stream = std::fs::File::from(fd);
                if stream.write_all(&[DaemonOpcode::ZygoteRestart as u8]).is_err() {
                    warn!("failed to notify daemon{} of zygote restart", abi.bits());
                }
                return;
            }
            Err(_) if attempt + 1 < attempts => std::thread::sleep(delay),
            Err(err) => {
                warn!("could not reach daemon{} to notify restart: {err}", abi.bits());
                return;
            }
        }
    }
}

fn abi_of(pid: i32) -> Option<Abi> {
    maps::exe_path(pid).ok().and_then(|p| Abi::from_app_process_path(&p.to_string_lossy()))
}

/// Seizes `pid` (assumed already `SIGSTOP`'d, either by the monitor loop or
/// manually for `zygisk-ptrace trace <pid>`), injects the agent, and resumes
/// it. Returns `false` on any failure so the caller can fall back to
/// `SIGKILL`ing a spawner that can no longer run safely.
pub fn run(pid: i32, restart: bool) -> bool {
    let Some(abi) = abi_of(pid) else {
        error!("pid {pid} is not a recognized spawner exe");
        return false;
    };

    if restart {
        notify_daemon_restart(abi);
    }

    let tracee = Tracee::new(pid);
    if let Err(err) = tracee.seize(0) {
        error!("failed to seize pid {pid}: {err}");
        return false;
    }
    if let Err(err) = tracee.interrupt() {
        error!("failed to interrupt pid {pid}: {err}");
        return false;
    }
    if let Err(err) = tracee.wait() {
        error!("failed waiting for pid {pid} to stop: {err}");
        return false;
    }

    let plan = InjectionPlan {
        library_path: agent_library(abi),
        entry_symbol: AGENT_ENTRY_SYMBOL.to_string(),
        magic_path: config::instance().magic_path.clone(),
    };

    if let Err(err) = injector::inject(&tracee, &plan) {
        error!("injection into pid {pid} ({}-bit) failed: {err:#}", abi.bits());
        let _ = tracee.detach(None);
        return false;
    }

    if let Err(err) = tracee.detach(None) {
        error!("failed to detach from pid {pid} after injection: {err}");
        return false;
    }

    let notify = if abi.is_64bit() { ControlCommand::Zygote64Injected } else { ControlCommand::Zygote32Injected };
    if let Err(err) = control_socket::send_control_command(notify) {
        warn!("failed to notify supervisor of injection: {err:#}");
    }

    info!("injected agent into pid={pid} abi={}", abi.bits());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_library_name_matches_bits() {
        assert!(agent_library(Abi::native_64()).ends_with(&format!("libzygisk{}.so", Abi::native_64().bits())));
    }
}
