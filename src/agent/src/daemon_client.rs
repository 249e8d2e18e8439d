//! Client side of the per-ABI daemon protocol (spec §4.5) as seen from
//! inside the spawner. Every call dials a fresh connection; failures are
//! swallowed into an empty/default result per §7's `DaemonUnavailable`
//! policy — specialization must never be blocked by daemon hiccups.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use anyhow::{Context, Result};
use log::warn;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, connect, socket};
use zp_common::daemon_proto::{DaemonOpcode, connect_retries};
use zp_common::wire;

use crate::config;

fn dial(opcode: DaemonOpcode) -> Option<UnixStream> {
    let name = config::instance().daemon_socket_name();
    let addr = UnixAddr::new_abstract(name.as_bytes()).ok()?;
    let (attempts, delay) = connect_retries(opcode);

    for attempt in 0..attempts {
        let Ok(fd) = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None) else { return None };
        match connect(fd.as_raw_fd(), &addr) {
            Ok(()) => return Some(UnixStream::from(fd)),
            Err(_) if attempt + 1 < attempts => std::thread::sleep(delay),
            Err(err) => {
                warn!("daemon unreachable for {opcode:?}: {err}");
                return None;
            }
        }
    }
    None
}

pub fn request_logcat_fd() -> Option<OwnedFd> {
    let mut stream = dial(DaemonOpcode::RequestLogcatFd)?;
    wire::write_u8(&mut stream, DaemonOpcode::RequestLogcatFd as u8).ok()?;
    wire::recv_fd(&stream).ok().flatten()
}

/// Bitmask per [`zp_abi::ProcessFlags`]; `0` (none set) on any failure.
pub fn get_process_flags(uid: u32) -> u32 {
    (|| -> Option<u32> {
        let mut stream = dial(DaemonOpcode::GetProcessFlags)?;
        wire::write_u8(&mut stream, DaemonOpcode::GetProcessFlags as u8).ok()?;
        wire::write_u32(&mut stream, uid).ok()?;
        wire::read_u32(&mut stream).ok()
    })()
    .unwrap_or(0)
}

pub struct ModuleHandle {
    pub name: String,
    pub so: OwnedFd,
}

pub fn read_modules() -> Vec<ModuleHandle> {
    let Some(mut stream) = dial(DaemonOpcode::ReadModules) else { return Vec::new() };
    read_modules_inner(&mut stream).unwrap_or_else(|err| {
        warn!("ReadModules failed: {err:#}");
        Vec::new()
    })
}

fn read_modules_inner(stream: &mut UnixStream) -> Result<Vec<ModuleHandle>> {
    wire::write_u8(stream, DaemonOpcode::ReadModules as u8).context("writing opcode")?;
    let count = wire::read_usize(stream).context("reading module count")?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let name = wire::read_string(stream).context("reading module name")?;
        let so = wire::recv_fd(stream).context("reading module fd")?.context("daemon sent no module fd")?;
        out.push(ModuleHandle { name, so });
    }
    Ok(out)
}

/// Returns the module's duplex companion connection on success; the stream
/// itself *is* the companion socket from this point on, matching the
/// protocol's "response changes what the connection means" shape.
pub fn request_companion_socket(module_index: usize) -> Option<UnixStream> {
    let mut stream = dial(DaemonOpcode::RequestCompanionSocket)?;
    wire::write_u8(&mut stream, DaemonOpcode::RequestCompanionSocket as u8).ok()?;
    wire::write_usize(&mut stream, module_index).ok()?;
    let ok = wire::read_u8(&mut stream).ok()?;
    (ok == 1).then_some(stream)
}

pub fn get_module_dir(module_index: usize) -> Option<OwnedFd> {
    let mut stream = dial(DaemonOpcode::GetModuleDir)?;
    wire::write_u8(&mut stream, DaemonOpcode::GetModuleDir as u8).ok()?;
    wire::write_usize(&mut stream, module_index).ok()?;
    wire::recv_fd(&stream).ok().flatten()
}
