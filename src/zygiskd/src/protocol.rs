//! Per-connection dispatch for the daemon wire protocol (spec §4.5): one
//! opcode byte read off a fresh `AF_UNIX SOCK_STREAM` connection, the
//! matching request/response handled, then (apart from the companion and
//! logcat handoffs) the connection is done.

use std::io::Write as _;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use log::{info, warn};
use zp_abi::ProcessFlags;
use zp_common::daemon_proto::DaemonOpcode;
use zp_common::wire;

use crate::config;
use crate::logcat;
use crate::modules;
use crate::packages;

pub fn serve(fd: OwnedFd) -> Result<()> {
    let mut stream = UnixStream::from(fd);
    let opcode_byte = wire::read_u8(&mut stream).context("reading opcode")?;
    let opcode = DaemonOpcode::from_repr(opcode_byte).with_context(|| format!("unknown opcode {opcode_byte}"))?;

    match opcode {
        DaemonOpcode::PingHeartbeat => Ok(()),
        DaemonOpcode::RequestLogcatFd => handle_logcat_fd(stream),
        DaemonOpcode::GetProcessFlags => handle_get_process_flags(stream),
        DaemonOpcode::ReadModules => handle_read_modules(stream),
        DaemonOpcode::RequestCompanionSocket => handle_companion_socket(stream),
        DaemonOpcode::GetModuleDir => handle_module_dir(stream),
        DaemonOpcode::ZygoteRestart => handle_zygote_restart(stream),
    }
}

fn handle_logcat_fd(stream: UnixStream) -> Result<()> {
    let sink = logcat::shared_sink_fd()?;
    wire::send_fd(&stream, sink.as_fd_borrow())?;
    Ok(())
}

fn handle_get_process_flags(mut stream: UnixStream) -> Result<()> {
    let uid = wire::read_u32(&mut stream).context("reading uid")?;

    // Root-grant policy lives in the on-device root-management database, an
    // external collaborator out of scope here. Denylist membership is the
    // one policy bit this daemon can resolve on its own, from `uid` through
    // `packages.list` to the package name.
    let mut flags = ProcessFlags::None as u32;
    if config::instance().manager_uid == Some(uid) {
        flags |= ProcessFlags::ProcessIsManager as u32;
    } else if let Ok(packages) = packages::parse_package_list() {
        if let Some(pkg) = packages::find_by_uid(&packages, uid) {
            if is_denylisted(&pkg.name) {
                flags |= ProcessFlags::ProcessOnDenylist as u32;
            }
        }
    }

    wire::write_u32(&mut stream, flags).context("writing flags")
}

/// `<MAGIC_PATH>/denylist` is a flat newline-separated list of package names
/// modules should not be loaded into; empty or missing means nothing is
/// denylisted.
fn is_denylisted(package: &str) -> bool {
    let path = std::path::Path::new(&config::instance().magic_path).join("denylist");
    std::fs::read_to_string(path).is_ok_and(|data| data.lines().any(|line| line.trim() == package))
}

fn handle_read_modules(mut stream: UnixStream) -> Result<()> {
    let records = modules::discover(config::instance());
    wire::write_usize(&mut stream, records.len())?;
    for record in &records {
        wire::write_string(&mut stream, &record.name)?;
        match modules::seal_into_memfd(&record.name, &record.so_path) {
            Ok(memfd) => wire::send_fd(&stream, memfd.as_fd_borrow())?,
            Err(err) => {
                warn!("failed to seal module {} into memfd: {err:#}", record.name);
                // Can't un-send a count we already committed to; send a
                // dummy dup of stdin so framing stays intact, agent will
                // fail dlopen on it and skip the module.
                let dummy = nix::unistd::dup(std::io::stdin().as_raw_fd())?;
                let dummy = unsafe { OwnedFd::from_raw_fd(dummy) };
                wire::send_fd(&stream, dummy.as_fd_borrow())?;
            }
        }
    }
    Ok(())
}

fn handle_companion_socket(mut stream: UnixStream) -> Result<()> {
    let index = wire::read_usize(&mut stream).context("reading module_index")?;
    let records = modules::discover(config::instance());
    let Some(record) = records.get(index) else {
        wire::write_u8(&mut stream, 0)?;
        return Ok(());
    };

    wire::write_u8(&mut stream, 1)?;
    stream.flush().ok();

    // The raw fd survives fork/exec since we never set FD_CLOEXEC on it; the
    // companion child inherits it and becomes the other half of the duplex
    // channel the module sees, while we drop our own copy below.
    let raw_fd = stream.as_raw_fd();
    let exe = std::env::current_exe().unwrap_or_else(|_| "zygiskd".into());
    match std::process::Command::new(exe)
        .arg("companion")
        .arg(&record.so_path)
        .arg(raw_fd.to_string())
        .stdin(Stdio::null())
        .spawn()
    {
        Ok(mut child) => {
            std::thread::spawn(move || {
                let _ = child.wait();
            });
        }
        Err(err) => warn!("failed to spawn companion for module {}: {err:#}", record.name),
    }

    // Ownership of `stream`'s fd is now shared with the companion child;
    // dropping our handle here just closes our copy of the descriptor.
    Ok(())
}

fn handle_module_dir(mut stream: UnixStream) -> Result<()> {
    let index = wire::read_usize(&mut stream).context("reading module_index")?;
    let records = modules::discover(config::instance());
    let Some(record) = records.get(index) else {
        bail!("module index {index} out of range");
    };
    let Some(module_root) = record.so_path.parent().and_then(|p| p.parent()) else {
        bail!("module {} has no directory to open", record.name);
    };

    let dirfd = nix::fcntl::open(
        module_root,
        nix::fcntl::OFlag::O_DIRECTORY | nix::fcntl::OFlag::O_CLOEXEC,
        nix::sys::stat::Mode::empty(),
    )
    .with_context(|| format!("opening module dir {}", module_root.display()))?;

    wire::send_fd(&stream, dirfd.as_fd_borrow())
}

fn handle_zygote_restart(_stream: UnixStream) -> Result<()> {
    info!("zygote restart notification received");
    Ok(())
}

trait AsFdBorrow {
    fn as_fd_borrow(&self) -> std::os::fd::BorrowedFd<'_>;
}

impl<T: AsRawFd> AsFdBorrow for T {
    fn as_fd_borrow(&self) -> std::os::fd::BorrowedFd<'_> {
        unsafe { std::os::fd::BorrowedFd::borrow_raw(self.as_raw_fd()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(DaemonOpcode::from_repr(0xff).is_none());
    }
}
