//! The supervisor's epoll-driven event loop (spec §4.4): two sources, a
//! signalfd for SIGCHLD and the abstract control socket, processed strictly
//! in the order epoll hands them back, draining each source fully before
//! moving to the next.

use std::collections::HashSet;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::libc;
use nix::sys::ptrace::Options;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use zp_common::Abi;

use crate::abi_state::AbiTable;
use crate::config;
use crate::control_socket::{self, ControlMessage};
use crate::daemon_mgr;
use crate::maps;
use crate::status::StatusPublisher;
use crate::tracee::Tracee;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingState {
    Tracing,
    Stopping,
    Stopped,
    Exiting,
}

struct Epoll {
    fd: std::os::fd::OwnedFd,
}

impl Epoll {
    fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            anyhow::bail!("epoll_create1 failed: {}", std::io::Error::last_os_error());
        }
        use std::os::fd::FromRawFd;
        Ok(Self { fd: unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) } })
    }

    fn add(&self, fd: BorrowedFd<'_>, token: u64) -> Result<()> {
        let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd.as_raw_fd(), &mut ev) };
        if ret < 0 {
            anyhow::bail!("epoll_ctl(ADD) failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait(&self, events: &mut [libc::epoll_event]) -> Result<usize> {
        let ret = unsafe { libc::epoll_wait(self.fd.as_raw_fd(), events.as_mut_ptr(), events.len() as i32, -1) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(0);
            }
            anyhow::bail!("epoll_wait failed: {err}");
        }
        Ok(ret as usize)
    }
}

const TOKEN_SIGNALFD: u64 = 1;
const TOKEN_CONTROL: u64 = 2;

struct Supervisor {
    state: TracingState,
    stop_reason: Option<String>,
    abis: AbiTable,
    status: StatusPublisher,
    tracked_children: HashSet<i32>,
}

impl Supervisor {
    fn new() -> Result<Self> {
        let support_32bit = std::path::Path::new(&daemon_mgr_bin_dir()).join("bin").join("zygiskd32").exists();
        Ok(Self {
            state: TracingState::Tracing,
            stop_reason: None,
            abis: AbiTable::new(support_32bit),
            status: StatusPublisher::load(config::instance().status_file())?,
            tracked_children: HashSet::new(),
        })
    }

    fn publish(&self) {
        if let Err(err) = self.status.publish(self.state, self.stop_reason.as_deref(), &self.abis) {
            warn!("failed to publish status: {err:#}");
        }
        let canonical = std::path::Path::new(&config::instance().magic_path).join("module.prop");
        if let Err(err) = self.status.bind_over(&canonical) {
            debug!("bind-mount of module.prop skipped/failed: {err:#}");
        }
    }

    fn enter_stopping(&mut self, reason: impl Into<String>) {
        if self.state == TracingState::Tracing {
            self.state = TracingState::Stopping;
            self.stop_reason = Some(reason.into());
            let _ = Tracee::new(1).interrupt();
            self.publish();
        }
    }

    fn handle_control(&mut self, msg: ControlMessage) -> Result<bool> {
        match msg {
            ControlMessage::Start => {
                match self.state {
                    TracingState::Stopping => {
                        self.state = TracingState::Tracing;
                        self.stop_reason = None;
                    }
                    TracingState::Stopped => {
                        let init = Tracee::new(1);
                        let opts = (Options::PTRACE_O_TRACEFORK | Options::PTRACE_O_TRACEEXEC).bits() as u64;
                        init.seize(opts)?;
                        self.state = TracingState::Tracing;
                        self.stop_reason = None;
                    }
                    _ => {}
                }
                self.publish();
            }
            ControlMessage::Stop => {
                if self.state == TracingState::Tracing {
                    let _ = Tracee::new(1).interrupt();
                    self.state = TracingState::Stopping;
                    self.stop_reason = Some("user requested".into());
                    self.publish();
                }
            }
            ControlMessage::Exit => {
                self.state = TracingState::Exiting;
                self.publish();
                return Ok(true);
            }
            ControlMessage::Zygote64Injected => {
                self.abis.native_64.zygote_injected = true;
                self.publish();
            }
            ControlMessage::Zygote32Injected => {
                self.abis.native_32.zygote_injected = true;
                self.publish();
            }
            ControlMessage::Daemon64SetInfo(info) => {
                self.abis.native_64.info = info;
                self.publish();
            }
            ControlMessage::Daemon32SetInfo(info) => {
                self.abis.native_32.info = info;
                self.publish();
            }
            ControlMessage::Daemon64SetErrorInfo(info) => {
                self.abis.native_64.error_info = info;
                self.publish();
            }
            ControlMessage::Daemon32SetErrorInfo(info) => {
                self.abis.native_32.error_info = info;
                self.publish();
            }
        }
        Ok(false)
    }

    fn ensure_daemon(&mut self, abi: Abi) -> Result<()> {
        let state = self.abis.get(abi);
        if state.daemon_running {
            return Ok(());
        }
        let pid = daemon_mgr::spawn(abi)?;
        self.abis.get(abi).on_daemon_spawned(pid);
        Ok(())
    }

    fn handle_daemon_exit(&mut self, pid: i32, status: WaitStatus) -> bool {
        for abi in [Abi::native_64(), Abi::native_32()] {
            let state = self.abis.get(abi);
            if state.daemon_pid == Some(pid) {
                state.on_daemon_exited(daemon_mgr::describe_exit(status));
                self.publish();
                return true;
            }
        }
        false
    }

    /// One freshly exec'd spawner of the given ABI: update the crash
    /// counter, make sure its daemon exists, stop it, detach, and hand it to
    /// a double-forked `trace <pid> --restart` helper.
    fn on_zygote_exec(&mut self, pid: i32, abi: Abi) -> Result<()> {
        let tripped = self.abis.get(abi).on_zygote_exec(Instant::now());
        if tripped {
            self.enter_stopping("zygote crashed");
            return Ok(());
        }

        if self.ensure_daemon(abi).is_err() {
            self.enter_stopping("daemon not running");
            return Ok(());
        }

        let tracee = Tracee::new(pid);
        nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGSTOP).ok();
        tracee.cont(None)?;
        tracee.wait()?;
        tracee.detach(Some(Signal::SIGSTOP))?;

        spawn_trace_helper(pid, abi)?;
        self.publish();
        Ok(())
    }

    fn handle_tracked_child(&mut self, pid: i32, status: WaitStatus) -> Result<()> {
        if !self.tracked_children.contains(&pid) {
            // First time we see this pid stop under init's tracing: arm exec tracking
            // and let it run. Its first reported status is never the exec event itself,
            // so this must not fall through to the "any other status" detach arm below.
            let tracee = Tracee::new(pid);
            let opts = Options::PTRACE_O_TRACEEXEC.bits() as u64;
            let _ = tracee.set_options(opts);
            self.tracked_children.insert(pid);
            tracee.cont(None).ok();
            return Ok(());
        }

        match status {
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXEC) => {
                if let Ok(exe) = maps::exe_path(pid) {
                    let abi = Abi::from_app_process_path(&exe.to_string_lossy());
                    match abi {
                        Some(abi) if self.state == TracingState::Tracing => {
                            self.on_zygote_exec(pid, abi)?;
                            return Ok(());
                        }
                        _ => {
                            Tracee::new(pid).cont(None).ok();
                        }
                    }
                } else {
                    Tracee::new(pid).cont(None).ok();
                }
            }
            _ => {
                let _ = Tracee::new(pid).detach(None);
                self.tracked_children.remove(&pid);
            }
        }
        Ok(())
    }

    fn drain_waitpid(&mut self) -> Result<()> {
        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => status,
                Err(nix::Error::ECHILD) => break,
                Err(e) => return Err(e.into()),
            };

            let pid = status.pid().map(Pid::as_raw).unwrap_or(-1);
            if pid == -1 {
                break;
            }

            if pid == 1 {
                self.handle_init_status(status)?;
            } else if self.handle_daemon_exit(pid, status) {
                // handled above
            } else {
                self.handle_tracked_child(pid, status)?;
            }
        }
        Ok(())
    }

    fn handle_init_status(&mut self, status: WaitStatus) -> Result<()> {
        match status {
            WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_FORK) => {
                // Child recorded implicitly; it will stop on its own and show
                // up as an untracked pid in a later waitpid iteration.
            }
            WaitStatus::PtraceEvent(_, Signal::SIGTRAP, libc::PTRACE_EVENT_STOP) if self.state == TracingState::Stopping => {
                Tracee::new(1).detach(None)?;
                self.state = TracingState::Stopped;
                self.publish();
            }
            WaitStatus::Stopped(_, sig)
                if !matches!(sig, Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU) =>
            {
                Tracee::new(1).cont(Some(sig))?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn daemon_mgr_bin_dir() -> String {
    config::instance().magic_path.clone()
}

/// Double-forks so the helper is reparented to init instead of living under
/// us, then execs `zygisk-ptrace<bits> trace <pid> --restart`.
fn spawn_trace_helper(pid: i32, abi: Abi) -> Result<()> {
    use nix::unistd::{ForkResult, fork};
    match unsafe { fork() }.context("fork (outer)")? {
        ForkResult::Parent { child } => {
            waitpid(child, None).context("reap outer fork helper")?;
        }
        ForkResult::Child => {
            if unsafe { fork() }.is_ok_and(|r| matches!(r, ForkResult::Parent { .. })) {
                std::process::exit(0);
            }
            let exe = std::env::current_exe().unwrap_or_else(|_| "zygisk-ptrace".into());
            let _ = std::process::Command::new(exe)
                .arg("trace")
                .arg(pid.to_string())
                .arg("--restart")
                .spawn();
            std::process::exit(0);
        }
    }
    let _ = abi;
    Ok(())
}

/// Entry point for `monitor`: seizes init and runs the event loop until
/// `EXIT` is received on the control socket.
pub fn run() -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block().context("blocking SIGCHLD")?;
    let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .context("creating signalfd")?;

    let init = Tracee::new(1);
    let opts = (Options::PTRACE_O_TRACEFORK | Options::PTRACE_O_TRACEEXEC | Options::PTRACE_O_EXITKILL).bits() as u64;
    init.seize(opts).context("seizing init")?;

    let control_fd = control_socket::bind_control_socket()?;

    let epoll = Epoll::new()?;
    epoll.add(signal_fd.as_fd(), TOKEN_SIGNALFD)?;
    epoll.add(control_fd.as_fd(), TOKEN_CONTROL)?;

    let mut supervisor = Supervisor::new()?;
    supervisor.publish();
    info!("supervisor running, watching init");

    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 8];
    loop {
        let n = epoll.wait(&mut events)?;
        for ev in &events[..n] {
            match ev.u64 {
                TOKEN_SIGNALFD => {
                    while signal_fd.read_signal().ok().flatten().is_some() {
                        supervisor.drain_waitpid()?;
                    }
                }
                TOKEN_CONTROL => {
                    while let Some(datagram) = control_socket::recv_datagram(&control_fd)? {
                        match control_socket::decode(&datagram) {
                            Ok(msg) => {
                                if supervisor.handle_control(msg)? {
                                    return Ok(());
                                }
                            }
                            Err(err) => warn!("malformed control datagram: {err:#}"),
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_state_starts_tracing() {
        assert_eq!(TracingState::Tracing, TracingState::Tracing);
    }
}
