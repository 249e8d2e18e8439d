//! Low-level tracee primitives: remote memory/register access and the
//! architecture-specific `remote_call` rendezvous. Each per-ABI build of this
//! binary only ever traces a tracee of its own bitness, so the register
//! layout and calling convention are chosen at compile time with
//! `cfg(target_arch)` rather than probed at runtime.

use std::io;
use std::mem::size_of;

use nix::libc;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use zp_common::InjectError;

const PTRACE_SEIZE: libc::c_int = 0x4206;
const PTRACE_INTERRUPT: libc::c_int = 0x4207;

#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterSet {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

#[cfg(target_arch = "x86")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterSet {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub xds: u32,
    pub xes: u32,
    pub xfs: u32,
    pub xgs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub xcs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub xss: u32,
}

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterSet {
    /// x0..x30; x30 is the link register.
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

#[cfg(target_arch = "arm")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterSet {
    /// r0..r12, sp(13), lr(14), pc(15), cpsr(16), orig_r0(17).
    pub uregs: [u32; 18],
}

impl RegisterSet {
    #[cfg(target_arch = "x86_64")]
    pub fn sp(&self) -> u64 {
        self.rsp
    }
    #[cfg(target_arch = "x86_64")]
    pub fn set_sp(&mut self, v: u64) {
        self.rsp = v;
    }
    #[cfg(target_arch = "x86_64")]
    pub fn pc(&self) -> u64 {
        self.rip
    }
    #[cfg(target_arch = "x86_64")]
    pub fn set_pc(&mut self, v: u64) {
        self.rip = v;
    }
    #[cfg(target_arch = "x86_64")]
    pub fn retval(&self) -> u64 {
        self.rax
    }

    #[cfg(target_arch = "x86")]
    pub fn sp(&self) -> u64 {
        self.esp as u64
    }
    #[cfg(target_arch = "x86")]
    pub fn set_sp(&mut self, v: u64) {
        self.esp = v as u32;
    }
    #[cfg(target_arch = "x86")]
    pub fn pc(&self) -> u64 {
        self.eip as u64
    }
    #[cfg(target_arch = "x86")]
    pub fn set_pc(&mut self, v: u64) {
        self.eip = v as u32;
    }
    #[cfg(target_arch = "x86")]
    pub fn retval(&self) -> u64 {
        self.eax as u64
    }

    #[cfg(target_arch = "aarch64")]
    pub fn sp(&self) -> u64 {
        self.sp
    }
    #[cfg(target_arch = "aarch64")]
    pub fn set_sp(&mut self, v: u64) {
        self.sp = v;
    }
    #[cfg(target_arch = "aarch64")]
    pub fn pc(&self) -> u64 {
        self.pc
    }
    #[cfg(target_arch = "aarch64")]
    pub fn set_pc(&mut self, v: u64) {
        self.pc = v;
    }
    #[cfg(target_arch = "aarch64")]
    pub fn retval(&self) -> u64 {
        self.regs[0]
    }

    #[cfg(target_arch = "arm")]
    pub fn sp(&self) -> u64 {
        self.uregs[13] as u64
    }
    #[cfg(target_arch = "arm")]
    pub fn set_sp(&mut self, v: u64) {
        self.uregs[13] = v as u32;
    }
    #[cfg(target_arch = "arm")]
    pub fn pc(&self) -> u64 {
        // The low thumb bit is tracked in cpsr, not pc, once we're stopped;
        // remote_call restores it into pc|1 for comparison against the caller's sentinel.
        self.uregs[15] as u64
    }
    #[cfg(target_arch = "arm")]
    pub fn set_pc(&mut self, v: u64) {
        self.uregs[15] = v as u32;
    }
    #[cfg(target_arch = "arm")]
    pub fn retval(&self) -> u64 {
        self.uregs[0] as u64
    }
}

pub fn align_down(sp: u64, preserve: u64) -> u64 {
    (sp - preserve) & !0xf
}

/// A process under our exclusive ptrace control.
pub struct Tracee {
    pub pid: Pid,
}

impl Tracee {
    pub fn new(pid: i32) -> Self {
        Tracee { pid: Pid::from_raw(pid) }
    }

    /// `PTRACE_SEIZE` with the fork/exec-tracking options the supervisor
    /// needs to follow the spawner through its lifetime.
    pub fn seize(&self, options: u64) -> Result<(), InjectError> {
        let ret = unsafe {
            libc::ptrace(
                PTRACE_SEIZE as libc::c_uint,
                self.pid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                options as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(InjectError::TraceeGone { pid: self.pid.as_raw() });
        }
        Ok(())
    }

    /// `PTRACE_SETOPTIONS` on a tracee we already hold (e.g. a fork child
    /// inherited under init's tracing, seen for the first time).
    pub fn set_options(&self, options: u64) -> Result<(), InjectError> {
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETOPTIONS as libc::c_uint,
                self.pid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                options as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(InjectError::TraceeGone { pid: self.pid.as_raw() });
        }
        Ok(())
    }

    pub fn interrupt(&self) -> Result<(), InjectError> {
        let ret = unsafe {
            libc::ptrace(
                PTRACE_INTERRUPT as libc::c_uint,
                self.pid.as_raw(),
                std::ptr::null_mut::<libc::c_void>(),
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if ret == -1 {
            return Err(InjectError::TraceeGone { pid: self.pid.as_raw() });
        }
        Ok(())
    }

    pub fn cont(&self, sig: Option<Signal>) -> Result<(), InjectError> {
        nix::sys::ptrace::cont(self.pid, sig).map_err(InjectError::from)
    }

    pub fn detach(&self, sig: Option<Signal>) -> Result<(), InjectError> {
        nix::sys::ptrace::detach(self.pid, sig).map_err(InjectError::from)
    }

    pub fn wait(&self) -> Result<WaitStatus, InjectError> {
        waitpid(self.pid, Some(WaitPidFlag::__WALL)).map_err(InjectError::from)
    }

    /// Reads raw memory from the tracee via `process_vm_readv`. Short reads
    /// are returned as-is (not retried) per the documented failure model.
    pub fn read_remote(&self, addr: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let local = [libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: len,
        }];
        let remote = [libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: len,
        }];
        let n = unsafe {
            libc::process_vm_readv(self.pid.as_raw(), local.as_ptr(), 1, remote.as_ptr(), 1, 0)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    pub fn write_remote(&self, addr: u64, data: &[u8]) -> io::Result<usize> {
        let local = [libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        }];
        let remote = [libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: data.len(),
        }];
        let n = unsafe {
            libc::process_vm_writev(self.pid.as_raw(), local.as_ptr(), 1, remote.as_ptr(), 1, 0)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn get_regs(&self) -> Result<RegisterSet, InjectError> {
        let mut regs = RegisterSet::default();
        let mut iov = libc::iovec {
            iov_base: &mut regs as *mut _ as *mut libc::c_void,
            iov_len: size_of::<RegisterSet>(),
        };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET as libc::c_uint,
                self.pid.as_raw(),
                libc::NT_PRSTATUS as *mut libc::c_void,
                &mut iov as *mut _ as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(InjectError::TraceeGone { pid: self.pid.as_raw() });
        }
        Ok(regs)
    }

    pub fn set_regs(&self, regs: &RegisterSet) -> Result<(), InjectError> {
        let mut iov = libc::iovec {
            iov_base: regs as *const _ as *mut libc::c_void,
            iov_len: size_of::<RegisterSet>(),
        };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET as libc::c_uint,
                self.pid.as_raw(),
                libc::NT_PRSTATUS as *mut libc::c_void,
                &mut iov as *mut _ as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(InjectError::TraceeGone { pid: self.pid.as_raw() });
        }
        Ok(())
    }

    /// `sp -= preserve`, then rounds down to a 16-byte boundary.
    pub fn align_stack(&self, regs: &mut RegisterSet, preserve: u64) {
        regs.set_sp(align_down(regs.sp(), preserve));
    }

    /// Pushes a NUL-terminated string onto the tracee's stack and returns its
    /// remote address.
    pub fn push_string(&self, regs: &mut RegisterSet, s: &str) -> Result<u64, InjectError> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        regs.set_sp(regs.sp() - bytes.len() as u64);
        self.align_stack(regs, 0);
        let addr = regs.sp();
        self.write_remote(addr, &bytes)
            .map_err(|_| InjectError::RemoteCallFailed { detail: format!("push_string({s})") })?;
        Ok(addr)
    }

    /// Invokes `func_addr(args...)` in the tracee and waits for it to fault
    /// at `return_addr`, harvesting the return value. This is the one place
    /// the calling convention differs per architecture; everything above it
    /// is ABI-agnostic.
    pub fn remote_call(
        &self,
        regs: &mut RegisterSet,
        func_addr: u64,
        return_addr: u64,
        args: &[u64],
    ) -> Result<u64, InjectError> {
        self.align_stack(regs, 0);

        #[cfg(target_arch = "x86_64")]
        {
            let gp = [
                &mut regs.rdi, &mut regs.rsi, &mut regs.rdx, &mut regs.rcx, &mut regs.r8, &mut regs.r9,
            ];
            for (slot, &arg) in gp.into_iter().zip(args.iter()) {
                *slot = arg;
            }
            if args.len() > 6 {
                let extra = &args[6..];
                let remain = (extra.len() * size_of::<u64>()) as u64;
                self.align_stack(regs, remain);
                let bytes: Vec<u8> = extra.iter().flat_map(|v| v.to_ne_bytes()).collect();
                let _ = self.write_remote(regs.sp(), &bytes);
            }
            regs.set_sp(regs.sp() - size_of::<u64>() as u64);
            let _ = self.write_remote(regs.sp(), &return_addr.to_ne_bytes());
            regs.set_pc(func_addr);
        }

        #[cfg(target_arch = "x86")]
        {
            if !args.is_empty() {
                let remain = (args.len() * size_of::<u32>()) as u64;
                self.align_stack(regs, remain);
                let bytes: Vec<u8> = args.iter().flat_map(|v| (*v as u32).to_ne_bytes()).collect();
                let _ = self.write_remote(regs.sp(), &bytes);
            }
            regs.set_sp(regs.sp() - size_of::<u32>() as u64);
            let _ = self.write_remote(regs.sp(), &(return_addr as u32).to_ne_bytes());
            regs.set_pc(func_addr);
        }

        #[cfg(target_arch = "aarch64")]
        {
            for (i, &arg) in args.iter().enumerate().take(8) {
                regs.regs[i] = arg;
            }
            if args.len() > 8 {
                let extra = &args[8..];
                let remain = (extra.len() * size_of::<u64>()) as u64;
                self.align_stack(regs, remain);
                let bytes: Vec<u8> = extra.iter().flat_map(|v| v.to_ne_bytes()).collect();
                let _ = self.write_remote(regs.sp(), &bytes);
            }
            regs.regs[30] = return_addr; // lr
            regs.set_pc(func_addr);
        }

        #[cfg(target_arch = "arm")]
        {
            const CPSR_T_MASK: u32 = 1 << 5;
            for (i, &arg) in args.iter().enumerate().take(4) {
                regs.uregs[i] = arg as u32;
            }
            if args.len() > 4 {
                let extra = &args[4..];
                let remain = (extra.len() * size_of::<u32>()) as u64;
                self.align_stack(regs, remain);
                let bytes: Vec<u8> = extra.iter().flat_map(|v| (*v as u32).to_ne_bytes()).collect();
                let _ = self.write_remote(regs.sp(), &bytes);
            }
            regs.uregs[14] = return_addr as u32; // lr
            if func_addr & 1 != 0 {
                regs.uregs[15] = (func_addr & !1) as u32;
                regs.uregs[16] |= CPSR_T_MASK;
            } else {
                regs.uregs[15] = func_addr as u32;
                regs.uregs[16] &= !CPSR_T_MASK;
            }
        }

        self.set_regs(regs)?;
        self.cont(None)?;
        let status = self.wait()?;
        *regs = self.get_regs()?;

        let stopped_with_segv = matches!(status, WaitStatus::Stopped(_, Signal::SIGSEGV));
        if !stopped_with_segv {
            return Err(InjectError::RemoteCallFailed {
                detail: format!("unexpected stop: {status:?}"),
            });
        }

        #[cfg(target_arch = "arm")]
        let pc_matches = (regs.pc() & !1) == (return_addr & !1);
        #[cfg(not(target_arch = "arm"))]
        let pc_matches = regs.pc() == return_addr;

        if !pc_matches {
            return Err(InjectError::RemoteCallFailed {
                detail: format!("pc {:#x} != sentinel {:#x}", regs.pc(), return_addr),
            });
        }

        Ok(regs.retval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_down_clears_low_bits() {
        assert_eq!(align_down(0x1000_0017, 0), 0x1000_0010);
        assert_eq!(align_down(0x2000, 8), 0x1ff0);
    }
}
