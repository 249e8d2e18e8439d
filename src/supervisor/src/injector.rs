//! The Injector (spec §4.3): given a tracee freshly stopped at its program
//! entry, makes it self-`dlopen` the agent library exactly once, then hands
//! control back to its real entry point.

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use zp_common::InjectError;

use crate::maps;
use crate::tracee::{RegisterSet, Tracee};

const AT_ENTRY: u64 = 9;
const AT_NULL: u64 = 0;

/// Kernel-unmapped sentinel address; landing the instruction pointer here
/// always faults. The low bit is kept clear here and OR'd in separately to
/// preserve the thumb-mode parity of the real entry point on 32-bit ARM.
const SENTINEL_BASE: u64 = (-0x05ec1cffi64 as u64) & !1;

const RTLD_NOW: u64 = 2;

pub struct InjectionPlan {
    pub library_path: String,
    pub entry_symbol: String,
    pub magic_path: String,
}

/// Finds the `AT_ENTRY` auxv slot's remote address. The tracee's stack at
/// entry is laid out as `{argc, argv[argc], NULL, envp..., NULL, auxv...}`;
/// we don't need argc/argv/envp, just to walk past them.
fn find_at_entry_slot(tracee: &Tracee, sp: u64) -> Result<u64> {
    let argc_bytes = tracee.read_remote(sp, 8).map_err(|_| InjectError::TraceeGone { pid: tracee.pid.as_raw() })?;
    let argc = u64::from_ne_bytes(argc_bytes.try_into().unwrap());

    // skip argc, argv[argc], NULL terminator
    let mut cursor = sp + 8 + (argc + 1) * 8;

    // skip envp until its NULL terminator
    loop {
        let word = tracee.read_remote(cursor, 8).map_err(|_| InjectError::TraceeGone { pid: tracee.pid.as_raw() })?;
        cursor += 8;
        if u64::from_ne_bytes(word.try_into().unwrap()) == 0 {
            break;
        }
    }

    // cursor now points at the first auxv entry: pairs of (tag, value).
    loop {
        let tag_bytes = tracee.read_remote(cursor, 8).map_err(|_| InjectError::TraceeGone { pid: tracee.pid.as_raw() })?;
        let tag = u64::from_ne_bytes(tag_bytes.try_into().unwrap());
        if tag == AT_ENTRY {
            return Ok(cursor + 8);
        }
        if tag == AT_NULL {
            bail!("AT_ENTRY not found in auxv");
        }
        cursor += 16;
    }
}

/// Runs the full injection sequence against a tracee stopped right at
/// execve completion (program entry, before any of its own code has run).
pub fn inject(tracee: &Tracee, plan: &InjectionPlan) -> Result<()> {
    let mut regs = tracee.get_regs()?;
    let sp = regs.sp();

    let entry_slot = find_at_entry_slot(tracee, sp)?;
    let entry_bytes = tracee.read_remote(entry_slot, 8)?;
    let entry_addr = u64::from_ne_bytes(entry_bytes.try_into().unwrap());

    let sentinel = SENTINEL_BASE | (entry_addr & 1);
    tracee.write_remote(entry_slot, &sentinel.to_ne_bytes())?;

    tracee.cont(None)?;
    let status = tracee.wait()?;
    let stopped_at_sentinel = matches!(status, WaitStatus::Stopped(_, Signal::SIGSEGV))
        && {
            let r = tracee.get_regs()?;
            (r.pc() & !1) == (sentinel & !1)
        };
    if !stopped_at_sentinel {
        bail!(InjectError::RemoteCallFailed { detail: format!("sentinel rendezvous failed: {status:?}") });
    }

    tracee.write_remote(entry_slot, &entry_addr.to_ne_bytes())?;
    let snapshot = tracee.get_regs()?;

    debug!("injecting {} into pid={}", plan.library_path, tracee.pid);
    if let Err(err) = run_injection_calls(tracee, plan, &snapshot) {
        warn!("injection failed, restoring entry and aborting: {err:#}");
        let mut restore = snapshot;
        restore.set_pc(entry_addr);
        tracee.set_regs(&restore)?;
        return Err(err);
    }

    let mut restore = snapshot;
    restore.set_pc(entry_addr);
    tracee.set_regs(&restore)?;
    info!("injected agent into pid={}", tracee.pid);
    Ok(())
}

fn run_injection_calls(tracee: &Tracee, plan: &InjectionPlan, snapshot: &RegisterSet) -> Result<()> {
    let remote_maps = maps::scan_maps(tracee.pid.as_raw())?;
    let local_maps = maps::scan_maps(std::process::id() as i32)?;

    let return_addr = maps::find_module_return_addr(&remote_maps, "libc.so")
        .context(InjectError::SymbolMissing { what: "libc.so in tracee".into() })?;

    let dlopen_addr = maps::find_func_addr(&local_maps, &remote_maps, "libdl.so", "dlopen")
        .or_else(|_| maps::find_func_addr(&local_maps, &remote_maps, "libc.so", "dlopen"))
        .context("resolving dlopen")?;
    let dlsym_addr = maps::find_func_addr(&local_maps, &remote_maps, "libdl.so", "dlsym")
        .or_else(|_| maps::find_func_addr(&local_maps, &remote_maps, "libc.so", "dlsym"))
        .context("resolving dlsym")?;
    let dlerror_addr = maps::find_func_addr(&local_maps, &remote_maps, "libdl.so", "dlerror")
        .or_else(|_| maps::find_func_addr(&local_maps, &remote_maps, "libc.so", "dlerror"))
        .ok();

    let mut regs = *snapshot;

    let lib_path_addr = tracee.push_string(&mut regs, &plan.library_path)?;
    let handle = tracee.remote_call(&mut regs, dlopen_addr, return_addr, &[lib_path_addr, RTLD_NOW])?;
    if handle == 0 {
        let detail = read_dlerror(tracee, &mut regs, return_addr, dlerror_addr);
        bail!(InjectError::RemoteCallFailed { detail: format!("dlopen({}) failed: {detail}", plan.library_path) });
    }

    let entry_sym_addr = tracee.push_string(&mut regs, &plan.entry_symbol)?;
    let entry_fn = tracee.remote_call(&mut regs, dlsym_addr, return_addr, &[handle, entry_sym_addr])?;
    if entry_fn == 0 {
        bail!(InjectError::SymbolMissing { what: plan.entry_symbol.clone() });
    }

    let magic_path_addr = tracee.push_string(&mut regs, &plan.magic_path)?;
    tracee.remote_call(&mut regs, entry_fn, return_addr, &[handle, magic_path_addr])?;

    Ok(())
}

fn read_dlerror(tracee: &Tracee, regs: &mut RegisterSet, return_addr: u64, dlerror_addr: Option<u64>) -> String {
    let Some(dlerror_addr) = dlerror_addr else {
        return "dlerror unavailable".to_string();
    };
    let Ok(msg_addr) = tracee.remote_call(regs, dlerror_addr, return_addr, &[]) else {
        return "dlerror call failed".to_string();
    };
    if msg_addr == 0 {
        return "no error".to_string();
    }
    read_remote_cstring(tracee, msg_addr).unwrap_or_else(|| "<unreadable dlerror message>".to_string())
}

fn read_remote_cstring(tracee: &Tracee, addr: u64) -> Option<String> {
    let mut out = Vec::new();
    let mut at = addr;
    for _ in 0..32 {
        let chunk = tracee.read_remote(at, 64).ok()?;
        if chunk.is_empty() {
            break;
        }
        if let Some(pos) = chunk.iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..pos]);
            return Some(String::from_utf8_lossy(&out).into_owned());
        }
        out.extend_from_slice(&chunk);
        at += chunk.len() as u64;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_preserves_thumb_parity() {
        assert_eq!(SENTINEL_BASE | 0, SENTINEL_BASE);
        assert_eq!((SENTINEL_BASE | 1) & 1, 1);
    }
}
