//! PLT/GOT hook engine (spec §4.6 item 2). `register` records a
//! `(mapping regex, symbol)` pair and the replacement function; `commit`
//! walks every loaded object's dynamic relocation table looking for matching
//! symbols and overwrites the GOT slot in place, restoring the containing
//! page's protection afterward. `exclude` scopes a symbol away from mappings
//! whose path matches a regex, mirroring `pltHookExclude` in the module ABI.

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::fs;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use log::warn;
use nix::sys::mman::{ProtFlags, mprotect};
use parking_lot::Mutex;
use regex_lite::Regex;

use crate::maps;

struct PendingHook {
    mapping: Regex,
    symbol: String,
    new_func: usize,
    old_func_out: usize,
}

struct ExcludeRule {
    mapping: Regex,
    symbol: String,
}

#[derive(Default)]
struct PltState {
    pending: Vec<PendingHook>,
    excludes: Vec<ExcludeRule>,
    /// got_addr -> original function pointer, so a self-unload can restore it.
    committed: HashMap<usize, usize>,
}

static STATE: OnceLock<Mutex<PltState>> = OnceLock::new();

fn state() -> &'static Mutex<PltState> {
    STATE.get_or_init(|| Mutex::new(PltState::default()))
}

/// Queues a hook; the actual GOT patch happens in [`commit`]. `old_func_out`,
/// if non-null, receives the original function pointer once committed.
pub fn register(mapping_regex: &str, symbol: &str, new_func: *mut c_void, old_func_out: *mut *mut c_void) -> bool {
    let Ok(mapping) = Regex::new(mapping_regex) else { return false };
    state().lock().pending.push(PendingHook {
        mapping,
        symbol: symbol.to_string(),
        new_func: new_func as usize,
        old_func_out: old_func_out as usize,
    });
    true
}

pub fn exclude(mapping_regex: &str, symbol: &str) -> bool {
    let Ok(mapping) = Regex::new(mapping_regex) else { return false };
    state().lock().excludes.push(ExcludeRule { mapping, symbol: symbol.to_string() });
    true
}

/// Applies every pending hook across all currently mapped objects. Returns
/// `true` only if every queued hook found and patched at least one GOT slot.
pub fn commit() -> bool {
    let Ok(entries) = maps::scan_self_maps() else { return false };
    let objects = maps::mapped_objects(&entries);
    let mut state = state().lock();
    if state.pending.is_empty() {
        return true;
    }

    let mut satisfied = HashSet::new();
    for path in &objects {
        let Some(base) = maps::find_module_base(&entries, path) else { continue };
        let Ok(data) = fs::read(path) else { continue };
        let relocations = zp_common::elf::plt_relocations(&data);

        for (index, hook) in state.pending.iter().enumerate() {
            if !hook.mapping.is_match(path) {
                continue;
            }
            if state.excludes.iter().any(|e| e.symbol == hook.symbol && e.mapping.is_match(path)) {
                continue;
            }
            for reloc in relocations.iter().filter(|r| r.symbol == hook.symbol) {
                let got_addr = (base + reloc.offset) as usize;
                match patch_got_slot(got_addr, hook.new_func as *mut c_void, hook.old_func_out as *mut *mut c_void) {
                    Ok(original) => {
                        state.committed.insert(got_addr, original as usize);
                        satisfied.insert(index);
                    }
                    Err(err) => warn!("failed to patch GOT for {} in {path}: {err:#}", hook.symbol),
                }
            }
        }
    }

    let all_satisfied = satisfied.len() == state.pending.len();
    for index in 0..state.pending.len() {
        if satisfied.contains(&index) {
            continue;
        }
        warn!("PLT hook for {} never matched a loaded mapping", state.pending[index].symbol);
    }
    state.pending.clear();
    all_satisfied
}

fn page_size() -> usize {
    unsafe { nix::libc::sysconf(nix::libc::_SC_PAGESIZE) as usize }
}

/// Patches one GOT slot and returns the original value it held. Does not
/// touch `state()` itself — callers that already hold the state lock (e.g.
/// [`commit`]) record the original value into `committed` themselves; this
/// mutex is not reentrant.
fn patch_got_slot(got_addr: usize, new_func: *mut c_void, old_func_out: *mut *mut c_void) -> Result<*mut c_void> {
    let page_size = page_size();
    let page_start = got_addr & !(page_size - 1);
    let ptr = std::ptr::NonNull::new(page_start as *mut c_void).context("GOT page address is null")?;

    unsafe { mprotect(ptr, page_size, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC)? };

    let slot = got_addr as *mut *mut c_void;
    let original = unsafe {
        let original = *slot;
        if !old_func_out.is_null() {
            *old_func_out = original;
        }
        *slot = new_func;
        original
    };

    unsafe { mprotect(ptr, page_size, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC)? };
    Ok(original)
}

/// Drains every GOT patch committed so far as `(got_addr, original_value)`
/// pairs, for [`restore_all`] to undo during self-unload.
pub fn take_committed() -> Vec<(usize, usize)> {
    state().lock().committed.drain().collect()
}

/// Restores every committed GOT slot to the value it held before this
/// agent's first commit, used by self-unload (§4.6 item 6) so a crashed or
/// unloaded agent leaves no dangling hooks behind.
pub fn restore_all(originals: &[(usize, usize)]) {
    let page_size = page_size();
    for &(got_addr, original) in originals {
        let page_start = got_addr & !(page_size - 1);
        let Some(ptr) = std::ptr::NonNull::new(page_start as *mut c_void) else { continue };
        unsafe {
            if mprotect(ptr, page_size, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC).is_err() {
                continue;
            }
            *(got_addr as *mut usize) = original;
            let _ = mprotect(ptr, page_size, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_invalid_regex() {
        assert!(!register("(", "open", std::ptr::null_mut(), std::ptr::null_mut()));
    }

    #[test]
    fn exclude_rejects_invalid_regex() {
        assert!(!exclude("(", "open"));
    }
}
