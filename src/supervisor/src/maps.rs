//! `/proc/<pid>/maps` parsing and the module-base / symbol-address math the
//! Injector needs: it never walks the tracee's ELF headers itself, it reuses
//! the dynamic loader that already parsed the same library locally.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use zp_common::InjectError;

#[derive(Debug, Clone)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub private: bool,
    pub offset: u64,
    pub path: Option<String>,
}

impl MapEntry {
    fn parse(line: &str) -> Option<MapEntry> {
        let mut fields = line.splitn(6, ' ').filter(|s| !s.is_empty());
        let range = fields.next()?;
        let perms = fields.next()?;
        let offset = fields.next()?;
        let _dev = fields.next()?;
        let _inode = fields.next()?;
        let path = fields.next().map(str::trim).filter(|s| !s.is_empty());

        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let offset = u64::from_str_radix(offset, 16).ok()?;

        let mut chars = perms.chars();
        let read = chars.next() == Some('r');
        let write = chars.next() == Some('w');
        let exec = chars.next() == Some('x');
        let private = chars.next() == Some('p');

        Some(MapEntry {
            start,
            end,
            read,
            write,
            exec,
            private,
            offset,
            path: path.map(str::to_string),
        })
    }
}

/// Parses `/proc/<pid>/maps` into an ordered list of entries. Tolerates lines
/// the kernel may race-drop between allocating the buffer and reading it.
pub fn scan_maps(pid: i32) -> Result<Vec<MapEntry>> {
    let data = fs::read_to_string(format!("/proc/{pid}/maps"))
        .map_err(|_| InjectError::TraceeGone { pid })?;
    Ok(data.lines().filter_map(MapEntry::parse).collect())
}

/// Base address of the first mapping whose path ends with `suffix` and whose
/// file offset is zero, i.e. the start of the ELF header itself.
pub fn find_module_base(maps: &[MapEntry], suffix: &str) -> Option<u64> {
    maps.iter()
        .find(|m| m.offset == 0 && m.path.as_deref().is_some_and(|p| p.ends_with(suffix)))
        .map(|m| m.start)
}

/// Start of the first *non-executable* mapping of `suffix`: landing the
/// instruction pointer here is guaranteed to fault, which is exactly the
/// property `remote_call`'s sentinel return address needs.
pub fn find_module_return_addr(maps: &[MapEntry], suffix: &str) -> Option<u64> {
    maps.iter()
        .find(|m| !m.exec && m.path.as_deref().is_some_and(|p| p.ends_with(suffix)))
        .map(|m| m.start)
}

/// Resolves the remote address of `func` inside `module` by statically
/// parsing the local copy of the same library off disk for the symbol's
/// link-time (load-bias-zero) vaddr, then adding it to the remote load base.
/// `resolve_local_symbol` returns that vaddr directly (not a live address in
/// the supervisor's own address space), so no local-base subtraction is
/// needed — only `remote_base` is looked up. Fails with `SymbolMissing` if
/// either the remote base or the symbol can't be found.
pub fn find_func_addr(local_maps: &[MapEntry], remote_maps: &[MapEntry], module: &str, func: &str) -> Result<u64> {
    let remote_base =
        find_module_base(remote_maps, module).context(InjectError::SymbolMissing { what: format!("{module} (remote base)") })?;

    let local_path = local_maps
        .iter()
        .find(|m| m.offset == 0 && m.path.as_deref().is_some_and(|p| p.ends_with(module)))
        .and_then(|m| m.path.clone())
        .context(InjectError::SymbolMissing { what: module.to_string() })?;

    let vaddr = resolve_local_symbol(&local_path, func)?;
    Ok(vaddr + remote_base)
}

fn resolve_local_symbol(path: &str, func: &str) -> Result<u64> {
    zp_common::elf::resolve_symbol_in_file(path, func)
        .with_context(|| InjectError::SymbolMissing { what: format!("{func} in {path}") }.to_string())
}

/// Path `/proc/<pid>/exe` resolves to, used by the SIGCHLD handler to tell a
/// freshly exec'd spawner from everything else init spawns.
pub fn exe_path(pid: i32) -> Result<PathBuf> {
    fs::read_link(format!("/proc/{pid}/exe")).map_err(|_| InjectError::TraceeGone { pid }.into())
}

pub fn dynamic_loader_base(maps: &[MapEntry]) -> Result<u64> {
    find_module_base(maps, "/libc.so").ok_or_else(|| bail_missing("libc.so"))
}

fn bail_missing(what: &str) -> anyhow::Error {
    InjectError::SymbolMissing { what: what.to_string() }.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
7f0000000000-7f0000021000 r--p 00000000 fe:00 1234  /system/lib64/libc.so
7f0000021000-7f0000090000 r-xp 00021000 fe:00 1234  /system/lib64/libc.so
7f0000090000-7f0000091000 rw-p 00000000 00:00 0
7f0000100000-7f0000101000 r--p 00000000 fe:00 5678  /system/bin/app_process64
";

    #[test]
    fn parses_fields() {
        let maps: Vec<_> = SAMPLE.lines().filter_map(MapEntry::parse).collect();
        assert_eq!(maps.len(), 4);
        assert_eq!(maps[0].start, 0x7f0000000000);
        assert!(maps[0].read && !maps[0].write && !maps[0].exec);
        assert_eq!(maps[0].path.as_deref(), Some("/system/lib64/libc.so"));
        assert_eq!(maps[2].path, None);
    }

    #[test]
    fn finds_module_base_at_zero_offset() {
        let maps: Vec<_> = SAMPLE.lines().filter_map(MapEntry::parse).collect();
        assert_eq!(find_module_base(&maps, "libc.so"), Some(0x7f0000000000));
    }

    #[test]
    fn finds_non_exec_mapping_for_sentinel() {
        let maps: Vec<_> = SAMPLE.lines().filter_map(MapEntry::parse).collect();
        let addr = find_module_return_addr(&maps, "libc.so").unwrap();
        assert_eq!(addr, 0x7f0000000000);
        assert!(!maps.iter().find(|m| m.start == addr).unwrap().exec);
    }
}
