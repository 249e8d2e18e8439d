//! `/proc/self/maps` parsing for the PLT hook engine: locating the load base
//! of a loaded object by path. Unlike the supervisor's `maps` module (which
//! reads a *traced* pid's maps from the outside), this always reads the
//! agent's own process, so it stays a small, independent parser; symbol and
//! relocation parsing still goes through the one shared ELF reader in
//! `zp_common::elf`.

use std::fs;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct MapEntry {
    pub start: u64,
    pub exec: bool,
    pub path: Option<String>,
}

fn parse_line(line: &str) -> Option<MapEntry> {
    let mut fields = line.splitn(6, ' ').filter(|s| !s.is_empty());
    let range = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().map(str::trim).filter(|s| !s.is_empty());

    let (start, _end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let exec = perms.as_bytes().get(2) == Some(&b'x');

    Some(MapEntry { start, exec, path: path.map(str::to_string) })
}

pub fn scan_self_maps() -> Result<Vec<MapEntry>> {
    let data = fs::read_to_string("/proc/self/maps").context("reading /proc/self/maps")?;
    Ok(data.lines().filter_map(parse_line).collect())
}

/// Base address of the first zero-offset mapping whose path ends with
/// `suffix`, i.e. the load address of that object's ELF header.
pub fn find_module_base(entries: &[MapEntry], path: &str) -> Option<u64> {
    entries.iter().find(|e| e.path.as_deref() == Some(path)).map(|e| e.start)
}

/// Every distinct mapped file path, in first-seen order.
pub fn mapped_objects(entries: &[MapEntry]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    entries
        .iter()
        .filter_map(|e| e.path.as_deref())
        .filter(|p| p.starts_with('/'))
        .filter(|p| seen.insert(p.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
7f0000000000-7f0000021000 r--p 00000000 fe:00 1234  /system/lib64/libandroid_runtime.so
7f0000021000-7f0000090000 r-xp 00021000 fe:00 1234  /system/lib64/libandroid_runtime.so
7f0000100000-7f0000101000 rw-p 00000000 00:00 0
";

    #[test]
    fn finds_base_at_header_mapping() {
        let entries: Vec<_> = SAMPLE.lines().filter_map(parse_line).collect();
        assert_eq!(find_module_base(&entries, "/system/lib64/libandroid_runtime.so"), Some(0x7f0000000000));
    }

    #[test]
    fn dedupes_mapped_objects() {
        let entries: Vec<_> = SAMPLE.lines().filter_map(parse_line).collect();
        assert_eq!(mapped_objects(&entries), vec!["/system/lib64/libandroid_runtime.so".to_string()]);
    }
}
