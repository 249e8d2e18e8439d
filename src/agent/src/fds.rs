//! File descriptor sanitization across a spawn (spec §4.6 item 5, testable
//! property 2): snapshot `/proc/self/fd` before fork, and after specialize
//! close anything that wasn't in that snapshot, wasn't exempted by a module,
//! and isn't the directory fd used to enumerate in the first place.

use std::collections::HashSet;
use std::fs;

use log::warn;

pub const MAX_FD: i32 = 1024;

fn list_open_fds() -> HashSet<i32> {
    let Ok(entries) = fs::read_dir("/proc/self/fd") else { return HashSet::new() };
    entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<i32>().ok()))
        .filter(|&fd| fd < MAX_FD)
        .collect()
}

/// Snapshot taken immediately before `fork()`, per the data model's
/// `allowed_fds` bitset (sized for descriptors `< 1024`; anything at or
/// above that is left alone rather than silently misrepresented as closed).
pub fn snapshot_allowed() -> HashSet<i32> {
    list_open_fds()
}

/// Closes every open fd below [`MAX_FD`] that is not in `allowed`, not in
/// `exempted`, and not `dirfd` (the descriptor used to read `/proc/self/fd`
/// itself, which would otherwise race its own enumeration).
pub fn sanitize(allowed: &HashSet<i32>, exempted: &[i32], dirfd: i32) {
    for fd in list_open_fds() {
        if fd == dirfd || allowed.contains(&fd) || exempted.contains(&fd) {
            continue;
        }
        if unsafe { nix::libc::close(fd) } != 0 {
            warn!("failed to close stray fd {fd} during sanitization");
        }
    }
}

/// For application specialize: unions the platform's own `fdsToIgnore` array
/// with fds modules exempted, and returns the combined list so the caller
/// can write it back through the platform's pointer.
pub fn merge_ignore_list(platform_ignore: &[i32], exempted: &[i32]) -> Vec<i32> {
    let mut merged: Vec<i32> = platform_ignore.to_vec();
    for &fd in exempted {
        if !merged.contains(&fd) {
            merged.push(fd);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_ignore_list_dedupes() {
        let merged = merge_ignore_list(&[3, 4], &[4, 5]);
        assert_eq!(merged, vec![3, 4, 5]);
    }

    #[test]
    fn merge_ignore_list_preserves_platform_order() {
        let merged = merge_ignore_list(&[9, 8, 7], &[]);
        assert_eq!(merged, vec![9, 8, 7]);
    }
}
