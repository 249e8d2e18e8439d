//! Mount namespace cleanup after `unshare(CLONE_NEWNS)` succeeds in a managed
//! process (spec §4.6 item 7): lazily detach every mount the root solution
//! planted for module injection, then strip any surviving overlay mount's
//! options down to the bare minimum so the app can't introspect what was
//! stacked on top of it. Grounded on the original implementation's
//! `revert_unmount` / `lazy_unmount`.

use std::fs;

use log::warn;
use nix::mount::{MntFlags, MsFlags, mount, umount2};

const KSU_MODULE_MARKER: &str = "/data/adb/ksu/modules";
const MAGISK_MODULE_MARKER: &str = "/data/adb/modules";

struct MountEntry {
    fsname: String,
    dir: String,
    fstype: String,
    opts: String,
}

fn parse_mounts() -> Vec<MountEntry> {
    let Ok(data) = fs::read_to_string("/proc/self/mounts") else { return Vec::new() };
    data.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let fsname = fields.next()?.to_string();
            let dir = fields.next()?.to_string();
            let fstype = fields.next()?.to_string();
            let opts = fields.next()?.to_string();
            Some(MountEntry { fsname, dir, fstype, opts })
        })
        .collect()
}

fn lazy_unmount(mountpoint: &str) {
    if let Err(err) = umount2(mountpoint, MntFlags::MNT_DETACH) {
        warn!("lazy unmount of {mountpoint} failed: {err}");
    }
}

/// Parses a comma-separated mount option list down to just `ro`, `nosuid`,
/// and `relatime`, matching the reference implementation's `PARSE_OPT` macro.
fn sanitized_flags_and_opts(opts: &str) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut kept = Vec::new();
    for opt in opts.split(',') {
        match opt {
            "ro" => {
                flags |= MsFlags::MS_RDONLY;
                kept.push("ro");
            }
            "nosuid" => {
                flags |= MsFlags::MS_NOSUID;
                kept.push("nosuid");
            }
            "relatime" => {
                flags |= MsFlags::MS_RELATIME;
                kept.push("relatime");
            }
            _ => {}
        }
    }
    (flags, kept.join(","))
}

/// Reverts every mount the root solution stacked to inject modules into this
/// namespace: any mount whose source lives under `/data/adb/`, the marker
/// path itself, and any overlay mount whose options reference the marker,
/// are lazily detached (in reverse order, so stacked overlays come apart
/// outermost-first). Every other overlay mount that survives is then
/// remounted with its options stripped to `ro,nosuid,relatime`.
fn revert_unmount(module_marker: &str) {
    let entries = parse_mounts();

    let mut targets = vec![module_marker.to_string()];
    let mut backups = Vec::new();
    for entry in &entries {
        let is_target = entry.fsname.starts_with("/data/adb/")
            || (entry.fstype == "overlay" && entry.opts.contains(module_marker));
        if is_target {
            targets.push(entry.dir.clone());
        } else if entry.fstype == "overlay" {
            backups.push((entry.dir.clone(), entry.opts.clone()));
        }
    }

    for dir in targets.iter().rev() {
        lazy_unmount(dir);
    }

    let remaining = parse_mounts();
    for (dir, opts) in backups {
        if !remaining.iter().any(|e| e.dir == dir && e.fstype == "overlay") {
            continue;
        }
        let (flags, sanitized) = sanitized_flags_and_opts(&opts);
        if let Err(err) = mount(Some("overlay"), dir.as_str(), Some("overlay"), flags, Some(sanitized.as_str())) {
            warn!("failed to remount {dir} with sanitized options: {err}");
        }
    }
}

pub fn revert_unmount_ksu() {
    revert_unmount(KSU_MODULE_MARKER);
}

pub fn revert_unmount_magisk() {
    revert_unmount(MAGISK_MODULE_MARKER);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_known_options() {
        let (flags, opts) = sanitized_flags_and_opts("ro,nosuid,relatime,noatime,seclabel");
        assert_eq!(opts, "ro,nosuid,relatime");
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(flags.contains(MsFlags::MS_RELATIME));
    }

    #[test]
    fn drops_unknown_options_entirely() {
        let (flags, opts) = sanitized_flags_and_opts("rw,context=foo");
        assert_eq!(opts, "");
        assert!(flags.is_empty());
    }
}
