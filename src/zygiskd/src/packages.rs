//! `/data/system/packages.list` parsing, used by `GetProcessFlags` to turn a
//! raw uid into the handful of bits modules care about.

use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub name: String,
    pub uid: u32,
    pub debuggable: bool,
    pub data_dir: String,
}

fn parse_line(line: &str) -> Option<PackageInfo> {
    let fields: Vec<&str> = line.split_ascii_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }
    Some(PackageInfo {
        name: fields[0].to_string(),
        uid: fields[1].parse().ok()?,
        debuggable: fields[2] != "0",
        data_dir: fields[3].to_string(),
    })
}

/// Tolerates a missing or unreadable file (non-Android test environments,
/// or a device that hasn't booted far enough yet): returns an empty list
/// rather than failing the caller.
pub fn parse_package_list() -> Result<Vec<PackageInfo>> {
    let Ok(file) = File::open("/data/system/packages.list") else {
        return Ok(Vec::new());
    };
    let reader = BufReader::new(file);
    Ok(reader.lines().map_while(Result::ok).filter_map(|line| parse_line(&line)).collect())
}

pub fn find_by_uid(packages: &[PackageInfo], uid: u32) -> Option<&PackageInfo> {
    packages.iter().find(|p| p.uid == uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_line() {
        let info = parse_line("com.example.app 10123 0 /data/user/0/com.example.app platform:privileged none").unwrap();
        assert_eq!(info.name, "com.example.app");
        assert_eq!(info.uid, 10123);
        assert!(!info.debuggable);
    }

    #[test]
    fn rejects_short_lines() {
        assert!(parse_line("com.example.app 10123").is_none());
    }
}
