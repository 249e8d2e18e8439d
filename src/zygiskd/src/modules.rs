//! Module discovery for `ReadModules`: installed modules under
//! `<MAGIC_PATH>/modules/*/zygisk/<abi>.so`, plus ad-hoc liteloader drops
//! under `<MAGIC_PATH>/liteloader/<abi>/`, each delivered to the agent as a
//! sealed `memfd` copy so the agent never needs a writable path into our
//! filesystem.

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;
use memfd::{FileSeal, MemfdOptions};

use crate::config::RuntimeConfig;

pub struct ModuleRecord {
    pub name: String,
    pub so_path: PathBuf,
}

/// Walks `modules/*/zygisk/<abi>.so`, using the parent module directory's
/// name as the module's identity.
fn discover_installed(config: &RuntimeConfig) -> Vec<ModuleRecord> {
    let pattern = config.modules_glob();
    let entries = match glob::glob(&pattern) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("bad module glob pattern {pattern}: {err}");
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|so_path| {
            let name = so_path.parent()?.parent()?.file_name()?.to_str()?.to_string();
            Some(ModuleRecord { name, so_path })
        })
        .collect()
}

/// Walks the flat `liteloader/<abi>/<package>-<library>.so` directory; each
/// file's own name (minus extension) becomes the module identity handed to
/// the agent, since there is no module directory to derive one from.
fn discover_liteloader(config: &RuntimeConfig) -> Vec<ModuleRecord> {
    let dir = config.liteloader_dir();
    let Ok(read_dir) = fs::read_dir(&dir) else {
        return Vec::new();
    };

    read_dir
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "so"))
        .filter_map(|so_path| {
            let name = so_path.file_stem()?.to_str()?.to_string();
            Some(ModuleRecord { name: format!("liteloader:{name}"), so_path })
        })
        .collect()
}

pub fn discover(config: &RuntimeConfig) -> Vec<ModuleRecord> {
    let mut records = discover_installed(config);
    records.extend(discover_liteloader(config));
    records
}

/// Copies `so_path`'s contents into a sealed `memfd` (no further writes or
/// size changes possible once sealed), suitable for `SCM_RIGHTS` transfer and
/// `android_dlopen_ext`-from-fd on the receiving side.
pub fn seal_into_memfd(name: &str, so_path: &Path) -> Result<OwnedFd> {
    let data = fs::read(so_path).with_context(|| format!("reading {}", so_path.display()))?;

    let memfd = MemfdOptions::default()
        .allow_sealing(true)
        .create(name)
        .with_context(|| format!("creating memfd for {name}"))?;

    let mut file = memfd.as_file();
    file.write_all(&data)?;
    file.sync_data()?;
    file.seek(SeekFrom::Start(0))?;

    memfd.add_seals(&[FileSeal::SealGrow, FileSeal::SealShrink, FileSeal::SealWrite, FileSeal::SealSeal])?;

    Ok(memfd.into_file().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liteloader_name_carries_prefix() {
        let path = PathBuf::from("/tmp/liteloader/64/com.example-inject.so");
        let stem = path.file_stem().unwrap().to_str().unwrap();
        assert_eq!(format!("liteloader:{stem}"), "liteloader:com.example-inject");
    }
}
