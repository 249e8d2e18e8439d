//! Watches `<MAGIC_PATH>/liteloader/<abi>/` for ad-hoc drops. `ReadModules`
//! always rescans the directory itself, so this watcher's only job is to log
//! what changed — useful for diagnosing a module that silently fails to show
//! up because its file landed under the wrong ABI directory.

use std::path::Path;
use std::sync::mpsc;

use log::{debug, warn};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

pub struct LiteloaderWatcher {
    _watcher: RecommendedWatcher,
}

impl LiteloaderWatcher {
    pub fn spawn(dir: &Path) -> Option<Self> {
        if let Err(err) = std::fs::create_dir_all(dir) {
            warn!("could not create liteloader dir {}: {err}", dir.display());
            return None;
        }

        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = match RecommendedWatcher::new(tx, notify::Config::default()) {
            Ok(w) => w,
            Err(err) => {
                warn!("failed to create liteloader watcher: {err}");
                return None;
            }
        };

        if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            warn!("failed to watch {}: {err}", dir.display());
            return None;
        }

        std::thread::Builder::new()
            .name("liteloader-watch".into())
            .spawn(move || {
                for event in rx {
                    match event {
                        Ok(event) => debug!("liteloader dir changed: {event:?}"),
                        Err(err) => warn!("liteloader watch error: {err}"),
                    }
                }
            })
            .ok()?;

        Some(Self { _watcher: watcher })
    }
}
