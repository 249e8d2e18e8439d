//! The `module.prop` status publication: rewritten on every state
//! transition and bind-mounted over the user-visible module descriptor so a
//! module manager app shows live supervisor/daemon status in its UI.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, setns};
use nix::unistd::Pid;
use std::os::fd::AsFd;

use crate::abi_state::AbiTable;
use crate::monitor::TracingState;

pub struct StatusPublisher {
    /// The original `description=` line, preserved once at startup and used
    /// as the human-authored suffix of every rendered status.
    original_description: String,
    file_path: std::path::PathBuf,
    other_lines: Vec<String>,
}

fn parse_prop(data: &str) -> (Option<String>, Vec<String>) {
    let mut description = None;
    let mut other = Vec::new();
    for line in data.lines() {
        if let Some(value) = line.strip_prefix("description=") {
            description = Some(value.to_string());
        } else {
            other.push(line.to_string());
        }
    }
    (description, other)
}

impl StatusPublisher {
    pub fn load(file_path: impl AsRef<Path>) -> Result<Self> {
        let path = file_path.as_ref().to_path_buf();
        let data = fs::read_to_string(&path).unwrap_or_default();
        let (description, other_lines) = parse_prop(&data);
        Ok(Self {
            original_description: description.unwrap_or_default(),
            file_path: path,
            other_lines,
        })
    }

    /// Renders `[<state> zygote64:..., daemon64:..., zygote32:..., daemon32:...] <original description>`
    /// and overwrites `module.prop` in place, then re-publishes the status
    /// into the mount namespace the original path lives in.
    pub fn publish(&self, state: TracingState, stop_reason: Option<&str>, abis: &AbiTable) -> Result<()> {
        let state_tag = match state {
            TracingState::Tracing => "ok".to_string(),
            TracingState::Stopping => format!("stopping({})", stop_reason.unwrap_or("")),
            TracingState::Stopped => format!("stopped({})", stop_reason.unwrap_or("user requested")),
            TracingState::Exiting => "exiting".to_string(),
        };
        let body = format!("[{state_tag} {}] {}", abis.render(), self.original_description);

        let mut out = String::new();
        for line in &self.other_lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("description=");
        out.push_str(&body);
        out.push('\n');

        fs::write(&self.file_path, out).context("writing module.prop")?;
        Ok(())
    }

    /// Bind-mounts `module.prop` over the canonical module descriptor path
    /// inside namespace 1 (init's mount namespace), so the status is visible
    /// to whatever process reads the canonical path regardless of which
    /// mount namespace it's running in. Requires a temporary `setns` dance:
    /// enter namespace 1, perform the bind mount, return to our own.
    pub fn bind_over(&self, canonical_path: impl AsRef<Path>) -> Result<()> {
        let self_ns = fs::File::open("/proc/self/ns/mnt").context("opening own mnt ns")?;
        let target_ns = fs::File::open("/proc/1/ns/mnt").context("opening init's mnt ns")?;

        setns(target_ns.as_fd(), CloneFlags::CLONE_NEWNS).context("setns into init")?;

        let result = mount(
            Some(self.file_path.as_path()),
            canonical_path.as_ref(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .context("bind mount module.prop");

        if let Err(err) = setns(self_ns.as_fd(), CloneFlags::CLONE_NEWNS) {
            warn!("failed to return to original mount namespace: {err}");
        }

        result.map_err(Into::into)
    }
}

/// Used by `ctl`/CLI paths that just want to know a pid is alive without
/// pulling in the full publisher.
pub fn pid_alive(pid: i32) -> bool {
    nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_preserves_original_description() {
        let data = "name=Example\ndescription=Does a thing\nversion=1.0\n";
        let (desc, other) = parse_prop(data);
        assert_eq!(desc.as_deref(), Some("Does a thing"));
        assert_eq!(other, vec!["name=Example", "version=1.0"]);
    }
}
