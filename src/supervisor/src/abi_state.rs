//! Per-ABI state the status file renders: whether the spawner of that
//! bitness has been injected, whether its daemon is up, and a crash counter
//! that trips a policy stop when the spawner keeps re-execing too fast.

use std::time::{Duration, Instant};

use zp_common::Abi;

const CRASH_WINDOW: Duration = Duration::from_secs(30);
const CRASH_LIMIT: u32 = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct CrashCounter {
    count: u32,
    last_exec: Option<Instant>,
}

impl CrashCounter {
    /// Records a fresh execve of the spawner of this ABI. Returns `true` once
    /// the counter trips the policy-stop threshold. Advances only when two
    /// consecutive execs land inside the 30s window; otherwise resets to 1.
    pub fn record_exec(&mut self, now: Instant) -> bool {
        let consecutive = self.last_exec.is_some_and(|prev| now.duration_since(prev) < CRASH_WINDOW);
        self.count = if consecutive { self.count + 1 } else { 1 };
        self.last_exec = Some(now);
        self.count >= CRASH_LIMIT
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.last_exec = None;
    }
}

#[derive(Debug, Clone, Default)]
pub struct AbiState {
    pub supported: bool,
    pub zygote_injected: bool,
    pub daemon_pid: Option<i32>,
    pub daemon_running: bool,
    pub info: String,
    pub error_info: String,
    pub crash: CrashCounter,
}

impl AbiState {
    pub fn new(supported: bool) -> Self {
        Self { supported, ..Default::default() }
    }

    pub fn on_zygote_exec(&mut self, now: Instant) -> bool {
        self.zygote_injected = false;
        self.crash.record_exec(now)
    }

    pub fn on_daemon_spawned(&mut self, pid: i32) {
        self.daemon_pid = Some(pid);
        self.daemon_running = true;
        self.error_info.clear();
    }

    pub fn on_daemon_exited(&mut self, status_desc: String) {
        self.daemon_running = false;
        self.daemon_pid = None;
        self.error_info = status_desc;
    }

    /// Rendered as one fragment of the status line, e.g. `zygote64:injected`
    /// / `daemon64:running(idle)` / `daemon64:crashed(signaled with KILL(9))`.
    pub fn render(&self, bits: u32) -> String {
        if !self.supported {
            return format!("zygote{bits}:unsupported");
        }
        let zygote = if self.zygote_injected { "injected" } else { "not injected" };
        let daemon = if self.daemon_running {
            format!("running({})", if self.info.is_empty() { "idle" } else { &self.info })
        } else if self.error_info.is_empty() {
            "not running".to_string()
        } else {
            format!("crashed({})", self.error_info)
        };
        format!("zygote{bits}:{zygote}, daemon{bits}:{daemon}")
    }
}

#[derive(Debug, Clone)]
pub struct AbiTable {
    pub native_64: AbiState,
    pub native_32: AbiState,
}

impl AbiTable {
    pub fn new(support_32bit: bool) -> Self {
        Self {
            native_64: AbiState::new(true),
            native_32: AbiState::new(support_32bit),
        }
    }

    pub fn get(&mut self, abi: Abi) -> &mut AbiState {
        if abi.is_64bit() { &mut self.native_64 } else { &mut self.native_32 }
    }

    pub fn render(&self) -> String {
        format!("{}, {}", self.native_64.render(64), self.native_32.render(32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_counter_trips_after_five_fast_execs() {
        let mut c = CrashCounter::default();
        let base = Instant::now();
        for i in 0..4 {
            assert!(!c.record_exec(base + Duration::from_secs(i)));
        }
        assert!(c.record_exec(base + Duration::from_secs(4)));
    }

    #[test]
    fn crash_counter_resets_on_slow_exec() {
        let mut c = CrashCounter::default();
        let base = Instant::now();
        for i in 0..4 {
            c.record_exec(base + Duration::from_secs(i));
        }
        assert!(!c.record_exec(base + Duration::from_secs(100)));
    }
}
