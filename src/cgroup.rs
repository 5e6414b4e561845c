//! cgroup v2 ceilings for one sandbox.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::sandbox::SandboxLimits;

/// Scheduling period written to `cpu.max`, in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

const CONTROLLERS: &str = "+memory +cpu +pids";
const REMOVE_ATTEMPTS: u32 = 20;

/// One per-sandbox cgroup directory.
#[derive(Debug, Clone)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Whether a unified hierarchy is mounted above `root`.
    pub fn available(root: &Path) -> bool {
        root.parent()
            .map(|parent| parent.join("cgroup.controllers").exists())
            .unwrap_or(false)
    }

    /// Create `root/name` and write the ceilings into it.
    pub fn create(root: &Path, name: &str, limits: &SandboxLimits) -> Result<Self, String> {
        fs::create_dir_all(root).map_err(|e| format!("mkdir cgroup root: {}", e))?;
        enable_controllers(root);

        let path = root.join(name);
        fs::create_dir_all(&path).map_err(|e| format!("mkdir cgroup: {}", e))?;
        let cgroup = Self { path };

        if let Err(e) = cgroup.apply(limits) {
            let _ = cgroup.remove();
            return Err(e);
        }
        debug!(path = ?cgroup.path, "cgroup ready");
        Ok(cgroup)
    }

    fn apply(&self, limits: &SandboxLimits) -> Result<(), String> {
        self.write("memory.max", &limits.memory_bytes.to_string())?;
        // Only present when swap accounting is enabled
        if self.path.join("memory.swap.max").exists() {
            self.write("memory.swap.max", "0")?;
        }
        self.write("cpu.max", &cpu_max_value(limits.cpu_quota))?;
        self.write("pids.max", &limits.max_pids.to_string())?;
        Ok(())
    }

    fn write(&self, file: &str, value: &str) -> Result<(), String> {
        fs::write(self.path.join(file), value).map_err(|e| format!("write {}: {}", file, e))
    }

    /// File a process writes `0` into to join this cgroup.
    pub fn procs_path(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory. The kernel refuses while member processes are
    /// still exiting, so this retries briefly.
    pub fn remove(&self) -> Result<(), String> {
        let mut last_err = None;
        for _ in 0..REMOVE_ATTEMPTS {
            if !self.path.exists() {
                return Ok(());
            }
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
            thread::sleep(Duration::from_millis(10));
        }
        Err(format!(
            "remove cgroup {:?}: {}",
            self.path,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }
}

/// Delegate the controllers we need down to `root`'s children.
fn enable_controllers(root: &Path) {
    let targets = [root.parent().map(Path::to_path_buf), Some(root.to_path_buf())];
    for dir in targets.into_iter().flatten() {
        let control = dir.join("cgroup.subtree_control");
        if !control.exists() {
            continue;
        }
        if let Err(e) = fs::write(&control, CONTROLLERS) {
            warn!(path = ?control, error = %e, "could not enable cgroup controllers");
        }
    }
}

/// `cpu.max` content for a quota expressed in CPUs.
pub fn cpu_max_value(cpu_quota: f64) -> String {
    if cpu_quota.is_nan() || cpu_quota <= 0.0 {
        return format!("max {}", CPU_PERIOD_US);
    }
    let quota = ((cpu_quota * CPU_PERIOD_US as f64).round() as u64).max(1000);
    format!("{} {}", quota, CPU_PERIOD_US)
}
