//! Command-line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::registry::{RegistryConfig, SESSION_TTL_SECS, SWEEP_INTERVAL_SECS};
use crate::sandbox::SandboxLimits;
use crate::waiter::{WaitOptions, DEFAULT_EXIT_GRACE};

/// Session timing: lifetime, sweeps and how long a turn may wait.
#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Fixed session lifetime from creation, in seconds
    #[arg(long, env = "SANDTERM_LIFETIME_SECS", default_value_t = SESSION_TTL_SECS)]
    pub lifetime_secs: u64,

    /// Interval between expiry sweeps, in seconds
    #[arg(long, env = "SANDTERM_SWEEP_INTERVAL_SECS", default_value_t = SWEEP_INTERVAL_SECS)]
    pub sweep_interval_secs: u64,

    /// Quiet period after output that ends a turn, in milliseconds
    #[arg(long, env = "SANDTERM_SILENCE_MS", default_value = "500")]
    pub silence_ms: u64,

    /// Upper bound for one turn inside the server, in milliseconds
    #[arg(long, env = "SANDTERM_WAIT_TIMEOUT_MS", default_value = "5000")]
    pub wait_timeout_ms: u64,

    /// Upper bound for one whole request, in milliseconds
    #[arg(long, env = "SANDTERM_REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,
}

/// Where sandboxes live and what they may consume.
#[derive(Args, Debug, Clone)]
pub struct SandboxArgs {
    /// Interpreter path inside the sandbox
    #[arg(long, env = "SANDTERM_PYTHON", default_value = "/usr/bin/python3")]
    pub python: PathBuf,

    /// Host directory for sandbox roots and program copies
    #[arg(long, env = "SANDTERM_WORK_DIR", default_value = "/tmp/sandterm")]
    pub work_dir: PathBuf,

    /// Parent cgroup for per-sandbox cgroups
    #[arg(long, env = "SANDTERM_CGROUP_ROOT", default_value = "/sys/fs/cgroup/sandterm")]
    pub cgroup_root: PathBuf,

    /// Refuse to start sandboxes without cgroup v2
    #[arg(long, env = "SANDTERM_REQUIRE_CGROUPS")]
    pub require_cgroups: bool,

    /// Memory ceiling in MB (swap capped to match)
    #[arg(long, env = "SANDTERM_MEMORY_MB", default_value = "128")]
    pub memory_mb: u64,

    /// CPU share in CPUs
    #[arg(long, env = "SANDTERM_CPU_QUOTA", default_value = "0.5")]
    pub cpu_quota: f64,

    /// Maximum concurrent processes per sandbox
    #[arg(long, env = "SANDTERM_MAX_PIDS", default_value = "64")]
    pub max_pids: u64,

    /// CPU time limit in seconds
    #[arg(long, env = "SANDTERM_CPU_TIME_SECS", default_value = "30")]
    pub cpu_time_secs: u64,

    /// Maximum file size in KB
    #[arg(long, env = "SANDTERM_FSIZE_KB", default_value = "10240")]
    pub fsize_kb: u64,

    /// Maximum number of open files
    #[arg(long, env = "SANDTERM_NOFILE", default_value = "64")]
    pub nofile: u64,
}

impl SessionArgs {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            lifetime: Duration::from_secs(self.lifetime_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }

    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions {
            silence: Duration::from_millis(self.silence_ms),
            timeout: Duration::from_millis(self.wait_timeout_ms),
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl SandboxArgs {
    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            memory_bytes: self.memory_mb * 1024 * 1024,
            cpu_quota: self.cpu_quota,
            max_pids: self.max_pids,
            cpu_time_secs: self.cpu_time_secs,
            fsize_kb: self.fsize_kb,
            nofile: self.nofile,
        }
    }

    #[cfg(target_os = "linux")]
    pub fn namespace_config(&self) -> crate::namespace::NamespaceConfig {
        crate::namespace::NamespaceConfig {
            python: self.python.clone(),
            work_dir: self.work_dir.clone(),
            cgroup_root: self.cgroup_root.clone(),
            require_cgroups: self.require_cgroups,
            limits: self.limits(),
        }
    }
}
