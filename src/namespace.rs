//! Linux namespace sandbox backend.
//!
//! Every sandbox is a cloned process in fresh PID, mount, network, IPC and
//! UTS namespaces, chrooted into a tmpfs root with the host toolchain
//! bind-mounted read-only. The submitted program is written to a host
//! directory and bind-mounted read-only at `/code`. Needs root.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, execve, pipe2, Pid};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cgroup::Cgroup;
use crate::error::{Result, SessionError};
use crate::sandbox::{
    input_line, OutputChunk, SandboxBackend, SandboxChannel, SandboxHandle, SandboxLimits,
    SandboxStatus, StreamKind,
};
use crate::sanitize::Framing;

const NOBODY_UID: u32 = 65534;
const NOBODY_GID: u32 = 65534;
const STACK_SIZE: usize = 1024 * 1024;
const CODE_MOUNT: &str = "code";
const PROGRAM_FILE: &str = "main.py";
const READ_BUF: usize = 4096;
const CHANNEL_DEPTH: usize = 256;
const BIND_DIRS: [&str; 5] = ["/bin", "/lib", "/lib64", "/usr", "/etc"];
const DEVICES: [&str; 4] = ["null", "zero", "urandom", "random"];

#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    /// Interpreter path as seen inside the sandbox.
    pub python: PathBuf,
    /// Host directory holding sandbox roots and program copies.
    pub work_dir: PathBuf,
    pub cgroup_root: PathBuf,
    /// Fail creation instead of degrading to rlimits when cgroup v2 is missing.
    pub require_cgroups: bool,
    pub limits: SandboxLimits,
}

/// Everything the cloned child needs, prepared before `clone`. The child
/// shares a copy of a multi-threaded heap and must not allocate.
struct ChildPlan {
    root: PathBuf,
    proc_dir: PathBuf,
    cgroup_procs: Option<PathBuf>,
    limits: SandboxLimits,
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

struct Spawned {
    pid: Pid,
    root: PathBuf,
    code_dir: PathBuf,
    cgroup: Option<Cgroup>,
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
}

struct Instance {
    pid: Pid,
    root: PathBuf,
    code_dir: PathBuf,
    cgroup: Option<Cgroup>,
    stdin: Arc<tokio::sync::Mutex<pipe::Sender>>,
    /// Read ends, taken on attach.
    output: Option<(OwnedFd, OwnedFd)>,
    /// Cached once reaped; `waitpid` only reports an exit once.
    exit_code: Option<i32>,
}

pub struct NamespaceBackend {
    config: NamespaceConfig,
    instances: Mutex<HashMap<String, Instance>>,
}

impl NamespaceBackend {
    pub fn new(config: NamespaceConfig) -> Self {
        Self {
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn instances(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instance>> {
        self.instances.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SandboxBackend for NamespaceBackend {
    async fn create(&self, source: &str) -> Result<SandboxHandle> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let config = self.config.clone();
        let source = source.to_string();

        let spawned = tokio::task::spawn_blocking({
            let id = id.clone();
            move || spawn_sandbox(&config, &id, &source)
        })
        .await
        .map_err(|e| SessionError::Creation(e.to_string()))?
        .map_err(SessionError::Creation)?;

        let stdin = match pipe::Sender::from_owned_fd(spawned.stdin) {
            Ok(stdin) => stdin,
            Err(e) => {
                let (pid, root, code_dir, cgroup) =
                    (spawned.pid, spawned.root, spawned.code_dir, spawned.cgroup);
                tokio::task::spawn_blocking(move || {
                    kill_and_reap(pid, None);
                    remove_sandbox(&root, &code_dir, cgroup.as_ref())
                })
                .await
                .ok();
                return Err(SessionError::Creation(format!("stdin pipe: {}", e)));
            }
        };

        info!(sandbox_id = %id, pid = %spawned.pid, "sandbox started");
        self.instances().insert(
            id.clone(),
            Instance {
                pid: spawned.pid,
                root: spawned.root,
                code_dir: spawned.code_dir,
                cgroup: spawned.cgroup,
                stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
                output: Some((spawned.stdout, spawned.stderr)),
                exit_code: None,
            },
        );
        Ok(SandboxHandle::new(id))
    }

    async fn attach(&self, handle: &SandboxHandle) -> Result<SandboxChannel> {
        let (stdout, stderr) = self
            .instances()
            .get_mut(handle.id())
            .ok_or_else(|| SessionError::Attach(format!("unknown sandbox {}", handle.id())))?
            .output
            .take()
            .ok_or_else(|| SessionError::Attach("sandbox is already attached".to_string()))?;

        let stdout = pipe::Receiver::from_owned_fd(stdout)
            .map_err(|e| SessionError::Attach(format!("stdout pipe: {}", e)))?;
        let stderr = pipe::Receiver::from_owned_fd(stderr)
            .map_err(|e| SessionError::Attach(format!("stderr pipe: {}", e)))?;

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(pump(StreamKind::Stdout, stdout, tx.clone()));
        tokio::spawn(pump(StreamKind::Stderr, stderr, tx));
        debug!(sandbox_id = %handle.id(), "attached");

        Ok(SandboxChannel {
            output: rx,
            framing: Framing::Demultiplexed,
        })
    }

    async fn write_input(&self, handle: &SandboxHandle, text: &str) -> Result<()> {
        let stdin = self
            .instances()
            .get(handle.id())
            .map(|instance| instance.stdin.clone())
            .ok_or_else(|| SessionError::Stream(format!("unknown sandbox {}", handle.id())))?;

        let mut stdin = stdin.lock().await;
        stdin
            .write_all(input_line(text).as_bytes())
            .await
            .map_err(|e| SessionError::Stream(format!("write stdin: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| SessionError::Stream(format!("flush stdin: {}", e)))
    }

    async fn inspect(&self, handle: &SandboxHandle) -> Result<SandboxStatus> {
        let mut instances = self.instances();
        let instance = instances
            .get_mut(handle.id())
            .ok_or_else(|| SessionError::Stream(format!("unknown sandbox {}", handle.id())))?;

        if let Some(code) = instance.exit_code {
            return Ok(SandboxStatus::exited(code));
        }
        match waitpid(instance.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(SandboxStatus::running()),
            Ok(status) => match exit_code(status) {
                Some(code) => {
                    instance.exit_code = Some(code);
                    Ok(SandboxStatus::exited(code))
                }
                None => Ok(SandboxStatus::running()),
            },
            Err(e) => Err(SessionError::Stream(format!("waitpid: {}", e))),
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        let Some(instance) = self.instances().remove(handle.id()) else {
            return Ok(());
        };
        let Instance { pid, root, code_dir, cgroup, exit_code, .. } = instance;

        tokio::task::spawn_blocking(move || {
            kill_and_reap(pid, exit_code);
            remove_sandbox(&root, &code_dir, cgroup.as_ref())
        })
        .await
        .map_err(|e| SessionError::Teardown(e.to_string()))?
        .map_err(SessionError::Teardown)?;

        info!(sandbox_id = %handle.id(), "sandbox destroyed");
        Ok(())
    }
}

/// Forward one pipe into the shared channel until EOF. Chunks are cut on
/// UTF-8 boundaries so a multibyte character never straddles two chunks.
async fn pump(
    stream: StreamKind,
    mut reader: pipe::Receiver,
    tx: mpsc::Sender<std::io::Result<OutputChunk>>,
) {
    let mut buf = vec![0u8; READ_BUF];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let bytes = match reader.read(&mut buf).await {
            Ok(0) => {
                if !pending.is_empty() {
                    let _ = tx.send(Ok(OutputChunk { stream, bytes: pending })).await;
                }
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let ready = pending.len() - incomplete_utf8_tail(&pending);
                let rest = pending.split_off(ready);
                std::mem::replace(&mut pending, rest)
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        };
        if bytes.is_empty() {
            continue;
        }
        if tx.send(Ok(OutputChunk { stream, bytes })).await.is_err() {
            break;
        }
    }
    debug!(?stream, "pipe closed");
}

/// Length of a truncated multibyte sequence at the end of `bytes`.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Err(e) if e.error_len().is_none() => bytes.len() - e.valid_up_to(),
        _ => 0,
    }
}

fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

fn spawn_sandbox(config: &NamespaceConfig, id: &str, source: &str) -> std::result::Result<Spawned, String> {
    let root = config.work_dir.join(format!("root-{}", id));
    let code_dir = config.work_dir.join(format!("code-{}", id));

    write_program(&code_dir, source).map_err(|e| {
        let _ = fs::remove_dir_all(&code_dir);
        e
    })?;

    let cgroup = if Cgroup::available(&config.cgroup_root) {
        match Cgroup::create(&config.cgroup_root, id, &config.limits) {
            Ok(cgroup) => Some(cgroup),
            Err(e) => {
                remove_sandbox(&root, &code_dir, None).ok();
                return Err(format!("cgroup: {}", e));
            }
        }
    } else if config.require_cgroups {
        remove_sandbox(&root, &code_dir, None).ok();
        return Err("cgroup v2 hierarchy is not available".to_string());
    } else {
        warn!(cgroup_root = ?config.cgroup_root, "cgroup v2 not available, relying on rlimits only");
        None
    };

    match setup_sandbox_dir(&root, &code_dir).and_then(|()| start_child(config, &root, cgroup.as_ref())) {
        Ok((pid, stdin, stdout, stderr)) => Ok(Spawned {
            pid,
            root,
            code_dir,
            cgroup,
            stdin,
            stdout,
            stderr,
        }),
        Err(e) => {
            if let Err(cleanup) = remove_sandbox(&root, &code_dir, cgroup.as_ref()) {
                warn!(error = %cleanup, "cleanup after failed create");
            }
            Err(e)
        }
    }
}

fn write_program(code_dir: &Path, source: &str) -> std::result::Result<(), String> {
    fs::create_dir_all(code_dir).map_err(|e| format!("mkdir code: {}", e))?;
    fs::set_permissions(code_dir, fs::Permissions::from_mode(0o755))
        .map_err(|e| format!("chmod code: {}", e))?;
    let program = code_dir.join(PROGRAM_FILE);
    fs::write(&program, source).map_err(|e| format!("write program: {}", e))?;
    fs::set_permissions(&program, fs::Permissions::from_mode(0o644))
        .map_err(|e| format!("chmod program: {}", e))
}

fn setup_sandbox_dir(sandbox_root: &Path, code_dir: &Path) -> std::result::Result<(), String> {
    fs::create_dir_all(sandbox_root).map_err(|e| format!("mkdir: {}", e))?;

    mount(
        Some("tmpfs"),
        sandbox_root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("size=64M,mode=755"),
    )
    .map_err(|e| format!("mount tmpfs: {}", e))?;

    for dir in &BIND_DIRS {
        if Path::new(dir).exists() {
            bind_read_only(Path::new(dir), &sandbox_root.join(&dir[1..]))?;
        }
    }
    bind_read_only(code_dir, &sandbox_root.join(CODE_MOUNT))?;

    let tmp_dir = sandbox_root.join("tmp");
    fs::create_dir_all(&tmp_dir).map_err(|e| format!("mkdir tmp: {}", e))?;
    fs::set_permissions(&tmp_dir, fs::Permissions::from_mode(0o1777))
        .map_err(|e| format!("chmod tmp: {}", e))?;

    let dev_dir = sandbox_root.join("dev");
    fs::create_dir_all(&dev_dir).map_err(|e| format!("mkdir dev: {}", e))?;
    for dev in &DEVICES {
        let host_dev = format!("/dev/{}", dev);
        let sandbox_dev = dev_dir.join(dev);
        if Path::new(&host_dev).exists() {
            fs::write(&sandbox_dev, "").map_err(|e| format!("touch {}: {}", dev, e))?;
            mount(
                Some(host_dev.as_str()),
                &sandbox_dev,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| format!("bind mount {}: {}", dev, e))?;
        }
    }

    // procfs is mounted by the child, inside its own PID namespace
    fs::create_dir_all(sandbox_root.join("proc")).map_err(|e| format!("mkdir proc: {}", e))?;
    Ok(())
}

fn bind_read_only(source: &Path, target: &Path) -> std::result::Result<(), String> {
    fs::create_dir_all(target).map_err(|e| format!("mkdir {:?}: {}", target, e))?;
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| format!("bind mount {:?}: {}", source, e))?;
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| format!("remount ro {:?}: {}", target, e))?;
    Ok(())
}

fn build_plan(
    config: &NamespaceConfig,
    root: &Path,
    cgroup: Option<&Cgroup>,
) -> std::result::Result<ChildPlan, String> {
    let cstring = |s: &str| CString::new(s).map_err(|e| format!("argument {:?}: {}", s, e));
    let python = config.python.to_string_lossy().into_owned();
    let program_path = format!("/{}/{}", CODE_MOUNT, PROGRAM_FILE);

    Ok(ChildPlan {
        root: root.to_path_buf(),
        proc_dir: root.join("proc"),
        cgroup_procs: cgroup.map(Cgroup::procs_path),
        limits: config.limits.clone(),
        program: cstring(python.as_str())?,
        argv: vec![
            cstring(python.as_str())?,
            cstring("-u")?,
            cstring(program_path.as_str())?,
        ],
        envp: [
            "PATH=/usr/local/bin:/usr/bin:/bin",
            "HOME=/tmp",
            "LANG=C.UTF-8",
            "PYTHONUNBUFFERED=1",
            "PYTHONDONTWRITEBYTECODE=1",
            "PYTHONIOENCODING=utf-8",
        ]
        .iter()
        .map(|s| cstring(*s))
        .collect::<std::result::Result<_, _>>()?,
    })
}

fn start_child(
    config: &NamespaceConfig,
    root: &Path,
    cgroup: Option<&Cgroup>,
) -> std::result::Result<(Pid, OwnedFd, OwnedFd, OwnedFd), String> {
    let plan = build_plan(config, root, cgroup)?;

    // Parent ends must not leak into the child past exec
    let (stdin_read, stdin_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| format!("pipe: {}", e))?;
    let (stdout_read, stdout_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| format!("pipe: {}", e))?;
    let (stderr_read, stderr_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| format!("pipe: {}", e))?;

    let stdin_fd = stdin_read.as_raw_fd();
    let stdout_fd = stdout_write.as_raw_fd();
    let stderr_fd = stderr_write.as_raw_fd();

    let mut stack = vec![0u8; STACK_SIZE];
    let clone_flags = CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS;

    let child_fn = Box::new(move || {
        unsafe {
            libc::dup2(stdin_fd, 0);
            libc::dup2(stdout_fd, 1);
            libc::dup2(stderr_fd, 2);
        }
        if let Err(e) = run_child(&plan) {
            let _ = writeln!(std::io::stderr(), "sandbox: {}", e);
            return 127;
        }
        0
    });

    let pid = unsafe { clone(child_fn, &mut stack, clone_flags, Some(Signal::SIGCHLD as i32)) }
        .map_err(|e| format!("clone: {}", e))?;

    drop(stdin_read);
    drop(stdout_write);
    drop(stderr_write);

    Ok((pid, stdin_write, stdout_read, stderr_read))
}

fn run_child(plan: &ChildPlan) -> std::result::Result<(), String> {
    if let Some(procs) = &plan.cgroup_procs {
        fs::write(procs, "0").map_err(|e| format!("join cgroup: {}", e))?;
    }

    // Keep our mounts out of the host's propagation group
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| format!("make mounts private: {}", e))?;
    mount(
        Some("proc"),
        &plan.proc_dir,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| format!("mount proc: {}", e))?;

    set_resource_limits(&plan.limits, plan.cgroup_procs.is_none())?;

    chroot(&plan.root).map_err(|e| format!("chroot: {}", e))?;
    chdir("/tmp").map_err(|e| format!("chdir: {}", e))?;

    // Raw syscalls: the libc wrappers try to sync threads that do not exist in the clone
    unsafe {
        if libc::syscall(libc::SYS_setgroups, 0, std::ptr::null::<libc::gid_t>()) != 0 {
            return Err(format!("setgroups: {}", Errno::last()));
        }
        if libc::syscall(libc::SYS_setgid, NOBODY_GID) != 0 {
            return Err(format!("setgid: {}", Errno::last()));
        }
        if libc::syscall(libc::SYS_setuid, NOBODY_UID) != 0 {
            return Err(format!("setuid: {}", Errno::last()));
        }
    }

    match execve(&plan.program, &plan.argv, &plan.envp) {
        Ok(never) => match never {},
        Err(e) => Err(format!("exec: {}", e)),
    }
}

/// rlimits on top of the cgroup. Without a cgroup they are the only
/// ceilings, so memory and process count are enforced here too.
fn set_resource_limits(limits: &SandboxLimits, without_cgroup: bool) -> std::result::Result<(), String> {
    let cpu_seconds = std::cmp::max(1, limits.cpu_time_secs);
    setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds)
        .map_err(|e| format!("rlimit cpu: {}", e))?;

    let fsize_bytes = limits.fsize_kb * 1024;
    setrlimit(Resource::RLIMIT_FSIZE, fsize_bytes, fsize_bytes)
        .map_err(|e| format!("rlimit fsize: {}", e))?;

    setrlimit(Resource::RLIMIT_NOFILE, limits.nofile, limits.nofile)
        .map_err(|e| format!("rlimit nofile: {}", e))?;

    setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(|e| format!("rlimit core: {}", e))?;

    if without_cgroup {
        setrlimit(Resource::RLIMIT_AS, limits.memory_bytes, limits.memory_bytes)
            .map_err(|e| format!("rlimit as: {}", e))?;
        setrlimit(Resource::RLIMIT_NPROC, limits.max_pids, limits.max_pids)
            .map_err(|e| format!("rlimit nproc: {}", e))?;
    }
    Ok(())
}

/// Kill the namespace init (which takes every other process in the
/// namespace with it) and reap it.
fn kill_and_reap(pid: Pid, exit_code: Option<i32>) {
    if exit_code.is_some() {
        return;
    }
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(%pid, error = %e, "kill failed"),
    }
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Ok(_) | Err(_) => break,
        }
    }
}

fn remove_sandbox(sandbox_root: &Path, code_dir: &Path, cgroup: Option<&Cgroup>) -> std::result::Result<(), String> {
    let mount_points = ["proc", CODE_MOUNT, "etc", "usr", "lib64", "lib", "bin"];
    for mp in &mount_points {
        let path = sandbox_root.join(mp);
        if path.exists() {
            let _ = umount2(&path, MntFlags::MNT_DETACH);
        }
    }
    let dev_dir = sandbox_root.join("dev");
    if dev_dir.exists() {
        for dev in &DEVICES {
            let dev_path = dev_dir.join(dev);
            if dev_path.exists() {
                let _ = umount2(&dev_path, MntFlags::MNT_DETACH);
            }
        }
    }
    if sandbox_root.exists() {
        let _ = umount2(sandbox_root, MntFlags::MNT_DETACH);
        fs::remove_dir_all(sandbox_root).map_err(|e| format!("remove root: {}", e))?;
    }
    if code_dir.exists() {
        fs::remove_dir_all(code_dir).map_err(|e| format!("remove code: {}", e))?;
    }
    if let Some(cgroup) = cgroup {
        cgroup.remove()?;
    }
    Ok(())
}
