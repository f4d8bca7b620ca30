//! Local process isolation backend.
//!
//! A build copies the bundle's build context into a backend-owned cache
//! directory and runs `build_command` there. Each run gets a private
//! scratch directory holding a copy of the built tree; absolute paths
//! used by the harness (`/tests`, `/solution`, `/logs/...`) are mapped
//! under that directory, and a leased service port is exported as
//! `$FORGE_PORT`.
//!
//! Every command runs in a pinned group: a process group whose leader is
//! an idle sentinel the backend never reaps while it holds the group. The
//! group id therefore stays reserved for as long as the backend may signal
//! it. Run commands additionally carry the bundle's memory and storage
//! ceilings as rlimits.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::bundle::{BuildKey, BuildSource, TaskBundle};
use crate::error::{BuildError, EnvironmentError};
use crate::execution::{
    truncate, Backend, BuildArtifact, BuiltEnvironment, Environment, ExecOptions, ExecResult,
    ExecutionLimits, PortLease, ResourceSample, PORT_VAR,
};
use crate::trace::{EventKind, OutputStream, Stage, TraceHandle};

/// How long to wait for output pipes after the process group was killed.
const PIPE_DRAIN: Duration = Duration::from_secs(2);
/// Maximum build output kept in a failure diagnostic.
const MAX_BUILD_DIAGNOSTIC: usize = 16 * 1024;

/// A process group led by an idle sentinel.
///
/// While the leader is held unreaped its pid, and so the group id, cannot
/// be reused by an unrelated process. Dropping the group kills every
/// member and reaps the leader.
struct PinnedGroup {
    leader: Option<std::process::Child>,
}

impl PinnedGroup {
    /// Spawns the sentinel that leads a fresh group.
    fn spawn() -> std::io::Result<Self> {
        let mut sentinel = std::process::Command::new("sleep");
        sentinel
            .arg("2147483647")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            sentinel.process_group(0);
        }
        Ok(Self {
            leader: Some(sentinel.spawn()?),
        })
    }

    fn pgid(&self) -> Option<u32> {
        self.leader.as_ref().map(std::process::Child::id)
    }

    /// Puts `cmd` into this group.
    fn adopt(&self, cmd: &mut Command) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid() {
            cmd.process_group(pgid as i32);
        }
        #[cfg(not(unix))]
        let _ = cmd;
    }

    fn kill(&self) {
        if let Some(pgid) = self.pgid() {
            kill_group(pgid);
        }
    }

    /// True when processes besides the sentinel are still in the group.
    fn has_members(&self) -> bool {
        let Some(pgid) = self.pgid() else {
            return false;
        };
        #[cfg(target_os = "linux")]
        {
            procfs::group_members(&[pgid])
                .iter()
                .any(|p| p.pid != pgid && p.state != 'Z')
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pgid;
            true
        }
    }
}

impl Drop for PinnedGroup {
    fn drop(&mut self) {
        if let Some(mut leader) = self.leader.take() {
            if let Ok(pgid) = i32::try_from(leader.id()) {
                kill_raw(pgid);
            }
            let _ = leader.kill();
            let _ = leader.wait();
        }
    }
}

#[cfg(unix)]
fn kill_raw(pgid: i32) {
    // SAFETY: killpg has no memory-safety preconditions. The group leader is
    // held unreaped by the caller, so the id cannot name a foreign group.
    unsafe {
        libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_raw(_pgid: i32) {}

fn kill_group(pgid: u32) {
    if let Ok(pgid) = i32::try_from(pgid) {
        kill_raw(pgid);
    }
}

/// Applies memory and file-size ceilings in the child before `exec`.
#[cfg(unix)]
fn apply_limits(cmd: &mut Command, limits: ExecutionLimits) {
    let memory = limits.memory_mb.saturating_mul(1024 * 1024) as libc::rlim_t;
    let storage = limits.storage_mb.saturating_mul(1024 * 1024) as libc::rlim_t;
    // SAFETY: the closure runs between fork and exec and only calls
    // setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            let address_space = libc::rlimit {
                rlim_cur: memory,
                rlim_max: memory,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &address_space) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let file_size = libc::rlimit {
                rlim_cur: storage,
                rlim_max: storage,
            };
            if libc::setrlimit(libc::RLIMIT_FSIZE, &file_size) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_limits(_cmd: &mut Command, _limits: ExecutionLimits) {}

fn shell(
    command: &str,
    cwd: &Path,
    env: &[(String, String)],
    group: &PinnedGroup,
    limits: Option<ExecutionLimits>,
) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true);
    group.adopt(&mut cmd);
    if let Some(limits) = limits {
        apply_limits(&mut cmd, limits);
    }
    cmd
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn drain(mut task: JoinHandle<String>) -> String {
    match tokio::time::timeout(PIPE_DRAIN, &mut task).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

/// Runs `bash -c command` in `group` under `timeout`.
///
/// On timeout the whole group is killed and whatever output was produced
/// is kept. Dropping the future kills the command through `kill_on_drop`;
/// the group itself stays with the caller.
async fn run_shell(
    command: &str,
    cwd: &Path,
    env: &[(String, String)],
    timeout: Duration,
    group: &PinnedGroup,
    limits: Option<ExecutionLimits>,
) -> std::io::Result<ExecResult> {
    let started = Instant::now();
    let mut child = shell(command, cwd, env, group, limits)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = tokio::spawn(read_all(child.stdout.take()));
    let stderr = tokio::spawn(read_all(child.stderr.take()));

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status?.code().map(i64::from).unwrap_or(-1), false),
        Err(_) => {
            group.kill();
            let _ = child.wait().await;
            (-1, true)
        }
    };

    Ok(ExecResult {
        exit_code,
        stdout: drain(stdout).await,
        stderr: drain(stderr).await,
        timed_out,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// Process table scans for group membership and usage.
#[cfg(target_os = "linux")]
mod procfs {
    /// Fields of `/proc/<pid>/stat` the backend reads.
    #[derive(Debug, Clone, PartialEq)]
    pub struct ProcStat {
        pub pid: u32,
        pub state: char,
        pub pgrp: u32,
        /// utime + stime, in clock ticks.
        pub cpu_ticks: u64,
        /// Resident set, in pages.
        pub rss_pages: u64,
    }

    /// Parses one `stat` line. The command name may contain spaces and
    /// parentheses, so fields are counted from the last `)`.
    pub fn parse_stat(line: &str) -> Option<ProcStat> {
        let open = line.find('(')?;
        let close = line.rfind(')')?;
        let pid = line[..open].trim().parse().ok()?;
        let fields: Vec<&str> = line[close + 1..].split_whitespace().collect();
        let field = |i: usize| fields.get(i).and_then(|f| f.parse::<u64>().ok());
        Some(ProcStat {
            pid,
            state: fields.first()?.chars().next()?,
            pgrp: u32::try_from(field(2)?).ok()?,
            cpu_ticks: field(11)? + field(12)?,
            rss_pages: field(21)?,
        })
    }

    /// Every process whose group is one of `pgids`.
    pub fn group_members(pgids: &[u32]) -> Vec<ProcStat> {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                entry.file_name().to_str()?.parse::<u32>().ok()?;
                let line = std::fs::read_to_string(entry.path().join("stat")).ok()?;
                parse_stat(&line)
            })
            .filter(|stat| pgids.contains(&stat.pgrp))
            .collect()
    }

    pub fn clock_ticks() -> u64 {
        // SAFETY: sysconf only reads a configuration value.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        u64::try_from(ticks).ok().filter(|t| *t > 0).unwrap_or(100)
    }

    pub fn page_size() -> u64 {
        // SAFETY: sysconf only reads a configuration value.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        u64::try_from(size).ok().filter(|s| *s > 0).unwrap_or(4096)
    }
}

/// Recursively copies `src` into `dst`, preserving relative layout.
pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
            #[cfg(not(unix))]
            std::fs::copy(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Maps an absolute in-context path under `root`.
fn map_under(root: &Path, path: &str) -> PathBuf {
    match path.strip_prefix('/') {
        Some(rel) => root.join(rel),
        None => root.join(path),
    }
}

fn parse_env(pairs: &[String]) -> Vec<(String, String)> {
    pairs
        .iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Process-based [`Backend`].
pub struct LocalBackend {
    cache_root: PathBuf,
}

impl LocalBackend {
    /// Creates a backend caching builds under `cache_root`.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    fn build_dir(&self, key: &BuildKey) -> PathBuf {
        self.cache_root.join(key.short())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn build(
        &self,
        bundle: &TaskBundle,
        trace: &TraceHandle,
    ) -> Result<BuiltEnvironment, BuildError> {
        let BuildSource::Command(command) = &bundle.environment.source else {
            return Err(BuildError::Failed {
                diagnostic: format!(
                    "local backend cannot build '{}' environments",
                    bundle.environment.source.kind()
                ),
            });
        };

        let key = bundle.build_key();
        let dir = self.build_dir(&key);
        let context = bundle.environment.context.clone();
        let target = dir.clone();
        let started = Instant::now();

        tokio::task::spawn_blocking(move || {
            if target.exists() {
                std::fs::remove_dir_all(&target)?;
            }
            if context.is_dir() {
                copy_tree(&context, &target)
            } else {
                std::fs::create_dir_all(&target)
            }
        })
        .await
        .map_err(|e| BuildError::Failed {
            diagnostic: format!("context copy task failed: {e}"),
        })?
        .map_err(|e| BuildError::Failed {
            diagnostic: format!("cannot copy build context: {e}"),
        })?;

        info!(task = %bundle.name, dir = %dir.display(), "Running build command");
        let spawn_failed = |e: std::io::Error| BuildError::Failed {
            diagnostic: format!("cannot spawn build command: {e}"),
        };
        let group = PinnedGroup::spawn().map_err(spawn_failed)?;
        let result = run_shell(command, &dir, &[], bundle.timeouts.build, &group, None)
            .await
            .map_err(spawn_failed)?;
        drop(group);

        trace.record(
            Stage::Provision,
            EventKind::Command {
                command: command.clone(),
                exit_code: Some(result.exit_code),
                duration_ms: result.duration_ms,
                timed_out: result.timed_out,
            },
        );
        for (stream, content) in [
            (OutputStream::Stdout, &result.stdout),
            (OutputStream::Stderr, &result.stderr),
        ] {
            if !content.is_empty() {
                trace.record(
                    Stage::Provision,
                    EventKind::Output {
                        stream,
                        content: content.clone(),
                    },
                );
            }
        }

        if result.timed_out {
            return Err(BuildError::Timeout(bundle.timeouts.build));
        }
        if !result.success() {
            let output = if result.stderr.trim().is_empty() {
                &result.stdout
            } else {
                &result.stderr
            };
            return Err(BuildError::Failed {
                diagnostic: format!(
                    "build command exited with {}: {}",
                    result.exit_code,
                    truncate(output, MAX_BUILD_DIAGNOSTIC)
                ),
            });
        }

        Ok(BuiltEnvironment {
            key,
            artifact: BuildArtifact::Directory(dir),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn release_build(&self, key: &BuildKey) {
        let dir = self.build_dir(key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(dir = %dir.display(), "Removed partial build"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove partial build"),
        }
    }

    async fn create(
        &self,
        bundle: &TaskBundle,
        built: &BuiltEnvironment,
        run_id: &str,
    ) -> Result<Arc<dyn Environment>, BuildError> {
        let BuildArtifact::Directory(source) = &built.artifact else {
            return Err(BuildError::StartFailed(
                "local backend received a non-directory build".to_string(),
            ));
        };

        let scratch = tempfile::Builder::new()
            .prefix("forge-run-")
            .tempdir()
            .map_err(|e| BuildError::StartFailed(format!("cannot create scratch dir: {e}")))?;
        let root = scratch.path().to_path_buf();
        let workdir = map_under(&root, &bundle.environment.workdir);

        let (src, dst, logs) = (source.clone(), workdir.clone(), root.join("logs"));
        tokio::task::spawn_blocking(move || {
            copy_tree(&src, &dst)?;
            std::fs::create_dir_all(&logs)
        })
        .await
        .map_err(|e| BuildError::StartFailed(e.to_string()))?
        .map_err(|e| BuildError::StartFailed(format!("cannot populate scratch dir: {e}")))?;

        let port = PortLease::acquire()
            .map_err(|e| BuildError::StartFailed(format!("cannot lease service port: {e}")))?;
        let env = Arc::new(LocalEnvironment {
            id: format!("{run_id}:{}", root.display()),
            root,
            workdir,
            port,
            limits: ExecutionLimits::from(&bundle.resources),
            scratch: Mutex::new(Some(scratch)),
            services: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
            inflight: Mutex::new(HashSet::new()),
            last_cpu: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        });

        if let Some(start) = &bundle.environment.start {
            if let Err(e) = env.start_service(start) {
                let _ = env.teardown().await;
                return Err(BuildError::StartFailed(format!("service start failed: {e}")));
            }
        }

        info!(
            run_id = %run_id,
            root = %env.root.display(),
            port = env.port.port(),
            "Local environment ready"
        );
        Ok(env)
    }
}

/// One run's scratch directory and the processes running in it.
pub struct LocalEnvironment {
    id: String,
    root: PathBuf,
    workdir: PathBuf,
    port: PortLease,
    limits: ExecutionLimits,
    scratch: Mutex<Option<TempDir>>,
    services: Mutex<Vec<(Child, PinnedGroup)>>,
    /// Groups of finished commands that left background jobs behind.
    groups: Mutex<Vec<PinnedGroup>>,
    /// Groups of commands still running.
    inflight: Mutex<HashSet<u32>>,
    /// Previous CPU reading: when, and total ticks.
    last_cpu: Mutex<Option<(Instant, u64)>>,
    torn_down: AtomicBool,
}

/// Registers a running command's group for sampling until dropped.
struct Inflight<'a> {
    set: &'a Mutex<HashSet<u32>>,
    pgid: Option<u32>,
}

impl<'a> Inflight<'a> {
    fn new(set: &'a Mutex<HashSet<u32>>, pgid: Option<u32>) -> Self {
        if let (Some(pgid), Ok(mut set)) = (pgid, set.lock()) {
            set.insert(pgid);
        }
        Self { set, pgid }
    }
}

impl Drop for Inflight<'_> {
    fn drop(&mut self) {
        if let (Some(pgid), Ok(mut set)) = (self.pgid, self.set.lock()) {
            set.remove(&pgid);
        }
    }
}

impl LocalEnvironment {
    fn ensure_live(&self) -> Result<(), EnvironmentError> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(EnvironmentError::TornDown(self.id.clone()));
        }
        Ok(())
    }

    fn base_env(&self) -> Vec<(String, String)> {
        vec![
            ("FORGE_ROOT".to_string(), self.root.display().to_string()),
            (PORT_VAR.to_string(), self.port.port().to_string()),
        ]
    }

    fn start_service(&self, command: &str) -> std::io::Result<()> {
        let log = std::fs::File::create(self.root.join("logs").join("service.log"))?;
        let group = PinnedGroup::spawn()?;
        let child = shell(command, &self.workdir, &self.base_env(), &group, Some(self.limits))
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()?;
        if let Ok(mut services) = self.services.lock() {
            services.push((child, group));
        }
        Ok(())
    }

    /// Group ids of every process this context may still be running.
    #[cfg(target_os = "linux")]
    fn live_groups(&self) -> Vec<u32> {
        let mut pgids: Vec<u32> = self
            .inflight
            .lock()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if let Ok(groups) = self.groups.lock() {
            pgids.extend(groups.iter().filter_map(PinnedGroup::pgid));
        }
        if let Ok(services) = self.services.lock() {
            pgids.extend(services.iter().filter_map(|(_, group)| group.pgid()));
        }
        pgids
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn service_port(&self) -> Option<u16> {
        Some(self.port.port())
    }

    async fn exec(
        &self,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecResult, EnvironmentError> {
        self.ensure_live()?;
        let cwd = options
            .workdir
            .as_deref()
            .map(|dir| map_under(&self.root, dir))
            .unwrap_or_else(|| self.workdir.clone());
        let mut env = self.base_env();
        env.extend(parse_env(&options.env));

        let group = PinnedGroup::spawn()?;
        let result = {
            let _inflight = Inflight::new(&self.inflight, group.pgid());
            run_shell(command, &cwd, &env, options.timeout, &group, Some(self.limits)).await?
        };
        // Background jobs a command leaves behind die with the context.
        if group.has_members() {
            if let Ok(mut groups) = self.groups.lock() {
                groups.push(group);
            }
        }
        Ok(result)
    }

    fn resolve_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            map_under(&self.root, path).display().to_string()
        } else {
            path.to_string()
        }
    }

    async fn upload_dir(&self, host_dir: &Path, target: &str) -> Result<(), EnvironmentError> {
        self.ensure_live()?;
        let (src, dst) = (host_dir.to_path_buf(), map_under(&self.root, target));
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| EnvironmentError::Process(e.to_string()))??;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>, EnvironmentError> {
        self.ensure_live()?;
        match tokio::fs::read(map_under(&self.root, path)).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(target_os = "linux")]
    async fn sample_resources(&self) -> Option<ResourceSample> {
        if self.torn_down.load(Ordering::SeqCst) {
            return None;
        }
        let pgids = self.live_groups();
        let members = tokio::task::spawn_blocking(move || procfs::group_members(&pgids))
            .await
            .ok()?;
        let now = Instant::now();
        let ticks: u64 = members.iter().map(|p| p.cpu_ticks).sum();
        let pages: u64 = members.iter().map(|p| p.rss_pages).sum();

        let previous = self
            .last_cpu
            .lock()
            .ok()
            .and_then(|mut last| last.replace((now, ticks)));
        let cpu_percent = previous.and_then(|(at, before)| {
            let elapsed = now.duration_since(at).as_secs_f64();
            (elapsed > 0.0).then(|| {
                let used = ticks.saturating_sub(before) as f64 / procfs::clock_ticks() as f64;
                used / elapsed * 100.0
            })
        });

        Some(ResourceSample {
            cpu_percent,
            memory_bytes: Some(pages * procfs::page_size()),
        })
    }

    #[cfg(not(target_os = "linux"))]
    async fn sample_resources(&self) -> Option<ResourceSample> {
        None
    }

    async fn teardown(&self) -> Result<(), EnvironmentError> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let services = self
            .services
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default();
        for (mut child, group) in services {
            group.kill();
            let _ = tokio::time::timeout(PIPE_DRAIN, child.wait()).await;
        }

        // Dropping a pinned group kills what is left in it.
        let groups = self
            .groups
            .lock()
            .map(|mut g| std::mem::take(&mut *g))
            .unwrap_or_default();
        drop(groups);

        let scratch = self.scratch.lock().ok().and_then(|mut s| s.take());
        if let Some(scratch) = scratch {
            tokio::task::spawn_blocking(move || scratch.close())
                .await
                .map_err(|e| EnvironmentError::Process(e.to_string()))??;
        }
        debug!(env = %self.id, "Local environment torn down");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bundle::ResourceLimits;

    fn limits(memory_mb: u64, storage_mb: u64) -> ExecutionLimits {
        ExecutionLimits::from(&ResourceLimits {
            cpus: 1.0,
            memory_mb,
            storage_mb,
            extra: Default::default(),
        })
    }

    fn environment(memory_mb: u64, storage_mb: u64) -> LocalEnvironment {
        let scratch = tempfile::TempDir::new().unwrap();
        let root = scratch.path().to_path_buf();
        std::fs::create_dir_all(root.join("app")).unwrap();
        std::fs::create_dir_all(root.join("logs")).unwrap();
        LocalEnvironment {
            id: "test".to_string(),
            workdir: root.join("app"),
            root,
            port: PortLease::acquire().unwrap(),
            limits: limits(memory_mb, storage_mb),
            scratch: Mutex::new(Some(scratch)),
            services: Mutex::new(Vec::new()),
            groups: Mutex::new(Vec::new()),
            inflight: Mutex::new(HashSet::new()),
            last_cpu: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    fn alive(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    async fn wait_gone(pid: u32) -> bool {
        for _ in 0..50 {
            let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap_or_default();
            if !alive(pid) || stat.contains(") Z ") {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_run_shell_captures_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let group = PinnedGroup::spawn().unwrap();
        let result = run_shell(
            "echo out; echo err >&2; exit 3",
            dir.path(),
            &[],
            Duration::from_secs(10),
            &group,
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_run_shell_kills_on_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let started = Instant::now();
        let group = PinnedGroup::spawn().unwrap();
        let result = run_shell(
            "echo started; sleep 30 & sleep 30",
            dir.path(),
            &[],
            Duration::from_millis(300),
            &group,
            None,
        )
        .await
        .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.stdout.trim(), "started");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_map_under_strips_root() {
        let root = Path::new("/tmp/run");
        assert_eq!(map_under(root, "/tests"), PathBuf::from("/tmp/run/tests"));
        assert_eq!(
            map_under(root, "/logs/verifier/results.jsonl"),
            PathBuf::from("/tmp/run/logs/verifier/results.jsonl")
        );
        assert_eq!(map_under(root, "app"), PathBuf::from("/tmp/run/app"));
    }

    #[test]
    fn test_copy_tree() {
        let src = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("a/b/file.txt"), "x").unwrap();
        std::fs::write(src.path().join("top.txt"), "y").unwrap();

        let dst = tempfile::TempDir::new().unwrap();
        let target = dst.path().join("copy");
        copy_tree(src.path(), &target).unwrap();
        assert_eq!(
            std::fs::read_to_string(target.join("a/b/file.txt")).unwrap(),
            "x"
        );
        assert_eq!(std::fs::read_to_string(target.join("top.txt")).unwrap(), "y");
    }

    #[test]
    fn test_copy_tree_keeps_symlinks() {
        let src = tempfile::TempDir::new().unwrap();
        std::fs::write(src.path().join("real.txt"), "z").unwrap();
        std::os::unix::fs::symlink("real.txt", src.path().join("link.txt")).unwrap();

        let dst = tempfile::TempDir::new().unwrap();
        copy_tree(src.path(), dst.path()).unwrap();
        assert_eq!(
            std::fs::read_link(dst.path().join("link.txt")).unwrap(),
            PathBuf::from("real.txt")
        );
        assert_eq!(std::fs::read_to_string(dst.path().join("link.txt")).unwrap(), "z");
    }

    #[test]
    fn test_parse_env_pairs() {
        let env = parse_env(&["A=1".to_string(), "B=x=y".to_string(), "bad".to_string()]);
        assert_eq!(
            env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_finished_command_releases_its_group() {
        let env = environment(1024, 1024);
        let result = env
            .exec("echo done", &ExecOptions::new(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "done");
        assert!(env.groups.lock().unwrap().is_empty());
        assert!(env.inflight.lock().unwrap().is_empty());
        env.teardown().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_background_job_lives_until_teardown() {
        let env = environment(1024, 1024);
        let result = env
            .exec(
                "sleep 30 >/dev/null 2>&1 & echo $!",
                &ExecOptions::new(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        let pid: u32 = result.stdout.trim().parse().unwrap();
        assert!(alive(pid));
        assert_eq!(env.groups.lock().unwrap().len(), 1);

        env.teardown().await.unwrap();
        assert!(wait_gone(pid).await);
        assert!(env.groups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commands_see_service_port() {
        let env = environment(1024, 1024);
        let port = env.service_port().unwrap();
        let result = env
            .exec("echo $FORGE_PORT", &ExecOptions::new(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), port.to_string());
        env.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_ceiling_limits_file_size() {
        let env = environment(1024, 1);
        let result = env
            .exec(
                "head -c 2097152 /dev/zero > big.bin; echo $?; ulimit -f",
                &ExecOptions::new(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_ne!(lines[0], "0");
        // `ulimit -f` reports 1024-byte blocks.
        assert_eq!(lines[1], "1024");
        env.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_ceiling_is_applied() {
        let env = environment(256, 1024);
        let result = env
            .exec("ulimit -v", &ExecOptions::new(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), (256 * 1024).to_string());
        env.teardown().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sample_counts_running_processes() {
        let env = environment(1024, 1024);
        env.start_service("sleep 30").unwrap();
        let first = env.sample_resources().await.unwrap();
        assert!(first.cpu_percent.is_none());
        assert!(first.memory_bytes.unwrap() > 0);
        let second = env.sample_resources().await.unwrap();
        assert!(second.cpu_percent.is_some());

        env.teardown().await.unwrap();
        assert!(env.sample_resources().await.is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_stat_handles_odd_command_names() {
        let line = "4242 (my (odd) cmd) S 1 4240 4240 0 -1 4194560 120 0 0 0 7 3 0 0 20 0 1 0 500 10485760 321 18446744073709551615";
        let stat = procfs::parse_stat(line).unwrap();
        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.pgrp, 4240);
        assert_eq!(stat.cpu_ticks, 10);
        assert_eq!(stat.rss_pages, 321);
        assert!(procfs::parse_stat("garbage").is_none());
    }
}
