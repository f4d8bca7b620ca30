//! Shared fixtures for integration tests.
//!
//! Bundles use `build_command` environments so they run on the local
//! process backend; [`CountingBackend`] wraps it to observe how many
//! builds execute and how many contexts are alive.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forge_harness::bundle::{load_bundle, BuildKey, TaskBundle};
use forge_harness::config::{HarnessConfig, PlatformLimits};
use forge_harness::error::{BuildError, EnvironmentError};
use forge_harness::execution::{
    Backend, BuiltEnvironment, Environment, ExecOptions, ExecResult, LocalBackend, ResourceSample,
};
use forge_harness::run::Harness;
use forge_harness::trace::TraceHandle;
use tempfile::TempDir;

/// Local backend that counts builds and live contexts.
pub struct CountingBackend {
    inner: LocalBackend,
    builds: AtomicUsize,
    live: Arc<AtomicUsize>,
    build_delay: Duration,
}

impl CountingBackend {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            inner: LocalBackend::new(cache_root),
            builds: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            build_delay: Duration::ZERO,
        }
    }

    /// Holds every build open for `delay` before it starts.
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn build(
        &self,
        bundle: &TaskBundle,
        trace: &TraceHandle,
    ) -> Result<BuiltEnvironment, BuildError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if !self.build_delay.is_zero() {
            tokio::time::sleep(self.build_delay).await;
        }
        self.inner.build(bundle, trace).await
    }

    async fn release_build(&self, key: &BuildKey) {
        self.inner.release_build(key).await
    }

    async fn create(
        &self,
        bundle: &TaskBundle,
        built: &BuiltEnvironment,
        run_id: &str,
    ) -> Result<Arc<dyn Environment>, BuildError> {
        let env = self.inner.create(bundle, built, run_id).await?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(CountedEnvironment {
            inner: env,
            live: Arc::clone(&self.live),
            released: AtomicUsize::new(0),
        }))
    }
}

struct CountedEnvironment {
    inner: Arc<dyn Environment>,
    live: Arc<AtomicUsize>,
    released: AtomicUsize,
}

#[async_trait]
impl Environment for CountedEnvironment {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn service_port(&self) -> Option<u16> {
        self.inner.service_port()
    }

    fn dial_host(&self, host: &str) -> String {
        self.inner.dial_host(host)
    }

    async fn exec(
        &self,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecResult, EnvironmentError> {
        self.inner.exec(command, options).await
    }

    async fn upload_dir(&self, host_dir: &Path, target: &str) -> Result<(), EnvironmentError> {
        self.inner.upload_dir(host_dir, target).await
    }

    fn resolve_path(&self, path: &str) -> String {
        self.inner.resolve_path(path)
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>, EnvironmentError> {
        self.inner.read_file(path).await
    }

    async fn sample_resources(&self) -> Option<ResourceSample> {
        self.inner.sample_resources().await
    }

    async fn teardown(&self) -> Result<(), EnvironmentError> {
        let result = self.inner.teardown().await;
        if self.released.fetch_add(1, Ordering::SeqCst) == 0 {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }
}

/// A scratch workspace holding bundles and run output.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("runs")
    }

    pub fn config(&self) -> HarnessConfig {
        HarnessConfig::new()
            .with_output_dir(self.output_dir())
            .with_sample_interval(Duration::from_millis(200))
    }

    pub fn backend(&self) -> Arc<CountingBackend> {
        Arc::new(CountingBackend::new(&self.dir.path().join("builds")))
    }

    pub fn harness(&self, backend: &Arc<CountingBackend>) -> Harness {
        Harness::new(backend.clone(), self.config())
    }

    /// Writes a bundle directory with `task.yaml` plus extra files and loads it.
    pub fn bundle(&self, name: &str, yaml: &str, files: &[(&str, &str)]) -> TaskBundle {
        let root = self.write_bundle(name, yaml, files);
        load_bundle(&root, &PlatformLimits::default()).unwrap()
    }

    pub fn write_bundle(&self, name: &str, yaml: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.dir.path().join("bundles").join(name);
        fs::create_dir_all(root.join("environment")).unwrap();
        fs::write(root.join("task.yaml"), yaml).unwrap();
        for (path, content) in files {
            let full = root.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        root
    }
}

/// Descriptor for a command-mode bundle.
pub fn command_bundle(name: &str, build: &str, checks: &[(&str, &str)]) -> String {
    let mut yaml = format!(
        r#"name: {name}
resources: {{ cpus: 1, memory_mb: 512, storage_mb: 1024 }}
timeouts: {{ build_sec: 30, agent_sec: 30, verifier_sec: 30 }}
environment:
  build_command: {build:?}
verifier:
  checks:
"#
    );
    for (id, command) in checks {
        yaml.push_str(&format!("    - {{ id: {id}, command: {command:?} }}\n"));
    }
    yaml
}

/// Fetches `/<path>` from the context's service and compares the body.
pub const FETCH_SCRIPT: &str = r#"import os, sys, urllib.request
url = "http://127.0.0.1:%s/%s" % (os.environ["FORGE_PORT"], sys.argv[1])
body = urllib.request.urlopen(url, timeout=5).read().decode().strip()
sys.exit(0 if body == sys.argv[2] else 1)
"#;

/// Descriptor for a bundle whose readiness waits on HTTP `/health` at the
/// context's service port. `start`, when given, runs as the service.
pub fn http_service_bundle(
    name: &str,
    build: &str,
    start: Option<&str>,
    checks: &[(&str, &str)],
) -> String {
    let mut yaml = format!(
        r#"name: {name}
resources: {{ cpus: 1, memory_mb: 4096, storage_mb: 1024 }}
timeouts: {{ build_sec: 30, agent_sec: 30, verifier_sec: 30 }}
environment:
  build_command: {build:?}
"#
    );
    if let Some(start) = start {
        yaml.push_str(&format!("  start: {start:?}\n"));
    }
    yaml.push_str(
        r#"readiness:
  deadline_sec: 10
  checks:
    - name: health
      http: { url: "http://127.0.0.1:${FORGE_PORT}/health" }
      interval_ms: 100
verifier:
  checks:
"#,
    );
    for (id, command) in checks {
        yaml.push_str(&format!(
            "    - {{ id: {id}, weight: 1, command: {command:?} }}\n"
        ));
    }
    yaml
}

/// Serves the working directory on `$FORGE_PORT`.
pub const HTTP_SERVICE: &str =
    r#"exec python3 -m http.server "$FORGE_PORT" --bind 127.0.0.1 >/dev/null 2>&1"#;
