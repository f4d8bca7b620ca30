//! Docker isolation backend.
//!
//! Builds one image per bundle identity and creates one container per run.
//! Containers idle on `sleep infinity`; every harness command is a Docker
//! exec, so the container outlives individual commands and is removed only
//! by [`Environment::teardown`].
//!
//! On an isolated network the container keeps its own loopback, so
//! readiness probes that name `127.0.0.1` are redirected to the container
//! address.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::bundle::{BuildKey, BuildSource, TaskBundle};
use crate::error::{BuildError, DockerError, EnvironmentError};
use crate::execution::docker_client::{ContainerConfig, DockerClient, HARNESS_LABEL, RUN_LABEL};
use crate::execution::resources::ExecutionLimits;
use crate::execution::{
    is_loopback, truncate, Backend, BuildArtifact, BuiltEnvironment, Environment, ExecOptions,
    ExecResult, PortLease, ResourceSample, PORT_VAR,
};
use crate::trace::{EventKind, OutputStream, Stage, TraceHandle};

/// Maximum build log kept in a failure diagnostic.
const MAX_BUILD_DIAGNOSTIC: usize = 16 * 1024;
/// Deadline for the helper commands the backend issues itself.
const HELPER_TIMEOUT: Duration = Duration::from_secs(30);
/// Exit code `read_file` uses for "no such file".
const MISSING_FILE_EXIT: i64 = 3;

/// Image tag for a build identity. Docker repository names only allow
/// lowercase alphanumerics separated by single punctuation characters.
pub fn image_tag(key: &BuildKey) -> String {
    let mut repo = String::with_capacity(key.short().len());
    for c in key.short().chars() {
        if c.is_ascii_alphanumeric() {
            repo.push(c.to_ascii_lowercase());
        } else if !repo.ends_with('-') {
            repo.push('-');
        }
    }
    format!("forge-harness/{}:latest", repo.trim_matches('-'))
}

/// Container name for a run.
pub fn container_name(run_id: &str) -> String {
    let sanitized: String = run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("forge-run-{sanitized}")
}

/// Packs a directory into a tar archive, optionally gzip-compressed.
pub fn archive_dir(dir: &Path, gzip: bool) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    let raw = builder.into_inner()?;
    if !gzip {
        return Ok(raw);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&raw)?;
    encoder.finish()
}

/// Docker-backed [`Backend`].
pub struct DockerBackend {
    client: DockerClient,
    network_mode: String,
    enforce_storage: bool,
}

impl DockerBackend {
    pub fn new(client: DockerClient, network_mode: impl Into<String>) -> Self {
        Self {
            client,
            network_mode: network_mode.into(),
            enforce_storage: false,
        }
    }

    /// Applies the bundle's storage ceiling through `storage_opt`. Requires
    /// a storage driver that supports quotas.
    pub fn with_storage_quota(mut self, enforce: bool) -> Self {
        self.enforce_storage = enforce;
        self
    }

    async fn build_dockerfile(
        &self,
        bundle: &TaskBundle,
        dockerfile: &Path,
        trace: &TraceHandle,
    ) -> Result<String, BuildError> {
        let key = bundle.build_key();
        let tag = image_tag(&key);
        let context = bundle.environment.context.clone();
        let context_tar = tokio::task::spawn_blocking(move || archive_dir(&context, true))
            .await
            .map_err(|e| BuildError::Failed {
                diagnostic: format!("context packing task failed: {e}"),
            })?
            .map_err(|e| BuildError::Failed {
                diagnostic: format!("cannot archive build context: {e}"),
            })?;

        let mut labels = HashMap::new();
        labels.insert(HARNESS_LABEL.to_string(), "true".to_string());
        labels.insert("forge-harness.digest".to_string(), key.digest.clone());

        info!(task = %bundle.name, tag = %tag, "Building image");
        let started = Instant::now();
        let result = self
            .client
            .build_image(
                &tag,
                &dockerfile.to_string_lossy(),
                context_tar,
                labels,
            )
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (exit_code, log) = match &result {
            Ok(log) => (Some(0), log.clone()),
            Err(DockerError::BuildFailed(log)) => (Some(1), log.clone()),
            Err(e) => (None, e.to_string()),
        };
        trace.record(
            Stage::Provision,
            EventKind::Command {
                command: format!("docker build -t {tag} -f {}", dockerfile.display()),
                exit_code,
                duration_ms,
                timed_out: false,
            },
        );
        if !log.is_empty() {
            trace.record(
                Stage::Provision,
                EventKind::Output {
                    stream: OutputStream::Stdout,
                    content: log,
                },
            );
        }

        match result {
            Ok(_) => Ok(tag),
            Err(DockerError::BuildFailed(log)) => Err(BuildError::Failed {
                diagnostic: tail(&log, MAX_BUILD_DIAGNOSTIC),
            }),
            Err(e) => Err(BuildError::Failed {
                diagnostic: e.to_string(),
            }),
        }
    }

    async fn ensure_image(&self, image: &str, trace: &TraceHandle) -> Result<String, BuildError> {
        if self.client.image_exists(image).await {
            debug!(image = %image, "Image present locally");
            return Ok(image.to_string());
        }
        let started = Instant::now();
        let result = self.client.pull_image(image).await;
        trace.record(
            Stage::Provision,
            EventKind::Command {
                command: format!("docker pull {image}"),
                exit_code: Some(if result.is_ok() { 0 } else { 1 }),
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: false,
            },
        );
        result.map_err(|e| BuildError::Failed {
            diagnostic: e.to_string(),
        })?;
        Ok(image.to_string())
    }
}

/// Keeps the last `max` bytes of a build log, where the error usually is.
fn tail(log: &str, max: usize) -> String {
    if log.len() <= max {
        return log.to_string();
    }
    let mut start = log.len() - max;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated]...{}", &log[start..])
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn build(
        &self,
        bundle: &TaskBundle,
        trace: &TraceHandle,
    ) -> Result<BuiltEnvironment, BuildError> {
        let started = Instant::now();
        let image = match &bundle.environment.source {
            BuildSource::Dockerfile(dockerfile) => {
                self.build_dockerfile(bundle, dockerfile, trace).await?
            }
            BuildSource::Image(image) => self.ensure_image(image, trace).await?,
            BuildSource::Command(_) => {
                return Err(BuildError::Failed {
                    diagnostic: "build_command environments require the local backend".to_string(),
                })
            }
        };

        Ok(BuiltEnvironment {
            key: bundle.build_key(),
            artifact: BuildArtifact::Image(image),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn release_build(&self, key: &BuildKey) {
        let tag = image_tag(key);
        if let Err(e) = self.client.remove_image(&tag).await {
            warn!(tag = %tag, error = %e, "Failed to remove partial image");
        }
    }

    async fn create(
        &self,
        bundle: &TaskBundle,
        built: &BuiltEnvironment,
        run_id: &str,
    ) -> Result<Arc<dyn Environment>, BuildError> {
        let BuildArtifact::Image(image) = &built.artifact else {
            return Err(BuildError::StartFailed(
                "docker backend received a non-image build".to_string(),
            ));
        };

        let network = bundle
            .environment
            .network
            .clone()
            .unwrap_or_else(|| self.network_mode.clone());
        let port = PortLease::acquire()
            .map_err(|e| BuildError::StartFailed(format!("cannot lease service port: {e}")))?;
        let config = ContainerConfig::new(container_name(run_id), image.clone())
            .with_cmd(vec!["sleep".to_string(), "infinity".to_string()])
            .with_working_dir(bundle.environment.workdir.clone())
            .with_limits(ExecutionLimits::from(&bundle.resources))
            .with_storage_quota(self.enforce_storage)
            .with_network_mode(network.clone())
            .with_env(PORT_VAR, port.port())
            .with_label(RUN_LABEL, run_id);

        let id = self
            .client
            .create_container(&config)
            .await
            .map_err(|e| BuildError::StartFailed(e.to_string()))?;
        let mut env = DockerEnvironment {
            client: self.client.clone(),
            id,
            workdir: bundle.environment.workdir.clone(),
            port,
            address: None,
            torn_down: AtomicBool::new(false),
        };

        if let Err(e) = self.client.start_container(&env.id).await {
            let _ = env.teardown().await;
            return Err(BuildError::StartFailed(e.to_string()));
        }
        if network != "host" {
            env.address = self.client.container_ip(&env.id).await;
            if env.address.is_none() {
                warn!(container = %env.id, network = %network, "Container has no address; probes dial declared hosts");
            }
        }
        let env = Arc::new(env);

        if let Some(start) = &bundle.environment.start {
            let options = ExecOptions::new(HELPER_TIMEOUT).with_env("FORGE_START", start);
            let launch = "mkdir -p /logs && (bash -c \"$FORGE_START\" >/logs/service.log 2>&1 </dev/null &)";
            match env.exec(launch, &options).await {
                Ok(result) if result.success() => {}
                Ok(result) => {
                    let _ = env.teardown().await;
                    return Err(BuildError::StartFailed(format!(
                        "service start exited with {}: {}",
                        result.exit_code,
                        truncate(&result.stderr, 2048)
                    )));
                }
                Err(e) => {
                    let _ = env.teardown().await;
                    return Err(BuildError::StartFailed(e.to_string()));
                }
            }
        }

        info!(
            run_id = %run_id,
            container = %env.id,
            address = env.address.as_deref().unwrap_or("host"),
            "Container started"
        );
        Ok(env)
    }
}

/// One run's container.
pub struct DockerEnvironment {
    client: DockerClient,
    id: String,
    workdir: String,
    port: PortLease,
    /// Container address on an isolated network; `None` in host mode.
    address: Option<String>,
    torn_down: AtomicBool,
}

impl DockerEnvironment {
    fn ensure_live(&self) -> Result<(), EnvironmentError> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(EnvironmentError::TornDown(self.id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(
        &self,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecResult, EnvironmentError> {
        self.ensure_live()?;
        let mut options = options.clone();
        if options.workdir.is_none() {
            options.workdir = Some(self.workdir.clone());
        }
        Ok(self.client.exec_command(&self.id, command, &options).await?)
    }

    fn service_port(&self) -> Option<u16> {
        Some(self.port.port())
    }

    fn dial_host(&self, host: &str) -> String {
        match &self.address {
            Some(address) if is_loopback(host) => address.clone(),
            _ => host.to_string(),
        }
    }

    async fn upload_dir(&self, host_dir: &Path, target: &str) -> Result<(), EnvironmentError> {
        self.ensure_live()?;
        let dir = host_dir.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || archive_dir(&dir, false))
            .await
            .map_err(|e| EnvironmentError::Process(e.to_string()))??;

        let mkdir = ExecOptions::new(HELPER_TIMEOUT).with_env("FORGE_TARGET", target);
        let result = self
            .client
            .exec_command(&self.id, "mkdir -p \"$FORGE_TARGET\"", &mkdir)
            .await?;
        if !result.success() {
            return Err(DockerError::CopyFailed(format!(
                "cannot create {target}: {}",
                result.stderr.trim()
            ))
            .into());
        }
        Ok(self.client.upload_tar(&self.id, target, archive).await?)
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>, EnvironmentError> {
        self.ensure_live()?;
        let options = ExecOptions::new(HELPER_TIMEOUT).with_env("FORGE_FILE", path);
        let script = format!("if [ -f \"$FORGE_FILE\" ]; then cat -- \"$FORGE_FILE\"; else exit {MISSING_FILE_EXIT}; fi");
        let result = self.client.exec_command(&self.id, &script, &options).await?;
        match result.exit_code {
            0 => Ok(Some(result.stdout)),
            MISSING_FILE_EXIT => Ok(None),
            code => Err(EnvironmentError::Process(format!(
                "reading {path} exited with {code}: {}",
                result.stderr.trim()
            ))),
        }
    }

    async fn sample_resources(&self) -> Option<ResourceSample> {
        if self.torn_down.load(Ordering::SeqCst) {
            return None;
        }
        self.client.stats(&self.id).await
    }

    async fn teardown(&self) -> Result<(), EnvironmentError> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client.remove_container(&self.id).await?;
        debug!(container = %self.id, "Container removed");
        Ok(())
    }
}
