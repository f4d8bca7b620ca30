//! Docker API wrapper using the bollard crate.
//!
//! This module provides a high-level interface to the Docker operations the
//! harness needs: image builds and pulls, container lifecycle, command
//! execution with deadlines, file upload, and resource sampling.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StatsOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;

use crate::error::DockerError;
use crate::execution::resources::ExecutionLimits;
use crate::execution::{ExecOptions, ExecResult, ResourceSample};

/// Label attached to every container and image the harness creates.
pub const HARNESS_LABEL: &str = "forge-harness.managed";
/// Label carrying the owning run id.
pub const RUN_LABEL: &str = "forge-harness.run";

/// Extra time granted to the in-container `timeout` before the host gives up.
const HOST_GRACE: Duration = Duration::from_secs(5);

/// Wraps a command so the kernel kills it at the deadline even if the host
/// side stops listening. Falls back to plain bash when `timeout` is absent.
const DEADLINE_WRAPPER: &str = "if command -v timeout >/dev/null 2>&1; then exec timeout -s KILL \"$1\" bash -c \"$0\"; else exec bash -c \"$0\"; fi";

/// Configuration for creating a new container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Unique name for the container.
    pub name: String,
    /// Docker image to use.
    pub image: String,
    /// Command to run as PID 1.
    pub cmd: Option<Vec<String>>,
    /// Environment variables.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Resource limits for the container.
    pub limits: Option<ExecutionLimits>,
    /// Apply `limits.storage_mb` through `storage_opt`.
    pub enforce_storage: bool,
    /// Network mode (e.g., "none", "bridge", "host").
    pub network_mode: Option<String>,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    /// Creates a new container configuration with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let mut labels = HashMap::new();
        labels.insert(HARNESS_LABEL.to_string(), "true".to_string());
        Self {
            name: name.into(),
            image: image.into(),
            cmd: None,
            env: Vec::new(),
            working_dir: None,
            limits: None,
            enforce_storage: false,
            network_mode: Some("bridge".to_string()),
            labels,
        }
    }

    /// Sets explicit resource limits.
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Enables the root filesystem size limit.
    pub fn with_storage_quota(mut self, enforce: bool) -> Self {
        self.enforce_storage = enforce;
        self
    }

    /// Sets the command to run in the container.
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    /// Sets the network mode.
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Adds a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    fn host_config(&self) -> HostConfig {
        let mut host = HostConfig {
            network_mode: self.network_mode.clone(),
            ..Default::default()
        };
        if let Some(limits) = &self.limits {
            host.memory = Some(limits.memory_bytes());
            host.cpu_period = Some(limits.cpu_period());
            host.cpu_quota = Some(limits.cpu_quota());
            host.pids_limit = Some(limits.max_processes as i64);
            if self.enforce_storage {
                let mut opts = HashMap::new();
                opts.insert("size".to_string(), limits.storage_size());
                host.storage_opt = Some(opts);
            }
        }
        host
    }
}

/// Docker client wrapper for container operations.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Builds an image from a tar archive of the build context.
    ///
    /// Returns the build log. Dropping the future closes the connection,
    /// which makes the daemon cancel the build.
    pub async fn build_image(
        &self,
        tag: &str,
        dockerfile: &str,
        context_tar: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<String, DockerError> {
        let options = BuildImageOptions {
            dockerfile: dockerfile.to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            labels,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(context_tar.into()));
        let mut log = String::new();

        while let Some(chunk) = stream.next().await {
            let info = chunk.map_err(|e| DockerError::BuildFailed(format!("{log}{e}")))?;
            if let Some(line) = info.stream {
                log.push_str(&line);
            }
            if let Some(error) = info.error {
                log.push_str(&error);
                return Err(DockerError::BuildFailed(log));
            }
        }

        Ok(log)
    }

    /// Pulls a Docker image from a registry.
    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| DockerError::BuildFailed(format!("Failed to pull image: {e}")))?;
        }

        Ok(())
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Removes an image, ignoring "not found".
    pub async fn remove_image(&self, image: &str) -> Result<(), DockerError> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(image, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("No such image") => Ok(()),
            Err(e) => Err(DockerError::RunFailed(format!(
                "Failed to remove image {image}: {e}"
            ))),
        }
    }

    /// Creates a new container with the given configuration.
    ///
    /// # Returns
    ///
    /// The container ID on success.
    pub async fn create_container(&self, config: &ContainerConfig) -> Result<String, DockerError> {
        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: config.cmd.clone(),
            env: if config.env.is_empty() {
                None
            } else {
                Some(config.env.clone())
            },
            working_dir: config.working_dir.clone(),
            labels: Some(config.labels.clone()),
            host_config: Some(config.host_config()),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to create container: {e}")))?;

        Ok(response.id)
    }

    /// Starts a container by ID.
    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    /// Force-removes a container and its anonymous volumes.
    pub async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(DockerError::RunFailed(format!(
                "Failed to remove container: {e}"
            ))),
        }
    }

    /// Executes a shell command inside a running container under a deadline.
    ///
    /// The command runs as `bash -c <command>`, wrapped in `timeout -s KILL`
    /// when available; the host additionally stops waiting after the
    /// deadline plus a short grace period.
    pub async fn exec_command(
        &self,
        id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecResult, DockerError> {
        let secs = options.timeout.as_secs().max(1).to_string();
        let exec_options = CreateExecOptions {
            cmd: Some(vec![
                "bash".to_string(),
                "-c".to_string(),
                DEADLINE_WRAPPER.to_string(),
                command.to_string(),
                secs,
            ]),
            env: if options.env.is_empty() {
                None
            } else {
                Some(options.env.clone())
            },
            working_dir: options.workdir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to create exec: {e}")))?;

        let start = Instant::now();
        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to start exec: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        let collect = async {
            if let StartExecResults::Attached { mut output, .. } = start_result {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(DockerError::RunFailed(format!(
                                "Error reading output: {e}"
                            )));
                        }
                    }
                }
            }
            Ok(())
        };

        let host_timed_out = match tokio::time::timeout(options.timeout + HOST_GRACE, collect).await
        {
            Ok(result) => {
                result?;
                false
            }
            Err(_) => true,
        };
        let duration = start.elapsed();

        let exit_code = if host_timed_out {
            -1
        } else {
            self.docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| DockerError::RunFailed(format!("Failed to inspect exec: {e}")))?
                .exit_code
                .unwrap_or(-1)
        };

        // `timeout -s KILL` exits with 137 once the deadline is hit.
        let timed_out = host_timed_out || (exit_code == 137 && duration >= options.timeout);

        Ok(ExecResult {
            exit_code: if timed_out { -1 } else { exit_code },
            stdout,
            stderr,
            timed_out,
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Extracts a tar archive into `path` inside the container.
    pub async fn upload_tar(&self, id: &str, path: &str, tar: Vec<u8>) -> Result<(), DockerError> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), tar.into())
            .await
            .map_err(|e| DockerError::CopyFailed(e.to_string()))
    }

    /// Takes one resource reading of a container.
    pub async fn stats(&self, id: &str) -> Option<ResourceSample> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(id, Some(options));
        let stats = stream.next().await?.ok()?;

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
        let cpu_percent = if system_delta > 0 {
            Some(cpu_delta as f64 / system_delta as f64 * cpus * 100.0)
        } else {
            None
        };

        Some(ResourceSample {
            cpu_percent,
            memory_bytes: stats.memory_stats.usage,
        })
    }

    /// Address of a running container on its network, if it has one.
    pub async fn container_ip(&self, id: &str) -> Option<String> {
        let info = self
            .docker
            .inspect_container(id, None::<bollard::container::InspectContainerOptions>)
            .await
            .ok()?;
        let settings = info.network_settings?;
        settings
            .ip_address
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                settings.networks?.into_values().find_map(|endpoint| {
                    endpoint.ip_address.filter(|ip| !ip.is_empty())
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ResourceLimits;

    #[test]
    fn test_container_config_builder() {
        let limits = ExecutionLimits::from(&ResourceLimits {
            cpus: 2.0,
            memory_mb: 2048,
            storage_mb: 4096,
            extra: Default::default(),
        });
        let config = ContainerConfig::new("run-abc", "python:3.12-slim")
            .with_limits(limits)
            .with_cmd(vec!["sleep".to_string(), "infinity".to_string()])
            .with_working_dir("/app")
            .with_network_mode("none")
            .with_env("FORGE_PORT", 20001)
            .with_label(RUN_LABEL, "abc");

        assert_eq!(config.name, "run-abc");
        assert_eq!(config.cmd.as_ref().map(|c| c.len()), Some(2));
        assert_eq!(config.env, vec!["FORGE_PORT=20001".to_string()]);
        assert_eq!(config.labels.get(RUN_LABEL).map(String::as_str), Some("abc"));
        assert_eq!(
            config.labels.get(HARNESS_LABEL).map(String::as_str),
            Some("true")
        );

        let host = config.host_config();
        assert_eq!(host.memory, Some(2048 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(200_000));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert!(host.storage_opt.is_none());
    }

    #[test]
    fn test_storage_quota_opt_in() {
        let limits = ExecutionLimits::from(&ResourceLimits {
            cpus: 1.0,
            memory_mb: 512,
            storage_mb: 1024,
            extra: Default::default(),
        });
        let host = ContainerConfig::new("c", "alpine")
            .with_limits(limits)
            .with_storage_quota(true)
            .host_config();
        let opts = host.storage_opt.unwrap();
        assert_eq!(opts.get("size").map(String::as_str), Some("1024M"));
    }
}
