//! Service readiness probing.
//!
//! Every declared [`ReadinessCheck`] runs its own poll loop; the loops are
//! fanned out concurrently and AND-combined, and the whole fan-out is
//! bounded by one global deadline. A check never retries beyond its own
//! loop, so one slow check cannot hold the others past the deadline.
//!
//! HTTP and TCP targets are written as seen from inside the context. They
//! may name the context's service port as `$FORGE_PORT`, and loopback hosts
//! are resolved through [`Environment::dial_host`] before dialing.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bundle::{Extra, ReadinessSpec};
use crate::error::ReadinessError;
use crate::execution::{expand_port, Environment, ExecOptions, PORT_VAR};
use crate::trace::{EventKind, Stage, TraceHandle};

/// Default poll interval when a check does not declare one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Port of a TCP readiness target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPort {
    Fixed(u16),
    /// The port leased to the context's service.
    Service,
}

impl std::fmt::Display for TargetPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetPort::Fixed(port) => write!(f, "{port}"),
            TargetPort::Service => write!(f, "${PORT_VAR}"),
        }
    }
}

/// What a readiness check probes and what counts as success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTarget {
    /// An HTTP GET answering with exactly `status`.
    Http { url: String, status: u16 },
    /// A TCP connect to `host:port` succeeding.
    Tcp { host: String, port: TargetPort },
    /// A command exiting 0 inside the runtime context.
    Command(String),
}

impl ProbeTarget {
    fn describe(&self) -> String {
        match self {
            ProbeTarget::Http { url, status } => format!("HTTP {} on {}", status, url),
            ProbeTarget::Tcp { host, port } => format!("TCP {}:{}", host, port),
            ProbeTarget::Command(cmd) => format!("command `{}`", cmd),
        }
    }
}

/// Rewrites an in-context URL into one the harness can dial.
fn dial_url(env: &dyn Environment, url: &str) -> Result<reqwest::Url, String> {
    let expanded = expand_port(url, env.service_port());
    let mut parsed =
        reqwest::Url::parse(&expanded).map_err(|e| format!("invalid URL {expanded}: {e}"))?;
    if let Some(host) = parsed.host_str().map(str::to_string) {
        let dial = env.dial_host(&host);
        if dial != host {
            parsed
                .set_host(Some(&dial))
                .map_err(|e| format!("cannot dial {dial}: {e}"))?;
        }
    }
    Ok(parsed)
}

/// A declarative, stateless probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCheck {
    pub name: String,
    pub target: ProbeTarget,
    pub interval: Duration,
    pub extra: Extra,
}

impl ReadinessCheck {
    pub fn new(name: impl Into<String>, target: ProbeTarget) -> Self {
        Self {
            name: name.into(),
            target,
            interval: DEFAULT_POLL_INTERVAL,
            extra: Extra::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Upper bound for a single probe attempt.
    fn attempt_timeout(&self) -> Duration {
        self.interval
            .max(Duration::from_secs(1))
            .min(Duration::from_secs(5))
    }
}

/// How one check became ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReadiness {
    pub name: String,
    pub attempts: u32,
    pub ready_after_ms: u64,
}

/// Result of a successful readiness wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub checks: Vec<CheckReadiness>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Default, Clone)]
struct ProbeState {
    attempts: u32,
    ready_after: Option<Duration>,
    last_error: Option<String>,
}

/// Polls readiness checks against a runtime context.
#[derive(Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
}

impl Default for ReadinessProber {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessProber {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Waits until every check passes or the readiness deadline elapses.
    pub async fn wait_ready(
        &self,
        env: &dyn Environment,
        spec: &ReadinessSpec,
        trace: &TraceHandle,
    ) -> Result<ReadinessReport, ReadinessError> {
        let start = Instant::now();
        if spec.checks.is_empty() {
            debug!("No readiness checks declared, context is ready");
            return Ok(ReadinessReport {
                checks: Vec::new(),
                elapsed_ms: 0,
            });
        }

        let states: Vec<Mutex<ProbeState>> = spec
            .checks
            .iter()
            .map(|_| Mutex::new(ProbeState::default()))
            .collect();

        let loops = spec
            .checks
            .iter()
            .zip(states.iter())
            .map(|(check, state)| self.poll_until_ready(env, check, state, start, trace));

        let outcome = tokio::time::timeout(spec.deadline, join_all(loops)).await;
        let snapshot: Vec<ProbeState> = states
            .iter()
            .map(|s| s.lock().map(|g| g.clone()).unwrap_or_default())
            .collect();

        match outcome {
            Ok(_) => {
                let elapsed = start.elapsed();
                info!(
                    checks = spec.checks.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "All readiness checks passed"
                );
                Ok(ReadinessReport {
                    checks: spec
                        .checks
                        .iter()
                        .zip(snapshot)
                        .map(|(check, state)| CheckReadiness {
                            name: check.name.clone(),
                            attempts: state.attempts,
                            ready_after_ms: state
                                .ready_after
                                .map(|d| d.as_millis() as u64)
                                .unwrap_or_default(),
                        })
                        .collect(),
                    elapsed_ms: elapsed.as_millis() as u64,
                })
            }
            Err(_) => {
                let mut pending = Vec::new();
                for (check, state) in spec.checks.iter().zip(snapshot) {
                    if state.ready_after.is_some() {
                        continue;
                    }
                    let detail = state
                        .last_error
                        .unwrap_or_else(|| "no attempt completed".to_string());
                    trace.record(
                        Stage::Readiness,
                        EventKind::Diagnostic {
                            message: format!(
                                "check '{}' ({}) never passed after {} attempt(s): {}",
                                check.name,
                                check.target.describe(),
                                state.attempts,
                                detail
                            ),
                        },
                    );
                    pending.push(check.name.clone());
                }
                warn!(
                    deadline_secs = spec.deadline.as_secs(),
                    pending = %pending.join(","),
                    "Readiness deadline elapsed"
                );
                Err(ReadinessError::Timeout {
                    deadline: spec.deadline,
                    pending,
                })
            }
        }
    }

    async fn poll_until_ready(
        &self,
        env: &dyn Environment,
        check: &ReadinessCheck,
        state: &Mutex<ProbeState>,
        start: Instant,
        trace: &TraceHandle,
    ) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.probe_once(env, check).await;
            let ready = result.is_ok();
            trace.record(
                Stage::Readiness,
                EventKind::ReadinessProbe {
                    check: check.name.clone(),
                    attempt,
                    ready,
                    detail: result.as_ref().err().cloned(),
                },
            );
            if let Ok(mut s) = state.lock() {
                s.attempts = attempt;
                match &result {
                    Ok(()) => s.ready_after = Some(start.elapsed()),
                    Err(e) => s.last_error = Some(e.clone()),
                }
            }
            if ready {
                debug!(check = %check.name, attempt, "Readiness check passed");
                return;
            }
            tokio::time::sleep(check.interval).await;
        }
    }

    async fn probe_once(&self, env: &dyn Environment, check: &ReadinessCheck) -> Result<(), String> {
        let limit = check.attempt_timeout();
        match &check.target {
            ProbeTarget::Http { url, status } => {
                let url = dial_url(env, url)?;
                let response = self
                    .client
                    .get(url)
                    .timeout(limit)
                    .send()
                    .await
                    .map_err(|e| format!("request failed: {e}"))?;
                let got = response.status().as_u16();
                if got == *status {
                    Ok(())
                } else {
                    Err(format!("expected status {status}, got {got}"))
                }
            }
            ProbeTarget::Tcp { host, port } => {
                let port = match port {
                    TargetPort::Fixed(port) => *port,
                    TargetPort::Service => env
                        .service_port()
                        .ok_or_else(|| "context has no service port".to_string())?,
                };
                let host = env.dial_host(host);
                match tokio::time::timeout(
                    limit,
                    tokio::net::TcpStream::connect((host.as_str(), port)),
                )
                .await
                {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(format!("connect failed: {e}")),
                    Err(_) => Err(format!("connect timed out after {}ms", limit.as_millis())),
                }
            }
            ProbeTarget::Command(cmd) => {
                let result = env
                    .exec(cmd, &ExecOptions::new(limit))
                    .await
                    .map_err(|e| format!("exec failed: {e}"))?;
                if result.timed_out {
                    Err(format!("timed out after {}ms", limit.as_millis()))
                } else if result.exit_code == 0 {
                    Ok(())
                } else {
                    Err(format!("exit code {}", result.exit_code))
                }
            }
        }
    }
}
