//! Environment provisioning.
//!
//! Turns a bundle into a live runtime context in two steps: a shared,
//! de-duplicated build bounded by the bundle's build timeout, then a
//! per-run `create` on the backend.

pub mod registry;

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::bundle::TaskBundle;
use crate::error::BuildError;
use crate::execution::{Backend, BuiltEnvironment, Environment};
use crate::metrics;
use crate::trace::{Stage, TraceHandle};

pub use registry::{BuildOutcome, BuildRegistry};

/// Builds environments through a backend, at most once per identity.
#[derive(Clone)]
pub struct Provisioner {
    backend: Arc<dyn Backend>,
    registry: Arc<BuildRegistry>,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<BuildRegistry>) -> Self {
        Self { backend, registry }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<BuildRegistry> {
        &self.registry
    }

    /// Returns the built environment for `bundle`, building it if needed.
    ///
    /// The build runs under `timeouts.build`; on expiry or failure the
    /// backend releases whatever the build left behind. The tool's
    /// diagnostic is copied verbatim into `trace`.
    pub async fn build(
        &self,
        bundle: &TaskBundle,
        trace: &TraceHandle,
    ) -> Result<BuiltEnvironment, BuildError> {
        let key = bundle.build_key();
        let backend = Arc::clone(&self.backend);
        let owned = bundle.clone();
        let build_trace = trace.clone();

        let outcome = self
            .registry
            .get_or_build(&key, move || async move {
                let key = owned.build_key();
                let timeout = owned.timeouts.build;
                let started = Instant::now();
                info!(key = %key, backend = backend.name(), "Build started");

                let result =
                    match tokio::time::timeout(timeout, backend.build(&owned, &build_trace)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(BuildError::Timeout(timeout)),
                    };

                let outcome = match &result {
                    Ok(_) => "success",
                    Err(BuildError::Timeout(_)) => "timeout",
                    Err(_) => "failure",
                };
                metrics::record_build(outcome);
                metrics::record_stage_duration("build", started.elapsed().as_secs_f64());

                if let Err(e) = &result {
                    warn!(key = %key, error = %e, "Build failed, releasing partial artifacts");
                    backend.release_build(&key).await;
                }
                result
            })
            .await;

        match &outcome.result {
            Ok(built) if !outcome.started => trace.diagnostic(
                Stage::Provision,
                format!("reusing build {} ({}ms)", built.key, built.duration_ms),
            ),
            Ok(_) => {}
            Err(e) => trace.diagnostic(Stage::Provision, e.to_string()),
        }
        outcome.result
    }

    /// Creates and starts a fresh context for one run.
    pub async fn create(
        &self,
        bundle: &TaskBundle,
        built: &BuiltEnvironment,
        run_id: &str,
    ) -> Result<Arc<dyn Environment>, BuildError> {
        self.backend.create(bundle, built, run_id).await
    }
}
