//! Single-flight build registry.
//!
//! The only state shared between runs. Each bundle identity maps to one
//! shared build future; the build itself runs on its own task so that a
//! caller giving up (cancellation, dropped run) neither cancels the build
//! other callers are waiting on nor lets a second build start.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::bundle::BuildKey;
use crate::error::BuildError;
use crate::execution::BuiltEnvironment;

type BuildResult = Result<BuiltEnvironment, BuildError>;
type SharedBuild = Shared<BoxFuture<'static, BuildResult>>;

/// What a caller of [`BuildRegistry::get_or_build`] observed.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub result: BuildResult,
    /// True when this caller started the build, false when it joined one
    /// already in flight or reused a cached result.
    pub started: bool,
}

/// At-most-one build per [`BuildKey`].
#[derive(Default)]
pub struct BuildRegistry {
    builds: Mutex<HashMap<BuildKey, SharedBuild>>,
    started: AtomicUsize,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the build for `key`, spawning `build` only if no build for
    /// that identity is cached or in flight. Successful builds stay cached;
    /// failed builds are evicted so that a later call starts afresh.
    pub async fn get_or_build<F, Fut>(&self, key: &BuildKey, build: F) -> BuildOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BuildResult> + Send + 'static,
    {
        let (shared, started) = {
            let Ok(mut builds) = self.builds.lock() else {
                return BuildOutcome {
                    result: Err(BuildError::Failed {
                        diagnostic: "build registry lock poisoned".to_string(),
                    }),
                    started: false,
                };
            };
            match builds.get(key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    self.started.fetch_add(1, Ordering::SeqCst);
                    let task = tokio::spawn(build());
                    let shared = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(BuildError::Failed {
                                diagnostic: format!("build task aborted: {e}"),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    builds.insert(key.clone(), shared.clone());
                    (shared, true)
                }
            }
        };

        if !started {
            debug!(key = %key, "Joining existing build");
        }
        let result = shared.clone().await;

        if result.is_err() {
            if let Ok(mut builds) = self.builds.lock() {
                if builds.get(key).is_some_and(|current| current.ptr_eq(&shared)) {
                    builds.remove(key);
                }
            }
        }

        BuildOutcome { result, started }
    }

    /// Number of builds actually started over the registry's lifetime.
    pub fn builds_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Forgets a cached build so the next caller rebuilds.
    pub fn invalidate(&self, key: &BuildKey) {
        if let Ok(mut builds) = self.builds.lock() {
            builds.remove(key);
        }
    }
}
