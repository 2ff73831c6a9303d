//! Lazily loaded model handles shared by every caller
//!
//! A [`LazyModel`] starts `Unloaded`. The first [`LazyModel::acquire`] starts a
//! load through the model's [`ModelBackend`]; callers arriving while it runs
//! await the same shared future instead of starting a second load. The load
//! ends in `Ready`, after which every caller gets the same handle, or in a
//! failure, which the [`FailurePolicy`] either records permanently or forgets
//! so the next caller tries again.

use crate::{
    error::{Result, VisionError},
    inference::ModelBackend,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use instant::Instant;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

type LoadResult<M> = std::result::Result<Arc<M>, Arc<VisionError>>;
type LoadFuture<M> = Shared<BoxFuture<'static, LoadResult<M>>>;

/// What a failed load leaves behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Remember the failure; later calls report unavailable without loading
    Sticky,
    /// Forget the failure; the next call starts a fresh load
    Retry,
}

/// Observable lifecycle state of a [`LazyModel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

enum LoadState<M: ?Sized> {
    Unloaded,
    Loading {
        generation: u64,
        future: LoadFuture<M>,
    },
    Ready(Arc<M>),
    Failed(Arc<VisionError>),
}

struct Inner<M: ?Sized> {
    state: LoadState<M>,
    /// Distinguishes loads so a stale completion cannot overwrite a reset
    generation: u64,
}

/// Single-flight, lazily loaded model handle
pub struct LazyModel<M: ?Sized + Send + Sync + 'static> {
    label: String,
    backend: Arc<dyn ModelBackend<M>>,
    policy: FailurePolicy,
    load_timeout: Option<Duration>,
    inner: Mutex<Inner<M>>,
    load_attempts: AtomicU32,
}

impl<M: ?Sized + Send + Sync + 'static> LazyModel<M> {
    pub fn new<S: Into<String>>(
        label: S,
        backend: Arc<dyn ModelBackend<M>>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            label: label.into(),
            backend,
            policy,
            load_timeout: None,
            inner: Mutex::new(Inner {
                state: LoadState::Unloaded,
                generation: 0,
            }),
            load_attempts: AtomicU32::new(0),
        }
    }

    /// Bound each load attempt; an expired load counts as a failed load
    #[must_use]
    pub fn with_load_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.load_timeout = timeout;
        self
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Number of loads started through the backend so far
    #[must_use]
    pub fn load_attempts(&self) -> u32 {
        self.load_attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status(&self) -> ModelStatus {
        match self.lock().state {
            LoadState::Unloaded => ModelStatus::Unloaded,
            LoadState::Loading { .. } => ModelStatus::Loading,
            LoadState::Ready(_) => ModelStatus::Ready,
            LoadState::Failed(_) => ModelStatus::Failed,
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status() == ModelStatus::Ready
    }

    /// Get the loaded model, loading it first if nobody has yet
    ///
    /// # Errors
    /// - `ModelUnavailable` when this load failed or timed out, or when an
    ///   earlier load failed under [`FailurePolicy::Sticky`]
    pub async fn acquire(&self) -> Result<Arc<M>> {
        let (generation, future) = {
            let mut inner = self.lock();
            if matches!(inner.state, LoadState::Unloaded) {
                inner.generation += 1;
                let generation = inner.generation;
                inner.state = LoadState::Loading {
                    generation,
                    future: self.start_load(),
                };
            }

            match &inner.state {
                LoadState::Ready(model) => return Ok(Arc::clone(model)),
                LoadState::Failed(error) => {
                    return Err(VisionError::model_unavailable(format!(
                        "{} previously failed to load: {}",
                        self.label, error
                    )));
                },
                LoadState::Loading { generation, future } => {
                    debug!(model = %self.label, generation, "Awaiting in-flight model load");
                    (*generation, future.clone())
                },
                LoadState::Unloaded => {
                    return Err(VisionError::internal(format!(
                        "{} left unloaded after starting a load",
                        self.label
                    )));
                },
            }
        };

        let outcome = future.await;
        self.settle(generation, &outcome);
        outcome.map_err(|error| {
            VisionError::model_unavailable(format!("{} failed to load: {}", self.label, error))
        })
    }

    /// Drop the loaded model so the next `acquire` loads again
    ///
    /// Also clears a sticky failure and abandons any in-flight load. Returns
    /// the model that was loaded, if any, so the caller can release it.
    pub fn reset(&self) -> Option<Arc<M>> {
        let mut inner = self.lock();
        match std::mem::replace(&mut inner.state, LoadState::Unloaded) {
            LoadState::Ready(model) => Some(model),
            _ => None,
        }
    }

    fn start_load(&self) -> LoadFuture<M> {
        let attempt = self.load_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let backend = Arc::clone(&self.backend);
        let label = self.label.clone();
        let load_timeout = self.load_timeout;

        async move {
            info!(model = %label, backend = backend.name(), attempt, "Loading model");
            let started = Instant::now();

            let loaded = with_timeout(load_timeout, &format!("load {label}"), backend.load()).await;

            match &loaded {
                Ok(_) => info!(
                    model = %label,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model ready"
                ),
                Err(error) => warn!(model = %label, error = %error, "Model load failed"),
            }
            loaded.map_err(Arc::new)
        }
        .boxed()
        .shared()
    }

    fn settle(&self, generation: u64, outcome: &LoadResult<M>) {
        let mut inner = self.lock();
        let still_current = matches!(
            &inner.state,
            LoadState::Loading { generation: current, .. } if *current == generation
        );
        if !still_current {
            return;
        }

        inner.state = match outcome {
            Ok(model) => LoadState::Ready(Arc::clone(model)),
            Err(error) => match self.policy {
                FailurePolicy::Sticky => LoadState::Failed(Arc::clone(error)),
                FailurePolicy::Retry => LoadState::Unloaded,
            },
        };
    }

    fn lock(&self) -> MutexGuard<'_, Inner<M>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Await `future`, failing with `Timeout` once `limit` elapses
pub(crate) async fn with_timeout<T, F>(limit: Option<Duration>, operation: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .unwrap_or_else(|_| Err(VisionError::timeout(operation, limit))),
        None => future.await,
    }
}

impl<M: ?Sized + Send + Sync + 'static> fmt::Debug for LazyModel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyModel")
            .field("label", &self.label)
            .field("backend", &self.backend.name())
            .field("policy", &self.policy)
            .field("status", &self.status())
            .field("load_attempts", &self.load_attempts())
            .finish()
    }
}
