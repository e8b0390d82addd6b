//! Process-wide cache of loaded segmentation models, shared across sessions.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::inference::ModelMode;

/// A model session ready to run forward passes. Implemented by the real
/// ONNX-backed session in production and by a synthetic stub in tests.
pub trait LoadedModel: Send + Sync {
    /// Run one forward pass, returning per-class logits as `(1, C, H, W)`
    /// (or the SOTA head's raw outputs, handled upstream by the caller).
    fn forward(&self, input: &ndarray::Array4<f32>) -> Result<Vec<ndarray::ArrayD<f32>>, ModelPoolError>;
}

#[derive(Error, Debug)]
pub enum ModelPoolError {
    #[error("no loader registered for mode {0:?}")]
    NoLoader(ModelMode),
    #[error("model failed to load for mode {0:?}: {1}")]
    LoadFailed(ModelMode, String),
    #[error("forward pass failed: {0}")]
    ForwardFailed(String),
}

pub type LoaderFn = Arc<dyn Fn() -> Result<Arc<dyn LoadedModel>, ModelPoolError> + Send + Sync>;

/// Coalesced, lazily-populated cache: `get(mode)` blocks only the first
/// concurrent caller for a given mode; all others await the same load
/// future, and lookups for unrelated modes never contend with each other.
pub struct ModelPool {
    loaders: HashMap<ModelMode, LoaderFn>,
    cells: Mutex<HashMap<ModelMode, Arc<OnceCell<Arc<dyn LoadedModel>>>>>,
    warm: Mutex<std::collections::HashSet<ModelMode>>,
    warm_locks: Mutex<HashMap<ModelMode, Arc<Mutex<()>>>>,
}

impl ModelPool {
    pub fn new(loaders: HashMap<ModelMode, LoaderFn>) -> Self {
        Self {
            loaders,
            cells: Mutex::new(HashMap::new()),
            warm: Mutex::new(Default::default()),
            warm_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn cell_for(&self, mode: ModelMode) -> Arc<OnceCell<Arc<dyn LoadedModel>>> {
        let mut cells = self.cells.lock().await;
        cells.entry(mode).or_insert_with(|| Arc::new(OnceCell::new())).clone()
    }

    /// Returns the loaded model for `mode`, loading it on first call.
    /// Concurrent first-callers for the same mode share one load future.
    pub async fn get(&self, mode: ModelMode) -> Result<Arc<dyn LoadedModel>, ModelPoolError> {
        let cell = self.cell_for(mode).await;
        let loader = self.loaders.get(&mode).cloned().ok_or(ModelPoolError::NoLoader(mode))?;
        cell.get_or_try_init(|| async move {
            info!(?mode, "loading model");
            loader()
        })
        .await
        .cloned()
    }

    pub async fn is_warm(&self, mode: ModelMode) -> bool {
        self.warm.lock().await.contains(&mode)
    }

    pub async fn mark_warm(&self, mode: ModelMode) {
        debug!(?mode, "marking model warm");
        self.warm.lock().await.insert(mode);
    }

    async fn warm_lock_for(&self, mode: ModelMode) -> Arc<Mutex<()>> {
        let mut locks = self.warm_locks.lock().await;
        locks.entry(mode).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Serializes warm-up for `mode` across every session racing into it, so
    /// at most one sequence of forward passes ever runs per mode no matter
    /// how many sessions call `warm_up` at once: the first caller to take
    /// `mode`'s lock runs `run` and marks the mode warm; everyone else blocks
    /// on the same lock, then sees `is_warm` already true and returns without
    /// invoking `run` at all. `force` skips both the outer and the
    /// post-lock `is_warm` short-circuits, so the caller's `run` always
    /// executes (still one at a time per mode). The pool itself stays
    /// ignorant of how to run inference; `run` is supplied by the engine.
    pub async fn warm_up_coalesced<F, Fut>(&self, mode: ModelMode, force: bool, run: F) -> Result<(), ModelPoolError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), ModelPoolError>>,
    {
        if !force && self.is_warm(mode).await {
            return Ok(());
        }
        let lock = self.warm_lock_for(mode).await;
        let _guard = lock.lock().await;
        if !force && self.is_warm(mode).await {
            return Ok(());
        }
        run().await?;
        self.mark_warm(mode).await;
        Ok(())
    }

    /// Drops every loaded model and warm flag. Atomic with respect to
    /// `get`: a `get` in flight during `clear` either observes the old
    /// cell (and completes against the model it already started loading)
    /// or the new, empty one.
    pub async fn clear(&self) {
        let mut cells = self.cells.lock().await;
        cells.clear();
        drop(cells);
        self.warm.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubModel;
    impl LoadedModel for StubModel {
        fn forward(&self, _input: &ndarray::Array4<f32>) -> Result<Vec<ndarray::ArrayD<f32>>, ModelPoolError> {
            Ok(vec![])
        }
    }

    fn counting_loader(counter: Arc<AtomicUsize>) -> LoaderFn {
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubModel) as Arc<dyn LoadedModel>)
        })
    }

    #[tokio::test]
    async fn get_loads_once_across_concurrent_callers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut loaders: HashMap<ModelMode, LoaderFn> = HashMap::new();
        loaders.insert(ModelMode::Fast, counting_loader(counter.clone()));
        let pool = Arc::new(ModelPool::new(loaders));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.get(ModelMode::Fast).await.unwrap(); }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn warm_requires_loaded() {
        let pool = ModelPool::new(HashMap::new());
        assert!(!pool.is_warm(ModelMode::Fast).await);
        pool.mark_warm(ModelMode::Fast).await;
        assert!(pool.is_warm(ModelMode::Fast).await);
    }

    /// S1: two sessions racing into warm-up for the same mode must observe
    /// exactly one sequence of forward passes across the whole process, not
    /// one each.
    #[tokio::test]
    async fn warm_up_coalesced_runs_exactly_once_for_concurrent_callers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(ModelPool::new(HashMap::new()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                pool.warm_up_coalesced(ModelMode::Fast, false, || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1, "only the winning caller should run the warm-up sequence");
        assert!(pool.is_warm(ModelMode::Fast).await);
    }

    #[tokio::test]
    async fn warm_up_coalesced_skips_run_when_already_warm() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ModelPool::new(HashMap::new());
        pool.mark_warm(ModelMode::Fast).await;

        pool.warm_up_coalesced(ModelMode::Fast, false, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clear_resets_warm_and_cached_cells() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut loaders: HashMap<ModelMode, LoaderFn> = HashMap::new();
        loaders.insert(ModelMode::Fast, counting_loader(counter.clone()));
        let pool = ModelPool::new(loaders);

        pool.get(ModelMode::Fast).await.unwrap();
        pool.mark_warm(ModelMode::Fast).await;
        pool.clear().await;
        assert!(!pool.is_warm(ModelMode::Fast).await);

        pool.get(ModelMode::Fast).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2, "clear must force a fresh load");
    }

    #[tokio::test]
    async fn get_with_no_registered_loader_errors() {
        let pool = ModelPool::new(HashMap::new());
        assert!(matches!(pool.get(ModelMode::Sota).await, Err(ModelPoolError::NoLoader(ModelMode::Sota))));
    }
}
