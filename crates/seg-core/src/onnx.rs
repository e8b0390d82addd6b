//! ONNX-backed [`LoadedModel`] implementation and loader construction.
//!
//! One process-wide [`Environment`], one [`Session`] per loaded model,
//! `with_number_threads(1)` because the gateway parallelizes across
//! sessions rather than inside a single forward pass. [`ModelPool`] keeps
//! one [`Session`] alive per [`ModelMode`] for the life of the process, so
//! this wrapper needs interior mutability instead of `&mut self`:
//! `Session::run` takes `&mut self`, but [`LoadedModel::forward`] takes
//! `&self` so concurrent in-flight frames across sessions can share one
//! pooled model. A `std::sync::Mutex` serializes forward passes for a given
//! mode, on the assumption that the GPU driver already serializes per-call.

use std::sync::{Arc, Mutex};

use ndarray::{Array4, ArrayD};
use once_cell::sync::Lazy;
use onnxruntime::{
    environment::Environment,
    session::Session,
    GraphOptimizationLevel, LoggingLevel,
};
use tracing::{info, warn};

use crate::inference::ModelMode;
use crate::model_pool::{LoadedModel, ModelPoolError};

/// ONNX global environment, shared by every loaded model in the pool. Built
/// lazily on first use so a process that only ever serves `fast`/`balanced`
/// never pays initialization cost for a runtime it doesn't touch.
static ENVIRONMENT: Lazy<Environment> = Lazy::new(|| {
    #[cfg(debug_assertions)]
    const LOGGING_LEVEL: LoggingLevel = LoggingLevel::Verbose;
    #[cfg(not(debug_assertions))]
    const LOGGING_LEVEL: LoggingLevel = LoggingLevel::Warning;

    Environment::builder()
        .with_name("seg-gateway")
        .with_log_level(LOGGING_LEVEL)
        .build()
        .expect("failed to construct the process-wide ONNX environment")
});

/// A model artifact loaded for one `ModelMode`, ready to run forward passes.
pub struct OnnxModel {
    mode: ModelMode,
    session: Mutex<Session<'static>>,
}

impl OnnxModel {
    /// Loads the ONNX graph at `path` and builds a session pinned to a
    /// single intra-op thread. Blocking; callers run this inside
    /// `ModelPool::get`'s coalesced load path, never on a hot predict path.
    pub fn load(mode: ModelMode, path: &str) -> Result<Self, ModelPoolError> {
        info!(?mode, path, "loading ONNX model");
        let session = ENVIRONMENT
            .new_session_builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Extended))
            .and_then(|b| b.with_number_threads(1))
            .and_then(|b| b.with_model_from_file(path))
            .map_err(|e| ModelPoolError::LoadFailed(mode, e.to_string()))?;
        Ok(Self { mode, session: Mutex::new(session) })
    }
}

impl LoadedModel for OnnxModel {
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<ArrayD<f32>>, ModelPoolError> {
        let mut session = self.session.lock().expect("onnx session mutex poisoned");
        // onnxruntime-rs takes ownership of its inputs; the tensor is small
        // (one frame) so the clone here is not the bottleneck, the forward
        // pass is.
        let outputs = session
            .run::<f32, _, ndarray::IxDyn>(vec![input.clone().into_dyn()])
            .map_err(|e| classify_forward_error(self.mode, e))?;
        Ok(outputs.into_iter().map(|t| t.to_owned()).collect())
    }
}

fn classify_forward_error(mode: ModelMode, e: onnxruntime::OrtError) -> ModelPoolError {
    let msg = e.to_string();
    if msg.to_lowercase().contains("memory") {
        warn!(?mode, error = %msg, "ONNX forward pass exhausted memory");
    }
    ModelPoolError::ForwardFailed(msg)
}

/// Builds the `(ModelMode -> loader)` map the gateway hands to
/// [`crate::model_pool::ModelPool::new`]. A mode without a configured model
/// path is simply absent from the map, so `ModelPool::get` on it surfaces
/// `ModelPoolError::NoLoader` rather than a misleading load failure.
pub fn build_loaders(
    paths: impl IntoIterator<Item = (ModelMode, String)>,
) -> std::collections::HashMap<ModelMode, crate::model_pool::LoaderFn> {
    let mut loaders = std::collections::HashMap::new();
    for (mode, path) in paths {
        let path_for_closure = path.clone();
        let loader: crate::model_pool::LoaderFn = Arc::new(move || {
            OnnxModel::load(mode, &path_for_closure).map(|m| Arc::new(m) as Arc<dyn LoadedModel>)
        });
        loaders.insert(mode, loader);
    }
    loaders
}
