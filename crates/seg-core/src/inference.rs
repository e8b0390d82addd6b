//! Per-session adapter over a pooled model: mode switching, warm-up, and the
//! mode-specific decode from raw logits to a class map.

use std::sync::Arc;

use ndarray::{Array2, Array3, Array4, ArrayD};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{self, ClassMap, Frame, ImageNetNorm};
use crate::colormap::ClassVocabulary;
use crate::model_pool::{LoadedModel, ModelPool, ModelPoolError};
use crate::stats::RollingStats;

/// Closed set of quality/speed presets. Each is statically wired to a model
/// artifact, an input spatial size, and a class vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelMode {
    Fast,
    Balanced,
    Accurate,
    Sota,
}

/// Static facts about a `ModelMode`, looked up once per mode rather than
/// carried on every `SessionState`.
#[derive(Debug, Clone, Copy)]
pub struct ModelModeInfo {
    pub model_id: &'static str,
    pub input_size: (u32, u32),
    pub vocabulary: ClassVocabulary,
    pub expected_fps: f32,
    pub expected_memory_mb: u32,
}

impl ModelMode {
    pub const ALL: [ModelMode; 4] = [ModelMode::Fast, ModelMode::Balanced, ModelMode::Accurate, ModelMode::Sota];

    pub fn info(self) -> ModelModeInfo {
        match self {
            ModelMode::Fast => ModelModeInfo {
                model_id: "fast-fcn-coco21",
                input_size: (320, 240),
                vocabulary: ClassVocabulary::Coco21,
                expected_fps: 30.0,
                expected_memory_mb: 200,
            },
            ModelMode::Balanced => ModelModeInfo {
                model_id: "balanced-fcn-coco21",
                input_size: (512, 384),
                vocabulary: ClassVocabulary::Coco21,
                expected_fps: 15.0,
                expected_memory_mb: 400,
            },
            ModelMode::Accurate => ModelModeInfo {
                model_id: "accurate-deeplab-ade150",
                input_size: (640, 480),
                vocabulary: ClassVocabulary::Ade150,
                expected_fps: 7.0,
                expected_memory_mb: 900,
            },
            ModelMode::Sota => ModelModeInfo {
                model_id: "sota-query-ade150",
                input_size: (768, 576),
                vocabulary: ClassVocabulary::Ade150,
                expected_fps: 3.0,
                expected_memory_mb: 2200,
            },
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "fast" => Some(Self::Fast),
            "balanced" => Some(Self::Balanced),
            "accurate" => Some(Self::Accurate),
            "sota" => Some(Self::Sota),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Accurate => "accurate",
            Self::Sota => "sota",
        }
    }
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("mode pool error: {0}")]
    Pool(#[from] ModelPoolError),
    #[error("codec error: {0}")]
    Codec(#[from] codec::CodecError),
    #[error("model produced an unexpected output shape for mode {mode:?}: {detail}")]
    UnexpectedOutputShape { mode: ModelMode, detail: String },
    #[error("out of memory running mode {0:?}")]
    OutOfMemory(ModelMode),
}

#[derive(Debug, Clone, Copy)]
pub struct PredictMeta {
    pub latency_ms: f32,
    pub mode: ModelMode,
}

/// Per-session adapter over the shared `ModelPool`. Cheaply `Clone`able
/// (an `Arc` of its real state) so `predict` can run concurrently for up to
/// `P_max` in-flight frames without serializing on a single `&mut self` —
/// only the brief mode swap and stats update take a lock, never the
/// forward pass itself.
#[derive(Clone)]
pub struct InferenceEngine {
    inner: Arc<EngineState>,
}

struct EngineState {
    pool: Arc<ModelPool>,
    mode: std::sync::Mutex<ModelMode>,
    model: tokio::sync::Mutex<Option<Arc<dyn LoadedModel>>>,
    warm_up_iterations: usize,
    stats: std::sync::Mutex<RollingStats>,
}

impl InferenceEngine {
    pub fn new(pool: Arc<ModelPool>, initial_mode: ModelMode, warm_up_iterations: usize) -> Self {
        Self {
            inner: Arc::new(EngineState {
                pool,
                mode: std::sync::Mutex::new(initial_mode),
                model: tokio::sync::Mutex::new(None),
                warm_up_iterations,
                stats: std::sync::Mutex::new(RollingStats::new()),
            }),
        }
    }

    pub fn mode(&self) -> ModelMode {
        *self.inner.mode.lock().expect("mode mutex poisoned")
    }

    pub fn stats(&self) -> RollingStats {
        *self.inner.stats.lock().expect("stats mutex poisoned")
    }

    /// Switches the active mode, loading the target model from the pool if
    /// it differs from the current one. A no-op model swap when unchanged.
    pub async fn set_mode(&self, mode: ModelMode) -> Result<(), InferenceError> {
        let mut model_guard = self.inner.model.lock().await;
        if mode == self.mode() && model_guard.is_some() {
            return Ok(());
        }
        debug!(?mode, previous = ?self.mode(), "switching model mode");
        let model = self.inner.pool.get(mode).await?;
        *self.inner.mode.lock().expect("mode mutex poisoned") = mode;
        *model_guard = Some(model);
        Ok(())
    }

    /// Runs `warm_up_iterations` synthetic forward passes unless the pool
    /// already has this mode marked warm, then marks it warm. `force`
    /// bypasses the already-warm short circuit. Coalesced at the pool level:
    /// concurrent sessions warming up the same mode run the forward-pass
    /// sequence exactly once between them, never once per session.
    pub async fn warm_up(&self, force: bool) -> Result<(), InferenceError> {
        let mode = self.mode();
        if !force && self.inner.pool.is_warm(mode).await {
            return Ok(());
        }
        let model = self.loaded_model().await?;
        let (w, h) = mode.info().input_size;
        let iterations = self.inner.warm_up_iterations;
        self.inner
            .pool
            .warm_up_coalesced(mode, force, move || async move {
                let synthetic = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
                for i in 0..iterations {
                    debug!(?mode, iteration = i, "warm-up forward pass");
                    model.forward(&synthetic)?;
                }
                Ok(())
            })
            .await
            .map_err(InferenceError::Pool)
    }

    async fn loaded_model(&self) -> Result<Arc<dyn LoadedModel>, InferenceError> {
        let mut guard = self.inner.model.lock().await;
        if guard.is_none() {
            *guard = Some(self.inner.pool.get(self.mode()).await?);
        }
        Ok(guard.clone().expect("just populated above"))
    }

    /// Full predict path: preprocess, forward through the pooled model,
    /// mode-specific decode, resize back to the original frame size, and
    /// fold the latency into this session's rolling stats. Safe to call
    /// concurrently from multiple in-flight frames.
    pub async fn predict(&self, frame: &Frame) -> Result<(ClassMap, PredictMeta), InferenceError> {
        let started = std::time::Instant::now();
        let mode = self.mode();
        let model = self.loaded_model().await?;

        let info = mode.info();
        let tensor = codec::preprocess(frame, info.input_size, ImageNetNorm::default())?;
        let outputs = model.forward(&tensor).map_err(InferenceError::Pool)?;

        let class_map = decode_for_mode(mode, &outputs)?;
        let original_size = (frame.image.width(), frame.image.height());
        let resized = codec::postprocess(&class_map, original_size);

        let latency_ms = started.elapsed().as_secs_f32() * 1000.0;
        self.inner.stats.lock().expect("stats mutex poisoned").record_frame(latency_ms, frame.timestamp_ms);
        Ok((resized, PredictMeta { latency_ms, mode }))
    }
}

fn decode_for_mode(mode: ModelMode, outputs: &[ArrayD<f32>]) -> Result<ClassMap, InferenceError> {
    match mode {
        ModelMode::Fast | ModelMode::Balanced => decode_dense_logits(mode, outputs),
        ModelMode::Accurate => decode_dense_logits(mode, outputs),
        ModelMode::Sota => decode_query_based(mode, outputs),
    }
}

/// `fast`/`balanced`/`accurate`: a single `(1, C, H, W)` logits tensor,
/// argmax over the class axis. `accurate`'s logits are emitted at the
/// model's internal stride and must already be upsampled to the input size
/// by the caller's model wrapper before reaching here.
fn decode_dense_logits(mode: ModelMode, outputs: &[ArrayD<f32>]) -> Result<ClassMap, InferenceError> {
    let logits = outputs.first().ok_or_else(|| InferenceError::UnexpectedOutputShape {
        mode,
        detail: "expected at least one output tensor".into(),
    })?;
    let logits: Array4<f32> = logits
        .clone()
        .into_dimensionality()
        .map_err(|e| InferenceError::UnexpectedOutputShape { mode, detail: e.to_string() })?;
    let (_, _c, h, w) = logits.dim();
    let mut class_map = ClassMap::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let column = logits.slice(ndarray::s![0, .., y, x]);
            class_map[(y, x)] = argmax(column.iter().copied()) as u16;
        }
    }
    Ok(class_map)
}

/// `sota`: a query-based head. `outputs[0]` is class logits `(1, Q, C+1)`
/// (last column is the no-object slot), `outputs[1]` is mask logits
/// `(1, Q, H, W)` at the model's internal resolution, already upsampled to
/// the input size by the caller's model wrapper. Class probabilities are
/// softmaxed and the no-object column is sliced away *before* multiplying
/// into the per-pixel scores, never masked out after argmax — applying the
/// no-object mass post-hoc would let it silently win ties it was never
/// meant to contest.
fn decode_query_based(mode: ModelMode, outputs: &[ArrayD<f32>]) -> Result<ClassMap, InferenceError> {
    let class_logits = outputs.get(0).ok_or_else(|| InferenceError::UnexpectedOutputShape {
        mode,
        detail: "missing class logits output".into(),
    })?;
    let mask_logits = outputs.get(1).ok_or_else(|| InferenceError::UnexpectedOutputShape {
        mode,
        detail: "missing mask logits output".into(),
    })?;

    let class_logits: Array3<f32> = class_logits
        .clone()
        .into_dimensionality()
        .map_err(|e| InferenceError::UnexpectedOutputShape { mode, detail: e.to_string() })?;
    let mask_logits: Array4<f32> = mask_logits
        .clone()
        .into_dimensionality()
        .map_err(|e| InferenceError::UnexpectedOutputShape { mode, detail: e.to_string() })?;

    let (_, num_queries, num_classes_plus_one) = class_logits.dim();
    let (_, mask_queries, h, w) = mask_logits.dim();
    if num_queries != mask_queries {
        return Err(InferenceError::UnexpectedOutputShape {
            mode,
            detail: format!("class query count {num_queries} != mask query count {mask_queries}"),
        });
    }
    let num_classes = num_classes_plus_one - 1;

    let mut class_probs = Array2::<f32>::zeros((num_queries, num_classes));
    for q in 0..num_queries {
        let row = class_logits.slice(ndarray::s![0, q, ..]);
        let probs = softmax(row.iter().copied());
        for c in 0..num_classes {
            class_probs[(q, c)] = probs[c];
        }
    }

    let mut mask_sigmoid = Array3::<f32>::zeros((num_queries, h, w));
    for q in 0..num_queries {
        for y in 0..h {
            for x in 0..w {
                mask_sigmoid[(q, y, x)] = sigmoid(mask_logits[(0, q, y, x)]);
            }
        }
    }

    let mut class_map = ClassMap::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let mut best_class = 0usize;
            let mut best_score = f32::MIN;
            for c in 0..num_classes {
                let mut score = 0.0f32;
                for q in 0..num_queries {
                    score += class_probs[(q, c)] * mask_sigmoid[(q, y, x)];
                }
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            class_map[(y, x)] = best_class as u16;
        }
    }
    Ok(class_map)
}

fn argmax(values: impl Iterator<Item = f32>) -> usize {
    values
        .enumerate()
        .fold((0usize, f32::MIN), |(bi, bv), (i, v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}

fn softmax(values: impl Iterator<Item = f32>) -> Vec<f32> {
    let values: Vec<f32> = values.collect();
    let max = values.iter().copied().fold(f32::MIN, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn mode_wire_names_round_trip() {
        for mode in ModelMode::ALL {
            assert_eq!(ModelMode::from_wire_name(mode.wire_name()), Some(mode));
        }
        assert_eq!(ModelMode::from_wire_name("bogus"), None);
    }

    #[test]
    fn fast_and_balanced_use_coco21_accurate_and_sota_use_ade150() {
        assert_eq!(ModelMode::Fast.info().vocabulary, ClassVocabulary::Coco21);
        assert_eq!(ModelMode::Balanced.info().vocabulary, ClassVocabulary::Coco21);
        assert_eq!(ModelMode::Accurate.info().vocabulary, ClassVocabulary::Ade150);
        assert_eq!(ModelMode::Sota.info().vocabulary, ClassVocabulary::Ade150);
    }

    #[test]
    fn dense_decode_picks_the_highest_logit_channel() {
        let mut logits = Array4::<f32>::zeros((1, 3, 2, 2));
        logits[(0, 2, 0, 0)] = 10.0;
        logits[(0, 0, 0, 0)] = 1.0;
        logits[(0, 1, 1, 1)] = 5.0;
        let out = decode_dense_logits(ModelMode::Fast, &[logits.into_dyn()]).unwrap();
        assert_eq!(out[(0, 0)], 2);
        assert_eq!(out[(1, 1)], 1);
    }

    #[test]
    fn query_based_decode_favors_class_with_dominant_mask_and_probability() {
        // 2 queries, 2 real classes + no-object, 1x1 spatial grid.
        let mut class_logits = Array3::<f32>::zeros((1, 2, 3));
        // query 0 strongly prefers class 0, query 1 strongly prefers no-object.
        class_logits[(0, 0, 0)] = 10.0;
        class_logits[(0, 1, 2)] = 10.0;

        let mut mask_logits = Array4::<f32>::zeros((1, 2, 1, 1));
        mask_logits[(0, 0, 0, 0)] = 10.0; // query 0 covers this pixel strongly
        mask_logits[(0, 1, 0, 0)] = 10.0; // query 1 also covers it, but it's no-object

        let out = decode_query_based(
            ModelMode::Sota,
            &[class_logits.into_dyn(), mask_logits.into_dyn()],
        )
        .unwrap();
        assert_eq!(out[(0, 0)], 0, "no-object mass must be sliced away before scoring, not after argmax");
    }

    #[test]
    fn query_count_mismatch_is_rejected() {
        let class_logits = Array3::<f32>::zeros((1, 3, 4));
        let mask_logits = Array4::<f32>::zeros((1, 2, 1, 1));
        assert!(decode_query_based(ModelMode::Sota, &[class_logits.into_dyn(), mask_logits.into_dyn()]).is_err());
    }

    #[test]
    fn softmax_sums_to_one() {
        let out = softmax([1.0, 2.0, 3.0].into_iter());
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn argmax_on_empty_defaults_to_zero() {
        assert_eq!(argmax(std::iter::empty()), 0);
    }

    #[test]
    fn sigmoid_bounds() {
        assert!(sigmoid(-100.0) < 0.001);
        assert!(sigmoid(100.0) > 0.999);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn array_sanity_for_shape_helper() {
        let a = Array::<f32, _>::zeros((2, 2));
        assert_eq!(a.dim(), (2, 2));
    }

    /// End-to-end through `ModelPool` + `InferenceEngine` with the SOTA
    /// decode path, mirroring scenario S6: a synthetic model with no GPU
    /// involved still produces a class map in-range, in shape, over the
    /// `ade150` vocabulary.
    #[tokio::test]
    async fn predict_on_sota_mode_returns_a_well_formed_class_map() {
        use seg_test_media::{quadrant_frame, synthetic_loader};
        use std::collections::HashMap;

        let mut loaders: HashMap<ModelMode, crate::model_pool::LoaderFn> = HashMap::new();
        loaders.insert(ModelMode::Sota, synthetic_loader(ModelMode::Sota));
        let pool = Arc::new(ModelPool::new(loaders));
        let engine = InferenceEngine::new(pool, ModelMode::Sota, 3);

        let image = quadrant_frame(320, 320, [[10, 10, 10], [20, 20, 20], [30, 30, 30], [40, 40, 40]]);
        let frame = crate::codec::Frame { image, timestamp_ms: 0 };

        let (class_map, meta) = engine.predict(&frame).await.unwrap();
        assert_eq!(class_map.dim(), (320, 320));
        assert_eq!(meta.mode, ModelMode::Sota);
        let vocab_size = ModelMode::Sota.info().vocabulary.num_classes();
        assert!(class_map.iter().all(|&c| (c as usize) < vocab_size));
    }

    /// S1: two sessions defaulting to the same mode and calling `warm_up`
    /// concurrently must produce exactly one sequence of forward passes
    /// across the process, never two.
    #[tokio::test]
    async fn concurrent_warm_up_across_two_engines_runs_the_forward_sequence_once() {
        use std::collections::HashMap;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingModel(Arc<AtomicUsize>);
        impl LoadedModel for CountingModel {
            fn forward(&self, _input: &Array4<f32>) -> Result<Vec<ArrayD<f32>>, ModelPoolError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(vec![Array4::<f32>::zeros((1, ModelMode::Balanced.info().vocabulary.num_classes(), 1, 1)).into_dyn()])
            }
        }

        let forward_calls = Arc::new(AtomicUsize::new(0));
        let loader_calls = forward_calls.clone();
        let mut loaders: HashMap<ModelMode, crate::model_pool::LoaderFn> = HashMap::new();
        loaders.insert(
            ModelMode::Balanced,
            Arc::new(move || Ok(Arc::new(CountingModel(loader_calls.clone())) as Arc<dyn LoadedModel>)),
        );
        let pool = Arc::new(ModelPool::new(loaders));

        let a = InferenceEngine::new(pool.clone(), ModelMode::Balanced, 3);
        let b = InferenceEngine::new(pool.clone(), ModelMode::Balanced, 3);

        let (ra, rb) = tokio::join!(a.warm_up(false), b.warm_up(false));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(forward_calls.load(Ordering::SeqCst), 3, "exactly one session's 3 warm-up passes, not 6");
        assert!(pool.is_warm(ModelMode::Balanced).await);
    }

    #[tokio::test]
    async fn warm_up_is_a_no_op_on_the_second_session_for_an_already_warm_mode() {
        use seg_test_media::synthetic_loader;
        use std::collections::HashMap;

        let mut loaders: HashMap<ModelMode, crate::model_pool::LoaderFn> = HashMap::new();
        loaders.insert(ModelMode::Fast, synthetic_loader(ModelMode::Fast));
        let pool = Arc::new(ModelPool::new(loaders));

        let first = InferenceEngine::new(pool.clone(), ModelMode::Fast, 3);
        first.set_mode(ModelMode::Fast).await.unwrap();
        first.warm_up(false).await.unwrap();
        assert!(pool.is_warm(ModelMode::Fast).await);

        let second = InferenceEngine::new(pool.clone(), ModelMode::Fast, 3);
        second.set_mode(ModelMode::Fast).await.unwrap();
        // Does not panic or reload; is_warm short-circuits the synthetic forward passes.
        second.warm_up(false).await.unwrap();
    }
}
