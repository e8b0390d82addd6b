//! Synthetic frame and model fixtures for exercising the gateway end to end
//! without a webcam, a real photograph, or a GPU.
//!
//! Generates everything procedurally rather than shipping binary model or
//! image fixtures, since these tests need to run without downloading
//! artifacts.

use image::{ImageBuffer, Rgb, RgbImage};
use ndarray::{Array3, Array4, ArrayD};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use seg_core::inference::ModelMode;
use seg_core::model_pool::{LoadedModel, ModelPoolError};

/// A single flat-color frame, the simplest possible input.
pub fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
    ImageBuffer::from_fn(width, height, |_, _| Rgb(rgb))
}

/// A four-quadrant frame: top-left/top-right/bottom-left/bottom-right each
/// a distinct flat color. Pairs naturally with [`SyntheticModel`], whose
/// synthetic logits are quadrant-keyed, so a round trip through both
/// produces a class map with a predictable, assertable shape.
pub fn quadrant_frame(width: u32, height: u32, colors: [[u8; 3]; 4]) -> RgbImage {
    let (half_w, half_h) = (width / 2, height / 2);
    ImageBuffer::from_fn(width, height, |x, y| {
        let idx = match (x < half_w, y < half_h) {
            (true, true) => 0,
            (false, true) => 1,
            (true, false) => 2,
            (false, false) => 3,
        };
        Rgb(colors[idx])
    })
}

/// Deterministic pseudo-random noise, seeded so repeated calls with the
/// same seed produce byte-identical images (useful for reproducible load
/// tests without a real camera feed).
pub fn noise_frame(width: u32, height: u32, seed: u64) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    ImageBuffer::from_fn(width, height, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]))
}

/// JPEG-encodes a frame at the given quality, for feeding straight into the
/// wire protocol's base64-JPEG payload.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Vec<u8> {
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(image.as_raw(), image.width(), image.height(), image::ColorType::Rgb8)
        .expect("encoding a synthetic fixture image must not fail");
    out
}

/// A payload that decodes to nothing: exercises the `MALFORMED_FRAME` path
/// without needing a hand-crafted corrupt JPEG.
pub fn empty_payload() -> Vec<u8> {
    Vec::new()
}

/// A payload whose bytes are not a JPEG at all, for the "header doesn't
/// parse" edge of frame decoding.
pub fn garbage_payload() -> Vec<u8> {
    vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x02, 0x03]
}

/// A [`LoadedModel`] stand-in that never touches a GPU or an ONNX runtime.
/// Its forward pass is quadrant-keyed: class indices `0..4` map onto the
/// four quadrants of its output in a fixed pattern, regardless of the input
/// pixel values, so tests can assert on the resulting class map without
/// needing a trained network to agree with them.
///
/// Produces dense `(1, C, H, W)` logits for `fast`/`balanced`/`accurate`
/// and the two-tensor query-based shape for `sota`, matching whichever
/// decode contract [`ModelMode`] the fixture is built for.
pub struct SyntheticModel {
    mode: ModelMode,
}

impl SyntheticModel {
    pub fn new(mode: ModelMode) -> Self {
        Self { mode }
    }

    fn quadrant_class(&self, y: usize, x: usize, h: usize, w: usize) -> usize {
        match (x < w / 2, y < h / 2) {
            (true, true) => 1,
            (false, true) => 2,
            (true, false) => 3,
            (false, false) => 4,
        }
    }
}

impl LoadedModel for SyntheticModel {
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<ArrayD<f32>>, ModelPoolError> {
        let (_, _, h, w) = input.dim();
        let num_classes = self.mode.info().vocabulary.num_classes();

        match self.mode {
            ModelMode::Fast | ModelMode::Balanced | ModelMode::Accurate => {
                let mut logits = Array4::<f32>::zeros((1, num_classes, h, w));
                for y in 0..h {
                    for x in 0..w {
                        let class = self.quadrant_class(y, x, h, w).min(num_classes - 1);
                        logits[(0, class, y, x)] = 10.0;
                    }
                }
                Ok(vec![logits.into_dyn()])
            }
            ModelMode::Sota => {
                // 4 queries, one per quadrant class, plus the no-object sink.
                let num_queries = 4;
                let mut class_logits = Array3::<f32>::zeros((1, num_queries, num_classes + 1));
                for q in 0..num_queries {
                    let class = (q + 1).min(num_classes - 1);
                    class_logits[(0, q, class)] = 10.0;
                }
                let mut mask_logits = Array4::<f32>::zeros((1, num_queries, h, w));
                for y in 0..h {
                    for x in 0..w {
                        let class = self.quadrant_class(y, x, h, w);
                        let query = (class - 1).min(num_queries - 1);
                        mask_logits[(0, query, y, x)] = 10.0;
                    }
                }
                Ok(vec![class_logits.into_dyn(), mask_logits.into_dyn()])
            }
        }
    }
}

/// Convenience loader matching [`seg_core::model_pool::LoaderFn`]'s shape,
/// for wiring a `ModelPool` in a test without an ONNX artifact on disk.
pub fn synthetic_loader(mode: ModelMode) -> seg_core::model_pool::LoaderFn {
    std::sync::Arc::new(move || Ok(std::sync::Arc::new(SyntheticModel::new(mode)) as std::sync::Arc<dyn LoadedModel>))
}
