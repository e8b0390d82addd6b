//! Decode/encode compressed image blobs and convert to/from model tensors.

use image::{ImageBuffer, Rgb, RgbImage};
use ndarray::Array4;
use thiserror::Error;

pub type ClassMap = ndarray::Array2<u16>;

/// Per-channel mean/std used to normalize pixels into a model's expected
/// float range. Default matches torchvision's ImageNet convention.
#[derive(Debug, Clone, Copy)]
pub struct ImageNetNorm {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for ImageNetNorm {
    fn default() -> Self {
        Self { mean: [0.485, 0.456, 0.406], std: [0.229, 0.224, 0.225] }
    }
}

/// A frame as accepted from a client: raw 8-bit RGB pixels plus the
/// client-supplied monotonic timestamp. Transient — discarded after
/// rendering.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp_ms: i64,
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame payload was empty")]
    EmptyPayload,
    #[error("frame payload could not be decoded as JPEG: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decoded image was not 3-channel 8-bit RGB")]
    UnsupportedPixelFormat,
    #[error("image shape {width}x{height} is not (H, W, 3) 8-bit")]
    InvalidShapeForEncode { width: u32, height: u32 },
    #[error("reply image failed to encode: {0}")]
    EncodeFailed(image::ImageError),
}

/// Strip a `data:` URI prefix if present; tolerate plain base64 otherwise.
pub fn strip_data_uri_prefix(s: &str) -> &str {
    match s.find(",") {
        Some(idx) if s.starts_with("data:") => &s[idx + 1..],
        _ => s,
    }
}

/// Decode a compressed (JPEG) image payload into a `Frame`.
pub fn decode(bytes: &[u8], timestamp_ms: i64) -> Result<Frame, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::EmptyPayload);
    }
    let dynamic = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)?;
    let rgb = match dynamic {
        image::DynamicImage::ImageRgb8(rgb) => rgb,
        other => {
            // Tolerate decoders that hand back a compatible color type
            // (e.g. grayscale JPEGs get promoted), but never a lossy
            // reinterpretation of channel count.
            if other.color().channel_count() != 3 {
                return Err(CodecError::UnsupportedPixelFormat);
            }
            other.to_rgb8()
        }
    };
    Ok(Frame { image: rgb, timestamp_ms })
}

/// JPEG-encode an 8-bit RGB image at the given quality (0-100).
pub fn encode(image: &RgbImage, quality: u8) -> Result<Vec<u8>, CodecError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(CodecError::InvalidShapeForEncode { width: image.width(), height: image.height() });
    }
    let mut out = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.min(100));
    encoder
        .encode(image.as_raw(), image.width(), image.height(), image::ColorType::Rgb8)
        .map_err(CodecError::EncodeFailed)?;
    Ok(out)
}

/// Resize `img` to `(target_w, target_h)`. Downscales with an area-average
/// box filter, upscales with bilinear interpolation (`image`'s `Triangle`
/// filter), chosen by comparing total pixel counts.
pub fn resize_for_model(img: &RgbImage, target_w: u32, target_h: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    if (w, h) == (target_w, target_h) {
        return img.clone();
    }
    let shrinking = (target_w as u64) * (target_h as u64) <= (w as u64) * (h as u64);
    if shrinking {
        area_average_resize(img, target_w, target_h)
    } else {
        image::imageops::resize(img, target_w, target_h, image::imageops::FilterType::Triangle)
    }
}

fn area_average_resize(img: &RgbImage, new_w: u32, new_h: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let mut out = ImageBuffer::new(new_w, new_h);
    let scale_x = w as f64 / new_w as f64;
    let scale_y = h as f64 / new_h as f64;
    for oy in 0..new_h {
        let y0 = (oy as f64 * scale_y).floor() as u32;
        let y1 = (((oy + 1) as f64 * scale_y).ceil() as u32).clamp(y0 + 1, h);
        for ox in 0..new_w {
            let x0 = (ox as f64 * scale_x).floor() as u32;
            let x1 = (((ox + 1) as f64 * scale_x).ceil() as u32).clamp(x0 + 1, w);
            let mut sum = [0u64; 3];
            let mut count = 0u64;
            for yy in y0..y1 {
                for xx in x0..x1 {
                    let p = img.get_pixel(xx, yy);
                    for c in 0..3 {
                        sum[c] += p.0[c] as u64;
                    }
                    count += 1;
                }
            }
            let count = count.max(1);
            out.put_pixel(
                ox,
                oy,
                Rgb([(sum[0] / count) as u8, (sum[1] / count) as u8, (sum[2] / count) as u8]),
            );
        }
    }
    out
}

/// Resize, float-normalize, and pack a frame into a `(1, 3, H, W)` tensor.
pub fn preprocess(
    frame: &Frame,
    target: (u32, u32),
    norm: ImageNetNorm,
) -> Result<Array4<f32>, CodecError> {
    let (target_w, target_h) = target;
    let resized = resize_for_model(&frame.image, target_w, target_h);

    let mut data = vec![0f32; 3 * target_h as usize * target_w as usize];
    let plane_len = (target_h * target_w) as usize;
    for y in 0..target_h {
        for x in 0..target_w {
            let p = resized.get_pixel(x, y);
            let idx = (y * target_w + x) as usize;
            for c in 0..3 {
                let v = p.0[c] as f32 / 255.0;
                data[c * plane_len + idx] = (v - norm.mean[c]) / norm.std[c];
            }
        }
    }
    Array4::from_shape_vec((1, 3, target_h as usize, target_w as usize), data)
        .map_err(|_| CodecError::UnsupportedPixelFormat)
}

/// Nearest-neighbor resize of a class map back to the original spatial
/// dimensions. Nearest-neighbor is required: interpolating between class
/// indices is meaningless.
pub fn postprocess(class_map: &ClassMap, original_size: (u32, u32)) -> ClassMap {
    let (orig_w, orig_h) = original_size;
    let (src_h, src_w) = class_map.dim();
    if (src_w as u32, src_h as u32) == (orig_w, orig_h) {
        return class_map.clone();
    }
    let mut out = ClassMap::zeros((orig_h as usize, orig_w as usize));
    let scale_x = src_w as f64 / orig_w as f64;
    let scale_y = src_h as f64 / orig_h as f64;
    for oy in 0..orig_h as usize {
        let sy = ((oy as f64 + 0.5) * scale_y).floor() as usize;
        let sy = sy.min(src_h.saturating_sub(1));
        for ox in 0..orig_w as usize {
            let sx = ((ox as f64 + 0.5) * scale_x).floor() as usize;
            let sx = sx.min(src_w.saturating_sub(1));
            out[(oy, ox)] = class_map[(sy, sx)];
        }
    }
    out
}
