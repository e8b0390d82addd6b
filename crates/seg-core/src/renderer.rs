//! Compose an original frame and a class map into a displayable image.

use crate::colormap::ClassVocabulary;
use image::{Rgb, RgbImage};
use thiserror::Error;

/// Class-index predicate used to suppress the overlay for uninteresting
/// classes without ever touching the underlying class map.
pub type ClassFilter = Option<Vec<bool>>;

fn passes(filter: &ClassFilter, class: u16) -> bool {
    match filter {
        None => true,
        Some(mask) => mask.get(class as usize).copied().unwrap_or(false),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VizMode {
    Filled,
    Contour,
    SideBySide,
    Blend,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("class map dims {cm_w}x{cm_h} do not match image dims {img_w}x{img_h}")]
    DimensionMismatch { img_w: u32, img_h: u32, cm_w: u32, cm_h: u32 },
}

/// Render `image` overlaid with `class_map` per `mode`. `opacity` is ignored
/// by `contour` and `side_by_side`. Out-of-range opacity is silently
/// clamped to `[0, 1]` rather than rejected.
pub fn render(
    image: &RgbImage,
    class_map: &ndarray::Array2<u16>,
    vocab: ClassVocabulary,
    mode: VizMode,
    opacity: f32,
    filter: &ClassFilter,
) -> Result<RgbImage, RenderError> {
    let opacity = opacity.clamp(0.0, 1.0);
    let (w, h) = image.dimensions();
    let (cm_h, cm_w) = class_map.dim();
    if (cm_w as u32, cm_h as u32) != (w, h) {
        return Err(RenderError::DimensionMismatch { img_w: w, img_h: h, cm_w: cm_w as u32, cm_h: cm_h as u32 });
    }

    match mode {
        VizMode::Filled => Ok(render_filled(image, class_map, vocab, opacity, filter)),
        VizMode::Contour => Ok(render_contour(image, class_map, vocab, filter)),
        VizMode::SideBySide => Ok(render_side_by_side(image, class_map, vocab, filter)),
        VizMode::Blend => Ok(render_blend(image, class_map, vocab, opacity, filter)),
    }
}

fn render_filled(
    image: &RgbImage,
    class_map: &ndarray::Array2<u16>,
    vocab: ClassVocabulary,
    opacity: f32,
    filter: &ClassFilter,
) -> RgbImage {
    let (w, h) = image.dimensions();
    let mut out = RgbImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let class = class_map[(y as usize, x as usize)];
            let src = image.get_pixel(x, y).0;
            let px = if passes(filter, class) {
                blend_rgb(src, vocab.color_of(class), opacity)
            } else {
                src
            };
            out.put_pixel(x, y, Rgb(px));
        }
    }
    out
}

fn blend_rgb(src: [u8; 3], overlay: [u8; 3], alpha: f32) -> [u8; 3] {
    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = (1.0 - alpha) * src[c] as f32 + alpha * overlay[c] as f32;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    out
}

fn render_contour(
    image: &RgbImage,
    class_map: &ndarray::Array2<u16>,
    vocab: ClassVocabulary,
    filter: &ClassFilter,
) -> RgbImage {
    let (w, h) = image.dimensions();
    let mut out = image.clone();
    let (h_u, w_u) = (h as usize, w as usize);
    for y in 0..h_u {
        for x in 0..w_u {
            let class = class_map[(y, x)];
            let here_passes = passes(filter, class);
            let neighbors = [
                (x + 1 < w_u).then(|| (y, x + 1)),
                (y + 1 < h_u).then(|| (y + 1, x)),
            ];
            for n in neighbors.into_iter().flatten() {
                let other = class_map[n];
                if other == class {
                    continue;
                }
                let other_passes = passes(filter, other);
                if here_passes && other_passes {
                    let color = vocab.color_of(class);
                    out.put_pixel(x as u32, y as u32, Rgb(color));
                    let (ny, nx) = n;
                    out.put_pixel(nx as u32, ny as u32, Rgb(vocab.color_of(other)));
                }
            }
        }
    }
    out
}

fn render_side_by_side(
    image: &RgbImage,
    class_map: &ndarray::Array2<u16>,
    vocab: ClassVocabulary,
    filter: &ClassFilter,
) -> RgbImage {
    let (w, h) = image.dimensions();
    let right = render_filled(image, class_map, vocab, 1.0, filter);
    let mut out = RgbImage::new(w * 2, h);
    for y in 0..h {
        for x in 0..w {
            out.put_pixel(x, y, *image.get_pixel(x, y));
            out.put_pixel(w + x, y, *right.get_pixel(x, y));
        }
    }
    out
}

fn render_blend(
    image: &RgbImage,
    class_map: &ndarray::Array2<u16>,
    vocab: ClassVocabulary,
    opacity: f32,
    filter: &ClassFilter,
) -> RgbImage {
    let (w, h) = image.dimensions();
    let mut out = RgbImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let class = class_map[(y as usize, x as usize)];
            let src = image.get_pixel(x, y).0;
            if !passes(filter, class) {
                out.put_pixel(x, y, Rgb(src));
                continue;
            }
            let (_, s, v) = rgb_to_hsv(src);
            let (hue, _, _) = rgb_to_hsv(vocab.color_of(class));
            let recombined = hsv_to_rgb(hue, s, v);
            out.put_pixel(x, y, Rgb(blend_rgb(src, recombined, opacity)));
        }
    }
    out
}

fn rgb_to_hsv(rgb: [u8; 3]) -> (f32, f32, f32) {
    let [r, g, b] = rgb.map(|c| c as f32 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let hue = if hue < 0.0 { hue + 360.0 } else { hue };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };
    (hue, saturation, max)
}

fn hsv_to_rgb(hue_deg: f32, saturation: f32, value: f32) -> [u8; 3] {
    let c = value * saturation;
    let h = hue_deg / 60.0;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r1, g1, b1) = if (0.0..1.0).contains(&h) {
        (c, x, 0.0)
    } else if (1.0..2.0).contains(&h) {
        (x, c, 0.0)
    } else if (2.0..3.0).contains(&h) {
        (0.0, c, x)
    } else if (3.0..4.0).contains(&h) {
        (0.0, x, c)
    } else if (4.0..5.0).contains(&h) {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };
    let m = value - c;
    [
        ((r1 + m) * 255.0).round().clamp(0.0, 255.0) as u8,
        ((g1 + m) * 255.0).round().clamp(0.0, 255.0) as u8,
        ((b1 + m) * 255.0).round().clamp(0.0, 255.0) as u8,
    ]
}
