//! Class vocabularies and their deterministic index -> RGB palettes.

use once_cell::sync::Lazy;

/// One of the two class vocabularies a `ModelMode` is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassVocabulary {
    /// COCO-stuff subset, 21 entries, used by `fast`/`balanced`.
    Coco21,
    /// ADE20K, 150 entries, used by `accurate`/`sota`.
    Ade150,
}

impl ClassVocabulary {
    pub fn num_classes(self) -> usize {
        match self {
            Self::Coco21 => COCO21_LABELS.len(),
            Self::Ade150 => ADE150_LABELS.len(),
        }
    }

    pub fn labels(self) -> &'static [&'static str] {
        match self {
            Self::Coco21 => &COCO21_LABELS,
            Self::Ade150 => &ADE150_LABELS,
        }
    }

    /// `num_classes x 3` byte table, computed once and shared.
    pub fn palette(self) -> &'static [[u8; 3]] {
        match self {
            Self::Coco21 => &COCO21_PALETTE.as_slice(),
            Self::Ade150 => &ADE150_PALETTE.as_slice(),
        }
    }

    pub fn color_of(self, class: u16) -> [u8; 3] {
        let palette = self.palette();
        palette.get(class as usize).copied().unwrap_or([0, 0, 0])
    }
}

const COCO21_LABELS: [&str; 21] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

/// Bit-reversal palette: for class index `i`, each of R, G, B is the OR of
/// bits extracted from `i`'s low three bits at positions `7-j` for `j` in
/// `0..7`. This is the standard VOC/COCO-stuff scheme.
fn bit_reversal_color(mut class: u32) -> [u8; 3] {
    let mut rgb = [0u32; 3];
    let mut shift = 7u32;
    while class != 0 {
        for (channel, color) in rgb.iter_mut().enumerate() {
            *color |= ((class >> channel) & 1) << shift;
        }
        class >>= 3;
        shift = shift.wrapping_sub(1);
    }
    [rgb[0] as u8, rgb[1] as u8, rgb[2] as u8]
}

static COCO21_PALETTE: Lazy<Vec<[u8; 3]>> =
    Lazy::new(|| (0..COCO21_LABELS.len() as u32).map(bit_reversal_color).collect());

/// ADE20K's scene-parsing vocabulary, with index 0 reserved as the
/// gateway's background sentinel (the original dataset has no such slot;
/// the remaining 149 entries are its published category names in order).
const ADE150_LABELS: [&str; 150] = [
    "background",
    "building", "sky", "floor", "tree", "ceiling", "road", "bed", "windowpane", "grass",
    "cabinet", "sidewalk", "person", "earth", "door", "table", "mountain", "plant", "curtain",
    "chair", "car", "water", "painting", "sofa", "shelf", "house", "sea", "mirror", "rug",
    "field", "armchair", "seat", "fence", "desk", "rock", "wardrobe", "lamp", "bathtub",
    "railing", "cushion", "base", "box", "column", "signboard", "chest of drawers", "counter",
    "sand", "sink", "skyscraper", "fireplace", "refrigerator", "grandstand", "path", "stairs",
    "runway", "case", "pool table", "pillow", "screen door", "stairway", "river", "bridge",
    "bookcase", "blind", "coffee table", "toilet", "flower", "book", "hill", "bench",
    "countertop", "stove", "palm", "kitchen island", "computer", "swivel chair", "boat", "bar",
    "arcade machine", "hovel", "bus", "towel", "light", "truck", "tower", "chandelier",
    "awning", "streetlight", "booth", "television", "airplane", "dirt track", "apparel",
    "pole", "land", "bannister", "escalator", "ottoman", "bottle", "buffet", "poster", "stage",
    "van", "ship", "fountain", "conveyer belt", "canopy", "washer", "plaything",
    "swimming pool", "stool", "barrel", "basket", "waterfall", "tent", "bag", "minibike",
    "cradle", "oven", "ball", "food", "step", "tank", "trade name", "microwave", "pot",
    "animal", "bicycle", "lake", "dishwasher", "screen", "blanket", "sculpture", "hood",
    "sconce", "vase", "traffic light", "tray", "ashcan", "fan", "pier", "crt screen", "plate",
    "monitor", "bulletin board", "shower", "radiator", "glass", "clock", "flag",
];

/// Perceptually spread 150-entry palette: classes are placed at golden-angle
/// steps around the hue wheel (step ~= 137.5 deg) so adjacent class indices
/// never land on similar hues, with saturation/value fixed at a contrasty
/// level. Index 0 (background) is always black.
static ADE150_PALETTE: Lazy<Vec<[u8; 3]>> = Lazy::new(|| {
    const GOLDEN_ANGLE: f32 = 137.507_76;
    let mut out = Vec::with_capacity(ADE150_LABELS.len());
    out.push([0, 0, 0]);
    for i in 1..ADE150_LABELS.len() {
        let hue = (i as f32 * GOLDEN_ANGLE) % 360.0;
        out.push(hsv_to_rgb(hue, 0.65, 0.95));
    }
    out
});

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
        ((r1 + m) * 255.0).round() as u8,
        ((g1 + m) * 255.0).round() as u8,
        ((b1 + m) * 255.0).round() as u8,
    ]
}
