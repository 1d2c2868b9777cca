//! Box and annotation types.

use serde::{Serialize, Serializer};

use crate::llm::ImagePayload;
use crate::quality::RefinementSummary;

/// Upper bound of the normalized coordinate space.
pub const COORD_MAX: f64 = 1000.0;

/// A box in normalized `[0, 1000]` coordinates, `(ymin, xmin, ymax, xmax)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedBox {
    pub ymin: f64,
    pub xmin: f64,
    pub ymax: f64,
    pub xmax: f64,
}

impl NormalizedBox {
    /// Returns `None` unless all four values are finite and within range
    /// and the box has positive extent (`ymin < ymax`, `xmin < xmax`).
    /// Inverted or zero-area boxes are rejected, not reordered.
    pub fn new(ymin: f64, xmin: f64, ymax: f64, xmax: f64) -> Option<Self> {
        let coords = [ymin, xmin, ymax, xmax];
        let in_range = coords
            .iter()
            .all(|c| c.is_finite() && (0.0..=COORD_MAX).contains(c));
        if in_range && ymin < ymax && xmin < xmax {
            Some(Self {
                ymin,
                xmin,
                ymax,
                xmax,
            })
        } else {
            None
        }
    }

    /// Builds a box from exactly four values.
    pub fn from_slice(coords: &[f64]) -> Option<Self> {
        match coords {
            [ymin, xmin, ymax, xmax] => Self::new(*ymin, *xmin, *ymax, *xmax),
            _ => None,
        }
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.ymin, self.xmin, self.ymax, self.xmax]
    }

    /// Whether the box would pass [`NormalizedBox::new`].
    pub fn is_valid(&self) -> bool {
        Self::new(self.ymin, self.xmin, self.ymax, self.xmax).is_some()
    }

    /// Converts to pixel space for an image of `width` x `height`.
    ///
    /// `x = xmin/1000*W`, `y = ymin/1000*H`, `w = (xmax-xmin)/1000*W`,
    /// `h = (ymax-ymin)/1000*H`. Pure: the same inputs always give
    /// bit-identical outputs.
    pub fn to_pixel(&self, width: u32, height: u32) -> PixelBox {
        let w = f64::from(width);
        let h = f64::from(height);
        PixelBox {
            x: (self.xmin / COORD_MAX) * w,
            y: (self.ymin / COORD_MAX) * h,
            width: ((self.xmax - self.xmin) / COORD_MAX) * w,
            height: ((self.ymax - self.ymin) / COORD_MAX) * h,
        }
    }
}

impl Serialize for NormalizedBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_array().serialize(serializer)
    }
}

/// A box in pixel space, COCO order `(x, y, w, h)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PixelBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl PixelBox {
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    pub fn to_coco(&self) -> [f64; 4] {
        [self.x, self.y, self.width, self.height]
    }

    pub fn from_coco([x, y, width, height]: [f64; 4]) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Maps back to normalized space for an image of `width` x `height`,
    /// clamping rounding overshoot at the image edges. `None` for an empty
    /// image or a box that is not a valid [`NormalizedBox`].
    pub fn to_normalized(&self, width: u32, height: u32) -> Option<NormalizedBox> {
        if width == 0 || height == 0 {
            return None;
        }
        let w = f64::from(width);
        let h = f64::from(height);
        let scale = |v: f64, total: f64| (v / total * COORD_MAX).clamp(0.0, COORD_MAX);
        NormalizedBox::new(
            scale(self.y, h),
            scale(self.x, w),
            scale(self.y + self.height, h),
            scale(self.x + self.width, w),
        )
    }
}

/// One labeled region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionAnnotation {
    pub label: String,
    pub bbox: NormalizedBox,
}

impl RegionAnnotation {
    pub fn new(label: impl Into<String>, bbox: NormalizedBox) -> Self {
        Self {
            label: label.into(),
            bbox,
        }
    }
}

/// All regions found for one item.
#[derive(Debug, Clone, Serialize)]
pub struct AnnotationResult {
    pub key: String,
    pub source: String,
    pub regions: Vec<RegionAnnotation>,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refinement: Option<RefinementSummary>,
    #[serde(skip)]
    pub image: Option<ImagePayload>,
}

impl AnnotationResult {
    pub fn new(
        key: impl Into<String>,
        regions: Vec<RegionAnnotation>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            key: key.into(),
            source: String::new(),
            regions,
            width,
            height,
            refinement: None,
            image: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_image(mut self, image: ImagePayload) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_refinement(mut self, summary: RefinementSummary) -> Self {
        self.refinement = Some(summary);
        self
    }

    /// At least one region, every coordinate in range.
    pub fn is_valid(&self) -> bool {
        !self.regions.is_empty() && self.regions.iter().all(|r| r.bbox.is_valid())
    }

    /// Regions as the JSON list shown to the validation capability.
    pub fn regions_json(&self) -> String {
        serde_json::to_string_pretty(&self.regions).unwrap_or_else(|_| "[]".to_string())
    }
}
