use serde::Serialize;

/// Unvalidated detection for one region, box in region-normalized `[0, 1]`
/// coordinates `(x0, y0, x1, y1)`.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub region_id: usize,
    pub bbox: [f64; 4],
    pub label: String,
    pub score: f64,
}

/// Absolute pixel box in frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub xmin: i32,
    pub ymin: i32,
    pub xmax: i32,
    pub ymax: i32,
}

impl BoundingBox {
    pub fn width(&self) -> i64 {
        i64::from(self.xmax) - i64::from(self.xmin)
    }

    pub fn height(&self) -> i64 {
        i64::from(self.ymax) - i64::from(self.ymin)
    }

    pub fn area(&self) -> i64 {
        self.width().saturating_mul(self.height())
    }
}

/// A detection that passed region filtering, in frame coordinates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectedObject {
    pub label: String,
    pub score: f64,
    pub region_id: usize,
    #[serde(flatten)]
    pub bbox: BoundingBox,
    pub area: i64,
}
