//! Per-label filter rules and detection regions.
//!
//! Rules come from three levels (global, camera, region). They are merged
//! once, field by field, most specific level winning, and frozen into each
//! `Region`. Nothing is looked up from configuration at filter time.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::result::BoundingBox;
use crate::frame::FrameShape;

/// Filter thresholds for one object label. Unset fields fall back to the
/// less specific level, then to the aggregator defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ObjectRule {
    pub min_area: Option<i64>,
    pub max_area: Option<i64>,
    pub threshold: Option<f64>,
}

impl ObjectRule {
    /// `self` overridden by every field `over` sets.
    pub fn overridden_by(&self, over: &ObjectRule) -> ObjectRule {
        ObjectRule {
            min_area: over.min_area.or(self.min_area),
            max_area: over.max_area.or(self.max_area),
            threshold: over.threshold.or(self.threshold),
        }
    }
}

pub type ObjectRules = HashMap<String, ObjectRule>;

/// Merge global, camera and region rules. Every label named at any level is
/// present in the result.
pub fn merge_object_rules(
    global: &ObjectRules,
    camera: &ObjectRules,
    region: &ObjectRules,
) -> ObjectRules {
    let mut merged = ObjectRules::new();
    for level in [global, camera, region] {
        for (label, rule) in level {
            let entry = merged.entry(label.clone()).or_default();
            *entry = entry.overridden_by(rule);
        }
    }
    merged
}

/// A fixed square crop of the frame with its own object rules.
#[derive(Clone, Debug, PartialEq)]
pub struct Region {
    pub size: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    object_rules: ObjectRules,
}

impl Region {
    pub fn new(size: u32, x_offset: u32, y_offset: u32, object_rules: ObjectRules) -> Result<Self> {
        if size == 0 {
            return Err(anyhow!("region size must be greater than zero"));
        }
        Ok(Self {
            size,
            x_offset,
            y_offset,
            object_rules,
        })
    }

    /// Fail unless the whole crop lies inside a frame of `shape`.
    pub fn check_fits(&self, shape: FrameShape) -> Result<()> {
        let right = u64::from(self.x_offset) + u64::from(self.size);
        let bottom = u64::from(self.y_offset) + u64::from(self.size);
        if right > u64::from(shape.width) || bottom > u64::from(shape.height) {
            return Err(anyhow!(
                "region {}px at ({}, {}) does not fit a {}x{} frame",
                self.size,
                self.x_offset,
                self.y_offset,
                shape.width,
                shape.height
            ));
        }
        Ok(())
    }

    pub fn rule_for(&self, label: &str) -> Option<&ObjectRule> {
        self.object_rules.get(label)
    }

    pub fn object_rules(&self) -> &ObjectRules {
        &self.object_rules
    }

    /// Largest area a detection may have when no `max_area` is configured.
    pub fn default_max_area(&self) -> i64 {
        i64::from(self.size) * i64::from(self.size)
    }

    /// Scale a region-normalized box to absolute frame pixels (truncating).
    pub fn to_absolute(&self, bbox: &[f64; 4]) -> BoundingBox {
        let size = f64::from(self.size);
        let x = f64::from(self.x_offset);
        let y = f64::from(self.y_offset);
        BoundingBox {
            xmin: (bbox[0] * size + x) as i32,
            ymin: (bbox[1] * size + y) as i32,
            xmax: (bbox[2] * size + x) as i32,
            ymax: (bbox[3] * size + y) as i32,
        }
    }
}
