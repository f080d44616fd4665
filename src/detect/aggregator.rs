//! Raw detections -> validated, frame-space objects.
//!
//! `DetectedObjects` is the camera's shared object list. It has exactly two
//! writers, each with its own operation:
//!
//! - the aggregator appends a batch (`append`)
//! - the external expiry collaborator swaps the whole list (`replace_all`)
//!
//! Both notify `objects_parsed` waiters after the mutation is complete.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::mask::Mask;
use super::result::{DetectedObject, RawDetection};
use super::rules::Region;
use crate::shutdown::StopSignal;

struct ObjectList {
    objects: Vec<DetectedObject>,
    generation: u64,
}

/// Shared detected-object collection with its `objects_parsed` signal.
pub struct DetectedObjects {
    list: Mutex<ObjectList>,
    parsed: Condvar,
}

impl DetectedObjects {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(ObjectList {
                objects: Vec::new(),
                generation: 0,
            }),
            parsed: Condvar::new(),
        }
    }

    /// Append a processed batch and wake every consumer, even for an empty batch.
    pub fn append(&self, batch: Vec<DetectedObject>) {
        {
            let mut list = self.lock();
            list.objects.extend(batch);
            list.generation += 1;
        }
        self.parsed.notify_all();
    }

    /// Replace the whole list. Reserved for the expiry collaborator.
    pub fn replace_all(&self, objects: Vec<DetectedObject>) {
        {
            let mut list = self.lock();
            list.objects = objects;
            list.generation += 1;
        }
        self.parsed.notify_all();
    }

    /// Shallow copy of the current list.
    pub fn snapshot(&self) -> Vec<DetectedObject> {
        self.lock().objects.clone()
    }

    /// Counter bumped by every mutation.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    /// Block until the generation moves past `last_generation`, `timeout`
    /// elapses, or `stop` is raised. Returns the generation observed.
    pub fn wait_parsed(&self, last_generation: u64, timeout: Duration, stop: &StopSignal) -> u64 {
        let list = self.lock();
        let (list, _timeout) = self
            .parsed
            .wait_timeout_while(list, timeout, |list| {
                list.generation == last_generation && !stop.is_stopped()
            })
            .unwrap_or_else(PoisonError::into_inner);
        list.generation
    }

    /// Wake every waiter without mutating. Used on shutdown.
    pub fn notify_all(&self) {
        let _list = self.lock();
        self.parsed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, ObjectList> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DetectedObjects {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies region geometry, rules and the mask to raw detections.
pub struct ObjectAggregator {
    camera: String,
    regions: Vec<Region>,
    mask: Mask,
}

impl ObjectAggregator {
    pub fn new(camera: &str, regions: Vec<Region>, mask: Mask) -> Self {
        Self {
            camera: camera.to_string(),
            regions,
            mask,
        }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    /// Filter `detections` and append the survivors to `objects`.
    ///
    /// Empty input is a no-op. Otherwise consumers are notified once per batch.
    pub fn add_objects(&self, detections: Vec<RawDetection>, objects: &DetectedObjects) {
        if detections.is_empty() {
            return;
        }
        let accepted: Vec<DetectedObject> = detections
            .into_iter()
            .filter_map(|detection| self.validate(detection))
            .collect();
        objects.append(accepted);
    }

    /// Map one detection to frame space and apply its region's rules.
    /// Returns `None` for rejected detections; nothing here is an error.
    pub fn validate(&self, detection: RawDetection) -> Option<DetectedObject> {
        let Some(region) = self.regions.get(detection.region_id) else {
            log::debug!(
                "{}: dropping detection for unknown region {}",
                self.camera,
                detection.region_id
            );
            return None;
        };

        if !is_normalized_box(&detection.bbox) {
            log::debug!(
                "{}: dropping {} detection with invalid box {:?}",
                self.camera,
                detection.label,
                detection.bbox
            );
            return None;
        }

        let bbox = region.to_absolute(&detection.bbox);
        let area = bbox.area();

        if let Some(rule) = region.rule_for(&detection.label) {
            if rule.min_area.unwrap_or(-1) > area {
                return None;
            }
            if rule.max_area.unwrap_or_else(|| region.default_max_area()) < area {
                return None;
            }
            if rule.threshold.unwrap_or(0.0) > detection.score {
                return None;
            }

            // Bottom-center of the box, clamped into the mask.
            let y = i64::from(bbox.ymax);
            let x = i64::from(bbox.xmin) + bbox.width() / 2;
            if self.mask.is_excluded(x, y) {
                return None;
            }
        }

        Some(DetectedObject {
            label: detection.label,
            score: detection.score,
            region_id: detection.region_id,
            bbox,
            area,
        })
    }
}

/// Finite, inside `[0, 1]`, and not inverted.
fn is_normalized_box(bbox: &[f64; 4]) -> bool {
    bbox.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v))
        && bbox[0] <= bbox[2]
        && bbox[1] <= bbox[3]
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
