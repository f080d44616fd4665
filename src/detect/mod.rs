mod aggregator;
mod mask;
mod result;
mod rules;

pub use aggregator::{DetectedObjects, ObjectAggregator};
pub use mask::Mask;
pub use result::{BoundingBox, DetectedObject, RawDetection};
pub use rules::{merge_object_rules, ObjectRule, ObjectRules, Region};
