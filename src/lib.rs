//! Framewatch camera core
//!
//! This crate implements the frame-acquisition and object-aggregation core of
//! a camera pipeline: an external decoder process feeds raw frames into a
//! shared buffer, detections from an external detector are filtered and
//! mapped to frame space, and annotated snapshots are rendered on demand.
//!
//! # Architecture
//!
//! Every long-running actor is an OS thread coordinated through one mutex and
//! condition variable per shared resource:
//!
//! 1. **Capture**: copies fixed-size rasters from decoder stdout into the
//!    `SharedFrameBuffer`, keeping every Nth frame.
//! 2. **Supervision**: restarts the decoder (graceful terminate, then kill)
//!    when its frames go stale; old capture is joined before new capture runs.
//! 3. **Frame tracking**: keeps a sliding two-second window of frame copies.
//! 4. **Aggregation**: filters raw detections by region rules and a mask.
//! 5. **Rendering**: draws objects, regions and a timestamp, JPEG-encodes,
//!    and caches by frame timestamp.
//!
//! # Module Structure
//!
//! - `frame`: `FrameShape`, `Frame`, `SharedFrameBuffer`
//! - `ingest`: decoder arguments, process, capture actor, supervisor
//! - `recent`: `RecentFrameWindow` and its tracking actor
//! - `detect`: regions, rules, mask, `ObjectAggregator`
//! - `render`: `RenderCache` and drawing helpers
//! - `camera`: the per-camera aggregate
//! - `config`: file and environment configuration

pub mod camera;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod recent;
pub mod render;
pub mod shutdown;

pub use camera::{BestFrameSource, Camera};
pub use config::{CameraConfig, FramewatchConfig, RegionConfig};
pub use detect::{
    BoundingBox, DetectedObject, DetectedObjects, Mask, ObjectAggregator, ObjectRule,
    ObjectRules, RawDetection, Region,
};
pub use frame::{now_secs, Frame, FrameShape, PixelOrder, SharedFrameBuffer, CHANNELS};
pub use ingest::{DecoderArgs, ProcessSupervisor, SupervisorSettings};
pub use recent::{RecentFrameWindow, RECENT_FRAME_HORIZON};
pub use render::RenderCache;
pub use shutdown::StopSignal;
