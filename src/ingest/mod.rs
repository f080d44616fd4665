//! Frame ingestion from an external decoder process.
//!
//! - `decoder`: argument template, input placeholder expansion, shape probing
//! - `process`: the spawned decoder subprocess
//! - `capture`: the actor that copies decoder stdout into the frame buffer
//! - `supervisor`: start/restart, graceful-then-forced termination, watchdog
//!
//! Capture failures never propagate to callers. A dead or stalled decoder
//! shows up as a frozen frame timestamp until the watchdog restarts it.

pub mod capture;
pub mod decoder;
pub mod process;
pub mod supervisor;

pub use capture::{CaptureActor, CaptureExit, CaptureStats};
pub use decoder::{expand_input, input_env_vars, probe_frame_shape, DecoderArgs};
pub use process::{DecoderProcess, Liveness};
pub use supervisor::{spawn_watchdog, ProcessSupervisor, SupervisorSettings};
