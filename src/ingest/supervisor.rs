//! Decoder process supervision.
//!
//! `ProcessSupervisor` owns the decoder subprocess and its capture actor and
//! replaces both together. The watchdog restarts them when the frame buffer
//! stops advancing. There is no cap on restarts: a camera that keeps failing
//! is retried forever.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::capture::{CaptureActor, CaptureExit, CaptureStats};
use super::decoder::DecoderArgs;
use super::process::{DecoderProcess, Liveness};
use crate::frame::{now_secs, SharedFrameBuffer};
use crate::shutdown::StopSignal;

pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WATCHDOG_POLL: Duration = Duration::from_secs(10);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Timing knobs for termination and the staleness watchdog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Grace period between the terminate request and a forced kill.
    pub terminate_timeout: Duration,
    /// How often the watchdog checks the frame buffer.
    pub watchdog_poll: Duration,
    /// Frame age that counts as a stalled capture.
    pub stale_after: Duration,
    /// Pause after a watchdog-driven restart before polling resumes.
    pub restart_backoff: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            watchdog_poll: DEFAULT_WATCHDOG_POLL,
            stale_after: DEFAULT_STALE_AFTER,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
        }
    }
}

struct RunningDecoder {
    process: Arc<DecoderProcess>,
    capture: JoinHandle<CaptureExit>,
}

pub struct ProcessSupervisor {
    camera: String,
    args: DecoderArgs,
    take_frame: u32,
    buffer: Arc<SharedFrameBuffer>,
    settings: SupervisorSettings,
    stats: Arc<CaptureStats>,
    stop: StopSignal,
    running: Mutex<Option<RunningDecoder>>,
    starts: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(
        camera: &str,
        args: DecoderArgs,
        take_frame: u32,
        buffer: Arc<SharedFrameBuffer>,
        settings: SupervisorSettings,
        stop: StopSignal,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            args,
            take_frame,
            buffer,
            settings,
            stats: Arc::new(CaptureStats::default()),
            stop,
            running: Mutex::new(None),
            starts: AtomicU64::new(0),
        }
    }

    /// Replace the decoder and its capture actor.
    ///
    /// An existing decoder is asked to terminate, killed if it outlives the
    /// grace period, and its capture thread is joined before the new pair is
    /// spawned. Two capture actors therefore never write the buffer at once.
    /// Concurrent callers are serialized.
    pub fn start_or_restart(&self) -> Result<()> {
        let mut running = self.lock_running();
        if let Some(old) = running.take() {
            self.tear_down(old);
        }
        if self.stop.is_stopped() {
            log::debug!("{}: stop requested, not starting a decoder", self.camera);
            return Ok(());
        }

        log::info!("{}: creating a new decoder process...", self.camera);
        log::info!("{}: {}", self.camera, self.args.command_line());
        let (process, stdout) = DecoderProcess::spawn(&self.args)?;
        let process = Arc::new(process);

        log::info!("{}: starting a new capture thread...", self.camera);
        let liveness: Arc<dyn Liveness> = process.clone();
        let actor = CaptureActor::new(
            &self.camera,
            stdout,
            liveness,
            self.buffer.clone(),
            self.take_frame,
            self.stats.clone(),
            self.stop.clone(),
        );
        let capture = match actor.spawn() {
            Ok(handle) => handle,
            Err(err) => {
                let _ = process.kill();
                let _ = process.wait();
                return Err(err);
            }
        };

        self.starts.fetch_add(1, Ordering::Relaxed);
        *running = Some(RunningDecoder { process, capture });
        Ok(())
    }

    /// Terminate the current decoder (if any) and join its capture actor.
    pub fn shutdown(&self) {
        let mut running = self.lock_running();
        if let Some(old) = running.take() {
            self.tear_down(old);
        }
    }

    /// OS process id of the running decoder.
    pub fn capture_pid(&self) -> Option<u32> {
        self.lock_running()
            .as_ref()
            .map(|running| running.process.pid())
    }

    /// Number of decoders spawned so far, including the first.
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }

    pub fn settings(&self) -> SupervisorSettings {
        self.settings
    }

    /// True when the newest frame is older than the staleness threshold.
    pub fn is_stale(&self, now: f64) -> bool {
        now - self.buffer.timestamp() > self.settings.stale_after.as_secs_f64()
    }

    fn tear_down(&self, old: RunningDecoder) {
        log::info!(
            "{}: terminating the existing decoder process {}...",
            self.camera,
            old.process.pid()
        );
        if let Err(err) = old.process.terminate() {
            log::warn!("{}: {}", self.camera, err);
        }

        log::info!("{}: waiting for the decoder to exit gracefully...", self.camera);
        match old.process.wait_timeout(self.settings.terminate_timeout) {
            Ok(Some(status)) => log::debug!("{}: decoder exited ({})", self.camera, status),
            Ok(None) => {
                log::warn!("{}: decoder didn't exit. force killing...", self.camera);
                self.force_kill(&old.process);
            }
            Err(err) => {
                log::warn!("{}: {}. force killing...", self.camera, err);
                self.force_kill(&old.process);
            }
        }

        log::info!("{}: waiting for the capture thread to exit...", self.camera);
        match old.capture.join() {
            Ok(exit) => log::debug!("{}: capture thread exited: {}", self.camera, exit),
            Err(_) => log::error!("{}: capture thread panicked", self.camera),
        }
    }

    fn force_kill(&self, process: &DecoderProcess) {
        if let Err(err) = process.kill() {
            log::error!("{}: {}", self.camera, err);
        }
        if let Err(err) = process.wait() {
            log::error!("{}: {}", self.camera, err);
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningDecoder>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Start the staleness watchdog for a supervisor.
///
/// Every `watchdog_poll` it compares the buffer timestamp with the wall clock.
/// A stale buffer triggers `start_or_restart` followed by `restart_backoff`.
pub fn spawn_watchdog(supervisor: Arc<ProcessSupervisor>, stop: StopSignal) -> Result<JoinHandle<()>> {
    let settings = supervisor.settings();
    thread::Builder::new()
        .name(format!("{}-watchdog", supervisor.camera))
        .spawn(move || {
            while stop.sleep(settings.watchdog_poll) {
                if !supervisor.is_stale(now_secs()) {
                    continue;
                }
                log::warn!(
                    "{}: last frame is more than {}s old, restarting decoder...",
                    supervisor.camera,
                    settings.stale_after.as_secs()
                );
                if let Err(err) = supervisor.start_or_restart() {
                    log::error!("{}: decoder restart failed: {:#}", supervisor.camera, err);
                }
                if !stop.sleep(settings.restart_backoff) {
                    break;
                }
            }
            log::debug!("{}: watchdog stopped", supervisor.camera);
        })
        .context("spawn watchdog thread")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
