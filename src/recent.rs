//! Sliding window of recently captured frames.
//!
//! The frame tracker copies every fresh frame it observes out of the
//! `SharedFrameBuffer` and keeps roughly the last two seconds of them, keyed by
//! capture timestamp, for retrospective use (best-frame selection).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::frame::{now_secs, Frame, SharedFrameBuffer};
use crate::shutdown::StopSignal;

/// Entries older than this (wall clock) are pruned.
pub const RECENT_FRAME_HORIZON: Duration = Duration::from_secs(2);

/// The tracker only skips waiting for frames younger than this.
pub const TRACKER_FRESHNESS: Duration = Duration::from_millis(500);

/// Frames keyed by capture timestamp, oldest first.
pub struct RecentFrameWindow {
    horizon: Duration,
    frames: Mutex<VecDeque<Arc<Frame>>>,
}

impl RecentFrameWindow {
    pub fn new() -> Self {
        Self::with_horizon(RECENT_FRAME_HORIZON)
    }

    pub fn with_horizon(horizon: Duration) -> Self {
        Self {
            horizon,
            frames: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a frame at its own timestamp. A frame with an already stored
    /// timestamp replaces the stored one.
    pub fn insert(&self, frame: Frame) {
        let mut frames = self.lock();
        let frame = Arc::new(frame);
        match frames
            .iter()
            .rposition(|stored| stored.timestamp <= frame.timestamp)
        {
            Some(pos) if frames[pos].timestamp == frame.timestamp => frames[pos] = frame,
            Some(pos) => frames.insert(pos + 1, frame),
            None => frames.push_front(frame),
        }
    }

    /// Drop every entry older than the horizon relative to `now`.
    pub fn prune(&self, now: f64) {
        let horizon = self.horizon.as_secs_f64();
        self.lock()
            .retain(|frame| now - frame.timestamp <= horizon);
    }

    /// Frame captured at exactly `timestamp`, if still retained.
    pub fn get(&self, timestamp: f64) -> Option<Arc<Frame>> {
        self.lock()
            .iter()
            .find(|frame| frame.timestamp == timestamp)
            .cloned()
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.lock().back().cloned()
    }

    /// Retained timestamps, oldest first.
    pub fn timestamps(&self) -> Vec<f64> {
        self.lock().iter().map(|frame| frame.timestamp).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Approximate memory held by retained rasters.
    pub fn memory_bytes(&self) -> usize {
        self.lock().iter().map(|frame| frame.data.len()).sum()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<Frame>>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RecentFrameWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the frame-tracking actor for one camera.
///
/// Loop: wait for a fresh frame, copy it under the buffer lock, record it,
/// then prune against the wall clock. Exits once `stop` is raised and the
/// buffer's waiters have been woken.
pub fn spawn_frame_tracker(
    camera: &str,
    buffer: Arc<SharedFrameBuffer>,
    window: Arc<RecentFrameWindow>,
    stop: StopSignal,
) -> Result<JoinHandle<()>> {
    let name = camera.to_string();
    thread::Builder::new()
        .name(format!("{}-frame-tracker", camera))
        .spawn(move || {
            let mut last_seen = 0.0;
            while let Some(timestamp) =
                buffer.wait_for_fresh_or_stop(last_seen, TRACKER_FRESHNESS, &stop)
            {
                if timestamp == last_seen {
                    continue;
                }
                let frame = buffer.read_copy();
                last_seen = frame.timestamp;
                window.insert(frame);
                window.prune(now_secs());
            }
            log::debug!("{}: frame tracker stopped", name);
        })
        .context("spawn frame tracker thread")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameShape;

    fn frame_at(timestamp: f64) -> Frame {
        let shape = FrameShape::new(2, 2).unwrap();
        Frame {
            data: vec![0u8; shape.frame_size()],
            shape,
            timestamp,
        }
    }

    #[test]
    fn prune_evicts_only_entries_past_horizon() {
        let window = RecentFrameWindow::new();
        let now = 1_000.0;
        for age in [3.0, 2.5, 1.9, 1.0, 0.1] {
            window.insert(frame_at(now - age));
        }

        window.prune(now);

        assert_eq!(window.timestamps(), vec![now - 1.9, now - 1.0, now - 0.1]);
    }

    #[test]
    fn entries_stay_ordered_and_deduplicated() {
        let window = RecentFrameWindow::new();
        window.insert(frame_at(10.0));
        window.insert(frame_at(12.0));
        window.insert(frame_at(11.0));
        window.insert(frame_at(12.0));

        assert_eq!(window.timestamps(), vec![10.0, 11.0, 12.0]);
        assert_eq!(window.latest().unwrap().timestamp, 12.0);
        assert!(window.get(11.0).is_some());
        assert!(window.get(13.0).is_none());
    }

    #[test]
    fn tracker_records_fresh_frames_and_stops() -> Result<()> {
        let shape = FrameShape::new(4, 4)?;
        let buffer = Arc::new(SharedFrameBuffer::new(shape));
        let window = Arc::new(RecentFrameWindow::new());
        let stop = StopSignal::new();
        let handle = spawn_frame_tracker("test", buffer.clone(), window.clone(), stop.clone())?;

        for _ in 0..20 {
            buffer.write(&vec![3u8; shape.frame_size()], now_secs())?;
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(50));

        stop.stop();
        buffer.notify_all();
        handle.join().unwrap();

        assert!(!window.is_empty());
        let newest = window.latest().unwrap();
        assert_eq!(newest.timestamp, buffer.timestamp());
        assert!(window.memory_bytes() >= shape.frame_size());
        Ok(())
    }
}
