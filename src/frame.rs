//! Shared frame state.
//!
//! - `FrameShape`: fixed raster geometry, decided once at camera start.
//! - `Frame`: an owned copy of a raster together with its capture timestamp.
//! - `SharedFrameBuffer`: the single mutable raster of a camera.
//!
//! The buffer holds raster and timestamp under ONE mutex. The paired condition
//! variable only announces that a write happened; waiters always re-check the
//! timestamp after waking.

use anyhow::{anyhow, Result};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::shutdown::StopSignal;

/// Raw frames are always packed 8-bit, three channels.
pub const CHANNELS: u32 = 3;

/// Wall-clock seconds since the epoch, as used for every frame timestamp.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Channel ordering of the decoder's raw output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelOrder {
    #[default]
    Rgb,
    Bgr,
}

impl PixelOrder {
    /// Map an ffmpeg `-pix_fmt` value to a channel order.
    pub fn from_pix_fmt(pix_fmt: &str) -> Option<Self> {
        match pix_fmt {
            "rgb24" => Some(Self::Rgb),
            "bgr24" => Some(Self::Bgr),
            _ => None,
        }
    }
}

/// Fixed raster geometry (height x width x channels).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl FrameShape {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!(
                "frame shape must be non-empty (got {}x{})",
                width,
                height
            ));
        }
        Ok(Self {
            height,
            width,
            channels: CHANNELS,
        })
    }

    /// Number of bytes in one raw frame.
    pub fn frame_size(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }
}

/// Owned raster copy with the timestamp it was captured at.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub shape: FrameShape,
    pub timestamp: f64,
}

struct FrameSlot {
    raster: Vec<u8>,
    timestamp: f64,
}

/// The camera's current frame.
///
/// Mutated only by the capture actor; everything else reads under the same lock.
pub struct SharedFrameBuffer {
    shape: FrameShape,
    slot: Mutex<FrameSlot>,
    ready: Condvar,
}

impl SharedFrameBuffer {
    /// Create a zero-filled buffer with timestamp `0.0`.
    pub fn new(shape: FrameShape) -> Self {
        Self {
            shape,
            slot: Mutex::new(FrameSlot {
                raster: vec![0u8; shape.frame_size()],
                timestamp: 0.0,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Copy `raster` in and stamp it, then wake every waiter.
    ///
    /// The notification happens after the guard is released so a woken reader
    /// always sees raster and timestamp from the same write.
    pub fn write(&self, raster: &[u8], timestamp: f64) -> Result<()> {
        if raster.len() != self.shape.frame_size() {
            return Err(anyhow!(
                "raster is {} bytes, expected {}",
                raster.len(),
                self.shape.frame_size()
            ));
        }
        {
            let mut slot = self.lock();
            slot.raster.copy_from_slice(raster);
            slot.timestamp = timestamp;
        }
        self.ready.notify_all();
        Ok(())
    }

    /// Copy out the current raster and its timestamp.
    pub fn read_copy(&self) -> Frame {
        let slot = self.lock();
        Frame {
            data: slot.raster.clone(),
            shape: self.shape,
            timestamp: slot.timestamp,
        }
    }

    /// Run `f` against the current raster without copying it.
    ///
    /// The lock is held for the duration of `f`; keep it short.
    pub fn with_frame<R>(&self, f: impl FnOnce(&[u8], f64) -> R) -> R {
        let slot = self.lock();
        f(&slot.raster, slot.timestamp)
    }

    pub fn timestamp(&self) -> f64 {
        self.lock().timestamp
    }

    /// Block until a write is announced, unless the stored frame is already
    /// newer than `last_seen` and younger than `stale_after`.
    ///
    /// Waits at most once. The wake-up is a hint: callers compare the returned
    /// timestamp with `last_seen` and call again if nothing changed.
    pub fn wait_for_fresh(&self, last_seen: f64, stale_after: Duration) -> f64 {
        self.wait_inner(last_seen, stale_after, None)
    }

    /// Same as [`wait_for_fresh`](Self::wait_for_fresh), but returns `None`
    /// once `stop` is raised. Stop is checked under the lock, so a
    /// [`notify_all`](Self::notify_all) issued after raising it is never lost.
    pub fn wait_for_fresh_or_stop(
        &self,
        last_seen: f64,
        stale_after: Duration,
        stop: &StopSignal,
    ) -> Option<f64> {
        let timestamp = self.wait_inner(last_seen, stale_after, Some(stop));
        if stop.is_stopped() {
            return None;
        }
        Some(timestamp)
    }

    fn wait_inner(&self, last_seen: f64, stale_after: Duration, stop: Option<&StopSignal>) -> f64 {
        let now = now_secs();
        let slot = self.lock();
        if stop.is_some_and(StopSignal::is_stopped) {
            return slot.timestamp;
        }
        let unchanged = slot.timestamp == last_seen;
        let stale = now - slot.timestamp > stale_after.as_secs_f64();
        if unchanged || stale {
            let slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
            return slot.timestamp;
        }
        slot.timestamp
    }

    /// Wake every waiter without writing. Used on shutdown.
    pub fn notify_all(&self) {
        let _slot = self.lock();
        self.ready.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, FrameSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn small_shape() -> FrameShape {
        FrameShape::new(8, 4).unwrap()
    }

    #[test]
    fn frame_size_is_height_width_channels() {
        let shape = FrameShape::new(640, 480).unwrap();
        assert_eq!(shape.frame_size(), 640 * 480 * 3);
    }

    #[test]
    fn empty_shape_is_rejected() {
        assert!(FrameShape::new(0, 480).is_err());
        assert!(FrameShape::new(640, 0).is_err());
    }

    #[test]
    fn pix_fmt_maps_to_channel_order() {
        assert_eq!(PixelOrder::from_pix_fmt("rgb24"), Some(PixelOrder::Rgb));
        assert_eq!(PixelOrder::from_pix_fmt("bgr24"), Some(PixelOrder::Bgr));
        assert_eq!(PixelOrder::from_pix_fmt("yuv420p"), None);
    }

    #[test]
    fn read_copy_returns_last_write() -> Result<()> {
        let buffer = SharedFrameBuffer::new(small_shape());
        let raster: Vec<u8> = (0..small_shape().frame_size()).map(|i| i as u8).collect();
        buffer.write(&raster, 42.5)?;

        let frame = buffer.read_copy();
        assert_eq!(frame.data, raster);
        assert_eq!(frame.timestamp, 42.5);
        assert_eq!(frame.shape, small_shape());
        Ok(())
    }

    #[test]
    fn write_rejects_wrong_size() {
        let buffer = SharedFrameBuffer::new(small_shape());
        assert!(buffer.write(&[0u8; 3], 1.0).is_err());
        assert_eq!(buffer.timestamp(), 0.0);
    }

    #[test]
    fn concurrent_reads_never_observe_torn_frames() {
        let buffer = Arc::new(SharedFrameBuffer::new(FrameShape::new(64, 48).unwrap()));
        let size = buffer.shape().frame_size();

        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for value in 1..=200u32 {
                    let raster = vec![(value % 256) as u8; size];
                    buffer.write(&raster, value as f64).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let frame = buffer.read_copy();
                        let expected = (frame.timestamp as u32 % 256) as u8;
                        assert!(frame.data.iter().all(|b| *b == expected));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.timestamp(), 200.0);
    }

    #[test]
    fn wait_for_fresh_returns_immediately_for_new_fresh_frame() -> Result<()> {
        let buffer = SharedFrameBuffer::new(small_shape());
        let now = now_secs();
        buffer.write(&vec![1u8; small_shape().frame_size()], now)?;

        let seen = buffer.wait_for_fresh(0.0, Duration::from_millis(500));
        assert_eq!(seen, now);
        Ok(())
    }

    #[test]
    fn wait_for_fresh_blocks_until_next_write() {
        let buffer = Arc::new(SharedFrameBuffer::new(small_shape()));
        let size = small_shape().frame_size();

        let waiter = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.wait_for_fresh(0.0, Duration::from_millis(500)))
        };

        // Keep writing until the waiter has observed one of the writes.
        let mut last = 0.0;
        while !waiter.is_finished() {
            thread::sleep(Duration::from_millis(20));
            last = now_secs();
            buffer.write(&vec![7u8; size], last).unwrap();
        }
        let seen = waiter.join().unwrap();
        assert!(seen > 0.0);
        assert!(seen <= last);
    }

    #[test]
    fn raised_stop_returns_none_without_waiting() {
        let buffer = SharedFrameBuffer::new(small_shape());
        let stop = StopSignal::new();
        stop.stop();
        assert_eq!(
            buffer.wait_for_fresh_or_stop(0.0, Duration::from_millis(500), &stop),
            None
        );
    }

    #[test]
    fn notify_all_releases_waiters_without_new_frame() {
        let buffer = Arc::new(SharedFrameBuffer::new(small_shape()));
        let waiter = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.wait_for_fresh(0.0, Duration::from_millis(500)))
        };
        while !waiter.is_finished() {
            thread::sleep(Duration::from_millis(20));
            buffer.notify_all();
        }
        assert_eq!(waiter.join().unwrap(), 0.0);
    }
}
