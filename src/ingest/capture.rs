//! Capture actor: decoder stdout -> `SharedFrameBuffer`.
//!
//! One actor lives exactly as long as one decoder process. It is the only
//! writer of its camera's frame buffer. It never restarts or kills the decoder;
//! it just stops reading when the stream ends and leaves recovery to the
//! supervisor's watchdog.

use anyhow::{Context, Result};
use std::fmt;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::process::Liveness;
use crate::frame::{now_secs, SharedFrameBuffer};
use crate::shutdown::StopSignal;

/// Why a capture actor stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureExit {
    /// Decoder process was no longer running before a read.
    ProcessExited,
    /// Decoder stream returned no bytes at all.
    EmptyRead,
    /// Decoder stream ended in the middle of a frame.
    ShortRead { got: usize, expected: usize },
    /// Reading the stream failed.
    ReadError(String),
    /// Stop was requested.
    Stopped,
}

impl fmt::Display for CaptureExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureExit::ProcessExited => write!(f, "decoder process is not running"),
            CaptureExit::EmptyRead => write!(f, "decoder didn't return a frame"),
            CaptureExit::ShortRead { got, expected } => {
                write!(f, "decoder stream ended mid-frame ({} of {} bytes)", got, expected)
            }
            CaptureExit::ReadError(err) => write!(f, "decoder stream read failed: {}", err),
            CaptureExit::Stopped => write!(f, "stop requested"),
        }
    }
}

/// Frame counters shared between capture actors of one camera.
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_read: AtomicU64,
    frames_kept: AtomicU64,
}

impl CaptureStats {
    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::Relaxed)
    }

    pub fn frames_kept(&self) -> u64 {
        self.frames_kept.load(Ordering::Relaxed)
    }
}

pub struct CaptureActor<R> {
    camera: String,
    stream: R,
    process: Arc<dyn Liveness>,
    buffer: Arc<SharedFrameBuffer>,
    take_frame: u32,
    stats: Arc<CaptureStats>,
    stop: StopSignal,
}

impl<R: Read + Send + 'static> CaptureActor<R> {
    pub fn new(
        camera: &str,
        stream: R,
        process: Arc<dyn Liveness>,
        buffer: Arc<SharedFrameBuffer>,
        take_frame: u32,
        stats: Arc<CaptureStats>,
        stop: StopSignal,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            stream,
            process,
            buffer,
            take_frame: take_frame.max(1),
            stats,
            stop,
        }
    }

    /// Run the actor on its own named thread.
    pub fn spawn(self) -> Result<JoinHandle<CaptureExit>> {
        thread::Builder::new()
            .name(format!("{}-capture", self.camera))
            .spawn(move || self.run())
            .context("spawn capture thread")
    }

    /// Read frames until the stream or the process goes away.
    pub fn run(mut self) -> CaptureExit {
        let frame_size = self.buffer.shape().frame_size();
        let mut raw = vec![0u8; frame_size];
        let mut frame_num: u64 = 0;

        let exit = loop {
            if self.stop.is_stopped() {
                break CaptureExit::Stopped;
            }
            if !self.process.is_running() {
                break CaptureExit::ProcessExited;
            }

            match read_frame(&mut self.stream, &mut raw) {
                Ok(got) if got == frame_size => {}
                Ok(0) => break CaptureExit::EmptyRead,
                Ok(got) => {
                    break CaptureExit::ShortRead {
                        got,
                        expected: frame_size,
                    }
                }
                Err(err) => break CaptureExit::ReadError(err.to_string()),
            }

            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
            frame_num += 1;
            if frame_num % u64::from(self.take_frame) != 0 {
                continue;
            }

            if let Err(err) = self.buffer.write(&raw, now_secs()) {
                break CaptureExit::ReadError(err.to_string());
            }
            self.stats.frames_kept.fetch_add(1, Ordering::Relaxed);
        };

        match &exit {
            CaptureExit::Stopped => log::info!("{}: capture stopped", self.camera),
            other => log::warn!("{}: {}. exiting capture thread...", self.camera, other),
        }
        exit
    }
}

/// Fill `buf` from `stream`. Returns the number of bytes read, which is less
/// than `buf.len()` only when the stream hit end-of-file.
fn read_frame(stream: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameShape;
    use std::io::Cursor;
    use std::sync::atomic::AtomicBool;

    struct FakeProcess(AtomicBool);

    impl Liveness for FakeProcess {
        fn is_running(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn running() -> Arc<dyn Liveness> {
        Arc::new(FakeProcess(AtomicBool::new(true)))
    }

    fn actor(
        stream: Vec<u8>,
        process: Arc<dyn Liveness>,
        take_frame: u32,
    ) -> (CaptureActor<Cursor<Vec<u8>>>, Arc<SharedFrameBuffer>, Arc<CaptureStats>) {
        let buffer = Arc::new(SharedFrameBuffer::new(FrameShape::new(2, 2).unwrap()));
        let stats = Arc::new(CaptureStats::default());
        let actor = CaptureActor::new(
            "test",
            Cursor::new(stream),
            process,
            buffer.clone(),
            take_frame,
            stats.clone(),
            StopSignal::new(),
        );
        (actor, buffer, stats)
    }

    fn frames(values: &[u8]) -> Vec<u8> {
        values.iter().flat_map(|v| vec![*v; 12]).collect()
    }

    #[test]
    fn writes_every_frame_then_exits_on_empty_read() {
        let (actor, buffer, stats) = actor(frames(&[1, 2, 3]), running(), 1);
        assert_eq!(actor.run(), CaptureExit::EmptyRead);
        assert_eq!(stats.frames_read(), 3);
        assert_eq!(stats.frames_kept(), 3);
        let frame = buffer.read_copy();
        assert_eq!(frame.data, vec![3u8; 12]);
        assert!(frame.timestamp > 0.0);
    }

    #[test]
    fn take_frame_keeps_every_nth_frame() {
        let (actor, buffer, stats) = actor(frames(&[1, 2, 3, 4, 5]), running(), 2);
        assert_eq!(actor.run(), CaptureExit::EmptyRead);
        assert_eq!(stats.frames_read(), 5);
        assert_eq!(stats.frames_kept(), 2);
        assert_eq!(buffer.read_copy().data, vec![4u8; 12]);
    }

    #[test]
    fn partial_frame_is_fatal_and_not_written() {
        let mut stream = frames(&[9]);
        stream.extend_from_slice(&[5u8; 7]);
        let (actor, buffer, _stats) = actor(stream, running(), 1);
        assert_eq!(
            actor.run(),
            CaptureExit::ShortRead {
                got: 7,
                expected: 12
            }
        );
        assert_eq!(buffer.read_copy().data, vec![9u8; 12]);
    }

    #[test]
    fn exited_process_ends_capture_before_reading() {
        let dead: Arc<dyn Liveness> = Arc::new(FakeProcess(AtomicBool::new(false)));
        let (actor, buffer, stats) = actor(frames(&[1]), dead, 1);
        assert_eq!(actor.run(), CaptureExit::ProcessExited);
        assert_eq!(stats.frames_read(), 0);
        assert_eq!(buffer.timestamp(), 0.0);
    }

    #[test]
    fn stop_request_ends_capture() {
        let (actor, _buffer, _stats) = actor(frames(&[1, 2]), running(), 1);
        actor.stop.stop();
        assert_eq!(actor.run(), CaptureExit::Stopped);
    }
}
