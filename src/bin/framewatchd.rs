//! framewatchd - camera capture daemon
//!
//! This daemon:
//! 1. Loads the camera configuration (file + FRAMEWATCH_* environment)
//! 2. Starts a supervised decoder, capture actor and frame tracker per camera
//! 3. Optionally writes each camera's annotated snapshot to disk on an interval
//! 4. Stops every camera cleanly on Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use framewatch::{Camera, FramewatchConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Supervised camera capture with annotated snapshots")]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "FRAMEWATCH_CONFIG")]
    config: PathBuf,

    /// Directory that receives `<camera>.jpg` snapshots.
    /// Snapshots are disabled when unset.
    #[arg(long, env = "FRAMEWATCH_SNAPSHOT_DIR")]
    snapshot_dir: Option<PathBuf>,

    /// Seconds between snapshot writes.
    #[arg(long, env = "FRAMEWATCH_SNAPSHOT_INTERVAL_SECS", default_value_t = 10)]
    snapshot_interval_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.snapshot_interval_secs == 0 {
        return Err(anyhow!("--snapshot-interval-secs must be greater than zero"));
    }
    let config = FramewatchConfig::load_from(&args.config)?;
    if let Some(dir) = &args.snapshot_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;
    }

    let mut cameras = Vec::with_capacity(config.cameras.len());
    for camera_config in &config.cameras {
        let camera = Camera::new(camera_config, &config)?;
        camera.start()?;
        log::info!(
            "{}: capturing {}x{} (decoder pid {:?})",
            camera.name(),
            camera.shape().width,
            camera.shape().height,
            camera.capture_pid()
        );
        cameras.push(camera);
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("framewatchd waiting for shutdown signal (Ctrl-C)...");
    let interval = Duration::from_secs(args.snapshot_interval_secs);
    loop {
        match rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if let Some(dir) = &args.snapshot_dir {
                    for camera in &cameras {
                        if let Err(err) = write_snapshot(camera, dir) {
                            log::warn!("{}: snapshot failed: {:#}", camera.name(), err);
                        }
                    }
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    for camera in &cameras {
        camera.stop();
    }
    Ok(())
}

fn write_snapshot(camera: &Camera, dir: &Path) -> Result<()> {
    let jpeg = camera.current_frame_with_objects()?;
    let path = dir.join(format!("{}.jpg", camera.name()));
    let tmp = dir.join(format!(".{}.jpg.tmp", camera.name()));
    std::fs::write(&tmp, jpeg.as_slice()).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
    log::debug!(
        "{}: wrote snapshot {} ({} objects)",
        camera.name(),
        path.display(),
        camera.detected_objects().len()
    );
    Ok(())
}
