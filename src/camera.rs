//! One camera: decoder supervision, frame buffer, recent-frame window,
//! object aggregation and the render cache, wired together.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::config::{CameraConfig, FramewatchConfig};
use crate::detect::{
    merge_object_rules, DetectedObjects, Mask, ObjectAggregator, RawDetection, Region,
};
use crate::frame::{FrameShape, PixelOrder, SharedFrameBuffer};
use crate::ingest::{
    expand_input, input_env_vars, probe_frame_shape, spawn_watchdog, DecoderArgs,
    ProcessSupervisor,
};
use crate::recent::{spawn_frame_tracker, RecentFrameWindow};
use crate::render::RenderCache;
use crate::shutdown::StopSignal;

/// Retains the best frame seen per label. Implemented outside this crate.
pub trait BestFrameSource: Send + Sync {
    /// Encoded image of the best frame for `label`, if one is retained.
    fn best(&self, label: &str) -> Option<Arc<Vec<u8>>>;
}

pub struct Camera {
    name: String,
    shape: FrameShape,
    pixel_order: PixelOrder,
    buffer: Arc<SharedFrameBuffer>,
    recent: Arc<RecentFrameWindow>,
    objects: Arc<DetectedObjects>,
    aggregator: ObjectAggregator,
    render: RenderCache,
    supervisor: Arc<ProcessSupervisor>,
    best_frames: Mutex<Option<Arc<dyn BestFrameSource>>>,
    stop: StopSignal,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Camera {
    /// Resolve `camera` against the global configuration. Expands input
    /// placeholders from the environment, probes the stream unless both
    /// dimensions are configured, loads the mask and builds the regions.
    /// Nothing is spawned until [`start`](Self::start).
    pub fn new(camera: &CameraConfig, config: &FramewatchConfig) -> Result<Self> {
        Self::with_env(camera, config, &input_env_vars())
    }

    /// Same as [`new`](Self::new), with placeholder values supplied by the
    /// caller.
    pub fn with_env(
        camera: &CameraConfig,
        config: &FramewatchConfig,
        vars: &HashMap<String, String>,
    ) -> Result<Self> {
        let name = camera.name.as_str();
        let input = expand_input(&camera.input, vars)
            .with_context(|| format!("camera {}: decoder input", name))?;
        let args = DecoderArgs {
            program: config.ffmpeg_bin.clone(),
            global_args: camera.global_args.clone(),
            hwaccel_args: camera.hwaccel_args.clone(),
            input_args: camera.input_args.clone(),
            input,
            output_args: camera.output_args.clone(),
        };
        let pixel_order = args
            .pixel_order()
            .with_context(|| format!("camera {}", name))?;

        let shape = match camera.configured_size() {
            Some((width, height)) => FrameShape::new(width, height)?,
            None => {
                let shape = probe_frame_shape(&config.ffprobe_bin, &args.input)
                    .with_context(|| format!("camera {}: probing frame shape", name))?;
                log::info!(
                    "{}: probed frame shape {}x{}",
                    name,
                    shape.width,
                    shape.height
                );
                shape
            }
        };

        let mask = match config.mask_path(camera) {
            Some(path) => match Mask::load(&path) {
                Ok(mask) => {
                    if mask.width() != shape.width || mask.height() != shape.height {
                        log::warn!(
                            "{}: mask is {}x{} but frames are {}x{}, coordinates will be clamped",
                            name,
                            mask.width(),
                            mask.height(),
                            shape.width,
                            shape.height
                        );
                    }
                    mask
                }
                Err(err) => {
                    log::warn!(
                        "{}: {:#}. falling back to an all-pass mask",
                        name,
                        err
                    );
                    Mask::all_pass(shape.width, shape.height)
                }
            },
            None => {
                log::info!("{}: no mask configured, accepting every position", name);
                Mask::all_pass(shape.width, shape.height)
            }
        };

        let mut regions = Vec::with_capacity(camera.regions.len());
        for (index, region) in camera.regions.iter().enumerate() {
            let rules = merge_object_rules(&config.objects, &camera.objects, &region.objects);
            let region = Region::new(region.size, region.x_offset, region.y_offset, rules)
                .with_context(|| format!("camera {}: region {}", name, index))?;
            region
                .check_fits(shape)
                .with_context(|| format!("camera {}: region {}", name, index))?;
            regions.push(region);
        }

        let stop = StopSignal::new();
        let buffer = Arc::new(SharedFrameBuffer::new(shape));
        let supervisor = Arc::new(ProcessSupervisor::new(
            name,
            args,
            camera.take_frame,
            buffer.clone(),
            config.watchdog,
            stop.clone(),
        ));

        Ok(Self {
            name: name.to_string(),
            shape,
            pixel_order,
            buffer,
            recent: Arc::new(RecentFrameWindow::new()),
            objects: Arc::new(DetectedObjects::new()),
            aggregator: ObjectAggregator::new(name, regions, mask),
            render: RenderCache::new(pixel_order, config.jpeg_quality),
            supervisor,
            best_frames: Mutex::new(None),
            stop,
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the decoder, its capture actor, the frame tracker and the
    /// watchdog.
    pub fn start(&self) -> Result<()> {
        if self.stop.is_stopped() {
            return Err(anyhow!("camera {} has been stopped", self.name));
        }
        let mut threads = self.lock_threads();
        if !threads.is_empty() {
            return Err(anyhow!("camera {} is already running", self.name));
        }
        self.supervisor.start_or_restart()?;
        threads.push(spawn_frame_tracker(
            &self.name,
            self.buffer.clone(),
            self.recent.clone(),
            self.stop.clone(),
        )?);
        threads.push(spawn_watchdog(self.supervisor.clone(), self.stop.clone())?);
        log::info!("{}: camera started", self.name);
        Ok(())
    }

    /// Stop every actor and the decoder, then join their threads.
    /// A stopped camera cannot be started again.
    pub fn stop(&self) {
        self.stop.stop();
        self.buffer.notify_all();
        self.objects.notify_all();
        self.supervisor.shutdown();
        let threads: Vec<_> = self.lock_threads().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                log::error!("{}: camera thread panicked", self.name);
            }
        }
        log::info!("{}: camera stopped", self.name);
    }

    /// Filter a batch of raw detections and append the survivors.
    pub fn add_objects(&self, detections: Vec<RawDetection>) {
        self.aggregator.add_objects(detections, &self.objects);
    }

    /// Annotated JPEG of the current frame.
    pub fn current_frame_with_objects(&self) -> Result<Arc<Vec<u8>>> {
        self.render
            .current_frame_with_objects(&self.buffer, &self.objects, self.aggregator.regions())
    }

    pub fn attach_best_frames(&self, source: Arc<dyn BestFrameSource>) {
        *self
            .best_frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(source);
    }

    /// Best retained frame for `label`, from the attached collaborator.
    pub fn best(&self, label: &str) -> Option<Arc<Vec<u8>>> {
        let source = self
            .best_frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        source.best(label)
    }

    pub fn capture_pid(&self) -> Option<u32> {
        self.supervisor.capture_pid()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn pixel_order(&self) -> PixelOrder {
        self.pixel_order
    }

    pub fn frame_buffer(&self) -> &Arc<SharedFrameBuffer> {
        &self.buffer
    }

    pub fn recent_frames(&self) -> &Arc<RecentFrameWindow> {
        &self.recent
    }

    pub fn detected_objects(&self) -> &Arc<DetectedObjects> {
        &self.objects
    }

    pub fn regions(&self) -> &[Region] {
        self.aggregator.regions()
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn render_cache(&self) -> &RenderCache {
        &self.render
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if !self.stop.is_stopped() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectRule;
    use image::{GrayImage, Luma};

    fn config(json: &str) -> Result<FramewatchConfig> {
        FramewatchConfig::from_json_str(json)
    }

    const BASIC: &str = r#"{
        "objects": { "person": { "threshold": 0.5 } },
        "cameras": {
            "front": {
                "ffmpeg": { "input": "rtsp://{FRAMEWATCH_HOST}/live" },
                "width": 200,
                "height": 100,
                "objects": { "person": { "min_area": 100 } },
                "regions": [
                    { "size": 100, "x_offset": 50, "y_offset": 0, "objects": { "person": { "threshold": 0.7 } } },
                    { "size": 100, "x_offset": 0, "y_offset": 0 }
                ]
            }
        }
    }"#;

    fn vars() -> HashMap<String, String> {
        HashMap::from([("FRAMEWATCH_HOST".to_string(), "10.0.0.5".to_string())])
    }

    #[test]
    fn new_resolves_input_shape_and_merged_rules() -> Result<()> {
        let cfg = config(BASIC)?;
        let camera = Camera::with_env(&cfg.cameras[0], &cfg, &vars())?;

        assert_eq!(camera.shape(), FrameShape::new(200, 100)?);
        assert_eq!(camera.pixel_order(), PixelOrder::Rgb);
        assert_eq!(camera.capture_pid(), None);
        assert_eq!(
            camera.regions()[0].rule_for("person"),
            Some(&ObjectRule {
                min_area: Some(100),
                max_area: None,
                threshold: Some(0.7),
            })
        );
        assert_eq!(
            camera.regions()[1].rule_for("person"),
            Some(&ObjectRule {
                min_area: Some(100),
                max_area: None,
                threshold: Some(0.5),
            })
        );
        Ok(())
    }

    #[test]
    fn unset_placeholder_fails_initialization() -> Result<()> {
        let cfg = config(BASIC)?;
        assert!(Camera::with_env(&cfg.cameras[0], &cfg, &HashMap::new()).is_err());
        Ok(())
    }

    #[test]
    fn region_outside_frame_fails_initialization() -> Result<()> {
        let cfg = config(
            r#"{"cameras": {"a": {"ffmpeg": {"input": "x"}, "width": 100, "height": 100,
                "regions": [{"size": 80, "x_offset": 40}]}}}"#,
        )?;
        assert!(Camera::with_env(&cfg.cameras[0], &cfg, &HashMap::new()).is_err());
        Ok(())
    }

    #[test]
    fn missing_mask_file_falls_back_to_all_pass() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut cfg = config(
            r#"{"objects": {"person": {}},
                "cameras": {"a": {"ffmpeg": {"input": "x"}, "width": 10, "height": 10,
                "mask": "a.png", "regions": [{"size": 10}]}}}"#,
        )?;
        cfg.mask_dir = dir.path().to_path_buf();
        let detection = |label: &str| RawDetection {
            region_id: 0,
            bbox: [0.2, 0.2, 0.8, 0.9],
            label: label.to_string(),
            score: 0.9,
        };

        let unmasked = Camera::with_env(&cfg.cameras[0], &cfg, &HashMap::new())?;
        assert!(!unmasked.aggregator.mask().is_excluded(5, 9));
        unmasked.add_objects(vec![detection("person"), detection("car")]);
        assert_eq!(unmasked.detected_objects().len(), 2);

        std::fs::write(dir.path().join("a.png"), b"not an image")?;
        let undecodable = Camera::with_env(&cfg.cameras[0], &cfg, &HashMap::new())?;
        undecodable.add_objects(vec![detection("person")]);
        assert_eq!(undecodable.detected_objects().len(), 1);

        let mut mask = GrayImage::from_pixel(10, 10, Luma([255]));
        mask.put_pixel(5, 9, Luma([0]));
        mask.save(dir.path().join("a.png"))?;
        let camera = Camera::with_env(&cfg.cameras[0], &cfg, &HashMap::new())?;

        // Bottom-center of (2, 2)-(8, 9) lands on the excluded pixel. Labels
        // without rules skip the mask.
        camera.add_objects(vec![detection("person"), detection("car")]);
        let objects = camera.detected_objects().snapshot();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].label, "car");
        Ok(())
    }

    #[test]
    fn add_objects_applies_region_rules() -> Result<()> {
        let cfg = config(BASIC)?;
        let camera = Camera::with_env(&cfg.cameras[0], &cfg, &vars())?;
        camera.add_objects(vec![
            RawDetection {
                region_id: 0,
                bbox: [0.0, 0.0, 0.5, 0.5],
                label: "person".to_string(),
                score: 0.6,
            },
            RawDetection {
                region_id: 1,
                bbox: [0.0, 0.0, 0.5, 0.5],
                label: "person".to_string(),
                score: 0.6,
            },
        ]);
        let objects = camera.detected_objects().snapshot();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].region_id, 1);
        Ok(())
    }

    #[test]
    fn best_delegates_to_attached_source() -> Result<()> {
        struct Fixed;
        impl BestFrameSource for Fixed {
            fn best(&self, label: &str) -> Option<Arc<Vec<u8>>> {
                (label == "car").then(|| Arc::new(vec![1, 2, 3]))
            }
        }

        let cfg = config(BASIC)?;
        let camera = Camera::with_env(&cfg.cameras[0], &cfg, &vars())?;
        assert!(camera.best("car").is_none());
        camera.attach_best_frames(Arc::new(Fixed));
        assert_eq!(camera.best("car").as_deref(), Some(&vec![1, 2, 3]));
        assert!(camera.best("person").is_none());
        Ok(())
    }

    #[test]
    fn stopped_camera_refuses_to_start() -> Result<()> {
        let cfg = config(BASIC)?;
        let camera = Camera::with_env(&cfg.cameras[0], &cfg, &vars())?;
        camera.stop();
        assert!(camera.start().is_err());
        assert_eq!(camera.capture_pid(), None);
        Ok(())
    }
}
