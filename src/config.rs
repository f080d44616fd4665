use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::ObjectRules;
use crate::ingest::SupervisorSettings;
use crate::render::DEFAULT_JPEG_QUALITY;

const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
const DEFAULT_FFPROBE_BIN: &str = "ffprobe";
const DEFAULT_MASK_DIR: &str = "/config";
const DEFAULT_TAKE_FRAME: u32 = 1;
const DEFAULT_GLOBAL_ARGS: &[&str] = &["-hide_banner", "-loglevel", "panic"];
const DEFAULT_INPUT_ARGS: &[&str] = &[
    "-avoid_negative_ts",
    "make_zero",
    "-fflags",
    "nobuffer",
    "-flags",
    "low_delay",
    "-strict",
    "experimental",
    "-fflags",
    "+genpts+discardcorrupt",
    "-rtsp_transport",
    "tcp",
    "-stimeout",
    "5000000",
    "-use_wallclock_as_timestamps",
    "1",
];
const DEFAULT_OUTPUT_ARGS: &[&str] = &["-f", "rawvideo", "-pix_fmt", "rgb24"];

#[derive(Debug, Deserialize, Default)]
struct FramewatchConfigFile {
    ffmpeg: Option<FfmpegConfigFile>,
    objects: Option<ObjectRules>,
    watchdog: Option<WatchdogConfigFile>,
    mask_dir: Option<PathBuf>,
    jpeg_quality: Option<u8>,
    cameras: Option<BTreeMap<String, CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct FfmpegConfigFile {
    global_args: Option<Vec<String>>,
    hwaccel_args: Option<Vec<String>>,
    input_args: Option<Vec<String>>,
    output_args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct WatchdogConfigFile {
    poll_secs: Option<u64>,
    stale_secs: Option<u64>,
    restart_backoff_secs: Option<u64>,
    terminate_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    ffmpeg: Option<CameraFfmpegConfigFile>,
    take_frame: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    mask: Option<PathBuf>,
    objects: Option<ObjectRules>,
    regions: Option<Vec<RegionConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraFfmpegConfigFile {
    input: Option<String>,
    global_args: Option<Vec<String>>,
    hwaccel_args: Option<Vec<String>>,
    input_args: Option<Vec<String>>,
    output_args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct RegionConfigFile {
    size: Option<u32>,
    x_offset: Option<u32>,
    y_offset: Option<u32>,
    objects: Option<ObjectRules>,
}

#[derive(Debug, Clone)]
pub struct FramewatchConfig {
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub mask_dir: PathBuf,
    pub jpeg_quality: u8,
    pub objects: ObjectRules,
    pub watchdog: SupervisorSettings,
    pub cameras: Vec<CameraConfig>,
}

/// One camera, with every decoder argument group already resolved against
/// the global `ffmpeg` defaults.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub name: String,
    pub input: String,
    pub global_args: Vec<String>,
    pub hwaccel_args: Vec<String>,
    pub input_args: Vec<String>,
    pub output_args: Vec<String>,
    pub take_frame: u32,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mask: Option<PathBuf>,
    pub objects: ObjectRules,
    pub regions: Vec<RegionConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionConfig {
    pub size: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub objects: ObjectRules,
}

impl FramewatchConfig {
    /// Read the file named by `FRAMEWATCH_CONFIG`, then apply `FRAMEWATCH_*`
    /// overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FRAMEWATCH_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .ok_or_else(|| anyhow!("FRAMEWATCH_CONFIG must name a configuration file"))?;
        Self::load_from(Path::new(&config_path))
    }

    /// Same as [`load`](Self::load) with an explicit file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a JSON document without consulting the environment.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file = serde_json::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let mut cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FramewatchConfigFile) -> Result<Self> {
        let ffmpeg = file.ffmpeg.unwrap_or_default();
        let defaults = CameraFfmpegConfigFile {
            input: None,
            global_args: Some(ffmpeg.global_args.unwrap_or_else(|| to_args(DEFAULT_GLOBAL_ARGS))),
            hwaccel_args: Some(ffmpeg.hwaccel_args.unwrap_or_default()),
            input_args: Some(ffmpeg.input_args.unwrap_or_else(|| to_args(DEFAULT_INPUT_ARGS))),
            output_args: Some(ffmpeg.output_args.unwrap_or_else(|| to_args(DEFAULT_OUTPUT_ARGS))),
        };

        let watchdog_file = file.watchdog.unwrap_or_default();
        let base = SupervisorSettings::default();
        let watchdog = SupervisorSettings {
            terminate_timeout: secs_or(watchdog_file.terminate_timeout_secs, base.terminate_timeout),
            watchdog_poll: secs_or(watchdog_file.poll_secs, base.watchdog_poll),
            stale_after: secs_or(watchdog_file.stale_secs, base.stale_after),
            restart_backoff: secs_or(watchdog_file.restart_backoff_secs, base.restart_backoff),
        };

        let mut cameras = Vec::new();
        for (name, camera) in file.cameras.unwrap_or_default() {
            cameras.push(camera_from_file(name, camera, &defaults)?);
        }

        Ok(Self {
            ffmpeg_bin: DEFAULT_FFMPEG_BIN.to_string(),
            ffprobe_bin: DEFAULT_FFPROBE_BIN.to_string(),
            mask_dir: file.mask_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_MASK_DIR)),
            jpeg_quality: file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            objects: file.objects.unwrap_or_default(),
            watchdog,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(bin) = std::env::var("FRAMEWATCH_FFMPEG_BIN") {
            if !bin.trim().is_empty() {
                self.ffmpeg_bin = bin;
            }
        }
        if let Ok(bin) = std::env::var("FRAMEWATCH_FFPROBE_BIN") {
            if !bin.trim().is_empty() {
                self.ffprobe_bin = bin;
            }
        }
        if let Ok(dir) = std::env::var("FRAMEWATCH_MASK_DIR") {
            if !dir.trim().is_empty() {
                self.mask_dir = PathBuf::from(dir);
            }
        }
        if let Ok(quality) = std::env::var("FRAMEWATCH_JPEG_QUALITY") {
            self.jpeg_quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("FRAMEWATCH_JPEG_QUALITY must be an integer from 1 to 100"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be from 1 to 100"));
        }
        let watchdog = &self.watchdog;
        for (name, value) in [
            ("watchdog.poll_secs", watchdog.watchdog_poll),
            ("watchdog.stale_secs", watchdog.stale_after),
            ("watchdog.restart_backoff_secs", watchdog.restart_backoff),
            ("watchdog.terminate_timeout_secs", watchdog.terminate_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        for camera in &self.cameras {
            camera.validate()?;
        }
        Ok(())
    }

    pub fn camera(&self, name: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|camera| camera.name == name)
    }

    /// Mask path for `camera`, relative paths resolved against `mask_dir`.
    pub fn mask_path(&self, camera: &CameraConfig) -> Option<PathBuf> {
        camera.mask.as_ref().map(|mask| {
            if mask.is_absolute() {
                mask.clone()
            } else {
                self.mask_dir.join(mask)
            }
        })
    }
}

impl CameraConfig {
    /// Both dimensions configured, so no probe is needed.
    pub fn configured_size(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Some((width, height)),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.input.trim().is_empty() {
            return Err(anyhow!("camera {}: ffmpeg.input must not be empty", self.name));
        }
        if self.take_frame == 0 {
            return Err(anyhow!("camera {}: take_frame must be at least 1", self.name));
        }
        if self.regions.is_empty() {
            return Err(anyhow!("camera {}: at least one region is required", self.name));
        }
        if self.regions.iter().any(|region| region.size == 0) {
            return Err(anyhow!("camera {}: region size must be greater than zero", self.name));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(anyhow!("camera {}: width and height must be greater than zero", self.name));
        }
        Ok(())
    }
}

fn camera_from_file(
    name: String,
    file: CameraConfigFile,
    defaults: &CameraFfmpegConfigFile,
) -> Result<CameraConfig> {
    let ffmpeg = file.ffmpeg.unwrap_or_default();
    let input = ffmpeg
        .input
        .ok_or_else(|| anyhow!("camera {}: ffmpeg.input is required", name))?;
    let pick = |own: Option<Vec<String>>, global: &Option<Vec<String>>| {
        own.or_else(|| global.clone()).unwrap_or_default()
    };

    let mut regions = Vec::new();
    for (index, region) in file.regions.unwrap_or_default().into_iter().enumerate() {
        let size = region
            .size
            .ok_or_else(|| anyhow!("camera {}: region {} has no size", name, index))?;
        regions.push(RegionConfig {
            size,
            x_offset: region.x_offset.unwrap_or(0),
            y_offset: region.y_offset.unwrap_or(0),
            objects: region.objects.unwrap_or_default(),
        });
    }

    Ok(CameraConfig {
        input,
        global_args: pick(ffmpeg.global_args, &defaults.global_args),
        hwaccel_args: pick(ffmpeg.hwaccel_args, &defaults.hwaccel_args),
        input_args: pick(ffmpeg.input_args, &defaults.input_args),
        output_args: pick(ffmpeg.output_args, &defaults.output_args),
        take_frame: file.take_frame.unwrap_or(DEFAULT_TAKE_FRAME),
        width: file.width,
        height: file.height,
        mask: file.mask,
        objects: file.objects.unwrap_or_default(),
        regions,
        name,
    })
}

fn read_config_file(path: &Path) -> Result<FramewatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        parse_with(path, &raw, |raw| toml::from_str(raw).map_err(|e| e.to_string()))
    } else {
        parse_with(path, &raw, |raw| serde_json::from_str(raw).map_err(|e| e.to_string()))
    }
}

fn parse_with<T: DeserializeOwned>(
    path: &Path,
    raw: &str,
    parse: impl FnOnce(&str) -> std::result::Result<T, String>,
) -> Result<T> {
    parse(raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "cameras": {
            "back": {
                "ffmpeg": { "input": "rtsp://cam/back" },
                "regions": [{ "size": 300 }]
            }
        }
    }"#;

    #[test]
    fn minimal_camera_gets_global_defaults() -> Result<()> {
        let cfg = FramewatchConfig::from_json_str(MINIMAL)?;
        let back = cfg.camera("back").ok_or_else(|| anyhow!("missing camera"))?;
        assert_eq!(back.global_args, to_args(DEFAULT_GLOBAL_ARGS));
        assert!(back.hwaccel_args.is_empty());
        assert_eq!(back.output_args, to_args(DEFAULT_OUTPUT_ARGS));
        assert_eq!(back.take_frame, 1);
        assert_eq!(back.regions[0].x_offset, 0);
        assert_eq!(cfg.watchdog.stale_after, Duration::from_secs(300));
        assert_eq!(cfg.jpeg_quality, DEFAULT_JPEG_QUALITY);
        Ok(())
    }

    #[test]
    fn camera_args_override_globals() -> Result<()> {
        let cfg = FramewatchConfig::from_json_str(
            r#"{
                "ffmpeg": { "hwaccel_args": ["-hwaccel", "vaapi"] },
                "cameras": {
                    "a": {
                        "ffmpeg": { "input": "x", "output_args": ["-f", "rawvideo", "-pix_fmt", "bgr24"] },
                        "regions": [{ "size": 10 }]
                    },
                    "b": {
                        "ffmpeg": { "input": "y", "hwaccel_args": [] },
                        "regions": [{ "size": 10 }]
                    }
                }
            }"#,
        )?;
        assert_eq!(cfg.cameras[0].hwaccel_args, vec!["-hwaccel", "vaapi"]);
        assert_eq!(cfg.cameras[0].output_args[3], "bgr24");
        assert!(cfg.cameras[1].hwaccel_args.is_empty());
        assert_eq!(cfg.cameras[1].output_args, to_args(DEFAULT_OUTPUT_ARGS));
        Ok(())
    }

    #[test]
    fn rejects_invalid_cameras() {
        assert!(FramewatchConfig::from_json_str("{}").is_err());
        assert!(FramewatchConfig::from_json_str(
            r#"{"cameras": {"a": {"ffmpeg": {"input": "x"}, "regions": []}}}"#
        )
        .is_err());
        assert!(FramewatchConfig::from_json_str(
            r#"{"cameras": {"a": {"ffmpeg": {"input": "x"}, "take_frame": 0, "regions": [{"size": 5}]}}}"#
        )
        .is_err());
        assert!(FramewatchConfig::from_json_str(
            r#"{"cameras": {"a": {"regions": [{"size": 5}]}}}"#
        )
        .is_err());
        assert!(FramewatchConfig::from_json_str(
            r#"{"cameras": {"a": {"ffmpeg": {"input": "x"}, "regions": [{"x_offset": 5}]}}}"#
        )
        .is_err());
    }

    #[test]
    fn relative_masks_resolve_against_mask_dir() -> Result<()> {
        let mut cfg = FramewatchConfig::from_json_str(
            r#"{"mask_dir": "/masks", "cameras": {"a": {"ffmpeg": {"input": "x"}, "mask": "a.png", "regions": [{"size": 5}]}}}"#,
        )?;
        assert_eq!(
            cfg.mask_path(&cfg.cameras[0]),
            Some(PathBuf::from("/masks/a.png"))
        );
        cfg.cameras[0].mask = Some(PathBuf::from("/abs/m.png"));
        assert_eq!(
            cfg.mask_path(&cfg.cameras[0]),
            Some(PathBuf::from("/abs/m.png"))
        );
        Ok(())
    }
}
