//! Decoder subprocess command line and frame-shape probing.
//!
//! The decoder is an external program (ffmpeg by default) that writes packed
//! raw frames to stdout with no framing. Its four argument groups are opaque
//! configuration and are passed through in a fixed order:
//!
//! `<program> <global> <hwaccel> <input args> -i <input> <output args> pipe:`

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use crate::frame::{FrameShape, PixelOrder};

/// Prefix of environment variables that may be referenced from an input string.
pub const INPUT_ENV_PREFIX: &str = "FRAMEWATCH_";

/// Fully resolved decoder invocation for one camera.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderArgs {
    pub program: String,
    pub global_args: Vec<String>,
    pub hwaccel_args: Vec<String>,
    pub input_args: Vec<String>,
    pub input: String,
    pub output_args: Vec<String>,
}

impl DecoderArgs {
    /// Arguments after the program name, in decoder order.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(
            self.global_args.len()
                + self.hwaccel_args.len()
                + self.input_args.len()
                + self.output_args.len()
                + 3,
        );
        args.extend(self.global_args.iter().cloned());
        args.extend(self.hwaccel_args.iter().cloned());
        args.extend(self.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input.clone());
        args.extend(self.output_args.iter().cloned());
        args.push("pipe:".to_string());
        args
    }

    /// Printable command line, for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in self.args() {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }

    /// A `Command` with stdout piped and stdin closed.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }

    /// Channel order requested through `-pix_fmt` in the output args.
    /// Defaults to RGB when no pixel format is given.
    pub fn pixel_order(&self) -> Result<PixelOrder> {
        let Some(pos) = self.output_args.iter().position(|arg| arg == "-pix_fmt") else {
            return Ok(PixelOrder::default());
        };
        let pix_fmt = self
            .output_args
            .get(pos + 1)
            .ok_or_else(|| anyhow!("-pix_fmt in output args has no value"))?;
        PixelOrder::from_pix_fmt(pix_fmt).ok_or_else(|| {
            anyhow!(
                "unsupported output pixel format '{}' (expected rgb24 or bgr24)",
                pix_fmt
            )
        })
    }
}

/// Substitute `{FRAMEWATCH_*}` placeholders in a decoder input string.
///
/// Placeholders that name an unset variable are an error, so a camera never
/// starts against a half-formed URL.
pub fn expand_input(input: &str, vars: &HashMap<String, String>) -> Result<String> {
    static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER_RE.get_or_init(|| {
        Regex::new(r"\{(FRAMEWATCH_[A-Za-z0-9_]+)\}").expect("placeholder pattern")
    });

    let mut missing = Vec::new();
    let expanded = re.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        return Err(anyhow!(
            "decoder input references unset environment variable(s): {}",
            missing.join(", ")
        ));
    }
    Ok(expanded.into_owned())
}

/// Environment variables eligible for input expansion.
pub fn input_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with(INPUT_ENV_PREFIX))
        .collect()
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

/// Run the probe program once against `input` and derive the frame shape.
///
/// Any failure here is fatal to camera initialization: every buffer is sized
/// from this shape.
pub fn probe_frame_shape(probe_program: &str, input: &str) -> Result<FrameShape> {
    let output = Command::new(probe_program)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "json",
            input,
        ])
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run probe program '{}'", probe_program))?;
    if !output.status.success() {
        return Err(anyhow!(
            "probe of '{}' failed ({}): {}",
            input,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&stdout).with_context(|| format!("probe of '{}'", input))
}

/// Parse the JSON printed by `ffprobe -show_entries stream=width,height -of json`.
pub fn parse_probe_output(raw: &str) -> Result<FrameShape> {
    let parsed: ProbeOutput =
        serde_json::from_str(raw).map_err(|e| anyhow!("invalid probe output: {}", e))?;
    let stream = parsed
        .streams
        .first()
        .ok_or_else(|| anyhow!("probe found no video stream"))?;
    match (stream.width, stream.height) {
        (Some(width), Some(height)) => FrameShape::new(width, height),
        _ => Err(anyhow!("probe output is missing width or height")),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
