//! Validated recording request.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{CaptureError, Result};
use crate::traits::{ExposureMode, FocusMode, WhiteBalanceMode};

/// Default recording length in seconds.
pub const DEFAULT_DURATION_SECONDS: u32 = 5;
/// Default frame rate.
pub const DEFAULT_FPS: u32 = 30;
/// Default encoder bitrate in bits per second.
pub const DEFAULT_BITRATE_BPS: u32 = 5_000_000;
/// Default codec profile.
pub const DEFAULT_CODEC_PROFILE: u32 = 1;
/// Default codec level (the AVC baseline constant).
pub const DEFAULT_CODEC_LEVEL: u32 = 1;

/// Video encoder selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodec {
    /// Whatever the sink considers its default for the container.
    Default,
    /// H.264 / AVC.
    #[default]
    H264,
    /// H.263.
    H263,
    /// VP8.
    Vp8,
    /// H.265 / HEVC.
    Hevc,
}

impl VideoCodec {
    /// Name accepted on the command line.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::H264 => "h264",
            Self::H263 => "h263",
            Self::Vp8 => "vp8",
            Self::Hevc => "hevc",
        }
    }
}

impl FromStr for VideoCodec {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "h264" => Ok(Self::H264),
            "h263" => Ok(Self::H263),
            "vp8" => Ok(Self::Vp8),
            "hevc" => Ok(Self::Hevc),
            other => Err(CaptureError::Input(format!("Invalid encoder: {other}"))),
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Clockwise playback rotation written into the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// No rotation.
    Deg0,
    /// 90 degrees.
    Deg90,
    /// 180 degrees.
    Deg180,
    /// 270 degrees.
    Deg270,
}

impl Orientation {
    /// Parse a rotation in degrees. Only right angles are accepted.
    pub fn from_degrees(degrees: i32) -> Result<Self> {
        match degrees {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            other => Err(CaptureError::Input(format!("Invalid orientation: {other}"))),
        }
    }

    /// Rotation in degrees.
    pub const fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

/// What to do when the device reports a disconnect mid-invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectPolicy {
    /// Treat it as a terminal failure and tear down.
    #[default]
    Fail,
    /// Log it and keep waiting for the sink to finish.
    Ignore,
}

/// A fully validated recording request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequestSpec {
    /// Camera identifier.
    pub camera_id: u32,
    /// File the recording is written to.
    pub output_path: PathBuf,
    /// Recording length in seconds.
    pub duration_seconds: u32,
    /// Frames per second, also used as the capture rate.
    pub fps: u32,
    /// Encoder bitrate in bits per second.
    pub bitrate_bps: u32,
    /// Preferred output height; the largest size is used when absent.
    pub target_height: Option<u32>,
    /// Requested auto-exposure mode.
    pub auto_exposure_mode: ExposureMode,
    /// Requested auto-focus mode. Validated and carried, not applied.
    pub auto_focus_mode: FocusMode,
    /// Requested auto-white-balance mode. Validated and carried, not applied.
    pub auto_white_balance_mode: WhiteBalanceMode,
    /// Video encoder.
    pub codec: VideoCodec,
    /// Encoder profile code.
    pub codec_profile: u32,
    /// Encoder level code.
    pub codec_level: u32,
    /// Optional rotation hint.
    pub orientation: Option<Orientation>,
    /// Disconnect handling.
    pub disconnect_policy: DisconnectPolicy,
}

impl CaptureRequestSpec {
    /// Request with every field at its default.
    pub fn new<P: Into<PathBuf>>(output_path: P) -> Self {
        Self {
            camera_id: 0,
            output_path: output_path.into(),
            duration_seconds: DEFAULT_DURATION_SECONDS,
            fps: DEFAULT_FPS,
            bitrate_bps: DEFAULT_BITRATE_BPS,
            target_height: None,
            auto_exposure_mode: ExposureMode::On,
            auto_focus_mode: FocusMode::ContinuousVideo,
            auto_white_balance_mode: WhiteBalanceMode::Auto,
            codec: VideoCodec::H264,
            codec_profile: DEFAULT_CODEC_PROFILE,
            codec_level: DEFAULT_CODEC_LEVEL,
            orientation: None,
            disconnect_policy: DisconnectPolicy::Fail,
        }
    }

    /// Check the invariants that do not need hardware.
    pub fn validate(&self) -> Result<()> {
        if self.output_path.as_os_str().is_empty() {
            return Err(CaptureError::Input("Missing file path".to_owned()));
        }
        if self.duration_seconds == 0 {
            return Err(CaptureError::Input(
                "Duration must be greater than zero".to_owned(),
            ));
        }
        if self.fps == 0 {
            return Err(CaptureError::Input("Frame rate must be greater than zero".to_owned()));
        }
        if self.bitrate_bps == 0 {
            return Err(CaptureError::Input("Bitrate must be greater than zero".to_owned()));
        }
        if self.target_height == Some(0) {
            return Err(CaptureError::Input(
                "Target height must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Duration cap in milliseconds.
    pub const fn max_duration_ms(&self) -> u64 {
        self.duration_seconds as u64 * 1000
    }

    /// Output path as given.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

/// Check that the directory `output_path` will be written into exists and
/// is writable.
pub fn check_output_dir(output_path: &Path) -> Result<()> {
    let dir = match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let metadata = std::fs::metadata(dir).map_err(|err| {
        CaptureError::Input(format!("Output directory {} is not accessible: {err}", dir.display()))
    })?;
    if !metadata.is_dir() {
        return Err(CaptureError::Input(format!(
            "Output path {} is not a directory",
            dir.display()
        )));
    }
    if metadata.permissions().readonly() {
        return Err(CaptureError::Input(format!(
            "Output directory {} is read-only",
            dir.display()
        )));
    }
    Ok(())
}
