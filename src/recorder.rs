//! Recording sink configuration.
//!
//! Resolves the container from the output file name and binds the request's
//! encoder settings to a freshly created sink. The sink records video from a
//! hardware surface only; there is no audio track.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::error::{CaptureError, Result};
use crate::event_loop::EventDispatcher;
use crate::request::{CaptureRequestSpec, Orientation, VideoCodec};
use crate::traits::{CameraBackend, RecordingSink, Size};

/// Output container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// MPEG-4 Part 14.
    Mpeg4,
    /// 3GPP.
    ThreeGpp,
    /// WebM.
    Webm,
    /// MPEG-2 transport stream.
    Mpeg2Ts,
}

impl ContainerFormat {
    /// Container for a file extension. Matching is case-sensitive.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "mp4" => Some(Self::Mpeg4),
            "3gp" => Some(Self::ThreeGpp),
            "webm" => Some(Self::Webm),
            "ts" => Some(Self::Mpeg2Ts),
            _ => None,
        }
    }

    /// Container for an output path.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = extension_of(path);
        Self::from_extension(&extension)
            .ok_or_else(|| CaptureError::Config(format!("Unknown extension: {extension}")))
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mpeg4 => "MPEG-4",
            Self::ThreeGpp => "3GPP",
            Self::Webm => "WebM",
            Self::Mpeg2Ts => "MPEG-2 TS",
        })
    }
}

/// Text after the last `.` of the file name, or the whole file name if it
/// has no dot.
fn extension_of(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.rsplit_once('.') {
        Some((_, extension)) => extension.to_owned(),
        None => name,
    }
}

/// Everything a sink needs to encode one recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderConfig {
    /// Output file.
    pub output_path: PathBuf,
    /// Container format.
    pub container: ContainerFormat,
    /// Duration cap in milliseconds.
    pub max_duration_ms: u64,
    /// Encoder bitrate in bits per second.
    pub bitrate_bps: u32,
    /// Playback frame rate.
    pub frame_rate: u32,
    /// Capture rate. Equal to the frame rate so that time runs at real speed.
    pub capture_rate: u32,
    /// Video size.
    pub size: Size,
    /// Rotation hint written into the container.
    pub orientation_hint: Option<Orientation>,
    /// Video encoder.
    pub codec: VideoCodec,
    /// Encoder profile code.
    pub codec_profile: u32,
    /// Encoder level code.
    pub codec_level: u32,
}

impl RecorderConfig {
    /// Build the sink settings for `spec` at the selected `size`.
    pub fn from_request(spec: &CaptureRequestSpec, size: Size) -> Result<Self> {
        let container = ContainerFormat::from_path(&spec.output_path)?;
        Ok(Self {
            output_path: spec.output_path.clone(),
            container,
            max_duration_ms: spec.max_duration_ms(),
            bitrate_bps: spec.bitrate_bps,
            frame_rate: spec.fps,
            capture_rate: spec.fps,
            size,
            orientation_hint: spec.orientation,
            codec: spec.codec,
            codec_profile: spec.codec_profile,
            codec_level: spec.codec_level,
        })
    }
}

/// Create and prepare the recording sink.
///
/// On failure no sink survives: a sink that was created but failed to
/// prepare is released here.
pub fn configure<B: CameraBackend>(
    backend: &mut B,
    spec: &CaptureRequestSpec,
    size: Size,
    events: EventDispatcher,
) -> Result<B::Recorder> {
    let config = RecorderConfig::from_request(spec, size)?;
    info!(
        container = %config.container,
        codec = %config.codec,
        %size,
        max_duration_ms = config.max_duration_ms,
        "configuring recorder"
    );

    let mut recorder = backend.new_recorder(events);
    if let Err(err) = recorder.prepare(&config) {
        error!(error = %err, "error preparing recorder");
        recorder.release();
        return Err(CaptureError::Config(format!("Error preparing recorder: {err}")));
    }
    Ok(recorder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::mock::{Call, MockBackend};

    #[test]
    fn test_extension_table() {
        let cases = [
            ("clip.mp4", ContainerFormat::Mpeg4),
            ("clip.3gp", ContainerFormat::ThreeGpp),
            ("clip.webm", ContainerFormat::Webm),
            ("a.b.ts", ContainerFormat::Mpeg2Ts),
        ];
        for (name, expected) in cases {
            assert_eq!(
                ContainerFormat::from_path(Path::new(name)).expect("known extension"),
                expected
            );
        }
    }

    #[test]
    fn test_unknown_extension() {
        let err = ContainerFormat::from_path(Path::new("/tmp/clip.xyz"))
            .expect_err("xyz is not a container");
        assert!(matches!(err, CaptureError::Config(_)));
        assert_eq!(err.to_string(), "Unknown extension: xyz");
    }

    #[test]
    fn test_extension_is_case_sensitive() {
        let err = ContainerFormat::from_path(Path::new("clip.MP4")).expect_err("upper case");
        assert_eq!(err.to_string(), "Unknown extension: MP4");
    }

    #[test]
    fn test_file_name_without_dot_is_the_extension() {
        let err = ContainerFormat::from_path(Path::new("/videos.d/clip")).expect_err("no dot");
        assert_eq!(err.to_string(), "Unknown extension: clip");
    }

    #[test]
    fn test_config_from_request() {
        let mut spec = CaptureRequestSpec::new("/tmp/clip.webm");
        spec.fps = 24;
        spec.codec = VideoCodec::Vp8;
        spec.orientation = Some(Orientation::Deg90);

        let config = RecorderConfig::from_request(&spec, Size::new(1280, 720))
            .expect("config should build");
        assert_eq!(config.container, ContainerFormat::Webm);
        assert_eq!(config.max_duration_ms, 5000);
        assert_eq!(config.frame_rate, 24);
        assert_eq!(config.capture_rate, 24);
        assert_eq!(config.orientation_hint, Some(Orientation::Deg90));
        assert_eq!(config.size, Size::new(1280, 720));
    }

    #[test]
    fn test_configure_unknown_extension_creates_no_sink() {
        let event_loop = EventLoop::new().expect("runtime should build");
        let mut backend = MockBackend::new();
        let spec = CaptureRequestSpec::new("clip.xyz");

        let result = configure(&mut backend, &spec, Size::new(640, 480), event_loop.dispatcher());
        assert!(matches!(result, Err(CaptureError::Config(_))));
        assert_eq!(backend.journal().count(&Call::NewRecorder), 0);
    }

    #[test]
    fn test_configure_prepare_failure_releases_sink() {
        let event_loop = EventLoop::new().expect("runtime should build");
        let mut backend = MockBackend::new().with_prepare_error("profile not supported");
        let spec = CaptureRequestSpec::new("clip.mp4");

        let err = configure(&mut backend, &spec, Size::new(640, 480), event_loop.dispatcher())
            .err()
            .expect("prepare should fail");
        assert_eq!(err.to_string(), "Error preparing recorder: profile not supported");
        let journal = backend.journal();
        assert_eq!(journal.count(&Call::Prepare), 1);
        assert_eq!(journal.count(&Call::ReleaseRecorder), 1);
    }
}
