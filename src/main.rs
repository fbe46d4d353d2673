//! Pi-cam-record binary: records one clip from a camera and exits.

use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pi_cam_record::request::{
    DEFAULT_BITRATE_BPS, DEFAULT_CODEC_LEVEL, DEFAULT_CODEC_PROFILE, DEFAULT_DURATION_SECONDS,
    DEFAULT_FPS,
};
use pi_cam_record::{
    check_output_dir, record, CaptureRequestSpec, DisconnectPolicy, ExposureMode, FocusMode,
    Orientation, Result, V4L2Backend, VideoCodec, WhiteBalanceMode,
};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Disconnect handling as spelled on the command line
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum OnDisconnect {
    #[default]
    Fail,
    Ignore,
}

impl From<OnDisconnect> for DisconnectPolicy {
    fn from(value: OnDisconnect) -> Self {
        match value {
            OnDisconnect::Fail => Self::Fail,
            OnDisconnect::Ignore => Self::Ignore,
        }
    }
}

/// Pi-cam-record command line arguments
#[derive(Parser, Debug)]
#[command(name = "pi-cam-record")]
#[command(version, about = "Record a video clip from a V4L2 camera", long_about = None)]
struct CliArgs {
    /// Output file; the extension selects the container (mp4, 3gp, webm, ts)
    #[arg(short = 'f', long, value_name = "PATH")]
    file: PathBuf,

    /// Camera index (N in /dev/videoN)
    #[arg(short = 'c', long, default_value_t = 0)]
    camera_id: u32,

    /// Recording length in seconds
    #[arg(short = 'd', long, default_value_t = DEFAULT_DURATION_SECONDS)]
    duration: u32,

    /// Frames per second
    #[arg(long, default_value_t = DEFAULT_FPS)]
    fps: u32,

    /// Encoder bitrate in bits per second
    #[arg(long, default_value_t = DEFAULT_BITRATE_BPS)]
    bitrate: u32,

    /// Preferred frame height; the largest supported size is used if absent
    #[arg(long, value_name = "HEIGHT")]
    resolution_y: Option<u32>,

    /// Video encoder (default, h264, h263, vp8, hevc)
    #[arg(long, default_value = "h264")]
    encoder: String,

    /// Encoder profile code
    #[arg(long, default_value_t = DEFAULT_CODEC_PROFILE)]
    encoder_profile: u32,

    /// Encoder level code
    #[arg(long, default_value_t = DEFAULT_CODEC_LEVEL)]
    encoder_level: u32,

    /// Auto-exposure mode code
    #[arg(long, default_value_t = 1)]
    auto_exposure: i32,

    /// Auto-focus mode code
    #[arg(long, default_value_t = 3)]
    auto_focus: i32,

    /// Auto-white-balance mode code
    #[arg(long, default_value_t = 1)]
    auto_white_balance: i32,

    /// Rotation hint in degrees (0, 90, 180, 270)
    #[arg(long, value_name = "DEGREES", allow_negative_numbers = true)]
    orientation: Option<i32>,

    /// What to do if the camera disconnects mid-recording
    #[arg(long, value_enum, default_value_t = OnDisconnect::Fail)]
    on_disconnect: OnDisconnect,

    /// Encoder binary
    #[arg(long, value_name = "PATH", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "warn")]
    log_level: LogLevel,

    /// Increase verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CliArgs {
    fn to_request(&self) -> Result<CaptureRequestSpec> {
        let mut spec = CaptureRequestSpec::new(self.file.clone());
        spec.camera_id = self.camera_id;
        spec.duration_seconds = self.duration;
        spec.fps = self.fps;
        spec.bitrate_bps = self.bitrate;
        spec.target_height = self.resolution_y;
        spec.codec = self.encoder.parse::<VideoCodec>()?;
        spec.codec_profile = self.encoder_profile;
        spec.codec_level = self.encoder_level;
        spec.auto_exposure_mode = ExposureMode::from_code(self.auto_exposure)?;
        spec.auto_focus_mode = FocusMode::from_code(self.auto_focus)?;
        spec.auto_white_balance_mode = WhiteBalanceMode::from_code(self.auto_white_balance)?;
        spec.orientation = self.orientation.map(Orientation::from_degrees).transpose()?;
        spec.disconnect_policy = self.on_disconnect.into();
        spec.validate()?;
        Ok(spec)
    }
}

/// One-line message for a command line that did not parse, or `None` for
/// help and version output.
fn cli_failure(err: &clap::Error) -> Option<String> {
    if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
        return None;
    }
    let rendered = err.to_string();
    let first = rendered.lines().next().unwrap_or_default();
    Some(first.trim_start_matches("error: ").to_owned())
}

fn main() {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(err) => match cli_failure(&err) {
            Some(message) => {
                println!("ERROR: {message}");
                std::process::exit(1);
            }
            None => err.exit(),
        },
    };
    init_logging(args.log_level, args.verbose);

    if let Err(err) = run(&args) {
        error!(kind = err.kind(), error = %err, "recording failed");
        println!("ERROR: {err}");
        std::process::exit(1);
    }
}

fn run(args: &CliArgs) -> Result<()> {
    let spec = args.to_request()?;
    check_output_dir(spec.output_path())?;

    let mut backend = V4L2Backend::new().with_ffmpeg(args.ffmpeg.clone());
    let recording = record(&mut backend, &spec)?;
    info!(
        path = %recording.output_path.display(),
        size = %recording.size,
        duration_ms = recording.duration_ms,
        "recording written"
    );
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Info,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "pi_cam_record=error",
        LogLevel::Warn => "pi_cam_record=warn",
        LogLevel::Info => "pi_cam_record=info",
        LogLevel::Verbose | LogLevel::Debug => "pi_cam_record=debug",
        LogLevel::Trace => "pi_cam_record=trace",
    };

    // RUST_LOG wins over the flags
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pi_cam_record::CaptureError;

    fn parse(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["pi-cam-record", "--file", "/tmp/clip.mp4"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).expect("arguments should parse")
    }

    #[test]
    fn test_defaults_match_request_defaults() {
        let spec = parse(&[]).to_request().expect("defaults are valid");
        assert_eq!(spec, CaptureRequestSpec::new("/tmp/clip.mp4"));
    }

    #[test]
    fn test_flags_map_onto_request() {
        let spec = parse(&[
            "--camera-id",
            "2",
            "--resolution-y",
            "720",
            "--encoder",
            "hevc",
            "--auto-exposure",
            "0",
            "--orientation",
            "180",
            "--on-disconnect",
            "ignore",
        ])
        .to_request()
        .expect("flags are valid");
        assert_eq!(spec.camera_id, 2);
        assert_eq!(spec.target_height, Some(720));
        assert_eq!(spec.codec, VideoCodec::Hevc);
        assert_eq!(spec.auto_exposure_mode, ExposureMode::Off);
        assert_eq!(spec.orientation, Some(Orientation::Deg180));
        assert_eq!(spec.disconnect_policy, DisconnectPolicy::Ignore);
    }

    #[test]
    fn test_bad_values_are_input_errors() {
        for extra in [
            ["--orientation", "45"],
            ["--encoder", "av1"],
            ["--auto-focus", "9"],
            ["--fps", "0"],
        ] {
            let err = parse(&extra).to_request().expect_err("value is invalid");
            assert!(matches!(err, CaptureError::Input(_)), "{extra:?}: {err}");
        }
    }

    #[test]
    fn test_file_is_required() {
        assert!(CliArgs::try_parse_from(["pi-cam-record"]).is_err());
    }

    #[test]
    fn test_malformed_values_become_one_error_line() {
        for extra in [
            ["--fps", "abc"],
            ["--duration", "-1"],
            ["--camera-id", "x"],
            ["--resolution-y", "foo"],
        ] {
            let mut argv = vec!["pi-cam-record", "--file", "/tmp/clip.mp4"];
            argv.extend_from_slice(&extra);
            let err = CliArgs::try_parse_from(argv).expect_err("value is malformed");
            let message = cli_failure(&err).expect("parse errors are reported");
            assert!(!message.is_empty(), "{extra:?}");
            assert!(!message.contains('\n'), "{extra:?}: {message}");
            assert!(!message.starts_with("error:"), "{extra:?}: {message}");
        }
    }

    #[test]
    fn test_help_is_not_an_error() {
        let err = CliArgs::try_parse_from(["pi-cam-record", "--help"]).expect_err("help exits");
        assert!(cli_failure(&err).is_none());
    }
}
