//! Recording sink backed by an `ffmpeg` child process.
//!
//! Raw YUYV frames arrive through a [`FrameSurface`], a bounded queue that
//! drops frames instead of blocking the capture thread. A writer thread
//! drains the queue into ffmpeg's stdin and reports the duration cap or a
//! broken pipe back to the event loop.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::error::{CaptureError, Result};
use crate::event_loop::EventDispatcher;
use crate::recorder::{ContainerFormat, RecorderConfig};
use crate::request::VideoCodec;
use crate::traits::{
    Frame, HardwareEvent, RecordingSink, Size, RECORDER_ERROR_SERVER_DIED,
    RECORDER_ERROR_UNKNOWN, RECORDER_INFO_MAX_DURATION_REACHED,
};

/// Frames buffered between the capture thread and the encoder.
const FRAME_QUEUE_DEPTH: usize = 4;
/// How often the writer checks for a stop request while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Frame sizes the H.263 encoder accepts.
const H263_SIZES: [Size; 5] = [
    Size::new(128, 96),
    Size::new(176, 144),
    Size::new(352, 288),
    Size::new(704, 576),
    Size::new(1408, 1152),
];

/// Outcome of handing a frame to a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// The frame was queued.
    Queued,
    /// The queue was full and the frame was dropped.
    Dropped,
    /// The consumer is gone.
    Closed,
}

/// Input side of the recorder, handed to the capture session.
#[derive(Debug, Clone)]
pub struct FrameSurface {
    tx: SyncSender<Frame>,
    size: Size,
    frame_rate: u32,
}

impl FrameSurface {
    /// Frame size the recorder expects.
    pub const fn size(&self) -> Size {
        self.size
    }

    /// Frame rate the recorder encodes at.
    pub const fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    /// Queue a frame without blocking.
    pub fn submit(&self, frame: Frame) -> Submit {
        match self.tx.try_send(frame) {
            Ok(()) => Submit::Queued,
            Err(TrySendError::Full(frame)) => {
                trace!(sequence = frame.metadata.sequence, "surface full, dropping frame");
                Submit::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Submit::Closed,
        }
    }
}

/// Argument list for one ffmpeg invocation.
#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    output_path: PathBuf,
    muxer: &'static str,
    video_codec: &'static str,
    size: Size,
    framerate: u32,
    bitrate: u32,
    duration_ms: u64,
    profile: Option<&'static str>,
    level: Option<&'static str>,
    rotation: Option<u32>,
}

impl FfmpegCommandBuilder {
    /// Builder writing `muxer` output to `output_path`.
    pub fn new(output_path: &Path, muxer: &'static str, video_codec: &'static str) -> Self {
        Self {
            output_path: output_path.to_path_buf(),
            muxer,
            video_codec,
            size: Size::new(640, 480),
            framerate: 30,
            bitrate: 5_000_000,
            duration_ms: 5000,
            profile: None,
            level: None,
            rotation: None,
        }
    }

    /// Input and output frame size.
    #[must_use]
    pub const fn with_size(mut self, size: Size) -> Self {
        self.size = size;
        self
    }

    /// Input and output frame rate.
    #[must_use]
    pub const fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    /// Target bitrate in bits per second.
    #[must_use]
    pub const fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Hard duration limit.
    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Encoder profile.
    #[must_use]
    pub const fn with_profile(mut self, profile: Option<&'static str>) -> Self {
        self.profile = profile;
        self
    }

    /// Encoder level.
    #[must_use]
    pub const fn with_level(mut self, level: Option<&'static str>) -> Self {
        self.level = level;
        self
    }

    /// Rotation metadata in degrees.
    #[must_use]
    pub const fn with_rotation(mut self, rotation: Option<u32>) -> Self {
        self.rotation = rotation;
        self
    }

    /// Render the argument list.
    pub fn build(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-nostdin",
            "-y",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "yuyv422",
        ]
        .iter()
        .map(|arg| (*arg).to_owned())
        .collect();

        args.extend([
            "-video_size".to_owned(),
            self.size.to_string(),
            "-framerate".to_owned(),
            self.framerate.to_string(),
            "-i".to_owned(),
            "pipe:0".to_owned(),
            "-an".to_owned(),
            "-c:v".to_owned(),
            self.video_codec.to_owned(),
            "-b:v".to_owned(),
            self.bitrate.to_string(),
            "-r".to_owned(),
            self.framerate.to_string(),
            "-pix_fmt".to_owned(),
            "yuv420p".to_owned(),
        ]);

        if let Some(profile) = self.profile {
            args.extend(["-profile:v".to_owned(), profile.to_owned()]);
        }
        if let Some(level) = self.level {
            args.extend(["-level:v".to_owned(), level.to_owned()]);
        }
        if let Some(rotation) = self.rotation {
            args.extend(["-metadata:s:v:0".to_owned(), format!("rotate={rotation}")]);
        }

        args.extend([
            "-t".to_owned(),
            format!("{}.{:03}", self.duration_ms / 1000, self.duration_ms % 1000),
            "-f".to_owned(),
            self.muxer.to_owned(),
            self.output_path.to_string_lossy().into_owned(),
        ]);
        args
    }
}

const fn muxer_name(container: ContainerFormat) -> &'static str {
    match container {
        ContainerFormat::Mpeg4 => "mp4",
        ContainerFormat::ThreeGpp => "3gp",
        ContainerFormat::Webm => "webm",
        ContainerFormat::Mpeg2Ts => "mpegts",
    }
}

/// Concrete codec for `codec` in `container`, checking the pairing.
pub fn resolve_codec(codec: VideoCodec, container: ContainerFormat) -> Result<VideoCodec> {
    let resolved = match (codec, container) {
        (VideoCodec::Default, ContainerFormat::Webm) => VideoCodec::Vp8,
        (VideoCodec::Default, _) => VideoCodec::H264,
        (other, _) => other,
    };

    let supported = match container {
        ContainerFormat::Mpeg4 => {
            matches!(resolved, VideoCodec::H264 | VideoCodec::Hevc | VideoCodec::H263)
        }
        ContainerFormat::ThreeGpp => matches!(resolved, VideoCodec::H264 | VideoCodec::H263),
        ContainerFormat::Webm => resolved == VideoCodec::Vp8,
        ContainerFormat::Mpeg2Ts => matches!(resolved, VideoCodec::H264 | VideoCodec::Hevc),
    };
    if supported {
        Ok(resolved)
    } else {
        Err(CaptureError::Config(format!(
            "{resolved} is not supported in {container}"
        )))
    }
}

const fn encoder_name(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::Default | VideoCodec::H264 => "libx264",
        VideoCodec::H263 => "h263",
        VideoCodec::Vp8 => "libvpx",
        VideoCodec::Hevc => "libx265",
    }
}

/// Encoder profile name for a profile code.
pub fn profile_name(codec: VideoCodec, profile: u32) -> Result<Option<&'static str>> {
    let name = match (codec, profile) {
        (VideoCodec::Default | VideoCodec::H264, 0x01) => "baseline",
        (VideoCodec::Default | VideoCodec::H264, 0x02) => "main",
        (VideoCodec::Default | VideoCodec::H264, 0x08) => "high",
        (VideoCodec::Hevc, 0x01) => "main",
        (VideoCodec::Hevc, 0x02) => "main10",
        (VideoCodec::H263 | VideoCodec::Vp8, _) => return Ok(None),
        (codec, profile) => {
            return Err(CaptureError::Config(format!(
                "Unsupported {codec} profile: {profile}"
            )))
        }
    };
    Ok(Some(name))
}

/// Encoder level name for a level code.
pub fn level_name(codec: VideoCodec, level: u32) -> Result<Option<&'static str>> {
    let name = match codec {
        VideoCodec::Default | VideoCodec::H264 => match level {
            0x01 => "1",
            0x02 => "1b",
            0x04 => "1.1",
            0x08 => "1.2",
            0x10 => "1.3",
            0x20 => "2",
            0x40 => "2.1",
            0x80 => "2.2",
            0x100 => "3",
            0x200 => "3.1",
            0x400 => "3.2",
            0x800 => "4",
            0x1000 => "4.1",
            0x2000 => "4.2",
            0x4000 => "5",
            0x8000 => "5.1",
            0x10000 => "5.2",
            _ => return Ok(None),
        },
        VideoCodec::Hevc => match level {
            0x01 => "1",
            0x04 => "2",
            0x10 => "2.1",
            0x40 => "3",
            0x100 => "3.1",
            0x400 => "4",
            0x1000 => "4.1",
            0x4000 => "5",
            0x10000 => "5.1",
            0x40000 => "5.2",
            _ => return Ok(None),
        },
        VideoCodec::H263 | VideoCodec::Vp8 => return Ok(None),
    };
    Ok(Some(name))
}

/// Why the writer thread stopped.
#[derive(Debug)]
pub enum WriterExit {
    /// The duration cap was reached.
    DurationReached,
    /// Writing to the encoder failed.
    WriteFailed(io::Error),
    /// A stop was requested.
    Stopped,
    /// Every surface was dropped before the cap.
    SurfaceClosed,
}

impl WriterExit {
    /// Event the loop must see for this exit. A requested stop needs none.
    pub fn event(&self) -> Option<HardwareEvent> {
        match self {
            Self::DurationReached => Some(HardwareEvent::RecorderInfo {
                what: RECORDER_INFO_MAX_DURATION_REACHED,
                extra: 0,
            }),
            Self::WriteFailed(err) => Some(HardwareEvent::RecorderError {
                what: RECORDER_ERROR_SERVER_DIED,
                extra: err.raw_os_error().unwrap_or(0),
            }),
            Self::SurfaceClosed => Some(HardwareEvent::RecorderError {
                what: RECORDER_ERROR_UNKNOWN,
                extra: 0,
            }),
            Self::Stopped => None,
        }
    }
}

/// Drain `frames` into `sink` until the cap, a stop request, or an error.
///
/// Elapsed time is counted in frames at `frame_rate`, which is also the
/// encoder's input rate, so the cap matches the output duration.
pub fn write_frames<W: Write>(
    frames: &Receiver<Frame>,
    sink: &mut W,
    frame_size: usize,
    frame_rate: u32,
    max_duration_ms: u64,
    stop: &AtomicBool,
) -> WriterExit {
    let mut written: u64 = 0;
    loop {
        if stop.load(Ordering::Acquire) {
            return WriterExit::Stopped;
        }
        if written.saturating_mul(1000) >= max_duration_ms.saturating_mul(u64::from(frame_rate)) {
            return WriterExit::DurationReached;
        }

        let frame = match frames.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return WriterExit::SurfaceClosed,
        };

        let Some(data) = frame.data.get(..frame_size) else {
            warn!(
                sequence = frame.metadata.sequence,
                len = frame.data.len(),
                expected = frame_size,
                "short frame, skipping"
            );
            continue;
        };
        if let Err(err) = sink.write_all(data) {
            return WriterExit::WriteFailed(err);
        }
        written += 1;
    }
}

struct Prepared {
    child: Child,
    frames: Receiver<Frame>,
    surface: FrameSurface,
    frame_size: usize,
    max_duration_ms: u64,
}

/// Recording sink encoding through ffmpeg.
pub struct FfmpegRecorder {
    program: PathBuf,
    events: EventDispatcher,
    stop: Arc<AtomicBool>,
    prepared: Option<Prepared>,
    child: Option<Child>,
    writer: Option<JoinHandle<()>>,
}

impl FfmpegRecorder {
    /// Unprepared recorder running `program`, posting events to `events`.
    pub fn new(program: PathBuf, events: EventDispatcher) -> Self {
        Self {
            program,
            events,
            stop: Arc::new(AtomicBool::new(false)),
            prepared: None,
            child: None,
            writer: None,
        }
    }

    fn command_for(config: &RecorderConfig) -> Result<FfmpegCommandBuilder> {
        let codec = resolve_codec(config.codec, config.container)?;
        if codec == VideoCodec::H263 && !H263_SIZES.contains(&config.size) {
            return Err(CaptureError::Config(format!(
                "h263 does not support {}",
                config.size
            )));
        }
        let profile = profile_name(codec, config.codec_profile)?;
        let level = level_name(codec, config.codec_level)?;
        if level.is_none() && matches!(codec, VideoCodec::H264 | VideoCodec::Hevc) {
            return Err(CaptureError::Config(format!(
                "Unsupported {codec} level: {}",
                config.codec_level
            )));
        }

        let rotation = match config.container {
            ContainerFormat::Mpeg4 | ContainerFormat::ThreeGpp => {
                config.orientation_hint.map(|hint| hint.degrees())
            }
            ContainerFormat::Webm | ContainerFormat::Mpeg2Ts => {
                if config.orientation_hint.is_some() {
                    debug!(container = %config.container, "orientation hint not supported, ignoring");
                }
                None
            }
        };

        Ok(
            FfmpegCommandBuilder::new(
                &config.output_path,
                muxer_name(config.container),
                encoder_name(codec),
            )
            .with_size(config.size)
            .with_framerate(config.frame_rate)
            .with_bitrate(config.bitrate_bps)
            .with_duration_ms(config.max_duration_ms)
            .with_profile(profile)
            .with_level(level)
            .with_rotation(rotation),
        )
    }

    fn shutdown_writer(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("recorder writer thread panicked");
            }
        }
    }
}

impl RecordingSink for FfmpegRecorder {
    type Surface = FrameSurface;

    fn prepare(&mut self, config: &RecorderConfig) -> Result<()> {
        if self.prepared.is_some() || self.child.is_some() {
            return Err(CaptureError::Config("Recorder already prepared".to_owned()));
        }
        let args = Self::command_for(config)?.build();
        let frame_size = usize::try_from(config.size.area() * 2).map_err(|_| {
            CaptureError::Config(format!("Frame size {} is too large", config.size))
        })?;
        debug!(program = %self.program.display(), ?args, "spawning encoder");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                CaptureError::Config(format!("Could not start {}: {err}", self.program.display()))
            })?;

        let (tx, frames) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
        let surface = FrameSurface {
            tx,
            size: config.size,
            frame_rate: config.capture_rate,
        };

        self.prepared = Some(Prepared {
            child,
            frames,
            surface,
            frame_size,
            max_duration_ms: config.max_duration_ms,
        });
        Ok(())
    }

    fn surface(&self) -> Option<FrameSurface> {
        self.prepared.as_ref().map(|prepared| prepared.surface.clone())
    }

    fn start(&mut self) -> Result<()> {
        let Some(Prepared {
            mut child,
            frames,
            surface,
            frame_size,
            max_duration_ms,
        }) = self.prepared.take()
        else {
            return Err(CaptureError::Runtime("Recorder not prepared".to_owned()));
        };
        let frame_rate = surface.frame_rate();
        drop(surface);

        let Some(stdin) = child.stdin.take() else {
            self.child = Some(child);
            return Err(CaptureError::Runtime("Encoder stdin unavailable".to_owned()));
        };
        self.child = Some(child);

        let stop = Arc::clone(&self.stop);
        let events = self.events.clone();
        let writer = thread::Builder::new()
            .name("recorder-writer".to_owned())
            .spawn(move || {
                run_writer(&frames, stdin, frame_size, frame_rate, max_duration_ms, &stop, &events);
            })?;
        self.writer = Some(writer);
        info!("recorder started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.writer.is_none() {
            return Err(CaptureError::Runtime("Recorder not started".to_owned()));
        }
        self.shutdown_writer();

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        if status.success() {
            info!("recorder stopped");
            Ok(())
        } else {
            Err(CaptureError::Runtime(format!("Encoder exited with {status}")))
        }
    }

    fn release(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(prepared) = self.prepared.take() {
            self.child = Some(prepared.child);
        }
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.kill() {
                debug!(error = %err, "encoder already exited");
            }
        }
        self.shutdown_writer();
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.wait() {
                warn!(error = %err, "failed to reap encoder");
            }
        }
        debug!("recorder released");
    }
}

impl Drop for FfmpegRecorder {
    fn drop(&mut self) {
        self.release();
    }
}

fn run_writer<W: Write>(
    frames: &Receiver<Frame>,
    mut sink: W,
    frame_size: usize,
    frame_rate: u32,
    max_duration_ms: u64,
    stop: &AtomicBool,
    events: &EventDispatcher,
) {
    let exit = write_frames(frames, &mut sink, frame_size, frame_rate, max_duration_ms, stop);
    match &exit {
        WriterExit::SurfaceClosed => warn!("recorder input closed before the duration cap"),
        _ => debug!(?exit, "recorder writer finished"),
    }
    if let Some(event) = exit.event() {
        events.dispatch(event);
    }
    drop(sink);
}
