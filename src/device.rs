//! V4L2 camera backend using the v4l crate.
//!
//! Opening and session configuration complete synchronously on V4L2, so the
//! outcome event is posted before the call returns and picked up on the next
//! loop iteration. Frames are pulled from an mmap stream on a dedicated
//! thread and pushed into the recorder's [`FrameSurface`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as _;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::encoder::{FfmpegRecorder, FrameSurface, Submit};
use crate::error::{CaptureError, Result};
use crate::event_loop::EventDispatcher;
use crate::traits::{
    CameraBackend, CameraDevice, CaptureCapabilities, CaptureRequest, CaptureSession,
    ExposureMode, FourCC, Frame, FrameMetadata, HardwareEvent, Size, RECORDER_ERROR_UNKNOWN,
};

/// `V4L2_CID_EXPOSURE_AUTO`.
const EXPOSURE_AUTO_CID: u32 = 0x009a_0901;
const EXPOSURE_AUTO: u32 = 0;
const EXPOSURE_MANUAL: u32 = 1;
const EXPOSURE_APERTURE_PRIORITY: u32 = 3;

/// `ENODEV`, reported once the device node is gone.
const ENODEV: i32 = 19;

/// How long a blocked dequeue waits before rechecking the stop flag.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Resolutions offered when the driver reports a stepwise range.
const STEPWISE_CANDIDATES: [Size; 5] = [
    Size::new(640, 480),
    Size::new(1280, 720),
    Size::new(1920, 1080),
    Size::new(2560, 1440),
    Size::new(3840, 2160),
];

/// Format the capture pipeline runs in.
const CAPTURE_FORMAT: FourCC = FourCC::YUYV;

/// Camera stack backed by `/dev/videoN` nodes and an ffmpeg encoder.
#[derive(Debug, Clone)]
pub struct V4L2Backend {
    buffer_count: u32,
    ffmpeg: PathBuf,
}

impl Default for V4L2Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl V4L2Backend {
    /// Backend using four capture buffers and `ffmpeg` from `PATH`.
    pub fn new() -> Self {
        Self {
            buffer_count: 4,
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }

    /// Use a specific encoder binary.
    #[must_use]
    pub fn with_ffmpeg(mut self, ffmpeg: PathBuf) -> Self {
        self.ffmpeg = ffmpeg;
        self
    }

}

impl CameraBackend for V4L2Backend {
    type Device = V4L2Camera;
    type Recorder = FfmpegRecorder;

    fn open(&mut self, camera_id: u32, events: EventDispatcher) -> Result<V4L2Camera> {
        let node = format!("/dev/video{camera_id}");
        if !Path::new(&node).exists() {
            return Err(CaptureError::Open(format!("No camera at {node}")));
        }

        let device = match open_capture_device(camera_id) {
            Ok(device) => {
                info!(camera_id, %node, "camera opened");
                events.dispatch(HardwareEvent::DeviceOpened);
                Some(Arc::new(device))
            }
            Err(err) => {
                warn!(camera_id, %node, error = %err, "camera open failed");
                events.dispatch(HardwareEvent::DeviceOpenFailed(
                    err.raw_os_error().unwrap_or(-1),
                ));
                None
            }
        };

        Ok(V4L2Camera {
            id: camera_id,
            device,
            buffer_count: self.buffer_count,
        })
    }

    fn new_recorder(&mut self, events: EventDispatcher) -> FfmpegRecorder {
        FfmpegRecorder::new(self.ffmpeg.clone(), events)
    }
}

fn open_capture_device(camera_id: u32) -> io::Result<Device> {
    let device = Device::new(camera_id as usize)?;
    let caps = device.query_caps()?;
    let flags = caps.capabilities;
    if !flags.contains(v4l::capability::Flags::VIDEO_CAPTURE)
        || !flags.contains(v4l::capability::Flags::STREAMING)
    {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} cannot stream video", caps.card),
        ));
    }
    debug!(driver = %caps.driver, card = %caps.card, bus = %caps.bus, "device capabilities");
    Ok(device)
}

/// An opened (or failed-to-open) V4L2 device.
pub struct V4L2Camera {
    id: u32,
    device: Option<Arc<Device>>,
    buffer_count: u32,
}

impl V4L2Camera {
    fn device(&self) -> Result<&Arc<Device>> {
        self.device
            .as_ref()
            .ok_or_else(|| CaptureError::Runtime(format!("Camera {} is not open", self.id)))
    }
}

/// Sizes for the capture format, expanding stepwise ranges into common
/// resolutions.
fn output_sizes(device: &Device) -> io::Result<Vec<Size>> {
    let mut sizes = Vec::new();
    for frame_size in device.enum_framesizes(CAPTURE_FORMAT.into())? {
        match frame_size.size {
            FrameSizeEnum::Discrete(discrete) => {
                sizes.push(Size::new(discrete.width, discrete.height));
            }
            FrameSizeEnum::Stepwise(step) => {
                sizes.extend(STEPWISE_CANDIDATES.iter().copied().filter(|size| {
                    (step.min_width..=step.max_width).contains(&size.width)
                        && (step.min_height..=step.max_height).contains(&size.height)
                }));
            }
        }
    }
    Ok(sizes)
}

/// Exposure modes exposed through the `EXPOSURE_AUTO` menu.
///
/// A device without the control manages exposure itself, which is `On`.
fn exposure_modes(device: &Device) -> Vec<ExposureMode> {
    let menu = match device.query_controls() {
        Ok(controls) => controls
            .into_iter()
            .find(|control| control.id == EXPOSURE_AUTO_CID)
            .and_then(|control| control.items),
        Err(err) => {
            debug!(error = %err, "cannot query controls");
            None
        }
    };
    let Some(items) = menu else {
        return vec![ExposureMode::On];
    };

    let values: Vec<u32> = items.into_iter().map(|(value, _)| value).collect();
    let mut modes = Vec::new();
    if values.contains(&EXPOSURE_MANUAL) {
        modes.push(ExposureMode::Off);
    }
    if values.contains(&EXPOSURE_AUTO) || values.contains(&EXPOSURE_APERTURE_PRIORITY) {
        modes.push(ExposureMode::On);
    }
    modes
}

impl CameraDevice for V4L2Camera {
    type Surface = FrameSurface;
    type Session = V4L2Session;

    fn id(&self) -> u32 {
        self.id
    }

    fn capabilities(&self) -> Result<CaptureCapabilities> {
        let device = self.device()?;
        Ok(CaptureCapabilities {
            exposure_modes: exposure_modes(device),
            output_sizes: output_sizes(device)?,
        })
    }

    fn create_session(
        &mut self,
        outputs: Vec<FrameSurface>,
        events: EventDispatcher,
    ) -> Result<V4L2Session> {
        let device = Arc::clone(self.device()?);
        let Some(surface) = outputs.into_iter().next() else {
            return Err(CaptureError::Config("No output surface".to_owned()));
        };

        let configured = configure_stream(&device, surface.size(), surface.frame_rate());
        match &configured {
            Ok(()) => {
                events.dispatch(HardwareEvent::SessionConfigured);
            }
            Err(err) => {
                warn!(camera_id = self.id, error = %err, "session configuration failed");
                events.dispatch(HardwareEvent::SessionConfigureFailed);
            }
        }

        Ok(V4L2Session {
            camera_id: self.id,
            device,
            buffer_count: self.buffer_count,
            events,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.device.take().is_some() {
            debug!(camera_id = self.id, "camera closed");
        }
        Ok(())
    }
}

fn configure_stream(device: &Device, size: Size, frame_rate: u32) -> io::Result<()> {
    let mut fmt = device.format()?;
    fmt.width = size.width;
    fmt.height = size.height;
    fmt.fourcc = CAPTURE_FORMAT.into();
    let fmt = device.set_format(&fmt)?;

    if fmt.width != size.width
        || fmt.height != size.height
        || FourCC::from(fmt.fourcc) != CAPTURE_FORMAT
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("driver chose {}x{} {}", fmt.width, fmt.height, fmt.fourcc),
        ));
    }

    if let Err(err) = device.set_params(&Parameters::with_fps(frame_rate)) {
        warn!(frame_rate, error = %err, "cannot set frame rate");
    }
    Ok(())
}

/// Repeating capture from a V4L2 device into a [`FrameSurface`].
pub struct V4L2Session {
    camera_id: u32,
    device: Arc<Device>,
    buffer_count: u32,
    events: EventDispatcher,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl V4L2Session {
    fn apply_exposure(&self, exposure: ExposureMode) {
        let value = match exposure {
            ExposureMode::Off => EXPOSURE_MANUAL,
            _ => EXPOSURE_AUTO,
        };
        let control = Control {
            id: EXPOSURE_AUTO_CID,
            value: Value::Integer(i64::from(value)),
        };
        if let Err(err) = self.device.set_control(control) {
            // Some drivers only offer aperture priority for automatic exposure.
            if exposure != ExposureMode::Off {
                let fallback = Control {
                    id: EXPOSURE_AUTO_CID,
                    value: Value::Integer(i64::from(EXPOSURE_APERTURE_PRIORITY)),
                };
                if self.device.set_control(fallback).is_ok() {
                    return;
                }
            }
            debug!(camera_id = self.camera_id, ?exposure, error = %err, "exposure control not applied");
        }
    }
}

impl CaptureSession for V4L2Session {
    type Surface = FrameSurface;

    fn set_repeating_request(&mut self, request: CaptureRequest<FrameSurface>) -> Result<()> {
        if self.worker.is_some() {
            return Err(CaptureError::Runtime("Repeating request already set".to_owned()));
        }
        debug!(camera_id = self.camera_id, template = ?request.template, exposure = ?request.exposure, "repeating request");
        self.apply_exposure(request.exposure);

        let device = Arc::clone(&self.device);
        let stop = Arc::clone(&self.stop);
        let events = self.events.clone();
        let buffer_count = self.buffer_count;
        let surface = request.target;
        let worker = thread::Builder::new()
            .name(format!("v4l2-capture-{}", self.camera_id))
            .spawn(move || capture_loop(&device, buffer_count, &surface, &stop, &events))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(camera_id = self.camera_id, "capture thread panicked");
            }
        }
    }
}

impl Drop for V4L2Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Event for a failed dequeue, or `None` when the read should be retried.
fn stream_error_event(err: &io::Error) -> Option<HardwareEvent> {
    if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) {
        return None;
    }
    Some(match err.raw_os_error() {
        Some(ENODEV) => HardwareEvent::DeviceDisconnected,
        code => HardwareEvent::RecorderError {
            what: RECORDER_ERROR_UNKNOWN,
            extra: code.unwrap_or(-1),
        },
    })
}

fn capture_loop(
    device: &Device,
    buffer_count: u32,
    surface: &FrameSurface,
    stop: &AtomicBool,
    events: &EventDispatcher,
) {
    let mut stream = match Stream::with_buffers(device, Type::VideoCapture, buffer_count) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "cannot start capture stream");
            events.dispatch(HardwareEvent::RecorderError {
                what: RECORDER_ERROR_UNKNOWN,
                extra: err.raw_os_error().unwrap_or(-1),
            });
            return;
        }
    };
    stream.set_timeout(DEQUEUE_TIMEOUT);

    let mut dropped: u64 = 0;
    while !stop.load(Ordering::Acquire) {
        let frame = match stream.next() {
            Ok((buf, meta)) => Frame {
                data: buf.get(..meta.bytesused as usize).unwrap_or(buf).to_vec(),
                metadata: FrameMetadata {
                    sequence: meta.sequence,
                },
            },
            Err(err) => match stream_error_event(&err) {
                None => continue,
                Some(event) => {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    match &event {
                        HardwareEvent::DeviceDisconnected => warn!("camera disconnected"),
                        _ => error!(error = %err, "capture stream error"),
                    }
                    events.dispatch(event);
                    break;
                }
            },
        };

        match surface.submit(frame) {
            Submit::Queued => {}
            Submit::Dropped => dropped += 1,
            Submit::Closed => break,
        }
    }
    debug!(dropped, "capture loop finished");
}
