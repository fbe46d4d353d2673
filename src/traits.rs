//! Core traits and types for the camera recording abstraction.
//!
//! A backend supplies three independently-owned resources: the camera
//! device, the capture session it creates, and the recording sink that
//! consumes frames through a surface. Their asynchronous completions are
//! reported as [`HardwareEvent`]s through an [`EventDispatcher`] and never
//! through callbacks into shared state.

use std::fmt;

use crate::error::{CaptureError, Result};
use crate::event_loop::EventDispatcher;
use crate::recorder::RecorderConfig;

/// Pixel format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Output size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Create a new size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count, widened so large sensors cannot overflow.
    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

macro_rules! control_mode {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $($(#[$vmeta:meta])* $variant:ident = $code:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Numeric camera-control code of this mode.
            #[must_use]
            pub const fn code(self) -> i32 {
                match self {
                    $(Self::$variant => $code,)+
                }
            }

            /// Parse a numeric camera-control code.
            pub fn from_code(code: i32) -> Result<Self> {
                match code {
                    $($code => Ok(Self::$variant),)+
                    other => Err(CaptureError::Input(format!(
                        concat!("Invalid ", $label, ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

control_mode! {
    /// Auto-exposure control mode.
    ExposureMode, "auto exposure mode" {
        /// Manual exposure.
        Off = 0,
        /// Automatic exposure, flash never fired.
        On = 1,
        /// Automatic exposure with automatic flash.
        OnAutoFlash = 2,
        /// Automatic exposure with flash always fired.
        OnAlwaysFlash = 3,
        /// Automatic flash with red-eye reduction.
        OnAutoFlashRedeye = 4,
        /// Automatic exposure driven by an external flash.
        OnExternalFlash = 5,
    }
}

control_mode! {
    /// Auto-focus control mode.
    FocusMode, "auto focus mode" {
        /// Manual focus.
        Off = 0,
        /// Single-shot auto focus.
        Auto = 1,
        /// Close-up auto focus.
        Macro = 2,
        /// Continuous focus tuned for video.
        ContinuousVideo = 3,
        /// Continuous focus tuned for stills.
        ContinuousPicture = 4,
        /// Extended depth of field.
        Edof = 5,
    }
}

control_mode! {
    /// Auto-white-balance control mode.
    WhiteBalanceMode, "auto white balance mode" {
        /// Manual white balance.
        Off = 0,
        /// Automatic white balance.
        Auto = 1,
        /// Incandescent preset.
        Incandescent = 2,
        /// Fluorescent preset.
        Fluorescent = 3,
        /// Warm fluorescent preset.
        WarmFluorescent = 4,
        /// Daylight preset.
        Daylight = 5,
        /// Cloudy daylight preset.
        CloudyDaylight = 6,
        /// Twilight preset.
        Twilight = 7,
        /// Shade preset.
        Shade = 8,
    }
}

/// What a device can do, queried once per invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureCapabilities {
    /// Supported auto-exposure modes.
    pub exposure_modes: Vec<ExposureMode>,
    /// Supported output sizes for the reference capture format, in driver order.
    pub output_sizes: Vec<Size>,
}

/// Template a capture request is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    /// Stable frame rate defaults for video recording.
    Record,
}

/// A capture instruction reissued for every frame.
#[derive(Debug, Clone)]
pub struct CaptureRequest<S> {
    /// Template the defaults come from.
    pub template: RequestTemplate,
    /// Surface frames are delivered to.
    pub target: S,
    /// Exposure mode override.
    pub exposure: ExposureMode,
}

/// Recorder info code: the configured duration cap was reached.
pub const RECORDER_INFO_MAX_DURATION_REACHED: i32 = 800;
/// Recorder info code: the configured file size cap was reached.
pub const RECORDER_INFO_MAX_FILESIZE_REACHED: i32 = 801;
/// Recorder error code: unspecified failure.
pub const RECORDER_ERROR_UNKNOWN: i32 = 1;
/// Recorder error code: the encoding process died.
pub const RECORDER_ERROR_SERVER_DIED: i32 = 100;

/// Asynchronous notification from the hardware, delivered on the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    /// The pending device finished opening.
    DeviceOpened,
    /// The pending device failed to open with the given code.
    DeviceOpenFailed(i32),
    /// The device was disconnected.
    DeviceDisconnected,
    /// The pending capture session was configured.
    SessionConfigured,
    /// The capture session could not be configured.
    SessionConfigureFailed,
    /// The recording sink reported an error.
    RecorderError {
        /// Error code.
        what: i32,
        /// Implementation-specific detail code.
        extra: i32,
    },
    /// The recording sink reported an informational event.
    RecorderInfo {
        /// Info code.
        what: i32,
        /// Implementation-specific detail code.
        extra: i32,
    },
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
}

/// A captured video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Entry point into a camera stack.
pub trait CameraBackend {
    /// Device handle type.
    type Device: CameraDevice<Surface = <Self::Recorder as RecordingSink>::Surface>;
    /// Recording sink type.
    type Recorder: RecordingSink;

    /// Request the device to open.
    ///
    /// Returns a pending handle; the outcome arrives later as
    /// [`HardwareEvent::DeviceOpened`] or [`HardwareEvent::DeviceOpenFailed`].
    /// An `Err` means the request itself was refused and no handle exists.
    fn open(&mut self, camera_id: u32, events: EventDispatcher) -> Result<Self::Device>;

    /// Create an unconfigured recording sink whose observers post to `events`.
    fn new_recorder(&mut self, events: EventDispatcher) -> Self::Recorder;
}

/// Abstraction over an exclusive camera device handle.
pub trait CameraDevice {
    /// Surface type frames are delivered through.
    type Surface: Clone;
    /// Capture session type.
    type Session: CaptureSession<Surface = Self::Surface>;

    /// Camera identifier.
    fn id(&self) -> u32;

    /// Query supported exposure modes and output sizes.
    fn capabilities(&self) -> Result<CaptureCapabilities>;

    /// Create a capture session over `outputs`.
    ///
    /// Returns the pending session; the outcome arrives later as
    /// [`HardwareEvent::SessionConfigured`] or
    /// [`HardwareEvent::SessionConfigureFailed`].
    fn create_session(
        &mut self,
        outputs: Vec<Self::Surface>,
        events: EventDispatcher,
    ) -> Result<Self::Session>;

    /// Close the device. Also valid on a handle whose open failed.
    fn close(&mut self) -> Result<()>;
}

/// Abstraction over a capture session.
pub trait CaptureSession {
    /// Surface type the session writes to.
    type Surface;

    /// Start a repeating request. There is no per-frame completion callback.
    fn set_repeating_request(&mut self, request: CaptureRequest<Self::Surface>) -> Result<()>;

    /// Stop the repeating request and close the session.
    fn close(&mut self);
}

/// Abstraction over an encoding/muxing sink.
pub trait RecordingSink {
    /// Surface type the sink consumes.
    type Surface: Clone;

    /// Apply `config` and allocate encoder resources.
    fn prepare(&mut self, config: &RecorderConfig) -> Result<()>;

    /// Input surface, available once prepared.
    fn surface(&self) -> Option<Self::Surface>;

    /// Start consuming frames.
    fn start(&mut self) -> Result<()>;

    /// Stop consuming frames and finalize the output file.
    fn stop(&mut self) -> Result<()>;

    /// Release every resource held by the sink. Safe to call more than once.
    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_area_does_not_overflow() {
        let size = Size::new(u32::MAX, 2);
        assert_eq!(size.area(), u64::from(u32::MAX) * 2);
    }

    #[test]
    fn test_mode_codes_round_trip_known_values() {
        assert_eq!(ExposureMode::from_code(1).expect("valid code"), ExposureMode::On);
        assert_eq!(FocusMode::ContinuousVideo.code(), 3);
        assert_eq!(WhiteBalanceMode::from_code(8).expect("valid code"), WhiteBalanceMode::Shade);
    }

    #[test]
    fn test_mode_unknown_code_is_input_error() {
        let err = FocusMode::from_code(42).expect_err("42 is not a focus mode");
        assert!(matches!(err, CaptureError::Input(_)));
        assert_eq!(err.to_string(), "Invalid auto focus mode: 42");
    }
}
