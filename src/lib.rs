//! Pi-Cam-Record: one-shot video recording from a V4L2 camera.
//!
//! A recording invocation opens a camera, negotiates a capture session that
//! feeds an encoder, records for a fixed duration and releases everything
//! exactly once. The lifecycle is an explicit state machine driven by
//! [`HardwareEvent`]s on a per-invocation event loop, with trait-based
//! backends so the whole flow runs against a mock in tests.

pub mod acquirer;
pub mod device;
pub mod encoder;
pub mod error;
pub mod event_loop;
pub mod recorder;
pub mod request;
pub mod selector;
pub mod session;
pub mod teardown;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use device::V4L2Backend;
pub use error::{CaptureError, Result};
pub use recorder::{ContainerFormat, RecorderConfig};
pub use request::{
    check_output_dir, CaptureRequestSpec, DisconnectPolicy, Orientation, VideoCodec,
};
pub use session::{record, CaptureState, Recording, SessionCoordinator};
pub use traits::{
    CameraBackend, CameraDevice, CaptureSession, ExposureMode, FocusMode, HardwareEvent,
    RecordingSink, Size, WhiteBalanceMode,
};
