//! Device acquisition.
//!
//! Opening is a two-step affair: the backend accepts the request and hands
//! back a pending handle, then reports the actual outcome on the event loop.

use tracing::{error, info, warn};

use crate::error::{CaptureError, Result};
use crate::event_loop::EventDispatcher;
use crate::traits::{CameraBackend, HardwareEvent};

/// Result of an open request, decoded from the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The device is ready.
    Opened,
    /// The device could not be opened.
    Failed(i32),
    /// The device went away.
    Disconnected,
}

impl OpenOutcome {
    /// Decode a device lifecycle event. Other events yield `None`.
    pub const fn from_event(event: &HardwareEvent) -> Option<Self> {
        match event {
            HardwareEvent::DeviceOpened => Some(Self::Opened),
            HardwareEvent::DeviceOpenFailed(code) => Some(Self::Failed(*code)),
            HardwareEvent::DeviceDisconnected => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// Request `camera_id` from the backend.
///
/// Returns the pending device handle. A refused request is an
/// [`CaptureError::Open`] and leaves nothing to release.
pub fn open<B: CameraBackend>(
    backend: &mut B,
    camera_id: u32,
    events: EventDispatcher,
) -> Result<B::Device> {
    info!(camera_id, "opening camera");
    backend.open(camera_id, events).map_err(|err| {
        error!(camera_id, error = %err, "error getting camera");
        CaptureError::Open(format!("Error getting camera: {err}"))
    })
}

/// Error reported when the pending open fails.
pub fn open_failed(camera_id: u32, code: i32) -> CaptureError {
    warn!(camera_id, code, "camera open failed");
    CaptureError::Open(format!("Error opening camera: {code}"))
}
