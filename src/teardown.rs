//! The one release path of a recording invocation.

use tracing::{debug, info, warn};

use crate::event_loop::LoopHandle;
use crate::traits::{CameraDevice, RecordingSink};

/// What a teardown actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    /// The device closed without error.
    pub device_closed: bool,
    /// The event loop was asked to stop.
    pub loop_stopped: bool,
    /// A sink was present and released.
    pub sink_released: bool,
}

/// Releases the device, the event loop and the sink.
///
/// [`close`](Self::close) consumes the teardown, so each invocation can run
/// it at most once.
#[derive(Debug)]
pub struct ResourceTeardown {
    loop_handle: LoopHandle,
}

impl ResourceTeardown {
    /// Teardown bound to the loop it must stop.
    pub const fn new(loop_handle: LoopHandle) -> Self {
        Self { loop_handle }
    }

    /// Close `device`, stop the loop, release `sink`.
    ///
    /// A device close error is logged and otherwise ignored; the remaining
    /// steps always run.
    pub fn close<D, S>(self, mut device: D, sink: Option<S>) -> TeardownReport
    where
        D: CameraDevice,
        S: RecordingSink,
    {
        let camera_id = device.id();
        let device_closed = match device.close() {
            Ok(()) => true,
            Err(err) => {
                warn!(camera_id, error = %err, "error closing camera");
                false
            }
        };

        self.loop_handle.stop();

        let sink_released = sink.map_or(false, |mut sink| {
            sink.release();
            true
        });

        let report = TeardownReport {
            device_closed,
            loop_stopped: self.loop_handle.is_stopped(),
            sink_released,
        };
        debug!(?report, "teardown finished");
        info!(camera_id, "camera resources released");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::mock::{Call, MockBackend, MockRecorder};
    use crate::traits::CameraBackend;

    #[test]
    fn test_close_releases_everything() {
        let event_loop = EventLoop::new().expect("runtime should build");
        let mut backend = MockBackend::new();
        let device = backend.open(0, event_loop.dispatcher()).expect("open should be accepted");
        let recorder = backend.new_recorder(event_loop.dispatcher());

        let report = ResourceTeardown::new(event_loop.handle()).close(device, Some(recorder));

        assert!(report.device_closed);
        assert!(report.loop_stopped);
        assert!(report.sink_released);
        let journal = backend.journal();
        assert_eq!(journal.count(&Call::CloseDevice), 1);
        assert_eq!(journal.count(&Call::ReleaseRecorder), 1);
        assert!(event_loop.handle().is_stopped());
    }

    #[test]
    fn test_close_error_is_swallowed() {
        let event_loop = EventLoop::new().expect("runtime should build");
        let mut backend = MockBackend::new().with_close_error();
        let device = backend.open(0, event_loop.dispatcher()).expect("open should be accepted");

        let report = ResourceTeardown::new(event_loop.handle()).close(device, None::<MockRecorder>);

        assert!(!report.device_closed);
        assert!(report.loop_stopped);
        assert!(!report.sink_released);
        assert_eq!(backend.journal().count(&Call::CloseDevice), 1);
    }
}
