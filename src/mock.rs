//! Mock backend for testing without hardware.
//!
//! Every call is recorded in a shared [`Journal`], and the asynchronous
//! outcomes are scripted up front and posted to the event loop as soon as
//! the triggering call is made.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{CaptureError, Result};
use crate::event_loop::EventDispatcher;
use crate::recorder::RecorderConfig;
use crate::traits::{
    CameraBackend, CameraDevice, CaptureCapabilities, CaptureRequest, CaptureSession,
    ExposureMode, HardwareEvent, RecordingSink, Size, RECORDER_ERROR_UNKNOWN,
};

/// A call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `CameraBackend::open` with the camera id.
    Open(u32),
    /// `CameraDevice::capabilities`.
    Capabilities,
    /// `CameraDevice::create_session`.
    CreateSession,
    /// `CaptureSession::set_repeating_request` with the exposure override.
    SetRepeating(ExposureMode),
    /// `CaptureSession::close`.
    CloseSession,
    /// `CameraDevice::close`.
    CloseDevice,
    /// `CameraBackend::new_recorder`.
    NewRecorder,
    /// `RecordingSink::prepare`.
    Prepare,
    /// `RecordingSink::start`.
    StartRecorder,
    /// `RecordingSink::stop`.
    StopRecorder,
    /// `RecordingSink::release`.
    ReleaseRecorder,
}

#[derive(Debug, Default)]
struct JournalInner {
    calls: Vec<Call>,
    dispatched: Vec<HardwareEvent>,
    prepared: Option<RecorderConfig>,
}

/// Shared record of everything the mock was asked to do.
#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<JournalInner>>);

impl Journal {
    fn record(&self, call: Call) {
        self.0.borrow_mut().calls.push(call);
    }

    fn dispatch(&self, events: &EventDispatcher, event: HardwareEvent) {
        self.0.borrow_mut().dispatched.push(event.clone());
        events.dispatch(event);
    }

    /// Calls in the order they were made.
    pub fn calls(&self) -> Vec<Call> {
        self.0.borrow().calls.clone()
    }

    /// How many times `call` was made.
    pub fn count(&self, call: &Call) -> usize {
        self.0.borrow().calls.iter().filter(|c| *c == call).count()
    }

    /// Events the mock posted to the loop.
    pub fn dispatched(&self) -> Vec<HardwareEvent> {
        self.0.borrow().dispatched.clone()
    }

    /// Last configuration passed to `prepare`.
    pub fn prepared(&self) -> Option<RecorderConfig> {
        self.0.borrow().prepared.clone()
    }
}

/// Scripted outcome of an open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenScript {
    /// The device opens.
    Opens,
    /// The device reports an open error with this code.
    Fails(i32),
    /// The request is refused outright.
    Refused,
}

/// Scripted outcome of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionScript {
    /// The session configures and accepts the repeating request.
    Configures,
    /// The session fails to configure.
    Fails,
    /// The session configures but rejects the repeating request.
    RequestRejected,
    /// The repeating request starts, then capture fails with this errno.
    CaptureFails(i32),
}

#[derive(Debug, Clone)]
struct Script {
    open: OpenScript,
    capabilities: CaptureCapabilities,
    session: SessionScript,
    prepare_error: Option<String>,
    close_error: bool,
    runtime: Vec<HardwareEvent>,
}

/// Mock camera stack.
#[derive(Debug)]
pub struct MockBackend {
    script: Script,
    journal: Journal,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Backend whose device opens, supports `Off`/`On` exposure and three
    /// sizes, and whose session configures.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Script {
                open: OpenScript::Opens,
                capabilities: CaptureCapabilities {
                    exposure_modes: vec![ExposureMode::Off, ExposureMode::On],
                    output_sizes: vec![
                        Size::new(640, 480),
                        Size::new(1280, 720),
                        Size::new(1920, 1080),
                    ],
                },
                session: SessionScript::Configures,
                prepare_error: None,
                close_error: false,
                runtime: Vec::new(),
            },
            journal: Journal::default(),
        }
    }

    /// Set the open outcome.
    #[must_use]
    pub const fn with_open(mut self, open: OpenScript) -> Self {
        self.script.open = open;
        self
    }

    /// Set the reported capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CaptureCapabilities) -> Self {
        self.script.capabilities = capabilities;
        self
    }

    /// Set the session outcome.
    #[must_use]
    pub const fn with_session(mut self, session: SessionScript) -> Self {
        self.script.session = session;
        self
    }

    /// Make `prepare` fail with `message`.
    #[must_use]
    pub fn with_prepare_error(mut self, message: &str) -> Self {
        self.script.prepare_error = Some(message.to_owned());
        self
    }

    /// Make the device close fail.
    #[must_use]
    pub const fn with_close_error(mut self) -> Self {
        self.script.close_error = true;
        self
    }

    /// Events the recorder posts once started.
    #[must_use]
    pub fn with_runtime_events(mut self, events: Vec<HardwareEvent>) -> Self {
        self.script.runtime = events;
        self
    }

    /// The shared call journal.
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

impl CameraBackend for MockBackend {
    type Device = MockDevice;
    type Recorder = MockRecorder;

    fn open(&mut self, camera_id: u32, events: EventDispatcher) -> Result<MockDevice> {
        self.journal.record(Call::Open(camera_id));
        match self.script.open {
            OpenScript::Refused => {
                return Err(CaptureError::Open(format!("No camera with id {camera_id}")));
            }
            OpenScript::Opens => self.journal.dispatch(&events, HardwareEvent::DeviceOpened),
            OpenScript::Fails(code) => {
                self.journal
                    .dispatch(&events, HardwareEvent::DeviceOpenFailed(code));
            }
        }
        Ok(MockDevice {
            id: camera_id,
            script: self.script.clone(),
            journal: self.journal.clone(),
        })
    }

    fn new_recorder(&mut self, events: EventDispatcher) -> MockRecorder {
        self.journal.record(Call::NewRecorder);
        MockRecorder {
            events,
            journal: self.journal.clone(),
            prepare_error: self.script.prepare_error.clone(),
            runtime: self.script.runtime.clone(),
            prepared: false,
        }
    }
}

/// Surface handed from the mock recorder to the mock session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockSurface;

/// Mock device handle.
#[derive(Debug)]
pub struct MockDevice {
    id: u32,
    script: Script,
    journal: Journal,
}

impl CameraDevice for MockDevice {
    type Surface = MockSurface;
    type Session = MockSession;

    fn id(&self) -> u32 {
        self.id
    }

    fn capabilities(&self) -> Result<CaptureCapabilities> {
        self.journal.record(Call::Capabilities);
        Ok(self.script.capabilities.clone())
    }

    fn create_session(
        &mut self,
        _outputs: Vec<MockSurface>,
        events: EventDispatcher,
    ) -> Result<MockSession> {
        self.journal.record(Call::CreateSession);
        let event = match self.script.session {
            SessionScript::Fails => HardwareEvent::SessionConfigureFailed,
            SessionScript::Configures
            | SessionScript::RequestRejected
            | SessionScript::CaptureFails(_) => HardwareEvent::SessionConfigured,
        };
        self.journal.dispatch(&events, event);
        Ok(MockSession {
            script: self.script.session,
            journal: self.journal.clone(),
            events,
        })
    }

    fn close(&mut self) -> Result<()> {
        self.journal.record(Call::CloseDevice);
        if self.script.close_error {
            return Err(CaptureError::Runtime("device busy".to_owned()));
        }
        Ok(())
    }
}

/// Mock capture session.
#[derive(Debug)]
pub struct MockSession {
    script: SessionScript,
    journal: Journal,
    events: EventDispatcher,
}

impl CaptureSession for MockSession {
    type Surface = MockSurface;

    fn set_repeating_request(&mut self, request: CaptureRequest<MockSurface>) -> Result<()> {
        self.journal.record(Call::SetRepeating(request.exposure));
        match self.script {
            SessionScript::RequestRejected => {
                Err(CaptureError::Runtime("camera access denied".to_owned()))
            }
            SessionScript::CaptureFails(errno) => {
                self.journal.dispatch(
                    &self.events,
                    HardwareEvent::RecorderError {
                        what: RECORDER_ERROR_UNKNOWN,
                        extra: errno,
                    },
                );
                Ok(())
            }
            SessionScript::Configures | SessionScript::Fails => Ok(()),
        }
    }

    fn close(&mut self) {
        self.journal.record(Call::CloseSession);
    }
}

/// Mock recording sink.
#[derive(Debug)]
pub struct MockRecorder {
    events: EventDispatcher,
    journal: Journal,
    prepare_error: Option<String>,
    runtime: Vec<HardwareEvent>,
    prepared: bool,
}

impl RecordingSink for MockRecorder {
    type Surface = MockSurface;

    fn prepare(&mut self, config: &RecorderConfig) -> Result<()> {
        self.journal.record(Call::Prepare);
        self.journal.0.borrow_mut().prepared = Some(config.clone());
        if let Some(message) = &self.prepare_error {
            return Err(CaptureError::Config(message.clone()));
        }
        self.prepared = true;
        Ok(())
    }

    fn surface(&self) -> Option<MockSurface> {
        self.prepared.then_some(MockSurface)
    }

    fn start(&mut self) -> Result<()> {
        self.journal.record(Call::StartRecorder);
        for event in std::mem::take(&mut self.runtime) {
            self.journal.dispatch(&self.events, event);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.journal.record(Call::StopRecorder);
        Ok(())
    }

    fn release(&mut self) {
        self.journal.record(Call::ReleaseRecorder);
    }
}
