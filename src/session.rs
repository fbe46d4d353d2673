//! Recording session coordination.
//!
//! [`SessionCoordinator`] is a state machine driven by [`HardwareEvent`]s.
//! Each stage owns the resources created so far and moves them into the next
//! stage; a terminal event hands them to [`ResourceTeardown`], which stops
//! the event loop.
//!
//! ```text
//! Idle -> Opening -> Opened -> Configuring -> Active -> Completed
//!            \__________\___________\____________\----> Failed
//! ```

use std::mem;
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::acquirer::{self, OpenOutcome};
use crate::error::{CaptureError, Result};
use crate::event_loop::{EventDispatcher, EventHandler, EventLoop};
use crate::recorder;
use crate::request::{CaptureRequestSpec, DisconnectPolicy};
use crate::selector::{effective_exposure, select_output_size, SelectedStreamConfig};
use crate::teardown::ResourceTeardown;
use crate::traits::{
    CameraBackend, CameraDevice, CaptureRequest, CaptureSession, ExposureMode, HardwareEvent,
    RecordingSink, RequestTemplate, Size, RECORDER_INFO_MAX_DURATION_REACHED,
};

type Session<B> = <<B as CameraBackend>::Device as CameraDevice>::Session;

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Nothing requested yet.
    Idle,
    /// Waiting for the device to open.
    Opening,
    /// Device open, sink being configured.
    Opened,
    /// Waiting for the capture session to configure.
    Configuring,
    /// Recording.
    Active,
    /// Duration cap reached, everything released.
    Completed,
    /// Failed, everything released.
    Failed,
}

/// A finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    /// File the recording was written to.
    pub output_path: PathBuf,
    /// Video size.
    pub size: Size,
    /// Exposure mode the session ran with.
    pub exposure: ExposureMode,
    /// Duration cap in milliseconds.
    pub duration_ms: u64,
}

enum Stage<B: CameraBackend> {
    Idle,
    Opening {
        device: B::Device,
    },
    Configuring {
        device: B::Device,
        recorder: B::Recorder,
        session: Session<B>,
        stream: SelectedStreamConfig,
    },
    Active {
        device: B::Device,
        recorder: B::Recorder,
        session: Session<B>,
        stream: SelectedStreamConfig,
    },
    Done,
}

/// Drives one recording from open request to teardown.
pub struct SessionCoordinator<'a, B: CameraBackend> {
    backend: &'a mut B,
    spec: &'a CaptureRequestSpec,
    events: EventDispatcher,
    teardown: Option<ResourceTeardown>,
    stage: Stage<B>,
    state: CaptureState,
    outcome: Option<Result<Recording>>,
}

impl<'a, B: CameraBackend> SessionCoordinator<'a, B> {
    /// Coordinator for `spec`, posting hardware events to `events` and
    /// releasing resources through `teardown`.
    pub fn new(
        backend: &'a mut B,
        spec: &'a CaptureRequestSpec,
        events: EventDispatcher,
        teardown: ResourceTeardown,
    ) -> Self {
        Self {
            backend,
            spec,
            events,
            teardown: Some(teardown),
            stage: Stage::Idle,
            state: CaptureState::Idle,
            outcome: None,
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> CaptureState {
        self.state
    }

    /// Request the device. The outcome arrives on the event loop.
    ///
    /// A refused request fails immediately; there is nothing to tear down.
    pub fn start(&mut self) -> Result<()> {
        if !matches!(self.stage, Stage::Idle) {
            return Err(CaptureError::Runtime("Recording already started".to_owned()));
        }
        match acquirer::open(self.backend, self.spec.camera_id, self.events.clone()) {
            Ok(device) => {
                self.stage = Stage::Opening { device };
                self.transition(CaptureState::Opening);
                Ok(())
            }
            Err(err) => {
                self.transition(CaptureState::Failed);
                self.teardown = None;
                Err(err)
            }
        }
    }

    /// The invocation's result. Only meaningful once the loop has stopped.
    pub fn finish(mut self) -> Result<Recording> {
        self.outcome.take().unwrap_or_else(|| {
            Err(CaptureError::Runtime(
                "Recording ended without an outcome".to_owned(),
            ))
        })
    }

    fn transition(&mut self, next: CaptureState) {
        debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    fn on_device_event(&mut self, outcome: OpenOutcome) {
        match outcome {
            OpenOutcome::Opened => self.on_opened(),
            OpenOutcome::Failed(code) => {
                let err = acquirer::open_failed(self.spec.camera_id, code);
                let stage = mem::replace(&mut self.stage, Stage::Done);
                if matches!(stage, Stage::Opening { .. }) {
                    self.abort(stage, err);
                } else {
                    warn!(code, state = ?self.state, "ignoring open failure in unexpected state");
                    self.stage = stage;
                }
            }
            OpenOutcome::Disconnected => self.on_disconnected(),
        }
    }

    fn on_opened(&mut self) {
        let device = match mem::replace(&mut self.stage, Stage::Done) {
            Stage::Opening { device } => device,
            other => {
                warn!(state = ?self.state, "ignoring open notification in unexpected state");
                self.stage = other;
                return;
            }
        };
        self.transition(CaptureState::Opened);
        info!(camera_id = device.id(), "camera opened");

        let stream = match self.select_stream(&device) {
            Ok(stream) => stream,
            Err(err) => return self.fail(err, device, None),
        };

        let recorder =
            match recorder::configure(self.backend, self.spec, stream.size, self.events.clone()) {
                Ok(recorder) => recorder,
                Err(err) => return self.fail(err, device, None),
            };

        let Some(surface) = recorder.surface() else {
            let err = CaptureError::Config("Recorder has no input surface".to_owned());
            return self.fail(err, device, Some(recorder));
        };

        let mut device = device;
        match device.create_session(vec![surface], self.events.clone()) {
            Ok(session) => {
                self.stage = Stage::Configuring {
                    device,
                    recorder,
                    session,
                    stream,
                };
                self.transition(CaptureState::Configuring);
            }
            Err(err) => {
                let err =
                    CaptureError::ConfigureFailed(format!("Error creating capture session: {err}"));
                self.fail(err, device, Some(recorder));
            }
        }
    }

    fn select_stream(&self, device: &B::Device) -> Result<SelectedStreamConfig> {
        let capabilities = device.capabilities().map_err(|err| {
            CaptureError::Config(format!("Error querying camera characteristics: {err}"))
        })?;

        let requested = self.spec.auto_exposure_mode;
        let exposure = effective_exposure(requested, &capabilities.exposure_modes);
        if exposure != requested {
            warn!(?requested, "auto exposure mode not supported, using manual exposure");
        }

        let size = select_output_size(&capabilities.output_sizes, self.spec.target_height)
            .ok_or_else(|| CaptureError::Config("No output sizes available".to_owned()))?;
        info!(%size, ?exposure, target_height = ?self.spec.target_height, "selected stream");

        Ok(SelectedStreamConfig { size, exposure })
    }

    fn on_configured(&mut self) {
        let (device, mut recorder, mut session, stream) =
            match mem::replace(&mut self.stage, Stage::Done) {
                Stage::Configuring {
                    device,
                    recorder,
                    session,
                    stream,
                } => (device, recorder, session, stream),
                other => {
                    warn!(state = ?self.state, "ignoring session configuration in unexpected state");
                    self.stage = other;
                    return;
                }
            };

        debug!(
            focus = ?self.spec.auto_focus_mode,
            white_balance = ?self.spec.auto_white_balance_mode,
            "focus and white balance modes are not applied to the repeating request"
        );
        // Only the running request holds a surface from here on.
        let Some(target) = recorder.surface() else {
            session.close();
            let err = CaptureError::Config("Recorder has no input surface".to_owned());
            return self.fail(err, device, Some(recorder));
        };
        let request = CaptureRequest {
            template: RequestTemplate::Record,
            target,
            exposure: stream.exposure,
        };
        if let Err(err) = session.set_repeating_request(request) {
            session.close();
            let err = CaptureError::Runtime(format!("Error creating capture request: {err}"));
            return self.fail(err, device, Some(recorder));
        }

        if let Err(err) = recorder.start() {
            session.close();
            let err = CaptureError::Runtime(format!("Error starting recorder: {err}"));
            return self.fail(err, device, Some(recorder));
        }

        info!(path = %self.spec.output_path.display(), "recording video");
        self.stage = Stage::Active {
            device,
            recorder,
            session,
            stream,
        };
        self.transition(CaptureState::Active);
    }

    fn on_configure_failed(&mut self) {
        let stage = mem::replace(&mut self.stage, Stage::Done);
        if matches!(stage, Stage::Configuring { .. }) {
            info!("capture session configuration failed");
            self.abort(
                stage,
                CaptureError::ConfigureFailed("Capture session configuration failed".to_owned()),
            );
        } else {
            warn!(state = ?self.state, "ignoring configure failure in unexpected state");
            self.stage = stage;
        }
    }

    fn on_recorder_error(&mut self, what: i32, extra: i32) {
        let stage = mem::replace(&mut self.stage, Stage::Done);
        if matches!(stage, Stage::Configuring { .. } | Stage::Active { .. }) {
            self.abort(
                stage,
                CaptureError::Runtime(format!("Recorder error: {what} {extra}")),
            );
        } else {
            warn!(what, extra, state = ?self.state, "ignoring recorder error in unexpected state");
            self.stage = stage;
        }
    }

    fn on_recorder_info(&mut self, what: i32, extra: i32) {
        info!(what, extra, "recorder info");
        if what != RECORDER_INFO_MAX_DURATION_REACHED {
            return;
        }

        match mem::replace(&mut self.stage, Stage::Done) {
            Stage::Active {
                device,
                mut recorder,
                mut session,
                stream,
            } => {
                if let Err(err) = recorder.stop() {
                    error!(error = %err, "error stopping recorder");
                }
                session.close();
                self.complete(device, recorder, stream);
            }
            other => {
                warn!(state = ?self.state, "ignoring duration cap in unexpected state");
                self.stage = other;
            }
        }
    }

    fn on_disconnected(&mut self) {
        info!(camera_id = self.spec.camera_id, "camera disconnected");
        match self.spec.disconnect_policy {
            DisconnectPolicy::Ignore => {}
            DisconnectPolicy::Fail => {
                let stage = mem::replace(&mut self.stage, Stage::Done);
                if matches!(stage, Stage::Idle | Stage::Done) {
                    self.stage = stage;
                } else {
                    self.abort(stage, CaptureError::Disconnected(self.spec.camera_id));
                }
            }
        }
    }

    /// Close whatever session exists and fail with the remaining resources.
    fn abort(&mut self, stage: Stage<B>, err: CaptureError) {
        match stage {
            Stage::Opening { device } => self.fail(err, device, None),
            Stage::Configuring {
                device,
                recorder,
                mut session,
                ..
            }
            | Stage::Active {
                device,
                recorder,
                mut session,
                ..
            } => {
                session.close();
                self.fail(err, device, Some(recorder));
            }
            Stage::Idle | Stage::Done => {
                warn!(error = %err, "nothing to abort");
            }
        }
    }

    fn fail(&mut self, err: CaptureError, device: B::Device, recorder: Option<B::Recorder>) {
        error!(kind = err.kind(), error = %err, "recording failed");
        self.transition(CaptureState::Failed);
        self.outcome = Some(Err(err));
        self.release(device, recorder);
    }

    fn complete(&mut self, device: B::Device, recorder: B::Recorder, stream: SelectedStreamConfig) {
        info!(path = %self.spec.output_path.display(), "recording completed");
        self.transition(CaptureState::Completed);
        self.outcome = Some(Ok(Recording {
            output_path: self.spec.output_path.clone(),
            size: stream.size,
            exposure: stream.exposure,
            duration_ms: self.spec.max_duration_ms(),
        }));
        self.release(device, Some(recorder));
    }

    fn release(&mut self, device: B::Device, recorder: Option<B::Recorder>) {
        self.stage = Stage::Done;
        match self.teardown.take() {
            Some(teardown) => {
                teardown.close(device, recorder);
            }
            None => error!("teardown already ran"),
        }
    }
}

impl<B: CameraBackend> EventHandler for SessionCoordinator<'_, B> {
    fn handle(&mut self, event: HardwareEvent) {
        debug!(?event, state = ?self.state, "hardware event");
        if let Some(outcome) = OpenOutcome::from_event(&event) {
            return self.on_device_event(outcome);
        }
        match event {
            HardwareEvent::SessionConfigured => self.on_configured(),
            HardwareEvent::SessionConfigureFailed => self.on_configure_failed(),
            HardwareEvent::RecorderError { what, extra } => self.on_recorder_error(what, extra),
            HardwareEvent::RecorderInfo { what, extra } => self.on_recorder_info(what, extra),
            HardwareEvent::DeviceOpened
            | HardwareEvent::DeviceOpenFailed(_)
            | HardwareEvent::DeviceDisconnected => {}
        }
    }
}

impl<B: CameraBackend> Drop for SessionCoordinator<'_, B> {
    fn drop(&mut self) {
        let stage = mem::replace(&mut self.stage, Stage::Done);
        if !matches!(stage, Stage::Idle | Stage::Done) {
            warn!(state = ?self.state, "coordinator dropped before teardown");
            self.abort(
                stage,
                CaptureError::Runtime("Recording abandoned".to_owned()),
            );
        }
    }
}

/// Record one video as described by `spec`.
///
/// Blocks until the duration cap is reached or the recording fails. Every
/// resource opened along the way is released before this returns.
pub fn record<B: CameraBackend>(backend: &mut B, spec: &CaptureRequestSpec) -> Result<Recording> {
    spec.validate()?;

    let mut event_loop = EventLoop::new()?;
    let teardown = ResourceTeardown::new(event_loop.handle());
    let mut coordinator = SessionCoordinator::new(backend, spec, event_loop.dispatcher(), teardown);

    coordinator.start()?;
    event_loop.run(&mut coordinator);
    coordinator.finish()
}
