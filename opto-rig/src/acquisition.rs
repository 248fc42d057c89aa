//! The [AcquisitionWorker] owns one camera and its recordings.
//!
//! All state transitions run on the worker thread, in the order the commands
//! were sent, so concurrent callers (a user interface and the sync
//! subscriber, say) can never interleave a start and a stop.

use std::{path::PathBuf, sync::Arc, thread::JoinHandle, time::Duration};

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use rig_camera::{Camera, CameraModule, CameraParam, Frame, ParamControl};
use rig_video_writer::{
    BgRecordingWriter, DefaultEncoderFactory, EncoderFactory, RecordingSettings, RecordingSink,
};

use crate::{Error, FrameSource, ResourceError, Result};

/// Time for the camera to reach steady exposure and framerate after
/// acquisition starts, and to drain after recording stops.
pub const DEFAULT_DEVICE_SETTLE: Duration = Duration::from_secs(1);
/// Frames buffered between the poll loop and the encoder.
pub const DEFAULT_QUEUE_SIZE: usize = 100;
/// Frames buffered per preview subscriber before frames are skipped.
pub const DEFAULT_PREVIEW_CAPACITY: usize = 2;

const ERROR_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum AcquisitionState {
    #[default]
    Idle,
    /// Polling frames for preview only.
    Acquiring,
    /// Polling frames and writing each one to the open recording.
    Recording,
}

pub struct WorkerOptions {
    pub device_settle: Duration,
    pub queue_size: usize,
    pub encoder_factory: Arc<dyn EncoderFactory>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            device_settle: DEFAULT_DEVICE_SETTLE,
            queue_size: DEFAULT_QUEUE_SIZE,
            encoder_factory: Arc::new(DefaultEncoderFactory),
        }
    }
}

/// One completed recording.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RecordingSession {
    pub settings: RecordingSettings,
    pub path: PathBuf,
    /// Wall-clock time at which frame writing began.
    pub video_start_time: DateTime<Local>,
    pub frame_count: u64,
    pub first_frame_index: Option<u64>,
    pub last_frame_index: Option<u64>,
}

/// Notifications from the worker, delivered in the order they happened.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    StateChanged(AcquisitionState),
    RecordingStarted {
        path: PathBuf,
        video_start_time: DateTime<Local>,
    },
    RecordingFinished(RecordingSession),
    /// The recording was aborted. The state is back to idle.
    RecordingFailed(String),
    /// A single frame poll failed. Acquisition continues.
    FrameError(String),
}

type Reply<T> = Sender<Result<T>>;

enum Cmd {
    StartAcquisition(Reply<()>),
    StopAcquisition(Reply<()>),
    StartRecording(Reply<DateTime<Local>>),
    StopRecording(Reply<Option<RecordingSession>>),
    Configure(RecordingSettings, Reply<()>),
    CameraControls(Reply<Vec<(CameraParam, Option<ParamControl>)>>),
    SetCameraParam(CameraParam, f64, Reply<()>),
    Quit,
}

#[derive(Default)]
struct Shared {
    state: AcquisitionState,
    current_frame: Option<Arc<Frame>>,
    video_start_time: Option<DateTime<Local>>,
    settings: RecordingSettings,
    sessions: Vec<RecordingSession>,
}

#[derive(Default)]
struct Listeners {
    frames: Vec<Sender<Arc<Frame>>>,
    events: Vec<Sender<WorkerEvent>>,
}

/// Handle to the worker thread. All methods may be called from any thread.
pub struct AcquisitionWorker {
    cmd_tx: Sender<Cmd>,
    shared: Arc<RwLock<Shared>>,
    listeners: Arc<Mutex<Listeners>>,
    join: Option<JoinHandle<()>>,
}

impl AcquisitionWorker {
    /// Open camera `name` from `module` and start a worker for it.
    ///
    /// Failure to open the camera is returned here.
    pub fn open<M: CameraModule>(
        module: &mut M,
        name: &str,
        options: WorkerOptions,
    ) -> Result<Self>
    where
        M::CameraType: 'static,
    {
        let camera = module
            .camera(name)
            .map_err(|e| Error::Resource(ResourceError::Camera(e)))?;
        info!("opened camera \"{name}\" from {}", module.name());
        Self::spawn(camera, options)
    }

    pub fn spawn<C: Camera + 'static>(camera: C, options: WorkerOptions) -> Result<Self> {
        let shared = Arc::new(RwLock::new(Shared::default()));
        let listeners = Arc::new(Mutex::new(Listeners::default()));
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let name = camera.name().to_string();
        let mut inner = WorkerThread {
            source: FrameSource::new(camera),
            state: AcquisitionState::Idle,
            options,
            settings: RecordingSettings::default(),
            recording: None,
            shared: shared.clone(),
            listeners: listeners.clone(),
            consecutive_errors: 0,
        };
        let join = std::thread::Builder::new()
            .name(format!("acquisition {name}"))
            .spawn(move || inner.run(cmd_rx))
            .map_err(ResourceError::Io)?;
        Ok(Self {
            cmd_tx,
            shared,
            listeners,
            join: Some(join),
        })
    }

    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Cmd) -> Result<T> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| Error::WorkerDisconnected)?;
        rx.recv().map_err(|_| Error::WorkerDisconnected)?
    }

    pub fn start_acquisition(&self) -> Result<()> {
        self.request(Cmd::StartAcquisition)
    }

    pub fn stop_acquisition(&self) -> Result<()> {
        self.request(Cmd::StopAcquisition)
    }

    /// Start a recording with the configured settings and return the video
    /// start time. Blocks for the device settle delay.
    ///
    /// Calling this while already recording does nothing and returns the
    /// start time of the running recording.
    pub fn start_recording(&self) -> Result<DateTime<Local>> {
        self.request(Cmd::StartRecording)
    }

    /// Stop the recording. Returns once the container is complete on disk.
    ///
    /// Returns `None` if nothing was recording.
    pub fn stop_recording(&self) -> Result<Option<RecordingSession>> {
        self.request(Cmd::StopRecording)
    }

    /// Replace the recording settings. Rejected while recording.
    pub fn configure_recording(&self, settings: RecordingSettings) -> Result<()> {
        self.request(|tx| Cmd::Configure(settings, tx))
    }

    /// Every camera parameter with its control description. `None` means
    /// the control must be disabled.
    pub fn camera_controls(&self) -> Result<Vec<(CameraParam, Option<ParamControl>)>> {
        self.request(Cmd::CameraControls)
    }

    pub fn set_camera_param(&self, param: CameraParam, value: f64) -> Result<()> {
        self.request(|tx| Cmd::SetCameraParam(param, value, tx))
    }

    /// Receive every accepted frame. When the receiver falls behind by
    /// `capacity` frames, further frames are skipped for it.
    pub fn subscribe_frames(&self, capacity: usize) -> Receiver<Arc<Frame>> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        self.listeners.lock().frames.push(tx);
        rx
    }

    pub fn subscribe_events(&self) -> Receiver<WorkerEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.listeners.lock().events.push(tx);
        rx
    }

    pub fn state(&self) -> AcquisitionState {
        self.shared.read().state
    }

    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.shared.read().current_frame.clone()
    }

    /// Start time of the running or most recent recording.
    pub fn video_start_time(&self) -> Option<DateTime<Local>> {
        self.shared.read().video_start_time
    }

    pub fn recording_settings(&self) -> RecordingSettings {
        self.shared.read().settings.clone()
    }

    /// All recordings completed by this worker.
    pub fn sessions(&self) -> Vec<RecordingSession> {
        self.shared.read().sessions.clone()
    }

    /// Close any open recording, stop the camera and end the thread.
    pub fn shutdown(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.cmd_tx.send(Cmd::Quit);
            if join.join().is_err() {
                error!("acquisition thread panicked");
            }
        }
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ActiveRecording {
    writer: BgRecordingWriter,
    settings: RecordingSettings,
    path: PathBuf,
    video_start_time: DateTime<Local>,
}

struct WorkerThread<C> {
    source: FrameSource<C>,
    state: AcquisitionState,
    options: WorkerOptions,
    settings: RecordingSettings,
    recording: Option<ActiveRecording>,
    shared: Arc<RwLock<Shared>>,
    listeners: Arc<Mutex<Listeners>>,
    consecutive_errors: u32,
}

impl<C: Camera> WorkerThread<C> {
    fn run(&mut self, cmd_rx: Receiver<Cmd>) {
        loop {
            let cmd = if self.state == AcquisitionState::Idle {
                // Nothing to poll: wait for the next command.
                match cmd_rx.recv() {
                    Ok(cmd) => Some(cmd),
                    Err(_) => break,
                }
            } else {
                match cmd_rx.try_recv() {
                    Ok(cmd) => Some(cmd),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            };
            match cmd {
                Some(Cmd::Quit) => break,
                Some(cmd) => self.handle(cmd),
                None => self.poll_once(),
            }
        }
        self.close_all();
        debug!("acquisition thread done");
    }

    fn handle(&mut self, cmd: Cmd) {
        // A dropped reply receiver means the caller gave up; nothing to do.
        match cmd {
            Cmd::StartAcquisition(tx) => {
                let _ = tx.send(self.start_acquisition());
            }
            Cmd::StopAcquisition(tx) => {
                let _ = tx.send(self.stop_acquisition());
            }
            Cmd::StartRecording(tx) => {
                let _ = tx.send(self.start_recording());
            }
            Cmd::StopRecording(tx) => {
                let _ = tx.send(self.stop_recording());
            }
            Cmd::Configure(settings, tx) => {
                let _ = tx.send(self.configure(settings));
            }
            Cmd::CameraControls(tx) => {
                let camera = self.source.camera();
                let controls = CameraParam::ALL
                    .into_iter()
                    .map(|p| (p, camera.param_control(p)))
                    .collect();
                let _ = tx.send(Ok(controls));
            }
            Cmd::SetCameraParam(param, value, tx) => {
                let _ = tx.send(self.set_camera_param(param, value));
            }
            Cmd::Quit => {}
        }
    }

    fn set_state(&mut self, state: AcquisitionState) {
        if self.state == state {
            return;
        }
        info!("{:?} -> {state:?}", self.state);
        self.state = state;
        self.shared.write().state = state;
        self.emit(WorkerEvent::StateChanged(state));
    }

    fn emit(&self, event: WorkerEvent) {
        self.listeners
            .lock()
            .events
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn invalid(&self, requested: &'static str) -> Error {
        Error::InvalidTransition {
            state: self.state,
            requested,
        }
    }

    fn start_acquisition(&mut self) -> Result<()> {
        match self.state {
            AcquisitionState::Acquiring => Ok(()),
            AcquisitionState::Recording => Err(self.invalid("start acquisition")),
            AcquisitionState::Idle => {
                self.source.start()?;
                self.set_state(AcquisitionState::Acquiring);
                Ok(())
            }
        }
    }

    fn stop_acquisition(&mut self) -> Result<()> {
        match self.state {
            AcquisitionState::Idle => Ok(()),
            AcquisitionState::Recording => Err(self.invalid("stop acquisition")),
            AcquisitionState::Acquiring => {
                self.set_state(AcquisitionState::Idle);
                self.source.stop()?;
                Ok(())
            }
        }
    }

    fn configure(&mut self, settings: RecordingSettings) -> Result<()> {
        if self.state == AcquisitionState::Recording {
            return Err(self.invalid("change recording settings"));
        }
        debug!("recording settings {settings:?}");
        self.shared.write().settings = settings.clone();
        self.settings = settings;
        Ok(())
    }

    fn set_camera_param(&mut self, param: CameraParam, value: f64) -> Result<()> {
        // The encoder was sized when the recording opened.
        if self.state == AcquisitionState::Recording && param.is_integer() {
            return Err(self.invalid("change the region of interest"));
        }
        self.source.camera_mut().set_param(param, value)?;
        Ok(())
    }

    fn start_recording(&mut self) -> Result<DateTime<Local>> {
        match self.state {
            AcquisitionState::Recording => {
                if let Some(r) = &self.recording {
                    debug!("already recording to {}", r.path.display());
                    return Ok(r.video_start_time);
                }
            }
            AcquisitionState::Acquiring => return Err(self.invalid("start recording")),
            AcquisitionState::Idle => {}
        }

        let camera = self.source.camera();
        let (width, height) = (camera.width()?, camera.height()?);
        let pixel_format = camera.pixel_format();

        let mut sink = RecordingSink::with_factory(self.options.encoder_factory.clone());
        sink.configure(self.settings.clone())?;
        let path = sink.open(width, height, pixel_format)?;
        let writer = BgRecordingWriter::new(sink, self.options.queue_size)?;

        if let Err(e) = self.source.start() {
            if let Err(e2) = writer.finish() {
                warn!("closing unused recording: {e2}");
            }
            return Err(e.into());
        }
        std::thread::sleep(self.options.device_settle);

        let video_start_time = Local::now();
        self.recording = Some(ActiveRecording {
            writer,
            settings: self.settings.clone(),
            path: path.clone(),
            video_start_time,
        });
        self.shared.write().video_start_time = Some(video_start_time);
        self.set_state(AcquisitionState::Recording);
        self.emit(WorkerEvent::RecordingStarted {
            path,
            video_start_time,
        });
        Ok(video_start_time)
    }

    fn stop_recording(&mut self) -> Result<Option<RecordingSession>> {
        let Some(recording) = self.recording.take() else {
            return Ok(None);
        };
        let finished = recording.writer.finish();
        std::thread::sleep(self.options.device_settle);
        let stopped = self.source.stop();
        self.set_state(AcquisitionState::Idle);

        let summary = match finished {
            Ok(summary) => summary,
            Err(e) => {
                self.emit(WorkerEvent::RecordingFailed(e.to_string()));
                return Err(e.into());
            }
        };
        let session = RecordingSession {
            settings: recording.settings,
            path: summary.path,
            video_start_time: recording.video_start_time,
            frame_count: summary.frame_count,
            first_frame_index: summary.first_frame_index,
            last_frame_index: summary.last_frame_index,
        };
        info!(
            "recorded {} frames to \"{}\"",
            session.frame_count,
            session.path.display()
        );
        self.shared.write().sessions.push(session.clone());
        self.emit(WorkerEvent::RecordingFinished(session.clone()));
        stopped?;
        Ok(Some(session))
    }

    /// Abort the recording after the writer failed.
    fn abort_recording(&mut self, reason: String) {
        error!("recording failed: {reason}");
        if let Some(recording) = self.recording.take() {
            if let Err(e) = recording.writer.finish() {
                debug!("while finishing failed recording: {e}");
            }
        }
        if let Err(e) = self.source.stop() {
            warn!("stopping camera: {e}");
        }
        self.set_state(AcquisitionState::Idle);
        self.emit(WorkerEvent::RecordingFailed(reason));
    }

    fn poll_once(&mut self) {
        let frame = match self.source.poll() {
            Ok(Some(frame)) => Arc::new(frame),
            Ok(None) => return,
            Err(e) => {
                self.consecutive_errors += 1;
                warn!("frame poll failed: {e}");
                self.emit(WorkerEvent::FrameError(e.to_string()));
                if self.consecutive_errors > 1 {
                    std::thread::sleep(ERROR_BACKOFF);
                }
                return;
            }
        };
        self.consecutive_errors = 0;
        trace!("frame {}", frame.index);

        if let Some(recording) = self.recording.as_mut() {
            if let Err(e) = recording.writer.write(frame.clone()) {
                self.abort_recording(e.to_string());
                return;
            }
        }

        self.shared.write().current_frame = Some(frame.clone());
        self.listeners
            .lock()
            .frames
            .retain(|tx| match tx.try_send(frame.clone()) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    fn close_all(&mut self) {
        match self.state {
            AcquisitionState::Recording => {
                if let Err(e) = self.stop_recording() {
                    error!("closing recording at shutdown: {e}");
                }
            }
            AcquisitionState::Acquiring => {
                if let Err(e) = self.stop_acquisition() {
                    error!("stopping acquisition at shutdown: {e}");
                }
            }
            AcquisitionState::Idle => {}
        }
    }
}
