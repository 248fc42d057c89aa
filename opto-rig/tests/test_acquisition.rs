use std::{
    path::Path,
    sync::{Arc, Barrier},
    time::Duration,
};

use anyhow::{Context, Result};

use opto_rig::{
    AcquisitionState, AcquisitionWorker, ConfigurationError, Error, ResourceError, WorkerEvent,
    WorkerOptions,
};
use rig_camera::{CameraParam, sim::SimCameraModule};
use rig_video_writer::{DefaultEncoderFactory, RecordingSettings};

mod common;
use common::{CountingEncoderFactory, ScriptedCamera, fast_options, wait_until};

fn settings(dir: &Path, filename: &str, fourcc: &str) -> Result<RecordingSettings> {
    Ok(RecordingSettings {
        filename: Some(filename.to_string()),
        fps: Some(200.0),
        fourcc: Some(fourcc.parse()?),
        directory: Some(dir.to_path_buf()),
    })
}

fn is_invalid_transition<T>(r: opto_rig::Result<T>) -> bool {
    matches!(r, Err(Error::InvalidTransition { .. }))
}

#[test_log::test]
fn state_machine() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let factory = Arc::new(CountingEncoderFactory::default());
    let encoders = factory.log.clone();
    let camera = ScriptedCamera::new(None, Duration::from_millis(1));
    let camera_log = camera.log();
    let worker = AcquisitionWorker::spawn(camera, fast_options(factory))?;
    assert_eq!(worker.state(), AcquisitionState::Idle);

    // Stops from idle do nothing.
    worker.stop_acquisition()?;
    assert_eq!(worker.stop_recording()?, None);
    assert_eq!(worker.state(), AcquisitionState::Idle);
    assert_eq!(camera_log.lock().stops, 0);

    worker.start_acquisition()?;
    worker.start_acquisition()?;
    assert_eq!(worker.state(), AcquisitionState::Acquiring);
    assert_eq!(camera_log.lock().starts, 1);
    assert!(wait_until(Duration::from_secs(5), || worker
        .current_frame()
        .is_some()));

    worker.configure_recording(settings(tmp.path(), "state", "Y800")?)?;
    // Recording takes over the camera: not from preview.
    assert!(is_invalid_transition(worker.start_recording()));
    assert_eq!(worker.state(), AcquisitionState::Acquiring);
    worker.stop_acquisition()?;
    assert_eq!(worker.state(), AcquisitionState::Idle);
    assert_eq!(camera_log.lock().stops, 1);

    let t1 = worker.start_recording()?;
    assert_eq!(worker.state(), AcquisitionState::Recording);
    let t2 = worker.start_recording()?;
    assert_eq!(t1, t2);
    assert_eq!(encoders.lock().opened.len(), 1);
    assert!(is_invalid_transition(worker.start_acquisition()));
    assert!(is_invalid_transition(worker.stop_acquisition()));
    assert!(is_invalid_transition(
        worker.configure_recording(settings(tmp.path(), "other", "Y800")?)
    ));
    assert_eq!(worker.state(), AcquisitionState::Recording);

    let session = worker.stop_recording()?.context("no session")?;
    assert_eq!(worker.state(), AcquisitionState::Idle);
    assert_eq!(session.video_start_time, t1);
    assert_eq!(session.path, tmp.path().join("state.avi"));
    assert_eq!(worker.stop_recording()?, None);
    assert_eq!(worker.video_start_time(), Some(t1));
    assert_eq!(worker.sessions(), vec![session]);

    let encoders = encoders.lock();
    assert_eq!(encoders.opened.len(), 1);
    assert_eq!(encoders.finished, 1);
    let log = camera_log.lock();
    assert_eq!((log.starts, log.stops), (2, 2));
    Ok(())
}

#[test_log::test]
fn concurrent_stops_close_once() -> Result<()> {
    const N_STOPPERS: usize = 8;
    let tmp = tempfile::tempdir()?;
    let factory = Arc::new(CountingEncoderFactory::default());
    let encoders = factory.log.clone();
    let worker = AcquisitionWorker::spawn(
        ScriptedCamera::new(None, Duration::from_millis(1)),
        fast_options(factory),
    )?;
    worker.configure_recording(settings(tmp.path(), "race", "Y800")?)?;
    worker.start_recording()?;

    // Local and remote stops arriving together.
    let barrier = Barrier::new(N_STOPPERS);
    let results: Vec<opto_rig::Result<_>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..N_STOPPERS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    worker.stop_recording()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("stopper panicked"))
            .collect()
    });

    let mut closed = Vec::new();
    for r in results {
        if let Some(session) = r? {
            closed.push(session);
        }
    }
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].path, tmp.path().join("race.avi"));
    assert_eq!(worker.sessions(), closed);
    assert_eq!(worker.state(), AcquisitionState::Idle);

    let encoders = encoders.lock();
    assert_eq!(encoders.opened.len(), 1);
    assert_eq!(encoders.finished, 1);
    Ok(())
}

#[test_log::test]
fn no_frames_lost_while_recording() -> Result<()> {
    const N: u64 = 500;
    let tmp = tempfile::tempdir()?;
    let factory = Arc::new(CountingEncoderFactory::default());
    let encoders = factory.log.clone();
    let camera = ScriptedCamera::new(Some(N), Duration::from_micros(100)).failing_every(7);
    let worker = AcquisitionWorker::spawn(camera, fast_options(factory))?;

    // Never read: must not hold up recording.
    let stalled_preview = worker.subscribe_frames(1);
    let preview = worker.subscribe_frames(10_000);
    let events = worker.subscribe_events();

    worker.configure_recording(settings(tmp.path(), "lossless", "Y800")?)?;
    worker.start_recording()?;
    assert!(wait_until(Duration::from_secs(20), || {
        worker.current_frame().is_some_and(|f| f.index == N - 1)
    }));
    let session = worker.stop_recording()?.context("no session")?;

    assert_eq!(session.frame_count, N);
    assert_eq!(session.first_frame_index, Some(0));
    assert_eq!(session.last_frame_index, Some(N - 1));
    assert_eq!(encoders.lock().frames[0], (0..N).collect::<Vec<_>>());

    assert!(stalled_preview.len() <= 1);
    let shown: Vec<u64> = preview.try_iter().map(|f| f.index).collect();
    assert!(!shown.is_empty());
    assert!(shown.windows(2).all(|w| w[0] < w[1]));

    let events: Vec<WorkerEvent> = events.try_iter().collect();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, WorkerEvent::FrameError(_)))
    );
    assert!(events.iter().any(|e| matches!(
        e,
        WorkerEvent::RecordingFinished(s) if s.frame_count == N
    )));
    Ok(())
}

#[test_log::test]
fn incomplete_configuration_rejected_synchronously() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let factory = Arc::new(CountingEncoderFactory::default());
    let encoders = factory.log.clone();
    let worker = AcquisitionWorker::spawn(
        ScriptedCamera::new(None, Duration::from_millis(1)),
        fast_options(factory),
    )?;

    let err = worker.start_recording().unwrap_err();
    assert!(err.is_configuration());
    assert!(matches!(
        err,
        Error::Configuration(ConfigurationError::MissingField("filename"))
    ));

    let mut partial = settings(tmp.path(), "partial", "Y800")?;
    partial.fourcc = None;
    worker.configure_recording(partial)?;
    assert!(matches!(
        worker.start_recording(),
        Err(Error::Configuration(ConfigurationError::MissingField(
            "fourcc"
        )))
    ));
    assert_eq!(worker.state(), AcquisitionState::Idle);
    assert!(encoders.lock().opened.is_empty());
    Ok(())
}

#[test_log::test]
fn unopenable_resources_are_resource_errors() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let options = || WorkerOptions {
        device_settle: Duration::from_millis(10),
        encoder_factory: Arc::new(DefaultEncoderFactory),
        ..Default::default()
    };

    let err = AcquisitionWorker::open(&mut SimCameraModule::new(), "no-such-camera", options())
        .err()
        .context("camera opened")?;
    assert!(matches!(err, Error::Resource(ResourceError::Camera(_))));

    let worker = AcquisitionWorker::spawn(
        ScriptedCamera::new(None, Duration::from_millis(1)),
        options(),
    )?;
    worker.configure_recording(settings(tmp.path(), "x", "ABCD")?)?;
    assert!(matches!(
        worker.start_recording(),
        Err(Error::Resource(ResourceError::Encoder(_)))
    ));
    worker.configure_recording(settings(&tmp.path().join("missing"), "x", "Y800")?)?;
    assert!(matches!(
        worker.start_recording(),
        Err(Error::Resource(ResourceError::Encoder(_)))
    ));
    assert_eq!(worker.state(), AcquisitionState::Idle);
    Ok(())
}

#[test_log::test]
fn camera_parameters_through_worker() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let factory = Arc::new(CountingEncoderFactory::default());
    let mut module = SimCameraModule::new();
    let worker = AcquisitionWorker::open(&mut module, "sim-0", fast_options(factory))?;

    let controls = worker.camera_controls()?;
    assert_eq!(controls.len(), CameraParam::ALL.len());
    let gain = controls
        .iter()
        .find(|(p, _)| *p == CameraParam::Gain)
        .and_then(|(_, c)| *c)
        .context("gain control")?;
    assert_eq!((gain.min, gain.max), (0.0, 24.0));

    worker.set_camera_param(CameraParam::Gain, 6.0)?;
    assert!(matches!(
        worker.set_camera_param(CameraParam::Gain, 100.0),
        Err(Error::Resource(ResourceError::Camera(
            rig_camera::Error::OutOfRange { .. }
        )))
    ));
    worker.set_camera_param(CameraParam::Framerate, 500.0)?;
    worker.set_camera_param(CameraParam::Width, 64.0)?;
    worker.set_camera_param(CameraParam::Height, 32.0)?;

    worker.configure_recording(settings(tmp.path(), "roi", "Y800")?)?;
    worker.start_recording()?;
    // The encoder is sized already.
    assert!(is_invalid_transition(
        worker.set_camera_param(CameraParam::Width, 128.0)
    ));
    worker.set_camera_param(CameraParam::Exposure, 2000.0)?;
    let session = worker.stop_recording()?.context("no session")?;
    assert_eq!(session.settings.filename.as_deref(), Some("roi"));
    Ok(())
}

#[test_log::test]
fn shutdown_closes_open_recording() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let factory = Arc::new(CountingEncoderFactory::default());
    let encoders = factory.log.clone();
    let mut worker = AcquisitionWorker::spawn(
        ScriptedCamera::new(None, Duration::from_millis(1)),
        fast_options(factory),
    )?;
    worker.configure_recording(settings(tmp.path(), "shutdown", "Y800")?)?;
    worker.start_recording()?;
    worker.shutdown();
    assert_eq!(encoders.lock().finished, 1);
    assert!(matches!(
        worker.start_recording(),
        Err(Error::WorkerDisconnected)
    ));
    Ok(())
}
