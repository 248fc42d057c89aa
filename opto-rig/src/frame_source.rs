use rig_camera::{Camera, Frame};
use tracing::{debug, trace};

/// Polls a camera for frames while acquisition is active.
///
/// `start` and `stop` are idempotent: the device is told to start or stop
/// exactly once per transition.
pub struct FrameSource<C> {
    camera: C,
    active: bool,
}

impl<C: Camera> FrameSource<C> {
    pub fn new(camera: C) -> Self {
        Self {
            camera,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn start(&mut self) -> rig_camera::Result<()> {
        if self.active {
            return Ok(());
        }
        self.camera.acquisition_start()?;
        self.active = true;
        debug!("{}: acquisition started", self.camera.name());
        Ok(())
    }

    pub fn stop(&mut self) -> rig_camera::Result<()> {
        if !self.active {
            return Ok(());
        }
        // Considered stopped even if the device complains.
        self.active = false;
        self.camera.acquisition_stop()?;
        debug!("{}: acquisition stopped", self.camera.name());
        Ok(())
    }

    /// The next frame, blocking on the device read. `Ok(None)` if
    /// acquisition is not active or the device had no frame ready.
    pub fn poll(&mut self) -> rig_camera::Result<Option<Frame>> {
        if !self.active {
            return Ok(None);
        }
        match self.camera.next_frame()? {
            Some(frame) if !frame.is_empty() => Ok(Some(frame)),
            Some(frame) => {
                trace!("dropping empty frame {}", frame.index);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut C {
        &mut self.camera
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rig_camera::{CameraParam, PixelFormat};

    #[derive(Default)]
    struct CountingCamera {
        starts: usize,
        stops: usize,
        next: u64,
    }

    impl Camera for CountingCamera {
        fn name(&self) -> &str {
            "counting"
        }
        fn param(&self, _: CameraParam) -> rig_camera::Result<Option<f64>> {
            Ok(None)
        }
        fn set_param(&mut self, p: CameraParam, _: f64) -> rig_camera::Result<()> {
            Err(rig_camera::Error::ParamNotSupported(p))
        }
        fn param_range(&self, _: CameraParam) -> Option<(f64, f64)> {
            None
        }
        fn param_increment(&self, _: CameraParam) -> Option<f64> {
            None
        }
        fn acquisition_start(&mut self) -> rig_camera::Result<()> {
            self.starts += 1;
            Ok(())
        }
        fn acquisition_stop(&mut self) -> rig_camera::Result<()> {
            self.stops += 1;
            Ok(())
        }
        fn next_frame(&mut self) -> rig_camera::Result<Option<Frame>> {
            let index = self.next;
            self.next += 1;
            // Every other frame comes back without data.
            let data = if index % 2 == 0 { vec![0; 4] } else { vec![] };
            Ok(Some(Frame {
                index,
                timestamp: chrono::Utc::now(),
                width: 2,
                height: 2,
                pixel_format: PixelFormat::Mono8,
                data,
            }))
        }
    }

    #[test]
    fn start_stop_reach_device_once() {
        let mut src = FrameSource::new(CountingCamera::default());
        src.start().unwrap();
        src.start().unwrap();
        assert_eq!(src.camera().starts, 1);
        src.stop().unwrap();
        src.stop().unwrap();
        assert_eq!(src.camera().stops, 1);
        assert!(src.poll().unwrap().is_none());
    }

    #[test]
    fn empty_frames_not_forwarded() {
        let mut src = FrameSource::new(CountingCamera::default());
        src.start().unwrap();
        let got: Vec<_> = (0..6).filter_map(|_| src.poll().unwrap()).collect();
        assert_eq!(
            got.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![0, 2, 4]
        );
    }
}
