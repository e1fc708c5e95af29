use crate::types::{DeviceConfig, RawDepthFrame, SessionState, StreamFlags};
use crate::{CaptureResult, DepthError, Result};
use std::time::Duration;

/// An opened depth sensor.
///
/// Implementations wrap a vendor handle. All calls may block on device I/O.
pub trait DepthDevice: Send {
    /// Configure and start the depth camera.
    fn start_cameras(&mut self, config: &DeviceConfig) -> Result<()>;

    /// Start the inertial stream.
    fn start_imu(&mut self) -> Result<()>;

    /// Wait up to `timeout` for the next capture and return its depth image.
    ///
    /// Returns [`DepthError::FetchTimeout`] when nothing arrives in time and
    /// [`DepthError::Fetch`] when the capture carries no depth image.
    fn get_capture(&mut self, timeout: Duration) -> Result<RawDepthFrame>;

    fn stop_cameras(&mut self) -> Result<()>;

    fn stop_imu(&mut self) -> Result<()>;
}

/// Source of device handles.
pub trait DeviceBackend: Send {
    type Device: DepthDevice;

    /// Acquire an exclusive handle to the first enumerated device.
    fn open_first(&mut self) -> Result<Self::Device>;
}

/// Owns the single device handle for one capture lifecycle.
///
/// The handle is opened, configured and started by [`open_and_start`], then
/// read through [`fetch_next`]. Any failure moves the session to
/// [`SessionState::Faulted`], which is terminal: a new session is needed to
/// try again.
///
/// [`open_and_start`]: DeviceSession::open_and_start
/// [`fetch_next`]: DeviceSession::fetch_next
pub struct DeviceSession<B: DeviceBackend> {
    backend: B,
    device: Option<B::Device>,
    config: Option<DeviceConfig>,
    state: SessionState,
    streams: StreamFlags,
    fault: Option<String>,
}

impl<B: DeviceBackend> DeviceSession<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            device: None,
            config: None,
            state: SessionState::Unopened,
            streams: StreamFlags::empty(),
            fault: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Streams started on the current handle.
    pub fn streams(&self) -> StreamFlags {
        self.streams
    }

    /// Configuration the streams were started with.
    pub fn config(&self) -> Option<&DeviceConfig> {
        self.config.as_ref()
    }

    /// Message of the error that faulted the session.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Open the first device and start the depth and IMU streams.
    ///
    /// A no-op when the session is already open.
    pub fn open_and_start(&mut self, config: &DeviceConfig) -> Result<()> {
        match self.state {
            SessionState::Open | SessionState::Streaming => {
                log::debug!("Device session already {:?}", self.state);
                return Ok(());
            }
            SessionState::Faulted => {
                return Err(DepthError::SessionFaulted(
                    self.fault.clone().unwrap_or_default(),
                ));
            }
            SessionState::Unopened => {}
        }

        match self.try_open(config) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_faulted(&e);
                Err(e)
            }
        }
    }

    /// [`open_and_start`](Self::open_and_start) reported as a [`CaptureResult`].
    pub fn open_result(&mut self, config: &DeviceConfig) -> CaptureResult {
        self.open_and_start(config).into()
    }

    fn try_open(&mut self, config: &DeviceConfig) -> Result<()> {
        config.validate()?;

        let device = self.backend.open_first()?;
        self.state = SessionState::Open;
        let device = self.device.insert(device);

        log::info!(
            "Starting depth camera: mode={:?} fps={} indicator={}",
            config.depth_mode,
            config.frame_rate.hz(),
            if config.disable_streaming_indicator {
                "off"
            } else {
                "on"
            }
        );
        device.start_cameras(config)?;
        self.streams |= StreamFlags::DEPTH;

        device.start_imu()?;
        self.streams |= StreamFlags::IMU;

        self.config = Some(config.clone());
        self.state = SessionState::Streaming;
        log::info!("Device streaming ({:?})", self.streams);
        Ok(())
    }

    /// Block until the next depth frame arrives or `timeout` elapses.
    ///
    /// Timeouts and device errors fault the session and close the handle.
    pub fn fetch_next(&mut self, timeout: Duration) -> Result<RawDepthFrame> {
        if self.state == SessionState::Faulted {
            return Err(DepthError::SessionFaulted(
                self.fault.clone().unwrap_or_default(),
            ));
        }
        let device = match (self.state, self.device.as_mut()) {
            (SessionState::Streaming, Some(device)) => device,
            _ => return Err(DepthError::NotStreaming),
        };

        let result = device.get_capture(timeout).and_then(|frame| {
            if frame.width() == 0 || frame.height() == 0 {
                Err(DepthError::Fetch("capture has no depth image".into()))
            } else {
                Ok(frame)
            }
        });

        if let Err(e) = &result {
            if e.is_fatal_fetch() {
                self.set_faulted(e);
            }
        }
        result
    }

    /// Record an error raised outside the session (e.g. by the remapper) as fatal.
    pub fn mark_faulted(&mut self, err: &DepthError) {
        if self.state != SessionState::Faulted {
            self.set_faulted(err);
        }
    }

    /// Stop started streams and release the handle.
    pub fn close(&mut self) {
        self.release();
        if self.state != SessionState::Faulted {
            self.state = SessionState::Unopened;
        }
    }

    fn set_faulted(&mut self, err: &DepthError) {
        log::error!("Device session faulted: {}", err);
        self.release();
        self.fault = Some(err.to_string());
        self.state = SessionState::Faulted;
    }

    fn release(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };
        if self.streams.contains(StreamFlags::IMU) {
            if let Err(e) = device.stop_imu() {
                log::warn!("Failed to stop IMU: {}", e);
            }
        }
        if self.streams.contains(StreamFlags::DEPTH) {
            if let Err(e) = device.stop_cameras() {
                log::warn!("Failed to stop cameras: {}", e);
            }
        }
        self.streams = StreamFlags::empty();
        drop(device);
        log::info!("Device closed");
    }
}

impl<B: DeviceBackend> Drop for DeviceSession<B> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Scripted device used by the unit tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    pub struct Calls {
        pub opens: AtomicUsize,
        pub start_cameras: AtomicUsize,
        pub start_imu: AtomicUsize,
        pub stop_cameras: AtomicUsize,
        pub stop_imu: AtomicUsize,
        pub captures: AtomicUsize,
    }

    impl Calls {
        pub fn get(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    /// What `get_capture` does once the script runs out.
    #[derive(Clone)]
    pub enum Exhausted {
        /// Sleep for the timeout, then report a timeout.
        Timeout,
        /// Keep returning this frame.
        Repeat(RawDepthFrame),
    }

    pub struct FakeDevice {
        script: VecDeque<Result<RawDepthFrame>>,
        exhausted: Exhausted,
        frame_delay: Duration,
        calls: Arc<Calls>,
        start_error: Option<DepthError>,
    }

    impl DepthDevice for FakeDevice {
        fn start_cameras(&mut self, _config: &DeviceConfig) -> Result<()> {
            self.calls.start_cameras.fetch_add(1, Ordering::SeqCst);
            match self.start_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn start_imu(&mut self) -> Result<()> {
            self.calls.start_imu.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn get_capture(&mut self, timeout: Duration) -> Result<RawDepthFrame> {
            self.calls.captures.fetch_add(1, Ordering::SeqCst);
            if !self.frame_delay.is_zero() {
                std::thread::sleep(self.frame_delay);
            }
            if let Some(next) = self.script.pop_front() {
                return next;
            }
            match &self.exhausted {
                Exhausted::Timeout => {
                    std::thread::sleep(timeout);
                    Err(DepthError::FetchTimeout(timeout.as_millis() as u64))
                }
                Exhausted::Repeat(frame) => Ok(frame.clone()),
            }
        }

        fn stop_cameras(&mut self) -> Result<()> {
            self.calls.stop_cameras.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop_imu(&mut self) -> Result<()> {
            self.calls.stop_imu.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct FakeBackend {
        pub calls: Arc<Calls>,
        script: Option<VecDeque<Result<RawDepthFrame>>>,
        exhausted: Exhausted,
        frame_delay: Duration,
        open_error: Option<DepthError>,
        start_error: Option<DepthError>,
    }

    impl FakeBackend {
        pub fn new(frames: Vec<Result<RawDepthFrame>>) -> Self {
            Self {
                calls: Arc::new(Calls::default()),
                script: Some(frames.into()),
                exhausted: Exhausted::Timeout,
                frame_delay: Duration::ZERO,
                open_error: None,
                start_error: None,
            }
        }

        pub fn absent() -> Self {
            let mut backend = Self::new(Vec::new());
            backend.open_error = Some(DepthError::DeviceNotFound);
            backend
        }

        pub fn failing_start(err: DepthError) -> Self {
            let mut backend = Self::new(Vec::new());
            backend.start_error = Some(err);
            backend
        }

        pub fn then(mut self, exhausted: Exhausted) -> Self {
            self.exhausted = exhausted;
            self
        }

        pub fn with_frame_delay(mut self, delay: Duration) -> Self {
            self.frame_delay = delay;
            self
        }
    }

    impl DeviceBackend for FakeBackend {
        type Device = FakeDevice;

        fn open_first(&mut self) -> Result<FakeDevice> {
            self.calls.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.open_error.clone() {
                return Err(e);
            }
            let script = self
                .script
                .take()
                .ok_or_else(|| DepthError::DeviceOpen("device already claimed".into()))?;
            Ok(FakeDevice {
                script,
                exhausted: self.exhausted.clone(),
                frame_delay: self.frame_delay,
                calls: self.calls.clone(),
                start_error: self.start_error.take(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{Calls, Exhausted, FakeBackend};
    use super::*;

    fn frame(value: u16) -> RawDepthFrame {
        RawDepthFrame::filled(8, 8, value)
    }

    #[test]
    fn test_open_starts_depth_and_imu() {
        let backend = FakeBackend::new(vec![]);
        let calls = backend.calls.clone();
        let mut session = DeviceSession::new(backend);

        assert_eq!(session.state(), SessionState::Unopened);
        session.open_and_start(&DeviceConfig::default()).unwrap();

        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.streams(), StreamFlags::DEPTH | StreamFlags::IMU);
        assert_eq!(Calls::get(&calls.start_cameras), 1);
        assert_eq!(Calls::get(&calls.start_imu), 1);
    }

    #[test]
    fn test_open_twice_does_not_restart_streams() {
        let backend = FakeBackend::new(vec![]);
        let calls = backend.calls.clone();
        let mut session = DeviceSession::new(backend);
        let config = DeviceConfig::default();

        session.open_and_start(&config).unwrap();
        session.open_and_start(&config).unwrap();
        assert!(session.open_result(&config).success);

        assert_eq!(Calls::get(&calls.opens), 1);
        assert_eq!(Calls::get(&calls.start_cameras), 1);
        assert_eq!(Calls::get(&calls.start_imu), 1);
    }

    #[test]
    fn test_absent_device_faults_session() {
        let mut session = DeviceSession::new(FakeBackend::absent());
        let result = session.open_result(&DeviceConfig::default());

        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("No depth device found"));
        assert_eq!(session.state(), SessionState::Faulted);

        // faulted is terminal
        let err = session.open_and_start(&DeviceConfig::default()).unwrap_err();
        assert!(matches!(err, DepthError::SessionFaulted(_)));
    }

    #[test]
    fn test_rejected_configuration_releases_handle() {
        let backend =
            FakeBackend::failing_start(DepthError::DeviceOpen("configuration rejected".into()));
        let calls = backend.calls.clone();
        let mut session = DeviceSession::new(backend);

        let err = session.open_and_start(&DeviceConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "Failed to open device: configuration rejected");
        assert_eq!(session.state(), SessionState::Faulted);
        assert_eq!(session.streams(), StreamFlags::empty());
        // cameras never started, so nothing to stop
        assert_eq!(Calls::get(&calls.stop_cameras), 0);
        assert_eq!(Calls::get(&calls.start_imu), 0);
    }

    #[test]
    fn test_fetch_before_open_is_rejected() {
        let mut session = DeviceSession::new(FakeBackend::new(vec![Ok(frame(1))]));
        assert_eq!(
            session.fetch_next(Duration::from_millis(5)).unwrap_err(),
            DepthError::NotStreaming
        );
        assert_eq!(session.state(), SessionState::Unopened);
    }

    #[test]
    fn test_fetch_returns_frames_in_order() {
        let mut session =
            DeviceSession::new(FakeBackend::new(vec![Ok(frame(1)), Ok(frame(2))]));
        session.open_and_start(&DeviceConfig::default()).unwrap();

        let timeout = Duration::from_millis(5);
        assert_eq!(session.fetch_next(timeout).unwrap().sample(0, 0), 1);
        assert_eq!(session.fetch_next(timeout).unwrap().sample(0, 0), 2);
    }

    #[test]
    fn test_fetch_timeout_faults_and_closes() {
        let backend = FakeBackend::new(vec![]).then(Exhausted::Timeout);
        let calls = backend.calls.clone();
        let mut session = DeviceSession::new(backend);
        session.open_and_start(&DeviceConfig::default()).unwrap();

        let err = session.fetch_next(Duration::from_millis(5)).unwrap_err();
        assert_eq!(err, DepthError::FetchTimeout(5));
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(session.fault().unwrap().contains("Timed out"));
        assert_eq!(Calls::get(&calls.stop_imu), 1);
        assert_eq!(Calls::get(&calls.stop_cameras), 1);

        // no retry after a fault
        assert!(matches!(
            session.fetch_next(Duration::from_millis(5)),
            Err(DepthError::SessionFaulted(_))
        ));
        assert_eq!(Calls::get(&calls.captures), 1);
    }

    #[test]
    fn test_empty_capture_is_fetch_error() {
        let empty = RawDepthFrame::new(0, 0, vec![]).unwrap();
        let mut session = DeviceSession::new(FakeBackend::new(vec![Ok(empty)]));
        session.open_and_start(&DeviceConfig::default()).unwrap();

        let err = session.fetch_next(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, DepthError::Fetch(_)));
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_drop_stops_streams() {
        let backend = FakeBackend::new(vec![]);
        let calls = backend.calls.clone();
        {
            let mut session = DeviceSession::new(backend);
            session.open_and_start(&DeviceConfig::default()).unwrap();
        }
        assert_eq!(Calls::get(&calls.stop_imu), 1);
        assert_eq!(Calls::get(&calls.stop_cameras), 1);
    }
}
