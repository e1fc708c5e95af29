use crate::device::{DeviceBackend, DeviceSession};
use crate::present::{FrameSlot, PresentationEvent, Presenter};
use crate::remap::{remap, remap_into};
use crate::types::{CaptureResult, DeviceConfig, DisplayFrame, PipelineState};
use crate::{DepthError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Capacity of the worker → presentation event channel.
const EVENT_CAPACITY: usize = 256;

/// Frames between periodic statistics log lines.
const STATS_INTERVAL: u64 = 150;

/// How long the final `Faulted`/`Stopped` event may wait for channel space.
const FINAL_EVENT_TIMEOUT: Duration = Duration::from_secs(1);

/// Cooperative stop request, checked before each blocking fetch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One-shot readiness notification.
///
/// `resolve` consumes the signal, so it cannot fire twice; dropping an
/// unresolved signal resolves it as failed, so it cannot fire never.
struct ReadySignal(Option<Sender<CaptureResult>>);

impl ReadySignal {
    fn new() -> (ReadySignal, Receiver<CaptureResult>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (ReadySignal(Some(tx)), rx)
    }

    fn resolve(mut self, result: CaptureResult) {
        self.send(result);
    }

    fn send(&mut self, result: CaptureResult) {
        if let Some(tx) = self.0.take() {
            // Receiver may already be gone; nobody is waiting then.
            let _ = tx.send(result);
        }
    }
}

impl Drop for ReadySignal {
    fn drop(&mut self) {
        self.send(CaptureResult::failed(
            "capture loop exited before the first frame",
        ));
    }
}

/// State shared between the worker thread and its [`PlayHandle`].
struct Shared {
    state: Mutex<PipelineState>,
    fault: Mutex<Option<String>>,
    frames: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState::Idle),
            fault: Mutex::new(None),
            frames: AtomicU64::new(0),
        }
    }

    fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn fault(&self) -> Option<String> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_fault(&self, message: String) {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }
}

/// Capture-and-render pipeline for one device session.
///
/// [`play`](CapturePipeline::play) consumes the pipeline: a session is played
/// at most once, and a faulted capture needs a new pipeline.
pub struct CapturePipeline<B: DeviceBackend> {
    session: DeviceSession<B>,
    config: DeviceConfig,
    cancel: CancelToken,
}

impl<B: DeviceBackend + 'static> CapturePipeline<B> {
    pub fn new(backend: B, config: DeviceConfig) -> Self {
        Self {
            session: DeviceSession::new(backend),
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Use an externally owned cancel token, e.g. one shared with a signal handler.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start the capture worker.
    ///
    /// Returns immediately; the device is opened on the worker thread. Use
    /// [`PlayHandle::wait_ready`] to learn whether capture actually started.
    pub fn play(self) -> Result<PlayHandle> {
        let (ready, ready_rx) = ReadySignal::new();
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let slot = FrameSlot::new();
        let shared = Arc::new(Shared::new());

        let worker = Worker {
            session: self.session,
            config: self.config,
            cancel: self.cancel.clone(),
            events: events_tx,
            slot: slot.clone(),
            shared: shared.clone(),
        };

        let thread = std::thread::Builder::new()
            .name("depth-capture".into())
            .spawn(move || worker.run(ready))
            .map_err(|e| DepthError::WorkerSpawn(e.to_string()))?;

        Ok(PlayHandle {
            ready: ready_rx,
            ready_result: OnceLock::new(),
            presenter: Some(Presenter::new(events_rx, slot)),
            cancel: self.cancel,
            shared,
            thread: Some(thread),
        })
    }

    /// Start capture and wait for the readiness result.
    pub fn request_play(self) -> (CaptureResult, Option<PlayHandle>) {
        match self.play() {
            Ok(handle) => (handle.wait_ready(), Some(handle)),
            Err(e) => (CaptureResult::failed(e.to_string()), None),
        }
    }
}

/// Caller-side handle to a running capture.
///
/// Dropping the handle cancels the loop and joins the worker.
pub struct PlayHandle {
    ready: Receiver<CaptureResult>,
    ready_result: OnceLock<CaptureResult>,
    presenter: Option<Presenter>,
    cancel: CancelToken,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl PlayHandle {
    /// Block until the loop has produced its first frame or failed.
    pub fn wait_ready(&self) -> CaptureResult {
        if let Some(result) = self.ready_result.get() {
            return result.clone();
        }
        let result = self.ready.recv().unwrap_or_else(|_| {
            CaptureResult::failed("capture loop exited before the first frame")
        });
        self.ready_result.get_or_init(|| result).clone()
    }

    /// Like [`wait_ready`](Self::wait_ready), giving up after `timeout`.
    pub fn wait_ready_timeout(&self, timeout: Duration) -> Option<CaptureResult> {
        if let Some(result) = self.ready_result.get() {
            return Some(result.clone());
        }
        let result = match self.ready.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => return None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                CaptureResult::failed("capture loop exited before the first frame")
            }
        };
        Some(self.ready_result.get_or_init(|| result).clone())
    }

    /// Move the event drain to the presentation context.
    pub fn take_presenter(&mut self) -> Option<Presenter> {
        self.presenter.take()
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Message of the error that stopped the loop, if any.
    pub fn fault(&self) -> Option<String> {
        self.shared.fault()
    }

    /// Frames published to the presentation side so far.
    pub fn frames_published(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Ask the loop to stop before its next fetch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check if the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the loop to end on its own (fault or cancellation).
    pub fn join(mut self) -> PipelineState {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.shared.state()
    }

    /// Cancel the loop and wait for the worker thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PlayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum LoopExit {
    Cancelled,
    Disconnected,
    Failed(DepthError),
}

/// Everything the capture thread owns.
struct Worker<B: DeviceBackend> {
    session: DeviceSession<B>,
    config: DeviceConfig,
    cancel: CancelToken,
    events: Sender<PresentationEvent>,
    slot: Arc<FrameSlot>,
    shared: Arc<Shared>,
}

impl<B: DeviceBackend> Worker<B> {
    fn run(mut self, ready: ReadySignal) {
        self.shared.set_state(PipelineState::Starting);
        self.emit(PresentationEvent::Status("Opening depth device".into()));

        let mut ready = Some(ready);
        let exit = match self.session.open_and_start(&self.config) {
            Ok(()) => self.capture(&mut ready),
            Err(e) => LoopExit::Failed(e),
        };
        self.session.close();

        match exit {
            LoopExit::Failed(e) => {
                let message = e.to_string();
                log::error!("Depth capture faulted: {}", message);
                self.shared.set_fault(message.clone());
                self.shared.set_state(PipelineState::Faulted);
                match ready.take() {
                    Some(signal) => signal.resolve(CaptureResult::failed(message)),
                    None => self.emit_final(PresentationEvent::Faulted(message)),
                }
            }
            LoopExit::Cancelled | LoopExit::Disconnected => {
                log::info!(
                    "Depth capture stopped after {} frames",
                    self.shared.frames.load(Ordering::Relaxed)
                );
                self.shared.set_state(PipelineState::Stopped);
                if let Some(signal) = ready.take() {
                    signal.resolve(CaptureResult::failed(DepthError::Cancelled.to_string()));
                }
                self.emit_final(PresentationEvent::Stopped);
            }
        }
    }

    fn capture(&mut self, ready: &mut Option<ReadySignal>) -> LoopExit {
        let timeout = self.config.fetch_timeout;
        let mut back: Option<DisplayFrame> = None;
        let mut started_at: Option<Instant> = None;
        let mut sequence = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return LoopExit::Cancelled;
            }

            let raw = match self.session.fetch_next(timeout) {
                Ok(raw) => raw,
                Err(e) => return LoopExit::Failed(e),
            };
            log::trace!("Fetched {}x{} depth frame", raw.width(), raw.height());

            let buffer = match back.as_mut() {
                Some(buffer) => {
                    if let Err(e) = remap_into(&raw, buffer) {
                        self.session.mark_faulted(&e);
                        return LoopExit::Failed(e);
                    }
                    buffer
                }
                None => {
                    let first = remap(&raw);
                    log::info!(
                        "First depth frame {}x{}, display {}x{}",
                        raw.width(),
                        raw.height(),
                        first.width(),
                        first.height()
                    );
                    self.slot
                        .install(DisplayFrame::for_raw(raw.width(), raw.height()));
                    self.emit(PresentationEvent::Bind {
                        width: first.width(),
                        height: first.height(),
                        format: first.format(),
                    });
                    back.insert(first)
                }
            };

            sequence += 1;
            if let Err(e) = self.slot.publish(buffer, sequence) {
                self.session.mark_faulted(&e);
                return LoopExit::Failed(e);
            }
            self.shared.frames.store(sequence, Ordering::Relaxed);

            let now = Instant::now();
            if let Some(signal) = ready.take() {
                started_at = Some(now);
                self.shared.set_state(PipelineState::Streaming);
                signal.resolve(CaptureResult::ok());
                self.emit(PresentationEvent::Status("Depth capture started".into()));
            }
            let elapsed = started_at.map_or(Duration::ZERO, |t| now - t);

            if sequence % STATS_INTERVAL == 0 {
                log::debug!(
                    "{} frames in {:.1}s ({:.1} fps)",
                    sequence,
                    elapsed.as_secs_f64(),
                    sequence as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
                );
            }

            if let Err(e) = self
                .events
                .try_send(PresentationEvent::FrameReady { sequence, elapsed })
            {
                match e {
                    crossbeam_channel::TrySendError::Full(_) => {
                        log::trace!("Presentation channel full, dropping frame notification");
                    }
                    crossbeam_channel::TrySendError::Disconnected(_) => {
                        log::info!("Presentation channel disconnected, stopping capture");
                        return LoopExit::Disconnected;
                    }
                }
            }
        }
    }

    fn emit(&self, event: PresentationEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::debug!("Dropped presentation event: {:?}", e.into_inner());
        }
    }

    /// Terminal events wait briefly for a backlogged presenter to make room.
    fn emit_final(&self, event: PresentationEvent) {
        if let Err(e) = self.events.send_timeout(event, FINAL_EVENT_TIMEOUT) {
            log::debug!("Dropped presentation event: {:?}", e.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::{Calls, Exhausted, FakeBackend};
    use crate::present::RecordingSink;
    use crate::types::{PixelFormat, RawDepthFrame};

    fn quick_config() -> DeviceConfig {
        DeviceConfig {
            fetch_timeout: Duration::from_millis(20),
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_absent_device_resolves_not_ready() {
        let pipeline = CapturePipeline::new(FakeBackend::absent(), quick_config());
        let (result, handle) = pipeline.request_play();

        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("No depth device found"));
        let handle = handle.unwrap();
        assert_eq!(handle.join(), PipelineState::Faulted);
    }

    #[test]
    fn test_timeout_before_first_frame() {
        let backend = FakeBackend::new(vec![]).then(Exhausted::Timeout);
        let mut handle = CapturePipeline::new(backend, quick_config()).play().unwrap();

        let result = handle.wait_ready();
        assert!(!result.success);
        assert!(result.message.unwrap().contains("Timed out"));
        // resolved exactly once; later calls see the same answer
        assert_eq!(handle.wait_ready(), handle.wait_ready());

        let mut presenter = handle.take_presenter().unwrap();
        let mut sink = RecordingSink::default();
        let _ = presenter.drain(&mut sink);
        assert!(sink.binds.is_empty());
        assert!(sink.writes.is_empty());
        assert_eq!(handle.frames_published(), 0);
        assert_eq!(handle.join(), PipelineState::Faulted);
    }

    #[test]
    fn test_first_frame_binds_and_signals_ready() {
        let frames = vec![
            Ok(RawDepthFrame::filled(1024, 1024, 2500)),
            Ok(RawDepthFrame::filled(1024, 1024, 6000)),
        ];
        let backend = FakeBackend::new(frames).then(Exhausted::Timeout);
        let mut handle = CapturePipeline::new(backend, quick_config()).play().unwrap();

        assert_eq!(handle.wait_ready(), CaptureResult::ok());
        assert_eq!(handle.join_state_after_fault(), PipelineState::Faulted);
        assert_eq!(handle.frames_published(), 2);

        let mut presenter = handle.take_presenter().unwrap();
        let mut sink = RecordingSink::default();
        presenter.drain(&mut sink).unwrap();

        assert_eq!(sink.binds, vec![(512, 512, PixelFormat::Rgb24)]);
        // notifications are coalesced to the newest frame
        assert_eq!(sink.writes.len(), 1);
        let (region, pixels, stride) = &sink.writes[0];
        assert_eq!((region.width, region.height), (512, 512));
        assert_eq!(*stride, 512 * 3);
        assert!(pixels.iter().all(|&b| b == 255));
        assert_eq!(sink.status.first().map(String::as_str), Some("Opening depth device"));
        assert!(sink.status.iter().any(|s| s == "Depth capture started"));
        // post-ready fault reaches the status text
        assert!(sink
            .status
            .last()
            .unwrap()
            .starts_with("Capture stopped: Timed out"));
        assert!(handle.fault().unwrap().contains("Timed out"));
    }

    #[test]
    fn test_first_frame_is_published_uniform_gray() {
        let frames = vec![Ok(RawDepthFrame::filled(1024, 1024, 2500))];
        let backend = FakeBackend::new(frames).then(Exhausted::Timeout);
        let mut handle = CapturePipeline::new(backend, quick_config()).play().unwrap();
        assert!(handle.wait_ready().success);
        assert_eq!(handle.join_state_after_fault(), PipelineState::Faulted);

        let mut presenter = handle.take_presenter().unwrap();
        let mut sink = RecordingSink::default();
        presenter.drain(&mut sink).unwrap();
        assert_eq!(sink.writes.len(), 1);
        assert!(sink.writes[0].1.iter().all(|&b| b == 128));
    }

    #[test]
    fn test_dimension_change_faults_session() {
        let frames = vec![
            Ok(RawDepthFrame::filled(8, 8, 100)),
            Ok(RawDepthFrame::filled(16, 16, 100)),
        ];
        let backend = FakeBackend::new(frames).then(Exhausted::Timeout);
        let calls = backend.calls.clone();
        let handle = CapturePipeline::new(backend, quick_config()).play().unwrap();

        assert!(handle.wait_ready().success);
        let state = handle.join_state_after_fault();
        assert_eq!(state, PipelineState::Faulted);
        assert!(handle.fault().unwrap().contains("size changed"));
        assert_eq!(handle.frames_published(), 1);
        // no fetch after the fault
        assert_eq!(Calls::get(&calls.captures), 2);
        assert_eq!(Calls::get(&calls.stop_cameras), 1);
    }

    #[test]
    fn test_size_change_with_same_display_size_faults() {
        let frames = vec![
            Ok(RawDepthFrame::filled(1024, 1024, 2500)),
            Ok(RawDepthFrame::filled(1025, 1025, 2500)),
        ];
        let backend = FakeBackend::new(frames).then(Exhausted::Timeout);
        let handle = CapturePipeline::new(backend, quick_config()).play().unwrap();

        assert!(handle.wait_ready().success);
        assert_eq!(handle.join_state_after_fault(), PipelineState::Faulted);
        assert_eq!(
            handle.fault().as_deref(),
            Some("Depth frame size changed from 1024x1024 to 1025x1025")
        );
        assert_eq!(handle.frames_published(), 1);
    }

    #[test]
    fn test_odd_sized_frames_keep_streaming() {
        let frames = vec![
            Ok(RawDepthFrame::filled(9, 7, 5000)),
            Ok(RawDepthFrame::filled(9, 7, 0)),
            Ok(RawDepthFrame::filled(9, 7, 5000)),
        ];
        let backend = FakeBackend::new(frames).then(Exhausted::Timeout);
        let handle = CapturePipeline::new(backend, quick_config()).play().unwrap();

        assert!(handle.wait_ready().success);
        handle.join_state_after_fault();
        assert_eq!(handle.frames_published(), 3);
        assert!(handle.fault().unwrap().contains("Timed out"));
    }

    #[test]
    fn test_cancel_stops_streaming_loop() {
        let backend = FakeBackend::new(vec![])
            .then(Exhausted::Repeat(RawDepthFrame::filled(8, 8, 1000)))
            .with_frame_delay(Duration::from_millis(2));
        let calls = backend.calls.clone();
        let mut handle = CapturePipeline::new(backend, quick_config()).play().unwrap();
        let mut presenter = handle.take_presenter().unwrap();

        assert!(handle.wait_ready().success);
        assert_eq!(handle.state(), PipelineState::Streaming);
        handle.cancel();
        let state = handle.join_state_after_fault();

        assert_eq!(state, PipelineState::Stopped);
        assert!(handle.fault().is_none());
        assert_eq!(Calls::get(&calls.stop_cameras), 1);
        assert_eq!(Calls::get(&calls.stop_imu), 1);

        let mut sink = RecordingSink::default();
        while presenter.drain(&mut sink).is_ok() {}
        assert_eq!(sink.status.last().map(String::as_str), Some("Capture stopped"));
    }

    #[test]
    fn test_cancel_before_first_frame_resolves_not_ready() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let backend = FakeBackend::new(vec![Ok(RawDepthFrame::filled(8, 8, 1))]);
        let calls = backend.calls.clone();
        let handle = CapturePipeline::new(backend, quick_config())
            .with_cancel_token(cancel)
            .play()
            .unwrap();

        let result = handle.wait_ready();
        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("Capture cancelled"));
        assert_eq!(Calls::get(&calls.captures), 0);
    }

    #[test]
    fn test_ready_signal_resolves_on_drop() {
        let (signal, rx) = ReadySignal::new();
        drop(signal);
        let result = rx.recv().unwrap();
        assert!(!result.success);
        assert!(rx.try_recv().is_err());
    }

    impl PlayHandle {
        /// Wait for the worker to exit while keeping the handle for inspection.
        fn join_state_after_fault(&self) -> PipelineState {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !self.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            self.state()
        }
    }
}
