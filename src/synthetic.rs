//! Generated depth source for running the pipeline without hardware.
//!
//! Produces a slowly sweeping ramp: depth grows from the left edge to beyond
//! the far clip on the right, with a band that travels down the frame. Frames
//! are paced at the configured frame rate.

use crate::device::{DepthDevice, DeviceBackend};
use crate::types::{DepthMode, DeviceConfig, RawDepthFrame};
use crate::{DepthError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Farthest generated depth in millimeters.
const MAX_DEPTH_MM: u32 = 6_000;

/// Backend handing out one [`SyntheticDevice`] at a time.
#[derive(Debug, Default, Clone)]
pub struct SyntheticBackend {
    claimed: Arc<AtomicBool>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceBackend for SyntheticBackend {
    type Device = SyntheticDevice;

    fn open_first(&mut self) -> Result<SyntheticDevice> {
        if self.claimed.swap(true, Ordering::SeqCst) {
            return Err(DepthError::DeviceOpen(
                "synthetic device already claimed".into(),
            ));
        }
        log::info!("Opened synthetic depth source");
        Ok(SyntheticDevice {
            claimed: self.claimed.clone(),
            mode: DepthMode::default(),
            interval: Duration::ZERO,
            next_due: None,
            frame_index: 0,
        })
    }
}

pub struct SyntheticDevice {
    claimed: Arc<AtomicBool>,
    mode: DepthMode,
    interval: Duration,
    next_due: Option<Instant>,
    frame_index: u64,
}

impl SyntheticDevice {
    fn render(&self) -> RawDepthFrame {
        let (width, height) = self.mode.resolution();
        let band_row = (self.frame_index as usize * 4) % height.max(1);
        let mut frame = RawDepthFrame::filled(width, height, 0);

        for (y, row) in frame.samples_mut().chunks_exact_mut(width).enumerate() {
            let in_band = y.abs_diff(band_row) < height / 16;
            for (x, sample) in row.iter_mut().enumerate() {
                let ramp = ((x as u32 * MAX_DEPTH_MM) / width as u32) as u16;
                *sample = if in_band { ramp / 2 } else { ramp };
            }
        }
        frame
    }
}

impl DepthDevice for SyntheticDevice {
    fn start_cameras(&mut self, config: &DeviceConfig) -> Result<()> {
        self.mode = config.depth_mode;
        self.interval = config.frame_rate.frame_interval();
        self.next_due = Some(Instant::now() + self.interval);
        Ok(())
    }

    fn start_imu(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_capture(&mut self, timeout: Duration) -> Result<RawDepthFrame> {
        let due = self.next_due.ok_or(DepthError::NotStreaming)?;

        let wait = due.saturating_duration_since(Instant::now());
        if wait > timeout {
            std::thread::sleep(timeout);
            return Err(DepthError::FetchTimeout(timeout.as_millis() as u64));
        }
        std::thread::sleep(wait);

        let frame = self.render();
        self.frame_index += 1;
        self.next_due = Some(due + self.interval);
        Ok(frame)
    }

    fn stop_cameras(&mut self) -> Result<()> {
        self.next_due = None;
        Ok(())
    }

    fn stop_imu(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.claimed.store(false, Ordering::SeqCst);
    }
}
