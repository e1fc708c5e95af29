use crate::{DepthError, Result};
use std::time::Duration;

/// Depth sensor operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthMode {
    /// Narrow field of view, 2x2 binned (320x288).
    NfovBinned,
    /// Narrow field of view, unbinned (640x576).
    NfovUnbinned,
    /// Wide field of view, 2x2 binned (512x512).
    WfovBinned,
    /// Wide field of view, unbinned (1024x1024).
    #[default]
    WfovUnbinned,
    /// Passive IR only (1024x1024).
    PassiveIr,
}

impl DepthMode {
    /// Nominal raw frame size `(width, height)` in pixels.
    pub fn resolution(self) -> (usize, usize) {
        match self {
            DepthMode::NfovBinned => (320, 288),
            DepthMode::NfovUnbinned => (640, 576),
            DepthMode::WfovBinned => (512, 512),
            DepthMode::WfovUnbinned | DepthMode::PassiveIr => (1024, 1024),
        }
    }

    /// Highest frame rate the mode can sustain.
    pub fn max_frame_rate(self) -> FrameRate {
        match self {
            DepthMode::WfovUnbinned => FrameRate::Fps15,
            _ => FrameRate::Fps30,
        }
    }

    pub fn parse(s: &str) -> Option<DepthMode> {
        match s {
            "nfov_binned" | "nfov_2x2binned" => Some(DepthMode::NfovBinned),
            "nfov_unbinned" => Some(DepthMode::NfovUnbinned),
            "wfov_binned" | "wfov_2x2binned" => Some(DepthMode::WfovBinned),
            "wfov_unbinned" => Some(DepthMode::WfovUnbinned),
            "passive_ir" => Some(DepthMode::PassiveIr),
            _ => None,
        }
    }
}

/// Camera frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FrameRate {
    Fps5,
    #[default]
    Fps15,
    Fps30,
}

impl FrameRate {
    pub fn hz(self) -> u32 {
        match self {
            FrameRate::Fps5 => 5,
            FrameRate::Fps15 => 15,
            FrameRate::Fps30 => 30,
        }
    }

    pub fn from_hz(hz: u32) -> Option<FrameRate> {
        match hz {
            5 => Some(FrameRate::Fps5),
            15 => Some(FrameRate::Fps15),
            30 => Some(FrameRate::Fps30),
            _ => None,
        }
    }

    /// Nominal time between frames.
    pub fn frame_interval(self) -> Duration {
        Duration::from_micros(1_000_000 / self.hz() as u64)
    }
}

/// Default wait for a single capture.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Sensor configuration applied when the session starts its streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub depth_mode: DepthMode,
    pub frame_rate: FrameRate,
    /// Suppress the streaming indicator LED on the device.
    pub disable_streaming_indicator: bool,
    /// The pipeline never consumes color; backends assert this is off.
    pub color_enabled: bool,
    /// Maximum wait for one depth frame.
    pub fetch_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            depth_mode: DepthMode::WfovUnbinned,
            frame_rate: FrameRate::Fps15,
            disable_streaming_indicator: true,
            color_enabled: false,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.color_enabled {
            return Err(DepthError::InvalidConfig(
                "color stream is not supported".into(),
            ));
        }
        if self.depth_mode == DepthMode::PassiveIr {
            return Err(DepthError::InvalidConfig(
                "PassiveIr produces no depth image".into(),
            ));
        }
        if self.frame_rate > self.depth_mode.max_frame_rate() {
            return Err(DepthError::InvalidConfig(format!(
                "{:?} does not support {} fps",
                self.depth_mode,
                self.frame_rate.hz()
            )));
        }
        if self.fetch_timeout.is_zero() {
            return Err(DepthError::InvalidConfig(
                "fetch timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

bitflags::bitflags! {
    /// Streams a device session has started.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamFlags: u8 {
        const DEPTH = 1 << 0;
        const IMU   = 1 << 1;
    }
}

/// Lifecycle of a [`DeviceSession`](crate::DeviceSession).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Open,
    Streaming,
    Faulted,
}

/// Lifecycle of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Starting,
    Streaming,
    Faulted,
    /// Cancelled through the cancel token.
    Stopped,
}

/// One depth capture: row-major millimeter samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDepthFrame {
    width: usize,
    height: usize,
    samples: Vec<u16>,
}

impl RawDepthFrame {
    pub fn new(width: usize, height: usize, samples: Vec<u16>) -> Result<RawDepthFrame> {
        let expected = width * height;
        if samples.len() != expected {
            return Err(DepthError::InvalidFrame {
                expected,
                actual: samples.len(),
            });
        }
        Ok(RawDepthFrame {
            width,
            height,
            samples,
        })
    }

    /// A frame with every sample set to `value`.
    pub fn filled(width: usize, height: usize, value: u16) -> RawDepthFrame {
        RawDepthFrame {
            width,
            height,
            samples: vec![value; width * height],
        }
    }

    /// Decode little-endian DEPTH16 rows. `stride` is the byte length of one row
    /// and may include padding.
    pub fn from_le_bytes(
        width: usize,
        height: usize,
        stride: usize,
        bytes: &[u8],
    ) -> Result<RawDepthFrame> {
        let row_bytes = width * 2;
        if stride < row_bytes || (height > 0 && bytes.len() < stride * (height - 1) + row_bytes) {
            return Err(DepthError::InvalidFrame {
                expected: width * height,
                actual: bytes.len() / 2,
            });
        }

        let mut samples = Vec::with_capacity(width * height);
        for row in 0..height {
            let start = row * stride;
            samples.extend(
                bytes[start..start + row_bytes]
                    .chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]])),
            );
        }
        Ok(RawDepthFrame {
            width,
            height,
            samples,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    pub(crate) fn samples_mut(&mut self) -> &mut [u16] {
        &mut self.samples
    }

    pub fn sample(&self, x: usize, y: usize) -> u16 {
        self.samples[y * self.width + x]
    }
}

/// Pixel layout of a display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit R, G, B per pixel, no padding.
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
        }
    }
}

/// Rectangle of a display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

/// Downsampled grayscale image in RGB24 layout.
///
/// Remembers the raw frame size it was allocated for, since several raw sizes
/// halve to the same display size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    width: usize,
    height: usize,
    source_width: usize,
    source_height: usize,
    pixels: Vec<u8>,
}

impl DisplayFrame {
    /// Display buffer for an even-sized raw frame of twice these dimensions.
    pub fn new(width: usize, height: usize) -> DisplayFrame {
        DisplayFrame::for_raw(width * 2, height * 2)
    }

    /// Allocate the display buffer for raw frames of the given size.
    pub fn for_raw(raw_width: usize, raw_height: usize) -> DisplayFrame {
        let (width, height) = (raw_width / 2, raw_height / 2);
        DisplayFrame {
            width,
            height,
            source_width: raw_width,
            source_height: raw_height,
            pixels: vec![0; width * height * PixelFormat::Rgb24.bytes_per_pixel()],
        }
    }

    /// Raw `(width, height)` this buffer accepts.
    pub fn source_size(&self) -> (usize, usize) {
        (self.source_width, self.source_height)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        PixelFormat::Rgb24
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width * PixelFormat::Rgb24.bytes_per_pixel()
    }

    pub fn region(&self) -> Region {
        Region {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub(crate) fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Become a copy of `other`, reusing this frame's pixel allocation.
    pub(crate) fn copy_from(&mut self, other: &DisplayFrame) {
        self.width = other.width;
        self.height = other.height;
        self.source_width = other.source_width;
        self.source_height = other.source_height;
        self.pixels.clone_from(&other.pixels);
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = y * self.stride() + x * 3;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }
}

/// Outcome reported to the caller that requested capture.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaptureResult {
    pub success: bool,
    pub message: Option<String>,
}

impl CaptureResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

impl From<Result<()>> for CaptureResult {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => CaptureResult::ok(),
            Err(e) => CaptureResult::failed(e.to_string()),
        }
    }
}
