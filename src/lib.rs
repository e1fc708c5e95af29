//! # depth-monitor - depth sensor capture-and-render pipeline
//!
//! Opens a depth sensor, pulls depth frames on a background thread, remaps
//! them to a half-resolution grayscale RGB24 image and hands that image to a
//! presentation context without blocking acquisition.
//!
//! - [`DeviceSession`]: owns the device handle (open, configure, start, fetch)
//! - [`remap()`]: 16-bit millimeters to 8-bit luminance, 2x downsampled
//! - [`CapturePipeline`]: capture loop, readiness signal, cancellation
//! - [`Presenter`]: drains frames and status text into a [`PresentationSink`]
//!
//! ## Quick Start
//! ```no_run
//! # #[cfg(feature = "test-source")] {
//! use depth_monitor::{CapturePipeline, DeviceConfig, SyntheticBackend};
//! use std::time::Duration;
//!
//! let pipeline = CapturePipeline::new(SyntheticBackend::new(), DeviceConfig::default());
//! let (result, handle) = pipeline.request_play();
//! println!("ready: {} {:?}", result.success, result.message);
//!
//! let mut handle = handle.unwrap();
//! let presenter = handle.take_presenter().unwrap();
//! std::thread::sleep(Duration::from_secs(1));
//! println!("{} frames", handle.frames_published());
//! # drop(presenter);
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
#[cfg(feature = "k4a")]
pub mod k4a;
pub mod pipeline;
pub mod present;
pub mod remap;
#[cfg(feature = "test-source")]
pub mod synthetic;
pub mod types;

pub use device::{DepthDevice, DeviceBackend, DeviceSession};
pub use error::DepthError;
#[cfg(feature = "k4a")]
pub use k4a::K4aBackend;
pub use pipeline::{CancelToken, CapturePipeline, PlayHandle};
pub use present::{FrameSlot, PresentationEvent, PresentationSink, Presenter};
pub use remap::{format_elapsed, luminance, remap, remap_into, FAR_CLIP_MM};
#[cfg(feature = "test-source")]
pub use synthetic::SyntheticBackend;
pub use types::*;

/// Result type alias for depth-monitor operations.
pub type Result<T> = std::result::Result<T, DepthError>;
