//! Console depth monitor: runs the capture pipeline and prints status text.
//!
//! Usage:
//!   cargo run --example monitor                  # generated depth source
//!   cargo run --example monitor --features k4a   # Azure Kinect
//!
//! Press Ctrl+C to stop.

use depth_monitor::{
    CancelToken, CapturePipeline, DeviceBackend, DeviceConfig, PixelFormat, PresentationSink,
    Region,
};
use std::time::{Duration, Instant};

/// Prints what a UI surface would show, throttled to a few lines per second.
struct ConsoleSink {
    frames: u64,
    mean_luminance: f64,
    last_print: Instant,
}

impl PresentationSink for ConsoleSink {
    fn bind_surface(&mut self, width: usize, height: usize, format: PixelFormat) {
        println!("Surface: {}x{} {:?}", width, height, format);
    }

    fn write_region(&mut self, region: Region, pixels: &[u8], stride: usize) {
        self.frames += 1;
        let mut sum = 0u64;
        for row in pixels.chunks_exact(stride).take(region.height) {
            sum += row.iter().step_by(3).map(|&b| b as u64).sum::<u64>();
        }
        self.mean_luminance = sum as f64 / (region.width * region.height).max(1) as f64;
    }

    fn set_status_text(&mut self, text: &str) {
        // Elapsed-time updates arrive per frame; other status lines always print.
        let is_clock = text.bytes().next().is_some_and(|b| b.is_ascii_digit());
        let now = Instant::now();
        if !is_clock || now.duration_since(self.last_print) >= Duration::from_millis(500) {
            println!(
                "{:<24} frames={:<6} mean={:.1}",
                text, self.frames, self.mean_luminance
            );
            self.last_print = now;
        }
    }
}

fn run<B: DeviceBackend + 'static>(backend: B, config: DeviceConfig) {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        eprintln!("Failed to install Ctrl+C handler: {}", e);
        std::process::exit(1);
    }

    let (result, handle) = CapturePipeline::new(backend, config)
        .with_cancel_token(cancel)
        .request_play();
    if !result.success {
        eprintln!(
            "Failed to start capture: {}",
            result.message.unwrap_or_default()
        );
        std::process::exit(1);
    }
    let Some(mut handle) = handle else {
        std::process::exit(1);
    };
    println!("Started capture.");

    let Some(mut presenter) = handle.take_presenter() else {
        std::process::exit(1);
    };
    let mut sink = ConsoleSink {
        frames: 0,
        mean_luminance: 0.0,
        last_print: Instant::now(),
    };

    // Presentation loop: drain at ~30 Hz until the worker goes away
    // (Ctrl+C cancels it, which ends with a "Capture stopped" status).
    while presenter.pump(&mut sink, Duration::from_millis(33)).is_ok() {}

    if let Some(fault) = handle.fault() {
        eprintln!("Capture faulted: {}", fault);
        std::process::exit(1);
    }
}

fn main() {
    env_logger::init();

    let config = match DeviceConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    #[cfg(feature = "k4a")]
    run(depth_monitor::K4aBackend::new(), config);

    #[cfg(not(feature = "k4a"))]
    run(depth_monitor::SyntheticBackend::new(), config);
}
