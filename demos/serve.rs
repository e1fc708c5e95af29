//! Depth monitor over HTTP.
//!
//! Runs the capture pipeline and serves the latest display frame to a browser:
//!   GET /            page that polls the frame
//!   GET /frame.ppm   latest frame as binary PPM (P6)
//!   GET /status      current status text
//!
//! Usage:
//!   cargo run --release --example serve
//!   Open http://localhost:8081

use depth_monitor::{
    CapturePipeline, DeviceBackend, DeviceConfig, PixelFormat, PresentationSink, Region,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiny_http::{Header, Response, Server};

const PORT: u16 = 8081;

const INDEX_HTML: &str = r#"<!doctype html>
<html><head><title>Depth Monitor</title></head>
<body style="background:#111;color:#ddd;font-family:monospace">
<canvas id="c"></canvas><div id="s"></div>
<script>
async function tick() {
  const buf = new Uint8Array(await (await fetch('/frame.ppm')).arrayBuffer());
  let i = 0, fields = [];
  while (fields.length < 4) {
    let t = '';
    while (buf[i] <= 32) i++;
    while (buf[i] > 32) t += String.fromCharCode(buf[i++]);
    fields.push(t);
  }
  i++;
  const w = +fields[1], h = +fields[2];
  const c = document.getElementById('c');
  c.width = w; c.height = h;
  const ctx = c.getContext('2d');
  const img = ctx.createImageData(w, h);
  for (let p = 0; p < w * h; p++) {
    img.data.set(buf.subarray(i + p * 3, i + p * 3 + 3), p * 4);
    img.data[p * 4 + 3] = 255;
  }
  ctx.putImageData(img, 0, 0);
  document.getElementById('s').textContent = await (await fetch('/status')).text();
  setTimeout(tick, 66);
}
tick();
</script></body></html>"#;

/// Copy of the surface kept for HTTP handlers.
#[derive(Default)]
struct Surface {
    width: usize,
    height: usize,
    rgb: Vec<u8>,
    status: String,
}

impl Surface {
    fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.extend_from_slice(&self.rgb);
        out
    }
}

struct SharedSink(Arc<Mutex<Surface>>);

impl PresentationSink for SharedSink {
    fn bind_surface(&mut self, width: usize, height: usize, format: PixelFormat) {
        let mut surface = self.0.lock().unwrap();
        surface.width = width;
        surface.height = height;
        surface.rgb = vec![0; width * height * format.bytes_per_pixel()];
        eprintln!("[HTTP] Surface bound: {}x{}", width, height);
    }

    fn write_region(&mut self, region: Region, pixels: &[u8], stride: usize) {
        let mut surface = self.0.lock().unwrap();
        let row_bytes = region.width * 3;
        let surface_stride = surface.width * 3;
        for (y, row) in pixels.chunks(stride).take(region.height).enumerate() {
            let start = (region.y + y) * surface_stride + region.x * 3;
            surface.rgb[start..start + row_bytes].copy_from_slice(&row[..row_bytes]);
        }
    }

    fn set_status_text(&mut self, text: &str) {
        self.0.lock().unwrap().status = text.to_string();
    }
}

fn main() {
    env_logger::init();

    let config = DeviceConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    });

    #[cfg(feature = "k4a")]
    let backend = depth_monitor::K4aBackend::new();
    #[cfg(not(feature = "k4a"))]
    let backend = depth_monitor::SyntheticBackend::new();

    serve(backend, config);
}

fn serve<B: DeviceBackend + 'static>(backend: B, config: DeviceConfig) {
    let surface = Arc::new(Mutex::new(Surface {
        status: "Opening depth device".into(),
        ..Surface::default()
    }));

    let (result, handle) = CapturePipeline::new(backend, config).request_play();
    if !result.success {
        eprintln!(
            "[DEPTH] Failed to start capture: {}",
            result.message.unwrap_or_default()
        );
        std::process::exit(1);
    }
    let Some(mut handle) = handle else {
        std::process::exit(1);
    };
    let Some(mut presenter) = handle.take_presenter() else {
        std::process::exit(1);
    };

    let running = Arc::new(AtomicBool::new(true));
    let present_running = running.clone();
    let mut sink = SharedSink(surface.clone());
    let present_thread = std::thread::Builder::new()
        .name("depth-present".into())
        .spawn(move || {
            while present_running.load(Ordering::Relaxed) {
                if presenter.pump(&mut sink, Duration::from_millis(33)).is_err() {
                    break;
                }
            }
        })
        .expect("Failed to spawn presentation thread");

    let server = Server::http(("0.0.0.0", PORT)).unwrap_or_else(|e| {
        eprintln!("Failed to bind port {}: {}", PORT, e);
        std::process::exit(1);
    });
    eprintln!("[HTTP] http://localhost:{}", PORT);

    for request in server.incoming_requests() {
        let path = request.url().split('?').next().unwrap_or("/").to_string();
        let response = match path.as_str() {
            "/" => Response::from_string(INDEX_HTML).with_header(content_type("text/html")),
            "/frame.ppm" => {
                let body = surface.lock().unwrap().to_ppm();
                Response::from_data(body).with_header(content_type("image/x-portable-pixmap"))
            }
            "/status" => {
                let status = surface.lock().unwrap().status.clone();
                Response::from_string(status).with_header(content_type("text/plain"))
            }
            _ => Response::from_string("Not found").with_status_code(404),
        };
        if let Err(e) = request.respond(response) {
            eprintln!("[HTTP] respond error: {}", e);
        }
        if handle.is_finished() {
            eprintln!(
                "[DEPTH] Capture ended: {}",
                handle.fault().unwrap_or_else(|| "stopped".into())
            );
            break;
        }
    }

    running.store(false, Ordering::Relaxed);
    handle.stop();
    let _ = present_thread.join();
}

fn content_type(value: &str) -> Header {
    Header::from_bytes(&b"Content-Type"[..], value.as_bytes()).unwrap()
}
