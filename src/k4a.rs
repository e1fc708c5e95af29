//! Azure Kinect backend over the Sensor SDK C API (`libk4a`).
//!
//! Only the handful of entry points the depth pipeline needs are declared.
//! Enabled with the `k4a` cargo feature; links against `k4a`.

use crate::device::{DepthDevice, DeviceBackend};
use crate::types::{DepthMode, DeviceConfig, FrameRate, RawDepthFrame};
use crate::{DepthError, Result};
use std::ffi::c_int;
use std::time::Duration;

#[allow(non_camel_case_types)]
mod sys {
    use std::ffi::{c_int, c_void};

    pub type k4a_device_t = *mut c_void;
    pub type k4a_capture_t = *mut c_void;
    pub type k4a_image_t = *mut c_void;

    // k4a_result_t
    pub const K4A_RESULT_SUCCEEDED: c_int = 0;

    // k4a_wait_result_t
    pub const K4A_WAIT_RESULT_SUCCEEDED: c_int = 0;
    pub const K4A_WAIT_RESULT_TIMEOUT: c_int = 2;

    pub const K4A_DEVICE_DEFAULT: u32 = 0;

    // k4a_image_format_t
    pub const K4A_IMAGE_FORMAT_COLOR_MJPG: c_int = 0;
    pub const K4A_IMAGE_FORMAT_DEPTH16: c_int = 4;

    // k4a_color_resolution_t
    pub const K4A_COLOR_RESOLUTION_OFF: c_int = 0;

    // k4a_wired_sync_mode_t
    pub const K4A_WIRED_SYNC_MODE_STANDALONE: c_int = 0;

    #[repr(C)]
    pub struct k4a_device_configuration_t {
        pub color_format: c_int,
        pub color_resolution: c_int,
        pub depth_mode: c_int,
        pub camera_fps: c_int,
        pub synchronized_images_only: bool,
        pub depth_delay_off_color_usec: i32,
        pub wired_sync_mode: c_int,
        pub subordinate_delay_off_master_usec: u32,
        pub disable_streaming_indicator: bool,
    }

    #[link(name = "k4a")]
    extern "C" {
        pub fn k4a_device_get_installed_count() -> u32;
        pub fn k4a_device_open(index: u32, device_handle: *mut k4a_device_t) -> c_int;
        pub fn k4a_device_close(device_handle: k4a_device_t);
        pub fn k4a_device_start_cameras(
            device_handle: k4a_device_t,
            config: *const k4a_device_configuration_t,
        ) -> c_int;
        pub fn k4a_device_stop_cameras(device_handle: k4a_device_t);
        pub fn k4a_device_start_imu(device_handle: k4a_device_t) -> c_int;
        pub fn k4a_device_stop_imu(device_handle: k4a_device_t);
        pub fn k4a_device_get_capture(
            device_handle: k4a_device_t,
            capture_handle: *mut k4a_capture_t,
            timeout_in_ms: i32,
        ) -> c_int;
        pub fn k4a_capture_get_depth_image(capture_handle: k4a_capture_t) -> k4a_image_t;
        pub fn k4a_capture_release(capture_handle: k4a_capture_t);
        pub fn k4a_image_get_format(image_handle: k4a_image_t) -> c_int;
        pub fn k4a_image_get_width_pixels(image_handle: k4a_image_t) -> c_int;
        pub fn k4a_image_get_height_pixels(image_handle: k4a_image_t) -> c_int;
        pub fn k4a_image_get_stride_bytes(image_handle: k4a_image_t) -> c_int;
        pub fn k4a_image_get_buffer(image_handle: k4a_image_t) -> *mut u8;
        pub fn k4a_image_get_size(image_handle: k4a_image_t) -> usize;
        pub fn k4a_image_release(image_handle: k4a_image_t);
    }
}

/// Number of Azure Kinect devices attached.
pub fn installed_count() -> u32 {
    // SAFETY: no arguments, no preconditions.
    unsafe { sys::k4a_device_get_installed_count() }
}

fn depth_mode_value(mode: DepthMode) -> c_int {
    match mode {
        DepthMode::NfovBinned => 1,
        DepthMode::NfovUnbinned => 2,
        DepthMode::WfovBinned => 3,
        DepthMode::WfovUnbinned => 4,
        DepthMode::PassiveIr => 5,
    }
}

fn fps_value(rate: FrameRate) -> c_int {
    match rate {
        FrameRate::Fps5 => 0,
        FrameRate::Fps15 => 1,
        FrameRate::Fps30 => 2,
    }
}

fn device_configuration(config: &DeviceConfig) -> sys::k4a_device_configuration_t {
    sys::k4a_device_configuration_t {
        color_format: sys::K4A_IMAGE_FORMAT_COLOR_MJPG,
        color_resolution: sys::K4A_COLOR_RESOLUTION_OFF,
        depth_mode: depth_mode_value(config.depth_mode),
        camera_fps: fps_value(config.frame_rate),
        synchronized_images_only: false,
        depth_delay_off_color_usec: 0,
        wired_sync_mode: sys::K4A_WIRED_SYNC_MODE_STANDALONE,
        subordinate_delay_off_master_usec: 0,
        disable_streaming_indicator: config.disable_streaming_indicator,
    }
}

/// Opens the default (first) Azure Kinect.
#[derive(Debug, Default)]
pub struct K4aBackend;

impl K4aBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for K4aBackend {
    type Device = K4aDevice;

    fn open_first(&mut self) -> Result<K4aDevice> {
        if installed_count() == 0 {
            return Err(DepthError::DeviceNotFound);
        }

        let mut handle: sys::k4a_device_t = std::ptr::null_mut();
        // SAFETY: `handle` is a valid out-pointer for the duration of the call.
        let result = unsafe { sys::k4a_device_open(sys::K4A_DEVICE_DEFAULT, &mut handle) };
        if result != sys::K4A_RESULT_SUCCEEDED || handle.is_null() {
            return Err(DepthError::DeviceOpen(
                "k4a_device_open failed (device in use or not accessible)".into(),
            ));
        }

        log::info!("Opened Azure Kinect (device {})", sys::K4A_DEVICE_DEFAULT);
        Ok(K4aDevice { handle })
    }
}

/// Exclusive handle to an opened Azure Kinect.
pub struct K4aDevice {
    handle: sys::k4a_device_t,
}

// SAFETY: the SDK allows a device handle to be used from any thread; the
// session never shares it between threads concurrently.
unsafe impl Send for K4aDevice {}

/// Releases a capture handle on drop.
struct Capture(sys::k4a_capture_t);

impl Drop for Capture {
    fn drop(&mut self) {
        // SAFETY: handle came from k4a_device_get_capture and is released once.
        unsafe { sys::k4a_capture_release(self.0) }
    }
}

/// Releases an image handle on drop.
struct Image(sys::k4a_image_t);

impl Drop for Image {
    fn drop(&mut self) {
        // SAFETY: handle came from k4a_capture_get_depth_image and is released once.
        unsafe { sys::k4a_image_release(self.0) }
    }
}

impl Image {
    fn to_depth_frame(&self) -> Result<RawDepthFrame> {
        // SAFETY: self.0 is a live image handle for all calls below; the
        // buffer is valid for `size` bytes until the image is released.
        unsafe {
            if sys::k4a_image_get_format(self.0) != sys::K4A_IMAGE_FORMAT_DEPTH16 {
                return Err(DepthError::Fetch("depth image is not DEPTH16".into()));
            }
            let width = sys::k4a_image_get_width_pixels(self.0);
            let height = sys::k4a_image_get_height_pixels(self.0);
            let stride = sys::k4a_image_get_stride_bytes(self.0);
            let buffer = sys::k4a_image_get_buffer(self.0);
            let size = sys::k4a_image_get_size(self.0);
            if buffer.is_null() || width <= 0 || height <= 0 || stride <= 0 {
                return Err(DepthError::Fetch("depth image has no pixel data".into()));
            }
            let bytes = std::slice::from_raw_parts(buffer as *const u8, size);
            RawDepthFrame::from_le_bytes(width as usize, height as usize, stride as usize, bytes)
        }
    }
}

impl DepthDevice for K4aDevice {
    fn start_cameras(&mut self, config: &DeviceConfig) -> Result<()> {
        let k4a_config = device_configuration(config);
        // SAFETY: handle is open; config points to a live, fully initialised struct.
        let result = unsafe { sys::k4a_device_start_cameras(self.handle, &k4a_config) };
        if result != sys::K4A_RESULT_SUCCEEDED {
            return Err(DepthError::DeviceOpen(format!(
                "k4a_device_start_cameras rejected {:?} at {} fps",
                config.depth_mode,
                config.frame_rate.hz()
            )));
        }
        Ok(())
    }

    fn start_imu(&mut self) -> Result<()> {
        // SAFETY: handle is open and cameras are running.
        let result = unsafe { sys::k4a_device_start_imu(self.handle) };
        if result != sys::K4A_RESULT_SUCCEEDED {
            return Err(DepthError::DeviceOpen("k4a_device_start_imu failed".into()));
        }
        Ok(())
    }

    fn get_capture(&mut self, timeout: Duration) -> Result<RawDepthFrame> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let mut capture: sys::k4a_capture_t = std::ptr::null_mut();
        // SAFETY: handle is open; `capture` is a valid out-pointer.
        let result =
            unsafe { sys::k4a_device_get_capture(self.handle, &mut capture, timeout_ms) };
        match result {
            sys::K4A_WAIT_RESULT_SUCCEEDED if !capture.is_null() => {}
            sys::K4A_WAIT_RESULT_TIMEOUT => {
                return Err(DepthError::FetchTimeout(timeout_ms as u64));
            }
            _ => return Err(DepthError::Fetch("k4a_device_get_capture failed".into())),
        }
        let capture = Capture(capture);

        // SAFETY: capture handle is live until `capture` drops.
        let image = unsafe { sys::k4a_capture_get_depth_image(capture.0) };
        if image.is_null() {
            return Err(DepthError::Fetch("capture has no depth image".into()));
        }
        Image(image).to_depth_frame()
    }

    fn stop_cameras(&mut self) -> Result<()> {
        // SAFETY: handle is open.
        unsafe { sys::k4a_device_stop_cameras(self.handle) };
        Ok(())
    }

    fn stop_imu(&mut self) -> Result<()> {
        // SAFETY: handle is open.
        unsafe { sys::k4a_device_stop_imu(self.handle) };
        Ok(())
    }
}

impl Drop for K4aDevice {
    fn drop(&mut self) {
        // SAFETY: handle came from k4a_device_open and is closed exactly once.
        unsafe { sys::k4a_device_close(self.handle) };
        log::debug!("Closed Azure Kinect handle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_mapping() {
        let config = device_configuration(&DeviceConfig::default());
        assert_eq!(config.depth_mode, 4);
        assert_eq!(config.camera_fps, 1);
        assert_eq!(config.color_resolution, sys::K4A_COLOR_RESOLUTION_OFF);
        assert!(config.disable_streaming_indicator);
        assert!(!config.synchronized_images_only);
    }
}
