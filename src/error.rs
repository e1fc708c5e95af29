/// Errors that can occur while opening the sensor or running the capture loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DepthError {
    #[error("No depth device found")]
    DeviceNotFound,

    #[error("Failed to open device: {0}")]
    DeviceOpen(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Timed out waiting for a depth frame after {0} ms")]
    FetchTimeout(u64),

    #[error("Frame fetch failed: {0}")]
    Fetch(String),

    #[error("Depth frame size changed from {expected_width}x{expected_height} to {actual_width}x{actual_height}")]
    DimensionChanged {
        expected_width: usize,
        expected_height: usize,
        actual_width: usize,
        actual_height: usize,
    },

    #[error("Invalid frame: expected {expected} samples, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },

    #[error("Device session is not streaming")]
    NotStreaming,

    #[error("Device session faulted: {0}")]
    SessionFaulted(String),

    #[error("Capture cancelled")]
    Cancelled,

    #[error("Failed to spawn capture thread: {0}")]
    WorkerSpawn(String),

    #[error("Channel disconnected")]
    ChannelDisconnected,
}

impl DepthError {
    /// Errors after which the device session can no longer produce frames.
    pub fn is_fatal_fetch(&self) -> bool {
        matches!(
            self,
            DepthError::FetchTimeout(_)
                | DepthError::Fetch(_)
                | DepthError::DimensionChanged { .. }
                | DepthError::InvalidFrame { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_wait() {
        let msg = DepthError::FetchTimeout(10_000).to_string();
        assert!(msg.contains("Timed out"));
        assert!(msg.contains("10000"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(DepthError::FetchTimeout(1).is_fatal_fetch());
        assert!(DepthError::Fetch("no depth image".into()).is_fatal_fetch());
        assert!(!DepthError::Cancelled.is_fatal_fetch());
        assert!(!DepthError::DeviceNotFound.is_fatal_fetch());
    }
}
