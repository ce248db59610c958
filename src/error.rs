use crate::device::DeviceState;

pub type Result<T> = std::result::Result<T, CameraError>;

/// Errors surfaced by the capture pipeline.
///
/// Lifecycle calls fail synchronously with `InvalidState`, `DriverIo`,
/// `UnsupportedFormat` or `AlreadyArmed`; per-frame failures are absorbed
/// inside the capture loop and reported through the error message callback
/// when that message is enabled.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("{op} is illegal while the device is {state:?}")]
    InvalidState {
        op: &'static str,
        state: DeviceState,
    },

    #[error("driver i/o: {0}")]
    DriverIo(#[from] std::io::Error),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("jpeg encode: {0}")]
    Encode(String),

    #[error("a snapshot is already armed")]
    AlreadyArmed,
}

impl CameraError {
    pub fn invalid_state(op: &'static str, state: DeviceState) -> Self {
        Self::InvalidState { op, state }
    }
}
