use std::time::Duration;

use super::frame::FrameError;

/// Errors raised while bringing an encode session up. All of them are fatal for
/// the session; the caller decides whether to fall back to the software path.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("codec library unavailable: {0}")]
    CodecUnavailable(String),
    #[error("codec library version {found} is older than the required {required}")]
    DriverTooOld { found: String, required: String },
    #[error("unable to open encode session: {0}")]
    SessionOpenFailed(String),
    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),
    #[error("encoder scheduler stopped before the session came up")]
    SchedulerStopped,
}

/// Per-frame outcomes. None of these stop the pipeline.
#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("bitstream for slot {slot} not ready after {waited:?}")]
    EncodeTimeout { slot: usize, waited: Duration },
    #[error("encoder rejected bitrate {bitrate} bps at {frame_rate} fps: {source}")]
    ReconfigureFailed {
        bitrate: u32,
        frame_rate: u32,
        #[source]
        source: DeviceError,
    },
    #[error("frame dropped by the rate limiter")]
    FrameDropped,
    #[error("slot {0} still holds an unretrieved bitstream")]
    SlotBusy(usize),
    #[error("slot {0} has no submitted frame")]
    NothingSubmitted(usize),
    #[error("encode session is not running")]
    NotRunning,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Failures reported by an encoder backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("{operation} failed with code {code}")]
    Call { operation: &'static str, code: i64 },
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("unknown resource handle {0}")]
    UnknownResource(u64),
    #[error("{0}")]
    Other(String),
}
