// crates/visage-pipeline/src/error.rs

use thiserror::Error;
use visage_core::config::ConfigError;
use visage_core::frame::{FrameNumber, FrameStatus};

/// Pipeline failures. The first group are programming errors — a component
/// driving the lifecycle incorrectly — and abort the run through the worker
/// pools' emergency path when they escape a handler.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame #{0} does not exist in the frame store")]
    UnknownFrame(FrameNumber),

    #[error("checkpoint {key:?} targets status {requested:?} but frame #{frame} is in {actual:?}")]
    CheckpointStatusMismatch {
        frame:     FrameNumber,
        requested: FrameStatus,
        actual:    FrameStatus,
        key:       String,
    },

    #[error("checkpoint {key:?} was never registered for status {status:?}")]
    UnknownCheckpoint { status: FrameStatus, key: String },

    #[error("checkpoint {key:?} already satisfied for frame #{frame}")]
    CheckpointAlreadySet { frame: FrameNumber, key: String },

    #[error("checkpoint {key:?} registered twice for status {status:?}")]
    DuplicateCheckpoint { status: FrameStatus, key: String },

    #[error("checkpoints cannot be registered for the Gone status")]
    CheckpointOnGone,

    #[error("registration must happen before the first frame is inserted")]
    RegistrationAfterInsert,

    #[error("cannot insert a new frame while draining")]
    Draining,

    #[error("emergency stop is in effect")]
    EmergencyStop,

    #[error("frame data key {0:?} is not registered")]
    UnknownFrameDataKey(String),

    #[error("frame data key {0:?} registered twice")]
    DuplicateFrameDataKey(String),

    #[error("frame data {key:?} already inserted for frame #{frame}")]
    FrameDataAlreadySet { frame: FrameNumber, key: String },

    #[error("output driver has already drained")]
    AlreadyDrained,

    #[error("event type needs a non-empty name")]
    UnnamedEventType,

    #[error("event type {0:?} registered twice; event names must be unique")]
    DuplicateEventType(String),

    #[error("event {key:?} logged again for frame #{frame} in an unsupported manner")]
    EventCollision { frame: FrameNumber, key: String },

    #[error("capture channel is closed")]
    CaptureClosed,

    #[error("worker pool {name:?} resolved to zero workers")]
    NoWorkers { name: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed event packet: {0}")]
    MalformedPacket(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_frame_and_key() {
        let err = PipelineError::CheckpointStatusMismatch {
            frame:     7,
            requested: FrameStatus::Processing,
            actual:    FrameStatus::Draining,
            key:       "faceDetector.ran".into(),
        };
        let text = err.to_string();
        assert!(text.contains("#7"));
        assert!(text.contains("faceDetector.ran"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::Io(_)));
    }
}
