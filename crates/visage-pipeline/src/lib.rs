// crates/visage-pipeline/src/lib.rs

pub mod capture;
pub mod error;
pub mod event_logger;
pub mod frame_server;
pub mod image_sequence;
pub mod metrics;
pub mod output_driver;
pub mod status;
pub mod worker_pool;

pub use capture::{FrameCapture, FrameSender};
pub use error::{PipelineError, Result};
pub use event_logger::{EventLogger, EventType, EVENT_LOGGER_CHECKPOINT};
pub use frame_server::{FrameServer, WorkingFrameView};
pub use image_sequence::{ImageSequence, IMAGE_SEQUENCE_CHECKPOINT};
pub use metrics::{Metrics, MetricsTick};
pub use output_driver::{OutputDriver, OUTPUT_DRIVER_CHECKPOINT};
pub use status::{PreviewMove, PreviewPosition, Status};
pub use worker_pool::{Worker, WorkerPool, WorkerPoolParameters, WorkerSignal};

pub use visage_core::{
    FrameNumber, FrameStatus, FrameTimestamps, ImageBuffer, PipelineConfig, VideoFrame,
};
