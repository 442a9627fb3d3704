// crates/visage-core/src/lib.rs

pub mod config;
pub mod frame;
pub mod image;

pub use config::{ConfigError, PipelineConfig};
pub use frame::{FrameNumber, FrameStatus, FrameTimestamps, VideoFrame};
pub use image::ImageBuffer;
