// crates/visage-core/src/config.rs
//
// Tree-structured pipeline configuration. Deserialized from JSON; every
// section has runnable defaults so `PipelineConfig::default()` stands on its
// own in tests and simple embeddings. Validation happens once at load —
// components trust the values they are constructed with.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Per-latency-profile FrameServer tuning. The low-latency (camera) profile
/// also carries the queue depth at which insertion blocks.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LatencyProfile {
    /// Longest edge of the detection image in pixels. When non-zero this
    /// overrides `detection_scale_factor` per frame.
    pub detection_bounding_box: u32,
    /// Fraction of the native resolution used for the detection image.
    pub detection_scale_factor: f64,
    /// Frames allowed in the store before `insert_new_frame` blocks.
    /// Only consulted in low-latency mode.
    pub max_queue_depth: usize,
}

impl Default for LatencyProfile {
    fn default() -> Self {
        LatencyProfile {
            detection_bounding_box: 320,
            detection_scale_factor: 1.0,
            max_queue_depth:        16,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FrameServerConfig {
    pub low_latency: LatencyProfile,
    pub offline:     LatencyProfile,
}

impl Default for FrameServerConfig {
    fn default() -> Self {
        FrameServerConfig {
            low_latency: LatencyProfile::default(),
            offline: LatencyProfile {
                detection_bounding_box: 0,
                detection_scale_factor: 1.0,
                max_queue_depth:        usize::MAX,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricsConfig {
    /// Rolling window over which timing averages are computed.
    pub average_over_seconds: f64,
    /// Interval between periodic metric log reports.
    pub report_every_seconds: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            average_over_seconds: 10.0,
            report_every_seconds: 10.0,
        }
    }
}

/// Worker sizing for a pool. `num_workers == 0` means derive the count as
/// `ceil(available CPUs * num_workers_per_cpu)`.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerCountConfig {
    pub num_workers:         usize,
    pub num_workers_per_cpu: f64,
}

impl Default for WorkerCountConfig {
    fn default() -> Self {
        WorkerCountConfig {
            num_workers:         0,
            num_workers_per_cpu: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Decoded frames buffered between the decoder and the frame store.
    pub buffer_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig { buffer_frames: 32 }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub frame_server:   FrameServerConfig,
    pub metrics:        MetricsConfig,
    pub image_sequence: WorkerCountConfig,
    pub capture:        CaptureConfig,
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> Result<PipelineConfig, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<PipelineConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        PipelineConfig::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, profile) in [
            ("lowLatency", &self.frame_server.low_latency),
            ("offline", &self.frame_server.offline),
        ] {
            if profile.detection_scale_factor <= 0.0 || profile.detection_scale_factor > 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "frameServer.{name}.detectionScaleFactor must be in (0, 1]"
                )));
            }
            if profile.max_queue_depth < 1 {
                return Err(ConfigError::Invalid(format!(
                    "frameServer.{name}.maxQueueDepth must be at least 1"
                )));
            }
        }
        if self.metrics.average_over_seconds <= 0.0 {
            return Err(ConfigError::Invalid(
                "metrics.averageOverSeconds must be greater than zero".into(),
            ));
        }
        if self.metrics.report_every_seconds < 1.0 {
            return Err(ConfigError::Invalid(
                "metrics.reportEverySeconds must be at least one".into(),
            ));
        }
        if self.image_sequence.num_workers_per_cpu < 0.0 {
            return Err(ConfigError::Invalid(
                "imageSequence.numWorkersPerCpu must not be negative".into(),
            ));
        }
        if self.capture.buffer_frames < 1 {
            return Err(ConfigError::Invalid(
                "capture.bufferFrames must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_partial_tree() {
        let config = PipelineConfig::from_json_str(
            r#"{ "frameServer": { "lowLatency": { "maxQueueDepth": 4 } } }"#,
        )
        .unwrap();
        assert_eq!(config.frame_server.low_latency.max_queue_depth, 4);
        // Untouched sections keep their defaults.
        assert_eq!(config.frame_server.low_latency.detection_bounding_box, 320);
        assert_eq!(config.capture.buffer_frames, 32);
    }

    #[test]
    fn rejects_scale_factor_out_of_range() {
        let result = PipelineConfig::from_json_str(
            r#"{ "frameServer": { "offline": { "detectionScaleFactor": 1.5 } } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_queue_depth() {
        let result = PipelineConfig::from_json_str(
            r#"{ "frameServer": { "lowLatency": { "maxQueueDepth": 0 } } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_short_report_interval() {
        let result =
            PipelineConfig::from_json_str(r#"{ "metrics": { "reportEverySeconds": 0.5 } }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
