// src/config.rs

use crate::error::PipelineError;
use crate::types::Config;
use anyhow::Result;
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject thresholds the pipeline cannot run with. Invalid configuration
    /// is the only fatal error class; everything downstream degrades instead.
    pub fn validate(&self) -> Result<(), PipelineError> {
        fn check(ok: bool, msg: &str) -> Result<(), PipelineError> {
            if ok {
                Ok(())
            } else {
                Err(PipelineError::Config(msg.to_string()))
            }
        }

        check(
            self.stream.buffer_capacity >= 2,
            "stream.buffer_capacity must be at least 2",
        )?;
        check(
            self.stream.reconnect_initial_ms > 0
                && self.stream.reconnect_max_ms >= self.stream.reconnect_initial_ms,
            "stream.reconnect_max_ms must be >= stream.reconnect_initial_ms > 0",
        )?;
        check(
            (0.0..=100.0).contains(&self.motion.first_frame_motion_pct),
            "motion.first_frame_motion_pct must be in [0, 100]",
        )?;
        check(
            (0.0..=100.0).contains(&self.motion.decode_error_motion_pct),
            "motion.decode_error_motion_pct must be in [0, 100]",
        )?;
        check(
            (0.0..=100.0).contains(&self.motion.min_blob_area_pct),
            "motion.min_blob_area_pct must be in [0, 100]",
        )?;
        check(
            (0.0..1.0).contains(&self.motion.background_alpha),
            "motion.background_alpha must be in [0, 1)",
        )?;
        check(
            (0.0..0.5).contains(&self.motion.edge_margin),
            "motion.edge_margin must be in [0, 0.5)",
        )?;
        check(
            self.blobs.max_match_distance > 0.0,
            "blobs.max_match_distance must be positive",
        )?;
        check(
            (0.0..=100.0).contains(&self.gate.motion_gate_threshold),
            "gate.motion_gate_threshold must be in [0, 100]",
        )?;
        check(
            self.gate.periodic_interval >= 1,
            "gate.periodic_interval must be at least 1",
        )?;
        check(
            self.tracker.min_stable_frames >= 1,
            "tracker.min_stable_frames must be at least 1",
        )?;
        check(
            (0.0..=1.0).contains(&self.tracker.activation_threshold),
            "tracker.activation_threshold must be in [0, 1]",
        )?;
        check(
            (0.0..=1.0).contains(&self.tracker.matching_threshold),
            "tracker.matching_threshold must be in [0, 1]",
        )?;
        check(
            self.tracker.approach_growth_ratio > 1.0,
            "tracker.approach_growth_ratio must be > 1",
        )?;
        check(
            self.inference.max_concurrent_requests >= 1,
            "inference.max_concurrent_requests must be at least 1",
        )?;
        check(
            self.inference.request_timeout_ms > 0,
            "inference.request_timeout_ms must be positive",
        )?;
        check(
            (0.0..=1.0).contains(&self.inference.fallback_confidence),
            "inference.fallback_confidence must be in [0, 1]",
        )?;
        check(
            self.inference.cache_capacity >= 1,
            "inference.cache_capacity must be at least 1",
        )?;
        check(
            self.broadcast.target_fps > 0.0,
            "broadcast.target_fps must be positive",
        )?;
        check(
            self.broadcast.channel_capacity >= 1,
            "broadcast.channel_capacity must be at least 1",
        )?;

        Ok(())
    }
}

#[cfg(test)]
pub fn test_config() -> Config {
    use crate::types::*;

    Config {
        stream: StreamConfig {
            primary_url: "test.mp4".to_string(),
            fallback_url: None,
            buffer_capacity: 16,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 5000,
        },
        motion: MotionConfig::default(),
        blobs: BlobConfig::default(),
        gate: GateConfig::default(),
        tracker: TrackerConfig::default(),
        detector: DetectorConfig {
            enabled: false,
            model_path: "models/yolov8n.onnx".to_string(),
            confidence_threshold: 0.35,
            nms_threshold: 0.45,
            use_cuda: false,
            num_threads: 2,
        },
        inference: InferenceConfig {
            enabled: false,
            backend_url: "http://localhost:3000".to_string(),
            max_concurrent_requests: 2,
            request_timeout_ms: 1000,
            shutdown_grace_ms: 500,
            fallback_confidence: 0.2,
            cache_capacity: 8,
            jpeg_quality: 80,
        },
        broadcast: BroadcastConfig {
            enabled: false,
            bind_addr: "127.0.0.1:0".to_string(),
            target_fps: 15.0,
            channel_capacity: 64,
        },
        output: OutputConfig {
            output_dir: "output".to_string(),
        },
        logging: LoggingConfig {
            level: "info".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::test_config;

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut cfg = test_config();
        cfg.gate.periodic_interval = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = test_config();
        cfg.motion.first_frame_motion_pct = 150.0;
        assert!(cfg.validate().is_err());

        let mut cfg = test_config();
        cfg.tracker.matching_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }
}
