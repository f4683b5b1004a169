// src/pipeline/metrics.rs
//
// Production observability. Counts and per-stage timings for every
// subsystem, reported at shutdown and on demand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_frames: Arc<AtomicU64>,
    pub decode_errors: Arc<AtomicU64>,
    pub frames_with_motion: Arc<AtomicU64>,
    pub gate_forwards: Arc<AtomicU64>,
    pub gate_skips: Arc<AtomicU64>,
    pub detector_runs: Arc<AtomicU64>,
    pub detector_failures: Arc<AtomicU64>,
    pub objects_entered: Arc<AtomicU64>,
    pub objects_exited: Arc<AtomicU64>,
    pub inference_submitted: Arc<AtomicU64>,
    pub inference_timeouts: Arc<AtomicU64>,
    pub inference_cached: Arc<AtomicU64>,
    pub inference_failures: Arc<AtomicU64>,
    pub motion_time_us: Arc<AtomicU64>,
    pub detector_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            total_frames: Arc::new(AtomicU64::new(0)),
            decode_errors: Arc::new(AtomicU64::new(0)),
            frames_with_motion: Arc::new(AtomicU64::new(0)),
            gate_forwards: Arc::new(AtomicU64::new(0)),
            gate_skips: Arc::new(AtomicU64::new(0)),
            detector_runs: Arc::new(AtomicU64::new(0)),
            detector_failures: Arc::new(AtomicU64::new(0)),
            objects_entered: Arc::new(AtomicU64::new(0)),
            objects_exited: Arc::new(AtomicU64::new(0)),
            inference_submitted: Arc::new(AtomicU64::new(0)),
            inference_timeouts: Arc::new(AtomicU64::new(0)),
            inference_cached: Arc::new(AtomicU64::new(0)),
            inference_failures: Arc::new(AtomicU64::new(0)),
            motion_time_us: Arc::new(AtomicU64::new(0)),
            detector_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Final session report
    pub fn report(&self) {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let forwards = self.gate_forwards.load(Ordering::Relaxed);
        let skips = self.gate_skips.load(Ordering::Relaxed);
        let skip_pct = if frames > 0 {
            skips as f64 / frames as f64 * 100.0
        } else {
            0.0
        };

        info!("📊 Session Report:");
        info!("  Frames analyzed: {}", frames);
        info!(
            "  Decode errors: {}",
            self.decode_errors.load(Ordering::Relaxed)
        );
        info!(
            "  Frames with motion: {}",
            self.frames_with_motion.load(Ordering::Relaxed)
        );
        info!(
            "  Gate: {} forwarded, {} skipped ({:.1}%)",
            forwards, skips, skip_pct
        );
        info!(
            "  Detector runs: {} ({} failures)",
            self.detector_runs.load(Ordering::Relaxed),
            self.detector_failures.load(Ordering::Relaxed)
        );
        info!(
            "  Objects: {} entered, {} exited",
            self.objects_entered.load(Ordering::Relaxed),
            self.objects_exited.load(Ordering::Relaxed)
        );
        info!(
            "  Inference: {} submitted, {} cached, {} timed out, {} failed",
            self.inference_submitted.load(Ordering::Relaxed),
            self.inference_cached.load(Ordering::Relaxed),
            self.inference_timeouts.load(Ordering::Relaxed),
            self.inference_failures.load(Ordering::Relaxed)
        );
        info!(
            "  Last stage timings: motion {}us, detector {}us",
            self.motion_time_us.load(Ordering::Relaxed),
            self.detector_time_us.load(Ordering::Relaxed)
        );
        info!("  Analysis speed: {:.1} FPS", self.fps());
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = PipelineMetrics::new();
        metrics.inc(&metrics.total_frames);
        metrics.inc(&metrics.total_frames);
        metrics.inc(&metrics.gate_skips);
        metrics.set_timing(&metrics.motion_time_us, 850);

        assert_eq!(metrics.total_frames.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.gate_skips.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.motion_time_us.load(Ordering::Relaxed), 850);
    }
}
