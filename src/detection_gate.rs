// src/detection_gate.rs
//
// Decides whether a frame is worth running the semantic detector on.
// Skipping is the common case; the gate's only job is to cut detector load
// while bounding worst-case detection latency to `periodic_interval` frames.

use crate::types::GateConfig;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Forward(ForwardReason),
    Skip(SkipReason),
}

impl GateDecision {
    pub fn is_forward(&self) -> bool {
        matches!(self, Self::Forward(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardReason {
    /// Motion percentage cleared the gate threshold
    Motion,
    /// Periodic forced check; recovers missed low-motion entrances
    Periodic,
    /// A confirmed track has no recent corroborating detection
    PriorTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Motion below threshold and no forced check due
    LowMotion,
}

/// The decision itself, free of state: callers supply the frames elapsed
/// since the last forward.
pub fn decide(
    config: &GateConfig,
    motion_pct: f32,
    frames_since_forward: u32,
    has_prior_target: bool,
) -> GateDecision {
    if has_prior_target {
        return GateDecision::Forward(ForwardReason::PriorTarget);
    }
    if frames_since_forward >= config.periodic_interval {
        return GateDecision::Forward(ForwardReason::Periodic);
    }
    if motion_pct >= config.motion_gate_threshold {
        return GateDecision::Forward(ForwardReason::Motion);
    }
    GateDecision::Skip(SkipReason::LowMotion)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GateStats {
    pub frames_seen: u64,
    pub forwarded: u64,
    pub skipped: u64,
    pub forced_periodic: u64,
}

impl GateStats {
    pub fn skip_ratio(&self) -> f32 {
        if self.frames_seen == 0 {
            0.0
        } else {
            self.skipped as f32 / self.frames_seen as f32
        }
    }
}

pub struct DetectionGate {
    config: GateConfig,
    frames_since_forward: u32,
    stats: GateStats,
}

impl DetectionGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            frames_since_forward: 0,
            stats: GateStats::default(),
        }
    }

    pub fn check(&mut self, motion_pct: f32, has_prior_target: bool) -> GateDecision {
        self.frames_since_forward += 1;
        self.stats.frames_seen += 1;

        let decision = decide(
            &self.config,
            motion_pct,
            self.frames_since_forward,
            has_prior_target,
        );

        match decision {
            GateDecision::Forward(reason) => {
                if reason == ForwardReason::Periodic {
                    self.stats.forced_periodic += 1;
                    debug!(
                        "Gate: periodic forced check after {} frames",
                        self.frames_since_forward
                    );
                }
                self.frames_since_forward = 0;
                self.stats.forwarded += 1;
            }
            GateDecision::Skip(_) => {
                self.stats.skipped += 1;
            }
        }

        decision
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: f32, interval: u32) -> GateConfig {
        GateConfig {
            motion_gate_threshold: threshold,
            periodic_interval: interval,
        }
    }

    #[test]
    fn test_motion_forwards() {
        let mut gate = DetectionGate::new(config(0.5, 90));
        assert_eq!(
            gate.check(5.0, false),
            GateDecision::Forward(ForwardReason::Motion)
        );
    }

    #[test]
    fn test_low_motion_skips() {
        let mut gate = DetectionGate::new(config(0.5, 90));
        assert_eq!(
            gate.check(0.1, false),
            GateDecision::Skip(SkipReason::LowMotion)
        );
    }

    #[test]
    fn test_never_skips_more_than_interval_at_zero_motion() {
        let interval = 10;
        let mut gate = DetectionGate::new(config(0.5, interval));

        let mut consecutive_skips = 0u32;
        let mut max_consecutive = 0u32;
        for _ in 0..100 {
            match gate.check(0.0, false) {
                GateDecision::Skip(_) => {
                    consecutive_skips += 1;
                    max_consecutive = max_consecutive.max(consecutive_skips);
                }
                GateDecision::Forward(reason) => {
                    assert_eq!(reason, ForwardReason::Periodic);
                    consecutive_skips = 0;
                }
            }
        }
        assert!(
            max_consecutive <= interval,
            "skipped {max_consecutive} consecutive frames with interval {interval}"
        );
        assert!(gate.stats().forced_periodic >= 9);
    }

    #[test]
    fn test_prior_target_always_forwards() {
        let mut gate = DetectionGate::new(config(0.5, 90));
        // Zero motion, fresh counter: only the prior target justifies this
        assert_eq!(
            gate.check(0.0, true),
            GateDecision::Forward(ForwardReason::PriorTarget)
        );
    }

    #[test]
    fn test_periodic_counter_resets_on_any_forward() {
        let mut gate = DetectionGate::new(config(0.5, 5));
        for _ in 0..4 {
            assert!(!gate.check(0.0, false).is_forward());
        }
        // A motion forward resets the forced-check clock
        assert!(gate.check(50.0, false).is_forward());
        for _ in 0..4 {
            assert!(!gate.check(0.0, false).is_forward());
        }
        assert_eq!(
            gate.check(0.0, false),
            GateDecision::Forward(ForwardReason::Periodic)
        );
    }

    #[test]
    fn test_stats_tracking() {
        let mut gate = DetectionGate::new(config(0.5, 100));
        gate.check(5.0, false);
        gate.check(0.0, false);
        gate.check(0.0, false);

        let stats = gate.stats();
        assert_eq!(stats.frames_seen, 3);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.skipped, 2);
        assert!((stats.skip_ratio() - 2.0 / 3.0).abs() < 1e-6);
    }
}
