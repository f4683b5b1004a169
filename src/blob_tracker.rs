// src/blob_tracker.rs
//
// Frame-to-frame identity for Tier-1 motion blobs.
//
// Association is greedy over a globally distance-sorted candidate list:
// every (previous, current) pair within max_match_distance competes, and the
// smallest displacements win first. This keeps ids stable under crowding
// without paying for a full assignment solve. Unmatched previous blobs coast
// for a short grace window before Disappear/Exit fires, so a single missed
// detection does not cycle identities.

use crate::types::{
    BlobConfig, Direction, Edge, MotionBlob, MotionEvent, MotionEventKind,
};
use tracing::debug;

struct TrackedBlob {
    blob: MotionBlob,
    frames_unmatched: u32,
    last_seen_ms: f64,
}

pub struct BlobTracker {
    config: BlobConfig,
    tracked: Vec<TrackedBlob>,
    next_id: u32,
}

impl BlobTracker {
    pub fn new(config: BlobConfig) -> Self {
        Self {
            config,
            tracked: Vec::with_capacity(16),
            next_id: 1,
        }
    }

    /// Assign identities to this frame's blobs and synthesize motion events.
    /// Returns the identified blobs (velocity filled in) and the events.
    pub fn track(
        &mut self,
        current: Vec<MotionBlob>,
        timestamp_ms: f64,
    ) -> (Vec<MotionBlob>, Vec<MotionEvent>) {
        let mut events = Vec::new();

        // ── Candidate pairs, globally sorted by displacement ──
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (pi, prev) in self.tracked.iter().enumerate() {
            for (ci, cur) in current.iter().enumerate() {
                let dist = prev.blob.distance_to(cur);
                if dist <= self.config.max_match_distance {
                    pairs.push((pi, ci, dist));
                }
            }
        }
        pairs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut prev_matched = vec![false; self.tracked.len()];
        let mut cur_assigned: Vec<Option<usize>> = vec![None; current.len()];
        for (pi, ci, _dist) in &pairs {
            if prev_matched[*pi] || cur_assigned[*ci].is_some() {
                continue;
            }
            prev_matched[*pi] = true;
            cur_assigned[*ci] = Some(*pi);
        }

        // ── Matched blobs: carry id, estimate velocity, emit Move ──
        let mut out = Vec::with_capacity(current.len());
        for (ci, mut blob) in current.into_iter().enumerate() {
            match cur_assigned[ci] {
                Some(pi) => {
                    let prev = &self.tracked[pi];
                    let dt = ((timestamp_ms - prev.last_seen_ms) / 1000.0) as f32;
                    blob.id = prev.blob.id;
                    blob.velocity = if dt > 1e-3 {
                        (
                            (blob.center.0 - prev.blob.center.0) / dt,
                            (blob.center.1 - prev.blob.center.1) / dt,
                        )
                    } else {
                        prev.blob.velocity
                    };

                    let speed =
                        (blob.velocity.0.powi(2) + blob.velocity.1.powi(2)).sqrt();
                    if speed >= self.config.min_move_speed {
                        events.push(MotionEvent {
                            kind: MotionEventKind::Move,
                            blob_id: blob.id,
                            direction: move_direction(&blob, &prev.blob),
                        });
                    }
                }
                None => {
                    blob.id = self.next_id;
                    self.next_id += 1;

                    // Exactly one of Enter/Appear per new blob: Enter when it
                    // spawned touching a boundary, Appear otherwise.
                    let (kind, direction) = match blob.edge {
                        Some(edge) => (MotionEventKind::Enter, inward_direction(edge)),
                        None => (MotionEventKind::Appear, Direction::Static),
                    };
                    debug!(
                        "Blob B{} {:?} at ({:.2}, {:.2})",
                        blob.id, kind, blob.center.0, blob.center.1
                    );
                    events.push(MotionEvent {
                        kind,
                        blob_id: blob.id,
                        direction,
                    });
                }
            }
            out.push(blob);
        }

        // ── Unmatched previous blobs: coast, then Disappear/Exit ──
        let grace = self.config.grace_frames;
        let mut survivors = Vec::with_capacity(self.tracked.len());
        for (pi, mut tracked) in self.tracked.drain(..).enumerate() {
            if prev_matched[pi] {
                continue; // replaced by the matched current blob below
            }
            tracked.frames_unmatched += 1;
            if tracked.frames_unmatched > grace {
                let (kind, direction) = match tracked.blob.edge {
                    Some(edge) => (MotionEventKind::Exit, outward_direction(edge)),
                    None => (MotionEventKind::Disappear, Direction::Static),
                };
                debug!("Blob B{} {:?}", tracked.blob.id, kind);
                events.push(MotionEvent {
                    kind,
                    blob_id: tracked.blob.id,
                    direction,
                });
            } else {
                survivors.push(tracked);
            }
        }

        self.tracked = survivors;
        for blob in &out {
            self.tracked.push(TrackedBlob {
                blob: blob.clone(),
                frames_unmatched: 0,
                last_seen_ms: timestamp_ms,
            });
        }

        (out, events)
    }

}

/// Direction of travel for a matched, moving blob. Horizontal displacement
/// dominates; pure vertical movement is read through area change (growing =
/// toward the camera).
fn move_direction(cur: &MotionBlob, prev: &MotionBlob) -> Direction {
    let (vx, vy) = cur.velocity;
    if vx.abs() >= vy.abs() {
        if vx >= 0.0 {
            Direction::MovingRight
        } else {
            Direction::MovingLeft
        }
    } else if prev.area_pct > 1e-3 {
        let growth = cur.area_pct / prev.area_pct;
        if growth > 1.15 {
            Direction::Approaching
        } else if growth < 0.87 {
            Direction::Leaving
        } else {
            Direction::Static
        }
    } else {
        Direction::Static
    }
}

/// A blob entering from `edge` travels inward
fn inward_direction(edge: Edge) -> Direction {
    match edge {
        Edge::Left => Direction::MovingRight,
        Edge::Right => Direction::MovingLeft,
        Edge::Top | Edge::Bottom => Direction::Entering,
    }
}

/// A blob exiting across `edge` travels outward
fn outward_direction(edge: Edge) -> Direction {
    match edge {
        Edge::Left => Direction::MovingLeft,
        Edge::Right => Direction::MovingRight,
        Edge::Top | Edge::Bottom => Direction::Exiting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(cx: f32, cy: f32, edge: Option<Edge>) -> MotionBlob {
        MotionBlob {
            id: 0,
            center: (cx, cy),
            size: (0.08, 0.10),
            velocity: (0.0, 0.0),
            edge,
            area_pct: 0.8,
        }
    }

    fn ts(frame: u64) -> f64 {
        frame as f64 * 33.3
    }

    #[test]
    fn test_new_blob_appears_once() {
        let mut tracker = BlobTracker::new(BlobConfig::default());
        let (blobs, events) = tracker.track(vec![blob(0.5, 0.5, None)], ts(1));

        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].id, 1);
        let appears: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.kind, MotionEventKind::Appear | MotionEventKind::Enter))
            .collect();
        assert_eq!(appears.len(), 1);
        assert_eq!(appears[0].kind, MotionEventKind::Appear);
    }

    #[test]
    fn test_edge_spawn_is_enter_not_appear() {
        let mut tracker = BlobTracker::new(BlobConfig::default());
        let (_, events) = tracker.track(vec![blob(0.03, 0.5, Some(Edge::Left))], ts(1));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MotionEventKind::Enter);
        assert_eq!(events[0].direction, Direction::MovingRight);
    }

    #[test]
    fn test_matched_blob_keeps_id() {
        let mut tracker = BlobTracker::new(BlobConfig::default());
        let (blobs, _) = tracker.track(vec![blob(0.50, 0.50, None)], ts(1));
        let id = blobs[0].id;

        for frame in 2..=6 {
            let x = 0.50 + frame as f32 * 0.01;
            let (blobs, _) = tracker.track(vec![blob(x, 0.50, None)], ts(frame));
            assert_eq!(blobs[0].id, id, "id must survive frame {frame}");
        }
    }

    #[test]
    fn test_grace_window_coasts_through_gap() {
        let mut tracker = BlobTracker::new(BlobConfig::default());
        let (blobs, _) = tracker.track(vec![blob(0.5, 0.5, None)], ts(1));
        let id = blobs[0].id;

        // Two empty frames (within grace = 3), then the blob is back
        let (_, events) = tracker.track(vec![], ts(2));
        assert!(events.is_empty());
        let (_, events) = tracker.track(vec![], ts(3));
        assert!(events.is_empty());

        let (blobs, _) = tracker.track(vec![blob(0.52, 0.5, None)], ts(4));
        assert_eq!(blobs[0].id, id, "coasting blob should re-match with same id");
    }

    #[test]
    fn test_disappear_fires_exactly_once_after_grace() {
        let config = BlobConfig {
            grace_frames: 2,
            ..BlobConfig::default()
        };
        let mut tracker = BlobTracker::new(config);
        tracker.track(vec![blob(0.5, 0.5, None)], ts(1));

        let mut disappears = 0;
        for frame in 2..=8 {
            let (_, events) = tracker.track(vec![], ts(frame));
            disappears += events
                .iter()
                .filter(|e| e.kind == MotionEventKind::Disappear)
                .count();
        }
        assert_eq!(disappears, 1);
    }

    #[test]
    fn test_crossing_left_to_right_scenario() {
        // A single blob enters at the left edge, crosses the center, reaches
        // the right edge, then leaves. Expect one Enter, one Exit, and
        // positive x-velocity on every intermediate Move.
        let mut tracker = BlobTracker::new(BlobConfig::default());

        let mut enters = 0;
        let mut exits = 0;
        let mut moves = 0;

        for frame in 0..10u64 {
            let x = 0.03 + frame as f32 * 0.105;
            let edge = if x < 0.08 {
                Some(Edge::Left)
            } else if x > 0.92 {
                Some(Edge::Right)
            } else {
                None
            };
            let (blobs, events) = tracker.track(vec![blob(x, 0.5, edge)], ts(frame + 1));

            for e in &events {
                match e.kind {
                    MotionEventKind::Enter => {
                        enters += 1;
                        assert_eq!(e.direction, Direction::MovingRight);
                    }
                    MotionEventKind::Exit => exits += 1,
                    MotionEventKind::Move => {
                        moves += 1;
                        assert!(
                            blobs[0].velocity.0 > 0.0,
                            "x-velocity must stay positive while crossing"
                        );
                    }
                    _ => panic!("unexpected event {:?}", e.kind),
                }
            }
        }

        // Blob leaves the frame entirely; run out the grace window
        for frame in 10..18u64 {
            let (_, events) = tracker.track(vec![], ts(frame + 1));
            for e in &events {
                assert_eq!(e.kind, MotionEventKind::Exit);
                assert_eq!(e.direction, Direction::MovingRight);
                exits += 1;
            }
        }

        assert_eq!(enters, 1, "exactly one Enter");
        assert_eq!(exits, 1, "exactly one Exit");
        assert!(moves >= 5, "intermediate Move events expected, got {moves}");
    }

    #[test]
    fn test_crowded_matching_prefers_smallest_total_displacement() {
        let mut tracker = BlobTracker::new(BlobConfig::default());
        let (blobs, _) = tracker.track(
            vec![blob(0.40, 0.5, None), blob(0.50, 0.5, None)],
            ts(1),
        );
        let (left_id, right_id) = (blobs[0].id, blobs[1].id);

        // Both move right by 0.04; the naive first-seen order would still
        // work here, but the sorted-pairs greedy must not cross-assign.
        let (blobs, _) = tracker.track(
            vec![blob(0.44, 0.5, None), blob(0.54, 0.5, None)],
            ts(2),
        );
        assert_eq!(blobs[0].id, left_id);
        assert_eq!(blobs[1].id, right_id);
    }

    #[test]
    fn test_velocity_estimate() {
        let mut tracker = BlobTracker::new(BlobConfig::default());
        tracker.track(vec![blob(0.50, 0.5, None)], 0.0);
        let (blobs, _) = tracker.track(vec![blob(0.60, 0.5, None)], 100.0);

        // 0.1 normalized units in 100ms = 1.0 units/sec
        assert!((blobs[0].velocity.0 - 1.0).abs() < 1e-3);
        assert!(blobs[0].velocity.1.abs() < 1e-3);
    }
}
