// src/semantic_tracker.rs
//
// Tier-2 object tracking over discrete labeled detections.
//
// Lifecycle: New -> Tracked -> Lost -> Gone (terminal).
//   - A detection nobody claims spawns a New track (if confident enough).
//   - New promotes to Tracked after min_stable_frames consecutive hits;
//     only that promotion is reported as an entry, so single-frame detector
//     flicker never reaches consumers.
//   - A miss sends New/Tracked to Lost; a re-match within max_lost_frames
//     restores the same id (the whole point over per-frame detection).
//   - Lost past max_lost_frames becomes Gone and is evicted on the next
//     update. Ids are never reused.
//
// Association is IoU-greedy over a globally sorted candidate list, ties
// broken by center distance. The object_type label is locked at spawn;
// detector class flicker must not rewrite an established identity.

use crate::types::{
    Detection, Direction, ExitPolicy, Track, TrackState, TrackerConfig, TrackingResult,
};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Normalized distance from a frame boundary treated as the entry/exit zone
const BOUNDARY_ZONE: f32 = 0.15;

pub struct SemanticTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
    total_count: u64,
}

impl SemanticTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::with_capacity(16),
            next_id: 1,
            total_count: 0,
        }
    }

    /// Process one batch of detections. Detections may be noisy, missing, or
    /// low-confidence; the lifecycle absorbs all of that.
    pub fn update(&mut self, detections: &[Detection], timestamp_ms: f64) -> TrackingResult {
        // Tracks that went Gone last update leave the active set now
        self.tracks.retain(|t| t.state != TrackState::Gone);

        let mut entries: Vec<Track> = Vec::new();
        let mut exits: Vec<Track> = Vec::new();

        // ── IoU association, globally sorted, center distance as tie-break ──
        let mut pairs: Vec<(usize, usize, f32, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.config.matching_threshold {
                    pairs.push((ti, di, iou, track.bbox.center_distance(&det.bbox)));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];
        let mut assignments: Vec<(usize, usize)> = Vec::new();
        for (ti, di, _iou, _dist) in &pairs {
            if track_matched[*ti] || det_matched[*di] {
                continue;
            }
            track_matched[*ti] = true;
            det_matched[*di] = true;
            assignments.push((*ti, *di));
        }

        // ── Matched tracks ──
        for (ti, di) in assignments {
            let det = &detections[di];
            let track = &mut self.tracks[ti];

            track.bbox = det.bbox;
            track.confidence = det.confidence;
            track.last_seen_ms = timestamp_ms;
            track.frames_lost = 0;
            track.push_position(timestamp_ms);

            match track.state {
                TrackState::New => {
                    track.frames_tracked += 1;
                    if track.frames_tracked >= self.config.min_stable_frames {
                        track.state = TrackState::Tracked;
                        info!(
                            "Track #{} ({}) confirmed after {} consecutive hits",
                            track.id, track.object_type, track.frames_tracked
                        );
                        entries.push(track.clone());
                    }
                }
                TrackState::Tracked => {
                    track.frames_tracked += 1;
                }
                TrackState::Lost => {
                    // Re-acquisition, same id. A track that never reached
                    // stability restarts its consecutive-hit count instead.
                    if track.frames_tracked >= self.config.min_stable_frames {
                        track.state = TrackState::Tracked;
                        track.frames_tracked += 1;
                        debug!("Track #{} re-acquired", track.id);
                    } else {
                        track.state = TrackState::New;
                        track.frames_tracked = 1;
                    }
                }
                TrackState::Gone => unreachable!("Gone tracks are evicted before matching"),
            }

            track.direction = classify_direction(track, &self.config);
        }

        // ── Unmatched tracks: Lost, then Gone ──
        let exit_policy = self.config.exit_policy;
        let min_stable = self.config.min_stable_frames;
        let max_lost = self.config.max_lost_frames;
        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if track_matched[ti] {
                continue;
            }
            match track.state {
                TrackState::New | TrackState::Tracked => {
                    let was_confirmed = track.frames_tracked >= min_stable;
                    track.state = TrackState::Lost;
                    track.frames_lost = 1;
                    if was_confirmed && exit_policy == ExitPolicy::OnLost {
                        exits.push(track.clone());
                    }
                }
                TrackState::Lost => {
                    track.frames_lost += 1;
                    if track.frames_lost > max_lost {
                        track.state = TrackState::Gone;
                        info!(
                            "Track #{} ({}) gone after {} lost updates",
                            track.id, track.object_type, track.frames_lost
                        );
                        let was_confirmed = track.frames_tracked >= min_stable;
                        if was_confirmed && exit_policy == ExitPolicy::OnGone {
                            exits.push(track.clone());
                        }
                    }
                }
                TrackState::Gone => {}
            }
        }

        // ── Unmatched detections: spawn, confidence permitting ──
        for (di, det) in detections.iter().enumerate() {
            if det_matched[di] {
                continue;
            }
            if det.confidence < self.config.activation_threshold {
                continue;
            }
            let mut track = Track {
                id: self.next_id,
                object_type: det.label.clone(),
                bbox: det.bbox,
                state: TrackState::New,
                direction: Direction::Static,
                first_seen_ms: timestamp_ms,
                last_seen_ms: timestamp_ms,
                frames_tracked: 1,
                frames_lost: 0,
                confidence: det.confidence,
                positions: VecDeque::with_capacity(8),
                areas: VecDeque::with_capacity(8),
            };
            track.push_position(timestamp_ms);
            self.next_id += 1;
            debug!(
                "Track #{} spawned: {} at ({:.2}, {:.2}) conf={:.2}",
                track.id, track.object_type, track.bbox.cx, track.bbox.cy, track.confidence
            );

            // min_stable_frames = 1 confirms on the spawning detection
            if track.frames_tracked >= self.config.min_stable_frames {
                track.state = TrackState::Tracked;
                entries.push(track.clone());
            }

            self.tracks.push(track);
        }

        self.total_count += entries.len() as u64;

        let objects: Vec<Track> = self
            .tracks
            .iter()
            .filter(|t| t.is_active())
            .cloned()
            .collect();
        let active_count = objects.len();

        TrackingResult {
            objects,
            entries,
            exits,
            total_count: self.total_count,
            active_count,
        }
    }

    /// True when a confirmed track has gone longer than `stale_ms` without a
    /// corroborating detection. The gate uses this to force a forward.
    pub fn needs_corroboration(&self, now_ms: f64, stale_ms: f64) -> bool {
        self.tracks.iter().any(|t| {
            t.state == TrackState::Tracked && now_ms - t.last_seen_ms > stale_ms
        })
    }

    pub fn active_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| t.is_active())
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Short human-readable summary for inference request context
    pub fn summary(&self) -> String {
        let active: Vec<String> = self
            .tracks
            .iter()
            .filter(|t| t.state == TrackState::Tracked)
            .map(|t| {
                format!(
                    "{} #{} ({}, at {:.0}%,{:.0}%)",
                    t.object_type,
                    t.id,
                    t.direction.as_str(),
                    t.bbox.cx * 100.0,
                    t.bbox.cy * 100.0
                )
            })
            .collect();
        if active.is_empty() {
            "no confirmed objects".to_string()
        } else {
            active.join("; ")
        }
    }
}

/// Direction for a track: bbox growth dominates (toward/away from camera),
/// then boundary-relative entry/exit, then lateral movement.
fn classify_direction(track: &Track, config: &TrackerConfig) -> Direction {
    let growth = track.window_area_growth();
    if growth >= config.approach_growth_ratio {
        return Direction::Approaching;
    }
    if growth <= 1.0 / config.approach_growth_ratio {
        return Direction::Leaving;
    }

    let (vx, vy) = track.window_velocity();
    let speed = (vx * vx + vy * vy).sqrt();
    if speed < config.direction_min_speed {
        return Direction::Static;
    }

    let (x, y) = (track.bbox.cx, track.bbox.cy);
    let near_left = x < BOUNDARY_ZONE;
    let near_right = x > 1.0 - BOUNDARY_ZONE;
    let near_top = y < BOUNDARY_ZONE;
    let near_bottom = y > 1.0 - BOUNDARY_ZONE;
    let outward = (near_left && vx < 0.0)
        || (near_right && vx > 0.0)
        || (near_top && vy < 0.0)
        || (near_bottom && vy > 0.0);
    let inward = (near_left && vx > 0.0) || (near_right && vx < 0.0);
    if outward {
        return Direction::Exiting;
    }
    if inward {
        return Direction::Entering;
    }

    if vx.abs() >= vy.abs() {
        if vx > 0.0 {
            Direction::MovingRight
        } else {
            Direction::MovingLeft
        }
    } else if vy > 0.0 {
        // Lower in frame = closer to a fixed camera
        Direction::Approaching
    } else {
        Direction::Leaving
    }
}
