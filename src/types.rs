// src/types.rs

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub stream: StreamConfig,
    pub motion: MotionConfig,
    pub blobs: BlobConfig,
    pub gate: GateConfig,
    pub tracker: TrackerConfig,
    pub detector: DetectorConfig,
    pub inference: InferenceConfig,
    pub broadcast: BroadcastConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Primary capture endpoint: RTSP/HTTP URL, file path, or device index ("0")
    pub primary_url: String,
    /// Optional secondary endpoint tried when the primary fails to open
    pub fallback_url: Option<String>,
    /// Ring buffer depth in frames
    pub buffer_capacity: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Per-pixel grayscale difference needed to count as changed
    pub diff_threshold: u8,
    /// Minimum blob area as percentage of frame area
    pub min_blob_area_pct: f32,
    /// Normalized distance from a frame boundary that counts as "at the edge"
    pub edge_margin: f32,
    /// Reported motion for the first frame of a session (no reference yet)
    pub first_frame_motion_pct: f32,
    /// Reported motion when a frame fails to decode
    pub decode_error_motion_pct: f32,
    /// Running-average background weight. 0.0 = compare against previous frame
    pub background_alpha: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            diff_threshold: 25,
            min_blob_area_pct: 0.05,
            edge_margin: 0.03,
            first_frame_motion_pct: 100.0,
            decode_error_motion_pct: 50.0,
            background_alpha: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Maximum center distance (normalized) for frame-to-frame association
    pub max_match_distance: f32,
    /// Frames an unmatched blob survives before Disappear/Exit fires
    pub grace_frames: u32,
    /// Minimum speed (normalized units/sec) before Move events are emitted
    pub min_move_speed: f32,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            max_match_distance: 0.12,
            grace_frames: 3,
            min_move_speed: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Motion percentage below which detection is skipped
    pub motion_gate_threshold: f32,
    /// Detection is forced at least once per this many frames
    pub periodic_interval: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            motion_gate_threshold: 0.5,
            periodic_interval: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPolicy {
    /// Report an exit as soon as a track goes Lost
    OnLost,
    /// Report an exit only when a track is evicted as Gone
    OnGone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Consecutive matched hits required to promote New -> Tracked
    pub min_stable_frames: u32,
    /// Updates a Lost track survives before eviction as Gone
    pub max_lost_frames: u32,
    /// Detections below this confidence never spawn a track
    pub activation_threshold: f32,
    /// Minimum IoU to associate a detection with an existing track
    pub matching_threshold: f32,
    pub exit_policy: ExitPolicy,
    /// Bbox area growth ratio over the history window for Approaching/Leaving
    pub approach_growth_ratio: f32,
    /// Minimum lateral speed (normalized/sec) for MovingLeft/MovingRight
    pub direction_min_speed: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_stable_frames: 3,
            max_lost_frames: 30,
            activation_threshold: 0.45,
            matching_threshold: 0.30,
            exit_policy: ExitPolicy::OnLost,
            approach_growth_ratio: 1.35,
            direction_min_speed: 0.04,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub enabled: bool,
    pub model_path: String,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub use_cuda: bool,
    pub num_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub enabled: bool,
    pub backend_url: String,
    pub max_concurrent_requests: usize,
    pub request_timeout_ms: u64,
    /// How long shutdown waits for in-flight requests before hard-cancelling
    pub shutdown_grace_ms: u64,
    /// Confidence attached to neutral fallback responses
    pub fallback_confidence: f32,
    /// Description cache capacity (perceptual-hash LRU)
    pub cache_capacity: usize,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    pub enabled: bool,
    pub bind_addr: String,
    pub target_fps: f32,
    /// Fan-out channel depth; a subscriber lagging past this drops events
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub output_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

// ============================================================================
// FRAMES
// ============================================================================

/// Which capture endpoint produced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceBackend {
    Primary,
    Fallback,
}

/// One decoded frame. Owned RGB24 pixels; the ring buffer holds the only
/// long-lived copy and hands out Arc views.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub sequence: u64,
    pub captured_at_ms: f64,
    pub backend: SourceBackend,
}

impl Frame {
    /// True when the pixel buffer is consistent with the declared dimensions
    pub fn is_decodable(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.width * self.height * 3
    }
}

// ============================================================================
// TIER 1 — MOTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edge {
    Top,
    Bottom,
    Left,
    Right,
}

/// A contiguous region of pixel change. Coordinates are normalized to [0,1]
/// so thresholds stay meaningful across resize presets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionBlob {
    /// Tracker-local identity; 0 until the BlobTracker assigns one
    pub id: u32,
    pub center: (f32, f32),
    pub size: (f32, f32),
    /// Normalized units per second
    pub velocity: (f32, f32),
    pub edge: Option<Edge>,
    /// Blob area as percentage of frame area
    pub area_pct: f32,
}

impl MotionBlob {
    pub fn distance_to(&self, other: &MotionBlob) -> f32 {
        let dx = self.center.0 - other.center.0;
        let dy = self.center.1 - other.center.1;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionEventKind {
    Enter,
    Exit,
    Appear,
    Disappear,
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Static,
    Entering,
    Exiting,
    MovingLeft,
    MovingRight,
    Approaching,
    Leaving,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "STATIC",
            Self::Entering => "ENTERING",
            Self::Exiting => "EXITING",
            Self::MovingLeft => "MOVING_LEFT",
            Self::MovingRight => "MOVING_RIGHT",
            Self::Approaching => "APPROACHING",
            Self::Leaving => "LEAVING",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionEvent {
    pub kind: MotionEventKind,
    pub blob_id: u32,
    pub direction: Direction,
}

/// Per-frame analysis result. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameDelta {
    pub frame_num: u64,
    pub timestamp_ms: f64,
    /// Changed pixels / total pixels, in [0, 100]
    pub motion_pct: f32,
    pub blobs: Vec<MotionBlob>,
    pub events: Vec<MotionEvent>,
}

// ============================================================================
// TIER 2 — SEMANTIC TRACKS
// ============================================================================

/// Axis-aligned box in normalized center+size form
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn corners(&self) -> (f32, f32, f32, f32) {
        (
            self.cx - self.w * 0.5,
            self.cy - self.h * 0.5,
            self.cx + self.w * 0.5,
            self.cy + self.h * 0.5,
        )
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let (ax1, ay1, ax2, ay2) = self.corners();
        let (bx1, by1, bx2, by2) = other.corners();

        let x1 = ax1.max(bx1);
        let y1 = ay1.max(by1);
        let x2 = ax2.min(bx2);
        let y2 = ay2.min(by2);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let dx = self.cx - other.cx;
        let dy = self.cy - other.cy;
        (dx * dx + dy * dy).sqrt()
    }
}

/// A labeled detection from the external detector capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    New,
    Tracked,
    Lost,
    Gone,
}

impl TrackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Tracked => "TRACKED",
            Self::Lost => "LOST",
            Self::Gone => "GONE",
        }
    }
}

/// Maximum position samples retained per track
pub const TRACK_HISTORY_CAP: usize = 30;

/// A persistent, identity-stable semantic object.
///
/// Ids are monotonic and never reused; a track that expires and is
/// re-detected gets a fresh id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: u64,
    pub object_type: String,
    pub bbox: BoundingBox,
    pub state: TrackState,
    pub direction: Direction,
    pub first_seen_ms: f64,
    pub last_seen_ms: f64,
    pub frames_tracked: u32,
    pub frames_lost: u32,
    pub confidence: f32,
    /// Last TRACK_HISTORY_CAP center samples: (x, y, timestamp_ms)
    pub positions: VecDeque<(f32, f32, f64)>,
    /// Bbox area samples aligned with `positions`, for approach classification
    #[serde(skip)]
    pub areas: VecDeque<(f32, f64)>,
}

impl Track {
    pub fn is_active(&self) -> bool {
        self.state != TrackState::Gone
    }

    pub fn push_position(&mut self, timestamp_ms: f64) {
        self.positions
            .push_back((self.bbox.cx, self.bbox.cy, timestamp_ms));
        if self.positions.len() > TRACK_HISTORY_CAP {
            self.positions.pop_front();
        }
        self.areas.push_back((self.bbox.area(), timestamp_ms));
        if self.areas.len() > TRACK_HISTORY_CAP {
            self.areas.pop_front();
        }
    }

    /// Center velocity over the history window, normalized units per second
    pub fn window_velocity(&self) -> (f32, f32) {
        if self.positions.len() < 2 {
            return (0.0, 0.0);
        }
        let first = self.positions.front().unwrap();
        let last = self.positions.back().unwrap();
        let dt = ((last.2 - first.2) / 1000.0) as f32;
        if dt < 0.01 {
            return (0.0, 0.0);
        }
        ((last.0 - first.0) / dt, (last.1 - first.1) / dt)
    }

    /// Bbox area growth over the history window (>1 = growing toward camera)
    pub fn window_area_growth(&self) -> f32 {
        if self.areas.len() < 2 {
            return 1.0;
        }
        let first = self.areas.front().unwrap().0;
        let last = self.areas.back().unwrap().0;
        if first > 1e-6 {
            last / first
        } else {
            1.0
        }
    }
}

/// Per-update snapshot from the SemanticTracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingResult {
    /// All currently known active tracks
    pub objects: Vec<Track>,
    /// Tracks that crossed New -> Tracked this update
    pub entries: Vec<Track>,
    /// Tracks that exited this update (policy: on_lost or on_gone)
    pub exits: Vec<Track>,
    /// Confirmed objects over the whole session; never decremented
    pub total_count: u64,
    pub active_count: usize,
}
