// src/broadcaster.rs
//
// Isolated streaming path. The broadcaster runs its own StreamSource,
// FrameBuffer, MotionAnalyzer and BlobTracker on a dedicated thread group
// with a private runtime — no mutable state is shared with the inference
// side, so inference latency can never dent the broadcast frame rate. The
// primary pipeline feeds track_update events in through the same fan-out
// channel; that channel is the only bridge between the two worlds.
//
// Wire protocol: newline-delimited JSON over TCP. A slow subscriber lags on
// its own broadcast receiver and loses events individually; the emit loop
// never waits for anyone.

use crate::blob_tracker::BlobTracker;
use crate::frame_buffer::FrameBuffer;
use crate::motion_analyzer::MotionAnalyzer;
use crate::stream_source::{spawn_capture, CameraSource};
use crate::types::{Config, FrameDelta, MotionBlob, MotionEvent, Track, TrackingResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

// ============================================================================
// WIRE PROTOCOL
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct WireBlob {
    pub id: u32,
    /// Blob center, normalized
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub vx: f32,
    pub vy: f32,
}

impl From<&MotionBlob> for WireBlob {
    fn from(b: &MotionBlob) -> Self {
        Self {
            id: b.id,
            x: b.center.0,
            y: b.center.1,
            w: b.size.0,
            h: b.size.1,
            vx: b.velocity.0,
            vy: b.velocity.1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WireMotionEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub blob_id: u32,
    pub direction: String,
}

impl From<&MotionEvent> for WireMotionEvent {
    fn from(e: &MotionEvent) -> Self {
        Self {
            kind: format!("{:?}", e.kind).to_lowercase(),
            blob_id: e.blob_id,
            direction: e.direction.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WireTrack {
    pub id: u64,
    pub object_type: String,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub state: String,
    pub direction: String,
    pub confidence: f32,
}

impl From<&Track> for WireTrack {
    fn from(t: &Track) -> Self {
        Self {
            id: t.id,
            object_type: t.object_type.clone(),
            x: t.bbox.cx,
            y: t.bbox.cy,
            w: t.bbox.w,
            h: t.bbox.h,
            state: t.state.as_str().to_string(),
            direction: t.direction.as_str().to_string(),
            confidence: t.confidence,
        }
    }
}

/// One record on the wire; serialized as a single JSON line
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Frame {
        frame_num: u64,
        timestamp_ms: f64,
        motion_pct: f32,
        blobs: Vec<WireBlob>,
        events: Vec<WireMotionEvent>,
    },
    TrackUpdate {
        tracks: Vec<WireTrack>,
        entries: Vec<WireTrack>,
        exits: Vec<WireTrack>,
        total_count: u64,
        active_count: usize,
    },
}

impl WireEvent {
    pub fn from_delta(delta: &FrameDelta) -> Self {
        Self::Frame {
            frame_num: delta.frame_num,
            timestamp_ms: delta.timestamp_ms,
            motion_pct: delta.motion_pct,
            blobs: delta.blobs.iter().map(WireBlob::from).collect(),
            events: delta.events.iter().map(WireMotionEvent::from).collect(),
        }
    }

    pub fn from_tracking(result: &TrackingResult) -> Self {
        Self::TrackUpdate {
            tracks: result.objects.iter().map(WireTrack::from).collect(),
            entries: result.entries.iter().map(WireTrack::from).collect(),
            exits: result.exits.iter().map(WireTrack::from).collect(),
            total_count: result.total_count,
            active_count: result.active_count,
        }
    }
}

/// Cloneable, non-blocking handle into the fan-out channel. Sending never
/// waits; with no subscribers the event simply evaporates.
#[derive(Clone)]
pub struct WireSender {
    tx: broadcast::Sender<WireEvent>,
}

impl WireSender {
    pub fn send(&self, event: WireEvent) {
        let _ = self.tx.send(event);
    }
}

// ============================================================================
// BROADCASTER
// ============================================================================

pub struct StreamBroadcaster;

impl StreamBroadcaster {
    /// Start the broadcaster on its own thread with a private runtime.
    /// Returns the wire handle (for the primary pipeline's track updates)
    /// and the thread join handle.
    pub fn spawn(
        config: Config,
        shutdown: watch::Receiver<bool>,
    ) -> (WireSender, thread::JoinHandle<()>) {
        let (tx, _) = broadcast::channel(config.broadcast.channel_capacity);
        let sender = WireSender { tx: tx.clone() };

        let handle = thread::Builder::new()
            .name("broadcaster".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build broadcaster runtime");
                rt.block_on(run(config, tx, shutdown));
            })
            .expect("failed to spawn broadcaster thread");

        (sender, handle)
    }
}

async fn run(config: Config, tx: broadcast::Sender<WireEvent>, mut shutdown: watch::Receiver<bool>) {
    let running = Arc::new(AtomicBool::new(true));
    let buffer = Arc::new(FrameBuffer::new(config.stream.buffer_capacity));

    // Private capture loop; reconnects on its own schedule
    let capture_handle = spawn_capture(
        CameraSource::new(config.stream.clone()),
        Arc::clone(&buffer),
        Arc::clone(&running),
    );

    // Subscriber server
    let listener = match TcpListener::bind(&config.broadcast.bind_addr).await {
        Ok(l) => {
            info!("✓ Broadcaster listening on {}", config.broadcast.bind_addr);
            Some(l)
        }
        Err(e) => {
            warn!(
                "Broadcaster could not bind {}: {} (emitting to in-process subscribers only)",
                config.broadcast.bind_addr, e
            );
            None
        }
    };
    if let Some(listener) = listener {
        let accept_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        info!("Subscriber connected: {}", peer);
                        let rx = accept_tx.subscribe();
                        tokio::spawn(serve_subscriber(socket, rx));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        });
    }

    // Emit loop: Tier-1 analysis at target cadence
    let mut analyzer = MotionAnalyzer::new(config.motion.clone());
    let mut tracker = BlobTracker::new(config.blobs.clone());
    let mut last_seq = 0u64;
    let period = Duration::from_secs_f64(1.0 / config.broadcast.target_fps as f64);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        "Broadcast loop started at {:.1} fps target",
        config.broadcast.target_fps
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let Some((frame, gap)) = buffer.next_after(last_seq) else {
            continue;
        };
        if gap > 0 {
            debug!("Broadcast reader skipped {} frame(s)", gap);
        }
        last_seq = frame.sequence;

        let mut delta = analyzer.analyze(&frame);
        let (blobs, events) = tracker.track(delta.blobs, frame.captured_at_ms);
        delta.blobs = blobs;
        delta.events = events;

        // Non-blocking fan-out; receivers that lag lose events on their own
        let _ = tx.send(WireEvent::from_delta(&delta));
    }

    running.store(false, Ordering::Relaxed);
    let _ = capture_handle.join();
    info!("Broadcast loop stopped");
}

/// Forward events to one subscriber as JSON lines. Lag drops events for
/// this subscriber only; a write error means they hung up.
async fn serve_subscriber(
    mut socket: tokio::net::TcpStream,
    mut rx: broadcast::Receiver<WireEvent>,
) {
    let mut dropped_total = 0u64;
    loop {
        match rx.recv().await {
            Ok(event) => {
                let mut line = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Wire serialization failed: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if socket.write_all(line.as_bytes()).await.is_err() {
                    debug!("Subscriber disconnected ({} events dropped)", dropped_total);
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                dropped_total += n;
                debug!("Slow subscriber dropped {} event(s)", n);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, MotionEventKind};

    fn delta() -> FrameDelta {
        FrameDelta {
            frame_num: 42,
            timestamp_ms: 1400.0,
            motion_pct: 12.5,
            blobs: vec![MotionBlob {
                id: 7,
                center: (0.25, 0.50),
                size: (0.10, 0.20),
                velocity: (1.5, 0.0),
                edge: None,
                area_pct: 1.2,
            }],
            events: vec![MotionEvent {
                kind: MotionEventKind::Enter,
                blob_id: 7,
                direction: Direction::MovingRight,
            }],
        }
    }

    #[test]
    fn test_frame_event_wire_format() {
        let event = WireEvent::from_delta(&delta());
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();

        assert_eq!(json["type"], "frame");
        assert_eq!(json["frame_num"], 42);
        assert_eq!(json["motion_pct"], 12.5);
        assert_eq!(json["blobs"][0]["id"], 7);
        assert_eq!(json["blobs"][0]["x"], 0.25);
        assert_eq!(json["blobs"][0]["vx"], 1.5);
        assert_eq!(json["events"][0]["type"], "enter");
        assert_eq!(json["events"][0]["blob_id"], 7);
        assert_eq!(json["events"][0]["direction"], "MOVING_RIGHT");
    }

    #[test]
    fn test_track_update_wire_format() {
        use crate::types::{BoundingBox, TrackState};
        use std::collections::VecDeque;

        let track = Track {
            id: 3,
            object_type: "person".to_string(),
            bbox: BoundingBox {
                cx: 0.5,
                cy: 0.5,
                w: 0.2,
                h: 0.4,
            },
            state: TrackState::Tracked,
            direction: Direction::Approaching,
            first_seen_ms: 0.0,
            last_seen_ms: 330.0,
            frames_tracked: 10,
            frames_lost: 0,
            confidence: 0.88,
            positions: VecDeque::new(),
            areas: VecDeque::new(),
        };
        let result = TrackingResult {
            objects: vec![track.clone()],
            entries: vec![track],
            exits: vec![],
            total_count: 1,
            active_count: 1,
        };

        let json: serde_json::Value = serde_json::from_str(
            &serde_json::to_string(&WireEvent::from_tracking(&result)).unwrap(),
        )
        .unwrap();

        assert_eq!(json["type"], "track_update");
        assert_eq!(json["tracks"][0]["id"], 3);
        assert_eq!(json["tracks"][0]["state"], "TRACKED");
        assert_eq!(json["entries"].as_array().unwrap().len(), 1);
        assert_eq!(json["exits"].as_array().unwrap().len(), 0);
        assert_eq!(json["total_count"], 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_only_its_own_events() {
        let (tx, _) = broadcast::channel::<WireEvent>(4);
        let mut fast = tx.subscribe();
        let mut slow = tx.subscribe();

        // Overflow the channel depth while `slow` is not reading
        for i in 0..10u64 {
            let mut d = delta();
            d.frame_num = i;
            tx.send(WireEvent::from_delta(&d)).unwrap();
            // Fast reader keeps up
            let _ = fast.recv().await.unwrap();
        }

        // Slow reader lagged: first recv reports the loss, then resumes
        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {:?}", other.map(|_| ())),
        }
        assert!(slow.recv().await.is_ok());
    }
}
