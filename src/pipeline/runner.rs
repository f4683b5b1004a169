// src/pipeline/runner.rs
//
// The primary analysis loop: capture -> motion -> blob identity -> gate ->
// detector -> semantic tracks -> inference. Motion analysis, blob tracking
// and the gate run inline (sub-10ms together); the detector gets a
// single-slot worker thread and the inference gateway runs on the async
// runtime. Nothing in this loop ever waits on either of them.

use crate::blob_tracker::BlobTracker;
use crate::broadcaster::{WireEvent, WireSender};
use crate::detection_gate::DetectionGate;
use crate::detector::{Detector, OnnxDetector};
use crate::frame_buffer::FrameBuffer;
use crate::inference::{HttpBackend, InferenceGateway, InferenceResponse};
use crate::motion_analyzer::MotionAnalyzer;
use crate::pipeline::event_bus::{EventBus, PipelineEvent};
use crate::pipeline::metrics::PipelineMetrics;
use crate::semantic_tracker::SemanticTracker;
use crate::stream_source::{spawn_capture, CameraSource};
use crate::types::{Config, Detection, Frame};
use anyhow::{Context, Result};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A confirmed track older than this without a corroborating detection
/// forces the gate open
const STALE_TRACK_MS: f64 = 1500.0;

/// Progress log cadence in frames
const PROGRESS_INTERVAL: u64 = 300;

// ============================================================================
// DETECTOR WORKER
// ============================================================================

pub struct DetectorResult {
    pub frame_num: u64,
    pub timestamp_ms: f64,
    pub outcome: Result<Vec<Detection>, String>,
    pub elapsed_us: u64,
}

/// Single-slot worker thread for the semantic detector. `try_submit` never
/// blocks: when the worker is mid-inference the frame is simply not sent,
/// which is exactly the load-shedding the gate already planned for.
pub struct DetectorWorker {
    job_tx: mpsc::SyncSender<Arc<Frame>>,
    result_rx: mpsc::Receiver<DetectorResult>,
    handle: thread::JoinHandle<()>,
}

impl DetectorWorker {
    pub fn spawn(mut detector: Box<dyn Detector>) -> Self {
        let (job_tx, job_rx) = mpsc::sync_channel::<Arc<Frame>>(1);
        let (result_tx, result_rx) = mpsc::channel::<DetectorResult>();

        let handle = thread::Builder::new()
            .name("detector".to_string())
            .spawn(move || {
                for frame in job_rx.iter() {
                    let started = Instant::now();
                    let outcome = detector
                        .detect(&frame)
                        .map_err(|e| e.to_string());
                    let result = DetectorResult {
                        frame_num: frame.sequence,
                        timestamp_ms: frame.captured_at_ms,
                        outcome,
                        elapsed_us: started.elapsed().as_micros() as u64,
                    };
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
                debug!("Detector worker stopped");
            })
            .expect("failed to spawn detector thread");

        Self {
            job_tx,
            result_rx,
            handle,
        }
    }

    /// Hand the worker a frame unless it is busy. Returns false when shed.
    pub fn try_submit(&self, frame: Arc<Frame>) -> bool {
        self.job_tx.try_send(frame).is_ok()
    }

    pub fn try_collect(&self) -> Option<DetectorResult> {
        self.result_rx.try_recv().ok()
    }

    pub fn join(self) {
        drop(self.job_tx);
        let _ = self.handle.join();
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub async fn run_pipeline(
    config: Config,
    metrics: Arc<PipelineMetrics>,
    wire: Option<WireSender>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    std::fs::create_dir_all(&config.output.output_dir)?;
    let events_path = format!(
        "{}/events_{}.jsonl",
        config.output.output_dir,
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    let mut events_file =
        std::fs::File::create(&events_path).context("failed to create events log")?;
    info!("💾 Events will be written to: {}", events_path);

    // ── Capture ──
    let running = Arc::new(AtomicBool::new(true));
    let buffer = Arc::new(FrameBuffer::new(config.stream.buffer_capacity));
    let capture = spawn_capture(
        CameraSource::new(config.stream.clone()),
        Arc::clone(&buffer),
        Arc::clone(&running),
    );

    // ── Inline stages ──
    let mut analyzer = MotionAnalyzer::new(config.motion.clone());
    let mut blob_tracker = BlobTracker::new(config.blobs.clone());
    let mut gate = DetectionGate::new(config.gate.clone());
    let mut tracker = SemanticTracker::new(config.tracker.clone());

    // ── Detector worker (optional; absence = Tier-1-only operation) ──
    let worker = if config.detector.enabled {
        match OnnxDetector::new(config.detector.clone()) {
            Ok(detector) => Some(DetectorWorker::spawn(Box::new(detector))),
            Err(e) => {
                warn!(
                    "⚠️  Detector failed to load: {}. Continuing motion-only.",
                    e
                );
                None
            }
        }
    } else {
        info!("⚪ Semantic detector disabled in config");
        None
    };

    // ── Inference gateway (optional) ──
    let gateway = if config.inference.enabled {
        let backend = Arc::new(HttpBackend::new(&config.inference.backend_url));
        info!("✓ Inference gateway ready ({})", config.inference.backend_url);
        Some(Arc::new(InferenceGateway::new(
            backend,
            config.inference.clone(),
            Arc::clone(&buffer),
        )))
    } else {
        None
    };
    let (inf_tx, mut inf_rx) = tokio::sync::mpsc::unbounded_channel::<InferenceResponse>();

    let mut bus = EventBus::new(128);
    let mut last_seq = 0u64;
    let mut last_motion_pct = 0.0f32;

    info!("🎥 Analysis loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        // ── Detector results feed the semantic tracker inline ──
        while let Some(result) = worker.as_ref().and_then(|w| w.try_collect()) {
            metrics.set_timing(&metrics.detector_time_us, result.elapsed_us);
            match result.outcome {
                Ok(detections) => {
                    let tracking = tracker.update(&detections, result.timestamp_ms);

                    if let Some(wire) = &wire {
                        wire.send(WireEvent::from_tracking(&tracking));
                    }
                    for track in &tracking.entries {
                        info!(
                            "🟢 ENTRY: {} #{} ({})",
                            track.object_type,
                            track.id,
                            track.direction.as_str()
                        );
                        metrics.inc(&metrics.objects_entered);
                        bus.publish(PipelineEvent::ObjectEntered(track.clone()));
                    }
                    for track in &tracking.exits {
                        info!(
                            "🔴 EXIT: {} #{} after {} frames",
                            track.object_type, track.id, track.frames_tracked
                        );
                        metrics.inc(&metrics.objects_exited);
                        bus.publish(PipelineEvent::ObjectExited(track.clone()));
                    }

                    // A fresh entry is worth a description from the backend
                    if !tracking.entries.is_empty() {
                        if let (Some(gateway), Some(frame)) = (&gateway, buffer.latest()) {
                            let context = format!(
                                "motion {:.1}% | {}",
                                last_motion_pct,
                                tracker.summary()
                            );
                            metrics.inc(&metrics.inference_submitted);
                            let rx = gateway.submit(gateway.make_request(frame, context));
                            let inf_tx = inf_tx.clone();
                            tokio::spawn(async move {
                                if let Ok(resp) = rx.await {
                                    let _ = inf_tx.send(resp);
                                }
                            });
                        }
                    }
                }
                Err(reason) => {
                    metrics.inc(&metrics.detector_failures);
                    debug!("Detector failed on frame {}: {}", result.frame_num, reason);
                    bus.publish(PipelineEvent::DetectorDegraded {
                        frame_num: result.frame_num,
                        reason,
                    });
                }
            }
        }

        // ── Inference responses ──
        while let Ok(response) = inf_rx.try_recv() {
            if response.timed_out {
                metrics.inc(&metrics.inference_timeouts);
            } else if response.cached {
                metrics.inc(&metrics.inference_cached);
            }
            if !response.text.is_empty() {
                info!(
                    "🧠 Frame {}: \"{}\" (conf={:.2}{}{})",
                    response.frame_ref,
                    response.text,
                    response.confidence,
                    if response.cached { ", cached" } else { "" },
                    if response.arrived_late { ", late" } else { "" },
                );
            }
            bus.publish(PipelineEvent::DescriptionReady(response));
        }

        // ── Next frame, inline Tier-1 ──
        let Some((frame, gap)) = buffer.next_after(last_seq) else {
            flush_bus(&mut bus, &mut events_file)?;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(2)) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        };
        if gap > 0 {
            debug!("Analysis reader skipped {} frame(s)", gap);
        }
        last_seq = frame.sequence;

        metrics.inc(&metrics.total_frames);
        if !frame.is_decodable() {
            metrics.inc(&metrics.decode_errors);
        }

        let started = Instant::now();
        let mut delta = analyzer.analyze(&frame);
        let (blobs, events) = blob_tracker.track(delta.blobs, delta.timestamp_ms);
        delta.blobs = blobs;
        delta.events = events;
        metrics.set_timing(&metrics.motion_time_us, started.elapsed().as_micros() as u64);

        last_motion_pct = delta.motion_pct;
        if delta.motion_pct > 0.0 {
            metrics.inc(&metrics.frames_with_motion);
        }

        // ── Gate ──
        let stale_target = tracker.needs_corroboration(frame.captured_at_ms, STALE_TRACK_MS);
        let decision = gate.check(delta.motion_pct, stale_target);
        if decision.is_forward() {
            metrics.inc(&metrics.gate_forwards);
            if let Some(worker) = &worker {
                if worker.try_submit(Arc::clone(&frame)) {
                    metrics.inc(&metrics.detector_runs);
                } else {
                    debug!("Detector busy, frame {} shed", frame.sequence);
                }
            }
        } else {
            metrics.inc(&metrics.gate_skips);
        }

        if frame.sequence % PROGRESS_INTERVAL == 0 {
            let stats = gate.stats();
            info!(
                "Frame {} | motion {:.1}% | blobs {} | tracks {} (total {}) | gate skip {:.0}% | lag {} | {:.1} fps",
                frame.sequence,
                delta.motion_pct,
                delta.blobs.len(),
                tracker.active_tracks().count(),
                tracker.total_count(),
                stats.skip_ratio() * 100.0,
                buffer.latest_sequence().saturating_sub(frame.sequence),
                metrics.fps(),
            );
        }

        flush_bus(&mut bus, &mut events_file)?;
    }

    // ── Shutdown: capture first, then drain inference ──
    info!("Stopping capture...");
    running.store(false, Ordering::Relaxed);
    let _ = capture.join();

    if let Some(worker) = worker {
        worker.join();
    }

    if let Some(gateway) = &gateway {
        info!("Draining in-flight inference requests...");
        gateway
            .drain(Duration::from_millis(config.inference.shutdown_grace_ms))
            .await;
        if !gateway.is_available() {
            warn!("Inference backend was unavailable at shutdown");
        }
        metrics
            .inference_failures
            .store(gateway.stats.failed.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    flush_bus(&mut bus, &mut events_file)?;
    info!("Analysis loop stopped");
    Ok(())
}

/// Drain the event bus into the JSONL log
fn flush_bus(bus: &mut EventBus, file: &mut std::fs::File) -> Result<()> {
    for event in bus.drain() {
        let value = match event {
            PipelineEvent::ObjectEntered(track) => serde_json::json!({
                "type": "entry",
                "track_id": track.id,
                "object_type": track.object_type,
                "direction": track.direction.as_str(),
                "timestamp_ms": track.last_seen_ms,
            }),
            PipelineEvent::ObjectExited(track) => serde_json::json!({
                "type": "exit",
                "track_id": track.id,
                "object_type": track.object_type,
                "frames_tracked": track.frames_tracked,
                "timestamp_ms": track.last_seen_ms,
            }),
            PipelineEvent::DescriptionReady(response) => serde_json::json!({
                "type": "description",
                "frame_ref": response.frame_ref,
                "text": response.text,
                "confidence": response.confidence,
                "timed_out": response.timed_out,
                "arrived_late": response.arrived_late,
                "cached": response.cached,
            }),
            PipelineEvent::DetectorDegraded { frame_num, reason } => serde_json::json!({
                "type": "detector_degraded",
                "frame_num": frame_num,
                "reason": reason,
            }),
        };
        writeln!(file, "{}", serde_json::to_string(&value)?)?;
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, SourceBackend};

    struct MockDetector {
        delay: Duration,
    }

    impl Detector for MockDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            thread::sleep(self.delay);
            Ok(vec![Detection {
                bbox: BoundingBox {
                    cx: 0.5,
                    cy: 0.5,
                    w: 0.2,
                    h: 0.2,
                },
                confidence: 0.9,
                label: "person".to_string(),
            }])
        }
    }

    fn frame(seq: u64) -> Arc<Frame> {
        Arc::new(Frame {
            data: vec![0u8; 12],
            width: 2,
            height: 2,
            sequence: seq,
            captured_at_ms: seq as f64 * 33.3,
            backend: SourceBackend::Primary,
        })
    }

    #[test]
    fn test_worker_round_trip() {
        let worker = DetectorWorker::spawn(Box::new(MockDetector {
            delay: Duration::from_millis(1),
        }));

        assert!(worker.try_submit(frame(1)));

        let mut result = None;
        for _ in 0..100 {
            if let Some(r) = worker.try_collect() {
                result = Some(r);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let result = result.expect("worker must produce a result");
        assert_eq!(result.frame_num, 1);
        assert_eq!(result.outcome.unwrap().len(), 1);

        worker.join();
    }

    #[test]
    fn test_busy_worker_sheds_frames() {
        let worker = DetectorWorker::spawn(Box::new(MockDetector {
            delay: Duration::from_millis(200),
        }));

        // First fills the slot queue, second occupies the worker; at some
        // point a submit must be refused rather than queued unboundedly.
        let mut shed = false;
        for seq in 1..=5 {
            if !worker.try_submit(frame(seq)) {
                shed = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(shed, "the worker must shed load instead of queueing");

        worker.join();
    }
}
