// src/inference.rs
//
// Async gateway to the external vision-language inference backend.
//
// The capture/analysis loop must never wait on inference, so submission is
// fire-and-forget: `submit` hands back a oneshot receiver and the request
// runs on the runtime under a concurrency semaphore. Every request carries
// a deadline; a slow backend produces a neutral fallback response tagged
// `timed_out` instead of a hung caller. Responses are correlated to frames
// by sequence number and tagged `arrived_late` when the frame they describe
// has already scrolled out of the live ring.
//
// A bounded LRU cache keyed by a 64-bit perceptual hash short-circuits
// near-identical frames to their previous description.

use crate::error::PipelineError;
use crate::frame_buffer::FrameBuffer;
use crate::types::{Frame, InferenceConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

pub struct InferenceRequest {
    pub frame: Arc<Frame>,
    /// Tracking summary and motion stats for the prompt
    pub context: String,
    pub submitted_at: tokio::time::Instant,
    pub deadline: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceResponse {
    /// Sequence number of the frame this response describes
    pub frame_ref: u64,
    pub text: String,
    pub confidence: f32,
    pub timed_out: bool,
    /// The described frame was already overwritten when this arrived
    pub arrived_late: bool,
    pub cached: bool,
    pub latency_ms: f64,
}

#[derive(Debug, Clone)]
pub struct BackendReply {
    pub text: String,
    pub confidence: f32,
}

/// External inference backend boundary. The gateway is fully testable
/// against a mock; transport and prompt format live behind this trait.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn describe(&self, image_jpeg: &[u8], context: &str) -> Result<BackendReply>;
}

// ============================================================================
// HTTP BACKEND
// ============================================================================

#[derive(Debug, Serialize)]
struct DescribeRequest {
    request_id: String,
    image_base64: String,
    context_text: String,
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    text: String,
    confidence: f32,
}

pub struct HttpBackend {
    server_url: String,
    http_client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(server_url: &str) -> Self {
        let http_client = reqwest::Client::builder()
            .build()
            .expect("Failed to build HTTP client");
        Self {
            server_url: server_url.to_string(),
            http_client,
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn describe(&self, image_jpeg: &[u8], context: &str) -> Result<BackendReply> {
        let request = DescribeRequest {
            request_id: format!("req_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S%3f")),
            image_base64: base64::engine::general_purpose::STANDARD.encode(image_jpeg),
            context_text: context.to_string(),
        };

        let url = format!("{}/api/describe", self.server_url);
        let resp = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("inference backend unreachable")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("inference backend error {}: {}", status, body);
        }

        let parsed: DescribeResponse = resp
            .json()
            .await
            .context("malformed inference backend response")?;
        Ok(BackendReply {
            text: parsed.text,
            confidence: parsed.confidence,
        })
    }
}

// ============================================================================
// DESCRIPTION CACHE (dHash + LRU)
// ============================================================================

/// 64-bit difference hash: 9x8 grayscale reduction, one bit per horizontal
/// gradient sign. Near-identical frames collide, which is the point.
pub fn dhash64(frame: &Frame) -> u64 {
    const HW: usize = 9;
    const HH: usize = 8;

    let mut cells = [0f32; HW * HH];
    let cell_w = (frame.width as f32 / HW as f32).max(1.0);
    let cell_h = (frame.height as f32 / HH as f32).max(1.0);

    for cy in 0..HH {
        for cx in 0..HW {
            let x0 = (cx as f32 * cell_w) as usize;
            let y0 = (cy as f32 * cell_h) as usize;
            let x1 = (((cx + 1) as f32 * cell_w) as usize).min(frame.width);
            let y1 = (((cy + 1) as f32 * cell_h) as usize).min(frame.height);

            let mut sum = 0u64;
            let mut count = 0u64;
            for y in y0..y1 {
                for x in x0..x1 {
                    let idx = (y * frame.width + x) * 3;
                    let r = frame.data[idx] as u64;
                    let g = frame.data[idx + 1] as u64;
                    let b = frame.data[idx + 2] as u64;
                    sum += (r * 299 + g * 587 + b * 114) / 1000;
                    count += 1;
                }
            }
            cells[cy * HW + cx] = if count > 0 { sum as f32 / count as f32 } else { 0.0 };
        }
    }

    let mut hash = 0u64;
    for cy in 0..HH {
        for cx in 0..(HW - 1) {
            hash <<= 1;
            if cells[cy * HW + cx] > cells[cy * HW + cx + 1] {
                hash |= 1;
            }
        }
    }
    hash
}

/// Fixed-capacity LRU keyed by perceptual hash
struct DescriptionCache {
    entries: HashMap<u64, BackendReply>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl DescriptionCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn get(&mut self, hash: u64) -> Option<BackendReply> {
        let reply = self.entries.get(&hash).cloned()?;
        // Refresh recency
        if let Some(pos) = self.order.iter().position(|&h| h == hash) {
            self.order.remove(pos);
        }
        self.order.push_back(hash);
        Some(reply)
    }

    fn insert(&mut self, hash: u64, reply: BackendReply) {
        if self.entries.contains_key(&hash) {
            self.entries.insert(hash, reply);
            if let Some(pos) = self.order.iter().position(|&h| h == hash) {
                self.order.remove(pos);
            }
            self.order.push_back(hash);
            return;
        }
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(hash, reply);
        self.order.push_back(hash);
    }
}

// ============================================================================
// GATEWAY
// ============================================================================

#[derive(Debug, Default)]
pub struct GatewayStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub timed_out: AtomicU64,
    pub cached: AtomicU64,
    pub failed: AtomicU64,
}

pub struct InferenceGateway {
    backend: Arc<dyn InferenceBackend>,
    config: InferenceConfig,
    semaphore: Arc<Semaphore>,
    cache: Arc<Mutex<DescriptionCache>>,
    /// Live ring the analysis loop reads from; used for arrived_late tagging
    live_buffer: Arc<FrameBuffer>,
    in_flight: Arc<AtomicUsize>,
    available: Arc<AtomicBool>,
    pub stats: Arc<GatewayStats>,
}

impl InferenceGateway {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        config: InferenceConfig,
        live_buffer: Arc<FrameBuffer>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests));
        let cache = Arc::new(Mutex::new(DescriptionCache::new(config.cache_capacity)));
        Self {
            backend,
            config,
            semaphore,
            cache,
            live_buffer,
            in_flight: Arc::new(AtomicUsize::new(0)),
            available: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(GatewayStats::default()),
        }
    }

    pub fn make_request(&self, frame: Arc<Frame>, context: String) -> InferenceRequest {
        InferenceRequest {
            frame,
            context,
            submitted_at: tokio::time::Instant::now(),
            deadline: Duration::from_millis(self.config.request_timeout_ms),
        }
    }

    /// True when the last backend round-trip succeeded
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Dispatch a request without blocking the caller. The receiver resolves
    /// within deadline + scheduling jitter, always.
    pub fn submit(&self, request: InferenceRequest) -> oneshot::Receiver<InferenceResponse> {
        let (tx, rx) = oneshot::channel();

        let backend = Arc::clone(&self.backend);
        let cache = Arc::clone(&self.cache);
        let semaphore = Arc::clone(&self.semaphore);
        let live_buffer = Arc::clone(&self.live_buffer);
        let in_flight = Arc::clone(&self.in_flight);
        let available = Arc::clone(&self.available);
        let stats = Arc::clone(&self.stats);
        let fallback_confidence = self.config.fallback_confidence;
        let jpeg_quality = self.config.jpeg_quality;

        in_flight.fetch_add(1, Ordering::SeqCst);
        stats.submitted.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let started = request.submitted_at;
            let frame_ref = request.frame.sequence;
            let hash = dhash64(&request.frame);

            let cached_reply = cache.lock().unwrap().get(hash);
            let mut response = match cached_reply {
                Some(reply) => {
                    stats.cached.fetch_add(1, Ordering::Relaxed);
                    debug!("Frame {}: description served from cache", frame_ref);
                    InferenceResponse {
                        frame_ref,
                        text: reply.text,
                        confidence: reply.confidence,
                        timed_out: false,
                        arrived_late: false,
                        cached: true,
                        latency_ms: 0.0,
                    }
                }
                None => {
                    let work = async {
                        let _permit = semaphore.acquire().await.expect("semaphore closed");
                        let jpeg = encode_jpeg(&request.frame, jpeg_quality)?;
                        backend.describe(&jpeg, &request.context).await
                    };

                    match tokio::time::timeout(request.deadline, work).await {
                        Ok(Ok(reply)) => {
                            available.store(true, Ordering::Relaxed);
                            stats.completed.fetch_add(1, Ordering::Relaxed);
                            cache.lock().unwrap().insert(hash, reply.clone());
                            InferenceResponse {
                                frame_ref,
                                text: reply.text,
                                confidence: reply.confidence,
                                timed_out: false,
                                arrived_late: false,
                                cached: false,
                                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                            }
                        }
                        Ok(Err(e)) => {
                            // Backend down: neutral response, pipeline stays up
                            if available.swap(false, Ordering::Relaxed) {
                                warn!("{}", PipelineError::InferenceUnavailable(e.to_string()));
                            }
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            neutral_response(frame_ref, fallback_confidence, false, &started)
                        }
                        Err(_) => {
                            warn!(
                                "{}",
                                PipelineError::InferenceTimeout {
                                    frame_ref,
                                    deadline_ms: request.deadline.as_millis() as u64,
                                }
                            );
                            stats.timed_out.fetch_add(1, Ordering::Relaxed);
                            neutral_response(frame_ref, fallback_confidence, true, &started)
                        }
                    }
                }
            };

            response.arrived_late = live_buffer.is_evicted(frame_ref);
            in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(response);
        });

        rx
    }

    /// Wait for in-flight requests to finish, up to a grace period. Used at
    /// shutdown after capture has stopped.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let remaining = self.in_flight();
        if remaining > 0 {
            warn!("Hard-cancelling {} in-flight inference request(s)", remaining);
        } else {
            info!("✓ Inference gateway drained");
        }
    }
}

fn neutral_response(
    frame_ref: u64,
    confidence: f32,
    timed_out: bool,
    started: &tokio::time::Instant,
) -> InferenceResponse {
    InferenceResponse {
        frame_ref,
        text: String::new(),
        confidence,
        timed_out,
        arrived_late: false,
        cached: false,
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
    }
}

/// JPEG-encode an RGB frame for the request payload
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    use image::{ImageBuffer, RgbImage};
    use std::io::Cursor;

    let img: RgbImage =
        ImageBuffer::from_raw(frame.width as u32, frame.height as u32, frame.data.clone())
            .context("frame buffer inconsistent with dimensions")?;

    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    img.write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceBackend;
    use std::sync::atomic::AtomicUsize;

    fn frame(seq: u64, shade: u8) -> Arc<Frame> {
        // A simple gradient so the dhash is non-degenerate
        let (w, h) = (32usize, 24usize);
        let mut data = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let v = (shade as usize + x * 4) as u8;
                let idx = (y * w + x) * 3;
                data[idx] = v;
                data[idx + 1] = v;
                data[idx + 2] = v;
            }
        }
        Arc::new(Frame {
            data,
            width: w,
            height: h,
            sequence: seq,
            captured_at_ms: seq as f64 * 33.3,
            backend: SourceBackend::Primary,
        })
    }

    /// Black frame with a white vertical bar; the bar position shifts the
    /// dhash bit pattern, so different positions never collide in the cache
    fn bar_frame(seq: u64, bar_x: usize) -> Arc<Frame> {
        let (w, h) = (32usize, 24usize);
        let mut data = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in bar_x..(bar_x + 4).min(w) {
                let idx = (y * w + x) * 3;
                data[idx] = 255;
                data[idx + 1] = 255;
                data[idx + 2] = 255;
            }
        }
        Arc::new(Frame {
            data,
            width: w,
            height: h,
            sequence: seq,
            captured_at_ms: seq as f64 * 33.3,
            backend: SourceBackend::Primary,
        })
    }

    fn config(timeout_ms: u64, max_concurrent: usize) -> InferenceConfig {
        InferenceConfig {
            enabled: true,
            backend_url: "http://localhost:0".to_string(),
            max_concurrent_requests: max_concurrent,
            request_timeout_ms: timeout_ms,
            shutdown_grace_ms: 200,
            fallback_confidence: 0.2,
            cache_capacity: 4,
            jpeg_quality: 80,
        }
    }

    /// Backend with a programmable delay; counts concurrent calls
    struct MockBackend {
        delay: Duration,
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        fail: bool,
    }

    impl MockBackend {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Duration::from_millis(0))
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for MockBackend {
        async fn describe(&self, _image_jpeg: &[u8], _context: &str) -> Result<BackendReply> {
            if self.fail {
                anyhow::bail!("connection refused");
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(BackendReply {
                text: "a person walks through the frame".to_string(),
                confidence: 0.9,
            })
        }
    }

    fn gateway(
        backend: Arc<MockBackend>,
        cfg: InferenceConfig,
    ) -> (InferenceGateway, Arc<FrameBuffer>) {
        let buffer = Arc::new(FrameBuffer::new(4));
        let gw = InferenceGateway::new(backend, cfg, Arc::clone(&buffer));
        (gw, buffer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out_with_fallback() {
        let backend = Arc::new(MockBackend::new(Duration::from_secs(60)));
        let (gw, _buffer) = gateway(Arc::clone(&backend), config(100, 2));

        let rx = gw.submit(gw.make_request(frame(1, 10), "ctx".to_string()));
        let response = rx.await.expect("caller must never hang");

        assert!(response.timed_out);
        assert_eq!(response.frame_ref, 1);
        assert_eq!(response.confidence, 0.2);
        assert_eq!(gw.stats.timed_out.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_arrives_within_deadline() {
        let backend = Arc::new(MockBackend::new(Duration::from_secs(60)));
        let (gw, _buffer) = gateway(Arc::clone(&backend), config(100, 2));

        let started = tokio::time::Instant::now();
        let rx = gw.submit(gw.make_request(frame(1, 10), "ctx".to_string()));
        let _ = rx.await.unwrap();
        // Paused clock: elapsed is exactly the virtual time consumed
        assert!(started.elapsed() <= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_identical_frames_hit_cache() {
        let backend = Arc::new(MockBackend::new(Duration::from_millis(1)));
        let (gw, _buffer) = gateway(Arc::clone(&backend), config(5000, 2));

        let r1 = gw
            .submit(gw.make_request(frame(1, 10), "ctx".to_string()))
            .await
            .unwrap();
        assert!(!r1.cached);

        let r2 = gw
            .submit(gw.make_request(frame(2, 10), "ctx".to_string()))
            .await
            .unwrap();
        assert!(r2.cached, "identical frame must short-circuit to the cache");
        assert_eq!(r2.text, r1.text);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let backend = Arc::new(MockBackend::new(Duration::from_millis(30)));
        let (gw, _buffer) = gateway(Arc::clone(&backend), config(5000, 1));

        // Distinct bar positions defeat the cache
        let rx1 = gw.submit(gw.make_request(bar_frame(1, 4), "ctx".to_string()));
        let rx2 = gw.submit(gw.make_request(bar_frame(2, 14), "ctx".to_string()));
        let rx3 = gw.submit(gw.make_request(bar_frame(3, 24), "ctx".to_string()));
        let _ = rx1.await.unwrap();
        let _ = rx2.await.unwrap();
        let _ = rx3.await.unwrap();

        assert_eq!(
            backend.max_concurrent.load(Ordering::SeqCst),
            1,
            "semaphore must serialize backend calls"
        );
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_not_crashes() {
        let backend = Arc::new(MockBackend::failing());
        let (gw, _buffer) = gateway(Arc::clone(&backend), config(5000, 2));

        let response = gw
            .submit(gw.make_request(frame(1, 10), "ctx".to_string()))
            .await
            .unwrap();
        assert!(!response.timed_out);
        assert_eq!(response.confidence, 0.2);
        assert!(!gw.is_available());
        assert_eq!(gw.stats.failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_arrived_late_when_frame_scrolled_out() {
        let backend = Arc::new(MockBackend::new(Duration::from_millis(30)));
        let (gw, buffer) = gateway(Arc::clone(&backend), config(5000, 2));

        let f = frame(1, 10);
        buffer.push((*f).clone());
        let rx = gw.submit(gw.make_request(f, "ctx".to_string()));

        // Ring capacity is 4; by sequence 6 frame 1 is gone
        for seq in 2..=6 {
            buffer.push((*frame(seq, seq as u8 * 20)).clone());
        }

        let response = rx.await.unwrap();
        assert!(response.arrived_late);
    }

    #[test]
    fn test_dhash_stability_and_sensitivity() {
        let a = frame(1, 10);
        let b = frame(2, 10); // same pixels, different sequence
        assert_eq!(dhash64(&a), dhash64(&b));

        // Reversed gradient flips the hash
        let mut data = a.data.clone();
        let (w, h) = (a.width, a.height);
        for y in 0..h {
            for x in 0..w {
                let v = 200u8.saturating_sub((x * 6) as u8);
                let idx = (y * w + x) * 3;
                data[idx] = v;
                data[idx + 1] = v;
                data[idx + 2] = v;
            }
        }
        let c = Frame {
            data,
            ..(*a).clone()
        };
        assert_ne!(dhash64(&a), dhash64(&c));
    }

    #[test]
    fn test_lru_cache_eviction() {
        let mut cache = DescriptionCache::new(2);
        let reply = |t: &str| BackendReply {
            text: t.to_string(),
            confidence: 0.9,
        };

        cache.insert(1, reply("one"));
        cache.insert(2, reply("two"));
        assert!(cache.get(1).is_some()); // refreshes 1
        cache.insert(3, reply("three")); // evicts 2, the least recent
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
    }
}
