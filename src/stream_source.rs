// src/stream_source.rs
//
// Live frame acquisition. A StreamSource pulls decoded frames from a camera
// endpoint (RTSP/HTTP URL, device index, or file path) and owns the
// reconnect policy: exponential backoff with a ceiling, falling back to a
// secondary endpoint when the primary refuses to open.
//
// Capture is blocking I/O, so each source runs on its own dedicated thread
// and publishes into a FrameBuffer; nothing downstream ever touches the
// capture handle.

use crate::error::PipelineError;
use crate::frame_buffer::FrameBuffer;
use crate::types::{Frame, SourceBackend, StreamConfig};
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pull interface over a live frame producer. Implementations own their
/// reconnect behavior; `pull` blocks until a frame is available or the
/// source decides to give up for this attempt.
pub trait StreamSource: Send {
    /// Next decoded frame, or None when no frame could be produced this
    /// attempt (caller decides whether to retry)
    fn pull(&mut self) -> Option<Frame>;

    /// How long the caller should wait before the next pull attempt after a
    /// None; implementations escalate this internally
    fn retry_delay(&mut self) -> Duration;
}

pub struct CameraSource {
    config: StreamConfig,
    capture: Option<(VideoCapture, SourceBackend)>,
    sequence: u64,
    backoff_ms: u64,
    epoch: std::time::Instant,
}

impl CameraSource {
    pub fn new(config: StreamConfig) -> Self {
        let backoff_ms = config.reconnect_initial_ms;
        Self {
            config,
            capture: None,
            sequence: 0,
            backoff_ms,
            epoch: std::time::Instant::now(),
        }
    }

    fn open_endpoint(url: &str) -> Result<VideoCapture, PipelineError> {
        let capture_err = |e: opencv::Error| PipelineError::Capture(e.to_string());

        // Pure digits = local device index; anything else goes through
        // OpenCV's URL/file handling
        let cap = if let Ok(index) = url.parse::<i32>() {
            VideoCapture::new(index, videoio::CAP_ANY).map_err(capture_err)?
        } else {
            VideoCapture::from_file(url, videoio::CAP_ANY).map_err(capture_err)?
        };

        if !cap.is_opened().map_err(capture_err)? {
            return Err(PipelineError::Capture(format!(
                "endpoint did not open: {url}"
            )));
        }
        Ok(cap)
    }

    /// Open primary, then fallback. Returns false when both refused; the
    /// caller sleeps out the backoff before trying again.
    fn try_connect(&mut self) -> bool {
        match Self::open_endpoint(&self.config.primary_url) {
            Ok(cap) => {
                let w = cap
                    .get(videoio::CAP_PROP_FRAME_WIDTH)
                    .unwrap_or_default();
                let h = cap
                    .get(videoio::CAP_PROP_FRAME_HEIGHT)
                    .unwrap_or_default();
                info!(
                    "✓ Stream connected: {} ({}x{})",
                    self.config.primary_url, w as i64, h as i64
                );
                self.capture = Some((cap, SourceBackend::Primary));
                self.backoff_ms = self.config.reconnect_initial_ms;
                return true;
            }
            Err(e) => {
                warn!("Primary endpoint failed: {}", e);
            }
        }

        if let Some(fallback) = self.config.fallback_url.clone() {
            match Self::open_endpoint(&fallback) {
                Ok(cap) => {
                    info!("✓ Stream connected via fallback: {}", fallback);
                    self.capture = Some((cap, SourceBackend::Fallback));
                    self.backoff_ms = self.config.reconnect_initial_ms;
                    return true;
                }
                Err(e) => {
                    warn!("Fallback endpoint failed: {}", e);
                }
            }
        }

        false
    }

    /// Current backoff delay, then doubles toward the ceiling
    fn next_backoff(&mut self) -> Duration {
        let delay = Duration::from_millis(self.backoff_ms);
        self.backoff_ms = (self.backoff_ms * 2).min(self.config.reconnect_max_ms);
        delay
    }

    fn read_frame(&mut self) -> Option<Frame> {
        let (cap, backend) = self.capture.as_mut()?;
        let backend = *backend;

        let mut mat = Mat::default();
        let ok = VideoCaptureTrait::read(cap, &mut mat).unwrap_or(false);
        if !ok || mat.empty() {
            return None;
        }

        let width = mat.cols() as usize;
        let height = mat.rows() as usize;

        let mut rgb_mat = Mat::default();
        if imgproc::cvt_color(&mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0).is_err() {
            return None;
        }
        let data = rgb_mat.data_bytes().ok()?.to_vec();

        self.sequence += 1;
        Some(Frame {
            data,
            width,
            height,
            sequence: self.sequence,
            captured_at_ms: self.epoch.elapsed().as_secs_f64() * 1000.0,
            backend,
        })
    }
}

impl StreamSource for CameraSource {
    fn pull(&mut self) -> Option<Frame> {
        if self.capture.is_none() && !self.try_connect() {
            return None;
        }

        match self.read_frame() {
            Some(frame) => Some(frame),
            None => {
                // Mid-stream failure: drop the handle, reconnect next pull
                warn!("Stream read failed, scheduling reconnect");
                self.capture = None;
                None
            }
        }
    }

    fn retry_delay(&mut self) -> Duration {
        self.next_backoff()
    }
}

/// Run a source on its own thread, publishing into the ring buffer until
/// `running` clears. Capture errors never escape this loop; they turn into
/// backoff sleeps.
pub fn spawn_capture<S: StreamSource + 'static>(
    mut source: S,
    buffer: Arc<FrameBuffer>,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || {
            info!("Capture loop started");
            while running.load(Ordering::Relaxed) {
                match source.pull() {
                    Some(frame) => {
                        debug!("Captured frame {}", frame.sequence);
                        buffer.push(frame);
                    }
                    None => {
                        let delay = source.retry_delay();
                        debug!("No frame, backing off {:?}", delay);
                        // Sleep in short slices so shutdown stays responsive
                        let deadline = std::time::Instant::now() + delay;
                        while running.load(Ordering::Relaxed)
                            && std::time::Instant::now() < deadline
                        {
                            thread::sleep(Duration::from_millis(50));
                        }
                    }
                }
            }
            info!("Capture loop stopped");
        })
        .expect("failed to spawn capture thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamConfig {
        StreamConfig {
            primary_url: "does-not-exist.mp4".to_string(),
            fallback_url: None,
            buffer_capacity: 8,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 1000,
        }
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut source = CameraSource::new(config());
        assert_eq!(source.next_backoff(), Duration::from_millis(100));
        assert_eq!(source.next_backoff(), Duration::from_millis(200));
        assert_eq!(source.next_backoff(), Duration::from_millis(400));
        assert_eq!(source.next_backoff(), Duration::from_millis(800));
        // Ceiling
        assert_eq!(source.next_backoff(), Duration::from_millis(1000));
        assert_eq!(source.next_backoff(), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_resets_after_connect() {
        let mut source = CameraSource::new(config());
        source.next_backoff();
        source.next_backoff();
        assert!(source.backoff_ms > config().reconnect_initial_ms);
        // try_connect on a bad endpoint fails but must not reset the backoff
        assert!(!source.try_connect());
        assert!(source.backoff_ms > config().reconnect_initial_ms);
    }

    #[test]
    fn test_sequence_starts_at_zero_before_frames() {
        let source = CameraSource::new(config());
        assert_eq!(source.sequence, 0);
    }
}
