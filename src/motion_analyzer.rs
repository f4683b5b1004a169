// src/motion_analyzer.rs
//
// Tier-1 motion analysis: grayscale -> 5x5 Gaussian blur -> absolute
// difference against the previous frame (or a running background model) ->
// threshold -> connected-component extraction.
//
// All spatial output is normalized to [0,1] and areas are percentages of
// frame area, so downstream thresholds survive resize presets. Blob ids are
// NOT assigned here; the BlobTracker owns identity.

use crate::error::PipelineError;
use crate::types::{Edge, Frame, FrameDelta, MotionBlob, MotionConfig};
use tracing::{debug, warn};

/// Separable 5x5 Gaussian kernel, sigma ~1.1
const BLUR_KERNEL: [u32; 5] = [1, 4, 6, 4, 1];
const BLUR_KERNEL_SUM: u32 = 16;

pub struct MotionAnalyzer {
    config: MotionConfig,
    prev_gray: Option<Vec<u8>>,
    /// Running-average background, active when background_alpha > 0
    background: Option<Vec<f32>>,
    dims: Option<(usize, usize)>,
}

impl MotionAnalyzer {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            prev_gray: None,
            background: None,
            dims: None,
        }
    }

    /// Analyze one frame against the retained reference. Never fails: decode
    /// problems degrade to the configured error percentage instead.
    pub fn analyze(&mut self, frame: &Frame) -> FrameDelta {
        if !frame.is_decodable() {
            let err = PipelineError::Decode {
                sequence: frame.sequence,
                reason: format!(
                    "{} bytes for {}x{}",
                    frame.data.len(),
                    frame.width,
                    frame.height
                ),
            };
            warn!(
                "{}, assuming {:.0}% motion",
                err, self.config.decode_error_motion_pct
            );
            return FrameDelta {
                frame_num: frame.sequence,
                timestamp_ms: frame.captured_at_ms,
                motion_pct: self.config.decode_error_motion_pct,
                blobs: Vec::new(),
                events: Vec::new(),
            };
        }

        let (w, h) = (frame.width, frame.height);
        if self.dims != Some((w, h)) {
            // Resolution change invalidates the reference
            self.prev_gray = None;
            self.background = None;
            self.dims = Some((w, h));
        }

        let gray = blur(&grayscale(&frame.data, w, h), w, h);

        let delta = match self.reference() {
            None => {
                debug!(
                    "First frame of session, reporting {:.0}% motion",
                    self.config.first_frame_motion_pct
                );
                FrameDelta {
                    frame_num: frame.sequence,
                    timestamp_ms: frame.captured_at_ms,
                    motion_pct: self.config.first_frame_motion_pct,
                    blobs: Vec::new(),
                    events: Vec::new(),
                }
            }
            Some(reference) => {
                let mask = diff_mask(&gray, reference, self.config.diff_threshold);
                let changed = mask.iter().filter(|&&m| m).count();
                let motion_pct = (changed as f32 / (w * h) as f32) * 100.0;
                let blobs = self.extract_blobs(&mask, w, h);

                FrameDelta {
                    frame_num: frame.sequence,
                    timestamp_ms: frame.captured_at_ms,
                    motion_pct: motion_pct.clamp(0.0, 100.0),
                    blobs,
                    events: Vec::new(),
                }
            }
        };

        self.update_reference(gray);
        delta
    }

    fn reference(&self) -> Option<DiffReference<'_>> {
        if self.config.background_alpha > 0.0 {
            self.background.as_deref().map(DiffReference::Background)
        } else {
            self.prev_gray.as_deref().map(DiffReference::PrevFrame)
        }
    }

    fn update_reference(&mut self, gray: Vec<u8>) {
        let alpha = self.config.background_alpha;
        if alpha > 0.0 {
            match self.background.as_mut() {
                Some(bg) => {
                    for (b, &g) in bg.iter_mut().zip(gray.iter()) {
                        *b = *b * (1.0 - alpha) + g as f32 * alpha;
                    }
                }
                None => {
                    self.background = Some(gray.iter().map(|&g| g as f32).collect());
                }
            }
        }
        self.prev_gray = Some(gray);
    }

    /// Connected components over the change mask (4-connectivity, iterative
    /// flood fill). Components below the minimum area are discarded.
    fn extract_blobs(&self, mask: &[bool], w: usize, h: usize) -> Vec<MotionBlob> {
        let total = (w * h) as f32;
        let min_pixels = ((self.config.min_blob_area_pct / 100.0) * total).max(1.0) as usize;

        let mut visited = vec![false; mask.len()];
        let mut blobs = Vec::new();
        let mut stack: Vec<usize> = Vec::new();

        for start in 0..mask.len() {
            if !mask[start] || visited[start] {
                continue;
            }

            let mut count = 0usize;
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0usize, 0usize);

            visited[start] = true;
            stack.push(start);
            while let Some(idx) = stack.pop() {
                count += 1;
                let (x, y) = (idx % w, idx / w);
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);

                if x > 0 && mask[idx - 1] && !visited[idx - 1] {
                    visited[idx - 1] = true;
                    stack.push(idx - 1);
                }
                if x + 1 < w && mask[idx + 1] && !visited[idx + 1] {
                    visited[idx + 1] = true;
                    stack.push(idx + 1);
                }
                if y > 0 && mask[idx - w] && !visited[idx - w] {
                    visited[idx - w] = true;
                    stack.push(idx - w);
                }
                if y + 1 < h && mask[idx + w] && !visited[idx + w] {
                    visited[idx + w] = true;
                    stack.push(idx + w);
                }
            }

            if count < min_pixels {
                continue;
            }

            let bw = (max_x - min_x + 1) as f32 / w as f32;
            let bh = (max_y - min_y + 1) as f32 / h as f32;
            let cx = (min_x + max_x + 1) as f32 * 0.5 / w as f32;
            let cy = (min_y + max_y + 1) as f32 * 0.5 / h as f32;

            blobs.push(MotionBlob {
                id: 0,
                center: (cx, cy),
                size: (bw, bh),
                velocity: (0.0, 0.0),
                edge: self.classify_edge(cx, cy, bw, bh),
                area_pct: (count as f32 / total) * 100.0,
            });
        }

        blobs
    }

    /// Edge tag when the blob's bounding box reaches within edge_margin of a
    /// frame boundary. The nearest qualifying boundary wins.
    fn classify_edge(&self, cx: f32, cy: f32, bw: f32, bh: f32) -> Option<Edge> {
        let margin = self.config.edge_margin;
        let left = cx - bw * 0.5;
        let right = 1.0 - (cx + bw * 0.5);
        let top = cy - bh * 0.5;
        let bottom = 1.0 - (cy + bh * 0.5);

        let candidates = [
            (Edge::Left, left),
            (Edge::Right, right),
            (Edge::Top, top),
            (Edge::Bottom, bottom),
        ];

        candidates
            .iter()
            .filter(|(_, d)| *d <= margin)
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(e, _)| *e)
    }
}

enum DiffReference<'a> {
    PrevFrame(&'a [u8]),
    Background(&'a [f32]),
}

fn diff_mask(gray: &[u8], reference: DiffReference<'_>, threshold: u8) -> Vec<bool> {
    match reference {
        DiffReference::PrevFrame(prev) => gray
            .iter()
            .zip(prev.iter())
            .map(|(&a, &b)| a.abs_diff(b) > threshold)
            .collect(),
        DiffReference::Background(bg) => gray
            .iter()
            .zip(bg.iter())
            .map(|(&a, &b)| (a as f32 - b).abs() > threshold as f32)
            .collect(),
    }
}

fn grayscale(rgb: &[u8], w: usize, h: usize) -> Vec<u8> {
    let mut gray = vec![0u8; w * h];
    for (i, g) in gray.iter_mut().enumerate() {
        let r = rgb[i * 3] as u32;
        let gr = rgb[i * 3 + 1] as u32;
        let b = rgb[i * 3 + 2] as u32;
        *g = ((r * 299 + gr * 587 + b * 114) / 1000) as u8;
    }
    gray
}

/// Two-pass separable Gaussian blur with edge clamping
fn blur(gray: &[u8], w: usize, h: usize) -> Vec<u8> {
    let mut horizontal = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0u32;
            for (k, &weight) in BLUR_KERNEL.iter().enumerate() {
                let sx = (x as isize + k as isize - 2).clamp(0, w as isize - 1) as usize;
                acc += gray[y * w + sx] as u32 * weight;
            }
            horizontal[y * w + x] = (acc / BLUR_KERNEL_SUM) as u8;
        }
    }

    let mut out = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0u32;
            for (k, &weight) in BLUR_KERNEL.iter().enumerate() {
                let sy = (y as isize + k as isize - 2).clamp(0, h as isize - 1) as usize;
                acc += horizontal[sy * w + x] as u32 * weight;
            }
            out[y * w + x] = (acc / BLUR_KERNEL_SUM) as u8;
        }
    }
    out
}
