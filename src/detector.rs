// src/detector.rs
//
// Pluggable semantic detector capability. The pipeline only sees the
// `Detector` trait; when no implementation is available the system runs
// Tier-1 motion-only. The in-tree implementation wraps a YOLO-family ONNX
// export (letterbox preprocess, [1, 84, N] output head, NMS postprocess).

use crate::types::{BoundingBox, Detection, DetectorConfig, Frame};
use anyhow::Result;
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

const INPUT_SIZE: usize = 640;
const NUM_CLASSES: usize = 80;
const NUM_PREDICTIONS: usize = 8400;

/// External detector capability. May be absent; may fail per-frame.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

pub struct OnnxDetector {
    session: Session,
    config: DetectorConfig,
}

impl OnnxDetector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        info!("Loading detector model: {}", config.model_path);

        let mut builder = Session::builder()?;
        if config.use_cuda {
            info!("Enabling CUDA execution provider");
            builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(0)
                .build()])?;
        }

        let session = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.num_threads)?
            .commit_from_file(&config.model_path)?;

        info!("✓ Detector ready");
        Ok(Self { session, config })
    }

    fn infer(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1, 3, INPUT_SIZE, INPUT_SIZE];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let output = &outputs[0];
        let (_, data) = output.try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (input, scale, pad_x, pad_y) = letterbox(&frame.data, frame.width, frame.height);
        let output = self.infer(&input)?;
        let detections = postprocess(
            &output,
            scale,
            pad_x,
            pad_y,
            frame.width as f32,
            frame.height as f32,
            self.config.confidence_threshold,
            self.config.nms_threshold,
        );
        debug!(
            "Frame {}: {} detections after NMS",
            frame.sequence,
            detections.len()
        );
        Ok(detections)
    }
}

/// Letterbox the RGB frame into a 640x640 gray canvas, normalize to [0,1],
/// and lay it out CHW. Returns (input, scale, pad_x, pad_y).
fn letterbox(src: &[u8], src_w: usize, src_h: usize) -> (Vec<f32>, f32, f32, f32) {
    let scale = (INPUT_SIZE as f32 / src_w as f32).min(INPUT_SIZE as f32 / src_h as f32);
    let scaled_w = (src_w as f32 * scale) as usize;
    let scaled_h = (src_h as f32 * scale) as usize;
    let pad_x = (INPUT_SIZE - scaled_w) as f32 / 2.0;
    let pad_y = (INPUT_SIZE - scaled_h) as f32 / 2.0;

    let resized = resize_bilinear(src, src_w, src_h, scaled_w, scaled_h);

    let mut canvas = vec![114u8; INPUT_SIZE * INPUT_SIZE * 3];
    for y in 0..scaled_h {
        for x in 0..scaled_w {
            let src_idx = (y * scaled_w + x) * 3;
            let dst_x = x + pad_x as usize;
            let dst_y = y + pad_y as usize;
            let dst_idx = (dst_y * INPUT_SIZE + dst_x) * 3;
            canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
        }
    }

    let mut input = vec![0.0f32; 3 * INPUT_SIZE * INPUT_SIZE];
    for c in 0..3 {
        for h in 0..INPUT_SIZE {
            for w in 0..INPUT_SIZE {
                let hwc_idx = (h * INPUT_SIZE + w) * 3 + c;
                let chw_idx = c * INPUT_SIZE * INPUT_SIZE + h * INPUT_SIZE + w;
                input[chw_idx] = canvas[hwc_idx] as f32 / 255.0;
            }
        }
    }

    (input, scale, pad_x, pad_y)
}

fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;
            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }
    dst
}

/// Parse the [1, 84, 8400] head, undo the letterbox, normalize coordinates,
/// and suppress overlapping boxes.
#[allow(clippy::too_many_arguments)]
fn postprocess(
    output: &[f32],
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    frame_w: f32,
    frame_h: f32,
    conf_thresh: f32,
    nms_thresh: f32,
) -> Vec<Detection> {
    let mut detections = Vec::new();

    for i in 0..NUM_PREDICTIONS {
        let cx = output[i];
        let cy = output[NUM_PREDICTIONS + i];
        let w = output[NUM_PREDICTIONS * 2 + i];
        let h = output[NUM_PREDICTIONS * 3 + i];

        let mut max_conf = 0.0f32;
        let mut best_class = 0;
        for c in 0..NUM_CLASSES {
            let conf = output[NUM_PREDICTIONS * (4 + c) + i];
            if conf > max_conf {
                max_conf = conf;
                best_class = c;
            }
        }

        if max_conf < conf_thresh {
            continue;
        }

        // Undo letterbox, then normalize to the source frame
        let px = (cx - pad_x) / scale;
        let py = (cy - pad_y) / scale;
        let pw = w / scale;
        let ph = h / scale;

        detections.push(Detection {
            bbox: BoundingBox {
                cx: (px / frame_w).clamp(0.0, 1.0),
                cy: (py / frame_h).clamp(0.0, 1.0),
                w: (pw / frame_w).clamp(0.0, 1.0),
                h: (ph / frame_h).clamp(0.0, 1.0),
            },
            confidence: max_conf,
            label: class_name(best_class).to_string(),
        });
    }

    nms(detections, nms_thresh)
}

fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    while !detections.is_empty() {
        let current = detections.remove(0);
        detections.retain(|det| current.bbox.iou(&det.bbox) < iou_threshold);
        keep.push(current);
    }
    keep
}

/// COCO class table; YOLO-family exports index into this
fn class_name(class_id: usize) -> &'static str {
    const NAMES: [&str; NUM_CLASSES] = [
        "person",
        "bicycle",
        "car",
        "motorcycle",
        "airplane",
        "bus",
        "train",
        "truck",
        "boat",
        "traffic light",
        "fire hydrant",
        "stop sign",
        "parking meter",
        "bench",
        "bird",
        "cat",
        "dog",
        "horse",
        "sheep",
        "cow",
        "elephant",
        "bear",
        "zebra",
        "giraffe",
        "backpack",
        "umbrella",
        "handbag",
        "tie",
        "suitcase",
        "frisbee",
        "skis",
        "snowboard",
        "sports ball",
        "kite",
        "baseball bat",
        "baseball glove",
        "skateboard",
        "surfboard",
        "tennis racket",
        "bottle",
        "wine glass",
        "cup",
        "fork",
        "knife",
        "spoon",
        "bowl",
        "banana",
        "apple",
        "sandwich",
        "orange",
        "broccoli",
        "carrot",
        "hot dog",
        "pizza",
        "donut",
        "cake",
        "chair",
        "couch",
        "potted plant",
        "bed",
        "dining table",
        "toilet",
        "tv",
        "laptop",
        "mouse",
        "remote",
        "keyboard",
        "cell phone",
        "microwave",
        "oven",
        "toaster",
        "sink",
        "refrigerator",
        "book",
        "clock",
        "vase",
        "scissors",
        "teddy bear",
        "hair drier",
        "toothbrush",
    ];
    NAMES.get(class_id).copied().unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_dimensions() {
        let src = vec![128u8; 320 * 240 * 3];
        let (input, scale, pad_x, pad_y) = letterbox(&src, 320, 240);
        assert_eq!(input.len(), 3 * INPUT_SIZE * INPUT_SIZE);
        assert!((scale - 2.0).abs() < 1e-6); // 640/320
        assert_eq!(pad_x, 0.0);
        assert_eq!(pad_y, 80.0); // (640 - 480) / 2
    }

    #[test]
    fn test_resize_preserves_solid_color() {
        let src = vec![200u8; 100 * 100 * 3];
        let dst = resize_bilinear(&src, 100, 100, 50, 50);
        assert_eq!(dst.len(), 50 * 50 * 3);
        assert!(dst.iter().all(|&v| v == 200));
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let make = |cx: f32, conf: f32| Detection {
            bbox: BoundingBox {
                cx,
                cy: 0.5,
                w: 0.2,
                h: 0.2,
            },
            confidence: conf,
            label: "person".to_string(),
        };

        // Two near-identical boxes plus one far away
        let dets = vec![make(0.50, 0.9), make(0.51, 0.7), make(0.85, 0.8)];
        let kept = nms(dets, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9); // highest confidence survives
    }

    #[test]
    fn test_class_table() {
        assert_eq!(class_name(0), "person");
        assert_eq!(class_name(16), "dog");
        assert_eq!(class_name(999), "unknown");
    }
}
