//! detection — YOLO person detection over ONNX Runtime
//!
//! `Detect` is the seam the pipeline talks to: frame + confidence threshold in,
//! detections out.  `YoloDetector` is the production implementation (any
//! Ultralytics detection export with a `[1, 4 + C, N]` output: v8, 11, 12);
//! tests plug in closures.

use anyhow::{Context, Result, ensure};
use fast_image_resize as fr;
use ort::execution_providers as ep;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

use crate::video::{ChannelOrder, Frame};

// ── Constants ────────────────────────────────────────────────────────────────

/// COCO class index for "person".
pub const PERSON_CLASS: usize = 0;
/// Letterbox padding value (grey) used by Ultralytics preprocessing.
const PAD_VALUE: u8 = 114;

/// Class names of the 80-class COCO detection head.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Name for a COCO class id; unknown ids render as `"class"`.
pub fn class_name(class_id: usize) -> &'static str {
    COCO_CLASSES.get(class_id).copied().unwrap_or("class")
}

// ── Public types ─────────────────────────────────────────────────────────────

/// Axis-aligned bounding box in pixel coordinates of the original frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }
    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        inter / union
    }
    /// Clamp to `[0, width] × [0, height]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> BBox {
        let (w, h) = (width as f32, height as f32);
        BBox {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

/// One predicted object: box, class id and score in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: usize,
    pub confidence: f32,
}

impl Detection {
    /// `"person: 0.87"`.
    pub fn label(&self) -> String {
        format!("{}: {:.2}", class_name(self.class_id), self.confidence)
    }
}

/// Keep only detections scoring at least `threshold`, preserving order.
pub fn filter_confident(detections: &mut Vec<Detection>, threshold: f32) {
    detections.retain(|d| d.confidence >= threshold);
}

/// Frame + confidence threshold → detections.
///
/// Implementations may return detections in any order.
pub trait Detect {
    fn detect(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<Detection>>;
}

impl<F> Detect for F
where
    F: FnMut(&Frame, f32) -> Result<Vec<Detection>>,
{
    fn detect(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<Detection>> {
        self(frame, threshold)
    }
}

// ── Detector ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct YoloParams {
    /// Square network input size.
    pub input_size: u32,
    /// IoU threshold for NMS.
    pub iou_threshold: f32,
    /// Cap on detections kept per frame after NMS.
    pub max_detections: usize,
    /// Class ids to keep; empty keeps everything.
    pub classes: Vec<usize>,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            iou_threshold: 0.7,
            max_detections: 300,
            classes: vec![PERSON_CLASS],
        }
    }
}

/// Scale and offsets that map letterboxed network coordinates back to the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    new_w: u32,
    new_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            scale,
            pad_x: ((size - new_w) / 2) as f32,
            pad_y: ((size - new_h) / 2) as f32,
            new_w,
            new_h,
        }
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Wraps an Ultralytics YOLO ONNX session.
pub struct YoloDetector {
    session: Session,
    input_name: String,
    params: YoloParams,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl YoloDetector {
    /// Load a YOLO ONNX model from `model_path`.
    pub fn load<P: AsRef<Path>>(model_path: P, params: YoloParams) -> Result<Self> {
        ensure!(params.input_size > 0, "YOLO input size must be positive");
        let session = build_ort_session(model_path.as_ref())?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "images".to_string());
        debug!(input = %input_name, size = params.input_size, "YOLO session ready");
        Ok(Self {
            session,
            input_name,
            params,
            resizer: fr::Resizer::new(),
            resize_buf: Vec::new(),
        })
    }

    pub fn params(&self) -> &YoloParams {
        &self.params
    }

    fn preprocess(&mut self, frame: &Frame, lb: Letterbox) -> Result<ort::value::DynValue> {
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source")?;

        let out_len = (lb.new_w * lb.new_h * 3) as usize;
        if self.resize_buf.len() != out_len {
            self.resize_buf.resize(out_len, 0);
        }
        let mut dst = fr::images::Image::from_vec_u8(
            lb.new_w,
            lb.new_h,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize YOLO downscale failed")?;
        self.resize_buf = dst.into_vec();

        // NCHW float tensor in RGB order: [1, 3, S, S], padding filled with grey.
        let size = self.params.input_size as usize;
        let plane = size * size;
        let pad = PAD_VALUE as f32 / 255.0;
        let mut tensor_data = vec![pad; 3 * plane];

        // Channel byte offset for the R, G, B planes.
        let src_channel = match frame.order {
            ChannelOrder::Rgb => [0usize, 1, 2],
            ChannelOrder::Bgr => [2usize, 1, 0],
        };
        let raw = &self.resize_buf;
        let (new_w, new_h) = (lb.new_w as usize, lb.new_h as usize);
        let (pad_x, pad_y) = (lb.pad_x as usize, lb.pad_y as usize);

        tensor_data
            .par_chunks_mut(plane)
            .enumerate()
            .for_each(|(c, out)| {
                let offset = src_channel[c];
                for y in 0..new_h {
                    let row = (y + pad_y) * size + pad_x;
                    for x in 0..new_w {
                        out[row + x] = raw[(y * new_w + x) * 3 + offset] as f32 / 255.0;
                    }
                }
            });

        let shape = [1usize, 3, size, size];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create YOLO input tensor")?
            .into_dyn())
    }
}

impl Detect for YoloDetector {
    /// Run inference on `frame` and return boxes (in original frame pixel
    /// coordinates) for the configured classes after NMS.
    fn detect(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<Detection>> {
        ensure!(
            frame.width > 0 && frame.height > 0,
            "cannot run detection on an empty frame"
        );
        let lb = Letterbox::fit(frame.width, frame.height, self.params.input_size);
        let input_tensor = self.preprocess(frame, lb)?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])
            .context("YOLO inference failed")?;

        let first = outputs
            .iter()
            .next()
            .context("YOLO model produced no outputs")?
            .1;
        let (shape, data) = first
            .try_extract_tensor::<f32>()
            .context("failed to extract YOLO output tensor")?;

        // Ultralytics layout: [1, 4 + num_classes, num_proposals], column-major
        // per proposal: [cx, cy, w, h, cls0, cls1, ...].
        let dims: Vec<i64> = shape.iter().copied().collect();
        ensure!(
            dims.len() == 3 && dims[1] > 4,
            "unexpected YOLO output shape {dims:?}"
        );
        let rows = dims[1] as usize;
        let num_proposals = dims[2] as usize;
        let num_classes = rows - 4;
        ensure!(
            data.len() >= rows * num_proposals,
            "YOLO output holds {} values, expected {}",
            data.len(),
            rows * num_proposals
        );

        let classes = &self.params.classes;
        let candidates: Vec<Detection> = (0..num_proposals)
            .into_par_iter()
            .filter_map(|i| {
                let mut best_class = 0usize;
                let mut best_score = f32::MIN;
                for c in 0..num_classes {
                    let s = data[(4 + c) * num_proposals + i];
                    if s > best_score {
                        best_score = s;
                        best_class = c;
                    }
                }
                if best_score < threshold {
                    return None;
                }
                if !classes.is_empty() && !classes.contains(&best_class) {
                    return None;
                }

                let cx = data[i];
                let cy = data[num_proposals + i];
                let w = data[2 * num_proposals + i];
                let h = data[3 * num_proposals + i];
                let (x1, y1) = lb.unmap(cx - w / 2.0, cy - h / 2.0);
                let (x2, y2) = lb.unmap(cx + w / 2.0, cy + h / 2.0);

                Some(Detection {
                    bbox: BBox::new(x1, y1, x2, y2).clamp_to(frame.width, frame.height),
                    class_id: best_class,
                    confidence: best_score.min(1.0),
                })
            })
            .collect();

        let mut kept = nms(candidates, self.params.iou_threshold);
        kept.truncate(self.params.max_detections);
        debug!(detections = kept.len(), "YOLO frame inference");
        Ok(kept)
    }
}

fn build_ort_session(model_path: &Path) -> Result<Session> {
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("failed to set ORT optimization level")?;
    builder = builder
        .with_intra_threads(threads)
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_execution_providers([ep::CPUExecutionProvider::default().build()])
        .context("failed to register execution providers")?;
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load YOLO ONNX model {}", model_path.display()))
}

// ── Non-Maximum Suppression ──────────────────────────────────────────────────

/// Greedy per-class NMS: sort by confidence descending, suppress overlapping
/// boxes of the same class.
pub fn nms(mut detections: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    detections.sort_unstable_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(detections[i]);
        for j in (i + 1)..detections.len() {
            if detections[i].class_id == detections[j].class_id
                && detections[i].bbox.iou(&detections[j].bbox) > iou_thresh
            {
                suppressed[j] = true;
            }
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, class_id: usize, confidence: f32) -> Detection {
        Detection {
            bbox: BBox::new(x1, y1, x2, y2),
            class_id,
            confidence,
        }
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
        let half = BBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&half) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn label_rounds_to_two_decimals() {
        assert_eq!(det(0.0, 0.0, 1.0, 1.0, 0, 0.8).label(), "person: 0.80");
        assert_eq!(det(0.0, 0.0, 1.0, 1.0, 0, 0.456).label(), "person: 0.46");
        assert_eq!(det(0.0, 0.0, 1.0, 1.0, 2, 1.0).label(), "car: 1.00");
        assert_eq!(det(0.0, 0.0, 1.0, 1.0, 999, 0.5).label(), "class: 0.50");
    }

    #[test]
    fn filter_confident_keeps_scores_at_or_above_threshold() {
        let mut dets = vec![
            det(0.0, 0.0, 1.0, 1.0, 0, 0.3),
            det(0.0, 0.0, 1.0, 1.0, 0, 0.5),
            det(0.0, 0.0, 1.0, 1.0, 0, 0.8),
            det(0.0, 0.0, 1.0, 1.0, 0, 0.45),
        ];
        filter_confident(&mut dets, 0.45);
        let scores: Vec<f32> = dets.iter().map(|d| d.confidence).collect();
        assert_eq!(scores, vec![0.5, 0.8, 0.45]);
    }

    #[test]
    fn nms_suppresses_overlaps_within_a_class_only() {
        let dets = vec![
            det(0.0, 0.0, 100.0, 100.0, 0, 0.6),
            det(2.0, 2.0, 102.0, 102.0, 0, 0.9),
            det(2.0, 2.0, 102.0, 102.0, 1, 0.7),
            det(300.0, 300.0, 400.0, 400.0, 0, 0.5),
        ];
        let kept = nms(dets, 0.5);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 1);
        assert_eq!(kept[2].confidence, 0.5);
    }

    #[test]
    fn letterbox_maps_back_to_frame_pixels() {
        let lb = Letterbox::fit(1280, 720, 640);
        assert_eq!((lb.new_w, lb.new_h), (640, 360));
        assert_eq!(lb.pad_y, 140.0);
        let (x, y) = lb.unmap(320.0, 320.0);
        assert!((x - 640.0).abs() < 1e-3);
        assert!((y - 360.0).abs() < 1e-3);
    }

    #[test]
    fn clamp_keeps_boxes_inside_frame() {
        let b = BBox::new(-5.0, 10.0, 700.0, 500.0).clamp_to(640, 480);
        assert_eq!(b, BBox::new(0.0, 10.0, 640.0, 480.0));
    }

    #[test]
    fn closures_are_detectors() {
        let mut calls = 0;
        let mut stub = |_: &Frame, t: f32| -> Result<Vec<Detection>> {
            calls += 1;
            Ok(vec![det(0.0, 0.0, 4.0, 4.0, PERSON_CLASS, t)])
        };
        let frame = Frame::filled(8, 8, ChannelOrder::Bgr, [0, 0, 0]);
        let out = stub.detect(&frame, 0.45).unwrap();
        assert_eq!(out[0].confidence, 0.45);
        drop(stub);
        assert_eq!(calls, 1);
    }
}
