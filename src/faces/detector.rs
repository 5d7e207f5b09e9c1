use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;

use super::{DetectedFace, FaceDetector};
use crate::config::FaceModelConfig;
use crate::db::BoundingBox;
use crate::onnx::{ensure_model, extract_output, image_to_nchw, l2_normalize, load_session};

/// UltraFace input resolution (320x240 variant)
const DETECT_WIDTH: u32 = 320;
const DETECT_HEIGHT: u32 = 240;

/// ArcFace input resolution
const ARCFACE_SIZE: u32 = 112;

/// UltraFace detection followed by ArcFace recognition embeddings.
pub struct OnnxFaceDetector {
    config: FaceModelConfig,
    detection: Mutex<Session>,
    recognition: Mutex<Session>,
}

impl OnnxFaceDetector {
    pub fn load(config: &FaceModelConfig, models_dir: &Path) -> Result<Self> {
        let detection_path = ensure_model(
            models_dir,
            &config.detection_model,
            config.detection_url.as_deref(),
        )?;
        let recognition_path = ensure_model(
            models_dir,
            &config.recognition_model,
            config.recognition_url.as_deref(),
        )?;

        let detection = load_session(&detection_path)?;
        let recognition = load_session(&recognition_path)?;
        tracing::info!(model = %config.model_name, "Loaded face models");

        Ok(Self {
            config: config.clone(),
            detection: Mutex::new(detection),
            recognition: Mutex::new(recognition),
        })
    }

    /// Run UltraFace and return boxes in original pixel space after NMS.
    fn run_detection(&self, img: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
        let (orig_width, orig_height) = img.dimensions();

        let input_data = image_to_nchw(img, DETECT_WIDTH, DETECT_HEIGHT, |_, v| (v - 127.0) / 128.0);
        let input_tensor = Tensor::from_array((
            [1usize, 3, DETECT_HEIGHT as usize, DETECT_WIDTH as usize],
            input_data.into_boxed_slice(),
        ))?;

        let mut session = self
            .detection
            .lock()
            .map_err(|e| anyhow!("Failed to lock detection model: {}", e))?;
        let outputs = session.run(ort::inputs!["input" => input_tensor])?;

        // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalised x1,y1,x2,y2
        let scores = extract_output!(outputs, Some("scores"));
        let boxes = extract_output!(outputs, Some("boxes"));
        let anchors = (scores.len() / 2).min(boxes.len() / 4);

        let w = orig_width as f32;
        let h = orig_height as f32;
        let mut candidates = Vec::new();

        for i in 0..anchors {
            let confidence = scores[i * 2 + 1];
            if confidence <= self.config.confidence_threshold {
                continue;
            }

            let bbox = BoundingBox {
                x1: (boxes[i * 4] * w).clamp(0.0, w),
                y1: (boxes[i * 4 + 1] * h).clamp(0.0, h),
                x2: (boxes[i * 4 + 2] * w).clamp(0.0, w),
                y2: (boxes[i * 4 + 3] * h).clamp(0.0, h),
            };

            if bbox.width() >= 1.0 && bbox.height() >= 1.0 {
                candidates.push((bbox, confidence));
            }
        }

        Ok(nms(candidates, self.config.nms_threshold))
    }

    fn run_recognition(&self, face: &DynamicImage) -> Result<Vec<f32>> {
        let input_data = image_to_nchw(face, ARCFACE_SIZE, ARCFACE_SIZE, |_, v| (v - 127.5) / 127.5);
        let input_tensor = Tensor::from_array((
            [1usize, 3, ARCFACE_SIZE as usize, ARCFACE_SIZE as usize],
            input_data.into_boxed_slice(),
        ))?;

        let mut session = self
            .recognition
            .lock()
            .map_err(|e| anyhow!("Failed to lock recognition model: {}", e))?;
        let outputs = session.run(ort::inputs!["data" => input_tensor])?;
        let embedding = extract_output!(outputs, None);

        if embedding.len() != self.config.dim {
            return Err(anyhow!(
                "Face model '{}' produced {}-dimensional output, configured dim is {}",
                self.config.model_name,
                embedding.len(),
                self.config.dim
            ));
        }

        Ok(l2_normalize(embedding))
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn dimensions(&self) -> usize {
        self.config.dim
    }

    fn detect_faces(&self, path: &Path) -> Result<Vec<DetectedFace>> {
        let img = image::open(path)
            .map_err(|e| anyhow!("Failed to load image {}: {}", path.display(), e))?;

        let boxes = self.run_detection(&img)?;
        let mut faces = Vec::with_capacity(boxes.len());

        for (bbox, confidence) in boxes {
            let crop = crop_face(&img, &bbox);
            let embedding = self.run_recognition(&crop)?;
            faces.push(DetectedFace {
                bbox,
                det_score: confidence,
                landmark: None,
                age: None,
                gender: None,
                embedding,
            });
        }

        Ok(faces)
    }
}

/// Non-maximum suppression to remove overlapping detections
pub(crate) fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for (bbox, confidence) in boxes {
        if keep.iter().all(|(kept, _)| compute_iou(kept, &bbox) <= threshold) {
            keep.push((bbox, confidence));
        }
    }

    keep
}

/// Intersection over Union between two bounding boxes
fn compute_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width() * a.height() + b.width() * b.height() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop the face with 20% padding, clamped to the image.
fn crop_face(img: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    let (img_width, img_height) = img.dimensions();
    let pad_x = bbox.width() * 0.2;
    let pad_y = bbox.height() * 0.2;

    let x = (bbox.x1 - pad_x).max(0.0) as u32;
    let y = (bbox.y1 - pad_y).max(0.0) as u32;
    let x_end = ((bbox.x2 + pad_x) as u32).min(img_width);
    let y_end = ((bbox.y2 + pad_y) as u32).min(img_height);

    let x = x.min(img_width.saturating_sub(1));
    let y = y.min(img_height.saturating_sub(1));
    let w = x_end.saturating_sub(x).max(1);
    let h = y_end.saturating_sub(y).max(1);

    img.crop_imm(x, y, w, h)
}
