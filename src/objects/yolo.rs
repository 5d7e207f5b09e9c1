use anyhow::{anyhow, Result};
use image::GenericImageView;
use ort::session::Session;
use ort::value::Tensor;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use super::{DetectedObject, ObjectDetector};
use crate::config::ObjectModelConfig;
use crate::db::BoundingBox;
use crate::faces::detector::nms;
use crate::onnx::{ensure_model, extract_output, image_to_nchw, load_session};

/// COCO class names in YOLO class-index order
pub const COCO_LABELS: [&str; 80] = [
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

/// YOLO (v8/11 export layout) over ONNX Runtime.
///
/// The output is `[1, 4 + classes, anchors]`: centre x, centre y, width and
/// height in input pixels, then one score per class.
pub struct OnnxObjectDetector {
    config: ObjectModelConfig,
    session: Mutex<Session>,
}

impl OnnxObjectDetector {
    pub fn load(config: &ObjectModelConfig, models_dir: &Path) -> Result<Self> {
        let path = ensure_model(models_dir, &config.model_file, config.model_url.as_deref())?;
        let session = load_session(&path)?;
        tracing::info!(model = %config.model_name, "Loaded object model");

        Ok(Self {
            config: config.clone(),
            session: Mutex::new(session),
        })
    }
}

impl ObjectDetector for OnnxObjectDetector {
    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn detect_objects(&self, path: &Path) -> Result<Vec<DetectedObject>> {
        let img = image::open(path)
            .map_err(|e| anyhow!("Failed to load image {}: {}", path.display(), e))?;
        let (width, height) = img.dimensions();
        let size = self.config.input_size;

        let input_data = image_to_nchw(&img, size, size, |_, v| v / 255.0);
        let input_tensor = Tensor::from_array((
            [1usize, 3, size as usize, size as usize],
            input_data.into_boxed_slice(),
        ))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow!("Failed to lock object model: {}", e))?;
        let outputs = session.run(ort::inputs![self.config.input_name.as_str() => input_tensor])?;
        let predictions = extract_output!(outputs, None);

        let candidates = decode_predictions(
            &predictions,
            COCO_LABELS.len(),
            self.config.confidence_threshold,
        )?;

        // Input is a stretched square; map boxes back to the file's pixel space
        let sx = width as f32 / size as f32;
        let sy = height as f32 / size as f32;

        let objects = suppress_per_class(candidates, self.config.nms_threshold)
            .into_iter()
            .map(|(bbox, confidence, class)| DetectedObject {
                label: COCO_LABELS[class].to_string(),
                confidence,
                bbox: clamp_to(bbox.scaled(sx, sy), width as f32, height as f32),
            })
            .collect();

        Ok(objects)
    }
}

/// Best class per anchor above `threshold`, boxes as corners in input pixels.
fn decode_predictions(
    data: &[f32],
    classes: usize,
    threshold: f32,
) -> Result<Vec<(BoundingBox, f32, usize)>> {
    let rows = 4 + classes;
    if data.is_empty() || data.len() % rows != 0 {
        return Err(anyhow!(
            "Unexpected object model output of {} values for {} classes",
            data.len(),
            classes
        ));
    }
    let anchors = data.len() / rows;
    let at = |row: usize, anchor: usize| data[row * anchors + anchor];

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let Some((class, score)) = (0..classes)
            .map(|c| (c, at(4 + c, anchor)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
        else {
            continue;
        };
        if score < threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
        candidates.push((
            BoundingBox {
                x1: cx - w / 2.0,
                y1: cy - h / 2.0,
                x2: cx + w / 2.0,
                y2: cy + h / 2.0,
            },
            score,
            class,
        ));
    }

    Ok(candidates)
}

/// Class-wise NMS; the result is ordered by confidence descending.
fn suppress_per_class(
    candidates: Vec<(BoundingBox, f32, usize)>,
    threshold: f32,
) -> Vec<(BoundingBox, f32, usize)> {
    let mut by_class: BTreeMap<usize, Vec<(BoundingBox, f32)>> = BTreeMap::new();
    for (bbox, score, class) in candidates {
        by_class.entry(class).or_default().push((bbox, score));
    }

    let mut kept: Vec<(BoundingBox, f32, usize)> = by_class
        .into_iter()
        .flat_map(|(class, boxes)| {
            nms(boxes, threshold)
                .into_iter()
                .map(move |(bbox, score)| (bbox, score, class))
        })
        .collect();
    kept.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)));
    kept
}

fn clamp_to(bbox: BoundingBox, width: f32, height: f32) -> BoundingBox {
    BoundingBox {
        x1: bbox.x1.clamp(0.0, width),
        y1: bbox.y1.clamp(0.0, height),
        x2: bbox.x2.clamp(0.0, width),
        y2: bbox.y2.clamp(0.0, height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Channel-major output for `classes` classes from per-anchor rows.
    fn output(classes: usize, anchors: &[[f32; 4]], scores: &[Vec<f32>]) -> Vec<f32> {
        let n = anchors.len();
        let mut data = vec![0.0; (4 + classes) * n];
        for (i, anchor) in anchors.iter().enumerate() {
            for (row, value) in anchor.iter().enumerate() {
                data[row * n + i] = *value;
            }
            for (c, score) in scores[i].iter().enumerate() {
                data[(4 + c) * n + i] = *score;
            }
        }
        data
    }

    #[test]
    fn test_decode_predictions_picks_best_class() {
        let data = output(
            3,
            &[[50.0, 40.0, 20.0, 10.0], [10.0, 10.0, 4.0, 4.0]],
            &[vec![0.1, 0.7, 0.2], vec![0.05, 0.1, 0.1]],
        );

        let found = decode_predictions(&data, 3, 0.25).unwrap();
        assert_eq!(found.len(), 1);
        let (bbox, score, class) = found[0];
        assert_eq!(class, 1);
        assert!((score - 0.7).abs() < 1e-6);
        assert_eq!(
            bbox,
            BoundingBox {
                x1: 40.0,
                y1: 35.0,
                x2: 60.0,
                y2: 45.0
            }
        );
    }

    #[test]
    fn test_decode_predictions_rejects_bad_shape() {
        assert!(decode_predictions(&[0.0; 9], 3, 0.25).is_err());
        assert!(decode_predictions(&[], 3, 0.25).is_err());
    }

    #[test]
    fn test_nms_is_per_class() {
        let same = BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
        };
        let kept = suppress_per_class(vec![(same, 0.9, 0), (same, 0.8, 0), (same, 0.6, 5)], 0.45);

        let classes: Vec<usize> = kept.iter().map(|k| k.2).collect();
        assert_eq!(classes, vec![0, 5]);
        assert_eq!(kept[0].1, 0.9);
    }

    #[test]
    fn test_boxes_map_back_to_image_pixels() {
        let input = BoundingBox {
            x1: 320.0,
            y1: 160.0,
            x2: 660.0,
            y2: 480.0,
        };
        // 640x640 input from a 1280x960 photo
        let mapped = clamp_to(input.scaled(2.0, 1.5), 1280.0, 960.0);
        assert_eq!(
            mapped,
            BoundingBox {
                x1: 640.0,
                y1: 240.0,
                x2: 1280.0,
                y2: 720.0
            }
        );
    }

    #[test]
    fn test_coco_labels() {
        assert_eq!(COCO_LABELS[0], "person");
        assert_eq!(COCO_LABELS[63], "laptop");
    }
}
