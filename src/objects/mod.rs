//! Closed-set object detection (COCO labels).

pub mod yolo;

pub use yolo::OnnxObjectDetector;

use anyhow::Result;
use std::path::Path;

use crate::db::BoundingBox;

/// A labelled box, before it is given an id and stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: f32,
    /// Pixel coordinates in the image as it was read from disk
    pub bbox: BoundingBox,
}

/// Finds labelled objects in an image.
pub trait ObjectDetector: Send + Sync {
    fn model_name(&self) -> &str;

    /// An image without detections is `Ok(vec![])`.
    fn detect_objects(&self, path: &Path) -> Result<Vec<DetectedObject>>;
}
