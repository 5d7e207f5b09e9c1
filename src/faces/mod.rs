//! Face detection and recognition embeddings.

pub mod detector;

pub use detector::OnnxFaceDetector;

use anyhow::Result;
use std::path::Path;

use crate::db::{BoundingBox, Gender};

/// A face found by a detector, before it is given an id and stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    /// Pixel coordinates in the image as it was read from disk
    pub bbox: BoundingBox,
    pub det_score: f32,
    pub landmark: Option<Vec<[f32; 2]>>,
    pub age: Option<u32>,
    pub gender: Option<Gender>,
    pub embedding: Vec<f32>,
}

/// Finds faces in an image and embeds each one.
pub trait FaceDetector: Send + Sync {
    /// Identity string of the detector and recognition weights.
    fn model_name(&self) -> &str;

    /// Length of every face embedding.
    fn dimensions(&self) -> usize;

    /// Detect all faces in an image file. An image without faces is `Ok(vec![])`.
    fn detect_faces(&self, path: &Path) -> Result<Vec<DetectedFace>>;
}
