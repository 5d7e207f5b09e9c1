//! Whole-image embedding models.
//!
//! Indexing and search only see the [`ImageEmbedder`] trait: the same model
//! name always means the same vector space. [`OnnxImageEmbedder`] runs
//! CLIP/SigLIP-style encoders exported to ONNX.

mod model;

pub use model::OnnxImageEmbedder;

use anyhow::Result;
use std::path::{Path, PathBuf};

/// Maps images (and text queries) into one model's vector space.
pub trait ImageEmbedder: Send + Sync {
    /// Identity string of the model and weights.
    fn model_name(&self) -> &str;

    /// Length of every vector this embedder produces.
    fn dimensions(&self) -> usize;

    /// Embed a batch of image files, one L2-normalised vector per path in order.
    ///
    /// # Errors
    ///
    /// Fails as a whole if any image cannot be read or the model fails.
    fn embed_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single image file.
    fn embed_image(&self, path: &Path) -> Result<Vec<f32>> {
        let mut vectors = self.embed_images(&[path.to_path_buf()])?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Embedder returned no vector for {}", path.display()))
    }

    /// Embed a text query into the same space as the images.
    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
}
