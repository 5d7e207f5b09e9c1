//! Image and text encoders on ONNX Runtime

use anyhow::{anyhow, Result};
use ort::session::Session;
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokenizers::Tokenizer;

use super::ImageEmbedder;
use crate::config::ImageModelConfig;
use crate::onnx::{ensure_model, extract_output, image_to_nchw, l2_normalize, load_session};

struct TextEncoder {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

/// Visual and (optionally) text encoder of one configured model.
///
/// Sessions live as long as the embedder; callers load one per run or
/// session and pass it to whatever needs it.
pub struct OnnxImageEmbedder {
    config: ImageModelConfig,
    visual: Option<Mutex<Session>>,
    text: Option<TextEncoder>,
}

impl OnnxImageEmbedder {
    /// Load both encoders.
    pub fn load(config: &ImageModelConfig, models_dir: &Path) -> Result<Self> {
        let mut embedder = Self::load_visual(config, models_dir)?;
        embedder.text = Some(load_text_encoder(config, models_dir)?);
        Ok(embedder)
    }

    /// Load only the visual encoder (enough for indexing).
    pub fn load_visual(config: &ImageModelConfig, models_dir: &Path) -> Result<Self> {
        let path = ensure_model(models_dir, &config.visual_model, config.visual_url.as_deref())?;
        let session = load_session(&path)?;
        tracing::info!(model = %config.name, path = ?path, "Loaded visual encoder");

        Ok(Self {
            config: config.clone(),
            visual: Some(Mutex::new(session)),
            text: None,
        })
    }

    /// Load only the text encoder (enough for text search).
    pub fn load_text(config: &ImageModelConfig, models_dir: &Path) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            visual: None,
            text: Some(load_text_encoder(config, models_dir)?),
        })
    }

    fn check_dim(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.config.dim {
            return Err(anyhow!(
                "Model '{}' produced {}-dimensional output, configured dim is {}",
                self.config.name,
                embedding.len(),
                self.config.dim
            ));
        }
        Ok(())
    }
}

fn load_text_encoder(config: &ImageModelConfig, models_dir: &Path) -> Result<TextEncoder> {
    let model_file = config
        .text_model
        .as_deref()
        .ok_or_else(|| anyhow!("Model '{}' has no text encoder configured", config.name))?;
    let tokenizer_file = config
        .tokenizer
        .as_deref()
        .ok_or_else(|| anyhow!("Model '{}' has no tokenizer configured", config.name))?;

    let model_path = ensure_model(models_dir, model_file, config.text_url.as_deref())?;
    let tokenizer_path = ensure_model(models_dir, tokenizer_file, config.tokenizer_url.as_deref())?;

    let session = load_session(&model_path)?;
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow!("Failed to load tokenizer {}: {}", tokenizer_path.display(), e))?;
    tracing::info!(model = %config.name, path = ?model_path, "Loaded text encoder");

    Ok(TextEncoder {
        session: Mutex::new(session),
        tokenizer,
    })
}

impl ImageEmbedder for OnnxImageEmbedder {
    fn model_name(&self) -> &str {
        &self.config.name
    }

    fn dimensions(&self) -> usize {
        self.config.dim
    }

    fn embed_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let visual = self
            .visual
            .as_ref()
            .ok_or_else(|| anyhow!("Visual encoder for '{}' is not loaded", self.config.name))?;

        let size = self.config.image_size;
        let mean = self.config.mean;
        let std = self.config.std;

        let mut input_data = Vec::with_capacity(paths.len() * 3 * (size * size) as usize);
        for path in paths {
            let img = image::open(path)
                .map_err(|e| anyhow!("Failed to load image {}: {}", path.display(), e))?;
            input_data.extend(image_to_nchw(&img, size, size, |c, v| {
                (v / 255.0 - mean[c]) / std[c]
            }));
        }

        let input_tensor = Tensor::from_array((
            [paths.len(), 3, size as usize, size as usize],
            input_data.into_boxed_slice(),
        ))?;

        let mut model = visual
            .lock()
            .map_err(|e| anyhow!("Failed to lock model: {}", e))?;
        let outputs = model.run(ort::inputs![self.config.visual_input.as_str() => input_tensor])?;
        let flat = extract_output!(outputs, self.config.visual_output.as_deref());

        if flat.len() != paths.len() * self.config.dim {
            return Err(anyhow!(
                "Model '{}' returned {} values for {} images of dim {}",
                self.config.name,
                flat.len(),
                paths.len(),
                self.config.dim
            ));
        }

        Ok(flat
            .chunks_exact(self.config.dim)
            .map(|chunk| l2_normalize(chunk.to_vec()))
            .collect())
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let encoder = self
            .text
            .as_ref()
            .ok_or_else(|| anyhow!("Text encoder for '{}' is not loaded", self.config.name))?;

        let encoding = encoder
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Failed to tokenize query: {}", e))?;

        let context = self.config.context_length;
        let mut input_ids: Vec<i64> = encoding
            .get_ids()
            .iter()
            .take(context)
            .map(|&id| id as i64)
            .collect();
        input_ids.resize(context, self.config.pad_token_id);

        let input_tensor = Tensor::from_array(([1usize, context], input_ids.into_boxed_slice()))?;

        let mut model = encoder
            .session
            .lock()
            .map_err(|e| anyhow!("Failed to lock model: {}", e))?;
        let outputs = model.run(ort::inputs![self.config.text_input.as_str() => input_tensor])?;
        let embedding = extract_output!(outputs, self.config.text_output.as_deref());

        self.check_dim(&embedding)?;
        Ok(l2_normalize(embedding))
    }
}
