//! Shared ONNX Runtime plumbing for the embedding and face models.

use anyhow::{anyhow, Result};
use image::DynamicImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::{Path, PathBuf};

/// Resolve a model file inside `models_dir`, downloading it first if missing.
pub fn ensure_model(models_dir: &Path, filename: &str, url: Option<&str>) -> Result<PathBuf> {
    let model_path = models_dir.join(filename);
    if model_path.exists() {
        return Ok(model_path);
    }

    let url = url.ok_or_else(|| {
        anyhow!(
            "Model file {} not found and no download URL configured",
            model_path.display()
        )
    })?;

    std::fs::create_dir_all(models_dir)?;
    tracing::info!(model = %filename, %url, "Downloading model...");
    let response = ureq::get(url)
        .call()
        .map_err(|e| anyhow!("Failed to download model: {}", e))?;

    // Only a complete download is renamed into place
    let partial = model_path.with_extension("partial");
    let mut file = std::fs::File::create(&partial)?;
    std::io::copy(&mut response.into_reader(), &mut file)?;
    std::fs::rename(&partial, &model_path)?;
    tracing::info!(model = %filename, path = ?model_path, "Model downloaded");

    Ok(model_path)
}

pub fn load_session(path: &Path) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(path)?;
    Ok(session)
}

/// Resize to `width`x`height` and lay out as a flat NCHW tensor, mapping each
/// channel value `v` in `0..=255` through `normalize(channel, v)`.
pub fn image_to_nchw(
    img: &DynamicImage,
    width: u32,
    height: u32,
    normalize: impl Fn(usize, f32) -> f32,
) -> Vec<f32> {
    let resized = img.resize_exact(width, height, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let plane = (width * height) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * width as usize + x as usize;
        for channel in 0..3 {
            input_data[channel * plane + idx] = normalize(channel, pixel[channel] as f32);
        }
    }

    input_data
}

/// Read an f32 output tensor from session outputs as a flat `Vec<f32>`:
/// the output called `$name` when it is `Some`, otherwise the first output.
macro_rules! extract_output {
    ($outputs:expr, $name:expr) => {{
        let name: Option<&str> = $name;
        match name {
            Some(name) => {
                let value = $outputs
                    .get(name)
                    .ok_or_else(|| anyhow::anyhow!("Model has no output named '{}'", name))?;
                let (_shape, data) = value.try_extract_tensor::<f32>()?;
                data.to_vec()
            }
            None => {
                let (_name, value) = $outputs
                    .iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("Model produced no outputs"))?;
                let (_shape, data) = value.try_extract_tensor::<f32>()?;
                data.to_vec()
            }
        }
    }};
}
pub(crate) use extract_output;

/// Scale to unit length. Zero vectors are returned unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
