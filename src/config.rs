use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::GroupRename;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Root that catalog `storage_path` values are relative to
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Where ONNX models and tokenizers are kept
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default = "default_image_models")]
    pub image_models: Vec<ImageModelConfig>,

    #[serde(default)]
    pub faces: FaceModelConfig,

    #[serde(default)]
    pub objects: ObjectModelConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Images per embedder call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Face-detection results are committed after this many images
    #[serde(default = "default_face_commit_interval")]
    pub face_commit_interval: usize,
}

fn default_batch_size() -> usize {
    32
}

fn default_face_commit_interval() -> usize {
    50
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            face_commit_interval: default_face_commit_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Initial raw face pool, as a multiple of the requested number of images
    #[serde(default = "default_face_pool_multiplier")]
    pub face_pool_multiplier: usize,
}

fn default_limit() -> usize {
    20
}

fn default_face_pool_multiplier() -> usize {
    2
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            face_pool_multiplier: default_face_pool_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
        "webp".to_string(),
    ]
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
        }
    }
}

/// One whole-image embedding model (visual encoder plus optional text encoder)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageModelConfig {
    /// Identity string; a new version of the weights needs a new name
    pub name: String,
    pub dim: usize,

    /// Visual encoder file name inside `models_dir`
    pub visual_model: String,
    #[serde(default)]
    pub visual_url: Option<String>,
    #[serde(default = "default_visual_input")]
    pub visual_input: String,
    /// Output tensor to read; the first output when unset
    #[serde(default)]
    pub visual_output: Option<String>,

    #[serde(default)]
    pub text_model: Option<String>,
    #[serde(default)]
    pub text_url: Option<String>,
    #[serde(default = "default_text_input")]
    pub text_input: String,
    #[serde(default)]
    pub text_output: Option<String>,
    /// HuggingFace tokenizer.json file name inside `models_dir`
    #[serde(default)]
    pub tokenizer: Option<String>,
    #[serde(default)]
    pub tokenizer_url: Option<String>,
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    #[serde(default)]
    pub pad_token_id: i64,

    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

fn default_visual_input() -> String {
    "pixel_values".to_string()
}

fn default_text_input() -> String {
    "input_ids".to_string()
}

fn default_context_length() -> usize {
    77
}

fn default_image_size() -> u32 {
    224
}

fn default_mean() -> [f32; 3] {
    [0.48145466, 0.4578275, 0.40821073]
}

fn default_std() -> [f32; 3] {
    [0.26862954, 0.26130258, 0.27577711]
}

fn default_image_models() -> Vec<ImageModelConfig> {
    vec![ImageModelConfig {
        name: "clip-vit-b32".to_string(),
        dim: 512,
        visual_model: "clip-vit-b32-vision.onnx".to_string(),
        visual_url: Some(
            "https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx".to_string(),
        ),
        visual_input: default_visual_input(),
        visual_output: None,
        text_model: Some("clip-vit-b32-text.onnx".to_string()),
        text_url: Some(
            "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/model.onnx".to_string(),
        ),
        text_input: default_text_input(),
        text_output: None,
        tokenizer: Some("clip-vit-b32-tokenizer.json".to_string()),
        tokenizer_url: Some(
            "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/tokenizer.json".to_string(),
        ),
        context_length: default_context_length(),
        pad_token_id: 0,
        image_size: default_image_size(),
        mean: default_mean(),
        std: default_std(),
    }]
}

/// Face detector plus recognition embedder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaceModelConfig {
    #[serde(default = "default_face_model_name")]
    pub model_name: String,

    #[serde(default = "default_face_dim")]
    pub dim: usize,

    #[serde(default = "default_detection_model")]
    pub detection_model: String,
    #[serde(default = "default_detection_url")]
    pub detection_url: Option<String>,

    #[serde(default = "default_recognition_model")]
    pub recognition_model: String,
    #[serde(default = "default_recognition_url")]
    pub recognition_url: Option<String>,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
}

fn default_face_model_name() -> String {
    "ultraface320-arcface-r100".to_string()
}

fn default_face_dim() -> usize {
    512
}

fn default_detection_model() -> String {
    "ultraface-320.onnx".to_string()
}

fn default_detection_url() -> Option<String> {
    Some("https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx".to_string())
}

fn default_recognition_model() -> String {
    "arcface-resnet100.onnx".to_string()
}

fn default_recognition_url() -> Option<String> {
    Some("https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx".to_string())
}

fn default_confidence_threshold() -> f32 {
    0.7
}

fn default_nms_threshold() -> f32 {
    0.3
}

impl Default for FaceModelConfig {
    fn default() -> Self {
        Self {
            model_name: default_face_model_name(),
            dim: default_face_dim(),
            detection_model: default_detection_model(),
            detection_url: default_detection_url(),
            recognition_model: default_recognition_model(),
            recognition_url: default_recognition_url(),
            confidence_threshold: default_confidence_threshold(),
            nms_threshold: default_nms_threshold(),
        }
    }
}

/// YOLO object detector exported to ONNX
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectModelConfig {
    #[serde(default = "default_object_model_name")]
    pub model_name: String,

    /// Model file name inside `models_dir`
    #[serde(default = "default_object_model_file")]
    pub model_file: String,
    #[serde(default)]
    pub model_url: Option<String>,

    #[serde(default = "default_object_input_name")]
    pub input_name: String,
    /// Square input side the model was exported with
    #[serde(default = "default_object_input_size")]
    pub input_size: u32,

    #[serde(default = "default_object_confidence")]
    pub confidence_threshold: f32,
    #[serde(default = "default_object_nms")]
    pub nms_threshold: f32,
}

fn default_object_model_name() -> String {
    "yolo11n-coco".to_string()
}

fn default_object_model_file() -> String {
    "yolo11n.onnx".to_string()
}

fn default_object_input_name() -> String {
    "images".to_string()
}

fn default_object_input_size() -> u32 {
    640
}

fn default_object_confidence() -> f32 {
    0.25
}

fn default_object_nms() -> f32 {
    0.45
}

impl Default for ObjectModelConfig {
    fn default() -> Self {
        Self {
            model_name: default_object_model_name(),
            model_file: default_object_model_file(),
            model_url: None,
            input_name: default_object_input_name(),
            input_size: default_object_input_size(),
            confidence_threshold: default_object_confidence(),
            nms_threshold: default_object_nms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MaintenanceConfig {
    /// Group renames applied by `rename-groups`
    #[serde(default)]
    pub renames: Vec<GroupRename>,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eventlens")
        .join("eventlens.db")
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eventlens")
        .join("images")
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("eventlens")
        .join("models")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            data_dir: default_data_dir(),
            models_dir: default_models_dir(),
            indexing: IndexingConfig::default(),
            search: SearchConfig::default(),
            scanner: ScannerConfig::default(),
            image_models: default_image_models(),
            faces: FaceModelConfig::default(),
            objects: ObjectModelConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path` (or the default location), writing defaults if it is missing.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&config_path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("eventlens")
            .join("config.toml")
    }

    pub fn image_model(&self, name: &str) -> Option<&ImageModelConfig> {
        self.image_models.iter().find(|m| m.name == name)
    }

    /// The model used when none is named: the first configured one.
    pub fn default_image_model(&self) -> Option<&ImageModelConfig> {
        self.image_models.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.image_models, config.image_models);
        assert_eq!(parsed.faces, config.faces);
        assert_eq!(parsed.objects, config.objects);
        assert_eq!(parsed.indexing.batch_size, 32);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            db_path = "/tmp/x.db"

            [search]
            face_pool_multiplier = 3

            [[maintenance.renames]]
            from = "Pycon JP 2019"
            to = "PyCon JP 2019"

            [[maintenance.renames]]
            from = "Guido meetup"
            to = "Guido meetup 2023"
            year = 2023
            "#,
        )
        .unwrap();

        assert_eq!(parsed.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(parsed.search.face_pool_multiplier, 3);
        assert_eq!(parsed.search.default_limit, 20);
        assert_eq!(parsed.indexing.face_commit_interval, 50);
        assert_eq!(parsed.faces.dim, 512);
        assert_eq!(parsed.objects.input_size, 640);
        assert_eq!(parsed.objects.model_url, None);
        assert_eq!(parsed.maintenance.renames.len(), 2);
        assert_eq!(parsed.maintenance.renames[0].year, None);
        assert_eq!(parsed.maintenance.renames[1].year, Some(2023));
        assert!(parsed.default_image_model().is_some());
    }

    #[test]
    fn test_load_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.search.default_limit, 20);

        let reloaded = Config::load(Some(&path)).unwrap();
        assert_eq!(reloaded.image_models, config.image_models);
    }
}
