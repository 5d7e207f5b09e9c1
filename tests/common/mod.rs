#![allow(dead_code)]

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

use eventlens::db::{BoundingBox, Database, NewImage};
use eventlens::embedding::ImageEmbedder;
use eventlens::faces::{DetectedFace, FaceDetector};
use eventlens::objects::{DetectedObject, ObjectDetector};

pub fn memory_store() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.initialize().unwrap();
    db
}

/// On-disk store inside its own temp dir, plus a data directory for image files.
pub struct TestArchive {
    pub root: TempDir,
    pub db: Database,
}

impl TestArchive {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let db = Database::open(&root.path().join("store.db")).unwrap();
        db.initialize().unwrap();
        std::fs::create_dir_all(root.path().join("data")).unwrap();
        Self { root, db }
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.path().join("store.db")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.path().join("data")
    }

    /// Register an image and create its file under the data directory.
    pub fn add_image(&self, name: &str, group: &str, year: i32) -> i64 {
        std::fs::write(self.data_dir().join(name), name.as_bytes()).unwrap();
        self.add_image_without_file(name, group, year)
    }

    /// Register an image whose file does not exist.
    pub fn add_image_without_file(&self, name: &str, group: &str, year: i32) -> i64 {
        self.db
            .register_image(
                &NewImage::new(format!("https://photos.example.org/{}", name), group, year)
                    .with_storage_path(name),
            )
            .unwrap();
        self.db
            .lookup_by_source_url(&format!("https://photos.example.org/{}", name))
            .unwrap()
            .unwrap()
            .id
    }
}

/// Random unit vectors from a fixed seed.
pub fn random_unit_vectors(seed: u64, count: usize, dim: usize) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            normalize(v)
        })
        .collect()
}

pub fn normalize(v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.into_iter().map(|x| x / norm).collect()
}

fn file_key(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Embedder that looks vectors up by file name.
///
/// Files listed in `failing` make any batch containing them fail, and fail
/// again when embedded alone.
pub struct FakeEmbedder {
    pub name: String,
    pub dim: usize,
    pub vectors: HashMap<String, Vec<f32>>,
    pub texts: HashMap<String, Vec<f32>>,
    pub failing: HashSet<String>,
    pub batch_calls: Mutex<Vec<usize>>,
}

impl FakeEmbedder {
    pub fn new(name: &str, dim: usize) -> Self {
        Self {
            name: name.to_string(),
            dim,
            vectors: HashMap::new(),
            texts: HashMap::new(),
            failing: HashSet::new(),
            batch_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_vector(mut self, file: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(file.to_string(), vector);
        self
    }

    pub fn with_text(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.texts.insert(text.to_string(), vector);
        self
    }

    pub fn failing_on(mut self, file: &str) -> Self {
        self.failing.insert(file.to_string());
        self
    }
}

impl ImageEmbedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dim
    }

    fn embed_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.lock().unwrap().push(paths.len());
        paths
            .iter()
            .map(|path| {
                let key = file_key(path);
                if self.failing.contains(&key) {
                    return Err(anyhow!("cannot decode {}", key));
                }
                self.vectors
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| anyhow!("no vector for {}", key))
            })
            .collect()
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.texts
            .get(text)
            .cloned()
            .ok_or_else(|| anyhow!("no vector for text {:?}", text))
    }
}

pub fn face(embedding: Vec<f32>, det_score: f32) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox {
            x1: 10.0,
            y1: 20.0,
            x2: 60.0,
            y2: 90.0,
        },
        det_score,
        landmark: None,
        age: None,
        gender: None,
        embedding,
    }
}

/// Detector returning canned faces per file name; unknown files have no faces.
pub struct FakeDetector {
    pub name: String,
    pub dim: usize,
    pub faces: HashMap<String, Vec<DetectedFace>>,
    pub failing: HashSet<String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeDetector {
    pub fn new(name: &str, dim: usize) -> Self {
        Self {
            name: name.to_string(),
            dim,
            faces: HashMap::new(),
            failing: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_faces(mut self, file: &str, faces: Vec<DetectedFace>) -> Self {
        self.faces.insert(file.to_string(), faces);
        self
    }

    pub fn failing_on(mut self, file: &str) -> Self {
        self.failing.insert(file.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl FaceDetector for FakeDetector {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dim
    }

    fn detect_faces(&self, path: &Path) -> Result<Vec<DetectedFace>> {
        let key = file_key(path);
        self.calls.lock().unwrap().push(key.clone());
        if self.failing.contains(&key) {
            return Err(anyhow!("detector crashed on {}", key));
        }
        Ok(self.faces.get(&key).cloned().unwrap_or_default())
    }
}

pub fn object(label: &str, confidence: f32) -> DetectedObject {
    DetectedObject {
        label: label.to_string(),
        confidence,
        bbox: BoundingBox {
            x1: 100.0,
            y1: 50.0,
            x2: 300.0,
            y2: 400.0,
        },
    }
}

/// Object detector returning canned boxes per file name.
pub struct FakeObjectDetector {
    pub name: String,
    pub objects: HashMap<String, Vec<DetectedObject>>,
    pub failing: HashSet<String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeObjectDetector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: HashMap::new(),
            failing: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_objects(mut self, file: &str, objects: Vec<DetectedObject>) -> Self {
        self.objects.insert(file.to_string(), objects);
        self
    }

    pub fn failing_on(mut self, file: &str) -> Self {
        self.failing.insert(file.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ObjectDetector for FakeObjectDetector {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn detect_objects(&self, path: &Path) -> Result<Vec<DetectedObject>> {
        let key = file_key(path);
        self.calls.lock().unwrap().push(key.clone());
        if self.failing.contains(&key) {
            return Err(anyhow!("detector crashed on {}", key));
        }
        Ok(self.objects.get(&key).cloned().unwrap_or_default())
    }
}
