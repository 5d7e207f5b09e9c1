//! Incremental indexing: compute what is missing for a model and store it.
//!
//! All indexers are safe to re-run at any point. Work is derived from the
//! store on every run (missing embedding rows, or missing ledger rows for
//! faces and objects), processed in ascending image id order.

mod embeddings;
mod faces;
mod objects;

pub use embeddings::EmbeddingIndexer;
pub use faces::FaceIndexer;
pub use objects::ObjectIndexer;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc;

use crate::config::IndexingConfig;

/// Status updates during an indexing run
#[derive(Debug, Clone, PartialEq)]
pub enum IndexingStatus {
    /// Work set computed
    Starting { model: String, total: usize },
    /// One more image finished (whatever its outcome)
    Progress { done: usize, total: usize },
    /// The image's file is not on disk; it stays pending
    SkippedMissing { image_id: i64, path: PathBuf },
    /// Faces detected on an image
    FoundFaces { image_id: i64, count: usize },
    /// Labelled objects detected on an image
    FoundObjects { image_id: i64, count: usize },
    /// Embedding or detection failed for one image
    Error { image_id: i64, message: String },
    /// Run finished
    Completed(RunSummary),
}

/// Aggregate outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub model: String,
    /// Images in the work set
    pub total: usize,
    /// Images embedded or scanned successfully
    pub processed: usize,
    /// Rows newly written to the store
    pub written: usize,
    pub skipped_missing: usize,
    pub errors: usize,
    pub faces_found: usize,
    pub objects_found: usize,
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Directory catalog storage paths are relative to
    pub data_dir: PathBuf,
    /// Whole images: run over every image. Faces and objects: reset the model first.
    pub force: bool,
    /// Cap on the number of images in this run
    pub limit: Option<usize>,
    pub batch_size: usize,
    pub commit_interval: usize,
}

impl IndexOptions {
    pub fn new(data_dir: impl Into<PathBuf>, config: &IndexingConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            force: false,
            limit: None,
            batch_size: config.batch_size.max(1),
            commit_interval: config.face_commit_interval.max(1),
        }
    }
}

/// Optional status channel; send failures (receiver gone) are ignored.
#[derive(Clone)]
pub(crate) struct Reporter(Option<mpsc::Sender<IndexingStatus>>);

impl Reporter {
    pub(crate) fn new(sender: Option<mpsc::Sender<IndexingStatus>>) -> Self {
        Self(sender)
    }

    pub(crate) fn send(&self, status: IndexingStatus) {
        if let Some(ref tx) = self.0 {
            let _ = tx.send(status);
        }
    }
}

/// Apply the optional run cap.
fn apply_limit(mut work: Vec<(i64, String)>, limit: Option<usize>) -> Vec<(i64, String)> {
    if let Some(limit) = limit {
        work.truncate(limit);
    }
    work
}
