use anyhow::Result;
use std::sync::mpsc;
use uuid::Uuid;

use super::{apply_limit, IndexOptions, IndexingStatus, Reporter, RunSummary};
use crate::db::{Database, FaceDetection, ModelKind};
use crate::faces::{DetectedFace, FaceDetector};

/// Scans images for faces with one detector model.
pub struct FaceIndexer<'a> {
    db: &'a Database,
    detector: &'a dyn FaceDetector,
}

impl<'a> FaceIndexer<'a> {
    pub fn new(db: &'a Database, detector: &'a dyn FaceDetector) -> Self {
        Self { db, detector }
    }

    /// Detect faces on every image the ledger has not seen for this model.
    ///
    /// Each scanned image is marked processed right after its detections are
    /// written, including images with no faces. Writes are committed every
    /// `commit_interval` images. With `force`, all detections and ledger rows
    /// of the model are deleted first.
    pub fn run(
        &self,
        options: &IndexOptions,
        progress: Option<mpsc::Sender<IndexingStatus>>,
    ) -> Result<RunSummary> {
        let reporter = Reporter::new(progress);
        let model = self.detector.model_name().to_string();
        self.db
            .declare_model(&model, ModelKind::Face, self.detector.dimensions())?;

        if options.force {
            self.db.reset_face_model(&model)?;
        }

        let work = apply_limit(self.db.pending_face_images(&model)?, options.limit);
        let mut summary = RunSummary {
            model: model.clone(),
            total: work.len(),
            ..Default::default()
        };
        tracing::info!(model = %model, total = summary.total, force = options.force, "Starting face run");
        reporter.send(IndexingStatus::Starting {
            model: model.clone(),
            total: summary.total,
        });

        let interval = options.commit_interval.max(1);
        let mut tx = self.db.transaction()?;
        let mut since_commit = 0;

        for (idx, (image_id, storage_path)) in work.iter().enumerate() {
            let image_id = *image_id;
            let path = options.data_dir.join(storage_path);

            if !path.is_file() {
                // Not marked: the image is retried once the file exists again
                tracing::warn!(image_id, path = ?path, "Image file missing, skipping");
                summary.skipped_missing += 1;
                reporter.send(IndexingStatus::SkippedMissing { image_id, path });
            } else {
                match self.detector.detect_faces(&path) {
                    Ok(faces) => {
                        let count = faces.len();
                        let detections: Vec<FaceDetection> = faces
                            .into_iter()
                            .map(|face| to_detection(face, image_id, &model))
                            .collect();

                        summary.written += self.db.insert_detections(&detections)?;
                        self.db.mark_processed(image_id, &model, count)?;

                        summary.processed += 1;
                        summary.faces_found += count;
                        since_commit += 1;

                        if count > 0 {
                            reporter.send(IndexingStatus::FoundFaces { image_id, count });
                        }
                    }
                    Err(e) => {
                        tracing::warn!(image_id, path = ?path, error = %e, "Face detection failed");
                        summary.errors += 1;
                        reporter.send(IndexingStatus::Error {
                            image_id,
                            message: format!("Error processing {}: {}", path.display(), e),
                        });
                    }
                }
            }

            if since_commit >= interval {
                tx.commit()?;
                tracing::debug!(model = %model, done = idx + 1, "Committed face results");
                tx = self.db.transaction()?;
                since_commit = 0;
            }

            reporter.send(IndexingStatus::Progress {
                done: idx + 1,
                total: summary.total,
            });
        }

        tx.commit()?;

        tracing::info!(
            model = %model,
            processed = summary.processed,
            faces = summary.faces_found,
            skipped_missing = summary.skipped_missing,
            errors = summary.errors,
            "Face run complete"
        );
        reporter.send(IndexingStatus::Completed(summary.clone()));

        Ok(summary)
    }
}

fn to_detection(face: DetectedFace, image_id: i64, model: &str) -> FaceDetection {
    FaceDetection {
        face_id: Uuid::new_v4().to_string(),
        image_id,
        model_name: model.to_string(),
        bbox: face.bbox,
        det_score: face.det_score,
        landmark: face.landmark,
        age: face.age,
        gender: face.gender,
        embedding: face.embedding,
        person_label: None,
        cluster_id: None,
    }
}
