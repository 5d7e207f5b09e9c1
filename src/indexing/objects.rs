use anyhow::Result;
use std::sync::mpsc;
use uuid::Uuid;

use super::{apply_limit, IndexOptions, IndexingStatus, Reporter, RunSummary};
use crate::db::{Database, ObjectDetection};
use crate::objects::ObjectDetector;

/// Labels objects on images with one detector model.
pub struct ObjectIndexer<'a> {
    db: &'a Database,
    detector: &'a dyn ObjectDetector,
}

impl<'a> ObjectIndexer<'a> {
    pub fn new(db: &'a Database, detector: &'a dyn ObjectDetector) -> Self {
        Self { db, detector }
    }

    /// Detect objects on every image the object ledger has not seen for this model.
    ///
    /// Same bookkeeping as face runs: images with no detections are still
    /// marked, missing files stay pending, commits every `commit_interval`.
    pub fn run(
        &self,
        options: &IndexOptions,
        progress: Option<mpsc::Sender<IndexingStatus>>,
    ) -> Result<RunSummary> {
        let reporter = Reporter::new(progress);
        let model = self.detector.model_name().to_string();

        if options.force {
            self.db.reset_object_model(&model)?;
        }

        let work = apply_limit(self.db.pending_object_images(&model)?, options.limit);
        let mut summary = RunSummary {
            model: model.clone(),
            total: work.len(),
            ..Default::default()
        };
        tracing::info!(model = %model, total = summary.total, force = options.force, "Starting object run");
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
                tracing::warn!(image_id, path = ?path, "Image file missing, skipping");
                summary.skipped_missing += 1;
                reporter.send(IndexingStatus::SkippedMissing { image_id, path });
            } else {
                match self.detector.detect_objects(&path) {
                    Ok(objects) => {
                        let count = objects.len();
                        let detections: Vec<ObjectDetection> = objects
                            .into_iter()
                            .map(|object| ObjectDetection {
                                detection_id: Uuid::new_v4().to_string(),
                                image_id,
                                model_name: model.clone(),
                                label: object.label,
                                confidence: object.confidence,
                                bbox: object.bbox,
                            })
                            .collect();

                        summary.written += self.db.insert_object_detections(&detections)?;
                        self.db.mark_objects_processed(image_id, &model, count)?;

                        summary.processed += 1;
                        summary.objects_found += count;
                        since_commit += 1;

                        if count > 0 {
                            reporter.send(IndexingStatus::FoundObjects { image_id, count });
                        }
                    }
                    Err(e) => {
                        tracing::warn!(image_id, path = ?path, error = %e, "Object detection failed");
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
            objects = summary.objects_found,
            skipped_missing = summary.skipped_missing,
            errors = summary.errors,
            "Object run complete"
        );
        reporter.send(IndexingStatus::Completed(summary.clone()));

        Ok(summary)
    }
}
