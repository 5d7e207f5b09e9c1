use anyhow::Result;
use std::path::PathBuf;
use std::sync::mpsc;

use super::{apply_limit, IndexOptions, IndexingStatus, Reporter, RunSummary};
use crate::db::{Database, ModelKind};
use crate::embedding::ImageEmbedder;

/// Fills in missing whole-image embeddings for one model.
pub struct EmbeddingIndexer<'a> {
    db: &'a Database,
    embedder: &'a dyn ImageEmbedder,
}

impl<'a> EmbeddingIndexer<'a> {
    pub fn new(db: &'a Database, embedder: &'a dyn ImageEmbedder) -> Self {
        Self { db, embedder }
    }

    /// Embed pending images (or every image with `force`) batch by batch.
    ///
    /// Store errors abort the run. Missing files and embedder failures are
    /// counted per image and leave the image pending.
    pub fn run(
        &self,
        options: &IndexOptions,
        progress: Option<mpsc::Sender<IndexingStatus>>,
    ) -> Result<RunSummary> {
        let reporter = Reporter::new(progress);
        let model = self.embedder.model_name().to_string();
        self.db
            .declare_model(&model, ModelKind::Image, self.embedder.dimensions())?;

        let work = if options.force {
            self.db.all_images()?
        } else {
            self.db.pending_images(&model)?
        };
        let work = apply_limit(work, options.limit);

        let mut summary = RunSummary {
            model: model.clone(),
            total: work.len(),
            ..Default::default()
        };
        tracing::info!(model = %model, total = summary.total, force = options.force, "Starting embedding run");
        reporter.send(IndexingStatus::Starting {
            model: model.clone(),
            total: summary.total,
        });

        let mut done = 0;
        for batch in work.chunks(options.batch_size.max(1)) {
            let mut present: Vec<(i64, PathBuf)> = Vec::with_capacity(batch.len());
            for (image_id, storage_path) in batch {
                let path = options.data_dir.join(storage_path);
                if path.is_file() {
                    present.push((*image_id, path));
                } else {
                    tracing::warn!(image_id, path = ?path, "Image file missing, skipping");
                    summary.skipped_missing += 1;
                    reporter.send(IndexingStatus::SkippedMissing {
                        image_id: *image_id,
                        path,
                    });
                    done += 1;
                    reporter.send(IndexingStatus::Progress {
                        done,
                        total: summary.total,
                    });
                }
            }

            if present.is_empty() {
                continue;
            }

            let (ids, vectors) = self.embed_batch(&present, &mut summary, &reporter);
            if !ids.is_empty() {
                summary.written += self.db.insert_vectors(&ids, &vectors, &model)?;
                summary.processed += ids.len();
            }

            for _ in &present {
                done += 1;
                reporter.send(IndexingStatus::Progress {
                    done,
                    total: summary.total,
                });
            }
        }

        tracing::info!(
            model = %model,
            processed = summary.processed,
            written = summary.written,
            skipped_missing = summary.skipped_missing,
            errors = summary.errors,
            "Embedding run complete"
        );
        reporter.send(IndexingStatus::Completed(summary.clone()));

        Ok(summary)
    }

    /// Embed a batch in one call; if that fails, retry image by image so a
    /// single bad file only costs itself.
    fn embed_batch(
        &self,
        present: &[(i64, PathBuf)],
        summary: &mut RunSummary,
        reporter: &Reporter,
    ) -> (Vec<i64>, Vec<Vec<f32>>) {
        let paths: Vec<PathBuf> = present.iter().map(|(_, p)| p.clone()).collect();

        match self.embedder.embed_images(&paths) {
            Ok(vectors) if vectors.len() == present.len() => {
                return (present.iter().map(|(id, _)| *id).collect(), vectors);
            }
            Ok(vectors) => {
                tracing::warn!(
                    expected = present.len(),
                    got = vectors.len(),
                    "Embedder returned wrong number of vectors, retrying per image"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, size = present.len(), "Batch embedding failed, retrying per image");
            }
        }

        let mut ids = Vec::new();
        let mut vectors = Vec::new();
        for (image_id, path) in present {
            match self.embedder.embed_image(path) {
                Ok(vector) => {
                    ids.push(*image_id);
                    vectors.push(vector);
                }
                Err(e) => {
                    tracing::warn!(image_id, path = ?path, error = %e, "Embedding failed");
                    summary.errors += 1;
                    reporter.send(IndexingStatus::Error {
                        image_id: *image_id,
                        message: format!("Error embedding {}: {}", path.display(), e),
                    });
                }
            }
        }

        (ids, vectors)
    }
}
