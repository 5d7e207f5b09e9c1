//! Administrative procedures: bulk group renames, store-to-store copies and
//! namespace purges. None of these run as part of normal indexing.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{Database, ModelKind};
use crate::error::StoreError;

/// Rename every image in group `from` to `to`, optionally moving it to `year`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRename {
    pub from: String,
    pub to: String,
    /// New `group_year` for every renamed row; not a filter
    #[serde(default)]
    pub year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameOutcome {
    pub rename: GroupRename,
    /// Rows whose `group_name` matched `from`
    pub matched: usize,
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub group_name: String,
    pub group_year: i32,
    pub count: i64,
}

/// Which tables to pull from another store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyPlan {
    pub images: bool,
    pub embeddings: bool,
    pub faces: bool,
    pub objects: bool,
}

impl CopyPlan {
    pub fn all() -> Self {
        Self {
            images: true,
            embeddings: true,
            faces: true,
            objects: true,
        }
    }
}

/// Rows copied per table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CopyReport {
    pub models: usize,
    pub images: usize,
    pub embeddings: usize,
    pub faces: usize,
    pub ledger: usize,
    pub objects: usize,
    pub object_ledger: usize,
}

const SOURCE_ALIAS: &str = "source_store";

impl Database {
    // ========================================================================
    // Group renames
    // ========================================================================

    /// Apply group renames in one savepoint, or only count matches when `dry_run`.
    ///
    /// Embeddings and detections reference `images.id`, so renaming a group is
    /// a plain update and leaves dependent rows in place.
    pub fn rename_groups(&self, renames: &[GroupRename], dry_run: bool) -> Result<Vec<RenameOutcome>> {
        self.with_savepoint("rename_groups", || {
            let mut outcomes = Vec::with_capacity(renames.len());

            for rename in renames {
                let matched = if dry_run {
                    let count: i64 = self.conn.query_row(
                        "SELECT COUNT(*) FROM images WHERE group_name = ?",
                        [&rename.from],
                        |row| row.get(0),
                    )?;
                    count as usize
                } else {
                    match rename.year {
                        Some(year) => self.conn.execute(
                            "UPDATE images SET group_name = ?, group_year = ? WHERE group_name = ?",
                            params![rename.to, year, rename.from],
                        )?,
                        None => self.conn.execute(
                            "UPDATE images SET group_name = ? WHERE group_name = ?",
                            params![rename.to, rename.from],
                        )?,
                    }
                };

                tracing::info!(
                    from = %rename.from,
                    to = %rename.to,
                    year = ?rename.year,
                    matched,
                    dry_run,
                    "Group rename"
                );

                outcomes.push(RenameOutcome {
                    rename: rename.clone(),
                    matched,
                    applied: !dry_run,
                });
            }

            Ok(outcomes)
        })
    }

    /// Image counts per `(group_name, group_year)`.
    pub fn group_summary(&self) -> Result<Vec<GroupSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT group_name, group_year, COUNT(*)
            FROM images
            GROUP BY group_name, group_year
            ORDER BY group_name, group_year
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(GroupSummary {
                    group_name: row.get(0)?,
                    group_year: row.get(1)?,
                    count: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    // ========================================================================
    // Namespace purge
    // ========================================================================

    /// Delete every stored vector of one image model. The declaration stays.
    pub fn purge_model_vectors(&self, model_name: &str) -> Result<usize> {
        self.require_model(model_name, ModelKind::Image)?;
        let deleted = self
            .conn
            .execute("DELETE FROM image_embeddings WHERE model_name = ?", [model_name])?;
        tracing::info!(model = %model_name, deleted, "Purged model vectors");
        Ok(deleted)
    }

    // ========================================================================
    // Store copy
    // ========================================================================

    /// Copy rows from another store file into this one.
    ///
    /// The source is attached read-only and every insert ignores rows that
    /// already exist here. Tables are copied parents first; a dependent row
    /// whose image is missing here fails the whole copy.
    pub fn copy_from_store(&self, source: &Path, plan: CopyPlan) -> Result<CopyReport> {
        if !source.exists() {
            anyhow::bail!("source store not found: {}", source.display());
        }

        let uri = format!("file:{}?mode=ro", escape_uri_path(&source.to_string_lossy()));
        self.conn
            .execute(&format!("ATTACH DATABASE ? AS {}", SOURCE_ALIAS), [&uri])
            .with_context(|| format!("Failed to attach {}", source.display()))?;

        let result = self.copy_attached(plan);

        let detached = self
            .conn
            .execute_batch(&format!("DETACH DATABASE {}", SOURCE_ALIAS));
        let report = result?;
        detached?;

        tracing::info!(
            source = %source.display(),
            models = report.models,
            images = report.images,
            embeddings = report.embeddings,
            faces = report.faces,
            ledger = report.ledger,
            objects = report.objects,
            object_ledger = report.object_ledger,
            "Copied from store"
        );
        Ok(report)
    }

    fn copy_attached(&self, plan: CopyPlan) -> Result<CopyReport> {
        let tx = self.transaction()?;
        let mut report = CopyReport::default();

        if plan.embeddings || plan.faces {
            self.check_source_models()?;
            report.models = self.conn.execute(
                &format!(
                    "INSERT INTO main.vector_models (model_name, kind, dim, declared_at)
                     SELECT model_name, kind, dim, declared_at FROM {}.vector_models
                     WHERE true
                     ON CONFLICT DO NOTHING",
                    SOURCE_ALIAS
                ),
                [],
            )?;
        }

        if plan.images {
            report.images = self.conn.execute(
                &format!(
                    "INSERT INTO main.images (
                         id, source_url, storage_path, external_photo_id, collection_id,
                         collection_title, group_name, group_year, group_kind, format,
                         width, height, byte_size, downloaded_at, created_at
                     )
                     SELECT id, source_url, storage_path, external_photo_id, collection_id,
                            collection_title, group_name, group_year, group_kind, format,
                            width, height, byte_size, downloaded_at, created_at
                     FROM {}.images
                     WHERE true
                     ORDER BY id
                     ON CONFLICT DO NOTHING",
                    SOURCE_ALIAS
                ),
                [],
            )?;
        }

        if plan.embeddings {
            report.embeddings = self.conn.execute(
                &format!(
                    "INSERT INTO main.image_embeddings (image_id, model_name, embedding, created_at)
                     SELECT image_id, model_name, embedding, created_at
                     FROM {}.image_embeddings
                     WHERE true
                     ORDER BY image_id, model_name
                     ON CONFLICT DO NOTHING",
                    SOURCE_ALIAS
                ),
                [],
            )?;
        }

        if plan.faces {
            report.faces = self.conn.execute(
                &format!(
                    "INSERT INTO main.face_detections (
                         face_id, image_id, model_name, bbox_x1, bbox_y1, bbox_x2, bbox_y2,
                         det_score, landmark, age, gender, embedding, person_label, cluster_id,
                         created_at
                     )
                     SELECT face_id, image_id, model_name, bbox_x1, bbox_y1, bbox_x2, bbox_y2,
                            det_score, landmark, age, gender, embedding, person_label, cluster_id,
                            created_at
                     FROM {}.face_detections
                     WHERE true
                     ORDER BY image_id, face_id
                     ON CONFLICT DO NOTHING",
                    SOURCE_ALIAS
                ),
                [],
            )?;
            report.ledger = self.conn.execute(
                &format!(
                    "INSERT INTO main.face_processed_images (image_id, model_name, face_count, processed_at)
                     SELECT image_id, model_name, face_count, processed_at
                     FROM {}.face_processed_images
                     WHERE true
                     ORDER BY image_id, model_name
                     ON CONFLICT DO NOTHING",
                    SOURCE_ALIAS
                ),
                [],
            )?;
        }

        if plan.objects {
            report.objects = self.conn.execute(
                &format!(
                    "INSERT INTO main.object_detections (
                         detection_id, image_id, model_name, label, confidence,
                         bbox_x1, bbox_y1, bbox_x2, bbox_y2, created_at
                     )
                     SELECT detection_id, image_id, model_name, label, confidence,
                            bbox_x1, bbox_y1, bbox_x2, bbox_y2, created_at
                     FROM {}.object_detections
                     WHERE true
                     ORDER BY image_id, detection_id
                     ON CONFLICT DO NOTHING",
                    SOURCE_ALIAS
                ),
                [],
            )?;
            report.object_ledger = self.conn.execute(
                &format!(
                    "INSERT INTO main.object_processed_images (image_id, model_name, object_count, processed_at)
                     SELECT image_id, model_name, object_count, processed_at
                     FROM {}.object_processed_images
                     WHERE true
                     ORDER BY image_id, model_name
                     ON CONFLICT DO NOTHING",
                    SOURCE_ALIAS
                ),
                [],
            )?;
        }

        tx.commit()?;
        Ok(report)
    }

    /// Fail if a model is declared differently in the attached source.
    fn check_source_models(&self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT model_name, kind, dim FROM {}.vector_models", SOURCE_ALIAS))?;
        let source_models = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (name, kind, dim) in source_models {
            let kind: ModelKind = kind.parse()?;
            let local = self
                .conn
                .query_row(
                    "SELECT kind, dim FROM main.vector_models WHERE model_name = ?",
                    [&name],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;

            if let Some((local_kind, local_dim)) = local {
                let local_kind: ModelKind = local_kind.parse()?;
                if local_kind != kind || local_dim != dim {
                    return Err(StoreError::ModelConflict {
                        model: name,
                        existing_kind: local_kind,
                        existing_dim: local_dim as usize,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Escape the characters SQLite gives meaning to inside a URI path.
fn escape_uri_path(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '?' => escaped.push_str("%3f"),
            '#' => escaped.push_str("%23"),
            _ => escaped.push(c),
        }
    }
    escaped
}
