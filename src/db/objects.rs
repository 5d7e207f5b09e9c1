//! Labelled object detections and their processed-images ledger.
//!
//! Object models carry no vectors, so they are not declared in
//! `vector_models`; the model name only scopes rows.

use anyhow::Result;
use rusqlite::{params, Row, Statement};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::images::{ImageDecoder, IMAGE_COLUMNS};
use super::{BoundingBox, Database, Image};

/// One labelled box found by an object detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDetection {
    pub detection_id: String,
    pub image_id: i64,
    pub model_name: String,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObjectStats {
    pub total_indexable: i64,
    pub processed: i64,
    pub objects: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelCount {
    pub label: String,
    /// Distinct images with at least one box of this label
    pub images: i64,
    pub detections: i64,
}

struct ObjectDecoder {
    detection_id: usize,
    image_id: usize,
    model_name: usize,
    label: usize,
    confidence: usize,
    bbox: [usize; 4],
}

impl ObjectDecoder {
    fn for_statement(stmt: &Statement<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            detection_id: stmt.column_index("detection_id")?,
            image_id: stmt.column_index("image_id")?,
            model_name: stmt.column_index("model_name")?,
            label: stmt.column_index("label")?,
            confidence: stmt.column_index("confidence")?,
            bbox: [
                stmt.column_index("bbox_x1")?,
                stmt.column_index("bbox_y1")?,
                stmt.column_index("bbox_x2")?,
                stmt.column_index("bbox_y2")?,
            ],
        })
    }

    fn decode(&self, row: &Row<'_>) -> rusqlite::Result<ObjectDetection> {
        Ok(ObjectDetection {
            detection_id: row.get(self.detection_id)?,
            image_id: row.get(self.image_id)?,
            model_name: row.get(self.model_name)?,
            label: row.get(self.label)?,
            confidence: row.get(self.confidence)?,
            bbox: BoundingBox {
                x1: row.get(self.bbox[0])?,
                y1: row.get(self.bbox[1])?,
                x2: row.get(self.bbox[2])?,
                y2: row.get(self.bbox[3])?,
            },
        })
    }
}

impl Database {
    /// Store detections. Rows whose `detection_id` already exists are left alone.
    pub fn insert_object_detections(&self, detections: &[ObjectDetection]) -> Result<usize> {
        self.with_savepoint("insert_object_detections", || {
            let mut stmt = self.conn.prepare_cached(
                r#"
                INSERT INTO object_detections (
                    detection_id, image_id, model_name, label, confidence,
                    bbox_x1, bbox_y1, bbox_x2, bbox_y2
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(detection_id) DO NOTHING
                "#,
            )?;

            let mut inserted = 0;
            for d in detections {
                inserted += stmt.execute(params![
                    d.detection_id,
                    d.image_id,
                    d.model_name,
                    d.label,
                    d.confidence,
                    d.bbox.x1,
                    d.bbox.y1,
                    d.bbox.x2,
                    d.bbox.y2,
                ])?;
            }
            Ok(inserted)
        })
    }

    /// Boxes found on an image by one model, most confident first.
    pub fn objects_for_image(&self, image_id: i64, model_name: &str) -> Result<Vec<ObjectDetection>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT detection_id, image_id, model_name, label, confidence,
                   bbox_x1, bbox_y1, bbox_x2, bbox_y2
            FROM object_detections
            WHERE image_id = ? AND model_name = ?
            ORDER BY confidence DESC, detection_id
            "#,
        )?;
        let decoder = ObjectDecoder::for_statement(&stmt)?;
        let objects = stmt
            .query_map(params![image_id, model_name], |row| decoder.decode(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(objects)
    }

    /// Record that an image was scanned for objects, even if none were found.
    pub fn mark_objects_processed(&self, image_id: i64, model_name: &str, object_count: usize) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO object_processed_images (image_id, model_name, object_count, processed_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(image_id, model_name) DO UPDATE SET
                object_count = excluded.object_count,
                processed_at = CURRENT_TIMESTAMP
            "#,
            params![image_id, model_name, object_count as i64],
        )?;
        Ok(())
    }

    pub fn object_processed_image_ids(&self, model_name: &str) -> Result<HashSet<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT image_id FROM object_processed_images WHERE model_name = ?")?;
        let ids = stmt
            .query_map([model_name], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<i64>>>()?;
        Ok(ids)
    }

    pub fn pending_object_images(&self, model_name: &str) -> Result<Vec<(i64, String)>> {
        self.pending_in_ledger("object_processed_images", model_name)
    }

    pub fn object_stats(&self, model_name: &str) -> Result<ObjectStats> {
        let total_indexable = self.count_indexable()?;
        let processed: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM object_processed_images WHERE model_name = ?",
            [model_name],
            |row| row.get(0),
        )?;
        let objects: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM object_detections WHERE model_name = ?",
            [model_name],
            |row| row.get(0),
        )?;

        Ok(ObjectStats {
            total_indexable,
            processed,
            objects,
        })
    }

    /// Per-label counts for one model, most frequent first.
    pub fn object_labels(&self, model_name: &str, min_confidence: f32) -> Result<Vec<LabelCount>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT label, COUNT(DISTINCT image_id), COUNT(*)
            FROM object_detections
            WHERE model_name = ? AND confidence >= ?
            GROUP BY label
            ORDER BY COUNT(DISTINCT image_id) DESC, label
            "#,
        )?;
        let labels = stmt
            .query_map(params![model_name, min_confidence], |row| {
                Ok(LabelCount {
                    label: row.get(0)?,
                    images: row.get(1)?,
                    detections: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(labels)
    }

    /// Images holding at least one `label` box at `min_confidence`, by ascending id.
    pub fn images_with_label(
        &self,
        model_name: &str,
        label: &str,
        min_confidence: f32,
    ) -> Result<Vec<Image>> {
        let sql = format!(
            "SELECT {} FROM images i
             WHERE i.id IN (
                 SELECT image_id FROM object_detections
                 WHERE model_name = ? AND label = ? AND confidence >= ?
             )
             ORDER BY i.id",
            IMAGE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let decoder = ImageDecoder::for_statement(&stmt)?;
        let images = stmt
            .query_map(params![model_name, label, min_confidence], |row| decoder.decode(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }

    /// Delete every detection and ledger row for one object model.
    pub fn reset_object_model(&self, model_name: &str) -> Result<(usize, usize)> {
        self.with_savepoint("reset_object_model", || {
            let objects = self
                .conn
                .execute("DELETE FROM object_detections WHERE model_name = ?", [model_name])?;
            let ledger = self
                .conn
                .execute("DELETE FROM object_processed_images WHERE model_name = ?", [model_name])?;
            tracing::info!(model = %model_name, objects, ledger, "Reset object model");
            Ok((objects, ledger))
        })
    }
}
