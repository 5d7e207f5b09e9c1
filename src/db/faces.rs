//! Face detections, the processed-images ledger and face similarity search.

use anyhow::Result;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, Statement, ToSql};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use super::embeddings::{bytes_to_embedding, embedding_to_bytes, placeholders, score_candidates};
use super::images::{ImageDecoder, IMAGE_COLUMNS};
use super::{check_dimension, Database, Image, ModelKind};

/// Face bounding box in the original image's pixel space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// Rescale to a rendition of a different size.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            x2: self.x2 * sx,
            y2: self.y2 * sy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

impl ToSql for Gender {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Gender {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            other => Err(FromSqlError::Other(format!("unknown gender '{}'", other).into())),
        }
    }
}

/// One detected face with its recognition embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub face_id: String,
    pub image_id: i64,
    pub model_name: String,
    pub bbox: BoundingBox,
    pub det_score: f32,
    pub landmark: Option<Vec<[f32; 2]>>,
    pub age: Option<u32>,
    pub gender: Option<Gender>,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub person_label: Option<String>,
    pub cluster_id: Option<i64>,
}

/// A ranked face search result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceHit {
    pub face: FaceDetection,
    pub image: Image,
    pub score: f32,
}

/// Coverage of one detector model over the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaceStats {
    pub total_indexable: i64,
    pub processed: i64,
    pub faces: i64,
}

/// Ids per `IN (...)` lookup
const ID_CHUNK: usize = 500;

const FACE_COLUMNS: &str = "f.face_id, f.image_id, f.model_name, f.bbox_x1, f.bbox_y1, f.bbox_x2, \
     f.bbox_y2, f.det_score, f.landmark, f.age, f.gender, f.embedding, f.person_label, f.cluster_id";

/// Named-column decoder for `face_detections` rows
struct FaceDecoder {
    face_id: usize,
    image_id: usize,
    model_name: usize,
    bbox: [usize; 4],
    det_score: usize,
    landmark: usize,
    age: usize,
    gender: usize,
    embedding: usize,
    person_label: usize,
    cluster_id: usize,
}

impl FaceDecoder {
    fn for_statement(stmt: &Statement<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            face_id: stmt.column_index("face_id")?,
            image_id: stmt.column_index("image_id")?,
            model_name: stmt.column_index("model_name")?,
            bbox: [
                stmt.column_index("bbox_x1")?,
                stmt.column_index("bbox_y1")?,
                stmt.column_index("bbox_x2")?,
                stmt.column_index("bbox_y2")?,
            ],
            det_score: stmt.column_index("det_score")?,
            landmark: stmt.column_index("landmark")?,
            age: stmt.column_index("age")?,
            gender: stmt.column_index("gender")?,
            embedding: stmt.column_index("embedding")?,
            person_label: stmt.column_index("person_label")?,
            cluster_id: stmt.column_index("cluster_id")?,
        })
    }

    fn decode(&self, row: &Row<'_>) -> rusqlite::Result<FaceDetection> {
        let landmark: Option<String> = row.get(self.landmark)?;
        let landmark = landmark
            .map(|json| serde_json::from_str::<Vec<[f32; 2]>>(&json))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(self.landmark, Type::Text, Box::new(e))
            })?;
        let embedding: Vec<u8> = row.get(self.embedding)?;

        Ok(FaceDetection {
            face_id: row.get(self.face_id)?,
            image_id: row.get(self.image_id)?,
            model_name: row.get(self.model_name)?,
            bbox: BoundingBox {
                x1: row.get(self.bbox[0])?,
                y1: row.get(self.bbox[1])?,
                x2: row.get(self.bbox[2])?,
                y2: row.get(self.bbox[3])?,
            },
            det_score: row.get(self.det_score)?,
            landmark,
            age: row.get(self.age)?,
            gender: row.get(self.gender)?,
            embedding: bytes_to_embedding(&embedding),
            person_label: row.get(self.person_label)?,
            cluster_id: row.get(self.cluster_id)?,
        })
    }
}

impl Database {
    // ========================================================================
    // Detections
    // ========================================================================

    /// Store detections. Rows whose `face_id` already exists are left alone.
    pub fn insert_detections(&self, detections: &[FaceDetection]) -> Result<usize> {
        let models: BTreeSet<&str> = detections.iter().map(|d| d.model_name.as_str()).collect();
        for model in models {
            let spec = self.require_model(model, ModelKind::Face)?;
            for detection in detections.iter().filter(|d| d.model_name == model) {
                check_dimension(&spec, detection.embedding.len())?;
            }
        }

        self.with_savepoint("insert_detections", || {
            let mut stmt = self.conn.prepare_cached(
                r#"
                INSERT INTO face_detections (
                    face_id, image_id, model_name, bbox_x1, bbox_y1, bbox_x2, bbox_y2,
                    det_score, landmark, age, gender, embedding, person_label, cluster_id
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(face_id) DO NOTHING
                "#,
            )?;

            let mut inserted = 0;
            for d in detections {
                let landmark = d.landmark.as_ref().map(serde_json::to_string).transpose()?;
                inserted += stmt.execute(params![
                    d.face_id,
                    d.image_id,
                    d.model_name,
                    d.bbox.x1,
                    d.bbox.y1,
                    d.bbox.x2,
                    d.bbox.y2,
                    d.det_score,
                    landmark,
                    d.age,
                    d.gender,
                    embedding_to_bytes(&d.embedding),
                    d.person_label,
                    d.cluster_id,
                ])?;
            }
            Ok(inserted)
        })
    }

    /// Faces found on an image by one detector, most confident first.
    pub fn faces_for_image(&self, image_id: i64, model_name: &str) -> Result<Vec<FaceDetection>> {
        let sql = format!(
            "SELECT {} FROM face_detections f
             WHERE f.image_id = ? AND f.model_name = ?
             ORDER BY f.det_score DESC, f.face_id",
            FACE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let decoder = FaceDecoder::for_statement(&stmt)?;
        let faces = stmt
            .query_map(params![image_id, model_name], |row| decoder.decode(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(faces)
    }

    pub fn face_by_id(&self, face_id: &str) -> Result<Option<FaceDetection>> {
        let sql = format!("SELECT {} FROM face_detections f WHERE f.face_id = ?", FACE_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let decoder = FaceDecoder::for_statement(&stmt)?;
        let face = stmt
            .query_row([face_id], |row| decoder.decode(row))
            .optional()?;

        Ok(face)
    }

    // ========================================================================
    // Processed ledger
    // ========================================================================

    /// Record that an image was scanned by a detector, even if it had no faces.
    ///
    /// Re-marking overwrites the previous count and timestamp.
    pub fn mark_processed(&self, image_id: i64, model_name: &str, face_count: usize) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO face_processed_images (image_id, model_name, face_count, processed_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(image_id, model_name) DO UPDATE SET
                face_count = excluded.face_count,
                processed_at = CURRENT_TIMESTAMP
            "#,
            params![image_id, model_name, face_count as i64],
        )?;
        Ok(())
    }

    pub fn processed_image_ids(&self, model_name: &str) -> Result<HashSet<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT image_id FROM face_processed_images WHERE model_name = ?")?;
        let ids = stmt
            .query_map([model_name], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<i64>>>()?;
        Ok(ids)
    }

    /// Images with a local file that `model_name` has never scanned, by ascending id.
    pub fn pending_face_images(&self, model_name: &str) -> Result<Vec<(i64, String)>> {
        self.pending_in_ledger("face_processed_images", model_name)
    }

    pub fn face_stats(&self, model_name: &str) -> Result<FaceStats> {
        let total_indexable = self.count_indexable()?;
        let processed: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM face_processed_images WHERE model_name = ?",
            [model_name],
            |row| row.get(0),
        )?;
        let faces: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM face_detections WHERE model_name = ?",
            [model_name],
            |row| row.get(0),
        )?;

        Ok(FaceStats {
            total_indexable,
            processed,
            faces,
        })
    }

    /// Delete every detection and ledger row for one detector model.
    pub fn reset_face_model(&self, model_name: &str) -> Result<(usize, usize)> {
        self.with_savepoint("reset_face_model", || {
            let faces = self
                .conn
                .execute("DELETE FROM face_detections WHERE model_name = ?", [model_name])?;
            let ledger = self
                .conn
                .execute("DELETE FROM face_processed_images WHERE model_name = ?", [model_name])?;
            tracing::info!(model = %model_name, faces, ledger, "Reset face model");
            Ok((faces, ledger))
        })
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Raw nearest faces to `query`, one entry per face.
    ///
    /// Ranked by cosine similarity descending, then image id, then face id.
    /// Several entries may share an image; collapsing them is up to the caller.
    pub fn nearest_faces(
        &self,
        query: &[f32],
        model_name: &str,
        limit: usize,
        groups: Option<&[String]>,
    ) -> Result<Vec<FaceHit>> {
        let spec = self.require_model(model_name, ModelKind::Face)?;
        check_dimension(&spec, query.len())?;

        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT f.face_id, f.image_id, f.embedding FROM face_detections f
             JOIN images i ON i.id = f.image_id
             WHERE f.model_name = ?",
        );
        let mut values: Vec<&dyn ToSql> = vec![&model_name];
        if let Some(groups) = groups.filter(|g| !g.is_empty()) {
            sql.push_str(&format!(" AND i.group_name IN ({})", placeholders(groups.len())));
            values.extend(groups.iter().map(|g| g as &dyn ToSql));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(values.as_slice(), |row| {
                let key: (i64, String) = (row.get(1)?, row.get(0)?);
                Ok((key, row.get::<_, Vec<u8>>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut scored = score_candidates(query, candidates);
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let ranked: Vec<((i64, String), f32)> = scored.into_iter().take(limit).collect();
        let face_ids: Vec<&str> = ranked.iter().map(|((_, id), _)| id.as_str()).collect();
        let mut rows = self.face_rows(&face_ids)?;

        let hits = ranked
            .into_iter()
            .filter_map(|((_, face_id), score)| {
                rows.remove(&face_id)
                    .map(|(face, image)| FaceHit { face, image, score })
            })
            .collect();

        Ok(hits)
    }

    /// Decode faces together with their images, keyed by face id.
    fn face_rows(&self, face_ids: &[&str]) -> Result<HashMap<String, (FaceDetection, Image)>> {
        let mut rows = HashMap::with_capacity(face_ids.len());

        for chunk in face_ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT {}, {} FROM face_detections f
                 JOIN images i ON i.id = f.image_id
                 WHERE f.face_id IN ({})",
                FACE_COLUMNS,
                IMAGE_COLUMNS,
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let faces = FaceDecoder::for_statement(&stmt)?;
            let images = ImageDecoder::for_statement(&stmt)?;
            let decoded = stmt
                .query_map(params_from_iter(chunk.iter()), |row| {
                    Ok((faces.decode(row)?, images.decode(row)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for (face, image) in decoded {
                rows.insert(face.face_id.clone(), (face, image));
            }
        }

        Ok(rows)
    }
}
