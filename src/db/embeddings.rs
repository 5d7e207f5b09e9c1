//! Embedding storage and similarity search functionality.

use anyhow::Result;
use rayon::prelude::*;
use rusqlite::{params, OptionalExtension, ToSql};
use serde::Serialize;

use super::{check_dimension, Database, Image, ModelKind};
use crate::error::StoreError;

/// A ranked whole-image search result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageHit {
    pub image: Image,
    pub score: f32,
}

/// Coverage of one image model over the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmbeddingStats {
    /// Images with a local file
    pub total_indexable: i64,
    pub embedded: i64,
}

impl EmbeddingStats {
    pub fn pending(&self) -> i64 {
        (self.total_indexable - self.embedded).max(0)
    }
}

impl Database {
    /// Store vectors for images under a model, positionally zipped.
    ///
    /// Existing `(image_id, model_name)` rows are left as they are. Returns the
    /// number of rows actually written.
    pub fn insert_vectors(
        &self,
        image_ids: &[i64],
        vectors: &[Vec<f32>],
        model_name: &str,
    ) -> Result<usize> {
        if image_ids.len() != vectors.len() {
            return Err(StoreError::LengthMismatch {
                ids: image_ids.len(),
                vectors: vectors.len(),
            }
            .into());
        }

        let spec = self.require_model(model_name, ModelKind::Image)?;
        for vector in vectors {
            check_dimension(&spec, vector.len())?;
        }

        self.with_savepoint("insert_vectors", || {
            let mut stmt = self.conn.prepare_cached(
                r#"
                INSERT INTO image_embeddings (image_id, model_name, embedding)
                VALUES (?, ?, ?)
                ON CONFLICT(image_id, model_name) DO NOTHING
                "#,
            )?;

            let mut inserted = 0;
            for (image_id, vector) in image_ids.iter().zip(vectors) {
                inserted += stmt.execute(params![image_id, model_name, embedding_to_bytes(vector)])?;
            }
            Ok(inserted)
        })
    }

    /// Images with a local file and no vector yet for `model_name`, by ascending id.
    pub fn pending_images(&self, model_name: &str) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT i.id, i.storage_path
            FROM images i
            LEFT JOIN image_embeddings e ON e.image_id = i.id AND e.model_name = ?
            WHERE i.storage_path IS NOT NULL AND e.image_id IS NULL
            ORDER BY i.id
            "#,
        )?;

        let results = stmt
            .query_map([model_name], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(results)
    }

    /// Every image with a local file, by ascending id.
    pub fn all_images(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, storage_path FROM images WHERE storage_path IS NOT NULL ORDER BY id",
        )?;

        let results = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(results)
    }

    pub fn embedding_stats(&self, model_name: &str) -> Result<EmbeddingStats> {
        let total_indexable = self.count_indexable()?;
        let embedded: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM image_embeddings WHERE model_name = ?",
            [model_name],
            |row| row.get(0),
        )?;

        Ok(EmbeddingStats {
            total_indexable,
            embedded,
        })
    }

    /// Stored vector for an image, if it has been embedded with `model_name`.
    pub fn vector_for(&self, image_id: i64, model_name: &str) -> Result<Option<Vec<f32>>> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT embedding FROM image_embeddings WHERE image_id = ? AND model_name = ?",
                params![image_id, model_name],
                |row| row.get(0),
            )
            .optional()?;

        Ok(bytes.map(|b| bytes_to_embedding(&b)))
    }

    /// Exact nearest neighbours of `query` among one model's image vectors.
    ///
    /// Ranked by cosine similarity descending, ties by ascending image id, then
    /// paged with `offset`/`limit`. A non-empty `groups` restricts candidates to
    /// images whose `group_name` is in it; an empty one does not filter.
    pub fn nearest_neighbors(
        &self,
        query: &[f32],
        model_name: &str,
        limit: usize,
        offset: usize,
        groups: Option<&[String]>,
    ) -> Result<Vec<ImageHit>> {
        let spec = self.require_model(model_name, ModelKind::Image)?;
        check_dimension(&spec, query.len())?;

        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT e.image_id, e.embedding FROM image_embeddings e
             JOIN images i ON i.id = e.image_id
             WHERE e.model_name = ?",
        );
        let mut values: Vec<&dyn ToSql> = vec![&model_name];
        if let Some(groups) = groups.filter(|g| !g.is_empty()) {
            sql.push_str(&format!(" AND i.group_name IN ({})", placeholders(groups.len())));
            values.extend(groups.iter().map(|g| g as &dyn ToSql));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let candidates = stmt
            .query_map(values.as_slice(), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut scored = score_candidates(query, candidates);
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut hits = Vec::new();
        for (image_id, score) in scored.into_iter().skip(offset).take(limit) {
            if let Some(image) = self.get_image(image_id)? {
                hits.push(ImageHit { image, score });
            }
        }

        Ok(hits)
    }
}

/// Score every candidate against the query in parallel.
pub(crate) fn score_candidates<K: Send>(query: &[f32], candidates: Vec<(K, Vec<u8>)>) -> Vec<(K, f32)> {
    candidates
        .into_par_iter()
        .map(|(key, bytes)| {
            let score = cosine_similarity(query, &bytes_to_embedding(&bytes));
            (key, score)
        })
        .collect()
}

/// `?, ?, ?` for an IN clause of `n` values
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Convert f32 slice to bytes for storage
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
