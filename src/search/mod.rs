//! Ranked similarity queries over stored image and face vectors.
//!
//! Every operation is read-only. Embedders are passed in by the caller for
//! the two operations that need a fresh vector; nothing here computes or
//! stores embeddings on its own.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use crate::config::SearchConfig;
use crate::db::{Database, FaceDetection, FaceHit, Image, ImageFilter, ImageHit, LabelCount, ObjectDetection};
use crate::embedding::ImageEmbedder;

/// One page of whole-image results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub hits: Vec<ImageHit>,
    /// Whether at least one more result exists past this page
    pub has_more: bool,
}

pub struct SearchEngine<'a> {
    db: &'a Database,
    config: SearchConfig,
}

impl<'a> SearchEngine<'a> {
    pub fn new(db: &'a Database, config: SearchConfig) -> Self {
        Self { db, config }
    }

    // ========================================================================
    // Whole-image search
    // ========================================================================

    /// Rank every image embedded with `model_name` by cosine similarity to `query`.
    ///
    /// One extra row is fetched past the page to set `has_more` exactly.
    pub fn search_by_vector(
        &self,
        query: &[f32],
        model_name: &str,
        limit: usize,
        offset: usize,
        groups: Option<&[String]>,
    ) -> Result<SearchPage> {
        let mut hits = self
            .db
            .nearest_neighbors(query, model_name, limit.saturating_add(1), offset, groups)?;
        let has_more = hits.len() > limit;
        hits.truncate(limit);

        Ok(SearchPage { hits, has_more })
    }

    /// Text-to-image search in the embedder's space.
    pub fn search_by_text(
        &self,
        embedder: &dyn ImageEmbedder,
        text: &str,
        limit: usize,
        offset: usize,
        groups: Option<&[String]>,
    ) -> Result<SearchPage> {
        let query = embedder.embed_text(text)?;
        tracing::debug!(model = %embedder.model_name(), %text, "Text search");
        self.search_by_vector(&query, embedder.model_name(), limit, offset, groups)
    }

    /// Search with an image that is not (necessarily) in the catalog.
    pub fn search_by_image_file(
        &self,
        embedder: &dyn ImageEmbedder,
        path: &Path,
        limit: usize,
        offset: usize,
        groups: Option<&[String]>,
    ) -> Result<SearchPage> {
        let query = embedder.embed_image(path)?;
        self.search_by_vector(&query, embedder.model_name(), limit, offset, groups)
    }

    /// Search with the stored vector of a catalogued image.
    ///
    /// `None` when the image has no vector for `model_name` yet.
    pub fn find_similar_to_image(
        &self,
        image_id: i64,
        model_name: &str,
        limit: usize,
        offset: usize,
        groups: Option<&[String]>,
    ) -> Result<Option<SearchPage>> {
        match self.db.vector_for(image_id, model_name)? {
            Some(query) => Ok(Some(self.search_by_vector(
                &query, model_name, limit, offset, groups,
            )?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Face search
    // ========================================================================

    /// Rank images by their best-matching face, one entry per image.
    ///
    /// The raw face pool starts at `limit * face_pool_multiplier` and doubles
    /// until `limit` distinct images are collected or the candidates run out,
    /// so the result is the exact top `limit` images by maximum face score.
    pub fn search_by_face_vector(
        &self,
        query: &[f32],
        model_name: &str,
        limit: usize,
        groups: Option<&[String]>,
    ) -> Result<Vec<FaceHit>> {
        if limit == 0 {
            // Still validates the model and query dimension
            self.db.nearest_faces(query, model_name, 0, groups)?;
            return Ok(Vec::new());
        }

        let mut pool = limit.saturating_mul(self.config.face_pool_multiplier.max(1));
        loop {
            let raw = self.db.nearest_faces(query, model_name, pool, groups)?;
            let exhausted = raw.len() < pool;
            let mut hits = collapse_by_image(raw);

            if hits.len() >= limit || exhausted {
                hits.truncate(limit);
                return Ok(hits);
            }

            tracing::debug!(pool, distinct = hits.len(), limit, "Widening face candidate pool");
            pool = pool.saturating_mul(2);
        }
    }

    /// "Same person": face search seeded with a stored face's embedding.
    ///
    /// `None` when `face_id` is unknown.
    pub fn find_same_person(
        &self,
        face_id: &str,
        limit: usize,
        groups: Option<&[String]>,
    ) -> Result<Option<Vec<FaceHit>>> {
        let Some(face) = self.db.face_by_id(face_id)? else {
            return Ok(None);
        };

        let hits = self.search_by_face_vector(&face.embedding, &face.model_name, limit, groups)?;
        Ok(Some(hits))
    }

    pub fn faces_in_image(&self, image_id: i64, model_name: &str) -> Result<Vec<FaceDetection>> {
        self.db.faces_for_image(image_id, model_name)
    }

    // ========================================================================
    // Object labels
    // ========================================================================

    pub fn objects_in_image(&self, image_id: i64, model_name: &str) -> Result<Vec<ObjectDetection>> {
        self.db.objects_for_image(image_id, model_name)
    }

    pub fn object_labels(&self, model_name: &str, min_confidence: f32) -> Result<Vec<LabelCount>> {
        self.db.object_labels(model_name, min_confidence)
    }

    /// Images showing `label`, optionally restricted to groups (empty means all).
    pub fn images_with_label(
        &self,
        model_name: &str,
        label: &str,
        min_confidence: f32,
        groups: Option<&[String]>,
    ) -> Result<Vec<Image>> {
        let mut images = self.db.images_with_label(model_name, label, min_confidence)?;
        if let Some(groups) = groups.filter(|g| !g.is_empty()) {
            images.retain(|image| groups.contains(&image.group_name));
        }
        Ok(images)
    }

    // ========================================================================
    // Metadata browsing
    // ========================================================================

    pub fn list_images(&self, filter: &ImageFilter) -> Result<Vec<Image>> {
        self.db.list_images(filter)
    }

    pub fn group_names(&self) -> Result<Vec<String>> {
        self.db.group_names()
    }

    pub fn group_years(&self) -> Result<Vec<i32>> {
        self.db.group_years()
    }

    pub fn default_limit(&self) -> usize {
        self.config.default_limit
    }
}

/// Keep the best face per image, ranked by that face's score.
fn collapse_by_image(raw: Vec<FaceHit>) -> Vec<FaceHit> {
    let mut slots: HashMap<i64, usize> = HashMap::new();
    let mut hits: Vec<FaceHit> = Vec::new();

    for hit in raw {
        match slots.get(&hit.image.id) {
            Some(&slot) => {
                if hit.score > hits[slot].score {
                    hits[slot] = hit;
                }
            }
            None => {
                slots.insert(hit.image.id, hits.len());
                hits.push(hit);
            }
        }
    }

    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.image.id.cmp(&b.image.id))
    });
    hits
}
