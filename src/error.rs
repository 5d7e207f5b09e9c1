//! Typed failures that callers are expected to tell apart.
//!
//! Store operations return `anyhow::Result`; the conditions below are raised as
//! `StoreError` inside the `anyhow::Error` so callers can `downcast_ref` them.
//! All of them indicate a wiring or programming bug and are never recovered
//! from inside the crate.

use thiserror::Error;

use crate::db::ModelKind;

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    /// Vectors were written or queried under a model name that was never declared.
    #[error("model '{0}' is not declared in this store")]
    UnknownModel(String),

    /// A vector's length differs from the dimension declared for its model.
    #[error("model '{model}' expects {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },

    /// A model was re-declared with a different dimension or kind.
    #[error("model '{model}' is already declared as {existing_kind} with dim {existing_dim}")]
    ModelConflict {
        model: String,
        existing_kind: ModelKind,
        existing_dim: usize,
    },

    /// A model declared for one vector space was used for the other.
    #[error("model '{model}' is a {actual} model, expected {expected}")]
    WrongModelKind {
        model: String,
        expected: ModelKind,
        actual: ModelKind,
    },

    /// `image_ids` and `vectors` passed to a batched insert differ in length.
    #[error("{ids} image ids but {vectors} vectors")]
    LengthMismatch { ids: usize, vectors: usize },
}
