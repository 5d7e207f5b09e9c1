mod schema;
pub mod embeddings;
pub mod faces;
pub mod images;
pub mod maintenance;
pub mod objects;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub use schema::SCHEMA;
pub use embeddings::{cosine_similarity, EmbeddingStats, ImageHit};
pub use faces::{BoundingBox, FaceDetection, FaceHit, FaceStats, Gender};
pub use images::{Image, ImageFilter, NewImage, DEFAULT_GROUP_KIND};
pub use maintenance::{CopyPlan, CopyReport, GroupRename, GroupSummary, RenameOutcome};
pub use objects::{LabelCount, ObjectDetection, ObjectStats};

use crate::error::StoreError;

/// Which vector space a declared model lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Whole-image embeddings (SigLIP, CLIP, ...)
    Image,
    /// Face-recognition embeddings attached to detections
    Face,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Image => "image",
            ModelKind::Face => "face",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(ModelKind::Image),
            "face" => Ok(ModelKind::Face),
            other => Err(anyhow::anyhow!("unknown model kind '{}'", other)),
        }
    }
}

/// A declared model namespace and its fixed vector length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub kind: ModelKind,
    pub dim: usize,
}

/// Handle on one physical store file.
///
/// Every operation is a blocking call on the underlying SQLite connection.
/// A store is meant to have one writer at a time; any number of separate
/// handles may read concurrently while nothing is writing.
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self { conn })
    }

    /// Create tables and indexes if missing.
    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ========================================================================
    // Model namespaces
    // ========================================================================

    /// Declare a model namespace with its vector dimension.
    ///
    /// Re-declaring with the same kind and dimension is a no-op; anything else
    /// is a configuration error.
    pub fn declare_model(&self, name: &str, kind: ModelKind, dim: usize) -> Result<()> {
        if let Some(existing) = self.model_spec(name)? {
            if existing.kind != kind || existing.dim != dim {
                return Err(StoreError::ModelConflict {
                    model: name.to_string(),
                    existing_kind: existing.kind,
                    existing_dim: existing.dim,
                }
                .into());
            }
            return Ok(());
        }

        self.conn.execute(
            "INSERT INTO vector_models (model_name, kind, dim) VALUES (?, ?, ?)",
            params![name, kind.as_str(), dim as i64],
        )?;
        tracing::debug!(model = %name, %kind, dim, "Declared vector model");
        Ok(())
    }

    pub fn model_spec(&self, name: &str) -> Result<Option<ModelSpec>> {
        let row = self
            .conn
            .query_row(
                "SELECT model_name, kind, dim FROM vector_models WHERE model_name = ?",
                [name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((name, kind, dim)) => Ok(Some(ModelSpec {
                name,
                kind: kind.parse()?,
                dim: dim as usize,
            })),
            None => Ok(None),
        }
    }

    /// All declared models, ordered by name.
    pub fn models(&self) -> Result<Vec<ModelSpec>> {
        let mut stmt = self
            .conn
            .prepare("SELECT model_name, kind, dim FROM vector_models ORDER BY model_name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(name, kind, dim)| {
                Ok(ModelSpec {
                    name,
                    kind: kind.parse()?,
                    dim: dim as usize,
                })
            })
            .collect()
    }

    /// Look up a model and check it belongs to the expected vector space.
    pub(crate) fn require_model(&self, name: &str, kind: ModelKind) -> Result<ModelSpec> {
        let spec = self
            .model_spec(name)?
            .ok_or_else(|| StoreError::UnknownModel(name.to_string()))?;
        if spec.kind != kind {
            return Err(StoreError::WrongModelKind {
                model: name.to_string(),
                expected: kind,
                actual: spec.kind,
            }
            .into());
        }
        Ok(spec)
    }

    /// Images with a local file and no row in `ledger` for `model_name`,
    /// by ascending id.
    pub(crate) fn pending_in_ledger(&self, ledger: &str, model_name: &str) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            r#"
            SELECT i.id, i.storage_path
            FROM images i
            LEFT JOIN {} p ON p.image_id = i.id AND p.model_name = ?
            WHERE i.storage_path IS NOT NULL AND p.image_id IS NULL
            ORDER BY i.id
            "#,
            ledger
        ))?;

        let results = stmt
            .query_map([model_name], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(results)
    }

    // ========================================================================
    // Write grouping
    // ========================================================================

    /// Open a transaction that callers commit explicitly.
    ///
    /// Dropping the returned guard without committing rolls back everything
    /// written through this handle since it was opened.
    pub fn transaction(&self) -> Result<rusqlite::Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    /// Run `f` inside a savepoint. Works both standalone and nested inside an
    /// open transaction.
    pub(crate) fn with_savepoint<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        match f() {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {}", name))?;
                Ok(value)
            }
            Err(e) => {
                let _ = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}", name = name));
                Err(e)
            }
        }
    }
}

pub(crate) fn check_dimension(spec: &ModelSpec, actual: usize) -> Result<()> {
    if spec.dim != actual {
        return Err(StoreError::DimensionMismatch {
            model: spec.name.clone(),
            expected: spec.dim,
            actual,
        }
        .into());
    }
    Ok(())
}
