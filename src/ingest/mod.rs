//! Registering local album directories in the catalog.
//!
//! Files are expected to already live under the data directory; import only
//! records them. Each album directory becomes one collection whose group label
//! is parsed from the directory name.

pub mod discovery;
pub mod labels;
pub mod probe;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use crate::db::{Database, NewImage, DEFAULT_GROUP_KIND};

pub use discovery::discover_images;
pub use labels::{parse_group_label, sanitize_dirname};
pub use probe::{probe_image, ImageProbe};

#[derive(Debug, Clone)]
pub enum ImportProgress {
    Started { total_files: usize },
    Importing { current: usize, total: usize, path: PathBuf },
    Completed(ImportReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub group_name: String,
    pub group_year: i32,
    pub discovered: usize,
    pub registered: usize,
    /// Already catalogued from an earlier import
    pub existing: usize,
    /// Not readable as an image
    pub unreadable: usize,
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub extensions: Vec<String>,
    /// Overrides the group parsed from the album directory name
    pub group: Option<(String, i32)>,
    pub group_kind: String,
    /// Source URLs become `<prefix>/<album>/<file>`; `file://` URLs otherwise
    pub url_prefix: Option<String>,
}

impl ImportOptions {
    pub fn new(extensions: Vec<String>) -> Self {
        Self {
            extensions,
            group: None,
            group_kind: DEFAULT_GROUP_KIND.to_string(),
            url_prefix: None,
        }
    }
}

/// Register every image file under `album_dir`, which must sit inside `data_dir`.
///
/// Replays are no-ops: files already known by their external id in this
/// collection are skipped before probing, and anything else that collides
/// keeps its first registration.
pub fn import_directory(
    db: &Database,
    data_dir: &Path,
    album_dir: &Path,
    options: &ImportOptions,
    progress: Option<mpsc::Sender<ImportProgress>>,
) -> Result<ImportReport> {
    let data_dir = data_dir
        .canonicalize()
        .with_context(|| format!("Data directory {:?} not found", data_dir))?;
    let album_dir = album_dir
        .canonicalize()
        .with_context(|| format!("Album directory {:?} not found", album_dir))?;

    if !album_dir.starts_with(&data_dir) || album_dir == data_dir {
        bail!(
            "Album directory {:?} must be a subdirectory of the data directory {:?}",
            album_dir,
            data_dir
        );
    }

    let title = album_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let (group_name, group_year) = options
        .group
        .clone()
        .unwrap_or_else(|| parse_group_label(&title));
    let collection_id = sanitize_dirname(&title);

    let files = discover_images(&album_dir, &options.extensions)?;
    let total = files.len();
    if let Some(ref tx) = progress {
        let _ = tx.send(ImportProgress::Started { total_files: total });
    }
    tracing::info!(album = %title, group = %group_name, year = group_year, total, "Importing album");

    let known = db.existing_external_ids(Some(&collection_id))?;
    let mut report = ImportReport {
        group_name: group_name.clone(),
        group_year,
        discovered: total,
        ..Default::default()
    };
    let mut batch = Vec::new();

    for (index, path) in files.iter().enumerate() {
        if let Some(ref tx) = progress {
            let _ = tx.send(ImportProgress::Importing {
                current: index + 1,
                total,
                path: path.clone(),
            });
        }

        let external_id = path_key(path.strip_prefix(&album_dir)?);
        if known.contains(&external_id) {
            report.existing += 1;
            continue;
        }

        let probe = match probe_image(path) {
            Ok(probe) => probe,
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Skipping unreadable image");
                report.unreadable += 1;
                continue;
            }
        };

        let storage_path = path_key(path.strip_prefix(&data_dir)?);
        let source_url = match options.url_prefix {
            Some(ref prefix) => format!("{}/{}/{}", prefix.trim_end_matches('/'), collection_id, external_id),
            None => format!("file://{}", path.display()),
        };

        let mut image = NewImage::new(source_url, group_name.clone(), group_year)
            .with_storage_path(storage_path)
            .with_collection(collection_id.clone(), title.clone())
            .with_external_id(external_id);
        image.group_kind = options.group_kind.clone();
        image.format = probe.format;
        image.width = Some(probe.width);
        image.height = Some(probe.height);
        image.byte_size = Some(probe.byte_size);
        image.downloaded_at = Some(Utc::now());
        batch.push(image);
    }

    report.registered = db.register_images(&batch)?;
    report.existing += batch.len() - report.registered;

    tracing::info!(
        album = %title,
        registered = report.registered,
        existing = report.existing,
        unreadable = report.unreadable,
        "Album import complete"
    );
    if let Some(ref tx) = progress {
        let _ = tx.send(ImportProgress::Completed(report.clone()));
    }

    Ok(report)
}

/// Forward-slash form of a relative path, stable across platforms.
fn path_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}
