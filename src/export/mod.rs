use anyhow::Result;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::db::{Database, Image, ImageFilter};

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    /// Guess the format from an output file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_string_lossy().to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }
}

/// Flat catalog row for export
#[derive(Debug, Serialize)]
pub struct ExportedImage {
    pub id: i64,
    pub source_url: String,
    pub storage_path: Option<String>,
    pub external_photo_id: Option<String>,
    pub collection_id: Option<String>,
    pub collection_title: Option<String>,
    pub group_name: String,
    pub group_year: i32,
    pub group_kind: String,
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub byte_size: Option<i64>,
    pub downloaded_at: Option<String>,
    pub created_at: String,
}

impl From<Image> for ExportedImage {
    fn from(image: Image) -> Self {
        Self {
            id: image.id,
            source_url: image.source_url,
            storage_path: image.storage_path,
            external_photo_id: image.external_photo_id,
            collection_id: image.collection_id,
            collection_title: image.collection_title,
            group_name: image.group_name,
            group_year: image.group_year,
            group_kind: image.group_kind,
            format: image.format,
            width: image.width,
            height: image.height,
            byte_size: image.byte_size,
            downloaded_at: image.downloaded_at.map(|t| t.to_rfc3339()),
            created_at: image.created_at.to_rfc3339(),
        }
    }
}

/// Export catalogued images matching `filter` to a file
pub fn export_images(
    db: &Database,
    filter: &ImageFilter,
    output_path: &Path,
    format: ExportFormat,
) -> Result<usize> {
    let mut images: Vec<ExportedImage> = db
        .list_images(filter)?
        .into_iter()
        .map(ExportedImage::from)
        .collect();
    images.sort_by_key(|i| i.id);
    let count = images.len();

    match format {
        ExportFormat::Json => export_json(&images, output_path)?,
        ExportFormat::Csv => export_csv(&images, output_path)?,
    }

    tracing::info!(count, path = ?output_path, format = format.extension(), "Exported catalog");
    Ok(count)
}

fn export_json(images: &[ExportedImage], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(images)?;
    let mut file = File::create(output_path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

fn export_csv(images: &[ExportedImage], output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;

    // Header comes from the struct field names
    for image in images {
        wtr.serialize(image)?;
    }

    wtr.flush()?;
    Ok(())
}
