//! Image catalog: registration, lookup and metadata browsing.

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Statement, ToSql};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::Database;

pub const DEFAULT_GROUP_KIND: &str = "conference";

/// Columns selected wherever a full `Image` is decoded, aliased on `i`.
pub(crate) const IMAGE_COLUMNS: &str = "i.id, i.source_url, i.storage_path, i.external_photo_id, \
     i.collection_id, i.collection_title, i.group_name, i.group_year, i.group_kind, \
     i.format, i.width, i.height, i.byte_size, i.downloaded_at, i.created_at";

/// A catalogued image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub source_url: String,
    /// Relative to the data directory
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
    pub downloaded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An image as handed over by a downloader, before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewImage {
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
    pub downloaded_at: Option<DateTime<Utc>>,
}

impl NewImage {
    pub fn new(source_url: impl Into<String>, group_name: impl Into<String>, group_year: i32) -> Self {
        Self {
            source_url: source_url.into(),
            storage_path: None,
            external_photo_id: None,
            collection_id: None,
            collection_title: None,
            group_name: group_name.into(),
            group_year,
            group_kind: DEFAULT_GROUP_KIND.to_string(),
            format: None,
            width: None,
            height: None,
            byte_size: None,
            downloaded_at: None,
        }
    }

    pub fn with_storage_path(mut self, path: impl Into<String>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_collection(mut self, id: impl Into<String>, title: impl Into<String>) -> Self {
        self.collection_id = Some(id.into());
        self.collection_title = Some(title.into());
        self
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_photo_id = Some(id.into());
        self
    }
}

/// Optional metadata filters for catalog browsing. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageFilter {
    pub group_name: Option<String>,
    pub group_year: Option<i32>,
    pub collection_id: Option<String>,
}

/// Maps named result columns onto `Image` fields.
///
/// Column positions are resolved once per prepared statement, so a query that
/// forgets a column fails at prepare time instead of decoding garbage.
pub(crate) struct ImageDecoder {
    id: usize,
    source_url: usize,
    storage_path: usize,
    external_photo_id: usize,
    collection_id: usize,
    collection_title: usize,
    group_name: usize,
    group_year: usize,
    group_kind: usize,
    format: usize,
    width: usize,
    height: usize,
    byte_size: usize,
    downloaded_at: usize,
    created_at: usize,
}

impl ImageDecoder {
    pub(crate) fn for_statement(stmt: &Statement<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: stmt.column_index("id")?,
            source_url: stmt.column_index("source_url")?,
            storage_path: stmt.column_index("storage_path")?,
            external_photo_id: stmt.column_index("external_photo_id")?,
            collection_id: stmt.column_index("collection_id")?,
            collection_title: stmt.column_index("collection_title")?,
            group_name: stmt.column_index("group_name")?,
            group_year: stmt.column_index("group_year")?,
            group_kind: stmt.column_index("group_kind")?,
            format: stmt.column_index("format")?,
            width: stmt.column_index("width")?,
            height: stmt.column_index("height")?,
            byte_size: stmt.column_index("byte_size")?,
            downloaded_at: stmt.column_index("downloaded_at")?,
            created_at: stmt.column_index("created_at")?,
        })
    }

    pub(crate) fn decode(&self, row: &Row<'_>) -> rusqlite::Result<Image> {
        let created_at: NaiveDateTime = row.get(self.created_at)?;
        Ok(Image {
            id: row.get(self.id)?,
            source_url: row.get(self.source_url)?,
            storage_path: row.get(self.storage_path)?,
            external_photo_id: row.get(self.external_photo_id)?,
            collection_id: row.get(self.collection_id)?,
            collection_title: row.get(self.collection_title)?,
            group_name: row.get(self.group_name)?,
            group_year: row.get(self.group_year)?,
            group_kind: row.get(self.group_kind)?,
            format: row.get(self.format)?,
            width: row.get(self.width)?,
            height: row.get(self.height)?,
            byte_size: row.get(self.byte_size)?,
            downloaded_at: row.get(self.downloaded_at)?,
            created_at: created_at.and_utc(),
        })
    }
}

impl Database {
    // ========================================================================
    // Registration
    // ========================================================================

    /// Register an image. Returns `true` if a new row was created.
    ///
    /// A conflicting `source_url` or `external_photo_id` leaves the existing
    /// row untouched: the first registration wins.
    pub fn register_image(&self, image: &NewImage) -> Result<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT INTO images (
                source_url, storage_path, external_photo_id, collection_id, collection_title,
                group_name, group_year, group_kind, format, width, height, byte_size, downloaded_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
            params![
                image.source_url,
                image.storage_path,
                image.external_photo_id,
                image.collection_id,
                image.collection_title,
                image.group_name,
                image.group_year,
                image.group_kind,
                image.format,
                image.width,
                image.height,
                image.byte_size,
                image.downloaded_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Register many images in one savepoint. Returns how many were new.
    pub fn register_images(&self, images: &[NewImage]) -> Result<usize> {
        self.with_savepoint("register_images", || {
            let mut inserted = 0;
            for image in images {
                if self.register_image(image)? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn lookup_by_source_url(&self, url: &str) -> Result<Option<Image>> {
        self.query_one_image("i.source_url = ?", &[&url])
    }

    pub fn get_image(&self, id: i64) -> Result<Option<Image>> {
        self.query_one_image("i.id = ?", &[&id])
    }

    fn query_one_image(&self, condition: &str, params: &[&dyn ToSql]) -> Result<Option<Image>> {
        let sql = format!("SELECT {} FROM images i WHERE {}", IMAGE_COLUMNS, condition);
        let mut stmt = self.conn.prepare(&sql)?;
        let decoder = ImageDecoder::for_statement(&stmt)?;
        let image = stmt
            .query_row(params, |row| decoder.decode(row))
            .optional()?;
        Ok(image)
    }

    /// List catalogued images, most recently catalogued first.
    pub fn list_images(&self, filter: &ImageFilter) -> Result<Vec<Image>> {
        let mut conditions = Vec::new();
        let mut values: Vec<&dyn ToSql> = Vec::new();

        if let Some(ref name) = filter.group_name {
            conditions.push("i.group_name = ?");
            values.push(name);
        }
        if let Some(ref year) = filter.group_year {
            conditions.push("i.group_year = ?");
            values.push(year);
        }
        if let Some(ref collection) = filter.collection_id {
            conditions.push("i.collection_id = ?");
            values.push(collection);
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT {} FROM images i {} ORDER BY i.created_at DESC, i.id DESC",
            IMAGE_COLUMNS, where_clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let decoder = ImageDecoder::for_statement(&stmt)?;
        let images = stmt
            .query_map(values.as_slice(), |row| decoder.decode(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(images)
    }

    /// External photo ids already in the catalog, optionally for one collection.
    pub fn existing_external_ids(&self, collection_id: Option<&str>) -> Result<HashSet<String>> {
        let ids = match collection_id {
            Some(collection) => {
                let mut stmt = self.conn.prepare(
                    "SELECT external_photo_id FROM images
                     WHERE external_photo_id IS NOT NULL AND collection_id = ?",
                )?;
                let ids = stmt
                    .query_map([collection], |row| row.get(0))?
                    .collect::<rusqlite::Result<HashSet<String>>>()?;
                ids
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT external_photo_id FROM images WHERE external_photo_id IS NOT NULL")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<HashSet<String>>>()?;
                ids
            }
        };
        Ok(ids)
    }

    /// Distinct group names, ascending.
    pub fn group_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT group_name FROM images ORDER BY group_name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Distinct group years, newest first.
    pub fn group_years(&self) -> Result<Vec<i32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT group_year FROM images ORDER BY group_year DESC")?;
        let years = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i32>>>()?;
        Ok(years)
    }

    /// Total number of catalogued images.
    pub fn count_images(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Images that have a local file to index.
    pub(crate) fn count_indexable(&self) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM images WHERE storage_path IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_register_first_write_wins() {
        let db = db();
        let first = NewImage::new("https://example.com/a.jpg", "PyCon JP 2024", 2024)
            .with_storage_path("pycon_jp_2024/a.jpg");
        let mut second = first.clone();
        second.group_name = "Renamed".to_string();
        second.storage_path = None;

        assert!(db.register_image(&first).unwrap());
        assert!(!db.register_image(&second).unwrap());

        let stored = db.lookup_by_source_url("https://example.com/a.jpg").unwrap().unwrap();
        assert_eq!(stored.group_name, "PyCon JP 2024");
        assert_eq!(stored.storage_path.as_deref(), Some("pycon_jp_2024/a.jpg"));
        assert_eq!(stored.group_kind, DEFAULT_GROUP_KIND);
        assert_eq!(db.count_images().unwrap(), 1);
    }

    #[test]
    fn test_external_id_conflict_is_ignored() {
        let db = db();
        let a = NewImage::new("https://example.com/a.jpg", "G", 2024).with_external_id("123");
        let b = NewImage::new("https://example.com/b.jpg", "G", 2024).with_external_id("123");
        assert!(db.register_image(&a).unwrap());
        assert!(!db.register_image(&b).unwrap());
        assert!(db.lookup_by_source_url("https://example.com/b.jpg").unwrap().is_none());
    }

    #[test]
    fn test_list_images_filters_and_orders() {
        let db = db();
        let images = vec![
            NewImage::new("u1", "PyCon JP 2023", 2023).with_collection("c1", "Day 1"),
            NewImage::new("u2", "PyCon JP 2024", 2024).with_collection("c2", "Day 1"),
            NewImage::new("u3", "PyCon JP 2024", 2024).with_collection("c3", "Day 2"),
        ];
        assert_eq!(db.register_images(&images).unwrap(), 3);

        let all = db.list_images(&ImageFilter::default()).unwrap();
        let urls: Vec<_> = all.iter().map(|i| i.source_url.as_str()).collect();
        assert_eq!(urls, vec!["u3", "u2", "u1"]);

        let filtered = db
            .list_images(&ImageFilter {
                group_name: Some("PyCon JP 2024".to_string()),
                collection_id: Some("c3".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].source_url, "u3");

        let by_year = db
            .list_images(&ImageFilter {
                group_year: Some(2023),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_year.len(), 1);
    }

    #[test]
    fn test_existing_external_ids_by_collection() {
        let db = db();
        db.register_images(&[
            NewImage::new("u1", "G", 2024).with_collection("c1", "A").with_external_id("1"),
            NewImage::new("u2", "G", 2024).with_collection("c2", "B").with_external_id("2"),
            NewImage::new("u3", "G", 2024).with_collection("c1", "A"),
        ])
        .unwrap();

        let c1 = db.existing_external_ids(Some("c1")).unwrap();
        assert_eq!(c1, HashSet::from(["1".to_string()]));
        assert_eq!(db.existing_external_ids(None).unwrap().len(), 2);
    }

    #[test]
    fn test_group_names_and_years() {
        let db = db();
        db.register_images(&[
            NewImage::new("u1", "PyCon JP 2024", 2024),
            NewImage::new("u2", "PyCon APAC 2023", 2023),
            NewImage::new("u3", "PyCon JP 2024", 2024),
        ])
        .unwrap();

        assert_eq!(
            db.group_names().unwrap(),
            vec!["PyCon APAC 2023".to_string(), "PyCon JP 2024".to_string()]
        );
        assert_eq!(db.group_years().unwrap(), vec![2024, 2023]);
    }
}
