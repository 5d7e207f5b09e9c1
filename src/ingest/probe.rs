use anyhow::{Context, Result};
use std::path::Path;

/// Header-level facts about an image file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageProbe {
    /// Canonical extension of the detected format, e.g. "jpg"
    pub format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub byte_size: i64,
}

/// Read format and dimensions without decoding pixel data.
pub fn probe_image(path: &Path) -> Result<ImageProbe> {
    let byte_size = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {:?}", path))?
        .len() as i64;

    let reader = image::ImageReader::open(path)
        .with_context(|| format!("Failed to open {:?}", path))?
        .with_guessed_format()?;
    let format = reader
        .format()
        .and_then(|f| f.extensions_str().first())
        .map(|ext| ext.to_string());
    let (width, height) = reader
        .into_dimensions()
        .with_context(|| format!("Failed to read dimensions of {:?}", path))?;

    Ok(ImageProbe {
        format,
        width,
        height,
        byte_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_probe_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.png");
        image::RgbImage::new(7, 3).save(&path).unwrap();

        let probe = probe_image(&path).unwrap();
        assert_eq!(probe.format.as_deref(), Some("png"));
        assert_eq!((probe.width, probe.height), (7, 3));
        assert!(probe.byte_size > 0);
    }

    #[test]
    fn test_probe_rejects_non_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fake.jpg");
        std::fs::write(&path, b"not an image").unwrap();

        assert!(probe_image(&path).is_err());
    }
}
