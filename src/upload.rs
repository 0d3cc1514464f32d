use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use image::imageops::FilterType;
use image::{ImageFormat, ImageReader};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::UploadSettings;

/// Suffix appended to a stored image while its resized copy is being written.
const TEMP_SUFFIX: &str = ".temp";

/// Reasons an upload is refused before anything reaches the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRejection {
    MissingFile,
    InvalidType,
    TooLarge,
}

impl fmt::Display for UploadRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadRejection::MissingFile => write!(f, "No file uploaded."),
            UploadRejection::InvalidType => write!(f, "Invalid file type."),
            UploadRejection::TooLarge => write!(f, "File too large."),
        }
    }
}

impl std::error::Error for UploadRejection {}

/// A stored image, as reported back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUpload {
    pub path: String,
    pub mime_type: String,
}

/// Image bytes ready to be attached to a model request.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Owns the upload directory and the limits applied to files placed in it.
#[derive(Debug, Clone)]
pub struct UploadStore {
    settings: UploadSettings,
}

impl UploadStore {
    pub fn new(settings: UploadSettings) -> Self {
        Self { settings }
    }

    pub fn dir(&self) -> &Path {
        &self.settings.dir
    }

    pub fn max_bytes(&self) -> usize {
        self.settings.max_bytes
    }

    /// Check the client-supplied file name and return its extension as written.
    pub fn check_file_name(&self, file_name: Option<&str>) -> Result<String, UploadRejection> {
        let extension = file_name
            .map(Path::new)
            .and_then(|path| path.extension())
            .and_then(|ext| ext.to_str())
            .ok_or(UploadRejection::InvalidType)?;
        if !self.settings.allows_extension(extension) {
            return Err(UploadRejection::InvalidType);
        }
        Ok(extension.to_string())
    }

    pub fn check_size(&self, len: usize) -> Result<(), UploadRejection> {
        if len > self.settings.max_bytes {
            return Err(UploadRejection::TooLarge);
        }
        Ok(())
    }

    /// Persist an accepted upload and bound its dimensions.
    ///
    /// Blocking; call from a blocking worker.
    pub fn store(
        &self,
        data: &[u8],
        extension: &str,
        declared_mime: Option<&str>,
    ) -> Result<StoredUpload> {
        fs::create_dir_all(&self.settings.dir).with_context(|| {
            format!(
                "Failed to create upload directory {}",
                self.settings.dir.display()
            )
        })?;

        let path = write_new_file(&self.settings.dir, extension, data)?;
        info!(path = %path.display(), bytes = data.len(), "Stored uploaded image");

        normalize_dimensions(&path, self.settings.max_dimension)?;

        Ok(StoredUpload {
            path: path.to_string_lossy().into_owned(),
            mime_type: detect_mime(data, declared_mime, extension),
        })
    }

    /// Resolve a path previously returned by [`UploadStore::store`].
    ///
    /// Fails when the file does not exist or lies outside the upload directory.
    pub fn locate(&self, raw: &str) -> Result<PathBuf> {
        let candidate = std::path::absolute(raw)
            .with_context(|| format!("Invalid upload path {raw}"))?;
        if !candidate.is_file() {
            bail!("File not found on server");
        }

        let file = candidate
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", candidate.display()))?;
        let root = self.settings.dir.canonicalize().with_context(|| {
            format!(
                "Failed to resolve upload directory {}",
                self.settings.dir.display()
            )
        })?;
        if !file.starts_with(&root) {
            bail!("File is outside the upload directory");
        }
        Ok(file)
    }

    /// Bound the image's dimensions again and read it for a model request.
    ///
    /// Blocking; call from a blocking worker.
    pub fn load_for_prompt(&self, path: &Path, declared_mime: Option<&str>) -> Result<LoadedImage> {
        normalize_dimensions(path, self.settings.max_dimension)?;
        let data = fs::read(path)
            .with_context(|| format!("Failed to read uploaded image {}", path.display()))?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        let mime_type = match declared_mime.map(str::trim).filter(|mime| !mime.is_empty()) {
            Some(mime) => mime.to_string(),
            None => detect_mime(&data, None, extension),
        };
        Ok(LoadedImage {
            mime_type,
            data,
        })
    }
}

/// Write `data` to a fresh `<unix-millis>.<ext>` file, never overwriting an existing one.
fn write_new_file(dir: &Path, extension: &str, data: &[u8]) -> Result<PathBuf> {
    let stamp = Utc::now().timestamp_millis();
    let mut counter = 0u32;
    loop {
        let name = if counter == 0 {
            format!("{stamp}.{extension}")
        } else {
            format!("{stamp}-{counter}.{extension}")
        };
        let candidate = dir.join(name);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut file) => {
                file.write_all(data).with_context(|| {
                    format!("Failed to write uploaded image {}", candidate.display())
                })?;
                return Ok(candidate);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                counter += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to create upload file {}", candidate.display())
                });
            }
        }
    }
}

/// Downscale `path` in place so both sides fit within `max_dimension`.
///
/// The resized image is written next to the original and renamed over it, so
/// readers never observe a partially written file. Returns whether a resize
/// happened.
pub fn normalize_dimensions(path: &Path, max_dimension: u32) -> Result<bool> {
    let reader = ImageReader::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("Failed to inspect image {}", path.display()))?;
    let format = reader
        .format()
        .or_else(|| ImageFormat::from_path(path).ok())
        .with_context(|| format!("Unrecognised image format for {}", path.display()))?;
    let (width, height) = reader
        .into_dimensions()
        .with_context(|| format!("Failed to read dimensions of {}", path.display()))?;

    if width <= max_dimension && height <= max_dimension {
        debug!(path = %path.display(), width, height, "Image within size bound");
        return Ok(false);
    }

    let image = ImageReader::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("Failed to inspect image {}", path.display()))?
        .decode()
        .with_context(|| format!("Failed to decode image {}", path.display()))?;
    let resized = image.resize(max_dimension, max_dimension, FilterType::Lanczos3);

    let temp = temp_path(path);
    resized
        .save_with_format(&temp, format)
        .with_context(|| format!("Failed to write resized image {}", temp.display()))?;
    fs::rename(&temp, path).with_context(|| {
        format!(
            "Failed to replace {} with resized image {}",
            path.display(),
            temp.display()
        )
    })?;

    info!(
        path = %path.display(),
        from_width = width,
        from_height = height,
        to_width = resized.width(),
        to_height = resized.height(),
        "Downscaled uploaded image"
    );
    Ok(true)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(TEMP_SUFFIX);
    PathBuf::from(raw)
}

/// Sniff the MIME type from the bytes, falling back to the declared type and then the extension.
pub fn detect_mime(data: &[u8], declared: Option<&str>, extension: &str) -> String {
    if let Some(kind) = infer::get(data) {
        if kind.matcher_type() == infer::MatcherType::Image {
            return kind.mime_type().to_string();
        }
    }
    if let Some(mime) = declared
        .map(str::trim)
        .filter(|mime| mime.starts_with("image/"))
    {
        return mime.to_string();
    }
    match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "png" => "image/png".into(),
        "jpg" | "jpeg" => "image/jpeg".into(),
        _ => "application/octet-stream".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> UploadStore {
        UploadStore::new(UploadSettings {
            dir: dir.to_path_buf(),
            ..UploadSettings::default()
        })
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 40, 40]));
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .expect("encode png");
        buffer
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([10, 120, 220]));
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
            .expect("encode jpeg");
        buffer
    }

    #[test]
    fn file_name_extension_is_checked() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(dir.path());
        assert_eq!(store.check_file_name(Some("cat.PNG")), Ok("PNG".to_string()));
        assert_eq!(store.check_file_name(Some("cat.jpeg")), Ok("jpeg".to_string()));
        assert_eq!(
            store.check_file_name(Some("cat.gif")),
            Err(UploadRejection::InvalidType)
        );
        assert_eq!(
            store.check_file_name(Some("no-extension")),
            Err(UploadRejection::InvalidType)
        );
        assert_eq!(store.check_file_name(None), Err(UploadRejection::InvalidType));
    }

    #[test]
    fn size_limit_is_inclusive() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(dir.path());
        assert!(store.check_size(10 * 1024 * 1024).is_ok());
        assert_eq!(
            store.check_size(10 * 1024 * 1024 + 1),
            Err(UploadRejection::TooLarge)
        );
    }

    #[test]
    fn store_creates_directory_and_keeps_extension() {
        let dir = tempdir().expect("temp dir");
        let uploads = dir.path().join("uploads");
        let store = store_in(&uploads);

        let stored = store
            .store(&png_bytes(8, 8), "png", Some("image/png"))
            .expect("store");
        let path = PathBuf::from(&stored.path);
        assert!(path.starts_with(&uploads));
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("png"));
        assert_eq!(stored.mime_type, "image/png");
        assert!(path.is_file());
    }

    #[test]
    fn repeated_stores_never_collide() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(dir.path());
        let bytes = png_bytes(4, 4);

        let mut paths = std::collections::HashSet::new();
        for _ in 0..5 {
            let stored = store.store(&bytes, "png", None).expect("store");
            assert!(paths.insert(stored.path));
        }
        assert_eq!(fs::read_dir(dir.path()).expect("list").count(), 5);
    }

    #[test]
    fn oversized_image_is_downscaled_preserving_aspect_ratio() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("wide.png");
        fs::write(&path, png_bytes(3000, 1500)).expect("write");

        let resized = normalize_dimensions(&path, 2048).expect("normalize");
        assert!(resized);

        let (width, height) = image::image_dimensions(&path).expect("dimensions");
        assert_eq!((width, height), (2048, 1024));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn tall_jpeg_is_downscaled_and_stays_jpeg() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("tall.jpg");
        fs::write(&path, jpeg_bytes(1000, 3000)).expect("write");

        assert!(normalize_dimensions(&path, 2048).expect("normalize"));

        let (width, height) = image::image_dimensions(&path).expect("dimensions");
        assert_eq!(height, 2048);
        let expected_width = (1000.0_f64 * 2048.0 / 3000.0).round() as u32;
        assert!(width.abs_diff(expected_width) <= 1);

        let bytes = fs::read(&path).expect("read");
        assert_eq!(image::guess_format(&bytes).expect("format"), ImageFormat::Jpeg);
    }

    #[test]
    fn small_image_is_left_untouched() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("small.png");
        let original = png_bytes(640, 480);
        fs::write(&path, &original).expect("write");

        assert!(!normalize_dimensions(&path, 2048).expect("normalize"));
        assert_eq!(fs::read(&path).expect("read"), original);
    }

    #[test]
    fn corrupt_image_fails_normalization() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("broken.png");
        fs::write(&path, b"definitely not an image").expect("write");
        assert!(normalize_dimensions(&path, 2048).is_err());
    }

    #[test]
    fn locate_requires_existing_file_inside_upload_dir() {
        let dir = tempdir().expect("temp dir");
        let uploads = dir.path().join("uploads");
        fs::create_dir_all(&uploads).expect("uploads dir");
        let store = store_in(&uploads);

        let inside = uploads.join("1.png");
        fs::write(&inside, png_bytes(2, 2)).expect("write inside");
        let located = store.locate(inside.to_str().expect("utf8")).expect("locate");
        assert_eq!(located, inside.canonicalize().expect("canonical"));

        let missing = uploads.join("missing.png");
        let err = store
            .locate(missing.to_str().expect("utf8"))
            .expect_err("missing file");
        assert!(err.to_string().contains("not found"));

        let outside = dir.path().join("secret.png");
        fs::write(&outside, png_bytes(2, 2)).expect("write outside");
        let err = store
            .locate(outside.to_str().expect("utf8"))
            .expect_err("outside file");
        assert!(err.to_string().contains("outside the upload directory"));
    }

    #[test]
    fn load_for_prompt_prefers_declared_mime() {
        let dir = tempdir().expect("temp dir");
        let store = store_in(dir.path());
        let path = dir.path().join("photo.png");
        fs::write(&path, png_bytes(4, 4)).expect("write");

        let loaded = store
            .load_for_prompt(&path, Some("image/png"))
            .expect("load");
        assert_eq!(loaded.mime_type, "image/png");
        assert!(!loaded.data.is_empty());

        let sniffed = store.load_for_prompt(&path, Some("  ")).expect("load");
        assert_eq!(sniffed.mime_type, "image/png");
    }

    #[test]
    fn detect_mime_falls_back_in_order() {
        assert_eq!(detect_mime(&png_bytes(1, 1), Some("image/jpeg"), "jpg"), "image/png");
        assert_eq!(detect_mime(b"????", Some("image/jpeg"), "png"), "image/jpeg");
        assert_eq!(detect_mime(b"????", Some("text/plain"), "JPG"), "image/jpeg");
        assert_eq!(detect_mime(b"????", None, "bin"), "application/octet-stream");
    }
}
