use chrono::Local;
use image::codecs::jpeg::JpegEncoder;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const JPEG_QUALITY: u8 = 90;

/// App-private storage for gifticon images. Every stored image is a
/// re-encoded JPEG copy; originals are never referenced.
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: PathBuf) -> Self {
        ImageStore { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decodes `bytes` and writes a JPEG copy into the managed directory,
    /// returning the absolute path. `None` on decode or write failure; the
    /// caller aborts its enclosing operation without partial state.
    pub fn store(&self, bytes: &[u8]) -> Option<String> {
        let image = match image::load_from_memory(bytes) {
            Ok(img) => img,
            Err(err) => {
                warn!("image decode failed: {err}");
                return None;
            }
        };

        if let Err(err) = std::fs::create_dir_all(&self.dir) {
            warn!("image dir create failed: {err}");
            return None;
        }

        let path = self.dir.join(generate_file_name());
        let result = File::create(&path).map_err(anyhow::Error::from).and_then(|file| {
            let mut writer = BufWriter::new(file);
            let encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
            image.to_rgb8().write_with_encoder(encoder)?;
            Ok(())
        });

        match result {
            Ok(()) => {
                debug!("stored image at {}", path.display());
                Some(path.to_string_lossy().to_string())
            }
            Err(err) => {
                warn!("image write failed: {err}");
                // half-written file must not linger
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }

    /// Removes the file if present; an already absent file counts as
    /// success. Never errors.
    pub fn delete(&self, path: &str) -> bool {
        let target = Path::new(path);
        if !target.exists() {
            return true;
        }
        match std::fs::remove_file(target) {
            Ok(()) => true,
            Err(err) => {
                warn!("image delete failed for {path}: {err}");
                false
            }
        }
    }

    /// Best-effort removal of every file in the managed directory; used for
    /// a full data reset.
    pub fn clear_all(&self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!("failed to remove {}: {err}", path.display());
                }
            }
        }
    }
}

fn generate_file_name() -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("gifticon_{timestamp}_{}.jpg", &suffix[..8])
}

/// Small valid PNG for tests in this crate.
#[cfg(test)]
pub(crate) fn png_bytes() -> Vec<u8> {
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, image::Rgb([200, 30, 60])));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}
