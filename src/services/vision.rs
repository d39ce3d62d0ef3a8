use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;
use std::sync::Arc;
use tracing::{debug, warn};

/// Long-edge bound applied before detection to cap memory and latency.
const MAX_DETECTION_EDGE: u32 = 1024;

/// A detected barcode/QR region. The screener only cares that at least one
/// exists; value and format are carried for callers that want them.
#[derive(Debug, Clone)]
pub struct Barcode {
    pub format: String,
    pub value: Option<String>,
}

/// On-device barcode model boundary. Implementations resolve to the full
/// region list or an error; release happens on drop.
#[async_trait]
pub trait BarcodeDetector: Send + Sync {
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<Barcode>>;
}

/// On-device text recognition boundary.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &DynamicImage) -> Result<String>;
}

/// Answers "does this image contain a barcode" with a fail-closed policy:
/// decode failures and model failures are `false`, never errors, so a
/// screening problem can never be mistaken for "is a gifticon".
pub struct BarcodeScreener {
    detector: Arc<dyn BarcodeDetector>,
}

impl BarcodeScreener {
    pub fn new(detector: Arc<dyn BarcodeDetector>) -> Self {
        BarcodeScreener { detector }
    }

    pub async fn has_barcode(&self, bytes: &[u8]) -> bool {
        let image = match decode_downsampled(bytes, MAX_DETECTION_EDGE) {
            Some(image) => image,
            None => return false,
        };

        match self.detector.detect(&image).await {
            Ok(barcodes) => {
                debug!("barcode detection found {} region(s)", barcodes.len());
                !barcodes.is_empty()
            }
            Err(err) => {
                warn!("barcode detection failed: {err}");
                false
            }
        }
    }
}

/// Decodes `bytes`, shrinking so the long edge is at most `max_edge`.
/// `None` on any decode failure.
pub fn decode_downsampled(bytes: &[u8], max_edge: u32) -> Option<DynamicImage> {
    let image = match image::load_from_memory(bytes) {
        Ok(image) => image,
        Err(err) => {
            warn!("bitmap decode failed: {err}");
            return None;
        }
    };
    if image.width() > max_edge || image.height() > max_edge {
        Some(image.thumbnail(max_edge, max_edge))
    } else {
        Some(image)
    }
}

/// Text recognizer backed by the tesseract engine, for builds with the
/// native toolchain available.
#[cfg(feature = "tesseract-ocr")]
pub struct TesseractRecognizer {
    language: String,
}

#[cfg(feature = "tesseract-ocr")]
impl TesseractRecognizer {
    pub fn new(language: impl Into<String>) -> Self {
        TesseractRecognizer {
            language: language.into(),
        }
    }
}

#[cfg(feature = "tesseract-ocr")]
#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    async fn recognize(&self, image: &DynamicImage) -> Result<String> {
        use anyhow::anyhow;
        use image::ImageFormat;
        use std::io::Cursor;

        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png)?;
        let language = self.language.clone();
        let bytes = png.into_inner();

        // tesseract is blocking C code; keep it off the async workers
        tokio::task::spawn_blocking(move || {
            let text = tesseract::Tesseract::new(None, Some(&language))
                .map_err(|e| anyhow!("Tesseract init: {}", e))?
                .set_image_from_mem(&bytes)
                .map_err(|e| anyhow!("Tesseract image: {}", e))?
                .recognize()
                .map_err(|e| anyhow!("Tesseract recognize: {}", e))?
                .get_text()
                .map_err(|e| anyhow!("OCR text: {}", e))?;
            Ok(text)
        })
        .await?
    }
}
