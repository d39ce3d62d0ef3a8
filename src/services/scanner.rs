use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::db::Database;
use crate::models::{Gifticon, ScanOutcome, ScanProgress, ScanStage};
use crate::services::extractor::ExpiryDateExtractor;
use crate::services::image_store::ImageStore;
use crate::services::vision::BarcodeScreener;
use crate::utils::{strip_file_scheme, FILE_SCHEME};

/// Window of most-recent gallery images considered per run.
pub const MAX_GALLERY_IMAGES: usize = 1000;
/// Barcode screening fan-out per batch.
const BARCODE_BATCH_SIZE: usize = 50;
/// Text recognition is costlier, so its batches are smaller.
const OCR_BATCH_SIZE: usize = 10;
const BARCODE_BATCH_DELAY: Duration = Duration::from_millis(100);
const OCR_BATCH_DELAY: Duration = Duration::from_millis(500);
/// Screening progress is reported every this many images.
const PROGRESS_EVERY: usize = 5;

const AUTO_BRAND_NAME: &str = "갤러리 기프티콘";
const AUTO_SCAN_NOTE: &str = "갤러리 자동 스캔으로 등록";

/// Device media index boundary: hands out references to the most recently
/// added images, newest first, without loading pixel data.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn recent_images(&self, limit: usize) -> Result<Vec<PathBuf>>;
    async fn load(&self, image: &Path) -> Result<Vec<u8>>;
}

/// Directory-backed media source: walks a folder for image files, newest
/// modification first.
pub struct FsMediaSource {
    root: PathBuf,
}

impl FsMediaSource {
    pub fn new(root: PathBuf) -> Self {
        FsMediaSource { root }
    }
}

#[async_trait]
impl MediaSource for FsMediaSource {
    async fn recent_images(&self, limit: usize) -> Result<Vec<PathBuf>> {
        let mut entries: Vec<(PathBuf, std::time::SystemTime)> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter(|e| is_image(e.path()))
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((e.path().to_path_buf(), modified))
            })
            .collect();

        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(limit);
        Ok(entries.into_iter().map(|(path, _)| path).collect())
    }

    async fn load(&self, image: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(image).await?)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "webp"
            )
        })
        .unwrap_or(false)
}

/// Four-stage batch job over recent gallery images: collect, screen for
/// barcodes, extract expiry dates from survivors, persist the hits as draft
/// gifticons. No resumability and no dedup against earlier runs; a re-run
/// restarts against the current most-recent window.
pub struct GalleryScanner {
    media: Arc<dyn MediaSource>,
    screener: BarcodeScreener,
    extractor: ExpiryDateExtractor,
    images: Arc<ImageStore>,
    db: Arc<Mutex<Database>>,
}

impl GalleryScanner {
    pub fn new(
        media: Arc<dyn MediaSource>,
        screener: BarcodeScreener,
        extractor: ExpiryDateExtractor,
        images: Arc<ImageStore>,
        db: Arc<Mutex<Database>>,
    ) -> Self {
        GalleryScanner {
            media,
            screener,
            extractor,
            images,
            db,
        }
    }

    /// Runs the full pipeline. Never panics out: any escaping error (and
    /// cancellation) is reported as a failed outcome, which doubles as the
    /// completion signal that clears in-progress indicators.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        progress: &mpsc::Sender<ScanProgress>,
    ) -> ScanOutcome {
        match self.run_inner(cancel, progress).await {
            Ok(outcome) => {
                info!("gallery scan finished: {}", outcome.message);
                outcome
            }
            Err(err) => {
                warn!("gallery scan aborted: {err:#}");
                ScanOutcome::failure(format!("scan failed: {err}"))
            }
        }
    }

    async fn run_inner(
        &self,
        cancel: &CancellationToken,
        progress: &mpsc::Sender<ScanProgress>,
    ) -> Result<ScanOutcome> {
        self.ensure_not_cancelled(cancel)?;
        send_progress(progress, ScanStage::Loading, 0, MAX_GALLERY_IMAGES, 0).await;

        // an inaccessible index terminates successfully with zero results
        let candidates = match self.media.recent_images(MAX_GALLERY_IMAGES).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!("media index inaccessible: {err}");
                Vec::new()
            }
        };
        if candidates.is_empty() {
            return Ok(ScanOutcome::success(0, "no images found in the gallery"));
        }

        let positives = self.screen(&candidates, cancel, progress).await?;
        if positives.is_empty() {
            return Ok(ScanOutcome::success(0, "no barcode images found"));
        }
        info!("{} of {} image(s) passed barcode screening", positives.len(), candidates.len());

        let drafts = self.extract_and_stage(&positives, cancel, progress).await?;
        let saved = self.persist(&drafts, cancel, progress).await?;

        Ok(ScanOutcome::success(
            saved,
            format!("gallery scan complete: saved {saved} gifticon(s)"),
        ))
    }

    /// Stage 2: batch-synchronous concurrent screening. Batch N+1 does not
    /// start before every member of batch N resolved.
    async fn screen(
        &self,
        images: &[PathBuf],
        cancel: &CancellationToken,
        progress: &mpsc::Sender<ScanProgress>,
    ) -> Result<Vec<PathBuf>> {
        let total = images.len();
        let mut positives: Vec<PathBuf> = Vec::new();

        for (batch_index, batch) in images.chunks(BARCODE_BATCH_SIZE).enumerate() {
            self.ensure_not_cancelled(cancel)?;
            let found_so_far = positives.len();

            let jobs = batch.iter().enumerate().map(|(index, path)| async move {
                let current = batch_index * BARCODE_BATCH_SIZE + index + 1;
                let positive = match self.media.load(path).await {
                    Ok(bytes) => self.screener.has_barcode(&bytes).await,
                    Err(err) => {
                        warn!("failed to load {}: {err}", path.display());
                        false
                    }
                };
                if current % PROGRESS_EVERY == 0 {
                    send_progress(progress, ScanStage::BarcodeScan, current, total, found_so_far)
                        .await;
                }
                positive.then(|| path.clone())
            });

            let results = join_all(jobs).await;
            positives.extend(results.into_iter().flatten());

            // spread out peak load between batches
            self.pause(BARCODE_BATCH_DELAY, cancel).await?;
        }

        Ok(positives)
    }

    /// Stage 3: OCR the screened positives; anything with an expiry date is
    /// copied into the image store and staged as a draft gifticon. Images
    /// whose copy fails are dropped here.
    async fn extract_and_stage(
        &self,
        images: &[PathBuf],
        cancel: &CancellationToken,
        progress: &mpsc::Sender<ScanProgress>,
    ) -> Result<Vec<Gifticon>> {
        let total = images.len();
        let mut drafts: Vec<Gifticon> = Vec::new();

        for (batch_index, batch) in images.chunks(OCR_BATCH_SIZE).enumerate() {
            self.ensure_not_cancelled(cancel)?;
            let found_so_far = drafts.len();

            let jobs = batch.iter().enumerate().map(|(index, path)| async move {
                let current = batch_index * OCR_BATCH_SIZE + index + 1;
                let bytes = match self.media.load(path).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("failed to load {}: {err}", path.display());
                        return None;
                    }
                };
                let info = self.extractor.extract(&bytes).await;
                send_progress(progress, ScanStage::OcrProcessing, current, total, found_so_far)
                    .await;

                let expiry_date = info.expiry_date?;
                let stored_path = self.images.store(&bytes)?;
                Some(draft_gifticon(expiry_date, stored_path))
            });

            let results = join_all(jobs).await;
            drafts.extend(results.into_iter().flatten());

            self.pause(OCR_BATCH_DELAY, cancel).await?;
        }

        Ok(drafts)
    }

    /// Stage 4: sequential inserts. A failed insert deletes the already
    /// copied image (compensation, not a transaction) and the item simply
    /// drops out of the saved count.
    async fn persist(
        &self,
        drafts: &[Gifticon],
        cancel: &CancellationToken,
        progress: &mpsc::Sender<ScanProgress>,
    ) -> Result<usize> {
        let mut saved = 0;

        for (index, draft) in drafts.iter().enumerate() {
            self.ensure_not_cancelled(cancel)?;

            let inserted = {
                let db = self.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
                db.insert(draft)
            };
            match inserted {
                Ok(_) => saved += 1,
                Err(err) => {
                    warn!("insert failed, rolling back image copy: {err}");
                    if let Some(image_path) = &draft.image_path {
                        self.images.delete(strip_file_scheme(image_path));
                    }
                }
            }

            send_progress(progress, ScanStage::Saving, index + 1, drafts.len(), saved).await;
        }

        Ok(saved)
    }

    fn ensure_not_cancelled(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(anyhow!("gallery scan cancelled"));
        }
        Ok(())
    }

    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(anyhow!("gallery scan cancelled")),
        }
    }
}

fn draft_gifticon(expiry_date: String, stored_path: String) -> Gifticon {
    let mut draft = Gifticon::new(AUTO_BRAND_NAME, expiry_date);
    draft.image_path = Some(format!("{FILE_SCHEME}{stored_path}"));
    draft.notes = Some(AUTO_SCAN_NOTE.to_string());
    draft
}

async fn send_progress(
    progress: &mpsc::Sender<ScanProgress>,
    stage: ScanStage,
    current: usize,
    total: usize,
    found: usize,
) {
    // a gone observer must not stall the pipeline
    let _ = progress
        .send(ScanProgress {
            stage,
            current,
            total,
            found,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GifticonCategory;
    use crate::services::vision::{Barcode, BarcodeDetector, TextRecognizer};
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::collections::HashMap;
    use std::io::Cursor;

    const BARCODE_MARKER: Rgb<u8> = Rgb([255, 0, 0]);

    fn png(color: Rgb<u8>) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, color));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    struct MapMedia {
        order: Vec<PathBuf>,
        bytes: HashMap<PathBuf, Vec<u8>>,
    }

    impl MapMedia {
        fn new(items: Vec<(&str, Vec<u8>)>) -> Self {
            let order: Vec<PathBuf> = items.iter().map(|(name, _)| PathBuf::from(name)).collect();
            let bytes = items
                .into_iter()
                .map(|(name, data)| (PathBuf::from(name), data))
                .collect();
            MapMedia { order, bytes }
        }
    }

    #[async_trait]
    impl MediaSource for MapMedia {
        async fn recent_images(&self, limit: usize) -> Result<Vec<PathBuf>> {
            Ok(self.order.iter().take(limit).cloned().collect())
        }

        async fn load(&self, image: &Path) -> Result<Vec<u8>> {
            self.bytes
                .get(image)
                .cloned()
                .ok_or_else(|| anyhow!("missing image"))
        }
    }

    /// Reports a barcode iff the image's top-left pixel is the marker color.
    struct MarkerDetector;

    #[async_trait]
    impl BarcodeDetector for MarkerDetector {
        async fn detect(&self, image: &DynamicImage) -> Result<Vec<Barcode>> {
            if image.to_rgb8().get_pixel(0, 0) == &BARCODE_MARKER {
                Ok(vec![Barcode {
                    format: "CODE_128".to_string(),
                    value: Some("8809".to_string()),
                }])
            } else {
                Ok(Vec::new())
            }
        }
    }

    struct FixedRecognizer(&'static str);

    #[async_trait]
    impl TextRecognizer for FixedRecognizer {
        async fn recognize(&self, _image: &DynamicImage) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        scanner: GalleryScanner,
        db: Arc<Mutex<Database>>,
    }

    fn harness(media: MapMedia, recognized: &'static str) -> Harness {
        let tmp = tempfile::TempDir::new().unwrap();
        let images = Arc::new(ImageStore::new(tmp.path().join("gifticon_images")));
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let scanner = GalleryScanner::new(
            Arc::new(media),
            BarcodeScreener::new(Arc::new(MarkerDetector)),
            ExpiryDateExtractor::new(Arc::new(FixedRecognizer(recognized))),
            images,
            db.clone(),
        );
        Harness {
            _tmp: tmp,
            scanner,
            db,
        }
    }

    async fn run(harness: &Harness) -> (ScanOutcome, Vec<ScanProgress>) {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(256);
        let outcome = harness.scanner.run(&cancel, &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    #[tokio::test]
    async fn one_gifticon_among_three_images_is_saved() {
        let media = MapMedia::new(vec![
            ("a.png", png(BARCODE_MARKER)),
            ("b.png", png(Rgb([0, 255, 0]))),
            ("c.png", png(Rgb([0, 0, 255]))),
        ]);
        let h = harness(media, "유효기간 2029-12-31");

        let (outcome, events) = run(&h).await;
        assert!(!outcome.failed);
        assert_eq!(outcome.saved_count, 1);

        let rows = h.db.lock().unwrap().get_all().unwrap();
        assert_eq!(rows.len(), 1);
        let saved = &rows[0];
        assert_eq!(saved.brand_name, AUTO_BRAND_NAME);
        assert_eq!(saved.expiry_date, "2029-12-31");
        assert_eq!(saved.category, GifticonCategory::Etc);
        assert_eq!(saved.notes.as_deref(), Some(AUTO_SCAN_NOTE));
        let image_path = saved.image_path.as_deref().unwrap();
        assert!(image_path.starts_with(FILE_SCHEME));
        assert!(Path::new(strip_file_scheme(image_path)).is_file());

        assert!(events.iter().any(|e| e.stage == ScanStage::Saving && e.found == 1));
    }

    #[tokio::test]
    async fn empty_gallery_terminates_successfully() {
        let h = harness(MapMedia::new(vec![]), "유효기간 2029-12-31");
        let (outcome, _) = run(&h).await;
        assert!(!outcome.failed);
        assert_eq!(outcome.saved_count, 0);
        assert!(h.db.lock().unwrap().get_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_barcodes_means_zero_results() {
        let media = MapMedia::new(vec![
            ("a.png", png(Rgb([0, 255, 0]))),
            ("b.png", png(Rgb([0, 0, 255]))),
        ]);
        let h = harness(media, "유효기간 2029-12-31");
        let (outcome, _) = run(&h).await;
        assert!(!outcome.failed);
        assert_eq!(outcome.saved_count, 0);
    }

    #[tokio::test]
    async fn barcode_without_expiry_date_is_not_saved() {
        let media = MapMedia::new(vec![("a.png", png(BARCODE_MARKER))]);
        let h = harness(media, "아메리카노 한 잔");
        let (outcome, _) = run(&h).await;
        assert!(!outcome.failed);
        assert_eq!(outcome.saved_count, 0);
        assert!(h.db.lock().unwrap().get_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_bytes_fail_closed_through_the_pipeline() {
        let media = MapMedia::new(vec![("junk.png", b"not an image".to_vec())]);
        let h = harness(media, "유효기간 2029-12-31");
        let (outcome, _) = run(&h).await;
        assert!(!outcome.failed);
        assert_eq!(outcome.saved_count, 0);
    }

    #[tokio::test]
    async fn cancellation_reports_a_failed_outcome() {
        let media = MapMedia::new(vec![("a.png", png(BARCODE_MARKER))]);
        let h = harness(media, "유효기간 2029-12-31");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(256);
        let outcome = h.scanner.run(&cancel, &tx).await;
        assert!(outcome.failed);
        assert_eq!(outcome.saved_count, 0);
        assert!(h.db.lock().unwrap().get_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_insert_rolls_back_the_image_copy() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("gifticons.db");
        let images = Arc::new(ImageStore::new(tmp.path().join("gifticon_images")));
        let db = Arc::new(Mutex::new(Database::new(db_path.clone()).unwrap()));
        let scanner = GalleryScanner::new(
            Arc::new(MapMedia::new(vec![("a.png", png(BARCODE_MARKER))])),
            BarcodeScreener::new(Arc::new(MarkerDetector)),
            ExpiryDateExtractor::new(Arc::new(FixedRecognizer("유효기간 2029-12-31"))),
            images.clone(),
            db.clone(),
        );

        // yank the table out from under stage 4
        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch("DROP TABLE gifticons")
            .unwrap();

        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(256);
        let outcome = scanner.run(&cancel, &tx).await;

        // the item drops out of the count, the run itself still completes
        assert!(!outcome.failed);
        assert_eq!(outcome.saved_count, 0);
        let leftover = std::fs::read_dir(images.dir()).unwrap().count();
        assert_eq!(leftover, 0, "copied image must be deleted on insert failure");
    }

    #[tokio::test]
    async fn fs_media_source_filters_non_images() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.png"), png(BARCODE_MARKER)).unwrap();
        std::fs::write(tmp.path().join("b.jpeg"), b"x").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"x").unwrap();

        let source = FsMediaSource::new(tmp.path().to_path_buf());
        let images = source.recent_images(10).await.unwrap();
        assert_eq!(images.len(), 2);
        assert!(images.iter().all(|p| is_image(p)));

        let limited = source.recent_images(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn fs_media_source_missing_root_is_empty() {
        let source = FsMediaSource::new(PathBuf::from("/definitely/not/here"));
        assert!(source.recent_images(10).await.unwrap().is_empty());
    }
}
