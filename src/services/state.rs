use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::Database;
use crate::models::{ScanOutcome, ScanProgress};
use crate::services::image_store::ImageStore;
use crate::services::notifier::{run_expiry_check, NotificationSink};
use crate::services::scanner::GalleryScanner;
use crate::utils::today_kst;

/// Unique background job names; at most one instance of each exists per
/// process, and re-triggering replaces the previous instance.
pub const EXPIRY_WORK_NAME: &str = "gifticon_expiry_check";
pub const GALLERY_SCAN_WORK_NAME: &str = "gallery_scan_work";

pub const EXPIRY_CHECK_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

struct JobHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl JobHandle {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub images: Arc<ImageStore>,
    expiry_job: Mutex<Option<JobHandle>>,
    scan_job: Mutex<Option<JobHandle>>,
}

impl AppState {
    pub fn new(db: Database, images: ImageStore) -> Self {
        AppState {
            db: Arc::new(Mutex::new(db)),
            images: Arc::new(images),
            expiry_job: Mutex::new(None),
            scan_job: Mutex::new(None),
        }
    }

    /// Schedules the recurring expiry check, replacing any previously
    /// scheduled instance. The first run fires immediately.
    pub fn schedule_expiry_check(&self, sink: Arc<dyn NotificationSink>, period: Duration) {
        let cancel = CancellationToken::new();
        let db = self.db.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                match run_expiry_check(&db, sink.as_ref(), today_kst()).await {
                    Ok(count) => info!("{EXPIRY_WORK_NAME}: {count} notification(s)"),
                    Err(err) => warn!("{EXPIRY_WORK_NAME} failed: {err:#}"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = task_cancel.cancelled() => break,
                }
            }
        });

        self.replace_job(&self.expiry_job, Some(JobHandle { cancel, handle }));
    }

    pub fn cancel_expiry_check(&self) {
        self.replace_job(&self.expiry_job, None);
    }

    /// Starts a gallery scan in the background, replacing a still-running
    /// one. The returned receiver resolves with the completion signal.
    pub fn start_gallery_scan(
        &self,
        scanner: Arc<GalleryScanner>,
        progress: mpsc::Sender<ScanProgress>,
    ) -> oneshot::Receiver<ScanOutcome> {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let (done_tx, done_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let outcome = scanner.run(&task_cancel, &progress).await;
            let _ = done_tx.send(outcome);
        });

        self.replace_job(&self.scan_job, Some(JobHandle { cancel, handle }));
        info!("{GALLERY_SCAN_WORK_NAME} started");
        done_rx
    }

    pub fn cancel_gallery_scan(&self) {
        self.replace_job(&self.scan_job, None);
    }

    pub fn scan_running(&self) -> bool {
        self.scan_job
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|job| !job.handle.is_finished()))
            .unwrap_or(false)
    }

    fn replace_job(&self, slot: &Mutex<Option<JobHandle>>, next: Option<JobHandle>) {
        let previous = match slot.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, next),
            Err(_) => None,
        };
        if let Some(job) = previous {
            job.stop();
        }
    }
}
