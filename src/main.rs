use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use gifticon_manager::commands;
use gifticon_manager::db::Database;
use gifticon_manager::models::{Gifticon, GifticonCategory, NotificationSettings, ScanProgress};
use gifticon_manager::services::analysis::AnalysisClient;
use gifticon_manager::services::extractor::ExpiryDateExtractor;
use gifticon_manager::services::image_store::ImageStore;
use gifticon_manager::services::notifier::{run_expiry_check, LogSink};
use gifticon_manager::services::scanner::{FsMediaSource, GalleryScanner, MAX_GALLERY_IMAGES};
use gifticon_manager::services::state::{AppState, EXPIRY_CHECK_PERIOD};
use gifticon_manager::services::vision::{Barcode, BarcodeDetector, BarcodeScreener, TextRecognizer};
use gifticon_manager::utils::today_kst;

#[derive(Parser)]
#[command(name = "gifticon-manager", version, about = "Track prepaid mobile gifticons: expiry, balance and gallery auto-registration")]
struct Cli {
    /// Directory holding the database and stored images
    #[arg(long, global = true, env = "GIFTICON_DATA_DIR", default_value = "./gifticon-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List gifticons
    List {
        #[arg(long, value_enum, default_value_t = ListFilter::All)]
        filter: ListFilter,
        /// Restrict to one category (e.g. CAFE, MOVIE, ETC)
        #[arg(long)]
        category: Option<String>,
    },
    /// Search by brand or product name
    Search { query: String },
    /// Show one gifticon in full
    Show { id: i64 },
    /// Register a gifticon by hand
    Add {
        brand: String,
        /// Expiry date, ISO YYYY-MM-DD
        expiry: String,
        #[arg(long)]
        product: Option<String>,
        /// Face amount in won; the balance starts at this value
        #[arg(long, default_value_t = 0)]
        amount: i64,
        #[arg(long)]
        barcode: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Mark a gifticon fully used
    Use { id: i64 },
    /// Record a partial redemption by setting the remaining balance
    Balance { id: i64, new_balance: i64 },
    /// Delete a gifticon and its stored image
    Delete { id: i64 },
    /// Scan a directory of images for gifticons and register the hits
    Scan {
        /// Gallery directory to walk
        gallery: PathBuf,
    },
    /// Run the expiry check now, or keep it running
    Notify {
        /// Stay resident and re-check every 24 hours
        #[arg(long)]
        daemon: bool,
    },
    /// Show or change notification settings
    Settings {
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        /// Lead-time days, comma separated (e.g. "1,7,30")
        #[arg(long)]
        days: Option<String>,
    },
    /// Send an image to the analysis backend and print the result
    Analyze {
        image: PathBuf,
        #[arg(long, env = "GIFTICON_BACKEND_URL", default_value = "http://localhost:3000")]
        backend: String,
    },
    /// Delete every gifticon and every stored image
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ListFilter {
    All,
    Active,
    Expiring,
    Expired,
}

/// Detector used when no barcode model is wired in: every decodable image
/// passes screening and it is the expiry extractor that filters.
struct PassAllDetector;

#[async_trait]
impl BarcodeDetector for PassAllDetector {
    async fn detect(&self, _image: &image::DynamicImage) -> Result<Vec<Barcode>> {
        Ok(vec![Barcode {
            format: "UNKNOWN".to_string(),
            value: None,
        }])
    }
}

fn text_recognizer() -> Result<Arc<dyn TextRecognizer>> {
    #[cfg(feature = "tesseract-ocr")]
    {
        Ok(Arc::new(
            gifticon_manager::services::vision::TesseractRecognizer::new("kor+eng"),
        ))
    }
    #[cfg(not(feature = "tesseract-ocr"))]
    {
        bail!("built without OCR support; rebuild with the tesseract-ocr feature")
    }
}

fn open_state(data_dir: &PathBuf) -> Result<AppState> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db = Database::new(data_dir.join("gifticons.db"))?;
    let images = ImageStore::new(data_dir.join("images"));
    Ok(AppState::new(db, images))
}

fn parse_category(value: &str) -> Result<GifticonCategory> {
    value
        .parse()
        .map_err(|e: String| anyhow::anyhow!("{e} (expected CAFE, MOVIE, CONVENIENCE_STORE, CHICKEN, FAST_FOOD, BEAUTY, SHOPPING or ETC)"))
}

fn print_row(g: &Gifticon) {
    let status = if g.is_used { "used" } else { "active" };
    println!(
        "#{:<4} {:<12} {}  {}  {}원/{}원  [{}] {}",
        g.id,
        g.expiry_date,
        g.brand_name,
        g.product_name.as_deref().unwrap_or("-"),
        g.balance,
        g.amount,
        g.category,
        status
    );
}

fn print_detail(g: &Gifticon) {
    println!("id:        {}", g.id);
    println!("brand:     {}", g.brand_name);
    println!("product:   {}", g.product_name.as_deref().unwrap_or("-"));
    println!("expiry:    {}", g.expiry_date);
    println!("amount:    {}원", g.amount);
    println!("balance:   {}원", g.balance);
    println!("barcode:   {}", g.barcode_number.as_deref().unwrap_or("-"));
    println!("category:  {}", g.category);
    println!("purchased: {}", g.purchase_date.as_deref().unwrap_or("-"));
    println!("notes:     {}", g.notes.as_deref().unwrap_or("-"));
    println!("image:     {}", g.image_path.as_deref().unwrap_or("-"));
    println!("used:      {}", g.is_used);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let state = open_state(&cli.data_dir)?;

    match cli.command {
        Command::List { filter, category } => {
            let gifticons = match (filter, category) {
                (_, Some(category)) => {
                    commands::list_by_category(&state, parse_category(&category)?)?
                }
                (ListFilter::All, None) => commands::list_all(&state)?,
                (ListFilter::Active, None) => commands::list_active(&state)?,
                (ListFilter::Expiring, None) => commands::list_expiring_soon(&state)?,
                (ListFilter::Expired, None) => commands::list_expired_or_used(&state)?,
            };
            if gifticons.is_empty() {
                println!("no gifticons");
            }
            for g in &gifticons {
                print_row(g);
            }
        }
        Command::Search { query } => {
            for g in &commands::search_gifticons(&state, &query)? {
                print_row(g);
            }
        }
        Command::Show { id } => print_detail(&commands::get_gifticon(&state, id)?),
        Command::Add {
            brand,
            expiry,
            product,
            amount,
            barcode,
            category,
            notes,
        } => {
            let mut gifticon = Gifticon::new(brand, expiry);
            gifticon.product_name = product;
            gifticon.amount = amount;
            gifticon.balance = amount;
            gifticon.barcode_number = barcode;
            gifticon.notes = notes;
            if let Some(category) = category {
                gifticon.category = parse_category(&category)?;
            }
            let id = commands::add_gifticon(&state, &gifticon)?;
            println!("added gifticon #{id}");
        }
        Command::Use { id } => {
            commands::mark_used(&state, id)?;
            println!("gifticon #{id} marked used");
        }
        Command::Balance { id, new_balance } => {
            commands::update_balance(&state, id, new_balance)?;
            println!("gifticon #{id} balance set to {new_balance}원");
        }
        Command::Delete { id } => {
            commands::delete_gifticon(&state, id)?;
            println!("gifticon #{id} deleted");
        }
        Command::Scan { gallery } => {
            let recognizer = text_recognizer()?;
            let scanner = Arc::new(GalleryScanner::new(
                Arc::new(FsMediaSource::new(gallery)),
                BarcodeScreener::new(Arc::new(PassAllDetector)),
                ExpiryDateExtractor::new(recognizer),
                state.images.clone(),
                state.db.clone(),
            ));

            let (tx, mut rx) = mpsc::channel::<ScanProgress>(32);
            let reporter = tokio::spawn(async move {
                while let Some(progress) = rx.recv().await {
                    info!(
                        "{}: {}/{} ({} found)",
                        progress.stage, progress.current, progress.total, progress.found
                    );
                }
            });

            info!("scanning up to {MAX_GALLERY_IMAGES} most recent images");
            let done = state.start_gallery_scan(scanner, tx);
            let outcome = tokio::select! {
                outcome = done => outcome.context("scan task dropped")?,
                _ = tokio::signal::ctrl_c() => {
                    state.cancel_gallery_scan();
                    println!("scan cancelled");
                    return Ok(());
                }
            };
            let _ = reporter.await;

            println!("{}", outcome.message);
            if outcome.failed {
                bail!("gallery scan failed");
            }
        }
        Command::Notify { daemon } => {
            if daemon {
                state.schedule_expiry_check(Arc::new(LogSink), EXPIRY_CHECK_PERIOD);
                println!("expiry check scheduled every 24h; ctrl-c to stop");
                tokio::signal::ctrl_c().await?;
                state.cancel_expiry_check();
            } else {
                let count = run_expiry_check(&state.db, &LogSink, today_kst()).await?;
                println!("{count} notification(s) emitted");
            }
        }
        Command::Settings {
            enable,
            disable,
            days,
        } => {
            let mut settings = commands::get_notification_settings(&state)?;
            if enable {
                settings.enabled = true;
            }
            if disable {
                settings.enabled = false;
            }
            if let Some(days) = days {
                settings.days = NotificationSettings::decode_days(&days);
            }
            commands::save_notification_settings(&state, &settings, Arc::new(LogSink))?;
            println!(
                "notifications {} (lead-time days: {})",
                if settings.enabled { "enabled" } else { "disabled" },
                if settings.days.is_empty() {
                    "none".to_string()
                } else {
                    settings.encode_days()
                }
            );
        }
        Command::Analyze { image, backend } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let mime = match image.extension().and_then(|e| e.to_str()) {
                Some("jpg") | Some("jpeg") => Some("image/jpeg"),
                Some("png") => Some("image/png"),
                Some("webp") => Some("image/webp"),
                _ => None,
            };
            let client = AnalysisClient::new(backend);
            let result = client.analyze_image(&bytes, mime).await?;
            println!("{}", serde_json::to_string_pretty(&result.gifticon)?);
            if let Some(confidence) = result.confidence {
                println!("confidence: {confidence}");
            }
        }
        Command::Reset { yes } => {
            if !yes {
                bail!("refusing to wipe all data without --yes");
            }
            commands::reset_all_data(&state)?;
            println!("all gifticons and images deleted");
        }
    }

    Ok(())
}
