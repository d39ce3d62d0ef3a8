use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::utils::now_millis;

/// One mobile gift voucher. `expiry_date` is an ISO `YYYY-MM-DD` string with
/// no time component; `id == 0` means the record has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gifticon {
    pub id: i64,
    pub brand_name: String,
    pub product_name: Option<String>,
    pub expiry_date: String,
    pub amount: i64,
    pub balance: i64,
    pub barcode_number: Option<String>,
    pub category: GifticonCategory,
    pub purchase_date: Option<String>,
    pub notes: Option<String>,
    pub image_path: Option<String>,
    pub is_used: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Gifticon {
    pub fn new(brand_name: impl Into<String>, expiry_date: impl Into<String>) -> Self {
        let now = now_millis();
        Gifticon {
            id: 0,
            brand_name: brand_name.into(),
            product_name: None,
            expiry_date: expiry_date.into(),
            amount: 0,
            balance: 0,
            barcode_number: None,
            category: GifticonCategory::Etc,
            purchase_date: None,
            notes: None,
            image_path: None,
            is_used: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn display_name(&self) -> &str {
        self.product_name.as_deref().unwrap_or(&self.brand_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GifticonCategory {
    Cafe,
    Movie,
    ConvenienceStore,
    Chicken,
    FastFood,
    Beauty,
    Shopping,
    Etc,
}

impl GifticonCategory {
    /// Stable storage/wire form, shared with the existing external schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            GifticonCategory::Cafe => "CAFE",
            GifticonCategory::Movie => "MOVIE",
            GifticonCategory::ConvenienceStore => "CONVENIENCE_STORE",
            GifticonCategory::Chicken => "CHICKEN",
            GifticonCategory::FastFood => "FAST_FOOD",
            GifticonCategory::Beauty => "BEAUTY",
            GifticonCategory::Shopping => "SHOPPING",
            GifticonCategory::Etc => "ETC",
        }
    }
}

impl FromStr for GifticonCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "CAFE" => Ok(GifticonCategory::Cafe),
            "MOVIE" => Ok(GifticonCategory::Movie),
            "CONVENIENCE_STORE" => Ok(GifticonCategory::ConvenienceStore),
            "CHICKEN" => Ok(GifticonCategory::Chicken),
            "FAST_FOOD" => Ok(GifticonCategory::FastFood),
            "BEAUTY" => Ok(GifticonCategory::Beauty),
            "SHOPPING" => Ok(GifticonCategory::Shopping),
            "ETC" => Ok(GifticonCategory::Etc),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

impl fmt::Display for GifticonCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient result of the expiry-text extractor; consumed immediately to
/// seed a new gifticon, never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedGifticonInfo {
    pub expiry_date: Option<String>,
}

/// Notification preferences: an enabled flag plus distinct lead-time day
/// counts, persisted as a flat key/value pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub days: BTreeSet<u32>,
}

impl NotificationSettings {
    pub fn add_day(&mut self, days: u32) {
        self.days.insert(days);
    }

    pub fn remove_day(&mut self, days: u32) {
        self.days.remove(&days);
    }

    pub fn encode_days(&self) -> String {
        self.days
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn decode_days(raw: &str) -> BTreeSet<u32> {
        raw.split(',')
            .filter_map(|part| part.trim().parse::<u32>().ok())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanStage {
    Loading,
    BarcodeScan,
    OcrProcessing,
    Saving,
}

impl fmt::Display for ScanStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScanStage::Loading => "loading gallery images",
            ScanStage::BarcodeScan => "screening for barcodes",
            ScanStage::OcrProcessing => "analyzing gifticon candidates",
            ScanStage::Saving => "saving gifticons",
        };
        f.write_str(label)
    }
}

/// Progress report emitted while a gallery scan runs. `current`/`total` are
/// scoped to the stage; `found` is the positives discovered so far.
#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub stage: ScanStage,
    pub current: usize,
    pub total: usize,
    pub found: usize,
}

/// Completion signal for one gallery scan run.
#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub saved_count: usize,
    pub failed: bool,
    pub message: String,
}

impl ScanOutcome {
    pub fn success(saved_count: usize, message: impl Into<String>) -> Self {
        ScanOutcome {
            saved_count,
            failed: false,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        ScanOutcome {
            saved_count: 0,
            failed: true,
            message: message.into(),
        }
    }
}

/// Best-guess record returned by the cloud image-analysis backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedGifticon {
    pub brand_name: String,
    pub product_name: Option<String>,
    pub expiry_date: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub balance: i64,
    pub barcode_number: Option<String>,
    pub category: Option<String>,
    pub purchase_date: Option<String>,
}
