use chrono::{Datelike, NaiveDate};
use image::DynamicImage;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::ExtractedGifticonInfo;
use crate::services::vision::TextRecognizer;
use crate::utils::{format_iso_date, today_kst};

/// Years outside this range are treated as OCR noise rather than dates.
const REALISTIC_YEARS: std::ops::RangeInclusive<i32> = 2024..=2030;
/// Two-digit years read as 20xx within this window.
const SHORT_YEARS: std::ops::RangeInclusive<i64> = 20..=30;

/// A line mentioning any of these is treated as naming the expiry date.
const EXPIRY_KEYWORDS: [&str; 9] = [
    "만료",
    "유효기간",
    "사용기한",
    "expiry",
    "valid",
    "until",
    "기한",
    "기간",
    "~까지",
];

/// Runs text recognition over an image and pulls a plausible expiry date out
/// of the result. Best-effort: recognition or decode failures yield an empty
/// result, never an error.
pub struct ExpiryDateExtractor {
    recognizer: Arc<dyn TextRecognizer>,
}

impl ExpiryDateExtractor {
    pub fn new(recognizer: Arc<dyn TextRecognizer>) -> Self {
        ExpiryDateExtractor { recognizer }
    }

    pub async fn extract(&self, bytes: &[u8]) -> ExtractedGifticonInfo {
        let image = match image::load_from_memory(bytes) {
            Ok(image) => image,
            Err(err) => {
                warn!("bitmap decode failed: {err}");
                return ExtractedGifticonInfo::default();
            }
        };
        self.extract_from_image(&image).await
    }

    pub async fn extract_from_image(&self, image: &DynamicImage) -> ExtractedGifticonInfo {
        let text = match self.recognizer.recognize(image).await {
            Ok(text) => text,
            Err(err) => {
                warn!("text recognition failed: {err}");
                return ExtractedGifticonInfo::default();
            }
        };
        debug!("recognized {} chars of text", text.len());
        ExtractedGifticonInfo {
            expiry_date: find_expiry_date(&text, today_kst()),
        }
    }
}

/// Heuristically locates a plausible expiry date in recognized text.
///
/// Tiers, first hit wins:
/// 1. a date-pattern match on a line carrying an expiry keyword (no future
///    check at this tier);
/// 2. three consecutive free-standing numbers forming a today-or-later date,
///    with either a full year in 2024..=2030 or a short year in 20..=30;
/// 3. any date-pattern match anywhere that parses to a today-or-later date
///    in the realistic year range;
/// 4. any bare 8-digit number read as `YYYYMMDD` under the same rules.
///
/// Known limitation: with no keyword present, a purchase date can win over
/// the actual expiry date; tie-breaking is purely tier-then-position.
pub fn find_expiry_date(text: &str, today: NaiveDate) -> Option<String> {
    let patterns = date_patterns();
    let numbers = extract_numbers(text);

    // 1. keyword-adjacent date
    for line in text.lines() {
        let lowered = line.to_lowercase();
        if !EXPIRY_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
            continue;
        }
        for pattern in &patterns {
            if let Some(found) = pattern.find(line) {
                if let Some(date) = parse_date(found.as_str()) {
                    debug!("expiry from keyword line: {}", found.as_str());
                    return Some(format_iso_date(date));
                }
            }
        }
    }

    // 2. three consecutive free-standing numbers
    for triple in numbers.windows(3) {
        let (year, month, day) = match (
            triple[0].parse::<i64>(),
            triple[1].parse::<i64>(),
            triple[2].parse::<i64>(),
        ) {
            (Ok(y), Ok(m), Ok(d)) => (y, m, d),
            _ => continue,
        };

        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            continue;
        }
        let full_year = if REALISTIC_YEARS.contains(&(year as i32)) {
            year as i32
        } else if SHORT_YEARS.contains(&year) {
            2000 + year as i32
        } else {
            continue;
        };

        if let Some(date) = NaiveDate::from_ymd_opt(full_year, month as u32, day as u32) {
            if date >= today {
                debug!("expiry from number triple: {year} {month} {day}");
                return Some(format_iso_date(date));
            }
        }
    }

    // 3. any future date anywhere in the text
    for pattern in &patterns {
        for found in pattern.find_iter(text) {
            if let Some(date) = parse_date(found.as_str()) {
                if date >= today && REALISTIC_YEARS.contains(&date.year()) {
                    debug!("expiry from free pattern: {}", found.as_str());
                    return Some(format_iso_date(date));
                }
            }
        }
    }

    // 4. bare 8-digit numbers as YYYYMMDD
    for number in &numbers {
        if number.len() != 8 {
            continue;
        }
        let (year, month, day) = match (
            number[0..4].parse::<i32>(),
            number[4..6].parse::<u32>(),
            number[6..8].parse::<u32>(),
        ) {
            (Ok(y), Ok(m), Ok(d)) => (y, m, d),
            _ => continue,
        };
        if !REALISTIC_YEARS.contains(&year) || !(1..=12).contains(&month) || !(1..=31).contains(&day)
        {
            continue;
        }
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            if date >= today {
                debug!("expiry from 8-digit number: {number}");
                return Some(format_iso_date(date));
            }
        }
    }

    None
}

/// The eight date grammars, in match priority order. `-`, `/` and `.` are
/// equivalent separators.
fn date_patterns() -> Vec<Regex> {
    [
        r"(\d{4})[-/](\d{1,2})[-/](\d{1,2})", // YYYY-MM-DD, YYYY/MM/DD
        r"(\d{1,2})[-/](\d{1,2})[-/](\d{4})", // MM-DD-YYYY, MM/DD/YYYY
        r"(\d{4})\.(\d{1,2})\.(\d{1,2})",     // YYYY.MM.DD
        r"(\d{1,2})\.(\d{1,2})\.(\d{4})",     // MM.DD.YYYY
        r"(\d{2})\.(\d{2})\.(\d{2})",         // YY.MM.DD
        r"(\d{2})[-/](\d{2})[-/](\d{2})",     // YY-MM-DD, YY/MM/DD
        r"(\d{4})(\d{2})(\d{2})",             // YYYYMMDD
        r"(\d{2})(\d{2})(\d{4})",             // MMDDYYYY
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid date pattern"))
    .collect()
}

fn extract_numbers(text: &str) -> Vec<String> {
    let digits = Regex::new(r"\d+").expect("valid digits pattern");
    digits.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    const FORMATS: [&str; 11] = [
        "%Y-%m-%d", "%Y/%m/%d", "%m-%d-%Y", "%m/%d/%Y", "%Y.%m.%d", "%m.%d.%Y", "%y.%m.%d",
        "%y-%m-%d", "%y/%m/%d", "%Y%m%d", "%m%d%Y",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}
