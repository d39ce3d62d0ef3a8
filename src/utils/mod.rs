use chrono::{FixedOffset, NaiveDate, Utc};

/// All civil-date comparisons are anchored to Korea Standard Time.
const KST_OFFSET_SECS: i32 = 9 * 3600;

pub const FILE_SCHEME: &str = "file://";

pub fn today_kst() -> NaiveDate {
    let kst = FixedOffset::east_opt(KST_OFFSET_SECS).expect("valid KST offset");
    Utc::now().with_timezone(&kst).date_naive()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

pub fn format_iso_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Whole days from `today` to `expiry`; negative when already expired.
pub fn days_until(expiry: NaiveDate, today: NaiveDate) -> i64 {
    expiry.signed_duration_since(today).num_days()
}

pub fn strip_file_scheme(path: &str) -> &str {
    path.strip_prefix(FILE_SCHEME).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_date_round_trip() {
        let date = parse_iso_date("2025-03-15").unwrap();
        assert_eq!(format_iso_date(date), "2025-03-15");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_iso_date("not-a-date").is_none());
        assert!(parse_iso_date("2025-13-01").is_none());
        assert!(parse_iso_date("").is_none());
    }

    #[test]
    fn days_until_counts_civil_days() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let expiry = NaiveDate::from_ymd_opt(2025, 3, 8).unwrap();
        assert_eq!(days_until(expiry, today), 7);
        assert_eq!(days_until(today, today), 0);
        assert_eq!(days_until(today, expiry), -7);
    }

    #[test]
    fn strips_file_scheme_only_when_present() {
        assert_eq!(strip_file_scheme("file:///data/img.jpg"), "/data/img.jpg");
        assert_eq!(strip_file_scheme("/data/img.jpg"), "/data/img.jpg");
    }
}
