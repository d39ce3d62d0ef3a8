use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::Result as SqlResult;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::db::Database;
use crate::models::{Gifticon, NotificationSettings};
use crate::utils::{days_until, parse_iso_date};

pub const NOTIFICATION_ENABLED_KEY: &str = "notification_enabled";
pub const NOTIFICATION_DAYS_KEY: &str = "notification_days";

/// Delivery boundary for user notifications; the platform channel behind it
/// is not this crate's concern.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_expiry(&self, gifticon: &Gifticon, days_left: i64) -> Result<()>;
}

/// Sink that reports through the log, used by the CLI.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify_expiry(&self, gifticon: &Gifticon, days_left: i64) -> Result<()> {
        if days_left == 0 {
            info!("'{}' expires today", gifticon.display_name());
        } else {
            info!("'{}' expires in {days_left} day(s)", gifticon.display_name());
        }
        Ok(())
    }
}

pub fn load_notification_settings(db: &Database) -> SqlResult<NotificationSettings> {
    let enabled = db
        .get_setting(NOTIFICATION_ENABLED_KEY)?
        .map(|v| v == "1")
        .unwrap_or(false);
    let days = db
        .get_setting(NOTIFICATION_DAYS_KEY)?
        .map(|raw| NotificationSettings::decode_days(&raw))
        .unwrap_or_default();
    Ok(NotificationSettings { enabled, days })
}

pub fn save_notification_settings(db: &Database, settings: &NotificationSettings) -> SqlResult<()> {
    db.set_setting(NOTIFICATION_ENABLED_KEY, if settings.enabled { "1" } else { "0" })?;
    db.set_setting(NOTIFICATION_DAYS_KEY, &settings.encode_days())?;
    Ok(())
}

/// One expiry-check run: for every stored gifticon whose expiry lands on a
/// configured lead-time day (today-or-later), emit a notification. Recomputes
/// from scratch each run; no dedup token is kept, so a manual trigger plus
/// the scheduled run on the same day notifies twice.
pub async fn run_expiry_check(
    db: &Arc<Mutex<Database>>,
    sink: &dyn NotificationSink,
    today: NaiveDate,
) -> Result<usize> {
    let (settings, gifticons) = {
        let db = db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
        let settings = load_notification_settings(&db)?;
        if !settings.enabled || settings.days.is_empty() {
            return Ok(0);
        }
        (settings, db.get_all()?)
    };

    let mut notified = 0;
    for gifticon in &gifticons {
        // unparseable expiry dates are silently skipped
        let expiry = match parse_iso_date(&gifticon.expiry_date) {
            Some(date) => date,
            None => continue,
        };
        let days_left = days_until(expiry, today);
        if days_left >= 0 && settings.days.contains(&(days_left as u32)) {
            if let Err(err) = sink.notify_expiry(gifticon, days_left).await {
                warn!("notification delivery failed for id {}: {err}", gifticon.id);
                continue;
            }
            notified += 1;
        }
    }

    info!("expiry check emitted {notified} notification(s)");
    Ok(notified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Gifticon;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify_expiry(&self, gifticon: &Gifticon, days_left: i64) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((gifticon.display_name().to_string(), days_left));
            Ok(())
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn setup(enabled: bool, days: &[u32]) -> Arc<Mutex<Database>> {
        let db = Database::open_in_memory().unwrap();
        let mut settings = NotificationSettings {
            enabled,
            ..Default::default()
        };
        for d in days {
            settings.add_day(*d);
        }
        save_notification_settings(&db, &settings).unwrap();
        Arc::new(Mutex::new(db))
    }

    #[tokio::test]
    async fn matching_lead_time_notifies_once() {
        let db = setup(true, &[1, 7]);
        {
            let db = db.lock().unwrap();
            db.insert(&Gifticon::new("in-seven", "2025-03-08")).unwrap();
            db.insert(&Gifticon::new("in-eight", "2025-03-09")).unwrap();
        }

        let sink = RecordingSink::default();
        let count = run_expiry_check(&db, &sink, day(2025, 3, 1)).await.unwrap();
        assert_eq!(count, 1);
        let events = sink.events.lock().unwrap();
        assert_eq!(events.as_slice(), &[("in-seven".to_string(), 7)]);
    }

    #[tokio::test]
    async fn disabled_or_empty_settings_are_a_noop() {
        for db in [setup(false, &[7]), setup(true, &[])] {
            {
                let db = db.lock().unwrap();
                db.insert(&Gifticon::new("in-seven", "2025-03-08")).unwrap();
            }
            let sink = RecordingSink::default();
            let count = run_expiry_check(&db, &sink, day(2025, 3, 1)).await.unwrap();
            assert_eq!(count, 0);
            assert!(sink.events.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn already_expired_is_never_notified() {
        let db = setup(true, &[0, 7]);
        {
            let db = db.lock().unwrap();
            db.insert(&Gifticon::new("expired", "2025-02-20")).unwrap();
            db.insert(&Gifticon::new("today", "2025-03-01")).unwrap();
        }

        let sink = RecordingSink::default();
        let count = run_expiry_check(&db, &sink, day(2025, 3, 1)).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            sink.events.lock().unwrap().as_slice(),
            &[("today".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn unparseable_expiry_is_skipped() {
        let db = setup(true, &[7]);
        {
            let db = db.lock().unwrap();
            db.insert(&Gifticon::new("bad-date", "언젠가")).unwrap();
            db.insert(&Gifticon::new("good", "2025-03-08")).unwrap();
        }

        let sink = RecordingSink::default();
        let count = run_expiry_check(&db, &sink, day(2025, 3, 1)).await.unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn settings_round_trip_through_the_flat_store() {
        let db = Database::open_in_memory().unwrap();
        let mut settings = NotificationSettings {
            enabled: true,
            ..Default::default()
        };
        settings.add_day(1);
        settings.add_day(30);
        save_notification_settings(&db, &settings).unwrap();

        let loaded = load_notification_settings(&db).unwrap();
        assert_eq!(loaded, settings);

        // defaults when nothing was saved yet
        let fresh = Database::open_in_memory().unwrap();
        let loaded = load_notification_settings(&fresh).unwrap();
        assert!(!loaded.enabled);
        assert!(loaded.days.is_empty());
    }
}
