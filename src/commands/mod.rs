use anyhow::{anyhow, bail, Result};
use std::sync::{Arc, MutexGuard};

use crate::db::Database;
use crate::models::{Gifticon, GifticonCategory, NotificationSettings};
use crate::services::notifier::{self, NotificationSink};
use crate::services::state::{AppState, EXPIRY_CHECK_PERIOD};
use crate::utils::{now_millis, parse_iso_date, strip_file_scheme, today_kst};

fn lock_db(state: &AppState) -> Result<MutexGuard<'_, Database>> {
    state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))
}

pub fn list_all(state: &AppState) -> Result<Vec<Gifticon>> {
    Ok(lock_db(state)?.get_all()?)
}

pub fn list_active(state: &AppState) -> Result<Vec<Gifticon>> {
    Ok(lock_db(state)?.get_active(today_kst())?)
}

pub fn list_expiring_soon(state: &AppState) -> Result<Vec<Gifticon>> {
    Ok(lock_db(state)?.get_expiring_soon(today_kst())?)
}

pub fn list_expired_or_used(state: &AppState) -> Result<Vec<Gifticon>> {
    Ok(lock_db(state)?.get_expired_or_used(today_kst())?)
}

pub fn list_by_category(state: &AppState, category: GifticonCategory) -> Result<Vec<Gifticon>> {
    Ok(lock_db(state)?.get_by_category(category)?)
}

pub fn search_gifticons(state: &AppState, query: &str) -> Result<Vec<Gifticon>> {
    Ok(lock_db(state)?.search(query)?)
}

pub fn get_gifticon(state: &AppState, id: i64) -> Result<Gifticon> {
    lock_db(state)?
        .get_by_id(id)?
        .ok_or_else(|| anyhow!("gifticon {id} not found"))
}

/// Validates and inserts a new record, returning its assigned id. The expiry
/// date must already be in ISO `YYYY-MM-DD` form.
pub fn add_gifticon(state: &AppState, gifticon: &Gifticon) -> Result<i64> {
    if gifticon.brand_name.trim().is_empty() {
        bail!("brand name must not be empty");
    }
    if parse_iso_date(&gifticon.expiry_date).is_none() {
        bail!("invalid expiry date: {}", gifticon.expiry_date);
    }
    Ok(lock_db(state)?.insert(gifticon)?)
}

pub fn update_gifticon(state: &AppState, gifticon: &Gifticon) -> Result<()> {
    if parse_iso_date(&gifticon.expiry_date).is_none() {
        bail!("invalid expiry date: {}", gifticon.expiry_date);
    }
    let db = lock_db(state)?;
    if db.get_by_id(gifticon.id)?.is_none() {
        bail!("gifticon {} not found", gifticon.id);
    }
    let mut updated = gifticon.clone();
    updated.updated_at = now_millis();
    db.update(&updated)?;
    Ok(())
}

/// Records a partial redemption. `balance <= amount` is an expectation, not
/// a rule; only negative input and used-up gifticons are rejected.
pub fn update_balance(state: &AppState, id: i64, new_balance: i64) -> Result<()> {
    let db = lock_db(state)?;
    let gifticon = db
        .get_by_id(id)?
        .ok_or_else(|| anyhow!("gifticon {id} not found"))?;
    if gifticon.is_used {
        bail!("gifticon {id} is already used up");
    }
    if new_balance < 0 {
        bail!("balance cannot be negative: {new_balance}");
    }
    db.update_balance(id, new_balance, now_millis())?;
    Ok(())
}

pub fn mark_used(state: &AppState, id: i64) -> Result<()> {
    let db = lock_db(state)?;
    if db.get_by_id(id)?.is_none() {
        bail!("gifticon {id} not found");
    }
    db.mark_used(id, now_millis())?;
    Ok(())
}

/// Deletes the record and releases its stored image. The image goes first so
/// a failed row delete never leaves an unreferenced file claiming to exist.
pub fn delete_gifticon(state: &AppState, id: i64) -> Result<()> {
    let db = lock_db(state)?;
    let gifticon = db
        .get_by_id(id)?
        .ok_or_else(|| anyhow!("gifticon {id} not found"))?;
    if let Some(path) = &gifticon.image_path {
        state.images.delete(strip_file_scheme(path));
    }
    db.delete_by_id(id)?;
    Ok(())
}

pub fn get_notification_settings(state: &AppState) -> Result<NotificationSettings> {
    let db = lock_db(state)?;
    Ok(notifier::load_notification_settings(&db)?)
}

/// Persists the settings and reconciles the background job: enabled with at
/// least one lead-time day keeps a (re)scheduled check, anything else
/// cancels it.
pub fn save_notification_settings(
    state: &AppState,
    settings: &NotificationSettings,
    sink: Arc<dyn NotificationSink>,
) -> Result<()> {
    {
        let db = lock_db(state)?;
        notifier::save_notification_settings(&db, settings)?;
    }
    if settings.enabled && !settings.days.is_empty() {
        state.schedule_expiry_check(sink, EXPIRY_CHECK_PERIOD);
    } else {
        state.cancel_expiry_check();
    }
    Ok(())
}

/// Wipes every gifticon row and every stored image file.
pub fn reset_all_data(state: &AppState) -> Result<()> {
    lock_db(state)?.delete_all()?;
    state.images.clear_all();
    Ok(())
}
