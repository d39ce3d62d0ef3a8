use chrono::{Days, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::PathBuf;
use tokio::sync::watch;

use crate::models::{Gifticon, GifticonCategory};
use crate::utils::format_iso_date;

/// Days ahead that still count as "expiring soon".
const EXPIRING_SOON_WINDOW_DAYS: u64 = 7;

const GIFTICON_COLUMNS: &str = "id, brandName, productName, expiryDate, amount, balance, \
     barcodeNumber, category, purchaseDate, notes, imagePath, isUsed, createdAt, updatedAt";

pub struct Database {
    conn: Connection,
    changes: watch::Sender<u64>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> SqlResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> SqlResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let (changes, _) = watch::channel(0);
        let mut db = Database { conn, changes };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&mut self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let migrations = vec![
            (
                "001_create_gifticons.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/001_create_gifticons.sql"
                )),
            ),
            (
                "002_create_settings.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/002_create_settings.sql"
                )),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                let tx = self.conn.transaction()?;
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, datetime('now'))",
                    params![name],
                )?;
                tx.commit()?;
            }
        }

        Ok(())
    }

    /// Observers receive a bumped revision whenever the table changes and
    /// re-run their query; there is no per-row delta.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|rev| *rev += 1);
    }

    pub fn get_all(&self) -> SqlResult<Vec<Gifticon>> {
        self.query_gifticons(
            &format!("SELECT {GIFTICON_COLUMNS} FROM gifticons ORDER BY expiryDate ASC"),
            params![],
        )
    }

    pub fn get_by_id(&self, id: i64) -> SqlResult<Option<Gifticon>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {GIFTICON_COLUMNS} FROM gifticons WHERE id = ?1"))?;
        stmt.query_row(params![id], map_gifticon).optional()
    }

    pub fn get_by_category(&self, category: GifticonCategory) -> SqlResult<Vec<Gifticon>> {
        self.query_gifticons(
            &format!(
                "SELECT {GIFTICON_COLUMNS} FROM gifticons WHERE category = ?1 ORDER BY expiryDate ASC"
            ),
            params![category.as_str()],
        )
    }

    /// Not used and not expired as of `today`. SQLite `date()` is NULL for
    /// values it cannot read as a date and NULL comparisons are false, so
    /// records with unparseable expiry dates stay out of every date-based
    /// view.
    pub fn get_active(&self, today: NaiveDate) -> SqlResult<Vec<Gifticon>> {
        self.query_gifticons(
            &format!(
                "SELECT {GIFTICON_COLUMNS} FROM gifticons \
                 WHERE isUsed = 0 AND date(expiryDate) >= date(?1) ORDER BY expiryDate ASC"
            ),
            params![format_iso_date(today)],
        )
    }

    /// Active and within `today + 7 days`.
    pub fn get_expiring_soon(&self, today: NaiveDate) -> SqlResult<Vec<Gifticon>> {
        let horizon = today
            .checked_add_days(Days::new(EXPIRING_SOON_WINDOW_DAYS))
            .unwrap_or(today);
        self.query_gifticons(
            &format!(
                "SELECT {GIFTICON_COLUMNS} FROM gifticons \
                 WHERE isUsed = 0 AND date(expiryDate) >= date(?1) AND date(expiryDate) <= date(?2) \
                 ORDER BY expiryDate ASC"
            ),
            params![format_iso_date(today), format_iso_date(horizon)],
        )
    }

    pub fn get_expired_or_used(&self, today: NaiveDate) -> SqlResult<Vec<Gifticon>> {
        self.query_gifticons(
            &format!(
                "SELECT {GIFTICON_COLUMNS} FROM gifticons \
                 WHERE date(expiryDate) < date(?1) OR isUsed = 1 ORDER BY expiryDate DESC"
            ),
            params![format_iso_date(today)],
        )
    }

    /// Case-insensitive substring match over brand and product name.
    pub fn search(&self, query: &str) -> SqlResult<Vec<Gifticon>> {
        let needle = format!("%{}%", query);
        self.query_gifticons(
            &format!(
                "SELECT {GIFTICON_COLUMNS} FROM gifticons \
                 WHERE brandName LIKE ?1 OR productName LIKE ?1 ORDER BY expiryDate ASC"
            ),
            params![needle],
        )
    }

    /// Returns the newly assigned row id.
    pub fn insert(&self, gifticon: &Gifticon) -> SqlResult<i64> {
        self.conn.execute(
            "INSERT INTO gifticons (
                brandName, productName, expiryDate, amount, balance, barcodeNumber,
                category, purchaseDate, notes, imagePath, isUsed, createdAt, updatedAt
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                gifticon.brand_name,
                gifticon.product_name,
                gifticon.expiry_date,
                gifticon.amount,
                gifticon.balance,
                gifticon.barcode_number,
                gifticon.category.as_str(),
                gifticon.purchase_date,
                gifticon.notes,
                gifticon.image_path,
                gifticon.is_used,
                gifticon.created_at,
                gifticon.updated_at,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.notify_changed();
        Ok(id)
    }

    pub fn update(&self, gifticon: &Gifticon) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE gifticons SET
                brandName = ?1, productName = ?2, expiryDate = ?3, amount = ?4,
                balance = ?5, barcodeNumber = ?6, category = ?7, purchaseDate = ?8,
                notes = ?9, imagePath = ?10, isUsed = ?11, updatedAt = ?12
             WHERE id = ?13",
            params![
                gifticon.brand_name,
                gifticon.product_name,
                gifticon.expiry_date,
                gifticon.amount,
                gifticon.balance,
                gifticon.barcode_number,
                gifticon.category.as_str(),
                gifticon.purchase_date,
                gifticon.notes,
                gifticon.image_path,
                gifticon.is_used,
                gifticon.updated_at,
                gifticon.id,
            ],
        )?;
        self.notify_changed();
        Ok(())
    }

    /// Removes the row only; releasing an associated image file is the
    /// caller's compensation (see `commands::delete_gifticon`).
    pub fn delete_by_id(&self, id: i64) -> SqlResult<()> {
        self.conn
            .execute("DELETE FROM gifticons WHERE id = ?1", params![id])?;
        self.notify_changed();
        Ok(())
    }

    pub fn delete_all(&self) -> SqlResult<()> {
        self.conn.execute("DELETE FROM gifticons", params![])?;
        self.notify_changed();
        Ok(())
    }

    pub fn update_balance(&self, id: i64, new_balance: i64, updated_at: i64) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE gifticons SET balance = ?1, updatedAt = ?2 WHERE id = ?3",
            params![new_balance, updated_at, id],
        )?;
        self.notify_changed();
        Ok(())
    }

    /// Marks the gifticon used and zeroes the balance; `amount` is untouched.
    pub fn mark_used(&self, id: i64, updated_at: i64) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE gifticons SET isUsed = 1, balance = 0, updatedAt = ?1 WHERE id = ?2",
            params![updated_at, id],
        )?;
        self.notify_changed();
        Ok(())
    }

    pub fn set_setting(&self, key: &str, value: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> SqlResult<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        stmt.query_row(params![key], |row| row.get(0)).optional()
    }

    fn query_gifticons(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> SqlResult<Vec<Gifticon>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, map_gifticon)?;
        rows.collect()
    }
}

fn map_gifticon(row: &Row<'_>) -> SqlResult<Gifticon> {
    let category: String = row.get(7)?;
    Ok(Gifticon {
        id: row.get(0)?,
        brand_name: row.get(1)?,
        product_name: row.get(2)?,
        expiry_date: row.get(3)?,
        amount: row.get(4)?,
        balance: row.get(5)?,
        barcode_number: row.get(6)?,
        category: category.parse().unwrap_or(GifticonCategory::Etc),
        purchase_date: row.get(8)?,
        notes: row.get(9)?,
        image_path: row.get(10)?,
        is_used: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}
