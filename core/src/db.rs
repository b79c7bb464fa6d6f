use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{DiaryEntry, NutritionReference};
use crate::nutrition::{Macros, ScaledNutrition};
use crate::resolver::{ReferenceStore, fold_name};
use crate::scan::DiaryStore;

pub struct Database {
    conn: Connection,
}

const REFERENCE_COLUMNS: &str = "id, name_vi, name_en, category, reference_serving_g, \
     calories, protein_g, carbs_g, fat_g, fiber_g";

const DIARY_COLUMNS: &str = "id, user_id, food_reference_id, food_name, meal_type, quantity, \
     serving_g, calories, protein_g, carbs_g, fat_g, fiber_g, logged_at";

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS food_references (
                    id TEXT PRIMARY KEY,
                    name_vi TEXT NOT NULL,
                    name_en TEXT,
                    name_vi_folded TEXT NOT NULL,
                    name_en_folded TEXT,
                    category TEXT,
                    reference_serving_g REAL NOT NULL,
                    calories REAL,
                    protein_g REAL,
                    carbs_g REAL,
                    fat_g REAL,
                    fiber_g REAL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS diary_entries (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    food_reference_id TEXT,
                    food_name TEXT NOT NULL,
                    meal_type TEXT NOT NULL,
                    quantity REAL NOT NULL,
                    serving_g REAL NOT NULL,
                    calories INTEGER,
                    protein_g INTEGER,
                    carbs_g INTEGER,
                    fat_g INTEGER,
                    fiber_g INTEGER,
                    logged_at TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_food_references_name ON food_references(name_vi);
                CREATE INDEX IF NOT EXISTS idx_diary_entries_user_logged
                    ON diary_entries(user_id, logged_at);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn reference_from_row(row: &rusqlite::Row) -> rusqlite::Result<NutritionReference> {
        Ok(NutritionReference {
            id: row.get(0)?,
            name_vi: row.get(1)?,
            name_en: row.get(2)?,
            category: row.get(3)?,
            reference_serving_g: row.get(4)?,
            per_serving: Macros {
                calories: row.get(5)?,
                protein_g: row.get(6)?,
                carbs_g: row.get(7)?,
                fat_g: row.get(8)?,
                fiber_g: row.get(9)?,
            },
        })
    }

    // Macro columns are all NULL for unmatched foods.
    fn diary_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<DiaryEntry> {
        let calories: Option<u32> = row.get(7)?;
        let nutrition = match calories {
            Some(calories) => Some(ScaledNutrition {
                calories,
                protein_g: row.get::<_, Option<u32>>(8)?.unwrap_or_default(),
                carbs_g: row.get::<_, Option<u32>>(9)?.unwrap_or_default(),
                fat_g: row.get::<_, Option<u32>>(10)?.unwrap_or_default(),
                fiber_g: row.get::<_, Option<u32>>(11)?.unwrap_or_default(),
            }),
            None => None,
        };
        Ok(DiaryEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            food_reference_id: row.get(2)?,
            food_name: row.get(3)?,
            meal_type: row.get(4)?,
            quantity: row.get(5)?,
            serving_g: row.get(6)?,
            nutrition,
            logged_at: row.get(12)?,
        })
    }

    // --- Reference records ---

    /// Insert a reference record, replacing any existing record with the same id.
    ///
    /// Returns `true` when a new record was created.
    pub fn upsert_reference(&self, reference: &NutritionReference) -> Result<bool> {
        let existed = self.get_reference(&reference.id)?.is_some();
        let now = Local::now().to_rfc3339();
        let m = &reference.per_serving;
        self.conn.execute(
            "INSERT INTO food_references (id, name_vi, name_en, name_vi_folded, name_en_folded, category,
                 reference_serving_g, calories, protein_g, carbs_g, fat_g, fiber_g, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
             ON CONFLICT(id) DO UPDATE SET
                 name_vi = excluded.name_vi,
                 name_en = excluded.name_en,
                 name_vi_folded = excluded.name_vi_folded,
                 name_en_folded = excluded.name_en_folded,
                 category = excluded.category,
                 reference_serving_g = excluded.reference_serving_g,
                 calories = excluded.calories,
                 protein_g = excluded.protein_g,
                 carbs_g = excluded.carbs_g,
                 fat_g = excluded.fat_g,
                 fiber_g = excluded.fiber_g,
                 updated_at = excluded.updated_at",
            params![
                reference.id,
                reference.name_vi,
                reference.name_en,
                fold_name(&reference.name_vi),
                reference.name_en.as_deref().map(fold_name),
                reference.category,
                reference.reference_serving_g,
                m.calories,
                m.protein_g,
                m.carbs_g,
                m.fat_g,
                m.fiber_g,
                now,
            ],
        )?;
        Ok(!existed)
    }

    pub fn get_reference(&self, id: &str) -> Result<Option<NutritionReference>> {
        let reference = self
            .conn
            .query_row(
                &format!("SELECT {REFERENCE_COLUMNS} FROM food_references WHERE id = ?1"),
                params![id],
                Self::reference_from_row,
            )
            .optional()?;
        Ok(reference)
    }

    pub fn list_references(&self, limit: usize) -> Result<Vec<NutritionReference>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REFERENCE_COLUMNS} FROM food_references ORDER BY name_vi LIMIT ?1"
        ))?;
        let references = stmt
            .query_map(params![limit_param(limit)], Self::reference_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(references)
    }

    pub fn count_references(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM food_references", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Substring search over the case-folded name columns.
    pub fn search_references_folded(
        &self,
        folded_query: &str,
        limit: usize,
    ) -> Result<Vec<NutritionReference>> {
        let escaped = folded_query
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{escaped}%");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REFERENCE_COLUMNS} FROM food_references
             WHERE name_vi_folded LIKE ?1 ESCAPE '\\' OR name_en_folded LIKE ?1 ESCAPE '\\'
             ORDER BY name_vi LIMIT ?2"
        ))?;
        let references = stmt
            .query_map(
                params![pattern, limit_param(limit)],
                Self::reference_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(references)
    }

    pub fn delete_reference(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM food_references WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // --- Diary ---

    /// Append a diary entry. Fails if an entry with the same id exists.
    pub fn insert_diary_entry(&self, entry: &DiaryEntry) -> Result<()> {
        let now = Local::now().to_rfc3339();
        let n = entry.nutrition;
        self.conn
            .execute(
                "INSERT INTO diary_entries (id, user_id, food_reference_id, food_name, meal_type, quantity,
                     serving_g, calories, protein_g, carbs_g, fat_g, fiber_g, logged_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    entry.id,
                    entry.user_id,
                    entry.food_reference_id,
                    entry.food_name,
                    entry.meal_type,
                    entry.quantity,
                    entry.serving_g,
                    n.map(|n| n.calories),
                    n.map(|n| n.protein_g),
                    n.map(|n| n.carbs_g),
                    n.map(|n| n.fat_g),
                    n.map(|n| n.fiber_g),
                    entry.logged_at,
                    now,
                ],
            )
            .with_context(|| format!("Failed to insert diary entry {}", entry.id))?;
        Ok(())
    }

    pub fn get_diary_entry(&self, id: &str) -> Result<DiaryEntry> {
        self.conn
            .query_row(
                &format!("SELECT {DIARY_COLUMNS} FROM diary_entries WHERE id = ?1"),
                params![id],
                Self::diary_entry_from_row,
            )
            .context("Diary entry not found")
    }

    /// Entries for `user_id` logged on `date` (local date prefix of `logged_at`).
    pub fn get_diary_entries_for_date(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DiaryEntry>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DIARY_COLUMNS} FROM diary_entries
             WHERE user_id = ?1 AND substr(logged_at, 1, 10) = ?2
             ORDER BY logged_at, created_at"
        ))?;
        let entries = stmt
            .query_map(params![user_id, date_str], Self::diary_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_diary_entry(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM diary_entries WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn build_daily_totals(&self, user_id: &str, date: NaiveDate) -> Result<ScaledNutrition> {
        let entries = self.get_diary_entries_for_date(user_id, date)?;
        Ok(entries.iter().filter_map(|e| e.nutrition).sum())
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl ReferenceStore for Database {
    fn search_references(
        &self,
        folded_query: &str,
        limit: usize,
    ) -> Result<Vec<NutritionReference>> {
        self.search_references_folded(folded_query, limit)
    }
}

impl DiaryStore for Database {
    fn insert_diary_entry(&self, entry: &DiaryEntry) -> Result<()> {
        Database::insert_diary_entry(self, entry)
    }
}
