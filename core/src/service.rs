use std::io::Read;
use std::path::Path;

use anyhow::Result;
use chrono::NaiveDate;

use crate::db::Database;
use crate::models::{
    DiaryDay, DiaryEntry, ImportSummary, NutritionReference, ResolvedFoodItem, ServingHints,
    validate_reference,
};
use crate::reference_import;
use crate::resolver::find_candidates;
use crate::scan::{ScanError, ScanOutcome, ScanPipeline, ScanRequest};
use crate::vision::{ImageInput, VisionError, VisionInference};

/// Facade over the local database and the scan pipeline.
///
/// Front ends (CLI, HTTP server) go through this rather than wiring the
/// store and pipeline together themselves.
pub struct PlatescanService {
    db: Database,
    pipeline: ScanPipeline,
}

impl PlatescanService {
    pub fn new(db_path: &Path) -> Result<Self> {
        let db = Database::open(db_path)?;
        Ok(Self::from_database(db))
    }

    pub fn new_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::from_database(db))
    }

    #[must_use]
    pub fn from_database(db: Database) -> Self {
        Self {
            db,
            pipeline: ScanPipeline::new(),
        }
    }

    // --- Scanning ---

    pub async fn resolve_food_image<V>(
        &self,
        vision: &V,
        image: &ImageInput,
        locale: &str,
        hints: &ServingHints,
    ) -> Result<Vec<ResolvedFoodItem>, VisionError>
    where
        V: VisionInference,
    {
        self.pipeline
            .resolve_food_image(vision, &self.db, image, locale, hints)
            .await
    }

    pub async fn scan_and_log<V>(
        &self,
        vision: &V,
        request: &ScanRequest,
    ) -> Result<ScanOutcome, ScanError>
    where
        V: VisionInference,
    {
        self.pipeline
            .scan_and_log(vision, &self.db, &self.db, request)
            .await
    }

    /// Finish a scan whose vision call already ran: resolve, log when
    /// requested, and total.
    pub fn complete_scan(
        &self,
        raw: &str,
        request: &ScanRequest,
    ) -> Result<ScanOutcome, ScanError> {
        self.pipeline.complete(&self.db, &self.db, raw, request)
    }

    /// Resolve an already-fetched vision response against the local store.
    #[must_use]
    pub fn resolve_raw(
        &self,
        raw: &str,
        locale: &str,
        hints: &ServingHints,
    ) -> Vec<ResolvedFoodItem> {
        self.pipeline.resolve_response(&self.db, raw, locale, hints)
    }

    // --- Reference records ---

    #[must_use]
    pub fn search_references(&self, query: &str, locale: &str) -> Vec<NutritionReference> {
        find_candidates(&self.db, query, locale)
    }

    pub fn get_reference(&self, id: &str) -> Result<Option<NutritionReference>> {
        self.db.get_reference(id)
    }

    /// Remove a reference record. Diary entries keep their copied nutrition.
    pub fn delete_reference(&self, id: &str) -> Result<bool> {
        self.db.delete_reference(id)
    }

    pub fn list_references(&self, limit: usize) -> Result<Vec<NutritionReference>> {
        self.db.list_references(limit)
    }

    /// Validate and store a reference record. Returns `true` if it was new.
    pub fn add_reference(&self, reference: &NutritionReference) -> Result<bool> {
        validate_reference(reference)?;
        self.db.upsert_reference(reference)
    }

    pub fn import_references_csv<R: Read>(
        &self,
        reader: R,
        dry_run: bool,
    ) -> Result<ImportSummary> {
        let references = reference_import::parse_reference_csv(reader)?;
        reference_import::import_references(&self.db, &references, dry_run)
    }

    // --- Diary ---

    pub fn diary_day(&self, user_id: &str, date: &str) -> Result<DiaryDay> {
        let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d")?;
        let entries = self.db.get_diary_entries_for_date(user_id, parsed)?;
        let totals = entries.iter().filter_map(|e| e.nutrition).sum();
        Ok(DiaryDay {
            date: parsed.format("%Y-%m-%d").to_string(),
            user_id: user_id.to_string(),
            entries,
            totals,
        })
    }

    pub fn get_diary_entry(&self, id: &str) -> Result<DiaryEntry> {
        self.db.get_diary_entry(id)
    }

    pub fn delete_diary_entry(&self, id: &str) -> Result<bool> {
        self.db.delete_diary_entry(id)
    }
}
