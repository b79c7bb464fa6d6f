//! The scan pipeline: vision call, detection parsing, reference resolution,
//! scaling and optional diary logging.
//!
//! Each scan is a single pass with no persisted intermediate state. Diary
//! writes are attempted one by one; a failed write is reported and the
//! remaining entries are still written, with no rollback of earlier ones.

use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::detection::{DetectionParser, HeuristicParser};
use crate::models::{DiaryEntry, FoodDetection, ResolvedFoodItem, ServingHints, validate_meal_type};
use crate::nutrition::ScaledNutrition;
use crate::resolver::{ReferenceStore, find_candidates};
use crate::vision::{ImageInput, VisionError, VisionInference};

/// Serving weight used when neither the model nor the reference gives one.
pub const DEFAULT_SERVING_G: f64 = 100.0;

/// Maximum number of alternative references kept per item.
pub const MAX_ALTERNATIVES: usize = 4;

/// Append-only diary persistence.
pub trait DiaryStore {
    /// Insert `entry` under its caller-supplied id.
    fn insert_diary_entry(&self, entry: &DiaryEntry) -> Result<()>;
}

/// One failed diary write within a batch.
#[derive(Debug, Clone, Error, Serialize)]
#[error("failed to log item {index} (entry {entry_id}): {message}")]
pub struct PersistenceError {
    pub index: usize,
    pub entry_id: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Vision(#[from] VisionError),
    #[error("{0}")]
    InvalidMealType(String),
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub image: ImageInput,
    pub locale: String,
    pub meal_type: Option<String>,
    pub auto_log: bool,
    pub user_id: String,
    pub hints: ServingHints,
}

impl ScanRequest {
    /// Validated meal type to log under, or `None` when logging was not asked for.
    ///
    /// Auto-logging without a meal type is an error, not a silent no-op.
    pub fn meal_to_log(&self) -> Result<Option<String>, ScanError> {
        if !self.auto_log {
            return Ok(None);
        }
        let meal = self.meal_type.as_deref().ok_or_else(|| {
            ScanError::InvalidMealType("meal_type is required when auto_log is set".to_string())
        })?;
        validate_meal_type(meal)
            .map(Some)
            .map_err(|e| ScanError::InvalidMealType(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LogReport {
    pub logged_entry_ids: Vec<String>,
    pub failures: Vec<PersistenceError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub items: Vec<ResolvedFoodItem>,
    pub logged_entry_ids: Vec<String>,
    pub failures: Vec<PersistenceError>,
    pub totals: ScaledNutrition,
}

/// One vision call, with failures logged. Touches no store.
pub async fn infer_raw<V>(
    vision: &V,
    image: &ImageInput,
    locale: &str,
) -> Result<String, VisionError>
where
    V: VisionInference + ?Sized,
{
    vision.infer(image, locale).await.inspect_err(|e| {
        error!("vision inference failed: {e}");
    })
}

/// Sum of scaled nutrition over matched items.
#[must_use]
pub fn totals(items: &[ResolvedFoodItem]) -> ScaledNutrition {
    items.iter().filter_map(|i| i.scaled_nutrition).sum()
}

#[derive(Debug, Clone, Default)]
pub struct ScanPipeline<P = HeuristicParser> {
    parser: P,
}

impl ScanPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<P: DetectionParser> ScanPipeline<P> {
    pub fn with_parser(parser: P) -> Self {
        Self { parser }
    }

    /// Resolve one detection against the reference store.
    pub fn resolve_detection<R>(
        &self,
        references: &R,
        mut detection: FoodDetection,
        hints: &ServingHints,
    ) -> ResolvedFoodItem
    where
        R: ReferenceStore + ?Sized,
    {
        if detection.estimated_serving_g.is_none() {
            detection.estimated_serving_g = hints.grams_for(&detection.name);
        }

        let mut candidates = find_candidates(references, &detection.name, &detection.locale)
            .into_iter();
        let primary = candidates.next();
        let alternatives: Vec<_> = candidates.take(MAX_ALTERNATIVES).collect();

        let serving_g = detection
            .estimated_serving_g
            .or_else(|| {
                primary
                    .as_ref()
                    .map(|r| r.reference_serving_g)
                    .filter(|g| g.is_finite() && *g > 0.0)
            })
            .unwrap_or(DEFAULT_SERVING_G);

        let scaled_nutrition = primary.as_ref().map(|r| r.scale_to(serving_g));
        let display_name = primary.as_ref().map_or_else(
            || detection.name.clone(),
            |r| r.localized_name(&detection.locale).to_string(),
        );

        ResolvedFoodItem {
            detection,
            display_name,
            serving_g,
            matched_reference: primary,
            scaled_nutrition,
            alternatives,
        }
    }

    /// Parse a raw vision response and resolve every detection, in order.
    pub fn resolve_response<R>(
        &self,
        references: &R,
        raw: &str,
        locale: &str,
        hints: &ServingHints,
    ) -> Vec<ResolvedFoodItem>
    where
        R: ReferenceStore + ?Sized,
    {
        let items: Vec<_> = self
            .parser
            .parse(raw, locale)
            .into_iter()
            .map(|d| self.resolve_detection(references, d, hints))
            .collect();
        let matched = items.iter().filter(|i| i.is_matched()).count();
        info!(detected = items.len(), matched, locale, "resolved food image");
        items
    }

    /// Call the vision service once and resolve its answer.
    pub async fn resolve_food_image<V, R>(
        &self,
        vision: &V,
        references: &R,
        image: &ImageInput,
        locale: &str,
        hints: &ServingHints,
    ) -> Result<Vec<ResolvedFoodItem>, VisionError>
    where
        V: VisionInference + ?Sized,
        R: ReferenceStore + ?Sized,
    {
        let raw = infer_raw(vision, image, locale).await?;
        Ok(self.resolve_response(references, &raw, locale, hints))
    }

    /// Write one diary entry per item. Each insert is independent.
    pub fn log_items<D>(
        &self,
        diary: &D,
        items: &[ResolvedFoodItem],
        meal_type: &str,
        user_id: &str,
    ) -> LogReport
    where
        D: DiaryStore + ?Sized,
    {
        let logged_at = Local::now().to_rfc3339();
        let mut report = LogReport::default();

        for (index, item) in items.iter().enumerate() {
            let entry = diary_entry_for(item, user_id, meal_type, &logged_at);
            match diary.insert_diary_entry(&entry) {
                Ok(()) => report.logged_entry_ids.push(entry.id),
                Err(e) => {
                    warn!(index, entry_id = %entry.id, "diary write failed: {e:#}");
                    report.failures.push(PersistenceError {
                        index,
                        entry_id: entry.id,
                        message: format!("{e:#}"),
                    });
                }
            }
        }

        report
    }

    /// Resolve an image and, when auto-logging was requested, log every item.
    ///
    /// The meal type is checked before the vision call.
    pub async fn scan_and_log<V, R, D>(
        &self,
        vision: &V,
        references: &R,
        diary: &D,
        request: &ScanRequest,
    ) -> Result<ScanOutcome, ScanError>
    where
        V: VisionInference + ?Sized,
        R: ReferenceStore + ?Sized,
        D: DiaryStore + ?Sized,
    {
        request.meal_to_log()?;
        let raw = infer_raw(vision, &request.image, &request.locale).await?;
        self.complete(references, diary, &raw, request)
    }

    /// Finish a scan from an already-fetched vision response: resolve, log
    /// when requested, and total.
    pub fn complete<R, D>(
        &self,
        references: &R,
        diary: &D,
        raw: &str,
        request: &ScanRequest,
    ) -> Result<ScanOutcome, ScanError>
    where
        R: ReferenceStore + ?Sized,
        D: DiaryStore + ?Sized,
    {
        let meal_type = request.meal_to_log()?;
        let items = self.resolve_response(references, raw, &request.locale, &request.hints);

        let report = match meal_type {
            Some(meal) => self.log_items(diary, &items, &meal, &request.user_id),
            None => LogReport::default(),
        };

        Ok(ScanOutcome {
            totals: totals(&items),
            items,
            logged_entry_ids: report.logged_entry_ids,
            failures: report.failures,
        })
    }
}

fn diary_entry_for(
    item: &ResolvedFoodItem,
    user_id: &str,
    meal_type: &str,
    logged_at: &str,
) -> DiaryEntry {
    DiaryEntry {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        food_reference_id: item.matched_reference.as_ref().map(|r| r.id.clone()),
        food_name: item.display_name.clone(),
        meal_type: meal_type.to_string(),
        quantity: 1.0,
        serving_g: item.serving_g,
        nutrition: item.scaled_nutrition,
        logged_at: logged_at.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::models::NutritionReference;
    use crate::nutrition::Macros;

    struct FixedVision {
        response: String,
        calls: AtomicUsize,
    }

    impl FixedVision {
        fn new(response: &str) -> Self {
            Self {
                response: response.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl VisionInference for FixedVision {
        async fn infer(&self, _image: &ImageInput, _locale: &str) -> Result<String, VisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    struct FailingVision;

    impl VisionInference for FailingVision {
        async fn infer(&self, _image: &ImageInput, _locale: &str) -> Result<String, VisionError> {
            Err(VisionError::Service {
                status: 503,
                body: "overloaded".to_string(),
            })
        }
    }

    /// Records entries; fails the writes whose (0-based) position is listed.
    struct FlakyDiary {
        fail_at: Vec<usize>,
        attempts: RefCell<usize>,
        written: RefCell<Vec<DiaryEntry>>,
    }

    impl FlakyDiary {
        fn new(fail_at: &[usize]) -> Self {
            Self {
                fail_at: fail_at.to_vec(),
                attempts: RefCell::new(0),
                written: RefCell::new(Vec::new()),
            }
        }
    }

    impl DiaryStore for FlakyDiary {
        fn insert_diary_entry(&self, entry: &DiaryEntry) -> Result<()> {
            let attempt = *self.attempts.borrow();
            *self.attempts.borrow_mut() += 1;
            if self.fail_at.contains(&attempt) {
                anyhow::bail!("disk full");
            }
            self.written.borrow_mut().push(entry.clone());
            Ok(())
        }
    }

    fn reference(id: &str, name: &str, serving_g: f64, calories: f64) -> NutritionReference {
        NutritionReference {
            id: id.to_string(),
            name_vi: name.to_string(),
            name_en: None,
            category: None,
            reference_serving_g: serving_g,
            per_serving: Macros {
                calories: Some(calories),
                protein_g: Some(20.0),
                carbs_g: Some(50.0),
                fat_g: Some(10.0),
                fiber_g: None,
            },
        }
    }

    fn image() -> ImageInput {
        ImageInput::Bytes(vec![0xff, 0xd8, 0xff])
    }

    fn request(meal_type: Option<&str>, auto_log: bool) -> ScanRequest {
        ScanRequest {
            image: image(),
            locale: "vi".to_string(),
            meal_type: meal_type.map(str::to_string),
            auto_log,
            user_id: "user-1".to_string(),
            hints: ServingHints::new(),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_scaling() {
        let vision = FixedVision::new(r#"[{"name":"Phở bò","servingGrams":300,"confidence":0.9}]"#);
        let refs = vec![reference("pho-bo", "Phở bò", 350.0, 400.0)];

        let items = ScanPipeline::new()
            .resolve_food_image(&vision, &refs, &image(), "vi", &ServingHints::new())
            .await
            .unwrap();

        assert_eq!(vision.calls.load(Ordering::SeqCst), 1);
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.matched_reference.as_ref().unwrap().id, "pho-bo");
        assert!((item.serving_g - 300.0).abs() < f64::EPSILON);
        assert_eq!(item.scaled_nutrition.unwrap().calories, 343);
        assert!(item.alternatives.is_empty());
    }

    #[test]
    fn test_soft_miss_item() {
        let refs = vec![reference("pho-bo", "Phở bò", 350.0, 400.0)];
        let items = ScanPipeline::new().resolve_response(
            &refs,
            r#"[{"name":"zzz_no_such_food"}]"#,
            "vi",
            &ServingHints::new(),
        );
        assert_eq!(items.len(), 1);
        assert!(items[0].scaled_nutrition.is_none());
        assert!(items[0].matched_reference.is_none());
        assert!(items[0].alternatives.is_empty());
        assert_eq!(items[0].display_name, "zzz_no_such_food");
        assert!((items[0].serving_g - DEFAULT_SERVING_G).abs() < f64::EPSILON);
    }

    #[test]
    fn test_serving_falls_back_to_reference_then_default() {
        let refs = vec![
            reference("pho-bo", "Phở bò", 350.0, 400.0),
            reference("che", "Chè", 0.0, 250.0),
        ];
        let items = ScanPipeline::new().resolve_response(
            &refs,
            "Phở bò\nChè",
            "vi",
            &ServingHints::new(),
        );
        assert!((items[0].serving_g - 350.0).abs() < f64::EPSILON);
        assert_eq!(items[0].scaled_nutrition.unwrap().calories, 400);
        // Zero reference serving: default grams, factor 1.
        assert!((items[1].serving_g - DEFAULT_SERVING_G).abs() < f64::EPSILON);
        assert_eq!(items[1].scaled_nutrition.unwrap().calories, 250);
    }

    #[test]
    fn test_hints_fill_missing_grams_only() {
        let refs = vec![reference("pho-bo", "Phở bò", 350.0, 400.0)];
        let mut hints = ServingHints::new();
        hints.insert("phở bò", 175.0);

        let items = ScanPipeline::new().resolve_response(&refs, "Phở bò", "vi", &hints);
        assert_eq!(items[0].detection.estimated_serving_g, Some(175.0));
        assert_eq!(items[0].scaled_nutrition.unwrap().calories, 200);

        let items = ScanPipeline::new().resolve_response(&refs, "Phở bò (700g)", "vi", &hints);
        assert_eq!(items[0].scaled_nutrition.unwrap().calories, 800);
    }

    #[test]
    fn test_alternatives_exclude_primary_and_cap() {
        let refs: Vec<NutritionReference> = (0..7)
            .map(|i| reference(&format!("bun-{i}"), &format!("Bún {i}"), 100.0, 100.0))
            .collect();
        let items = ScanPipeline::new().resolve_response(&refs, "bún", "vi", &ServingHints::new());
        let item = &items[0];
        assert_eq!(item.matched_reference.as_ref().unwrap().id, "bun-0");
        let alt_ids: Vec<&str> = item.alternatives.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(alt_ids, ["bun-1", "bun-2", "bun-3", "bun-4"]);
    }

    #[test]
    fn test_order_preserved() {
        let refs = vec![
            reference("a", "Bánh mì", 100.0, 250.0),
            reference("b", "Cà phê sữa", 200.0, 120.0),
        ];
        let items = ScanPipeline::new().resolve_response(
            &refs,
            "Cà phê sữa\nBánh mì\nKhông rõ",
            "vi",
            &ServingHints::new(),
        );
        let names: Vec<&str> = items.iter().map(|i| i.detection.name.as_str()).collect();
        assert_eq!(names, ["Cà phê sữa", "Bánh mì", "Không rõ"]);
        assert_eq!(totals(&items).calories, 370);
    }

    #[tokio::test]
    async fn test_auto_log_partial_failure_keeps_other_entries() {
        let vision = FixedVision::new("Phở bò\nBánh mì\nCà phê sữa");
        let refs = vec![
            reference("pho-bo", "Phở bò", 350.0, 400.0),
            reference("banh-mi", "Bánh mì", 100.0, 250.0),
            reference("ca-phe", "Cà phê sữa", 200.0, 120.0),
        ];
        let diary = FlakyDiary::new(&[1]);

        let outcome = ScanPipeline::new()
            .scan_and_log(&vision, &refs, &diary, &request(Some("Lunch"), true))
            .await
            .unwrap();

        assert_eq!(outcome.items.len(), 3);
        assert_eq!(outcome.logged_entry_ids.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 1);

        let written = diary.written.borrow();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].id, outcome.logged_entry_ids[0]);
        assert_eq!(written[1].id, outcome.logged_entry_ids[1]);
        assert_eq!(written[0].food_reference_id.as_deref(), Some("pho-bo"));
        assert_eq!(written[1].food_reference_id.as_deref(), Some("ca-phe"));
        assert!(written.iter().all(|e| e.meal_type == "lunch"));
        assert!(written.iter().all(|e| e.user_id == "user-1"));
        assert_ne!(written[0].id, written[1].id);
    }

    #[tokio::test]
    async fn test_soft_miss_is_logged_without_reference() {
        let vision = FixedVision::new("zzz_no_such_food");
        let refs = vec![reference("pho-bo", "Phở bò", 350.0, 400.0)];
        let diary = FlakyDiary::new(&[]);

        let outcome = ScanPipeline::new()
            .scan_and_log(&vision, &refs, &diary, &request(Some("snack"), true))
            .await
            .unwrap();

        assert_eq!(outcome.logged_entry_ids.len(), 1);
        let written = diary.written.borrow();
        assert!(written[0].food_reference_id.is_none());
        assert!(written[0].nutrition.is_none());
    }

    #[tokio::test]
    async fn test_no_logging_without_auto_log() {
        let vision = FixedVision::new("Phở bò");
        let refs = vec![reference("pho-bo", "Phở bò", 350.0, 400.0)];
        let diary = FlakyDiary::new(&[]);
        let pipeline = ScanPipeline::new();

        let outcome = pipeline
            .scan_and_log(&vision, &refs, &diary, &request(Some("lunch"), false))
            .await
            .unwrap();
        assert!(outcome.logged_entry_ids.is_empty());

        let outcome = pipeline
            .scan_and_log(&vision, &refs, &diary, &request(None, false))
            .await
            .unwrap();
        assert!(outcome.logged_entry_ids.is_empty());
        assert_eq!(outcome.totals.calories, 400);
        assert!(diary.written.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_auto_log_without_meal_type_rejected_before_vision_call() {
        let vision = FixedVision::new("Phở bò");
        let refs = vec![reference("pho-bo", "Phở bò", 350.0, 400.0)];
        let diary = FlakyDiary::new(&[]);

        let err = ScanPipeline::new()
            .scan_and_log(&vision, &refs, &diary, &request(None, true))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidMealType(_)));
        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
        assert!(diary.written.borrow().is_empty());
    }

    #[test]
    fn test_complete_from_raw_response_logs_and_reports_failures() {
        let refs = vec![
            reference("pho-bo", "Phở bò", 350.0, 400.0),
            reference("banh-mi", "Bánh mì", 100.0, 250.0),
        ];
        let diary = FlakyDiary::new(&[0]);

        let outcome = ScanPipeline::new()
            .complete(&refs, &diary, "Phở bò\nBánh mì", &request(Some(" Dinner "), true))
            .unwrap();

        assert_eq!(outcome.items.len(), 2);
        assert_eq!(outcome.totals.calories, 650);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 0);
        assert_eq!(outcome.logged_entry_ids.len(), 1);
        let written = diary.written.borrow();
        assert_eq!(written[0].food_reference_id.as_deref(), Some("banh-mi"));
        assert_eq!(written[0].meal_type, "dinner");

        let err = ScanPipeline::new()
            .complete(&refs, &diary, "Phở bò", &request(None, true))
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidMealType(_)));
    }

    #[test]
    fn test_meal_to_log() {
        assert_eq!(request(Some("lunch"), false).meal_to_log().unwrap(), None);
        assert_eq!(
            request(Some("Lunch"), true).meal_to_log().unwrap().as_deref(),
            Some("lunch")
        );
        assert!(request(None, true).meal_to_log().is_err());
        assert!(request(Some("brunch"), true).meal_to_log().is_err());
    }

    #[tokio::test]
    async fn test_invalid_meal_type_rejected_before_vision_call() {
        let vision = FixedVision::new("Phở bò");
        let refs: Vec<NutritionReference> = Vec::new();
        let diary = FlakyDiary::new(&[]);

        let err = ScanPipeline::new()
            .scan_and_log(&vision, &refs, &diary, &request(Some("brunch"), true))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidMealType(_)));
        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_vision_error_propagates() {
        let refs: Vec<NutritionReference> = Vec::new();
        let diary = FlakyDiary::new(&[]);
        let err = ScanPipeline::new()
            .scan_and_log(&FailingVision, &refs, &diary, &request(Some("lunch"), true))
            .await
            .unwrap_err();
        match err {
            ScanError::Vision(VisionError::Service { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(diary.written.borrow().is_empty());
    }

    #[test]
    fn test_empty_response_means_no_food() {
        let refs = vec![reference("pho-bo", "Phở bò", 350.0, 400.0)];
        let items = ScanPipeline::new().resolve_response(&refs, "", "vi", &ServingHints::new());
        assert!(items.is_empty());
    }

    struct UppercaseParser;

    impl DetectionParser for UppercaseParser {
        fn parse(&self, raw: &str, locale: &str) -> Vec<FoodDetection> {
            vec![FoodDetection {
                name: raw.to_uppercase(),
                locale: locale.to_string(),
                estimated_serving_g: None,
                confidence: 1.0,
            }]
        }
    }

    #[test]
    fn test_custom_parser_strategy() {
        let refs = vec![reference("pho-bo", "Phở bò", 350.0, 400.0)];
        let items = ScanPipeline::with_parser(UppercaseParser).resolve_response(
            &refs,
            "phở bò",
            "vi",
            &ServingHints::new(),
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].detection.name, "PHỞ BÒ");
        assert!(items[0].is_matched());
    }
}
