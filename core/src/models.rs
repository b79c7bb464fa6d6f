use std::collections::HashMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::nutrition::{self, Macros, ScaledNutrition};

/// A single food hypothesis parsed from the vision model's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodDetection {
    pub name: String,
    pub locale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_serving_g: Option<f64>,
    /// Always within `[0, 1]`.
    pub confidence: f64,
}

/// A canonical nutrition-per-serving record from the reference dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionReference {
    pub id: String,
    /// Canonical (Vietnamese) name; candidates are ordered by this field.
    pub name_vi: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_en: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub reference_serving_g: f64,
    pub per_serving: Macros,
}

impl NutritionReference {
    /// The record's name in `locale`, falling back to the canonical name.
    #[must_use]
    pub fn localized_name(&self, locale: &str) -> &str {
        match &self.name_en {
            Some(en) if is_english_locale(locale) && !en.trim().is_empty() => en,
            _ => &self.name_vi,
        }
    }

    #[must_use]
    pub fn scale_to(&self, target_g: f64) -> ScaledNutrition {
        nutrition::scale(&self.per_serving, self.reference_serving_g, target_g)
    }
}

/// True for `en` and any regional variant such as `en-US`.
#[must_use]
pub fn is_english_locale(locale: &str) -> bool {
    locale
        .get(..2)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("en"))
}

/// A detection joined with its reference lookup and scaled nutrition.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedFoodItem {
    pub detection: FoodDetection,
    pub display_name: String,
    pub serving_g: f64,
    pub matched_reference: Option<NutritionReference>,
    /// `None` when no reference matched (a soft miss).
    pub scaled_nutrition: Option<ScaledNutrition>,
    pub alternatives: Vec<NutritionReference>,
}

impl ResolvedFoodItem {
    #[must_use]
    pub fn is_matched(&self) -> bool {
        self.matched_reference.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub id: String,
    pub user_id: String,
    pub food_reference_id: Option<String>,
    pub food_name: String,
    pub meal_type: String,
    pub quantity: f64,
    pub serving_g: f64,
    /// Scaled macros at the time of logging; `None` for unmatched foods.
    pub nutrition: Option<ScaledNutrition>,
    pub logged_at: String,
}

/// Caller-supplied gram estimates keyed by food name (case-insensitive).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "HashMap<String, f64>", into = "HashMap<String, f64>")]
pub struct ServingHints(HashMap<String, f64>);

impl ServingHints {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hint. Non-positive or non-finite grams are ignored.
    pub fn insert(&mut self, name: &str, grams: f64) {
        if grams.is_finite() && grams > 0.0 {
            self.0.insert(name.trim().to_lowercase(), grams);
        }
    }

    #[must_use]
    pub fn grams_for(&self, name: &str) -> Option<f64> {
        self.0
            .get(&name.trim().to_lowercase())
            .copied()
            .filter(|g| g.is_finite() && *g > 0.0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, f64>> for ServingHints {
    fn from(map: HashMap<String, f64>) -> Self {
        map.into_iter().collect()
    }
}

impl From<ServingHints> for HashMap<String, f64> {
    fn from(hints: ServingHints) -> Self {
        hints.0
    }
}

impl FromIterator<(String, f64)> for ServingHints {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        let mut hints = Self::new();
        for (name, grams) in iter {
            hints.insert(&name, grams);
        }
        hints
    }
}

/// Daily diary view for one user.
#[derive(Debug, Clone, Serialize)]
pub struct DiaryDay {
    pub date: String,
    pub user_id: String,
    pub entries: Vec<DiaryEntry>,
    pub totals: ScaledNutrition,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub rows_parsed: usize,
    pub references_created: usize,
    pub references_updated: usize,
}

pub const MEAL_TYPES: &[&str] = &["breakfast", "lunch", "dinner", "snack"];

pub fn validate_meal_type(meal: &str) -> Result<String> {
    let lower = meal.trim().to_lowercase();
    if MEAL_TYPES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        bail!(
            "Invalid meal type '{meal}'. Must be one of: {}",
            MEAL_TYPES.join(", ")
        )
    }
}

/// Validate a reference record before it is written to the store.
pub fn validate_reference(reference: &NutritionReference) -> Result<()> {
    if reference.id.trim().is_empty() {
        bail!("Reference id must not be empty");
    }
    if reference.name_vi.trim().is_empty() {
        bail!("Reference name must not be empty");
    }
    if !reference.reference_serving_g.is_finite() || reference.reference_serving_g < 0.0 {
        bail!("reference_serving_g must not be negative");
    }
    let m = &reference.per_serving;
    for (label, value) in [
        ("calories", m.calories),
        ("protein_g", m.protein_g),
        ("carbs_g", m.carbs_g),
        ("fat_g", m.fat_g),
        ("fiber_g", m.fiber_g),
    ] {
        if value.is_some_and(|v| !v.is_finite() || v < 0.0) {
            bail!("{label} must not be negative");
        }
    }
    Ok(())
}
