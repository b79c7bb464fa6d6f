use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Per-serving macro values as stored on a reference record.
///
/// Any field may be missing in the source dataset; missing values scale as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Macros {
    pub calories: Option<f64>,
    pub protein_g: Option<f64>,
    pub carbs_g: Option<f64>,
    pub fat_g: Option<f64>,
    pub fiber_g: Option<f64>,
}

/// Macro values scaled to a concrete serving weight, rounded to whole units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaledNutrition {
    pub calories: u32,
    pub protein_g: u32,
    pub carbs_g: u32,
    pub fat_g: u32,
    pub fiber_g: u32,
}

impl Add for ScaledNutrition {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            calories: self.calories.saturating_add(rhs.calories),
            protein_g: self.protein_g.saturating_add(rhs.protein_g),
            carbs_g: self.carbs_g.saturating_add(rhs.carbs_g),
            fat_g: self.fat_g.saturating_add(rhs.fat_g),
            fiber_g: self.fiber_g.saturating_add(rhs.fiber_g),
        }
    }
}

impl AddAssign for ScaledNutrition {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for ScaledNutrition {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Ratio between the target weight and the reference serving weight.
///
/// A non-positive (or non-finite) reference serving yields a factor of 1.
#[must_use]
pub fn scaling_factor(reference_serving_g: f64, target_g: f64) -> f64 {
    if reference_serving_g.is_finite() && reference_serving_g > 0.0 {
        target_g / reference_serving_g
    } else {
        1.0
    }
}

/// Scale per-serving macros to `target_g` grams.
#[must_use]
pub fn scale(per_serving: &Macros, reference_serving_g: f64, target_g: f64) -> ScaledNutrition {
    let factor = scaling_factor(reference_serving_g, target_g);
    let scaled = |v: Option<f64>| round_macro(v.unwrap_or(0.0) * factor);
    ScaledNutrition {
        calories: scaled(per_serving.calories),
        protein_g: scaled(per_serving.protein_g),
        carbs_g: scaled(per_serving.carbs_g),
        fat_g: scaled(per_serving.fat_g),
        fiber_g: scaled(per_serving.fiber_g),
    }
}

// f64::round rounds half away from zero; NaN and negatives clamp to 0.
#[allow(clippy::cast_sign_loss)]
fn round_macro(value: f64) -> u32 {
    value.round().max(0.0) as u32
}
