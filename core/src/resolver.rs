use anyhow::Result;
use tracing::{debug, warn};

use crate::models::NutritionReference;

/// Maximum number of candidates returned for one detected name.
pub const MAX_CANDIDATES: usize = 5;

/// Read-only lookup over the nutrition reference dataset.
pub trait ReferenceStore {
    /// Records whose Vietnamese or English name contains `folded_query`
    /// (already case-folded with [`fold_name`]), ordered by canonical name.
    fn search_references(&self, folded_query: &str, limit: usize)
    -> Result<Vec<NutritionReference>>;
}

/// Case-fold a food name for substring matching.
///
/// Uses Unicode lowercasing so that Vietnamese diacritics compare correctly,
/// and collapses runs of whitespace.
#[must_use]
pub fn fold_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn matches(reference: &NutritionReference, folded_query: &str) -> bool {
    fold_name(&reference.name_vi).contains(folded_query)
        || reference
            .name_en
            .as_deref()
            .is_some_and(|en| fold_name(en).contains(folded_query))
}

impl ReferenceStore for [NutritionReference] {
    fn search_references(
        &self,
        folded_query: &str,
        limit: usize,
    ) -> Result<Vec<NutritionReference>> {
        let mut found: Vec<NutritionReference> = self
            .iter()
            .filter(|r| matches(r, folded_query))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name_vi.cmp(&b.name_vi));
        found.truncate(limit);
        Ok(found)
    }
}

impl ReferenceStore for Vec<NutritionReference> {
    fn search_references(
        &self,
        folded_query: &str,
        limit: usize,
    ) -> Result<Vec<NutritionReference>> {
        self.as_slice().search_references(folded_query, limit)
    }
}

/// Look up reference candidates for a detected food name.
///
/// Never fails: an empty name, zero matches, or a store error all produce an
/// empty list (a soft miss). Candidates are ordered by canonical name and
/// capped at [`MAX_CANDIDATES`].
pub fn find_candidates<S>(store: &S, name: &str, locale: &str) -> Vec<NutritionReference>
where
    S: ReferenceStore + ?Sized,
{
    let query = fold_name(name);
    if query.is_empty() {
        return Vec::new();
    }

    let mut candidates = match store.search_references(&query, MAX_CANDIDATES) {
        Ok(found) => found,
        Err(e) => {
            warn!(food = %name, locale, "reference lookup failed, treating as no match: {e:#}");
            return Vec::new();
        }
    };
    candidates.sort_by(|a, b| a.name_vi.cmp(&b.name_vi));
    candidates.truncate(MAX_CANDIDATES);

    debug!(food = %name, locale, matches = candidates.len(), "resolved reference candidates");
    candidates
}
