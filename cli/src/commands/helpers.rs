use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use platescan_core::models::{DiaryEntry, NutritionReference, ResolvedFoodItem, ServingHints};
use platescan_core::nutrition::ScaledNutrition;

pub(crate) fn parse_serving(s: &str) -> Result<f64> {
    let trimmed = s.trim().trim_end_matches('g').trim();
    let value: f64 = trimmed.parse().with_context(|| {
        format!("Invalid serving size: '{s}'. Use a number like '200' or '200g'")
    })?;
    if !value.is_finite() || value <= 0.0 {
        bail!("Serving size must be greater than 0");
    }
    Ok(value)
}

/// Parse a `NAME=GRAMS` serving hint, e.g. `Phở bò=400g`.
pub(crate) fn parse_hint(s: &str) -> Result<(String, f64)> {
    let Some((name, grams)) = s.rsplit_once('=') else {
        bail!("Invalid hint '{s}'. Use NAME=GRAMS (e.g. 'Phở bò=400')");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("Invalid hint '{s}': food name is empty");
    }
    Ok((name.to_string(), parse_serving(grams)?))
}

pub(crate) fn parse_hints(raw: &[String]) -> Result<ServingHints> {
    raw.iter()
        .map(|h| parse_hint(h))
        .collect::<Result<Vec<_>>>()
        .map(|pairs| pairs.into_iter().collect())
}

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday")
            }),
        },
    }
}

pub(crate) fn format_macros(n: &ScaledNutrition) -> String {
    format!(
        "{} kcal | P:{}g C:{}g F:{}g Fiber:{}g",
        n.calories, n.protein_g, n.carbs_g, n.fat_g, n.fiber_g
    )
}

pub(crate) fn print_item_table(items: &[ResolvedFoodItem]) {
    #[derive(Tabled)]
    struct ItemRow {
        #[tabled(rename = "#")]
        idx: usize,
        #[tabled(rename = "Detected")]
        detected: String,
        #[tabled(rename = "Match")]
        matched: String,
        #[tabled(rename = "Conf")]
        confidence: String,
        #[tabled(rename = "Serving")]
        serving: String,
        #[tabled(rename = "kcal")]
        calories: String,
        #[tabled(rename = "P")]
        protein: String,
        #[tabled(rename = "C")]
        carbs: String,
        #[tabled(rename = "F")]
        fat: String,
    }

    let dash = || "-".to_string();
    let rows: Vec<ItemRow> = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let n = item.scaled_nutrition;
            ItemRow {
                idx: i + 1,
                detected: truncate(&item.detection.name, 30),
                matched: if item.is_matched() {
                    truncate(&item.display_name, 30)
                } else {
                    "(no match)".to_string()
                },
                confidence: format!("{:.2}", item.detection.confidence),
                serving: format!("{:.0}g", item.serving_g),
                calories: n.map_or_else(dash, |n| n.calories.to_string()),
                protein: n.map_or_else(dash, |n| n.protein_g.to_string()),
                carbs: n.map_or_else(dash, |n| n.carbs_g.to_string()),
                fat: n.map_or_else(dash, |n| n.fat_g.to_string()),
            }
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..9)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_reference_table(references: &[NutritionReference]) {
    #[derive(Tabled)]
    struct ReferenceRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "English")]
        name_en: String,
        #[tabled(rename = "Serving")]
        serving: String,
        #[tabled(rename = "kcal")]
        calories: String,
        #[tabled(rename = "P")]
        protein: String,
        #[tabled(rename = "C")]
        carbs: String,
        #[tabled(rename = "F")]
        fat: String,
    }

    let value = |v: Option<f64>| v.map_or("-".into(), |v| format!("{v:.1}"));
    let rows: Vec<ReferenceRow> = references
        .iter()
        .map(|r| ReferenceRow {
            id: truncate(&r.id, 20),
            name: truncate(&r.name_vi, 30),
            name_en: r
                .name_en
                .as_deref()
                .map(|n| truncate(n, 30))
                .unwrap_or_default(),
            serving: format!("{:.0}g", r.reference_serving_g),
            calories: r.per_serving.calories.map_or("-".into(), |v| format!("{v:.0}")),
            protein: value(r.per_serving.protein_g),
            carbs: value(r.per_serving.carbs_g),
            fat: value(r.per_serving.fat_g),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..8)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_diary_table(entries: &[DiaryEntry]) {
    #[derive(Tabled)]
    struct DiaryRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Time")]
        time: String,
        #[tabled(rename = "Meal")]
        meal: String,
        #[tabled(rename = "Food")]
        food: String,
        #[tabled(rename = "Serving")]
        serving: String,
        #[tabled(rename = "kcal")]
        calories: String,
    }

    let rows: Vec<DiaryRow> = entries
        .iter()
        .map(|e| DiaryRow {
            id: e.id.clone(),
            time: e.logged_at.get(11..16).unwrap_or_default().to_string(),
            meal: e.meal_type.clone(),
            food: truncate(&e.food_name, 30),
            serving: format!("{:.0}g", e.serving_g),
            calories: e
                .nutrition
                .map_or_else(|| "-".to_string(), |n| n.calories.to_string()),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(4..6)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
