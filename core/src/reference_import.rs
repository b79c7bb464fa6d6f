use std::collections::HashSet;
use std::io::Read;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::db::Database;
use crate::models::{ImportSummary, NutritionReference, validate_reference};
use crate::nutrition::Macros;
use crate::resolver::fold_name;
use crate::scan::DEFAULT_SERVING_G;

/// Parse a reference dataset CSV from any reader.
///
/// Expected header (case-insensitive, any order):
/// `id,name_vi,name_en,category,serving_g,calories,protein_g,carbs_g,fat_g,fiber_g`
///
/// Only `name_vi` and `calories` are required. Rows without an id get one
/// derived from the Vietnamese name, so re-importing the same file updates
/// rather than duplicates.
pub fn parse_reference_csv<R: Read>(reader: R) -> Result<Vec<NutritionReference>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers().context("Failed to read CSV headers")?.clone();

    for name in ["name_vi", "calories"] {
        if !headers.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            bail!("Missing required column: {name}");
        }
    }

    let col =
        |name: &str| -> Option<usize> { headers.iter().position(|h| h.eq_ignore_ascii_case(name)) };

    let idx_name_vi = col("name_vi").context("Missing 'name_vi' column")?;
    let idx_calories = col("calories");
    let idx_id = col("id");
    let idx_name_en = col("name_en");
    let idx_category = col("category");
    let idx_serving = col("serving_g");
    let idx_protein = col("protein_g");
    let idx_carbs = col("carbs_g");
    let idx_fat = col("fat_g");
    let idx_fiber = col("fiber_g");

    let mut references = Vec::new();

    for (line_num, result) in rdr.records().enumerate() {
        let row = line_num + 2;
        let record = result.with_context(|| format!("Failed to parse CSV row {row}"))?;

        let text = |idx: Option<usize>| -> Option<String> {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let number = |idx: Option<usize>, label: &str| -> Result<Option<f64>> {
            text(idx)
                .map(|v| {
                    v.parse::<f64>()
                        .with_context(|| format!("Row {row}: invalid {label} '{v}'"))
                })
                .transpose()
        };

        let Some(name_vi) = text(Some(idx_name_vi)) else {
            continue;
        };

        let reference = NutritionReference {
            id: text(idx_id).unwrap_or_else(|| derive_id(&name_vi)),
            name_en: text(idx_name_en),
            category: text(idx_category),
            reference_serving_g: number(idx_serving, "serving_g")?.unwrap_or(DEFAULT_SERVING_G),
            per_serving: Macros {
                calories: number(idx_calories, "calories")?,
                protein_g: number(idx_protein, "protein_g")?,
                carbs_g: number(idx_carbs, "carbs_g")?,
                fat_g: number(idx_fat, "fat_g")?,
                fiber_g: number(idx_fiber, "fiber_g")?,
            },
            name_vi,
        };
        validate_reference(&reference).with_context(|| format!("Row {row}"))?;
        references.push(reference);
    }

    Ok(references)
}

/// Stable id for a record that was supplied without one.
fn derive_id(name: &str) -> String {
    fold_name(name).replace(' ', "-")
}

/// Write parsed references into the database, replacing records with the same id.
///
/// When `dry_run` is true nothing is written; the summary reports what would happen.
pub fn import_references(
    db: &Database,
    references: &[NutritionReference],
    dry_run: bool,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary {
        rows_parsed: references.len(),
        ..ImportSummary::default()
    };
    // Repeated ids within one file count once as created.
    let mut seen: HashSet<&str> = HashSet::new();

    for reference in references {
        let first_in_file = seen.insert(reference.id.as_str());
        let created = if dry_run {
            first_in_file && db.get_reference(&reference.id)?.is_none()
        } else {
            db.upsert_reference(reference)? && first_in_file
        };
        if created {
            summary.references_created += 1;
        } else {
            summary.references_updated += 1;
        }
    }

    if !dry_run {
        info!(
            rows = summary.rows_parsed,
            created = summary.references_created,
            updated = summary.references_updated,
            "imported reference records"
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE_CSV: &str = "\
id,name_vi,name_en,category,serving_g,calories,protein_g,carbs_g,fat_g,fiber_g
pho-bo,Phở bò,Beef pho,noodles,350,400,25,55,9,2
banh-mi,Bánh mì,Vietnamese baguette,bread,100,250,8,48,3,2
ca-phe-sua,Cà phê sữa,Iced milk coffee,drink,200,120,2,20,3,
";

    #[test]
    fn test_parse_reference_csv_basic() {
        let refs = parse_reference_csv(SAMPLE_CSV.as_bytes()).unwrap();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].id, "pho-bo");
        assert_eq!(refs[0].name_vi, "Phở bò");
        assert_eq!(refs[0].name_en.as_deref(), Some("Beef pho"));
        assert!((refs[0].reference_serving_g - 350.0).abs() < f64::EPSILON);
        assert_eq!(refs[0].per_serving.calories, Some(400.0));
        assert_eq!(refs[2].per_serving.fiber_g, None);
    }

    #[test]
    fn test_parse_missing_required_column() {
        let err = parse_reference_csv("id,name_en\nx,Thing\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("name_vi"));
    }

    #[test]
    fn test_parse_minimal_columns_and_derived_id() {
        let csv = "NAME_VI,Calories\nBún  chả,450\n";
        let refs = parse_reference_csv(csv.as_bytes()).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].id, "bún-chả");
        assert!((refs[0].reference_serving_g - DEFAULT_SERVING_G).abs() < f64::EPSILON);
        assert!(refs[0].name_en.is_none());
    }

    #[test]
    fn test_parse_skips_blank_rows() {
        let csv = "name_vi,calories\nPhở gà,380\n,\nCơm tấm,600\n";
        let refs = parse_reference_csv(csv.as_bytes()).unwrap();
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn test_parse_rejects_bad_number() {
        let csv = "name_vi,calories\nPhở gà,lots\n";
        let err = parse_reference_csv(csv.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("calories"));
    }

    #[test]
    fn test_parse_rejects_negative_values() {
        let csv = "name_vi,calories\nPhở gà,-5\n";
        assert!(parse_reference_csv(csv.as_bytes()).is_err());
    }

    #[test]
    fn test_import_dry_run_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let refs = parse_reference_csv(SAMPLE_CSV.as_bytes()).unwrap();
        let summary = import_references(&db, &refs, true).unwrap();
        assert_eq!(summary.rows_parsed, 3);
        assert_eq!(summary.references_created, 3);
        assert_eq!(db.count_references().unwrap(), 0);
    }

    #[test]
    fn test_import_then_reimport_updates() {
        let db = Database::open_in_memory().unwrap();
        let refs = parse_reference_csv(SAMPLE_CSV.as_bytes()).unwrap();

        let first = import_references(&db, &refs, false).unwrap();
        assert_eq!(first.references_created, 3);
        assert_eq!(first.references_updated, 0);

        let second = import_references(&db, &refs, false).unwrap();
        assert_eq!(second.references_created, 0);
        assert_eq!(second.references_updated, 3);
        assert_eq!(db.count_references().unwrap(), 3);
    }

    #[test]
    fn test_import_duplicate_ids_in_one_file() {
        let db = Database::open_in_memory().unwrap();
        let csv = "id,name_vi,calories\nx,Phở,400\nx,Phở bò,420\n";
        let refs = parse_reference_csv(csv.as_bytes()).unwrap();
        let summary = import_references(&db, &refs, false).unwrap();
        assert_eq!(summary.references_created, 1);
        assert_eq!(summary.references_updated, 1);
        let stored = db.get_reference("x").unwrap().unwrap();
        assert_eq!(stored.name_vi, "Phở bò");
    }

    #[test]
    fn test_import_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_CSV.as_bytes()).unwrap();
        let reader = std::fs::File::open(file.path()).unwrap();
        let refs = parse_reference_csv(reader).unwrap();
        assert_eq!(refs.len(), 3);
    }
}
