use std::path::Path;
use std::process;

use anyhow::{Context, Result};

use platescan_core::models::NutritionReference;
use platescan_core::nutrition::Macros;
use platescan_core::resolver::fold_name;
use platescan_core::service::PlatescanService;

use super::helpers::{json_error, print_reference_table};

pub(crate) fn cmd_foods_import(
    service: &PlatescanService,
    path: &Path,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;

    let summary = service.import_references_csv(file, dry_run)?;

    if summary.rows_parsed == 0 {
        if json {
            println!(
                "{}",
                serde_json::json!({ "error": "No rows found in CSV file" })
            );
        } else {
            eprintln!("No rows found in CSV file.");
        }
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "dry_run": dry_run,
                "rows_parsed": summary.rows_parsed,
                "references_created": summary.references_created,
                "references_updated": summary.references_updated,
            })
        );
    } else {
        if dry_run {
            println!("Dry run, no changes made.\n");
        } else {
            println!("Import complete.\n");
        }
        println!("  Rows parsed:        {}", summary.rows_parsed);
        println!("  References created: {}", summary.references_created);
        println!("  References updated: {}", summary.references_updated);
    }

    Ok(())
}

pub(crate) struct NewReference {
    pub id: Option<String>,
    pub name: String,
    pub name_en: Option<String>,
    pub category: Option<String>,
    pub serving: f64,
    pub calories: f64,
    pub protein: Option<f64>,
    pub carbs: Option<f64>,
    pub fat: Option<f64>,
    pub fiber: Option<f64>,
}

pub(crate) fn cmd_foods_add(
    service: &PlatescanService,
    new: NewReference,
    json: bool,
) -> Result<()> {
    let reference = NutritionReference {
        id: new
            .id
            .unwrap_or_else(|| fold_name(&new.name).replace(' ', "-")),
        name_vi: new.name,
        name_en: new.name_en,
        category: new.category,
        reference_serving_g: new.serving,
        per_serving: Macros {
            calories: Some(new.calories),
            protein_g: new.protein,
            carbs_g: new.carbs,
            fat_g: new.fat,
            fiber_g: new.fiber,
        },
    };
    let created = service.add_reference(&reference)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reference)?);
    } else {
        let verb = if created { "Added" } else { "Updated" };
        println!("{verb} reference: {} (id: {})", reference.name_vi, reference.id);
    }

    Ok(())
}

pub(crate) fn cmd_foods_search(
    service: &PlatescanService,
    query: &str,
    locale: &str,
    json: bool,
) -> Result<()> {
    let found = service.search_references(query, locale);

    if found.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No reference foods match '{query}'");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else {
        print_reference_table(&found);
    }

    Ok(())
}

pub(crate) fn cmd_foods_list(service: &PlatescanService, limit: usize, json: bool) -> Result<()> {
    let references = service.list_references(limit)?;

    if references.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No reference foods. Import some with 'platescan foods import <CSV>'");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&references)?);
    } else {
        print_reference_table(&references);
    }

    Ok(())
}

pub(crate) fn cmd_foods_show(service: &PlatescanService, id: &str, json: bool) -> Result<()> {
    let Some(reference) = service.get_reference(id)? else {
        if json {
            println!("{}", json_error(&format!("Reference {id} not found")));
        } else {
            eprintln!("Reference {id} not found");
        }
        process::exit(2);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reference)?);
    } else {
        print_reference_table(std::slice::from_ref(&reference));
        if let Some(category) = &reference.category {
            println!("  Category: {category}");
        }
    }

    Ok(())
}

pub(crate) fn cmd_foods_delete(service: &PlatescanService, id: &str, json: bool) -> Result<()> {
    if service.delete_reference(id)? {
        if json {
            println!("{}", serde_json::json!({ "deleted": id }));
        } else {
            println!("Deleted reference {id}");
        }
        Ok(())
    } else {
        if json {
            println!("{}", json_error(&format!("Reference {id} not found")));
        } else {
            eprintln!("Reference {id} not found");
        }
        process::exit(2);
    }
}
