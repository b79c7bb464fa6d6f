use std::process;

use anyhow::Result;

use platescan_core::service::PlatescanService;

use super::helpers::{format_macros, json_error, parse_date, print_diary_table};

pub(crate) fn cmd_diary_show(
    service: &PlatescanService,
    user: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date)?;
    let day = service.diary_day(user, &date.format("%Y-%m-%d").to_string())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&day)?);
        return Ok(());
    }

    if day.entries.is_empty() {
        eprintln!("No entries for {}", day.date);
        process::exit(2);
    }

    println!("=== {} ===\n", day.date);
    print_diary_table(&day.entries);
    println!("\n  TOTAL: {}", format_macros(&day.totals));

    let unmatched = day.entries.iter().filter(|e| e.nutrition.is_none()).count();
    if unmatched > 0 {
        println!("  ({unmatched} entries without nutrition data are not counted)");
    }

    Ok(())
}

pub(crate) fn cmd_diary_delete(service: &PlatescanService, id: &str, json: bool) -> Result<()> {
    if service.delete_diary_entry(id)? {
        if json {
            println!("{}", serde_json::json!({ "deleted": id }));
        } else {
            println!("Deleted entry {id}");
        }
        Ok(())
    } else {
        if json {
            println!("{}", json_error(&format!("Entry {id} not found")));
        } else {
            eprintln!("Entry {id} not found");
        }
        process::exit(2);
    }
}
