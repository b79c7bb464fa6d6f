use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result, bail};

use platescan_core::scan::{ScanOutcome, ScanRequest, totals};
use platescan_core::service::PlatescanService;
use platescan_core::vision::ImageInput;

use crate::vision_client::VisionClient;

use super::helpers::{format_macros, parse_hints, print_item_table};

pub(crate) struct ScanOptions {
    pub image: Option<PathBuf>,
    pub url: Option<String>,
    pub locale: String,
    pub meal: Option<String>,
    pub log: bool,
    pub hints: Vec<String>,
    pub user: String,
    pub json: bool,
}

fn image_input(opts: &ScanOptions) -> Result<ImageInput> {
    match (&opts.image, &opts.url) {
        (Some(path), None) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read image: {}", path.display()))?;
            Ok(ImageInput::Bytes(bytes))
        }
        (None, Some(url)) => Ok(ImageInput::Url(url.clone())),
        (Some(_), Some(_)) => bail!("Give either an image path or --url, not both"),
        (None, None) => bail!("Missing image: pass a file path or --url"),
    }
}

pub(crate) async fn cmd_scan(
    service: &PlatescanService,
    vision: &VisionClient,
    opts: ScanOptions,
) -> Result<()> {
    if opts.log && opts.meal.is_none() {
        bail!("--log requires --meal (breakfast, lunch, dinner, snack)");
    }
    if vision.is_stub() && !opts.json {
        eprintln!("Note: no vision API key configured, using the built-in sample response.");
    }

    let request = ScanRequest {
        image: image_input(&opts)?,
        locale: opts.locale,
        meal_type: opts.meal,
        auto_log: opts.log,
        user_id: opts.user,
        hints: parse_hints(&opts.hints)?,
    };

    let outcome = if request.auto_log {
        service.scan_and_log(vision, &request).await?
    } else {
        let items = service
            .resolve_food_image(vision, &request.image, &request.locale, &request.hints)
            .await?;
        ScanOutcome {
            totals: totals(&items),
            items,
            logged_entry_ids: Vec::new(),
            failures: Vec::new(),
        }
    };

    if outcome.items.is_empty() {
        if opts.json {
            println!("[]");
        } else {
            eprintln!("No foods detected in the image");
        }
        process::exit(2);
    }

    if opts.json {
        if request.auto_log {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        } else {
            println!("{}", serde_json::to_string_pretty(&outcome.items)?);
        }
        return Ok(());
    }

    print_item_table(&outcome.items);
    println!("\n  TOTAL: {}", format_macros(&outcome.totals));

    for item in outcome.items.iter().filter(|i| !i.alternatives.is_empty()) {
        let names: Vec<&str> = item
            .alternatives
            .iter()
            .map(|r| r.localized_name(&request.locale))
            .collect();
        println!("  Also matched '{}': {}", item.detection.name, names.join(", "));
    }

    if request.auto_log {
        let logged = outcome.logged_entry_ids.len();
        println!("\nLogged {logged} of {} items.", outcome.items.len());
        for failure in &outcome.failures {
            eprintln!("  Failed: {failure}");
        }
    }

    Ok(())
}
