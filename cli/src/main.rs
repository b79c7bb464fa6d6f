mod commands;
mod config;
mod server;
mod vision_client;

use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    NewReference, ScanOptions, cmd_diary_delete, cmd_diary_show, cmd_foods_add, cmd_foods_delete,
    cmd_foods_import, cmd_foods_list, cmd_foods_search, cmd_foods_show, cmd_scan,
};
use crate::config::{Config, VisionSettings};
use crate::vision_client::VisionClient;
use platescan_core::service::PlatescanService;
use platescan_core::vision::DEFAULT_LOCALE;

#[derive(Parser)]
#[command(
    name = "platescan",
    version,
    about = "Photograph a meal, get its calories and macros, log it to your food diary"
)]
struct Cli {
    /// Use this directory for the database and API key instead of the default
    #[arg(long, global = true, env = "PLATESCAN_DATA_DIR", value_name = "DIR")]
    data_dir: Option<PathBuf>,
    /// Diary user id
    #[arg(long, global = true, env = "PLATESCAN_USER", default_value = "local")]
    user: String,
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(flatten)]
    vision: VisionArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct VisionArgs {
    /// Vision service API key; without one, scans use a fixed sample response
    #[arg(long, global = true, env = "PLATESCAN_VISION_API_KEY", hide_env_values = true)]
    vision_api_key: Option<String>,
    /// Vision model name
    #[arg(long, global = true, env = "PLATESCAN_VISION_MODEL")]
    vision_model: Option<String>,
    /// Vision service base URL
    #[arg(long, global = true, env = "PLATESCAN_VISION_ENDPOINT")]
    vision_endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the foods in a meal photo and estimate their nutrition
    Scan {
        /// Path to the image file
        image: Option<PathBuf>,
        /// Fetch the image from a URL instead of a file
        #[arg(long, conflicts_with = "image")]
        url: Option<String>,
        /// Locale for prompts and display names (e.g. vi, en)
        #[arg(short, long, env = "PLATESCAN_LOCALE", default_value = DEFAULT_LOCALE)]
        locale: String,
        /// Meal type: breakfast, lunch, dinner, snack
        #[arg(short, long)]
        meal: Option<String>,
        /// Log every detected item to the diary (requires --meal)
        #[arg(long)]
        log: bool,
        /// Portion size for a detected food, as NAME=GRAMS (repeatable)
        #[arg(long = "hint", value_name = "NAME=GRAMS")]
        hints: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the nutrition reference dataset
    Foods {
        #[command(subcommand)]
        command: FoodsCommands,
    },
    /// Show or edit the food diary
    Diary {
        #[command(subcommand)]
        command: DiaryCommands,
    },
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
        /// Default locale when a request does not give one
        #[arg(short, long, env = "PLATESCAN_LOCALE", default_value = DEFAULT_LOCALE)]
        locale: String,
    },
}

#[derive(Subcommand)]
enum FoodsCommands {
    /// Import reference foods from a CSV file
    Import {
        /// Path to the CSV file
        file: PathBuf,
        /// Preview import without making changes
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add or replace a single reference food
    Add {
        /// Vietnamese (canonical) name
        name: String,
        /// Calories per reference serving
        #[arg(short, long)]
        calories: f64,
        /// Reference serving weight in grams
        #[arg(short, long, default_value = "100")]
        serving: f64,
        /// Record id (derived from the name if omitted)
        #[arg(long)]
        id: Option<String>,
        /// English name
        #[arg(long)]
        name_en: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// Protein grams per serving
        #[arg(short, long)]
        protein: Option<f64>,
        /// Carbohydrate grams per serving
        #[arg(long)]
        carbs: Option<f64>,
        /// Fat grams per serving
        #[arg(short, long)]
        fat: Option<f64>,
        /// Fiber grams per serving
        #[arg(long)]
        fiber: Option<f64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Search reference foods by name
    Search {
        /// Search query (substring of the Vietnamese or English name)
        query: String,
        #[arg(short, long, env = "PLATESCAN_LOCALE", default_value = DEFAULT_LOCALE)]
        locale: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List reference foods
    List {
        /// Maximum number of records to show
        #[arg(short = 'n', long, default_value = "100")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one reference food by ID
    Show {
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a reference food by ID
    Delete {
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum DiaryCommands {
    /// Show a day's diary entries and totals (defaults to today)
    Show {
        /// Date to show (YYYY-MM-DD, today, yesterday)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a diary entry by ID
    Delete {
        /// Entry ID to delete
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "platescan=debug,platescan_core=debug"
    } else {
        "platescan=info,platescan_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match cli.data_dir {
        Some(dir) => Config::in_dir(dir)?,
        None => Config::load()?,
    };
    let service = PlatescanService::new(&config.db_path)?;
    let vision = VisionClient::new(
        VisionSettings {
            api_key: cli.vision.vision_api_key,
            model: cli.vision.vision_model,
            endpoint: cli.vision.vision_endpoint,
        }
        .into_config(),
    )?;
    let user = cli.user;

    match cli.command {
        Commands::Scan {
            image,
            url,
            locale,
            meal,
            log,
            hints,
            json,
        } => {
            let opts = ScanOptions {
                image,
                url,
                locale,
                meal,
                log,
                hints,
                user,
                json,
            };
            cmd_scan(&service, &vision, opts).await
        }
        Commands::Foods { command } => match command {
            FoodsCommands::Import {
                file,
                dry_run,
                json,
            } => cmd_foods_import(&service, &file, dry_run, json),
            FoodsCommands::Add {
                name,
                calories,
                serving,
                id,
                name_en,
                category,
                protein,
                carbs,
                fat,
                fiber,
                json,
            } => cmd_foods_add(
                &service,
                NewReference {
                    id,
                    name,
                    name_en,
                    category,
                    serving,
                    calories,
                    protein,
                    carbs,
                    fat,
                    fiber,
                },
                json,
            ),
            FoodsCommands::Search {
                query,
                locale,
                json,
            } => cmd_foods_search(&service, &query, &locale, json),
            FoodsCommands::List { limit, json } => cmd_foods_list(&service, limit, json),
            FoodsCommands::Show { id, json } => cmd_foods_show(&service, &id, json),
            FoodsCommands::Delete { id, json } => cmd_foods_delete(&service, &id, json),
        },
        Commands::Diary { command } => match command {
            DiaryCommands::Show { date, json } => cmd_diary_show(&service, &user, date, json),
            DiaryCommands::Delete { id, json } => cmd_diary_delete(&service, &id, json),
        },
        Commands::Serve {
            port,
            bind,
            no_auth,
            locale,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?.0)
            };
            server::start_server(
                service,
                vision,
                server::ServerOptions {
                    port,
                    bind,
                    api_key,
                    user_id: user,
                    default_locale: locale,
                },
            )
            .await
        }
    }
}
