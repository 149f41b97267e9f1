//! # Basket CLI (`basket`)
//!
//! Operator interface to the ingestion core. Useful for bootstrapping a
//! database, loading the product catalog, checking prompt templates, and
//! exercising the pipeline by hand against a real model endpoint.
//!
//! ## Usage
//!
//! ```bash
//! basket --config ./config/basket.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `basket init` | Create the SQLite database and run schema migrations |
//! | `basket prompts check` | Verify the required prompt templates exist |
//! | `basket catalog import <json>` | Upsert product reference entries |
//! | `basket catalog list` | Print the product catalog |
//! | `basket ingest "<text>" --user <id> --list <id>` | Parse, store, and list items |
//! | `basket translate <items...> --to <locale>` | Batch-translate through the cache |
//! | `basket detect "<text>"` | Detect language and whether text is a shopping list |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); results go to stdout as
//! plain lines followed by `ok`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use basket::catalog::{CatalogReader, SqliteCatalog};
use basket::config::{self, Config};
use basket::db;
use basket::fanout::{Fanout, LogNotifier, SqliteFamilyDirectory};
use basket::ingest::{IngestRequest, Ingestor};
use basket::lists::SqliteListService;
use basket::migrate;
use basket::model::{HttpModelClient, ReasoningModel};
use basket::models::{CatalogEntry, SourceHint};
use basket::prompt::PromptAssembler;
use basket::scope::CallScope;
use basket::store::SqliteStore;
use basket::translate::{TranslationCache, Translator};

/// Basket: natural-language shopping-list ingestion.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/basket.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "basket",
    about = "Basket: natural-language item ingestion for shared shopping lists",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/basket.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Inspect prompt templates.
    Prompts {
        #[command(subcommand)]
        action: PromptsAction,
    },

    /// Manage the product reference catalog.
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Ingest free text into a list.
    ///
    /// Calls the configured model, persists the parsed items as training
    /// data, and adds them to the list. With `--family`, other members are
    /// notified through the log.
    Ingest {
        /// The free-text submission, e.g. "молоко 2л, хлеб".
        text: String,

        /// Submitting user id.
        #[arg(long)]
        user: Uuid,

        /// Target list id.
        #[arg(long)]
        list: Uuid,

        /// Language tag; detected when omitted.
        #[arg(long, default_value = "")]
        lang: String,

        /// Family to notify.
        #[arg(long)]
        family: Option<Uuid>,
    },

    /// Translate item names into a locale, using the translation cache.
    Translate {
        /// Item names.
        #[arg(required = true)]
        items: Vec<String>,

        /// Target locale, e.g. `en`.
        #[arg(long)]
        to: String,
    },

    /// Detect the language of a text and whether it reads as a shopping list.
    Detect {
        text: String,
    },
}

#[derive(Subcommand)]
enum PromptsAction {
    /// Check that every required template is present and readable.
    Check,
}

#[derive(Subcommand)]
enum CatalogAction {
    /// Upsert entries from a JSON array file.
    Import {
        /// Path to a JSON file: `[{"name_en": ..., "category": ...}, ...]`.
        path: PathBuf,
    },
    /// Print every entry, grouped by category.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("database initialized: {}", cfg.db.path.display());
        }
        Commands::Prompts {
            action: PromptsAction::Check,
        } => {
            run_prompts_check(&cfg)?;
        }
        Commands::Catalog { action } => match action {
            CatalogAction::Import { path } => run_catalog_import(&cfg, &path).await?,
            CatalogAction::List => run_catalog_list(&cfg).await?,
        },
        Commands::Ingest {
            text,
            user,
            list,
            lang,
            family,
        } => {
            let req = IngestRequest {
                text,
                language: lang,
                submitter_id: user,
                list_id: list,
                family_id: family,
                source: SourceHint::Keyboard,
            };
            run_ingest(&cfg, req).await?;
        }
        Commands::Translate { items, to } => {
            run_translate(&cfg, &items, &to).await?;
        }
        Commands::Detect { text } => {
            run_detect(&cfg, &text).await?;
        }
    }

    println!("ok");
    Ok(())
}

fn run_prompts_check(cfg: &Config) -> anyhow::Result<()> {
    let prompts = PromptAssembler::new(&cfg.prompts.prompts_dir);
    prompts
        .validate()
        .with_context(|| format!("prompt templates incomplete in {}", prompts.dir().display()))?;

    println!("prompts: {}", prompts.dir().display());
    println!("languages: {}", prompts.available_languages().join(", "));
    Ok(())
}

async fn run_catalog_import(cfg: &Config, path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
    let entries: Vec<CatalogEntry> =
        serde_json::from_str(&content).with_context(|| "Failed to parse catalog file")?;

    let pool = db::connect(cfg).await?;
    let written = SqliteCatalog::new(pool).import(&entries).await?;
    println!("imported: {}", written);
    Ok(())
}

async fn run_catalog_list(cfg: &Config) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let entries = SqliteCatalog::new(pool).list_all().await?;

    let mut current = "";
    for entry in &entries {
        if entry.category != current {
            println!("[{}]", entry.category);
            current = entry.category.as_str();
        }
        let names = entry.names();
        println!("  {}\t{}\t{}", names[0], names[1], names[2]);
    }
    println!("entries: {}", entries.len());
    Ok(())
}

/// Scope cancelled on Ctrl-C.
fn interactive_scope() -> CallScope {
    let scope = CallScope::new();
    let token = scope.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            token.cancel();
        }
    });
    scope
}

fn model_client(cfg: &Config) -> anyhow::Result<Arc<dyn ReasoningModel>> {
    let client = HttpModelClient::new(&cfg.model).context("Failed to build model client")?;
    Ok(Arc::new(client))
}

async fn ingestor(cfg: &Config) -> anyhow::Result<Ingestor> {
    let pool = db::connect(cfg).await?;
    let fanout = Fanout::new(
        Arc::new(SqliteFamilyDirectory::new(pool.clone())),
        Arc::new(LogNotifier),
    );

    Ok(Ingestor::new(
        model_client(cfg)?,
        PromptAssembler::new(&cfg.prompts.prompts_dir),
        Arc::new(SqliteCatalog::new(pool.clone())),
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(SqliteListService::new(pool)),
    )
    .configured(cfg)
    .with_fanout(fanout))
}

async fn run_ingest(cfg: &Config, req: IngestRequest) -> anyhow::Result<()> {
    let ingestor = ingestor(cfg).await?;
    let scope = interactive_scope();

    let outcome = ingestor.ingest(&req, &scope).await?;

    println!("language: {}", outcome.language);
    for item in &outcome.items {
        println!(
            "item: {}\t{}\t{}\t{:.2}",
            item.standardized_name,
            item.quantity_display().unwrap_or_default(),
            item.category,
            item.confidence
        );
    }
    for name in &outcome.failed {
        println!("failed: {}", name);
    }
    println!("listed: {}", outcome.list_items.len());

    if let Some(handle) = outcome.fanout {
        let report = handle.await.context("fanout task panicked")?;
        println!(
            "notified: {} of {} ({} failed)",
            report.delivered, report.recipients, report.failed
        );
    }
    Ok(())
}

async fn run_translate(cfg: &Config, items: &[String], target_locale: &str) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let cache = TranslationCache::new(
        pool,
        model_client(cfg)?,
        PromptAssembler::new(&cfg.prompts.prompts_dir),
    );
    let scope = interactive_scope();

    let batch = cache.batch_translate(items, target_locale, &scope).await?;
    println!(
        "detected: {}\ttarget: {}\tconfidence: {:.2}",
        batch.detected_language, batch.target_language, batch.confidence
    );
    for t in &batch.translations {
        println!(
            "{}\t{}\t{:.2}{}",
            t.original_text,
            t.translated_text,
            t.confidence,
            if t.from_cache { "\tcached" } else { "" }
        );
    }
    Ok(())
}

async fn run_detect(cfg: &Config, text: &str) -> anyhow::Result<()> {
    let ingestor = ingestor(cfg).await?;
    let scope = interactive_scope();

    let language = ingestor.detect_language(text, &scope).await?;
    println!("language: {}", language);

    let detection = ingestor.detect_product_list(text, &scope).await?;
    println!(
        "product_list: {}\tconfidence: {:.2}\titems: {}",
        detection.is_product_list, detection.confidence, detection.detected_items_count
    );
    if !detection.sample_items.is_empty() {
        println!("samples: {}", detection.sample_items.join(", "));
    }
    Ok(())
}
