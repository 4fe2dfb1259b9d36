mod args;
mod config;
mod logging;
mod prompt;
mod storage;

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use ingest::{AutoRegister, GeminiRequest, IngestOptions, IngestStats};
use usage_core::{PricingRule, PricingTable, RateLookup};
use usage_db::Db;

use args::{Cli, CodexCommand, Command, GeminiCommand, OpencodeCommand, SourcesCommand};
use config::CliConfig;
use prompt::CliDecider;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "run aborted");
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let loaded = config::load_or_create(cli.config.as_deref()).map_err(anyhow::Error::msg)?;
    logging::init(&loaded.config.log, cli.verbose);
    if loaded.created {
        tracing::info!(path = %loaded.file.display(), "created default config");
    }
    let config = loaded.config;
    let decider = CliDecider::from_flags(cli.yes, cli.no_input);

    match cli.command {
        Command::Gemini {
            command: GeminiCommand::Preprocess { path },
        } => {
            let outcome = ingest::preprocess(&path)?;
            if let Some(converted) = outcome.converted {
                println!("objects_read={}", converted.objects_read);
                println!("records_appended={}", converted.records_appended);
                println!("records_skipped={}", converted.records_skipped);
            }
            println!("project_id={}", outcome.project_id);
            println!("jsonl={}", outcome.jsonl.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Sources {
            command: SourcesCommand::List { family },
        } => {
            let db = open_db(cli.database.as_deref(), &config)?;
            for source in db.list_sources(family.map(Into::into))? {
                println!(
                    "{}\t{}\t{}\t{}",
                    source.family,
                    source.identity,
                    if source.active { "active" } else { "inactive" },
                    source.location
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Codex {
            command:
                CodexCommand::Ingest {
                    sessions_root,
                    full_refresh,
                },
        } => {
            let mut db = open_db(cli.database.as_deref(), &config)?;
            let options = ingest_options(cli.workers, full_refresh, &config)?;
            let root = sessions_root
                .or_else(|| config.codex_sessions_root.clone())
                .unwrap_or_else(ingest::default_codex_sessions_root);
            let stats =
                ingest::ingest_codex_sessions(&mut db, &root, &AutoRegister(decider), &options)?;
            Ok(report(&stats))
        }
        Command::Gemini {
            command:
                GeminiCommand::Ingest {
                    paths,
                    all_active,
                    auto_deactivate,
                    full_refresh,
                },
        } => {
            let mut db = open_db(cli.database.as_deref(), &config)?;
            let options = ingest_options(cli.workers, full_refresh, &config)?;
            let request = GeminiRequest {
                inputs: paths,
                all_active,
                auto_deactivate,
            };
            let stats = ingest::ingest_gemini(&mut db, &request, &decider, &options)?;
            Ok(report(&stats))
        }
        Command::Opencode {
            command:
                OpencodeCommand::Ingest {
                    source_db,
                    full_refresh,
                },
        } => {
            let mut db = open_db(cli.database.as_deref(), &config)?;
            let options = ingest_options(cli.workers, full_refresh, &config)?;
            let source = source_db
                .or_else(|| config.opencode_source_db.clone())
                .unwrap_or_else(ingest::default_opencode_db);
            let stats =
                ingest::ingest_opencode(&mut db, &source, &AutoRegister(decider), &options)?;
            Ok(report(&stats))
        }
    }
}

fn open_db(explicit: Option<&Path>, config: &CliConfig) -> Result<Db> {
    let resolved = storage::resolve_database(explicit.or(config.database_path.as_deref()))
        .map_err(anyhow::Error::msg)?;
    tracing::debug!(
        path = %resolved.path.display(),
        existing = resolved.matched_existing,
        "opening database"
    );
    let mut db = Db::open(&resolved.path)
        .with_context(|| format!("open database {}", resolved.path.display()))?;
    db.migrate().context("migrate database")?;
    Ok(db)
}

fn ingest_options(
    workers: Option<usize>,
    full_refresh: bool,
    config: &CliConfig,
) -> Result<IngestOptions> {
    let mut options = IngestOptions {
        full_refresh,
        ..IngestOptions::default()
    };
    if let Some(workers) = workers.or(config.workers) {
        options.workers = workers.max(1);
    }
    if let Some(path) = &config.pricing_file {
        options.rates = Some(load_pricing(path)?);
    }
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("install interrupt handler")?;
    options.cancel = Some(cancel);
    Ok(options)
}

fn load_pricing(path: &Path) -> Result<Arc<dyn RateLookup>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read pricing file {}", path.display()))?;
    let rules: Vec<PricingRule> = serde_json::from_str(&contents)
        .with_context(|| format!("parse pricing file {}", path.display()))?;
    tracing::debug!(path = %path.display(), rules = rules.len(), "loaded pricing rules");
    Ok(Arc::new(PricingTable::new(rules)))
}

fn report(stats: &IngestStats) -> ExitCode {
    for line in stats.counter_lines() {
        println!("{line}");
    }
    for issue in &stats.issues {
        println!("failed {}: {}", issue.location, issue.message);
    }
    if stats.cancelled {
        eprintln!("cancelled; committed inputs are kept");
    }
    if stats.has_failures() || stats.cancelled {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
