/*
newsgate - single-binary main.rs
Runs one selection cycle for a topic, or records the outcome of a finished cycle.
Scheduling is left to cron or whatever runs this binary.
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{Config, LlmConfig, RemoteLlmConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use common::{init_db_pool, run_migrations};

use newsgate::cancel::CancellationToken;
use newsgate::engine::Engine;
use newsgate::ingestion;
use newsgate::llm::analyst::PromptedAnalyst;
use newsgate::llm::remote::RemoteLlmProvider;
use newsgate::llm::LlmProvider;
use newsgate::model::CycleOutcome;
use newsgate::publication::SqlitePublicationLog;
use newsgate::retry::RetryPolicy;
use newsgate::storage::SqliteRecordStore;

#[derive(Parser, Debug)]
#[command(name = "newsgate", about = "Newsgate acquisition-to-publication engine")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest all sources, run one cycle and print the report as JSON
    Select {
        #[arg(long)]
        topic: String,

        /// Do not record the approved items in the publication log
        #[arg(long)]
        dry_run: bool,
    },
    /// Publish a finished cycle's outcome and make it the topic's current one
    RecordOutcome {
        #[arg(long)]
        topic: String,

        /// JSON file holding the cycle outcome
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
    },
}

/// Which capability an LLM endpoint is created for.
#[derive(Debug, Clone, Copy)]
enum LlmTask {
    Scoring,
    Duplicate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    // Load configuration with defaults
    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(default_path.as_path()) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let db_pool = match init_db_pool(&config.database.path).await {
        Ok(p) => p,
        Err(e) => {
            error!(%e, db_path = %config.database.path, "failed to initialize database pool");
            return Err(e);
        }
    };
    run_migrations(&db_pool).await?;
    info!(db_path = %config.database.path, "database ready");

    let llm_config = config
        .llm
        .as_ref()
        .context("an [llm] section is required")?;
    let classifier = Arc::new(PromptedAnalyst::new(create_llm_provider(llm_config, LlmTask::Scoring)?));
    let judge = Arc::new(PromptedAnalyst::new(create_llm_provider(llm_config, LlmTask::Duplicate)?));

    let engine = Engine::new(
        config.engine.clone(),
        classifier,
        judge,
        Arc::new(SqliteRecordStore::new(db_pool.clone())),
        Arc::new(SqlitePublicationLog::new(db_pool.clone())),
    )?;

    match args.command {
        Command::Select { topic, dry_run } => {
            let retry = RetryPolicy::from_config(&config.engine);
            let candidates =
                ingestion::collect_candidates(&config.sources, config.ingestion.as_ref(), &retry).await?;

            let report = engine
                .run_cycle(&topic, candidates, &CancellationToken::new())
                .await?;

            if dry_run {
                info!(topic = %topic, "dry run, publication log left untouched");
            } else {
                engine.publish_selection(&topic, &report.approved).await?;
            }

            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::RecordOutcome { topic, file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read outcome file: {}", file.display()))?;
            let outcome: CycleOutcome = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse outcome file: {}", file.display()))?;

            let recorded = engine.complete_cycle(&topic, &[], outcome).await?;
            info!(
                topic = %topic,
                period = %recorded.period,
                published_ref = ?recorded.published_ref,
                "outcome recorded"
            );
        }
    }

    Ok(())
}

fn create_llm_provider(llm_config: &LlmConfig, task: LlmTask) -> Result<Arc<dyn LlmProvider>> {
    let adapter = llm_config.adapter.as_deref().unwrap_or("none");
    match adapter {
        "remote" => {
            // Task-specific endpoint first, shared one otherwise
            let endpoint_config: Option<&RemoteLlmConfig> = match task {
                LlmTask::Scoring => llm_config.scoring.as_ref().or(llm_config.remote.as_ref()),
                LlmTask::Duplicate => llm_config.duplicate.as_ref().or(llm_config.remote.as_ref()),
            };

            let Some(remote_config) = endpoint_config else {
                anyhow::bail!("Remote adapter selected but no LLM config found for {:?}", task)
            };

            // Fetch API key from env var
            let api_key_env = remote_config
                .api_key_env
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Missing api_key_env in remote config"))?;

            let api_key = std::env::var(api_key_env)
                .with_context(|| format!("LLM API key env var '{}' not set", api_key_env))?;

            let model = remote_config.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            let api_url = remote_config
                .api_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434/v1/chat/completions".to_string());
            let timeout_secs = remote_config.timeout_seconds.unwrap_or(30);
            let max_tokens = remote_config.max_tokens.unwrap_or(1500);

            let provider = RemoteLlmProvider::new(api_url, api_key, model).with_defaults(
                timeout_secs,
                max_tokens,
                0.2,
            );
            info!(task = ?task, model = %provider.model(), "LLM provider initialized");
            Ok(Arc::new(provider))
        }
        "none" => {
            anyhow::bail!("LLM adapter 'none' cannot score candidates")
        }
        _ => anyhow::bail!("Unknown LLM adapter type: {}", adapter),
    }
}
