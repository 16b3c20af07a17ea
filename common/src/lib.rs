/*!
common/src/lib.rs

Shared configuration types and DB helper functions for newsgate.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader for a TOML config file, with default/override merging
- Helpers to initialize and migrate an SQLite database
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/newsgate.db")
    pub path: String,
}

/// Tuning knobs of the selection engine.
///
/// Every field has a default so a config file only needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Items per classification call.
    pub batch_size: usize,
    /// Minimum score (0..=100) for an item to reach the duplicate guard.
    pub threshold: u8,
    /// Items the downstream generator intends to produce per cycle.
    pub generation_limit: usize,
    /// Scoring stops once `generation_limit * early_exit_multiplier` items pass the threshold.
    pub early_exit_multiplier: usize,
    /// Identity keys per "which of these exist" round-trip.
    pub chunk_size: usize,
    /// Total attempts for a rate-limited call, first try included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
    /// Concurrent single-item calls when a batch falls back.
    pub fallback_concurrency: usize,
    /// How many recently published titles the duplicate guard compares against.
    pub duplicate_pool_size: usize,
}

/// Upper bound for `chunk_size`; each key is one bound SQL parameter and SQLite caps those.
pub const MAX_CHUNK_SIZE: usize = 1000;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            threshold: 85,
            generation_limit: 2,
            early_exit_multiplier: 2,
            chunk_size: 100,
            max_attempts: 5,
            base_delay_ms: 2000,
            max_jitter_ms: 1000,
            fallback_concurrency: 5,
            duplicate_pool_size: 30,
        }
    }
}

impl EngineConfig {
    /// Number of above-threshold items after which scoring stops. Never below 1.
    pub fn early_exit_target(&self) -> usize {
        self.generation_limit
            .saturating_mul(self.early_exit_multiplier)
            .max(1)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("engine.batch_size must be at least 1");
        }
        if self.chunk_size == 0 {
            anyhow::bail!("engine.chunk_size must be at least 1");
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!(
                "engine.chunk_size must be at most {}, got {}",
                MAX_CHUNK_SIZE,
                self.chunk_size
            );
        }
        if self.max_attempts == 0 {
            anyhow::bail!("engine.max_attempts must be at least 1");
        }
        if self.fallback_concurrency == 0 {
            anyhow::bail!("engine.fallback_concurrency must be at least 1");
        }
        if self.threshold > 100 {
            anyhow::bail!("engine.threshold must be within 0..=100, got {}", self.threshold);
        }
        Ok(())
    }
}

/// Feed fetching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Entries published earlier than this many hours ago are ignored (undated entries are kept)
    pub lookback_hours: Option<u64>,
    pub fetch_timeout_seconds: Option<u64>,
}

/// One feed the ingestion adapter pulls candidates from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    /// Free-form grouping bucket copied onto every candidate from this source
    pub region: Option<String>,
}

/// Remote LLM config (OpenAI-compatible chat completions endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
}

/// LLM top-level config grouping the shared endpoint and task-specific overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "remote", "none"
    // Fallback: single remote config
    pub remote: Option<RemoteLlmConfig>,
    // Task-specific configs
    pub scoring: Option<RemoteLlmConfig>,
    pub duplicate: Option<RemoteLlmConfig>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub ingestion: Option<IngestionConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    pub llm: Option<LlmConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        cfg.engine.validate()?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Run SQL migrations using sqlx's migration macro.
///
/// The `migrations` directory lives at the workspace root and is embedded at compile time.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;

    Ok(())
}

/// Initialize an SQLite connection pool.
///
/// This function will create the parent directory if necessary, ensure the DB file exists
/// (attempting to create it if missing), and return a configured `SqlitePool` with WAL
/// journaling and at most 5 connections.
///
/// Example:
///   let pool = init_db_pool("data/newsgate.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create DB parent directory: {}", parent.display())
        })?;
    }

    // Creating the file up front surfaces permission and path problems with a clearer error
    // than the SQLite connection attempt would.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// Open a single-connection in-memory database with the schema applied.
///
/// SQLite gives every connection its own in-memory database, so the pool is capped at one.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .context("Failed to open in-memory sqlite database")?;
    run_migrations(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn config_from_string_and_db_pool() {
        let toml = r#"
            [database]
            path = "data/test.db"

            [engine]
            threshold = 70
            generation_limit = 3

            [[sources]]
            name = "coindesk"
            url = "https://www.coindesk.com/arc/outboundfeeds/rss/"
            region = "Crypto"
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert_eq!(cfg.engine.threshold, 70);
        assert_eq!(cfg.engine.batch_size, 10, "unset fields keep their defaults");
        assert_eq!(cfg.engine.early_exit_target(), 6);
        assert_eq!(cfg.sources.len(), 1);
        assert_eq!(cfg.sources[0].region.as_deref(), Some("Crypto"));

        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("newsgate.db");
        let db_path_str = db_path.to_string_lossy().to_string();

        let pool = init_db_pool(&db_path_str).await.expect("init pool");
        run_migrations(&pool).await.expect("migrate");
        let conn = pool.acquire().await.expect("acquire conn");
        drop(conn);
    }

    #[tokio::test]
    async fn override_file_wins_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");
        tokio::fs::write(
            &default_path,
            "[database]\npath = \"data/default.db\"\n\n[engine]\nbatch_size = 20\nthreshold = 80\n",
        )
        .await
        .unwrap();
        tokio::fs::write(&override_path, "[engine]\nthreshold = 90\n")
            .await
            .unwrap();

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load merged config");

        assert_eq!(cfg.database.path, "data/default.db");
        assert_eq!(cfg.engine.batch_size, 20);
        assert_eq!(cfg.engine.threshold, 90);
    }

    #[test]
    fn early_exit_target_is_never_zero() {
        let cfg = EngineConfig {
            generation_limit: 0,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.early_exit_target(), 1);
    }

    #[test]
    fn validate_rejects_zero_batch_size() {
        let cfg = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_caps_chunk_size() {
        let at_cap = EngineConfig {
            chunk_size: MAX_CHUNK_SIZE,
            ..EngineConfig::default()
        };
        assert!(at_cap.validate().is_ok());

        let over = EngineConfig {
            chunk_size: MAX_CHUNK_SIZE + 1,
            ..EngineConfig::default()
        };
        let err = over.validate().unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }
}
