use crate::services::{lifecycle::SweeperConfig, transaction::RetryPolicy};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub default_tenant: String,
    pub tx_max_attempts: u32,
    pub tx_backoff_ms: u64,
    pub tx_max_backoff_ms: u64,
    pub min_part_size: i64,
    pub sweep_interval_secs: u64,
    pub sweep_bucket_timeout_secs: u64,
    pub sweep_batch_size: usize,
    pub multipart_ttl_hours: i64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Versioned S3-compatible object store with object lock")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object bytes are stored (overrides OBJECT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OBJECT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Tenant used when a request carries no x-amz-tenant-id (overrides OBJECT_STORE_DEFAULT_TENANT)
    #[arg(long)]
    pub default_tenant: Option<String>,

    /// Attempts before a conflicting transaction gives up (overrides OBJECT_STORE_TX_MAX_ATTEMPTS)
    #[arg(long)]
    pub tx_max_attempts: Option<u32>,

    /// Base retry backoff in milliseconds (overrides OBJECT_STORE_TX_BACKOFF_MS)
    #[arg(long)]
    pub tx_backoff_ms: Option<u64>,

    /// Retry backoff cap in milliseconds (overrides OBJECT_STORE_TX_MAX_BACKOFF_MS)
    #[arg(long)]
    pub tx_max_backoff_ms: Option<u64>,

    /// Minimum size of every multipart part but the last (overrides OBJECT_STORE_MIN_PART_SIZE)
    #[arg(long)]
    pub min_part_size: Option<i64>,

    /// Seconds between lifecycle passes (overrides OBJECT_STORE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Per-bucket lifecycle deadline in seconds (overrides OBJECT_STORE_SWEEP_BUCKET_TIMEOUT_SECS)
    #[arg(long)]
    pub sweep_bucket_timeout_secs: Option<u64>,

    /// Listing page size used by the sweeper (overrides OBJECT_STORE_SWEEP_BATCH_SIZE)
    #[arg(long)]
    pub sweep_batch_size: Option<usize>,

    /// Idle hours before a multipart upload is aborted (overrides OBJECT_STORE_MULTIPART_TTL_HOURS)
    #[arg(long)]
    pub multipart_ttl_hours: Option<i64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, |name| env::var(name))?, migrate))
    }

    /// CLI values win over the environment, the environment over defaults.
    fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let text = |name: &str, default: &str| lookup(name).unwrap_or_else(|_| default.into());

        Ok(Self {
            host: args
                .host
                .unwrap_or_else(|| text("OBJECT_STORE_HOST", "0.0.0.0")),
            port: pick(args.port, &lookup, "OBJECT_STORE_PORT", 3000)?,
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| text("OBJECT_STORE_STORAGE_DIR", "./data/objects")),
            database_url: args.database_url.unwrap_or_else(|| {
                text(
                    "OBJECT_STORE_DATABASE_URL",
                    "sqlite://./data/meta/object_store.db",
                )
            }),
            default_tenant: args
                .default_tenant
                .unwrap_or_else(|| text("OBJECT_STORE_DEFAULT_TENANT", "default")),
            tx_max_attempts: pick(args.tx_max_attempts, &lookup, "OBJECT_STORE_TX_MAX_ATTEMPTS", 5)?,
            tx_backoff_ms: pick(args.tx_backoff_ms, &lookup, "OBJECT_STORE_TX_BACKOFF_MS", 10)?,
            tx_max_backoff_ms: pick(
                args.tx_max_backoff_ms,
                &lookup,
                "OBJECT_STORE_TX_MAX_BACKOFF_MS",
                250,
            )?,
            min_part_size: pick(
                args.min_part_size,
                &lookup,
                "OBJECT_STORE_MIN_PART_SIZE",
                5 * 1024 * 1024,
            )?,
            sweep_interval_secs: pick(
                args.sweep_interval_secs,
                &lookup,
                "OBJECT_STORE_SWEEP_INTERVAL_SECS",
                3600,
            )?,
            sweep_bucket_timeout_secs: pick(
                args.sweep_bucket_timeout_secs,
                &lookup,
                "OBJECT_STORE_SWEEP_BUCKET_TIMEOUT_SECS",
                300,
            )?,
            sweep_batch_size: pick(
                args.sweep_batch_size,
                &lookup,
                "OBJECT_STORE_SWEEP_BATCH_SIZE",
                100,
            )?,
            multipart_ttl_hours: pick(
                args.multipart_ttl_hours,
                &lookup,
                "OBJECT_STORE_MULTIPART_TTL_HOURS",
                168,
            )?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.tx_max_attempts.max(1),
            base_backoff: Duration::from_millis(self.tx_backoff_ms),
            max_backoff: Duration::from_millis(self.tx_max_backoff_ms.max(self.tx_backoff_ms)),
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            bucket_timeout: Duration::from_secs(self.sweep_bucket_timeout_secs.max(1)),
            batch_size: self.sweep_batch_size.max(1),
            multipart_ttl: chrono::Duration::hours(self.multipart_ttl_hours.max(1)),
        }
    }
}

/// CLI value, else a parsed environment value, else the default.
fn pick<T, F>(cli: Option<T>, lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match lookup(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
