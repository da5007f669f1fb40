//! Centralized application configuration.
//!
//! Environment variables are the source of truth; a handful of CLI flags
//! override them for local runs. Missing or unparseable required values are
//! fatal at startup.

use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::time::Duration;

/// Which object-store backend to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Objects on the local filesystem under `storage_dir`.
    File,
    /// Objects held in process memory; for tests and development.
    Memory,
}

/// Deployment environment, mirrored into log configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    /// Local development.
    Development,
    /// Production deployment.
    Production,
    /// Test harness.
    Test,
}

/// Runtime configuration for the edge, resolver, and worker.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bind address for the HTTP edge.
    pub host: String,
    /// HTTP listen port.
    pub port: u16,
    /// Postgres connection string (metadata store and queue broker).
    pub database_url: String,
    /// Object-store backend selector.
    pub storage_backend: StorageBackend,
    /// Filesystem root for the `file` backend.
    pub storage_dir: String,
    /// Logical bucket name recorded on variant records.
    pub bucket: String,
    /// Public base URL redirects are formed against.
    pub public_base_url: String,
    /// Render workers per process.
    pub worker_concurrency: usize,
    /// Bound on full retry cycles per record.
    pub max_requeues: i32,
    /// Origins allowed by the CORS layer; empty allows none.
    pub allowed_origins: Vec<String>,
    /// Requests allowed per client IP per window.
    pub rate_limit_max: u32,
    /// Rate-limit window length.
    pub rate_limit_duration: Duration,
    /// Request-path prefix that must never be served (loop guard when the
    /// service fronts its own rendition bucket).
    pub resized_image_path: Option<String>,
    /// Deployment environment.
    pub env: AppEnv,
}

/// CLI overrides for local runs.
#[derive(Parser, Debug)]
#[command(author, version, about = "On-demand image rendition service")]
pub struct Args {
    /// Host to bind to (overrides APP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides APP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Postgres URL (overrides DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object storage directory (overrides STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Run pending migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables and CLI args. Returns the config and the
    /// migrate-and-exit flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let cfg = Self::from_env(args.host, args.port, args.database_url, args.storage_dir)?;
        Ok((cfg, args.migrate))
    }

    fn from_env(
        host_override: Option<String>,
        port_override: Option<u16>,
        database_override: Option<String>,
        storage_override: Option<String>,
    ) -> Result<Self> {
        let host = host_override
            .or_else(|| env::var("APP_HOST").ok())
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match port_override {
            Some(p) => p,
            None => parse_env("APP_PORT", 3000)?,
        };

        let database_url = database_override
            .or_else(|| env::var("DATABASE_URL").ok())
            .context("DATABASE_URL must be set")?;

        let storage_backend = match env::var("STORAGE_BACKEND").as_deref() {
            Ok("memory") => StorageBackend::Memory,
            Ok("file") | Err(_) => StorageBackend::File,
            Ok(other) => anyhow::bail!("unknown STORAGE_BACKEND `{other}`"),
        };
        let storage_dir = storage_override
            .or_else(|| env::var("STORAGE_DIR").ok())
            .unwrap_or_else(|| "./data/objects".into());

        let bucket = env::var("BUCKET_NAME").unwrap_or_else(|_| "images".into());
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"));

        let worker_concurrency = parse_env("WORKER_CONCURRENCY", 2usize)?;
        let max_requeues = parse_env("MAX_REQUEUES", 2i32)?;

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .map(|v| parse_origins(&v))
            .unwrap_or_default();

        let rate_limit_max = parse_env("RATE_LIMIT_MAX", 100u32)?;
        let rate_limit_duration =
            Duration::from_secs(parse_env("RATE_LIMIT_DURATION", 60u64)?);

        let resized_image_path = env::var("RESIZED_IMAGE_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map(|p| {
                if p.starts_with('/') {
                    p
                } else {
                    format!("/{p}")
                }
            });

        let app_env = match env::var("APP_ENV").as_deref() {
            Ok("production") => AppEnv::Production,
            Ok("test") => AppEnv::Test,
            _ => AppEnv::Development,
        };

        Ok(Self {
            host,
            port,
            database_url,
            storage_backend,
            storage_dir,
            bucket,
            public_base_url,
            worker_concurrency,
            max_requeues,
            allowed_origins,
            rate_limit_max,
            rate_limit_duration,
            resized_image_path,
            env: app_env,
        })
    }

    /// Socket address string for the listener.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {key} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {key}")),
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_end_matches('/').to_string())
        .collect()
}
