use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{collections::HashMap, env, fs, str::FromStr, time::Duration};

use crate::models::plan::{Plan, PlanLimits};

const MIB: u64 = 1024 * 1024;
/// Local development address of the share front end.
const DEFAULT_SHARE_URL: &str = "http://localhost:5173";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Externally reachable origin of this API. Tracking links point here.
    pub public_url: String,
    /// Origin of the web front end that renders `/s/{slug}` share pages.
    pub share_url: String,
    pub storage: StorageConfig,
    pub uploads: UploadConfig,
    pub sweep: SweepConfig,
    pub smtp: Option<SmtpConfig>,
    pub notify_max_attempts: u32,
    pub admin_token: Option<String>,
    pub plans: HashMap<Plan, PlanLimits>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Use the in-memory backend instead of S3.
    pub mock: bool,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub part_size: u64,
    pub part_url_ttl: Duration,
    pub download_url_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub batch_size: u32,
    pub orphan_grace: Duration,
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub starttls: bool,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("from", &self.from)
            .field("starttls", &self.starttls)
            .finish_non_exhaustive()
    }
}

/// What the process should do after loading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    Sweep,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "File transfer and share-link service")]
pub struct Args {
    /// Host to bind to (overrides FILESHARE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILESHARE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides FILESHARE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL of this API, used for tracking links (overrides FILESHARE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Base URL of the share front end serving /s/{slug} (overrides FILESHARE_SHARE_URL)
    #[arg(long)]
    pub share_url: Option<String>,

    /// Use the in-memory storage backend (overrides FILESHARE_MOCK_STORAGE)
    #[arg(long)]
    pub mock_storage: bool,

    /// S3 bucket (overrides FILESHARE_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// S3 region (overrides FILESHARE_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Custom endpoint for S3-compatible providers (overrides FILESHARE_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// JSON file with per-plan limits (overrides FILESHARE_PLANS_FILE)
    #[arg(long)]
    pub plans_file: Option<String>,

    /// Run migrations and exit
    #[arg(long, conflicts_with = "sweep")]
    pub migrate: bool,

    /// Run one expiration sweep and exit
    #[arg(long)]
    pub sweep: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();

        let env_host = env::var("FILESHARE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("FILESHARE_PORT", 3000u16)?;
        let env_db = env::var("FILESHARE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/fileshare.db".into());
        let env_public = env::var("FILESHARE_PUBLIC_URL").ok();
        let env_share = env::var("FILESHARE_SHARE_URL").ok();
        let env_mock = env_parse("FILESHARE_MOCK_STORAGE", false)?;

        let storage = StorageConfig {
            mock: args.mock_storage || env_mock,
            bucket: args
                .s3_bucket
                .or_else(|| env::var("FILESHARE_S3_BUCKET").ok())
                .unwrap_or_default(),
            region: args
                .s3_region
                .or_else(|| env::var("FILESHARE_S3_REGION").ok())
                .unwrap_or_else(|| "us-east-1".into()),
            endpoint: args
                .s3_endpoint
                .or_else(|| env::var("FILESHARE_S3_ENDPOINT").ok()),
        };
        if !storage.mock && storage.bucket.is_empty() {
            bail!("FILESHARE_S3_BUCKET is required unless mock storage is enabled");
        }

        let uploads = UploadConfig {
            part_size: env_parse("FILESHARE_PART_SIZE", 10 * MIB)?,
            part_url_ttl: Duration::from_secs(env_parse("FILESHARE_PART_URL_TTL_SECS", 3600)?),
            download_url_ttl: Duration::from_secs(env_parse(
                "FILESHARE_DOWNLOAD_URL_TTL_SECS",
                300,
            )?),
        };
        if uploads.part_size < 5 * MIB && !storage.mock {
            bail!("FILESHARE_PART_SIZE must be at least 5 MiB for S3 multipart uploads");
        }

        let sweep = SweepConfig {
            batch_size: env_parse("FILESHARE_SWEEP_BATCH", 100)?,
            orphan_grace: Duration::from_secs(
                env_parse::<u64>("FILESHARE_ORPHAN_GRACE_HOURS", 24)? * 3600,
            ),
        };

        let plans = match args
            .plans_file
            .or_else(|| env::var("FILESHARE_PLANS_FILE").ok())
        {
            Some(path) => load_plans(&path)?,
            None => PlanLimits::default_table(),
        };

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.sweep {
            RunMode::Sweep
        } else {
            RunMode::Serve
        };

        let port = args.port.unwrap_or(env_port);
        let public_url = args
            .public_url
            .or(env_public)
            .unwrap_or_else(|| format!("http://localhost:{}", port));
        let share_url = match args.share_url.or(env_share) {
            Some(url) => url,
            None => {
                if mode == RunMode::Serve {
                    tracing::warn!(
                        share_url = DEFAULT_SHARE_URL,
                        "FILESHARE_SHARE_URL is not set; emailed share links use the default"
                    );
                }
                DEFAULT_SHARE_URL.to_string()
            }
        };

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            database_url: args.database_url.unwrap_or(env_db),
            public_url: public_url.trim_end_matches('/').to_string(),
            share_url: share_url.trim_end_matches('/').to_string(),
            storage,
            uploads,
            sweep,
            smtp: smtp_from_env()?,
            notify_max_attempts: env_parse("FILESHARE_NOTIFY_MAX_ATTEMPTS", 3)?,
            admin_token: env::var("FILESHARE_ADMIN_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            plans,
        };

        Ok((cfg, mode))
    }

    /// Configuration for tests and local experiments: mock storage, in-memory
    /// SQLite, built-in plan table.
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: "sqlite::memory:".into(),
            public_url: "http://api.share.test".into(),
            share_url: "http://share.test".into(),
            storage: StorageConfig {
                mock: true,
                bucket: "test-bucket".into(),
                region: "us-east-1".into(),
                endpoint: None,
            },
            uploads: UploadConfig {
                part_size: 10 * MIB,
                part_url_ttl: Duration::from_secs(3600),
                download_url_ttl: Duration::from_secs(300),
            },
            sweep: SweepConfig {
                batch_size: 100,
                orphan_grace: Duration::from_secs(24 * 3600),
            },
            smtp: None,
            notify_max_attempts: 3,
            admin_token: None,
            plans: PlanLimits::default_table(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn plan_limits(&self, plan: Plan) -> Option<&PlanLimits> {
        self.plans.get(&plan)
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn smtp_from_env() -> Result<Option<SmtpConfig>> {
    let Ok(host) = env::var("FILESHARE_SMTP_HOST") else {
        return Ok(None);
    };
    let from = env::var("FILESHARE_SMTP_FROM")
        .context("FILESHARE_SMTP_FROM is required when FILESHARE_SMTP_HOST is set")?;
    Ok(Some(SmtpConfig {
        host,
        port: env_parse("FILESHARE_SMTP_PORT", 587)?,
        username: env::var("FILESHARE_SMTP_USER").ok(),
        password: env::var("FILESHARE_SMTP_PASSWORD").ok(),
        from,
        starttls: env_parse("FILESHARE_SMTP_STARTTLS", true)?,
    }))
}

fn load_plans(path: &str) -> Result<HashMap<Plan, PlanLimits>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading plans file {}", path))?;
    let plans: HashMap<Plan, PlanLimits> =
        serde_json::from_str(&raw).with_context(|| format!("parsing plans file {}", path))?;
    if plans.is_empty() {
        bail!("plans file {} defines no plans", path);
    }
    for (plan, limits) in &plans {
        if limits.expiry_days > limits.max_expiry_days {
            bail!(
                "plan {}: expiry_days ({}) exceeds max_expiry_days ({})",
                plan,
                limits.expiry_days,
                limits.max_expiry_days
            );
        }
    }
    Ok(plans)
}
