//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::{request::RenderRequestInput, types::Role};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "fractory";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const DEFAULT_WORKER_RECEIVE_BATCH: u32 = 1;
const DEFAULT_WORKER_WAIT_SECS: u64 = 20;
const DEFAULT_WORKER_VISIBILITY_TIMEOUT_SECS: u64 = 300;
const DEFAULT_WORKER_IDLE_BACKOFF_MS: u64 = 500;
const DEFAULT_WORKER_MAX_RECEIVE_COUNT: u32 = 5;
const DEFAULT_RENDER_MAX_TIME_SECS: u64 = 120;
const DEFAULT_PENDING_TIMEOUT_SECS: u64 = 10;
const DEFAULT_GENERATING_TIMEOUT_SECS: u64 = 180;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
const DEFAULT_SWEEP_LIMIT: u32 = 500;
const DEFAULT_ARTIFACT_ROOT: &str = "artifacts";
const DEFAULT_ARTIFACT_BASE_URL: &str = "http://127.0.0.1:3000/artifacts";
const DEFAULT_PRESIGN_TTL_SECS: u64 = 3600;
const DEFAULT_CACHE_TTL_SECS: u64 = 60;
const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Command-line arguments for the fractory binary.
#[derive(Debug, Parser)]
#[command(name = "fractory", version, about = "Fingerprint-deduplicated fractal renderer")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FRACTORY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the queue workers and the stale-job sweeper against Postgres.
    Worker(WorkerArgs),
    /// Render one request straight to a PNG file, bypassing the queue.
    Render(RenderArgs),
    /// Submit one request through the in-memory pipeline and print the final status.
    Local(LocalArgs),
    /// Apply database migrations.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the number of concurrent poll loops.
    #[arg(long = "concurrency", value_name = "COUNT")]
    pub concurrency: Option<u32>,

    /// Override the per-render time budget.
    #[arg(long = "render-max-time-seconds", value_name = "SECONDS")]
    pub render_max_time_seconds: Option<u64>,

    /// Override the artifact root directory.
    #[arg(long = "artifacts-root", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub artifacts_root: Option<PathBuf>,
}

/// Render parameters as flags; unset flags take the request defaults.
#[derive(Debug, Args, Default, Clone)]
pub struct RequestArgs {
    #[arg(long, value_name = "PIXELS")]
    pub width: Option<u32>,
    #[arg(long, value_name = "PIXELS")]
    pub height: Option<u32>,
    #[arg(long = "max-iterations", value_name = "COUNT")]
    pub max_iterations: Option<u32>,
    #[arg(long, value_name = "EXPONENT")]
    pub power: Option<f64>,
    #[arg(long = "c-real", value_name = "VALUE", allow_hyphen_values = true)]
    pub c_real: Option<f64>,
    #[arg(long = "c-imag", value_name = "VALUE", allow_hyphen_values = true)]
    pub c_imag: Option<f64>,
    #[arg(long, value_name = "FACTOR")]
    pub scale: Option<f64>,
    #[arg(long = "offset-x", value_name = "VALUE", allow_hyphen_values = true)]
    pub offset_x: Option<f64>,
    #[arg(long = "offset-y", value_name = "VALUE", allow_hyphen_values = true)]
    pub offset_y: Option<f64>,
    /// rainbow | greyscale | fire | default
    #[arg(long = "colour-scheme", value_name = "SCHEME")]
    pub colour_scheme: Option<String>,
}

impl RequestArgs {
    pub fn to_input(&self) -> RenderRequestInput {
        RenderRequestInput {
            width: self.width,
            height: self.height,
            max_iterations: self.max_iterations,
            power: self.power,
            c_real: self.c_real,
            c_imag: self.c_imag,
            scale: self.scale,
            offset_x: self.offset_x,
            offset_y: self.offset_y,
            colour_scheme: self.colour_scheme.clone(),
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub request: RequestArgs,

    /// Override the per-render time budget.
    #[arg(long = "render-max-time-seconds", value_name = "SECONDS")]
    pub render_max_time_seconds: Option<u64>,

    /// Path of the PNG file to write.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct LocalArgs {
    #[command(flatten)]
    pub request: RequestArgs,

    /// Bearer token identifying the requester; without one a local user is assumed.
    #[arg(long = "token", env = "FRACTORY_TOKEN", value_name = "TOKEN")]
    pub token: Option<String>,

    /// Give up waiting for the job after this many seconds.
    #[arg(long = "wait-seconds", value_name = "SECONDS", default_value_t = 180)]
    pub wait_seconds: u64,

    /// Override the per-render time budget.
    #[arg(long = "render-max-time-seconds", value_name = "SECONDS")]
    pub render_max_time_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub worker: WorkerSettings,
    pub render: RenderSettings,
    pub status: StatusSettings,
    pub artifacts: ArtifactSettings,
    pub cache: CacheSettings,
    pub identity: IdentitySettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: NonZeroU32,
    pub receive_batch: NonZeroU32,
    pub wait: Duration,
    pub visibility_timeout: Duration,
    pub idle_backoff: Duration,
    pub max_receive_count: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub max_time: Duration,
}

#[derive(Debug, Clone)]
pub struct StatusSettings {
    pub pending_timeout: Duration,
    pub generating_timeout: Duration,
    pub sweep_interval: Duration,
    pub sweep_limit: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct ArtifactSettings {
    pub root: PathBuf,
    pub base_url: String,
    pub signing_secret: String,
    pub presign_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl: Duration,
    pub capacity: NonZeroUsize,
}

#[derive(Debug, Clone, Default)]
pub struct IdentitySettings {
    pub tokens: Vec<TokenSettings>,
}

/// One accepted bearer token, stored as the hex SHA-256 digest of the token.
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub digest: String,
    pub id: String,
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("FRACTORY").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_cli(cli);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    worker: RawWorkerSettings,
    render: RawRenderSettings,
    status: RawStatusSettings,
    artifacts: RawArtifactSettings,
    cache: RawCacheSettings,
    identity: RawIdentitySettings,
}

impl RawSettings {
    fn apply_cli(&mut self, cli: &CliArgs) {
        if let Some(level) = cli.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = cli.log_json {
            self.logging.json = Some(json);
        }

        match cli.command.as_ref() {
            Some(Command::Worker(args)) => self.apply_worker_overrides(args),
            Some(Command::Render(args)) => {
                self.apply_render_time(args.render_max_time_seconds);
            }
            Some(Command::Local(args)) => {
                self.apply_render_time(args.render_max_time_seconds);
            }
            Some(Command::Migrate(args)) => self.apply_database_override(&args.database),
            None => {}
        }
    }

    fn apply_worker_overrides(&mut self, overrides: &WorkerArgs) {
        self.apply_database_override(&overrides.database);
        if let Some(concurrency) = overrides.concurrency {
            self.worker.concurrency = Some(concurrency);
        }
        if let Some(root) = overrides.artifacts_root.as_ref() {
            self.artifacts.root = Some(root.clone());
        }
        self.apply_render_time(overrides.render_max_time_seconds);
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_render_time(&mut self, seconds: Option<u64>) {
        if let Some(seconds) = seconds {
            self.render.max_time_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            worker,
            render,
            status,
            artifacts,
            cache,
            identity,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            worker: build_worker_settings(worker)?,
            render: build_render_settings(render)?,
            status: build_status_settings(status)?,
            artifacts: build_artifact_settings(artifacts)?,
            cache: build_cache_settings(cache)?,
            identity: build_identity_settings(identity)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_worker_settings(worker: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let concurrency = non_zero_u32(
        worker
            .concurrency
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY)
            .into(),
        "worker.concurrency",
    )?;
    let receive_batch = non_zero_u32(
        worker
            .receive_batch
            .unwrap_or(DEFAULT_WORKER_RECEIVE_BATCH)
            .into(),
        "worker.receive_batch",
    )?;
    let max_receive_count = non_zero_u32(
        worker
            .max_receive_count
            .unwrap_or(DEFAULT_WORKER_MAX_RECEIVE_COUNT)
            .into(),
        "worker.max_receive_count",
    )?;

    // A zero wait is a plain short poll.
    let wait = Duration::from_secs(worker.wait_seconds.unwrap_or(DEFAULT_WORKER_WAIT_SECS));
    let visibility_timeout = positive_secs(
        worker
            .visibility_timeout_seconds
            .unwrap_or(DEFAULT_WORKER_VISIBILITY_TIMEOUT_SECS),
        "worker.visibility_timeout_seconds",
    )?;
    let idle_backoff = Duration::from_millis(
        worker
            .idle_backoff_ms
            .unwrap_or(DEFAULT_WORKER_IDLE_BACKOFF_MS),
    );

    Ok(WorkerSettings {
        concurrency,
        receive_batch,
        wait,
        visibility_timeout,
        idle_backoff,
        max_receive_count,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let max_time = positive_secs(
        render
            .max_time_seconds
            .unwrap_or(DEFAULT_RENDER_MAX_TIME_SECS),
        "render.max_time_seconds",
    )?;
    Ok(RenderSettings { max_time })
}

fn build_status_settings(status: RawStatusSettings) -> Result<StatusSettings, LoadError> {
    let pending_timeout = positive_secs(
        status
            .pending_timeout_seconds
            .unwrap_or(DEFAULT_PENDING_TIMEOUT_SECS),
        "status.pending_timeout_seconds",
    )?;
    let generating_timeout = positive_secs(
        status
            .generating_timeout_seconds
            .unwrap_or(DEFAULT_GENERATING_TIMEOUT_SECS),
        "status.generating_timeout_seconds",
    )?;
    let sweep_interval = positive_secs(
        status
            .sweep_interval_seconds
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        "status.sweep_interval_seconds",
    )?;
    let sweep_limit = non_zero_u32(
        status.sweep_limit.unwrap_or(DEFAULT_SWEEP_LIMIT).into(),
        "status.sweep_limit",
    )?;

    Ok(StatusSettings {
        pending_timeout,
        generating_timeout,
        sweep_interval,
        sweep_limit,
    })
}

fn build_artifact_settings(artifacts: RawArtifactSettings) -> Result<ArtifactSettings, LoadError> {
    let root = artifacts
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("artifacts.root", "path must not be empty"));
    }

    let base_url = artifacts
        .base_url
        .unwrap_or_else(|| DEFAULT_ARTIFACT_BASE_URL.to_string());
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(LoadError::invalid(
            "artifacts.base_url",
            "must be an absolute http(s) URL",
        ));
    }

    let signing_secret = artifacts.signing_secret.unwrap_or_default();
    let presign_ttl = positive_secs(
        artifacts
            .presign_ttl_seconds
            .unwrap_or(DEFAULT_PRESIGN_TTL_SECS),
        "artifacts.presign_ttl_seconds",
    )?;

    Ok(ArtifactSettings {
        root,
        base_url,
        signing_secret,
        presign_ttl,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let ttl = positive_secs(
        cache.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        "cache.ttl_seconds",
    )?;
    let capacity = NonZeroUsize::new(cache.capacity.unwrap_or(DEFAULT_CACHE_CAPACITY))
        .ok_or_else(|| LoadError::invalid("cache.capacity", "must be greater than zero"))?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        ttl,
        capacity,
    })
}

fn build_identity_settings(identity: RawIdentitySettings) -> Result<IdentitySettings, LoadError> {
    let tokens = identity
        .tokens
        .into_iter()
        .map(|token| {
            let digest = token.digest.trim().to_ascii_lowercase();
            if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(LoadError::invalid(
                    "identity.tokens.digest",
                    "must be a hex-encoded SHA-256 digest",
                ));
            }
            if token.id.trim().is_empty() {
                return Err(LoadError::invalid("identity.tokens.id", "must not be empty"));
            }
            let role = match token.role.as_deref() {
                Some(raw) => raw.parse::<Role>().map_err(|_| {
                    LoadError::invalid("identity.tokens.role", format!("unknown role `{raw}`"))
                })?,
                None => Role::User,
            };
            let display_name = token.display_name.unwrap_or_else(|| token.id.clone());
            Ok(TokenSettings {
                digest,
                id: token.id,
                display_name,
                role,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(IdentitySettings { tokens })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    concurrency: Option<u32>,
    receive_batch: Option<u32>,
    wait_seconds: Option<u64>,
    visibility_timeout_seconds: Option<u64>,
    idle_backoff_ms: Option<u64>,
    max_receive_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    max_time_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStatusSettings {
    pending_timeout_seconds: Option<u64>,
    generating_timeout_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
    sweep_limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawArtifactSettings {
    root: Option<PathBuf>,
    base_url: Option<String>,
    signing_secret: Option<String>,
    presign_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    ttl_seconds: Option<u64>,
    capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIdentitySettings {
    tokens: Vec<RawTokenSettings>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTokenSettings {
    digest: String,
    id: String,
    display_name: Option<String>,
    role: Option<String>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_secs(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}
