use crate::models::asset::ContentEncoding;
use crate::services::{
    batch::{BatchOptions, DEFAULT_CONCURRENCY, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_RETRIES},
    collections::DEFAULT_COLLECTION,
    edge::DEFAULT_INDEX_TTL,
    storage::{
        Backend, KvConfig, KvStore, LocalStore, S3Config, S3Store, kv::DEFAULT_KV_API_URL,
        local::DEFAULT_LOCAL_CHUNK_SIZE,
    },
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "STATIC_PUBLISH_";

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Publish static sites to key-value and object storage")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by every subcommand. Each overrides `STATIC_PUBLISH_<NAME>`.
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Storage backend (overrides STATIC_PUBLISH_BACKEND)
    #[arg(long, global = true, value_enum)]
    pub backend: Option<BackendKind>,

    /// Directory for the publish ID and staged content (overrides STATIC_PUBLISH_STATE_DIR)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Concurrent backend requests per batch (overrides STATIC_PUBLISH_CONCURRENCY)
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Attempts per object, including the first (overrides STATIC_PUBLISH_MAX_RETRIES)
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Backoff unit in seconds; attempt n waits n units (overrides STATIC_PUBLISH_INITIAL_BACKOFF_SECS)
    #[arg(long, global = true)]
    pub initial_backoff_secs: Option<u64>,

    #[arg(long, global = true)]
    pub kv_account_id: Option<String>,
    #[arg(long, global = true)]
    pub kv_namespace_id: Option<String>,
    #[arg(long, global = true)]
    pub kv_api_token: Option<String>,
    #[arg(long, global = true)]
    pub kv_api_url: Option<String>,

    #[arg(long, global = true)]
    pub s3_endpoint: Option<String>,
    #[arg(long, global = true)]
    pub s3_bucket: Option<String>,
    #[arg(long, global = true)]
    pub s3_region: Option<String>,
    #[arg(long, global = true)]
    pub s3_access_key_id: Option<String>,
    #[arg(long, global = true)]
    pub s3_secret_access_key: Option<String>,

    /// Root of the local simulated backend (default: <state-dir>/local-store)
    #[arg(long, global = true)]
    pub local_dir: Option<PathBuf>,

    /// Per-object size limit of the local backend, 0 for none
    #[arg(long, global = true)]
    pub local_chunk_size: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a directory and make it the named collection
    PublishContent(PublishArgs),
    /// Delete content no collection references
    Clean(CleanArgs),
    /// Inspect or remove collections
    Collections {
        #[command(subcommand)]
        action: CollectionsCommand,
    },
    /// Serve a collection over HTTP
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Directory to publish
    #[arg(long, default_value = "./public")]
    pub root: PathBuf,

    #[arg(long, default_value = DEFAULT_COLLECTION)]
    pub collection: String,

    /// Precompressed encodings to produce
    #[arg(long, value_delimiter = ',', default_value = "br,gzip")]
    pub compression: Vec<ContentEncoding>,

    /// Asset key prefix served with long-lived cache headers (repeatable)
    #[arg(long = "static-prefix", default_values = ["/static/", "/assets/"])]
    pub static_prefixes: Vec<String>,

    /// Asset served with 200 for unknown paths
    #[arg(long)]
    pub spa_fallback: Option<String>,

    /// Asset served with 404 for unknown paths
    #[arg(long)]
    pub not_found_page: Option<String>,

    /// Seconds until the collection may be removed by `clean --delete-expired-collections`
    #[arg(long)]
    pub expires_in: Option<u64>,
}

#[derive(Args, Debug)]
pub struct CleanArgs {
    #[arg(long)]
    pub delete_expired_collections: bool,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum CollectionsCommand {
    List,
    Delete {
        name: String,
        /// Required to delete the default collection
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, default_value = DEFAULT_COLLECTION)]
    pub collection: String,

    /// Host to bind to (overrides STATIC_PUBLISH_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides STATIC_PUBLISH_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds between index reloads
    #[arg(long, default_value_t = DEFAULT_INDEX_TTL.as_secs())]
    pub index_ttl_secs: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Kv,
    S3,
    Local,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

/// Resolved backend connection settings.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Kv(KvConfig),
    S3(S3Config),
    Local { dir: PathBuf, chunk_size: Option<u64> },
}

/// Centralized application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub state_dir: PathBuf,
    pub batch: BatchOptions,
}

impl AppConfig {
    /// Parse CLI args and merge them over environment variables.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let cli = Cli::parse();
        let cfg = Self::resolve(cli.global, |name| env::var(name).ok())?;
        Ok((cfg, cli.command))
    }

    /// Merge `args` over values found through `lookup`, which maps a full
    /// environment variable name to its value.
    pub fn resolve(args: GlobalArgs, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());

        let state_dir = args
            .state_dir
            .or_else(|| var("STATE_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(".static-publish"));

        let batch = BatchOptions {
            concurrency: pick(args.concurrency, &var, "CONCURRENCY")?
                .unwrap_or(DEFAULT_CONCURRENCY)
                .max(1),
            max_retries: pick(args.max_retries, &var, "MAX_RETRIES")?
                .unwrap_or(DEFAULT_MAX_RETRIES)
                .max(1),
            initial_backoff: pick(args.initial_backoff_secs, &var, "INITIAL_BACKOFF_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_INITIAL_BACKOFF),
        };

        let kind = pick(args.backend, &var, "BACKEND")?.unwrap_or(BackendKind::Local);
        let required = |value: Option<String>, name: &str, flag: &str| -> Result<String> {
            value
                .or_else(|| var(name))
                .with_context(|| format!("missing {flag} (or {ENV_PREFIX}{name}) for the {kind:?} backend"))
        };

        let backend = match kind {
            BackendKind::Kv => BackendConfig::Kv(KvConfig {
                api_url: args
                    .kv_api_url
                    .or_else(|| var("KV_API_URL"))
                    .unwrap_or_else(|| DEFAULT_KV_API_URL.into()),
                account_id: required(args.kv_account_id, "KV_ACCOUNT_ID", "--kv-account-id")?,
                namespace_id: required(args.kv_namespace_id, "KV_NAMESPACE_ID", "--kv-namespace-id")?,
                api_token: required(args.kv_api_token, "KV_API_TOKEN", "--kv-api-token")?,
            }),
            BackendKind::S3 => BackendConfig::S3(S3Config {
                endpoint: required(args.s3_endpoint, "S3_ENDPOINT", "--s3-endpoint")?,
                bucket: required(args.s3_bucket, "S3_BUCKET", "--s3-bucket")?,
                region: args
                    .s3_region
                    .or_else(|| var("S3_REGION"))
                    .unwrap_or_else(|| "us-east-1".into()),
                access_key_id: required(args.s3_access_key_id, "S3_ACCESS_KEY_ID", "--s3-access-key-id")?,
                secret_access_key: required(
                    args.s3_secret_access_key,
                    "S3_SECRET_ACCESS_KEY",
                    "--s3-secret-access-key",
                )?,
            }),
            BackendKind::Local => {
                let chunk_size = pick(args.local_chunk_size, &var, "LOCAL_CHUNK_SIZE")?
                    .unwrap_or(DEFAULT_LOCAL_CHUNK_SIZE);
                BackendConfig::Local {
                    dir: args
                        .local_dir
                        .or_else(|| var("LOCAL_DIR").map(PathBuf::from))
                        .unwrap_or_else(|| state_dir.join("local-store")),
                    chunk_size: (chunk_size > 0).then_some(chunk_size),
                }
            }
        };

        Ok(Self {
            backend,
            state_dir,
            batch,
        })
    }

    /// Backend name for logs, without credentials.
    pub fn backend_kind(&self) -> BackendKind {
        match self.backend {
            BackendConfig::Kv(_) => BackendKind::Kv,
            BackendConfig::S3(_) => BackendKind::S3,
            BackendConfig::Local { .. } => BackendKind::Local,
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir.join("staging")
    }

    /// Open the configured backend.
    pub async fn connect(&self) -> Result<Backend> {
        Ok(match &self.backend {
            BackendConfig::Kv(cfg) => Backend::Kv(KvStore::new(cfg).context("building KV client")?),
            BackendConfig::S3(cfg) => Backend::S3(S3Store::new(cfg).context("building S3 client")?),
            BackendConfig::Local { dir, chunk_size } => Backend::Local(
                LocalStore::open(dir, *chunk_size)
                    .await
                    .with_context(|| format!("opening local store at {}", dir.display()))?,
            ),
        })
    }
}

/// Bind address for `serve`, from flags or STATIC_PUBLISH_HOST / STATIC_PUBLISH_PORT.
pub fn serve_addr(args: &ServeArgs) -> Result<(String, u16)> {
    let host = match &args.host {
        Some(host) => host.clone(),
        None => env::var(format!("{ENV_PREFIX}HOST")).unwrap_or_else(|_| "0.0.0.0".into()),
    };
    let port = match args.port {
        Some(port) => port,
        None => match env::var(format!("{ENV_PREFIX}PORT")) {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing {ENV_PREFIX}PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading STATIC_PUBLISH_PORT"),
        },
    };
    Ok((host, port))
}

/// A flag value, or the parsed environment value when the flag is absent.
fn pick<T>(flag: Option<T>, var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if flag.is_some() {
        return Ok(flag);
    }
    match var(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("parsing {ENV_PREFIX}{name} value `{value}`: {e}")),
        None => Ok(None),
    }
}
