//! Configuration layer: typed settings with layered precedence (file → env → CLI).
//!
//! Environment variables use flat names (`USE_REMOTE_CACHE`, `CACHE_TTL_DEFAULT`,
//! ...). A malformed cache or warmup value never aborts startup: the default is
//! used and a [`ConfigIssue`] is recorded for logging once telemetry is up.
//! Values the process cannot run without (listen address, log level) are
//! rejected with a [`LoadError`].

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File, Source};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{
    DEFAULT_MAX_ENTRIES, DEFAULT_MAX_ENTRY_BYTES, DEFAULT_PAGE_INFO_TTL_SECS,
    DEFAULT_REMOTE_TIMEOUT_MS, DEFAULT_REMOTE_URL, DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_TTL_SECS,
    DEFAULT_WARMUP_BATCH_DELAY_MS, DEFAULT_WARMUP_BATCH_SIZE, DEFAULT_WARMUP_TIMEOUT_MS,
};

const LOCAL_CONFIG_BASENAME: &str = "kura";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CONTENT_TIMEOUT_MS: u64 = 30_000;

/// Command-line arguments for the kura binary.
#[derive(Debug, Parser)]
#[command(name = "kura", version, about = "Caching front for a slow content source")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "KURA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service.
    Serve(Box<ServeArgs>),
    /// Warm the cache once and exit.
    Warmup(WarmupArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Use the Redis backend.
    #[arg(
        long = "use-remote-cache",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub use_remote_cache: Option<bool>,

    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the content API base URL.
    #[arg(long = "content-api-base-url", value_name = "URL")]
    pub content_api_base_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Warm the configured page ids in the background after startup.
    #[arg(
        long = "warmup-on-startup",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub warmup_on_startup: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WarmupArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Identifiers per batch.
    #[arg(long = "batch-size", value_name = "COUNT")]
    pub batch_size: Option<usize>,

    /// Pause between batches in milliseconds.
    #[arg(long = "batch-delay-ms", value_name = "MILLIS")]
    pub batch_delay_ms: Option<u64>,

    /// Per-item deadline in milliseconds.
    #[arg(long = "timeout-ms", value_name = "MILLIS")]
    pub timeout_ms: Option<u64>,

    /// Page ids to warm; defaults to `WARMUP_PAGE_IDS`.
    #[arg(value_name = "ID")]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub content: ContentSettings,
    pub revalidate: RevalidateSettings,
    pub warmup: WarmupSettings,
    /// Values that were ignored in favour of their defaults.
    pub issues: Vec<ConfigIssue>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
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
pub struct CacheSettings {
    pub use_remote_backend: bool,
    pub remote_url: String,
    pub remote_timeout: Duration,
    pub default_ttl: Duration,
    pub page_info_ttl: Duration,
    pub max_entries: usize,
    pub max_entry_bytes: usize,
    pub sweep_interval: Option<Duration>,
    pub warmup_batch_size: usize,
    pub warmup_batch_delay: Duration,
    pub warmup_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ContentSettings {
    pub base_url: Option<Url>,
    pub token: Option<String>,
    pub timeout: Duration,
    /// Never request auxiliary collection data.
    pub disable_auxiliary: bool,
}

#[derive(Debug, Clone)]
pub struct RevalidateSettings {
    pub secret: Option<String>,
    pub hook_url: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct WarmupSettings {
    pub page_ids: Vec<String>,
    pub on_startup: bool,
}

/// A malformed value that was replaced by its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ignoring `{}` = {:?} ({}), using default",
            self.key, self.value, self.reason
        )
    }
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

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    load_from(cli, Environment::default())
}

/// Like [`load`], reading variables from `env` instead of the process.
pub fn load_from(cli: &CliArgs, env: Environment) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_env(collect_env(env)?);

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Warmup(args)) => raw.apply_warmup_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

fn collect_env(env: Environment) -> Result<HashMap<String, String>, LoadError> {
    env.collect()?
        .into_iter()
        .map(|(key, value)| -> Result<(String, String), LoadError> {
            Ok((key.to_ascii_uppercase(), value.into_string()?))
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    content: RawContentSettings,
    revalidate: RawRevalidateSettings,
    warmup: RawWarmupSettings,
}

impl RawSettings {
    /// The field an environment variable writes to.
    fn env_slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        let slot = match name {
            "USE_REMOTE_CACHE" => &mut self.cache.use_remote,
            "REDIS_URL" => &mut self.cache.redis_url,
            "REDIS_TIMEOUT_MS" => &mut self.cache.redis_timeout_ms,
            "CACHE_TTL_DEFAULT" => &mut self.cache.ttl_default_secs,
            "CACHE_TTL_PAGE_INFO" => &mut self.cache.ttl_page_info_secs,
            "CACHE_MAX_ENTRIES" => &mut self.cache.max_entries,
            "CACHE_MAX_ENTRY_BYTES" => &mut self.cache.max_entry_bytes,
            "CACHE_SWEEP_INTERVAL" => &mut self.cache.sweep_interval_secs,
            "WARMUP_BATCH_SIZE" => &mut self.warmup.batch_size,
            "WARMUP_BATCH_DELAY" => &mut self.warmup.batch_delay_ms,
            "WARMUP_TIMEOUT" => &mut self.warmup.timeout_ms,
            "WARMUP_PAGE_IDS" => &mut self.warmup.page_ids,
            "WARMUP_ON_STARTUP" => &mut self.warmup.on_startup,
            "DISABLE_COLLECTION_DATA" => &mut self.content.disable_collection_data,
            "CONTENT_API_BASE_URL" => &mut self.content.base_url,
            "CONTENT_API_TOKEN" => &mut self.content.token,
            "CONTENT_API_TIMEOUT" => &mut self.content.timeout_ms,
            "REVALIDATE_SECRET" => &mut self.revalidate.secret,
            "REVALIDATE_HOOK_URL" => &mut self.revalidate.hook_url,
            "SERVER_HOST" => &mut self.server.host,
            "SERVER_PORT" => &mut self.server.port,
            "LOG_LEVEL" => &mut self.logging.level,
            "LOG_JSON" => &mut self.logging.json,
            _ => return None,
        };
        Some(slot)
    }

    fn apply_env(&mut self, vars: HashMap<String, String>) {
        for (name, value) in vars {
            if let Some(slot) = self.env_slot(&name) {
                *slot = Some(value);
            }
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json.to_string());
        }
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(remote) = overrides.use_remote_cache {
            self.cache.use_remote = Some(remote.to_string());
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
        if let Some(url) = overrides.content_api_base_url.as_ref() {
            self.content.base_url = Some(url.clone());
        }
    }

    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_logging_overrides(&overrides.logging);
        self.apply_cache_overrides(&overrides.cache);
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port.to_string());
        }
        if let Some(on_startup) = overrides.warmup_on_startup {
            self.warmup.on_startup = Some(on_startup.to_string());
        }
    }

    fn apply_warmup_overrides(&mut self, args: &WarmupArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_cache_overrides(&args.cache);
        if let Some(size) = args.batch_size {
            self.warmup.batch_size = Some(size.to_string());
        }
        if let Some(delay) = args.batch_delay_ms {
            self.warmup.batch_delay_ms = Some(delay.to_string());
        }
        if let Some(timeout) = args.timeout_ms {
            self.warmup.timeout_ms = Some(timeout.to_string());
        }
        if !args.ids.is_empty() {
            self.warmup.page_ids = Some(args.ids.join(","));
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            content,
            revalidate,
            warmup,
        } = raw;

        let mut issues = Vec::new();
        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let (cache, warmup) = build_cache_settings(cache, warmup, &mut issues);
        let content = build_content_settings(content, &mut issues);
        let revalidate = build_revalidate_settings(revalidate, &mut issues);

        Ok(Self {
            server,
            logging,
            cache,
            content,
            revalidate,
            warmup,
            issues,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = non_blank(server.host).unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = match non_blank(server.port) {
        Some(port) => port
            .parse::<u16>()
            .map_err(|err| LoadError::invalid("SERVER_PORT", format!("failed to parse: {err}")))?,
        None => DEFAULT_PORT,
    };
    if port == 0 {
        return Err(LoadError::invalid(
            "SERVER_PORT",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("SERVER_HOST", reason))?;
    Ok(ServerSettings { addr })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match non_blank(logging.level) {
        Some(level) => LevelFilter::from_str(level.as_str())
            .map_err(|err| LoadError::invalid("LOG_LEVEL", format!("failed to parse: {err}")))?,
        None => LevelFilter::INFO,
    };

    let json = match non_blank(logging.json) {
        Some(value) => parse_bool(&value)
            .ok_or_else(|| LoadError::invalid("LOG_JSON", format!("`{value}` is not a boolean")))?,
        None => false,
    };
    let format = if json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(
    cache: RawCacheSettings,
    warmup: RawWarmupSettings,
    issues: &mut Vec<ConfigIssue>,
) -> (CacheSettings, WarmupSettings) {
    let mut values = Lenient { issues };

    let sweep_secs = values.number(
        "CACHE_SWEEP_INTERVAL",
        cache.sweep_interval_secs,
        DEFAULT_SWEEP_INTERVAL_SECS,
    );
    let cache_settings = CacheSettings {
        use_remote_backend: values.flag("USE_REMOTE_CACHE", cache.use_remote, false),
        remote_url: non_blank(cache.redis_url).unwrap_or_else(|| DEFAULT_REMOTE_URL.to_string()),
        remote_timeout: Duration::from_millis(values.positive(
            "REDIS_TIMEOUT_MS",
            cache.redis_timeout_ms,
            DEFAULT_REMOTE_TIMEOUT_MS,
        )),
        default_ttl: Duration::from_secs(values.positive(
            "CACHE_TTL_DEFAULT",
            cache.ttl_default_secs,
            DEFAULT_TTL_SECS,
        )),
        page_info_ttl: Duration::from_secs(values.positive(
            "CACHE_TTL_PAGE_INFO",
            cache.ttl_page_info_secs,
            DEFAULT_PAGE_INFO_TTL_SECS,
        )),
        max_entries: values.positive("CACHE_MAX_ENTRIES", cache.max_entries, DEFAULT_MAX_ENTRIES),
        max_entry_bytes: values.positive(
            "CACHE_MAX_ENTRY_BYTES",
            cache.max_entry_bytes,
            DEFAULT_MAX_ENTRY_BYTES,
        ),
        sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
        warmup_batch_size: values.positive(
            "WARMUP_BATCH_SIZE",
            warmup.batch_size,
            DEFAULT_WARMUP_BATCH_SIZE,
        ),
        warmup_batch_delay: Duration::from_millis(values.number(
            "WARMUP_BATCH_DELAY",
            warmup.batch_delay_ms,
            DEFAULT_WARMUP_BATCH_DELAY_MS,
        )),
        warmup_timeout: Duration::from_millis(values.positive(
            "WARMUP_TIMEOUT",
            warmup.timeout_ms,
            DEFAULT_WARMUP_TIMEOUT_MS,
        )),
    };

    let warmup_settings = WarmupSettings {
        page_ids: split_list(warmup.page_ids.as_deref()),
        on_startup: values.flag("WARMUP_ON_STARTUP", warmup.on_startup, false),
    };

    (cache_settings, warmup_settings)
}

fn build_content_settings(content: RawContentSettings, issues: &mut Vec<ConfigIssue>) -> ContentSettings {
    let mut values = Lenient { issues };
    ContentSettings {
        base_url: values.url("CONTENT_API_BASE_URL", content.base_url),
        token: non_blank(content.token),
        timeout: Duration::from_millis(values.positive(
            "CONTENT_API_TIMEOUT",
            content.timeout_ms,
            DEFAULT_CONTENT_TIMEOUT_MS,
        )),
        disable_auxiliary: values.flag("DISABLE_COLLECTION_DATA", content.disable_collection_data, false),
    }
}

fn build_revalidate_settings(
    revalidate: RawRevalidateSettings,
    issues: &mut Vec<ConfigIssue>,
) -> RevalidateSettings {
    let mut values = Lenient { issues };
    RevalidateSettings {
        secret: non_blank(revalidate.secret),
        hook_url: values.url("REVALIDATE_HOOK_URL", revalidate.hook_url),
    }
}

/// Parses values that fall back to a default when malformed.
struct Lenient<'a> {
    issues: &'a mut Vec<ConfigIssue>,
}

impl Lenient<'_> {
    fn reject(&mut self, key: &'static str, value: String, reason: impl Into<String>) {
        self.issues.push(ConfigIssue {
            key,
            value,
            reason: reason.into(),
        });
    }

    fn number<T>(&mut self, key: &'static str, raw: Option<String>, default: T) -> T
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(value) = non_blank(raw) else {
            return default;
        };
        match value.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                self.reject(key, value, err.to_string());
                default
            }
        }
    }

    fn positive<T>(&mut self, key: &'static str, raw: Option<String>, default: T) -> T
    where
        T: FromStr + Default + PartialEq + Copy,
        T::Err: fmt::Display,
    {
        let value = raw.clone();
        let parsed = self.number(key, raw, default);
        if parsed == T::default() {
            self.reject(key, value.unwrap_or_default(), "must be greater than zero");
            return default;
        }
        parsed
    }

    fn flag(&mut self, key: &'static str, raw: Option<String>, default: bool) -> bool {
        let Some(value) = non_blank(raw) else {
            return default;
        };
        match parse_bool(&value) {
            Some(flag) => flag,
            None => {
                self.reject(key, value, "not a boolean");
                default
            }
        }
    }

    fn url(&mut self, key: &'static str, raw: Option<String>) -> Option<Url> {
        let value = non_blank(raw)?;
        match Url::parse(&value) {
            Ok(url) => Some(url),
            Err(err) => {
                self.reject(key, value, err.to_string());
                None
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    use_remote: Option<String>,
    redis_url: Option<String>,
    redis_timeout_ms: Option<String>,
    ttl_default_secs: Option<String>,
    ttl_page_info_secs: Option<String>,
    max_entries: Option<String>,
    max_entry_bytes: Option<String>,
    sweep_interval_secs: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawContentSettings {
    base_url: Option<String>,
    token: Option<String>,
    timeout_ms: Option<String>,
    disable_collection_data: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRevalidateSettings {
    secret: Option<String>,
    hook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWarmupSettings {
    batch_size: Option<String>,
    batch_delay_ms: Option<String>,
    timeout_ms: Option<String>,
    page_ids: Option<String>,
    on_startup: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
