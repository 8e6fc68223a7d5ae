use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub buffer: BufferConfig,
    pub poller: PollerConfig,
    pub follow_up: FollowUpConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

impl DatabaseConfig {
    /// Every connection to an in-memory URL opens its own empty database.
    pub fn is_in_memory(&self) -> bool {
        let url = self.url.trim();
        url.contains(":memory:") || url.contains("mode=memory")
    }
}

/// Debounce settings for inbound message bursts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferConfig {
    pub debounce_min_ms: u64,
    pub debounce_max_ms: u64,
    pub max_messages: usize,
    pub max_wait_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollerConfig {
    pub poll_interval_ms: u64,
    pub batch_limit: u32,
    pub claim_lease_secs: u64,
    pub drain_timeout_secs: u64,
    /// Claimant name recorded on leased rows; generated when absent.
    pub worker_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FollowUpConfig {
    pub delay_secs: u64,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub batch_limit: Option<u32>,
    pub worker_id: Option<String>,
    pub health_check_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://outreach.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            buffer: BufferConfig {
                debounce_min_ms: 3_000,
                debounce_max_ms: 6_000,
                max_messages: 10,
                max_wait_ms: 30_000,
            },
            poller: PollerConfig {
                poll_interval_ms: 1_000,
                batch_limit: 25,
                claim_lease_secs: 300,
                drain_timeout_secs: 30,
                worker_id: None,
            },
            follow_up: FollowUpConfig {
                delay_secs: 24 * 60 * 60,
                message: "Just checking in. Did you get a chance to look at this?".to_string(),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl BufferConfig {
    pub fn debounce_window(&self) -> (Duration, Duration) {
        (Duration::from_millis(self.debounce_min_ms), Duration::from_millis(self.debounce_max_ms))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl PollerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("outreach.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        if config.database.is_in_memory() {
            config.database.max_connections = 1;
        }
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(buffer) = patch.buffer {
            if let Some(debounce_min_ms) = buffer.debounce_min_ms {
                self.buffer.debounce_min_ms = debounce_min_ms;
            }
            if let Some(debounce_max_ms) = buffer.debounce_max_ms {
                self.buffer.debounce_max_ms = debounce_max_ms;
            }
            if let Some(max_messages) = buffer.max_messages {
                self.buffer.max_messages = max_messages;
            }
            if let Some(max_wait_ms) = buffer.max_wait_ms {
                self.buffer.max_wait_ms = max_wait_ms;
            }
        }

        if let Some(poller) = patch.poller {
            if let Some(poll_interval_ms) = poller.poll_interval_ms {
                self.poller.poll_interval_ms = poll_interval_ms;
            }
            if let Some(batch_limit) = poller.batch_limit {
                self.poller.batch_limit = batch_limit;
            }
            if let Some(claim_lease_secs) = poller.claim_lease_secs {
                self.poller.claim_lease_secs = claim_lease_secs;
            }
            if let Some(drain_timeout_secs) = poller.drain_timeout_secs {
                self.poller.drain_timeout_secs = drain_timeout_secs;
            }
            if let Some(worker_id) = poller.worker_id {
                self.poller.worker_id = Some(worker_id);
            }
        }

        if let Some(follow_up) = patch.follow_up {
            if let Some(delay_secs) = follow_up.delay_secs {
                self.follow_up.delay_secs = delay_secs;
            }
            if let Some(message) = follow_up.message {
                self.follow_up.message = message;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("OUTREACH_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("OUTREACH_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_number("OUTREACH_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("OUTREACH_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_number("OUTREACH_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("OUTREACH_BUFFER_DEBOUNCE_MIN_MS") {
            self.buffer.debounce_min_ms = parse_number("OUTREACH_BUFFER_DEBOUNCE_MIN_MS", &value)?;
        }
        if let Some(value) = read_env("OUTREACH_BUFFER_DEBOUNCE_MAX_MS") {
            self.buffer.debounce_max_ms = parse_number("OUTREACH_BUFFER_DEBOUNCE_MAX_MS", &value)?;
        }
        if let Some(value) = read_env("OUTREACH_BUFFER_MAX_MESSAGES") {
            self.buffer.max_messages = parse_number("OUTREACH_BUFFER_MAX_MESSAGES", &value)?;
        }
        if let Some(value) = read_env("OUTREACH_BUFFER_MAX_WAIT_MS") {
            self.buffer.max_wait_ms = parse_number("OUTREACH_BUFFER_MAX_WAIT_MS", &value)?;
        }

        if let Some(value) = read_env("OUTREACH_POLLER_POLL_INTERVAL_MS") {
            self.poller.poll_interval_ms =
                parse_number("OUTREACH_POLLER_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("OUTREACH_POLLER_BATCH_LIMIT") {
            self.poller.batch_limit = parse_number("OUTREACH_POLLER_BATCH_LIMIT", &value)?;
        }
        if let Some(value) = read_env("OUTREACH_POLLER_CLAIM_LEASE_SECS") {
            self.poller.claim_lease_secs =
                parse_number("OUTREACH_POLLER_CLAIM_LEASE_SECS", &value)?;
        }
        if let Some(value) = read_env("OUTREACH_POLLER_DRAIN_TIMEOUT_SECS") {
            self.poller.drain_timeout_secs =
                parse_number("OUTREACH_POLLER_DRAIN_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("OUTREACH_POLLER_WORKER_ID") {
            self.poller.worker_id = Some(value);
        }

        if let Some(value) = read_env("OUTREACH_FOLLOW_UP_DELAY_SECS") {
            self.follow_up.delay_secs = parse_number("OUTREACH_FOLLOW_UP_DELAY_SECS", &value)?;
        }
        if let Some(value) = read_env("OUTREACH_FOLLOW_UP_MESSAGE") {
            self.follow_up.message = value;
        }

        if let Some(value) = read_env("OUTREACH_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("OUTREACH_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_number("OUTREACH_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("OUTREACH_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_number("OUTREACH_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("OUTREACH_LOGGING_LEVEL").or_else(|| read_env("OUTREACH_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("OUTREACH_LOGGING_FORMAT").or_else(|| read_env("OUTREACH_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(poll_interval_ms) = overrides.poll_interval_ms {
            self.poller.poll_interval_ms = poll_interval_ms;
        }
        if let Some(batch_limit) = overrides.batch_limit {
            self.poller.batch_limit = batch_limit;
        }
        if let Some(worker_id) = overrides.worker_id {
            self.poller.worker_id = Some(worker_id);
        }
        if let Some(health_check_port) = overrides.health_check_port {
            self.server.health_check_port = health_check_port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_buffer(&self.buffer)?;
        validate_poller(&self.poller)?;
        validate_follow_up(&self.follow_up)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("outreach.toml"), PathBuf::from("config/outreach.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.is_in_memory() && database.max_connections > 1 {
        return Err(ConfigError::Validation(
            "database.max_connections must be 1 for an in-memory database".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_buffer(buffer: &BufferConfig) -> Result<(), ConfigError> {
    if buffer.debounce_min_ms == 0 {
        return Err(ConfigError::Validation(
            "buffer.debounce_min_ms must be greater than zero".to_string(),
        ));
    }

    if buffer.debounce_min_ms > buffer.debounce_max_ms {
        return Err(ConfigError::Validation(format!(
            "buffer.debounce_min_ms ({}) must not exceed buffer.debounce_max_ms ({})",
            buffer.debounce_min_ms, buffer.debounce_max_ms
        )));
    }

    if buffer.max_messages == 0 {
        return Err(ConfigError::Validation(
            "buffer.max_messages must be at least 1".to_string(),
        ));
    }

    if buffer.max_wait_ms < buffer.debounce_max_ms {
        return Err(ConfigError::Validation(format!(
            "buffer.max_wait_ms ({}) must be at least buffer.debounce_max_ms ({})",
            buffer.max_wait_ms, buffer.debounce_max_ms
        )));
    }

    Ok(())
}

fn validate_poller(poller: &PollerConfig) -> Result<(), ConfigError> {
    if poller.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "poller.poll_interval_ms must be greater than zero".to_string(),
        ));
    }

    if poller.batch_limit == 0 {
        return Err(ConfigError::Validation(
            "poller.batch_limit must be greater than zero".to_string(),
        ));
    }

    if poller.claim_lease_secs == 0 {
        return Err(ConfigError::Validation(
            "poller.claim_lease_secs must be greater than zero".to_string(),
        ));
    }

    if poller.drain_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "poller.drain_timeout_secs must be greater than zero".to_string(),
        ));
    }

    if poller.worker_id.as_ref().is_some_and(|value| value.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "poller.worker_id must not be blank when set".to_string(),
        ));
    }

    Ok(())
}

fn validate_follow_up(follow_up: &FollowUpConfig) -> Result<(), ConfigError> {
    if follow_up.delay_secs == 0 {
        return Err(ConfigError::Validation(
            "follow_up.delay_secs must be greater than zero".to_string(),
        ));
    }

    if follow_up.message.trim().is_empty() {
        return Err(ConfigError::Validation("follow_up.message must not be empty".to_string()));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    buffer: Option<BufferPatch>,
    poller: Option<PollerPatch>,
    follow_up: Option<FollowUpPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BufferPatch {
    debounce_min_ms: Option<u64>,
    debounce_max_ms: Option<u64>,
    max_messages: Option<usize>,
    max_wait_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PollerPatch {
    poll_interval_ms: Option<u64>,
    batch_limit: Option<u32>,
    claim_lease_secs: Option<u64>,
    drain_timeout_secs: Option<u64>,
    worker_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FollowUpPatch {
    delay_secs: Option<u64>,
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
