//! Configuration module for Beacon.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [source]
//! url = "https://api.garmoth.com/api/events?region=asia&lang=us"
//!
//! [sink]
//! kind = "discord"
//! token = "${DISCORD_TOKEN}"
//!
//! [filter]
//! excluded_date = "2025-12-31"
//!
//! [schedule]
//! mode = "daily"
//! at = "00:00"
//! utc_offset_hours = 8
//! ```

use crate::lifecycle::{SyncSettings, Synchronizer};
use crate::normalize::{ExclusionBasis, NormalizePolicy, Normalizer};
use crate::registry::DestinationRegistry;
use crate::render::{Renderer, DEFAULT_ACCENT_COLOR};
use crate::scheduler::SchedulePolicy;
use crate::sink::{DestinationSink, DiscordBotSink, DiscordWebhookSink, LogSink};
use crate::source::HttpEventSource;
use crate::store::{HandleList, JsonFileStore, KeyValueStore, MemoryStore};
use chrono::{FixedOffset, NaiveDate, NaiveTime};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Largest UTC offset accepted, in hours
const MAX_OFFSET_HOURS: i32 = 14;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BeaconConfig {
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Events API
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_source_url")]
    pub url: String,

    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default = "default_site")]
    pub referer: Option<String>,

    #[serde(default = "default_site")]
    pub origin: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: default_source_url(),
            timeout_secs: default_source_timeout_secs(),
            user_agent: None,
            referer: default_site(),
            origin: default_site(),
        }
    }
}

fn default_source_url() -> String {
    "https://api.garmoth.com/api/events?region=asia&lang=us".to_string()
}

fn default_source_timeout_secs() -> u64 {
    10
}

fn default_site() -> Option<String> {
    Some("https://garmoth.com".to_string())
}

/// Which destination platform to post to
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Discord bot; destinations are channel ids
    Discord,
    /// Discord webhooks; destinations are webhook URLs
    Webhook,
    /// Dry run
    #[default]
    Log,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,

    /// Bot token for the `discord` kind
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub api_base: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            token: None,
            api_base: None,
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    #[serde(default = "default_messages_path")]
    pub messages_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            registry_path: default_registry_path(),
            messages_path: default_messages_path(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("tracking_channels.json")
}

fn default_messages_path() -> PathBuf {
    PathBuf::from("posted_messages.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    /// `YYYY-MM-DD`; events ending on this date are never shown
    #[serde(default)]
    pub excluded_date: Option<String>,

    #[serde(default)]
    pub exclusion_basis: ExclusionBasis,

    #[serde(default = "default_offset_hours")]
    pub display_offset_hours: i32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            excluded_date: None,
            exclusion_basis: ExclusionBasis::default(),
            display_offset_hours: default_offset_hours(),
        }
    }
}

fn default_offset_hours() -> i32 {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    #[serde(default = "default_accent_color")]
    pub accent_color: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            accent_color: default_accent_color(),
        }
    }
}

fn default_accent_color() -> u32 {
    DEFAULT_ACCENT_COLOR
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_post_delay_ms")]
    pub post_delay_ms: u64,

    #[serde(default = "default_delete_delay_ms")]
    pub delete_delay_ms: u64,

    /// 0 disables the bound
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            post_delay_ms: default_post_delay_ms(),
            delete_delay_ms: default_delete_delay_ms(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
        }
    }
}

fn default_post_delay_ms() -> u64 {
    1000
}

fn default_delete_delay_ms() -> u64 {
    500
}

fn default_cycle_timeout_secs() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    #[default]
    Daily,
    Interval,
    Manual,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub mode: ScheduleMode,

    /// `HH:MM` for the daily mode
    #[serde(default = "default_at")]
    pub at: String,

    #[serde(default = "default_offset_hours")]
    pub utc_offset_hours: i32,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default)]
    pub align_to_midnight: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::default(),
            at: default_at(),
            utc_offset_hours: default_offset_hours(),
            interval_secs: default_interval_secs(),
            align_to_midnight: false,
        }
    }
}

fn default_at() -> String {
    "00:00".to_string()
}

fn default_interval_secs() -> u64 {
    86400
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// When set, `/api/*` requires `Authorization: Bearer <key>`
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    10000
}

impl BeaconConfig {
    /// Load configuration from the default path or BEACON_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("BEACON_CONFIG").unwrap_or_else(|_| "config/beacon.toml".to_string());

        let mut config = Self::load_from(&config_path)?;
        config.apply_port_override(env::var("PORT").ok().as_deref())?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: BeaconConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            source = %config.source.url,
            sink = ?config.sink.kind,
            schedule = ?config.schedule.mode,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// `PORT` from the hosting environment wins over the file.
    fn apply_port_override(&mut self, port: Option<&str>) -> Result<(), ConfigError> {
        if let Some(port) = port {
            self.server.port = port.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("PORT '{}' is not a valid port", port))
            })?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.source.url.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingField("source.url".to_string()));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::ValidationError(
                "source.url must start with http:// or https://".to_string(),
            ));
        }

        if self.sink.kind == SinkKind::Discord {
            match self.sink.token.as_deref().map(str::trim) {
                None | Some("") => return Err(ConfigError::MissingField("sink.token".to_string())),
                Some(token) if token.contains("${") => {
                    return Err(ConfigError::ValidationError(
                        "sink.token contains an unsubstituted environment variable".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }

        if let Some(api_base) = &self.sink.api_base {
            if !api_base.starts_with("http://") && !api_base.starts_with("https://") {
                return Err(ConfigError::ValidationError(
                    "sink.api_base must start with http:// or https://".to_string(),
                ));
            }
        }

        if self.sync.post_delay_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sync.post_delay_ms must be greater than zero".to_string(),
            ));
        }

        self.excluded_date()?;
        self.display_offset()?;
        self.schedule_policy()?;

        if self.server.api_key.as_deref().is_some_and(|k| k.contains("${")) {
            return Err(ConfigError::ValidationError(
                "server.api_key contains an unsubstituted environment variable".to_string(),
            ));
        }

        Ok(())
    }

    fn excluded_date(&self) -> Result<Option<NaiveDate>, ConfigError> {
        self.filter
            .excluded_date
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
                    ConfigError::ValidationError(format!(
                        "filter.excluded_date '{}' must be YYYY-MM-DD",
                        s
                    ))
                })
            })
            .transpose()
    }

    pub fn display_offset(&self) -> Result<FixedOffset, ConfigError> {
        offset_from_hours("filter.display_offset_hours", self.filter.display_offset_hours)
    }

    pub fn normalizer(&self) -> Result<Normalizer, ConfigError> {
        Ok(Normalizer::new(NormalizePolicy {
            excluded_date: self.excluded_date()?,
            basis: self.filter.exclusion_basis,
            display_offset: self.display_offset()?,
        }))
    }

    pub fn renderer(&self) -> Result<Renderer, ConfigError> {
        Ok(Renderer::new(self.display_offset()?).with_accent_color(self.render.accent_color))
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            post_delay: Duration::from_millis(self.sync.post_delay_ms),
            delete_delay: Duration::from_millis(self.sync.delete_delay_ms),
            cycle_timeout: (self.sync.cycle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.sync.cycle_timeout_secs)),
        }
    }

    pub fn schedule_policy(&self) -> Result<SchedulePolicy, ConfigError> {
        let offset = offset_from_hours("schedule.utc_offset_hours", self.schedule.utc_offset_hours)?;

        match self.schedule.mode {
            ScheduleMode::Daily => {
                let at = NaiveTime::parse_from_str(self.schedule.at.trim(), "%H:%M").map_err(|_| {
                    ConfigError::ValidationError(format!(
                        "schedule.at '{}' must be HH:MM",
                        self.schedule.at
                    ))
                })?;
                Ok(SchedulePolicy::DailyAt { at, offset })
            }
            ScheduleMode::Interval => {
                if self.schedule.interval_secs == 0 {
                    return Err(ConfigError::ValidationError(
                        "schedule.interval_secs must be greater than 0".to_string(),
                    ));
                }
                Ok(SchedulePolicy::Interval {
                    every: Duration::from_secs(self.schedule.interval_secs),
                    align_to_midnight: self.schedule.align_to_midnight,
                    offset,
                })
            }
            ScheduleMode::Manual => Ok(SchedulePolicy::ManualOnly),
        }
    }

    /// Build the events API client.
    pub fn build_source(&self) -> HttpEventSource {
        let mut source = HttpEventSource::new(self.source.url.trim())
            .with_timeout(Duration::from_secs(self.source.timeout_secs));
        if let Some(user_agent) = &self.source.user_agent {
            source = source.with_user_agent(user_agent);
        }
        if let Some(referer) = &self.source.referer {
            source = source.with_referer(referer);
        }
        if let Some(origin) = &self.source.origin {
            source = source.with_origin(origin);
        }
        source
    }

    /// Build the destination sink for the configured platform.
    pub fn build_sink(&self) -> Result<Arc<dyn DestinationSink>, ConfigError> {
        let timeout = Duration::from_millis(self.sink.timeout_ms);

        let sink: Arc<dyn DestinationSink> = match self.sink.kind {
            SinkKind::Discord => {
                let token = self
                    .sink
                    .token
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| ConfigError::MissingField("sink.token".to_string()))?;
                let mut sink = DiscordBotSink::new(token)
                    .with_timeout(timeout)
                    .with_retries(self.sink.retries);
                if let Some(api_base) = &self.sink.api_base {
                    sink = sink.with_api_base(api_base.trim_end_matches('/'));
                }
                Arc::new(sink)
            }
            SinkKind::Webhook => Arc::new(
                DiscordWebhookSink::new()
                    .with_timeout(timeout)
                    .with_retries(self.sink.retries),
            ),
            SinkKind::Log => Arc::new(LogSink::new()),
        };

        Ok(sink)
    }

    pub fn build_registry_store(&self) -> Arc<dyn KeyValueStore<bool>> {
        match self.store.kind {
            StoreKind::File => Arc::new(JsonFileStore::<bool>::new(&self.store.registry_path)),
            StoreKind::Memory => Arc::new(MemoryStore::<bool>::new()),
        }
    }

    pub fn build_message_store(&self) -> Arc<dyn KeyValueStore<HandleList>> {
        match self.store.kind {
            StoreKind::File => {
                Arc::new(JsonFileStore::<HandleList>::new(&self.store.messages_path))
            }
            StoreKind::Memory => Arc::new(MemoryStore::<HandleList>::new()),
        }
    }

    /// Wire a synchronizer from the configuration.
    pub fn build_synchronizer(&self) -> Result<Synchronizer, ConfigError> {
        let registry = Arc::new(DestinationRegistry::new(self.build_registry_store()));

        Ok(Synchronizer::new(
            Arc::new(self.build_source()),
            self.build_sink()?,
            registry,
            self.build_message_store(),
        )
        .with_normalizer(self.normalizer()?)
        .with_renderer(self.renderer()?)
        .with_settings(self.sync_settings()))
    }
}

fn offset_from_hours(field: &str, hours: i32) -> Result<FixedOffset, ConfigError> {
    if hours.abs() > MAX_OFFSET_HOURS {
        return Err(ConfigError::ValidationError(format!(
            "{} must be within ±{} hours",
            field, MAX_OFFSET_HOURS
        )));
    }
    FixedOffset::east_opt(hours * 3600)
        .ok_or_else(|| ConfigError::ValidationError(format!("{} is out of range", field)))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") else {
        return content.to_string();
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
