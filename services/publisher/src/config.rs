//! Configuration management for the publisher service.
//!
//! Values are layered from an optional config file and environment variables
//! prefixed with `SECCAM` (e.g. `SECCAM__DROPBOX__ACCESS_TOKEN`).

use crate::api::ApiContext;
use crate::publisher::PublisherSettings;
use crate::retry::RetryPolicy;
use crate::segmenter::SegmenterSettings;
use crate::transport::TransportSettings;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the publisher service.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Remote storage API
    pub dropbox: DropboxConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Prometheus exporter port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Remote storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DropboxConfig {
    /// Metadata API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Content upload base URL
    #[serde(default = "default_content_url")]
    pub content_url: String,

    /// OAuth bearer token
    pub access_token: String,

    /// Folder that holds the uploaded chunks
    #[serde(default = "default_app_folder")]
    pub app_folder: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Upload and bootstrap retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base retry delay in seconds; retry n waits base * (1 + n)
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Consecutive failed attempts per chunk before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Total tries for each bootstrap call
    #[serde(default = "default_bootstrap_max_attempts")]
    pub bootstrap_max_attempts: u32,

    #[serde(default = "default_bootstrap_base_delay_ms")]
    pub bootstrap_base_delay_ms: u64,

    #[serde(default = "default_bootstrap_max_delay_ms")]
    pub bootstrap_max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// In-process mutex/condvar queue
    Queue,
    /// Unix socket pair with sequence tokens
    Pipe,
}

/// Producer to publisher hand-off configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel_kind")]
    pub kind: ChannelKind,

    /// Queue depth that triggers a growth warning
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
}

/// Capture source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Encoded stream to read; "-" is stdin
    #[serde(default = "default_capture_source")]
    pub source: String,

    #[serde(default = "default_chunk_duration_secs")]
    pub chunk_duration_secs: u64,

    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,

    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "seccam-publisher".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_api_url() -> String {
    "https://api.dropboxapi.com".to_string()
}
fn default_content_url() -> String {
    "https://content.dropboxapi.com".to_string()
}
fn default_app_folder() -> String {
    "/_seccam_".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_initial_delay_secs() -> u64 {
    2
}
fn default_max_retries() -> u32 {
    5
}
fn default_bootstrap_max_attempts() -> u32 {
    3
}
fn default_bootstrap_base_delay_ms() -> u64 {
    1000
}
fn default_bootstrap_max_delay_ms() -> u64 {
    30000
}
fn default_channel_kind() -> ChannelKind {
    ChannelKind::Queue
}
fn default_high_water_mark() -> usize {
    32
}
fn default_capture_source() -> String {
    "-".to_string()
}
fn default_chunk_duration_secs() -> u64 {
    10
}
fn default_max_chunk_bytes() -> usize {
    8 * 1024 * 1024 // 8MB
}
fn default_read_buffer_bytes() -> usize {
    64 * 1024
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_retries: default_max_retries(),
            bootstrap_max_attempts: default_bootstrap_max_attempts(),
            bootstrap_base_delay_ms: default_bootstrap_base_delay_ms(),
            bootstrap_max_delay_ms: default_bootstrap_max_delay_ms(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: default_channel_kind(),
            high_water_mark: default_high_water_mark(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: default_capture_source(),
            chunk_duration_secs: default_chunk_duration_secs(),
            max_chunk_bytes: default_max_chunk_bytes(),
            read_buffer_bytes: default_read_buffer_bytes(),
        }
    }
}

impl PublisherConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/publisher.{toml,yaml,json}`
    /// 2. `/etc/seccam/publisher.{toml,yaml,json}`
    /// 3. Environment variables (`SECCAM__SECTION__KEY`)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/publisher").required(false))
            .add_source(File::with_name("/etc/seccam/publisher").required(false))
            .add_source(
                Environment::with_prefix("SECCAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("SECCAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.dropbox.access_token.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "dropbox.access_token".to_string(),
            ));
        }

        for (field, url) in [
            ("dropbox.api_url", &self.dropbox.api_url),
            ("dropbox.content_url", &self.dropbox.content_url),
        ] {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.to_string(),
                    message: "URL must start with http:// or https://".to_string(),
                });
            }
        }

        let folder = &self.dropbox.app_folder;
        if !folder.starts_with('/') || folder.len() < 2 || folder.ends_with('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "dropbox.app_folder".to_string(),
                message: "Folder must be an absolute path like /_seccam_".to_string(),
            });
        }

        if self.retry.initial_delay_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "retry.initial_delay_secs".to_string(),
                message: "Delay must be greater than 0".to_string(),
            });
        }

        if self.retry.bootstrap_max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "retry.bootstrap_max_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        if self.capture.chunk_duration_secs == 0
            || self.capture.max_chunk_bytes == 0
            || self.capture.read_buffer_bytes == 0
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture".to_string(),
                message: "Chunk duration and sizes must be greater than 0".to_string(),
            });
        }

        if self.capture.source.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "capture.source".to_string(),
            ));
        }

        Ok(())
    }

    /// Publisher settings derived from this configuration.
    pub fn publisher_settings(&self) -> Result<PublisherSettings, ConfigValidationError> {
        Ok(PublisherSettings {
            api: ApiContext {
                access_token: self.dropbox.access_token.clone(),
                api_host: host_of("dropbox.api_url", &self.dropbox.api_url)?,
                content_host: host_of("dropbox.content_url", &self.dropbox.content_url)?,
            },
            app_folder: self.dropbox.app_folder.clone(),
            retry: RetryPolicy {
                initial_delay: self.retry.initial_delay(),
                max_retries: self.retry.max_retries,
            },
            bootstrap_max_attempts: self.retry.bootstrap_max_attempts,
            bootstrap_base_delay: self.retry.bootstrap_base_delay(),
            bootstrap_max_delay: self.retry.bootstrap_max_delay(),
        })
    }
}

/// Authority part of a base URL, as sent in the Host header.
fn host_of(field: &str, url: &str) -> Result<String, ConfigValidationError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ConfigValidationError::InvalidValue {
        field: field.to_string(),
        message: e.to_string(),
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ConfigValidationError::InvalidValue {
            field: field.to_string(),
            message: "URL has no host".to_string(),
        })?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

impl DropboxConfig {
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

impl RetryConfig {
    /// Get base upload retry delay as Duration.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn bootstrap_base_delay(&self) -> Duration {
        Duration::from_millis(self.bootstrap_base_delay_ms)
    }

    pub fn bootstrap_max_delay(&self) -> Duration {
        Duration::from_millis(self.bootstrap_max_delay_ms)
    }
}

impl CaptureConfig {
    /// Whether the capture source is standard input.
    pub fn is_stdin(&self) -> bool {
        self.source == "-"
    }

    pub fn segmenter_settings(&self) -> SegmenterSettings {
        SegmenterSettings {
            chunk_duration: Duration::from_secs(self.chunk_duration_secs),
            max_chunk_bytes: self.max_chunk_bytes,
            read_buffer_bytes: self.read_buffer_bytes,
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
