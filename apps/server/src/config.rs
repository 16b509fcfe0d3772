//! Configuration management for the bundle server

use serde::Deserialize;
use std::net::SocketAddr;

use crate::services::bundle::PreferReturn;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub fhir: FhirConfig,
    pub bundle: BundleConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// Maximum request body size in bytes. Default: 10 MB
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FhirConfig {
    /// Absolute base used for `fullUrl` of response entries. Relative when unset.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Default Prefer header return behavior when client doesn't specify one.
    /// Valid values: "minimal", "representation", "operationoutcome"
    #[serde(default = "default_prefer_return")]
    pub default_prefer_return: String,
    /// Allow clients to create resources via PUT with client-defined IDs.
    /// When false, returns 405 Method Not Allowed if the resource doesn't exist.
    #[serde(default = "default_true")]
    pub allow_update_create: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleConfig {
    /// Upper bound on entries per batch/transaction bundle
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Skip writing a new version when an update leaves the content unchanged
    #[serde(default = "default_true")]
    pub skip_unchanged_updates: bool,
    #[serde(default)]
    pub payload: PayloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayloadConfig {
    /// Store created resources in the payload store alongside the resource store
    #[serde(default = "default_true")]
    pub offload_enabled: bool,
    /// Delete payloads written by an abandoned bundle
    #[serde(default = "default_true")]
    pub compensate_on_abort: bool,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            offload_enabled: true,
            compensate_on_abort: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON formatting for logs (recommended for production)
    #[serde(default)]
    pub json: bool,

    /// Enable file logging in addition to console
    #[serde(default)]
    pub file_enabled: bool,

    /// Directory for log files (default: ./logs)
    #[serde(default = "default_log_directory")]
    pub file_directory: String,

    /// Log file prefix (default: tessera)
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,

    /// Log rotation: daily, hourly, minutely, never (default: daily)
    #[serde(default = "default_log_rotation")]
    pub file_rotation: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file_enabled: false,
            file_directory: default_log_directory(),
            file_prefix: default_log_file_prefix(),
            file_rotation: default_log_rotation(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                cors_origins: default_cors_origins(),
                max_request_body_size: default_max_request_body_size(),
            },
            fhir: FhirConfig {
                base_url: None,
                default_prefer_return: default_prefer_return(),
                allow_update_create: true,
            },
            bundle: BundleConfig {
                max_entries: default_max_entries(),
                skip_unchanged_updates: true,
                payload: PayloadConfig::default(),
            },
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default(
                "server.max_request_body_size",
                default_max_request_body_size() as i64,
            )?
            .set_default("fhir.default_prefer_return", default_prefer_return())?
            .set_default("fhir.allow_update_create", default_true())?
            .set_default("bundle.max_entries", default_max_entries() as i64)?
            .set_default("bundle.skip_unchanged_updates", default_true())?
            .set_default("bundle.payload.offload_enabled", default_true())?
            .set_default("bundle.payload.compensate_on_abort", default_true())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?
            .set_default("logging.file_enabled", false)?
            .set_default("logging.file_directory", default_log_directory())?
            .set_default("logging.file_prefix", default_log_file_prefix())?
            .set_default("logging.file_rotation", default_log_rotation())?
            .add_source(config::File::with_name("config").required(false))
            // Example: FHIR__BUNDLE__MAX_ENTRIES=500 -> config.bundle.max_entries
            .add_source(
                config::Environment::with_prefix("FHIR")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".to_string());
        }
        if self.server.max_request_body_size == 0 {
            return Err("server.max_request_body_size must be greater than 0".to_string());
        }
        if self.bundle.max_entries == 0 {
            return Err("bundle.max_entries must be greater than 0".to_string());
        }
        if PreferReturn::parse(&self.fhir.default_prefer_return).is_none() {
            return Err(format!(
                "fhir.default_prefer_return must be one of minimal, representation, operationoutcome (got '{}')",
                self.fhir.default_prefer_return
            ));
        }
        if !matches!(
            self.logging.file_rotation.as_str(),
            "daily" | "hourly" | "minutely" | "never"
        ) {
            return Err(format!(
                "logging.file_rotation must be one of daily, hourly, minutely, never (got '{}')",
                self.logging.file_rotation
            ));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        Ok(addr.parse()?)
    }

    /// The server-wide Prefer default, falling back to `representation`.
    pub fn default_prefer_return(&self) -> PreferReturn {
        PreferReturn::parse(&self.fhir.default_prefer_return).unwrap_or_default()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_max_request_body_size() -> usize {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_prefer_return() -> String {
    "representation".to_string()
}

fn default_max_entries() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_directory() -> String {
    "./logs".to_string()
}

fn default_log_file_prefix() -> String {
    "tessera".to_string()
}

fn default_log_rotation() -> String {
    "daily".to_string()
}
