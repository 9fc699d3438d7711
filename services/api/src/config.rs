use signbridge_core::{
    dispatcher::DispatchLimits,
    frame::{DEFAULT_MAX_DIMENSION, DEFAULT_MAX_PAYLOAD_BYTES},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Defines the supported recognition providers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    /// Answers every frame with a fixed label.
    Constant,
    /// Forwards frames to a remote inference endpoint.
    Http,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub signs_dir: PathBuf,
    pub signs_url_prefix: String,
    pub provider: Provider,
    pub constant_label: String,
    pub inference_url: Option<String>,
    pub dispatch: DispatchLimits,
    pub max_frame_bytes: usize,
    pub max_frame_dimension: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 5000)),
            log_level: Level::INFO,
            signs_dir: PathBuf::from("./static/signs"),
            signs_url_prefix: "/static/signs".to_string(),
            provider: Provider::Constant,
            constant_label: "hello".to_string(),
            inference_url: None,
            dispatch: DispatchLimits::default(),
            max_frame_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_frame_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

/// Parses `name` if set, otherwise returns `default`.
fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Like `parse_var`, but rejects zero.
fn parse_nonzero<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_var(name, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        let defaults = Self::default();

        let bind_address = parse_var("BIND_ADDRESS", defaults.bind_address)?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let signs_dir = std::env::var("SIGNS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.signs_dir);

        let signs_url_prefix = std::env::var("SIGNS_URL_PREFIX")
            .unwrap_or(defaults.signs_url_prefix)
            .trim_end_matches('/')
            .to_string();
        if !signs_url_prefix.starts_with('/') {
            return Err(ConfigError::InvalidValue(
                "SIGNS_URL_PREFIX".to_string(),
                "must be an absolute path other than `/`".to_string(),
            ));
        }

        let provider_str =
            std::env::var("RECOGNITION_PROVIDER").unwrap_or_else(|_| "constant".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "constant" => Provider::Constant,
            "http" => Provider::Http,
            other => {
                return Err(ConfigError::InvalidValue(
                    "RECOGNITION_PROVIDER".to_string(),
                    format!("'{}' is not one of: constant, http", other),
                ));
            }
        };

        let constant_label = std::env::var("CONSTANT_LABEL").unwrap_or(defaults.constant_label);
        let inference_url = std::env::var("INFERENCE_URL").ok();
        if provider == Provider::Http && inference_url.is_none() {
            return Err(ConfigError::MissingVar(
                "INFERENCE_URL must be set for 'http' provider".to_string(),
            ));
        }

        let dispatch = DispatchLimits {
            max_in_flight_per_session: parse_nonzero(
                "MAX_IN_FLIGHT_PER_SESSION",
                defaults.dispatch.max_in_flight_per_session,
            )?,
            max_in_flight_global: parse_nonzero(
                "MAX_IN_FLIGHT_GLOBAL",
                defaults.dispatch.max_in_flight_global,
            )?,
            reorder_window: parse_nonzero("REORDER_WINDOW", defaults.dispatch.reorder_window)?,
            inference_timeout: Duration::from_millis(parse_nonzero(
                "INFERENCE_TIMEOUT_MS",
                defaults.dispatch.inference_timeout.as_millis() as u64,
            )?),
        };

        let max_frame_bytes = parse_nonzero("MAX_FRAME_BYTES", defaults.max_frame_bytes)?;
        let max_frame_dimension =
            parse_nonzero("MAX_FRAME_DIMENSION", defaults.max_frame_dimension)?;

        Ok(Self {
            bind_address,
            log_level,
            signs_dir,
            signs_url_prefix,
            provider,
            constant_label,
            inference_url,
            dispatch,
            max_frame_bytes,
            max_frame_dimension,
        })
    }
}
