use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::envelope::DEFAULT_MAX_BODY_BYTES;
use crate::middleware::RequestLoggingConfig;
use crate::trace::TraceConfig;

/// Service configuration, read from flags or the environment.
#[derive(Debug, Clone, Parser, Validate)]
#[command(name = "bindgate", version, about)]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; records are kept in process when unset
    #[arg(long, env = "REDIS_URL")]
    #[validate(custom(function = "validate_redis_url"))]
    pub redis_url: Option<String>,

    /// Requests admitted per identity per window
    #[arg(long, env = "RATE_LIMIT", default_value_t = 100)]
    #[validate(range(min = 1))]
    pub rate_limit: u32,

    /// Fixed window length in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    #[validate(range(min = 1, max = 86400))]
    pub rate_limit_window_secs: u64,

    /// How often expired in-process records are evicted
    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value_t = 300)]
    #[validate(range(min = 1))]
    pub cleanup_interval_secs: u64,

    /// Largest request body the binder will read
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    #[validate(range(min = 1))]
    pub max_body_bytes: usize,

    /// Nesting limit for recursive validation
    #[arg(long, env = "MAX_VALIDATION_DEPTH")]
    #[validate(range(min = 1))]
    pub max_validation_depth: Option<usize>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Include the request path in request logs
    #[arg(long, env = "LOG_PATH")]
    pub log_path: bool,

    /// Include path parameters in request logs
    #[arg(long, env = "LOG_PATH_PARAMS")]
    pub log_path_params: bool,

    /// Include query parameters in request logs
    #[arg(long, env = "LOG_QUERY_PARAMS")]
    pub log_query_params: bool,

    /// Include JSON bodies of POST and PUT requests in request logs
    #[arg(long, env = "LOG_JSON_BODY")]
    pub log_json_body: bool,

    /// Request headers copied into trace attributes, as `header=key` pairs
    #[arg(long = "trace-header", env = "TRACE_HEADERS", value_delimiter = ',')]
    pub trace_headers: Vec<String>,
}

impl Config {
    /// Load configuration from flags and environment variables, then validate it.
    pub fn load() -> Result<Self, anyhow::Error> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn request_logging(&self) -> RequestLoggingConfig {
        RequestLoggingConfig {
            log_path: self.log_path,
            log_path_params: self.log_path_params,
            log_query_params: self.log_query_params,
            log_json_body: self.log_json_body,
            max_body_bytes: self.max_body_bytes,
        }
    }

    pub fn trace(&self) -> TraceConfig {
        TraceConfig::from_pairs(self.trace_headers.iter().map(String::as_str))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: None,
            rate_limit: 100,
            rate_limit_window_secs: 60,
            cleanup_interval_secs: 300,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_validation_depth: None,
            log_level: "info".to_string(),
            log_path: false,
            log_path_params: false,
            log_query_params: false,
            log_json_body: false,
            trace_headers: Vec::new(),
        }
    }
}

fn validate_redis_url(url: &str) -> Result<(), ValidationError> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        Ok(())
    } else {
        let mut err = ValidationError::new("redis_url");
        err.message = Some("Redis URL must start with 'redis://' or 'rediss://'".into());
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_parse_flags() {
        let config = Config::try_parse_from([
            "bindgate",
            "--bind-addr",
            "0.0.0.0:8080",
            "--rate-limit",
            "3",
            "--redis-url",
            "redis://localhost:6379",
        ])
        .unwrap();

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.rate_limit, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_logging_and_trace_flags() {
        let config = Config::try_parse_from([
            "bindgate",
            "--log-path",
            "--log-json-body",
            "--trace-header",
            "x-tenant-id=tenant,x-session=session",
        ])
        .unwrap();

        let logging = config.request_logging();
        assert!(logging.log_path);
        assert!(!logging.log_path_params);
        assert!(logging.log_json_body);
        assert_eq!(logging.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(config.trace().len(), 2);
    }

    #[test]
    fn test_invalid_redis_url() {
        let config = Config {
            redis_url: Some("http://localhost:6379".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let config = Config {
            rate_limit: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
