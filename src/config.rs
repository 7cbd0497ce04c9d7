//! Configuration from CLI arguments and environment variables.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use clap::{ArgAction, Parser};
use ipnetwork::IpNetwork;
use secrecy::{ExposeSecret, SecretString};
use svc_telemetry::TelemetryConfig;

use crate::admission::{AdmissionConfig, RateLimitConfig, SecurityHeadersConfig};
use crate::client::{RetryConfig, RetryConfigError};
use crate::middleware::AuthConfig;

/// Minimum required JWT secret length for security (256 bits).
const MIN_JWT_SECRET_LEN: usize = 32;

/// Gateway configuration.
///
/// All values can be set via environment variables or CLI arguments.
#[derive(Debug, Clone, Parser)]
#[command(name = "svc-gateway", about = "Request admission and resilience gateway")]
pub struct Config {
    /// Server address (gRPC + REST on single port)
    #[arg(long, env = "ADDRESS", default_value = "0.0.0.0:50051")]
    pub address: String,

    /// Authenticate inbound gRPC calls
    #[arg(long, env = "AUTH_ENABLED", default_value = "true", action = ArgAction::Set)]
    pub auth_enabled: bool,

    /// JWT secret key for HS256 (min 32 chars)
    #[arg(long, env = "JWT_SECRET_KEY")]
    pub jwt_secret_key: SecretString,

    /// Expected `iss` claim
    #[arg(long, env = "JWT_ISSUER", default_value = "svc-gateway")]
    pub jwt_issuer: String,

    /// Expected `aud` claim
    #[arg(long, env = "JWT_AUDIENCE", default_value = "svc-gateway")]
    pub jwt_audience: String,

    /// Full gRPC method paths that skip authentication (comma-separated)
    #[arg(
        long,
        env = "AUTH_EXEMPT_METHODS",
        value_delimiter = ',',
        default_value = "/grpc.health.v1.Health/Check,/grpc.health.v1.Health/Watch"
    )]
    pub auth_exempt_methods: Vec<String>,

    /// Service API keys as `service=secret` pairs (comma-separated)
    #[arg(long, env = "API_KEYS")]
    pub api_keys: Option<SecretString>,

    /// Attempts per outbound call, including the first.
    /// The `--retry-*` flags shape the policy handed to outbound clients.
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value = "3")]
    pub retry_max_attempts: u32,

    #[arg(long, env = "RETRY_INITIAL_BACKOFF_MS", default_value = "100")]
    pub retry_initial_backoff_ms: u64,

    #[arg(long, env = "RETRY_MAX_BACKOFF_MS", default_value = "5000")]
    pub retry_max_backoff_ms: u64,

    #[arg(long, env = "RETRY_BACKOFF_MULTIPLIER", default_value = "2.0")]
    pub retry_backoff_multiplier: f64,

    /// Random backoff spread as a fraction of the backoff, 0 to 1
    #[arg(long, env = "RETRY_JITTER", default_value = "0.2")]
    pub retry_jitter: f64,

    /// Requests per minute per client IP
    #[arg(long, env = "RATE_LIMIT_RPM", default_value = "100")]
    pub rate_limit_rpm: u32,

    /// Extra requests tolerated on top of the per-minute quota
    #[arg(long, env = "RATE_LIMIT_BURST", default_value = "20")]
    pub rate_limit_burst: u32,

    /// Sweep interval for idle rate limit entries in seconds
    #[arg(long, env = "RATE_LIMIT_CLEANUP_SECS", default_value = "60")]
    pub rate_limit_cleanup_secs: u64,

    /// Allowed client networks in CIDR notation (comma-separated, empty allows all)
    #[arg(long, env = "ALLOWED_IPS", value_delimiter = ',')]
    pub allowed_ips: Vec<IpNetwork>,

    /// Admit clients from private and loopback networks
    #[arg(long, env = "ALLOW_PRIVATE_NETWORKS", default_value = "true", action = ArgAction::Set)]
    pub allow_private_networks: bool,

    /// Accepted request media type prefixes (comma-separated)
    #[arg(
        long,
        env = "ALLOWED_CONTENT_TYPES",
        value_delimiter = ',',
        default_value = "application/json,application/x-www-form-urlencoded,multipart/form-data"
    )]
    pub allowed_content_types: Vec<String>,

    /// Max request body size in bytes (default: 10MB)
    #[arg(long, env = "MAX_REQUEST_BYTES", default_value = "10485760")]
    pub max_request_bytes: u64,

    /// CORS allowed origins (comma-separated, or "*" for any)
    #[arg(long, env = "CORS_ALLOW_ORIGINS")]
    pub cors_allow_origins: Option<String>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    pub log_level: String,

    /// Extra per-target log filters, e.g. `svc_gateway::admission=debug`
    #[arg(long, env = "LOG_DIRECTIVES", value_delimiter = ',')]
    pub log_directives: Vec<String>,

    /// Use JSON log format
    #[arg(long, env = "JSON_LOGS", default_value = "true", action = ArgAction::Set)]
    pub json_logs: bool,

    /// OpenTelemetry OTLP endpoint
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("JWT secret must be at least {MIN_JWT_SECRET_LEN} characters")]
    JwtSecretTooShort,
    #[error("API key entry must look like service=secret: {0}")]
    InvalidApiKey(String),
    #[error("Duplicate API key service: {0}")]
    DuplicateApiKey(String),
    #[error("Invalid retry settings: {0}")]
    Retry(#[from] RetryConfigError),
    #[error("Rate limit must be > 0 requests per minute")]
    InvalidRateLimit,
    #[error("Rate limit cleanup interval must be > 0")]
    InvalidCleanupInterval,
    #[error("Max request size must be > 0")]
    InvalidMaxRequestBytes,
}

impl Config {
    /// Parse and validate configuration.
    pub fn init() -> anyhow::Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret_key.expose_secret().len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::JwtSecretTooShort);
        }
        self.api_key_map()?;
        self.retry_config()?;
        if self.rate_limit_rpm == 0 {
            return Err(ConfigError::InvalidRateLimit);
        }
        if self.rate_limit_cleanup_secs == 0 {
            return Err(ConfigError::InvalidCleanupInterval);
        }
        if self.max_request_bytes == 0 {
            return Err(ConfigError::InvalidMaxRequestBytes);
        }
        Ok(())
    }

    /// # Errors
    /// [`ConfigError`] if the API key list is malformed.
    pub fn auth_config(&self) -> Result<AuthConfig, ConfigError> {
        Ok(AuthConfig {
            enabled: self.auth_enabled,
            jwt_secret: self.jwt_secret_key.clone(),
            jwt_issuer: self.jwt_issuer.clone(),
            jwt_audience: self.jwt_audience.clone(),
            exempt_methods: self
                .auth_exempt_methods
                .iter()
                .map(|m| m.trim())
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect::<HashSet<_>>(),
            api_keys: self.api_key_map()?,
        })
    }

    /// # Errors
    /// [`ConfigError::Retry`] if a retry value is out of range.
    pub fn retry_config(&self) -> Result<RetryConfig, ConfigError> {
        Ok(RetryConfig::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_initial_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
            self.retry_backoff_multiplier,
            self.retry_jitter,
        )?)
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            rate_limit: RateLimitConfig {
                requests_per_minute: self.rate_limit_rpm,
                burst_limit: self.rate_limit_burst,
                cleanup_interval: Duration::from_secs(self.rate_limit_cleanup_secs),
            },
            allowed_networks: self.allowed_ips.clone(),
            allow_private_networks: self.allow_private_networks,
            allowed_content_types: self
                .allowed_content_types
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            max_request_bytes: self.max_request_bytes,
            security_headers: SecurityHeadersConfig::default(),
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "svc-gateway".to_string(),
            log_level: self.log_level.clone(),
            json_logs: self.json_logs,
            otlp_endpoint: self.otlp_endpoint.clone(),
            directives: self.log_directives.clone(),
        }
    }

    fn api_key_map(&self) -> Result<HashMap<String, SecretString>, ConfigError> {
        self.api_keys
            .as_ref()
            .map_or_else(|| Ok(HashMap::new()), |raw| parse_api_keys(raw.expose_secret()))
    }
}

/// Parse `service=secret,service=secret`. Secrets never appear in errors.
fn parse_api_keys(raw: &str) -> Result<HashMap<String, SecretString>, ConfigError> {
    let mut keys = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (service, secret) = entry
            .split_once('=')
            .map(|(s, k)| (s.trim(), k.trim()))
            .filter(|(s, k)| !s.is_empty() && !k.is_empty())
            .ok_or_else(|| {
                let service = entry.split('=').next().unwrap_or_default().trim();
                ConfigError::InvalidApiKey(service.to_string())
            })?;

        if keys
            .insert(service.to_string(), SecretString::from(secret.to_string()))
            .is_some()
        {
            return Err(ConfigError::DuplicateApiKey(service.to_string()));
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "this_is_a_very_long_secret_key_32";

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec!["svc-gateway", "--jwt-secret-key", SECRET];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults_pass_validation() {
        let config = parse(&[]);
        assert!(config.validate().is_ok());
        assert!(config.auth_enabled);
        assert!(config.allow_private_networks);
        assert!(config.allowed_ips.is_empty());
    }

    #[test]
    fn health_methods_are_exempt_by_default() {
        let auth = parse(&[]).auth_config().unwrap();
        assert!(auth.exempt_methods.contains("/grpc.health.v1.Health/Check"));
        assert!(auth.exempt_methods.contains("/grpc.health.v1.Health/Watch"));
        assert!(auth.api_keys.is_empty());
    }

    #[test]
    fn jwt_secret_too_short_fails() {
        let mut config = parse(&[]);
        config.jwt_secret_key = SecretString::from("short");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::JwtSecretTooShort)
        ));
    }

    #[test]
    fn api_keys_are_parsed() {
        let auth = parse(&["--api-keys", "billing=k1, reports = k2"])
            .auth_config()
            .unwrap();
        assert_eq!(auth.api_keys.len(), 2);
        assert_eq!(auth.api_keys["billing"].expose_secret(), "k1");
        assert_eq!(auth.api_keys["reports"].expose_secret(), "k2");
    }

    #[test]
    fn malformed_api_key_reports_service_only() {
        let err = parse_api_keys("billing=k1,reports").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidApiKey(ref s) if s == "reports"));

        let err = parse_api_keys("billing=k1,billing=k2").unwrap_err();
        assert!(!err.to_string().contains("k2"));
    }

    #[test]
    fn invalid_retry_settings_fail() {
        let config = parse(&["--retry-jitter", "1.5"]);
        assert!(matches!(config.validate(), Err(ConfigError::Retry(_))));

        let config = parse(&["--retry-max-attempts", "0"]);
        assert!(matches!(config.validate(), Err(ConfigError::Retry(_))));
    }

    #[test]
    fn zero_rate_limit_fails() {
        let config = parse(&["--rate-limit-rpm", "0"]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRateLimit)));
    }

    #[test]
    fn admission_config_from_flags() {
        let config = parse(&[
            "--allowed-ips",
            "10.0.0.0/8,203.0.113.0/24",
            "--allow-private-networks",
            "false",
            "--rate-limit-rpm",
            "5",
            "--rate-limit-burst",
            "0",
        ]);
        let admission = config.admission_config();
        assert_eq!(admission.allowed_networks.len(), 2);
        assert!(!admission.allow_private_networks);
        assert_eq!(admission.rate_limit.quota(), 5);
    }

    #[test]
    fn bad_cidr_is_rejected_by_parser() {
        let result = Config::try_parse_from([
            "svc-gateway",
            "--jwt-secret-key",
            SECRET,
            "--allowed-ips",
            "not-a-network",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn log_directives_reach_telemetry() {
        let telemetry = parse(&[
            "--log-directives",
            "svc_gateway::admission=debug,tonic=warn",
        ])
        .telemetry_config();
        assert_eq!(
            telemetry.directives,
            ["svc_gateway::admission=debug", "tonic=warn"]
        );
    }
}
