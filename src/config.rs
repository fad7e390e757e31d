//! Monitor configuration loaded from environment variables.
//!
//! All settings come from the environment (or a `.env` file via
//! `dotenvy`) and are read once at startup.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::stream::client::{GeyserConnector, DEFAULT_ENDPOINT};
use crate::stream::proto::{Commitment, SubscriptionRequest, DEFAULT_FILTER_LABEL};
use crate::supervisor::{ConnectErrorAction, SupervisorSettings};

/// Account watched when `PUMP_ACCOUNT` is not set.
pub const DEFAULT_PUMP_ACCOUNT: &str = "TSLvdd1pWpHVjahSpsvCXUbgwsL3JAcvokwaKt1eokM";

/// Errors for configuration values that are present but unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Log output style.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

/// Top-level monitor configuration.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// gRPC endpoint of the Yellowstone stream.
    pub endpoint: String,

    /// Optional `x-token` for authenticated endpoints.
    pub x_token: Option<SecretString>,

    /// Keep-alive cadence.
    pub ping_interval: Duration,

    /// Account whose transactions are observed.
    pub account_filter: String,

    /// Transactions mentioning any of these accounts are dropped.
    pub account_exclude: Vec<String>,

    /// Transactions must mention every one of these accounts.
    pub account_required: Vec<String>,

    /// Key the transaction filter is registered under.
    pub filter_label: String,

    /// Commitment level requested from the stream.
    pub commitment: Commitment,

    /// Whether failed transactions are delivered too.
    pub include_failed: bool,

    /// Upper bound on connecting and opening the subscription.
    pub connect_timeout: Duration,

    /// Backoff between reconnects and the consecutive-failure budget.
    pub reconnect: RetryPolicy,

    /// Whether a failed connect is retried or ends monitoring.
    pub on_connect_error: ConnectErrorAction,

    /// Text or JSON log lines.
    pub log_format: LogFormat,
}

impl MonitorConfig {
    /// Loads configuration from the process environment, reading a `.env`
    /// file first when one exists.
    ///
    /// # Errors
    ///
    /// Returns an error when a value is set but unusable, for example an
    /// unknown commitment level or a zero ping interval.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which maps a key to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup("GRPC_URL")
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let x_token = lookup("GRPC_X_TOKEN")
            .filter(|token| !token.trim().is_empty())
            .map(SecretString::new);

        let ping_interval_ms: u64 = parse_value(&lookup, "PING_INTERVAL_MS", 1000)?;
        if ping_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PING_INTERVAL_MS",
                reason: "must be greater than zero".to_string(),
            });
        }

        let account_filter = lookup("PUMP_ACCOUNT")
            .map(|account| account.trim().to_string())
            .filter(|account| !account.is_empty())
            .unwrap_or_else(|| DEFAULT_PUMP_ACCOUNT.to_string());

        let account_exclude = parse_list(&lookup, "PUMP_ACCOUNT_EXCLUDE");
        let account_required = parse_list(&lookup, "PUMP_ACCOUNT_REQUIRED");
        let filter_label = lookup("FILTER_LABEL")
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER_LABEL.to_string());

        let commitment = parse_value(&lookup, "COMMITMENT", Commitment::Processed)?;
        let include_failed = parse_bool(&lookup, "INCLUDE_FAILED", false);
        let connect_timeout_ms: u64 = parse_value(&lookup, "CONNECT_TIMEOUT_MS", 10_000)?;

        let initial_backoff_ms: u64 = parse_value(&lookup, "RECONNECT_INITIAL_BACKOFF_MS", 100)?;
        let max_backoff_ms: u64 = parse_value(&lookup, "RECONNECT_MAX_BACKOFF_MS", 5_000)?;
        let jitter_ms: u64 = parse_value(&lookup, "RECONNECT_JITTER_MS", 50)?;
        let max_attempts: usize = parse_value(&lookup, "RECONNECT_MAX_ATTEMPTS", 0)?;

        let mut reconnect = RetryPolicy::exponential(
            Duration::from_millis(initial_backoff_ms),
            Duration::from_millis(max_backoff_ms),
        )
        .with_jitter(Duration::from_millis(jitter_ms));
        if max_attempts > 0 {
            reconnect = reconnect.with_max_attempts(max_attempts);
        }

        let on_connect_error = if parse_bool(&lookup, "STOP_ON_CONNECT_ERROR", false) {
            ConnectErrorAction::Stop
        } else {
            ConnectErrorAction::Retry
        };

        let log_format = parse_value(&lookup, "LOG_FORMAT", LogFormat::Text)?;

        Ok(Self {
            endpoint,
            x_token,
            ping_interval: Duration::from_millis(ping_interval_ms),
            account_filter,
            account_exclude,
            account_required,
            filter_label,
            commitment,
            include_failed,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            reconnect,
            on_connect_error,
            log_format,
        })
    }

    /// Subscription sent at the start of every session.
    pub fn subscription_request(&self) -> SubscriptionRequest {
        SubscriptionRequest::for_account(self.account_filter.clone())
            .with_excluded(self.account_exclude.clone())
            .with_required(self.account_required.clone())
            .with_label(self.filter_label.clone())
            .with_commitment(self.commitment)
            .with_failed(self.include_failed)
    }

    /// Keep-alive, timeout and reconnect settings for the supervisor.
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            ping_interval: self.ping_interval,
            connect_timeout: self.connect_timeout,
            reconnect: self.reconnect.clone(),
            on_connect_error: self.on_connect_error,
        }
    }

    /// Production connector for the configured endpoint.
    pub fn connector(&self) -> GeyserConnector {
        GeyserConnector::new(self.endpoint.clone())
            .with_x_token(self.x_token.clone())
            .with_connect_timeout(self.connect_timeout)
    }
}

/// Parses `key` as `T`, returning `default` when unset or blank.
fn parse_value<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|err: T::Err| ConfigError::InvalidValue {
                    key,
                    reason: err.to_string(),
                })
        }
        _ => Ok(default),
    }
}

/// Parses `key` as a comma-separated list, skipping blank entries.
fn parse_list<F>(lookup: &F, key: &str) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parses `key` as a boolean. Accepts `"true"`, `"1"`, `"false"`, `"0"`
/// (case-insensitive). Returns `default` otherwise.
fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}
