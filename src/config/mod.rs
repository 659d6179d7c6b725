//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

use std::time::Duration;

use secrecy::SecretString;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Text-generation provider key. When absent the analyzer serves stub
    /// answers and triage jobs fail with a stable message.
    pub gemini_api_key: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub http_port: u16,

    pub events_queue: String,
    pub dlq_queue: String,
    pub visibility_timeout_secs: i32,

    pub batch_size: usize,
    pub flush_interval: Duration,
    pub summary_bucket: Duration,

    pub max_events: i64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            gemini_api_key: std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|v| !v.is_empty())
                .map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: var_or("LOG_LEVEL", "info"),
            http_port: parse_var("PORT", 8080)?,
            events_queue: var_or("EVENTS_QUEUE", "events"),
            dlq_queue: var_or("DLQ_QUEUE", "events_dlq"),
            visibility_timeout_secs: parse_var("QUEUE_VISIBILITY_TIMEOUT_SECONDS", 30)?,
            batch_size: parse_var("PROCESSOR_BATCH_SIZE", 100)?,
            flush_interval: Duration::from_millis(parse_var("PROCESSOR_FLUSH_INTERVAL_MS", 500)?),
            summary_bucket: Duration::from_secs(parse_var("SUMMARY_BUCKET_SECONDS", 300)?),
            max_events: parse_var("ANALYZER_MAX_EVENTS", 100)?,
        })
    }

    /// Summary bucket width as a chrono duration for timestamp arithmetic.
    pub fn bucket_width(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.summary_bucket)
            .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn var_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw.parse().map_err(|_| {
            warn!(key = name, value = %raw, "invalid environment variable value");
            Error::Config(format!("invalid value for {name}: '{raw}'"))
        }),
        _ => Ok(default),
    }
}
