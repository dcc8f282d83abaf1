//! Configuration module for environment variable parsing.
//!
//! Reads all configuration from environment variables. Missing or invalid
//! values fall back to defaults so the server always starts.

use std::env;
use std::str::FromStr;
use tracing::warn;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// Country-code prefix prepended to numbers that lack it (e.g. "92")
    pub country_code: String,

    /// Suffix the messaging channel expects on every chat id (e.g. "@c.us")
    pub chat_id_suffix: String,

    /// Base URL of the WhatsApp bridge sidecar
    pub bridge_url: String,

    /// HTTP timeout for bridge requests in milliseconds
    pub bridge_timeout_ms: u64,

    /// Delay between sends when a start request does not specify one
    pub default_delay_ms: u64,

    /// HMAC key used to verify bearer tokens on administrative actions
    pub auth_signing_key: Option<String>,

    /// Maximum age in seconds for a bearer token
    pub auth_token_max_age: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            port: parse_or("PORT", 3000),

            country_code: env::var("COUNTRY_CODE")
                .ok()
                .map(|v| v.trim().trim_start_matches('+').to_string())
                .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or_else(|| "92".to_string()),

            chat_id_suffix: env::var("CHAT_ID_SUFFIX").unwrap_or_else(|_| "@c.us".to_string()),

            bridge_url: env::var("BRIDGE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://127.0.0.1:3001".to_string()),

            bridge_timeout_ms: parse_or("BRIDGE_TIMEOUT_MS", 30_000),

            default_delay_ms: parse_or("DEFAULT_DELAY_MS", 15_000),

            auth_signing_key: env::var("AUTH_SIGNING_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),

            auth_token_max_age: parse_or("AUTH_TOKEN_MAX_AGE", 86_400), // 24 hours default
        }
    }
}

/// Parse a variable into `T`, warning and falling back on bad input.
fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}
