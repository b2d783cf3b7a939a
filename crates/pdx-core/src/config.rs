//! Configuration for the streaming client and the runner.
//!
//! [`StreamConfig`] holds every tunable of the streaming client. All fields
//! have production defaults, so an empty JSON object is a valid config.
//! Durations are written as (fractional) seconds and read back through the
//! `Duration` accessors.
//!
//! # Example config (runner)
//!
//! ```json
//! {
//!   "env": "testnet",
//!   "module_name": "pdx-runner",
//!   "log_dir": "/tmp/log",
//!   "channels": ["bbo.BTC-USD-PERP", "trades.ETH-USD-PERP"],
//!   "stream": { "ws_timeout": 20, "reader_sleep_on_error": 0.5, "validate_messages": true }
//! }
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::PdxError;

/// Venue environment, used to derive the WebSocket endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Prod,
    #[default]
    Testnet,
    Nightly,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Prod => "prod",
            Environment::Testnet => "testnet",
            Environment::Nightly => "nightly",
        }
    }

    /// Public WebSocket endpoint of this environment.
    pub fn ws_url(&self) -> String {
        format!("wss://ws.api.{}.paradex.trade/v1", self.as_str())
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = PdxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prod" => Ok(Environment::Prod),
            "testnet" => Ok(Environment::Testnet),
            "nightly" => Ok(Environment::Nightly),
            other => Err(PdxError::Config(format!("unknown environment: {other}"))),
        }
    }
}

/// Tunables of the streaming client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Per-`recv` timeout of the background reader, seconds.
    pub ws_timeout: f64,

    /// Keep-alive ping cadence, seconds. `None` uses the transport default.
    pub ping_interval: Option<f64>,

    /// Transport failures move the client to `Failed` instead of reconnecting.
    pub disable_reconnect: bool,

    /// Base backoff before a reconnect attempt, seconds (0 allowed).
    pub reader_sleep_on_error: f64,

    /// Idle sleep of the reader while no connection is open, seconds (0 allowed).
    pub reader_sleep_on_no_connection: f64,

    /// Ask the production transport for per-message compression.
    pub enable_compression: bool,

    /// Run payload validators on data notifications.
    pub validate_messages: bool,

    /// Spawn the background reader on `connect()`.
    pub auto_start_reader: bool,

    /// Replaces the environment endpoint.
    pub ws_url_override: Option<String>,

    /// Receive window of `pump_once()`, seconds.
    pub pump_timeout: f64,

    /// How long `connect()` waits for the auth acknowledgment, seconds.
    pub auth_timeout: f64,

    /// Age after which the bearer token lease counts as stale, seconds.
    pub token_expiry_threshold: f64,

    /// Error codes meaning "invalid or expired bearer token".
    pub auth_error_codes: Vec<i64>,

    /// Cap of the exponential reconnect backoff, seconds.
    pub max_reconnect_backoff: f64,

    /// Consecutive failed reconnects before giving up. `None` = unlimited.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_timeout: 20.0,
            ping_interval: None,
            disable_reconnect: false,
            reader_sleep_on_error: 1.0,
            reader_sleep_on_no_connection: 1.0,
            enable_compression: true,
            validate_messages: false,
            auto_start_reader: true,
            ws_url_override: None,
            pump_timeout: 0.001,
            auth_timeout: 10.0,
            token_expiry_threshold: DEFAULT_TOKEN_EXPIRY_SECS,
            auth_error_codes: vec![DEFAULT_AUTH_ERROR_CODE],
            max_reconnect_backoff: 30.0,
            max_reconnect_attempts: None,
        }
    }
}

/// 23 hours: one hour short of the venue's 24 h hard expiry.
pub const DEFAULT_TOKEN_EXPIRY_SECS: f64 = 23.0 * 3600.0;

/// Venue error code for an invalid or expired bearer token.
pub const DEFAULT_AUTH_ERROR_CODE: i64 = 40111;

impl StreamConfig {
    /// Config tuned for simulators and tests: no reader sleeps, short timeouts.
    pub fn simulation() -> Self {
        Self {
            ws_timeout: 0.05,
            reader_sleep_on_error: 0.0,
            reader_sleep_on_no_connection: 0.0,
            auth_timeout: 1.0,
            max_reconnect_backoff: 0.0,
            ..Self::default()
        }
    }

    /// Reject values that cannot be turned into durations.
    pub fn validate(&self) -> Result<(), PdxError> {
        let checks = [
            ("ws_timeout", Some(self.ws_timeout)),
            ("ping_interval", self.ping_interval),
            ("reader_sleep_on_error", Some(self.reader_sleep_on_error)),
            ("reader_sleep_on_no_connection", Some(self.reader_sleep_on_no_connection)),
            ("pump_timeout", Some(self.pump_timeout)),
            ("auth_timeout", Some(self.auth_timeout)),
            ("token_expiry_threshold", Some(self.token_expiry_threshold)),
            ("max_reconnect_backoff", Some(self.max_reconnect_backoff)),
        ];
        for (name, value) in checks {
            if let Some(v) = value {
                if Duration::try_from_secs_f64(v).is_err() {
                    return Err(PdxError::Config(format!(
                        "{name} must be a finite, non-negative number of seconds within Duration range (got {v})"
                    )));
                }
            }
        }
        if self.ws_timeout == 0.0 {
            return Err(PdxError::Config("ws_timeout must be greater than zero".into()));
        }
        if self.ping_interval == Some(0.0) {
            return Err(PdxError::Config("ping_interval must be greater than zero".into()));
        }
        if let Some(url) = &self.ws_url_override {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(PdxError::Config(format!("ws_url_override must be a ws:// or wss:// URL (got {url})")));
            }
        }
        Ok(())
    }

    /// Endpoint to connect to: the override if set, else the environment URL.
    pub fn resolve_url(&self, env: Environment) -> String {
        self.ws_url_override.clone().unwrap_or_else(|| env.ws_url())
    }

    pub fn ws_timeout(&self) -> Duration {
        secs(self.ws_timeout)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval.map(secs)
    }

    pub fn reader_sleep_on_error(&self) -> Duration {
        secs(self.reader_sleep_on_error)
    }

    pub fn reader_sleep_on_no_connection(&self) -> Duration {
        secs(self.reader_sleep_on_no_connection)
    }

    pub fn pump_timeout(&self) -> Duration {
        secs(self.pump_timeout)
    }

    pub fn auth_timeout(&self) -> Duration {
        secs(self.auth_timeout)
    }

    pub fn token_expiry_threshold(&self) -> Duration {
        secs(self.token_expiry_threshold)
    }

    pub fn max_reconnect_backoff(&self) -> Duration {
        secs(self.max_reconnect_backoff)
    }

    /// Whether `code` is one of the configured auth-rejection codes.
    pub fn is_auth_error(&self, code: i64) -> bool {
        self.auth_error_codes.contains(&code)
    }
}

/// Seconds to `Duration`. Only called on validated values; anything else maps to zero.
fn secs(v: f64) -> Duration {
    Duration::try_from_secs_f64(v).unwrap_or(Duration::ZERO)
}

/// Top-level runner config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Venue environment.
    pub env: Environment,

    /// Used as the log file prefix.
    pub module_name: Option<String>,

    /// Directory for daily-rotating log files.
    pub log_dir: Option<String>,

    /// Channels to subscribe on start.
    pub channels: Vec<String>,

    /// Streaming client tunables.
    pub stream: StreamConfig,
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    config.stream.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let cfg: StreamConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.ws_timeout(), Duration::from_secs(20));
        assert_eq!(cfg.reader_sleep_on_error(), Duration::from_secs(1));
        assert_eq!(cfg.token_expiry_threshold(), Duration::from_secs(23 * 3600));
        assert!(cfg.enable_compression);
        assert!(cfg.auto_start_reader);
        assert!(!cfg.validate_messages);
        assert!(cfg.is_auth_error(40111));
        assert!(cfg.ping_interval().is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_sleeps_are_allowed() {
        let cfg: StreamConfig =
            serde_json::from_str(r#"{"reader_sleep_on_error": 0, "reader_sleep_on_no_connection": 0}"#).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.reader_sleep_on_error(), Duration::ZERO);
    }

    #[test]
    fn rejects_bad_values() {
        let cfg = StreamConfig { ws_timeout: 0.0, ..StreamConfig::default() };
        assert!(cfg.validate().is_err());

        let cfg = StreamConfig { reader_sleep_on_error: -1.0, ..StreamConfig::default() };
        assert!(cfg.validate().is_err());

        let cfg = StreamConfig { ws_url_override: Some("http://x".into()), ..StreamConfig::default() };
        assert!(cfg.validate().is_err());

        let cfg = StreamConfig { auth_timeout: f64::NAN, ..StreamConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_durations_out_of_range() {
        let cfg = StreamConfig { token_expiry_threshold: 1e30, ..StreamConfig::default() };
        assert!(matches!(cfg.validate(), Err(PdxError::Config(msg)) if msg.contains("token_expiry_threshold")));

        let cfg = StreamConfig { max_reconnect_backoff: f64::INFINITY, ..StreamConfig::default() };
        assert!(cfg.validate().is_err());

        let cfg = StreamConfig { max_reconnect_backoff: 1e9, ..StreamConfig::default() };
        cfg.validate().unwrap();
        assert_eq!(cfg.max_reconnect_backoff(), Duration::from_secs(1_000_000_000));
    }

    #[test]
    fn url_resolution() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.resolve_url(Environment::Testnet), "wss://ws.api.testnet.paradex.trade/v1");

        let cfg = StreamConfig { ws_url_override: Some("ws://127.0.0.1:9000".into()), ..StreamConfig::default() };
        assert_eq!(cfg.resolve_url(Environment::Prod), "ws://127.0.0.1:9000");
    }

    #[test]
    fn app_config_parses() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"env": "prod", "channels": ["bbo.BTC-USD-PERP"], "stream": {"auth_error_codes": [40111, 40112]}}"#,
        )
        .unwrap();
        assert_eq!(cfg.env, Environment::Prod);
        assert_eq!(cfg.channels, vec!["bbo.BTC-USD-PERP".to_string()]);
        assert!(cfg.stream.is_auth_error(40112));
        assert_eq!("NIGHTLY".parse::<Environment>().unwrap(), Environment::Nightly);
    }
}
