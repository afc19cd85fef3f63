//! Runtime configuration
//!
//! Defaults match TradingView's public endpoints. Every value can be
//! overridden through a `TV_*` environment variable.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TvError};
use crate::validators::validate_timeout;

/// Network settings for the websocket session and HTTP calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub ws_url: String,
    pub ws_origin: String,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub requests_per_minute: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://data.tradingview.com/socket.io/websocket".to_string(),
            ws_origin: "https://data.tradingview.com".to_string(),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(30),
            max_retries: 3,
            base_retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(60),
            requests_per_minute: 60,
        }
    }
}

/// Credentials and authentication endpoints
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub sign_in_url: String,
    pub two_factor_url: String,
    pub search_url: String,
    pub referer: String,
    /// Pre-obtained token; skips the sign-in flow when set
    pub auth_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Base32 TOTP secret, used to generate 2FA codes automatically
    pub totp_secret: Option<String>,
    /// One-off 2FA code, takes precedence over `totp_secret`
    pub totp_code: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            sign_in_url: "https://www.tradingview.com/accounts/signin/".to_string(),
            two_factor_url: "https://www.tradingview.com/accounts/two-factor/signin/totp/"
                .to_string(),
            search_url: "https://symbol-search.tradingview.com/symbol_search/".to_string(),
            referer: "https://www.tradingview.com".to_string(),
            auth_token: None,
            username: None,
            password: None,
            totp_secret: None,
            totp_code: None,
        }
    }
}

// Keep secrets out of debug output
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "********");
        f.debug_struct("AuthConfig")
            .field("sign_in_url", &self.sign_in_url)
            .field("two_factor_url", &self.two_factor_url)
            .field("search_url", &self.search_url)
            .field("auth_token", &mask(&self.auth_token))
            .field("username", &self.username)
            .field("password", &mask(&self.password))
            .field("totp_secret", &mask(&self.totp_secret))
            .field("totp_code", &mask(&self.totp_code))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub max_bars: u32,
    pub default_bars: u32,
    pub validate_data: bool,
    pub extended_session: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            max_bars: 5000,
            default_bars: 10,
            validate_data: true,
            extended_session: false,
        }
    }
}

/// Live feed threading settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadingConfig {
    /// Fetch attempts per Seis on each scheduler tick
    pub retry_limit: u32,
    /// Pause between fetch attempts within one tick
    pub retry_sleep: Duration,
    /// How long shutdown waits for the coordinator lock and for each thread
    pub shutdown_timeout: Duration,
    /// Inbox capacity per consumer; data beyond it is dropped
    pub consumer_queue_size: usize,
    /// How often an idle consumer re-checks its stop flag
    pub consumer_poll_interval: Duration,
    /// Lock timeout used when a failing consumer detaches itself.
    /// `None` waits indefinitely.
    pub detach_timeout: Option<Duration>,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            retry_limit: 50,
            retry_sleep: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(10),
            consumer_queue_size: 100,
            consumer_poll_interval: Duration::from_secs(1),
            detach_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub auth: AuthConfig,
    pub data: DataConfig,
    pub threading: ThreadingConfig,
    pub verbose: bool,
}

impl Config {
    /// Defaults overlaid with `TV_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` but reads variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Config::default();

        let net = &mut config.network;
        if let Some(url) = get("TV_WS_URL") {
            net.ws_url = url;
        }
        override_secs(&get, "TV_CONNECT_TIMEOUT", &mut net.connect_timeout)?;
        override_secs(&get, "TV_SEND_TIMEOUT", &mut net.send_timeout)?;
        override_secs(&get, "TV_WS_TIMEOUT", &mut net.recv_timeout)?;
        override_secs(&get, "TV_RECV_TIMEOUT", &mut net.recv_timeout)?;
        override_parsed(&get, "TV_MAX_RETRIES", &mut net.max_retries)?;
        override_secs(&get, "TV_BASE_RETRY_DELAY", &mut net.base_retry_delay)?;
        override_secs(&get, "TV_MAX_RETRY_DELAY", &mut net.max_retry_delay)?;
        override_parsed(&get, "TV_REQUESTS_PER_MINUTE", &mut net.requests_per_minute)?;

        let auth = &mut config.auth;
        auth.auth_token = get("TV_AUTH_TOKEN");
        auth.username = get("TV_USERNAME");
        auth.password = get("TV_PASSWORD");
        auth.totp_secret = get("TV_TOTP_SECRET");
        auth.totp_code = get("TV_2FA_CODE");

        let data = &mut config.data;
        override_parsed(&get, "TV_MAX_BARS", &mut data.max_bars)?;
        override_parsed(&get, "TV_DEFAULT_BARS", &mut data.default_bars)?;
        if let Some(v) = get("TV_VALIDATE_DATA") {
            data.validate_data = parse_bool("TV_VALIDATE_DATA", &v)?;
        }

        let threading = &mut config.threading;
        override_parsed(&get, "TV_RETRY_LIMIT", &mut threading.retry_limit)?;
        override_secs(&get, "TV_RETRY_SLEEP", &mut threading.retry_sleep)?;
        override_secs(&get, "TV_SHUTDOWN_TIMEOUT", &mut threading.shutdown_timeout)?;
        if let Some(raw) = get("TV_DETACH_TIMEOUT") {
            let secs: f64 = raw.parse().map_err(|_| {
                TvError::Config(format!("TV_DETACH_TIMEOUT has invalid value '{}'", raw))
            })?;
            threading.detach_timeout = validate_timeout(secs)
                .map_err(|e| TvError::Config(format!("TV_DETACH_TIMEOUT: {}", e)))?;
        }

        for key in ["TV_DEBUG", "TV_VERBOSE"] {
            if let Some(v) = get(key) {
                config.verbose |= parse_bool(key, &v)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let net = &self.network;
        for (name, value) in [
            ("connect_timeout", net.connect_timeout),
            ("send_timeout", net.send_timeout),
            ("recv_timeout", net.recv_timeout),
        ] {
            if value.is_zero() {
                return Err(TvError::Config(format!("{} must be positive", name)));
            }
        }
        if net.requests_per_minute == 0 {
            return Err(TvError::Config("requests_per_minute must be positive".into()));
        }
        if !(1..=5000).contains(&self.data.max_bars) {
            return Err(TvError::Config(format!(
                "max_bars must be between 1 and 5000, got {}",
                self.data.max_bars
            )));
        }
        if self.threading.retry_limit == 0 {
            return Err(TvError::Config("retry_limit must be at least 1".into()));
        }
        if self.threading.consumer_queue_size == 0 {
            return Err(TvError::Config("consumer_queue_size must be at least 1".into()));
        }
        Ok(())
    }
}

fn override_parsed<T, G>(get: &G, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = raw
            .parse()
            .map_err(|_| TvError::Config(format!("{} has invalid value '{}'", key, raw)))?;
    }
    Ok(())
}

fn override_secs<G>(get: &G, key: &str, target: &mut Duration) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        let secs: f64 = raw
            .parse()
            .map_err(|_| TvError::Config(format!("{} has invalid value '{}'", key, raw)))?;
        *target = Duration::try_from_secs_f64(secs)
            .map_err(|_| TvError::Config(format!("{} must be a non-negative number", key)))?;
    }
    Ok(())
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(TvError::Config(format!("{} has invalid value '{}'", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.network.recv_timeout, Duration::from_secs(30));
        assert_eq!(config.data.max_bars, 5000);
        assert_eq!(config.threading.retry_limit, 50);
        assert_eq!(config.threading.shutdown_timeout, Duration::from_secs(10));
        assert!(config.auth.username.is_none());
        assert!(!config.verbose);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("TV_USERNAME", "alice"),
            ("TV_PASSWORD", "secret"),
            ("TV_WS_TIMEOUT", "12.5"),
            ("TV_RETRY_LIMIT", "3"),
            ("TV_RETRY_SLEEP", "0.25"),
            ("TV_DEBUG", "true"),
        ]))
        .unwrap();
        assert_eq!(config.auth.username.as_deref(), Some("alice"));
        assert_eq!(config.network.recv_timeout, Duration::from_millis(12_500));
        assert_eq!(config.threading.retry_limit, 3);
        assert_eq!(config.threading.retry_sleep, Duration::from_millis(250));
        assert!(config.verbose);
        assert!(!format!("{:?}", config.auth).contains("secret"));
    }

    #[test]
    fn test_detach_timeout() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.threading.detach_timeout, None);

        let config = Config::from_lookup(lookup(&[("TV_DETACH_TIMEOUT", "2.5")])).unwrap();
        assert_eq!(config.threading.detach_timeout, Some(Duration::from_millis(2500)));

        let config = Config::from_lookup(lookup(&[("TV_DETACH_TIMEOUT", "-1")])).unwrap();
        assert_eq!(config.threading.detach_timeout, None);

        let err = Config::from_lookup(lookup(&[("TV_DETACH_TIMEOUT", "-2")])).unwrap_err();
        assert!(matches!(err, TvError::Config(_)));
    }

    #[test]
    fn test_invalid_values() {
        assert!(Config::from_lookup(lookup(&[("TV_MAX_RETRIES", "many")])).is_err());
        assert!(Config::from_lookup(lookup(&[("TV_MAX_BARS", "6000")])).is_err());
        assert!(Config::from_lookup(lookup(&[("TV_CONNECT_TIMEOUT", "-1")])).is_err());
        assert!(Config::from_lookup(lookup(&[("TV_VERBOSE", "maybe")])).is_err());
    }
}
