use anyhow::{anyhow, Context, Result};
use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

const DEFAULT_CERT_PATH: &str = "/root/keys/cert.pem";
const DEFAULT_KEY_PATH: &str = "/root/keys/key_no_password.pem";
const DEFAULT_DB_NAME: &str = "notifications.db";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_RATE_LIMIT_REQUESTS: usize = 10;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_MAX_IN_FLIGHT: usize = 64;
const DEFAULT_NOTIFY_MAX_ATTEMPTS: u32 = 3;

/// Runtime configuration, read once at startup and shared by reference.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_key: String,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
    pub telegram_api_base: String,
    pub ssl_cert_path: PathBuf,
    pub ssl_key_path: PathBuf,
    pub allow_insecure_http: bool,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
    pub trust_proxy_headers: bool,
    pub max_in_flight: usize,
    pub notify_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| anyhow!("Missing required environment variable: {}", key))
        };

        let rate_limit_requests: usize =
            parse_or(&get, "RATE_LIMIT_REQUESTS", DEFAULT_RATE_LIMIT_REQUESTS)?;
        if rate_limit_requests == 0 {
            anyhow::bail!("RATE_LIMIT_REQUESTS must be at least 1");
        }
        let window_secs: u64 =
            parse_or(&get, "RATE_LIMIT_WINDOW", DEFAULT_RATE_LIMIT_WINDOW_SECS)?;
        if window_secs == 0 {
            anyhow::bail!("RATE_LIMIT_WINDOW must be at least 1 second");
        }
        let max_in_flight: usize = parse_or(&get, "MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT)?;
        if max_in_flight == 0 {
            anyhow::bail!("MAX_IN_FLIGHT must be at least 1");
        }
        let notify_max_attempts: u32 =
            parse_or(&get, "NOTIFY_MAX_ATTEMPTS", DEFAULT_NOTIFY_MAX_ATTEMPTS)?;
        if notify_max_attempts == 0 {
            anyhow::bail!("NOTIFY_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            api_key: required("API_KEY")?,
            telegram_bot_token: required("TELEGRAM_BOT_TOKEN")?,
            telegram_chat_id: required("TELEGRAM_CHAT_ID")?,
            telegram_api_base: get("TELEGRAM_API_BASE")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            ssl_cert_path: get("SSL_CERT_PATH")
                .unwrap_or_else(|| DEFAULT_CERT_PATH.to_string())
                .into(),
            ssl_key_path: get("SSL_KEY_PATH")
                .unwrap_or_else(|| DEFAULT_KEY_PATH.to_string())
                .into(),
            allow_insecure_http: parse_bool(&get, "ALLOW_INSECURE_HTTP")?,
            db_path: get("DB_NAME")
                .unwrap_or_else(|| DEFAULT_DB_NAME.to_string())
                .into(),
            host: get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            rate_limit_requests,
            rate_limit_window: Duration::from_secs(window_secs),
            trust_proxy_headers: parse_bool(&get, "TRUST_PROXY_HEADERS")?,
            max_in_flight,
            notify_max_attempts,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid HOST/PORT combination {}:{}", self.host, self.port))
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &str) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("Invalid boolean for {}: {}", key, raw)),
    }
}
