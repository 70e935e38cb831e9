//! Environment configuration (§6).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// `TUNNEL_DOMAIN` — apex host (required).
    pub tunnel_domain: String,
    /// `SECURE` — truthy means advertised tunnel URLs use `https`.
    pub secure: bool,
    /// `REDIS_URL` — selects the broker transport when set.
    pub redis_url: Option<String>,
    /// `LOG_LEVEL` — fed to the tracing env-filter.
    pub log_level: String,
    /// Optional per-exchange deadline (§9 Open Question). Not an
    /// environment variable in the original spec; defaults to unbounded.
    pub exchange_timeout: Option<Duration>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let tunnel_domain = std::env::var("TUNNEL_DOMAIN")
            .map_err(|_| anyhow::anyhow!("TUNNEL_DOMAIN must be set"))?;
        let secure = truthy(std::env::var("SECURE").ok().as_deref());
        let redis_url = std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty());
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            tunnel_domain,
            secure,
            redis_url,
            log_level,
            exchange_timeout: None,
        })
    }
}

fn truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.to_ascii_lowercase()),
        Some(ref v) if v == "1" || v == "true" || v == "yes" || v == "on"
    )
}
