//! Runtime configuration for fairgate.
//!
//! Configured entirely through environment variables — there is no config
//! file to hot-reload, so startup is a one-shot `Config::load()` rather than
//! a watched path. Invalid configs are rejected with a clear error before
//! any port is opened.

use anyhow::{anyhow, Context};

/// Fully resolved, validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_base_url: String,
    pub limit_per_minute: f64,
    pub global_cap: f64,
    pub active_window_secs: f64,
    pub burst_window_secs: f64,
    pub idle_evict_threshold_secs: f64,
    pub prefer_wait_default: f64,
    pub outbound_max_connections: usize,
    pub outbound_max_keepalive: usize,
    pub fallback_429_secs: f64,
    pub fallback_503_secs: f64,
    pub retry_jitter_pct: f64,
    pub bind_addr: String,
}

impl Config {
    /// Read and validate configuration from the process environment.
    pub fn load() -> anyhow::Result<Self> {
        let upstream_base_url = std::env::var("UPSTREAM_BASE_URL")
            .context("UPSTREAM_BASE_URL is required and has no default")?;

        let limit_per_minute = env_f64("LIMIT_PER_MINUTE", defaults::limit_per_minute())?;
        let global_cap = env_f64("GLOBAL_CAP", limit_per_minute)?;
        let active_window_secs = env_f64("ACTIVE_WINDOW_SECONDS", defaults::active_window_secs())?;
        let burst_window_secs = env_f64("BURST_WINDOW_SECONDS", defaults::burst_window_secs())?;
        let idle_evict_threshold_secs =
            env_f64("IDLE_EVICT_THRESHOLD_SECONDS", defaults::idle_evict_threshold_secs())?;
        let prefer_wait_default = env_f64("PREFER_WAIT_DEFAULT", defaults::prefer_wait_default())?;
        let outbound_max_connections =
            env_usize("OUTBOUND_MAX_CONNECTIONS", defaults::outbound_max_connections())?;
        let outbound_max_keepalive =
            env_usize("OUTBOUND_MAX_KEEPALIVE", defaults::outbound_max_keepalive())?;
        let fallback_429_secs = env_f64("FALLBACK_429_SECONDS", defaults::fallback_429_secs())?;
        let fallback_503_secs = env_f64("FALLBACK_503_SECONDS", defaults::fallback_503_secs())?;
        let retry_jitter_pct = env_f64("RETRY_JITTER_PCT", defaults::retry_jitter_pct())?;
        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| defaults::bind_addr().to_string());

        let config = Self {
            upstream_base_url,
            limit_per_minute,
            global_cap,
            active_window_secs,
            burst_window_secs,
            idle_evict_threshold_secs,
            prefer_wait_default,
            outbound_max_connections,
            outbound_max_keepalive,
            fallback_429_secs,
            fallback_503_secs,
            retry_jitter_pct,
            bind_addr,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.limit_per_minute <= 0.0 {
            return Err(anyhow!("LIMIT_PER_MINUTE must be > 0"));
        }
        if self.global_cap < 1.0 {
            return Err(anyhow!("GLOBAL_CAP must be >= 1"));
        }
        if self.active_window_secs <= 0.0 {
            return Err(anyhow!("ACTIVE_WINDOW_SECONDS must be > 0"));
        }
        if self.burst_window_secs <= 0.0 {
            return Err(anyhow!("BURST_WINDOW_SECONDS must be > 0"));
        }
        if self.idle_evict_threshold_secs <= 0.0 {
            return Err(anyhow!("IDLE_EVICT_THRESHOLD_SECONDS must be > 0"));
        }
        if self.prefer_wait_default < 0.0 {
            return Err(anyhow!("PREFER_WAIT_DEFAULT must be >= 0"));
        }
        if self.outbound_max_connections == 0 {
            return Err(anyhow!("OUTBOUND_MAX_CONNECTIONS must be >= 1"));
        }
        if self.retry_jitter_pct < 0.0 || self.retry_jitter_pct > 1.0 {
            return Err(anyhow!("RETRY_JITTER_PCT must be in [0, 1]"));
        }
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow!("BIND_ADDR must be a valid socket address, got {:?}", self.bind_addr));
        }
        Ok(())
    }
}

fn env_f64(name: &str, default: f64) -> anyhow::Result<f64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .with_context(|| format!("{name} must be a number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_usize(name: &str, default: usize) -> anyhow::Result<usize> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("{name} must be a non-negative integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

mod defaults {
    pub fn limit_per_minute() -> f64 {
        200.0
    }
    pub fn active_window_secs() -> f64 {
        5.0
    }
    pub fn burst_window_secs() -> f64 {
        30.0
    }
    pub fn idle_evict_threshold_secs() -> f64 {
        300.0
    }
    pub fn prefer_wait_default() -> f64 {
        0.0
    }
    pub fn outbound_max_connections() -> usize {
        30
    }
    pub fn outbound_max_keepalive() -> usize {
        20
    }
    pub fn fallback_429_secs() -> f64 {
        1.0
    }
    pub fn fallback_503_secs() -> f64 {
        5.0
    }
    pub fn retry_jitter_pct() -> f64 {
        0.2
    }
    pub fn bind_addr() -> &'static str {
        "0.0.0.0:8080"
    }
}
