use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Tunables for the message lifecycle engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Messages per peeked page.
    pub page_size: u32,
    /// Receive batch size when looking for specific targets.
    pub selective_batch_size: u32,
    /// Receive batch size when draining a sub-queue.
    pub drain_batch_size: u32,
    /// Receive passes before remaining targets are reported as not found.
    pub max_attempts: u32,
    /// Upper bound the first receive of a pass or drain waits for messages.
    pub receive_wait: Duration,
    /// Wait for later receives, made while other locks are held.
    pub follow_up_wait: Duration,
    /// Pause between selective passes.
    pub retry_backoff: Duration,
    /// Pause between drain batches.
    pub drain_delay: Duration,
    /// Unmatched messages a single pass may hold locked before it ends early.
    pub max_held_locks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            selective_batch_size: 32,
            drain_batch_size: 20,
            max_attempts: 3,
            receive_wait: Duration::from_secs(5),
            follow_up_wait: Duration::from_millis(200),
            retry_backoff: Duration::from_secs(1),
            drain_delay: Duration::from_millis(100),
            max_held_locks: 1000,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `BUSDECK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<u32>("BUSDECK_PAGE_SIZE")? {
            cfg.page_size = v.max(1);
        }
        if let Some(v) = env_parse::<u32>("BUSDECK_SELECTIVE_BATCH_SIZE")? {
            cfg.selective_batch_size = v.max(1);
        }
        if let Some(v) = env_parse::<u32>("BUSDECK_DRAIN_BATCH_SIZE")? {
            cfg.drain_batch_size = v.max(1);
        }
        if let Some(v) = env_parse::<u32>("BUSDECK_MAX_ATTEMPTS")? {
            cfg.max_attempts = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("BUSDECK_RECEIVE_WAIT_MS")? {
            cfg.receive_wait = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("BUSDECK_FOLLOW_UP_WAIT_MS")? {
            cfg.follow_up_wait = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("BUSDECK_RETRY_BACKOFF_MS")? {
            cfg.retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("BUSDECK_DRAIN_DELAY_MS")? {
            cfg.drain_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<usize>("BUSDECK_MAX_HELD_LOCKS")? {
            cfg.max_held_locks = v.max(1);
        }
        Ok(cfg)
    }
}

/// Address the HTTP server binds to. `BUSDECK_BIND` overrides the default 127.0.0.1.
pub fn bind_ip() -> IpAddr {
    std::env::var("BUSDECK_BIND")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => {
            let v = raw.trim().parse::<T>().with_context(|| format!("parse {key}"))?;
            Ok(Some(v))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_bounds() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.page_size, 100);
        assert_eq!(cfg.selective_batch_size, 32);
        assert_eq!(cfg.drain_batch_size, 20);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.receive_wait, Duration::from_secs(5));
        assert!(cfg.follow_up_wait < cfg.receive_wait);
    }
}
