use std::path::PathBuf;
use std::time::Duration;

/// Client tunables, resolved from the environment with compiled defaults.
/// CLI flags win over env vars; env vars win over the defaults below.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the callable backend (violation reports, resume RPC).
    pub control_base_url: String,
    /// Where per-profile durable state lives (poison pill, answer queue).
    pub storage_dir: Option<PathBuf>,
    /// Interval between answer-queue drain attempts.
    pub sync_interval: Duration,
    /// Polling fallback cadence while the push subscription is unconfirmed.
    pub poll_interval_fast: Duration,
    /// Polling fallback cadence once the connection is confirmed stable.
    pub poll_interval_slow: Duration,
    /// Telemetry flush cadence.
    pub telemetry_flush_interval: Duration,
    /// Age beyond which a cached session snapshot is discarded at startup.
    pub session_cache_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_base_url: "api.podium.app".to_string(),
            storage_dir: None,
            sync_interval: Duration::from_secs(5),
            poll_interval_fast: Duration::from_secs(3),
            poll_interval_slow: Duration::from_secs(20),
            telemetry_flush_interval: Duration::from_secs(15),
            session_cache_ttl: Duration::from_secs(10 * 60),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base) = env_string("PODIUM_CONTROL_BASE") {
            config.control_base_url = base;
        }
        if let Some(dir) = env_string("PODIUM_STORAGE_DIR") {
            config.storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = env_secs("PODIUM_SYNC_INTERVAL_SECS") {
            config.sync_interval = secs;
        }
        if let Some(secs) = env_secs("PODIUM_POLL_FAST_SECS") {
            config.poll_interval_fast = secs;
        }
        if let Some(secs) = env_secs("PODIUM_POLL_SLOW_SECS") {
            config.poll_interval_slow = secs;
        }
        if let Some(secs) = env_secs("PODIUM_TELEMETRY_FLUSH_SECS") {
            config.telemetry_flush_interval = secs;
        }
        if let Some(secs) = env_secs("PODIUM_SESSION_CACHE_TTL_SECS") {
            config.session_cache_ttl = secs;
        }
        config
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_secs(var: &str) -> Option<Duration> {
    env_string(var)?
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.poll_interval_fast < config.poll_interval_slow);
        assert!(config.sync_interval >= Duration::from_secs(1));
    }
}
