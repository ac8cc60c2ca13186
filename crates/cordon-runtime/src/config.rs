use std::time::Duration;

use cordon_worker::WorkerOptions;

pub const ENV_MAX_IDLE_SECONDS: &str = "CORDON_SESSION_MAX_IDLE_SECONDS";
pub const ENV_REAPER_INTERVAL_SECONDS: &str = "CORDON_SESSION_REAPER_INTERVAL_SECONDS";
pub const ENV_MAX_RESIDENT_WORKERS: &str = "CORDON_SESSION_MAX_WORKERS";
pub const ENV_WORKER_STOP_TIMEOUT_SECONDS: &str = "CORDON_WORKER_STOP_TIMEOUT_SECONDS";
pub const ENV_SESSION_TTL_SECONDS: &str = "CORDON_SESSION_TTL_SECONDS";
pub const ENV_RPC_TIMEOUT_SECONDS: &str = "CORDON_WORKER_RPC_TIMEOUT_SECONDS";

pub const DEFAULT_MAX_IDLE_SECONDS: f64 = 900.0;
pub const DEFAULT_REAPER_INTERVAL_SECONDS: f64 = 30.0;
pub const DEFAULT_MAX_RESIDENT_WORKERS: usize = 16;
pub const DEFAULT_WORKER_STOP_TIMEOUT_SECONDS: f64 = 5.0;
pub const DEFAULT_SESSION_TTL_SECONDS: f64 = 7.0 * 24.0 * 60.0 * 60.0;
pub const DEFAULT_RPC_TIMEOUT_SECONDS: f64 = 30.0;

/// Runtime knobs. `None` disables the corresponding mechanism: idle
/// reaping, the reaper sweep, the resident-worker cap, TTL expiry, or the
/// per-call RPC timeout (zero and negative configured values map to `None`,
/// never to "fail immediately").
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub max_idle: Option<Duration>,
    pub reaper_interval: Option<Duration>,
    pub max_resident_workers: Option<usize>,
    pub worker_stop_timeout: Duration,
    pub session_ttl: Option<Duration>,
    pub rpc_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_idle: seconds_opt(DEFAULT_MAX_IDLE_SECONDS),
            reaper_interval: seconds_opt(DEFAULT_REAPER_INTERVAL_SECONDS),
            max_resident_workers: Some(DEFAULT_MAX_RESIDENT_WORKERS),
            worker_stop_timeout: Duration::from_secs_f64(DEFAULT_WORKER_STOP_TIMEOUT_SECONDS),
            session_ttl: seconds_opt(DEFAULT_SESSION_TTL_SECONDS),
            rpc_timeout: seconds_opt(DEFAULT_RPC_TIMEOUT_SECONDS),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `CORDON_*` environment variables. A malformed
    /// value is a configuration error, never a silent fallback.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = RuntimeConfig::default();
        if let Some(v) = read_f64_env(ENV_MAX_IDLE_SECONDS)? {
            config.max_idle = seconds_opt(v);
        }
        if let Some(v) = read_f64_env(ENV_REAPER_INTERVAL_SECONDS)? {
            config.reaper_interval = seconds_opt(v);
        }
        if let Some(v) = read_i64_env(ENV_MAX_RESIDENT_WORKERS)? {
            config.max_resident_workers = usize::try_from(v).ok().filter(|n| *n > 0);
        }
        if let Some(v) = read_f64_env(ENV_WORKER_STOP_TIMEOUT_SECONDS)? {
            config.worker_stop_timeout = Duration::from_secs_f64(v.max(0.0));
        }
        if let Some(v) = read_f64_env(ENV_SESSION_TTL_SECONDS)? {
            config.session_ttl = seconds_opt(v);
        }
        if let Some(v) = read_f64_env(ENV_RPC_TIMEOUT_SECONDS)? {
            config.rpc_timeout = seconds_opt(v);
        }
        Ok(config)
    }

    /// The per-worker options derived from this configuration.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            rpc_timeout: self.rpc_timeout,
            stop_timeout: self.worker_stop_timeout,
        }
    }
}

fn seconds_opt(seconds: f64) -> Option<Duration> {
    if seconds > 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

fn read_f64_env(name: &str) -> anyhow::Result<Option<f64>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let value: f64 = raw.trim().parse().map_err(|_| {
        anyhow::anyhow!("invalid environment variable {name}={raw:?} (expected a number)")
    })?;
    Ok(Some(value))
}

fn read_i64_env(name: &str) -> anyhow::Result<Option<i64>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let value: i64 = raw.trim().parse().map_err(|_| {
        anyhow::anyhow!("invalid environment variable {name}={raw:?} (expected an integer)")
    })?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_knobs() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_idle, Some(Duration::from_secs(900)));
        assert_eq!(config.reaper_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.max_resident_workers, Some(16));
        assert_eq!(config.worker_stop_timeout, Duration::from_secs(5));
        assert_eq!(config.session_ttl, Some(Duration::from_secs(7 * 24 * 60 * 60)));
        assert_eq!(config.rpc_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_disables_rather_than_failing_fast() {
        assert_eq!(seconds_opt(0.0), None);
        assert_eq!(seconds_opt(-1.0), None);
        assert_eq!(seconds_opt(0.5), Some(Duration::from_millis(500)));
    }
}
