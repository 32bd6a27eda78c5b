//! Runtime tunables, read from the environment or set explicitly.

use std::time::Duration;

use tracing::warn;

/// Seconds allowed per attempt cycle, from address resolution to
/// giving up
pub const DEFAULT_CONNECTION_WINDOW: u64 = 120;

/// Connection attempts per link-enable cycle
pub const DEFAULT_CONNECTION_RETRY: u32 = 5;

/// Fail-fast window after a fatal stream error
pub const DEFAULT_STREAM_ERROR_WINDOW: u64 = 1800;

/// Deadline applied when the caller passes a zero timeout
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 1800;

/// Streams opened per channel
pub const DEFAULT_STREAMS_PER_CHANNEL: u16 = 1;

/// Cadence of the timeout sweeps
pub const DEFAULT_TIMEOUT_RESOLUTION: u64 = 15;

/// Idle disconnect threshold for data servers
pub const DEFAULT_DATA_SERVER_TTL: u64 = 300;

/// Idle disconnect threshold for managers
pub const DEFAULT_MANAGER_TTL: u64 = 1200;

/// Initial value of the per-request redirect counter
pub const DEFAULT_MAX_REDIRECTS: u16 = 16;

/// Post-master configuration.
///
/// Every field has a compiled-in default and may be overridden from the
/// environment (`XRD_CONNECTIONWINDOW`, `XRD_CONNECTIONRETRY`, ...) or set
/// directly before the runtime is started.
#[derive(Debug, Clone)]
pub struct Config {
    pub connection_window: Duration,
    pub connection_retry: u32,
    pub stream_error_window: Duration,
    pub request_timeout: Duration,
    pub streams_per_channel: u16,
    pub timeout_resolution: Duration,
    pub data_server_ttl: Duration,
    pub manager_ttl: Duration,
    pub max_redirects: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_window: Duration::from_secs(DEFAULT_CONNECTION_WINDOW),
            connection_retry: DEFAULT_CONNECTION_RETRY,
            stream_error_window: Duration::from_secs(DEFAULT_STREAM_ERROR_WINDOW),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT),
            streams_per_channel: DEFAULT_STREAMS_PER_CHANNEL,
            timeout_resolution: Duration::from_secs(DEFAULT_TIMEOUT_RESOLUTION),
            data_server_ttl: Duration::from_secs(DEFAULT_DATA_SERVER_TTL),
            manager_ttl: Duration::from_secs(DEFAULT_MANAGER_TTL),
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

impl Config {
    /// Build a configuration from defaults overridden by `XRD_*` environment
    /// variables. Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_u64("XRD_CONNECTIONWINDOW") {
            cfg.connection_window = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("XRD_CONNECTIONRETRY") {
            cfg.connection_retry = v as u32;
        }
        if let Some(v) = env_u64("XRD_STREAMERRORWINDOW") {
            cfg.stream_error_window = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("XRD_REQUESTTIMEOUT") {
            cfg.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("XRD_STREAMSPERCHANNEL") {
            cfg.streams_per_channel = v as u16;
        }
        if let Some(v) = env_u64("XRD_TIMEOUTRESOLUTION") {
            cfg.timeout_resolution = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("XRD_DATASERVERTTL") {
            cfg.data_server_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("XRD_MANAGERTTL") {
            cfg.manager_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("XRD_MAXREDIRECTS") {
            cfg.max_redirects = v as u16;
        }
        cfg
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.connection_window, Duration::from_secs(120));
        assert_eq!(cfg.connection_retry, 5);
        assert_eq!(cfg.stream_error_window, Duration::from_secs(1800));
        assert_eq!(cfg.request_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.streams_per_channel, 1);
        assert_eq!(cfg.timeout_resolution, Duration::from_secs(15));
        assert_eq!(cfg.max_redirects, 16);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("XRD_CONNECTIONRETRY", "7");
        std::env::set_var("XRD_MAXREDIRECTS", "not-a-number");
        let cfg = Config::from_env();
        assert_eq!(cfg.connection_retry, 7);
        assert_eq!(cfg.max_redirects, DEFAULT_MAX_REDIRECTS);
        std::env::remove_var("XRD_CONNECTIONRETRY");
        std::env::remove_var("XRD_MAXREDIRECTS");
    }
}
