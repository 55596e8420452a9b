//! Configuration loading and validation.
//!
//! `ChannelsConfig` is the typed, overridable view of the constants the
//! channel fabric and swarm coordinator would otherwise hard-code: the
//! frame size cap, the swarm base directory, the agent registration and
//! graceful-shutdown timeouts, and the TCP bridge reconnect backoff bounds.

use crate::error::{ConfigError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum frame payload size: 16 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Default timeout before a `starting` agent that never registered is
/// forced to `crashed`.
pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default overall timeout for `gracefulShutdown`.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default polling interval while waiting for agents to terminate.
pub const DEFAULT_SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default initial TCP bridge reconnect delay.
pub const DEFAULT_RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Default maximum TCP bridge reconnect delay.
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Timeout for the stale-socket probe connect in `ChannelServer::start`.
pub const STALE_SOCKET_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Runtime configuration for the channel fabric and swarm coordinator.
///
/// Every field here corresponds to a constant the original design treats
/// as fixed; making them fields lets embedders and tests override them
/// (in particular, shrinking the graceful-shutdown timeout for tests that
/// exercise the preemption path without a real 30-second wait).
#[derive(Debug, Clone)]
pub struct ChannelsConfig {
    /// Maximum accepted frame payload size, in bytes.
    pub max_frame_bytes: u32,

    /// Base directory under which swarm channel groups are created.
    pub swarm_base_dir: PathBuf,

    /// How long a `starting` agent has to send `register` before being
    /// marked `crashed`.
    pub register_timeout: Duration,

    /// Overall timeout for `gracefulShutdown` before `cleanupSwarm` runs
    /// unconditionally.
    pub shutdown_timeout: Duration,

    /// Polling interval while `gracefulShutdown` waits for agents to
    /// terminate.
    pub shutdown_poll_interval: Duration,

    /// Initial delay before the first TCP bridge reconnect attempt.
    pub reconnect_initial_delay: Duration,

    /// Upper bound on TCP bridge reconnect delay.
    pub reconnect_max_delay: Duration,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            swarm_base_dir: default_swarm_base_dir(),
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            shutdown_poll_interval: DEFAULT_SHUTDOWN_POLL_INTERVAL,
            reconnect_initial_delay: DEFAULT_RECONNECT_INITIAL_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
        }
    }
}

fn default_swarm_base_dir() -> PathBuf {
    std::env::temp_dir().join("pi-swarm")
}

impl ChannelsConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults, and optionally layering a TOML file on top.
    pub fn load() -> Result<Self> {
        Self::load_from_path(None)
    }

    /// Load configuration, optionally layering a TOML file at `path` on top
    /// of the environment-derived values.
    pub fn load_from_path(path: Option<&std::path::Path>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("PI_SWARM_MAX_FRAME_BYTES") {
            cfg.max_frame_bytes = v.parse().map_err(|_| {
                ConfigError::Invalid(format!("PI_SWARM_MAX_FRAME_BYTES: invalid integer '{v}'"))
            })?;
        }
        if let Ok(v) = std::env::var("PI_SWARM_BASE_DIR") {
            cfg.swarm_base_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PI_SWARM_REGISTER_TIMEOUT_MS") {
            cfg.register_timeout = Duration::from_millis(parse_ms(&v, "PI_SWARM_REGISTER_TIMEOUT_MS")?);
        }
        if let Ok(v) = std::env::var("PI_SWARM_SHUTDOWN_TIMEOUT_MS") {
            cfg.shutdown_timeout = Duration::from_millis(parse_ms(&v, "PI_SWARM_SHUTDOWN_TIMEOUT_MS")?);
        }
        if let Ok(v) = std::env::var("PI_SWARM_RECONNECT_INITIAL_MS") {
            cfg.reconnect_initial_delay =
                Duration::from_millis(parse_ms(&v, "PI_SWARM_RECONNECT_INITIAL_MS")?);
        }
        if let Ok(v) = std::env::var("PI_SWARM_RECONNECT_MAX_MS") {
            cfg.reconnect_max_delay = Duration::from_millis(parse_ms(&v, "PI_SWARM_RECONNECT_MAX_MS")?);
        }

        if let Some(path) = path {
            cfg = cfg.layer_toml_file(path)?;
        }

        Ok(cfg)
    }

    /// Layer a TOML file's `[channels]` table over the current values.
    fn layer_toml_file(mut self, path: &std::path::Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|source| ConfigError::Load {
                path: path.to_path_buf(),
                source,
            })?;

        if let Ok(v) = settings.get_int("channels.max_frame_bytes") {
            self.max_frame_bytes = v as u32;
        }
        if let Ok(v) = settings.get_string("channels.swarm_base_dir") {
            self.swarm_base_dir = PathBuf::from(v);
        }
        if let Ok(v) = settings.get_int("channels.register_timeout_ms") {
            self.register_timeout = Duration::from_millis(v as u64);
        }
        if let Ok(v) = settings.get_int("channels.shutdown_timeout_ms") {
            self.shutdown_timeout = Duration::from_millis(v as u64);
        }

        Ok(self)
    }
}

fn parse_ms(raw: &str, var: &'static str) -> Result<u64> {
    raw.parse()
        .map_err(|_| ConfigError::Invalid(format!("{var}: invalid integer '{raw}'")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = ChannelsConfig::default();
        assert_eq!(cfg.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(cfg.register_timeout, Duration::from_secs(30));
    }

    #[test]
    fn swarm_base_dir_defaults_under_temp() {
        let cfg = ChannelsConfig::default();
        assert!(cfg.swarm_base_dir.ends_with("pi-swarm"));
    }
}
