use std::time::Duration;

use thiserror::Error;

pub const ENV_DIAL_TIMEOUT_MS: &str = "MESHGATE_DIAL_TIMEOUT_MS";
pub const ENV_CLOSE_TIMEOUT_MS: &str = "MESHGATE_CLOSE_TIMEOUT_MS";
pub const ENV_COPY_BUFFER_BYTES: &str = "MESHGATE_COPY_BUFFER_BYTES";
pub const ENV_UDP_IDLE_TIMEOUT_MS: &str = "MESHGATE_UDP_IDLE_TIMEOUT_MS";

pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COPY_BUFFER_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    /// Upper bound on a single real-side dial. `None` leaves dials bounded only by the OS and by
    /// lifecycle shutdown.
    pub dial_timeout: Option<Duration>,
    /// Upper bound on shutting down one stream during session teardown.
    pub close_timeout: Option<Duration>,
    /// Per-direction copy buffer.
    pub copy_buffer_size: usize,
    /// Datagram flows with no traffic in either direction for this long are closed. `None`
    /// disables idle expiry; there is no built-in default.
    pub udp_idle_timeout: Option<Duration>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            dial_timeout: None,
            close_timeout: Some(DEFAULT_CLOSE_TIMEOUT),
            copy_buffer_size: DEFAULT_COPY_BUFFER_BYTES,
            udp_idle_timeout: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

impl ForwarderConfig {
    /// Build a config from `MESHGATE_*` environment variables, falling back to [`Default`] for
    /// unset ones. Durations are milliseconds; `0` disables the bound.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let dial_timeout = read_millis(ENV_DIAL_TIMEOUT_MS)?.unwrap_or(defaults.dial_timeout);
        let close_timeout = read_millis(ENV_CLOSE_TIMEOUT_MS)?.unwrap_or(defaults.close_timeout);
        let udp_idle_timeout =
            read_millis(ENV_UDP_IDLE_TIMEOUT_MS)?.unwrap_or(defaults.udp_idle_timeout);

        let copy_buffer_size = match read_var(ENV_COPY_BUFFER_BYTES) {
            None => defaults.copy_buffer_size,
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(invalid(ENV_COPY_BUFFER_BYTES, raw)),
            },
        };

        Ok(Self {
            dial_timeout,
            close_timeout,
            copy_buffer_size,
            udp_idle_timeout,
        })
    }
}

fn read_var(var: &'static str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

/// `Ok(None)` when unset, `Ok(Some(None))` when explicitly disabled with `0`.
fn read_millis(var: &'static str) -> Result<Option<Option<Duration>>, ConfigError> {
    let Some(raw) = read_var(var) else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(0) => Ok(Some(None)),
        Ok(ms) => Ok(Some(Some(Duration::from_millis(ms)))),
        Err(_) => Err(invalid(var, raw)),
    }
}

fn invalid(var: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidEnv { var, value }
}
