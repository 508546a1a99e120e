//! Session configuration.

use std::fmt;
use std::time::Duration;

use crate::Encoding;

/// Default per-call receive window, in messages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Largest receive window a session advertises.
pub const MAX_CHANNEL_CAPACITY: usize = 1 << 16;

/// Default maximum frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Tunables for one [`RpcSession`](crate::RpcSession).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Messages the peer may send on one call before we grant it more.
    pub channel_capacity: usize,
    /// Encoding used for messages on calls this session opens.
    pub encoding: Encoding,
    /// Largest frame (descriptor + payload) a stream transport accepts.
    pub max_frame_size: usize,
    /// Applied to calls whose context carries no deadline.
    pub default_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            encoding: Encoding::Postcard,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            default_timeout: None,
        }
    }
}

impl SessionConfig {
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.channel_capacity > MAX_CHANNEL_CAPACITY {
            return Err(ConfigError::Invalid {
                key: "channel_capacity",
                reason: format!("must be at most {}", MAX_CHANNEL_CAPACITY),
            });
        }
        if self.max_frame_size <= crate::frame::DESC_SIZE {
            return Err(ConfigError::Invalid {
                key: "max_frame_size",
                reason: format!("must exceed the {} byte descriptor", crate::frame::DESC_SIZE),
            });
        }
        if self.default_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid {
                key: "default_timeout",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Defaults overridden by `TANDEM_*` environment variables.
    ///
    /// - `TANDEM_CHANNEL_CAPACITY`
    /// - `TANDEM_ENCODING` (`postcard` or `json`)
    /// - `TANDEM_MAX_FRAME_SIZE`
    /// - `TANDEM_DEFAULT_TIMEOUT_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`SessionConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("TANDEM_CHANNEL_CAPACITY") {
            config.channel_capacity = parse_number("TANDEM_CHANNEL_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("TANDEM_ENCODING") {
            config.encoding = Encoding::from_name(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "TANDEM_ENCODING",
                reason: format!("unknown encoding {:?}", raw),
            })?;
        }
        if let Some(raw) = lookup("TANDEM_MAX_FRAME_SIZE") {
            config.max_frame_size = parse_number("TANDEM_MAX_FRAME_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("TANDEM_DEFAULT_TIMEOUT_MS") {
            let millis: u64 = parse_number("TANDEM_DEFAULT_TIMEOUT_MS", &raw)?;
            config.default_timeout = Some(Duration::from_millis(millis));
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("{:?}: {}", raw, e),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { key, reason } => write!(f, "invalid {}: {}", key, reason),
        }
    }
}

impl std::error::Error for ConfigError {}
