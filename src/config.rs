use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::handshake::Handshake;

/// Payloads above this size must be of the file data type and are spooled
///  through temporary files instead of being held in memory.
pub const DEFAULT_MAX_PLAIN_DATA_SIZE: usize = 1 << 24;

/// Upper bound for a single write when no download speed limit is set.
pub const MAX_SEND_CHUNK_SIZE: usize = 1 << 25;

/// Valid non-zero range for the download speed limit (bytes per second).
pub const DOWNLOAD_SPEED_RANGE: std::ops::RangeInclusive<u32> = 1024..=33_554_432;

pub struct ServerConfig {
    /// Close the connection when no inbound data arrives for this long.
    ///  `None` disables the idle timer.
    pub idle_timeout: Option<Duration>,
    /// Default wait for the peer's answer to a nested input. `None` waits
    ///  forever (until cancel or close).
    pub input_timeout: Option<Duration>,
    /// Emit a ping frame at this interval. Must stay below `idle_timeout`
    ///  so an otherwise quiet peer keeps answering. `None` disables pings.
    pub ping_interval: Option<Duration>,
    /// Pre-exchange challenge, run once after connect.
    pub handshake: Option<Arc<dyn Handshake>>,
    pub max_plain_data_size: usize,
    /// Initial download speed limit for new connections, bytes per second.
    ///  0 means unlimited; the peer may adjust it with a 0x05 frame.
    pub default_download_speed: u32,
    /// Maximum concurrent pending inputs per connection that count against
    ///  the limit; the oldest is cancelled when exceeded.
    pub input_limit: usize,
}

impl ServerConfig {
    pub fn new() -> ServerConfig {
        ServerConfig {
            idle_timeout: Some(Duration::from_secs(120)),
            input_timeout: Some(Duration::from_secs(120)),
            ping_interval: None,
            handshake: None,
            max_plain_data_size: DEFAULT_MAX_PLAIN_DATA_SIZE,
            default_download_speed: 33_554_432,
            input_limit: 30,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::new()
    }
}

impl Debug for ServerConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("idle_timeout", &self.idle_timeout)
            .field("input_timeout", &self.input_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("handshake", &self.handshake.as_ref().map(|_| "<configured>"))
            .field("max_plain_data_size", &self.max_plain_data_size)
            .field("default_download_speed", &self.default_download_speed)
            .field("input_limit", &self.input_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new();
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.input_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.ping_interval, None);
        assert!(config.handshake.is_none());
        assert_eq!(config.max_plain_data_size, 1 << 24);
        assert_eq!(config.default_download_speed, 33_554_432);
        assert!(DOWNLOAD_SPEED_RANGE.contains(&config.default_download_speed));
    }
}
