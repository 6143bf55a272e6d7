//! WebSocket transport: upgrade handler and per-connection tasks.

pub mod actor;
pub mod handler;
pub mod protocol;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Socket timings and limits. Exposed in `push-hub.toml` under `[socket]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Outbound queue capacity per client (default: 256)
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,

    /// Close the connection when nothing is read for this long (default: 60)
    #[serde(default = "default_read_deadline_secs")]
    pub read_deadline_secs: u64,

    /// Seconds between server pings; must be below the read deadline (default: 54)
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Upper bound on a single frame write (default: 10)
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,

    /// Largest inbound message accepted, in bytes (default: 512 KiB)
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            send_buffer: default_send_buffer(),
            read_deadline_secs: default_read_deadline_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            write_wait_secs: default_write_wait_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl SocketConfig {
    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }
}

fn default_send_buffer() -> usize {
    256
}

fn default_read_deadline_secs() -> u64 {
    60
}

fn default_ping_interval_secs() -> u64 {
    54
}

fn default_write_wait_secs() -> u64 {
    10
}

fn default_max_frame_bytes() -> usize {
    512 * 1024
}
