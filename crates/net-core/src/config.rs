use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs for the reactor loop itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Upper bound on how long a single `poll` syscall may block when the
    /// caller did not pass an explicit timeout and no timer is pending.
    pub max_poll_timeout: Duration,
    /// Capacity of the scratch `mio::Events` buffer.
    pub events_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self { max_poll_timeout: Duration::from_secs(1), events_capacity: 1024 }
    }
}

/// Per-connection buffering and retry limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionLimits {
    /// Outbound backpressure cap, in bytes.
    pub send_buffer_max_size: usize,
    /// Whether a full send buffer blocks further receive processing.
    pub block_on_send_buffer_full: bool,
    /// Whether the reactor should even poll for readability.
    pub receive_packets: bool,
    /// Growth step and per-tick ceiling for the receive buffer.
    pub receive_grow_step: usize,
    pub receive_tick_ceiling: usize,
    /// Per-syscall cap on a single vectored send.
    pub send_syscall_ceiling: usize,
    /// Per-address connect timeout during the resolve-then-sweep dance.
    pub connect_attempt_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            send_buffer_max_size: 8 * 1024 * 1024,
            block_on_send_buffer_full: true,
            receive_packets: true,
            receive_grow_step: 16 * 1024,
            receive_tick_ceiling: 16 * 1024 * 1024,
            send_syscall_ceiling: 32 * 1024 * 1024,
            connect_attempt_timeout: Duration::from_millis(300),
        }
    }
}

/// Per-socket limits for UDP datagram sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpLimits {
    pub send_buffer_max_size: usize,
    pub max_queued_datagrams: usize,
}

impl Default for UdpLimits {
    fn default() -> Self {
        Self { send_buffer_max_size: 8 * 1024 * 1024, max_queued_datagrams: 32_768 }
    }
}

pub const MAX_UDP_DATAGRAM_SIZE: usize = 65_535;
