use std::time::Duration;

/// Tunables for the WebSocket layer. Defaults match the source's hardcoded
/// constants (`max_packet_size`, `max_message_size`, `connection_timeout`).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WsConfig {
    /// How long a client handshake or an accepting server handshake may take
    /// before it is abandoned.
    pub handshake_timeout: Duration,
    /// Hard cap on a single frame's header + payload size.
    pub max_packet_size: usize,
    /// Hard cap on a reassembled (possibly multi-frame) message.
    pub max_message_size: usize,
    /// Honour and emit the non-standard `Custom-DisableWebSocketMasks`
    /// extension header. Left off by default for interoperability; the
    /// header is retained behind this flag rather than dropped outright.
    pub allow_mask_override: bool,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(4),
            max_packet_size: 64 * 1024 * 1024,
            max_message_size: 128 * 1024 * 1024,
            allow_mask_override: false,
        }
    }
}

/// Per-direction masking policy for an established session. RFC 6455
/// requires clients to mask outbound frames and servers to leave theirs
/// unmasked; the non-standard override can relax both to unmasked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskingSettings {
    pub send_masked: bool,
    pub receive_masked: bool,
}

impl MaskingSettings {
    pub const fn client_default() -> Self {
        Self { send_masked: true, receive_masked: false }
    }

    pub const fn server_default() -> Self {
        Self { send_masked: false, receive_masked: true }
    }

    pub const fn none() -> Self {
        Self { send_masked: false, receive_masked: false }
    }
}
