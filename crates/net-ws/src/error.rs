use net_core::ErrorKind;

/// The WebSocket-layer error enumeration from the source's `Error` enum,
/// covering both handshake and steady-state failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WsError {
    #[error("ok")]
    Ok,
    #[error("handshake timed out")]
    Timeout,
    #[error("network error")]
    NetworkError,
    #[error("peer disconnected during handshake")]
    DisconnectedDuringHandshake,
    #[error("failed to send handshake request")]
    FailedToSendRequest,
    #[error("invalid http response")]
    InvalidHttpResponse,
    #[error("websocket upgrade rejected")]
    WebSocketUpgradeRejected,
    #[error("frame exceeds the 64 MiB per-frame cap")]
    PacketTooLarge,
    #[error("reassembled message exceeds the 128 MiB cap")]
    MessageTooLarge,
    #[error("frame could not be deserialized")]
    CannotDeserializePacket,
    #[error("packet was not expected in the current receive state")]
    UnexpectedPacket,
    #[error("control frame arrived fragmented")]
    FragmentedControlPacket,
    #[error("masking policy violated by peer")]
    MaskingViolation,
}

impl WsError {
    pub fn is_ok(self) -> bool {
        matches!(self, WsError::Ok)
    }
}

/// A `WsError` plus, when relevant, the underlying TCP-layer status that
/// produced it -- mirrors the source's `Status{.error, .net_status}` pair.
#[derive(Debug, Clone, Copy)]
pub struct Status {
    pub error: WsError,
    pub net_status: Option<ErrorKind>,
}

impl Status {
    pub fn ok() -> Self {
        Self { error: WsError::Ok, net_status: None }
    }

    pub fn from_error(error: WsError) -> Self {
        Self { error, net_status: None }
    }

    pub fn from_net(net_status: ErrorKind) -> Self {
        Self { error: WsError::NetworkError, net_status: Some(net_status) }
    }
}
