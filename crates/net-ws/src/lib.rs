//! A WebSocket (RFC 6455) client and server layered on top of `net-core`'s
//! TCP connections: frame (de)serialization, masking, fragmented-message
//! reassembly, ping/pong pacing, and the HTTP/1.1 Upgrade handshake.
//!
//! Everything here inherits `net-core`'s single-threaded-reactor contract --
//! a [`WebSocketClient`] or [`WebSocketServer`] must only be touched from the
//! thread running the [`net_core::Reactor`] it was built on.

pub mod config;
pub mod error;
pub mod frame;
mod handshake;
mod http;
mod server;
mod session;

pub use config::{MaskingSettings, WsConfig};
pub use error::{Status, WsError};
pub use frame::{FrameError, MaskingKey, Packet, PacketType};
pub use handshake::{MASK_OVERRIDE_HEADER, MASK_OVERRIDE_VALUE};
pub use http::{Method, ParseError as HttpParseError, Request, Response, Version};
pub use server::{
    OnClientConnected, OnConnectionRequest, OnError as OnServerError, OnListening,
    State as ServerState, WebSocketServer,
};
pub use session::{
    OnBinaryMessageReceived, OnClosed, OnConnected, OnDataSent, OnTextMessageReceived,
    State as ClientState, WebSocketClient,
};
