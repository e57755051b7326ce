//! The WebSocket session: the client-side handshake driver, the steady-state
//! frame dispatch loop, and the public [`WebSocketClient`] handle.
//!
//! Grounded on `WebSocketClientImpl.cpp` and `WebSocketConnectorImpl.cpp`.
//! The accepting (server) side lives in `server.rs` and hands off into this
//! module's [`WebSocketClient::from_established`] once its own handshake has
//! succeeded.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use rand::RngCore;

use net_core::{ConnectionLimits, Reactor, SystemError, TcpConnection, TimerId};

use crate::config::{MaskingSettings, WsConfig};
use crate::error::{Status, WsError};
use crate::frame::{self, MaskingKey, Packet, PacketType};
use crate::handshake;
use crate::http;

pub type OnConnected = Box<dyn FnMut(Status)>;
pub type OnClosed = Box<dyn FnMut(Status)>;
pub type OnTextMessageReceived = Box<dyn FnMut(&str)>;
pub type OnBinaryMessageReceived = Box<dyn FnMut(&[u8])>;
pub type OnDataSent = Box<dyn FnMut()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    Idle,
    ReceivingText,
    ReceivingBinary,
}

struct PendingPacket {
    packet: Packet,
    header_size: usize,
    total_size: usize,
}

#[derive(Default)]
struct Callbacks {
    on_connected: Option<OnConnected>,
    on_closed: Option<OnClosed>,
    on_text_message_received: Option<OnTextMessageReceived>,
    on_binary_message_received: Option<OnBinaryMessageReceived>,
    on_data_sent: Option<OnDataSent>,
}

/// Client-side opening-handshake driver: sends the Upgrade request, then
/// parses the response out of whatever bytes arrive until it either
/// completes or fails.
struct Connector {
    uri: String,
    key: String,
    timer: Option<TimerId>,
}

enum ConnectorOutcome {
    NeedMoreData,
    Finished { consumed: usize, masking: MaskingSettings },
    Failed { consumed: usize, error: WsError },
}

impl Connector {
    fn new(uri: String) -> Self {
        Self { uri, key: handshake::client::generate_random_key(), timer: None }
    }

    fn send_request(&self, connection: &TcpConnection, allow_mask_override: bool) -> bool {
        let mut request = handshake::client::create_http_request(&self.uri, &self.key);
        if allow_mask_override {
            handshake::inject_mask_override(&mut request.headers);
        }
        let serialized = http::serialize_request(&request);
        connection.send_data(serialized.as_bytes())
    }

    fn on_data_received(&self, data: &[u8], allow_mask_override: bool) -> ConnectorOutcome {
        let parsed = match http::parse_response(data) {
            Ok(parsed) => parsed,
            Err(http::ParseError::NotEnoughData) => return ConnectorOutcome::NeedMoreData,
            Err(_) => return ConnectorOutcome::Failed { consumed: 0, error: WsError::InvalidHttpResponse },
        };

        let consumed = parsed.consumed;
        if let Err(validation_error) =
            handshake::client::validate_http_response(&parsed.value, &self.key)
        {
            let error = if validation_error == handshake::ClientValidationError::UpgradeRejected {
                WsError::WebSocketUpgradeRejected
            } else {
                WsError::InvalidHttpResponse
            };
            return ConnectorOutcome::Failed { consumed, error };
        }

        let mut masking = MaskingSettings::client_default();
        if allow_mask_override && handshake::contains_mask_override(&parsed.value.headers) {
            masking = MaskingSettings::none();
        }

        ConnectorOutcome::Finished { consumed, masking }
    }
}

struct ClientState {
    connection: TcpConnection,
    reactor: Reactor,
    config: WsConfig,
    state: State,
    masking: MaskingSettings,
    connector: Option<Connector>,
    receive_state: ReceiveState,
    pending_packet: Option<PendingPacket>,
    message_buffer: Vec<u8>,
    can_register_data_sent_callback: bool,
    is_data_sent_callback_registered: bool,
    pending_pings: u64,
    pending_pongs: u64,
    callbacks: Callbacks,
}

/// Public handle to one WebSocket connection, client or server side.
///
/// Cloning shares the same underlying state; the last clone's `Drop`
/// shuts the session (and its TCP connection) down the same way
/// [`net_core::TcpConnection`]'s own `Drop` does.
#[derive(Clone)]
pub struct WebSocketClient {
    inner: Rc<RefCell<ClientState>>,
}

impl WebSocketClient {
    /// Connects a fresh TCP connection to `addrs` and drives the client
    /// handshake against `uri` once it lands.
    pub fn connect(
        reactor: &Reactor,
        addrs: Vec<SocketAddr>,
        uri: impl Into<String>,
        config: WsConfig,
    ) -> Self {
        let connection = TcpConnection::connect(reactor, addrs, ConnectionLimits::default());
        Self::connecting(reactor, connection, uri.into(), config)
    }

    /// Same as [`WebSocketClient::connect`], resolving `host:port` first.
    pub fn connect_host(
        reactor: &Reactor,
        host: impl Into<String>,
        port: u16,
        uri: impl Into<String>,
        config: WsConfig,
    ) -> Self {
        let connection =
            TcpConnection::connect_host(reactor, host, port, ConnectionLimits::default());
        Self::connecting(reactor, connection, uri.into(), config)
    }

    fn connecting(reactor: &Reactor, connection: TcpConnection, uri: String, config: WsConfig) -> Self {
        let state = ClientState {
            connection,
            reactor: reactor.clone(),
            config,
            state: State::Connecting,
            masking: MaskingSettings::client_default(),
            connector: Some(Connector::new(uri)),
            receive_state: ReceiveState::Idle,
            pending_packet: None,
            message_buffer: Vec::new(),
            can_register_data_sent_callback: true,
            is_data_sent_callback_registered: false,
            pending_pings: 0,
            pending_pongs: 0,
            callbacks: Callbacks::default(),
        };
        let client = Self { inner: Rc::new(RefCell::new(state)) };

        let timer_client = client.clone();
        let timer = reactor.register_timer(
            client.inner.borrow().config.handshake_timeout,
            Box::new(move |_reactor| on_handshake_timeout(&timer_client)),
        );
        client.inner.borrow_mut().connector.as_mut().unwrap().timer = Some(timer);

        let on_connected_client = client.clone();
        let on_closed_client = client.clone();
        let on_data_received_client = client.clone();
        client.inner.borrow().connection.on_connected(Box::new(move |status| {
            on_tcp_connected(&on_connected_client, status)
        }));
        client.inner.borrow().connection.on_closed(Box::new(move |status| {
            on_tcp_closed(&on_closed_client, status)
        }));
        client.inner.borrow().connection.on_data_received(Box::new(move |data| {
            on_data_received(&on_data_received_client, data)
        }));

        client
    }

    /// Wraps a connection whose handshake already completed (the server
    /// accept path in `server.rs`). There is no `on_connected` firing here,
    /// mirroring `WebSocketClientImpl::startup(self)` (no-uri overload).
    pub(crate) fn from_established(
        reactor: &Reactor,
        connection: TcpConnection,
        masking: MaskingSettings,
        config: WsConfig,
    ) -> Self {
        let state = ClientState {
            connection,
            reactor: reactor.clone(),
            config,
            state: State::Connected,
            masking,
            connector: None,
            receive_state: ReceiveState::Idle,
            pending_packet: None,
            message_buffer: Vec::new(),
            can_register_data_sent_callback: true,
            is_data_sent_callback_registered: false,
            pending_pings: 0,
            pending_pongs: 0,
            callbacks: Callbacks::default(),
        };
        let client = Self { inner: Rc::new(RefCell::new(state)) };

        let on_closed_client = client.clone();
        let on_data_received_client = client.clone();
        client.inner.borrow().connection.on_closed(Box::new(move |status| {
            on_tcp_closed(&on_closed_client, status)
        }));
        client.inner.borrow().connection.on_data_received(Box::new(move |data| {
            on_data_received(&on_data_received_client, data)
        }));

        client
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().state == State::Connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().connection.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().connection.local_addr()
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.inner.borrow().connection.total_bytes_sent()
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.inner.borrow().connection.total_bytes_received()
    }

    pub fn on_connected(&self, cb: OnConnected) {
        let inner = self.inner.clone();
        let reactor = self.inner.borrow().reactor.clone();
        reactor.post(Box::new(move |_| inner.borrow_mut().callbacks.on_connected = Some(cb)));
    }

    pub fn on_closed(&self, cb: OnClosed) {
        let inner = self.inner.clone();
        let reactor = self.inner.borrow().reactor.clone();
        reactor.post(Box::new(move |_| inner.borrow_mut().callbacks.on_closed = Some(cb)));
    }

    pub fn on_text_message_received(&self, cb: OnTextMessageReceived) {
        let inner = self.inner.clone();
        let reactor = self.inner.borrow().reactor.clone();
        reactor.post(Box::new(move |_| {
            inner.borrow_mut().callbacks.on_text_message_received = Some(cb);
        }));
    }

    pub fn on_binary_message_received(&self, cb: OnBinaryMessageReceived) {
        let inner = self.inner.clone();
        let reactor = self.inner.borrow().reactor.clone();
        reactor.post(Box::new(move |_| {
            inner.borrow_mut().callbacks.on_binary_message_received = Some(cb);
        }));
    }

    pub fn on_data_sent(&self, cb: OnDataSent) {
        let client = self.clone();
        let reactor = self.inner.borrow().reactor.clone();
        reactor.post(Box::new(move |_| {
            client.inner.borrow_mut().callbacks.on_data_sent = Some(cb);
            request_tcp_data_sent_callback(&client);
        }));
    }

    pub fn send_buffer_remaining_size(&self) -> usize {
        self.inner.borrow().connection.send_buffer_remaining_size()
    }

    pub fn pending_to_send(&self) -> usize {
        self.inner.borrow().connection.pending_to_send()
    }

    pub fn is_send_buffer_empty(&self) -> bool {
        self.inner.borrow().connection.is_send_buffer_empty()
    }

    pub fn is_send_buffer_full(&self) -> bool {
        self.inner.borrow().connection.is_send_buffer_full()
    }

    pub fn max_send_buffer_size(&self) -> usize {
        self.inner.borrow().connection.max_send_buffer_size()
    }

    pub fn set_max_send_buffer_size(&self, size: usize) {
        self.inner.borrow().connection.set_send_buffer_max_size(size);
    }

    pub fn set_block_on_send_buffer_full(&self, block: bool) {
        self.inner.borrow().connection.set_block_on_send_buffer_full(block);
    }

    pub fn set_receive_packets(&self, enabled: bool) {
        self.inner.borrow().connection.set_receive_packets(enabled);
    }

    /// Whether a message of `payload_size` bytes can be queued right now
    /// without exceeding the connection's send buffer cap.
    pub fn can_send_message(&self, payload_size: usize) -> bool {
        let state = self.inner.borrow();
        if state.state != State::Connected {
            return false;
        }
        let needed = frame::serialized_packet_size(payload_size, state.masking.send_masked);
        needed <= state.connection.send_buffer_remaining_size()
    }

    pub fn send_text_message(&self, payload: &str, force: bool) -> bool {
        self.send_message_payload(PacketType::Text, payload.as_bytes(), force)
    }

    pub fn send_binary_message(&self, payload: &[u8], force: bool) -> bool {
        self.send_message_payload(PacketType::Binary, payload, force)
    }

    fn send_message_payload(&self, packet_type: PacketType, payload: &[u8], force: bool) -> bool {
        if self.inner.borrow().state != State::Connected {
            return false;
        }
        let masking_key = generate_masking_key_if_needed(&self.inner);
        let packet = Packet { packet_type, fin: true, payload_size: payload.len(), masking_key };
        send_packet(&self.inner, &packet, payload, force)
    }

    pub fn send_ping(&self) {
        if self.inner.borrow().state != State::Connected {
            return;
        }
        queue_ping_pong(&self.inner, true);
    }

    pub fn shutdown(&self) {
        let mut state = self.inner.borrow_mut();
        if state.state == State::Shutdown {
            return;
        }
        let was_connected = state.state == State::Connected;
        let should_send_close = state.state != State::Error && state.state != State::Disconnected;
        state.state = State::Shutdown;
        drop(state);

        if should_send_close && was_connected {
            let masking_key = generate_masking_key_if_needed(&self.inner);
            let packet =
                Packet { packet_type: PacketType::Close, fin: true, payload_size: 0, masking_key };
            send_packet(&self.inner, &packet, &[], true);
        }
        cleanup_immediate(&self.inner);
    }
}

fn generate_masking_key_if_needed(inner: &Rc<RefCell<ClientState>>) -> Option<MaskingKey> {
    if !inner.borrow().masking.send_masked {
        return None;
    }
    let mut key = [0u8; 4];
    rand::rng().fill_bytes(&mut key);
    Some(key)
}

/// Serializes `packet`/`payload` and hands the bytes to the underlying TCP
/// connection, masking `payload` in place first if the packet carries a key.
/// Mirrors `WebSocketClientImpl::send_packet`: the non-`force` path checks
/// the serialized size against the send buffer's remaining budget before
/// queueing anything, so a refusal never partially writes a frame.
fn send_packet(inner: &Rc<RefCell<ClientState>>, packet: &Packet, payload: &[u8], force: bool) -> bool {
    let mut scratch = payload.to_vec();
    let state = inner.borrow();
    if force {
        let mut out = Vec::new();
        frame::serialize(packet, &mut scratch, &mut out);
        state.connection.send_data_force(&out);
        true
    } else {
        let needed = frame::serialized_packet_size(payload.len(), packet.masking_key.is_some());
        if needed > state.connection.send_buffer_remaining_size() {
            return false;
        }
        state.connection.send(|buf| frame::serialize(packet, &mut scratch, buf))
    }
}

fn queue_ping_pong(inner: &Rc<RefCell<ClientState>>, ping: bool) {
    if !try_send_ping_pong(inner, ping) {
        request_tcp_data_sent_callback_raw(inner);
        let mut state = inner.borrow_mut();
        if ping {
            state.pending_pings += 1;
        } else {
            state.pending_pongs += 1;
        }
    }
}

fn try_send_ping_pong(inner: &Rc<RefCell<ClientState>>, ping: bool) -> bool {
    let masking_key = generate_masking_key_if_needed(inner);
    let packet_type = if ping { PacketType::Ping } else { PacketType::Pong };
    let packet = Packet { packet_type, fin: true, payload_size: 0, masking_key };
    send_packet(inner, &packet, &[], false)
}

fn send_queued_ping_pongs(inner: &Rc<RefCell<ClientState>>) {
    let (pongs_to_send, pings_to_send) = {
        let state = inner.borrow();
        (state.pending_pongs, state.pending_pings)
    };
    if pongs_to_send == 0 && pings_to_send == 0 {
        return;
    }

    // Pongs first so the peer does not drop the connection while pings wait.
    for _ in 0..pongs_to_send {
        if !try_send_ping_pong(inner, false) {
            return;
        }
        inner.borrow_mut().pending_pongs -= 1;
    }
    for _ in 0..pings_to_send {
        if !try_send_ping_pong(inner, true) {
            return;
        }
        inner.borrow_mut().pending_pings -= 1;
    }
}

fn request_tcp_data_sent_callback(client: &WebSocketClient) {
    request_tcp_data_sent_callback_raw(&client.inner);
}

fn request_tcp_data_sent_callback_raw(inner: &Rc<RefCell<ClientState>>) {
    let should_register = {
        let state = inner.borrow();
        !state.is_data_sent_callback_registered && state.can_register_data_sent_callback
    };
    if !should_register {
        return;
    }
    let cb_inner = inner.clone();
    inner.borrow().connection.on_data_sent(Box::new(move || on_tcp_data_sent(&cb_inner)));
    inner.borrow_mut().is_data_sent_callback_registered = true;
}

fn on_tcp_data_sent(inner: &Rc<RefCell<ClientState>>) {
    if inner.borrow().state != State::Connected {
        return;
    }
    send_queued_ping_pongs(inner);
    let mut state = inner.borrow_mut();
    if let Some(cb) = &mut state.callbacks.on_data_sent {
        cb();
    }
}

fn on_handshake_timeout(client: &WebSocketClient) {
    if client.inner.borrow().state == State::Connecting {
        on_ws_error(client, Status::from_error(WsError::Timeout));
    }
}

fn on_tcp_connected(client: &WebSocketClient, status: SystemError) {
    if client.inner.borrow().state != State::Connecting {
        return;
    }
    if status.is_ok() {
        let allow_override = client.inner.borrow().config.allow_mask_override;
        let sent = {
            let state = client.inner.borrow();
            let Some(connector) = &state.connector else { return };
            connector.send_request(&state.connection, allow_override)
        };
        if !sent {
            on_ws_error(client, Status::from_error(WsError::FailedToSendRequest));
        }
    } else {
        on_ws_error(client, Status::from_net(status.kind()));
    }
}

fn on_tcp_closed(client: &WebSocketClient, status: SystemError) {
    if status.is_ok() {
        on_ws_disconnected(client);
    } else {
        on_ws_error(client, Status::from_net(status.kind()));
    }
}

fn on_ws_disconnected(client: &WebSocketClient) {
    client.inner.borrow_mut().connector = None;

    let mut state = client.inner.borrow_mut();
    match state.state {
        State::Connecting => {
            state.state = State::Error;
            drop(state);
            fire_connected_or_log(client, Status::from_error(WsError::DisconnectedDuringHandshake));
        }
        State::Connected => {
            state.state = State::Disconnected;
            drop(state);
            fire_closed(client, Status::ok());
        }
        _ => {}
    }

    cleanup(client);
}

fn on_ws_error(client: &WebSocketClient, status: Status) {
    client.inner.borrow_mut().connector = None;

    let mut state = client.inner.borrow_mut();
    match state.state {
        State::Connecting => {
            state.state = State::Error;
            drop(state);
            fire_connected_or_log(client, status);
        }
        State::Connected => {
            state.state = State::Error;
            drop(state);
            fire_closed(client, status);
        }
        _ => {}
    }

    cleanup(client);
}

fn fire_connected_or_log(client: &WebSocketClient, status: Status) {
    let mut state = client.inner.borrow_mut();
    if let Some(cb) = &mut state.callbacks.on_connected {
        cb(status);
    } else {
        tracing::error!(error = ?status.error, "websocket client: error before on_connected was set");
    }
}

fn fire_closed(client: &WebSocketClient, status: Status) {
    let mut state = client.inner.borrow_mut();
    if let Some(cb) = &mut state.callbacks.on_closed {
        cb(status);
    }
}

fn cleanup(client: &WebSocketClient) {
    client.inner.borrow_mut().can_register_data_sent_callback = false;
    let inner = client.inner.clone();
    let reactor = client.inner.borrow().reactor.clone();
    // Posted rather than run synchronously: the caller may be a callback
    // this very `Rc` is the last owner of.
    reactor.post(Box::new(move |_| cleanup_immediate(&inner)));
}

fn cleanup_immediate(inner: &Rc<RefCell<ClientState>>) {
    let mut state = inner.borrow_mut();
    state.can_register_data_sent_callback = false;
    state.connection.shutdown();
    state.connector = None;
    state.callbacks = Callbacks::default();
}

fn on_connector_succeeded(client: &WebSocketClient, masking: MaskingSettings) {
    client.inner.borrow_mut().masking = masking;
    client.inner.borrow_mut().connector = None;
    client.inner.borrow_mut().state = State::Connected;
    fire_connected_or_log(client, Status::ok());
}

fn dispatch_message(client: &WebSocketClient, payload: &[u8]) {
    let mut state = client.inner.borrow_mut();
    match state.receive_state {
        ReceiveState::ReceivingText => {
            state.receive_state = ReceiveState::Idle;
            if let Some(cb) = &mut state.callbacks.on_text_message_received {
                match std::str::from_utf8(payload) {
                    Ok(text) => cb(text),
                    Err(_) => tracing::warn!("websocket client: dropped non-UTF-8 text message"),
                }
            }
        }
        ReceiveState::ReceivingBinary => {
            state.receive_state = ReceiveState::Idle;
            if let Some(cb) = &mut state.callbacks.on_binary_message_received {
                cb(payload);
            }
        }
        ReceiveState::Idle => {
            net_utils::safe_panic!("dispatch_message called while receive state is idle");
        }
    }
}

/// Appends or fast-paths a message payload. Returns `false` if the session
/// should stop processing further data this call (an error was raised).
fn handle_websocket_message_payload(client: &WebSocketClient, packet: &Packet, payload: &[u8]) -> bool {
    let fast_path = {
        let state = client.inner.borrow();
        packet.fin && packet.masking_key.is_none() && state.message_buffer.is_empty()
    };
    if fast_path {
        dispatch_message(client, payload);
        return true;
    }

    let max_message_size = client.inner.borrow().config.max_message_size;
    let over_budget = client.inner.borrow().message_buffer.len() + payload.len() > max_message_size;
    if over_budget {
        on_ws_error(client, Status::from_error(WsError::MessageTooLarge));
        return false;
    }

    let mut state = client.inner.borrow_mut();
    let size_before = state.message_buffer.len();
    state.message_buffer.extend_from_slice(payload);
    if let Some(key) = packet.masking_key {
        frame::mask_payload(key, &mut state.message_buffer[size_before..]);
    }
    let finished = packet.fin;
    drop(state);

    if finished {
        let message = std::mem::take(&mut client.inner.borrow_mut().message_buffer);
        dispatch_message(client, &message);
    }
    true
}

fn handle_websocket_packet(client: &WebSocketClient, packet: &Packet, payload: &[u8]) -> bool {
    if client.inner.borrow().state != State::Connected {
        return true;
    }

    let expected_masked = client.inner.borrow().masking.receive_masked;
    if expected_masked != packet.masking_key.is_some() {
        on_ws_error(client, Status::from_error(WsError::MaskingViolation));
        return false;
    }

    match packet.packet_type {
        PacketType::Continuation => {
            let receiving = matches!(
                client.inner.borrow().receive_state,
                ReceiveState::ReceivingText | ReceiveState::ReceivingBinary
            );
            if receiving {
                handle_websocket_message_payload(client, packet, payload)
            } else {
                on_ws_error(client, Status::from_error(WsError::UnexpectedPacket));
                false
            }
        }
        PacketType::Text => {
            let idle = client.inner.borrow().receive_state == ReceiveState::Idle;
            if idle {
                client.inner.borrow_mut().receive_state = ReceiveState::ReceivingText;
                handle_websocket_message_payload(client, packet, payload)
            } else {
                on_ws_error(client, Status::from_error(WsError::UnexpectedPacket));
                false
            }
        }
        PacketType::Binary => {
            let idle = client.inner.borrow().receive_state == ReceiveState::Idle;
            if idle {
                client.inner.borrow_mut().receive_state = ReceiveState::ReceivingBinary;
                handle_websocket_message_payload(client, packet, payload)
            } else {
                on_ws_error(client, Status::from_error(WsError::UnexpectedPacket));
                false
            }
        }
        PacketType::Close => {
            if !packet.fin {
                on_ws_error(client, Status::from_error(WsError::FragmentedControlPacket));
                return false;
            }

            let mut buffer = payload.to_vec();
            if let Some(key) = packet.masking_key {
                frame::mask_payload(key, &mut buffer);
            }
            let echo_masking_key = generate_masking_key_if_needed(&client.inner);
            if let Some(key) = echo_masking_key {
                frame::mask_payload(key, &mut buffer);
            }
            let echo_packet = Packet {
                packet_type: PacketType::Close,
                fin: true,
                payload_size: buffer.len(),
                masking_key: echo_masking_key,
            };
            send_packet(&client.inner, &echo_packet, &buffer, false);

            on_ws_disconnected(client);
            true
        }
        PacketType::Ping => {
            if !packet.fin {
                on_ws_error(client, Status::from_error(WsError::FragmentedControlPacket));
                return false;
            }
            queue_ping_pong(&client.inner, false);
            true
        }
        PacketType::Pong => {
            if !packet.fin {
                on_ws_error(client, Status::from_error(WsError::FragmentedControlPacket));
                return false;
            }
            // Pongs are not surfaced to the caller.
            true
        }
    }
}

fn handle_websocket_data(client: &WebSocketClient, data: &[u8]) -> usize {
    let pending = client.inner.borrow_mut().pending_packet.take();
    if let Some(pending) = pending {
        if pending.total_size > data.len() {
            client.inner.borrow_mut().pending_packet = Some(pending);
            return 0;
        }

        let payload = &data[pending.header_size..pending.total_size];
        let result = handle_websocket_packet(client, &pending.packet, payload);
        if !result {
            return data.len();
        }
        return pending.total_size;
    }

    let max_packet_size = client.inner.borrow().config.max_packet_size;
    match frame::deserialize(data) {
        Err(frame::FrameError::NeedMoreData) => 0,
        Err(_) => {
            on_ws_error(client, Status::from_error(WsError::CannotDeserializePacket));
            data.len()
        }
        Ok(deserialized) => {
            let total_size = deserialized.header_size + deserialized.packet.payload_size;
            if total_size > max_packet_size {
                on_ws_error(client, Status::from_error(WsError::PacketTooLarge));
                return data.len();
            }

            if total_size > data.len() {
                client.inner.borrow_mut().pending_packet = Some(PendingPacket {
                    packet: deserialized.packet,
                    header_size: deserialized.header_size,
                    total_size,
                });
                0
            } else {
                let payload = &data[deserialized.header_size..total_size];
                if !handle_websocket_packet(client, &deserialized.packet, payload) {
                    return data.len();
                }
                total_size
            }
        }
    }
}

fn handle_connector_data(client: &WebSocketClient, data: &[u8]) -> (usize, bool) {
    let allow_override = client.inner.borrow().config.allow_mask_override;
    let outcome = {
        let state = client.inner.borrow();
        let Some(connector) = &state.connector else { return (0, false) };
        connector.on_data_received(data, allow_override)
    };

    match outcome {
        ConnectorOutcome::NeedMoreData => (0, false),
        ConnectorOutcome::Failed { consumed, error } => {
            on_ws_error(client, Status::from_error(error));
            (data.len().max(consumed), false)
        }
        ConnectorOutcome::Finished { consumed, masking } => {
            let timer = client.inner.borrow_mut().connector.as_mut().and_then(|c| c.timer.take());
            if let Some(timer) = timer {
                client.inner.borrow().reactor.unregister_timer(timer);
            }
            on_connector_succeeded(client, masking);
            (consumed, true)
        }
    }
}

fn on_data_received(client: &WebSocketClient, mut data: &[u8]) -> usize {
    let mut total_consumed = 0;

    if client.inner.borrow().connector.is_some() {
        let (consumed, established) = handle_connector_data(client, data);
        if established {
            total_consumed += consumed;
            data = &data[consumed..];
        } else {
            return consumed;
        }
    }

    while !data.is_empty() {
        let consumed = handle_websocket_data(client, data);
        if consumed == 0 {
            break;
        }
        total_consumed += consumed;
        data = &data[consumed..];
    }

    total_consumed
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) <= 1 {
            self.shutdown();
        }
    }
}
