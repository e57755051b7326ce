//! The server side: a listening [`WebSocketServer`] and the per-connection
//! accepting handshake it spawns for each inbound TCP connection.
//!
//! Grounded on `WebSocketServerImpl.cpp` (the listener wrapper) and
//! `WebSocketAcceptingClientImpl.cpp` (the accepting handshake driver). A
//! successful accepting handshake hands the connection off into
//! [`WebSocketClient::from_established`] exactly like the source moves its
//! `TcpConnection` into a fresh `WebSocketClient`.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use net_core::{ConnectionLimits, Reactor, SystemError, TcpConnection, TcpListener, TimerId};

use crate::config::{MaskingSettings, WsConfig};
use crate::error::{Status, WsError};
use crate::handshake;
use crate::http::{self, Request};
use crate::session::WebSocketClient;

pub type OnListening = Box<dyn FnMut()>;
pub type OnError = Box<dyn FnMut(Status)>;
/// Return `false` to reject the connection before any response is sent.
pub type OnConnectionRequest = Box<dyn FnMut(&str, SocketAddr) -> bool>;
pub type OnClientConnected = Box<dyn FnMut(&str, WebSocketClient)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Waiting,
    Listening,
    Error,
    Shutdown,
}

#[derive(Default)]
struct Callbacks {
    on_listening: Option<OnListening>,
    on_error: Option<OnError>,
    on_connection_request: Option<OnConnectionRequest>,
    on_client_connected: Option<OnClientConnected>,
}

struct ServerState {
    listener: TcpListener,
    config: WsConfig,
    state: State,
    callbacks: Callbacks,
}

/// Public handle to a listening WebSocket server.
///
/// Cloning shares the same underlying state; the last clone's `Drop` shuts
/// the listener down.
#[derive(Clone)]
pub struct WebSocketServer {
    inner: Rc<RefCell<ServerState>>,
}

impl WebSocketServer {
    pub fn bind(reactor: &Reactor, addrs: Vec<SocketAddr>, reuse_port: bool, config: WsConfig) -> Self {
        let listener = TcpListener::bind(reactor, addrs, reuse_port, ConnectionLimits::default());
        Self::from_listener(reactor, listener, config)
    }

    /// Same as [`WebSocketServer::bind`], resolving `host:port` first.
    pub fn bind_host(
        reactor: &Reactor,
        host: impl Into<String>,
        port: u16,
        reuse_port: bool,
        config: WsConfig,
    ) -> Self {
        let listener =
            TcpListener::bind_host(reactor, host, port, reuse_port, ConnectionLimits::default());
        Self::from_listener(reactor, listener, config)
    }

    fn from_listener(reactor: &Reactor, listener: TcpListener, config: WsConfig) -> Self {
        let state = ServerState { listener, config, state: State::Waiting, callbacks: Callbacks::default() };
        let server = Self { inner: Rc::new(RefCell::new(state)) };

        let on_listening_server = server.clone();
        server.inner.borrow().listener.on_listening(Box::new(move || {
            on_server_listening(&on_listening_server);
        }));

        let on_error_server = server.clone();
        server.inner.borrow().listener.on_error(Box::new(move |status| {
            on_listener_error(&on_error_server, status);
        }));

        let on_accept_reactor = reactor.clone();
        let on_accept_server = server.clone();
        server.inner.borrow().listener.on_accept(Box::new(move |result| {
            on_listener_accept(&on_accept_reactor, &on_accept_server, result);
        }));

        server
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().listener.local_addr()
    }

    pub fn on_listening(&self, cb: OnListening) {
        self.inner.borrow_mut().callbacks.on_listening = Some(cb);
    }

    pub fn on_error(&self, cb: OnError) {
        self.inner.borrow_mut().callbacks.on_error = Some(cb);
    }

    /// Invoked with the handshake's request URI and peer address before any
    /// response is sent; return `false` to reject with HTTP 401.
    pub fn on_connection_request(&self, cb: OnConnectionRequest) {
        self.inner.borrow_mut().callbacks.on_connection_request = Some(cb);
    }

    /// Invoked once a connection has completed the opening handshake. No
    /// further callback of this server's fires for that connection.
    pub fn on_client_connected(&self, cb: OnClientConnected) {
        self.inner.borrow_mut().callbacks.on_client_connected = Some(cb);
    }

    pub fn shutdown(&self) {
        let mut state = self.inner.borrow_mut();
        if state.state == State::Shutdown {
            return;
        }
        state.state = State::Shutdown;
        state.listener.shutdown();
        state.callbacks = Callbacks::default();
    }
}

fn on_server_listening(server: &WebSocketServer) {
    let mut state = server.inner.borrow_mut();
    state.state = State::Listening;
    if let Some(cb) = &mut state.callbacks.on_listening {
        cb();
    }
}

fn on_listener_error(server: &WebSocketServer, status: SystemError) {
    let mut state = server.inner.borrow_mut();
    if state.state != State::Waiting && state.state != State::Listening {
        return;
    }
    state.state = State::Error;
    let ws_status = Status::from_net(status.kind());
    if let Some(cb) = &mut state.callbacks.on_error {
        cb(ws_status);
    } else {
        tracing::error!(error = ?ws_status.error, "websocket server: listen error");
    }
    drop(state);
    server.shutdown();
}

fn on_listener_accept(reactor: &Reactor, server: &WebSocketServer, result: Result<TcpConnection, SystemError>) {
    let Ok(connection) = result else { return };
    if server.inner.borrow().callbacks.on_client_connected.is_none() {
        connection.shutdown();
        return;
    }
    AcceptingClient::spawn(reactor, &server.inner, connection);
}

/// Per-connection accepting handshake driver.
///
/// Lives only until it either succeeds (handing the connection to
/// `WebSocketClient::from_established`) or fails (shutting the connection
/// down); it holds a weak reference back to the server so a server shutdown
/// mid-handshake does not keep the connection alive.
struct AcceptingState {
    connection: TcpConnection,
    server: Weak<RefCell<ServerState>>,
    config: WsConfig,
    timer: Option<TimerId>,
}

struct AcceptingClient {
    inner: Rc<RefCell<AcceptingState>>,
}

impl AcceptingClient {
    fn spawn(reactor: &Reactor, server: &Rc<RefCell<ServerState>>, connection: TcpConnection) {
        let config = server.borrow().config;
        let state = AcceptingState {
            connection,
            server: Rc::downgrade(server),
            config,
            timer: None,
        };
        let client = Self { inner: Rc::new(RefCell::new(state)) };

        let timer_client = client.clone();
        let timer = reactor.register_timer(
            config.handshake_timeout,
            Box::new(move |_reactor| on_handshake_timeout(&timer_client)),
        );
        client.inner.borrow_mut().timer = Some(timer);

        let data_client = client.clone();
        let closed_client = client.clone();
        let conn = client.inner.borrow().connection.clone();
        conn.on_data_received(Box::new(move |data| on_data_received(&data_client, data)));
        conn.on_closed(Box::new(move |status| on_tcp_closed(&closed_client, status)));
    }
}

impl Clone for AcceptingClient {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

fn on_handshake_timeout(client: &AcceptingClient) {
    tracing::warn!("accepting websocket client: handshake timed out");
    client.inner.borrow_mut().timer = None;
    client.inner.borrow().connection.shutdown();
}

fn on_tcp_closed(client: &AcceptingClient, status: SystemError) {
    if !status.is_ok() {
        tracing::warn!(?status, "accepting websocket client: disconnected before handshake completed");
    }
    cancel_timer(client);
}

fn cancel_timer(client: &AcceptingClient) {
    let timer = client.inner.borrow_mut().timer.take();
    if let Some(timer) = timer {
        let reactor = client.inner.borrow().connection.reactor();
        reactor.unregister_timer(timer);
    }
}

fn on_data_received(client: &AcceptingClient, data: &[u8]) -> usize {
    let parsed = match http::parse_request(data) {
        Ok(parsed) => parsed,
        Err(http::ParseError::NotEnoughData) => return 0,
        Err(_) => {
            tracing::warn!("accepting websocket client: failed to parse http request");
            client.inner.borrow().connection.shutdown();
            return data.len();
        }
    };

    cancel_timer(client);

    if parsed.consumed != data.len() {
        tracing::warn!("accepting websocket client: received more data than expected");
        client.inner.borrow().connection.shutdown();
        return data.len();
    }

    if handle_handshake_request(client, &parsed.value) {
        parsed.consumed
    } else {
        data.len()
    }
}

fn reject(connection: &TcpConnection, request: &Request, status: u32) {
    let response = handshake::server::respond_error_to_http_request(request, status);
    let serialized = http::serialize_response(&response);
    connection.send_data(serialized.as_bytes());
    connection.shutdown();
}

fn handle_handshake_request(client: &AcceptingClient, request: &Request) -> bool {
    let connection = client.inner.borrow().connection.clone();

    if handshake::server::validate_http_request(request).is_err() {
        tracing::warn!("accepting websocket client: received invalid http request");
        reject(&connection, request, 401);
        return false;
    }

    let mut masking = MaskingSettings::server_default();
    let has_override = client.inner.borrow().config.allow_mask_override
        && handshake::contains_mask_override(&request.headers);
    if has_override {
        masking = MaskingSettings::none();
    }

    let Some(server) = client.inner.borrow().server.upgrade() else {
        reject(&connection, request, 401);
        return false;
    };

    let accepted = {
        let mut state = server.borrow_mut();
        match &mut state.callbacks.on_connection_request {
            Some(cb) => cb(&request.uri, connection.peer_addr().unwrap_or_else(unspecified_addr)),
            None => true,
        }
    };
    if !accepted {
        reject(&connection, request, 401);
        return false;
    }

    let can_accept = {
        let state = server.borrow();
        state.state == State::Listening && state.callbacks.on_client_connected.is_some()
    };
    if !can_accept {
        reject(&connection, request, 401);
        return false;
    }

    let mut response = handshake::server::respond_to_http_request(request);
    if has_override {
        handshake::inject_mask_override(&mut response.headers);
    }
    let serialized = http::serialize_response(&response);
    if !connection.send_data(serialized.as_bytes()) {
        return false;
    }

    let config = client.inner.borrow().config;
    let reactor = connection.reactor();
    let ws_client = WebSocketClient::from_established(&reactor, connection.clone(), masking, config);

    let uri = request.uri.clone();
    let mut state = server.borrow_mut();
    if let Some(cb) = &mut state.callbacks.on_client_connected {
        cb(&uri, ws_client);
    }

    true
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}
