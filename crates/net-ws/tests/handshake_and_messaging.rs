//! End-to-end WebSocket tests: one reactor hosts both a [`WebSocketServer`]
//! and a connecting [`WebSocketClient`], driving the real HTTP/1.1 Upgrade
//! handshake and frame codec over loopback sockets.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use net_core::{ConnectionLimits, Reactor, RunParams, TcpConnection};
use net_ws::frame::{self, Packet, PacketType};
use net_ws::{WebSocketClient, WebSocketServer, WsConfig, WsError};

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn pump(reactor: &Reactor, for_how_long: Duration, mut until: impl FnMut() -> bool) {
    let deadline = Instant::now() + for_how_long;
    while Instant::now() < deadline {
        if until() {
            return;
        }
        reactor.run(RunParams { timeout: Some(Duration::from_millis(5)), stop_when_no_work: false });
    }
}

#[test]
fn handshake_completes_and_exchanges_text_messages() {
    let reactor = Reactor::new().expect("reactor");

    let server = WebSocketServer::bind(&reactor, vec![loopback(0)], false, WsConfig::default());
    pump(&reactor, Duration::from_secs(1), || server.local_addr().is_some());
    let server_addr = server.local_addr().unwrap();

    let accepted_client: Rc<RefCell<Option<WebSocketClient>>> = Rc::new(RefCell::new(None));
    let server_received = Rc::new(RefCell::new(String::new()));
    {
        let accepted_client = accepted_client.clone();
        let server_received = server_received.clone();
        server.on_client_connected(Box::new(move |_uri, client| {
            let echo_received = server_received.clone();
            let echo_client = client.clone();
            client.on_text_message_received(Box::new(move |text| {
                *echo_received.borrow_mut() = text.to_string();
                echo_client.send_text_message(text, true);
            }));
            *accepted_client.borrow_mut() = Some(client);
        }));
    }

    let client = WebSocketClient::connect(&reactor, vec![server_addr], "/chat", WsConfig::default());
    let client_connected = Rc::new(RefCell::new(false));
    {
        let client_connected = client_connected.clone();
        client.on_connected(Box::new(move |status| {
            *client_connected.borrow_mut() = status.error.is_ok();
        }));
    }

    let client_echo = Rc::new(RefCell::new(String::new()));
    {
        let client_echo = client_echo.clone();
        client.on_text_message_received(Box::new(move |text| {
            *client_echo.borrow_mut() = text.to_string();
        }));
    }

    pump(&reactor, Duration::from_secs(2), || *client_connected.borrow());
    assert!(*client_connected.borrow(), "client handshake should complete");

    assert!(client.send_text_message("hello server", true));
    pump(&reactor, Duration::from_secs(2), || !server_received.borrow().is_empty());
    assert_eq!(server_received.borrow().as_str(), "hello server");

    pump(&reactor, Duration::from_secs(2), || !client_echo.borrow().is_empty());
    assert_eq!(client_echo.borrow().as_str(), "hello server");
}

#[test]
fn rejected_handshake_surfaces_upgrade_rejected() {
    let reactor = Reactor::new().expect("reactor");

    let server = WebSocketServer::bind(&reactor, vec![loopback(0)], false, WsConfig::default());
    pump(&reactor, Duration::from_secs(1), || server.local_addr().is_some());
    let server_addr = server.local_addr().unwrap();

    // No `on_client_connected` callback is registered, so the server has
    // nothing to upgrade into and rejects every handshake with HTTP 401.
    server.on_connection_request(Box::new(|_uri, _peer| true));

    let client = WebSocketClient::connect(&reactor, vec![server_addr], "/", WsConfig::default());
    let closed_status = Rc::new(RefCell::new(None));
    {
        let closed_status = closed_status.clone();
        client.on_closed(Box::new(move |status| {
            *closed_status.borrow_mut() = Some(status.error);
        }));
    }

    pump(&reactor, Duration::from_secs(2), || closed_status.borrow().is_some());
    assert_eq!(*closed_status.borrow(), Some(WsError::WebSocketUpgradeRejected));
}

/// Masks `payload` with `key` and appends the framed bytes to `out`.
fn push_frame(out: &mut Vec<u8>, packet_type: PacketType, fin: bool, key: [u8; 4], payload: &[u8]) {
    let mut payload = payload.to_vec();
    let packet = Packet { packet_type, fin, payload_size: payload.len(), masking_key: Some(key) };
    frame::serialize(&packet, &mut payload, out);
}

/// `WebSocketClient::send_text_message` always finishes a message in a
/// single frame (`WebSocketClient` has no fragmented-send API), so the only
/// way to drive the server's reassembly path with a genuinely fragmented
/// message is to speak the wire protocol by hand: a raw `TcpConnection`
/// does the HTTP/1.1 Upgrade itself and then writes three hand-framed
/// packets -- Text/fin=0, Continuation/fin=0, Continuation/fin=1.
#[test]
fn fragmented_text_message_reassembles_into_one_callback() {
    let reactor = Reactor::new().expect("reactor");

    let server = WebSocketServer::bind(&reactor, vec![loopback(0)], false, WsConfig::default());
    pump(&reactor, Duration::from_secs(1), || server.local_addr().is_some());
    let server_addr = server.local_addr().unwrap();

    let accepted_client: Rc<RefCell<Option<WebSocketClient>>> = Rc::new(RefCell::new(None));
    {
        let accepted_client = accepted_client.clone();
        server.on_client_connected(Box::new(move |_uri, client| {
            *accepted_client.borrow_mut() = Some(client);
        }));
    }

    let raw_client = TcpConnection::connect(&reactor, vec![server_addr], ConnectionLimits::default());
    let handshake_sent = Rc::new(RefCell::new(false));
    {
        let handshake_sent = handshake_sent.clone();
        let raw_client = raw_client.clone();
        raw_client.on_connected(Box::new(move |status| {
            assert!(matches!(status, net_core::SystemError::None), "connect should succeed, got {status:?}");
            let request = "GET / HTTP/1.1\r\n\
                 Upgrade: websocket\r\n\
                 Connection: upgrade\r\n\
                 Sec-WebSocket-Version: 13\r\n\
                 Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                 \r\n";
            raw_client.send_data(request.as_bytes());
            *handshake_sent.borrow_mut() = true;
        }));
    }

    let handshake_complete = Rc::new(RefCell::new(false));
    {
        let handshake_complete = handshake_complete.clone();
        let raw_client = raw_client.clone();
        raw_client.on_data_received(Box::new(move |data| {
            if *handshake_complete.borrow() {
                // Frame traffic after the handshake is not relevant here.
                return data.len();
            }
            let Ok(text) = std::str::from_utf8(data) else { return 0 };
            let Some(header_end) = text.find("\r\n\r\n") else { return 0 };
            assert!(text.starts_with("HTTP/1.1 101"), "unexpected handshake response: {text}");
            *handshake_complete.borrow_mut() = true;
            header_end + 4
        }));
    }

    pump(&reactor, Duration::from_secs(1), || *handshake_sent.borrow());
    pump(&reactor, Duration::from_secs(2), || *handshake_complete.borrow());
    assert!(*handshake_complete.borrow(), "raw client should have completed the Upgrade handshake");

    pump(&reactor, Duration::from_secs(1), || accepted_client.borrow().is_some());
    let server_side = accepted_client.borrow().clone().expect("server should have accepted the client");

    let received = Rc::new(RefCell::new(String::new()));
    {
        let received = received.clone();
        server_side.on_text_message_received(Box::new(move |text| {
            received.borrow_mut().push_str(text);
        }));
    }

    let mut fragments = Vec::new();
    push_frame(&mut fragments, PacketType::Text, false, [0x11, 0x22, 0x33, 0x44], b"one-");
    push_frame(&mut fragments, PacketType::Continuation, false, [0x55, 0x66, 0x77, 0x88], b"two-");
    push_frame(&mut fragments, PacketType::Continuation, true, [0x99, 0xaa, 0xbb, 0xcc], b"three");
    assert!(raw_client.send_data(&fragments));

    pump(&reactor, Duration::from_secs(2), || received.borrow().as_str() == "one-two-three");
    assert_eq!(received.borrow().as_str(), "one-two-three");
}
