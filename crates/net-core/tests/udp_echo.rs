//! UDP round trip and send-queue cap enforcement, driven by one reactor
//! hosting both ends of the exchange.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use net_core::{Reactor, RunParams, UdpLimits, UdpSocketHandle};

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
fn datagram_round_trip() {
    let reactor = Reactor::new().expect("reactor");

    let server = UdpSocketHandle::bind(&reactor, vec![loopback(0)], false, false, UdpLimits::default());
    pump(&reactor, Duration::from_secs(1), || server.local_addr().is_some());
    let server_addr = server.local_addr().unwrap();

    let echo_server = server.clone();
    server.on_data_received(Box::new(move |from, data| {
        echo_server.send_data(from, data);
    }));

    let client = UdpSocketHandle::bind(&reactor, vec![loopback(0)], false, false, UdpLimits::default());
    pump(&reactor, Duration::from_secs(1), || client.local_addr().is_some());

    let client_received = Rc::new(RefCell::new(Vec::new()));
    client.on_data_received({
        let client_received = client_received.clone();
        Box::new(move |_from, data| client_received.borrow_mut().extend_from_slice(data))
    });

    assert!(client.send_data(server_addr, b"ping"));
    pump(&reactor, Duration::from_secs(1), || client_received.borrow().as_slice() == b"ping");
    assert_eq!(client_received.borrow().as_slice(), b"ping");
}

#[test]
fn send_queue_enforces_entry_cap() {
    let reactor = Reactor::new().expect("reactor");
    let limits = UdpLimits { send_buffer_max_size: 64 * 1024 * 1024, max_queued_datagrams: 4 };

    // The socket is still `Binding` until the reactor runs the posted bind,
    // so entries queued right after `bind()` sit untouched -- exactly the
    // window this test needs to see the cap before anything is drained.
    let destination = loopback(1);
    let socket = UdpSocketHandle::bind(&reactor, vec![loopback(0)], false, false, limits);

    for _ in 0..4 {
        assert!(socket.send_data(destination, b"x"));
    }
    assert!(!socket.send_data(destination, b"one too many"));
}
