//! End-to-end TCP round trip: one reactor drives both a listener and a
//! connecting client, bounces a payload off a hand-rolled echo callback, and
//! checks both sides observe a clean disconnect.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use net_core::{ConnectionLimits, Reactor, RunParams, TcpConnection, TcpListener};

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
fn echo_round_trip_and_clean_disconnect() {
    let reactor = Reactor::new().expect("reactor");

    let listener = TcpListener::bind(&reactor, vec![loopback(0)], false, ConnectionLimits::default());
    pump(&reactor, Duration::from_secs(1), || listener.local_addr().is_some());
    let bound_addr = listener.local_addr().expect("listener should have bound");

    let server_received = Rc::new(RefCell::new(Vec::new()));
    listener.on_accept({
        let server_received = server_received.clone();
        Box::new(move |result| {
            let conn = result.expect("accept should succeed");
            let echo_conn = conn.clone();
            conn.on_data_received(Box::new(move |data| {
                echo_conn.send_data(data);
                data.len()
            }));
            let received = server_received.clone();
            conn.on_closed(Box::new(move |_status| {
                received.borrow_mut().push(true);
            }));
        })
    });

    let client = TcpConnection::connect(&reactor, vec![bound_addr], ConnectionLimits::default());
    let connected = Rc::new(RefCell::new(false));
    client.on_connected({
        let connected = connected.clone();
        Box::new(move |status| *connected.borrow_mut() = status.is_ok())
    });

    let client_echo = Rc::new(RefCell::new(Vec::new()));
    client.on_data_received({
        let client_echo = client_echo.clone();
        Box::new(move |data| {
            client_echo.borrow_mut().extend_from_slice(data);
            data.len()
        })
    });

    pump(&reactor, Duration::from_secs(1), || *connected.borrow());
    assert!(*connected.borrow(), "client should have connected");

    assert!(client.send_data(b"hello, reactor"));
    pump(&reactor, Duration::from_secs(1), || client_echo.borrow().as_slice() == b"hello, reactor");
    assert_eq!(client_echo.borrow().as_slice(), b"hello, reactor");

    client.shutdown();
    pump(&reactor, Duration::from_secs(1), || !server_received.borrow().is_empty());
    assert_eq!(server_received.borrow().len(), 1);
}

#[test]
fn connect_sweep_skips_refused_addresses() {
    let reactor = Reactor::new().expect("reactor");

    // Two addresses nothing is listening on, bound just long enough to learn
    // free ports, then closed so the connect attempts are refused quickly.
    let probe_a = std::net::TcpListener::bind(loopback(0)).expect("probe bind");
    let probe_b = std::net::TcpListener::bind(loopback(0)).expect("probe bind");
    let refused_a = probe_a.local_addr().unwrap();
    let refused_b = probe_b.local_addr().unwrap();
    drop(probe_a);
    drop(probe_b);

    let listener = TcpListener::bind(&reactor, vec![loopback(0)], false, ConnectionLimits::default());
    pump(&reactor, Duration::from_secs(1), || listener.local_addr().is_some());
    let good_addr = listener.local_addr().unwrap();

    let accepted = Rc::new(RefCell::new(false));
    listener.on_accept({
        let accepted = accepted.clone();
        Box::new(move |result| *accepted.borrow_mut() = result.is_ok())
    });

    let client = TcpConnection::connect(
        &reactor,
        vec![refused_a, refused_b, good_addr],
        ConnectionLimits::default(),
    );
    let connected = Rc::new(RefCell::new(false));
    client.on_connected({
        let connected = connected.clone();
        Box::new(move |status| *connected.borrow_mut() = status.is_ok())
    });

    pump(&reactor, Duration::from_secs(2), || *connected.borrow());
    assert!(*connected.borrow(), "sweep should land on the third, listening address");
    pump(&reactor, Duration::from_secs(1), || *accepted.borrow());
    assert!(*accepted.borrow());
}
