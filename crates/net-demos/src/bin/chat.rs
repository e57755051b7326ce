//! Line-oriented TCP chat server: every line a client sends is broadcast to
//! every other connected client.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use net_core::{Reactor, RunOutcome, RunParams, TcpConnection, TcpListener};
use net_demos::{init_logging, DemoConfig, ShutdownFlag};

#[derive(Parser, Debug)]
#[command(author, version, about = "Line-broadcast TCP chat server")]
struct Args {
    #[arg(long)]
    bind: Option<SocketAddr>,

    #[arg(long, default_value = "net-demos.toml")]
    config: String,
}

#[derive(Default)]
struct Room {
    clients: Vec<TcpConnection>,
}

impl Room {
    fn broadcast(&mut self, from: &TcpConnection, line: &[u8]) {
        self.clients.retain(|c| c.is_connected());
        for client in &self.clients {
            if client.peer_addr() == from.peer_addr() {
                continue;
            }
            client.send_data(line);
        }
    }
}

fn main() {
    let args = Args::parse();
    let config = DemoConfig::load(&args.config);
    init_logging(config.verbose);

    let bind_addr: SocketAddr = args
        .bind
        .or_else(|| config.bind_addr.parse().ok())
        .expect("a valid --bind address or config bind_addr");

    let reactor = Reactor::new().expect("failed to create reactor");
    let listener = TcpListener::bind(&reactor, vec![bind_addr], config.reuse_port, Default::default());
    let room = Rc::new(RefCell::new(Room::default()));

    listener.on_listening(Box::new(move || {
        tracing::info!(%bind_addr, "chat: listening");
    }));
    listener.on_error(Box::new(|status| {
        tracing::error!(?status, "chat: listen failed");
    }));

    let accept_room = room.clone();
    listener.on_accept(Box::new(move |result| on_accept(&accept_room, result)));

    let shutdown = ShutdownFlag::install();
    run_until_shutdown(&reactor, &shutdown);
}

fn on_accept(room: &Rc<RefCell<Room>>, result: Result<TcpConnection, net_core::SystemError>) {
    let Ok(conn) = result else {
        tracing::warn!("chat: accept failed");
        return;
    };
    let peer = conn.peer_addr();
    tracing::info!(?peer, "chat: client joined");
    room.borrow_mut().clients.push(conn.clone());

    let data_room = room.clone();
    let data_conn = conn.clone();
    conn.on_data_received(Box::new(move |data| {
        data_room.borrow_mut().broadcast(&data_conn, data);
        data.len()
    }));

    let closed_room = room.clone();
    conn.on_closed(Box::new(move |status| {
        tracing::info!(?peer, ?status, "chat: client left");
        closed_room.borrow_mut().clients.retain(|c| c.is_connected());
    }));
}

fn run_until_shutdown(reactor: &Reactor, shutdown: &ShutdownFlag) {
    let params = RunParams { timeout: Some(Duration::from_millis(200)), stop_when_no_work: false };
    loop {
        if shutdown.is_set() {
            tracing::info!("chat: shutting down");
            return;
        }
        if reactor.run(params) == RunOutcome::Failed {
            tracing::error!("chat: reactor poll failed");
            return;
        }
    }
}
