//! TCP proxy: forwards each accepted connection to a single upstream
//! address, relaying bytes in both directions.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use net_core::{Reactor, RunOutcome, RunParams, TcpConnection, TcpListener};
use net_demos::{init_logging, DemoConfig, ShutdownFlag};

#[derive(Parser, Debug)]
#[command(author, version, about = "TCP forwarding proxy")]
struct Args {
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Address every accepted connection is forwarded to.
    #[arg(long)]
    upstream: SocketAddr,

    #[arg(long, default_value = "net-demos.toml")]
    config: String,
}

/// Bytes received from `downstream` before `upstream` finished connecting
/// are held here and flushed once it comes up.
struct PendingLeg {
    downstream: TcpConnection,
    upstream: TcpConnection,
    queued: RefCell<Vec<u8>>,
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

    listener.on_listening(Box::new(move || {
        tracing::info!(%bind_addr, "proxy: listening");
    }));
    listener.on_error(Box::new(|status| {
        tracing::error!(?status, "proxy: listen failed");
    }));

    let upstream_addr = args.upstream;
    let accept_reactor = reactor.clone();
    listener.on_accept(Box::new(move |result| on_accept(&accept_reactor, upstream_addr, result)));

    let shutdown = ShutdownFlag::install();
    run_until_shutdown(&reactor, &shutdown);
}

fn on_accept(reactor: &Reactor, upstream_addr: SocketAddr, result: Result<TcpConnection, net_core::SystemError>) {
    let Ok(downstream) = result else {
        tracing::warn!("proxy: accept failed");
        return;
    };
    tracing::info!(peer = ?downstream.peer_addr(), "proxy: accepted downstream connection");

    let upstream = TcpConnection::connect(reactor, vec![upstream_addr], Default::default());
    let leg = Rc::new(PendingLeg {
        downstream: downstream.clone(),
        upstream: upstream.clone(),
        queued: RefCell::new(Vec::new()),
    });

    let connected_leg = leg.clone();
    upstream.on_connected(Box::new(move |status| {
        if !status.is_ok() {
            tracing::warn!(?status, "proxy: upstream connect failed");
            connected_leg.downstream.shutdown();
            return;
        }
        let queued = connected_leg.queued.take();
        if !queued.is_empty() {
            connected_leg.upstream.send_data(&queued);
        }
    }));

    let down_to_up = leg.clone();
    downstream.on_data_received(Box::new(move |data| {
        if down_to_up.upstream.is_connected() {
            down_to_up.upstream.send_data(data);
        } else {
            down_to_up.queued.borrow_mut().extend_from_slice(data);
        }
        data.len()
    }));

    let up_to_down = leg.clone();
    upstream.on_data_received(Box::new(move |data| {
        up_to_down.downstream.send_data(data);
        data.len()
    }));

    let downstream_closed = leg.clone();
    downstream.on_closed(Box::new(move |status| {
        tracing::info!(?status, "proxy: downstream closed");
        downstream_closed.upstream.shutdown();
    }));

    let upstream_closed = leg;
    upstream.on_closed(Box::new(move |status| {
        tracing::info!(?status, "proxy: upstream closed");
        upstream_closed.downstream.shutdown();
    }));
}

fn run_until_shutdown(reactor: &Reactor, shutdown: &ShutdownFlag) {
    let params = RunParams { timeout: Some(Duration::from_millis(200)), stop_when_no_work: false };
    loop {
        if shutdown.is_set() {
            tracing::info!("proxy: shutting down");
            return;
        }
        if reactor.run(params) == RunOutcome::Failed {
            tracing::error!("proxy: reactor poll failed");
            return;
        }
    }
}
