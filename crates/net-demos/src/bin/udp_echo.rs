//! UDP echo server: every datagram received is sent straight back to its
//! sender.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use net_core::{Reactor, RunOutcome, RunParams, UdpSocketHandle};
use net_demos::{init_logging, DemoConfig, ShutdownFlag};

#[derive(Parser, Debug)]
#[command(author, version, about = "UDP echo server")]
struct Args {
    #[arg(long)]
    bind: Option<SocketAddr>,

    #[arg(long, default_value = "net-demos.toml")]
    config: String,
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
    let socket = UdpSocketHandle::bind(
        &reactor,
        vec![bind_addr],
        config.reuse_port,
        false,
        Default::default(),
    );

    socket.on_bound(Box::new(move || {
        tracing::info!(%bind_addr, "udp_echo: bound");
    }));
    socket.on_error(Box::new(|status| {
        tracing::error!(?status, "udp_echo: bind failed");
    }));

    let echo_socket = socket.clone();
    socket.on_data_received(Box::new(move |from, data| {
        echo_socket.send_data(from, data);
    }));
    socket.on_send_error(Box::new(|status| {
        tracing::warn!(?status, "udp_echo: send failed");
    }));

    let shutdown = ShutdownFlag::install();
    run_until_shutdown(&reactor, &shutdown);
}

fn run_until_shutdown(reactor: &Reactor, shutdown: &ShutdownFlag) {
    let params = RunParams { timeout: Some(Duration::from_millis(200)), stop_when_no_work: false };
    loop {
        if shutdown.is_set() {
            tracing::info!("udp_echo: shutting down");
            return;
        }
        if reactor.run(params) == RunOutcome::Failed {
            tracing::error!("udp_echo: reactor poll failed");
            return;
        }
    }
}
