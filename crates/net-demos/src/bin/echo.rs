//! Minimal TCP echo server: every byte received on a connection is written
//! back to that same connection.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use net_core::{Reactor, RunOutcome, RunParams, TcpConnection, TcpListener};
use net_demos::{init_logging, DemoConfig, ShutdownFlag};

#[derive(Parser, Debug)]
#[command(author, version, about = "TCP echo server")]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:9000
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Path to an optional net-demos.toml config file.
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
    let listener = TcpListener::bind(&reactor, vec![bind_addr], config.reuse_port, Default::default());

    listener.on_listening(Box::new(move || {
        tracing::info!(%bind_addr, "echo: listening");
    }));
    listener.on_error(Box::new(|status| {
        tracing::error!(?status, "echo: listen failed");
    }));
    listener.on_accept(Box::new(on_accept));

    let shutdown = ShutdownFlag::install();
    run_until_shutdown(&reactor, &shutdown);
}

fn on_accept(result: Result<TcpConnection, net_core::SystemError>) {
    let Ok(conn) = result else {
        tracing::warn!("echo: accept failed");
        return;
    };
    let peer = conn.peer_addr();
    tracing::info!(?peer, "echo: client connected");

    let echo_conn = conn.clone();
    conn.on_data_received(Box::new(move |data| {
        echo_conn.send_data(data);
        data.len()
    }));
    conn.on_closed(Box::new(move |status| {
        tracing::info!(?peer, ?status, "echo: client disconnected");
    }));
}

fn run_until_shutdown(reactor: &Reactor, shutdown: &ShutdownFlag) {
    let params = RunParams { timeout: Some(Duration::from_millis(200)), stop_when_no_work: false };
    loop {
        if shutdown.is_set() {
            tracing::info!("echo: shutting down");
            return;
        }
        if reactor.run(params) == RunOutcome::Failed {
            tracing::error!("echo: reactor poll failed");
            return;
        }
    }
}
