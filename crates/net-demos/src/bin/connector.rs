//! WebSocket client: connects to a server, sends one text message, prints
//! whatever comes back, and exits on disconnect.

use std::time::Duration;

use clap::Parser;
use net_core::{Reactor, RunOutcome, RunParams};
use net_demos::{init_logging, DemoConfig, ShutdownFlag};
use net_ws::{WsConfig, WebSocketClient};

#[derive(Parser, Debug)]
#[command(author, version, about = "WebSocket client demo")]
struct Args {
    /// Server host, e.g. 127.0.0.1
    #[arg(long)]
    host: String,

    #[arg(long)]
    port: u16,

    /// Request URI sent in the handshake.
    #[arg(long, default_value = "/")]
    uri: String,

    /// Text message sent once the handshake completes.
    #[arg(long, default_value = "hello")]
    message: String,

    #[arg(long, default_value = "net-demos.toml")]
    config: String,
}

fn main() {
    let args = Args::parse();
    let config = DemoConfig::load(&args.config);
    init_logging(config.verbose);

    let reactor = Reactor::new().expect("failed to create reactor");
    let client = WebSocketClient::connect_host(&reactor, args.host.clone(), args.port, args.uri, WsConfig::default());

    let shutdown = ShutdownFlag::install();

    let message = args.message.clone();
    let sending_client = client.clone();
    client.on_connected(Box::new(move |status| {
        if status.error.is_ok() {
            tracing::info!("connector: handshake complete");
            sending_client.send_text_message(&message, true);
        } else {
            tracing::warn!(?status, "connector: handshake failed");
        }
    }));

    client.on_text_message_received(Box::new(move |text| {
        println!("{text}");
    }));

    client.on_binary_message_received(Box::new(move |data| {
        tracing::info!(bytes = data.len(), "connector: received binary message");
    }));

    let closed_done = shutdown.clone();
    client.on_closed(Box::new(move |status| {
        tracing::info!(?status, "connector: connection closed");
        closed_done.force_set();
    }));

    run_until_shutdown(&reactor, &shutdown);
}

fn run_until_shutdown(reactor: &Reactor, shutdown: &ShutdownFlag) {
    let params = RunParams { timeout: Some(Duration::from_millis(200)), stop_when_no_work: false };
    loop {
        if shutdown.is_set() {
            tracing::info!("connector: shutting down");
            return;
        }
        if reactor.run(params) == RunOutcome::Failed {
            tracing::error!("connector: reactor poll failed");
            return;
        }
    }
}
