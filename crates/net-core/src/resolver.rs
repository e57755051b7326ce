use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::Waker;

use crate::reactor::Reactor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    Ok,
    Failed,
}

pub type ResolveCallback = Box<dyn FnOnce(&Reactor, ResolveStatus, Vec<SocketAddr>)>;

struct ResolveRequest {
    id: u64,
    host: String,
    port: u16,
}

struct ResolveResponse {
    id: u64,
    status: ResolveStatus,
    addrs: Vec<SocketAddr>,
}

/// Asynchronous hostname resolution.
///
/// One dedicated worker thread blocks on a request queue and performs the
/// blocking `getaddrinfo` call (`ToSocketAddrs::to_socket_addrs`) so the
/// reactor thread never stalls on DNS. Each finished lookup wakes the poller
/// through the same `mio::Waker` used for cross-thread posts; the reactor
/// then drains the response channel on its own thread and invokes the
/// caller's callback there, so user code never has to worry about which
/// thread `cb` runs on.
///
/// Closing the request channel (on `Drop`) is enough to make the worker's
/// blocking `recv` return an error and exit -- no separate "please stop"
/// message is needed.
pub struct Resolver {
    request_tx: Option<mpsc::Sender<ResolveRequest>>,
    response_rx: mpsc::Receiver<ResolveResponse>,
    pending: HashMap<u64, ResolveCallback>,
    next_id: u64,
    worker: Option<JoinHandle<()>>,
}

impl Resolver {
    pub fn new(waker: Arc<Waker>) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<ResolveRequest>();
        let (response_tx, response_rx) = mpsc::channel::<ResolveResponse>();

        let worker = std::thread::Builder::new()
            .name("net-resolver".to_owned())
            .spawn(move || {
                while let Ok(req) = request_rx.recv() {
                    let (status, addrs) = match (req.host.as_str(), req.port).to_socket_addrs() {
                        Ok(iter) => (ResolveStatus::Ok, iter.collect()),
                        Err(err) => {
                            tracing::debug!(host = %req.host, %err, "resolve failed");
                            (ResolveStatus::Failed, Vec::new())
                        }
                    };

                    let sent =
                        response_tx.send(ResolveResponse { id: req.id, status, addrs }).is_ok();
                    if sent {
                        waker.wake().ok();
                    }
                }
            })
            .expect("failed to spawn resolver thread");

        Self {
            request_tx: Some(request_tx),
            response_rx,
            pending: HashMap::new(),
            next_id: 0,
            worker: Some(worker),
        }
    }

    pub fn resolve(&mut self, host: impl Into<String>, port: u16, cb: ResolveCallback) {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, cb);
        // If the worker is gone the request is simply dropped; the caller's
        // callback never fires, mirroring "resolver shutdown" behaviour.
        if let Some(tx) = &self.request_tx {
            let _ = tx.send(ResolveRequest { id, host: host.into(), port });
        }
    }

    /// Collects every response that has arrived since the last tick, paired
    /// with its callback, without invoking anything.
    ///
    /// Split from invocation so the reactor can drop its own borrow of the
    /// resolver before running callbacks that may themselves want to call
    /// back into the reactor (e.g. `post` a follow-up connect attempt).
    pub fn drain_ready(&mut self) -> Vec<(ResolveCallback, ResolveStatus, Vec<SocketAddr>)> {
        let responses: Vec<ResolveResponse> = self.response_rx.try_iter().collect();
        responses
            .into_iter()
            .filter_map(|resp| self.pending.remove(&resp.id).map(|cb| (cb, resp.status, resp.addrs)))
            .collect()
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        // Field drops run after Drop::drop returns, so the sender has to be
        // closed explicitly here -- otherwise we'd join a worker that is
        // still blocked on a channel we're still holding open.
        self.request_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
