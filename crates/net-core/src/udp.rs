use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use mio::{Interest, Token};
use socket2::{Domain, Socket, Type};
use tracing::debug;

use crate::config::{UdpLimits, MAX_UDP_DATAGRAM_SIZE};
use crate::error::SystemError;
use crate::reactor::Reactor;
use crate::resolver::ResolveStatus;

pub type OnBound = Box<dyn FnMut()>;
pub type OnError = Box<dyn FnMut(SystemError)>;
pub type OnDataReceived = Box<dyn FnMut(SocketAddr, &[u8])>;
pub type OnSendError = Box<dyn FnMut(SystemError)>;

#[derive(Default)]
struct Callbacks {
    on_bound: Option<OnBound>,
    on_error: Option<OnError>,
    on_data_received: Option<OnDataReceived>,
    on_send_error: Option<OnSendError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindState {
    Binding,
    Bound,
    Error,
    Shutdown,
}

struct SendEntry {
    destination: SocketAddr,
    datagram_size: usize,
}

pub struct UdpState {
    token: Token,
    socket: Option<mio::net::UdpSocket>,
    local_addr: Option<SocketAddr>,
    state: BindState,
    limits: UdpLimits,
    send_buf: Vec<u8>,
    send_queue: VecDeque<SendEntry>,
    send_buffer_size: usize,
    callbacks: Callbacks,
}

impl UdpState {
    fn wants_write(&self) -> bool {
        !self.send_queue.is_empty()
    }

    fn wants_read(&self) -> bool {
        self.state == BindState::Bound && self.callbacks.on_data_received.is_some()
    }

    pub(crate) fn io_source(&mut self) -> Option<&mut dyn mio::event::Source> {
        self.socket.as_mut().map(|s| s as &mut dyn mio::event::Source)
    }
}

/// Public handle to a UDP socket.
#[derive(Clone)]
pub struct UdpSocketHandle {
    reactor: Reactor,
    token: Token,
    inner: Rc<RefCell<UdpState>>,
}

impl UdpSocketHandle {
    pub fn bind(
        reactor: &Reactor,
        addrs: Vec<SocketAddr>,
        reuse_port: bool,
        allow_broadcast: bool,
        limits: UdpLimits,
    ) -> Self {
        let token = reactor.next_token();

        let state = UdpState {
            token,
            socket: None,
            local_addr: None,
            state: BindState::Binding,
            limits,
            send_buf: Vec::new(),
            send_queue: VecDeque::new(),
            send_buffer_size: 0,
            callbacks: Callbacks::default(),
        };

        let inner = reactor.insert_udp(token, state);
        let handle = Self { reactor: reactor.clone(), token, inner };

        let posted = handle.clone();
        reactor.post(Box::new(move |reactor| {
            do_bind(reactor, &posted, addrs, reuse_port, allow_broadcast);
        }));

        handle
    }

    /// Resolves `host:port` before binding to candidate addresses exactly
    /// like [`UdpSocketHandle::bind`] -- the same resolve-then-try-each-addr
    /// shape as [`crate::tcp::TcpListener::bind_host`].
    pub fn bind_host(
        reactor: &Reactor,
        host: impl Into<String>,
        port: u16,
        reuse_port: bool,
        allow_broadcast: bool,
        limits: UdpLimits,
    ) -> Self {
        let host = host.into();
        let token = reactor.next_token();

        let state = UdpState {
            token,
            socket: None,
            local_addr: None,
            state: BindState::Binding,
            limits,
            send_buf: Vec::new(),
            send_queue: VecDeque::new(),
            send_buffer_size: 0,
            callbacks: Callbacks::default(),
        };

        let inner = reactor.insert_udp(token, state);
        let handle = Self { reactor: reactor.clone(), token, inner };

        let posted = handle.clone();
        reactor.post(Box::new(move |reactor| {
            reactor.resolve(
                host,
                port,
                Box::new(move |reactor, status, addrs| match status {
                    ResolveStatus::Ok if !addrs.is_empty() => {
                        do_bind(reactor, &posted, addrs, reuse_port, allow_broadcast);
                    }
                    _ => {
                        posted.inner.borrow_mut().state = BindState::Error;
                        let mut state = posted.inner.borrow_mut();
                        if let Some(cb) = &mut state.callbacks.on_error {
                            cb(SystemError::Unknown);
                        }
                    }
                }),
            );
        }));

        handle
    }

    pub fn on_bound(&self, cb: OnBound) {
        let inner = self.inner.clone();
        self.reactor.post(Box::new(move |_| inner.borrow_mut().callbacks.on_bound = Some(cb)));
    }

    pub fn on_error(&self, cb: OnError) {
        let inner = self.inner.clone();
        self.reactor.post(Box::new(move |_| inner.borrow_mut().callbacks.on_error = Some(cb)));
    }

    pub fn on_data_received(&self, cb: OnDataReceived) {
        let handle = self.clone();
        self.reactor.post(Box::new(move |_| {
            handle.inner.borrow_mut().callbacks.on_data_received = Some(cb);
            handle.sync_interest();
        }));
    }

    pub fn on_send_error(&self, cb: OnSendError) {
        let inner = self.inner.clone();
        self.reactor.post(Box::new(move |_| inner.borrow_mut().callbacks.on_send_error = Some(cb)));
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().local_addr
    }

    /// Enqueues `data` for `destination`. Returns `false` (without
    /// queueing) when the datagram is oversized, or when the queue is
    /// already at its entry-count or byte-size cap.
    pub fn send_data(&self, destination: SocketAddr, data: &[u8]) -> bool {
        if data.len() > MAX_UDP_DATAGRAM_SIZE || u32::try_from(data.len()).is_err() {
            return false;
        }
        let mut state = self.inner.borrow_mut();
        if state.send_queue.len() >= state.limits.max_queued_datagrams
            || state.send_buffer_size + data.len() > state.limits.send_buffer_max_size
        {
            return false;
        }
        state.send_buf.extend_from_slice(data);
        state.send_buffer_size += data.len();
        state.send_queue.push_back(SendEntry { destination, datagram_size: data.len() });
        drop(state);
        self.sync_interest();
        drain_send_queue(self);
        true
    }

    pub fn shutdown(&self) {
        let mut state = self.inner.borrow_mut();
        if state.state == BindState::Shutdown {
            return;
        }
        state.state = BindState::Shutdown;
        state.socket = None;
        drop(state);
        self.reactor.reregister_udp(self.token, None);
        let token = self.token;
        self.reactor.post(Box::new(move |reactor| reactor.remove_udp(token)));
    }

    fn sync_interest(&self) {
        let state = self.inner.borrow();
        let desired = match (state.wants_read(), state.wants_write()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        drop(state);
        self.reactor.reregister_udp(self.token, desired);
    }
}

fn do_bind(
    reactor: &Reactor,
    handle: &UdpSocketHandle,
    addrs: Vec<SocketAddr>,
    reuse_port: bool,
    allow_broadcast: bool,
) {
    let mut last_err: Option<io::Error> = None;

    for addr in &addrs {
        match bind_one(*addr, reuse_port, allow_broadcast) {
            Ok(std_socket) => {
                let mio_socket = mio::net::UdpSocket::from_std(std_socket);
                let local_addr = mio_socket.local_addr().ok();

                reactor.register_udp(handle.token, &mio_socket, Interest::empty());

                let mut state = handle.inner.borrow_mut();
                state.socket = Some(mio_socket);
                state.local_addr = local_addr;
                state.state = BindState::Bound;
                drop(state);

                handle.sync_interest();
                let mut state = handle.inner.borrow_mut();
                if let Some(cb) = &mut state.callbacks.on_bound {
                    cb();
                }
                return;
            }
            Err(err) => {
                debug!(%addr, %err, "udp: bind attempt failed");
                last_err = Some(err);
            }
        }
    }

    let status = last_err.map(SystemError::from_io).unwrap_or(SystemError::Unknown);
    handle.inner.borrow_mut().state = BindState::Error;
    let mut state = handle.inner.borrow_mut();
    if let Some(cb) = &mut state.callbacks.on_error {
        cb(status);
    }
}

fn bind_one(addr: SocketAddr, reuse_port: bool, allow_broadcast: bool) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    if allow_broadcast {
        socket.set_broadcast(true)?;
    }
    Ok(socket.into())
}

/// Dispatch entry point the reactor calls with a readiness event.
pub(crate) fn dispatch(handle: &UdpSocketHandle, readable: bool, writable: bool) {
    if readable {
        run_recv_loop(handle);
    }
    if writable {
        drain_send_queue(handle);
    }
    handle.sync_interest();
}

fn run_recv_loop(handle: &UdpSocketHandle) {
    let mut scratch = [0u8; MAX_UDP_DATAGRAM_SIZE];
    loop {
        let recv_result = {
            let state = handle.inner.borrow();
            if state.state != BindState::Bound {
                return;
            }
            let Some(socket) = &state.socket else { return };
            socket.recv_from(&mut scratch)
        };

        match recv_result {
            Ok((n, peer)) => {
                let mut state = handle.inner.borrow_mut();
                if let Some(cb) = &mut state.callbacks.on_data_received {
                    cb(peer, &scratch[..n]);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(_err) => return,
        }
    }
}

fn drain_send_queue(handle: &UdpSocketHandle) {
    loop {
        let entry_len = {
            let state = handle.inner.borrow();
            if state.state != BindState::Bound {
                return;
            }
            let Some(entry) = state.send_queue.front() else { return };
            entry.datagram_size
        };

        let chunk_result = {
            let state = handle.inner.borrow();
            let Some(entry) = state.send_queue.front() else { return };
            let chunk: Vec<u8> = state.send_buf[..entry_len].to_vec();
            let Some(socket) = &state.socket else { return };
            socket.send_to(&chunk, entry.destination)
        };

        match chunk_result {
            Ok(_) => {
                let mut state = handle.inner.borrow_mut();
                state.send_queue.pop_front();
                state.send_buf.drain(..entry_len);
                state.send_buffer_size -= entry_len;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                let status = SystemError::from_io(err);
                let mut state = handle.inner.borrow_mut();
                state.send_queue.pop_front();
                state.send_buf.drain(..entry_len);
                state.send_buffer_size -= entry_len;
                if let Some(cb) = &mut state.callbacks.on_send_error {
                    cb(status);
                }
            }
        }
    }
}

impl Drop for UdpSocketHandle {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) <= 2 {
            self.shutdown();
        }
    }
}
