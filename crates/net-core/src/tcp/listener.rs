use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use mio::{Interest, Token};
use socket2::{Domain, Socket, Type};
use tracing::debug;

use crate::config::ConnectionLimits;
use crate::error::SystemError;
use crate::reactor::Reactor;
use crate::resolver::ResolveStatus;
use crate::tcp::connection::TcpConnection;

pub type OnListening = Box<dyn FnMut()>;
pub type OnError = Box<dyn FnMut(SystemError)>;
pub type OnAccept = Box<dyn FnMut(Result<TcpConnection, SystemError>)>;

#[derive(Default)]
struct Callbacks {
    on_listening: Option<OnListening>,
    on_error: Option<OnError>,
    on_accept: Option<OnAccept>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenState {
    Waiting,
    Listening,
    Error,
    Shutdown,
}

pub struct ListenerState {
    token: Token,
    listener: Option<mio::net::TcpListener>,
    local_addr: Option<SocketAddr>,
    state: ListenState,
    accept_connections: bool,
    conn_limits: ConnectionLimits,
    callbacks: Callbacks,
}

impl ListenerState {
    fn wants_read(&self) -> bool {
        self.state == ListenState::Listening
            && self.accept_connections
            && self.callbacks.on_accept.is_some()
    }

    pub(crate) fn io_source(&mut self) -> Option<&mut dyn mio::event::Source> {
        self.listener.as_mut().map(|l| l as &mut dyn mio::event::Source)
    }
}

/// Public handle to a TCP listener.
#[derive(Clone)]
pub struct TcpListener {
    reactor: Reactor,
    token: Token,
    inner: Rc<RefCell<ListenerState>>,
}

impl TcpListener {
    /// Binds the first address in `addrs` that succeeds; `SO_REUSEADDR` is
    /// always set, `SO_REUSEPORT` only when `reuse_port` is requested.
    ///
    /// Mirrors the listener-construction-from-a-hostname path in that a
    /// resolver lookup (when the caller started from a hostname) has
    /// already been reduced to this same address-list entry point by the
    /// time `bind` runs.
    pub fn bind(
        reactor: &Reactor,
        addrs: Vec<SocketAddr>,
        reuse_port: bool,
        conn_limits: ConnectionLimits,
    ) -> Self {
        let token = reactor.next_token();

        let state = ListenerState {
            token,
            listener: None,
            local_addr: None,
            state: ListenState::Waiting,
            accept_connections: true,
            conn_limits,
            callbacks: Callbacks::default(),
        };

        let inner = reactor.insert_listener(token, state);
        let listener = Self { reactor: reactor.clone(), token, inner };

        let posted = listener.clone();
        reactor.post(Box::new(move |reactor| {
            do_bind(reactor, &posted, addrs, reuse_port);
        }));

        listener
    }

    /// Resolves `host:port` before binding to every resulting address in
    /// order, same as [`TcpListener::bind`] with a pre-resolved list. A
    /// failed or empty resolution reports `Error` and the resolve failure
    /// through `on_error`, exactly like an exhausted bind sweep would.
    pub fn bind_host(
        reactor: &Reactor,
        host: impl Into<String>,
        port: u16,
        reuse_port: bool,
        conn_limits: ConnectionLimits,
    ) -> Self {
        let host = host.into();
        let token = reactor.next_token();

        let state = ListenerState {
            token,
            listener: None,
            local_addr: None,
            state: ListenState::Waiting,
            accept_connections: true,
            conn_limits,
            callbacks: Callbacks::default(),
        };

        let inner = reactor.insert_listener(token, state);
        let listener = Self { reactor: reactor.clone(), token, inner };

        let posted = listener.clone();
        reactor.post(Box::new(move |reactor| {
            reactor.resolve(
                host,
                port,
                Box::new(move |reactor, status, addrs| match status {
                    ResolveStatus::Ok if !addrs.is_empty() => {
                        do_bind(reactor, &posted, addrs, reuse_port);
                    }
                    _ => {
                        posted.inner.borrow_mut().state = ListenState::Error;
                        fire_error(&posted, SystemError::Unknown);
                    }
                }),
            );
        }));

        listener
    }

    pub fn on_listening(&self, cb: OnListening) {
        let inner = self.inner.clone();
        self.reactor.post(Box::new(move |_| {
            inner.borrow_mut().callbacks.on_listening = Some(cb);
        }));
    }

    pub fn on_error(&self, cb: OnError) {
        let inner = self.inner.clone();
        self.reactor.post(Box::new(move |_| {
            inner.borrow_mut().callbacks.on_error = Some(cb);
        }));
    }

    pub fn on_accept(&self, cb: OnAccept) {
        let listener = self.clone();
        self.reactor.post(Box::new(move |_| {
            listener.inner.borrow_mut().callbacks.on_accept = Some(cb);
            listener.sync_interest();
        }));
    }

    pub fn set_accept_connections(&self, enabled: bool) {
        self.inner.borrow_mut().accept_connections = enabled;
        self.sync_interest();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().local_addr
    }

    /// The reactor driving this listener. Cheap to clone (an `Rc` handle).
    pub fn reactor(&self) -> Reactor {
        self.reactor.clone()
    }

    pub fn shutdown(&self) {
        let mut state = self.inner.borrow_mut();
        if state.state == ListenState::Shutdown {
            return;
        }
        state.state = ListenState::Shutdown;
        state.listener = None;
        drop(state);
        self.reactor.reregister_listener(self.token, None);
        let token = self.token;
        self.reactor.post(Box::new(move |reactor| reactor.remove_listener(token)));
    }

    fn sync_interest(&self) {
        let desired = if self.inner.borrow().wants_read() { Some(Interest::READABLE) } else { None };
        self.reactor.reregister_listener(self.token, desired);
    }
}

fn do_bind(reactor: &Reactor, listener: &TcpListener, addrs: Vec<SocketAddr>, reuse_port: bool) {
    let mut last_err: Option<io::Error> = None;

    for addr in &addrs {
        match bind_one(*addr, reuse_port) {
            Ok(std_listener) => {
                let mio_listener = mio::net::TcpListener::from_std(std_listener);
                let local_addr = mio_listener.local_addr().ok();

                reactor.register_listener(listener.token, &mio_listener, Interest::empty());

                let mut state = listener.inner.borrow_mut();
                state.listener = Some(mio_listener);
                state.local_addr = local_addr;
                state.state = ListenState::Listening;
                drop(state);

                listener.sync_interest();
                fire_listening(listener);
                return;
            }
            Err(err) => {
                debug!(%addr, %err, "tcp: listen bind attempt failed");
                last_err = Some(err);
            }
        }
    }

    let status = last_err.map(SystemError::from_io).unwrap_or(SystemError::Unknown);
    listener.inner.borrow_mut().state = ListenState::Error;
    fire_error(listener, status);
}

fn bind_one(addr: SocketAddr, reuse_port: bool) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Dispatch entry point the reactor calls with a readiness event.
pub(crate) fn dispatch(reactor: &Reactor, listener: &TcpListener) {
    loop {
        let accept_result = {
            let mut state = listener.inner.borrow_mut();
            if state.state != ListenState::Listening {
                return;
            }
            let Some(mio_listener) = &mut state.listener else { return };
            mio_listener.accept()
        };

        match accept_result {
            Ok((stream, peer_addr)) => {
                let limits = listener.inner.borrow().conn_limits.clone();
                match TcpConnection::from_accepted(reactor, stream, peer_addr, limits) {
                    Ok(conn) => fire_accept(listener, Ok(conn)),
                    Err(err) => fire_accept(listener, Err(SystemError::from_io(err))),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                let status = SystemError::from_io(err);
                fire_accept(listener, Err(status));
                return;
            }
        }
    }
}

fn fire_listening(listener: &TcpListener) {
    let mut state = listener.inner.borrow_mut();
    if let Some(cb) = &mut state.callbacks.on_listening {
        cb();
    }
}

fn fire_error(listener: &TcpListener, status: SystemError) {
    let mut state = listener.inner.borrow_mut();
    if let Some(cb) = &mut state.callbacks.on_error {
        cb(status);
    }
}

fn fire_accept(listener: &TcpListener, result: Result<TcpConnection, SystemError>) {
    let mut state = listener.inner.borrow_mut();
    if let Some(cb) = &mut state.callbacks.on_accept {
        cb(result);
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) <= 2 {
            self.shutdown();
        }
    }
}
