use std::cell::RefCell;
use std::io::{self, IoSlice, Write};
use std::net::SocketAddr;
use std::rc::Rc;

use mio::{Interest, Token};
use tracing::{debug, warn};

use crate::buffer::{FillOutcome, RecvBuffer};
use crate::config::ConnectionLimits;
use crate::error::{ErrorKind, SystemError};
use crate::reactor::Reactor;
use crate::resolver::ResolveStatus;
use crate::timer::TimerId;

pub type OnConnected = Box<dyn FnMut(SystemError)>;
pub type OnClosed = Box<dyn FnMut(SystemError)>;
pub type OnDataReceived = Box<dyn FnMut(&[u8]) -> usize>;
pub type OnDataSent = Box<dyn FnMut()>;

#[derive(Default)]
struct Callbacks {
    on_connected: Option<OnConnected>,
    on_closed: Option<OnClosed>,
    on_data_received: Option<OnDataReceived>,
    on_data_sent: Option<OnDataSent>,
}

/// Candidate-address sweep state while a connection has not yet landed.
///
/// `best_error` is the "first non-trivial failure sticks" latch: once set
/// via `get_or_insert`, a later, possibly more generic failure from a
/// subsequent address never overwrites it.
struct ConnectingState {
    pending: mio::net::TcpStream,
    remaining: Vec<SocketAddr>,
    attempt_timer: Option<TimerId>,
    best_error: Option<SystemError>,
}

enum Phase {
    Connecting(ConnectingState),
    Connected(mio::net::TcpStream),
    Disconnected,
    Error(ErrorKind),
    Shutdown,
}

pub struct ConnectionState {
    token: Token,
    phase: Phase,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    recv_buf: RecvBuffer,
    send_buf: Vec<u8>,
    send_offset: usize,
    limits: ConnectionLimits,
    total_bytes_sent: u64,
    total_bytes_received: u64,
    callbacks: Callbacks,
}

impl ConnectionState {
    fn send_pending(&self) -> usize {
        self.send_buf.len() - self.send_offset
    }

    fn is_send_full(&self) -> bool {
        self.send_pending() >= self.limits.send_buffer_max_size
    }

    fn wants_read(&self) -> bool {
        matches!(self.phase, Phase::Connected(_))
            && self.callbacks.on_data_received.is_some()
            && self.limits.receive_packets
            && !(self.limits.block_on_send_buffer_full && self.is_send_full())
    }

    fn wants_write(&self) -> bool {
        match &self.phase {
            Phase::Connected(_) => self.send_pending() > 0,
            Phase::Connecting(_) => true,
            _ => false,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected(_))
    }

    /// The live `mio` source backing this connection's current phase, if
    /// any -- used by the reactor to register/reregister/deregister
    /// interest without needing to know about `Phase` itself.
    pub(crate) fn io_source(&mut self) -> Option<&mut dyn mio::event::Source> {
        match &mut self.phase {
            Phase::Connecting(connecting) => Some(&mut connecting.pending),
            Phase::Connected(stream) => Some(stream),
            Phase::Disconnected | Phase::Error(_) | Phase::Shutdown => None,
        }
    }
}

/// Public handle to a TCP connection.
///
/// Cloning shares the same underlying state (an `Rc<RefCell<ConnectionState>>`);
/// the reactor's own registry entry is the other owner. Dropping the last
/// user-held clone does not synchronously tear anything down -- the `Drop`
/// impl posts a shutdown, so teardown never races a callback that is
/// mid-dispatch on this connection's own stack frame.
#[derive(Clone)]
pub struct TcpConnection {
    reactor: Reactor,
    token: Token,
    inner: Rc<RefCell<ConnectionState>>,
}

impl TcpConnection {
    pub fn connect(reactor: &Reactor, mut addrs: Vec<SocketAddr>, limits: ConnectionLimits) -> Self {
        let token = reactor.next_token();
        addrs.reverse(); // pop() then walks them in the caller's original order

        let state = ConnectionState {
            token,
            phase: Phase::Shutdown, // placeholder until the posted first attempt runs
            local_addr: None,
            peer_addr: None,
            recv_buf: RecvBuffer::new(),
            send_buf: Vec::new(),
            send_offset: 0,
            limits,
            total_bytes_sent: 0,
            total_bytes_received: 0,
            callbacks: Callbacks::default(),
        };

        let inner = reactor.insert_connection(token, state);
        let conn = Self { reactor: reactor.clone(), token, inner };

        // Construction always posts the first attempt rather than dialing
        // synchronously, so `connect` returns before any callback can fire
        // re-entrantly off the caller's own stack frame.
        let posted = conn.clone();
        reactor.post(Box::new(move |reactor| {
            attempt_next_address(reactor, &posted, addrs, None);
        }));

        conn
    }

    /// Resolves `host:port` on the reactor's resolver thread before sweeping
    /// the resulting addresses exactly like [`TcpConnection::connect`]. A
    /// failed or empty resolution goes straight to `Error` and fires
    /// `on_connected` once, the same terminal shape an exhausted address
    /// sweep produces.
    pub fn connect_host(
        reactor: &Reactor,
        host: impl Into<String>,
        port: u16,
        limits: ConnectionLimits,
    ) -> Self {
        let host = host.into();
        let token = reactor.next_token();

        let state = ConnectionState {
            token,
            phase: Phase::Shutdown, // placeholder until resolution completes
            local_addr: None,
            peer_addr: None,
            recv_buf: RecvBuffer::new(),
            send_buf: Vec::new(),
            send_offset: 0,
            limits,
            total_bytes_sent: 0,
            total_bytes_received: 0,
            callbacks: Callbacks::default(),
        };

        let inner = reactor.insert_connection(token, state);
        let conn = Self { reactor: reactor.clone(), token, inner };

        let posted = conn.clone();
        reactor.post(Box::new(move |reactor| {
            reactor.resolve(
                host,
                port,
                Box::new(move |reactor, status, mut addrs| match status {
                    ResolveStatus::Ok if !addrs.is_empty() => {
                        addrs.reverse();
                        attempt_next_address(reactor, &posted, addrs, None);
                    }
                    _ => {
                        posted.inner.borrow_mut().phase = Phase::Error(ErrorKind::Unknown);
                        posted.deregister();
                        schedule_unregister(reactor, posted.token);
                        fire_connected(&posted, SystemError::Unknown);
                    }
                }),
            );
        }));

        conn
    }

    /// Wraps an already-connected socket, the listener accept path. There is
    /// no `on_connected` firing here -- the listener's `on_accept` is the
    /// only notification the caller gets for this connection coming to be.
    pub(crate) fn from_accepted(
        reactor: &Reactor,
        stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        limits: ConnectionLimits,
    ) -> io::Result<Self> {
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr().ok();
        let token = reactor.next_token();

        let state = ConnectionState {
            token,
            phase: Phase::Connected(stream),
            local_addr,
            peer_addr: Some(peer_addr),
            recv_buf: RecvBuffer::new(),
            send_buf: Vec::new(),
            send_offset: 0,
            limits,
            total_bytes_sent: 0,
            total_bytes_received: 0,
            callbacks: Callbacks::default(),
        };

        let inner = reactor.insert_connection(token, state);
        let conn = Self { reactor: reactor.clone(), token, inner };
        conn.sync_interest();
        Ok(conn)
    }

    pub fn on_connected(&self, cb: OnConnected) {
        let inner = self.inner.clone();
        self.reactor.post(Box::new(move |_| {
            inner.borrow_mut().callbacks.on_connected = Some(cb);
        }));
    }

    pub fn on_closed(&self, cb: OnClosed) {
        let inner = self.inner.clone();
        self.reactor.post(Box::new(move |_| {
            inner.borrow_mut().callbacks.on_closed = Some(cb);
        }));
    }

    pub fn on_data_received(&self, cb: OnDataReceived) {
        let conn = self.clone();
        self.reactor.post(Box::new(move |_| {
            conn.inner.borrow_mut().callbacks.on_data_received = Some(cb);
            conn.sync_interest();
        }));
    }

    pub fn on_data_sent(&self, cb: OnDataSent) {
        let inner = self.inner.clone();
        self.reactor.post(Box::new(move |_| {
            inner.borrow_mut().callbacks.on_data_sent = Some(cb);
        }));
    }

    pub fn set_send_buffer_max_size(&self, cap: usize) {
        self.inner.borrow_mut().limits.send_buffer_max_size = cap;
        self.sync_interest();
    }

    pub fn set_block_on_send_buffer_full(&self, block: bool) {
        self.inner.borrow_mut().limits.block_on_send_buffer_full = block;
        self.sync_interest();
    }

    pub fn set_receive_packets(&self, enabled: bool) {
        self.inner.borrow_mut().limits.receive_packets = enabled;
        self.sync_interest();
    }

    /// The reactor driving this connection. Cheap to clone (an `Rc` handle).
    pub fn reactor(&self) -> Reactor {
        self.reactor.clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().local_addr()
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.inner.borrow().total_bytes_sent()
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.inner.borrow().total_bytes_received()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().is_connected()
    }

    /// Bytes still queued to be written to the peer.
    pub fn pending_to_send(&self) -> usize {
        self.inner.borrow().send_pending()
    }

    pub fn is_send_buffer_empty(&self) -> bool {
        self.inner.borrow().send_pending() == 0
    }

    pub fn is_send_buffer_full(&self) -> bool {
        self.inner.borrow().is_send_full()
    }

    pub fn max_send_buffer_size(&self) -> usize {
        self.inner.borrow().limits.send_buffer_max_size
    }

    /// Remaining budget before `send`/`send_data` would refuse more bytes.
    pub fn send_buffer_remaining_size(&self) -> usize {
        let state = self.inner.borrow();
        state.limits.send_buffer_max_size.saturating_sub(state.send_pending())
    }

    /// Gives `f` write access to the raw send buffer unless it is already at
    /// cap. Returns `false` (and never calls `f`) exactly when pending bytes
    /// are already `>= cap` -- the caller is expected to retry, or fall back
    /// to `send_force`.
    pub fn send(&self, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        if self.inner.borrow().is_send_full() {
            return false;
        }
        self.send_force(f);
        true
    }

    pub fn send_force(&self, f: impl FnOnce(&mut Vec<u8>)) {
        {
            let mut state = self.inner.borrow_mut();
            f(&mut state.send_buf);
        }
        self.sync_interest();
        flush_writes(&self.reactor, self);
    }

    pub fn send_data(&self, data: &[u8]) -> bool {
        self.send(|buf| buf.extend_from_slice(data))
    }

    pub fn send_data_force(&self, data: &[u8]) {
        self.send_force(|buf| buf.extend_from_slice(data));
    }

    pub fn shutdown(&self) {
        let mut state = self.inner.borrow_mut();
        if matches!(state.phase, Phase::Shutdown) {
            return;
        }
        let had_pending_writes = state.send_pending() > 0 && matches!(state.phase, Phase::Connected(_));
        state.phase = Phase::Shutdown;
        drop(state);
        if !had_pending_writes {
            self.deregister();
            schedule_unregister(&self.reactor, self.token);
        }
        // Otherwise the write loop's drain-completion path unregisters once
        // the backlog empties, so a `shutdown()` call does not truncate
        // bytes already handed to `send`/`send_force`.
    }

    fn sync_interest(&self) {
        let (token, desired) = {
            let state = self.inner.borrow();
            let desired = match (state.wants_read(), state.wants_write()) {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            };
            (state.token, desired)
        };
        self.reactor.reregister_connection(token, desired);
    }

    fn deregister(&self) {
        self.reactor.reregister_connection(self.token, None);
    }
}

/// Attempts the next candidate address from a fresh or continuing sweep.
///
/// `best_error` is the "first non-trivial failure sticks" latch carried
/// across the whole sweep: each call seeds the next `ConnectingState` with
/// it, so a later attempt's failure never overwrites an earlier, more
/// specific one, and an exhausted sweep reports it instead of `Unknown`.
pub(crate) fn attempt_next_address(
    reactor: &Reactor,
    conn: &TcpConnection,
    mut remaining: Vec<SocketAddr>,
    best_error: Option<SystemError>,
) {
    let Some(addr) = remaining.pop() else {
        let status = best_error.unwrap_or(SystemError::Unknown);
        conn.inner.borrow_mut().phase = Phase::Error(status.kind());
        conn.deregister();
        schedule_unregister(reactor, conn.token);
        fire_connected(conn, status);
        return;
    };

    let socket = match mio::net::TcpStream::connect(addr) {
        Ok(s) => s,
        Err(err) => {
            debug!(%addr, %err, "tcp: connect attempt failed synchronously");
            return attempt_next_address(reactor, conn, remaining, best_error);
        }
    };

    reactor.register_connection(conn.token, &socket, Interest::READABLE | Interest::WRITABLE);

    let timeout = conn.inner.borrow().limits.connect_attempt_timeout;
    let timer_conn = conn.clone();
    let timer_remaining = remaining.clone();
    let attempt_timer = reactor.register_timer(
        timeout,
        Box::new(move |reactor| on_connect_attempt_timeout(reactor, &timer_conn, timer_remaining)),
    );

    conn.inner.borrow_mut().phase = Phase::Connecting(ConnectingState {
        pending: socket,
        remaining,
        attempt_timer: Some(attempt_timer),
        best_error,
    });
}

fn on_connect_attempt_timeout(reactor: &Reactor, conn: &TcpConnection, remaining: Vec<SocketAddr>) {
    let best_error = {
        let mut state = conn.inner.borrow_mut();
        if let Phase::Connecting(connecting) = &mut state.phase {
            connecting.attempt_timer = None;
            connecting.best_error.get_or_insert(SystemError::ConnectionRefused);
            connecting.best_error.take()
        } else {
            None
        }
    };
    reactor.reregister_connection(conn.token, None);
    attempt_next_address(reactor, conn, remaining, best_error);
}

/// Dispatch entry point the reactor calls with a readiness event.
pub(crate) fn dispatch(reactor: &Reactor, conn: &TcpConnection, readable: bool, writable: bool) {
    if matches!(conn.inner.borrow().phase, Phase::Connecting(_)) {
        advance_connecting(reactor, conn);
        return;
    }

    if readable {
        run_read_loop(conn);
    }
    if writable {
        flush_writes(reactor, conn);
    }
    conn.sync_interest();
}

fn advance_connecting(reactor: &Reactor, conn: &TcpConnection) {
    let phase = {
        let mut state = conn.inner.borrow_mut();
        std::mem::replace(&mut state.phase, Phase::Shutdown)
    };
    let Phase::Connecting(mut connecting) = phase else {
        conn.inner.borrow_mut().phase = phase;
        return;
    };

    match connecting.pending.take_error() {
        Ok(None) => match connecting.pending.peer_addr() {
            Ok(peer_addr) => {
                if let Some(timer) = connecting.attempt_timer.take() {
                    reactor.unregister_timer(timer);
                }
                let local_addr = connecting.pending.local_addr().ok();
                let mut state = conn.inner.borrow_mut();
                state.phase = Phase::Connected(connecting.pending);
                state.peer_addr = Some(peer_addr);
                state.local_addr = local_addr;
                drop(state);
                conn.sync_interest();
                fire_connected(conn, SystemError::None);
            }
            Err(_) => {
                // Genuinely still in progress; restore state untouched.
                conn.inner.borrow_mut().phase = Phase::Connecting(connecting);
            }
        },
        Ok(Some(err)) | Err(err) => {
            let status = SystemError::from_io(err);
            connecting.best_error.get_or_insert(status);
            if let Some(timer) = connecting.attempt_timer.take() {
                reactor.unregister_timer(timer);
            }
            attempt_next_address(reactor, conn, connecting.remaining, connecting.best_error);
        }
    }
}

fn run_read_loop(conn: &TcpConnection) {
    loop {
        let outcome = {
            let mut state = conn.inner.borrow_mut();
            if !state.wants_read() {
                return;
            }
            let Phase::Connected(stream) = &mut state.phase else { return };
            let (grow_step, ceiling) =
                (state.limits.receive_grow_step, state.limits.receive_tick_ceiling);
            match state.recv_buf.fill_from(stream, grow_step, ceiling) {
                Ok(outcome) => outcome,
                Err(err) => {
                    drop(state);
                    close_with_error(conn, SystemError::from_io(err));
                    return;
                }
            }
        };

        let total_read = match outcome {
            FillOutcome::WouldBlock { total_read }
            | FillOutcome::CeilingReached { total_read }
            | FillOutcome::Eof { total_read } => total_read,
        };
        if total_read > 0 {
            conn.inner.borrow_mut().total_bytes_received += total_read as u64;
            deliver_received(conn);
        }

        match outcome {
            FillOutcome::Eof { .. } => {
                close_with_error(conn, SystemError::Disconnected);
                return;
            }
            FillOutcome::WouldBlock { .. } | FillOutcome::CeilingReached { .. } => return,
        }
    }
}

fn deliver_received(conn: &TcpConnection) {
    loop {
        let consumed = {
            let mut state = conn.inner.borrow_mut();
            if state.recv_buf.is_empty() {
                return;
            }
            let Some(cb) = &mut state.callbacks.on_data_received else { return };
            cb(state.recv_buf.filled())
        };
        if consumed == 0 {
            return;
        }
        conn.inner.borrow_mut().recv_buf.consume(consumed);
    }
}

fn close_with_error(conn: &TcpConnection, status: SystemError) {
    {
        let mut state = conn.inner.borrow_mut();
        if matches!(state.phase, Phase::Disconnected | Phase::Error(_) | Phase::Shutdown) {
            return;
        }
        state.phase = if matches!(status, SystemError::Disconnected) {
            Phase::Disconnected
        } else {
            Phase::Error(status.kind())
        };
    }
    conn.deregister();
    schedule_unregister(&conn.reactor, conn.token);
    fire_closed(conn, status);
}

fn flush_writes(reactor: &Reactor, conn: &TcpConnection) {
    loop {
        let (offset, chunk_end, reached_end) = {
            let state = conn.inner.borrow();
            if !matches!(state.phase, Phase::Connected(_)) || state.send_pending() == 0 {
                return;
            }
            let ceiling = state.limits.send_syscall_ceiling;
            let end = (state.send_offset + ceiling).min(state.send_buf.len());
            (state.send_offset, end, end == state.send_buf.len())
        };

        let write_result = {
            let mut state = conn.inner.borrow_mut();
            let Phase::Connected(stream) = &mut state.phase else { return };
            stream.write_vectored(&[IoSlice::new(&state.send_buf[offset..chunk_end])])
        };

        match write_result {
            Ok(0) => {
                close_with_error(conn, SystemError::Disconnected);
                return;
            }
            Ok(n) => {
                let fully_drained = {
                    let mut state = conn.inner.borrow_mut();
                    state.send_offset += n;
                    state.total_bytes_sent += n as u64;
                    let drained = state.send_offset == state.send_buf.len();
                    if drained {
                        state.send_buf.clear();
                        state.send_offset = 0;
                    }
                    drained
                };

                if reached_end && fully_drained {
                    fire_data_sent(conn);
                }
                if fully_drained {
                    if matches!(conn.inner.borrow().phase, Phase::Shutdown) {
                        conn.deregister();
                        schedule_unregister(reactor, conn.token);
                    }
                    return;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!(%err, "tcp: write failed");
                close_with_error(conn, SystemError::from_io(err));
                return;
            }
        }
    }
}

fn fire_connected(conn: &TcpConnection, status: SystemError) {
    let mut state = conn.inner.borrow_mut();
    if let Some(cb) = &mut state.callbacks.on_connected {
        cb(status);
    }
}

fn fire_closed(conn: &TcpConnection, status: SystemError) {
    let mut state = conn.inner.borrow_mut();
    if let Some(cb) = &mut state.callbacks.on_closed {
        cb(status);
    }
}

fn fire_data_sent(conn: &TcpConnection) {
    let mut state = conn.inner.borrow_mut();
    if let Some(cb) = &mut state.callbacks.on_data_sent {
        cb();
    }
}

fn schedule_unregister(reactor: &Reactor, token: Token) {
    reactor.post(Box::new(move |reactor| {
        reactor.remove_connection(token);
    }));
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        // `strong_count` includes this handle and the reactor's own registry
        // entry; once we are the last other owner, schedule a shutdown the
        // way the source's refcounted teardown would on its last `shared_ptr`
        // release.
        if Rc::strong_count(&self.inner) <= 2 {
            self.shutdown();
        }
    }
}
