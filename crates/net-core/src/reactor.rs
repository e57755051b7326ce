use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};

use net_utils::safe_panic;

use crate::config::ReactorConfig;
use crate::deferred::{AtomicQueue, AtomicWork, DeferredQueue, DeferredWork};
use crate::registry::Registry;
use crate::resolver::Resolver;
use crate::tcp::connection::{self, ConnectionState, TcpConnection};
use crate::tcp::listener::{self, ListenerState, TcpListener};
use crate::timer::{TimerId, TimerManager};
use crate::udp::{self, UdpSocketHandle, UdpState};

/// Reserved token for the cross-thread waker; socket tokens are handed out
/// starting at 0 and can never reach `usize::MAX` in practice.
const WAKER_TOKEN: Token = Token(usize::MAX);

const DRAIN_FIXED_POINT_ITERATION_CAP: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Ok,
    Failed,
    NoMoreWork,
}

#[derive(Debug, Clone, Copy)]
pub struct RunParams {
    pub timeout: Option<Duration>,
    pub stop_when_no_work: bool,
}

impl Default for RunParams {
    fn default() -> Self {
        Self { timeout: None, stop_when_no_work: false }
    }
}

/// The only supported way to reach a reactor from a thread other than the
/// one running it. Built entirely out of `Arc`-backed pieces (the atomic
/// work mailbox and the `mio::Waker`), so unlike `Reactor` it is safe to
/// clone, send, and call from anywhere.
#[derive(Clone)]
pub struct Handle {
    atomic: AtomicQueue,
    waker: Arc<Waker>,
}

impl Handle {
    /// Enqueues `work` and wakes an in-flight `run`. `work` runs on the
    /// reactor thread the next time it drains atomic work (after `poll`
    /// returns, before the single-thread deferred drain).
    pub fn post_atomic(&self, work: AtomicWork) {
        self.atomic.push(work);
        let _ = self.waker.wake();
    }

    /// Cross-thread cancellation of an in-flight poll. Idempotent: waking a
    /// reactor that is not currently blocked just primes the next poll to
    /// return immediately, which is harmless.
    pub fn notify(&self) {
        let _ = self.waker.wake();
    }
}

struct Inner {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    next_token: usize,
    listeners: Registry<ListenerState>,
    connections: Registry<ConnectionState>,
    udp_sockets: Registry<UdpState>,
    timers: TimerManager,
    deferred: DeferredQueue,
    atomic: AtomicQueue,
    resolver: Resolver,
}

/// The reactor: a single-threaded, poll-based I/O event loop.
///
/// `Reactor` is a cheap, clonable handle (`Rc<RefCell<Inner>>`) -- the
/// `RefCell` is what enforces the single-threaded contract at runtime: any
/// attempt to re-enter the reactor's own state while a borrow is already
/// active (e.g. a user callback recursively calling back into the same
/// mutation path) panics immediately rather than silently corrupting state.
#[derive(Clone)]
pub struct Reactor(Rc<RefCell<Inner>>);

impl Reactor {
    pub fn new() -> std::io::Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    pub fn with_config(config: ReactorConfig) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let resolver = Resolver::new(waker.clone());

        let inner = Inner {
            poll,
            events: Events::with_capacity(config.events_capacity),
            waker,
            next_token: 0,
            listeners: Registry::new(),
            connections: Registry::new(),
            udp_sockets: Registry::new(),
            timers: TimerManager::new(),
            deferred: DeferredQueue::default(),
            atomic: AtomicQueue::new(),
            resolver,
        };

        Ok(Self(Rc::new(RefCell::new(inner))))
    }

    // -- cross-cutting handle-facing API -----------------------------------

    pub fn post(&self, work: DeferredWork) {
        self.0.borrow_mut().deferred.push(work);
    }

    /// A cloneable, `Send + Sync` capability for waking this reactor from a
    /// foreign thread. `Reactor` itself is an `Rc<RefCell<_>>` and cannot
    /// cross threads -- obtain a `Handle` once (on the reactor thread, e.g.
    /// right after construction) and move *that* to the worker thread
    /// instead.
    pub fn handle(&self) -> Handle {
        let inner = self.0.borrow();
        Handle { atomic: inner.atomic.clone(), waker: inner.waker.clone() }
    }

    pub fn register_timer(&self, delay: Duration, callback: crate::timer::TimerCallback) -> TimerId {
        self.0.borrow_mut().timers.register(delay, callback)
    }

    /// Resolves `host:port` asynchronously on the resolver's worker thread;
    /// `cb` runs on the reactor thread once the lookup completes (or fails).
    pub fn resolve(&self, host: impl Into<String>, port: u16, cb: crate::resolver::ResolveCallback) {
        self.0.borrow_mut().resolver.resolve(host, port, cb);
    }

    /// Cancels a pending timer. Per the cancellation contract, the
    /// callback's destructor must not run synchronously here (we may be
    /// called from inside another callback's stack frame) -- so the
    /// recovered callback is posted to the deferred queue purely to be
    /// dropped there instead.
    pub fn unregister_timer(&self, id: TimerId) {
        let cb = self.0.borrow_mut().timers.unregister(id);
        if let Some(cb) = cb {
            self.post(Box::new(move |_| drop(cb)));
        }
    }

    pub(crate) fn next_token(&self) -> Token {
        let mut inner = self.0.borrow_mut();
        let token = Token(inner.next_token);
        inner.next_token += 1;
        token
    }

    // -- registry plumbing used by tcp::{connection,listener} and udp ------

    pub(crate) fn insert_connection(&self, token: Token, state: ConnectionState) -> Rc<RefCell<ConnectionState>> {
        self.0.borrow_mut().connections.insert(token, state)
    }

    pub(crate) fn insert_listener(&self, token: Token, state: ListenerState) -> Rc<RefCell<ListenerState>> {
        self.0.borrow_mut().listeners.insert(token, state)
    }

    pub(crate) fn insert_udp(&self, token: Token, state: UdpState) -> Rc<RefCell<UdpState>> {
        self.0.borrow_mut().udp_sockets.insert(token, state)
    }

    pub(crate) fn remove_connection(&self, token: Token) {
        self.0.borrow_mut().connections.remove(token);
    }

    pub(crate) fn remove_listener(&self, token: Token) {
        self.0.borrow_mut().listeners.remove(token);
    }

    pub(crate) fn remove_udp(&self, token: Token) {
        self.0.borrow_mut().udp_sockets.remove(token);
    }

    /// First-time registration of a freshly created socket that is not yet
    /// stored in a registry (e.g. the `TcpStream` for a new connect
    /// attempt, still owned on the caller's stack).
    pub(crate) fn register_connection(&self, token: Token, source: &mut impl mio::event::Source, interest: Interest) {
        let inner = self.0.borrow();
        let _ = inner.poll.registry().register(source, token, interest);
    }

    pub(crate) fn register_listener(&self, token: Token, source: &mut impl mio::event::Source, interest: Interest) {
        let inner = self.0.borrow();
        let _ = inner.poll.registry().register(source, token, interest);
    }

    pub(crate) fn register_udp(&self, token: Token, source: &mut impl mio::event::Source, interest: Interest) {
        let inner = self.0.borrow();
        let _ = inner.poll.registry().register(source, token, interest);
    }

    /// Adjusts (or drops) interest for an already-registered, already-stored
    /// socket. `None` deregisters. Falls back to `register` if `reregister`
    /// fails because the socket was never registered in the first place
    /// (a legitimate state right after a fresh bind/connect).
    pub(crate) fn reregister_connection(&self, token: Token, desired: Option<Interest>) {
        let inner = self.0.borrow();
        let Some(state_rc) = inner.connections.get(token) else { return };
        let mut state = state_rc.borrow_mut();
        let Some(source) = state.io_source() else { return };
        apply_interest(inner.poll.registry(), token, source, desired);
    }

    pub(crate) fn reregister_listener(&self, token: Token, desired: Option<Interest>) {
        let inner = self.0.borrow();
        let Some(state_rc) = inner.listeners.get(token) else { return };
        let mut state = state_rc.borrow_mut();
        let Some(source) = state.io_source() else { return };
        apply_interest(inner.poll.registry(), token, source, desired);
    }

    pub(crate) fn reregister_udp(&self, token: Token, desired: Option<Interest>) {
        let inner = self.0.borrow();
        let Some(state_rc) = inner.udp_sockets.get(token) else { return };
        let mut state = state_rc.borrow_mut();
        let Some(source) = state.io_source() else { return };
        apply_interest(inner.poll.registry(), token, source, desired);
    }

    // -- the run loop --------------------------------------------------

    pub fn run(&self, params: RunParams) -> RunOutcome {
        self.drain_to_fixed_point();

        let now = Instant::now();
        let time_to_next_timer = self.0.borrow().timers.time_to_next(now);
        let effective_timeout = match (params.timeout, time_to_next_timer) {
            (Some(caller), Some(timer)) => Some(caller.min(timer)),
            (Some(caller), None) => Some(caller),
            (None, Some(timer)) => Some(timer),
            (None, None) => None,
        };

        if params.stop_when_no_work && self.has_no_non_atomic_work() {
            return RunOutcome::NoMoreWork;
        }

        let poll_result = {
            let mut inner = self.0.borrow_mut();
            let Inner { poll, events, .. } = &mut *inner;
            poll.poll(events, effective_timeout)
        };

        if poll_result.is_err() {
            return RunOutcome::Failed;
        }

        self.dispatch_ready_events();
        self.poll_resolver();

        let atomic_work = {
            let inner = self.0.borrow();
            inner.atomic.drain()
        };
        for work in atomic_work {
            work(self);
        }

        self.drain_to_fixed_point();

        RunOutcome::Ok
    }

    pub fn run_until_no_work(&self) -> RunOutcome {
        loop {
            match self.run(RunParams { timeout: None, stop_when_no_work: true }) {
                RunOutcome::Ok => continue,
                other => return other,
            }
        }
    }

    /// Tears the reactor down without running user callbacks: every
    /// registered socket is treated as Shutdown, both deferred queues are
    /// discarded, and pending timers are dropped without firing.
    pub fn drain(&self) {
        let mut inner = self.0.borrow_mut();
        inner.listeners = Registry::new();
        inner.connections = Registry::new();
        inner.udp_sockets = Registry::new();
        inner.deferred = DeferredQueue::default();
        let far_future = Instant::now() + Duration::from_secs(3600 * 24 * 365);
        let _ = inner.timers.drain_due(far_future);
    }

    fn drain_to_fixed_point(&self) {
        for iteration in 0.. {
            if iteration >= DRAIN_FIXED_POINT_ITERATION_CAP {
                safe_panic!("reactor deferred/timer drain did not converge within {DRAIN_FIXED_POINT_ITERATION_CAP} iterations");
                break;
            }

            let now = Instant::now();
            let due = self.0.borrow_mut().timers.drain_due(now);
            let deferred_empty = self.0.borrow().deferred.is_empty();

            if due.is_empty() && deferred_empty {
                break;
            }

            for cb in due {
                cb(self);
            }

            let work = self.0.borrow_mut().deferred.drain();
            for cb in work {
                cb(self);
            }
        }
    }

    fn has_no_non_atomic_work(&self) -> bool {
        let inner = self.0.borrow();
        inner.listeners.is_empty()
            && inner.connections.is_empty()
            && inner.udp_sockets.is_empty()
            && inner.timers.is_empty()
            && inner.deferred.is_empty()
    }

    fn dispatch_ready_events(&self) {
        // Snapshot tokens + readiness first: `mio::Events` borrows `inner`
        // for its lifetime, and dispatch needs to mutate `inner` (e.g. to
        // unregister a socket mid-loop), so the two borrows cannot overlap.
        let ready: Vec<(Token, bool, bool)> = {
            let inner = self.0.borrow();
            inner
                .events
                .iter()
                .filter(|ev| ev.token() != WAKER_TOKEN)
                .map(|ev| {
                    let readable = ev.is_readable() || ev.is_read_closed() || ev.is_error();
                    let writable = ev.is_writable() || ev.is_error();
                    (ev.token(), readable, writable)
                })
                .collect()
        };

        for (token, readable, writable) in ready {
            self.dispatch_one(token, readable, writable);
        }
    }

    fn dispatch_one(&self, token: Token, readable: bool, writable: bool) {
        if let Some(state) = self.0.borrow().listeners.get(token) {
            let handle = TcpListener::from_parts(self.clone(), token, state);
            listener::dispatch(self, &handle);
            return;
        }
        if let Some(state) = self.0.borrow().connections.get(token) {
            let handle = TcpConnection::from_parts(self.clone(), token, state);
            connection::dispatch(self, &handle, readable, writable);
            return;
        }
        if let Some(state) = self.0.borrow().udp_sockets.get(token) {
            let handle = UdpSocketHandle::from_parts(self.clone(), token, state);
            udp::dispatch(&handle, readable, writable);
        }
    }

    fn poll_resolver(&self) {
        let ready = self.0.borrow_mut().resolver.drain_ready();
        for (cb, status, addrs) in ready {
            cb(self, status, addrs);
        }
    }
}

fn apply_interest(
    registry: &mio::Registry,
    token: Token,
    source: &mut dyn mio::event::Source,
    desired: Option<Interest>,
) {
    match desired {
        None => {
            let _ = registry.deregister(source);
        }
        Some(interest) => {
            if registry.reregister(source, token, interest).is_err() {
                let _ = registry.register(source, token, interest);
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Only the very last handle (the reactor's own internal Rc clones
        // held by sockets do not count themselves against this check --
        // this runs once overall refcount collapses) drains for real.
        if Rc::strong_count(&self.0) == 1 {
            self.drain();
        }
    }
}
