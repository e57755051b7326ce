//! `Handle::post_atomic`, called from another thread, must wake a reactor
//! blocked in `run` with a long timeout, rather than waiting the timeout
//! out. `Reactor` itself is `Rc`-backed and cannot cross threads -- this is
//! exactly why `Handle` exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use net_core::{Reactor, RunParams};

#[test]
fn post_atomic_wakes_a_blocked_run() {
    let reactor = Reactor::new().expect("reactor");
    let ran = Arc::new(AtomicBool::new(false));

    let poster_handle = reactor.handle();
    let poster_ran = ran.clone();
    let poster = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        poster_handle.post_atomic(Box::new(move |_reactor| {
            poster_ran.store(true, Ordering::SeqCst);
        }));
    });

    let started = Instant::now();
    reactor.run(RunParams { timeout: Some(Duration::from_secs(30)), stop_when_no_work: false });
    let elapsed = started.elapsed();

    poster.join().unwrap();
    assert!(ran.load(Ordering::SeqCst), "atomic work should have run");
    assert!(
        elapsed < Duration::from_secs(5),
        "waker should have returned the blocked poll promptly, took {elapsed:?}"
    );
}
