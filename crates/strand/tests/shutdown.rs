//! S6: reactor shutdown wakes every blocked fiber.
//!
//! This test owns its process: it initializes the runtime, parks fibers
//! in `accept`, stops the scheduler, and verifies nothing stays BLOCKED.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand::{go, FiberListener, RuntimeConfig, Scheduler};

#[test]
fn stop_wakes_blocked_acceptors() {
    let _ = env_logger::builder().is_test(true).try_init();
    Scheduler::init(RuntimeConfig::new().num_consumers(2)).expect("runtime init");
    let driver = std::thread::spawn(|| Scheduler::get().run());

    const ACCEPTORS: usize = 10;
    let returned = Arc::new(AtomicUsize::new(0));

    for _ in 0..ACCEPTORS {
        let listener = FiberListener::bind(0).expect("bind");
        let returned = Arc::clone(&returned);
        go(move || {
            // No client ever connects; only shutdown can end this wait
            let result = listener.accept(-1);
            assert!(result.is_err(), "accept had no client to return");
            returned.fetch_add(1, Ordering::SeqCst);
        })
        .expect("spawn acceptor");
    }

    // Let every acceptor reach the parked state
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(returned.load(Ordering::SeqCst), 0, "nobody should be awake yet");

    Scheduler::get().stop();
    driver.join().expect("driver thread");

    // run() returns only after consumers were joined and residual fibers
    // drained, so every acceptor has observed its cancellation
    assert_eq!(returned.load(Ordering::SeqCst), ACCEPTORS);
}
