//! End-to-end runtime scenarios.
//!
//! All tests in this file share one runtime: the scheduler is
//! initialized once and its event loop runs on a dedicated thread for
//! the life of the test process. Shutdown behavior has its own test
//! binary (`shutdown.rs`) so it can tear the runtime down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, Once};
use std::time::{Duration, Instant};
use strand::{channel, go, sleep, FiberCondition, FiberMutex, RuntimeConfig, Scheduler, WaitGroup};

fn ensure_runtime() {
    static START: Once = Once::new();
    START.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        Scheduler::init(RuntimeConfig::new().num_consumers(4).timer_tick_ms(100))
            .expect("runtime init");
        std::thread::spawn(|| Scheduler::get().run());
    });
}

/// Run `f` on a fiber and wait (on the test thread) for its result.
fn run_fiber<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    ensure_runtime();
    let (tx, rx) = mpsc::channel();
    go(move || {
        let _ = tx.send(f());
    })
    .expect("spawn fiber");
    rx.recv_timeout(Duration::from_secs(60))
        .expect("fiber did not complete in time")
}

/// S1: producer-consumer over a rendezvous-capacity channel.
#[test]
fn producer_consumer_channel() {
    let received = run_fiber(|| {
        const SENDERS: usize = 4;
        const RECEIVERS: usize = 4;
        const PER_SENDER: i32 = 250;

        let ch = channel::<i32>(0);
        let senders = Arc::new(WaitGroup::new());
        let receivers = Arc::new(WaitGroup::new());
        let received = Arc::new(Mutex::new(Vec::new()));

        senders.add(SENDERS as i64).unwrap();
        for _ in 0..SENDERS {
            let ch = Arc::clone(&ch);
            let senders = Arc::clone(&senders);
            go(move || {
                for value in 0..PER_SENDER {
                    ch.send(value).unwrap();
                }
                senders.done().unwrap();
            })
            .unwrap();
        }

        receivers.add(RECEIVERS as i64).unwrap();
        for _ in 0..RECEIVERS {
            let ch = Arc::clone(&ch);
            let receivers = Arc::clone(&receivers);
            let received = Arc::clone(&received);
            go(move || {
                loop {
                    match ch.recv() {
                        Ok(value) => received.lock().unwrap().push(value),
                        Err(_) => break, // closed and drained
                    }
                }
                receivers.done().unwrap();
            })
            .unwrap();
        }

        senders.wait().unwrap();
        ch.close();
        receivers.wait().unwrap();

        let received = received.lock().unwrap().clone();
        received
    });

    assert_eq!(received.len(), 1000);
    let mut counts = [0usize; 250];
    for value in received {
        counts[value as usize] += 1;
    }
    // Multiset: each of 0..249, four times
    assert!(counts.iter().all(|&c| c == 4));
}

/// S2: sleep(500) lands within two timer ticks of the deadline.
#[test]
fn sleep_precision() {
    let elapsed = run_fiber(|| {
        let start = Instant::now();
        sleep(500);
        start.elapsed()
    });

    assert!(
        elapsed >= Duration::from_millis(490),
        "woke early: {:?}",
        elapsed
    );
    assert!(
        elapsed <= Duration::from_millis(800),
        "woke late: {:?}",
        elapsed
    );
}

/// S3: a read with a timeout returns TimedOut, and the fd still works
/// afterwards (no leaked reactor registration).
#[test]
fn io_timeout_then_reuse() {
    run_fiber(|| {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let mut buf = [0u8; 16];
        let start = Instant::now();
        let result = strand::io::read(read_fd, &mut buf, 200);
        let elapsed = start.elapsed();

        assert_eq!(result, Err(strand::IoError::TimedOut));
        assert!(
            elapsed >= Duration::from_millis(150) && elapsed <= Duration::from_millis(600),
            "timeout fired at {:?}",
            elapsed
        );

        // The fd must still be usable
        let payload = b"after-timeout";
        let wrote = unsafe {
            libc::write(
                write_fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(wrote, payload.len() as isize);

        let n = strand::io::read(read_fd, &mut buf, 1000).unwrap();
        assert_eq!(&buf[..n], payload);

        strand::io::close(write_fd).unwrap();
        strand::io::close(read_fd).unwrap();
    });
}

/// S4: 16 fibers hammer one mutex; nothing is lost and nobody starves.
#[test]
fn mutex_under_load() {
    let total = run_fiber(|| {
        const FIBERS: usize = 16;
        const ITERS: usize = 10_000;

        let counter = Arc::new(FiberMutex::new(0u64));
        let wg = Arc::new(WaitGroup::new());

        wg.add(FIBERS as i64).unwrap();
        for _ in 0..FIBERS {
            let counter = Arc::clone(&counter);
            let wg = Arc::clone(&wg);
            go(move || {
                for _ in 0..ITERS {
                    *counter.lock().unwrap() += 1;
                }
                wg.done().unwrap();
            })
            .unwrap();
        }

        wg.wait().unwrap();
        let total = *counter.lock().unwrap();
        total
    });

    assert_eq!(total, 160_000);
}

/// S5: wait group releases only after every fiber finished.
#[test]
fn wait_group_gathers_all() {
    run_fiber(|| {
        const FIBERS: usize = 100;

        let wg = Arc::new(WaitGroup::new());
        let finished = Arc::new(AtomicU64::new(0));

        wg.add(FIBERS as i64).unwrap();
        for i in 0..FIBERS {
            let wg = Arc::clone(&wg);
            let finished = Arc::clone(&finished);
            go(move || {
                sleep((i as u64 * 7) % 50);
                finished.fetch_add(1, Ordering::SeqCst);
                wg.done().unwrap();
            })
            .unwrap();
        }

        wg.wait().unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), FIBERS as u64);
        assert_eq!(wg.count(), 0);
    });
}

/// Voluntary yields interleave without losing the fiber.
#[test]
fn yield_round_trip() {
    let hops = run_fiber(|| {
        let mut hops = 0;
        for _ in 0..10 {
            strand::yield_now();
            hops += 1;
        }
        hops
    });
    assert_eq!(hops, 10);
}

/// Condition variable: notify wakes, timeout reports itself.
#[test]
fn condition_wait_for() {
    run_fiber(|| {
        let pair = Arc::new((FiberMutex::new(false), FiberCondition::new()));

        // Timeout path: nobody notifies
        {
            let (mutex, cond) = &*pair;
            let guard = mutex.lock().unwrap();
            let start = Instant::now();
            let (_guard, notified) = cond.wait_for(guard, 150).unwrap();
            assert!(!notified, "nothing notified this waiter");
            assert!(start.elapsed() >= Duration::from_millis(80));
        }

        // Notify path
        {
            let notifier = Arc::clone(&pair);
            go(move || {
                sleep(50);
                let (mutex, cond) = &*notifier;
                *mutex.lock().unwrap() = true;
                cond.notify_one();
            })
            .unwrap();

            let (mutex, cond) = &*pair;
            let mut guard = mutex.lock().unwrap();
            let mut notified = true;
            while !*guard {
                let (next, was_notify) = cond.wait_for(guard, 5000).unwrap();
                guard = next;
                notified = was_notify;
            }
            assert!(notified, "the wake should have come from notify_one");
        }
    });
}

/// Fibers spawned from fibers inherit the spawner's consumer (sticky
/// affinity placement rule 2); everything still completes.
#[test]
fn nested_spawn_completes() {
    let value = run_fiber(|| {
        let ch = channel::<i32>(1);
        let sender = Arc::clone(&ch);
        go(move || {
            sender.send(1234).unwrap();
        })
        .unwrap();
        ch.recv().unwrap()
    });
    assert_eq!(value, 1234);
}

/// Full TCP loopback: a server fiber accepts, a client fiber connects
/// through the in-progress wait, and an echo round-trips.
#[test]
fn tcp_loopback_echo() {
    run_fiber(|| {
        let listener = strand::FiberListener::bind(0).unwrap();
        let port = listener.local_port().unwrap();

        let server_done = Arc::new(WaitGroup::new());
        server_done.add(1).unwrap();
        let done = Arc::clone(&server_done);
        go(move || {
            let stream = listener.accept(5000).unwrap();
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf, 5000).unwrap();
            stream.write_all(&buf, 5000).unwrap();
            done.done().unwrap();
        })
        .unwrap();

        let client =
            strand::FiberStream::connect(std::net::Ipv4Addr::LOCALHOST, port, 5000).unwrap();
        client.write_all(b"ping over fibers", 5000).unwrap();

        let mut echo = [0u8; 16];
        client.read_exact(&mut echo, 5000).unwrap();
        assert_eq!(&echo, b"ping over fibers");

        server_done.wait().unwrap();
    });
}

/// Vectored write lands intact and an edge-triggered read drains it in
/// one call.
#[test]
fn writev_then_et_read() {
    run_fiber(|| {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let parts = [
            std::io::IoSlice::new(b"edge-"),
            std::io::IoSlice::new(b"triggered"),
        ];
        let wrote = strand::io::writev(write_fd, &parts, 1000).unwrap();
        assert_eq!(wrote, 14);

        let mut buf = [0u8; 64];
        let n = strand::io::read_et(read_fd, &mut buf, 1000).unwrap();
        assert_eq!(&buf[..n], b"edge-triggered");

        strand::io::close(write_fd).unwrap();
        // A drained, writer-closed pipe reads EOF
        let n = strand::io::read(read_fd, &mut buf, 1000).unwrap();
        assert_eq!(n, 0);
        strand::io::close(read_fd).unwrap();
    });
}

/// A panicking fiber is contained; the runtime keeps serving others.
#[test]
fn fiber_panic_is_contained() {
    ensure_runtime();
    go(|| panic!("intentional fiber panic")).unwrap();

    let value = run_fiber(|| {
        sleep(50);
        7
    });
    assert_eq!(value, 7);
}
