//! Channel pipeline example
//!
//! Four producer fibers feed one bounded channel; four consumer fibers
//! drain it until close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strand::{channel, fiber_main, go, WaitGroup};

fiber_main!({
    env_logger::init();
    println!("=== strand channel example ===");

    let ch = channel::<u64>(8);
    let producers = Arc::new(WaitGroup::new());
    let consumers = Arc::new(WaitGroup::new());
    let sum = Arc::new(AtomicU64::new(0));

    producers.add(4).unwrap();
    for p in 0..4u64 {
        let ch = Arc::clone(&ch);
        let producers = Arc::clone(&producers);
        go(move || {
            for i in 0..100 {
                ch.send(p * 1000 + i).unwrap();
            }
            println!("[producer {}] done", p);
            producers.done().unwrap();
        })
        .unwrap();
    }

    consumers.add(4).unwrap();
    for c in 0..4 {
        let ch = Arc::clone(&ch);
        let consumers = Arc::clone(&consumers);
        let sum = Arc::clone(&sum);
        go(move || {
            let mut count = 0;
            while let Ok(value) = ch.recv() {
                sum.fetch_add(value, Ordering::Relaxed);
                count += 1;
            }
            println!("[consumer {}] received {} values", c, count);
            consumers.done().unwrap();
        })
        .unwrap();
    }

    producers.wait().unwrap();
    ch.close();
    consumers.wait().unwrap();

    println!("sum of all received values: {}", sum.load(Ordering::Relaxed));
    0
});
