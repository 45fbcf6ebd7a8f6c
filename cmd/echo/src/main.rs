//! Fiber-per-connection TCP echo server
//!
//! ```text
//! STRAND_ECHO_PORT=9000 cargo run --bin echo
//! printf 'hello\n' | nc 127.0.0.1 9000
//! ```
//!
//! Every accepted connection gets its own fiber; the accept loop and all
//! connection fibers share the worker pool.

use strand::{fiber_main, go, FiberListener, FiberStream};

fn handle(stream: FiberStream) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf, -1) {
            Ok(0) => break, // peer closed
            Ok(n) => {
                if let Err(err) = stream.write_all(&buf[..n], -1) {
                    log::warn!("write failed: {}", err);
                    break;
                }
            }
            Err(err) => {
                log::warn!("read failed: {}", err);
                break;
            }
        }
    }
}

fiber_main!({
    env_logger::init();

    let port: u16 = std::env::var("STRAND_ECHO_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(9000);

    let listener = match FiberListener::bind(port) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("bind failed on port {}: {}", port, err);
            return 1;
        }
    };
    println!("echo listening on 0.0.0.0:{}", port);

    loop {
        match listener.accept(-1) {
            Ok(stream) => {
                go(move || handle(stream)).expect("spawn connection fiber");
            }
            Err(err) => {
                log::error!("accept failed: {}", err);
                return 1;
            }
        }
    }
});
