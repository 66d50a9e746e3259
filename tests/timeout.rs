//! Integration tests: the inactivity timer.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use evline::{EventLoop, SocketCtx, SocketHandler, SocketOptions};

struct IdleWatcher {
    timeouts: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl SocketHandler for IdleWatcher {
    fn on_connect(&mut self, sock: &mut SocketCtx<'_>) {
        // An armed read side makes the socket timer-eligible.
        sock.read_start();
    }
    fn on_read(&mut self, _sock: &mut SocketCtx<'_>, _data: &[u8]) {}
    fn on_timeout(&mut self, sock: &mut SocketCtx<'_>) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
        sock.close();
    }
    fn on_close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Accept and hold the connection open without ever writing.
fn silent_server() -> (std::net::SocketAddr, thread::JoinHandle<()>, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let release = Arc::new(AtomicUsize::new(0));
    let flag = release.clone();
    let join = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        while flag.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(10));
        }
        drop(stream);
    });
    (addr, join, release)
}

#[test]
fn idle_socket_times_out_once_then_closes() {
    let (addr, join, release) = silent_server();

    let timeouts = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let mut evloop = EventLoop::new().unwrap();
    evloop
        .connect(
            addr,
            SocketOptions::new().timeout(Duration::from_millis(500)),
            Box::new(IdleWatcher {
                timeouts: timeouts.clone(),
                closes: closes.clone(),
            }),
        )
        .unwrap();

    let start = Instant::now();
    // The handler closes on timeout, so the loop drains by itself.
    evloop.run().unwrap();
    let elapsed = start.elapsed();

    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(
        elapsed >= Duration::from_millis(450),
        "timer fired after only {elapsed:?}"
    );

    release.store(1, Ordering::SeqCst);
    join.join().unwrap();
}

#[test]
fn activity_defers_the_timer() {
    struct Trickled {
        timeouts: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl SocketHandler for Trickled {
        fn on_connect(&mut self, sock: &mut SocketCtx<'_>) {
            sock.read_start();
        }
        fn on_read(&mut self, _sock: &mut SocketCtx<'_>, _data: &[u8]) {}
        fn on_timeout(&mut self, sock: &mut SocketCtx<'_>) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
            sock.close();
        }
        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let feeder = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // Five beats well inside the 400ms timeout, then silence.
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(100));
            if stream.write_all(b"x").is_err() {
                return;
            }
        }
    });

    let timeouts = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let mut evloop = EventLoop::new().unwrap();
    evloop
        .connect(
            addr,
            SocketOptions::new().timeout(Duration::from_millis(400)),
            Box::new(Trickled {
                timeouts: timeouts.clone(),
                closes: closes.clone(),
            }),
        )
        .unwrap();

    let start = Instant::now();
    evloop.run().unwrap();
    let elapsed = start.elapsed();

    feeder.join().unwrap();
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    // Progress kept the timer quiet through the trickle phase.
    assert!(
        elapsed >= Duration::from_millis(850),
        "timer fired during activity, after {elapsed:?}"
    );
}

#[test]
fn zero_timeout_disables_the_timer() {
    let (addr, join, release) = silent_server();

    let timeouts = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let mut evloop = EventLoop::new().unwrap();
    let token = evloop
        .connect(
            addr,
            SocketOptions::new(),
            Box::new(IdleWatcher {
                timeouts: timeouts.clone(),
                closes: closes.clone(),
            }),
        )
        .unwrap();

    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(700) {
        evloop.run_once(Some(Duration::from_millis(50))).unwrap();
    }
    assert_eq!(timeouts.load(Ordering::SeqCst), 0);

    evloop.socket(token).unwrap().close();
    while evloop.is_active() {
        evloop.run_once(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    release.store(1, Ordering::SeqCst);
    join.join().unwrap();
}

#[test]
fn reset_timeout_rearms_from_now() {
    struct Resetter {
        timeouts: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl SocketHandler for Resetter {
        fn on_connect(&mut self, sock: &mut SocketCtx<'_>) {
            sock.read_start();
        }
        fn on_read(&mut self, _sock: &mut SocketCtx<'_>, _data: &[u8]) {}
        fn on_timeout(&mut self, sock: &mut SocketCtx<'_>) {
            let n = self.timeouts.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // First expiry: grant one more period.
                sock.reset_timeout();
            } else {
                sock.close();
            }
        }
        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let (addr, join, release) = silent_server();

    let timeouts = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let mut evloop = EventLoop::new().unwrap();
    evloop
        .connect(
            addr,
            SocketOptions::new().timeout(Duration::from_millis(300)),
            Box::new(Resetter {
                timeouts: timeouts.clone(),
                closes: closes.clone(),
            }),
        )
        .unwrap();

    let start = Instant::now();
    evloop.run().unwrap();
    let elapsed = start.elapsed();

    assert_eq!(timeouts.load(Ordering::SeqCst), 2);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(
        elapsed >= Duration::from_millis(550),
        "second expiry arrived too early: {elapsed:?}"
    );

    release.store(1, Ordering::SeqCst);
    join.join().unwrap();
}
