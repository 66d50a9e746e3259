//! Integration tests: thread-pool-backed file I/O.
//!
//! Each test drives the loop on the test thread with an isolated pool, so
//! runs never contend on the process-wide worker set.

use std::io::Read;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use evline::{
    EventLoop, FileCtx, FileHandler, SocketCtx, SocketHandler, SocketOptions, ThreadPool,
    WriteBuf, WriteGuard,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("evline-test-{tag}-{}", std::process::id()))
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn test_loop() -> EventLoop {
    EventLoop::with_pool(ThreadPool::new(2)).unwrap()
}

fn drive(evloop: &mut EventLoop, deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > deadline {
            panic!("condition not reached within {deadline:?}");
        }
        evloop.run_once(Some(Duration::from_millis(20))).unwrap();
    }
}

struct CountingGuard {
    data: Vec<u8>,
    released: Arc<AtomicUsize>,
}

impl WriteGuard for CountingGuard {
    fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for CountingGuard {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Chunked reads ───────────────────────────────────────────────────

#[test]
fn read_one_mebibyte_in_4k_chunks() {
    const FILE_SIZE: usize = 1 << 20;
    const CHUNK: usize = 4096;

    struct Reader {
        sizes: Arc<Mutex<Vec<usize>>>,
        data: Arc<Mutex<Vec<u8>>>,
        closes: Arc<AtomicUsize>,
    }

    impl FileHandler for Reader {
        fn on_open(&mut self, file: &mut FileCtx<'_>) {
            file.read_start(CHUNK).unwrap();
        }
        fn on_read(&mut self, file: &mut FileCtx<'_>, data: &[u8]) {
            if data.is_empty() {
                // End of file after the full sweep.
                file.close();
                return;
            }
            self.sizes.lock().unwrap().push(data.len());
            self.data.lock().unwrap().extend_from_slice(data);
        }
        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let path = temp_path("read-1m");
    let contents = pattern(FILE_SIZE);
    std::fs::write(&path, &contents).unwrap();

    let sizes = Arc::new(Mutex::new(Vec::new()));
    let data = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(AtomicUsize::new(0));

    let mut evloop = test_loop();
    let token = evloop
        .file(Box::new(Reader {
            sizes: sizes.clone(),
            data: data.clone(),
            closes: closes.clone(),
        }))
        .unwrap();
    evloop
        .file_ctx(token)
        .unwrap()
        .open_path(&path, libc::O_RDONLY, 0)
        .unwrap();

    drive(&mut evloop, Duration::from_secs(30), || {
        closes.load(Ordering::SeqCst) == 1
    });

    let sizes = sizes.lock().unwrap();
    assert_eq!(sizes.len(), FILE_SIZE / CHUNK);
    assert!(sizes.iter().all(|&n| n == CHUNK));
    assert_eq!(&*data.lock().unwrap(), &contents);

    std::fs::remove_file(&path).ok();
}

// ── Writes and drain ────────────────────────────────────────────────

#[test]
fn write_queue_drains_in_order() {
    struct Writer {
        released: Arc<AtomicUsize>,
        drains: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl FileHandler for Writer {
        fn on_open(&mut self, file: &mut FileCtx<'_>) {
            file.write_simple(b"alpha ").unwrap();
            file.write_simple(b"beta ").unwrap();
            file.write(WriteBuf::from_guard(CountingGuard {
                data: b"gamma".to_vec(),
                released: self.released.clone(),
            }))
            .unwrap();
        }
        fn on_drain(&mut self, file: &mut FileCtx<'_>) {
            self.drains.fetch_add(1, Ordering::SeqCst);
            file.close();
        }
        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let path = temp_path("write-order");
    let released = Arc::new(AtomicUsize::new(0));
    let drains = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let mut evloop = test_loop();
    let token = evloop
        .file(Box::new(Writer {
            released: released.clone(),
            drains: drains.clone(),
            closes: closes.clone(),
        }))
        .unwrap();
    evloop
        .file_ctx(token)
        .unwrap()
        .open_path(
            &path,
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            0o644,
        )
        .unwrap();

    drive(&mut evloop, Duration::from_secs(10), || {
        closes.load(Ordering::SeqCst) == 1
    });

    assert_eq!(drains.load(Ordering::SeqCst), 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(&path).unwrap(), b"alpha beta gamma");

    std::fs::remove_file(&path).ok();
}

// ── Errors ──────────────────────────────────────────────────────────

#[test]
fn open_missing_path_reports_error() {
    struct MissingFile {
        errno: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl FileHandler for MissingFile {
        fn on_open(&mut self, _file: &mut FileCtx<'_>) {
            panic!("open of a missing path must not succeed");
        }
        fn on_error(&mut self, file: &mut FileCtx<'_>, err: &evline::Error) {
            self.errno
                .store(err.os_error().unwrap_or(0) as usize, Ordering::SeqCst);
            file.close();
        }
        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let errno = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let mut evloop = test_loop();
    let token = evloop
        .file(Box::new(MissingFile {
            errno: errno.clone(),
            closes: closes.clone(),
        }))
        .unwrap();
    evloop
        .file_ctx(token)
        .unwrap()
        .open_path("/nonexistent/evline-missing", libc::O_RDONLY, 0)
        .unwrap();

    drive(&mut evloop, Duration::from_secs(10), || {
        closes.load(Ordering::SeqCst) == 1
    });
    assert_eq!(errno.load(Ordering::SeqCst), libc::ENOENT as usize);
}

// ── Standard descriptors ────────────────────────────────────────────

#[test]
fn stdout_handle_opens_and_closes() {
    struct Stdout {
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl FileHandler for Stdout {
        fn on_open(&mut self, file: &mut FileCtx<'_>) {
            self.opens.fetch_add(1, Ordering::SeqCst);
            assert!(file.is_open());
            file.close();
        }
        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let opens = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let mut evloop = test_loop();
    let token = evloop
        .file(Box::new(Stdout {
            opens: opens.clone(),
            closes: closes.clone(),
        }))
        .unwrap();
    evloop.file_ctx(token).unwrap().open_stdout().unwrap();

    drive(&mut evloop, Duration::from_secs(10), || {
        closes.load(Ordering::SeqCst) == 1
    });
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}

// ── Detach ──────────────────────────────────────────────────────────

#[test]
fn detach_discards_without_close_callback() {
    struct Detached {
        closes: Arc<AtomicUsize>,
    }

    impl FileHandler for Detached {
        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let closes = Arc::new(AtomicUsize::new(0));

    let mut evloop = test_loop();
    let token = evloop
        .file(Box::new(Detached {
            closes: closes.clone(),
        }))
        .unwrap();
    evloop.file_ctx(token).unwrap().detach();

    let start = Instant::now();
    while evloop.is_active() && start.elapsed() < Duration::from_secs(5) {
        evloop.run_once(Some(Duration::from_millis(10))).unwrap();
    }
    assert!(!evloop.is_active());
    assert_eq!(closes.load(Ordering::SeqCst), 0);
    assert!(evloop.file_ctx(token).is_none());
}

// ── File → socket transfer ──────────────────────────────────────────

#[test]
fn send_streams_file_through_socket_queue() {
    const FILE_SIZE: usize = 256 * 1024;

    struct SendFile {
        open: Arc<AtomicBool>,
        done: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl FileHandler for SendFile {
        fn on_open(&mut self, _file: &mut FileCtx<'_>) {
            self.open.store(true, Ordering::SeqCst);
        }
        fn on_drain(&mut self, file: &mut FileCtx<'_>) {
            // The whole transfer has entered the socket.
            self.done.fetch_add(1, Ordering::SeqCst);
            file.close();
        }
        fn on_error(&mut self, _file: &mut FileCtx<'_>, err: &evline::Error) {
            panic!("send failed: {err}");
        }
        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Outbound {
        open: Arc<AtomicBool>,
        closes: Arc<AtomicUsize>,
    }

    impl SocketHandler for Outbound {
        fn on_connect(&mut self, _sock: &mut SocketCtx<'_>) {
            self.open.store(true, Ordering::SeqCst);
        }
        fn on_read(&mut self, _sock: &mut SocketCtx<'_>, _data: &[u8]) {}
        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let path = temp_path("sendfile");
    let contents = pattern(FILE_SIZE);
    std::fs::write(&path, &contents).unwrap();

    // Collecting peer: read everything until EOF.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let collector = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        received
    });

    let file_open = Arc::new(AtomicBool::new(false));
    let sock_open = Arc::new(AtomicBool::new(false));
    let send_done = Arc::new(AtomicUsize::new(0));
    let file_closes = Arc::new(AtomicUsize::new(0));
    let sock_closes = Arc::new(AtomicUsize::new(0));

    let mut evloop = test_loop();
    let sock_token = evloop
        .connect(
            addr,
            SocketOptions::new(),
            Box::new(Outbound {
                open: sock_open.clone(),
                closes: sock_closes.clone(),
            }),
        )
        .unwrap();
    let file_token = evloop
        .file(Box::new(SendFile {
            open: file_open.clone(),
            done: send_done.clone(),
            closes: file_closes.clone(),
        }))
        .unwrap();
    evloop
        .file_ctx(file_token)
        .unwrap()
        .open_path(&path, libc::O_RDONLY, 0)
        .unwrap();

    let mut sent = false;
    let start = Instant::now();
    while file_closes.load(Ordering::SeqCst) == 0 {
        assert!(start.elapsed() < Duration::from_secs(30), "transfer stalled");
        evloop.run_once(Some(Duration::from_millis(20))).unwrap();
        if !sent && file_open.load(Ordering::SeqCst) && sock_open.load(Ordering::SeqCst) {
            evloop
                .file_ctx(file_token)
                .unwrap()
                .send(sock_token, Some(0), None)
                .unwrap();
            sent = true;
        }
    }
    assert_eq!(send_done.load(Ordering::SeqCst), 1);

    // Close the socket; its queue is already drained.
    if let Some(mut sock) = evloop.socket(sock_token) {
        sock.close();
    }
    drive(&mut evloop, Duration::from_secs(10), || {
        sock_closes.load(Ordering::SeqCst) == 1
    });

    let received = collector.join().unwrap();
    assert_eq!(received.len(), FILE_SIZE);
    assert_eq!(received, contents);

    std::fs::remove_file(&path).ok();
}

// ── Bounded send ────────────────────────────────────────────────────

#[test]
fn send_honors_requested_length() {
    const FILE_SIZE: usize = 100 * 1024;
    const SEND_LEN: u64 = 70 * 1024;

    struct BoundedSend {
        done: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl FileHandler for BoundedSend {
        fn on_drain(&mut self, file: &mut FileCtx<'_>) {
            self.done.fetch_add(1, Ordering::SeqCst);
            file.close();
        }
        fn on_error(&mut self, _file: &mut FileCtx<'_>, err: &evline::Error) {
            panic!("send failed: {err}");
        }
        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Quiet {
        closes: Arc<AtomicUsize>,
    }

    impl SocketHandler for Quiet {
        fn on_read(&mut self, _sock: &mut SocketCtx<'_>, _data: &[u8]) {}
        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let path = temp_path("send-bounded");
    let contents = pattern(FILE_SIZE);
    std::fs::write(&path, &contents).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let collector = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        received
    });

    let send_done = Arc::new(AtomicUsize::new(0));
    let file_closes = Arc::new(AtomicUsize::new(0));
    let sock_closes = Arc::new(AtomicUsize::new(0));

    let mut evloop = test_loop();
    let sock_token = evloop
        .connect(
            addr,
            SocketOptions::new(),
            Box::new(Quiet {
                closes: sock_closes.clone(),
            }),
        )
        .unwrap();
    let file_token = evloop
        .file(Box::new(BoundedSend {
            done: send_done.clone(),
            closes: file_closes.clone(),
        }))
        .unwrap();
    evloop
        .file_ctx(file_token)
        .unwrap()
        .open_path(&path, libc::O_RDONLY, 0)
        .unwrap();

    // Wait for open, then stream exactly SEND_LEN bytes.
    let mut sent = false;
    let start = Instant::now();
    while file_closes.load(Ordering::SeqCst) == 0 {
        assert!(start.elapsed() < Duration::from_secs(30), "transfer stalled");
        evloop.run_once(Some(Duration::from_millis(20))).unwrap();
        if !sent {
            if let Some(mut file) = evloop.file_ctx(file_token) {
                if file.is_open() {
                    file.send(sock_token, Some(0), Some(SEND_LEN)).unwrap();
                    sent = true;
                }
            }
        }
    }
    assert_eq!(send_done.load(Ordering::SeqCst), 1);

    if let Some(mut sock) = evloop.socket(sock_token) {
        sock.close();
    }
    drive(&mut evloop, Duration::from_secs(10), || {
        sock_closes.load(Ordering::SeqCst) == 1
    });

    let received = collector.join().unwrap();
    assert_eq!(received.len(), SEND_LEN as usize);
    assert_eq!(received, contents[..SEND_LEN as usize]);

    std::fs::remove_file(&path).ok();
}
