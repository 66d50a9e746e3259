//! evline — callback-driven evented I/O for Linux.
//!
//! evline offers non-blocking TCP sockets (optionally TLS via rustls), a
//! TCP listener, and pseudo-asynchronous file I/O, all dispatched by a
//! single-threaded [`EventLoop`]. Applications implement per-object handler
//! traits; the loop converts epoll readiness, timer expiry, and thread-pool
//! completions into serialized callbacks. TLS handshake, record, and
//! shutdown traffic is interleaved transparently with the plaintext read
//! and write queues.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::time::Duration;
//!
//! use evline::{
//!     Accepted, EventLoop, ServerCtx, ServerHandler, SocketCtx, SocketHandler, SocketOptions,
//! };
//!
//! struct Echo;
//!
//! impl SocketHandler for Echo {
//!     fn on_connect(&mut self, sock: &mut SocketCtx<'_>) {
//!         sock.read_start();
//!     }
//!     fn on_read(&mut self, sock: &mut SocketCtx<'_>, data: &[u8]) {
//!         if data.is_empty() {
//!             sock.close();
//!         } else {
//!             let _ = sock.write_simple(data);
//!         }
//!     }
//! }
//!
//! struct Listener;
//!
//! impl ServerHandler for Listener {
//!     fn on_connection(&mut self, _srv: &mut ServerCtx<'_>, _peer: SocketAddr) -> Option<Accepted> {
//!         Some(Accepted {
//!             options: SocketOptions::new().timeout(Duration::from_secs(60)),
//!             handler: Box::new(Echo),
//!         })
//!     }
//! }
//!
//! fn main() -> Result<(), evline::Error> {
//!     let mut evloop = EventLoop::new()?;
//!     evloop.listen("127.0.0.1:7878".parse().unwrap(), 128, Box::new(Listener))?;
//!     evloop.run()
//! }
//! ```
//!
//! # Model
//!
//! Every object lives inside the loop and is addressed by a token. All
//! callbacks run on the loop thread, strictly serialized per object;
//! `on_close` is always last, always deferred to a fresh turn, and the
//! handler is dropped right after it returns. Write buffers are owned
//! [`WriteBuf`] values released exactly once regardless of outcome. File
//! operations run as tasks on a worker [`ThreadPool`] and complete back on
//! the loop thread.
//!
//! # Platform
//!
//! Linux only (epoll, eventfd, accept4).

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod event_loop;
pub(crate) mod file;
pub(crate) mod poll;
pub(crate) mod pool;
pub(crate) mod server;
pub(crate) mod socket;
pub(crate) mod timer;
pub(crate) mod tls;

// ── Public modules ──────────────────────────────────────────────────────
pub mod buffer;
pub mod error;
pub mod handler;
pub mod metrics;

// ── Re-exports: loop ────────────────────────────────────────────────────

/// The event-dispatch engine owning all sockets, listeners, and files.
pub use event_loop::EventLoop;
/// Thread-safe handle that stops a running loop.
pub use event_loop::ShutdownHandle;

// ── Re-exports: handler surface ─────────────────────────────────────────

/// Accept-hook result: options plus handler for the new socket.
pub use handler::Accepted;
/// Callbacks a file may emit.
pub use handler::FileHandler;
/// Opaque handle to a file.
pub use handler::FileToken;
/// Callbacks a listener may emit.
pub use handler::ServerHandler;
/// Opaque handle to a listener.
pub use handler::ServerToken;
/// Callbacks a socket may emit.
pub use handler::SocketHandler;
/// Opaque handle to a socket.
pub use handler::SocketToken;

// ── Re-exports: per-object operations ───────────────────────────────────

/// Operations on a live file.
pub use file::FileCtx;
/// Operations on a live listener.
pub use server::ServerCtx;
/// Operations on a live socket.
pub use socket::SocketCtx;
/// Options fixed at socket creation.
pub use socket::SocketOptions;
/// Default maximum bytes per `on_read` delivery.
pub use socket::DEFAULT_CHUNK_SIZE;

// ── Re-exports: shared types ────────────────────────────────────────────

/// Owned write payload, released exactly once.
pub use buffer::WriteBuf;
/// Release-on-drop hook for caller-owned payloads.
pub use buffer::WriteGuard;
/// Errors produced by the loop and its objects.
pub use error::Error;
/// Worker pool executing blocking file syscalls.
pub use pool::ThreadPool;
/// Caller-built TLS session handed to a socket.
pub use tls::TlsSession;
