use std::collections::VecDeque;
use std::io::{self, Write as _};
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::buffer::WriteBuf;
use crate::error::Error;
use crate::event_loop::{Deferred, Owner};
use crate::handler::{FileToken, SocketHandler, SocketToken};
use crate::metrics;
use crate::poll::{Poller, WatchKey, WatchKind};
use crate::timer::{TimerId, TimerOwner, TimerTable};
use crate::tls::{FdIo, Tls, TlsSession};

/// Default maximum bytes moved per read into the scratch buffer.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Options fixed at socket creation.
///
/// Handed to [`connect`](crate::EventLoop::connect) or returned from a
/// server's `on_connection` hook inside [`Accepted`](crate::Accepted).
pub struct SocketOptions {
    pub(crate) timeout: Duration,
    pub(crate) chunk_size: usize,
    pub(crate) tls: Option<TlsSession>,
    pub(crate) wait_for_secure_hangup: bool,
    pub(crate) tcp_nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            timeout: Duration::ZERO,
            chunk_size: DEFAULT_CHUNK_SIZE,
            tls: None,
            wait_for_secure_hangup: false,
            tcp_nodelay: false,
        }
    }
}

impl SocketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inactivity timeout. Zero (the default) disables the timer.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Maximum bytes delivered per `on_read` invocation.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Run the connection over TLS with a caller-built session.
    pub fn tls(mut self, session: TlsSession) -> Self {
        self.tls = Some(session);
        self
    }

    /// On close, wait for the peer's close_notify (or the inactivity
    /// timeout) instead of finalizing as soon as ours is flushed.
    pub fn wait_for_secure_hangup(mut self, wait: bool) -> Self {
        self.wait_for_secure_hangup = wait;
        self
    }

    /// Set TCP_NODELAY on the descriptor.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.tcp_nodelay = enable;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Outbound connect in flight, waiting for writability.
    Connecting,
    /// TLS handshake in progress (TCP established).
    Handshaking,
    Open,
    /// `write_eof` completed; our direction is shut, reads continue.
    HalfClosedWrite,
    /// `close()` requested; draining writes and/or exchanging TLS byes.
    Closing,
    /// Terminal. The deferred `on_close` is scheduled exactly once.
    Closed,
}

struct Pending {
    buf: WriteBuf,
    cursor: usize,
}

/// Per-socket state owned by the event loop.
pub(crate) struct SocketState {
    pub fd: RawFd,
    pub generation: u32,
    pub peer: Option<SocketAddr>,
    pub phase: Phase,
    pub connected: bool,
    pub handler: Option<Box<dyn SocketHandler>>,
    queue: VecDeque<Pending>,
    wrote_since_empty: bool,
    pub read_started: bool,
    got_half_close: bool,
    eof_delivered: bool,
    sent_half_close: bool,
    write_eof_requested: bool,
    pub closing: bool,
    wait_for_secure_hangup: bool,
    pub tls: Option<Tls>,
    timeout: Duration,
    timer: Option<TimerId>,
    /// The timer fired and nothing re-armed it; only genuine progress or
    /// `reset_timeout` may arm it again, never spurious readiness.
    timed_out: bool,
    chunk_size: usize,
    scratch: Vec<u8>,
    tls_plain: Vec<u8>,
    want_read: bool,
    want_write: bool,
    pub registered: bool,
    pub send_waiter: Option<FileToken>,
    close_scheduled: bool,
}

impl SocketState {
    pub(crate) fn new(
        fd: RawFd,
        peer: Option<SocketAddr>,
        generation: u32,
        options: SocketOptions,
        handler: Box<dyn SocketHandler>,
        phase: Phase,
    ) -> SocketState {
        SocketState {
            fd,
            generation,
            peer,
            phase,
            connected: false,
            handler: Some(handler),
            queue: VecDeque::new(),
            wrote_since_empty: false,
            read_started: false,
            got_half_close: false,
            eof_delivered: false,
            sent_half_close: false,
            write_eof_requested: false,
            closing: false,
            wait_for_secure_hangup: options.wait_for_secure_hangup,
            tls: options.tls.map(Tls::new),
            timeout: options.timeout,
            timer: None,
            timed_out: false,
            chunk_size: options.chunk_size.max(1),
            scratch: Vec::new(),
            tls_plain: Vec::new(),
            want_read: false,
            want_write: false,
            registered: false,
            send_waiter: None,
            close_scheduled: false,
        }
    }

    /// Record the initial epoll registration made by the loop.
    pub(crate) fn mark_registered(&mut self, read: bool, write: bool) {
        self.registered = true;
        self.want_read = read;
        self.want_write = write;
    }
}

/// Operations on a live socket, handed to callbacks and available through
/// [`EventLoop::socket`](crate::EventLoop::socket).
///
/// A short-lived borrow into the loop's internal state.
pub struct SocketCtx<'a> {
    pub(crate) st: &'a mut SocketState,
    pub(crate) index: usize,
    pub(crate) poll: &'a mut Poller,
    pub(crate) timers: &'a mut TimerTable,
    pub(crate) deferred: &'a mut VecDeque<Deferred>,
}

impl<'a> SocketCtx<'a> {
    /// The token identifying this socket.
    pub fn token(&self) -> SocketToken {
        SocketToken::new(self.index, self.st.generation)
    }

    /// Peer address snapshot taken at accept/connect time.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.st.peer
    }

    /// Whether this socket carries a TLS session.
    pub fn is_secure(&self) -> bool {
        self.st.tls.is_some()
    }

    /// Whether `close()` has been requested.
    pub fn is_closing(&self) -> bool {
        self.st.closing || self.st.phase == Phase::Closed
    }

    /// Begin delivering `on_read`. Level-triggered readiness redelivers any
    /// bytes already pending in the kernel.
    pub fn read_start(&mut self) {
        if self.st.phase == Phase::Closed {
            return;
        }
        self.st.read_started = true;
        update_interest(self);
        update_timer(self);
    }

    /// Stop delivering payload bytes. A pending end-of-stream notification
    /// (empty `on_read`) may still fire once; tolerate it.
    pub fn read_stop(&mut self) {
        self.st.read_started = false;
        if self.st.phase != Phase::Closed {
            update_interest(self);
            update_timer(self);
        }
    }

    /// Restart the inactivity timer from now.
    pub fn reset_timeout(&mut self) {
        let st = &mut *self.st;
        st.timed_out = false;
        if let Some(id) = st.timer.take() {
            self.timers.cancel(id);
        }
        if !st.timeout.is_zero()
            && st.connected
            && st.registered
            && st.phase != Phase::Closed
            && !st.closing
        {
            st.timer = Some(
                self.timers
                    .arm(TimerOwner::Socket(self.index), st.timeout),
            );
        }
    }

    /// Change the maximum read chunk size for subsequent reads.
    pub fn set_chunk_size(&mut self, size: usize) {
        self.st.chunk_size = size.max(1);
    }

    /// Enqueue an owned buffer for transmission.
    ///
    /// If the queue was empty, a non-blocking write is attempted before
    /// returning. On error the buffer has already been consumed and its
    /// release hook runs; the bytes were not queued.
    pub fn write(&mut self, buf: WriteBuf) -> Result<(), Error> {
        self_write(self, buf)
    }

    /// Copy borrowed bytes and enqueue them. The single data-path
    /// allocation lives here.
    pub fn write_simple(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.write(WriteBuf::copy_from(bytes))
    }

    /// Shut down our write direction once the queue drains: a FIN for
    /// plaintext sockets, a close_notify for secure ones. Reads continue
    /// until the peer closes.
    pub fn write_eof(&mut self) {
        let st = &mut *self.st;
        if st.closing || st.phase == Phase::Closed || st.sent_half_close {
            return;
        }
        st.write_eof_requested = true;
        if st.connected && st.queue.is_empty() && st.phase == Phase::Open {
            do_half_close(self);
        }
        if self.st.phase != Phase::Closed {
            update_interest(self);
            update_timer(self);
        }
    }

    /// Begin closing. Pending writes are drained when possible, the TLS bye
    /// is exchanged per `wait_for_secure_hangup`, and `on_close` is
    /// delivered on a later loop turn — never from inside this call.
    pub fn close(&mut self) {
        if self.st.phase == Phase::Closed || self.st.closing {
            return;
        }
        self.st.closing = true;
        self.st.read_started = false;
        if matches!(self.st.phase, Phase::Connecting | Phase::Handshaking) {
            finalize_close(self);
            return;
        }
        self.st.phase = Phase::Closing;
        if self.st.queue.is_empty() {
            begin_shutdown_finalize(self);
        } else {
            flush_queue(self);
            maybe_finish_close(self);
        }
        if self.st.phase != Phase::Closed {
            update_interest(self);
            update_timer(self);
        }
    }

    /// Disarm the socket's watcher and timer without closing it.
    pub fn detach(&mut self) {
        let st = &mut *self.st;
        if st.registered {
            let _ = self.poll.deregister(st.fd);
            st.registered = false;
        }
        if let Some(id) = st.timer.take() {
            self.timers.cancel(id);
        }
    }

    /// Re-arm the watcher and timer after a `detach`.
    pub fn attach(&mut self) {
        if self.st.registered || self.st.fd < 0 || self.st.phase == Phase::Closed {
            return;
        }
        let (read, write) = desired_interest(self.st);
        let key = WatchKey::encode(WatchKind::Socket, self.index);
        if self.poll.register(self.st.fd, key, read, write).is_ok() {
            let st = &mut *self.st;
            st.registered = true;
            st.want_read = read;
            st.want_write = write;
        }
        update_timer(self);
    }
}

// ── Dispatch ─────────────────────────────────────────────────────

/// Entry point for a readiness event on this socket.
pub(crate) fn handle_event(
    ctx: &mut SocketCtx<'_>,
    readable: bool,
    writable: bool,
    error: bool,
    hangup: bool,
) {
    match ctx.st.phase {
        Phase::Connecting => {
            if writable || error || hangup {
                finish_connect(ctx);
            }
        }
        Phase::Handshaking => drive_handshake(ctx, readable || error || hangup, writable),
        Phase::Open | Phase::HalfClosedWrite | Phase::Closing => {
            if readable || error || hangup {
                on_readable(ctx, error || hangup, hangup);
            }
            if ctx.st.phase != Phase::Closed && writable {
                flush_queue(ctx);
                maybe_finish_close(ctx);
            }
        }
        Phase::Closed => {}
    }
    if ctx.st.phase != Phase::Closed {
        update_interest(ctx);
        update_timer(ctx);
    }
}

/// Fire `on_connect` (or kick the handshake) for a freshly accepted socket.
pub(crate) fn on_installed(ctx: &mut SocketCtx<'_>) {
    if ctx.st.tls.is_some() {
        ctx.st.phase = Phase::Handshaking;
        drive_handshake(ctx, false, true);
    } else {
        ctx.st.phase = Phase::Open;
        with_handler(ctx, |h, ctx| h.on_connect(ctx));
    }
    if ctx.st.phase != Phase::Closed {
        update_interest(ctx);
        update_timer(ctx);
    }
}

/// The socket's inactivity timer elapsed.
pub(crate) fn timer_fired(ctx: &mut SocketCtx<'_>) {
    ctx.st.timer = None;
    if ctx.st.phase == Phase::Closed {
        return;
    }
    if ctx.st.closing {
        // Deadline for the peer's TLS bye; stop waiting.
        finalize_close(ctx);
        return;
    }
    metrics::SOCKET_TIMEOUTS.increment();
    ctx.st.timed_out = true;
    with_handler(ctx, |h, ctx| h.on_timeout(ctx));
    if ctx.st.phase != Phase::Closed {
        update_interest(ctx);
    }
}

// ── Callback plumbing ────────────────────────────────────────────

/// Run a user callback with the handler temporarily taken out of the slot,
/// so the callback can mutate the socket through the same context.
fn with_handler<R>(
    ctx: &mut SocketCtx<'_>,
    f: impl FnOnce(&mut dyn SocketHandler, &mut SocketCtx<'_>) -> R,
) -> Option<R> {
    let mut handler = ctx.st.handler.take()?;
    let result = f(&mut *handler, ctx);
    ctx.st.handler = Some(handler);
    Some(result)
}

/// Report an error and, when it is fatal, run the close path so `on_close`
/// eventually fires.
fn fail(ctx: &mut SocketCtx<'_>, err: Error) {
    let fatal = err.is_fatal();
    with_handler(ctx, |h, ctx| h.on_error(ctx, &err));
    if fatal && ctx.st.phase != Phase::Closed {
        finalize_close(ctx);
    }
}

// ── Connect and handshake ────────────────────────────────────────

fn finish_connect(ctx: &mut SocketCtx<'_>) {
    let mut code: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            ctx.st.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut code as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        fail(ctx, Error::last_os());
        return;
    }
    if code != 0 {
        fail(ctx, Error::Io(io::Error::from_raw_os_error(code)));
        return;
    }

    ctx.st.connected = true;
    metrics::CONNECTIONS_OPENED.increment();

    if ctx.st.tls.is_some() {
        ctx.st.phase = Phase::Handshaking;
        drive_handshake(ctx, false, true);
    } else {
        ctx.st.phase = Phase::Open;
        with_handler(ctx, |h, ctx| h.on_connect(ctx));
        if ctx.st.phase != Phase::Closed && !ctx.st.queue.is_empty() {
            flush_queue(ctx);
            maybe_finish_close(ctx);
        }
    }
}

fn drive_handshake(ctx: &mut SocketCtx<'_>, readable: bool, _writable: bool) {
    let mut moved = false;

    if readable {
        let fd = ctx.st.fd;
        let tls = ctx.st.tls.as_mut().expect("handshaking without session");
        match tls.session.read_tls(&mut FdIo { fd }) {
            Ok(0) => {
                fail(
                    ctx,
                    Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during TLS handshake",
                    )),
                );
                return;
            }
            Ok(n) => {
                metrics::BYTES_RECEIVED.add(n as u64);
                moved = true;
                if let Err(e) = tls.session.process_new_packets() {
                    let _ = tls.flush(fd);
                    fail(ctx, Error::Tls(e));
                    return;
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                fail(ctx, Error::Io(e));
                return;
            }
        }
    }

    {
        let fd = ctx.st.fd;
        let tls = ctx.st.tls.as_mut().expect("handshaking without session");
        if tls.session.wants_write() {
            match tls.flush(fd) {
                Ok(_) => moved = true,
                Err(e) => {
                    fail(ctx, Error::Io(e));
                    return;
                }
            }
        }
    }

    if moved {
        progress(ctx);
    }

    let complete = {
        let tls = ctx.st.tls.as_mut().expect("handshaking without session");
        if !tls.session.is_handshaking() {
            tls.handshaking = false;
            true
        } else {
            false
        }
    };

    if complete {
        ctx.st.phase = Phase::Open;
        metrics::TLS_HANDSHAKES.increment();
        progress(ctx);
        with_handler(ctx, |h, ctx| h.on_connect(ctx));
        if ctx.st.phase != Phase::Closed && !ctx.st.queue.is_empty() {
            flush_queue(ctx);
            maybe_finish_close(ctx);
        }
    }
}

// ── Read path ────────────────────────────────────────────────────

fn on_readable(ctx: &mut SocketCtx<'_>, forced: bool, hangup: bool) {
    if ctx.st.tls.is_some() {
        tls_readable(ctx, forced);
    } else {
        plain_readable(ctx, forced, hangup);
    }
}

fn deliver_eof(ctx: &mut SocketCtx<'_>) {
    if ctx.st.eof_delivered {
        return;
    }
    ctx.st.eof_delivered = true;
    with_handler(ctx, |h, ctx| h.on_read(ctx, &[]));
}

fn after_peer_close(ctx: &mut SocketCtx<'_>) {
    ctx.st.got_half_close = true;
    deliver_eof(ctx);
    if ctx.st.phase != Phase::Closed && (ctx.st.closing || ctx.st.sent_half_close) {
        finalize_close(ctx);
    }
}

fn plain_readable(ctx: &mut SocketCtx<'_>, forced: bool, hangup: bool) {
    if ctx.st.got_half_close && !forced {
        return;
    }

    if !ctx.st.read_started {
        if !forced {
            return;
        }
        // Not reading payload: probe for a reset without consuming data.
        let mut code: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        unsafe {
            libc::getsockopt(
                ctx.st.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut code as *mut _ as *mut libc::c_void,
                &mut len,
            );
        }
        if code != 0 {
            fail(ctx, Error::Io(io::Error::from_raw_os_error(code)));
        } else if hangup && !ctx.st.got_half_close {
            after_peer_close(ctx);
        }
        return;
    }

    loop {
        if ctx.st.phase == Phase::Closed || !ctx.st.read_started || ctx.st.got_half_close {
            return;
        }
        let chunk = ctx.st.chunk_size;
        let mut scratch = mem::take(&mut ctx.st.scratch);
        if scratch.len() != chunk {
            scratch.resize(chunk, 0);
        }

        let n = unsafe {
            libc::read(
                ctx.st.fd,
                scratch.as_mut_ptr() as *mut libc::c_void,
                scratch.len(),
            )
        };

        if n < 0 {
            ctx.st.scratch = scratch;
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return,
                io::ErrorKind::Interrupted => continue,
                _ => {
                    fail(ctx, Error::Io(err));
                    return;
                }
            }
        }

        if n == 0 {
            ctx.st.scratch = scratch;
            after_peer_close(ctx);
            return;
        }

        let n = n as usize;
        metrics::BYTES_RECEIVED.add(n as u64);
        progress(ctx);
        with_handler(ctx, |h, ctx| h.on_read(ctx, &scratch[..n]));
        ctx.st.scratch = scratch;
        if n < chunk {
            // Kernel buffer drained; level-triggered epoll refires otherwise.
            return;
        }
    }
}

fn tls_readable(ctx: &mut SocketCtx<'_>, forced: bool) {
    let busy = {
        let st = &*ctx.st;
        let tls = st.tls.as_ref().expect("tls_readable without session");
        tls.handshaking
            || tls.shutdown_sent
            || st.closing
            || (st.wait_for_secure_hangup && st.sent_half_close)
    };
    if !ctx.st.read_started && !busy && !forced {
        // Leave ciphertext in the kernel so TCP flow control applies
        // while reads are stopped.
        return;
    }

    let fd = ctx.st.fd;
    {
        let tls = ctx.st.tls.as_mut().expect("tls_readable without session");
        match tls.session.read_tls(&mut FdIo { fd }) {
            Ok(0) => {
                after_peer_close(ctx);
                return;
            }
            Ok(n) => {
                metrics::BYTES_RECEIVED.add(n as u64);
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return;
            }
            Err(e) => {
                fail(ctx, Error::Io(e));
                return;
            }
        }
    }

    let state = {
        let tls = ctx.st.tls.as_mut().expect("tls_readable without session");
        match tls.session.process_new_packets() {
            Ok(state) => state,
            Err(e) => {
                // Flush the alert before tearing down.
                let _ = tls.flush(fd);
                fail(ctx, Error::Tls(e));
                return;
            }
        }
    };

    progress(ctx);

    if ctx.st.read_started {
        drain_plaintext(ctx);
        if ctx.st.phase == Phase::Closed {
            return;
        }
    }

    {
        let tls = ctx.st.tls.as_mut().expect("tls_readable without session");
        if tls.session.wants_write() {
            if let Err(e) = tls.flush(fd) {
                fail(ctx, Error::Io(e));
                return;
            }
        }
    }

    if state.peer_has_closed() && !ctx.st.got_half_close {
        after_peer_close(ctx);
    }
}

fn drain_plaintext(ctx: &mut SocketCtx<'_>) {
    loop {
        if ctx.st.phase == Phase::Closed || !ctx.st.read_started {
            return;
        }
        let chunk = ctx.st.chunk_size;
        let mut plain = mem::take(&mut ctx.st.tls_plain);
        if plain.len() != chunk {
            plain.resize(chunk, 0);
        }

        let result = {
            let tls = ctx.st.tls.as_mut().expect("drain without session");
            tls.read_plaintext(&mut plain)
        };
        match result {
            Ok(0) => {
                ctx.st.tls_plain = plain;
                return;
            }
            Ok(n) => {
                with_handler(ctx, |h, ctx| h.on_read(ctx, &plain[..n]));
                ctx.st.tls_plain = plain;
            }
            Err(e) => {
                ctx.st.tls_plain = plain;
                fail(ctx, Error::Io(e));
                return;
            }
        }
    }
}

// ── Write path ───────────────────────────────────────────────────

enum WriteStep {
    Wrote { n: usize, completed: bool },
    Blocked,
    Interrupted,
    Failed(io::Error),
}

fn flush_queue(ctx: &mut SocketCtx<'_>) {
    if !ctx.st.connected
        || matches!(
            ctx.st.phase,
            Phase::Connecting | Phase::Handshaking | Phase::Closed
        )
    {
        return;
    }

    loop {
        // Pending ciphertext goes out before more plaintext is fed in.
        if ctx.st.tls.is_some() {
            let fd = ctx.st.fd;
            let tls = ctx.st.tls.as_mut().expect("flush without session");
            match tls.flush(fd) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    fail(ctx, Error::Io(e));
                    return;
                }
            }
        }

        if ctx.st.queue.is_empty() {
            break;
        }

        let step = if ctx.st.tls.is_some() {
            tls_write_step(ctx.st)
        } else {
            plain_write_step(ctx.st)
        };

        match step {
            WriteStep::Wrote { n, completed } => {
                if completed {
                    // Popping drops the buffer; its release hook runs here.
                    ctx.st.queue.pop_front();
                    ctx.st.wrote_since_empty = true;
                }
                if n > 0 {
                    progress(ctx);
                }
            }
            WriteStep::Blocked => break,
            WriteStep::Interrupted => continue,
            WriteStep::Failed(e) => {
                fail(ctx, Error::Io(e));
                return;
            }
        }
    }

    if ctx.st.phase != Phase::Closed && ctx.st.queue.is_empty() && ctx.st.wrote_since_empty {
        ctx.st.wrote_since_empty = false;
        if let Some(waiter) = ctx.st.send_waiter.take() {
            ctx.deferred.push_back(Deferred::SendContinue {
                index: waiter.index(),
                generation: waiter.generation,
            });
        }
        with_handler(ctx, |h, ctx| h.on_drain(ctx));
    }
}

fn plain_write_step(st: &mut SocketState) -> WriteStep {
    let pending = st.queue.front_mut().expect("write step on empty queue");
    let bytes = pending.buf.bytes();
    let rem = &bytes[pending.cursor..];
    if rem.is_empty() {
        return WriteStep::Wrote {
            n: 0,
            completed: true,
        };
    }
    let n = unsafe { libc::write(st.fd, rem.as_ptr() as *const libc::c_void, rem.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => WriteStep::Blocked,
            io::ErrorKind::Interrupted => WriteStep::Interrupted,
            _ => WriteStep::Failed(err),
        };
    }
    let n = n as usize;
    metrics::BYTES_SENT.add(n as u64);
    pending.cursor += n;
    WriteStep::Wrote {
        n,
        completed: pending.cursor == bytes.len(),
    }
}

/// Feed at most one chunk of plaintext into the session. The ciphertext is
/// flushed by the caller's next loop iteration, which bounds how much the
/// session buffers ahead of a slow descriptor.
fn tls_write_step(st: &mut SocketState) -> WriteStep {
    let chunk = st.chunk_size;
    let pending = st.queue.front_mut().expect("write step on empty queue");
    let bytes = pending.buf.bytes();
    let rem = &bytes[pending.cursor..];
    if rem.is_empty() {
        return WriteStep::Wrote {
            n: 0,
            completed: true,
        };
    }
    let take = rem.len().min(chunk);
    let tls = st.tls.as_mut().expect("tls write step without session");
    match tls.session.writer().write(&rem[..take]) {
        Ok(0) => WriteStep::Blocked,
        Ok(n) => {
            pending.cursor += n;
            WriteStep::Wrote {
                n,
                completed: pending.cursor == bytes.len(),
            }
        }
        Err(e) => WriteStep::Failed(e),
    }
}

// ── Shutdown paths ───────────────────────────────────────────────

fn maybe_finish_close(ctx: &mut SocketCtx<'_>) {
    if ctx.st.phase == Phase::Closed {
        return;
    }
    if ctx.st.write_eof_requested
        && !ctx.st.sent_half_close
        && ctx.st.queue.is_empty()
        && ctx.st.connected
        && ctx.st.phase == Phase::Open
    {
        do_half_close(ctx);
    }
    if ctx.st.phase != Phase::Closed && ctx.st.closing && ctx.st.queue.is_empty() {
        begin_shutdown_finalize(ctx);
    }
}

fn do_half_close(ctx: &mut SocketCtx<'_>) {
    if ctx.st.sent_half_close {
        return;
    }
    if ctx.st.tls.is_some() {
        let fd = ctx.st.fd;
        let tls = ctx.st.tls.as_mut().expect("half close without session");
        tls.queue_close_notify();
        ctx.st.sent_half_close = true;
        let flush = tls.flush(fd);
        if let Err(e) = flush {
            fail(ctx, Error::Io(e));
            return;
        }
    } else {
        unsafe {
            libc::shutdown(ctx.st.fd, libc::SHUT_WR);
        }
        ctx.st.sent_half_close = true;
    }
    if ctx.st.phase == Phase::Open {
        ctx.st.phase = Phase::HalfClosedWrite;
    }
    if ctx.st.got_half_close {
        finalize_close(ctx);
    }
}

/// `close()` with an empty queue: exchange the TLS bye as configured, then
/// finalize.
fn begin_shutdown_finalize(ctx: &mut SocketCtx<'_>) {
    if ctx.st.tls.is_some() {
        let fd = ctx.st.fd;
        let wait = ctx.st.wait_for_secure_hangup;
        let got_peer_bye = ctx.st.got_half_close;
        let tls = ctx.st.tls.as_mut().expect("shutdown without session");
        tls.queue_close_notify();
        ctx.st.sent_half_close = true;
        match tls.flush(fd) {
            Ok(true) => {
                if wait && !got_peer_bye {
                    // Stay in Closing until the peer's bye or the timer.
                    return;
                }
                finalize_close(ctx);
            }
            Ok(false) => {
                // Blocked mid-bye; writability resumes the flush and
                // re-enters through maybe_finish_close.
            }
            Err(_) => finalize_close(ctx),
        }
    } else {
        finalize_close(ctx);
    }
}

/// Tear the socket down: release queued buffers, disarm everything, close
/// the descriptor, and schedule the deferred `on_close`.
fn finalize_close(ctx: &mut SocketCtx<'_>) {
    if ctx.st.phase == Phase::Closed {
        return;
    }
    let st = &mut *ctx.st;
    st.queue.clear();
    if let Some(id) = st.timer.take() {
        ctx.timers.cancel(id);
    }
    if st.registered {
        let _ = ctx.poll.deregister(st.fd);
        st.registered = false;
    }
    if st.fd >= 0 {
        unsafe {
            libc::close(st.fd);
        }
        st.fd = -1;
    }
    st.phase = Phase::Closed;
    st.closing = true;
    metrics::CONNECTIONS_CLOSED.increment();
    metrics::CONNECTIONS_ACTIVE.decrement();
    if let Some(waiter) = st.send_waiter.take() {
        ctx.deferred.push_back(Deferred::SendContinue {
            index: waiter.index(),
            generation: waiter.generation,
        });
    }
    if !st.close_scheduled {
        st.close_scheduled = true;
        ctx.deferred.push_back(Deferred::Close(Owner::Socket(ctx.index)));
    }
}

// ── Timer and interest bookkeeping ───────────────────────────────

fn tls_busy(st: &SocketState) -> bool {
    st.tls.as_ref().is_some_and(|t| {
        t.handshaking || (t.shutdown_sent && !st.got_half_close && st.wait_for_secure_hangup)
    })
}

fn timer_eligible(st: &SocketState) -> bool {
    if st.timeout.is_zero() || !st.registered || !st.connected || st.phase == Phase::Closed {
        return false;
    }
    if st.closing {
        // Only the wait-for-bye state keeps a deadline while closing.
        return st.wait_for_secure_hangup && st.sent_half_close && !st.got_half_close;
    }
    st.read_started || !st.queue.is_empty() || tls_busy(st)
}

/// Genuine progress: bytes moved or a handshake step. Restarts the timer.
fn progress(ctx: &mut SocketCtx<'_>) {
    let st = &mut *ctx.st;
    st.timed_out = false;
    if let Some(id) = st.timer.take() {
        ctx.timers.cancel(id);
    }
    if timer_eligible(st) {
        st.timer = Some(
            ctx.timers
                .arm(TimerOwner::Socket(ctx.index), st.timeout),
        );
    }
}

fn update_timer(ctx: &mut SocketCtx<'_>) {
    let st = &mut *ctx.st;
    if timer_eligible(st) {
        if st.timed_out {
            return;
        }
        if st.timer.is_none() {
            st.timer = Some(
                ctx.timers
                    .arm(TimerOwner::Socket(ctx.index), st.timeout),
            );
        }
    } else if let Some(id) = st.timer.take() {
        ctx.timers.cancel(id);
    }
}

fn desired_interest(st: &SocketState) -> (bool, bool) {
    match st.phase {
        Phase::Connecting => (false, true),
        Phase::Handshaking => (
            true,
            st.tls.as_ref().is_some_and(|t| t.session.wants_write()),
        ),
        Phase::Open | Phase::HalfClosedWrite | Phase::Closing => {
            let tls_wants_write = st.tls.as_ref().is_some_and(|t| t.session.wants_write());
            let read = (st.read_started && !st.got_half_close) || tls_busy(st);
            let write = !st.queue.is_empty() || tls_wants_write;
            (read, write)
        }
        Phase::Closed => (false, false),
    }
}

fn update_interest(ctx: &mut SocketCtx<'_>) {
    let st = &mut *ctx.st;
    if !st.registered || st.fd < 0 {
        return;
    }
    let (read, write) = desired_interest(st);
    if read != st.want_read || write != st.want_write {
        let key = WatchKey::encode(WatchKind::Socket, ctx.index);
        if ctx.poll.modify(st.fd, key, read, write).is_ok() {
            st.want_read = read;
            st.want_write = write;
        }
    }
}

/// Push bytes produced by a file `send` into this socket's queue.
pub(crate) fn enqueue_send_chunk(
    ctx: &mut SocketCtx<'_>,
    buf: WriteBuf,
    waiter: FileToken,
) -> Result<(), Error> {
    ctx.st.send_waiter = Some(waiter);
    let result = self_write(ctx, buf);
    if result.is_err() {
        ctx.st.send_waiter = None;
    }
    result
}

fn self_write(ctx: &mut SocketCtx<'_>, buf: WriteBuf) -> Result<(), Error> {
    if ctx.st.closing || ctx.st.phase == Phase::Closed {
        return Err(Error::Closing);
    }
    if ctx.st.write_eof_requested || ctx.st.sent_half_close {
        return Err(Error::WriteAfterEof);
    }
    let was_empty = ctx.st.queue.is_empty();
    ctx.st.queue.push_back(Pending { buf, cursor: 0 });
    if was_empty && ctx.st.connected && ctx.st.phase == Phase::Open {
        flush_queue(ctx);
        maybe_finish_close(ctx);
    }
    if ctx.st.phase != Phase::Closed {
        update_interest(ctx);
        update_timer(ctx);
    }
    Ok(())
}
