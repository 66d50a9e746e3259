use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use slab::Slab;

use crate::buffer::WriteBuf;
use crate::error::Error;
use crate::file::{self, FileCtx, FileState};
use crate::handler::{
    Accepted, FileHandler, FileToken, ServerHandler, ServerToken, SocketHandler, SocketToken,
};
use crate::metrics;
use crate::poll::{Event, Poller, WatchKey, WatchKind, Waker};
use crate::pool::{DonePayload, TaskDone, ThreadPool};
use crate::server::{self, ServerCtx, ServerState};
use crate::socket::{self, Phase, SocketCtx, SocketOptions, SocketState};
use crate::timer::{TimerOwner, TimerTable};

/// Which slot table a deferred action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    Socket(usize),
    Server(usize),
    File(usize),
}

/// Actions run after dispatch, once no callback frames are on the stack.
///
/// `Close` carries the terminal `on_close` delivery: the slot is vacated
/// and its state dropped before the handler runs, so the owner can tear
/// down freely. `SendContinue` resumes a file→socket transfer after the
/// destination's queue drained (or after the destination died).
pub(crate) enum Deferred {
    Close(Owner),
    Detach(Owner),
    FileOpened { index: usize, generation: u32 },
    SendContinue { index: usize, generation: u32 },
}

/// Handle for stopping a running loop from another thread.
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the loop to return from [`EventLoop::run`] after the current
    /// turn. Safe to call from any thread.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// The event-dispatch engine.
///
/// Owns every socket, listener, and file attached to it, converts epoll
/// readiness, timer expiry, and thread-pool completions into user
/// callbacks, and runs them strictly serialized on the calling thread.
pub struct EventLoop {
    poll: Poller,
    timers: TimerTable,
    sockets: Slab<SocketState>,
    servers: Slab<ServerState>,
    files: Slab<FileState>,
    deferred: VecDeque<Deferred>,
    done_tx: Sender<TaskDone>,
    done_rx: Receiver<TaskDone>,
    pool: Option<Arc<ThreadPool>>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    generation_counter: u32,
}

impl EventLoop {
    /// Create a loop backed by the process-wide thread pool (started
    /// lazily on the first file attach).
    pub fn new() -> Result<EventLoop, Error> {
        Self::build(None)
    }

    /// Create a loop with an explicit, typically test-isolated, pool.
    pub fn with_pool(pool: Arc<ThreadPool>) -> Result<EventLoop, Error> {
        Self::build(Some(pool))
    }

    fn build(pool: Option<Arc<ThreadPool>>) -> Result<EventLoop, Error> {
        let poll = Poller::new()?;
        let waker = poll.waker();
        let (done_tx, done_rx) = unbounded();
        Ok(EventLoop {
            poll,
            timers: TimerTable::new(),
            sockets: Slab::new(),
            servers: Slab::new(),
            files: Slab::new(),
            deferred: VecDeque::new(),
            done_tx,
            done_rx,
            pool,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            generation_counter: 0,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: self.stop.clone(),
            waker: self.waker.clone(),
        }
    }

    fn next_generation(&mut self) -> u32 {
        let g = self.generation_counter;
        self.generation_counter = self.generation_counter.wrapping_add(1);
        g
    }

    // ── Object creation ──────────────────────────────────────────

    /// Start an outbound connection. The socket is created non-blocking,
    /// attached, and reported through `on_connect` (or `on_error`) once the
    /// connect resolves. The address must already be resolved.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        options: SocketOptions,
        handler: Box<dyn SocketHandler>,
    ) -> Result<SocketToken, Error> {
        let domain = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::last_os());
        }
        if options.tcp_nodelay {
            set_tcp_nodelay(fd);
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let addr_len = server::socket_addr_to_sockaddr(addr, &mut storage);
        let ret = unsafe {
            libc::connect(fd, &storage as *const _ as *const libc::sockaddr, addr_len)
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                unsafe {
                    libc::close(fd);
                }
                return Err(Error::Io(err));
            }
        }

        let generation = self.next_generation();
        let state = SocketState::new(
            fd,
            Some(addr),
            generation,
            options,
            handler,
            Phase::Connecting,
        );
        let index = self.sockets.insert(state);
        let key = WatchKey::encode(WatchKind::Socket, index);
        if let Err(err) = self.poll.register(fd, key, false, true) {
            self.sockets.remove(index);
            unsafe {
                libc::close(fd);
            }
            return Err(Error::Io(err));
        }
        self.sockets[index].mark_registered(false, true);
        metrics::CONNECTIONS_ACTIVE.increment();
        Ok(SocketToken::new(index, generation))
    }

    /// Bind and listen, then attach the accept watcher. Connections arrive
    /// through the handler's `on_connection`.
    pub fn listen(
        &mut self,
        addr: SocketAddr,
        backlog: i32,
        handler: Box<dyn ServerHandler>,
    ) -> Result<ServerToken, Error> {
        let fd = server::create_listener(addr, backlog)?;
        let generation = self.next_generation();
        let index = self
            .servers
            .insert(ServerState::new(fd, generation, handler));
        let key = WatchKey::encode(WatchKind::Server, index);
        if let Err(err) = self.poll.register(fd, key, true, false) {
            self.servers.remove(index);
            unsafe {
                libc::close(fd);
            }
            return Err(Error::Io(err));
        }
        self.servers[index].registered = true;
        Ok(ServerToken::new(index, generation))
    }

    /// The listener's bound address (with the kernel-assigned port for
    /// binds to port zero).
    pub fn server_addr(&self, token: ServerToken) -> Option<SocketAddr> {
        let st = self.servers.get(token.index())?;
        if st.generation != token.generation {
            return None;
        }
        server::local_addr(st.fd)
    }

    /// Create a file object. The thread pool is started lazily here.
    pub fn file(&mut self, handler: Box<dyn FileHandler>) -> Result<FileToken, Error> {
        if self.pool.is_none() {
            self.pool = Some(ThreadPool::global());
        }
        let generation = self.next_generation();
        let index = self.files.insert(FileState::new(generation, handler));
        Ok(FileToken::new(index, generation))
    }

    // ── Context accessors ────────────────────────────────────────

    /// Borrow a live socket for out-of-callback operations.
    pub fn socket(&mut self, token: SocketToken) -> Option<SocketCtx<'_>> {
        let EventLoop {
            sockets,
            poll,
            timers,
            deferred,
            ..
        } = self;
        let st = sockets.get_mut(token.index())?;
        if st.generation != token.generation || st.phase == Phase::Closed {
            return None;
        }
        Some(SocketCtx {
            st,
            index: token.index(),
            poll,
            timers,
            deferred,
        })
    }

    /// Borrow a live listener for out-of-callback operations.
    pub fn server(&mut self, token: ServerToken) -> Option<ServerCtx<'_>> {
        let EventLoop {
            servers,
            poll,
            timers,
            deferred,
            ..
        } = self;
        let st = servers.get_mut(token.index())?;
        if st.generation != token.generation {
            return None;
        }
        Some(ServerCtx {
            st,
            index: token.index(),
            poll,
            timers,
            deferred,
        })
    }

    /// Borrow a live file for out-of-callback operations.
    pub fn file_ctx(&mut self, token: FileToken) -> Option<FileCtx<'_>> {
        let EventLoop {
            files,
            deferred,
            pool,
            done_tx,
            waker,
            ..
        } = self;
        let st = files.get_mut(token.index())?;
        if st.generation != token.generation {
            return None;
        }
        let pool = pool.as_ref()?;
        Some(FileCtx {
            st,
            index: token.index(),
            pool,
            done_tx,
            waker,
            deferred,
        })
    }

    // ── Running ──────────────────────────────────────────────────

    /// Whether any object (or pending deferred action) keeps the loop alive.
    pub fn is_active(&self) -> bool {
        !(self.sockets.is_empty()
            && self.servers.is_empty()
            && self.files.is_empty()
            && self.deferred.is_empty())
    }

    /// Dispatch until every object is gone or a shutdown handle fires.
    pub fn run(&mut self) -> Result<(), Error> {
        while !self.stop.load(Ordering::Acquire) && self.is_active() {
            self.turn(None)?;
        }
        Ok(())
    }

    /// Dispatch a single turn, waiting at most `max_wait` (`None` blocks
    /// until the next event or timer).
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<(), Error> {
        self.turn(max_wait)
    }

    fn turn(&mut self, cap: Option<Duration>) -> Result<(), Error> {
        let timeout = if self.deferred.is_empty() {
            self.timers
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        } else {
            Some(Duration::ZERO)
        };
        let timeout = match (timeout, cap) {
            (Some(t), Some(c)) => Some(t.min(c)),
            (Some(t), None) => Some(t),
            (None, cap) => cap,
        };

        let (events, _woke) = self.poll.wait(timeout)?;
        for event in events {
            self.dispatch_event(event);
        }

        let now = Instant::now();
        while let Some(owner) = self.timers.pop_due(now) {
            self.timer_fired(owner);
        }

        while let Ok(done) = self.done_rx.try_recv() {
            self.task_done(done);
        }

        while let Some(deferred) = self.deferred.pop_front() {
            self.run_deferred(deferred);
        }

        Ok(())
    }

    // ── Dispatch ─────────────────────────────────────────────────

    fn dispatch_event(&mut self, event: Event) {
        match event.key.kind() {
            Some(WatchKind::Socket) => self.socket_event(event),
            Some(WatchKind::Server) => self.server_event(event.key.index()),
            None => {}
        }
    }

    fn socket_event(&mut self, event: Event) {
        let EventLoop {
            sockets,
            poll,
            timers,
            deferred,
            ..
        } = self;
        let index = event.key.index();
        let Some(st) = sockets.get_mut(index) else {
            return;
        };
        if st.phase == Phase::Closed {
            return;
        }
        let mut ctx = SocketCtx {
            st,
            index,
            poll,
            timers,
            deferred,
        };
        socket::handle_event(
            &mut ctx,
            event.readable,
            event.writable,
            event.error,
            event.hangup,
        );
    }

    fn with_server_ctx<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut ServerCtx<'_>) -> R,
    ) -> Option<R> {
        let EventLoop {
            servers,
            poll,
            timers,
            deferred,
            ..
        } = self;
        let st = servers.get_mut(index)?;
        let mut ctx = ServerCtx {
            st,
            index,
            poll,
            timers,
            deferred,
        };
        Some(f(&mut ctx))
    }

    fn with_file_ctx<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut FileCtx<'_>) -> R,
    ) -> Option<R> {
        let EventLoop {
            files,
            deferred,
            pool,
            done_tx,
            waker,
            ..
        } = self;
        let st = files.get_mut(index)?;
        let pool = pool.as_ref()?;
        let mut ctx = FileCtx {
            st,
            index,
            pool,
            done_tx,
            waker,
            deferred,
        };
        Some(f(&mut ctx))
    }

    /// Accept until the kernel runs dry. Transient failures are swallowed;
    /// fd exhaustion pauses the watcher behind a backoff timer.
    fn server_event(&mut self, index: usize) {
        loop {
            let listen_fd = match self.servers.get(index) {
                Some(st) if !st.closing && st.fd >= 0 => st.fd,
                _ => return,
            };

            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    listen_fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut addr_len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };

            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => return,
                    Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        self.with_server_ctx(index, |ctx| {
                            server::report_error(ctx, Error::Io(err));
                            server::backoff(ctx);
                        });
                        return;
                    }
                    _ => {
                        self.with_server_ctx(index, |ctx| {
                            server::report_error(ctx, Error::Io(err));
                        });
                        return;
                    }
                }
            }

            // An address record we cannot express is a rejected connection,
            // not a fabricated peer.
            let Some(peer) = server::sockaddr_to_socket_addr(&storage) else {
                self.with_server_ctx(index, |ctx| {
                    server::report_error(ctx, Error::UnsupportedAddress);
                });
                unsafe {
                    libc::close(fd);
                }
                continue;
            };

            let decision = self
                .with_server_ctx(index, |ctx| {
                    server::with_handler(ctx, |h, ctx| h.on_connection(ctx, peer)).flatten()
                })
                .flatten();

            match decision {
                Some(accepted) => self.install_socket(fd, peer, accepted),
                None => unsafe {
                    libc::close(fd);
                },
            }
        }
    }

    /// Install an accepted descriptor as a socket: attach it, arm its
    /// timer, and deliver `on_connect` (after the handshake for TLS).
    fn install_socket(&mut self, fd: RawFd, peer: SocketAddr, accepted: Accepted) {
        let Accepted { options, handler } = accepted;
        if options.tcp_nodelay {
            set_tcp_nodelay(fd);
        }

        let generation = self.next_generation();
        let mut state = SocketState::new(fd, Some(peer), generation, options, handler, Phase::Open);
        state.connected = true;
        let index = self.sockets.insert(state);
        let key = WatchKey::encode(WatchKind::Socket, index);
        if self.poll.register(fd, key, true, false).is_err() {
            self.sockets.remove(index);
            unsafe {
                libc::close(fd);
            }
            return;
        }
        self.sockets[index].mark_registered(true, false);
        metrics::CONNECTIONS_ACCEPTED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();

        let EventLoop {
            sockets,
            poll,
            timers,
            deferred,
            ..
        } = self;
        let st = sockets.get_mut(index).expect("freshly inserted socket");
        let mut ctx = SocketCtx {
            st,
            index,
            poll,
            timers,
            deferred,
        };
        socket::on_installed(&mut ctx);
    }

    fn timer_fired(&mut self, owner: TimerOwner) {
        match owner {
            TimerOwner::Socket(index) => {
                let EventLoop {
                    sockets,
                    poll,
                    timers,
                    deferred,
                    ..
                } = self;
                let Some(st) = sockets.get_mut(index) else {
                    return;
                };
                if st.phase == Phase::Closed {
                    return;
                }
                let mut ctx = SocketCtx {
                    st,
                    index,
                    poll,
                    timers,
                    deferred,
                };
                socket::timer_fired(&mut ctx);
            }
            TimerOwner::Server(index) => {
                self.with_server_ctx(index, server::backoff_expired);
            }
        }
    }

    // ── Thread-pool completions ──────────────────────────────────

    fn task_done(&mut self, done: TaskDone) {
        let index = done.owner.index();
        // The orphan rule: a stale generation means the file died while the
        // task was in flight. Dropping the payload here releases any buffer
        // it carried, on the loop thread.
        let live = self
            .files
            .get(index)
            .is_some_and(|st| st.generation == done.owner.generation);
        if !live {
            return;
        }

        match done.payload {
            DonePayload::Open(result) => {
                self.with_file_ctx(index, |ctx| {
                    ctx.st.opening = false;
                    match result {
                        Ok(fd) => {
                            ctx.st.fd = fd;
                            if !ctx.st.closing {
                                file::with_handler(ctx, |h, ctx| h.on_open(ctx));
                            }
                            file::kick_after_open(ctx);
                        }
                        Err(e) => {
                            let err = Error::Io(e);
                            file::with_handler(ctx, |h, ctx| h.on_error(ctx, &err));
                            file::kick_close(ctx);
                        }
                    }
                });
            }
            DonePayload::Read(result, buf) => {
                self.with_file_ctx(index, |ctx| {
                    ctx.st.reading = false;
                    match result {
                        Ok(n) => {
                            if ctx.st.read_started && !ctx.st.closing {
                                if n == 0 {
                                    ctx.st.read_started = false;
                                    file::with_handler(ctx, |h, ctx| h.on_read(ctx, &[]));
                                } else {
                                    file::with_handler(ctx, |h, ctx| h.on_read(ctx, &buf[..n]));
                                    file::kick_read(ctx);
                                }
                            }
                        }
                        Err(e) => {
                            let err = Error::Io(e);
                            file::with_handler(ctx, |h, ctx| h.on_error(ctx, &err));
                        }
                    }
                    file::kick_close(ctx);
                });
            }
            DonePayload::Write(result, buf) => {
                self.with_file_ctx(index, |ctx| {
                    ctx.st.writing = false;
                    // Dropping the buffer here runs its release hook on the
                    // loop thread, before on_drain.
                    drop(buf);
                    match result {
                        Ok(()) => {
                            if ctx.st.queue.is_empty() {
                                file::with_handler(ctx, |h, ctx| h.on_drain(ctx));
                            } else {
                                file::kick_write(ctx);
                            }
                        }
                        Err(e) => {
                            let err = Error::Io(e);
                            file::with_handler(ctx, |h, ctx| h.on_error(ctx, &err));
                        }
                    }
                    file::kick_close(ctx);
                });
            }
            DonePayload::SendChunk(result) => self.send_chunk_done(index, result),
            DonePayload::Close(result) => {
                self.with_file_ctx(index, |ctx| {
                    ctx.st.closing_task = false;
                    if let Err(e) = result {
                        let err = Error::Io(e);
                        file::with_handler(ctx, |h, ctx| h.on_error(ctx, &err));
                    }
                    let st = &mut *ctx.st;
                    if !st.close_scheduled {
                        st.close_scheduled = true;
                        ctx.deferred
                            .push_back(Deferred::Close(Owner::File(ctx.index)));
                    }
                });
            }
        }
    }

    fn send_chunk_done(&mut self, index: usize, result: io::Result<Vec<u8>>) {
        let data = match result {
            Ok(data) => data,
            Err(e) => {
                self.with_file_ctx(index, |ctx| file::finish_send(ctx, Err(Error::Io(e))));
                return;
            }
        };
        if data.is_empty() {
            // End of file, or the requested length is exhausted.
            self.with_file_ctx(index, |ctx| file::finish_send(ctx, Ok(())));
            return;
        }

        let n = data.len() as u64;
        let (dst, file_token) = {
            let Some(st) = self.files.get_mut(index) else {
                return;
            };
            file::advance_send(st, n);
            let Some(op) = st.send.as_ref() else {
                return;
            };
            (op.dst, FileToken::new(index, st.generation))
        };

        // The chunk enters the destination's ordinary write queue, so its
        // backpressure paces the transfer: the next chunk is read only
        // after the queue drains.
        let enqueued = {
            let EventLoop {
                sockets,
                poll,
                timers,
                deferred,
                ..
            } = self;
            match sockets.get_mut(dst.index()) {
                Some(st) if st.generation == dst.generation && st.phase != Phase::Closed => {
                    let mut ctx = SocketCtx {
                        st,
                        index: dst.index(),
                        poll,
                        timers,
                        deferred,
                    };
                    socket::enqueue_send_chunk(&mut ctx, WriteBuf::from_vec(data), file_token)
                }
                _ => Err(Error::StaleToken),
            }
        };

        if let Err(e) = enqueued {
            self.with_file_ctx(index, |ctx| file::finish_send(ctx, Err(e)));
        }
    }

    // ── Deferred actions ─────────────────────────────────────────

    fn run_deferred(&mut self, deferred: Deferred) {
        match deferred {
            Deferred::Close(Owner::Socket(index)) => {
                let Some(mut state) = self.sockets.try_remove(index) else {
                    return;
                };
                // State (and any stragglers in it) is dropped before the
                // terminal callback, which gets no context on purpose.
                let handler = state.handler.take();
                drop(state);
                if let Some(mut handler) = handler {
                    handler.on_close();
                }
            }
            Deferred::Close(Owner::Server(index)) => {
                let Some(mut state) = self.servers.try_remove(index) else {
                    return;
                };
                if state.fd >= 0 {
                    unsafe {
                        libc::close(state.fd);
                    }
                }
                let handler = state.handler.take();
                drop(state);
                if let Some(mut handler) = handler {
                    handler.on_close();
                }
            }
            Deferred::Close(Owner::File(index)) => {
                let Some(mut state) = self.files.try_remove(index) else {
                    return;
                };
                let handler = state.handler.take();
                drop(state);
                if let Some(mut handler) = handler {
                    handler.on_close();
                }
            }
            Deferred::Detach(owner) => match owner {
                Owner::File(index) => {
                    let _ = self.files.try_remove(index);
                }
                Owner::Socket(_) | Owner::Server(_) => {}
            },
            Deferred::FileOpened { index, generation } => {
                self.with_file_ctx(index, |ctx| {
                    if ctx.st.generation != generation || ctx.st.closing {
                        return;
                    }
                    file::with_handler(ctx, |h, ctx| h.on_open(ctx));
                    file::kick_after_open(ctx);
                });
            }
            Deferred::SendContinue { index, generation } => {
                let alive = self
                    .files
                    .get(index)
                    .is_some_and(|st| st.generation == generation && st.sending);
                if !alive {
                    return;
                }
                let dst = self
                    .files
                    .get(index)
                    .and_then(|st| st.send.as_ref())
                    .map(|op| op.dst);
                let Some(dst) = dst else {
                    return;
                };
                let dst_alive = self.sockets.get(dst.index()).is_some_and(|st| {
                    st.generation == dst.generation && st.phase != Phase::Closed && !st.closing
                });
                if dst_alive {
                    self.with_file_ctx(index, file::submit_next_send_chunk);
                } else {
                    self.with_file_ctx(index, |ctx| {
                        file::finish_send(ctx, Err(Error::StaleToken))
                    });
                }
            }
        }
    }
}

fn set_tcp_nodelay(fd: RawFd) {
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
