use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::Error;
use crate::event_loop::{Deferred, Owner};
use crate::handler::{ServerHandler, ServerToken};
use crate::poll::{Poller, WatchKey, WatchKind};
use crate::timer::{TimerId, TimerOwner, TimerTable};

/// Backoff applied to the accept watcher after fd exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-listener state owned by the event loop.
pub(crate) struct ServerState {
    pub fd: RawFd,
    pub generation: u32,
    pub handler: Option<Box<dyn ServerHandler>>,
    pub registered: bool,
    pub closing: bool,
    close_scheduled: bool,
    backoff_timer: Option<TimerId>,
}

impl ServerState {
    pub(crate) fn new(fd: RawFd, generation: u32, handler: Box<dyn ServerHandler>) -> ServerState {
        ServerState {
            fd,
            generation,
            handler: Some(handler),
            registered: false,
            closing: false,
            close_scheduled: false,
            backoff_timer: None,
        }
    }
}

/// Operations on a live listener, handed to its callbacks and available
/// through [`EventLoop::server`](crate::EventLoop::server).
pub struct ServerCtx<'a> {
    pub(crate) st: &'a mut ServerState,
    pub(crate) index: usize,
    pub(crate) poll: &'a mut Poller,
    pub(crate) timers: &'a mut TimerTable,
    pub(crate) deferred: &'a mut VecDeque<Deferred>,
}

impl<'a> ServerCtx<'a> {
    pub fn token(&self) -> ServerToken {
        ServerToken::new(self.index, self.st.generation)
    }

    /// The bound address, including the kernel-assigned port for binds to
    /// port zero.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        local_addr(self.st.fd)
    }

    /// Disarm the accept watcher. The listener keeps its descriptor and may
    /// be re-attached.
    pub fn detach(&mut self) {
        let st = &mut *self.st;
        if st.registered {
            let _ = self.poll.deregister(st.fd);
            st.registered = false;
        }
        if let Some(id) = st.backoff_timer.take() {
            self.timers.cancel(id);
        }
    }

    /// Re-arm the accept watcher after a `detach`.
    pub fn attach(&mut self) {
        let st = &mut *self.st;
        if st.registered || st.closing || st.fd < 0 {
            return;
        }
        let key = WatchKey::encode(WatchKind::Server, self.index);
        if self.poll.register(st.fd, key, true, false).is_ok() {
            st.registered = true;
        }
    }

    /// Close the listener. `on_close` is delivered on a later loop turn.
    pub fn close(&mut self) {
        let st = &mut *self.st;
        if st.closing {
            return;
        }
        st.closing = true;
        if st.registered {
            let _ = self.poll.deregister(st.fd);
            st.registered = false;
        }
        if let Some(id) = st.backoff_timer.take() {
            self.timers.cancel(id);
        }
        if st.fd >= 0 {
            unsafe {
                libc::close(st.fd);
            }
            st.fd = -1;
        }
        if !st.close_scheduled {
            st.close_scheduled = true;
            self.deferred
                .push_back(Deferred::Close(Owner::Server(self.index)));
        }
    }
}

/// Run a listener callback with the handler taken out of the slot.
pub(crate) fn with_handler<R>(
    ctx: &mut ServerCtx<'_>,
    f: impl FnOnce(&mut dyn ServerHandler, &mut ServerCtx<'_>) -> R,
) -> Option<R> {
    let mut handler = ctx.st.handler.take()?;
    let result = f(&mut *handler, ctx);
    ctx.st.handler = Some(handler);
    Some(result)
}

/// Report an accept-path error to the listener's handler.
pub(crate) fn report_error(ctx: &mut ServerCtx<'_>, err: Error) {
    with_handler(ctx, |h, ctx| h.on_error(ctx, &err));
}

/// Pause accepting after fd exhaustion; a server-owned timer re-arms it.
pub(crate) fn backoff(ctx: &mut ServerCtx<'_>) {
    let st = &mut *ctx.st;
    if st.registered {
        let _ = ctx.poll.deregister(st.fd);
        st.registered = false;
    }
    if st.backoff_timer.is_none() {
        st.backoff_timer = Some(
            ctx.timers
                .arm(TimerOwner::Server(ctx.index), ACCEPT_BACKOFF),
        );
    }
    crate::metrics::ACCEPT_BACKOFFS.increment();
}

/// The backoff timer fired: resume accepting.
pub(crate) fn backoff_expired(ctx: &mut ServerCtx<'_>) {
    ctx.st.backoff_timer = None;
    if !ctx.st.closing {
        ctx.attach();
    }
}

// ── Descriptor helpers ───────────────────────────────────────────

/// Create a non-blocking TCP listener: SO_REUSEADDR, bind, listen.
pub(crate) fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<RawFd> {
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
        return Err(io::Error::last_os_error());
    }

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);

    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }

    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }

    Ok(fd)
}

/// Fill a `sockaddr_storage` from a `SocketAddr`. Returns the address length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    // Zero the storage to avoid uninitialised padding bytes.
    unsafe {
        std::ptr::write_bytes(
            storage as *mut _ as *mut u8,
            0,
            mem::size_of::<libc::sockaddr_storage>(),
        );
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Convert a `sockaddr_storage` (from accept4/getsockname) to a `SocketAddr`.
pub(crate) fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}

/// The locally bound address of a descriptor.
pub(crate) fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    if fd < 0 {
        return None;
    }
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        return None;
    }
    sockaddr_to_socket_addr(&storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:9".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn unknown_family_is_none() {
        let storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        assert_eq!(sockaddr_to_socket_addr(&storage), None);
    }

    #[test]
    fn listener_binds_port_zero() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let fd = create_listener(addr, 16).unwrap();
        let bound = local_addr(fd).unwrap();
        assert_ne!(bound.port(), 0);
        unsafe {
            libc::close(fd);
        }
    }
}
