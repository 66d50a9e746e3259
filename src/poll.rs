use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Object kinds encoded in the upper 8 bits of a watch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WatchKind {
    Socket = 0,
    Server = 1,
}

impl WatchKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(WatchKind::Socket),
            1 => Some(WatchKind::Server),
            _ => None,
        }
    }
}

/// Encoded epoll user data identifying the owner of a readiness event.
///
/// Layout (64-bit):
/// ```text
/// Bits 63..56: WatchKind (8 bits)
/// Bits 55..0:  slot index
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WatchKey(pub u64);

impl WatchKey {
    const KIND_SHIFT: u64 = 56;
    const INDEX_MASK: u64 = (1 << Self::KIND_SHIFT) - 1;

    /// Reserved key for the loop's wakeup eventfd.
    pub(crate) const WAKE: WatchKey = WatchKey(u64::MAX);

    #[inline]
    pub(crate) fn encode(kind: WatchKind, index: usize) -> Self {
        debug_assert!((index as u64) < (1 << Self::KIND_SHIFT));
        WatchKey(((kind as u64) << Self::KIND_SHIFT) | (index as u64 & Self::INDEX_MASK))
    }

    #[inline]
    pub(crate) fn kind(self) -> Option<WatchKind> {
        WatchKind::from_u8((self.0 >> Self::KIND_SHIFT) as u8)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }
}

/// A readiness event delivered by [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub key: WatchKey,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Cross-thread wake handle for the loop's eventfd.
///
/// Cloned (via `Arc`) into thread-pool tasks and shutdown handles; writing
/// the counter makes a blocked `epoll_wait` return. The fd stays open until
/// the last clone drops, so a completion racing loop teardown hits a dead
/// counter rather than a recycled descriptor.
pub(crate) struct Waker {
    fd: RawFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Waker { fd })
    }

    pub(crate) fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Thin epoll wrapper: fd watchers with per-direction enable bits, a
/// millisecond-granularity wait, and an eventfd waker registered under a
/// reserved key.
pub(crate) struct Poller {
    epfd: RawFd,
    waker: Arc<Waker>,
    events: Vec<libc::epoll_event>,
}

const EVENT_CAPACITY: usize = 256;

fn interest_bits(read: bool, write: bool) -> u32 {
    let mut ev = 0u32;
    if read {
        // RDHUP rides with read interest; otherwise a half-closed peer
        // would keep a level-triggered loop spinning while reads are off.
        ev |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if write {
        ev |= libc::EPOLLOUT as u32;
    }
    ev
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        let waker = match Waker::new() {
            Ok(w) => w,
            Err(err) => {
                unsafe {
                    libc::close(epfd);
                }
                return Err(err);
            }
        };

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WatchKey::WAKE.0,
        };
        let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, waker.fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
            }
            return Err(err);
        }

        Ok(Poller {
            epfd,
            waker: Arc::new(waker),
            events: Vec::with_capacity(EVENT_CAPACITY),
        })
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        key: WatchKey,
        read: bool,
        write: bool,
    ) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_bits(read, write),
            u64: key.0,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn modify(
        &mut self,
        fd: RawFd,
        key: WatchKey,
        read: bool,
        write: bool,
    ) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_bits(read, write),
            u64: key.0,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for readiness. Returns the delivered events plus whether the
    /// wakeup eventfd fired (its counter is drained here, never surfaced).
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<(Vec<Event>, bool)> {
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => {
                // Round up so a 100us deadline does not spin at 0ms.
                let ms = d.as_millis();
                let ms = if ms == 0 && !d.is_zero() { 1 } else { ms };
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        self.events.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                EVENT_CAPACITY as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok((Vec::new(), false));
            }
            return Err(err);
        }
        // Safety: epoll_wait wrote `n` entries into the spare capacity.
        unsafe {
            self.events.set_len(n as usize);
        }

        let mut out = Vec::with_capacity(n as usize);
        let mut woke = false;
        for raw in &self.events {
            let key = WatchKey(raw.u64);
            if key == WatchKey::WAKE {
                let mut counter = [0u8; 8];
                unsafe {
                    libc::read(
                        self.waker.fd,
                        counter.as_mut_ptr() as *mut libc::c_void,
                        8,
                    );
                }
                woke = true;
                continue;
            }
            let bits = raw.events;
            out.push(Event {
                key,
                readable: bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                error: bits & libc::EPOLLERR as u32 != 0,
                hangup: bits & libc::EPOLLHUP as u32 != 0,
            });
        }
        Ok((out, woke))
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip() {
        let key = WatchKey::encode(WatchKind::Socket, 0xAB_CDEF);
        assert_eq!(key.kind(), Some(WatchKind::Socket));
        assert_eq!(key.index(), 0xAB_CDEF);

        let key = WatchKey::encode(WatchKind::Server, 7);
        assert_eq!(key.kind(), Some(WatchKind::Server));
        assert_eq!(key.index(), 7);
    }

    #[test]
    fn wake_key_is_reserved() {
        assert_eq!(WatchKey::WAKE.kind(), None);
    }

    #[test]
    fn waker_unblocks_wait() {
        let mut poller = Poller::new().unwrap();
        let waker = poller.waker();
        waker.wake();
        let (events, woke) = poller.wait(Some(Duration::from_secs(5))).unwrap();
        assert!(woke);
        assert!(events.is_empty());
    }

    #[test]
    fn timeout_elapses() {
        let mut poller = Poller::new().unwrap();
        let start = std::time::Instant::now();
        let (events, woke) = poller.wait(Some(Duration::from_millis(20))).unwrap();
        assert!(events.is_empty());
        assert!(!woke);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
