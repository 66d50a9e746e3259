use std::net::SocketAddr;

use crate::error::Error;
use crate::file::FileCtx;
use crate::server::ServerCtx;
use crate::socket::{SocketCtx, SocketOptions};

/// Opaque handle to a socket owned by an event loop.
///
/// Encodes the slot index and a generation for stale detection: a token
/// outlives its socket harmlessly, lookups just return `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl SocketToken {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        SocketToken {
            index: index as u32,
            generation,
        }
    }

    /// The slot index. Useful for indexing per-connection user arrays.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Opaque handle to a listener owned by an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ServerToken {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        ServerToken {
            index: index as u32,
            generation,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Opaque handle to a file owned by an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl FileToken {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        FileToken {
            index: index as u32,
            generation,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Callbacks a socket may emit. Implemented by the user; the handler's own
/// fields stand in for the traditional opaque `data` pointer.
///
/// Callbacks are serialized on the loop thread in event order. `on_close`
/// is always last, always deferred to a fresh loop turn, and receives no
/// context: the slot is already vacated and the handler is dropped right
/// after it returns, so the owner may tear down freely inside it.
///
/// `Send` because the owning loop may itself be moved to another thread
/// before running; callbacks still never run concurrently.
pub trait SocketHandler: Send {
    /// The socket reached the open state (TCP established, and for secure
    /// sockets the TLS handshake completed).
    fn on_connect(&mut self, _sock: &mut SocketCtx<'_>) {}

    /// Bytes arrived. `data` is valid only during the call; the library
    /// reuses the buffer for the next read. An empty slice signals peer
    /// end-of-stream — which may still be delivered once after
    /// `read_stop`, since stopping races with already-observed readiness.
    fn on_read(&mut self, sock: &mut SocketCtx<'_>, data: &[u8]);

    /// The write queue transitioned from non-empty to empty.
    fn on_drain(&mut self, _sock: &mut SocketCtx<'_>) {}

    /// An error was observed. Fatal errors ([`Error::is_fatal`]) are
    /// followed by the close path and a final `on_close`.
    fn on_error(&mut self, _sock: &mut SocketCtx<'_>, _err: &Error) {}

    /// The inactivity timer elapsed with no progress in either direction.
    /// The library takes no further action: call `close()` or
    /// `reset_timeout()` here, or do nothing and the timer stays quiet
    /// until the next progress event re-arms it.
    fn on_timeout(&mut self, _sock: &mut SocketCtx<'_>) {}

    /// Terminal callback. The socket's descriptor is closed and every
    /// queued write buffer has been released before this runs.
    fn on_close(&mut self) {}
}

/// The result of accepting a connection: options plus the handler for the
/// freshly created socket.
pub struct Accepted {
    pub options: SocketOptions,
    pub handler: Box<dyn SocketHandler>,
}

/// Callbacks a listener may emit.
pub trait ServerHandler: Send {
    /// A connection arrived. Return `None` to reject it (the descriptor is
    /// closed); return [`Accepted`] to install a socket for it. The new
    /// socket is attached to the same loop, its timer armed, and its
    /// `on_connect` invoked once it reaches open.
    fn on_connection(&mut self, srv: &mut ServerCtx<'_>, peer: SocketAddr) -> Option<Accepted>;

    /// Accept-path error. Fatal descriptor exhaustion (`EMFILE`/`ENFILE`)
    /// is reported here; the accept watcher backs off briefly and re-arms.
    fn on_error(&mut self, _srv: &mut ServerCtx<'_>, _err: &Error) {}

    /// Terminal callback, deferred like the socket variant.
    fn on_close(&mut self) {}
}

/// Callbacks a file may emit.
pub trait FileHandler: Send {
    /// The descriptor is open and operations may be issued.
    fn on_open(&mut self, _file: &mut FileCtx<'_>) {}

    /// A read completed; `data` lives in the file's read buffer and is
    /// valid only during the call. An empty slice signals end-of-file.
    fn on_read(&mut self, _file: &mut FileCtx<'_>, _data: &[u8]) {}

    /// The write queue emptied, or a `send` transfer finished.
    fn on_drain(&mut self, _file: &mut FileCtx<'_>) {}

    /// A file operation failed. The file stays usable unless it was
    /// already closing.
    fn on_error(&mut self, _file: &mut FileCtx<'_>, _err: &Error) {}

    /// Terminal callback, deferred like the socket variant.
    fn on_close(&mut self) {}
}
