use std::io;

use thiserror::Error;

/// Errors produced by the evline loop and its objects.
///
/// Setup-phase operations (`connect`, `listen`, `open_path`, ...) return
/// these directly. Data-phase failures are delivered to the owning object's
/// `on_error` callback and never retained beyond it.
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall failed. Carries the OS error code.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// TLS handshake, record, or shutdown failure. The session is unusable
    /// and the socket transitions to closed.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    /// An address record could not be expressed as a socket address.
    #[error("unsupported address family")]
    UnsupportedAddress,
    /// The token does not refer to a live object (slot reused or closed).
    #[error("stale or unknown token")]
    StaleToken,
    /// The operation was issued on an object that is shutting down.
    #[error("object is closing")]
    Closing,
    /// File operation issued before the file was opened.
    #[error("file is not open")]
    NotOpen,
    /// `open_*` issued on a file that is already open or opening.
    #[error("file is already open")]
    AlreadyOpen,
    /// A write was issued after `write_eof` was requested.
    #[error("write after end-of-file was requested")]
    WriteAfterEof,
    /// An operation of this category is already in flight.
    #[error("operation already in flight")]
    Busy,
}

impl Error {
    /// The raw OS error code, when this error wraps a failed syscall.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Whether this error is fatal for the object that reported it.
    /// Fatal errors are always followed by the close path and `on_close`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Tls(_))
    }

    pub(crate) fn last_os() -> Self {
        Error::Io(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_code() {
        let err = Error::Io(io::Error::from_raw_os_error(libc::EPIPE));
        assert_eq!(err.os_error(), Some(libc::EPIPE));
        assert!(err.is_fatal());
    }

    #[test]
    fn misuse_is_not_fatal() {
        assert!(!Error::WriteAfterEof.is_fatal());
        assert!(!Error::AlreadyOpen.is_fatal());
        assert_eq!(Error::Busy.os_error(), None);
    }
}
