use bytes::Bytes;

/// Trait for caller-owned write payloads.
///
/// The guard keeps the payload alive while it sits in a write queue. Its
/// `Drop` impl is the release hook: the library drops the guard exactly once
/// when it relinquishes the buffer — after full transmission, on a write
/// failure, or during object teardown with the queue still populated.
/// Release does not imply the bytes reached the peer.
pub trait WriteGuard: Send + 'static {
    /// The bytes to transmit.
    fn bytes(&self) -> &[u8];
}

enum BufData {
    Owned(Vec<u8>),
    Shared(Bytes),
    Guarded(Box<dyn WriteGuard>),
}

/// An owned write payload queued on a socket or file.
///
/// Moved into the library by `write()` and dropped exactly once when the
/// library is done with it. The payload is never copied — except by
/// [`WriteBuf::copy_from`], which exists precisely to duplicate borrowed
/// bytes (the `write_simple` path).
pub struct WriteBuf {
    data: BufData,
}

impl WriteBuf {
    /// Wrap an owned byte vector. Release drops the vector.
    pub fn from_vec(data: Vec<u8>) -> Self {
        WriteBuf {
            data: BufData::Owned(data),
        }
    }

    /// Duplicate borrowed bytes into a fresh allocation.
    ///
    /// This is the only allocation the library performs on the data path.
    pub fn copy_from(bytes: &[u8]) -> Self {
        WriteBuf {
            data: BufData::Owned(bytes.to_vec()),
        }
    }

    /// Wrap a cheaply-cloneable shared payload, for fanning the same bytes
    /// out to several queues without copying.
    pub fn from_bytes(data: Bytes) -> Self {
        WriteBuf {
            data: BufData::Shared(data),
        }
    }

    /// Wrap a caller-owned payload with a release-on-drop guard.
    pub fn from_guard<G: WriteGuard>(guard: G) -> Self {
        WriteBuf {
            data: BufData::Guarded(Box::new(guard)),
        }
    }

    /// The payload bytes.
    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            BufData::Owned(v) => v,
            BufData::Shared(b) => b,
            BufData::Guarded(g) => g.bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

impl From<Vec<u8>> for WriteBuf {
    fn from(v: Vec<u8>) -> Self {
        WriteBuf::from_vec(v)
    }
}

impl From<Bytes> for WriteBuf {
    fn from(b: Bytes) -> Self {
        WriteBuf::from_bytes(b)
    }
}

impl std::fmt::Debug for WriteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuf").field("len", &self.len()).finish()
    }
}
