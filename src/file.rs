use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::buffer::WriteBuf;
use crate::error::Error;
use crate::event_loop::{Deferred, Owner};
use crate::handler::{FileHandler, FileToken, SocketToken};
use crate::poll::Waker;
use crate::pool::{Task, TaskDone, TaskOp, ThreadPool};

/// Bytes moved per `send` chunk between a file and a socket.
pub(crate) const SEND_CHUNK: usize = 64 * 1024;

/// In-flight file→socket transfer.
pub(crate) struct SendOp {
    pub dst: SocketToken,
    pub offset: Option<u64>,
    pub remaining: Option<u64>,
}

/// Per-file state owned by the event loop.
///
/// Every blocking operation runs as a pool task; at most one task per
/// category (open/read/write/send/close) is in flight at a time, tracked
/// by the boolean flags below.
pub(crate) struct FileState {
    pub fd: RawFd,
    pub generation: u32,
    pub handler: Option<Box<dyn FileHandler>>,
    pub opening: bool,
    pub reading: bool,
    pub writing: bool,
    pub sending: bool,
    pub closing_task: bool,
    pub read_started: bool,
    pub read_size: usize,
    pub queue: VecDeque<WriteBuf>,
    pub closing: bool,
    pub close_scheduled: bool,
    pub is_std: bool,
    pub send: Option<SendOp>,
}

impl FileState {
    pub(crate) fn new(generation: u32, handler: Box<dyn FileHandler>) -> FileState {
        FileState {
            fd: -1,
            generation,
            handler: Some(handler),
            opening: false,
            reading: false,
            writing: false,
            sending: false,
            closing_task: false,
            read_started: false,
            read_size: 0,
            queue: VecDeque::new(),
            closing: false,
            close_scheduled: false,
            is_std: false,
            send: None,
        }
    }

    pub(crate) fn task_in_flight(&self) -> bool {
        self.opening || self.reading || self.writing || self.sending || self.closing_task
    }
}

/// Operations on a live file, handed to its callbacks and available
/// through [`EventLoop::file_ctx`](crate::EventLoop::file_ctx).
pub struct FileCtx<'a> {
    pub(crate) st: &'a mut FileState,
    pub(crate) index: usize,
    pub(crate) pool: &'a Arc<ThreadPool>,
    pub(crate) done_tx: &'a Sender<TaskDone>,
    pub(crate) waker: &'a Arc<Waker>,
    pub(crate) deferred: &'a mut VecDeque<Deferred>,
}

impl<'a> FileCtx<'a> {
    pub fn token(&self) -> FileToken {
        FileToken::new(self.index, self.st.generation)
    }

    pub fn is_open(&self) -> bool {
        self.st.fd >= 0
    }

    /// Open a path with raw `open(2)` flags and mode. Completion is
    /// reported through `on_open` (or `on_error`).
    pub fn open_path(
        &mut self,
        path: impl Into<PathBuf>,
        flags: i32,
        mode: u32,
    ) -> Result<(), Error> {
        if self.st.closing {
            return Err(Error::Closing);
        }
        if self.st.fd >= 0 || self.st.opening {
            return Err(Error::AlreadyOpen);
        }
        self.st.opening = true;
        submit(
            self,
            TaskOp::Open {
                path: path.into(),
                flags,
                mode,
            },
        );
        Ok(())
    }

    pub fn open_stdin(&mut self) -> Result<(), Error> {
        self.open_std(libc::STDIN_FILENO)
    }

    pub fn open_stdout(&mut self) -> Result<(), Error> {
        self.open_std(libc::STDOUT_FILENO)
    }

    pub fn open_stderr(&mut self) -> Result<(), Error> {
        self.open_std(libc::STDERR_FILENO)
    }

    fn open_std(&mut self, fd: RawFd) -> Result<(), Error> {
        if self.st.closing {
            return Err(Error::Closing);
        }
        if self.st.fd >= 0 || self.st.opening {
            return Err(Error::AlreadyOpen);
        }
        self.st.fd = fd;
        self.st.is_std = true;
        self.deferred.push_back(Deferred::FileOpened {
            index: self.index,
            generation: self.st.generation,
        });
        Ok(())
    }

    /// Begin sequential reads of `size`-byte chunks, delivered through
    /// `on_read` until an empty delivery marks end-of-file.
    pub fn read_start(&mut self, size: usize) -> Result<(), Error> {
        if self.st.closing {
            return Err(Error::Closing);
        }
        self.st.read_started = true;
        self.st.read_size = size.max(1);
        kick_read(self);
        Ok(())
    }

    pub fn read_stop(&mut self) {
        self.st.read_started = false;
    }

    /// Queue an owned buffer for writing. Writes run one task at a time in
    /// FIFO order; `on_drain` fires when the queue empties.
    pub fn write(&mut self, buf: WriteBuf) -> Result<(), Error> {
        if self.st.closing {
            return Err(Error::Closing);
        }
        self.st.queue.push_back(buf);
        kick_write(self);
        Ok(())
    }

    pub fn write_simple(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.write(WriteBuf::copy_from(bytes))
    }

    /// Stream this file into a socket's write queue, `SEND_CHUNK` bytes at
    /// a time so socket backpressure paces the disk reads. `offset` of
    /// `None` reads from the current position; `len` of `None` streams to
    /// end-of-file. `on_drain` fires when the transfer completes.
    pub fn send(
        &mut self,
        dst: SocketToken,
        offset: Option<u64>,
        len: Option<u64>,
    ) -> Result<(), Error> {
        if self.st.closing {
            return Err(Error::Closing);
        }
        if self.st.fd < 0 {
            return Err(Error::NotOpen);
        }
        if self.st.sending {
            return Err(Error::Busy);
        }
        self.st.sending = true;
        self.st.send = Some(SendOp {
            dst,
            offset,
            remaining: len,
        });
        submit_next_send_chunk(self);
        Ok(())
    }

    /// Close the file. Queued behind any in-flight tasks; `on_close` is
    /// delivered on a later loop turn.
    pub fn close(&mut self) {
        if self.st.closing {
            return;
        }
        self.st.closing = true;
        self.st.read_started = false;
        kick_close(self);
    }

    /// Remove the file from the loop without closing the descriptor. No
    /// further callbacks are delivered; results of in-flight tasks are
    /// discarded.
    pub fn detach(&mut self) {
        self.deferred
            .push_back(Deferred::Detach(Owner::File(self.index)));
    }
}

// ── Task plumbing ────────────────────────────────────────────────

pub(crate) fn submit(ctx: &mut FileCtx<'_>, op: TaskOp) {
    ctx.pool.submit(Task {
        owner: FileToken::new(ctx.index, ctx.st.generation),
        op,
        reply: ctx.done_tx.clone(),
        wake: ctx.waker.clone(),
    });
}

pub(crate) fn with_handler<R>(
    ctx: &mut FileCtx<'_>,
    f: impl FnOnce(&mut dyn FileHandler, &mut FileCtx<'_>) -> R,
) -> Option<R> {
    let mut handler = ctx.st.handler.take()?;
    let result = f(&mut *handler, ctx);
    ctx.st.handler = Some(handler);
    Some(result)
}

pub(crate) fn kick_read(ctx: &mut FileCtx<'_>) {
    if ctx.st.fd >= 0 && ctx.st.read_started && !ctx.st.reading && !ctx.st.closing {
        ctx.st.reading = true;
        let fd = ctx.st.fd;
        let size = ctx.st.read_size;
        submit(
            ctx,
            TaskOp::Read {
                fd,
                buf: vec![0u8; size],
            },
        );
    }
}

pub(crate) fn kick_write(ctx: &mut FileCtx<'_>) {
    if ctx.st.fd >= 0 && !ctx.st.writing {
        if let Some(buf) = ctx.st.queue.pop_front() {
            ctx.st.writing = true;
            let fd = ctx.st.fd;
            submit(ctx, TaskOp::Write { fd, buf, cursor: 0 });
        }
    }
}

/// Submit the close task once every other category has drained, or
/// schedule the deferred `on_close` directly when there is nothing to close.
pub(crate) fn kick_close(ctx: &mut FileCtx<'_>) {
    let st = &mut *ctx.st;
    if !st.closing || st.close_scheduled {
        return;
    }
    if st.task_in_flight() {
        return;
    }
    if st.fd >= 0 && !st.is_std {
        st.closing_task = true;
        let fd = st.fd;
        st.fd = -1;
        submit(ctx, TaskOp::Close { fd });
    } else {
        st.fd = -1;
        st.close_scheduled = true;
        ctx.deferred
            .push_back(Deferred::Close(Owner::File(ctx.index)));
    }
}

/// After open completes: restart whatever the user queued while opening.
pub(crate) fn kick_after_open(ctx: &mut FileCtx<'_>) {
    kick_read(ctx);
    kick_write(ctx);
    kick_close(ctx);
}

pub(crate) fn submit_next_send_chunk(ctx: &mut FileCtx<'_>) {
    let fd = ctx.st.fd;
    let (offset, len) = match &ctx.st.send {
        Some(op) => (
            op.offset,
            op.remaining
                .map_or(SEND_CHUNK, |r| r.min(SEND_CHUNK as u64) as usize),
        ),
        None => return,
    };
    submit(ctx, TaskOp::SendChunk { fd, offset, len });
}

/// Account for a completed chunk of `n` bytes.
pub(crate) fn advance_send(st: &mut FileState, n: u64) {
    if let Some(op) = st.send.as_mut() {
        if let Some(off) = op.offset.as_mut() {
            *off += n;
        }
        if let Some(rem) = op.remaining.as_mut() {
            *rem = rem.saturating_sub(n);
        }
    }
}

/// Terminate a `send` transfer, reporting completion or failure.
pub(crate) fn finish_send(ctx: &mut FileCtx<'_>, result: Result<(), Error>) {
    ctx.st.sending = false;
    ctx.st.send = None;
    match result {
        Ok(()) => {
            with_handler(ctx, |h, ctx| h.on_drain(ctx));
        }
        Err(err) => {
            with_handler(ctx, |h, ctx| h.on_error(ctx, &err));
        }
    }
    kick_close(ctx);
}
