use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::buffer::WriteBuf;
use crate::handler::FileToken;
use crate::metrics;
use crate::poll::Waker;

/// A blocking operation packaged for the worker pool.
pub(crate) enum TaskOp {
    Open {
        path: PathBuf,
        flags: i32,
        mode: u32,
    },
    Read {
        fd: RawFd,
        buf: Vec<u8>,
    },
    Write {
        fd: RawFd,
        buf: WriteBuf,
        cursor: usize,
    },
    SendChunk {
        fd: RawFd,
        offset: Option<u64>,
        len: usize,
    },
    Close {
        fd: RawFd,
    },
}

/// A unit of work: opcode plus arguments, the owning file, and the channel
/// + wake handle that publish the result back to the loop thread. Immutable
/// once queued until the worker writes the result.
pub(crate) struct Task {
    pub owner: FileToken,
    pub op: TaskOp,
    pub reply: Sender<TaskDone>,
    pub wake: Arc<Waker>,
}

/// A completed task. The payload carries any buffers back to the loop
/// thread so release hooks and deliveries never run on a worker.
pub(crate) struct TaskDone {
    pub owner: FileToken,
    pub payload: DonePayload,
}

pub(crate) enum DonePayload {
    Open(io::Result<RawFd>),
    Read(io::Result<usize>, Vec<u8>),
    Write(io::Result<()>, WriteBuf),
    SendChunk(io::Result<Vec<u8>>),
    Close(io::Result<()>),
}

/// Fixed set of worker threads executing blocking file syscalls.
///
/// Submission is an unbounded FIFO; workers pop in order, run the syscall,
/// push the completion onto the task's reply channel, and wake the owning
/// loop's eventfd. Workers never touch loop-owned state.
pub struct ThreadPool {
    tx: Sender<Task>,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn an isolated pool with `threads` workers.
    pub fn new(threads: usize) -> Arc<ThreadPool> {
        let threads = threads.max(1);
        let (tx, rx) = unbounded::<Task>();

        let mut workers = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let rx: Receiver<Task> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("evline-worker-{worker_id}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        let payload = run_op(task.op);
                        metrics::POOL_TASKS.increment();
                        let done = TaskDone {
                            owner: task.owner,
                            payload,
                        };
                        // A dead receiver means the loop is gone; the
                        // payload (and any buffer in it) is dropped here.
                        let _ = task.reply.send(done);
                        task.wake.wake();
                    }
                })
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }

        Arc::new(ThreadPool {
            tx,
            _workers: workers,
        })
    }

    /// The process-wide pool, started lazily on first use and running until
    /// process exit. Tests construct isolated pools via [`ThreadPool::new`]
    /// and [`EventLoop::with_pool`](crate::EventLoop::with_pool) instead.
    pub fn global() -> Arc<ThreadPool> {
        static GLOBAL: OnceLock<Arc<ThreadPool>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                let threads = thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                ThreadPool::new(threads)
            })
            .clone()
    }

    pub(crate) fn submit(&self, task: Task) {
        self.tx.send(task).expect("pool workers exited");
    }
}

fn run_op(op: TaskOp) -> DonePayload {
    match op {
        TaskOp::Open { path, flags, mode } => DonePayload::Open(do_open(&path, flags, mode)),
        TaskOp::Read { fd, mut buf } => {
            let result = do_read(fd, &mut buf);
            DonePayload::Read(result, buf)
        }
        TaskOp::Write { fd, buf, cursor } => {
            let result = do_write_all(fd, buf.bytes(), cursor);
            DonePayload::Write(result, buf)
        }
        TaskOp::SendChunk { fd, offset, len } => DonePayload::SendChunk(do_read_chunk(fd, offset, len)),
        TaskOp::Close { fd } => {
            let ret = unsafe { libc::close(fd) };
            DonePayload::Close(if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            })
        }
    }
}

fn do_open(path: &std::path::Path, flags: i32, mode: u32) -> io::Result<RawFd> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    loop {
        let fd = unsafe { libc::open(cpath.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) };
        if fd >= 0 {
            return Ok(fd);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn do_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn do_write_all(fd: RawFd, bytes: &[u8], mut cursor: usize) -> io::Result<()> {
    while cursor < bytes.len() {
        let rem = &bytes[cursor..];
        let n = unsafe { libc::write(fd, rem.as_ptr() as *const libc::c_void, rem.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        cursor += n as usize;
    }
    Ok(())
}

fn do_read_chunk(fd: RawFd, offset: Option<u64>, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    loop {
        let n = match offset {
            Some(off) => unsafe {
                libc::pread(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    off as libc::off_t,
                )
            },
            None => unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) },
        };
        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(buf);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn token() -> FileToken {
        FileToken::new(0, 0)
    }

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("evline-pool-{tag}-{}", std::process::id()))
    }

    #[test]
    fn open_write_read_round_trip() {
        let pool = ThreadPool::new(1);
        let (tx, rx) = unbounded();
        let wake = Arc::new(Waker::new().unwrap());
        let path = temp_path("rw");

        pool.submit(Task {
            owner: token(),
            op: TaskOp::Open {
                path: path.clone(),
                flags: libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                mode: 0o644,
            },
            reply: tx.clone(),
            wake: wake.clone(),
        });
        let fd = match rx.recv_timeout(Duration::from_secs(5)).unwrap().payload {
            DonePayload::Open(Ok(fd)) => fd,
            other => panic!("unexpected completion: {:?}", kind_of(&other)),
        };

        pool.submit(Task {
            owner: token(),
            op: TaskOp::Write {
                fd,
                buf: WriteBuf::copy_from(b"pool data"),
                cursor: 0,
            },
            reply: tx.clone(),
            wake: wake.clone(),
        });
        match rx.recv_timeout(Duration::from_secs(5)).unwrap().payload {
            DonePayload::Write(Ok(()), _) => {}
            other => panic!("unexpected completion: {:?}", kind_of(&other)),
        }

        pool.submit(Task {
            owner: token(),
            op: TaskOp::SendChunk {
                fd,
                offset: Some(0),
                len: 64,
            },
            reply: tx.clone(),
            wake: wake.clone(),
        });
        match rx.recv_timeout(Duration::from_secs(5)).unwrap().payload {
            DonePayload::SendChunk(Ok(data)) => assert_eq!(&data, b"pool data"),
            other => panic!("unexpected completion: {:?}", kind_of(&other)),
        }

        pool.submit(Task {
            owner: token(),
            op: TaskOp::Close { fd },
            reply: tx,
            wake,
        });
        match rx.recv_timeout(Duration::from_secs(5)).unwrap().payload {
            DonePayload::Close(Ok(())) => {}
            other => panic!("unexpected completion: {:?}", kind_of(&other)),
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn completions_preserve_fifo_order_with_one_worker() {
        let pool = ThreadPool::new(1);
        let (tx, rx) = unbounded();
        let wake = Arc::new(Waker::new().unwrap());

        for i in 0..4u32 {
            pool.submit(Task {
                owner: FileToken::new(i as usize, i),
                op: TaskOp::Open {
                    path: PathBuf::from("/nonexistent/evline"),
                    flags: libc::O_RDONLY,
                    mode: 0,
                },
                reply: tx.clone(),
                wake: wake.clone(),
            });
        }
        for i in 0..4u32 {
            let done = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(done.owner.index(), i as usize);
            assert!(matches!(done.payload, DonePayload::Open(Err(_))));
        }
    }

    #[test]
    fn open_failure_reports_errno() {
        let pool = ThreadPool::new(2);
        let (tx, rx) = unbounded();
        let wake = Arc::new(Waker::new().unwrap());

        pool.submit(Task {
            owner: token(),
            op: TaskOp::Open {
                path: PathBuf::from("/nonexistent/evline-missing"),
                flags: libc::O_RDONLY,
                mode: 0,
            },
            reply: tx,
            wake,
        });
        match rx.recv_timeout(Duration::from_secs(5)).unwrap().payload {
            DonePayload::Open(Err(e)) => assert_eq!(e.raw_os_error(), Some(libc::ENOENT)),
            _ => panic!("open of missing path succeeded"),
        }
    }

    fn kind_of(payload: &DonePayload) -> &'static str {
        match payload {
            DonePayload::Open(_) => "open",
            DonePayload::Read(..) => "read",
            DonePayload::Write(..) => "write",
            DonePayload::SendChunk(_) => "send-chunk",
            DonePayload::Close(_) => "close",
        }
    }
}
