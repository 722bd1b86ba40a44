//! Bounded byte pipes.
//!
//! A pipe is a 64 KiB ring shared by one read-end file and one write-end
//! file. The shared state is independent of the endpoints: each endpoint
//! holds a strong reference and counts itself through the duplicate/close
//! hooks, so `fork`'s descriptor duplication and `close` keep the
//! endpoint counts exact. The last reference dropping frees the pipe.
//!
//! Blocking discipline (cooperative, by yielding):
//! - read on an empty pipe waits for data unless every writer is gone,
//!   which is end-of-file.
//! - write fills greedily and waits for space; when every reader is gone
//!   it returns however much was already written.

use alloc::sync::Arc;

use core::sync::atomic::{AtomicU64, Ordering};

use tachyon_core::sync::IrqLock;
use tachyon_fs::file::{File, FileHandle, FileOps, Mode};

use super::ring::RingBuffer;
use crate::sched;

/// Pipe buffer capacity.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Shared pipe state. Endpoint counts are atomics with acquire/release
/// ordering because interrupt handlers may inspect them.
struct Pipe {
    buffer: IrqLock<RingBuffer>,
    readers: AtomicU64,
    writers: AtomicU64,
}

/// One endpoint of a pipe; direction comes from the file's mode.
struct PipeEnd {
    pipe: Arc<Pipe>,
}

impl FileOps for PipeEnd {
    fn read(&self, file: &File, buf: &mut [u8]) -> u64 {
        if !file.mode().is_read() || buf.is_empty() {
            return 0;
        }

        loop {
            {
                let mut ring = self.pipe.buffer.lock();
                if !ring.is_empty() {
                    return ring.read(buf) as u64;
                }
            }
            if self.pipe.writers.load(Ordering::Acquire) == 0 {
                return 0; // end of file
            }
            sched::yield_now();
        }
    }

    fn write(&self, file: &File, buf: &[u8]) -> u64 {
        if !file.mode().is_write() {
            return 0;
        }

        let mut written = 0usize;
        while written < buf.len() {
            {
                let mut ring = self.pipe.buffer.lock();
                if ring.remaining() > 0 {
                    written += ring.write(&buf[written..]);
                    continue;
                }
            }
            if self.pipe.readers.load(Ordering::Acquire) == 0 {
                break; // nobody will ever drain the rest
            }
            sched::yield_now();
        }
        written as u64
    }

    fn on_duplicate(&self, file: &File) {
        if file.mode().is_read() {
            self.pipe.readers.fetch_add(1, Ordering::Relaxed);
        }
        if file.mode().is_write() {
            self.pipe.writers.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_close(&self, file: &File) {
        if file.mode().is_read() {
            self.pipe.readers.fetch_sub(1, Ordering::Release);
        }
        if file.mode().is_write() {
            self.pipe.writers.fetch_sub(1, Ordering::Release);
        }
        // The Arc inside each endpoint is the pipe's reference count;
        // the buffer frees with the last endpoint.
    }
}

/// Creates a pipe, returning `(read_end, write_end)`.
pub fn create_pipe() -> (FileHandle, FileHandle) {
    let pipe = Arc::new(Pipe {
        buffer: IrqLock::new(RingBuffer::new(PIPE_CAPACITY)),
        readers: AtomicU64::new(1),
        writers: AtomicU64::new(1),
    });

    let read_end = FileHandle::new(
        Arc::new(PipeEnd { pipe: pipe.clone() }),
        None,
        Mode::Read,
    );
    let write_end = FileHandle::new(Arc::new(PipeEnd { pipe }), None, Mode::Write);
    (read_end, write_end)
}
