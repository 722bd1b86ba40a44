//! Syscall dispatch.
//!
//! One dispatcher keyed on RAX with arguments in RDI, RSI, RDX, R10, R8,
//! R9 (System V order with R10 standing in for the RCX that SYSCALL
//! clobbers). Results return in RAX; every failure is −1 after logging
//! the cause. Unknown numbers are logged and rejected.
//!
//! User pointers are validated against the lower half before being
//! dereferenced; the user's address space stays live under the current
//! CR3 for the whole syscall.

use alloc::string::String;
use alloc::vec::Vec;

use tachyon_fs::file::{FileHandle, Mode, SeekFrom};
use tachyon_mm::layout::LOWER_HALF_END;
use tachyon_sched::{Land, StackFrame};

use crate::ipc::event;
use crate::{fs, proc, sched};

/// Syscall numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    /// Read from a descriptor.
    Read = 0,
    /// Write to a descriptor.
    Write = 1,
    /// Open a path.
    Open = 2,
    /// Close a descriptor.
    Close = 3,
    /// Stat a path.
    Stat = 4,
    /// Wait on event descriptors.
    Poll = 7,
    /// Move a descriptor's cursor.
    Seek = 8,
    /// Driver-specific control.
    Ioctl = 16,
    /// Give up the CPU.
    Yield = 24,
    /// Terminate the calling process.
    Exit = 60,
    /// Create an event descriptor.
    EventCreate = 284,
}

/// Bytes `Stat` writes to user memory: size (u64), then 1 for a
/// directory or 0 for a file (u64).
const STAT_RECORD_LEN: u64 = 16;

/// Checks a user buffer range: non-null, no wraparound, and confined to
/// the lower half for user-land callers.
fn check_user_range(ptr: u64, len: u64) -> bool {
    if ptr == 0 || ptr.checked_add(len).is_none() {
        return false;
    }
    if sched::current_process().land == Land::User && ptr + len > LOWER_HALF_END {
        return false;
    }
    true
}

/// # Safety: the range was checked and the owning mapping is live under
/// the current CR3 for the duration of the syscall.
fn user_bytes<'a>(ptr: u64, len: u64) -> Option<&'a [u8]> {
    if !check_user_range(ptr, len) {
        return None;
    }
    // SAFETY: See above.
    Some(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) })
}

fn user_bytes_mut<'a>(ptr: u64, len: u64) -> Option<&'a mut [u8]> {
    if !check_user_range(ptr, len) {
        return None;
    }
    // SAFETY: See `user_bytes`.
    Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

fn user_str<'a>(ptr: u64, len: u64) -> Option<&'a str> {
    core::str::from_utf8(user_bytes(ptr, len)?).ok()
}

/// Resolves a possibly-relative path against the caller's working
/// directory.
fn absolute_path(path: &str) -> String {
    if path.starts_with('/') {
        String::from(path)
    } else {
        let cwd = sched::current_process().cwd();
        let mut joined = cwd;
        if !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(path);
        joined
    }
}

fn descriptor(fd: u64) -> Option<FileHandle> {
    let fd = u32::try_from(fd).ok()?;
    sched::current_process().fd_table.lock().get(fd).cloned()
}

fn sys_read(fd: u64, buf_ptr: u64, len: u64) -> i64 {
    let Some(handle) = descriptor(fd) else {
        return -1;
    };
    let Some(buf) = user_bytes_mut(buf_ptr, len) else {
        return -1;
    };
    handle.read(buf) as i64
}

fn sys_write(fd: u64, buf_ptr: u64, len: u64) -> i64 {
    let Some(handle) = descriptor(fd) else {
        return -1;
    };
    let Some(buf) = user_bytes(buf_ptr, len) else {
        return -1;
    };
    handle.write(buf) as i64
}

fn sys_open(path_ptr: u64, path_len: u64, mode: u64) -> i64 {
    let Some(path) = user_str(path_ptr, path_len) else {
        return -1;
    };
    let mode = match mode {
        0 => Mode::Read,
        1 => Mode::Write,
        2 => Mode::ReadWrite,
        _ => return -1,
    };

    let path = absolute_path(path);
    match fs::vfs().open(&path, mode) {
        Ok(handle) => {
            let current = sched::current_process();
            let added = current.fd_table.lock().add(handle);
            match added {
                Ok(fd) => i64::from(fd),
                Err(_) => -1,
            }
        }
        Err(err) => {
            tachyon_core::kerr!("syscall: open '{path}' failed: {err:?}");
            -1
        }
    }
}

fn sys_close(fd: u64) -> i64 {
    let Ok(fd) = u32::try_from(fd) else {
        return -1;
    };
    match sched::current_process().fd_table.lock().remove(fd) {
        Some(handle) => {
            drop(handle);
            0
        }
        None => -1,
    }
}

fn sys_stat(path_ptr: u64, path_len: u64, out_ptr: u64) -> i64 {
    let Some(path) = user_str(path_ptr, path_len) else {
        return -1;
    };
    let Some(out) = user_bytes_mut(out_ptr, STAT_RECORD_LEN) else {
        return -1;
    };

    let path = absolute_path(path);
    match fs::vfs().find(&path) {
        Ok(node) => {
            let directory = u64::from(node.node_type() == tachyon_fs::NodeType::Directory);
            out[..8].copy_from_slice(&node.size().to_ne_bytes());
            out[8..].copy_from_slice(&directory.to_ne_bytes());
            0
        }
        Err(_) => -1,
    }
}

fn sys_seek(fd: u64, offset: u64, whence: u64) -> i64 {
    let Some(handle) = descriptor(fd) else {
        return -1;
    };
    let from = match whence {
        0 => SeekFrom::Start,
        1 => SeekFrom::Current,
        2 => SeekFrom::End,
        _ => return -1,
    };
    handle.seek(from, offset as i64) as i64
}

fn sys_ioctl(fd: u64, op: u64, arg: u64) -> i64 {
    let Some(handle) = descriptor(fd) else {
        return -1;
    };
    handle.ioctl(op, arg) as i64
}

fn sys_event_create() -> i64 {
    let handle = event::create_event(None, 0);
    match sched::current_process().fd_table.lock().add(handle) {
        Ok(fd) => i64::from(fd),
        Err(_) => -1,
    }
}

fn sys_poll(fds_ptr: u64, count: u64, reset: u64) -> i64 {
    if count > event::MAX_WAIT_FILES as u64 {
        return -1;
    }
    let Some(raw) = user_bytes(fds_ptr, count * 8) else {
        return -1;
    };

    let mut handles: Vec<FileHandle> = Vec::with_capacity(count as usize);
    for index in 0..count as usize {
        let mut fd = [0u8; 8];
        fd.copy_from_slice(&raw[index * 8..index * 8 + 8]);
        let Some(handle) = descriptor(u64::from_ne_bytes(fd)) else {
            return -1;
        };
        handles.push(handle);
    }

    let refs: Vec<&FileHandle> = handles.iter().collect();
    event::wait_on_events(&refs, reset != 0) as i64
}

/// Dispatcher called from the syscall entry stub. Reads arguments out of
/// the saved frame and writes the result into its `rax` slot.
pub(crate) extern "C" fn dispatch(number: u64, frame: *mut StackFrame) {
    // SAFETY: The entry stub passes a pointer to the frame it just built
    // on the current kernel stack.
    let frame = unsafe { &mut *frame };

    let result = match number {
        n if n == SyscallNumber::Read as u64 => sys_read(frame.rdi, frame.rsi, frame.rdx),
        n if n == SyscallNumber::Write as u64 => sys_write(frame.rdi, frame.rsi, frame.rdx),
        n if n == SyscallNumber::Open as u64 => sys_open(frame.rdi, frame.rsi, frame.rdx),
        n if n == SyscallNumber::Close as u64 => sys_close(frame.rdi),
        n if n == SyscallNumber::Stat as u64 => sys_stat(frame.rdi, frame.rsi, frame.rdx),
        n if n == SyscallNumber::Poll as u64 => sys_poll(frame.rdi, frame.rsi, frame.rdx),
        n if n == SyscallNumber::Seek as u64 => sys_seek(frame.rdi, frame.rsi, frame.rdx),
        n if n == SyscallNumber::Ioctl as u64 => sys_ioctl(frame.rdi, frame.rsi, frame.rdx),
        n if n == SyscallNumber::Yield as u64 => {
            sched::yield_now();
            0
        }
        n if n == SyscallNumber::Exit as u64 => sched::exit(frame.rdi),
        n if n == SyscallNumber::EventCreate as u64 => sys_event_create(),
        _ => {
            let caller = sched::current_id().unwrap_or(proc::NO_PROCESS);
            tachyon_core::kerr!("syscall: unknown number {number} from process {caller}");
            -1
        }
    };

    frame.rax = result as u64;
}
