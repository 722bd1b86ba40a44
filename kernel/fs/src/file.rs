//! Open files, file handles and file descriptor tables.
//!
//! A [`File`] is one open of a node (or an anonymous object like a pipe
//! end): operations vtable, optional node, mode and cursor. The owning
//! [`FileHandle`] carries the reference-count semantics: cloning fires the
//! duplicate hooks, dropping the last handle fires the close hooks and
//! releases the node's open claim.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{AsAny, FsError, Node};

/// Sentinel returned by `ioctl` for unknown opcodes.
pub const IOCTL_UNKNOWN: u64 = u64::MAX;

/// How a file was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Both directions.
    ReadWrite,
}

impl Mode {
    /// Whether reads are allowed.
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether writes are allowed.
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Cursor anchor for [`FileHandle::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    /// Absolute offset.
    Start,
    /// Relative to the current cursor.
    Current,
    /// Relative to the file size the backend reports.
    End,
}

/// Operations behind an open file.
///
/// `read`/`write` return the byte count moved; 0 doubles as end-of-file
/// and as refusal (a write to a read-only open). The hooks default to
/// no-ops; pipes use them for endpoint accounting.
pub trait FileOps: AsAny + Send + Sync {
    /// Current size, used for `SeekFrom::End`. Anonymous objects keep 0.
    fn size(&self, _file: &File) -> u64 {
        0
    }

    /// Moves the cursor and returns its new value.
    fn seek(&self, file: &File, from: SeekFrom, offset: i64) -> u64 {
        file.apply_seek(self.size(file), from, offset)
    }

    /// Reads into `buf` at the cursor, advancing it.
    fn read(&self, file: &File, buf: &mut [u8]) -> u64;

    /// Writes `buf` at the cursor, advancing it.
    fn write(&self, file: &File, buf: &[u8]) -> u64;

    /// Driver-specific control. Unknown opcodes return [`IOCTL_UNKNOWN`].
    fn ioctl(&self, _file: &File, _op: u64, _arg: u64) -> u64 {
        IOCTL_UNKNOWN
    }

    /// Invoked when the last handle to the file is dropped.
    fn on_close(&self, _file: &File) {}

    /// Invoked when a handle to the file is cloned.
    fn on_duplicate(&self, _file: &File) {}
}

/// One open file.
pub struct File {
    ops: Arc<dyn FileOps>,
    node: Option<Arc<Node>>,
    mode: Mode,
    cursor: AtomicU64,
}

impl File {
    /// The node behind this file; `None` for anonymous files (pipes,
    /// events).
    #[must_use]
    pub fn node(&self) -> Option<&Arc<Node>> {
        self.node.as_ref()
    }

    /// Open mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current cursor position.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Moves the cursor to `position`.
    pub fn set_cursor(&self, position: u64) {
        self.cursor.store(position, Ordering::Relaxed);
    }

    /// Advances the cursor by `count`.
    pub fn advance_cursor(&self, count: u64) {
        self.cursor.fetch_add(count, Ordering::Relaxed);
    }

    /// Applies Start/Current/End seek arithmetic against `size`,
    /// saturating below zero, and returns the new cursor.
    pub fn apply_seek(&self, size: u64, from: SeekFrom, offset: i64) -> u64 {
        let base = match from {
            SeekFrom::Start => 0,
            SeekFrom::Current => self.cursor(),
            SeekFrom::End => size,
        };
        let target = if offset.is_negative() {
            base.saturating_sub(offset.unsigned_abs())
        } else {
            base.saturating_add(offset.unsigned_abs())
        };
        self.set_cursor(target);
        target
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let Some(node) = &self.node {
            node.end_open(self.mode);
            node.driver().on_close(self);
        }
        self.ops.on_close(self);
    }
}

/// Owning handle to an open [`File`].
///
/// Clone duplicates the descriptor (shared cursor, bumped reference
/// count); dropping the last clone closes the file.
pub struct FileHandle(Arc<File>);

impl FileHandle {
    /// Wraps `ops` into a fresh open file.
    pub fn new(ops: Arc<dyn FileOps>, node: Option<Arc<Node>>, mode: Mode) -> Self {
        Self(Arc::new(File {
            ops,
            node,
            mode,
            cursor: AtomicU64::new(0),
        }))
    }

    /// The underlying file.
    #[must_use]
    pub fn file(&self) -> &File {
        &self.0
    }

    /// The operations vtable, for downcasting by the kernel's poll path.
    #[must_use]
    pub fn ops(&self) -> &Arc<dyn FileOps> {
        &self.0.ops
    }

    /// Moves the cursor.
    pub fn seek(&self, from: SeekFrom, offset: i64) -> u64 {
        self.0.ops.seek(&self.0, from, offset)
    }

    /// Reads into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> u64 {
        self.0.ops.read(&self.0, buf)
    }

    /// Writes `buf`.
    pub fn write(&self, buf: &[u8]) -> u64 {
        self.0.ops.write(&self.0, buf)
    }

    /// Driver-specific control.
    pub fn ioctl(&self, op: u64, arg: u64) -> u64 {
        self.0.ops.ioctl(&self.0, op, arg)
    }
}

impl Clone for FileHandle {
    fn clone(&self) -> Self {
        self.0.ops.on_duplicate(&self.0);
        Self(self.0.clone())
    }
}

/// Per-process file descriptor table, fixed capacity.
pub struct FdTable {
    slots: [Option<FileHandle>; Self::CAPACITY],
}

impl FdTable {
    /// Number of descriptors a process can hold open.
    pub const CAPACITY: usize = 64;

    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [const { None }; Self::CAPACITY],
        }
    }

    /// Stores `handle` in the lowest free descriptor.
    ///
    /// # Errors
    ///
    /// [`FsError::OutOfMemory`] when all descriptors are in use.
    pub fn add(&mut self, handle: FileHandle) -> Result<u32, FsError> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::OutOfMemory)?;
        self.slots[slot] = Some(handle);
        Ok(slot as u32)
    }

    /// Stores `handle` at a specific descriptor, replacing any previous
    /// occupant.
    pub fn set(&mut self, fd: u32, handle: FileHandle) -> Result<(), FsError> {
        let slot = self.slots.get_mut(fd as usize).ok_or(FsError::Invalid)?;
        *slot = Some(handle);
        Ok(())
    }

    /// The handle behind `fd`.
    #[must_use]
    pub fn get(&self, fd: u32) -> Option<&FileHandle> {
        self.slots.get(fd as usize)?.as_ref()
    }

    /// Removes and returns the handle behind `fd`.
    pub fn remove(&mut self, fd: u32) -> Option<FileHandle> {
        self.slots.get_mut(fd as usize)?.take()
    }

    /// Iterates over open `(fd, handle)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &FileHandle)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, slot)| slot.as_ref().map(|handle| (fd as u32, handle)))
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    /// Backend counting its close/duplicate hook invocations.
    struct Counter {
        closes: AtomicU32,
        duplicates: AtomicU32,
    }

    impl FileOps for Arc<Counter> {
        fn read(&self, _file: &File, _buf: &mut [u8]) -> u64 {
            0
        }
        fn write(&self, _file: &File, buf: &[u8]) -> u64 {
            buf.len() as u64
        }
        fn on_close(&self, _file: &File) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }
        fn on_duplicate(&self, _file: &File) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counted() -> (Arc<Counter>, FileHandle) {
        let counter = Arc::new(Counter {
            closes: AtomicU32::new(0),
            duplicates: AtomicU32::new(0),
        });
        let handle = FileHandle::new(Arc::new(counter.clone()), None, Mode::ReadWrite);
        (counter, handle)
    }

    #[test]
    fn close_fires_once_after_duplicates() {
        let (counter, handle) = counted();
        let dup = handle.clone();
        assert_eq!(counter.duplicates.load(Ordering::Relaxed), 1);
        drop(handle);
        assert_eq!(counter.closes.load(Ordering::Relaxed), 0);
        drop(dup);
        assert_eq!(counter.closes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn duplicates_share_the_cursor() {
        let (_counter, handle) = counted();
        let dup = handle.clone();
        handle.file().set_cursor(42);
        assert_eq!(dup.file().cursor(), 42);
    }

    #[test]
    fn seek_arithmetic() {
        let (_counter, handle) = counted();
        let file = handle.file();
        assert_eq!(file.apply_seek(100, SeekFrom::Start, 10), 10);
        assert_eq!(file.apply_seek(100, SeekFrom::Current, 5), 15);
        assert_eq!(file.apply_seek(100, SeekFrom::Current, -20), 0);
        assert_eq!(file.apply_seek(100, SeekFrom::End, -30), 70);
    }

    #[test]
    fn fd_table_reuses_lowest_slot() {
        let mut table = FdTable::new();
        let (_c1, h1) = counted();
        let (_c2, h2) = counted();
        let (_c3, h3) = counted();
        assert_eq!(table.add(h1).unwrap(), 0);
        assert_eq!(table.add(h2).unwrap(), 1);
        table.remove(0);
        assert_eq!(table.add(h3).unwrap(), 0);
    }

    #[test]
    fn fd_table_capacity() {
        let mut table = FdTable::new();
        for _ in 0..FdTable::CAPACITY {
            let (_c, handle) = counted();
            table.add(handle).unwrap();
        }
        let (_c, handle) = counted();
        assert_eq!(table.add(handle), Err(FsError::OutOfMemory));
    }
}
