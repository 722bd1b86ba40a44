//! In-memory filesystem.
//!
//! Files hold a growable byte buffer; directories are plain nodes. The
//! whole tree lives on the kernel heap, so ramfs is the root filesystem
//! before any block device is up.

use alloc::sync::Arc;
use alloc::vec::Vec;

use tachyon_core::sync::SpinLock;

use crate::file::{File, FileOps, Mode};
use crate::vfs::{MountBinding, Vfs};
use crate::{Filesystem, FsError, Node, NodePayload, NodeType};

/// Contents of one ramfs file.
#[derive(Default)]
pub struct RamFileData {
    data: Vec<u8>,
}

impl RamFileData {
    /// Current file size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Copies out of the buffer at `cursor`. Returns bytes copied.
    pub fn read(&self, cursor: u64, buf: &mut [u8]) -> u64 {
        let Some(available) = (self.data.len() as u64).checked_sub(cursor) else {
            return 0;
        };
        let count = (available as usize).min(buf.len());
        let start = cursor as usize;
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        count as u64
    }

    /// Copies into the buffer at `cursor`, growing it when the write runs
    /// past the end. Growth doubles the capacity or jumps straight to the
    /// write's end, whichever is larger.
    pub fn write(&mut self, cursor: u64, buf: &[u8]) -> u64 {
        let end = cursor as usize + buf.len();
        if end > self.data.capacity() {
            let target = (self.data.capacity() * 2).max(end);
            self.data.reserve(target - self.data.len());
        }
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[cursor as usize..end].copy_from_slice(buf);
        buf.len() as u64
    }
}

/// The ramfs driver.
pub struct RamFs;

impl RamFs {
    /// A driver instance as a trait object, for node construction.
    #[must_use]
    pub fn driver() -> Arc<dyn Filesystem> {
        Arc::new(Self)
    }
}

/// Mount constructor; the device path is ignored.
pub fn init(_vfs: &Vfs, _device_path: &str) -> Result<MountBinding, FsError> {
    Ok(MountBinding {
        driver: RamFs::driver(),
        payload: NodePayload::None,
        populated: true,
    })
}

impl Filesystem for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn create(
        &self,
        parent: &Arc<Node>,
        node_type: NodeType,
        name: &str,
    ) -> Result<Arc<Node>, FsError> {
        if parent.node_type() != NodeType::Directory || name.is_empty() {
            return Err(FsError::Invalid);
        }
        if parent.child(name).is_some() {
            return Err(FsError::Invalid);
        }

        let payload = match node_type {
            NodeType::Directory => NodePayload::None,
            NodeType::File => NodePayload::RamFile(SpinLock::new(RamFileData::default())),
        };
        let node = Node::new(name, node_type, false, parent.driver().clone(), payload, true);
        Node::attach(parent, &node);
        Ok(node)
    }

    fn destroy(&self, node: &Arc<Node>) -> Result<(), FsError> {
        let parent = node.parent().ok_or(FsError::Invalid)?;
        if Node::detach(&parent, node) {
            Ok(())
        } else {
            Err(FsError::NotFound)
        }
    }

    fn populate(&self, _node: &Arc<Node>) {
        // Children only ever exist in memory; nothing to pull in.
    }

    fn open(&self, _node: &Arc<Node>, _mode: Mode) -> Result<Arc<dyn FileOps>, FsError> {
        Ok(Arc::new(RamFileOps))
    }
}

/// Operations on an open ramfs file.
struct RamFileOps;

impl RamFileOps {
    fn data(file: &File) -> Option<&SpinLock<RamFileData>> {
        match file.node()?.payload() {
            NodePayload::RamFile(data) => Some(data),
            _ => None,
        }
    }
}

impl FileOps for RamFileOps {
    fn size(&self, file: &File) -> u64 {
        Self::data(file).map_or(0, |data| data.lock().size())
    }

    fn read(&self, file: &File, buf: &mut [u8]) -> u64 {
        if !file.mode().is_read() {
            return 0;
        }
        let Some(data) = Self::data(file) else {
            return 0;
        };
        let count = data.lock().read(file.cursor(), buf);
        file.advance_cursor(count);
        count
    }

    fn write(&self, file: &File, buf: &[u8]) -> u64 {
        if !file.mode().is_write() {
            return 0;
        }
        let Some(data) = Self::data(file) else {
            return 0;
        };
        let count = data.lock().write(file.cursor(), buf);
        file.advance_cursor(count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::SeekFrom;

    fn fresh() -> Vfs {
        let vfs = Vfs::new();
        vfs.register_filesystem("ramfs", init);
        vfs.mount("/", "ramfs", "").unwrap();
        vfs
    }

    #[test]
    fn buffer_grows_past_writes() {
        let mut data = RamFileData::default();
        assert_eq!(data.write(0, b"abc"), 3);
        assert_eq!(data.size(), 3);
        // A sparse write zero-fills the gap.
        assert_eq!(data.write(10, b"xyz"), 3);
        assert_eq!(data.size(), 13);
        let mut buf = [0u8; 13];
        assert_eq!(data.read(0, &mut buf), 13);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(&buf[3..10], &[0u8; 7]);
        assert_eq!(&buf[10..], b"xyz");
    }

    #[test]
    fn read_past_end_is_empty() {
        let mut data = RamFileData::default();
        data.write(0, b"abc");
        let mut buf = [0u8; 4];
        assert_eq!(data.read(3, &mut buf), 0);
        assert_eq!(data.read(100, &mut buf), 0);
    }

    #[test]
    fn write_to_read_open_is_refused() {
        let vfs = fresh();
        drop(vfs.open("/f", Mode::Write).unwrap());
        let reader = vfs.open("/f", Mode::Read).unwrap();
        assert_eq!(reader.write(b"nope"), 0);
    }

    #[test]
    fn overwrite_in_the_middle() {
        let vfs = fresh();
        {
            let file = vfs.open("/f", Mode::Write).unwrap();
            file.write(b"AAAAAAAA");
            file.seek(SeekFrom::Start, 2);
            file.write(b"BB");
        }
        let file = vfs.open("/f", Mode::Read).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf), 8);
        assert_eq!(&buf, b"AABBAAAA");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let vfs = fresh();
        let root = vfs.root().unwrap();
        RamFs.create(&root, NodeType::File, "twin").unwrap();
        assert_eq!(
            RamFs.create(&root, NodeType::File, "twin").err(),
            Some(FsError::Invalid)
        );
    }

    #[test]
    fn destroy_unlinks() {
        let vfs = fresh();
        drop(vfs.open("/victim", Mode::Write).unwrap());
        vfs.remove("/victim").unwrap();
        assert_eq!(vfs.find("/victim").err(), Some(FsError::NotFound));
    }
}
