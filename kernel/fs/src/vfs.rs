//! Mount table, path resolution and the open/close surface.
//!
//! One [`Vfs`] owns the node tree. Mounting grafts a fresh mount-root node
//! into the tree and binds it to a registered driver; mounting `/` is the
//! bootstrap case. Resolution walks components through [`Node::child`],
//! which populates directories lazily.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use tachyon_core::sync::SpinLock;

use crate::file::{File, FileHandle, FileOps, Mode};
use crate::{FsError, Node, NodePayload, NodeType, path};

/// A mount-time driver constructor.
///
/// Receives the VFS (so stacked filesystems can open their backing device
/// through it) and the device path from the mount request. Returns the
/// driver plus the payload and populated flag for the mount-root node.
pub type FsInit = fn(&Vfs, device_path: &str) -> Result<MountBinding, FsError>;

/// What a driver hands back when binding a mount.
pub struct MountBinding {
    /// The driver instance for this mount.
    pub driver: Arc<dyn crate::Filesystem>,
    /// Payload of the mount-root node.
    pub payload: NodePayload,
    /// Whether the mount root starts populated.
    pub populated: bool,
}

struct Registration {
    name: &'static str,
    init: FsInit,
}

/// The virtual filesystem: registered drivers plus the node tree.
pub struct Vfs {
    filesystems: SpinLock<Vec<Registration>>,
    root: SpinLock<Option<Arc<Node>>>,
}

/// Result of walking a path through the tree.
enum Resolved {
    /// The full path names this node.
    Found(Arc<Node>),
    /// Resolution stopped at `parent` with exactly `name` left.
    MissingLeaf { parent: Arc<Node>, name: String },
    /// More than one component is missing.
    MissingPath,
}

impl Vfs {
    /// Creates an empty VFS with no mounts. Const so the kernel can keep
    /// its instance in a plain static.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            filesystems: SpinLock::new(Vec::new()),
            root: SpinLock::new(None),
        }
    }

    /// Registers a filesystem driver under `name`.
    pub fn register_filesystem(&self, name: &'static str, init: FsInit) {
        self.filesystems.lock().push(Registration { name, init });
    }

    /// The tree root, once `/` is mounted.
    #[must_use]
    pub fn root(&self) -> Option<Arc<Node>> {
        self.root.lock().clone()
    }

    fn lookup_driver(&self, name: &str) -> Option<FsInit> {
        self.filesystems
            .lock()
            .iter()
            .find(|reg| reg.name == name)
            .map(|reg| reg.init)
    }

    fn resolve(&self, path: &str) -> Result<Resolved, FsError> {
        let root = self.root().ok_or(FsError::NotFound)?;
        let mut node = root;
        let mut parts = path::components(path).peekable();

        while let Some(part) = parts.next() {
            if node.node_type() != NodeType::Directory {
                return Ok(Resolved::MissingPath);
            }
            match node.child(part) {
                Some(child) => node = child,
                None => {
                    return Ok(if parts.peek().is_none() {
                        Resolved::MissingLeaf {
                            parent: node,
                            name: String::from(part),
                        }
                    } else {
                        Resolved::MissingPath
                    });
                }
            }
        }

        Ok(Resolved::Found(node))
    }

    /// Resolves a path to its node.
    ///
    /// # Errors
    ///
    /// [`FsError::Invalid`] for malformed paths, [`FsError::NotFound`]
    /// when any component is missing.
    pub fn find(&self, raw_path: &str) -> Result<Arc<Node>, FsError> {
        let checked = path::validate(raw_path)?;
        match self.resolve(checked)? {
            Resolved::Found(node) => Ok(node),
            Resolved::MissingLeaf { .. } | Resolved::MissingPath => Err(FsError::NotFound),
        }
    }

    /// Mounts filesystem `fs_name` at `raw_path`, handing `device_path` to
    /// its driver. Mounting `/` bootstraps the tree; any other mount point
    /// must be a missing leaf under an existing directory.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] for an unregistered driver or missing parent,
    /// [`FsError::Invalid`] for a bad path or occupied mount point, plus
    /// whatever the driver's init reports.
    pub fn mount(&self, raw_path: &str, fs_name: &str, device_path: &str) -> Result<(), FsError> {
        let checked = path::validate(raw_path)?;
        let init = self.lookup_driver(fs_name).ok_or(FsError::NotFound)?;

        if checked == "/" {
            if self.root().is_some() {
                return Err(FsError::Invalid);
            }
            let binding = init(self, device_path)?;
            let node = Node::new(
                "/",
                NodeType::Directory,
                true,
                binding.driver,
                binding.payload,
                binding.populated,
            );
            *self.root.lock() = Some(node);
            return Ok(());
        }

        let (parent, name) = match self.resolve(checked)? {
            Resolved::MissingLeaf { parent, name } => (parent, name),
            Resolved::Found(_) => return Err(FsError::Invalid),
            Resolved::MissingPath => return Err(FsError::NotFound),
        };
        if parent.node_type() != NodeType::Directory {
            return Err(FsError::Invalid);
        }

        let binding = init(self, device_path)?;
        let node = Node::new(
            &name,
            NodeType::Directory,
            true,
            binding.driver,
            binding.payload,
            binding.populated,
        );
        Node::attach(&parent, &node);
        Ok(())
    }

    /// Opens `raw_path` with `mode`.
    ///
    /// A missing leaf under a directory is created through the driver when
    /// the mode writes. Opening a directory requires `Mode::Read` and
    /// yields a file whose reads return one child name per call.
    ///
    /// # Errors
    ///
    /// [`FsError::Busy`] when the open-exclusivity rules refuse, plus
    /// resolution and driver errors.
    pub fn open(&self, raw_path: &str, mode: Mode) -> Result<FileHandle, FsError> {
        let checked = path::validate(raw_path)?;

        let node = match self.resolve(checked)? {
            Resolved::Found(node) => node,
            Resolved::MissingLeaf { parent, name } => {
                if !mode.is_write() || parent.node_type() != NodeType::Directory {
                    return Err(FsError::NotFound);
                }
                parent.driver().create(&parent, NodeType::File, &name)?
            }
            Resolved::MissingPath => return Err(FsError::NotFound),
        };

        if node.node_type() == NodeType::Directory {
            if mode != Mode::Read {
                return Err(FsError::Invalid);
            }
            node.ensure_populated();
            node.begin_open(mode)?;
            let stream: Arc<dyn FileOps> = Arc::new(DirStream {
                node: node.clone(),
                index: AtomicUsize::new(0),
            });
            return Ok(FileHandle::new(stream, Some(node), mode));
        }

        node.begin_open(mode)?;
        match node.driver().open(&node, mode) {
            Ok(ops) => Ok(FileHandle::new(ops, Some(node), mode)),
            Err(err) => {
                node.end_open(mode);
                Err(err)
            }
        }
    }

    /// Creates a directory at `raw_path`.
    ///
    /// # Errors
    ///
    /// [`FsError::Invalid`] when the path already exists, resolution and
    /// driver errors otherwise.
    pub fn create_dir(&self, raw_path: &str) -> Result<Arc<Node>, FsError> {
        let checked = path::validate(raw_path)?;
        match self.resolve(checked)? {
            Resolved::MissingLeaf { parent, name } => {
                if parent.node_type() != NodeType::Directory {
                    return Err(FsError::Invalid);
                }
                parent.driver().create(&parent, NodeType::Directory, &name)
            }
            Resolved::Found(_) => Err(FsError::Invalid),
            Resolved::MissingPath => Err(FsError::NotFound),
        }
    }

    /// Removes the node at `raw_path`. Open nodes and non-empty
    /// directories are refused.
    ///
    /// # Errors
    ///
    /// [`FsError::Busy`] for open nodes, [`FsError::Invalid`] for
    /// non-empty directories, plus resolution and driver errors.
    pub fn remove(&self, raw_path: &str) -> Result<(), FsError> {
        let node = self.find(raw_path)?;

        let (open_read, open_write) = node.open_counts();
        if open_read > 0 || open_write > 0 {
            return Err(FsError::Busy);
        }
        if node.node_type() == NodeType::Directory {
            node.ensure_populated();
            if node.child_count_raw() > 0 {
                return Err(FsError::Invalid);
            }
        }

        node.driver().destroy(&node)
    }

    /// Lists the child names of the directory at `raw_path`.
    ///
    /// # Errors
    ///
    /// [`FsError::Invalid`] when the node is not a directory, resolution
    /// errors otherwise.
    pub fn read_dir(&self, raw_path: &str) -> Result<Vec<String>, FsError> {
        let node = self.find(raw_path)?;
        if node.node_type() != NodeType::Directory {
            return Err(FsError::Invalid);
        }
        Ok(node.children().iter().map(|c| String::from(c.name())).collect())
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory read stream: each read yields one child's name.
struct DirStream {
    node: Arc<Node>,
    index: AtomicUsize,
}

impl FileOps for DirStream {
    fn read(&self, _file: &File, buf: &mut [u8]) -> u64 {
        let children = self.node.children();
        let index = self.index.fetch_add(1, Ordering::Relaxed);
        let Some(child) = children.get(index) else {
            return 0;
        };
        let name = child.name().as_bytes();
        let count = name.len().min(buf.len());
        buf[..count].copy_from_slice(&name[..count]);
        count as u64
    }

    fn write(&self, _file: &File, _buf: &[u8]) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::SeekFrom;
    use crate::ramfs;

    fn fresh() -> Vfs {
        let vfs = Vfs::new();
        vfs.register_filesystem("ramfs", ramfs::init);
        vfs.mount("/", "ramfs", "").unwrap();
        vfs
    }

    #[test]
    fn mount_root_bootstrap() {
        let vfs = fresh();
        assert!(vfs.root().is_some());
        assert!(vfs.root().unwrap().is_mount_root());
        // A second root mount is refused.
        assert_eq!(vfs.mount("/", "ramfs", ""), Err(FsError::Invalid));
    }

    #[test]
    fn mount_requires_registered_driver() {
        let vfs = fresh();
        assert_eq!(vfs.mount("/mnt", "nope", ""), Err(FsError::NotFound));
    }

    #[test]
    fn mount_on_missing_parent_fails() {
        let vfs = fresh();
        assert_eq!(vfs.mount("/a/b/c", "ramfs", ""), Err(FsError::NotFound));
    }

    #[test]
    fn write_then_read_back() {
        let vfs = fresh();
        {
            let file = vfs.open("/hello.txt", Mode::Write).unwrap();
            assert_eq!(file.write(b"greetings"), 9);
        }
        let file = vfs.open("/hello.txt", Mode::Read).unwrap();
        let mut buf = [0u8; 32];
        let count = file.read(&mut buf) as usize;
        assert_eq!(&buf[..count], b"greetings");
    }

    #[test]
    fn open_read_missing_does_not_create() {
        let vfs = fresh();
        assert_eq!(vfs.open("/ghost", Mode::Read).err(), Some(FsError::NotFound));
        assert_eq!(vfs.find("/ghost").err(), Some(FsError::NotFound));
    }

    #[test]
    fn writer_excludes_reader_and_vice_versa() {
        let vfs = fresh();
        drop(vfs.open("/f", Mode::Write).unwrap());

        let reader = vfs.open("/f", Mode::Read).unwrap();
        assert_eq!(vfs.open("/f", Mode::Write).err(), Some(FsError::Busy));
        drop(reader);

        let writer = vfs.open("/f", Mode::Write).unwrap();
        assert_eq!(vfs.open("/f", Mode::Read).err(), Some(FsError::Busy));
        drop(writer);

        assert!(vfs.open("/f", Mode::Read).is_ok());
    }

    #[test]
    fn directories_create_and_nest() {
        let vfs = fresh();
        vfs.create_dir("/a").unwrap();
        vfs.create_dir("/a/b").unwrap();
        drop(vfs.open("/a/b/c.txt", Mode::Write).unwrap());
        assert_eq!(vfs.read_dir("/a").unwrap(), vec![String::from("b")]);
        assert_eq!(vfs.read_dir("/a/b").unwrap(), vec![String::from("c.txt")]);
    }

    #[test]
    fn directory_stream_reads_one_name_per_call() {
        let vfs = fresh();
        drop(vfs.open("/one", Mode::Write).unwrap());
        drop(vfs.open("/two", Mode::Write).unwrap());

        let dir = vfs.open("/", Mode::Read).unwrap();
        let mut names = Vec::new();
        loop {
            let mut buf = [0u8; 64];
            let count = dir.read(&mut buf) as usize;
            if count == 0 {
                break;
            }
            names.push(String::from_utf8(buf[..count].to_vec()).unwrap());
        }
        names.sort();
        assert_eq!(names, vec![String::from("one"), String::from("two")]);
    }

    #[test]
    fn open_directory_for_write_is_invalid() {
        let vfs = fresh();
        vfs.create_dir("/d").unwrap();
        assert_eq!(vfs.open("/d", Mode::Write).err(), Some(FsError::Invalid));
    }

    #[test]
    fn remove_refuses_open_and_nonempty() {
        let vfs = fresh();
        vfs.create_dir("/d").unwrap();
        drop(vfs.open("/d/inner", Mode::Write).unwrap());
        assert_eq!(vfs.remove("/d"), Err(FsError::Invalid));

        let file = vfs.open("/d/inner", Mode::Read).unwrap();
        assert_eq!(vfs.remove("/d/inner"), Err(FsError::Busy));
        drop(file);

        vfs.remove("/d/inner").unwrap();
        vfs.remove("/d").unwrap();
        assert_eq!(vfs.find("/d").err(), Some(FsError::NotFound));
    }

    #[test]
    fn seek_positions_reads() {
        let vfs = fresh();
        {
            let file = vfs.open("/s", Mode::Write).unwrap();
            file.write(b"0123456789");
        }
        let file = vfs.open("/s", Mode::Read).unwrap();
        assert_eq!(file.seek(SeekFrom::Start, 4), 4);
        let mut buf = [0u8; 2];
        file.read(&mut buf);
        assert_eq!(&buf, b"45");
        assert_eq!(file.seek(SeekFrom::End, -2), 8);
        file.read(&mut buf);
        assert_eq!(&buf, b"89");
    }
}
