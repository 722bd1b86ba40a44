//! Virtual filesystem.
//!
//! A single node tree with mount points grafted into it. Filesystem
//! drivers are values behind `Arc<dyn Filesystem>`; per-node driver data
//! is the closed [`NodePayload`] sum instead of bytes stashed past the end
//! of a C struct. Directories populate lazily on first access. Open
//! bookkeeping lives on the node: at most one writer, and writers exclude
//! readers.
//!
//! Everything here is synchronous; blocking files (events, pipes) are
//! layered on top by the kernel through the same [`file::FileOps`]
//! surface.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod devfs;
pub mod file;
pub mod iso9660;
pub mod path;
pub mod ramfs;
pub mod vfs;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;

use tachyon_core::sync::SpinLock;

use file::{File, FileOps, Mode};

/// Filesystem error kinds surfaced to callers and, ultimately, syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path or node does not exist.
    NotFound,
    /// Bad path, bad mode, or an operation that does not fit the node.
    Invalid,
    /// Open bookkeeping forbids the requested open.
    Busy,
    /// The driver does not implement the operation.
    Unsupported,
    /// On-disc structure failed validation.
    FormatInvalid,
    /// Allocation failed.
    OutOfMemory,
}

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Has children, no data.
    Directory,
    /// Has data, no children.
    File,
}

/// Driver-specific per-node data.
pub enum NodePayload {
    /// No per-node data.
    None,
    /// Growable in-memory file contents (ramfs).
    RamFile(SpinLock<ramfs::RamFileData>),
    /// A registered device (devfs).
    Device(devfs::DeviceNode),
    /// Location of file or directory data on an ISO-9660 volume.
    Iso(iso9660::IsoExtent),
}

/// Upcast helper so `dyn FileOps` values can be downcast by the kernel's
/// poll path (events are recognised by concrete type).
pub trait AsAny {
    /// Returns `self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A filesystem driver.
///
/// One value per mount; nodes hold it as `Arc<dyn Filesystem>` and route
/// their structural operations through it.
pub trait Filesystem: Send + Sync {
    /// Driver name, as used in mount requests.
    fn name(&self) -> &'static str;

    /// Creates a child of `parent` and attaches it.
    fn create(
        &self,
        parent: &Arc<Node>,
        node_type: NodeType,
        name: &str,
    ) -> Result<Arc<Node>, FsError>;

    /// Destroys `node`, unlinking it from its parent. The VFS has already
    /// verified the node is closed and, for directories, empty.
    fn destroy(&self, node: &Arc<Node>) -> Result<(), FsError>;

    /// Fills in `node`'s children. Called once per directory, on first
    /// access.
    fn populate(&self, node: &Arc<Node>);

    /// Produces the operations for opening `node` with `mode`. Drivers may
    /// refuse (a read-only filesystem rejects write modes).
    fn open(&self, node: &Arc<Node>, mode: Mode) -> Result<Arc<dyn FileOps>, FsError>;

    /// Hook invoked when a file on this filesystem is closed.
    fn on_close(&self, _file: &File) {}
}

/// Mutable open/population bookkeeping of a node.
#[derive(Debug, Default)]
struct NodeState {
    open_read: u16,
    open_write: u16,
    populated: bool,
}

/// A node in the tree: one file or directory.
pub struct Node {
    name: String,
    node_type: NodeType,
    mount_root: bool,
    driver: Arc<dyn Filesystem>,
    payload: NodePayload,
    parent: SpinLock<Weak<Node>>,
    state: SpinLock<NodeState>,
    children: SpinLock<Vec<Arc<Node>>>,
}

impl Node {
    /// Builds a detached node. `populated` is preset for drivers whose
    /// directories never need a populate pass (ramfs, devfs).
    pub fn new(
        name: &str,
        node_type: NodeType,
        mount_root: bool,
        driver: Arc<dyn Filesystem>,
        payload: NodePayload,
        populated: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            node_type,
            mount_root,
            driver,
            payload,
            parent: SpinLock::new(Weak::new()),
            state: SpinLock::new(NodeState {
                open_read: 0,
                open_write: 0,
                populated,
            }),
            children: SpinLock::new(Vec::new()),
        })
    }

    /// Node name, unique among siblings.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node type.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Whether this node is the root of a mount.
    #[must_use]
    pub fn is_mount_root(&self) -> bool {
        self.mount_root
    }

    /// The driver owning this node.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Filesystem> {
        &self.driver
    }

    /// Driver-specific payload.
    #[must_use]
    pub fn payload(&self) -> &NodePayload {
        &self.payload
    }

    /// Data size of the node, as far as the payload knows it.
    /// Directories and devices report 0.
    #[must_use]
    pub fn size(&self) -> u64 {
        match &self.payload {
            NodePayload::RamFile(data) => data.lock().size(),
            NodePayload::Iso(extent) => extent.data_size,
            NodePayload::Device(_) | NodePayload::None => 0,
        }
    }

    /// Parent node, `None` for the tree root.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.lock().upgrade()
    }

    /// Attaches `child` under `parent`. The caller has checked the name is
    /// free among the siblings.
    pub fn attach(parent: &Arc<Node>, child: &Arc<Node>) {
        *child.parent.lock() = Arc::downgrade(parent);
        parent.children.lock().push(child.clone());
    }

    /// Unlinks `child` from `parent`. Returns `false` when absent.
    pub fn detach(parent: &Arc<Node>, child: &Arc<Node>) -> bool {
        let mut children = parent.children.lock();
        let Some(pos) = children.iter().position(|n| Arc::ptr_eq(n, child)) else {
            return false;
        };
        children.remove(pos);
        true
    }

    /// Looks up a child by name, populating the directory first if needed.
    #[must_use]
    pub fn child(self: &Arc<Self>, name: &str) -> Option<Arc<Node>> {
        self.ensure_populated();
        self.children.lock().iter().find(|c| c.name == name).cloned()
    }

    /// Snapshot of the child list, populating first if needed.
    #[must_use]
    pub fn children(self: &Arc<Self>) -> Vec<Arc<Node>> {
        self.ensure_populated();
        self.children.lock().clone()
    }

    /// Number of children without triggering a populate pass.
    #[must_use]
    pub fn child_count_raw(&self) -> usize {
        self.children.lock().len()
    }

    /// Runs the driver's populate pass once.
    pub fn ensure_populated(self: &Arc<Self>) {
        if self.node_type != NodeType::Directory {
            return;
        }
        {
            let state = self.state.lock();
            if state.populated {
                return;
            }
        }
        self.driver.populate(self);
        self.state.lock().populated = true;
    }

    /// Current `(open_read, open_write)` counts.
    #[must_use]
    pub fn open_counts(&self) -> (u16, u16) {
        let state = self.state.lock();
        (state.open_read, state.open_write)
    }

    /// Claims an open in `mode`, enforcing writer exclusivity.
    ///
    /// # Errors
    ///
    /// [`FsError::Busy`] when a writer is open, or when `mode` writes and
    /// any reader is open.
    pub fn begin_open(&self, mode: Mode) -> Result<(), FsError> {
        let mut state = self.state.lock();
        if state.open_write > 0 {
            return Err(FsError::Busy);
        }
        if mode.is_write() && state.open_read > 0 {
            return Err(FsError::Busy);
        }
        if mode.is_read() {
            state.open_read += 1;
        }
        if mode.is_write() {
            state.open_write += 1;
        }
        Ok(())
    }

    /// Releases an open claimed with [`Node::begin_open`].
    pub fn end_open(&self, mode: Mode) {
        let mut state = self.state.lock();
        if mode.is_read() {
            state.open_read = state.open_read.saturating_sub(1);
        }
        if mode.is_write() {
            state.open_write = state.open_write.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs::RamFs;

    fn dir(name: &str) -> Arc<Node> {
        Node::new(name, NodeType::Directory, false, RamFs::driver(), NodePayload::None, true)
    }

    #[test]
    fn attach_detach() {
        let parent = dir("parent");
        let child = dir("child");
        Node::attach(&parent, &child);
        assert!(child.parent().is_some_and(|p| Arc::ptr_eq(&p, &parent)));
        assert!(parent.child("child").is_some());
        assert!(Node::detach(&parent, &child));
        assert!(parent.child("child").is_none());
        assert!(!Node::detach(&parent, &child));
    }

    #[test]
    fn writer_excludes_everyone() {
        let node = dir("n");
        node.begin_open(Mode::Write).unwrap();
        assert_eq!(node.begin_open(Mode::Read), Err(FsError::Busy));
        assert_eq!(node.begin_open(Mode::Write), Err(FsError::Busy));
        node.end_open(Mode::Write);
        node.begin_open(Mode::Read).unwrap();
    }

    #[test]
    fn readers_share_but_block_writers() {
        let node = dir("n");
        node.begin_open(Mode::Read).unwrap();
        node.begin_open(Mode::Read).unwrap();
        assert_eq!(node.begin_open(Mode::Write), Err(FsError::Busy));
        assert_eq!(node.begin_open(Mode::ReadWrite), Err(FsError::Busy));
        node.end_open(Mode::Read);
        node.end_open(Mode::Read);
        node.begin_open(Mode::ReadWrite).unwrap();
    }
}
