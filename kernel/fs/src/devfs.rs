//! Device pseudo-filesystem.
//!
//! Each registered device is a child node of the mount carrying the
//! device's operations as a value. Open hands the stored operations back,
//! refusing a mode the device has no direction for. Structure is fixed:
//! nodes are registered by drivers, never created or destroyed through
//! the VFS.

use alloc::sync::Arc;

use crate::file::{FileOps, Mode};
use crate::vfs::{MountBinding, Vfs};
use crate::{Filesystem, FsError, Node, NodePayload, NodeType};

/// A registered device behind a devfs node.
pub struct DeviceNode {
    /// Operations shared by every open of the device.
    pub ops: Arc<dyn FileOps>,
    /// Whether reads are supported.
    pub readable: bool,
    /// Whether writes are supported.
    pub writable: bool,
}

/// The devfs driver.
pub struct DevFs;

/// Mount constructor; the device path is ignored.
pub fn init(_vfs: &Vfs, _device_path: &str) -> Result<MountBinding, FsError> {
    Ok(MountBinding {
        driver: Arc::new(DevFs),
        payload: NodePayload::None,
        populated: true,
    })
}

/// Registers a device under the devfs `mount` node.
///
/// # Errors
///
/// [`FsError::Invalid`] for names containing `/`, empty names, or a name
/// already registered.
pub fn register_device(
    mount: &Arc<Node>,
    name: &str,
    ops: Arc<dyn FileOps>,
    readable: bool,
    writable: bool,
) -> Result<(), FsError> {
    let name = name.trim();
    if name.is_empty() || name.contains('/') {
        return Err(FsError::Invalid);
    }
    if mount.child(name).is_some() {
        return Err(FsError::Invalid);
    }

    let node = Node::new(
        name,
        NodeType::File,
        false,
        mount.driver().clone(),
        NodePayload::Device(DeviceNode {
            ops,
            readable,
            writable,
        }),
        true,
    );
    Node::attach(mount, &node);
    Ok(())
}

impl Filesystem for DevFs {
    fn name(&self) -> &'static str {
        "devfs"
    }

    fn create(
        &self,
        _parent: &Arc<Node>,
        _node_type: NodeType,
        _name: &str,
    ) -> Result<Arc<Node>, FsError> {
        Err(FsError::Unsupported)
    }

    fn destroy(&self, _node: &Arc<Node>) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    fn populate(&self, _node: &Arc<Node>) {
        // Devices appear through register_device, not a populate pass.
    }

    fn open(&self, node: &Arc<Node>, mode: Mode) -> Result<Arc<dyn FileOps>, FsError> {
        let NodePayload::Device(device) = node.payload() else {
            return Err(FsError::Invalid);
        };
        if mode.is_read() && !device.readable {
            return Err(FsError::Unsupported);
        }
        if mode.is_write() && !device.writable {
            return Err(FsError::Unsupported);
        }
        Ok(device.ops.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::File;
    use crate::ramfs;

    /// Read-only device producing a repeating byte.
    struct PatternDevice(u8);

    impl FileOps for PatternDevice {
        fn read(&self, _file: &File, buf: &mut [u8]) -> u64 {
            buf.fill(self.0);
            buf.len() as u64
        }
        fn write(&self, _file: &File, _buf: &[u8]) -> u64 {
            0
        }
    }

    fn fresh() -> Vfs {
        let vfs = Vfs::new();
        vfs.register_filesystem("ramfs", ramfs::init);
        vfs.register_filesystem("devfs", init);
        vfs.mount("/", "ramfs", "").unwrap();
        vfs.mount("/dev", "devfs", "").unwrap();
        vfs
    }

    #[test]
    fn register_and_read() {
        let vfs = fresh();
        let dev = vfs.find("/dev").unwrap();
        register_device(&dev, "pattern", Arc::new(PatternDevice(0x7E)), true, false).unwrap();

        let file = vfs.open("/dev/pattern", Mode::Read).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf), 8);
        assert_eq!(buf, [0x7E; 8]);
    }

    #[test]
    fn missing_direction_refuses_open() {
        let vfs = fresh();
        let dev = vfs.find("/dev").unwrap();
        register_device(&dev, "ro", Arc::new(PatternDevice(0)), true, false).unwrap();

        assert_eq!(vfs.open("/dev/ro", Mode::Write).err(), Some(FsError::Unsupported));
        assert_eq!(
            vfs.open("/dev/ro", Mode::ReadWrite).err(),
            Some(FsError::Unsupported)
        );
    }

    #[test]
    fn bad_names_rejected() {
        let vfs = fresh();
        let dev = vfs.find("/dev").unwrap();
        assert_eq!(
            register_device(&dev, "a/b", Arc::new(PatternDevice(0)), true, true).err(),
            Some(FsError::Invalid)
        );
        register_device(&dev, "dup", Arc::new(PatternDevice(0)), true, true).unwrap();
        assert_eq!(
            register_device(&dev, "dup", Arc::new(PatternDevice(0)), true, true).err(),
            Some(FsError::Invalid)
        );
    }

    #[test]
    fn structure_is_fixed() {
        let vfs = fresh();
        assert_eq!(
            vfs.open("/dev/new", Mode::Write).err(),
            Some(FsError::Unsupported)
        );
        let dev = vfs.find("/dev").unwrap();
        register_device(&dev, "gone", Arc::new(PatternDevice(0)), true, false).unwrap();
        assert_eq!(vfs.remove("/dev/gone"), Err(FsError::Unsupported));
    }
}
