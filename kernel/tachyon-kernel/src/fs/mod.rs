//! Filesystem glue: the global VFS instance and the base mounts.
//!
//! Mounts ramfs at `/`, devfs at `/dev`, and registers the iso9660 driver
//! for block devices. The devices exported here are the ones the kernel
//! itself provides (`null`, `log`); hardware-backed devices register from
//! their drivers.

use alloc::sync::Arc;

use tachyon_core::log::LogLevel;
use tachyon_fs::file::{File, FileOps};
use tachyon_fs::vfs::Vfs;
use tachyon_fs::{devfs, iso9660, ramfs};

static VFS: Vfs = Vfs::new();

/// The kernel's VFS.
pub fn vfs() -> &'static Vfs {
    &VFS
}

/// The byte sink: reads hit end-of-file, writes disappear.
struct NullDevice;

impl FileOps for NullDevice {
    fn read(&self, _file: &File, _buf: &mut [u8]) -> u64 {
        0
    }

    fn write(&self, _file: &File, buf: &[u8]) -> u64 {
        buf.len() as u64
    }
}

/// Write-only device feeding the kernel log.
struct LogDevice;

impl FileOps for LogDevice {
    fn read(&self, _file: &File, _buf: &mut [u8]) -> u64 {
        0
    }

    fn write(&self, _file: &File, buf: &[u8]) -> u64 {
        let text = core::str::from_utf8(buf).unwrap_or("<non-utf8>");
        tachyon_core::klog!(LogLevel::Info, "{}", text.trim_end_matches('\n'));
        buf.len() as u64
    }
}

/// Brings up the VFS: driver registration, the root and `/dev` mounts,
/// and the kernel-provided device files.
///
/// # Panics
///
/// Panics when the base mounts fail; the system is unusable without
/// them.
pub fn init() {
    VFS.register_filesystem("ramfs", ramfs::init);
    VFS.register_filesystem("devfs", devfs::init);
    VFS.register_filesystem("iso9660", iso9660::init);

    VFS.mount("/", "ramfs", "").expect("failed to mount the root filesystem");
    VFS.mount("/dev", "devfs", "").expect("failed to mount /dev");

    let dev = VFS.find("/dev").expect("/dev vanished after mounting");
    devfs::register_device(&dev, "null", Arc::new(NullDevice), true, true)
        .expect("failed to register /dev/null");
    devfs::register_device(&dev, "log", Arc::new(LogDevice), false, true)
        .expect("failed to register /dev/log");

    tachyon_core::kinfo!("vfs: root mounted, /dev populated");
}
