//! ISO-9660 reader with SUSP/RRIP name support.
//!
//! Mounts a volume through any readable file (a block device node, or a
//! plain file holding an image). The Primary Volume Descriptor at LBA 16
//! supplies the logical block size and the root directory extent;
//! directories populate lazily by walking their variable-length records.
//! When the volume carries a SUSP area (detected once, on the mount
//! root's first `.` record via the `SP` tag), Rock Ridge `NM` tags
//! override the 8.3-style identifiers.
//!
//! Strictly read-only: writes, creates and destroys are refused.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::file::{File, FileHandle, FileOps, Mode, SeekFrom};
use crate::vfs::{MountBinding, Vfs};
use crate::{Filesystem, FsError, Node, NodePayload, NodeType};

/// Size of a descriptor sector.
const SECTOR_SIZE: u64 = 2048;

/// Descriptor sector holding the first volume descriptor.
const FIRST_DESCRIPTOR_LBA: u64 = 16;

/// Fixed part of a directory record preceding the identifier.
const RECORD_HEADER_LEN: usize = 33;

// Volume descriptor types.
const DESCRIPTOR_PRIMARY: u8 = 1;
const DESCRIPTOR_TERMINATOR: u8 = 255;

// Directory record flag bits.
const FLAG_HIDDEN: u8 = 1 << 0;
const FLAG_DIRECTORY: u8 = 1 << 1;

// RRIP NM flag bits.
const NM_CONTINUE: u8 = 1 << 0;
const NM_CURRENT: u8 = 1 << 1;
const NM_PARENT: u8 = 1 << 2;

/// Location of a node's data on the volume.
#[derive(Debug, Clone, Copy)]
pub struct IsoExtent {
    /// Absolute byte offset of the data.
    pub data_offset: u64,
    /// Data length in bytes.
    pub data_size: u64,
}

fn u16_le(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_le(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Reads until `buf` is full or the device reports end-of-data.
fn read_fully(device: &FileHandle, buf: &mut [u8]) -> usize {
    let mut filled = 0;
    while filled < buf.len() {
        let count = device.read(&mut buf[filled..]) as usize;
        if count == 0 {
            break;
        }
        filled += count;
    }
    filled
}

/// Shared per-mount state.
struct IsoShared {
    device: FileHandle,
    block_size: u64,
    uses_susp: AtomicBool,
}

/// The ISO-9660 driver, one instance per mount.
pub struct Iso9660Fs {
    shared: Arc<IsoShared>,
}

/// Mount constructor. Opens `device_path` for reading and locates the
/// Primary Volume Descriptor.
pub fn init(vfs: &Vfs, device_path: &str) -> Result<MountBinding, FsError> {
    let device = vfs.open(device_path, Mode::Read)?;

    let mut sector = vec![0u8; SECTOR_SIZE as usize];
    device.seek(SeekFrom::Start, (FIRST_DESCRIPTOR_LBA * SECTOR_SIZE) as i64);
    loop {
        if read_fully(&device, &mut sector) != sector.len() {
            return Err(FsError::FormatInvalid);
        }
        if &sector[1..6] != b"CD001" {
            return Err(FsError::FormatInvalid);
        }
        match sector[0] {
            DESCRIPTOR_PRIMARY => break,
            DESCRIPTOR_TERMINATOR => return Err(FsError::FormatInvalid),
            _ => {}
        }
    }

    let block_size = u64::from(u16_le(&sector, 128));
    if block_size == 0 {
        return Err(FsError::FormatInvalid);
    }

    // Root directory record at offset 156.
    let root_extended = u64::from(sector[157]);
    let root_lba = u64::from(u32_le(&sector, 158));
    let root_size = u64::from(u32_le(&sector, 166));

    Ok(MountBinding {
        driver: Arc::new(Iso9660Fs {
            shared: Arc::new(IsoShared {
                device,
                block_size,
                uses_susp: AtomicBool::new(false),
            }),
        }),
        payload: NodePayload::Iso(IsoExtent {
            data_offset: (root_lba + root_extended) * block_size,
            data_size: root_size,
        }),
        populated: false,
    })
}

/// Iterates the system-use tags of one directory record.
///
/// The SUSP area starts past the identifier, padded to an even offset.
/// Each tag is `{sig[2], length, version, payload…}`; iteration stops on a
/// malformed length.
fn susp_tags(record: &[u8]) -> impl Iterator<Item = &[u8]> {
    let id_len = record.get(32).map_or(0, |&len| len as usize);
    let mut offset = RECORD_HEADER_LEN + id_len;
    if offset % 2 == 1 {
        offset += 1;
    }

    core::iter::from_fn(move || {
        if offset + 4 > record.len() {
            return None;
        }
        let len = record[offset + 2] as usize;
        if len < 4 || offset + len > record.len() {
            return None;
        }
        let tag = &record[offset..offset + len];
        offset += len;
        Some(tag)
    })
}

/// Extracts the Rock Ridge name from a record's `NM` tags, if any.
///
/// `Current` and `Parent` flags name the `.`/`..` entries; the `Continue`
/// flag splices multi-tag names together.
fn rrip_name(record: &[u8]) -> Option<String> {
    let mut name: Option<String> = None;

    for tag in susp_tags(record) {
        if &tag[..2] != b"NM" || tag.len() < 5 {
            continue;
        }
        let flags = tag[4];
        if flags & NM_CURRENT != 0 {
            return Some(String::from("."));
        }
        if flags & NM_PARENT != 0 {
            return Some(String::from(".."));
        }
        let part = String::from_utf8_lossy(&tag[5..]);
        match &mut name {
            Some(existing) => existing.push_str(&part),
            None => name = Some(part.into_owned()),
        }
        if flags & NM_CONTINUE == 0 {
            break;
        }
    }

    name
}

/// Identifier of a record, truncated at the `;` version suffix.
fn record_identifier(record: &[u8]) -> String {
    let id_len = record[32] as usize;
    let id = &record[RECORD_HEADER_LEN..RECORD_HEADER_LEN + id_len];
    let id = id.split(|&byte| byte == b';').next().unwrap_or(id);
    String::from_utf8_lossy(id).into_owned()
}

impl Iso9660Fs {
    fn extent_of(node: &Node) -> Option<IsoExtent> {
        match node.payload() {
            NodePayload::Iso(extent) => Some(*extent),
            _ => None,
        }
    }
}

impl Filesystem for Iso9660Fs {
    fn name(&self) -> &'static str {
        "iso9660"
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

    fn populate(&self, node: &Arc<Node>) {
        let Some(extent) = Self::extent_of(node) else {
            return;
        };

        let mut records = vec![0u8; extent.data_size as usize];
        self.shared
            .device
            .seek(SeekFrom::Start, extent.data_offset as i64);
        if read_fully(&self.shared.device, &mut records) != records.len() {
            tachyon_core::kerr!("iso9660: short read of directory '{}'", node.name());
            return;
        }

        let mut offset = 0usize;
        let mut record_index = 0u32;

        while offset + RECORD_HEADER_LEN < records.len() {
            let record_len = records[offset] as usize;

            if record_len == 0 {
                // Records never span sectors; zero padding realigns to the
                // next sector boundary.
                offset = (offset + SECTOR_SIZE as usize) & !(SECTOR_SIZE as usize - 1);
                continue;
            }
            if record_len < RECORD_HEADER_LEN || offset + record_len > records.len() {
                break;
            }

            let record = &records[offset..offset + record_len];
            let flags = record[25];

            if record_index == 0
                && node.is_mount_root()
                && !self.shared.uses_susp.load(Ordering::Relaxed)
            {
                // The volume's `.` record announces SUSP with an SP tag.
                for tag in susp_tags(record) {
                    if &tag[..2] == b"SP" && tag.len() >= 7 {
                        let present = tag[4] == 0xBE && tag[5] == 0xEF;
                        self.shared.uses_susp.store(present, Ordering::Relaxed);
                        break;
                    }
                }
            } else if record_index >= 2 && flags & FLAG_HIDDEN == 0 {
                let mut name = record_identifier(record);
                if self.shared.uses_susp.load(Ordering::Relaxed) {
                    if let Some(rock_ridge) = rrip_name(record) {
                        name = rock_ridge;
                    }
                }

                let node_type = if flags & FLAG_DIRECTORY != 0 {
                    NodeType::Directory
                } else {
                    NodeType::File
                };
                let extended = u64::from(record[1]);
                let lba = u64::from(u32_le(record, 2));
                let size = u64::from(u32_le(record, 10));

                let child = Node::new(
                    &name,
                    node_type,
                    false,
                    node.driver().clone(),
                    NodePayload::Iso(IsoExtent {
                        data_offset: (lba + extended) * self.shared.block_size,
                        data_size: size,
                    }),
                    false,
                );
                Node::attach(node, &child);
            }

            record_index += 1;
            offset += record_len;
            if offset % 2 == 1 {
                offset += 1;
            }
        }
    }

    fn open(&self, _node: &Arc<Node>, mode: Mode) -> Result<Arc<dyn FileOps>, FsError> {
        if mode.is_write() {
            return Err(FsError::Unsupported);
        }
        Ok(Arc::new(IsoFileOps {
            shared: self.shared.clone(),
        }))
    }
}

/// Operations on an open ISO file: reads pass through to the backing
/// device at the node's extent.
struct IsoFileOps {
    shared: Arc<IsoShared>,
}

impl FileOps for IsoFileOps {
    fn size(&self, file: &File) -> u64 {
        file.node()
            .and_then(|node| Iso9660Fs::extent_of(node))
            .map_or(0, |extent| extent.data_size)
    }

    fn read(&self, file: &File, buf: &mut [u8]) -> u64 {
        let Some(extent) = file.node().and_then(|node| Iso9660Fs::extent_of(node)) else {
            return 0;
        };
        let cursor = file.cursor();
        let Some(remaining) = extent.data_size.checked_sub(cursor) else {
            return 0;
        };
        let to_read = (remaining as usize).min(buf.len());
        if to_read == 0 {
            return 0;
        }

        self.shared
            .device
            .seek(SeekFrom::Start, (extent.data_offset + cursor) as i64);
        let count = read_fully(&self.shared.device, &mut buf[..to_read]) as u64;
        file.advance_cursor(count);
        count
    }

    fn write(&self, _file: &File, _buf: &[u8]) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs;

    /// Builds one directory record.
    fn record(id: &[u8], lba: u32, size: u32, directory: bool, susp: &[u8]) -> Vec<u8> {
        let mut rec = vec![0u8; RECORD_HEADER_LEN];
        rec[1] = 0; // extended attribute length
        rec[2..6].copy_from_slice(&lba.to_le_bytes());
        rec[6..10].copy_from_slice(&lba.to_be_bytes());
        rec[10..14].copy_from_slice(&size.to_le_bytes());
        rec[14..18].copy_from_slice(&size.to_be_bytes());
        rec[25] = if directory { FLAG_DIRECTORY } else { 0 };
        rec[32] = id.len() as u8;
        rec.extend_from_slice(id);
        if rec.len() % 2 == 1 {
            rec.push(0);
        }
        rec.extend_from_slice(susp);
        if rec.len() % 2 == 1 {
            rec.push(0);
        }
        rec[0] = rec.len() as u8;
        rec
    }

    fn nm_tag(name: &[u8]) -> Vec<u8> {
        let mut tag = vec![b'N', b'M', (5 + name.len()) as u8, 1, 0];
        tag.extend_from_slice(name);
        tag
    }

    fn sp_tag() -> Vec<u8> {
        vec![b'S', b'P', 7, 1, 0xBE, 0xEF, 0]
    }

    /// Builds the fixture volume:
    ///
    /// ```text
    /// /A.TXT;1    -> NM "readme.md", "hello"
    /// /DIR/B.TXT;1 -> NM "greet",    "hi\n"
    /// /SPAN.TXT;1  (second root sector, after zero padding)
    /// ```
    fn fixture_image() -> Vec<u8> {
        let mut image = vec![0u8; 26 * SECTOR_SIZE as usize];

        // Primary Volume Descriptor at LBA 16.
        {
            let pvd = &mut image[16 * 2048..17 * 2048];
            pvd[0] = DESCRIPTOR_PRIMARY;
            pvd[1..6].copy_from_slice(b"CD001");
            pvd[6] = 1;
            pvd[128..130].copy_from_slice(&2048u16.to_le_bytes());
            // Root directory record: LBA 20, two sectors of records.
            let root = record(&[0x00], 20, 4096, true, &[]);
            pvd[156..156 + root.len()].copy_from_slice(&root);
        }
        // Set terminator at LBA 17.
        {
            let term = &mut image[17 * 2048..18 * 2048];
            term[0] = DESCRIPTOR_TERMINATOR;
            term[1..6].copy_from_slice(b"CD001");
        }

        // Root directory extent: sectors 20..21.
        {
            let mut sector = Vec::new();
            sector.extend_from_slice(&record(&[0x00], 20, 4096, true, &sp_tag()));
            sector.extend_from_slice(&record(&[0x01], 20, 4096, true, &[]));
            sector.extend_from_slice(&record(b"A.TXT;1", 23, 5, false, &nm_tag(b"readme.md")));
            sector.extend_from_slice(&record(b"DIR", 22, 2048, true, &[]));
            image[20 * 2048..20 * 2048 + sector.len()].copy_from_slice(&sector);
            // Rest of the sector stays zero: the iterator must realign to
            // sector 21 and keep going.
            let span = record(b"SPAN.TXT;1", 24, 5, false, &[]);
            image[21 * 2048..21 * 2048 + span.len()].copy_from_slice(&span);
        }

        // DIR extent: sector 22.
        {
            let mut sector = Vec::new();
            sector.extend_from_slice(&record(&[0x00], 22, 2048, true, &[]));
            sector.extend_from_slice(&record(&[0x01], 20, 4096, true, &[]));
            sector.extend_from_slice(&record(b"B.TXT;1", 25, 3, false, &nm_tag(b"greet")));
            image[22 * 2048..22 * 2048 + sector.len()].copy_from_slice(&sector);
        }

        // File data.
        image[23 * 2048..23 * 2048 + 5].copy_from_slice(b"hello");
        image[24 * 2048..24 * 2048 + 5].copy_from_slice(b"span!");
        image[25 * 2048..25 * 2048 + 3].copy_from_slice(b"hi\n");

        image
    }

    fn mounted() -> Vfs {
        let vfs = Vfs::new();
        vfs.register_filesystem("ramfs", ramfs::init);
        vfs.register_filesystem("iso9660", init);
        vfs.mount("/", "ramfs", "").unwrap();
        {
            let disk = vfs.open("/disk.iso", Mode::Write).unwrap();
            assert_eq!(disk.write(&fixture_image()) as usize, fixture_image().len());
        }
        vfs.mount("/cd", "iso9660", "/disk.iso").unwrap();
        vfs
    }

    fn read_to_string(vfs: &Vfs, path: &str) -> String {
        let file = vfs.open(path, Mode::Read).unwrap();
        let mut out = Vec::new();
        loop {
            let mut buf = [0u8; 7]; // deliberately small, forces chunked reads
            let count = file.read(&mut buf) as usize;
            if count == 0 {
                break;
            }
            out.extend_from_slice(&buf[..count]);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn listing_uses_rock_ridge_names() {
        let vfs = mounted();
        let names = vfs.read_dir("/cd").unwrap();
        assert_eq!(names, vec!["readme.md", "DIR", "SPAN.TXT"]);
    }

    #[test]
    fn reads_file_contents() {
        let vfs = mounted();
        assert_eq!(read_to_string(&vfs, "/cd/readme.md"), "hello");
        assert_eq!(read_to_string(&vfs, "/cd/DIR/greet"), "hi\n");
    }

    #[test]
    fn sector_boundary_padding_is_skipped() {
        let vfs = mounted();
        assert_eq!(read_to_string(&vfs, "/cd/SPAN.TXT"), "span!");
    }

    #[test]
    fn identifier_version_suffix_is_stripped() {
        // SPAN.TXT has no NM tag; its identifier lost the ";1".
        let vfs = mounted();
        assert!(vfs.find("/cd/SPAN.TXT").is_ok());
        assert_eq!(vfs.find("/cd/SPAN.TXT;1").err(), Some(FsError::NotFound));
    }

    #[test]
    fn volume_is_read_only() {
        let vfs = mounted();
        assert_eq!(
            vfs.open("/cd/readme.md", Mode::Write).err(),
            Some(FsError::Unsupported)
        );
        assert_eq!(
            vfs.open("/cd/new.txt", Mode::Write).err(),
            Some(FsError::Unsupported)
        );
        assert_eq!(vfs.remove("/cd/readme.md"), Err(FsError::Unsupported));
        // The failed write-open left the node reopenable.
        assert!(vfs.open("/cd/readme.md", Mode::Read).is_ok());
    }

    #[test]
    fn seek_and_partial_reads() {
        let vfs = mounted();
        let file = vfs.open("/cd/readme.md", Mode::Read).unwrap();
        file.seek(SeekFrom::Start, 3);
        let mut buf = [0u8; 8];
        let count = file.read(&mut buf) as usize;
        assert_eq!(&buf[..count], b"lo");
        assert_eq!(file.read(&mut buf), 0);
    }

    #[test]
    fn missing_pvd_fails_the_mount() {
        let vfs = Vfs::new();
        vfs.register_filesystem("ramfs", ramfs::init);
        vfs.register_filesystem("iso9660", init);
        vfs.mount("/", "ramfs", "").unwrap();
        {
            let disk = vfs.open("/junk.iso", Mode::Write).unwrap();
            disk.write(&[0u8; 20 * 2048]);
        }
        assert_eq!(
            vfs.mount("/cd", "iso9660", "/junk.iso"),
            Err(FsError::FormatInvalid)
        );
    }

    #[test]
    fn rrip_name_flags() {
        let dot = record(&[0x00], 0, 0, true, &{
            let mut tag = vec![b'N', b'M', 5, 1, NM_CURRENT];
            tag.extend_from_slice(&[]);
            tag
        });
        assert_eq!(rrip_name(&dot).as_deref(), Some("."));

        let split = record(b"X", 0, 0, false, &{
            let mut tags = vec![b'N', b'M', 8, 1, NM_CONTINUE, b'a', b'b', b'c'];
            tags.extend_from_slice(&[b'N', b'M', 7, 1, 0, b'd', b'e']);
            tags
        });
        assert_eq!(rrip_name(&split).as_deref(), Some("abcde"));
    }
}
