//! exFAT filesystem (reader/writer subset)
//!
//! Covers the volume boot record, 32-bit FAT chains, and a single-cluster
//! root directory of 32-byte entry sets. Files can be created, read,
//! written (with chain extension), and unlinked. Nested directories, the
//! allocation bitmap and the up-case table are out of scope.
//!
//! All on-disk fields are little-endian and decoded by byte offset, never
//! by struct punning.

mod dir;
mod fat;
pub mod mkfs;

use alloc::{string::String, sync::Arc, vec};

use spin::Mutex;

use crate::block::BlockDevice;
use crate::error::KernelError;
use crate::fs::{self, Filesystem, FilesystemDriver, Metadata, NodeType, VfsNode};

/// ASCII volume signature at VBR offset 3.
const VBR_SIGNATURE: &[u8; 8] = b"EXFAT   ";

// VBR field offsets
const VBR_BYTES_PER_SECTOR_SHIFT: usize = 0x6C;
const VBR_SECTORS_PER_CLUSTER_SHIFT: usize = 0x6D;
const VBR_FAT_OFFSET: usize = 0x80;
const VBR_FAT_LENGTH: usize = 0x84;
const VBR_CLUSTER_HEAP_OFFSET: usize = 0x88;
const VBR_FIRST_ROOT_CLUSTER: usize = 0xA0;

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap_or([0; 4]))
}

/// Mounted volume geometry plus the device it lives on.
#[derive(Debug)]
pub(crate) struct ExfatVolume {
    dev: Arc<dyn BlockDevice>,
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    /// `bytes_per_sector * sectors_per_cluster`
    cluster_size: u32,
    /// FAT start, in sectors from the volume start
    fat_offset: u32,
    /// FAT length in sectors
    fat_length: u32,
    /// Cluster heap start, in sectors
    cluster_heap_offset: u32,
    root_dir_cluster: u32,
}

impl ExfatVolume {
    /// Read and validate the VBR at LBA 0.
    fn mount(dev: Arc<dyn BlockDevice>) -> Result<Arc<ExfatVolume>, KernelError> {
        let sector_size = dev.sector_size();
        let mut vbr = vec![0u8; sector_size];
        dev.read_sectors(0, &mut vbr)?;

        if vbr.len() < 512 || &vbr[3..11] != VBR_SIGNATURE {
            return Err(KernelError::BadFormat);
        }
        let bps_shift = vbr[VBR_BYTES_PER_SECTOR_SHIFT];
        let spc_shift = vbr[VBR_SECTORS_PER_CLUSTER_SHIFT];
        if !(9..=12).contains(&bps_shift) || spc_shift > 16 {
            return Err(KernelError::BadFormat);
        }
        let bytes_per_sector = 1u32 << bps_shift;
        if bytes_per_sector as usize != sector_size {
            return Err(KernelError::BadFormat);
        }
        let sectors_per_cluster = 1u32 << spc_shift;
        let root_dir_cluster = le32(&vbr, VBR_FIRST_ROOT_CLUSTER);
        if root_dir_cluster < 2 {
            return Err(KernelError::BadFormat);
        }

        let volume = ExfatVolume {
            dev,
            bytes_per_sector,
            sectors_per_cluster,
            cluster_size: bytes_per_sector * sectors_per_cluster,
            fat_offset: le32(&vbr, VBR_FAT_OFFSET),
            fat_length: le32(&vbr, VBR_FAT_LENGTH),
            cluster_heap_offset: le32(&vbr, VBR_CLUSTER_HEAP_OFFSET),
            root_dir_cluster,
        };
        if volume.fat_offset == 0 || volume.fat_length == 0 || volume.cluster_heap_offset == 0 {
            return Err(KernelError::BadFormat);
        }
        log::info!(
            target: "exfat",
            "mounted {}: {} B/sector, {} B/cluster, root cluster {}",
            volume.dev.name(),
            volume.bytes_per_sector,
            volume.cluster_size,
            volume.root_dir_cluster
        );
        Ok(Arc::new(volume))
    }

    fn cluster_size_u64(&self) -> u64 {
        u64::from(self.cluster_size)
    }
}

/// Driver singleton.
pub struct ExfatDriver;

impl FilesystemDriver for ExfatDriver {
    fn name(&self) -> &'static str {
        "exfat"
    }

    fn needs_device(&self) -> bool {
        true
    }

    fn mount(
        &self,
        device: Option<Arc<dyn BlockDevice>>,
    ) -> Result<Arc<dyn Filesystem>, KernelError> {
        let dev = device.ok_or(KernelError::InvalidArgument)?;
        let volume = ExfatVolume::mount(dev)?;
        Ok(Arc::new(ExfatFs { volume }))
    }
}

/// Register the exFAT driver with the VFS.
pub fn register() {
    fs::register_driver(Arc::new(ExfatDriver)).ok();
}

#[derive(Debug)]
struct ExfatFs {
    volume: Arc<ExfatVolume>,
}

fn subpath_name(path: &str) -> Result<&str, KernelError> {
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() || name.contains('/') {
        // only the root directory level exists
        return Err(KernelError::InvalidArgument);
    }
    Ok(name)
}

fn path_is_root(path: &str) -> bool {
    path.is_empty() || path == "/"
}

impl Filesystem for ExfatFs {
    fn open(&self, path: &str) -> Result<Arc<dyn VfsNode>, KernelError> {
        if path_is_root(path) {
            return Ok(Arc::new(ExfatDirNode {
                volume: self.volume.clone(),
            }));
        }
        let name = subpath_name(path)?;
        let entry = dir::find_by_name(&self.volume, name)?.ok_or(KernelError::NotFound)?;
        if entry.is_dir {
            return Ok(Arc::new(ExfatDirNode {
                volume: self.volume.clone(),
            }));
        }
        Ok(Arc::new(ExfatFileNode {
            volume: self.volume.clone(),
            state: Mutex::new(FileState {
                first_cluster: entry.first_cluster,
                size: entry.size,
            }),
        }))
    }

    fn stat(&self, path: &str) -> Result<Metadata, KernelError> {
        if path_is_root(path) {
            return Ok(Metadata {
                node_type: NodeType::Directory,
                size: 0,
            });
        }
        let name = subpath_name(path)?;
        let entry = dir::find_by_name(&self.volume, name)?.ok_or(KernelError::NotFound)?;
        Ok(Metadata {
            node_type: if entry.is_dir {
                NodeType::Directory
            } else {
                NodeType::File
            },
            size: entry.size,
        })
    }

    fn create(&self, path: &str) -> Result<(), KernelError> {
        let name = subpath_name(path)?;
        if dir::find_by_name(&self.volume, name)?.is_some() {
            // an existing file satisfies `touch`
            return Ok(());
        }
        let first_cluster = self.volume.alloc_cluster()?;
        dir::create_entry(&self.volume, name, first_cluster)
    }

    fn unlink(&self, path: &str) -> Result<(), KernelError> {
        let name = subpath_name(path)?;
        let entry = dir::find_by_name(&self.volume, name)?.ok_or(KernelError::NotFound)?;
        self.volume.free_chain(entry.first_cluster)?;
        dir::remove_entry(&self.volume, &entry)
    }
}

/// The root directory handle.
#[derive(Debug)]
struct ExfatDirNode {
    volume: Arc<ExfatVolume>,
}

impl VfsNode for ExfatDirNode {
    fn node_type(&self) -> NodeType {
        NodeType::Directory
    }

    fn size(&self) -> u64 {
        0
    }

    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, KernelError> {
        Err(KernelError::InvalidArgument)
    }

    fn readdir(&self, index: usize) -> Result<Option<String>, KernelError> {
        let entries = dir::scan_root(&self.volume)?;
        Ok(entries.into_iter().nth(index).map(|e| e.name))
    }
}

/// Per-open file state; write updates it together with the directory.
#[derive(Debug)]
struct FileState {
    first_cluster: u32,
    size: u64,
}

#[derive(Debug)]
struct ExfatFileNode {
    volume: Arc<ExfatVolume>,
    state: Mutex<FileState>,
}

impl VfsNode for ExfatFileNode {
    fn node_type(&self) -> NodeType {
        NodeType::File
    }

    fn size(&self) -> u64 {
        self.state.lock().size
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        let (first_cluster, size) = {
            let state = self.state.lock();
            (state.first_cluster, state.size)
        };
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset) as usize;
        let cluster_size = self.volume.cluster_size_u64();

        // walk the chain to the cluster containing `offset`
        let mut cluster = first_cluster;
        for _ in 0..offset / cluster_size {
            match self.volume.fat_get(cluster)? {
                next if self.volume.is_chain_end(next) => break,
                next => cluster = next,
            }
        }

        let mut skip = (offset % cluster_size) as usize;
        let mut cluster_buf = vec![0u8; self.volume.cluster_size as usize];
        let mut done = 0;
        while done < len && cluster >= 2 {
            self.volume.read_cluster(cluster, &mut cluster_buf)?;
            let take = (cluster_buf.len() - skip).min(len - done);
            buf[done..done + take].copy_from_slice(&cluster_buf[skip..skip + take]);
            done += take;
            skip = 0;
            if done >= len {
                break;
            }
            let next = self.volume.fat_get(cluster)?;
            if self.volume.is_chain_end(next) {
                break;
            }
            cluster = next;
        }
        Ok(done)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<usize, KernelError> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        let cluster_size = self.volume.cluster_size_u64();
        let end = offset + data.len() as u64;
        let needed = end.div_ceil(cluster_size);

        let old_first = state.first_cluster;
        let mut first = state.first_cluster;
        self.volume.ensure_chain(&mut first, needed)?;
        state.first_cluster = first;

        // walk to the starting cluster
        let mut cluster = first;
        for _ in 0..offset / cluster_size {
            let next = self.volume.fat_get(cluster)?;
            cluster = if self.volume.is_chain_end(next) {
                self.volume.extend_chain(cluster)?
            } else {
                next
            };
        }

        let mut skip = (offset % cluster_size) as usize;
        let mut cluster_buf = vec![0u8; self.volume.cluster_size as usize];
        let mut done = 0;
        while done < data.len() {
            self.volume.read_cluster(cluster, &mut cluster_buf)?;
            let put = (cluster_buf.len() - skip).min(data.len() - done);
            cluster_buf[skip..skip + put].copy_from_slice(&data[done..done + put]);
            self.volume.write_cluster(cluster, &cluster_buf)?;
            done += put;
            skip = 0;
            if done >= data.len() {
                break;
            }
            let next = self.volume.fat_get(cluster)?;
            cluster = if self.volume.is_chain_end(next) {
                self.volume.extend_chain(cluster)?
            } else {
                next
            };
        }

        if end > state.size || state.first_cluster != old_first {
            if end > state.size {
                state.size = end;
            }
            let match_first = if old_first >= 2 { old_first } else { first };
            dir::update_stream(&self.volume, match_first, state.first_cluster, state.size)?;
        }
        Ok(data.len())
    }

    fn readdir(&self, _index: usize) -> Result<Option<String>, KernelError> {
        Err(KernelError::InvalidArgument)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::block::ramdisk::RamDisk;

    /// A formatted, mounted 2 MiB volume.
    fn fresh_volume(name: &str) -> Arc<dyn Filesystem> {
        crate::mm::pmm::test_pool::init_global();
        let disk = RamDisk::create(name, 2 * 1024 * 1024).unwrap();
        mkfs::format(&(disk.clone() as Arc<dyn BlockDevice>), None).unwrap();
        ExfatDriver.mount(Some(disk as Arc<dyn BlockDevice>)).unwrap()
    }

    #[test]
    fn mount_rejects_a_blank_device() {
        crate::mm::pmm::test_pool::init_global();
        let disk = RamDisk::create("xblank0", 1024 * 1024).unwrap();
        let err = ExfatDriver
            .mount(Some(disk as Arc<dyn BlockDevice>))
            .unwrap_err();
        assert_eq!(err, KernelError::BadFormat);
    }

    #[test]
    fn create_write_read_stat_round_trip() {
        let fs = fresh_volume("xrt0");

        fs.create("/hello.txt").unwrap();
        let node = fs.open("/hello.txt").unwrap();
        assert_eq!(node.node_type(), NodeType::File);
        assert_eq!(node.size(), 0);

        let text = b"Hello, world!";
        assert_eq!(node.write(0, text).unwrap(), text.len());
        assert_eq!(node.size(), text.len() as u64);

        let mut back = [0u8; 64];
        let n = node.read(0, &mut back).unwrap();
        assert_eq!(&back[..n], text);

        let meta = fs.stat("/hello.txt").unwrap();
        assert_eq!(meta.size, 0xD);
        assert_eq!(meta.node_type, NodeType::File);

        // size survives a reopen (directory entry was rewritten)
        let again = fs.open("/hello.txt").unwrap();
        assert_eq!(again.size(), text.len() as u64);
        let n = again.read(0, &mut back).unwrap();
        assert_eq!(&back[..n], text);

        // writes are write-through, so sync has nothing left to do
        fs.sync().unwrap();
    }

    #[test]
    fn touch_is_idempotent() {
        let fs = fresh_volume("xtouch0");
        fs.create("/a.txt").unwrap();
        let node = fs.open("/a.txt").unwrap();
        node.write(0, b"keep").unwrap();
        fs.create("/a.txt").unwrap();
        assert_eq!(fs.stat("/a.txt").unwrap().size, 4);
    }

    #[test]
    fn multi_cluster_files_span_the_fat_chain() {
        let fs = fresh_volume("xbig0");
        fs.create("/big.bin").unwrap();
        let node = fs.open("/big.bin").unwrap();

        // several clusters worth of patterned data
        let data: alloc::vec::Vec<u8> = (0..5000).map(|i| (i * 7 % 256) as u8).collect();
        assert_eq!(node.write(0, &data).unwrap(), data.len());
        assert_eq!(node.size(), 5000);

        let mut back = alloc::vec![0u8; 5000];
        assert_eq!(node.read(0, &mut back).unwrap(), 5000);
        assert_eq!(back, data);

        // a read crossing cluster boundaries from an odd offset
        let mut window = [0u8; 700];
        let n = node.read(400, &mut window).unwrap();
        assert_eq!(n, 700);
        assert_eq!(&window[..], &data[400..1100]);

        // reads are bounded by the file size
        let mut tail = [0u8; 100];
        assert_eq!(node.read(4990, &mut tail).unwrap(), 10);
        assert_eq!(node.read(5000, &mut tail).unwrap(), 0);
    }

    #[test]
    fn sparse_offset_write_extends_the_file() {
        let fs = fresh_volume("xext0");
        fs.create("/log.txt").unwrap();
        let node = fs.open("/log.txt").unwrap();

        node.write(0, b"start").unwrap();
        // jump past the first cluster
        node.write(1000, b"end").unwrap();
        assert_eq!(node.size(), 1003);

        let mut buf = [0u8; 5];
        node.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"start");
        let mut buf = [0u8; 3];
        node.read(1000, &mut buf).unwrap();
        assert_eq!(&buf, b"end");
    }

    #[test]
    fn unlink_removes_and_frees() {
        let fs = fresh_volume("xrm0");
        fs.create("/doomed.txt").unwrap();
        let node = fs.open("/doomed.txt").unwrap();
        node.write(0, &[0xAA; 2000]).unwrap();
        drop(node);

        fs.unlink("/doomed.txt").unwrap();
        assert_eq!(fs.open("/doomed.txt").unwrap_err(), KernelError::NotFound);
        assert_eq!(fs.stat("/doomed.txt").unwrap_err(), KernelError::NotFound);
        assert_eq!(fs.unlink("/doomed.txt").unwrap_err(), KernelError::NotFound);

        // neighbors survive
        fs.create("/stays.txt").unwrap();
        fs.unlink("/stays.txt").unwrap();
    }

    #[test]
    fn root_readdir_lists_every_file_once() {
        let fs = fresh_volume("xls0");
        fs.create("/one").unwrap();
        fs.create("/two").unwrap();
        fs.create("/three").unwrap();

        let root = fs.open("/").unwrap();
        assert!(root.node_type() == NodeType::Directory);
        let mut names = alloc::vec::Vec::new();
        let mut index = 0;
        while let Some(name) = root.readdir(index).unwrap() {
            names.push(name);
            index += 1;
        }
        names.sort();
        assert_eq!(names, ["one", "three", "two"]);
    }

    #[test]
    fn deep_paths_are_rejected() {
        let fs = fresh_volume("xdeep0");
        assert_eq!(
            fs.open("/a/b").unwrap_err(),
            KernelError::InvalidArgument
        );
        assert_eq!(
            fs.create("/a/b").unwrap_err(),
            KernelError::InvalidArgument
        );
    }
}
