//! Device filesystem
//!
//! Reflects the block device registry as files: `dev:/` lists every
//! registered device in registration order, `dev:/<name>` reads and
//! writes the raw device bytes. Offsets need not be sector-aligned; the
//! head and tail are handled with read-modify-copy of a single sector and
//! the middle moves in bounded full-sector batches.

use alloc::{string::String, sync::Arc, vec};

use crate::block::{self, BlockDevice};
use crate::error::KernelError;
use crate::fs::{self, Filesystem, FilesystemDriver, Metadata, NodeType, VfsNode};

/// Most sectors moved per block-layer call.
const MAX_BATCH_SECTORS: usize = 128;

/// Driver singleton.
pub struct DevFsDriver;

impl FilesystemDriver for DevFsDriver {
    fn name(&self) -> &'static str {
        "devfs"
    }

    fn needs_device(&self) -> bool {
        false
    }

    fn mount(
        &self,
        _device: Option<Arc<dyn BlockDevice>>,
    ) -> Result<Arc<dyn Filesystem>, KernelError> {
        Ok(Arc::new(DevFs))
    }
}

/// Register the devfs driver with the VFS.
pub fn register() {
    fs::register_driver(Arc::new(DevFsDriver)).ok();
}

#[derive(Debug)]
struct DevFs;

fn strip_root(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

impl Filesystem for DevFs {
    fn open(&self, path: &str) -> Result<Arc<dyn VfsNode>, KernelError> {
        let name = strip_root(path);
        if name.is_empty() {
            return Ok(Arc::new(DevDirNode));
        }
        let dev = block::find(name).ok_or(KernelError::NotFound)?;
        Ok(Arc::new(DevFileNode { dev }))
    }

    fn stat(&self, path: &str) -> Result<Metadata, KernelError> {
        let name = strip_root(path);
        if name.is_empty() {
            return Ok(Metadata {
                node_type: NodeType::Directory,
                size: 0,
            });
        }
        let dev = block::find(name).ok_or(KernelError::NotFound)?;
        Ok(Metadata {
            node_type: NodeType::File,
            size: dev.sector_count() * dev.sector_size() as u64,
        })
    }
}

/// The single devfs directory.
#[derive(Debug)]
struct DevDirNode;

impl VfsNode for DevDirNode {
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
        Ok(block::devices()
            .get(index)
            .map(|d| String::from(d.name())))
    }
}

/// One block device seen as a file.
#[derive(Debug)]
struct DevFileNode {
    dev: Arc<dyn BlockDevice>,
}

impl VfsNode for DevFileNode {
    fn node_type(&self) -> NodeType {
        NodeType::File
    }

    fn size(&self) -> u64 {
        self.dev.sector_count() * self.dev.sector_size() as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        let end = (offset + buf.len() as u64).min(self.size());
        if end <= offset {
            return Ok(0);
        }
        let len = (end - offset) as usize;
        let sector_size = self.dev.sector_size();
        let mut lba = offset / sector_size as u64;
        let head = (offset % sector_size as u64) as usize;
        let mut done = 0;

        if head != 0 {
            let mut sector = vec![0u8; sector_size];
            self.dev.read_sectors(lba, &mut sector)?;
            let take = (sector_size - head).min(len);
            buf[..take].copy_from_slice(&sector[head..head + take]);
            done += take;
            lba += 1;
        }

        while len - done >= sector_size {
            let sectors = ((len - done) / sector_size).min(MAX_BATCH_SECTORS);
            let bytes = sectors * sector_size;
            self.dev.read_sectors(lba, &mut buf[done..done + bytes])?;
            done += bytes;
            lba += sectors as u64;
        }

        if done < len {
            let mut sector = vec![0u8; sector_size];
            self.dev.read_sectors(lba, &mut sector)?;
            let tail = len - done;
            buf[done..len].copy_from_slice(&sector[..tail]);
            done = len;
        }
        Ok(done)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<usize, KernelError> {
        let end = (offset + data.len() as u64).min(self.size());
        if end <= offset {
            return Ok(0);
        }
        let len = (end - offset) as usize;
        let sector_size = self.dev.sector_size();
        let mut lba = offset / sector_size as u64;
        let head = (offset % sector_size as u64) as usize;
        let mut done = 0;

        if head != 0 {
            let mut sector = vec![0u8; sector_size];
            self.dev.read_sectors(lba, &mut sector)?;
            let put = (sector_size - head).min(len);
            sector[head..head + put].copy_from_slice(&data[..put]);
            self.dev.write_sectors(lba, &sector)?;
            done += put;
            lba += 1;
        }

        while len - done >= sector_size {
            let sectors = ((len - done) / sector_size).min(MAX_BATCH_SECTORS);
            let bytes = sectors * sector_size;
            self.dev.write_sectors(lba, &data[done..done + bytes])?;
            done += bytes;
            lba += sectors as u64;
        }

        if done < len {
            let mut sector = vec![0u8; sector_size];
            self.dev.read_sectors(lba, &mut sector)?;
            let tail = len - done;
            sector[..tail].copy_from_slice(&data[done..len]);
            self.dev.write_sectors(lba, &sector)?;
            done = len;
        }
        Ok(done)
    }

    fn readdir(&self, _index: usize) -> Result<Option<String>, KernelError> {
        Err(KernelError::InvalidArgument)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::block::ramdisk::RamDisk;
    use crate::block::SECTOR_SIZE;

    fn mounted() -> Arc<dyn Filesystem> {
        register();
        DevFsDriver.mount(None).unwrap()
    }

    #[test]
    fn root_lists_devices_in_registration_order() {
        crate::mm::pmm::test_pool::init_global();
        RamDisk::create("dvlist0", 16 * 1024).unwrap();
        RamDisk::create("dvlist1", 16 * 1024).unwrap();

        let devfs = mounted();
        let root = devfs.open("/").unwrap();
        assert_eq!(root.node_type(), NodeType::Directory);

        let mut seen = alloc::vec::Vec::new();
        let mut index = 0;
        while let Some(name) = root.readdir(index).unwrap() {
            seen.push(name);
            index += 1;
        }
        let pos0 = seen.iter().position(|n| n == "dvlist0");
        let pos1 = seen.iter().position(|n| n == "dvlist1");
        assert!(pos0.is_some() && pos1.is_some());
        assert!(pos0 < pos1, "readdir order follows registration order");
        // each device appears exactly once
        assert_eq!(seen.iter().filter(|n| *n == "dvlist0").count(), 1);
    }

    #[test]
    fn stat_reports_device_bytes() {
        crate::mm::pmm::test_pool::init_global();
        RamDisk::create("dvstat0", 64 * 1024).unwrap();

        let devfs = mounted();
        let meta = devfs.stat("/dvstat0").unwrap();
        assert_eq!(meta.node_type, NodeType::File);
        assert_eq!(meta.size, 64 * 1024);
        assert!(devfs.stat("/").unwrap().is_dir());
        assert_eq!(devfs.stat("/absent").unwrap_err(), KernelError::NotFound);
        assert_eq!(devfs.open("/absent").unwrap_err(), KernelError::NotFound);
        devfs.sync().unwrap();
    }

    #[test]
    fn unaligned_read_write_round_trip() {
        crate::mm::pmm::test_pool::init_global();
        RamDisk::create("dvrw0", 64 * 1024).unwrap();

        let devfs = mounted();
        let node = devfs.open("/dvrw0").unwrap();

        // spans head partial, middle sectors, tail partial
        let data: alloc::vec::Vec<u8> = (0..3000).map(|i| (i % 253) as u8).collect();
        let offset = 100;
        assert_eq!(node.write(offset, &data).unwrap(), data.len());

        let mut back = alloc::vec![0u8; data.len()];
        assert_eq!(node.read(offset, &mut back).unwrap(), data.len());
        assert_eq!(back, data);

        // bytes before the window stayed zero
        let mut prefix = [0u8; 100];
        node.read(0, &mut prefix).unwrap();
        assert!(prefix.iter().all(|&b| b == 0));

        // unaligned chunks reassemble the same content
        let mut pieces = alloc::vec![0u8; data.len()];
        let mut at = 0;
        for chunk in [7usize, 450, 512, 1024, 3000] {
            if at >= data.len() {
                break;
            }
            let want = chunk.min(data.len() - at);
            let n = node
                .read(offset + at as u64, &mut pieces[at..at + want])
                .unwrap();
            assert_eq!(n, want);
            at += want;
        }
        assert_eq!(pieces, data);
    }

    #[test]
    fn transfers_truncate_at_device_end() {
        crate::mm::pmm::test_pool::init_global();
        RamDisk::create("dvend0", 4 * SECTOR_SIZE as u64).unwrap();

        let devfs = mounted();
        let node = devfs.open("/dvend0").unwrap();
        let size = node.size();

        let mut buf = [0u8; 300];
        // 100 bytes before the end: short read
        assert_eq!(node.read(size - 100, &mut buf).unwrap(), 100);
        // at the end: nothing
        assert_eq!(node.read(size, &mut buf).unwrap(), 0);

        let data = [0x5Au8; 300];
        assert_eq!(node.write(size - 100, &data).unwrap(), 100);
        assert_eq!(node.write(size + 10, &data).unwrap(), 0);
    }
}
