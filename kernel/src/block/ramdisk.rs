//! Frame-backed RAM disk
//!
//! Storage comes straight from the physical frame allocator and is
//! accessed through the identity mapping, so a RAM disk doubles as a
//! stress test for the PMM. Created interactively via the shell's `mkram`.

use alloc::{string::String, sync::Arc};

use spin::Mutex;

use crate::block::{self, check_transfer, BlockDevice, SECTOR_SIZE};
use crate::error::KernelError;
use crate::mm::{align_up, PhysicalAddress, FRAME_SIZE, PMM};

/// A block device over a contiguous run of physical frames.
#[derive(Debug)]
pub struct RamDisk {
    name: String,
    base: PhysicalAddress,
    bytes: u64,
    /// Serializes sector transfers; contents live outside the heap
    io: Mutex<()>,
}

impl RamDisk {
    /// Allocate a zeroed RAM disk of at least `bytes` (rounded up to whole
    /// sectors) and register it.
    pub fn create(name: &str, bytes: u64) -> Result<Arc<RamDisk>, KernelError> {
        if name.is_empty() || bytes == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let rounded = align_up(bytes, SECTOR_SIZE as u64);
        let frames = align_up(rounded, FRAME_SIZE) / FRAME_SIZE;
        let base = PMM.lock().alloc_frames(frames as usize)?;

        // SAFETY: the frames were just allocated for this disk alone and
        // are reachable through the identity mapping.
        unsafe {
            core::ptr::write_bytes(base.as_u64() as *mut u8, 0, (frames * FRAME_SIZE) as usize)
        };

        let disk = Arc::new(RamDisk {
            name: String::from(name),
            base,
            bytes: rounded,
            io: Mutex::new(()),
        });
        if let Err(e) = block::register(disk.clone()) {
            PMM.lock().free_frames(base, frames as usize);
            return Err(e);
        }
        Ok(disk)
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_count(&self) -> u64 {
        self.bytes / SECTOR_SIZE as u64
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), KernelError> {
        check_transfer(self, lba, buf.len())?;
        let _io = self.io.lock();
        let src = self.base.as_u64() + lba * SECTOR_SIZE as u64;
        // SAFETY: check_transfer bounds the range inside the disk's frames;
        // the io lock serializes access to them.
        unsafe { core::ptr::copy_nonoverlapping(src as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), KernelError> {
        check_transfer(self, lba, buf.len())?;
        let _io = self.io.lock();
        let dst = self.base.as_u64() + lba * SECTOR_SIZE as u64;
        // SAFETY: as in read_sectors.
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), dst as *mut u8, buf.len()) };
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn round_trips_sectors_and_zero_fills() {
        crate::mm::pmm::test_pool::init_global();

        let disk = RamDisk::create("ramrt0", 100 * 1024).unwrap();
        // rounded to whole sectors
        assert_eq!(disk.sector_count(), 200);

        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_sectors(42, &mut sector).unwrap();
        assert!(sector.iter().all(|&b| b == 0), "fresh disk reads zero");

        let pattern: alloc::vec::Vec<u8> = (0..SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
        disk.write_sectors(42, &pattern).unwrap();
        disk.read_sectors(42, &mut sector).unwrap();
        assert_eq!(&sector[..], &pattern[..]);

        // neighbors untouched
        disk.read_sectors(41, &mut sector).unwrap();
        assert!(sector.iter().all(|&b| b == 0));
        disk.read_sectors(43, &mut sector).unwrap();
        assert!(sector.iter().all(|&b| b == 0));
    }

    #[test]
    fn create_rejects_degenerate_requests() {
        crate::mm::pmm::test_pool::init_global();
        assert_eq!(
            RamDisk::create("", 4096).unwrap_err(),
            KernelError::InvalidArgument
        );
        assert_eq!(
            RamDisk::create("ramdeg0", 0).unwrap_err(),
            KernelError::InvalidArgument
        );
    }

    #[test]
    fn multi_sector_transfers() {
        crate::mm::pmm::test_pool::init_global();

        let disk = RamDisk::create("rammulti0", 64 * 1024).unwrap();
        let data: alloc::vec::Vec<u8> = (0..4 * SECTOR_SIZE).map(|i| (i / 7 % 256) as u8).collect();
        disk.write_sectors(10, &data).unwrap();

        let mut back = alloc::vec![0u8; 4 * SECTOR_SIZE];
        disk.read_sectors(10, &mut back).unwrap();
        assert_eq!(back, data);
    }
}
