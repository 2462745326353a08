//! Memory-range block device
//!
//! Exposes an existing memory region (typically a boot module) as a block
//! device without copying it. Read-only unless the caller says otherwise.

use alloc::{string::String, sync::Arc};

use spin::Mutex;

use crate::block::{self, check_transfer, BlockDevice};
use crate::error::KernelError;

/// A block device view over `[base, base + bytes)`.
#[derive(Debug)]
pub struct MemDisk {
    name: String,
    base: u64,
    bytes: u64,
    sector_size: usize,
    writable: bool,
    io: Mutex<()>,
}

impl MemDisk {
    /// Wrap a memory range and register it. `bytes` must be a positive
    /// multiple of `sector_size`.
    ///
    /// # Safety
    ///
    /// The range must stay mapped and unused by anything else for the
    /// lifetime of the device (forever, since devices are never
    /// unregistered). For read-only disks the range may be shared.
    pub unsafe fn register(
        name: &str,
        base: u64,
        bytes: u64,
        sector_size: usize,
        writable: bool,
    ) -> Result<Arc<MemDisk>, KernelError> {
        if name.is_empty() || bytes == 0 || sector_size == 0 || bytes % sector_size as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let disk = Arc::new(MemDisk {
            name: String::from(name),
            base,
            bytes,
            sector_size,
            writable,
            io: Mutex::new(()),
        });
        block::register(disk.clone())?;
        Ok(disk)
    }
}

impl BlockDevice for MemDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.bytes / self.sector_size as u64
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), KernelError> {
        check_transfer(self, lba, buf.len())?;
        let _io = self.io.lock();
        let src = self.base + lba * self.sector_size as u64;
        // SAFETY: check_transfer keeps the range inside the region the
        // creator vouched for.
        unsafe { core::ptr::copy_nonoverlapping(src as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), KernelError> {
        if !self.writable {
            return Err(KernelError::PermissionDenied);
        }
        check_transfer(self, lba, buf.len())?;
        let _io = self.io.lock();
        let dst = self.base + lba * self.sector_size as u64;
        // SAFETY: as in read_sectors; writable regions are exclusively
        // owned per the register contract.
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), dst as *mut u8, buf.len()) };
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::block::SECTOR_SIZE;

    #[test]
    fn read_only_view_over_a_buffer() {
        let buf: &'static mut [u8] = std::vec![0u8; 4 * SECTOR_SIZE].leak();
        buf[SECTOR_SIZE] = 0xAB;
        let base = buf.as_ptr() as u64;

        // SAFETY: leaked buffer lives forever and is otherwise unused.
        let disk = unsafe {
            MemDisk::register("memro0", base, buf.len() as u64, SECTOR_SIZE, false).unwrap()
        };
        assert_eq!(disk.sector_count(), 4);

        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_sectors(1, &mut sector).unwrap();
        assert_eq!(sector[0], 0xAB);

        assert_eq!(
            disk.write_sectors(0, &sector),
            Err(KernelError::PermissionDenied)
        );
    }

    #[test]
    fn ragged_sizes_are_rejected() {
        // SAFETY: degenerate request fails before the range is used.
        let result = unsafe { MemDisk::register("memrag0", 0x1000, 100, SECTOR_SIZE, false) };
        assert_eq!(result.unwrap_err(), KernelError::InvalidArgument);
    }
}
