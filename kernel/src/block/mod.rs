//! Block device layer
//!
//! Sector-addressed devices behind a common trait, a global registry, and
//! MBR partition scanning that republishes partitions as sub-devices.

pub mod memdisk;
pub mod partition;
pub mod ramdisk;

use alloc::{sync::Arc, vec::Vec};

use spin::RwLock;

use crate::error::KernelError;

/// Default sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// A sector-addressed storage device.
///
/// Writing is optional; devices without it inherit the refusing default.
pub trait BlockDevice: Send + Sync + core::fmt::Debug {
    /// Device name as used in `devfs` and shell commands.
    fn name(&self) -> &str;

    /// Bytes per sector.
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// Total sectors.
    fn sector_count(&self) -> u64;

    /// Read whole sectors starting at `lba`. `buf` must be a multiple of
    /// the sector size; requests reaching past the device fail.
    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), KernelError>;

    /// Write whole sectors starting at `lba`.
    fn write_sectors(&self, _lba: u64, _buf: &[u8]) -> Result<(), KernelError> {
        Err(KernelError::PermissionDenied)
    }
}

/// Validate an `(lba, buf)` pair against a device's geometry and return
/// the sector count.
pub(crate) fn check_transfer(
    dev: &dyn BlockDevice,
    lba: u64,
    buf_len: usize,
) -> Result<u64, KernelError> {
    let sector_size = dev.sector_size();
    if sector_size == 0 || buf_len % sector_size != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let sectors = (buf_len / sector_size) as u64;
    if lba
        .checked_add(sectors)
        .map_or(true, |end| end > dev.sector_count())
    {
        return Err(KernelError::InvalidArgument);
    }
    Ok(sectors)
}

static DEVICES: RwLock<Vec<Arc<dyn BlockDevice>>> = RwLock::new(Vec::new());

/// Add a device to the registry. Names must be unique.
pub fn register(dev: Arc<dyn BlockDevice>) -> Result<(), KernelError> {
    if dev.name().is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let mut devices = DEVICES.write();
    if devices.iter().any(|d| d.name() == dev.name()) {
        return Err(KernelError::InvalidArgument);
    }
    log::info!(
        target: "block",
        "registered {} ({} x {} bytes)",
        dev.name(),
        dev.sector_count(),
        dev.sector_size()
    );
    devices.push(dev);
    Ok(())
}

/// Look a device up by name.
pub fn find(name: &str) -> Option<Arc<dyn BlockDevice>> {
    DEVICES.read().iter().find(|d| d.name() == name).cloned()
}

/// Snapshot of all devices in registration order.
pub fn devices() -> Vec<Arc<dyn BlockDevice>> {
    DEVICES.read().clone()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use super::ramdisk::RamDisk;

    #[test]
    fn registry_finds_by_name_and_rejects_duplicates() {
        crate::mm::pmm::test_pool::init_global();

        RamDisk::create("blkreg0", 64 * 1024).unwrap();
        let dev = find("blkreg0").expect("registered device is findable");
        assert_eq!(dev.sector_size(), SECTOR_SIZE);
        assert_eq!(dev.sector_count(), 128);

        assert_eq!(
            RamDisk::create("blkreg0", 64 * 1024).unwrap_err(),
            KernelError::InvalidArgument
        );
        assert!(find("blkreg-missing").is_none());
    }

    #[test]
    fn transfers_are_bounds_checked() {
        crate::mm::pmm::test_pool::init_global();

        let dev = RamDisk::create("blkbounds0", 4 * 1024).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];

        // 8 sectors total: last valid single-sector read is lba 7
        dev.read_sectors(7, &mut buf).unwrap();
        assert_eq!(
            dev.read_sectors(8, &mut buf),
            Err(KernelError::InvalidArgument)
        );

        let mut two = [0u8; 2 * SECTOR_SIZE];
        assert_eq!(
            dev.read_sectors(7, &mut two),
            Err(KernelError::InvalidArgument)
        );

        // ragged buffer length
        let mut ragged = [0u8; 100];
        assert_eq!(
            dev.read_sectors(0, &mut ragged),
            Err(KernelError::InvalidArgument)
        );
    }
}
