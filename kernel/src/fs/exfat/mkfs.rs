//! Minimal exFAT formatter
//!
//! Writes just enough structure for this kernel's own mount path: a VBR
//! carrying the geometry fields, a zeroed FAT with the reserved head
//! entries, and an empty root directory cluster. The allocation bitmap
//! and up-case table of a fully compliant volume are not written.

use alloc::{sync::Arc, vec};

use crate::block::{BlockDevice, SECTOR_SIZE};
use crate::error::KernelError;

use super::fat::FAT_EOC;
use super::{
    VBR_BYTES_PER_SECTOR_SHIFT, VBR_CLUSTER_HEAP_OFFSET, VBR_FAT_LENGTH, VBR_FAT_OFFSET,
    VBR_FIRST_ROOT_CLUSTER, VBR_SECTORS_PER_CLUSTER_SHIFT, VBR_SIGNATURE,
};

/// Sectors reserved ahead of the FAT (boot region and its backup).
const FAT_OFFSET_SECTORS: u32 = 128;
/// Media descriptor value for FAT entry 0.
const MEDIA_DESCRIPTOR_ENTRY: u32 = 0xFFFF_FFF8;
/// Sectors of zeroes written per device call while clearing the FAT.
const WIPE_BATCH_SECTORS: usize = 8;

/// Format `dev` as a minimal exFAT volume: 512-byte sectors, one sector
/// per cluster, root directory in cluster 2.
pub fn format(dev: &Arc<dyn BlockDevice>, label: Option<&str>) -> Result<(), KernelError> {
    if dev.sector_size() != SECTOR_SIZE {
        return Err(KernelError::BadFormat);
    }
    let total_sectors = dev.sector_count();

    // size the FAT generously: one entry per volume sector plus the two
    // reserved head entries, so every heap cluster has an entry
    let fat_entries = total_sectors + 2;
    let fat_length = (fat_entries * 4).div_ceil(SECTOR_SIZE as u64) as u32;
    let cluster_heap_offset = FAT_OFFSET_SECTORS + fat_length;
    if total_sectors <= u64::from(cluster_heap_offset) + 1 {
        return Err(KernelError::BadFormat);
    }

    // volume boot record
    let mut vbr = vec![0u8; SECTOR_SIZE];
    vbr[0] = 0xEB; // jump stub expected at the start of a boot sector
    vbr[1] = 0x76;
    vbr[2] = 0x90;
    vbr[3..11].copy_from_slice(VBR_SIGNATURE);
    vbr[VBR_BYTES_PER_SECTOR_SHIFT] = 9; // 512
    vbr[VBR_SECTORS_PER_CLUSTER_SHIFT] = 0; // 1 sector per cluster
    vbr[VBR_FAT_OFFSET..VBR_FAT_OFFSET + 4]
        .copy_from_slice(&FAT_OFFSET_SECTORS.to_le_bytes());
    vbr[VBR_FAT_LENGTH..VBR_FAT_LENGTH + 4].copy_from_slice(&fat_length.to_le_bytes());
    vbr[VBR_CLUSTER_HEAP_OFFSET..VBR_CLUSTER_HEAP_OFFSET + 4]
        .copy_from_slice(&cluster_heap_offset.to_le_bytes());
    vbr[VBR_FIRST_ROOT_CLUSTER..VBR_FIRST_ROOT_CLUSTER + 4]
        .copy_from_slice(&2u32.to_le_bytes());
    vbr[510] = 0x55;
    vbr[511] = 0xAA;
    dev.write_sectors(0, &vbr)?;

    // clear the FAT in batches
    let zeroes = vec![0u8; WIPE_BATCH_SECTORS * SECTOR_SIZE];
    let mut lba = u64::from(FAT_OFFSET_SECTORS);
    let fat_end = lba + u64::from(fat_length);
    while lba < fat_end {
        let batch = (fat_end - lba).min(WIPE_BATCH_SECTORS as u64) as usize;
        dev.write_sectors(lba, &zeroes[..batch * SECTOR_SIZE])?;
        lba += batch as u64;
    }

    // reserved head entries plus an end-of-chain root directory
    let mut fat_head = vec![0u8; SECTOR_SIZE];
    fat_head[0..4].copy_from_slice(&MEDIA_DESCRIPTOR_ENTRY.to_le_bytes());
    fat_head[4..8].copy_from_slice(&FAT_EOC.to_le_bytes());
    fat_head[8..12].copy_from_slice(&FAT_EOC.to_le_bytes()); // root cluster
    dev.write_sectors(u64::from(FAT_OFFSET_SECTORS), &fat_head)?;

    // empty root directory
    let empty = vec![0u8; SECTOR_SIZE];
    dev.write_sectors(u64::from(cluster_heap_offset), &empty)?;

    log::info!(
        target: "exfat",
        "formatted {}: {} sectors, FAT at {}+{}, heap at {}{}{}",
        dev.name(),
        total_sectors,
        FAT_OFFSET_SECTORS,
        fat_length,
        cluster_heap_offset,
        if label.is_some() { ", label " } else { "" },
        label.unwrap_or("")
    );
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::block::ramdisk::RamDisk;
    use crate::fs::exfat::ExfatVolume;

    #[test]
    fn formatted_volume_mounts_with_expected_geometry() {
        crate::mm::pmm::test_pool::init_global();
        let disk = RamDisk::create("mkfs0", 2 * 1024 * 1024).unwrap();
        format(&(disk.clone() as Arc<dyn BlockDevice>), Some("demo")).unwrap();

        let volume = ExfatVolume::mount(disk.clone()).unwrap();
        assert_eq!(volume.bytes_per_sector, 512);
        assert_eq!(volume.sectors_per_cluster, 1);
        assert_eq!(volume.cluster_size, 512);
        assert_eq!(volume.fat_offset, FAT_OFFSET_SECTORS);
        assert_eq!(volume.root_dir_cluster, 2);
        assert_eq!(
            volume.cluster_heap_offset,
            FAT_OFFSET_SECTORS + volume.fat_length
        );

        // root cluster is end-of-chain so allocation never reuses it
        assert_eq!(volume.fat_get(2).unwrap(), FAT_EOC);
        // first data allocation lands after the root
        assert_eq!(volume.alloc_cluster().unwrap(), 3);
    }

    #[test]
    fn format_refuses_tiny_devices() {
        crate::mm::pmm::test_pool::init_global();
        // smaller than the reserved area plus FAT
        let disk = RamDisk::create("mkfstiny0", 64 * 1024).unwrap();
        let err = format(&(disk as Arc<dyn BlockDevice>), None).unwrap_err();
        assert_eq!(err, KernelError::BadFormat);
    }
}
