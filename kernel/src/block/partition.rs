//! MBR partition scanning
//!
//! Reads sector 0 of every 512-byte-sector device, and for each valid
//! partition entry registers a sub-device that translates and
//! bounds-checks LBAs against the partition window. Extended partitions
//! are not recursed into.

use alloc::{format, string::String, sync::Arc, vec};

use crate::block::{self, check_transfer, BlockDevice, SECTOR_SIZE};
use crate::error::KernelError;

/// Offset of the partition table inside the MBR.
const PARTITION_TABLE_OFFSET: usize = 446;
/// Bytes per partition entry.
const PARTITION_ENTRY_SIZE: usize = 16;
/// Boot signature offset and value.
const SIGNATURE_OFFSET: usize = 510;
const SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// One decoded partition table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrEntry {
    pub kind: u8,
    pub start_lba: u32,
    pub sector_count: u32,
}

/// Decode entry `index` (0..4) from an MBR sector. Returns None for empty
/// slots (type 0 or zero sectors).
pub fn parse_entry(mbr: &[u8], index: usize) -> Option<MbrEntry> {
    if mbr.len() < SECTOR_SIZE || index >= 4 {
        return None;
    }
    let off = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_SIZE;
    let entry = &mbr[off..off + PARTITION_ENTRY_SIZE];
    let kind = entry[4];
    let start_lba = u32::from_le_bytes(entry[8..12].try_into().ok()?);
    let sector_count = u32::from_le_bytes(entry[12..16].try_into().ok()?);
    if kind == 0 || sector_count == 0 {
        return None;
    }
    Some(MbrEntry {
        kind,
        start_lba,
        sector_count,
    })
}

/// True when the sector carries the 0x55AA boot signature.
pub fn has_signature(mbr: &[u8]) -> bool {
    mbr.len() >= SECTOR_SIZE && mbr[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] == SIGNATURE
}

/// A window onto a parent device.
#[derive(Debug)]
pub struct PartitionDevice {
    name: String,
    parent: Arc<dyn BlockDevice>,
    lba_base: u64,
    lba_count: u64,
}

impl PartitionDevice {
    pub fn new(
        name: String,
        parent: Arc<dyn BlockDevice>,
        lba_base: u64,
        lba_count: u64,
    ) -> Self {
        Self {
            name,
            parent,
            lba_base,
            lba_count,
        }
    }
}

impl BlockDevice for PartitionDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn sector_size(&self) -> usize {
        self.parent.sector_size()
    }

    fn sector_count(&self) -> u64 {
        self.lba_count
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), KernelError> {
        check_transfer(self, lba, buf.len())?;
        self.parent.read_sectors(self.lba_base + lba, buf)
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), KernelError> {
        check_transfer(self, lba, buf.len())?;
        self.parent.write_sectors(self.lba_base + lba, buf)
    }
}

/// Scan every registered 512-byte-sector device for an MBR and register
/// `<parent>p<1..4>` sub-devices. Returns how many partitions were
/// registered. Re-scans are harmless: duplicate names are refused by the
/// registry.
pub fn scan() -> usize {
    let mut registered = 0;
    for dev in block::devices() {
        if dev.sector_size() != SECTOR_SIZE {
            continue;
        }
        let mut mbr = vec![0u8; SECTOR_SIZE];
        if dev.read_sectors(0, &mut mbr).is_err() {
            continue;
        }
        if !has_signature(&mbr) {
            continue;
        }
        for index in 0..4 {
            let Some(entry) = parse_entry(&mbr, index) else {
                continue;
            };
            let name = format!("{}p{}", dev.name(), index + 1);
            let part = PartitionDevice::new(
                name.clone(),
                dev.clone(),
                u64::from(entry.start_lba),
                u64::from(entry.sector_count),
            );
            if block::register(Arc::new(part)).is_ok() {
                log::info!(
                    target: "block",
                    "partition {name}: type {:#04x}, start {}, {} sectors",
                    entry.kind,
                    entry.start_lba,
                    entry.sector_count
                );
                registered += 1;
            }
        }
    }
    registered
}
