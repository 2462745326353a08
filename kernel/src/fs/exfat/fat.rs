//! FAT access and cluster chain maintenance
//!
//! The FAT is an array of 32-bit little-endian entries, one per cluster,
//! chaining clusters into files. Entry 0 is free, 0xFFFFFFFF terminates a
//! chain. Cluster numbering starts at 2, the first cluster of the heap.

use alloc::vec;

use crate::error::KernelError;

use super::ExfatVolume;

/// End-of-chain sentinel.
pub(crate) const FAT_EOC: u32 = 0xFFFF_FFFF;
/// Free-cluster marker.
pub(crate) const FAT_FREE: u32 = 0;
/// First valid cluster number.
pub(crate) const FIRST_CLUSTER: u32 = 2;

impl ExfatVolume {
    /// LBA of a cluster's first sector.
    pub(crate) fn cluster_to_lba(&self, cluster: u32) -> u64 {
        u64::from(self.cluster_heap_offset)
            + u64::from(cluster - FIRST_CLUSTER) * u64::from(self.sectors_per_cluster)
    }

    /// Read a whole cluster into `buf` (`cluster_size` bytes).
    pub(crate) fn read_cluster(&self, cluster: u32, buf: &mut [u8]) -> Result<(), KernelError> {
        self.dev.read_sectors(self.cluster_to_lba(cluster), buf)
    }

    /// Write a whole cluster from `buf`.
    pub(crate) fn write_cluster(&self, cluster: u32, buf: &[u8]) -> Result<(), KernelError> {
        self.dev.write_sectors(self.cluster_to_lba(cluster), buf)
    }

    /// Sector and byte offset of a cluster's FAT entry.
    fn fat_entry_location(&self, cluster: u32) -> (u64, usize) {
        let byte_offset = u64::from(cluster) * 4;
        let sector = u64::from(self.fat_offset) + byte_offset / u64::from(self.bytes_per_sector);
        let within = (byte_offset % u64::from(self.bytes_per_sector)) as usize;
        (sector, within)
    }

    /// Read the FAT entry for `cluster`.
    pub(crate) fn fat_get(&self, cluster: u32) -> Result<u32, KernelError> {
        let (sector, within) = self.fat_entry_location(cluster);
        let mut buf = vec![0u8; self.bytes_per_sector as usize];
        self.dev.read_sectors(sector, &mut buf)?;
        Ok(u32::from_le_bytes(
            buf[within..within + 4].try_into().unwrap_or([0; 4]),
        ))
    }

    /// Write the FAT entry for `cluster` (read-modify-write of its
    /// sector).
    pub(crate) fn fat_set(&self, cluster: u32, value: u32) -> Result<(), KernelError> {
        let (sector, within) = self.fat_entry_location(cluster);
        let mut buf = vec![0u8; self.bytes_per_sector as usize];
        self.dev.read_sectors(sector, &mut buf)?;
        buf[within..within + 4].copy_from_slice(&value.to_le_bytes());
        self.dev.write_sectors(sector, &buf)
    }

    /// True for values that do not continue a chain.
    pub(crate) fn is_chain_end(&self, value: u32) -> bool {
        value == FAT_EOC || value < FIRST_CLUSTER
    }

    /// Highest cluster number the volume can address, bounded by both the
    /// FAT size and the cluster heap actually present on the device.
    fn cluster_limit(&self) -> u32 {
        let fat_entries =
            (u64::from(self.fat_length) * u64::from(self.bytes_per_sector) / 4).min(u32::MAX as u64)
                as u32;
        let heap_sectors = self
            .dev
            .sector_count()
            .saturating_sub(u64::from(self.cluster_heap_offset));
        let heap_clusters =
            (heap_sectors / u64::from(self.sectors_per_cluster)).min(u32::MAX as u64) as u32;
        fat_entries.min(FIRST_CLUSTER.saturating_add(heap_clusters))
    }

    /// Claim a free cluster: first-fit FAT scan, mark end-of-chain, zero
    /// the cluster data.
    pub(crate) fn alloc_cluster(&self) -> Result<u32, KernelError> {
        let limit = self.cluster_limit();
        for cluster in FIRST_CLUSTER..limit {
            if self.fat_get(cluster)? == FAT_FREE {
                self.fat_set(cluster, FAT_EOC)?;
                let zeroes = vec![0u8; self.cluster_size as usize];
                self.write_cluster(cluster, &zeroes)?;
                return Ok(cluster);
            }
        }
        Err(KernelError::OutOfMemory)
    }

    /// Append one fresh cluster after `tail` and return it.
    pub(crate) fn extend_chain(&self, tail: u32) -> Result<u32, KernelError> {
        let fresh = self.alloc_cluster()?;
        self.fat_set(tail, fresh)?;
        Ok(fresh)
    }

    /// Grow the chain starting at `*first` until it holds at least
    /// `needed` clusters, allocating the head if the chain is empty.
    /// Returns the chain's last cluster.
    pub(crate) fn ensure_chain(&self, first: &mut u32, needed: u64) -> Result<u32, KernelError> {
        if *first < FIRST_CLUSTER {
            *first = self.alloc_cluster()?;
        }
        let mut count = 1u64;
        let mut tail = *first;
        loop {
            let next = self.fat_get(tail)?;
            if self.is_chain_end(next) {
                break;
            }
            tail = next;
            count += 1;
        }
        while count < needed {
            tail = self.extend_chain(tail)?;
            count += 1;
        }
        Ok(tail)
    }

    /// Walk a chain, freeing every entry. Tolerates an already-free head.
    pub(crate) fn free_chain(&self, first: u32) -> Result<(), KernelError> {
        let mut cluster = first;
        while cluster >= FIRST_CLUSTER {
            let next = self.fat_get(cluster)?;
            self.fat_set(cluster, FAT_FREE)?;
            if self.is_chain_end(next) {
                break;
            }
            cluster = next;
        }
        Ok(())
    }
}
