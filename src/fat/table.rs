//! The File Allocation Table itself: reading/writing individual entries and
//! walking/extending/freeing cluster chains.
//!
//! Cluster/sector math is kept as free functions, generic over FAT12/16/32
//! entry width rather than fixed at 32 bits.

use crate::block::Container;
use crate::block::cache::SectorCache;
use crate::error::{Error, Result};
use crate::fat::boot_sector::FatKind;
use crate::util::bitmap::BitMap;
use crate::util::RunMap;

pub type Cluster = u32;

pub const FREE_CLUSTER: Cluster = 0;
pub const BAD_CLUSTER_32: Cluster = 0x0FFF_FFF7;
pub const END_OF_CHAIN_32: Cluster = 0x0FFF_FFFF;

pub const FIRST_DATA_CLUSTER: Cluster = 2;

fn is_end_of_chain(kind: FatKind, value: Cluster) -> bool {
    match kind {
        FatKind::Fat12 => value >= 0x0FF8,
        FatKind::Fat16 => value >= 0xFFF8,
        FatKind::Fat32 => value >= 0x0FFF_FFF8,
    }
}

fn is_bad_cluster(kind: FatKind, value: Cluster) -> bool {
    match kind {
        FatKind::Fat12 => value == 0x0FF7,
        FatKind::Fat16 => value == 0xFFF7,
        FatKind::Fat32 => value == 0x0FFF_FFF7,
    }
}

/// Maps a cluster index to the byte offset of its entry within the first
/// FAT, and how many bytes that entry spans (packed for FAT12, 2 bytes for
/// FAT16, 4 bytes for FAT32/exFAT).
pub fn cluster_entry_offset(kind: FatKind, cluster: Cluster) -> u64 {
    match kind {
        FatKind::Fat12 => (cluster as u64) + (cluster as u64 / 2),
        FatKind::Fat16 => cluster as u64 * 2,
        FatKind::Fat32 => cluster as u64 * 4,
    }
}

pub fn cluster_to_sector(fat_starting_sector: u32, fat_size_sectors: u32, sectors_per_cluster: u8, first_data_cluster_sector: u32, cluster: Cluster) -> u64 {
    let _ = (fat_starting_sector, fat_size_sectors);
    first_data_cluster_sector as u64 + (cluster as u64 - FIRST_DATA_CLUSTER as u64) * sectors_per_cluster as u64
}

/// A FAT12/16/32 allocation table, backed by a [`SectorCache`]. Owns the
/// in-memory free-cluster run map that every allocation/free call updates;
/// this map is rebuilt from a full table scan at mount time rather than
/// trusted from FSInfo (see the FSInfo handling in `boot_sector.rs`).
pub struct FatTable<C: Container> {
    cache: SectorCache<C>,
    kind: FatKind,
    fat_start_byte: u64,
    fat_size_bytes: u64,
    num_fats: u8,
    cluster_count: u32,
    free_map: RunMap,
    /// exFAT never uses the FAT itself to determine free space (its FAT
    /// region is meaningless for NoFatChain files); its free map instead
    /// comes from the on-disk allocation bitmap via `install_exfat_bitmap`.
    is_exfat: bool,
}

impl<C: Container> FatTable<C> {
    pub fn new(
        cache: SectorCache<C>,
        kind: FatKind,
        fat_start_byte: u64,
        fat_size_bytes: u64,
        num_fats: u8,
        cluster_count: u32,
        is_exfat: bool,
    ) -> Result<Self> {
        let mut table = Self { cache, kind, fat_start_byte, fat_size_bytes, num_fats, cluster_count, free_map: RunMap::new(), is_exfat };
        if !is_exfat {
            table.rebuild_free_map()?;
        }
        Ok(table)
    }

    /// Rebuilds the free-cluster map from an exFAT allocation bitmap (entry
    /// type 0x81) instead of scanning the FAT, since a NoFatChain file's FAT
    /// entries may hold garbage.
    pub fn install_exfat_bitmap(&mut self, bitmap: &BitMap) {
        self.free_map = RunMap::new();
        let mut run_start: Option<u32> = None;

        for bit in 0..bitmap.length() {
            let cluster = FIRST_DATA_CLUSTER + bit as u32;
            let free = bitmap.get(bit) == Ok(false);
            match (free, run_start) {
                (true, None) => run_start = Some(cluster),
                (false, Some(start)) => {
                    self.free_map.insert(start, cluster - start);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            self.free_map.insert(start, FIRST_DATA_CLUSTER + bitmap.length() as u32 - start);
        }
    }

    fn rebuild_free_map(&mut self) -> Result<()> {
        self.free_map = RunMap::new();
        let mut run_start: Option<u32> = None;

        for cluster in FIRST_DATA_CLUSTER..FIRST_DATA_CLUSTER + self.cluster_count {
            let free = self.get(cluster)? == FREE_CLUSTER;
            match (free, run_start) {
                (true, None) => run_start = Some(cluster),
                (false, Some(start)) => {
                    self.free_map.insert(start, cluster - start);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            self.free_map.insert(start, FIRST_DATA_CLUSTER + self.cluster_count - start);
        }

        Ok(())
    }

    pub fn free_cluster_count(&self) -> u64 {
        self.free_map.total_len()
    }

    pub fn free_map(&self) -> &RunMap {
        &self.free_map
    }

    pub fn sector_size(&self) -> u16 {
        self.cache.sector_size()
    }

    /// Reads a raw entry value from the first FAT copy.
    pub fn get(&mut self, cluster: Cluster) -> Result<Cluster> {
        let offset = self.fat_start_byte + cluster_entry_offset(self.kind, cluster);

        match self.kind {
            FatKind::Fat12 => {
                let mut buf = [0u8; 2];
                self.cache.read(offset & !1, &mut buf)?;
                let packed = u16::from_le_bytes(buf);
                let value = if cluster & 1 == 0 { packed & 0x0FFF } else { packed >> 4 };
                Ok(value as u32)
            }
            FatKind::Fat16 => {
                let mut buf = [0u8; 2];
                self.cache.read(offset, &mut buf)?;
                Ok(u16::from_le_bytes(buf) as u32)
            }
            FatKind::Fat32 => {
                let mut buf = [0u8; 4];
                self.cache.read(offset, &mut buf)?;
                Ok(u32::from_le_bytes(buf) & 0x0FFF_FFFF)
            }
        }
    }

    /// Writes an entry to every FAT copy (mirroring).
    pub fn set(&mut self, cluster: Cluster, value: Cluster) -> Result<()> {
        for fat_index in 0..self.num_fats as u64 {
            let base = self.fat_start_byte + fat_index * self.fat_size_bytes;
            let offset = base + cluster_entry_offset(self.kind, cluster);

            match self.kind {
                FatKind::Fat12 => {
                    let aligned = offset & !1;
                    let mut buf = [0u8; 2];
                    self.cache.read(aligned, &mut buf)?;
                    let mut packed = u16::from_le_bytes(buf);
                    if cluster & 1 == 0 {
                        packed = (packed & 0xF000) | (value as u16 & 0x0FFF);
                    } else {
                        packed = (packed & 0x000F) | ((value as u16 & 0x0FFF) << 4);
                    }
                    self.cache.write(aligned, &packed.to_le_bytes())?;
                }
                FatKind::Fat16 => {
                    self.cache.write(offset, &(value as u16).to_le_bytes())?;
                }
                FatKind::Fat32 => {
                    let mut buf = [0u8; 4];
                    self.cache.read(offset, &mut buf)?;
                    let preserved_top = u32::from_le_bytes(buf) & 0xF000_0000;
                    self.cache.write(offset, &((value & 0x0FFF_FFFF) | preserved_top).to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    pub fn is_end_of_chain(&self, value: Cluster) -> bool {
        is_end_of_chain(self.kind, value)
    }

    pub fn is_bad(&self, value: Cluster) -> bool {
        is_bad_cluster(self.kind, value)
    }

    fn end_of_chain_marker(&self) -> Cluster {
        match self.kind {
            FatKind::Fat12 => 0x0FFF,
            FatKind::Fat16 => 0xFFFF,
            FatKind::Fat32 => END_OF_CHAIN_32,
        }
    }

    /// Walks a cluster chain starting at `start`, returning clusters in
    /// order.
    pub fn chain(&mut self, start: Cluster) -> Result<Vec<Cluster>> {
        let mut clusters = Vec::new();
        let mut current = start;
        let mut visited = std::collections::HashSet::new();

        while !self.is_end_of_chain(current) {
            if self.is_bad(current) || !visited.insert(current) {
                return Err(Error::InconsistentFs(format!("corrupt cluster chain at {current}")));
            }
            clusters.push(current);
            current = self.get(current)?;
        }

        Ok(clusters)
    }

    /// Allocates a run of `count` contiguous clusters using the best-fit
    /// policy, preferring runs at or after `near`, links them into a chain,
    /// and returns the first cluster.
    pub fn allocate_chain(&mut self, count: u32, near: Cluster) -> Result<Cluster> {
        if count == 0 {
            return Err(Error::NoSpace { requested: 0, available: self.free_map.total_len() as u32 });
        }

        let mut remaining = count;
        let mut first_cluster = None;
        let mut prev_cluster: Option<Cluster> = None;

        while remaining > 0 {
            let (start, available) = self
                .free_map
                .best_fit(remaining, near)
                .ok_or(Error::NoSpace { requested: remaining, available: self.free_map.total_len() as u32 })?;

            let take = available.min(remaining);
            self.free_map.remove(start, take);

            for offset in 0..take {
                let cluster = start + offset;
                if let Some(prev) = prev_cluster {
                    self.set(prev, cluster)?;
                }
                prev_cluster = Some(cluster);
                first_cluster.get_or_insert(cluster);
            }

            remaining -= take;
        }

        if let Some(last) = prev_cluster {
            let marker = self.end_of_chain_marker();
            self.set(last, marker)?;
        }

        Ok(first_cluster.unwrap())
    }

    /// Extends an existing chain by `count` more clusters, returning the
    /// first newly allocated cluster.
    pub fn extend_chain(&mut self, tail: Cluster, count: u32) -> Result<Cluster> {
        let new_first = self.allocate_chain(count, tail)?;
        self.set(tail, new_first)?;
        Ok(new_first)
    }

    /// Frees every cluster in a chain starting at `start`.
    pub fn free_chain(&mut self, start: Cluster) -> Result<()> {
        let clusters = self.chain(start)?;
        for &cluster in &clusters {
            self.set(cluster, FREE_CLUSTER)?;
            self.free_map.insert(cluster, 1);
        }
        Ok(())
    }

    /// Frees a contiguous run of `count` clusters directly, without walking
    /// the FAT: the only correct way to free an exFAT NoFatChain file, whose
    /// FAT entries never held real links in the first place.
    pub fn free_range(&mut self, start: Cluster, count: u32) {
        self.free_map.insert(start, count);
    }

    pub fn cache_mut(&mut self) -> &mut SectorCache<C> {
        &mut self.cache
    }

    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemContainer;

    fn new_fat32_table(cluster_count: u32) -> FatTable<MemContainer> {
        let fat_size_bytes = (cluster_count as u64 + FIRST_DATA_CLUSTER as u64) * 4;
        let container = MemContainer::new(fat_size_bytes * 2 + 4096, 512);
        let cache = SectorCache::new(container, 16);
        FatTable::new(cache, FatKind::Fat32, 0, fat_size_bytes, 1, cluster_count, false).unwrap()
    }

    #[test]
    fn allocates_and_chains_clusters() {
        let mut table = new_fat32_table(100);
        let first = table.allocate_chain(5, 0).unwrap();
        let chain = table.chain(first).unwrap();
        assert_eq!(chain.len(), 5);

        // Clusters in the chain should be contiguous, since a brand-new table
        // has one big free run.
        for w in chain.windows(2) {
            assert_eq!(w[1], w[0] + 1);
        }
    }

    #[test]
    fn free_chain_returns_clusters_to_the_map() {
        let mut table = new_fat32_table(100);
        let before = table.free_cluster_count();
        let first = table.allocate_chain(10, 0).unwrap();
        assert_eq!(table.free_cluster_count(), before - 10);

        table.free_chain(first).unwrap();
        assert_eq!(table.free_cluster_count(), before);
    }

    #[test]
    fn extend_chain_links_tail() {
        let mut table = new_fat32_table(100);
        let first = table.allocate_chain(3, 0).unwrap();
        let chain = table.chain(first).unwrap();
        let tail = *chain.last().unwrap();

        table.extend_chain(tail, 2).unwrap();
        let extended = table.chain(first).unwrap();
        assert_eq!(extended.len(), 5);
    }

    #[test]
    fn exfat_table_takes_its_free_map_from_the_bitmap() {
        let fat_size_bytes = (100u64 + FIRST_DATA_CLUSTER as u64) * 4;
        let container = MemContainer::new(fat_size_bytes * 2 + 4096, 512);
        let cache = SectorCache::new(container, 16);
        // Every FAT entry is 0 (which would read as "all free" if scanned),
        // but the bitmap marks the first 10 clusters allocated.
        let mut table = FatTable::new(cache, FatKind::Fat32, 0, fat_size_bytes, 1, 100, true).unwrap();
        assert_eq!(table.free_cluster_count(), 0);

        let mut bitmap = crate::util::bitmap::BitMap::new(100);
        for bit in 0..10 {
            bitmap.set(bit, true).unwrap();
        }
        table.install_exfat_bitmap(&bitmap);

        assert_eq!(table.free_cluster_count(), 90);
    }
}
