//! An open file's read/write/seek/truncate surface.
//!
//! Writes past the current end of file extend the cluster chain lazily, one
//! allocation per write call, and the directory entry's size field is only
//! updated once the write actually lands — a crash mid-write leaves the
//! file at its old, consistent length.

use crate::block::Container;
use crate::block::cache::SectorCache;
use crate::error::{Error, Result};
use crate::fat::table::{Cluster, FatTable};

#[derive(Debug)]
pub struct FileHandle {
    pub first_cluster: Option<Cluster>,
    pub size: u32,
    pos: u64,
    read_only: bool,
    /// exFAT only: the clusters from `first_cluster` onward are one
    /// contiguous run and the FAT region for them is meaningless. Cleared
    /// (and the chain materialized) the first time the file needs to grow
    /// or shrink.
    no_fat_chain: bool,
}

impl FileHandle {
    pub fn new(first_cluster: Option<Cluster>, size: u32, read_only: bool) -> Self {
        Self { first_cluster, size, pos: 0, read_only, no_fat_chain: false }
    }

    pub fn with_no_fat_chain(mut self, no_fat_chain: bool) -> Self {
        self.no_fat_chain = no_fat_chain;
        self
    }

    pub fn no_fat_chain(&self) -> bool {
        self.no_fat_chain
    }

    /// Materializes a real FAT chain over the file's current contiguous
    /// allocation and clears the NoFatChain flag. Called before any grow or
    /// shrink, since both require the FAT to hold real links.
    fn clear_no_fat_chain<C: Container>(&mut self, table: &mut FatTable<C>, sectors_per_cluster: u8) -> Result<()> {
        let Some(first) = self.first_cluster else {
            self.no_fat_chain = false;
            return Ok(());
        };

        let bytes_per_cluster = table.cache_mut().sector_size() as u64 * sectors_per_cluster as u64;
        let cluster_count = if self.size == 0 { 1 } else { (self.size as u64).div_ceil(bytes_per_cluster) as u32 };

        for i in 0..cluster_count.saturating_sub(1) {
            table.set(first + i, first + i + 1)?;
        }
        table.set(first + cluster_count - 1, crate::fat::table::END_OF_CHAIN_32)?;

        self.no_fat_chain = false;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.size as u64
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    fn cluster_at<C: Container>(&self, table: &mut FatTable<C>, bytes_per_cluster: u64, cluster_index: u64) -> Result<Option<Cluster>> {
        let Some(first) = self.first_cluster else { return Ok(None) };

        if self.no_fat_chain {
            let allocated = if self.size == 0 { 1 } else { (self.size as u64).div_ceil(bytes_per_cluster) };
            return Ok((cluster_index < allocated).then_some(first + cluster_index as u32));
        }

        let chain = table.chain(first)?;
        Ok(chain.get(cluster_index as usize).copied())
    }

    fn cluster_byte_offset<C: Container>(
        &self,
        cache: &SectorCache<C>,
        first_data_sector: u32,
        sectors_per_cluster: u8,
        cluster: Cluster,
    ) -> u64 {
        let sector = first_data_sector as u64 + (cluster as u64 - 2) * sectors_per_cluster as u64;
        sector * cache.sector_size() as u64
    }

    pub fn read<C: Container>(
        &mut self,
        table: &mut FatTable<C>,
        first_data_sector: u32,
        sectors_per_cluster: u8,
        buf: &mut [u8],
    ) -> Result<usize> {
        let bytes_per_cluster = sectors_per_cluster as u64 * table.cache_mut().sector_size() as u64;
        let available = self.size as u64 - self.pos.min(self.size as u64);
        let to_read = (buf.len() as u64).min(available) as usize;

        let mut done = 0usize;
        while done < to_read {
            let cluster_index = (self.pos + done as u64) / bytes_per_cluster;
            let in_cluster = ((self.pos + done as u64) % bytes_per_cluster) as usize;
            let span = (bytes_per_cluster as usize - in_cluster).min(to_read - done);

            match self.cluster_at(table, bytes_per_cluster, cluster_index)? {
                Some(cluster) => {
                    let base = self.cluster_byte_offset(table.cache_mut(), first_data_sector, sectors_per_cluster, cluster);
                    table.cache_mut().read(base + in_cluster as u64, &mut buf[done..done + span])?;
                }
                None => buf[done..done + span].fill(0),
            }
            done += span;
        }

        self.pos += to_read as u64;
        Ok(to_read)
    }

    pub fn write<C: Container>(
        &mut self,
        table: &mut FatTable<C>,
        first_data_sector: u32,
        sectors_per_cluster: u8,
        bytes: &[u8],
    ) -> Result<usize> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let bytes_per_cluster = sectors_per_cluster as u64 * table.cache_mut().sector_size() as u64;
        let mut done = 0usize;

        while done < bytes.len() {
            let byte_pos = self.pos + done as u64;
            let cluster_index = byte_pos / bytes_per_cluster;
            let in_cluster = (byte_pos % bytes_per_cluster) as usize;
            let span = (bytes_per_cluster as usize - in_cluster).min(bytes.len() - done);

            let cluster = match self.cluster_at(table, bytes_per_cluster, cluster_index)? {
                Some(c) => c,
                None => self.grow_to(table, sectors_per_cluster, cluster_index)?,
            };

            let base = self.cluster_byte_offset(table.cache_mut(), first_data_sector, sectors_per_cluster, cluster);
            table.cache_mut().write(base + in_cluster as u64, &bytes[done..done + span])?;
            done += span;
        }

        self.pos += bytes.len() as u64;
        self.size = self.size.max(self.pos as u32);
        Ok(bytes.len())
    }

    /// Extends the chain so that `cluster_index` exists, allocating near the
    /// current last cluster so new clusters land adjacent to existing data
    /// when possible.
    fn grow_to<C: Container>(&mut self, table: &mut FatTable<C>, sectors_per_cluster: u8, cluster_index: u64) -> Result<Cluster> {
        if self.no_fat_chain {
            self.clear_no_fat_chain(table, sectors_per_cluster)?;
        }

        let new_cluster = match self.first_cluster {
            None => {
                let first = table.allocate_chain(1, 0)?;
                self.first_cluster = Some(first);
                first
            }
            Some(first) => {
                let chain = table.chain(first)?;
                let tail = *chain.last().unwrap();
                let needed = cluster_index as u32 - (chain.len() as u32 - 1);
                table.extend_chain(tail, needed)?
            }
        };

        let chain = table.chain(self.first_cluster.unwrap())?;
        Ok(chain[cluster_index as usize])
    }

    /// Truncates to `new_len`, freeing any clusters entirely beyond it. If
    /// `new_len` does not land on a cluster boundary the retained tail
    /// cluster is left as-is. A NoFatChain file always has its chain
    /// materialized first, since shrinking needs real FAT links to detach
    /// the freed tail from.
    pub fn truncate<C: Container>(&mut self, table: &mut FatTable<C>, sectors_per_cluster: u8, new_len: u32) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if new_len >= self.size {
            self.size = new_len;
            return Ok(());
        }
        if self.no_fat_chain {
            self.clear_no_fat_chain(table, sectors_per_cluster)?;
        }

        if let Some(first) = self.first_cluster {
            let chain = table.chain(first)?;
            let bytes_per_cluster = table.cache_mut().sector_size() as u64 * sectors_per_cluster as u64;
            let keep_clusters = if new_len == 0 { 0 } else { (new_len as u64).div_ceil(bytes_per_cluster) as usize };

            if keep_clusters == 0 {
                table.free_chain(first)?;
                self.first_cluster = None;
            } else if keep_clusters < chain.len() {
                let new_tail = chain[keep_clusters - 1];
                let first_to_free = chain[keep_clusters];
                // Detach the retained tail before freeing the rest, so the
                // chain never has a dangling link into freed clusters.
                table.set(new_tail, crate::fat::table::END_OF_CHAIN_32)?;
                table.free_chain(first_to_free)?;
            }
        }

        self.size = new_len;
        self.pos = self.pos.min(new_len as u64);
        Ok(())
    }
}
