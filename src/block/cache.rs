//! Write-back sector cache.
//!
//! Small, sector-aligned I/O is coalesced through a fixed-capacity table of
//! cached sectors; larger I/O bypasses the cache. On capacity, every dirty
//! entry is flushed in ascending LBA order and the whole table is dropped,
//! rather than evicting a single entry at a time — it keeps the
//! coalesced-write invariant simple and this crate doesn't need partial
//! eviction to meet it.

use super::Container;
use crate::error::Result;

pub const DEFAULT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    Clean,
    Dirty,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    lba: u64,
    data: Vec<u8>,
    state: CacheState,
}

/// Sits between a [`Container`] and its callers. Reads/writes of at most
/// half a sector, sector-aligned, are cached; anything larger bypasses the
/// cache and goes straight to the container.
#[derive(Debug)]
pub struct SectorCache<C: Container> {
    container: C,
    sector_size: u16,
    capacity: usize,
    // Keyed by LBA for O(1) average lookup; `flush` sorts by key for its
    // ascending-LBA write-back order.
    entries: std::collections::HashMap<u64, CacheEntry>,
}

impl<C: Container> SectorCache<C> {
    pub fn new(container: C, capacity: usize) -> Self {
        let sector_size = container.sector_size();
        Self {
            container,
            sector_size,
            capacity: capacity.max(1),
            entries: std::collections::HashMap::new(),
        }
    }

    pub fn sector_size(&self) -> u16 {
        self.sector_size
    }

    pub fn size(&self) -> u64 {
        self.container.size()
    }

    pub fn read_only(&self) -> bool {
        self.container.read_only()
    }

    pub fn container(&self) -> &C {
        &self.container
    }

    pub fn container_mut(&mut self) -> &mut C {
        &mut self.container
    }

    fn is_cacheable(&self, offset: u64, len: usize) -> Option<u64> {
        let sector_size = self.sector_size as u64;
        if (len as u64) <= sector_size / 2 && offset % sector_size == 0 {
            Some(offset / sector_size)
        } else {
            None
        }
    }

    fn load_sector(&mut self, lba: u64) -> Result<()> {
        if self.entries.contains_key(&lba) {
            return Ok(());
        }

        let mut sector = vec![0u8; self.sector_size as usize];
        self.container.read(lba * self.sector_size as u64, &mut sector)?;

        log::trace!("sector cache: miss on LBA {lba}, loaded clean");
        self.entries.insert(lba, CacheEntry { lba, data: sector, state: CacheState::Clean });

        if self.entries.len() > self.capacity {
            self.flush()?;
        }

        Ok(())
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if let Some(lba) = self.is_cacheable(offset, buf.len()) {
            self.load_sector(lba)?;
            let entry = &self.entries[&lba];
            let sector_offset = (offset % self.sector_size as u64) as usize;
            buf.copy_from_slice(&entry.data[sector_offset..sector_offset + buf.len()]);
            Ok(())
        } else {
            self.container.read(offset, buf)
        }
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if let Some(lba) = self.is_cacheable(offset, bytes.len()) {
            self.load_sector(lba)?;
            let entry = self.entries.get_mut(&lba).unwrap();
            let sector_offset = (offset % self.sector_size as u64) as usize;
            entry.data[sector_offset..sector_offset + bytes.len()].copy_from_slice(bytes);
            entry.state = CacheState::Dirty;
            log::trace!("sector cache: marked LBA {lba} dirty");
            Ok(())
        } else {
            self.container.write(offset, bytes)
        }
    }

    /// Writes out every dirty entry, in ascending LBA order, then drops the
    /// whole table (clean entries included — only consistency *after*
    /// `flush` is promised, not that clean entries survive it).
    pub fn flush(&mut self) -> Result<()> {
        let mut dirty: Vec<&CacheEntry> =
            self.entries.values().filter(|e| e.state == CacheState::Dirty).collect();
        dirty.sort_by_key(|e| e.lba);

        for entry in dirty {
            self.container.write(entry.lba * self.sector_size as u64, &entry.data)?;
        }

        self.container.flush()?;
        self.entries.clear();
        Ok(())
    }
}

impl<C: Container> Drop for SectorCache<C> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("sector cache: flush on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemContainer;

    #[test]
    fn coalesces_small_writes_until_flush() {
        let mut cache = SectorCache::new(MemContainer::new(4096, 512), 4);

        cache.write(0, &[1, 2, 3, 4]).unwrap();
        cache.write(4, &[5, 6]).unwrap();

        // Not yet visible on the underlying container.
        assert_eq!(cache.container().clone().into_vec()[0..6], [0, 0, 0, 0, 0, 0]);

        cache.flush().unwrap();
        assert_eq!(cache.container().clone().into_vec()[0..6], [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn bypasses_cache_for_large_aligned_io() {
        let mut cache = SectorCache::new(MemContainer::new(4096, 512), 4);
        cache.write(0, &[0xAB; 512]).unwrap();
        // A full-sector write should go straight through rather than being
        // buffered (len > sector_size / 2).
        assert_eq!(cache.container().clone().into_vec()[0..512], [0xAB; 512][..]);
    }

    #[test]
    fn capacity_flush_drops_whole_table() {
        let mut cache = SectorCache::new(MemContainer::new(4096, 512), 2);
        cache.write(0, &[1]).unwrap();
        cache.write(512, &[2]).unwrap();
        cache.write(1024, &[3]).unwrap(); // forces a flush

        let data = cache.container().clone().into_vec();
        assert_eq!(data[0], 1);
        assert_eq!(data[512], 2);
        assert_eq!(data[1024], 3);
    }
}
