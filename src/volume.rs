//! Mount composition and path-level operations: open a
//! container, walk it through the virtual-disk/partition/recognizer layers,
//! and expose `ls`/`cp`/`cat`/`rm`/`sort`/`wipe`/`fragmentation_report` over
//! the result.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::block::cache::{SectorCache, DEFAULT_CAPACITY};
use crate::block::{BlockFile, Container};
use crate::error::{Error, Result};
use crate::fat::boot_sector::FatKind;
use crate::fat::dir::{self, Attributes, DirEntry, Directory};
use crate::fat::file::FileHandle;
use crate::fat::name::UpcaseTable;
use crate::fat::table::{Cluster, FatTable, FIRST_DATA_CLUSTER};
use crate::fat::{self, FsGeometry};
use crate::progress::{self, NullProgress, Progress};
use crate::util::bitmap::BitMap;
use crate::util::RunMap;

/// Mount-time configuration: sector size and cache sizing aren't part of any
/// on-disk structure, so they're supplied by the caller rather than inferred.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub read_only: bool,
    pub cache_capacity: usize,
    /// Only consulted by [`Volume::mount_file`]. `None` probes the sector
    /// size from the boot sector itself via `block::probe_sector_size`.
    pub sector_size: Option<u16>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { read_only: false, cache_capacity: DEFAULT_CAPACITY, sector_size: None }
    }
}

#[derive(Debug, Clone)]
pub struct FragmentationReport {
    pub per_file_extents: Vec<(String, usize)>,
    pub fragmentation_ratio: f64,
}

pub struct Volume<C: Container> {
    table: FatTable<C>,
    geometry: FsGeometry,
    first_data_sector: u32,
    sectors_per_cluster: u8,
    read_only: bool,
    /// FAT12/16's root directory is a fixed region ahead of the cluster
    /// heap, not a cluster chain: `(start_sector, sector_count)`. `None` for
    /// FAT32 and exFAT, whose root is an ordinary chain.
    fixed_root: Option<(u32, u32)>,
    is_exfat: bool,
    /// exFAT's up-case table, loaded once at mount and shared by every
    /// directory read afterward so `add_entry`'s NameHash computation stays
    /// consistent across re-reads.
    upcase: Rc<UpcaseTable>,
}

/// Reads a cluster chain's full contents in one shot, for a directory
/// (regular or the exFAT bitmap/up-case special files) too small to bother
/// streaming.
fn read_cluster_chain<C: Container>(table: &mut FatTable<C>, first_data_sector: u32, sectors_per_cluster: u8, first_cluster: Cluster) -> Result<Vec<u8>> {
    let bytes_per_cluster = sectors_per_cluster as u32 * table.sector_size() as u32;
    let clusters = table.chain(first_cluster)?;
    let mut raw = vec![0u8; clusters.len() * bytes_per_cluster as usize];
    for (i, &cluster) in clusters.iter().enumerate() {
        let sector = first_data_sector as u64 + (cluster as u64 - FIRST_DATA_CLUSTER as u64) * sectors_per_cluster as u64;
        let offset = sector * table.sector_size() as u64;
        table.cache_mut().read(offset, &mut raw[i * bytes_per_cluster as usize..(i + 1) * bytes_per_cluster as usize])?;
    }
    Ok(raw)
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl<C: Container> Volume<C> {
    pub fn mount(mut container: C, options: OpenOptions) -> Result<Self> {
        let geometry = fat::recognize(&mut container)?;
        log::info!("mounting volume: {geometry:?}");

        let read_only = options.read_only || container.read_only();
        let cache = SectorCache::new(container, options.cache_capacity);

        let (kind, fat_start_byte, fat_size_bytes, num_fats, cluster_count, first_data_sector, sectors_per_cluster, fixed_root) = match &geometry {
            FsGeometry::Fat(kind, bpb) => {
                let sector_size = bpb.bytes_per_sector as u64;
                let fixed_root = if *kind == FatKind::Fat32 {
                    None
                } else {
                    let start_sector = bpb.reserved_sectors as u32 + bpb.num_fats as u32 * bpb.fat_size();
                    Some((start_sector, bpb.root_dir_sectors()))
                };
                (
                    *kind,
                    bpb.first_fat_sector() as u64 * sector_size,
                    bpb.fat_size() as u64 * sector_size,
                    bpb.num_fats,
                    bpb.cluster_count(),
                    bpb.first_data_sector(),
                    bpb.sectors_per_cluster,
                    fixed_root,
                )
            }
            FsGeometry::ExFat(boot) => {
                let sector_size = boot.bytes_per_sector() as u64;
                (
                    // exFAT's table uses plain 32-bit entries, same as FAT32's.
                    FatKind::Fat32,
                    boot.fat_offset as u64 * sector_size,
                    boot.fat_length as u64 * sector_size,
                    boot.num_fats,
                    boot.cluster_count,
                    boot.cluster_heap_offset,
                    1u8 << boot.sectors_per_cluster_shift,
                    None,
                )
            }
        };

        let is_exfat = matches!(geometry, FsGeometry::ExFat(_));
        let mut table = FatTable::new(cache, kind, fat_start_byte, fat_size_bytes, num_fats, cluster_count, is_exfat)?;

        let mut upcase = Rc::new(UpcaseTable::default());

        if is_exfat {
            let root_cluster = geometry.root_cluster();
            let root_raw = read_cluster_chain(&mut table, first_data_sector, sectors_per_cluster, root_cluster)?;

            if let Some((upcase_cluster, upcase_len)) = dir::find_exfat_special_file(&root_raw, dir::EXFAT_UPCASE_TABLE_ENTRY) {
                let raw = read_cluster_chain(&mut table, first_data_sector, sectors_per_cluster, upcase_cluster)?;
                let len = (upcase_len as usize).min(raw.len());
                upcase = Rc::new(UpcaseTable::parse(&raw[..len]));
            }

            if let Some((bitmap_cluster, _)) = dir::find_exfat_special_file(&root_raw, dir::EXFAT_BITMAP_ENTRY) {
                let raw = read_cluster_chain(&mut table, first_data_sector, sectors_per_cluster, bitmap_cluster)?;
                let bitmap = BitMap::from_bytes(raw, cluster_count as usize);
                table.install_exfat_bitmap(&bitmap);
            }
        }

        Ok(Self { table, geometry, first_data_sector, sectors_per_cluster, read_only, fixed_root, is_exfat, upcase })
    }

    pub fn is_exfat(&self) -> bool {
        self.is_exfat
    }

    fn bytes_per_cluster(&mut self) -> u32 {
        self.sectors_per_cluster as u32 * self.table.sector_size() as u32
    }

    fn cluster_byte_offset(&mut self, cluster: Cluster) -> u64 {
        let sector_size = self.table.sector_size() as u64;
        let sector = self.first_data_sector as u64 + (cluster as u64 - FIRST_DATA_CLUSTER as u64) * self.sectors_per_cluster as u64;
        sector * sector_size
    }

    fn read_directory(&mut self, first_cluster: Cluster) -> Result<Directory> {
        if first_cluster == 0 {
            if let Some((start_sector, sector_count)) = self.fixed_root {
                let sector_size = self.table.sector_size() as u64;
                let mut raw = vec![0u8; sector_count as usize * sector_size as usize];
                self.table.cache_mut().read(start_sector as u64 * sector_size, &mut raw)?;
                let len = raw.len() as u32;
                return Ok(Directory::from_raw(0, raw, len, false, Rc::clone(&self.upcase)));
            }
        }

        let bytes_per_cluster = self.bytes_per_cluster();
        let raw = read_cluster_chain(&mut self.table, self.first_data_sector, self.sectors_per_cluster, first_cluster)?;
        Ok(Directory::from_raw(first_cluster, raw, bytes_per_cluster, self.is_exfat, Rc::clone(&self.upcase)))
    }

    fn write_directory(&mut self, dir: &Directory) -> Result<()> {
        if dir.first_cluster() == 0 {
            if let Some((start_sector, _)) = self.fixed_root {
                let sector_size = self.table.sector_size() as u64;
                self.table.cache_mut().write(start_sector as u64 * sector_size, dir.raw())?;
                return Ok(());
            }
        }

        let bytes_per_cluster = dir.bytes_per_cluster();
        let clusters = self.table.chain(dir.first_cluster())?;
        for (i, &cluster) in clusters.iter().enumerate() {
            let offset = self.cluster_byte_offset(cluster);
            let slice = &dir.raw()[i * bytes_per_cluster as usize..(i + 1) * bytes_per_cluster as usize];
            self.table.cache_mut().write(offset, slice)?;
        }
        Ok(())
    }

    /// Extends a directory's cluster chain by one cluster and grows its
    /// in-memory buffer to match, for `add_entry` to retry into after a
    /// `DirFull`. The FAT12/16 root directory lives in a fixed region ahead
    /// of the cluster heap and can never grow this way.
    fn grow_directory(&mut self, dir: &mut Directory) -> Result<()> {
        if dir.first_cluster() == 0 && self.fixed_root.is_some() {
            return Err(Error::DirFull);
        }

        let tail = *self.table.chain(dir.first_cluster())?.last().unwrap();
        self.table.extend_chain(tail, 1)?;

        let bytes_per_cluster = dir.bytes_per_cluster();
        let mut raw = dir.raw().to_vec();
        raw.resize(raw.len() + bytes_per_cluster as usize, 0);
        *dir = Directory::from_raw(dir.first_cluster(), raw, bytes_per_cluster, dir.is_exfat(), dir.upcase());
        Ok(())
    }

    /// Resolves all but the last path component to a directory, returning
    /// that directory plus the final component's entry (if it exists).
    fn resolve_parent(&mut self, components: &[&str]) -> Result<(Directory, Option<DirEntry>)> {
        let mut current_cluster = self.geometry.root_cluster();
        let mut dir = self.read_directory(current_cluster)?;

        if components.is_empty() {
            return Ok((dir, None));
        }

        for component in &components[..components.len() - 1] {
            let entries = dir.entries()?;
            let found = entries
                .into_iter()
                .find(|e| e.name.eq_ignore_ascii_case(component) && e.is_dir())
                .ok_or_else(|| Error::NotFound(component.into()))?;
            current_cluster = found.first_cluster;
            dir = self.read_directory(current_cluster)?;
        }

        let last = components[components.len() - 1];
        let entries = dir.entries()?;
        let entry = entries.into_iter().find(|e| e.name.eq_ignore_ascii_case(last));
        Ok((dir, entry))
    }

    pub fn ls(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let components = split_path(path);
        let cluster = if components.is_empty() {
            self.geometry.root_cluster()
        } else {
            let (_, entry) = self.resolve_parent(&components)?;
            let entry = entry.ok_or_else(|| Error::NotFound(path.into()))?;
            if !entry.is_dir() {
                return Err(Error::BadFormat(format!("{path} is not a directory")));
            }
            entry.first_cluster
        };

        self.read_directory(cluster)?.entries()
    }

    pub fn cat(&mut self, path: &str) -> Result<Vec<u8>> {
        let components = split_path(path);
        let (_, entry) = self.resolve_parent(&components)?;
        let entry = entry.ok_or_else(|| Error::NotFound(path.into()))?;

        let mut handle = FileHandle::new(Some(entry.first_cluster).filter(|&c| c != 0), entry.file_size, true).with_no_fat_chain(entry.no_fat_chain);
        let mut buf = vec![0u8; entry.file_size as usize];
        handle.read(&mut self.table, self.first_data_sector, self.sectors_per_cluster, &mut buf)?;
        Ok(buf)
    }

    /// Writes `data` into a new file at `path` (parent directory must
    /// already exist).
    pub fn cp_into(&mut self, path: &str, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let components = split_path(path);
        if components.is_empty() {
            return Err(Error::InvalidName(path.into()));
        }
        let name = *components.last().unwrap();
        let parent_cluster = if components.len() == 1 {
            self.geometry.root_cluster()
        } else {
            let (_, entry) = self.resolve_parent(&components[..components.len() - 1])?;
            entry.ok_or_else(|| Error::NotFound(path.into()))?.first_cluster
        };

        let mut dir = self.read_directory(parent_cluster)?;
        if dir.entries()?.iter().any(|e| e.name.eq_ignore_ascii_case(name)) {
            return Err(Error::AlreadyExists(path.into()));
        }

        let mut handle = FileHandle::new(None, 0, false);
        handle.write(&mut self.table, self.first_data_sector, self.sectors_per_cluster, data)?;

        loop {
            match dir.add_entry(name, Attributes::ARCHIVE, handle.first_cluster.unwrap_or(0), handle.size, false) {
                Ok(()) => break,
                Err(Error::DirFull) => self.grow_directory(&mut dir)?,
                Err(e) => return Err(e),
            }
        }
        self.write_directory(&dir)?;
        self.table.flush()?;
        Ok(())
    }

    pub fn rm(&mut self, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let components = split_path(path);
        let parent_cluster = if components.len() <= 1 {
            self.geometry.root_cluster()
        } else {
            let (_, entry) = self.resolve_parent(&components[..components.len() - 1])?;
            entry.ok_or_else(|| Error::NotFound(path.into()))?.first_cluster
        };

        let mut dir = self.read_directory(parent_cluster)?;
        let entries = dir.entries()?;
        let name = *components.last().ok_or_else(|| Error::InvalidName(path.into()))?;
        let entry = entries.into_iter().find(|e| e.name.eq_ignore_ascii_case(name)).ok_or_else(|| Error::NotFound(path.into()))?;

        if entry.first_cluster != 0 {
            if entry.no_fat_chain {
                let bytes_per_cluster = self.bytes_per_cluster() as u64;
                let count = if entry.file_size == 0 { 1 } else { (entry.file_size as u64).div_ceil(bytes_per_cluster) as u32 };
                self.table.free_range(entry.first_cluster, count);
            } else {
                self.table.free_chain(entry.first_cluster)?;
            }
        }
        dir.remove_entry(&entry);
        self.write_directory(&dir)?;
        self.table.flush()?;
        Ok(())
    }

    /// Rewrites a directory's entries in the given order without
    /// reallocating any cluster: buffers the whole table, sorts in memory,
    /// and rewrites to the same clusters. Orphan/deleted slots are
    /// discarded rather than carried forward.
    pub fn sort(&mut self, path: &str, mut key: impl FnMut(&DirEntry, &DirEntry) -> Ordering, mut progress: impl Progress) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let components = split_path(path);
        let cluster = if components.is_empty() {
            self.geometry.root_cluster()
        } else {
            let (_, entry) = self.resolve_parent(&components)?;
            entry.ok_or_else(|| Error::NotFound(path.into()))?.first_cluster
        };

        let dir = self.read_directory(cluster)?;
        let mut entries = dir.entries()?;
        entries.sort_by(|a, b| key(a, b));

        let total = entries.len() as u64;
        let mut rebuilt = Directory::from_raw(cluster, vec![0u8; dir.raw().len()], dir.bytes_per_cluster(), self.is_exfat, Rc::clone(&self.upcase));
        for (done, entry) in entries.iter().enumerate() {
            rebuilt.add_entry(&entry.name, entry.attributes, entry.first_cluster, entry.file_size, entry.no_fat_chain)?;
            progress::check(progress.report(done as u64 + 1, total))?;
        }

        self.write_directory(&rebuilt)?;
        self.table.flush()?;
        Ok(())
    }

    /// Default sort key: case-insensitive name order (exercised by the
    /// listing-order scenario in the integration tests).
    pub fn sort_by_name(&mut self, path: &str) -> Result<()> {
        self.sort(path, |a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()), NullProgress)
    }

    /// Overwrites every free cluster's data region with zeros, honoring the
    /// free-cluster run map to skip allocated regions entirely.
    pub fn wipe(&mut self, mut progress: impl Progress) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let free_map: RunMap = self.table.free_map().clone();
        let total = free_map.total_len();
        let bytes_per_cluster = self.bytes_per_cluster();
        let zeros = vec![0u8; bytes_per_cluster as usize];

        let mut done = 0u64;
        for (start, len) in free_map.iter() {
            for offset in 0..len {
                let cluster = start + offset;
                let byte_offset = self.cluster_byte_offset(cluster);
                self.table.cache_mut().write(byte_offset, &zeros)?;

                done += 1;
                progress::check(progress.report(done, total))?;
            }
        }

        self.table.flush()?;
        Ok(())
    }

    pub fn wipe_free_space(&mut self) -> Result<()> {
        self.wipe(NullProgress)
    }

    /// Per-file extent counts and the overall fragmentation ratio (fraction
    /// of files with more than one extent), walking recursively from the
    /// root.
    pub fn fragmentation_report(&mut self) -> Result<FragmentationReport> {
        let mut per_file = Vec::new();
        let root = self.geometry.root_cluster();
        self.walk_for_fragmentation(root, String::new(), &mut per_file)?;

        let fragmented = per_file.iter().filter(|(_, extents)| *extents > 1).count();
        let ratio = if per_file.is_empty() { 0.0 } else { fragmented as f64 / per_file.len() as f64 };

        Ok(FragmentationReport { per_file_extents: per_file, fragmentation_ratio: ratio })
    }

    fn walk_for_fragmentation(&mut self, cluster: Cluster, prefix: String, out: &mut Vec<(String, usize)>) -> Result<()> {
        let entries = self.read_directory(cluster)?.entries()?;
        for entry in entries {
            let full_name = if prefix.is_empty() { entry.name.clone() } else { format!("{prefix}/{}", entry.name) };
            if entry.is_dir() {
                self.walk_for_fragmentation(entry.first_cluster, full_name, out)?;
            } else if entry.first_cluster != 0 {
                let extents = count_extents(&self.table.chain(entry.first_cluster)?);
                out.push((full_name, extents));
            } else {
                out.push((full_name, 0));
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.table.flush()
    }
}

impl Volume<BlockFile> {
    /// Opens and mounts a file/block-device path in one step, resolving
    /// `options.sector_size` (probing the boot sector if `None`) before the
    /// container itself can be constructed.
    pub fn mount_file(path: &std::path::Path, options: OpenOptions) -> Result<Self> {
        let container = BlockFile::open(path, options.read_only, options.sector_size)?;
        Self::mount(container, options)
    }
}

fn count_extents(chain: &[Cluster]) -> usize {
    if chain.is_empty() {
        return 0;
    }
    let mut extents = 1;
    for w in chain.windows(2) {
        if w[1] != w[0] + 1 {
            extents += 1;
        }
    }
    extents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemContainer;
    use crate::fat::boot_sector::BiosParameterBlock;

    fn formatted_fat32(total_clusters: u32) -> MemContainer {
        let sectors_per_cluster = 1u8;
        let bytes_per_sector = 512u16;
        let fat_size_32 = ((total_clusters + FIRST_DATA_CLUSTER) * 4).div_ceil(bytes_per_sector as u32);
        let reserved_sectors = 32u16;
        let num_fats = 1u8;
        let data_sectors = total_clusters * sectors_per_cluster as u32;
        let total_sectors = reserved_sectors as u32 + num_fats as u32 * fat_size_32 + data_sectors;

        let bpb = BiosParameterBlock {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_entry_count: 0,
            total_sectors_16: 0,
            media_descriptor: 0xF8,
            fat_size_16: 0,
            sectors_per_track: 63,
            num_heads: 255,
            hidden_sectors: 0,
            total_sectors_32: total_sectors,
            fat_size_32,
            ext_flags: 0,
            fs_version: 0,
            root_cluster: 2,
            fs_info_sector: 1,
            backup_boot_sector: 6,
            drive_number: 0x80,
            volume_id: 1,
            volume_label: *b"NO NAME    ",
            fs_type: *b"FAT32   ",
        };

        let mut container = MemContainer::new(total_sectors as u64 * bytes_per_sector as u64, bytes_per_sector);
        let mut boot = vec![0u8; bytes_per_sector as usize];
        bpb.write_to(&mut boot);
        container.write(0, &boot).unwrap();

        // Root directory occupies cluster 2, freshly allocated, so its FAT
        // entry must be marked end-of-chain before mount rebuilds the free
        // map from a full scan.
        let fat_start = reserved_sectors as u64 * bytes_per_sector as u64;
        container.write(fat_start + 2 * 4, &0x0FFF_FFFFu32.to_le_bytes()).unwrap();

        container
    }

    #[test]
    fn write_list_and_read_back_a_file() {
        let container = formatted_fat32(200);
        let mut volume = Volume::mount(container, OpenOptions::default()).unwrap();

        volume.cp_into("hello.txt", b"hello, world").unwrap();
        let entries = volume.ls("/").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hello.txt");

        let data = volume.cat("hello.txt").unwrap();
        assert_eq!(data, b"hello, world");
    }

    #[test]
    fn sort_reorders_without_moving_data() {
        let container = formatted_fat32(200);
        let mut volume = Volume::mount(container, OpenOptions::default()).unwrap();

        volume.cp_into("c.txt", b"c").unwrap();
        volume.cp_into("a.txt", b"a").unwrap();
        volume.cp_into("b.txt", b"b").unwrap();

        volume.sort_by_name("/").unwrap();

        let names: Vec<String> = volume.ls("/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
        assert_eq!(volume.cat("b.txt").unwrap(), b"b");
    }

    #[test]
    fn wipe_zeroes_free_clusters_but_not_allocated_ones() {
        let container = formatted_fat32(200);
        let mut volume = Volume::mount(container, OpenOptions::default()).unwrap();

        volume.cp_into("a.txt", b"keep me").unwrap();
        volume.wipe_free_space().unwrap();

        assert_eq!(volume.cat("a.txt").unwrap(), b"keep me");
    }

    #[test]
    fn rm_frees_the_chain() {
        let container = formatted_fat32(200);
        let mut volume = Volume::mount(container, OpenOptions::default()).unwrap();

        volume.cp_into("a.txt", &vec![1u8; 4096]).unwrap();
        let free_before = volume.table.free_cluster_count();

        volume.rm("a.txt").unwrap();
        assert_eq!(volume.table.free_cluster_count(), free_before + (4096 / 512));
        assert!(volume.ls("/").unwrap().is_empty());
    }

    #[test]
    fn cp_into_grows_the_directory_past_its_first_cluster() {
        // One 512-byte cluster holds 16 short-name slots; the 17th file
        // forces `grow_directory` to extend the root's chain.
        let container = formatted_fat32(200);
        let mut volume = Volume::mount(container, OpenOptions::default()).unwrap();
        let free_before = volume.table.free_cluster_count();

        for i in 0..20 {
            volume.cp_into(&format!("{i:02}.txt"), b"x").unwrap();
        }

        let entries = volume.ls("/").unwrap();
        assert_eq!(entries.len(), 20);
        // 20 one-cluster files plus one extra cluster for the grown root.
        assert_eq!(volume.table.free_cluster_count(), free_before - 21);
        assert_eq!(volume.cat("19.txt").unwrap(), b"x");
    }
}
