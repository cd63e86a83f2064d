//! Directory tables: short-name (8.3) entries with optional preceding VFAT
//! LFN entries, or exFAT's File/StreamExtension/FileName triad.
//!
//! Entries can span multiple clusters (a directory grows like any other
//! cluster chain) and long names are supported.

use crate::error::{Error, Result};
use crate::fat::name::{self, UpcaseTable};
use crate::fat::table::Cluster;
use bitflags::bitflags;
use std::rc::Rc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
    }
}

const ENTRY_SIZE: usize = 32;
const ATTR_LONG_NAME: u8 = 0x0F;
const DELETED_MARK: u8 = 0xE5;
const END_MARK: u8 = 0x00;

const EXFAT_FILE: u8 = 0x85;
const EXFAT_STREAM_EXT: u8 = 0xC0;
const EXFAT_FILE_NAME: u8 = 0xC1;
const EXFAT_IN_USE: u8 = 0x80;

pub const EXFAT_BITMAP_ENTRY: u8 = 0x81;
pub const EXFAT_UPCASE_TABLE_ENTRY: u8 = 0x82;

/// Finds the first entry of type `entry_type` (the exFAT allocation-bitmap
/// or up-case-table entries, which sit directly in the root directory rather
/// than behind a File entry) and returns its `(first_cluster, data_length)`.
pub fn find_exfat_special_file(raw: &[u8], entry_type: u8) -> Option<(u32, u64)> {
    let mut index = 0usize;
    while (index + 1) * ENTRY_SIZE <= raw.len() {
        let base = index * ENTRY_SIZE;
        if raw[base] == entry_type {
            let first_cluster = u32::from_le_bytes(raw[base + 20..base + 24].try_into().unwrap());
            let data_length = u64::from_le_bytes(raw[base + 24..base + 32].try_into().unwrap());
            return Some((first_cluster, data_length));
        }
        if raw[base] == END_MARK {
            break;
        }
        index += 1;
    }
    None
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attributes: Attributes,
    pub first_cluster: Cluster,
    pub file_size: u32,
    pub short_name: [u8; 8],
    pub short_ext: [u8; 3],
    /// Offset, in entries, of the short-name (or exFAT File) entry within
    /// its directory cluster chain. Used to locate the entry again for
    /// in-place update/removal.
    pub entry_index: u32,
    /// How many consecutive 32-byte slots this entry occupies on disk
    /// (1 + LFN fragment count, or 2 + exFAT FileName entry count).
    pub slot_count: u32,
    /// exFAT only: the StreamExtension's NoFatChain bit was set, meaning the
    /// file occupies one contiguous cluster run and its FAT region may hold
    /// arbitrary bytes. Always `false` for FAT entries.
    pub no_fat_chain: bool,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }
}

fn parse_short_entry(raw: &[u8]) -> (Attributes, Cluster, u32, [u8; 8], [u8; 3]) {
    let attributes = Attributes::from_bits_truncate(raw[11]);
    let cluster_hi = u16::from_le_bytes(raw[20..22].try_into().unwrap()) as u32;
    let cluster_lo = u16::from_le_bytes(raw[26..28].try_into().unwrap()) as u32;
    let cluster = (cluster_hi << 16) | cluster_lo;
    let size = u32::from_le_bytes(raw[28..32].try_into().unwrap());
    let short_name: [u8; 8] = raw[0..8].try_into().unwrap();
    let short_ext: [u8; 3] = raw[8..11].try_into().unwrap();
    (attributes, cluster, size, short_name, short_ext)
}

fn short_name_display(short_name: &[u8; 8], short_ext: &[u8; 3]) -> String {
    let trim = |s: &[u8]| String::from_utf8_lossy(s).trim_end().to_string();
    let stem = trim(short_name);
    let ext = trim(short_ext);
    if ext.is_empty() { stem } else { format!("{stem}.{ext}") }
}

fn write_short_entry(raw: &mut [u8], name: &[u8; 8], ext: &[u8; 3], attributes: Attributes, cluster: Cluster, size: u32) {
    raw[0..8].copy_from_slice(name);
    raw[8..11].copy_from_slice(ext);
    raw[11] = attributes.bits();
    raw[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    raw[26..28].copy_from_slice(&((cluster & 0xFFFF) as u16).to_le_bytes());
    raw[28..32].copy_from_slice(&size.to_le_bytes());
}

fn write_lfn_entry(raw: &mut [u8], fragment: &[u16; 13], sequence: u8, checksum: u8) {
    raw[0] = sequence;
    raw[11] = ATTR_LONG_NAME;
    raw[13] = checksum;
    for (i, &unit) in fragment[0..5].iter().enumerate() {
        raw[1 + i * 2..3 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    for (i, &unit) in fragment[5..11].iter().enumerate() {
        raw[14 + i * 2..16 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    for (i, &unit) in fragment[11..13].iter().enumerate() {
        raw[28 + i * 2..30 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
}

fn read_lfn_fragment(raw: &[u8]) -> [u16; 13] {
    let mut frag = [0u16; 13];
    for i in 0..5 {
        frag[i] = u16::from_le_bytes(raw[1 + i * 2..3 + i * 2].try_into().unwrap());
    }
    for i in 0..6 {
        frag[5 + i] = u16::from_le_bytes(raw[14 + i * 2..16 + i * 2].try_into().unwrap());
    }
    for i in 0..2 {
        frag[11 + i] = u16::from_le_bytes(raw[28 + i * 2..30 + i * 2].try_into().unwrap());
    }
    frag
}

/// A directory's entries, loaded from its full cluster chain. Directories
/// fit comfortably in memory (a FAT directory is at most 64k entries) so the
/// whole table is parsed up front rather than streamed.
pub struct Directory {
    first_cluster: Cluster,
    raw: Vec<u8>,
    bytes_per_cluster: u32,
    is_exfat: bool,
    upcase: Rc<UpcaseTable>,
}

impl Directory {
    pub fn from_raw(first_cluster: Cluster, raw: Vec<u8>, bytes_per_cluster: u32, is_exfat: bool, upcase: Rc<UpcaseTable>) -> Self {
        Self { first_cluster, raw, bytes_per_cluster, is_exfat, upcase }
    }

    pub fn first_cluster(&self) -> Cluster {
        self.first_cluster
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.raw
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_cluster
    }

    pub fn is_exfat(&self) -> bool {
        self.is_exfat
    }

    pub fn upcase(&self) -> Rc<UpcaseTable> {
        Rc::clone(&self.upcase)
    }

    /// Parses every live entry, reassembling LFN fragments (or exFAT
    /// FileName entries) into full names and skipping deleted slots.
    pub fn entries(&self) -> Result<Vec<DirEntry>> {
        if self.is_exfat {
            return self.exfat_entries();
        }

        let mut out = Vec::new();
        let mut pending_lfn: Vec<(u8, [u16; 13])> = Vec::new();
        let mut index = 0u32;

        while (index as usize + 1) * ENTRY_SIZE <= self.raw.len() {
            let base = index as usize * ENTRY_SIZE;
            let raw = &self.raw[base..base + ENTRY_SIZE];
            let first_byte = raw[0];

            if first_byte == END_MARK {
                break;
            }
            if first_byte == DELETED_MARK {
                pending_lfn.clear();
                index += 1;
                continue;
            }

            if raw[11] == ATTR_LONG_NAME {
                let sequence = first_byte & 0x1F;
                pending_lfn.push((sequence, read_lfn_fragment(raw)));
                index += 1;
                continue;
            }

            let (attributes, cluster, size, short_name, short_ext) = parse_short_entry(raw);
            let slot_count = pending_lfn.len() as u32 + 1;
            let start_index = index - pending_lfn.len() as u32;

            let name = if pending_lfn.is_empty() {
                short_name_display(&short_name, &short_ext)
            } else {
                pending_lfn.sort_by_key(|(seq, _)| *seq & 0x1F);
                let mut units = Vec::new();
                for (_, frag) in &pending_lfn {
                    for &u in frag {
                        if u == 0x0000 || u == 0xFFFF {
                            break;
                        }
                        units.push(u);
                    }
                }
                String::from_utf16_lossy(&units)
            };
            pending_lfn.clear();

            if !attributes.contains(Attributes::VOLUME_ID) {
                out.push(DirEntry {
                    name,
                    attributes,
                    first_cluster: cluster,
                    file_size: size,
                    short_name,
                    short_ext,
                    entry_index: start_index,
                    slot_count,
                    no_fat_chain: false,
                });
            }

            index += 1;
        }

        Ok(out)
    }

    /// exFAT directory parsing: walks File(0x85)/StreamExtension(0xC0)/
    /// FileName(0xC1) entry sets. Entries whose in-use bit (0x80) is clear
    /// are free slots (covers both a deleted entry and the 0x00 end
    /// marker); bitmap/up-case-table entries (0x81/0x82) have no preceding
    /// File entry and are skipped here.
    fn exfat_entries(&self) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        let total_slots = (self.raw.len() / ENTRY_SIZE) as u32;
        let mut index = 0u32;

        while index < total_slots {
            let base = index as usize * ENTRY_SIZE;
            let entry_type = self.raw[base];

            if entry_type == END_MARK {
                break;
            }
            if entry_type != EXFAT_FILE {
                index += 1;
                continue;
            }

            let start_index = index;
            let secondary_count = self.raw[base + 1] as u32;
            let file_attrs = u16::from_le_bytes(self.raw[base + 4..base + 6].try_into().unwrap());

            if secondary_count == 0 || index + secondary_count >= total_slots {
                index += 1;
                continue;
            }

            let stream_base = (index + 1) as usize * ENTRY_SIZE;
            if self.raw[stream_base] != EXFAT_STREAM_EXT {
                index += 1;
                continue;
            }
            let stream_flags = self.raw[stream_base + 1];
            let name_length = self.raw[stream_base + 3];
            let first_cluster = u32::from_le_bytes(self.raw[stream_base + 20..stream_base + 24].try_into().unwrap());
            let data_length = u64::from_le_bytes(self.raw[stream_base + 24..stream_base + 32].try_into().unwrap());

            let name_entry_count = (name_length as u32).div_ceil(15).max(1);
            let mut units = Vec::with_capacity(name_length as usize);
            for fragment in 0..name_entry_count {
                let name_base = (index + 2 + fragment) as usize * ENTRY_SIZE;
                if name_base + ENTRY_SIZE > self.raw.len() || self.raw[name_base] != EXFAT_FILE_NAME {
                    break;
                }
                for chunk in self.raw[name_base + 2..name_base + 32].chunks_exact(2) {
                    if units.len() >= name_length as usize {
                        break;
                    }
                    units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
                }
            }

            out.push(DirEntry {
                name: String::from_utf16_lossy(&units),
                attributes: Attributes::from_bits_truncate(file_attrs as u8),
                first_cluster,
                file_size: data_length as u32,
                short_name: [0u8; 8],
                short_ext: [0u8; 3],
                entry_index: start_index,
                slot_count: secondary_count + 1,
                no_fat_chain: stream_flags & 0x02 != 0,
            });

            index += secondary_count + 1;
        }

        Ok(out)
    }

    fn exfat_find_free_run(&self, count: u32) -> Option<u32> {
        let total_slots = (self.raw.len() / ENTRY_SIZE) as u32;
        let mut run_start = None;
        let mut run_len = 0u32;

        for index in 0..total_slots {
            let base = index as usize * ENTRY_SIZE;
            let free = self.raw[base] & EXFAT_IN_USE == 0;
            if free {
                if run_start.is_none() {
                    run_start = Some(index);
                }
                run_len += 1;
                if run_len >= count {
                    return run_start;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    fn exfat_add_entry(&mut self, long_name: &str, attributes: Attributes, first_cluster: Cluster, size: u32, no_fat_chain: bool) -> Result<()> {
        let units: Vec<u16> = long_name.encode_utf16().collect();
        if units.is_empty() || units.len() > 255 {
            return Err(Error::InvalidName(long_name.to_string()));
        }
        let name_length = units.len() as u8;
        let name_entry_count = (units.len() as u32).div_ceil(15).max(1);
        let slot_count = 2 + name_entry_count;

        let start = self.exfat_find_free_run(slot_count).ok_or(Error::DirFull)?;

        let file_base = start as usize * ENTRY_SIZE;
        self.raw[file_base..file_base + ENTRY_SIZE].fill(0);
        self.raw[file_base] = EXFAT_FILE;
        self.raw[file_base + 1] = (1 + name_entry_count) as u8;
        self.raw[file_base + 4..file_base + 6].copy_from_slice(&(attributes.bits() as u16).to_le_bytes());

        let stream_base = (start + 1) as usize * ENTRY_SIZE;
        self.raw[stream_base..stream_base + ENTRY_SIZE].fill(0);
        self.raw[stream_base] = EXFAT_STREAM_EXT;
        self.raw[stream_base + 1] = 0x01 | if no_fat_chain { 0x02 } else { 0 }; // AllocationPossible, optionally NoFatChain.
        self.raw[stream_base + 3] = name_length;
        self.raw[stream_base + 4..stream_base + 6].copy_from_slice(&name::exfat_name_hash(long_name, &self.upcase).to_le_bytes());
        self.raw[stream_base + 8..stream_base + 16].copy_from_slice(&(size as u64).to_le_bytes());
        self.raw[stream_base + 20..stream_base + 24].copy_from_slice(&first_cluster.to_le_bytes());
        self.raw[stream_base + 24..stream_base + 32].copy_from_slice(&(size as u64).to_le_bytes());

        for fragment in 0..name_entry_count {
            let name_base = (start + 2 + fragment) as usize * ENTRY_SIZE;
            self.raw[name_base..name_base + ENTRY_SIZE].fill(0);
            self.raw[name_base] = EXFAT_FILE_NAME;
            let chunk_start = fragment as usize * 15;
            let chunk_end = (chunk_start + 15).min(units.len());
            for (i, &unit) in units[chunk_start..chunk_end].iter().enumerate() {
                self.raw[name_base + 2 + i * 2..name_base + 4 + i * 2].copy_from_slice(&unit.to_le_bytes());
            }
        }

        let set_end = (start + slot_count) as usize * ENTRY_SIZE;
        let checksum = name::exfat_set_checksum(&self.raw[file_base..set_end]);
        self.raw[file_base + 2..file_base + 4].copy_from_slice(&checksum.to_le_bytes());

        Ok(())
    }

    fn exfat_remove_entry(&mut self, entry: &DirEntry) {
        for i in 0..entry.slot_count {
            let base = (entry.entry_index + i) as usize * ENTRY_SIZE;
            self.raw[base] &= !EXFAT_IN_USE;
        }
    }

    fn exfat_update_entry(&mut self, entry: &DirEntry, first_cluster: Cluster, size: u32) {
        let stream_base = (entry.entry_index + 1) as usize * ENTRY_SIZE;
        self.raw[stream_base + 8..stream_base + 16].copy_from_slice(&(size as u64).to_le_bytes());
        self.raw[stream_base + 20..stream_base + 24].copy_from_slice(&first_cluster.to_le_bytes());
        self.raw[stream_base + 24..stream_base + 32].copy_from_slice(&(size as u64).to_le_bytes());
        // Writing through an existing entry always materializes a real FAT
        // chain, so NoFatChain never needs to be (re-)set here.
        self.raw[stream_base + 1] &= !0x02;

        let file_base = entry.entry_index as usize * ENTRY_SIZE;
        let set_end = (entry.entry_index + entry.slot_count) as usize * ENTRY_SIZE;
        let checksum = name::exfat_set_checksum(&self.raw[file_base..set_end]);
        self.raw[file_base + 2..file_base + 4].copy_from_slice(&checksum.to_le_bytes());
    }

    fn existing_short_names(&self) -> Result<std::collections::HashSet<([u8; 8], [u8; 3])>> {
        Ok(self.entries()?.into_iter().map(|e| (e.short_name, e.short_ext)).collect())
    }

    /// Finds a contiguous run of `count` free (deleted or end-marker) slots,
    /// or `None` if the directory needs to grow.
    fn find_free_run(&self, count: u32) -> Option<u32> {
        let total_slots = (self.raw.len() / ENTRY_SIZE) as u32;
        let mut run_start = None;
        let mut run_len = 0u32;

        for index in 0..total_slots {
            let base = index as usize * ENTRY_SIZE;
            let marker = self.raw[base];
            if marker == DELETED_MARK || marker == END_MARK {
                if run_start.is_none() {
                    run_start = Some(index);
                }
                run_len += 1;
                if run_len >= count {
                    return run_start;
                }
                if marker == END_MARK {
                    // An end marker terminates the live region; everything
                    // after it (if the directory was ever larger) is free
                    // too, so keep extending the run.
                    continue;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    /// Appends an entry (short name plus LFN fragments if `name` needs one),
    /// returning `Err(Error::DirFull)` if no run of free slots exists and the
    /// caller should grow the directory by a cluster first.
    pub fn add_entry(&mut self, long_name: &str, attributes: Attributes, first_cluster: Cluster, size: u32, no_fat_chain: bool) -> Result<()> {
        if self.is_exfat {
            return self.exfat_add_entry(long_name, attributes, first_cluster, size, no_fat_chain);
        }

        let existing = self.existing_short_names()?;
        let (short_name, short_ext) = name::derive_short_name(long_name, |n, e| existing.contains(&(*n, *e)))
            .ok_or_else(|| Error::InvalidName(long_name.to_string()))?;

        let needs_lfn = short_name_display(&short_name, &short_ext) != long_name;
        let fragments = if needs_lfn { name::lfn_fragments(long_name) } else { Vec::new() };
        let slot_count = fragments.len() as u32 + 1;

        let start = self.find_free_run(slot_count).ok_or(Error::DirFull)?;

        let checksum = name::lfn_checksum(&short_name, &short_ext);
        for (i, fragment) in fragments.iter().enumerate() {
            let base = (start + i as u32) as usize * ENTRY_SIZE;
            let mut sequence = fragments.len() as u8 - i as u8;
            if i == 0 {
                sequence |= 0x40;
            }
            write_lfn_entry(&mut self.raw[base..base + ENTRY_SIZE], fragment, sequence, checksum);
        }

        let short_base = (start + fragments.len() as u32) as usize * ENTRY_SIZE;
        write_short_entry(&mut self.raw[short_base..short_base + ENTRY_SIZE], &short_name, &short_ext, attributes, first_cluster, size);

        Ok(())
    }

    /// Marks an entry (and its LFN fragments) as deleted.
    pub fn remove_entry(&mut self, entry: &DirEntry) {
        if self.is_exfat {
            self.exfat_remove_entry(entry);
            return;
        }

        for i in 0..entry.slot_count {
            let base = (entry.entry_index + i) as usize * ENTRY_SIZE;
            self.raw[base] = DELETED_MARK;
        }
    }

    /// Rewrites an existing short entry's cluster/size fields in place
    /// (used after a write extends a file).
    pub fn update_entry(&mut self, entry: &DirEntry, first_cluster: Cluster, size: u32) {
        if self.is_exfat {
            self.exfat_update_entry(entry, first_cluster, size);
            return;
        }

        let short_base = (entry.entry_index + entry.slot_count - 1) as usize * ENTRY_SIZE;
        write_short_entry(&mut self.raw[short_base..short_base + ENTRY_SIZE], &entry.short_name, &entry.short_ext, entry.attributes, first_cluster, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_dir(clusters: u32, bytes_per_cluster: u32) -> Directory {
        Directory::from_raw(2, vec![0u8; (clusters * bytes_per_cluster) as usize], bytes_per_cluster, false, Rc::new(UpcaseTable::default()))
    }

    fn empty_exfat_dir(clusters: u32, bytes_per_cluster: u32) -> Directory {
        Directory::from_raw(2, vec![0u8; (clusters * bytes_per_cluster) as usize], bytes_per_cluster, true, Rc::new(UpcaseTable::default()))
    }

    #[test]
    fn add_and_list_short_name_entry() {
        let mut dir = empty_dir(1, 4096);
        dir.add_entry("README.TXT", Attributes::ARCHIVE, 10, 1234, false).unwrap();

        let entries = dir.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "README.TXT");
        assert_eq!(entries[0].first_cluster, 10);
        assert_eq!(entries[0].file_size, 1234);
    }

    #[test]
    fn add_long_name_uses_lfn_entries() {
        let mut dir = empty_dir(1, 4096);
        dir.add_entry("a long filename.txt", Attributes::ARCHIVE, 5, 0, false).unwrap();

        let entries = dir.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a long filename.txt");
        assert!(entries[0].slot_count > 1);
    }

    #[test]
    fn remove_then_reuse_slot() {
        let mut dir = empty_dir(1, 4096);
        dir.add_entry("ONE.TXT", Attributes::ARCHIVE, 1, 0, false).unwrap();
        let entry = dir.entries().unwrap().remove(0);
        dir.remove_entry(&entry);
        assert!(dir.entries().unwrap().is_empty());

        dir.add_entry("TWO.TXT", Attributes::ARCHIVE, 2, 0, false).unwrap();
        assert_eq!(dir.entries().unwrap()[0].name, "TWO.TXT");
    }

    #[test]
    fn exfat_add_list_and_remove_round_trip() {
        let mut dir = empty_exfat_dir(1, 4096);
        dir.add_entry("readme.txt", Attributes::ARCHIVE, 7, 42, false).unwrap();

        let entries = dir.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "readme.txt");
        assert_eq!(entries[0].first_cluster, 7);
        assert_eq!(entries[0].file_size, 42);
        assert!(!entries[0].no_fat_chain);

        let entry = entries.into_iter().next().unwrap();
        dir.update_entry(&entry, 7, 100);
        let updated = dir.entries().unwrap();
        assert_eq!(updated[0].file_size, 100);

        dir.remove_entry(&updated[0]);
        assert!(dir.entries().unwrap().is_empty());

        dir.add_entry("second.txt", Attributes::ARCHIVE, 9, 1, false).unwrap();
        assert_eq!(dir.entries().unwrap()[0].name, "second.txt");
    }
}
