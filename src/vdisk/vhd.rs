//! Connectix/Microsoft VHD: fixed, dynamic, and differencing disks.
//!
//! All multi-byte fields in the VHD footer and dynamic header are big-endian
//! (unlike the little-endian FAT/exFAT/MBR/GPT structures elsewhere in this
//! crate) — this is a quirk of the format, not a stylistic choice, and is
//! called out at every parse site below.

use crate::block::{BlockFile, Container};
use crate::error::{Error, Result};
use crate::progress::{self, Progress};
use crate::vdisk::offset_to_block;
use std::path::{Path, PathBuf};

pub const FOOTER_COOKIE: &[u8; 8] = b"conectix";
pub const DYNAMIC_COOKIE: &[u8; 8] = b"cxsparse";
const FOOTER_SIZE: u64 = 512;
const SECTOR: u64 = 512;
const UNALLOCATED: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

impl DiskType {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Differencing),
            other => Err(Error::BadFormat(format!("unknown VHD disk type {other}"))),
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            DiskType::Fixed => 2,
            DiskType::Dynamic => 3,
            DiskType::Differencing => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Footer {
    pub features: u32,
    pub file_format_version: u32,
    pub data_offset: u64,
    pub original_size: u64,
    pub current_size: u64,
    pub disk_type: DiskType,
    pub unique_id: [u8; 16],
}

fn ones_complement_checksum(bytes: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &b in bytes {
        sum = sum.wrapping_add(b as u32);
    }
    !sum
}

impl Footer {
    pub fn parse(raw: &[u8; 512]) -> Result<Self> {
        if &raw[0..8] != FOOTER_COOKIE {
            return Err(Error::BadFormat("VHD footer cookie mismatch".into()));
        }

        let stored_checksum = u32::from_be_bytes(raw[64..68].try_into().unwrap());
        let mut scratch = *raw;
        scratch[64..68].copy_from_slice(&[0, 0, 0, 0]);
        let computed = ones_complement_checksum(&scratch);
        if stored_checksum != computed {
            return Err(Error::BadFormat(format!(
                "VHD footer checksum mismatch: stored {stored_checksum:#010x}, computed {computed:#010x}"
            )));
        }

        Ok(Self {
            features: u32::from_be_bytes(raw[8..12].try_into().unwrap()),
            file_format_version: u32::from_be_bytes(raw[12..16].try_into().unwrap()),
            data_offset: u64::from_be_bytes(raw[16..24].try_into().unwrap()),
            original_size: u64::from_be_bytes(raw[48..56].try_into().unwrap()),
            current_size: u64::from_be_bytes(raw[56..64].try_into().unwrap()),
            disk_type: DiskType::from_u32(u32::from_be_bytes(raw[60 + 8..60 + 12].try_into().unwrap()))?,
            unique_id: raw[68..84].try_into().unwrap(),
        })
    }

    pub fn to_bytes(&self) -> [u8; 512] {
        let mut raw = [0u8; 512];
        raw[0..8].copy_from_slice(FOOTER_COOKIE);
        raw[8..12].copy_from_slice(&self.features.to_be_bytes());
        raw[12..16].copy_from_slice(&self.file_format_version.to_be_bytes());
        raw[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        raw[48..56].copy_from_slice(&self.original_size.to_be_bytes());
        raw[56..64].copy_from_slice(&self.current_size.to_be_bytes());
        raw[68..84].copy_from_slice(&self.unique_id);
        raw[60 + 8..60 + 12].copy_from_slice(&self.disk_type.to_u32().to_be_bytes());

        // Checksum is computed last, over everything else with this field zeroed.
        let checksum = ones_complement_checksum(&raw);
        raw[64..68].copy_from_slice(&checksum.to_be_bytes());
        raw
    }
}

#[derive(Debug, Clone)]
pub struct DynamicHeader {
    pub table_offset: u64,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub parent_unique_id: [u8; 16],
    pub parent_locator: Option<String>,
}

impl DynamicHeader {
    pub fn parse(raw: &[u8; 1024]) -> Result<Self> {
        if &raw[0..8] != DYNAMIC_COOKIE {
            return Err(Error::BadFormat("VHD dynamic header cookie mismatch".into()));
        }

        let stored_checksum = u32::from_be_bytes(raw[36..40].try_into().unwrap());
        let mut scratch = *raw;
        scratch[36..40].copy_from_slice(&[0, 0, 0, 0]);
        let computed = ones_complement_checksum(&scratch);
        if stored_checksum != computed {
            return Err(Error::BadFormat("VHD dynamic header checksum mismatch".into()));
        }

        let parent_name_utf16: Vec<u16> = raw[64..(64 + 512)]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .take_while(|&c| c != 0)
            .collect();
        let parent_locator = if parent_name_utf16.is_empty() {
            None
        } else {
            Some(String::from_utf16_lossy(&parent_name_utf16))
        };

        Ok(Self {
            table_offset: u64::from_be_bytes(raw[16..24].try_into().unwrap()),
            max_table_entries: u32::from_be_bytes(raw[28..32].try_into().unwrap()),
            block_size: u32::from_be_bytes(raw[32..36].try_into().unwrap()),
            parent_unique_id: raw[40..56].try_into().unwrap(),
            parent_locator,
        })
    }

    pub fn to_bytes(&self) -> [u8; 1024] {
        let mut raw = [0u8; 1024];
        raw[0..8].copy_from_slice(DYNAMIC_COOKIE);
        raw[8..16].copy_from_slice(&0xFFFF_FFFF_FFFF_FFFFu64.to_be_bytes()); // data_offset: unused/next header
        raw[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        raw[24..28].copy_from_slice(&1u32.to_be_bytes()); // header version 1.0
        raw[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        raw[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        raw[40..56].copy_from_slice(&self.parent_unique_id);

        if let Some(name) = &self.parent_locator {
            for (i, unit) in name.encode_utf16().take(256).enumerate() {
                raw[64 + i * 2..66 + i * 2].copy_from_slice(&unit.to_be_bytes());
            }
        }

        let checksum = ones_complement_checksum(&raw);
        raw[36..40].copy_from_slice(&checksum.to_be_bytes());
        raw
    }
}

/// A fixed VHD: identity mapping plus a 512-byte footer at the end of the
/// file.
#[derive(Debug)]
pub struct FixedVhd<C: Container> {
    inner: C,
    footer: Footer,
}

impl<C: Container> FixedVhd<C> {
    pub fn open(mut inner: C) -> Result<Self> {
        let total = inner.size();
        let mut raw = [0u8; 512];
        inner.read(total - FOOTER_SIZE, &mut raw)?;
        let footer = Footer::parse(&raw)?;

        if footer.disk_type != DiskType::Fixed {
            return Err(Error::BadFormat("not a fixed VHD".into()));
        }

        Ok(Self { inner, footer })
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }
}

impl<C: Container> Container for FixedVhd<C> {
    fn sector_size(&self) -> u16 {
        self.inner.sector_size()
    }

    fn size(&self) -> u64 {
        self.footer.current_size
    }

    fn read_only(&self) -> bool {
        self.inner.read_only()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.footer.current_size {
            return Err(Error::BadFormat("read past end of fixed VHD".into()));
        }
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() as u64 > self.footer.current_size {
            return Err(Error::BadFormat("write past end of fixed VHD".into()));
        }
        self.inner.write(offset, bytes)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

/// A dynamic VHD: a Block Allocation Table of sector offsets, one entry per
/// block.
#[derive(Debug)]
pub struct DynamicVhd<C: Container> {
    inner: C,
    footer: Footer,
    header: DynamicHeader,
    bat: Vec<u32>,
    sectors_per_block: u32,
    bitmap_sectors: u32,
}

impl<C: Container> DynamicVhd<C> {
    pub fn open(mut inner: C) -> Result<Self> {
        let total = inner.size();
        let mut footer_raw = [0u8; 512];
        inner.read(total - FOOTER_SIZE, &mut footer_raw)?;
        let footer = Footer::parse(&footer_raw)?;

        if footer.disk_type != DiskType::Dynamic {
            return Err(Error::BadFormat("not a dynamic VHD".into()));
        }

        let mut header_raw = [0u8; 1024];
        inner.read(footer.data_offset, &mut header_raw)?;
        let header = DynamicHeader::parse(&header_raw)?;

        let sectors_per_block = header.block_size / SECTOR as u32;
        let bitmap_bytes = (sectors_per_block + 7) / 8;
        let bitmap_sectors = ((bitmap_bytes as u64 + SECTOR - 1) / SECTOR) as u32;

        let mut bat = vec![0u32; header.max_table_entries as usize];
        let bat_bytes_len = header.max_table_entries as usize * 4;
        let mut bat_raw = vec![0u8; bat_bytes_len.div_ceil(512) * 512];
        inner.read(header.table_offset, &mut bat_raw)?;
        for (i, entry) in bat.iter_mut().enumerate() {
            *entry = u32::from_be_bytes(bat_raw[i * 4..i * 4 + 4].try_into().unwrap());
        }

        Ok(Self { inner, footer, header, bat, sectors_per_block, bitmap_sectors })
    }

    fn block_offset(&self, block: u64) -> Option<u64> {
        let entry = *self.bat.get(block as usize)?;
        if entry == UNALLOCATED {
            None
        } else {
            Some(entry as u64 * SECTOR + self.bitmap_sectors as u64 * SECTOR)
        }
    }

    fn allocate_block(&mut self, block: u64) -> Result<u64> {
        if let Some(offset) = self.block_offset(block) {
            return Ok(offset);
        }

        let block_size_with_bitmap = (self.bitmap_sectors as u64 + self.sectors_per_block as u64) * SECTOR;
        // New blocks are appended just before the footer, which is then
        // rewritten at the new end of file.
        let new_block_start = self.inner.size() - FOOTER_SIZE;

        let zeros = vec![0u8; block_size_with_bitmap as usize];
        self.inner.write(new_block_start, &zeros)?;
        self.inner.write(new_block_start + block_size_with_bitmap, &self.footer.to_bytes())?;

        let new_bat_entry = (new_block_start / SECTOR) as u32;
        self.bat[block as usize] = new_bat_entry;
        self.write_bat_entry(block as usize, new_bat_entry)?;

        Ok(new_block_start + self.bitmap_sectors as u64 * SECTOR)
    }

    fn write_bat_entry(&mut self, index: usize, value: u32) -> Result<()> {
        // BAT entries are written sector-aligned, four at a time, to respect
        // the container's alignment requirement.
        let entries_per_sector = SECTOR as usize / 4;
        let sector_index = index / entries_per_sector;
        let sector_offset = self.header.table_offset + sector_index as u64 * SECTOR;

        let mut sector = vec![0u8; SECTOR as usize];
        self.inner.read(sector_offset, &mut sector)?;
        let in_sector = (index % entries_per_sector) * 4;
        sector[in_sector..in_sector + 4].copy_from_slice(&value.to_be_bytes());
        self.inner.write(sector_offset, &sector)
    }
}

impl<C: Container> Container for DynamicVhd<C> {
    fn sector_size(&self) -> u16 {
        self.inner.sector_size()
    }

    fn size(&self) -> u64 {
        self.footer.current_size
    }

    fn read_only(&self) -> bool {
        self.inner.read_only()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let (block, in_block) = offset_to_block(offset + done as u64, self.header.block_size);
            let span = (self.header.block_size - in_block).min((buf.len() - done) as u32) as usize;

            match self.block_offset(block) {
                Some(host_offset) => {
                    self.inner.read(host_offset + in_block as u64, &mut buf[done..done + span])?;
                }
                None => {
                    buf[done..done + span].fill(0);
                }
            }
            done += span;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < bytes.len() {
            let (block, in_block) = offset_to_block(offset + done as u64, self.header.block_size);
            let span = (self.header.block_size - in_block).min((bytes.len() - done) as u32) as usize;

            let host_offset = self.allocate_block(block)?;
            self.inner.write(host_offset + in_block as u64, &bytes[done..done + span])?;
            done += span;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

/// A differencing VHD: a BAT identical in shape to [`DynamicVhd`]'s, backed
/// by a read-only parent for unallocated blocks.
pub struct DifferencingVhd<C: Container> {
    child: DynamicVhd<C>,
    parent: Box<dyn Container>,
    invalid: bool,
}

impl<C: Container> std::fmt::Debug for DifferencingVhd<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DifferencingVhd").field("invalid", &self.invalid).finish()
    }
}

impl<C: Container> DifferencingVhd<C> {
    pub fn open(inner: C, parent: Box<dyn Container>) -> Result<Self> {
        let child = DynamicVhd::open(inner)?;
        if child.footer.disk_type != DiskType::Differencing {
            return Err(Error::BadFormat("not a differencing VHD".into()));
        }
        Ok(Self { child, parent, invalid: false })
    }

    fn require_valid(&self) -> Result<()> {
        if self.invalid {
            Err(Error::InconsistentFs("differencing VHD was merged into its parent and is now invalid".into()))
        } else {
            Ok(())
        }
    }

    /// Walks every populated block in ascending order and writes it into the
    /// parent, then marks this child invalid.
    pub fn merge(&mut self, mut progress: impl Progress) -> Result<()> {
        self.require_valid()?;

        let block_size = self.child.header.block_size as u64;
        let total = self.child.bat.len() as u64;
        for block in 0..total {
            if let Some(host_offset) = self.child.block_offset(block) {
                let mut buf = vec![0u8; block_size as usize];
                self.child.inner.read(host_offset, &mut buf)?;
                self.parent.write(block * block_size, &buf)?;
            }
            progress::check(progress.report(block + 1, total))?;
        }
        self.parent.flush()?;
        self.invalid = true;
        Ok(())
    }
}

impl<C: Container> Container for DifferencingVhd<C> {
    fn sector_size(&self) -> u16 {
        self.child.sector_size()
    }

    fn size(&self) -> u64 {
        self.child.size()
    }

    fn read_only(&self) -> bool {
        self.child.read_only()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.require_valid()?;

        let mut done = 0usize;
        while done < buf.len() {
            let (block, in_block) = offset_to_block(offset + done as u64, self.child.header.block_size);
            let span = (self.child.header.block_size - in_block).min((buf.len() - done) as u32) as usize;

            match self.child.block_offset(block) {
                Some(host_offset) => {
                    self.child.inner.read(host_offset + in_block as u64, &mut buf[done..done + span])?;
                }
                None => {
                    // Unallocated in the child: fall through to the parent,
                    // which recurses for its own differencing chain.
                    self.parent.read(offset + done as u64, &mut buf[done..done + span])?;
                }
            }
            done += span;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.require_valid()?;
        // Differencing writes always allocate in the child.
        self.child.write(offset, bytes)
    }

    fn flush(&mut self) -> Result<()> {
        self.child.flush()
    }
}

/// Opens a VHD file, auto-resolving a differencing disk's parent chain via
/// each dynamic header's `parent_locator` rather than requiring the caller
/// to already have the parent container open.
pub fn open_vhd<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Box<dyn Container>> {
    let path = path.as_ref();
    let mut inner = BlockFile::open(path, read_only, Some(SECTOR as u16))?;

    let total = inner.size();
    let mut footer_raw = [0u8; 512];
    inner.read(total - FOOTER_SIZE, &mut footer_raw)?;
    let footer = Footer::parse(&footer_raw)?;

    match footer.disk_type {
        DiskType::Fixed => Ok(Box::new(FixedVhd::open(inner)?)),
        DiskType::Dynamic => Ok(Box::new(DynamicVhd::open(inner)?)),
        DiskType::Differencing => {
            let mut header_raw = [0u8; 1024];
            inner.read(footer.data_offset, &mut header_raw)?;
            let header = DynamicHeader::parse(&header_raw)?;

            let locator = header
                .parent_locator
                .as_deref()
                .ok_or_else(|| Error::BadFormat("differencing VHD has no parent locator".into()))?;
            let parent_path = resolve_parent_path(path, locator)?;
            // A parent is only ever read through by its child; opening it
            // read-only keeps a child from corrupting a parent other
            // children may share.
            let parent = open_vhd(&parent_path, true)?;

            Ok(Box::new(DifferencingVhd::open(inner, parent)?))
        }
    }
}

/// Resolves a differencing disk's stored parent locator against the child
/// file's own directory. The locator is usually an absolute path baked in
/// by whatever machine created the chain, which is rarely valid on the
/// machine that reopens it later, so only the file name is trusted and it's
/// looked up next to the child.
fn resolve_parent_path(child_path: &Path, locator: &str) -> Result<PathBuf> {
    let name = Path::new(locator)
        .file_name()
        .ok_or_else(|| Error::BadFormat(format!("unusable VHD parent locator {locator:?}")))?;

    let dir = child_path.parent().unwrap_or_else(|| Path::new("."));
    let candidate = dir.join(name);
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(Error::BadFormat(format!("parent VHD {name:?} for {child_path:?} not found next to the child file")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_checksum_roundtrips() {
        let footer = Footer {
            features: 2,
            file_format_version: 0x0001_0000,
            data_offset: u64::MAX,
            original_size: 64 * 1024 * 1024,
            current_size: 64 * 1024 * 1024,
            disk_type: DiskType::Fixed,
            unique_id: [0x42; 16],
        };

        let bytes = footer.to_bytes();
        let parsed = Footer::parse(&bytes).unwrap();
        assert_eq!(parsed.current_size, footer.current_size);
        assert_eq!(parsed.disk_type, DiskType::Fixed);
    }
}
