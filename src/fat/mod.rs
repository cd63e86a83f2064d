//! FAT12/16/32 and exFAT volume structures.

pub mod boot_sector;
pub mod dir;
pub mod exfat_boot;
pub mod file;
pub mod name;
pub mod table;

use crate::block::Container;
use crate::error::{Error, Result};
use boot_sector::{BiosParameterBlock, FatKind};
use exfat_boot::ExFatBootSector;

#[derive(Debug, Clone)]
pub enum FsGeometry {
    Fat(FatKind, BiosParameterBlock),
    ExFat(ExFatBootSector),
}

impl FsGeometry {
    pub fn bytes_per_sector(&self) -> u32 {
        match self {
            FsGeometry::Fat(_, bpb) => bpb.bytes_per_sector as u32,
            FsGeometry::ExFat(boot) => boot.bytes_per_sector(),
        }
    }

    pub fn bytes_per_cluster(&self) -> u64 {
        match self {
            FsGeometry::Fat(_, bpb) => bpb.bytes_per_sector as u64 * bpb.sectors_per_cluster as u64,
            FsGeometry::ExFat(boot) => boot.bytes_per_cluster(),
        }
    }

    pub fn root_cluster(&self) -> u32 {
        match self {
            FsGeometry::Fat(FatKind::Fat32, bpb) => bpb.root_cluster,
            FsGeometry::Fat(_, _) => 0, // FAT12/16 root directory is a fixed region, not a cluster chain.
            FsGeometry::ExFat(boot) => boot.root_dir_cluster,
        }
    }
}

/// Reads the boot sector at the start of `container` and determines which
/// of FAT12/16/32/exFAT it describes.
pub fn recognize<C: Container>(container: &mut C) -> Result<FsGeometry> {
    let mut sector = vec![0u8; container.sector_size().max(512) as usize];
    container.read(0, &mut sector)?;

    if sector.len() >= 11 && &sector[3..11] == b"EXFAT   " {
        return Ok(FsGeometry::ExFat(ExFatBootSector::parse(&sector)?));
    }

    let bpb = BiosParameterBlock::parse(&sector)?;
    let kind = bpb.kind();
    Ok(FsGeometry::Fat(kind, bpb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemContainer;

    #[test]
    fn recognizes_fat32() {
        let mut raw = vec![0u8; 512];
        let bpb = BiosParameterBlock {
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            reserved_sectors: 32,
            num_fats: 2,
            root_entry_count: 0,
            total_sectors_16: 0,
            media_descriptor: 0xF8,
            fat_size_16: 0,
            sectors_per_track: 63,
            num_heads: 255,
            hidden_sectors: 0,
            total_sectors_32: 131072 * 16,
            fat_size_32: 4096,
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
        bpb.write_to(&mut raw);

        let mut container = MemContainer::new(raw.len() as u64, 512);
        container.write(0, &raw).unwrap();

        match recognize(&mut container).unwrap() {
            FsGeometry::Fat(FatKind::Fat32, _) => {}
            other => panic!("expected FAT32, got {other:?}"),
        }
    }
}
