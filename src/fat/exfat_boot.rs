//! The exFAT boot region: a main boot sector plus its
//! verbatim backup copy, followed by 8 extended boot sectors, an OEM
//! parameters sector, a reserved sector, and a boot checksum sector covering
//! all of the above.

use crate::error::{Error, Result};

const SIGNATURE: &[u8; 8] = b"EXFAT   ";
pub const BOOT_REGION_SECTOR_COUNT: u32 = 12; // main boot sector through checksum sector

macro_rules! e {
    ($ty:tt, $raw:expr, $offset:literal) => {
        $ty::from_le_bytes($raw[$offset..($offset + std::mem::size_of::<$ty>())].try_into().unwrap())
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExFatBootSector {
    pub partition_offset: u64,
    pub volume_length: u64,
    pub fat_offset: u32,
    pub fat_length: u32,
    pub cluster_heap_offset: u32,
    pub cluster_count: u32,
    pub root_dir_cluster: u32,
    pub volume_serial: u32,
    pub fs_revision: u16,
    pub volume_flags: u16,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
    pub num_fats: u8,
    pub drive_select: u8,
    pub percent_in_use: u8,
}

impl ExFatBootSector {
    pub fn bytes_per_sector(&self) -> u32 {
        1 << self.bytes_per_sector_shift
    }

    pub fn bytes_per_cluster(&self) -> u64 {
        (self.bytes_per_sector() as u64) << self.sectors_per_cluster_shift
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 512 || raw[0] != 0xEB || raw[1] != 0x76 || raw[2] != 0x90 {
            return Err(Error::BadFormat("exFAT jump instruction mismatch".into()));
        }
        if &raw[3..11] != SIGNATURE {
            return Err(Error::BadFormat("exFAT signature mismatch".into()));
        }
        if raw[510] != 0x55 || raw[511] != 0xAA {
            return Err(Error::BadFormat("missing boot sector signature 0x55AA".into()));
        }

        Ok(Self {
            partition_offset: e!(u64, raw, 64),
            volume_length: e!(u64, raw, 72),
            fat_offset: e!(u32, raw, 80),
            fat_length: e!(u32, raw, 84),
            cluster_heap_offset: e!(u32, raw, 88),
            cluster_count: e!(u32, raw, 92),
            root_dir_cluster: e!(u32, raw, 96),
            volume_serial: e!(u32, raw, 100),
            fs_revision: e!(u16, raw, 104),
            volume_flags: e!(u16, raw, 106),
            bytes_per_sector_shift: raw[108],
            sectors_per_cluster_shift: raw[109],
            num_fats: raw[110],
            drive_select: raw[111],
            percent_in_use: raw[112],
        })
    }

    pub fn write_to(&self, raw: &mut [u8]) {
        raw[0] = 0xEB;
        raw[1] = 0x76;
        raw[2] = 0x90;
        raw[3..11].copy_from_slice(SIGNATURE);
        raw[64..72].copy_from_slice(&self.partition_offset.to_le_bytes());
        raw[72..80].copy_from_slice(&self.volume_length.to_le_bytes());
        raw[80..84].copy_from_slice(&self.fat_offset.to_le_bytes());
        raw[84..88].copy_from_slice(&self.fat_length.to_le_bytes());
        raw[88..92].copy_from_slice(&self.cluster_heap_offset.to_le_bytes());
        raw[92..96].copy_from_slice(&self.cluster_count.to_le_bytes());
        raw[96..100].copy_from_slice(&self.root_dir_cluster.to_le_bytes());
        raw[100..104].copy_from_slice(&self.volume_serial.to_le_bytes());
        raw[104..106].copy_from_slice(&self.fs_revision.to_le_bytes());
        raw[106..108].copy_from_slice(&self.volume_flags.to_le_bytes());
        raw[108] = self.bytes_per_sector_shift;
        raw[109] = self.sectors_per_cluster_shift;
        raw[110] = self.num_fats;
        raw[111] = self.drive_select;
        raw[112] = self.percent_in_use;
        raw[510] = 0x55;
        raw[511] = 0xAA;
    }
}

/// Rotate-right-by-one-bit-then-add checksum over the first 11 sectors of
/// the boot region, skipping VolumeFlags and PercentInUse in the main boot
/// sector since those legitimately differ between the primary and backup
/// copies.
pub fn boot_checksum(sectors: &[u8], bytes_per_sector: u32) -> u32 {
    let mut checksum: u32 = 0;
    for (i, &byte) in sectors.iter().enumerate() {
        // Skip VolumeFlags (106..108) and PercentInUse (112) in the main
        // boot sector only.
        if i == 106 || i == 107 || i == 112 {
            continue;
        }
        let _ = bytes_per_sector;
        let rotated = if checksum & 1 != 0 { 0x8000_0000 } else { 0 } + (checksum >> 1);
        checksum = rotated.wrapping_add(byte as u32);
    }
    checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_boot_sector() {
        let mut raw = vec![0u8; 512];
        let bs = ExFatBootSector {
            partition_offset: 2048,
            volume_length: 1 << 24,
            fat_offset: 128,
            fat_length: 512,
            cluster_heap_offset: 1024,
            cluster_count: 100000,
            root_dir_cluster: 5,
            volume_serial: 0xDEAD_BEEF,
            fs_revision: 0x0100,
            volume_flags: 0,
            bytes_per_sector_shift: 9,
            sectors_per_cluster_shift: 3,
            num_fats: 1,
            drive_select: 0x80,
            percent_in_use: 0xFF,
        };
        bs.write_to(&mut raw);
        let parsed = ExFatBootSector::parse(&raw).unwrap();
        assert_eq!(parsed, bs);
        assert_eq!(parsed.bytes_per_sector(), 512);
        assert_eq!(parsed.bytes_per_cluster(), 4096);
    }
}
