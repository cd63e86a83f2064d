//! GUID Partition Table reading, writing, and CRC32 validation.
//!
//! Covers a full primary+backup table with CRC32 validation and creation,
//! not just a single-partition read-only view.

use crate::block::Container;
use crate::error::{Error, Result};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::fmt;

pub const SIGNATURE: [u8; 8] = *b"EFI PART";
const HEADER_SIZE: u32 = 92;
const ENTRY_SIZE: u32 = 128;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A "middle-endian" 128-bit GUID, as GPT stores it on disk: the first three
/// fields are little-endian, the last two big-endian.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid {
    first: u32,
    second: u16,
    third: u16,
    fourth: u16,
    fifth_hi: u16,
    fifth_lo: u32,
}

impl Guid {
    pub fn from_mixed_u128(u: u128) -> Self {
        Self::from_mixed(u.to_le_bytes())
    }

    pub fn microsoft_basic_data() -> Self {
        Guid::from_mixed_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7)
    }

    pub fn efi_system() -> Self {
        Guid::from_mixed_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B)
    }

    fn from_mixed(
        [p, o, n, m, l, k, j, i, g, h, e, f, a, b, c, d]: [u8; 16],
    ) -> Self {
        Self {
            first: u32::from_le_bytes([a, b, c, d]),
            second: u16::from_le_bytes([e, f]),
            third: u16::from_le_bytes([g, h]),
            fourth: u16::from_be_bytes([i, j]),
            fifth_hi: u16::from_be_bytes([k, l]),
            fifth_lo: u32::from_be_bytes([m, n, o, p]),
        }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let [a, b, c, d] = self.first.to_le_bytes();
        let [e, f] = self.second.to_le_bytes();
        let [g, h] = self.third.to_le_bytes();
        let [i, j] = self.fourth.to_be_bytes();
        let [k, l] = self.fifth_hi.to_be_bytes();
        let [m, n, o, p] = self.fifth_lo.to_be_bytes();
        [a, b, c, d, e, f, g, h, i, j, k, l, m, n, o, p]
    }

    pub fn from_bytes(raw: [u8; 16]) -> Self {
        Self {
            first: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            second: u16::from_le_bytes(raw[4..6].try_into().unwrap()),
            third: u16::from_le_bytes(raw[6..8].try_into().unwrap()),
            fourth: u16::from_be_bytes(raw[8..10].try_into().unwrap()),
            fifth_hi: u16::from_be_bytes(raw[10..12].try_into().unwrap()),
            fifth_lo: u32::from_be_bytes(raw[12..16].try_into().unwrap()),
        }
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:04X}-{:04X}{:08X}",
            self.first, self.second, self.third, self.fourth, self.fifth_hi, self.fifth_lo
        )
    }
}

#[derive(Debug, Clone)]
pub struct PartitionEntry {
    pub partition_type: Guid,
    pub unique_guid: Guid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attribute_flags: u64,
    pub name: String,
}

impl PartitionEntry {
    pub fn fat(unique_guid: Guid, first_lba: u64, last_lba: u64, name: &str) -> Self {
        Self {
            partition_type: Guid::microsoft_basic_data(),
            unique_guid,
            first_lba,
            last_lba,
            attribute_flags: 0,
            name: name.to_string(),
        }
    }

    fn parse(raw: &[u8]) -> Self {
        let name_utf16: Vec<u16> = raw[56..128]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&c| c != 0)
            .collect();

        Self {
            partition_type: Guid::from_bytes(raw[0..16].try_into().unwrap()),
            unique_guid: Guid::from_bytes(raw[16..32].try_into().unwrap()),
            first_lba: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
            last_lba: u64::from_le_bytes(raw[40..48].try_into().unwrap()),
            attribute_flags: u64::from_le_bytes(raw[48..56].try_into().unwrap()),
            name: String::from_utf16_lossy(&name_utf16),
        }
    }

    fn write_to(&self, raw: &mut [u8]) {
        raw[0..16].copy_from_slice(&self.partition_type.to_bytes());
        raw[16..32].copy_from_slice(&self.unique_guid.to_bytes());
        raw[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        raw[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        raw[48..56].copy_from_slice(&self.attribute_flags.to_le_bytes());
        for (i, unit) in self.name.encode_utf16().take(36).enumerate() {
            raw[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    fn is_empty(&self) -> bool {
        self.partition_type.first == 0
            && self.partition_type.second == 0
            && self.partition_type.third == 0
            && self.partition_type.fourth == 0
    }
}

#[derive(Debug, Clone)]
struct Header {
    current_lba: u64,
    backup_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: Guid,
    partition_entries_lba: u64,
    num_partition_entries: u32,
    partition_entry_size: u32,
}

impl Header {
    fn parse(raw: &[u8; 512]) -> Result<(Self, u32)> {
        if raw[0..8] != SIGNATURE {
            return Err(Error::BadFormat("GPT signature mismatch".into()));
        }

        let header_size = u32::from_le_bytes(raw[12..16].try_into().unwrap());
        let stored_crc = u32::from_le_bytes(raw[16..20].try_into().unwrap());

        let mut scratch = raw[0..header_size as usize].to_vec();
        scratch[16..20].fill(0);
        let computed_crc = CRC32.checksum(&scratch);
        if computed_crc != stored_crc {
            return Err(Error::BadFormat("GPT header CRC32 mismatch".into()));
        }

        Ok((
            Self {
                current_lba: u64::from_le_bytes(raw[24..32].try_into().unwrap()),
                backup_lba: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
                first_usable_lba: u64::from_le_bytes(raw[40..48].try_into().unwrap()),
                last_usable_lba: u64::from_le_bytes(raw[48..56].try_into().unwrap()),
                disk_guid: Guid::from_bytes(raw[56..72].try_into().unwrap()),
                partition_entries_lba: u64::from_le_bytes(raw[72..80].try_into().unwrap()),
                num_partition_entries: u32::from_le_bytes(raw[80..84].try_into().unwrap()),
                partition_entry_size: u32::from_le_bytes(raw[84..88].try_into().unwrap()),
            },
            u32::from_le_bytes(raw[88..92].try_into().unwrap()),
        ))
    }

    fn to_bytes(&self, entries_crc: u32) -> [u8; 512] {
        let mut raw = [0u8; 512];
        raw[0..8].copy_from_slice(&SIGNATURE);
        raw[8..12].copy_from_slice(&1u32.to_le_bytes()); // revision 1.0
        raw[12..16].copy_from_slice(&HEADER_SIZE.to_le_bytes());
        raw[24..32].copy_from_slice(&self.current_lba.to_le_bytes());
        raw[32..40].copy_from_slice(&self.backup_lba.to_le_bytes());
        raw[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        raw[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        raw[56..72].copy_from_slice(&self.disk_guid.to_bytes());
        raw[72..80].copy_from_slice(&self.partition_entries_lba.to_le_bytes());
        raw[80..84].copy_from_slice(&self.num_partition_entries.to_le_bytes());
        raw[84..88].copy_from_slice(&ENTRY_SIZE.to_le_bytes());
        raw[88..92].copy_from_slice(&entries_crc.to_le_bytes());

        let crc = CRC32.checksum(&raw[0..HEADER_SIZE as usize]);
        raw[16..20].copy_from_slice(&crc.to_le_bytes());
        raw
    }
}

#[derive(Debug, Clone)]
pub struct GptTable {
    disk_guid: Guid,
    first_usable_lba: u64,
    last_usable_lba: u64,
    pub entries: Vec<PartitionEntry>,
}

impl GptTable {
    pub fn create(disk_guid: Guid, total_sectors: u64, num_partition_entries: u32) -> Self {
        let entries_sectors = (num_partition_entries * ENTRY_SIZE).div_ceil(512) as u64;
        Self {
            disk_guid,
            first_usable_lba: 2 + entries_sectors,
            last_usable_lba: total_sectors - 2 - entries_sectors,
            entries: Vec::new(),
        }
    }

    pub fn first_usable_lba(&self) -> u64 {
        self.first_usable_lba
    }

    pub fn last_usable_lba(&self) -> u64 {
        self.last_usable_lba
    }

    fn entries_sector_count(&self) -> u64 {
        let num_entries = self.entries.len().max(128) as u32;
        (num_entries * ENTRY_SIZE).div_ceil(512) as u64
    }

    pub fn read<C: Container>(container: &mut C) -> Result<Self> {
        let sector_size = container.sector_size() as u64;
        let mut primary_raw = [0u8; 512];
        container.read(sector_size, &mut primary_raw)?;
        let (primary, entries_crc) = Header::parse(&primary_raw)?;

        let entries_bytes_len = primary.num_partition_entries as usize * primary.partition_entry_size as usize;
        let mut entries_raw = vec![0u8; entries_bytes_len.div_ceil(512) * 512];
        container.read(primary.partition_entries_lba * sector_size, &mut entries_raw)?;

        let computed_entries_crc = CRC32.checksum(&entries_raw[0..entries_bytes_len]);
        if computed_entries_crc != entries_crc {
            return Err(Error::BadFormat("GPT partition array CRC32 mismatch".into()));
        }

        let mut entries = Vec::new();
        for i in 0..primary.num_partition_entries as usize {
            let raw = &entries_raw[i * primary.partition_entry_size as usize..(i + 1) * primary.partition_entry_size as usize];
            let entry = PartitionEntry::parse(raw);
            if !entry.is_empty() {
                entries.push(entry);
            }
        }

        Ok(Self {
            disk_guid: primary.disk_guid,
            first_usable_lba: primary.first_usable_lba,
            last_usable_lba: primary.last_usable_lba,
            entries,
        })
    }

    pub fn write<C: Container>(&self, container: &mut C) -> Result<()> {
        let sector_size = container.sector_size() as u64;
        let total_sectors = container.size() / sector_size;
        let entries_sectors = self.entries_sector_count();
        let num_slots = self.entries.len().max(128) as u32;

        let mut entries_raw = vec![0u8; num_slots as usize * ENTRY_SIZE as usize];
        for (i, entry) in self.entries.iter().enumerate() {
            entry.write_to(&mut entries_raw[i * ENTRY_SIZE as usize..(i + 1) * ENTRY_SIZE as usize]);
        }
        let entries_crc = CRC32.checksum(&entries_raw);

        let primary_header = Header {
            current_lba: 1,
            backup_lba: total_sectors - 1,
            first_usable_lba: self.first_usable_lba,
            last_usable_lba: self.last_usable_lba,
            disk_guid: self.disk_guid,
            partition_entries_lba: 2,
            num_partition_entries: num_slots,
            partition_entry_size: ENTRY_SIZE,
        };
        let backup_header = Header {
            current_lba: total_sectors - 1,
            backup_lba: 1,
            partition_entries_lba: total_sectors - 1 - entries_sectors,
            ..primary_header.clone()
        };

        let mut padded_entries = entries_raw.clone();
        padded_entries.resize(entries_sectors as usize * 512, 0);

        container.write(sector_size, &primary_header.to_bytes(entries_crc))?;
        container.write(2 * sector_size, &padded_entries)?;
        container.write(backup_header.partition_entries_lba * sector_size, &padded_entries)?;
        container.write(backup_header.current_lba * sector_size, &backup_header.to_bytes(entries_crc))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemContainer;

    #[test]
    fn guid_mixed_to_disk() {
        assert_eq!(
            Guid::from_mixed_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B).to_bytes(),
            [0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e, 0xc9, 0x3b],
        );
    }

    #[test]
    fn guid_roundtrip() {
        let g = Guid::from_mixed_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
        assert_eq!(g, Guid::from_bytes(g.to_bytes()));
    }

    #[test]
    fn roundtrips_through_container() {
        let mut c = MemContainer::new(16 * 1024 * 1024, 512);
        let mut table = GptTable::create(Guid::from_mixed_u128(0x1111_2222_3333_4444_5555_666677778888), 16 * 1024 * 1024 / 512, 128);
        table.entries.push(PartitionEntry::fat(
            Guid::from_mixed_u128(0xAAAA_BBBB_CCCC_DDDD_EEEE_FFFFFFFFFFFF),
            table.first_usable_lba,
            table.last_usable_lba,
            "basic data",
        ));
        table.write(&mut c).unwrap();

        let parsed = GptTable::read(&mut c).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].name, "basic data");
        assert_eq!(parsed.entries[0].first_lba, table.first_usable_lba);
    }
}
