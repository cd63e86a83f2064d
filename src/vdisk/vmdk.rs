//! VMware monolithic sparse VMDK: a two-level grain directory,
//! where each directory entry points to a 512-entry grain table, and each
//! grain-table entry points to a 512-sector (256 KiB) grain.

use crate::block::Container;
use crate::error::{Error, Result};
use crate::vdisk::offset_to_block;

pub const MAGIC: &[u8; 4] = b"KDMV";
const SECTOR: u64 = 512;
const GRAIN_SECTORS_DEFAULT: u64 = 128;
const ENTRIES_PER_TABLE: u64 = 512;

#[derive(Debug)]
pub struct Vmdk<C: Container> {
    inner: C,
    capacity_sectors: u64,
    grain_size_sectors: u64,
    grain_table_sectors: u64,
    grain_dir: Vec<u32>,
    // Lazily loaded grain tables, keyed by directory index.
    grain_tables: std::collections::HashMap<u32, Vec<u32>>,
}

impl<C: Container> Vmdk<C> {
    pub fn open(mut inner: C) -> Result<Self> {
        let mut header = vec![0u8; 512];
        inner.read(0, &mut header)?;

        if &header[0..4] != MAGIC {
            return Err(Error::BadFormat("VMDK magic mismatch".into()));
        }

        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != 1 && version != 3 {
            return Err(Error::BadFormat(format!("unsupported VMDK version {version}")));
        }

        let capacity_sectors = u64::from_le_bytes(header[12..20].try_into().unwrap());
        let grain_size_sectors = u64::from_le_bytes(header[20..28].try_into().unwrap());
        let grain_size_sectors = if grain_size_sectors == 0 { GRAIN_SECTORS_DEFAULT } else { grain_size_sectors };
        let num_gtes_per_gt = u32::from_le_bytes(header[44..48].try_into().unwrap()) as u64;
        let num_gtes_per_gt = if num_gtes_per_gt == 0 { ENTRIES_PER_TABLE } else { num_gtes_per_gt };
        let gd_offset_sectors = u64::from_le_bytes(header[56..64].try_into().unwrap());

        let grain_table_sectors = num_gtes_per_gt;
        let dir_entries = capacity_sectors.div_ceil(grain_size_sectors * num_gtes_per_gt);

        let mut dir_raw = vec![0u8; dir_entries as usize * 4];
        inner.read(gd_offset_sectors * SECTOR, &mut dir_raw)?;
        let grain_dir = dir_raw.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect();

        Ok(Self {
            inner,
            capacity_sectors,
            grain_size_sectors,
            grain_table_sectors,
            grain_dir,
            grain_tables: std::collections::HashMap::new(),
        })
    }

    fn grain_byte_size(&self) -> u32 {
        (self.grain_size_sectors * SECTOR) as u32
    }

    fn load_grain_table(&mut self, dir_index: u32) -> Result<()> {
        if self.grain_tables.contains_key(&dir_index) {
            return Ok(());
        }

        let gt_sector = self.grain_dir[dir_index as usize];
        let table = if gt_sector == 0 {
            vec![0u32; self.grain_table_sectors as usize]
        } else {
            let mut raw = vec![0u8; self.grain_table_sectors as usize * 4];
            self.inner.read(gt_sector as u64 * SECTOR, &mut raw)?;
            raw.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect()
        };

        self.grain_tables.insert(dir_index, table);
        Ok(())
    }

    fn grain_location(&mut self, grain_index: u64) -> Result<u32> {
        let dir_index = (grain_index / self.grain_table_sectors) as u32;
        let table_index = (grain_index % self.grain_table_sectors) as usize;
        self.load_grain_table(dir_index)?;
        Ok(self.grain_tables[&dir_index][table_index])
    }

    fn allocate_grain(&mut self, grain_index: u64) -> Result<u64> {
        let existing = self.grain_location(grain_index)?;
        if existing != 0 {
            return Ok(existing as u64 * SECTOR);
        }

        let dir_index = (grain_index / self.grain_table_sectors) as u32;
        let table_index = (grain_index % self.grain_table_sectors) as usize;

        // Allocate a grain table on disk if this directory slot is still
        // empty (first write into a previously-unused region).
        if self.grain_dir[dir_index as usize] == 0 {
            let gt_offset_sectors = self.inner.size() / SECTOR;
            let zeros = vec![0u8; self.grain_table_sectors as usize * 4];
            self.inner.write(gt_offset_sectors * SECTOR, &zeros)?;
            self.grain_dir[dir_index as usize] = gt_offset_sectors as u32;
        }

        let grain_offset_sectors = self.inner.size() / SECTOR;
        let zeros = vec![0u8; self.grain_byte_size() as usize];
        self.inner.write(grain_offset_sectors * SECTOR, &zeros)?;

        self.load_grain_table(dir_index)?;
        let table = self.grain_tables.get_mut(&dir_index).unwrap();
        table[table_index] = grain_offset_sectors as u32;

        let gt_sector = self.grain_dir[dir_index as usize] as u64;
        self.inner.write(
            gt_sector * SECTOR + table_index as u64 * 4,
            &(grain_offset_sectors as u32).to_le_bytes(),
        )?;

        Ok(grain_offset_sectors * SECTOR)
    }
}

impl<C: Container> Container for Vmdk<C> {
    fn sector_size(&self) -> u16 {
        self.inner.sector_size()
    }

    fn size(&self) -> u64 {
        self.capacity_sectors * SECTOR
    }

    fn read_only(&self) -> bool {
        self.inner.read_only()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let grain_size = self.grain_byte_size();
        let mut done = 0usize;
        while done < buf.len() {
            let (grain, in_grain) = offset_to_block(offset + done as u64, grain_size);
            let span = (grain_size - in_grain).min((buf.len() - done) as u32) as usize;

            let location = self.grain_location(grain)?;
            if location == 0 {
                buf[done..done + span].fill(0);
            } else {
                self.inner.read(location as u64 * SECTOR + in_grain as u64, &mut buf[done..done + span])?;
            }
            done += span;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let grain_size = self.grain_byte_size();
        let mut done = 0usize;
        while done < bytes.len() {
            let (grain, in_grain) = offset_to_block(offset + done as u64, grain_size);
            let span = (grain_size - in_grain).min((bytes.len() - done) as u32) as usize;

            let host_offset = self.allocate_grain(grain)?;
            self.inner.write(host_offset + in_grain as u64, &bytes[done..done + span])?;
            done += span;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
