//! VirtualBox VDI: a single-copy header followed by a block map
//! (one `u32` per 1 MiB block) and the data blocks themselves. The simplest
//! of the four container formats — one level of indirection, no log, no
//! differencing chain support in the format itself.

use crate::block::Container;
use crate::error::{Error, Result};
use crate::vdisk::offset_to_block;

pub const SIGNATURE: u32 = 0xBEDA_107F;
const BLOCK_FREE: u32 = 0xFFFF_FFFF;
const BLOCK_ZERO: u32 = 0xFFFF_FFFE;

// Byte offsets into the v1.1 VDI header. The 512-byte preheader (image
// identification text) precedes this; these offsets are relative to its end.
const OFF_SIGNATURE: usize = 64;
const OFF_COMMENT: usize = 100;
const OFF_BLOCKS_OFFSET: usize = OFF_COMMENT + 256;
const OFF_DATA_OFFSET: usize = OFF_BLOCKS_OFFSET + 4;
const OFF_CYLINDERS: usize = OFF_DATA_OFFSET + 4;
const OFF_SECTOR_SIZE: usize = OFF_CYLINDERS + 16;
const OFF_DISK_SIZE: usize = OFF_SECTOR_SIZE + 8;
const OFF_BLOCK_SIZE: usize = OFF_DISK_SIZE + 8;
const OFF_BLOCKS_IN_IMAGE: usize = OFF_BLOCK_SIZE + 8;

#[derive(Debug)]
pub struct Vdi<C: Container> {
    inner: C,
    disk_size: u64,
    block_size: u32,
    blocks_offset: u64,
    data_offset: u64,
    block_map: Vec<u32>,
}

impl<C: Container> Vdi<C> {
    pub fn open(mut inner: C) -> Result<Self> {
        let mut header = vec![0u8; 512];
        inner.read(0, &mut header)?;

        let signature = u32::from_le_bytes(header[OFF_SIGNATURE..OFF_SIGNATURE + 4].try_into().unwrap());
        if signature != SIGNATURE {
            return Err(Error::BadFormat("VDI signature mismatch".into()));
        }

        let blocks_offset = u32::from_le_bytes(header[OFF_BLOCKS_OFFSET..OFF_BLOCKS_OFFSET + 4].try_into().unwrap()) as u64;
        let data_offset = u32::from_le_bytes(header[OFF_DATA_OFFSET..OFF_DATA_OFFSET + 4].try_into().unwrap()) as u64;
        let disk_size = u64::from_le_bytes(header[OFF_DISK_SIZE..OFF_DISK_SIZE + 8].try_into().unwrap());
        let block_size = u32::from_le_bytes(header[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 4].try_into().unwrap());
        let blocks_in_image =
            u32::from_le_bytes(header[OFF_BLOCKS_IN_IMAGE..OFF_BLOCKS_IN_IMAGE + 4].try_into().unwrap());

        let mut map_raw = vec![0u8; blocks_in_image as usize * 4];
        inner.read(blocks_offset, &mut map_raw)?;
        let block_map = map_raw.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect();

        Ok(Self { inner, disk_size, block_size, blocks_offset, data_offset, block_map })
    }

    fn allocated_block_count(&self) -> u32 {
        self.block_map.iter().filter(|&&e| e != BLOCK_FREE && e != BLOCK_ZERO).count() as u32
    }

    fn allocate_block(&mut self, block: u64) -> Result<u64> {
        let entry = self.block_map[block as usize];
        if entry != BLOCK_FREE && entry != BLOCK_ZERO {
            return Ok(self.data_offset + entry as u64 * self.block_size as u64);
        }

        let new_index = self.allocated_block_count();
        let new_offset = self.data_offset + new_index as u64 * self.block_size as u64;

        let zeros = vec![0u8; self.block_size as usize];
        self.inner.write(new_offset, &zeros)?;

        self.block_map[block as usize] = new_index;
        self.inner.write(self.blocks_offset + block * 4, &new_index.to_le_bytes())?;

        Ok(new_offset)
    }
}

impl<C: Container> Container for Vdi<C> {
    fn sector_size(&self) -> u16 {
        self.inner.sector_size()
    }

    fn size(&self) -> u64 {
        self.disk_size
    }

    fn read_only(&self) -> bool {
        self.inner.read_only()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let (block, in_block) = offset_to_block(offset + done as u64, self.block_size);
            let span = (self.block_size - in_block).min((buf.len() - done) as u32) as usize;

            let entry = self.block_map[block as usize];
            if entry == BLOCK_FREE || entry == BLOCK_ZERO {
                buf[done..done + span].fill(0);
            } else {
                let host_offset = self.data_offset + entry as u64 * self.block_size as u64;
                self.inner.read(host_offset + in_block as u64, &mut buf[done..done + span])?;
            }
            done += span;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < bytes.len() {
            let (block, in_block) = offset_to_block(offset + done as u64, self.block_size);
            let span = (self.block_size - in_block).min((bytes.len() - done) as u32) as usize;

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
