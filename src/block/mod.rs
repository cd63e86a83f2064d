//! Byte-range access over a file, raw device, or in-memory buffer, sector
//! aligned. Sector size is an ordinary runtime field rather than fixed at
//! compile time, so 512- and 4096-byte sectors (and the larger sectors
//! virtual-disk formats can expose) are both supported by one
//! implementation.

pub mod cache;

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A linear, sector-addressed byte store.
pub trait Container: std::fmt::Debug {
    fn sector_size(&self) -> u16;

    /// One greater than the largest valid byte offset.
    fn size(&self) -> u64;

    fn read_only(&self) -> bool;

    /// `offset` and `buf.len()` must both be multiples of `sector_size()`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// `offset` and `bytes.len()` must both be multiples of `sector_size()`.
    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

fn check_alignment(offset: u64, len: usize, sector_size: u16) -> Result<()> {
    let sector_size = sector_size as u64;
    if offset % sector_size != 0 || (len as u64) % sector_size != 0 {
        return Err(Error::BadFormat(format!(
            "unaligned I/O: offset {offset}, len {len}, sector size {sector_size}"
        )));
    }
    Ok(())
}

/// A file- or block-device-backed container.
#[derive(Debug)]
pub struct BlockFile {
    file: File,
    sector_size: u16,
    size: u64,
    read_only: bool,
}

/// Reads the boot sector's own sector-size field, used when a caller opens a
/// container without already knowing its geometry. Understands both the FAT
/// BPB's `bytes_per_sector` (offset 11) and exFAT's `BytesPerSectorShift`
/// (offset 108) layouts, since either can be the first thing on the disk.
pub fn probe_sector_size<P: AsRef<Path>>(path: P) -> Result<u16> {
    let mut file = File::open(path.as_ref()).map_err(|e| Error::io(0, e))?;
    let mut sector = [0u8; 512];
    file.read_exact(&mut sector).map_err(|e| Error::io(0, e))?;

    if &sector[3..11] == b"EXFAT   " {
        return Ok(1u16 << sector[108]);
    }

    let bytes_per_sector = u16::from_le_bytes(sector[11..13].try_into().unwrap());
    if bytes_per_sector == 0 {
        return Err(Error::BadFormat("cannot probe sector size: BPB bytes_per_sector is zero".into()));
    }
    Ok(bytes_per_sector)
}

impl BlockFile {
    /// `sector_size: None` probes the boot sector itself via
    /// [`probe_sector_size`] rather than requiring the caller to already
    /// know the container's geometry.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool, sector_size: Option<u16>) -> Result<Self> {
        let path = path.as_ref();
        let sector_size = match sector_size {
            Some(s) => s,
            None => probe_sector_size(path)?,
        };

        let file = FsOpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| Error::io(0, e))?;

        let size = file.metadata().map_err(|e| Error::io(0, e))?.len();

        log::debug!(
            "opened container {:?} ({} bytes, sector size {}, {})",
            path,
            size,
            sector_size,
            if read_only { "read-only" } else { "read-write" }
        );

        Ok(Self { file, sector_size, size, read_only })
    }

    pub fn create<P: AsRef<Path>>(path: P, size: u64, sector_size: u16) -> Result<Self> {
        let file = FsOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .map_err(|e| Error::io(0, e))?;
        file.set_len(size).map_err(|e| Error::io(0, e))?;

        Ok(Self { file, sector_size, size, read_only: false })
    }
}

impl Container for BlockFile {
    fn sector_size(&self) -> u16 {
        self.sector_size
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_alignment(offset, buf.len(), self.sector_size)?;
        if offset + buf.len() as u64 > self.size {
            return Err(Error::io(
                offset,
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "read past end of container"),
            ));
        }

        self.file.seek(SeekFrom::Start(offset)).map_err(|e| Error::io(offset, e))?;
        self.file.read_exact(buf).map_err(|e| Error::io(offset, e))
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        check_alignment(offset, bytes.len(), self.sector_size)?;

        self.file.seek(SeekFrom::Start(offset)).map_err(|e| Error::io(offset, e))?;
        self.file.write_all(bytes).map_err(|e| Error::io(offset, e))?;

        self.size = self.size.max(offset + bytes.len() as u64);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(|e| Error::io(0, e))
    }
}

/// An in-memory container, used by unit tests and by callers formatting a
/// volume entirely in memory before writing it out in one shot.
#[derive(Debug, Clone)]
pub struct MemContainer {
    data: Vec<u8>,
    sector_size: u16,
    read_only: bool,
}

impl MemContainer {
    pub fn new(size: u64, sector_size: u16) -> Self {
        Self { data: vec![0u8; size as usize], sector_size, read_only: false }
    }

    pub fn from_vec(data: Vec<u8>, sector_size: u16) -> Self {
        Self { data, sector_size, read_only: false }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }
}

impl Container for MemContainer {
    fn sector_size(&self) -> u16 {
        self.sector_size
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_alignment(offset, buf.len(), self.sector_size)?;
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(Error::io(
                offset,
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "read past end of container"),
            ));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        check_alignment(offset, bytes.len(), self.sector_size)?;
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_container_roundtrip() {
        let mut c = MemContainer::new(4096, 512);
        c.write(512, &[0xAA; 512]).unwrap();

        let mut buf = [0u8; 512];
        c.read(512, &mut buf).unwrap();
        assert_eq!(buf, [0xAA; 512]);
    }

    #[test]
    fn rejects_unaligned_io() {
        let mut c = MemContainer::new(4096, 512);
        let mut buf = [0u8; 10];
        assert!(c.read(1, &mut buf).is_err());
    }
}
