//! Read/write library for FAT12, FAT16, FAT32, and exFAT volumes hosted in
//! raw disk images, block devices, or virtual disk containers (VHD, VHDX,
//! VDI, VMDK), optionally behind an MBR or GPT partition table.
//!
//! The stack is layered the way the data flows for a byte read:
//! [`volume::Volume`] → [`fat::file::FileHandle`] → [`fat::dir`] (cached) →
//! [`fat::table`] (cached) → [`partition`] → [`vdisk`] → [`block::cache`] →
//! [`block::Container`]. Writes traverse the same layers in reverse, with
//! write-back buffering at the cache layer.

pub mod error;

pub mod block;
pub mod vdisk;
pub mod partition;

pub mod util;
pub mod fat;

pub mod progress;
pub mod volume;

pub use error::{Error, Result};
