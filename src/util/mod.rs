//! Small general-purpose containers shared across the FAT/exFAT and
//! virtual-disk layers: a run-length-encoded extent map and a bit-level
//! allocation bitmap.

pub mod bitmap;
pub mod rle;

pub use bitmap::BitMap;
pub use rle::RunMap;
