//! Virtual-disk engines: VHD (fixed/dynamic/differencing), VHDX,
//! VDI, and VMDK. Each engine implements [`crate::block::Container`] over its
//! own sparse on-disk format, so a [`crate::partition`] or
//! [`crate::fat`] layer built on top never needs to know which container
//! it's actually reading from.
//!
//! The block-index math (map guest offset → `(block_index, offset_in_block)`,
//! zero-fill unallocated reads, allocate-on-write) is common to VHD-dynamic,
//! VHDX, and VDI; it's factored out here as free functions, the way cluster
//! math in `fat/table.rs` is kept separate from the table that owns it,
//! generalized from clusters to arbitrary block sizes.

pub mod vhd;
pub mod vhdx;
pub mod vdi;
pub mod vmdk;

/// Maps a guest byte offset to a block index and the offset within that
/// block, given a power-of-two block size.
pub fn offset_to_block(offset: u64, block_size: u32) -> (u64, u32) {
    let block_size = block_size as u64;
    (offset / block_size, (offset % block_size) as u32)
}

/// A guest-visible address range, split into the spans falling within each
/// block it crosses. Used by every BAT-style engine to turn one read/write
/// into a sequence of per-block operations.
pub fn split_by_block(offset: u64, len: usize, block_size: u32) -> Vec<(u64, u32, u32, u32)> {
    // (block_index, offset_in_block, span_len, consumed_so_far)
    let mut spans = Vec::new();
    let mut remaining = len as u64;
    let mut cur = offset;
    let mut consumed = 0u32;

    while remaining > 0 {
        let (block, in_block_offset) = offset_to_block(cur, block_size);
        let space_in_block = block_size - in_block_offset;
        let span = space_in_block.min(remaining as u32);

        spans.push((block, in_block_offset, span, consumed));

        cur += span as u64;
        remaining -= span as u64;
        consumed += span;
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_across_block_boundary() {
        let spans = split_by_block(1000, 100, 1024);
        assert_eq!(spans, vec![(0, 1000, 24, 0), (1, 0, 76, 24)]);
    }
}
