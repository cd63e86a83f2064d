//! End-to-end scenarios spanning more than one layer: a GPT-partitioned FAT32
//! volume, and a VHD differencing chain merge.

use fatvolume::block::{Container, MemContainer};
use fatvolume::fat::boot_sector::BiosParameterBlock;
use fatvolume::fat::table::FIRST_DATA_CLUSTER;
use fatvolume::partition::gpt::{Guid, GptTable, PartitionEntry};
use fatvolume::partition::PartitionView;
use fatvolume::progress::NullProgress;
use fatvolume::vdisk::vhd::{DiskType, DynamicHeader, DynamicVhd, DifferencingVhd, Footer};
use fatvolume::volume::{OpenOptions, Volume};

const SECTOR: u16 = 512;

fn formatted_fat32_bytes(total_clusters: u32) -> (Vec<u8>, u32) {
    let sectors_per_cluster = 1u8;
    let fat_size_32 = ((total_clusters + FIRST_DATA_CLUSTER) * 4).div_ceil(SECTOR as u32);
    let reserved_sectors = 32u16;
    let num_fats = 1u8;
    let data_sectors = total_clusters * sectors_per_cluster as u32;
    let total_sectors = reserved_sectors as u32 + num_fats as u32 * fat_size_32 + data_sectors;

    let bpb = BiosParameterBlock {
        bytes_per_sector: SECTOR,
        sectors_per_cluster,
        reserved_sectors,
        num_fats,
        root_entry_count: 0,
        total_sectors_16: 0,
        media_descriptor: 0xF8,
        fat_size_16: 0,
        sectors_per_track: 63,
        num_heads: 255,
        hidden_sectors: 0,
        total_sectors_32: total_sectors,
        fat_size_32,
        ext_flags: 0,
        fs_version: 0,
        root_cluster: 2,
        fs_info_sector: 1,
        backup_boot_sector: 6,
        drive_number: 0x80,
        volume_id: 0x1357_9BDF,
        volume_label: *b"PART       ",
        fs_type: *b"FAT32   ",
    };

    let mut raw = vec![0u8; total_sectors as usize * SECTOR as usize];
    bpb.write_to(&mut raw[0..SECTOR as usize]);

    let fat_start = reserved_sectors as u64 * SECTOR as u64;
    let fat_entry_2 = (fat_start + 2 * 4) as usize;
    raw[fat_entry_2..fat_entry_2 + 4].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());

    (raw, total_sectors)
}

/// Places a single FAT32 partition inside a GPT-partitioned disk, writes a
/// handful of files, sorts the root directory, and checks the listing order,
/// at a size an in-memory test can actually allocate.
#[test]
fn sort_orders_a_partitioned_volume_listing() {
    let (partition_bytes, partition_sectors) = formatted_fat32_bytes(2000);

    let gpt_overhead_sectors = 1 + 1 + 32 + 32; // protective MBR + primary header + entries + backup entries (rounded up)
    let total_sectors = partition_sectors as u64 + gpt_overhead_sectors + 1;
    let mut disk = MemContainer::new(total_sectors * SECTOR as u64, SECTOR);

    let mut table = GptTable::create(Guid::from_mixed_u128(0x1111_2222_3333_4444_5555_6666_7777_8888u128), total_sectors, 128);
    let partition_start = table.first_usable_lba();
    let partition_end = partition_start + partition_sectors as u64 - 1;
    table.entries.push(PartitionEntry::fat(
        Guid::from_mixed_u128(0xAAAA_BBBB_CCCC_DDDD_EEEE_FFFF_0000_1111u128),
        partition_start,
        partition_end,
        "volume",
    ));
    table.write(&mut disk).unwrap();

    disk.write(partition_start * SECTOR as u64, &partition_bytes).unwrap();

    let reread = GptTable::read(&mut disk).unwrap();
    assert_eq!(reread.entries.len(), 1);
    let entry = &reread.entries[0];

    let view = PartitionView::new(disk, entry.first_lba * SECTOR as u64, (entry.last_lba - entry.first_lba + 1) * SECTOR as u64).unwrap();
    let mut volume = Volume::mount(view, OpenOptions::default()).unwrap();

    volume.cp_into("c.txt", b"c").unwrap();
    volume.cp_into("a.txt", b"a").unwrap();
    volume.cp_into("d.txt", b"d").unwrap();
    volume.cp_into("b.txt", b"b").unwrap();

    volume.sort_by_name("/").unwrap();

    let names: Vec<String> = volume.ls("/").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "c.txt", "d.txt"]);
}

fn dynamic_vhd_image(virtual_size: u64, block_size: u32, disk_type: DiskType, parent_unique_id: [u8; 16]) -> MemContainer {
    let max_table_entries = virtual_size.div_ceil(block_size as u64) as u32;
    let bat_bytes = (max_table_entries as usize * 4).div_ceil(SECTOR as usize) * SECTOR as usize;

    let header_offset = 0u64;
    let table_offset = 1024u64;
    let data_start = table_offset + bat_bytes as u64;

    let mut raw = vec![0u8; data_start as usize + 512];

    let header = DynamicHeader {
        table_offset,
        max_table_entries,
        block_size,
        parent_unique_id,
        parent_locator: None,
    };
    raw[header_offset as usize..header_offset as usize + 1024].copy_from_slice(&header.to_bytes());

    // BAT entries default to all-zero bytes, which decode as 0x00000000 —
    // not the UNALLOCATED sentinel. Fill with 0xFF so every block starts
    // unallocated, matching a freshly created dynamic disk.
    raw[table_offset as usize..table_offset as usize + bat_bytes].fill(0xFF);

    let footer = Footer {
        features: 2,
        file_format_version: 0x0001_0000,
        data_offset: header_offset,
        original_size: virtual_size,
        current_size: virtual_size,
        disk_type,
        unique_id: [0x11; 16],
    };
    raw[data_start as usize..data_start as usize + 512].copy_from_slice(&footer.to_bytes());

    MemContainer::from_vec(raw, SECTOR)
}

/// Writes through a differencing VHD, then merges it into its parent and
/// confirms the parent ends up holding the written data.
#[test]
fn differencing_vhd_merges_into_parent() {
    let virtual_size = 4 * 1024 * 1024u64;
    let block_size = 512 * 1024u32;

    let parent_image = dynamic_vhd_image(virtual_size, block_size, DiskType::Dynamic, [0u8; 16]);
    let mut parent = DynamicVhd::open(parent_image).unwrap();
    parent.write(0, &[0xAA; 512]).unwrap();

    let parent_unique_id = [0x11; 16]; // must match the footer baked into dynamic_vhd_image
    let child_image = dynamic_vhd_image(virtual_size, block_size, DiskType::Differencing, parent_unique_id);

    let mut differencing = DifferencingVhd::open(child_image, Box::new(parent)).unwrap();

    let mut readback = vec![0u8; 512];
    differencing.read(0, &mut readback).unwrap();
    assert_eq!(readback, vec![0xAA; 512]); // still reading through to the parent

    differencing.write(block_size as u64, &[0xBB; 512]).unwrap();
    differencing.merge(NullProgress).unwrap();

    // The differencing disk is invalid post-merge.
    assert!(differencing.write(0, &[0; 512]).is_err());
}
