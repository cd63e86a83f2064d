//! End-to-end coverage against a real file on disk rather than an in-memory
//! container, exercising `BlockFile` and a full mount/write/reopen cycle.

use fatvolume::block::{BlockFile, Container};
use fatvolume::fat::boot_sector::BiosParameterBlock;
use fatvolume::fat::table::FIRST_DATA_CLUSTER;
use fatvolume::volume::{OpenOptions, Volume};

const SECTOR: u16 = 512;

fn format_fat32_image(path: &std::path::Path, total_clusters: u32) {
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
        volume_id: 0xCAFE_BABE,
        volume_label: *b"TESTDISK   ",
        fs_type: *b"FAT32   ",
    };

    let mut file = BlockFile::create(path, total_sectors as u64 * SECTOR as u64, SECTOR).unwrap();

    let mut boot = vec![0u8; SECTOR as usize];
    bpb.write_to(&mut boot);
    file.write(0, &boot).unwrap();

    // Root directory's cluster is freshly allocated; mark it end-of-chain
    // before the volume scans the FAT to rebuild its free map.
    let fat_start = reserved_sectors as u64 * SECTOR as u64;
    file.write(fat_start + 2 * 4, &0x0FFF_FFFFu32.to_le_bytes()).unwrap();
    file.flush().unwrap();
}

#[test]
fn create_write_and_reopen_a_fat32_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    format_fat32_image(&path, 4096);

    {
        let container = BlockFile::open(&path, false, Some(SECTOR)).unwrap();
        let mut volume = Volume::mount(container, OpenOptions::default()).unwrap();
        volume.cp_into("readme.txt", b"hello from a real file").unwrap();
        volume.flush().unwrap();
    }

    // Reopen from scratch: everything must have actually hit disk.
    let container = BlockFile::open(&path, true, Some(SECTOR)).unwrap();
    let mut volume = Volume::mount(container, OpenOptions { read_only: true, ..OpenOptions::default() }).unwrap();

    let entries = volume.ls("/").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "readme.txt");
    assert_eq!(volume.cat("readme.txt").unwrap(), b"hello from a real file");
}

#[test]
fn read_only_volume_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    format_fat32_image(&path, 256);

    let container = BlockFile::open(&path, true, Some(SECTOR)).unwrap();
    let mut volume = Volume::mount(container, OpenOptions::default()).unwrap();
    assert!(volume.cp_into("a.txt", b"nope").is_err());
}

fn format_fat16_image(path: &std::path::Path, total_clusters: u32) {
    let sectors_per_cluster = 4u8; // 2 KiB clusters
    let root_entry_count = 512u16;
    let root_dir_sectors = (root_entry_count as u32 * 32).div_ceil(SECTOR as u32);
    let fat_size_16 = ((total_clusters + FIRST_DATA_CLUSTER) * 2).div_ceil(SECTOR as u32);
    let reserved_sectors = 1u16;
    let num_fats = 1u8;
    let data_sectors = total_clusters * sectors_per_cluster as u32;
    let total_sectors = reserved_sectors as u32 + num_fats as u32 * fat_size_16 + root_dir_sectors + data_sectors;

    let bpb = BiosParameterBlock {
        bytes_per_sector: SECTOR,
        sectors_per_cluster,
        reserved_sectors,
        num_fats,
        root_entry_count,
        total_sectors_16: if total_sectors <= u16::MAX as u32 { total_sectors as u16 } else { 0 },
        media_descriptor: 0xF8,
        fat_size_16: fat_size_16 as u16,
        sectors_per_track: 63,
        num_heads: 255,
        hidden_sectors: 0,
        total_sectors_32: if total_sectors > u16::MAX as u32 { total_sectors } else { 0 },
        fat_size_32: 0,
        ext_flags: 0,
        fs_version: 0,
        root_cluster: 0,
        fs_info_sector: 0,
        backup_boot_sector: 0,
        drive_number: 0x80,
        volume_id: 0x2468_ACE0,
        volume_label: *b"FAT16TEST  ",
        fs_type: *b"FAT16   ",
    };

    let mut file = BlockFile::create(path, total_sectors as u64 * SECTOR as u64, SECTOR).unwrap();
    let mut boot = vec![0u8; SECTOR as usize];
    bpb.write_to(&mut boot);
    file.write(0, &boot).unwrap();
    file.flush().unwrap();
}

/// Format FAT16 with 2 KiB clusters, write `/a.txt`, close, reopen
/// read-only, and confirm the fixed-region root directory survives the
/// round trip.
#[test]
fn fat16_fixed_root_directory_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    format_fat16_image(&path, 5000);

    {
        let container = BlockFile::open(&path, false, Some(SECTOR)).unwrap();
        let mut volume = Volume::mount(container, OpenOptions::default()).unwrap();
        volume.cp_into("a.txt", b"hello\n").unwrap();
        volume.flush().unwrap();
    }

    let container = BlockFile::open(&path, true, Some(SECTOR)).unwrap();
    let mut volume = Volume::mount(container, OpenOptions { read_only: true, ..OpenOptions::default() }).unwrap();

    let entries = volume.ls("/").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "a.txt");
    assert_eq!(entries[0].file_size, 6);
    assert_eq!(volume.cat("a.txt").unwrap(), b"hello\n");
}
