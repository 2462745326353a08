//! End-to-end scenarios across subsystems
//!
//! These run on the host: the frame allocator is seeded with a real heap
//! buffer whose addresses stand in for physical memory, which satisfies
//! the identity-map assumption the kernel makes on hardware.

#![cfg(all(test, not(target_os = "none")))]

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use crate::block::{self, partition, ramdisk::RamDisk, BlockDevice, SECTOR_SIZE};
use crate::bootinfo::{self, MemoryMap};
use crate::error::KernelError;
use crate::fs;
use crate::mm::pmm::test_pool;
use crate::mm::{FrameBitmap, PhysicalAddress, VirtualAddress, FRAME_SIZE};
use crate::mm::vmm::{AddressSpace, PageFlags, IDENTITY_MAP_BYTES};
use crate::shell::Shell;

fn sh(shell: &mut Shell, line: &str) -> String {
    let mut out = String::new();
    shell.exec(line, &mut out).unwrap();
    out
}

/// Boot memory reporting from a legacy memory map.
#[test]
fn s1_boot_memory_reporting() {
    // one usable region above 1 MiB, the low megabyte reserved
    let mut map = MemoryMap::empty();
    map.note_reserved(0x0, 0x10_0000);
    map.add_usable(0x10_0000, 0x7EF_0000);

    let mut pmm = std::boxed::Box::new(FrameBitmap::new());
    pmm.init(&map);

    assert!(pmm.total_physical_bytes() >= 0x7FF_0000);
    assert_eq!(pmm.total_usable_bytes(), 0x7EF_0000);
    assert_eq!(pmm.free_bytes(), 0x7EF_0000);

    pmm.reserve(0x10_0000, 0x1000);
    assert_eq!(pmm.free_bytes(), 0x7EF_0000 - 0x1000);
}

/// The same scenario through the multiboot2 blob parser.
#[test]
fn s1_via_boot_blob() {
    let mut blob = vec![0u8; 8];
    let mut payload = std::vec::Vec::new();
    payload.extend_from_slice(&24u32.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    for (base, len, kind) in [(0u64, 0x10_0000u64, 2u32), (0x10_0000, 0x7EF_0000, 1)] {
        payload.extend_from_slice(&base.to_le_bytes());
        payload.extend_from_slice(&len.to_le_bytes());
        payload.extend_from_slice(&kind.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
    }
    blob.extend_from_slice(&bootinfo::TAG_MMAP.to_le_bytes());
    blob.extend_from_slice(&(8 + payload.len() as u32).to_le_bytes());
    blob.extend_from_slice(&payload);
    while blob.len() % 8 != 0 {
        blob.push(0);
    }
    blob.extend_from_slice(&[0u8; 8]); // end tag
    let total = blob.len() as u32;
    blob[0..4].copy_from_slice(&total.to_le_bytes());

    let info = bootinfo::parse_slice(&blob, false);
    let mut pmm = std::boxed::Box::new(FrameBitmap::new());
    pmm.init(&info.memory_map);
    assert!(pmm.total_physical_bytes() >= 0x7FF_0000);
    assert_eq!(pmm.free_bytes(), 0x7EF_0000);
}

/// Identity mapping translates the first gigabyte and nothing beyond.
#[test]
fn s2_identity_translation() {
    let (mut pmm, _region) = test_pool::private_pool(4 * 1024 * 1024);
    let space = AddressSpace::init_identity(&mut pmm).unwrap();

    assert_eq!(
        space
            .translate(VirtualAddress::new(0x20_0000))
            .unwrap()
            .as_u64(),
        0x20_0000
    );
    assert_eq!(
        space
            .translate(VirtualAddress::new(0x3FFF_FFFF))
            .unwrap()
            .as_u64(),
        0x3FFF_FFFF
    );
    assert_eq!(
        space.translate(VirtualAddress::new(IDENTITY_MAP_BYTES)),
        Err(KernelError::NotMapped)
    );
}

/// VMM round trip at page granularity.
#[test]
fn vmm_map_round_trip_property() {
    let (mut pmm, _region) = test_pool::private_pool(512 * 1024);
    let mut space = AddressSpace::new(&mut pmm).unwrap();
    let va = VirtualAddress::new(0x7000_0000);
    let pa = PhysicalAddress::new(0x9_5000);
    space
        .map_page(va, pa, PageFlags::PRESENT | PageFlags::WRITABLE, &mut pmm)
        .unwrap();
    for k in (0..FRAME_SIZE).step_by(509) {
        assert_eq!(
            space
                .translate(VirtualAddress::new(va.as_u64() + k))
                .unwrap()
                .as_u64(),
            pa.as_u64() + k
        );
    }
    space.unmap_page(va).unwrap();
    assert_eq!(space.translate(va), Err(KernelError::NotMapped));
}

/// Scheduler round-robin fairness is covered in `sched::tests`, which
/// serializes access to the global thread table; here we only assert the
/// public snapshot surface stays coherent from another thread.
#[test]
fn s3_thread_snapshot_surface() {
    let _guard = crate::sched::test_guard();
    let mut info = [crate::sched::ThreadInfo {
        id: 0,
        state: crate::sched::ThreadState::Done,
        stack_pointer: 0,
    }; crate::sched::MAX_THREADS];
    let count = crate::sched::threads(&mut info);
    assert!(count <= crate::sched::MAX_THREADS);
    assert_eq!(crate::sched::current_id(), None);
}

/// MBR scan: a partition device mirrors the parent at an offset.
#[test]
fn s4_mbr_scan_round_trip() {
    test_pool::init_global();

    let disk = RamDisk::create("s4ram0", 1024 * 1024).unwrap();
    let mut mbr = vec![0u8; SECTOR_SIZE];
    mbr[446 + 4] = 0x07;
    mbr[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
    mbr[446 + 12..446 + 16].copy_from_slice(&2047u32.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    disk.write_sectors(0, &mbr).unwrap();

    let mut payload = vec![0u8; SECTOR_SIZE];
    payload[..8].copy_from_slice(b"SECTOR01");
    disk.write_sectors(1, &payload).unwrap();

    partition::scan();
    let part = block::find("s4ram0p1").expect("partition registered");
    assert_eq!(part.sector_count(), 2047);

    let mut via_part = vec![0u8; SECTOR_SIZE];
    part.read_sectors(0, &mut via_part).unwrap();
    let mut via_parent = vec![0u8; SECTOR_SIZE];
    disk.read_sectors(1, &mut via_parent).unwrap();
    assert_eq!(via_part, via_parent);
    assert_eq!(&via_part[..8], b"SECTOR01");

    let mut buf = vec![0u8; SECTOR_SIZE];
    assert!(part.read_sectors(2047, &mut buf).is_err());
}

/// Full shell session: mkfs, mount, touch, write, cat, stat.
#[test]
fn s5_exfat_shell_round_trip() {
    let _guard = fs::mount_test_guard();
    test_pool::init_global();
    fs::devfs::register();
    fs::exfat::register();

    let mut shell = Shell::new();
    sh(&mut shell, "mkram s5ram0 800000"); // 8 MiB
    assert!(!sh(&mut shell, "mkfs exfat s5ram0").contains("error"));
    assert!(sh(&mut shell, "mount exfat s5root s5ram0").contains("mounted"));

    sh(&mut shell, "touch /hello.txt");
    sh(&mut shell, "write /hello.txt \"Hello, world!\"");
    assert_eq!(sh(&mut shell, "cat /hello.txt"), "Hello, world!\n");

    let stat = sh(&mut shell, "stat /hello.txt");
    assert!(stat.contains("size 0xd"), "{stat}");
    assert!(stat.contains("type file"), "{stat}");

    // property: fill then read back the repeated byte
    sh(&mut shell, "fill /f.bin 1100 Z");
    let cat = sh(&mut shell, "cat /f.bin");
    assert_eq!(cat.trim_end().len(), 0x1100);
    assert!(cat.trim_end().bytes().all(|b| b == b'Z'));

    fs::umount("s5root").unwrap();
}

/// Error surface: each failure is a distinct, reported error.
#[test]
fn s6_vfs_error_surface() {
    let _guard = fs::mount_test_guard();
    test_pool::init_global();
    fs::devfs::register();
    fs::exfat::register();

    // unknown driver
    assert_eq!(fs::mount("xfs", "s6root", Some("s6ram0")), Err(KernelError::NotFound));

    // missing device for a device-backed fs
    assert_eq!(
        fs::mount("exfat", "s6root", Some("no-such-disk")),
        Err(KernelError::NotFound)
    );

    fs::mount("devfs", "s6dev", None).unwrap();

    // open of a missing node
    assert_eq!(fs::open("s6dev:/missing").unwrap_err(), KernelError::NotFound);

    // create on a filesystem without create support
    assert_eq!(
        fs::create("s6dev:/newfile").unwrap_err(),
        KernelError::PermissionDenied
    );

    // write to a node whose device refuses writes
    let module: &'static mut [u8] = std::vec![0u8; 2 * SECTOR_SIZE].leak();
    let base = module.as_ptr() as u64;
    // SAFETY: leaked buffer lives forever; read-only registration.
    unsafe {
        crate::block::memdisk::MemDisk::register(
            "s6mod0",
            base,
            2 * SECTOR_SIZE as u64,
            SECTOR_SIZE,
            false,
        )
        .unwrap();
    }
    let node = fs::open("s6dev:/s6mod0").unwrap();
    assert_eq!(node.write(0, b"x").unwrap_err(), KernelError::PermissionDenied);

    fs::umount("s6dev").unwrap();
}

/// VFS write/read property over a writable filesystem.
#[test]
fn vfs_write_read_property() {
    let _guard = fs::mount_test_guard();
    test_pool::init_global();
    fs::exfat::register();

    let disk = RamDisk::create("vfsprop0", 2 * 1024 * 1024).unwrap();
    crate::fs::exfat::mkfs::format(&(disk.clone() as Arc<dyn BlockDevice>), None).unwrap();
    fs::mount("exfat", "vfsp", Some("vfsprop0")).unwrap();

    fs::create("vfsp:/data.bin").unwrap();
    let node = fs::open("vfsp:/data.bin").unwrap();

    for (offset, len) in [(0u64, 33usize), (500, 1024), (100, 700)] {
        let data: std::vec::Vec<u8> = (0..len).map(|i| ((i + offset as usize) % 256) as u8).collect();
        node.write(offset, &data).unwrap();
        let mut back = vec![0u8; len];
        assert_eq!(node.read(offset, &mut back).unwrap(), len);
        assert_eq!(back, data);
    }

    // directory enumeration sees the file exactly once
    let root = fs::open("vfsp:/").unwrap();
    let mut hits = 0;
    let mut index = 0;
    while let Some(name) = root.readdir(index).unwrap() {
        if name == "data.bin" {
            hits += 1;
        }
        index += 1;
    }
    assert_eq!(hits, 1);

    fs::umount("vfsp").unwrap();
}
