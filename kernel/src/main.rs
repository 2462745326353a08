//! Kernel binary entry point
//!
//! The loader shim enters `_start` in 64-bit mode with paging on, the
//! first gigabyte identity-mapped, the Multiboot2 information pointer in
//! the first argument register and a UEFI flag in the second. Boot order:
//! consoles, boot-info, PMM (plus reservations), identity paging, heap,
//! block/VFS registration, then the shell thread under the scheduler.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod boot {
    use onyx_kernel::block::{memdisk::MemDisk, partition, SECTOR_SIZE};
    use onyx_kernel::bootinfo;
    use onyx_kernel::fs;
    use onyx_kernel::mm::vmm::AddressSpace;
    use onyx_kernel::mm::{heap, FrameBitmap, FRAME_SIZE, PMM};
    use onyx_kernel::{logger, println, sched, shell};

    use alloc::format;

    // Linker-provided image bounds.
    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }

    #[no_mangle]
    pub extern "C" fn _start(mb2_info: u64, from_uefi: u64) -> ! {
        kmain(mb2_info, from_uefi != 0)
    }

    fn kmain(mb2_info: u64, from_uefi: bool) -> ! {
        logger::init();
        println!("OnyxOS v{}", env!("CARGO_PKG_VERSION"));

        // SAFETY: the loader hands over a readable Multiboot2 blob (or
        // null, which parse tolerates).
        let info = unsafe { bootinfo::parse(mb2_info as *const u8, from_uefi) };

        {
            let mut pmm = PMM.lock();
            pmm.init(&info.memory_map);

            // the image itself
            // SAFETY: linker symbols delimit the loaded kernel image.
            let (kernel_start, kernel_end) = unsafe {
                (
                    core::ptr::addr_of!(__kernel_start) as u64,
                    core::ptr::addr_of!(__kernel_end) as u64,
                )
            };
            pmm.reserve(kernel_start, kernel_end.saturating_sub(kernel_start));

            // the boot blob, still to be read by later consumers
            if mb2_info != 0 {
                // SAFETY: same blob parse just read.
                let blob_size = unsafe { core::ptr::read_unaligned(mb2_info as *const u32) };
                pmm.reserve(mb2_info, u64::from(blob_size));
            }

            // the loader's page tables, live until the CR3 switch below
            reserve_loader_tables(&mut pmm);

            for module in info.modules() {
                pmm.reserve(u64::from(module.start), module.len());
            }

            println!(
                "[pmm] physical {:#x}, usable {:#x}, free {:#x}",
                pmm.total_physical_bytes(),
                pmm.total_usable_bytes(),
                pmm.free_bytes()
            );
        }

        // own page tables: identity map the first gigabyte and switch
        let _kernel_space = {
            let mut pmm = PMM.lock();
            match AddressSpace::init_identity(&mut pmm) {
                Ok(space) => {
                    space.activate();
                    log::info!(target: "vmm", "identity mapping active, root {:#x}", space.root().as_u64());
                    Some(space)
                }
                Err(e) => {
                    println!("[vmm] identity mapping failed: {e}, staying on loader tables");
                    None
                }
            }
        };

        heap::global::init();

        if let Some(fb) = info.framebuffer {
            log::info!(
                target: "boot",
                "framebuffer {}x{}x{} at {:#x}",
                fb.width,
                fb.height,
                fb.bpp,
                fb.addr
            );
        }

        fs::devfs::register();
        fs::exfat::register();

        // boot modules become read-only block devices
        for (index, module) in info.modules().iter().enumerate() {
            let sectors = module.len() / SECTOR_SIZE as u64;
            if sectors == 0 {
                continue;
            }
            let name = format!("mod{index}");
            // SAFETY: the module range was reserved above and stays
            // mapped through the identity mapping.
            let result = unsafe {
                MemDisk::register(
                    &name,
                    u64::from(module.start),
                    sectors * SECTOR_SIZE as u64,
                    SECTOR_SIZE,
                    false,
                )
            };
            match result {
                Ok(_) => println!("[boot] module {name}: {} ({} sectors)", module.string(), sectors),
                Err(e) => println!("[boot] module {name} skipped: {e}"),
            }
        }
        partition::scan();

        if let Err(e) = fs::mount("devfs", "dev", None) {
            println!("[vfs] devfs mount failed: {e}");
        }

        if let Err(e) = sched::spawn(shell::shell_thread, 0) {
            println!("[sched] cannot spawn shell: {e}");
        }
        sched::start();

        println!("[kernel] all threads finished, halting");
        halt_loop()
    }

    /// Keep the loader's page-table frames out of the allocator until the
    /// kernel switches to its own tables.
    fn reserve_loader_tables(pmm: &mut FrameBitmap) {
        use x86_64::registers::control::Cr3;
        let (frame, _) = Cr3::read();
        reserve_table(pmm, frame.start_address().as_u64(), 4);
    }

    fn reserve_table(pmm: &mut FrameBitmap, table: u64, level: u8) {
        const PRESENT: u64 = 1;
        const LEAF: u64 = 1 << 7;
        const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

        pmm.reserve(table, FRAME_SIZE);
        if level == 1 {
            return;
        }
        for index in 0..512 {
            // SAFETY: the table frame is identity-mapped; index < 512.
            let entry = unsafe { *(table as *const u64).add(index) };
            if entry & PRESENT == 0 || entry & LEAF != 0 {
                continue;
            }
            reserve_table(pmm, entry & ADDR_MASK, level - 1);
        }
    }

    fn halt_loop() -> ! {
        loop {
            x86_64::instructions::hlt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println!("[KERNEL PANIC] {info}");
        onyx_kernel::serial_println!("[KERNEL PANIC] {info}");
        halt_loop()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // the kernel only runs on bare metal; host builds exist for the test
    // suite in the library crate
}
