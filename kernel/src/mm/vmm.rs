//! Virtual memory manager
//!
//! Intel 4-level paging with 4 KiB pages. Table frames come from the
//! frame allocator and are written through the identity mapping, which the
//! loader guarantees during bootstrap and [`AddressSpace::init_identity`]
//! re-establishes for the first gigabyte before the root is switched in.

use bitflags::bitflags;

use crate::error::KernelError;
use crate::mm::{FrameBitmap, PhysicalAddress, VirtualAddress, FRAME_SIZE};

/// Entries per table at every level.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Span of the bootstrap identity mapping.
pub const IDENTITY_MAP_BYTES: u64 = 1 << 30;

bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        /// Large/huge leaf at PD/PDPT level. Never set on a final PTE
        /// here; map_page masks it off.
        const PAGE_SIZE = 1 << 7;
        const NO_EXECUTE = 1 << 63;
    }
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// One 64-bit page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct PageTableEntry(u64);

impl PageTableEntry {
    const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    const fn addr(self) -> u64 {
        self.0 & ADDR_MASK
    }
}

/// Table indices for a canonical virtual address, root first.
fn table_indices(va: VirtualAddress) -> [usize; 4] {
    let va = va.as_u64();
    [
        ((va >> 39) & 0x1FF) as usize,
        ((va >> 30) & 0x1FF) as usize,
        ((va >> 21) & 0x1FF) as usize,
        ((va >> 12) & 0x1FF) as usize,
    ]
}

/// Allocate a frame and zero it for use as a page table.
fn alloc_table(pmm: &mut FrameBitmap) -> Result<u64, KernelError> {
    let frame = pmm.alloc_frames(1)?;
    // SAFETY: the frame was just handed out by the allocator, is
    // frame-aligned, and is reachable through the identity mapping.
    unsafe { core::ptr::write_bytes(frame.as_u64() as *mut u8, 0, FRAME_SIZE as usize) };
    Ok(frame.as_u64())
}

fn flush_tlb(_va: VirtualAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(_va.as_u64()));
}

/// A 4-level page table tree rooted at one physical frame.
pub struct AddressSpace {
    root: PhysicalAddress,
}

impl AddressSpace {
    /// Allocate an empty address space.
    pub fn new(pmm: &mut FrameBitmap) -> Result<Self, KernelError> {
        let root = alloc_table(pmm)?;
        Ok(Self {
            root: PhysicalAddress::new(root),
        })
    }

    /// Physical address of the root table (the CR3 value).
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Build an address space identity-mapping `[0, 1 GiB)` with 4 KiB
    /// pages, Present|Writable. The caller loads it with
    /// [`AddressSpace::activate`] once its own image is covered.
    pub fn init_identity(pmm: &mut FrameBitmap) -> Result<Self, KernelError> {
        let mut space = Self::new(pmm)?;
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        let mut addr = 0;
        while addr < IDENTITY_MAP_BYTES {
            space.map_page(
                VirtualAddress::new(addr),
                PhysicalAddress::new(addr),
                flags,
                pmm,
            )?;
            addr += FRAME_SIZE;
        }
        Ok(space)
    }

    /// Walk to the final-level entry for `va`.
    ///
    /// With `create`, missing intermediate tables are allocated, zeroed
    /// and installed Present|Writable; without it an absent level yields
    /// `NotMapped`. Allocation failure yields `OutOfMemory`.
    fn entry_ptr(
        &self,
        va: VirtualAddress,
        create: bool,
        pmm: Option<&mut FrameBitmap>,
    ) -> Result<*mut PageTableEntry, KernelError> {
        let indices = table_indices(va);
        let mut table = self.root.as_u64();
        let mut pmm = pmm;

        for &index in indices.iter().take(3) {
            // SAFETY: `table` is a frame-aligned table address reachable
            // through the identity mapping; index < 512.
            let slot = unsafe { (table as *mut PageTableEntry).add(index) };
            // SAFETY: as above, the slot is within the table frame.
            let entry = unsafe { slot.read() };
            if entry.is_present() {
                table = entry.addr();
                continue;
            }
            if !create {
                return Err(KernelError::NotMapped);
            }
            let Some(ref mut pmm) = pmm else {
                return Err(KernelError::OutOfMemory);
            };
            let new_table = alloc_table(pmm)?;
            let flags = PageFlags::PRESENT | PageFlags::WRITABLE;
            // SAFETY: slot is valid per above; the new table frame is
            // exclusively ours.
            unsafe { slot.write(PageTableEntry(new_table | flags.bits())) };
            table = new_table;
        }

        // SAFETY: final-level table address from a Present entry (or just
        // installed); index < 512.
        Ok(unsafe { (table as *mut PageTableEntry).add(indices[3]) })
    }

    /// Map the page containing `va` to the frame at `pa`.
    ///
    /// `PAGE_SIZE` is masked off so the entry is always a 4 KiB leaf. The
    /// TLB entry for `va` is invalidated.
    pub fn map_page(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
        pmm: &mut FrameBitmap,
    ) -> Result<(), KernelError> {
        let pte = self.entry_ptr(va, true, Some(pmm))?;
        let value = (pa.as_u64() & !(FRAME_SIZE - 1)) | (flags & !PageFlags::PAGE_SIZE).bits();
        // SAFETY: entry_ptr returned a valid final-level slot.
        unsafe { pte.write(PageTableEntry(value)) };
        flush_tlb(va);
        Ok(())
    }

    /// Remove the mapping for the page containing `va`.
    pub fn unmap_page(&mut self, va: VirtualAddress) -> Result<(), KernelError> {
        let pte = self.entry_ptr(va, false, None)?;
        // SAFETY: entry_ptr returned a valid final-level slot.
        let entry = unsafe { pte.read() };
        if !entry.is_present() {
            return Err(KernelError::NotMapped);
        }
        // SAFETY: as above.
        unsafe { pte.write(PageTableEntry(0)) };
        flush_tlb(va);
        Ok(())
    }

    /// Translate a virtual address through the tree without creating
    /// anything.
    pub fn translate(&self, va: VirtualAddress) -> Result<PhysicalAddress, KernelError> {
        let pte = self.entry_ptr(va, false, None)?;
        // SAFETY: entry_ptr returned a valid final-level slot.
        let entry = unsafe { pte.read() };
        if !entry.is_present() {
            return Err(KernelError::NotMapped);
        }
        Ok(PhysicalAddress::new(entry.addr() | va.page_offset()))
    }

    /// Load this address space into the page-table base register.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn activate(&self) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        use x86_64::PhysAddr;

        let frame = PhysFrame::containing_address(PhysAddr::new(self.root.as_u64()));
        // SAFETY: the tree identity-maps the kernel image, stack and its
        // own tables, so execution continues across the switch.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
}
