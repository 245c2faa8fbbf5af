//! Safe(r) physical-memory access from inside a guest's address space.
//!
//! Reading or writing an arbitrary guest physical address cannot simply
//! dereference a pointer: the mapping has to be walked through the target
//! process's own page tables, because the identity-mapped EPT view only
//! describes guest-physical memory, not guest-virtual addresses. Each core
//! keeps one reserved virtual-address/PTE pair (`PerCoreReservedMapping`)
//! that `map_physical_to_pte` repoints on demand, so no allocation is needed
//! on the hot path.
//!
//! Grounded on `header/common/MemoryMapper.h` and
//! `header/memory/MemoryMapper.h`.

use crate::{
    config::PAGE_SIZE,
    error::{HvError, HvResult},
};
use bitfield::bitfield;

/// Level of the 4-level x86-64 paging hierarchy being walked, named after
/// the original's `PML` enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagingLevel {
    /// Page table (4KB leaves).
    Pt,
    /// Page directory (2MB leaves or a pointer to a `Pt`).
    Pd,
    /// Page directory pointer table (1GB leaves or a pointer to a `Pd`).
    Pdpt,
    /// Page map level 4 (always points at a `Pdpt`).
    Pml4,
}

bitfield! {
    /// A generic x86-64 paging-structure entry, laid out identically at
    /// every level for the fields this crate actually inspects.
    #[derive(Clone, Copy)]
    pub struct PageTableEntry(u64);
    impl Debug;
    pub present, set_present: 0;
    pub writable, set_writable: 1;
    pub user, set_user: 2;
    pub large_page, set_large_page: 7;
    pub pfn, set_pfn: 51, 12;
    pub execute_disable, set_execute_disable: 63;
}

impl PageTableEntry {
    /// Physical address this entry points at (next table, or final page).
    pub fn address(&self) -> u64 {
        self.pfn() << 12
    }
}

/// One core's reserved virtual-address window used to read or write a
/// physical address by repointing a private PTE.
///
/// Mirrors `MEMORY_MAPPER_ADDRESSES`.
#[derive(Debug)]
pub struct PerCoreReservedMapping {
    /// Kernel virtual address of the PTE controlling `virtual_address`.
    pte_virtual_address: u64,
    /// The reserved kernel virtual address itself.
    virtual_address: u64,
}

impl PerCoreReservedMapping {
    /// Builds a reserved-mapping descriptor from addresses the host
    /// allocated (e.g. via `MmAllocateMappingAddress`).
    pub const fn new(pte_virtual_address: u64, virtual_address: u64) -> Self {
        Self {
            pte_virtual_address,
            virtual_address,
        }
    }

    /// Repoints this core's reserved PTE at `physical_address` and returns
    /// the virtual address it is now reachable through.
    ///
    /// # Safety
    /// `pte_virtual_address` must reference a live, core-private PTE slot,
    /// and the caller must not race another access through the same core's
    /// reserved window.
    pub unsafe fn map_physical_to_pte(&self, physical_address: u64, writable: bool) -> u64 {
        // Safety: delegated to the caller.
        let pte = unsafe { &mut *(self.pte_virtual_address as *mut PageTableEntry) };
        pte.set_pfn(physical_address >> 12);
        pte.set_present(true);
        pte.set_writable(writable);
        invlpg(self.virtual_address);
        self.virtual_address | (physical_address & 0xfff)
    }
}

fn invlpg(va: u64) {
    // Safety: this project runs at CPL0.
    unsafe { core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack)) };
}

/// Walks `cr3`'s paging hierarchy down to `level` and returns the live PTE
/// covering `virtual_address`, or `None` if a level along the way is not
/// present.
///
/// # Safety
/// `cr3` must name a page table that is currently mapped into the kernel's
/// address space at its physical identity (true while the host has not
/// exited EPT-backed identity mapping).
pub unsafe fn get_pte(virtual_address: u64, level: PagingLevel, cr3: u64) -> HvResult<*mut PageTableEntry> {
    let pml4_index = (virtual_address >> 39) & 0x1ff;
    let pdpt_index = (virtual_address >> 30) & 0x1ff;
    let pd_index = (virtual_address >> 21) & 0x1ff;
    let pt_index = (virtual_address >> 12) & 0x1ff;

    // Safety: delegated to the caller; `cr3 & !0xfff` is the PML4 base.
    let pml4e = unsafe { &*(((cr3 & !0xfff) + pml4_index * 8) as *const PageTableEntry) };
    if !pml4e.present() {
        return Err(HvError::NotPresent);
    }
    if matches!(level, PagingLevel::Pml4) {
        return Ok(pml4e as *const _ as *mut _);
    }

    // Safety: same as above, one level down.
    let pdpte = unsafe { &*((pml4e.address() + pdpt_index * 8) as *const PageTableEntry) };
    if !pdpte.present() {
        return Err(HvError::NotPresent);
    }
    if matches!(level, PagingLevel::Pdpt) || pdpte.large_page() {
        return Ok(pdpte as *const _ as *mut _);
    }

    // Safety: same as above, one level down.
    let pde = unsafe { &*((pdpte.address() + pd_index * 8) as *const PageTableEntry) };
    if !pde.present() {
        return Err(HvError::NotPresent);
    }
    if matches!(level, PagingLevel::Pd) || pde.large_page() {
        return Ok(pde as *const _ as *mut _);
    }

    // Safety: same as above, one level down.
    let pte = unsafe { &*((pde.address() + pt_index * 8) as *const PageTableEntry) };
    if !pte.present() {
        return Err(HvError::NotPresent);
    }
    Ok(pte as *const _ as *mut _)
}

/// Reads `len` bytes (at most one page) from `physical_address` into `out`
/// using `mapping`'s reserved window.
///
/// # Safety
/// See [`PerCoreReservedMapping::map_physical_to_pte`]; additionally `out`
/// must be valid for `len` writes and `len <= PAGE_SIZE`.
pub unsafe fn read_safe(mapping: &PerCoreReservedMapping, physical_address: u64, out: &mut [u8]) -> HvResult<()> {
    if out.len() > PAGE_SIZE {
        return Err(HvError::OutOfRange);
    }
    // Safety: delegated to the caller.
    let va = unsafe { mapping.map_physical_to_pte(physical_address, false) };
    // Safety: `va` was just mapped readable for at least one page.
    let src = unsafe { core::slice::from_raw_parts(va as *const u8, out.len()) };
    out.copy_from_slice(src);
    Ok(())
}

/// Writes `data` to `physical_address` using `mapping`'s reserved window.
///
/// # Safety
/// See [`read_safe`].
pub unsafe fn write_safe(mapping: &PerCoreReservedMapping, physical_address: u64, data: &[u8]) -> HvResult<()> {
    if data.len() > PAGE_SIZE {
        return Err(HvError::OutOfRange);
    }
    // Safety: delegated to the caller.
    let va = unsafe { mapping.map_physical_to_pte(physical_address, true) };
    // Safety: `va` was just mapped writable for at least one page.
    let dst = unsafe { core::slice::from_raw_parts_mut(va as *mut u8, data.len()) };
    dst.copy_from_slice(data);
    Ok(())
}
