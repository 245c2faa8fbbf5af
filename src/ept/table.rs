//! The identity-mapped EPT paging structures themselves.
//!
//! Physical memory up to 512GB is mapped 1:1 as guest-physical == host-
//! physical at 2MB granularity, built once at virtualization time from the
//! MTRR map. Individual 2MB entries are split into a 4KB `PML1` table only
//! when a hook needs page-granular control (see [`crate::ept::hooks`]).
//!
//! Grounded on `EPT_STATE`/`VMM_EPT_PAGE_TABLE`/`EptAllocateAndCreateIdentityPageTable`
//! (`Ept.h`), and the `NestedPagingStructureEntry` bitfield idiom from the
//! underlying hardware-VT layer.

use crate::{
    config::{EPT_ENTRY_COUNT, PAGE_SIZE, SIZE_2MB},
    error::{HvError, HvResult},
    ept::mtrr::{self, MemoryType, MtrrRangeDescriptor},
};
use alloc::boxed::Box;
use bitfield::bitfield;

bitfield! {
    /// An Intel EPT paging-structure entry, valid at every level (PML4E,
    /// PDPTE, PDE, and the PTE produced once a PDE is split).
    ///
    /// See: Intel SDM Vol 3C, 28.2.2 through 28.2.5.
    #[derive(Clone, Copy)]
    pub struct EptEntry(u64);
    impl Debug;
    pub read, set_read: 0;
    pub write, set_write: 1;
    pub execute, set_execute: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub ignore_pat, set_ignore_pat: 6;
    pub large_page, set_large_page: 7;
    pub accessed, set_accessed: 8;
    pub dirty, set_dirty: 9;
    pub pfn, set_pfn: 51, 12;
    pub suppress_ve, set_suppress_ve: 63;
}

impl EptEntry {
    /// Physical address this entry ultimately refers to (the next table,
    /// or the final page frame for a leaf entry).
    pub fn address(&self) -> u64 {
        self.pfn() << 12
    }

    fn set_address(&mut self, physical_address: u64) {
        self.set_pfn(physical_address >> 12);
    }

    fn rwx(memory_type: MemoryType) -> Self {
        let mut entry = EptEntry(0);
        entry.set_read(true);
        entry.set_write(true);
        entry.set_execute(true);
        entry.set_memory_type(memory_type as u64);
        entry
    }
}

/// A page-aligned array of 512 EPT entries, one paging-structure page.
#[repr(C, align(4096))]
#[derive(Clone, Copy)]
pub struct EptStructure {
    pub entries: [EptEntry; EPT_ENTRY_COUNT],
}
const _: () = assert!(core::mem::size_of::<EptStructure>() == PAGE_SIZE);

impl Default for EptStructure {
    fn default() -> Self {
        Self {
            entries: [EptEntry(0); EPT_ENTRY_COUNT],
        }
    }
}

/// The full identity-mapped EPT hierarchy for one EPT pointer (a logical
/// processor may own a primary and a secondary table per `EPT_STATE`).
///
/// Mirrors `VMM_EPT_PAGE_TABLE`: a single 512GB PML4 region, described by
/// one `PML3` page of 512 1GB pointers and a `PML2` page per `PML3` entry
/// (512 pages of 512 2MB leaves each).
pub struct EptPageTable {
    pml4: Box<EptStructure>,
    pml3: Box<EptStructure>,
    pml2: Box<[EptStructure; EPT_ENTRY_COUNT]>,
}

impl EptPageTable {
    /// Allocates an empty (zeroed) table. Call [`Self::build_identity_map`]
    /// before using it for translation.
    pub fn new() -> Self {
        Self {
            pml4: Box::new(EptStructure::default()),
            pml3: Box::new(EptStructure::default()),
            pml2: Box::new([EptStructure::default(); EPT_ENTRY_COUNT]),
        }
    }

    /// Physical address of the PML4 page, i.e. the value to program into
    /// the EPT pointer VMCS field (shifted and OR'd with walk-length and
    /// memory-type bits by the caller).
    pub fn pml4_physical_address(&self) -> u64 {
        &*self.pml4 as *const EptStructure as u64
    }

    /// Builds the flat 1:1 mapping of the first 512GB of physical memory,
    /// typing each 2MB page from the MTRR map.
    ///
    /// Mirrors `EptAllocateAndCreateIdentityPageTable` plus the per-page
    /// `EptSetupPML2Entry` loop.
    pub fn build_identity_map(&mut self, ranges: &[MtrrRangeDescriptor]) {
        let mut pml4e = EptEntry::rwx(MemoryType::WriteBack);
        pml4e.set_address(&*self.pml3 as *const EptStructure as u64);
        self.pml4.entries[0] = pml4e;

        for (pdpt_index, pml3e) in self.pml3.entries.iter_mut().enumerate() {
            let pml2_page = &mut self.pml2[pdpt_index];
            let mut entry = EptEntry::rwx(MemoryType::WriteBack);
            entry.set_address(pml2_page as *const EptStructure as u64);
            *pml3e = entry;

            for (pd_index, pde) in pml2_page.entries.iter_mut().enumerate() {
                let physical_address = (pdpt_index as u64) * (1 << 30) + (pd_index as u64) * SIZE_2MB as u64;
                let memory_type = mtrr::memory_type_for_page(ranges, physical_address, SIZE_2MB as u64);
                let mut leaf = EptEntry::rwx(memory_type);
                leaf.set_large_page(true);
                leaf.set_address(physical_address);
                *pde = leaf;
            }
        }
    }

    /// Returns the PML2 (2MB-granularity) entry covering `physical_address`.
    ///
    /// Mirrors `EptGetPml2Entry`.
    pub fn pml2_entry_mut(&mut self, physical_address: u64) -> &mut EptEntry {
        let pdpt_index = ((physical_address >> 30) & 0x1ff) as usize;
        let pd_index = ((physical_address >> 21) & 0x1ff) as usize;
        &mut self.pml2[pdpt_index].entries[pd_index]
    }

    /// Returns the PML1 (4KB-granularity) entry covering `physical_address`
    /// within an already-split `PML2` entry's 4KB table.
    ///
    /// Mirrors `EptGetPml1Entry`: the PML2 entry must already have been
    /// split (i.e. `large_page()` is false and its address points at a
    /// `PML1` page), or this returns `None`.
    pub fn pml1_entry_mut(&mut self, physical_address: u64) -> Option<&mut EptEntry> {
        let pml2e = self.pml2_entry_mut(physical_address);
        if pml2e.large_page() {
            return None;
        }
        let pml1_index = ((physical_address >> 12) & 0x1ff) as usize;
        let pml1_table = pml2e.address() as *mut EptStructure;
        // Safety: a non-large PML2 entry's address was set by
        // `split_large_page` to a live `EptStructure` that outlives this
        // table.
        let pml1_table = unsafe { &mut *pml1_table };
        Some(&mut pml1_table.entries[pml1_index])
    }

    /// Splits the 2MB PML2 entry covering `physical_address` into 512 4KB
    /// PML1 entries using caller-provided, pre-reserved storage, preserving
    /// the original entry's permissions and memory type on every new leaf.
    ///
    /// Mirrors `EptSplitLargePage`.
    pub fn split_large_page(&mut self, split_table: &mut EptStructure, physical_address: u64) -> HvResult<()> {
        let aligned = physical_address & !(SIZE_2MB as u64 - 1);
        let pml2e = self.pml2_entry_mut(aligned);
        if !pml2e.large_page() {
            return Err(HvError::UnsplitFailed);
        }
        let memory_type = pml2e.memory_type();
        let base = pml2e.address();

        for (index, pml1e) in split_table.entries.iter_mut().enumerate() {
            let mut entry = EptEntry(0);
            entry.set_read(true);
            entry.set_write(true);
            entry.set_execute(true);
            entry.set_memory_type(memory_type);
            entry.set_address(base + (index as u64) * PAGE_SIZE as u64);
            *pml1e = entry;
        }

        let mut pointer = EptEntry(0);
        pointer.set_read(true);
        pointer.set_write(true);
        pointer.set_execute(true);
        pointer.set_address(split_table as *const EptStructure as u64);
        *pml2e = pointer;
        Ok(())
    }
}

impl Default for EptPageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn identity_map_translates_every_pml2_leaf_1_to_1() {
        let mut table = EptPageTable::new();
        table.build_identity_map(&[]);
        for gpa in [0u64, SIZE_2MB as u64, 10 * SIZE_2MB as u64] {
            let entry = table.pml2_entry_mut(gpa);
            assert!(entry.large_page());
            assert_eq!(entry.address(), gpa & !(SIZE_2MB as u64 - 1));
            assert!(entry.read() && entry.write() && entry.execute());
        }
    }
}
