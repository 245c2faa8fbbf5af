//! The hooking engine built atop the EPT identity map: hidden breakpoints,
//! inline (trampoline) detours, and read/write/execute memory monitors.
//!
//! Grounded on `EPT_HOOKED_PAGE_DETAIL` / `HIDDEN_HOOKS_DETOUR_DETAILS`
//! (`Ept.h`, `Hooks.h`) and `EptHandleEptViolation` /
//! `EptHandleMonitorTrapFlag` / `EptSetPML1AndInvalidateTLB`.

use crate::{
    config::{MAX_HIDDEN_BREAKPOINTS_ON_PAGE, PAGE_SIZE},
    ept::{
        table::{EptEntry, EptPageTable, EptStructure},
        LastViolation, ViolationQualification,
    },
    error::{HvError, HvResult},
    x86_instructions::invept,
};
use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

/// Pre-reserved storage used to split a 2MB page into a 4KB table, handed
/// out by [`crate::pool::RootPool`] under the `Split2MbTo4Kb` intent.
///
/// Mirrors `VMM_EPT_DYNAMIC_SPLIT`.
#[repr(C)]
pub struct DynamicSplit {
    /// The 4KB-granularity table this split produces.
    pub pml1: EptStructure,
    /// Physical address of the 2MB-aligned region this split services,
    /// recorded so the split can be located and reverted on unhook.
    pub serviced_physical_address: u64,
}

/// A page-aligned shadow page, boxed so its address stays fixed even as the
/// `Vec<Installed>` holding its owning [`HookedPageDetail`] reallocates, and
/// so the page itself is eligible to back a PML1 entry (`EptEntry::set_pfn`
/// shifts out the low 12 bits of whatever address it is given).
#[repr(C, align(4096))]
pub struct FakePage(pub [u8; PAGE_SIZE]);
const _: () = assert!(core::mem::size_of::<FakePage>() == PAGE_SIZE);

impl Default for FakePage {
    fn default() -> Self {
        Self([0; PAGE_SIZE])
    }
}

/// Bookkeeping for one hooked 4KB page.
///
/// Mirrors `EPT_HOOKED_PAGE_DETAIL`.
pub struct HookedPageDetail {
    /// Shadow page shown to the guest while the hook is active: a copy of
    /// the real page, patched with whatever the hook kind requires (a
    /// planted `0xCC` for a hidden breakpoint, a trampoline for an inline
    /// detour).
    pub fake_page_contents: Box<FakePage>,
    /// Guest-virtual address the hook was originally requested at.
    pub virtual_address: u64,
    /// Guest-physical address of the real page.
    pub physical_base_address: u64,
    /// Physical address backing `fake_page_contents`.
    pub physical_base_address_of_fake_page_contents: u64,
    /// The live PML1 entry this hook patches.
    pub entry_address: *mut EptEntry,
    /// The entry's value before the hook was installed, restored on unhook.
    pub original_entry: EptEntry,
    /// The entry's value while the hook is active.
    pub changed_entry: EptEntry,
    /// Whether this hook intercepts execution (vs. read/write only).
    pub is_execution_hook: bool,
    /// Whether this hook is a hidden-breakpoint page (vs. a monitor or
    /// inline detour).
    pub is_hidden_breakpoint: bool,
    /// Addresses of the individual breakpoints planted on this page.
    pub breakpoint_addresses: [u64; MAX_HIDDEN_BREAKPOINTS_ON_PAGE],
    /// Original byte under each breakpoint, restored when it is cleared.
    pub previous_bytes_on_breakpoint_addresses: [u8; MAX_HIDDEN_BREAKPOINTS_ON_PAGE],
    /// Number of live entries in `breakpoint_addresses`.
    pub count_of_breakpoints: usize,
    /// Most recent access kind that faulted on this page, used to decide
    /// which permission bit to restore at the next MTF exit.
    pub last_violation: Option<LastViolation>,
}

// Safety: `entry_address` always refers to a PML1 slot owned by the
// `EptPageTable` this hook was installed against, which lives at least as
// long as `VmmContext` and is only mutated under `pml1_modification_lock`.
unsafe impl Send for HookedPageDetail {}

impl HookedPageDetail {
    fn new(virtual_address: u64, physical_base_address: u64, entry_address: *mut EptEntry, original_entry: EptEntry) -> Self {
        let fake_page_contents = Box::new(FakePage::default());
        let physical_base_address_of_fake_page_contents = &*fake_page_contents as *const FakePage as u64;
        Self {
            fake_page_contents,
            virtual_address,
            physical_base_address,
            physical_base_address_of_fake_page_contents,
            entry_address,
            original_entry,
            changed_entry: original_entry,
            is_execution_hook: false,
            is_hidden_breakpoint: false,
            breakpoint_addresses: [0; MAX_HIDDEN_BREAKPOINTS_ON_PAGE],
            previous_bytes_on_breakpoint_addresses: [0; MAX_HIDDEN_BREAKPOINTS_ON_PAGE],
            count_of_breakpoints: 0,
            last_violation: None,
        }
    }
}

/// Bookkeeping for one inline-detour (trampoline) hook.
///
/// Mirrors `HIDDEN_HOOKS_DETOUR_DETAILS`.
pub struct DetourHookDetails {
    /// Address of the function being detoured.
    pub hooked_function_address: u64,
    /// Address execution returns to after the detour's trampoline runs the
    /// original prologue bytes.
    pub return_address: u64,
}

/// A single hidden-breakpoint slot on a page, the unit tracked in
/// `BreakpointAddresses`/`PreviousBytesOnBreakpointAddresses`.
///
/// Mirrors `DEBUGGEE_BP_DESCRIPTOR`.
#[derive(Clone, Copy, Debug)]
pub struct BreakpointDescriptor {
    /// Tag assigned when the breakpoint was planted.
    pub tag: u64,
    /// Guest-virtual address of the breakpoint.
    pub address: u64,
    /// Byte that was present before `0xCC` was written.
    pub previous_byte: u8,
    /// Core that planted the breakpoint.
    pub core_id: u32,
    /// Process the breakpoint applies to, `None` meaning every process.
    pub process_id: Option<u64>,
}

enum HookKind {
    HiddenBreakpoint,
    Monitor { read: bool, write: bool, execute: bool },
    InlineDetour(DetourHookDetails),
}

struct Installed {
    detail: HookedPageDetail,
    kind: HookKind,
}

/// Owns every installed hook and the page-table it patches.
///
/// Grounded on the `g_EptState->HookedPagesList` global list, replaced here
/// with a plain `Vec` under a spinlock per the arena/no-ambient-global
/// redesign note.
pub struct HookEngine {
    hooked_pages: Mutex<Vec<Installed>>,
}

impl Default for HookEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HookEngine {
    /// Creates an engine with no hooks installed.
    pub fn new() -> Self {
        Self {
            hooked_pages: Mutex::new(Vec::new()),
        }
    }

    /// Installs a hidden breakpoint at `virtual_address`/`physical_address`,
    /// splitting the covering 2MB entry first if it has not been split yet.
    ///
    /// `split_storage` is a pre-reserved [`DynamicSplit`] from
    /// [`crate::pool::RootPool`], consumed only if a split is actually
    /// required. `page_contents` is the real page's current bytes, copied
    /// into the fake page before `0xCC` is planted at `virtual_address`'s
    /// offset into it; the live PML1 entry is then repointed at the fake
    /// page with execute-only permissions, so a fetch runs the planted
    /// breakpoint while a read or write traps back to the real page.
    pub fn hook_hidden_breakpoint(
        &self,
        ept: &mut EptPageTable,
        split_storage: &mut DynamicSplit,
        virtual_address: u64,
        physical_address: u64,
        page_contents: &[u8; PAGE_SIZE],
    ) -> HvResult<()> {
        self.ensure_split(ept, split_storage, physical_address)?;
        let entry_ptr = ept
            .pml1_entry_mut(physical_address)
            .ok_or(HvError::UnsplitFailed)? as *mut EptEntry;

        let mut pages = self.hooked_pages.lock();
        if pages.iter().any(|page| page.detail.physical_base_address == (physical_address & !0xfff)) {
            return Err(HvError::AlreadyHooked);
        }

        // Safety: `entry_ptr` was just produced from `ept` and outlives
        // this call through `ept`'s own lifetime.
        let original = unsafe { *entry_ptr };
        let mut detail = HookedPageDetail::new(virtual_address, physical_address & !0xfff, entry_ptr, original);
        detail.is_hidden_breakpoint = true;

        let offset = (virtual_address & 0xfff) as usize;
        detail.fake_page_contents.0.copy_from_slice(page_contents);
        let previous_byte = detail.fake_page_contents.0[offset];
        detail.fake_page_contents.0[offset] = 0xcc;
        detail.breakpoint_addresses[0] = virtual_address;
        detail.previous_bytes_on_breakpoint_addresses[0] = previous_byte;
        detail.count_of_breakpoints = 1;

        let mut changed = original;
        changed.set_read(false);
        changed.set_write(false);
        changed.set_execute(true);
        changed.set_pfn(detail.physical_base_address_of_fake_page_contents >> 12);
        detail.changed_entry = changed;
        // Safety: see `hook_monitor`.
        unsafe { *entry_ptr = changed };

        pages.push(Installed {
            detail,
            kind: HookKind::HiddenBreakpoint,
        });
        Ok(())
    }

    /// Installs a read/write/execute memory monitor over the 4KB page
    /// covering `physical_address`, clearing the permission bits the
    /// caller wants trapped.
    pub fn hook_monitor(
        &self,
        ept: &mut EptPageTable,
        split_storage: &mut DynamicSplit,
        virtual_address: u64,
        physical_address: u64,
        read: bool,
        write: bool,
        execute: bool,
    ) -> HvResult<()> {
        self.ensure_split(ept, split_storage, physical_address)?;
        let entry_ptr = ept
            .pml1_entry_mut(physical_address)
            .ok_or(HvError::UnsplitFailed)? as *mut EptEntry;

        let mut pages = self.hooked_pages.lock();
        if pages.iter().any(|page| page.detail.physical_base_address == (physical_address & !0xfff)) {
            return Err(HvError::AlreadyHooked);
        }

        // Safety: see `hook_hidden_breakpoint`.
        let original = unsafe { *entry_ptr };
        let mut changed = original;
        if read {
            changed.set_read(false);
        }
        if write {
            changed.set_write(false);
        }
        if execute {
            changed.set_execute(false);
        }
        // Safety: `entry_ptr` is valid; mutation is applied through
        // `set_pml1_and_invalidate`, which callers must route through the
        // `pml1_modification_lock`.
        unsafe { *entry_ptr = changed };

        let mut detail = HookedPageDetail::new(virtual_address, physical_address & !0xfff, entry_ptr, original);
        detail.changed_entry = changed;
        detail.is_execution_hook = execute;
        pages.push(Installed {
            detail,
            kind: HookKind::Monitor { read, write, execute },
        });
        Ok(())
    }

    /// Installs an inline-detour hook at `physical_address`: the page's
    /// execute permission is cleared so the first fetch from it traps, at
    /// which point the caller's trampoline (already written into
    /// `fake_page_contents`'s backing page by the embedding driver) takes
    /// over instead of the real prologue.
    ///
    /// Mirrors `EptHookInlineHook` / `DetourHookPerformPageHook`.
    pub fn hook_inline(
        &self,
        ept: &mut EptPageTable,
        split_storage: &mut DynamicSplit,
        virtual_address: u64,
        physical_address: u64,
        hooked_function_address: u64,
        return_address: u64,
    ) -> HvResult<()> {
        self.ensure_split(ept, split_storage, physical_address)?;
        let entry_ptr = ept
            .pml1_entry_mut(physical_address)
            .ok_or(HvError::UnsplitFailed)? as *mut EptEntry;

        let mut pages = self.hooked_pages.lock();
        if pages.iter().any(|page| page.detail.physical_base_address == (physical_address & !0xfff)) {
            return Err(HvError::AlreadyHooked);
        }

        // Safety: see `hook_hidden_breakpoint`.
        let original = unsafe { *entry_ptr };
        let mut changed = original;
        changed.set_execute(false);
        // Safety: see `hook_monitor`.
        unsafe { *entry_ptr = changed };

        let mut detail = HookedPageDetail::new(virtual_address, physical_address & !0xfff, entry_ptr, original);
        detail.changed_entry = changed;
        detail.is_execution_hook = true;
        pages.push(Installed {
            detail,
            kind: HookKind::InlineDetour(DetourHookDetails { hooked_function_address, return_address }),
        });
        Ok(())
    }

    fn ensure_split(&self, ept: &mut EptPageTable, split_storage: &mut DynamicSplit, physical_address: u64) -> HvResult<()> {
        let pml2e = ept.pml2_entry_mut(physical_address);
        if pml2e.large_page() {
            ept.split_large_page(&mut split_storage.pml1, physical_address)?;
            split_storage.serviced_physical_address = physical_address & !(crate::config::SIZE_2MB as u64 - 1);
        }
        Ok(())
    }

    /// Reverts the hook covering `physical_address` and returns the
    /// original PML1 entry so the caller can invalidate the TLB.
    ///
    /// Mirrors `unhook_single_from_root`.
    pub fn unhook_single(&self, physical_address: u64) -> HvResult<EptEntry> {
        let mut pages = self.hooked_pages.lock();
        let index = pages
            .iter()
            .position(|page| page.detail.physical_base_address == (physical_address & !0xfff))
            .ok_or(HvError::OutOfRange)?;
        let installed = pages.swap_remove(index);
        // Safety: `entry_address` is still valid; the page is being removed
        // from tracking, so no other writer can race this restore.
        unsafe { *installed.detail.entry_address = installed.detail.original_entry };
        Ok(installed.detail.original_entry)
    }

    /// Reverts every installed hook, in reverse installation order.
    ///
    /// Mirrors `unhook_all`.
    pub fn unhook_all(&self) {
        let mut pages = self.hooked_pages.lock();
        while let Some(installed) = pages.pop() {
            // Safety: see `unhook_single`.
            unsafe { *installed.detail.entry_address = installed.detail.original_entry };
        }
    }

    /// Number of hooks currently installed.
    pub fn installed_count(&self) -> usize {
        self.hooked_pages.lock().len()
    }

    /// Handles an EPT-violation VM-exit: if the faulting guest-physical
    /// address belongs to a hooked page, swaps in the original (permissive)
    /// entry for one instruction so the faulting access retires, and arms
    /// MTF to re-apply the hooked entry on the very next instruction;
    /// returns `true` if the violation was serviced.
    ///
    /// Mirrors `EptHandleEptViolation` / `EptHandlePageHookExit`.
    pub fn handle_violation(&self, guest_physical_address: u64, qualification: ViolationQualification) -> HvResult<bool> {
        let mut pages = self.hooked_pages.lock();
        let Some(installed) = pages
            .iter_mut()
            .find(|page| page.detail.physical_base_address == (guest_physical_address & !0xfff))
        else {
            return Ok(false);
        };

        installed.detail.last_violation = Some(if qualification.execute_access {
            LastViolation::Exec
        } else if qualification.write_access {
            LastViolation::Write
        } else {
            LastViolation::Read
        });

        // Safety: `entry_address` belongs to this hook's page and the
        // caller holds the PML1 modification lock for the duration of the
        // VM-exit handler.
        unsafe { *installed.detail.entry_address = installed.detail.original_entry };
        Ok(true)
    }

    /// Re-applies the hooked entry after the single stepped instruction has
    /// retired, called from the Monitor Trap Flag exit.
    ///
    /// Mirrors `EptHandleMonitorTrapFlag`.
    pub fn handle_monitor_trap_flag(&self, guest_physical_address: u64) {
        let pages = self.hooked_pages.lock();
        if let Some(installed) = pages
            .iter()
            .find(|page| page.detail.physical_base_address == (guest_physical_address & !0xfff))
        {
            // Safety: see `handle_violation`.
            unsafe { *installed.detail.entry_address = installed.detail.changed_entry };
        }
    }
}

/// Writes `entry_value` to `entry_address` under the PML1 modification
/// lock and invalidates EPT-derived TLB caches.
///
/// Mirrors `EptSetPML1AndInvalidateTLB`. Must be called from VMX-root.
///
/// # Safety
/// `entry_address` must be a live PML1 slot belonging to an `EptPageTable`
/// still in use by the calling core.
pub unsafe fn set_pml1_and_invalidate_tlb(
    lock: &Mutex<()>,
    entry_address: *mut EptEntry,
    entry_value: EptEntry,
    ept_pointer: u64,
    invalidate_all_contexts: bool,
) {
    let _guard = lock.lock();
    // Safety: delegated to the caller.
    unsafe { *entry_address = entry_value };
    if invalidate_all_contexts {
        invept(crate::x86_instructions::InveptType::AllContext, 0);
    } else {
        invept(crate::x86_instructions::InveptType::SingleContext, ept_pointer);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    fn identity_mapped_table() -> EptPageTable {
        let mut table = EptPageTable::new();
        table.build_identity_map(&[]);
        table
    }

    #[test]
    fn hidden_breakpoint_plants_0xcc_on_a_fake_page_and_repoints_the_entry_execute_only() {
        let engine = HookEngine::new();
        let mut table = identity_mapped_table();
        let mut split = DynamicSplit {
            pml1: EptStructure::default(),
            serviced_physical_address: 0,
        };
        let mut page_contents = [0x90u8; PAGE_SIZE];
        page_contents[5] = 0x55;

        engine.hook_hidden_breakpoint(&mut table, &mut split, 0x1005, 0x1000, &page_contents).unwrap();
        assert_eq!(engine.installed_count(), 1);

        let entry = table.pml1_entry_mut(0x1000).unwrap();
        assert!(entry.execute());
        assert!(!entry.read() && !entry.write());
        assert_ne!(entry.address(), 0x1000);

        let fake_page = entry.address() as *const u8;
        // Safety: the entry now points at the boxed fake page
        // `hook_hidden_breakpoint` just populated.
        let planted = unsafe { *fake_page.add(5) };
        let untouched = unsafe { *fake_page.add(6) };
        assert_eq!(planted, 0xcc);
        assert_eq!(untouched, 0x90);

        let again = engine.hook_hidden_breakpoint(&mut table, &mut split, 0x1005, 0x1000, &page_contents);
        assert_eq!(again, Err(HvError::AlreadyHooked));
    }

    #[test]
    fn monitor_hook_clears_the_requested_permission_bits() {
        let engine = HookEngine::new();
        let mut table = identity_mapped_table();
        let mut split = DynamicSplit {
            pml1: EptStructure::default(),
            serviced_physical_address: 0,
        };
        engine.hook_monitor(&mut table, &mut split, 0x2000, 0x2000, false, true, false).unwrap();
        let entry = table.pml1_entry_mut(0x2000).unwrap();
        assert!(!entry.write());
        assert!(entry.read());
    }

    #[test]
    fn inline_hook_clears_execute_and_records_detour_details() {
        let engine = HookEngine::new();
        let mut table = identity_mapped_table();
        let mut split = DynamicSplit {
            pml1: EptStructure::default(),
            serviced_physical_address: 0,
        };
        engine.hook_inline(&mut table, &mut split, 0x3000, 0x3000, 0xdead_beef, 0xdead_bef0).unwrap();
        let entry = table.pml1_entry_mut(0x3000).unwrap();
        assert!(!entry.execute());
        assert_eq!(engine.installed_count(), 1);
    }

    #[test]
    fn unhook_single_restores_the_original_entry() {
        let engine = HookEngine::new();
        let mut table = identity_mapped_table();
        let mut split = DynamicSplit {
            pml1: EptStructure::default(),
            serviced_physical_address: 0,
        };
        engine.hook_monitor(&mut table, &mut split, 0x4000, 0x4000, true, true, true).unwrap();
        let restored = engine.unhook_single(0x4000).unwrap();
        assert!(restored.read() && restored.write() && restored.execute());
        assert_eq!(engine.installed_count(), 0);
    }

    #[test]
    fn violation_then_mtf_swaps_and_restores_the_entry() {
        let engine = HookEngine::new();
        let mut table = identity_mapped_table();
        let mut split = DynamicSplit {
            pml1: EptStructure::default(),
            serviced_physical_address: 0,
        };
        engine.hook_monitor(&mut table, &mut split, 0x5000, 0x5000, false, true, false).unwrap();
        assert!(!table.pml1_entry_mut(0x5000).unwrap().write());

        let qualification = ViolationQualification {
            write_access: true,
            ..Default::default()
        };
        assert!(engine.handle_violation(0x5000, qualification).unwrap());
        assert!(table.pml1_entry_mut(0x5000).unwrap().write());

        engine.handle_monitor_trap_flag(0x5000);
        assert!(!table.pml1_entry_mut(0x5000).unwrap().write());
    }
}
