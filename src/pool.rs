//! The root-mode pool manager.
//!
//! VMX-root code cannot call into the kernel's general allocator (it would
//! run at too high an IRQL and could re-enter the scheduler). Allocation is
//! therefore two-phase: a root-mode caller enqueues a *request* describing
//! what it needs, and the actual allocation happens the next time execution
//! returns to non-root mode and [`RootPool::drain`] is called.
//!
//! Grounded on `PoolManager.c`: `PoolManagerRequestAllocation` /
//! `PoolManagerRequestPool` / `PoolManagerAllocateAndAddToPoolTable` /
//! `PoolManagerCheckAndPerformAllocationAndDeallocation` /
//! `PoolManagerFreePool`.

use crate::{
    config::{pool_seed, MAX_QUEUE_DEPTH},
    error::{HvError, HvResult},
};
use alloc::{alloc::Layout, vec::Vec};
use log::{trace, warn};
use spin::Mutex;

/// The reason a pool block was requested, used both to find a free block of
/// the right shape and to decide how many spare blocks to keep in reserve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolIntent {
    /// A 4KB-granularity split of a 2MB EPT entry (`VMM_EPT_DYNAMIC_SPLIT`).
    Split2MbTo4Kb,
    /// Bookkeeping for a hooked page (`EPT_HOOKED_PAGE_DETAIL`).
    TrackingHookedPages,
    /// An inline-hook trampoline buffer.
    ExecTrampoline,
    /// Bookkeeping for an inline detour hook.
    DetourHookDetails,
    /// A breakpoint descriptor outstanding until the debuggee continues.
    BreakpointDefinitionStructure,
    /// A regular-sized event payload.
    InstantEventRegular,
    /// An oversized event payload.
    InstantEventBig,
    /// A regular-sized action payload.
    InstantActionRegular,
    /// An oversized action payload.
    InstantActionBig,
}

struct RawBlock {
    ptr: *mut u8,
    layout: Layout,
}

// Safety: blocks are only ever touched while `RootPool`'s internal mutex is
// held, and the pointee never aliases outside this module.
unsafe impl Send for RawBlock {}

struct PoolTableEntry {
    block: RawBlock,
    intent: PoolIntent,
    busy: bool,
    should_free: bool,
}

struct PendingAllocation {
    intent: PoolIntent,
    size: usize,
    count: usize,
}

struct Inner {
    table: Vec<PoolTableEntry>,
    pending_allocations: Vec<PendingAllocation>,
    pending_frees: Vec<*mut u8>,
}

// Safety: see `RawBlock`.
unsafe impl Send for Inner {}

/// The root-mode pool manager. One instance is shared process-wide through
/// [`crate::context::VmmContext`].
pub struct RootPool {
    inner: Mutex<Inner>,
    max_queue_depth: usize,
}

impl RootPool {
    /// Builds a pool manager and seeds its initial reservations, matching
    /// `PoolManagerInitialize`'s five intents.
    pub fn new() -> HvResult<Self> {
        let pool = Self {
            inner: Mutex::new(Inner {
                table: Vec::new(),
                pending_allocations: Vec::new(),
                pending_frees: Vec::new(),
            }),
            max_queue_depth: MAX_QUEUE_DEPTH,
        };

        pool.seed(
            PoolIntent::Split2MbTo4Kb,
            core::mem::size_of::<crate::ept::hooks::DynamicSplit>(),
            pool_seed::SPLIT_2MB_TO_4KB,
        )?;
        pool.seed(
            PoolIntent::TrackingHookedPages,
            core::mem::size_of::<crate::ept::hooks::HookedPageDetail>(),
            pool_seed::TRACKING_HOOKED_PAGES,
        )?;
        pool.seed(
            PoolIntent::ExecTrampoline,
            crate::config::MAX_EXEC_TRAMPOLINE_SIZE,
            pool_seed::EXEC_TRAMPOLINE,
        )?;
        pool.seed(
            PoolIntent::DetourHookDetails,
            core::mem::size_of::<crate::ept::hooks::DetourHookDetails>(),
            pool_seed::DETOUR_HOOK_DETAILS,
        )?;
        pool.seed(
            PoolIntent::BreakpointDefinitionStructure,
            core::mem::size_of::<crate::ept::hooks::BreakpointDescriptor>(),
            pool_seed::MAXIMUM_BREAKPOINTS_WITHOUT_CONTINUE,
        )?;
        pool.seed(
            PoolIntent::InstantEventRegular,
            crate::config::MAX_INSTANT_REGULAR_SIZE,
            pool_seed::INSTANT_EVENT_REGULAR,
        )?;
        pool.seed(
            PoolIntent::InstantEventBig,
            crate::config::MAX_INSTANT_BIG_SIZE,
            pool_seed::INSTANT_EVENT_BIG,
        )?;
        pool.seed(
            PoolIntent::InstantActionRegular,
            crate::config::MAX_INSTANT_REGULAR_SIZE,
            pool_seed::INSTANT_ACTION_REGULAR,
        )?;
        pool.seed(
            PoolIntent::InstantActionBig,
            crate::config::MAX_INSTANT_BIG_SIZE,
            pool_seed::INSTANT_ACTION_BIG,
        )?;

        Ok(pool)
    }

    fn seed(&self, intent: PoolIntent, size: usize, count: usize) -> HvResult<()> {
        self.allocate_and_add(size, count, intent)
    }

    /// Enqueues a request for `count` blocks of `size` bytes tagged with
    /// `intent`. Safe to call from root mode; the request is drained later
    /// by [`RootPool::drain`].
    ///
    /// Mirrors `PoolManagerRequestAllocation`.
    pub fn request_allocation(&self, intent: PoolIntent, size: usize, count: usize) -> HvResult<()> {
        let mut inner = self.inner.lock();
        if inner.pending_allocations.len() >= self.max_queue_depth {
            warn!("root pool allocation queue full, dropping request for {intent:?}");
            return Err(HvError::OutOfMemory);
        }
        inner.pending_allocations.push(PendingAllocation { intent, size, count });
        Ok(())
    }

    /// Finds the first non-busy block tagged `intent`, marks it busy, and
    /// returns it. If `request_replenishment` is set, also enqueues a
    /// one-block replenishment request for the same intent and size so the
    /// reserve does not run dry.
    ///
    /// Mirrors `PoolManagerRequestPool`.
    pub fn request_pool(&self, intent: PoolIntent, request_replenishment: bool, size: usize) -> HvResult<*mut u8> {
        let mut inner = self.inner.lock();
        let found = inner
            .table
            .iter_mut()
            .find(|entry| entry.intent == intent && !entry.busy);

        let Some(entry) = found else {
            if request_replenishment {
                if inner.pending_allocations.len() >= self.max_queue_depth {
                    return Err(HvError::OutOfMemory);
                }
                inner.pending_allocations.push(PendingAllocation { intent, size, count: 1 });
            }
            return Err(HvError::OutOfMemory);
        };
        entry.busy = true;
        let ptr = entry.block.ptr;

        if request_replenishment {
            if inner.pending_allocations.len() < self.max_queue_depth {
                inner.pending_allocations.push(PendingAllocation { intent, size, count: 1 });
            } else {
                warn!("root pool allocation queue full, cannot replenish {intent:?}");
            }
        }
        Ok(ptr)
    }

    /// Marks a previously-handed-out block for release. The block is not
    /// actually freed until the next [`RootPool::drain`] call from
    /// non-root mode.
    ///
    /// Mirrors `PoolManagerFreePool`.
    pub fn free_pool(&self, addr: *mut u8) -> HvResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .table
            .iter_mut()
            .find(|entry| entry.block.ptr == addr)
            .ok_or(HvError::Misuse)?;
        entry.should_free = true;
        entry.busy = false;
        Ok(())
    }

    /// Alignment a block handed out under `intent` must carry. `Split2MbTo4Kb`
    /// blocks back a [`crate::ept::hooks::DynamicSplit`], which embeds an
    /// `EptStructure` (`#[repr(C, align(4096))]`) and is walked as a raw PML1
    /// page; `TrackingHookedPages` blocks back an
    /// [`crate::ept::hooks::HookedPageDetail`] placed the same way. Both must
    /// be page-aligned or the cast back to a typed pointer is undefined
    /// behavior and the address truncates when shifted into a PFN field.
    /// Every other intent is a plain byte buffer with no alignment
    /// requirement beyond the allocator's minimum.
    fn intent_alignment(intent: PoolIntent) -> usize {
        match intent {
            PoolIntent::Split2MbTo4Kb | PoolIntent::TrackingHookedPages => crate::config::PAGE_SIZE,
            _ => 16,
        }
    }

    fn allocate_and_add(&self, size: usize, count: usize, intent: PoolIntent) -> HvResult<()> {
        let mut inner = self.inner.lock();
        let align = Self::intent_alignment(intent);
        for _ in 0..count {
            let layout = Layout::from_size_align(size, align).map_err(|_| HvError::OutOfMemory)?;
            // Safety: `layout` has a non-zero size derived from a `size_of`
            // call on a concrete type, or a fixed constant.
            let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(HvError::OutOfMemory);
            }
            inner.table.push(PoolTableEntry {
                block: RawBlock { ptr, layout },
                intent,
                busy: false,
                should_free: false,
            });
        }
        Ok(())
    }

    /// Drains outstanding allocation requests and releases blocks marked
    /// for free. Must only be called from non-root mode; `in_root` lets the
    /// caller assert that precondition the way `IsOnVmxRootMode` does.
    ///
    /// Mirrors `PoolManagerCheckAndPerformAllocationAndDeallocation`.
    pub fn drain(&self, in_root: bool) -> HvResult<()> {
        if in_root {
            return Err(HvError::Misuse);
        }

        let requests = {
            let mut inner = self.inner.lock();
            core::mem::take(&mut inner.pending_allocations)
        };
        let mut allocated = 0usize;
        for request in requests {
            self.allocate_and_add(request.size, request.count, request.intent)?;
            allocated += request.count;
        }

        let mut freed = 0usize;
        {
            let mut inner = self.inner.lock();
            let mut index = 0;
            while index < inner.table.len() {
                if inner.table[index].should_free {
                    let entry = inner.table.swap_remove(index);
                    // Safety: `entry.block.layout` is the layout used to
                    // allocate `entry.block.ptr`, and this is the only
                    // release of it (the entry is removed from the table).
                    unsafe { alloc::alloc::dealloc(entry.block.ptr, entry.block.layout) };
                    freed += 1;
                } else {
                    index += 1;
                }
            }
        }

        if allocated != 0 || freed != 0 {
            trace!("root pool drain: allocated {allocated} block(s), freed {freed} block(s)");
        }
        Ok(())
    }

    /// Number of blocks currently tracked, busy or not. Exposed so callers
    /// can assert the pool-list invariant: this count only ever shrinks
    /// during a drain, never during a request.
    pub fn table_len(&self) -> usize {
        self.inner.lock().table.len()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn request_pool_marks_entry_busy_and_replenishes() {
        let pool = RootPool::new().unwrap();
        let before = pool.table_len();
        let block = pool
            .request_pool(PoolIntent::Split2MbTo4Kb, true, 4096)
            .expect("a seeded block should be available");
        assert!(!block.is_null());
        assert_eq!(pool.inner.lock().pending_allocations.len(), 1);
        pool.drain(false).unwrap();
        assert_eq!(pool.table_len(), before + 1);
    }

    #[test]
    fn free_then_drain_removes_the_block() {
        let pool = RootPool::new().unwrap();
        let block = pool.request_pool(PoolIntent::ExecTrampoline, false, 16).unwrap();
        let before = pool.table_len();
        pool.free_pool(block).unwrap();
        pool.drain(false).unwrap();
        assert_eq!(pool.table_len(), before - 1);
    }

    #[test]
    fn drain_from_root_mode_is_rejected() {
        let pool = RootPool::new().unwrap();
        assert_eq!(pool.drain(true), Err(HvError::Misuse));
    }

    #[test]
    fn split_2mb_to_4kb_blocks_are_page_aligned() {
        let pool = RootPool::new().unwrap();
        let block = pool
            .request_pool(PoolIntent::Split2MbTo4Kb, false, core::mem::size_of::<crate::ept::hooks::DynamicSplit>())
            .expect("a seeded block should be available");
        assert_eq!(block as usize % crate::config::PAGE_SIZE, 0);
    }
}
