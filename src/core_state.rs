//! Per-logical-processor state.
//!
//! Mirrors `VIRTUAL_MACHINE_STATE` (`header/common/State.h`): every field a
//! VM-exit handler needs about the core it is running on, gathered in one
//! place instead of indexed out of a file-scope `g_GuestState[]` array.
//! One `CoreState` is created per logical processor at virtualization time
//! and never moves;
//! [`crate::context::VmmContext`] owns the array of them.

use crate::{ept::EptPageTable, mem_mapper::PerCoreReservedMapping, syscall::SyscallTrapState};

/// A pending `VMXOFF`, recorded so the dispatcher that issued it can resume
/// the guest at the right place after leaving root mode.
///
/// Mirrors `VMX_VMXOFF_STATE`.
#[derive(Clone, Copy, Debug, Default)]
pub struct VmxoffPending {
    /// Whether `VMXOFF` has already been executed on this core.
    pub executed: bool,
    /// Guest `RIP` to resume at.
    pub guest_rip: u64,
    /// Guest `RSP` to resume at.
    pub guest_rsp: u64,
}

/// Fixed-capacity FIFO of external-interrupt vectors deferred while the
/// guest cannot immediately accept them.
///
/// Mirrors `PendingExternalInterrupts[PENDING_INTERRUPTS_BUFFER_CAPACITY]`.
#[derive(Debug)]
pub struct PendingInterrupts {
    vectors: [Option<u8>; Self::CAPACITY],
    head: usize,
    len: usize,
}

impl PendingInterrupts {
    /// Matches the original's `PENDING_INTERRUPTS_BUFFER_CAPACITY`.
    pub const CAPACITY: usize = 64;

    pub const fn new() -> Self {
        Self {
            vectors: [None; Self::CAPACITY],
            head: 0,
            len: 0,
        }
    }

    /// Appends a vector, dropping the oldest pending one if the buffer is
    /// already full (matching the ring behavior of the fixed-size array).
    pub fn push(&mut self, vector: u8) {
        let tail = (self.head + self.len) % Self::CAPACITY;
        self.vectors[tail] = Some(vector);
        if self.len < Self::CAPACITY {
            self.len += 1;
        } else {
            self.head = (self.head + 1) % Self::CAPACITY;
        }
    }

    /// Removes and returns the oldest pending vector, if any.
    pub fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let vector = self.vectors[self.head].take();
        self.head = (self.head + 1) % Self::CAPACITY;
        self.len -= 1;
        vector
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for PendingInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread single-step/transparency bookkeeping kept while a thread is
/// being watched for the CPUID-after-RDTSC detection the transparency
/// subsystem relies on.
///
/// Mirrors `VM_EXIT_TRANSPARENCY`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransparencyState {
    /// Timestamp counter value observed the last time this core trapped
    /// `RDTSC`/`RDTSCP`.
    pub previous_timestamp_counter: u64,
    /// Thread this state belongs to, if scoped to one.
    pub thread_id: Option<u64>,
    /// Timestamp value last revealed to the guest.
    pub revealed_timestamp_counter: u64,
    /// Whether a `CPUID` immediately following an `RDTSC` was observed,
    /// which the transparency layer treats as a timing-attack probe.
    pub cpuid_after_rdtsc_detected: bool,
}

/// Debug-register/process/thread tracing flags threaded through a core's
/// exit handling, independent of any single event.
///
/// Mirrors the scattered `BOOLEAN` tracing flags on `VIRTUAL_MACHINE_STATE`
/// (`IgnoreMtfUnset`, `RegisterBreakOnMtf`, `IgnoreOneMtf`, and friends),
/// gathered here under one name per the ambient-globals redesign note.
#[derive(Clone, Copy, Debug, Default)]
pub struct DebugState {
    /// Whether the next MTF exit should be ignored (mark-as-handled) rather
    /// than dispatched, matching `IgnoreOneMtf`.
    pub ignore_next_mtf: bool,
    /// Whether a break was registered to fire on the next MTF exit, used by
    /// instrumentation step-in (`RegisterBreakOnMtf`).
    pub register_break_on_mtf: bool,
    /// Whether this core is waiting on an immediate VM-exit it requested of
    /// itself, matching `WaitForImmediateVmexit`.
    pub waiting_for_immediate_vmexit: bool,
}

/// One logical processor's complete root-mode state.
///
/// Mirrors `VIRTUAL_MACHINE_STATE`. Created when the core is virtualized,
/// destroyed when it is un-virtualized; never relocated in between, since
/// `mtf_restore_point` and other components hold raw pointers derived from
/// its address.
pub struct CoreState {
    /// This core's zero-based logical processor index.
    pub core_id: u32,
    /// Whether execution is currently inside the VMM (running on the VMM's
    /// own stack) rather than having VM-entered the guest.
    pub is_in_root_mode: bool,
    /// Whether the VM-exit handler should advance guest `RIP` past the
    /// trapping instruction before resuming (cleared by emulation paths
    /// that already set `RIP` explicitly, e.g. `SYSCALL`/`SYSRET`).
    pub increment_rip: bool,
    /// The most recent VM-exit's basic exit reason.
    pub last_exit_reason: u32,
    /// The most recent VM-exit's exit qualification.
    pub last_exit_qualification: u64,
    /// Guest `RIP` at the time of the most recent VM-exit.
    pub last_vmexit_rip: u64,
    /// Set once this core has executed `VMXOFF`, recording where the guest
    /// should resume outside the hypervisor.
    pub vmxoff_pending: VmxoffPending,
    /// This core's identity-mapped EPT hierarchy.
    pub ept_page_table: EptPageTable,
    /// A second, alternate EPT hierarchy used for MBEC-style execute-only
    /// transitions, built lazily.
    pub secondary_ept_page_table: Option<EptPageTable>,
    /// Whether `secondary_ept_page_table` is the one currently loaded into
    /// the VMCS EPT pointer.
    pub using_secondary_ept: bool,
    /// Whether the next MTF exit should skip unsetting the Monitor Trap
    /// Flag, matching `IgnoreMtfUnset`.
    pub mtf_ignore_unset: bool,
    /// Whether a break was requested specifically on the next MTF exit.
    pub mtf_register_break: bool,
    /// Whether external-interrupt injection should resume on the ordinary
    /// continue path.
    pub enable_ext_int_on_continue: bool,
    /// Whether external-interrupt injection should resume on the MTF
    /// continuation path.
    pub enable_ext_int_on_mtf: bool,
    /// Process/thread tracing flags not owned by a single event.
    pub debug_state: DebugState,
    /// Transparent-mode (anti-detection) bookkeeping for this core.
    pub transparency_state: TransparencyState,
    /// Dirty-logging (PML) buffer address, if enabled on this core.
    pub pml_buffer: Option<u64>,
    /// External interrupts this core deferred delivering to the guest.
    pub pending_interrupts: PendingInterrupts,
    /// The action a pending NMI broadcast asked this core to take.
    pub nmi_broadcast_action: Option<crate::halt::NmiBroadcastAction>,
    /// This core's reserved cross-address-space mapping window.
    pub reserved_mapping: PerCoreReservedMapping,
    /// Threads on this core awaiting a post-syscall trap-flag callback.
    pub syscall_trap_state: SyscallTrapState,
}

impl CoreState {
    /// Builds a fresh, un-virtualized core state.
    ///
    /// `reserved_mapping` must name a virtual-address/PTE pair this core
    /// owns exclusively (see [`PerCoreReservedMapping`]); the host allocates
    /// it before calling this, the same way `MmAllocateMappingAddress` does
    /// for `MEMORY_MAPPER_ADDRESSES`.
    pub fn new(core_id: u32, reserved_mapping: PerCoreReservedMapping) -> Self {
        Self {
            core_id,
            is_in_root_mode: false,
            increment_rip: true,
            last_exit_reason: 0,
            last_exit_qualification: 0,
            last_vmexit_rip: 0,
            vmxoff_pending: VmxoffPending::default(),
            ept_page_table: EptPageTable::new(),
            secondary_ept_page_table: None,
            using_secondary_ept: false,
            mtf_ignore_unset: false,
            mtf_register_break: false,
            enable_ext_int_on_continue: false,
            enable_ext_int_on_mtf: false,
            debug_state: DebugState::default(),
            transparency_state: TransparencyState::default(),
            pml_buffer: None,
            pending_interrupts: PendingInterrupts::new(),
            nmi_broadcast_action: None,
            reserved_mapping,
            syscall_trap_state: SyscallTrapState::new(),
        }
    }

    /// The EPT pointer that should currently be loaded into the VMCS:
    /// `secondary_ept_page_table`'s PML4 if `using_secondary_ept`, else the
    /// primary's.
    pub fn active_ept_pml4_physical_address(&self) -> Option<u64> {
        if self.using_secondary_ept {
            self.secondary_ept_page_table
                .as_ref()
                .map(EptPageTable::pml4_physical_address)
        } else {
            Some(self.ept_page_table.pml4_physical_address())
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn pending_interrupts_fifo_order() {
        let mut pending = PendingInterrupts::new();
        pending.push(1);
        pending.push(2);
        pending.push(3);
        assert_eq!(pending.pop(), Some(1));
        assert_eq!(pending.pop(), Some(2));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn pending_interrupts_drops_oldest_when_full() {
        let mut pending = PendingInterrupts::new();
        for vector in 0..(PendingInterrupts::CAPACITY as u8).wrapping_add(5) {
            pending.push(vector);
        }
        assert_eq!(pending.len(), PendingInterrupts::CAPACITY);
        assert_eq!(pending.pop(), Some(5));
    }

    #[test]
    fn new_core_state_starts_un_virtualized_and_in_non_root_mode() {
        let mapping = PerCoreReservedMapping::new(0x1000, 0x2000);
        let core = CoreState::new(0, mapping);
        assert!(!core.is_in_root_mode);
        assert!(core.increment_rip);
        assert_eq!(core.active_ept_pml4_physical_address(), Some(core.ept_page_table.pml4_physical_address()));
    }
}
