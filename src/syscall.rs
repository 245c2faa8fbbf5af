//! EFER-based SYSCALL/SYSRET interception.
//!
//! Enabling `IA32_EFER.SCE` exiting through the EFER MSR bitmap turns every
//! guest `SYSCALL`/`SYSRET` into a `#UD`. This module classifies which of
//! the two the guest meant, emulates the instruction's architectural
//! effects on RIP/RFLAGS/CS/SS, and tracks threads that asked to single-step
//! back out of kernel mode after the call returns.
//!
//! Grounded on `EferHook.c` (EFER toggling, SYSCALL/SYSRET emulation, `#UD`
//! classification) and `SyscallCallback.c` (post-syscall trap-flag
//! bookkeeping).

use crate::error::{HvError, HvResult};
use alloc::vec::Vec;

const IA32_STAR: u32 = 0xc000_0081;
const IA32_LSTAR: u32 = 0xc000_0082;
const IA32_FMASK: u32 = 0xc000_0084;
const EFER_SCE: u64 = 1 << 0;

const X86_FLAGS_RF: u64 = 1 << 16;
const X86_FLAGS_VM: u64 = 1 << 17;
const X86_FLAGS_RESERVED_BITS: u64 = 1 << 1 | 0xffff_ffff_ffc2_0000;
const X86_FLAGS_FIXED: u64 = 1 << 1;

/// A flat, present, 4GB code or data segment descriptor as SYSCALL/SYSRET
/// construct them, in the shape the VMCS guest-segment fields want.
///
/// Mirrors `VMX_SEGMENT_SELECTOR`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentSelector {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attributes: u16,
}

/// The guest state SYSCALL/SYSRET emulation reads and rewrites. The caller
/// (the VM-exit handler) is responsible for turning this into the matching
/// VMCS writes and general-purpose register updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestSyscallState {
    pub rip: u64,
    pub rflags: u64,
    pub rcx: u64,
    pub r11: u64,
    pub instruction_length: u64,
}

/// What `GuestSyscallState` should become, plus the CS/SS descriptors to
/// load, after emulating one of SYSCALL or SYSRET.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmulatedTransfer {
    pub rip: u64,
    pub rflags: u64,
    pub rcx: u64,
    pub r11: u64,
    pub cs: SegmentSelector,
    pub ss: SegmentSelector,
}

/// Reads the three MSRs emulation needs (`IA32_LSTAR`, `IA32_FMASK`,
/// `IA32_STAR`), abstracted so emulation logic stays pure and testable.
pub trait MsrReader {
    fn read_msr(&self, msr: u32) -> u64;
}

/// Computes the guest state SYSCALL transfers to, per
/// `SyscallHookEmulateSYSCALL`: RCX gets the return address, RIP comes from
/// `IA32_LSTAR`, R11 captures RFLAGS before it is masked by `IA32_FMASK`
/// (and RF is always cleared), and CS/SS come from bits 47:32 of
/// `IA32_STAR`.
pub fn emulate_syscall(state: GuestSyscallState, msrs: &dyn MsrReader) -> EmulatedTransfer {
    let rcx = state.rip.wrapping_add(state.instruction_length);
    let rip = msrs.read_msr(IA32_LSTAR);
    let r11 = state.rflags;
    let fmask = msrs.read_msr(IA32_FMASK);
    let rflags = state.rflags & !(fmask | X86_FLAGS_RF);

    let star = msrs.read_msr(IA32_STAR);
    let cs_selector = ((star >> 32) & !3) as u16;
    let cs = SegmentSelector {
        selector: cs_selector,
        base: 0,
        limit: u32::MAX,
        attributes: 0xA09B,
    };
    let ss = SegmentSelector {
        selector: cs_selector.wrapping_add(8),
        base: 0,
        limit: u32::MAX,
        attributes: 0xC093,
    };

    EmulatedTransfer { rip, rflags, rcx, r11, cs, ss }
}

/// Computes the guest state SYSRET transfers to, per
/// `SyscallHookEmulateSYSRET`: RIP comes from RCX, RFLAGS comes from R11
/// with RF/VM/reserved bits cleared and the always-one bit forced, and
/// CS/SS come from bits 63:48 of `IA32_STAR` with RPL forced to 3.
pub fn emulate_sysret(state: GuestSyscallState, msrs: &dyn MsrReader) -> EmulatedTransfer {
    let rip = state.rcx;
    let rflags = (state.r11 & !(X86_FLAGS_RF | X86_FLAGS_VM | X86_FLAGS_RESERVED_BITS)) | X86_FLAGS_FIXED;

    let star = msrs.read_msr(IA32_STAR);
    let base_selector = (star >> 48) as u16;
    let cs = SegmentSelector {
        selector: (base_selector.wrapping_add(16)) | 3,
        base: 0,
        limit: u32::MAX,
        attributes: 0xA0FB,
    };
    let ss = SegmentSelector {
        selector: (base_selector.wrapping_add(8)) | 3,
        base: 0,
        limit: u32::MAX,
        attributes: 0xC0F3,
    };

    EmulatedTransfer { rip, rflags, rcx: state.rcx, r11: state.r11, cs, ss }
}

/// The three-byte encodings `SyscallHookHandleUD` compares against to tell
/// SYSCALL and SYSRET apart once it has safely read the faulting
/// instruction out of guest memory.
const SYSCALL_OPCODE: [u8; 2] = [0x0f, 0x05];
const SYSRET_OPCODE: [u8; 3] = [0x48, 0x0f, 0x07];

/// Which architectural instruction a trapped `#UD` turned out to be, or
/// that it was unrelated and should be reinjected into the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Syscall,
    Sysret,
    Unrelated,
}

/// How `#UD`s are told apart, matching `DEBUGGER_EVENT_SYSCALL_SYSRET_TYPE`.
///
/// The original offers both a safe mode (read the faulting instruction's
/// bytes out of guest memory through the target process's CR3, falling
/// back to a `#PF` injection if the page isn't present) and an unsafe mode
/// (assume every canonical-negative RIP is a SYSRET and everything else a
/// SYSCALL, skipping the memory read entirely). Modeled here as a runtime
/// choice rather than a build-time feature, since a live debugging session
/// can legitimately want either (see `!syscall2`/`!sysret2` in the
/// original): the tradeoff is per-session, not per-build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassificationMode {
    /// Read the guest instruction bytes through `memory`; slower but never
    /// misclassifies.
    SafeAccessMemory,
    /// Classify from RIP canonicality alone; faster, but a system that
    /// violates the assumption crashes instead of reinjecting `#UD`.
    HandleAllUd,
}

/// Reads guest virtual memory through a specific address space, used only
/// by [`ClassificationMode::SafeAccessMemory`].
pub trait GuestMemoryReader {
    /// Reads `len` bytes (at most 3) at `guest_virtual_address` in the
    /// address space rooted at `guest_cr3`. Returns `None` if the page
    /// backing `guest_virtual_address` is not present (the caller should
    /// inject a `#PF` rather than treat this as `Unrelated`).
    fn read_guest_bytes(&self, guest_cr3: u64, guest_virtual_address: u64, len: usize) -> Option<[u8; 3]>;
}

/// Outcome of classifying a `#UD`: either a definite classification, or a
/// request to inject a page fault because the faulting page was not
/// present (only reachable in [`ClassificationMode::SafeAccessMemory`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UdOutcome {
    Classified(Classification),
    InjectPageFault,
}

/// Classifies a trapped `#UD` at `guest_rip`, per `SyscallHookHandleUD`.
pub fn classify_ud(
    mode: ClassificationMode,
    guest_rip: u64,
    guest_cr3: u64,
    memory: &dyn GuestMemoryReader,
) -> UdOutcome {
    match mode {
        ClassificationMode::HandleAllUd => {
            const CANONICAL_HIGH_HALF: u64 = 0xff00_0000_0000_0000;
            if guest_rip & CANONICAL_HIGH_HALF != 0 {
                UdOutcome::Classified(Classification::Sysret)
            } else {
                UdOutcome::Classified(Classification::Syscall)
            }
        }
        ClassificationMode::SafeAccessMemory => match memory.read_guest_bytes(guest_cr3, guest_rip, 3) {
            None => UdOutcome::InjectPageFault,
            Some(bytes) => {
                if bytes[0..2] == SYSCALL_OPCODE {
                    UdOutcome::Classified(Classification::Syscall)
                } else if bytes[0..3] == SYSRET_OPCODE {
                    UdOutcome::Classified(Classification::Sysret)
                } else {
                    UdOutcome::Classified(Classification::Unrelated)
                }
            }
        },
    }
}

/// Folds the per-core syscall/sysret hook counts into the `IA32_EFER` value
/// that should be written, per `SyscallHookConfigureEFER`. Enabling either
/// hook sets `SCE` exiting (EFER.SCE must remain 1 for SYSCALL to work at
/// all in long mode; what changes is whether the VM-exit-inducing variant
/// of the MSR bitmap routes writes to it through the hypervisor).
pub fn derive_efer(current_efer: u64, hooks_active: bool) -> u64 {
    if hooks_active {
        current_efer | EFER_SCE
    } else {
        current_efer
    }
}

/// Identifies one (process, thread) pair awaiting a post-syscall trap-flag
/// callback, the key `SyscallCallbackTrapState` binary-searches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrapKey {
    pub process_id: u64,
    pub thread_id: u64,
}

/// One pending post-syscall callback: the saved register context and the
/// up-to-four parameters the original syscall was entered with, replayed
/// to the callback when the armed `#DB` fires.
///
/// Mirrors the `(pid, tid, context, params)` tuple `SyscallCallbackTrapState`
/// records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapEntry {
    pub key: TrapKey,
    pub context: u64,
    pub params: [u64; 4],
}

/// Tracks which (process, thread) pairs asked to single-step once their
/// pending syscall returns, kept sorted by key for binary search.
///
/// Mirrors `g_SyscallCallbackTrapFlagState`'s `InsertionSort`/
/// `BinarySearch` discipline over `ThreadInformation`.
#[derive(Default)]
pub struct SyscallTrapState {
    entries: Vec<TrapEntry>,
}

impl SyscallTrapState {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Records that `key` should have its trap flag set after its current
    /// syscall returns, saving `context`/`params` for the eventual
    /// callback. Returns `false` if `key` was already pending.
    pub fn request(&mut self, key: TrapKey, context: u64, params: [u64; 4]) -> bool {
        match self.entries.binary_search_by_key(&key, |entry| entry.key) {
            Ok(_) => false,
            Err(index) => {
                self.entries.insert(index, TrapEntry { key, context, params });
                true
            }
        }
    }

    /// Removes `key` from the pending set, returning its saved entry if it
    /// had been requested.
    pub fn consume(&mut self, key: TrapKey) -> Option<TrapEntry> {
        match self.entries.binary_search_by_key(&key, |entry| entry.key) {
            Ok(index) => Some(self.entries.remove(index)),
            Err(_) => None,
        }
    }

    pub fn is_pending(&self, key: TrapKey) -> bool {
        self.entries.binary_search_by_key(&key, |entry| entry.key).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }
}

/// Guards against enabling the EFER hook with no registered syscall/sysret
/// event on the target core, matching the early-exit in
/// `SyscallHookConfigureEFER`'s callers.
pub fn ensure_hook_has_listener(syscall_events: u32, sysret_events: u32) -> HvResult<()> {
    if syscall_events == 0 && sysret_events == 0 {
        return Err(HvError::Misuse);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    struct FakeMsrs {
        lstar: u64,
        fmask: u64,
        star: u64,
    }

    impl MsrReader for FakeMsrs {
        fn read_msr(&self, msr: u32) -> u64 {
            match msr {
                IA32_LSTAR => self.lstar,
                IA32_FMASK => self.fmask,
                IA32_STAR => self.star,
                _ => 0,
            }
        }
    }

    #[test]
    fn emulate_syscall_computes_return_address_and_masked_rflags() {
        let msrs = FakeMsrs {
            lstar: 0xffff_f800_1234_0000,
            fmask: 0x4700,
            star: 0x0033_0018_0000_0000,
        };
        let state = GuestSyscallState { rip: 0x1000, rflags: 0x4746, rcx: 0, r11: 0, instruction_length: 2 };
        let transfer = emulate_syscall(state, &msrs);
        assert_eq!(transfer.rcx, 0x1002);
        assert_eq!(transfer.rip, 0xffff_f800_1234_0000);
        assert_eq!(transfer.r11, 0x4746);
        assert_eq!(transfer.rflags & X86_FLAGS_RF, 0);
        assert_eq!(transfer.cs.selector & 3, 0);
    }

    #[test]
    fn emulate_sysret_restores_user_segments_with_rpl_3() {
        let msrs = FakeMsrs { lstar: 0, fmask: 0, star: 0x0033_0018_0000_0000 };
        let state = GuestSyscallState { rip: 0, rflags: 0, rcx: 0x7fff_0000, r11: 0x4246, instruction_length: 0 };
        let transfer = emulate_sysret(state, &msrs);
        assert_eq!(transfer.rip, 0x7fff_0000);
        assert_eq!(transfer.cs.selector & 3, 3);
        assert_eq!(transfer.ss.selector & 3, 3);
        assert_eq!(transfer.rflags & X86_FLAGS_FIXED, X86_FLAGS_FIXED);
    }

    struct FakeMemory(Option<[u8; 3]>);

    impl GuestMemoryReader for FakeMemory {
        fn read_guest_bytes(&self, _cr3: u64, _va: u64, _len: usize) -> Option<[u8; 3]> {
            self.0
        }
    }

    #[test]
    fn safe_classification_recognizes_syscall_and_sysret_opcodes() {
        let syscall_bytes = FakeMemory(Some([0x0f, 0x05, 0x00]));
        assert_eq!(
            classify_ud(ClassificationMode::SafeAccessMemory, 0x1000, 0, &syscall_bytes),
            UdOutcome::Classified(Classification::Syscall)
        );

        let sysret_bytes = FakeMemory(Some([0x48, 0x0f, 0x07]));
        assert_eq!(
            classify_ud(ClassificationMode::SafeAccessMemory, 0x1000, 0, &sysret_bytes),
            UdOutcome::Classified(Classification::Sysret)
        );
    }

    #[test]
    fn safe_classification_requests_a_page_fault_when_page_absent() {
        let missing = FakeMemory(None);
        assert_eq!(
            classify_ud(ClassificationMode::SafeAccessMemory, 0x1000, 0, &missing),
            UdOutcome::InjectPageFault
        );
    }

    #[test]
    fn unsafe_classification_uses_rip_canonicality_only() {
        let memory = FakeMemory(None);
        assert_eq!(
            classify_ud(ClassificationMode::HandleAllUd, 0xffff_8000_0000_0000, 0, &memory),
            UdOutcome::Classified(Classification::Sysret)
        );
        assert_eq!(
            classify_ud(ClassificationMode::HandleAllUd, 0x0000_7fff_0000_0000, 0, &memory),
            UdOutcome::Classified(Classification::Syscall)
        );
    }

    #[test]
    fn trap_state_insert_and_remove_keep_sorted_order() {
        let key = |process_id, thread_id| TrapKey { process_id, thread_id };
        let mut state = SyscallTrapState::new();
        assert!(state.request(key(1, 30), 0xdead, [0; 4]));
        assert!(state.request(key(1, 10), 0xbeef, [0; 4]));
        assert!(state.request(key(1, 20), 0xf00d, [1, 2, 3, 4]));
        assert!(!state.request(key(1, 10), 0x0, [0; 4]));
        assert_eq!(state.pending_count(), 3);
        assert!(state.is_pending(key(1, 20)));
        let entry = state.consume(key(1, 20)).expect("entry should be present");
        assert_eq!(entry.context, 0xf00d);
        assert_eq!(entry.params, [1, 2, 3, 4]);
        assert!(!state.is_pending(key(1, 20)));
        assert_eq!(state.pending_count(), 2);

        // Same thread ID but a different process is a distinct key.
        assert!(state.request(key(2, 10), 0x1234, [0; 4]));
        assert!(state.is_pending(key(2, 10)));
        assert!(state.is_pending(key(1, 10)));
    }

    #[test]
    fn ensure_hook_has_listener_rejects_when_nothing_is_registered() {
        assert!(ensure_hook_has_listener(0, 0).is_err());
        assert!(ensure_hook_has_listener(1, 0).is_ok());
    }
}
