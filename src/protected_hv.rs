//! Integrity re-derivation for the handful of VMCS-level resources that
//! several independent features (events, syscall hooks, hidden
//! breakpoints) all need a say in.
//!
//! A feature never writes the exception bitmap, external-interrupt
//! exiting, RDTSC exiting, or mov-to-debug/control-register exiting masks
//! directly. Instead it calls the matching `derive_*` routine here with
//! the bits *it* wants set and a [`PassingOver`] flag describing why, and
//! this module folds in whatever every other still-registered feature
//! also requires before returning the value that should actually be
//! written to the VMCS. That way clearing one feature's exiting request
//! can never silently clear another feature's.
//!
//! Grounded on `ProtectedHvRoutines.c`.

use core::ops::BitOr;

/// Vector of the `#BP` (breakpoint) exception.
const EXCEPTION_VECTOR_BREAKPOINT: u32 = 3;
/// Vector of the `#DB` (debug) exception.
const EXCEPTION_VECTOR_DEBUG_BREAKPOINT: u32 = 1;
/// Vector of the `#UD` (invalid opcode) exception.
const EXCEPTION_VECTOR_UNDEFINED_OPCODE: u32 = 6;

/// Reasons a caller may ask integrity re-derivation to skip one of its
/// normal checks, matching `PROTECTED_HV_RESOURCES_PASSING_OVERS`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassingOver {
    /// Skip folding in the exception-event bitmap (the caller is the
    /// exception-event subsystem itself, clearing its own bit).
    pub exception_events: bool,
    /// Skip folding in the `#UD` requirement for syscall/sysret hooking
    /// (the caller is disabling that hook and is clearing `#UD` itself).
    pub ud_exceptions_for_syscall_sysret_hook: bool,
    /// Skip folding in the interrupt-command requirement (the caller is
    /// disabling external-interrupt exiting only to clear pending
    /// interrupt-injection commands).
    pub interrupt_commands: bool,
    /// Skip folding in the RDTSC-event requirement (the caller is
    /// disabling RDTSC exiting only for TSC-related events).
    pub tsc_events: bool,
    /// Skip folding in the debug-register-event requirement (the caller is
    /// disabling mov-to-DR exiting only for DR-related events).
    pub dr_events: bool,
    /// Skip folding in the control-register-event mask (the caller is
    /// disabling mov-to-CR exiting only for CR-related events).
    pub cr_events: bool,
}

/// The set of facts every `derive_*` routine needs about what the rest of
/// the debugger currently requires, threaded in explicitly instead of read
/// from ambient globals.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtectedResourceState {
    /// Number of registered events whose kind is `SyscallHooksEferSyscall`
    /// on this core.
    pub syscall_hook_events_on_core: u32,
    /// Number of registered events whose kind is `SyscallHooksEferSysret`
    /// on this core.
    pub sysret_hook_events_on_core: u32,
    /// Whether a kernel debugger session is attached.
    pub kernel_debugger_attached: bool,
    /// Number of hidden-breakpoint hooks installed anywhere.
    pub hidden_breakpoint_hook_count: u32,
    /// Whether an external-interrupt-exiting-dependent event is registered.
    pub interrupt_events_registered: bool,
    /// Whether an RDTSC-exiting-dependent event is registered.
    pub tsc_events_registered: bool,
    /// Whether a `DebugRegistersAccessed` event is registered.
    pub dr_events_registered: bool,
    /// Bitmask of control-register indices (bit N set means CRN) that a
    /// `ControlRegisterModified`/`ControlRegisterRead` event currently
    /// requires exiting for.
    pub cr_events_mask: u32,
}

/// Folds `requested_mask` with whatever the exception bitmap must always
/// contain given `state` and `pass_over`.
///
/// Mirrors `ProtectedHvChangeExceptionBitmapWithIntegrityCheck`.
pub fn derive_exception_bitmap(requested_mask: u32, state: ProtectedResourceState, pass_over: PassingOver) -> u32 {
    let mut mask = requested_mask;

    if !pass_over.ud_exceptions_for_syscall_sysret_hook
        && (state.syscall_hook_events_on_core != 0 || state.sysret_hook_events_on_core != 0)
    {
        mask |= 1 << EXCEPTION_VECTOR_UNDEFINED_OPCODE;
    }

    if state.kernel_debugger_attached {
        mask |= 1 << EXCEPTION_VECTOR_BREAKPOINT;
        mask |= 1 << EXCEPTION_VECTOR_DEBUG_BREAKPOINT;
    }

    if state.hidden_breakpoint_hook_count != 0 {
        mask |= 1 << EXCEPTION_VECTOR_BREAKPOINT;
    }

    let _ = pass_over.exception_events;
    mask
}

/// Sets bit `idt_index` in `current_mask`.
///
/// Mirrors `ProtectedHvSetExceptionBitmap`.
pub fn set_exception_bitmap_bit(current_mask: u32, idt_index: u32) -> u32 {
    current_mask.bitor(1 << idt_index)
}

/// Clears bit `idt_index` in `current_mask`.
///
/// Mirrors `ProtectedHvUnsetExceptionBitmap`.
pub fn unset_exception_bitmap_bit(current_mask: u32, idt_index: u32) -> u32 {
    current_mask & !(1 << idt_index)
}

/// Decides whether external-interrupt exiting should remain set given
/// `set` (the caller's request) folded with `state`.
///
/// Mirrors `ProtectedHvApplySetExternalInterruptExiting`.
pub fn derive_external_interrupt_exiting(set: bool, state: ProtectedResourceState, pass_over: PassingOver) -> bool {
    if set {
        return true;
    }
    if !pass_over.interrupt_commands && state.interrupt_events_registered {
        return true;
    }
    false
}

/// Decides whether RDTSC/RDTSCP exiting should remain set.
///
/// Mirrors `ProtectedHvSetTscVmexit`.
pub fn derive_rdtsc_exiting(set: bool, state: ProtectedResourceState, pass_over: PassingOver) -> bool {
    if set {
        return true;
    }
    if !pass_over.tsc_events && state.tsc_events_registered {
        return true;
    }
    false
}

/// Decides whether mov-to-debug-register exiting should remain set.
///
/// Mirrors `ProtectedHvSetMovDebugRegsVmexit`.
pub fn derive_mov_to_dr_exiting(set: bool, state: ProtectedResourceState, pass_over: PassingOver) -> bool {
    if set {
        return true;
    }
    if !pass_over.dr_events && state.dr_events_registered {
        return true;
    }
    false
}

/// Folds `requested_mask` (the bitmask of control-register indices the
/// caller wants exiting for) with whatever registered
/// `ControlRegisterModified`/`ControlRegisterRead` events still require,
/// scoping by control register the way `ProtectedHvSetMovControlRegsVmexit`
/// refuses to clear a bit another feature still needs.
pub fn derive_mov_to_cr_exiting_mask(requested_mask: u32, state: ProtectedResourceState, pass_over: PassingOver) -> u32 {
    if pass_over.cr_events {
        requested_mask
    } else {
        requested_mask | state.cr_events_mask
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn active_syscall_hook_forces_ud_trap_even_when_not_requested() {
        let state = ProtectedResourceState {
            syscall_hook_events_on_core: 1,
            ..Default::default()
        };
        let mask = derive_exception_bitmap(0, state, PassingOver::default());
        assert_ne!(mask & (1 << EXCEPTION_VECTOR_UNDEFINED_OPCODE), 0);
    }

    #[test]
    fn passing_over_ud_check_skips_the_forced_bit() {
        let state = ProtectedResourceState {
            syscall_hook_events_on_core: 1,
            ..Default::default()
        };
        let pass_over = PassingOver {
            ud_exceptions_for_syscall_sysret_hook: true,
            ..Default::default()
        };
        let mask = derive_exception_bitmap(0, state, pass_over);
        assert_eq!(mask & (1 << EXCEPTION_VECTOR_UNDEFINED_OPCODE), 0);
    }

    #[test]
    fn disabling_interrupt_exiting_is_overridden_by_registered_events() {
        let state = ProtectedResourceState {
            interrupt_events_registered: true,
            ..Default::default()
        };
        assert!(derive_external_interrupt_exiting(false, state, PassingOver::default()));
    }

    #[test]
    fn disabling_dr_exiting_is_overridden_by_registered_events_unless_passed_over() {
        let state = ProtectedResourceState {
            dr_events_registered: true,
            ..Default::default()
        };
        assert!(derive_mov_to_dr_exiting(false, state, PassingOver::default()));

        let pass_over = PassingOver { dr_events: true, ..Default::default() };
        assert!(!derive_mov_to_dr_exiting(false, state, pass_over));
    }

    #[test]
    fn cr_exiting_mask_folds_in_registered_event_bits() {
        let state = ProtectedResourceState {
            cr_events_mask: 1 << 3,
            ..Default::default()
        };
        assert_eq!(derive_mov_to_cr_exiting_mask(1 << 0, state, PassingOver::default()), (1 << 0) | (1 << 3));

        let pass_over = PassingOver { cr_events: true, ..Default::default() };
        assert_eq!(derive_mov_to_cr_exiting_mask(1 << 0, state, pass_over), 1 << 0);
    }
}
