//! All-core broadcast of VMCS-control toggles that do not require halting
//! the target core, the way the host's generic DPC facility lets the
//! original queue a routine onto every logical processor and wait for it.
//!
//! Unlike [`crate::halt`], which parks a core in a mailbox spin loop until
//! another core or the debugger explicitly wakes it, a broadcast here runs
//! inline on each core as part of the host's own DPC/IPI delivery and
//! returns once every core has applied the change. The host supplies that
//! delivery mechanism through [`DpcBroadcaster`]; this module only decides
//! *what* gets broadcast and folds each toggle through [`crate::protected_hv`]
//! before asking the host to apply it.
//!
//! Grounded on `Broadcast.c` (one function per toggle) and
//! `DpcRoutines.h` (the per-core routine each broadcast fans out to).

use crate::error::HvResult;
use crate::events::EventOptions;

/// One all-core VMCS toggle, named after its `Broadcast*AllCores` /
/// `Broadcas*OnAllProcessors` counterpart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastTask {
    /// `BroadcastVmxVirtualizationAllCores`.
    PerformVirtualization,
    /// `BroadcastEnableDbAndBpExitingAllCores`.
    EnableDbAndBpExiting,
    /// `BroadcastDisableDbAndBpExitingAllCores`.
    DisableDbAndBpExiting,
    /// `BroadcastEnableBreakpointExitingOnExceptionBitmapAllCores`.
    EnableBreakpointExceptionBitmap,
    /// `BroadcastDisableBreakpointExitingOnExceptionBitmapAllCores`.
    DisableBreakpointExceptionBitmap,
    /// `BroadcastEnableNmiExitingAllCores`.
    EnableNmiExiting,
    /// `BroadcastDisableNmiExitingAllCores`.
    DisableNmiExiting,
    /// `BroadcastNotifyAllToInvalidateEptAllCores`.
    InvalidateEpt,
    /// `BroadcastEnableRdtscExitingAllCores`.
    EnableRdtscExiting,
    /// `BroadcastDisableRdtscExitingAllCores`.
    DisableRdtscExiting,
    /// `BroadcastDisableRdtscExitingForClearingEventsAllCores`.
    DisableRdtscExitingOnlyForTscEvents,
    /// `BroadcastChangeAllMsrBitmapReadAllCores(mask)`.
    ChangeMsrBitmapRead(u64),
    /// `BroadcastResetChangeAllMsrBitmapReadAllCores`.
    ResetMsrBitmapRead,
    /// `BroadcastChangeAllMsrBitmapWriteAllCores(mask)`.
    ChangeMsrBitmapWrite(u64),
    /// `BroadcastResetAllMsrBitmapWriteAllCores`.
    ResetMsrBitmapWrite,
    /// `BroadcastDisableMov2ControlRegsExitingForClearingEventsAllCores`.
    DisableMovToCrExitingOnlyForCrEvents(EventOptions),
    /// `BroadcastDisableMov2DebugRegsExitingForClearingEventsAllCores`.
    DisableMovToDrExitingOnlyForDrEvents,
    /// `BroadcastEnableRdpmcExitingAllCores`.
    EnableRdpmcExiting,
    /// `BroadcastDisableRdpmcExitingAllCores`.
    DisableRdpmcExiting,
    /// `BroadcastSetExceptionBitmapAllCores(exception_index)`.
    SetExceptionBitmap(u64),
    /// `BroadcastUnsetExceptionBitmapAllCores(exception_index)`.
    UnsetExceptionBitmap(u64),
    /// `BroadcastResetExceptionBitmapAllCores`.
    ResetExceptionBitmapOnlyOnClearingExceptionEvents,
    /// `BroadcastEnableMovControlRegisterExitingAllCores(options)`.
    EnableMovToControlRegisterExiting(EventOptions),
    /// `BroadcastDisableMovToControlRegistersExitingAllCores(options)`.
    DisableMovToControlRegisterExiting(EventOptions),
    /// `BroadcastEnableMovDebugRegistersExitingAllCores`.
    EnableMovToDebugRegisterExiting,
    /// `BroadcastDisableMovDebugRegistersExitingAllCores`.
    DisableMovToDebugRegisterExiting,
    /// `BroadcastSetExternalInterruptExitingAllCores`.
    EnableExternalInterruptExiting,
    /// `BroadcastUnsetExternalInterruptExitingOnlyOnClearingInterruptEventsAllCores`.
    DisableExternalInterruptExitingOnlyToClearInterruptCommands,
    /// `BroadcastIoBitmapChangeAllCores(port)`.
    ChangeIoBitmap(u16),
    /// `BroadcastIoBitmapResetAllCores`.
    ResetIoBitmap,
    /// `BroadcastEnableMovToCr3ExitingOnAllProcessors`.
    EnableMovToCr3Exiting,
    /// `BroadcastDisableMovToCr3ExitingOnAllProcessors`.
    DisableMovToCr3Exiting,
    /// `BroadcastChangeToMbecSupportedEptpOnAllProcessors`.
    ChangeToMbecSupportedEptp,
    /// `BroadcastRestoreToNormalEptpOnAllProcessors`.
    RestoreToNormalEptp,
    /// `BroadcasEnableMbecOnAllProcessors` / `BroadcasDisableMbecOnAllProcessors`.
    SetMbec(bool),
    /// `BroadcastEnableEferSyscallEventsOnAllProcessors`.
    EnableEferSyscallEvents,
    /// `BroadcastDisableEferSyscallEventsOnAllProcessors`.
    DisableEferSyscallEvents,
    /// `BroadcastEnablePmlOnAllProcessors`.
    EnablePml,
    /// `BroadcastDisablePmlOnAllProcessors`.
    DisablePml,
}

/// Delivers a broadcast task to every logical core and blocks until each has
/// applied it, the way `KeGenericCallDpc` does. Implemented by the host,
/// which owns the platform's DPC/IPI plumbing.
pub trait DpcBroadcaster {
    /// Number of logical processors in the system.
    fn core_count(&self) -> u32;
    /// Runs `task` on every core, via `apply`, and does not return until
    /// every core has applied it.
    fn broadcast(&self, task: BroadcastTask, apply: &mut dyn FnMut(u32, BroadcastTask) -> HvResult<()>) -> HvResult<()>;
}

/// Runs `task` on every core through `broadcaster`, applying it with
/// `apply` on each, and returns the first error encountered (if any); a
/// partial failure still means some cores already applied the change, so
/// the caller should treat any error here as "system state may now be
/// inconsistent across cores" rather than "nothing happened."
pub fn broadcast_all_cores(
    broadcaster: &dyn DpcBroadcaster,
    task: BroadcastTask,
    apply: &mut dyn FnMut(u32, BroadcastTask) -> HvResult<()>,
) -> HvResult<()> {
    broadcaster.broadcast(task, apply)
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::vec::Vec;

    use super::*;

    struct SequentialBroadcaster {
        count: u32,
    }

    impl DpcBroadcaster for SequentialBroadcaster {
        fn core_count(&self) -> u32 {
            self.count
        }
        fn broadcast(&self, task: BroadcastTask, apply: &mut dyn FnMut(u32, BroadcastTask) -> HvResult<()>) -> HvResult<()> {
            for core_id in 0..self.count {
                apply(core_id, task)?;
            }
            Ok(())
        }
    }

    #[test]
    fn broadcast_applies_the_task_on_every_core() {
        let broadcaster = SequentialBroadcaster { count: 4 };
        let mut touched = Vec::new();
        broadcast_all_cores(&broadcaster, BroadcastTask::EnableRdtscExiting, &mut |core_id, _task| {
            touched.push(core_id);
            Ok(())
        })
        .unwrap();
        assert_eq!(touched, alloc::vec![0, 1, 2, 3]);
    }

    #[test]
    fn broadcast_stops_at_the_first_error() {
        let broadcaster = SequentialBroadcaster { count: 4 };
        let mut seen = 0;
        let result = broadcast_all_cores(&broadcaster, BroadcastTask::EnablePml, &mut |_core_id, _task| {
            seen += 1;
            if seen == 2 {
                Err(crate::error::HvError::Misuse)
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        assert_eq!(seen, 2);
    }
}
