//! Multi-core halt/resume coordination: a "halted" core spins on a mailbox
//! until the initiator (another core, or `KdController`) deposits a task
//! for it to run and resumes it.
//!
//! Grounded on `HaltedCore.c`. NMI issuance (xAPIC/x2APIC IPI) is host
//! plumbing, abstracted here behind [`NmiSender`] the same way
//! `hardware_vt::HardwareVt` abstracts VMX/SVM bring-up.

use crate::error::{HvError, HvResult};
use spin::Mutex;

/// The action a broadcast NMI asks peer cores to take.
///
/// Mirrors `NMI_BROADCAST_ACTION_TYPE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmiBroadcastAction {
    /// No action; used to probe NMI delivery.
    Test,
    /// Enter the halt-mailbox spin loop and service whatever is deposited.
    Request,
    /// Invalidate EPT-derived TLB entries for a single EPT pointer.
    InvEptSingleContext,
    /// Invalidate EPT-derived TLB entries for every EPT pointer.
    InvEptAllContexts,
}

/// A task deposited in a core's mailbox, identified the way the original's
/// `DEBUGGER_HALTED_CORE_TASK` enum names them.
///
/// Mirrors the `HaltedCoreTask` codes the original debugger engine defines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltedCoreTask {
    Test,
    RunVmcall,
    SetProcessInterception,
    SetThreadInterception,
    ChangeMsrBitmapRead,
    ChangeMsrBitmapWrite,
    ChangeIoBitmap,
    SetRdpmcExiting,
    UnsetRdpmcExiting,
    SetRdtscExiting,
    DisableRdtscExitingOnlyForTscEvents,
    EnableMovToDebugRegsExiting,
    DisableMovToHwDrExitingOnlyForDrEvents,
    SetExceptionBitmap,
    UnsetExceptionBitmap,
    ResetExceptionBitmapOnlyOnClearingExceptionEvents,
    EnableExternalInterruptExiting,
    DisableExternalInterruptExitingOnlyToClearInterruptCommands,
    EnableMovToControlRegsExiting,
    DisableMovToCrExitingOnlyForCrEvents,
    EnableSyscallHookEfer,
    DisableSyscallHookEfer,
    InvEptAllContexts,
    InvEptSingleContext,
    UnhookSinglePage,
    ResetMsrBitmapRead,
    ResetMsrBitmapWrite,
    ResetIoBitmap,
}

/// Opaque payload handed to the dispatched task, interpreted by the
/// embedding driver's task callback.
pub type TaskContext = u64;

/// Per-core mailbox a halted core spins on.
///
/// Mirrors the fields accessed by `HaltedCoreTaskTest`/
/// `HaltedCorePerformTargetTask`.
#[derive(Default)]
struct Mailbox {
    perform_task: bool,
    task_code: Option<HaltedCoreTask>,
    context: TaskContext,
    lock_again_after_task: bool,
    result_status: Option<HvResult<()>>,
}

/// One core's halt state: whether it is currently spinning, and its
/// mailbox.
pub struct CoreHaltState {
    mailbox: Mutex<Mailbox>,
    halted: core::sync::atomic::AtomicBool,
}

impl Default for CoreHaltState {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreHaltState {
    /// Creates a core in the running (not halted) state.
    pub const fn new() -> Self {
        Self {
            mailbox: Mutex::new(Mailbox {
                perform_task: false,
                task_code: None,
                context: 0,
                lock_again_after_task: false,
                result_status: None,
            }),
            halted: core::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Whether this core is currently spinning in its halt loop.
    pub fn is_halted(&self) -> bool {
        self.halted.load(core::sync::atomic::Ordering::Acquire)
    }

    /// Deposits `task` in this core's mailbox for it to run next time it
    /// polls, per `HaltedCoreApplyTaskOnTargetCore`.
    fn deposit(&self, task: HaltedCoreTask, context: TaskContext, lock_again_after_task: bool) {
        let mut mailbox = self.mailbox.lock();
        mailbox.task_code = Some(task);
        mailbox.context = context;
        mailbox.lock_again_after_task = lock_again_after_task;
        mailbox.result_status = None;
        mailbox.perform_task = true;
    }

    /// One iteration of a halted core's spin loop: if a task is pending,
    /// runs it via `dispatch` and clears `perform_task`, returning whether
    /// the core should keep spinning afterward.
    ///
    /// Mirrors `HaltedCoreTask`'s spin-poll-dispatch loop body.
    pub fn poll_and_dispatch<F: FnOnce(HaltedCoreTask, TaskContext) -> HvResult<()>>(&self, dispatch: F) -> bool {
        let (task, context, lock_again) = {
            let mailbox = self.mailbox.lock();
            if !mailbox.perform_task {
                return true;
            }
            (mailbox.task_code.expect("perform_task set without a task_code"), mailbox.context, mailbox.lock_again_after_task)
        };

        let result = dispatch(task, context);

        let mut mailbox = self.mailbox.lock();
        mailbox.result_status = Some(result);
        mailbox.perform_task = false;
        lock_again
    }

    /// Marks this core as entering the halt spin loop.
    pub fn enter_halt(&self) {
        self.halted.store(true, core::sync::atomic::Ordering::Release);
    }

    /// Marks this core as having left the halt spin loop.
    pub fn leave_halt(&self) {
        self.halted.store(false, core::sync::atomic::Ordering::Release);
    }

    /// Whether the last deposited task has finished running.
    fn task_completed(&self) -> bool {
        !self.mailbox.lock().perform_task
    }

    fn take_result(&self) -> Option<HvResult<()>> {
        self.mailbox.lock().result_status.take()
    }
}

/// Raises the NMI broadcast that gets peer cores into their halt loop, or
/// that asks them to invalidate EPT caches. Implemented by the host, which
/// owns xAPIC/x2APIC IPI issuance.
pub trait NmiSender {
    /// Number of logical processors in the system.
    fn core_count(&self) -> u32;
    /// Sends `action` to `core_id` as a non-maskable interrupt.
    fn send(&self, core_id: u32, action: NmiBroadcastAction);
    /// The core this call is currently running on.
    fn current_core_id(&self) -> u32;
}

/// Coordinates halting and resuming every core in the system.
///
/// Mirrors the broadcast entry points in `HaltedCore.c`.
pub struct HaltCoordinator<'a> {
    cores: &'a [CoreHaltState],
}

impl<'a> HaltCoordinator<'a> {
    /// Builds a coordinator over one `CoreHaltState` per logical processor.
    pub const fn new(cores: &'a [CoreHaltState]) -> Self {
        Self { cores }
    }

    /// Runs `task` on `core_id`: inline if it is the calling core, or via
    /// its mailbox (after an NMI) otherwise.
    ///
    /// Mirrors `HaltedCoreRunTaskOnSingleCore`.
    pub fn run_task_on_single_core<F: FnOnce(HaltedCoreTask, TaskContext) -> HvResult<()>>(
        &self,
        nmi: &dyn NmiSender,
        core_id: u32,
        task: HaltedCoreTask,
        context: TaskContext,
        lock_again_after_task: bool,
        run_inline: F,
    ) -> HvResult<()> {
        if core_id == nmi.current_core_id() {
            return run_inline(task, context);
        }
        let state = self.cores.get(core_id as usize).ok_or(HvError::OutOfRange)?;
        state.deposit(task, context, lock_again_after_task);
        nmi.send(core_id, NmiBroadcastAction::Request);
        Ok(())
    }

    /// Deposits `task` in every core but the caller's mailbox and sends
    /// the `Request` NMI to each. If `synchronize` is set, spins until
    /// every target's mailbox reports completion before returning.
    ///
    /// `synchronize` requires `lock_again_after_task`, matching
    /// `HaltedCoreBroadcastTaskAllCores`'s rejection of the opposite
    /// combination (it would deadlock: a core that does not relock after
    /// its task cannot be polled for completion).
    pub fn broadcast_task_all_cores(
        &self,
        nmi: &dyn NmiSender,
        task: HaltedCoreTask,
        lock_again_after_task: bool,
        synchronize: bool,
        context: TaskContext,
    ) -> HvResult<()> {
        if synchronize && !lock_again_after_task {
            return Err(HvError::InvalidHaltRequest);
        }

        let current = nmi.current_core_id();
        let mut targets = alloc::vec::Vec::new();
        for core_id in 0..nmi.core_count() {
            if core_id == current {
                continue;
            }
            let state = self.cores.get(core_id as usize).ok_or(HvError::OutOfRange)?;
            state.deposit(task, context, lock_again_after_task);
            nmi.send(core_id, NmiBroadcastAction::Request);
            targets.push(core_id);
        }

        if synchronize {
            for core_id in targets {
                let state = &self.cores[core_id as usize];
                while !state.task_completed() {
                    core::hint::spin_loop();
                }
                if let Some(Err(err)) = state.take_result() {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::{cell::RefCell, vec::Vec};

    use super::*;

    struct FakeNmi {
        current: u32,
        count: u32,
        sent: RefCell<Vec<(u32, NmiBroadcastAction)>>,
        cores: *const [CoreHaltState],
    }

    impl NmiSender for FakeNmi {
        fn core_count(&self) -> u32 {
            self.count
        }
        fn send(&self, core_id: u32, action: NmiBroadcastAction) {
            self.sent.borrow_mut().push((core_id, action));
            // Immediately service the mailbox, standing in for the peer
            // core's own NMI handler running its spin loop.
            let cores = unsafe { &*self.cores };
            cores[core_id as usize].poll_and_dispatch(|_task, _ctx| Ok(()));
        }
        fn current_core_id(&self) -> u32 {
            self.current
        }
    }

    #[test]
    fn broadcast_rejects_synchronize_without_lock_again() {
        let cores = [CoreHaltState::new(), CoreHaltState::new()];
        let coordinator = HaltCoordinator::new(&cores);
        let nmi = FakeNmi {
            current: 0,
            count: 2,
            sent: RefCell::new(Vec::new()),
            cores: &cores,
        };
        let result = coordinator.broadcast_task_all_cores(&nmi, HaltedCoreTask::Test, false, true, 0);
        assert_eq!(result, Err(HvError::InvalidHaltRequest));
    }

    #[test]
    fn broadcast_skips_the_calling_core() {
        let cores = [CoreHaltState::new(), CoreHaltState::new(), CoreHaltState::new()];
        let coordinator = HaltCoordinator::new(&cores);
        let nmi = FakeNmi {
            current: 1,
            count: 3,
            sent: RefCell::new(Vec::new()),
            cores: &cores,
        };
        coordinator
            .broadcast_task_all_cores(&nmi, HaltedCoreTask::Test, true, true, 0)
            .unwrap();
        let sent = nmi.sent.borrow();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(core, _)| *core != 1));
    }
}
