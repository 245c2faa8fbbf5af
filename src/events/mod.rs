//! Event registration, validation, and dispatch.
//!
//! Grounded on `SDK/Headers/Events.h`, `ValidateEvents.c`, and
//! `hprdbgkd/header/debugger/core/Debugger.h`.

pub mod dispatch;
pub mod store;

pub use dispatch::{EventDispatch, ScriptHost, TriggerStatus};
pub use store::{Event, EventStage, EventStore};

/// Re-exported so callers of [`EventStore::register`] can name the handle
/// type it hands back without reaching into the crate's private arena
/// module.
pub use crate::arena::Handle;

use crate::error::EventParsingError;
use alloc::vec::Vec;

/// Every kind of event HyperDbg can register, in the original's
/// registration order.
///
/// Mirrors `VMM_EVENT_TYPE_ENUM`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    HiddenHookReadWriteExecute,
    HiddenHookReadWrite,
    HiddenHookReadExecute,
    HiddenHookWriteExecute,
    HiddenHookRead,
    HiddenHookWrite,
    HiddenHookExecute,
    HiddenHookExecDetours,
    HiddenHookExecCc,
    SyscallHookEferSyscall,
    SyscallHookEferSysret,
    CpuidInstructionExecution,
    RdmsrInstructionExecution,
    WrmsrInstructionExecution,
    InInstructionExecution,
    OutInstructionExecution,
    ExceptionOccurred,
    ExternalInterruptOccurred,
    DebugRegistersAccessed,
    TscInstructionExecution,
    PmcInstructionExecution,
    VmcallInstructionExecution,
    ControlRegisterModified,
    ControlRegisterRead,
    UserModeExecutionTrap,
}

impl EventKind {
    /// Total number of distinct kinds, used to size the per-kind array in
    /// [`EventStore`].
    pub const COUNT: usize = 25;

    /// Index into the per-kind event list array.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Every kind, in `index()` order. Lets callers that need to scan the
    /// whole [`EventStore`] (e.g. a tag lookup) iterate without hardcoding
    /// the variant list a second time.
    pub const ALL: [EventKind; Self::COUNT] = [
        Self::HiddenHookReadWriteExecute,
        Self::HiddenHookReadWrite,
        Self::HiddenHookReadExecute,
        Self::HiddenHookWriteExecute,
        Self::HiddenHookRead,
        Self::HiddenHookWrite,
        Self::HiddenHookExecute,
        Self::HiddenHookExecDetours,
        Self::HiddenHookExecCc,
        Self::SyscallHookEferSyscall,
        Self::SyscallHookEferSysret,
        Self::CpuidInstructionExecution,
        Self::RdmsrInstructionExecution,
        Self::WrmsrInstructionExecution,
        Self::InInstructionExecution,
        Self::OutInstructionExecution,
        Self::ExceptionOccurred,
        Self::ExternalInterruptOccurred,
        Self::DebugRegistersAccessed,
        Self::TscInstructionExecution,
        Self::PmcInstructionExecution,
        Self::VmcallInstructionExecution,
        Self::ControlRegisterModified,
        Self::ControlRegisterRead,
        Self::UserModeExecutionTrap,
    ];

    /// Whether this kind is one of the two syscall/sysret EFER hooks,
    /// which `ProtectedHv`'s `#UD` integrity check specifically counts.
    pub const fn is_syscall_hook(self) -> bool {
        matches!(self, Self::SyscallHookEferSyscall | Self::SyscallHookEferSysret)
    }

    /// Whether this kind is one of the hidden-hook/monitor EPT kinds,
    /// which require an address-range option to be valid.
    pub const fn is_monitor(self) -> bool {
        matches!(
            self,
            Self::HiddenHookReadWriteExecute
                | Self::HiddenHookReadWrite
                | Self::HiddenHookReadExecute
                | Self::HiddenHookWriteExecute
                | Self::HiddenHookRead
                | Self::HiddenHookWrite
                | Self::HiddenHookExecute
        )
    }
}

/// Execution-mode restriction for `USER_MODE_EXECUTION_TRAP` events.
///
/// Mirrors `DEBUGGER_EVENT_MODE_TYPE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Trap only user-mode execution.
    User,
    /// Trap only kernel-mode execution.
    Kernel,
    /// Trap both.
    UserAndKernel,
}

/// Per-kind payload options, a subset of `DEBUGGER_EVENT_OPTIONS`.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventOptions {
    pub p1: u64,
    pub p2: u64,
    pub p3: u64,
    pub p4: u64,
    pub mem_type: u8,
}

/// Core scope an event applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreScope {
    /// Fires on every logical processor.
    All,
    /// Fires only on the named core.
    Core(u32),
}

/// Process scope an event applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessScope {
    /// Fires regardless of the current process.
    All,
    /// Fires only for the named process.
    Process(u64),
}

/// One ordered step to run when an event fires.
///
/// Mirrors `DEBUGGER_EVENT_ACTION_TYPE_ENUM`.
#[derive(Clone, Debug)]
pub enum Action {
    /// Halt every core and hand control to the attached debugger.
    BreakToDebugger,
    /// Run a compiled condition/action script against the trigger context.
    RunScript(Vec<u8>),
    /// Invoke caller-supplied code with the trigger context.
    RunCustomCode { buffer: Vec<u8> },
}

/// Checks to run while registering an event, matching `ValidateEvents.c`.
/// Returns `Ok(())` if the event may be registered as-is.
pub fn validate_registration(
    kind: EventKind,
    options: EventOptions,
    execution_mode: Option<ExecutionMode>,
    process_scope: ProcessScope,
    event_stage: EventStage,
    enable_short_circuit: bool,
    input_from_vmx_root: bool,
) -> Result<(), EventParsingError> {
    if input_from_vmx_root && matches!(process_scope, ProcessScope::Process(_)) {
        return Err(EventParsingError::ProcessIdCannotBeSpecifiedFromRoot);
    }

    match kind {
        EventKind::ExceptionOccurred => {
            const ALL_FIRST_32_ENTRIES: u64 = u64::MAX;
            if options.p1 != ALL_FIRST_32_ENTRIES && options.p1 >= 31 {
                return Err(EventParsingError::ExceptionIndexExceedsFirst32Entries);
            }
        }
        EventKind::ExternalInterruptOccurred => {
            if !(32..=0xff).contains(&options.p1) {
                return Err(EventParsingError::InterruptIndexInvalid);
            }
        }
        EventKind::UserModeExecutionTrap => {
            if execution_mode.is_none() {
                return Err(EventParsingError::ModeExecutionInvalid);
            }
        }
        k if k.is_monitor() || matches!(k, EventKind::HiddenHookExecDetours | EventKind::HiddenHookExecCc) => {
            if options.p1 == 0 || options.p2 == 0 {
                return Err(EventParsingError::InvalidAddress);
            }
            if k.is_monitor() && options.p1 >= options.p2 {
                return Err(EventParsingError::InvalidAddress);
            }
        }
        _ => {}
    }

    if enable_short_circuit && event_stage == EventStage::Post {
        return Err(EventParsingError::UsingShortCircuitingInPostEvents);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn exception_index_beyond_31_is_rejected() {
        let options = EventOptions { p1: 40, ..Default::default() };
        let err = validate_registration(
            EventKind::ExceptionOccurred,
            options,
            None,
            ProcessScope::All,
            EventStage::Pre,
            false,
            false,
        )
        .unwrap_err();
        assert_eq!(err, EventParsingError::ExceptionIndexExceedsFirst32Entries);
    }

    #[test]
    fn root_mode_cannot_scope_to_a_process() {
        let err = validate_registration(
            EventKind::CpuidInstructionExecution,
            EventOptions::default(),
            None,
            ProcessScope::Process(4),
            EventStage::Pre,
            false,
            true,
        )
        .unwrap_err();
        assert_eq!(err, EventParsingError::ProcessIdCannotBeSpecifiedFromRoot);
    }

    #[test]
    fn monitor_requires_from_less_than_to() {
        let options = EventOptions { p1: 0x2000, p2: 0x1000, ..Default::default() };
        let err = validate_registration(
            EventKind::HiddenHookReadWrite,
            options,
            None,
            ProcessScope::All,
            EventStage::Pre,
            false,
            false,
        )
        .unwrap_err();
        assert_eq!(err, EventParsingError::InvalidAddress);
    }
}
