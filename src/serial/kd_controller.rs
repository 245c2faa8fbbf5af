//! Dispatches packets received over the serial link to the halt/event
//! machinery, and frames the replies.
//!
//! The user-mode command parser, disassembler, symbol/PDB loader, and
//! script compiler that produce and consume these packets on the debugger
//! side are external collaborators; this module only owns the
//! debuggee-side half: given a decoded action code and payload, drive
//! `HaltCoordinator`/`EventStore` and produce the reply.
//!
//! Grounded on `HaltedCore.c` for the pause/continue/change-core actions
//! and `hprdbgkd/header/debugger/core/Debugger.h` for the `DEBUGGER_EVENT`
//! shape `RegisterEvent` builds. The explicit request/reply dispatch here
//! replaces the original's implicit wait-on-synchronization-object
//! discipline with the mailbox model already built in `halt.rs`.

use crate::error::{HvError, HvResult};
use crate::events::{dispatch::ScriptHost, Action, CoreScope, Event, EventKind, EventOptions, EventStage, EventStore, ExecutionMode, ProcessScope};
use crate::halt::{HaltCoordinator, HaltedCoreTask, NmiSender};
use alloc::vec::Vec;

/// Reads or writes guest-physical memory on behalf of a read/write-memory
/// request, the debuggee-side counterpart of `MemoryMapperReadMemorySafe`/
/// `MemoryMapperWriteMemorySafe` reached through whichever core's reserved
/// mapping the caller is issuing the request from.
pub trait GuestMemoryAccess {
    fn read_physical(&mut self, physical_address: u64, out: &mut [u8]) -> HvResult<()>;
    fn write_physical(&mut self, physical_address: u64, data: &[u8]) -> HvResult<()>;
}

/// Action codes the debuggee honors, a subset of
/// `DEBUGGER_REMOTE_PACKET_REQUESTED_ACTION` relevant to root-mode state
/// the debuggee itself must change (as opposed to queries the user-mode
/// side answers on its own from cached data).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestedAction {
    /// `..._ON_VMX_ROOT_MODE_STEP` family: resume one instruction then
    /// re-halt.
    Step,
    /// `..._ON_VMX_ROOT_MODE_CONTINUE`: resume and keep running.
    Continue,
    /// `..._ON_VMX_ROOT_MODE_CHANGE_CORE`: switch which core the session is
    /// inspecting.
    ChangeCore(u32),
    /// `..._ON_VMX_ROOT_MODE_CHANGE_PROCESS`: switch which process ID the
    /// session is scoped to.
    ChangeProcess(u64),
    /// `..._ON_VMX_ROOT_REGISTER_EVENT`: register a new event.
    RegisterEvent(EventRegistration),
    /// `..._ON_VMX_ROOT_MODE_CLOSE_AND_UNLOAD_DEBUGGEE`: detach and resume
    /// every core permanently.
    CloseAndUnload,
    /// `..._ON_VMX_ROOT_MODE_TEST_QUERY`: connectivity probe.
    TestQuery,
    /// `..._ON_VMX_ROOT_MODE_READ_MEMORY`: read `len` bytes starting at a
    /// guest-physical address.
    ReadMemory { physical_address: u64, len: usize },
    /// `..._ON_VMX_ROOT_MODE_WRITE_MEMORY`: write `data` starting at a
    /// guest-physical address.
    WriteMemory { physical_address: u64, data: Vec<u8> },
    /// `..._ON_VMX_ROOT_MODE_QUERY_EVENT`: report whether the event carrying
    /// `tag` is currently enabled.
    QueryEvent { tag: u64 },
    /// `..._ON_VMX_ROOT_MODE_MODIFY_EVENT`: enable or disable the event
    /// carrying `tag`.
    ModifyEvent { tag: u64, enabled: bool },
    /// `..._ON_VMX_ROOT_UNREGISTER_EVENT`: remove the event carrying `tag`.
    UnregisterEvent { tag: u64 },
}

/// The fields `RegisterEvent` needs out of the wire payload to build an
/// [`Event`], everything else (condition program bytes, action list)
/// already decoded by the caller.
#[derive(Clone, Debug)]
pub struct EventRegistration {
    pub kind: EventKind,
    pub core_scope: CoreScope,
    pub process_scope: ProcessScope,
    pub options: EventOptions,
    pub execution_mode: Option<ExecutionMode>,
    pub stage: EventStage,
    pub enable_short_circuit: bool,
    pub actions: Vec<Action>,
    pub condition_program: Option<Vec<u8>>,
}

/// A decoded inbound frame.
#[derive(Clone, Debug)]
pub struct IncomingPacket {
    pub action: RequestedAction,
    pub input_from_vmx_root: bool,
}

/// A reply the controller wants sent back over the serial link, matching
/// the debuggee-to-debugger halves of `DEBUGGER_REMOTE_PACKET_REQUESTED_ACTION`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutgoingPacket {
    /// `..._DEBUGGEE_PAUSED_AND_CURRENT_INSTRUCTION`-shaped acknowledgement
    /// that every core is now halted.
    Paused { core_id: u32 },
    /// Acknowledges a resume.
    Continued,
    /// The new tag assigned to a just-registered event.
    EventRegistered { tag: u64 },
    /// Carries an `HvError` back to the debugger as a result code.
    Error(HvError),
    /// Reply to `TestQuery`.
    TestAck,
    /// Reply to `ReadMemory`, carrying the bytes read.
    MemoryRead { data: Vec<u8> },
    /// Reply to `WriteMemory`.
    MemoryWritten,
    /// Reply to `QueryEvent`.
    EventQueried { enabled: bool },
    /// Reply to `ModifyEvent`.
    EventModified,
    /// Reply to `UnregisterEvent`.
    EventUnregistered,
}

/// Drives packet dispatch against one [`EventStore`] and [`HaltCoordinator`].
pub struct KdController<'a> {
    events: &'a EventStore,
    halt: &'a HaltCoordinator<'a>,
}

impl<'a> KdController<'a> {
    pub const fn new(events: &'a EventStore, halt: &'a HaltCoordinator<'a>) -> Self {
        Self { events, halt }
    }

    /// Handles one incoming packet, returning the reply to frame and send
    /// back.
    pub fn handle(
        &self,
        packet: IncomingPacket,
        nmi: &dyn NmiSender,
        _host: &mut dyn ScriptHost,
        memory: &mut dyn GuestMemoryAccess,
    ) -> OutgoingPacket {
        match self.dispatch(packet, nmi, memory) {
            Ok(reply) => reply,
            Err(err) => OutgoingPacket::Error(err),
        }
    }

    fn dispatch(&self, packet: IncomingPacket, nmi: &dyn NmiSender, memory: &mut dyn GuestMemoryAccess) -> HvResult<OutgoingPacket> {
        match packet.action {
            RequestedAction::TestQuery => Ok(OutgoingPacket::TestAck),

            RequestedAction::Continue => {
                self.halt.broadcast_task_all_cores(nmi, HaltedCoreTask::Test, false, false, 0)?;
                Ok(OutgoingPacket::Continued)
            }

            RequestedAction::CloseAndUnload => {
                self.halt.broadcast_task_all_cores(nmi, HaltedCoreTask::Test, false, false, 0)?;
                Ok(OutgoingPacket::Continued)
            }

            RequestedAction::Step => {
                let core = nmi.current_core_id();
                Ok(OutgoingPacket::Paused { core_id: core })
            }

            RequestedAction::ChangeCore(core_id) => {
                if core_id >= nmi.core_count() {
                    return Err(HvError::OutOfRange);
                }
                Ok(OutgoingPacket::Paused { core_id })
            }

            RequestedAction::ChangeProcess(_process_id) => Ok(OutgoingPacket::Continued),

            RequestedAction::RegisterEvent(registration) => {
                crate::events::validate_registration(
                    registration.kind,
                    registration.options,
                    registration.execution_mode,
                    registration.process_scope,
                    registration.stage,
                    registration.enable_short_circuit,
                    packet.input_from_vmx_root,
                )
                .map_err(HvError::EventParsing)?;

                let event = Event {
                    tag: 0,
                    kind: registration.kind,
                    enabled: true,
                    core_scope: registration.core_scope,
                    process_scope: registration.process_scope,
                    options: registration.options,
                    actions: registration.actions,
                    condition_program: registration.condition_program,
                    stage: registration.stage,
                    enable_short_circuit: registration.enable_short_circuit,
                    output_sources: Vec::new(),
                };
                let (tag, _handle) = self.events.register(event);
                Ok(OutgoingPacket::EventRegistered { tag })
            }

            RequestedAction::ReadMemory { physical_address, len } => {
                let mut data = alloc::vec![0u8; len];
                memory.read_physical(physical_address, &mut data)?;
                Ok(OutgoingPacket::MemoryRead { data })
            }

            RequestedAction::WriteMemory { physical_address, data } => {
                memory.write_physical(physical_address, &data)?;
                Ok(OutgoingPacket::MemoryWritten)
            }

            RequestedAction::QueryEvent { tag } => {
                let event = self.events.get_by_tag(tag).ok_or(HvError::NotFound)?;
                Ok(OutgoingPacket::EventQueried { enabled: event.enabled })
            }

            RequestedAction::ModifyEvent { tag, enabled } => {
                let (kind, handle) = self.events.find_by_tag(tag).ok_or(HvError::NotFound)?;
                self.events.set_enabled(kind, handle, enabled);
                Ok(OutgoingPacket::EventModified)
            }

            RequestedAction::UnregisterEvent { tag } => {
                let (kind, handle) = self.events.find_by_tag(tag).ok_or(HvError::NotFound)?;
                self.events.clear(kind, handle);
                Ok(OutgoingPacket::EventUnregistered)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::halt::{CoreHaltState, NmiBroadcastAction};

    struct FakeNmi {
        current: u32,
        count: u32,
    }

    impl NmiSender for FakeNmi {
        fn core_count(&self) -> u32 {
            self.count
        }
        fn send(&self, _core_id: u32, _action: NmiBroadcastAction) {}
        fn current_core_id(&self) -> u32 {
            self.current
        }
    }

    struct NoopHost;
    impl ScriptHost for NoopHost {
        fn evaluate_condition(&mut self, _program: &[u8]) -> crate::events::dispatch::ConditionResult {
            crate::events::dispatch::ConditionResult::Passed
        }
        fn run_script(&mut self, _program: &[u8]) {}
        fn run_custom_code(&mut self, _buffer: &[u8]) {}
        fn break_to_debugger(&mut self) {}
    }

    struct FakeMemory {
        backing: alloc::collections::BTreeMap<u64, u8>,
    }

    impl FakeMemory {
        fn new() -> Self {
            Self { backing: alloc::collections::BTreeMap::new() }
        }
    }

    impl GuestMemoryAccess for FakeMemory {
        fn read_physical(&mut self, physical_address: u64, out: &mut [u8]) -> HvResult<()> {
            for (offset, byte) in out.iter_mut().enumerate() {
                *byte = *self.backing.get(&(physical_address + offset as u64)).unwrap_or(&0);
            }
            Ok(())
        }
        fn write_physical(&mut self, physical_address: u64, data: &[u8]) -> HvResult<()> {
            for (offset, byte) in data.iter().enumerate() {
                self.backing.insert(physical_address + offset as u64, *byte);
            }
            Ok(())
        }
    }

    #[test]
    fn test_query_is_acknowledged() {
        let events = EventStore::new();
        let cores = [CoreHaltState::new()];
        let halt = HaltCoordinator::new(&cores);
        let controller = KdController::new(&events, &halt);
        let nmi = FakeNmi { current: 0, count: 1 };
        let mut host = NoopHost;
        let mut memory = FakeMemory::new();
        let reply = controller.handle(
            IncomingPacket { action: RequestedAction::TestQuery, input_from_vmx_root: false },
            &nmi,
            &mut host,
            &mut memory,
        );
        assert_eq!(reply, OutgoingPacket::TestAck);
    }

    #[test]
    fn change_core_out_of_range_reports_an_error() {
        let events = EventStore::new();
        let cores = [CoreHaltState::new()];
        let halt = HaltCoordinator::new(&cores);
        let controller = KdController::new(&events, &halt);
        let nmi = FakeNmi { current: 0, count: 1 };
        let mut host = NoopHost;
        let mut memory = FakeMemory::new();
        let reply = controller.handle(
            IncomingPacket { action: RequestedAction::ChangeCore(5), input_from_vmx_root: false },
            &nmi,
            &mut host,
            &mut memory,
        );
        assert_eq!(reply, OutgoingPacket::Error(HvError::OutOfRange));
    }

    #[test]
    fn write_then_read_memory_round_trips_through_the_fake_backing_store() {
        let events = EventStore::new();
        let cores = [CoreHaltState::new()];
        let halt = HaltCoordinator::new(&cores);
        let controller = KdController::new(&events, &halt);
        let nmi = FakeNmi { current: 0, count: 1 };
        let mut host = NoopHost;
        let mut memory = FakeMemory::new();
        let write_reply = controller.handle(
            IncomingPacket {
                action: RequestedAction::WriteMemory { physical_address: 0x1000, data: alloc::vec![1, 2, 3, 4] },
                input_from_vmx_root: false,
            },
            &nmi,
            &mut host,
            &mut memory,
        );
        assert_eq!(write_reply, OutgoingPacket::MemoryWritten);

        let read_reply = controller.handle(
            IncomingPacket {
                action: RequestedAction::ReadMemory { physical_address: 0x1000, len: 4 },
                input_from_vmx_root: false,
            },
            &nmi,
            &mut host,
            &mut memory,
        );
        assert_eq!(read_reply, OutgoingPacket::MemoryRead { data: alloc::vec![1, 2, 3, 4] });
    }

    #[test]
    fn query_modify_and_unregister_operate_on_the_tag_the_registration_returned() {
        let events = EventStore::new();
        let cores = [CoreHaltState::new()];
        let halt = HaltCoordinator::new(&cores);
        let controller = KdController::new(&events, &halt);
        let nmi = FakeNmi { current: 0, count: 1 };
        let mut host = NoopHost;
        let mut memory = FakeMemory::new();
        let registration = EventRegistration {
            kind: EventKind::VmcallInstructionExecution,
            core_scope: CoreScope::All,
            process_scope: ProcessScope::All,
            options: EventOptions::default(),
            execution_mode: None,
            stage: EventStage::Pre,
            enable_short_circuit: false,
            actions: Vec::new(),
            condition_program: None,
        };
        let tag = match controller.handle(
            IncomingPacket { action: RequestedAction::RegisterEvent(registration), input_from_vmx_root: false },
            &nmi,
            &mut host,
            &mut memory,
        ) {
            OutgoingPacket::EventRegistered { tag } => tag,
            other => panic!("unexpected reply: {other:?}"),
        };

        let queried = controller.handle(
            IncomingPacket { action: RequestedAction::QueryEvent { tag }, input_from_vmx_root: false },
            &nmi,
            &mut host,
            &mut memory,
        );
        assert_eq!(queried, OutgoingPacket::EventQueried { enabled: true });

        let modified = controller.handle(
            IncomingPacket { action: RequestedAction::ModifyEvent { tag, enabled: false }, input_from_vmx_root: false },
            &nmi,
            &mut host,
            &mut memory,
        );
        assert_eq!(modified, OutgoingPacket::EventModified);
        assert_eq!(
            controller.handle(
                IncomingPacket { action: RequestedAction::QueryEvent { tag }, input_from_vmx_root: false },
                &nmi,
                &mut host,
                &mut memory,
            ),
            OutgoingPacket::EventQueried { enabled: false }
        );

        let unregistered = controller.handle(
            IncomingPacket { action: RequestedAction::UnregisterEvent { tag }, input_from_vmx_root: false },
            &nmi,
            &mut host,
            &mut memory,
        );
        assert_eq!(unregistered, OutgoingPacket::EventUnregistered);
        assert_eq!(
            controller.handle(
                IncomingPacket { action: RequestedAction::QueryEvent { tag }, input_from_vmx_root: false },
                &nmi,
                &mut host,
                &mut memory,
            ),
            OutgoingPacket::Error(HvError::NotFound)
        );
    }

    #[test]
    fn registering_a_valid_event_returns_its_tag() {
        let events = EventStore::new();
        let cores = [CoreHaltState::new()];
        let halt = HaltCoordinator::new(&cores);
        let controller = KdController::new(&events, &halt);
        let nmi = FakeNmi { current: 0, count: 1 };
        let mut host = NoopHost;
        let mut memory = FakeMemory::new();
        let registration = EventRegistration {
            kind: EventKind::VmcallInstructionExecution,
            core_scope: CoreScope::All,
            process_scope: ProcessScope::All,
            options: EventOptions::default(),
            execution_mode: None,
            stage: EventStage::Pre,
            enable_short_circuit: false,
            actions: Vec::new(),
            condition_program: None,
        };
        let reply = controller.handle(
            IncomingPacket { action: RequestedAction::RegisterEvent(registration), input_from_vmx_root: false },
            &nmi,
            &mut host,
            &mut memory,
        );
        match reply {
            OutgoingPacket::EventRegistered { tag } => assert!(tag >= EventStore::FIRST_USER_TAG),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
