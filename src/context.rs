//! The single owner of every piece of shared and per-core hypervisor state.
//!
//! The original threads its equivalent information through a collection of
//! file-scope globals (`g_GuestState[]`, `g_Events`, `g_KernelDebuggerState`,
//! and so on), each initialized by its own subsystem's `*Initialize`
//! routine and read back from anywhere in the codebase. This module
//! gathers the same information into one `VmmContext` value, built once at
//! virtualization time, so every subsystem takes what it needs as a
//! parameter instead of reaching for ambient state. Grounded on the
//! teacher's own
//! `global_state::GlobalState` singleton, which already made the same call
//! for its narrower set of fields (VMXON region, guest registers, host
//! page tables).

use crate::{
    core_state::CoreState,
    ept::HookEngine,
    error::{HvError, HvResult},
    events::{dispatch::ScriptHost, EventStore},
    halt::{CoreHaltState, HaltCoordinator, HaltedCoreTask, NmiSender},
    mem_mapper::PerCoreReservedMapping,
    pool::RootPool,
    serial::{kd_controller::IncomingPacket, GuestMemoryAccess, KdController, OutgoingPacket},
};
use alloc::vec::Vec;

/// Everything a running debuggee needs that is not scoped to a single core:
/// the event registry, the root-mode allocator, and the halt mailboxes
/// every core's [`CoreState`] is addressed through.
///
/// Built once, during virtualization bring-up, and handed out by shared
/// reference to every VM-exit handler thereafter. Never cloned: there is
/// exactly one per debuggee.
pub struct VmmContext {
    /// Per-core state, indexed by `core_id`.
    cores: Vec<CoreState>,
    /// Per-core halt mailboxes, indexed by `core_id`, kept alongside rather
    /// than inside `CoreState` so [`HaltCoordinator`] can borrow a plain
    /// contiguous slice without borrowing the rest of a core's state.
    halt_states: Vec<CoreHaltState>,
    /// Every registered event, across every core.
    events: EventStore,
    /// The root-mode two-phase allocator.
    pool: RootPool,
    /// Every installed EPT hook, shared across cores since a hooked
    /// guest-physical page is hooked system-wide even though each core
    /// keeps its own identity-mapped EPT hierarchy.
    hooks: HookEngine,
    /// Whether a kernel debugger session is currently attached to this
    /// debuggee, mirroring `g_KernelDebuggerState`.
    kernel_debugger_attached: core::sync::atomic::AtomicBool,
}

impl VmmContext {
    /// Builds a context for `core_count` logical processors, each given its
    /// own reserved cross-address-space mapping window.
    ///
    /// Mirrors `GlobalGuestStateAllocateZeroedMemory` followed by each
    /// core's per-subsystem `*Initialize` call, folded into one
    /// constructor the same way a `GlobalState::new` folds VMXON region
    /// setup and guest register allocation into one call.
    pub fn new(reserved_mappings: Vec<PerCoreReservedMapping>) -> HvResult<Self> {
        if reserved_mappings.is_empty() {
            return Err(HvError::Misuse);
        }
        let core_count = reserved_mappings.len();

        let mut cores = Vec::with_capacity(core_count);
        let mut halt_states = Vec::with_capacity(core_count);
        for (core_id, mapping) in reserved_mappings.into_iter().enumerate() {
            cores.push(CoreState::new(core_id as u32, mapping));
            halt_states.push(CoreHaltState::new());
        }

        Ok(Self {
            cores,
            halt_states,
            events: EventStore::new(),
            pool: RootPool::new()?,
            hooks: HookEngine::new(),
            kernel_debugger_attached: core::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Number of logical processors this context was built for.
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Borrows one core's state.
    pub fn core(&self, core_id: u32) -> HvResult<&CoreState> {
        self.cores.get(core_id as usize).ok_or(HvError::OutOfRange)
    }

    /// Mutably borrows one core's state.
    pub fn core_mut(&mut self, core_id: u32) -> HvResult<&mut CoreState> {
        self.cores.get_mut(core_id as usize).ok_or(HvError::OutOfRange)
    }

    /// The shared event registry.
    pub fn events(&self) -> &EventStore {
        &self.events
    }

    /// The shared root-mode pool manager.
    pub fn pool(&self) -> &RootPool {
        &self.pool
    }

    /// The shared EPT hook engine.
    pub fn hooks(&self) -> &HookEngine {
        &self.hooks
    }

    /// Whether a kernel debugger session is currently attached.
    pub fn kernel_debugger_attached(&self) -> bool {
        self.kernel_debugger_attached.load(core::sync::atomic::Ordering::Acquire)
    }

    /// Marks whether a kernel debugger session is attached, which
    /// [`crate::protected_hv`]'s integrity re-derivation folds into the
    /// exception bitmap every core runs with.
    pub fn set_kernel_debugger_attached(&self, attached: bool) {
        self.kernel_debugger_attached.store(attached, core::sync::atomic::Ordering::Release);
    }

    /// Builds a transient [`HaltCoordinator`] over this context's halt
    /// mailboxes. Cheap: the coordinator is just a borrow, not a state
    /// holder, so there is no cost to building one per call rather than
    /// keeping one alive (which would require an unsound self-referential
    /// field given `HaltCoordinator<'a>`'s borrow of `halt_states`).
    pub fn halt_coordinator(&self) -> HaltCoordinator<'_> {
        HaltCoordinator::new(&self.halt_states)
    }

    /// Tears the debuggee down: quiesces every other core, drains the pool
    /// of outstanding allocations/frees, reverts every installed hook in
    /// reverse installation order, and marks each core's `VMXOFF` as
    /// pending so the caller's own exit-root capability can resume the
    /// guest at its saved `RIP`/`RSP`.
    ///
    /// Linearizes as quiesce, drain, unhook, `ExitRoot`, release host
    /// handles. `ExitRoot` and releasing host handles are the embedding
    /// driver's capability, not this crate's — `EnterRoot`/`ExitRoot` are
    /// black-box host capabilities this call never touches directly — so
    /// this call leaves every core's `vmxoff_pending` set so the host knows
    /// to perform that step next.
    pub fn shutdown(&mut self, nmi: &dyn NmiSender) -> HvResult<()> {
        {
            let halt = self.halt_coordinator();
            halt.broadcast_task_all_cores(nmi, HaltedCoreTask::Test, true, true, 0)?;
        }
        self.pool.drain(false)?;
        self.hooks.unhook_all();
        for core in &mut self.cores {
            core.vmxoff_pending.executed = true;
        }
        Ok(())
    }

    /// Dispatches one decoded serial packet against this context's event
    /// store and halt coordinator, the single entry point the serial
    /// transport loop calls into.
    pub fn dispatch_packet(
        &self,
        packet: IncomingPacket,
        nmi: &dyn NmiSender,
        host: &mut dyn ScriptHost,
        memory: &mut dyn GuestMemoryAccess,
    ) -> OutgoingPacket {
        let halt = self.halt_coordinator();
        let controller = KdController::new(&self.events, &halt);
        controller.handle(packet, nmi, host, memory)
    }
}
