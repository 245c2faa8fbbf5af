//! Storage for registered events, one arena per [`super::EventKind`].
//!
//! Replaces the per-kind intrusive `LIST_ENTRY` head
//! (`g_Events->EventsHeadOfExceptionEvents` and friends) with one
//! [`crate::arena::Arena`] per kind.

use crate::{
    arena::{Arena, Handle},
    events::{Action, CoreScope, EventKind, EventOptions, ProcessScope},
};
use alloc::vec::Vec;
use spin::RwLock;

/// Which VM-exit phase an event fires on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStage {
    /// Before the instruction or access that would trigger it executes.
    Pre,
    /// After it executed.
    Post,
    /// Both.
    All,
}

/// One registered event.
///
/// Mirrors `DEBUGGER_GENERAL_EVENT_DETAIL` / `DEBUGGER_EVENT`.
#[derive(Clone, Debug)]
pub struct Event {
    /// Unique tag, assigned monotonically from a reserved range.
    pub tag: u64,
    /// The kind of VM-exit this event watches.
    pub kind: EventKind,
    /// Whether the event currently fires.
    pub enabled: bool,
    /// Which core(s) this event applies to.
    pub core_scope: CoreScope,
    /// Which process(es) this event applies to.
    pub process_scope: ProcessScope,
    /// Per-kind payload options.
    pub options: EventOptions,
    /// Actions run, in order, when the event's condition passes.
    pub actions: Vec<Action>,
    /// Compiled condition byte-code, evaluated before running `actions`.
    /// Interpreting it is the embedding script engine's job; this crate
    /// only stores and forwards it (`ScriptHost` in `dispatch.rs`).
    pub condition_program: Option<Vec<u8>>,
    /// Which phase this event fires on.
    pub stage: EventStage,
    /// Whether a `false` condition result should also block sibling events
    /// registered on the same kind from evaluating.
    pub enable_short_circuit: bool,
    /// Tags of other events this one forwards its trigger context to.
    pub output_sources: Vec<u64>,
}

/// All registered events, grouped by kind for fast per-kind iteration at
/// VM-exit time.
///
/// Mirrors `g_Events`.
pub struct EventStore {
    by_kind: RwLock<[Arena<Event>; EventKind::COUNT]>,
    next_tag: spin::Mutex<u64>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// Tags below this value are reserved for built-in, non-user events.
    pub const FIRST_USER_TAG: u64 = 0x1000;

    /// Creates an empty event store.
    pub fn new() -> Self {
        Self {
            by_kind: RwLock::new(core::array::from_fn(|_| Arena::new())),
            next_tag: spin::Mutex::new(Self::FIRST_USER_TAG),
        }
    }

    /// Assigns the event a fresh tag and registers it, returning the tag
    /// and the arena handle.
    pub fn register(&self, mut event: Event) -> (u64, Handle) {
        let tag = {
            let mut next = self.next_tag.lock();
            let tag = *next;
            *next += 1;
            tag
        };
        event.tag = tag;
        let kind_index = event.kind.index();
        let handle = self.by_kind.write()[kind_index].insert(event);
        (tag, handle)
    }

    /// Removes the event registered under `kind`/`handle`, if present.
    pub fn clear(&self, kind: EventKind, handle: Handle) -> Option<Event> {
        self.by_kind.write()[kind.index()].remove(handle)
    }

    /// Enables or disables the event registered under `kind`/`handle`.
    pub fn set_enabled(&self, kind: EventKind, handle: Handle, enabled: bool) -> bool {
        if let Some(event) = self.by_kind.write()[kind.index()].get_mut(handle) {
            event.enabled = enabled;
            true
        } else {
            false
        }
    }

    /// Finds the arena handle of the event carrying `tag`, searching every
    /// kind. Lets the wire protocol address events by the tag it handed the
    /// debugger at registration time instead of an internal arena handle.
    pub fn find_by_tag(&self, tag: u64) -> Option<(EventKind, Handle)> {
        let guard = self.by_kind.read();
        for kind in EventKind::ALL {
            if let Some((handle, _)) = guard[kind.index()].iter().find(|(_, event)| event.tag == tag) {
                return Some((kind, handle));
            }
        }
        None
    }

    /// Returns a snapshot of the event carrying `tag`, if registered.
    pub fn get_by_tag(&self, tag: u64) -> Option<Event> {
        let (kind, handle) = self.find_by_tag(tag)?;
        self.by_kind.read()[kind.index()].get(handle).cloned()
    }

    /// Number of registered events of `kind` whose `core_scope` includes
    /// `core_id`.
    ///
    /// Mirrors `DebuggerEventListCountByCore`.
    pub fn count_by_core(&self, kind: EventKind, core_id: u32) -> usize {
        self.by_kind.read()[kind.index()]
            .iter()
            .filter(|(_, event)| match event.core_scope {
                CoreScope::All => true,
                CoreScope::Core(c) => c == core_id,
            })
            .count()
    }

    /// Calls `f` with every enabled event of `kind`, in registration order.
    pub fn for_each_enabled<F: FnMut(&Event)>(&self, kind: EventKind, mut f: F) {
        let guard = self.by_kind.read();
        for (_, event) in guard[kind.index()].iter() {
            if event.enabled {
                f(event);
            }
        }
    }

    /// Total number of registered events across every kind.
    pub fn total_len(&self) -> usize {
        self.by_kind.read().iter().map(Arena::len).sum()
    }

    /// Folds every enabled `ExceptionOccurred` event scoped to `core_id`
    /// into the exception-bitmap bits it requires, so
    /// [`crate::protected_hv::derive_exception_bitmap`] can fold them in
    /// alongside the other features that also want a say in that bitmap.
    ///
    /// An event's `options.p1` names a single IDT vector, or `u64::MAX` for
    /// "every vector in the first 32 entries" (see
    /// `validate_registration`'s `ExceptionOccurred` check).
    pub fn exception_bitmap_mask_for_core(&self, core_id: u32) -> u32 {
        let mut mask = 0u32;
        self.for_each_enabled(EventKind::ExceptionOccurred, |event| {
            let core_matches = match event.core_scope {
                CoreScope::All => true,
                CoreScope::Core(c) => c == core_id,
            };
            if !core_matches {
                return;
            }
            if event.options.p1 == u64::MAX {
                mask = u32::MAX;
            } else {
                mask |= 1 << event.options.p1;
            }
        });
        mask
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    fn sample_event(kind: EventKind) -> Event {
        Event {
            tag: 0,
            kind,
            enabled: true,
            core_scope: CoreScope::All,
            process_scope: ProcessScope::All,
            options: EventOptions::default(),
            actions: Vec::new(),
            condition_program: None,
            stage: EventStage::Pre,
            enable_short_circuit: false,
            output_sources: Vec::new(),
        }
    }

    #[test]
    fn register_then_clear_round_trips() {
        let store = EventStore::new();
        let (tag, handle) = store.register(sample_event(EventKind::CpuidInstructionExecution));
        assert!(tag >= EventStore::FIRST_USER_TAG);
        assert_eq!(store.total_len(), 1);
        let removed = store.clear(EventKind::CpuidInstructionExecution, handle).unwrap();
        assert_eq!(removed.tag, tag);
        assert_eq!(store.total_len(), 0);
    }

    #[test]
    fn disabled_events_are_skipped_by_for_each_enabled() {
        let store = EventStore::new();
        let (_, handle) = store.register(sample_event(EventKind::VmcallInstructionExecution));
        store.set_enabled(EventKind::VmcallInstructionExecution, handle, false);
        let mut seen = 0;
        store.for_each_enabled(EventKind::VmcallInstructionExecution, |_| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn exception_bitmap_mask_folds_a_single_vector_scoped_to_its_core() {
        let store = EventStore::new();
        let mut event = sample_event(EventKind::ExceptionOccurred);
        event.core_scope = CoreScope::Core(1);
        event.options.p1 = 6;
        store.register(event);

        assert_eq!(store.exception_bitmap_mask_for_core(1), 1 << 6);
        assert_eq!(store.exception_bitmap_mask_for_core(0), 0);
    }

    #[test]
    fn find_by_tag_locates_the_event_regardless_of_kind() {
        let store = EventStore::new();
        let (tag, handle) = store.register(sample_event(EventKind::WrmsrInstructionExecution));
        assert_eq!(store.find_by_tag(tag), Some((EventKind::WrmsrInstructionExecution, handle)));
        assert_eq!(store.get_by_tag(tag).map(|event| event.tag), Some(tag));
        assert_eq!(store.find_by_tag(tag + 1), None);
    }

    #[test]
    fn exception_bitmap_mask_covers_every_vector_when_requested() {
        let store = EventStore::new();
        let mut event = sample_event(EventKind::ExceptionOccurred);
        event.options.p1 = u64::MAX;
        store.register(event);

        assert_eq!(store.exception_bitmap_mask_for_core(0), u32::MAX);
    }
}
