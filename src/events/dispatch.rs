//! Triggers registered events against a live VM-exit context and runs
//! their actions.
//!
//! The condition byte-code VM and the script compiler that produces
//! `condition_program`/`RunScript` payloads are external collaborators;
//! this module defines the [`ScriptHost`] trait the embedding driver
//! implements so dispatch can be exercised here without depending on the
//! real interpreter.

use crate::events::{Action, Event, EventKind, EventStage, EventStore};

/// Outcome of evaluating one event's condition program against a trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionResult {
    /// The condition passed; actions should run.
    Passed,
    /// The condition failed; actions should be skipped.
    Failed,
}

/// Outcome of [`EventDispatch::trigger`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerStatus {
    /// No event of this kind is registered, or none were enabled.
    NoEventRegistered,
    /// At least one event ran its full action list.
    Triggered,
    /// Short-circuiting caused evaluation to stop early.
    ShortCircuited,
}

/// The interface `EventDispatch` calls into for condition evaluation and
/// script/custom-code execution, implemented by the embedding driver (or,
/// in tests, a fake).
pub trait ScriptHost {
    /// Evaluates `program` against the current trigger context.
    fn evaluate_condition(&mut self, program: &[u8]) -> ConditionResult;
    /// Runs a compiled action script.
    fn run_script(&mut self, program: &[u8]);
    /// Runs caller-supplied custom code.
    fn run_custom_code(&mut self, buffer: &[u8]);
    /// Halts every core and hands control to the attached debugger.
    fn break_to_debugger(&mut self);
}

/// Drives event evaluation and action execution for one [`EventStore`].
pub struct EventDispatch<'a> {
    store: &'a EventStore,
}

impl<'a> EventDispatch<'a> {
    /// Builds a dispatcher over `store`.
    pub const fn new(store: &'a EventStore) -> Self {
        Self { store }
    }

    /// Evaluates and, on a passing condition, runs every enabled event of
    /// `kind` whose `stage` is compatible with the caller's `stage` (an
    /// event registered for `EventStage::All` always matches; otherwise the
    /// two must be equal), in registration order. Stops early if an event
    /// both fails its condition and has `enable_short_circuit` set.
    pub fn trigger(&self, kind: EventKind, stage: EventStage, host: &mut dyn ScriptHost) -> TriggerStatus {
        let mut ran_any = false;
        let mut short_circuited = false;

        self.store.for_each_enabled(kind, |event| {
            if short_circuited {
                return;
            }
            if !Self::stage_compatible(event.stage, stage) {
                return;
            }
            match self.evaluate(event, host) {
                ConditionResult::Passed => {
                    self.run_actions(event, host);
                    ran_any = true;
                }
                ConditionResult::Failed => {
                    if event.enable_short_circuit {
                        short_circuited = true;
                    }
                }
            }
        });

        if short_circuited {
            TriggerStatus::ShortCircuited
        } else if ran_any {
            TriggerStatus::Triggered
        } else {
            TriggerStatus::NoEventRegistered
        }
    }

    fn stage_compatible(event_stage: EventStage, caller_stage: EventStage) -> bool {
        matches!(event_stage, EventStage::All) || event_stage == caller_stage
    }

    fn evaluate(&self, event: &Event, host: &mut dyn ScriptHost) -> ConditionResult {
        match &event.condition_program {
            Some(program) => host.evaluate_condition(program),
            None => ConditionResult::Passed,
        }
    }

    fn run_actions(&self, event: &Event, host: &mut dyn ScriptHost) {
        for action in &event.actions {
            match action {
                Action::BreakToDebugger => host.break_to_debugger(),
                Action::RunScript(program) => host.run_script(program),
                Action::RunCustomCode { buffer } => host.run_custom_code(buffer),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::vec::Vec;

    use super::*;
    use crate::events::{CoreScope, EventOptions, EventStage, ProcessScope};

    #[derive(Default)]
    struct RecordingHost {
        broke: usize,
        scripts_run: usize,
        custom_runs: usize,
        next_condition: Option<ConditionResult>,
    }

    impl ScriptHost for RecordingHost {
        fn evaluate_condition(&mut self, _program: &[u8]) -> ConditionResult {
            self.next_condition.unwrap_or(ConditionResult::Passed)
        }
        fn run_script(&mut self, _program: &[u8]) {
            self.scripts_run += 1;
        }
        fn run_custom_code(&mut self, _buffer: &[u8]) {
            self.custom_runs += 1;
        }
        fn break_to_debugger(&mut self) {
            self.broke += 1;
        }
    }

    fn event(actions: Vec<Action>, condition: Option<Vec<u8>>, short_circuit: bool) -> Event {
        Event {
            tag: 0,
            kind: EventKind::CpuidInstructionExecution,
            enabled: true,
            core_scope: CoreScope::All,
            process_scope: ProcessScope::All,
            options: EventOptions::default(),
            actions,
            condition_program: condition,
            stage: EventStage::Pre,
            enable_short_circuit: short_circuit,
            output_sources: Vec::new(),
        }
    }

    #[test]
    fn triggers_run_their_actions_in_order() {
        let store = EventStore::new();
        store.register(event(
            alloc::vec![Action::BreakToDebugger, Action::RunScript(alloc::vec![1])],
            None,
            false,
        ));
        let dispatch = EventDispatch::new(&store);
        let mut host = RecordingHost::default();
        let status = dispatch.trigger(EventKind::CpuidInstructionExecution, EventStage::Pre, &mut host);
        assert_eq!(status, TriggerStatus::Triggered);
        assert_eq!(host.broke, 1);
        assert_eq!(host.scripts_run, 1);
    }

    #[test]
    fn failing_condition_with_short_circuit_stops_the_kind() {
        let store = EventStore::new();
        store.register(event(alloc::vec![Action::BreakToDebugger], Some(alloc::vec![0]), true));
        store.register(event(alloc::vec![Action::BreakToDebugger], None, false));
        let dispatch = EventDispatch::new(&store);
        let mut host = RecordingHost {
            next_condition: Some(ConditionResult::Failed),
            ..Default::default()
        };
        let status = dispatch.trigger(EventKind::CpuidInstructionExecution, EventStage::Pre, &mut host);
        assert_eq!(status, TriggerStatus::ShortCircuited);
        assert_eq!(host.broke, 0);
    }

    #[test]
    fn events_registered_for_a_different_stage_do_not_fire() {
        let store = EventStore::new();
        let mut post_only = event(alloc::vec![Action::BreakToDebugger], None, false);
        post_only.stage = EventStage::Post;
        store.register(post_only);
        let dispatch = EventDispatch::new(&store);
        let mut host = RecordingHost::default();
        let status = dispatch.trigger(EventKind::CpuidInstructionExecution, EventStage::Pre, &mut host);
        assert_eq!(status, TriggerStatus::NoEventRegistered);
        assert_eq!(host.broke, 0);
    }

    #[test]
    fn an_all_stage_event_fires_on_either_stage() {
        let store = EventStore::new();
        let mut all_stage = event(alloc::vec![Action::BreakToDebugger], None, false);
        all_stage.stage = EventStage::All;
        store.register(all_stage);
        let dispatch = EventDispatch::new(&store);
        let mut host = RecordingHost::default();
        dispatch.trigger(EventKind::CpuidInstructionExecution, EventStage::Post, &mut host);
        assert_eq!(host.broke, 1);
    }
}
