//! Condition evaluation over an enrollee's event history.
//!
//! Sequence-wide stop rules run first against the whole history. Step-level
//! conditions then run first-match in declaration order, scoped to events
//! recorded since the evaluated step executed.

use crate::types::{
    Condition, ConditionAction, EndReason, Event, EventKind, SequenceSettings, Step, Verdict,
};

#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `step`'s conditions (if any) plus the global stop rules.
    /// `window_start` is the history index where the step's scope begins.
    pub fn evaluate(
        &self,
        settings: &SequenceSettings,
        step: Option<&Step>,
        history: &[Event],
        window_start: usize,
    ) -> Verdict {
        if let Some(reason) = self.global_stop(settings, history) {
            return Verdict::End(reason);
        }
        let Some(step) = step else {
            return Verdict::Continue;
        };
        let scoped = history.get(window_start..).unwrap_or(&[]);
        match self.first_match(&step.conditions, scoped) {
            None => Verdict::Continue,
            Some(condition) => match condition.action {
                ConditionAction::Continue => Verdict::Continue,
                ConditionAction::SkipTo { step: target } => Verdict::SkipTo(target),
                ConditionAction::EndSequence => Verdict::End(EndReason::Condition {
                    step: step.step_number,
                    trigger: condition.trigger,
                }),
            },
        }
    }

    /// First condition whose trigger appears in `events`.
    pub fn first_match<'c>(&self, conditions: &'c [Condition], events: &[Event]) -> Option<&'c Condition> {
        conditions
            .iter()
            .find(|c| events.iter().any(|e| c.trigger.matches(e.kind)))
    }

    /// Sequence-wide stop rules. These apply regardless of which step is current.
    pub fn global_stop(&self, settings: &SequenceSettings, history: &[Event]) -> Option<EndReason> {
        let seen = |kind: EventKind| history.iter().any(|e| e.kind == kind);
        if settings.respect_unsubscribes && seen(EventKind::Unsubscribed) {
            return Some(EndReason::Unsubscribed);
        }
        if settings.stop_on_reply && seen(EventKind::Replied) {
            return Some(EndReason::Replied);
        }
        if settings.stop_on_auto_reply && seen(EventKind::AutoReplied) {
            return Some(EndReason::AutoReplied);
        }
        if settings.stop_on_out_of_office && seen(EventKind::OutOfOffice) {
            return Some(EndReason::OutOfOffice);
        }
        None
    }
}
