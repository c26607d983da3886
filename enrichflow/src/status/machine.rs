//! Transition validation on top of the status registry.

use std::sync::Arc;

use super::{StatusCode, StatusRegistry};
use crate::errors::InvalidTransitionError;

/// Fallback retry code when neither the retry map nor the configured
/// default yields a target.
const GENERIC_FAILED: StatusCode = StatusCode(500);

/// Validates proposed transitions against the loaded registry.
///
/// Cheap to clone; holds the registry behind an `Arc`.
#[derive(Debug, Clone)]
pub struct StateMachine {
    registry: Arc<StatusRegistry>,
}

impl StateMachine {
    /// Creates a state machine over a loaded registry.
    #[must_use]
    pub fn new(registry: Arc<StatusRegistry>) -> Self {
        Self { registry }
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    /// Returns true if `from -> to` is allowed.
    ///
    /// Same-state transitions are always valid (idempotent no-op update).
    /// Otherwise the normal adjacency list is consulted, and the manual
    /// list as well when `is_manual` is set.
    #[must_use]
    pub fn is_valid_transition(&self, from: StatusCode, to: StatusCode, is_manual: bool) -> bool {
        if from == to {
            return true;
        }
        if self.registry.normal_targets(from).contains(&to) {
            return true;
        }
        is_manual && self.registry.manual_targets(from).contains(&to)
    }

    /// Validates a transition, failing loudly with the valid next states.
    ///
    /// An invalid transition is a programming or data-integrity error; the
    /// caller must abort the current step before persisting any side
    /// effect.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransitionError`] when the edge is not in the
    /// applicable graphs.
    pub fn validate_transition(
        &self,
        from: StatusCode,
        to: StatusCode,
        is_manual: bool,
    ) -> Result<(), InvalidTransitionError> {
        if self.is_valid_transition(from, to, is_manual) {
            return Ok(());
        }

        let valid_next = self.valid_next_states(from, is_manual);
        let valid_names: Vec<String> = valid_next
            .iter()
            .map(|code| self.registry.label(*code))
            .collect();
        let manual_note = if is_manual { " (including manual)" } else { "" };

        Err(InvalidTransitionError {
            message: format!(
                "Invalid state transition: {} ({from}) -> {} ({to}). Valid next states: [{}]{manual_note}",
                self.registry.label(from),
                self.registry.label(to),
                valid_names.join(", "),
            ),
            from,
            to,
            valid_next,
        })
    }

    /// All valid next states for a status, deduplicated.
    #[must_use]
    pub fn valid_next_states(&self, from: StatusCode, include_manual: bool) -> Vec<StatusCode> {
        let mut states: Vec<StatusCode> = self.registry.normal_targets(from).to_vec();
        if include_manual {
            for code in self.registry.manual_targets(from) {
                if !states.contains(code) {
                    states.push(*code);
                }
            }
        }
        states
    }

    /// True if an agent is in progress at this status.
    #[must_use]
    pub fn is_working_state(&self, code: StatusCode) -> bool {
        self.registry.is_working(code)
    }

    /// True if the status has no outgoing edges in either graph.
    #[must_use]
    pub fn is_terminal_state(&self, code: StatusCode) -> bool {
        self.registry.has_no_outgoing(code)
    }

    /// The status a failed working state retries from.
    ///
    /// Falls back to the configured default, then to the generic `FAILED`
    /// code if no mapping exists.
    #[must_use]
    pub fn retry_state_for(&self, failed_working: StatusCode) -> StatusCode {
        self.registry
            .retry_target(failed_working)
            .or_else(|| self.registry.default_retry())
            .unwrap_or(GENERIC_FAILED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{builtin_config, StatusConfig, StatusRegistry};
    use pretty_assertions::assert_eq;

    fn machine() -> StateMachine {
        StateMachine::new(StatusRegistry::builtin())
    }

    #[test]
    fn test_same_state_always_valid() {
        let sm = machine();
        assert!(sm.is_valid_transition(StatusCode(211), StatusCode(211), false));
        // Even for codes outside the table.
        assert!(sm.is_valid_transition(StatusCode(987), StatusCode(987), false));
    }

    #[test]
    fn test_normal_transition_soundness() {
        let sm = machine();
        let registry = sm.registry().clone();
        let codes: Vec<StatusCode> = (90..620).map(StatusCode).collect();
        for from in &codes {
            let normal = registry.normal_targets(*from).to_vec();
            for to in &codes {
                let expected = from == to || normal.contains(to);
                assert_eq!(
                    sm.is_valid_transition(*from, *to, false),
                    expected,
                    "({from} -> {to})"
                );
            }
        }
    }

    #[test]
    fn test_manual_flag_adds_manual_graph() {
        let sm = machine();
        // PUBLISHED -> TO_SUMMARIZE is a manual re-enrichment edge only.
        assert!(!sm.is_valid_transition(StatusCode(400), StatusCode(210), false));
        assert!(sm.is_valid_transition(StatusCode(400), StatusCode(210), true));
    }

    #[test]
    fn test_validate_transition_enumerates_valid_states() {
        let sm = machine();
        let err = sm
            .validate_transition(StatusCode(211), StatusCode(400), false)
            .unwrap_err();
        assert!(err.message.contains("SUMMARIZING"));
        assert!(err.message.contains("PUBLISHED"));
        assert!(err.message.contains("TO_TAG"));
        assert!(err.valid_next.contains(&StatusCode(220)));
    }

    #[test]
    fn test_valid_next_states_dedupes_manual() {
        let sm = machine();
        let normal_only = sm.valid_next_states(StatusCode(300), false);
        let with_manual = sm.valid_next_states(StatusCode(300), true);
        assert!(normal_only.contains(&StatusCode(310)));
        assert!(!normal_only.contains(&StatusCode(220)));
        assert!(with_manual.contains(&StatusCode(220)));
        let mut deduped = with_manual.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), with_manual.len());
    }

    #[test]
    fn test_working_and_terminal_states() {
        let sm = machine();
        assert!(sm.is_working_state(StatusCode(211)));
        assert!(!sm.is_working_state(StatusCode(210)));
        assert!(sm.is_terminal_state(StatusCode(530)));
        assert!(!sm.is_terminal_state(StatusCode(599)));
        assert!(!sm.is_terminal_state(StatusCode(400)));
    }

    #[test]
    fn test_retry_state_for_mapped_working_state() {
        let sm = machine();
        assert_eq!(sm.retry_state_for(StatusCode(211)), StatusCode(210));
        assert_eq!(sm.retry_state_for(StatusCode(231)), StatusCode(230));
    }

    #[test]
    fn test_retry_state_falls_back_to_default_then_failed() {
        let sm = machine();
        // 310 is not a working state; builtin default is FAILED.
        assert_eq!(sm.retry_state_for(StatusCode(310)), StatusCode(500));

        let config = StatusConfig {
            default_retry: None,
            ..builtin_config()
        };
        let registry = std::sync::Arc::new(StatusRegistry::from_config(&config).unwrap());
        let sm = StateMachine::new(registry);
        assert_eq!(sm.retry_state_for(StatusCode(310)), StatusCode(500));
    }
}
