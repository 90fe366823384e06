//! Routing policy
//!
//! A closed table from phase to the single handler allowed to run in it,
//! plus the graph of legal phase transitions. Nothing here looks at handler
//! implementations; the dispatch loop resolves a `HandlerId` through the
//! registry.

use crate::models::{HandlerId, Phase, PreferenceField};
use crate::state::TripState;

/// What the dispatch loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Run exactly one handler this turn
    Invoke(HandlerId),
    /// Move to another phase without running a handler
    Advance(Phase),
    /// Nothing is eligible until the user says something
    AwaitInput,
    /// Session is over
    Terminal,
}

/// Handler routed in a phase, if any
pub fn handler_for(phase: Phase) -> Option<HandlerId> {
    match phase {
        Phase::Searching => Some(HandlerId::Search),
        Phase::Planning => Some(HandlerId::Planner),
        Phase::Scheduling => Some(HandlerId::Calendar),
        Phase::Sharing => Some(HandlerId::Share),
        Phase::CollectingPreferences
        | Phase::AwaitingConfirmation
        | Phase::Done
        | Phase::Failed => None,
    }
}

/// Forward edge taken when a phase's work finishes (successfully or, for
/// non-critical phases, degraded)
pub fn next_phase(phase: Phase) -> Option<Phase> {
    match phase {
        Phase::CollectingPreferences => Some(Phase::Searching),
        Phase::Searching => Some(Phase::Planning),
        Phase::Planning => Some(Phase::AwaitingConfirmation),
        Phase::AwaitingConfirmation => Some(Phase::Scheduling),
        Phase::Scheduling => Some(Phase::Sharing),
        Phase::Sharing => Some(Phase::Done),
        Phase::Done | Phase::Failed => None,
    }
}

/// Every edge the trip state may ever take
pub fn is_legal_transition(from: Phase, to: Phase) -> bool {
    if from.is_terminal() {
        return false;
    }
    if to == Phase::Failed {
        return true;
    }
    if next_phase(from) == Some(to) {
        return true;
    }
    match (from, to) {
        // plan revision
        (Phase::AwaitingConfirmation, Phase::Planning) => true,
        // user-initiated preference edit
        (Phase::Searching | Phase::Planning | Phase::AwaitingConfirmation, Phase::CollectingPreferences) => {
            true
        }
        _ => false,
    }
}

/// Deterministic phase → route table
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    required_preferences: Vec<PreferenceField>,
}

impl RoutingPolicy {
    pub fn new(required_preferences: Vec<PreferenceField>) -> Self {
        Self {
            required_preferences,
        }
    }

    pub fn required_preferences(&self) -> &[PreferenceField] {
        &self.required_preferences
    }

    pub fn route(&self, state: &TripState) -> Route {
        let phase = state.phase();

        if phase.is_terminal() {
            return Route::Terminal;
        }

        match phase {
            Phase::CollectingPreferences => {
                if state
                    .preferences()
                    .missing(&self.required_preferences)
                    .is_empty()
                {
                    Route::Advance(Phase::Searching)
                } else {
                    Route::AwaitInput
                }
            }
            Phase::AwaitingConfirmation => Route::AwaitInput,
            _ => match handler_for(phase) {
                // A handler asked the user something; it stays parked until
                // the answer arrives.
                Some(_) if state.pending_question().is_some() => Route::AwaitInput,
                Some(handler) => Route::Invoke(handler),
                None => Route::AwaitInput,
            },
        }
    }
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self::new(vec![
            PreferenceField::Destination,
            PreferenceField::Days,
            PreferenceField::Budget,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PendingQuestion, UserInput};
    use serde_json::json;
    use uuid::Uuid;

    const ALL: [Phase; 8] = [
        Phase::CollectingPreferences,
        Phase::Searching,
        Phase::Planning,
        Phase::AwaitingConfirmation,
        Phase::Scheduling,
        Phase::Sharing,
        Phase::Done,
        Phase::Failed,
    ];

    #[test]
    fn test_terminal_phases_have_no_exits() {
        for to in ALL {
            assert!(!is_legal_transition(Phase::Done, to));
            assert!(!is_legal_transition(Phase::Failed, to));
        }
    }

    #[test]
    fn test_done_unreachable_except_from_sharing() {
        for from in ALL {
            let expected = from == Phase::Sharing;
            assert_eq!(is_legal_transition(from, Phase::Done), expected, "{from}");
        }
    }

    #[test]
    fn test_back_edges() {
        assert!(is_legal_transition(Phase::AwaitingConfirmation, Phase::Planning));
        assert!(is_legal_transition(Phase::Planning, Phase::CollectingPreferences));
        assert!(!is_legal_transition(Phase::Scheduling, Phase::Planning));
        assert!(!is_legal_transition(Phase::Sharing, Phase::CollectingPreferences));
        assert!(!is_legal_transition(Phase::Planning, Phase::Searching));
    }

    #[test]
    fn test_route_table() {
        let policy = RoutingPolicy::default();
        let mut state = TripState::new(Uuid::new_v4());
        assert_eq!(policy.route(&state), Route::AwaitInput);

        let input = UserInput::default()
            .with_preference(PreferenceField::Destination, json!("Busan"))
            .with_preference(PreferenceField::Days, json!(3))
            .with_preference(PreferenceField::Budget, json!("medium"));
        state.merge_user_input(&input).unwrap();
        assert_eq!(policy.route(&state), Route::Advance(Phase::Searching));

        state.force_phase(Phase::Searching);
        assert_eq!(policy.route(&state), Route::Invoke(HandlerId::Search));

        state.set_pending_question(Some(PendingQuestion {
            handler: HandlerId::Search,
            question: "Which district?".into(),
        }));
        assert_eq!(policy.route(&state), Route::AwaitInput);

        state.set_pending_question(None);
        state.force_phase(Phase::AwaitingConfirmation);
        assert_eq!(policy.route(&state), Route::AwaitInput);

        state.force_phase(Phase::Sharing);
        assert_eq!(policy.route(&state), Route::Invoke(HandlerId::Share));

        state.force_phase(Phase::Done);
        assert_eq!(policy.route(&state), Route::Terminal);
    }
}
