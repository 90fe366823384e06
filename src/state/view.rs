//! Scoped handler input and proposed output

use crate::models::{
    Actor, HandlerId, HistoryEntry, HistoryEvent, Phase, Plan, Preferences, SearchItem,
    StateField, StepStatus,
};
use crate::state::TripState;
use serde::{Deserialize, Serialize};

/// Read-only projection of the trip state.
///
/// Only the fields a handler declared as inputs are populated; the rest are
/// `None` even when the underlying state has them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateView {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<Preferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_results: Option<Vec<SearchItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_status: Option<StepStatus>,
}

impl StateView {
    pub fn project(state: &TripState, inputs: &[StateField]) -> Self {
        let wants = |field: StateField| inputs.contains(&field);

        Self {
            phase: state.phase(),
            preferences: wants(StateField::Preferences).then(|| state.preferences().clone()),
            search_results: wants(StateField::SearchResults)
                .then(|| state.search_results().to_vec()),
            plan: if wants(StateField::Plan) {
                state.plan().cloned()
            } else {
                None
            },
            history: wants(StateField::History).then(|| state.history().to_vec()),
            calendar_status: wants(StateField::CalendarStatus)
                .then(|| state.calendar_status().clone()),
            share_status: wants(StateField::ShareStatus).then(|| state.share_status().clone()),
        }
    }
}

/// Scoped task description for one invocation.
///
/// Derived purely from the state so a retry sees exactly the same directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub handler: HandlerId,
    pub phase: Phase,
    pub task: String,
    /// The user's answer to this handler's last question, if it asked one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_reply: Option<String>,
}

impl Directive {
    pub fn for_handler(state: &TripState, handler: HandlerId) -> Self {
        let task = match handler {
            HandlerId::Search => format!(
                "Find candidate places for a trip to {}",
                state.preferences().destination().unwrap_or("the chosen destination")
            ),
            HandlerId::Planner => format!(
                "Build a {}-day itinerary from the search results",
                state.preferences().days().unwrap_or(1)
            ),
            HandlerId::Calendar => "Add the confirmed itinerary to the user's calendar".to_string(),
            HandlerId::Share => "Share the confirmed itinerary".to_string(),
        };

        Self {
            handler,
            phase: state.phase(),
            task,
            user_reply: reply_to_last_question(state, handler),
        }
    }
}

fn reply_to_last_question(state: &TripState, handler: HandlerId) -> Option<String> {
    let mut reply = None;
    for entry in state.history().iter().rev() {
        match (&entry.actor, &entry.event) {
            (Actor::User, HistoryEvent::Message { text }) if reply.is_none() => {
                reply = Some(text.clone());
            }
            (Actor::Handler(asker), HistoryEvent::Question { .. }) if *asker == handler => {
                return reply;
            }
            _ => {}
        }
    }
    None
}

/// Partial update proposed by a handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_results: Option<Vec<SearchItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_status: Option<StepStatus>,
}

impl StateUpdate {
    pub fn search_results(results: Vec<SearchItem>) -> Self {
        Self {
            search_results: Some(results),
            ..Default::default()
        }
    }

    pub fn plan(plan: Plan) -> Self {
        Self {
            plan: Some(plan),
            ..Default::default()
        }
    }

    pub fn calendar_status(status: StepStatus) -> Self {
        Self {
            calendar_status: Some(status),
            ..Default::default()
        }
    }

    pub fn share_status(status: StepStatus) -> Self {
        Self {
            share_status: Some(status),
            ..Default::default()
        }
    }

    /// Fields this update would write
    pub fn touched_fields(&self) -> Vec<StateField> {
        let mut fields = Vec::with_capacity(4);
        if self.search_results.is_some() {
            fields.push(StateField::SearchResults);
        }
        if self.plan.is_some() {
            fields.push(StateField::Plan);
        }
        if self.calendar_status.is_some() {
            fields.push(StateField::CalendarStatus);
        }
        if self.share_status.is_some() {
            fields.push(StateField::ShareStatus);
        }
        fields
    }
}
