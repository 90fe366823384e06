//! Shared trip state
//!
//! The single owned record for one session. Public accessors are read-only;
//! every mutation is `pub(crate)` and driven by the supervisor, which keeps
//! turns serialized and applies them all-or-nothing.

use crate::error::{FailureReport, SupervisorError};
use crate::models::{
    normalize_preference, Actor, HandlerId, HistoryEntry, HistoryEvent, PendingQuestion, Phase,
    Plan, PreferenceField, Preferences, SearchItem, StepStatus, UserInput,
};
use crate::routing;
use crate::state::StateUpdate;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripState {
    session_id: Uuid,
    phase: Phase,
    preferences: Preferences,
    search_results: Vec<SearchItem>,
    plan: Option<Plan>,
    calendar_status: StepStatus,
    share_status: StepStatus,
    turn_count: u32,
    attempt_count: BTreeMap<HandlerId, u32>,
    history: Vec<HistoryEntry>,
    pending_question: Option<PendingQuestion>,
    failure: Option<FailureReport>,
}

/// Serializable hand-off of the trip state for front-ends and storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSnapshot {
    pub session_id: Uuid,
    pub phase: Phase,
    pub preferences: Preferences,
    pub search_results: Vec<SearchItem>,
    pub plan: Option<Plan>,
    pub calendar_status: StepStatus,
    pub share_status: StepStatus,
    pub turn_count: u32,
    pub attempt_count: BTreeMap<HandlerId, u32>,
    pub history: Vec<HistoryEntry>,
    pub pending_question: Option<PendingQuestion>,
    pub failure: Option<FailureReport>,
}

impl TripState {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            phase: Phase::CollectingPreferences,
            preferences: Preferences::new(),
            search_results: Vec::new(),
            plan: None,
            calendar_status: StepStatus::NotAttempted,
            share_status: StepStatus::NotAttempted,
            turn_count: 0,
            attempt_count: BTreeMap::new(),
            history: Vec::new(),
            pending_question: None,
            failure: None,
        }
    }

    /// Rebuild a state from a snapshot previously handed to storage
    pub fn restore(snapshot: TripSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            phase: snapshot.phase,
            preferences: snapshot.preferences,
            search_results: snapshot.search_results,
            plan: snapshot.plan,
            calendar_status: snapshot.calendar_status,
            share_status: snapshot.share_status,
            turn_count: snapshot.turn_count,
            attempt_count: snapshot.attempt_count,
            history: snapshot.history,
            pending_question: snapshot.pending_question,
            failure: snapshot.failure,
        }
    }

    pub fn snapshot(&self) -> TripSnapshot {
        TripSnapshot {
            session_id: self.session_id,
            phase: self.phase,
            preferences: self.preferences.clone(),
            search_results: self.search_results.clone(),
            plan: self.plan.clone(),
            calendar_status: self.calendar_status.clone(),
            share_status: self.share_status.clone(),
            turn_count: self.turn_count,
            attempt_count: self.attempt_count.clone(),
            history: self.history.clone(),
            pending_question: self.pending_question.clone(),
            failure: self.failure.clone(),
        }
    }

    // =============================
    // Read access
    // =============================

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn search_results(&self) -> &[SearchItem] {
        &self.search_results
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn calendar_status(&self) -> &StepStatus {
        &self.calendar_status
    }

    pub fn share_status(&self) -> &StepStatus {
        &self.share_status
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    /// Invocations of `handler` since its phase was last entered
    pub fn attempts(&self, handler: HandlerId) -> u32 {
        self.attempt_count.get(&handler).copied().unwrap_or(0)
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// The last `n` history entries, oldest first
    pub fn recent_history(&self, n: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    pub fn pending_question(&self) -> Option<&PendingQuestion> {
        self.pending_question.as_ref()
    }

    pub fn failure(&self) -> Option<&FailureReport> {
        self.failure.as_ref()
    }

    // =============================
    // Mutation (supervisor only)
    // =============================

    pub(crate) fn record(&mut self, actor: Actor, event: HistoryEvent) {
        self.history.push(HistoryEntry {
            turn: self.turn_count,
            actor,
            event,
        });
    }

    pub(crate) fn begin_turn(&mut self) -> u32 {
        self.turn_count += 1;
        self.turn_count
    }

    pub(crate) fn bump_attempt(&mut self, handler: HandlerId) -> u32 {
        let attempts = self.attempt_count.entry(handler).or_insert(0);
        *attempts += 1;
        *attempts
    }

    pub(crate) fn reset_attempts(&mut self, handler: HandlerId) {
        self.attempt_count.insert(handler, 0);
    }

    pub(crate) fn set_pending_question(&mut self, question: Option<PendingQuestion>) {
        self.pending_question = question;
    }

    /// Move along a legal edge and run the entry rules of the target phase
    pub(crate) fn transition(&mut self, to: Phase) -> Result<()> {
        let from = self.phase;
        if !routing::is_legal_transition(from, to) {
            return Err(SupervisorError::IllegalTransition { from, to });
        }

        self.phase = to;
        self.pending_question = None;

        match to {
            Phase::CollectingPreferences | Phase::Searching => {
                self.search_results.clear();
                self.plan = None;
            }
            Phase::Planning => {
                // revisions replace the plan wholesale
                self.plan = None;
            }
            Phase::Scheduling => self.calendar_status = StepStatus::InProgress,
            Phase::Sharing => self.share_status = StepStatus::InProgress,
            _ => {}
        }

        // fresh attempt budget per phase-entry
        if let Some(handler) = routing::handler_for(to) {
            self.reset_attempts(handler);
        }

        self.record(Actor::Supervisor, HistoryEvent::PhaseChange { from, to });
        Ok(())
    }

    pub(crate) fn fail(&mut self, report: FailureReport) -> Result<()> {
        self.transition(Phase::Failed)?;
        self.record(
            Actor::Supervisor,
            HistoryEvent::Failure {
                failure: report.clone(),
            },
        );
        self.failure = Some(report);
        Ok(())
    }

    pub(crate) fn set_step_status(&mut self, handler: HandlerId, status: StepStatus) {
        match handler {
            HandlerId::Calendar => self.calendar_status = status,
            HandlerId::Share => self.share_status = status,
            HandlerId::Search | HandlerId::Planner => {}
        }
    }

    pub(crate) fn step_status(&self, handler: HandlerId) -> Option<&StepStatus> {
        match handler {
            HandlerId::Calendar => Some(&self.calendar_status),
            HandlerId::Share => Some(&self.share_status),
            HandlerId::Search | HandlerId::Planner => None,
        }
    }

    /// Apply a validated handler update
    pub(crate) fn apply_update(&mut self, update: StateUpdate) {
        if let Some(results) = update.search_results {
            self.search_results.extend(results);
        }
        if let Some(plan) = update.plan {
            self.plan = Some(plan);
        }
        if let Some(status) = update.calendar_status {
            self.calendar_status = status;
        }
        if let Some(status) = update.share_status {
            self.share_status = status;
        }
    }

    /// Record a user turn and fill preference fields that are still empty.
    ///
    /// Already-set fields are left alone; changing them goes through
    /// `overwrite_preferences`. Returns the fields that were ignored.
    pub(crate) fn merge_user_input(&mut self, input: &UserInput) -> Result<Vec<PreferenceField>> {
        let normalized = normalize_all(&input.preferences)?;

        if let Some(text) = input.message.as_ref().filter(|t| !t.trim().is_empty()) {
            self.record(Actor::User, HistoryEvent::Message { text: text.clone() });
        }

        let mut ignored = Vec::new();
        for (field, value) in normalized {
            if self.preferences.contains(field) {
                ignored.push(field);
            } else {
                self.preferences.set(field, value);
            }
        }

        if !ignored.is_empty() {
            let names: Vec<&str> = ignored.iter().map(|f| f.as_str()).collect();
            self.record(
                Actor::Supervisor,
                HistoryEvent::Note {
                    text: format!(
                        "kept existing preference(s) {}; edit them explicitly to change",
                        names.join(", ")
                    ),
                },
            );
        }

        self.pending_question = None;
        Ok(ignored)
    }

    /// Explicit user edit: overwrites whatever was set before
    pub(crate) fn overwrite_preferences(
        &mut self,
        fields: &BTreeMap<PreferenceField, Value>,
    ) -> Result<()> {
        let normalized = normalize_all(fields)?;
        let names: Vec<&str> = normalized.keys().map(|f| f.as_str()).collect();
        self.record(
            Actor::User,
            HistoryEvent::Note {
                text: format!("edited preference(s) {}", names.join(", ")),
            },
        );
        for (field, value) in normalized {
            self.preferences.set(field, value);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn force_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }
}

fn normalize_all(
    fields: &BTreeMap<PreferenceField, Value>,
) -> Result<BTreeMap<PreferenceField, Value>> {
    fields
        .iter()
        .map(|(field, value)| Ok((*field, normalize_preference(*field, value)?)))
        .collect()
}

impl From<&TripState> for TripSnapshot {
    fn from(state: &TripState) -> Self {
        state.snapshot()
    }
}
