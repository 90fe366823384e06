//! Supervisor - the dispatch loop
//!
//! ROUTE → INVOKE → VALIDATE → APPLY → ADVANCE, one turn at a time, until the
//! routing policy waits for the user or the session reaches DONE/FAILED.
//!
//! Every turn runs against a working copy of the trip state. The copy only
//! replaces the caller's state once the turn has finished, so a cancelled or
//! erroring turn leaves nothing behind.

use crate::audit::{compute_state_hash, AuditLog, TurnRecord};
use crate::config::SupervisorConfig;
use crate::error::{FailureKind, FailureReport, SupervisorError};
use crate::handlers::{Handler, HandlerDescriptor, HandlerOutcome, HandlerRegistry};
use crate::models::{
    Actor, ConfirmDecision, HandlerId, HistoryEvent, PendingQuestion, Phase, PreferenceField,
    Preferences, StepStatus, UserInput,
};
use crate::retry::{Decision, RetryController};
use crate::routing::{self, Route, RoutingPolicy};
use crate::state::{Directive, StateUpdate, StateView, TripSnapshot, TripState};
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod session;

pub use session::SessionManager;

/// Result of a single turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A turn was committed; wait `backoff` before the next one
    Ran { backoff: Duration },
    /// Nothing is eligible until the user acts
    Waiting,
    /// Session is DONE or FAILED
    Terminal,
    /// Cancelled mid-turn; nothing was committed
    Cancelled,
}

/// What the caller gets back after a session has been driven
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnReply {
    Snapshot {
        snapshot: TripSnapshot,
    },
    Question {
        handler: HandlerId,
        question: String,
        snapshot: TripSnapshot,
    },
    Failed {
        failure: FailureReport,
        snapshot: TripSnapshot,
    },
    Cancelled {
        snapshot: TripSnapshot,
    },
}

impl TurnReply {
    pub fn from_state(state: &TripState) -> Self {
        let snapshot = state.snapshot();

        if let Some(failure) = state.failure() {
            return TurnReply::Failed {
                failure: failure.clone(),
                snapshot,
            };
        }

        match state.pending_question() {
            Some(pending) => TurnReply::Question {
                handler: pending.handler,
                question: pending.question.clone(),
                snapshot,
            },
            None => TurnReply::Snapshot { snapshot },
        }
    }

    pub fn snapshot(&self) -> &TripSnapshot {
        match self {
            TurnReply::Snapshot { snapshot }
            | TurnReply::Question { snapshot, .. }
            | TurnReply::Failed { snapshot, .. }
            | TurnReply::Cancelled { snapshot } => snapshot,
        }
    }
}

enum Work {
    Advance(Phase),
    Invoke(Arc<dyn Handler>),
}

/// Bookkeeping for the audit record of one turn
struct TurnReport {
    handler: Option<HandlerId>,
    outcome: &'static str,
    backoff: Duration,
}

impl TurnReport {
    fn new(handler: Option<HandlerId>, outcome: &'static str) -> Self {
        Self {
            handler,
            outcome,
            backoff: Duration::ZERO,
        }
    }
}

/// Central dispatcher shared by all sessions
pub struct Supervisor {
    registry: HandlerRegistry,
    policy: RoutingPolicy,
    controller: RetryController,
    audit_log: AuditLog,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(registry: HandlerRegistry, config: SupervisorConfig, audit_log: AuditLog) -> Self {
        Self {
            policy: RoutingPolicy::new(config.required_preferences.clone()),
            controller: RetryController::new(config.retry.clone()),
            registry,
            audit_log,
            config,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit_log
    }

    /// Required preference fields the user has not provided yet
    pub fn missing_preferences(&self, preferences: &Preferences) -> Vec<PreferenceField> {
        preferences.missing(self.policy.required_preferences())
    }

    // =============================
    // Dispatch loop
    // =============================

    /// Run turns until the session waits for input, ends, or is cancelled
    pub async fn drive(
        &self,
        state: &mut TripState,
        cancel: &CancellationToken,
    ) -> Result<TurnReply> {
        loop {
            if cancel.is_cancelled() {
                return Ok(TurnReply::Cancelled {
                    snapshot: state.snapshot(),
                });
            }

            match self.step(state, cancel).await? {
                Step::Ran { backoff } => {
                    if backoff.is_zero() {
                        continue;
                    }
                    debug!(
                        session_id = %state.session_id(),
                        backoff_ms = backoff.as_millis() as u64,
                        "backing off before retry"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Ok(TurnReply::Cancelled { snapshot: state.snapshot() });
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Step::Waiting | Step::Terminal => break,
                Step::Cancelled => {
                    return Ok(TurnReply::Cancelled {
                        snapshot: state.snapshot(),
                    })
                }
            }
        }

        Ok(TurnReply::from_state(state))
    }

    /// Run exactly one turn
    pub async fn step(&self, state: &mut TripState, cancel: &CancellationToken) -> Result<Step> {
        let session_id = state.session_id();
        let phase_before = state.phase();

        let work = match self.policy.route(state) {
            Route::Terminal => return Ok(Step::Terminal),
            Route::AwaitInput => return Ok(Step::Waiting),
            Route::Advance(next) => Work::Advance(next),
            Route::Invoke(id) => match self.registry.eligible(id, phase_before) {
                Some(handler) => Work::Invoke(handler),
                None => {
                    warn!(
                        session_id = %session_id,
                        phase = %phase_before,
                        handler = %id,
                        "no eligible handler registered, returning control"
                    );
                    return Ok(Step::Waiting);
                }
            },
        };

        let mut working = state.clone();
        let turn = working.begin_turn();
        debug!(session_id = %session_id, turn, phase = %phase_before, "turn started");

        let report = if turn > self.config.max_turns {
            let failure = FailureReport::new(
                FailureKind::Budget,
                format!("turn budget of {} exhausted", self.config.max_turns),
            );
            warn!(session_id = %session_id, turn, "turn budget exhausted");
            working.fail(failure)?;
            TurnReport::new(None, "budget")
        } else {
            match work {
                Work::Advance(next) => {
                    working.transition(next)?;
                    TurnReport::new(None, "advance")
                }
                Work::Invoke(handler) => {
                    match self.run_handler(&mut working, handler.as_ref(), cancel).await? {
                        Some(report) => report,
                        None => {
                            info!(
                                session_id = %session_id,
                                turn,
                                "turn cancelled, state left unchanged"
                            );
                            return Ok(Step::Cancelled);
                        }
                    }
                }
            }
        };

        self.audit_log
            .record(TurnRecord {
                record_id: Uuid::new_v4(),
                session_id,
                turn,
                phase_before,
                phase_after: working.phase(),
                handler: report.handler,
                outcome: report.outcome.to_string(),
                state_hash: compute_state_hash(&working),
                recorded_at: Utc::now(),
            })
            .await?;

        *state = working;

        if state.phase() != phase_before {
            info!(
                session_id = %session_id,
                turn,
                from = %phase_before,
                to = %state.phase(),
                "phase changed"
            );
        }

        Ok(Step::Ran {
            backoff: report.backoff,
        })
    }

    /// Invoke one handler against the working copy. `None` means cancelled.
    async fn run_handler(
        &self,
        working: &mut TripState,
        handler: &dyn Handler,
        cancel: &CancellationToken,
    ) -> Result<Option<TurnReport>> {
        let descriptor = handler.descriptor();
        let id = descriptor.id;
        let phase = working.phase();
        let attempts = working.bump_attempt(id);

        let view = StateView::project(working, &descriptor.inputs);
        let directive = Directive::for_handler(working, id);
        let timeout = self.config.handler_timeout;

        debug!(
            session_id = %working.session_id(),
            handler = %id,
            attempt = attempts,
            "invoking handler"
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            result = tokio::time::timeout(timeout, handler.invoke(&view, &directive)) => match result {
                Ok(outcome) => outcome,
                Err(_) => HandlerOutcome::transient(format!(
                    "{} timed out after {}ms",
                    id,
                    timeout.as_millis()
                )),
            },
        };

        let report = match outcome {
            HandlerOutcome::Update { update } => {
                self.apply_result(working, descriptor, attempts, update)?
            }
            HandlerOutcome::NeedsInput { question } => {
                working.record(
                    Actor::Handler(id),
                    HistoryEvent::Question {
                        text: question.clone(),
                    },
                );
                working.set_pending_question(Some(PendingQuestion {
                    handler: id,
                    question,
                }));
                TurnReport::new(Some(id), "needs_input")
            }
            HandlerOutcome::Failure { kind, detail } => {
                self.adjudicate(working, id, phase, attempts, kind, detail)?
            }
        };

        Ok(Some(report))
    }

    fn apply_result(
        &self,
        working: &mut TripState,
        descriptor: &HandlerDescriptor,
        attempts: u32,
        update: StateUpdate,
    ) -> Result<TurnReport> {
        let id = descriptor.id;
        let phase = working.phase();

        let undeclared = descriptor.undeclared_outputs(&update);
        if !undeclared.is_empty() {
            let names: Vec<&str> = undeclared.iter().map(|f| f.as_str()).collect();
            let detail = format!("{} wrote undeclared field(s) {}", id, names.join(", "));
            return self.adjudicate(working, id, phase, attempts, FailureKind::Validation, detail);
        }

        if let Some(missing) = missing_output(id, &update) {
            let detail = format!("malformed handler output: {} returned no {}", id, missing);
            return self.adjudicate(working, id, phase, attempts, FailureKind::Permanent, detail);
        }

        let summary = summarize_update(&update);
        working.apply_update(update);

        if working.step_status(id) == Some(&StepStatus::InProgress) {
            working.set_step_status(
                id,
                StepStatus::Succeeded {
                    detail: "completed".into(),
                },
            );
        }

        working.record(Actor::Handler(id), HistoryEvent::Result { summary });

        if let Some(next) = routing::next_phase(phase) {
            working.transition(next)?;
        }

        Ok(TurnReport::new(Some(id), "result"))
    }

    fn adjudicate(
        &self,
        working: &mut TripState,
        id: HandlerId,
        phase: Phase,
        attempts: u32,
        kind: FailureKind,
        detail: String,
    ) -> Result<TurnReport> {
        warn!(
            session_id = %working.session_id(),
            handler = %id,
            phase = %phase,
            attempt = attempts,
            kind = %kind,
            detail = %detail,
            "handler failed"
        );

        match self.controller.adjudicate(id, phase, attempts, kind, &detail) {
            // nothing is recorded so the retry sees byte-identical input
            Decision::Retry { delay } => Ok(TurnReport {
                handler: Some(id),
                outcome: "retry",
                backoff: delay,
            }),
            Decision::Degrade { next, reason } => {
                working.record(
                    Actor::Handler(id),
                    HistoryEvent::Failure {
                        failure: FailureReport::new(FailureKind::Permanent, reason.clone()),
                    },
                );
                working.set_step_status(id, StepStatus::Failed { reason });
                working.transition(next)?;
                Ok(TurnReport::new(Some(id), "degraded"))
            }
            Decision::Abort(report) => {
                working.fail(report)?;
                Ok(TurnReport::new(Some(id), "aborted"))
            }
        }
    }

    // =============================
    // User operations
    // =============================

    /// Merge a user message and answer any pending question, then drive
    pub async fn submit_input(
        &self,
        state: &mut TripState,
        input: &UserInput,
        cancel: &CancellationToken,
    ) -> Result<TurnReply> {
        let phase = state.phase();
        if phase.is_terminal() {
            return Err(SupervisorError::InvalidPhase {
                operation: "submit_input",
                phase,
            });
        }

        let answered = state.pending_question().map(|pending| pending.handler);
        state.merge_user_input(input)?;
        if let Some(handler) = answered {
            // resuming after a question re-enters the phase
            state.reset_attempts(handler);
        }

        self.drive(state, cancel).await
    }

    pub async fn confirm(
        &self,
        state: &mut TripState,
        decision: ConfirmDecision,
        cancel: &CancellationToken,
    ) -> Result<TurnReply> {
        let phase = state.phase();
        if phase != Phase::AwaitingConfirmation {
            return Err(SupervisorError::InvalidPhase {
                operation: "confirm_plan",
                phase,
            });
        }

        let (next, note) = match decision {
            ConfirmDecision::Accept => (Phase::Scheduling, "plan accepted"),
            ConfirmDecision::Revise => (Phase::Planning, "plan revision requested"),
        };

        let mut working = state.clone();
        working.record(Actor::User, HistoryEvent::Note { text: note.into() });
        working.transition(next)?;
        *state = working;

        info!(session_id = %state.session_id(), decision = ?decision, "plan confirmation received");
        self.drive(state, cancel).await
    }

    /// Explicit user edit of preferences; sends the session back to collection
    pub async fn edit_preferences(
        &self,
        state: &mut TripState,
        fields: &BTreeMap<PreferenceField, Value>,
        cancel: &CancellationToken,
    ) -> Result<TurnReply> {
        let phase = state.phase();
        if !phase.accepts_preference_edits() {
            return Err(SupervisorError::InvalidPhase {
                operation: "edit_preferences",
                phase,
            });
        }
        if fields.is_empty() {
            return Err(SupervisorError::InvalidPreference(
                "no preference fields to edit".into(),
            ));
        }

        let mut working = state.clone();
        working.overwrite_preferences(fields)?;
        if phase != Phase::CollectingPreferences {
            working.transition(Phase::CollectingPreferences)?;
        }
        *state = working;

        self.drive(state, cancel).await
    }

    /// Skip the calendar or share step
    pub async fn skip(&self, state: &mut TripState, cancel: &CancellationToken) -> Result<TurnReply> {
        let phase = state.phase();
        let (handler, next) = match phase {
            Phase::Scheduling => (HandlerId::Calendar, Phase::Sharing),
            Phase::Sharing => (HandlerId::Share, Phase::Done),
            _ => {
                return Err(SupervisorError::InvalidPhase {
                    operation: "skip_step",
                    phase,
                })
            }
        };

        let mut working = state.clone();
        working.record(
            Actor::User,
            HistoryEvent::Note {
                text: format!("skipped {}", handler),
            },
        );
        working.set_step_status(handler, StepStatus::Skipped);
        working.transition(next)?;
        *state = working;

        self.drive(state, cancel).await
    }

    /// Replace the session's state with a fresh one
    pub async fn reset(&self, state: &mut TripState) -> Result<TurnReply> {
        let session_id = state.session_id();
        self.audit_log.clear_session(session_id).await?;
        *state = TripState::new(session_id);

        info!(session_id = %session_id, "session reset");
        Ok(TurnReply::from_state(state))
    }
}

/// Output a handler must produce for its phase to make progress
fn missing_output(handler: HandlerId, update: &StateUpdate) -> Option<&'static str> {
    match handler {
        HandlerId::Search if update.search_results.is_none() => Some("search_results"),
        HandlerId::Planner if update.plan.is_none() => Some("plan"),
        _ => None,
    }
}

fn summarize_update(update: &StateUpdate) -> String {
    let mut parts = Vec::new();
    if let Some(results) = &update.search_results {
        parts.push(format!("{} candidate(s) found", results.len()));
    }
    if let Some(plan) = &update.plan {
        parts.push(format!(
            "plan '{}' with {} day(s), {} activities",
            plan.title,
            plan.days.len(),
            plan.activity_count()
        ));
    }
    if let Some(status) = &update.calendar_status {
        parts.push(format!("calendar {}", status_label(status)));
    }
    if let Some(status) = &update.share_status {
        parts.push(format!("share {}", status_label(status)));
    }
    if parts.is_empty() {
        "no changes".to_string()
    } else {
        parts.join("; ")
    }
}

fn status_label(status: &StepStatus) -> &'static str {
    match status {
        StepStatus::NotAttempted => "not attempted",
        StepStatus::InProgress => "in progress",
        StepStatus::Succeeded { .. } => "succeeded",
        StepStatus::Skipped => "skipped",
        StepStatus::Failed { .. } => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{create_default_registry, Script, ScriptedHandler};
    use crate::models::{DayEntry, Plan, SearchItem};
    use crate::retry::Backoff;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn place(name: &str) -> SearchItem {
        SearchItem {
            name: name.into(),
            category: "nature".into(),
            location: "Busan".into(),
            description: String::new(),
            rating: None,
        }
    }

    fn search_ok(name: &str) -> HandlerOutcome {
        HandlerOutcome::update(StateUpdate::search_results(vec![place(name)]))
    }

    fn plan_ok(title: &str) -> HandlerOutcome {
        HandlerOutcome::update(StateUpdate::plan(Plan {
            title: title.into(),
            days: vec![DayEntry {
                day_number: 1,
                date: None,
                activities: vec![],
            }],
        }))
    }

    fn ok_search() -> ScriptedHandler {
        ScriptedHandler::always(HandlerId::Search, search_ok("Haeundae Beach"))
    }

    fn ok_planner() -> ScriptedHandler {
        ScriptedHandler::always(HandlerId::Planner, plan_ok("Busan in 3 days"))
    }

    fn ok_calendar() -> ScriptedHandler {
        ScriptedHandler::always(
            HandlerId::Calendar,
            HandlerOutcome::update(StateUpdate::calendar_status(StepStatus::Succeeded {
                detail: "exported 0 events".into(),
            })),
        )
    }

    fn ok_share() -> ScriptedHandler {
        // leaves the status alone; the loop marks it succeeded
        ScriptedHandler::always(HandlerId::Share, HandlerOutcome::update(StateUpdate::default()))
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig::default()
            .with_backoff(Backoff::none())
            .with_handler_timeout(Duration::from_millis(50))
    }

    fn busan() -> UserInput {
        UserInput::message("Three days in Busan, medium budget")
            .with_preference(PreferenceField::Destination, json!("Busan"))
            .with_preference(PreferenceField::Days, json!(3))
            .with_preference(PreferenceField::Budget, json!("medium"))
    }

    struct Fixture {
        supervisor: Supervisor,
        search: Arc<ScriptedHandler>,
        planner: Arc<ScriptedHandler>,
        calendar: Arc<ScriptedHandler>,
        share: Arc<ScriptedHandler>,
    }

    impl Fixture {
        fn new(
            config: SupervisorConfig,
            search: ScriptedHandler,
            planner: ScriptedHandler,
            calendar: ScriptedHandler,
            share: ScriptedHandler,
        ) -> Self {
            let search = Arc::new(search);
            let planner = Arc::new(planner);
            let calendar = Arc::new(calendar);
            let share = Arc::new(share);

            let mut registry = HandlerRegistry::new();
            registry.register(search.clone()).unwrap();
            registry.register(planner.clone()).unwrap();
            registry.register(calendar.clone()).unwrap();
            registry.register(share.clone()).unwrap();

            Self {
                supervisor: Supervisor::new(registry, config, AuditLog::new()),
                search,
                planner,
                calendar,
                share,
            }
        }

        fn happy() -> Self {
            Self::new(fast_config(), ok_search(), ok_planner(), ok_calendar(), ok_share())
        }
    }

    fn assert_legal_history(state: &TripState) {
        for entry in state.history() {
            if let HistoryEvent::PhaseChange { from, to } = entry.event {
                assert!(
                    routing::is_legal_transition(from, to),
                    "illegal transition {} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[tokio::test]
    async fn test_complete_preferences_advance_in_one_turn() {
        let f = Fixture::happy();
        let mut state = TripState::new(Uuid::new_v4());
        state.merge_user_input(&busan()).unwrap();

        let step = f.supervisor.step(&mut state, &CancellationToken::new()).await.unwrap();

        assert_eq!(step, Step::Ran { backoff: Duration::ZERO });
        assert_eq!(state.phase(), Phase::Searching);
        assert_eq!(state.turn_count(), 1);
        assert_eq!(f.search.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_incomplete_preferences_wait_without_a_turn() {
        let f = Fixture::happy();
        let mut state = TripState::new(Uuid::new_v4());
        let input = UserInput::message("Somewhere warm")
            .with_preference(PreferenceField::Destination, json!("Busan"));

        let reply = assert_ok!(
            f.supervisor
                .submit_input(&mut state, &input, &CancellationToken::new())
                .await
        );

        assert!(matches!(reply, TurnReply::Snapshot { .. }));
        assert_eq!(state.phase(), Phase::CollectingPreferences);
        assert_eq!(state.turn_count(), 0);
        assert_eq!(
            f.supervisor.missing_preferences(state.preferences()),
            vec![PreferenceField::Days, PreferenceField::Budget]
        );
    }

    #[tokio::test]
    async fn test_search_times_out_twice_then_succeeds() {
        let slow = Duration::from_millis(500);
        let search = ScriptedHandler::new(
            HandlerId::Search,
            vec![
                Script::Delay(slow, search_ok("stale 1")),
                Script::Delay(slow, search_ok("stale 2")),
                Script::Return(search_ok("Haeundae Beach")),
            ],
        );
        let f = Fixture::new(fast_config(), search, ok_planner(), ok_calendar(), ok_share());
        let cancel = CancellationToken::new();

        let mut state = TripState::new(Uuid::new_v4());
        state.merge_user_input(&busan()).unwrap();
        for _ in 0..4 {
            f.supervisor.step(&mut state, &cancel).await.unwrap();
        }

        assert_eq!(state.phase(), Phase::Planning);
        assert_eq!(state.attempts(HandlerId::Search), 3);
        assert_eq!(state.search_results(), &[place("Haeundae Beach")]);

        // every retry saw exactly the same input
        let calls = f.search.calls().await;
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], calls[1]);
        assert_eq!(calls[1], calls[2]);
    }

    #[tokio::test]
    async fn test_transient_failures_never_exceed_ceiling() {
        let search = ScriptedHandler::always(HandlerId::Search, HandlerOutcome::transient("503"));
        let f = Fixture::new(fast_config(), search, ok_planner(), ok_calendar(), ok_share());

        let mut state = TripState::new(Uuid::new_v4());
        let reply = f
            .supervisor
            .submit_input(&mut state, &busan(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(f.search.call_count().await, 3);
        assert_eq!(f.planner.call_count().await, 0);
        match reply {
            TurnReply::Failed { failure, snapshot } => {
                assert_eq!(failure.kind, FailureKind::Permanent);
                assert!(failure.detail.contains("503"));
                assert_eq!(snapshot.phase, Phase::Failed);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_legal_history(&state);
    }

    #[tokio::test]
    async fn test_critical_failure_stops_the_session() {
        let planner = ScriptedHandler::always(
            HandlerId::Planner,
            HandlerOutcome::permanent("planner rejected the request"),
        );
        let f = Fixture::new(fast_config(), ok_search(), planner, ok_calendar(), ok_share());

        let mut state = TripState::new(Uuid::new_v4());
        let reply = f
            .supervisor
            .submit_input(&mut state, &busan(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            reply,
            TurnReply::Failed { ref failure, .. } if failure.detail == "planner rejected the request"
        ));
        assert_eq!(state.phase(), Phase::Failed);
        assert_eq!(f.planner.call_count().await, 1);
        assert_eq!(f.calendar.call_count().await, 0);

        // terminal sessions take no more input
        let err = assert_err!(
            f.supervisor
                .submit_input(&mut state, &UserInput::message("retry?"), &CancellationToken::new())
                .await
        );
        assert!(matches!(err, SupervisorError::InvalidPhase { .. }));
    }

    #[tokio::test]
    async fn test_missing_plan_is_permanent() {
        let planner = ScriptedHandler::always(
            HandlerId::Planner,
            HandlerOutcome::update(StateUpdate::default()),
        );
        let f = Fixture::new(fast_config(), ok_search(), planner, ok_calendar(), ok_share());

        let mut state = TripState::new(Uuid::new_v4());
        f.supervisor
            .submit_input(&mut state, &busan(), &CancellationToken::new())
            .await
            .unwrap();

        let failure = state.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert!(failure.detail.contains("returned no plan"));
    }

    #[tokio::test]
    async fn test_undeclared_write_is_fatal() {
        // search tries to write a plan
        let search = ScriptedHandler::always(HandlerId::Search, plan_ok("sneaky"));
        let f = Fixture::new(fast_config(), search, ok_planner(), ok_calendar(), ok_share());

        let mut state = TripState::new(Uuid::new_v4());
        f.supervisor
            .submit_input(&mut state, &busan(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state.phase(), Phase::Failed);
        assert_eq!(state.failure().map(|f| f.kind), Some(FailureKind::Validation));
        assert!(state.plan().is_none());
        assert_eq!(f.search.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_revise_discards_plan() {
        let planner = ScriptedHandler::new(
            HandlerId::Planner,
            vec![
                Script::Return(plan_ok("first draft")),
                Script::Return(plan_ok("second draft")),
            ],
        );
        let f = Fixture::new(fast_config(), ok_search(), planner, ok_calendar(), ok_share());
        let cancel = CancellationToken::new();

        let mut state = TripState::new(Uuid::new_v4());
        f.supervisor.submit_input(&mut state, &busan(), &cancel).await.unwrap();
        assert_eq!(state.phase(), Phase::AwaitingConfirmation);
        assert_eq!(state.plan().map(|p| p.title.as_str()), Some("first draft"));

        f.supervisor
            .confirm(&mut state, ConfirmDecision::Revise, &cancel)
            .await
            .unwrap();

        assert_eq!(state.phase(), Phase::AwaitingConfirmation);
        assert_eq!(state.plan().map(|p| p.title.as_str()), Some("second draft"));
        assert_eq!(state.plan().map(|p| p.days.len()), Some(1));

        // revision goes back to planning only
        assert_eq!(f.search.call_count().await, 1);
        assert_eq!(f.planner.call_count().await, 2);
        assert!(state.history().iter().any(|e| e.event
            == HistoryEvent::PhaseChange {
                from: Phase::AwaitingConfirmation,
                to: Phase::Planning
            }));
        assert_legal_history(&state);
    }

    #[tokio::test]
    async fn test_calendar_failure_degrades_and_share_still_runs() {
        let calendar = ScriptedHandler::always(
            HandlerId::Calendar,
            HandlerOutcome::permanent("calendar API rejected token"),
        );
        let f = Fixture::new(fast_config(), ok_search(), ok_planner(), calendar, ok_share());
        let cancel = CancellationToken::new();

        let mut state = TripState::new(Uuid::new_v4());
        f.supervisor.submit_input(&mut state, &busan(), &cancel).await.unwrap();
        let reply = f
            .supervisor
            .confirm(&mut state, ConfirmDecision::Accept, &cancel)
            .await
            .unwrap();

        assert!(matches!(reply, TurnReply::Snapshot { .. }));
        assert_eq!(state.phase(), Phase::Done);
        assert_eq!(
            state.calendar_status(),
            &StepStatus::Failed {
                reason: "calendar API rejected token".into()
            }
        );
        assert_eq!(f.share.call_count().await, 1);
        assert_eq!(
            state.share_status(),
            &StepStatus::Succeeded {
                detail: "completed".into()
            }
        );
        assert!(state.failure().is_none());
        assert_legal_history(&state);
    }

    #[tokio::test]
    async fn test_calendar_retries_exhausted_degrade_to_sharing() {
        let calendar =
            ScriptedHandler::always(HandlerId::Calendar, HandlerOutcome::transient("calendar 503"));
        let f = Fixture::new(fast_config(), ok_search(), ok_planner(), calendar, ok_share());
        let cancel = CancellationToken::new();

        let mut state = TripState::new(Uuid::new_v4());
        f.supervisor.submit_input(&mut state, &busan(), &cancel).await.unwrap();
        let reply = f
            .supervisor
            .confirm(&mut state, ConfirmDecision::Accept, &cancel)
            .await
            .unwrap();

        assert!(matches!(reply, TurnReply::Snapshot { .. }));
        assert_eq!(f.calendar.call_count().await, 3);
        assert_eq!(state.attempts(HandlerId::Calendar), 3);
        assert_eq!(
            state.calendar_status(),
            &StepStatus::Failed {
                reason: "calendar gave up after 3 attempts: calendar 503".into()
            }
        );

        // degraded into SHARING, which still ran
        assert!(state.history().iter().any(|e| e.event
            == HistoryEvent::PhaseChange {
                from: Phase::Scheduling,
                to: Phase::Sharing
            }));
        assert_eq!(f.share.call_count().await, 1);
        assert_eq!(state.phase(), Phase::Done);
        assert!(state.failure().is_none());
        assert_legal_history(&state);
    }

    #[tokio::test]
    async fn test_share_failure_still_reaches_done() {
        let share = ScriptedHandler::always(HandlerId::Share, HandlerOutcome::permanent("kakao down"));
        let f = Fixture::new(fast_config(), ok_search(), ok_planner(), ok_calendar(), share);
        let cancel = CancellationToken::new();

        let mut state = TripState::new(Uuid::new_v4());
        f.supervisor.submit_input(&mut state, &busan(), &cancel).await.unwrap();
        let reply = f
            .supervisor
            .confirm(&mut state, ConfirmDecision::Accept, &cancel)
            .await
            .unwrap();

        assert!(matches!(reply, TurnReply::Snapshot { .. }));
        assert_eq!(state.phase(), Phase::Done);
        assert_eq!(
            state.share_status(),
            &StepStatus::Failed {
                reason: "kakao down".into()
            }
        );
        assert!(matches!(state.calendar_status(), StepStatus::Succeeded { .. }));
        assert!(state.failure().is_none());
        assert_eq!(f.share.call_count().await, 1);
        assert_legal_history(&state);
    }

    #[tokio::test]
    async fn test_needs_input_suspends_and_resumes() {
        let search = ScriptedHandler::new(
            HandlerId::Search,
            vec![
                Script::Return(HandlerOutcome::needs_input("Which district?")),
                Script::Return(search_ok("Haeundae Beach")),
            ],
        );
        let f = Fixture::new(fast_config(), search, ok_planner(), ok_calendar(), ok_share());
        let cancel = CancellationToken::new();

        let mut state = TripState::new(Uuid::new_v4());
        let reply = f.supervisor.submit_input(&mut state, &busan(), &cancel).await.unwrap();

        match reply {
            TurnReply::Question { handler, question, .. } => {
                assert_eq!(handler, HandlerId::Search);
                assert_eq!(question, "Which district?");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(state.phase(), Phase::Searching);

        // parked until the user answers
        assert_eq!(f.supervisor.step(&mut state, &cancel).await.unwrap(), Step::Waiting);

        f.supervisor
            .submit_input(&mut state, &UserInput::message("Haeundae"), &cancel)
            .await
            .unwrap();

        assert_eq!(state.phase(), Phase::AwaitingConfirmation);
        let calls = f.search.calls().await;
        assert_eq!(calls[1].1.user_reply.as_deref(), Some("Haeundae"));
        assert_eq!(state.attempts(HandlerId::Search), 1);
    }

    #[tokio::test]
    async fn test_skip_step() {
        let calendar = ScriptedHandler::always(
            HandlerId::Calendar,
            HandlerOutcome::needs_input("Which calendar should I use?"),
        );
        let f = Fixture::new(fast_config(), ok_search(), ok_planner(), calendar, ok_share());
        let cancel = CancellationToken::new();

        let mut state = TripState::new(Uuid::new_v4());
        f.supervisor.submit_input(&mut state, &busan(), &cancel).await.unwrap();
        let reply = f
            .supervisor
            .confirm(&mut state, ConfirmDecision::Accept, &cancel)
            .await
            .unwrap();
        assert!(matches!(reply, TurnReply::Question { handler: HandlerId::Calendar, .. }));

        f.supervisor.skip(&mut state, &cancel).await.unwrap();

        assert_eq!(state.phase(), Phase::Done);
        assert_eq!(state.calendar_status(), &StepStatus::Skipped);
        assert_eq!(f.share.call_count().await, 1);
        assert!(matches!(
            f.supervisor.skip(&mut state, &cancel).await,
            Err(SupervisorError::InvalidPhase { operation: "skip_step", .. })
        ));
    }

    #[tokio::test]
    async fn test_edit_preferences_restarts_search() {
        let f = Fixture::happy();
        let cancel = CancellationToken::new();

        let mut state = TripState::new(Uuid::new_v4());
        f.supervisor.submit_input(&mut state, &busan(), &cancel).await.unwrap();
        assert_eq!(state.phase(), Phase::AwaitingConfirmation);

        let mut edit = BTreeMap::new();
        edit.insert(PreferenceField::Destination, json!("Jeju"));
        f.supervisor
            .edit_preferences(&mut state, &edit, &cancel)
            .await
            .unwrap();

        assert_eq!(state.phase(), Phase::AwaitingConfirmation);
        assert_eq!(state.preferences().destination(), Some("Jeju"));
        assert_eq!(state.search_results().len(), 1);

        let calls = f.search.calls().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].0.preferences.as_ref().and_then(|p| p.destination()),
            Some("Jeju")
        );
        assert_legal_history(&state);
    }

    #[tokio::test]
    async fn test_operations_rejected_in_wrong_phase() {
        let f = Fixture::happy();
        let cancel = CancellationToken::new();
        let mut state = TripState::new(Uuid::new_v4());
        let before = state.clone();

        assert!(matches!(
            f.supervisor.confirm(&mut state, ConfirmDecision::Accept, &cancel).await,
            Err(SupervisorError::InvalidPhase { operation: "confirm_plan", .. })
        ));
        assert!(matches!(
            f.supervisor.skip(&mut state, &cancel).await,
            Err(SupervisorError::InvalidPhase { .. })
        ));
        assert!(matches!(
            f.supervisor.edit_preferences(&mut state, &BTreeMap::new(), &cancel).await,
            Err(SupervisorError::InvalidPreference(_))
        ));
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn test_turn_budget_is_fatal() {
        let search = ScriptedHandler::always(HandlerId::Search, HandlerOutcome::transient("busy"));
        let config = fast_config()
            .with_max_turns(2)
            .with_retry_ceiling(HandlerId::Search, 10);
        let f = Fixture::new(config, search, ok_planner(), ok_calendar(), ok_share());

        let mut state = TripState::new(Uuid::new_v4());
        let reply = f
            .supervisor
            .submit_input(&mut state, &busan(), &CancellationToken::new())
            .await
            .unwrap();

        match reply {
            TurnReply::Failed { failure, .. } => assert_eq!(failure.kind, FailureKind::Budget),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(state.turn_count(), 3);
        assert_eq!(f.search.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_turn_leaves_state_unchanged() {
        let search = ScriptedHandler::new(
            HandlerId::Search,
            vec![Script::Delay(Duration::from_secs(10), search_ok("never"))],
        );
        let config = fast_config().with_handler_timeout(Duration::from_secs(30));
        let f = Fixture::new(config, search, ok_planner(), ok_calendar(), ok_share());

        let mut state = TripState::new(Uuid::new_v4());
        state.merge_user_input(&busan()).unwrap();
        f.supervisor
            .step(&mut state, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.phase(), Phase::Searching);

        let before = state.clone();
        let hash = compute_state_hash(&state);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let reply = f.supervisor.drive(&mut state, &cancel).await.unwrap();

        assert!(matches!(reply, TurnReply::Cancelled { .. }));
        assert_eq!(state, before);
        assert_eq!(compute_state_hash(&state), hash);
        assert_eq!(f.search.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_identical_sessions_produce_identical_state() {
        let session_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let mut first = TripState::new(session_id);
        let mut second = TripState::new(session_id);
        let a = Fixture::happy();
        let b = Fixture::happy();
        a.supervisor.submit_input(&mut first, &busan(), &cancel).await.unwrap();
        b.supervisor.submit_input(&mut second, &busan(), &cancel).await.unwrap();

        assert_eq!(compute_state_hash(&first), compute_state_hash(&second));
    }

    #[tokio::test]
    async fn test_built_in_handlers_run_to_done() {
        let supervisor = Supervisor::new(create_default_registry(), fast_config(), AuditLog::new());
        let cancel = CancellationToken::new();

        let mut state = TripState::new(Uuid::new_v4());
        let input = busan()
            .with_preference(PreferenceField::StartDate, json!("2026-11-02"))
            .with_preference(PreferenceField::TravelStyle, json!("food, nature"));
        supervisor.submit_input(&mut state, &input, &cancel).await.unwrap();

        assert_eq!(state.phase(), Phase::AwaitingConfirmation);
        assert_eq!(state.plan().map(|p| p.days.len()), Some(3));

        supervisor
            .confirm(&mut state, ConfirmDecision::Accept, &cancel)
            .await
            .unwrap();

        assert_eq!(state.phase(), Phase::Done);
        assert!(matches!(state.calendar_status(), StepStatus::Succeeded { .. }));
        assert!(matches!(state.share_status(), StepStatus::Succeeded { .. }));

        let records = supervisor
            .audit_log()
            .list_for_session(state.session_id())
            .await
            .unwrap();
        assert_eq!(records.len() as u32, state.turn_count());
        assert!(supervisor.audit_log().matches_state(&state).await.unwrap());
        assert_legal_history(&state);
    }

    #[tokio::test]
    async fn test_reset_starts_over() {
        let f = Fixture::happy();
        let cancel = CancellationToken::new();

        let mut state = TripState::new(Uuid::new_v4());
        let session_id = state.session_id();
        f.supervisor.submit_input(&mut state, &busan(), &cancel).await.unwrap();

        let reply = f.supervisor.reset(&mut state).await.unwrap();

        assert_eq!(reply.snapshot().phase, Phase::CollectingPreferences);
        assert_eq!(state, TripState::new(session_id));
        assert!(f
            .supervisor
            .audit_log()
            .list_for_session(session_id)
            .await
            .unwrap()
            .is_empty());
    }
}
