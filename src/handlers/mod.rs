//! Handler trait and registry
//!
//! A handler does one unit of work (search, planning, scheduling, sharing)
//! for the supervisor. It sees only the state it declared, returns a proposed
//! update instead of writing state, and must answer identically when given
//! identical input.

use crate::error::{FailureKind, SupervisorError};
use crate::models::{HandlerId, Phase, StateField};
use crate::routing;
use crate::state::{Directive, StateUpdate, StateView};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub mod builtin;
pub mod remote;
pub mod scripted;

pub use builtin::{CatalogSearchHandler, IcsCalendarHandler, SummaryShareHandler, TemplatePlanner};
pub use remote::RemoteHandler;
pub use scripted::{Script, ScriptedHandler};

/// Static metadata every handler publishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub id: HandlerId,
    pub phases: Vec<Phase>,
    pub inputs: Vec<StateField>,
    pub outputs: Vec<StateField>,
}

impl HandlerDescriptor {
    /// Descriptor with the conventional inputs/outputs for a handler identity
    pub fn standard(id: HandlerId) -> Self {
        let (phase, inputs, outputs) = match id {
            HandlerId::Search => (
                Phase::Searching,
                vec![StateField::Preferences, StateField::History],
                vec![StateField::SearchResults],
            ),
            HandlerId::Planner => (
                Phase::Planning,
                vec![StateField::Preferences, StateField::SearchResults],
                vec![StateField::Plan],
            ),
            HandlerId::Calendar => (
                Phase::Scheduling,
                vec![StateField::Preferences, StateField::Plan],
                vec![StateField::CalendarStatus],
            ),
            HandlerId::Share => (
                Phase::Sharing,
                vec![StateField::Preferences, StateField::Plan],
                vec![StateField::ShareStatus],
            ),
        };

        Self {
            id,
            phases: vec![phase],
            inputs,
            outputs,
        }
    }

    pub fn is_eligible(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }

    /// Fields the update writes that were never declared as outputs
    pub fn undeclared_outputs(&self, update: &StateUpdate) -> Vec<StateField> {
        update
            .touched_fields()
            .into_iter()
            .filter(|field| !self.outputs.contains(field))
            .collect()
    }
}

/// What a handler returns for one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandlerOutcome {
    /// Proposed partial state update
    #[serde(rename = "result")]
    Update { update: StateUpdate },
    /// Suspend and ask the user something
    NeedsInput { question: String },
    Failure { kind: FailureKind, detail: String },
}

impl HandlerOutcome {
    pub fn update(update: StateUpdate) -> Self {
        HandlerOutcome::Update { update }
    }

    pub fn needs_input(question: impl Into<String>) -> Self {
        HandlerOutcome::NeedsInput {
            question: question.into(),
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        HandlerOutcome::Failure {
            kind: FailureKind::Transient,
            detail: detail.into(),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        HandlerOutcome::Failure {
            kind: FailureKind::Permanent,
            detail: detail.into(),
        }
    }
}

/// Trait for a single task handler
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    fn descriptor(&self) -> &HandlerDescriptor;
    async fn invoke(&self, view: &StateView, directive: &Directive) -> HandlerOutcome;
}

/// Registry of handlers keyed by identity
pub struct HandlerRegistry {
    handlers: HashMap<HandlerId, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, rejecting descriptors that claim phases the
    /// routing table does not give them
    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<()> {
        let descriptor = handler.descriptor();

        if descriptor.phases.is_empty() {
            return Err(SupervisorError::Config(format!(
                "handler '{}' declares no phases",
                descriptor.id
            )));
        }

        if let Some(phase) = descriptor
            .phases
            .iter()
            .find(|phase| routing::handler_for(**phase) != Some(descriptor.id))
        {
            return Err(SupervisorError::Config(format!(
                "handler '{}' is not routed in phase {}",
                descriptor.id, phase
            )));
        }

        self.handlers.insert(descriptor.id, handler);
        Ok(())
    }

    pub fn get(&self, id: HandlerId) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&id).cloned()
    }

    /// The handler for `id` if it is registered and eligible in `phase`
    pub fn eligible(&self, id: HandlerId, phase: Phase) -> Option<Arc<dyn Handler>> {
        self.get(id)
            .filter(|handler| handler.descriptor().is_eligible(phase))
    }

    pub fn list(&self) -> Vec<HandlerId> {
        let mut ids: Vec<HandlerId> = self.handlers.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with the built-in demo handlers
pub fn create_default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let handlers: [Arc<dyn Handler>; 4] = [
        Arc::new(CatalogSearchHandler::new()),
        Arc::new(TemplatePlanner::new()),
        Arc::new(IcsCalendarHandler::new()),
        Arc::new(SummaryShareHandler::new()),
    ];
    for handler in handlers {
        // built-in descriptors are standard and always routable
        if let Err(e) = registry.register(handler) {
            tracing::error!(error = %e, "failed to register built-in handler");
        }
    }
    registry
}
