//! Scripted handler for tests and demos
//!
//! Plays back a fixed sequence of outcomes, one per invocation, and records
//! every view/directive pair it was called with.

use super::{Handler, HandlerDescriptor, HandlerOutcome};
use crate::models::HandlerId;
use crate::state::{Directive, StateView};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub enum Script {
    Return(HandlerOutcome),
    /// Sleep before returning; used to trip the supervisor's timeout
    Delay(Duration, HandlerOutcome),
}

pub struct ScriptedHandler {
    descriptor: HandlerDescriptor,
    script: Mutex<VecDeque<Script>>,
    /// Returned once the script runs out
    fallback: HandlerOutcome,
    calls: Mutex<Vec<(StateView, Directive)>>,
}

impl ScriptedHandler {
    pub fn new(id: HandlerId, script: Vec<Script>) -> Self {
        Self::with_descriptor(HandlerDescriptor::standard(id), script)
    }

    pub fn with_descriptor(descriptor: HandlerDescriptor, script: Vec<Script>) -> Self {
        Self {
            descriptor,
            script: Mutex::new(script.into()),
            fallback: HandlerOutcome::permanent("script exhausted"),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Handler that always answers with the same outcome
    pub fn always(id: HandlerId, outcome: HandlerOutcome) -> Self {
        let mut handler = Self::new(id, Vec::new());
        handler.fallback = outcome;
        handler
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn calls(&self) -> Vec<(StateView, Directive)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Handler for ScriptedHandler {
    fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, view: &StateView, directive: &Directive) -> HandlerOutcome {
        self.calls
            .lock()
            .await
            .push((view.clone(), directive.clone()));

        let next = self.script.lock().await.pop_front();
        match next {
            Some(Script::Return(outcome)) => outcome,
            Some(Script::Delay(delay, outcome)) => {
                tokio::time::sleep(delay).await;
                outcome
            }
            None => self.fallback.clone(),
        }
    }
}
