//! HTTP-backed handler
//!
//! Posts the scoped view and directive to an external service and reads a
//! `HandlerOutcome` back. Transport problems are mapped onto the failure
//! taxonomy so the retry controller can deal with them.

use super::{Handler, HandlerDescriptor, HandlerOutcome};
use crate::error::FailureKind;
use crate::models::HandlerId;
use crate::state::{Directive, StateView};
use crate::Result;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::env;
use std::time::Duration;
use tracing::warn;

#[derive(Serialize)]
struct InvokeRequest<'a> {
    view: &'a StateView,
    directive: &'a Directive,
}

pub struct RemoteHandler {
    descriptor: HandlerDescriptor,
    client: Client,
    endpoint: String,
}

impl RemoteHandler {
    pub fn new(id: HandlerId, endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            descriptor: HandlerDescriptor::standard(id),
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Build from `TRIP_<ID>_HANDLER_URL`, e.g. `TRIP_SEARCH_HANDLER_URL`
    pub fn from_env(id: HandlerId, timeout: Duration) -> Option<Result<Self>> {
        let key = format!("TRIP_{}_HANDLER_URL", id.as_str().to_uppercase());
        let endpoint = env::var(key).ok().filter(|v| !v.trim().is_empty())?;
        Some(Self::new(id, endpoint.trim_end_matches('/'), timeout))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Rate limits and upstream trouble are worth retrying; anything else the
/// service rejected will be rejected again.
pub fn classify_status(status: StatusCode) -> FailureKind {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

fn classify_transport(error: &reqwest::Error) -> FailureKind {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

#[async_trait::async_trait]
impl Handler for RemoteHandler {
    fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, view: &StateView, directive: &Directive) -> HandlerOutcome {
        let body = InvokeRequest { view, directive };

        let response = match self.client.post(&self.endpoint).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(handler = %self.descriptor.id, error = %e, "remote handler request failed");
                return HandlerOutcome::Failure {
                    kind: classify_transport(&e),
                    detail: format!("request to {} failed: {}", self.endpoint, e),
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return HandlerOutcome::Failure {
                kind: classify_status(status),
                detail: format!("{} returned {}: {}", self.endpoint, status, text),
            };
        }

        match response.json::<HandlerOutcome>().await {
            Ok(outcome) => outcome,
            Err(e) => HandlerOutcome::permanent(format!("malformed handler output: {}", e)),
        }
    }
}

impl std::fmt::Debug for RemoteHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandler")
            .field("id", &self.descriptor.id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
