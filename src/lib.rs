//! Trip Supervisor
//!
//! Orchestration core for a multi-step trip planner:
//! - Collects travel preferences from one interactive user
//! - Routes each phase to exactly one task handler (search, planner, calendar, share)
//! - Validates handler output against declared fields before applying it
//! - Retries transient failures and degrades gracefully on non-critical ones
//! - Keeps turns atomic and cancellable, and audits every one of them
//!
//! DISPATCH LOOP:
//! ROUTE → INVOKE → VALIDATE → APPLY → ADVANCE → (WAIT | REPEAT | DONE)

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod retry;
pub mod routing;
pub mod state;
pub mod supervisor;

pub use error::{FailureKind, FailureReport, Result, SupervisorError};

// Re-export common types
pub use config::SupervisorConfig;
pub use models::*;
pub use state::{TripSnapshot, TripState};
pub use supervisor::{SessionManager, Supervisor, TurnReply};
