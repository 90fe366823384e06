//! Audit logging of supervisor turns
//!
//! Every completed turn is recorded with a hash of the state it produced,
//! so a stored snapshot can later be checked against the log.

use crate::models::{HandlerId, Phase};
use crate::state::TripState;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One dispatch-loop turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub record_id: Uuid,
    pub session_id: Uuid,
    pub turn: u32,
    pub phase_before: Phase,
    pub phase_after: Phase,
    pub handler: Option<HandlerId>,
    /// Short label of what happened, e.g. `result`, `retry`, `degraded`
    pub outcome: String,
    pub state_hash: String,
    pub recorded_at: DateTime<Utc>,
}

/// Audit trail storage
pub struct AuditLog {
    records: Arc<RwLock<HashMap<Uuid, TurnRecord>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store a turn record
    pub async fn record(&self, record: TurnRecord) -> Result<Uuid> {
        let record_id = record.record_id;
        let mut records = self.records.write().await;
        records.insert(record_id, record);
        Ok(record_id)
    }

    /// All records of a session, in turn order
    pub async fn list_for_session(&self, session_id: Uuid) -> Result<Vec<TurnRecord>> {
        let records = self.records.read().await;

        let mut items: Vec<TurnRecord> = records
            .values()
            .filter(|record| record.session_id == session_id)
            .cloned()
            .collect();

        items.sort_by_key(|record| (record.turn, record.recorded_at));
        Ok(items)
    }

    /// Whether `state` is exactly what the session's latest turn produced
    pub async fn matches_state(&self, state: &TripState) -> Result<bool> {
        let latest = self
            .list_for_session(state.session_id())
            .await?
            .into_iter()
            .last();

        Ok(match latest {
            Some(record) => record.state_hash == compute_state_hash(state),
            None => false,
        })
    }

    pub async fn clear_session(&self, session_id: Uuid) -> Result<()> {
        let mut records = self.records.write().await;
        records.retain(|_, record| record.session_id != session_id);
        Ok(())
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 over the JSON encoding of the state.
/// Serialization is streamed straight into the hasher.
pub fn compute_state_hash(state: &TripState) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), state).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
