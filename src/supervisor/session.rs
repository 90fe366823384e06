//! Session manager
//!
//! Each session sits behind its own async mutex, so the turns of one session
//! are serialized while different sessions run concurrently. Snapshots are
//! handed to the `SessionStore` after every drive and published on a watch
//! channel, so reads never wait for a running drive.

use super::{Supervisor, TurnReply};
use crate::error::SupervisorError;
use crate::models::{ConfirmDecision, PreferenceField, UserInput};
use crate::state::{SessionStore, TripSnapshot, TripState};
use crate::Result;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

struct SessionEntry {
    state: Arc<Mutex<TripState>>,
    /// Shared by every request issued since the last `cancel`
    cancel: Mutex<CancellationToken>,
    /// Snapshot as of the last finished operation
    published: watch::Sender<TripSnapshot>,
    closed: AtomicBool,
}

impl SessionEntry {
    fn new(state: TripState) -> Self {
        let (published, _) = watch::channel(state.snapshot());
        Self {
            state: Arc::new(Mutex::new(state)),
            cancel: Mutex::new(CancellationToken::new()),
            published,
            closed: AtomicBool::new(false),
        }
    }

    async fn token(&self) -> CancellationToken {
        self.cancel.lock().await.clone()
    }

    /// Cancel the running drive and everything queued behind it
    async fn cancel_pending(&self) {
        let mut slot = self.cancel.lock().await;
        slot.cancel();
        *slot = CancellationToken::new();
    }

    fn publish(&self, state: &TripState) {
        self.published.send_replace(state.snapshot());
    }
}

/// Exclusive access to one session for the length of an operation
struct Drive {
    entry: Arc<SessionEntry>,
    state: OwnedMutexGuard<TripState>,
    cancel: CancellationToken,
}

impl Drive {
    /// Reply for a request cancelled while it was still queued
    fn cancelled(&self) -> Option<TurnReply> {
        self.cancel.is_cancelled().then(|| TurnReply::Cancelled {
            snapshot: self.state.snapshot(),
        })
    }
}

pub struct SessionManager {
    supervisor: Arc<Supervisor>,
    sessions: RwLock<HashMap<Uuid, Arc<SessionEntry>>>,
    store: Box<dyn SessionStore>,
}

impl SessionManager {
    pub fn new(supervisor: Arc<Supervisor>, store: Box<dyn SessionStore>) -> Self {
        Self {
            supervisor,
            sessions: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    pub async fn create_session(&self) -> Result<Uuid> {
        let session_id = Uuid::new_v4();
        let state = TripState::new(session_id);
        self.store.save_snapshot(&state.snapshot()).await?;

        self.sessions
            .write()
            .await
            .insert(session_id, Arc::new(SessionEntry::new(state)));

        info!(session_id = %session_id, "session created");
        Ok(session_id)
    }

    /// Live session, or one rehydrated from the store
    async fn entry(&self, session_id: Uuid) -> Result<Arc<SessionEntry>> {
        if let Some(entry) = self.sessions.read().await.get(&session_id) {
            return Ok(entry.clone());
        }

        let snapshot = self
            .store
            .load_snapshot(session_id)
            .await?
            .ok_or_else(|| SupervisorError::SessionNotFound(session_id.to_string()))?;

        debug!(session_id = %session_id, "session restored from store");
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionEntry::new(TripState::restore(snapshot))));
        Ok(entry.clone())
    }

    /// The token is taken before queuing on the state lock, so a `cancel`
    /// issued while the request waits still reaches it.
    async fn begin(&self, session_id: Uuid) -> Result<Drive> {
        let entry = self.entry(session_id).await?;
        let cancel = entry.token().await;
        let state = entry.state.clone().lock_owned().await;

        if entry.closed.load(Ordering::SeqCst) {
            return Err(SupervisorError::SessionNotFound(session_id.to_string()));
        }

        Ok(Drive {
            entry,
            state,
            cancel,
        })
    }

    async fn finish(&self, drive: Drive, result: Result<TurnReply>) -> Result<TurnReply> {
        drive.entry.publish(&drive.state);
        let reply = result?;
        self.store.save_snapshot(reply.snapshot()).await?;
        Ok(reply)
    }

    pub async fn submit_input(&self, session_id: Uuid, input: &UserInput) -> Result<TurnReply> {
        let mut drive = self.begin(session_id).await?;
        if let Some(reply) = drive.cancelled() {
            return Ok(reply);
        }

        let result = self
            .supervisor
            .submit_input(&mut drive.state, input, &drive.cancel)
            .await;
        self.finish(drive, result).await
    }

    pub async fn confirm_plan(
        &self,
        session_id: Uuid,
        decision: ConfirmDecision,
    ) -> Result<TurnReply> {
        let mut drive = self.begin(session_id).await?;
        if let Some(reply) = drive.cancelled() {
            return Ok(reply);
        }

        let result = self
            .supervisor
            .confirm(&mut drive.state, decision, &drive.cancel)
            .await;
        self.finish(drive, result).await
    }

    pub async fn edit_preferences(
        &self,
        session_id: Uuid,
        fields: &BTreeMap<PreferenceField, Value>,
    ) -> Result<TurnReply> {
        let mut drive = self.begin(session_id).await?;
        if let Some(reply) = drive.cancelled() {
            return Ok(reply);
        }

        let result = self
            .supervisor
            .edit_preferences(&mut drive.state, fields, &drive.cancel)
            .await;
        self.finish(drive, result).await
    }

    pub async fn skip_step(&self, session_id: Uuid) -> Result<TurnReply> {
        let mut drive = self.begin(session_id).await?;
        if let Some(reply) = drive.cancelled() {
            return Ok(reply);
        }

        let result = self.supervisor.skip(&mut drive.state, &drive.cancel).await;
        self.finish(drive, result).await
    }

    /// Cancel whatever is running, then start the session over
    pub async fn request_reset(&self, session_id: Uuid) -> Result<TurnReply> {
        self.entry(session_id).await?.cancel_pending().await;

        let mut drive = self.begin(session_id).await?;
        let result = self.supervisor.reset(&mut drive.state).await;

        self.store.delete(session_id).await?;
        self.finish(drive, result).await
    }

    /// End the session: stop any drive, drop its audit trail and forget it.
    /// Returns the final snapshot.
    pub async fn close_session(&self, session_id: Uuid) -> Result<TripSnapshot> {
        let entry = self.entry(session_id).await?;
        entry.cancel_pending().await;

        let state = entry.state.lock().await;
        if entry.closed.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::SessionNotFound(session_id.to_string()));
        }
        let snapshot = state.snapshot();

        // lookups fall back to the store, so it goes before the map entry
        self.store.delete(session_id).await?;
        self.sessions.write().await.remove(&session_id);
        self.supervisor.audit_log().clear_session(session_id).await?;

        info!(
            session_id = %session_id,
            phase = %snapshot.phase,
            turns = snapshot.turn_count,
            "session closed"
        );
        Ok(snapshot)
    }

    pub async fn snapshot(&self, session_id: Uuid) -> Result<TripSnapshot> {
        let entry = self.entry(session_id).await?;
        let snapshot = entry.published.borrow().clone();
        Ok(snapshot)
    }

    /// Abort the in-flight drive and any request queued behind it. The state
    /// stays as of the last completed turn.
    pub async fn cancel(&self, session_id: Uuid) -> Result<()> {
        self.entry(session_id).await?.cancel_pending().await;
        info!(session_id = %session_id, "cancellation requested");
        Ok(())
    }

    pub async fn missing_preferences(&self, session_id: Uuid) -> Result<Vec<PreferenceField>> {
        let entry = self.entry(session_id).await?;
        let missing = self
            .supervisor
            .missing_preferences(&entry.published.borrow().preferences);
        Ok(missing)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
