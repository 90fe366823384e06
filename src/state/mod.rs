//! Trip state and its persistence seam
//!
//! `TripState` is the owned per-session record. `SessionStore` is where
//! snapshots are handed off after each drive. Currently uses in-memory;
//! can be replaced with a database-backed store.

mod trip;
mod view;

pub use trip::{TripSnapshot, TripState};
pub use view::{Directive, StateUpdate, StateView};

use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Trait for snapshot persistence
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_snapshot(&self, snapshot: &TripSnapshot) -> Result<()>;
    async fn load_snapshot(&self, session_id: Uuid) -> Result<Option<TripSnapshot>>;
    async fn delete(&self, session_id: Uuid) -> Result<()>;
}

/// In-memory session store for development
pub struct InMemorySessionStore {
    snapshots: Arc<RwLock<HashMap<Uuid, TripSnapshot>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save_snapshot(&self, snapshot: &TripSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.session_id, snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, session_id: Uuid) -> Result<Option<TripSnapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(&session_id).cloned())
    }

    async fn delete(&self, session_id: Uuid) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.remove(&session_id);
        Ok(())
    }
}
