use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use merlin_core::ids::{SessionKey, TurnId};

struct TurnJob {
    turn_id: TurnId,
    cancel: CancellationToken,
    client_message_id: Option<String>,
    started_at: DateTime<Utc>,
}

/// Read-only view of an in-flight turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnJobInfo {
    pub turn_id: TurnId,
    pub client_message_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// At most one in-flight turn per session key.
///
/// Every operation takes the single map lock for a short, non-suspending
/// critical section. Cancellation tokens are triggered after the lock is
/// dropped.
#[derive(Clone, Default)]
pub struct TurnRegistry {
    jobs: Arc<Mutex<HashMap<SessionKey, TurnJob>>>,
}

impl TurnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job for `key` iff none exists. The loser of a race sees `false`
    /// and leaves no trace.
    pub fn reserve(
        &self,
        key: &SessionKey,
        cancel: CancellationToken,
        client_message_id: Option<String>,
    ) -> bool {
        self.insert(key, cancel, client_message_id).is_some()
    }

    /// Like [`reserve`](Self::reserve), returning a guard that releases on drop.
    pub fn try_reserve(
        &self,
        key: &SessionKey,
        cancel: CancellationToken,
        client_message_id: Option<String>,
    ) -> Option<TurnGuard> {
        let turn_id = self.insert(key, cancel.clone(), client_message_id)?;
        Some(TurnGuard {
            registry: self.clone(),
            key: key.clone(),
            turn_id,
            cancel,
        })
    }

    fn insert(
        &self,
        key: &SessionKey,
        cancel: CancellationToken,
        client_message_id: Option<String>,
    ) -> Option<TurnId> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(key) {
            return None;
        }
        let turn_id = TurnId::new();
        jobs.insert(
            key.clone(),
            TurnJob {
                turn_id: turn_id.clone(),
                cancel,
                client_message_id,
                started_at: Utc::now(),
            },
        );
        debug!(session = %key, turn_id = %turn_id, "turn reserved");
        Some(turn_id)
    }

    /// Remove the job for `key`, if any. Idempotent.
    pub fn release(&self, key: &SessionKey) {
        if self.jobs.lock().remove(key).is_some() {
            debug!(session = %key, "turn released");
        }
    }

    /// Remove the job only while it still belongs to `turn_id`.
    fn release_owned(&self, key: &SessionKey, turn_id: &TurnId) {
        let mut jobs = self.jobs.lock();
        if jobs.get(key).is_some_and(|job| job.turn_id == *turn_id) {
            jobs.remove(key);
            debug!(session = %key, turn_id = %turn_id, "turn released");
        }
    }

    /// Signal the running turn to stop. Does not release the reservation.
    pub fn cancel(&self, key: &SessionKey) -> bool {
        let token = self.jobs.lock().get(key).map(|job| job.cancel.clone());
        match token {
            Some(token) => {
                token.cancel();
                debug!(session = %key, "turn cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn exists(&self, key: &SessionKey) -> bool {
        self.jobs.lock().contains_key(key)
    }

    pub fn job(&self, key: &SessionKey) -> Option<TurnJobInfo> {
        self.jobs.lock().get(key).map(|job| TurnJobInfo {
            turn_id: job.turn_id.clone(),
            client_message_id: job.client_message_id.clone(),
            started_at: job.started_at,
        })
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Signal every in-flight turn. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<CancellationToken> =
            self.jobs.lock().values().map(|job| job.cancel.clone()).collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }
}

/// Scoped reservation. Dropping it releases the session unless another turn
/// has since taken the key over.
pub struct TurnGuard {
    registry: TurnRegistry,
    key: SessionKey,
    turn_id: TurnId,
    cancel: CancellationToken,
}

impl TurnGuard {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn turn_id(&self) -> &TurnId {
        &self.turn_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.registry.release_owned(&self.key, &self.turn_id);
    }
}
