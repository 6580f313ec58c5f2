use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::errors::SessionError;

use super::db::DbHandle;
use super::events::{Event, EventBus};
use super::models::{Session, SessionStatus};
use super::state;

/// Durable table of sessions and the only writer of session state.
///
/// Every write for one id runs under that id's async lock: read a snapshot,
/// let the caller mutate a copy, validate the status edge, then commit with
/// a version check. The matching event is published from inside the
/// database critical section, so subscribers see events in commit order.
pub struct Registry {
    db: DbHandle,
    bus: EventBus,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Registry {
    pub fn new(db: DbHandle, bus: EventBus) -> Self {
        Self {
            db,
            bus,
            locks: DashMap::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub async fn find(&self, id: &str) -> Result<Option<Session>, SessionError> {
        let id = id.to_string();
        self.db
            .call(move |db| db.get_session(&id))
            .await
            .map_err(SessionError::Database)
    }

    pub async fn get(&self, id: &str) -> Result<Session, SessionError> {
        self.find(id)
            .await?
            .ok_or_else(|| SessionError::not_found(id))
    }

    pub async fn list(&self) -> Result<Vec<Session>, SessionError> {
        self.db
            .call(|db| db.list_sessions())
            .await
            .map_err(SessionError::Database)
    }

    // ── Writes ────────────────────────────────────────────────────────

    pub async fn create(&self, session: Session) -> Result<Session, SessionError> {
        let bus = self.bus.clone();
        let record = session.clone();
        self.db
            .call(move |db| {
                db.insert_session(&record)?;
                bus.publish(Event::SessionCreated { session: record });
                Ok(())
            })
            .await
            .map_err(SessionError::Database)?;
        tracing::info!(session_id = %session.id, backend = session.execution.backend.as_str(), "session created");
        Ok(session)
    }

    /// Apply `f` to the latest snapshot and commit the result.
    ///
    /// Identity, descriptors and bookkeeping fields are restored after `f`
    /// runs. A mutation that changes nothing writes nothing and publishes
    /// nothing.
    pub async fn update<F>(&self, id: &str, f: F) -> Result<Session, SessionError>
    where
        F: FnOnce(&mut Session) -> Result<(), SessionError> + Send,
    {
        self.apply(id, None, f).await
    }

    /// Like [`update`](Self::update) but fails with `VersionConflict` unless
    /// the stored version is still `expected_version`.
    pub async fn compare_and_set<F>(
        &self,
        id: &str,
        expected_version: i64,
        f: F,
    ) -> Result<Session, SessionError>
    where
        F: FnOnce(&mut Session) -> Result<(), SessionError> + Send,
    {
        self.apply(id, Some(expected_version), f).await
    }

    /// Move a session to `to`, recording `error` when given. Asking for the
    /// current status is a no-op.
    pub async fn transition(
        &self,
        id: &str,
        to: SessionStatus,
        error: Option<String>,
    ) -> Result<Session, SessionError> {
        self.update(id, move |session| {
            if session.status == to {
                return Ok(());
            }
            session.status = to;
            if error.is_some() {
                session.error = error;
            }
            Ok(())
        })
        .await
    }

    async fn apply<F>(
        &self,
        id: &str,
        expected_version: Option<i64>,
        f: F,
    ) -> Result<Session, SessionError>
    where
        F: FnOnce(&mut Session) -> Result<(), SessionError> + Send,
    {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let current = self.get(id).await?;
        if let Some(expected) = expected_version {
            if current.version != expected {
                return Err(SessionError::VersionConflict {
                    id: id.to_string(),
                    expected,
                    actual: current.version,
                });
            }
        }

        let mut next = current.clone();
        f(&mut next)?;
        next.id = current.id.clone();
        next.execution = current.execution.clone();
        next.workspace = current.workspace.clone();
        next.created_at = current.created_at;
        next.updated_at = current.updated_at;
        next.version = current.version;

        if next == current {
            return Ok(current);
        }

        let old = current.status;
        if next.status != old && !state::can_transition(old, next.status) {
            return Err(SessionError::InvalidTransition {
                id: id.to_string(),
                from: old,
                to: next.status,
            });
        }

        next.version = current.version + 1;
        next.updated_at = Utc::now();

        let event = if next.status != old {
            Event::StatusChanged {
                id: next.id.clone(),
                old,
                new: next.status,
                session: next.clone(),
            }
        } else {
            Event::SessionUpdated {
                session: next.clone(),
            }
        };

        let bus = self.bus.clone();
        let record = next.clone();
        let expected = current.version;
        let outcome = self
            .db
            .call(move |db| {
                if db.compare_and_swap(&record, expected)? {
                    bus.publish(event);
                    return Ok(None);
                }
                db.current_version(&record.id).map(Some)
            })
            .await
            .map_err(SessionError::Database)?;

        match outcome {
            None => {
                if next.status != old {
                    tracing::info!(session_id = %id, from = %old, to = %next.status, version = next.version, "session status changed");
                }
                Ok(next)
            }
            Some(None) => Err(SessionError::not_found(id)),
            Some(Some(actual)) => Err(SessionError::VersionConflict {
                id: id.to_string(),
                expected,
                actual,
            }),
        }
    }

    /// Remove the record. Archived sessions are retained.
    pub async fn delete(&self, id: &str) -> Result<Session, SessionError> {
        let lock = self.lock_for(id);
        let guard = lock.lock().await;

        let current = self.get(id).await?;
        if !state::can_delete(current.status) {
            return Err(SessionError::NotDeletable {
                id: id.to_string(),
                status: current.status,
            });
        }

        let bus = self.bus.clone();
        let key = id.to_string();
        let removed = self
            .db
            .call(move |db| {
                let removed = db.delete_session(&key)?;
                if removed {
                    bus.publish(Event::SessionDeleted { id: key });
                }
                Ok(removed)
            })
            .await
            .map_err(SessionError::Database)?;

        drop(guard);
        self.locks.remove(id);

        if !removed {
            return Err(SessionError::not_found(id));
        }
        tracing::info!(session_id = %id, "session deleted");
        Ok(current)
    }
}
