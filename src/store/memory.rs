//! In-memory session store for tests and ephemeral runs.
//!
//! Stores the same canonical record encoding and digest as the durable
//! backend, so round-trip, version, and corruption behavior match.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::session::Session;

use super::{
    Result, SessionStore, SessionSummary, StoreError, apply_rollback, compute_digest,
    decode_record, encode_record,
};

#[derive(Clone, Debug)]
struct StoredRecord {
    record_json: String,
    digest: String,
}

/// Volatile, process-local session store.
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: RwLock<FxHashMap<String, StoredRecord>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored record's digest, simulating silent corruption.
    /// Test helper.
    pub fn corrupt(&self, session_id: &str) {
        if let Some(record) = self.inner.write().get_mut(session_id) {
            record.digest = "0".repeat(64);
        }
    }

    fn get_verified(&self, session_id: &str) -> Result<Session> {
        let inner = self.inner.read();
        let record = inner.get(session_id).ok_or_else(|| StoreError::NotFound {
            session_id: session_id.to_string(),
        })?;
        if record.digest != compute_digest(&record.record_json) {
            return Err(StoreError::Corrupt {
                session_id: session_id.to_string(),
            });
        }
        decode_record(session_id, &record.record_json)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        let (record_json, digest) = encode_record(session)?;
        self.inner.write().insert(
            session.id.clone(),
            StoredRecord {
                record_json,
                digest,
            },
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Session> {
        self.get_verified(session_id)
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<SessionSummary>> {
        let inner = self.inner.read();
        let mut summaries = Vec::new();
        for (session_id, record) in inner.iter() {
            let session = decode_record(session_id, &record.record_json)?;
            if let Some(user_id) = user_id {
                if session.user_id.as_deref() != Some(user_id) {
                    continue;
                }
            }
            summaries.push(SessionSummary {
                id: session.id.clone(),
                user_query: session.user_query.clone(),
                status: session.status,
                started_at: session.started_at,
                ended_at: session.ended_at,
                current_iteration: session.aggregated.last_completed_iteration,
            });
        }
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.inner.write().remove(session_id).is_some())
    }

    async fn rollback(&self, session_id: &str, iteration: u32) -> Result<Session> {
        let mut session = self.get_verified(session_id)?;
        apply_rollback(&mut session, iteration)?;
        let (record_json, digest) = encode_record(&session)?;
        self.inner.write().insert(
            session_id.to_string(),
            StoredRecord {
                record_json,
                digest,
            },
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use crate::settings::Settings;

    fn session(user_id: Option<&str>) -> Session {
        Session::new("what is flume?", None, Settings::default(), user_id)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = InMemorySessionStore::new();
        let session = session(None);
        store.save(&session).await.unwrap();
        let loaded = store.load(&session.id).await.unwrap();
        assert_eq!(session, loaded);
    }

    #[tokio::test]
    async fn corruption_is_detected_on_load() {
        let store = InMemorySessionStore::new();
        let session = session(None);
        store.save(&session).await.unwrap();
        store.corrupt(&session.id);
        assert!(matches!(
            store.load(&session.id).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_by_user() {
        let store = InMemorySessionStore::new();
        let alpha = session(Some("alpha"));
        let beta = session(Some("beta"));
        store.save(&alpha).await.unwrap();
        store.save(&beta).await.unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = store.list(Some("alpha")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, alpha.id);
    }

    #[tokio::test]
    async fn delete_reports_whether_removed() {
        let store = InMemorySessionStore::new();
        let session = session(None);
        store.save(&session).await.unwrap();
        assert!(store.delete(&session.id).await.unwrap());
        assert!(!store.delete(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn resume_refuses_completed_sessions() {
        let store = InMemorySessionStore::new();
        let mut completed = session(None);
        completed.complete("report".into());
        store.save(&completed).await.unwrap();
        assert!(matches!(
            store.resume(&completed.id).await,
            Err(StoreError::NotResumable {
                status: SessionStatus::Completed,
                ..
            })
        ));
    }
}
