//! Session persistence: append-light, read-rare storage of full session
//! records with validation digests.
//!
//! The store owns the on-disk representation; the orchestrator owns the
//! in-memory [`Session`] during a run. Two backends implement the
//! [`SessionStore`] trait: a durable SQLite store and an in-memory store for
//! tests and ephemeral runs. Both persist the canonical JSON projection of
//! the session record plus a blake3 digest used to detect silent corruption.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use thiserror::Error;

use crate::session::{IterationRecord, RECORD_VERSION, Session, SessionStatus};

pub use memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;

/// Listing projection of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub user_query: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_iteration: u32,
}

/// Errors from session store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("session not found: {session_id}")]
    #[diagnostic(
        code(delver::store::not_found),
        help("Ensure the session ID `{session_id}` is correct and the session was saved.")
    )]
    NotFound { session_id: String },

    #[error("session record corrupt: {session_id}")]
    #[diagnostic(
        code(delver::store::corrupt),
        help("The stored digest does not match the record; the session cannot be trusted.")
    )]
    Corrupt { session_id: String },

    #[error("session {session_id} is {status} and cannot be resumed")]
    #[diagnostic(code(delver::store::not_resumable))]
    NotResumable {
        session_id: String,
        status: SessionStatus,
    },

    #[error("unrecognised session record version {found} (supported: {RECORD_VERSION})")]
    #[diagnostic(
        code(delver::store::unknown_version),
        help("The record was written by an incompatible release; refusing to load it.")
    )]
    UnknownVersion { found: u32 },

    #[error("rollback target {requested} outside iteration range 1..={last}")]
    #[diagnostic(code(delver::store::rollback_range))]
    RollbackOutOfRange { requested: u32, last: u32 },

    #[error("backend error: {message}")]
    #[diagnostic(code(delver::store::backend))]
    Backend { message: String },

    #[error("record serialization error: {source}")]
    #[diagnostic(code(delver::store::serde))]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistent storage of session records.
///
/// Implementations serialise `save` and `rollback` per session id; reads run
/// concurrently and always observe a consistent committed value.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upsert the session and its validation digest atomically.
    async fn save(&self, session: &Session) -> Result<()>;

    /// Load the full record; digest mismatch surfaces as [`StoreError::Corrupt`].
    async fn load(&self, session_id: &str) -> Result<Session>;

    /// Session summaries, newest first, optionally filtered by user id.
    async fn list(&self, user_id: Option<&str>) -> Result<Vec<SessionSummary>>;

    /// Remove the session and its validation record; returns whether a
    /// record was removed.
    async fn delete(&self, session_id: &str) -> Result<bool>;

    /// Load for resumption; fails for completed or errored sessions.
    async fn resume(&self, session_id: &str) -> Result<Session> {
        let session = self.load(session_id).await?;
        if !session.status.resumable() {
            return Err(StoreError::NotResumable {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }
        Ok(session)
    }

    /// The session's iteration history.
    async fn history(&self, session_id: &str) -> Result<Vec<IterationRecord>> {
        Ok(self.load(session_id).await?.iterations)
    }

    /// Truncate the iteration list to `iteration`, recompute the aggregated
    /// projection, clear the report, persist, and return the result.
    async fn rollback(&self, session_id: &str, iteration: u32) -> Result<Session>;
}

/// Blake3 hex digest of a canonical record encoding.
#[must_use]
pub fn compute_digest(record_json: &str) -> String {
    blake3::hash(record_json.as_bytes()).to_hex().to_string()
}

/// Serialize a session to its canonical persisted form plus digest.
pub fn encode_record(session: &Session) -> Result<(String, String)> {
    let record_json = serde_json::to_string(session)?;
    let digest = compute_digest(&record_json);
    Ok((record_json, digest))
}

/// Decode a persisted record, refusing unrecognised record versions.
pub fn decode_record(session_id: &str, record_json: &str) -> Result<Session> {
    let value: serde_json::Value =
        serde_json::from_str(record_json).map_err(|_| StoreError::Corrupt {
            session_id: session_id.to_string(),
        })?;
    let found = value
        .get("record_version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| StoreError::Corrupt {
            session_id: session_id.to_string(),
        })? as u32;
    if found != RECORD_VERSION {
        return Err(StoreError::UnknownVersion { found });
    }
    serde_json::from_value(value).map_err(|_| StoreError::Corrupt {
        session_id: session_id.to_string(),
    })
}

/// Apply the rollback transformation in place.
///
/// Keeps iterations `1..=iteration`, rebuilds [`AggregatedState`] from the
/// survivors, clears the final report and end time, and marks the session
/// interrupted. Idempotent for a fixed target.
pub(crate) fn apply_rollback(session: &mut Session, iteration: u32) -> Result<()> {
    let last = session.iterations.last().map_or(0, |r| r.number);
    if iteration == 0 || iteration > last {
        return Err(StoreError::RollbackOutOfRange {
            requested: iteration,
            last,
        });
    }
    session.iterations.truncate(iteration as usize);
    session.aggregated = crate::session::AggregatedState::rebuild(&session.iterations);
    session.final_report = None;
    session.error_message = None;
    session.status = SessionStatus::Interrupted;
    session.ended_at = None;
    Ok(())
}
