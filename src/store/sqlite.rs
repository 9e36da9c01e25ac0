//! SQLite-backed session store.
//!
//! One row per session in `sessions` holding the canonical JSON record plus
//! denormalized listing columns; the `validation` table carries the blake3
//! digest of the last committed record. Saves and rollbacks are serialised
//! per session id by an async mutex and committed in a transaction, so
//! concurrent readers always observe a consistent committed value.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::session::{Session, SessionStatus};

use super::{
    Result, SessionStore, SessionSummary, StoreError, apply_rollback, compute_digest,
    decode_record, encode_record,
};

/// Durable session store on a SQLite database.
pub struct SqliteSessionStore {
    pool: SqlitePool,
    locks: Mutex<FxHashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore").finish()
    }
}

fn backend(message: impl std::fmt::Display) -> StoreError {
    StoreError::Backend {
        message: message.to_string(),
    }
}

fn to_rfc3339(when: DateTime<Utc>) -> String {
    when.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl SqliteSessionStore {
    /// Connect (or create) a SQLite database at `database_url`.
    /// Example URL: `sqlite://delver.db?mode=rwc`.
    ///
    /// Connection failure at startup should be mapped to
    /// [`exit_codes::DATASTORE_UNAVAILABLE`](crate::config::exit_codes) by
    /// embedding binaries.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|err| backend(format!("connect error: {err}")))?;

        // Run embedded migrations only if the feature is enabled (idempotent).
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(err) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(backend(format!("migration failure: {err}")));
            }
        }
        #[cfg(not(feature = "sqlite-migrations"))]
        {
            // Feature disabled: assume external migration orchestration
            // already applied the schema.
        }

        Ok(Self {
            pool,
            locks: Mutex::new(FxHashMap::default()),
        })
    }

    fn lock_for(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Commit the record and its digest in one transaction. Callers hold the
    /// session lock.
    async fn persist(&self, session: &Session) -> Result<()> {
        let (record_json, digest) = encode_record(session)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| backend(format!("tx begin: {err}")))?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, user_id, user_query, status, started_at, ended_at,
                current_iteration, record_version, record_json, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                user_query = excluded.user_query,
                status = excluded.status,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                current_iteration = excluded.current_iteration,
                record_version = excluded.record_version,
                record_json = excluded.record_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.user_query)
        .bind(session.status.as_str())
        .bind(to_rfc3339(session.started_at))
        .bind(session.ended_at.map(to_rfc3339))
        .bind(i64::from(session.aggregated.last_completed_iteration))
        .bind(i64::from(session.record_version))
        .bind(&record_json)
        .bind(to_rfc3339(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(|err| backend(format!("upsert session: {err}")))?;

        sqlx::query(
            r#"
            INSERT INTO validation (session_id, digest, committed_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(session_id) DO UPDATE SET
                digest = excluded.digest,
                committed_at = excluded.committed_at
            "#,
        )
        .bind(&session.id)
        .bind(&digest)
        .bind(to_rfc3339(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(|err| backend(format!("upsert validation: {err}")))?;

        tx.commit()
            .await
            .map_err(|err| backend(format!("tx commit: {err}")))
    }

    async fn load_verified(&self, session_id: &str) -> Result<Session> {
        let row: Option<SqliteRow> = sqlx::query(
            r#"
            SELECT s.record_json, v.digest
            FROM sessions s
            LEFT JOIN validation v ON v.session_id = s.id
            WHERE s.id = ?1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| backend(format!("select session: {err}")))?;

        let row = row.ok_or_else(|| StoreError::NotFound {
            session_id: session_id.to_string(),
        })?;

        let record_json: String = row.get("record_json");
        let stored_digest: Option<String> = row
            .try_get("digest")
            .map_err(|err| backend(format!("digest read: {err}")))?;

        match stored_digest {
            Some(digest) if digest == compute_digest(&record_json) => {}
            _ => {
                return Err(StoreError::Corrupt {
                    session_id: session_id.to_string(),
                });
            }
        }

        decode_record(session_id, &record_json)
    }
}

fn row_to_summary(row: &SqliteRow) -> Result<SessionSummary> {
    let status_raw: String = row.get("status");
    let status: SessionStatus = status_raw
        .parse()
        .map_err(|err: String| backend(format!("status column: {err}")))?;

    let started_raw: String = row.get("started_at");
    let started_at = DateTime::parse_from_rfc3339(&started_raw)
        .map_err(|err| backend(format!("started_at column: {err}")))?
        .with_timezone(&Utc);

    let ended_raw: Option<String> = row.get("ended_at");
    let ended_at = match ended_raw {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map_err(|err| backend(format!("ended_at column: {err}")))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let current_iteration: i64 = row.get("current_iteration");

    Ok(SessionSummary {
        id: row.get("id"),
        user_query: row.get("user_query"),
        status,
        started_at,
        ended_at,
        current_iteration: current_iteration as u32,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    async fn save(&self, session: &Session) -> Result<()> {
        let lock = self.lock_for(&session.id);
        let _guard = lock.lock().await;
        self.persist(session).await
    }

    #[instrument(skip(self))]
    async fn load(&self, session_id: &str) -> Result<Session> {
        self.load_verified(session_id).await
    }

    #[instrument(skip(self))]
    async fn list(&self, user_id: Option<&str>) -> Result<Vec<SessionSummary>> {
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query(
                    r#"
                    SELECT id, user_query, status, started_at, ended_at, current_iteration
                    FROM sessions
                    WHERE user_id = ?1
                    ORDER BY started_at DESC
                    "#,
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, user_query, status, started_at, ended_at, current_iteration
                    FROM sessions
                    ORDER BY started_at DESC
                    "#,
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|err| backend(format!("list sessions: {err}")))?;

        rows.iter().map(row_to_summary).collect()
    }

    #[instrument(skip(self))]
    async fn delete(&self, session_id: &str) -> Result<bool> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| backend(format!("tx begin: {err}")))?;

        sqlx::query("DELETE FROM validation WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| backend(format!("delete validation: {err}")))?;

        let outcome = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| backend(format!("delete session: {err}")))?;

        tx.commit()
            .await
            .map_err(|err| backend(format!("tx commit: {err}")))?;

        Ok(outcome.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn rollback(&self, session_id: &str, iteration: u32) -> Result<Session> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let mut session = self.load_verified(session_id).await?;
        apply_rollback(&mut session, iteration)?;
        self.persist(&session).await?;
        Ok(session)
    }
}
