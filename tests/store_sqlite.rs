//! Durable store behavior: round-trips, listing, rollback, resume, and
//! corruption detection against a real SQLite file.

use chrono::Utc;
use delver::session::{
    ContextSummary, IterationRecord, Session, SessionStatus,
};
use delver::settings::Settings;
use delver::store::{SessionStore, SqliteSessionStore, StoreError};
use tempfile::TempDir;

async fn store_in(dir: &TempDir) -> SqliteSessionStore {
    let path = dir.path().join("delver-test.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    SqliteSessionStore::connect(&url)
        .await
        .expect("connect sqlite store")
}

fn record(number: u32) -> IterationRecord {
    IterationRecord {
        number,
        started_at: Utc::now(),
        ended_at: Some(Utc::now()),
        plan_consumed: Some(format!("plan {number}")),
        queries: vec![format!("query {number}")],
        contexts_gathered: vec![ContextSummary {
            url: format!("https://source.test/{number}"),
            query: format!("query {number}"),
            summary: format!("summary {number}"),
        }],
        next_plan: Some(format!("plan {}", number + 1)),
    }
}

fn session_with_iterations(count: u32) -> Session {
    let mut session = Session::new("the question", None, Settings::default(), Some("user-1"));
    for number in 1..=count {
        session.append_iteration(record(number)).unwrap();
    }
    session
}

#[tokio::test]
async fn save_then_load_yields_equal_session() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    let session = session_with_iterations(3);
    store.save(&session).await.unwrap();

    let loaded = store.load(&session.id).await.unwrap();
    assert_eq!(session, loaded);
}

#[tokio::test]
async fn load_of_unknown_session_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;
    assert!(matches!(
        store.load("missing").await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn save_is_an_upsert() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    let mut session = session_with_iterations(1);
    store.save(&session).await.unwrap();
    session.append_iteration(record(2)).unwrap();
    store.save(&session).await.unwrap();

    let loaded = store.load(&session.id).await.unwrap();
    assert_eq!(loaded.iterations.len(), 2);
}

#[tokio::test]
async fn list_orders_newest_first_and_filters_by_user() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    let mut older = Session::new("older", None, Settings::default(), Some("alice"));
    older.started_at = Utc::now() - chrono::Duration::hours(2);
    let newer = Session::new("newer", None, Settings::default(), Some("bob"));

    store.save(&older).await.unwrap();
    store.save(&newer).await.unwrap();

    let all = store.list(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, newer.id);
    assert_eq!(all[1].id, older.id);
    assert_eq!(all[0].status, SessionStatus::Running);

    let alice_only = store.list(Some("alice")).await.unwrap();
    assert_eq!(alice_only.len(), 1);
    assert_eq!(alice_only[0].user_query, "older");
}

#[tokio::test]
async fn delete_removes_session_and_validation() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    let session = session_with_iterations(1);
    store.save(&session).await.unwrap();

    assert!(store.delete(&session.id).await.unwrap());
    assert!(!store.delete(&session.id).await.unwrap());
    assert!(matches!(
        store.load(&session.id).await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn history_projects_the_iteration_list() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    let session = session_with_iterations(3);
    store.save(&session).await.unwrap();

    let history = store.history(&session.id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].number, 3);
}

#[tokio::test]
async fn rollback_truncates_and_survives_reload() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    let mut session = session_with_iterations(3);
    session.complete("final report".into());
    store.save(&session).await.unwrap();

    let rolled = store.rollback(&session.id, 1).await.unwrap();
    assert_eq!(rolled.iterations.len(), 1);
    assert_eq!(rolled.status, SessionStatus::Interrupted);
    assert_eq!(rolled.final_report, None);

    let reloaded = store.load(&session.id).await.unwrap();
    assert_eq!(reloaded, rolled);
    assert_eq!(
        reloaded.iterations.iter().map(|r| r.number).collect::<Vec<_>>(),
        vec![1]
    );
    assert_eq!(reloaded.aggregated.last_completed_iteration, 1);
    reloaded.check_invariants().unwrap();
}

#[tokio::test]
async fn rollback_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    let session = session_with_iterations(3);
    store.save(&session).await.unwrap();

    let once = store.rollback(&session.id, 2).await.unwrap();
    let twice = store.rollback(&session.id, 2).await.unwrap();
    assert_eq!(once, twice);
}

#[tokio::test]
async fn rollback_rejects_out_of_range_iterations() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    let session = session_with_iterations(2);
    store.save(&session).await.unwrap();

    assert!(matches!(
        store.rollback(&session.id, 5).await,
        Err(StoreError::RollbackOutOfRange {
            requested: 5,
            last: 2
        })
    ));
}

#[tokio::test]
async fn resume_rejects_terminal_sessions() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir).await;

    let mut completed = session_with_iterations(1);
    completed.complete("report".into());
    store.save(&completed).await.unwrap();
    assert!(matches!(
        store.resume(&completed.id).await,
        Err(StoreError::NotResumable { .. })
    ));

    let mut interrupted = session_with_iterations(1);
    interrupted.interrupt();
    store.save(&interrupted).await.unwrap();
    let resumed = store.resume(&interrupted.id).await.unwrap();
    assert_eq!(resumed.id, interrupted.id);
}

#[tokio::test]
async fn tampered_digest_is_reported_as_corrupt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("delver-test.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let store = SqliteSessionStore::connect(&url).await.unwrap();

    let session = session_with_iterations(1);
    store.save(&session).await.unwrap();

    // Tamper with the committed record behind the store's back.
    let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
    sqlx::query("UPDATE sessions SET record_json = replace(record_json, 'the question', 'altered') WHERE id = ?1")
        .bind(&session.id)
        .execute(&pool)
        .await
        .unwrap();

    assert!(matches!(
        store.load(&session.id).await,
        Err(StoreError::Corrupt { .. })
    ));
    assert!(matches!(
        store.resume(&session.id).await,
        Err(StoreError::Corrupt { .. })
    ));
}

#[tokio::test]
async fn concurrent_saves_and_loads_never_tear() {
    let dir = TempDir::new().unwrap();
    let store = std::sync::Arc::new(store_in(&dir).await);

    let base = session_with_iterations(1);
    store.save(&base).await.unwrap();

    let mut grown = base.clone();
    grown.append_iteration(record(2)).unwrap();

    let writer = {
        let store = std::sync::Arc::clone(&store);
        let grown = grown.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                store.save(&grown).await.unwrap();
            }
        })
    };

    for _ in 0..20 {
        let loaded = store.load(&base.id).await.unwrap();
        assert!(loaded == base || loaded == grown, "torn read observed");
    }
    writer.await.unwrap();
}
