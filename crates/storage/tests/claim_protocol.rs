#![forbid(unsafe_code)]

use rusqlite::Connection;
use sq_core::PickOrder;
use sq_storage::{QueueStore, StoreError, StoreTuning};
use std::path::PathBuf;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("sq_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn seed_db(dir: &PathBuf, rows: &[(i64, &str, i64)]) -> PathBuf {
    let db_path = dir.join("queue.db");
    let conn = Connection::open(&db_path).expect("create db");
    conn.execute_batch(
        "CREATE TABLE items (
           id INTEGER PRIMARY KEY,
           title TEXT,
           post_date TEXT,
           comments_count INTEGER NOT NULL DEFAULT 0,
           check_create INTEGER NOT NULL DEFAULT 0
         );",
    )
    .expect("create items table");
    for (id, post_date, comments) in rows {
        conn.execute(
            "INSERT INTO items(id, title, post_date, comments_count) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, format!("item {id}"), post_date, comments],
        )
        .expect("seed row");
    }
    db_path
}

fn open_store(db_path: &PathBuf) -> QueueStore {
    let store = QueueStore::open(db_path, "items", &StoreTuning::default()).expect("open store");
    store.ensure_schema(Some("idx_items_pick_queue")).expect("ensure schema");
    store
}

#[test]
fn claim_advances_row_and_clears_diagnostics() {
    let dir = temp_dir("claim_advances_row");
    let db_path = seed_db(&dir, &[(7, "2026-01-01", 5)]);
    let mut store = open_store(&db_path);

    {
        let conn = Connection::open(&db_path).expect("raw conn");
        conn.execute("UPDATE items SET last_error = 'stale failure' WHERE id = 7", [])
            .expect("preset last_error");
    }

    let job = store
        .claim_new(1, PickOrder::IdDesc)
        .expect("claim")
        .expect("one eligible row");
    assert_eq!(job.id, 7);
    assert_eq!(job.stage, 1);
    assert_eq!(job.last_error, None, "claim must clear last_error");
    assert!(job.updated_at.is_some(), "claim must stamp updated_at");
}

#[test]
fn claim_returns_none_when_no_stage_zero_rows() {
    let dir = temp_dir("claim_none_when_empty");
    let db_path = seed_db(&dir, &[(1, "2026-01-01", 0)]);
    let mut store = open_store(&db_path);

    store.claim_new(1, PickOrder::IdDesc).expect("claim").expect("row");
    let second = store.claim_new(1, PickOrder::IdDesc).expect("claim again");
    assert!(second.is_none(), "the only row is already claimed");
}

#[test]
fn claim_honors_post_date_order() {
    let dir = temp_dir("claim_post_date_order");
    let db_path = seed_db(
        &dir,
        &[(1, "2026-01-03", 0), (2, "2026-01-05", 0), (3, "2026-01-04", 0)],
    );
    let mut store = open_store(&db_path);

    let job = store
        .claim_new(1, PickOrder::PostDateDesc)
        .expect("claim")
        .expect("row");
    assert_eq!(job.id, 2, "newest post_date wins");
}

#[test]
fn claim_honors_comments_order() {
    let dir = temp_dir("claim_comments_order");
    let db_path = seed_db(
        &dir,
        &[(1, "2026-01-03", 10), (2, "2026-01-05", 3), (3, "2026-01-04", 42)],
    );
    let mut store = open_store(&db_path);

    let job = store
        .claim_new(1, PickOrder::CommentsDesc)
        .expect("claim")
        .expect("row");
    assert_eq!(job.id, 3, "most-commented wins");
}

#[test]
fn concurrent_claims_have_exactly_one_winner() {
    let dir = temp_dir("concurrent_claims");
    let db_path = seed_db(&dir, &[(1, "2026-01-01", 0)]);
    // Create the queue columns once before the race.
    open_store(&db_path);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db_path = db_path.clone();
        handles.push(std::thread::spawn(move || {
            let mut store =
                QueueStore::open(&db_path, "items", &StoreTuning::default()).expect("open store");
            store
                .claim_new(1, PickOrder::IdDesc)
                .expect("claim must not error")
                .map(|job| job.id)
        }));
    }

    let winners: Vec<i64> = handles
        .into_iter()
        .filter_map(|handle| handle.join().expect("thread"))
        .collect();
    assert_eq!(winners, vec![1], "exactly one claimant may win the row");
}

#[test]
fn mark_done_uses_compare_and_swap() {
    let dir = temp_dir("mark_done_cas");
    let db_path = seed_db(&dir, &[(5, "2026-01-01", 0)]);
    let mut store = open_store(&db_path);

    store.claim_new(1, PickOrder::IdDesc).expect("claim").expect("row");
    store.mark_done(5, 1, 2).expect("advance 1 -> 2");

    let job = store.get_job(5).expect("get").expect("row");
    assert_eq!(job.stage, 2);
    assert_eq!(job.last_error, None);

    let err = store.mark_done(5, 1, 2).expect_err("stale expected stage");
    match err {
        StoreError::StageMismatch { id, expected, actual } => {
            assert_eq!((id, expected, actual), (5, 1, 2));
        }
        other => panic!("expected StageMismatch, got {other:?}"),
    }
}

#[test]
fn mark_done_on_unknown_id_fails() {
    let dir = temp_dir("mark_done_unknown");
    let db_path = seed_db(&dir, &[]);
    let mut store = open_store(&db_path);

    let err = store.mark_done(404, 1, 2).expect_err("no such row");
    assert!(matches!(err, StoreError::UnknownId(404)), "got {err:?}");
}

#[test]
fn mark_fail_keeps_stage_and_records_error() {
    let dir = temp_dir("mark_fail_records");
    let db_path = seed_db(&dir, &[(9, "2026-01-01", 0)]);
    let mut store = open_store(&db_path);

    store.claim_new(1, PickOrder::IdDesc).expect("claim").expect("row");
    store
        .mark_fail(9, 1, "render failed: handler: exit=3")
        .expect("record failure");

    let job = store.get_job(9).expect("get").expect("row");
    assert_eq!(job.stage, 1, "retry-in-place keeps the stage");
    assert_eq!(
        job.last_error.as_deref(),
        Some("render failed: handler: exit=3")
    );
    assert!(job.updated_at.is_some());
}

#[test]
fn mark_fail_truncates_long_errors() {
    let dir = temp_dir("mark_fail_truncates");
    let db_path = seed_db(&dir, &[(3, "2026-01-01", 0)]);
    let mut store = open_store(&db_path);

    let long = "x".repeat(5000);
    store.mark_fail(3, 0, &long).expect("record failure");

    let job = store.get_job(3).expect("get").expect("row");
    assert_eq!(job.last_error.map(|e| e.len()), Some(2000));
}

#[test]
fn mark_fail_can_reset_to_start() {
    let dir = temp_dir("mark_fail_reset");
    let db_path = seed_db(&dir, &[(2, "2026-01-01", 0)]);
    let mut store = open_store(&db_path);

    store.claim_new(1, PickOrder::IdDesc).expect("claim").expect("row");
    store.mark_fail(2, 0, "fetch failed: handler: timeout").expect("reset");

    let job = store.get_job(2).expect("get").expect("row");
    assert_eq!(job.stage, 0, "reset-to-start returns the job to the pool");

    let reclaimed = store
        .claim_new(1, PickOrder::IdDesc)
        .expect("claim")
        .expect("row is claimable again");
    assert_eq!(reclaimed.id, 2);
    assert_eq!(reclaimed.last_error, None);
}

#[test]
fn business_columns_survive_stage_transitions() {
    let dir = temp_dir("business_columns_survive");
    let db_path = seed_db(&dir, &[(11, "2026-02-02", 77)]);
    let mut store = open_store(&db_path);

    store.claim_new(1, PickOrder::IdDesc).expect("claim").expect("row");
    store.mark_fail(11, 1, "audio failed: handler: exit=1").expect("fail");
    store.mark_done(11, 1, 2).expect("done");

    let conn = Connection::open(&db_path).expect("raw conn");
    let (post_date, comments, title): (String, i64, String) = conn
        .query_row(
            "SELECT post_date, comments_count, title FROM items WHERE id = 11",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .expect("read business columns");
    assert_eq!(post_date, "2026-02-02");
    assert_eq!(comments, 77);
    assert_eq!(title, "item 11");
}
