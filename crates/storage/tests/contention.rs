#![forbid(unsafe_code)]

use rusqlite::Connection;
use sq_core::PickOrder;
use sq_storage::{QueueStore, StoreError, StoreTuning};
use std::path::PathBuf;
use std::time::Duration;

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

fn seed_db(dir: &PathBuf) -> PathBuf {
    let db_path = dir.join("queue.db");
    let conn = Connection::open(&db_path).expect("create db");
    conn.execute_batch(
        "CREATE TABLE items (
           id INTEGER PRIMARY KEY,
           title TEXT,
           post_date TEXT,
           comments_count INTEGER NOT NULL DEFAULT 0,
           check_create INTEGER NOT NULL DEFAULT 0
         );
         INSERT INTO items(id, title, post_date) VALUES (1, 'item 1', '2026-01-01');",
    )
    .expect("seed");
    db_path
}

fn impatient_tuning(attempts: u32) -> StoreTuning {
    StoreTuning {
        busy_timeout: Duration::from_millis(20),
        journal_mode: Some("WAL".to_string()),
        synchronous: Some("NORMAL".to_string()),
        lock_retry_max: attempts,
        lock_retry_sleep: Duration::from_millis(5),
    }
}

/// Holds the write lock on the database until dropped.
struct WriteLock {
    conn: Connection,
}

impl WriteLock {
    fn acquire(db_path: &PathBuf) -> Self {
        let conn = Connection::open(db_path).expect("lock conn");
        conn.execute_batch(
            "BEGIN IMMEDIATE; UPDATE items SET title = 'held' WHERE id = 1;",
        )
        .expect("acquire write lock");
        Self { conn }
    }

    fn release(self) {
        self.conn.execute_batch("ROLLBACK;").expect("release lock");
    }
}

#[test]
fn claim_fails_with_contention_exceeded_after_exact_bound() {
    let dir = temp_dir("claim_contention_bound");
    let db_path = seed_db(&dir);
    {
        let store = QueueStore::open(&db_path, "items", &StoreTuning::default()).expect("open");
        store.ensure_schema(None).expect("ensure schema");
    }

    let lock = WriteLock::acquire(&db_path);
    let mut store = QueueStore::open(&db_path, "items", &impatient_tuning(3)).expect("open");

    let err = store
        .claim_new(1, PickOrder::IdDesc)
        .expect_err("write lock is held elsewhere");
    match err {
        StoreError::ContentionExceeded { op, attempts } => {
            assert_eq!(op, "claim_new");
            assert_eq!(attempts, 3, "must stop after exactly the configured bound");
        }
        other => panic!("expected ContentionExceeded, got {other:?}"),
    }
    lock.release();
}

#[test]
fn mark_fail_is_also_bounded() {
    let dir = temp_dir("mark_fail_contention_bound");
    let db_path = seed_db(&dir);
    {
        let store = QueueStore::open(&db_path, "items", &StoreTuning::default()).expect("open");
        store.ensure_schema(None).expect("ensure schema");
    }

    let lock = WriteLock::acquire(&db_path);
    let mut store = QueueStore::open(&db_path, "items", &impatient_tuning(2)).expect("open");

    let err = store
        .mark_fail(1, 1, "fetch failed: handler: exit=1")
        .expect_err("write lock is held elsewhere");
    match err {
        StoreError::ContentionExceeded { op, attempts } => {
            assert_eq!(op, "mark_fail");
            assert_eq!(attempts, 2);
        }
        other => panic!("expected ContentionExceeded, got {other:?}"),
    }
    lock.release();
}

#[test]
fn claim_succeeds_once_the_lock_clears() {
    let dir = temp_dir("claim_after_lock_clears");
    let db_path = seed_db(&dir);
    {
        let store = QueueStore::open(&db_path, "items", &StoreTuning::default()).expect("open");
        store.ensure_schema(None).expect("ensure schema");
    }

    let lock = WriteLock::acquire(&db_path);
    lock.release();

    let mut store = QueueStore::open(&db_path, "items", &impatient_tuning(3)).expect("open");
    let job = store
        .claim_new(1, PickOrder::IdDesc)
        .expect("claim")
        .expect("row");
    assert_eq!(job.id, 1);
    assert_eq!(job.stage, 1);
}
