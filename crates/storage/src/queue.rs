#![forbid(unsafe_code)]

use crate::StoreError;
use crate::retry::{RetryPolicy, with_busy_retry};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;

use sq_core::PickOrder;

const LAST_ERROR_MAX_CHARS: usize = 2000;
const GUARD_SCAN_LIMIT: i64 = 50;

const JOURNAL_MODES: [&str; 6] = ["WAL", "DELETE", "TRUNCATE", "PERSIST", "MEMORY", "OFF"];
const SYNCHRONOUS_LEVELS: [&str; 4] = ["OFF", "NORMAL", "FULL", "EXTRA"];

/// Durability/concurrency settings applied at open. Defaults match the
/// deployed queue: WAL, synchronous=NORMAL, 60s busy timeout, 25 lock
/// retries at 800ms apart.
#[derive(Clone, Debug)]
pub struct StoreTuning {
    pub busy_timeout: Duration,
    pub journal_mode: Option<String>,
    pub synchronous: Option<String>,
    pub lock_retry_max: u32,
    pub lock_retry_sleep: Duration,
}

impl Default for StoreTuning {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(60_000),
            journal_mode: Some("WAL".to_string()),
            synchronous: Some("NORMAL".to_string()),
            lock_retry_max: 25,
            lock_retry_sleep: Duration::from_millis(800),
        }
    }
}

/// The queue columns of one job row. Business columns (post_date,
/// comments_count, titles, ...) stay opaque to the core and are never
/// touched by its updates.
#[derive(Clone, Debug)]
pub struct JobRow {
    pub id: i64,
    pub stage: i64,
    pub folder_name: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: Option<String>,
}

impl JobRow {
    pub fn folder_name_trimmed(&self) -> &str {
        self.folder_name.as_deref().unwrap_or("").trim()
    }

    pub fn has_folder_name(&self) -> bool {
        !self.folder_name_trimmed().is_empty()
    }
}

#[derive(Debug)]
pub struct QueueStore {
    conn: Connection,
    db_path: PathBuf,
    table: String,
    retry: RetryPolicy,
}

impl QueueStore {
    /// Opens an existing queue database and applies the pragmas. The file
    /// must already exist; a missing path is `StoreError::Unavailable`.
    pub fn open(
        db_path: impl AsRef<Path>,
        table: &str,
        tuning: &StoreTuning,
    ) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if !db_path.is_file() {
            return Err(StoreError::Unavailable(db_path));
        }
        validate_identifier(table)?;

        let conn = Connection::open(&db_path).map_err(|_| StoreError::Unavailable(db_path.clone()))?;
        conn.busy_timeout(tuning.busy_timeout)?;

        let mut pragmas = String::new();
        if let Some(mode) = tuning.journal_mode.as_deref() {
            let mode = normalize_choice(mode, &JOURNAL_MODES)
                .ok_or(StoreError::InvalidInput("unknown journal_mode"))?;
            pragmas.push_str(&format!("PRAGMA journal_mode={mode};\n"));
        }
        if let Some(level) = tuning.synchronous.as_deref() {
            let level = normalize_choice(level, &SYNCHRONOUS_LEVELS)
                .ok_or(StoreError::InvalidInput("unknown synchronous level"))?;
            pragmas.push_str(&format!("PRAGMA synchronous={level};\n"));
        }
        if !pragmas.is_empty() {
            conn.execute_batch(&pragmas)?;
        }

        Ok(Self {
            conn,
            db_path,
            table: table.to_string(),
            retry: RetryPolicy {
                max_attempts: tuning.lock_retry_max,
                sleep: tuning.lock_retry_sleep,
            },
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Idempotent column/index evolution, safe to run concurrently from many
    /// processes. Adds what is missing, ignores lost add-column races, never
    /// drops or renames. `pick_index` names the claim-queue index; `None`
    /// leaves indexing alone.
    pub fn ensure_schema(&self, pick_index: Option<&str>) -> Result<(), StoreError> {
        let existing = self.column_names()?;
        if existing.is_empty() {
            return Err(StoreError::MissingTable(self.table.clone()));
        }

        let table = &self.table;
        let wanted: [(&str, String); 8] = [
            ("check_create", format!("ALTER TABLE {table} ADD COLUMN check_create INTEGER DEFAULT 0")),
            ("folder_name", format!("ALTER TABLE {table} ADD COLUMN folder_name TEXT")),
            ("last_error", format!("ALTER TABLE {table} ADD COLUMN last_error TEXT")),
            ("updated_at", format!("ALTER TABLE {table} ADD COLUMN updated_at TEXT")),
            ("video_created", format!("ALTER TABLE {table} ADD COLUMN video_created INTEGER DEFAULT 0")),
            ("video_created_at", format!("ALTER TABLE {table} ADD COLUMN video_created_at TEXT")),
            ("video_uploaded", format!("ALTER TABLE {table} ADD COLUMN video_uploaded INTEGER DEFAULT 0")),
            ("video_uploaded_at", format!("ALTER TABLE {table} ADD COLUMN video_uploaded_at TEXT")),
        ];

        for (name, ddl) in &wanted {
            if existing.contains(*name) {
                continue;
            }
            match self.conn.execute_batch(ddl) {
                Ok(()) => {}
                // Another process added the column between our scan and the ALTER.
                Err(err) if is_duplicate_column(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(index) = pick_index {
            validate_identifier(index)?;
            self.conn.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {table}(check_create, id DESC)"
            ))?;
        }

        Ok(())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<JobRow>, StoreError> {
        read_job(&self.conn, &self.table, id)
    }

    /// Selection policy (a): resume in-progress work. A plain read; the job
    /// already belongs to its stage. Candidates are ordered by pipeline
    /// position (`entry_values` order), then id descending.
    pub fn pick_in_progress(&self, entry_values: &[i64]) -> Result<Option<JobRow>, StoreError> {
        if entry_values.is_empty() {
            return Ok(None);
        }

        let placeholders = (1..=entry_values.len())
            .map(|n| format!("?{n}"))
            .collect::<Vec<_>>()
            .join(",");
        let mut order_case = String::from("CASE check_create");
        for (position, value) in entry_values.iter().enumerate() {
            order_case.push_str(&format!(" WHEN {value} THEN {}", position + 1));
        }
        order_case.push_str(" ELSE 99 END");

        let sql = format!(
            "SELECT id, check_create, folder_name, last_error, updated_at \
             FROM {table} \
             WHERE check_create IN ({placeholders}) \
             ORDER BY {order_case} ASC, id DESC \
             LIMIT 1",
            table = self.table,
        );

        Ok(self
            .conn
            .query_row(&sql, params_from_iter(entry_values.iter()), job_from_row)
            .optional()?)
    }

    /// Selection policy (b): claim new work. `BEGIN IMMEDIATE`, pick one
    /// stage-0 row by `order`, then advance it with a compare-and-swap
    /// predicate on `check_create = 0`. A lost race rolls back and reads as
    /// "no work"; exactly one claimant ever wins a given row.
    pub fn claim_new(
        &mut self,
        first_entry: i64,
        order: PickOrder,
    ) -> Result<Option<JobRow>, StoreError> {
        let table = self.table.clone();
        let select_sql = format!(
            "SELECT id FROM {table} WHERE check_create = 0 ORDER BY {order} LIMIT 1",
            order = order_sql(order),
        );
        let update_sql = format!(
            "UPDATE {table} \
             SET check_create = ?1, last_error = NULL, updated_at = ?2 \
             WHERE id = ?3 AND check_create = 0"
        );

        let retry = self.retry;
        with_busy_retry(retry, "claim_new", || {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;

            let picked: Option<i64> = tx.query_row(&select_sql, [], |row| row.get(0)).optional()?;
            let Some(id) = picked else {
                // Dropping the transaction rolls back.
                return Ok(None);
            };

            let changed = tx.execute(&update_sql, params![first_entry, now_stamp(), id])?;
            if changed == 0 {
                return Ok(None);
            }

            tx.commit()?;
            read_job(&self.conn, &table, id)
        })
    }

    /// Handler-side selection: the one row at `stage` with a usable
    /// folder_name. Returns `(id, folder_name)`.
    pub fn pick_at_stage(
        &self,
        stage: i64,
        order: PickOrder,
    ) -> Result<Option<(i64, String)>, StoreError> {
        let sql = format!(
            "SELECT id, folder_name \
             FROM {table} \
             WHERE check_create = ?1 \
               AND folder_name IS NOT NULL \
               AND folder_name != '' \
             ORDER BY {order} \
             LIMIT 1",
            table = self.table,
            order = order_sql(order),
        );
        Ok(self
            .conn
            .query_row(&sql, params![stage], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?)
    }

    /// Refuses to proceed unless exactly one job sits at `stage`. Handlers
    /// that pick their job by stage alone would silently grab the wrong row
    /// otherwise; this turns that into a loud stop.
    pub fn guard_unique_stage(&self, stage: i64) -> Result<(), StoreError> {
        let sql = format!(
            "SELECT id FROM {table} WHERE check_create = ?1 ORDER BY id DESC LIMIT {GUARD_SCAN_LIMIT}",
            table = self.table,
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params![stage], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<i64>, _>>()?;

        if ids.len() != 1 {
            return Err(StoreError::MultipleOccupants { stage, ids });
        }
        Ok(())
    }

    /// Success transition: `expected_stage` -> `end_value`, clearing
    /// last_error. The compare-and-swap predicate makes a concurrent move
    /// visible as `StageMismatch` instead of a silent overwrite.
    pub fn mark_done(
        &mut self,
        id: i64,
        expected_stage: i64,
        end_value: i64,
    ) -> Result<(), StoreError> {
        let table = self.table.clone();
        let sql = format!(
            "UPDATE {table} \
             SET check_create = ?1, last_error = NULL, updated_at = ?2 \
             WHERE id = ?3 AND check_create = ?4"
        );
        let retry = self.retry;
        with_busy_retry(retry, "mark_done", || {
            let changed = self
                .conn
                .execute(&sql, params![end_value, now_stamp(), id, expected_stage])?;
            if changed != 0 {
                return Ok(());
            }
            match read_job(&self.conn, &table, id)? {
                Some(row) => Err(StoreError::StageMismatch {
                    id,
                    expected: expected_stage,
                    actual: row.stage,
                }),
                None => Err(StoreError::UnknownId(id)),
            }
        })
    }

    /// Failure transition: force `stage_value` (the stage's own entry for
    /// retry-in-place, 0 for reset-to-start) and record the diagnostic.
    pub fn mark_fail(&mut self, id: i64, stage_value: i64, error: &str) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {table} \
             SET check_create = ?1, last_error = ?2, updated_at = ?3 \
             WHERE id = ?4",
            table = self.table,
        );
        let truncated = truncate_error(error);
        let retry = self.retry;
        with_busy_retry(retry, "mark_fail", || {
            let changed = self
                .conn
                .execute(&sql, params![stage_value, truncated, now_stamp(), id])?;
            if changed == 0 {
                return Err(StoreError::UnknownId(id));
            }
            Ok(())
        })
    }

    pub fn mark_video_created(&mut self, id: i64) -> Result<(), StoreError> {
        self.set_progress_flag(id, "video_created", "video_created_at", "mark_video_created")
    }

    pub fn mark_video_uploaded(&mut self, id: i64) -> Result<(), StoreError> {
        self.set_progress_flag(id, "video_uploaded", "video_uploaded_at", "mark_video_uploaded")
    }

    fn set_progress_flag(
        &mut self,
        id: i64,
        flag: &str,
        stamped_at: &str,
        op: &'static str,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {table} \
             SET {flag} = 1, {stamped_at} = ?1, updated_at = ?1 \
             WHERE id = ?2",
            table = self.table,
        );
        let retry = self.retry;
        with_busy_retry(retry, op, || {
            let changed = self.conn.execute(&sql, params![now_stamp(), id])?;
            if changed == 0 {
                return Err(StoreError::UnknownId(id));
            }
            Ok(())
        })
    }

    fn column_names(&self) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({table})", table = self.table))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<HashSet<String>, _>>()?;
        Ok(names)
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        stage: row.get(1)?,
        folder_name: row.get(2)?,
        last_error: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn read_job(conn: &Connection, table: &str, id: i64) -> Result<Option<JobRow>, StoreError> {
    let sql = format!(
        "SELECT id, check_create, folder_name, last_error, updated_at FROM {table} WHERE id = ?1"
    );
    Ok(conn.query_row(&sql, params![id], job_from_row).optional()?)
}

fn order_sql(order: PickOrder) -> &'static str {
    match order {
        PickOrder::IdDesc => "id DESC",
        PickOrder::PostDateDesc => "post_date DESC, id DESC",
        PickOrder::CommentsDesc => "comments_count DESC, post_date DESC, id DESC",
    }
}

fn now_stamp() -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::now_utc().format(&format).unwrap_or_default()
}

fn truncate_error(error: &str) -> String {
    error.chars().take(LAST_ERROR_MAX_CHARS).collect()
}

fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
    if !valid_first || !name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(StoreError::InvalidInput(
            "identifier must be ASCII letters, digits or underscores",
        ));
    }
    Ok(())
}

fn normalize_choice<'a>(value: &str, allowed: &[&'a str]) -> Option<&'a str> {
    let upper = value.trim().to_ascii_uppercase();
    allowed.iter().copied().find(|choice| *choice == upper)
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    err.to_string().contains("duplicate column name")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_validation() {
        assert!(validate_identifier("items").is_ok());
        assert!(validate_identifier("idx_items_pick_queue").is_ok());
        assert!(validate_identifier("_shadow").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("items; DROP TABLE items").is_err());
        assert!(validate_identifier("1items").is_err());
    }

    #[test]
    fn pick_order_sql_shapes() {
        assert_eq!(order_sql(PickOrder::IdDesc), "id DESC");
        assert_eq!(order_sql(PickOrder::PostDateDesc), "post_date DESC, id DESC");
        assert_eq!(
            order_sql(PickOrder::CommentsDesc),
            "comments_count DESC, post_date DESC, id DESC"
        );
    }

    #[test]
    fn error_text_is_truncated_on_char_boundary() {
        let long = "あ".repeat(LAST_ERROR_MAX_CHARS + 10);
        let cut = truncate_error(&long);
        assert_eq!(cut.chars().count(), LAST_ERROR_MAX_CHARS);
    }

    #[test]
    fn stamp_is_iso_like() {
        let stamp = now_stamp();
        assert_eq!(stamp.len(), 19, "expected %Y-%m-%d %H:%M:%S, got {stamp}");
        assert_eq!(&stamp[4..5], "-");
        assert_eq!(&stamp[10..11], " ");
    }
}
