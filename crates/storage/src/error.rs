#![forbid(unsafe_code)]

use std::path::PathBuf;

#[derive(Debug)]
pub enum StoreError {
    /// The queue database file does not exist or cannot be opened. Fatal;
    /// provisioning the database is the ingestion side's job, never ours.
    Unavailable(PathBuf),
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput(&'static str),
    MissingTable(String),
    UnknownId(i64),
    /// A mutation could not commit within the bounded busy-retry budget.
    ContentionExceeded {
        op: &'static str,
        attempts: u32,
    },
    /// The stage guard found a number of occupants other than exactly one.
    /// Signals a corrupted invariant; operator intervention required.
    MultipleOccupants {
        stage: i64,
        ids: Vec<i64>,
    },
    /// The job's observed stage did not match what the protocol expected.
    StageMismatch {
        id: i64,
        expected: i64,
        actual: i64,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(path) => write!(f, "queue database not found: {}", path.display()),
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::MissingTable(table) => write!(f, "queue table does not exist: {table}"),
            Self::UnknownId(id) => write!(f, "unknown job id: {id}"),
            Self::ContentionExceeded { op, attempts } => {
                write!(f, "database is locked ({op}: retry exceeded after {attempts} attempts)")
            }
            Self::MultipleOccupants { stage, ids } => {
                let joined = ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                write!(
                    f,
                    "stage {stage} must hold exactly one job, found {} (ids={joined})",
                    ids.len()
                )
            }
            Self::StageMismatch {
                id,
                expected,
                actual,
            } => write!(
                f,
                "stage mismatch for id={id} (expected={expected}, actual={actual})"
            ),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}
