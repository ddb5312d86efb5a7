#![forbid(unsafe_code)]

//! Domain types for the stage pipeline: roles, the stage plan that maps each
//! role to its numeric entry/exit values, and the per-stage failure policy.
//!
//! Numeric stage values are deployment configuration, not code. Deployments
//! have renumbered stages over time, so everything downstream addresses a
//! stage by role and resolves the integer through a [`StagePlan`].

/// One handler role in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageRole {
    Fetch,
    Render,
    Audio,
    Thumbnail,
    Assemble,
}

impl StageRole {
    pub const ALL: [StageRole; 5] = [
        StageRole::Fetch,
        StageRole::Render,
        StageRole::Audio,
        StageRole::Thumbnail,
        StageRole::Assemble,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Render => "render",
            Self::Audio => "audio",
            Self::Thumbnail => "thumbnail",
            Self::Assemble => "assemble",
        }
    }
}

impl std::fmt::Display for StageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the driver does with a job after the role's handler fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Leave the stage value unchanged so a later iteration retries it.
    RetryInPlace,
    /// Force the job back to stage 0, discarding progress. Reserved for
    /// stages whose failure mode is ambiguous about the state left behind.
    ResetToStart,
}

/// Entry/exit stage values and failure policy for one role.
#[derive(Clone, Copy, Debug)]
pub struct StageSpec {
    pub role: StageRole,
    pub entry: i64,
    pub exit: i64,
    pub on_fail: FailurePolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StagePlanError {
    Empty,
    EntryIsZero(StageRole),
    ExitIsZero(StageRole),
    ExitEqualsEntry(StageRole),
    DuplicateEntry { value: i64 },
}

impl std::fmt::Display for StagePlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "stage plan has no stages"),
            Self::EntryIsZero(role) => {
                write!(f, "{role}: entry value 0 is reserved for unclaimed jobs")
            }
            Self::ExitIsZero(role) => write!(f, "{role}: exit value 0 is reserved"),
            Self::ExitEqualsEntry(role) => {
                write!(f, "{role}: exit value must differ from entry value")
            }
            Self::DuplicateEntry { value } => {
                write!(f, "entry value {value} is used by more than one stage")
            }
        }
    }
}

impl std::error::Error for StagePlanError {}

/// The ordered pipeline. Position in `specs` is pipeline order; the in-progress
/// picker prefers earlier roles regardless of the numeric stage values.
#[derive(Clone, Debug)]
pub struct StagePlan {
    specs: Vec<StageSpec>,
}

impl StagePlan {
    pub fn try_new(specs: Vec<StageSpec>) -> Result<Self, StagePlanError> {
        if specs.is_empty() {
            return Err(StagePlanError::Empty);
        }
        for spec in &specs {
            if spec.entry == 0 {
                return Err(StagePlanError::EntryIsZero(spec.role));
            }
            if spec.exit == 0 {
                return Err(StagePlanError::ExitIsZero(spec.role));
            }
            if spec.exit == spec.entry {
                return Err(StagePlanError::ExitEqualsEntry(spec.role));
            }
        }
        for (index, spec) in specs.iter().enumerate() {
            if specs[..index].iter().any(|prior| prior.entry == spec.entry) {
                return Err(StagePlanError::DuplicateEntry { value: spec.entry });
            }
        }
        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[StageSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Entry values in pipeline order (earlier roles first).
    pub fn entry_values(&self) -> Vec<i64> {
        self.specs.iter().map(|spec| spec.entry).collect()
    }

    pub fn first_entry(&self) -> i64 {
        self.specs[0].entry
    }

    pub fn spec_for_entry(&self, stage: i64) -> Option<&StageSpec> {
        self.specs.iter().find(|spec| spec.entry == stage)
    }

    pub fn position(&self, role: StageRole) -> Option<usize> {
        self.specs.iter().position(|spec| spec.role == role)
    }

    /// The stage value that marks a job as fully done: the last role's exit.
    pub fn terminal(&self) -> i64 {
        self.specs[self.specs.len() - 1].exit
    }

    pub fn is_terminal(&self, stage: i64) -> bool {
        stage == self.terminal()
    }
}

/// Ordering applied when claiming among stage-0 jobs. Advisory, not a FIFO
/// contract; the names match the deployed picker configurations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PickOrder {
    IdDesc,
    PostDateDesc,
    CommentsDesc,
}

impl PickOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "id_desc" => Some(Self::IdDesc),
            "post_date_desc" => Some(Self::PostDateDesc),
            "comments_desc" => Some(Self::CommentsDesc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdDesc => "id_desc",
            Self::PostDateDesc => "post_date_desc",
            Self::CommentsDesc => "comments_desc",
        }
    }
}

impl std::fmt::Display for PickOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
