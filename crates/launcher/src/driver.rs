#![forbid(unsafe_code)]

use crate::config::LauncherConfig;
use crate::handler::{HandlerError, HandlerRunner, Invocation};
use sq_core::{FailurePolicy, StageRole, StageSpec};
use sq_storage::{JobRow, QueueStore, StoreError};

/// What one driver iteration did. `Stalled` marks a job whose stage value
/// matches no configured entry (a gap in the plan); it is reported, not
/// failed, exactly like a terminal row would be.
#[derive(Debug)]
pub(crate) enum Outcome {
    Idle,
    Completed { id: i64 },
    Stalled { id: i64, stage: i64 },
    Failed { id: i64 },
}

enum StageFailure {
    Store(StoreError),
    MissingRow,
    Precondition { expected: i64, actual: i64 },
    Handler(HandlerError),
    Postcondition { expected: i64, actual: i64 },
    EmptyFolderName,
}

impl StageFailure {
    fn into_last_error(self, role: StageRole) -> String {
        let (kind, message) = match self {
            Self::Store(StoreError::MultipleOccupants { stage, ids }) => (
                "guard",
                StoreError::MultipleOccupants { stage, ids }.to_string(),
            ),
            Self::Store(err) => ("store", err.to_string()),
            Self::MissingRow => ("store", "job row disappeared".to_string()),
            Self::Precondition { expected, actual } => (
                "precondition",
                format!("expected stage {expected} but got {actual}"),
            ),
            Self::Handler(HandlerError::Timeout(limit)) => {
                ("timeout", HandlerError::Timeout(limit).to_string())
            }
            Self::Handler(err) => ("handler", err.to_string()),
            Self::Postcondition { expected, actual } => (
                "postcondition",
                format!("expected stage {expected} but got {actual}"),
            ),
            Self::EmptyFolderName => ("postcondition", "folder_name is empty".to_string()),
        };
        format!("{role} failed: {kind}: {message}")
    }
}

/// One iteration: claim a job (in-progress work first, then new work) and
/// chain it through every role whose entry value it reaches. Any stage
/// failure applies the configured transition and ends the iteration; this
/// function never panics past that point, the caller decides whether to
/// keep looping.
pub(crate) fn process_one(
    store: &mut QueueStore,
    cfg: &LauncherConfig,
    runner: &mut dyn HandlerRunner,
) -> Result<Outcome, StoreError> {
    let entries = cfg.plan.entry_values();
    let job = match store.pick_in_progress(&entries)? {
        Some(job) => job,
        None => match store.claim_new(cfg.plan.first_entry(), cfg.pick_order)? {
            Some(job) => job,
            None => return Ok(Outcome::Idle),
        },
    };

    println!("[INFO] picked id={} (stage={})", job.id, job.stage);

    let total = cfg.plan.len();
    let mut stage = job.stage;
    for (index, spec) in cfg.plan.specs().iter().enumerate() {
        if stage != spec.entry {
            continue;
        }
        step_line(index + 1, total, spec.role);
        match run_stage(store, cfg, runner, job.id, spec) {
            Ok(()) => stage = spec.exit,
            Err(failure) => {
                let error_text = failure.into_last_error(spec.role);
                eprintln!("[ERROR] {error_text}");
                let stage_value = match spec.on_fail {
                    FailurePolicy::ResetToStart => 0,
                    FailurePolicy::RetryInPlace => spec.entry,
                };
                store.mark_fail(job.id, stage_value, &error_text)?;
                match spec.on_fail {
                    FailurePolicy::ResetToStart => {
                        println!("[INFO] reset id={} to stage 0", job.id);
                    }
                    FailurePolicy::RetryInPlace => {
                        println!(
                            "[INFO] kept id={} at stage {} (retry {})",
                            job.id, spec.entry, spec.role
                        );
                    }
                }
                return Ok(Outcome::Failed { id: job.id });
            }
        }
    }

    if cfg.plan.is_terminal(stage) {
        banner(&format!("[DONE] pipeline finished id={}", job.id));
        Ok(Outcome::Completed { id: job.id })
    } else {
        Ok(Outcome::Stalled { id: job.id, stage })
    }
}

fn run_stage(
    store: &mut QueueStore,
    cfg: &LauncherConfig,
    runner: &mut dyn HandlerRunner,
    id: i64,
    spec: &StageSpec,
) -> Result<(), StageFailure> {
    store
        .guard_unique_stage(spec.entry)
        .map_err(StageFailure::Store)?;

    let before = store
        .get_job(id)
        .map_err(StageFailure::Store)?
        .ok_or(StageFailure::MissingRow)?;
    print_status("before", spec.role, &before);
    if before.stage != spec.entry {
        return Err(StageFailure::Precondition {
            expected: spec.entry,
            actual: before.stage,
        });
    }

    let invocation = build_invocation(cfg, spec.role, &before);
    runner
        .run(spec.role, &invocation)
        .map_err(StageFailure::Handler)?;

    let after = store
        .get_job(id)
        .map_err(StageFailure::Store)?
        .ok_or(StageFailure::MissingRow)?;
    print_status("after", spec.role, &after);
    if after.stage != spec.exit {
        return Err(StageFailure::Postcondition {
            expected: spec.exit,
            actual: after.stage,
        });
    }
    // Later stages resolve their working directory from this value; a fetch
    // that "succeeded" without writing it left nothing to resume from.
    if spec.role == StageRole::Fetch && !after.has_folder_name() {
        return Err(StageFailure::EmptyFolderName);
    }
    Ok(())
}

fn build_invocation(cfg: &LauncherConfig, role: StageRole, job: &JobRow) -> Invocation {
    let handler = cfg.handler_for(role);
    let mut args = Vec::new();
    // Legacy thumbnail handlers take the folder as a flag instead of reading
    // the environment.
    if role == StageRole::Thumbnail && cfg.pass_folder_name_to_thumbnail {
        args.push("--folder_name".to_string());
        args.push(job.folder_name_trimmed().to_string());
    }
    let envs = vec![
        ("SQ_JOB_ID".to_string(), job.id.to_string()),
        (
            "SQ_FOLDER_NAME".to_string(),
            job.folder_name_trimmed().to_string(),
        ),
        ("SQ_DB_PATH".to_string(), cfg.db_path.display().to_string()),
        ("SQ_TABLE".to_string(), cfg.table.clone()),
    ];
    Invocation {
        program: handler.script.clone(),
        args,
        envs,
        timeout: handler.timeout,
    }
}

fn print_status(phase: &str, role: StageRole, job: &JobRow) {
    let folder = job.folder_name_trimmed();
    println!(
        "[STATUS] {phase} {role}: stage={} folder_name={}",
        job.stage,
        if folder.is_empty() { "(empty)" } else { folder }
    );
}

pub(crate) fn banner(message: &str) {
    println!("\n{}", "=".repeat(72));
    println!("{message}");
    println!("{}", "=".repeat(72));
}

fn step_line(step: usize, total: usize, role: StageRole) {
    println!("\n{}", "-".repeat(72));
    println!("[STEP {step:02}/{total:02}] {role} START");
    println!("{}", "-".repeat(72));
}
