#![forbid(unsafe_code)]

use sq_core::{FailurePolicy, PickOrder, StagePlan, StagePlanError, StageRole, StageSpec};
use sq_storage::StoreTuning;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub(crate) enum ConfigError {
    MissingKey(&'static str),
    InvalidValue { key: &'static str, reason: String },
    InvalidPlan(StagePlanError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingKey(key) => write!(f, "missing required key: {key}"),
            Self::InvalidValue { key, reason } => write!(f, "invalid value for {key}: {reason}"),
            Self::InvalidPlan(err) => write!(f, "invalid stage plan: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<StagePlanError> for ConfigError {
    fn from(value: StagePlanError) -> Self {
        Self::InvalidPlan(value)
    }
}

/// One external handler command bound to a pipeline role.
#[derive(Clone, Debug)]
pub(crate) struct HandlerSpec {
    pub(crate) role: StageRole,
    pub(crate) script: PathBuf,
    pub(crate) timeout: Option<Duration>,
}

#[derive(Debug)]
pub(crate) struct LauncherConfig {
    pub(crate) db_path: PathBuf,
    pub(crate) table: String,
    pub(crate) scripts_dir: PathBuf,
    pub(crate) plan: StagePlan,
    pub(crate) handlers: Vec<HandlerSpec>,
    pub(crate) pick_order: PickOrder,
    pub(crate) pick_index: Option<String>,
    pub(crate) pass_folder_name_to_thumbnail: bool,
    pub(crate) runs_default: u32,
    pub(crate) stop_on_error: bool,
    pub(crate) sleep_when_empty: Duration,
    pub(crate) tuning: StoreTuning,
}

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_str(name: &str, default: &str) -> String {
    env_var(name).unwrap_or_else(|| default.to_string())
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn env_bool(name: &str, default: bool) -> bool {
    env_var(name).and_then(|v| parse_bool(&v)).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            key: name,
            reason: format!("cannot parse {raw:?}"),
        }),
    }
}

/// "", "none" and "null" read as absent, matching the deployed .env files.
fn env_optional_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = env_var(name) else {
        return Ok(None);
    };
    let lowered = raw.to_ascii_lowercase();
    if lowered == "none" || lowered == "null" {
        return Ok(None);
    }
    raw.parse::<u64>().map(Some).map_err(|_| ConfigError::InvalidValue {
        key: name,
        reason: format!("cannot parse {raw:?}"),
    })
}

struct RoleKeys {
    role: StageRole,
    sta: &'static str,
    end: &'static str,
    script: &'static str,
    script_default: &'static str,
    timeout: &'static str,
}

const ROLE_KEYS: [RoleKeys; 5] = [
    RoleKeys {
        role: StageRole::Fetch,
        sta: "STA_FETCH",
        end: "END_FETCH",
        script: "SCRIPT_FETCH",
        script_default: "fetch.sh",
        timeout: "TIMEOUT_FETCH",
    },
    RoleKeys {
        role: StageRole::Render,
        sta: "STA_RENDER",
        end: "END_RENDER",
        script: "SCRIPT_RENDER",
        script_default: "render.sh",
        timeout: "TIMEOUT_RENDER",
    },
    RoleKeys {
        role: StageRole::Audio,
        sta: "STA_AUDIO",
        end: "END_AUDIO",
        script: "SCRIPT_AUDIO",
        script_default: "audio.sh",
        timeout: "TIMEOUT_AUDIO",
    },
    RoleKeys {
        role: StageRole::Thumbnail,
        sta: "STA_THUMBNAIL",
        end: "END_THUMBNAIL",
        script: "SCRIPT_THUMBNAIL",
        script_default: "thumbnail.sh",
        timeout: "TIMEOUT_THUMBNAIL",
    },
    RoleKeys {
        role: StageRole::Assemble,
        sta: "STA_ASSEMBLE",
        end: "END_ASSEMBLE",
        script: "SCRIPT_ASSEMBLE",
        script_default: "assemble.sh",
        timeout: "TIMEOUT_ASSEMBLE",
    },
];

impl LauncherConfig {
    pub(crate) fn from_env(
        db_override: Option<PathBuf>,
        stop_on_error_override: bool,
    ) -> Result<Self, ConfigError> {
        let db_path = match db_override {
            Some(path) => path,
            None => PathBuf::from(env_var("DB_PATH").ok_or(ConfigError::MissingKey("DB_PATH"))?),
        };
        let table = env_str("TABLE_NAME", "items");
        let scripts_dir = env_var("SCRIPTS_DIR")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        // The reset choice exists only for fetch: its failure mode is
        // ambiguous about what state was left behind, every later stage
        // resumes safely in place.
        let reset_fetch = env_bool("RESET_TO_ZERO_ON_FAIL_FETCH", false);

        let mut specs = Vec::with_capacity(ROLE_KEYS.len());
        let mut handlers = Vec::with_capacity(ROLE_KEYS.len());
        for (position, keys) in ROLE_KEYS.iter().enumerate() {
            let default_entry = (position + 1) as i64;
            let entry = env_parsed(keys.sta, default_entry)?;
            let exit = env_parsed(keys.end, default_entry + 1)?;
            let on_fail = if keys.role == StageRole::Fetch && reset_fetch {
                FailurePolicy::ResetToStart
            } else {
                FailurePolicy::RetryInPlace
            };
            specs.push(StageSpec {
                role: keys.role,
                entry,
                exit,
                on_fail,
            });
            handlers.push(HandlerSpec {
                role: keys.role,
                script: scripts_dir.join(env_str(keys.script, keys.script_default)),
                timeout: env_optional_u64(keys.timeout)?.map(Duration::from_secs),
            });
        }
        let plan = StagePlan::try_new(specs)?;

        let pick_order_raw = env_str("PICK_NEW_ORDER", "post_date_desc");
        let pick_order =
            PickOrder::parse(&pick_order_raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "PICK_NEW_ORDER",
                reason: format!("unknown order {pick_order_raw:?}"),
            })?;

        let pick_index = if env_bool("ENABLE_PICK_QUEUE_INDEX", true) {
            Some(env_str("PICK_QUEUE_INDEX_NAME", "idx_items_pick_queue"))
        } else {
            None
        };

        let journal_mode = if env_bool("SQLITE_WAL", true) {
            Some("WAL".to_string())
        } else {
            env_var("SQLITE_JOURNAL_MODE")
        };
        let tuning = StoreTuning {
            busy_timeout: Duration::from_millis(env_parsed("BUSY_TIMEOUT_MS", 60_000u64)?),
            journal_mode,
            synchronous: Some(env_str("SQLITE_SYNCHRONOUS", "NORMAL")),
            lock_retry_max: env_parsed("LOCK_RETRY_MAX", 25u32)?,
            lock_retry_sleep: Duration::from_millis(env_parsed("LOCK_RETRY_SLEEP_MS", 800u64)?),
        };

        let sleep_secs = env_parsed("SLEEP_SEC_WHEN_EMPTY", 0.0f64)?;
        if !sleep_secs.is_finite() || sleep_secs < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "SLEEP_SEC_WHEN_EMPTY",
                reason: format!("must be a non-negative number, got {sleep_secs}"),
            });
        }

        Ok(Self {
            db_path,
            table,
            scripts_dir,
            plan,
            handlers,
            pick_order,
            pick_index,
            pass_folder_name_to_thumbnail: env_bool("PASS_FOLDER_NAME_TO_THUMBNAIL", false),
            runs_default: env_parsed("RUNS_DEFAULT", 1u32)?,
            stop_on_error: stop_on_error_override || env_bool("STOP_ON_ERROR", false),
            sleep_when_empty: Duration::from_secs_f64(sleep_secs),
            tuning,
        })
    }

    pub(crate) fn handler_for(&self, role: StageRole) -> &HandlerSpec {
        self.handlers
            .iter()
            .find(|handler| handler.role == role)
            .expect("every plan role has a handler spec")
    }
}
