#![forbid(unsafe_code)]

use sq_core::StageRole;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const WAIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub(crate) enum HandlerError {
    Spawn(String),
    Io(std::io::Error),
    NonZeroExit(Option<i32>),
    Timeout(Duration),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(message) => write!(f, "{message}"),
            Self::Io(err) => write!(f, "io: {err}"),
            Self::NonZeroExit(Some(code)) => write!(f, "exit={code}"),
            Self::NonZeroExit(None) => write!(f, "killed by signal"),
            Self::Timeout(limit) => write!(f, "timeout after {}s", limit.as_secs()),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Everything the driver hands a stage handler: the command, the explicit
/// job context in the environment, and an optional wall-clock budget.
#[derive(Debug)]
pub(crate) struct Invocation {
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) envs: Vec<(String, String)>,
    pub(crate) timeout: Option<Duration>,
}

/// Seam between the driver and the outside world. The production impl spawns
/// a subprocess; tests substitute an in-process stub.
pub(crate) trait HandlerRunner {
    fn run(&mut self, role: StageRole, invocation: &Invocation) -> Result<(), HandlerError>;
}

pub(crate) struct SubprocessRunner;

impl HandlerRunner for SubprocessRunner {
    fn run(&mut self, role: StageRole, invocation: &Invocation) -> Result<(), HandlerError> {
        println!(
            "[RUN] {} {}",
            invocation.program.display(),
            invocation.args.join(" ")
        );
        let start = Instant::now();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            // stderr is an opaque log stream too; inherit relays it as-is.
            .stderr(Stdio::inherit());
        for (key, value) in &invocation.envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|err| {
            HandlerError::Spawn(format!(
                "failed to spawn {}: {err}",
                invocation.program.display()
            ))
        })?;

        // Relay stdout line by line from a helper thread so the timeout watch
        // below never blocks on a quiet pipe.
        let relay = child.stdout.take().map(|out| {
            std::thread::spawn(move || {
                for line in BufReader::new(out).lines() {
                    match line {
                        Ok(line) => println!("{line}"),
                        Err(_) => break,
                    }
                }
            })
        });

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(HandlerError::Io(err));
                }
            }
            if let Some(limit) = invocation.timeout {
                if start.elapsed() >= limit {
                    // The failure transition must never run while the handler
                    // might still be alive: kill and reap first.
                    let _ = child.kill();
                    let _ = child.wait();
                    if let Some(handle) = relay {
                        let _ = handle.join();
                    }
                    return Err(HandlerError::Timeout(limit));
                }
            }
            std::thread::sleep(WAIT_POLL);
        };

        if let Some(handle) = relay {
            let _ = handle.join();
        }

        if !status.success() {
            return Err(HandlerError::NonZeroExit(status.code()));
        }

        println!("[OK] {role} finished in {}", format_elapsed(start.elapsed()));
        Ok(())
    }
}

pub(crate) fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else {
        let minutes = (secs / 60.0) as u64;
        format!("{minutes}m{:.0}s", secs - (minutes as f64) * 60.0)
    }
}
