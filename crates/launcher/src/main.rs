#![forbid(unsafe_code)]

mod config;
mod driver;
mod handler;

use config::LauncherConfig;
use driver::{Outcome, banner, process_one};
use handler::SubprocessRunner;
use sq_storage::QueueStore;
use std::path::PathBuf;

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_UNUSABLE: i32 = 2;

fn usage() -> &'static str {
    "sq_launcher - drive the content pipeline queue end to end\n\
     \n\
     USAGE:\n\
     \x20 sq_launcher [--runs N] [--env FILE] [--db PATH] [--stop-on-error]\n\
     \n\
     OPTIONS:\n\
     \x20 --runs N          iterations to attempt (default: RUNS_DEFAULT or 1)\n\
     \x20 --env FILE        seed the environment from FILE; variables that are\n\
     \x20                   already set win\n\
     \x20 --db PATH         queue database path, overrides DB_PATH\n\
     \x20 --stop-on-error   stop at the first failed iteration\n\
     \x20 --help            print this help\n\
     \n\
     NOTES:\n\
     \x20 - configuration comes from the environment; see the .env keys in\n\
     \x20   the README.\n\
     \x20 - stage handlers are external commands resolved under SCRIPTS_DIR;\n\
     \x20   a handler advances its job in the queue database itself and\n\
     \x20   exits 0.\n\
     \x20 - exit codes: 0 = every iteration clean, 1 = at least one iteration\n\
     \x20   failed, 2 = the configuration or queue database is unusable.\n"
}

#[derive(Debug, Default)]
struct CliArgs {
    help: bool,
    runs: Option<u32>,
    env_file: Option<PathBuf>,
    db: Option<PathBuf>,
    stop_on_error: bool,
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut out = CliArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => out.help = true,
            "--runs" => {
                let raw = flag_value(&mut iter, "--runs")?;
                out.runs = Some(
                    raw.parse()
                        .map_err(|_| format!("--runs expects a positive integer, got {raw:?}"))?,
                );
            }
            "--env" => out.env_file = Some(PathBuf::from(flag_value(&mut iter, "--env")?)),
            "--db" => out.db = Some(PathBuf::from(flag_value(&mut iter, "--db")?)),
            "--stop-on-error" => out.stop_on_error = true,
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(out)
}

fn flag_value<'a>(
    iter: &mut std::slice::Iter<'a, String>,
    flag: &str,
) -> Result<&'a String, String> {
    iter.next().ok_or_else(|| format!("{flag} expects a value"))
}

fn print_conf(cfg: &LauncherConfig, runs: u32) {
    println!("[CONF] db={}", cfg.db_path.display());
    println!("[CONF] table={}", cfg.table);
    println!("[CONF] scripts_dir={}", cfg.scripts_dir.display());
    println!("[CONF] pick_new_order={}", cfg.pick_order.as_str());
    println!(
        "[CONF] runs={runs} stop_on_error={} sleep_when_empty={:.1}s",
        cfg.stop_on_error,
        cfg.sleep_when_empty.as_secs_f64()
    );
    for spec in cfg.plan.specs() {
        let handler = cfg.handler_for(spec.role);
        let timeout = match handler.timeout {
            Some(limit) => format!("{}s", limit.as_secs()),
            None => "none".to_string(),
        };
        println!(
            "[CONF] {}: {} -> {} script={} timeout={timeout}",
            spec.role,
            spec.entry,
            spec.exit,
            handler.script.display()
        );
    }
}

fn run() -> i32 {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("[ARGS] {message}");
            eprint!("{}", usage());
            return EXIT_UNUSABLE;
        }
    };
    if args.help {
        print!("{}", usage());
        return EXIT_OK;
    }

    if let Some(path) = &args.env_file {
        if let Err(err) = dotenvy::from_path(path) {
            eprintln!("[ENV] cannot load {}: {err}", path.display());
            return EXIT_UNUSABLE;
        }
    } else {
        // A missing default .env is fine; the environment may be complete
        // on its own.
        let _ = dotenvy::dotenv();
    }

    let cfg = match LauncherConfig::from_env(args.db, args.stop_on_error) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("[ENV] {err}");
            return EXIT_UNUSABLE;
        }
    };
    let runs = args.runs.unwrap_or(cfg.runs_default).max(1);

    banner("LAUNCHER START");
    print_conf(&cfg, runs);
    for handler in &cfg.handlers {
        if !handler.script.is_file() {
            println!(
                "[WARN] script for {} not found yet: {}",
                handler.role,
                handler.script.display()
            );
        }
    }

    let mut store = match QueueStore::open(&cfg.db_path, &cfg.table, &cfg.tuning) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("[ERROR] {err}");
            return EXIT_UNUSABLE;
        }
    };
    if let Err(err) = store.ensure_schema(cfg.pick_index.as_deref()) {
        eprintln!("[ERROR] {err}");
        return EXIT_UNUSABLE;
    }

    let mut runner = SubprocessRunner;
    let mut clean = 0u32;
    let mut failed = 0u32;
    for iteration in 1..=runs {
        println!("\n[LOOP] {iteration}/{runs}");
        let mut idle = false;
        match process_one(&mut store, &cfg, &mut runner) {
            Ok(Outcome::Idle) => {
                println!("[INFO] no item to process.");
                idle = true;
                clean += 1;
            }
            Ok(Outcome::Completed { id }) => {
                println!("[INFO] id={id} reached the terminal stage.");
                clean += 1;
            }
            Ok(Outcome::Stalled { id, stage }) => {
                println!("[INFO] id={id} sits at stage {stage}, which matches no entry (skip).");
                clean += 1;
            }
            Ok(Outcome::Failed { id }) => {
                println!("[INFO] id={id} failed this iteration.");
                failed += 1;
                if cfg.stop_on_error {
                    println!("[INFO] stop_on_error is set, stopping.");
                    break;
                }
            }
            Err(err) => {
                eprintln!("[ERROR] {err}");
                failed += 1;
                if cfg.stop_on_error {
                    println!("[INFO] stop_on_error is set, stopping.");
                    break;
                }
            }
        }
        if idle && iteration < runs && !cfg.sleep_when_empty.is_zero() {
            std::thread::sleep(cfg.sleep_when_empty);
        }
    }

    banner(&format!("LAUNCHER END  ok={clean} err={failed}"));
    if failed == 0 { EXIT_OK } else { EXIT_FAILED }
}

fn main() {
    std::process::exit(run());
}
