// THEORY:
// The binary is a thin shell around the library. It owns the three things a
// library must not: the process-wide log subscriber, the worker pool the
// pipeline forks onto, and the fatal path.
//
// Every failure reaches `fatal` exactly once, which prints
// `shot_diff: fatal: <message>` to stderr under a process-wide lock and exits
// with status 1. Nothing is written to the output prefix after a failure.

use std::process;
use std::sync::{Mutex, PoisonError};

use colored::Colorize;
use tracing_subscriber::EnvFilter;

use shot_diff::cli::{self, Args, Invocation};
use shot_diff::error::{DiffError, Result};
use shot_diff::pipeline::DiffPipeline;

static FATAL_LOCK: Mutex<()> = Mutex::new(());

fn main() {
    let raw: Vec<String> = std::env::args().collect();
    let color = cli::wants_color(&raw);
    init_tracing();

    let args = match cli::parse(raw) {
        Ok(Invocation::Run(args)) => args,
        Ok(Invocation::Help(text)) => {
            print!("{text}");
            return;
        }
        Err(err) => fatal(&err, color),
    };

    if let Err(err) = run(args) {
        fatal(&err, color);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(args: Args) -> Result<()> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.thread_count())
        .thread_name(|index| format!("shot_diff-worker-{index}"))
        .build()?;
    tracing::debug!(threads = pool.current_num_threads(), "worker pool ready");

    let perf = args.perf;
    let pipeline = DiffPipeline::new(args.into_config());
    pool.install(|| pipeline.run())?;

    if perf {
        print!("{}", pipeline.profiler().report());
    }
    Ok(())
}

fn fatal(err: &DiffError, color: bool) -> ! {
    let _guard = FATAL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let message = format!("shot_diff: fatal: {err}");
    if color {
        colored::control::set_override(true);
        eprintln!("{}", message.red().bold());
    } else {
        eprintln!("{message}");
    }
    process::exit(1);
}
