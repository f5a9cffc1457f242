use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;

use repomason::engine::{self, Reporter, RunOptions};
use repomason::errors::{is_cancelled, subprocess_failure};
use repomason::release::DistFilter;
use repomason_process::{CancelToken, RunError};

#[derive(Parser, Debug)]
#[command(name = "repomason", version)]
#[command(about = "Build signed deb/rpm repositories from a declarative configuration")]
struct Cli {
    /// GPG passphrase for the signing key
    #[arg(short, long, default_value = "")]
    passphrase: String,

    /// Stream child process output instead of capturing it; forces -j 1
    #[arg(short, long)]
    verbose: bool,

    /// On error, prompt before cleaning up the work directory
    #[arg(short, long)]
    interactive: bool,

    /// Only build the matching releases. Accepted shapes: `distro`,
    /// `distro:codename`, `distro:suite`, `distro:id`, `distro:name`
    #[arg(short = 'D', long = "distributions", value_name = "FILTER", num_args = 1..)]
    distributions: Vec<String>,

    /// Scheduler pool size (default: number of CPUs + 1)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Configuration file
    #[arg(default_value = repomason::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(&err),
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut filters = Vec::with_capacity(cli.distributions.len());
    for raw in &cli.distributions {
        filters.push(DistFilter::parse(raw)?);
    }

    let token = CancelToken::new();
    {
        let token = token.clone();
        ctrlc::set_handler(move || token.request_cancel())?;
    }

    let opts = RunOptions {
        config_path: cli.config,
        passphrase: cli.passphrase,
        verbose: cli.verbose,
        interactive: cli.interactive,
        jobs: cli.jobs,
        filters,
    };
    let reporter: Arc<Mutex<dyn Reporter + Send>> = Arc::new(Mutex::new(CliReporter));

    engine::run(&token, &opts, reporter)
}

/// Map the failure to the documented exit codes: 1 for an interrupt, 2 for
/// a child tool that exited non-zero (argv and captured output go to
/// stderr), 3 for everything else.
fn report(err: &anyhow::Error) -> ExitCode {
    if is_cancelled(err) {
        eprintln!("[error] interrupted");
        return ExitCode::from(1);
    }
    if let Some(RunError::SubprocessFailed { argv, code, output }) = subprocess_failure(err) {
        eprintln!("[error] command failed with status {code}: {argv}");
        if !output.is_empty() {
            eprint!("{output}");
            if !output.ends_with('\n') {
                eprintln!();
            }
        }
        return ExitCode::from(2);
    }
    eprintln!("[error] {err:#}");
    ExitCode::from(3)
}
