//! CLI for running programs on MicroPython boards.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod run;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mpboard",
    version,
    about = "Run Python programs on a MicroPython board through its raw REPL",
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    run: run::RunArgs,

    /// Log protocol activity to stderr.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Print a shell completion script and exit.
    #[arg(long, value_name = "SHELL", hide = true)]
    completions: Option<Shell>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Some(shell) = cli.completions {
        clap_complete::generate(shell, &mut Cli::command(), "mpboard", &mut std::io::stdout());
        return;
    }

    if let Err(e) = dispatch(cli.run) {
        eprintln!("mpboard: {e:#}");
        std::process::exit(1);
    }
}

fn dispatch(args: run::RunArgs) -> Result<()> {
    let interrupt = Arc::new(AtomicBool::new(false));
    // First signal cancels the running program, a second one terminates.
    for &sig in signal_hook::consts::TERM_SIGNALS {
        signal_hook::flag::register_conditional_shutdown(sig, 1, Arc::clone(&interrupt))
            .context("cannot install signal handler")?;
        signal_hook::flag::register(sig, Arc::clone(&interrupt))
            .context("cannot install signal handler")?;
    }
    args.run(&interrupt)
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "mpboard=debug,mpboard_cli=debug"
    } else {
        "mpboard=warn,mpboard_cli=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .init();
}
