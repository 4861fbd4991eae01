//! # regress-glibc
//!
//! Regression harness for the CFS interposer. Exits 0 only if every check
//! passed.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cfs_config::logging::{init_logging, LogLevel};
use cfs_config::{log_regress_info, ENV_COLLECTOR, ENV_ROOT};
use cfs_regress::runner::Summary;
use cfs_regress::{regress, scenario, trace};

/// Make sure glibc calls keep their normal behavior under the CFS interposer
#[derive(Parser)]
#[command(name = "regress-glibc")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Verbose harness logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the regress_glibc transparency suite in this process
    Regress {
        /// Re-run the suite under LD_PRELOAD with this interposer library
        #[arg(long, value_name = "LIB")]
        preload: Option<PathBuf>,

        /// Only run cases whose name contains this text
        #[arg(long)]
        filter: Option<String>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check recorded events with the interposer preloaded
    Trace {
        /// Interposer library to preload into each scenario
        #[arg(long, value_name = "LIB", env = "CFS_PRELOAD")]
        preload: PathBuf,

        #[arg(long)]
        filter: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Child side of a trace case
    #[command(hide = true)]
    Scenario {
        name: String,
        tree: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

const ENV_REEXEC: &str = "CFS_REGRESS_PRELOADED";

fn main() {
    let cli = Cli::parse();
    init_logging(LogLevel::from_debug_level(cli.verbose));

    let code = match run(cli.command.unwrap_or(Commands::Regress {
        preload: None,
        filter: None,
        json: false,
    })) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("regress-glibc: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(command: Commands) -> Result<i32> {
    match command {
        Commands::Regress {
            preload: Some(lib),
            filter,
            json,
        } if std::env::var_os(ENV_REEXEC).is_none() => reexec_preloaded(&lib, filter, json),
        Commands::Regress { filter, json, .. } => {
            let mut summary = Summary::default();
            regress::suite().run(&(), filter.as_deref(), &mut summary);
            Ok(report(&summary, json))
        }
        Commands::Trace {
            preload,
            filter,
            json,
        } => {
            let ctx = trace::TraceContext::start(&preload)?;
            let mut summary = Summary::default();
            trace::suite().run(&ctx, filter.as_deref(), &mut summary);
            Ok(report(&summary, json))
        }
        Commands::Scenario { name, tree, args } => {
            scenario::run(&name, &tree, &args)?;
            Ok(0)
        }
    }
}

/// Run the suite again in a child with the interposer loaded and tracking a
/// scratch tree, so every libc call below goes through the shims.
fn reexec_preloaded(lib: &Path, filter: Option<String>, json: bool) -> Result<i32> {
    let lib = lib
        .canonicalize()
        .with_context(|| format!("preload library {}", lib.display()))?;
    let tree = tempfile::Builder::new().prefix("cfs-regress-tree").tempdir()?;
    let exe = std::env::current_exe().context("locate own executable")?;

    let mut cmd = Command::new(exe);
    cmd.arg("regress")
        .env("LD_PRELOAD", &lib)
        .env(ENV_ROOT, tree.path())
        .env(ENV_COLLECTOR, tree.path().join("no-collector.sock"))
        .env(ENV_REEXEC, "1");
    if let Some(filter) = filter {
        cmd.arg("--filter").arg(filter);
    }
    if json {
        cmd.arg("--json");
    }
    log_regress_info!("Re-running under the interposer", preload = tracing::field::display(lib.display()));
    let status = cmd.status().context("run preloaded suite")?;
    Ok(status.code().unwrap_or(1))
}

fn report(summary: &Summary, json: bool) -> i32 {
    if json {
        match serde_json::to_string_pretty(summary) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("regress-glibc: cannot render summary: {}", e),
        }
    } else {
        println!();
        println!("{}", summary);
    }
    summary.exit_code()
}
