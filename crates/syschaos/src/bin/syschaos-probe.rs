//! syschaos probe: drive fault injection against this process
//!
//! # Usage
//! ```bash
//! # exit_group is failed with SYSCHAOS_ERRNO (default EPERM); exits 0 if observed
//! syschaos-probe exit --status 3
//!
//! # Negative control: injection off, the process exits with status 3
//! SYSCHAOS_DISABLE=1 syschaos-probe exit --status 3
//!
//! # Flaky writes to a file, JSON report on stdout
//! syschaos-probe flaky-write --count 1000 --probability 0.3
//!
//! # Validate a plan file
//! syschaos-probe check-plan plan.json --json
//! ```
//!
//! Exit status 77 means the platform cannot intercept syscalls.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use syschaos::config::errno_name;
use syschaos::{
    ConfigError, Eligibility, HarnessConfig, Outcome, Plan, PlanBuilder, SessionError, StartError,
    Stats, ValidationError,
};
use thiserror::Error;

/// Status for "cannot run here", as understood by common test drivers.
const EXIT_UNSUPPORTED: i32 = 77;
/// Status when exit_group returned with an errno other than the expected one.
const EXIT_WRONG_ERRNO: i32 = 100;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid plan: {0}")]
    Plan(#[from] ValidationError),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Parser)]
#[command(name = "syschaos-probe")]
#[command(about = "Exercise syscall fault injection against this process")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fail exit_group and report whether the expected errno came back
    Exit {
        /// Status passed to exit_group
        #[arg(short, long, default_value = "0")]
        status: i32,
    },

    /// Write lines to a file while writes fail at random
    FlakyWrite {
        /// Number of lines to write
        #[arg(short, long, default_value = "100")]
        count: u64,

        /// Failure probability per write
        #[arg(short, long, default_value = "0.5")]
        probability: f64,

        /// Target file (default: /dev/null)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Validate a JSON plan and summarize it
    CheckPlan {
        /// Path to the plan file
        file: PathBuf,

        /// Print the normalized plan as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Exit { status } => cmd_exit(status),
        Commands::FlakyWrite {
            count,
            probability,
            path,
        } => cmd_flaky_write(count, probability, path),
        Commands::CheckPlan { file, json } => cmd_check_plan(file, json),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(CliError::Start(StartError::Unsupported(reason))) => {
            eprintln!("Skipping: {}", reason);
            std::process::exit(EXIT_UNSUPPORTED);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// The plan from `SYSCHAOS_PLAN`, or `fallback`.
#[cfg(target_os = "linux")]
fn plan_or(config: &HarnessConfig, fallback: PlanBuilder) -> Result<Plan, CliError> {
    match config.load_plan()? {
        Some(plan) => Ok(plan),
        None => Ok(fallback.build()?),
    }
}

#[cfg(not(target_os = "linux"))]
fn linux_only() -> CliError {
    CliError::Start(StartError::Unsupported(
        "the built-in plans target Linux syscall numbers".to_string(),
    ))
}

fn describe(errno: i32) -> String {
    match errno_name(errno) {
        Some(name) => format!("{} ({})", name, errno),
        None => errno.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  exit
// ═══════════════════════════════════════════════════════════════════════

#[cfg(not(target_os = "linux"))]
fn cmd_exit(_status: i32) -> Result<i32, CliError> {
    Err(linux_only())
}

#[cfg(target_os = "linux")]
fn cmd_exit(status: i32) -> Result<i32, CliError> {
    let config = HarnessConfig::from_env()?;
    let expected = config.errno_or(libc::EPERM);
    let plan = plan_or(
        &config,
        PlanBuilder::new().outcome(libc::SYS_exit_group, Outcome::failing(1.0, expected)),
    )?;

    let session = config.start_session(plan)?;
    if let Some(session) = &session {
        session.add_this_thread()?;
    }
    io::stdout().flush()?;

    // SAFETY: exit_group takes one integer and only returns when injection
    // fails it.
    let rc = unsafe { libc::syscall(libc::SYS_exit_group, status as libc::c_long) };
    let observed = io::Error::last_os_error().raw_os_error().unwrap_or(0);

    let Some(session) = session else {
        return Err(CliError::Other(format!(
            "exit_group returned {} with injection disabled",
            rc
        )));
    };
    session.stop()?;

    if rc == -1 && observed == expected {
        println!("exit_group failed with {}", describe(observed));
        Ok(0)
    } else {
        println!(
            "exit_group returned {} with errno {}, expected {}",
            rc,
            describe(observed),
            describe(expected)
        );
        Ok(EXIT_WRONG_ERRNO)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  flaky-write
// ═══════════════════════════════════════════════════════════════════════

#[cfg(target_os = "linux")]
#[derive(Debug, Serialize)]
struct WriteReport {
    attempted: u64,
    written: u64,
    failed: u64,
    /// Failures by errno name.
    errors: BTreeMap<String, u64>,
    injection: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<Stats>,
}

#[cfg(not(target_os = "linux"))]
fn cmd_flaky_write(_count: u64, _probability: f64, _path: Option<PathBuf>) -> Result<i32, CliError> {
    Err(linux_only())
}

#[cfg(target_os = "linux")]
fn cmd_flaky_write(count: u64, probability: f64, path: Option<PathBuf>) -> Result<i32, CliError> {
    let config = HarnessConfig::from_env()?;
    let errno = config.errno_or(libc::EIO);
    let plan = plan_or(
        &config,
        PlanBuilder::new().outcome(
            libc::SYS_write,
            Outcome::failing(probability, errno).with_eligibility(Eligibility::DescriptorNotStd),
        ),
    )?;

    let path = path.unwrap_or_else(|| PathBuf::from("/dev/null"));
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;

    let session = config.start_session(plan)?;
    if let Some(session) = &session {
        session.add_this_thread()?;
    }

    let mut report = WriteReport {
        attempted: count,
        written: 0,
        failed: 0,
        errors: BTreeMap::new(),
        injection: session.is_some(),
        seed: None,
        stats: None,
    };
    for i in 0..count {
        let line = format!("line {}\n", i);
        match file.write(line.as_bytes()) {
            Ok(_) => report.written += 1,
            Err(e) => {
                report.failed += 1;
                let label = e
                    .raw_os_error()
                    .map(describe)
                    .unwrap_or_else(|| e.kind().to_string());
                *report.errors.entry(label).or_default() += 1;
            }
        }
    }

    if let Some(session) = session {
        session.stop()?;
        report.seed = Some(session.seed());
        report.stats = Some(session.stats());
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

// ═══════════════════════════════════════════════════════════════════════
//  check-plan
// ═══════════════════════════════════════════════════════════════════════

fn cmd_check_plan(file: PathBuf, json: bool) -> Result<i32, CliError> {
    let text = fs::read_to_string(&file)?;
    let plan = Plan::from_json(&text).map_err(|e| CliError::Other(e.to_string()))?;

    println!("{}: {}", file.display(), plan);
    for entry in plan.syscall_outcomes() {
        let outcome = &entry.outcome;
        let errors: Vec<_> = outcome.errors.iter().map(|e| describe(e.errno)).collect();
        println!(
            "  syscall {:>3}  fail {:.3}  delay {:.3} (max {}us)  eligibility {}  errors [{}]",
            entry.syscall,
            outcome.fail.p,
            outcome.delay.p,
            outcome.max_delay_usec,
            outcome.eligibility.label(),
            errors.join(", ")
        );
    }
    if json {
        println!("{}", plan.to_json().map_err(|e| CliError::Other(e.to_string()))?);
    }
    Ok(0)
}
