//! CLI module for covkit
//!
//! `covkit [PACKAGE] [--sink <SINK>] [--runner <PROGRAM>] [--copy] [--keep]`
//!
//! ## Design
//!
//! The CLI uses clap for argument parsing with derive macros; usage errors
//! exit with clap's status 2. `execute` returns `CliResult<ExitCode>` instead
//! of calling `process::exit`. Only the top-level `run()` function handles
//! errors and exits.

// Enforce explicit error handling - no panicking in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::env;
use std::fmt;
use std::path::Path;
use std::process;

use clap::Parser;

use crate::env::{EnvironmentList, environ_list};
use crate::orchestrator::{CoverageConfig, DEFAULT_SINK_VAR, Orchestrator};
use crate::package::{CURRENT_PACKAGE, CargoMetadataLocator};
use crate::sandbox::MirrorStrategy;

pub use crate::orchestrator::ExitCode;

// ============================================================================
// CLI Error handling
// ============================================================================

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already rendered for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Clap CLI definition
// ============================================================================

/// Run a package's tests against an instrumented copy of its sources
#[derive(Parser, Debug)]
#[command(name = "covkit")]
#[command(version = VERSION)]
#[command(about = "Run a package's tests against an instrumented copy of its sources", long_about = None)]
pub struct Cli {
    /// Package to test (`.` is the package in the working directory)
    #[arg(value_name = "PACKAGE", default_value = CURRENT_PACKAGE)]
    pub package: String,

    /// Where instrumented tests write coverage records (`-` for stdout)
    #[arg(long, value_name = "SINK", default_value = "-")]
    pub sink: String,

    /// Variable the sink is passed in
    #[arg(long = "sink-var", value_name = "NAME", default_value = DEFAULT_SINK_VAR)]
    pub sink_var: String,

    /// Test runner program
    #[arg(long, value_name = "PROGRAM", default_value = "cargo")]
    pub runner: String,

    /// Copy files into the sandbox instead of linking them
    #[arg(long)]
    pub copy: bool,

    /// Keep the sandbox and print its location
    #[arg(long)]
    pub keep: bool,
}

impl Cli {
    /// Run configuration described by the flags.
    pub fn config(&self) -> CoverageConfig {
        let mirror = self.copy.then_some(MirrorStrategy::Copy);
        CoverageConfig::new()
            .with_sink(&self.sink)
            .with_sink_var(&self.sink_var)
            .with_runner(&self.runner)
            .with_mirror(mirror)
            .with_keep_sandbox(self.keep)
    }
}

// ============================================================================
// CLI entry point
// ============================================================================

/// Main CLI entry point.
///
/// This is the only place where `process::exit` is called.
pub fn run() {
    let cli = Cli::parse();

    let outcome = env::current_dir()
        .map_err(|e| CliError::failure(format!("cannot determine working directory: {e}")))
        .and_then(|cwd| execute(cli, &cwd, environ_list(env::vars_os())));

    match outcome {
        Ok(exit_code) => {
            if exit_code != ExitCode::SUCCESS {
                process::exit(exit_code.0);
            }
        }
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("{}", e.message);
            }
            process::exit(e.exit_code.0);
        }
    }
}

/// Execute one coverage run with an explicit working directory and environment.
pub fn execute(cli: Cli, cwd: &Path, environment: EnvironmentList) -> CliResult<ExitCode> {
    let locator = CargoMetadataLocator::from_environment(&environment);
    let orchestrator = Orchestrator::new(cli.config(), locator);

    let mut report = orchestrator.run(&cli.package, cwd, environment);

    if let Some(warning) = &report.cleanup {
        eprintln!("warning: {warning}");
    }
    if let Some(sandbox) = &report.sandbox {
        eprintln!("sandbox kept at {}", sandbox.display());
    }
    match report.error.take() {
        Some(err) => Err(CliError::new(
            format!("{:?}", miette::Report::new(err)),
            report.exit_code(),
        )),
        None => Ok(report.exit_code()),
    }
}

// ============================================================================
// Tests
// ============================================================================
