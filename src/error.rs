//! Run-level error taxonomy.
//!
//! Every fatal failure of a coverage run is a [`CoverageError`]. Each variant
//! names the package (and the file or path where one is involved) so the
//! rendered message identifies what failed without further context. Stage
//! modules keep their own narrower error types and are wrapped here as
//! `source`.
//!
//! [`CleanupWarning`] is deliberately not a variant: sandbox removal happens
//! after the run outcome is decided and never changes it.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::instrument::InstrumentError;
use crate::package::LocateError;
use crate::sandbox::SandboxError;

/// Fatal error of a coverage run.
#[derive(Debug, Error, Diagnostic)]
pub enum CoverageError {
    #[error("failed to resolve package ({package})")]
    #[diagnostic(
        code(covkit::resolution),
        help("pass a package name from the current workspace, or `.` for the package in the working directory")
    )]
    Resolution {
        package: String,
        #[source]
        source: LocateError,
    },

    #[error("failed to parse {} in package ({package}): {message}", file.display())]
    #[diagnostic(code(covkit::parse))]
    Parse {
        package: String,
        file: PathBuf,
        message: String,
    },

    #[error("failed to build sandbox for package ({package})")]
    #[diagnostic(code(covkit::sandbox))]
    Sandbox {
        package: String,
        #[source]
        source: SandboxError,
    },

    #[error("failed to instrument package ({package}): {file}")]
    #[diagnostic(code(covkit::instrumentation))]
    Instrumentation {
        package: String,
        file: String,
        #[source]
        source: InstrumentError,
    },

    #[error("test run failed for package ({package}): {reason}")]
    #[diagnostic(code(covkit::execution))]
    Execution { package: String, reason: String },
}

/// Non-fatal failure to remove the temporary root.
#[derive(Debug, Error)]
#[error("failed to delete temporary root ({})", path.display())]
pub struct CleanupWarning {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

pub type CoverageResult<T> = Result<T, CoverageError>;
