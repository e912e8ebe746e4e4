#![forbid(unsafe_code)]
//! covkit: statement-level coverage for Cargo packages by source rewriting.
//!
//! A run resolves a package, mirrors its workspace into a temporary sandbox,
//! rewrites every member source file so that each block reports its first
//! execution, and runs the package's tests against the sandbox. The original
//! sources are never modified.
//!
//! ## Panic Policy
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` / `map_err`. The `cli` module enforces
//!   `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.
//!
//! - **Generated code**: The instrumenter emits runtime items into user crates; they never panic on a failing
//!   coverage sink and drop the record instead.

pub mod cli;
pub mod env;
pub mod error;
pub mod instrument;
pub mod orchestrator;
pub mod package;
pub mod sandbox;

pub use env::{EnvironmentList, putenv};
pub use error::{CleanupWarning, CoverageError, CoverageResult};
pub use instrument::{InstrumentContext, Instrumented, instrument_file};
pub use orchestrator::{CoverageConfig, ExitCode, Orchestrator, RunReport, RunState};
pub use package::{CargoMetadataLocator, Package, PackageLocator, PackageResolver};
pub use sandbox::{FileMirror, MirrorStrategy, SandboxBuilder};
