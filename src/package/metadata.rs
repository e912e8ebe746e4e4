//! Locating packages through `cargo metadata`.
//!
//! Cargo owns package resolution: manifest parsing, workspace membership and
//! target discovery all come from `cargo metadata --no-deps`. This module only
//! runs the command and picks the requested package out of its JSON output.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use thiserror::Error;

use crate::env;

/// Identifier meaning "the package enclosing the working directory".
pub const CURRENT_PACKAGE: &str = ".";

/// Environment variable holding the package search path.
pub const SEARCH_PATH_VAR: &str = "COVKIT_PATH";

/// Target kinds whose sources are compiled into the package itself.
const COMPILED_KINDS: &[&str] = &["lib", "rlib", "dylib", "cdylib", "staticlib", "proc-macro", "bin"];

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("invalid package identifier '{0}'")]
    InvalidId(String),

    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cargo metadata failed ({status}): {stderr}")]
    Cargo { status: String, stderr: String },

    #[error("malformed cargo metadata: {0}")]
    Metadata(String),

    #[error("package '{0}' not found")]
    NotFound(String),
}

impl From<serde_json::Error> for LocateError {
    fn from(err: serde_json::Error) -> Self {
        LocateError::Metadata(err.to_string())
    }
}

/// Where a package lives, as reported by the build tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLocation {
    /// Cargo package name
    pub name: String,
    /// Directory containing the package manifest
    pub manifest_dir: PathBuf,
    /// Root of the enclosing workspace
    pub workspace_root: PathBuf,
    /// Crate root files (`src_path`) of compiled targets, sorted
    pub targets: Vec<PathBuf>,
}

/// Resolve a package identifier to its location.
pub trait PackageLocator {
    fn locate(&self, id: &str, cwd: &Path) -> Result<PackageLocation, LocateError>;
}

/// Which package a metadata document should yield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageQuery<'a> {
    /// Match on package name
    Name(&'a str),
    /// Deepest package whose manifest directory contains this path
    Enclosing(&'a Path),
    /// Package whose manifest directory is exactly this path
    ManifestDir(&'a Path),
}

/// Default locator backed by `cargo metadata`.
#[derive(Debug, Clone)]
pub struct CargoMetadataLocator {
    cargo: OsString,
    search_path: Vec<PathBuf>,
}

impl Default for CargoMetadataLocator {
    fn default() -> Self {
        Self {
            cargo: OsString::from("cargo"),
            search_path: Vec::new(),
        }
    }
}

impl CargoMetadataLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure from an explicit environment: `CARGO` selects the cargo
    /// binary and `COVKIT_PATH` supplies search roots.
    pub fn from_environment(environment: &[String]) -> Self {
        let mut locator = Self::default();
        if let Some(cargo) = env::lookup(environment, "CARGO").filter(|c| !c.is_empty()) {
            locator.cargo = OsString::from(cargo);
        }
        if let Some(path) = env::lookup(environment, SEARCH_PATH_VAR) {
            locator.search_path = env::split_search_path(path);
        }
        locator
    }

    pub fn with_cargo(mut self, cargo: impl Into<OsString>) -> Self {
        self.cargo = cargo.into();
        self
    }

    pub fn with_search_path(mut self, roots: Vec<PathBuf>) -> Self {
        self.search_path = roots;
        self
    }

    /// First `<root>/src/<id>` directory on the search path holding a manifest.
    pub fn search(&self, id: &str) -> Option<PathBuf> {
        self.search_path
            .iter()
            .map(|root| root.join("src").join(id))
            .find(|dir| dir.join("Cargo.toml").is_file())
    }

    fn metadata(&self, dir: &Path) -> Result<Value, LocateError> {
        let program = self.cargo.to_string_lossy().to_string();
        tracing::debug!(%program, dir = %dir.display(), "running cargo metadata");

        let output = Command::new(&self.cargo)
            .args(["metadata", "--no-deps", "--format-version", "1", "--offline"])
            .current_dir(dir)
            .output()
            .map_err(|source| LocateError::Spawn { program, source })?;

        if !output.status.success() {
            return Err(LocateError::Cargo {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

impl PackageLocator for CargoMetadataLocator {
    fn locate(&self, id: &str, cwd: &Path) -> Result<PackageLocation, LocateError> {
        validate_id(id)?;

        if id == CURRENT_PACKAGE {
            let metadata = self.metadata(cwd)?;
            let cwd = canonical(cwd);
            return select_package(&metadata, PackageQuery::Enclosing(&cwd))?
                .ok_or_else(|| LocateError::NotFound(id.to_string()));
        }

        if let Some(dir) = self.search(id) {
            tracing::debug!(dir = %dir.display(), "found package on search path");
            let metadata = self.metadata(&dir)?;
            let dir = canonical(&dir);
            // a mirrored workspace has the workspace manifest at the root, not the package's
            let found = match select_package(&metadata, PackageQuery::ManifestDir(&dir))? {
                Some(location) => Some(location),
                None => select_package(&metadata, PackageQuery::Name(id))?,
            };
            return found.ok_or_else(|| LocateError::NotFound(id.to_string()));
        }

        let metadata = self.metadata(cwd)?;
        select_package(&metadata, PackageQuery::Name(id))?.ok_or_else(|| LocateError::NotFound(id.to_string()))
    }
}

/// Reject identifiers that could escape the sandbox when used as a path.
pub fn validate_id(id: &str) -> Result<(), LocateError> {
    let path = Path::new(id);
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if id.is_empty() || escapes {
        return Err(LocateError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Pick one package out of a `cargo metadata` document.
///
/// Returns `Ok(None)` when the document is well-formed but holds no match.
pub fn select_package(metadata: &Value, query: PackageQuery<'_>) -> Result<Option<PackageLocation>, LocateError> {
    let workspace_root = metadata
        .get("workspace_root")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| LocateError::Metadata("missing workspace_root".to_string()))?;
    let packages = metadata
        .get("packages")
        .and_then(Value::as_array)
        .ok_or_else(|| LocateError::Metadata("missing packages".to_string()))?;

    let mut best: Option<PackageLocation> = None;
    for package in packages {
        let location = parse_package(package, &workspace_root)?;
        let matches = match query {
            PackageQuery::Name(name) => location.name == name,
            PackageQuery::ManifestDir(dir) => canonical(&location.manifest_dir) == dir,
            PackageQuery::Enclosing(path) => path.starts_with(canonical(&location.manifest_dir)),
        };
        if !matches {
            continue;
        }
        let deeper = best
            .as_ref()
            .is_none_or(|b| location.manifest_dir.components().count() > b.manifest_dir.components().count());
        if deeper {
            best = Some(location);
        }
    }
    Ok(best)
}

fn parse_package(package: &Value, workspace_root: &Path) -> Result<PackageLocation, LocateError> {
    let field = |name: &str| {
        package
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| LocateError::Metadata(format!("package without {name}")))
    };
    let name = field("name")?.to_string();
    let manifest_path = PathBuf::from(field("manifest_path")?);
    let manifest_dir = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| LocateError::Metadata(format!("manifest path without parent for {name}")))?;

    let mut targets: Vec<PathBuf> = Vec::new();
    for target in package.get("targets").and_then(Value::as_array).into_iter().flatten() {
        let compiled = target
            .get("kind")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .any(|kind| COMPILED_KINDS.contains(&kind));
        if !compiled {
            continue;
        }
        let Some(root) = target.get("src_path").and_then(Value::as_str).map(PathBuf::from) else {
            continue;
        };
        if !targets.contains(&root) {
            targets.push(root);
        }
    }
    targets.sort();

    Ok(PackageLocation {
        name,
        manifest_dir,
        workspace_root: workspace_root.to_path_buf(),
        targets,
    })
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
