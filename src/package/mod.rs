//! Package resolution: identifier → directory, member files, parsed syntax trees.
//!
//! Locating a package is delegated to a [`PackageLocator`] (by default
//! `cargo metadata`). This module turns the location into a [`Package`] with
//! its sorted member file list and parses every member with `syn`. Members
//! are the module trees of the package's compiled targets (see [`modules`]).
//!
//! The member list is the authoritative filter. Files discovered on disk are
//! offered to [`Package::is_member`], which answers by binary search over the
//! sorted list; anything it rejects is mirrored into the sandbox later but
//! never parsed or rewritten.

mod metadata;
pub mod modules;

pub use metadata::{
    CURRENT_PACKAGE, CargoMetadataLocator, LocateError, PackageLocation, PackageLocator, PackageQuery,
    SEARCH_PATH_VAR, select_package, validate_id,
};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CoverageError, CoverageResult};

use self::modules::{ModuleError, SourceFile, collect_modules};

/// A resolved package.
#[derive(Debug, Clone)]
pub struct Package {
    /// Identifier used to reach the package (`.` is replaced by the name)
    pub id: String,
    /// Cargo package name
    pub name: String,
    /// Absolute manifest directory
    pub dir: PathBuf,
    /// Directory mirrored into the sandbox (workspace root or `dir`)
    pub mirror_root: PathBuf,
    /// `dir` relative to `mirror_root`
    pub dir_in_mirror: PathBuf,
    /// Member files relative to `dir`, `/`-separated, sorted and deduplicated
    pub files: Vec<String>,
    /// Position accounting for member files
    pub source_map: SourceMap,
}

impl Package {
    /// Whether `name` (relative to the package directory) is a member file.
    pub fn is_member(&self, name: &str) -> bool {
        self.files.binary_search_by(|entry| entry.as_str().cmp(name)).is_ok()
    }
}

/// One parsed member file.
pub struct ParsedFile {
    /// Path relative to the package directory
    pub name: String,
    pub syntax: syn::File,
}

impl std::fmt::Debug for ParsedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedFile")
            .field("name", &self.name)
            .field("items", &self.syntax.items.len())
            .finish()
    }
}

/// Source file bookkeeping shared by resolution and reporting.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    files: BTreeMap<String, SourceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub path: PathBuf,
    pub lines: usize,
}

impl SourceMap {
    pub fn add(&mut self, name: &str, path: PathBuf, text: &str) {
        let lines = text.lines().count();
        self.files.insert(name.to_string(), SourceEntry { path, lines });
    }

    pub fn get(&self, name: &str) -> Option<&SourceEntry> {
        self.files.get(name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total lines across all files.
    pub fn total_lines(&self) -> usize {
        self.files.values().map(|e| e.lines).sum()
    }
}

/// Resolves and parses packages.
pub struct PackageResolver<'a> {
    locator: &'a dyn PackageLocator,
}

impl<'a> PackageResolver<'a> {
    pub fn new(locator: &'a dyn PackageLocator) -> Self {
        Self { locator }
    }

    /// Resolve `id` relative to `cwd` and parse every member file.
    ///
    /// Any parse failure aborts resolution; partially parsed files are dropped.
    #[tracing::instrument(skip_all, fields(package = %id))]
    pub fn resolve(&self, id: &str, cwd: &Path) -> CoverageResult<(Package, Vec<ParsedFile>)> {
        let resolution = |source| CoverageError::Resolution {
            package: id.to_string(),
            source,
        };
        validate_id(id).map_err(resolution)?;
        let location = self.locator.locate(id, cwd).map_err(resolution)?;
        let targets = location.targets.clone();

        let mut package = package_from_location(id, location);
        let modules = collect_modules(&package.dir, &targets).map_err(|e| module_error(&package, e))?;
        package.files = modules.keys().cloned().collect();
        let parsed = parse_members(&mut package, modules)?;

        tracing::info!(
            package = %package.id,
            files = parsed.len(),
            lines = package.source_map.total_lines(),
            "resolved package"
        );
        Ok((package, parsed))
    }
}

/// Package for `location`, with an empty member list.
fn package_from_location(id: &str, location: PackageLocation) -> Package {
    let id = if id == CURRENT_PACKAGE { location.name.clone() } else { id.to_string() };

    let (mirror_root, dir_in_mirror) = match location.manifest_dir.strip_prefix(&location.workspace_root) {
        Ok(rel) => (location.workspace_root.clone(), rel.to_path_buf()),
        Err(_) => (location.manifest_dir.clone(), PathBuf::new()),
    };

    Package {
        id,
        name: location.name,
        dir: location.manifest_dir,
        mirror_root,
        dir_in_mirror,
        files: Vec::new(),
        source_map: SourceMap::default(),
    }
}

/// Offer every file next to a member to the member filter and keep the parsed
/// trees of the accepted ones.
fn parse_members(package: &mut Package, mut modules: BTreeMap<String, SourceFile>) -> CoverageResult<Vec<ParsedFile>> {
    let mut parsed = Vec::with_capacity(package.files.len());
    let mut offered = Vec::new();

    for name in &package.files {
        if let Some(parent) = Path::new(name).parent() {
            let dir = package.dir.join(parent);
            if !offered.contains(&dir) {
                offered.push(dir);
            }
        }
    }

    let mut candidates = Vec::new();
    for dir in &offered {
        let entries = fs::read_dir(dir).map_err(|e| parse_error(package, dir, e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| parse_error(package, dir, e.to_string()))?;
            candidates.push(entry.path());
        }
    }
    candidates.sort();

    for path in candidates {
        let Some(name) = relative_name(&package.dir, &path) else {
            continue;
        };
        if !package.is_member(&name) {
            tracing::trace!(file = %name, "skipping non-member file");
            continue;
        }
        let Some(SourceFile { path, text, syntax }) = modules.remove(&name) else {
            continue;
        };

        package.source_map.add(&name, path, &text);
        parsed.push(ParsedFile { name, syntax });
    }

    Ok(parsed)
}

fn module_error(package: &Package, error: ModuleError) -> CoverageError {
    parse_error(package, &error.path, error.message)
}

fn parse_error(package: &Package, file: &Path, message: String) -> CoverageError {
    CoverageError::Parse {
        package: package.id.clone(),
        file: file.to_path_buf(),
        message,
    }
}

/// `path` relative to `dir` with `/` separators.
fn relative_name(dir: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(dir).ok()?;
    let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
    Some(parts.join("/"))
}
