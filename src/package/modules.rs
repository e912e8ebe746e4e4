//! Module tree discovery.
//!
//! Members are the files rustc loads for a target through `mod name;`
//! declarations, starting at each target's crate root. Files pulled in with
//! `include!` are never reached this way: they are part of the including
//! module and get no instrumentation of their own.
//!
//! Lookup follows rustc's rules:
//!
//! ```text
//! crate root, mod.rs, #[path] file   children next to the file
//! other foo.rs                       children in foo/
//! inline `mod a { mod b; }`          b under the inline module's directory
//! ```
//!
//! Declarations whose `cfg` only holds in test builds are not followed (see
//! [`crate::instrument::is_test_only`]).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use syn::ext::IdentExt;
use syn::{Attribute, Expr, ExprLit, Item, Lit, Meta};

use crate::instrument::is_test_only;

/// A member file reached through the module tree.
#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub text: String,
    pub syntax: syn::File,
}

/// Failure to read or parse a file of the module tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleError {
    pub path: PathBuf,
    pub message: String,
}

/// Where a module file was found; decides where its children live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    /// Crate root, `mod.rs` or a `#[path]` file: children sit next to it
    Directory,
    /// `foo.rs`: children sit in `foo/`
    File,
}

/// Parse every file of the module trees rooted at `targets`, keyed by path
/// relative to `dir`.
///
/// Files outside `dir` are not part of the package and are neither read nor
/// followed. A declared module with no file on disk is skipped.
pub fn collect_modules(dir: &Path, targets: &[PathBuf]) -> Result<BTreeMap<String, SourceFile>, ModuleError> {
    let mut files = BTreeMap::new();
    let mut pending: Vec<(PathBuf, Ownership)> =
        targets.iter().rev().map(|target| (normalize(target), Ownership::Directory)).collect();

    while let Some((path, ownership)) = pending.pop() {
        let Some(name) = super::relative_name(dir, &path) else {
            tracing::debug!(file = %path.display(), "module outside package directory");
            continue;
        };
        if files.contains_key(&name) {
            continue;
        }

        let text = fs::read_to_string(&path).map_err(|e| ModuleError {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let syntax = syn::parse_file(&text).map_err(|e| {
            let at = e.span().start();
            ModuleError {
                path: path.clone(),
                message: format!("{}:{}: {}", at.line, at.column + 1, e),
            }
        })?;

        let file_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let children_dir = match (ownership, path.file_stem()) {
            (Ownership::File, Some(stem)) => file_dir.join(stem),
            _ => file_dir.clone(),
        };
        let mut declared = Vec::new();
        declared_modules(&syntax.items, &file_dir, &children_dir, false, &mut declared);
        // keep discovery order stable: first declaration first
        pending.extend(declared.into_iter().rev());

        tracing::trace!(file = %name, "module file");
        files.insert(name, SourceFile { path, text, syntax });
    }

    Ok(files)
}

/// Push the files of `mod name;` declarations in `items`.
///
/// `file_dir` is the directory of the declaring file, `dir` the directory for
/// children at this nesting level. `nested` is set inside inline modules.
fn declared_modules(items: &[Item], file_dir: &Path, dir: &Path, nested: bool, out: &mut Vec<(PathBuf, Ownership)>) {
    for item in items {
        let Item::Mod(module) = item else {
            continue;
        };
        if is_test_only(&module.attrs) {
            continue;
        }
        let name = module.ident.unraw().to_string();
        let path_attr = path_attribute(&module.attrs);

        match &module.content {
            Some((_, content)) => {
                let inner = dir.join(path_attr.unwrap_or(name));
                declared_modules(content, file_dir, &inner, true, out);
            }
            None => {
                let found = match path_attr {
                    Some(rel) => {
                        let base = if nested { dir } else { file_dir };
                        Some((normalize(&base.join(rel)), Ownership::Directory)).filter(|(p, _)| p.is_file())
                    }
                    None => {
                        let flat = dir.join(format!("{name}.rs"));
                        let owned = dir.join(&name).join("mod.rs");
                        if flat.is_file() {
                            Some((flat, Ownership::File))
                        } else if owned.is_file() {
                            Some((owned, Ownership::Directory))
                        } else {
                            None
                        }
                    }
                };
                match found {
                    Some(entry) => out.push(entry),
                    None => tracing::debug!(module = %name, dir = %dir.display(), "no file for module"),
                }
            }
        }
    }
}

/// Value of `#[path = "..."]`.
fn path_attribute(attrs: &[Attribute]) -> Option<String> {
    attrs.iter().find_map(|attr| match &attr.meta {
        Meta::NameValue(nv) if nv.path.is_ident("path") => match &nv.value {
            Expr::Lit(ExprLit { lit: Lit::Str(s), .. }) => Some(s.value()),
            _ => None,
        },
        _ => None,
    })
}

/// Remove `.` and resolve `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
