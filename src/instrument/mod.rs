//! Source instrumentation for coverage.
//!
//! [`instrument_file`] is a pure `syn::File → syn::File` transform: it numbers
//! every block of every eligible function body as a *region*, prepends a call
//! to a per-file hit function, and appends that function (plus its tables) to
//! the file. [`serialize`] turns the tree back into source with
//! `prettyplease` and re-parses the result, so an instrumented file that would
//! not parse is reported here rather than by the compiler later.
//! [`write_instrumented`] replaces the mirrored sandbox entry without ever
//! writing through it.
//!
//! ## Notes
//! - Comments are not preserved (they are not part of the syntax tree); doc
//!   comments are, as attributes.
//! - Region numbering is pre-order and stable for a given input.
//!
//! ## See also
//! - [`rewrite`]: which functions and blocks become regions
//! - [`runtime`]: the generated hit function and record format

mod rewrite;
mod runtime;

pub use rewrite::{RegionTable, is_test_only};
pub use runtime::runtime_items;

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

/// Name of the generated hit function.
pub const HIT_FN: &str = "__covkit_hit";
/// Name of the generated per-region "already reported" flags.
pub const HITS_STATIC: &str = "__COVKIT_HITS";
/// Name of the generated region → line table.
pub const LINES_STATIC: &str = "__COVKIT_LINES";
/// First field of every coverage record.
pub const RECORD_TAG: &str = "covkit";
/// Sink value meaning "write records to stdout".
pub const STDOUT_SINK: &str = "-";

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("file already defines `{0}`")]
    NameCollision(String),

    #[error("instrumented source does not parse: {0}")]
    Reparse(String),

    #[error("failed to write {}", path.display())]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What the generated runtime needs to know about a file.
#[derive(Debug, Clone)]
pub struct InstrumentContext<'a> {
    /// Package identifier written into records
    pub package: &'a str,
    /// File name relative to the package directory
    pub file: &'a str,
    /// Environment variable naming the coverage sink
    pub sink_var: &'a str,
}

/// An instrumented syntax tree and its regions.
pub struct Instrumented {
    pub syntax: syn::File,
    pub regions: RegionTable,
}

impl std::fmt::Debug for Instrumented {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumented")
            .field("items", &self.syntax.items.len())
            .field("regions", &self.regions)
            .finish()
    }
}

/// Instrument one file.
///
/// Fails if the file already defines one of the generated names.
pub fn instrument_file(mut syntax: syn::File, ctx: &InstrumentContext<'_>) -> Result<Instrumented, InstrumentError> {
    if let Some(name) = defined_generated_name(&syntax.items) {
        return Err(InstrumentError::NameCollision(name.to_string()));
    }

    let mut regions = RegionTable::default();
    rewrite::rewrite_items(&mut syntax.items, 0, &mut regions);

    if !regions.is_empty() {
        syntax
            .items
            .extend(runtime_items(ctx.package, ctx.file, ctx.sink_var, regions.lines()));
    }

    tracing::debug!(file = ctx.file, regions = regions.len(), "instrumented file");
    Ok(Instrumented { syntax, regions })
}

/// Render a syntax tree to source text, checking that the text parses.
pub fn serialize(syntax: &syn::File) -> Result<String, InstrumentError> {
    let text = prettyplease::unparse(syntax);
    syn::parse_file(&text).map_err(|e| InstrumentError::Reparse(e.to_string()))?;
    Ok(text)
}

/// Replace the sandbox entry at `path` with `text`.
///
/// The existing entry (a link to the original or a copy of it) is removed first
/// so the write can never reach the original file.
pub fn write_instrumented(path: &Path, text: &str) -> Result<(), InstrumentError> {
    let write_err = |source| InstrumentError::Write {
        path: path.to_path_buf(),
        source,
    };

    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(write_err(err)),
    }
    fs::write(path, text).map_err(write_err)
}

fn defined_generated_name(items: &[syn::Item]) -> Option<&'static str> {
    [HIT_FN, HITS_STATIC, LINES_STATIC].into_iter().find(|name| {
        items.iter().any(|item| match item {
            syn::Item::Fn(f) => f.sig.ident == name,
            syn::Item::Static(s) => s.ident == name,
            syn::Item::Const(c) => c.ident == name,
            _ => false,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> InstrumentContext<'static> {
        InstrumentContext {
            package: "pkg",
            file: "src/a.rs",
            sink_var: "COVKIT_OUT",
        }
    }

    #[test]
    fn test_instrumented_source_differs_and_parses() {
        let source = "pub fn answer() -> i32 {\n    42\n}\n";
        let syntax = syn::parse_file(source).unwrap();

        let instrumented = instrument_file(syntax, &ctx()).unwrap();
        let text = serialize(&instrumented.syntax).unwrap();

        assert_ne!(text, source);
        assert_eq!(instrumented.regions.len(), 1);
        assert!(text.contains("__covkit_hit(0usize);"));
        assert!(text.contains("fn __covkit_hit(region: usize)"));
        assert!(text.contains("42"));
    }

    #[test]
    fn test_file_without_regions_gets_no_runtime() {
        let syntax = syn::parse_file("pub struct Plain;\nconst fn k() -> u8 { 1 }\n").unwrap();
        let instrumented = instrument_file(syntax, &ctx()).unwrap();
        let text = serialize(&instrumented.syntax).unwrap();
        assert!(instrumented.regions.is_empty());
        assert!(!text.contains(HIT_FN));
    }

    #[test]
    fn test_instrumented_debug_summarizes_tree() {
        let syntax = syn::parse_file("pub fn answer() -> i32 {\n    42\n}\n").unwrap();
        let instrumented = instrument_file(syntax, &ctx()).unwrap();
        insta::assert_snapshot!(format!("{instrumented:?}"), @"Instrumented { items: 4, regions: RegionTable { lines: [1] } }");
    }

    #[test]
    fn test_name_collision_is_rejected() {
        let syntax = syn::parse_file("fn __covkit_hit(_: usize) {}\n").unwrap();
        let err = instrument_file(syntax, &ctx()).unwrap_err();
        assert!(matches!(err, InstrumentError::NameCollision(ref n) if n == HIT_FN));
    }

    #[test]
    fn test_instrumentation_keeps_inner_attributes_and_docs() {
        let source = "#![allow(unused)]\n//! crate docs\n/// Adds.\npub fn add(a: i32, b: i32) -> i32 { a + b }\n";
        let instrumented = instrument_file(syn::parse_file(source).unwrap(), &ctx()).unwrap();
        let text = serialize(&instrumented.syntax).unwrap();
        assert!(text.starts_with("#![allow(unused)]"), "{text}");
        assert!(text.contains("/// Adds."), "{text}");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_instrumented_replaces_link_not_target() {
        let tmp = tempfile::tempdir().unwrap();
        let original = tmp.path().join("orig.rs");
        let mirrored = tmp.path().join("mirror.rs");
        fs::write(&original, "fn a() {}\n").unwrap();
        std::os::unix::fs::symlink(&original, &mirrored).unwrap();

        write_instrumented(&mirrored, "fn b() {}\n").unwrap();

        assert_eq!(fs::read_to_string(&original).unwrap(), "fn a() {}\n");
        assert_eq!(fs::read_to_string(&mirrored).unwrap(), "fn b() {}\n");
        assert!(!fs::symlink_metadata(&mirrored).unwrap().file_type().is_symlink());
    }
}
