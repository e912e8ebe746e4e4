//! File mirroring strategies.
//!
//! A sandbox entry for a regular file is either a symbolic link back to the
//! original (no data is duplicated) or a full content copy. Which one is used is
//! decided once per sandbox by [`MirrorStrategy::probe`], before the walk starts,
//! instead of by recovering from link failures file by file.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

/// Capability to place one file of the source tree into the sandbox.
pub trait FileMirror {
    /// Create `dst` so that reading it yields the content of `src`.
    fn mirror_file(&self, src: &Path, dst: &Path) -> io::Result<()>;
}

/// Built-in mirroring strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStrategy {
    /// Symbolic link pointing at the original file.
    Symlink,
    /// Byte copy of the original file.
    Copy,
}

const PROBE_SOURCE: &str = ".covkit-probe";
const PROBE_LINK: &str = ".covkit-probe-link";

impl MirrorStrategy {
    /// Pick the cheapest strategy that works inside `dir`.
    ///
    /// Creates a scratch file and a link to it in `dir`, then removes both. Any
    /// failure selects [`MirrorStrategy::Copy`].
    pub fn probe(dir: &Path) -> Self {
        let source = dir.join(PROBE_SOURCE);
        let link = dir.join(PROBE_LINK);

        let linked = fs::write(&source, b"").and_then(|()| symlink_file(&source, &link));
        let _ = fs::remove_file(&link);
        let _ = fs::remove_file(&source);

        match linked {
            Ok(()) => MirrorStrategy::Symlink,
            Err(err) => {
                tracing::debug!(dir = %dir.display(), error = %err, "symlinks unavailable, copying files");
                MirrorStrategy::Copy
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorStrategy::Symlink => "symlink",
            MirrorStrategy::Copy => "copy",
        }
    }
}

impl fmt::Display for MirrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FileMirror for MirrorStrategy {
    fn mirror_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        match self {
            MirrorStrategy::Symlink => symlink_file(src, dst),
            MirrorStrategy::Copy => copy_entry(src, dst),
        }
    }
}

/// Copy one non-directory walk entry.
///
/// A link to a directory becomes a copy of that directory. A dangling link is
/// recreated with the same target, so the sandbox still has an entry for it.
fn copy_entry(src: &Path, dst: &Path) -> io::Result<()> {
    if !fs::symlink_metadata(src)?.file_type().is_symlink() {
        return fs::copy(src, dst).map(|_| ());
    }

    match fs::metadata(src) {
        Ok(meta) if meta.is_dir() => copy_linked_dir(src, dst),
        Ok(_) => fs::copy(src, dst).map(|_| ()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let target = fs::read_link(src)?;
            tracing::debug!(path = %src.display(), target = %target.display(), "keeping dangling link");
            symlink_file(&target, dst)
        }
        Err(err) => Err(err),
    }
}

/// Copy the directory behind the link `src`; links inside it go through [`copy_entry`].
fn copy_linked_dir(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copy_entry(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_file(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(windows)]
fn symlink_file(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(src, dst)
}

#[cfg(not(any(unix, windows)))]
fn symlink_file(_src: &Path, _dst: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symbolic links are not supported"))
}
