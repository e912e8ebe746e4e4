//! Sandbox construction: mirror a source subtree into a disposable location.
//!
//! The walk is depth-first over the source directory. Directories are recreated
//! owner-only; every other entry goes through a [`FileMirror`]. After a
//! successful [`SandboxBuilder::mirror`] each path under the source has a
//! counterpart under the destination with the same content, and nothing else
//! has been created there.
//!
//! Instrumented files later replace their mirrored entry; see
//! [`crate::instrument::write_instrumented`].

mod strategy;

pub use strategy::{FileMirror, MirrorStrategy};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

/// Mode for directories created inside the sandbox (unix only).
pub const SANDBOX_DIR_MODE: u32 = 0o700;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk {}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to mirror {} with {strategy}", path.display())]
    Mirror {
        path: PathBuf,
        strategy: String,
        #[source]
        source: io::Error,
    },
}

/// Counts of what a mirror pass created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorStats {
    pub dirs: usize,
    pub files: usize,
    pub strategy: String,
}

/// Mirrors directory trees into a sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxBuilder {
    /// Strategy to use instead of probing
    forced: Option<MirrorStrategy>,
}

impl SandboxBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always use `strategy` instead of probing the destination.
    pub fn with_strategy(mut self, strategy: MirrorStrategy) -> Self {
        self.forced = Some(strategy);
        self
    }

    /// Set or clear the forced strategy
    pub fn set_strategy(&mut self, strategy: Option<MirrorStrategy>) {
        self.forced = strategy;
    }

    /// Mirror `src` into `dst`, choosing a strategy first.
    ///
    /// `dst` must not exist yet; its parent directories are created. The probe
    /// runs in the parent of `dst` so no scratch entry ever lands in the mirror.
    #[tracing::instrument(skip_all, fields(src = %src.display(), dst = %dst.display()))]
    pub fn mirror(&self, src: &Path, dst: &Path) -> Result<MirrorStats, SandboxError> {
        let parent = dst.parent().unwrap_or(dst);
        create_dir(parent)?;

        let strategy = self.forced.unwrap_or_else(|| MirrorStrategy::probe(parent));
        tracing::debug!(%strategy, "mirroring source tree");
        self.mirror_with(src, dst, &strategy, strategy.as_str())
    }

    /// Mirror `src` into `dst` with an explicit file mirror.
    pub fn mirror_with(
        &self,
        src: &Path,
        dst: &Path,
        mirror: &dyn FileMirror,
        strategy_name: &str,
    ) -> Result<MirrorStats, SandboxError> {
        let mut stats = MirrorStats {
            dirs: 0,
            files: 0,
            strategy: strategy_name.to_string(),
        };

        for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|source| SandboxError::Walk {
                path: source.path().unwrap_or(src).to_path_buf(),
                source,
            })?;

            // walkdir only yields paths below its root
            let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
            let target = dst.join(rel);

            if entry.file_type().is_dir() {
                create_dir(&target)?;
                stats.dirs += 1;
            } else {
                mirror
                    .mirror_file(entry.path(), &target)
                    .map_err(|source| SandboxError::Mirror {
                        path: entry.path().to_path_buf(),
                        strategy: strategy_name.to_string(),
                        source,
                    })?;
                stats.files += 1;
            }
        }

        tracing::debug!(dirs = stats.dirs, files = stats.files, "mirror complete");
        Ok(stats)
    }
}

/// Replace a mirrored link at `path` with a private copy of its target.
///
/// Returns `false` when `path` is missing or already a regular file. Used for
/// files the test runner may rewrite in place, such as `Cargo.lock`.
pub fn detach(path: &Path) -> Result<bool, SandboxError> {
    let detach_err = |source| SandboxError::Mirror {
        path: path.to_path_buf(),
        strategy: MirrorStrategy::Copy.as_str().to_string(),
        source,
    };

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {}
        Ok(_) => return Ok(false),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(detach_err(err)),
    }

    let content = fs::read(path).map_err(detach_err)?;
    fs::remove_file(path).map_err(detach_err)?;
    fs::write(path, content).map_err(detach_err)?;
    tracing::debug!(path = %path.display(), "detached mirrored file");
    Ok(true)
}

/// Create `path` and its missing parents, owner-only on unix.
pub fn create_dir(path: &Path) -> Result<(), SandboxError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(SANDBOX_DIR_MODE);
    }
    builder.create(path).map_err(|source| SandboxError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}
