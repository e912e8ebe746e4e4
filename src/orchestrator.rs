//! Coverage run orchestration.
//!
//! One [`Orchestrator::run`] call owns one temporary root for its whole
//! lifetime:
//!
//! ```text
//! <root>/src/<package>/...   mirror of the package's workspace (or the package)
//! <root>/target/             CARGO_TARGET_DIR of the test run
//! ```
//!
//! The run moves through [`RunState`]s in order and stops at the first
//! failure. The root is removed on every path; a failed removal is reported as
//! a [`CleanupWarning`] and never changes the outcome.
//!
//! The working directory and the environment are explicit inputs, so a run
//! reads no process-global state besides the filesystem.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tempfile::TempDir;

use crate::env::{self, EnvironmentList};
use crate::error::{CleanupWarning, CoverageError, CoverageResult};
use crate::instrument::{self, InstrumentContext};
use crate::package::{Package, PackageLocator, PackageResolver, ParsedFile, SEARCH_PATH_VAR};
use crate::sandbox::{self, FileMirror, MirrorStrategy, SandboxBuilder, SandboxError};

/// Default environment variable naming the coverage sink.
pub const DEFAULT_SINK_VAR: &str = "COVKIT_OUT";
/// Build output directory of the test runner.
pub const TARGET_DIR_VAR: &str = "CARGO_TARGET_DIR";

const SANDBOX_SRC: &str = "src";
const SANDBOX_TARGET: &str = "target";
const MANIFEST: &str = "Cargo.toml";
const LOCKFILE: &str = "Cargo.lock";
const CUSTOM_MIRROR: &str = "custom";

/// Process exit code of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
}

/// Settings of a coverage run.
#[derive(Debug, Clone)]
pub struct CoverageConfig {
    /// Coverage sink handed to the instrumented tests (`-` = stdout)
    pub sink: String,
    /// Variable the instrumented code reads the sink from
    pub sink_var: String,
    /// Package search path variable prefixed with the sandbox root
    pub search_path_var: String,
    /// Test runner program
    pub runner: String,
    /// Mirror strategy to force instead of probing
    pub mirror: Option<MirrorStrategy>,
    /// Directory to create the temporary root in (system temp dir if unset)
    pub temp_parent: Option<PathBuf>,
    pub temp_prefix: String,
    /// Keep the temporary root instead of deleting it
    pub keep_sandbox: bool,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            sink: instrument::STDOUT_SINK.to_string(),
            sink_var: DEFAULT_SINK_VAR.to_string(),
            search_path_var: SEARCH_PATH_VAR.to_string(),
            runner: "cargo".to_string(),
            mirror: None,
            temp_parent: None,
            temp_prefix: "covkit".to_string(),
            keep_sandbox: false,
        }
    }
}

impl CoverageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl Into<String>) -> Self {
        self.sink = sink.into();
        self
    }

    pub fn with_sink_var(mut self, var: impl Into<String>) -> Self {
        self.sink_var = var.into();
        self
    }

    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = runner.into();
        self
    }

    pub fn with_mirror(mut self, strategy: Option<MirrorStrategy>) -> Self {
        self.mirror = strategy;
        self
    }

    pub fn with_temp_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_parent = Some(dir.into());
        self
    }

    pub fn with_keep_sandbox(mut self, keep: bool) -> Self {
        self.keep_sandbox = keep;
        self
    }
}

/// Stages of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    SandboxCreated,
    Resolved,
    Instrumented,
    Executed,
    Success,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::SandboxCreated => "sandbox-created",
            RunState::Resolved => "resolved",
            RunState::Instrumented => "instrumented",
            RunState::Executed => "executed",
            RunState::Success => "success",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instrumentation result for one member file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub name: String,
    pub regions: usize,
}

/// Outcome of [`Orchestrator::run`].
#[derive(Debug)]
pub struct RunReport {
    /// Package identifier (the package name once `.` is resolved)
    pub package: String,
    /// `Success` or `Failed` once the run has returned
    pub state: RunState,
    /// Last stage completed before the run ended
    pub reached: RunState,
    pub error: Option<CoverageError>,
    pub cleanup: Option<CleanupWarning>,
    pub files: Vec<FileSummary>,
    /// Temporary root left in place by [`CoverageConfig::keep_sandbox`]
    pub sandbox: Option<PathBuf>,
}

impl RunReport {
    fn new(package: &str) -> Self {
        Self {
            package: package.to_string(),
            state: RunState::Init,
            reached: RunState::Init,
            error: None,
            cleanup: None,
            files: Vec::new(),
            sandbox: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Success
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE }
    }

    /// Regions instrumented across all member files.
    pub fn total_regions(&self) -> usize {
        self.files.iter().map(|f| f.regions).sum()
    }

    fn conclude(&mut self, outcome: CoverageResult<()>) {
        match outcome {
            Ok(()) => {
                self.state = RunState::Success;
                tracing::info!(
                    package = %self.package,
                    files = self.files.len(),
                    regions = self.total_regions(),
                    "coverage run succeeded"
                );
            }
            Err(err) => {
                self.state = RunState::Failed;
                tracing::debug!(package = %self.package, reached = %self.reached, error = %err, "coverage run failed");
                self.error = Some(err);
            }
        }
    }
}

/// Drives one coverage run per [`Orchestrator::run`] call.
pub struct Orchestrator<L> {
    config: CoverageConfig,
    locator: L,
    /// Replaces the probed or forced [`MirrorStrategy`] when set
    file_mirror: Option<Box<dyn FileMirror>>,
}

impl<L: PackageLocator> Orchestrator<L> {
    pub fn new(config: CoverageConfig, locator: L) -> Self {
        Self {
            config,
            locator,
            file_mirror: None,
        }
    }

    /// Mirror sandbox files with `mirror` instead of a built-in strategy.
    pub fn with_file_mirror(mut self, mirror: impl FileMirror + 'static) -> Self {
        self.file_mirror = Some(Box::new(mirror));
        self
    }

    /// Run the tests of package `id` against an instrumented sandbox.
    ///
    /// `cwd` resolves `.` and relative lookups; `environment` is the base
    /// environment of the test runner.
    #[tracing::instrument(skip_all, fields(package = %id))]
    pub fn run(&self, id: &str, cwd: &Path, environment: EnvironmentList) -> RunReport {
        let mut report = RunReport::new(id);

        let root = match self.create_root(id) {
            Ok(root) => root,
            Err(err) => {
                report.conclude(Err(err));
                return report;
            }
        };
        report.reached = RunState::SandboxCreated;

        let outcome = self.pipeline(id, cwd, environment, root.path(), &mut report);
        report.conclude(outcome);
        self.release(root, &mut report);
        report
    }

    fn create_root(&self, id: &str) -> CoverageResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(&self.config.temp_prefix);

        let root = match &self.config.temp_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|source| sandbox_error(id, SandboxError::CreateDir {
            path: self.config.temp_parent.clone().unwrap_or_else(std::env::temp_dir),
            source,
        }))?;

        sandbox::create_dir(&root.path().join(SANDBOX_SRC)).map_err(|e| sandbox_error(id, e))?;
        tracing::debug!(root = %root.path().display(), "created temporary root");
        Ok(root)
    }

    fn pipeline(
        &self,
        id: &str,
        cwd: &Path,
        environment: EnvironmentList,
        root: &Path,
        report: &mut RunReport,
    ) -> CoverageResult<()> {
        let (package, parsed) = PackageResolver::new(&self.locator).resolve(id, cwd)?;
        report.package = package.id.clone();
        report.reached = RunState::Resolved;

        let mirror = root.join(SANDBOX_SRC).join(&package.id);
        let mut builder = SandboxBuilder::new();
        builder.set_strategy(self.config.mirror);
        let mirrored = match &self.file_mirror {
            Some(file_mirror) => builder.mirror_with(&package.mirror_root, &mirror, file_mirror.as_ref(), CUSTOM_MIRROR),
            None => builder.mirror(&package.mirror_root, &mirror),
        };
        mirrored.map_err(|e| sandbox_error(&package.id, e))?;
        sandbox::detach(&mirror.join(LOCKFILE)).map_err(|e| sandbox_error(&package.id, e))?;

        let package_dir = mirror.join(&package.dir_in_mirror);
        report.files = self.instrument(&package, parsed, &package_dir)?;
        report.reached = RunState::Instrumented;

        let environment = child_environment(&self.config, environment, root).map_err(|reason| {
            CoverageError::Execution {
                package: package.id.clone(),
                reason,
            }
        })?;
        self.execute(&package, &package_dir, &environment)?;
        report.reached = RunState::Executed;
        Ok(())
    }

    /// Instrument every parsed member and overwrite its sandbox entry.
    fn instrument(&self, package: &Package, parsed: Vec<ParsedFile>, dir: &Path) -> CoverageResult<Vec<FileSummary>> {
        let mut summaries = Vec::with_capacity(parsed.len());

        for ParsedFile { name, syntax } in parsed {
            let fail = |source| CoverageError::Instrumentation {
                package: package.id.clone(),
                file: name.clone(),
                source,
            };
            let ctx = InstrumentContext {
                package: &package.id,
                file: &name,
                sink_var: &self.config.sink_var,
            };

            let instrumented = instrument::instrument_file(syntax, &ctx).map_err(fail)?;
            let text = instrument::serialize(&instrumented.syntax).map_err(fail)?;
            instrument::write_instrumented(&dir.join(&name), &text).map_err(fail)?;

            summaries.push(FileSummary {
                regions: instrumented.regions.len(),
                name,
            });
        }

        tracing::info!(files = summaries.len(), "instrumented package");
        Ok(summaries)
    }

    fn execute(&self, package: &Package, dir: &Path, environment: &[String]) -> CoverageResult<()> {
        let runner = &self.config.runner;
        let manifest = dir.join(MANIFEST);
        let fail = |reason| CoverageError::Execution {
            package: package.id.clone(),
            reason,
        };

        let mut command = Command::new(runner);
        command
            .arg("test")
            .arg("--manifest-path")
            .arg(&manifest)
            .arg("--package")
            .arg(&package.name)
            .current_dir(dir)
            .env_clear()
            .envs(env::entries(environment))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        tracing::info!(%runner, manifest = %manifest.display(), "running tests");
        let status = command
            .status()
            .map_err(|e| fail(format!("failed to run {runner}: {e}")))?;

        if !status.success() {
            return Err(fail(match status.code() {
                Some(code) => format!("{runner} exited with status {code}"),
                None => format!("{runner} was terminated by a signal"),
            }));
        }
        Ok(())
    }

    fn release(&self, root: TempDir, report: &mut RunReport) {
        if self.config.keep_sandbox {
            let path = root.keep();
            tracing::info!(sandbox = %path.display(), "keeping temporary root");
            report.sandbox = Some(path);
            return;
        }

        let path = root.path().to_path_buf();
        if let Err(source) = root.close() {
            let warning = CleanupWarning { path, source };
            tracing::warn!(error = %warning, "cleanup failed");
            report.cleanup = Some(warning);
        }
    }
}

/// Environment of the test runner: the sink, a private target directory and
/// the search path with `root` in front.
pub fn child_environment(
    config: &CoverageConfig,
    base: EnvironmentList,
    root: &Path,
) -> Result<EnvironmentList, String> {
    let target_dir = root.join(SANDBOX_TARGET);
    let target_dir = target_dir
        .to_str()
        .ok_or_else(|| format!("non-UTF-8 sandbox path {}", target_dir.display()))?
        .to_string();

    let existing = env::lookup(&base, &config.search_path_var).map(OsStr::new);
    let search_path = env::prepend_search_path(root, existing)
        .map_err(|e| e.to_string())?
        .into_string()
        .map_err(|value| format!("non-UTF-8 search path {}", value.to_string_lossy()))?;

    let environment = env::putenv(base, &config.sink_var, &config.sink);
    let environment = env::putenv(environment, TARGET_DIR_VAR, &target_dir);
    Ok(env::putenv(environment, &config.search_path_var, &search_path))
}

fn sandbox_error(package: &str, source: SandboxError) -> CoverageError {
    CoverageError::Sandbox {
        package: package.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::fs;

    use walkdir::WalkDir;

    use crate::package::{LocateError, PackageLocation};

    struct StaticLocator(PackageLocation);

    impl PackageLocator for StaticLocator {
        fn locate(&self, id: &str, _cwd: &Path) -> Result<PackageLocation, LocateError> {
            if id == self.0.name {
                Ok(self.0.clone())
            } else {
                Err(LocateError::NotFound(id.to_string()))
            }
        }
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        location: PackageLocation,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let dir = tmp.path().join("pkg");
            write(&dir.join("Cargo.toml"), "[package]\nname = \"pkg\"\n\n[workspace]\n");
            write(&dir.join("Cargo.lock"), "version = 3\n");
            write(&dir.join("src/lib.rs"), "pub mod util;\npub fn answer() -> i32 {\n    42\n}\n");
            write(&dir.join("src/util.rs"), "pub fn double(x: i32) -> i32 { x * 2 }\n");
            write(&dir.join("README.md"), "pkg\n");
            write(&dir.join("assets/data.txt"), "data\n");
            fs::create_dir_all(tmp.path().join("tmp")).unwrap();

            let location = PackageLocation {
                name: "pkg".to_string(),
                manifest_dir: dir.clone(),
                workspace_root: dir.clone(),
                targets: vec![dir.join("src/lib.rs")],
            };
            Self { tmp, location }
        }

        fn dir(&self) -> &Path {
            &self.location.manifest_dir
        }

        fn temp_parent(&self) -> PathBuf {
            self.tmp.path().join("tmp")
        }

        fn config(&self) -> CoverageConfig {
            CoverageConfig::new().with_temp_parent(self.temp_parent())
        }

        fn run(&self, id: &str, config: CoverageConfig) -> RunReport {
            let orchestrator = Orchestrator::new(config, StaticLocator(self.location.clone()));
            orchestrator.run(id, self.dir(), env::environ_list(std::env::vars_os()))
        }

        fn temp_parent_is_empty(&self) -> bool {
            fs::read_dir(self.temp_parent()).unwrap().next().is_none()
        }
    }

    fn contents(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| !e.file_type().is_dir())
            .map(|e| (e.path().strip_prefix(root).unwrap().to_path_buf(), fs::read(e.path()).unwrap()))
            .collect()
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_run_rewrites_members_and_mirrors_the_rest() {
        let fixture = Fixture::new();
        let before = contents(fixture.dir());

        let report = fixture.run("pkg", fixture.config().with_runner("true").with_keep_sandbox(true));

        assert!(report.error.is_none(), "{:?}", report.error);
        assert_eq!(report.state, RunState::Success);
        assert_eq!(report.reached, RunState::Executed);
        assert_eq!(report.exit_code(), ExitCode::SUCCESS);
        let names: Vec<_> = report.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["src/lib.rs", "src/util.rs"]);
        assert_eq!(report.total_regions(), 2);

        let root = report.sandbox.clone().unwrap();
        let mirrored = root.join("src/pkg");
        let after = contents(&mirrored);
        assert_eq!(after.len(), before.len());
        for (name, original) in &before {
            let copy = &after[name];
            if name.starts_with("src") {
                assert_ne!(copy, original, "{} was not rewritten", name.display());
                syn::parse_file(std::str::from_utf8(copy).unwrap()).unwrap();
                assert!(!fs::symlink_metadata(mirrored.join(name)).unwrap().file_type().is_symlink());
            } else {
                assert_eq!(copy, original, "{} differs", name.display());
            }
        }
        assert!(!fs::symlink_metadata(mirrored.join("Cargo.lock")).unwrap().file_type().is_symlink());

        assert_eq!(before, contents(fixture.dir()));
        fs::remove_dir_all(root).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tests_report_execution_error_and_clean_up() {
        let fixture = Fixture::new();

        let report = fixture.run("pkg", fixture.config().with_runner("false"));

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.reached, RunState::Instrumented);
        assert_eq!(report.exit_code(), ExitCode::FAILURE);
        match report.error {
            Some(CoverageError::Execution { ref package, ref reason }) => {
                assert_eq!(package, "pkg");
                assert!(reason.contains("status 1"), "{reason}");
            }
            ref other => panic!("expected execution error, got {other:?}"),
        }
        assert!(report.cleanup.is_none());
        assert!(fixture.temp_parent_is_empty());
    }

    #[test]
    fn test_missing_runner_is_execution_error() {
        let fixture = Fixture::new();

        let report = fixture.run("pkg", fixture.config().with_runner("covkit-no-such-runner"));

        match report.error {
            Some(CoverageError::Execution { ref reason, .. }) => assert!(reason.starts_with("failed to run")),
            ref other => panic!("expected execution error, got {other:?}"),
        }
        assert!(fixture.temp_parent_is_empty());
    }

    #[test]
    fn test_nonexistent_package_leaves_no_temporary_root() {
        let fixture = Fixture::new();

        let report = fixture.run("nope", fixture.config());

        assert_eq!(report.reached, RunState::SandboxCreated);
        assert!(matches!(
            report.error,
            Some(CoverageError::Resolution { ref package, .. }) if package == "nope"
        ));
        assert!(fixture.temp_parent_is_empty());
    }

    #[test]
    fn test_escaping_identifier_is_rejected() {
        let fixture = Fixture::new();
        let report = fixture.run("../pkg", fixture.config());
        assert!(matches!(
            report.error,
            Some(CoverageError::Resolution { source: LocateError::InvalidId(_), .. })
        ));
    }

    /// Copies files, except the one ending in the given path.
    struct FailOn(&'static str);

    impl FileMirror for FailOn {
        fn mirror_file(&self, src: &Path, dst: &Path) -> std::io::Result<()> {
            if src.ends_with(self.0) {
                return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "simulated"));
            }
            MirrorStrategy::Copy.mirror_file(src, dst)
        }
    }

    #[test]
    fn test_sandbox_failure_removes_temporary_root() {
        let fixture = Fixture::new();
        let before = contents(fixture.dir());

        let orchestrator =
            Orchestrator::new(fixture.config(), StaticLocator(fixture.location.clone())).with_file_mirror(FailOn("assets/data.txt"));
        let report = orchestrator.run("pkg", fixture.dir(), Vec::new());

        match report.error {
            Some(CoverageError::Sandbox { ref package, ref source }) => {
                assert_eq!(package, "pkg");
                match source {
                    SandboxError::Mirror { path, strategy, .. } => {
                        assert!(path.ends_with("assets/data.txt"), "{}", path.display());
                        assert_eq!(strategy, CUSTOM_MIRROR);
                    }
                    other => panic!("expected mirror error, got {other:?}"),
                }
            }
            ref other => panic!("expected sandbox error, got {other:?}"),
        }
        assert_eq!(report.reached, RunState::Resolved);
        assert!(fixture.temp_parent_is_empty());
        assert_eq!(before, contents(fixture.dir()));
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_run_mirrors_directory_and_dangling_links() {
        let fixture = Fixture::new();
        std::os::unix::fs::symlink("../assets", fixture.dir().join("src/assets")).unwrap();
        std::os::unix::fs::symlink(fixture.dir().join("gone"), fixture.dir().join("assets/dangling")).unwrap();

        let config = fixture.config().with_runner("true").with_keep_sandbox(true).with_mirror(Some(MirrorStrategy::Copy));
        let report = fixture.run("pkg", config);

        assert!(report.error.is_none(), "{:?}", report.error);
        let mirrored = report.sandbox.clone().unwrap().join("src/pkg");
        assert_eq!(fs::read_to_string(mirrored.join("src/assets/data.txt")).unwrap(), "data\n");
        assert!(fs::symlink_metadata(mirrored.join("assets/dangling")).unwrap().file_type().is_symlink());
        fs::remove_dir_all(report.sandbox.unwrap()).unwrap();
    }

    #[test]
    fn test_missing_temp_parent_is_sandbox_error() {
        let fixture = Fixture::new();
        let config = CoverageConfig::new().with_temp_parent(fixture.tmp.path().join("no-such-dir"));

        let report = fixture.run("pkg", config);

        assert_eq!(report.reached, RunState::Init);
        assert!(matches!(report.error, Some(CoverageError::Sandbox { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_environment_sets_sink_target_dir_and_search_path() {
        let base: EnvironmentList = ["PATH=/bin", "CARGO_TARGET_DIR=/old", "COVKIT_PATH=/a", "HOME=/h"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let environment = child_environment(&CoverageConfig::new(), base, Path::new("/sb")).unwrap();

        insta::assert_debug_snapshot!(environment, @r#"
        [
            "PATH=/bin",
            "CARGO_TARGET_DIR=/sb/target",
            "COVKIT_PATH=/sb:/a",
            "HOME=/h",
            "COVKIT_OUT=-",
        ]
        "#);
    }

    #[test]
    fn test_child_environment_without_search_path_uses_root_alone() {
        let config = CoverageConfig::new().with_sink("/tmp/out.cov").with_sink_var("COV");

        let environment = child_environment(&config, Vec::new(), Path::new("/sb")).unwrap();

        assert_eq!(env::lookup(&environment, "COV"), Some("/tmp/out.cov"));
        assert_eq!(env::lookup(&environment, SEARCH_PATH_VAR), Some("/sb"));
        assert_eq!(environment.len(), 3);
    }
}
