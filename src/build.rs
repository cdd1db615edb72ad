//! Configuring and building the generated test project.
//!
//! A build is three subprocesses run in the project file's directory:
//! `qmake <project> <flags>`, `make clean`, `make <flags>`. The first
//! non-zero exit stops the sequence.

use crate::config::ToolchainConfig;
use crate::error::{QtcovError, Result};
use crate::process::{CommandRunner, CommandSpec, ProcessOutput};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Result of a build or of a test run.
///
/// For builds `passed`/`failed` stay zero and `step` names the step that
/// failed. For test runs they carry the parsed totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationResult {
    pub success: bool,
    pub passed: u32,
    pub failed: u32,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub duration_ms: u64,
}

impl CompilationResult {
    /// Number of test functions that ran.
    pub fn executed(&self) -> u32 {
        self.passed + self.failed
    }
}

/// One step of the build sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    Configure,
    Clean,
    Build,
}

impl BuildStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStep::Configure => "configure",
            BuildStep::Clean => "clean",
            BuildStep::Build => "build",
        }
    }
}

/// gcc flags that make a build emit `.gcno`/`.gcda` data.
pub const COVERAGE_FLAGS: [&str; 2] = ["-fprofile-arcs", "-ftest-coverage"];

/// Coverage flags found neither in the project file nor in the qmake
/// arguments. `--coverage` stands for both.
///
/// # Errors
///
/// [`QtcovError::NotFound`] when the project file is missing.
pub fn missing_coverage_flags(
    project_file: &Path,
    toolchain: &ToolchainConfig,
) -> Result<Vec<&'static str>> {
    let content = std::fs::read_to_string(project_file).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => QtcovError::NotFound {
            path: project_file.to_path_buf(),
        },
        _ => QtcovError::Io(e),
    })?;
    let text = format!("{}\n{}", content, toolchain.extra_flags.join(" "));
    if text.contains("--coverage") {
        return Ok(Vec::new());
    }
    Ok(COVERAGE_FLAGS
        .into_iter()
        .filter(|flag| !text.contains(flag))
        .collect())
}

/// Runs the qmake/make sequence.
pub struct BuildRunner {
    runner: Arc<dyn CommandRunner>,
}

impl BuildRunner {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn step_command(
        step: BuildStep,
        project_file: &Path,
        cwd: &Path,
        toolchain: &ToolchainConfig,
    ) -> CommandSpec {
        let timeout = toolchain.timeout();
        match step {
            BuildStep::Configure => {
                let project_arg = project_file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| project_file.display().to_string());
                CommandSpec::new(&toolchain.qmake, cwd, timeout)
                    .arg(project_arg)
                    .args(toolchain.extra_flags.iter().cloned())
            }
            BuildStep::Clean => CommandSpec::new(&toolchain.make, cwd, timeout).arg("clean"),
            BuildStep::Build => CommandSpec::new(&toolchain.make, cwd, timeout)
                .args(toolchain.make_flags.iter().cloned()),
        }
    }

    /// Configure, clean and build the project.
    ///
    /// # Errors
    ///
    /// [`QtcovError::NotFound`] when the project file is missing,
    /// [`QtcovError::ToolNotFound`] and [`QtcovError::Timeout`] from the
    /// runner. A failing step is not an error; it yields `success = false`.
    pub async fn configure_and_build(
        &self,
        project_file: &Path,
        toolchain: &ToolchainConfig,
        object_dir: &Path,
    ) -> Result<CompilationResult> {
        if !project_file.is_file() {
            return Err(QtcovError::NotFound {
                path: project_file.to_path_buf(),
            });
        }
        let cwd = project_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let started = Instant::now();
        let mut result = CompilationResult::default();

        for step in [BuildStep::Configure, BuildStep::Clean, BuildStep::Build] {
            let spec = Self::step_command(step, project_file, &cwd, toolchain);
            info!("Build step {}: {}", step.as_str(), spec);
            let output = self.runner.run(&spec).await?;
            append_output(&mut result, &output);
            result.exit_code = output.exit_code;

            if !output.success() {
                warn!(
                    "Build step {} failed with exit code {:?}",
                    step.as_str(),
                    output.exit_code
                );
                result.step = Some(step.as_str().to_string());
                result.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(result);
            }

            if step == BuildStep::Clean {
                let removed = remove_stale_counters(object_dir);
                if removed > 0 {
                    debug!("Removed {} stale .gcda files", removed);
                }
            }
        }

        result.success = true;
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!("Build finished in {}ms", result.duration_ms);
        Ok(result)
    }
}

fn append_output(result: &mut CompilationResult, output: &ProcessOutput) {
    for (acc, text) in [
        (&mut result.stdout, &output.stdout),
        (&mut result.stderr, &output.stderr),
    ] {
        if text.is_empty() {
            continue;
        }
        if !acc.is_empty() && !acc.ends_with('\n') {
            acc.push('\n');
        }
        acc.push_str(text);
    }
}

/// Delete `*.gcda` files below `object_dir`; returns how many were removed.
///
/// Counters left over from an earlier binary make gcov report stamp
/// mismatches once the objects are rebuilt.
pub fn remove_stale_counters(object_dir: &Path) -> usize {
    if !object_dir.is_dir() {
        return 0;
    }
    WalkDir::new(object_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("gcda"))
        })
        .filter(|e| match std::fs::remove_file(e.path()) {
            Ok(()) => true,
            Err(err) => {
                warn!("Could not remove {}: {}", e.path().display(), err);
                false
            }
        })
        .count()
}
