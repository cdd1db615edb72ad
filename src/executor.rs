//! Running the compiled test executable and reading its totals.

use crate::build::CompilationResult;
use crate::config::TestRunConfig;
use crate::error::{QtcovError, Result};
use crate::fsutil::tail_lines;
use crate::parser::{detect_loader_failure, parser_for, TestOutputParser};
use crate::process::{prepend_path, CommandRunner, CommandSpec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lines of stdout attached to a crash report without a summary.
const CRASH_TAIL_LINES: usize = 40;

/// Runs a test executable and parses its summary.
pub struct TestExecutor {
    runner: Arc<dyn CommandRunner>,
    parser: Box<dyn TestOutputParser>,
    runtime_dirs: Vec<PathBuf>,
}

impl TestExecutor {
    /// Executor using the parser for the configured framework (or the
    /// custom summary pattern).
    pub fn new(runner: Arc<dyn CommandRunner>, config: &TestRunConfig) -> Result<Self> {
        let parser = parser_for(config.framework, config.summary_pattern.as_deref())?;
        Ok(Self {
            runner,
            parser,
            runtime_dirs: config.runtime_dirs.clone(),
        })
    }

    /// Replace the output parser.
    #[must_use]
    pub fn with_parser(mut self, parser: Box<dyn TestOutputParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Run `executable` in `working_dir`.
    ///
    /// # Errors
    ///
    /// - [`QtcovError::Execution`] when the process cannot be started
    /// - [`QtcovError::Environment`] when the dynamic loader aborted it
    /// - [`QtcovError::Timeout`] when it ran past `timeout` (it is killed)
    ///
    /// Failing tests are reported through `success = false`, not an error.
    pub async fn run(
        &self,
        executable: &Path,
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<CompilationResult> {
        let mut spec = CommandSpec::new(executable, working_dir, timeout);
        if let Some(path) = prepend_path(&self.runtime_dirs) {
            spec = spec.env("PATH", path);
        }
        info!("Running tests: {}", spec);

        let output = self.runner.run(&spec).await.map_err(|e| match e {
            QtcovError::ToolNotFound { tool } => {
                QtcovError::execution(tool, "test executable not found or not runnable")
            }
            other => other,
        })?;

        let counts = self.parser.parse_counts(&output.stdout, &output.stderr);
        // A run that printed its totals was launched; loader signatures in
        // test messages do not make it a launch failure.
        if counts.is_none() && !output.success() {
            if let Some(failure) =
                detect_loader_failure(output.exit_code, &output.stdout, &output.stderr)
            {
                warn!(
                    "Test launch aborted by the loader: {}{}",
                    failure.reason,
                    failure
                        .library
                        .as_deref()
                        .map(|l| format!(" ({})", l))
                        .unwrap_or_default()
                );
                return Err(QtcovError::environment(
                    executable.display().to_string(),
                    failure.reason,
                    failure.library,
                ));
            }
        }

        let mut result = CompilationResult {
            success: false,
            passed: 0,
            failed: 0,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            exit_code: output.exit_code,
            step: None,
            duration_ms: output.duration.as_millis() as u64,
        };

        match counts {
            Some(counts) => {
                result.passed = counts.passed;
                result.failed = counts.failed;
                result.success = output.success() && counts.failed == 0;
                info!(
                    "Tests finished: {} passed, {} failed ({})",
                    counts.passed,
                    counts.failed,
                    self.parser.name()
                );
            }
            None => {
                debug!("No {} summary in test output", self.parser.name());
                if !output.success() {
                    let tail = tail_lines(&output.stdout, CRASH_TAIL_LINES);
                    warn!(
                        "Test executable exited with {:?} without a summary",
                        output.exit_code
                    );
                    if !tail.is_empty() {
                        if !result.stderr.is_empty() && !result.stderr.ends_with('\n') {
                            result.stderr.push('\n');
                        }
                        result.stderr.push_str("--- last test output ---\n");
                        result.stderr.push_str(&tail);
                    }
                }
            }
        }

        Ok(result)
    }
}

/// Locate the test executable.
///
/// A configured path must exist. Otherwise the generated-tests tree is
/// searched for `*_tests`, then `test*` (with an optional `.exe`), in `.`,
/// `debug/` and `release/`.
pub fn discover_executable(generated_dir: &Path, configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            generated_dir.join(path)
        };
        return if path.is_file() {
            Ok(path)
        } else {
            Err(QtcovError::NotFound { path })
        };
    }

    let dirs = [
        generated_dir.to_path_buf(),
        generated_dir.join("debug"),
        generated_dir.join("release"),
    ];
    let patterns: [fn(&str) -> bool; 2] = [is_suite_binary, is_test_binary];

    for is_match in patterns {
        for dir in &dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut names: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_executable(p))
                .collect();
            names.sort();
            if let Some(found) = names.into_iter().find(|p| {
                p.file_stem()
                    .map(|s| is_match(&s.to_string_lossy().to_lowercase()))
                    .unwrap_or(false)
            }) {
                debug!("Discovered test executable {}", found.display());
                return Ok(found);
            }
        }
    }

    Err(QtcovError::NotFound {
        path: generated_dir.join("<test executable>"),
    })
}

fn is_suite_binary(stem: &str) -> bool {
    stem.ends_with("_tests")
}

fn is_test_binary(stem: &str) -> bool {
    stem.starts_with("test")
}

/// No extension or `.exe`; on unix the execute bit must also be set.
fn is_executable(path: &Path) -> bool {
    let ext_ok = match path.extension() {
        None => true,
        Some(ext) => ext.eq_ignore_ascii_case("exe"),
    };
    if !ext_ok {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        true
    }
}
