//! Subprocess execution behind the [`CommandRunner`] trait.
//!
//! Every external tool (qmake, make, the test executable, gcovr, the deploy
//! tool) is started through a runner so the orchestrator can be exercised
//! against scripted outputs in tests. The system runner enforces the
//! per-command deadline and kills the child when it elapses.

use crate::error::{QtcovError, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ============================================================================
// Command Description
// ============================================================================

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, OsString)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            timeout,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// File name of the program without a `.exe` suffix, lowercased.
    ///
    /// Used as the lookup key by scripted runners.
    pub fn program_key(&self) -> String {
        program_key(&self.program)
    }

    fn env_value(&self, key: &str) -> Option<&OsString> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Lookup key for a program path, e.g. `C:\Qt\bin\qmake.exe` → `qmake`.
pub fn program_key(program: &Path) -> String {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.strip_suffix(".exe").map(str::to_string).unwrap_or(name)
}

// ============================================================================
// Process Output
// ============================================================================

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    /// Successful exit with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Exit with an arbitrary code.
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for parsers that scan both.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

// ============================================================================
// Runner Trait
// ============================================================================

/// Abstraction over subprocess execution.
///
/// # Errors
///
/// Implementations return [`QtcovError::ToolNotFound`] when the program
/// cannot be located, [`QtcovError::Timeout`] when the deadline elapses and
/// [`QtcovError::Execution`] for any other spawn or wait failure. A non-zero
/// exit code is not an error.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput>;
}

/// Runs commands with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }

    /// Resolve bare names through `PATH` and relative paths against `cwd`.
    fn resolve(spec: &CommandSpec) -> Result<PathBuf> {
        let search_path = spec
            .env_value("PATH")
            .cloned()
            .or_else(|| std::env::var_os("PATH"));
        which::which_in(&spec.program, search_path, &spec.cwd).map_err(|_| {
            QtcovError::ToolNotFound {
                tool: spec.program.display().to_string(),
            }
        })
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        let program = Self::resolve(spec)?;
        debug!("Running {} (cwd: {})", spec, spec.cwd.display());

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let started = Instant::now();
        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => QtcovError::ToolNotFound {
                tool: program.display().to_string(),
            },
            _ => QtcovError::execution(program.display().to_string(), e.to_string()),
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Err(_) => {
                warn!(
                    "{} exceeded {}s and was terminated",
                    spec.program_key(),
                    spec.timeout.as_secs()
                );
                Err(QtcovError::timeout(
                    spec.program.display().to_string(),
                    spec.timeout.as_secs(),
                ))
            }
            Ok(Err(e)) => Err(QtcovError::execution(
                program.display().to_string(),
                e.to_string(),
            )),
            Ok(Ok(output)) => {
                let result = ProcessOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    duration: started.elapsed(),
                };
                debug!(
                    "{} exited with {:?} after {}ms",
                    spec.program_key(),
                    result.exit_code,
                    result.duration.as_millis()
                );
                Ok(result)
            }
        }
    }
}

/// `PATH` value with `dirs` prepended to the current process `PATH`.
pub fn prepend_path(dirs: &[PathBuf]) -> Option<OsString> {
    if dirs.is_empty() {
        return None;
    }
    let current = std::env::var_os("PATH").unwrap_or_default();
    let combined: Vec<PathBuf> = dirs
        .iter()
        .cloned()
        .chain(std::env::split_paths(&current))
        .collect();
    std::env::join_paths(combined).ok()
}
