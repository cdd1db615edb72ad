//! Coverage collection with shadow-build reconciliation.
//!
//! The aggregator (gcovr by default) runs once against the object
//! directory. Source references it could not open are reconciled by
//! copying same-named sources into the build tree, and the tool runs a
//! second time. Whatever is still unresolved afterwards is reported as a
//! warning. Report files left by an earlier run are removed first, so a
//! report on disk afterwards was written by this collection.
//!
//! # Example
//!
//! ```rust,ignore
//! use qtcov::coverage::{CoverageCollector, CoverageOutputs};
//!
//! let collector = CoverageCollector::new(runner, &config.coverage, root.join("coverage"));
//! let report = collector
//!     .collect(&root, &root.join("tests/generated/debug"), &config.coverage.exclude_dirs, CoverageOutputs::default())
//!     .await?;
//! println!("{}", report.summary);
//! ```

pub mod reconcile;
pub mod report;

pub use reconcile::{pick_candidate, CopiedSource, CoverageReference, Reconciler, Unresolved};
pub use report::{target_line_coverage, CoverageOutputs, CoverageReport, FileCoverage, ReportPaths};

use crate::config::CoverageConfig;
use crate::error::{QtcovError, Result};
use crate::parser::{CoverageToolParser, GcovrParser};
use crate::process::{CommandRunner, CommandSpec, ProcessOutput};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default aggregator binary.
pub const DEFAULT_COVERAGE_TOOL: &str = "gcovr";

/// Runs the coverage aggregator and reconciles missing sources.
pub struct CoverageCollector {
    runner: Arc<dyn CommandRunner>,
    parser: Box<dyn CoverageToolParser>,
    config: CoverageConfig,
    coverage_dir: PathBuf,
}

impl CoverageCollector {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &CoverageConfig, coverage_dir: PathBuf) -> Self {
        Self {
            runner,
            parser: Box::new(GcovrParser::new()),
            config: config.clone(),
            coverage_dir,
        }
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Box<dyn CoverageToolParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn coverage_dir(&self) -> &Path {
        &self.coverage_dir
    }

    /// Program and leading arguments, honoring the command override.
    pub fn tool_command(&self) -> (PathBuf, Vec<String>) {
        let mut parts = self
            .config
            .command
            .as_deref()
            .unwrap_or(DEFAULT_COVERAGE_TOOL)
            .split_whitespace()
            .map(str::to_string);
        let program = parts
            .next()
            .unwrap_or_else(|| DEFAULT_COVERAGE_TOOL.to_string());
        (PathBuf::from(program), parts.collect())
    }

    /// Full aggregator invocation.
    pub fn build_command(
        &self,
        project_root: &Path,
        object_dir: &Path,
        exclude_dirs: &[String],
        reports: &ReportPaths,
    ) -> CommandSpec {
        let (program, prefix) = self.tool_command();
        let mut spec = CommandSpec::new(program, project_root, self.config.timeout())
            .args(prefix)
            .arg("-r")
            .arg(project_root.display().to_string())
            .arg("--object-directory")
            .arg(object_dir.display().to_string());

        if let Some(gcov) = &self.config.gcov {
            spec = spec
                .arg("--gcov-executable")
                .arg(gcov.display().to_string());
        }
        for dir in exclude_dirs {
            spec = spec.arg("--exclude-directories").arg(dir.clone());
        }
        spec = spec.arg("--print-summary");
        if let Some(html) = &reports.html {
            spec = spec.arg("--html-details").arg(html.display().to_string());
        }
        if let Some(json) = &reports.json {
            spec = spec.arg("--json").arg(json.display().to_string());
        }
        if let Some(csv) = &reports.csv {
            spec = spec.arg("--csv").arg(csv.display().to_string());
        }
        spec.args(self.config.extra_args.iter().cloned())
    }

    fn references(&self, output: &ProcessOutput, object_dir: &Path) -> Vec<CoverageReference> {
        self.parser
            .source_references(&output.combined())
            .into_iter()
            .map(|r| CoverageReference::new(r, object_dir))
            .collect()
    }

    /// Collect coverage for `object_dir`.
    ///
    /// # Errors
    ///
    /// [`QtcovError::ToolNotFound`] when the aggregator is missing,
    /// [`QtcovError::Timeout`] when it runs past its deadline.
    pub async fn collect(
        &self,
        project_root: &Path,
        object_dir: &Path,
        exclude_dirs: &[String],
        outputs: CoverageOutputs,
    ) -> Result<CoverageReport> {
        let reports = ReportPaths::in_dir(&self.coverage_dir, outputs);
        for path in reports.all() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if path.is_file() {
                debug!("Removing stale report {}", path.display());
                std::fs::remove_file(path)?;
            }
        }

        let spec = self.build_command(project_root, object_dir, exclude_dirs, &reports);
        info!("Collecting coverage: {}", spec);
        let mut output = self.runner.run(&spec).await?;
        let mut passes = 1;

        let references = self.references(&output, object_dir);
        let mut report = CoverageReport {
            reports,
            ..Default::default()
        };

        if !references.is_empty() {
            debug!("{} reports {} source references", self.parser.name(), references.len());
            let reconciler = Reconciler::new(
                project_root,
                object_dir,
                exclude_dirs,
                &self.config.extensions,
            );
            let outcome = reconciler.reconcile(&references);
            report.copied = outcome.copied;
            report.unresolved = outcome.unresolved;

            if !report.copied.is_empty() {
                info!(
                    "Copied {} sources into the build tree, collecting again",
                    report.copied.len()
                );
                output = self.runner.run(&spec).await?;
                passes += 1;

                let mut still_missing: Vec<Unresolved> = self
                    .references(&output, object_dir)
                    .into_iter()
                    .filter(|r| !r.is_resolved())
                    .filter(|r| !report.unresolved.iter().any(|u| u.reference == *r))
                    .map(|reference| Unresolved {
                        reference,
                        reason: "still missing after reconciliation".to_string(),
                    })
                    .collect();
                report.unresolved.append(&mut still_missing);
            }
        }

        for unresolved in &report.unresolved {
            warn!(
                "Unresolved coverage source {} ({})",
                unresolved.reference.referenced, unresolved.reason
            );
        }
        if !output.success() {
            warn!(
                "{} exited with {:?}: {}",
                self.parser.name(),
                output.exit_code,
                crate::fsutil::tail_lines(&output.stderr, 5)
            );
        }

        report.summary = self.parser.summary(&output.stdout);
        report.passes = passes;
        report.exit_code = output.exit_code;
        report.missing = report
            .reports
            .all()
            .into_iter()
            .filter(|p| !p.is_file())
            .map(Path::to_path_buf)
            .collect();
        if !report.summary.is_empty() {
            info!("Coverage: {}", report.summary);
        }
        Ok(report)
    }
}

/// Fail unless the final pass exited cleanly and wrote every requested
/// report.
pub fn ensure_reports(report: &CoverageReport) -> Result<()> {
    if report.exit_code != Some(0) {
        return Err(QtcovError::execution(
            DEFAULT_COVERAGE_TOOL,
            format!("coverage tool exited with {:?}", report.exit_code),
        ));
    }
    if !report.missing.is_empty() {
        let missing: Vec<String> = report.missing.iter().map(|p| p.display().to_string()).collect();
        return Err(QtcovError::execution(
            DEFAULT_COVERAGE_TOOL,
            format!("no coverage report written: {}", missing.join(", ")),
        ));
    }
    Ok(())
}
