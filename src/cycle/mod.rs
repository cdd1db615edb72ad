//! The generate → build → test → coverage cycle.
//!
//! [`CycleOrchestrator`] drives one task through the stages in strict
//! sequence. Every stage reports a typed result; the first hard failure
//! moves the cycle to `Failed(stage)` and the remaining stages are skipped,
//! but everything gathered so far is kept in the [`CycleResult`].
//!
//! The only repeated action is the test launch: a launch aborted by the
//! dynamic loader goes through `Remediating` (a [`RuntimeStager`] places
//! the missing library) and `Retrying` (one more launch). A failure while
//! retrying is final.

pub mod archive;
pub mod state;

pub use archive::CycleArchive;
pub use state::{CycleState, CycleStatus, Stage, StateMachine, StateTransition};

use crate::artifact::{GenerationResult, TestArtifactWriter};
use crate::build::{missing_coverage_flags, BuildRunner, CompilationResult};
use crate::config::{PathsConfig, QtcovConfig};
use crate::coverage::{
    ensure_reports, target_line_coverage, CoverageCollector, CoverageOutputs, CoverageReport,
    FileCoverage,
};
use crate::error::{QtcovError, Result};
use crate::executor::{discover_executable, TestExecutor};
use crate::fsutil::{tail_lines, ExcludeSet};
use crate::llm::{self, LlmClient};
use crate::process::CommandRunner;
use crate::prompt::{target_stem, PromptAssembler, PromptStore, SourceContextCollector};
use crate::remediation::{DependencyStager, RuntimeStager};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lines of tool output kept in stage error messages.
const DIAGNOSTIC_TAIL_LINES: usize = 20;

// ============================================================================
// Observer
// ============================================================================

/// Receives every state transition and warning of a cycle.
pub trait CycleObserver: Send + Sync {
    fn on_transition(&self, _transition: &StateTransition) {}

    fn on_warning(&self, _message: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl CycleObserver for NoopObserver {}

// ============================================================================
// Cycle Result
// ============================================================================

/// Everything one cycle produced.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub generation: Option<GenerationResult>,
    pub build: Option<CompilationResult>,
    pub tests: Option<CompilationResult>,
    pub coverage: Option<CoverageReport>,
    /// Line coverage of the file the task targets
    pub target_coverage: Option<FileCoverage>,
    pub remediated: bool,
    pub history: Vec<StateTransition>,
    pub failed_stage: Option<Stage>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub status: CycleStatus,
    pub archive_dir: Option<PathBuf>,
}

impl CycleResult {
    pub fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            generation: None,
            build: None,
            tests: None,
            coverage: None,
            target_coverage: None,
            remediated: false,
            history: Vec::new(),
            failed_stage: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            status: CycleStatus::Failed,
            archive_dir: None,
        }
    }

    /// Verdict from the collected results.
    ///
    /// `Success` requires a saved test file, a successful build, at least
    /// one executed test, no failing test and a complete coverage
    /// collection (clean exit, every requested report written).
    pub fn derive_status(&self) -> CycleStatus {
        if self.failed_stage.is_some_and(|s| s != Stage::Coverage) {
            return CycleStatus::Failed;
        }
        let generated = self.generation.as_ref().is_some_and(|g| g.success);
        let built = self.build.as_ref().is_some_and(|b| b.success);
        if !generated || !built {
            return CycleStatus::Failed;
        }
        let Some(tests) = &self.tests else {
            return CycleStatus::Failed;
        };
        let covered = self.coverage.as_ref().is_some_and(CoverageReport::is_complete);
        if tests.executed() == 0 || tests.failed > 0 || !tests.success || !covered {
            CycleStatus::Partial
        } else {
            CycleStatus::Success
        }
    }
}

// ============================================================================
// Run bookkeeping
// ============================================================================

struct CycleRun<'a> {
    machine: StateMachine,
    result: CycleResult,
    observer: &'a dyn CycleObserver,
    last_error: Option<QtcovError>,
    prompt_text: Option<String>,
    response_text: Option<String>,
}

impl<'a> CycleRun<'a> {
    fn new(task: &str, observer: &'a dyn CycleObserver) -> Self {
        Self {
            machine: StateMachine::new(),
            result: CycleResult::new(task),
            observer,
            last_error: None,
            prompt_text: None,
            response_text: None,
        }
    }

    fn advance(&mut self, to: CycleState) {
        match self.machine.advance(to) {
            Ok(transition) => {
                info!("Cycle '{}': {} -> {}", self.result.task, transition.from, transition.to);
                self.observer.on_transition(&transition);
            }
            Err(e) => error!("{}", e),
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.observer.on_warning(&message);
        self.result.warnings.push(message);
    }

    fn fail(&mut self, stage: Stage, err: QtcovError) {
        error!("Stage {} failed: {}", stage, err);
        self.result.errors.push(format!("{}: {}", stage, err));
        self.result.failed_stage = Some(stage);
        self.advance(CycleState::Failed(stage));
        self.last_error = Some(err);
    }

    fn is_failed(&self) -> bool {
        matches!(self.machine.state(), CycleState::Failed(_))
    }

    fn finish(mut self) -> (CycleResult, Option<QtcovError>) {
        self.result.history = self.machine.history().to_vec();
        self.result.finished_at = Some(Utc::now());
        self.result.status = self.result.derive_status();
        (self.result, self.last_error)
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Composes the stages into `generate` and `full_cycle`.
pub struct CycleOrchestrator {
    config: QtcovConfig,
    project_root: PathBuf,
    llm: Arc<dyn LlmClient>,
    runner: Arc<dyn CommandRunner>,
    stager: Arc<dyn RuntimeStager>,
    observer: Arc<dyn CycleObserver>,
    writer: TestArtifactWriter,
    assembler: PromptAssembler,
    archive: bool,
}

impl CycleOrchestrator {
    /// Build an orchestrator.
    ///
    /// # Errors
    ///
    /// [`QtcovError::Config`] unless `automation.enabled` is set.
    pub fn new(
        config: QtcovConfig,
        project_root: impl Into<PathBuf>,
        llm: Arc<dyn LlmClient>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        config.ensure_automation_enabled()?;
        let stager = Arc::new(DependencyStager::new(
            config.tests.runtime_dirs.clone(),
            config.tests.deploy_tool.clone(),
            runner.clone(),
            config.tests.timeout(),
        ));
        Ok(Self {
            writer: TestArtifactWriter::new(config.tests.framework),
            assembler: PromptAssembler::new(config.context),
            project_root: project_root.into(),
            llm,
            runner,
            stager,
            observer: Arc::new(NoopObserver),
            archive: true,
            config,
        })
    }

    #[must_use]
    pub fn with_stager(mut self, stager: Arc<dyn RuntimeStager>) -> Self {
        self.stager = stager;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Skip writing the per-run archive.
    #[must_use]
    pub fn without_archive(mut self) -> Self {
        self.archive = false;
        self
    }

    pub fn config(&self) -> &QtcovConfig {
        &self.config
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    fn path(&self, path: &Path) -> PathBuf {
        PathsConfig::resolve(&self.project_root, path)
    }

    pub fn prompt_store(&self) -> PromptStore {
        PromptStore::new(self.path(&self.config.paths.prompts_file))
    }

    pub fn generated_dir(&self) -> PathBuf {
        self.path(&self.config.paths.generated_dir)
    }

    /// Load the prompt, ask the LLM and save the test file.
    ///
    /// # Errors
    ///
    /// The error of the failing stage: [`QtcovError::NotFound`] or
    /// [`QtcovError::UnknownTask`] for the prompt, provider errors for the
    /// request, [`QtcovError::Extraction`] when no test could be saved.
    pub async fn generate(&self, task: &str) -> Result<GenerationResult> {
        let mut run = CycleRun::new(task, self.observer.as_ref());
        self.run_generation(task, &mut run).await;
        if !run.is_failed() {
            run.advance(CycleState::Done);
        }
        let (result, err) = run.finish();
        match (result.generation, err) {
            (Some(generation), _) if generation.success => Ok(generation),
            (_, Some(err)) => Err(err),
            (_, None) => Err(QtcovError::extraction("no test file was saved")),
        }
    }

    async fn run_generation(&self, task: &str, run: &mut CycleRun<'_>) {
        let prompt = match self.prompt_store().get(task) {
            Ok(prompt) => prompt,
            Err(e) => return run.fail(Stage::Prompt, e),
        };
        run.advance(CycleState::PromptLoaded);

        let generated_dir = self.generated_dir();
        let exclude = ExcludeSet::new(&self.project_root, &self.config.coverage.exclude_dirs)
            .with_subtree(&generated_dir);
        let context = match SourceContextCollector::new(&self.project_root, exclude).collect(task) {
            Ok(context) => context,
            Err(e) => {
                run.warn(format!("source context unavailable: {}", e));
                Vec::new()
            }
        };

        let generated = match llm::generate(
            self.llm.as_ref(),
            &self.assembler,
            &prompt,
            self.config.llm.system_prompt.as_deref(),
            &context,
        )
        .await
        {
            Ok(generated) => generated,
            Err(e) => return run.fail(Stage::Generate, e),
        };
        run.prompt_text = Some(generated.prompt.text.clone());
        run.response_text = Some(generated.text.clone());
        run.advance(CycleState::Generated);

        let generation = self
            .writer
            .extract_and_save(&generated.text, &generated_dir, task);
        let saved = generation.success;
        let message = generation.error.clone();
        run.result.generation = Some(generation);
        if saved {
            run.advance(CycleState::Saved);
        } else {
            let message = message.unwrap_or_else(|| "no test file was saved".to_string());
            run.fail(Stage::Save, QtcovError::extraction(message));
        }
    }

    /// Run all stages for `task`.
    ///
    /// Never returns an error: failures are recorded in the result and
    /// reflected in its status.
    pub async fn full_cycle(&self, task: &str) -> CycleResult {
        let mut run = CycleRun::new(task, self.observer.as_ref());

        self.run_generation(task, &mut run).await;
        if !run.is_failed() {
            self.run_build_and_tests(&mut run).await;
        }
        if !run.is_failed() {
            run.advance(CycleState::Done);
        }

        let prompt_text = run.prompt_text.take();
        let response_text = run.response_text.take();
        let (mut result, _) = run.finish();
        info!("Cycle '{}' finished: {}", result.task, result.status);

        if self.archive {
            let archive = CycleArchive::new(self.path(&self.config.paths.reports_dir));
            match archive.write(&result, prompt_text.as_deref(), response_text.as_deref()) {
                Ok(dir) => result.archive_dir = Some(dir),
                Err(e) => {
                    let message = format!("archive not written: {}", e);
                    warn!("{}", message);
                    self.observer.on_warning(&message);
                    result.warnings.push(message);
                }
            }
        }
        result
    }

    async fn run_build_and_tests(&self, run: &mut CycleRun<'_>) {
        let project_file = self.path(&self.config.paths.project_file);
        let object_dir = self.path(&self.config.paths.object_dir);
        let generated_dir = self.generated_dir();

        match missing_coverage_flags(&project_file, &self.config.toolchain) {
            Ok(missing) if !missing.is_empty() => run.warn(format!(
                "{} has no coverage instrumentation (missing {}); coverage data will be empty",
                project_file.display(),
                missing.join(" ")
            )),
            Ok(_) => {}
            Err(e) => debug!("Coverage flag check skipped: {}", e),
        }

        // build
        let build = BuildRunner::new(self.runner.clone())
            .configure_and_build(&project_file, &self.config.toolchain, &object_dir)
            .await;
        match build {
            Err(e) => return run.fail(Stage::Build, e),
            Ok(build) => {
                let ok = build.success;
                let detail = format!(
                    "step {} exited with {:?}\n{}",
                    build.step.as_deref().unwrap_or("build"),
                    build.exit_code,
                    tail_lines(&build.stderr, DIAGNOSTIC_TAIL_LINES)
                );
                run.result.build = Some(build);
                if !ok {
                    return run.fail(Stage::Build, QtcovError::execution("build", detail));
                }
            }
        }
        run.advance(CycleState::Built);

        // test
        let executable = match discover_executable(
            &generated_dir,
            self.config.paths.test_executable.as_deref(),
        ) {
            Ok(exe) => exe,
            Err(e) => return run.fail(Stage::Test, e),
        };
        let executor = match TestExecutor::new(self.runner.clone(), &self.config.tests) {
            Ok(executor) => executor,
            Err(e) => return run.fail(Stage::Test, e),
        };

        let tests = loop {
            let launch = executor
                .run(&executable, &generated_dir, self.config.tests.timeout())
                .await;
            match launch {
                Ok(tests) => break tests,
                Err(e) if e.is_remediable() && run.machine.state() == CycleState::Built => {
                    run.warn(format!("test launch failed, staging runtime: {}", e));
                    run.advance(CycleState::Remediating);
                    match self.stager.stage(&executable, &e).await {
                        Ok(staged) => info!("Staged {} runtime paths", staged.len()),
                        Err(stage_err) => return run.fail(Stage::Test, stage_err),
                    }
                    run.result.remediated = true;
                    run.advance(CycleState::Retrying);
                }
                Err(e) => return run.fail(Stage::Test, e),
            }
        };
        if tests.executed() == 0 {
            run.warn("no tests executed".to_string());
        }
        run.result.tests = Some(tests);
        run.advance(CycleState::Tested);

        // coverage
        let collector = CoverageCollector::new(
            self.runner.clone(),
            &self.config.coverage,
            self.path(&self.config.paths.coverage_dir),
        );
        let collected = collector
            .collect(
                &self.project_root,
                &object_dir,
                &self.config.coverage.exclude_dirs,
                CoverageOutputs::from(&self.config.coverage),
            )
            .await;
        match collected {
            Ok(report) => {
                for unresolved in &report.unresolved {
                    run.warn(format!(
                        "coverage source unresolved: {} ({})",
                        unresolved.reference.referenced, unresolved.reason
                    ));
                }
                let complete = match ensure_reports(&report) {
                    Ok(()) => true,
                    Err(e) => {
                        run.result.errors.push(format!("{}: {}", Stage::Coverage, e));
                        run.warn(format!("coverage incomplete: {}", e));
                        false
                    }
                };
                if complete {
                    run.result.target_coverage = self.target_coverage(&run.result.task, &report);
                }
                run.result.coverage = Some(report);
                if complete {
                    run.advance(CycleState::CoverageCollected);
                }
            }
            Err(e) => {
                run.result.errors.push(format!("{}: {}", Stage::Coverage, e));
                run.warn(format!("coverage not collected: {}", e));
            }
        }
    }

    fn target_coverage(&self, task: &str, report: &CoverageReport) -> Option<FileCoverage> {
        let json = report.reports.json.as_deref()?;
        let stem = target_stem(task);
        match target_line_coverage(json, &stem) {
            Ok(Some(target)) => {
                info!("Target {} line coverage: {:.1}%", target.file, target.lines);
                Some(target)
            }
            Ok(None) => {
                debug!("No coverage entry for target '{}'", stem);
                None
            }
            Err(e) => {
                warn!("Target coverage unavailable: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessOutput;
    use crate::testing::{MockCommandRunner, MockLlmClient, MockStager, ScriptedResponse};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const RESPONSE: &str = "```cpp\n#include <QtTest>\nclass TestX : public QObject\n{\n    Q_OBJECT\nprivate slots:\n    void testA();\n    void testB();\n};\nvoid TestX::testA() {}\nvoid TestX::testB() {}\nQTEST_MAIN(TestX)\n#include \"test_x.moc\"\n```";

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("llm_prompts.json"), r#"{"t1": "generate tests for X"}"#).unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/x.h"), "class X {};").unwrap();
        let generated = root.join("tests/generated");
        std::fs::create_dir_all(generated.join("debug")).unwrap();
        std::fs::write(generated.join("tests.pro"), "QT += testlib\n").unwrap();
        std::fs::write(generated.join("generated_tests"), b"").unwrap();
        dir
    }

    fn config() -> QtcovConfig {
        let mut config = QtcovConfig::default();
        config.automation.enabled = true;
        config.paths.test_executable = Some(PathBuf::from("generated_tests"));
        config
    }

    fn orchestrator(dir: &TempDir, llm: MockLlmClient, runner: Arc<MockCommandRunner>) -> CycleOrchestrator {
        CycleOrchestrator::new(config(), dir.path(), Arc::new(llm), runner)
            .unwrap()
            .without_archive()
    }

    fn gcovr_reports(dir: &TempDir, json: &str) -> ScriptedResponse {
        let coverage = dir.path().join("coverage");
        ScriptedResponse::OutputWithFiles(
            ProcessOutput::ok("lines: 75.0% (3 out of 4)\n"),
            vec![
                (coverage.join("coverage.html"), "<html></html>".to_string()),
                (coverage.join("coverage.json"), json.to_string()),
                (coverage.join("coverage.csv"), "filename\n".to_string()),
            ],
        )
    }

    fn totals(passed: u32, failed: u32) -> ScriptedResponse {
        ScriptedResponse::Output(ProcessOutput::exited(
            if failed > 0 { 1 } else { 0 },
            format!("Totals: {} passed, {} failed, 0 skipped, 0 blacklisted, 3ms\n", passed, failed),
            "",
        ))
    }

    #[test]
    fn test_requires_automation_enabled() {
        let dir = project();
        let err = CycleOrchestrator::new(
            QtcovConfig::default(),
            dir.path(),
            Arc::new(MockLlmClient::new()),
            Arc::new(MockCommandRunner::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, QtcovError::Config { .. }));
    }

    #[tokio::test]
    async fn test_generate_saves_file() {
        let dir = project();
        let llm = MockLlmClient::new().with_response(RESPONSE);
        let result = orchestrator(&dir, llm.clone(), Arc::new(MockCommandRunner::new()))
            .generate("t1")
            .await
            .unwrap();
        assert_eq!(result.tests_generated, 2);
        assert!(dir.path().join("tests/generated/test_t1.cpp").exists());
        assert!(llm.last_prompt().unwrap().contains("class X {};"));
    }

    #[tokio::test]
    async fn test_generate_unknown_task() {
        let dir = project();
        let llm = MockLlmClient::new().with_response(RESPONSE);
        let err = orchestrator(&dir, llm.clone(), Arc::new(MockCommandRunner::new()))
            .generate("t9")
            .await
            .unwrap_err();
        assert!(matches!(err, QtcovError::UnknownTask { .. }));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_generate_prose_is_extraction_error() {
        let dir = project();
        let llm = MockLlmClient::new().with_response("Sorry, I can't do that.");
        let err = orchestrator(&dir, llm, Arc::new(MockCommandRunner::new()))
            .generate("t1")
            .await
            .unwrap_err();
        assert!(matches!(err, QtcovError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_full_cycle_success() {
        let dir = project();
        let runner = Arc::new(
            MockCommandRunner::new()
                .script("generated_tests", totals(2, 0))
                .script("gcovr", gcovr_reports(&dir, r#"{"files":[]}"#)),
        );
        let result = orchestrator(&dir, MockLlmClient::new().with_response(RESPONSE), runner.clone())
            .full_cycle("t1")
            .await;

        assert_eq!(result.status, CycleStatus::Success, "{:?}", result.errors);
        assert!(result.history.iter().any(|t| t.to == CycleState::CoverageCollected));
        assert_eq!(result.tests.as_ref().unwrap().passed, 2);
        assert_eq!(result.history.last().unwrap().to, CycleState::Done);
        assert_eq!(runner.count("gcovr"), 1);
        assert!(!result.remediated);
    }

    #[tokio::test]
    async fn test_failing_tests_are_partial() {
        let dir = project();
        let runner = Arc::new(MockCommandRunner::new().script("generated_tests", totals(1, 1)));
        let result = orchestrator(&dir, MockLlmClient::new().with_response(RESPONSE), runner)
            .full_cycle("t1")
            .await;
        assert_eq!(result.status, CycleStatus::Partial);
        assert!(result.failed_stage.is_none());
    }

    #[tokio::test]
    async fn test_coverage_failure_is_partial() {
        let dir = project();
        let runner = Arc::new(
            MockCommandRunner::new()
                .script("generated_tests", totals(2, 0))
                .script("gcovr", ScriptedResponse::ToolMissing),
        );
        let result = orchestrator(&dir, MockLlmClient::new().with_response(RESPONSE), runner)
            .full_cycle("t1")
            .await;
        assert_eq!(result.status, CycleStatus::Partial);
        assert!(result.coverage.is_none());
        assert!(result.errors[0].starts_with("coverage:"));
    }

    #[tokio::test]
    async fn test_failed_coverage_tool_with_stale_report_is_partial() {
        let dir = project();
        std::fs::create_dir_all(dir.path().join("coverage")).unwrap();
        std::fs::write(dir.path().join("coverage/coverage.html"), "<html>old</html>").unwrap();
        let runner = Arc::new(
            MockCommandRunner::new()
                .script("generated_tests", totals(2, 0))
                .script(
                    "gcovr",
                    ScriptedResponse::Output(ProcessOutput::exited(1, "", "gcovr: fatal error: no gcda files")),
                ),
        );
        let result = orchestrator(&dir, MockLlmClient::new().with_response(RESPONSE), runner)
            .full_cycle("t1")
            .await;

        assert_eq!(result.status, CycleStatus::Partial);
        assert!(result.errors.iter().any(|e| e.starts_with("coverage:")));
        assert!(!dir.path().join("coverage/coverage.html").exists());
        assert!(!result.history.iter().any(|t| t.to == CycleState::CoverageCollected));
        assert_eq!(result.history.last().unwrap().to, CycleState::Done);
    }

    #[tokio::test]
    async fn test_clean_coverage_exit_without_reports_is_partial() {
        let dir = project();
        let runner = Arc::new(
            MockCommandRunner::new()
                .script("generated_tests", totals(2, 0))
                .script("gcovr", ScriptedResponse::Output(ProcessOutput::ok(""))),
        );
        let result = orchestrator(&dir, MockLlmClient::new().with_response(RESPONSE), runner)
            .full_cycle("t1")
            .await;

        assert_eq!(result.status, CycleStatus::Partial);
        assert!(result.coverage.is_some());
        assert!(result.errors.iter().any(|e| e.contains("no coverage report written")));
    }

    #[tokio::test]
    async fn test_target_file_coverage_is_recorded() {
        let dir = project();
        let runner = Arc::new(
            MockCommandRunner::new()
                .script("generated_tests", totals(2, 0))
                .script(
                    "gcovr",
                    gcovr_reports(
                        &dir,
                        r#"{"files":[
                            {"file":"src/other.cpp","lines":[{"line_number":1,"count":1}]},
                            {"file":"src/t1.cpp","lines":[{"line_number":1,"count":1},{"line_number":2,"count":0}]}
                        ]}"#,
                    ),
                ),
        );
        let result = orchestrator(&dir, MockLlmClient::new().with_response(RESPONSE), runner)
            .full_cycle("t1")
            .await;

        let target = result.target_coverage.unwrap();
        assert_eq!(target.file, "src/t1.cpp");
        assert_eq!(target.lines, 50.0);
    }

    #[tokio::test]
    async fn test_uninstrumented_project_is_reported() {
        let dir = project();
        let runner = Arc::new(MockCommandRunner::new().script("generated_tests", totals(1, 0)));
        let result = orchestrator(&dir, MockLlmClient::new().with_response(RESPONSE), runner)
            .full_cycle("t1")
            .await;
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("no coverage instrumentation") && w.contains("-fprofile-arcs -ftest-coverage")));

        let dir = project();
        std::fs::write(
            dir.path().join("tests/generated/tests.pro"),
            "QT += testlib\nQMAKE_CXXFLAGS += --coverage\nQMAKE_LFLAGS += --coverage\n",
        )
        .unwrap();
        let runner = Arc::new(MockCommandRunner::new().script("generated_tests", totals(1, 0)));
        let result = orchestrator(&dir, MockLlmClient::new().with_response(RESPONSE), runner)
            .full_cycle("t1")
            .await;
        assert!(!result.warnings.iter().any(|w| w.contains("no coverage instrumentation")));
    }

    #[tokio::test]
    async fn test_llm_failure_stops_cycle() {
        let dir = project();
        let runner = Arc::new(MockCommandRunner::new());
        let llm = MockLlmClient::new().with_error(|| QtcovError::provider("openai", Some(500), "boom"));
        let result = orchestrator(&dir, llm, runner.clone()).full_cycle("t1").await;
        assert_eq!(result.status, CycleStatus::Failed);
        assert_eq!(result.failed_stage, Some(Stage::Generate));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_successful_remediation_retries_once() {
        let dir = project();
        let loader = ScriptedResponse::Output(ProcessOutput::exited(
            -1073741511,
            "",
            "The procedure entry point could not be located in the dynamic link library Qt6Core.dll",
        ));
        let runner = Arc::new(
            MockCommandRunner::new()
                .script("generated_tests", loader)
                .script("generated_tests", totals(2, 0))
                .script("gcovr", gcovr_reports(&dir, r#"{"files":[]}"#)),
        );
        let stager = Arc::new(MockStager::succeeding());
        let result = orchestrator(&dir, MockLlmClient::new().with_response(RESPONSE), runner.clone())
            .with_stager(stager.clone())
            .full_cycle("t1")
            .await;

        assert_eq!(result.status, CycleStatus::Success, "{:?}", result.errors);
        assert!(result.remediated);
        assert_eq!(stager.call_count(), 1);
        assert_eq!(runner.count("generated_tests"), 2);
        let states: Vec<CycleState> = result.history.iter().map(|t| t.to).collect();
        assert!(states.contains(&CycleState::Remediating));
        assert!(states.contains(&CycleState::Retrying));
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<CycleState>>,
    }

    impl CycleObserver for Recorder {
        fn on_transition(&self, transition: &StateTransition) {
            self.seen.lock().unwrap().push(transition.to);
        }
    }

    #[tokio::test]
    async fn test_observer_sees_transitions() {
        let dir = project();
        let recorder = Arc::new(Recorder::default());
        let runner = Arc::new(MockCommandRunner::new().script("generated_tests", totals(1, 0)));
        orchestrator(&dir, MockLlmClient::new().with_response(RESPONSE), runner)
            .with_observer(recorder.clone())
            .full_cycle("t1")
            .await;
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&CycleState::PromptLoaded));
        assert_eq!(seen.last(), Some(&CycleState::Done));
    }

    #[test]
    fn test_status_requires_executed_tests() {
        let mut result = CycleResult::new("t1");
        result.generation = Some(GenerationResult::saved("t1", PathBuf::from("x.cpp"), 1, ""));
        result.build = Some(CompilationResult {
            success: true,
            ..Default::default()
        });
        result.tests = Some(CompilationResult {
            success: true,
            ..Default::default()
        });
        result.coverage = Some(CoverageReport {
            exit_code: Some(0),
            ..Default::default()
        });
        assert_eq!(result.derive_status(), CycleStatus::Partial);

        result.tests.as_mut().unwrap().passed = 1;
        assert_eq!(result.derive_status(), CycleStatus::Success);

        result.coverage.as_mut().unwrap().exit_code = Some(1);
        assert_eq!(result.derive_status(), CycleStatus::Partial);
        result.coverage.as_mut().unwrap().exit_code = Some(0);

        result.build.as_mut().unwrap().success = false;
        assert_eq!(result.derive_status(), CycleStatus::Failed);
    }
}
