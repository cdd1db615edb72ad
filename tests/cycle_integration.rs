//! End-to-end cycle tests driven through the public mocks.
//!
//! No toolchain, network or Qt installation is needed: the LLM, every
//! subprocess and the runtime stager are test doubles from
//! `qtcov::testing`.

use qtcov::config::{default_exclude_dirs, extensions};
use qtcov::coverage::{pick_candidate, CoverageReference, Reconciler};
use qtcov::process::ProcessOutput;
use qtcov::prompt::PromptStore;
use qtcov::testing::{MockCommandRunner, MockLlmClient, MockStager, ScriptedResponse};
use qtcov::{CycleOrchestrator, CycleState, CycleStatus, QtcovConfig, QtcovError, Stage};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const THREE_TESTS: &str = r#"Here is the test:

```cpp
#include <QtTest>
#include "x.h"

class TestX : public QObject
{
    Q_OBJECT
private slots:
    void testCreate();
    void testParse();
    void testParse_data();
    void testReset();
};

void TestX::testCreate() { QVERIFY(true); }
void TestX::testParse_data() {}
void TestX::testParse() { QCOMPARE(1, 1); }
void TestX::testReset() {}

QTEST_MAIN(TestX)
#include "test_t1.moc"
```
"#;

const LOADER_STDERR: &str =
    "The procedure entry point _ZN7QString4argEx could not be located in the dynamic link library Qt6Core.dll";

/// `STATUS_ENTRYPOINT_NOT_FOUND` as a signed exit code
const ENTRYPOINT_NOT_FOUND: i32 = -1073741511;

fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fs::write(root.join("llm_prompts.json"), r#"{"t1": "generate tests for X"}"#).unwrap();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src/x.h"), "class X { public: int parse(); };").unwrap();
    let generated = root.join("tests/generated");
    fs::create_dir_all(generated.join("debug")).unwrap();
    fs::write(generated.join("tests.pro"), "QT += testlib\nSOURCES += test_t1.cpp\n").unwrap();
    fs::write(generated.join("generated_tests"), b"").unwrap();
    dir
}

fn config() -> QtcovConfig {
    let mut config = QtcovConfig::default();
    config.automation.enabled = true;
    config.paths.test_executable = Some(PathBuf::from("generated_tests"));
    config
}

fn orchestrator(
    dir: &TempDir,
    config: QtcovConfig,
    llm: MockLlmClient,
    runner: &Arc<MockCommandRunner>,
) -> CycleOrchestrator {
    CycleOrchestrator::new(config, dir.path(), Arc::new(llm), runner.clone()).unwrap()
}

fn totals(passed: u32, failed: u32) -> ScriptedResponse {
    ScriptedResponse::Output(ProcessOutput::exited(
        if failed > 0 { 1 } else { 0 },
        format!(
            "********* Start testing of TestX *********\n\
             Totals: {} passed, {} failed, 0 skipped, 0 blacklisted, 5ms\n\
             ********* Finished testing of TestX *********\n",
            passed, failed
        ),
        "",
    ))
}

fn loader_failure() -> ScriptedResponse {
    ScriptedResponse::Output(ProcessOutput::exited(ENTRYPOINT_NOT_FOUND, "", LOADER_STDERR))
}

// ============================================================================
// Generation
// ============================================================================

#[tokio::test]
async fn test_generation_counts_markers() {
    let dir = project();
    let runner = Arc::new(MockCommandRunner::new());
    let llm = MockLlmClient::new().with_response(THREE_TESTS);

    let generation = orchestrator(&dir, config(), llm.clone(), &runner)
        .generate("t1")
        .await
        .unwrap();

    assert!(generation.success);
    assert_eq!(generation.tests_generated, 3);
    let file = dir.path().join("tests/generated/test_t1.cpp");
    assert_eq!(generation.file_path.as_deref(), Some(file.as_path()));
    let saved = fs::read_to_string(&file).unwrap();
    assert!(saved.contains("QTEST_MAIN(TestX)"));
    assert!(!saved.contains("```"));

    assert_eq!(llm.call_count(), 1);
    assert!(llm.last_prompt().unwrap().contains("## Task\n\ngenerate tests for X"));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_prose_answer_writes_nothing() {
    let dir = project();
    let runner = Arc::new(MockCommandRunner::new());
    let llm = MockLlmClient::new().with_response("I cannot see the class, please paste it.");

    let result = orchestrator(&dir, config(), llm, &runner)
        .without_archive()
        .full_cycle("t1")
        .await;

    assert_eq!(result.status, CycleStatus::Failed);
    assert_eq!(result.failed_stage, Some(Stage::Save));
    let generation = result.generation.unwrap();
    assert!(!generation.success);
    assert!(generation.file_path.is_none());
    assert!(!dir.path().join("tests/generated/test_t1.cpp").exists());
    assert!(runner.calls().is_empty());
}

// ============================================================================
// Build
// ============================================================================

#[tokio::test]
async fn test_configure_failure_skips_tests() {
    let dir = project();
    let runner = Arc::new(MockCommandRunner::new().script(
        "qmake",
        ScriptedResponse::Output(ProcessOutput::exited(
            3,
            "",
            "Project ERROR: Unknown module(s) in QT: testlib",
        )),
    ));

    let result = orchestrator(&dir, config(), MockLlmClient::new().with_response(THREE_TESTS), &runner)
        .without_archive()
        .full_cycle("t1")
        .await;

    let build = result.build.as_ref().unwrap();
    assert!(!build.success);
    assert!(!build.stderr.is_empty());
    assert_eq!(build.step.as_deref(), Some("configure"));
    assert_eq!(result.failed_stage, Some(Stage::Build));
    assert_eq!(result.status, CycleStatus::Failed);
    assert_eq!(runner.count("make"), 0);
    assert_eq!(runner.count("generated_tests"), 0);
    assert_eq!(runner.count("gcovr"), 0);
    assert!(result.errors[0].contains("Unknown module"));
}

#[tokio::test]
async fn test_compile_failure_skips_tests() {
    let dir = project();
    let runner = Arc::new(
        MockCommandRunner::new()
            .script("make", ScriptedResponse::Output(ProcessOutput::ok("")))
            .script(
                "make",
                ScriptedResponse::Output(ProcessOutput::exited(
                    2,
                    "",
                    "test_t1.cpp:12: error: 'parse' was not declared in this scope",
                )),
            ),
    );

    let result = orchestrator(&dir, config(), MockLlmClient::new().with_response(THREE_TESTS), &runner)
        .without_archive()
        .full_cycle("t1")
        .await;

    assert_eq!(result.status, CycleStatus::Failed);
    assert_eq!(result.build.as_ref().unwrap().step.as_deref(), Some("build"));
    assert_eq!(runner.count("make"), 2);
    assert_eq!(runner.count("generated_tests"), 0);
}

// ============================================================================
// Launch remediation
// ============================================================================

#[tokio::test]
async fn test_repeated_loader_failure_remediates_once() {
    let dir = project();
    let runner = Arc::new(
        MockCommandRunner::new()
            .script("generated_tests", loader_failure())
            .script("generated_tests", loader_failure())
            .script("generated_tests", totals(3, 0)),
    );
    let stager = Arc::new(MockStager::succeeding());

    let result = orchestrator(&dir, config(), MockLlmClient::new().with_response(THREE_TESTS), &runner)
        .with_stager(stager.clone())
        .without_archive()
        .full_cycle("t1")
        .await;

    assert_eq!(stager.call_count(), 1);
    assert_eq!(runner.count("generated_tests"), 2);
    assert!(result.remediated);
    assert_eq!(result.status, CycleStatus::Failed);
    assert_eq!(result.failed_stage, Some(Stage::Test));
    assert!(result.errors.last().unwrap().contains("Runtime environment error"));
    assert!(result.errors.last().unwrap().contains("Qt6Core.dll"));

    let states: Vec<CycleState> = result.history.iter().map(|t| t.to).collect();
    assert_eq!(
        &states[states.len() - 3..],
        &[
            CycleState::Remediating,
            CycleState::Retrying,
            CycleState::Failed(Stage::Test)
        ]
    );
    assert_eq!(runner.count("gcovr"), 0);
}

#[tokio::test]
async fn test_failed_staging_does_not_relaunch() {
    let dir = project();
    let runner = Arc::new(MockCommandRunner::new().script("generated_tests", loader_failure()));
    let stager = Arc::new(MockStager::failing());

    let result = orchestrator(&dir, config(), MockLlmClient::new().with_response(THREE_TESTS), &runner)
        .with_stager(stager.clone())
        .without_archive()
        .full_cycle("t1")
        .await;

    assert_eq!(stager.call_count(), 1);
    assert_eq!(runner.count("generated_tests"), 1);
    assert!(!result.remediated);
    assert_eq!(result.failed_stage, Some(Stage::Test));
}

#[tokio::test]
async fn test_ordinary_crash_is_not_remediated() {
    let dir = project();
    let runner = Arc::new(MockCommandRunner::new().script(
        "generated_tests",
        ScriptedResponse::Output(ProcessOutput::exited(139, "", "Segmentation fault")),
    ));
    let stager = Arc::new(MockStager::succeeding());

    let result = orchestrator(&dir, config(), MockLlmClient::new().with_response(THREE_TESTS), &runner)
        .with_stager(stager.clone())
        .without_archive()
        .full_cycle("t1")
        .await;

    assert_eq!(stager.call_count(), 0);
    assert_eq!(result.status, CycleStatus::Partial);
    assert!(!result.tests.as_ref().unwrap().success);
}

// ============================================================================
// Coverage
// ============================================================================

#[tokio::test]
async fn test_shadow_build_source_is_reconciled() {
    let dir = project();
    let root = dir.path();
    fs::write(root.join("src/foo.cpp"), "int foo() { return 42; }\n").unwrap();
    fs::create_dir_all(root.join("build/debug/obj")).unwrap();

    let mut config = config();
    config.paths.object_dir = PathBuf::from("build/debug/obj");

    let runner = Arc::new(
        MockCommandRunner::new()
            .script("generated_tests", totals(3, 0))
            .script(
                "gcovr",
                ScriptedResponse::Output(ProcessOutput::exited(
                    0,
                    "lines: 10.0% (1 out of 10)\n",
                    "(WARNING) GCOV produced the following errors processing foo.gcda:\n\
                     Cannot open source file ../../foo.cpp\n",
                )),
            )
            .script(
                "gcovr",
                ScriptedResponse::OutputWithFiles(
                    ProcessOutput::ok("lines: 64.0% (16 out of 25)\nfunctions: 100.0% (2 out of 2)\n"),
                    vec![
                        (root.join("coverage/coverage.html"), "<html></html>".to_string()),
                        (
                            root.join("coverage/coverage.json"),
                            r#"{"files":[
                                {"file":"build/foo.cpp","lines":[{"line_number":1,"count":1}]},
                                {"file":"src/t1.cpp","lines":[
                                    {"line_number":3,"count":2},
                                    {"line_number":4,"count":0},
                                    {"line_number":5,"count":1},
                                    {"line_number":6,"count":1}
                                ]}
                            ]}"#
                            .to_string(),
                        ),
                        (root.join("coverage/coverage.csv"), "filename,line_total\n".to_string()),
                    ],
                ),
            ),
    );

    let result = orchestrator(&dir, config, MockLlmClient::new().with_response(THREE_TESTS), &runner)
        .full_cycle("t1")
        .await;

    assert_eq!(result.status, CycleStatus::Success, "{:?}", result.errors);
    let coverage = result.coverage.as_ref().unwrap();
    assert_eq!(coverage.passes, 2);
    assert_eq!(coverage.copied.len(), 1);
    assert_eq!(coverage.copied[0].to, root.join("build/foo.cpp"));
    assert!(coverage.unresolved.is_empty());
    assert_eq!(coverage.summary.lines, Some(64.0));
    assert!(coverage.is_complete());
    let target = result.target_coverage.as_ref().unwrap();
    assert_eq!(target.file, "src/t1.cpp");
    assert_eq!(target.lines, 75.0);
    assert_eq!(
        fs::read_to_string(root.join("build/foo.cpp")).unwrap(),
        "int foo() { return 42; }\n"
    );
    assert_eq!(runner.count("gcovr"), 2);

    let archive = result.archive_dir.as_ref().unwrap();
    assert!(archive.starts_with(root.join("reports/t1")));
    assert!(archive.join("cycle.json").is_file());
    assert!(archive.join("response.md").is_file());
}

#[test]
fn test_duplicate_basename_tie_break() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    for rel in ["src/core/deep/util.cpp", "src/b/util.cpp", "src/a/util.cpp"] {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, rel).unwrap();
    }
    let obj = root.join("build/obj");
    fs::create_dir_all(&obj).unwrap();

    let allowed: Vec<String> = extensions::SOURCES.iter().map(|e| e.to_string()).collect();
    let reconciler = Reconciler::new(root, &obj, &default_exclude_dirs(), &allowed);
    let candidates = reconciler.index_sources().remove("util.cpp").unwrap();
    assert_eq!(candidates.len(), 3);
    assert_eq!(pick_candidate(&candidates), Some(root.join("src/a/util.cpp")));

    let outcome = reconciler.reconcile(&[CoverageReference::new("../util.cpp", &obj)]);
    assert_eq!(outcome.copied.len(), 1);
    assert_eq!(
        fs::read_to_string(root.join("build/util.cpp")).unwrap(),
        "src/a/util.cpp"
    );
}

#[test]
fn test_reconciliation_never_overwrites() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src/foo.cpp"), "new").unwrap();
    let obj = root.join("build/obj");
    fs::create_dir_all(&obj).unwrap();
    fs::write(root.join("build/foo.cpp"), "existing").unwrap();

    let allowed: Vec<String> = extensions::SOURCES.iter().map(|e| e.to_string()).collect();
    let outcome = Reconciler::new(root, &obj, &default_exclude_dirs(), &allowed)
        .reconcile(&[CoverageReference::new("../foo.cpp", &obj)]);

    assert!(outcome.copied.is_empty());
    assert_eq!(outcome.resolved.len(), 1);
    assert_eq!(fs::read_to_string(root.join("build/foo.cpp")).unwrap(), "existing");
}

#[test]
fn test_reconciliation_respects_allow_list() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src/settings.ini"), "[a]").unwrap();
    let obj = root.join("build/obj");
    fs::create_dir_all(&obj).unwrap();

    let allowed: Vec<String> = extensions::SOURCES.iter().map(|e| e.to_string()).collect();
    let outcome = Reconciler::new(root, &obj, &default_exclude_dirs(), &allowed)
        .reconcile(&[CoverageReference::new("../settings.ini", &obj)]);

    assert!(outcome.copied.is_empty());
    assert_eq!(outcome.unresolved.len(), 1);
    assert!(!root.join("build/settings.ini").exists());
}

// ============================================================================
// Prompt document
// ============================================================================

#[test]
fn test_prompt_document_round_trip_is_stable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("llm_prompts.json");
    fs::write(
        &path,
        r#"{"zeta": "last", "alpha": "first\nwith \"quotes\"", "phase1_parser": "ünïcödé"}"#,
    )
    .unwrap();
    let store = PromptStore::new(&path);

    let first = store.load().unwrap();
    store.save(&first).unwrap();
    let written = fs::read_to_string(&path).unwrap();
    store.save(&store.load().unwrap()).unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), written);
    assert_eq!(store.load().unwrap(), first);
}

#[tokio::test]
async fn test_disabled_automation_is_refused() {
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
    assert_eq!(err.exit_code(), 3);
    assert!(!Path::new(&dir.path().join("tests/generated/test_t1.cpp")).exists());
}
