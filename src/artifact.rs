//! Extracting a test source from an LLM answer and writing it to disk.
//!
//! The answer is searched for one compilable unit (preferably a fenced
//! block tagged with the target language), checked for test-framework
//! markers, and written under a name derived from the task.

use crate::error::QtcovError;
use crate::fsutil::write_atomic;
use crate::parser::TestFramework;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Fence language tags accepted as C++.
pub const CPP_FENCE_TAGS: &[&str] = &["cpp", "c++", "cxx", "cc"];

// ============================================================================
// Generation Result
// ============================================================================

/// Outcome of one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub task: String,
    pub success: bool,
    pub file_path: Option<PathBuf>,
    /// Number of test-case markers in the written file
    pub tests_generated: u32,
    pub raw_response: String,
    pub error: Option<String>,
}

impl GenerationResult {
    pub fn saved(task: &str, path: PathBuf, tests: u32, raw: &str) -> Self {
        Self {
            task: task.to_string(),
            success: true,
            file_path: Some(path),
            tests_generated: tests,
            raw_response: raw.to_string(),
            error: None,
        }
    }

    pub fn failed(task: &str, raw: &str, error: &QtcovError) -> Self {
        Self {
            task: task.to_string(),
            success: false,
            file_path: None,
            tests_generated: 0,
            raw_response: raw.to_string(),
            error: Some(error.to_string()),
        }
    }
}

// ============================================================================
// Markers
// ============================================================================

/// Syntactic signals identifying a test suite and its test cases.
#[derive(Debug, Clone)]
pub struct MarkerSet {
    framework: TestFramework,
    entry_point: Vec<Regex>,
    test_case: Option<Regex>,
}

impl MarkerSet {
    pub fn for_framework(framework: TestFramework) -> Self {
        let (entry, case): (&[&str], &str) = match framework {
            TestFramework::QtTest => (
                &[r"\bQTEST_(?:APPLESS_|GUILESS_)?MAIN\s*\(", r"#include\s*[<\x22]QtTest"],
                r"\bvoid\s+(test\w*)\s*\(",
            ),
            TestFramework::GoogleTest => (
                &[r"#include\s*[<\x22]gtest/gtest\.h", r"\bRUN_ALL_TESTS\s*\("],
                r"\b(TEST|TEST_F|TEST_P|TYPED_TEST)\s*\(",
            ),
        };
        Self {
            framework,
            entry_point: entry.iter().filter_map(|p| Regex::new(p).ok()).collect(),
            test_case: Regex::new(case).ok(),
        }
    }

    pub fn framework(&self) -> TestFramework {
        self.framework
    }

    /// Whether `code` carries a suite entry point or framework include.
    pub fn has_entry_point(&self, code: &str) -> bool {
        self.entry_point.iter().any(|re| re.is_match(code))
    }

    /// Number of test-case markers. QtTest `_data` providers are not tests.
    pub fn count_test_cases(&self, code: &str) -> u32 {
        let Some(re) = &self.test_case else {
            return 0;
        };
        re.captures_iter(code)
            .filter(|c| {
                c.get(1)
                    .map(|m| !m.as_str().ends_with("_data"))
                    .unwrap_or(true)
            })
            .count() as u32
    }

    fn has_any(&self, code: &str) -> bool {
        self.has_entry_point(code) || self.count_test_cases(code) > 0
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// A fenced block: lowercase language tag and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    pub tag: String,
    pub body: String,
}

/// All fenced blocks in order of appearance.
pub fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let Ok(re) = Regex::new(r"(?s)```[ \t]*([A-Za-z0-9+#._-]*)[^\n]*\n(.*?)```") else {
        return Vec::new();
    };
    re.captures_iter(text)
        .map(|c| FencedBlock {
            tag: c.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default(),
            body: c.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
        .collect()
}

/// Pick the source unit out of an answer.
///
/// Order: first block tagged as C++, first untagged block carrying a
/// framework marker, then the whole answer when it has no fences at all and
/// contains an entry point.
pub fn extract_code(response: &str, markers: &MarkerSet) -> Option<String> {
    let blocks = fenced_blocks(response);

    let chosen = blocks
        .iter()
        .find(|b| CPP_FENCE_TAGS.contains(&b.tag.as_str()))
        .or_else(|| blocks.iter().find(|b| b.tag.is_empty() && markers.has_any(&b.body)))
        .map(|b| b.body.clone());

    match chosen {
        Some(code) => Some(code),
        None if blocks.is_empty() && markers.has_entry_point(response) => {
            Some(response.to_string())
        }
        None => None,
    }
    .map(|code| code.trim().to_string())
    .filter(|code| !code.is_empty())
}

/// Deterministic file name for a task: `test_<sanitized>.cpp`.
pub fn test_file_name(task: &str) -> String {
    let mut sanitized = String::new();
    for c in task.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c);
        } else if !sanitized.ends_with('_') {
            sanitized.push('_');
        }
    }
    let sanitized = sanitized.trim_matches('_');
    let sanitized = if sanitized.is_empty() { "task" } else { sanitized };

    if sanitized.starts_with("test_") {
        format!("{}.cpp", sanitized)
    } else {
        format!("test_{}.cpp", sanitized)
    }
}

/// Complete a QtTest source so it builds as a standalone test executable.
///
/// Adds `QTEST_MAIN(<Class>)` when no entry point exists and points the moc
/// include at the file's own stem.
pub fn complete_qttest_source(code: &str, stem: &str) -> String {
    let mut out = code.to_string();
    let moc_include = format!("#include \"{}.moc\"", stem);

    let has_main = Regex::new(r"\bQTEST_(?:APPLESS_|GUILESS_)?MAIN\s*\(")
        .map(|re| re.is_match(&out))
        .unwrap_or(true);
    if !has_main {
        let class = Regex::new(r"class\s+(\w+)\s*:\s*public\s+QObject")
            .ok()
            .and_then(|re| re.captures(&out).and_then(|c| c.get(1)))
            .map(|m| m.as_str().to_string());
        match class {
            Some(class) => {
                debug!("Adding QTEST_MAIN({}) to generated source", class);
                out = format!("{}\n\nQTEST_MAIN({})\n", out.trim_end(), class);
            }
            None => warn!("Generated source has no QTEST_MAIN and no QObject test class"),
        }
    }

    if let Ok(re) = Regex::new(r#"#include\s*"[^"]+\.moc""#) {
        if re.is_match(&out) {
            out = re.replace_all(&out, moc_include.as_str()).into_owned();
        } else if !has_main || out.contains("Q_OBJECT") {
            out = format!("{}\n{}\n", out.trim_end(), moc_include);
        }
    }

    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

// ============================================================================
// Writer
// ============================================================================

/// Writes generated test sources.
#[derive(Debug, Clone)]
pub struct TestArtifactWriter {
    markers: MarkerSet,
}

impl Default for TestArtifactWriter {
    fn default() -> Self {
        Self::new(TestFramework::QtTest)
    }
}

impl TestArtifactWriter {
    pub fn new(framework: TestFramework) -> Self {
        Self {
            markers: MarkerSet::for_framework(framework),
        }
    }

    pub fn markers(&self) -> &MarkerSet {
        &self.markers
    }

    /// Extract the test source from `response_text` and write it into
    /// `destination_dir`. Never panics or propagates; failures are reported
    /// in the returned result and leave the directory untouched.
    pub fn extract_and_save(
        &self,
        response_text: &str,
        destination_dir: &Path,
        task_name: &str,
    ) -> GenerationResult {
        let Some(code) = extract_code(response_text, &self.markers) else {
            let err = QtcovError::extraction("response contains no recognizable test source");
            warn!("Task '{}': {}", task_name, err);
            return GenerationResult::failed(task_name, response_text, &err);
        };

        let tests = self.markers.count_test_cases(&code);
        if tests == 0 {
            let err = QtcovError::extraction(format!(
                "code block contains no {} test cases",
                self.markers.framework()
            ));
            warn!("Task '{}': {}", task_name, err);
            return GenerationResult::failed(task_name, response_text, &err);
        }

        let file_name = test_file_name(task_name);
        let path = destination_dir.join(&file_name);
        let contents = match self.markers.framework() {
            TestFramework::QtTest => {
                let stem = file_name.trim_end_matches(".cpp");
                complete_qttest_source(&code, stem)
            }
            TestFramework::GoogleTest => format!("{}\n", code.trim_end()),
        };

        if let Err(e) = write_atomic(&path, contents.as_bytes()) {
            let err = QtcovError::from(e);
            warn!("Task '{}': failed to write {}: {}", task_name, path.display(), err);
            return GenerationResult::failed(task_name, response_text, &err);
        }

        info!(
            "Saved {} with {} test cases for task '{}'",
            path.display(),
            tests,
            task_name
        );
        GenerationResult::saved(task_name, path, tests, response_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const THREE_TESTS: &str = r#"Here are the tests:

```cpp
#include <QtTest>
#include "diagramitem.h"

class TestDiagramItem : public QObject
{
    Q_OBJECT
private slots:
    void testConstruction();
    void testAddArrow();
    void testRemoveArrow_data();
    void testRemoveArrow();
};

void TestDiagramItem::testConstruction() { QVERIFY(true); }
void TestDiagramItem::testAddArrow() { QCOMPARE(1, 1); }
void TestDiagramItem::testRemoveArrow_data() {}
void TestDiagramItem::testRemoveArrow() { QCOMPARE(2, 2); }

QTEST_MAIN(TestDiagramItem)
#include "tst_diagramitem.moc"
```

Let me know if you need more."#;

    #[test]
    fn test_extract_three_markers() {
        let dir = TempDir::new().unwrap();
        let writer = TestArtifactWriter::default();
        let result = writer.extract_and_save(THREE_TESTS, dir.path(), "t1");

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.tests_generated, 3);
        let path = result.file_path.unwrap();
        assert_eq!(path, dir.path().join("test_t1.cpp"));
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("#include \"test_t1.moc\""));
        assert!(!written.contains("tst_diagramitem.moc"));
        assert!(!written.contains("Let me know"));
    }

    #[test]
    fn test_prose_is_rejected_without_writing() {
        let dir = TempDir::new().unwrap();
        let result = TestArtifactWriter::default().extract_and_save(
            "I cannot help with that, but testing is important.",
            dir.path(),
            "t1",
        );
        assert!(!result.success);
        assert!(result.file_path.is_none());
        assert!(result.error.unwrap().contains("no recognizable test source"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_code_without_test_cases_is_rejected() {
        let dir = TempDir::new().unwrap();
        let response = "```cpp\nint add(int a, int b) { return a + b; }\n```";
        let result = TestArtifactWriter::default().extract_and_save(response, dir.path(), "t1");
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no qttest test cases"));
        assert!(!dir.path().join("test_t1.cpp").exists());
    }

    #[test]
    fn test_unfenced_response_with_entry_point() {
        let response = "#include <QtTest>\nclass T : public QObject { Q_OBJECT\nprivate slots:\n void testA() {}\n};\nQTEST_MAIN(T)\n";
        let code = extract_code(response, &MarkerSet::for_framework(TestFramework::QtTest)).unwrap();
        assert!(code.starts_with("#include <QtTest>"));
    }

    #[test]
    fn test_unfenced_response_without_entry_point_is_none() {
        let markers = MarkerSet::for_framework(TestFramework::QtTest);
        assert!(extract_code("void testA() { }", &markers).is_none());
    }

    #[test]
    fn test_prefers_cpp_tag_over_earlier_blocks() {
        let response = "```bash\nqmake && make\n```\n```\nvoid testIgnored() {}\n```\n```C++\nvoid testChosen() {}\n```";
        let markers = MarkerSet::for_framework(TestFramework::QtTest);
        assert_eq!(extract_code(response, &markers).unwrap(), "void testChosen() {}");
    }

    #[test]
    fn test_untagged_block_with_markers_is_fallback() {
        let response = "```python\nprint('x')\n```\n```\nvoid testFallback() {}\n```";
        let markers = MarkerSet::for_framework(TestFramework::QtTest);
        assert_eq!(extract_code(response, &markers).unwrap(), "void testFallback() {}");
    }

    #[test]
    fn test_fenced_foreign_language_only_is_none() {
        let response = "```python\nQTEST_MAIN(x)\n```";
        let markers = MarkerSet::for_framework(TestFramework::QtTest);
        assert!(extract_code(response, &markers).is_none());
    }

    #[test]
    fn test_count_ignores_data_functions_and_lifecycle_slots() {
        let markers = MarkerSet::for_framework(TestFramework::QtTest);
        let code = "void initTestCase();\nvoid testA();\nvoid testA_data();\nvoid cleanupTestCase();\nvoid testB ();";
        assert_eq!(markers.count_test_cases(code), 2);
    }

    #[test]
    fn test_googletest_markers() {
        let markers = MarkerSet::for_framework(TestFramework::GoogleTest);
        let code = "#include <gtest/gtest.h>\nTEST(Shape, Area) {}\nTEST_F(Fixture, Works) {}\n";
        assert!(markers.has_entry_point(code));
        assert_eq!(markers.count_test_cases(code), 2);
    }

    #[test]
    fn test_file_name_is_deterministic() {
        assert_eq!(test_file_name("t1"), "test_t1.cpp");
        assert_eq!(test_file_name("Phase 1: Diagram-Item"), "test_phase_1_diagram_item.cpp");
        assert_eq!(test_file_name("test_arrow"), "test_arrow.cpp");
        assert_eq!(test_file_name("???"), "test_task.cpp");
    }

    #[test]
    fn test_overwrites_previous_file() {
        let dir = TempDir::new().unwrap();
        let writer = TestArtifactWriter::default();
        writer.extract_and_save(THREE_TESTS, dir.path(), "t1");
        let second = "```cpp\nclass T : public QObject { Q_OBJECT\nprivate slots:\n void testOnly();\n};\n```";
        let result = writer.extract_and_save(second, dir.path(), "t1");
        assert!(result.success);
        assert_eq!(result.tests_generated, 1);
        let written = std::fs::read_to_string(dir.path().join("test_t1.cpp")).unwrap();
        assert!(written.contains("testOnly"));
        assert!(!written.contains("testAddArrow"));
    }

    #[test]
    fn test_complete_qttest_source_adds_main_and_moc() {
        let code = "class TestArrow : public QObject\n{\n    Q_OBJECT\nprivate slots:\n    void testA() {}\n};";
        let completed = complete_qttest_source(code, "test_arrow");
        assert!(completed.contains("QTEST_MAIN(TestArrow)"));
        assert!(completed.trim_end().ends_with("#include \"test_arrow.moc\""));
    }

    #[test]
    fn test_complete_qttest_source_keeps_existing_main() {
        let code = "class T : public QObject { Q_OBJECT };\nQTEST_APPLESS_MAIN(T)\n#include \"other.moc\"";
        let completed = complete_qttest_source(code, "test_t");
        assert_eq!(completed.matches("MAIN(").count(), 1);
        assert!(completed.contains("#include \"test_t.moc\""));
    }
}
