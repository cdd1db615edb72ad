//! Parsers for external tool output.
//!
//! Every tool whose textual output drives a decision sits behind a narrow
//! trait here, so switching toolchains means adding a parser, not touching
//! the orchestrator:
//!
//! - [`TestOutputParser`]: pass/fail totals printed by a test executable
//! - [`CoverageToolParser`]: unresolved-source diagnostics and the summary
//!   printed by the coverage aggregator
//! - [`detect_loader_failure`]: the dynamic loader's "entry point not found"
//!   signature that makes a test launch eligible for remediation
//!
//! # Example
//!
//! ```rust
//! use qtcov::parser::{parser_for, TestFramework};
//!
//! let parser = parser_for(TestFramework::QtTest, None).unwrap();
//! let counts = parser
//!     .parse_counts("Totals: 4 passed, 1 failed, 0 skipped, 0 blacklisted, 12ms", "")
//!     .unwrap();
//! assert_eq!(counts.passed, 4);
//! assert_eq!(counts.failed, 1);
//! ```

use crate::error::{QtcovError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Test Frameworks
// ============================================================================

/// Unit-test framework the generated sources are written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestFramework {
    /// Qt's QtTest module (`QTEST_MAIN`, `QCOMPARE`, `Totals:` line)
    #[default]
    QtTest,
    /// GoogleTest (`TEST`, `[  PASSED  ]` summary)
    GoogleTest,
}

impl fmt::Display for TestFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestFramework::QtTest => write!(f, "qttest"),
            TestFramework::GoogleTest => write!(f, "googletest"),
        }
    }
}

impl FromStr for TestFramework {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qttest" | "qtest" | "qt" => Ok(TestFramework::QtTest),
            "googletest" | "gtest" => Ok(TestFramework::GoogleTest),
            other => Err(format!(
                "Unknown test framework '{}'. Valid options: qttest, googletest",
                other
            )),
        }
    }
}

// ============================================================================
// Test Output Parsing
// ============================================================================

/// Pass/fail totals reported by a test run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
}

impl TestCounts {
    /// Number of test functions that actually ran.
    pub fn executed(&self) -> u32 {
        self.passed + self.failed
    }
}

/// Extracts pass/fail totals from a test executable's output.
pub trait TestOutputParser: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Totals found in the output, or `None` when no summary was printed.
    fn parse_counts(&self, stdout: &str, stderr: &str) -> Option<TestCounts>;
}

/// Parser driven by a single regex with `passed` and `failed` named groups.
///
/// Every matching line is summed, so executables that run several test
/// classes (one summary line each) report their combined totals.
#[derive(Debug, Clone)]
pub struct RegexTotalsParser {
    name: String,
    pattern: Regex,
}

impl RegexTotalsParser {
    /// QtTest's `Totals: N passed, M failed, ...` line.
    pub const QTTEST_TOTALS: &'static str =
        r"Totals:\s*(?P<passed>\d+)\s*passed,\s*(?P<failed>\d+)\s*failed";

    /// Build a parser, rejecting patterns without both named groups.
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| QtcovError::InvalidConfig {
            field: "tests.summary_pattern".to_string(),
            reason: e.to_string(),
        })?;

        let names: Vec<&str> = regex.capture_names().flatten().collect();
        for required in ["passed", "failed"] {
            if !names.contains(&required) {
                return Err(QtcovError::InvalidConfig {
                    field: "tests.summary_pattern".to_string(),
                    reason: format!("pattern must contain a (?P<{}>...) group", required),
                });
            }
        }

        Ok(Self {
            name: name.into(),
            pattern: regex,
        })
    }

    /// Default QtTest parser.
    pub fn qttest() -> Result<Self> {
        Self::new("qttest", Self::QTTEST_TOTALS)
    }
}

impl TestOutputParser for RegexTotalsParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse_counts(&self, stdout: &str, stderr: &str) -> Option<TestCounts> {
        let mut found = false;
        let mut counts = TestCounts::default();

        for text in [stdout, stderr] {
            for caps in self.pattern.captures_iter(text) {
                let passed = caps.name("passed").and_then(|m| m.as_str().parse::<u32>().ok());
                let failed = caps.name("failed").and_then(|m| m.as_str().parse::<u32>().ok());
                if let (Some(p), Some(f)) = (passed, failed) {
                    counts.passed += p;
                    counts.failed += f;
                    found = true;
                }
            }
        }

        found.then_some(counts)
    }
}

/// Parser for frameworks that print passed and failed totals on separate
/// lines. A missing failure line means zero failures.
#[derive(Debug, Clone)]
pub struct SplitCountsParser {
    name: String,
    passed: Regex,
    failed: Regex,
}

impl SplitCountsParser {
    /// GoogleTest's `[  PASSED  ] N tests.` / `[  FAILED  ] M tests, listed below:`.
    pub fn googletest() -> Result<Self> {
        Self::new(
            "googletest",
            r"\[\s*PASSED\s*\]\s*(\d+)\s+tests?",
            r"\[\s*FAILED\s*\]\s*(\d+)\s+tests?,",
        )
    }

    pub fn new(name: impl Into<String>, passed: &str, failed: &str) -> Result<Self> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|e| QtcovError::InvalidConfig {
                field: "tests.summary_pattern".to_string(),
                reason: e.to_string(),
            })
        };
        Ok(Self {
            name: name.into(),
            passed: compile(passed)?,
            failed: compile(failed)?,
        })
    }

    fn sum(re: &Regex, text: &str) -> Option<u32> {
        let mut total = None;
        for caps in re.captures_iter(text) {
            if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
                *total.get_or_insert(0) += n;
            }
        }
        total
    }
}

impl TestOutputParser for SplitCountsParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse_counts(&self, stdout: &str, stderr: &str) -> Option<TestCounts> {
        let combined = format!("{}\n{}", stdout, stderr);
        let passed = Self::sum(&self.passed, &combined)?;
        let failed = Self::sum(&self.failed, &combined).unwrap_or(0);
        Some(TestCounts { passed, failed })
    }
}

/// Parser for `framework`, or for a custom totals pattern when one is set.
pub fn parser_for(
    framework: TestFramework,
    custom_pattern: Option<&str>,
) -> Result<Box<dyn TestOutputParser>> {
    if let Some(pattern) = custom_pattern {
        return Ok(Box::new(RegexTotalsParser::new("custom", pattern)?));
    }
    match framework {
        TestFramework::QtTest => Ok(Box::new(RegexTotalsParser::qttest()?)),
        TestFramework::GoogleTest => Ok(Box::new(SplitCountsParser::googletest()?)),
    }
}

// ============================================================================
// Coverage Tool Parsing
// ============================================================================

/// Percentages printed by the coverage aggregator's summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub lines: Option<f64>,
    pub functions: Option<f64>,
    pub branches: Option<f64>,
}

impl CoverageSummary {
    pub fn is_empty(&self) -> bool {
        self.lines.is_none() && self.functions.is_none() && self.branches.is_none()
    }
}

impl fmt::Display for CoverageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<f64>| v.map(|p| format!("{:.1}%", p)).unwrap_or_else(|| "n/a".into());
        write!(
            f,
            "lines {}, functions {}, branches {}",
            show(self.lines),
            show(self.functions),
            show(self.branches)
        )
    }
}

/// Extracts source references and the summary from coverage tool output.
pub trait CoverageToolParser: Send + Sync {
    fn name(&self) -> &str;

    /// Source paths mentioned by diagnostics, deduplicated, in first-seen order.
    fn source_references(&self, output: &str) -> Vec<String>;

    fn summary(&self, output: &str) -> CoverageSummary;
}

/// Parser for gcovr (and the gcov messages it relays).
#[derive(Debug, Clone)]
pub struct GcovrParser {
    reference_patterns: Vec<Regex>,
    summary_patterns: [(SummaryField, Option<Regex>); 3],
}

#[derive(Debug, Clone, Copy)]
enum SummaryField {
    Lines,
    Functions,
    Branches,
}

impl Default for GcovrParser {
    fn default() -> Self {
        Self::new()
    }
}

impl GcovrParser {
    pub fn new() -> Self {
        let reference_patterns = [
            r"File '([^']+)'",
            r"[Cc]annot open source file\s+'([^']+)'",
            r#"[Cc]annot open source file\s+"([^"]+)""#,
            r"[Cc]annot open source file\s+([^\s'\x22]+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

        let summary = |p: &str| Regex::new(p).ok();
        Self {
            reference_patterns,
            summary_patterns: [
                (SummaryField::Lines, summary(r"(?mi)^\s*lines:\s*([\d.]+)%")),
                (SummaryField::Functions, summary(r"(?mi)^\s*functions:\s*([\d.]+)%")),
                (SummaryField::Branches, summary(r"(?mi)^\s*branches:\s*([\d.]+)%")),
            ],
        }
    }
}

impl CoverageToolParser for GcovrParser {
    fn name(&self) -> &str {
        "gcovr"
    }

    fn source_references(&self, output: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for line in output.lines() {
            for re in &self.reference_patterns {
                if let Some(path) = re.captures(line).and_then(|c| c.get(1)) {
                    let path = path.as_str().trim().trim_end_matches(['.', ',', ':']);
                    if !path.is_empty() && !seen.iter().any(|s: &String| s == path) {
                        seen.push(path.to_string());
                    }
                    break;
                }
            }
        }
        seen
    }

    fn summary(&self, output: &str) -> CoverageSummary {
        let mut summary = CoverageSummary::default();
        for (field, re) in &self.summary_patterns {
            let value = re
                .as_ref()
                .and_then(|re| re.captures(output))
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok());
            match field {
                SummaryField::Lines => summary.lines = value,
                SummaryField::Functions => summary.functions = value,
                SummaryField::Branches => summary.branches = value,
            }
        }
        summary
    }
}

// ============================================================================
// Loader Failure Detection
// ============================================================================

/// `STATUS_ENTRYPOINT_NOT_FOUND`
pub const STATUS_ENTRYPOINT_NOT_FOUND: u32 = 0xC000_0139;
/// `STATUS_DLL_NOT_FOUND`
pub const STATUS_DLL_NOT_FOUND: u32 = 0xC000_0135;

/// A launch aborted by the dynamic loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderFailure {
    /// Library the loader complained about, when it named one
    pub library: Option<String>,
    pub reason: String,
}

/// Recognize the "entry point not found" family of loader failures.
///
/// Matches the Windows NTSTATUS exit codes as well as the messages printed
/// by the Windows, glibc and dyld loaders.
pub fn detect_loader_failure(
    exit_code: Option<i32>,
    stdout: &str,
    stderr: &str,
) -> Option<LoaderFailure> {
    let text = format!("{}\n{}", stderr, stdout);
    let library = named_library(&text);

    if let Some(code) = exit_code {
        let status = code as u32;
        if status == STATUS_ENTRYPOINT_NOT_FOUND || status == STATUS_DLL_NOT_FOUND {
            let reason = if status == STATUS_ENTRYPOINT_NOT_FOUND {
                "entry point not found (0xC0000139)"
            } else {
                "dynamic library not found (0xC0000135)"
            };
            return Some(LoaderFailure {
                library,
                reason: reason.to_string(),
            });
        }
    }

    let lower = text.to_lowercase();
    let signatures = [
        "entry point not found",
        "could not be located in the dynamic link library",
        "the specified procedure could not be found",
        "error while loading shared libraries",
        "library not loaded",
        "was not found. reinstalling the program may fix this problem",
    ];
    signatures
        .iter()
        .find(|s| lower.contains(*s))
        .map(|s| LoaderFailure {
            library,
            reason: s.to_string(),
        })
}

fn named_library(text: &str) -> Option<String> {
    let patterns = [
        r"(?i)dynamic link library\s+(\S+?)\.?\s*$",
        r"(?i)because\s+(\S+\.dll)\s+was not found",
        r"(?i)error while loading shared libraries:\s*([^:\s]+)",
        r"(?i)library not loaded:\s*(\S+)",
    ];
    let compiled: Vec<Regex> = patterns
        .iter()
        .filter_map(|p| Regex::new(&format!("(?m){}", p)).ok())
        .collect();

    for re in &compiled {
        if let Some(m) = re.captures(text).and_then(|c| c.get(1)) {
            let raw = m.as_str().trim_end_matches('.');
            let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}
