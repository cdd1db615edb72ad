//! Coverage report locations and results.

use crate::config::CoverageConfig;
use crate::coverage::reconcile::{CopiedSource, Unresolved};
use crate::error::{QtcovError, Result};
use crate::parser::CoverageSummary;
use crate::prompt::normalized_stem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which report formats to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageOutputs {
    pub html: bool,
    pub json: bool,
    pub csv: bool,
}

impl Default for CoverageOutputs {
    fn default() -> Self {
        Self {
            html: true,
            json: true,
            csv: true,
        }
    }
}

impl From<&CoverageConfig> for CoverageOutputs {
    fn from(config: &CoverageConfig) -> Self {
        Self {
            html: config.html,
            json: config.json,
            csv: config.csv,
        }
    }
}

/// Report file paths inside the coverage directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPaths {
    pub html: Option<PathBuf>,
    pub json: Option<PathBuf>,
    pub csv: Option<PathBuf>,
}

impl ReportPaths {
    pub fn in_dir(dir: &Path, outputs: CoverageOutputs) -> Self {
        Self {
            html: outputs.html.then(|| dir.join("coverage.html")),
            json: outputs.json.then(|| dir.join("coverage.json")),
            csv: outputs.csv.then(|| dir.join("coverage.csv")),
        }
    }

    /// Requested paths, in html/json/csv order.
    pub fn all(&self) -> Vec<&Path> {
        [&self.html, &self.json, &self.csv]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .collect()
    }

    /// Requested paths that exist on disk.
    pub fn existing(&self) -> Vec<&Path> {
        self.all().into_iter().filter(|p| p.is_file()).collect()
    }
}

/// Result of one coverage collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub reports: ReportPaths,
    pub summary: CoverageSummary,
    pub copied: Vec<CopiedSource>,
    pub unresolved: Vec<Unresolved>,
    /// Number of tool invocations (1, or 2 after a reconciliation)
    pub passes: u32,
    pub exit_code: Option<i32>,
    /// Requested reports the final pass did not write
    #[serde(default)]
    pub missing: Vec<PathBuf>,
}

impl CoverageReport {
    /// The final pass exited cleanly and wrote every requested report.
    pub fn is_complete(&self) -> bool {
        self.exit_code == Some(0) && self.missing.is_empty()
    }
}

/// Line coverage of one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCoverage {
    /// Path as listed in the report
    pub file: String,
    pub lines: f64,
}

#[derive(Debug, Deserialize)]
struct JsonReport {
    #[serde(default)]
    files: Vec<JsonFile>,
}

#[derive(Debug, Deserialize)]
struct JsonFile {
    file: String,
    #[serde(default)]
    lines: Vec<JsonLine>,
}

#[derive(Debug, Deserialize)]
struct JsonLine {
    #[serde(default)]
    count: u64,
    #[serde(default, rename = "gcovr/noncode")]
    noncode: bool,
}

/// Line coverage of the file a task targets, read from a gcovr JSON
/// report.
///
/// An entry matches when its normalized file stem equals `stem` (see
/// [`crate::prompt::target_stem`]). Implementation files win over headers,
/// then report order decides. `Ok(None)` when nothing matches or the entry
/// has no code lines.
pub fn target_line_coverage(json_report: &Path, stem: &str) -> Result<Option<FileCoverage>> {
    let content = std::fs::read_to_string(json_report).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => QtcovError::NotFound {
            path: json_report.to_path_buf(),
        },
        _ => QtcovError::Io(e),
    })?;
    let report: JsonReport =
        serde_json::from_str(&content).map_err(|e| QtcovError::parse(json_report, e.to_string()))?;

    let mut matches: Vec<&JsonFile> = report
        .files
        .iter()
        .filter(|f| !stem.is_empty() && normalized_stem(Path::new(&f.file.replace('\\', "/"))) == stem)
        .collect();
    matches.sort_by_key(|f| is_header(&f.file));

    let Some(file) = matches.first() else {
        return Ok(None);
    };
    let code: Vec<&JsonLine> = file.lines.iter().filter(|l| !l.noncode).collect();
    if code.is_empty() {
        return Ok(None);
    }
    let covered = code.iter().filter(|l| l.count > 0).count();
    Ok(Some(FileCoverage {
        file: file.file.clone(),
        lines: covered as f64 * 100.0 / code.len() as f64,
    }))
}

fn is_header(file: &str) -> bool {
    let lower = file.to_lowercase();
    [".h", ".hh", ".hpp", ".hxx"].iter().any(|ext| lower.ends_with(ext))
}
