//! Per-run archive of a cycle.
//!
//! Each full cycle leaves `reports/<task>/<YYYYmmdd_HHMMSS>/` behind with
//! the prompt, the raw answer, the generated test, copies of the coverage
//! reports and `cycle.json`.

use crate::cycle::CycleResult;
use crate::error::Result;
use crate::fsutil::write_atomic;
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Writes cycle archives below a reports directory.
#[derive(Debug, Clone)]
pub struct CycleArchive {
    reports_dir: PathBuf,
}

impl CycleArchive {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    /// Directory for `task` at `at`; a numeric suffix avoids collisions
    /// within the same second.
    pub fn archive_dir(&self, task: &str, at: DateTime<Local>) -> PathBuf {
        let base = self
            .reports_dir
            .join(sanitize(task))
            .join(at.format("%Y%m%d_%H%M%S").to_string());
        if !base.exists() {
            return base;
        }
        let mut n = 1;
        loop {
            let candidate = base.with_file_name(format!(
                "{}_{}",
                at.format("%Y%m%d_%H%M%S"),
                n
            ));
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }

    /// Write the archive for `result`; returns its directory.
    pub fn write(
        &self,
        result: &CycleResult,
        prompt: Option<&str>,
        response: Option<&str>,
    ) -> Result<PathBuf> {
        let dir = self.archive_dir(&result.task, Local::now());
        fs::create_dir_all(&dir)?;

        if let Some(prompt) = prompt {
            write_atomic(&dir.join("prompt.md"), prompt.as_bytes())?;
        }
        if let Some(response) = response {
            write_atomic(&dir.join("response.md"), response.as_bytes())?;
        }

        if let Some(test_file) = result.generation.as_ref().and_then(|g| g.file_path.as_deref()) {
            copy_into(test_file, &dir);
        }
        if let Some(coverage) = &result.coverage {
            let coverage_dir = dir.join("coverage");
            for report in coverage.reports.existing() {
                if fs::create_dir_all(&coverage_dir).is_ok() {
                    copy_into(report, &coverage_dir);
                }
            }
        }

        let json = serde_json::to_string_pretty(result)?;
        write_atomic(&dir.join("cycle.json"), json.as_bytes())?;

        info!("Archived cycle to {}", dir.display());
        Ok(dir)
    }
}

fn copy_into(file: &Path, dir: &Path) {
    let Some(name) = file.file_name() else {
        return;
    };
    match fs::copy(file, dir.join(name)) {
        Ok(_) => debug!("Archived {}", file.display()),
        Err(e) => warn!("Could not archive {}: {}", file.display(), e),
    }
}

fn sanitize(task: &str) -> String {
    let cleaned: String = task
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "task".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::GenerationResult;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_archive_dir_layout() {
        let archive = CycleArchive::new("/p/reports");
        let at = Local.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        assert_eq!(
            archive.archive_dir("phase 1/x", at),
            PathBuf::from("/p/reports/phase_1_x/20260314_092653")
        );
    }

    #[test]
    fn test_archive_dir_avoids_collisions() {
        let dir = TempDir::new().unwrap();
        let archive = CycleArchive::new(dir.path());
        let at = Local.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let first = archive.archive_dir("t1", at);
        fs::create_dir_all(&first).unwrap();
        let second = archive.archive_dir("t1", at);
        assert_eq!(second.file_name().unwrap(), "20260314_092653_1");
    }

    #[test]
    fn test_write_archive() {
        let dir = TempDir::new().unwrap();
        let test_file = dir.path().join("test_t1.cpp");
        fs::write(&test_file, "void testA();").unwrap();

        let mut result = CycleResult::new("t1");
        result.generation = Some(GenerationResult::saved("t1", test_file, 1, "raw"));

        let archive = CycleArchive::new(dir.path().join("reports"));
        let out = archive.write(&result, Some("prompt"), Some("answer")).unwrap();

        assert_eq!(fs::read_to_string(out.join("prompt.md")).unwrap(), "prompt");
        assert_eq!(fs::read_to_string(out.join("response.md")).unwrap(), "answer");
        assert!(out.join("test_t1.cpp").exists());
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join("cycle.json")).unwrap()).unwrap();
        assert_eq!(json["task"], "t1");
        assert_eq!(json["status"], "failed");
    }
}
