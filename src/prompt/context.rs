//! Source context gathered for a generation request.
//!
//! The LLM sees the code it is asked to test: the sources matching the task
//! name come first, then the qmake project files, then the remaining headers.
//! Limits are applied later, when the prompt is assembled.

use crate::error::Result;
use crate::fsutil::ExcludeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const HEADER_EXTENSIONS: &[&str] = &["h", "hh", "hpp", "hxx"];
const SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx"];

/// One file offered to the LLM as context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnippet {
    /// Path shown to the model, relative to the project root when possible
    pub path: PathBuf,
    pub text: String,
}

impl ContextSnippet {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }
}

/// Normalized file stem a task refers to.
///
/// `phase2_diagram_item` → `diagramitem`, `test_Arrow` → `arrow`.
pub fn target_stem(task: &str) -> String {
    let mut name = task.trim().to_lowercase();

    if let Some(rest) = name.strip_prefix("phase") {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0 {
            name = rest[digits..].trim_start_matches(['_', '-']).to_string();
        }
    }
    if let Some(rest) = name.strip_prefix("test_") {
        name = rest.to_string();
    }

    name.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Lowercased alphanumeric part of a file's stem, comparable with
/// [`target_stem`].
pub fn normalized_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| {
            s.to_string_lossy()
                .to_lowercase()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect()
        })
        .unwrap_or_default()
}

/// Walks the project to collect context snippets for a task.
#[derive(Debug, Clone)]
pub struct SourceContextCollector {
    root: PathBuf,
    exclude: ExcludeSet,
}

impl SourceContextCollector {
    pub fn new(root: impl Into<PathBuf>, exclude: ExcludeSet) -> Self {
        Self {
            root: root.into(),
            exclude,
        }
    }

    /// Snippets for `task`, most relevant first.
    pub fn collect(&self, task: &str) -> Result<Vec<ContextSnippet>> {
        let stem = target_stem(task);
        let mut targets = Vec::new();
        let mut projects = Vec::new();
        let mut headers = Vec::new();

        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !(e.file_type().is_dir() && self.exclude.skips_dir(e.path()))
            });

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let ext = extension_of(path);
            let file_stem = normalized_stem(path);

            let is_header = HEADER_EXTENSIONS.contains(&ext.as_str());
            let is_source = SOURCE_EXTENSIONS.contains(&ext.as_str());

            if !stem.is_empty() && file_stem == stem && (is_header || is_source) {
                targets.push((is_source, path.to_path_buf()));
            } else if ext == "pro" && entry.depth() == 1 {
                projects.push(path.to_path_buf());
            } else if is_header {
                headers.push(path.to_path_buf());
            }
        }

        // headers before their implementation files
        targets.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let ordered = targets
            .into_iter()
            .map(|(_, p)| p)
            .chain(projects)
            .chain(headers);

        let mut snippets = Vec::new();
        for path in ordered {
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    debug!("Skipping unreadable context file {}: {}", path.display(), e);
                    continue;
                }
            };
            let shown = path.strip_prefix(&self.root).unwrap_or(&path).to_path_buf();
            snippets.push(ContextSnippet::new(
                shown,
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }

        debug!(
            "Collected {} context candidates for task '{}' (target stem '{}')",
            snippets.len(),
            task,
            stem
        );
        Ok(snippets)
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
