//! Persistent task → prompt document.
//!
//! The document is a flat JSON object whose values are prompt strings. It is
//! always read and written whole; writes go through a temp file and rename,
//! under an advisory lock on a sibling `.lock` file.

use crate::error::{QtcovError, Result};
use crate::fsutil::write_atomic;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Task name → prompt text, ordered by task name.
pub type PromptMap = BTreeMap<String, String>;

/// What `load_with` does when the document does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Absence is a [`QtcovError::NotFound`].
    Existing,
    /// Write an empty document and return an empty map.
    CreateIfMissing,
}

/// File-backed prompt document.
#[derive(Debug, Clone)]
pub struct PromptStore {
    path: PathBuf,
}

impl PromptStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document; absence is an error.
    pub fn load(&self) -> Result<PromptMap> {
        self.load_with(LoadMode::Existing)
    }

    pub fn load_with(&self, mode: LoadMode) -> Result<PromptMap> {
        if !self.path.exists() {
            return match mode {
                LoadMode::Existing => Err(QtcovError::NotFound {
                    path: self.path.clone(),
                }),
                LoadMode::CreateIfMissing => {
                    info!("Creating empty prompt document at {}", self.path.display());
                    let empty = PromptMap::new();
                    self.save(&empty)?;
                    Ok(empty)
                }
            };
        }

        let content = fs::read_to_string(&self.path)?;
        let prompts = parse_document(&self.path, &content)?;
        debug!("Loaded {} prompts from {}", prompts.len(), self.path.display());
        Ok(prompts)
    }

    /// Replace the whole document.
    pub fn save(&self, prompts: &PromptMap) -> Result<()> {
        self.with_lock(|| self.write_unlocked(prompts))
    }

    /// Overlay `custom` onto the stored prompts and persist the result.
    ///
    /// A missing document counts as empty. Entries in `custom` win.
    pub fn merge(&self, custom: PromptMap) -> Result<PromptMap> {
        self.with_lock(|| {
            let mut merged = if self.path.exists() {
                self.load()?
            } else {
                PromptMap::new()
            };
            let added = custom.len();
            merged.extend(custom);
            self.write_unlocked(&merged)?;
            info!(
                "Merged {} prompts into {} ({} total)",
                added,
                self.path.display(),
                merged.len()
            );
            Ok(merged)
        })
    }

    /// Insert or replace one prompt.
    pub fn set(&self, task: &str, prompt: &str) -> Result<PromptMap> {
        let mut single = PromptMap::new();
        single.insert(task.to_string(), prompt.to_string());
        self.merge(single)
    }

    /// Prompt text for `task`.
    pub fn get(&self, task: &str) -> Result<String> {
        let prompts = self.load()?;
        prompts
            .get(task)
            .cloned()
            .ok_or_else(|| QtcovError::UnknownTask {
                task: task.to_string(),
                available: prompts.keys().cloned().collect(),
            })
    }

    fn write_unlocked(&self, prompts: &PromptMap) -> Result<()> {
        let mut json = serde_json::to_string_pretty(prompts)?;
        json.push('\n');
        write_atomic(&self.path, json.as_bytes())?;
        debug!("Saved {} prompts to {}", prompts.len(), self.path.display());
        Ok(())
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock.lock_exclusive()?;
        let result = f();
        FileExt::unlock(&lock)?;
        result
    }
}

fn parse_document(path: &Path, content: &str) -> Result<PromptMap> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| QtcovError::parse(path, e.to_string()))?;

    let object = value
        .as_object()
        .ok_or_else(|| QtcovError::parse(path, "expected a JSON object of task → prompt"))?;

    let mut prompts = PromptMap::new();
    for (task, prompt) in object {
        let text = prompt.as_str().ok_or_else(|| {
            QtcovError::parse(path, format!("prompt for '{}' is not a string", task))
        })?;
        prompts.insert(task.clone(), text.to_string());
    }
    Ok(prompts)
}
