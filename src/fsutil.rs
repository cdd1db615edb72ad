//! Small filesystem helpers shared by the writers.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Write `contents` to `path` by writing a sibling temp file and renaming it.
///
/// Readers never observe a partially written file; on failure the previous
/// contents (if any) stay in place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let tmp = parent.join(format!(".{}.tmp-{}", file_name, std::process::id()));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// `..` at the root is dropped, so `/obj/../../foo.cpp` becomes `/foo.cpp`.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = match out.components().next_back() {
                    Some(Component::Normal(_)) => out.pop(),
                    Some(Component::RootDir) | Some(Component::Prefix(_)) => true,
                    _ => false,
                };
                if !popped {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Directories skipped during tree walks.
///
/// Single-component entries (`build`, `.git`) match a directory of that name
/// anywhere below the root; multi-component or absolute entries
/// (`tests/generated`) match that exact subtree.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    names: Vec<String>,
    prefixes: Vec<PathBuf>,
}

impl ExcludeSet {
    pub fn new(root: &Path, entries: &[String]) -> Self {
        let mut set = Self::default();
        for entry in entries {
            let path = Path::new(entry.trim_end_matches(['/', '\\']));
            if path.is_absolute() {
                set.prefixes.push(normalize_path(path));
            } else if path.components().count() > 1 {
                set.prefixes.push(normalize_path(&root.join(path)));
            } else if !entry.is_empty() {
                set.names.push(path.to_string_lossy().to_lowercase());
            }
        }
        set
    }

    /// Also exclude the subtree rooted at `path`.
    #[must_use]
    pub fn with_subtree(mut self, path: &Path) -> Self {
        self.prefixes.push(normalize_path(path));
        self
    }

    /// Whether a directory reached during a walk should be skipped.
    pub fn skips_dir(&self, dir: &Path) -> bool {
        let by_name = dir
            .file_name()
            .map(|n| {
                let n = n.to_string_lossy().to_lowercase();
                self.names.iter().any(|x| *x == n)
            })
            .unwrap_or(false);
        by_name || self.under_prefix(dir)
    }

    /// Whether `path` lies inside an excluded directory below `root`.
    pub fn contains(&self, root: &Path, path: &Path) -> bool {
        if self.under_prefix(path) {
            return true;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        let mut components: Vec<_> = relative.components().collect();
        // the last component is the file itself
        components.pop();
        components.iter().any(|c| {
            let name = c.as_os_str().to_string_lossy().to_lowercase();
            self.names.iter().any(|x| *x == name)
        })
    }

    fn under_prefix(&self, path: &Path) -> bool {
        let path = normalize_path(path);
        self.prefixes.iter().any(|p| path.starts_with(p))
    }
}

/// Last `max_lines` lines of `text`, used for failure diagnostics.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
