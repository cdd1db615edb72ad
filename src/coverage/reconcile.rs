//! Shadow-build source reconciliation.
//!
//! gcov records each source by the relative path it was compiled with. When
//! the objects live in a separate build tree those paths stop resolving from
//! the object directory and the aggregator reports the source as missing.
//! The [`Reconciler`] finds a same-named source in the project tree and
//! copies it to the path the tool expects.
//!
//! Copies are made only into build output: the object directory, a location
//! outside the project root, or an excluded directory. Existing files are
//! never overwritten.

use crate::fsutil::{normalize_path, ExcludeSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A source path referenced by coverage data, and the object directory it
/// is relative to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReference {
    pub referenced: String,
    pub object_dir: PathBuf,
}

impl CoverageReference {
    pub fn new(referenced: impl Into<String>, object_dir: impl Into<PathBuf>) -> Self {
        Self {
            referenced: referenced.into(),
            object_dir: object_dir.into(),
        }
    }

    /// Absolute path the tool expects the source at.
    pub fn expected_path(&self) -> PathBuf {
        let referenced = Path::new(&self.referenced);
        if referenced.is_absolute() {
            normalize_path(referenced)
        } else {
            normalize_path(&self.object_dir.join(referenced))
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.expected_path().exists()
    }

    fn file_name(&self) -> Option<String> {
        Path::new(&self.referenced)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// A reference that is still missing, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unresolved {
    pub reference: CoverageReference,
    pub reason: String,
}

/// A source copied into the build tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopiedSource {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub resolved: Vec<CoverageReference>,
    pub copied: Vec<CopiedSource>,
    pub unresolved: Vec<Unresolved>,
}

/// Finds and copies missing sources for one project/object-dir pair.
#[derive(Debug, Clone)]
pub struct Reconciler {
    project_root: PathBuf,
    object_dir: PathBuf,
    excludes: ExcludeSet,
    extensions: Vec<String>,
}

impl Reconciler {
    pub fn new(
        project_root: &Path,
        object_dir: &Path,
        exclude_dirs: &[String],
        extensions: &[String],
    ) -> Self {
        let project_root = normalize_path(project_root);
        let object_dir = normalize_path(object_dir);
        Self {
            excludes: ExcludeSet::new(&project_root, exclude_dirs),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            project_root,
            object_dir,
        }
    }

    fn allowed_extension(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            })
            .unwrap_or(false)
    }

    /// Candidate sources in the project tree, grouped by file name.
    ///
    /// Excluded directories and the object directory are skipped; only
    /// allow-listed extensions are indexed.
    pub fn index_sources(&self) -> BTreeMap<String, Vec<PathBuf>> {
        let skip = self.excludes.clone().with_subtree(&self.object_dir);
        let mut index: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

        let walker = WalkDir::new(&self.project_root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_type().is_dir() || !skip.skips_dir(e.path()));

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || !self.allowed_extension(entry.path()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            index.entry(name).or_default().push(entry.into_path());
        }
        index
    }

    /// Whether a copy may be written to `target`.
    pub fn copy_allowed(&self, target: &Path) -> bool {
        if target.exists() {
            return false;
        }
        let target = normalize_path(target);
        target.starts_with(&self.object_dir)
            || !target.starts_with(&self.project_root)
            || self.excludes.contains(&self.project_root, &target)
    }

    /// Resolve `references`, copying sources for the missing ones.
    pub fn reconcile(&self, references: &[CoverageReference]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut index: Option<BTreeMap<String, Vec<PathBuf>>> = None;

        for reference in references {
            let expected = reference.expected_path();
            if expected.exists() {
                outcome.resolved.push(reference.clone());
                continue;
            }

            let unresolved = |reason: &str| Unresolved {
                reference: reference.clone(),
                reason: reason.to_string(),
            };

            if !self.allowed_extension(Path::new(&reference.referenced)) {
                outcome.unresolved.push(unresolved("extension not on the allow-list"));
                continue;
            }
            let Some(name) = reference.file_name() else {
                outcome.unresolved.push(unresolved("reference has no file name"));
                continue;
            };

            let index = index.get_or_insert_with(|| self.index_sources());
            let Some(source) = index.get(&name).and_then(|c| pick_candidate(c)) else {
                outcome.unresolved.push(unresolved("no matching source in the project"));
                continue;
            };

            if !self.copy_allowed(&expected) {
                outcome
                    .unresolved
                    .push(unresolved("expected path lies in the source tree"));
                continue;
            }

            if let Some(parent) = expected.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!("Could not create {}: {}", parent.display(), e);
                    outcome.unresolved.push(unresolved("could not create target directory"));
                    continue;
                }
            }
            match std::fs::copy(&source, &expected) {
                Ok(_) => {
                    info!("Copied {} -> {}", source.display(), expected.display());
                    outcome.copied.push(CopiedSource {
                        from: source,
                        to: expected,
                    });
                }
                Err(e) => {
                    warn!("Copy to {} failed: {}", expected.display(), e);
                    outcome.unresolved.push(unresolved("copy failed"));
                }
            }
        }

        debug!(
            "Reconciliation: {} resolved, {} copied, {} unresolved",
            outcome.resolved.len(),
            outcome.copied.len(),
            outcome.unresolved.len()
        );
        outcome
    }
}

/// Fewest path components, then the lexicographically smallest path.
pub fn pick_candidate(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates
        .iter()
        .min_by(|a, b| {
            a.components()
                .count()
                .cmp(&b.components().count())
                .then_with(|| a.cmp(b))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_exclude_dirs, extensions};
    use tempfile::TempDir;

    fn write(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    fn exts() -> Vec<String> {
        extensions::SOURCES.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_expected_path_normalizes() {
        let r = CoverageReference::new("../../foo.cpp", "/work/build/obj");
        assert_eq!(r.expected_path(), PathBuf::from("/work/foo.cpp"));
        let r = CoverageReference::new("/abs/./src/bar.cpp", "/work/build/obj");
        assert_eq!(r.expected_path(), PathBuf::from("/abs/src/bar.cpp"));
    }

    #[test]
    fn test_pick_candidate_tie_break() {
        let candidates = vec![
            PathBuf::from("/p/src/widgets/foo.cpp"),
            PathBuf::from("/p/src/b/foo.cpp"),
            PathBuf::from("/p/src/a/foo.cpp"),
        ];
        assert_eq!(pick_candidate(&candidates), Some(PathBuf::from("/p/src/a/foo.cpp")));

        let candidates = vec![PathBuf::from("/p/z/deep/foo.cpp"), PathBuf::from("/p/zz/foo.cpp")];
        assert_eq!(pick_candidate(&candidates), Some(PathBuf::from("/p/zz/foo.cpp")));
        assert_eq!(pick_candidate(&[]), None);
    }

    #[test]
    fn test_copies_missing_source_into_build_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(&root.join("src/foo.cpp"), "int foo();");
        let obj = root.join("build/debug/obj");
        std::fs::create_dir_all(&obj).unwrap();

        let reconciler = Reconciler::new(root, &obj, &default_exclude_dirs(), &exts());
        let reference = CoverageReference::new("../../foo.cpp", &obj);
        let outcome = reconciler.reconcile(&[reference.clone()]);

        assert_eq!(outcome.copied.len(), 1);
        assert!(outcome.unresolved.is_empty());
        assert_eq!(outcome.copied[0].to, root.join("build/foo.cpp"));
        assert!(reference.is_resolved());
    }

    #[test]
    fn test_duplicate_basenames_pick_shallowest_then_smallest() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(&root.join("src/widgets/deep/item.cpp"), "deep");
        write(&root.join("src/b/item.cpp"), "b");
        write(&root.join("src/a/item.cpp"), "a");
        let obj = root.join("build/obj");
        std::fs::create_dir_all(&obj).unwrap();

        let reconciler = Reconciler::new(root, &obj, &default_exclude_dirs(), &exts());
        let outcome = reconciler.reconcile(&[CoverageReference::new("item.cpp", &obj)]);

        assert_eq!(outcome.copied.len(), 1);
        assert_eq!(outcome.copied[0].from, root.join("src/a/item.cpp"));
        assert_eq!(std::fs::read_to_string(obj.join("item.cpp")).unwrap(), "a");
    }

    #[test]
    fn test_never_overwrites_existing_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(&root.join("src/foo.cpp"), "source");
        let obj = root.join("build/obj");
        write(&obj.join("foo.cpp"), "already here");

        let reconciler = Reconciler::new(root, &obj, &default_exclude_dirs(), &exts());
        let outcome = reconciler.reconcile(&[CoverageReference::new("foo.cpp", &obj)]);

        assert_eq!(outcome.resolved.len(), 1);
        assert!(outcome.copied.is_empty());
        assert_eq!(std::fs::read_to_string(obj.join("foo.cpp")).unwrap(), "already here");
        assert!(!reconciler.copy_allowed(&obj.join("foo.cpp")));
    }

    #[test]
    fn test_disallowed_extension_is_never_copied() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(&root.join("src/moc_item.txt"), "x");
        let obj = root.join("build/obj");
        std::fs::create_dir_all(&obj).unwrap();

        let reconciler = Reconciler::new(root, &obj, &default_exclude_dirs(), &exts());
        let outcome = reconciler.reconcile(&[CoverageReference::new("moc_item.txt", &obj)]);

        assert!(outcome.copied.is_empty());
        assert_eq!(outcome.unresolved.len(), 1);
        assert!(!obj.join("moc_item.txt").exists());
    }

    #[test]
    fn test_refuses_to_write_into_source_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(&root.join("src/foo.cpp"), "x");
        let obj = root.join("tests/generated/debug");
        std::fs::create_dir_all(&obj).unwrap();

        let reconciler = Reconciler::new(root, &obj, &default_exclude_dirs(), &exts());
        // resolves to <root>/tests/foo.cpp, which is source tree
        let outcome = reconciler.reconcile(&[CoverageReference::new("../../foo.cpp", &obj)]);

        assert!(outcome.copied.is_empty());
        assert!(!root.join("tests/foo.cpp").exists());
        assert!(outcome.unresolved[0].reason.contains("source tree"));
    }

    #[test]
    fn test_excluded_dirs_are_not_searched() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(&root.join("3rdparty/lib/foo.cpp"), "vendored");
        write(&root.join("release/foo.cpp"), "output");
        let obj = root.join("build/obj");
        std::fs::create_dir_all(&obj).unwrap();

        let reconciler = Reconciler::new(root, &obj, &default_exclude_dirs(), &exts());
        assert!(reconciler.index_sources().get("foo.cpp").is_none());
    }

    #[test]
    fn test_object_dir_is_not_searched() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let obj = root.join("out/obj");
        write(&obj.join("moc_item.cpp"), "generated");

        let reconciler = Reconciler::new(root, &obj, &[], &exts());
        assert!(reconciler.index_sources().is_empty());
    }
}
