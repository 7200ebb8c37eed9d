//! The in-memory mapping from project-relative path to file descriptor —
//! "what builders see". Populated by an initial scan, thereafter mutated
//! only by the FS-event aggregator (`crate::watch`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// A single file known to the index. Identity is `rel_path`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDescriptor {
    pub rel_path: PathBuf,
    pub mode: u32,
    pub fs_path: PathBuf,
}

/// The file index, plus the ignore filter used to populate it.
#[derive(Clone, Debug)]
pub struct FileIndex {
    root: PathBuf,
    files: HashMap<PathBuf, FileDescriptor>,
    ignore: GlobSet,
}

impl FileIndex {
    /// Build an ignore set from a flat list of glob patterns (no layered
    /// `.gitignore` semantics — see SPEC_FULL.md §4.1).
    pub fn build_ignore(patterns: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern).with_context(|| format!("invalid ignore glob {pattern:?}"))?);
        }
        builder.build().context("error compiling ignore globset")
    }

    /// Enumerate `root` on startup, respecting `ignore`, and stat each path.
    #[tracing::instrument(level = "trace", skip(ignore))]
    pub fn scan(root: &Path, ignore: GlobSet) -> Result<Self> {
        let mut files = HashMap::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("error reading directory {}", dir.display()))?;
            for entry in entries {
                let entry = entry.context("error reading directory entry")?;
                let path = entry.path();
                let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                if ignore.is_match(&rel) {
                    continue;
                }
                let file_type = entry.file_type().context("error reading file type")?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    let meta = entry.metadata().context("error reading metadata")?;
                    files.insert(
                        rel.clone(),
                        FileDescriptor {
                            rel_path: rel,
                            mode: file_mode(&meta),
                            fs_path: path,
                        },
                    );
                }
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            files,
            ignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_ignored(&self, rel: &Path) -> bool {
        self.ignore.is_match(rel)
    }

    pub fn get(&self, rel: &Path) -> Option<&FileDescriptor> {
        self.files.get(rel)
    }

    pub fn contains(&self, rel: &Path) -> bool {
        self.files.contains_key(rel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.files.values()
    }

    /// A shallow-copy snapshot handed to builders, per §4.1.
    pub fn snapshot(&self) -> HashMap<PathBuf, FileDescriptor> {
        self.files.clone()
    }

    /// Refresh a single path after an `add`/`change` event. If the path no
    /// longer exists on disk (`ENOENT`), treat it as a removal instead, per
    /// §4.3 step 2.
    pub fn refresh(&mut self, rel: PathBuf) -> RefreshOutcome {
        if self.is_ignored(&rel) {
            return RefreshOutcome::Ignored;
        }
        let fs_path = self.root.join(&rel);
        match std::fs::metadata(&fs_path) {
            Ok(meta) if meta.is_file() => {
                self.files.insert(
                    rel.clone(),
                    FileDescriptor {
                        rel_path: rel.clone(),
                        mode: file_mode(&meta),
                        fs_path,
                    },
                );
                RefreshOutcome::Changed(rel)
            }
            _ => {
                self.files.remove(&rel);
                RefreshOutcome::Removed(rel)
            }
        }
    }

    /// Drop a path from the index after an `unlink` event.
    pub fn remove(&mut self, rel: &Path) -> bool {
        self.files.remove(rel).is_some()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Changed(PathBuf),
    Removed(PathBuf),
    Ignored,
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_respects_ignore_patterns() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("index.html"), "hi").unwrap();
        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();

        let ignore = FileIndex::build_ignore(&[".git/**".to_string(), ".git".to_string()]).unwrap();
        let index = FileIndex::scan(tmp.path(), ignore).unwrap();

        assert!(index.contains(Path::new("index.html")));
        assert!(!index.contains(Path::new(".git/HEAD")));
    }

    #[test]
    fn refresh_treats_missing_path_as_removal() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let ignore = FileIndex::build_ignore(&[]).unwrap();
        let mut index = FileIndex::scan(tmp.path(), ignore).unwrap();
        assert!(index.contains(Path::new("a.txt")));

        std::fs::remove_file(tmp.path().join("a.txt")).unwrap();
        let outcome = index.refresh(PathBuf::from("a.txt"));
        assert_eq!(outcome, RefreshOutcome::Removed(PathBuf::from("a.txt")));
        assert!(!index.contains(Path::new("a.txt")));
    }

    #[test]
    fn snapshot_is_a_shallow_copy() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let ignore = FileIndex::build_ignore(&[]).unwrap();
        let index = FileIndex::scan(tmp.path(), ignore).unwrap();
        let snap = index.snapshot();
        assert_eq!(snap.len(), 1);
    }
}
