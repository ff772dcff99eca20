//! Staging directories shared by the pipeline.
//!
//! The image tree, the diagnostics directory and the disk-image directory are
//! modelled as named [`StagingDirectory`] handles. Each one must exist before
//! any step that writes into it runs; normal builds never tear them down.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// A directory that must exist before artifacts are written into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingDirectory {
    name: &'static str,
    path: PathBuf,
}

impl StagingDirectory {
    pub fn new(name: &'static str, path: impl Into<PathBuf>) -> Self {
        Self {
            name,
            path: path.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory if absent. Idempotent.
    pub fn ensure(&self) -> Result<&Path> {
        if !self.path.is_dir() {
            log::debug!("creating {} directory {}", self.name, self.path.display());
            fs::create_dir_all(&self.path).with_context(|| {
                format!(
                    "creating {} directory '{}'",
                    self.name,
                    self.path.display()
                )
            })?;
        }
        Ok(&self.path)
    }
}

/// Resolved output layout for one repository.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
    pub image_tree: StagingDirectory,
    pub debug_dir: StagingDirectory,
    pub disk_dir: StagingDirectory,
}

impl Layout {
    pub fn new(root: &Path, image_tree: &Path, debug_dir: &Path, disk_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            image_tree: StagingDirectory::new("image tree", resolve(root, image_tree)),
            debug_dir: StagingDirectory::new("debug log", resolve(root, debug_dir)),
            disk_dir: StagingDirectory::new("disk image", resolve(root, disk_dir)),
        }
    }

    pub fn directories(&self) -> [&StagingDirectory; 3] {
        [&self.image_tree, &self.debug_dir, &self.disk_dir]
    }

    /// Ensure every staging directory exists.
    pub fn ensure_all(&self) -> Result<()> {
        for dir in self.directories() {
            dir.ensure()?;
        }
        Ok(())
    }

    /// Resolve a repository-relative path.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve(&self.root, path)
    }
}

/// Join `path` onto `root` unless it is already absolute.
pub fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_all_creates_nested_dirs() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(
            temp.path(),
            Path::new(".hdd/root"),
            Path::new(".debug"),
            Path::new(".hdd"),
        );

        layout.ensure_all().unwrap();

        assert!(temp.path().join(".hdd/root").is_dir());
        assert!(temp.path().join(".debug").is_dir());
        assert!(temp.path().join(".hdd").is_dir());
    }

    #[test]
    fn test_ensure_is_idempotent_and_keeps_contents() {
        let temp = TempDir::new().unwrap();
        let dir = StagingDirectory::new("image tree", temp.path().join("tree"));
        dir.ensure().unwrap();
        fs::write(dir.path().join("keep.txt"), "x").unwrap();

        dir.ensure().unwrap();

        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn test_absolute_paths_are_kept() {
        let temp = TempDir::new().unwrap();
        let abs = temp.path().join("elsewhere");
        assert_eq!(resolve(Path::new("/repo"), &abs), abs);
        assert_eq!(
            resolve(Path::new("/repo"), Path::new(".debug")),
            PathBuf::from("/repo/.debug")
        );
    }
}
