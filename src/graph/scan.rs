//! Source dependency discovery.

use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A directory tree whose files with a given extension are dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSet {
    pub root: PathBuf,
    /// Extension without the leading dot, e.g. `"rs"`.
    pub extension: String,
}

impl SourceSet {
    pub fn new(root: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            root: root.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn scan(&self) -> Result<BTreeSet<PathBuf>> {
        scan_sources(&self.root, &self.extension)
    }
}

/// Every file under `root` (recursively) whose extension is `extension`.
///
/// Evaluated from scratch on each call so added and removed files are seen
/// on the next run.
pub fn scan_sources(root: &Path, extension: &str) -> Result<BTreeSet<PathBuf>> {
    if !root.is_dir() {
        bail!("source directory '{}' does not exist", root.display());
    }

    let mut found = BTreeSet::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry =
            entry.with_context(|| format!("scanning source directory '{}'", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) == Some(extension) {
            found.insert(entry.into_path());
        }
    }
    Ok(found)
}
