//! Disk image provisioning.
//!
//! Disk images are backing stores, not build products: they are created once
//! at a fixed size and never regenerated because something changed. An
//! existing file always wins, even if the configured size no longer matches.
//! Only [`DiskImage::reset`] makes the next [`DiskImage::ensure`] recreate it.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::config::{DiskConfig, Filesystem};
use crate::error::StepError;
use crate::fsutil::{atomic_move, partial_path, remove_if_exists};
use crate::process::Cmd;

pub const MIB: u64 = 1024 * 1024;

/// What [`DiskImage::ensure`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Created,
    /// The image already existed and was left alone.
    Existing,
}

/// A fixed-size raw image backing one emulated drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub filesystem: Option<Filesystem>,
}

impl DiskImage {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size_bytes,
            filesystem: None,
        }
    }

    pub fn from_config(disk_dir: &Path, config: &DiskConfig) -> Self {
        Self {
            name: config.name.clone(),
            path: disk_dir.join(&config.path),
            size_bytes: config.size_mib * MIB,
            filesystem: config.filesystem,
        }
    }

    pub fn formatted(mut self, filesystem: Filesystem) -> Self {
        self.filesystem = Some(filesystem);
        self
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Create the image if it does not exist.
    pub fn ensure(&self) -> Result<Provisioned> {
        if self.path.exists() {
            self.warn_on_size_mismatch();
            log::debug!("[{}] {} already exists", self.name, self.path.display());
            return Ok(Provisioned::Existing);
        }

        let partial = partial_path(&self.path);
        match self.create(&partial) {
            Ok(()) => {
                log::info!(
                    "[{}] created {} ({} MiB)",
                    self.name,
                    self.path.display(),
                    self.size_bytes / MIB
                );
                Ok(Provisioned::Created)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial);
                Err(StepError::Provisioning {
                    path: self.path.clone(),
                    reason: format!("{:#}", e),
                }
                .into())
            }
        }
    }

    fn create(&self, partial: &Path) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory '{}'", parent.display()))?;
        }

        let file = File::create(partial)
            .with_context(|| format!("creating '{}'", partial.display()))?;
        // Reserve the blocks now so a full disk fails here, not in the guest.
        file.allocate(self.size_bytes)
            .with_context(|| format!("allocating {} bytes", self.size_bytes))?;
        file.set_len(self.size_bytes)
            .with_context(|| format!("sizing '{}'", partial.display()))?;
        drop(file);

        if let Some(fs_kind) = self.filesystem {
            format_image(partial, fs_kind, &self.label())?;
        }

        atomic_move(partial, &self.path)
    }

    /// Remove the image so the next [`ensure`](Self::ensure) recreates it.
    ///
    /// Returns true if a file was removed.
    pub fn reset(&self) -> Result<bool> {
        remove_if_exists(&partial_path(&self.path))?;
        let removed = remove_if_exists(&self.path)?;
        if removed {
            log::info!("[{}] removed {}", self.name, self.path.display());
        }
        Ok(removed)
    }

    /// FAT volume label derived from the image name.
    fn label(&self) -> String {
        let label: String = self
            .name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(11)
            .collect::<String>()
            .to_ascii_uppercase();
        if label.is_empty() {
            "BOOTSTAGE".to_string()
        } else {
            label
        }
    }

    fn warn_on_size_mismatch(&self) {
        if let Ok(meta) = fs::metadata(&self.path) {
            if meta.len() != self.size_bytes {
                log::warn!(
                    "[{}] {} is {} bytes but {} are configured; keeping the existing image (reset to recreate)",
                    self.name,
                    self.path.display(),
                    meta.len(),
                    self.size_bytes
                );
            }
        }
    }
}

/// Idempotent provisioning of a raw, unformatted image.
pub fn ensure_image(path: &Path, size_bytes: u64) -> Result<Provisioned> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "disk".to_string());
    DiskImage::new(name, path, size_bytes).ensure()
}

fn format_image(path: &Path, filesystem: Filesystem, label: &str) -> Result<()> {
    match filesystem {
        Filesystem::Fat32 => {
            Cmd::new("mkfs.fat")
                .args(["-F", "32", "-n", label])
                .arg_path(path)
                .error_msg(format!("mkfs.fat failed on '{}'", path.display()))
                .run()?;
        }
    }
    Ok(())
}
