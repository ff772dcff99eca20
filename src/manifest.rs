//! Per-run manifest.
//!
//! Every pipeline command that evaluates the graph writes
//! `<debug_dir>/run-manifest.json`: what ran, with which profile, and the
//! outcome and checksum of every target's artifact.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::BuildProfile;
use crate::disk::{DiskImage, Provisioned};
use crate::fsutil::sha256_file;
use crate::graph::{BuildGraph, RunReport, TargetOutcome};

pub const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";

static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub name: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub artifact: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub profile: String,
    /// Emulator exit status; absent when the launch itself failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub command: String,
    pub status: String,
    pub build_profile: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub targets: Vec<TargetRecord>,
    pub disks: Vec<DiskRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<VmRecord>,
}

impl RunManifest {
    pub fn start(command: &str, profile: BuildProfile) -> Result<Self> {
        Ok(Self {
            run_id: generate_run_id()?,
            command: command.to_string(),
            status: "running".to_string(),
            build_profile: profile.to_string(),
            created_at_utc: now_rfc3339()?,
            finished_at_utc: None,
            targets: Vec::new(),
            disks: Vec::new(),
            vm: None,
        })
    }

    /// Record every target's outcome. Hashing is best-effort: an unreadable
    /// artifact is logged and recorded without a checksum.
    pub fn record_targets(&mut self, graph: &BuildGraph, report: &RunReport) {
        for (name, outcome) in &report.entries {
            let Some(target) = graph.get(name) else {
                continue;
            };
            let (sha256, size_bytes) = match outcome {
                TargetOutcome::Fresh | TargetOutcome::Rebuilt => match sha256_file(&target.output) {
                    Ok((sha, size)) => (Some(sha), Some(size)),
                    Err(e) => {
                        log::warn!("[{}] not hashing artifact: {:#}", name, e);
                        (None, None)
                    }
                },
                _ => (None, None),
            };
            let detail = match outcome {
                TargetOutcome::Failed(msg) | TargetOutcome::Warned(msg) => Some(msg.clone()),
                TargetOutcome::Blocked { by } => Some(format!("upstream '{}' did not complete", by)),
                _ => None,
            };
            self.targets.push(TargetRecord {
                name: name.clone(),
                outcome: outcome.label().to_string(),
                detail,
                artifact: target.output.clone(),
                sha256,
                size_bytes,
            });
        }
    }

    pub fn record_disk(&mut self, disk: &DiskImage, provisioned: Provisioned) {
        self.disks.push(DiskRecord {
            name: disk.name.clone(),
            path: disk.path.clone(),
            size_bytes: disk.size_bytes,
            created: provisioned == Provisioned::Created,
        });
    }

    pub fn record_vm(&mut self, profile: &str, exit_code: Option<i32>) {
        self.vm = Some(VmRecord {
            profile: profile.to_string(),
            exit_code,
        });
    }

    pub fn finish(&mut self, success: bool) -> Result<()> {
        self.status = if success { "success" } else { "failed" }.to_string();
        self.finished_at_utc = Some(now_rfc3339()?);
        Ok(())
    }

    pub fn write(&self, debug_dir: &Path) -> Result<PathBuf> {
        let path = debug_dir.join(RUN_MANIFEST_FILENAME);
        write_json_atomic(&path, self)
            .with_context(|| format!("writing run manifest '{}'", path.display()))?;
        Ok(path)
    }

    pub fn load(debug_dir: &Path) -> Result<Self> {
        let path = debug_dir.join(RUN_MANIFEST_FILENAME);
        let bytes =
            fs::read(&path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run manifest '{}'", path.display()))
    }
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting timestamp")
}

/// Sortable, collision-resistant run identifier (base62).
pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let id = base62((nanos << 32) | pid | seq);
    if id.len() > 22 {
        bail!("run id overflow");
    }
    Ok(id)
}

fn base62(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    digits.iter().rev().collect()
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run manifest")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })
}
