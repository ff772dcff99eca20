//! Build targets and their actions.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::scan::SourceSet;
use crate::error::StepError;
use crate::fsutil::{atomic_move, partial_path};
use crate::process::Cmd;

/// Argument placeholder replaced by the temporary output path.
///
/// Commands that accept an output path use it so the artifact is written
/// next to its final location and renamed into place only on success.
pub const OUTPUT_PLACEHOLDER: &str = "{out}";

/// Whether a failure stops dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    Required,
    /// Failures are reported as warnings and never block the pipeline.
    Diagnostic,
}

/// What a target runs when it is out of date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildAction {
    /// Commands run in order; the first failure stops the sequence.
    Commands(Vec<Cmd>),
    /// Copy a file onto the output, replacing any previous copy.
    Copy { from: PathBuf },
    /// Run a command and write its stdout to the output.
    Capture(Cmd),
}

/// A named build step with tracked dependencies and one output artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub name: String,
    pub sources: Vec<SourceSet>,
    /// Explicit dependencies: linker scripts, target specs, config files,
    /// upstream artifacts.
    pub aux: Vec<PathBuf>,
    /// Targets whose artifacts this one consumes. Used for ordering and for
    /// halting this target when an upstream fails.
    pub upstream: Vec<String>,
    pub output: PathBuf,
    pub action: BuildAction,
    pub severity: Severity,
}

/// Result of a freshness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// The artifact does not exist.
    Missing,
    /// `newest` is strictly newer than the artifact.
    Stale { newest: PathBuf },
    Fresh,
}

impl Freshness {
    pub fn needs_rebuild(&self) -> bool {
        !matches!(self, Freshness::Fresh)
    }
}

impl BuildTarget {
    pub fn new(name: impl Into<String>, output: impl Into<PathBuf>, action: BuildAction) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            aux: Vec::new(),
            upstream: Vec::new(),
            output: output.into(),
            action,
            severity: Severity::Required,
        }
    }

    pub fn source(mut self, root: impl Into<PathBuf>, extension: &str) -> Self {
        self.sources.push(SourceSet::new(root, extension));
        self
    }

    pub fn aux(mut self, path: impl Into<PathBuf>) -> Self {
        self.aux.push(path.into());
        self
    }

    pub fn after(mut self, upstream: impl Into<String>) -> Self {
        self.upstream.push(upstream.into());
        self
    }

    pub fn diagnostic(mut self) -> Self {
        self.severity = Severity::Diagnostic;
        self
    }

    /// Resolve the full dependency set: every scanned source plus the
    /// auxiliary files. Re-evaluated on each call.
    pub fn dependencies(&self) -> Result<BTreeSet<PathBuf>> {
        let mut deps = BTreeSet::new();
        for set in &self.sources {
            let scanned = set.scan().map_err(|e| StepError::Dependency {
                target: self.name.clone(),
                path: set.root.clone(),
                reason: format!("{:#}", e),
            })?;
            deps.extend(scanned);
        }
        for path in &self.aux {
            if !path.exists() {
                return Err(StepError::Dependency {
                    target: self.name.clone(),
                    path: path.clone(),
                    reason: "file does not exist".to_string(),
                }
                .into());
            }
            deps.insert(path.clone());
        }
        Ok(deps)
    }

    /// Compare the artifact's mtime against its newest dependency.
    pub fn freshness(&self) -> Result<Freshness> {
        let deps = self.dependencies()?;

        let Some(artifact_time) = modified(&self.output)? else {
            return Ok(Freshness::Missing);
        };

        let mut newest: Option<(SystemTime, &PathBuf)> = None;
        for dep in &deps {
            let Some(time) = modified(dep)? else {
                continue;
            };
            if newest.map_or(true, |(t, _)| time > t) {
                newest = Some((time, dep));
            }
        }

        match newest {
            Some((time, path)) if time > artifact_time => Ok(Freshness::Stale {
                newest: path.clone(),
            }),
            _ => Ok(Freshness::Fresh),
        }
    }

    pub fn needs_rebuild(&self) -> Result<bool> {
        Ok(self.freshness()?.needs_rebuild())
    }

    /// Run the build action only if the target is out of date.
    ///
    /// Returns true if the action ran.
    pub fn build(&self) -> Result<bool> {
        if !self.needs_rebuild()? {
            return Ok(false);
        }
        self.run_action()?;
        Ok(true)
    }

    /// Run the build action unconditionally.
    pub fn run_action(&self) -> Result<()> {
        if let Some(parent) = self.output.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("creating output directory '{}'", parent.display())
            })?;
        }

        match &self.action {
            BuildAction::Commands(cmds) => self.run_commands(cmds),
            BuildAction::Copy { from } => self.run_copy(from),
            BuildAction::Capture(cmd) => self.run_capture(cmd),
        }
    }

    fn run_commands(&self, cmds: &[Cmd]) -> Result<()> {
        let partial = partial_path(&self.output);
        let before = signature(&self.output);
        let mut writes_partial = false;

        for cmd in cmds {
            let mut cmd = cmd.clone().allow_fail();
            writes_partial |= cmd.substitute(OUTPUT_PLACEHOLDER, &partial);

            let result = if cmd.is_interactive() {
                log::info!("[{}] {}", self.name, cmd);
                cmd.run_interactive()?
            } else {
                log::debug!("[{}] {}", self.name, cmd);
                cmd.run()?
            };
            if !result.success() {
                // No partial artifact survives a failed action. A toolchain
                // artifact is only dropped if this run touched it.
                let _ = fs::remove_file(&partial);
                if !writes_partial && signature(&self.output) != before {
                    let _ = fs::remove_file(&self.output);
                }
                let detail = if cmd.is_interactive() {
                    format!("{} exited with an error; see its output above", cmd)
                } else {
                    diagnostics(&result.stdout, &result.stderr)
                };
                return Err(StepError::Build {
                    target: self.name.clone(),
                    code: result.code().unwrap_or(-1),
                    diagnostics: detail,
                }
                .into());
            }
            if !result.stdout.trim().is_empty() {
                log::debug!("[{}] stdout:\n{}", self.name, result.stdout.trim_end());
            }
            if !result.stderr.trim().is_empty() {
                log::info!("[{}] {}", self.name, result.stderr.trim_end());
            }
        }

        if writes_partial {
            if !partial.exists() {
                return Err(StepError::Build {
                    target: self.name.clone(),
                    code: 0,
                    diagnostics: format!(
                        "action succeeded but did not write '{}'",
                        partial.display()
                    ),
                }
                .into());
            }
            atomic_move(&partial, &self.output)?;
        } else if !self.output.exists() {
            return Err(StepError::Build {
                target: self.name.clone(),
                code: 0,
                diagnostics: format!(
                    "action succeeded but artifact '{}' was not produced",
                    self.output.display()
                ),
            }
            .into());
        } else {
            // The toolchain may decide nothing changed and leave the artifact
            // untouched; bump it so the next run sees it as fresh.
            touch(&self.output)?;
        }
        Ok(())
    }

    fn run_copy(&self, from: &Path) -> Result<()> {
        let partial = partial_path(&self.output);
        let staged = fs::copy(from, &partial)
            .with_context(|| {
                format!(
                    "copying '{}' to '{}'",
                    from.display(),
                    self.output.display()
                )
            })
            .and_then(|_| atomic_move(&partial, &self.output));

        staged.map_err(|e| {
            let _ = fs::remove_file(&partial);
            anyhow::Error::from(StepError::Staging {
                target: self.name.clone(),
                reason: format!("{:#}", e),
            })
        })
    }

    fn run_capture(&self, cmd: &Cmd) -> Result<()> {
        log::debug!("[{}] {} > {}", self.name, cmd, self.output.display());
        let result = cmd.clone().allow_fail().run()?;
        if !result.success() {
            return Err(StepError::Build {
                target: self.name.clone(),
                code: result.code().unwrap_or(-1),
                diagnostics: diagnostics("", &result.stderr),
            }
            .into());
        }

        let partial = partial_path(&self.output);
        fs::write(&partial, result.stdout.as_bytes())
            .with_context(|| format!("writing '{}'", partial.display()))?;
        atomic_move(&partial, &self.output)
    }
}

fn modified(path: &Path) -> Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.modified().with_context(|| {
            format!("reading modification time of '{}'", path.display())
        })?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading metadata of '{}'", path.display())),
    }
}

/// Modification time and length, or `None` if the file is absent.
fn signature(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

fn touch(path: &Path) -> Result<()> {
    File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()))
        .with_context(|| format!("updating modification time of '{}'", path.display()))
}

fn diagnostics(stdout: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let tail: Vec<&str> = stdout.trim().lines().rev().take(40).collect();
    tail.into_iter().rev().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, secs_ago: u64) {
        let time = SystemTime::now() - Duration::from_secs(secs_ago);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn sh(script: &str) -> Cmd {
        Cmd::new("sh").args(["-c", script])
    }

    fn kernel_fixture(temp: &TempDir) -> BuildTarget {
        let src = temp.path().join("kernel/src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("lib.rs"), "fn main() {}").unwrap();
        fs::write(temp.path().join("kernel/linker.ld"), "").unwrap();
        let out = temp.path().join("kernel.elf");

        BuildTarget::new(
            "kernel",
            &out,
            BuildAction::Commands(vec![sh("echo built > \"$0\"").arg(OUTPUT_PLACEHOLDER)]),
        )
        .source(&src, "rs")
        .aux(temp.path().join("kernel/linker.ld"))
    }

    #[test]
    fn test_missing_artifact_needs_rebuild() {
        let temp = TempDir::new().unwrap();
        let target = kernel_fixture(&temp);
        assert_eq!(target.freshness().unwrap(), Freshness::Missing);
    }

    #[test]
    fn test_newer_source_makes_artifact_stale() {
        let temp = TempDir::new().unwrap();
        let target = kernel_fixture(&temp);
        fs::write(&target.output, "old").unwrap();
        set_mtime(&target.output, 100);
        set_mtime(&temp.path().join("kernel/linker.ld"), 200);
        set_mtime(&temp.path().join("kernel/src/lib.rs"), 50);

        assert_eq!(
            target.freshness().unwrap(),
            Freshness::Stale {
                newest: temp.path().join("kernel/src/lib.rs")
            }
        );
    }

    #[test]
    fn test_newer_aux_file_makes_artifact_stale() {
        let temp = TempDir::new().unwrap();
        let target = kernel_fixture(&temp);
        fs::write(&target.output, "old").unwrap();
        set_mtime(&temp.path().join("kernel/src/lib.rs"), 200);
        set_mtime(&target.output, 100);
        set_mtime(&temp.path().join("kernel/linker.ld"), 10);

        assert!(target.needs_rebuild().unwrap());
    }

    #[test]
    fn test_equal_mtime_is_fresh() {
        let temp = TempDir::new().unwrap();
        let target = kernel_fixture(&temp);
        fs::write(&target.output, "built").unwrap();
        let time = SystemTime::now() - Duration::from_secs(60);
        for path in [
            &target.output,
            &temp.path().join("kernel/src/lib.rs"),
            &temp.path().join("kernel/linker.ld"),
        ] {
            File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(time)
                .unwrap();
        }

        assert_eq!(target.freshness().unwrap(), Freshness::Fresh);
    }

    #[test]
    fn test_new_source_file_is_detected() {
        let temp = TempDir::new().unwrap();
        let target = kernel_fixture(&temp);
        fs::write(&target.output, "built").unwrap();
        set_mtime(&temp.path().join("kernel/src/lib.rs"), 200);
        set_mtime(&temp.path().join("kernel/linker.ld"), 200);
        set_mtime(&target.output, 100);
        assert!(!target.needs_rebuild().unwrap());

        fs::write(temp.path().join("kernel/src/smp.rs"), "").unwrap();

        assert!(target.needs_rebuild().unwrap());
    }

    #[test]
    fn test_missing_aux_is_dependency_error() {
        let temp = TempDir::new().unwrap();
        let target = kernel_fixture(&temp).aux(temp.path().join("x86_64-kernel.json"));
        let err = target.freshness().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StepError>(),
            Some(StepError::Dependency { .. })
        ));
    }

    #[test]
    fn test_build_writes_through_placeholder() {
        let temp = TempDir::new().unwrap();
        let target = kernel_fixture(&temp);

        assert!(target.build().unwrap());
        assert_eq!(fs::read_to_string(&target.output).unwrap().trim(), "built");
        assert!(!partial_path(&target.output).exists());

        assert!(!target.build().unwrap());
    }

    #[test]
    fn test_failed_action_leaves_no_artifact() {
        let temp = TempDir::new().unwrap();
        let mut target = kernel_fixture(&temp);
        target.action = BuildAction::Commands(vec![
            sh("echo half > \"$0\"; echo 'error[E0425]' >&2; exit 101").arg(OUTPUT_PLACEHOLDER),
        ]);

        let err = target.build().unwrap_err();

        match err.downcast_ref::<StepError>() {
            Some(StepError::Build {
                code, diagnostics, ..
            }) => {
                assert_eq!(*code, 101);
                assert!(diagnostics.contains("E0425"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!target.output.exists());
        assert!(!partial_path(&target.output).exists());
    }

    #[test]
    fn test_failed_toolchain_output_is_removed() {
        let temp = TempDir::new().unwrap();
        let mut target = kernel_fixture(&temp);
        let out = target.output.clone();
        target.action = BuildAction::Commands(vec![sh("echo partial > \"$0\"; exit 1")
            .arg(out.as_os_str())]);

        assert!(target.build().is_err());
        assert!(!out.exists());
    }

    #[test]
    fn test_failed_formatter_keeps_previous_artifact() {
        let temp = TempDir::new().unwrap();
        let mut target = kernel_fixture(&temp);
        fs::write(&target.output, "good").unwrap();
        set_mtime(&target.output, 100);
        target.action = BuildAction::Commands(vec![
            sh("echo 'rustfmt: parse error' >&2; exit 1"),
            sh("true"),
        ]);

        let err = target.run_action().unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StepError>(),
            Some(StepError::Build { .. })
        ));
        assert_eq!(fs::read_to_string(&target.output).unwrap(), "good");
    }

    #[test]
    fn test_rewritten_toolchain_artifact_is_removed_on_failure() {
        let temp = TempDir::new().unwrap();
        let mut target = kernel_fixture(&temp);
        let out = target.output.clone();
        fs::write(&out, "good").unwrap();
        set_mtime(&out, 100);
        target.action = BuildAction::Commands(vec![
            sh("echo truncated > \"$0\"; exit 1").arg(out.as_os_str()),
        ]);

        assert!(target.run_action().is_err());
        assert!(!out.exists());
    }

    #[test]
    fn test_interactive_failure_reports_status() {
        let temp = TempDir::new().unwrap();
        let mut target = kernel_fixture(&temp);
        target.action = BuildAction::Commands(vec![sh("exit 101").interactive()]);

        let err = target.run_action().unwrap_err();

        match err.downcast_ref::<StepError>() {
            Some(StepError::Build {
                code, diagnostics, ..
            }) => {
                assert_eq!(*code, 101);
                assert!(diagnostics.contains("see its output above"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_stderr_of_successful_step_does_not_fail_it() {
        let temp = TempDir::new().unwrap();
        let mut target = kernel_fixture(&temp);
        target.action = BuildAction::Commands(vec![sh(
            "echo 'warning: unused variable' >&2; echo built > \"$0\"",
        )
        .arg(OUTPUT_PLACEHOLDER)]);

        assert!(target.build().unwrap());
        assert_eq!(fs::read_to_string(&target.output).unwrap().trim(), "built");
    }

    #[test]
    fn test_untouched_toolchain_artifact_is_bumped() {
        let temp = TempDir::new().unwrap();
        let mut target = kernel_fixture(&temp);
        fs::write(&target.output, "cached").unwrap();
        set_mtime(&target.output, 100);
        target.action = BuildAction::Commands(vec![sh("true")]);

        assert!(target.build().unwrap());
        assert!(!target.needs_rebuild().unwrap());
    }

    #[test]
    fn test_copy_action_overwrites() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("BOOTX64.EFI");
        fs::write(&from, "new").unwrap();
        let out = temp.path().join("tree/EFI/BOOT/BOOTX64.EFI");
        fs::create_dir_all(out.parent().unwrap()).unwrap();
        fs::write(&out, "old").unwrap();
        set_mtime(&out, 100);

        let target = BuildTarget::new(
            "stage-bootloader",
            &out,
            BuildAction::Copy { from: from.clone() },
        )
        .aux(&from);

        assert!(target.build().unwrap());
        assert_eq!(fs::read_to_string(&out).unwrap(), "new");
    }

    #[test]
    fn test_copy_failure_is_staging_error() {
        let temp = TempDir::new().unwrap();
        let target = BuildTarget::new(
            "stage-bootloader",
            temp.path().join("out.efi"),
            BuildAction::Copy {
                from: temp.path().join("missing.efi"),
            },
        );
        let err = target.run_action().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StepError>(),
            Some(StepError::Staging { .. })
        ));
    }

    #[test]
    fn test_capture_writes_stdout() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("debug/kernel.disasm");
        let target = BuildTarget::new(
            "disassemble",
            &out,
            BuildAction::Capture(sh("echo '0000000000100000 <_start>:'")),
        );

        target.run_action().unwrap();

        assert!(fs::read_to_string(&out).unwrap().contains("<_start>"));
    }
}
