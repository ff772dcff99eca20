//! Pipeline entry points.
//!
//! [`Pipeline`] ties the configuration to the repository layout and exposes
//! one method per CLI command:
//!
//! | command     | what it does                                             |
//! |-------------|----------------------------------------------------------|
//! | `all`       | build, stage, disassemble, provision disks               |
//! | `run`       | build, stage, launch the VM (no provisioning)            |
//! | `provision` | create missing disk images                               |
//! | `reset`     | remove bootloader/kernel/trampoline artifacts (± disks)  |
//! | `rebuild`   | `reset` then `all`                                       |
//! | `clean`     | `cargo clean` per component, remove other artifacts      |
//! | `update`    | `cargo update` per component                             |
//! | `status`    | freshness of every target, nothing built                 |

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::components::{artifact_path, clean_command, component_target, update_command};
use crate::config::{BuildProfile, PipelineConfig};
use crate::disk::{DiskImage, Provisioned};
use crate::error::StepError;
use crate::fsutil::remove_if_exists;
use crate::graph::{BuildGraph, Freshness, RunReport};
use crate::inspect::disassembly_target;
use crate::layout::Layout;
use crate::manifest::RunManifest;
use crate::qemu::VmConfiguration;
use crate::staging::stage_targets;

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub config: PipelineConfig,
    pub layout: Layout,
    pub profile: BuildProfile,
    pub jobs: usize,
}

impl Pipeline {
    pub fn new(root: &Path, config: PipelineConfig, profile: BuildProfile, jobs: usize) -> Self {
        let layout = Layout::new(
            root,
            &config.layout.image_tree,
            &config.layout.debug_dir,
            &config.layout.disk_dir,
        );
        Self {
            config,
            layout,
            profile,
            jobs: jobs.max(1),
        }
    }

    /// Load configuration for `root`.
    ///
    /// The build profile comes from `profile`, else `BOOTSTAGE_PROFILE`, else
    /// the config file; `jobs` likewise overrides the config.
    pub fn open(
        root: &Path,
        config_path: Option<&Path>,
        profile: Option<BuildProfile>,
        jobs: Option<usize>,
    ) -> Result<Self> {
        let config = PipelineConfig::load(root, config_path)?;
        let profile = match profile {
            Some(p) => p,
            None => BuildProfile::from_env()?.unwrap_or(config.build.profile),
        };
        let jobs = jobs.unwrap_or(config.build.jobs);
        Ok(Self::new(root, config, profile, jobs))
    }

    /// Components and staging entries, plus the disassembly step when
    /// `inspect` is set.
    pub fn graph(&self, inspect: bool) -> Result<BuildGraph> {
        let root = &self.layout.root;
        let mut targets = self
            .config
            .components
            .iter()
            .map(|comp| component_target(root, comp, self.profile))
            .collect::<Result<Vec<_>>>()?;
        targets.extend(stage_targets(&self.config, &self.layout, self.profile)?);
        if inspect {
            targets.extend(disassembly_target(&self.config, &self.layout, self.profile)?);
        }
        BuildGraph::new(targets)
    }

    pub fn disks(&self) -> Vec<DiskImage> {
        self.config
            .disks
            .iter()
            .map(|d| DiskImage::from_config(self.layout.disk_dir.path(), d))
            .collect()
    }

    fn evaluate(&self, command: &str, inspect: bool) -> Result<(RunManifest, RunReport)> {
        self.layout.ensure_all()?;
        let graph = self.graph(inspect)?;
        let mut manifest = RunManifest::start(command, self.profile)?;
        log::info!(
            "{}: run {} ({} profile, {} job(s))",
            command,
            manifest.run_id,
            self.profile,
            self.jobs
        );

        let report = graph.execute(self.jobs);
        manifest.record_targets(&graph, &report);
        Ok((manifest, report))
    }

    fn write_manifest(&self, manifest: &mut RunManifest, success: bool) -> Result<()> {
        manifest.finish(success)?;
        let path = manifest.write(self.layout.debug_dir.path())?;
        log::debug!("wrote {}", path.display());
        Ok(())
    }

    /// Build and stage everything (no disassembly, no disks).
    pub fn build(&self) -> Result<RunReport> {
        let (mut manifest, report) = self.evaluate("build", false)?;
        self.write_manifest(&mut manifest, report.is_success())?;
        report.into_result()
    }

    /// Build, stage, disassemble and provision.
    ///
    /// Provisioning does not depend on the build, so it runs even when a
    /// target failed; the first failure is returned afterwards.
    pub fn all(&self) -> Result<RunReport> {
        let (mut manifest, report) = self.evaluate("all", true)?;
        let provisioned = self.provision_into(&mut manifest);
        self.write_manifest(&mut manifest, report.is_success() && provisioned.is_ok())?;

        let report = report.into_result()?;
        provisioned?;
        log::info!(
            "all: {} target(s) rebuilt, image tree at {}",
            report.rebuilt().len(),
            self.layout.image_tree.path().display()
        );
        Ok(report)
    }

    /// Create every missing disk image.
    pub fn provision(&self) -> Result<Vec<(DiskImage, Provisioned)>> {
        self.layout.disk_dir.ensure()?;
        let mut done = Vec::new();
        for disk in self.disks() {
            let provisioned = disk.ensure()?;
            done.push((disk, provisioned));
        }
        Ok(done)
    }

    fn provision_into(&self, manifest: &mut RunManifest) -> Result<()> {
        for (disk, provisioned) in self.provision()? {
            manifest.record_disk(&disk, provisioned);
        }
        Ok(())
    }

    /// Build and stage, then boot the VM and wait for it.
    ///
    /// Disk images are not provisioned here; a missing image fails the
    /// launch. A non-zero emulator status comes back as
    /// [`StepError::VmExit`](crate::error::StepError::VmExit).
    pub fn run(&self, vm_profile: Option<&str>) -> Result<()> {
        let (mut manifest, report) = self.evaluate("run", false)?;
        if !report.is_success() {
            self.write_manifest(&mut manifest, false)?;
            return report.into_result().map(|_| ());
        }

        let (profile, _) = self.config.vm_profile(vm_profile)?;
        let outcome = self.vm(vm_profile).and_then(|vm| {
            let session = vm.launch(self.layout.disk_dir.path())?;
            log::info!("emulator running (pid {})", session.id());
            session.wait()
        });

        let exit_code = match &outcome {
            Ok(()) => Some(0),
            Err(e) => match e.downcast_ref::<StepError>() {
                Some(StepError::VmExit { code }) => Some(*code),
                _ => None,
            },
        };
        manifest.record_vm(profile, exit_code);
        self.write_manifest(&mut manifest, outcome.is_ok())?;
        outcome
    }

    pub fn vm(&self, vm_profile: Option<&str>) -> Result<VmConfiguration> {
        VmConfiguration::from_profile(&self.config, &self.layout, vm_profile)
    }

    /// Remove the artifacts of components marked for reset, and optionally
    /// the disk images. Returns what was removed.
    pub fn reset(&self, disks: bool) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for comp in self.config.components.iter().filter(|c| c.reset) {
            let path = artifact_path(&self.layout.root, comp, self.profile)?;
            if remove_if_exists(&path)? {
                log::info!("[{}] removed {}", comp.name, path.display());
                removed.push(path);
            }
        }
        if disks {
            for disk in self.disks() {
                if disk.reset()? {
                    removed.push(disk.path);
                }
            }
        }
        Ok(removed)
    }

    pub fn rebuild(&self) -> Result<RunReport> {
        self.reset(false)?;
        self.all()
    }

    /// Delegate `cargo clean` to each cargo component; remove the artifacts
    /// of the rest and the disassembly listing.
    pub fn clean(&self) -> Result<()> {
        for comp in &self.config.components {
            match clean_command(&self.layout.root, comp) {
                Some(cmd) => {
                    log::info!("[{}] {}", comp.name, cmd);
                    cmd.run_interactive()?;
                }
                None => {
                    let path = artifact_path(&self.layout.root, comp, self.profile)?;
                    if remove_if_exists(&path)? {
                        log::info!("[{}] removed {}", comp.name, path.display());
                    }
                }
            }
        }
        let listing = self.layout.debug_dir.path().join(&self.config.inspect.output);
        remove_if_exists(&listing)?;
        Ok(())
    }

    /// Delegate `cargo update` to each cargo component.
    pub fn update(&self) -> Result<()> {
        for comp in &self.config.components {
            if let Some(cmd) = update_command(&self.layout.root, comp) {
                log::info!("[{}] {}", comp.name, cmd);
                cmd.run_interactive()
                    .with_context(|| format!("updating component '{}'", comp.name))?;
            }
        }
        Ok(())
    }

    /// One line per target and disk describing what the next `all` would do.
    pub fn status(&self) -> Result<Vec<String>> {
        let graph = self.graph(true)?;
        let mut lines = Vec::new();
        for (name, freshness) in graph.status() {
            let state = match freshness {
                Ok(Freshness::Fresh) => "fresh".to_string(),
                Ok(Freshness::Missing) => "missing".to_string(),
                Ok(Freshness::Stale { newest }) => format!("stale ({} changed)", newest.display()),
                Err(e) => format!("unresolved ({:#})", e),
            };
            lines.push(format!("{:<20} {}", name, state));
        }
        for disk in self.disks() {
            let state = if disk.exists() { "present" } else { "missing" };
            lines.push(format!("{:<20} {} ({})", disk.name, state, disk.path.display()));
        }
        Ok(lines)
    }
}
