//! Dependency graph and rebuild decisions.
//!
//! Targets are declared once, validated into a DAG, and evaluated level by
//! level on every run:
//!
//! - [`scan`] - pure source discovery `(root, extension) -> paths`
//! - [`target`] - [`BuildTarget`], freshness and build actions
//!
//! A target whose upstream failed (or was itself blocked) is never built and
//! is reported as [`TargetOutcome::Blocked`]. Independent targets keep going.
//!
//! # Example
//!
//! ```rust,ignore
//! use bootstage::graph::{BuildGraph, BuildTarget, BuildAction};
//!
//! let graph = BuildGraph::new(vec![kernel, stage_kernel])?;
//! let report = graph.execute(4);
//! report.into_result()?;
//! ```

pub mod scan;
pub mod target;

pub use scan::{scan_sources, SourceSet};
pub use target::{BuildAction, BuildTarget, Freshness, Severity, OUTPUT_PLACEHOLDER};

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::fmt;

use crate::error::StepError;

/// What happened to one target during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// Up to date; no action ran.
    Fresh,
    /// The action ran and succeeded.
    Rebuilt,
    /// Dependency resolution or the action failed.
    Failed(String),
    /// A diagnostic target failed; the pipeline continues.
    Warned(String),
    /// Skipped because an upstream target failed.
    Blocked { by: String },
}

impl TargetOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TargetOutcome::Fresh => "fresh",
            TargetOutcome::Rebuilt => "rebuilt",
            TargetOutcome::Failed(_) => "failed",
            TargetOutcome::Warned(_) => "warned",
            TargetOutcome::Blocked { .. } => "blocked",
        }
    }

    fn halts_dependents(&self) -> bool {
        matches!(self, TargetOutcome::Failed(_) | TargetOutcome::Blocked { .. })
    }
}

impl fmt::Display for TargetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetOutcome::Failed(msg) | TargetOutcome::Warned(msg) => {
                write!(f, "{}: {}", self.label(), msg)
            }
            TargetOutcome::Blocked { by } => write!(f, "blocked by '{}'", by),
            _ => f.write_str(self.label()),
        }
    }
}

/// Per-target outcomes of one run, in execution order.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub entries: Vec<(String, TargetOutcome)>,
}

impl RunReport {
    pub fn outcome(&self, name: &str) -> Option<&TargetOutcome> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, outcome)| outcome)
    }

    pub fn rebuilt(&self) -> Vec<&str> {
        self.names_where(|o| matches!(o, TargetOutcome::Rebuilt))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names_where(|o| matches!(o, TargetOutcome::Failed(_)))
    }

    pub fn blocked(&self) -> Vec<&str> {
        self.names_where(|o| matches!(o, TargetOutcome::Blocked { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_empty() && self.blocked().is_empty()
    }

    /// `Err` if any target failed or was blocked.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(StepError::Pipeline {
            failed: self.failed().len(),
            blocked: self.blocked().len(),
        }
        .into())
    }

    fn names_where(&self, pred: impl Fn(&TargetOutcome) -> bool) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, outcome)| pred(outcome))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Validated set of targets with a topological level assignment.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    targets: Vec<BuildTarget>,
    index: HashMap<String, usize>,
    /// Targets grouped by depth; every upstream of a level-N target sits in
    /// a level below N.
    levels: Vec<Vec<usize>>,
}

impl BuildGraph {
    /// Validate names and upstream references and reject cycles.
    pub fn new(targets: Vec<BuildTarget>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, target) in targets.iter().enumerate() {
            if index.insert(target.name.clone(), i).is_some() {
                bail!("duplicate build target '{}'", target.name);
            }
        }
        for target in &targets {
            for up in &target.upstream {
                if !index.contains_key(up) {
                    bail!(
                        "target '{}' depends on unknown target '{}'",
                        target.name,
                        up
                    );
                }
            }
        }

        let levels = assign_levels(&targets, &index)?;
        Ok(Self {
            targets,
            index,
            levels,
        })
    }

    pub fn targets(&self) -> &[BuildTarget] {
        &self.targets
    }

    pub fn get(&self, name: &str) -> Option<&BuildTarget> {
        self.index.get(name).map(|&i| &self.targets[i])
    }

    /// Target names in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.levels
            .iter()
            .flatten()
            .map(|&i| self.targets[i].name.as_str())
            .collect()
    }

    /// Freshness of every target without building anything.
    pub fn status(&self) -> Vec<(&str, Result<Freshness>)> {
        self.levels
            .iter()
            .flatten()
            .map(|&i| {
                let target = &self.targets[i];
                (target.name.as_str(), target.freshness())
            })
            .collect()
    }

    /// Evaluate every target, running out-of-date actions.
    ///
    /// Independent targets in the same level run on up to `jobs` threads.
    pub fn execute(&self, jobs: usize) -> RunReport {
        let jobs = jobs.max(1);
        let mut outcomes: Vec<Option<TargetOutcome>> = vec![None; self.targets.len()];

        for level in &self.levels {
            let mut runnable = Vec::new();
            for &i in level {
                match self.failed_upstream(i, &outcomes) {
                    Some(by) => {
                        log::error!(
                            "[{}] skipped: upstream target '{}' did not complete",
                            self.targets[i].name,
                            by
                        );
                        outcomes[i] = Some(TargetOutcome::Blocked { by });
                    }
                    None => runnable.push(i),
                }
            }

            for chunk in runnable.chunks(jobs) {
                if let [only] = chunk {
                    outcomes[*only] = Some(evaluate(&self.targets[*only]));
                    continue;
                }
                let results: Vec<(usize, TargetOutcome)> = std::thread::scope(|s| {
                    let handles: Vec<_> = chunk
                        .iter()
                        .map(|&i| (i, s.spawn(move || evaluate(&self.targets[i]))))
                        .collect();
                    handles
                        .into_iter()
                        .map(|(i, handle)| {
                            let outcome = handle.join().unwrap_or_else(|_| {
                                TargetOutcome::Failed("build thread panicked".to_string())
                            });
                            (i, outcome)
                        })
                        .collect()
                });
                for (i, outcome) in results {
                    outcomes[i] = Some(outcome);
                }
            }
        }

        let entries = self
            .levels
            .iter()
            .flatten()
            .map(|&i| {
                let outcome = outcomes[i]
                    .take()
                    .unwrap_or_else(|| TargetOutcome::Failed("target was not evaluated".into()));
                (self.targets[i].name.clone(), outcome)
            })
            .collect();
        RunReport { entries }
    }

    fn failed_upstream(&self, i: usize, outcomes: &[Option<TargetOutcome>]) -> Option<String> {
        self.targets[i].upstream.iter().find_map(|up| {
            let j = self.index[up];
            match &outcomes[j] {
                Some(outcome) if outcome.halts_dependents() => Some(up.clone()),
                _ => None,
            }
        })
    }
}

/// Check one target and run its action if it is out of date.
fn evaluate(target: &BuildTarget) -> TargetOutcome {
    let freshness = match target.freshness() {
        Ok(f) => f,
        Err(e) => return failure(target, e),
    };

    match &freshness {
        Freshness::Fresh => {
            log::debug!("[{}] up to date", target.name);
            return TargetOutcome::Fresh;
        }
        Freshness::Missing => {
            log::info!("[{}] building ({} missing)", target.name, target.output.display());
        }
        Freshness::Stale { newest } => {
            log::info!("[{}] rebuilding ({} changed)", target.name, newest.display());
        }
    }

    match target.run_action() {
        Ok(()) => {
            log::info!("[{}] done: {}", target.name, target.output.display());
            TargetOutcome::Rebuilt
        }
        Err(e) => failure(target, e),
    }
}

fn failure(target: &BuildTarget, err: anyhow::Error) -> TargetOutcome {
    let msg = format!("{:#}", err);
    match target.severity {
        Severity::Required => {
            log::error!("[{}] {}", target.name, msg);
            TargetOutcome::Failed(msg)
        }
        Severity::Diagnostic => {
            log::warn!("[{}] diagnostic step failed (continuing): {}", target.name, msg);
            TargetOutcome::Warned(msg)
        }
    }
}

fn assign_levels(targets: &[BuildTarget], index: &HashMap<String, usize>) -> Result<Vec<Vec<usize>>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done(usize),
    }

    fn visit(
        i: usize,
        targets: &[BuildTarget],
        index: &HashMap<String, usize>,
        marks: &mut [Mark],
    ) -> Result<usize> {
        match marks[i] {
            Mark::Done(depth) => return Ok(depth),
            Mark::Visiting => bail!("dependency cycle through target '{}'", targets[i].name),
            Mark::Unvisited => {}
        }
        marks[i] = Mark::Visiting;
        let mut depth = 0;
        for up in &targets[i].upstream {
            depth = depth.max(visit(index[up], targets, index, marks)? + 1);
        }
        marks[i] = Mark::Done(depth);
        Ok(depth)
    }

    let mut marks = vec![Mark::Unvisited; targets.len()];
    let mut levels: Vec<Vec<usize>> = Vec::new();
    for i in 0..targets.len() {
        let depth = visit(i, targets, index, &mut marks)?;
        if levels.len() <= depth {
            levels.resize(depth + 1, Vec::new());
        }
        levels[depth].push(i);
    }
    // Declaration order within a level.
    for level in &mut levels {
        level.sort_unstable();
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Cmd;
    use std::fs::{self, File};
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    /// Action that writes the output and appends the target name to a log,
    /// so tests can count how often each action ran.
    fn logging_action(name: &str, log: &Path) -> BuildAction {
        BuildAction::Commands(vec![Cmd::new("sh")
            .args([
                "-c",
                "echo \"$1\" >> \"$2\" && echo \"$1\" > \"$0\"",
                OUTPUT_PLACEHOLDER,
                name,
            ])
            .arg_path(log)])
    }

    fn failing_action() -> BuildAction {
        BuildAction::Commands(vec![Cmd::new("sh").args(["-c", "echo 'link error' >&2; exit 1"])])
    }

    fn age_everything(root: &Path, secs: u64) {
        let time = SystemTime::now() - Duration::from_secs(secs);
        for entry in walkdir::WalkDir::new(root) {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                File::options()
                    .write(true)
                    .open(entry.path())
                    .unwrap()
                    .set_modified(time)
                    .unwrap();
            }
        }
    }

    fn set_mtime(path: &Path, secs_ago: u64) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .unwrap();
    }

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        log: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().to_path_buf();
            for (dir, file) in [
                ("bootloader/src", "main.rs"),
                ("kernel/src", "lib.rs"),
                ("libkernel/src", "lib.rs"),
                ("trampoline", "ap_trampoline.asm"),
            ] {
                fs::create_dir_all(root.join(dir)).unwrap();
                fs::write(root.join(dir).join(file), "").unwrap();
            }
            fs::write(root.join("kernel/linker.ld"), "").unwrap();
            let log = root.join("actions.log");
            Self {
                _temp: temp,
                root,
                log,
            }
        }

        fn graph(&self) -> BuildGraph {
            let r = &self.root;
            let out = r.join("out");
            BuildGraph::new(vec![
                BuildTarget::new(
                    "bootloader",
                    out.join("bootloader.efi"),
                    logging_action("bootloader", &self.log),
                )
                .source(r.join("bootloader/src"), "rs"),
                BuildTarget::new(
                    "kernel",
                    out.join("kernel.elf"),
                    logging_action("kernel", &self.log),
                )
                .source(r.join("kernel/src"), "rs")
                .aux(r.join("kernel/linker.ld")),
                BuildTarget::new(
                    "libkernel",
                    out.join("libkernel.rlib"),
                    logging_action("libkernel", &self.log),
                )
                .source(r.join("libkernel/src"), "rs"),
                BuildTarget::new(
                    "trampoline",
                    out.join("ap_trampoline.bin"),
                    logging_action("trampoline", &self.log),
                )
                .source(r.join("trampoline"), "asm"),
                BuildTarget::new(
                    "stage-bootloader",
                    r.join("tree/EFI/BOOT/BOOTX64.EFI"),
                    BuildAction::Copy {
                        from: out.join("bootloader.efi"),
                    },
                )
                .aux(out.join("bootloader.efi"))
                .after("bootloader"),
                BuildTarget::new(
                    "stage-kernel",
                    r.join("tree/EFI/kernel/kernel.elf"),
                    BuildAction::Copy {
                        from: out.join("kernel.elf"),
                    },
                )
                .aux(out.join("kernel.elf"))
                .after("kernel"),
            ])
            .unwrap()
        }

        fn actions(&self) -> Vec<String> {
            fs::read_to_string(&self.log)
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn clear_log(&self) {
            let _ = fs::remove_file(&self.log);
        }
    }

    #[test]
    fn test_order_puts_upstream_first() {
        let fx = Fixture::new();
        let graph = fx.graph();
        let order = graph.order();
        let pos = |n: &str| order.iter().position(|o| *o == n).unwrap();
        assert!(pos("bootloader") < pos("stage-bootloader"));
        assert!(pos("kernel") < pos("stage-kernel"));
    }

    #[test]
    fn test_first_run_builds_everything() {
        let fx = Fixture::new();
        let report = fx.graph().execute(1);

        assert!(report.is_success());
        let mut actions = fx.actions();
        actions.sort();
        assert_eq!(actions, ["bootloader", "kernel", "libkernel", "trampoline"]);
        assert!(fx.root.join("tree/EFI/BOOT/BOOTX64.EFI").is_file());
        assert!(fx.root.join("tree/EFI/kernel/kernel.elf").is_file());
    }

    #[test]
    fn test_second_run_performs_no_actions() {
        let fx = Fixture::new();
        let graph = fx.graph();
        graph.execute(1).into_result().unwrap();
        fx.clear_log();

        let report = graph.execute(1);

        assert!(fx.actions().is_empty());
        assert!(report
            .entries
            .iter()
            .all(|(_, outcome)| *outcome == TargetOutcome::Fresh));
    }

    #[test]
    fn test_touching_one_source_rebuilds_target_and_its_stage_only() {
        let fx = Fixture::new();
        let graph = fx.graph();
        graph.execute(1).into_result().unwrap();
        age_everything(&fx.root, 100);
        fx.clear_log();

        fs::write(fx.root.join("kernel/src/lib.rs"), "// touched").unwrap();
        let report = graph.execute(1);

        assert_eq!(fx.actions(), ["kernel"]);
        let mut rebuilt = report.rebuilt();
        rebuilt.sort();
        assert_eq!(rebuilt, ["kernel", "stage-kernel"]);
        assert_eq!(report.outcome("bootloader"), Some(&TargetOutcome::Fresh));
        assert_eq!(
            report.outcome("stage-bootloader"),
            Some(&TargetOutcome::Fresh)
        );
    }

    #[test]
    fn test_touching_linker_script_rebuilds_kernel() {
        let fx = Fixture::new();
        let graph = fx.graph();
        graph.execute(1).into_result().unwrap();
        age_everything(&fx.root, 100);
        fx.clear_log();

        set_mtime(&fx.root.join("kernel/linker.ld"), 0);
        graph.execute(1).into_result().unwrap();

        assert_eq!(fx.actions(), ["kernel"]);
    }

    #[test]
    fn test_failure_blocks_dependents_not_siblings() {
        let fx = Fixture::new();
        let mut targets = fx.graph().targets().to_vec();
        for t in &mut targets {
            if t.name == "kernel" {
                t.action = failing_action();
            }
        }
        let graph = BuildGraph::new(targets).unwrap();

        let report = graph.execute(1);

        assert!(matches!(
            report.outcome("kernel"),
            Some(TargetOutcome::Failed(msg)) if msg.contains("link error")
        ));
        assert_eq!(
            report.outcome("stage-kernel"),
            Some(&TargetOutcome::Blocked {
                by: "kernel".to_string()
            })
        );
        assert_eq!(report.outcome("bootloader"), Some(&TargetOutcome::Rebuilt));
        assert_eq!(
            report.outcome("stage-bootloader"),
            Some(&TargetOutcome::Rebuilt)
        );
        assert!(!fx.root.join("tree/EFI/kernel/kernel.elf").exists());

        let err = report.into_result().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StepError>(),
            Some(StepError::Pipeline {
                failed: 1,
                blocked: 1
            })
        ));
    }

    #[test]
    fn test_diagnostic_failure_only_warns() {
        let fx = Fixture::new();
        let mut targets = fx.graph().targets().to_vec();
        targets.push(
            BuildTarget::new("disassemble", fx.root.join("debug/kernel.disasm"), failing_action())
                .aux(fx.root.join("out/kernel.elf"))
                .after("kernel")
                .diagnostic(),
        );
        let graph = BuildGraph::new(targets).unwrap();

        let report = graph.execute(1);

        assert!(matches!(
            report.outcome("disassemble"),
            Some(TargetOutcome::Warned(_))
        ));
        assert!(report.is_success());
    }

    #[test]
    fn test_parallel_execution_matches_serial() {
        let fx = Fixture::new();
        let report = fx.graph().execute(4);

        assert!(report.is_success());
        let mut actions = fx.actions();
        actions.sort();
        assert_eq!(actions, ["bootloader", "kernel", "libkernel", "trampoline"]);
        assert_eq!(report.rebuilt().len(), 6);
    }

    #[test]
    fn test_rejects_unknown_upstream() {
        let t = BuildTarget::new("stage", "/tmp/x", BuildAction::Commands(vec![])).after("ghost");
        assert!(BuildGraph::new(vec![t]).is_err());
    }

    #[test]
    fn test_rejects_duplicates() {
        let a = BuildTarget::new("kernel", "/tmp/a", BuildAction::Commands(vec![]));
        let b = BuildTarget::new("kernel", "/tmp/b", BuildAction::Commands(vec![]));
        assert!(BuildGraph::new(vec![a, b]).is_err());
    }

    #[test]
    fn test_rejects_cycles() {
        let a = BuildTarget::new("a", "/tmp/a", BuildAction::Commands(vec![])).after("b");
        let b = BuildTarget::new("b", "/tmp/b", BuildAction::Commands(vec![])).after("a");
        let err = BuildGraph::new(vec![a, b]).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_status_does_not_build() {
        let fx = Fixture::new();
        let graph = fx.graph();

        let status = graph.status();

        assert!(fx.actions().is_empty());
        assert!(status
            .iter()
            .filter(|(name, _)| !name.starts_with("stage-"))
            .all(|(_, f)| matches!(f, Ok(Freshness::Missing))));
    }
}
