//! Component builders.
//!
//! Turns each configured component into a [`BuildTarget`] whose action
//! delegates to the component's own toolchain: `cargo` for the bootloader,
//! kernel and kernel library, `nasm` for the AP trampoline, or an arbitrary
//! command for anything else. The toolchain keeps its own incremental state;
//! the graph only decides whether to call it.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{BuildProfile, ComponentConfig, ComponentKind};
use crate::graph::{BuildAction, BuildTarget, OUTPUT_PLACEHOLDER};
use crate::layout::resolve;
use crate::process::Cmd;

/// Directory name cargo uses for `--target`: the triple itself, or the file
/// stem of a target-spec JSON.
pub fn target_dir_name(target: &str) -> String {
    let path = Path::new(target);
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(target)
            .to_string()
    } else {
        target.to_string()
    }
}

/// Where the component's toolchain leaves its artifact.
pub fn artifact_path(root: &Path, comp: &ComponentConfig, profile: BuildProfile) -> Result<PathBuf> {
    match comp.kind {
        ComponentKind::Cargo => {
            let (Some(dir), Some(artifact)) = (&comp.dir, &comp.artifact) else {
                bail!("cargo component '{}' needs both 'dir' and 'artifact'", comp.name);
            };
            let mut path = resolve(root, dir).join("target");
            if let Some(target) = &comp.target {
                path.push(target_dir_name(target));
            }
            path.push(profile.dir_name());
            path.push(artifact);
            Ok(path)
        }
        ComponentKind::Nasm | ComponentKind::Command => {
            let output = comp
                .output
                .as_ref()
                .with_context(|| format!("component '{}' has no 'output'", comp.name))?;
            Ok(resolve(root, output))
        }
    }
}

fn cargo_build(root: &Path, comp: &ComponentConfig, dir: &Path, profile: BuildProfile) -> Vec<Cmd> {
    let crate_dir = resolve(root, dir);
    let mut cmds = Vec::new();

    if comp.format {
        cmds.push(
            Cmd::new("cargo")
                .arg("fmt")
                .dir(&crate_dir)
                .error_msg(format!("cargo fmt failed for '{}'", comp.name)),
        );
    }

    let mut build = Cmd::new("cargo").arg("build").dir(&crate_dir);
    if profile == BuildProfile::Release {
        build = build.arg("--release");
    }
    if let Some(target) = &comp.target {
        build = build.args(["--target", target.as_str()]);
    }
    build = build
        .args(&comp.args)
        .interactive()
        .error_msg(format!("cargo build failed for '{}'", comp.name));
    cmds.push(build);
    cmds
}

fn nasm_build(root: &Path, comp: &ComponentConfig, source: &Path) -> Cmd {
    Cmd::new("nasm")
        .args(["-f", comp.nasm_format.as_str()])
        .args(&comp.args)
        .arg("-o")
        .arg(OUTPUT_PLACEHOLDER)
        .arg_path(&resolve(root, source))
        .error_msg(format!("nasm failed for '{}'", comp.name))
}

/// Build target for one component.
pub fn component_target(
    root: &Path,
    comp: &ComponentConfig,
    profile: BuildProfile,
) -> Result<BuildTarget> {
    let output = artifact_path(root, comp, profile)?;
    let cmds = match comp.kind {
        ComponentKind::Cargo => {
            let dir = comp
                .dir
                .as_ref()
                .with_context(|| format!("cargo component '{}' has no 'dir'", comp.name))?;
            cargo_build(root, comp, dir, profile)
        }
        ComponentKind::Nasm => {
            let source = comp
                .source
                .as_ref()
                .with_context(|| format!("nasm component '{}' has no 'source'", comp.name))?;
            vec![nasm_build(root, comp, source)]
        }
        ComponentKind::Command => {
            let Some((program, args)) = comp.command.split_first() else {
                bail!("command component '{}' has an empty 'command'", comp.name);
            };
            vec![Cmd::new(program)
                .args(args)
                .dir(root)
                .error_msg(format!("build command failed for '{}'", comp.name))]
        }
    };

    let mut target = BuildTarget::new(&comp.name, output, BuildAction::Commands(cmds));
    for set in &comp.sources {
        target = target.source(resolve(root, &set.dir), &set.extension);
    }
    for aux in &comp.aux {
        target = target.aux(resolve(root, aux));
    }
    Ok(target)
}

/// `cargo clean` for a cargo component; `None` for components with no
/// toolchain-side state.
pub fn clean_command(root: &Path, comp: &ComponentConfig) -> Option<Cmd> {
    cargo_subcommand(root, comp, "clean")
}

/// `cargo update` for a cargo component.
pub fn update_command(root: &Path, comp: &ComponentConfig) -> Option<Cmd> {
    cargo_subcommand(root, comp, "update")
}

fn cargo_subcommand(root: &Path, comp: &ComponentConfig, sub: &str) -> Option<Cmd> {
    if comp.kind != ComponentKind::Cargo {
        return None;
    }
    let dir = comp.dir.as_ref()?;
    Some(
        Cmd::new("cargo")
            .arg(sub)
            .dir(resolve(root, dir))
            .error_msg(format!("cargo {} failed for '{}'", sub, comp.name)),
    )
}
