//! Kernel disassembly listing.

use anyhow::{Context, Result};

use crate::components::artifact_path;
use crate::config::{BuildProfile, PipelineConfig};
use crate::graph::{BuildAction, BuildTarget};
use crate::layout::Layout;
use crate::process::Cmd;

pub const DISASSEMBLE_TARGET: &str = "disassemble";

/// Diagnostic target writing `<tool> <args> <artifact>` stdout into the debug
/// directory. `None` when inspection is disabled.
pub fn disassembly_target(
    config: &PipelineConfig,
    layout: &Layout,
    profile: BuildProfile,
) -> Result<Option<BuildTarget>> {
    let inspect = &config.inspect;
    if !inspect.enabled {
        return Ok(None);
    }

    let comp = config.component(&inspect.component).with_context(|| {
        format!("inspect step refers to unknown component '{}'", inspect.component)
    })?;
    let artifact = artifact_path(&layout.root, comp, profile)?;

    let cmd = Cmd::new(&inspect.tool)
        .args(&inspect.args)
        .arg_path(&artifact)
        .error_msg(format!("{} failed on '{}'", inspect.tool, artifact.display()));

    let target = BuildTarget::new(
        DISASSEMBLE_TARGET,
        layout.debug_dir.path().join(&inspect.output),
        BuildAction::Capture(cmd),
    )
    .aux(artifact)
    .after(&comp.name)
    .diagnostic();
    Ok(Some(target))
}
