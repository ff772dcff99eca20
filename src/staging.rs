//! Image tree staging.
//!
//! Each staging entry copies one payload (a component artifact or a static
//! file) to a fixed location under the image tree. The copy is its own graph
//! target whose only dependency is the payload, so a staged file is refreshed
//! exactly when what it mirrors changes.

use anyhow::{Context, Result};

use crate::components::artifact_path;
use crate::config::{BuildProfile, PipelineConfig, StageConfig, StageSource};
use crate::graph::{BuildAction, BuildTarget};
use crate::layout::{resolve, Layout};

/// Build target for one staging entry.
pub fn stage_target(
    config: &PipelineConfig,
    layout: &Layout,
    stage: &StageConfig,
    profile: BuildProfile,
) -> Result<BuildTarget> {
    let (from, upstream) = match &stage.from {
        StageSource::Component(name) => {
            let comp = config.component(name).with_context(|| {
                format!("stage entry '{}' copies unknown component '{}'", stage.name, name)
            })?;
            (artifact_path(&layout.root, comp, profile)?, Some(name.as_str()))
        }
        StageSource::File(path) => (resolve(&layout.root, path), None),
    };

    let output = layout.image_tree.path().join(&stage.to);
    let mut target = BuildTarget::new(&stage.name, output, BuildAction::Copy { from: from.clone() })
        .aux(from);
    if let Some(upstream) = upstream {
        target = target.after(upstream);
    }
    Ok(target)
}

/// Targets for every configured staging entry.
pub fn stage_targets(
    config: &PipelineConfig,
    layout: &Layout,
    profile: BuildProfile,
) -> Result<Vec<BuildTarget>> {
    config
        .stage
        .iter()
        .map(|stage| stage_target(config, layout, stage, profile))
        .collect()
}
