//! Host tool checks.
//!
//! Every pipeline step shells out to an external toolchain. Checking for them
//! up front turns a confusing mid-build `No such file or directory` into one
//! list of what to install.
//!
//! # Example
//!
//! ```rust
//! use bootstage::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("nasm") {
//!     println!("nasm not installed");
//! }
//!
//! let tools = &[("mkfs.fat", "dosfstools"), ("objdump", "binutils")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::config::{ComponentKind, PipelineConfig};

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools the reference pipeline needs, as (command, package) tuples.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("cargo", "rustup"),
    ("nasm", "nasm"),
    ("objdump", "binutils"),
    ("mkfs.fat", "dosfstools"),
    ("qemu-system-x86_64", "qemu-system-x86"),
];

/// Check that specific tools are available.
///
/// Reports every missing tool at once, with the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Tools needed by a particular configuration.
pub fn tools_for(config: &PipelineConfig) -> Vec<(String, String)> {
    let mut tools: Vec<(String, String)> = Vec::new();
    let mut add = |tool: &str, package: &str| {
        if !tools.iter().any(|(t, _)| t == tool) {
            tools.push((tool.to_string(), package.to_string()));
        }
    };

    for comp in &config.components {
        match comp.kind {
            ComponentKind::Cargo => add("cargo", "rustup"),
            ComponentKind::Nasm => add("nasm", "nasm"),
            ComponentKind::Command => {
                if let Some(program) = comp.command.first() {
                    add(program.as_str(), format!("provider of component '{}'", comp.name).as_str());
                }
            }
        }
    }
    if config.inspect.enabled {
        add(config.inspect.tool.as_str(), "binutils");
    }
    if config.disks.iter().any(|d| d.filesystem.is_some()) {
        add("mkfs.fat", "dosfstools");
    }
    add(config.vm.emulator.as_str(), "qemu-system-x86");
    tools
}

/// Check every tool the configuration will invoke.
pub fn check_host_tools(config: &PipelineConfig) -> Result<()> {
    let tools = tools_for(config);
    let borrowed: Vec<(&str, &str)> = tools
        .iter()
        .map(|(t, p)| (t.as_str(), p.as_str()))
        .collect();
    check_required_tools(&borrowed)
}
