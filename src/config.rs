//! Pipeline configuration.
//!
//! Built-in defaults describe the reference repository layout: a UEFI
//! bootloader, a kernel, a shared kernel library and an AP trampoline, staged
//! into `.hdd/root` and booted under QEMU. A `bootstage.toml` at the
//! repository root (or passed with `--config`) overrides any top-level section.
//!
//! ```toml
//! [build]
//! profile = "debug"
//!
//! [[disks]]
//! name = "nvme"
//! path = "nvme.img"
//! size_mib = 512
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default config file name at the repository root.
pub const CONFIG_FILENAME: &str = "bootstage.toml";

/// Environment variable selecting the build profile.
pub const PROFILE_ENV: &str = "BOOTSTAGE_PROFILE";

/// Build profile honoured by every component builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildProfile {
    #[default]
    Release,
    Debug,
}

impl BuildProfile {
    /// Directory name cargo uses for this profile.
    pub fn dir_name(self) -> &'static str {
        match self {
            BuildProfile::Release => "release",
            BuildProfile::Debug => "debug",
        }
    }

    /// Profile from `BOOTSTAGE_PROFILE`, if set.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(PROFILE_ENV) {
            Ok(value) if !value.trim().is_empty() => Ok(Some(
                value
                    .parse()
                    .with_context(|| format!("invalid {} value", PROFILE_ENV))?,
            )),
            _ => Ok(None),
        }
    }
}

impl FromStr for BuildProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "release" => Ok(BuildProfile::Release),
            "debug" | "dev" => Ok(BuildProfile::Debug),
            other => bail!(
                "unsupported build profile '{}'; expected 'release' or 'debug'",
                other
            ),
        }
    }
}

impl fmt::Display for BuildProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    pub layout: LayoutConfig,
    pub build: BuildConfig,
    #[serde(default = "default_components")]
    pub components: Vec<ComponentConfig>,
    #[serde(default = "default_stage")]
    pub stage: Vec<StageConfig>,
    #[serde(default = "default_disks")]
    pub disks: Vec<DiskConfig>,
    pub inspect: InspectConfig,
    pub vm: VmConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LayoutConfig {
    pub image_tree: PathBuf,
    pub debug_dir: PathBuf,
    pub disk_dir: PathBuf,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            image_tree: PathBuf::from(".hdd/root"),
            debug_dir: PathBuf::from(".debug"),
            disk_dir: PathBuf::from(".hdd"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuildConfig {
    pub profile: BuildProfile,
    pub jobs: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            profile: BuildProfile::Release,
            jobs: 1,
        }
    }
}

/// Toolchain that builds a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// `cargo build` in `dir`; artifact under `dir/target/<triple>/<profile>/`.
    Cargo,
    /// `nasm` assembling `source` into `output`.
    Nasm,
    /// Arbitrary `command` run from the repository root; writes `output`,
    /// usually through the `{out}` placeholder.
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub dir: PathBuf,
    pub extension: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    pub name: String,
    pub kind: ComponentKind,
    /// Cargo: crate directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Cargo: target triple or path (relative to `dir`) of a target-spec JSON.
    #[serde(default)]
    pub target: Option<String>,
    /// Cargo: artifact file name inside the profile directory.
    #[serde(default)]
    pub artifact: Option<String>,
    /// Nasm: input file.
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Nasm: output file.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Command: program and arguments.
    #[serde(default)]
    pub command: Vec<String>,
    /// Nasm: output format passed to `-f`.
    #[serde(default = "default_nasm_format")]
    pub nasm_format: String,
    /// Run `cargo fmt` before building.
    #[serde(default)]
    pub format: bool,
    #[serde(default)]
    pub args: Vec<String>,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub aux: Vec<PathBuf>,
    /// Removed by `reset`.
    #[serde(default = "default_true")]
    pub reset: bool,
}

/// What a staging entry copies into the image tree.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageSource {
    /// Artifact of the named component.
    Component(String),
    /// Static payload at a repository-relative path.
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    pub from: StageSource,
    /// Destination relative to the image tree.
    pub to: PathBuf,
}

/// Filesystem written into a fresh disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    Fat32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    pub name: String,
    /// Relative to the disk directory.
    pub path: PathBuf,
    pub size_mib: u64,
    #[serde(default)]
    pub filesystem: Option<Filesystem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InspectConfig {
    pub enabled: bool,
    /// Component whose artifact is disassembled.
    pub component: String,
    pub tool: String,
    pub args: Vec<String>,
    /// Listing file name inside the debug directory.
    pub output: PathBuf,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            component: "kernel".to_string(),
            tool: "objdump".to_string(),
            args: ["-d", "-C", "-M", "intel"].map(String::from).to_vec(),
            output: PathBuf::from("kernel.disasm"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VmConfig {
    pub emulator: String,
    /// OVMF code image; discovered from well-known paths when unset.
    pub firmware: Option<PathBuf>,
    pub default_profile: String,
    pub profiles: BTreeMap<String, VmProfileConfig>,
}

impl Default for VmConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert("reference".to_string(), VmProfileConfig::default());
        profiles.insert(
            "system-disk".to_string(),
            VmProfileConfig {
                memory: "256M".to_string(),
                system_disk: Some("system".to_string()),
                trace_points: Vec::new(),
                ..VmProfileConfig::default()
            },
        );
        Self {
            emulator: "qemu-system-x86_64".to_string(),
            firmware: None,
            default_profile: "reference".to_string(),
            profiles,
        }
    }
}

/// One named emulator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VmProfileConfig {
    pub machine: String,
    pub cpu: String,
    pub smp: u32,
    pub memory: String,
    /// Disk (by name) attached as a raw IDE drive, if any.
    pub system_disk: Option<String>,
    /// Disk (by name) attached behind the NVMe controller.
    pub data_disk: String,
    pub nvme_serial: String,
    /// Debug log file name inside the debug directory.
    pub debug_log: PathBuf,
    /// `-d` log items.
    pub debug_flags: Vec<String>,
    /// `-trace` event names.
    pub trace_points: Vec<String>,
    pub no_reboot: bool,
    pub extra_args: Vec<String>,
}

/// NVMe controller error trace events enabled by the reference profile.
pub const NVME_ERROR_TRACE_POINTS: &[&str] = &[
    "pci_nvme_err_mdts",
    "pci_nvme_err_req_status",
    "pci_nvme_err_addr_read",
    "pci_nvme_err_addr_write",
    "pci_nvme_err_invalid_opc",
    "pci_nvme_err_invalid_admin_opc",
    "pci_nvme_err_invalid_lba_range",
    "pci_nvme_err_invalid_field",
    "pci_nvme_err_invalid_prp",
    "pci_nvme_err_invalid_prp2_align",
    "pci_nvme_err_invalid_prp2_missing",
    "pci_nvme_err_invalid_setfeat",
    "pci_nvme_err_invalid_getfeat",
    "pci_nvme_err_startfail",
];

impl Default for VmProfileConfig {
    fn default() -> Self {
        Self {
            machine: "q35".to_string(),
            cpu: "qemu64".to_string(),
            smp: 4,
            memory: "4G".to_string(),
            system_disk: None,
            data_disk: "nvme".to_string(),
            nvme_serial: "deadbeef".to_string(),
            debug_log: PathBuf::from("qemu.log"),
            debug_flags: vec!["int".to_string(), "guest_errors".to_string()],
            trace_points: NVME_ERROR_TRACE_POINTS.iter().map(|s| s.to_string()).collect(),
            no_reboot: true,
            extra_args: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_nasm_format() -> String {
    "bin".to_string()
}

fn rust_sources(dir: &str) -> Vec<SourceConfig> {
    vec![SourceConfig {
        dir: PathBuf::from(dir),
        extension: "rs".to_string(),
    }]
}

fn default_components() -> Vec<ComponentConfig> {
    vec![
        ComponentConfig {
            name: "bootloader".to_string(),
            kind: ComponentKind::Cargo,
            dir: Some(PathBuf::from("bootloader")),
            target: Some("x86_64-unknown-uefi".to_string()),
            artifact: Some("bootloader.efi".to_string()),
            source: None,
            output: None,
            command: Vec::new(),
            nasm_format: default_nasm_format(),
            format: true,
            args: Vec::new(),
            sources: rust_sources("bootloader/src"),
            aux: vec![PathBuf::from("bootloader/Cargo.toml")],
            reset: true,
        },
        ComponentConfig {
            name: "kernel".to_string(),
            kind: ComponentKind::Cargo,
            dir: Some(PathBuf::from("kernel")),
            target: Some("x86_64-kernel.json".to_string()),
            artifact: Some("kernel".to_string()),
            source: None,
            output: None,
            command: Vec::new(),
            nasm_format: default_nasm_format(),
            format: true,
            args: vec!["-Zbuild-std=core,alloc".to_string()],
            sources: rust_sources("kernel/src"),
            aux: vec![
                PathBuf::from("kernel/Cargo.toml"),
                PathBuf::from("kernel/x86_64-kernel.json"),
                PathBuf::from("kernel/linker.ld"),
            ],
            reset: true,
        },
        ComponentConfig {
            name: "libkernel".to_string(),
            kind: ComponentKind::Cargo,
            dir: Some(PathBuf::from("libkernel")),
            target: Some("x86_64-unknown-none".to_string()),
            artifact: Some("liblibkernel.rlib".to_string()),
            source: None,
            output: None,
            command: Vec::new(),
            nasm_format: default_nasm_format(),
            format: true,
            args: Vec::new(),
            sources: rust_sources("libkernel/src"),
            aux: vec![PathBuf::from("libkernel/Cargo.toml")],
            reset: false,
        },
        ComponentConfig {
            name: "trampoline".to_string(),
            kind: ComponentKind::Nasm,
            dir: None,
            target: None,
            artifact: None,
            source: Some(PathBuf::from("trampoline/ap_trampoline.asm")),
            output: Some(PathBuf::from("build/ap_trampoline.o")),
            command: Vec::new(),
            nasm_format: default_nasm_format(),
            format: false,
            args: Vec::new(),
            sources: vec![SourceConfig {
                dir: PathBuf::from("trampoline"),
                extension: "asm".to_string(),
            }],
            aux: Vec::new(),
            reset: true,
        },
    ]
}

fn default_stage() -> Vec<StageConfig> {
    vec![
        StageConfig {
            name: "stage-bootloader".to_string(),
            from: StageSource::Component("bootloader".to_string()),
            to: PathBuf::from("EFI/BOOT/BOOTX64.EFI"),
        },
        StageConfig {
            name: "stage-boot-config".to_string(),
            from: StageSource::File(PathBuf::from("resources/boot.conf")),
            to: PathBuf::from("EFI/BOOT/boot.conf"),
        },
        StageConfig {
            name: "stage-kernel".to_string(),
            from: StageSource::Component("kernel".to_string()),
            to: PathBuf::from("EFI/kernel/kernel.elf"),
        },
    ]
}

fn default_disks() -> Vec<DiskConfig> {
    vec![
        DiskConfig {
            name: "system".to_string(),
            path: PathBuf::from("disk.img"),
            size_mib: 256,
            filesystem: Some(Filesystem::Fat32),
        },
        DiskConfig {
            name: "nvme".to_string(),
            path: PathBuf::from("nvme.img"),
            size_mib: 256,
            filesystem: None,
        },
    ]
}

impl PipelineConfig {
    /// Built-in reference configuration.
    pub fn reference() -> Self {
        Self {
            components: default_components(),
            stage: default_stage(),
            disks: default_disks(),
            ..Self::default()
        }
    }

    /// Load `explicit`, or `<root>/bootstage.toml` if present, or the
    /// built-in reference configuration.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let candidate = root.join(CONFIG_FILENAME);
                candidate.is_file().then_some(candidate)
            }
        };

        let config = match path {
            Some(path) => {
                log::debug!("loading config {}", path.display());
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("reading config '{}'", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("parsing config '{}'", path.display()))?
            }
            None => Self::reference(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn component(&self, name: &str) -> Option<&ComponentConfig> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn disk(&self, name: &str) -> Option<&DiskConfig> {
        self.disks.iter().find(|d| d.name == name)
    }

    pub fn vm_profile(&self, name: Option<&str>) -> Result<(&str, &VmProfileConfig)> {
        let name = name.unwrap_or(&self.vm.default_profile);
        match self.vm.profiles.get_key_value(name) {
            Some((key, profile)) => Ok((key.as_str(), profile)),
            None => bail!(
                "unknown VM profile '{}'; available: {}",
                name,
                self.vm.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        }
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        for comp in &self.components {
            match comp.kind {
                ComponentKind::Cargo => {
                    if comp.dir.is_none() || comp.artifact.is_none() {
                        bail!(
                            "cargo component '{}' needs both 'dir' and 'artifact'",
                            comp.name
                        );
                    }
                }
                ComponentKind::Nasm => {
                    if comp.source.is_none() || comp.output.is_none() {
                        bail!(
                            "nasm component '{}' needs both 'source' and 'output'",
                            comp.name
                        );
                    }
                }
                ComponentKind::Command => {
                    if comp.command.is_empty() || comp.output.is_none() {
                        bail!(
                            "command component '{}' needs both 'command' and 'output'",
                            comp.name
                        );
                    }
                }
            }
        }
        for stage in &self.stage {
            if let StageSource::Component(name) = &stage.from {
                if self.component(name).is_none() {
                    bail!(
                        "stage entry '{}' copies unknown component '{}'",
                        stage.name,
                        name
                    );
                }
            }
            if stage.to.is_absolute() {
                bail!(
                    "stage entry '{}' must use a path relative to the image tree",
                    stage.name
                );
            }
        }
        for disk in &self.disks {
            if disk.size_mib == 0 {
                bail!("disk '{}' must have a non-zero size", disk.name);
            }
        }
        if self.inspect.enabled && self.component(&self.inspect.component).is_none() {
            bail!(
                "inspect step refers to unknown component '{}'",
                self.inspect.component
            );
        }
        for (name, profile) in &self.vm.profiles {
            if self.disk(&profile.data_disk).is_none() {
                bail!(
                    "VM profile '{}' uses unknown data disk '{}'",
                    name,
                    profile.data_disk
                );
            }
            if let Some(system) = &profile.system_disk {
                if self.disk(system).is_none() {
                    bail!(
                        "VM profile '{}' uses unknown system disk '{}'",
                        name,
                        system
                    );
                }
            }
        }
        self.vm_profile(None).map(|_| ())
    }
}
