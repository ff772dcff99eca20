//! VM launch harness.
//!
//! Provides [`VmConfiguration`] for assembling the emulator invocation from a
//! named profile, [`find_ovmf()`] for UEFI firmware discovery, and
//! [`VmConfiguration::launch`] for running the guest with the operator's
//! terminal attached to its serial console.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};

use crate::config::PipelineConfig;
use crate::disk::DiskImage;
use crate::error::StepError;
use crate::layout::Layout;
use crate::process::Cmd;

/// Lock file guarding the disk images against concurrent launches.
pub const VM_LOCK_FILENAME: &str = ".vm.lock";

/// What backs an emulated drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveBacking {
    /// A host directory exposed as a writable virtual FAT filesystem.
    Vvfat(PathBuf),
    /// A raw image file.
    Raw(PathBuf),
}

impl DriveBacking {
    pub fn path(&self) -> &Path {
        match self {
            DriveBacking::Vvfat(p) | DriveBacking::Raw(p) => p,
        }
    }
}

/// How the drive is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveInterface {
    /// Default IDE/AHCI attachment of the machine.
    Ide,
    /// Not attached by itself; a [`Device`] binds it to a controller.
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drive {
    pub id: String,
    pub backing: DriveBacking,
    pub interface: DriveInterface,
}

/// A controller device, optionally bound to a drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub model: String,
    pub drive: Option<String>,
    /// Stable identifier the guest sees across runs.
    pub serial: Option<String>,
}

/// Everything needed for one emulator invocation.
///
/// Assembled fresh for every launch; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfiguration {
    pub emulator: String,
    pub machine: String,
    pub cpu: String,
    pub smp: u32,
    pub memory: String,
    pub firmware: Option<PathBuf>,
    pub drives: Vec<Drive>,
    pub devices: Vec<Device>,
    pub debug_log: Option<PathBuf>,
    pub debug_flags: Vec<String>,
    pub trace_points: Vec<String>,
    pub no_reboot: bool,
    pub extra_args: Vec<String>,
}

impl VmConfiguration {
    pub fn new(machine: &str, cpu: &str, smp: u32, memory: &str) -> Self {
        Self {
            emulator: "qemu-system-x86_64".to_string(),
            machine: machine.to_string(),
            cpu: cpu.to_string(),
            smp,
            memory: memory.to_string(),
            firmware: None,
            drives: Vec::new(),
            devices: Vec::new(),
            debug_log: None,
            debug_flags: Vec::new(),
            trace_points: Vec::new(),
            no_reboot: false,
            extra_args: Vec::new(),
        }
    }

    pub fn emulator(mut self, emulator: &str) -> Self {
        self.emulator = emulator.to_string();
        self
    }

    pub fn uefi(mut self, ovmf_path: PathBuf) -> Self {
        self.firmware = Some(ovmf_path);
        self
    }

    pub fn drive(mut self, id: &str, backing: DriveBacking, interface: DriveInterface) -> Self {
        self.drives.push(Drive {
            id: id.to_string(),
            backing,
            interface,
        });
        self
    }

    pub fn device(mut self, model: &str, drive: Option<&str>, serial: Option<&str>) -> Self {
        self.devices.push(Device {
            model: model.to_string(),
            drive: drive.map(str::to_string),
            serial: serial.map(str::to_string),
        });
        self
    }

    pub fn debug_log(mut self, path: PathBuf, flags: &[String]) -> Self {
        self.debug_log = Some(path);
        self.debug_flags = flags.to_vec();
        self
    }

    pub fn trace(mut self, points: &[String]) -> Self {
        self.trace_points.extend(points.iter().cloned());
        self
    }

    /// Assemble the configuration for a named profile.
    ///
    /// Firmware comes from the config, or [`find_ovmf()`] when unset.
    pub fn from_profile(
        config: &PipelineConfig,
        layout: &Layout,
        profile: Option<&str>,
    ) -> Result<Self> {
        let (name, profile) = config.vm_profile(profile)?;
        log::debug!("assembling VM profile '{}'", name);

        let disk_dir = layout.disk_dir.path();
        let disk = |disk_name: &str| -> Result<DiskImage> {
            let cfg = config.disk(disk_name).with_context(|| {
                format!("VM profile '{}' uses unknown disk '{}'", name, disk_name)
            })?;
            Ok(DiskImage::from_config(disk_dir, cfg))
        };

        let mut vm = VmConfiguration::new(&profile.machine, &profile.cpu, profile.smp, &profile.memory)
            .emulator(&config.vm.emulator);
        vm.firmware = config
            .vm
            .firmware
            .as_ref()
            .map(|p| layout.resolve(p))
            .or_else(find_ovmf);

        if let Some(system) = &profile.system_disk {
            vm = vm.drive(
                "system",
                DriveBacking::Raw(disk(system)?.path),
                DriveInterface::Ide,
            );
        }
        vm = vm
            .drive(
                "tree",
                DriveBacking::Vvfat(layout.image_tree.path().to_path_buf()),
                DriveInterface::Ide,
            )
            .drive(
                "nvm",
                DriveBacking::Raw(disk(&profile.data_disk)?.path),
                DriveInterface::Detached,
            )
            .device("nvme", Some("nvm"), Some(&profile.nvme_serial))
            .debug_log(
                layout.debug_dir.path().join(&profile.debug_log),
                &profile.debug_flags,
            )
            .trace(&profile.trace_points);
        vm.no_reboot = profile.no_reboot;
        vm.extra_args = profile.extra_args.clone();
        Ok(vm)
    }

    /// Every device must reference a drive declared in this configuration,
    /// and each drive is bound at most once.
    pub fn validate(&self) -> Result<()> {
        for (i, drive) in self.drives.iter().enumerate() {
            if self.drives[..i].iter().any(|d| d.id == drive.id) {
                bail!("duplicate drive id '{}'", drive.id);
            }
        }
        let mut bound: Vec<&str> = Vec::new();
        for device in &self.devices {
            let Some(id) = device.drive.as_deref() else {
                continue;
            };
            let Some(drive) = self.drives.iter().find(|d| d.id == id) else {
                bail!("device '{}' references unknown drive '{}'", device.model, id);
            };
            if drive.interface != DriveInterface::Detached {
                bail!(
                    "drive '{}' is already attached by interface and cannot back device '{}'",
                    id,
                    device.model
                );
            }
            if bound.contains(&id) {
                bail!("drive '{}' is bound to more than one device", id);
            }
            bound.push(id);
        }
        Ok(())
    }

    /// Emulator arguments, in a stable order.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |a: &str, b: String| {
            args.push(a.into());
            args.push(b.into());
        };

        push("-machine", self.machine.clone());
        push("-cpu", self.cpu.clone());
        push("-smp", self.smp.to_string());
        push("-m", self.memory.clone());

        // UEFI firmware
        if let Some(ovmf) = &self.firmware {
            push(
                "-drive",
                format!("if=pflash,format=raw,readonly=on,file={}", escape(ovmf)),
            );
        }

        for drive in &self.drives {
            let file = match &drive.backing {
                DriveBacking::Vvfat(dir) => format!("fat:rw:{}", escape(dir)),
                DriveBacking::Raw(path) => escape(path),
            };
            let iface = match drive.interface {
                DriveInterface::Ide => "ide",
                DriveInterface::Detached => "none",
            };
            push(
                "-drive",
                format!("id={},if={},format=raw,file={}", drive.id, iface, file),
            );
        }

        for device in &self.devices {
            let mut spec = device.model.clone();
            if let Some(drive) = &device.drive {
                spec.push_str(&format!(",drive={}", drive));
            }
            if let Some(serial) = &device.serial {
                spec.push_str(&format!(",serial={}", serial));
            }
            push("-device", spec);
        }

        // Console on our stdio; no display, no network
        push("-serial", "stdio".to_string());
        push("-display", "none".to_string());
        push("-net", "none".to_string());

        if let Some(log) = &self.debug_log {
            push("-D", log.display().to_string());
            if !self.debug_flags.is_empty() {
                push("-d", self.debug_flags.join(","));
            }
        }
        for point in &self.trace_points {
            push("-trace", point.clone());
        }

        if self.no_reboot {
            args.push("-no-reboot".into());
        }
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    pub fn command(&self) -> Cmd {
        Cmd::new(&self.emulator).args(self.to_args())
    }

    /// Check everything the emulator will open before spawning it.
    ///
    /// Missing images are reported, never created: provisioning is a
    /// separate step.
    fn check_backing(&self) -> Result<()> {
        let Some(firmware) = &self.firmware else {
            bail!("OVMF firmware not found; set [vm] firmware in bootstage.toml");
        };
        if !firmware.is_file() {
            bail!("firmware '{}' does not exist", firmware.display());
        }
        for drive in &self.drives {
            match &drive.backing {
                DriveBacking::Vvfat(dir) if !dir.is_dir() => bail!(
                    "image tree '{}' for drive '{}' does not exist; build and stage first",
                    dir.display(),
                    drive.id
                ),
                DriveBacking::Raw(path) if !path.is_file() => bail!(
                    "disk image '{}' for drive '{}' does not exist; run 'bootstage provision'",
                    path.display(),
                    drive.id
                ),
                _ => {}
            }
        }
        Ok(())
    }

    /// Spawn the emulator with inherited stdio.
    ///
    /// `lock_dir` holds the advisory lock that rejects a second launch
    /// against the same disk images.
    pub fn launch(&self, lock_dir: &Path) -> Result<VmSession> {
        let launch_error = |e: anyhow::Error| {
            anyhow::Error::from(StepError::Launch {
                reason: format!("{:#}", e),
            })
        };

        self.validate().map_err(launch_error)?;
        self.check_backing().map_err(launch_error)?;
        let lock = VmLock::acquire(lock_dir).map_err(launch_error)?;

        if let Some(parent) = self.debug_log.as_deref().and_then(Path::parent) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }

        let cmd = self.command();
        log::info!("launching {}", cmd);
        let child = cmd
            .to_command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.emulator))
            .map_err(launch_error)?;

        Ok(VmSession { child, _lock: lock })
    }
}

/// Double commas so QEMU option parsing keeps the path intact.
fn escape(path: &Path) -> String {
    path.display().to_string().replace(',', ",,")
}

/// Exclusive advisory lock, released on drop.
#[derive(Debug)]
struct VmLock {
    file: File,
}

impl VmLock {
    fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))?;
        let path = dir.join(VM_LOCK_FILENAME);
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening lock '{}'", path.display()))?;
        file.try_lock_exclusive().with_context(|| {
            format!(
                "another VM is already using the disk images (lock held: {})",
                path.display()
            )
        })?;
        Ok(Self { file })
    }
}

impl Drop for VmLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// A running emulator. The disk lock is held until the session ends.
#[derive(Debug)]
pub struct VmSession {
    child: Child,
    _lock: VmLock,
}

impl VmSession {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait for the emulator; a non-zero status becomes
    /// [`StepError::VmExit`] carrying the same code.
    pub fn wait(mut self) -> Result<()> {
        let status = self.child.wait().context("waiting for emulator")?;
        if status.success() {
            return Ok(());
        }
        Err(StepError::VmExit {
            code: exit_code(status),
        }
        .into())
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Find OVMF firmware for UEFI boot.
pub fn find_ovmf() -> Option<PathBuf> {
    let candidates = [
        // Fedora/RHEL
        "/usr/share/edk2/ovmf/OVMF_CODE.fd",
        "/usr/share/OVMF/OVMF_CODE.fd",
        // Debian/Ubuntu
        "/usr/share/OVMF/OVMF_CODE_4M.fd",
        "/usr/share/qemu/OVMF.fd",
        // Arch
        "/usr/share/edk2-ovmf/x64/OVMF_CODE.fd",
        "/usr/share/edk2/x64/OVMF_CODE.4m.fd",
        // NixOS
        "/run/libvirt/nix-ovmf/OVMF_CODE.fd",
    ];

    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        layout: Layout,
        config: PipelineConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().to_path_buf();
            let layout = Layout::new(
                &root,
                Path::new(".hdd/root"),
                Path::new(".debug"),
                Path::new(".hdd"),
            );
            layout.ensure_all().unwrap();
            fs::write(root.join("OVMF_CODE.fd"), "").unwrap();

            let mut config = PipelineConfig::reference();
            config.vm.firmware = Some(PathBuf::from("OVMF_CODE.fd"));
            Self {
                _temp: temp,
                root,
                layout,
                config,
            }
        }

        /// Emulator stand-in that ignores its arguments and exits with `code`.
        fn fake_emulator(&mut self, code: i32) {
            let path = self.root.join("fake-qemu");
            fs::write(&path, format!("#!/bin/sh\nexit {}\n", code)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            self.config.vm.emulator = path.display().to_string();
        }

        fn provision(&self) {
            for disk in &self.config.disks {
                fs::write(self.layout.disk_dir.path().join(&disk.path), "").unwrap();
            }
        }

        fn vm(&self, profile: Option<&str>) -> VmConfiguration {
            VmConfiguration::from_profile(&self.config, &self.layout, profile).unwrap()
        }
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    fn value_after(args: &[String], flag: &str) -> Vec<String> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].clone())
            .collect()
    }

    #[test]
    fn test_reference_profile_arguments() {
        let fx = Fixture::new();
        let args = strings(&fx.vm(None).to_args());
        let root = fx.root.display().to_string();

        assert_eq!(&args[..8], ["-machine", "q35", "-cpu", "qemu64", "-smp", "4", "-m", "4G"]);
        assert_eq!(
            value_after(&args, "-drive"),
            [
                format!("if=pflash,format=raw,readonly=on,file={}/OVMF_CODE.fd", root),
                format!("id=tree,if=ide,format=raw,file=fat:rw:{}/.hdd/root", root),
                format!("id=nvm,if=none,format=raw,file={}/.hdd/nvme.img", root),
            ]
        );
        assert_eq!(value_after(&args, "-device"), ["nvme,drive=nvm,serial=deadbeef"]);
        assert_eq!(value_after(&args, "-serial"), ["stdio"]);
        assert_eq!(value_after(&args, "-display"), ["none"]);
        assert_eq!(value_after(&args, "-net"), ["none"]);
        assert_eq!(value_after(&args, "-D"), [format!("{}/.debug/qemu.log", root)]);
        assert_eq!(value_after(&args, "-d"), ["int,guest_errors"]);
        assert!(value_after(&args, "-trace").contains(&"pci_nvme_err_invalid_prp".to_string()));
    }

    #[test]
    fn test_system_disk_profile_arguments() {
        let fx = Fixture::new();
        let args = strings(&fx.vm(Some("system-disk")).to_args());
        let root = fx.root.display().to_string();

        assert_eq!(value_after(&args, "-m"), ["256M"]);
        assert_eq!(
            value_after(&args, "-drive")[1],
            format!("id=system,if=ide,format=raw,file={}/.hdd/disk.img", root)
        );
        assert_eq!(value_after(&args, "-device"), ["nvme,drive=nvm,serial=deadbeef"]);
        assert!(value_after(&args, "-trace").is_empty());
    }

    #[test]
    fn test_commas_in_paths_are_escaped() {
        let vm = VmConfiguration::new("q35", "qemu64", 1, "1G").drive(
            "tree",
            DriveBacking::Vvfat(PathBuf::from("/tmp/a,b")),
            DriveInterface::Ide,
        );
        let args = strings(&vm.to_args());
        assert!(args.contains(&"id=tree,if=ide,format=raw,file=fat:rw:/tmp/a,,b".to_string()));
    }

    #[test]
    fn test_validate_rejects_unknown_drive() {
        let vm = VmConfiguration::new("q35", "qemu64", 4, "4G").device(
            "nvme",
            Some("nvm"),
            Some("deadbeef"),
        );
        assert!(vm.validate().is_err());

        let vm = vm.drive(
            "nvm",
            DriveBacking::Raw(PathBuf::from("nvme.img")),
            DriveInterface::Detached,
        );
        vm.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_double_binding() {
        let vm = VmConfiguration::new("q35", "qemu64", 4, "4G")
            .drive(
                "nvm",
                DriveBacking::Raw(PathBuf::from("nvme.img")),
                DriveInterface::Detached,
            )
            .device("nvme", Some("nvm"), Some("a"))
            .device("nvme", Some("nvm"), Some("b"));
        assert!(vm.validate().is_err());
    }

    #[test]
    fn test_exit_status_is_propagated() {
        let mut fx = Fixture::new();
        fx.fake_emulator(3);
        fx.provision();

        let err = fx
            .vm(None)
            .launch(fx.layout.disk_dir.path())
            .unwrap()
            .wait()
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StepError>(),
            Some(StepError::VmExit { code: 3 })
        ));
        assert_eq!(crate::error::exit_code_for(&err), 3);
    }

    #[test]
    fn test_clean_exit_is_ok() {
        let mut fx = Fixture::new();
        fx.fake_emulator(0);
        fx.provision();

        fx.vm(None)
            .launch(fx.layout.disk_dir.path())
            .unwrap()
            .wait()
            .unwrap();
    }

    #[test]
    fn test_missing_data_image_fails_without_creating_it() {
        let mut fx = Fixture::new();
        fx.fake_emulator(0);

        let err = fx.vm(None).launch(fx.layout.disk_dir.path()).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StepError>(),
            Some(StepError::Launch { .. })
        ));
        assert!(!fx.root.join(".hdd/nvme.img").exists());
    }

    #[test]
    fn test_second_launch_is_rejected_while_locked() {
        let mut fx = Fixture::new();
        fx.fake_emulator(0);
        fx.provision();
        let held = VmLock::acquire(fx.layout.disk_dir.path()).unwrap();

        let err = fx.vm(None).launch(fx.layout.disk_dir.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("already using"));

        drop(held);
        fx.vm(None)
            .launch(fx.layout.disk_dir.path())
            .unwrap()
            .wait()
            .unwrap();
    }
}
