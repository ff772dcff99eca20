use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use bootstage::config::BuildProfile;
use bootstage::pipeline::Pipeline;
use bootstage::{exit_code_for, preflight};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bootstage")]
#[command(author, version, about = "Build, stage and boot a bare-metal OS image under QEMU")]
struct Cli {
    /// Repository root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Config file (defaults to <root>/bootstage.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Build profile: release or debug (overrides BOOTSTAGE_PROFILE)
    #[arg(long, global = true)]
    profile: Option<BuildProfile>,

    /// Independent targets built in parallel
    #[arg(long, short, global = true)]
    jobs: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, stage, disassemble the kernel and provision disk images
    All,
    /// Build and stage only
    Build,
    /// Build, stage, then boot the image
    Run {
        /// VM profile to launch
        #[arg(long)]
        vm_profile: Option<String>,
    },
    /// Create missing disk images
    Provision,
    /// Remove bootloader, kernel and trampoline artifacts
    Reset {
        /// Also remove the disk images
        #[arg(long)]
        disks: bool,
    },
    /// Reset, then build everything again
    Rebuild,
    /// Clean every component through its own toolchain
    Clean,
    /// Update every component's dependencies
    Update,
    /// Show which targets are out of date
    Status,
    /// Check that the required host tools are installed
    Preflight,
    /// Print the emulator command line
    PrintVm {
        /// VM profile to print
        #[arg(long)]
        vm_profile: Option<String>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(u8::try_from(exit_code_for(&e)).unwrap_or(1))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let pipeline = Pipeline::open(&root, cli.config.as_deref(), cli.profile, cli.jobs)?;

    match cli.command {
        Commands::All => pipeline.all().map(|_| ()),
        Commands::Build => pipeline.build().map(|_| ()),
        Commands::Run { vm_profile } => pipeline.run(vm_profile.as_deref()),
        Commands::Provision => {
            for (disk, provisioned) in pipeline.provision()? {
                log::info!("[{}] {:?}: {}", disk.name, provisioned, disk.path.display());
            }
            Ok(())
        }
        Commands::Reset { disks } => {
            let removed = pipeline.reset(disks)?;
            if removed.is_empty() {
                log::info!("nothing to remove");
            }
            Ok(())
        }
        Commands::Rebuild => pipeline.rebuild().map(|_| ()),
        Commands::Clean => pipeline.clean(),
        Commands::Update => pipeline.update(),
        Commands::Status => {
            for line in pipeline.status()? {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Preflight => {
            preflight::check_host_tools(&pipeline.config)?;
            println!("All required host tools are installed.");
            Ok(())
        }
        Commands::PrintVm { vm_profile } => {
            let vm = pipeline.vm(vm_profile.as_deref())?;
            vm.validate()?;
            println!("{}", vm.command());
            Ok(())
        }
    }
}
