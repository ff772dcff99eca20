//! Build, stage, provision and boot a bare-metal OS image.
//!
//! The pipeline compiles a UEFI bootloader, a kernel and its support library,
//! assembles the AP trampoline, copies the results into a firmware-bootable
//! directory tree, creates the raw disk images the guest uses, and boots the
//! lot under QEMU with the serial console on the caller's terminal.
//!
//! - **Build graph** - targets rebuilt only when a tracked source is newer
//!   than the artifact ([`graph`])
//! - **Components** - cargo / nasm / command builders ([`components`])
//! - **Staging** - copies into the image tree ([`staging`])
//! - **Inspection** - kernel disassembly listing ([`inspect`])
//! - **Disks** - create-once raw images ([`disk`])
//! - **VM harness** - QEMU invocation and launch ([`qemu`])
//!
//! # Architecture
//!
//! ```text
//! sources ──► components ──► staging ──► image tree ─┐
//!                  │                                  ├──► qemu
//!                  └──► inspect (diagnostic)          │
//! disk provisioner ──► disk.img / nvme.img ───────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bootstage::pipeline::Pipeline;
//!
//! let pipeline = Pipeline::open(&repo_root, None, None, None)?;
//! pipeline.all()?;
//! pipeline.run(Some("reference"))?;
//! ```

pub mod components;
pub mod config;
pub mod disk;
pub mod error;
pub mod fsutil;
pub mod graph;
pub mod inspect;
pub mod layout;
pub mod manifest;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod qemu;
pub mod staging;

pub use config::{BuildProfile, PipelineConfig};
pub use error::{exit_code_for, StepError};
pub use graph::{BuildAction, BuildGraph, BuildTarget, Freshness, RunReport, TargetOutcome};
pub use pipeline::Pipeline;
