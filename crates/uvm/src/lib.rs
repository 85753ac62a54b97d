//! Host-side control plane for a lightweight utility VM.
//!
//! A [`GuestHost`] wraps the hypervisor's compute system and owns one
//! resource manager per device kind:
//!
//! - [`ScsiManager`] attaches disks on a fixed grid of SCSI controllers and
//!   LUNs. Attaching a host path twice shares one attachment.
//! - [`VsmbManager`] exposes host directories (or single files) to Windows
//!   guests over virtual SMB. Shares are reference counted.
//! - [`Plan9Manager`] exposes host directories to Linux guests over Plan 9.
//!   Every add is a new share.
//!
//! [`CloneCoordinator`] captures a template guest host's resources into a
//! [`TemplateConfig`] and replays it into the creation document of a clone.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use uvm::{GuestHost, GuestHostConfig, ScsiAttach};
//! use uvm_core::{ComputeSystem, GuestOs};
//!
//! # async fn example(system: Arc<dyn ComputeSystem>) -> uvm::Result<()> {
//! let config = GuestHostConfig::new("vm-1", GuestOs::Linux);
//! let host = GuestHost::builder(config, system).build();
//! host.start().await?;
//!
//! let layer = ScsiAttach::virtual_disk("/layers/base.vhdx")
//!     .guest_path("/run/layers/0")
//!     .read_only(true);
//! let disk = host.scsi().add(layer).await?;
//! disk.release().await?;
//!
//! host.close().await?;
//! # Ok(())
//! # }
//! ```

mod clone;
mod config;
mod gate;
mod guest_host;
mod manager;
mod plan9;
mod refcount;
mod scsi;
mod vsmb;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use clone::{
    CloneCoordinator, CloneData, TEMPLATE_CONFIG_VERSION, TemplateConfig, TemplateResource,
};
pub use config::{GuestHostConfig, ShutdownPolicy};
pub use guest_host::{GuestHost, GuestHostBuilder, GuestHostState};
pub use plan9::{PLAN9_SHARE_VERSION, Plan9Manager, Plan9Options, Plan9Share, SavedPlan9Share};
pub use scsi::{
    LUNS_PER_CONTROLLER, MAX_SCSI_CONTROLLERS, SCSI_MOUNT_VERSION, SavedScsiMount, ScsiAttach,
    ScsiManager, ScsiMount,
};
pub use vsmb::{SavedVsmbShare, VSMB_GUEST_PREFIX, VSMB_SHARE_VERSION, VsmbManager, VsmbShare};

pub use uvm_core::{Error, Result};
