//! Capability traits for the collaborators the control plane drives.
//!
//! Nothing in this crate talks to a hypervisor directly. The resource
//! managers go through [`Host`], the lifecycle goes through
//! [`ComputeSystem`] and [`GuestConnection`], and host-side file preparation
//! goes through [`AccessGranter`] and [`VerityReader`].

use crate::capabilities::GuestCapabilities;
use crate::error::Result;
use crate::types::{GuestOs, GuestRequest, ModifyRequest, VerityInfo, VmAccess};
use async_trait::async_trait;
use std::path::Path;

/// The view of a guest host that resource managers need.
#[async_trait]
pub trait Host: Send + Sync {
    fn id(&self) -> &str;
    fn os(&self) -> GuestOs;
    /// Whether guest memory and devices are backed by physical host pages.
    fn devices_physically_backed(&self) -> bool;
    /// Policy switch forbidding writable file shares into the guest.
    fn disallow_writable_file_shares(&self) -> bool;
    /// Applies a change to the running guest host. May be slow; may fail.
    async fn modify(&self, request: ModifyRequest) -> Result<()>;
}

/// A hypervisor compute system backing one guest host.
#[async_trait]
pub trait ComputeSystem: Send + Sync {
    fn id(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    /// Requests a graceful shutdown. Returning `Ok` only means the request
    /// was delivered.
    async fn shutdown(&self) -> Result<()>;
    async fn terminate(&self) -> Result<()>;
    /// Resolves once the system has exited; `Err` carries the exit error.
    async fn wait(&self) -> Result<()>;
    async fn modify(&self, request: &ModifyRequest) -> Result<()>;
    /// Releases the underlying system handle.
    async fn close(&self) -> Result<()>;
}

/// An established connection to the agent running inside the guest.
#[async_trait]
pub trait GuestConnection: Send + Sync {
    fn protocol_version(&self) -> u32;
    fn capabilities(&self) -> &GuestCapabilities;
    async fn modify(&self, request: GuestRequest) -> Result<()>;
    /// Asks the guest to shut the container host `id` down.
    async fn shutdown(&self, id: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait GuestConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn GuestConnection>>;
}

/// Grants a guest host access to a host file before it is attached.
#[async_trait]
pub trait AccessGranter: Send + Sync {
    async fn grant(&self, vm_id: &str, path: &Path, access: VmAccess) -> Result<()>;
}

/// Access granter for hosts without per-VM file ACLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccessControl;

#[async_trait]
impl AccessGranter for NoAccessControl {
    async fn grant(&self, _vm_id: &str, _path: &Path, _access: VmAccess) -> Result<()> {
        Ok(())
    }
}

/// Reads dm-verity metadata appended to a read-only image.
#[async_trait]
pub trait VerityReader: Send + Sync {
    /// Returns `None` when the image carries no verity footer.
    async fn read_verity_info(&self, path: &Path) -> Result<Option<VerityInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_access_control_always_grants() {
        let granter = NoAccessControl;
        granter
            .grant("vm-1", Path::new("/disks/a.vhdx"), VmAccess::Individual)
            .await
            .unwrap();
        granter
            .grant("vm-1", Path::new("/does/not/exist"), VmAccess::Group)
            .await
            .unwrap();
    }

    #[test]
    fn traits_are_object_safe() {
        fn assert_object<T: ?Sized>() {}
        assert_object::<dyn Host>();
        assert_object::<dyn ComputeSystem>();
        assert_object::<dyn GuestConnection>();
        assert_object::<dyn GuestConnector>();
        assert_object::<dyn AccessGranter>();
        assert_object::<dyn VerityReader>();
    }
}
