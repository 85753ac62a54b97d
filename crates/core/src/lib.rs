pub mod capabilities;
pub mod error;
pub mod host;
pub mod types;

pub use capabilities::GuestCapabilities;
pub use error::{Error, Result};
pub use host::{
    AccessGranter, ComputeSystem, GuestConnection, GuestConnector, Host, NoAccessControl,
    VerityReader,
};
pub use types::{
    Attachment, AttachmentType, ComputeSystemDocument, GuestOs, GuestRequest, GuestResource,
    HostSocketAddress, LinuxMappedDirectory, LinuxMappedVirtualDisk, ModifyRequest,
    ModifySettings, PLAN9_PORT, Plan9, Plan9Share, Plan9ShareFlags, RequestType, ResourcePath,
    SCSI_CONTROLLER_GUIDS, ScsiController, VerityInfo, VirtualSmb, VirtualSmbShare,
    VirtualSmbShareOptions, VmAccess, WindowsMappedVirtualDisk,
};
