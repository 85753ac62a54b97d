mod document;
mod request;

pub use document::{ComputeSystemDocument, Plan9, ScsiController, VirtualSmb};
pub use request::{
    Attachment, GuestRequest, GuestResource, HostSocketAddress, LinuxMappedDirectory,
    LinuxMappedVirtualDisk, ModifyRequest, ModifySettings, PLAN9_PORT, Plan9Share,
    Plan9ShareFlags, RequestType, ResourcePath, SCSI_CONTROLLER_GUIDS, VerityInfo,
    VirtualSmbShare, VirtualSmbShareOptions, WindowsMappedVirtualDisk,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating system running inside the guest host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestOs {
    #[default]
    Linux,
    Windows,
}

impl fmt::Display for GuestOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestOs::Linux => f.write_str("linux"),
            GuestOs::Windows => f.write_str("windows"),
        }
    }
}

/// Kind of host-level access grant applied to a backing file before attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmAccess {
    /// No grant is needed (pass-through devices, pre-granted files).
    NoOp,
    /// Grant to the group shared by all guest hosts.
    Group,
    /// Grant to this guest host only.
    #[default]
    Individual,
}

/// How a block device is presented on the virtual SCSI bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttachmentType {
    #[default]
    VirtualDisk,
    PassThru,
    ExtensibleVirtualDisk,
}

impl AttachmentType {
    /// Whether the backing file needs a filesystem-level access grant.
    pub fn requires_access_grant(self) -> bool {
        !matches!(self, AttachmentType::ExtensibleVirtualDisk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod guest_os {
        use super::*;

        #[test]
        fn serializes_lowercase() {
            assert_eq!(serde_json::to_string(&GuestOs::Linux).unwrap(), "\"linux\"");
            assert_eq!(
                serde_json::to_string(&GuestOs::Windows).unwrap(),
                "\"windows\""
            );
        }

        #[test]
        fn default_is_linux() {
            assert_eq!(GuestOs::default(), GuestOs::Linux);
        }

        #[test]
        fn display_matches_serialized_form() {
            assert_eq!(GuestOs::Windows.to_string(), "windows");
        }
    }

    mod vm_access {
        use super::*;

        #[test]
        fn default_is_individual() {
            assert_eq!(VmAccess::default(), VmAccess::Individual);
        }

        #[test]
        fn deserializes_lowercase() {
            assert_eq!(
                serde_json::from_str::<VmAccess>("\"noop\"").unwrap(),
                VmAccess::NoOp
            );
        }
    }

    mod attachment_type {
        use super::*;

        #[test]
        fn extensible_disk_skips_access_grant() {
            assert!(AttachmentType::VirtualDisk.requires_access_grant());
            assert!(AttachmentType::PassThru.requires_access_grant());
            assert!(!AttachmentType::ExtensibleVirtualDisk.requires_access_grant());
        }

        #[test]
        fn serializes_as_schema_name() {
            assert_eq!(
                serde_json::to_string(&AttachmentType::PassThru).unwrap(),
                "\"PassThru\""
            );
        }
    }
}
