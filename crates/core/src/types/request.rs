use super::AttachmentType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;

/// Well-known identifiers of the four virtual SCSI controllers, indexed by
/// controller number.
pub const SCSI_CONTROLLER_GUIDS: [&str; 4] = [
    "df6d0690-79e5-55b6-a5ec-c1e2f77f580a",
    "0110f83b-de10-5172-a266-78bca56bf50a",
    "b5d2d8d4-3a75-51bf-945b-3444dc6b8579",
    "305891a9-b251-5dfe-91a2-c25d9212275b",
];

/// Port the guest uses to reach Plan9 shares.
pub const PLAN9_PORT: u32 = 564;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Add,
    Remove,
    Update,
}

/// Selects the part of the guest host's configuration a request applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourcePath {
    ScsiAttachment { controller: u8, lun: u8 },
    VirtualSmbShares,
    Plan9Shares,
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourcePath::ScsiAttachment { controller, lun } => {
                let guid = SCSI_CONTROLLER_GUIDS
                    .get(usize::from(*controller))
                    .copied()
                    .unwrap_or("unknown");
                write!(f, "VirtualMachine/Devices/Scsi/{guid}/Attachments/{lun}")
            }
            ResourcePath::VirtualSmbShares => f.write_str("VirtualMachine/Devices/VirtualSmb/Shares"),
            ResourcePath::Plan9Shares => f.write_str("VirtualMachine/Devices/Plan9/Shares"),
        }
    }
}

/// A change to apply to a running guest host.
///
/// `settings` describes the host-side device; `guest_request`, when present,
/// is forwarded to the guest so it can mount or eject the device in the same
/// round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyRequest {
    pub resource_path: ResourcePath,
    pub request_type: RequestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<ModifySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_request: Option<GuestRequest>,
}

impl ModifyRequest {
    pub fn new(resource_path: ResourcePath, request_type: RequestType) -> Self {
        Self {
            resource_path,
            request_type,
            settings: None,
            guest_request: None,
        }
    }

    pub fn with_settings(mut self, settings: impl Into<ModifySettings>) -> Self {
        self.settings = Some(settings.into());
        self
    }

    pub fn with_guest_request(mut self, guest_request: GuestRequest) -> Self {
        self.guest_request = Some(guest_request);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModifySettings {
    Attachment(Attachment),
    Plan9Share(Plan9Share),
    VirtualSmbShare(VirtualSmbShare),
}

impl From<Attachment> for ModifySettings {
    fn from(value: Attachment) -> Self {
        ModifySettings::Attachment(value)
    }
}

impl From<VirtualSmbShare> for ModifySettings {
    fn from(value: VirtualSmbShare) -> Self {
        ModifySettings::VirtualSmbShare(value)
    }
}

impl From<Plan9Share> for ModifySettings {
    fn from(value: Plan9Share) -> Self {
        ModifySettings::Plan9Share(value)
    }
}

/// A block device on the virtual SCSI bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attachment {
    pub path: PathBuf,
    #[serde(rename = "Type")]
    pub attachment_type: AttachmentType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensible_virtual_disk_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmbShareOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub share_read: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_io: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_oplocks: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub take_backup_privilege: bool,
    #[serde(
        default,
        rename = "NoDirectmap",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub no_direct_map: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pseudo_oplocks: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pseudo_direct_notify: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub restrict_file_access: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub single_file_mapping: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmbShare {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<VirtualSmbShareOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_files: Option<Vec<PathBuf>>,
}

/// Flag word understood by the Plan9 device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan9ShareFlags(u32);

impl Plan9ShareFlags {
    pub const NONE: Self = Self(0);
    pub const READ_ONLY: Self = Self(0x0000_0001);
    pub const LINUX_METADATA: Self = Self(0x0000_0004);
    pub const CASE_SENSITIVE: Self = Self(0x0000_0008);
    pub const RESTRICT_FILE_ACCESS: Self = Self(0x0000_0080);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Plan9ShareFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Plan9Share {
    pub name: String,
    pub access_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub port: u32,
    #[serde(default)]
    pub flags: Plan9ShareFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_files: Option<Vec<String>>,
}

/// Instruction forwarded to the guest alongside a host-side change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GuestRequest {
    pub request_type: RequestType,
    pub resource: GuestResource,
}

impl GuestRequest {
    pub fn new(request_type: RequestType, resource: impl Into<GuestResource>) -> Self {
        Self {
            request_type,
            resource: resource.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ResourceType", content = "Settings")]
pub enum GuestResource {
    LinuxMappedVirtualDisk(LinuxMappedVirtualDisk),
    WindowsMappedVirtualDisk(WindowsMappedVirtualDisk),
    LinuxMappedDirectory(LinuxMappedDirectory),
    HostSocketAddress(HostSocketAddress),
}

impl From<LinuxMappedVirtualDisk> for GuestResource {
    fn from(value: LinuxMappedVirtualDisk) -> Self {
        GuestResource::LinuxMappedVirtualDisk(value)
    }
}

impl From<WindowsMappedVirtualDisk> for GuestResource {
    fn from(value: WindowsMappedVirtualDisk) -> Self {
        GuestResource::WindowsMappedVirtualDisk(value)
    }
}

impl From<LinuxMappedDirectory> for GuestResource {
    fn from(value: LinuxMappedDirectory) -> Self {
        GuestResource::LinuxMappedDirectory(value)
    }
}

impl From<HostSocketAddress> for GuestResource {
    fn from(value: HostSocketAddress) -> Self {
        GuestResource::HostSocketAddress(value)
    }
}

/// dm-verity metadata of a read-only image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VerityInfo {
    pub root_digest: String,
    pub salt: String,
    pub algorithm: String,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub data_blocks: u64,
    pub hash_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinuxMappedVirtualDisk {
    /// Empty for attach-only disks.
    #[serde(default)]
    pub mount_path: String,
    pub controller: u8,
    pub lun: u8,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verity: Option<VerityInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WindowsMappedVirtualDisk {
    pub container_path: String,
    pub lun: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinuxMappedDirectory {
    pub mount_path: String,
    pub share_name: String,
    pub port: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostSocketAddress {
    pub local_address: String,
    pub parent_address: String,
}
