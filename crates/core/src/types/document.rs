use super::request::{Attachment, Plan9Share, SCSI_CONTROLLER_GUIDS, VirtualSmbShare};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Creation-time configuration of a guest host.
///
/// Only the device sections the resource managers populate are modelled;
/// the rest of the document belongs to whoever creates the compute system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputeSystemDocument {
    pub owner: String,
    /// SCSI controllers keyed by controller GUID.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scsi: BTreeMap<String, ScsiController>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_smb: Option<VirtualSmb>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan9: Option<Plan9>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScsiController {
    /// Attachments keyed by LUN.
    #[serde(default)]
    pub attachments: BTreeMap<String, Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmb {
    #[serde(default)]
    pub shares: Vec<VirtualSmbShare>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_file_mapping_in_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Plan9 {
    #[serde(default)]
    pub shares: Vec<Plan9Share>,
}

impl ComputeSystemDocument {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Default::default()
        }
    }

    /// Places `attachment` at `(controller, lun)`, replacing any previous
    /// entry at that location.
    pub fn set_scsi_attachment(&mut self, controller: u8, lun: u8, attachment: Attachment) {
        let key = SCSI_CONTROLLER_GUIDS
            .get(usize::from(controller))
            .map(|guid| guid.to_string())
            .unwrap_or_else(|| controller.to_string());
        self.scsi
            .entry(key)
            .or_default()
            .attachments
            .insert(lun.to_string(), attachment);
    }

    pub fn scsi_attachment(&self, controller: u8, lun: u8) -> Option<&Attachment> {
        let guid = SCSI_CONTROLLER_GUIDS.get(usize::from(controller))?;
        self.scsi.get(*guid)?.attachments.get(&lun.to_string())
    }

    pub fn add_virtual_smb_share(&mut self, share: VirtualSmbShare) {
        self.virtual_smb.get_or_insert_with(VirtualSmb::default).shares.push(share);
    }

    pub fn add_plan9_share(&mut self, share: Plan9Share) {
        self.plan9.get_or_insert_with(Plan9::default).shares.push(share);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttachmentType;
    use std::path::PathBuf;

    fn attachment(path: &str) -> Attachment {
        Attachment {
            path: PathBuf::from(path),
            attachment_type: AttachmentType::VirtualDisk,
            read_only: false,
            extensible_virtual_disk_type: None,
        }
    }

    #[test]
    fn new_document_has_no_devices() {
        let doc = ComputeSystemDocument::new("clone-1");
        assert_eq!(doc.owner, "clone-1");
        assert!(doc.scsi.is_empty());
        assert!(doc.virtual_smb.is_none());
        assert!(doc.plan9.is_none());
    }

    #[test]
    fn set_scsi_attachment_keys_by_guid_and_lun() {
        let mut doc = ComputeSystemDocument::new("clone-1");
        doc.set_scsi_attachment(0, 3, attachment("/scratch/a.vhdx"));

        let controller = doc
            .scsi
            .get(SCSI_CONTROLLER_GUIDS[0])
            .expect("controller 0 should exist");
        assert!(controller.attachments.contains_key("3"));
        assert_eq!(
            doc.scsi_attachment(0, 3).map(|a| a.path.clone()),
            Some(PathBuf::from("/scratch/a.vhdx"))
        );
    }

    #[test]
    fn set_scsi_attachment_replaces_same_location() {
        let mut doc = ComputeSystemDocument::new("clone-1");
        doc.set_scsi_attachment(1, 0, attachment("/a.vhdx"));
        doc.set_scsi_attachment(1, 0, attachment("/b.vhdx"));
        assert_eq!(doc.scsi[SCSI_CONTROLLER_GUIDS[1]].attachments.len(), 1);
        assert_eq!(
            doc.scsi_attachment(1, 0).map(|a| a.path.clone()),
            Some(PathBuf::from("/b.vhdx"))
        );
    }

    #[test]
    fn shares_are_appended() {
        let mut doc = ComputeSystemDocument::new("clone-1");
        doc.add_virtual_smb_share(VirtualSmbShare {
            name: "s1".to_string(),
            ..Default::default()
        });
        doc.add_virtual_smb_share(VirtualSmbShare {
            name: "s2".to_string(),
            ..Default::default()
        });
        doc.add_plan9_share(Plan9Share {
            name: "0".to_string(),
            access_name: "0".to_string(),
            ..Default::default()
        });

        assert_eq!(doc.virtual_smb.as_ref().map(|v| v.shares.len()), Some(2));
        assert_eq!(doc.plan9.as_ref().map(|p| p.shares.len()), Some(1));
    }

    #[test]
    fn serialization_roundtrip() {
        let mut doc = ComputeSystemDocument::new("clone-1");
        doc.set_scsi_attachment(0, 0, attachment("/scratch/sandbox.vhdx"));
        let json = serde_json::to_string(&doc).unwrap();
        let back: ComputeSystemDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
