//! Template capture and replay.
//!
//! A running template guest host is captured into a [`TemplateConfig`]. The
//! config is later replayed into the creation document of a new guest host,
//! which then starts with the same devices at the same locations.

use crate::guest_host::GuestHost;
use crate::plan9::{SavedPlan9Share, PLAN9_SHARE_VERSION};
use crate::scsi::{SavedScsiMount, SCSI_MOUNT_VERSION};
use crate::vsmb::{SavedVsmbShare, VSMB_SHARE_VERSION};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uvm_core::{ComputeSystemDocument, Error, Result};

/// Current format of [`TemplateConfig`].
pub const TEMPLATE_CONFIG_VERSION: u32 = 1;

/// Everything a clone step needs to know about the guest host being created.
#[derive(Debug, Clone)]
pub struct CloneData {
    /// Creation document of the clone, mutated in place by each clone step.
    pub document: ComputeSystemDocument,
    /// Directory that receives copies of the template's writable disks.
    pub scratch_dir: PathBuf,
    /// Id of the clone, used for access grants.
    pub target_id: String,
}

impl CloneData {
    pub fn new(target_id: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        let target_id = target_id.into();
        Self {
            document: ComputeSystemDocument::new(target_id.clone()),
            scratch_dir: scratch_dir.into(),
            target_id,
        }
    }
}

/// One captured resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateResource {
    Scsi(SavedScsiMount),
    Vsmb(SavedVsmbShare),
    Plan9(SavedPlan9Share),
}

impl TemplateResource {
    fn version(&self) -> (&'static str, u32, u32) {
        match self {
            TemplateResource::Scsi(m) => ("scsi mount", m.version, SCSI_MOUNT_VERSION),
            TemplateResource::Vsmb(s) => ("vsmb share", s.version, VSMB_SHARE_VERSION),
            TemplateResource::Plan9(s) => ("plan9 share", s.version, PLAN9_SHARE_VERSION),
        }
    }
}

/// Portable snapshot of a template guest host's resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub version: u32,
    pub template_id: String,
    pub resources: Vec<TemplateResource>,
}

impl TemplateConfig {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a template, rejecting any format version this build does not
    /// understand.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.version != TEMPLATE_CONFIG_VERSION {
            return Err(Error::UnsupportedVersion {
                kind: "template config",
                found: config.version,
                supported: TEMPLATE_CONFIG_VERSION,
            });
        }
        for resource in &config.resources {
            let (kind, found, supported) = resource.version();
            if found != supported {
                return Err(Error::UnsupportedVersion {
                    kind,
                    found,
                    supported,
                });
            }
        }
        Ok(config)
    }
}

pub struct CloneCoordinator;

impl CloneCoordinator {
    /// Snapshots every resource currently held by `template`.
    pub async fn capture(template: &GuestHost) -> Result<TemplateConfig> {
        let mut resources = Vec::new();
        resources.extend(
            template
                .scsi()
                .saved_state()
                .await?
                .into_iter()
                .map(TemplateResource::Scsi),
        );
        resources.extend(
            template
                .vsmb()
                .saved_state()
                .await?
                .into_iter()
                .map(TemplateResource::Vsmb),
        );
        resources.extend(
            template
                .plan9()
                .saved_state()
                .await?
                .into_iter()
                .map(TemplateResource::Plan9),
        );
        tracing::debug!(
            template_id = template.id(),
            resources = resources.len(),
            "captured template"
        );
        Ok(TemplateConfig {
            version: TEMPLATE_CONFIG_VERSION,
            template_id: template.id().to_string(),
            resources,
        })
    }

    /// Replays `config` into `clone`'s managers and `data.document`.
    pub async fn apply(
        config: &TemplateConfig,
        clone: &GuestHost,
        data: &mut CloneData,
    ) -> Result<()> {
        for resource in &config.resources {
            match resource {
                TemplateResource::Scsi(saved) => {
                    clone.scsi().clone_from(saved, data).await?;
                }
                TemplateResource::Vsmb(saved) => {
                    clone.vsmb().clone_from(saved, data).await?;
                }
                TemplateResource::Plan9(saved) => {
                    clone.plan9().clone_from(saved, data).await?;
                }
            }
        }
        tracing::debug!(
            template_id = %config.template_id,
            clone_id = %data.target_id,
            "applied template"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm_core::AttachmentType;

    fn sample() -> TemplateConfig {
        TemplateConfig {
            version: TEMPLATE_CONFIG_VERSION,
            template_id: "template-1".to_string(),
            resources: vec![
                TemplateResource::Scsi(SavedScsiMount {
                    version: 1,
                    host_path: PathBuf::from("/scratch/sandbox.vhdx"),
                    guest_path: None,
                    controller: 0,
                    lun: 0,
                    attachment_type: AttachmentType::VirtualDisk,
                    evd_type: None,
                    read_only: false,
                    encrypted: false,
                    options: Vec::new(),
                }),
                TemplateResource::Plan9(SavedPlan9Share {
                    version: 1,
                    name: "0".to_string(),
                    host_path: PathBuf::from("/src"),
                    guest_path: "/mnt/src".to_string(),
                    read_only: true,
                    restrict: false,
                    allowed_names: Vec::new(),
                }),
            ],
        }
    }

    #[test]
    fn resources_are_tagged_by_kind() {
        let json = sample().to_json().unwrap();
        assert!(json.contains("\"kind\":\"scsi\""));
        assert!(json.contains("\"kind\":\"plan9\""));
        assert_eq!(TemplateConfig::from_json(&json).unwrap(), sample());
    }

    #[test]
    fn rejects_unknown_template_version() {
        let mut config = sample();
        config.version = 2;
        let json = config.to_json().unwrap();
        assert!(matches!(
            TemplateConfig::from_json(&json),
            Err(Error::UnsupportedVersion {
                kind: "template config",
                found: 2,
                supported: 1
            })
        ));
    }

    #[test]
    fn rejects_unknown_resource_version() {
        let mut config = sample();
        if let TemplateResource::Plan9(share) = &mut config.resources[1] {
            share.version = 5;
        }
        let json = config.to_json().unwrap();
        assert!(matches!(
            TemplateConfig::from_json(&json),
            Err(Error::UnsupportedVersion {
                kind: "plan9 share",
                found: 5,
                ..
            })
        ));
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        assert!(matches!(
            TemplateConfig::from_json("{\"version\":"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn clone_data_document_is_owned_by_target() {
        let data = CloneData::new("clone-7", "/scratch/clone-7");
        assert_eq!(data.document.owner, "clone-7");
        assert_eq!(data.scratch_dir, PathBuf::from("/scratch/clone-7"));
    }
}
