//! Template capture and clone integration tests.
//!
//! Run with: cargo test --test clone_test

use std::path::PathBuf;
use std::sync::Arc;
use uvm::test_utils::{FakeAccessGranter, FakeSystem};
use uvm::{
    CloneCoordinator, CloneData, Error, GuestHost, GuestHostConfig, Plan9Options, ScsiAttach,
    TemplateConfig, TemplateResource,
};
use uvm_core::{GuestOs, VmAccess};

fn guest_host(id: &str, os: GuestOs) -> (GuestHost, Arc<FakeSystem>, Arc<FakeAccessGranter>) {
    let system = Arc::new(FakeSystem::new(id));
    let access = Arc::new(FakeAccessGranter::new());
    let host = GuestHost::builder(GuestHostConfig::new(id, os), system.clone())
        .access_granter(access.clone())
        .build();
    (host, system, access)
}

#[tokio::test]
async fn test_linux_template_round_trip() {
    let disks = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let root = disks.path().join("sandbox.vhdx");
    let layer = disks.path().join("layer.vhdx");
    let data_disk = disks.path().join("data.vhdx");
    std::fs::write(&root, b"root disk").unwrap();
    std::fs::write(&data_disk, b"data disk").unwrap();

    let (template, _template_system, _) = guest_host("template-1", GuestOs::Linux);
    template
        .scsi()
        .set_root_mount(&root, None, false)
        .await
        .unwrap();
    template
        .scsi()
        .add(
            ScsiAttach::virtual_disk(&layer)
                .read_only(true)
                .guest_path("/run/layers/0"),
        )
        .await
        .unwrap();
    template
        .scsi()
        .add(ScsiAttach::virtual_disk(&data_disk).guest_path("/data"))
        .await
        .unwrap();
    template
        .plan9()
        .add("/src", "/mnt/src", Plan9Options::default())
        .await
        .unwrap();

    let config = CloneCoordinator::capture(&template).await.unwrap();
    assert_eq!(config.template_id, "template-1");
    assert_eq!(config.resources.len(), 4);
    let config = TemplateConfig::from_json(&config.to_json().unwrap()).unwrap();

    let (clone, clone_system, clone_access) = guest_host("clone-1", GuestOs::Linux);
    let mut data = CloneData::new("clone-1", scratch.path());
    CloneCoordinator::apply(&config, &clone, &mut data)
        .await
        .unwrap();

    let root_copy = scratch.path().join("sandbox.vhdx");
    let data_copy = scratch.path().join("clone-mount-0-2").join("data.vhdx");
    assert_eq!(std::fs::read(&root_copy).unwrap(), b"root disk");
    assert_eq!(std::fs::read(&data_copy).unwrap(), b"data disk");

    let document = &data.document;
    assert_eq!(document.scsi_attachment(0, 0).unwrap().path, root_copy);
    assert_eq!(document.scsi_attachment(0, 1).unwrap().path, layer);
    assert_eq!(document.scsi_attachment(0, 2).unwrap().path, data_copy);
    assert_eq!(document.plan9.as_ref().unwrap().shares.len(), 1);

    assert_eq!(clone.scsi().list().await.unwrap().len(), 3);
    assert_eq!(clone.plan9().list().await.unwrap().len(), 1);
    assert_eq!(
        clone_access.grants(),
        vec![
            ("clone-1".to_string(), root_copy, VmAccess::Individual),
            ("clone-1".to_string(), data_copy, VmAccess::Individual),
        ]
    );
    assert!(clone_system.modifies().is_empty());
}

#[tokio::test]
async fn test_applying_template_twice_conflicts() {
    let scratch = tempfile::tempdir().unwrap();
    let (template, _, _) = guest_host("template-1", GuestOs::Linux);
    template
        .scsi()
        .add(ScsiAttach::virtual_disk("/layers/base.vhdx").read_only(true))
        .await
        .unwrap();
    let config = CloneCoordinator::capture(&template).await.unwrap();

    let (clone, _, _) = guest_host("clone-1", GuestOs::Linux);
    let mut data = CloneData::new("clone-1", scratch.path());
    CloneCoordinator::apply(&config, &clone, &mut data)
        .await
        .unwrap();
    let err = CloneCoordinator::apply(&config, &clone, &mut data)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyAttached(_)));
}

#[tokio::test]
async fn test_cloned_vsmb_share_keeps_name() {
    let shared = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();

    let (template, _, _) = guest_host("template-1", GuestOs::Windows);
    let options = template.vsmb().default_options(true).await.unwrap();
    let original = template
        .vsmb()
        .add(shared.path(), options.clone())
        .await
        .unwrap();
    let config = CloneCoordinator::capture(&template).await.unwrap();
    assert!(matches!(
        config.resources.as_slice(),
        [TemplateResource::Vsmb(_)]
    ));

    let (clone, _, _) = guest_host("clone-1", GuestOs::Windows);
    let mut data = CloneData::new("clone-1", scratch.path());
    CloneCoordinator::apply(&config, &clone, &mut data)
        .await
        .unwrap();

    let shares = &data.document.virtual_smb.as_ref().unwrap().shares;
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0].name, original.name());
    assert_eq!(shares[0].path, Some(PathBuf::from(shared.path())));

    let cloned = clone.vsmb().find(shared.path(), true).await.unwrap();
    assert_eq!(cloned.name(), original.name());
    let fresh = clone.vsmb().add(other.path(), options).await.unwrap();
    assert_ne!(fresh.name(), original.name());
}

#[tokio::test]
async fn test_failed_clone_grant_leaves_template_untouched() {
    let disks = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let layer = disks.path().join("layer.vhdx");
    let data_disk = disks.path().join("data.vhdx");
    std::fs::write(&data_disk, b"data disk").unwrap();

    let (template, _, _) = guest_host("template-1", GuestOs::Linux);
    template
        .scsi()
        .add(ScsiAttach::virtual_disk(&layer).read_only(true))
        .await
        .unwrap();
    template
        .scsi()
        .add(ScsiAttach::virtual_disk(&data_disk))
        .await
        .unwrap();
    let config = CloneCoordinator::capture(&template).await.unwrap();

    let (clone, clone_system, clone_access) = guest_host("clone-1", GuestOs::Linux);
    clone_access.fail();
    let mut data = CloneData::new("clone-1", scratch.path());
    let err = CloneCoordinator::apply(&config, &clone, &mut data)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OperationDenied(_)));

    let copy_dir = scratch.path().join("clone-mount-0-1");
    assert!(!copy_dir.join("data.vhdx").exists());
    assert!(!copy_dir.exists());
    assert!(data.document.scsi_attachment(0, 1).is_none());
    let cloned = clone.scsi().list().await.unwrap();
    assert_eq!(cloned.len(), 1);
    assert_eq!(cloned[0].host_path(), layer);
    assert!(clone_system.modifies().is_empty());

    let original = template.scsi().find(&data_disk).await.unwrap();
    assert_eq!((original.controller(), original.lun()), (0, 1));
    assert_eq!(original.host_path(), data_disk);
    assert_eq!(original.ref_count(), 1);
    assert_eq!(std::fs::read(&data_disk).unwrap(), b"data disk");
}
