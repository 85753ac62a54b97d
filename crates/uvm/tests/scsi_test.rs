//! SCSI manager integration tests.
//!
//! These drive a [`ScsiManager`] against a recording fake host.
//! Run with: cargo test --test scsi_test

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use uvm::test_utils::FakeHost;
use uvm::{Error, LUNS_PER_CONTROLLER, ScsiAttach, ScsiManager};
use uvm_core::{NoAccessControl, RequestType};

fn manager(host: &Arc<FakeHost>, controllers: u8) -> ScsiManager {
    ScsiManager::new(host.clone(), controllers, Arc::new(NoAccessControl), None)
}

fn disk(name: &str) -> ScsiAttach {
    ScsiAttach::virtual_disk(format!("/disks/{name}.vhdx"))
}

#[tokio::test]
async fn test_concurrent_adds_of_same_path_issue_one_attach() {
    let host = Arc::new(FakeHost::linux("vm-1").with_delay(Duration::from_millis(50)));
    let scsi = manager(&host, 1);

    let (first, second) = tokio::join!(scsi.add(disk("vm")), scsi.add(disk("vm")));
    let first = first.expect("first add failed");
    let second = second.expect("second add failed");

    assert_eq!((first.controller(), first.lun()), (0, 0));
    assert_eq!((second.controller(), second.lun()), (0, 0));
    assert_eq!(host.requests_of(RequestType::Add).len(), 1);

    let mount = scsi.find("/disks/vm.vhdx").await.expect("mount not found");
    assert_eq!(mount.ref_count(), 2);
}

#[tokio::test]
async fn test_many_concurrent_adds_share_one_attach() {
    let host = Arc::new(FakeHost::linux("vm-1").with_delay(Duration::from_millis(20)));
    let scsi = manager(&host, 1);

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let scsi = scsi.clone();
        tasks.spawn(async move { scsi.add(disk("shared")).await });
    }
    while let Some(joined) = tasks.join_next().await {
        let mount = joined.expect("task panicked").expect("add failed");
        assert_eq!((mount.controller(), mount.lun()), (0, 0));
    }

    assert_eq!(host.request_count(), 1);
    let mount = scsi.find("/disks/shared.vhdx").await.unwrap();
    assert_eq!(mount.ref_count(), 8);
}

#[tokio::test]
async fn test_concurrent_adds_share_first_error() {
    let host = Arc::new(FakeHost::linux("vm-1").with_delay(Duration::from_millis(50)));
    host.fail_modify("host unavailable");
    let scsi = manager(&host, 1);

    let (first, second) = tokio::join!(scsi.add(disk("vm")), scsi.add(disk("vm")));

    for result in [first, second] {
        let err = result.expect_err("add should fail");
        assert!(matches!(err, Error::Attach { controller: 0, lun: 0, .. }));
        assert!(matches!(err.root_cause(), Error::Modify(msg) if msg == "host unavailable"));
    }
    assert_eq!(host.request_count(), 1);
    assert!(scsi.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_attach_frees_its_location() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let scsi = manager(&host, 1);

    host.fail_modify("attach rejected");
    scsi.add(disk("bad")).await.expect_err("add should fail");
    host.succeed_modify();

    let mount = scsi.add(disk("good")).await.unwrap();
    assert_eq!((mount.controller(), mount.lun()), (0, 0));
}

#[tokio::test]
async fn test_n_adds_then_n_removes_detach_once() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let scsi = manager(&host, 1);

    let mut mounts = Vec::new();
    for _ in 0..3 {
        mounts.push(scsi.add(disk("layer").guest_path("/run/layer")).await.unwrap());
    }
    assert_eq!(host.requests_of(RequestType::Add).len(), 1);

    for mount in &mounts[..2] {
        scsi.remove(mount).await.unwrap();
        assert!(host.requests_of(RequestType::Remove).is_empty());
    }
    assert_eq!(scsi.find("/disks/layer.vhdx").await.unwrap().ref_count(), 1);

    mounts[2].release().await.unwrap();
    assert_eq!(host.requests_of(RequestType::Remove).len(), 1);
    assert!(matches!(
        scsi.find("/disks/layer.vhdx").await,
        Err(Error::NotAttached(_))
    ));
}

#[tokio::test]
async fn test_allocation_picks_lowest_free_location() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let scsi = manager(&host, 1);

    let a = scsi.add(disk("a")).await.unwrap();
    let b = scsi.add(disk("b")).await.unwrap();
    let c = scsi.add(disk("c")).await.unwrap();
    assert_eq!([a.lun(), b.lun(), c.lun()], [0, 1, 2]);

    scsi.remove(&b).await.unwrap();
    let d = scsi.add(disk("d")).await.unwrap();
    assert_eq!((d.controller(), d.lun()), (0, 1));

    let e = scsi.add(disk("e")).await.unwrap();
    assert_eq!(e.lun(), 3);
}

#[tokio::test]
async fn test_65th_attach_fails_with_too_many_attachments() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let scsi = manager(&host, 1);

    for i in 0..LUNS_PER_CONTROLLER {
        let mount = scsi.add(disk(&format!("d{i}"))).await.unwrap();
        assert_eq!((mount.controller(), mount.lun()), (0, i));
    }

    let err = scsi.add(disk("overflow")).await.unwrap_err();
    assert!(matches!(err, Error::TooManyAttachments { controllers: 1 }));
    assert_eq!(host.request_count(), usize::from(LUNS_PER_CONTROLLER));
}

#[tokio::test]
async fn test_second_controller_used_when_first_is_full() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let scsi = manager(&host, 2);

    for i in 0..LUNS_PER_CONTROLLER {
        scsi.add(disk(&format!("d{i}"))).await.unwrap();
    }
    let mount = scsi.add(disk("next")).await.unwrap();
    assert_eq!((mount.controller(), mount.lun()), (1, 0));
}

#[tokio::test]
async fn test_closed_manager_rejects_operations() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let scsi = manager(&host, 1);
    let mount = scsi.add(disk("a")).await.unwrap();

    scsi.close().await.unwrap();
    assert_eq!(host.requests_of(RequestType::Remove).len(), 1);

    assert!(matches!(
        scsi.add(disk("b")).await,
        Err(Error::InvalidManagerState)
    ));
    assert!(matches!(
        scsi.remove(&mount).await,
        Err(Error::InvalidManagerState)
    ));
    assert!(matches!(
        scsi.find("/disks/a.vhdx").await,
        Err(Error::InvalidManagerState)
    ));
    assert!(matches!(scsi.list().await, Err(Error::InvalidManagerState)));
}

#[tokio::test]
async fn test_close_continues_past_detach_failures() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let scsi = manager(&host, 1);
    let _a = scsi.add(disk("a")).await.unwrap();
    let _b = scsi.add(disk("b")).await.unwrap();
    let _b_again = scsi.add(disk("b")).await.unwrap();

    host.fail_modify("guest gone");
    scsi.close().await.unwrap();

    assert_eq!(host.requests_of(RequestType::Remove).len(), 2);
    assert!(scsi.is_closed().await);
}

#[tokio::test]
async fn test_guest_path_lookup() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let scsi = manager(&host, 1);
    scsi.add(disk("mounted").guest_path("/run/mounts/m0"))
        .await
        .unwrap();
    scsi.add(disk("attached")).await.unwrap();

    assert_eq!(
        scsi.guest_path("/disks/mounted.vhdx").await.unwrap(),
        Some("/run/mounts/m0".to_string())
    );
    assert_eq!(scsi.guest_path("/disks/attached.vhdx").await.unwrap(), None);
    assert!(matches!(
        scsi.guest_path("/disks/missing.vhdx").await,
        Err(Error::NotAttached(_))
    ));
}

#[tokio::test]
async fn test_cancelled_waiter_returns_its_reference() {
    let host = Arc::new(FakeHost::linux("vm-1").with_delay(Duration::from_millis(100)));
    let scsi = manager(&host, 1);

    let owner = tokio::spawn({
        let scsi = scsi.clone();
        async move { scsi.add(disk("vm")).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let waited = tokio::time::timeout(Duration::from_millis(10), scsi.add(disk("vm"))).await;
    assert!(waited.is_err(), "waiter should still be blocked on the attach");

    let mount = owner.await.expect("task panicked").expect("owner add failed");
    assert_eq!(scsi.find("/disks/vm.vhdx").await.unwrap().ref_count(), 1);

    scsi.remove(&mount).await.unwrap();
    assert_eq!(host.requests_of(RequestType::Remove).len(), 1);
    assert!(scsi.list().await.unwrap().is_empty());
}
