//! Plan9 share integration tests.
//!
//! Run with: cargo test --test plan9_test

use std::sync::Arc;
use uvm::test_utils::FakeHost;
use uvm::{Error, Plan9Manager, Plan9Options};
use uvm_core::{ModifySettings, RequestType};

fn read_only() -> Plan9Options {
    Plan9Options {
        read_only: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_identical_adds_create_distinct_shares() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let plan9 = Plan9Manager::new(host.clone());

    let first = plan9.add("/src", "/mnt/src", read_only()).await.unwrap();
    let second = plan9.add("/src", "/mnt/src", read_only()).await.unwrap();

    assert_ne!(first.name(), second.name());
    assert_eq!(host.requests_of(RequestType::Add).len(), 2);
    assert_eq!(plan9.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_each_remove_detaches() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let plan9 = Plan9Manager::new(host.clone());

    let first = plan9.add("/src", "/mnt/a", read_only()).await.unwrap();
    let second = plan9.add("/src", "/mnt/b", read_only()).await.unwrap();

    plan9.remove(&first).await.unwrap();
    assert_eq!(host.requests_of(RequestType::Remove).len(), 1);
    second.release().await.unwrap();
    assert_eq!(host.requests_of(RequestType::Remove).len(), 2);
    assert!(plan9.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_forgets_share_even_when_detach_fails() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let plan9 = Plan9Manager::new(host.clone());
    let share = plan9.add("/src", "/mnt/src", read_only()).await.unwrap();

    host.fail_modify("guest unreachable");
    assert!(matches!(plan9.remove(&share).await, Err(Error::Modify(_))));
    assert!(plan9.list().await.unwrap().is_empty());
    assert!(matches!(
        plan9.remove(&share).await,
        Err(Error::NotAttached(_))
    ));
}

#[tokio::test]
async fn test_add_carries_share_settings_and_guest_mapping() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let plan9 = Plan9Manager::new(host.clone());
    let options = Plan9Options {
        read_only: true,
        restrict: true,
        allowed_names: vec!["config.json".to_string()],
    };

    let share = plan9.add("/bundle", "/run/bundle", options).await.unwrap();

    let requests = host.requests();
    let request = &requests[0];
    let Some(ModifySettings::Plan9Share(settings)) = &request.settings else {
        panic!("expected plan9 settings, got {:?}", request.settings);
    };
    assert_eq!(settings.name, share.name());
    assert_eq!(
        settings.allowed_files,
        Some(vec!["config.json".to_string()])
    );
    assert!(request.guest_request.is_some());
}

#[tokio::test]
async fn test_shares_are_linux_only() {
    let host = Arc::new(FakeHost::windows("vm-1"));
    let plan9 = Plan9Manager::new(host.clone());
    assert!(matches!(
        plan9.add("/src", "/mnt/src", read_only()).await,
        Err(Error::NotSupported(_))
    ));
}

#[tokio::test]
async fn test_writable_share_denied_by_policy() {
    let host = Arc::new(FakeHost::linux("vm-1").disallow_writable_file_shares());
    let plan9 = Plan9Manager::new(host.clone());
    assert!(matches!(
        plan9
            .add("/src", "/mnt/src", Plan9Options::default())
            .await,
        Err(Error::OperationDenied(_))
    ));
    assert_eq!(host.request_count(), 0);
}

#[tokio::test]
async fn test_closed_manager_rejects_operations() {
    let host = Arc::new(FakeHost::linux("vm-1"));
    let plan9 = Plan9Manager::new(host.clone());
    let share = plan9.add("/src", "/mnt/src", read_only()).await.unwrap();

    plan9.close().await.unwrap();
    assert_eq!(host.requests_of(RequestType::Remove).len(), 1);

    assert!(matches!(
        plan9.add("/src", "/mnt/src", read_only()).await,
        Err(Error::InvalidManagerState)
    ));
    assert!(matches!(
        plan9.remove(&share).await,
        Err(Error::InvalidManagerState)
    ));
    assert!(matches!(plan9.list().await, Err(Error::InvalidManagerState)));
}
