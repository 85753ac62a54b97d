//! Plan9 directory shares for Linux guests.
//!
//! Unlike the other managers there is no reference counting here: every
//! [`Plan9Manager::add`] creates and attaches a new share, and every
//! [`Plan9Manager::remove`] detaches one. Callers that want to share a
//! directory once and hand it to several consumers track that themselves.

use crate::clone::CloneData;
use crate::manager::Manager;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use uvm_core::{
    Error, GuestOs, GuestRequest, Host, LinuxMappedDirectory, ModifyRequest, PLAN9_PORT,
    Plan9Share as Plan9ShareSettings, Plan9ShareFlags, RequestType, ResourcePath, Result,
};

/// Current format of [`SavedPlan9Share`].
pub const PLAN9_SHARE_VERSION: u32 = 1;

/// Options for [`Plan9Manager::add`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan9Options {
    pub read_only: bool,
    /// Limit the share to `allowed_names` inside the host directory.
    pub restrict: bool,
    pub allowed_names: Vec<String>,
}

#[derive(Debug, Clone)]
struct ShareRecord {
    name: String,
    host_path: PathBuf,
    guest_path: String,
    read_only: bool,
    restrict: bool,
    allowed_names: Vec<String>,
}

impl ShareRecord {
    fn flags(&self) -> Plan9ShareFlags {
        let mut flags = Plan9ShareFlags::LINUX_METADATA | Plan9ShareFlags::CASE_SENSITIVE;
        if self.read_only {
            flags = flags | Plan9ShareFlags::READ_ONLY;
        }
        if self.restrict {
            flags = flags | Plan9ShareFlags::RESTRICT_FILE_ACCESS;
        }
        flags
    }

    fn settings(&self) -> Plan9ShareSettings {
        Plan9ShareSettings {
            name: self.name.clone(),
            access_name: self.name.clone(),
            path: Some(self.host_path.clone()),
            port: PLAN9_PORT,
            flags: self.flags(),
            allowed_files: self.restrict.then(|| self.allowed_names.clone()),
        }
    }

    fn guest_mapping(&self) -> LinuxMappedDirectory {
        LinuxMappedDirectory {
            mount_path: self.guest_path.clone(),
            share_name: self.name.clone(),
            port: PLAN9_PORT,
            read_only: self.read_only,
        }
    }

    fn handle(&self, manager: &Arc<Plan9Inner>) -> Plan9Share {
        Plan9Share {
            manager: Arc::downgrade(manager),
            name: self.name.clone(),
            host_path: self.host_path.clone(),
            guest_path: self.guest_path.clone(),
            read_only: self.read_only,
        }
    }

    fn saved(&self) -> SavedPlan9Share {
        SavedPlan9Share {
            version: PLAN9_SHARE_VERSION,
            name: self.name.clone(),
            host_path: self.host_path.clone(),
            guest_path: self.guest_path.clone(),
            read_only: self.read_only,
            restrict: self.restrict,
            allowed_names: self.allowed_names.clone(),
        }
    }
}

/// A host directory mapped into a Linux guest over Plan9.
#[derive(Debug, Clone)]
pub struct Plan9Share {
    manager: Weak<Plan9Inner>,
    name: String,
    host_path: PathBuf,
    guest_path: String,
    read_only: bool,
}

impl Plan9Share {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    pub fn guest_path(&self) -> &str {
        &self.guest_path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub async fn release(&self) -> Result<()> {
        let inner = self.manager.upgrade().ok_or(Error::InvalidManagerState)?;
        Plan9Manager { inner }.remove(self).await
    }
}

/// Serializable description of a share, used for templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPlan9Share {
    pub version: u32,
    pub name: String,
    pub host_path: PathBuf,
    pub guest_path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub restrict: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_names: Vec<String>,
}

struct Plan9Inner {
    core: Manager<BTreeMap<String, ShareRecord>>,
}

impl std::fmt::Debug for Plan9Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan9Inner").finish_non_exhaustive()
    }
}

/// Manages the Plan9 shares of one guest host.
#[derive(Debug, Clone)]
pub struct Plan9Manager {
    inner: Arc<Plan9Inner>,
}

impl Plan9Manager {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            inner: Arc::new(Plan9Inner {
                core: Manager::new(host, BTreeMap::new()),
            }),
        }
    }

    /// Shares `host_path` at `guest_path`. Always creates a new share.
    pub async fn add(
        &self,
        host_path: impl Into<PathBuf>,
        guest_path: impl Into<String>,
        options: Plan9Options,
    ) -> Result<Plan9Share> {
        let host_path = host_path.into();
        let guest_path = guest_path.into();
        let mut state = self.inner.core.write().await?;
        let host = Arc::clone(state.host()?);
        if host.os() != GuestOs::Linux {
            return Err(Error::NotSupported(format!(
                "plan9 shares are not supported on {} guests",
                host.os()
            )));
        }
        if guest_path.is_empty() {
            return Err(Error::InvalidConfig(
                "plan9 shares require a guest path".to_string(),
            ));
        }
        if !options.read_only && host.disallow_writable_file_shares() {
            return Err(Error::OperationDenied(format!(
                "writable share of {} is not allowed",
                host_path.display()
            )));
        }

        let record = ShareRecord {
            name: state.next_id().to_string(),
            host_path,
            guest_path,
            read_only: options.read_only,
            restrict: options.restrict,
            allowed_names: options.allowed_names,
        };
        let request = ModifyRequest::new(ResourcePath::Plan9Shares, RequestType::Add)
            .with_settings(record.settings())
            .with_guest_request(GuestRequest::new(RequestType::Add, record.guest_mapping()));
        host.modify(request).await?;
        tracing::debug!(
            uvm_id = host.id(),
            share = %record.name,
            host_path = %record.host_path.display(),
            guest_path = %record.guest_path,
            "added plan9 share"
        );

        let share = record.handle(&self.inner);
        state.index.insert(record.name.clone(), record);
        Ok(share)
    }

    /// Detaches `share`. The share is forgotten even if the detach fails;
    /// the detach error is still returned.
    pub async fn remove(&self, share: &Plan9Share) -> Result<()> {
        if !std::ptr::eq(share.manager.as_ptr(), Arc::as_ptr(&self.inner)) {
            return Err(Error::InvalidResourceState);
        }
        let mut state = self.inner.core.write().await?;
        let host = Arc::clone(state.host()?);
        let record = state
            .index
            .remove(&share.name)
            .ok_or_else(|| Error::NotAttached(share.host_path.display().to_string()))?;

        host.modify(remove_request(&record)).await?;
        tracing::debug!(uvm_id = host.id(), share = %record.name, "removed plan9 share");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Plan9Share>> {
        let state = self.inner.core.read().await?;
        Ok(state.index.values().map(|r| r.handle(&self.inner)).collect())
    }

    pub async fn saved_state(&self) -> Result<Vec<SavedPlan9Share>> {
        let state = self.inner.core.read().await?;
        Ok(state.index.values().map(ShareRecord::saved).collect())
    }

    /// Adds `saved` to a clone's creation document and tracks it here.
    pub async fn clone_from(
        &self,
        saved: &SavedPlan9Share,
        data: &mut CloneData,
    ) -> Result<Plan9Share> {
        if saved.version != PLAN9_SHARE_VERSION {
            return Err(Error::UnsupportedVersion {
                kind: "plan9 share",
                found: saved.version,
                supported: PLAN9_SHARE_VERSION,
            });
        }
        let mut state = self.inner.core.write().await?;
        if state.index.contains_key(&saved.name) {
            return Err(Error::AlreadyAttached(format!(
                "plan9 share {} already exists",
                saved.name
            )));
        }
        if let Ok(id) = saved.name.parse::<u64>() {
            state.reserve_id(id);
        }

        let record = ShareRecord {
            name: saved.name.clone(),
            host_path: saved.host_path.clone(),
            guest_path: saved.guest_path.clone(),
            read_only: saved.read_only,
            restrict: saved.restrict,
            allowed_names: saved.allowed_names.clone(),
        };
        data.document.add_plan9_share(record.settings());
        let share = record.handle(&self.inner);
        state.index.insert(record.name.clone(), record);
        Ok(share)
    }

    /// Detaches every share and closes the manager.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.core.write_any().await;
        let Some(host) = state.take_host() else {
            return Ok(());
        };
        for record in std::mem::take(&mut state.index).into_values() {
            if let Err(e) = host.modify(remove_request(&record)).await {
                tracing::warn!(
                    uvm_id = host.id(),
                    share = %record.name,
                    error = %e,
                    "failed to remove plan9 share during close"
                );
            }
        }
        Ok(())
    }

    pub(crate) async fn invalidate(&self) {
        let mut state = self.inner.core.write_any().await;
        state.take_host();
        state.index.clear();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.core.is_closed().await
    }
}

fn remove_request(record: &ShareRecord) -> ModifyRequest {
    ModifyRequest::new(ResourcePath::Plan9Shares, RequestType::Remove)
        .with_settings(record.settings())
        .with_guest_request(GuestRequest::new(
            RequestType::Remove,
            record.guest_mapping(),
        ))
}
