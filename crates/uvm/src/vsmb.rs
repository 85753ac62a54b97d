//! Virtual SMB shares for Windows guests.
//!
//! A share exposes a host directory to the guest. Sharing a single file is
//! done by sharing its parent directory restricted to an allow-list of file
//! names. Directory shares and file-restricted shares of the same directory
//! are tracked separately and never merged.

use crate::clone::CloneData;
use crate::manager::Manager;
use crate::refcount::{RefCount, Release};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use uvm_core::{
    Error, GuestOs, Host, ModifyRequest, RequestType, ResourcePath, Result, VirtualSmbShare,
    VirtualSmbShareOptions,
};

/// Prefix of every share path as seen from inside the guest.
pub const VSMB_GUEST_PREFIX: &str = r"\\?\VMSMB\VSMB-{dcc079ae-60ba-4d07-847c-3493609c0870}\";

/// Current format of [`SavedVsmbShare`].
pub const VSMB_SHARE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShareKey {
    host_path: PathBuf,
    read_only: bool,
}

#[derive(Debug)]
struct ShareRecord {
    name: String,
    host_path: PathBuf,
    read_only: bool,
    ref_count: RefCount,
    allowed_files: Option<Vec<PathBuf>>,
    options: VirtualSmbShareOptions,
    share_id: u64,
}

impl ShareRecord {
    fn handle(&self, manager: &Arc<VsmbInner>) -> VsmbShare {
        VsmbShare {
            manager: Arc::downgrade(manager),
            name: self.name.clone(),
            host_path: self.host_path.clone(),
            read_only: self.read_only,
            allowed_files: self.allowed_files.clone(),
            ref_count: self.ref_count.get(),
            share_id: self.share_id,
        }
    }

    fn definition(&self) -> VirtualSmbShare {
        VirtualSmbShare {
            name: self.name.clone(),
            path: Some(self.host_path.clone()),
            options: Some(self.options.clone()),
            allowed_files: self.allowed_files.clone(),
        }
    }

    fn saved(&self) -> SavedVsmbShare {
        SavedVsmbShare {
            version: VSMB_SHARE_VERSION,
            name: self.name.clone(),
            host_path: self.host_path.clone(),
            read_only: self.read_only,
            options: self.options.clone(),
            allowed_files: self.allowed_files.clone(),
        }
    }
}

#[derive(Default)]
pub(crate) struct ShareMaps {
    directories: HashMap<ShareKey, ShareRecord>,
    files: HashMap<ShareKey, ShareRecord>,
}

impl ShareMaps {
    fn map(&self, file_share: bool) -> &HashMap<ShareKey, ShareRecord> {
        if file_share { &self.files } else { &self.directories }
    }

    fn map_mut(&mut self, file_share: bool) -> &mut HashMap<ShareKey, ShareRecord> {
        if file_share {
            &mut self.files
        } else {
            &mut self.directories
        }
    }

    fn records(&self) -> impl Iterator<Item = &ShareRecord> {
        self.directories.values().chain(self.files.values())
    }
}

/// A host directory shared into the guest.
#[derive(Debug, Clone)]
pub struct VsmbShare {
    manager: Weak<VsmbInner>,
    name: String,
    host_path: PathBuf,
    read_only: bool,
    allowed_files: Option<Vec<PathBuf>>,
    ref_count: u32,
    share_id: u64,
}

impl VsmbShare {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared directory. For file shares this is the file's parent.
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    pub fn guest_path(&self) -> String {
        guest_path(&self.name)
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// File names the share is restricted to; `None` for directory shares.
    pub fn allowed_files(&self) -> Option<&[PathBuf]> {
        self.allowed_files.as_deref()
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub async fn release(&self) -> Result<()> {
        let inner = self.manager.upgrade().ok_or(Error::InvalidManagerState)?;
        VsmbManager { inner }.remove(self).await
    }

    fn key(&self) -> ShareKey {
        ShareKey {
            host_path: self.host_path.clone(),
            read_only: self.read_only,
        }
    }

    fn belongs_to(&self, inner: &Arc<VsmbInner>) -> bool {
        std::ptr::eq(self.manager.as_ptr(), Arc::as_ptr(inner))
    }
}

/// Serializable description of a share, used for templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedVsmbShare {
    pub version: u32,
    pub name: String,
    pub host_path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub options: VirtualSmbShareOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_files: Option<Vec<PathBuf>>,
}

struct VsmbInner {
    core: Manager<ShareMaps>,
    no_direct_map: bool,
}

impl std::fmt::Debug for VsmbInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsmbInner")
            .field("no_direct_map", &self.no_direct_map)
            .finish_non_exhaustive()
    }
}

fn guest_path(name: &str) -> String {
    format!("{VSMB_GUEST_PREFIX}{name}")
}

fn share_name(id: u64) -> String {
    format!("s{id:x}")
}

fn parse_share_name(name: &str) -> Option<u64> {
    u64::from_str_radix(name.strip_prefix('s')?, 16).ok()
}

/// Where a requested host path lives once shared.
struct ShareTarget {
    key: ShareKey,
    file_name: Option<PathBuf>,
}

impl ShareTarget {
    async fn resolve(host_path: &Path, read_only: bool) -> Result<Self> {
        let metadata = tokio::fs::metadata(host_path).await?;
        if metadata.is_dir() {
            return Ok(Self {
                key: ShareKey {
                    host_path: host_path.to_path_buf(),
                    read_only,
                },
                file_name: None,
            });
        }
        let (Some(parent), Some(file_name)) = (host_path.parent(), host_path.file_name()) else {
            return Err(Error::InvalidConfig(format!(
                "cannot share {}: no parent directory",
                host_path.display()
            )));
        };
        Ok(Self {
            key: ShareKey {
                host_path: parent.to_path_buf(),
                read_only,
            },
            file_name: Some(PathBuf::from(file_name)),
        })
    }

    fn is_file(&self) -> bool {
        self.file_name.is_some()
    }
}

/// Manages the virtual SMB shares of one guest host.
#[derive(Debug, Clone)]
pub struct VsmbManager {
    inner: Arc<VsmbInner>,
}

impl VsmbManager {
    /// `no_direct_map` disables direct mapping of shared files regardless of
    /// how the guest host is backed.
    pub fn new(host: Arc<dyn Host>, no_direct_map: bool) -> Self {
        Self {
            inner: Arc::new(VsmbInner {
                core: Manager::new(host, ShareMaps::default()),
                no_direct_map,
            }),
        }
    }

    /// Options a caller should start from for a share of this guest host.
    pub async fn default_options(&self, read_only: bool) -> Result<VirtualSmbShareOptions> {
        let host = self.inner.core.host().await?;
        let mut options = VirtualSmbShareOptions {
            no_direct_map: host.devices_physically_backed() || self.inner.no_direct_map,
            ..Default::default()
        };
        if read_only {
            options.share_read = true;
            options.cache_io = true;
            options.read_only = true;
            options.pseudo_oplocks = true;
        }
        Ok(options)
    }

    /// Shares `host_path`, or takes another reference to an existing share
    /// of it. Sharing a file shares its parent directory restricted to that
    /// file.
    pub async fn add(
        &self,
        host_path: impl AsRef<Path>,
        mut options: VirtualSmbShareOptions,
    ) -> Result<VsmbShare> {
        let host_path = host_path.as_ref();
        let mut state = self.inner.core.write().await?;
        let host = Arc::clone(state.host()?);
        if host.os() != GuestOs::Windows {
            return Err(Error::NotSupported(format!(
                "virtual SMB shares are not supported on {} guests",
                host.os()
            )));
        }
        if !options.read_only && host.disallow_writable_file_shares() {
            return Err(Error::OperationDenied(format!(
                "writable share of {} is not allowed",
                host_path.display()
            )));
        }

        let target = ShareTarget::resolve(host_path, options.read_only).await?;
        if target.is_file() {
            options.restrict_file_access = true;
            options.single_file_mapping = true;
        }
        let is_file = target.is_file();

        if let Some(record) = state.index.map(is_file).get(&target.key) {
            let mut allowed_files = record.allowed_files.clone();
            if let (Some(files), Some(file_name)) = (allowed_files.as_mut(), target.file_name) {
                if !files.contains(&file_name) {
                    files.push(file_name);
                }
            }
            if is_file {
                let definition = VirtualSmbShare {
                    name: record.name.clone(),
                    path: Some(record.host_path.clone()),
                    options: Some(options.clone()),
                    allowed_files: allowed_files.clone(),
                };
                host.modify(
                    ModifyRequest::new(ResourcePath::VirtualSmbShares, RequestType::Update)
                        .with_settings(definition),
                )
                .await?;
            }

            let Some(record) = state.index.map_mut(is_file).get_mut(&target.key) else {
                return Err(Error::NotAttached(host_path.display().to_string()));
            };
            record.allowed_files = allowed_files;
            record.options = options;
            record.ref_count.acquire();
            return Ok(record.handle(&self.inner));
        }

        let share_id = state.next_id();
        let record = ShareRecord {
            name: share_name(share_id),
            host_path: target.key.host_path.clone(),
            read_only: target.key.read_only,
            ref_count: RefCount::ONE,
            allowed_files: target.file_name.map(|file_name| vec![file_name]),
            options,
            share_id,
        };
        host.modify(
            ModifyRequest::new(ResourcePath::VirtualSmbShares, RequestType::Add)
                .with_settings(record.definition()),
        )
        .await?;
        tracing::debug!(
            uvm_id = host.id(),
            share = %record.name,
            host_path = %record.host_path.display(),
            file_share = is_file,
            "added vsmb share"
        );

        let share = record.handle(&self.inner);
        state.index.map_mut(is_file).insert(target.key, record);
        Ok(share)
    }

    /// Drops one reference to `share`, removing it from the guest when it
    /// was the last.
    pub async fn remove(&self, share: &VsmbShare) -> Result<()> {
        if !share.belongs_to(&self.inner) {
            return Err(Error::InvalidResourceState);
        }
        let mut state = self.inner.core.write().await?;
        let host = Arc::clone(state.host()?);
        let is_file = share.allowed_files.is_some();
        let key = share.key();

        let record = state
            .index
            .map_mut(is_file)
            .get_mut(&key)
            .filter(|r| r.share_id == share.share_id)
            .ok_or_else(|| Error::NotAttached(share.host_path.display().to_string()))?;
        match record.ref_count.release() {
            Release::Retained(remaining) => {
                record.ref_count = remaining;
                return Ok(());
            }
            Release::Last => {}
        }

        host.modify(remove_request(&record.name)).await?;
        tracing::debug!(uvm_id = host.id(), share = %share.name, "removed vsmb share");
        state.index.map_mut(is_file).remove(&key);
        Ok(())
    }

    /// Looks up the share serving `host_path`, which may be a directory or a
    /// file inside a file-restricted share.
    pub async fn find(&self, host_path: impl AsRef<Path>, read_only: bool) -> Result<VsmbShare> {
        let host_path = host_path.as_ref();
        let target = ShareTarget::resolve(host_path, read_only).await?;
        let state = self.inner.core.read().await?;
        state
            .index
            .map(target.is_file())
            .get(&target.key)
            .filter(|r| match (&target.file_name, &r.allowed_files) {
                (Some(file_name), Some(files)) => files.contains(file_name),
                _ => true,
            })
            .map(|r| r.handle(&self.inner))
            .ok_or_else(|| Error::NotAttached(host_path.display().to_string()))
    }

    /// Path at which the guest sees `host_path`.
    pub async fn guest_path_for(
        &self,
        host_path: impl AsRef<Path>,
        read_only: bool,
    ) -> Result<String> {
        let host_path = host_path.as_ref();
        let share = self.find(host_path, read_only).await?;
        match (share.allowed_files.is_some(), host_path.file_name()) {
            (true, Some(file_name)) => Ok(format!(
                "{}\\{}",
                share.guest_path(),
                file_name.to_string_lossy()
            )),
            _ => Ok(share.guest_path()),
        }
    }

    pub async fn list(&self) -> Result<Vec<VsmbShare>> {
        let state = self.inner.core.read().await?;
        Ok(state.index.records().map(|r| r.handle(&self.inner)).collect())
    }

    pub async fn saved_state(&self) -> Result<Vec<SavedVsmbShare>> {
        let state = self.inner.core.read().await?;
        Ok(state.index.records().map(ShareRecord::saved).collect())
    }

    /// Adds `saved` to a clone's creation document and tracks it here.
    pub async fn clone_from(
        &self,
        saved: &SavedVsmbShare,
        data: &mut CloneData,
    ) -> Result<VsmbShare> {
        if saved.version != VSMB_SHARE_VERSION {
            return Err(Error::UnsupportedVersion {
                kind: "vsmb share",
                found: saved.version,
                supported: VSMB_SHARE_VERSION,
            });
        }
        let mut state = self.inner.core.write().await?;
        let is_file = saved.allowed_files.is_some();
        let key = ShareKey {
            host_path: saved.host_path.clone(),
            read_only: saved.read_only,
        };
        if state.index.map(is_file).contains_key(&key) {
            return Err(Error::AlreadyAttached(saved.host_path.display().to_string()));
        }

        if let Some(id) = parse_share_name(&saved.name) {
            state.reserve_id(id);
        }
        let share_id = state.next_id();
        let record = ShareRecord {
            name: saved.name.clone(),
            host_path: saved.host_path.clone(),
            read_only: saved.read_only,
            ref_count: RefCount::ONE,
            allowed_files: saved.allowed_files.clone(),
            options: saved.options.clone(),
            share_id,
        };
        data.document.add_virtual_smb_share(record.definition());
        let share = record.handle(&self.inner);
        state.index.map_mut(is_file).insert(key, record);
        Ok(share)
    }

    /// Removes every share regardless of reference count and closes the
    /// manager.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.core.write_any().await;
        let Some(host) = state.take_host() else {
            return Ok(());
        };
        let maps = std::mem::take(&mut state.index);
        for record in maps.directories.into_values().chain(maps.files.into_values()) {
            if let Err(e) = host.modify(remove_request(&record.name)).await {
                tracing::warn!(
                    uvm_id = host.id(),
                    share = %record.name,
                    error = %e,
                    "failed to remove vsmb share during close"
                );
            }
        }
        Ok(())
    }

    pub(crate) async fn invalidate(&self) {
        let mut state = self.inner.core.write_any().await;
        state.take_host();
        state.index = ShareMaps::default();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.core.is_closed().await
    }
}

fn remove_request(name: &str) -> ModifyRequest {
    ModifyRequest::new(ResourcePath::VirtualSmbShares, RequestType::Remove).with_settings(
        VirtualSmbShare {
            name: name.to_string(),
            ..Default::default()
        },
    )
}
