//! SCSI block-device attachments.
//!
//! Disks live on a fixed grid of [`MAX_SCSI_CONTROLLERS`] controllers with
//! [`LUNS_PER_CONTROLLER`] LUNs each. Adding a host path that is already
//! attached bumps its reference count instead of attaching it again; adds that
//! race with the first attach of a path wait for that attach and share its
//! outcome, so at most one attach request per path is ever in flight.

use crate::clone::CloneData;
use crate::gate::{Gate, GateResult, GateSender, gate};
use crate::manager::{Manager, ManagerState};
use crate::refcount::{RefCount, Release};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use uvm_core::{
    AccessGranter, Attachment, AttachmentType, Error, GuestOs, GuestRequest, Host,
    LinuxMappedVirtualDisk, ModifyRequest, RequestType, ResourcePath, Result, VerityInfo,
    VerityReader, VmAccess, WindowsMappedVirtualDisk,
};

pub const MAX_SCSI_CONTROLLERS: u8 = 4;
pub const LUNS_PER_CONTROLLER: u8 = 64;

/// Current format of [`SavedScsiMount`].
pub const SCSI_MOUNT_VERSION: u32 = 1;

const EVD_SCHEME: &str = "evd://";

/// Parameters for [`ScsiManager::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiAttach {
    host_path: PathBuf,
    guest_path: Option<String>,
    attachment_type: AttachmentType,
    evd_type: Option<String>,
    read_only: bool,
    encrypted: bool,
    options: Vec<String>,
    access: VmAccess,
}

impl ScsiAttach {
    fn new(host_path: PathBuf, attachment_type: AttachmentType, access: VmAccess) -> Self {
        Self {
            host_path,
            guest_path: None,
            attachment_type,
            evd_type: None,
            read_only: false,
            encrypted: false,
            options: Vec::new(),
            access,
        }
    }

    /// A VHD/VHDX file attached as a virtual disk.
    pub fn virtual_disk(host_path: impl Into<PathBuf>) -> Self {
        Self::new(host_path.into(), AttachmentType::VirtualDisk, VmAccess::Individual)
    }

    /// A physical disk passed through to the guest.
    pub fn pass_through(host_path: impl Into<PathBuf>) -> Self {
        Self::new(host_path.into(), AttachmentType::PassThru, VmAccess::NoOp)
    }

    /// An extensible virtual disk given as `evd://<provider type>/<path>`.
    pub fn extensible(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(EVD_SCHEME)
            .ok_or_else(|| Error::InvalidConfig(format!("not an extensible disk: {uri}")))?;
        let (evd_type, path) = rest
            .split_once('/')
            .filter(|(evd_type, path)| !evd_type.is_empty() && !path.is_empty())
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "extensible disk must be {EVD_SCHEME}<type>/<path>: {uri}"
                ))
            })?;
        let mut attach = Self::new(
            PathBuf::from(path),
            AttachmentType::ExtensibleVirtualDisk,
            VmAccess::NoOp,
        );
        attach.evd_type = Some(evd_type.to_string());
        Ok(attach)
    }

    /// Mounts the disk at `guest_path` inside the guest.
    pub fn guest_path(mut self, guest_path: impl Into<String>) -> Self {
        self.guest_path = Some(guest_path.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Mount options passed to the guest.
    pub fn guest_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn access(mut self, access: VmAccess) -> Self {
        self.access = access;
        self
    }

    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    pub fn evd_type(&self) -> Option<&str> {
        self.evd_type.as_deref()
    }
}

#[derive(Debug)]
struct MountRecord {
    host_path: PathBuf,
    guest_path: Option<String>,
    controller: u8,
    lun: u8,
    attachment_type: AttachmentType,
    evd_type: Option<String>,
    read_only: bool,
    encrypted: bool,
    options: Vec<String>,
    ref_count: RefCount,
    gate: Gate,
    attach_id: u64,
}

impl MountRecord {
    fn handle(&self, manager: &Arc<ScsiInner>) -> ScsiMount {
        ScsiMount {
            manager: Arc::downgrade(manager),
            host_path: self.host_path.clone(),
            guest_path: self.guest_path.clone(),
            controller: self.controller,
            lun: self.lun,
            attachment_type: self.attachment_type,
            read_only: self.read_only,
            ref_count: self.ref_count.get(),
            attach_id: self.attach_id,
        }
    }

    fn saved(&self) -> SavedScsiMount {
        SavedScsiMount {
            version: SCSI_MOUNT_VERSION,
            host_path: self.host_path.clone(),
            guest_path: self.guest_path.clone(),
            controller: self.controller,
            lun: self.lun,
            attachment_type: self.attachment_type,
            evd_type: self.evd_type.clone(),
            read_only: self.read_only,
            encrypted: self.encrypted,
            options: self.options.clone(),
        }
    }

    fn attachment(&self) -> Attachment {
        Attachment {
            path: self.host_path.clone(),
            attachment_type: self.attachment_type,
            read_only: self.read_only,
            extensible_virtual_disk_type: self.evd_type.clone(),
        }
    }
}

/// Occupancy of the controller/LUN grid.
pub(crate) struct ScsiGrid {
    controller_count: u8,
    cells: Vec<Vec<Option<MountRecord>>>,
}

impl ScsiGrid {
    fn new(controller_count: u8) -> Self {
        let controller_count = controller_count.min(MAX_SCSI_CONTROLLERS);
        let cells = (0..controller_count)
            .map(|_| (0..LUNS_PER_CONTROLLER).map(|_| None).collect())
            .collect();
        Self {
            controller_count,
            cells,
        }
    }

    fn records(&self) -> impl Iterator<Item = &MountRecord> {
        self.cells.iter().flatten().flatten()
    }

    fn find(&self, host_path: &Path) -> Option<&MountRecord> {
        self.records().find(|r| r.host_path == host_path)
    }

    fn find_mut(&mut self, host_path: &Path) -> Option<&mut MountRecord> {
        self.cells
            .iter_mut()
            .flatten()
            .flatten()
            .find(|r| r.host_path == host_path)
    }

    fn get(&self, controller: u8, lun: u8) -> Option<&MountRecord> {
        self.cells
            .get(usize::from(controller))?
            .get(usize::from(lun))?
            .as_ref()
    }

    fn get_mut(&mut self, controller: u8, lun: u8) -> Option<&mut MountRecord> {
        self.cells
            .get_mut(usize::from(controller))?
            .get_mut(usize::from(lun))?
            .as_mut()
    }

    fn cell_mut(&mut self, controller: u8, lun: u8) -> Result<&mut Option<MountRecord>> {
        let controllers = self.controller_count;
        self.cells
            .get_mut(usize::from(controller))
            .and_then(|luns| luns.get_mut(usize::from(lun)))
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "controller {controller} lun {lun} is outside the {controllers} configured controller(s)"
                ))
            })
    }

    /// Lowest free location, controllers first.
    fn free_location(&self) -> Option<(u8, u8)> {
        self.cells.iter().zip(0u8..).find_map(|(luns, controller)| {
            luns.iter()
                .zip(0u8..)
                .find_map(|(cell, lun)| cell.is_none().then_some((controller, lun)))
        })
    }

    /// Clears the cell only if it still holds the attach identified by
    /// `attach_id`.
    fn release_location(&mut self, controller: u8, lun: u8, attach_id: u64) -> bool {
        match self.cell_mut(controller, lun) {
            Ok(cell) if cell.as_ref().is_some_and(|r| r.attach_id == attach_id) => {
                *cell = None;
                true
            }
            _ => false,
        }
    }

    fn drain(&mut self) -> Vec<MountRecord> {
        self.cells
            .iter_mut()
            .flatten()
            .filter_map(Option::take)
            .collect()
    }
}

/// A disk attached to the guest host.
///
/// The handle is a snapshot: [`ref_count`](ScsiMount::ref_count) is the
/// count at the time the handle was produced.
#[derive(Debug, Clone)]
pub struct ScsiMount {
    manager: Weak<ScsiInner>,
    host_path: PathBuf,
    guest_path: Option<String>,
    controller: u8,
    lun: u8,
    attachment_type: AttachmentType,
    read_only: bool,
    ref_count: u32,
    attach_id: u64,
}

impl ScsiMount {
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    pub fn guest_path(&self) -> Option<&str> {
        self.guest_path.as_deref()
    }

    pub fn controller(&self) -> u8 {
        self.controller
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    pub fn attachment_type(&self) -> AttachmentType {
        self.attachment_type
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Drops this reference through the owning manager.
    pub async fn release(&self) -> Result<()> {
        let inner = self.manager.upgrade().ok_or(Error::InvalidManagerState)?;
        ScsiManager { inner }.remove(self).await
    }

    fn belongs_to(&self, inner: &Arc<ScsiInner>) -> bool {
        std::ptr::eq(self.manager.as_ptr(), Arc::as_ptr(inner))
    }
}

/// Serializable description of a mount, used for templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedScsiMount {
    pub version: u32,
    pub host_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_path: Option<String>,
    pub controller: u8,
    pub lun: u8,
    pub attachment_type: AttachmentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evd_type: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

struct ScsiInner {
    core: Manager<ScsiGrid>,
    controller_count: u8,
    access: Arc<dyn AccessGranter>,
    verity: Option<Arc<dyn VerityReader>>,
}

impl std::fmt::Debug for ScsiInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScsiInner")
            .field("controller_count", &self.controller_count)
            .finish_non_exhaustive()
    }
}

impl ScsiInner {
    async fn deallocate(&self, controller: u8, lun: u8, attach_id: u64) {
        let mut state = self.core.write_any().await;
        if state.index.release_location(controller, lun, attach_id) {
            tracing::debug!(controller, lun, "released scsi location");
        }
    }

    async fn verity_info(&self, host_path: &Path) -> Option<VerityInfo> {
        let reader = self.verity.as_ref()?;
        match reader.read_verity_info(host_path).await {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!(
                    host_path = %host_path.display(),
                    error = %e,
                    "no verity info for disk"
                );
                None
            }
        }
    }
}

/// Removes a partially prepared clone disk, and its directory when the clone
/// created it.
async fn discard_clone_copy(destination: &Path, created_dir: Option<&Path>) {
    match tokio::fs::remove_file(destination).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            path = %destination.display(),
            error = %e,
            "failed to remove cloned disk"
        ),
    }
    if let Some(dir) = created_dir {
        if let Err(e) = tokio::fs::remove_dir(dir).await {
            tracing::warn!(path = %dir.display(), error = %e, "failed to remove clone directory");
        }
    }
}

/// Resolves the gate with `Cancelled` and frees the location if the attach
/// future is dropped before it completes.
struct PendingAttach {
    inner: Arc<ScsiInner>,
    controller: u8,
    lun: u8,
    attach_id: u64,
    sender: Option<GateSender>,
}

impl PendingAttach {
    fn complete(mut self, result: GateResult) {
        if let Some(sender) = self.sender.take() {
            sender.resolve(result);
        }
    }
}

impl Drop for PendingAttach {
    fn drop(&mut self) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        sender.resolve(Err(Arc::new(Error::Cancelled)));
        let inner = Arc::clone(&self.inner);
        let (controller, lun, attach_id) = (self.controller, self.lun, self.attach_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    inner.deallocate(controller, lun, attach_id).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    controller,
                    lun,
                    "attach cancelled outside a runtime; location leaked"
                );
            }
        }
    }
}

/// Gives back a waiter's reference if it stops waiting before the attach
/// it joined completes.
struct PendingWaiter {
    inner: Option<Arc<ScsiInner>>,
    host_path: PathBuf,
    controller: u8,
    lun: u8,
    attach_id: u64,
}

impl PendingWaiter {
    fn disarm(mut self) {
        self.inner = None;
    }
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let host_path = std::mem::take(&mut self.host_path);
        let (controller, lun, attach_id) = (self.controller, self.lun, self.attach_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let manager = ScsiManager { inner };
                    if let Err(e) = manager
                        .release_reference(&host_path, controller, lun, attach_id)
                        .await
                    {
                        tracing::debug!(
                            host_path = %host_path.display(),
                            controller,
                            lun,
                            error = %e,
                            "cancelled waiter had no reference to return"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    controller,
                    lun,
                    "attach wait cancelled outside a runtime; reference leaked"
                );
            }
        }
    }
}

enum Reservation {
    Existing {
        mount: ScsiMount,
        gate: Gate,
        waiter: PendingWaiter,
    },
    New { mount: ScsiMount, pending: PendingAttach },
}

/// Manages the SCSI attachments of one guest host.
#[derive(Clone)]
pub struct ScsiManager {
    inner: Arc<ScsiInner>,
}

impl std::fmt::Debug for ScsiManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.inner, f)
    }
}

impl ScsiManager {
    pub fn new(
        host: Arc<dyn Host>,
        controller_count: u8,
        access: Arc<dyn AccessGranter>,
        verity: Option<Arc<dyn VerityReader>>,
    ) -> Self {
        let controller_count = controller_count.min(MAX_SCSI_CONTROLLERS);
        Self {
            inner: Arc::new(ScsiInner {
                core: Manager::new(host, ScsiGrid::new(controller_count)),
                controller_count,
                access,
                verity,
            }),
        }
    }

    pub fn controller_count(&self) -> u8 {
        self.inner.controller_count
    }

    /// Attaches a disk, or takes another reference to it if the host path is
    /// already attached.
    pub async fn add(&self, attach: ScsiAttach) -> Result<ScsiMount> {
        let host = self.inner.core.host().await?;
        if self.inner.controller_count == 0 {
            return Err(Error::NotSupported(
                "guest host has no SCSI controllers".to_string(),
            ));
        }
        if attach.attachment_type == AttachmentType::ExtensibleVirtualDisk
            && attach.guest_path.is_none()
        {
            return Err(Error::InvalidConfig(
                "extensible virtual disks require a guest path".to_string(),
            ));
        }

        if attach.attachment_type.requires_access_grant() && attach.access != VmAccess::NoOp {
            self.inner
                .access
                .grant(host.id(), &attach.host_path, attach.access)
                .await?;
        }

        match self.reserve(&attach).await? {
            Reservation::Existing {
                mount,
                mut gate,
                waiter,
            } => {
                let attached = gate.wait().await;
                waiter.disarm();
                attached.map_err(|source| Error::Attach {
                    host_path: mount.host_path.clone(),
                    controller: mount.controller,
                    lun: mount.lun,
                    source,
                })?;
                Ok(mount)
            }
            Reservation::New { mount, pending } => {
                let request = self.attach_request(host.os(), &attach, &mount).await;
                match host.modify(request).await {
                    Ok(()) => {
                        pending.complete(Ok(()));
                        tracing::debug!(
                            uvm_id = host.id(),
                            host_path = %mount.host_path.display(),
                            controller = mount.controller,
                            lun = mount.lun,
                            "attached scsi disk"
                        );
                        Ok(mount)
                    }
                    Err(e) => {
                        let source = Arc::new(e);
                        self.inner
                            .deallocate(mount.controller, mount.lun, mount.attach_id)
                            .await;
                        pending.complete(Err(Arc::clone(&source)));
                        Err(Error::Attach {
                            host_path: mount.host_path,
                            controller: mount.controller,
                            lun: mount.lun,
                            source,
                        })
                    }
                }
            }
        }
    }

    async fn reserve(&self, attach: &ScsiAttach) -> Result<Reservation> {
        let mut state = self.inner.core.write().await?;
        if let Some(record) = state.index.find_mut(&attach.host_path) {
            record.ref_count.acquire();
            return Ok(Reservation::Existing {
                mount: record.handle(&self.inner),
                gate: record.gate.clone(),
                waiter: PendingWaiter {
                    inner: Some(Arc::clone(&self.inner)),
                    host_path: record.host_path.clone(),
                    controller: record.controller,
                    lun: record.lun,
                    attach_id: record.attach_id,
                },
            });
        }

        let (controller, lun) = state
            .index
            .free_location()
            .ok_or(Error::TooManyAttachments {
                controllers: self.inner.controller_count,
            })?;
        let attach_id = state.next_id();
        let (sender, gate) = gate();
        let record = MountRecord {
            host_path: attach.host_path.clone(),
            guest_path: attach.guest_path.clone(),
            controller,
            lun,
            attachment_type: attach.attachment_type,
            evd_type: attach.evd_type.clone(),
            read_only: attach.read_only,
            encrypted: attach.encrypted,
            options: attach.options.clone(),
            ref_count: RefCount::ONE,
            gate,
            attach_id,
        };
        let mount = record.handle(&self.inner);
        *state.index.cell_mut(controller, lun)? = Some(record);

        Ok(Reservation::New {
            mount,
            pending: PendingAttach {
                inner: Arc::clone(&self.inner),
                controller,
                lun,
                attach_id,
                sender: Some(sender),
            },
        })
    }

    async fn attach_request(
        &self,
        os: GuestOs,
        attach: &ScsiAttach,
        mount: &ScsiMount,
    ) -> ModifyRequest {
        let request = ModifyRequest::new(
            ResourcePath::ScsiAttachment {
                controller: mount.controller,
                lun: mount.lun,
            },
            RequestType::Add,
        )
        .with_settings(Attachment {
            path: attach.host_path.clone(),
            attachment_type: attach.attachment_type,
            read_only: attach.read_only,
            extensible_virtual_disk_type: attach.evd_type.clone(),
        });

        let Some(guest_path) = attach.guest_path.as_ref() else {
            return request;
        };
        let guest_request = match os {
            GuestOs::Windows => GuestRequest::new(
                RequestType::Add,
                WindowsMappedVirtualDisk {
                    container_path: guest_path.clone(),
                    lun: mount.lun,
                },
            ),
            GuestOs::Linux => GuestRequest::new(
                RequestType::Add,
                LinuxMappedVirtualDisk {
                    mount_path: guest_path.clone(),
                    controller: mount.controller,
                    lun: mount.lun,
                    read_only: attach.read_only,
                    encrypted: attach.encrypted,
                    options: attach.options.clone(),
                    verity: self.inner.verity_info(&attach.host_path).await,
                },
            ),
        };
        request.with_guest_request(guest_request)
    }

    async fn detach_request(&self, os: GuestOs, record: &SavedScsiMount) -> ModifyRequest {
        let request = ModifyRequest::new(
            ResourcePath::ScsiAttachment {
                controller: record.controller,
                lun: record.lun,
            },
            RequestType::Remove,
        );
        let guest_request = match (os, record.guest_path.as_ref()) {
            (GuestOs::Windows, Some(guest_path)) => Some(GuestRequest::new(
                RequestType::Remove,
                WindowsMappedVirtualDisk {
                    container_path: guest_path.clone(),
                    lun: record.lun,
                },
            )),
            (GuestOs::Windows, None) => None,
            (GuestOs::Linux, guest_path) => Some(GuestRequest::new(
                RequestType::Remove,
                LinuxMappedVirtualDisk {
                    mount_path: guest_path.cloned().unwrap_or_default(),
                    controller: record.controller,
                    lun: record.lun,
                    read_only: record.read_only,
                    encrypted: record.encrypted,
                    options: record.options.clone(),
                    verity: self.inner.verity_info(&record.host_path).await,
                },
            )),
        };
        match guest_request {
            Some(guest_request) => request.with_guest_request(guest_request),
            None => request,
        }
    }

    /// Records the disk the guest host was created with at controller 0,
    /// LUN 0. No modify request is sent.
    pub async fn set_root_mount(
        &self,
        host_path: impl Into<PathBuf>,
        guest_path: Option<String>,
        read_only: bool,
    ) -> Result<ScsiMount> {
        let host_path = host_path.into();
        let mut state = self.inner.core.write().await?;
        if self.inner.controller_count == 0 {
            return Err(Error::NotSupported(
                "guest host has no SCSI controllers".to_string(),
            ));
        }
        if let Some(existing) = state.index.get(0, 0) {
            return Err(Error::AlreadyAttached(format!(
                "{} occupies controller 0 lun 0",
                existing.host_path.display()
            )));
        }

        let attach_id = state.next_id();
        let (sender, gate) = gate();
        sender.resolve(Ok(()));
        let record = MountRecord {
            host_path,
            guest_path,
            controller: 0,
            lun: 0,
            attachment_type: AttachmentType::VirtualDisk,
            evd_type: None,
            read_only,
            encrypted: false,
            options: Vec::new(),
            ref_count: RefCount::ONE,
            gate,
            attach_id,
        };
        let mount = record.handle(&self.inner);
        *state.index.cell_mut(0, 0)? = Some(record);
        Ok(mount)
    }

    /// Drops one reference to `mount`, detaching it when it was the last.
    pub async fn remove(&self, mount: &ScsiMount) -> Result<()> {
        if !mount.belongs_to(&self.inner) {
            return Err(Error::InvalidResourceState);
        }
        self.release_reference(&mount.host_path, mount.controller, mount.lun, mount.attach_id)
            .await
    }

    async fn release_reference(
        &self,
        host_path: &Path,
        controller: u8,
        lun: u8,
        attach_id: u64,
    ) -> Result<()> {
        let mut state = self.inner.core.write().await?;
        let host = Arc::clone(state.host()?);

        let record = state
            .index
            .get_mut(controller, lun)
            .filter(|r| r.attach_id == attach_id)
            .ok_or_else(|| Error::NotAttached(host_path.display().to_string()))?;
        match record.ref_count.release() {
            Release::Retained(remaining) => {
                record.ref_count = remaining;
                return Ok(());
            }
            Release::Last => {}
        }
        let saved = record.saved();

        let request = self.detach_request(host.os(), &saved).await;
        host.modify(request).await?;
        state
            .index
            .release_location(saved.controller, saved.lun, attach_id);
        tracing::debug!(
            uvm_id = host.id(),
            host_path = %saved.host_path.display(),
            controller = saved.controller,
            lun = saved.lun,
            "detached scsi disk"
        );
        Ok(())
    }

    pub async fn find(&self, host_path: impl AsRef<Path>) -> Result<ScsiMount> {
        let host_path = host_path.as_ref();
        let state = self.inner.core.read().await?;
        state
            .index
            .find(host_path)
            .map(|r| r.handle(&self.inner))
            .ok_or_else(|| Error::NotAttached(host_path.display().to_string()))
    }

    /// Guest path of the disk attached from `host_path`, if it was mounted.
    pub async fn guest_path(&self, host_path: impl AsRef<Path>) -> Result<Option<String>> {
        Ok(self.find(host_path).await?.guest_path)
    }

    pub async fn list(&self) -> Result<Vec<ScsiMount>> {
        let state = self.inner.core.read().await?;
        Ok(state.index.records().map(|r| r.handle(&self.inner)).collect())
    }

    pub async fn saved_state(&self) -> Result<Vec<SavedScsiMount>> {
        let state = self.inner.core.read().await?;
        Ok(state.index.records().map(MountRecord::saved).collect())
    }

    /// Recreates `saved` in a clone's creation document.
    ///
    /// Read-only disks are shared with the template. Writable disks are
    /// copied into the clone's scratch directory and granted to the clone.
    pub async fn clone_from(
        &self,
        saved: &SavedScsiMount,
        data: &mut CloneData,
    ) -> Result<ScsiMount> {
        if saved.version != SCSI_MOUNT_VERSION {
            return Err(Error::UnsupportedVersion {
                kind: "scsi mount",
                found: saved.version,
                supported: SCSI_MOUNT_VERSION,
            });
        }
        {
            let state = self.inner.core.read().await?;
            ensure_vacant(&state, saved.controller, saved.lun)?;
        }

        let host_path = if saved.read_only {
            saved.host_path.clone()
        } else {
            self.copy_for_clone(saved, data).await?
        };

        let mut state = self.inner.core.write().await?;
        ensure_vacant(&state, saved.controller, saved.lun)?;
        let attach_id = state.next_id();
        let (sender, gate) = gate();
        sender.resolve(Ok(()));
        let record = MountRecord {
            host_path,
            guest_path: saved.guest_path.clone(),
            controller: saved.controller,
            lun: saved.lun,
            attachment_type: saved.attachment_type,
            evd_type: saved.evd_type.clone(),
            read_only: saved.read_only,
            encrypted: saved.encrypted,
            options: saved.options.clone(),
            ref_count: RefCount::ONE,
            gate,
            attach_id,
        };
        data.document
            .set_scsi_attachment(saved.controller, saved.lun, record.attachment());
        let mount = record.handle(&self.inner);
        *state.index.cell_mut(saved.controller, saved.lun)? = Some(record);
        Ok(mount)
    }

    async fn copy_for_clone(&self, saved: &SavedScsiMount, data: &CloneData) -> Result<PathBuf> {
        let dir = if (saved.controller, saved.lun) == (0, 0) {
            data.scratch_dir.clone()
        } else {
            data.scratch_dir
                .join(format!("clone-mount-{}-{}", saved.controller, saved.lun))
        };
        let file_name = saved.host_path.file_name().ok_or_else(|| {
            Error::InvalidConfig(format!(
                "cannot clone {}: no file name",
                saved.host_path.display()
            ))
        })?;
        let destination = dir.join(file_name);

        let created_dir = !tokio::fs::try_exists(&dir).await?;
        tokio::fs::create_dir_all(&dir).await?;
        let copied = match tokio::fs::copy(&saved.host_path, &destination).await {
            Ok(_) => {
                self.inner
                    .access
                    .grant(&data.target_id, &destination, VmAccess::Individual)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = copied {
            discard_clone_copy(&destination, created_dir.then_some(dir.as_path())).await;
            return Err(e);
        }
        tracing::debug!(
            source = %saved.host_path.display(),
            destination = %destination.display(),
            "copied writable disk for clone"
        );
        Ok(destination)
    }

    /// Detaches every disk regardless of reference count and closes the
    /// manager.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.core.write_any().await;
        let Some(host) = state.take_host() else {
            return Ok(());
        };
        for record in state.index.drain() {
            let saved = record.saved();
            let request = self.detach_request(host.os(), &saved).await;
            if let Err(e) = host.modify(request).await {
                tracing::warn!(
                    uvm_id = host.id(),
                    host_path = %saved.host_path.display(),
                    controller = saved.controller,
                    lun = saved.lun,
                    error = %e,
                    "failed to detach scsi disk during close"
                );
            }
        }
        Ok(())
    }

    /// Closes the manager without detaching anything. Used once the guest
    /// host is gone and its devices went with it.
    pub(crate) async fn invalidate(&self) {
        let mut state = self.inner.core.write_any().await;
        state.take_host();
        state.index.drain();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.core.is_closed().await
    }
}

fn ensure_vacant(state: &ManagerState<ScsiGrid>, controller: u8, lun: u8) -> Result<()> {
    if controller >= state.index.controller_count || lun >= LUNS_PER_CONTROLLER {
        return Err(Error::InvalidConfig(format!(
            "controller {controller} lun {lun} is outside the {} configured controller(s)",
            state.index.controller_count
        )));
    }
    match state.index.get(controller, lun) {
        Some(existing) => Err(Error::AlreadyAttached(format!(
            "{} occupies controller {controller} lun {lun}",
            existing.host_path.display()
        ))),
        None => Ok(()),
    }
}
