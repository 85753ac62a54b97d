//! In-memory fakes for the capability traits.
//!
//! Each fake records the calls it receives and can be told to fail, so the
//! managers and the lifecycle can be exercised without a hypervisor.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uvm_core::{
    AccessGranter, ComputeSystem, Error, GuestCapabilities, GuestConnection, GuestConnector,
    GuestOs, GuestRequest, Host, ModifyRequest, RequestType, Result, VerityInfo, VerityReader,
    VmAccess,
};

/// A [`Host`] that records every modify request.
pub struct FakeHost {
    id: String,
    os: GuestOs,
    physically_backed: bool,
    disallow_writable: bool,
    delay: Option<Duration>,
    failure: Mutex<Option<String>>,
    fail_after: Mutex<Option<usize>>,
    requests: Mutex<Vec<ModifyRequest>>,
}

impl FakeHost {
    pub fn new(id: impl Into<String>, os: GuestOs) -> Self {
        Self {
            id: id.into(),
            os,
            physically_backed: false,
            disallow_writable: false,
            delay: None,
            failure: Mutex::new(None),
            fail_after: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn linux(id: impl Into<String>) -> Self {
        Self::new(id, GuestOs::Linux)
    }

    pub fn windows(id: impl Into<String>) -> Self {
        Self::new(id, GuestOs::Windows)
    }

    pub fn physically_backed(mut self) -> Self {
        self.physically_backed = true;
        self
    }

    pub fn disallow_writable_file_shares(mut self) -> Self {
        self.disallow_writable = true;
        self
    }

    /// Makes every modify call take `delay` before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every subsequent modify call fail with [`Error::Modify`].
    pub fn fail_modify(&self, message: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(message.into());
    }

    /// Lets `count` more modify calls succeed, then fails the rest.
    pub fn fail_modify_after(&self, count: usize, message: impl Into<String>) {
        *self.fail_after.lock().unwrap() = Some(count);
        *self.failure.lock().unwrap() = Some(message.into());
    }

    pub fn succeed_modify(&self) {
        *self.failure.lock().unwrap() = None;
        *self.fail_after.lock().unwrap() = None;
    }

    pub fn requests(&self) -> Vec<ModifyRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests_of(&self, request_type: RequestType) -> Vec<ModifyRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.request_type == request_type)
            .collect()
    }

    fn current_failure(&self) -> Option<String> {
        let mut fail_after = self.fail_after.lock().unwrap();
        if let Some(remaining) = fail_after.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return None;
            }
        }
        self.failure.lock().unwrap().clone()
    }
}

#[async_trait]
impl Host for FakeHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn os(&self) -> GuestOs {
        self.os
    }

    fn devices_physically_backed(&self) -> bool {
        self.physically_backed
    }

    fn disallow_writable_file_shares(&self) -> bool {
        self.disallow_writable
    }

    async fn modify(&self, request: ModifyRequest) -> Result<()> {
        self.requests.lock().unwrap().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.current_failure() {
            Some(message) => Err(Error::Modify(message)),
            None => Ok(()),
        }
    }
}

/// A [`ComputeSystem`] whose operations succeed unless told otherwise.
///
/// By default a delivered shutdown or terminate makes the system exit
/// cleanly; [`FakeSystem::hang_on_stop`] disables that.
pub struct FakeSystem {
    id: String,
    calls: Mutex<Vec<&'static str>>,
    failing: Mutex<HashSet<&'static str>>,
    modifies: Mutex<Vec<ModifyRequest>>,
    exit_on_stop: AtomicBool,
    closed: AtomicBool,
    exit: watch::Sender<Option<std::result::Result<(), String>>>,
}

impl FakeSystem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            modifies: Mutex::new(Vec::new()),
            exit_on_stop: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            exit: watch::channel(None).0,
        }
    }

    /// Makes the named operation (`"start"`, `"shutdown"`, ...) fail.
    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn hang_on_stop(&self) {
        self.exit_on_stop.store(false, Ordering::SeqCst);
    }

    /// Simulates the system exiting on its own.
    pub fn exit(&self, result: std::result::Result<(), String>) {
        self.exit.send_replace(Some(result));
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn was_called(&self, operation: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| *c == operation)
    }

    pub fn modifies(&self) -> Vec<ModifyRequest> {
        self.modifies.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, operation: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(operation);
        if self.failing.lock().unwrap().contains(operation) {
            return Err(Error::Modify(format!("{operation} failed")));
        }
        Ok(())
    }

    fn stopped(&self) {
        if self.exit_on_stop.load(Ordering::SeqCst) {
            self.exit.send_if_modified(|exit| {
                if exit.is_none() {
                    *exit = Some(Ok(()));
                    true
                } else {
                    false
                }
            });
        }
    }
}

#[async_trait]
impl ComputeSystem for FakeSystem {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<()> {
        self.record("start")
    }

    async fn pause(&self) -> Result<()> {
        self.record("pause")
    }

    async fn resume(&self) -> Result<()> {
        self.record("resume")
    }

    async fn shutdown(&self) -> Result<()> {
        self.record("shutdown")?;
        self.stopped();
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.record("terminate")?;
        self.stopped();
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let mut rx = self.exit.subscribe();
        let exit = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Cancelled)?
            .clone();
        match exit {
            Some(Err(message)) => Err(Error::Modify(message)),
            _ => Ok(()),
        }
    }

    async fn modify(&self, request: &ModifyRequest) -> Result<()> {
        self.record("modify")?;
        self.modifies.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.calls.lock().unwrap().push("close");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every grant; optionally refuses them.
#[derive(Default)]
pub struct FakeAccessGranter {
    grants: Mutex<Vec<(String, PathBuf, VmAccess)>>,
    fail: AtomicBool,
}

impl FakeAccessGranter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn grants(&self) -> Vec<(String, PathBuf, VmAccess)> {
        self.grants.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccessGranter for FakeAccessGranter {
    async fn grant(&self, vm_id: &str, path: &Path, access: VmAccess) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::OperationDenied(format!(
                "access to {} refused",
                path.display()
            )));
        }
        self.grants
            .lock()
            .unwrap()
            .push((vm_id.to_string(), path.to_path_buf(), access));
        Ok(())
    }
}

/// Returns the same verity metadata for every image, or fails every read.
pub struct FakeVerityReader {
    info: Option<VerityInfo>,
    fail: bool,
    reads: AtomicUsize,
}

impl FakeVerityReader {
    pub fn with_info(info: VerityInfo) -> Self {
        Self {
            info: Some(info),
            fail: false,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            info: None,
            fail: true,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VerityReader for FakeVerityReader {
    async fn read_verity_info(&self, path: &Path) -> Result<Option<VerityInfo>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("no verity superblock in {}", path.display()),
            )));
        }
        Ok(self.info.clone())
    }
}

/// State shared between a [`FakeGuestConnector`] and the connections it
/// hands out.
#[derive(Default)]
pub struct FakeGuestState {
    shutdowns: Mutex<Vec<String>>,
    requests: Mutex<Vec<GuestRequest>>,
    closed: AtomicBool,
    fail_shutdown: AtomicBool,
    system: Mutex<Option<Arc<FakeSystem>>>,
}

impl FakeGuestState {
    pub fn shutdowns(&self) -> Vec<String> {
        self.shutdowns.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<GuestRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_shutdown(&self) {
        self.fail_shutdown.store(true, Ordering::SeqCst);
    }
}

pub struct FakeGuestConnector {
    protocol_version: u32,
    capabilities: GuestCapabilities,
    fail: AtomicBool,
    state: Arc<FakeGuestState>,
}

impl FakeGuestConnector {
    pub fn new(protocol_version: u32) -> Self {
        Self {
            protocol_version,
            capabilities: GuestCapabilities::default(),
            fail: AtomicBool::new(false),
            state: Arc::new(FakeGuestState::default()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: GuestCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Makes a delivered guest shutdown stop `system`.
    pub fn stops(self, system: Arc<FakeSystem>) -> Self {
        *self.state.system.lock().unwrap() = Some(system);
        self
    }

    pub fn state(&self) -> Arc<FakeGuestState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl GuestConnector for FakeGuestConnector {
    async fn connect(&self) -> Result<Box<dyn GuestConnection>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::StartFailed("guest connection refused".to_string()));
        }
        Ok(Box::new(FakeGuestConnection {
            protocol_version: self.protocol_version,
            capabilities: self.capabilities.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct FakeGuestConnection {
    protocol_version: u32,
    capabilities: GuestCapabilities,
    state: Arc<FakeGuestState>,
}

#[async_trait]
impl GuestConnection for FakeGuestConnection {
    fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    fn capabilities(&self) -> &GuestCapabilities {
        &self.capabilities
    }

    async fn modify(&self, request: GuestRequest) -> Result<()> {
        self.state.requests.lock().unwrap().push(request);
        Ok(())
    }

    async fn shutdown(&self, id: &str) -> Result<()> {
        if self.state.fail_shutdown.load(Ordering::SeqCst) {
            return Err(Error::Modify("guest shutdown failed".to_string()));
        }
        self.state.shutdowns.lock().unwrap().push(id.to_string());
        if let Some(system) = self.state.system.lock().unwrap().as_ref() {
            system.stopped();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
