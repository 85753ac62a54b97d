//! Guest host lifecycle.
//!
//! A [`GuestHost`] owns one manager per resource kind and drives the
//! [`ComputeSystem`] backing the guest through its lifecycle:
//!
//! ```text
//! Created -> Starting -> Running <-> Pausing/Paused/Resuming -> Closing -> Closed
//! ```
//!
//! An exit the host did not ask for moves the guest host to `Terminated`
//! from any state short of `Closing`. A terminated guest host still has to
//! be closed to release the system handle.

mod builder;
mod output;

pub use builder::GuestHostBuilder;

use crate::config::GuestHostConfig;
use crate::plan9::Plan9Manager;
use crate::scsi::ScsiManager;
use crate::vsmb::VsmbManager;
use builder::HostContext;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uvm_core::{
    AccessGranter, ComputeSystem, Error, GuestCapabilities, GuestConnection, GuestConnector,
    GuestOs, GuestRequest, Host, HostSocketAddress, RequestType, Result, VerityReader,
};

const STATE_CREATED: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_PAUSING: u8 = 3;
const STATE_PAUSED: u8 = 4;
const STATE_RESUMING: u8 = 5;
const STATE_CLOSING: u8 = 6;
const STATE_CLOSED: u8 = 7;
const STATE_TERMINATED: u8 = 8;

/// How long the log relay may keep flushing once the guest host is closing.
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Current lifecycle state of a guest host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestHostState {
    Created,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Closing,
    Closed,
    /// The system exited without being asked to by [`GuestHost::close`].
    Terminated,
}

impl GuestHostState {
    fn from_atomic(val: u8) -> Self {
        match val {
            STATE_CREATED => GuestHostState::Created,
            STATE_STARTING => GuestHostState::Starting,
            STATE_RUNNING => GuestHostState::Running,
            STATE_PAUSING => GuestHostState::Pausing,
            STATE_PAUSED => GuestHostState::Paused,
            STATE_RESUMING => GuestHostState::Resuming,
            STATE_CLOSING => GuestHostState::Closing,
            STATE_CLOSED => GuestHostState::Closed,
            _ => GuestHostState::Terminated,
        }
    }
}

impl fmt::Display for GuestHostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

type ExitStatus = std::result::Result<(), Arc<Error>>;

/// State shared with the background exit watcher and log relay.
struct Lifecycle {
    id: String,
    state: AtomicU8,
    exit: watch::Sender<Option<ExitStatus>>,
    output_drained: watch::Sender<bool>,
}

impl Lifecycle {
    fn state(&self) -> GuestHostState {
        GuestHostState::from_atomic(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, operation: &'static str, from: u8, to: u8) -> Result<()> {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| Error::InvalidState {
                operation,
                state: GuestHostState::from_atomic(actual).to_string(),
            })
    }

    /// Completes a transition started by [`Lifecycle::transition`] unless
    /// something else (an exit, a close) moved the state in the meantime.
    fn settle(&self, from: u8, to: u8) {
        let _ = self
            .state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn record_exit(&self, status: ExitStatus) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| match state {
                STATE_CLOSING | STATE_CLOSED | STATE_TERMINATED => None,
                _ => Some(STATE_TERMINATED),
            });
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(status);
                true
            } else {
                false
            }
        });
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn mark_drained(&self) {
        self.output_drained.send_replace(true);
    }
}

/// Marks guest output drained when the relay task ends, including on abort.
struct DrainedOnDrop(Arc<Lifecycle>);

impl Drop for DrainedOnDrop {
    fn drop(&mut self) {
        self.0.mark_drained();
    }
}

#[derive(Default)]
struct Listeners {
    entropy: Option<UnixListener>,
    log: Option<UnixListener>,
}

/// Protocol details negotiated with the guest agent.
#[derive(Debug, Clone)]
struct GuestInfo {
    protocol_version: u32,
    capabilities: GuestCapabilities,
}

type ListenerTask = Result<Option<JoinHandle<()>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A lightweight utility VM and the resources attached to it.
pub struct GuestHost {
    config: GuestHostConfig,
    lifecycle: Arc<Lifecycle>,
    system: Arc<dyn ComputeSystem>,
    scsi: ScsiManager,
    vsmb: VsmbManager,
    plan9: Plan9Manager,
    connector: Option<Arc<dyn GuestConnector>>,
    connection: Mutex<Option<Arc<dyn GuestConnection>>>,
    guest_info: Mutex<Option<GuestInfo>>,
    listeners: Mutex<Listeners>,
    relay: Mutex<Option<JoinHandle<()>>>,
    exit_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for GuestHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestHost")
            .field("id", &self.config.id)
            .field("os", &self.config.os)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl GuestHost {
    pub fn builder(config: GuestHostConfig, system: Arc<dyn ComputeSystem>) -> GuestHostBuilder {
        GuestHostBuilder::new(config, system)
    }

    fn new(
        config: GuestHostConfig,
        system: Arc<dyn ComputeSystem>,
        connector: Option<Arc<dyn GuestConnector>>,
        entropy: Option<UnixListener>,
        log: Option<UnixListener>,
        access: Arc<dyn AccessGranter>,
        verity: Option<Arc<dyn VerityReader>>,
    ) -> Self {
        let host: Arc<dyn Host> = Arc::new(HostContext::new(&config, Arc::clone(&system)));
        let scsi = ScsiManager::new(
            Arc::clone(&host),
            config.scsi_controller_count,
            access,
            verity,
        );
        let vsmb = VsmbManager::new(Arc::clone(&host), config.vsmb_no_direct_map);
        let plan9 = Plan9Manager::new(host);
        let lifecycle = Arc::new(Lifecycle {
            id: config.id.clone(),
            state: AtomicU8::new(STATE_CREATED),
            exit: watch::channel(None).0,
            output_drained: watch::channel(log.is_none()).0,
        });

        Self {
            config,
            lifecycle,
            system,
            scsi,
            vsmb,
            plan9,
            connector,
            connection: Mutex::new(None),
            guest_info: Mutex::new(None),
            listeners: Mutex::new(Listeners { entropy, log }),
            relay: Mutex::new(None),
            exit_watcher: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn os(&self) -> GuestOs {
        self.config.os
    }

    pub fn config(&self) -> &GuestHostConfig {
        &self.config
    }

    pub fn state(&self) -> GuestHostState {
        self.lifecycle.state()
    }

    pub fn scsi(&self) -> &ScsiManager {
        &self.scsi
    }

    pub fn vsmb(&self) -> &VsmbManager {
        &self.vsmb
    }

    pub fn plan9(&self) -> &Plan9Manager {
        &self.plan9
    }

    /// Protocol version negotiated with the guest agent, once connected.
    pub fn protocol_version(&self) -> Option<u32> {
        lock(&self.guest_info).as_ref().map(|info| info.protocol_version)
    }

    pub fn guest_capabilities(&self) -> Option<GuestCapabilities> {
        lock(&self.guest_info)
            .as_ref()
            .map(|info| info.capabilities.clone())
    }

    /// Powers on the guest host.
    ///
    /// If anything fails after the system is powered on, the system is
    /// terminated before the error is returned.
    pub async fn start(&self) -> Result<()> {
        self.lifecycle
            .transition("start", STATE_CREATED, STATE_STARTING)?;
        tracing::info!(uvm_id = %self.config.id, os = ?self.config.os, "starting guest host");

        let mut powered_on = false;
        match self.start_inner(&mut powered_on).await {
            Ok(()) => {
                self.lifecycle.settle(STATE_STARTING, STATE_RUNNING);
                tracing::info!(uvm_id = %self.config.id, "guest host running");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(uvm_id = %self.config.id, error = %e, "guest host failed to start");
                if powered_on {
                    self.abort_start().await;
                } else {
                    self.lifecycle
                        .record_exit(Err(Arc::new(Error::StartFailed(e.to_string()))));
                }
                self.lifecycle.settle(STATE_STARTING, STATE_TERMINATED);
                if lock(&self.relay).is_none() {
                    self.lifecycle.mark_drained();
                }
                Err(e)
            }
        }
    }

    async fn start_inner(&self, powered_on: &mut bool) -> Result<()> {
        let listeners = self.spawn_listeners();

        self.system.start().await?;
        *powered_on = true;
        self.spawn_exit_watcher();

        self.join_listeners(listeners).await?;

        if let Some(connector) = &self.connector {
            let connection: Arc<dyn GuestConnection> = Arc::from(connector.connect().await?);
            tracing::debug!(
                uvm_id = %self.config.id,
                protocol_version = connection.protocol_version(),
                "connected to guest"
            );
            *lock(&self.guest_info) = Some(GuestInfo {
                protocol_version: connection.protocol_version(),
                capabilities: connection.capabilities().clone(),
            });
            *lock(&self.connection) = Some(Arc::clone(&connection));

            if self.config.os == GuestOs::Windows {
                let address = HostSocketAddress {
                    local_address: self.config.id.clone(),
                    parent_address: self.system.id().to_string(),
                };
                connection
                    .modify(GuestRequest::new(RequestType::Update, address))
                    .await?;
            }
        }
        Ok(())
    }

    fn spawn_listeners(&self) -> JoinSet<ListenerTask> {
        let mut tasks = JoinSet::new();
        let mut listeners = lock(&self.listeners);

        if let Some(listener) = listeners.entropy.take() {
            tasks.spawn(async move { output::serve_entropy(listener).await.map(|()| None) });
        }
        if let Some(listener) = listeners.log.take() {
            let lifecycle = Arc::clone(&self.lifecycle);
            tasks.spawn(async move {
                let stream = output::accept_log(listener).await?;
                Ok(Some(tokio::spawn(relay_output(lifecycle, stream))))
            });
        }
        tasks
    }

    async fn join_listeners(&self, mut tasks: JoinSet<ListenerTask>) -> Result<()> {
        let limit = self.config.start_timeout;
        let joined = tokio::time::timeout(limit, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(Some(relay))) => *lock(&self.relay) = Some(relay),
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => {
                        return Err(Error::StartFailed(format!("guest listener task failed: {e}")));
                    }
                }
            }
            Ok(())
        })
        .await;

        let result = joined.unwrap_or_else(|_| {
            Err(Error::Timeout(format!(
                "guest did not connect to its listeners within {limit:?}"
            )))
        });
        if result.is_err() {
            tasks.shutdown().await;
        }
        result
    }

    fn spawn_exit_watcher(&self) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let system = Arc::clone(&self.system);
        let watcher = tokio::spawn(async move {
            let status = system.wait().await.map_err(Arc::new);
            match &status {
                Ok(()) => tracing::info!(uvm_id = %lifecycle.id, "guest host exited"),
                Err(e) => {
                    tracing::warn!(
                        uvm_id = %lifecycle.id,
                        error = %e,
                        "guest host exited with error"
                    )
                }
            }
            lifecycle.record_exit(status);
        });
        *lock(&self.exit_watcher) = Some(watcher);
    }

    /// Tears down a partially started guest host. The terminate runs in its
    /// own task so a caller dropping this future cannot skip it.
    async fn abort_start(&self) {
        let system = Arc::clone(&self.system);
        let id = self.config.id.clone();
        let cleanup = tokio::spawn(async move {
            if let Err(e) = system.terminate().await {
                tracing::warn!(
                    uvm_id = %id,
                    error = %e,
                    "failed to terminate partially started guest host"
                );
            }
        });
        let _ = cleanup.await;

        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                tracing::debug!(
                    uvm_id = %self.config.id,
                    error = %e,
                    "failed to close guest connection"
                );
            }
        }
    }

    pub async fn pause(&self) -> Result<()> {
        self.lifecycle
            .transition("pause", STATE_RUNNING, STATE_PAUSING)?;
        match self.system.pause().await {
            Ok(()) => {
                self.lifecycle.settle(STATE_PAUSING, STATE_PAUSED);
                tracing::debug!(uvm_id = %self.config.id, "guest host paused");
                Ok(())
            }
            Err(e) => {
                self.lifecycle.settle(STATE_PAUSING, STATE_RUNNING);
                Err(e)
            }
        }
    }

    pub async fn resume(&self) -> Result<()> {
        self.lifecycle
            .transition("resume", STATE_PAUSED, STATE_RESUMING)?;
        match self.system.resume().await {
            Ok(()) => {
                self.lifecycle.settle(STATE_RESUMING, STATE_RUNNING);
                tracing::debug!(uvm_id = %self.config.id, "guest host resumed");
                Ok(())
            }
            Err(e) => {
                self.lifecycle.settle(STATE_RESUMING, STATE_PAUSED);
                Err(e)
            }
        }
    }

    /// Asks the guest to shut down. Does not wait for it to exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.ensure_open("shutdown")?;
        self.request_shutdown().await
    }

    async fn request_shutdown(&self) -> Result<()> {
        let connection = lock(&self.connection).clone();
        match connection {
            Some(connection) => connection.shutdown(&self.config.id).await,
            None => self.system.shutdown().await,
        }
    }

    /// Forcefully stops the guest. Does not wait for it to exit.
    pub async fn terminate(&self) -> Result<()> {
        self.ensure_open("terminate")?;
        self.system.terminate().await
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        match self.state() {
            state @ (GuestHostState::Closing | GuestHostState::Closed) => {
                Err(Error::InvalidState {
                    operation,
                    state: state.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Waits for the system to exit and for the guest's output to drain.
    pub async fn wait(&self) -> Result<()> {
        let state = self.state();
        if state == GuestHostState::Created {
            return Err(Error::InvalidState {
                operation: "wait",
                state: state.to_string(),
            });
        }

        let mut exit = self.lifecycle.exit.subscribe();
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Cancelled)?
            .clone();

        let mut drained = self.lifecycle.output_drained.subscribe();
        let _ = drained.wait_for(|drained| *drained).await;

        match status {
            Some(Err(source)) => Err(Error::ExitedWithError {
                id: self.config.id.clone(),
                source,
            }),
            _ => Ok(()),
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.close_with_cancellation(&CancellationToken::new()).await
    }

    /// Stops the guest according to the shutdown policy, then releases
    /// everything the guest host holds.
    ///
    /// Teardown runs even when stopping fails; the first error is returned.
    /// Closing an already closed guest host is a no-op.
    pub async fn close_with_cancellation(&self, cancel: &CancellationToken) -> Result<()> {
        let previous = match self
            .lifecycle
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| match state {
                STATE_CLOSING | STATE_CLOSED => None,
                _ => Some(STATE_CLOSING),
            }) {
            Ok(previous) => previous,
            Err(STATE_CLOSED) => return Ok(()),
            Err(actual) => {
                return Err(Error::InvalidState {
                    operation: "close",
                    state: GuestHostState::from_atomic(actual).to_string(),
                });
            }
        };
        tracing::info!(uvm_id = %self.config.id, "closing guest host");

        let mut first_error = None;
        if previous != STATE_CREATED && !self.lifecycle.has_exited() {
            if let Err(e) = self.stop(cancel).await {
                first_error.get_or_insert(e);
            }
        }
        self.teardown(&mut first_error).await;

        self.lifecycle.state.store(STATE_CLOSED, Ordering::SeqCst);
        tracing::info!(uvm_id = %self.config.id, "guest host closed");
        first_error.map_or(Ok(()), Err)
    }

    async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let delivered = if self.config.shutdown.graceful {
            match self.request_shutdown().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::warn!(
                        uvm_id = %self.config.id,
                        error = %e,
                        "graceful shutdown failed, terminating"
                    );
                    self.system.terminate().await
                }
            }
        } else {
            self.system.terminate().await
        };

        if let Err(e) = delivered {
            tracing::warn!(uvm_id = %self.config.id, error = %e, "failed to stop guest host");
            return Err(e);
        }
        self.wait_for_exit(cancel).await
    }

    async fn wait_for_exit(&self, cancel: &CancellationToken) -> Result<()> {
        let mut exit = self.lifecycle.exit.subscribe();
        let exited = async move {
            let _ = exit.wait_for(Option::is_some).await;
        };

        let Some(limit) = self.config.shutdown.timeout else {
            return tokio::select! {
                _ = exited => Ok(()),
                _ = cancel.cancelled() => Err(Error::Cancelled),
            };
        };

        let outcome = tokio::select! {
            waited = tokio::time::timeout(limit, exited) => waited.map_err(|_| {
                Error::Timeout(format!("guest host did not exit within {limit:?}"))
            }),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        // Not bounded by `limit`.
        if let Err(Error::Timeout(_)) = &outcome {
            if let Err(e) = self.system.terminate().await {
                tracing::warn!(
                    uvm_id = %self.config.id,
                    error = %e,
                    "forced terminate after timeout failed"
                );
            }
        }
        outcome
    }

    async fn teardown(&self, first_error: &mut Option<Error>) {
        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                tracing::warn!(
                    uvm_id = %self.config.id,
                    error = %e,
                    "failed to close guest connection"
                );
                first_error.get_or_insert(e);
            }
        }

        *lock(&self.listeners) = Listeners::default();

        let relay = lock(&self.relay).take();
        if let Some(mut relay) = relay {
            if tokio::time::timeout(RELAY_DRAIN_TIMEOUT, &mut relay)
                .await
                .is_err()
            {
                tracing::debug!(
                    uvm_id = %self.config.id,
                    "guest output still open, aborting relay"
                );
                relay.abort();
            }
        }
        self.lifecycle.mark_drained();

        let watcher = lock(&self.exit_watcher).take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.lifecycle.record_exit(Ok(()));

        if let Err(e) = self.system.close().await {
            tracing::warn!(
                uvm_id = %self.config.id,
                error = %e,
                "failed to release compute system"
            );
            first_error.get_or_insert(e);
        }

        self.scsi.invalidate().await;
        self.vsmb.invalidate().await;
        self.plan9.invalidate().await;
    }
}

impl Drop for GuestHost {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.exit_watcher).take() {
            watcher.abort();
        }
        if let Some(relay) = lock(&self.relay).take() {
            relay.abort();
        }

        let state = self.lifecycle.state.load(Ordering::SeqCst);
        if matches!(state, STATE_CREATED | STATE_CLOSED) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                uvm_id = %self.config.id,
                "guest host dropped without close outside a runtime"
            );
            return;
        };
        let system = Arc::clone(&self.system);
        let exited = self.lifecycle.has_exited();
        runtime.spawn(async move {
            if !exited {
                let _ = system.terminate().await;
            }
            let _ = system.close().await;
        });
    }
}

async fn relay_output(lifecycle: Arc<Lifecycle>, stream: UnixStream) {
    let _drained = DrainedOnDrop(Arc::clone(&lifecycle));
    match output::relay_guest_output(&lifecycle.id, stream).await {
        Ok(lines) => tracing::debug!(uvm_id = %lifecycle.id, lines, "guest output closed"),
        Err(e) => tracing::warn!(uvm_id = %lifecycle.id, error = %e, "guest output relay failed"),
    }
}
